// SPDX-FileCopyrightText: 2025 Contributors to the framepace project.
// SPDX-License-Identifier: Apache-2.0

//! Checks on what the presenter reports through `tracing`.
//!
//! Kept in a separate binary: `#[traced_test]` installs its own global
//! subscriber, which conflicts with the shared setup of the other suites.

mod common;

use std::time::Duration;

use common::*;
use framepace::{PixelFormat, VideoConfig, interlace::FieldSync};
use tracing_test::traced_test;

fn configured_quietly(buffers: usize, fps: f64) -> Harness {
    let h = harness_with(None, Duration::ZERO, |backend| backend);
    h.presenter.configure(config(buffers, fps)).unwrap();
    h
}

#[test]
#[traced_test]
fn configuration_is_logged() {
    let _h = configured_quietly(0, 25.0);
    assert!(logs_contain("on software backend with 4 buffers"));
}

#[test]
#[traced_test]
fn out_of_order_timestamps_are_clamped_to_queue_tail() {
    let h = configured_quietly(4, 1.0);
    let picture = solid([0, 0, 0, 255]);
    h.presenter
        .submit(&picture, secs(2.0), 2.0, FieldSync::None)
        .unwrap();
    h.presenter
        .submit(&picture, secs(1.0), 1.0, FieldSync::None)
        .unwrap();
    assert!(logs_contain("older than queued"));

    // Both frames keep submission order.
    h.clock.set(secs(0.5));
    h.tick();
    assert_eq!(h.presenter.stats().pts, 2.0);
    h.tick();
    assert_eq!(h.presenter.stats().pts, 1.0);
    assert_eq!(h.presenter.skipped_frames(), 0);
}

#[test]
#[traced_test]
fn far_future_timestamps_are_reported() {
    let h = configured_quietly(3, 25.0);
    h.presenter
        .submit(&solid([0, 0, 0, 255]), secs(60.0), 0.0, FieldSync::None)
        .unwrap();
    assert!(logs_contain("too far ahead"));
}

#[test]
#[traced_test]
fn missing_backend_is_logged_as_error() {
    let h = harness_with(None, Duration::ZERO, |backend| backend);
    assert!(
        h.presenter
            .configure(VideoConfig::new(4, 4, 25.0, PixelFormat::Hardware))
            .is_err()
    );
    assert!(logs_contain("ERROR"));
    assert!(logs_contain("No backend for Hardware"));
}
