// SPDX-FileCopyrightText: 2025 Contributors to the framepace project.
// SPDX-License-Identifier: Apache-2.0

//! Shared setup for the integration tests.

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use framepace::{
    BackendRegistry, ManualClock, PixelFormat, Presenter, PresenterSettings, SoftwareBackend,
    VideoConfig, VideoPicture, backend::SoftwareProbe,
};

/// Ensures logging is initialized only once across all tests.
static LOG_ONCE: std::sync::Once = std::sync::Once::new();

/// Initializes logging (respects the RUST_LOG environment variable).
pub fn setup_logging() {
    LOG_ONCE.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::builder()
                    .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .with_test_writer()
            .init();
    });
}

/// A presenter on a manual clock and an observed software backend.
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub presenter: Presenter,
    pub probe: SoftwareProbe,
}

/// Settings with short timeouts so failing waits finish quickly.
pub fn test_settings() -> PresenterSettings {
    PresenterSettings {
        configure_timeout_ms: 200,
        flush_timeout_ms: 200,
        ..Default::default()
    }
}

/// Builds an unconfigured harness without touching the global subscriber.
///
/// `customize` is applied to every software backend the registry creates
/// for [`PixelFormat::Bgra`].
pub fn harness_with<F>(refresh: Option<Duration>, vsync_phase: Duration, customize: F) -> Harness
where
    F: Fn(SoftwareBackend) -> SoftwareBackend + Send + Sync + 'static,
{
    let clock = Arc::new(ManualClock::new(refresh, vsync_phase));
    let probe = SoftwareProbe::default();
    let mut registry = BackendRegistry::with_defaults();
    let factory_probe = probe.clone();
    registry.register(PixelFormat::Bgra, move || {
        Box::new(customize(
            SoftwareBackend::new().with_probe(factory_probe.clone()),
        ))
    });
    let presenter = Presenter::new(clock.clone(), registry, test_settings());
    Harness {
        clock,
        presenter,
        probe,
    }
}

/// Builds a harness configured for 4x4 BGRA at `fps` with `buffers` slots.
pub fn configured(buffers: usize, fps: f64) -> Harness {
    configured_with(buffers, fps, None, Duration::ZERO, |backend| backend)
}

/// Like [`configured`], with a simulated display and a customized backend.
pub fn configured_with<F>(
    buffers: usize,
    fps: f64,
    refresh: Option<Duration>,
    vsync_phase: Duration,
    customize: F,
) -> Harness
where
    F: Fn(SoftwareBackend) -> SoftwareBackend + Send + Sync + 'static,
{
    setup_logging();
    let harness = harness_with(refresh, vsync_phase, customize);
    harness
        .presenter
        .configure(config(buffers, fps))
        .expect("configure");
    harness
}

/// 4x4 BGRA stream configuration.
pub fn config(buffers: usize, fps: f64) -> VideoConfig {
    VideoConfig::new(4, 4, fps, PixelFormat::Bgra).with_buffers(buffers)
}

/// A solid 4x4 BGRA picture.
pub fn solid(bgra: [u8; 4]) -> VideoPicture {
    VideoPicture::new(PixelFormat::Bgra, 4, 4, bgra.repeat(16)).expect("picture")
}

/// Converts seconds to clock nanoseconds.
pub fn secs(s: f64) -> u64 {
    (s * 1e9).round() as u64
}

impl Harness {
    /// Runs one full consumer tick.
    pub fn tick(&self) {
        self.presenter.frame_move();
        self.presenter.render(true, Default::default(), 255);
        self.presenter.frame_finish();
    }
}
