// SPDX-FileCopyrightText: 2025 Contributors to the framepace project.
// SPDX-License-Identifier: Apache-2.0

//! # framepace
//!
//! Vsync-paced presentation of decoded video frames.
//!
//! ## Overview
//!
//! A decoder thread produces pictures faster or slower than the display
//! refreshes. framepace sits between the two. It keeps the pictures in a small
//! rotating pool of buffers and hands each one to a display backend at the
//! right moment, aligned to the display's vertical refresh.
//!
//! ### Key Concepts
//!
//! - **Presenter**: the shared pipeline both threads talk to ([`Presenter`])
//! - **Slot**: one buffer of the fixed-size pool ([`SlotIndex`]). Every slot
//!   is free, queued, discard-pending or current
//! - **Backend**: draws buffers and captures the screen ([`RenderBackend`]),
//!   chosen per pixel format by a [`BackendRegistry`]
//! - **Reference clock**: time source that can wait for vsync and accepts a
//!   fine rate correction ([`ReferenceClock`])
//! - **Capture**: asynchronous snapshot of the displayed picture
//!   ([`CaptureHandle`])
//!
//! ## Architecture
//!
//! ```text
//!  producer thread                                 consumer thread
//!  ───────────────                                 ───────────────
//!  configure ─┐                                  ┌─ frame_move   (pick + flip)
//!  add_frame ─┤     ┌───────────────────────┐    ├─ render       (draw fields)
//!  flip_page ─┼───► │       Presenter       │ ◄──┴─ frame_finish (vsync wait)
//!  wait_for_  │     │ BufferPool  step      │
//!   buffer   ─┘     │ TimingController      │ ──► RenderBackend
//!                   │ CapturePipeline       │ ──► ReferenceClock
//!                   └───────────────────────┘
//! ```
//!
//! ## Examples
//!
//! ### Producer and consumer on one presenter
//!
//! ```no_run
//! use std::{sync::{Arc, atomic::AtomicBool}, thread, time::Duration};
//! use framepace::{
//!     BackendRegistry, PixelFormat, Presenter, PresenterSettings, SystemClock,
//!     VideoConfig, VideoPicture, interlace::FieldSync,
//! };
//!
//! # fn main() -> framepace::Result<()> {
//! let clock = Arc::new(SystemClock::new(Some(Duration::from_micros(16_667))));
//! let presenter = Presenter::new(
//!     clock.clone(),
//!     BackendRegistry::with_defaults(),
//!     PresenterSettings::default(),
//! );
//! presenter.configure(VideoConfig::new(1280, 720, 25.0, PixelFormat::Nv12))?;
//! presenter.set_fullscreen_video(true);
//!
//! let producer = presenter.clone();
//! thread::spawn(move || {
//!     let stop = AtomicBool::new(false);
//!     let picture = VideoPicture::blank(PixelFormat::Nv12, 1280, 720);
//!     for n in 0..250_u64 {
//!         producer.wait_for_buffer(&stop, Duration::from_millis(200))?;
//!         producer.submit(&picture, n * 40_000_000, n as f64 / 25.0, FieldSync::None)?;
//!     }
//!     framepace::Result::Ok(())
//! });
//!
//! loop {
//!     presenter.frame_move();
//!     presenter.render(true, Default::default(), 255);
//!     presenter.frame_finish();
//! }
//! # }
//! ```
//!
//! ## Timing
//!
//! Timestamps are absolute [`ReferenceClock`] times in nanoseconds. With
//! full-screen video [`Presenter::frame_finish`] blocks until the present time
//! of the buffer on screen. The [`TimingController`](timing::TimingController)
//! then steers the clock so the wake-ups land halfway between vsync pulses.
//!
//! ## Thread Safety
//!
//! - [`Presenter`] is `Send + Sync` and cheap to clone
//! - Producer methods may be called from any thread. `frame_move`, `render`
//!   and `frame_finish` must come from a single consumer thread
//! - Backends only need to be `Send`. The presenter serializes every call

mod error;
mod presenter;

pub mod backend;
pub mod capture;
pub mod clock;
pub mod config;
pub mod interlace;
pub mod picture;
pub mod pool;
pub mod timing;
pub mod wait;

pub use backend::{BackendRegistry, Capability, RenderBackend, RenderFlags, SoftwareBackend};
pub use capture::{CaptureFlags, CaptureHandle, CaptureId, CaptureState, UserState};
pub use clock::{ManualClock, ReferenceClock, SystemClock};
pub use config::{ConfigFlags, Orientation, PixelFormat, PresenterSettings, VideoConfig};
pub use error::{Error, Result};
pub use picture::VideoPicture;
pub use pool::SlotIndex;
pub use presenter::{PresentStats, PresentStep, Presenter};
