// SPDX-FileCopyrightText: 2025 Contributors to the framepace project.
// SPDX-License-Identifier: Apache-2.0

//! The presentation state machine.
//!
//! [`Presenter`] is the entry point for both actors of the pipeline:
//!
//! - the **producer** (decoder or player thread) configures the pipeline and
//!   submits frames with a target present time,
//! - the **consumer** (display thread) calls [`Presenter::frame_move`],
//!   [`Presenter::render`] and [`Presenter::frame_finish`] once per display
//!   tick.
//!
//! Per tick the state advances through
//!
//! ```text
//!            submit                        frame_move
//!   Idle ───────────► Ready ─────────────────────────────► Flip
//!    ▲                  ▲   pick the due buffer, skip older    │
//!    │                  │                                      │ backend flip
//!    │     queue not    │                                      ▼
//!    │       empty      │     frame_finish (Single/Blend)    Frame
//!    └──────────────────┴◄──────────────────────────────────── │
//!                       ▲                                      │ frame_finish
//!                       │  midpoint passed or frame_finish     ▼ (Bob/Weave)
//!                       └─────────────────────────────────── Frame2
//! ```
//!
//! # Locks
//!
//! Three locks protect the shared state:
//!
//! 1. the **backend lock**: configuration snapshot and backend lifetime,
//! 2. the **present lock**: buffer pool and step variable, with a condvar,
//! 3. the **capture lock**: the capture request list.
//!
//! They are only ever nested as backend → present and capture → backend.
//! The present lock is never held across a backend call, and no lock is held
//! while waiting for the present time.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, ThreadId},
    time::Duration,
};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::{
    Error, Result,
    backend::{BackendRegistry, Capability, CaptureTarget, RenderBackend, RenderFlags},
    capture::{CaptureFlags, CaptureHandle, CapturePipeline, CaptureRenderer},
    clock::{ReferenceClock, ns_to_secs, secs_to_ns},
    config::{PixelFormat, PresenterSettings, VideoConfig},
    interlace::{
        self, DeinterlaceMode, FieldSync, InterlaceMethod, InterlacePolicy, PresentMethod,
    },
    picture::VideoPicture,
    pool::{BufferPool, MIN_CAPACITY, SlotEntry, SlotIndex},
    timing::TimingController,
    wait::{Completion, Deadline},
};

/// Frame time assumed when neither the display nor the stream report one.
const FALLBACK_FRAME_TIME: f64 = 1.0 / 25.0;

/// Step of the per-tick presentation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PresentStep {
    /// Nothing to present.
    Idle,
    /// A queued buffer is waiting to be picked.
    Ready,
    /// A buffer was picked and must be flipped in.
    Flip,
    /// The first (or only) field is on screen.
    Frame,
    /// The second field is on screen.
    Frame2,
}

/// Snapshot of the presentation statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PresentStats {
    /// Seconds the consumer slept in its last present wait.
    pub sleep_time: f64,
    /// Decode timestamp of the buffer on screen, minus display latency.
    pub pts: f64,
    /// Buffers queued for display.
    pub queued: usize,
    /// Buffers displayed but not yet reclaimed.
    pub discard: usize,
    /// Buffers dropped because a newer one was already due.
    pub skipped: u64,
    /// Accumulated lateness in frames, reset by an on-time frame.
    pub late: u64,
    /// Raw phase error of the last timed present wait.
    pub present_error: f64,
}

struct BackendState {
    config: Option<VideoConfig>,
    format: Option<PixelFormat>,
    backend: Option<Box<dyn RenderBackend>>,
}

impl BackendState {
    fn teardown(&mut self) {
        self.config = None;
        self.format = None;
        self.backend = None;
    }
}

struct PresentState {
    pool: BufferPool,
    step: PresentStep,
    configured: bool,
    reconfiguring: bool,
    flipping: Option<SlotIndex>,
    started: bool,
    fps: f64,
    interlace: InterlacePolicy,
    render_gui: bool,
    flush_pending: bool,
    skipped: u64,
    late: u64,
    present_pts: f64,
    sleep_time: f64,
    frame_finished_at: u64,
}

/// Shared presenter state.
///
/// Separated from [`Presenter`] so that clones of the presenter can be handed
/// to the producer and consumer threads.
pub(crate) struct PresenterContext {
    clock: Arc<dyn ReferenceClock>,
    registry: BackendRegistry,
    settings: PresenterSettings,
    configure_gate: Mutex<()>,
    backend: Mutex<BackendState>,
    present: Mutex<PresentState>,
    present_cond: Condvar,
    captures: CapturePipeline,
    timing: Mutex<TimingController>,
    consumer: Mutex<Option<ThreadId>>,
    flush_done: Completion,
    fullscreen: AtomicBool,
    render_active: AtomicBool,
    display_latency_ns: AtomicU64,
}

impl PresenterContext {
    fn is_consumer_thread(&self) -> bool {
        *self.consumer.lock() == Some(thread::current().id())
    }

    fn has_consumer(&self) -> bool {
        self.consumer.lock().is_some()
    }

    fn frame_time(&self, fps: f64) -> f64 {
        match self.clock.refresh_period() {
            Some(period) if !period.is_zero() => period.as_secs_f64(),
            _ if fps > 0.0 => 1.0 / fps,
            _ => FALLBACK_FRAME_TIME,
        }
    }

    fn notify(&self) {
        self.present_cond.notify_all();
    }
}

/// Holds off new submissions while a configuration is in progress.
struct Reconfiguring<'a> {
    context: &'a PresenterContext,
}

impl<'a> Reconfiguring<'a> {
    fn begin(context: &'a PresenterContext) -> Self {
        context.present.lock().reconfiguring = true;
        Self { context }
    }
}

impl Drop for Reconfiguring<'_> {
    fn drop(&mut self) {
        self.context.present.lock().reconfiguring = false;
        self.context.notify();
    }
}

impl CaptureRenderer for PresenterContext {
    fn render(&self, target: &mut CaptureTarget) -> bool {
        let mut state = self.backend.lock();
        match state.backend.as_deref_mut() {
            Some(backend) if backend.supports(Capability::Capture) => {
                backend.render_capture(target)
            }
            _ => false,
        }
    }

    fn read(&self, target: &mut CaptureTarget) -> bool {
        let mut state = self.backend.lock();
        match state.backend.as_deref_mut() {
            Some(backend) => backend.read_capture(target),
            None => false,
        }
    }

    fn is_async(&self) -> bool {
        let state = self.backend.lock();
        state
            .backend
            .as_deref()
            .is_some_and(|backend| backend.capture_is_async())
    }
}

impl Drop for PresenterContext {
    /// Wakes any capture reader still blocked and drops the backend.
    fn drop(&mut self) {
        self.captures.drain();
        if let Some(backend) = self.backend.get_mut().backend.take() {
            debug!("Dropping {} backend", backend.name());
        }
    }
}

/// Vsync-paced video presenter.
///
/// Cheap to clone and `Send + Sync`. Clones share one pipeline, so the same
/// presenter can be handed to the producer and the consumer thread.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use framepace::{
///     BackendRegistry, ManualClock, PixelFormat, Presenter, PresenterSettings,
///     VideoConfig, VideoPicture, interlace::FieldSync,
/// };
///
/// # fn main() -> framepace::Result<()> {
/// let clock = Arc::new(ManualClock::new(None, std::time::Duration::ZERO));
/// let presenter = Presenter::new(
///     clock.clone(),
///     BackendRegistry::with_defaults(),
///     PresenterSettings::default(),
/// );
/// presenter.configure(VideoConfig::new(64, 36, 25.0, PixelFormat::Bgra))?;
///
/// // Producer side.
/// let picture = VideoPicture::blank(PixelFormat::Bgra, 64, 36);
/// presenter.submit(&picture, 0, 0.0, FieldSync::None)?;
///
/// // Consumer side, once per display tick.
/// presenter.frame_move();
/// presenter.render(true, Default::default(), 255);
/// presenter.frame_finish();
///
/// assert!(presenter.is_started());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Presenter {
    context: Arc<PresenterContext>,
}

impl Presenter {
    /// Creates an unconfigured presenter.
    ///
    /// # Arguments
    ///
    /// * `clock` - Time source and fine-adjust sink
    /// * `registry` - Backends to choose from at configuration time
    /// * `settings` - Timeouts and policy
    pub fn new(
        clock: Arc<dyn ReferenceClock>,
        registry: BackendRegistry,
        settings: PresenterSettings,
    ) -> Self {
        let interlace = InterlacePolicy {
            mode: settings.deinterlace_mode,
            method: settings.interlace_method,
            disable_background: settings.disable_background_deinterlace,
        };
        let context = PresenterContext {
            clock,
            registry,
            configure_gate: Mutex::new(()),
            backend: Mutex::new(BackendState {
                config: None,
                format: None,
                backend: None,
            }),
            present: Mutex::new(PresentState {
                pool: BufferPool::new(MIN_CAPACITY),
                step: PresentStep::Idle,
                configured: false,
                reconfiguring: false,
                flipping: None,
                started: false,
                fps: 0.0,
                interlace,
                render_gui: true,
                flush_pending: false,
                skipped: 0,
                late: 0,
                present_pts: 0.0,
                sleep_time: 0.0,
                frame_finished_at: 0,
            }),
            present_cond: Condvar::new(),
            captures: CapturePipeline::new(),
            timing: Mutex::new(TimingController::new()),
            consumer: Mutex::new(None),
            flush_done: Completion::new(),
            fullscreen: AtomicBool::new(false),
            render_active: AtomicBool::new(true),
            display_latency_ns: AtomicU64::new(0),
            settings,
        };
        Self {
            context: Arc::new(context),
        }
    }

    /// Applies a stream configuration.
    ///
    /// Waits (bounded by `configure_timeout_ms`) for the state machine to go
    /// idle, then (re)creates the backend for `config.format`, sizes the
    /// buffer pool and resets timing and statistics. The backend is reused
    /// when the format did not change.
    ///
    /// The pool holds `config.buffers` slots, or the backend's optimum when
    /// that is `0`, clamped to `[2, backend max]`.
    ///
    /// Until this returns, [`add_frame`](Self::add_frame) and
    /// [`flip_page`](Self::flip_page) report [`Error::NoFreeBuffer`] and
    /// [`wait_for_buffer`](Self::wait_for_buffer) keeps waiting, so the
    /// frames already queued can drain.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArg`] for an unusable configuration.
    /// - [`Error::Timeout`] if the pipeline did not go idle. The previous
    ///   configuration stays in place.
    /// - [`Error::NoBackend`] / [`Error::Backend`] if no backend accepts the
    ///   configuration. The presenter is unconfigured afterwards.
    pub fn configure(&self, config: VideoConfig) -> Result<()> {
        config.validate()?;
        let ctx = &*self.context;
        let _gate = ctx.configure_gate.lock();
        let _reconfiguring = Reconfiguring::begin(ctx);

        {
            let mut present = ctx.present.lock();
            let deadline = Deadline::after(ctx.settings.configure_timeout());
            let idle = deadline.wait_until(
                &ctx.present_cond,
                &mut present,
                ctx.settings.wait_poll(),
                |state| state.step == PresentStep::Idle,
            );
            if !idle {
                warn!("Timeout waiting for the presenter to go idle before configuring");
                return Err(Error::Timeout {
                    what: "presenter to go idle",
                });
            }
        }

        let mut state = ctx.backend.lock();
        let reusable = state.format == Some(config.format) && state.backend.is_some();
        let mut backend = match state.backend.take() {
            Some(backend) if reusable => backend,
            _ => match ctx.registry.create(config.format) {
                Ok(backend) => backend,
                Err(err) => {
                    error!("No backend for {:?}: {err}", config.format);
                    self.unconfigure(&mut state);
                    return Err(err);
                }
            },
        };

        let info = match backend.configure(&config) {
            Ok(info) => info,
            Err(err) => {
                error!("{} backend rejected the configuration: {err}", backend.name());
                self.unconfigure(&mut state);
                return Err(err);
            }
        };
        let requested = if config.buffers == 0 {
            info.optimal
        } else {
            config.buffers
        };
        let capacity = requested.min(info.max).max(MIN_CAPACITY);
        backend.set_buffer_count(capacity);
        info!(
            "Configured {}x{} @ {:.3} fps {:?} on {} backend with {capacity} buffers",
            config.width,
            config.height,
            config.fps,
            config.format,
            backend.name()
        );

        ctx.timing.lock().reset();
        {
            let mut present = ctx.present.lock();
            if present.pool.queued_count() > 0 {
                debug!(
                    "Dropping {} frames queued during reconfiguration",
                    present.pool.queued_count()
                );
            }
            present.pool.configure(capacity);
            present.step = PresentStep::Idle;
            present.configured = true;
            present.started = false;
            present.fps = config.fps;
            present.flush_pending = false;
            present.skipped = 0;
            present.late = 0;
            present.present_pts = 0.0;
            present.sleep_time = 0.0;
            ctx.notify();
        }
        state.format = Some(config.format);
        state.config = Some(config);
        state.backend = Some(backend);
        Ok(())
    }

    fn unconfigure(&self, state: &mut BackendState) {
        state.teardown();
        let mut present = self.context.present.lock();
        present.configured = false;
        present.started = false;
        present.pool.flush();
        present.step = PresentStep::Idle;
        self.context.notify();
    }

    /// Uploads a decoded picture into the next free slot.
    ///
    /// The slot stays free until [`flip_page`](Self::flip_page) queues it.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConfigured`] before a successful configuration.
    /// - [`Error::NoFreeBuffer`] if every slot is in use or a configuration
    ///   is in progress.
    /// - [`Error::InvalidArg`] if the picture does not match the
    ///   configuration.
    pub fn add_frame(&self, picture: &VideoPicture) -> Result<SlotIndex> {
        let ctx = &*self.context;
        let mut state = ctx.backend.lock();
        let slot = {
            let present = ctx.present.lock();
            if !present.configured {
                return Err(Error::NotConfigured);
            }
            if present.reconfiguring {
                return Err(Error::NoFreeBuffer);
            }
            present.pool.peek_free().ok_or(Error::NoFreeBuffer)?
        };
        let config = state.config.as_ref().ok_or(Error::NotConfigured)?;
        if picture.width != config.width || picture.height != config.height {
            return Err(Error::InvalidArg(format!(
                "Picture is {}x{}, configured for {}x{}.",
                picture.width, picture.height, config.width, config.height
            )));
        }
        let backend = state.backend.as_deref_mut().ok_or(Error::NotConfigured)?;
        backend.upload(slot, picture)?;
        trace!("Uploaded picture into {slot}");
        Ok(slot)
    }

    /// Queues a frame for display at `timestamp`.
    ///
    /// Picks the present method from the deinterlace settings and `sync`,
    /// clamps timestamps more than `late_slack_ms` in the future, and clamps
    /// timestamps earlier than the newest queued one up to it so the queue
    /// stays ordered.
    ///
    /// # Arguments
    ///
    /// * `stop` - Producer stop flag. Nothing is queued once it is set.
    /// * `timestamp` - Absolute present time in nanoseconds
    /// * `pts` - Decode timestamp in seconds, reported by [`stats`](Self::stats)
    /// * `source` - Slot filled by [`add_frame`](Self::add_frame). `None` uses
    ///   the head of the free list.
    /// * `sync` - Field hint of the picture
    ///
    /// # Errors
    ///
    /// - [`Error::Stopped`] if `stop` is set.
    /// - [`Error::NotConfigured`] before a successful configuration.
    /// - [`Error::NoFreeBuffer`] if no slot is free or a configuration is in
    ///   progress.
    /// - [`Error::InvalidArg`] if `source` is not a free slot.
    pub fn flip_page(
        &self,
        stop: &AtomicBool,
        timestamp: u64,
        pts: f64,
        source: Option<SlotIndex>,
        sync: FieldSync,
    ) -> Result<SlotIndex> {
        if stop.load(Ordering::Acquire) {
            return Err(Error::Stopped);
        }
        let ctx = &*self.context;
        let fullscreen = ctx.fullscreen.load(Ordering::Acquire);
        let now = ctx.clock.now();
        let limit = now.saturating_add(secs_to_ns(ctx.settings.late_slack().as_secs_f64()));
        let mut timestamp = timestamp;
        if timestamp > limit {
            debug!(
                "Timestamp {:.3}s is too far ahead of {:.3}s, clamping",
                ns_to_secs(timestamp),
                ns_to_secs(now)
            );
            timestamp = limit;
        }
        let correction = ctx.timing.lock().correction();

        let mut present = ctx.present.lock();
        if !present.configured {
            return Err(Error::NotConfigured);
        }
        if present.reconfiguring {
            debug!("Configuration in progress, not queueing");
            return Err(Error::NoFreeBuffer);
        }
        let newest = present
            .pool
            .back_queued()
            .and_then(|s| present.pool.entry(s).copied());
        if let Some(newest) = newest {
            if timestamp < newest.timestamp {
                debug!(
                    "Timestamp {:.3}s is older than queued {:.3}s, clamping",
                    ns_to_secs(timestamp),
                    ns_to_secs(newest.timestamp)
                );
                timestamp = newest.timestamp;
            }
        }
        let (method, field) = interlace::select(&present.interlace, sync, fullscreen);
        let entry = SlotEntry {
            timestamp,
            pts,
            method,
            field,
            correction: correction * ctx.frame_time(present.fps),
        };
        let slot = match source {
            Some(slot) => {
                if !present.pool.queue_slot(slot, entry) {
                    return Err(Error::InvalidArg(format!("{slot} is not free.")));
                }
                slot
            }
            None => present.pool.submit(entry).ok_or(Error::NoFreeBuffer)?,
        };
        trace!(
            "Queued {slot} for {:.3}s as {method:?}/{field:?}",
            ns_to_secs(timestamp)
        );
        if present.step == PresentStep::Idle {
            present.step = PresentStep::Ready;
        }
        ctx.notify();
        Ok(slot)
    }

    /// Uploads and queues a picture in one call.
    ///
    /// # Errors
    ///
    /// See [`add_frame`](Self::add_frame) and [`flip_page`](Self::flip_page).
    pub fn submit(
        &self,
        picture: &VideoPicture,
        timestamp: u64,
        pts: f64,
        sync: FieldSync,
    ) -> Result<SlotIndex> {
        let slot = self.add_frame(picture)?;
        self.flip_page(&AtomicBool::new(false), timestamp, pts, Some(slot), sync)
    }

    /// Blocks until a slot is free and no configuration is in progress.
    ///
    /// While the UI is inactive this never blocks for long. It sleeps until
    /// the oldest queued frame is due (at most `inactive_sleep_cap_ms`), then
    /// drops that frame and returns `Ok(0)`.
    ///
    /// # Returns
    ///
    /// The buffering depth (queued plus discard-pending buffers).
    ///
    /// # Errors
    ///
    /// - [`Error::NotConfigured`] before a successful configuration.
    /// - [`Error::Stopped`] if `stop` was raised while waiting.
    /// - [`Error::Timeout`] if no slot became free within `timeout`.
    pub fn wait_for_buffer(&self, stop: &AtomicBool, timeout: Duration) -> Result<usize> {
        let ctx = &*self.context;
        if !ctx.render_active.load(Ordering::Acquire) {
            return self.drop_while_inactive();
        }

        let mut present = ctx.present.lock();
        if !present.configured {
            return Err(Error::NotConfigured);
        }
        let deadline = Deadline::after(timeout);
        let available = deadline.wait_until(
            &ctx.present_cond,
            &mut present,
            ctx.settings.wait_poll(),
            |state| {
                let free = state.pool.free_count() > 0 && !state.reconfiguring;
                free || stop.load(Ordering::Acquire)
            },
        );
        if stop.load(Ordering::Acquire) {
            return Err(Error::Stopped);
        }
        if !available {
            warn!(
                "Timeout waiting for a free buffer ({} queued, {} discard)",
                present.pool.queued_count(),
                present.pool.discard_count()
            );
            return Err(Error::Timeout {
                what: "free buffer",
            });
        }
        Ok(present.pool.queued_count() + present.pool.discard_count())
    }

    fn drop_while_inactive(&self) -> Result<usize> {
        let ctx = &*self.context;
        let reclaimed = {
            let mut present = ctx.present.lock();
            if !present.configured {
                return Err(Error::NotConfigured);
            }
            present.render_gui = false;

            let cap = ctx.settings.inactive_sleep_cap();
            let head = present
                .pool
                .front_queued()
                .and_then(|s| present.pool.entry(s).copied());
            let sleep = match head {
                Some(entry) => {
                    let until = entry.timestamp.saturating_sub(ctx.clock.now());
                    Duration::from_nanos(until).min(cap)
                }
                None => cap,
            };
            if !sleep.is_zero() {
                ctx.present_cond.wait_for(&mut present, sleep);
            }

            if present.pool.discard_oldest() {
                trace!("UI inactive, dropped oldest queued frame");
            }
            if present.step == PresentStep::Ready && present.pool.queued_count() == 0 {
                present.step = PresentStep::Idle;
            }
            let reclaimed = present.pool.reclaim_discards(|_| true);
            ctx.notify();
            reclaimed
        };

        if !reclaimed.is_empty() {
            let mut state = ctx.backend.lock();
            if let Some(backend) = state.backend.as_deref_mut() {
                for slot in reclaimed {
                    backend.release_buffer(slot);
                }
            }
        }
        Ok(0)
    }

    /// Drops every queued and discard-pending buffer.
    ///
    /// The buffer the backend shows (or is flipping to) stays current so the
    /// producer cannot upload into it.
    ///
    /// The state machine returns to idle at once. The backend is flushed on
    /// the consumer thread: directly when called from it (or before any
    /// consumer ticked), otherwise by the next [`frame_move`](Self::frame_move).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if the consumer does not acknowledge within
    /// `flush_timeout_ms`. The queues are already empty in that case.
    pub fn flush(&self) -> Result<()> {
        let ctx = &*self.context;
        let inline = ctx.is_consumer_thread() || !ctx.has_consumer();
        let configured = {
            let mut present = ctx.present.lock();
            // The buffer on screen, or about to be, stays out of the free list.
            let shown = present.flipping.unwrap_or(present.pool.current());
            present.pool.flush_keeping(shown);
            present.step = PresentStep::Idle;
            present.skipped = 0;
            present.late = 0;
            present.flush_pending = present.configured && !inline;
            if present.flush_pending {
                ctx.flush_done.reset();
            }
            ctx.notify();
            present.configured
        };
        debug!("Flushed presentation queue");
        if !configured {
            return Ok(());
        }

        if inline {
            let mut state = ctx.backend.lock();
            if let Some(backend) = state.backend.as_deref_mut() {
                backend.flush();
            }
            return Ok(());
        }

        if ctx.flush_done.wait_for(ctx.settings.flush_timeout()) {
            Ok(())
        } else {
            warn!("Timeout waiting for the consumer to flush the backend");
            Err(Error::Timeout {
                what: "flush acknowledgment",
            })
        }
    }

    /// Current statistics.
    pub fn stats(&self) -> PresentStats {
        let present_error = self.context.timing.lock().last_error();
        let present = self.context.present.lock();
        PresentStats {
            sleep_time: present.sleep_time,
            pts: present.present_pts,
            queued: present.pool.queued_count(),
            discard: present.pool.discard_count(),
            skipped: present.skipped,
            late: present.late,
            present_error,
        }
    }

    /// Advances the state machine by one display tick.
    ///
    /// Called by the consumer before drawing. Marks the calling thread as
    /// the consumer, runs a posted backend flush, picks and flips the due
    /// buffer, reclaims discard buffers the backend no longer references and
    /// runs the capture sweep.
    pub fn frame_move(&self) {
        let ctx = &*self.context;
        {
            let mut consumer = ctx.consumer.lock();
            let current = thread::current().id();
            if *consumer != Some(current) {
                debug!("Consumer thread is now {current:?}");
                *consumer = Some(current);
            }
        }

        {
            let mut state = ctx.backend.lock();
            if let Some(backend) = state.backend.as_deref_mut() {
                self.advance(backend);
            }
        }

        ctx.captures.sweep(ctx);
    }

    fn advance(&self, backend: &mut dyn RenderBackend) {
        let ctx = &*self.context;
        let flush = std::mem::take(&mut ctx.present.lock().flush_pending);
        if flush {
            backend.flush();
            ctx.flush_done.set();
        }

        let now = ctx.clock.now();
        let fullscreen = ctx.fullscreen.load(Ordering::Acquire);
        let latency = ns_to_secs(ctx.display_latency_ns.load(Ordering::Acquire));
        let (flip, discarded, render_gui) = {
            let mut present = ctx.present.lock();
            if !present.configured {
                return;
            }

            if present.step == PresentStep::Frame2 {
                let next = present
                    .pool
                    .front_queued()
                    .and_then(|s| present.pool.entry(s).copied());
                if let Some(next) = next {
                    let current = present.pool.current_entry();
                    let midpoint = current.timestamp
                        + next.timestamp.saturating_sub(current.timestamp) / 2;
                    if now > midpoint {
                        trace!("Next frame passed the field midpoint, leaving second field");
                        present.step = PresentStep::Ready;
                    }
                }
            }

            if present.step == PresentStep::Ready {
                let frame_time = ctx.frame_time(present.fps);
                prepare_next_render(&mut present, now, frame_time, fullscreen, latency);
            }

            let flip = (present.step == PresentStep::Flip).then(|| present.pool.current());
            present.flipping = flip;
            let discarded: Vec<SlotIndex> = present.pool.discarded().collect();
            (flip, discarded, present.render_gui)
        };

        if let Some(slot) = flip {
            backend.flip(slot);
            let mut present = ctx.present.lock();
            present.flipping = None;
            // A flush during the flip keeps `slot` current but leaves Idle.
            if present.pool.current() == slot {
                present.started = true;
                if present.step == PresentStep::Flip {
                    present.step = PresentStep::Frame;
                }
            }
            ctx.notify();
        }

        let releasable: Vec<SlotIndex> = discarded
            .into_iter()
            .filter(|&slot| !render_gui || !backend.needs_buffer_for_reference(slot))
            .collect();
        let reclaimed = {
            let mut present = ctx.present.lock();
            let reclaimed = present.pool.reclaim_discards(|slot| releasable.contains(&slot));
            present.render_gui = true;
            if !reclaimed.is_empty() {
                ctx.notify();
            }
            reclaimed
        };
        for slot in reclaimed {
            backend.release_buffer(slot);
        }
    }

    /// Draws the buffer on screen.
    ///
    /// Field-sequential methods draw one field per tick. Blend draws both
    /// fields, the second at half `alpha`. Does nothing until the first
    /// buffer was flipped.
    ///
    /// # Arguments
    ///
    /// * `clear` - Clear the target before drawing
    /// * `flags` - Extra flags passed through to the backend
    /// * `alpha` - Opacity, 255 is opaque
    pub fn render(&self, clear: bool, flags: RenderFlags, alpha: u8) {
        let ctx = &*self.context;
        let mut state = ctx.backend.lock();
        let Some(backend) = state.backend.as_deref_mut() else {
            return;
        };
        let (entry, step) = {
            let present = ctx.present.lock();
            if !present.started {
                return;
            }
            (present.pool.current_entry(), present.step)
        };

        match entry.method {
            PresentMethod::Single => backend.render_update(clear, flags, alpha),
            PresentMethod::Bob | PresentMethod::Weave => {
                let mut flags = flags | field_flags(entry.field, step);
                if entry.method == PresentMethod::Weave {
                    flags = flags | RenderFlags::WEAVE;
                }
                backend.render_update(clear, flags, alpha);
            }
            PresentMethod::Blend => {
                let (first, second) = match entry.field {
                    FieldSync::Bottom => (RenderFlags::BOTTOM, RenderFlags::TOP),
                    _ => (RenderFlags::TOP, RenderFlags::BOTTOM),
                };
                backend.render_update(clear, flags | first | RenderFlags::NO_OSD, alpha);
                backend.render_update(false, flags | second, alpha / 2);
            }
        }
    }

    /// Completes the display tick.
    ///
    /// With full-screen video this waits for the present time of the buffer
    /// on screen and feeds the wake-up into the timing loop. Then it moves
    /// to the second field or back to idle, and to ready if more frames are
    /// queued.
    pub fn frame_finish(&self) {
        let ctx = &*self.context;
        let present_at = {
            let present = ctx.present.lock();
            if !present.configured {
                return;
            }
            present.pool.current_entry().timestamp
        };

        if ctx.fullscreen.load(Ordering::Acquire) {
            let before = ctx.clock.now();
            let wake = ctx.clock.wait_until(present_at);
            ctx.timing
                .lock()
                .record_wake(ctx.clock.as_ref(), wake, present_at);
            ctx.present.lock().sleep_time = ns_to_secs(wake.saturating_sub(before));
        }

        let now = ctx.clock.now();
        let mut present = ctx.present.lock();
        present.frame_finished_at = now;
        present.step = match present.step {
            PresentStep::Frame if present.pool.current_entry().method.is_field_sequential() => {
                PresentStep::Frame2
            }
            PresentStep::Frame | PresentStep::Frame2 => PresentStep::Idle,
            step => step,
        };
        if present.step == PresentStep::Idle && present.pool.queued_count() > 0 {
            present.step = PresentStep::Ready;
        }
        ctx.notify();
    }

    /// Sets whether video owns the display.
    ///
    /// Full-screen video is paced by [`frame_finish`](Self::frame_finish)
    /// and looks one frame ahead when picking the due buffer.
    pub fn set_fullscreen_video(&self, fullscreen: bool) {
        self.context.fullscreen.store(fullscreen, Ordering::Release);
    }

    /// Sets whether the UI is rendering at all.
    pub fn set_render_active(&self, active: bool) {
        self.context.render_active.store(active, Ordering::Release);
        self.context.notify();
    }

    /// Sets the display latency subtracted from reported pts.
    pub fn set_display_latency(&self, latency: Duration) {
        let latency = latency.as_nanos().min(u64::MAX as u128) as u64;
        self.context
            .display_latency_ns
            .store(latency, Ordering::Release);
    }

    /// Changes the deinterlace preferences for subsequently queued frames.
    pub fn set_deinterlace(&self, mode: DeinterlaceMode, method: InterlaceMethod) {
        let mut present = self.context.present.lock();
        present.interlace.mode = mode;
        present.interlace.method = method;
    }

    /// Returns `true` if the configured backend implements `capability`.
    pub fn supports(&self, capability: Capability) -> bool {
        self.context
            .backend
            .lock()
            .backend
            .as_deref()
            .is_some_and(|backend| backend.supports(capability))
    }

    /// Tears the pipeline down.
    ///
    /// Fails pending captures, drops all buffers and the backend. The
    /// presenter can be configured again afterwards.
    pub fn uninit(&self) {
        let ctx = &*self.context;
        ctx.captures.drain();
        let mut state = ctx.backend.lock();
        if let Some(backend) = state.backend.as_deref_mut() {
            backend.flush();
            info!("Releasing {} backend", backend.name());
        }
        self.unconfigure(&mut state);
        ctx.timing.lock().reset();
        ctx.flush_done.set();
    }

    /// Returns `true` after a successful configuration.
    pub fn is_configured(&self) -> bool {
        self.context.present.lock().configured
    }

    /// Returns `true` once a buffer was flipped since the last configuration.
    pub fn is_started(&self) -> bool {
        self.context.present.lock().started
    }

    /// The active configuration.
    pub fn config(&self) -> Option<VideoConfig> {
        self.context.backend.lock().config.clone()
    }

    /// Current state machine step.
    pub fn step(&self) -> PresentStep {
        self.context.present.lock().step
    }

    /// Returns `true` while [`configure`](Self::configure) is waiting or
    /// applying a configuration.
    pub fn is_reconfiguring(&self) -> bool {
        self.context.present.lock().reconfiguring
    }

    /// Pool capacity of the active configuration.
    pub fn buffer_count(&self) -> usize {
        self.context.present.lock().pool.capacity()
    }

    /// Clock time of the last [`frame_finish`](Self::frame_finish).
    pub fn frame_finished_at(&self) -> u64 {
        self.context.present.lock().frame_finished_at
    }

    /// Frames dropped because a newer frame was already due.
    pub fn skipped_frames(&self) -> u64 {
        self.context.present.lock().skipped
    }

    /// Accumulated lateness in frames.
    pub fn late_frames(&self) -> u64 {
        self.context.present.lock().late
    }

    /// Creates a capture request handle. Nothing is captured until
    /// [`start_capture`](Self::start_capture).
    pub fn alloc_capture(&self) -> CaptureHandle {
        CaptureHandle::new()
    }

    /// Starts (or restarts) a capture of `width` x `height` BGRA pixels.
    ///
    /// With [`CaptureFlags::IMMEDIATE`] on the consumer thread the capture
    /// is complete when this returns. Otherwise the next sweep processes it.
    /// Without a capture-capable backend the request fails at once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArg`] for a zero-sized capture.
    pub fn start_capture(
        &self,
        handle: &CaptureHandle,
        width: u32,
        height: u32,
        flags: CaptureFlags,
    ) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidArg(format!(
                "Capture size {width}x{height} is empty."
            )));
        }
        let ctx = &*self.context;
        if !self.supports(Capability::Capture) {
            ctx.captures.reject(handle, width, height, flags);
            return Ok(());
        }
        ctx.captures
            .start(handle, width, height, flags, ctx.is_consumer_thread(), ctx);
        Ok(())
    }

    /// Releases a capture request.
    ///
    /// Blocked readers wake up. On the consumer thread the request is
    /// dropped at once, otherwise by the next sweep.
    pub fn release_capture(&self, handle: CaptureHandle) {
        let ctx = &*self.context;
        ctx.captures.release(handle, ctx.is_consumer_thread());
    }
}

/// Field flags for a field-sequential draw.
fn field_flags(field: FieldSync, step: PresentStep) -> RenderFlags {
    if step == PresentStep::Frame {
        match field {
            FieldSync::Bottom => RenderFlags::BOTTOM | RenderFlags::FIELD0,
            _ => RenderFlags::TOP | RenderFlags::FIELD0,
        }
    } else {
        match field {
            FieldSync::Top => RenderFlags::BOTTOM | RenderFlags::FIELD1,
            _ => RenderFlags::TOP | RenderFlags::FIELD1,
        }
    }
}

/// Picks the due buffer and makes it current.
///
/// Walks the queue newest to oldest over adjacent pairs and stops at the
/// first buffer whose predecessor is already due and which is itself due
/// within one frame. Older buffers are skipped. Falls back to the oldest.
fn prepare_next_render(
    present: &mut PresentState,
    now: u64,
    frame_time: f64,
    fullscreen: bool,
    latency: f64,
) {
    let queued: Vec<SlotIndex> = present.pool.queued().collect();
    let Some(&oldest) = queued.first() else {
        error!("Ready with an empty queue");
        present.step = PresentStep::Idle;
        return;
    };

    let mut clock = ns_to_secs(now);
    if fullscreen {
        clock += frame_time;
    }
    let entry = |slot: SlotIndex| present.pool.entry(slot).copied().unwrap_or_default();

    let mut due = oldest;
    for pair in queued.windows(2).rev() {
        let (prev, curr) = (entry(pair[0]), entry(pair[1]));
        if clock > ns_to_secs(prev.timestamp) + prev.correction
            && clock > ns_to_secs(curr.timestamp) - frame_time + curr.correction
        {
            due = pair[1];
            break;
        }
    }

    let picked = entry(due);

    let skipped = present.pool.skip_to(due);
    if skipped > 0 {
        debug!("Skipped {skipped} late frames");
        present.skipped += skipped as u64;
    }

    let late = ((clock - ns_to_secs(picked.timestamp) + picked.correction) / frame_time).floor();
    if late >= 1.0 {
        present.late += late as u64;
    } else {
        present.late = 0;
    }

    if present.pool.advance_current().is_some() {
        present.present_pts = picked.pts - latency;
        present.step = PresentStep::Flip;
        trace!("Picked {due} for {:.3}s", ns_to_secs(picked.timestamp));
    } else {
        present.step = PresentStep::Idle;
    }
}
