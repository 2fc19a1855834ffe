// SPDX-FileCopyrightText: 2025 Contributors to the framepace project.
// SPDX-License-Identifier: Apache-2.0

//! Asynchronous frame capture.
//!
//! Clients ask for snapshots of whatever is on screen without stalling
//! playback. A request cycles through
//!
//! ```text
//!   NeedsRender --render--> NeedsReadout --read--> Done | Failed
//!        ^                                              |
//!        +------------- continuous re-arm --------------+
//! ```
//!
//! driven by [`CapturePipeline::sweep`], which the presenter runs once per
//! display tick. Readers never see the internal state directly. They observe
//! a [`UserState`] that is only published when a cycle completes. A
//! continuous capture can therefore already be rendering its next cycle while
//! readers still read the previous result.
//!
//! Deletion is owned by the sweep. A reader that times out must keep its
//! handle and either wait again or release it.

use std::{
    collections::HashMap,
    fmt,
    ops::BitOr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::{backend::CaptureTarget, wait::Completion};

/// Pause between drain rounds while readers are still blocked.
const DRAIN_YIELD: Duration = Duration::from_millis(10);

/// Identifier of a capture request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CaptureId(Uuid);

impl CaptureId {
    /// Generates a new random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CaptureId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CaptureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "capture {}", self.0)
    }
}

/// Capture request flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CaptureFlags(pub u32);

impl CaptureFlags {
    /// Single-shot, processed by the next sweep.
    pub const NONE: CaptureFlags = CaptureFlags(0);
    /// Render and read out synchronously when started on the consumer thread.
    pub const IMMEDIATE: CaptureFlags = CaptureFlags(0x01);
    /// Re-arm after every completed cycle until released.
    pub const CONTINUOUS: CaptureFlags = CaptureFlags(0x02);

    /// Returns `true` if every bit of `other` is set in `self`.
    pub fn contains(self, other: CaptureFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for CaptureFlags {
    type Output = CaptureFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        CaptureFlags(self.0 | rhs.0)
    }
}

/// Processing state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CaptureState {
    /// Waiting for the backend to render off-screen.
    NeedsRender,
    /// Rendered, waiting for pixel readback.
    NeedsReadout,
    /// Pixels are available.
    Done,
    /// The backend could not render or read back.
    Failed,
    /// Released. The next sweep drops it.
    NeedsDelete,
}

/// Result state observed by readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum UserState {
    /// A cycle is in progress.
    Working,
    /// The last cycle produced pixels.
    Done,
    /// The last cycle failed, or the pipeline shut down.
    Failed,
}

/// Renders and reads back captures. Implemented over the presenter's
/// backend lock.
pub(crate) trait CaptureRenderer {
    /// Renders the current picture into `target`.
    fn render(&self, target: &mut CaptureTarget) -> bool;
    /// Reads back a rendered target.
    fn read(&self, target: &mut CaptureTarget) -> bool;
    /// Returns `true` if readback lags rendering by a tick.
    fn is_async(&self) -> bool;
}

#[derive(Debug)]
struct RequestState {
    state: CaptureState,
    user_state: UserState,
    target: CaptureTarget,
}

#[derive(Debug)]
struct Request {
    id: CaptureId,
    event: Completion,
    waiters: AtomicUsize,
    inner: Mutex<RequestState>,
}

impl Request {
    fn flags(&self) -> CaptureFlags {
        self.inner.lock().target.flags
    }
}

/// Client handle to a capture request.
///
/// Cheap to clone. Dropping every handle does not cancel a listed request.
/// Use [`Presenter::release_capture`](crate::Presenter::release_capture).
#[derive(Debug, Clone)]
pub struct CaptureHandle {
    request: Arc<Request>,
}

impl CaptureHandle {
    pub(crate) fn new() -> Self {
        let id = CaptureId::new();
        Self {
            request: Arc::new(Request {
                id,
                event: Completion::new(),
                waiters: AtomicUsize::new(0),
                inner: Mutex::new(RequestState {
                    state: CaptureState::Failed,
                    user_state: UserState::Failed,
                    target: CaptureTarget::new(id, 0, 0, CaptureFlags::NONE),
                }),
            }),
        }
    }

    /// Request identifier.
    pub fn id(&self) -> CaptureId {
        self.request.id
    }

    /// Blocks until a cycle completes or `timeout` elapses.
    ///
    /// Returns the user state at that point. [`UserState::Working`] means
    /// the wait timed out. The request is still alive in that case.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use framepace::{Presenter, capture::{CaptureFlags, UserState}};
    /// # use std::time::Duration;
    /// # fn grab(presenter: &Presenter) -> framepace::Result<()> {
    /// let capture = presenter.alloc_capture();
    /// presenter.start_capture(&capture, 320, 180, CaptureFlags::NONE)?;
    /// if capture.wait(Duration::from_secs(1)) == UserState::Done {
    ///     let bgra = capture.pixels();
    ///     assert_eq!(bgra.len(), 320 * 180 * 4);
    /// }
    /// presenter.release_capture(capture);
    /// # Ok(())
    /// # }
    /// ```
    pub fn wait(&self, timeout: Duration) -> UserState {
        self.request.waiters.fetch_add(1, Ordering::AcqRel);
        self.request.event.wait_for(timeout);
        self.request.waiters.fetch_sub(1, Ordering::AcqRel);
        self.user_state()
    }

    /// Last published result state.
    pub fn user_state(&self) -> UserState {
        self.request.inner.lock().user_state
    }

    /// Internal processing state.
    pub fn state(&self) -> CaptureState {
        self.request.inner.lock().state
    }

    /// Copy of the captured BGRA pixels.
    pub fn pixels(&self) -> Vec<u8> {
        self.request.inner.lock().target.pixels.clone()
    }

    /// Output width.
    pub fn width(&self) -> u32 {
        self.request.inner.lock().target.width
    }

    /// Output height.
    pub fn height(&self) -> u32 {
        self.request.inner.lock().target.height
    }

    /// Request flags.
    pub fn flags(&self) -> CaptureFlags {
        self.request.flags()
    }
}

/// The list of active capture requests.
///
/// Its mutex is the capture lock. It is taken before the backend lock,
/// never after.
#[derive(Debug, Default)]
pub(crate) struct CapturePipeline {
    requests: Mutex<HashMap<CaptureId, Arc<Request>>>,
}

impl CapturePipeline {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Number of listed requests.
    pub(crate) fn len(&self) -> usize {
        self.requests.lock().len()
    }

    /// Arms `handle` for a new cycle.
    pub(crate) fn start(
        &self,
        handle: &CaptureHandle,
        width: u32,
        height: u32,
        flags: CaptureFlags,
        on_consumer: bool,
        renderer: &dyn CaptureRenderer,
    ) {
        let request = &handle.request;
        let mut requests = self.requests.lock();
        let mut inner = request.inner.lock();
        inner.target = CaptureTarget::new(request.id, width, height, flags);
        inner.state = CaptureState::NeedsRender;
        inner.user_state = UserState::Working;
        request.event.reset();

        let immediate = flags.contains(CaptureFlags::IMMEDIATE);
        let continuous = flags.contains(CaptureFlags::CONTINUOUS);
        if on_consumer && immediate {
            render(renderer, &mut inner);
            if inner.state == CaptureState::NeedsReadout {
                read(renderer, &mut inner);
            }
            finish(request, &mut inner, renderer);
        }

        if !on_consumer || continuous || !immediate {
            requests.insert(request.id, request.clone());
        }
        debug!("Started {} ({width}x{height}, flags {:#x})", request.id, flags.0);
    }

    /// Fails `handle` without listing it, for captures the backend cannot
    /// serve.
    pub(crate) fn reject(
        &self,
        handle: &CaptureHandle,
        width: u32,
        height: u32,
        flags: CaptureFlags,
    ) {
        let request = &handle.request;
        let mut requests = self.requests.lock();
        requests.remove(&request.id);
        {
            let mut inner = request.inner.lock();
            inner.target = CaptureTarget::new(request.id, width, height, flags);
            inner.state = CaptureState::Failed;
            inner.user_state = UserState::Failed;
        }
        request.event.set();
        debug!("Rejected {}: capture unsupported", request.id);
    }

    /// Releases `handle`.
    ///
    /// On the consumer thread the request is dropped at once. Elsewhere it is
    /// marked for deletion and the next sweep drops it. Blocked readers are
    /// woken with [`UserState::Failed`] if no result was published.
    pub(crate) fn release(&self, handle: CaptureHandle, on_consumer: bool) {
        let request = handle.request;
        let mut requests = self.requests.lock();
        {
            let mut inner = request.inner.lock();
            inner.state = CaptureState::NeedsDelete;
            if inner.user_state == UserState::Working {
                inner.user_state = UserState::Failed;
            }
        }
        request.event.set();
        if on_consumer {
            requests.remove(&request.id);
        }
        debug!("Released {}", request.id);
    }

    /// Advances every listed request by one step.
    pub(crate) fn sweep(&self, renderer: &dyn CaptureRenderer) {
        let mut requests = self.requests.lock();
        requests.retain(|id, request| {
            let request: &Request = request;
            let mut inner = request.inner.lock();
            match inner.state {
                CaptureState::NeedsDelete => {
                    trace!("Dropping {id}");
                    return false;
                }
                CaptureState::NeedsRender => render(renderer, &mut inner),
                CaptureState::NeedsReadout => read(renderer, &mut inner),
                CaptureState::Done | CaptureState::Failed => {}
            }
            finish(request, &mut inner, renderer)
        });
    }

    /// Fails every pending request and wakes all readers, then empties the
    /// list.
    ///
    /// Loops until no reader is blocked on a listed request, so shutdown never
    /// leaves a reader waiting for a result that will not come.
    pub(crate) fn drain(&self) {
        loop {
            {
                let requests = self.requests.lock();
                let waiting = requests
                    .values()
                    .any(|request| request.waiters.load(Ordering::Acquire) > 0);
                if !waiting {
                    break;
                }
                for request in requests.values() {
                    fail_and_signal(request);
                }
            }
            thread::sleep(DRAIN_YIELD);
        }

        let mut requests = self.requests.lock();
        for request in requests.values() {
            fail_and_signal(request);
        }
        if !requests.is_empty() {
            debug!("Drained {} capture requests", requests.len());
        }
        requests.clear();
    }
}

fn fail_and_signal(request: &Request) {
    {
        let mut inner = request.inner.lock();
        if inner.user_state == UserState::Working {
            inner.user_state = UserState::Failed;
        }
    }
    request.event.set();
}

fn render(renderer: &dyn CaptureRenderer, inner: &mut RequestState) {
    if renderer.render(&mut inner.target) {
        inner.state = CaptureState::NeedsReadout;
        if !renderer.is_async() {
            read(renderer, inner);
        }
    } else {
        warn!("Rendering {} failed", inner.target.id);
        inner.state = CaptureState::Failed;
    }
}

fn read(renderer: &dyn CaptureRenderer, inner: &mut RequestState) {
    inner.state = if renderer.read(&mut inner.target) {
        CaptureState::Done
    } else {
        warn!("Reading back {} failed", inner.target.id);
        CaptureState::Failed
    };
}

/// Publishes a completed cycle. Returns `true` if the request stays listed.
fn finish(request: &Request, inner: &mut RequestState, renderer: &dyn CaptureRenderer) -> bool {
    let user_state = match inner.state {
        CaptureState::Done => UserState::Done,
        CaptureState::Failed => UserState::Failed,
        _ => return true,
    };
    inner.user_state = user_state;
    request.event.set();

    let flags = inner.target.flags;
    if !flags.contains(CaptureFlags::CONTINUOUS) {
        return false;
    }
    inner.state = CaptureState::NeedsRender;
    if renderer.is_async() && !flags.contains(CaptureFlags::IMMEDIATE) {
        render(renderer, inner);
    }
    true
}
