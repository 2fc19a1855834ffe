// SPDX-FileCopyrightText: 2025 Contributors to the framepace project.
// SPDX-License-Identifier: Apache-2.0

//! In-memory backend.
//!
//! Keeps uploaded pictures in plain byte buffers and records every call it
//! receives. Nothing reaches a screen. Captures are real: the current
//! picture is scaled (nearest neighbour) and converted to BGRA.
//!
//! A [`SoftwareProbe`] taken before the backend is handed to a registry
//! keeps observing it afterwards.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{
    Error, Result,
    backend::{BufferInfo, Capability, CaptureTarget, RenderBackend, RenderFlags},
    capture::CaptureId,
    config::{PixelFormat, VideoConfig},
    picture::VideoPicture,
    pool::SlotIndex,
};

/// One recorded `render_update` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderCall {
    /// Slot flipped in at the time of the call.
    pub slot: Option<SlotIndex>,
    /// Clear flag.
    pub clear: bool,
    /// Field flags.
    pub flags: RenderFlags,
    /// Opacity.
    pub alpha: u8,
}

#[derive(Debug, Default)]
struct ProbeState {
    configures: usize,
    buffer_count: usize,
    uploads: Vec<SlotIndex>,
    flips: Vec<SlotIndex>,
    renders: Vec<RenderCall>,
    released: Vec<SlotIndex>,
    flushes: usize,
    captures_rendered: usize,
    captures_read: usize,
}

/// Shared view of the calls a [`SoftwareBackend`] received.
#[derive(Debug, Clone, Default)]
pub struct SoftwareProbe {
    state: Arc<Mutex<ProbeState>>,
}

impl SoftwareProbe {
    /// Number of successful `configure` calls.
    pub fn configures(&self) -> usize {
        self.state.lock().configures
    }

    /// Last buffer count set.
    pub fn buffer_count(&self) -> usize {
        self.state.lock().buffer_count
    }

    /// Uploaded slots, in call order.
    pub fn uploads(&self) -> Vec<SlotIndex> {
        self.state.lock().uploads.clone()
    }

    /// Flipped slots, in call order.
    pub fn flips(&self) -> Vec<SlotIndex> {
        self.state.lock().flips.clone()
    }

    /// Draw calls, in call order.
    pub fn renders(&self) -> Vec<RenderCall> {
        self.state.lock().renders.clone()
    }

    /// Released slots, in call order.
    pub fn released(&self) -> Vec<SlotIndex> {
        self.state.lock().released.clone()
    }

    /// Number of `flush` calls.
    pub fn flushes(&self) -> usize {
        self.state.lock().flushes
    }

    /// Number of successful `render_capture` calls.
    pub fn captures_rendered(&self) -> usize {
        self.state.lock().captures_rendered
    }

    /// Number of successful `read_capture` calls.
    pub fn captures_read(&self) -> usize {
        self.state.lock().captures_read
    }

    /// Forgets recorded draw calls.
    pub fn clear_renders(&self) {
        self.state.lock().renders.clear();
    }
}

/// Backend over CPU memory.
#[derive(Debug)]
pub struct SoftwareBackend {
    config: Option<VideoConfig>,
    info: BufferInfo,
    buffers: Vec<Option<VideoPicture>>,
    shown: Option<SlotIndex>,
    history: VecDeque<SlotIndex>,
    reference_frames: usize,
    capture: bool,
    async_capture: bool,
    staged: HashMap<CaptureId, Vec<u8>>,
    probe: SoftwareProbe,
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareBackend {
    /// Formats registered by
    /// [`BackendRegistry::with_defaults`](crate::backend::BackendRegistry::with_defaults).
    pub const FORMATS: [PixelFormat; 4] = [
        PixelFormat::Yuv420p,
        PixelFormat::Nv12,
        PixelFormat::Yuyv422,
        PixelFormat::Bgra,
    ];

    /// Optimal buffer count reported by default.
    pub const DEFAULT_OPTIMAL_BUFFERS: usize = 4;

    /// Maximum buffer count reported by default.
    pub const DEFAULT_MAX_BUFFERS: usize = 8;

    /// Creates an unconfigured backend with synchronous capture.
    pub fn new() -> Self {
        Self {
            config: None,
            info: BufferInfo {
                optimal: Self::DEFAULT_OPTIMAL_BUFFERS,
                max: Self::DEFAULT_MAX_BUFFERS,
            },
            buffers: Vec::new(),
            shown: None,
            history: VecDeque::new(),
            reference_frames: 0,
            capture: true,
            async_capture: false,
            staged: HashMap::new(),
            probe: SoftwareProbe::default(),
        }
    }

    /// Overrides the reported buffer requirements.
    pub fn with_buffer_info(mut self, optimal: usize, max: usize) -> Self {
        self.info = BufferInfo { optimal, max };
        self
    }

    /// Keeps the last `frames` replaced buffers referenced, like a temporal
    /// deinterlacer would.
    pub fn with_reference_frames(mut self, frames: usize) -> Self {
        self.reference_frames = frames;
        self
    }

    /// Completes capture readback one step after rendering.
    pub fn with_async_capture(mut self, async_capture: bool) -> Self {
        self.async_capture = async_capture;
        self
    }

    /// Disables [`Capability::Capture`].
    pub fn without_capture(mut self) -> Self {
        self.capture = false;
        self
    }

    /// Reports to an existing probe, so backends created later by a registry
    /// factory can be observed.
    pub fn with_probe(mut self, probe: SoftwareProbe) -> Self {
        self.probe = probe;
        self
    }

    /// A handle observing this backend's calls.
    pub fn probe(&self) -> SoftwareProbe {
        self.probe.clone()
    }

    fn shown_picture(&self) -> Option<&VideoPicture> {
        self.shown
            .and_then(|slot| self.buffers.get(slot.0))
            .and_then(Option::as_ref)
    }

    fn scale_into(&self, width: u32, height: u32, out: &mut [u8]) {
        let Some(picture) = self.shown_picture() else {
            for px in out.chunks_exact_mut(4) {
                px.copy_from_slice(&[0, 0, 0, 255]);
            }
            return;
        };
        let (w, h) = (width.max(1) as u64, height.max(1) as u64);
        for (i, px) in out.chunks_exact_mut(4).enumerate() {
            let (x, y) = (i as u64 % w, i as u64 / w);
            let sx = (x * picture.width as u64 / w) as u32;
            let sy = (y * picture.height as u64 / h) as u32;
            px.copy_from_slice(&picture.bgra_at(sx, sy));
        }
    }
}

impl RenderBackend for SoftwareBackend {
    fn name(&self) -> &str {
        "software"
    }

    fn configure(&mut self, config: &VideoConfig) -> Result<BufferInfo> {
        if !Self::FORMATS.contains(&config.format) {
            return Err(Error::Backend(format!(
                "Software backend cannot present {:?}.",
                config.format
            )));
        }
        config.validate()?;
        debug!(
            "Software backend configured for {}x{} {:?}",
            config.width, config.height, config.format
        );
        self.config = Some(config.clone());
        self.shown = None;
        self.history.clear();
        self.staged.clear();
        self.probe.state.lock().configures += 1;
        Ok(self.info)
    }

    fn upload(&mut self, slot: SlotIndex, picture: &VideoPicture) -> Result<()> {
        let config = self.config.as_ref().ok_or(Error::NotConfigured)?;
        if picture.format != config.format {
            return Err(Error::InvalidArg(format!(
                "Picture format {:?} does not match configured {:?}.",
                picture.format, config.format
            )));
        }
        let buffer = self
            .buffers
            .get_mut(slot.0)
            .ok_or_else(|| Error::InvalidArg(format!("No backend buffer for {slot}.")))?;
        *buffer = Some(picture.clone());
        self.probe.state.lock().uploads.push(slot);
        Ok(())
    }

    fn set_buffer_count(&mut self, count: usize) {
        self.buffers.clear();
        self.buffers.resize(count, None);
        self.probe.state.lock().buffer_count = count;
    }

    fn flip(&mut self, slot: SlotIndex) {
        trace!("Software backend flip to {slot}");
        self.shown = Some(slot);
        self.history.push_back(slot);
        while self.history.len() > self.reference_frames + 1 {
            self.history.pop_front();
        }
        self.probe.state.lock().flips.push(slot);
    }

    fn render_update(&mut self, clear: bool, flags: RenderFlags, alpha: u8) {
        self.probe.state.lock().renders.push(RenderCall {
            slot: self.shown,
            clear,
            flags,
            alpha,
        });
    }

    fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Capture => self.capture,
            Capability::Rotation | Capability::Bob | Capability::Weave | Capability::Blend => {
                true
            }
            Capability::Stereo => false,
        }
    }

    fn needs_buffer_for_reference(&self, slot: SlotIndex) -> bool {
        // The newest history entry is the one on screen.
        let replaced = self.history.len().saturating_sub(1);
        self.history.iter().take(replaced).any(|&s| s == slot)
    }

    fn release_buffer(&mut self, slot: SlotIndex) {
        if let Some(buffer) = self.buffers.get_mut(slot.0) {
            *buffer = None;
        }
        self.probe.state.lock().released.push(slot);
    }

    fn flush(&mut self) {
        self.history.clear();
        self.staged.clear();
        self.probe.state.lock().flushes += 1;
    }

    fn render_capture(&mut self, target: &mut CaptureTarget) -> bool {
        if !self.capture || self.config.is_none() {
            return false;
        }
        let mut pixels = vec![0; target.pixels.len()];
        self.scale_into(target.width, target.height, &mut pixels);
        if self.async_capture {
            self.staged.insert(target.id, pixels);
        } else {
            target.pixels = pixels;
        }
        self.probe.state.lock().captures_rendered += 1;
        true
    }

    fn read_capture(&mut self, target: &mut CaptureTarget) -> bool {
        if self.async_capture {
            let Some(pixels) = self.staged.remove(&target.id) else {
                return false;
            };
            target.pixels = pixels;
        }
        self.probe.state.lock().captures_read += 1;
        true
    }

    fn capture_is_async(&self) -> bool {
        self.async_capture
    }
}

#[cfg(test)]
mod tests {
    use crate::capture::CaptureFlags;

    use super::*;

    fn configured(buffers: usize) -> SoftwareBackend {
        let mut backend = SoftwareBackend::new();
        backend
            .configure(&VideoConfig::new(2, 2, 25.0, PixelFormat::Bgra))
            .unwrap();
        backend.set_buffer_count(buffers);
        backend
    }

    fn solid(bgra: [u8; 4]) -> VideoPicture {
        VideoPicture::new(PixelFormat::Bgra, 2, 2, bgra.repeat(4)).unwrap()
    }

    #[test]
    fn rejects_hardware_format() {
        let mut backend = SoftwareBackend::new();
        let config = VideoConfig::new(2, 2, 25.0, PixelFormat::Hardware);
        assert!(matches!(backend.configure(&config), Err(Error::Backend(_))));
    }

    #[test]
    fn upload_checks_slot_and_format() {
        let mut backend = configured(2);
        assert!(backend.upload(SlotIndex(1), &solid([1, 2, 3, 255])).is_ok());
        assert!(backend.upload(SlotIndex(2), &solid([1, 2, 3, 255])).is_err());
        let yuv = VideoPicture::blank(PixelFormat::Yuv420p, 2, 2);
        assert!(backend.upload(SlotIndex(0), &yuv).is_err());
    }

    #[test]
    fn reference_history() {
        let mut backend = configured(4).with_reference_frames(1);
        backend.flip(SlotIndex(1));
        assert!(!backend.needs_buffer_for_reference(SlotIndex(1)));
        backend.flip(SlotIndex(2));
        assert!(backend.needs_buffer_for_reference(SlotIndex(1)));
        backend.flip(SlotIndex(3));
        assert!(!backend.needs_buffer_for_reference(SlotIndex(1)));
        assert!(backend.needs_buffer_for_reference(SlotIndex(2)));
    }

    #[test]
    fn sync_capture_scales_current_picture() {
        let mut backend = configured(2);
        backend.upload(SlotIndex(1), &solid([10, 20, 30, 255])).unwrap();
        backend.flip(SlotIndex(1));
        let mut target = CaptureTarget::new(CaptureId::new(), 3, 1, CaptureFlags::NONE);
        assert!(backend.render_capture(&mut target));
        assert!(backend.read_capture(&mut target));
        assert_eq!(target.pixels, [10, 20, 30, 255].repeat(3));
    }

    #[test]
    fn async_capture_needs_render_first() {
        let mut backend = configured(2).with_async_capture(true);
        let mut target = CaptureTarget::new(CaptureId::new(), 1, 1, CaptureFlags::NONE);
        assert!(!backend.read_capture(&mut target));
        assert!(backend.render_capture(&mut target));
        // Nothing flipped yet: opaque black.
        assert!(backend.read_capture(&mut target));
        assert_eq!(target.pixels, vec![0, 0, 0, 255]);
    }

    #[test]
    fn probe_records_calls() {
        let mut backend = configured(2);
        let probe = backend.probe();
        backend.flip(SlotIndex(1));
        backend.render_update(true, RenderFlags::NONE, 255);
        backend.release_buffer(SlotIndex(0));
        backend.flush();
        assert_eq!(probe.flips(), vec![SlotIndex(1)]);
        assert_eq!(probe.renders()[0].slot, Some(SlotIndex(1)));
        assert_eq!(probe.released(), vec![SlotIndex(0)]);
        assert_eq!(probe.flushes(), 1);
        assert_eq!(probe.buffer_count(), 2);
    }
}
