// SPDX-FileCopyrightText: 2025 Contributors to the framepace project.
// SPDX-License-Identifier: Apache-2.0

//! Display backend contract.
//!
//! The presenter never draws anything itself. It drives a [`RenderBackend`]
//! that owns the GPU (or CPU) side of each buffer slot:
//!
//! - **Configuration**: [`RenderBackend::configure`] reports how many
//!   buffers the backend prefers and tolerates ([`BufferInfo`]).
//! - **Upload**: decoded pictures are copied into a slot before it is queued.
//! - **Flip and draw**: once per display tick the due slot is flipped in and
//!   drawn, once per field for field-sequential methods.
//! - **Reclaim**: a replaced slot may still be referenced (for instance by a
//!   temporal deinterlacer). It is only released once
//!   [`needs_buffer_for_reference`](RenderBackend::needs_buffer_for_reference)
//!   says so.
//! - **Capture**: optional off-screen rendering into a [`CaptureTarget`].
//!
//! Backends are created through a [`BackendRegistry`] keyed by
//! [`PixelFormat`]. Platform backends are added by the host:
//!
//! ```no_run
//! use framepace::backend::BackendRegistry;
//!
//! let mut registry = BackendRegistry::with_defaults();
//! #[cfg(target_os = "linux")]
//! {
//!     // registry.register(PixelFormat::Hardware, || Box::new(VaapiBackend::new()));
//! }
//! # let _ = &mut registry;
//! ```

pub mod software;

use std::{collections::HashMap, fmt, ops::BitOr, sync::Arc};

use tracing::debug;

use crate::{
    Error, Result,
    capture::{CaptureFlags, CaptureId},
    config::{PixelFormat, VideoConfig},
    picture::VideoPicture,
    pool::SlotIndex,
};

pub use software::{RenderCall, SoftwareBackend, SoftwareProbe};

/// Buffer requirements reported by a configured backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    /// Buffer count used when the stream does not request one.
    pub optimal: usize,
    /// Largest buffer count the backend can hold.
    pub max: usize,
}

/// Optional backend features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Off-screen rendering for [`capture`](crate::capture).
    Capture,
    /// Rotated output.
    Rotation,
    /// Stereoscopic output.
    Stereo,
    /// Field-sequential line-doubled drawing.
    Bob,
    /// Field-sequential woven drawing.
    Weave,
    /// Blended field drawing.
    Blend,
}

/// Field selection flags passed to [`RenderBackend::render_update`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RenderFlags(pub u32);

impl RenderFlags {
    /// Whole frame.
    pub const NONE: RenderFlags = RenderFlags(0);
    /// Draw the top field.
    pub const TOP: RenderFlags = RenderFlags(0x01);
    /// Draw the bottom field.
    pub const BOTTOM: RenderFlags = RenderFlags(0x02);
    /// First field of the frame.
    pub const FIELD0: RenderFlags = RenderFlags(0x04);
    /// Second field of the frame.
    pub const FIELD1: RenderFlags = RenderFlags(0x08);
    /// Weave the drawn field with the other one.
    pub const WEAVE: RenderFlags = RenderFlags(0x10);
    /// Do not draw overlays on this pass.
    pub const NO_OSD: RenderFlags = RenderFlags(0x20);

    /// Returns `true` if every bit of `other` is set in `self`.
    pub fn contains(self, other: RenderFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for RenderFlags {
    type Output = RenderFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        RenderFlags(self.0 | rhs.0)
    }
}

/// Backend-facing view of a capture request.
///
/// `pixels` is BGRA, `width * height * 4` bytes, rows top to bottom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureTarget {
    /// Request identifier.
    pub id: CaptureId,
    /// Output width.
    pub width: u32,
    /// Output height.
    pub height: u32,
    /// Request flags.
    pub flags: CaptureFlags,
    /// Output pixels.
    pub pixels: Vec<u8>,
}

impl CaptureTarget {
    /// Creates a target with a zeroed pixel buffer.
    pub fn new(id: CaptureId, width: u32, height: u32, flags: CaptureFlags) -> Self {
        Self {
            id,
            width,
            height,
            flags,
            pixels: vec![0; width as usize * height as usize * 4],
        }
    }

    /// Bytes per row.
    pub fn stride(&self) -> usize {
        self.width as usize * 4
    }
}

/// A display backend.
///
/// All methods are called with the presenter's configuration lock held.
/// Methods other than `configure`, `upload`, `set_buffer_count` and
/// `supports` are only called from the consumer thread.
pub trait RenderBackend: Send {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Applies a stream configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Backend`] if the backend cannot present `config`.
    fn configure(&mut self, config: &VideoConfig) -> Result<BufferInfo>;

    /// Copies a decoded picture into `slot`.
    fn upload(&mut self, slot: SlotIndex, picture: &VideoPicture) -> Result<()>;

    /// Informs the backend of the final pool size.
    fn set_buffer_count(&mut self, count: usize);

    /// Makes `slot` the buffer drawn by subsequent `render_update` calls.
    fn flip(&mut self, slot: SlotIndex);

    /// Draws the flipped buffer.
    ///
    /// # Arguments
    ///
    /// * `clear` - Clear the target before drawing
    /// * `flags` - Field selection
    /// * `alpha` - Opacity, 255 is opaque
    fn render_update(&mut self, clear: bool, flags: RenderFlags, alpha: u8);

    /// Returns `true` if the backend implements `capability`.
    fn supports(&self, capability: Capability) -> bool;

    /// Returns `true` while a replaced buffer is still read by the backend.
    fn needs_buffer_for_reference(&self, _slot: SlotIndex) -> bool {
        false
    }

    /// Drops backend resources tied to a reclaimed slot.
    fn release_buffer(&mut self, _slot: SlotIndex) {}

    /// Drops backend-side queued state after a pipeline flush.
    fn flush(&mut self) {}

    /// Renders the current picture off-screen into `target`.
    ///
    /// Returns `false` on failure.
    fn render_capture(&mut self, _target: &mut CaptureTarget) -> bool {
        false
    }

    /// Reads back the pixels of a rendered capture into `target`.
    ///
    /// Returns `false` on failure.
    fn read_capture(&mut self, _target: &mut CaptureTarget) -> bool {
        false
    }

    /// Returns `true` if readback completes a tick after rendering.
    ///
    /// Continuous captures are then rendered again right after readout, so
    /// one capture is always in flight.
    fn capture_is_async(&self) -> bool {
        false
    }
}

/// Creates a backend instance.
pub type BackendFactory = Arc<dyn Fn() -> Box<dyn RenderBackend> + Send + Sync>;

/// Pixel format to backend factory table.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    factories: HashMap<PixelFormat, BackendFactory>,
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("formats", &self.formats())
            .finish()
    }
}

impl BackendRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the [`SoftwareBackend`] for every CPU format.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for format in SoftwareBackend::FORMATS {
            registry.register(format, || Box::new(SoftwareBackend::new()));
        }
        registry
    }

    /// Registers `factory` for `format`, replacing any previous entry.
    pub fn register<F>(&mut self, format: PixelFormat, factory: F)
    where
        F: Fn() -> Box<dyn RenderBackend> + Send + Sync + 'static,
    {
        if self.factories.insert(format, Arc::new(factory)).is_some() {
            debug!("Replaced backend factory for {format:?}");
        }
    }

    /// Removes the factory for `format`.
    pub fn unregister(&mut self, format: PixelFormat) -> bool {
        self.factories.remove(&format).is_some()
    }

    /// Creates a backend for `format`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoBackend`] if nothing is registered for `format`.
    pub fn create(&self, format: PixelFormat) -> Result<Box<dyn RenderBackend>> {
        let factory = self.factories.get(&format).ok_or(Error::NoBackend(format))?;
        Ok(factory())
    }

    /// Returns `true` if a backend is registered for `format`.
    pub fn contains(&self, format: PixelFormat) -> bool {
        self.factories.contains_key(&format)
    }

    /// Registered formats, in no particular order.
    pub fn formats(&self) -> Vec<PixelFormat> {
        self.factories.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_flags_combine() {
        let flags = RenderFlags::TOP | RenderFlags::FIELD0 | RenderFlags::WEAVE;
        assert!(flags.contains(RenderFlags::TOP | RenderFlags::WEAVE));
        assert!(!flags.contains(RenderFlags::BOTTOM));
        assert!(flags.contains(RenderFlags::NONE));
    }

    #[test]
    fn defaults_cover_cpu_formats() {
        let registry = BackendRegistry::with_defaults();
        assert!(registry.contains(PixelFormat::Yuv420p));
        assert!(registry.contains(PixelFormat::Bgra));
        assert!(!registry.contains(PixelFormat::Hardware));
        assert!(matches!(
            registry.create(PixelFormat::Hardware),
            Err(Error::NoBackend(PixelFormat::Hardware))
        ));
        assert_eq!(registry.create(PixelFormat::Nv12).unwrap().name(), "software");
    }

    #[test]
    fn register_and_unregister() {
        let mut registry = BackendRegistry::new();
        registry.register(PixelFormat::Hardware, || Box::new(SoftwareBackend::new()));
        assert!(registry.create(PixelFormat::Hardware).is_ok());
        assert!(registry.unregister(PixelFormat::Hardware));
        assert!(registry.formats().is_empty());
    }

    #[test]
    fn capture_target_is_bgra() {
        let target = CaptureTarget::new(CaptureId::new(), 4, 3, CaptureFlags::NONE);
        assert_eq!(target.pixels.len(), 48);
        assert_eq!(target.stride(), 16);
    }
}
