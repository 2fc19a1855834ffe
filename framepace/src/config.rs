// SPDX-FileCopyrightText: 2025 Contributors to the framepace project.
// SPDX-License-Identifier: Apache-2.0

//! Configuration snapshot and tunables.
//!
//! [`VideoConfig`] is what the producer hands to
//! [`Presenter::configure`](crate::Presenter::configure) whenever the stream
//! geometry or format changes. [`PresenterSettings`] holds the timeouts and
//! policy knobs. It is serde-friendly so hosts can load it from their own
//! configuration files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    Error, Result,
    interlace::{DeinterlaceMode, InterlaceMethod},
};

/// Pixel layout of decoded pictures.
///
/// Backends are selected by this value through the
/// [`BackendRegistry`](crate::backend::BackendRegistry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Planar 4:2:0, 8 bit (Y, U, V planes).
    Yuv420p,
    /// Semi-planar 4:2:0, 8 bit (Y plane, interleaved UV plane).
    Nv12,
    /// Packed 4:2:2, 8 bit.
    Yuyv422,
    /// Packed 8-bit BGRA.
    Bgra,
    /// Hardware surface handed over by a GPU decoder. No pixels in memory.
    Hardware,
}

impl PixelFormat {
    /// Returns the number of bytes one picture of this format occupies.
    ///
    /// Returns `None` for [`PixelFormat::Hardware`], which has no CPU-side
    /// representation.
    pub fn frame_size(&self, width: u32, height: u32) -> Option<usize> {
        let (w, h) = (width as usize, height as usize);
        match self {
            PixelFormat::Yuv420p | PixelFormat::Nv12 => {
                Some(w * h + 2 * (w.div_ceil(2) * h.div_ceil(2)))
            }
            PixelFormat::Yuyv422 => Some(w.div_ceil(2) * 4 * h),
            PixelFormat::Bgra => Some(w * h * 4),
            PixelFormat::Hardware => None,
        }
    }
}

/// Display rotation requested by the stream, in degrees clockwise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Orientation {
    /// No rotation.
    #[default]
    Deg0,
    /// Rotate 90 degrees.
    Deg90,
    /// Rotate 180 degrees.
    Deg180,
    /// Rotate 270 degrees.
    Deg270,
}

impl TryFrom<u32> for Orientation {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value % 360 {
            0 => Ok(Orientation::Deg0),
            90 => Ok(Orientation::Deg90),
            180 => Ok(Orientation::Deg180),
            270 => Ok(Orientation::Deg270),
            other => Err(Error::InvalidArg(format!(
                "Orientation must be a multiple of 90 degrees, got {other}."
            ))),
        }
    }
}

/// Stream configuration flags.
///
/// Raw bit set, combined with `|`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfigFlags(pub u32);

impl ConfigFlags {
    /// No flags.
    pub const NONE: ConfigFlags = ConfigFlags(0);
    /// The stream is interlaced.
    pub const INTERLACED: ConfigFlags = ConfigFlags(0x01);
    /// Top field first (only meaningful with `INTERLACED`).
    pub const TOP_FIELD_FIRST: ConfigFlags = ConfigFlags(0x02);
    /// The producer requests full-screen video.
    pub const FULLSCREEN: ConfigFlags = ConfigFlags(0x04);
    /// The stream is stereoscopic.
    pub const STEREO: ConfigFlags = ConfigFlags(0x08);

    /// Returns `true` if every bit of `other` is set in `self`.
    pub fn contains(self, other: ConfigFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ConfigFlags {
    type Output = ConfigFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        ConfigFlags(self.0 | rhs.0)
    }
}

/// Snapshot of the stream parameters at (re)configuration time.
///
/// Captured atomically by [`Presenter::configure`](crate::Presenter::configure).
/// It drives backend (re)creation and buffer pool sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoConfig {
    /// Coded picture width in pixels.
    pub width: u32,
    /// Coded picture height in pixels.
    pub height: u32,
    /// Display (aspect-corrected) width.
    pub display_width: u32,
    /// Display (aspect-corrected) height.
    pub display_height: u32,
    /// Nominal stream frame rate.
    pub fps: f64,
    /// Stream flags.
    pub flags: ConfigFlags,
    /// Decoded pixel format.
    pub format: PixelFormat,
    /// Display rotation.
    pub orientation: Orientation,
    /// Requested buffer count. `0` selects the backend's optimum.
    pub buffers: usize,
}

impl VideoConfig {
    /// Creates a progressive configuration with display size equal to the
    /// coded size and a backend-chosen buffer count.
    pub fn new(width: u32, height: u32, fps: f64, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            display_width: width,
            display_height: height,
            fps,
            flags: ConfigFlags::NONE,
            format,
            orientation: Orientation::Deg0,
            buffers: 0,
        }
    }

    /// Sets the requested buffer count.
    pub fn with_buffers(mut self, buffers: usize) -> Self {
        self.buffers = buffers;
        self
    }

    /// Sets the stream flags.
    pub fn with_flags(mut self, flags: ConfigFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Checks that dimensions and frame rate are usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArg`] for zero dimensions or a non-positive /
    /// non-finite frame rate.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::InvalidArg(format!(
                "Picture size {}x{} is empty.",
                self.width, self.height
            )));
        }
        if !self.fps.is_finite() || self.fps <= 0.0 {
            return Err(Error::InvalidArg(format!(
                "Frame rate {} is not positive.",
                self.fps
            )));
        }
        Ok(())
    }
}

/// Default wait for the state machine to go idle before reconfiguring.
pub const DEFAULT_CONFIGURE_TIMEOUT_MS: u64 = 5000;

/// Default wait for the consumer to acknowledge a flush.
pub const DEFAULT_FLUSH_TIMEOUT_MS: u64 = 1000;

/// Default bound on how far in the future a timestamp may lie.
pub const DEFAULT_LATE_SLACK_MS: u64 = 5000;

/// Tunables for the presenter.
///
/// Every field has a default, so a partial JSON document is valid:
///
/// ```
/// use framepace::PresenterSettings;
///
/// let settings: PresenterSettings =
///     serde_json::from_str(r#"{ "flush_timeout_ms": 250 }"#).unwrap();
/// assert_eq!(settings.flush_timeout_ms, 250);
/// assert_eq!(settings.configure_timeout_ms, 5000);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenterSettings {
    /// Bound on waiting for the previous presentation to finish before
    /// applying a new configuration.
    pub configure_timeout_ms: u64,
    /// Bound on waiting for the consumer to acknowledge a flush.
    pub flush_timeout_ms: u64,
    /// Timestamps further than this beyond "now" are clamped.
    pub late_slack_ms: u64,
    /// Longest sleep in `wait_for_buffer` while the UI is inactive.
    pub inactive_sleep_cap_ms: u64,
    /// Poll interval for condition waits that also watch a stop flag.
    pub wait_poll_ms: u64,
    /// Skip deinterlacing while video is not full-screen.
    pub disable_background_deinterlace: bool,
    /// Initial deinterlace mode.
    pub deinterlace_mode: DeinterlaceMode,
    /// Initial interlace method preference.
    pub interlace_method: InterlaceMethod,
}

impl Default for PresenterSettings {
    fn default() -> Self {
        Self {
            configure_timeout_ms: DEFAULT_CONFIGURE_TIMEOUT_MS,
            flush_timeout_ms: DEFAULT_FLUSH_TIMEOUT_MS,
            late_slack_ms: DEFAULT_LATE_SLACK_MS,
            inactive_sleep_cap_ms: 20,
            wait_poll_ms: 50,
            disable_background_deinterlace: false,
            deinterlace_mode: DeinterlaceMode::Auto,
            interlace_method: InterlaceMethod::Auto,
        }
    }
}

impl PresenterSettings {
    pub(crate) fn configure_timeout(&self) -> Duration {
        Duration::from_millis(self.configure_timeout_ms)
    }

    pub(crate) fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub(crate) fn late_slack(&self) -> Duration {
        Duration::from_millis(self.late_slack_ms)
    }

    pub(crate) fn inactive_sleep_cap(&self) -> Duration {
        Duration::from_millis(self.inactive_sleep_cap_ms)
    }

    pub(crate) fn wait_poll(&self) -> Duration {
        Duration::from_millis(self.wait_poll_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_sizes() {
        assert_eq!(PixelFormat::Yuv420p.frame_size(4, 2), Some(8 + 2 * 2));
        assert_eq!(PixelFormat::Nv12.frame_size(3, 3), Some(9 + 2 * 4));
        assert_eq!(PixelFormat::Yuyv422.frame_size(4, 1), Some(8));
        assert_eq!(PixelFormat::Bgra.frame_size(2, 2), Some(16));
        assert_eq!(PixelFormat::Hardware.frame_size(2, 2), None);
    }

    #[test]
    fn orientation_from_degrees() {
        assert_eq!(Orientation::try_from(450).unwrap(), Orientation::Deg90);
        assert!(Orientation::try_from(45).is_err());
    }

    #[test]
    fn validate_rejects_empty_and_bad_rate() {
        assert!(VideoConfig::new(0, 10, 25.0, PixelFormat::Bgra).validate().is_err());
        assert!(VideoConfig::new(10, 10, 0.0, PixelFormat::Bgra).validate().is_err());
        assert!(VideoConfig::new(10, 10, f64::NAN, PixelFormat::Bgra).validate().is_err());
        assert!(VideoConfig::new(10, 10, 25.0, PixelFormat::Bgra).validate().is_ok());
    }

    #[test]
    fn flags_combine() {
        let flags = ConfigFlags::INTERLACED | ConfigFlags::TOP_FIELD_FIRST;
        assert!(flags.contains(ConfigFlags::INTERLACED));
        assert!(!flags.contains(ConfigFlags::FULLSCREEN));
    }
}
