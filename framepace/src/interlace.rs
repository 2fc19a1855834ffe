// SPDX-FileCopyrightText: 2025 Contributors to the framepace project.
// SPDX-License-Identifier: Apache-2.0

//! Interlace-aware presentation method selection.
//!
//! The choice of how to show a frame is made when the frame is submitted,
//! not when it is flipped. [`select`] maps the user's deinterlace preferences
//! and the per-frame field hint onto a [`PresentMethod`] and the parity of
//! the field to show first.

use serde::{Deserialize, Serialize};

/// How a queued buffer is drawn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum PresentMethod {
    /// The whole frame in one display tick.
    #[default]
    Single,
    /// Each field in its own display tick, line-doubled.
    Bob,
    /// Each field in its own display tick, woven with the other field.
    Weave,
    /// Both fields blended into one display tick.
    Blend,
}

impl PresentMethod {
    /// Returns `true` for methods that spend two display ticks per buffer.
    pub fn is_field_sequential(&self) -> bool {
        matches!(self, PresentMethod::Bob | PresentMethod::Weave)
    }
}

/// Field parity of a picture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldSync {
    /// Progressive, or parity unknown.
    #[default]
    None,
    /// Top field (even lines) first.
    Top,
    /// Bottom field (odd lines) first.
    Bottom,
}

impl FieldSync {
    fn inverted(self) -> Self {
        match self {
            FieldSync::Bottom => FieldSync::Top,
            _ => FieldSync::Bottom,
        }
    }
}

/// When to deinterlace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeinterlaceMode {
    /// Never deinterlace.
    Off,
    /// Deinterlace frames that carry a field hint.
    #[default]
    Auto,
    /// Always deinterlace, assuming top field first when unknown.
    Force,
}

/// Preferred deinterlacing technique.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterlaceMethod {
    /// Let the pipeline decide (resolves to [`InterlaceMethod::RenderBob`]).
    #[default]
    Auto,
    /// No field handling at present time.
    None,
    /// Blend both fields.
    RenderBlend,
    /// Weave fields.
    RenderWeave,
    /// Weave fields with inverted parity.
    RenderWeaveInverted,
    /// Bob fields.
    RenderBob,
    /// Bob fields with inverted parity.
    RenderBobInverted,
    /// Hardware-assisted bob.
    HardwareBob,
    /// Best hardware deinterlacer, presented as bob.
    HardwareBest,
    /// Software deinterlacing upstream. Frames arrive progressive.
    Software,
}

/// Inputs for [`select`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterlacePolicy {
    /// User deinterlace mode.
    pub mode: DeinterlaceMode,
    /// User deinterlace technique.
    pub method: InterlaceMethod,
    /// Drop to [`DeinterlaceMode::Off`] while not in full-screen video.
    pub disable_background: bool,
}

/// Chooses the presentation method and first-field parity for one frame.
///
/// # Arguments
///
/// * `policy` - User preferences
/// * `sync` - Field hint carried by the frame
/// * `fullscreen` - Whether video currently owns the display
///
/// # Examples
///
/// ```
/// use framepace::interlace::*;
///
/// let policy = InterlacePolicy {
///     mode: DeinterlaceMode::Force,
///     method: InterlaceMethod::RenderBobInverted,
///     disable_background: false,
/// };
/// // Force defaults to top field first, then inversion swaps it.
/// assert_eq!(
///     select(&policy, FieldSync::None, true),
///     (PresentMethod::Bob, FieldSync::Bottom)
/// );
/// ```
pub fn select(
    policy: &InterlacePolicy,
    sync: FieldSync,
    fullscreen: bool,
) -> (PresentMethod, FieldSync) {
    let mut mode = policy.mode;
    if policy.disable_background && !fullscreen {
        mode = DeinterlaceMode::Off;
    }

    if mode == DeinterlaceMode::Off || (mode == DeinterlaceMode::Auto && sync == FieldSync::None)
    {
        return (PresentMethod::Single, sync);
    }

    let (method, invert) = match policy.method {
        InterlaceMethod::RenderBlend => (PresentMethod::Blend, false),
        InterlaceMethod::RenderWeave => (PresentMethod::Weave, false),
        InterlaceMethod::RenderWeaveInverted => (PresentMethod::Weave, true),
        InterlaceMethod::Auto | InterlaceMethod::RenderBob => (PresentMethod::Bob, false),
        InterlaceMethod::RenderBobInverted => (PresentMethod::Bob, true),
        InterlaceMethod::HardwareBob | InterlaceMethod::HardwareBest => {
            (PresentMethod::Bob, false)
        }
        InterlaceMethod::None | InterlaceMethod::Software => (PresentMethod::Single, false),
    };

    let mut field = sync;
    if mode == DeinterlaceMode::Force && field == FieldSync::None {
        field = FieldSync::Top;
    }
    if invert {
        field = field.inverted();
    }
    (method, field)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(mode: DeinterlaceMode, method: InterlaceMethod) -> InterlacePolicy {
        InterlacePolicy {
            mode,
            method,
            disable_background: false,
        }
    }

    #[test]
    fn off_is_single_and_keeps_parity() {
        let p = policy(DeinterlaceMode::Off, InterlaceMethod::RenderBob);
        assert_eq!(
            select(&p, FieldSync::Bottom, true),
            (PresentMethod::Single, FieldSync::Bottom)
        );
    }

    #[test]
    fn auto_without_hint_is_single() {
        let p = policy(DeinterlaceMode::Auto, InterlaceMethod::RenderWeave);
        assert_eq!(
            select(&p, FieldSync::None, true),
            (PresentMethod::Single, FieldSync::None)
        );
    }

    #[test]
    fn auto_with_hint_follows_method() {
        let p = policy(DeinterlaceMode::Auto, InterlaceMethod::RenderWeave);
        assert_eq!(
            select(&p, FieldSync::Bottom, true),
            (PresentMethod::Weave, FieldSync::Bottom)
        );
        let p = policy(DeinterlaceMode::Auto, InterlaceMethod::RenderBlend);
        assert_eq!(
            select(&p, FieldSync::Top, true),
            (PresentMethod::Blend, FieldSync::Top)
        );
        let p = policy(DeinterlaceMode::Auto, InterlaceMethod::HardwareBest);
        assert_eq!(select(&p, FieldSync::Top, true).0, PresentMethod::Bob);
        let p = policy(DeinterlaceMode::Auto, InterlaceMethod::Software);
        assert_eq!(select(&p, FieldSync::Top, true).0, PresentMethod::Single);
    }

    #[test]
    fn inverted_variants_swap_parity() {
        let p = policy(DeinterlaceMode::Auto, InterlaceMethod::RenderWeaveInverted);
        assert_eq!(
            select(&p, FieldSync::Bottom, true),
            (PresentMethod::Weave, FieldSync::Top)
        );
        assert_eq!(
            select(&p, FieldSync::Top, true),
            (PresentMethod::Weave, FieldSync::Bottom)
        );
    }

    #[test]
    fn force_defaults_to_top() {
        let p = policy(DeinterlaceMode::Force, InterlaceMethod::RenderBob);
        assert_eq!(
            select(&p, FieldSync::None, true),
            (PresentMethod::Bob, FieldSync::Top)
        );
    }

    #[test]
    fn background_deinterlace_can_be_disabled() {
        let p = InterlacePolicy {
            disable_background: true,
            ..policy(DeinterlaceMode::Force, InterlaceMethod::RenderBob)
        };
        assert_eq!(select(&p, FieldSync::Top, false).0, PresentMethod::Single);
        assert_eq!(select(&p, FieldSync::Top, true).0, PresentMethod::Bob);
    }
}
