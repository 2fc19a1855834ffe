// SPDX-FileCopyrightText: 2025 Contributors to the framepace project.
// SPDX-License-Identifier: Apache-2.0

//! Error types for presentation operations.
//!
//! Errors fall into three families. Callers are expected to treat them very
//! differently:
//!
//! - **Backpressure** ([`Error::NoFreeBuffer`], [`Error::QueueEmpty`]): a
//!   resource is temporarily exhausted. Retry, back off or drop the frame.
//! - **Timeout** ([`Error::Timeout`]): an acknowledgment did not arrive in
//!   time. The pipeline stays in its last known-good state.
//! - **Backend failure** ([`Error::NoBackend`], [`Error::Backend`],
//!   [`Error::NotConfigured`]): the pipeline is unconfigured and the caller
//!   must pick a fallback.
//!
//! Internal invariant violations are never returned. They are logged and
//! ignored so the display loop keeps running.

use crate::config::PixelFormat;

/// Convenience result type using [`Error`] as the error variant.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors that can occur when driving the presentation pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No buffer slot is free. The producer should retry or drop the frame.
    #[error("No free buffer")]
    NoFreeBuffer,

    /// The presentation queue was empty when data was expected.
    #[error("Queue empty")]
    QueueEmpty,

    /// A bounded wait expired before the awaited condition was met.
    #[error("Timeout waiting for {what}")]
    Timeout {
        /// Short description of what was being waited for.
        what: &'static str,
    },

    /// The pipeline has not been configured, or its backend was torn down.
    #[error("Not configured")]
    NotConfigured,

    /// No registered backend can present the requested pixel format.
    #[error("No backend available for format {0:?}")]
    NoBackend(PixelFormat),

    /// The backend refused an operation (for example a configuration).
    #[error("Backend error: {0}")]
    Backend(String),

    /// An argument was outside its valid range.
    #[error("Invalid argument: {0}")]
    InvalidArg(String),

    /// The caller's stop flag was raised while waiting.
    #[error("Stopped")]
    Stopped,
}

impl Error {
    /// Returns `true` for errors that signal temporary resource exhaustion.
    ///
    /// Backpressure is part of normal operation. A producer seeing it should
    /// retry after a short wait, or drop the frame, and never tear the
    /// pipeline down.
    ///
    /// # Examples
    ///
    /// ```
    /// use framepace::Error;
    ///
    /// assert!(Error::NoFreeBuffer.is_backpressure());
    /// assert!(!Error::NotConfigured.is_backpressure());
    /// ```
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Error::NoFreeBuffer | Error::QueueEmpty)
    }

    /// Returns `true` if this error came from a bounded wait expiring.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}
