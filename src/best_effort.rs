//! Record-and-continue results for best-effort operations.
//!
//! Signaling-file reads, IPC writes and extraction attempts may fail without
//! aborting the caller. Each such site produces a `BestEffort` instead of
//! swallowing the failure, and the fallback is logged when it is created.

use std::fmt::Display;

/// Outcome of an operation whose failure degrades to a default value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BestEffort<T> {
    /// The operation succeeded
    Read(T),
    /// The operation failed; `value` is the fallback and `reason` says why
    Fallback { value: T, reason: String },
}

impl<T> BestEffort<T> {
    /// Record a fallback, emitting a debug-level diagnostic for `what`.
    pub fn fallback(what: &str, value: T, reason: impl Display) -> Self {
        let reason = reason.to_string();
        log::debug!("{} unavailable, using fallback: {}", what, reason);
        BestEffort::Fallback { value, reason }
    }

    /// Convert a `Result`, falling back to `default` on error.
    pub fn from_result<E: Display>(what: &str, result: Result<T, E>, default: T) -> Self {
        match result {
            Ok(value) => BestEffort::Read(value),
            Err(e) => Self::fallback(what, default, e),
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, BestEffort::Fallback { .. })
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            BestEffort::Read(_) => None,
            BestEffort::Fallback { reason, .. } => Some(reason),
        }
    }

    pub fn value(&self) -> &T {
        match self {
            BestEffort::Read(value) | BestEffort::Fallback { value, .. } => value,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            BestEffort::Read(value) | BestEffort::Fallback { value, .. } => value,
        }
    }
}
