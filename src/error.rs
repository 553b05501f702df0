//! Error types for the Cinnabar compilation pipeline

use thiserror::Error;

/// Errors surfaced by the compilation pipeline.
///
/// Allocation failures are the only category that propagates through multiple
/// call layers (stub compiler → cache insertion → call-site patch); every
/// intermediate layer checks and early-returns. Bailouts and stack overflow
/// are recoverable control-flow outcomes: the caller falls back to the
/// unoptimized execution path for that function.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The code-object store is out of space.
    #[error("code space exhausted: requested {requested} bytes, {available} available")]
    CodeSpaceExhausted { requested: usize, available: usize },

    /// The heap cannot allocate a supporting structure (e.g. a property cell).
    #[error("heap allocation failed: {0}")]
    AllocationFailed(&'static str),

    /// The graph builder hit a construct it does not support.
    #[error("bailout: {reason}")]
    Bailout { reason: String },

    /// Recursive compilation ran out of stack headroom.
    #[error("stack overflow while building graph (depth {depth})")]
    StackOverflow { depth: usize },

    /// A breakpoint was requested at a position with no breakable location.
    #[error("no breakable location at or after position {position}")]
    InvalidBreakLocation { position: u32 },

    /// A debugger operation referenced a function with no debug info.
    #[error("function has no debug info")]
    NoDebugInfo,
}

impl Error {
    /// Construct a bailout with a human-readable reason.
    pub fn bailout(reason: impl Into<String>) -> Self {
        Error::Bailout {
            reason: reason.into(),
        }
    }

    /// True for conditions recovered by falling back to the baseline tier.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Bailout { .. } | Error::StackOverflow { .. } | Error::CodeSpaceExhausted { .. }
        )
    }
}

/// Result type for compilation operations.
pub type Result<T> = std::result::Result<T, Error>;
