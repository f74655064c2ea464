//! Error taxonomy for the translator.
//!
//! Three kinds of failure flow through simulation, with very different
//! lifetimes:
//!
//! - [`ExecError::Inner`]: an invariant violation inside the simulator
//!   (stack underflow, missing variable, duplicate keyword). Always fatal;
//!   the translation boundary wraps it with a simulated-stack summary.
//! - [`ExecError::NotImplemented`]: the simulator cannot model an
//!   opcode/value combination. Escapes to the translation boundary, where
//!   non-strict mode falls back to default evaluation.
//! - [`ExecError::BreakGraph`]: structured control flow, not a genuine
//!   error: the current simulation must split into a compiled prefix and
//!   resume functions. Must be converted at a break site inside the same
//!   translation; leaking one out of a translation is itself an `Inner`
//!   error.

use std::fmt;

use strum::IntoStaticStr;

/// Result type alias for simulation steps.
pub type ExecResult<T> = Result<T, ExecError>;

/// Why a graph break was requested.
///
/// Carried inside [`ExecError::BreakGraph`] so the break site can log a
/// precise cause. The variant does not change how the break is handled.
#[derive(Debug, Clone, PartialEq, Eq, IntoStaticStr)]
pub enum BreakReason {
    /// A conditional jump's predicate is a tensor.
    JumpOnTensor,
    /// An inline executor hit an event it cannot translate in place.
    InlineUnsupported(String),
    /// `FOR_ITER` over an iterator kind the inline loop cannot drive.
    ForLoopFallback,
    /// An operation inside a call could not be recorded.
    CallUnsupported(String),
}

impl fmt::Display for BreakReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::JumpOnTensor => write!(f, "jump predicate is a tensor"),
            Self::InlineUnsupported(msg) => write!(f, "inline executor: {msg}"),
            Self::ForLoopFallback => write!(f, "for-loop fallback"),
            Self::CallUnsupported(msg) => write!(f, "call: {msg}"),
        }
    }
}

/// Failure raised while simulating bytecode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// Invariant violation inside the simulator. Fatal.
    Inner(String),
    /// The opcode/value combination is not modeled. Recoverable at the
    /// translation boundary in non-strict mode.
    NotImplemented(String),
    /// The simulation must split here. Never surfaces to the host.
    BreakGraph(BreakReason),
}

impl ExecError {
    /// Creates an `Inner` error from any displayable message.
    pub fn inner(msg: impl Into<String>) -> Self {
        Self::Inner(msg.into())
    }

    /// Creates a `NotImplemented` error from any displayable message.
    pub fn not_implemented(msg: impl Into<String>) -> Self {
        Self::NotImplemented(msg.into())
    }

    /// True for the variants `start_translate` recovers from by falling
    /// back to default evaluation.
    #[must_use]
    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::NotImplemented(_) | Self::BreakGraph(_))
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inner(msg) => write!(f, "inner error: {msg}"),
            Self::NotImplemented(msg) => write!(f, "not implemented: {msg}"),
            Self::BreakGraph(reason) => write!(f, "break graph: {reason}"),
        }
    }
}

impl std::error::Error for ExecError {}

/// Error surfaced to the embedding host by a translation attempt.
///
/// Only `Inner` failures (and, in strict mode, unsupported-opcode
/// failures) reach the host; everything else resolves to a fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslateError {
    /// The underlying simulator failure.
    pub cause: ExecError,
    /// One line per live simulator frame at the time of failure.
    pub simulated_stack: Vec<String>,
}

impl fmt::Display for TranslateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "in simulated execution:")?;
        for line in &self.simulated_stack {
            writeln!(f, "  {line}")?;
        }
        write!(f, "  {}", self.cause)
    }
}

impl std::error::Error for TranslateError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_classification() {
        assert!(ExecError::not_implemented("FANCY_OP").is_fallback());
        assert!(ExecError::BreakGraph(BreakReason::JumpOnTensor).is_fallback());
        assert!(!ExecError::inner("stack underflow").is_fallback());
    }

    #[test]
    fn test_translate_error_display() {
        let err = TranslateError {
            cause: ExecError::inner("lasti out of range"),
            simulated_stack: vec!["f (line 3)".to_string()],
        };
        let rendered = err.to_string();
        assert!(rendered.contains("f (line 3)"));
        assert!(rendered.contains("lasti out of range"));
    }
}
