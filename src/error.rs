//! Error types and error handling strategy for Promisync.
//!
//! This module defines the closed error taxonomy used throughout the
//! library. Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - The taxonomy is closed: every failure a chain can observe is one of
//!   the kinds below; user failures stay opaque behind [`ErrorKind::User`]
//! - Aggregate failures preserve member-index order
//!
//! # Propagation
//!
//! A settled stage's error flows to the earliest downstream `catch`;
//! intervening `then` bodies are bypassed without invocation. A chain that
//! ends in error with no `catch` drops the error silently at monitor drop;
//! the monitor's deinit hook is the seam for detecting that in tests.

use core::fmt;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// User-provided error, opaque to the library.
    User,
    /// The stage's timeout timer won the settlement race.
    TimedOut,
    /// The chain was cancelled.
    Cancelled,
    /// A combinator received no member promises.
    Empty,
    /// Every member of an `any` combinator failed; see [`Error::causes`].
    Aggregate,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user error"),
            Self::TimedOut => write!(f, "timed out"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Empty => write!(f, "no members"),
            Self::Aggregate => write!(f, "all members failed"),
        }
    }
}

/// The error type carried by rejected promises.
///
/// Cheap to clone: context and source are shared, not copied.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<Arc<str>>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
    /// Member errors, in member-index order. Non-empty only for
    /// [`ErrorKind::Aggregate`].
    causes: Arc<[Error]>,
}

impl Error {
    /// Creates a new error with the given kind and no context.
    #[must_use]
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            source: None,
            causes: Arc::from(Vec::new()),
        }
    }

    /// Creates an opaque user error carrying a description.
    #[must_use]
    pub fn user(description: impl Into<String>) -> Self {
        Self::new(ErrorKind::User).with_context(description)
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timed_out() -> Self {
        Self::new(ErrorKind::TimedOut)
    }

    /// Creates a cancellation error.
    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled)
    }

    /// Creates the error a combinator rejects with when given no members.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(ErrorKind::Empty)
    }

    /// Creates an aggregate error from member errors in index order.
    #[must_use]
    pub fn aggregate(causes: Vec<Error>) -> Self {
        Self {
            kind: ErrorKind::Aggregate,
            context: None,
            source: None,
            causes: causes.into(),
        }
    }

    /// Wraps an arbitrary error as the source of an opaque user error.
    #[must_use]
    pub fn from_source(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        let description = source.to_string();
        Self::user(description).with_source(source)
    }

    /// Returns the error kind.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if this error represents cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled)
    }

    /// Returns true if this error came from a stage timeout.
    #[must_use]
    pub fn is_timed_out(&self) -> bool {
        matches!(self.kind, ErrorKind::TimedOut)
    }

    /// Returns the human-readable description attached to this error, if any.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Returns the member errors of an aggregate failure, in member-index
    /// order. Empty for every other kind.
    #[must_use]
    pub fn causes(&self) -> &[Error] {
        &self.causes
    }

    /// Adds context text to the error.
    #[must_use]
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into().into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(ctx) = &self.context {
            write!(f, ": {ctx}")?;
        }
        if !self.causes.is_empty() {
            write!(f, " [")?;
            for (i, cause) in self.causes.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{cause}")?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// A specialized Result type for promise settlements.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[derive(Debug)]
    struct Underlying;

    impl fmt::Display for Underlying {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "underlying")
        }
    }

    impl std::error::Error for Underlying {}

    #[test]
    fn display_without_context() {
        let err = Error::timed_out();
        assert_eq!(err.to_string(), "timed out");
    }

    #[test]
    fn display_with_context() {
        let err = Error::user("disk on fire");
        assert_eq!(err.to_string(), "user error: disk on fire");
    }

    #[test]
    fn aggregate_preserves_order() {
        let err = Error::aggregate(vec![Error::timed_out(), Error::cancelled()]);
        assert_eq!(err.kind(), ErrorKind::Aggregate);
        assert_eq!(err.causes()[0].kind(), ErrorKind::TimedOut);
        assert_eq!(err.causes()[1].kind(), ErrorKind::Cancelled);
        assert_eq!(err.to_string(), "all members failed [timed out, cancelled]");
    }

    #[test]
    fn source_chain_is_exposed() {
        let err = Error::from_source(Underlying);
        assert_eq!(err.kind(), ErrorKind::User);
        let source = err.source().expect("source missing");
        assert_eq!(source.to_string(), "underlying");
    }

    #[test]
    fn predicates() {
        assert!(Error::cancelled().is_cancelled());
        assert!(!Error::cancelled().is_timed_out());
        assert!(Error::timed_out().is_timed_out());
        assert!(!Error::user("x").is_cancelled());
    }
}
