//! The per-key result model.

use std::sync::Arc;

use crate::fetch::{ErrorDescriptor, Located};

/// Classification of a key's outcome, for callers that only care which
/// bucket a result fell into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The downstream service reported no content. Not a failure.
    Absent,
    /// The downstream service returned a real error.
    DownstreamFailure,
    /// A response was parsed but an item in it was invalid.
    MalformedResponse,
    /// The loader's cancellation token fired before the key resolved.
    Cancelled,
}

/// The error half of an [`Outcome`]. Cloned out to every waiter on a key, so
/// all payloads are cheaply cloneable.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("downstream failure: {0}")]
    Downstream(ErrorDescriptor),

    #[error("malformed response: {0}")]
    Malformed(Arc<str>),

    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn malformed(reason: impl Into<Arc<str>>) -> Self {
        FetchError::Malformed(reason.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Downstream(..) => ErrorKind::DownstreamFailure,
            FetchError::Malformed(..) => ErrorKind::MalformedResponse,
            FetchError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// The downstream descriptor, if this error came from a downstream call.
    pub fn descriptor(&self) -> Option<&ErrorDescriptor> {
        match self {
            FetchError::Downstream(descriptor) => Some(descriptor),
            _ => None,
        }
    }
}

/// The outcome of loading one key: a value, a successful "nothing here", or
/// an error. Never more than one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Value(T),
    Absent,
    Error(FetchError),
}

impl<T> Outcome<T> {
    /// `None` for a value; otherwise the bucket this outcome belongs to.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Outcome::Value(..) => None,
            Outcome::Absent => Some(ErrorKind::Absent),
            Outcome::Error(err) => Some(err.kind()),
        }
    }

    #[inline]
    pub fn is_value(&self) -> bool {
        matches!(self, Outcome::Value(..))
    }

    #[inline]
    pub fn is_absent(&self) -> bool {
        matches!(self, Outcome::Absent)
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        matches!(self, Outcome::Error(..))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&FetchError> {
        match self {
            Outcome::Error(err) => Some(err),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Value(value) => Outcome::Value(f(value)),
            Outcome::Absent => Outcome::Absent,
            Outcome::Error(err) => Outcome::Error(err),
        }
    }

    /// Convert into a `Result`, with absence as `Ok(None)`, so resolver code
    /// can use `?`.
    pub fn into_result(self) -> Result<Option<T>, FetchError> {
        match self {
            Outcome::Value(value) => Ok(Some(value)),
            Outcome::Absent => Ok(None),
            Outcome::Error(err) => Err(err),
        }
    }

    /// The outcome every key of a failed group gets. "No content" is
    /// absence, anything else is a downstream failure.
    pub fn from_descriptor(descriptor: &ErrorDescriptor) -> Self {
        if descriptor.is_no_content() {
            Outcome::Absent
        } else {
            Outcome::Error(FetchError::Downstream(descriptor.clone()))
        }
    }

    /// Whether this outcome may be memoized in a cache scope. Cancellation
    /// is never memoized; errors are memoized only if `memoize_errors`.
    pub(crate) fn is_memoizable(&self, memoize_errors: bool) -> bool {
        match self {
            Outcome::Error(FetchError::Cancelled) => false,
            Outcome::Error(..) => memoize_errors,
            _ => true,
        }
    }
}

impl<T> From<Located<T>> for Outcome<T> {
    fn from(located: Located<T>) -> Self {
        match located {
            Located::Found(value) => Outcome::Value(value),
            Located::Missing => Outcome::Absent,
            Located::Malformed(reason) => Outcome::Error(FetchError::malformed(reason)),
        }
    }
}

impl<T> From<Result<Option<T>, FetchError>> for Outcome<T> {
    fn from(result: Result<Option<T>, FetchError>) -> Self {
        match result {
            Ok(Some(value)) => Outcome::Value(value),
            Ok(None) => Outcome::Absent,
            Err(err) => Outcome::Error(err),
        }
    }
}
