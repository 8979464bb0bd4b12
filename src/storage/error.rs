use crate::BoxError;
use derive_more::Display;
use thiserror::Error;

/// The Error returned by remote store back-ends. Implementations should choose
/// the `ErrorKind` carefully since it determines both the translator's
/// host-driver status code and whether the back-end retry loop may re-attempt
/// the operation.
#[derive(Debug, Error)]
#[error("remote store error: {kind}")]
pub struct Error {
    kind: ErrorKind,
    #[source]
    source: Option<BoxError>,
}

impl Error {
    /// Creates a new storage error wrapping an underlying cause.
    pub fn new<E>(kind: ErrorKind, error: E) -> Error
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Error {
            kind,
            source: Some(error.into()),
        }
    }

    /// The taxonomy kind of this failure.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Attempts to get a reference to an underlying cause of type `E`, if any.
    pub fn get_source<E: std::error::Error + 'static>(&self) -> Option<&E> {
        self.source.as_ref()?.downcast_ref::<E>()
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error { kind, source: None }
    }
}

/// The `ErrorKind` variants that can be produced by [`RemoteStore`]
/// implementations.
///
/// [`RemoteStore`]: trait.RemoteStore.html
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
pub enum ErrorKind {
    /// The path does not exist on the remote store. Never retried; surfaces to
    /// the host driver as "object name not found".
    #[display("object not found")]
    NotFound,
    /// The remote store refused the operation. Never retried.
    #[display("access denied")]
    AccessDenied,
    /// The operation exceeded the configured socket or API timeout. The
    /// back-end retry loop re-attempts it after reconnecting.
    #[display("operation timed out")]
    TimedOut,
    /// The target already exists, e.g. on create or non-replacing rename.
    #[display("object already exists")]
    AlreadyExists,
    /// A directory could not be removed because it still has children.
    #[display("directory not empty")]
    NotEmpty,
    /// A transport-level failure (connection reset, dropped session). The
    /// back-end retry loop re-attempts it after reconnecting; once retries
    /// exhaust it surfaces as a generic I/O error.
    #[display("remote store unavailable")]
    Unavailable,
    /// The remote store rejected the configured credentials. Never retried.
    #[display("authentication failed")]
    AuthFailed,
    /// Any other failure. Surfaces as a generic I/O error and is logged with
    /// context.
    #[display("fatal remote store error")]
    Fatal,
}

impl ErrorKind {
    /// Whether the back-end retry loop may re-attempt an operation that failed
    /// with this kind. Everything else is permanent and propagates at once.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::Unavailable | ErrorKind::TimedOut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn kind_is_preserved() {
        let err = Error::new(ErrorKind::NotFound, std::io::Error::other("gone"));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn only_transport_kinds_are_transient() {
        assert!(ErrorKind::Unavailable.is_transient());
        assert!(ErrorKind::TimedOut.is_transient());
        for kind in [
            ErrorKind::NotFound,
            ErrorKind::AccessDenied,
            ErrorKind::AlreadyExists,
            ErrorKind::NotEmpty,
            ErrorKind::AuthFailed,
            ErrorKind::Fatal,
        ] {
            assert!(!kind.is_transient(), "{kind} must be permanent");
        }
    }

    #[test]
    fn source_downcast() {
        let err = Error::new(ErrorKind::Fatal, std::io::Error::other("boom"));
        assert!(err.get_source::<std::io::Error>().is_some());
        assert!(Error::from(ErrorKind::Fatal).get_source::<std::io::Error>().is_none());
    }
}
