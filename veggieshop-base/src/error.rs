// We want a few things here:
// 1. A way to create a new error with a backtrace
// 2. A way to centralize setting a breakpoint to trap any error in the system fairly soon
//    after it's created (or at least when it's propagated from a library we use back to us)
// 3. Same but for logging / emitting error messages into the tracing/logging system

use std::borrow::Cow;
use backtrace_error::DynBacktraceError;
use tracing::error;

#[cfg(test)]
use test_log::test;

/// Coarse classification used by call sites that need to branch on failure
/// mode (see §7 of the spec) without introducing a competing error enum.
///
/// `Unknown` is the default for errors that arrive via the blanket `From`
/// impl (i.e. from a library we didn't classify ourselves); call sites that
/// care should construct with [`Error::with_kind`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Unknown,
    Validation,
    Precondition,
    Capacity,
    TransientStorage,
    DurableStorageFailure,
    Fatal,
}

#[derive(Debug)]
#[allow(dead_code)]
pub struct Error {
    inner: DynBacktraceError,
    kind: ErrorKind,
}
pub type Result<T> = std::result::Result<T, Error>;

struct SimpleErr(Cow<'static, str>);
impl std::fmt::Debug for SimpleErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::fmt::Display for SimpleErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for SimpleErr {
    fn description(&self) -> &str {
        &self.0
    }
}

impl<E: std::error::Error + Send + Sync + 'static> From<E> for Error {
    fn from(err: E) -> Error {
        Error::new(err)
    }
}

impl Error {
    pub fn new<E: std::error::Error + Send + Sync + 'static>(err: E) -> Error {
        Error::with_kind(ErrorKind::Unknown, err)
    }

    pub fn with_kind<E: std::error::Error + Send + Sync + 'static>(
        kind: ErrorKind,
        err: E,
    ) -> Error {
        error!(target: "veggieshop", kind = ?kind, "{:?}", err);
        let inner = DynBacktraceError::from(err);
        Error { inner, kind }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

pub fn err(msg: impl Into<Cow<'static, str>>) -> Error {
    let err = SimpleErr(msg.into());
    Error::new(err)
}

pub fn err_kind(kind: ErrorKind, msg: impl Into<Cow<'static, str>>) -> Error {
    let err = SimpleErr(msg.into());
    Error::with_kind(kind, err)
}

#[test]
fn test_error() {
    let _err = err("test error");
}
