use std::{error::Error, fmt, io};

/// Result of every engine operation, success and failure alike.
///
/// Completion callbacks receive a `Status` instead of a `Result`: the
/// success codes carry scheduling information (`Done` vs `Ok` vs
/// `Suspended`), not just the absence of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Status {
    /// The operation succeeded, or the handle is armed.
    Ok,
    /// The operation completed and will not produce further events.
    Done,
    /// The handle was suspended, or the request was parked until resume.
    Suspended,
    /// The handle was paused by the user, or the request was refused
    /// without an error (e.g. `perform` outside of event processing).
    Declined,
    /// The handle was created but never run.
    Pending,

    /// The operation was cancelled.
    ErrorCancelled,
    /// The operation was already performed; repeating it has no effect.
    ErrorAlreadyPerformed,
    /// The caller is not allowed to perform the operation in this state.
    ErrorNotPermitted,
    /// The operation is not supported by the handle.
    ErrorNotSupported,
    /// The operation is not implemented by the active backend.
    ErrorNotImplemented,
    /// An argument is outside the accepted range.
    ErrorInvalidArgument,
    /// The kernel wait was interrupted.
    ErrorInterrupted,
    /// The resource is busy; retry later.
    ErrorBusy,
    /// The target handle is not running.
    ErrorNoSuchProcess,
    /// The target was not found.
    ErrorNotFound,
    /// The operation timed out.
    ErrorTimedOut,
    /// An unclassified failure.
    ErrorUnknown,

    /// An OS error that has no dedicated code above.
    Os(i32),
}

impl Status {
    /// Whether the status is one of the non-error codes.
    pub fn is_successful(self) -> bool {
        matches!(
            self,
            Status::Ok | Status::Done | Status::Suspended | Status::Declined | Status::Pending
        )
    }

    /// Whether the status is an error code.
    pub fn is_error(self) -> bool {
        !self.is_successful()
    }

    /// Whether a handle may be cancelled with this status: `Done` or any
    /// error. Everything else leaves the cancellation reason ambiguous.
    pub fn is_valid_cancel(self) -> bool {
        self == Status::Done || self.is_error()
    }

    /// Translate a raw OS error number.
    pub fn from_os_error(errno: i32) -> Status {
        match errno {
            libc_consts::ECANCELED => Status::ErrorCancelled,
            libc_consts::EINTR => Status::ErrorInterrupted,
            libc_consts::EAGAIN | libc_consts::EBUSY => Status::ErrorBusy,
            libc_consts::EPERM | libc_consts::EACCES => Status::ErrorNotPermitted,
            libc_consts::EINVAL => Status::ErrorInvalidArgument,
            libc_consts::ENOENT => Status::ErrorNotFound,
            libc_consts::ESRCH => Status::ErrorNoSuchProcess,
            libc_consts::ETIMEDOUT => Status::ErrorTimedOut,
            libc_consts::ENOSYS | libc_consts::EOPNOTSUPP => Status::ErrorNotSupported,
            0 => Status::ErrorUnknown,
            n => Status::Os(n),
        }
    }

    /// Translate `io::Error::last_os_error()`.
    pub fn last_os_error() -> Status {
        Status::from(io::Error::last_os_error())
    }

    /// The raw OS error number, if this status carries one.
    pub fn raw_os_error(self) -> Option<i32> {
        match self {
            Status::Os(n) => Some(n),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Os(n) => write!(f, "os error {n}"),
            other => fmt::Debug::fmt(other, f),
        }
    }
}

impl Error for Status {}

impl From<io::Error> for Status {
    fn from(err: io::Error) -> Self {
        if let Some(errno) = err.raw_os_error() {
            return Status::from_os_error(errno);
        }
        match err.kind() {
            io::ErrorKind::TimedOut => Status::ErrorTimedOut,
            io::ErrorKind::Interrupted => Status::ErrorInterrupted,
            io::ErrorKind::NotFound => Status::ErrorNotFound,
            io::ErrorKind::PermissionDenied => Status::ErrorNotPermitted,
            io::ErrorKind::InvalidInput => Status::ErrorInvalidArgument,
            io::ErrorKind::Unsupported => Status::ErrorNotSupported,
            _ => Status::ErrorUnknown,
        }
    }
}

#[cfg(unix)]
impl From<rustix::io::Errno> for Status {
    fn from(err: rustix::io::Errno) -> Self {
        Status::from_os_error(err.raw_os_error())
    }
}

// Errno values used by the translation table. Taken from libc on unix so
// the mapping matches the running kernel; fixed WinSock-compatible values
// elsewhere, where only the portable subset is ever produced.
#[cfg(unix)]
mod libc_consts {
    pub use libc::{
        EACCES, EAGAIN, EBUSY, ECANCELED, EINTR, EINVAL, ENOENT, ENOSYS, EOPNOTSUPP, EPERM, ESRCH,
        ETIMEDOUT,
    };
}

#[cfg(not(unix))]
mod libc_consts {
    pub const EPERM: i32 = 1;
    pub const ENOENT: i32 = 2;
    pub const ESRCH: i32 = 3;
    pub const EINTR: i32 = 4;
    pub const EAGAIN: i32 = 11;
    pub const EBUSY: i32 = 16;
    pub const EINVAL: i32 = 22;
    pub const ENOSYS: i32 = 38;
    pub const EOPNOTSUPP: i32 = 95;
    pub const EACCES: i32 = 13;
    pub const ECANCELED: i32 = 125;
    pub const ETIMEDOUT: i32 = 110;
}

#[cfg(test)]
mod test {
    use super::Status;

    #[test]
    fn cancel_statuses() {
        assert!(Status::Done.is_valid_cancel());
        assert!(Status::ErrorCancelled.is_valid_cancel());
        assert!(Status::ErrorTimedOut.is_valid_cancel());
        assert!(!Status::Ok.is_valid_cancel());
        assert!(!Status::Declined.is_valid_cancel());
        assert!(!Status::Suspended.is_valid_cancel());
    }

    #[cfg(unix)]
    #[test]
    fn errno_translation() {
        assert_eq!(Status::from_os_error(libc::EINTR), Status::ErrorInterrupted);
        assert_eq!(
            Status::from_os_error(libc::ECANCELED),
            Status::ErrorCancelled
        );
        let unknown = Status::from_os_error(libc::EMFILE);
        assert_eq!(unknown.raw_os_error(), Some(libc::EMFILE));
        assert!(unknown.is_error());
    }
}
