/// Error kinds returned by the library, plus the thread-local buffer that
/// keeps the most recent formatted error message.
use core::fmt;
use std::cell::RefCell;

/// Upper bound on the formatted last-error message.
pub const ERRMSG_MAX: usize = 512;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// An OS file or mapping call failed; carries the OS error number.
    Io(i32),
    /// Bad size, misaligned address, null pointer or unknown option.
    InvalidArgument,
    /// Zero major version, checksum mismatch, or truncated part.
    InvalidHeader,
    /// Signature does not match the expected pool kind.
    WrongType,
    /// Pool major version newer than this library supports.
    VersionMismatch,
    /// A required (incompat) feature bit is unknown to this library.
    UnsupportedIncompat,
    /// Registry conflict when registering a mapped range.
    Overlap,
    /// Registry or path lookup failed.
    NotFound,
    /// Parts of a pool set disagree on identity.
    ReplicaMismatch,
    /// Another process holds the pool.
    InUse,
    /// Internal allocation failed.
    OutOfMemory,
}

impl Error {
    /// Numeric error code: the OS errno for `Io`, an errno-family constant
    /// otherwise.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Io(e) => *e,
            Error::InvalidArgument
            | Error::InvalidHeader
            | Error::WrongType
            | Error::VersionMismatch
            | Error::UnsupportedIncompat
            | Error::ReplicaMismatch => libc::EINVAL,
            Error::Overlap | Error::InUse => libc::EBUSY,
            Error::NotFound => libc::ENOENT,
            Error::OutOfMemory => libc::ENOMEM,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => {
                let os = std::io::Error::from_raw_os_error(*e);
                write!(f, "I/O error: {}", os)
            }
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::InvalidHeader => write!(f, "invalid pool header"),
            Error::WrongType => write!(f, "pool signature mismatch"),
            Error::VersionMismatch => write!(f, "pool format version mismatch"),
            Error::UnsupportedIncompat => write!(f, "unsupported incompat feature"),
            Error::Overlap => write!(f, "mapped range overlap"),
            Error::NotFound => write!(f, "not found"),
            Error::ReplicaMismatch => write!(f, "replica identity mismatch"),
            Error::InUse => write!(f, "pool in use"),
            Error::OutOfMemory => write!(f, "out of memory"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.raw_os_error().unwrap_or(libc::EIO))
    }
}

thread_local! {
    static LAST_ERROR: RefCell<String> = const { RefCell::new(String::new()) };
}

/// Store `args` as the calling thread's last error message, truncated to
/// `ERRMSG_MAX` bytes on a char boundary. Also emitted through the log
/// facade at error level.
pub fn set_last_error(args: fmt::Arguments<'_>) {
    let mut msg = args.to_string();
    if msg.len() > ERRMSG_MAX {
        let mut cut = ERRMSG_MAX;
        while !msg.is_char_boundary(cut) {
            cut -= 1;
        }
        msg.truncate(cut);
    }
    log::error!("{}", msg);
    LAST_ERROR.with(|e| *e.borrow_mut() = msg);
}

/// The most recent error message recorded on this thread.
pub fn last_error() -> String {
    LAST_ERROR.with(|e| e.borrow().clone())
}

/// Record a formatted message in the thread-local buffer and produce
/// `Err(kind)`.
macro_rules! fail {
    ($kind:expr, $($arg:tt)*) => {{
        $crate::error::set_last_error(format_args!($($arg)*));
        return Err($kind);
    }};
}

pub(crate) use fail;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_error_is_thread_local() {
        set_last_error(format_args!("boom {}", 7));
        assert_eq!(last_error(), "boom 7");

        std::thread::spawn(|| {
            assert_eq!(last_error(), "");
            set_last_error(format_args!("other"));
            assert_eq!(last_error(), "other");
        })
        .join()
        .unwrap();

        assert_eq!(last_error(), "boom 7");
    }

    #[test]
    fn long_messages_are_truncated() {
        let long = "x".repeat(2 * ERRMSG_MAX);
        set_last_error(format_args!("{}", long));
        assert_eq!(last_error().len(), ERRMSG_MAX);
    }

    #[test]
    fn errno_mapping() {
        assert_eq!(Error::Io(libc::EACCES).errno(), libc::EACCES);
        assert_eq!(Error::NotFound.errno(), libc::ENOENT);
        assert_eq!(Error::OutOfMemory.errno(), libc::ENOMEM);
        assert_eq!(Error::InUse.errno(), libc::EBUSY);
    }
}
