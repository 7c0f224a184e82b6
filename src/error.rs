//! Error kinds and completion status
//!
//! [`Error`] is what the driver and platform layers return. [`Status`]
//! is what a gadget driver sees in a completed [`Request`](crate::pcd::Request).

use core::fmt;

/// Driver and platform errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Malformed or missing required parameter
    InvalidArgument,
    /// An allocation or other resource acquisition failed
    NoMemory,
    /// No gadget driver is bound, or the link speed is unknown
    NotReady,
    /// The resource is already registered or held
    Busy,
    /// The feature isn't implemented
    NotSupported,
    /// Cancelled by an explicit dequeue or wait queue abort
    Aborted,
    /// Interrupted; the caller should retry
    Restarted,
    /// Interrupted by a signal that doesn't ask for a restart
    Interrupted,
    /// The deadline passed
    TimedOut,
    /// The device is going away
    Shutdown,
    /// Try again once outstanding transfers complete
    Again,
    /// An isochronous packet carried no data
    NoData,
    /// Unclassified lower-layer failure
    Unknown,
}

impl Error {
    /// Returns the negative platform error code for this error
    pub const fn code(self) -> i32 {
        match self {
            Error::InvalidArgument => -1001,
            Error::NoMemory => -1002,
            Error::NotReady => -1003,
            Error::NotSupported => -1004,
            Error::TimedOut => -1005,
            Error::Busy => -1006,
            Error::Again => -1007,
            Error::Restarted => -1008,
            Error::Aborted => -1009,
            Error::Shutdown => -1010,
            Error::NoData => -1011,
            Error::Interrupted => -1012,
            Error::Unknown => -3000,
        }
    }

    /// Map a negative platform error code back to an error
    ///
    /// Unrecognized codes become [`Error::Unknown`].
    pub const fn from_code(code: i32) -> Self {
        match code {
            -1001 => Error::InvalidArgument,
            -1002 => Error::NoMemory,
            -1003 => Error::NotReady,
            -1004 => Error::NotSupported,
            -1005 => Error::TimedOut,
            -1006 => Error::Busy,
            -1007 => Error::Again,
            -1008 => Error::Restarted,
            -1009 => Error::Aborted,
            -1010 => Error::Shutdown,
            -1011 => Error::NoData,
            -1012 => Error::Interrupted,
            _ => Error::Unknown,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self {
            Error::InvalidArgument => "invalid argument",
            Error::NoMemory => "out of memory",
            Error::NotReady => "device not ready",
            Error::Busy => "resource busy",
            Error::NotSupported => "not supported",
            Error::Aborted => "aborted",
            Error::Restarted => "interrupted, restart",
            Error::Interrupted => "interrupted",
            Error::TimedOut => "timed out",
            Error::Shutdown => "shutting down",
            Error::Again => "try again",
            Error::NoData => "no data",
            Error::Unknown => "unknown error",
        };
        f.write_str(what)
    }
}

impl std::error::Error for Error {}

const ESHUTDOWN: i32 = 108;
const ECONNRESET: i32 = 104;
const EINVAL: i32 = 22;
const ETIMEDOUT: i32 = 110;
const ENODATA: i32 = 61;
const EINPROGRESS: i32 = 115;

/// Request status as reported to the gadget driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Queued and not yet complete
    InProgress,
    /// Transferred without error
    Success,
    /// The device shut down or the endpoint was disabled
    Disconnected,
    /// The transfer was restarted by the controller
    ConnectionReset,
    /// The controller rejected the transfer
    InvalidArgument,
    /// The transfer timed out
    TimedOut,
    /// An isochronous packet carried no data
    NoData,
    /// Any other error, passed through as is
    Other(Error),
}

impl Status {
    /// Translate an internal transfer result
    pub const fn from_result(result: Result<(), Error>) -> Self {
        match result {
            Ok(()) => Status::Success,
            Err(Error::Shutdown) => Status::Disconnected,
            Err(Error::Restarted) => Status::ConnectionReset,
            Err(Error::InvalidArgument) => Status::InvalidArgument,
            Err(Error::TimedOut) => Status::TimedOut,
            Err(err) => Status::Other(err),
        }
    }

    /// Translate an isochronous packet result
    ///
    /// Unlike [`from_result`](Self::from_result), only "no data" is
    /// translated; everything else passes through.
    pub const fn from_iso_packet(result: Result<(), Error>) -> Self {
        match result {
            Ok(()) => Status::Success,
            Err(Error::NoData) => Status::NoData,
            Err(err) => Status::Other(err),
        }
    }

    /// Returns the status as a (negative) errno
    ///
    /// Untranslated errors keep their platform code.
    pub const fn errno(self) -> i32 {
        match self {
            Status::InProgress => -EINPROGRESS,
            Status::Success => 0,
            Status::Disconnected => -ESHUTDOWN,
            Status::ConnectionReset => -ECONNRESET,
            Status::InvalidArgument => -EINVAL,
            Status::TimedOut => -ETIMEDOUT,
            Status::NoData => -ENODATA,
            Status::Other(err) => err.code(),
        }
    }

    /// Indicates a successful transfer
    pub const fn is_success(self) -> bool {
        matches!(self, Status::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, Status};

    #[test]
    fn completion_translation() {
        assert_eq!(Status::from_result(Ok(())), Status::Success);
        assert_eq!(
            Status::from_result(Err(Error::Shutdown)),
            Status::Disconnected
        );
        assert_eq!(
            Status::from_result(Err(Error::Restarted)),
            Status::ConnectionReset
        );
        assert_eq!(
            Status::from_result(Err(Error::InvalidArgument)),
            Status::InvalidArgument
        );
        assert_eq!(Status::from_result(Err(Error::TimedOut)), Status::TimedOut);
        assert_eq!(
            Status::from_result(Err(Error::Aborted)),
            Status::Other(Error::Aborted)
        );
        // Only iso packets translate "no data"
        assert_eq!(
            Status::from_result(Err(Error::NoData)),
            Status::Other(Error::NoData)
        );
        assert_eq!(
            Status::from_iso_packet(Err(Error::NoData)),
            Status::NoData
        );
    }

    #[test]
    fn errno() {
        assert_eq!(Status::Disconnected.errno(), -108);
        assert_eq!(Status::ConnectionReset.errno(), -104);
        assert_eq!(Status::InProgress.errno(), -115);
        assert_eq!(Status::NoData.errno(), -61);
        assert_eq!(Status::Other(Error::Aborted).errno(), -1009);
    }

    #[test]
    fn codes() {
        for err in [
            Error::InvalidArgument,
            Error::NoMemory,
            Error::NotReady,
            Error::Busy,
            Error::NotSupported,
            Error::Aborted,
            Error::Restarted,
            Error::Interrupted,
            Error::TimedOut,
            Error::Shutdown,
            Error::Again,
            Error::NoData,
            Error::Unknown,
        ] {
            assert!(err.code() < 0);
            assert_eq!(Error::from_code(err.code()), err);
        }
        assert_eq!(Error::from_code(-42), Error::Unknown);
    }
}
