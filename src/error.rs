//! Crate-wide error type.
//!
//! `no_std`-friendly: implements `core::fmt::Display` only. The command
//! dispatcher is the boundary that turns an [`Error`] into the wire-level
//! `NACK`/`ERROR` codes from the protocol (see [`crate::proto::schema`]).

use core::fmt;

/// Numeric error code as carried on the wire (`code=<u32>` fields).
pub type ErrorCode = u32;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// Line exceeded the maximum payload length.
    LineTooLong,
    /// Verb not recognized.
    UnknownCommand,
    /// A required/optional argument failed to parse.
    BadArg,
    /// A parsed argument is out of its valid range.
    ParamRange,
    /// Command is not valid in the current operating mode.
    BadState,
    /// An operation requires zero-phase calibration that hasn't run.
    ZeroNotCalibrated,
    /// `STOP` was issued while armed without `,FORCE`.
    BlockedWhileArmed,
    /// BLOCKS transport exhausted its retry budget.
    BlockRetriesExhausted,
    /// No sensor sample arrived for too long during a timed capture.
    SamplingStalled,
    /// Feature compiled out (e.g. `GET_DIAG` without `rxtx-debug`).
    NotSupported,
    /// Unrecoverable fault.
    Fatal,
}

impl Error {
    /// The wire-level numeric code for this error, per the protocol's error
    /// code table.
    pub const fn code(self) -> ErrorCode {
        match self {
            Error::UnknownCommand => 100,
            Error::BadArg => 101,
            Error::ParamRange => 102,
            Error::BadState => 103,
            Error::ZeroNotCalibrated => 104,
            Error::BlockedWhileArmed => 201,
            Error::LineTooLong => 300,
            Error::BlockRetriesExhausted => 400,
            Error::SamplingStalled => 500,
            Error::NotSupported => 900,
            Error::Fatal => 999,
        }
    }

    /// The `reason=` token used in `NACK` lines for this error.
    pub const fn reason(self) -> &'static str {
        match self {
            Error::UnknownCommand => "unknown_command",
            Error::BadArg => "bad_arg",
            Error::ParamRange => "param_range",
            Error::BadState => "bad_state",
            Error::ZeroNotCalibrated => "zero_not_calibrated",
            Error::BlockedWhileArmed => "blocked_while_armed",
            Error::LineTooLong => "line_too_long",
            Error::BlockRetriesExhausted => "block_retries_exhausted",
            Error::SamplingStalled => "sampling_stalled",
            Error::NotSupported => "not_supported",
            Error::Fatal => "fatal",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code={})", self.reason(), self.code())
    }
}

pub type Result<T> = core::result::Result<T, Error>;
