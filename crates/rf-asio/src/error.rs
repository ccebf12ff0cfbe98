//! ASIO error types
//!
//! Two layers: [`DriverError`] is what a driver transport reports for a single
//! call, [`AsioError`] is the classified failure the engine surfaces to the
//! application, tagged with the driver call it originated from.

use std::fmt;

use thiserror::Error;

/// Transport-level failure of one driver call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    #[error("Driver load failed: {0}")]
    LoadFailed(String),

    #[error("Driver init failed: {0}")]
    InitFailed(String),

    #[error("ASIO error {code}: {message}")]
    Protocol { code: i32, message: String },

    #[error("Out of memory")]
    OutOfMemory,

    /// The driver panicked inside `func`. Only produced by the crash guard.
    #[error("Driver crash in {func}")]
    Crash { func: &'static str },

    #[error("{0}")]
    Other(String),
}

impl DriverError {
    /// Shorthand for a protocol error with the generic ASE_NotPresent code.
    pub fn not_present(message: impl Into<String>) -> Self {
        Self::Protocol {
            code: -1000,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> AsioErrorKind {
        match self {
            Self::LoadFailed(_) => AsioErrorKind::DriverLoad,
            Self::InitFailed(_) => AsioErrorKind::DriverInit,
            Self::Protocol { .. } => AsioErrorKind::Protocol,
            Self::OutOfMemory => AsioErrorKind::OutOfMemory,
            Self::Crash { .. } => AsioErrorKind::DriverCrash,
            Self::Other(_) => AsioErrorKind::Other,
        }
    }
}

/// Classified failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AsioErrorKind {
    /// Driver code crashed. The session is force-closed and the process tainted.
    DriverCrash,
    /// Allocation failed inside the driver or the engine.
    OutOfMemory,
    DriverLoad,
    DriverInit,
    /// A driver control call returned an error.
    Protocol,
    /// Requested settings cannot be satisfied by the device.
    UnsupportedConfiguration,
    /// Internal state disagreement, e.g. a missed silence acknowledgment.
    ConsistencyFault,
    Other,
}

impl fmt::Display for AsioErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DriverCrash => "Driver Crash",
            Self::OutOfMemory => "Out Of Memory",
            Self::DriverLoad => "Driver Load",
            Self::DriverInit => "Driver Init",
            Self::Protocol => "Error",
            Self::UnsupportedConfiguration => "Unsupported Configuration",
            Self::ConsistencyFault => "Consistency Fault",
            Self::Other => "Exception",
        };
        f.write_str(name)
    }
}

/// Engine error: kind, originating call and a human-readable message.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("ASIO: {call}: {kind}: {message}")]
pub struct AsioError {
    pub kind: AsioErrorKind,
    pub call: &'static str,
    pub message: String,
}

impl AsioError {
    pub fn new(kind: AsioErrorKind, call: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            call,
            message: message.into(),
        }
    }

    pub fn unsupported(call: &'static str, message: impl Into<String>) -> Self {
        Self::new(AsioErrorKind::UnsupportedConfiguration, call, message)
    }

    pub fn protocol(call: &'static str, message: impl Into<String>) -> Self {
        Self::new(AsioErrorKind::Protocol, call, message)
    }

    pub fn from_driver(call: &'static str, err: &DriverError) -> Self {
        Self::new(err.kind(), call, err.to_string())
    }

    #[inline]
    pub fn is_crash(&self) -> bool {
        self.kind == AsioErrorKind::DriverCrash
    }
}

pub type AsioResult<T> = Result<T, AsioError>;
