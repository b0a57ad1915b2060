//! Framework errors and their `NTSTATUS` equivalents

/// `NTSTATUS` values produced by the framework
pub mod status {
    pub type NTSTATUS = i32;

    pub const STATUS_SUCCESS: NTSTATUS = 0x0000_0000;
    pub const STATUS_UNSUCCESSFUL: NTSTATUS = 0xC000_0001_u32 as i32;
    pub const STATUS_INVALID_PARAMETER: NTSTATUS = 0xC000_000D_u32 as i32;
    pub const STATUS_INSUFFICIENT_RESOURCES: NTSTATUS = 0xC000_009A_u32 as i32;
    pub const STATUS_NOT_SUPPORTED: NTSTATUS = 0xC000_00BB_u32 as i32;
    pub const STATUS_INVALID_DEVICE_STATE: NTSTATUS = 0xC000_0184_u32 as i32;
    pub const STATUS_NOT_FOUND: NTSTATUS = 0xC000_0225_u32 as i32;

    /// Equivalent of the `NT_SUCCESS` macro
    pub const fn nt_success(status: NTSTATUS) -> bool {
        status >= 0
    }
}

use status::*;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("module config size mismatch (expected {expected} bytes, got {actual})")]
    ConfigSizeMismatch { expected: usize, actual: usize },
    #[error("module config type mismatch (expected `{expected}`, got `{actual}`)")]
    ConfigTypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("interface name mismatch (protocol `{protocol}`, transport `{transport}`)")]
    InterfaceNameMismatch {
        protocol: &'static str,
        transport: &'static str,
    },
    #[error("interface `{name}` is not declared by module `{module}`")]
    InterfaceNotDeclared {
        name: &'static str,
        module: &'static str,
    },
    #[error("object is not in a valid state for this operation")]
    InvalidDeviceState,
    #[error("insufficient resources")]
    InsufficientResources,
    #[error("operation not supported")]
    NotSupported,
    #[error("operation unsuccessful")]
    Unsuccessful,
    #[error("failed with status {0:#010x}")]
    Status(NTSTATUS),
}

impl Error {
    /// Converts an `NTSTATUS` into a `Result`.
    ///
    /// Follows `NT_SUCCESS`, so informational and warning statuses are not errors.
    pub fn to_err(status: NTSTATUS) -> Result<()> {
        if nt_success(status) {
            Ok(())
        } else {
            Err(Self::from_ntstatus(status))
        }
    }

    /// Maps a failure `NTSTATUS` onto the closest error variant
    pub fn from_ntstatus(status: NTSTATUS) -> Self {
        match status {
            STATUS_UNSUCCESSFUL => Self::Unsuccessful,
            STATUS_INVALID_PARAMETER => Self::InvalidParameter,
            STATUS_INSUFFICIENT_RESOURCES => Self::InsufficientResources,
            STATUS_NOT_SUPPORTED => Self::NotSupported,
            STATUS_INVALID_DEVICE_STATE => Self::InvalidDeviceState,
            other => Self::Status(other),
        }
    }

    /// The `NTSTATUS` handed back to WDF for this error
    pub fn to_ntstatus(self) -> NTSTATUS {
        match self {
            Self::InvalidParameter
            | Self::ConfigSizeMismatch { .. }
            | Self::ConfigTypeMismatch { .. }
            | Self::InterfaceNameMismatch { .. } => STATUS_INVALID_PARAMETER,
            Self::InterfaceNotDeclared { .. } => STATUS_NOT_FOUND,
            Self::InvalidDeviceState => STATUS_INVALID_DEVICE_STATE,
            Self::InsufficientResources => STATUS_INSUFFICIENT_RESOURCES,
            Self::NotSupported => STATUS_NOT_SUPPORTED,
            Self::Unsuccessful => STATUS_UNSUCCESSFUL,
            Self::Status(status) => status,
        }
    }
}

impl From<Error> for NTSTATUS {
    fn from(value: Error) -> Self {
        value.to_ntstatus()
    }
}

/// Collapses a `Result` into the `NTSTATUS` a WDF callback returns
pub fn into_ntstatus(result: Result<()>) -> NTSTATUS {
    match result {
        Ok(()) => STATUS_SUCCESS,
        Err(err) => err.to_ntstatus(),
    }
}
