use std::fmt;

use memgate_proto::{NtStatus, Version};
use strum::{Display, FromRepr, IntoStaticStr};
use thiserror::Error;

use crate::message;

/// Win32 error values the client produces itself.
pub mod win32 {
    pub const ERROR_SUCCESS: u32 = 0;
    pub const ERROR_FILE_NOT_FOUND: u32 = 2;
    pub const ERROR_ACCESS_DENIED: u32 = 5;
    pub const ERROR_INVALID_HANDLE: u32 = 6;
    pub const ERROR_NOT_ENOUGH_MEMORY: u32 = 8;
    pub const ERROR_GEN_FAILURE: u32 = 31;
    pub const ERROR_NOT_SUPPORTED: u32 = 50;
    pub const ERROR_INVALID_PARAMETER: u32 = 87;
    pub const ERROR_DEVICE_ALREADY_ATTACHED: u32 = 548;
    pub const ERROR_VERSION_PARSE_ERROR: u32 = 777;
}

/// Error domain carried in the high half of an [`ErrorCode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, IntoStaticStr, Display)]
#[repr(u32)]
pub enum ErrorDomain {
    #[strum(serialize = "dword")]
    Dword = 0,
    #[strum(serialize = "hresult")]
    HResult = 1,
    #[strum(serialize = "ntstatus")]
    NtStatus = 2,
}

/// A 64-bit error code: domain in the high 32 bits, value in the low 32.
///
/// A zero value means success whatever the domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ErrorCode(pub u64);

impl ErrorCode {
    pub const SUCCESS: Self = Self(0);

    pub const fn new(domain: ErrorDomain, value: u32) -> Self {
        Self(((domain as u64) << 32) | value as u64)
    }

    pub const fn dword(value: u32) -> Self {
        Self::new(ErrorDomain::Dword, value)
    }

    pub const fn hresult(value: i32) -> Self {
        Self::new(ErrorDomain::HResult, value as u32)
    }

    pub const fn ntstatus(status: NtStatus) -> Self {
        Self::new(ErrorDomain::NtStatus, status.bits())
    }

    /// `None` for a domain this build does not know.
    pub fn domain(self) -> Option<ErrorDomain> {
        ErrorDomain::from_repr((self.0 >> 32) as u32)
    }

    pub const fn value(self) -> u32 {
        self.0 as u32
    }

    pub const fn is_error(self) -> bool {
        self.value() != 0
    }

    /// Human-readable, single-sentence description.
    pub fn message(self) -> String {
        if !self.is_error() {
            return "Success.".to_string();
        }
        match self.domain() {
            Some(domain) => message::resolve(domain, self.value()),
            None => "Unknown error domain.".to_string(),
        }
    }
}

impl From<NtStatus> for ErrorCode {
    fn from(status: NtStatus) -> Self {
        Self::ntstatus(status)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let domain = self
            .domain()
            .map(<&'static str>::from)
            .unwrap_or("unknown");
        write!(f, "{} ({} 0x{:08X})", self.message(), domain, self.value())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Os(ErrorCode),

    #[error("Service version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: Version, actual: Version },

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn dword(value: u32) -> Self {
        Self::Os(ErrorCode::dword(value))
    }

    /// The unified code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Os(code) => *code,
            Error::VersionMismatch { .. } => ErrorCode::dword(win32::ERROR_VERSION_PARSE_ERROR),
            Error::InvalidSignature(_) => ErrorCode::dword(win32::ERROR_INVALID_PARAMETER),
            Error::Io(e) => ErrorCode::dword(
                e.raw_os_error()
                    .map(|code| code as u32)
                    .unwrap_or(win32::ERROR_GEN_FAILURE),
            ),
        }
    }

    /// Check if this error means "no such device or file".
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            other => other.code() == ErrorCode::dword(win32::ERROR_FILE_NOT_FOUND),
        }
    }

    /// The status the service reported, if that is what failed.
    pub fn status(&self) -> Option<NtStatus> {
        match self {
            Error::Os(code) if code.domain() == Some(ErrorDomain::NtStatus) => {
                Some(NtStatus::from_bits(code.value()))
            }
            _ => None,
        }
    }
}

impl From<NtStatus> for Error {
    fn from(status: NtStatus) -> Self {
        Error::Os(ErrorCode::ntstatus(status))
    }
}

impl From<ErrorCode> for Error {
    fn from(code: ErrorCode) -> Self {
        Error::Os(code)
    }
}

#[cfg(target_os = "windows")]
impl From<windows::core::Error> for Error {
    fn from(e: windows::core::Error) -> Self {
        let hr = e.code().0 as u32;
        // HRESULT_FROM_WIN32 wraps Win32 errors as 0x8007xxxx.
        if hr & 0xFFFF_0000 == 0x8007_0000 {
            Error::dword(hr & 0xFFFF)
        } else {
            Error::Os(ErrorCode::hresult(hr as i32))
        }
    }
}
