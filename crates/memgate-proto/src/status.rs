//! NTSTATUS values used by the protocol.

use std::fmt;

/// A kernel status code.
///
/// Negative values are errors, everything else counts as success
/// (the `NT_SUCCESS` rule).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct NtStatus(pub i32);

impl NtStatus {
    pub const SUCCESS: Self = Self(0);
    pub const PARTIAL_COPY: Self = Self(0x8000_000Du32 as i32);
    pub const UNSUCCESSFUL: Self = Self(0xC000_0001u32 as i32);
    pub const INVALID_HANDLE: Self = Self(0xC000_0008u32 as i32);
    pub const INVALID_PARAMETER: Self = Self(0xC000_000Du32 as i32);
    pub const NO_MEMORY: Self = Self(0xC000_0017u32 as i32);
    pub const BUFFER_TOO_SMALL: Self = Self(0xC000_0023u32 as i32);
    pub const ACCESS_VIOLATION: Self = Self(0xC000_0005u32 as i32);
    pub const PROCESS_IS_TERMINATING: Self = Self(0xC000_010Au32 as i32);
    pub const INVALID_BUFFER_SIZE: Self = Self(0xC000_0206u32 as i32);
    pub const NOT_FOUND: Self = Self(0xC000_0225u32 as i32);

    /// `NT_SUCCESS`.
    pub const fn is_success(self) -> bool {
        self.0 >= 0
    }

    /// Raw bit pattern, as carried in the low half of a client error code.
    pub const fn bits(self) -> u32 {
        self.0 as u32
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits as i32)
    }

    /// Turn a status into a `Result`, keeping the failing status.
    pub fn ok(self) -> Result<(), NtStatus> {
        if self.is_success() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for NtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.bits())
    }
}
