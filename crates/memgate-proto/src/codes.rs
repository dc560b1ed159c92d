//! Control codes and device names.

use std::mem::size_of;

use strum::{Display, FromRepr, IntoStaticStr};

use crate::records::{
    CopyRequest, DelayRequest, KeyboardInput, MouseInput, PollRequest, QueryRequest, Version,
};

/// Kernel object name of the control device.
pub const DEVICE_NAME: &str = r"\Device\Memgate";

/// Symbolic link created next to the control device.
pub const SYMBOLIC_LINK: &str = r"\DosDevices\Memgate";

/// Path a user-mode client opens to reach the control device.
pub const DEVICE_PATH: &str = r"\\.\Memgate";

const FILE_DEVICE_UNKNOWN: u32 = 0x22;
const METHOD_BUFFERED: u32 = 0;
const FILE_SPECIAL_ACCESS: u32 = 0;

/// `CTL_CODE(device_type, function, method, access)`
pub const fn ctl_code(device_type: u32, function: u32, method: u32, access: u32) -> u32 {
    (device_type << 16) | (access << 14) | (function << 2) | method
}

const fn buffered(function: u32) -> u32 {
    ctl_code(FILE_DEVICE_UNKNOWN, function, METHOD_BUFFERED, FILE_SPECIAL_ACCESS)
}

/// One control code per service operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, IntoStaticStr, Display)]
#[repr(u32)]
pub enum ControlCode {
    #[strum(serialize = "version")]
    GetVersion = buffered(0x800),
    #[strum(serialize = "attach")]
    Attach = buffered(0x801),
    #[strum(serialize = "detach")]
    Detach = buffered(0x802),
    #[strum(serialize = "poll")]
    Poll = buffered(0x803),
    #[strum(serialize = "read")]
    Read = buffered(0x804),
    #[strum(serialize = "write")]
    Write = buffered(0x805),
    #[strum(serialize = "query")]
    Query = buffered(0x806),
    #[strum(serialize = "keyboard")]
    Keyboard = buffered(0x807),
    #[strum(serialize = "mouse")]
    Mouse = buffered(0x808),
    #[strum(serialize = "delay")]
    Delay = buffered(0x809),
}

impl ControlCode {
    pub fn from_raw(code: u32) -> Option<Self> {
        Self::from_repr(code)
    }

    pub const fn raw(self) -> u32 {
        self as u32
    }

    /// Exact input and output buffer size the service expects for this code.
    pub const fn payload_size(self) -> usize {
        match self {
            Self::GetVersion => size_of::<Version>(),
            Self::Attach | Self::Detach => 0,
            Self::Poll => size_of::<PollRequest>(),
            Self::Read | Self::Write => size_of::<CopyRequest>(),
            Self::Query => size_of::<QueryRequest>(),
            Self::Keyboard => size_of::<KeyboardInput>(),
            Self::Mouse => size_of::<MouseInput>(),
            Self::Delay => size_of::<DelayRequest>(),
        }
    }
}
