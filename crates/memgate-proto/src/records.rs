//! Fixed-layout records exchanged with the control service.
//!
//! Every record shared by both sides is 16-byte aligned and spells out its
//! reserved space, so the byte image is fully defined. Addresses are plain
//! integers relative to the process that owns them.

use std::fmt;
use std::mem::size_of;

use strum::{Display, FromRepr, IntoStaticStr};

use crate::wire::Wire;

/// Memory state, type and protection values carried by [`RegionDescriptor`].
pub mod memory {
    pub const MEM_COMMIT: u32 = 0x0000_1000;
    pub const MEM_RESERVE: u32 = 0x0000_2000;
    pub const MEM_FREE: u32 = 0x0001_0000;

    pub const MEM_PRIVATE: u32 = 0x0002_0000;
    pub const MEM_MAPPED: u32 = 0x0004_0000;
    pub const MEM_IMAGE: u32 = 0x0100_0000;

    pub const PAGE_NOACCESS: u32 = 0x01;
    pub const PAGE_READONLY: u32 = 0x02;
    pub const PAGE_READWRITE: u32 = 0x04;
    pub const PAGE_WRITECOPY: u32 = 0x08;
    pub const PAGE_EXECUTE: u32 = 0x10;
    pub const PAGE_EXECUTE_READ: u32 = 0x20;
    pub const PAGE_EXECUTE_READWRITE: u32 = 0x40;
    pub const PAGE_GUARD: u32 = 0x100;

    /// Protection values that allow reading.
    pub const fn is_readable(protect: u32) -> bool {
        protect & (PAGE_NOACCESS | PAGE_GUARD) == 0
            && protect
                & (PAGE_READONLY
                    | PAGE_READWRITE
                    | PAGE_WRITECOPY
                    | PAGE_EXECUTE_READ
                    | PAGE_EXECUTE_READWRITE)
                != 0
    }

    /// Protection values that allow writing.
    pub const fn is_writable(protect: u32) -> bool {
        protect & PAGE_GUARD == 0
            && protect & (PAGE_READWRITE | PAGE_WRITECOPY | PAGE_EXECUTE_READWRITE) != 0
    }
}

const fn parse_u16(text: &str) -> u16 {
    let bytes = text.as_bytes();
    let mut value: u16 = 0;
    let mut i = 0;
    while i < bytes.len() {
        value = value * 10 + (bytes[i] - b'0') as u16;
        i += 1;
    }
    value
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C, align(16))]
pub struct Version {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
    reserved: [u16; 5],
}

impl Version {
    /// Protocol version of this build.
    pub const CURRENT: Self = Self::new(
        parse_u16(env!("CARGO_PKG_VERSION_MAJOR")),
        parse_u16(env!("CARGO_PKG_VERSION_MINOR")),
        parse_u16(env!("CARGO_PKG_VERSION_PATCH")),
    );

    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
            reserved: [0; 5],
        }
    }

    /// Exact major.minor.patch match.
    pub fn is_compatible(&self, other: &Version) -> bool {
        self.major == other.major && self.minor == other.minor && self.patch == other.patch
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, IntoStaticStr, Display)]
#[repr(u64)]
pub enum EventKind {
    #[strum(serialize = "process-created")]
    ProcessCreated = 0,
    #[strum(serialize = "process-terminated")]
    ProcessTerminated = 1,
    #[strum(serialize = "image-loaded")]
    ImageLoaded = 2,
    #[strum(serialize = "log")]
    Log = 3,
}

/// Header of a variable-length event record.
///
/// `path_len` UTF-16 code units follow the header inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C, align(16))]
pub struct EventHeader {
    pub kind: u64,
    pub pid: u64,
    pub image_base: u64,
    pub image_size: u64,
    pub path_len: u64,
    reserved: u64,
}

impl EventHeader {
    pub fn new(kind: EventKind, pid: u64, image_base: u64, image_size: u64, path_len: usize) -> Self {
        Self {
            kind: kind as u64,
            pid,
            image_base,
            image_size,
            path_len: path_len as u64,
            reserved: 0,
        }
    }

    pub fn event_kind(&self) -> Option<EventKind> {
        EventKind::from_repr(self.kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C, align(16))]
pub struct CopyRequest {
    pub pid: u64,
    pub src: u64,
    pub dst: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C, align(16))]
pub struct QueryRequest {
    pub pid: u64,
    pub min: u64,
    pub max: u64,
    /// Caller-owned list header that receives the region records.
    pub list: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C, align(16))]
pub struct PollRequest {
    /// Caller-owned list header that receives the event records.
    pub list: u64,
    reserved: u64,
}

impl PollRequest {
    pub fn new(list: u64) -> Self {
        Self { list, reserved: 0 }
    }
}

/// Metadata of one committed region of a target process.
///
/// `copied_size` bytes of captured region content follow the descriptor
/// inline; it stays 0 until a capture fills it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C, align(16))]
pub struct RegionDescriptor {
    pub base_address: u64,
    pub allocation_base: u64,
    pub allocation_protect: u32,
    reserved0: u32,
    pub region_size: u64,
    pub state: u32,
    pub protect: u32,
    pub kind: u32,
    reserved1: u32,
    pub copied_size: u64,
    reserved2: u64,
}

impl RegionDescriptor {
    pub fn new(
        base_address: u64,
        allocation_base: u64,
        allocation_protect: u32,
        region_size: u64,
        state: u32,
        protect: u32,
        kind: u32,
    ) -> Self {
        Self {
            base_address,
            allocation_base,
            allocation_protect,
            region_size,
            state,
            protect,
            kind,
            ..Default::default()
        }
    }

    pub fn end_address(&self) -> u64 {
        self.base_address.saturating_add(self.region_size)
    }
}

/// `KEYBOARD_INPUT_DATA`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct KeyboardInput {
    pub unit_id: u16,
    pub make_code: u16,
    pub flags: u16,
    pub reserved: u16,
    pub extra_information: u32,
}

impl KeyboardInput {
    pub const KEY_MAKE: u16 = 0;
    pub const KEY_BREAK: u16 = 1;
}

/// `MOUSE_INPUT_DATA`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct MouseInput {
    pub unit_id: u16,
    pub flags: u16,
    pub button_flags: u16,
    pub button_data: u16,
    pub raw_buttons: u32,
    pub last_x: i32,
    pub last_y: i32,
    pub extra_information: u32,
}

impl MouseInput {
    pub const MOVE_RELATIVE: u16 = 0x00;
    pub const MOVE_ABSOLUTE: u16 = 0x01;

    pub const LEFT_BUTTON_DOWN: u16 = 0x0001;
    pub const LEFT_BUTTON_UP: u16 = 0x0002;
    pub const RIGHT_BUTTON_DOWN: u16 = 0x0004;
    pub const RIGHT_BUTTON_UP: u16 = 0x0008;
    pub const MIDDLE_BUTTON_DOWN: u16 = 0x0010;
    pub const MIDDLE_BUTTON_UP: u16 = 0x0020;
    pub const BUTTON_4_DOWN: u16 = 0x0040;
    pub const BUTTON_4_UP: u16 = 0x0080;
    pub const BUTTON_5_DOWN: u16 = 0x0100;
    pub const BUTTON_5_UP: u16 = 0x0200;
}

/// Injection delay offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct DelayRequest {
    pub offset: i32,
}

const _: () = assert!(size_of::<Version>() == 16);
const _: () = assert!(size_of::<EventHeader>() == 48);
const _: () = assert!(size_of::<CopyRequest>() == 32);
const _: () = assert!(size_of::<QueryRequest>() == 32);
const _: () = assert!(size_of::<PollRequest>() == 16);
const _: () = assert!(size_of::<RegionDescriptor>() == 64);
const _: () = assert!(size_of::<KeyboardInput>() == 12);
const _: () = assert!(size_of::<MouseInput>() == 24);
const _: () = assert!(size_of::<DelayRequest>() == 4);

// SAFETY: all of the following are `repr(C)`, padding-free (asserted above)
// and made only of integers.
unsafe impl Wire for Version {}
unsafe impl Wire for EventHeader {}
unsafe impl Wire for CopyRequest {}
unsafe impl Wire for QueryRequest {}
unsafe impl Wire for PollRequest {}
unsafe impl Wire for RegionDescriptor {}
unsafe impl Wire for KeyboardInput {}
unsafe impl Wire for MouseInput {}
unsafe impl Wire for DelayRequest {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_version_matches_package() {
        let expected = env!("CARGO_PKG_VERSION");
        assert_eq!(Version::CURRENT.to_string(), expected);
    }

    #[test]
    fn test_version_compatibility_is_exact() {
        let v = Version::new(1, 2, 3);
        assert!(v.is_compatible(&Version::new(1, 2, 3)));
        assert!(!v.is_compatible(&Version::new(1, 2, 4)));
        assert!(!v.is_compatible(&Version::new(2, 2, 3)));
    }

    #[test]
    fn test_copy_request_wire_image() {
        let request = CopyRequest {
            pid: 4,
            src: 0x1000,
            dst: 0x2000,
            size: 8,
        };
        let bytes = request.as_bytes();
        assert_eq!(bytes.len(), 32);
        assert_eq!(&bytes[0..8], &4u64.to_ne_bytes());
        assert_eq!(&bytes[24..32], &8u64.to_ne_bytes());
        assert_eq!(CopyRequest::read_from(bytes), Some(request));
    }

    #[test]
    fn test_read_from_rejects_wrong_length() {
        assert!(QueryRequest::read_from(&[0u8; 31]).is_none());
        let mut short = [0u8; 8];
        assert!(!Version::CURRENT.write_to(&mut short));
    }

    #[test]
    fn test_event_kind_decoding() {
        let header = EventHeader::new(EventKind::ImageLoaded, 7, 0x40_0000, 0x1000, 3);
        assert_eq!(header.event_kind(), Some(EventKind::ImageLoaded));
        assert_eq!(EventKind::Log.to_string(), "log");

        let unknown = EventHeader {
            kind: 9,
            ..Default::default()
        };
        assert_eq!(unknown.event_kind(), None);
    }

    #[test]
    fn test_protection_helpers() {
        use memory::*;
        assert!(is_readable(PAGE_READWRITE));
        assert!(is_readable(PAGE_EXECUTE_READ));
        assert!(!is_readable(PAGE_NOACCESS));
        assert!(!is_readable(PAGE_READWRITE | PAGE_GUARD));
        assert!(is_writable(PAGE_READWRITE));
        assert!(!is_writable(PAGE_READONLY));
    }
}
