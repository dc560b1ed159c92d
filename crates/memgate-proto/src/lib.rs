//! # memgate-proto
//!
//! Wire protocol shared by the memgate control service and its clients.
//!
//! This crate provides:
//! - Control codes and the device names both sides agree on
//! - Fixed-layout request/response records
//! - NTSTATUS values used on the wire
//! - An intrusive lock-free list and trailing-payload records used to hand
//!   variable-length data across the service/client boundary
//!
//! Nothing in here depends on the execution context: the service and the
//! client library each build their own behaviour on top of these types.

pub mod codes;
pub mod list;
pub mod record;
pub mod records;
pub mod status;
pub mod wire;

pub use codes::{ControlCode, DEVICE_NAME, DEVICE_PATH, SYMBOLIC_LINK};
pub use list::{Drain, ListEntry, ListHandle, ListHeader};
pub use record::{Record, RecordHeader};
pub use records::{
    CopyRequest, DelayRequest, EventHeader, EventKind, KeyboardInput, MouseInput, PollRequest,
    QueryRequest, RegionDescriptor, Version,
};
pub use status::NtStatus;
pub use wire::Wire;

/// Lowest address accepted by read, write and query requests.
pub const MIN_ADDRESS: u64 = 0x0000_0000_0040_0000;

/// Upper bound (exclusive) of the address window accepted by requests.
pub const MAX_ADDRESS: u64 = 0x000F_0000_0000_0000;

/// Check that `[address, address + size)` lies inside the valid window.
///
/// Zero-sized ranges are never valid.
pub fn valid_range(address: u64, size: u64) -> bool {
    if size == 0 || address < MIN_ADDRESS {
        return false;
    }
    match address.checked_add(size) {
        Some(end) => end <= MAX_ADDRESS,
        None => false,
    }
}
