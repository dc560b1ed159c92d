//! OS primitives the control service is built on.
//!
//! The service never talks to the operating system directly. Everything it
//! needs (process identity, process lookup, address-space queries and the
//! cross-process copy primitive) goes through [`Host`], so the same dispatch
//! code runs against the simulated host in tests and against a real backend.

use std::ptr;

use memgate_proto::record::allocate_block;
use memgate_proto::{ListEntry, ListHandle, NtStatus};
use strum::{Display, IntoStaticStr};

/// Opaque identity of a client process.
///
/// Zero is reserved for "no process" so a token always fits in an atomic
/// slot next to the empty value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessToken(u64);

impl ProcessToken {
    pub fn new(raw: u64) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// One entry of an address-space walk (`MEMORY_BASIC_INFORMATION`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryBasicInformation {
    pub base_address: u64,
    pub allocation_base: u64,
    pub allocation_protect: u32,
    pub region_size: u64,
    pub state: u32,
    pub protect: u32,
    pub kind: u32,
}

/// Previous-mode argument of the copy primitive.
///
/// `Kernel` skips the probing of caller-supplied addresses that `User`
/// performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
pub enum ProcessorMode {
    #[strum(serialize = "kernel")]
    Kernel,
    #[strum(serialize = "user")]
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
pub enum CopyDirection {
    /// Target process to caller (read).
    #[strum(serialize = "read")]
    FromTarget,
    /// Caller to target process (write).
    #[strum(serialize = "write")]
    ToTarget,
}

/// Result of one call to the copy primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyOutcome {
    pub status: NtStatus,
    pub copied: usize,
}

impl CopyOutcome {
    pub fn complete(copied: usize) -> Self {
        Self {
            status: NtStatus::SUCCESS,
            copied,
        }
    }

    pub fn failed(status: NtStatus, copied: usize) -> Self {
        Self { status, copied }
    }
}

/// A target address space entered for the duration of a walk.
///
/// Dropping the guard leaves the address space.
pub trait AddressSpace {
    /// Describe the region containing `address`.
    ///
    /// Returns `STATUS_INVALID_PARAMETER` once `address` lies beyond the end of
    /// the user address range.
    fn query(&self, address: u64) -> Result<MemoryBasicInformation, NtStatus>;
}

pub trait Host: Send + Sync {
    /// Referenced target process; dropping it releases the reference.
    type Process;

    /// Identity of the process issuing the current request, if any.
    fn current_process(&self) -> Option<ProcessToken>;

    fn is_process_alive(&self, token: ProcessToken) -> bool;

    /// Resolve a process id to a referenced process.
    fn lookup_process(&self, pid: u64) -> Result<Self::Process, NtStatus>;

    /// Enter the address space of `process`.
    fn attach<'a>(&'a self, process: &'a Self::Process) -> Box<dyn AddressSpace + 'a>;

    /// Copy `size` bytes between the caller and `process`.
    ///
    /// For [`CopyDirection::FromTarget`] `src` is a target address and `dst` a
    /// caller address; for [`CopyDirection::ToTarget`] it is the reverse.
    fn copy_virtual_memory(
        &self,
        process: &Self::Process,
        direction: CopyDirection,
        src: u64,
        dst: u64,
        size: usize,
        mode: ProcessorMode,
    ) -> CopyOutcome;

    /// Copy a record image into newly allocated memory of the calling process
    /// and link it onto the caller's list.
    ///
    /// The default implementation serves a caller that shares this address
    /// space: the block comes from the global allocator with `align`, which is
    /// how the client later frees it.
    ///
    /// # Safety
    ///
    /// `list` must be a live [`ListHeader`](memgate_proto::ListHeader) handle
    /// of the calling process, and `image` must start with a [`ListEntry`].
    unsafe fn publish_to_caller(
        &self,
        list: ListHandle,
        image: &[u8],
        align: usize,
    ) -> Result<(), NtStatus> {
        // SAFETY: forwarded to the caller.
        let header = unsafe { list.as_header() }.ok_or(NtStatus::INVALID_PARAMETER)?;
        let block = allocate_block(image.len(), align).ok_or(NtStatus::NO_MEMORY)?;
        // SAFETY: the block holds `image.len()` bytes and is exclusively ours
        // until it is linked.
        unsafe {
            ptr::copy_nonoverlapping(image.as_ptr(), block.as_ptr(), image.len());
            header.push(block.cast::<ListEntry>());
        }
        Ok(())
    }
}
