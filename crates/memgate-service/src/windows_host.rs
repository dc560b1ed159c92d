//! User-mode host backed by the Win32 process APIs.
//!
//! Serves a caller that lives in this same process. Target access goes
//! through process handles, so it is limited by the privileges of the
//! running account.

use std::ffi::c_void;
use std::mem::size_of;

use memgate_proto::NtStatus;
use tracing::debug;
use windows::Win32::Foundation::{CloseHandle, HANDLE, STILL_ACTIVE};
use windows::Win32::System::Diagnostics::Debug::{ReadProcessMemory, WriteProcessMemory};
use windows::Win32::System::Memory::{MEMORY_BASIC_INFORMATION, VirtualQueryEx};
use windows::Win32::System::Threading::{
    GetCurrentProcessId, GetExitCodeProcess, OpenProcess, PROCESS_QUERY_INFORMATION,
    PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_VM_OPERATION, PROCESS_VM_READ, PROCESS_VM_WRITE,
};

use crate::host::{
    AddressSpace, CopyDirection, CopyOutcome, Host, MemoryBasicInformation, ProcessToken,
    ProcessorMode,
};

/// An open target process handle, closed on drop.
#[derive(Debug)]
pub struct WinProcess {
    handle: HANDLE,
}

impl Drop for WinProcess {
    fn drop(&mut self) {
        // SAFETY: the handle was opened by `lookup_process` and is closed once.
        unsafe { CloseHandle(self.handle).ok() };
    }
}

// SAFETY: process handles may be used from any thread.
unsafe impl Send for WinProcess {}
unsafe impl Sync for WinProcess {}

struct WinAddressSpace<'a> {
    process: &'a WinProcess,
}

impl AddressSpace for WinAddressSpace<'_> {
    fn query(&self, address: u64) -> Result<MemoryBasicInformation, NtStatus> {
        let mut mbi = MEMORY_BASIC_INFORMATION::default();
        // SAFETY: `mbi` is a valid out buffer of the size passed.
        let written = unsafe {
            VirtualQueryEx(
                self.process.handle,
                Some(address as *const c_void),
                &mut mbi,
                size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if written == 0 {
            // Past the highest user address.
            return Err(NtStatus::INVALID_PARAMETER);
        }
        Ok(MemoryBasicInformation {
            base_address: mbi.BaseAddress as u64,
            allocation_base: mbi.AllocationBase as u64,
            allocation_protect: mbi.AllocationProtect.0,
            region_size: mbi.RegionSize as u64,
            state: mbi.State.0,
            protect: mbi.Protect.0,
            kind: mbi.Type.0,
        })
    }
}

#[derive(Debug, Default)]
pub struct WindowsHost;

impl WindowsHost {
    pub fn new() -> Self {
        Self
    }
}

impl Host for WindowsHost {
    type Process = WinProcess;

    fn current_process(&self) -> Option<ProcessToken> {
        // SAFETY: no preconditions.
        ProcessToken::new(u64::from(unsafe { GetCurrentProcessId() }))
    }

    fn is_process_alive(&self, token: ProcessToken) -> bool {
        let Ok(pid) = u32::try_from(token.get()) else {
            return false;
        };
        // SAFETY: plain handle query; the handle is closed below.
        let Ok(handle) = (unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid) })
        else {
            return false;
        };
        let process = WinProcess { handle };
        let mut code = 0u32;
        // SAFETY: `code` is a valid out pointer.
        let queried = unsafe { GetExitCodeProcess(process.handle, &mut code) };
        queried.is_ok() && code == STILL_ACTIVE.0 as u32
    }

    fn lookup_process(&self, pid: u64) -> Result<Self::Process, NtStatus> {
        let pid = u32::try_from(pid).map_err(|_| NtStatus::INVALID_PARAMETER)?;
        let access = PROCESS_QUERY_INFORMATION
            | PROCESS_VM_READ
            | PROCESS_VM_WRITE
            | PROCESS_VM_OPERATION;
        // SAFETY: the returned handle is owned by `WinProcess`.
        let handle = unsafe { OpenProcess(access, false, pid) }.map_err(|e| {
            debug!("OpenProcess({}) failed: {}", pid, e);
            NtStatus::INVALID_PARAMETER
        })?;
        Ok(WinProcess { handle })
    }

    fn attach<'a>(&'a self, process: &'a Self::Process) -> Box<dyn AddressSpace + 'a> {
        Box::new(WinAddressSpace { process })
    }

    fn copy_virtual_memory(
        &self,
        process: &Self::Process,
        direction: CopyDirection,
        src: u64,
        dst: u64,
        size: usize,
        _mode: ProcessorMode,
    ) -> CopyOutcome {
        let mut copied = 0usize;
        // SAFETY: caller-side addresses point into this process and span
        // `size` bytes; the target side is checked by the OS.
        let result = unsafe {
            match direction {
                CopyDirection::FromTarget => ReadProcessMemory(
                    process.handle,
                    src as *const c_void,
                    dst as *mut c_void,
                    size,
                    Some(&mut copied),
                ),
                CopyDirection::ToTarget => WriteProcessMemory(
                    process.handle,
                    dst as *const c_void,
                    src as *const c_void,
                    size,
                    Some(&mut copied),
                ),
            }
        };
        match result {
            Ok(()) => CopyOutcome::complete(copied),
            Err(_) if copied > 0 => CopyOutcome::failed(NtStatus::PARTIAL_COPY, copied),
            Err(e) => {
                debug!("{} at {:#x} failed: {}", direction, src, e);
                CopyOutcome::failed(NtStatus::ACCESS_VIOLATION, 0)
            }
        }
    }
}
