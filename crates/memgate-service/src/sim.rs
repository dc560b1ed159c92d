//! In-memory host for tests and demos.
//!
//! Target processes are maps of regions with byte contents. The calling
//! process is this process: caller-side addresses in requests are real
//! pointers into its memory, exactly as a client sharing the address space
//! would pass them.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use memgate_proto::records::memory::{
    MEM_COMMIT, MEM_FREE, MEM_IMAGE, MEM_PRIVATE, MEM_RESERVE, PAGE_EXECUTE_READ, PAGE_NOACCESS,
    PAGE_READWRITE, is_readable, is_writable,
};
use memgate_proto::{NtStatus, valid_range};
use tracing::debug;

use crate::events::Notifier;
use crate::host::{
    AddressSpace, CopyDirection, CopyOutcome, Host, MemoryBasicInformation, ProcessToken,
    ProcessorMode,
};

/// First address past the simulated user address range.
pub const USER_SPACE_END: u64 = 0x0000_7FFF_FFFF_0000;

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// One region of a simulated address space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimRegion {
    pub base: u64,
    pub allocation_protect: u32,
    pub state: u32,
    pub protect: u32,
    pub kind: u32,
    pub bytes: Vec<u8>,
}

impl SimRegion {
    /// Committed read/write private memory.
    pub fn private(base: u64, bytes: Vec<u8>) -> Self {
        Self {
            base,
            allocation_protect: PAGE_READWRITE,
            state: MEM_COMMIT,
            protect: PAGE_READWRITE,
            kind: MEM_PRIVATE,
            bytes,
        }
    }

    /// Committed executable image section.
    pub fn image(base: u64, bytes: Vec<u8>) -> Self {
        Self {
            base,
            allocation_protect: PAGE_EXECUTE_READ,
            state: MEM_COMMIT,
            protect: PAGE_EXECUTE_READ,
            kind: MEM_IMAGE,
            bytes,
        }
    }

    /// Reserved, uncommitted address range.
    pub fn reserved(base: u64, size: usize) -> Self {
        Self {
            base,
            allocation_protect: PAGE_NOACCESS,
            state: MEM_RESERVE,
            protect: PAGE_NOACCESS,
            kind: MEM_PRIVATE,
            bytes: vec![0; size],
        }
    }

    pub fn with_protect(mut self, protect: u32) -> Self {
        self.protect = protect;
        self
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn end(&self) -> u64 {
        self.base + self.size()
    }

    fn contains(&self, address: u64) -> bool {
        address >= self.base && address < self.end()
    }

    fn info(&self) -> MemoryBasicInformation {
        MemoryBasicInformation {
            base_address: self.base,
            allocation_base: self.base,
            allocation_protect: self.allocation_protect,
            region_size: self.size(),
            state: self.state,
            protect: self.protect,
            kind: self.kind,
        }
    }
}

type RegionMap = BTreeMap<u64, SimRegion>;

fn region_at(regions: &RegionMap, address: u64) -> Option<&SimRegion> {
    regions
        .range(..=address)
        .next_back()
        .map(|(_, region)| region)
        .filter(|region| region.contains(address))
}

/// A simulated target process.
#[derive(Debug)]
pub struct SimProcess {
    pid: u64,
    token: ProcessToken,
    image_path: Vec<u16>,
    alive: AtomicBool,
    regions: RwLock<RegionMap>,
}

impl SimProcess {
    pub fn pid(&self) -> u64 {
        self.pid
    }

    pub fn token(&self) -> ProcessToken {
        self.token
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

struct SimAddressSpace<'a> {
    regions: RwLockReadGuard<'a, RegionMap>,
}

impl AddressSpace for SimAddressSpace<'_> {
    fn query(&self, address: u64) -> Result<MemoryBasicInformation, NtStatus> {
        if address >= USER_SPACE_END {
            return Err(NtStatus::INVALID_PARAMETER);
        }
        if let Some(region) = region_at(&self.regions, address) {
            return Ok(region.info());
        }

        // Free gap up to the next region or the end of user space.
        let next = self
            .regions
            .range(address..)
            .next()
            .map(|(base, _)| *base)
            .unwrap_or(USER_SPACE_END);
        Ok(MemoryBasicInformation {
            base_address: address,
            allocation_base: 0,
            allocation_protect: 0,
            region_size: next - address,
            state: MEM_FREE,
            protect: PAGE_NOACCESS,
            kind: 0,
        })
    }
}

pub struct SimulatedHost {
    processes: RwLock<HashMap<u64, Arc<SimProcess>>>,
    caller: RwLock<Option<ProcessToken>>,
    exited: RwLock<HashSet<ProcessToken>>,
    next_token: AtomicU64,
    notifier: RwLock<Option<Notifier>>,
}

impl Default for SimulatedHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedHost {
    /// An empty system whose caller has a process identity.
    pub fn new() -> Self {
        Self {
            processes: RwLock::new(HashMap::new()),
            caller: RwLock::new(ProcessToken::new(1)),
            exited: RwLock::new(HashSet::new()),
            next_token: AtomicU64::new(2),
            notifier: RwLock::new(None),
        }
    }

    fn mint(&self) -> ProcessToken {
        loop {
            if let Some(token) = ProcessToken::new(self.next_token.fetch_add(1, Ordering::Relaxed)) {
                return token;
            }
        }
    }

    /// Route process and image notifications to a service.
    pub fn connect_notifier(&self, notifier: Notifier) {
        *write(&self.notifier) = Some(notifier);
    }

    pub fn caller(&self) -> Option<ProcessToken> {
        *read(&self.caller)
    }

    /// Issue subsequent requests as `caller`.
    pub fn set_caller(&self, caller: Option<ProcessToken>) {
        *write(&self.caller) = caller;
    }

    /// A fresh identity for a caller process.
    pub fn new_caller(&self) -> ProcessToken {
        self.mint()
    }

    /// Mark a caller process as exited.
    pub fn exit_caller(&self, token: ProcessToken) {
        write(&self.exited).insert(token);
    }

    /// Start a target process.
    pub fn spawn(&self, pid: u64, image_path: &str) -> ProcessToken {
        let token = self.mint();
        let image_path: Vec<u16> = image_path.encode_utf16().collect();
        let process = Arc::new(SimProcess {
            pid,
            token,
            image_path,
            alive: AtomicBool::new(true),
            regions: RwLock::new(BTreeMap::new()),
        });
        let path = process.image_path.clone();
        write(&self.processes).insert(pid, process);
        debug!("spawned simulated process {}", pid);

        if let Some(notifier) = read(&self.notifier).as_ref() {
            notifier.process_notify(pid, true, &path);
        }
        token
    }

    /// Map a region into a target process.
    pub fn map(&self, pid: u64, region: SimRegion) -> Result<(), NtStatus> {
        if region.bytes.is_empty() || region.end() > USER_SPACE_END {
            return Err(NtStatus::INVALID_PARAMETER);
        }
        let processes = read(&self.processes);
        let process = processes.get(&pid).ok_or(NtStatus::NOT_FOUND)?;
        let mut regions = write(&process.regions);

        let overlaps_previous = regions
            .range(..region.end())
            .next_back()
            .is_some_and(|(_, other)| other.end() > region.base);
        if overlaps_previous {
            return Err(NtStatus::INVALID_PARAMETER);
        }
        regions.insert(region.base, region);
        Ok(())
    }

    /// Map an image section and report it as loaded.
    pub fn load_image(&self, pid: u64, path: &str, region: SimRegion) -> Result<(), NtStatus> {
        let (base, size) = (region.base, region.size());
        self.map(pid, region)?;
        if let Some(notifier) = read(&self.notifier).as_ref() {
            let path: Vec<u16> = path.encode_utf16().collect();
            notifier.image_loaded(pid, &path, base, size);
        }
        Ok(())
    }

    /// Terminate a target process. Later lookups of `pid` fail.
    pub fn terminate(&self, pid: u64) {
        let Some(process) = write(&self.processes).remove(&pid) else {
            return;
        };
        process.alive.store(false, Ordering::Release);
        write(&self.exited).insert(process.token);
        debug!("terminated simulated process {}", pid);

        if let Some(notifier) = read(&self.notifier).as_ref() {
            notifier.process_notify(pid, false, &process.image_path);
        }
    }

    /// Bytes of a target process, if the whole range is mapped.
    pub fn peek(&self, pid: u64, address: u64, len: usize) -> Option<Vec<u8>> {
        let processes = read(&self.processes);
        let regions = read(&processes.get(&pid)?.regions);
        let mut out = vec![0u8; len];
        (read_target(&regions, address, &mut out, false) == len).then_some(out)
    }
}

/// Copy out of target regions until an unmapped or unreadable byte.
fn read_target(regions: &RegionMap, address: u64, out: &mut [u8], check_protect: bool) -> usize {
    let mut copied = 0;
    while copied < out.len() {
        let at = address + copied as u64;
        let Some(region) = region_at(regions, at) else {
            break;
        };
        if check_protect && (region.state & MEM_COMMIT == 0 || !is_readable(region.protect)) {
            break;
        }
        let offset = (at - region.base) as usize;
        let chunk = (out.len() - copied).min(region.bytes.len() - offset);
        out[copied..copied + chunk].copy_from_slice(&region.bytes[offset..offset + chunk]);
        copied += chunk;
    }
    copied
}

/// Copy into target regions until an unmapped or read-only byte.
fn write_target(regions: &mut RegionMap, address: u64, data: &[u8]) -> usize {
    let mut copied = 0;
    while copied < data.len() {
        let at = address + copied as u64;
        let Some(base) = region_at(regions, at).map(|region| region.base) else {
            break;
        };
        let Some(region) = regions.get_mut(&base) else {
            break;
        };
        if region.state & MEM_COMMIT == 0 || !is_writable(region.protect) {
            break;
        }
        let offset = (at - region.base) as usize;
        let chunk = (data.len() - copied).min(region.bytes.len() - offset);
        region.bytes[offset..offset + chunk].copy_from_slice(&data[copied..copied + chunk]);
        copied += chunk;
    }
    copied
}

/// Copies move through a bounded buffer so the request size alone never
/// decides how much memory is allocated.
const STAGING_LEN: usize = 0x1_0000;

fn outcome(copied: usize, size: usize) -> CopyOutcome {
    match copied {
        n if n == size => CopyOutcome::complete(n),
        0 => CopyOutcome::failed(NtStatus::ACCESS_VIOLATION, 0),
        n => CopyOutcome::failed(NtStatus::PARTIAL_COPY, n),
    }
}

impl Host for SimulatedHost {
    type Process = Arc<SimProcess>;

    fn current_process(&self) -> Option<ProcessToken> {
        self.caller()
    }

    fn is_process_alive(&self, token: ProcessToken) -> bool {
        !read(&self.exited).contains(&token)
    }

    fn lookup_process(&self, pid: u64) -> Result<Self::Process, NtStatus> {
        read(&self.processes)
            .get(&pid)
            .filter(|process| process.is_alive())
            .cloned()
            .ok_or(NtStatus::INVALID_PARAMETER)
    }

    fn attach<'a>(&'a self, process: &'a Self::Process) -> Box<dyn AddressSpace + 'a> {
        Box::new(SimAddressSpace {
            regions: read(&process.regions),
        })
    }

    fn copy_virtual_memory(
        &self,
        process: &Self::Process,
        direction: CopyDirection,
        src: u64,
        dst: u64,
        size: usize,
        mode: ProcessorMode,
    ) -> CopyOutcome {
        if !process.is_alive() {
            return CopyOutcome::failed(NtStatus::PROCESS_IS_TERMINATING, 0);
        }
        let caller_address = match direction {
            CopyDirection::FromTarget => dst,
            CopyDirection::ToTarget => src,
        };
        if caller_address == 0
            || (mode == ProcessorMode::User && !valid_range(caller_address, size as u64))
        {
            return CopyOutcome::failed(NtStatus::ACCESS_VIOLATION, 0);
        }

        let mut staging = vec![0u8; size.min(STAGING_LEN)];
        let mut copied = 0;
        while copied < size {
            let want = (size - copied).min(staging.len());
            let chunk = &mut staging[..want];
            let moved = match direction {
                CopyDirection::FromTarget => {
                    let regions = read(&process.regions);
                    let n = read_target(&regions, src + copied as u64, chunk, true);
                    // SAFETY: the caller shares this address space and handed
                    // us a buffer of at least `size` bytes at `dst`.
                    unsafe {
                        let out = (dst as *mut u8).add(copied);
                        ptr::copy_nonoverlapping(chunk.as_ptr(), out, n);
                    }
                    n
                }
                CopyDirection::ToTarget => {
                    // SAFETY: as above, `src` is a caller buffer of `size` bytes.
                    unsafe {
                        let from = (src as *const u8).add(copied);
                        ptr::copy_nonoverlapping(from, chunk.as_mut_ptr(), want);
                    }
                    write_target(&mut write(&process.regions), dst + copied as u64, chunk)
                }
            };
            copied += moved;
            if moved < want {
                break;
            }
        }
        outcome(copied, size)
    }
}
