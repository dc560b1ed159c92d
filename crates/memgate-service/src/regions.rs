//! Region enumeration of a target process.

use memgate_proto::records::memory::{MEM_COMMIT, MEM_IMAGE, PAGE_GUARD, PAGE_NOACCESS};
use memgate_proto::{
    ListHandle, ListHeader, MAX_ADDRESS, MIN_ADDRESS, NtStatus, QueryRequest, Record,
    RegionDescriptor,
};
use tracing::debug;

use crate::host::{Host, MemoryBasicInformation};

/// Exact-match filter applied to candidate regions.
///
/// Every field left as `None` matches anything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionFilter {
    pub region_size: Option<u64>,
    pub state: Option<u32>,
    pub protect: Option<u32>,
    pub kind: Option<u32>,
}

impl RegionFilter {
    pub const ANY: Self = Self {
        region_size: None,
        state: None,
        protect: None,
        kind: None,
    };

    pub fn region_size(mut self, size: u64) -> Self {
        self.region_size = Some(size);
        self
    }

    pub fn state(mut self, state: u32) -> Self {
        self.state = Some(state);
        self
    }

    pub fn protect(mut self, protect: u32) -> Self {
        self.protect = Some(protect);
        self
    }

    pub fn kind(mut self, kind: u32) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn matches(&self, info: &MemoryBasicInformation) -> bool {
        self.region_size.is_none_or(|v| v == info.region_size)
            && self.state.is_none_or(|v| v == info.state)
            && self.protect.is_none_or(|v| v == info.protect)
            && self.kind.is_none_or(|v| v == info.kind)
    }
}

/// Committed, accessible, not guarded and not backed by an image.
pub fn is_candidate(info: &MemoryBasicInformation) -> bool {
    info.state & MEM_COMMIT != 0
        && info.protect & (PAGE_NOACCESS | PAGE_GUARD) == 0
        && info.kind & MEM_IMAGE == 0
}

fn descriptor(info: &MemoryBasicInformation) -> RegionDescriptor {
    RegionDescriptor::new(
        info.base_address,
        info.allocation_base,
        info.allocation_protect,
        info.region_size,
        info.state,
        info.protect,
        info.kind,
    )
}

/// Walk `[request.min, request.max)` of the target and hand one descriptor per
/// accepted region to the caller's list.
///
/// Descriptors reach the caller list so that popping it yields ascending
/// base addresses.
pub fn enumerate<H: Host>(host: &H, filter: &RegionFilter, request: &QueryRequest) -> NtStatus {
    if request.min < MIN_ADDRESS || request.max > MAX_ADDRESS || request.min > request.max {
        return NtStatus::INVALID_PARAMETER;
    }
    let list = ListHandle(request.list);
    if list.is_null() {
        return NtStatus::INVALID_PARAMETER;
    }

    let process = match host.lookup_process(request.pid) {
        Ok(process) => process,
        Err(_) => return NtStatus::NOT_FOUND,
    };

    let collected = ListHeader::new();
    let mut status = NtStatus::SUCCESS;
    {
        let space = host.attach(&process);
        let mut pos = request.min;
        while pos < request.max {
            let info = match space.query(pos) {
                Ok(info) => info,
                Err(NtStatus::INVALID_PARAMETER) => break,
                Err(error) => {
                    status = error;
                    break;
                }
            };

            let next = info.base_address.saturating_add(info.region_size);
            if next <= pos {
                debug!("region walk stalled at {:#x}", pos);
                break;
            }
            pos = next;

            if !is_candidate(&info) || !filter.matches(&info) {
                continue;
            }

            let Some(entry) = Record::allocate(descriptor(&info)) else {
                status = NtStatus::NO_MEMORY;
                break;
            };
            // SAFETY: freshly allocated, owned by `collected` from here on.
            unsafe { collected.push(entry) };
        }
    }
    drop(process);

    for entry in collected.flush() {
        if status.is_success() {
            // SAFETY: flushed records are exclusively ours; the list handle was
            // supplied by the caller for this request.
            let published = unsafe {
                let image = Record::<RegionDescriptor>::bytes(entry);
                host.publish_to_caller(list, image, Record::<RegionDescriptor>::ALIGN)
            };
            if let Err(error) = published {
                status = error;
            }
        }
        // SAFETY: detached by the flush above.
        unsafe { Record::<RegionDescriptor>::free(entry) };
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use memgate_proto::records::memory::*;

    fn info(size: u64, state: u32, protect: u32, kind: u32) -> MemoryBasicInformation {
        MemoryBasicInformation {
            base_address: 0x40_0000,
            region_size: size,
            state,
            protect,
            kind,
            ..Default::default()
        }
    }

    #[test]
    fn test_candidate_rules() {
        assert!(is_candidate(&info(0x1000, MEM_COMMIT, PAGE_READWRITE, MEM_PRIVATE)));
        assert!(!is_candidate(&info(0x1000, MEM_RESERVE, PAGE_READWRITE, MEM_PRIVATE)));
        assert!(!is_candidate(&info(0x1000, MEM_COMMIT, PAGE_NOACCESS, MEM_PRIVATE)));
        assert!(!is_candidate(&info(
            0x1000,
            MEM_COMMIT,
            PAGE_READWRITE | PAGE_GUARD,
            MEM_PRIVATE
        )));
        assert!(!is_candidate(&info(0x1000, MEM_COMMIT, PAGE_READONLY, MEM_IMAGE)));
    }

    #[test]
    fn test_filter_any_matches_everything() {
        assert!(RegionFilter::ANY.matches(&info(1, 2, 3, 4)));
        assert_eq!(RegionFilter::default(), RegionFilter::ANY);
    }

    #[test]
    fn test_filter_fields_are_exact() {
        let filter = RegionFilter::ANY
            .region_size(0x18_0000)
            .state(MEM_COMMIT)
            .protect(PAGE_READWRITE)
            .kind(MEM_PRIVATE);
        assert!(filter.matches(&info(0x18_0000, MEM_COMMIT, PAGE_READWRITE, MEM_PRIVATE)));
        assert!(!filter.matches(&info(0x1000, MEM_COMMIT, PAGE_READWRITE, MEM_PRIVATE)));
        assert!(!filter.matches(&info(0x18_0000, MEM_COMMIT, PAGE_READONLY, MEM_PRIVATE)));
    }
}
