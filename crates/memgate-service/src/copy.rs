//! Cross-process copy between the caller and a target process.

use memgate_proto::{CopyRequest, NtStatus, valid_range};

use crate::host::{CopyDirection, Host, ProcessorMode};

/// Copy `request.size` bytes in `direction`.
///
/// Both ranges must lie inside the address window. A transfer that moves
/// fewer bytes than requested fails with `STATUS_BUFFER_TOO_SMALL`.
pub fn copy<H: Host>(host: &H, request: &CopyRequest, direction: CopyDirection) -> NtStatus {
    if !valid_range(request.src, request.size) || !valid_range(request.dst, request.size) {
        return NtStatus::INVALID_PARAMETER;
    }
    let Ok(size) = usize::try_from(request.size) else {
        return NtStatus::INVALID_PARAMETER;
    };

    let process = match host.lookup_process(request.pid) {
        Ok(process) => process,
        Err(_) => return NtStatus::NOT_FOUND,
    };

    let outcome = host.copy_virtual_memory(
        &process,
        direction,
        request.src,
        request.dst,
        size,
        ProcessorMode::Kernel,
    );
    drop(process);

    match outcome.status {
        NtStatus::PARTIAL_COPY => NtStatus::BUFFER_TOO_SMALL,
        status if status.is_success() && outcome.copied != size => NtStatus::BUFFER_TOO_SMALL,
        status => status,
    }
}
