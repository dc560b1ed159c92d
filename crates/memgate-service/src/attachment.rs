//! Single-client attachment.
//!
//! At most one client process is attached at a time. Events are only queued
//! while someone is attached; the attachment itself carries no other state.

use std::sync::atomic::{AtomicU64, Ordering};

use memgate_proto::NtStatus;
use tracing::debug;

use crate::host::ProcessToken;

#[derive(Debug, Default)]
pub struct Attachment {
    owner: AtomicU64,
}

impl Attachment {
    pub const fn new() -> Self {
        Self {
            owner: AtomicU64::new(0),
        }
    }

    pub fn owner(&self) -> Option<ProcessToken> {
        ProcessToken::new(self.owner.load(Ordering::Acquire))
    }

    pub fn is_attached(&self) -> bool {
        self.owner.load(Ordering::Acquire) != 0
    }

    /// Make `caller` the owner, replacing any previous owner.
    pub fn attach(&self, caller: Option<ProcessToken>) -> Result<(), NtStatus> {
        let caller = caller.ok_or(NtStatus::INVALID_HANDLE)?;
        let previous = self.owner.swap(caller.get(), Ordering::AcqRel);
        if previous != 0 && previous != caller.get() {
            debug!("attachment taken over from {:#x}", previous);
        }
        Ok(())
    }

    /// Release the attachment. Never fails.
    ///
    /// Only the owner clears it, except that a stale owner whose process has
    /// exited is cleared by anyone. A caller without a process identity clears
    /// unconditionally.
    pub fn detach(&self, caller: Option<ProcessToken>, is_alive: impl Fn(ProcessToken) -> bool) {
        let Some(caller) = caller else {
            self.owner.store(0, Ordering::Release);
            return;
        };

        match self
            .owner
            .compare_exchange(caller.get(), 0, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(current) => {
                if let Some(owner) = ProcessToken::new(current) {
                    if !is_alive(owner) {
                        // Only clear if nobody re-attached in the meantime.
                        let _ = self.owner.compare_exchange(
                            current,
                            0,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        );
                    }
                }
            }
        }
    }
}
