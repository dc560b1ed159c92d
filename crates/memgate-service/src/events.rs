//! Event queue fed by OS notification callbacks.
//!
//! Callbacks run in arbitrary thread context and must never block, so the
//! queue is a lock-free list of self-contained records. Nothing is queued
//! while no client is attached, and nothing in this module logs: a log line
//! from inside a callback could itself produce more events.

use std::ptr::NonNull;
use std::sync::Arc;

use memgate_proto::{EventHeader, EventKind, ListEntry, ListHandle, ListHeader, NtStatus, Record};

use crate::attachment::Attachment;
use crate::host::Host;

/// Attachment and queue shared between the dispatcher and notifiers.
#[derive(Debug, Default)]
pub(crate) struct Shared {
    pub(crate) attachment: Attachment,
    pub(crate) queue: EventQueue,
}

#[derive(Debug, Default)]
pub struct EventQueue {
    list: ListHeader,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    fn push(&self, entry: NonNull<ListEntry>) {
        // SAFETY: `entry` is a freshly built event record nobody else holds.
        unsafe { self.list.push(entry) };
    }

    /// Move every queued event into the caller's list.
    ///
    /// Each record is re-created in caller memory and the queued original is
    /// freed on every path. The first failure becomes the result; records
    /// after it are dropped. Iterating the caller's list afterwards yields the
    /// newest event first.
    pub fn drain_into<H: Host>(&self, host: &H, list: ListHandle) -> NtStatus {
        if list.is_null() {
            return NtStatus::INVALID_PARAMETER;
        }

        // Publishing pushes onto the caller's stack, which reverses the
        // order once more; pre-reverse so the caller sees flush order.
        let oldest_first = ListHeader::new();
        for entry in self.list.flush() {
            // SAFETY: flushed records are exclusively ours.
            unsafe { oldest_first.push(entry) };
        }

        let mut status = NtStatus::SUCCESS;
        for entry in oldest_first.flush() {
            if status.is_success() {
                // SAFETY: flushed records are exclusively ours; the list handle
                // was supplied by the caller for this request.
                let published = unsafe {
                    let image = Record::<EventHeader>::bytes(entry);
                    host.publish_to_caller(list, image, Record::<EventHeader>::ALIGN)
                };
                if let Err(error) = published {
                    status = error;
                }
            }
            // SAFETY: the record left the queue with the flush.
            unsafe { Record::<EventHeader>::free(entry) };
        }
        status
    }

    /// Free every queued event.
    pub fn clear(&self) {
        for entry in self.list.flush() {
            // SAFETY: flushed records are exclusively ours.
            unsafe { Record::<EventHeader>::free(entry) };
        }
    }
}

impl Drop for EventQueue {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Handle given to OS glue for reporting process and image events.
///
/// Cheap to clone; every clone feeds the same queue.
#[derive(Debug, Clone)]
pub struct Notifier {
    shared: Arc<Shared>,
}

impl Notifier {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Whether events are currently being collected.
    pub fn is_armed(&self) -> bool {
        self.shared.attachment.is_attached()
    }

    /// A process was created (`create`) or has terminated.
    pub fn process_notify(&self, pid: u64, create: bool, image_path: &[u16]) {
        let kind = if create {
            EventKind::ProcessCreated
        } else {
            EventKind::ProcessTerminated
        };
        self.post(kind, pid, 0, 0, image_path);
    }

    /// An image was mapped into process `pid`.
    pub fn image_loaded(&self, pid: u64, image_path: &[u16], image_base: u64, image_size: u64) {
        if image_base == 0 || image_size == 0 {
            return;
        }
        self.post(EventKind::ImageLoaded, pid, image_base, image_size, image_path);
    }

    /// Queue a diagnostic message for the attached client.
    pub fn log(&self, message: &str) {
        if !self.is_armed() {
            return;
        }
        let text: Vec<u16> = message.encode_utf16().collect();
        self.post(EventKind::Log, 0, 0, 0, &text);
    }

    fn post(&self, kind: EventKind, pid: u64, image_base: u64, image_size: u64, path: &[u16]) {
        if !self.is_armed() {
            return;
        }
        if pid == 0 && kind != EventKind::Log {
            return;
        }

        let len = path.iter().position(|&c| c == 0).unwrap_or(path.len());
        if len == 0 {
            return;
        }
        let path = &path[..len];

        let header = EventHeader::new(kind, pid, image_base, image_size, len);
        let payload: Vec<u8> = path.iter().flat_map(|c| c.to_ne_bytes()).collect();
        let Some(entry) = Record::with_payload(header, &payload) else {
            return;
        };

        // The client may have detached while the record was built.
        if self.is_armed() {
            self.shared.queue.push(entry);
        } else {
            // SAFETY: never linked.
            unsafe { Record::<EventHeader>::free(entry) };
        }
    }
}
