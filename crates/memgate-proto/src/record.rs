//! Listable heap records with a trailing variable-length payload.
//!
//! A record is one 16-byte aligned block laid out as
//! `[ListEntry][header T][payload]`. The payload length is always derivable
//! from the header, so whichever side ends up owning a record can free it
//! without any side table.

use std::alloc::{self, Layout};
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ptr::{self, NonNull};
use std::slice;

use crate::list::ListEntry;
use crate::records::{EventHeader, RegionDescriptor};
use crate::wire::Wire;

/// A fixed header whose trailing payload length it knows.
pub trait RecordHeader: Wire {
    fn payload_len(&self) -> usize;
}

impl RecordHeader for EventHeader {
    fn payload_len(&self) -> usize {
        self.path_len as usize * size_of::<u16>()
    }
}

impl RecordHeader for RegionDescriptor {
    fn payload_len(&self) -> usize {
        self.copied_size as usize
    }
}

#[repr(C)]
struct Node<T> {
    entry: ListEntry,
    header: T,
}

/// Typed accessors over raw record blocks. Never instantiated.
pub struct Record<T>(PhantomData<T>);

impl<T: RecordHeader> Record<T> {
    /// Offset of the payload from the start of the block.
    pub const PAYLOAD_OFFSET: usize = size_of::<Node<T>>();

    /// Alignment of every record block.
    pub const ALIGN: usize = align_of::<Node<T>>();

    /// Total block size for a record with the given header.
    pub fn byte_len(header: &T) -> usize {
        Self::PAYLOAD_OFFSET + header.payload_len()
    }

    /// Layout of a block of `len` bytes.
    pub fn layout(len: usize) -> Option<Layout> {
        Layout::from_size_align(len, Self::ALIGN).ok()
    }

    /// Allocate a record and fill its header; the payload is zeroed.
    ///
    /// Returns `None` when the allocator fails. The caller owns the block.
    pub fn allocate(header: T) -> Option<NonNull<ListEntry>> {
        let layout = Self::layout(Self::byte_len(&header))?;
        // SAFETY: the layout is never zero-sized (it always holds a node).
        let block = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })?;
        let node = block.cast::<Node<T>>();
        // SAFETY: the block is large enough and aligned for a node.
        unsafe {
            node.as_ptr().write(Node {
                entry: ListEntry::new(),
                header,
            })
        };
        Some(node.cast())
    }

    /// Allocate a record and copy `payload` behind the header.
    ///
    /// `payload` is truncated or zero-extended to the header's payload length.
    pub fn with_payload(header: T, payload: &[u8]) -> Option<NonNull<ListEntry>> {
        let entry = Self::allocate(header)?;
        // SAFETY: freshly allocated, exclusively owned.
        let target = unsafe { Self::payload_mut(entry) };
        let len = target.len().min(payload.len());
        target[..len].copy_from_slice(&payload[..len]);
        Some(entry)
    }

    /// # Safety
    ///
    /// `entry` must be a live record block of type `T`.
    pub unsafe fn header<'a>(entry: NonNull<ListEntry>) -> &'a T {
        // SAFETY: forwarded to the caller.
        unsafe { &(*entry.cast::<Node<T>>().as_ptr()).header }
    }

    /// # Safety
    ///
    /// `entry` must be a live record block of type `T`, exclusively owned by
    /// the caller.
    pub unsafe fn header_mut<'a>(entry: NonNull<ListEntry>) -> &'a mut T {
        // SAFETY: forwarded to the caller.
        unsafe { &mut (*entry.cast::<Node<T>>().as_ptr()).header }
    }

    /// # Safety
    ///
    /// `entry` must be a live record block of type `T`.
    pub unsafe fn payload<'a>(entry: NonNull<ListEntry>) -> &'a [u8] {
        // SAFETY: forwarded to the caller; the block extends past the node.
        unsafe {
            let len = Self::header(entry).payload_len();
            let start = entry.cast::<u8>().as_ptr().add(Self::PAYLOAD_OFFSET);
            slice::from_raw_parts(start, len)
        }
    }

    /// # Safety
    ///
    /// `entry` must be a live record block of type `T`, exclusively owned by
    /// the caller.
    pub unsafe fn payload_mut<'a>(entry: NonNull<ListEntry>) -> &'a mut [u8] {
        // SAFETY: forwarded to the caller.
        unsafe {
            let len = Self::header(entry).payload_len();
            let start = entry.cast::<u8>().as_ptr().add(Self::PAYLOAD_OFFSET);
            slice::from_raw_parts_mut(start, len)
        }
    }

    /// The whole block as bytes, link included.
    ///
    /// # Safety
    ///
    /// `entry` must be a live record block of type `T`.
    pub unsafe fn bytes<'a>(entry: NonNull<ListEntry>) -> &'a [u8] {
        // SAFETY: forwarded to the caller.
        unsafe {
            let len = Self::byte_len(Self::header(entry));
            slice::from_raw_parts(entry.cast::<u8>().as_ptr(), len)
        }
    }

    /// Release a record block.
    ///
    /// # Safety
    ///
    /// `entry` must be a record block of type `T` allocated by this module (or
    /// with the same layout), not linked on any list, and not used afterwards.
    pub unsafe fn free(entry: NonNull<ListEntry>) {
        // SAFETY: forwarded to the caller.
        unsafe {
            let len = Self::byte_len(Self::header(entry));
            if let Some(layout) = Self::layout(len) {
                ptr::drop_in_place(entry.cast::<Node<T>>().as_ptr());
                alloc::dealloc(entry.cast::<u8>().as_ptr(), layout);
            }
        }
    }
}

/// Allocate a raw block able to hold a record of `len` bytes.
///
/// Used when a record image is copied byte for byte into a new block.
pub fn allocate_block(len: usize, align: usize) -> Option<NonNull<u8>> {
    let layout = Layout::from_size_align(len, align).ok()?;
    if layout.size() == 0 {
        return None;
    }
    // SAFETY: non-zero size checked above.
    NonNull::new(unsafe { alloc::alloc(layout) })
}
