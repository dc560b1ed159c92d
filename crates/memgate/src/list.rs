//! Owned lists of records handed over by the service.

use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;

use memgate_proto::{
    EventHeader, EventKind, ListEntry, ListHandle, ListHeader, Record, RecordHeader,
    RegionDescriptor,
};

/// A caller-owned list header plus every record linked onto it.
///
/// The header lives on the heap so its address stays valid for the service
/// to publish into. Dropping the list frees all records.
pub struct RecordList<T: RecordHeader> {
    header: Box<ListHeader>,
    _marker: PhantomData<T>,
}

pub type RegionList = RecordList<RegionDescriptor>;
pub type EventList = RecordList<EventHeader>;

impl<T: RecordHeader> RecordList<T> {
    pub fn new() -> Self {
        Self {
            header: Box::new(ListHeader::new()),
            _marker: PhantomData,
        }
    }

    /// Address the service publishes records to.
    pub fn handle(&self) -> ListHandle {
        self.header.handle()
    }

    pub fn is_empty(&self) -> bool {
        self.header.is_empty()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Walk the records, newest first, without detaching them.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            next: self.header.peek(),
            _marker: PhantomData,
        }
    }

    /// Free every record.
    pub fn clear(&mut self) {
        for entry in self.header.flush() {
            // SAFETY: records on this list were allocated with `Record<T>`'s
            // layout and are exclusively ours once flushed.
            unsafe { Record::<T>::free(entry) };
        }
    }

    pub(crate) fn header(&self) -> &ListHeader {
        &self.header
    }

    /// Link an owned record block.
    ///
    /// # Safety
    ///
    /// `entry` must be a `Record<T>` block not linked on any list.
    pub(crate) unsafe fn push(&self, entry: NonNull<ListEntry>) {
        // SAFETY: forwarded to the caller.
        unsafe { self.header.push(entry) };
    }

    /// Move every record of `other` onto this list, reversing their order.
    pub(crate) fn take_reversed(&mut self, other: &mut Self) {
        for entry in other.header.flush() {
            // SAFETY: flushed entries are exclusively ours.
            unsafe { self.header.push(entry) };
        }
    }
}

impl<T: RecordHeader> Default for RecordList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: RecordHeader> Drop for RecordList<T> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<T: RecordHeader> fmt::Debug for RecordList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordList")
            .field("handle", &self.handle())
            .field("len", &self.len())
            .finish()
    }
}

impl<'a, T: RecordHeader> IntoIterator for &'a RecordList<T> {
    type Item = RecordRef<'a, T>;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct Iter<'a, T: RecordHeader> {
    next: Option<NonNull<ListEntry>>,
    _marker: PhantomData<&'a RecordList<T>>,
}

impl<'a, T: RecordHeader> Iterator for Iter<'a, T> {
    type Item = RecordRef<'a, T>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.next?;
        // SAFETY: the list is borrowed for 'a, so nothing pops or frees its
        // records while we walk it.
        self.next = unsafe { entry.as_ref() }.next();
        Some(RecordRef {
            entry,
            _marker: PhantomData,
        })
    }
}

/// Borrowed view of one record.
pub struct RecordRef<'a, T: RecordHeader> {
    entry: NonNull<ListEntry>,
    _marker: PhantomData<&'a T>,
}

impl<'a, T: RecordHeader> RecordRef<'a, T> {
    pub fn header(&self) -> &'a T {
        // SAFETY: the record is alive for 'a.
        unsafe { Record::<T>::header(self.entry) }
    }

    pub fn payload(&self) -> &'a [u8] {
        // SAFETY: the record is alive for 'a.
        unsafe { Record::<T>::payload(self.entry) }
    }
}

impl<T: RecordHeader> Deref for RecordRef<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.header()
    }
}

impl<T: RecordHeader + fmt::Debug> fmt::Debug for RecordRef<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordRef")
            .field("header", self.header())
            .field("payload_len", &self.payload().len())
            .finish()
    }
}

impl<'a> RecordRef<'a, RegionDescriptor> {
    pub fn base(&self) -> u64 {
        self.header().base_address
    }

    /// Captured region content; empty until the region has been captured.
    pub fn data(&self) -> &'a [u8] {
        self.payload()
    }
}

impl RecordRef<'_, EventHeader> {
    pub fn kind(&self) -> Option<EventKind> {
        self.header().event_kind()
    }

    pub fn pid(&self) -> u64 {
        self.header().pid
    }

    /// Image path or log message.
    pub fn text(&self) -> String {
        let units: Vec<u16> = self
            .payload()
            .chunks_exact(2)
            .map(|pair| u16::from_ne_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    }
}
