//! Intrusive lock-free singly linked list.
//!
//! Entries are embedded at the start of heap blocks owned by whoever pushed
//! them; the list only links them. Pushing transfers ownership of the block to
//! the list, `pop` and `flush` transfer it back to the caller, who must either
//! free it or push it somewhere else.

use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

/// Link embedded at offset 0 of every listed block.
#[derive(Debug, Default)]
#[repr(C, align(16))]
pub struct ListEntry {
    next: AtomicPtr<ListEntry>,
}

impl ListEntry {
    pub const fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// The entry linked after this one.
    pub fn next(&self) -> Option<NonNull<ListEntry>> {
        NonNull::new(self.next.load(Ordering::Acquire))
    }
}

/// Head of an intrusive stack.
#[derive(Default)]
#[repr(C, align(16))]
pub struct ListHeader {
    head: AtomicPtr<ListEntry>,
    reserved: u64,
}

/// Process-relative address of a [`ListHeader`].
///
/// Only the process that allocated the header may turn it back into a
/// reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct ListHandle(pub u64);

impl ListHandle {
    pub const NULL: Self = Self(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// # Safety
    ///
    /// The handle must come from [`ListHeader::handle`] in this process and
    /// the header must outlive `'a`.
    pub unsafe fn as_header<'a>(self) -> Option<&'a ListHeader> {
        // SAFETY: forwarded to the caller.
        unsafe { (self.0 as *const ListHeader).as_ref() }
    }
}

impl ListHeader {
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            reserved: 0,
        }
    }

    pub fn handle(&self) -> ListHandle {
        ListHandle(self as *const Self as u64)
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Newest entry, left on the list.
    ///
    /// Following [`ListEntry::next`] from here is only sound while nobody
    /// pops or flushes the list.
    pub fn peek(&self) -> Option<NonNull<ListEntry>> {
        NonNull::new(self.head.load(Ordering::Acquire))
    }

    /// Push an entry onto the stack. Safe to call concurrently from any thread.
    ///
    /// # Safety
    ///
    /// `entry` must point to a live block that is not on any list; the list
    /// owns it until it is popped or flushed.
    pub unsafe fn push(&self, entry: NonNull<ListEntry>) {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: the caller hands us exclusive access to `entry`.
            unsafe { entry.as_ref() }.next.store(head, Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                entry.as_ptr(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Pop the most recently pushed entry.
    ///
    /// # Safety
    ///
    /// While other threads may still pop from this list, popped entries must
    /// neither be freed nor pushed back onto this same list. Pushing them onto
    /// a different list is fine.
    pub unsafe fn pop(&self) -> Option<NonNull<ListEntry>> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let entry = NonNull::new(head)?;
            // SAFETY: entries stay allocated while poppers may observe them.
            let next = unsafe { entry.as_ref() }.next.load(Ordering::Relaxed);
            match self
                .head
                .compare_exchange_weak(head, next, Ordering::Acquire, Ordering::Acquire)
            {
                Ok(_) => return Some(entry),
                Err(current) => head = current,
            }
        }
    }

    /// Atomically detach every entry. The chain comes back newest first.
    pub fn flush(&self) -> Drain {
        Drain {
            next: self.head.swap(ptr::null_mut(), Ordering::Acquire),
        }
    }
}

impl fmt::Debug for ListHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListHeader")
            .field("head", &self.head.load(Ordering::Relaxed))
            .finish()
    }
}

/// Chain of entries detached by [`ListHeader::flush`].
///
/// The iterator reads each link before yielding the entry, so the consumer
/// may free or re-link an entry as soon as it receives it. Entries left in an
/// unfinished drain are leaked, not freed.
pub struct Drain {
    next: *mut ListEntry,
}

impl Iterator for Drain {
    type Item = NonNull<ListEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = NonNull::new(self.next)?;
        // SAFETY: flushed entries are exclusively owned by this drain.
        self.next = unsafe { entry.as_ref() }.next.load(Ordering::Relaxed);
        Some(entry)
    }
}

// SAFETY: a drain exclusively owns its detached chain.
unsafe impl Send for Drain {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[repr(C)]
    struct Node {
        entry: ListEntry,
        value: u32,
    }

    fn node(value: u32) -> NonNull<ListEntry> {
        let boxed = Box::new(Node {
            entry: ListEntry::new(),
            value,
        });
        NonNull::from(Box::leak(boxed)).cast()
    }

    unsafe fn take(entry: NonNull<ListEntry>) -> u32 {
        unsafe { Box::from_raw(entry.cast::<Node>().as_ptr()) }.value
    }

    #[test]
    fn test_flush_is_lifo() {
        let list = ListHeader::new();
        unsafe {
            list.push(node(1));
            list.push(node(2));
            list.push(node(3));
        }
        let values: Vec<u32> = list.flush().map(|e| unsafe { take(e) }).collect();
        assert_eq!(values, vec![3, 2, 1]);
        assert!(list.is_empty());
        assert_eq!(list.flush().count(), 0);
    }

    #[test]
    fn test_pop_until_empty() {
        let list = ListHeader::new();
        unsafe {
            list.push(node(10));
            list.push(node(20));
            assert_eq!(take(list.pop().unwrap()), 20);
            assert_eq!(take(list.pop().unwrap()), 10);
            assert!(list.pop().is_none());
        }
    }

    #[test]
    fn test_peek_walks_without_detaching() {
        let list = ListHeader::new();
        unsafe {
            list.push(node(1));
            list.push(node(2));
        }
        let first = list.peek().unwrap();
        let second = unsafe { first.as_ref() }.next().unwrap();
        assert!(unsafe { second.as_ref() }.next().is_none());
        assert_eq!(unsafe { second.cast::<Node>().as_ref() }.value, 1);
        assert_eq!(list.flush().map(|e| unsafe { take(e) }).count(), 2);
    }

    #[test]
    fn test_handle_round_trip() {
        let list = ListHeader::new();
        let handle = list.handle();
        assert!(!handle.is_null());
        let back = unsafe { handle.as_header() }.unwrap();
        assert!(std::ptr::eq(back, &list));
        assert!(unsafe { ListHandle::NULL.as_header() }.is_none());
    }

    #[test]
    fn test_concurrent_push_then_flush() {
        let list = Arc::new(ListHeader::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let list = Arc::clone(&list);
                thread::spawn(move || {
                    for i in 0..250 {
                        unsafe { list.push(node(t * 1000 + i)) };
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut values: Vec<u32> = list.flush().map(|e| unsafe { take(e) }).collect();
        assert_eq!(values.len(), 1000);
        values.sort_unstable();
        values.dedup();
        assert_eq!(values.len(), 1000);
    }

    #[test]
    fn test_push_during_flush_loses_nothing() {
        let list = ListHeader::new();
        let producing = std::sync::atomic::AtomicUsize::new(4);

        let mut values: Vec<u32> = thread::scope(|scope| {
            for t in 0..4u32 {
                let list = &list;
                let producing = &producing;
                scope.spawn(move || {
                    for i in 0..500 {
                        unsafe { list.push(node(t * 1000 + i)) };
                    }
                    producing.fetch_sub(1, Ordering::AcqRel);
                });
            }

            let mut values = Vec::new();
            loop {
                let finished = producing.load(Ordering::Acquire) == 0;
                values.extend(list.flush().map(|e| unsafe { take(e) }));
                if finished {
                    return values;
                }
            }
        });

        values.sort_unstable();
        let expected: Vec<u32> = (0..4u32)
            .flat_map(|t| (0..500).map(move |i| t * 1000 + i))
            .collect();
        assert_eq!(values, expected);
    }

    #[test]
    fn test_concurrent_pop_delivers_each_entry_once() {
        let list = Arc::new(ListHeader::new());
        for i in 0..1000 {
            unsafe { list.push(node(i)) };
        }
        let done = Arc::new(ListHeader::new());

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let list = Arc::clone(&list);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    // Popped entries move to another list; nothing is freed
                    // until every popper has finished.
                    while let Some(entry) = unsafe { list.pop() } {
                        unsafe { done.push(entry) };
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let mut values: Vec<u32> = done.flush().map(|e| unsafe { take(e) }).collect();
        values.sort_unstable();
        assert_eq!(values, (0..1000).collect::<Vec<_>>());
    }
}
