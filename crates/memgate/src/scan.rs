//! Parallel signature scanning over region lists.

use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use memchr::memmem::Finder;
use memgate_proto::{ListEntry, ListHeader, Record, RegionDescriptor};
use tracing::debug;

use crate::device::Device;
use crate::error::Result;
use crate::list::RegionList;
use crate::signature::Signature;

enum Search<'s> {
    Exact(Finder<'s>),
    Masked(&'s Signature),
}

impl<'s> Search<'s> {
    fn new(signature: &'s Signature) -> Self {
        if signature.has_wildcards() {
            Search::Masked(signature)
        } else {
            Search::Exact(Finder::new(signature.pattern()))
        }
    }

    /// First match at or after `from`.
    fn find(&self, data: &[u8], from: usize) -> Option<usize> {
        let haystack = data.get(from..)?;
        match self {
            Search::Exact(finder) => finder.find(haystack).map(|at| from + at),
            Search::Masked(signature) => find_masked(signature, data, from),
        }
    }
}

/// Masked search driven by the current match length.
///
/// A mismatch drops the partial match and resumes one byte past its start,
/// so overlapping matches are still found.
fn find_masked(signature: &Signature, data: &[u8], from: usize) -> Option<usize> {
    let pattern = signature.pattern();
    let mask = signature.mask();
    let last = data.len().checked_sub(pattern.len())?;

    let mut start = from;
    let mut matched = 0;
    while start <= last {
        if data[start + matched] & mask[matched] == pattern[matched] {
            matched += 1;
            if matched == pattern.len() {
                return Some(start);
            }
        } else {
            start += 1;
            matched = 0;
        }
    }
    None
}

/// Hit accounting shared by all workers.
struct Hits<F> {
    limit: usize,
    reserved: AtomicUsize,
    delivered: AtomicUsize,
    callback: Mutex<F>,
}

impl<F: FnMut(u64) + Send> Hits<F> {
    fn new(limit: usize, callback: F) -> Self {
        Self {
            limit,
            reserved: AtomicUsize::new(0),
            delivered: AtomicUsize::new(0),
            callback: Mutex::new(callback),
        }
    }

    fn exhausted(&self) -> bool {
        self.limit != 0 && self.reserved.load(Ordering::Relaxed) >= self.limit
    }

    fn report(&self, address: u64) {
        if self.limit != 0 && self.reserved.fetch_add(1, Ordering::AcqRel) >= self.limit {
            return;
        }
        let mut callback = self.callback.lock().unwrap_or_else(PoisonError::into_inner);
        (*callback)(address);
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }
}

/// Scan configuration.
///
/// `max_hits = 0` reports every match. With a limit of N and more than N
/// matches, between N and N + workers - 1 hits are reported.
#[derive(Debug, Clone)]
pub struct Scanner {
    max_hits: usize,
    workers: usize,
    stop: Arc<AtomicBool>,
}

impl Default for Scanner {
    fn default() -> Self {
        Self::new()
    }
}

impl Scanner {
    pub fn new() -> Self {
        Self {
            max_hits: 0,
            workers: thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn max_hits(mut self, max_hits: usize) -> Self {
        self.max_hits = max_hits;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Share a stop flag; setting it makes every worker finish early.
    pub fn stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn scan_region<F: FnMut(u64) + Send>(
        &self,
        base: u64,
        data: &[u8],
        search: &Search<'_>,
        hits: &Hits<F>,
    ) {
        let mut from = 0;
        while from < data.len() && !hits.exhausted() && !self.stopped() {
            let Some(offset) = search.find(data, from) else {
                break;
            };
            hits.report(base + offset as u64);
            from = offset + 1;
        }
    }

    /// Pop every region off `source` across the worker pool.
    ///
    /// Popped regions end up on the returned list; nothing is freed or pushed
    /// back onto `source` while workers may still pop from it.
    fn drain<F, V>(&self, source: &ListHeader, hits: &Hits<F>, visit: V) -> ListHeader
    where
        F: FnMut(u64) + Send,
        V: Fn(NonNull<ListEntry>) + Sync,
    {
        let done = ListHeader::new();
        thread::scope(|scope| {
            for _ in 0..self.workers {
                scope.spawn(|| {
                    while !self.stopped() {
                        // SAFETY: popped entries only move to `done` until
                        // every worker has joined.
                        let Some(entry) = (unsafe { source.pop() }) else {
                            break;
                        };
                        if !hits.exhausted() {
                            visit(entry);
                        }
                        // SAFETY: `entry` is ours and on no list.
                        unsafe { done.push(entry) };
                    }
                });
            }
        });
        done
    }

    /// Scan captured regions. The regions stay on the list.
    ///
    /// Returns the number of hits reported.
    pub fn scan_memory<F>(&self, regions: &mut RegionList, signature: &Signature, on_hit: F) -> usize
    where
        F: FnMut(u64) + Send,
    {
        let search = Search::new(signature);
        let hits = Hits::new(self.max_hits, on_hit);
        let source = regions.header();

        let done = self.drain(source, &hits, |entry| {
            // SAFETY: the worker that popped `entry` holds it exclusively.
            let (region, data) = unsafe {
                (
                    Record::<RegionDescriptor>::header(entry),
                    Record::<RegionDescriptor>::payload(entry),
                )
            };
            self.scan_region(region.base_address, data, &search, &hits);
        });

        for entry in done.flush() {
            // SAFETY: every worker has joined.
            unsafe { source.push(entry) };
        }
        hits.delivered.load(Ordering::Relaxed)
    }

    /// Scan a live process, copying each region just before scanning it.
    ///
    /// Regions that cannot be read are skipped. Returns the number of hits
    /// reported.
    pub fn scan_process<F>(
        &self,
        device: &Device,
        pid: u64,
        signature: &Signature,
        min: u64,
        max: u64,
        on_hit: F,
    ) -> Result<usize>
    where
        F: FnMut(u64) + Send,
    {
        let regions = device.query_regions(pid, min, max)?;
        let search = Search::new(signature);
        let hits = Hits::new(self.max_hits, on_hit);

        let done = self.drain(regions.header(), &hits, |entry| {
            // SAFETY: the worker that popped `entry` holds it exclusively.
            let region = unsafe { Record::<RegionDescriptor>::header(entry) };
            let Ok(size) = usize::try_from(region.region_size) else {
                return;
            };
            let mut data = Vec::new();
            if data.try_reserve_exact(size).is_err() {
                debug!("no memory to copy region {:#x}", region.base_address);
                return;
            }
            data.resize(size, 0);
            match device.read(pid, region.base_address, &[], &mut data) {
                Ok(()) => self.scan_region(region.base_address, &data, &search, &hits),
                Err(e) => debug!("skipping region {:#x}: {}", region.base_address, e),
            }
        });

        for entry in done.flush() {
            // SAFETY: every worker has joined; the region list allocated these.
            unsafe { Record::<RegionDescriptor>::free(entry) };
        }
        Ok(hits.delivered.load(Ordering::Relaxed))
    }
}
