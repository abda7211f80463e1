//! Size-class allocator shared by byte buffers and the other short-lived
//! allocations on the hot send/receive paths.
//!
//! Blocks of 64 B..=64 KiB are served from per-class lock-free freelists, so
//! allocation can happen on any thread and release on a different one.
//! Larger requests fall through to the system allocator. All block sizes are
//! powers of two and 64-byte aligned.

use std::{
    alloc::Layout,
    ptr::NonNull,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

use crossbeam_queue::SegQueue;
use once_cell::sync::Lazy;
use tracing::debug;

const MIN_SHIFT: u32 = 6;
const MAX_SHIFT: u32 = 16;
const CLASS_COUNT: usize = (MAX_SHIFT - MIN_SHIFT + 1) as usize;

/// Per-class retention cap. Blocks released beyond this go straight back to
/// the system allocator.
const MAX_CACHED_PER_CLASS: usize = 256;

/// Boundary between the "small" and "medium" stats buckets.
const SMALL_LIMIT: usize = 1 << 10;

const BLOCK_ALIGN: usize = 64;

/// One block handed out by the pool. `capacity` is the true usable size,
/// always a power of two `>= ` the requested byte count.
pub struct Allocation {
    pub ptr: NonNull<u8>,
    pub capacity: usize,
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub small_allocs: u64,
    pub medium_allocs: u64,
    pub large_allocs: u64,
    pub live: u64,
    pub live_high_water: u64,
}

#[derive(Default)]
struct StatCounters {
    small_allocs: AtomicU64,
    medium_allocs: AtomicU64,
    large_allocs: AtomicU64,
    live: AtomicU64,
    live_high_water: AtomicU64,
}

struct SizeClass {
    free: SegQueue<usize>,
    cached: AtomicUsize,
}

impl SizeClass {
    fn new() -> Self {
        Self { free: SegQueue::new(), cached: AtomicUsize::new(0) }
    }
}

pub struct Pool {
    classes: [SizeClass; CLASS_COUNT],
    stats: StatCounters,
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl Pool {
    pub fn new() -> Self {
        Self {
            classes: std::array::from_fn(|_| SizeClass::new()),
            stats: StatCounters::default(),
        }
    }

    /// Rounded block size for a request, power of two, at least 64.
    #[inline]
    pub fn block_size(bytes: usize) -> usize {
        bytes.next_power_of_two().max(1 << MIN_SHIFT)
    }

    #[inline]
    fn class_of(block: usize) -> Option<usize> {
        let shift = block.trailing_zeros();
        if shift > MAX_SHIFT { None } else { Some((shift - MIN_SHIFT) as usize) }
    }

    pub fn alloc(&self, bytes: usize) -> Allocation {
        let block = Self::block_size(bytes);
        self.count_alloc(block);

        if let Some(class) = Self::class_of(block) {
            let c = &self.classes[class];
            if let Some(addr) = c.free.pop() {
                c.cached.fetch_sub(1, Ordering::Relaxed);
                // Freelist entries are never null.
                let ptr = unsafe { NonNull::new_unchecked(addr as *mut u8) };
                return Allocation { ptr, capacity: block };
            }
        }
        Allocation { ptr: raw_alloc(block), capacity: block }
    }

    /// Returns a block obtained from [`Pool::alloc`]. `bytes` must be the
    /// request size or the returned capacity; both round to the same class.
    pub fn release(&self, ptr: NonNull<u8>, bytes: usize) {
        let block = Self::block_size(bytes);
        self.stats.live.fetch_sub(1, Ordering::Relaxed);

        if let Some(class) = Self::class_of(block) {
            let c = &self.classes[class];
            if c.cached.fetch_add(1, Ordering::Relaxed) < MAX_CACHED_PER_CLASS {
                c.free.push(ptr.as_ptr() as usize);
                return;
            }
            c.cached.fetch_sub(1, Ordering::Relaxed);
        }
        raw_dealloc(ptr, block);
    }

    /// Drops every cached block back to the system allocator.
    pub fn trim(&self) {
        for (i, c) in self.classes.iter().enumerate() {
            let block = 1usize << (MIN_SHIFT + i as u32);
            while let Some(addr) = c.free.pop() {
                c.cached.fetch_sub(1, Ordering::Relaxed);
                // Freelist entries are never null.
                let ptr = unsafe { NonNull::new_unchecked(addr as *mut u8) };
                raw_dealloc(ptr, block);
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            small_allocs: self.stats.small_allocs.load(Ordering::Relaxed),
            medium_allocs: self.stats.medium_allocs.load(Ordering::Relaxed),
            large_allocs: self.stats.large_allocs.load(Ordering::Relaxed),
            live: self.stats.live.load(Ordering::Relaxed),
            live_high_water: self.stats.live_high_water.load(Ordering::Relaxed),
        }
    }

    fn count_alloc(&self, block: usize) {
        if block <= SMALL_LIMIT {
            self.stats.small_allocs.fetch_add(1, Ordering::Relaxed);
        } else if block <= 1 << MAX_SHIFT {
            self.stats.medium_allocs.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.large_allocs.fetch_add(1, Ordering::Relaxed);
        }
        let live = self.stats.live.fetch_add(1, Ordering::Relaxed) + 1;
        self.stats.live_high_water.fetch_max(live, Ordering::Relaxed);
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.trim();
    }
}

fn raw_alloc(block: usize) -> NonNull<u8> {
    let layout = Layout::from_size_align(block, BLOCK_ALIGN).expect("bad block layout");
    // SAFETY: layout size is non-zero (block >= 64).
    let ptr = unsafe { std::alloc::alloc(layout) };
    NonNull::new(ptr).unwrap_or_else(|| std::alloc::handle_alloc_error(layout))
}

fn raw_dealloc(ptr: NonNull<u8>, block: usize) {
    let layout = Layout::from_size_align(block, BLOCK_ALIGN).expect("bad block layout");
    // SAFETY: `ptr` came out of `raw_alloc` with the same layout.
    unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
}

static GLOBAL: Lazy<Pool> = Lazy::new(Pool::new);

/// Allocates from the process-wide pool.
#[inline]
pub fn alloc(bytes: usize) -> Allocation {
    GLOBAL.alloc(bytes)
}

/// Releases to the process-wide pool. Safe to call from a thread other than
/// the allocating one.
#[inline]
pub fn release(ptr: NonNull<u8>, bytes: usize) {
    GLOBAL.release(ptr, bytes)
}

/// Forces creation of the process-wide pool.
pub fn warm() {
    Lazy::force(&GLOBAL);
}

/// Returns cached blocks to the system allocator and logs the counters.
pub fn trim() {
    GLOBAL.trim();
    debug!(stats = ?GLOBAL.stats(), "pool trimmed");
}

pub fn stats() -> PoolStats {
    GLOBAL.stats()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn block_rounding() {
        assert_eq!(Pool::block_size(0), 64);
        assert_eq!(Pool::block_size(1), 64);
        assert_eq!(Pool::block_size(64), 64);
        assert_eq!(Pool::block_size(65), 128);
        assert_eq!(Pool::block_size(4096), 4096);
        assert_eq!(Pool::block_size(4097), 8192);
        assert_eq!(Pool::block_size(100_000), 131_072);
    }

    #[test]
    fn reuses_released_blocks() {
        let pool = Pool::new();
        let a = pool.alloc(100);
        assert_eq!(a.capacity, 128);
        let addr = a.ptr.as_ptr() as usize;
        pool.release(a.ptr, 100);
        let b = pool.alloc(120);
        assert_eq!(b.ptr.as_ptr() as usize, addr);
        pool.release(b.ptr, b.capacity);
    }

    #[test]
    fn large_requests_fall_through() {
        let pool = Pool::new();
        let a = pool.alloc(1 << 20);
        assert_eq!(a.capacity, 1 << 20);
        pool.release(a.ptr, a.capacity);
        assert_eq!(pool.stats().large_allocs, 1);
        assert_eq!(pool.stats().live, 0);
    }

    #[test]
    fn stats_track_live_and_high_water() {
        let pool = Pool::new();
        let a = pool.alloc(64);
        let b = pool.alloc(2048);
        assert_eq!(pool.stats().live, 2);
        assert_eq!(pool.stats().live_high_water, 2);
        assert_eq!(pool.stats().small_allocs, 1);
        assert_eq!(pool.stats().medium_allocs, 1);
        pool.release(a.ptr, 64);
        pool.release(b.ptr, 2048);
        assert_eq!(pool.stats().live, 0);
        assert_eq!(pool.stats().live_high_water, 2);
    }

    #[test]
    fn release_from_other_thread() {
        let pool = std::sync::Arc::new(Pool::new());
        let a = pool.alloc(256);
        let addr = a.ptr.as_ptr() as usize;
        let p2 = pool.clone();
        std::thread::spawn(move || {
            // Rebuild the pointer on the releasing thread.
            let ptr = NonNull::new(addr as *mut u8).unwrap();
            p2.release(ptr, 256);
        })
        .join()
        .unwrap();
        let b = pool.alloc(256);
        assert_eq!(b.ptr.as_ptr() as usize, addr);
        pool.release(b.ptr, 256);
    }

    #[test]
    fn trim_empties_freelists() {
        let pool = Pool::new();
        let blocks: Vec<_> = (0..8).map(|_| pool.alloc(512)).collect();
        for b in blocks {
            pool.release(b.ptr, 512);
        }
        pool.trim();
        assert_eq!(pool.stats().live, 0);
    }
}
