pub mod memqueue;
pub mod registry;

use crate::error::KgslResult;
use crate::kgsl::mmu::{Mmu, Pagetable};
use crate::utils::page_order;
use bitflags::bitflags;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

bitflags! {
    /// Mutable per-entry flags. Only the cache bits ever change after an entry is registered.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MemFlags: u32 {
        const CACHE_CLEAN = 0x0000_0001;
        const CACHE_INV = 0x0000_0002;
        const CACHE_MASK = Self::CACHE_CLEAN.bits() | Self::CACHE_INV.bits();
        const GPU_READONLY = 0x0100_0000;
    }
}

/// A GPU-visible memory region: where the GPU sees it and where the host can reach it.
#[derive(Debug, Clone, Copy)]
pub struct MemDesc {
    pub gpuaddr: u32,
    pub size: usize,
    /// CPU Virtual Address of byte 0 of the region (may be null for unmapped descriptors).
    pub hostptr: *mut u8,
    pub pagetable: Option<Pagetable>,
}

// SAFETY: `hostptr` is only ever offset, never dereferenced by the core.
unsafe impl Send for MemDesc {}
unsafe impl Sync for MemDesc {}

impl MemDesc {
    #[must_use]
    pub const fn contains(&self, gpuaddr: u32) -> bool {
        gpuaddr >= self.gpuaddr && ((gpuaddr - self.gpuaddr) as usize) < self.size
    }

    /// Does `[gpuaddr, gpuaddr + size)` lie entirely inside this region?
    #[must_use]
    pub const fn contains_range(&self, gpuaddr: u32, size: usize) -> bool {
        gpuaddr >= self.gpuaddr
            && (gpuaddr as u64 + size as u64) <= (self.gpuaddr as u64 + self.size as u64)
    }

    /// Host pointer for `gpuaddr` and the number of bytes left to the end of the region.
    #[must_use]
    pub fn translate(&self, gpuaddr: u32) -> Option<Resolved> {
        if !self.contains(gpuaddr) || self.hostptr.is_null() {
            return None;
        }
        let offset = (gpuaddr - self.gpuaddr) as usize;
        Some(Resolved {
            hostptr: self.hostptr.wrapping_add(offset),
            remaining: self.size - offset,
        })
    }
}

/// Result of translating a GPU address back to host memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub hostptr: *mut u8,
    pub remaining: usize,
}

/// An opaque reference to acquired backing memory, owned by exactly one entry.
#[derive(Debug, PartialEq, Eq)]
pub struct BackingHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackingKind {
    /// Memory allocated by the driver for the process.
    Heap = 0,
    /// A physically contiguous region pinned from an external allocator.
    Pinned = 1,
    /// Pages of a process's anonymous-shared (or plain user) mapping.
    AnonShared = 2,
}

impl BackingKind {
    pub const COUNT: usize = 3;
}

/// Backing storage of a mapping. Each kind has its own release path.
#[derive(Debug, PartialEq, Eq)]
pub enum Backing {
    Heap(BackingHandle),
    Pinned(BackingHandle),
    AnonShared(BackingHandle),
}

impl Backing {
    #[must_use]
    pub const fn kind(&self) -> BackingKind {
        match self {
            Self::Heap(_) => BackingKind::Heap,
            Self::Pinned(_) => BackingKind::Pinned,
            Self::AnonShared(_) => BackingKind::AnonShared,
        }
    }

    pub fn release(self, store: &dyn BackingStore) {
        match self {
            Self::Heap(h) => store.free_heap(h),
            Self::Pinned(h) => store.put_pinned(h),
            Self::AnonShared(h) => store.put_anon_shared(h),
        }
    }
}

/// What a map request wants to back the GPU mapping with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingSource {
    /// Allocate driver memory sized to the host mapping at `hostptr`.
    Heap { hostptr: usize },
    /// A pinned physical region identified by a file descriptor.
    Pinned { fd: i32 },
    /// An anonymous-shared region (`fd`) or a plain user range (no `fd`) mapped at `hostptr`.
    AnonShared { fd: Option<i32>, hostptr: usize },
}

/// A freshly acquired backing region.
#[derive(Debug)]
pub struct AcquiredBacking {
    pub backing: Backing,
    /// Address of the region the MMU maps (host virtual or physical, depending on kind).
    pub start: usize,
    pub len: usize,
    /// CPU Virtual Address the process sees the region at.
    pub hostptr: *mut u8,
}

/// The backing-memory providers. Implemented outside the core.
pub trait BackingStore: Send + Sync {
    fn acquire(&self, source: &BackingSource) -> KgslResult<AcquiredBacking>;

    fn free_heap(&self, handle: BackingHandle);

    fn put_pinned(&self, handle: BackingHandle);

    fn put_anon_shared(&self, handle: BackingHandle);

    /// Clean and/or invalidate CPU caches for a host range.
    fn cache_range_op(&self, hostptr: *mut u8, size: usize, op: MemFlags);
}

/// Byte counters per backing kind with high-water marks.
#[derive(Debug, Default)]
struct KindCounters {
    cur: [AtomicUsize; BackingKind::COUNT],
    max: [AtomicUsize; BackingKind::COUNT],
}

impl KindCounters {
    fn add(&self, kind: BackingKind, len: usize) {
        let now = self.cur[kind as usize].fetch_add(len, Ordering::Relaxed) + len;
        self.max[kind as usize].fetch_max(now, Ordering::Relaxed);
    }

    fn sub(&self, kind: BackingKind, len: usize) {
        self.cur[kind as usize].fetch_sub(len, Ordering::Relaxed);
    }

    fn get(&self, kind: BackingKind) -> usize {
        self.cur[kind as usize].load(Ordering::Relaxed)
    }

    fn get_max(&self, kind: BackingKind) -> usize {
        self.max[kind as usize].load(Ordering::Relaxed)
    }
}

/// Per-process memory usage.
#[derive(Debug)]
pub struct ProcessStats {
    pid: u32,
    bytes: KindCounters,
    flushes: AtomicUsize,
}

impl ProcessStats {
    #[must_use]
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            bytes: KindCounters::default(),
            flushes: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    #[must_use]
    pub fn bytes(&self, kind: BackingKind) -> usize {
        self.bytes.get(kind)
    }

    #[must_use]
    pub fn bytes_max(&self, kind: BackingKind) -> usize {
        self.bytes.get_max(kind)
    }

    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.bytes(BackingKind::Heap)
            + self.bytes(BackingKind::Pinned)
            + self.bytes(BackingKind::AnonShared)
    }

    #[must_use]
    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::Relaxed)
    }

    pub(crate) fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }
}

pub const HISTOGRAM_BUCKETS: usize = 16;

/// Driver-wide memory usage.
#[derive(Debug, Default)]
pub struct DriverStats {
    bytes: KindCounters,
    histogram: [AtomicUsize; HISTOGRAM_BUCKETS],
}

impl DriverStats {
    #[must_use]
    pub fn bytes(&self, kind: BackingKind) -> usize {
        self.bytes.get(kind)
    }

    #[must_use]
    pub fn bytes_max(&self, kind: BackingKind) -> usize {
        self.bytes.get_max(kind)
    }

    /// Number of mappings ever created, bucketed by allocation order.
    #[must_use]
    pub fn histogram(&self) -> [usize; HISTOGRAM_BUCKETS] {
        std::array::from_fn(|i| self.histogram[i].load(Ordering::Relaxed))
    }
}

/// The memory services shared by every device and process of a driver instance.
pub struct Sharedmem {
    pub mmu: Arc<dyn Mmu>,
    pub backing: Arc<dyn BackingStore>,
    pub stats: DriverStats,
}

impl Sharedmem {
    pub fn new(mmu: Arc<dyn Mmu>, backing: Arc<dyn BackingStore>) -> Self {
        Self {
            mmu,
            backing,
            stats: DriverStats::default(),
        }
    }

    pub(crate) fn account_map(&self, process: &ProcessStats, kind: BackingKind, len: usize) {
        process.bytes.add(kind, len);
        self.stats.bytes.add(kind, len);

        let order = page_order(len) as usize;
        if order < HISTOGRAM_BUCKETS {
            self.stats.histogram[order].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn account_unmap(&self, process: &ProcessStats, kind: BackingKind, len: usize) {
        process.bytes.sub(kind, len);
        self.stats.bytes.sub(kind, len);
    }
}

impl std::fmt::Debug for Sharedmem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sharedmem")
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc() -> MemDesc {
        MemDesc {
            gpuaddr: 0x1000,
            size: 0x2000,
            hostptr: 0x10_0000 as *mut u8,
            pagetable: None,
        }
    }

    #[test]
    fn translate_reports_remaining_bytes() {
        let r = desc().translate(0x1800).unwrap();
        assert_eq!(r.hostptr as usize, 0x10_0800);
        assert_eq!(r.remaining, 0x1800);
        assert!(desc().translate(0x3000).is_none());
        assert!(desc().translate(0x0FFF).is_none());
    }

    #[test]
    fn contains_range_is_exact_at_the_end() {
        assert!(desc().contains_range(0x1000, 0x2000));
        assert!(!desc().contains_range(0x1004, 0x2000));
        assert!(!desc().contains_range(0x0FFC, 8));
    }

    #[test]
    fn high_water_mark_survives_unmap() {
        let process = ProcessStats::new(7);
        let mem_stats = KindCounters::default();
        mem_stats.add(BackingKind::Pinned, 8192);
        process.bytes.add(BackingKind::Heap, 4096);
        process.bytes.add(BackingKind::Heap, 4096);
        process.bytes.sub(BackingKind::Heap, 4096);
        assert_eq!(process.bytes(BackingKind::Heap), 4096);
        assert_eq!(process.bytes_max(BackingKind::Heap), 8192);
        assert_eq!(mem_stats.get(BackingKind::Pinned), 8192);
    }
}
