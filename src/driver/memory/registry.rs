#![allow(clippy::cast_possible_truncation)]

use super::{
    Backing, BackingKind, BackingSource, MemDesc, MemFlags, ProcessStats, Resolved, Sharedmem,
};
use crate::error::{KgslError, KgslResult};
use crate::kgsl::mmu::{MapKind, PageProt, Pagetable, PhysRegion};
use crate::kgsl::timestamp::{Timestamp, TimestampType};
use crate::utils::{PAGE_MASK, is_page_aligned, page_align};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// A request to make host memory visible to the GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRequest {
    pub source: BackingSource,
    /// Byte offset into the source region. Ignored for heap memory.
    pub offset: usize,
    /// Zero means "the whole source region".
    pub len: usize,
    pub flags: MemFlags,
}

impl MapRequest {
    #[must_use]
    pub const fn new(source: BackingSource) -> Self {
        Self {
            source,
            offset: 0,
            len: 0,
            flags: MemFlags::empty(),
        }
    }

    #[must_use]
    pub const fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    #[must_use]
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    #[must_use]
    pub const fn gpu_readonly(mut self) -> Self {
        self.flags = self.flags.union(MemFlags::GPU_READONLY);
        self
    }
}

/// A deferred free: the entry may be released once `timestamp` of `kind` retires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingFree {
    pub timestamp: Timestamp,
    pub kind: TimestampType,
}

/// One GPU mapping owned by a process.
///
/// An entry lives in exactly one place at a time: its owner's registry, a device's free
/// queue, or nowhere (destroyed). It is consumed by [`MemoryEntry::destroy`], which is the
/// only way its backing memory is released.
#[derive(Debug)]
pub struct MemoryEntry {
    pub memdesc: MemDesc,
    pub flags: MemFlags,
    /// Page-aligned size of the GPU mapping, covering any in-page offset of `memdesc`.
    map_size: usize,
    backing: Backing,
    owner: Arc<ProcessStats>,
    pub(crate) pending_free: Option<PendingFree>,
}

/// How a validated request lays out in the GPU address space.
struct Layout {
    region: PhysRegion,
    hostptr: *mut u8,
    /// Offset of the first requested byte inside the first page.
    page_offset: usize,
    len: usize,
    prot: PageProt,
    flags: MemFlags,
}

impl MemoryEntry {
    /// Acquires backing memory for `req`, maps it into `pagetable` and accounts it to `owner`.
    ///
    /// On failure everything acquired so far is released again.
    pub fn create(
        mem: &Sharedmem,
        pagetable: Pagetable,
        owner: &Arc<ProcessStats>,
        req: &MapRequest,
    ) -> KgslResult<Self> {
        let acquired = mem.backing.acquire(&req.source)?;
        let backing = acquired.backing;

        let layout = match Self::layout(
            req,
            backing.kind(),
            acquired.start,
            acquired.len,
            acquired.hostptr,
        ) {
            Ok(layout) => layout,
            Err(e) => {
                backing.release(&*mem.backing);
                return Err(e);
            }
        };

        let page_gpuaddr = match mem.mmu.map(&pagetable, layout.region, layout.prot) {
            Ok(addr) => addr,
            Err(e) => {
                warn!(pid = owner.pid(), "GPU map of {:#x} bytes failed: {e}", layout.region.size);
                backing.release(&*mem.backing);
                return Err(e);
            }
        };

        let Some(gpuaddr) = page_gpuaddr.checked_add(layout.page_offset as u32) else {
            mem.mmu.unmap(&pagetable, page_gpuaddr, layout.region.size);
            backing.release(&*mem.backing);
            return Err(KgslError::InvalidArgument(format!(
                "mapping at {page_gpuaddr:#x} overflows the GPU address space"
            )));
        };

        let kind = backing.kind();
        mem.account_map(owner, kind, layout.region.size);
        debug!(
            pid = owner.pid(),
            "mapped {kind:?} region at gpuaddr {gpuaddr:#x}, {} bytes", layout.len
        );

        Ok(Self {
            memdesc: MemDesc {
                gpuaddr,
                size: layout.len,
                hostptr: layout.hostptr,
                pagetable: Some(pagetable),
            },
            flags: layout.flags,
            map_size: layout.region.size,
            backing,
            owner: Arc::clone(owner),
            pending_free: None,
        })
    }

    fn layout(
        req: &MapRequest,
        kind: BackingKind,
        start: usize,
        region_len: usize,
        hostptr: *mut u8,
    ) -> KgslResult<Layout> {
        let mut prot = PageProt::READ;
        if !req.flags.contains(MemFlags::GPU_READONLY) {
            prot |= PageProt::WRITE;
        }
        let readonly = req.flags & MemFlags::GPU_READONLY;

        if kind == BackingKind::Heap {
            if !is_page_aligned(start) || region_len == 0 || !is_page_aligned(region_len) {
                return Err(KgslError::InvalidArgument(format!(
                    "heap region {start:#x}+{region_len:#x} is not page aligned"
                )));
            }
            return Ok(Layout {
                region: PhysRegion {
                    start,
                    size: region_len,
                    kind: MapKind::HostPages,
                },
                hostptr,
                page_offset: 0,
                len: region_len,
                prot,
                flags: MemFlags::CACHE_CLEAN | readonly,
            });
        }

        let len = if req.len == 0 {
            region_len.checked_sub(req.offset).unwrap_or(0)
        } else {
            req.len
        };
        if len == 0 {
            return Err(KgslError::InvalidArgument("zero length mapping".into()));
        }

        let map_kind = if kind == BackingKind::AnonShared {
            if !is_page_aligned(start) || !is_page_aligned(region_len) {
                return Err(KgslError::InvalidArgument(format!(
                    "shared region {start:#x}+{region_len:#x} is not page aligned"
                )));
            }
            if req.len != 0 && req.len != region_len {
                return Err(KgslError::InvalidArgument(format!(
                    "length {:#x} does not match the shared region ({region_len:#x})",
                    req.len
                )));
            }
            MapKind::HostPages
        } else {
            MapKind::Contiguous
        };

        if req.offset.checked_add(len).is_none_or(|end| end > region_len) {
            return Err(KgslError::InvalidArgument(format!(
                "offset {:#x} + length {len:#x} exceeds region of {region_len:#x} bytes",
                req.offset
            )));
        }

        let page_offset = req.offset & !PAGE_MASK;
        let page_start = start + (req.offset & PAGE_MASK);
        Ok(Layout {
            region: PhysRegion {
                start: page_start,
                size: page_align(page_offset + len),
                kind: map_kind,
            },
            hostptr: hostptr.wrapping_add(req.offset),
            page_offset,
            len,
            prot,
            flags: readonly,
        })
    }

    #[must_use]
    pub const fn kind(&self) -> BackingKind {
        self.backing.kind()
    }

    #[must_use]
    pub fn owner(&self) -> &Arc<ProcessStats> {
        &self.owner
    }

    /// Is this entry accounted to the process behind `stats`?
    #[must_use]
    pub fn owned_by(&self, stats: &Arc<ProcessStats>) -> bool {
        Arc::ptr_eq(&self.owner, stats)
    }

    #[must_use]
    pub const fn pending_free(&self) -> Option<PendingFree> {
        self.pending_free
    }

    #[must_use]
    pub fn translate(&self, gpuaddr: u32) -> Option<Resolved> {
        self.memdesc.translate(gpuaddr)
    }

    /// Runs the cache maintenance named by the entry's cache bits. Returns false if none are set.
    pub fn flush_cache(&self, mem: &Sharedmem) -> bool {
        let op = self.flags & MemFlags::CACHE_MASK;
        if op.is_empty() {
            return false;
        }
        mem.backing
            .cache_range_op(self.memdesc.hostptr, self.memdesc.size, op);
        true
    }

    /// Unmaps the entry from the GPU, releases its backing memory and subtracts its usage.
    pub fn destroy(self, mem: &Sharedmem) {
        let Self {
            memdesc,
            map_size,
            backing,
            owner,
            ..
        } = self;

        if let Some(pagetable) = memdesc.pagetable {
            mem.mmu
                .unmap(&pagetable, memdesc.gpuaddr & PAGE_MASK as u32, map_size);
        }

        let kind = backing.kind();
        backing.release(&*mem.backing);
        mem.account_unmap(&owner, kind, map_size);
        debug!(
            pid = owner.pid(),
            "destroyed {kind:?} region at gpuaddr {:#x}", memdesc.gpuaddr
        );
    }
}

/// A process's live GPU mappings, keyed by GPU address.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    entries: BTreeMap<u32, MemoryEntry>,
}

impl MemoryRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly mapped entry. The address range must not overlap a live entry.
    ///
    /// A rejected entry is handed back so the caller can destroy it.
    pub fn insert(&mut self, entry: MemoryEntry) -> Result<(), MemoryEntry> {
        let start = entry.memdesc.gpuaddr;
        let end = u64::from(start) + entry.memdesc.size as u64;

        let overlaps_prev = self
            .entries
            .range(..=start)
            .next_back()
            .is_some_and(|(_, prev)| prev.memdesc.contains(start));
        let overlaps_next = self
            .entries
            .range(start..)
            .next()
            .is_some_and(|(&next, _)| u64::from(next) < end);

        if overlaps_prev || overlaps_next {
            return Err(entry);
        }
        self.entries.insert(start, entry);
        Ok(())
    }

    /// The entry that begins exactly at `gpuaddr`.
    #[must_use]
    pub fn find(&self, gpuaddr: u32) -> Option<&MemoryEntry> {
        self.entries.get(&gpuaddr)
    }

    pub fn find_mut(&mut self, gpuaddr: u32) -> Option<&mut MemoryEntry> {
        self.entries.get_mut(&gpuaddr)
    }

    /// The entry that entirely contains `[gpuaddr, gpuaddr + size)`.
    #[must_use]
    pub fn find_in_range(&self, gpuaddr: u32, size: usize) -> Option<&MemoryEntry> {
        // Entries never overlap, so only the closest one at or below `gpuaddr` can match.
        self.entries
            .range(..=gpuaddr)
            .next_back()
            .map(|(_, entry)| entry)
            .filter(|entry| entry.memdesc.contains_range(gpuaddr, size))
    }

    /// Detaches the entry that begins exactly at `gpuaddr`.
    pub fn release(&mut self, gpuaddr: u32) -> KgslResult<MemoryEntry> {
        self.entries
            .remove(&gpuaddr)
            .ok_or_else(|| KgslError::NotFound(format!("no mapping at gpuaddr {gpuaddr:#x}")))
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryEntry> {
        self.entries.values()
    }

    /// Detaches every entry, in address order.
    pub fn take_all(&mut self) -> Vec<MemoryEntry> {
        std::mem::take(&mut self.entries).into_values().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
