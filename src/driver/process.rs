use super::memory::registry::{MapRequest, MemoryEntry, MemoryRegistry};
use super::memory::{BackingKind, MemDesc, MemFlags, ProcessStats, Resolved, Sharedmem};
use crate::error::{KgslError, KgslResult};
use crate::kgsl::ioctl::IbDesc;
use crate::kgsl::mmu::Pagetable;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{error, info};

/// Per-process driver state, shared by every handle the process has open.
///
/// Dropping the last reference tears the process down: every mapping still registered is
/// destroyed and the pagetable reference is returned.
pub struct ProcessContext {
    pid: u32,
    pagetable: Pagetable,
    mem: Mutex<MemoryRegistry>,
    stats: Arc<ProcessStats>,
    sharedmem: Arc<Sharedmem>,
}

impl ProcessContext {
    fn new(pid: u32, pagetable_name: u32, sharedmem: Arc<Sharedmem>) -> KgslResult<Self> {
        let pagetable = sharedmem.mmu.get_pagetable(pagetable_name)?;
        Ok(Self {
            pid,
            pagetable,
            mem: Mutex::new(MemoryRegistry::new()),
            stats: Arc::new(ProcessStats::new(pid)),
            sharedmem,
        })
    }

    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    #[must_use]
    pub const fn pagetable(&self) -> Pagetable {
        self.pagetable
    }

    /// Usage counters. The handle stays valid after the process is gone.
    #[must_use]
    pub fn stats(&self) -> &Arc<ProcessStats> {
        &self.stats
    }

    /// Maps memory into the process's GPU address space and registers it.
    pub fn map(&self, req: &MapRequest) -> KgslResult<MemDesc> {
        let entry = MemoryEntry::create(&self.sharedmem, self.pagetable, &self.stats, req)?;
        let memdesc = entry.memdesc;

        if let Err(entry) = self.mem.lock().insert(entry) {
            error!(
                pid = self.pid,
                "gpuaddr {:#x} overlaps a live mapping", memdesc.gpuaddr
            );
            entry.destroy(&self.sharedmem);
            return Err(KgslError::InvalidArgument(format!(
                "gpuaddr {:#x} already mapped",
                memdesc.gpuaddr
            )));
        }
        Ok(memdesc)
    }

    /// Detaches the entry that begins exactly at `gpuaddr`.
    pub fn release(&self, gpuaddr: u32) -> KgslResult<MemoryEntry> {
        self.mem.lock().release(gpuaddr)
    }

    /// Puts a detached entry back, e.g. after a rejected deferred free.
    pub fn restore(&self, entry: MemoryEntry) {
        if let Err(entry) = self.mem.lock().insert(entry) {
            entry.destroy(&self.sharedmem);
        }
    }

    /// Unmaps and releases the entry at `gpuaddr` right away.
    pub fn free(&self, gpuaddr: u32) -> KgslResult<()> {
        let entry = self.release(gpuaddr)?;
        entry.destroy(&self.sharedmem);
        Ok(())
    }

    #[must_use]
    pub fn find(&self, gpuaddr: u32) -> Option<MemDesc> {
        self.mem.lock().find(gpuaddr).map(|e| e.memdesc)
    }

    #[must_use]
    pub fn find_in_range(&self, gpuaddr: u32, size: usize) -> Option<MemDesc> {
        self.mem.lock().find_in_range(gpuaddr, size).map(|e| e.memdesc)
    }

    pub(crate) fn resolve(&self, gpuaddr: u32, size: usize) -> Option<Resolved> {
        self.mem
            .lock()
            .find_in_range(gpuaddr, size)
            .and_then(|e| e.translate(gpuaddr))
    }

    /// Every descriptor must lie within one live mapping of this process.
    pub fn check_ibdesc(&self, ibs: &[IbDesc]) -> KgslResult<()> {
        let mem = self.mem.lock();
        for ib in ibs {
            if mem.find_in_range(ib.gpuaddr, ib.size_bytes()).is_none() {
                error!(
                    pid = self.pid,
                    "invalid ib base {:#x} size {:#x}", ib.gpuaddr, ib.sizedwords
                );
                return Err(KgslError::InvalidArgument(format!(
                    "ib at gpuaddr {:#x} is not mapped",
                    ib.gpuaddr
                )));
            }
        }
        Ok(())
    }

    /// Runs the pending cache maintenance of the entry at `gpuaddr` and clears its cache bits.
    pub fn flush_cache(&self, gpuaddr: u32) -> KgslResult<()> {
        let mut mem = self.mem.lock();
        let entry = mem.find_mut(gpuaddr).ok_or_else(|| {
            error!(pid = self.pid, "invalid gpuaddr {gpuaddr:#x}");
            KgslError::NotFound(format!("no mapping at gpuaddr {gpuaddr:#x}"))
        })?;
        if entry.flush_cache(&self.sharedmem) {
            entry.flags.remove(MemFlags::CACHE_MASK);
            self.stats.record_flush();
        }
        Ok(())
    }

    /// Cleans every cached mapping ahead of a submission.
    pub fn clean_cache_all(&self) {
        let mem = self.mem.lock();
        for entry in mem.iter() {
            entry.flush_cache(&self.sharedmem);
        }
    }

    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.mem.lock().len()
    }
}

impl Drop for ProcessContext {
    fn drop(&mut self) {
        for entry in self.mem.get_mut().take_all() {
            entry.destroy(&self.sharedmem);
        }
        self.sharedmem.mmu.put_pagetable(self.pagetable);
        info!(
            pid = self.pid,
            "process released, peak usage heap {:#x} pinned {:#x} shared {:#x}, {} flushes",
            self.stats.bytes_max(BackingKind::Heap),
            self.stats.bytes_max(BackingKind::Pinned),
            self.stats.bytes_max(BackingKind::AnonShared),
            self.stats.flushes()
        );
    }
}

impl std::fmt::Debug for ProcessContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessContext")
            .field("pid", &self.pid)
            .field("pagetable", &self.pagetable)
            .finish_non_exhaustive()
    }
}

/// Every process with at least one open handle, by pid.
#[derive(Debug, Default)]
pub struct ProcessList {
    procs: Mutex<HashMap<u32, Weak<ProcessContext>>>,
}

impl ProcessList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the context for `pid`, creating it on first open.
    pub fn get(
        &self,
        pid: u32,
        pagetable_name: u32,
        sharedmem: &Arc<Sharedmem>,
    ) -> KgslResult<Arc<ProcessContext>> {
        let mut procs = self.procs.lock();
        if let Some(process) = procs.get(&pid).and_then(Weak::upgrade) {
            return Ok(process);
        }

        let process = Arc::new(ProcessContext::new(pid, pagetable_name, Arc::clone(sharedmem))?);
        procs.insert(pid, Arc::downgrade(&process));
        Ok(process)
    }

    /// Drops one reference. Returns the context by value if that was the last one, already
    /// unlinked from the list, so the caller can finish tearing it down.
    pub fn put(&self, process: Arc<ProcessContext>) -> Option<ProcessContext> {
        let mut procs = self.procs.lock();
        match Arc::try_unwrap(process) {
            Ok(process) => {
                procs.remove(&process.pid);
                Some(process)
            }
            // Dropped under the lock so a racing `put` always sees the final count.
            Err(process) => {
                drop(process);
                None
            }
        }
    }

    /// Calls `f` on every live process until it returns `Some`.
    pub fn find_map<T>(&self, mut f: impl FnMut(&ProcessContext) -> Option<T>) -> Option<T> {
        let procs = self.procs.lock();
        procs
            .values()
            .filter_map(Weak::upgrade)
            .find_map(|process| f(process.as_ref()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.procs.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
