//! Mock collaborators for unit tests.

use super::device::{Device, DeviceBuilder, DeviceConfig};
use super::memory::registry::{MapRequest, MemoryEntry};
use super::memory::{
    AcquiredBacking, Backing, BackingHandle, BackingKind, BackingSource, BackingStore, MemFlags,
    ProcessStats, Sharedmem,
};
use super::process::ProcessList;
use crate::error::{KgslError, KgslResult};
use crate::kgsl::device::{DeviceOps, DrawContext, PowerState};
use crate::kgsl::ioctl::IbDesc;
use crate::kgsl::mmu::{Mmu, PageProt, Pagetable, PhysRegion};
use crate::kgsl::timestamp::{Timestamp, TimestampType};
use crate::utils::{PAGE_SIZE, page_align};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

#[derive(Debug)]
struct MmuState {
    next: u32,
    refs: HashMap<u32, usize>,
    mapped: BTreeMap<u32, usize>,
    last_prot: Option<PageProt>,
}

/// Hands out GPU addresses upwards with a one-page hole after every mapping.
#[derive(Debug)]
pub struct MockMmu {
    state: Mutex<MmuState>,
}

impl MockMmu {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MmuState {
                next: 0x1000_0000,
                refs: HashMap::new(),
                mapped: BTreeMap::new(),
                last_prot: None,
            }),
        })
    }

    pub fn pagetable_refs(&self, name: u32) -> usize {
        self.state.lock().refs.get(&name).copied().unwrap_or(0)
    }

    pub fn mapped(&self) -> usize {
        self.state.lock().mapped.len()
    }

    pub fn last_prot(&self) -> Option<PageProt> {
        self.state.lock().last_prot
    }
}

impl Mmu for MockMmu {
    fn get_pagetable(&self, name: u32) -> KgslResult<Pagetable> {
        *self.state.lock().refs.entry(name).or_default() += 1;
        Ok(Pagetable {
            name,
            base: 0x8000_0000 | (name << 12),
        })
    }

    fn put_pagetable(&self, pagetable: Pagetable) {
        let mut st = self.state.lock();
        if let Some(n) = st.refs.get_mut(&pagetable.name) {
            *n -= 1;
            if *n == 0 {
                st.refs.remove(&pagetable.name);
            }
        }
    }

    fn map(&self, _pagetable: &Pagetable, region: PhysRegion, prot: PageProt) -> KgslResult<u32> {
        assert_eq!(region.size % PAGE_SIZE, 0);
        let mut st = self.state.lock();
        let addr = st.next;
        st.next += (region.size + PAGE_SIZE) as u32;
        st.mapped.insert(addr, region.size);
        st.last_prot = Some(prot);
        Ok(addr)
    }

    fn unmap(&self, _pagetable: &Pagetable, gpuaddr: u32, _size: usize) {
        self.state.lock().mapped.remove(&gpuaddr);
    }
}

#[derive(Debug, Default)]
struct BackingState {
    next_handle: u64,
    next_phys: usize,
    live: HashMap<u64, (BackingKind, usize)>,
    released: Vec<(BackingKind, usize)>,
    cache_ops: usize,
}

/// Heap regions are one page, shared regions two pages, pinned regions `fd` bytes long.
#[derive(Debug, Default)]
pub struct MockBacking {
    state: Mutex<BackingState>,
}

impl MockBacking {
    pub const HOST_BASE: usize = 0x4000_0000;
    pub const HEAP_LEN: usize = 4096;
    pub const SHARED_LEN: usize = 8192;

    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BackingState {
                next_phys: 0x0100_0000,
                ..Default::default()
            }),
        })
    }

    pub fn released(&self) -> Vec<(BackingKind, usize)> {
        self.state.lock().released.clone()
    }

    pub fn live(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn cache_ops(&self) -> usize {
        self.state.lock().cache_ops
    }

    fn put(&self, handle: BackingHandle) {
        let mut st = self.state.lock();
        let gone = st.live.remove(&handle.0);
        st.released.extend(gone);
    }
}

impl BackingStore for MockBacking {
    fn acquire(&self, source: &BackingSource) -> KgslResult<AcquiredBacking> {
        let mut st = self.state.lock();
        let (kind, len, start, hostptr) = match *source {
            BackingSource::Heap { hostptr } => {
                (BackingKind::Heap, Self::HEAP_LEN, st.next_phys, hostptr)
            }
            BackingSource::Pinned { fd } => {
                let len = usize::try_from(fd)
                    .ok()
                    .filter(|&n| n > 0)
                    .ok_or_else(|| KgslError::InvalidArgument(format!("bad fd {fd}")))?;
                (BackingKind::Pinned, len, st.next_phys, 0x2000_0000 + st.next_phys)
            }
            BackingSource::AnonShared { hostptr, .. } => {
                (BackingKind::AnonShared, Self::SHARED_LEN, hostptr, hostptr)
            }
        };
        st.next_phys += page_align(len);
        st.next_handle += 1;
        let handle = st.next_handle;
        st.live.insert(handle, (kind, len));

        let handle = BackingHandle(handle);
        let backing = match kind {
            BackingKind::Heap => Backing::Heap(handle),
            BackingKind::Pinned => Backing::Pinned(handle),
            BackingKind::AnonShared => Backing::AnonShared(handle),
        };
        Ok(AcquiredBacking {
            backing,
            start,
            len,
            hostptr: hostptr as *mut u8,
        })
    }

    fn free_heap(&self, handle: BackingHandle) {
        self.put(handle);
    }

    fn put_pinned(&self, handle: BackingHandle) {
        self.put(handle);
    }

    fn put_anon_shared(&self, handle: BackingHandle) {
        self.put(handle);
    }

    fn cache_range_op(&self, _hostptr: *mut u8, _size: usize, _op: MemFlags) {
        self.state.lock().cache_ops += 1;
    }
}

#[derive(Debug, Default)]
struct OpsState {
    calls: HashMap<&'static str, usize>,
    failing: HashSet<&'static str>,
    last_wait_timeout: Option<Duration>,
    next_ctx: u64,
    next_ts: u32,
}

/// Records every call; any call can be made to fail by name.
#[derive(Debug, Default)]
pub struct MockOps {
    state: Mutex<OpsState>,
    retired: AtomicU32,
}

impl MockOps {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, name: &'static str) -> KgslResult<()> {
        let mut st = self.state.lock();
        *st.calls.entry(name).or_default() += 1;
        if st.failing.contains(name) {
            return Err(KgslError::Device(format!("{name} failed")));
        }
        Ok(())
    }

    pub fn calls(&self, name: &str) -> usize {
        self.state.lock().calls.get(name).copied().unwrap_or(0)
    }

    pub fn fail(&self, name: &'static str) {
        self.state.lock().failing.insert(name);
    }

    pub fn heal(&self, name: &'static str) {
        self.state.lock().failing.remove(name);
    }

    pub fn set_retired(&self, ts: u32) {
        self.retired.store(ts, Ordering::SeqCst);
    }

    pub fn last_wait_timeout(&self) -> Option<Duration> {
        self.state.lock().last_wait_timeout
    }
}

impl DeviceOps for MockOps {
    fn start(&self, _init_ram: bool) -> KgslResult<()> {
        self.record("start")
    }

    fn stop(&self) -> KgslResult<()> {
        self.record("stop")
    }

    fn idle(&self, _timeout: Duration) -> KgslResult<()> {
        self.record("idle")
    }

    fn sleep(&self, _target: PowerState) -> KgslResult<()> {
        self.record("sleep")
    }

    fn wake(&self) -> KgslResult<()> {
        self.record("wake")
    }

    fn suspend_contexts(&self) -> KgslResult<()> {
        self.record("suspend_contexts")
    }

    fn resume_contexts(&self) -> KgslResult<()> {
        self.record("resume_contexts")
    }

    fn read_timestamp(&self, _kind: TimestampType) -> Timestamp {
        Timestamp(self.retired.load(Ordering::SeqCst))
    }

    fn wait_timestamp(&self, timestamp: Timestamp, timeout: Duration) -> KgslResult<()> {
        self.state.lock().last_wait_timeout = Some(timeout);
        self.record("wait_timestamp")?;
        if self.read_retired_timestamp().reached(timestamp) {
            Ok(())
        } else {
            Err(KgslError::WaitTimeout)
        }
    }

    fn drawctxt_create(&self, _flags: u32) -> KgslResult<DrawContext> {
        self.record("drawctxt_create")?;
        let mut st = self.state.lock();
        st.next_ctx += 1;
        Ok(DrawContext(st.next_ctx))
    }

    fn drawctxt_destroy(&self, _ctxt: DrawContext) -> KgslResult<()> {
        self.record("drawctxt_destroy")
    }

    fn issue_ib_cmds(
        &self,
        _ctxt: &DrawContext,
        _ibs: &[IbDesc],
        _flags: u32,
    ) -> KgslResult<Timestamp> {
        self.record("issue_ib_cmds")?;
        let mut st = self.state.lock();
        st.next_ts += 1;
        Ok(Timestamp(st.next_ts))
    }

    fn get_property(&self, _prop: u32, value: &mut [u8]) -> KgslResult<()> {
        self.record("get_property")?;
        value.fill(0xA5);
        Ok(())
    }

    fn version(&self) -> (u32, u32) {
        (2, 0)
    }
}

/// Memory services wired to mocks, plus one process identity to account mappings to.
pub struct TestMem {
    pub mmu: Arc<MockMmu>,
    pub backing: Arc<MockBacking>,
    pub mem: Arc<Sharedmem>,
    pub stats: Arc<ProcessStats>,
    pub pagetable: Pagetable,
}

impl TestMem {
    pub fn new() -> Self {
        let mmu = MockMmu::new();
        let backing = MockBacking::new();
        let mem = Arc::new(Sharedmem::new(mmu.clone(), backing.clone()));
        let pagetable = mmu.get_pagetable(1).unwrap();
        Self {
            mmu,
            backing,
            mem,
            stats: Arc::new(ProcessStats::new(1)),
            pagetable,
        }
    }

    /// Another process on the same memory services.
    pub fn sharing(other: &Self, pid: u32) -> Self {
        Self {
            mmu: Arc::clone(&other.mmu),
            backing: Arc::clone(&other.backing),
            mem: Arc::clone(&other.mem),
            stats: Arc::new(ProcessStats::new(pid)),
            pagetable: other.mmu.get_pagetable(pid).unwrap(),
        }
    }

    pub fn create(&self, req: &MapRequest) -> KgslResult<MemoryEntry> {
        MemoryEntry::create(&self.mem, self.pagetable, &self.stats, req)
    }

    pub fn destroy_all(&self, entries: Vec<MemoryEntry>) {
        for entry in entries {
            entry.destroy(&self.mem);
        }
    }
}

/// A standalone device on mock collaborators. The idle timer never fires on its own.
pub fn test_device(nap_allowed: bool) -> (Arc<Device>, Arc<MockOps>) {
    let t = TestMem::new();
    let ops = MockOps::new();
    let config = DeviceConfig::default()
        .nap_allowed(nap_allowed)
        .idle_timeout(Duration::from_secs(3600));
    let device = DeviceBuilder::new(0, "kgsl-test", ops.clone())
        .config(config)
        .build(0, t.mem, Arc::new(ProcessList::new()))
        .unwrap();
    (device, ops)
}
