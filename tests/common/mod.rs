#![allow(dead_code)]

use kgsl_rs::driver::memory::{
    AcquiredBacking, Backing, BackingHandle, BackingKind, BackingSource, BackingStore, MemFlags,
};
use kgsl_rs::kgsl::device::{DeviceOps, DrawContext, PowerState};
use kgsl_rs::kgsl::ioctl::IbDesc;
use kgsl_rs::kgsl::mmu::{Mmu, PageProt, Pagetable, PhysRegion};
use kgsl_rs::kgsl::timestamp::{Timestamp, TimestampType};
use kgsl_rs::{Device, DeviceBuilder, DeviceConfig, Driver, DriverConfig, KgslError, KgslResult};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

pub const PAGE: usize = 4096;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
struct VaState {
    next: u32,
    refs: HashMap<u32, usize>,
    mapped: BTreeMap<u32, usize>,
}

/// Bump allocator over the GPU address space, leaving a guard page between mappings.
#[derive(Default)]
pub struct FakeMmu {
    state: Mutex<VaState>,
}

impl FakeMmu {
    pub fn mapped_bytes(&self) -> usize {
        self.state.lock().mapped.values().sum()
    }

    pub fn pagetable_refs(&self, name: u32) -> usize {
        self.state.lock().refs.get(&name).copied().unwrap_or(0)
    }
}

impl Mmu for FakeMmu {
    fn get_pagetable(&self, name: u32) -> KgslResult<Pagetable> {
        *self.state.lock().refs.entry(name).or_default() += 1;
        Ok(Pagetable {
            name,
            base: 0x0800_0000 + name * 0x100,
        })
    }

    fn put_pagetable(&self, pagetable: Pagetable) {
        let mut st = self.state.lock();
        if let Some(n) = st.refs.get_mut(&pagetable.name) {
            *n -= 1;
        }
        st.refs.retain(|_, n| *n > 0);
    }

    fn map(&self, _pt: &Pagetable, region: PhysRegion, _prot: PageProt) -> KgslResult<u32> {
        let mut st = self.state.lock();
        if st.next == 0 {
            st.next = 0x6600_0000;
        }
        let addr = st.next;
        st.next += (region.size + PAGE) as u32;
        st.mapped.insert(addr, region.size);
        Ok(addr)
    }

    fn unmap(&self, _pt: &Pagetable, gpuaddr: u32, size: usize) {
        let removed = self.state.lock().mapped.remove(&gpuaddr);
        assert_eq!(removed, Some(size), "unmap of {gpuaddr:#x} does not match a mapping");
    }
}

/// Pinned regions are `fd` bytes long; heap and shared regions are two pages.
#[derive(Default)]
pub struct FakeBacking {
    next: AtomicUsize,
    live: Mutex<HashMap<u64, BackingKind>>,
    flushes: AtomicUsize,
}

impl FakeBacking {
    pub fn live(&self) -> usize {
        self.live.lock().len()
    }

    pub fn cache_ops(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    fn release(&self, handle: BackingHandle, kind: BackingKind) {
        let gone = self.live.lock().remove(&handle.0);
        assert_eq!(gone, Some(kind), "backing released twice or by the wrong path");
    }
}

impl BackingStore for FakeBacking {
    fn acquire(&self, source: &BackingSource) -> KgslResult<AcquiredBacking> {
        let base = 0x1000_0000 + self.next.fetch_add(0x10_0000, Ordering::SeqCst);
        let (kind, len, start, host) = match *source {
            BackingSource::Heap { hostptr } => (BackingKind::Heap, 2 * PAGE, base, hostptr),
            BackingSource::Pinned { fd } if fd > 0 => {
                (BackingKind::Pinned, fd as usize, base, base + 0x4000_0000)
            }
            BackingSource::Pinned { fd } => {
                return Err(KgslError::InvalidArgument(format!("bad fd {fd}")));
            }
            BackingSource::AnonShared { hostptr, .. } => {
                (BackingKind::AnonShared, 2 * PAGE, hostptr, hostptr)
            }
        };

        let handle = base as u64;
        self.live.lock().insert(handle, kind);
        let backing = match kind {
            BackingKind::Heap => Backing::Heap(BackingHandle(handle)),
            BackingKind::Pinned => Backing::Pinned(BackingHandle(handle)),
            BackingKind::AnonShared => Backing::AnonShared(BackingHandle(handle)),
        };
        Ok(AcquiredBacking {
            backing,
            start,
            len,
            hostptr: host as *mut u8,
        })
    }

    fn free_heap(&self, handle: BackingHandle) {
        self.release(handle, BackingKind::Heap);
    }

    fn put_pinned(&self, handle: BackingHandle) {
        self.release(handle, BackingKind::Pinned);
    }

    fn put_anon_shared(&self, handle: BackingHandle) {
        self.release(handle, BackingKind::AnonShared);
    }

    fn cache_range_op(&self, _hostptr: *mut u8, _size: usize, _op: MemFlags) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }
}

/// A GPU whose retired timestamp is set by the test. Timestamp waits can be held open.
#[derive(Default)]
pub struct FakeGpu {
    retired: AtomicU32,
    issued: AtomicU32,
    contexts: AtomicU32,
    hold_waits: Mutex<bool>,
    released: Condvar,
    waiting: AtomicU32,
    calls: Mutex<HashMap<&'static str, usize>>,
    fail_start: Mutex<bool>,
}

impl FakeGpu {
    pub fn set_retired(&self, ts: u32) {
        self.retired.store(ts, Ordering::SeqCst);
    }

    pub fn hold_waits(&self) {
        *self.hold_waits.lock() = true;
    }

    pub fn release_waits(&self) {
        *self.hold_waits.lock() = false;
        self.released.notify_all();
    }

    /// Number of threads currently parked inside `wait_timestamp`.
    pub fn waiting(&self) -> u32 {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn calls(&self, name: &str) -> usize {
        self.calls.lock().get(name).copied().unwrap_or(0)
    }

    pub fn fail_start(&self, fail: bool) {
        *self.fail_start.lock() = fail;
    }

    fn count(&self, name: &'static str) {
        *self.calls.lock().entry(name).or_default() += 1;
    }
}

impl DeviceOps for FakeGpu {
    fn start(&self, _init_ram: bool) -> KgslResult<()> {
        self.count("start");
        if *self.fail_start.lock() {
            return Err(KgslError::Device("microcode load failed".into()));
        }
        Ok(())
    }

    fn stop(&self) -> KgslResult<()> {
        self.count("stop");
        Ok(())
    }

    fn idle(&self, _timeout: Duration) -> KgslResult<()> {
        self.count("idle");
        Ok(())
    }

    fn sleep(&self, _target: PowerState) -> KgslResult<()> {
        self.count("sleep");
        Ok(())
    }

    fn wake(&self) -> KgslResult<()> {
        self.count("wake");
        Ok(())
    }

    fn suspend_contexts(&self) -> KgslResult<()> {
        self.count("suspend_contexts");
        Ok(())
    }

    fn resume_contexts(&self) -> KgslResult<()> {
        self.count("resume_contexts");
        Ok(())
    }

    fn read_timestamp(&self, kind: TimestampType) -> Timestamp {
        match kind {
            TimestampType::Retired => Timestamp(self.retired.load(Ordering::SeqCst)),
            TimestampType::Consumed => Timestamp(self.issued.load(Ordering::SeqCst)),
        }
    }

    fn wait_timestamp(&self, timestamp: Timestamp, _timeout: Duration) -> KgslResult<()> {
        let mut hold = self.hold_waits.lock();
        self.waiting.fetch_add(1, Ordering::SeqCst);
        while *hold {
            self.released.wait(&mut hold);
        }
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        if self.read_retired_timestamp().reached(timestamp) {
            Ok(())
        } else {
            Err(KgslError::WaitTimeout)
        }
    }

    fn drawctxt_create(&self, _flags: u32) -> KgslResult<DrawContext> {
        let n = self.contexts.fetch_add(1, Ordering::SeqCst);
        Ok(DrawContext(u64::from(n) + 100))
    }

    fn drawctxt_destroy(&self, _ctxt: DrawContext) -> KgslResult<()> {
        self.count("drawctxt_destroy");
        Ok(())
    }

    fn issue_ib_cmds(
        &self,
        _ctxt: &DrawContext,
        _ibs: &[IbDesc],
        _flags: u32,
    ) -> KgslResult<Timestamp> {
        Ok(Timestamp(self.issued.fetch_add(1, Ordering::SeqCst) + 1))
    }

    fn get_property(&self, prop: u32, _value: &mut [u8]) -> KgslResult<()> {
        Err(KgslError::InvalidArgument(format!("property {prop:#x}")))
    }

    fn version(&self) -> (u32, u32) {
        (2, 2)
    }
}

pub struct Harness {
    pub driver: Arc<Driver>,
    pub device: Arc<Device>,
    pub gpu: Arc<FakeGpu>,
    pub mmu: Arc<FakeMmu>,
    pub backing: Arc<FakeBacking>,
}

impl Harness {
    /// One 3D device with napping disabled so power state only changes when a test asks.
    pub fn new() -> Self {
        Self::with_config(DeviceConfig::default().nap_allowed(false))
    }

    pub fn with_config(config: DeviceConfig) -> Self {
        init_tracing();
        let mmu = Arc::new(FakeMmu::default());
        let backing = Arc::new(FakeBacking::default());
        let gpu = Arc::new(FakeGpu::default());
        let driver = Driver::new(DriverConfig::default(), mmu.clone(), backing.clone());
        let device = driver
            .register_device(DeviceBuilder::new(0, "kgsl-3d0", gpu.clone()).config(config))
            .expect("register device");
        Self {
            driver,
            device,
            gpu,
            mmu,
            backing,
        }
    }
}
