use super::context::{ContextRegistry, FileId};
use super::memory::memqueue::MemQueue;
use super::memory::{BackingKind, MemDesc, MemFlags, ProcessStats, Resolved, Sharedmem};
use super::process::{ProcessContext, ProcessList};
use super::pwrctrl::{IdleTimer, PwrState};
use super::resolver::AddressResolver;
use crate::error::{KgslError, KgslResult};
use crate::kgsl::device::{DeviceOps, PowerState};
use crate::kgsl::ioctl::{
    IbDesc, KGSL_PROP_PWRSTATE, KGSL_PROP_VERSION, KGSL_VERSION_MAJOR, KGSL_VERSION_MINOR,
    Version,
};
use crate::kgsl::timestamp::{Timestamp, TimestampType};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{Ordering, fence};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

// ===============================================================================================
// Configuration
// ===============================================================================================

/// Per-device tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    /// How long the device may sit idle before the idle timer pushes it deeper.
    pub idle_timeout: Duration,
    /// Bound on waiting for the GPU to drain during a suspend.
    pub idle_wait_timeout: Duration,
    /// Used when a caller asks to wait on a timestamp forever.
    pub default_wait_timeout: Duration,
    pub nap_allowed: bool,
    pub max_contexts: usize,
    /// Clean CPU caches of cached mappings before every submission.
    pub cache_enabled: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_millis(80),
            idle_wait_timeout: Duration::from_secs(1),
            default_wait_timeout: Duration::from_secs(10),
            nap_allowed: true,
            max_contexts: 128,
            cache_enabled: false,
        }
    }
}

impl DeviceConfig {
    #[must_use]
    pub const fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn idle_wait_timeout(mut self, timeout: Duration) -> Self {
        self.idle_wait_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn default_wait_timeout(mut self, timeout: Duration) -> Self {
        self.default_wait_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn nap_allowed(mut self, allowed: bool) -> Self {
        self.nap_allowed = allowed;
        self
    }

    #[must_use]
    pub const fn max_contexts(mut self, max: usize) -> Self {
        self.max_contexts = max;
        self
    }

    #[must_use]
    pub const fn cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }
}

// ===============================================================================================
// Registration
// ===============================================================================================

/// Describes a device to be registered with the driver.
pub struct DeviceBuilder {
    id: u32,
    name: String,
    ops: Arc<dyn DeviceOps>,
    config: DeviceConfig,
    globals: Vec<MemDesc>,
}

impl DeviceBuilder {
    pub fn new(id: u32, name: impl Into<String>, ops: Arc<dyn DeviceOps>) -> Self {
        Self {
            id,
            name: name.into(),
            ops,
            config: DeviceConfig::default(),
            globals: Vec::new(),
        }
    }

    #[must_use]
    pub const fn config(mut self, config: DeviceConfig) -> Self {
        self.config = config;
        self
    }

    /// The ring buffer's command region and its read/write pointer block.
    #[must_use]
    pub fn ringbuffer(mut self, buffer: MemDesc, memptrs: MemDesc) -> Self {
        self.globals.push(buffer);
        self.globals.push(memptrs);
        self
    }

    /// The device-global status and timestamp store.
    #[must_use]
    pub fn memstore(mut self, memstore: MemDesc) -> Self {
        self.globals.push(memstore);
        self
    }

    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn build(
        self,
        minor: u32,
        sharedmem: Arc<Sharedmem>,
        processes: Arc<ProcessList>,
    ) -> KgslResult<Arc<Device>> {
        let device = Arc::new(Device {
            id: self.id,
            minor,
            inner: Mutex::new(DeviceInner {
                pwr: PwrState::new(self.config.nap_allowed),
                open_count: 0,
                memqueue: MemQueue::new(),
                contexts: ContextRegistry::new(self.config.max_contexts),
            }),
            quiescent: Condvar::new(),
            hwaccess: Condvar::new(),
            idle_timer: IdleTimer::new(),
            ops: self.ops,
            config: self.config,
            globals: self.globals,
            sharedmem,
            processes,
            name: self.name,
        });
        device
            .idle_timer
            .start(Arc::downgrade(&device), &device.name)?;
        Ok(device)
    }
}

impl std::fmt::Debug for DeviceBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuilder")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ===============================================================================================
// Device
// ===============================================================================================

/// State guarded by the device lock.
#[derive(Debug)]
pub(crate) struct DeviceInner {
    pub pwr: PwrState,
    pub open_count: u32,
    pub memqueue: MemQueue,
    pub contexts: ContextRegistry,
}

/// One GPU core as seen by the core driver.
pub struct Device {
    id: u32,
    minor: u32,
    pub(crate) name: String,
    pub(crate) config: DeviceConfig,
    pub(crate) ops: Arc<dyn DeviceOps>,
    pub(crate) inner: Mutex<DeviceInner>,
    /// Signalled whenever the active count drops.
    pub(crate) quiescent: Condvar,
    /// Signalled when the device leaves SUSPEND.
    pub(crate) hwaccess: Condvar,
    pub(crate) idle_timer: IdleTimer,
    globals: Vec<MemDesc>,
    sharedmem: Arc<Sharedmem>,
    processes: Arc<ProcessList>,
}

impl Device {
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub const fn minor(&self) -> u32 {
        self.minor
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn config(&self) -> &DeviceConfig {
        &self.config
    }

    #[must_use]
    pub fn open_count(&self) -> u32 {
        self.inner.lock().open_count
    }

    #[must_use]
    pub fn memqueue_len(&self) -> usize {
        self.inner.lock().memqueue.len()
    }

    #[must_use]
    pub fn context_count(&self) -> usize {
        self.inner.lock().contexts.len()
    }

    // ===========================================================================================
    // Locking
    // ===========================================================================================

    /// Takes the device lock for an operation that may touch the hardware.
    ///
    /// Blocks while the device is suspended and wakes it if it is napping or asleep.
    pub(crate) fn lock(&self) -> MutexGuard<'_, DeviceInner> {
        let mut inner = self.inner.lock();
        self.check_suspended(&mut inner);
        self.wake_locked(&mut inner);
        inner
    }

    /// Runs `f` under the device lock, followed by an idle check.
    pub(crate) fn with_lock<R>(&self, f: impl FnOnce(&mut DeviceInner) -> R) -> R {
        let mut inner = self.lock();
        let ret = f(&mut inner);
        self.check_idle_locked(&mut inner);
        ret
    }

    // ===========================================================================================
    // Open & Release
    // ===========================================================================================

    /// Accounts a new open handle, starting the device on the first one.
    pub(crate) fn open_handle(&self) -> KgslResult<()> {
        let mut inner = self.inner.lock();
        self.check_suspended(&mut inner);

        inner.open_count += 1;
        if inner.open_count > 1 {
            self.drain_locked(&mut inner);
            return Ok(());
        }

        if let Err(e) = self.ops.start(true) {
            inner.open_count -= 1;
            inner.pwr.state = PowerState::Init;
            error!(device = %self.name, "device start failed: {e}");
            return Err(e);
        }
        inner.pwr.state = PowerState::Active;
        info!(device = %self.name, "state -> ACTIVE");
        self.idle_timer.arm(self.config.idle_timeout);
        Ok(())
    }

    /// Drops an open handle: destroys the contexts it owns and stops the device after the
    /// last one.
    pub(crate) fn release_handle(&self, file: FileId) -> KgslResult<()> {
        let mut inner = self.inner.lock();
        self.check_suspended(&mut inner);
        self.drain_locked(&mut inner);

        for id in inner.contexts.owned_by(file) {
            if let Err(e) = self.destroy_context_locked(&mut inner, file, id) {
                error!(device = %self.name, "failed to destroy context {id}: {e}");
            }
        }

        inner.open_count = inner.open_count.saturating_sub(1);
        if inner.open_count > 0 {
            return Ok(());
        }

        self.idle_timer.cancel();
        let result = self.ops.stop();
        inner.pwr.state = PowerState::Init;
        info!(device = %self.name, "state -> INIT");
        result
    }

    // ===========================================================================================
    // Deferred Free
    // ===========================================================================================

    /// Destroys queued entries whose timestamp has retired.
    pub(crate) fn drain_locked(&self, inner: &mut DeviceInner) -> usize {
        let retired = self.ops.read_retired_timestamp();
        inner.memqueue.drain(retired, &self.sharedmem)
    }

    pub fn drain(&self) -> usize {
        let mut inner = self.lock();
        self.drain_locked(&mut inner)
    }

    /// Force-destroys every queued entry of a departing process.
    pub(crate) fn cleanup_process(&self, owner: &Arc<ProcessStats>) -> usize {
        let mut inner = self.inner.lock();
        let n = inner.memqueue.cleanup(owner, &self.sharedmem);
        if n > 0 {
            debug!(
                device = %self.name,
                pid = owner.pid(),
                "destroyed {n} queued entries of exiting process"
            );
        }
        n
    }

    /// Has the GPU retired `timestamp` yet?
    #[must_use]
    pub fn check_timestamp(&self, timestamp: Timestamp) -> bool {
        self.ops.read_retired_timestamp().reached(timestamp)
    }

    /// Moves the entry at `gpuaddr` from `process`'s registry to the free queue.
    pub(crate) fn free_on_timestamp(
        &self,
        process: &ProcessContext,
        gpuaddr: u32,
        timestamp: Timestamp,
        kind: TimestampType,
    ) -> KgslResult<()> {
        self.with_lock(|inner| {
            // Retired entries must not hold back the ordering check.
            self.drain_locked(inner);
            if !inner.memqueue.accepts(timestamp) {
                error!(
                    device = %self.name,
                    "free of {gpuaddr:#x} at {timestamp} is older than the queue tail"
                );
                return Err(KgslError::InvalidArgument(format!(
                    "timestamp {timestamp} is older than the last queued free"
                )));
            }

            let mut entry = process.release(gpuaddr).inspect_err(|_| {
                error!(device = %self.name, "invalid gpuaddr {gpuaddr:#x}");
            })?;
            if entry.kind() == BackingKind::Heap {
                entry.flags.remove(MemFlags::CACHE_MASK);
            }

            if let Err(entry) = inner.memqueue.enqueue(entry, timestamp, kind) {
                process.restore(entry);
                return Err(KgslError::InvalidArgument(format!(
                    "timestamp {timestamp} is older than the last queued free"
                )));
            }
            self.drain_locked(inner);
            Ok(())
        })
    }

    // ===========================================================================================
    // Timestamps
    // ===========================================================================================

    /// Blocks until `timestamp` retires, without holding the device lock.
    ///
    /// The wait counts as an active operation, so a suspend waits for it to finish.
    ///
    /// # Errors
    /// Returns `KgslError::WaitTimeout` if the timestamp has not retired when `timeout`
    /// (or the configured default) expires.
    ///
    /// # Panics
    /// Panics if the active count underflows, which means a wait was accounted twice.
    pub fn wait_timestamp(
        &self,
        timestamp: Timestamp,
        timeout: Option<Duration>,
    ) -> KgslResult<()> {
        {
            let mut inner = self.lock();
            self.drain_locked(&mut inner);
            inner.pwr.active_cnt += 1;
        }

        let timeout = timeout.unwrap_or(self.config.default_wait_timeout);
        let result = self.ops.wait_timestamp(timestamp, timeout);
        // The GPU wrote whatever the timestamp guards.
        fence(Ordering::Acquire);

        let mut inner = self.inner.lock();
        self.drain_locked(&mut inner);
        inner.pwr.active_cnt -= 1;
        self.quiescent.notify_all();
        self.check_idle_locked(&mut inner);
        result
    }

    pub fn read_timestamp(&self, kind: TimestampType) -> Timestamp {
        self.with_lock(|_| self.ops.read_timestamp(kind))
    }

    // ===========================================================================================
    // Contexts & Submission
    // ===========================================================================================

    pub(crate) fn create_context(&self, owner: FileId, flags: u32) -> KgslResult<u32> {
        self.with_lock(|inner| {
            let id = inner.contexts.create(owner)?;
            match self.ops.drawctxt_create(flags) {
                Ok(devctxt) => {
                    if let Some(ctx) = inner.contexts.find_mut(owner, id) {
                        ctx.devctxt = Some(devctxt);
                    }
                    debug!(device = %self.name, "created context {id} for {owner}");
                    Ok(id)
                }
                Err(e) => {
                    inner.contexts.destroy(owner, id)?;
                    Err(e)
                }
            }
        })
    }

    pub(crate) fn destroy_context(&self, owner: FileId, id: u32) -> KgslResult<()> {
        self.with_lock(|inner| self.destroy_context_locked(inner, owner, id))
    }

    fn destroy_context_locked(
        &self,
        inner: &mut DeviceInner,
        owner: FileId,
        id: u32,
    ) -> KgslResult<()> {
        let ctx = inner.contexts.find_mut(owner, id).ok_or_else(|| {
            error!(device = %self.name, "invalid drawctxt_id {id}");
            KgslError::NotFound(format!("context {id}"))
        })?;

        let result = ctx
            .devctxt
            .take()
            .map_or(Ok(()), |devctxt| self.ops.drawctxt_destroy(devctxt));
        inner.contexts.destroy(owner, id)?;
        result
    }

    /// Submits indirect buffers on one of `owner`'s contexts.
    pub(crate) fn issue_ib_cmds(
        &self,
        owner: FileId,
        process: &ProcessContext,
        drawctxt_id: u32,
        ibs: &[IbDesc],
        flags: u32,
    ) -> KgslResult<Timestamp> {
        self.with_lock(|inner| {
            self.drain_locked(inner);
            let devctxt = inner
                .contexts
                .find(owner, drawctxt_id)
                .and_then(|ctx| ctx.devctxt.as_ref())
                .ok_or_else(|| {
                    error!(device = %self.name, "invalid drawctxt drawctxt_id {drawctxt_id}");
                    KgslError::NotFound(format!("context {drawctxt_id}"))
                })?;

            if ibs.is_empty() {
                return Err(KgslError::InvalidArgument("no indirect buffers".into()));
            }
            process.check_ibdesc(ibs)?;

            if self.config.cache_enabled {
                process.clean_cache_all();
            }

            let timestamp = self.ops.issue_ib_cmds(devctxt, ibs, flags)?;

            // A buffer freed while the submission was in flight would have been read anyway.
            process.check_ibdesc(ibs).inspect_err(|_| {
                error!(device = %self.name, "ib descriptors changed during submission");
            })?;
            Ok(timestamp)
        })
    }

    // ===========================================================================================
    // Properties & Translation
    // ===========================================================================================

    /// Driver and hardware versions.
    #[must_use]
    pub fn version(&self) -> Version {
        let (dev_major, dev_minor) = self.ops.version();
        Version {
            drv_major: KGSL_VERSION_MAJOR,
            drv_minor: KGSL_VERSION_MINOR,
            dev_major,
            dev_minor,
        }
    }

    /// Fills `value` with property `prop`. Version and power state are answered here; the
    /// rest come from the device layer.
    ///
    /// # Errors
    /// Returns `KgslError::InvalidArgument` if `value` has the wrong size for `prop` or the
    /// device layer does not know `prop`.
    pub fn get_property(&self, prop: u32, value: &mut [u8]) -> KgslResult<()> {
        self.with_lock(|inner| match prop {
            KGSL_PROP_VERSION => {
                let v = self.version();
                let words = [v.drv_major, v.drv_minor, v.dev_major, v.dev_minor];
                write_words(value, &words)
            }
            KGSL_PROP_PWRSTATE => write_words(value, &[inner.pwr.state as u32]),
            _ => self.ops.get_property(prop, value),
        })
    }

    /// Translates a GPU address to host memory. See [`AddressResolver`].
    ///
    /// # Errors
    /// Returns `KgslError::NotFound` if no global, live or queued mapping covers `gpuaddr`.
    pub fn resolve(&self, pt_base: Option<u32>, gpuaddr: u32) -> KgslResult<Resolved> {
        let inner = self.inner.lock();
        AddressResolver {
            globals: &self.globals,
            processes: &self.processes,
            memqueue: &inner.memqueue,
        }
        .resolve(pt_base, gpuaddr)
    }
}

fn write_words(out: &mut [u8], words: &[u32]) -> KgslResult<()> {
    if out.len() != std::mem::size_of_val(words) {
        return Err(KgslError::InvalidArgument(format!(
            "property buffer is {} bytes, expected {}",
            out.len(),
            std::mem::size_of_val(words)
        )));
    }
    for (chunk, word) in out.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_ne_bytes());
    }
    Ok(())
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("minor", &self.minor)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
