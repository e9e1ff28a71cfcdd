use super::Driver;
use super::context::FileId;
use super::device::Device;
use super::memory::registry::MapRequest;
use super::memory::{BackingSource, MemDesc, ProcessStats, Resolved};
use super::process::ProcessContext;
use crate::error::{KgslError, KgslResult};
use crate::kgsl::ioctl::{
    DrawctxtCreateArgs, FreeMemOnTimestampArgs, IbDesc, KGSL_MEMFLAGS_GPUREADONLY,
    KGSL_TIMEOUT_INFINITE, KGSL_USER_MEM_TYPE_ADDR, KGSL_USER_MEM_TYPE_ASHMEM,
    KGSL_USER_MEM_TYPE_PMEM, MapUserMemArgs, ReadTimestampArgs, SharedmemFromVmallocArgs,
    WaitTimestampArgs,
};
use crate::kgsl::timestamp::{Timestamp, TimestampType};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// An open handle on a device, bound to the process that opened it.
///
/// Closing the handle (explicitly or by dropping it) destroys the execution contexts it
/// created. Closing the process's last handle tears the process down on every device.
#[derive(Debug)]
pub struct File {
    id: FileId,
    device: Arc<Device>,
    process: Option<Arc<ProcessContext>>,
    driver: Arc<Driver>,
}

impl File {
    pub(crate) fn new(
        id: FileId,
        device: Arc<Device>,
        process: Arc<ProcessContext>,
        driver: Arc<Driver>,
    ) -> Self {
        Self {
            id,
            device,
            process: Some(process),
            driver,
        }
    }

    #[must_use]
    pub const fn id(&self) -> FileId {
        self.id
    }

    #[must_use]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    fn process(&self) -> KgslResult<&Arc<ProcessContext>> {
        self.process
            .as_ref()
            .ok_or_else(|| KgslError::State("handle already closed".into()))
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(|p| p.pid())
    }

    /// The owning process's usage counters. Outlives the handle.
    ///
    /// # Errors
    /// Returns `KgslError::State` if the handle is already closed.
    pub fn process_stats(&self) -> KgslResult<Arc<ProcessStats>> {
        Ok(Arc::clone(self.process()?.stats()))
    }

    /// Base of the owning process's pagetable, usable as a hint for [`File::resolve`].
    ///
    /// # Errors
    /// Returns `KgslError::State` if the handle is already closed.
    pub fn pagetable_base(&self) -> KgslResult<u32> {
        Ok(self.process()?.pagetable().base)
    }

    // ===========================================================================================
    // Memory
    // ===========================================================================================

    /// Maps memory for the owning process.
    ///
    /// Only the process lock is held while mapping; the free queue is drained first so
    /// retired buffers are returned before new ones are taken.
    ///
    /// # Errors
    /// Returns `KgslError::State` on a closed handle, or whatever the backing or MMU layer
    /// reports when the mapping cannot be set up.
    pub fn map(&self, req: &MapRequest) -> KgslResult<MemDesc> {
        let process = self.process()?;
        self.device.drain();
        let result = process.map(req);
        self.device.check_idle();
        result
    }

    /// Maps a pinned or anonymous user buffer and stores its GPU address in `args`.
    ///
    /// # Errors
    /// Returns `KgslError::InvalidArgument` for an unknown `memtype`, otherwise as
    /// [`File::map`].
    pub fn map_user_mem(&self, args: &mut MapUserMemArgs) -> KgslResult<()> {
        let source = match args.memtype {
            KGSL_USER_MEM_TYPE_PMEM => BackingSource::Pinned { fd: args.fd },
            KGSL_USER_MEM_TYPE_ASHMEM => BackingSource::AnonShared {
                fd: Some(args.fd),
                hostptr: args.hostptr,
            },
            KGSL_USER_MEM_TYPE_ADDR => BackingSource::AnonShared {
                fd: None,
                hostptr: args.hostptr,
            },
            other => {
                error!("invalid memory type {other}");
                return Err(KgslError::InvalidArgument(format!(
                    "unknown memory type {other}"
                )));
            }
        };

        let mut req = MapRequest::new(source)
            .offset(args.offset as usize)
            .len(args.len as usize);
        if args.flags & KGSL_MEMFLAGS_GPUREADONLY != 0 {
            req = req.gpu_readonly();
        }

        let desc = self.map(&req)?;
        args.gpuaddr = desc.gpuaddr;
        Ok(())
    }

    /// # Errors
    /// As [`File::map`].
    pub fn sharedmem_from_vmalloc(&self, args: &mut SharedmemFromVmallocArgs) -> KgslResult<()> {
        let mut req = MapRequest::new(BackingSource::Heap {
            hostptr: args.hostptr,
        });
        if args.flags & KGSL_MEMFLAGS_GPUREADONLY != 0 {
            req = req.gpu_readonly();
        }
        let desc = self.map(&req)?;
        args.gpuaddr = desc.gpuaddr;
        Ok(())
    }

    /// Releases the mapping at `gpuaddr` immediately, after reclaiming retired queue entries.
    ///
    /// # Errors
    /// Returns `KgslError::NotFound` if no mapping starts at `gpuaddr`.
    pub fn free(&self, gpuaddr: u32) -> KgslResult<()> {
        let process = self.process()?;
        self.device.with_lock(|inner| {
            self.device.drain_locked(inner);
            process.free(gpuaddr).inspect_err(|_| {
                error!(pid = process.pid(), "invalid gpuaddr {gpuaddr:#x}");
            })
        })
    }

    /// Releases the mapping at `gpuaddr` once the GPU retires `timestamp`.
    ///
    /// # Errors
    /// Returns `KgslError::NotFound` for an unknown address and
    /// `KgslError::InvalidArgument` if `timestamp` is older than the newest queued entry
    /// still waiting to retire. The mapping is kept on error.
    pub fn free_on_timestamp(
        &self,
        gpuaddr: u32,
        timestamp: Timestamp,
        kind: TimestampType,
    ) -> KgslResult<()> {
        let process = self.process()?;
        self.device
            .free_on_timestamp(process, gpuaddr, timestamp, kind)
    }

    /// # Errors
    /// Returns `KgslError::InvalidArgument` for an unknown timestamp type, otherwise as
    /// [`File::free_on_timestamp`].
    pub fn free_mem_on_timestamp(&self, args: &FreeMemOnTimestampArgs) -> KgslResult<()> {
        let kind = TimestampType::try_from(args.type_)?;
        self.free_on_timestamp(args.gpuaddr, Timestamp(args.timestamp), kind)
    }

    /// Cleans the CPU cache for a cached mapping; a no-op for uncached ones.
    ///
    /// # Errors
    /// Returns `KgslError::NotFound` if no mapping starts at `gpuaddr`.
    pub fn flush_cache(&self, gpuaddr: u32) -> KgslResult<()> {
        self.process()?.flush_cache(gpuaddr)
    }

    /// Looks up the mapping that starts at `gpuaddr`.
    ///
    /// # Errors
    /// Returns `KgslError::State` if the handle is already closed.
    pub fn find(&self, gpuaddr: u32) -> KgslResult<Option<MemDesc>> {
        Ok(self.process()?.find(gpuaddr))
    }

    /// Translates a GPU address on this device. `pt_base` restricts the search to one
    /// process's mappings.
    ///
    /// # Errors
    /// Returns `KgslError::NotFound` if no live or queued mapping covers `gpuaddr`.
    pub fn resolve(&self, pt_base: Option<u32>, gpuaddr: u32) -> KgslResult<Resolved> {
        self.device.resolve(pt_base, gpuaddr)
    }

    // ===========================================================================================
    // Timestamps
    // ===========================================================================================

    /// # Errors
    /// Returns `KgslError::WaitTimeout` if the timestamp does not retire in time.
    pub fn wait_timestamp(&self, args: &WaitTimestampArgs) -> KgslResult<()> {
        let timeout = (args.timeout != KGSL_TIMEOUT_INFINITE)
            .then(|| Duration::from_millis(u64::from(args.timeout)));
        self.device
            .wait_timestamp(Timestamp(args.timestamp), timeout)
    }

    /// # Errors
    /// Returns `KgslError::InvalidArgument` for an unknown timestamp type.
    pub fn read_timestamp(&self, args: &mut ReadTimestampArgs) -> KgslResult<()> {
        let kind = TimestampType::try_from(args.type_)?;
        args.timestamp = self.device.read_timestamp(kind).0;
        Ok(())
    }

    // ===========================================================================================
    // Contexts & Submission
    // ===========================================================================================

    /// Creates an execution context owned by this handle and returns its id.
    ///
    /// # Errors
    /// Returns `KgslError::State` on a closed handle, `KgslError::ResourceExhausted` when no id is
    /// free, or the hardware layer's error.
    pub fn create_context(&self, flags: u32) -> KgslResult<u32> {
        self.process()?;
        self.device.create_context(self.id, flags)
    }

    /// # Errors
    /// As [`File::create_context`].
    pub fn drawctxt_create(&self, args: &mut DrawctxtCreateArgs) -> KgslResult<()> {
        args.drawctxt_id = self.create_context(args.flags)?;
        Ok(())
    }

    /// # Errors
    /// Returns `KgslError::NotFound` unless this handle owns context `id`.
    pub fn destroy_context(&self, id: u32) -> KgslResult<()> {
        self.device.destroy_context(self.id, id)
    }

    /// Submits `ibs` on context `drawctxt_id`, returning the timestamp the GPU will retire
    /// when it finishes them.
    ///
    /// # Errors
    /// Returns `KgslError::NotFound` for a context this handle does not own and
    /// `KgslError::InvalidArgument` for an empty list or a buffer outside the process's
    /// mappings.
    pub fn issue_ib_cmds(
        &self,
        drawctxt_id: u32,
        ibs: &[IbDesc],
        flags: u32,
    ) -> KgslResult<Timestamp> {
        let process = self.process()?;
        self.device
            .issue_ib_cmds(self.id, process, drawctxt_id, ibs, flags)
    }

    // ===========================================================================================
    // Properties & Teardown
    // ===========================================================================================

    /// # Errors
    /// As [`Device::get_property`].
    pub fn get_property(&self, prop: u32, value: &mut [u8]) -> KgslResult<()> {
        self.device.get_property(prop, value)
    }

    /// Closes the handle, reporting any error from stopping the device.
    ///
    /// # Errors
    /// Returns the hardware layer's error if stopping the device after the last close
    /// fails. The handle is released either way.
    pub fn close(mut self) -> KgslResult<()> {
        self.release()
    }

    fn release(&mut self) -> KgslResult<()> {
        let Some(process) = self.process.take() else {
            return Ok(());
        };
        debug!(pid = process.pid(), "closing {} on {}", self.id, self.device.name());
        let result = self.device.release_handle(self.id);
        self.driver.put_process(process, &self.device);
        result
    }
}

impl Drop for File {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            error!("failed to release {}: {e}", self.id);
        }
    }
}
