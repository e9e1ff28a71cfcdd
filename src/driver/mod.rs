//! The core driver: devices, processes, open handles and the memory they share.

pub mod context;
pub mod device;
pub mod file;
pub mod memory;
pub mod process;
pub mod pwrctrl;
pub mod resolver;

#[cfg(test)]
pub(crate) mod testing;

pub use context::FileId;
pub use file::File;

use crate::error::{KgslError, KgslResult};
use crate::kgsl::device::PowerState;
use crate::kgsl::mmu::{KGSL_MMU_GLOBAL_PT, Mmu};
use device::{Device, DeviceBuilder};
use memory::{BackingStore, DriverStats, Sharedmem};
use parking_lot::Mutex;
use process::{ProcessContext, ProcessList};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, info, warn};

// ===============================================================================================
// Configuration
// ===============================================================================================

/// Driver-wide configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverConfig {
    /// Give every process its own GPU address space instead of sharing the global one.
    pub per_process_pagetable: bool,
    pub max_devices: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            per_process_pagetable: true,
            max_devices: 2,
        }
    }
}

impl DriverConfig {
    #[must_use]
    pub const fn per_process_pagetable(mut self, enabled: bool) -> Self {
        self.per_process_pagetable = enabled;
        self
    }

    #[must_use]
    pub const fn max_devices(mut self, max: usize) -> Self {
        self.max_devices = max;
        self
    }
}

// ===============================================================================================
// Driver
// ===============================================================================================

/// A driver instance: the device minor table, the process list and the memory services.
///
/// Constructed once and shared through an `Arc`; open handles keep it alive.
pub struct Driver {
    config: DriverConfig,
    devices: Mutex<Vec<Option<Arc<Device>>>>,
    processes: Arc<ProcessList>,
    sharedmem: Arc<Sharedmem>,
    next_file: AtomicU64,
}

impl Driver {
    pub fn new(
        config: DriverConfig,
        mmu: Arc<dyn Mmu>,
        backing: Arc<dyn BackingStore>,
    ) -> Arc<Self> {
        info!(
            "driver init, per-process pagetables {}",
            if config.per_process_pagetable { "on" } else { "off" }
        );
        Arc::new(Self {
            config,
            devices: Mutex::new(vec![None; config.max_devices]),
            processes: Arc::new(ProcessList::new()),
            sharedmem: Arc::new(Sharedmem::new(mmu, backing)),
            next_file: AtomicU64::new(1),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &DriverConfig {
        &self.config
    }

    #[must_use]
    pub fn stats(&self) -> &DriverStats {
        &self.sharedmem.stats
    }

    /// Number of processes with at least one open handle.
    #[must_use]
    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    // ===========================================================================================
    // Device Table
    // ===========================================================================================

    /// Registers a device in the first free minor slot.
    ///
    /// # Errors
    /// Returns `KgslError::InvalidArgument` if the id is already registered,
    /// `KgslError::ResourceExhausted` if every minor is taken, or an I/O error if the idle
    /// timer thread cannot be spawned.
    pub fn register_device(&self, builder: DeviceBuilder) -> KgslResult<Arc<Device>> {
        let mut devices = self.devices.lock();
        if devices.iter().flatten().any(|d| d.id() == builder.id()) {
            return Err(KgslError::InvalidArgument(format!(
                "device id {} already registered",
                builder.id()
            )));
        }

        let minor = devices.iter().position(Option::is_none).ok_or_else(|| {
            error!("minor number table is full");
            KgslError::ResourceExhausted(format!("all {} device minors in use", devices.len()))
        })?;
        let minor_num = u32::try_from(minor)
            .map_err(|_| KgslError::ResourceExhausted("device minor space".into()))?;

        let device = builder.build(
            minor_num,
            Arc::clone(&self.sharedmem),
            Arc::clone(&self.processes),
        )?;
        devices[minor] = Some(Arc::clone(&device));
        info!(device = %device.name(), minor, "device registered");
        Ok(device)
    }

    /// Removes a device from the minor table. Open handles keep it alive until they close.
    ///
    /// # Errors
    /// Returns `KgslError::NotFound` if the device is not in the table.
    pub fn unregister_device(&self, device: &Device) -> KgslResult<()> {
        let mut devices = self.devices.lock();
        let slot = devices
            .get_mut(device.minor() as usize)
            .filter(|slot| slot.as_ref().is_some_and(|d| d.id() == device.id()))
            .ok_or_else(|| KgslError::NotFound(format!("device {}", device.name())))?;
        *slot = None;
        info!(device = %device.name(), "device unregistered");
        Ok(())
    }

    #[must_use]
    pub fn get_minor(&self, minor: u32) -> Option<Arc<Device>> {
        self.devices.lock().get(minor as usize)?.clone()
    }

    #[must_use]
    pub fn get_device(&self, id: u32) -> Option<Arc<Device>> {
        self.devices
            .lock()
            .iter()
            .flatten()
            .find(|d| d.id() == id)
            .cloned()
    }

    fn all_devices(&self) -> Vec<Arc<Device>> {
        self.devices.lock().iter().flatten().cloned().collect()
    }

    // ===========================================================================================
    // Handles & Processes
    // ===========================================================================================

    /// Opens a handle on device `minor` for process `pid`.
    ///
    /// The first handle on a device starts it. The first handle of a process creates its
    /// driver state, which every later handle of the same process shares.
    ///
    /// # Errors
    /// Returns `KgslError::NotFound` for an unknown minor, or the error from creating the
    /// process's pagetable or starting the device.
    pub fn open(self: &Arc<Self>, minor: u32, pid: u32) -> KgslResult<File> {
        let device = self.get_minor(minor).ok_or_else(|| {
            error!("no device found for minor {minor}");
            KgslError::NotFound(format!("device minor {minor}"))
        })?;

        let pagetable = if self.config.per_process_pagetable {
            pid
        } else {
            KGSL_MMU_GLOBAL_PT
        };
        let process = self.processes.get(pid, pagetable, &self.sharedmem)?;

        if let Err(e) = device.open_handle() {
            self.put_process(process, &device);
            return Err(e);
        }

        let id = FileId(self.next_file.fetch_add(1, Ordering::Relaxed));
        Ok(File::new(id, device, process, Arc::clone(self)))
    }

    /// Opens a handle on behalf of the calling process.
    ///
    /// # Errors
    /// As [`Driver::open`].
    pub fn open_current(self: &Arc<Self>, minor: u32) -> KgslResult<File> {
        // SAFETY: getpid has no preconditions and cannot fail.
        let pid = unsafe { libc::getpid() };
        let pid = u32::try_from(pid)
            .map_err(|_| KgslError::InvalidArgument(format!("pid {pid}")))?;
        self.open(minor, pid)
    }

    /// Drops a handle's reference on its process, tearing the process down after the last.
    ///
    /// `current` is the device the handle was open on, which may already be unregistered.
    pub(crate) fn put_process(&self, process: Arc<ProcessContext>, current: &Arc<Device>) {
        let Some(process) = self.processes.put(process) else {
            return;
        };
        let mut devices = self.all_devices();
        if !devices.iter().any(|d| Arc::ptr_eq(d, current)) {
            devices.push(Arc::clone(current));
        }
        // The process is unlinked, so no other thread can find it while queues are purged.
        for device in devices {
            device.cleanup_process(process.stats());
        }
        drop(process);
    }

    // ===========================================================================================
    // Power Management
    // ===========================================================================================

    /// Suspends every registered device that is running.
    ///
    /// Devices that were never started are skipped. The first failure is returned after
    /// every device has been tried.
    ///
    /// # Errors
    /// Returns the first device's suspend error.
    pub fn suspend(&self) -> KgslResult<()> {
        let mut result = Ok(());
        for device in self.all_devices() {
            if device.power_state() == PowerState::Init {
                continue;
            }
            if let Err(e) = device.suspend() {
                warn!(device = %device.name(), "suspend failed: {e}");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Resumes every suspended device.
    ///
    /// # Errors
    /// Returns the first device's resume error. Later devices are still resumed.
    pub fn resume(&self) -> KgslResult<()> {
        let mut result = Ok(());
        for device in self.all_devices() {
            if device.power_state() != PowerState::Suspend {
                continue;
            }
            if let Err(e) = device.resume() {
                warn!(device = %device.name(), "resume failed: {e}");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("config", &self.config)
            .field("processes", &self.processes.len())
            .finish_non_exhaustive()
    }
}
