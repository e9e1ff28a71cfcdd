use crate::error::KgslResult;
use crate::kgsl::ioctl::IbDesc;
use crate::kgsl::timestamp::{Timestamp, TimestampType};
use std::fmt;
use std::time::Duration;

/// Device power state. Values match the `KGSL_STATE_*` constants reported to user space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PowerState {
    None = 0x0000_0000,
    Init = 0x0000_0001,
    Active = 0x0000_0002,
    Nap = 0x0000_0004,
    Sleep = 0x0000_0008,
    Suspend = 0x0000_0010,
}

impl PowerState {
    /// NAP and SLEEP are both idle states the device can be quickly woken from.
    #[must_use]
    pub const fn is_idle(self) -> bool {
        matches!(self, Self::Nap | Self::Sleep)
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "NONE",
            Self::Init => "INIT",
            Self::Active => "ACTIVE",
            Self::Nap => "NAP",
            Self::Sleep => "SLEEP",
            Self::Suspend => "SUSPEND",
        };
        f.write_str(name)
    }
}

/// Device-specific state backing an execution context.
///
/// Owned by the device layer: it is handed out by [`DeviceOps::drawctxt_create`] and must be
/// handed back to [`DeviceOps::drawctxt_destroy`]. Deliberately neither `Clone` nor `Copy`.
#[derive(Debug, PartialEq, Eq)]
pub struct DrawContext(pub u64);

/// Hardware-specific half of a device (e.g. a 3D core or a 2D core).
///
/// This is the function table the core drives. Implementations own register access, the
/// ring buffer and the command-stream encoding; the core owns policy and bookkeeping.
pub trait DeviceOps: Send + Sync {
    /// Power up and initialise the hardware. `init_ram` requests a full microcode/RAM load.
    fn start(&self, init_ram: bool) -> KgslResult<()>;

    /// Stop the hardware and release its runtime resources.
    fn stop(&self) -> KgslResult<()>;

    /// Wait up to `timeout` for the GPU to drain all submitted work.
    fn idle(&self, timeout: Duration) -> KgslResult<()>;

    /// Gate clocks/power down to `target` (NAP or SLEEP). Fails if the hardware is busy.
    fn sleep(&self, target: PowerState) -> KgslResult<()>;

    /// Bring a napping or sleeping device back to full power.
    fn wake(&self) -> KgslResult<()>;

    /// Save execution-context state ahead of a suspend.
    fn suspend_contexts(&self) -> KgslResult<()>;

    /// Restore execution-context state after a resume.
    fn resume_contexts(&self) -> KgslResult<()>;

    /// Read the command-stream timestamp of the given type.
    fn read_timestamp(&self, kind: TimestampType) -> Timestamp;

    /// Block until the retired timestamp reaches `timestamp` or `timeout` expires.
    ///
    /// Called without the device lock held.
    fn wait_timestamp(&self, timestamp: Timestamp, timeout: Duration) -> KgslResult<()>;

    /// Create the device-specific state for a new execution context.
    fn drawctxt_create(&self, flags: u32) -> KgslResult<DrawContext>;

    /// Tear down device-specific context state.
    fn drawctxt_destroy(&self, ctxt: DrawContext) -> KgslResult<()>;

    /// Submit indirect buffers on `ctxt`, returning the timestamp assigned to the submission.
    fn issue_ib_cmds(&self, ctxt: &DrawContext, ibs: &[IbDesc], flags: u32)
    -> KgslResult<Timestamp>;

    /// Fill `value` with a device-specific property.
    fn get_property(&self, prop: u32, value: &mut [u8]) -> KgslResult<()>;

    /// Hardware (major, minor) version.
    fn version(&self) -> (u32, u32);

    /// The retired-timestamp oracle.
    fn read_retired_timestamp(&self) -> Timestamp {
        self.read_timestamp(TimestampType::Retired)
    }
}
