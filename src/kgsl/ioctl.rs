// ===============================================================================================
// Constants and Versioning
// ===============================================================================================

pub const KGSL_VERSION_MAJOR: u32 = 1;
pub const KGSL_VERSION_MINOR: u32 = 1;

/// Property type answered by the core itself; all others go to the device layer.
pub const KGSL_PROP_VERSION: u32 = 0x0000_0008;
/// Current power state, answered by the core.
pub const KGSL_PROP_PWRSTATE: u32 = 0x0000_0010;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Version {
    pub drv_major: u32,
    pub drv_minor: u32,
    pub dev_major: u32,
    pub dev_minor: u32,
}

// ===============================================================================================
// Timestamps & Submission
// ===============================================================================================

/// Wait forever. The core substitutes its configured default timeout.
pub const KGSL_TIMEOUT_INFINITE: u32 = u32::MAX;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct WaitTimestampArgs {
    pub timestamp: u32,
    /// Milliseconds.
    pub timeout: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct ReadTimestampArgs {
    pub type_: u32,
    pub timestamp: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct FreeMemOnTimestampArgs {
    pub gpuaddr: u32,
    pub type_: u32,
    pub timestamp: u32,
}

/// One indirect buffer of a command submission.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct IbDesc {
    pub gpuaddr: u32,
    pub hostptr: u32,
    pub sizedwords: u32,
    pub ctrl: u32,
}

impl IbDesc {
    #[must_use]
    pub const fn size_bytes(&self) -> usize {
        self.sizedwords as usize * std::mem::size_of::<u32>()
    }
}

// ===============================================================================================
// Execution Contexts
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct DrawctxtCreateArgs {
    pub flags: u32,
    pub drawctxt_id: u32,
}

// ===============================================================================================
// Memory Management
// ===============================================================================================

pub const KGSL_USER_MEM_TYPE_PMEM: u32 = 0x0000_0000;
pub const KGSL_USER_MEM_TYPE_ASHMEM: u32 = 0x0000_0001;
pub const KGSL_USER_MEM_TYPE_ADDR: u32 = 0x0000_0002;

/// The GPU may only read the mapping.
pub const KGSL_MEMFLAGS_GPUREADONLY: u32 = 0x0100_0000;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct MapUserMemArgs {
    pub fd: i32,
    /// Output.
    pub gpuaddr: u32,
    /// Zero means "the whole source region".
    pub len: u32,
    pub offset: u32,
    pub hostptr: usize,
    pub memtype: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct SharedmemFromVmallocArgs {
    /// Output.
    pub gpuaddr: u32,
    pub hostptr: usize,
    pub flags: u32,
}
