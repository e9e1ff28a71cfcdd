//! Control plane of a kernel-mode graphics driver for embedded GPU cores.
//!
//! The [`driver`] layer owns policy and bookkeeping: which process owns which GPU mapping,
//! when a freed buffer may really be released, which execution contexts exist and what
//! power state the hardware is in. The [`kgsl`] layer defines the collaborators the core
//! drives (the hardware function table, the GPU MMU) and the request ABI.

pub mod driver;
pub mod error;
pub mod kgsl;
pub mod utils;

pub use driver::{Driver, DriverConfig, File};
pub use driver::device::{Device, DeviceBuilder, DeviceConfig};
pub use error::{KgslError, KgslResult};
