//! Interfaces to the hardware-facing collaborators and the request ABI.

pub mod device;
pub mod ioctl;
pub mod mmu;
pub mod timestamp;
