use crate::error::KgslResult;
use bitflags::bitflags;

/// Pagetable name shared by every process when per-process pagetables are disabled.
pub const KGSL_MMU_GLOBAL_PT: u32 = 0;

/// A GPU address-space handle.
///
/// `base` is the GPU address of the pagetable itself, which is what the hardware reports
/// and what callers pass as an address-space hint when translating addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pagetable {
    pub name: u32,
    pub base: u32,
}

bitflags! {
    /// Page protection bits for a GPU mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageProt: u32 {
        const READ = 0x0000_0001;
        const WRITE = 0x0000_0002;
    }
}

/// Where a mapping's physical pages come from, which determines how the mapper walks them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKind {
    /// Scattered pages of a host virtual range (heap-backed or anonymous-shared memory).
    HostPages,
    /// A physically contiguous region.
    Contiguous,
}

/// A page-aligned region to be entered into a GPU address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysRegion {
    pub start: usize,
    pub size: usize,
    pub kind: MapKind,
}

/// The GPU MMU. Implemented by the pagetable layer; the core only consumes it.
pub trait Mmu: Send + Sync {
    /// Look up or create the pagetable with the given name, taking a reference on it.
    fn get_pagetable(&self, name: u32) -> KgslResult<Pagetable>;

    /// Drop a reference taken by `get_pagetable`.
    fn put_pagetable(&self, pagetable: Pagetable);

    /// Map `region` into `pagetable`, returning the chosen GPU address.
    ///
    /// `region.size` is always a multiple of the page size.
    fn map(&self, pagetable: &Pagetable, region: PhysRegion, prot: PageProt) -> KgslResult<u32>;

    /// Remove `size` bytes at page-aligned `gpuaddr` from `pagetable`.
    fn unmap(&self, pagetable: &Pagetable, gpuaddr: u32, size: usize);
}
