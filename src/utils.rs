/// GPU MMU page size. Every region handed to the address-space mapper is a multiple of this.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_MASK: usize = !(PAGE_SIZE - 1);

#[must_use]
pub const fn is_page_aligned(val: usize) -> bool {
    val & (PAGE_SIZE - 1) == 0
}

#[must_use]
pub const fn page_align(val: usize) -> usize {
    (val + PAGE_SIZE - 1) & PAGE_MASK
}

/// Allocation order of `len` bytes (log2 of the page count, rounded up), as used by the
/// driver-wide size histogram.
#[must_use]
pub const fn page_order(len: usize) -> u32 {
    let pages = page_align(len) >> PAGE_SHIFT;
    if pages <= 1 {
        0
    } else {
        usize::BITS - (pages - 1).leading_zeros()
    }
}
