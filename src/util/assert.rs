/// Test if `addr` is a multiple of `align`
pub fn aligned_to(addr: usize, align: usize) -> bool {
    addr % align == 0
}

/// Test if `[addr, addr + len)` lies inside `[start, end)`
pub fn within(addr: usize, len: usize, start: usize, end: usize) -> bool {
    addr >= start && addr.checked_add(len).is_some_and(|last| last <= end)
}
