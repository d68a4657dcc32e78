//! Utility functions.

/// Aligns an address or size up to the next multiple of `align`.
/// `align` must be a power of two; zero is treated as one.
pub fn align_up(addr: u64, align: u64) -> u64 {
    if align <= 1 {
        return addr;
    }
    debug_assert!(align.is_power_of_two());
    (addr + align - 1) & !(align - 1)
}

/// Whether `value` fits in a two's complement integer of `bits` bits.
pub fn fits_signed(value: i64, bits: u32) -> bool {
    let min = -(1i64 << (bits - 1));
    let max = (1i64 << (bits - 1)) - 1;
    (min..=max).contains(&value)
}

/// Distance between two addresses, regardless of order.
pub fn distance(a: u64, b: u64) -> u64 {
    a.abs_diff(b)
}
