//! Helpers for handing plain-old-data to GPU buffers.

use bytemuck::Pod;

pub fn as_byte_slice<T: Pod>(t: &T) -> &[u8] {
    bytemuck::bytes_of(t)
}

pub fn slice_as_bytes<T: Pod>(t: &[T]) -> &[u8] {
    bytemuck::cast_slice(t)
}

pub fn into_byte_vec<T: Pod>(v: Vec<T>) -> Vec<u8> {
    bytemuck::cast_slice(&v).to_vec()
}

/// Round `x` up to a multiple of `align`, which must be a power of two.
#[inline]
pub fn align_up(x: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (x + align - 1) & !(align - 1)
}

#[inline]
pub fn align_up_usize(x: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (x + align - 1) & !(align - 1)
}

#[test]
fn test_align_up() {
    assert_eq!(align_up(0, 256), 0);
    assert_eq!(align_up(1, 256), 256);
    assert_eq!(align_up(256, 256), 256);
    assert_eq!(align_up_usize(257, 256), 512);
}
