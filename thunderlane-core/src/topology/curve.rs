//! Space-filling curve and cell hashing used by the non-block strategies.

use super::grid::{CellCoord, GridShape};

/// Bits per axis needed to cover the longest side of `shape`.
pub(crate) fn hilbert_order(shape: &GridShape) -> u32 {
    let longest = shape.extents().into_iter().max().unwrap_or(1).max(2);
    u32::BITS - (longest - 1).leading_zeros()
}

/// Position of `coord` along a 3D Hilbert curve of `bits` bits per axis.
///
/// Skilling's transpose form: undo the excess work, Gray-encode, then
/// interleave the transposed bits with the x axis most significant.
pub(crate) fn hilbert_index(coord: CellCoord, bits: u32) -> u64 {
    let mut x = [coord.x, coord.y, coord.z];
    let m = 1_u32 << (bits - 1);

    let mut q = m;
    while q > 1 {
        let p = q - 1;
        for i in 0..3 {
            if x[i] & q != 0 {
                x[0] ^= p;
            } else {
                let t = (x[0] ^ x[i]) & p;
                x[0] ^= t;
                x[i] ^= t;
            }
        }
        q >>= 1;
    }

    for i in 1..3 {
        x[i] ^= x[i - 1];
    }
    let mut t = 0;
    let mut q = m;
    while q > 1 {
        if x[2] & q != 0 {
            t ^= q - 1;
        }
        q >>= 1;
    }
    for axis in &mut x {
        *axis ^= t;
    }

    let mut index = 0_u64;
    for bit in (0..bits).rev() {
        for axis in x {
            index = (index << 1) | u64::from((axis >> bit) & 1);
        }
    }
    index
}

/// Stable bucket for a cell, FNV-1a over the coordinate bytes with a high-bit fold.
pub(crate) fn cell_bucket(coord: CellCoord, buckets: u32) -> u32 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x1000_0000_01b3;
    let hash = [coord.x, coord.y, coord.z]
        .iter()
        .flat_map(|axis| axis.to_le_bytes())
        .fold(FNV_OFFSET, |hash, byte| {
            (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
        });
    let hash = hash ^ (hash >> 29);
    (hash % u64::from(buckets.max(1))) as u32
}
