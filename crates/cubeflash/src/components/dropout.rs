use cubecl::prelude::*;

/// Philox-4x32-10 round keys and multipliers.
pub const PHILOX_W32_0: u32 = 0x9E37_79B9;
pub const PHILOX_W32_1: u32 = 0xBB67_AE85;
pub const PHILOX_M4X32_0: u32 = 0xD251_1F53;
pub const PHILOX_M4X32_1: u32 = 0xCD9E_8D57;

/// 64-bit product of two u32, returned as `[lo, hi]`.
#[cube]
fn mul_hi_lo(a: u32, b: u32) -> Line<u32> {
    let wide = u64::cast_from(a) * u64::cast_from(b);
    let mut out = Line::<u32>::empty(2usize);
    out[0] = u32::cast_from(wide & 0xFFFF_FFFFu64);
    out[1] = u32::cast_from(wide >> 32u64);
    out
}

/// Philox-4x32 with 10 rounds: four u32 draws from a 128-bit counter and a
/// 64-bit key.
#[cube]
pub fn philox_4x32(c0: u32, c1: u32, c2: u32, c3: u32, seed: u64) -> Line<u32> {
    let mut key0 = u32::cast_from(seed & 0xFFFF_FFFFu64);
    let mut key1 = u32::cast_from(seed >> 32u64);

    let mut x0 = c0;
    let mut x1 = c1;
    let mut x2 = c2;
    let mut x3 = c3;

    for _ in 0..10u32 {
        let p0 = mul_hi_lo(PHILOX_M4X32_0, x0);
        let p1 = mul_hi_lo(PHILOX_M4X32_1, x2);

        let y0 = p1[1] ^ x1 ^ key0;
        let y1 = p1[0];
        let y2 = p0[1] ^ x3 ^ key1;
        let y3 = p0[0];

        x0 = y0;
        x1 = y1;
        x2 = y2;
        x3 = y3;

        key0 += PHILOX_W32_0;
        key1 += PHILOX_W32_1;
    }

    let mut out = Line::<u32>::empty(4usize);
    out[0] = x0;
    out[1] = x1;
    out[2] = x2;
    out[3] = x3;
    out
}

/// Four RNG draws covering key columns `4·col4 .. 4·col4 + 4` of one
/// attention row.
///
/// The counter is built from absolute coordinates only: (batch, head)
/// folded into `bh`, the absolute query row, and the column group. The
/// dropout pattern is therefore a pure function of (seed, offset, b, h,
/// row, col), invariant to tile shape, split count, warp count and
/// traversal order.
#[cube]
pub fn dropout_rand4(seed: u64, offset: u64, bh: u32, row: u32, col4: u32) -> Line<u32> {
    let counter = offset + u64::cast_from(col4);
    philox_4x32(
        u32::cast_from(counter & 0xFFFF_FFFFu64),
        u32::cast_from(counter >> 32u64),
        row,
        bh,
        seed,
    )
}
