use cubecl::prelude::*;

/// Applies rotary embedding in place to one head row held in registers.
///
/// `rotary_cos`/`rotary_sin` have shape `[max_position, rotary_dim / 2]`.
/// Interleaved layout rotates the pairs `(2i, 2i+1)`; the contiguous layout
/// rotates `(i, i + rotary_dim/2)`. Elements past `rotary_dim` pass through.
#[cube]
pub fn apply_rotary_row<E: Float>(
    row: &mut Array<f32>,
    rotary_cos: &Tensor<Line<E>>,
    rotary_sin: &Tensor<Line<E>>,
    position: u32,
    rotary_dim: u32,
    #[comptime] interleaved: bool,
) {
    let half = rotary_dim / 2;
    let base = position * half;

    for i in 0..half {
        let cos = f32::cast_from(rotary_cos[(base + i) as usize][0]);
        let sin = f32::cast_from(rotary_sin[(base + i) as usize][0]);

        if interleaved {
            let x = row[(2 * i) as usize];
            let y = row[(2 * i + 1) as usize];
            row[(2 * i) as usize] = x * cos - y * sin;
            row[(2 * i + 1) as usize] = x * sin + y * cos;
        } else {
            let x = row[i as usize];
            let y = row[(i + half) as usize];
            row[i as usize] = x * cos - y * sin;
            row[(i + half) as usize] = x * sin + y * cos;
        }
    }
}
