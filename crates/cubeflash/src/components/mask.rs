use cubecl::prelude::*;

use crate::components::BlockInfo;

/// Applies ALiBi and the causal/local/key-length masks to one logit.
///
/// `row` and `col` are absolute coordinates within the attention matrix of
/// one (batch, head). Rows are aligned to the key axis, so with
/// `seq_q != seq_k` the last query row always faces the last key.
///
/// ALiBi is added unconditionally; the caller passes a slope already divided
/// by the softmax scale so the bias lives in raw-logit units. Bound checks
/// run only when `check_bounds` is set, which the kernels clear for tiles
/// proven fully interior.
#[cube]
pub fn mask_score(
    score: f32,
    row: u32,
    col: u32,
    info: &BlockInfo,
    alibi_slope: f32,
    window_size_left: i32,
    window_size_right: i32,
    check_bounds: bool,
    #[comptime] is_causal: bool,
    #[comptime] is_local: bool,
    #[comptime] has_alibi: bool,
) -> f32 {
    let col_i = i32::cast_from(col);
    // Key-aligned row index: the column this row may attend up to (causal).
    let row_aligned = i32::cast_from(row) + i32::cast_from(info.actual_seqlen_k)
        - i32::cast_from(info.actual_seqlen_q);

    let mut out = score;
    if has_alibi {
        out += alibi_slope * f32::cast_from(col_i - row_aligned);
    }

    if check_bounds {
        let mut masked = col >= info.actual_seqlen_k;
        if is_causal || is_local {
            masked = masked || col_i > row_aligned + window_size_right;
        }
        if is_local {
            masked =
                masked || (window_size_left >= 0 && col_i < row_aligned - window_size_left);
        }
        if masked {
            out = f32::min_value();
        }
    }

    out
}

/// Whether the K/V tile starting at `col0` needs per-element bound checks
/// for the query row `row`.
#[cube]
pub fn tile_needs_masking(
    row: u32,
    col0: u32,
    info: &BlockInfo,
    window_size_left: i32,
    window_size_right: i32,
    #[comptime] block_n: u32,
    #[comptime] is_causal: bool,
    #[comptime] is_local: bool,
) -> bool {
    let row_aligned = i32::cast_from(row) + i32::cast_from(info.actual_seqlen_k)
        - i32::cast_from(info.actual_seqlen_q);
    let tile_last = i32::cast_from(col0 + block_n) - 1;

    let mut needs = col0 + block_n > info.actual_seqlen_k;
    if is_causal || is_local {
        needs = needs || tile_last > row_aligned + window_size_right;
    }
    if is_local {
        needs = needs
            || (window_size_left >= 0 && i32::cast_from(col0) < row_aligned - window_size_left);
    }
    needs
}
