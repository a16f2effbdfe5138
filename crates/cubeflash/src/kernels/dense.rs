//! Dense forward kernel: one cube per (query tile, batch, head), iterating
//! every K/V tile its query tile can attend to.

use cubecl::prelude::*;
use cubecl::std::{CubeOption, CubeOptionArgs, CubeOptionExpand};

use crate::components::{
    BlockInfo, OnlineSoftmax, dropout_rand4, mask_score, tile_needs_masking,
};
use crate::definition::{FlashKernelConfig, FlashProblem, TileScheme};
use crate::kernels::{FlashParams, FlashParamsLaunch, strides_bhr};

/// Online-softmax attention over the full key range of one query tile.
///
/// Each unit owns one query row: its Q row and output accumulator stay in
/// registers across the whole K/V loop, while K and V tiles are staged
/// cooperatively through shared memory. Tiles are visited in reverse order
/// so the only iteration that needs key-bound masking is the first one.
///
/// Out-of-range rows and columns are guarded by element predicates; rows
/// whose K/V range is empty write a zero output row and the +inf LSE
/// sentinel.
#[cube(launch_unchecked)]
fn flash_fwd<E: Float>(
    q: &Tensor<Line<E>>,
    k: &Tensor<Line<E>>,
    v: &Tensor<Line<E>>,
    out: &mut Tensor<Line<E>>,
    softmax_lse: &mut Tensor<f32>,
    p_debug: &mut Tensor<Line<E>>,
    rng_state: &mut Tensor<u64>,
    alibi_slopes: CubeOption<Tensor<f32>>,
    cu_seqlens_q: CubeOption<Tensor<i32>>,
    cu_seqlens_k: CubeOption<Tensor<i32>>,
    seqused_k: CubeOption<Tensor<i32>>,
    params: FlashParams,
    #[comptime] config: FlashKernelConfig,
) {
    let q_tile: u32 = CUBE_POS_X;
    let batch: u32 = CUBE_POS_Y;
    let head: u32 = CUBE_POS_Z;
    let unit: u32 = UNIT_POS_X;
    let num_units: u32 = CUBE_DIM_X;

    let block_m = comptime!(config.block_m);
    let block_n = comptime!(config.block_n);
    let head_dim = comptime!(config.head_dim);

    // Record the RNG state before any early exit so the backward pass can
    // reproduce the dropout mask even when this block writes nothing.
    if comptime!(config.is_dropout) {
        if CUBE_POS_X == 0 && CUBE_POS_Y == 0 && CUBE_POS_Z == 0 && unit == 0 {
            rng_state[0] = params.philox_seed;
            rng_state[1] = params.philox_offset;
        }
    }

    let binfo = BlockInfo::new(
        &cu_seqlens_q,
        &cu_seqlens_k,
        &seqused_k,
        batch,
        params.seqlen_q,
        params.seqlen_k,
        0u32,
        comptime!(config.is_seqlens_k_cumulative),
    );

    if q_tile * block_m >= binfo.actual_seqlen_q {
        terminate!();
    }

    let row: u32 = q_tile * block_m + unit;
    let valid_row: bool = row < binfo.actual_seqlen_q;

    let o_base: u32 = binfo.q_offset(
        params.o_batch_stride,
        params.o_row_stride,
        batch,
        comptime!(config.varlen_q),
    ) + row * params.o_row_stride
        + head * params.o_head_stride;
    let lse_idx: u32 = (batch * params.num_heads + head) * params.seqlen_q + row;

    // K/V tile range [n_tile_min, n_tile_max) for this query tile.
    let seqlen_shift: i32 =
        i32::cast_from(binfo.actual_seqlen_k) - i32::cast_from(binfo.actual_seqlen_q);
    let mut n_tile_max: u32 = (binfo.actual_seqlen_k + block_n - 1) / block_n;
    if comptime!(config.is_causal || config.is_local) {
        let limit: i32 =
            i32::cast_from((q_tile + 1) * block_m) + seqlen_shift + params.window_size_right;
        let limit_tiles: i32 = (limit + i32::cast_from(block_n) - 1) / i32::cast_from(block_n);
        let clamped: i32 = select(limit_tiles > 0i32, limit_tiles, 0i32);
        if u32::cast_from(clamped) < n_tile_max {
            n_tile_max = u32::cast_from(clamped);
        }
    }
    let mut n_tile_min: u32 = 0u32;
    if comptime!(config.is_local) {
        if params.window_size_left >= 0 {
            let low: i32 =
                i32::cast_from(q_tile * block_m) + seqlen_shift - params.window_size_left;
            if low > 0 {
                n_tile_min = u32::cast_from(low) / block_n;
            }
        }
    }

    // Nothing to attend to: zero output, sentinel LSE.
    if n_tile_max <= n_tile_min {
        if valid_row {
            for d in 0..head_dim {
                out[(o_base + d) as usize] = Line::cast_from(0.0f32);
            }
            softmax_lse[lse_idx as usize] = f32::max_value();
        }
        terminate!();
    }

    let mut alibi_slope: f32 = 0.0f32;
    if comptime!(config.has_alibi) {
        match &alibi_slopes {
            CubeOption::Some(slopes) => {
                let idx: u32 = batch * params.alibi_slopes_batch_stride + head;
                alibi_slope = slopes[idx as usize] / params.scale_softmax;
            }
            CubeOption::None => {}
        }
    }

    // This unit's Q row, kept in registers for the whole loop.
    let q_base: u32 = binfo.q_offset(
        params.q_batch_stride,
        params.q_row_stride,
        batch,
        comptime!(config.varlen_q),
    ) + row * params.q_row_stride
        + head * params.q_head_stride;
    let mut q_reg = Array::<f32>::new(head_dim as usize);
    for d in 0..head_dim {
        let mut val: f32 = 0.0f32;
        if valid_row {
            val = f32::cast_from(q[(q_base + d) as usize][0]);
        }
        q_reg[d as usize] = val;
    }

    let kv_head: u32 = head / params.h_h_k_ratio;
    let k_base: u32 = binfo.k_offset(
        params.k_batch_stride,
        params.k_row_stride,
        batch,
        comptime!(config.varlen_k),
    ) + kv_head * params.k_head_stride;
    let v_base: u32 = binfo.k_offset(
        params.v_batch_stride,
        params.v_row_stride,
        batch,
        comptime!(config.varlen_k),
    ) + kv_head * params.v_head_stride;

    let mut acc = Array::<f32>::new(head_dim as usize);
    for d in 0..head_dim {
        acc[d as usize] = 0.0f32;
    }
    let mut state = OnlineSoftmax::init();
    let mut scores = Array::<f32>::new(block_n as usize);

    let mut smem_k = SharedMemory::<f32>::new(comptime!((config.block_n * config.head_dim) as usize));
    let mut smem_v = SharedMemory::<f32>::new(comptime!((config.block_n * config.head_dim) as usize));

    let mut n_tile: u32 = n_tile_max;
    while n_tile > n_tile_min {
        n_tile -= 1;
        let col0: u32 = n_tile * block_n;

        // Stage the K and V tiles; out-of-range rows load zero.
        let mut stage_row: u32 = unit;
        while stage_row < block_n {
            let kv_row: u32 = col0 + stage_row;
            if kv_row < binfo.actual_seqlen_k {
                let k_off: u32 = k_base + kv_row * params.k_row_stride;
                let v_off: u32 = v_base + kv_row * params.v_row_stride;
                for d in 0..head_dim {
                    smem_k[(stage_row * head_dim + d) as usize] =
                        f32::cast_from(k[(k_off + d) as usize][0]);
                    smem_v[(stage_row * head_dim + d) as usize] =
                        f32::cast_from(v[(v_off + d) as usize][0]);
                }
            } else {
                for d in 0..head_dim {
                    smem_k[(stage_row * head_dim + d) as usize] = 0.0f32;
                    smem_v[(stage_row * head_dim + d) as usize] = 0.0f32;
                }
            }
            stage_row += num_units;
        }
        sync_cube();

        if valid_row {
            let needs_mask: bool = tile_needs_masking(
                row,
                col0,
                &binfo,
                params.window_size_left,
                params.window_size_right,
                block_n,
                comptime!(config.is_causal),
                comptime!(config.is_local),
            );

            // S = Q·K^T for this row, masked in place.
            let mut tile_max: f32 = f32::min_value();
            for jj in 0..block_n {
                let mut dot: f32 = 0.0f32;
                for d in 0..head_dim {
                    dot += q_reg[d as usize] * smem_k[(jj * head_dim + d) as usize];
                }
                let score: f32 = mask_score(
                    dot,
                    row,
                    col0 + jj,
                    &binfo,
                    alibi_slope,
                    params.window_size_left,
                    params.window_size_right,
                    needs_mask,
                    comptime!(config.is_causal),
                    comptime!(config.is_local),
                    comptime!(config.has_alibi),
                );
                scores[jj as usize] = score;
                tile_max = f32::max(tile_max, score);
            }

            // Online-softmax rescale; a fully masked tile is a no-op.
            if tile_max != f32::min_value() {
                let alpha: f32 = state.rescale(tile_max, params.scale_softmax_log2);
                for d in 0..head_dim {
                    acc[d as usize] = acc[d as usize] * alpha;
                }
                for jj in 0..block_n {
                    let p: f32 = state.probability(scores[jj as usize], params.scale_softmax_log2);
                    state.accumulate(p);
                    scores[jj as usize] = p;
                }
            } else {
                for jj in 0..block_n {
                    scores[jj as usize] = 0.0f32;
                }
            }

            if comptime!(config.is_dropout) {
                // The debug copy keeps dropped entries with a flipped sign;
                // the compute copy zeroes them.
                let bh: u32 = batch * params.num_heads + head;
                let p_row_base: u32 = (bh * params.seqlen_q_rounded + row) * params.seqlen_k_rounded;
                for group in 0..block_n / 4 {
                    let col: u32 = col0 + group * 4;
                    let rand = dropout_rand4(
                        params.philox_seed,
                        params.philox_offset,
                        bh,
                        row,
                        col / 4,
                    );
                    for e in 0..4u32 {
                        let jj: u32 = group * 4 + e;
                        let p: f32 = scores[jj as usize];
                        let keep: bool = (rand[e as usize] & 0xFFu32) <= params.p_keep_in_u8;
                        if comptime!(config.return_softmax) {
                            let encoded: f32 = select(keep, p, -p);
                            p_debug[(p_row_base + col + e) as usize] = Line::cast_from(encoded);
                        }
                        scores[jj as usize] = select(keep, p, 0.0f32);
                    }
                }
            } else if comptime!(config.return_softmax) {
                let bh: u32 = batch * params.num_heads + head;
                let p_row_base: u32 = (bh * params.seqlen_q_rounded + row) * params.seqlen_k_rounded;
                for jj in 0..block_n {
                    p_debug[(p_row_base + col0 + jj) as usize] =
                        Line::cast_from(scores[jj as usize]);
                }
            }

            // O += P·V from the staged value tile.
            for jj in 0..block_n {
                let p: f32 = scores[jj as usize];
                if p != 0.0f32 {
                    for d in 0..head_dim {
                        acc[d as usize] += p * smem_v[(jj * head_dim + d) as usize];
                    }
                }
            }
        }
        sync_cube();
    }

    if valid_row {
        let o_scale: f32 = state.normalizer(params.rp_dropout);
        for d in 0..head_dim {
            out[(o_base + d) as usize] = Line::cast_from(acc[d as usize] * o_scale);
        }
        softmax_lse[lse_idx as usize] = state.lse(params.scale_softmax, false);
    }
}

/// Launches the dense forward kernel.
///
/// `out` has the shape of `q`; `softmax_lse` is `[batch, num_heads, seq_q]`
/// f32. `p_debug` must be `[batch, num_heads, seq_q_rounded, seq_k_rounded]`
/// when `return_softmax` is requested, `rng_state` two u64 when dropout is
/// active. `cu_seqlens_q`/`cu_seqlens_k` switch Q and K/V to the packed
/// variable-length layout.
pub fn launch_flash_fwd<R: Runtime, E: Float>(
    client: &ComputeClient<R>,
    q: &TensorHandleRef<R>,
    k: &TensorHandleRef<R>,
    v: &TensorHandleRef<R>,
    out: &TensorHandleRef<R>,
    softmax_lse: &TensorHandleRef<R>,
    p_debug: Option<&TensorHandleRef<R>>,
    rng_state: Option<&TensorHandleRef<R>>,
    alibi_slopes: Option<&TensorHandleRef<R>>,
    cu_seqlens_q: Option<&TensorHandleRef<R>>,
    cu_seqlens_k: Option<&TensorHandleRef<R>>,
    seqused_k: Option<&TensorHandleRef<R>>,
    problem: &FlashProblem,
    scheme: TileScheme,
) -> Result<(), LaunchError> {
    let dims = &problem.dims;
    let num_q_tiles = (dims.seq_q as u32).div_ceil(scheme.block_m);
    let cube_count = CubeCount::new_3d(num_q_tiles, dims.batch as u32, dims.num_heads as u32);
    let cube_dim = CubeDim::new_1d(scheme.block_m);

    let config = FlashKernelConfig {
        block_m: scheme.block_m,
        block_n: scheme.block_n,
        head_dim: dims.head_dim as u32,
        is_causal: problem.options.mask.is_causal(),
        is_local: problem.options.mask.is_local(),
        has_alibi: alibi_slopes.is_some(),
        is_dropout: problem.options.dropout_p > 0.0,
        return_softmax: problem.options.return_softmax,
        varlen_q: cu_seqlens_q.is_some(),
        varlen_k: cu_seqlens_k.is_some(),
        is_seqlens_k_cumulative: true,
        append_kv: false,
        rotary_interleaved: false,
        is_split: false,
    };

    // Placeholders keep unused outputs bound without touching them.
    let dummy_e = client.empty(core::mem::size_of::<E>());
    let dummy_u64 = client.empty(2 * core::mem::size_of::<u64>());
    let unit_shape = [1];
    let unit_strides = [1];

    let dummy_e_handle = unsafe {
        TensorHandleRef::<R>::from_raw_parts(
            &dummy_e,
            &unit_strides,
            &unit_shape,
            core::mem::size_of::<E>(),
        )
    };
    let p_debug_ref = match p_debug {
        Some(t) => t.as_tensor_arg(1),
        None => dummy_e_handle.as_tensor_arg(1),
    };
    let dummy_u64_handle = unsafe {
        TensorHandleRef::<R>::from_raw_parts(
            &dummy_u64,
            &unit_strides,
            &unit_shape,
            core::mem::size_of::<u64>(),
        )
    };
    let rng_state_ref = match rng_state {
        Some(t) => t.as_tensor_arg(1),
        None => dummy_u64_handle.as_tensor_arg(1),
    };

    unsafe {
        flash_fwd::launch_unchecked::<E, R>(
            client,
            cube_count,
            cube_dim,
            q.as_tensor_arg(1),
            k.as_tensor_arg(1),
            v.as_tensor_arg(1),
            out.as_tensor_arg(1),
            softmax_lse.as_tensor_arg(1),
            p_debug_ref,
            rng_state_ref,
            match alibi_slopes {
                Some(t) => CubeOptionArgs::Some(t.as_tensor_arg(1)),
                None => CubeOptionArgs::None,
            },
            match cu_seqlens_q {
                Some(t) => CubeOptionArgs::Some(t.as_tensor_arg(1)),
                None => CubeOptionArgs::None,
            },
            match cu_seqlens_k {
                Some(t) => CubeOptionArgs::Some(t.as_tensor_arg(1)),
                None => CubeOptionArgs::None,
            },
            match seqused_k {
                Some(t) => CubeOptionArgs::Some(t.as_tensor_arg(1)),
                None => CubeOptionArgs::None,
            },
            flash_params_args(problem, q, out, alibi_slopes, strides_bhr(k), strides_bhr(v)),
            config,
        )
    }
}

pub(crate) fn flash_params_args<'a, R: Runtime>(
    problem: &FlashProblem,
    q: &TensorHandleRef<R>,
    out: &TensorHandleRef<R>,
    alibi_slopes: Option<&TensorHandleRef<R>>,
    k_strides: (u32, u32, u32),
    v_strides: (u32, u32, u32),
) -> FlashParamsLaunch<'a, R> {
    let dims = &problem.dims;
    let (q_bs, q_hs, q_rs) = strides_bhr(q);
    let (k_bs, k_hs, k_rs) = k_strides;
    let (v_bs, v_hs, v_rs) = v_strides;
    let (o_bs, o_hs, o_rs) = strides_bhr(out);
    let (window_left, window_right) = problem.options.mask.windows();
    let alibi_batch_stride = match alibi_slopes {
        Some(t) if t.shape.len() == 2 => t.strides[0] as u32,
        _ => 0,
    };

    FlashParamsLaunch::new(
        ScalarArg::new(dims.seq_q as u32),
        ScalarArg::new(dims.seq_k as u32),
        ScalarArg::new(dims.num_heads as u32),
        ScalarArg::new(dims.h_h_k_ratio() as u32),
        ScalarArg::new(q_bs),
        ScalarArg::new(q_hs),
        ScalarArg::new(q_rs),
        ScalarArg::new(k_bs),
        ScalarArg::new(k_hs),
        ScalarArg::new(k_rs),
        ScalarArg::new(v_bs),
        ScalarArg::new(v_hs),
        ScalarArg::new(v_rs),
        ScalarArg::new(o_bs),
        ScalarArg::new(o_hs),
        ScalarArg::new(o_rs),
        ScalarArg::new(problem.options.softmax_scale),
        ScalarArg::new(problem.scale_softmax_log2()),
        ScalarArg::new(window_left),
        ScalarArg::new(window_right),
        ScalarArg::new(problem.p_keep_in_u8()),
        ScalarArg::new(problem.rp_dropout()),
        ScalarArg::new(problem.options.philox_seed),
        ScalarArg::new(problem.options.philox_offset),
        ScalarArg::new(problem.seq_q_rounded() as u32),
        ScalarArg::new(problem.seq_k_rounded() as u32),
        ScalarArg::new(alibi_batch_stride),
    )
}
