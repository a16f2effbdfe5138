//! Combine kernel: merges the per-split partial outputs and LSEs of the
//! split-KV kernel into the final O and LSE.

use cubecl::prelude::*;

use crate::definition::{CombineConfig, FlashProblem, MAX_SPLITS};
use crate::kernels::{CombineParams, CombineParamsLaunch, strides_bhr};

/// Merges `rows_per_cube` output rows across all splits.
///
/// Per row: `M = max_s LSE_s`, `w_s = exp(LSE_s - M)`, final
/// `LSE = M + ln Σ w_s`, and `O = Σ (w_s / Σ w) · O_s`. The split weights
/// are staged through shared memory between the two phases. Rows whose
/// every split wrote the -inf sentinel (no contribution anywhere) produce
/// `O = 0` and the +inf LSE sentinel instead of NaN.
#[cube(launch_unchecked)]
fn flash_fwd_combine<E: Float>(
    oaccum: &Tensor<f32>,
    lseaccum: &Tensor<f32>,
    out: &mut Tensor<Line<E>>,
    softmax_lse: &mut Tensor<f32>,
    params: CombineParams,
    #[comptime] config: CombineConfig,
) {
    let unit: u32 = UNIT_POS_X;
    let num_units: u32 = CUBE_DIM_X;
    let rows_per_cube = comptime!(config.rows_per_cube);
    let head_dim = comptime!(config.head_dim);

    let row0: u32 = CUBE_POS_X * rows_per_cube;

    // exp(LSE_s - LSE_final) per (split, local row).
    let mut scales = SharedMemory::<f32>::new(comptime!(
        (config.max_splits * config.rows_per_cube) as usize
    ));

    // Phase 1: per-row log-sum-exp over the split dimension.
    let mut local: u32 = unit;
    while local < rows_per_cube {
        let row: u32 = row0 + local;
        if row < params.total_rows {
            let mut lse_max: f32 = f32::min_value();
            let mut s: u32 = 0u32;
            while s < params.num_splits {
                let lse_s: f32 = lseaccum[(s * params.total_rows + row) as usize];
                lse_max = f32::max(lse_max, lse_s);
                s += 1u32;
            }
            // All splits empty: keep the exponents finite, the sum comes
            // out zero and the sentinel is written below.
            let safe_max: f32 = select(lse_max == f32::min_value(), 0.0f32, lse_max);

            let mut sum: f32 = 0.0f32;
            s = 0u32;
            while s < params.num_splits {
                let lse_s: f32 = lseaccum[(s * params.total_rows + row) as usize];
                sum += (lse_s - safe_max).exp();
                s += 1u32;
            }

            let empty: bool = sum == 0.0f32 || sum != sum;
            let lse_final: f32 = select(empty, f32::max_value(), f32::ln(sum) + safe_max);
            softmax_lse[row as usize] = lse_final;

            s = 0u32;
            while s < params.num_splits {
                let lse_s: f32 = lseaccum[(s * params.total_rows + row) as usize];
                let weight: f32 = select(empty, 0.0f32, (lse_s - lse_final).exp());
                scales[(s * rows_per_cube + local) as usize] = weight;
                s += 1u32;
            }
        }
        local += num_units;
    }
    sync_cube();

    // Phase 2: weighted accumulation of the partial outputs, streamed along
    // the head dimension.
    let mut flat: u32 = unit;
    while flat < rows_per_cube * head_dim {
        let local_row: u32 = flat / head_dim;
        let d: u32 = flat % head_dim;
        let row: u32 = row0 + local_row;
        if row < params.total_rows {
            let mut acc: f32 = 0.0f32;
            let mut s: u32 = 0u32;
            while s < params.num_splits {
                let weight: f32 = scales[(s * rows_per_cube + local_row) as usize];
                if weight != 0.0f32 {
                    acc += weight
                        * oaccum[((s * params.total_rows + row) * params.head_dim_rounded + d)
                            as usize];
                }
                s += 1u32;
            }

            // Unflatten (batch, head, query row) for the strided store.
            let batch: u32 = row / (params.num_heads * params.seqlen_q);
            let rem: u32 = row - batch * params.num_heads * params.seqlen_q;
            let head: u32 = rem / params.seqlen_q;
            let q_row: u32 = rem - head * params.seqlen_q;
            let o_idx: u32 = batch * params.o_batch_stride
                + head * params.o_head_stride
                + q_row * params.o_row_stride
                + d;
            out[o_idx as usize] = Line::cast_from(acc);
        }
        flat += num_units;
    }
}

/// Launches the combine kernel over the accumulators written by the
/// split-KV kernel.
pub fn launch_flash_fwd_combine<R: Runtime, E: Float>(
    client: &ComputeClient<R>,
    oaccum: &TensorHandleRef<R>,
    lseaccum: &TensorHandleRef<R>,
    out: &TensorHandleRef<R>,
    softmax_lse: &TensorHandleRef<R>,
    num_splits: usize,
    problem: &FlashProblem,
) -> Result<(), LaunchError> {
    assert!(num_splits <= MAX_SPLITS);
    let dims = &problem.dims;
    let total_rows = dims.batch * dims.num_heads * dims.seq_q;

    let config = CombineConfig::for_head_dim(dims.head_dim);
    let cube_count = CubeCount::new_1d((total_rows as u32).div_ceil(config.rows_per_cube));
    let cube_dim = CubeDim::new_1d(crate::definition::COMBINE_CUBE_DIM);

    let (o_bs, o_hs, o_rs) = strides_bhr(out);
    let params = CombineParamsLaunch::new(
        ScalarArg::new(total_rows as u32),
        ScalarArg::new(dims.seq_q as u32),
        ScalarArg::new(dims.num_heads as u32),
        ScalarArg::new(num_splits as u32),
        ScalarArg::new(problem.head_dim_rounded() as u32),
        ScalarArg::new(o_bs),
        ScalarArg::new(o_hs),
        ScalarArg::new(o_rs),
    );

    unsafe {
        flash_fwd_combine::launch_unchecked::<E, R>(
            client,
            cube_count,
            cube_dim,
            oaccum.as_tensor_arg(1),
            lseaccum.as_tensor_arg(1),
            out.as_tensor_arg(1),
            softmax_lse.as_tensor_arg(1),
            params,
            config,
        )
    }
}
