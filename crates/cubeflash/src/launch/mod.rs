mod heuristic;

pub use heuristic::*;

use cubecl::prelude::*;

use crate::definition::{FlashProblem, FlashSetupError, TileScheme};
use crate::kernels::{
    KvCacheArgs, launch_flash_fwd, launch_flash_fwd_combine, launch_flash_fwd_splitkv,
};

/// How the forward pass is scheduled.
#[derive(Debug, Clone)]
pub enum Strategy {
    /// Pick dense or split-KV from the occupancy heuristic.
    Auto,
    /// Always one pass over the whole key range per query tile.
    Dense,
    /// Partition the key range; 0 asks the heuristic for a count.
    SplitKv { num_splits: usize },
}

/// Optional tensors of the dense path.
pub struct FlashAux<'a, R: Runtime> {
    /// `[batch, num_heads]` or `[num_heads]` f32 ALiBi slopes.
    pub alibi_slopes: Option<&'a TensorHandleRef<'a, R>>,
    /// Cumulative query row offsets, `[batch + 1]` i32 (packed batches).
    pub cu_seqlens_q: Option<&'a TensorHandleRef<'a, R>>,
    /// Cumulative key row offsets, `[batch + 1]` i32 (packed batches).
    pub cu_seqlens_k: Option<&'a TensorHandleRef<'a, R>>,
    /// Per-batch override of the used key length, `[batch]` i32.
    pub seqused_k: Option<&'a TensorHandleRef<'a, R>>,
    /// Post-dropout probabilities, `[batch, num_heads, seq_q_rounded,
    /// seq_k_rounded]`; dropped entries carry a flipped sign.
    pub p_debug: Option<&'a TensorHandleRef<'a, R>>,
    /// Two u64 recording (seed, offset) for reproducibility.
    pub rng_state: Option<&'a TensorHandleRef<'a, R>>,
}

impl<R: Runtime> Default for FlashAux<'_, R> {
    fn default() -> Self {
        Self {
            alibi_slopes: None,
            cu_seqlens_q: None,
            cu_seqlens_k: None,
            seqused_k: None,
            p_debug: None,
            rng_state: None,
        }
    }
}

/// Runs the forward pass: dense, or split-KV plus combine.
///
/// All tensors are externally allocated except the fp32 partial buffers of
/// the split path, which live only between the two kernels. `cache` routes
/// the call through the split-KV kernel (KV append, rotary, paged KV);
/// without it the strategy decides, and dropout, the probability debug
/// buffer and packed batches force the dense kernel.
pub fn launch<R: Runtime, E: Float>(
    strategy: Strategy,
    client: &ComputeClient<R>,
    q: &TensorHandleRef<R>,
    k: &TensorHandleRef<R>,
    v: &TensorHandleRef<R>,
    out: &TensorHandleRef<R>,
    softmax_lse: &TensorHandleRef<R>,
    aux: &FlashAux<'_, R>,
    cache: Option<&KvCacheArgs<'_, R>>,
    problem: &FlashProblem,
    device: &DeviceSettings,
) -> Result<(), FlashSetupError> {
    problem.validate()?;
    validate_handles(q, k, v, out, aux, cache, problem)?;

    let dims = &problem.dims;
    let scheme = TileScheme::for_head_dim(dims.head_dim);
    let num_q_tiles = dims.seq_q.div_ceil(scheme.block_m as usize);
    let num_n_tiles = dims.seq_k.div_ceil(scheme.block_n as usize);
    let batch_nheads_mblocks = dims.batch * dims.num_heads * num_q_tiles;

    let dense_only = problem.options.dropout_p > 0.0
        || problem.options.return_softmax
        || aux.cu_seqlens_q.is_some()
        || aux.cu_seqlens_k.is_some();

    let num_splits = match (&strategy, cache) {
        _ if dense_only => {
            if cache.is_some() {
                return Err(FlashSetupError::InvalidProblem(
                    "dropout, return_softmax and packed batches are dense-only and \
                     incompatible with a KV cache"
                        .to_string(),
                ));
            }
            0 // dense kernel
        }
        (Strategy::Dense, None) => 0,
        (Strategy::Dense, Some(_)) => 1,
        (Strategy::SplitKv { num_splits }, _) => {
            resolve_num_splits(*num_splits, batch_nheads_mblocks, num_n_tiles, device)
        }
        (Strategy::Auto, Some(_)) => {
            resolve_num_splits(0, batch_nheads_mblocks, num_n_tiles, device)
        }
        (Strategy::Auto, None) => {
            let splits = resolve_num_splits(0, batch_nheads_mblocks, num_n_tiles, device);
            if splits > 1 { splits } else { 0 }
        }
    };

    if num_splits == 0 {
        return launch_flash_fwd::<R, E>(
            client,
            q,
            k,
            v,
            out,
            softmax_lse,
            aux.p_debug,
            aux.rng_state,
            aux.alibi_slopes,
            aux.cu_seqlens_q,
            aux.cu_seqlens_k,
            aux.seqused_k,
            problem,
            scheme,
        )
        .map_err(FlashSetupError::Execution);
    }

    let default_cache = KvCacheArgs::default();
    let cache = cache.unwrap_or(&default_cache);

    if num_splits == 1 {
        return launch_flash_fwd_splitkv::<R, E>(
            client,
            q,
            k,
            v,
            out,
            softmax_lse,
            None,
            None,
            aux.alibi_slopes,
            cache,
            1,
            problem,
            scheme,
        )
        .map_err(FlashSetupError::Execution);
    }

    // Partial buffers, consumed exactly once by the combine kernel.
    let d_rounded = problem.head_dim_rounded();
    let accum_rows = num_splits * dims.batch * dims.num_heads * dims.seq_q;
    let oaccum_shape = [
        num_splits,
        dims.batch,
        dims.num_heads,
        dims.seq_q,
        d_rounded,
    ];
    let oaccum_strides = contiguous_strides(&oaccum_shape);
    let lseaccum_shape = [num_splits, dims.batch, dims.num_heads, dims.seq_q];
    let lseaccum_strides = contiguous_strides(&lseaccum_shape);
    let oaccum_handle = client.empty(accum_rows * d_rounded * core::mem::size_of::<f32>());
    let lseaccum_handle = client.empty(accum_rows * core::mem::size_of::<f32>());
    let oaccum = unsafe {
        TensorHandleRef::<R>::from_raw_parts(
            &oaccum_handle,
            &oaccum_strides,
            &oaccum_shape,
            core::mem::size_of::<f32>(),
        )
    };
    let lseaccum = unsafe {
        TensorHandleRef::<R>::from_raw_parts(
            &lseaccum_handle,
            &lseaccum_strides,
            &lseaccum_shape,
            core::mem::size_of::<f32>(),
        )
    };

    launch_flash_fwd_splitkv::<R, E>(
        client,
        q,
        k,
        v,
        out,
        softmax_lse,
        Some(&oaccum),
        Some(&lseaccum),
        aux.alibi_slopes,
        cache,
        num_splits,
        problem,
        scheme,
    )?;
    launch_flash_fwd_combine::<R, E>(
        client,
        &oaccum,
        &lseaccum,
        out,
        softmax_lse,
        num_splits,
        problem,
    )?;
    Ok(())
}

fn contiguous_strides<const N: usize>(shape: &[usize; N]) -> [usize; N] {
    let mut strides = [1; N];
    for i in (0..N - 1).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

fn validate_handles<R: Runtime>(
    q: &TensorHandleRef<R>,
    k: &TensorHandleRef<R>,
    v: &TensorHandleRef<R>,
    out: &TensorHandleRef<R>,
    aux: &FlashAux<'_, R>,
    cache: Option<&KvCacheArgs<'_, R>>,
    problem: &FlashProblem,
) -> Result<(), FlashSetupError> {
    let dims = &problem.dims;
    let invalid = |msg: String| Err(FlashSetupError::InvalidProblem(msg));

    if q.shape != out.shape {
        return invalid(format!(
            "O must have the shape of Q, got {:?} vs {:?}",
            out.shape, q.shape
        ));
    }
    let head_dim = *q.shape.last().unwrap();
    if head_dim != dims.head_dim
        || *k.shape.last().unwrap() != dims.head_dim
        || *v.shape.last().unwrap() != dims.head_dim
    {
        return invalid(format!(
            "Q/K/V head dims {:?}/{:?}/{:?} must all be {}",
            q.shape.last(),
            k.shape.last(),
            v.shape.last(),
            dims.head_dim
        ));
    }
    if k.shape != v.shape {
        return invalid(format!(
            "K and V must have the same shape, got {:?} vs {:?}",
            k.shape, v.shape
        ));
    }
    let varlen_q = aux.cu_seqlens_q.is_some();
    if (q.shape.len() == 3) != varlen_q {
        return invalid(
            "rank-3 (packed) Q requires cu_seqlens_q, rank-4 Q forbids it".to_string(),
        );
    }

    if let Some(cache) = cache {
        if cache.knew.is_some() != cache.vnew.is_some() {
            return invalid("knew and vnew must be appended together".to_string());
        }
        if cache.knew.is_some() && cache.seqlen_knew == 0 {
            return invalid("appending knew/vnew requires seqlen_knew > 0".to_string());
        }
        if cache.block_table.is_some() && cache.page_size == 0 {
            return invalid("a paged KV cache requires page_size > 0".to_string());
        }
        if cache.rotary_dim > 0 {
            if cache.rotary_dim % 2 != 0 || cache.rotary_dim > dims.head_dim {
                return invalid(format!(
                    "rotary_dim ({}) must be even and at most head_dim ({})",
                    cache.rotary_dim, dims.head_dim
                ));
            }
            if cache.rotary_cos.is_none() || cache.rotary_sin.is_none() {
                return invalid("rotary_dim > 0 requires rotary_cos and rotary_sin".to_string());
            }
        }
    }

    if problem.options.return_softmax && aux.p_debug.is_none() {
        return invalid("return_softmax requires the probability debug buffer".to_string());
    }
    if problem.options.dropout_p > 0.0 && aux.rng_state.is_none() {
        return invalid("dropout requires the rng_state buffer".to_string());
    }

    Ok(())
}
