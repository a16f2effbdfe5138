mod combine;
mod dense;
mod split;

pub use combine::*;
pub use dense::*;
pub use split::*;

use cubecl::prelude::*;

/// Runtime parameters consumed by the dense and split-KV kernels.
///
/// Strides are in elements. Q/O strides follow the `[batch, head, row]`
/// layout axes; for packed variable-length batches the batch stride is
/// unused and row offsets come from `cu_seqlens`.
#[derive(CubeType, CubeLaunch)]
pub struct FlashParams {
    pub seqlen_q: u32,
    pub seqlen_k: u32,
    pub num_heads: u32,
    /// Query heads per K/V head (grouped-query attention).
    pub h_h_k_ratio: u32,
    pub q_batch_stride: u32,
    pub q_head_stride: u32,
    pub q_row_stride: u32,
    pub k_batch_stride: u32,
    pub k_head_stride: u32,
    pub k_row_stride: u32,
    pub v_batch_stride: u32,
    pub v_head_stride: u32,
    pub v_row_stride: u32,
    pub o_batch_stride: u32,
    pub o_head_stride: u32,
    pub o_row_stride: u32,
    pub scale_softmax: f32,
    /// `scale_softmax · log2(e)`, for the exp2-based softmax.
    pub scale_softmax_log2: f32,
    pub window_size_left: i32,
    pub window_size_right: i32,
    /// Keep probability quantized to a u8 threshold.
    pub p_keep_in_u8: u32,
    /// `1 / (1 - dropout_p)`; 1.0 when dropout is off.
    pub rp_dropout: f32,
    pub philox_seed: u64,
    pub philox_offset: u64,
    pub seqlen_q_rounded: u32,
    pub seqlen_k_rounded: u32,
    pub alibi_slopes_batch_stride: u32,
}

/// Extra runtime parameters of the split-KV kernel.
#[derive(CubeType, CubeLaunch)]
pub struct SplitParams {
    pub batch: u32,
    pub num_splits: u32,
    /// Rows appended to the KV cache this call (zero when not appending).
    pub seqlen_knew: u32,
    pub knew_batch_stride: u32,
    pub knew_head_stride: u32,
    pub knew_row_stride: u32,
    pub vnew_batch_stride: u32,
    pub vnew_head_stride: u32,
    pub vnew_row_stride: u32,
    /// Rotated prefix of the head dimension (zero disables rotary).
    pub rotary_dim: u32,
    /// Rows per KV-cache page when a block table is present.
    pub page_size: u32,
    pub block_table_batch_stride: u32,
    pub head_dim_rounded: u32,
}

/// (batch, head, row) element strides of a `[batch, heads, seq, dim]`
/// tensor, or of its packed `[total_rows, heads, dim]` variant where the
/// batch stride is meaningless.
pub(crate) fn strides_bhr<R: Runtime>(tensor: &TensorHandleRef<R>) -> (u32, u32, u32) {
    match tensor.shape.len() {
        4 => (
            tensor.strides[0] as u32,
            tensor.strides[1] as u32,
            tensor.strides[2] as u32,
        ),
        3 => (0, tensor.strides[1] as u32, tensor.strides[0] as u32),
        rank => panic!("expected a rank-3 or rank-4 attention tensor, got rank {rank}"),
    }
}

/// (page, head, row) element strides of a paged
/// `[num_pages, page_size, heads, dim]` KV cache.
pub(crate) fn strides_paged<R: Runtime>(tensor: &TensorHandleRef<R>) -> (u32, u32, u32) {
    assert_eq!(
        tensor.shape.len(),
        4,
        "paged KV caches are [num_pages, page_size, heads_k, head_dim]"
    );
    (
        tensor.strides[0] as u32,
        tensor.strides[2] as u32,
        tensor.strides[1] as u32,
    )
}

/// Runtime parameters of the combine kernel.
#[derive(CubeType, CubeLaunch)]
pub struct CombineParams {
    /// `batch · num_heads · seqlen_q`.
    pub total_rows: u32,
    pub seqlen_q: u32,
    pub num_heads: u32,
    pub num_splits: u32,
    pub head_dim_rounded: u32,
    pub o_batch_stride: u32,
    pub o_head_stride: u32,
    pub o_row_stride: u32,
}
