use cubecl::prelude::*;
use cubecl::std::{CubeOption, CubeOptionExpand};

/// Per-batch sequence lengths and base offsets.
///
/// Resolves the three batch layouts the kernels support:
/// - regular padded batches, where every sequence spans `seqlen_q`/`seqlen_k`
///   rows and batches are `batch_stride` apart;
/// - packed variable-length batches, where `cu_seqlens_q`/`cu_seqlens_k` hold
///   cumulative row offsets and the batch stride is meaningless;
/// - KV caches, where `cu_seqlens_k` holds per-batch used lengths
///   (non-cumulative) and appended rows extend the key sequence.
#[derive(CubeType)]
pub struct BlockInfo {
    /// Packed row offset of this batch in Q (zero when not packed).
    pub sum_s_q: u32,
    /// Packed row offset of this batch in K/V (zero when not packed).
    pub sum_s_k: u32,
    pub actual_seqlen_q: u32,
    /// Key rows already present before any append.
    pub seqlen_k_cache: u32,
    /// Key rows visible to the attention, including appended rows.
    pub actual_seqlen_k: u32,
}

#[cube]
impl BlockInfo {
    pub fn new(
        cu_seqlens_q: &CubeOption<Tensor<i32>>,
        cu_seqlens_k: &CubeOption<Tensor<i32>>,
        seqused_k: &CubeOption<Tensor<i32>>,
        batch: u32,
        seqlen_q: u32,
        seqlen_k: u32,
        seqlen_knew: u32,
        #[comptime] is_seqlens_k_cumulative: bool,
    ) -> BlockInfo {
        let sum_s_q = match cu_seqlens_q {
            CubeOption::Some(cu) => u32::cast_from(cu[batch as usize]),
            CubeOption::None => 0u32,
        };
        let actual_seqlen_q = match cu_seqlens_q {
            CubeOption::Some(cu) => u32::cast_from(cu[(batch + 1) as usize]) - sum_s_q,
            CubeOption::None => seqlen_q,
        };
        let sum_s_k = match cu_seqlens_k {
            CubeOption::Some(cu) => {
                if comptime!(is_seqlens_k_cumulative) {
                    u32::cast_from(cu[batch as usize])
                } else {
                    0u32
                }
            }
            CubeOption::None => 0u32,
        };
        let seqlen_k_cache = match cu_seqlens_k {
            CubeOption::Some(cu) => {
                if comptime!(is_seqlens_k_cumulative) {
                    u32::cast_from(cu[(batch + 1) as usize]) - sum_s_k
                } else {
                    u32::cast_from(cu[batch as usize])
                }
            }
            CubeOption::None => seqlen_k,
        };
        let actual_seqlen_k = match seqused_k {
            CubeOption::Some(used) => u32::cast_from(used[batch as usize]),
            CubeOption::None => seqlen_k_cache + seqlen_knew,
        };

        BlockInfo {
            sum_s_q,
            sum_s_k,
            actual_seqlen_q,
            seqlen_k_cache,
            actual_seqlen_k,
        }
    }

    /// Element offset of this batch's first Q (or O) row.
    pub fn q_offset(
        &self,
        batch_stride: u32,
        row_stride: u32,
        batch: u32,
        #[comptime] varlen: bool,
    ) -> u32 {
        if varlen {
            self.sum_s_q * row_stride
        } else {
            batch * batch_stride
        }
    }

    /// Element offset of this batch's first K (or V) row.
    pub fn k_offset(
        &self,
        batch_stride: u32,
        row_stride: u32,
        batch: u32,
        #[comptime] varlen: bool,
    ) -> u32 {
        if varlen {
            self.sum_s_k * row_stride
        } else {
            batch * batch_stride
        }
    }
}
