use serde::{Deserialize, Serialize};

/// Head dimensions the kernels are compiled for.
pub const SUPPORTED_HEAD_DIMS: [usize; 8] = [32, 64, 96, 128, 160, 192, 224, 256];

/// Hard cap on the number of K/V splits, bounded by the combine kernel's
/// shared-memory staging area.
pub const MAX_SPLITS: usize = 128;

/// Query rows merged per cube by the combine kernel.
pub const COMBINE_ROWS_PER_CUBE: u32 = 16;

/// Units per cube in the combine kernel.
pub const COMBINE_CUBE_DIM: u32 = 128;

/// Tile shape of the attention kernels for one head dimension.
///
/// `block_m` query rows are processed per cube (one row per unit), and K/V
/// are streamed through shared memory `block_n` rows at a time. The shapes
/// are chosen so the two staged fp32 tiles stay within a 32 KiB scratchpad
/// budget at every supported head dimension.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileScheme {
    pub block_m: u32,
    pub block_n: u32,
}

impl TileScheme {
    pub fn for_head_dim(head_dim: usize) -> TileScheme {
        match head_dim {
            32 | 64 => TileScheme {
                block_m: 64,
                block_n: 64,
            },
            96 | 128 => TileScheme {
                block_m: 64,
                block_n: 32,
            },
            _ => TileScheme {
                block_m: 32,
                block_n: 16,
            },
        }
    }

    /// Elements of one staged K or V tile.
    pub fn kv_tile_elems(&self, head_dim: usize) -> usize {
        self.block_n as usize * head_dim
    }
}

/// Compile-time configuration shared by the dense and split-KV kernels.
///
/// Everything in here specializes the generated kernel, mirroring how the
/// mask mode, dropout and variable-length handling select distinct
/// instantiations on the host.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct FlashKernelConfig {
    pub block_m: u32,
    pub block_n: u32,
    pub head_dim: u32,
    pub is_causal: bool,
    pub is_local: bool,
    pub has_alibi: bool,
    pub is_dropout: bool,
    pub return_softmax: bool,
    /// Queries are packed with `cu_seqlens_q` offsets.
    pub varlen_q: bool,
    /// Keys are packed with `cu_seqlens_k` offsets.
    pub varlen_k: bool,
    /// `cu_seqlens_k` holds cumulative offsets; otherwise per-batch lengths.
    pub is_seqlens_k_cumulative: bool,
    /// Copy `knew`/`vnew` into the KV cache before the main loop.
    pub append_kv: bool,
    /// Rotary embedding pairs adjacent elements instead of split halves.
    pub rotary_interleaved: bool,
    /// Write fp32 partial outputs instead of the final normalized output.
    pub is_split: bool,
}

impl FlashKernelConfig {
    pub fn kv_tile_elems(&self) -> u32 {
        self.block_n * self.head_dim
    }
}

/// Compile-time configuration of the combine kernel.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct CombineConfig {
    pub rows_per_cube: u32,
    pub max_splits: u32,
    pub head_dim: u32,
}

impl CombineConfig {
    pub fn for_head_dim(head_dim: usize) -> CombineConfig {
        CombineConfig {
            rows_per_cube: COMBINE_ROWS_PER_CUBE,
            max_splits: MAX_SPLITS as u32,
            head_dim: head_dim as u32,
        }
    }

    pub fn scales_smem_elems(&self) -> u32 {
        self.rows_per_cube * self.max_splits
    }
}
