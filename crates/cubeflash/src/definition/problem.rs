use serde::{Deserialize, Serialize};

use crate::definition::{FlashSetupError, SUPPORTED_HEAD_DIMS};

/// Logical dimensions of one attention problem.
///
/// Shape conventions (row-major, explicit strides taken from the handles):
/// - Q: `[batch, num_heads, seq_q, head_dim]`
/// - K, V: `[batch, num_heads_k, seq_k, head_dim]`, or
///   `[num_pages, page_size, num_heads_k, head_dim]` when paged
/// - O: same shape as Q
/// - LSE: `[batch, num_heads, seq_q]` (f32)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashDims {
    pub batch: usize,
    pub num_heads: usize,
    /// Number of K/V heads. Must divide `num_heads` (grouped-query attention).
    pub num_heads_k: usize,
    pub seq_q: usize,
    pub seq_k: usize,
    pub head_dim: usize,
}

impl FlashDims {
    /// Ratio of query heads per K/V head.
    pub fn h_h_k_ratio(&self) -> usize {
        self.num_heads / self.num_heads_k
    }
}

/// Masking applied to the logits before softmax.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaskKind {
    /// Full (bidirectional) attention.
    Full,
    /// Lower-triangular mask, shifted so the last query row sees the whole
    /// key sequence when `seq_q != seq_k`.
    Causal,
    /// Sliding window. A negative bound means unbounded on that side.
    Local {
        window_left: i32,
        window_right: i32,
    },
}

impl MaskKind {
    pub(crate) fn is_causal(&self) -> bool {
        matches!(self, MaskKind::Causal)
    }

    pub(crate) fn is_local(&self) -> bool {
        matches!(self, MaskKind::Local { .. })
    }

    /// Window bounds in the convention of the kernels: causal is a local mask
    /// with `window_right = 0` and an unbounded left side.
    pub(crate) fn windows(&self) -> (i32, i32) {
        match self {
            MaskKind::Full => (-1, -1),
            MaskKind::Causal => (-1, 0),
            MaskKind::Local {
                window_left,
                window_right,
            } => (*window_left, *window_right),
        }
    }
}

/// Options of the forward pass that do not change tensor shapes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FlashOptions {
    /// Multiplier applied to the raw `Q·K^T` logits, typically
    /// `1/sqrt(head_dim)`.
    pub softmax_scale: f32,
    pub mask: MaskKind,
    /// Probability of dropping an attention weight. `0.0` disables dropout.
    pub dropout_p: f32,
    /// Counter-based RNG state for dropout, recorded to `rng_state` for
    /// reproducibility.
    pub philox_seed: u64,
    pub philox_offset: u64,
    /// Write the post-dropout probabilities to a debug buffer. When dropout
    /// is active, dropped entries are encoded by a sign flip, so the buffer
    /// is not a pure probability tensor.
    pub return_softmax: bool,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            softmax_scale: 1.0,
            mask: MaskKind::Full,
            dropout_p: 0.0,
            philox_seed: 0,
            philox_offset: 0,
            return_softmax: false,
        }
    }
}

/// A fully described forward attention problem.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FlashProblem {
    pub dims: FlashDims,
    pub options: FlashOptions,
}

impl FlashProblem {
    /// Head dimension rounded up for the fp32 partial-output buffer layout.
    pub fn head_dim_rounded(&self) -> usize {
        round_multiple(self.dims.head_dim, 32)
    }

    /// Sequence lengths rounded up for the debug probability buffer layout.
    pub fn seq_q_rounded(&self) -> usize {
        round_multiple(self.dims.seq_q, 128)
    }

    pub fn seq_k_rounded(&self) -> usize {
        round_multiple(self.dims.seq_k, 128)
    }

    /// Keep probability quantized to a u8 threshold, compared against the low
    /// byte of the Philox output.
    pub fn p_keep_in_u8(&self) -> u32 {
        ((1.0 - self.options.dropout_p) * 255.0).floor() as u32
    }

    /// Compensation factor `1/(1-p)` applied to surviving attention weights.
    pub fn rp_dropout(&self) -> f32 {
        1.0 / (1.0 - self.options.dropout_p)
    }

    /// `softmax_scale · log2(e)`, so the kernels can use the hardware exp2.
    pub fn scale_softmax_log2(&self) -> f32 {
        self.options.softmax_scale * std::f32::consts::LOG2_E
    }

    /// Host-side precondition checks. The kernels have no runtime error
    /// channel, so everything that can be rejected is rejected here.
    pub fn validate(&self) -> Result<(), FlashSetupError> {
        let dims = &self.dims;
        if !SUPPORTED_HEAD_DIMS.contains(&dims.head_dim) {
            return Err(FlashSetupError::UnsupportedHeadDim(dims.head_dim));
        }
        if dims.batch == 0 || dims.num_heads == 0 || dims.seq_q == 0 {
            return Err(FlashSetupError::InvalidProblem(format!(
                "batch ({}), num_heads ({}) and seq_q ({}) must be non-zero",
                dims.batch, dims.num_heads, dims.seq_q
            )));
        }
        if dims.num_heads_k == 0 || dims.num_heads % dims.num_heads_k != 0 {
            return Err(FlashSetupError::InvalidProblem(format!(
                "num_heads ({}) must be a multiple of num_heads_k ({})",
                dims.num_heads, dims.num_heads_k
            )));
        }
        if !(0.0..1.0).contains(&self.options.dropout_p) {
            return Err(FlashSetupError::InvalidProblem(format!(
                "dropout probability ({}) must be in [0, 1)",
                self.options.dropout_p
            )));
        }
        if let MaskKind::Local {
            window_left,
            window_right,
        } = self.options.mask
        {
            if window_left < 0 && window_right < 0 {
                return Err(FlashSetupError::InvalidProblem(
                    "local attention needs at least one bounded window side".to_string(),
                ));
            }
        }
        Ok(())
    }
}

pub(crate) fn round_multiple(value: usize, multiple: usize) -> usize {
    value.div_ceil(multiple) * multiple
}
