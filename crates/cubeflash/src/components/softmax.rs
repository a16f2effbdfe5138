use cubecl::prelude::*;

/// Running state of the online softmax for one query row.
///
/// The caller keeps the raw (unscaled) logits and folds the softmax scale
/// into the exponent together with `log2(e)`, so the exponentials run on the
/// hardware exp2 path: `p = 2^((s - m) · scale_log2)`.
///
/// `row_max` stays at `f32::min_value()` while every key seen so far was
/// masked; in that regime all probabilities and rescale factors underflow to
/// zero and the state is a no-op.
#[derive(CubeType)]
pub struct OnlineSoftmax {
    pub row_max: f32,
    pub row_sum: f32,
}

#[cube]
impl OnlineSoftmax {
    pub fn init() -> OnlineSoftmax {
        OnlineSoftmax {
            row_max: f32::min_value(),
            row_sum: 0.0f32,
        }
    }

    /// Folds a new tile maximum into the running max and returns the factor
    /// by which the caller must scale its output accumulator.
    pub fn rescale(&mut self, tile_max: f32, scale_log2: f32) -> f32 {
        let m_new = f32::max(self.row_max, tile_max);
        let alpha = ((self.row_max - m_new) * scale_log2).exp2();
        self.row_max = m_new;
        self.row_sum = self.row_sum * alpha;
        alpha
    }

    /// Unnormalized probability of one raw logit under the current max.
    pub fn probability(&self, score: f32, scale_log2: f32) -> f32 {
        (score * scale_log2 - self.row_max * scale_log2).exp2()
    }

    pub fn accumulate(&mut self, probability: f32) {
        self.row_sum += probability;
    }

    /// Factor that turns the accumulated `P·V` rows into the final output,
    /// folding in the dropout compensation. Rows whose denominator is zero
    /// (every key masked) keep their zero accumulator untouched.
    pub fn normalizer(&self, rp_dropout: f32) -> f32 {
        let sum = self.row_sum;
        let empty = sum == 0.0f32 || sum != sum;
        let inv = select(empty, 1.0f32, 1.0f32 / sum);
        inv * rp_dropout
    }

    /// Log-sum-exp of the row in natural-log units.
    ///
    /// Rows with an empty denominator take a sentinel: the dense kernels
    /// write the largest float (standing in for +inf), the split kernels the
    /// smallest (standing in for -inf, "no contribution") so the combine
    /// reduction stays well defined.
    pub fn lse(&self, scale_softmax: f32, #[comptime] split: bool) -> f32 {
        let sum = self.row_sum;
        let empty = sum == 0.0f32 || sum != sum;
        let sentinel = if split {
            f32::min_value()
        } else {
            f32::max_value()
        };
        select(
            empty,
            sentinel,
            self.row_max * scale_softmax + f32::ln(sum),
        )
    }
}
