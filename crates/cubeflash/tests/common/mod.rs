//! CPU reference for the forward kernels.
//!
//! Two models live here: a straightforward softmax reference used as the
//! golden result, and a tiled mirror that walks K/V tiles with the same
//! online-softmax/split/combine arithmetic as the kernels (reverse
//! traversal, exp2 with the log2(e)-folded scale, fp32 state, sentinel
//! LSEs). Tests hold the mirror against the golden model across the mask
//! modes, splits, paging and dropout.
//!
//! Tensors are contiguous `[batch, heads, seq, dim]` slices of f32.

#![allow(dead_code)]

/// Stand-in the kernels use for +inf on rows with no live key.
pub const LSE_INF: f32 = f32::MAX;
/// Stand-in for -inf, the "no contribution" split sentinel.
pub const LSE_NEG_INF: f32 = f32::MIN;

#[derive(Clone)]
pub struct RefProblem {
    pub batch: usize,
    pub num_heads: usize,
    pub num_heads_k: usize,
    pub seq_q: usize,
    pub seq_k: usize,
    pub head_dim: usize,
    pub softmax_scale: f32,
    pub causal: bool,
    /// Negative bounds are unbounded; causal is `(-1, 0)`.
    pub window_left: i32,
    pub window_right: i32,
    /// One slope per (batch, head), or per head when `batch == 1` rows.
    pub alibi_slopes: Option<Vec<f32>>,
    /// Actual per-batch lengths inside the padded layout.
    pub seqlens_q: Option<Vec<usize>>,
    pub seqlens_k: Option<Vec<usize>>,
}

impl RefProblem {
    pub fn new(
        batch: usize,
        num_heads: usize,
        seq_q: usize,
        seq_k: usize,
        head_dim: usize,
    ) -> Self {
        Self {
            batch,
            num_heads,
            num_heads_k: num_heads,
            seq_q,
            seq_k,
            head_dim,
            softmax_scale: 1.0 / (head_dim as f32).sqrt(),
            causal: false,
            window_left: -1,
            window_right: -1,
            alibi_slopes: None,
            seqlens_q: None,
            seqlens_k: None,
        }
    }

    pub fn causal(mut self) -> Self {
        self.causal = true;
        self.window_right = 0;
        self
    }

    pub fn local(mut self, left: i32, right: i32) -> Self {
        self.window_left = left;
        self.window_right = right;
        self
    }

    pub fn len_q(&self, b: usize) -> usize {
        self.seqlens_q.as_ref().map_or(self.seq_q, |l| l[b])
    }

    pub fn len_k(&self, b: usize) -> usize {
        self.seqlens_k.as_ref().map_or(self.seq_k, |l| l[b])
    }

    fn slope(&self, b: usize, h: usize) -> f32 {
        match &self.alibi_slopes {
            Some(s) if s.len() == self.num_heads => s[h],
            Some(s) => s[b * self.num_heads + h],
            None => 0.0,
        }
    }

    fn windowed(&self) -> bool {
        self.causal || self.window_left >= 0 || self.window_right >= 0
    }

    /// Whether key `col` is visible to query `row` of batch `b`.
    pub fn visible(&self, b: usize, row: usize, col: usize) -> bool {
        if col >= self.len_k(b) {
            return false;
        }
        let aligned = row as i32 + self.len_k(b) as i32 - self.len_q(b) as i32;
        if self.windowed() {
            if self.window_right >= 0 && col as i32 > aligned + self.window_right {
                return false;
            }
            if self.window_left >= 0 && (col as i32) < aligned - self.window_left {
                return false;
            }
        }
        true
    }

    pub fn q_elems(&self) -> usize {
        self.batch * self.num_heads * self.seq_q * self.head_dim
    }

    pub fn kv_elems(&self) -> usize {
        self.batch * self.num_heads_k * self.seq_k * self.head_dim
    }
}

pub fn q_index(p: &RefProblem, b: usize, h: usize, s: usize, d: usize) -> usize {
    ((b * p.num_heads + h) * p.seq_q + s) * p.head_dim + d
}

pub fn kv_index(p: &RefProblem, b: usize, h: usize, s: usize, d: usize) -> usize {
    ((b * p.num_heads_k + h) * p.seq_k + s) * p.head_dim + d
}

pub fn lse_index(p: &RefProblem, b: usize, h: usize, s: usize) -> usize {
    (b * p.num_heads + h) * p.seq_q + s
}

// ---------------------------------------------------------------------------
// Golden model: direct softmax.
// ---------------------------------------------------------------------------

/// `softmax(Q·K^T · scale + alibi + mask) · V` and the row LSEs, computed
/// the obvious way.
pub fn attention_reference(q: &[f32], k: &[f32], v: &[f32], p: &RefProblem) -> (Vec<f32>, Vec<f32>) {
    let mut out = vec![0.0f32; p.q_elems()];
    let mut lse = vec![0.0f32; p.batch * p.num_heads * p.seq_q];
    let ratio = p.num_heads / p.num_heads_k;

    for b in 0..p.batch {
        for h in 0..p.num_heads {
            let hk = h / ratio;
            let slope = p.slope(b, h);
            for i in 0..p.len_q(b) {
                let aligned = i as i32 + p.len_k(b) as i32 - p.len_q(b) as i32;
                let mut scores = Vec::with_capacity(p.len_k(b));
                for j in 0..p.len_k(b) {
                    if p.visible(b, i, j) {
                        let mut dot = 0.0f32;
                        for d in 0..p.head_dim {
                            dot += q[q_index(p, b, h, i, d)] * k[kv_index(p, b, hk, j, d)];
                        }
                        let bias = slope * (j as i32 - aligned) as f32;
                        scores.push(dot * p.softmax_scale + bias);
                    } else {
                        scores.push(f32::NEG_INFINITY);
                    }
                }

                let m = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
                let lse_idx = lse_index(p, b, h, i);
                if m == f32::NEG_INFINITY {
                    lse[lse_idx] = LSE_INF;
                    continue;
                }
                let mut denom = 0.0f32;
                for s in &scores {
                    if *s != f32::NEG_INFINITY {
                        denom += (s - m).exp();
                    }
                }
                lse[lse_idx] = m + denom.ln();
                for (j, s) in scores.iter().enumerate() {
                    if *s == f32::NEG_INFINITY {
                        continue;
                    }
                    let w = (s - m).exp() / denom;
                    for d in 0..p.head_dim {
                        out[q_index(p, b, h, i, d)] += w * v[kv_index(p, b, hk, j, d)];
                    }
                }
            }
        }
    }
    (out, lse)
}

// ---------------------------------------------------------------------------
// Tiled mirror of the kernels.
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
pub struct DropoutSpec {
    pub p_drop: f32,
    pub seed: u64,
    pub offset: u64,
}

impl DropoutSpec {
    pub fn p_keep_in_u8(&self) -> u32 {
        ((1.0 - self.p_drop) * 255.0).floor() as u32
    }

    pub fn rp_dropout(&self) -> f32 {
        1.0 / (1.0 - self.p_drop)
    }
}

/// Tile-by-tile forward with the kernels' arithmetic: per-split reverse
/// traversal, running (m, l) in the exp2 domain, per-split partials
/// `O_s = Σ exp(s - m)·V / l` with `LSE_s = m·scale + ln l`, merged by the
/// combine identity.
pub fn flash_forward_tiled(
    q: &[f32],
    k: &[f32],
    v: &[f32],
    p: &RefProblem,
    block_m: usize,
    block_n: usize,
    num_splits: usize,
    dropout: Option<DropoutSpec>,
) -> (Vec<f32>, Vec<f32>) {
    assert!(dropout.is_none() || num_splits == 1);
    let mut out = vec![0.0f32; p.q_elems()];
    let mut lse = vec![0.0f32; p.batch * p.num_heads * p.seq_q];
    let ratio = p.num_heads / p.num_heads_k;
    let scale_log2 = p.softmax_scale * std::f32::consts::LOG2_E;

    let n_tiles_total = p.seq_k.div_ceil(block_n);
    let n_tiles_per_split = n_tiles_total.div_ceil(num_splits);

    for b in 0..p.batch {
        let len_q = p.len_q(b);
        let len_k = p.len_k(b);
        let shift = len_k as i32 - len_q as i32;
        for h in 0..p.num_heads {
            let hk = h / ratio;
            // The kernels get the slope pre-divided by the softmax scale and
            // add the bias to the raw logits.
            let raw_slope = p.slope(b, h) / p.softmax_scale;
            for q_tile in 0..len_q.div_ceil(block_m) {
                for row in (q_tile * block_m)..((q_tile + 1) * block_m).min(len_q) {
                    let mut partial_o = Vec::new();
                    let mut partial_lse = Vec::new();

                    for split in 0..num_splits {
                        // Key-tile range of this (query tile, split).
                        let mut n_min = split * n_tiles_per_split;
                        let actual_tiles = len_k.div_ceil(block_n);
                        let mut n_max = actual_tiles.min((split + 1) * n_tiles_per_split);
                        if p.windowed() && p.window_right >= 0 {
                            let limit = ((q_tile + 1) * block_m) as i32
                                + shift
                                + p.window_right;
                            let limit_tiles =
                                (limit.max(0) as usize).div_ceil(block_n);
                            n_max = n_max.min(limit_tiles);
                        }
                        if p.window_left >= 0 {
                            let low = (q_tile * block_m) as i32 + shift - p.window_left;
                            if low > 0 {
                                n_min = n_min.max(low as usize / block_n);
                            }
                        }

                        if n_max <= n_min {
                            partial_o.push(vec![0.0f32; p.head_dim]);
                            partial_lse.push(LSE_NEG_INF);
                            continue;
                        }

                        let mut m = f32::MIN;
                        let mut l = 0.0f32;
                        let mut acc = vec![0.0f32; p.head_dim];

                        for n_tile in (n_min..n_max).rev() {
                            let col0 = n_tile * block_n;
                            let mut scores = vec![f32::MIN; block_n];
                            let mut tile_max = f32::MIN;
                            for jj in 0..block_n {
                                let col = col0 + jj;
                                if col < p.seq_k && p.visible(b, row, col) {
                                    let mut dot = 0.0f32;
                                    for d in 0..p.head_dim {
                                        dot += q[q_index(p, b, h, row, d)]
                                            * k[kv_index(p, b, hk, col, d)];
                                    }
                                    let aligned = row as i32 + shift;
                                    let score =
                                        dot + raw_slope * (col as i32 - aligned) as f32;
                                    scores[jj] = score;
                                    tile_max = tile_max.max(score);
                                }
                            }
                            if tile_max == f32::MIN {
                                continue;
                            }
                            let m_new = m.max(tile_max);
                            let alpha = ((m - m_new) * scale_log2).exp2();
                            for a in acc.iter_mut() {
                                *a *= alpha;
                            }
                            l *= alpha;
                            m = m_new;
                            for (jj, score) in scores.iter().enumerate() {
                                let mut prob = if *score == f32::MIN {
                                    0.0
                                } else {
                                    ((score - m) * scale_log2).exp2()
                                };
                                if *score != f32::MIN {
                                    l += prob;
                                }
                                if let Some(spec) = dropout {
                                    let col = col0 + jj;
                                    if !dropout_keep(
                                        spec,
                                        (b * p.num_heads + h) as u32,
                                        row as u32,
                                        col as u32,
                                    ) {
                                        prob = 0.0;
                                    }
                                }
                                if prob != 0.0 {
                                    for d in 0..p.head_dim {
                                        acc[d] += prob * v[kv_index(p, b, hk, col0 + jj, d)];
                                    }
                                }
                            }
                        }

                        let rp = dropout.map_or(1.0, |s| s.rp_dropout());
                        if l == 0.0 {
                            partial_o.push(vec![0.0f32; p.head_dim]);
                            partial_lse.push(if num_splits > 1 { LSE_NEG_INF } else { LSE_INF });
                        } else {
                            partial_o.push(acc.iter().map(|a| a / l * rp).collect());
                            partial_lse.push(m * p.softmax_scale + l.ln());
                        }
                    }

                    let (o_row, lse_row) = combine_partials(&partial_o, &partial_lse, p.head_dim);
                    for d in 0..p.head_dim {
                        out[q_index(p, b, h, row, d)] = o_row[d];
                    }
                    lse[lse_index(p, b, h, row)] = lse_row;
                }
            }
        }
    }
    (out, lse)
}

/// The combine identity: `LSE = M + ln Σ exp(LSE_s - M)` and
/// `O = Σ exp(LSE_s - LSE) · O_s`.
pub fn combine_partials(
    partial_o: &[Vec<f32>],
    partial_lse: &[f32],
    head_dim: usize,
) -> (Vec<f32>, f32) {
    if partial_lse.len() == 1 {
        return (partial_o[0].clone(), partial_lse[0]);
    }
    let m = partial_lse.iter().cloned().fold(f32::MIN, f32::max);
    let safe_m = if m == f32::MIN { 0.0 } else { m };
    let sum: f32 = partial_lse.iter().map(|l| (l - safe_m).exp()).sum();
    if sum == 0.0 || sum.is_nan() {
        return (vec![0.0; head_dim], LSE_INF);
    }
    let lse = sum.ln() + safe_m;
    let mut out = vec![0.0f32; head_dim];
    for (o_s, l_s) in partial_o.iter().zip(partial_lse) {
        let w = (l_s - lse).exp();
        if w != 0.0 {
            for d in 0..head_dim {
                out[d] += w * o_s[d];
            }
        }
    }
    (out, lse)
}

// ---------------------------------------------------------------------------
// Philox mirror.
// ---------------------------------------------------------------------------

const PHILOX_W32_0: u32 = 0x9E37_79B9;
const PHILOX_W32_1: u32 = 0xBB67_AE85;
const PHILOX_M4X32_0: u32 = 0xD251_1F53;
const PHILOX_M4X32_1: u32 = 0xCD9E_8D57;

/// Philox-4x32 with 10 rounds.
pub fn philox_4x32(counter: [u32; 4], seed: u64) -> [u32; 4] {
    let mut key0 = (seed & 0xFFFF_FFFF) as u32;
    let mut key1 = (seed >> 32) as u32;
    let [mut x0, mut x1, mut x2, mut x3] = counter;
    for _ in 0..10 {
        let p0 = PHILOX_M4X32_0 as u64 * x0 as u64;
        let p1 = PHILOX_M4X32_1 as u64 * x2 as u64;
        let y0 = (p1 >> 32) as u32 ^ x1 ^ key0;
        let y1 = p1 as u32;
        let y2 = (p0 >> 32) as u32 ^ x3 ^ key1;
        let y3 = p0 as u32;
        x0 = y0;
        x1 = y1;
        x2 = y2;
        x3 = y3;
        key0 = key0.wrapping_add(PHILOX_W32_0);
        key1 = key1.wrapping_add(PHILOX_W32_1);
    }
    [x0, x1, x2, x3]
}

/// Whether attention weight (row, col) of head-batch `bh` survives dropout.
/// A pure function of (seed, offset, bh, row, col): one Philox call covers
/// the four columns of `col / 4`.
pub fn dropout_keep(spec: DropoutSpec, bh: u32, row: u32, col: u32) -> bool {
    let counter = spec.offset.wrapping_add((col / 4) as u64);
    let rand = philox_4x32(
        [(counter & 0xFFFF_FFFF) as u32, (counter >> 32) as u32, row, bh],
        spec.seed,
    );
    (rand[(col % 4) as usize] & 0xFF) <= spec.p_keep_in_u8()
}

// ---------------------------------------------------------------------------
// Rotary and KV-cache append.
// ---------------------------------------------------------------------------

/// Rotary tables `[max_pos, rotary_dim / 2]`.
pub fn rotary_tables(max_pos: usize, rotary_dim: usize, theta: f32) -> (Vec<f32>, Vec<f32>) {
    let half = rotary_dim / 2;
    let mut cos = vec![0.0f32; max_pos * half];
    let mut sin = vec![0.0f32; max_pos * half];
    for pos in 0..max_pos {
        for i in 0..half {
            let freq = theta.powf(-2.0 * i as f32 / rotary_dim as f32);
            cos[pos * half + i] = (pos as f32 * freq).cos();
            sin[pos * half + i] = (pos as f32 * freq).sin();
        }
    }
    (cos, sin)
}

/// In-place rotary embedding of one head row.
pub fn rotate_row(
    row: &mut [f32],
    cos: &[f32],
    sin: &[f32],
    position: usize,
    rotary_dim: usize,
    interleaved: bool,
) {
    let half = rotary_dim / 2;
    for i in 0..half {
        let c = cos[position * half + i];
        let s = sin[position * half + i];
        let (a, b) = if interleaved { (2 * i, 2 * i + 1) } else { (i, i + half) };
        let x = row[a];
        let y = row[b];
        row[a] = x * c - y * s;
        row[b] = x * s + y * c;
    }
}

// ---------------------------------------------------------------------------
// Paged KV storage.
// ---------------------------------------------------------------------------

/// Scatters a contiguous `[batch, heads_k, seq_k, dim]` cache into pages of
/// `page_size` rows laid out `[num_pages, page_size, heads_k, dim]`,
/// following the given per-batch page table.
pub fn scatter_to_pages(
    contiguous: &[f32],
    p: &RefProblem,
    block_table: &[i32],
    pages_per_seq: usize,
    page_size: usize,
    num_pages: usize,
) -> Vec<f32> {
    let mut paged = vec![0.0f32; num_pages * page_size * p.num_heads_k * p.head_dim];
    for b in 0..p.batch {
        for row in 0..p.seq_k {
            let page = block_table[b * pages_per_seq + row / page_size] as usize;
            let in_page = row % page_size;
            for hk in 0..p.num_heads_k {
                for d in 0..p.head_dim {
                    let dst = ((page * page_size + in_page) * p.num_heads_k + hk) * p.head_dim + d;
                    paged[dst] = contiguous[kv_index(p, b, hk, row, d)];
                }
            }
        }
    }
    paged
}

/// Inverse of [`scatter_to_pages`], resolving rows the way the kernels do:
/// `page_base · page_stride + in_page · row_stride + head · head_stride`.
pub fn gather_from_pages(
    paged: &[f32],
    p: &RefProblem,
    block_table: &[i32],
    pages_per_seq: usize,
    page_size: usize,
) -> Vec<f32> {
    let mut contiguous = vec![0.0f32; p.kv_elems()];
    let page_stride = page_size * p.num_heads_k * p.head_dim;
    let row_stride = p.num_heads_k * p.head_dim;
    for b in 0..p.batch {
        for row in 0..p.seq_k {
            let page = block_table[b * pages_per_seq + row / page_size] as usize;
            let offset = page * page_stride + (row % page_size) * row_stride;
            for hk in 0..p.num_heads_k {
                for d in 0..p.head_dim {
                    contiguous[kv_index(p, b, hk, row, d)] =
                        paged[offset + hk * p.head_dim + d];
                }
            }
        }
    }
    contiguous
}

// ---------------------------------------------------------------------------
// Deterministic test data.
// ---------------------------------------------------------------------------

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Seeded uniform values in [lo, hi).
pub fn uniform_vec(seed: u64, len: usize, lo: f32, hi: f32) -> Vec<f32> {
    let mut state = seed;
    (0..len)
        .map(|_| {
            let unit = (splitmix64(&mut state) >> 40) as f32 / (1u64 << 24) as f32;
            lo + unit * (hi - lo)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Comparison helpers.
// ---------------------------------------------------------------------------

/// Max-norm comparison with sentinel-aware LSE handling.
pub fn assert_close(actual: &[f32], expected: &[f32], eps: f32, what: &str) {
    assert_eq!(actual.len(), expected.len(), "{what}: length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        if *e >= LSE_INF / 2.0 && *a >= LSE_INF / 2.0 {
            continue;
        }
        let err = (a - e).abs();
        assert!(
            err <= eps,
            "{what}[{i}]: {a} vs {e} (err {err}, eps {eps})"
        );
    }
}
