//! Streaming (online) softmax accumulation.
//!
//! Each query row carries a running max `m`, a running sum `l` and a
//! weighted-output accumulator `acc`. Tiles of scores can arrive in any
//! order; after the last one, `finish` yields exactly
//! `softmax(scores) @ values` over every unmasked column seen.
//!
//! For a tile with local max `m_local`:
//!
//! ```text
//! m_new = max(m, m_local)
//! acc, l  *= exp(m - m_new)
//! acc, l  += contribution * exp(m_local - m_new)
//! m        = m_new
//! ```
//!
//! Masked columns hold `-inf` and vanish after exponentiation. A row whose
//! running max is still `-inf` has seen nothing valid and is left alone, so
//! `exp(-inf - -inf)` is never evaluated.

use prefill_core::NormalizationPolicy;

#[derive(Debug, Clone, PartialEq)]
pub struct RowState {
    m: f32,
    l: f32,
    acc: Vec<f32>,
}

impl RowState {
    pub fn new(head_dim: usize) -> Self {
        Self {
            m: f32::NEG_INFINITY,
            l: 0.0,
            acc: vec![0.0; head_dim],
        }
    }

    pub fn max(&self) -> f32 {
        self.m
    }

    pub fn sum(&self) -> f32 {
        self.l
    }

    pub fn acc(&self) -> &[f32] {
        &self.acc
    }

    /// Fold one row of a score tile.
    ///
    /// `scores[j]` is the (scaled, masked, biased) score of column `j`;
    /// `values` is `[scores.len(), head_dim]` row-major. `scores` is
    /// overwritten with the column weights.
    pub fn fold(&mut self, scores: &mut [f32], values: &[f32], policy: NormalizationPolicy) {
        let head_dim = self.acc.len();
        debug_assert_eq!(values.len(), scores.len() * head_dim);

        let m_local = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let m_new = self.m.max(m_local);
        if m_local == f32::NEG_INFINITY {
            // Nothing valid in this tile: alpha = 1, contribution = 0.
            return;
        }

        match policy {
            NormalizationPolicy::Deferred => {
                let alpha = (self.m - m_new).exp();
                let mut l_local = 0.0f32;
                for s in scores.iter_mut() {
                    *s = (*s - m_new).exp();
                    l_local += *s;
                }
                self.l = alpha * self.l + l_local;
                for a in self.acc.iter_mut() {
                    *a *= alpha;
                }
                accumulate(&mut self.acc, scores, values);
            }
            NormalizationPolicy::Eager => {
                let mut l_local = 0.0f32;
                for s in scores.iter_mut() {
                    *s = (*s - m_local).exp();
                    l_local += *s;
                }
                let alpha = (self.m - m_new).exp();
                let beta = (m_local - m_new).exp();
                let l_new = alpha * self.l + beta * l_local;
                let p_scale = beta / l_new;
                let acc_scale = self.l / l_new * alpha;
                for a in self.acc.iter_mut() {
                    *a *= acc_scale;
                }
                for s in scores.iter_mut() {
                    *s *= p_scale;
                }
                accumulate(&mut self.acc, scores, values);
                self.l = l_new;
            }
        }
        self.m = m_new;
    }

    /// Write the normalized output row into `out`.
    ///
    /// A row that never saw a valid column produces zeros.
    pub fn finish(&self, policy: NormalizationPolicy, out: &mut [f32]) {
        match policy {
            NormalizationPolicy::Eager => out.copy_from_slice(&self.acc),
            NormalizationPolicy::Deferred => {
                let inv = if self.l > 0.0 { 1.0 / self.l } else { 0.0 };
                for (o, a) in out.iter_mut().zip(&self.acc) {
                    *o = a * inv;
                }
            }
        }
    }
}

#[inline]
fn accumulate(acc: &mut [f32], weights: &[f32], values: &[f32]) {
    let head_dim = acc.len();
    for (w, v_row) in weights.iter().zip(values.chunks_exact(head_dim)) {
        if *w == 0.0 {
            continue;
        }
        for (a, v) in acc.iter_mut().zip(v_row) {
            *a += w * v;
        }
    }
}

/// Accumulator for the query rows of one work item.
#[derive(Debug, Clone)]
pub struct TileAccumulator {
    policy: NormalizationPolicy,
    head_dim: usize,
    rows: Vec<RowState>,
}

impl TileAccumulator {
    pub fn new(num_rows: usize, head_dim: usize, policy: NormalizationPolicy) -> Self {
        Self {
            policy,
            head_dim,
            rows: (0..num_rows).map(|_| RowState::new(head_dim)).collect(),
        }
    }

    pub fn policy(&self) -> NormalizationPolicy {
        self.policy
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn row(&self, row: usize) -> &RowState {
        &self.rows[row]
    }

    pub fn row_max(&self, row: usize) -> f32 {
        self.rows[row].m
    }

    pub fn row_sum(&self, row: usize) -> f32 {
        self.rows[row].l
    }

    /// Fold a `[num_rows, cols]` score tile against `[cols, head_dim]` values.
    pub fn fold_tile(&mut self, scores: &mut [f32], cols: usize, values: &[f32]) {
        debug_assert_eq!(scores.len(), self.rows.len() * cols);
        debug_assert_eq!(values.len(), cols * self.head_dim);
        for (state, row_scores) in self.rows.iter_mut().zip(scores.chunks_exact_mut(cols)) {
            state.fold(row_scores, values, self.policy);
        }
    }

    /// Normalized `[num_rows, head_dim]` output.
    pub fn finish(&self) -> Vec<f32> {
        let mut out = vec![0.0; self.rows.len() * self.head_dim];
        for (state, row) in self.rows.iter().zip(out.chunks_exact_mut(self.head_dim)) {
            state.finish(self.policy, row);
        }
        out
    }
}
