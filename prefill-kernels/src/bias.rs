//! ALiBi-style linear positional bias.
//!
//! A head with slope `s` adds `s * (k_pos - q_pos)` to the score of every
//! key at or before the query. Keys after the query, and queries outside
//! the sequence, get `-inf`: when the bias is on it is also the mask.

use prefill_core::{PrefillError, Result};

/// One slope per query head.
#[derive(Debug, Clone, PartialEq)]
pub struct AlibiSlopes(Vec<f32>);

impl AlibiSlopes {
    pub fn new(slopes: Vec<f32>) -> Self {
        Self(slopes)
    }

    /// Geometric slope schedule from the ALiBi paper.
    ///
    /// For a power-of-two head count `n` the slopes are `2^(-8i/n)`,
    /// `i = 1..=n`. Other counts take the schedule of the next lower power
    /// of two and fill the rest with every other slope of the doubled one.
    pub fn standard(num_heads: usize) -> Result<Self> {
        if num_heads == 0 {
            return Err(PrefillError::InvalidArgument(
                "alibi slopes need at least one head".into(),
            ));
        }
        let closest = 1usize << num_heads.ilog2();
        let base = 2f64.powf(-(2f64.powf(-((closest as f64).log2() - 3.0))));
        let mut slopes: Vec<f32> = (1..=closest)
            .map(|p| base.powi(p as i32) as f32)
            .collect();
        if closest != num_heads {
            let extra_base = 2f64.powf(-(2f64.powf(-((2.0 * closest as f64).log2() - 3.0))));
            let remaining = closest.min(num_heads - closest);
            slopes.extend(
                (0..remaining).map(|i| extra_base.powi((2 * i + 1) as i32) as f32),
            );
        }
        Ok(Self(slopes))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn slope(&self, head: usize) -> f32 {
        self.0[head]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }
}

/// Bias of one head within one sequence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearBias {
    pub slope: f32,
    /// Cached plus fresh tokens of the sequence.
    pub total_length: usize,
}

impl LinearBias {
    pub fn new(slope: f32, total_length: usize) -> Self {
        Self {
            slope,
            total_length,
        }
    }

    /// Additive bias for a query at absolute position `q_pos` attending to
    /// a key at absolute position `k_pos`.
    #[inline]
    pub fn bias(&self, q_pos: usize, k_pos: usize) -> f32 {
        if k_pos <= q_pos && q_pos < self.total_length {
            self.slope * (k_pos as f32 - q_pos as f32)
        } else {
            f32::NEG_INFINITY
        }
    }
}
