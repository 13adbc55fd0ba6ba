//! Launch driver: validation, tiling, grid construction and execution.

use rayon::prelude::*;
use tracing::{debug, trace};

use prefill_core::sequence::max_fresh_len;
use prefill_core::{
    BlockTable, DeviceCapability, KernelConfig, NUM_WARPS, NormalizationPolicy, PrefillError,
    Result, SUPPORTED_HEAD_DIMS, SequenceDescriptor,
};
use prefill_kvcache::{BlockTableResolver, KeyCacheLayout, ValueCacheLayout};

use crate::tile::TokenLayout;
use crate::work_item::{WorkItem, WorkItemOutput, run_work_item};

/// Head counts and head dim of one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionShape {
    pub num_tokens: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
}

impl AttentionShape {
    pub fn queries_per_kv(&self) -> usize {
        self.num_heads / self.num_kv_heads
    }

    pub fn q_layout(&self) -> TokenLayout {
        TokenLayout::new(self.num_tokens, self.num_heads, self.head_dim)
    }

    pub fn kv_layout(&self) -> TokenLayout {
        TokenLayout::new(self.num_tokens, self.num_kv_heads, self.head_dim)
    }
}

/// Host views of every buffer the kernel reads.
#[derive(Debug, Clone, Copy)]
pub struct PrefillInputs<'a> {
    pub shape: AttentionShape,
    pub q: &'a [f32],
    pub k: &'a [f32],
    pub v: &'a [f32],
    pub k_cache: &'a [f32],
    pub v_cache: &'a [f32],
    pub key_layout: KeyCacheLayout,
    pub value_layout: ValueCacheLayout,
    pub block_table: &'a BlockTable,
    pub sequences: &'a [SequenceDescriptor],
    pub alibi_slopes: Option<&'a [f32]>,
}

/// Check that query, key and value head dims agree and are supported.
pub fn check_head_dims(q: usize, k: usize, v: usize) -> Result<usize> {
    if q != k || k != v {
        return Err(PrefillError::HeadDimMismatch { q, k, v });
    }
    if !SUPPORTED_HEAD_DIMS.contains(&q) {
        return Err(PrefillError::UnsupportedHeadDim(q));
    }
    Ok(q)
}

fn check_len(what: &str, data: &[f32], expected: &[usize]) -> Result<()> {
    let numel: usize = expected.iter().product();
    if data.len() != numel {
        return Err(PrefillError::InvalidArgument(format!(
            "{what} holds {} elements, shape {expected:?} needs {numel}",
            data.len()
        )));
    }
    Ok(())
}

impl<'a> PrefillInputs<'a> {
    pub fn validate(&self) -> Result<()> {
        let shape = self.shape;
        if !SUPPORTED_HEAD_DIMS.contains(&shape.head_dim) {
            return Err(PrefillError::UnsupportedHeadDim(shape.head_dim));
        }
        if shape.num_kv_heads == 0 || shape.num_heads % shape.num_kv_heads != 0 {
            return Err(PrefillError::InvalidArgument(format!(
                "num_heads {} is not a multiple of num_kv_heads {}",
                shape.num_heads, shape.num_kv_heads
            )));
        }
        check_len("q", self.q, &[shape.num_tokens, shape.num_heads, shape.head_dim])?;
        check_len("k", self.k, &[shape.num_tokens, shape.num_kv_heads, shape.head_dim])?;
        check_len("v", self.v, &[shape.num_tokens, shape.num_kv_heads, shape.head_dim])?;

        let key_layout = &self.key_layout;
        if key_layout.num_kv_heads != shape.num_kv_heads || key_layout.head_dim != shape.head_dim {
            return Err(PrefillError::ShapeMismatch {
                expected: vec![shape.num_kv_heads, shape.head_dim],
                got: vec![key_layout.num_kv_heads, key_layout.head_dim],
            });
        }
        check_len("k_cache", self.k_cache, &key_layout.shape())?;
        check_len("v_cache", self.v_cache, &self.value_layout.shape())?;
        // Also checks that the two caches agree with each other.
        self.resolver()?;

        if let Some(slopes) = self.alibi_slopes {
            if slopes.len() != shape.num_heads {
                return Err(PrefillError::ShapeMismatch {
                    expected: vec![shape.num_heads],
                    got: vec![slopes.len()],
                });
            }
        }

        if self.block_table.num_seqs() < self.sequences.len() {
            return Err(PrefillError::InvalidBlockTable(format!(
                "{} rows for {} sequences",
                self.block_table.num_seqs(),
                self.sequences.len()
            )));
        }
        for (index, seq) in self.sequences.iter().enumerate() {
            seq.validate(index)?;
            if seq.start_offset + seq.fresh_len() > shape.num_tokens {
                return Err(PrefillError::InvalidSequence {
                    index,
                    reason: format!(
                        "fresh tokens {}..{} run past the {} token buffer",
                        seq.start_offset,
                        seq.start_offset + seq.fresh_len(),
                        shape.num_tokens
                    ),
                });
            }
            self.block_table.check_coverage(
                index,
                seq.context_length,
                key_layout.block_size,
                key_layout.num_blocks,
            )?;
        }
        Ok(())
    }

    pub fn resolver(&self) -> Result<BlockTableResolver<'_>> {
        BlockTableResolver::new(self.block_table, &self.key_layout, &self.value_layout)
    }
}

/// Which scoring path the kernel runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelVariant {
    /// Length mask on the prefix, causal mask on the suffix.
    Plain,
    /// Per-head linear bias, which also carries the masking.
    Alibi,
}

/// `(sequence, head, query tile)` index space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grid {
    pub num_seqs: usize,
    pub num_heads: usize,
    pub num_query_tiles: usize,
}

impl Grid {
    pub fn len(&self) -> usize {
        self.num_seqs * self.num_heads * self.num_query_tiles
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Work item at flat index `index`, query tiles varying fastest.
    pub fn item(&self, index: usize) -> WorkItem {
        let query_tile = index % self.num_query_tiles;
        let rest = index / self.num_query_tiles;
        WorkItem {
            seq: rest / self.num_heads,
            head: rest % self.num_heads,
            query_tile,
        }
    }

    pub fn items(&self) -> impl Iterator<Item = WorkItem> + '_ {
        (0..self.len()).map(|i| self.item(i))
    }
}

/// Constants resolved once per call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LaunchPlan {
    pub scale: f32,
    pub tile_width: usize,
    pub num_warps: usize,
    pub grid: Grid,
    pub variant: KernelVariant,
    pub normalization: NormalizationPolicy,
}

impl LaunchPlan {
    /// Validate `inputs` and derive scale, tile width and grid.
    pub fn new(
        inputs: &PrefillInputs<'_>,
        capability: DeviceCapability,
        config: &KernelConfig,
    ) -> Result<Self> {
        config.validate()?;
        inputs.validate()?;

        let tile_width = config.tile_width.unwrap_or_else(|| capability.tile_width());
        let max_fresh = max_fresh_len(inputs.sequences);
        let max_input_len = match config.max_input_len {
            Some(limit) if limit < max_fresh => {
                return Err(PrefillError::InvalidArgument(format!(
                    "max_input_len {limit} is below the longest fresh run {max_fresh}"
                )));
            }
            Some(limit) => limit,
            None => max_fresh,
        };
        let variant = if inputs.alibi_slopes.is_some() {
            KernelVariant::Alibi
        } else {
            KernelVariant::Plain
        };

        Ok(Self {
            scale: 1.0 / (inputs.shape.head_dim as f32).sqrt(),
            tile_width,
            num_warps: NUM_WARPS,
            grid: Grid {
                num_seqs: inputs.sequences.len(),
                num_heads: inputs.shape.num_heads,
                num_query_tiles: max_input_len.div_ceil(tile_width),
            },
            variant,
            normalization: config.normalization,
        })
    }
}

/// Run every grid cell and collect the rows they produce.
///
/// Cells are independent and may run in any order; with `parallel` they
/// run on the rayon pool.
pub fn launch(
    inputs: &PrefillInputs<'_>,
    plan: &LaunchPlan,
    parallel: bool,
) -> Result<Vec<WorkItemOutput>> {
    let resolver = inputs.resolver()?;
    let grid = plan.grid;
    let outputs: Vec<WorkItemOutput> = if parallel {
        (0..grid.len())
            .into_par_iter()
            .filter_map(|i| run_work_item(inputs, &resolver, plan, grid.item(i)))
            .collect()
    } else {
        grid.items()
            .filter_map(|item| run_work_item(inputs, &resolver, plan, item))
            .collect()
    };
    Ok(outputs)
}

/// Validate, launch and write results into `out`
/// (`[num_tokens, num_heads, head_dim]`).
///
/// Only rows of fresh tokens are written. Nothing is written when
/// validation fails.
pub fn context_attention(
    inputs: &PrefillInputs<'_>,
    out: &mut [f32],
    capability: DeviceCapability,
    config: &KernelConfig,
) -> Result<LaunchPlan> {
    let plan = LaunchPlan::new(inputs, capability, config)?;
    let layout = inputs.shape.q_layout();
    if out.len() != layout.numel() {
        return Err(PrefillError::ShapeMismatch {
            expected: vec![layout.num_tokens, layout.num_heads, layout.head_dim],
            got: vec![out.len()],
        });
    }

    debug!(
        grid = ?plan.grid,
        tile_width = plan.tile_width,
        num_warps = plan.num_warps,
        variant = ?plan.variant,
        normalization = ?plan.normalization,
        scale = plan.scale,
        "launching prefill attention"
    );
    for (index, seq) in inputs.sequences.iter().enumerate() {
        trace!(
            index,
            start_offset = seq.start_offset,
            context_length = seq.context_length,
            fresh_len = seq.fresh_len(),
            "sequence"
        );
    }

    for output in launch(inputs, &plan, config.parallel)? {
        output.write(out, &layout);
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_head_dims() {
        assert_eq!(check_head_dims(64, 64, 64).unwrap(), 64);
        assert!(matches!(
            check_head_dims(64, 64, 32),
            Err(PrefillError::HeadDimMismatch { q: 64, k: 64, v: 32 })
        ));
        assert!(matches!(
            check_head_dims(96, 96, 96),
            Err(PrefillError::UnsupportedHeadDim(96))
        ));
    }

    #[test]
    fn test_grid_indexing_covers_every_cell_once() {
        let grid = Grid {
            num_seqs: 2,
            num_heads: 3,
            num_query_tiles: 4,
        };
        let items: Vec<WorkItem> = grid.items().collect();
        assert_eq!(items.len(), 24);
        assert_eq!(items[0], WorkItem { seq: 0, head: 0, query_tile: 0 });
        assert_eq!(items[5], WorkItem { seq: 0, head: 1, query_tile: 1 });
        assert_eq!(items[23], WorkItem { seq: 1, head: 2, query_tile: 3 });
        let unique: std::collections::HashSet<_> = items.iter().collect();
        assert_eq!(unique.len(), 24);
    }

    #[test]
    fn test_empty_grid() {
        let grid = Grid {
            num_seqs: 3,
            num_heads: 2,
            num_query_tiles: 0,
        };
        assert!(grid.is_empty());
        assert_eq!(grid.items().count(), 0);
    }
}
