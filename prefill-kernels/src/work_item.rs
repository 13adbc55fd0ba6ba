//! One cell of the launch grid.

use prefill_core::SequenceDescriptor;
use prefill_kvcache::BlockTableResolver;

use crate::bias::LinearBias;
use crate::launch::{KernelVariant, LaunchPlan, PrefillInputs};
use crate::prefix::fold_cached_prefix;
use crate::softmax::TileAccumulator;
use crate::suffix::fold_fresh_suffix;
use crate::tile::{KvTile, QueryTile, TokenLayout, dot};

/// Grid coordinates: which sequence, which query head, which query tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkItem {
    pub seq: usize,
    pub head: usize,
    pub query_tile: usize,
}

/// Rows produced by one work item.
///
/// `rows` is `[num_rows, head_dim]` for tokens `first_token..` of `head`.
#[derive(Debug, Clone)]
pub struct WorkItemOutput {
    pub item: WorkItem,
    pub first_token: usize,
    pub rows: Vec<f32>,
}

impl WorkItemOutput {
    pub fn num_rows(&self, head_dim: usize) -> usize {
        self.rows.len() / head_dim
    }

    /// Copy the rows into their home in a `[num_tokens, num_heads, head_dim]`
    /// output buffer.
    pub fn write(&self, out: &mut [f32], layout: &TokenLayout) {
        for (r, row) in self.rows.chunks_exact(layout.head_dim).enumerate() {
            let start = layout.offset(self.first_token + r, self.item.head);
            out[start..start + layout.head_dim].copy_from_slice(row);
        }
    }
}

/// Per-item constants shared by both phases.
pub(crate) struct WorkContext<'a> {
    pub inputs: &'a PrefillInputs<'a>,
    pub seq_idx: usize,
    pub seq: SequenceDescriptor,
    pub kv_head: usize,
    pub scale: f32,
    pub bias: Option<LinearBias>,
}

impl WorkContext<'_> {
    #[inline]
    pub fn score(&self, q_row: &[f32], key: &[f32], q_pos: usize, k_pos: usize) -> f32 {
        let score = dot(q_row, key) * self.scale;
        match self.bias {
            Some(bias) => score + bias.bias(q_pos, k_pos),
            None => score,
        }
    }
}

/// Run both phases for `item` and return the accumulator before
/// normalization, with the query tile it covers.
///
/// `None` when the tile holds no fresh token of its sequence.
pub fn accumulate(
    inputs: &PrefillInputs<'_>,
    resolver: &BlockTableResolver<'_>,
    plan: &LaunchPlan,
    item: WorkItem,
) -> Option<(QueryTile, TileAccumulator)> {
    let seq = inputs.sequences[item.seq];
    let shape = inputs.shape;
    let q = QueryTile::load(
        inputs.q,
        &shape.q_layout(),
        &seq,
        item.head,
        item.query_tile,
        plan.tile_width,
    );
    if q.is_empty() {
        return None;
    }

    let bias = match (plan.variant, inputs.alibi_slopes) {
        (KernelVariant::Alibi, Some(slopes)) => {
            Some(LinearBias::new(slopes[item.head], seq.total_length))
        }
        _ => None,
    };
    let ctx = WorkContext {
        inputs,
        seq_idx: item.seq,
        seq,
        kv_head: item.head / shape.queries_per_kv(),
        scale: plan.scale,
        bias,
    };

    let mut acc = TileAccumulator::new(q.valid_rows, shape.head_dim, plan.normalization);
    let mut kv = KvTile::new(plan.tile_width, shape.head_dim);
    let mut scores = Vec::with_capacity(q.valid_rows * plan.tile_width);
    fold_cached_prefix(&ctx, resolver, &q, &mut acc, &mut kv, &mut scores);
    fold_fresh_suffix(&ctx, &q, &mut acc, &mut kv, &mut scores);
    Some((q, acc))
}

pub fn run_work_item(
    inputs: &PrefillInputs<'_>,
    resolver: &BlockTableResolver<'_>,
    plan: &LaunchPlan,
    item: WorkItem,
) -> Option<WorkItemOutput> {
    let (q, acc) = accumulate(inputs, resolver, plan, item)?;
    let seq = &inputs.sequences[item.seq];
    Some(WorkItemOutput {
        item,
        first_token: seq.start_offset + q.first_row,
        rows: acc.finish(),
    })
}
