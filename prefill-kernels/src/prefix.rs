//! Cached-prefix phase: keys and values come from the paged cache.

use prefill_kvcache::BlockTableResolver;

use crate::softmax::TileAccumulator;
use crate::tile::{KvTile, QueryTile};
use crate::work_item::WorkContext;

/// Fold every cached position `0..context_length` into `acc`, one
/// `kv.width()`-wide tile at a time.
///
/// Columns at or past `context_length` are masked to `-inf` before they
/// could be resolved; nothing past the cached prefix is ever looked up.
pub(crate) fn fold_cached_prefix(
    ctx: &WorkContext<'_>,
    resolver: &BlockTableResolver<'_>,
    q: &QueryTile,
    acc: &mut TileAccumulator,
    kv: &mut KvTile,
    scores: &mut Vec<f32>,
) {
    let context_len = ctx.seq.context_length;
    let width = kv.width();
    for start_n in (0..context_len).step_by(width) {
        kv.clear();
        for col in 0..width.min(context_len - start_n) {
            // Coverage of every position below context_len is checked at launch.
            let Some(slot) = resolver.slot(ctx.seq_idx, start_n + col) else {
                continue;
            };
            resolver.gather_key(ctx.inputs.k_cache, slot, ctx.kv_head, kv.key_mut(col));
            resolver.gather_value(ctx.inputs.v_cache, slot, ctx.kv_head, kv.value_mut(col));
            kv.valid[col] = true;
        }

        scores.clear();
        for r in 0..q.valid_rows {
            let q_row = q.row(r);
            let q_pos = ctx.seq.absolute_position(q.fresh_index(r));
            for col in 0..width {
                let score = if kv.valid[col] {
                    ctx.score(q_row, kv.key(col), q_pos, start_n + col)
                } else {
                    f32::NEG_INFINITY
                };
                scores.push(score);
            }
        }
        acc.fold_tile(scores, width, &kv.values);
    }
}
