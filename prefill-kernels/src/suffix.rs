//! Fresh-suffix phase: keys and values come straight from this step's
//! buffers, causally masked against the query's fresh position.

use crate::softmax::TileAccumulator;
use crate::tile::{KvTile, QueryTile};
use crate::work_item::WorkContext;

/// Fold fresh keys `0..=i` into the row of fresh query `i`.
///
/// Key tiles stop at the end of the query tile: nothing later can pass the
/// causal mask for any row in it.
pub(crate) fn fold_fresh_suffix(
    ctx: &WorkContext<'_>,
    q: &QueryTile,
    acc: &mut TileAccumulator,
    kv: &mut KvTile,
    scores: &mut Vec<f32>,
) {
    let fresh_len = ctx.seq.fresh_len();
    let width = kv.width();
    if q.first_row >= fresh_len {
        return;
    }
    let kv_layout = ctx.inputs.shape.kv_layout();
    let end = fresh_len.min(q.first_row + width);
    for start_n in (0..end).step_by(width) {
        kv.clear();
        for col in 0..width.min(fresh_len - start_n) {
            let token = ctx.seq.start_offset + start_n + col;
            kv.key_mut(col)
                .copy_from_slice(kv_layout.row(ctx.inputs.k, token, ctx.kv_head));
            kv.value_mut(col)
                .copy_from_slice(kv_layout.row(ctx.inputs.v, token, ctx.kv_head));
            kv.valid[col] = true;
        }

        scores.clear();
        for r in 0..q.valid_rows {
            let q_row = q.row(r);
            let i = q.fresh_index(r);
            let q_pos = ctx.seq.absolute_position(i);
            for col in 0..width {
                let j = start_n + col;
                let score = if kv.valid[col] && j <= i {
                    ctx.score(q_row, kv.key(col), q_pos, ctx.seq.absolute_position(j))
                } else {
                    f32::NEG_INFINITY
                };
                scores.push(score);
            }
        }
        acc.fold_tile(scores, width, &kv.values);
    }
}
