//! Dense reference attention.
//!
//! Gathers each sequence's full key/value history (cached prefix through the
//! block table, then fresh tokens) and runs a plain softmax over every key
//! at or before the query. No tiling, no streaming; used as the oracle for
//! the fused kernel.

use prefill_core::Result;
use prefill_kvcache::BlockTableResolver;

use crate::launch::PrefillInputs;
use crate::tile::dot;

/// Reference output, `[num_tokens, num_heads, head_dim]`. Rows that belong
/// to no fresh token are zero.
pub fn dense_context_attention(inputs: &PrefillInputs<'_>) -> Result<Vec<f32>> {
    inputs.validate()?;
    let resolver = inputs.resolver()?;
    let shape = inputs.shape;
    let head_dim = shape.head_dim;
    let q_layout = shape.q_layout();
    let scale = 1.0 / (head_dim as f32).sqrt();

    let mut out = vec![0.0f32; q_layout.numel()];
    for (seq_idx, seq) in inputs.sequences.iter().enumerate() {
        for head in 0..shape.num_heads {
            let kv_head = head / shape.queries_per_kv();
            let (keys, values) = gather_history(inputs, &resolver, seq_idx, kv_head);
            for i in 0..seq.fresh_len() {
                let token = seq.start_offset + i;
                let q_row = q_layout.row(inputs.q, token, head);
                let q_pos = seq.absolute_position(i);

                let scores: Vec<f32> = (0..=q_pos)
                    .map(|k_pos| {
                        let s = dot(q_row, &keys[k_pos * head_dim..(k_pos + 1) * head_dim]) * scale;
                        match inputs.alibi_slopes {
                            Some(slopes) => s + slopes[head] * (k_pos as f32 - q_pos as f32),
                            None => s,
                        }
                    })
                    .collect();
                let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let weights: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
                let sum: f32 = weights.iter().sum();

                let start = q_layout.offset(token, head);
                let row = &mut out[start..start + head_dim];
                for (w, v) in weights.iter().zip(values.chunks_exact(head_dim)) {
                    for d in 0..head_dim {
                        row[d] += w * v[d];
                    }
                }
                for x in row.iter_mut() {
                    *x /= sum;
                }
            }
        }
    }
    Ok(out)
}

/// Contiguous `[total_length, head_dim]` keys and values of one sequence.
fn gather_history(
    inputs: &PrefillInputs<'_>,
    resolver: &BlockTableResolver<'_>,
    seq_idx: usize,
    kv_head: usize,
) -> (Vec<f32>, Vec<f32>) {
    let seq = inputs.sequences[seq_idx];
    let head_dim = inputs.shape.head_dim;
    let mut keys = vec![0.0f32; seq.total_length * head_dim];
    let mut values = vec![0.0f32; seq.total_length * head_dim];

    for pos in 0..seq.context_length {
        if let Some(slot) = resolver.slot(seq_idx, pos) {
            let range = pos * head_dim..(pos + 1) * head_dim;
            resolver.gather_key(inputs.k_cache, slot, kv_head, &mut keys[range.clone()]);
            resolver.gather_value(inputs.v_cache, slot, kv_head, &mut values[range]);
        }
    }
    let kv_layout = inputs.shape.kv_layout();
    for i in 0..seq.fresh_len() {
        let pos = seq.absolute_position(i);
        let range = pos * head_dim..(pos + 1) * head_dim;
        keys[range.clone()].copy_from_slice(kv_layout.row(inputs.k, seq.start_offset + i, kv_head));
        values[range].copy_from_slice(kv_layout.row(inputs.v, seq.start_offset + i, kv_head));
    }
    (keys, values)
}
