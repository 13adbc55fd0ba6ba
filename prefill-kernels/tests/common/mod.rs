#![allow(dead_code)]

use prefill_core::{BlockTable, SequenceDescriptor};
use prefill_kernels::{AlibiSlopes, AttentionShape, PrefillInputs};
use prefill_kvcache::{KeyCacheLayout, PagedKvCache, ValueCacheLayout};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

/// Batch description: `(context_length, fresh_len)` per sequence.
pub struct FixtureSpec {
    pub lens: Vec<(usize, usize)>,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub block_size: usize,
    /// Unused token rows left after each sequence's fresh tokens.
    pub gap: usize,
    pub seed: u64,
}

impl Default for FixtureSpec {
    fn default() -> Self {
        Self {
            lens: vec![(5, 3)],
            num_heads: 4,
            num_kv_heads: 2,
            head_dim: 16,
            block_size: 4,
            gap: 0,
            seed: 0,
        }
    }
}

/// Random q/k/v plus a paged cache whose blocks are scattered over a
/// shuffled pool.
pub struct Fixture {
    pub shape: AttentionShape,
    pub q: Vec<f32>,
    pub k: Vec<f32>,
    pub v: Vec<f32>,
    pub k_cache: Vec<f32>,
    pub v_cache: Vec<f32>,
    pub key_layout: KeyCacheLayout,
    pub value_layout: ValueCacheLayout,
    pub table: BlockTable,
    pub seqs: Vec<SequenceDescriptor>,
    pub slopes: Option<Vec<f32>>,
}

pub fn random_vec(rng: &mut StdRng, n: usize) -> Vec<f32> {
    (0..n).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

impl Fixture {
    pub fn build(spec: &FixtureSpec) -> Self {
        let mut rng = StdRng::seed_from_u64(spec.seed);

        let mut seqs = Vec::with_capacity(spec.lens.len());
        let mut offset = 0;
        for &(ctx, fresh) in &spec.lens {
            seqs.push(SequenceDescriptor::new(offset, ctx, ctx + fresh));
            offset += fresh + spec.gap;
        }
        let shape = AttentionShape {
            num_tokens: offset,
            num_heads: spec.num_heads,
            num_kv_heads: spec.num_kv_heads,
            head_dim: spec.head_dim,
        };
        let q = random_vec(&mut rng, shape.q_layout().numel());
        let k = random_vec(&mut rng, shape.kv_layout().numel());
        let v = random_vec(&mut rng, shape.kv_layout().numel());

        let blocks_needed: Vec<usize> = spec
            .lens
            .iter()
            .map(|&(ctx, _)| ctx.div_ceil(spec.block_size))
            .collect();
        let num_blocks = blocks_needed.iter().sum::<usize>() + 2;
        let mut ids: Vec<u32> = (0..num_blocks as u32).collect();
        ids.shuffle(&mut rng);

        let mut cache = PagedKvCache::new(
            num_blocks,
            spec.num_kv_heads,
            spec.head_dim,
            spec.block_size,
            8,
        )
        .unwrap();
        let mut rows = Vec::with_capacity(spec.lens.len());
        let mut next = 0;
        for (&(ctx, _), &n) in spec.lens.iter().zip(&blocks_needed) {
            let row = ids[next..next + n].to_vec();
            next += n;
            let numel = ctx * spec.num_kv_heads * spec.head_dim;
            let keys = random_vec(&mut rng, numel);
            let values = random_vec(&mut rng, numel);
            cache.write_sequence(&row, 0, &keys, &values).unwrap();
            rows.push(row);
        }

        let key_layout = *cache.key_layout();
        let value_layout = *cache.value_layout();
        let (k_cache, v_cache) = cache.into_parts();
        Self {
            shape,
            q,
            k,
            v,
            k_cache,
            v_cache,
            key_layout,
            value_layout,
            table: BlockTable::from_rows(&rows),
            seqs,
            slopes: None,
        }
    }

    pub fn with_alibi(mut self) -> Self {
        let slopes = AlibiSlopes::standard(self.shape.num_heads).unwrap();
        self.slopes = Some(slopes.as_slice().to_vec());
        self
    }

    pub fn inputs(&self) -> PrefillInputs<'_> {
        PrefillInputs {
            shape: self.shape,
            q: &self.q,
            k: &self.k,
            v: &self.v,
            k_cache: &self.k_cache,
            v_cache: &self.v_cache,
            key_layout: self.key_layout,
            value_layout: self.value_layout,
            block_table: &self.table,
            sequences: &self.seqs,
            alibi_slopes: self.slopes.as_deref(),
        }
    }

    /// Flat output indices written for some (sequence, head, fresh token).
    pub fn owned_rows(&self) -> Vec<bool> {
        let layout = self.shape.q_layout();
        let mut owned = vec![false; layout.numel()];
        for seq in &self.seqs {
            for i in 0..seq.fresh_len() {
                for h in 0..self.shape.num_heads {
                    let start = layout.offset(seq.start_offset + i, h);
                    owned[start..start + layout.head_dim].fill(true);
                }
            }
        }
        owned
    }
}

pub fn assert_close(got: &[f32], want: &[f32], tol: f32, what: &str) {
    assert_eq!(got.len(), want.len(), "{what}: length");
    for (i, (g, w)) in got.iter().zip(want).enumerate() {
        assert!(
            (g - w).abs() <= tol,
            "{what}: mismatch at {i}: got={g} want={w} diff={}",
            (g - w).abs()
        );
    }
}
