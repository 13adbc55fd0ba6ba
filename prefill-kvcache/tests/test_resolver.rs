use prefill_core::BlockTable;
use prefill_kvcache::{BlockTableResolver, CacheSlot, PagedKvCache};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

/// Value stored for (block, slot, head, feature): unique per physical location.
fn pattern(block: usize, slot: usize, head: usize, feature: usize) -> f32 {
    (block * 100_000 + slot * 1_000 + head * 100 + feature) as f32
}

fn filled_cache(num_blocks: usize, num_kv_heads: usize, head_dim: usize, block_size: usize) -> PagedKvCache {
    let mut cache = PagedKvCache::new(num_blocks, num_kv_heads, head_dim, block_size, 8).unwrap();
    for block in 0..num_blocks {
        for slot in 0..block_size {
            for head in 0..num_kv_heads {
                let key: Vec<f32> = (0..head_dim).map(|d| pattern(block, slot, head, d)).collect();
                let value: Vec<f32> = key.iter().map(|k| -k).collect();
                cache
                    .write_token(CacheSlot { block, slot }, head, &key, &value)
                    .unwrap();
            }
        }
    }
    cache
}

#[test]
fn test_resolved_rows_match_block_pattern() {
    let num_blocks = 24;
    let block_size = 4;
    let num_kv_heads = 2;
    let head_dim = 16;
    let cache = filled_cache(num_blocks, num_kv_heads, head_dim, block_size);

    // Two sequences sharing a shuffled pool
    let mut ids: Vec<u32> = (0..num_blocks as u32).collect();
    ids.shuffle(&mut StdRng::seed_from_u64(7));
    let table = BlockTable::from_rows(&[ids[..5].to_vec(), ids[5..12].to_vec()]);
    let context_lens = [19usize, 27];

    let resolver =
        BlockTableResolver::new(&table, cache.key_layout(), cache.value_layout()).unwrap();
    let mut key = vec![0.0; head_dim];
    let mut value = vec![0.0; head_dim];
    for (seq, &ctx) in context_lens.iter().enumerate() {
        for pos in 0..ctx {
            let slot = resolver.slot(seq, pos).unwrap();
            let expected_block = table.row(seq)[pos / block_size] as usize;
            assert_eq!(slot.block, expected_block);
            assert_eq!(slot.slot, pos % block_size);
            for head in 0..num_kv_heads {
                resolver.gather_key(cache.key_data(), slot, head, &mut key);
                resolver.gather_value(cache.value_data(), slot, head, &mut value);
                for d in 0..head_dim {
                    let want = pattern(expected_block, pos % block_size, head, d);
                    assert_eq!(key[d], want, "key seq={seq} pos={pos} head={head} d={d}");
                    assert_eq!(value[d], -want, "value seq={seq} pos={pos} head={head} d={d}");
                }
            }
        }
    }
}

#[test]
fn test_write_sequence_roundtrip_through_resolver() {
    let block_size = 4;
    let head_dim = 16;
    let mut cache = PagedKvCache::new(8, 1, head_dim, block_size, 8).unwrap();
    let blocks = vec![6u32, 0, 3];
    let num_tokens = 10;
    let keys: Vec<f32> = (0..num_tokens * head_dim).map(|i| i as f32 * 0.5).collect();
    let values: Vec<f32> = (0..num_tokens * head_dim).map(|i| i as f32 * -0.25).collect();
    cache.write_sequence(&blocks, 0, &keys, &values).unwrap();

    let table = BlockTable::from_rows(&[blocks]);
    let resolver =
        BlockTableResolver::new(&table, cache.key_layout(), cache.value_layout()).unwrap();
    let mut row = vec![0.0; head_dim];
    for pos in 0..num_tokens {
        let slot = resolver.slot(0, pos).unwrap();
        resolver.gather_key(cache.key_data(), slot, 0, &mut row);
        assert_eq!(row, keys[pos * head_dim..(pos + 1) * head_dim]);
        resolver.gather_value(cache.value_data(), slot, 0, &mut row);
        assert_eq!(row, values[pos * head_dim..(pos + 1) * head_dim]);
    }
}
