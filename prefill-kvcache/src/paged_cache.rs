//! Host-side paged KV cache arena.
//!
//! Owns one key and one value buffer in the kernel's physical layouts and
//! knows how to scatter token rows into them. Deciding which physical
//! blocks a sequence gets is the caller's job; this type only stores.

use prefill_core::{PrefillError, Result};

use crate::layout::{KeyCacheLayout, ValueCacheLayout};
use crate::resolver::CacheSlot;

pub struct PagedKvCache {
    key_layout: KeyCacheLayout,
    value_layout: ValueCacheLayout,
    key: Vec<f32>,
    value: Vec<f32>,
}

impl PagedKvCache {
    /// Create a zeroed cache.
    ///
    /// - `num_blocks`: physical blocks in the pool
    /// - `block_size`: token slots per block (typically 16)
    /// - `x`: key feature split (typically 8)
    pub fn new(
        num_blocks: usize,
        num_kv_heads: usize,
        head_dim: usize,
        block_size: usize,
        x: usize,
    ) -> Result<Self> {
        let key_layout = KeyCacheLayout::new(num_blocks, num_kv_heads, head_dim, block_size, x)?;
        let value_layout = ValueCacheLayout::new(num_blocks, num_kv_heads, head_dim, block_size)?;
        Ok(Self {
            key: vec![0.0; key_layout.numel()],
            value: vec![0.0; value_layout.numel()],
            key_layout,
            value_layout,
        })
    }

    pub fn key_layout(&self) -> &KeyCacheLayout {
        &self.key_layout
    }

    pub fn value_layout(&self) -> &ValueCacheLayout {
        &self.value_layout
    }

    pub fn key_data(&self) -> &[f32] {
        &self.key
    }

    pub fn value_data(&self) -> &[f32] {
        &self.value
    }

    pub fn block_size(&self) -> usize {
        self.key_layout.block_size
    }

    pub fn num_blocks(&self) -> usize {
        self.key_layout.num_blocks
    }

    /// Hand the buffers over as `(key, value)`.
    pub fn into_parts(self) -> (Vec<f32>, Vec<f32>) {
        (self.key, self.value)
    }

    /// Write one token's key and value rows (`head_dim` each) for `kv_head`.
    pub fn write_token(
        &mut self,
        slot: CacheSlot,
        kv_head: usize,
        key_row: &[f32],
        value_row: &[f32],
    ) -> Result<()> {
        let head_dim = self.key_layout.head_dim;
        if key_row.len() != head_dim || value_row.len() != head_dim {
            return Err(PrefillError::ShapeMismatch {
                expected: vec![head_dim],
                got: vec![key_row.len(), value_row.len()],
            });
        }
        if slot.block >= self.num_blocks()
            || slot.slot >= self.block_size()
            || kv_head >= self.key_layout.num_kv_heads
        {
            return Err(PrefillError::InvalidArgument(format!(
                "slot {slot:?} head {kv_head} outside cache of {} blocks x {} slots x {} heads",
                self.num_blocks(),
                self.block_size(),
                self.key_layout.num_kv_heads
            )));
        }
        for d in 0..head_dim {
            let k_off = self.key_layout.offset(slot.block, kv_head, d, slot.slot);
            let v_off = self.value_layout.offset(slot.block, kv_head, d, slot.slot);
            self.key[k_off] = key_row[d];
            self.value[v_off] = value_row[d];
        }
        Ok(())
    }

    /// Scatter a run of tokens into the blocks listed in `block_ids`.
    ///
    /// `keys`/`values` are `[num_tokens, num_kv_heads, head_dim]`; token `t`
    /// lands at logical position `start_pos + t`.
    pub fn write_sequence(
        &mut self,
        block_ids: &[u32],
        start_pos: usize,
        keys: &[f32],
        values: &[f32],
    ) -> Result<()> {
        let head_dim = self.key_layout.head_dim;
        let num_kv_heads = self.key_layout.num_kv_heads;
        let row = num_kv_heads * head_dim;
        if keys.len() != values.len() || keys.len() % row != 0 {
            return Err(PrefillError::ShapeMismatch {
                expected: vec![keys.len() / row.max(1), num_kv_heads, head_dim],
                got: vec![keys.len(), values.len()],
            });
        }
        let block_size = self.block_size();
        for t in 0..keys.len() / row {
            let pos = start_pos + t;
            let block = *block_ids.get(pos / block_size).ok_or_else(|| {
                PrefillError::InvalidBlockTable(format!(
                    "position {pos} needs logical block {}, only {} assigned",
                    pos / block_size,
                    block_ids.len()
                ))
            })? as usize;
            let slot = CacheSlot {
                block,
                slot: pos % block_size,
            };
            for h in 0..num_kv_heads {
                let start = t * row + h * head_dim;
                self.write_token(
                    slot,
                    h,
                    &keys[start..start + head_dim],
                    &values[start..start + head_dim],
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_token_lands_in_layout() {
        let mut cache = PagedKvCache::new(4, 1, 16, 4, 8).unwrap();
        let key: Vec<f32> = (0..16).map(|i| i as f32).collect();
        let value: Vec<f32> = (0..16).map(|i| 100.0 + i as f32).collect();
        let slot = CacheSlot { block: 2, slot: 3 };
        cache.write_token(slot, 0, &key, &value).unwrap();

        let kl = *cache.key_layout();
        let vl = *cache.value_layout();
        for d in 0..16 {
            assert_eq!(cache.key_data()[kl.offset(2, 0, d, 3)], d as f32);
            assert_eq!(cache.value_data()[vl.offset(2, 0, d, 3)], 100.0 + d as f32);
        }
        let written = cache.key_data().iter().filter(|&&v| v != 0.0).count();
        assert_eq!(written, 15); // feature 0 is 0.0
    }

    #[test]
    fn test_write_token_out_of_range() {
        let mut cache = PagedKvCache::new(2, 1, 16, 4, 8).unwrap();
        let row = vec![1.0; 16];
        assert!(cache.write_token(CacheSlot { block: 2, slot: 0 }, 0, &row, &row).is_err());
        assert!(cache.write_token(CacheSlot { block: 0, slot: 4 }, 0, &row, &row).is_err());
        assert!(cache.write_token(CacheSlot { block: 0, slot: 0 }, 1, &row, &row).is_err());
        assert!(cache.write_token(CacheSlot { block: 0, slot: 0 }, 0, &row[..8], &row).is_err());
    }

    #[test]
    fn test_write_sequence_needs_blocks() {
        let mut cache = PagedKvCache::new(4, 1, 16, 4, 8).unwrap();
        let rows = vec![1.0; 5 * 16];
        // 5 tokens need 2 blocks of 4
        assert!(cache.write_sequence(&[3], 0, &rows, &rows).is_err());
        assert!(cache.write_sequence(&[3, 1], 0, &rows, &rows).is_ok());
    }
}
