//! Block-table address resolution.
//!
//! Maps a sequence's logical cache position to the physical block and slot
//! holding it, then to flat key/value offsets. Callers only resolve
//! positions below the sequence's cached length; anything past that is
//! masked before a read could happen.

use prefill_core::{BlockTable, PrefillError, Result};

use crate::layout::{KeyCacheLayout, ValueCacheLayout};

/// Physical location of one cached token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSlot {
    pub block: usize,
    pub slot: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct BlockTableResolver<'a> {
    table: &'a BlockTable,
    key_layout: &'a KeyCacheLayout,
    value_layout: &'a ValueCacheLayout,
}

impl<'a> BlockTableResolver<'a> {
    pub fn new(
        table: &'a BlockTable,
        key_layout: &'a KeyCacheLayout,
        value_layout: &'a ValueCacheLayout,
    ) -> Result<Self> {
        if key_layout.block_size != value_layout.block_size
            || key_layout.num_blocks != value_layout.num_blocks
            || key_layout.num_kv_heads != value_layout.num_kv_heads
            || key_layout.head_dim != value_layout.head_dim
        {
            return Err(PrefillError::ShapeMismatch {
                expected: vec![
                    key_layout.num_blocks,
                    key_layout.num_kv_heads,
                    key_layout.head_dim,
                    key_layout.block_size,
                ],
                got: value_layout.shape().to_vec(),
            });
        }
        Ok(Self {
            table,
            key_layout,
            value_layout,
        })
    }

    pub fn block_size(&self) -> usize {
        self.key_layout.block_size
    }

    pub fn key_layout(&self) -> &KeyCacheLayout {
        self.key_layout
    }

    pub fn value_layout(&self) -> &ValueCacheLayout {
        self.value_layout
    }

    /// Physical block and slot of logical position `pos` in sequence `seq`.
    ///
    /// `None` when the table has no entry for `pos / block_size`.
    #[inline]
    pub fn slot(&self, seq: usize, pos: usize) -> Option<CacheSlot> {
        let block_size = self.block_size();
        self.table
            .physical_block(seq, pos / block_size)
            .map(|block| CacheSlot {
                block,
                slot: pos % block_size,
            })
    }

    #[inline]
    pub fn key_offset(&self, slot: CacheSlot, kv_head: usize, feature: usize) -> usize {
        self.key_layout.offset(slot.block, kv_head, feature, slot.slot)
    }

    #[inline]
    pub fn value_offset(&self, slot: CacheSlot, kv_head: usize, feature: usize) -> usize {
        self.value_layout.offset(slot.block, kv_head, feature, slot.slot)
    }

    pub fn key_address(&self, seq: usize, pos: usize, kv_head: usize, feature: usize) -> Option<usize> {
        self.slot(seq, pos).map(|s| self.key_offset(s, kv_head, feature))
    }

    pub fn value_address(
        &self,
        seq: usize,
        pos: usize,
        kv_head: usize,
        feature: usize,
    ) -> Option<usize> {
        self.slot(seq, pos).map(|s| self.value_offset(s, kv_head, feature))
    }

    /// Copy the key vector stored at `slot` into `dst` (`head_dim` long).
    pub fn gather_key(&self, cache: &[f32], slot: CacheSlot, kv_head: usize, dst: &mut [f32]) {
        for (d, out) in dst.iter_mut().enumerate() {
            *out = cache[self.key_offset(slot, kv_head, d)];
        }
    }

    /// Copy the value vector stored at `slot` into `dst` (`head_dim` long).
    pub fn gather_value(&self, cache: &[f32], slot: CacheSlot, kv_head: usize, dst: &mut [f32]) {
        let base = self.value_offset(slot, kv_head, 0);
        let stride = self.value_layout.strides()[2];
        for (d, out) in dst.iter_mut().enumerate() {
            *out = cache[base + d * stride];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layouts() -> (KeyCacheLayout, ValueCacheLayout) {
        (
            KeyCacheLayout::new(8, 2, 16, 4, 8).unwrap(),
            ValueCacheLayout::new(8, 2, 16, 4).unwrap(),
        )
    }

    #[test]
    fn test_slot_resolution() {
        let (k, v) = layouts();
        let table = BlockTable::from_rows(&[vec![5, 2, 7]]);
        let resolver = BlockTableResolver::new(&table, &k, &v).unwrap();
        assert_eq!(resolver.slot(0, 0), Some(CacheSlot { block: 5, slot: 0 }));
        assert_eq!(resolver.slot(0, 6), Some(CacheSlot { block: 2, slot: 2 }));
        assert_eq!(resolver.slot(0, 11), Some(CacheSlot { block: 7, slot: 3 }));
        assert_eq!(resolver.slot(0, 12), None);
    }

    #[test]
    fn test_addresses_follow_formula() {
        let (k, v) = layouts();
        let table = BlockTable::from_rows(&[vec![5, 2, 7]]);
        let resolver = BlockTableResolver::new(&table, &k, &v).unwrap();
        // pos 6 -> block 2, slot 2; feature 9 -> group 1, lane 1
        let [kb, kh, kg, ks, kx] = k.strides();
        assert_eq!(
            resolver.key_address(0, 6, 1, 9),
            Some(2 * kb + kh + kg + 2 * ks + kx)
        );
        let [vb, vh, vd, vs] = v.strides();
        assert_eq!(
            resolver.value_address(0, 6, 1, 9),
            Some(2 * vb + vh + 9 * vd + 2 * vs)
        );
    }

    #[test]
    fn test_mismatched_layouts_rejected() {
        let k = KeyCacheLayout::new(8, 2, 16, 4, 8).unwrap();
        let v = ValueCacheLayout::new(8, 2, 16, 8).unwrap();
        let table = BlockTable::from_rows(&[vec![0]]);
        assert!(BlockTableResolver::new(&table, &k, &v).is_err());
    }
}
