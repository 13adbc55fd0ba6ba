//! Physical layouts of the paged key and value caches.
//!
//! Keys split the head dimension into groups of `x` consecutive features so
//! that one slot's group is contiguous:
//! `[num_blocks, num_kv_heads, head_dim / x, block_size, x]`.
//! Values keep the head dimension whole:
//! `[num_blocks, num_kv_heads, head_dim, block_size]`.

use prefill_core::{PrefillError, Result};

fn contiguous_strides<const N: usize>(shape: &[usize; N]) -> [usize; N] {
    let mut strides = [1usize; N];
    for i in (0..N.saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

fn check_rank<const N: usize>(shape: &[usize], what: &str) -> Result<[usize; N]> {
    let dims: [usize; N] = shape.try_into().map_err(|_| {
        PrefillError::InvalidArgument(format!(
            "{what} must be {N}D, got shape {shape:?}"
        ))
    })?;
    if dims.contains(&0) {
        return Err(PrefillError::InvalidArgument(format!(
            "{what} has a zero-sized dimension: {shape:?}"
        )));
    }
    Ok(dims)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyCacheLayout {
    pub num_blocks: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub block_size: usize,
    pub x: usize,
    strides: [usize; 5],
}

impl KeyCacheLayout {
    pub fn new(
        num_blocks: usize,
        num_kv_heads: usize,
        head_dim: usize,
        block_size: usize,
        x: usize,
    ) -> Result<Self> {
        if x == 0 || head_dim % x != 0 {
            return Err(PrefillError::InvalidArgument(format!(
                "key cache split x={x} must divide head_dim={head_dim}"
            )));
        }
        Self::from_shape(&[num_blocks, num_kv_heads, head_dim / x, block_size, x])
    }

    pub fn from_shape(shape: &[usize]) -> Result<Self> {
        let dims = check_rank::<5>(shape, "key cache")?;
        let [num_blocks, num_kv_heads, groups, block_size, x] = dims;
        Ok(Self {
            num_blocks,
            num_kv_heads,
            head_dim: groups * x,
            block_size,
            x,
            strides: contiguous_strides(&dims),
        })
    }

    pub fn shape(&self) -> [usize; 5] {
        [
            self.num_blocks,
            self.num_kv_heads,
            self.head_dim / self.x,
            self.block_size,
            self.x,
        ]
    }

    pub fn strides(&self) -> [usize; 5] {
        self.strides
    }

    pub fn numel(&self) -> usize {
        self.shape().iter().product()
    }

    /// Flat index of `feature` of the key stored at (`block`, `slot`) for
    /// `kv_head`.
    #[inline]
    pub fn offset(&self, block: usize, kv_head: usize, feature: usize, slot: usize) -> usize {
        let [s_block, s_head, s_group, s_slot, s_x] = self.strides;
        block * s_block
            + kv_head * s_head
            + (feature / self.x) * s_group
            + slot * s_slot
            + (feature % self.x) * s_x
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueCacheLayout {
    pub num_blocks: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub block_size: usize,
    strides: [usize; 4],
}

impl ValueCacheLayout {
    pub fn new(
        num_blocks: usize,
        num_kv_heads: usize,
        head_dim: usize,
        block_size: usize,
    ) -> Result<Self> {
        Self::from_shape(&[num_blocks, num_kv_heads, head_dim, block_size])
    }

    pub fn from_shape(shape: &[usize]) -> Result<Self> {
        let dims = check_rank::<4>(shape, "value cache")?;
        let [num_blocks, num_kv_heads, head_dim, block_size] = dims;
        Ok(Self {
            num_blocks,
            num_kv_heads,
            head_dim,
            block_size,
            strides: contiguous_strides(&dims),
        })
    }

    pub fn shape(&self) -> [usize; 4] {
        [self.num_blocks, self.num_kv_heads, self.head_dim, self.block_size]
    }

    pub fn strides(&self) -> [usize; 4] {
        self.strides
    }

    pub fn numel(&self) -> usize {
        self.shape().iter().product()
    }

    #[inline]
    pub fn offset(&self, block: usize, kv_head: usize, feature: usize, slot: usize) -> usize {
        let [s_block, s_head, s_feature, s_slot] = self.strides;
        block * s_block + kv_head * s_head + feature * s_feature + slot * s_slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout_strides() {
        // [blocks=3, heads=2, d/x=4, block_size=16, x=8]
        let layout = KeyCacheLayout::new(3, 2, 32, 16, 8).unwrap();
        assert_eq!(layout.shape(), [3, 2, 4, 16, 8]);
        assert_eq!(layout.strides(), [1024, 512, 128, 8, 1]);
        assert_eq!(layout.numel(), 3 * 1024);
    }

    #[test]
    fn test_key_offset_splits_feature() {
        let layout = KeyCacheLayout::new(3, 2, 32, 16, 8).unwrap();
        // feature 11 = group 1, lane 3
        assert_eq!(layout.offset(2, 1, 11, 5), 2 * 1024 + 512 + 128 + 5 * 8 + 3);
        // consecutive features within a group are adjacent
        assert_eq!(layout.offset(0, 0, 1, 0), layout.offset(0, 0, 0, 0) + 1);
        // crossing a group boundary jumps a whole block_size * x
        assert_eq!(layout.offset(0, 0, 8, 0), layout.offset(0, 0, 7, 0) + 128 - 7);
    }

    #[test]
    fn test_value_offset_contiguous_feature() {
        let layout = ValueCacheLayout::new(3, 2, 32, 16).unwrap();
        assert_eq!(layout.strides(), [1024, 512, 16, 1]);
        assert_eq!(layout.offset(1, 1, 3, 7), 1024 + 512 + 48 + 7);
    }

    #[test]
    fn test_bad_split_rejected() {
        assert!(KeyCacheLayout::new(1, 1, 12, 16, 8).is_err());
        assert!(KeyCacheLayout::new(1, 1, 16, 16, 0).is_err());
    }

    #[test]
    fn test_wrong_rank_rejected() {
        assert!(KeyCacheLayout::from_shape(&[1, 2, 3, 4]).is_err());
        assert!(ValueCacheLayout::from_shape(&[1, 2, 3, 4, 5]).is_err());
        assert!(ValueCacheLayout::from_shape(&[1, 0, 3, 4]).is_err());
    }
}
