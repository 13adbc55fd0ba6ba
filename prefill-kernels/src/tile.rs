//! Tile loading for the flattened fresh-token buffers.

use prefill_core::SequenceDescriptor;

/// Row-major `[num_tokens, num_heads, head_dim]` buffer geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenLayout {
    pub num_tokens: usize,
    pub num_heads: usize,
    pub head_dim: usize,
}

impl TokenLayout {
    pub fn new(num_tokens: usize, num_heads: usize, head_dim: usize) -> Self {
        Self {
            num_tokens,
            num_heads,
            head_dim,
        }
    }

    pub fn numel(&self) -> usize {
        self.num_tokens * self.num_heads * self.head_dim
    }

    /// Start of the `head_dim` row for (`token`, `head`).
    #[inline]
    pub fn offset(&self, token: usize, head: usize) -> usize {
        (token * self.num_heads + head) * self.head_dim
    }

    #[inline]
    pub fn row<'a>(&self, data: &'a [f32], token: usize, head: usize) -> &'a [f32] {
        let start = self.offset(token, head);
        &data[start..start + self.head_dim]
    }
}

/// Query rows of one (sequence, head, query tile) work item.
///
/// A tile spans `tile_width` fresh positions starting at `first_row`; only
/// the `valid_rows` that fall inside the sequence's fresh tokens are
/// materialized. The rest would load as zeros and are never written, and
/// since every reduction is per row they can simply be left out.
#[derive(Debug, Clone)]
pub struct QueryTile {
    pub first_row: usize,
    pub valid_rows: usize,
    pub head_dim: usize,
    data: Vec<f32>,
}

impl QueryTile {
    pub fn load(
        q: &[f32],
        layout: &TokenLayout,
        seq: &SequenceDescriptor,
        head: usize,
        tile_idx: usize,
        tile_width: usize,
    ) -> Self {
        let first_row = tile_idx * tile_width;
        let valid_rows = seq.fresh_len().saturating_sub(first_row).min(tile_width);
        let mut data = Vec::with_capacity(valid_rows * layout.head_dim);
        for r in 0..valid_rows {
            data.extend_from_slice(layout.row(q, seq.start_offset + first_row + r, head));
        }
        Self {
            first_row,
            valid_rows,
            head_dim: layout.head_dim,
            data,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.valid_rows == 0
    }

    pub fn row(&self, r: usize) -> &[f32] {
        &self.data[r * self.head_dim..(r + 1) * self.head_dim]
    }

    /// Fresh-token index of tile row `r`.
    pub fn fresh_index(&self, r: usize) -> usize {
        self.first_row + r
    }
}

/// A `[tile_width, head_dim]` key/value tile plus its column validity.
#[derive(Debug, Clone)]
pub(crate) struct KvTile {
    pub keys: Vec<f32>,
    pub values: Vec<f32>,
    pub valid: Vec<bool>,
    pub head_dim: usize,
}

impl KvTile {
    pub fn new(tile_width: usize, head_dim: usize) -> Self {
        Self {
            keys: vec![0.0; tile_width * head_dim],
            values: vec![0.0; tile_width * head_dim],
            valid: vec![false; tile_width],
            head_dim,
        }
    }

    pub fn width(&self) -> usize {
        self.valid.len()
    }

    /// Zero every column and mark it invalid.
    pub fn clear(&mut self) {
        self.keys.fill(0.0);
        self.values.fill(0.0);
        self.valid.fill(false);
    }

    pub fn key_mut(&mut self, col: usize) -> &mut [f32] {
        &mut self.keys[col * self.head_dim..(col + 1) * self.head_dim]
    }

    pub fn value_mut(&mut self, col: usize) -> &mut [f32] {
        &mut self.values[col * self.head_dim..(col + 1) * self.head_dim]
    }

    pub fn key(&self, col: usize) -> &[f32] {
        &self.keys[col * self.head_dim..(col + 1) * self.head_dim]
    }
}

#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_tile_valid_rows() {
        let layout = TokenLayout::new(10, 2, 4);
        let q: Vec<f32> = (0..layout.numel()).map(|i| i as f32).collect();
        // 5 fresh tokens starting at token 3
        let seq = SequenceDescriptor::new(3, 7, 12);

        let t0 = QueryTile::load(&q, &layout, &seq, 1, 0, 4);
        assert_eq!(t0.valid_rows, 4);
        assert_eq!(t0.row(0), layout.row(&q, 3, 1));
        assert_eq!(t0.row(3), layout.row(&q, 6, 1));

        let t1 = QueryTile::load(&q, &layout, &seq, 1, 1, 4);
        assert_eq!(t1.valid_rows, 1);
        assert_eq!(t1.fresh_index(0), 4);
        assert_eq!(t1.row(0), layout.row(&q, 7, 1));

        let t2 = QueryTile::load(&q, &layout, &seq, 1, 2, 4);
        assert!(t2.is_empty());
    }

    #[test]
    fn test_dot() {
        assert_eq!(dot(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]), 32.0);
    }
}
