use crate::{PrefillError, Result};

/// Per-sequence logical-to-physical block mapping.
///
/// Stored as a dense `[num_seqs, max_blocks_per_seq]` matrix, the same shape
/// a GPU kernel reads. Entries past a sequence's last assigned block are
/// padding and are never dereferenced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTable {
    entries: Vec<u32>,
    num_seqs: usize,
    max_blocks_per_seq: usize,
}

impl BlockTable {
    pub fn new(num_seqs: usize, max_blocks_per_seq: usize, entries: Vec<u32>) -> Result<Self> {
        if entries.len() != num_seqs * max_blocks_per_seq {
            return Err(PrefillError::ShapeMismatch {
                expected: vec![num_seqs, max_blocks_per_seq],
                got: vec![entries.len()],
            });
        }
        Ok(Self {
            entries,
            num_seqs,
            max_blocks_per_seq,
        })
    }

    /// Build a table from ragged rows, padding short rows with block 0.
    pub fn from_rows(rows: &[Vec<u32>]) -> Self {
        let max_blocks_per_seq = rows.iter().map(Vec::len).max().unwrap_or(0);
        let mut entries = Vec::with_capacity(rows.len() * max_blocks_per_seq);
        for row in rows {
            entries.extend_from_slice(row);
            entries.resize(entries.len() + max_blocks_per_seq - row.len(), 0);
        }
        Self {
            entries,
            num_seqs: rows.len(),
            max_blocks_per_seq,
        }
    }

    pub fn num_seqs(&self) -> usize {
        self.num_seqs
    }

    pub fn max_blocks_per_seq(&self) -> usize {
        self.max_blocks_per_seq
    }

    pub fn row(&self, seq: usize) -> &[u32] {
        let start = seq * self.max_blocks_per_seq;
        &self.entries[start..start + self.max_blocks_per_seq]
    }

    /// Physical block holding logical block `logical` of sequence `seq`.
    pub fn physical_block(&self, seq: usize, logical: usize) -> Option<usize> {
        if seq >= self.num_seqs || logical >= self.max_blocks_per_seq {
            return None;
        }
        Some(self.entries[seq * self.max_blocks_per_seq + logical] as usize)
    }

    /// Check that the first `ceil(context_len / block_size)` entries of
    /// `seq`'s row exist and point inside a pool of `num_blocks` blocks.
    pub fn check_coverage(
        &self,
        seq: usize,
        context_len: usize,
        block_size: usize,
        num_blocks: usize,
    ) -> Result<()> {
        let needed = context_len.div_ceil(block_size);
        if needed > self.max_blocks_per_seq {
            return Err(PrefillError::InvalidBlockTable(format!(
                "sequence {seq} needs {needed} blocks for {context_len} cached tokens, \
                 table has {} per sequence",
                self.max_blocks_per_seq
            )));
        }
        if let Some(&bad) = self.row(seq)[..needed]
            .iter()
            .find(|&&b| b as usize >= num_blocks)
        {
            return Err(PrefillError::InvalidBlockTable(format!(
                "sequence {seq} references block {bad}, cache has {num_blocks} blocks"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_rows_pads() {
        let table = BlockTable::from_rows(&[vec![3, 1, 4], vec![7]]);
        assert_eq!(table.max_blocks_per_seq(), 3);
        assert_eq!(table.row(1), &[7, 0, 0]);
        assert_eq!(table.physical_block(0, 2), Some(4));
        assert_eq!(table.physical_block(0, 3), None);
        assert_eq!(table.physical_block(2, 0), None);
    }

    #[test]
    fn test_new_rejects_wrong_len() {
        assert!(BlockTable::new(2, 3, vec![0; 5]).is_err());
    }

    #[test]
    fn test_coverage() {
        let table = BlockTable::from_rows(&[vec![3, 1], vec![9]]);
        assert!(table.check_coverage(0, 32, 16, 4).is_ok());
        // 33 tokens need a third block
        assert!(table.check_coverage(0, 33, 16, 4).is_err());
        // block 9 is outside a 4-block pool
        assert!(table.check_coverage(1, 1, 16, 4).is_err());
        // no cached tokens, nothing to check
        assert!(table.check_coverage(1, 0, 16, 4).is_ok());
    }
}
