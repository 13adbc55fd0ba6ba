use crate::{PrefillError, Result};

/// Per-sequence view of one prefill step.
///
/// `start_offset` indexes the flattened fresh-token buffers; positions
/// `0..context_length` live in the paged cache, positions
/// `context_length..total_length` are this step's fresh tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceDescriptor {
    pub start_offset: usize,
    pub context_length: usize,
    pub total_length: usize,
}

impl SequenceDescriptor {
    pub fn new(start_offset: usize, context_length: usize, total_length: usize) -> Self {
        Self {
            start_offset,
            context_length,
            total_length,
        }
    }

    /// Number of fresh tokens submitted this step.
    pub fn fresh_len(&self) -> usize {
        self.total_length.saturating_sub(self.context_length)
    }

    /// Absolute position of fresh token `i` within the whole sequence.
    pub fn absolute_position(&self, fresh_idx: usize) -> usize {
        self.context_length + fresh_idx
    }

    /// Build descriptors from the three per-sequence arrays a serving
    /// engine hands over: fresh-region start offsets, total lengths and
    /// cached-prefix lengths.
    pub fn from_arrays(
        start_loc: &[usize],
        seq_len: &[usize],
        ctx_len: &[usize],
    ) -> Result<Vec<SequenceDescriptor>> {
        if start_loc.len() != seq_len.len() || seq_len.len() != ctx_len.len() {
            return Err(PrefillError::InvalidArgument(format!(
                "per-sequence arrays differ in length: start_loc={}, seq_len={}, ctx_len={}",
                start_loc.len(),
                seq_len.len(),
                ctx_len.len()
            )));
        }
        let seqs: Vec<SequenceDescriptor> = start_loc
            .iter()
            .zip(seq_len)
            .zip(ctx_len)
            .map(|((&start, &total), &ctx)| SequenceDescriptor::new(start, ctx, total))
            .collect();
        for (index, seq) in seqs.iter().enumerate() {
            seq.validate(index)?;
        }
        Ok(seqs)
    }

    pub fn validate(&self, index: usize) -> Result<()> {
        if self.total_length < self.context_length {
            return Err(PrefillError::InvalidSequence {
                index,
                reason: format!(
                    "total_length {} < context_length {}",
                    self.total_length, self.context_length
                ),
            });
        }
        Ok(())
    }
}

/// Largest fresh-token count across a batch.
pub fn max_fresh_len(seqs: &[SequenceDescriptor]) -> usize {
    seqs.iter().map(SequenceDescriptor::fresh_len).max().unwrap_or(0)
}
