use crate::block_table::BlockTable;
use crate::config::KernelConfig;
use crate::sequence::SequenceDescriptor;
use crate::tensor::Tensor;
use crate::types::DeviceCapability;
use crate::{DType, Result};

/// Everything one prefill attention call reads.
///
/// Shapes:
/// - `q`: `[num_tokens, num_heads, head_dim]`
/// - `k`, `v`: `[num_tokens, num_kv_heads, head_dim]`
/// - `k_cache`: `[num_blocks, num_kv_heads, head_dim / x, block_size, x]`
/// - `v_cache`: `[num_blocks, num_kv_heads, head_dim, block_size]`
/// - `alibi_slopes`: one slope per query head, when present
pub struct ContextAttentionInputs<'a, T: Tensor> {
    pub q: &'a T,
    pub k: &'a T,
    pub v: &'a T,
    pub k_cache: &'a T,
    pub v_cache: &'a T,
    pub block_table: &'a BlockTable,
    pub sequences: &'a [SequenceDescriptor],
    pub alibi_slopes: Option<&'a [f32]>,
}

pub trait Backend: Send + Sync + 'static {
    type Tensor: Tensor;

    fn name(&self) -> &str;

    /// Capability the launch planner sizes tiles for.
    fn capability(&self) -> DeviceCapability;

    // ── Allocation ──────────────────────────────────────────────

    fn allocate_filled(&self, shape: &[usize], dtype: DType, value: f32) -> Result<Self::Tensor>;
    fn allocate_zeros(&self, shape: &[usize], dtype: DType) -> Result<Self::Tensor> {
        self.allocate_filled(shape, dtype, 0.0)
    }

    // ── Data transfer ───────────────────────────────────────────

    fn copy_from_host_f32(&self, data: &[f32], shape: &[usize]) -> Result<Self::Tensor>;
    fn copy_from_host_f16(&self, data: &[half::f16], shape: &[usize]) -> Result<Self::Tensor>;
    fn copy_from_host_bf16(&self, data: &[half::bf16], shape: &[usize]) -> Result<Self::Tensor>;
    fn copy_to_host_f32(&self, tensor: &Self::Tensor) -> Result<Vec<f32>>;

    /// Fused prefix-prefill attention.
    ///
    /// Writes `out[start_offset + i, h, :]` for every sequence, head `h` and
    /// fresh token `i < fresh_len`. Rows outside those ranges are left as
    /// they were. Validation runs before any row is written; on error `out`
    /// is untouched.
    fn context_attention_fwd(
        &self,
        inputs: &ContextAttentionInputs<'_, Self::Tensor>,
        out: &mut Self::Tensor,
        config: &KernelConfig,
    ) -> Result<()>;
}
