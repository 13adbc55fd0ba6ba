use prefill_core::{
    Backend, ContextAttentionInputs, DType, DeviceCapability, KernelConfig, PrefillError, Result,
    Tensor,
};
use prefill_kernels::launch::check_head_dims;
use prefill_kernels::{AttentionShape, PrefillInputs, context_attention};
use prefill_kvcache::{KeyCacheLayout, ValueCacheLayout};
use tracing::debug;

use crate::tensor::CpuTensor;

/// CPU backend for prefix-prefill attention.
///
/// All data lives in host memory as `Vec<f32>` wrapped in `Arc`. The
/// capability only sizes tiles; it defaults to 8.0.
#[derive(Clone, Debug, Default)]
pub struct CpuBackend {
    capability: DeviceCapability,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capability(capability: DeviceCapability) -> Self {
        Self { capability }
    }
}

fn validate_shape(data_len: usize, shape: &[usize]) -> Result<()> {
    let expected: usize = shape.iter().product();
    if data_len != expected {
        return Err(PrefillError::ShapeMismatch {
            expected: shape.to_vec(),
            got: vec![data_len],
        });
    }
    Ok(())
}

fn rank3(what: &str, t: &CpuTensor) -> Result<[usize; 3]> {
    match t.shape() {
        &[a, b, c] => Ok([a, b, c]),
        other => Err(PrefillError::InvalidArgument(format!(
            "{what} must be 3-D [tokens, heads, head_dim], got {other:?}"
        ))),
    }
}

fn check_dtype(what: &'static str, t: &CpuTensor, expected: DType) -> Result<()> {
    if t.dtype() != expected {
        return Err(PrefillError::DtypeMismatch {
            what,
            expected,
            got: t.dtype(),
        });
    }
    Ok(())
}

impl Backend for CpuBackend {
    type Tensor = CpuTensor;

    fn name(&self) -> &str {
        "cpu"
    }

    fn capability(&self) -> DeviceCapability {
        self.capability
    }

    // ── Allocation ──────────────────────────────────────────────

    fn allocate_filled(&self, shape: &[usize], dtype: DType, value: f32) -> Result<CpuTensor> {
        let numel: usize = shape.iter().product();
        Ok(CpuTensor::with_dtype(vec![value; numel], shape.to_vec(), dtype))
    }

    // ── Data transfer ───────────────────────────────────────────

    fn copy_from_host_f32(&self, data: &[f32], shape: &[usize]) -> Result<CpuTensor> {
        validate_shape(data.len(), shape)?;
        Ok(CpuTensor::new(data.to_vec(), shape.to_vec()))
    }

    fn copy_from_host_f16(&self, data: &[half::f16], shape: &[usize]) -> Result<CpuTensor> {
        validate_shape(data.len(), shape)?;
        let f32_data: Vec<f32> = data.iter().map(|x| x.to_f32()).collect();
        Ok(CpuTensor::with_dtype(f32_data, shape.to_vec(), DType::F16))
    }

    fn copy_from_host_bf16(&self, data: &[half::bf16], shape: &[usize]) -> Result<CpuTensor> {
        validate_shape(data.len(), shape)?;
        let f32_data: Vec<f32> = data.iter().map(|x| x.to_f32()).collect();
        Ok(CpuTensor::with_dtype(f32_data, shape.to_vec(), DType::BF16))
    }

    fn copy_to_host_f32(&self, tensor: &CpuTensor) -> Result<Vec<f32>> {
        Ok(tensor.data().to_vec())
    }

    // ── Compute ─────────────────────────────────────────────────

    fn context_attention_fwd(
        &self,
        inputs: &ContextAttentionInputs<'_, CpuTensor>,
        out: &mut CpuTensor,
        config: &KernelConfig,
    ) -> Result<()> {
        let [num_tokens, num_heads, dq] = rank3("q", inputs.q)?;
        let [k_tokens, num_kv_heads, dk] = rank3("k", inputs.k)?;
        let [_, _, dv] = rank3("v", inputs.v)?;
        let head_dim = check_head_dims(dq, dk, dv)?;

        let dtype = inputs.q.dtype();
        check_dtype("k", inputs.k, dtype)?;
        check_dtype("v", inputs.v, dtype)?;
        check_dtype("k_cache", inputs.k_cache, dtype)?;
        check_dtype("v_cache", inputs.v_cache, dtype)?;
        check_dtype("out", out, dtype)?;

        if k_tokens != num_tokens || inputs.v.shape() != inputs.k.shape() {
            return Err(PrefillError::ShapeMismatch {
                expected: vec![num_tokens, num_kv_heads, head_dim],
                got: inputs.v.shape().to_vec(),
            });
        }
        if out.shape() != inputs.q.shape() {
            return Err(PrefillError::ShapeMismatch {
                expected: inputs.q.shape().to_vec(),
                got: out.shape().to_vec(),
            });
        }

        let key_layout = KeyCacheLayout::from_shape(inputs.k_cache.shape())?;
        let value_layout = ValueCacheLayout::from_shape(inputs.v_cache.shape())?;
        let kernel_inputs = PrefillInputs {
            shape: AttentionShape {
                num_tokens,
                num_heads,
                num_kv_heads,
                head_dim,
            },
            q: inputs.q.data(),
            k: inputs.k.data(),
            v: inputs.v.data(),
            k_cache: inputs.k_cache.data(),
            v_cache: inputs.v_cache.data(),
            key_layout,
            value_layout,
            block_table: inputs.block_table,
            sequences: inputs.sequences,
            alibi_slopes: inputs.alibi_slopes,
        };

        debug!(
            backend = self.name(),
            num_tokens,
            num_heads,
            num_kv_heads,
            head_dim,
            num_seqs = inputs.sequences.len(),
            ?dtype,
            "context_attention_fwd"
        );
        context_attention(&kernel_inputs, out.data_mut(), self.capability, config)?;
        Ok(())
    }
}
