//! Prefill attention bench: random paged inputs, fused kernel vs dense reference.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::bail;
use clap::{Parser, ValueEnum};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::info;
use tracing_subscriber::EnvFilter;

use prefill_backend_cpu::{CpuBackend, CpuTensor};
use prefill_core::{
    Backend, BlockTable, ContextAttentionInputs, DType, KernelConfig, NormalizationPolicy,
    SequenceDescriptor, Tensor,
};
use prefill_kernels::reference::dense_context_attention;
use prefill_kernels::{AlibiSlopes, AttentionShape, PrefillInputs};
use prefill_kvcache::PagedKvCache;

const KEY_SPLIT: usize = 8;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Policy {
    Deferred,
    Eager,
}

impl From<Policy> for NormalizationPolicy {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::Deferred => NormalizationPolicy::Deferred,
            Policy::Eager => NormalizationPolicy::Eager,
        }
    }
}

#[derive(Parser)]
#[command(name = "prefill-bench", about = "Fused prefix-prefill attention bench")]
struct Cli {
    /// Sequences in the batch
    #[arg(long, default_value = "2")]
    num_seqs: usize,

    /// Cached tokens per sequence
    #[arg(long, default_value = "752")]
    context_len: usize,

    /// Fresh tokens per sequence
    #[arg(long, default_value = "2")]
    fresh_len: usize,

    #[arg(long, default_value = "40")]
    num_heads: usize,

    #[arg(long, default_value = "40")]
    num_kv_heads: usize,

    /// One of 16, 32, 64, 128
    #[arg(long, default_value = "128")]
    head_dim: usize,

    /// Token slots per cache block
    #[arg(long, default_value = "16")]
    block_size: usize,

    /// Overrides the policy from `--config`
    #[arg(long, value_enum)]
    policy: Option<Policy>,

    /// Add standard ALiBi slopes
    #[arg(long)]
    alibi: bool,

    /// Kernel config (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "0")]
    seed: u64,

    /// Run grid cells on the calling thread
    #[arg(long)]
    sequential: bool,

    /// Largest accepted absolute difference from the reference
    #[arg(long, default_value = "1e-3")]
    tolerance: f32,
}

struct Inputs {
    shape: AttentionShape,
    q: CpuTensor,
    k: CpuTensor,
    v: CpuTensor,
    k_cache: CpuTensor,
    v_cache: CpuTensor,
    table: BlockTable,
    seqs: Vec<SequenceDescriptor>,
}

fn random_vec(rng: &mut StdRng, n: usize) -> Vec<f32> {
    (0..n).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

fn build_inputs(cli: &Cli, backend: &CpuBackend, rng: &mut StdRng) -> anyhow::Result<Inputs> {
    let blocks_per_seq = cli.context_len.div_ceil(cli.block_size);
    let num_blocks = (cli.num_seqs * blocks_per_seq).max(1);
    let mut ids: Vec<u32> = (0..num_blocks as u32).collect();
    ids.shuffle(rng);

    let mut cache = PagedKvCache::new(
        num_blocks,
        cli.num_kv_heads,
        cli.head_dim,
        cli.block_size,
        KEY_SPLIT,
    )?;
    let mut rows = Vec::with_capacity(cli.num_seqs);
    let mut seqs = Vec::with_capacity(cli.num_seqs);
    let numel = cli.context_len * cli.num_kv_heads * cli.head_dim;
    for s in 0..cli.num_seqs {
        let row = ids[s * blocks_per_seq..(s + 1) * blocks_per_seq].to_vec();
        let keys = random_vec(rng, numel);
        let values = random_vec(rng, numel);
        cache.write_sequence(&row, 0, &keys, &values)?;
        rows.push(row);
        seqs.push(SequenceDescriptor::new(
            s * cli.fresh_len,
            cli.context_len,
            cli.context_len + cli.fresh_len,
        ));
    }

    let shape = AttentionShape {
        num_tokens: cli.num_seqs * cli.fresh_len,
        num_heads: cli.num_heads,
        num_kv_heads: cli.num_kv_heads,
        head_dim: cli.head_dim,
    };
    let q_shape = [shape.num_tokens, shape.num_heads, shape.head_dim];
    let kv_shape = [shape.num_tokens, shape.num_kv_heads, shape.head_dim];
    let q = random_vec(rng, shape.q_layout().numel());
    let k = random_vec(rng, shape.kv_layout().numel());
    let v = random_vec(rng, shape.kv_layout().numel());

    let key_shape = cache.key_layout().shape();
    let value_shape = cache.value_layout().shape();
    let (key_data, value_data) = cache.into_parts();
    Ok(Inputs {
        shape,
        q: backend.copy_from_host_f32(&q, &q_shape)?,
        k: backend.copy_from_host_f32(&k, &kv_shape)?,
        v: backend.copy_from_host_f32(&v, &kv_shape)?,
        k_cache: backend.copy_from_host_f32(&key_data, &key_shape)?,
        v_cache: backend.copy_from_host_f32(&value_data, &value_shape)?,
        table: BlockTable::from_rows(&rows),
        seqs,
    })
}

fn load_config(cli: &Cli) -> anyhow::Result<KernelConfig> {
    let mut config = match &cli.config {
        Some(path) => KernelConfig::from_file(path)
            .map_err(|e| anyhow::anyhow!("Failed to load {}: {e}", path.display()))?,
        None => KernelConfig::default(),
    };
    if let Some(policy) = cli.policy {
        config.normalization = policy.into();
    }
    if cli.sequential {
        config.parallel = false;
    }
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let backend = CpuBackend::new();
    let mut rng = StdRng::seed_from_u64(cli.seed);

    let inputs = build_inputs(&cli, &backend, &mut rng)?;
    let slopes = if cli.alibi {
        Some(AlibiSlopes::standard(cli.num_heads)?)
    } else {
        None
    };
    let slopes = slopes.as_ref().map(AlibiSlopes::as_slice);
    info!(
        "Batch: {} seqs x ({} cached + {} fresh), {} heads / {} KV heads, head_dim {}, block {}",
        cli.num_seqs,
        cli.context_len,
        cli.fresh_len,
        cli.num_heads,
        cli.num_kv_heads,
        cli.head_dim,
        cli.block_size,
    );
    info!("Kernel config: {config:?}");

    let mut out = backend.allocate_zeros(inputs.q.shape(), DType::F32)?;
    let started = Instant::now();
    backend.context_attention_fwd(
        &ContextAttentionInputs {
            q: &inputs.q,
            k: &inputs.k,
            v: &inputs.v,
            k_cache: &inputs.k_cache,
            v_cache: &inputs.v_cache,
            block_table: &inputs.table,
            sequences: &inputs.seqs,
            alibi_slopes: slopes,
        },
        &mut out,
        &config,
    )?;
    let fused_elapsed = started.elapsed();

    let started = Instant::now();
    let reference = dense_context_attention(&PrefillInputs {
        shape: inputs.shape,
        q: inputs.q.data(),
        k: inputs.k.data(),
        v: inputs.v.data(),
        k_cache: inputs.k_cache.data(),
        v_cache: inputs.v_cache.data(),
        key_layout: prefill_kvcache::KeyCacheLayout::from_shape(inputs.k_cache.shape())?,
        value_layout: prefill_kvcache::ValueCacheLayout::from_shape(inputs.v_cache.shape())?,
        block_table: &inputs.table,
        sequences: &inputs.seqs,
        alibi_slopes: slopes,
    })?;
    let reference_elapsed = started.elapsed();

    let max_err = out
        .data()
        .iter()
        .zip(&reference)
        .map(|(a, b)| (a - b).abs())
        .fold(0.0f32, f32::max);
    info!("Fused kernel: {fused_elapsed:?}, dense reference: {reference_elapsed:?}");
    info!("Max abs error: {max_err:e} (tolerance {:e})", cli.tolerance);

    if max_err.is_nan() || max_err > cli.tolerance {
        bail!("max abs error {max_err} exceeds tolerance {}", cli.tolerance);
    }
    Ok(())
}
