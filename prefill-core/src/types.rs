use serde::{Deserialize, Serialize};

/// Head dimensions the prefill kernel is specialised for.
pub const SUPPORTED_HEAD_DIMS: [usize; 4] = [16, 32, 64, 128];

/// Launch hint carried over from the GPU launch heuristics; identical for
/// every supported head dim.
pub const NUM_WARPS: usize = 8;

/// Largest accepted tile width override.
pub const MAX_TILE_WIDTH: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F16,
    BF16,
}

impl DType {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 | DType::BF16 => 2,
        }
    }
}

/// How the streaming softmax keeps its weighted-output accumulator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormalizationPolicy {
    /// Keep an unnormalized weighted sum; divide by the running sum once,
    /// after the last tile.
    #[default]
    Deferred,
    /// Renormalize after every tile so the accumulator is always a proper
    /// weighted average.
    Eager,
}

/// Compute capability of the device a launch is planned for.
///
/// Only the major version matters: it selects the tile width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapability {
    pub major: u32,
    pub minor: u32,
}

impl DeviceCapability {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Query/key tile width: 128 on sm_80 and newer, 64 before.
    pub fn tile_width(&self) -> usize {
        if self.major >= 8 { 128 } else { 64 }
    }
}

impl Default for DeviceCapability {
    fn default() -> Self {
        Self::new(8, 0)
    }
}
