use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::types::{MAX_TILE_WIDTH, NormalizationPolicy};
use crate::{PrefillError, Result};

/// Tunables for one `context_attention_fwd` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub normalization: NormalizationPolicy,
    /// Overrides the capability-derived tile width.
    pub tile_width: Option<usize>,
    /// Run work items on the rayon pool instead of one after another.
    pub parallel: bool,
    /// Upper bound on fresh tokens per sequence, sizing the query-tile axis
    /// of the grid. Derived from the batch when absent.
    pub max_input_len: Option<usize>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            normalization: NormalizationPolicy::Deferred,
            tile_width: None,
            parallel: true,
            max_input_len: None,
        }
    }
}

impl KernelConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: KernelConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(width) = self.tile_width {
            if width == 0 || width > MAX_TILE_WIDTH {
                return Err(PrefillError::InvalidArgument(format!(
                    "tile_width {width} outside 1..={MAX_TILE_WIDTH}"
                )));
            }
        }
        Ok(())
    }

    pub fn with_normalization(mut self, normalization: NormalizationPolicy) -> Self {
        self.normalization = normalization;
        self
    }

    pub fn with_tile_width(mut self, tile_width: usize) -> Self {
        self.tile_width = Some(tile_width);
        self
    }

    pub fn sequential(mut self) -> Self {
        self.parallel = false;
        self
    }
}
