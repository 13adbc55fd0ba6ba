//! Prefill attention kernels.
//!
//! One work item per (sequence, head, query tile). Each item folds the
//! sequence's cached prefix (read through the block table) and then its
//! fresh suffix (read contiguously, causally masked) into a streaming
//! softmax accumulator, and emits the normalized rows it owns.

pub mod bias;
pub mod launch;
mod prefix;
pub mod reference;
pub mod softmax;
mod suffix;
pub mod tile;
pub mod work_item;

pub use bias::{AlibiSlopes, LinearBias};
pub use launch::{AttentionShape, Grid, KernelVariant, LaunchPlan, PrefillInputs, context_attention};
pub use softmax::{RowState, TileAccumulator};
pub use work_item::{WorkItem, WorkItemOutput};
