//! Prefill core types, traits, and error definitions.

pub mod backend;
pub mod block_table;
pub mod config;
pub mod error;
pub mod sequence;
pub mod tensor;
pub mod types;

pub use backend::{Backend, ContextAttentionInputs};
pub use block_table::BlockTable;
pub use config::KernelConfig;
pub use error::{PrefillError, Result};
pub use sequence::SequenceDescriptor;
pub use tensor::Tensor;
pub use types::*;
