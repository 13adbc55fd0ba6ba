//! Prefill KV cache: paged cache layouts, block-table resolution, and a
//! host-side paged cache arena.

pub mod layout;
pub mod paged_cache;
pub mod resolver;

pub use layout::{KeyCacheLayout, ValueCacheLayout};
pub use paged_cache::PagedKvCache;
pub use resolver::{BlockTableResolver, CacheSlot};
