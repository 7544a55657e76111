//! The name index: per-worker shards and the merged, queryable result.

pub mod merged;
pub mod shard;

pub use merged::{MergedIndex, NameMatch};
pub use shard::IndexShard;
