//! scout-dwarf: DWARF debug-info ingestion and symbol indexing.
//!
//! The crate loads a binary's DWARF sections, scans every compilation unit
//! concurrently, and publishes a queryable index: names (with prefix
//! completion), an address-to-unit map, and parent scopes resolved across
//! unit boundaries. The design follows the cooked-index approach: scanning
//! reads raw DIE streams and records lightweight entries, cross-unit parent
//! links are fixed up in a single deferred pass, and consumers gate on a
//! published completion state instead of locks.
//!
//! ```no_run
//! use scout_dwarf::{DebugInfoIndex, DwarfContainer, NameMatch};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let container = std::sync::Arc::new(DwarfContainer::open("/bin/true")?);
//! let index = DebugInfoIndex::start(container)?;
//! for entry in index.find_by_name("main", NameMatch::Exact).await? {
//!     println!("{} ({})", entry.name, entry.tag);
//! }
//! # Ok(())
//! # }
//! ```

pub mod container;
pub mod core;
pub mod index;
pub mod pipeline;
mod scanner;
pub mod unit_cache;

pub use crate::container::{DwarfContainer, Reader, SectionBytes};
pub use crate::core::{
    DieKey, EntryFlags, IndexEntry, IndexError, IndexState, IndexStats, ParentLink, Result,
    UnitDescriptor, UnitId,
};
pub use crate::index::{MergedIndex, NameMatch};
pub use crate::pipeline::{CancelToken, DebugInfoIndex, IndexOptions};
pub use crate::unit_cache::UnitTreeCache;
