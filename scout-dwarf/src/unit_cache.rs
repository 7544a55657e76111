//! Cache of expanded unit trees.
//!
//! Units are parsed lazily: a unit's header is cheap, but expanding its
//! abbreviation table and root is not, and reference chasing tends to hit
//! the same few units repeatedly. The cache is keyed by the unit header's
//! address key, which is stable across runs, so a cache survives from one
//! indexing run to the next and only [`sweep`](UnitTreeCache::sweep) evicts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::trace;

use crate::container::{DwarfContainer, Reader};
use crate::core::{DieKey, IndexError, Result, UnitDescriptor};

/// A fully expanded unit: header, abbreviations, and root context.
pub struct LoadedUnit {
    pub unit: gimli::Unit<Reader>,
    pub aux: bool,
}

struct Slot {
    unit: Arc<LoadedUnit>,
    last_used: u64,
}

pub struct UnitTreeCache {
    container: Arc<DwarfContainer>,
    slots: Mutex<HashMap<DieKey, Slot>>,
    tick: AtomicU64,
}

impl UnitTreeCache {
    pub fn new(container: Arc<DwarfContainer>) -> Self {
        UnitTreeCache {
            container,
            slots: Mutex::new(HashMap::new()),
            tick: AtomicU64::new(0),
        }
    }

    pub fn container(&self) -> &Arc<DwarfContainer> {
        &self.container
    }

    /// Get the expanded tree for a unit, parsing it on first use.
    pub fn ensure_loaded(&self, desc: &UnitDescriptor) -> Result<Arc<LoadedUnit>> {
        let now = self.tick.fetch_add(1, Ordering::Relaxed);
        let key = desc.key();
        {
            let mut slots = self.slots.lock().unwrap();
            if let Some(slot) = slots.get_mut(&key) {
                slot.last_used = now;
                return Ok(slot.unit.clone());
            }
        }

        desc.mark_queued();
        let loaded = Arc::new(self.expand(desc)?);
        trace!(unit = %key, "expanded unit tree");

        let mut slots = self.slots.lock().unwrap();
        let slot = slots.entry(key).or_insert_with(|| Slot {
            unit: loaded.clone(),
            last_used: now,
        });
        slot.last_used = now;
        Ok(slot.unit.clone())
    }

    fn expand(&self, desc: &UnitDescriptor) -> Result<LoadedUnit> {
        let dwarf = if desc.is_aux() {
            self.container
                .sup_dwarf()
                .ok_or(IndexError::MissingSupplementary { offset: desc.offset() })?
        } else {
            self.container.dwarf()
        };
        let header = dwarf
            .debug_info
            .header_from_offset(gimli::DebugInfoOffset(desc.offset() as usize))
            .map_err(IndexError::Gimli)?;
        let unit = dwarf.unit(header).map_err(IndexError::Gimli)?;
        Ok(LoadedUnit { unit, aux: desc.is_aux() })
    }

    /// Drop every slot not touched within the last `max_idle` lookups.
    /// Called between runs, never during one.
    pub fn sweep(&self, max_idle: u64) {
        let now = self.tick.load(Ordering::Relaxed);
        let mut slots = self.slots.lock().unwrap();
        slots.retain(|_, slot| now.saturating_sub(slot.last_used) <= max_idle);
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
