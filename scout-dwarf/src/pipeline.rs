//! Concurrent index construction.
//!
//! One indexing run takes a container, partitions its units across blocking
//! worker tasks by byte-length cost, and merges the resulting shards into a
//! [`MergedIndex`]. Progress is published through a watch channel as an
//! [`IndexState`]; consumers gate on the level they need and never observe a
//! partially built table. Worker errors are collected, not propagated
//! mid-run, and re-raised once on first use of the result.

use std::collections::HashSet;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::container::{DwarfContainer, Reader};
use crate::core::{
    DieKey, IndexEntry, IndexError, IndexState, IndexStats, Result, UnitDescriptor, UnitId,
};
use crate::index::{IndexShard, MergedIndex, NameMatch};
use crate::scanner;
use crate::unit_cache::UnitTreeCache;

/// Cooperative cancellation for [`DebugInfoIndex::wait`] callers.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Tuning knobs for one indexing run.
#[derive(Debug, Clone, Default)]
pub struct IndexOptions {
    /// Scanning worker count. Defaults to the number of CPUs.
    pub workers: Option<usize>,
}

/// Shared, immutable-for-the-run view the scanner works against.
#[derive(Clone)]
pub struct ScanContext {
    container: Arc<DwarfContainer>,
    units: Arc<Vec<UnitDescriptor>>,
    cache: Arc<UnitTreeCache>,
}

impl ScanContext {
    pub(crate) fn units(&self) -> &[UnitDescriptor] {
        &self.units
    }

    pub(crate) fn unit(&self, id: UnitId) -> &UnitDescriptor {
        &self.units[id.0]
    }

    pub(crate) fn cache(&self) -> &UnitTreeCache {
        &self.cache
    }

    /// Which unit owns this address key, if any.
    pub(crate) fn unit_containing(&self, key: DieKey) -> Option<UnitId> {
        DwarfContainer::descriptor_for_key(&self.units, key).map(|d| d.id())
    }

    pub(crate) fn dwarf_for(&self, desc: &UnitDescriptor) -> Result<&gimli::Dwarf<Reader>> {
        if desc.is_aux() {
            Ok(self
                .container
                .sup_dwarf()
                .ok_or(IndexError::MissingSupplementary { offset: desc.offset() })?)
        } else {
            Ok(self.container.dwarf())
        }
    }
}

struct IndexInner {
    cx: ScanContext,
    state_tx: watch::Sender<IndexState>,
    state_rx: watch::Receiver<IndexState>,
    merged: OnceLock<MergedIndex>,
    main_name: OnceLock<Option<Arc<str>>>,
    errors: Mutex<Vec<String>>,
    had_errors: AtomicBool,
    complaints: Mutex<Vec<String>>,
    stats: OnceLock<IndexStats>,
}

/// Handle to one indexing run. Cheap to clone; all queries gate on the run
/// reaching the state they need.
#[derive(Clone)]
pub struct DebugInfoIndex {
    inner: Arc<IndexInner>,
}

impl DebugInfoIndex {
    /// Start an indexing run with default options and a fresh unit cache.
    pub fn start(container: Arc<DwarfContainer>) -> Result<Self> {
        Self::start_with_options(container, IndexOptions::default())
    }

    pub fn start_with_options(
        container: Arc<DwarfContainer>,
        options: IndexOptions,
    ) -> Result<Self> {
        let cache = Arc::new(UnitTreeCache::new(container.clone()));
        Self::start_with_cache(container, cache, options)
    }

    /// Start a run reusing an existing unit cache, typically the previous
    /// run's. The cache must have been built over the same container.
    pub fn start_with_cache(
        container: Arc<DwarfContainer>,
        cache: Arc<UnitTreeCache>,
        options: IndexOptions,
    ) -> Result<Self> {
        let units = Arc::new(container.unit_descriptors()?);
        let (state_tx, state_rx) = watch::channel(IndexState::Initial);
        let inner = Arc::new(IndexInner {
            cx: ScanContext { container, units, cache },
            state_tx,
            state_rx,
            merged: OnceLock::new(),
            main_name: OnceLock::new(),
            errors: Mutex::new(Vec::new()),
            had_errors: AtomicBool::new(false),
            complaints: Mutex::new(Vec::new()),
            stats: OnceLock::new(),
        });
        let driver = inner.clone();
        tokio::spawn(async move { drive(driver, options).await });
        Ok(DebugInfoIndex { inner })
    }

    /// Current completion level.
    pub fn state(&self) -> IndexState {
        *self.inner.state_rx.borrow()
    }

    /// Block until the run reaches `level`. Returns whether the run is
    /// error-free so far; it does not consume recorded errors. With a
    /// cancel token, the wait is re-checked on a short cadence and bails
    /// with [`IndexError::WaitCancelled`] once the token fires.
    pub async fn wait(&self, level: IndexState, cancel: Option<&CancelToken>) -> Result<bool> {
        let mut rx = self.inner.state_rx.clone();
        loop {
            if *rx.borrow() >= level {
                return Ok(!self.inner.had_errors.load(Ordering::Acquire));
            }
            match cancel {
                Some(token) => {
                    if token.is_cancelled() {
                        return Err(IndexError::WaitCancelled.into());
                    }
                    match tokio::time::timeout(Duration::from_millis(50), rx.changed()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => return Err(IndexError::PipelineGone.into()),
                        Err(_) => {} // timeout, poll the token again
                    }
                }
                None => {
                    rx.changed().await.map_err(|_| IndexError::PipelineGone)?;
                }
            }
        }
    }

    /// Name of the program's entry point, if the producer marked one.
    /// Available as soon as the run reaches [`IndexState::MainAvailable`].
    pub async fn main_name(&self, cancel: Option<&CancelToken>) -> Result<Option<Arc<str>>> {
        self.wait(IndexState::MainAvailable, cancel).await?;
        Ok(self.inner.main_name.get().cloned().flatten())
    }

    /// Look up entries by name, blocking until the index is complete.
    /// Errors collected during the run are raised here once.
    pub async fn find_by_name(&self, name: &str, mode: NameMatch) -> Result<Vec<IndexEntry>> {
        self.wait(IndexState::Done, None).await?;
        self.raise_pending_errors()?;
        let merged = self.merged_or_gone()?;
        Ok(merged
            .find_by_name(name, mode)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Map a code address to the unit covering it.
    pub async fn find_unit_for_address(&self, address: u64) -> Result<Option<UnitId>> {
        self.wait(IndexState::Done, None).await?;
        self.raise_pending_errors()?;
        Ok(self.merged_or_gone()?.unit_for_address(address))
    }

    /// Summary counters for a completed run.
    pub async fn stats(&self) -> Result<IndexStats> {
        self.wait(IndexState::Done, None).await?;
        self.inner
            .stats
            .get()
            .copied()
            .ok_or_else(|| IndexError::PipelineGone.into())
    }

    /// The completed index, if the run has reached [`IndexState::Done`].
    pub fn merged(&self) -> Option<&MergedIndex> {
        self.inner.merged.get()
    }

    /// Unit descriptors of this run.
    pub fn units(&self) -> &[UnitDescriptor] {
        self.inner.cx.units()
    }

    /// Malformed-input notes collected so far, deduplicated.
    pub fn complaints(&self) -> Vec<String> {
        self.inner.complaints.lock().unwrap().clone()
    }

    /// The unit cache backing this run, for reuse by a subsequent run over
    /// the same container.
    pub fn cache(&self) -> Arc<UnitTreeCache> {
        self.inner.cx.cache.clone()
    }

    fn merged_or_gone(&self) -> Result<&MergedIndex> {
        Ok(self
            .inner
            .merged
            .get()
            .ok_or(IndexError::PipelineGone)?)
    }

    /// Drain recorded errors, deduplicated, into a single failure. Later
    /// calls succeed quietly.
    fn raise_pending_errors(&self) -> Result<()> {
        let mut errors = self.inner.errors.lock().unwrap();
        if errors.is_empty() {
            return Ok(());
        }
        let mut seen = HashSet::new();
        let drained: Vec<String> = errors
            .drain(..)
            .filter(|e| seen.insert(e.clone()))
            .collect();
        anyhow::bail!("index build reported errors: {}", drained.join("; "))
    }
}

impl std::fmt::Debug for DebugInfoIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugInfoIndex")
            .field("state", &self.state())
            .field("units", &self.inner.cx.units().len())
            .finish()
    }
}

/// Split `units` into contiguous ranges of roughly equal byte-length cost.
/// Every unit lands in exactly one range.
fn partition_units(units: &[UnitDescriptor], workers: usize) -> Vec<Range<usize>> {
    if units.is_empty() || workers <= 1 {
        return vec![0..units.len()];
    }
    let total: u64 = units.iter().map(|u| u.length()).sum();
    let target = total / workers as u64 + 1;
    let mut parts = Vec::with_capacity(workers);
    let mut start = 0;
    let mut acc = 0u64;
    for (i, unit) in units.iter().enumerate() {
        acc += unit.length();
        if acc >= target && parts.len() + 1 < workers {
            parts.push(start..i + 1);
            start = i + 1;
            acc = 0;
        }
    }
    if start < units.len() {
        parts.push(start..units.len());
    }
    parts
}

fn scan_partition(cx: &ScanContext, part: Range<usize>) -> (IndexShard, Vec<String>) {
    let mut shard = IndexShard::new();
    let mut errors = Vec::new();
    for idx in part {
        let desc = &cx.units()[idx];
        if !desc.try_claim() {
            continue;
        }
        if let Err(e) = scanner::scan_unit(cx, desc.id(), &mut shard) {
            errors.push(format!("scanning unit {} failed: {e:#}", desc.key()));
        }
    }
    (shard, errors)
}

/// Catch-all pass over every unit nobody claimed, e.g. partial units only
/// reachable through imports that never fired.
fn scan_orphans(cx: &ScanContext) -> (IndexShard, Vec<String>) {
    scan_partition(cx, 0..cx.units().len())
}

async fn run_blocking<T, F>(errors: &mut Vec<String>, f: F) -> Option<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(v) => Some(v),
        Err(e) => {
            errors.push(format!("index task panicked: {e}"));
            None
        }
    }
}

async fn drive(inner: Arc<IndexInner>, options: IndexOptions) {
    let started = Instant::now();
    let workers = options.workers.unwrap_or_else(num_cpus::get).max(1);
    let parts = partition_units(inner.cx.units(), workers);
    debug!(
        units = inner.cx.units().len(),
        workers = parts.len(),
        "starting index build"
    );

    let mut errors: Vec<String> = Vec::new();
    let mut shards: Vec<IndexShard> = Vec::new();

    let tasks: Vec<_> = parts
        .into_iter()
        .map(|part| {
            let cx = inner.cx.clone();
            tokio::task::spawn_blocking(move || scan_partition(&cx, part))
        })
        .collect();
    for outcome in futures::future::join_all(tasks).await {
        match outcome {
            Ok((shard, errs)) => {
                shards.push(shard);
                errors.extend(errs);
            }
            Err(e) => errors.push(format!("index worker panicked: {e}")),
        }
    }

    {
        let cx = inner.cx.clone();
        if let Some((shard, errs)) = run_blocking(&mut errors, move || scan_orphans(&cx)).await {
            shards.push(shard);
            errors.extend(errs);
        }
    }

    let (mut merged, complaints) = run_blocking(&mut errors, move || {
        MergedIndex::from_shards(shards)
    })
    .await
    .unwrap_or_default();

    let _ = inner
        .main_name
        .set(merged.main_entry().map(|e| e.name.clone()));
    let _ = inner.state_tx.send(IndexState::MainAvailable);

    let deferred_total = merged.deferred_len();
    let merged = run_blocking(&mut errors, move || {
        merged.resolve_deferred();
        merged.build_name_table();
        merged
    })
    .await
    .unwrap_or_default();

    if !complaints.is_empty() {
        warn!(count = complaints.len(), "malformed debug info noted");
        inner.complaints.lock().unwrap().extend(complaints);
    }
    if !errors.is_empty() {
        warn!(count = errors.len(), "index build finished with errors");
        inner.had_errors.store(true, Ordering::Release);
        inner.errors.lock().unwrap().extend(errors);
    }

    let stats = IndexStats {
        units: inner.cx.units().len(),
        entries: merged.len(),
        deferred_entries: deferred_total,
        resolved_parents: merged.resolved_parents(),
        elapsed_ms: started.elapsed().as_millis() as u64,
    };
    let _ = inner.stats.set(stats);
    let _ = inner.merged.set(merged);
    let _ = inner.state_tx.send(IndexState::Done);
    info!(
        entries = stats.entries,
        elapsed_ms = stats.elapsed_ms,
        "index build complete"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptors(lengths: &[u64]) -> Vec<UnitDescriptor> {
        let mut offset = 0;
        lengths
            .iter()
            .enumerate()
            .map(|(i, &len)| {
                let d = UnitDescriptor::new(UnitId(i), offset, len, false, false, 4);
                offset += len;
                d
            })
            .collect()
    }

    #[test]
    fn partition_covers_every_unit_exactly_once() {
        let units = descriptors(&[100, 5, 5, 200, 50, 50, 5, 400]);
        for workers in 1..=10 {
            let parts = partition_units(&units, workers);
            let mut next = 0;
            for part in &parts {
                assert_eq!(part.start, next);
                next = part.end;
            }
            assert_eq!(next, units.len());
            assert!(parts.len() <= workers.max(1));
        }
    }

    #[test]
    fn partition_skews_toward_cost_not_count() {
        // One huge unit should not drag many small ones into its range.
        let units = descriptors(&[1000, 10, 10, 10, 10, 10]);
        let parts = partition_units(&units, 2);
        assert_eq!(parts[0], 0..1);
        assert_eq!(parts[1], 1..units.len());
    }

    #[test]
    fn partition_of_empty_table_is_one_empty_range() {
        let parts = partition_units(&[], 4);
        assert_eq!(parts, vec![0..0]);
    }

    #[test]
    fn cancel_token_reports_once_set() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }
}
