//! The process-wide region table: one accounting record per compiler-hook
//! region, keyed by the 32-bit identifier the framework assigns at
//! definition time. Grown under `lock()`; never shrunk during the run.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::FilterError;

pub type RegionId = u32;

/// Framework region paradigms this plug-in cares about. Everything other
/// than `CompilerHook` is filtered out at `define_region` and never enters
/// the table at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionParadigm {
    CompilerHook,
    Other,
}

#[derive(Debug, Clone)]
pub struct RegionRecord {
    pub region_id: RegionId,
    pub region_name: String,
    pub call_count: u64,
    pub total_duration: u64,
    pub mean_duration: f64,
    pub last_enter: u64,
    pub depth: u32,
    pub entry_site_addr: Option<usize>,
    pub exit_site_addr: Option<usize>,
    pub deletable: bool,
    pub inactive: bool,
    /// Tracks each site independently so a sweep that patches the entry
    /// but fails to patch the exit (or vice versa) never rewrites the
    /// same address twice on a later sweep. Not part of the framework-
    /// visible data model, just bookkeeping the invariant needs.
    entry_patched: bool,
    exit_patched: bool,
}

impl RegionRecord {
    pub fn new(region_id: RegionId, region_name: impl Into<String>) -> Self {
        Self {
            region_id,
            region_name: region_name.into(),
            call_count: 0,
            total_duration: 0,
            mean_duration: 0.0,
            last_enter: 0,
            depth: 0,
            entry_site_addr: None,
            exit_site_addr: None,
            deletable: false,
            inactive: false,
            entry_patched: false,
            exit_patched: false,
        }
    }

    pub fn ready_for_sweep(&self) -> bool {
        self.deletable
            && !self.inactive
            && self.depth == 0
            && self.entry_site_addr.is_some()
            && self.exit_site_addr.is_some()
    }

    pub fn entry_already_patched(&self) -> bool {
        self.entry_patched
    }

    pub fn exit_already_patched(&self) -> bool {
        self.exit_patched
    }

    pub fn mark_entry_patched(&mut self) {
        self.entry_patched = true;
    }

    pub fn mark_exit_patched(&mut self) {
        self.exit_patched = true;
    }

    /// Both sites done: freeze the record.
    pub fn maybe_finish(&mut self) {
        if self.entry_patched && self.exit_patched {
            self.inactive = true;
        }
    }
}

#[derive(Default)]
pub struct RegionTable {
    inner: Mutex<HashMap<RegionId, RegionRecord>>,
}

impl RegionTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, HashMap<RegionId, RegionRecord>> {
        self.inner.lock().expect("region table mutex poisoned")
    }

    pub fn insert_unique(
        &self,
        region_id: RegionId,
        region_name: impl Into<String>,
    ) -> Result<(), FilterError> {
        let mut table = self.lock();
        if table.contains_key(&region_id) {
            return Err(FilterError::DuplicateRegion(region_id));
        }
        table.insert(region_id, RegionRecord::new(region_id, region_name));
        Ok(())
    }

    pub fn defined_region_ids(&self) -> Vec<RegionId> {
        self.lock().keys().copied().collect()
    }
}
