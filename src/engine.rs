//! Translates the measurement framework's callbacks into updates on the
//! region table, shadow tables, decision rule, and deletion coordinator.
//! This module is the "event dispatcher" of the design: it owns no FFI
//! types itself (see `ffi.rs` for the C ABI glue) so its logic can be
//! driven directly from tests.

use std::cell::RefCell;
use std::sync::Mutex;

use crate::config::{FilterConfig, FilterMode};
use crate::coordinator::DeletionCoordinator;
use crate::decision;
use crate::diagnostics;
use crate::patch::{CodePatcher, PatchError};
use crate::region::{RegionId, RegionParadigm, RegionTable};
use crate::shadow::ShadowTable;
use crate::unwind::UnwindProbe;
use crate::error::FilterError;

thread_local! {
    static LOCATION: RefCell<LocationState> = RefCell::new(LocationState::default());
}

#[derive(Default)]
struct LocationState {
    is_primary: bool,
    shadow: Option<ShadowTable>,
}

/// All of the plug-in's global state, minus the thread-local location
/// state above. One instance lives for the whole run; `ffi.rs` keeps it
/// behind a `lazy_static` for the production build, tests construct their
/// own with fake `StackWalker`/`PageProtector` backends.
pub struct Engine {
    pub region_table: RegionTable,
    pub coordinator: DeletionCoordinator,
    config: Mutex<Option<FilterConfig>>,
    plugin_id: Mutex<i32>,
    probe: UnwindProbe,
    patcher: CodePatcher,
    architecture_supported: bool,
}

impl Engine {
    pub fn new(probe: UnwindProbe, patcher: CodePatcher, architecture_supported: bool) -> Self {
        Self {
            region_table: RegionTable::new(),
            coordinator: DeletionCoordinator::new(),
            config: Mutex::new(None),
            plugin_id: Mutex::new(0),
            probe,
            patcher,
            architecture_supported,
        }
    }

    fn mode_and_threshold(&self) -> Option<(FilterMode, u64)> {
        self.config
            .lock()
            .expect("config mutex poisoned")
            .map(|c| (c.mode, c.threshold_ticks))
    }
}

pub fn init(engine: &Engine, lookup: impl Fn(&str) -> Option<String>) -> Result<(), FilterError> {
    let config = FilterConfig::parse(lookup)?;
    *engine.config.lock().expect("config mutex poisoned") = Some(config);
    if !engine.architecture_supported {
        log::warn!("dynamic filtering is not supported on this architecture; regions will be accounted but never patched");
    }
    Ok(())
}

pub fn assign_id(engine: &Engine, plugin_id: i32) {
    *engine.plugin_id.lock().expect("plugin id mutex poisoned") = plugin_id;
}

pub fn finalize(engine: &Engine) -> i32 {
    let mut table = engine.region_table.lock();
    diagnostics::dump_region_table(&table);
    table.clear();
    *engine.plugin_id.lock().expect("plugin id mutex poisoned")
}

pub fn define_region(
    engine: &Engine,
    region_id: RegionId,
    region_name: &str,
    paradigm: RegionParadigm,
) {
    if paradigm != RegionParadigm::CompilerHook {
        return;
    }
    match engine.region_table.insert_unique(region_id, region_name) {
        Ok(()) => log::debug!("defined region {} ({})", region_id, region_name),
        Err(e) => {
            // Duplicate region definition is fatal. The FFI entry point
            // this feeds has a `void` return, so logging alone can't report
            // failure to the framework -- abort instead of silently
            // degrading the way the non-fatal conditions do.
            log::error!("{}", e);
            std::process::abort();
        }
    }
}

pub fn create_location(engine: &Engine, location_id: u64) {
    LOCATION.with(|location| {
        let mut location = location.borrow_mut();
        if location_id == 0 {
            location.is_primary = true;
            location.shadow = None;
        } else {
            location.is_primary = false;
            location.shadow = Some(ShadowTable::populated_from(
                engine.region_table.defined_region_ids(),
            ));
        }
    });
}

pub fn delete_location(_engine: &Engine) {
    LOCATION.with(|location| {
        location.borrow_mut().shadow = None;
    });
}

pub fn team_begin(engine: &Engine) {
    engine.coordinator.with_active_count(|count| *count += 1);
}

pub fn team_end(engine: &Engine) {
    let is_primary = LOCATION.with(|location| location.borrow().is_primary);
    let (mode, threshold) = match engine.mode_and_threshold() {
        Some(v) => v,
        None => (FilterMode::Absolute, 0),
    };

    engine.coordinator.with_active_count(|count| {
        *count = count.saturating_sub(1);
        if is_primary {
            return;
        }
        LOCATION.with(|location| {
            let mut location = location.borrow_mut();
            let shadow = match location.shadow.as_mut() {
                Some(shadow) => shadow,
                None => return,
            };
            let mut table = engine.region_table.lock();
            for (region_id, shadow_record) in shadow.drain() {
                if let Some(record) = table.get_mut(&region_id) {
                    if record.inactive {
                        continue;
                    }
                    if !record.deletable {
                        record.call_count += shadow_record.local_call_count;
                        record.total_duration += shadow_record.local_duration;
                    }
                    decision::apply_decision(&mut table, region_id, mode, threshold, None);
                }
            }
        });
    });
}

pub fn enter_region(engine: &Engine, timestamp: u64, region_id: RegionId) {
    let is_primary = LOCATION.with(|location| location.borrow().is_primary);
    if is_primary {
        let mut table = engine.region_table.lock();
        let family = engine.probe.classify();
        if let Some(record) = table.get_mut(&region_id) {
            if record.inactive {
                return;
            }
            record.last_enter = timestamp;
            record.depth += 1;
            if record.entry_site_addr.is_none() {
                if let Some(family) = family {
                    if let Some(addr) = engine.probe.find_call_site(family.enter_symbol) {
                        record.entry_site_addr = Some(addr);
                    }
                }
            }
        }
    } else {
        LOCATION.with(|location| {
            let mut location = location.borrow_mut();
            if let Some(shadow) = location.shadow.as_mut() {
                if let Some(record) = shadow.get_mut(region_id) {
                    record.last_enter = timestamp;
                }
            }
        });
    }
}

pub fn exit_region(engine: &Engine, timestamp: u64, region_id: RegionId) {
    let is_primary = LOCATION.with(|location| location.borrow().is_primary);
    if is_primary {
        let (mode, threshold) = match engine.mode_and_threshold() {
            Some(v) => v,
            None => return,
        };
        engine.coordinator.with_active_count(|active_count| {
            let mut table = engine.region_table.lock();
            if let Some(record) = table.get_mut(&region_id) {
                if record.depth > 0 {
                    record.depth -= 1;
                }
                if !record.inactive {
                    if !record.deletable {
                        let delta = timestamp.saturating_sub(record.last_enter);
                        record.call_count += 1;
                        record.total_duration += delta;
                    }
                    let family = engine.probe.classify();
                    let capture = move || {
                        family.and_then(|f| engine.probe.find_call_site(f.exit_symbol))
                    };
                    decision::apply_decision(&mut table, region_id, mode, threshold, Some(&capture));
                }
            }
            if *active_count == 0 {
                sweep(engine, &mut table);
            }
        });
    } else {
        LOCATION.with(|location| {
            let mut location = location.borrow_mut();
            if let Some(shadow) = location.shadow.as_mut() {
                if let Some(record) = shadow.get_mut(region_id) {
                    record.local_call_count += 1;
                    record.local_duration += timestamp.saturating_sub(record.last_enter);
                }
            }
        });
    }
}

fn sweep(engine: &Engine, table: &mut std::collections::HashMap<RegionId, crate::region::RegionRecord>) {
    if !engine.architecture_supported {
        return;
    }
    for record in table.values_mut() {
        if !record.ready_for_sweep() {
            continue;
        }
        let region_id = record.region_id;
        if !record.entry_already_patched() {
            match patch_one(engine, record.entry_site_addr.unwrap()) {
                Ok(()) => record.mark_entry_patched(),
                Err(e) => log::warn!("failed to patch entry site of region {}: {}", region_id, e),
            }
        }
        if !record.exit_already_patched() {
            match patch_one(engine, record.exit_site_addr.unwrap()) {
                Ok(()) => record.mark_exit_patched(),
                Err(e) => log::warn!("failed to patch exit site of region {}: {}", region_id, e),
            }
        }
        record.maybe_finish();
        if record.inactive {
            log::debug!("patched region {} ({})", region_id, record.region_name);
        }
    }
}

fn patch_one(engine: &Engine, addr: usize) -> Result<(), PatchError> {
    // SAFETY: only reachable from `sweep`, which only runs while the
    // deletion coordinator's active-thread count is observed to be zero,
    // so no other thread is executing through `addr` or patching
    // alongside this call.
    unsafe { engine.patcher.patch(addr) }
}
