//! C ABI surface consumed by the measurement framework.
//! This is the only module that knows about raw pointers, `extern "C"`
//! calling convention, or the framework's callback-table shape; everything
//! it touches is a thin marshal into `engine.rs`'s safe, pure-Rust API.

#![allow(non_camel_case_types)]

use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_void};
use std::sync::Mutex;

use crate::engine::{self, Engine};
use crate::patch::CodePatcher;
#[cfg(target_arch = "x86_64")]
use crate::patch::LibcPageProtector;
#[cfg(not(target_arch = "x86_64"))]
use crate::patch::UnsupportedArchProtector;
use crate::region::RegionParadigm;
use crate::unwind::{BacktraceStackWalker, UnwindProbe};

pub type SCOREP_LocationHandle = *mut c_void;

/// The framework's paradigm tag for compiler-instrumented (`-finstrument-functions`
/// style) regions. Everything else is ignored by `define_handle`.
pub const SCOREP_PARADIGM_COMPILER: c_int = 1;

const EVENT_ENTER_REGION: usize = 0;
const EVENT_EXIT_REGION: usize = 1;
const EVENT_THREAD_FORK_JOIN_TEAM_BEGIN: usize = 2;
const EVENT_THREAD_FORK_JOIN_TEAM_END: usize = 3;
/// Upper bound on the framework's event-function table. Score-P's real
/// enum has more entries than the four this plug-in populates; the exact
/// count isn't load-bearing here since every other slot is left null.
const EVENT_TABLE_SIZE: usize = 32;

/// Accessors the framework hands over via `set_callbacks`, used to query
/// region metadata and location identity from opaque handles.
#[repr(C)]
pub struct SCOREP_SubstrateCallbacks {
    pub region_name: Option<unsafe extern "C" fn(u64) -> *const c_char>,
    pub region_paradigm: Option<unsafe extern "C" fn(u64) -> c_int>,
    pub location_id: Option<unsafe extern "C" fn(SCOREP_LocationHandle) -> u64>,
}

struct HandleAccessors {
    region_name: unsafe extern "C" fn(u64) -> *const c_char,
    region_paradigm: unsafe extern "C" fn(u64) -> c_int,
    location_id: unsafe extern "C" fn(SCOREP_LocationHandle) -> u64,
}

// SAFETY: plain `extern "C" fn` pointers are Send + Sync; there's no
// shared mutable state behind them.
unsafe impl Send for HandleAccessors {}
unsafe impl Sync for HandleAccessors {}

lazy_static::lazy_static! {
    static ref ENGINE: Engine = build_engine();
    static ref ACCESSORS: Mutex<Option<HandleAccessors>> = Mutex::new(None);
}

#[cfg(target_arch = "x86_64")]
fn build_patcher() -> CodePatcher {
    CodePatcher::new(Box::new(LibcPageProtector))
}

#[cfg(not(target_arch = "x86_64"))]
fn build_patcher() -> CodePatcher {
    CodePatcher::new(Box::new(UnsupportedArchProtector))
}

fn build_engine() -> Engine {
    let probe = UnwindProbe::new(Box::new(BacktraceStackWalker));
    Engine::new(probe, build_patcher(), cfg!(target_arch = "x86_64"))
}

fn location_id_of(location: SCOREP_LocationHandle) -> u64 {
    ACCESSORS
        .lock()
        .expect("accessors mutex poisoned")
        .as_ref()
        .map(|a| unsafe { (a.location_id)(location) })
        .unwrap_or(0)
}

/// `#[repr(C)]` table of function pointers, mirroring the subset of the
/// `SCOREP_SubstratePluginInfo` struct this plug-in populates. All
/// other fields of the real framework struct are left zeroed by the
/// framework's own loader and never touched here.
#[repr(C)]
pub struct SCOREP_SubstratePluginInfo {
    pub early_init: Option<unsafe extern "C" fn() -> c_int>,
    pub assign_id: Option<unsafe extern "C" fn(u32) -> u32>,
    pub finalize: Option<unsafe extern "C" fn() -> i32>,
    pub create_location: Option<unsafe extern "C" fn(SCOREP_LocationHandle, SCOREP_LocationHandle)>,
    pub delete_location: Option<unsafe extern "C" fn(SCOREP_LocationHandle)>,
    pub define_handle: Option<unsafe extern "C" fn(u64, c_int)>,
    pub get_event_functions: Option<unsafe extern "C" fn(c_int, *mut *mut c_void) -> u32>,
    pub set_callbacks: Option<unsafe extern "C" fn(*const SCOREP_SubstrateCallbacks, usize)>,
    pub write_data: Option<unsafe extern "C" fn()>,
    pub plugin_version: u32,
}

const PLUGIN_ABI_VERSION: u32 = 1;

unsafe extern "C" fn early_init_cb() -> c_int {
    match engine::init(&ENGINE, |key| std::env::var(key).ok()) {
        Ok(()) => 0,
        Err(e) => {
            log::error!("{}", e);
            1
        }
    }
}

unsafe extern "C" fn assign_id_cb(plugin_id: u32) -> u32 {
    engine::assign_id(&ENGINE, plugin_id as i32);
    plugin_id
}

unsafe extern "C" fn finalize_cb() -> i32 {
    engine::finalize(&ENGINE)
}

unsafe extern "C" fn create_location_cb(
    location: SCOREP_LocationHandle,
    _parent: SCOREP_LocationHandle,
) {
    engine::create_location(&ENGINE, location_id_of(location));
}

unsafe extern "C" fn delete_location_cb(_location: SCOREP_LocationHandle) {
    engine::delete_location(&ENGINE);
}

unsafe extern "C" fn define_handle_cb(handle: u64, handle_type: c_int) {
    if handle_type != SCOREP_PARADIGM_COMPILER {
        return;
    }
    let guard = ACCESSORS.lock().expect("accessors mutex poisoned");
    let accessors = match guard.as_ref() {
        Some(a) => a,
        None => return,
    };
    let paradigm = if (accessors.region_paradigm)(handle) == SCOREP_PARADIGM_COMPILER {
        RegionParadigm::CompilerHook
    } else {
        RegionParadigm::Other
    };
    let name_ptr = (accessors.region_name)(handle);
    let name = if name_ptr.is_null() {
        String::new()
    } else {
        CStr::from_ptr(name_ptr).to_string_lossy().into_owned()
    };
    engine::define_region(&ENGINE, handle as u32, &name, paradigm);
}

unsafe extern "C" fn enter_region_cb(timestamp: u64, region: u64) {
    engine::enter_region(&ENGINE, timestamp, region as u32);
}

unsafe extern "C" fn exit_region_cb(timestamp: u64, region: u64) {
    engine::exit_region(&ENGINE, timestamp, region as u32);
}

unsafe extern "C" fn team_begin_cb(_location: SCOREP_LocationHandle) {
    engine::team_begin(&ENGINE);
}

unsafe extern "C" fn team_end_cb(_location: SCOREP_LocationHandle) {
    engine::team_end(&ENGINE);
}

unsafe extern "C" fn get_event_functions_cb(_mode: c_int, functions: *mut *mut c_void) -> u32 {
    if functions.is_null() {
        return 0;
    }
    let slots = std::slice::from_raw_parts_mut(functions, EVENT_TABLE_SIZE);
    for slot in slots.iter_mut() {
        *slot = std::ptr::null_mut();
    }
    slots[EVENT_ENTER_REGION] = enter_region_cb as usize as *mut c_void;
    slots[EVENT_EXIT_REGION] = exit_region_cb as usize as *mut c_void;
    slots[EVENT_THREAD_FORK_JOIN_TEAM_BEGIN] = team_begin_cb as usize as *mut c_void;
    slots[EVENT_THREAD_FORK_JOIN_TEAM_END] = team_end_cb as usize as *mut c_void;
    EVENT_TABLE_SIZE as u32
}

unsafe extern "C" fn set_callbacks_cb(callbacks: *const SCOREP_SubstrateCallbacks, _size: usize) {
    if callbacks.is_null() {
        return;
    }
    let callbacks = &*callbacks;
    if let (Some(region_name), Some(region_paradigm), Some(location_id)) = (
        callbacks.region_name,
        callbacks.region_paradigm,
        callbacks.location_id,
    ) {
        *ACCESSORS.lock().expect("accessors mutex poisoned") = Some(HandleAccessors {
            region_name,
            region_paradigm,
            location_id,
        });
    }
}

/// The single entry point the framework looks up by name (by convention,
/// `get_<plugin-name>_plugin_info`) when it loads this shared object.
#[no_mangle]
pub extern "C" fn get_dynamic_filtering_plugin_info() -> SCOREP_SubstratePluginInfo {
    SCOREP_SubstratePluginInfo {
        early_init: Some(early_init_cb),
        assign_id: Some(assign_id_cb),
        finalize: Some(finalize_cb),
        create_location: Some(create_location_cb),
        delete_location: Some(delete_location_cb),
        define_handle: Some(define_handle_cb),
        get_event_functions: Some(get_event_functions_cb),
        set_callbacks: Some(set_callbacks_cb),
        write_data: None,
        plugin_version: PLUGIN_ABI_VERSION,
    }
}
