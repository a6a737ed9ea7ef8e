//! Call-site discovery by stack unwinding.
//!
//! Isolated behind `StackWalker` so the production backend (real frame
//! walking via the `backtrace` crate) can be swapped for a fake in tests.

use std::sync::Mutex;

/// One unwound frame: its instruction pointer and, if resolvable, the
/// mangled or demangled procedure name backtrace found for it.
#[derive(Debug, Clone)]
pub struct Frame {
    pub ip: usize,
    pub symbol_name: Option<String>,
}

pub trait StackWalker: Send + Sync {
    /// Frames ordered innermost (the caller of this function) first,
    /// outward toward the process entry point.
    fn walk(&self) -> Vec<Frame>;
}

pub struct BacktraceStackWalker;

impl StackWalker for BacktraceStackWalker {
    fn walk(&self) -> Vec<Frame> {
        let mut frames = Vec::new();
        backtrace::trace(|frame| {
            let ip = frame.ip() as usize;
            let mut symbol_name = None;
            backtrace::resolve_frame(frame, |symbol| {
                if symbol_name.is_none() {
                    symbol_name = symbol.name().map(|name| name.to_string());
                }
            });
            frames.push(Frame { ip, symbol_name });
            true
        });
        frames
    }
}

/// The three hook-symbol families this plug-in knows how to recognize.
/// First match, scanning in this order, wins and is cached for the run.
pub const HOOK_FAMILIES: &[(&str, &str)] = &[
    ("__cyg_profile_func_enter", "__cyg_profile_func_exit"),
    (
        "scorep_plugin_enter_region",
        "scorep_plugin_exit_region",
    ),
    ("__VT_IntelEntry", "__VT_IntelExit"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookFamily {
    pub enter_symbol: &'static str,
    pub exit_symbol: &'static str,
}

const NOP5_LEN: usize = 5;

/// Result of trying to match the current stack against `HOOK_FAMILIES`,
/// cached so a binary using an unrecognized instrumentation mechanism only
/// ever walks its stack (and warns) once.
#[derive(Debug, Clone, Copy)]
enum Classification {
    Known(HookFamily),
    NoMatch,
}

pub struct UnwindProbe {
    walker: Box<dyn StackWalker>,
    family: Mutex<Option<Classification>>,
}

impl UnwindProbe {
    pub fn new(walker: Box<dyn StackWalker>) -> Self {
        Self {
            walker,
            family: Mutex::new(None),
        }
    }

    /// Walks the stack once (unless already classified) and matches
    /// procedure names against `HOOK_FAMILIES`. Racing first calls from
    /// multiple threads is benign: every caller computes the same answer
    /// from the same fixed table, so whichever write lands first is
    /// correct, and at worst the one-time warning below fires from more
    /// than one thread.
    pub fn classify(&self) -> Option<HookFamily> {
        if let Some(cached) = *self.family.lock().expect("unwind probe mutex poisoned") {
            return match cached {
                Classification::Known(family) => Some(family),
                Classification::NoMatch => None,
            };
        }
        let frames = self.walker.walk();
        let found = HOOK_FAMILIES.iter().find_map(|&(enter, exit)| {
            frames
                .iter()
                .any(|frame| frame.symbol_name.as_deref() == Some(enter))
                .then(|| HookFamily {
                    enter_symbol: enter,
                    exit_symbol: exit,
                })
        });
        let classification = match found {
            Some(family) => Classification::Known(family),
            None => {
                log::warn!(
                    "no known hook-symbol family found on the stack; dynamic filtering is disabled for this run"
                );
                Classification::NoMatch
            }
        };
        *self.family.lock().expect("unwind probe mutex poisoned") = Some(classification);
        found
    }

    /// Address of the five-byte `call` instruction, in the caller of the
    /// outermost frame whose procedure name equals `target_symbol`. `None`
    /// if `target_symbol` doesn't appear on the current stack at all.
    pub fn find_call_site(&self, target_symbol: &str) -> Option<usize> {
        let frames = self.walker.walk();
        let outermost_hook_index = frames
            .iter()
            .rposition(|frame| frame.symbol_name.as_deref() == Some(target_symbol))?;
        let caller = frames.get(outermost_hook_index + 1)?;
        Some(caller.ip.wrapping_sub(NOP5_LEN))
    }
}


#[cfg(test)]
mod tests {
    use super::fakes::FixedStackWalker;
    use super::*;

    #[test]
    fn classifies_known_family() {
        let probe = UnwindProbe::new(Box::new(FixedStackWalker::with_hook_at(
            "__cyg_profile_func_enter",
            0x3005,
        )));
        let family = probe.classify().expect("should classify");
        assert_eq!(family.enter_symbol, "__cyg_profile_func_enter");
        assert_eq!(family.exit_symbol, "__cyg_profile_func_exit");
    }

    #[test]
    fn unknown_family_returns_none_forever() {
        let probe = UnwindProbe::new(Box::new(FixedStackWalker::empty()));
        assert!(probe.classify().is_none());
        assert!(probe.classify().is_none());
    }

    #[test]
    fn call_site_is_caller_ip_minus_five() {
        let probe = UnwindProbe::new(Box::new(FixedStackWalker::with_hook_at(
            "scorep_plugin_enter_region",
            0x4005,
        )));
        let site = probe
            .find_call_site("scorep_plugin_enter_region")
            .expect("call site should be found");
        assert_eq!(site, 0x4000);
    }

    #[test]
    fn missing_symbol_yields_null() {
        let probe = UnwindProbe::new(Box::new(FixedStackWalker::empty()));
        assert!(probe.find_call_site("scorep_plugin_exit_region").is_none());
    }
}
