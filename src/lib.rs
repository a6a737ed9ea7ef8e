//! Online self-filtering of compiler-inserted instrumentation.
//!
//! A scientific application compiled with `-finstrument-functions` (or an
//! equivalent compiler-hook mechanism) calls into an entry/exit hook pair on
//! every function prologue and epilogue. This crate watches each such
//! *region* for a short warm-up, decides whether its mean cost is cheap
//! enough to be not worth recording, and -- once it is safe to do so --
//! rewrites the two call instructions in the live text segment with 5-byte
//! NOPs so future calls run with zero instrumentation overhead.
//!
//! `engine` holds the pure-Rust event dispatcher and accounting logic;
//! `ffi` is the only module that knows about the measurement framework's C
//! ABI and marshals its callbacks into `engine`'s safe API.

mod config;
mod coordinator;
mod decision;
mod diagnostics;
mod engine;
mod error;
mod patch;
mod region;
mod shadow;
mod unwind;

mod ffi;

pub use config::{FilterConfig, FilterMode, METHOD_VAR, THRESHOLD_VAR};
pub use error::FilterError;
pub use region::{RegionId, RegionParadigm};

#[cfg(test)]
mod tests;
