//! Environment-variable configuration, read once at `init`.

use crate::error::FilterError;

pub const THRESHOLD_VAR: &str = "SCOREP_SUBSTRATES_DYNAMIC_FILTERING_THRESHOLD";
pub const METHOD_VAR: &str = "SCOREP_SUBSTRATES_DYNAMIC_FILTERING_METHOD";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    Absolute,
    Relative,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterConfig {
    pub threshold_ticks: u64,
    pub mode: FilterMode,
}

impl FilterConfig {
    pub fn from_env() -> Result<Self, FilterError> {
        Self::parse(|key| std::env::var(key).ok())
    }

    /// Parses from an injected lookup rather than the real environment so
    /// that tests don't have to mutate global process state.
    pub fn parse(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, FilterError> {
        let threshold_raw = lookup(THRESHOLD_VAR)
            .ok_or_else(|| FilterError::Config(format!("{} is not set", THRESHOLD_VAR)))?;
        let threshold_ticks: u64 = threshold_raw.trim().parse().map_err(|_| {
            FilterError::Config(format!(
                "{} must be a positive integer number of ticks, got {:?}",
                THRESHOLD_VAR, threshold_raw
            ))
        })?;
        if threshold_ticks == 0 {
            return Err(FilterError::Config(format!(
                "{} must be non-zero",
                THRESHOLD_VAR
            )));
        }

        let method_raw = lookup(METHOD_VAR)
            .ok_or_else(|| FilterError::Config(format!("{} is not set", METHOD_VAR)))?;
        let mode = if method_raw.trim() == "absolute" {
            FilterMode::Absolute
        } else {
            FilterMode::Relative
        };

        Ok(FilterConfig {
            threshold_ticks,
            mode,
        })
    }
}
