//! Free-form diagnostic output. Routine messages go through the `log`
//! facade so a host application embedding this plug-in controls their
//! formatting and destination (or silently drops them if it never installs
//! a logger, which is the right default for a library loaded into someone
//! else's process). The optional teardown dump is a build-time feature
//! because it's meant for a human reading stderr after the run, not for
//! whatever logging backend happened to be wired up.

#[cfg(feature = "dump-region-table")]
use crate::region::{RegionId, RegionRecord};
#[cfg(feature = "dump-region-table")]
use std::collections::HashMap;

#[cfg(feature = "dump-region-table")]
pub fn dump_region_table(table: &HashMap<RegionId, RegionRecord>) {
    eprintln!(
        "{:<10} {:<32} {:>10} {:>14} {:>12} {:>10} {:>9}",
        "region_id", "name", "calls", "total_ticks", "mean_ticks", "deletable", "inactive"
    );
    let mut ids: Vec<_> = table.keys().copied().collect();
    ids.sort_unstable();
    for id in ids {
        let record = &table[&id];
        eprintln!(
            "{:<10} {:<32} {:>10} {:>14} {:>12.2} {:>10} {:>9}",
            record.region_id,
            record.region_name,
            record.call_count,
            record.total_duration,
            record.mean_duration,
            record.deletable,
            record.inactive
        );
    }
}

#[cfg(not(feature = "dump-region-table"))]
pub fn dump_region_table(_table: &std::collections::HashMap<crate::region::RegionId, crate::region::RegionRecord>) {
}
