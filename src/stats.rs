//! Engine statistics
//!
//! Counters the engine keeps as it schedules units, plus the per-item
//! report printed at shutdown when profiling is on.

use crate::entry::CallCounts;
use crate::item::MutationRecord;

/// Engine-wide counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineCounters {
    pub items_created: u64,
    pub units_created: u64,
    pub units_compiled: u64,
    pub units_failed: u64,
    pub units_loaded: u64,
    /// Re-queued because the global speculation state changed
    pub units_requeued: u64,
    pub units_reclaimed: u64,
    pub mutations: u64,
    pub missing_symbols: u64,
}

/// One item in the statistics report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemStats {
    pub label: String,
    pub unit: Option<u32>,
    pub item: u32,
    pub size: usize,
    pub counts: CallCounts,
    pub mutations: Vec<Option<MutationRecord>>,
}

/// Snapshot of the engine for reporting
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JitStatistics {
    pub counters: EngineCounters,
    /// Most called first; ties broken by larger size
    pub items: Vec<ItemStats>,
}

impl JitStatistics {
    pub fn new(counters: EngineCounters, mut items: Vec<ItemStats>) -> Self {
        items.sort_by(|a, b| {
            b.counts
                .calls
                .cmp(&a.counts.calls)
                .then_with(|| b.size.cmp(&a.size))
        });
        Self { counters, items }
    }

    /// Human-readable table of item statistics
    pub fn report(&self, opcode_name: &dyn Fn(u16) -> String) -> String {
        let mut s = String::new();
        s.push_str(&format!(
            "{:<45} {:>5} {:>4} {:>5} {:>9}/{:<9} {:>8} {:>9} {:>8}   Mutations\n",
            "Name", "Unit", "Item", "Size", "Calls", "JIT", "(JIT%)", "Fails", "(Fail%)"
        ));
        for row in &self.items {
            let c = row.counts;
            let unit = row.unit.map(|u| u.to_string()).unwrap_or_else(|| "-".to_string());
            s.push_str(&format!(
                "{:<45} {:>5} {:>4} {:>5} {:>9}/{:<9} {:>7.2}% {:>9} {:>7.2}%  ",
                row.label,
                unit,
                row.item,
                row.size,
                c.calls,
                c.jit_calls,
                percent(c.jit_calls, c.calls),
                c.failed_jit_calls,
                percent(c.failed_jit_calls, c.jit_calls),
            ));
            for record in &row.mutations {
                match record {
                    Some(r) => s.push_str(&format!(" {}@{}", opcode_name(r.opcode), r.pc)),
                    None => s.push_str(" -"),
                }
            }
            s.push('\n');
        }
        let k = &self.counters;
        s.push_str(&format!(
            "Units: {} created, {} compiled, {} loaded, {} failed, {} re-queued, {} reclaimed\n",
            k.units_created, k.units_compiled, k.units_loaded, k.units_failed, k.units_requeued, k.units_reclaimed
        ));
        s.push_str(&format!(
            "Items: {} created, {} mutations, {} missing symbols\n",
            k.items_created, k.mutations, k.missing_symbols
        ));
        s
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(label: &str, calls: u64, size: usize) -> ItemStats {
        ItemStats {
            label: label.to_string(),
            unit: Some(0),
            item: 0,
            size,
            counts: CallCounts { calls, jit_calls: calls / 2, failed_jit_calls: 0 },
            mutations: vec![],
        }
    }

    #[test]
    fn test_sorted_by_calls_then_size() {
        let stats = JitStatistics::new(
            EngineCounters::default(),
            vec![row("a", 5, 10), row("b", 50, 1), row("c", 5, 30)],
        );
        let labels: Vec<_> = stats.items.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_report_lists_mutations() {
        let mut r = row("Vec#dot", 10, 4);
        r.mutations = vec![Some(MutationRecord { pc: 6, opcode: 3 }), None];
        let stats = JitStatistics::new(EngineCounters { units_created: 1, ..Default::default() }, vec![r]);
        let report = stats.report(&|op| format!("op{op}"));
        assert!(report.contains("Vec#dot"));
        assert!(report.contains(" op3@6 -"));
        assert!(report.contains("50.00%"));
        assert!(report.contains("Units: 1 created"));
    }

    #[test]
    fn test_percent_handles_zero() {
        assert_eq!(percent(3, 0), 0.0);
        assert_eq!(percent(1, 4), 25.0);
    }
}
