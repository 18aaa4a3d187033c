//! Pipeline counters.
//!
//! Lock-free `AtomicU64` counters incremented on the turn path and read on
//! export. Degradations (exhaustion, leakage, graph fallback, dropped facts)
//! are never errors, so these counters are the main way to see them.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters for the turn pipeline.
#[derive(Debug)]
pub struct PipelineCounters {
    /// Turns completed.
    pub turns: AtomicU64,
    /// Turns that used the exhausted-pool fallback narrative.
    pub exhaustion_fallbacks: AtomicU64,
    /// Structured calls retried because of leaked instructions.
    pub leak_retries: AtomicU64,
    /// Turns whose output was replaced after a repeated leak.
    pub leak_fallbacks: AtomicU64,
    /// Player actions rejected by the input filter.
    pub actions_rejected: AtomicU64,
    /// Facts dispatched into a world.
    pub facts_merged: AtomicU64,
    /// Structured fact records dropped as malformed.
    pub facts_dropped: AtomicU64,
    /// Facts written to the external graph database.
    pub graph_writes_external: AtomicU64,
    /// Facts written to the JSON graph.
    pub graph_writes_json: AtomicU64,
    /// Facts that no graph backend accepted.
    pub graph_write_failures: AtomicU64,
}

impl PipelineCounters {
    /// Create a new set of zeroed counters.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            turns: AtomicU64::new(0),
            exhaustion_fallbacks: AtomicU64::new(0),
            leak_retries: AtomicU64::new(0),
            leak_fallbacks: AtomicU64::new(0),
            actions_rejected: AtomicU64::new(0),
            facts_merged: AtomicU64::new(0),
            facts_dropped: AtomicU64::new(0),
            graph_writes_external: AtomicU64::new(0),
            graph_writes_json: AtomicU64::new(0),
            graph_write_failures: AtomicU64::new(0),
        }
    }

    /// Add `n` to a counter.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Add one to a counter.
    pub fn incr(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    /// Snapshot all counters for export.
    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            turns: self.turns.load(Ordering::Relaxed),
            exhaustion_fallbacks: self.exhaustion_fallbacks.load(Ordering::Relaxed),
            leak_retries: self.leak_retries.load(Ordering::Relaxed),
            leak_fallbacks: self.leak_fallbacks.load(Ordering::Relaxed),
            actions_rejected: self.actions_rejected.load(Ordering::Relaxed),
            facts_merged: self.facts_merged.load(Ordering::Relaxed),
            facts_dropped: self.facts_dropped.load(Ordering::Relaxed),
            graph_writes_external: self.graph_writes_external.load(Ordering::Relaxed),
            graph_writes_json: self.graph_writes_json.load(Ordering::Relaxed),
            graph_write_failures: self.graph_write_failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for PipelineCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of counter values at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Turns completed.
    pub turns: u64,
    /// Exhausted-pool fallbacks.
    pub exhaustion_fallbacks: u64,
    /// Leak retries.
    pub leak_retries: u64,
    /// Leak fallbacks.
    pub leak_fallbacks: u64,
    /// Rejected player actions.
    pub actions_rejected: u64,
    /// Facts merged.
    pub facts_merged: u64,
    /// Facts dropped.
    pub facts_dropped: u64,
    /// External graph writes.
    pub graph_writes_external: u64,
    /// JSON graph writes.
    pub graph_writes_json: u64,
    /// Graph write failures.
    pub graph_write_failures: u64,
}

impl CounterSnapshot {
    /// Format as Prometheus-compatible text.
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let rows: [(&str, &str, u64); 10] = [
            ("tale_turns_total", "Turns completed", self.turns),
            ("tale_exhaustion_fallbacks_total", "Exhausted-pool fallbacks", self.exhaustion_fallbacks),
            ("tale_leak_retries_total", "Leak retries", self.leak_retries),
            ("tale_leak_fallbacks_total", "Leak fallbacks", self.leak_fallbacks),
            ("tale_actions_rejected_total", "Rejected player actions", self.actions_rejected),
            ("tale_facts_merged_total", "Facts merged into worlds", self.facts_merged),
            ("tale_facts_dropped_total", "Malformed facts dropped", self.facts_dropped),
            ("tale_graph_writes_external_total", "Graph database writes", self.graph_writes_external),
            ("tale_graph_writes_json_total", "JSON graph writes", self.graph_writes_json),
            ("tale_graph_write_failures_total", "Facts no graph backend accepted", self.graph_write_failures),
        ];
        let mut out = String::new();
        for (name, help, value) in rows {
            out.push_str(&format!("# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment_and_snapshot() {
        let counters = PipelineCounters::new();
        PipelineCounters::incr(&counters.turns);
        PipelineCounters::add(&counters.facts_merged, 4);
        let snap = counters.snapshot();
        assert_eq!(snap.turns, 1);
        assert_eq!(snap.facts_merged, 4);
        assert_eq!(snap.leak_fallbacks, 0);
    }

    #[test]
    fn prometheus_export_lists_every_counter() {
        let snap = CounterSnapshot {
            turns: 3,
            ..CounterSnapshot::default()
        };
        let text = snap.to_prometheus();
        assert!(text.contains("tale_turns_total 3"));
        assert_eq!(text.matches("# TYPE").count(), 10);
    }
}
