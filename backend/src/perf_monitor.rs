//! Collection timing diagnostics.
//!
//! Tracks per-source and whole-cycle durations so `/api/status` can report
//! which upstream is slow. Pure accounting, no behavior.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::{json, Map, Value};

#[derive(Default, Clone)]
struct Timing {
    count: u64,
    cache_hits: u64,
    last_ms: f64,
    total_ms: f64,
    max_ms: f64,
    last_node_count: usize,
}

impl Timing {
    fn record(&mut self, duration_ms: f64, node_count: usize, from_cache: bool) {
        self.count += 1;
        if from_cache {
            self.cache_hits += 1;
        }
        self.last_ms = duration_ms;
        self.total_ms += duration_ms;
        self.max_ms = self.max_ms.max(duration_ms);
        self.last_node_count = node_count;
    }

    fn to_value(&self) -> Value {
        let avg = if self.count > 0 {
            self.total_ms / self.count as f64
        } else {
            0.0
        };
        json!({
            "count": self.count,
            "cache_hits": self.cache_hits,
            "last_ms": (self.last_ms * 10.0).round() / 10.0,
            "avg_ms": (avg * 10.0).round() / 10.0,
            "max_ms": (self.max_ms * 10.0).round() / 10.0,
            "last_node_count": self.last_node_count,
        })
    }
}

#[derive(Default)]
pub struct PerfMonitor {
    sources: Mutex<HashMap<String, Timing>>,
    cycle: Mutex<Timing>,
}

impl PerfMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_collection(
        &self,
        source: &str,
        duration_ms: f64,
        node_count: usize,
        from_cache: bool,
    ) {
        self.sources
            .lock()
            .unwrap()
            .entry(source.to_string())
            .or_default()
            .record(duration_ms, node_count, from_cache);
    }

    pub fn record_cycle(&self, duration_ms: f64, node_count: usize) {
        self.cycle.lock().unwrap().record(duration_ms, node_count, false);
    }

    pub fn stats(&self) -> Map<String, Value> {
        let sources = self.sources.lock().unwrap();
        let mut per_source = Map::new();
        for (name, timing) in sources.iter() {
            per_source.insert(name.clone(), timing.to_value());
        }
        let mut stats = Map::new();
        stats.insert("cycle".into(), self.cycle.lock().unwrap().to_value());
        stats.insert("sources".into(), Value::Object(per_source));
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_averages() {
        let perf = PerfMonitor::new();
        perf.record_collection("meshtastic", 10.0, 5, false);
        perf.record_collection("meshtastic", 30.0, 6, true);
        perf.record_cycle(50.0, 11);

        let stats = perf.stats();
        let m = &stats["sources"]["meshtastic"];
        assert_eq!(m["count"], json!(2));
        assert_eq!(m["cache_hits"], json!(1));
        assert_eq!(m["avg_ms"], json!(20.0));
        assert_eq!(m["max_ms"], json!(30.0));
        assert_eq!(stats["cycle"]["last_node_count"], json!(11));
    }
}
