/// Name of the counter incremented once per poll.
pub const POLL_COUNT: &str = "PollCount";

/// Name of the gauge refreshed with a random value on every poll.
pub const RANDOM_VALUE: &str = "RandomValue";

/// Runtime allocator statistics sampled by the agent on every poll.
///
/// Field names follow the well-known allocator gauge set; each field is
/// published as a gauge under its `PascalCase` name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeSample {
    pub alloc: u64,
    pub buck_hash_sys: u64,
    pub frees: u64,
    pub gc_cpu_fraction: f64,
    pub gc_sys: u64,
    pub heap_alloc: u64,
    pub heap_idle: u64,
    pub heap_inuse: u64,
    pub heap_objects: u64,
    pub heap_released: u64,
    pub heap_sys: u64,
    pub last_gc: u64,
    pub lookups: u64,
    pub mcache_inuse: u64,
    pub mcache_sys: u64,
    pub mspan_inuse: u64,
    pub mspan_sys: u64,
    pub mallocs: u64,
    pub next_gc: u64,
    pub num_forced_gc: u64,
    pub num_gc: u64,
    pub other_sys: u64,
    pub pause_total_ns: u64,
    pub stack_inuse: u64,
    pub stack_sys: u64,
    pub sys: u64,
    pub total_alloc: u64,
}

impl RuntimeSample {
    /// Number of gauges produced by [`RuntimeSample::gauges`].
    pub const GAUGE_COUNT: usize = 27;

    /// Returns every field as a `(gauge name, value)` pair.
    pub fn gauges(&self) -> [(&'static str, f64); Self::GAUGE_COUNT] {
        [
            ("Alloc", self.alloc as f64),
            ("BuckHashSys", self.buck_hash_sys as f64),
            ("Frees", self.frees as f64),
            ("GCCPUFraction", self.gc_cpu_fraction),
            ("GCSys", self.gc_sys as f64),
            ("HeapAlloc", self.heap_alloc as f64),
            ("HeapIdle", self.heap_idle as f64),
            ("HeapInuse", self.heap_inuse as f64),
            ("HeapObjects", self.heap_objects as f64),
            ("HeapReleased", self.heap_released as f64),
            ("HeapSys", self.heap_sys as f64),
            ("LastGC", self.last_gc as f64),
            ("Lookups", self.lookups as f64),
            ("MCacheInuse", self.mcache_inuse as f64),
            ("MCacheSys", self.mcache_sys as f64),
            ("MSpanInuse", self.mspan_inuse as f64),
            ("MSpanSys", self.mspan_sys as f64),
            ("Mallocs", self.mallocs as f64),
            ("NextGC", self.next_gc as f64),
            ("NumForcedGC", self.num_forced_gc as f64),
            ("NumGC", self.num_gc as f64),
            ("OtherSys", self.other_sys as f64),
            ("PauseTotalNs", self.pause_total_ns as f64),
            ("StackInuse", self.stack_inuse as f64),
            ("StackSys", self.stack_sys as f64),
            ("Sys", self.sys as f64),
            ("TotalAlloc", self.total_alloc as f64),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn gauge_names_are_unique() {
        let sample = RuntimeSample::default();
        let names: HashSet<&str> = sample.gauges().iter().map(|(n, _)| *n).collect();
        assert_eq!(names.len(), RuntimeSample::GAUGE_COUNT);
        assert!(names.contains("GCCPUFraction"));
        assert!(!names.contains(POLL_COUNT));
    }

    #[test]
    fn gauges_carry_field_values() {
        let sample = RuntimeSample {
            heap_alloc: 1024,
            gc_cpu_fraction: 0.25,
            ..Default::default()
        };
        let gauges = sample.gauges();
        assert!(gauges.contains(&("HeapAlloc", 1024.0)));
        assert!(gauges.contains(&("GCCPUFraction", 0.25)));
    }
}
