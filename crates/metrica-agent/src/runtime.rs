//! Allocator statistics read from jemalloc through `mallctl`.

use std::ffi::CStr;
use std::ptr;

use metrica_core::models::RuntimeSample;
use tracing::debug;

/// Raw jemalloc counters, refreshed by bumping the `epoch` control.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JemallocStats {
    pub allocated: u64,
    pub active: u64,
    pub mapped: u64,
    pub retained: u64,
    pub resident: u64,
    pub metadata: u64,
    pub small_nmalloc: u64,
    pub small_ndalloc: u64,
    pub small_nrequests: u64,
    pub large_nmalloc: u64,
    pub large_ndalloc: u64,
    pub large_nrequests: u64,
}

impl JemallocStats {
    /// Refreshes the stats epoch and reads every counter. Unreadable counters stay at 0.
    pub fn read() -> Self {
        refresh_epoch();
        Self {
            allocated: read_size(c"stats.allocated"),
            active: read_size(c"stats.active"),
            mapped: read_size(c"stats.mapped"),
            retained: read_size(c"stats.retained"),
            resident: read_size(c"stats.resident"),
            metadata: read_size(c"stats.metadata"),
            // Arena index 4096 (MALLCTL_ARENAS_ALL) merges every arena.
            small_nmalloc: read_u64(c"stats.arenas.4096.small.nmalloc"),
            small_ndalloc: read_u64(c"stats.arenas.4096.small.ndalloc"),
            small_nrequests: read_u64(c"stats.arenas.4096.small.nrequests"),
            large_nmalloc: read_u64(c"stats.arenas.4096.large.nmalloc"),
            large_ndalloc: read_u64(c"stats.arenas.4096.large.ndalloc"),
            large_nrequests: read_u64(c"stats.arenas.4096.large.nrequests"),
        }
    }
}

impl From<&JemallocStats> for RuntimeSample {
    fn from(s: &JemallocStats) -> Self {
        let mallocs = s.small_nmalloc + s.large_nmalloc;
        let frees = s.small_ndalloc + s.large_ndalloc;
        RuntimeSample {
            alloc: s.allocated,
            heap_alloc: s.allocated,
            total_alloc: s.allocated,
            heap_inuse: s.active,
            heap_sys: s.mapped,
            heap_idle: s.mapped.saturating_sub(s.active),
            heap_released: s.retained,
            sys: s.resident,
            other_sys: s.metadata,
            gc_sys: s.metadata,
            mallocs,
            frees,
            heap_objects: mallocs.saturating_sub(frees),
            lookups: s.small_nrequests + s.large_nrequests,
            ..Default::default()
        }
    }
}

/// Samples the allocator for one poll.
pub fn sample() -> RuntimeSample {
    RuntimeSample::from(&JemallocStats::read())
}

fn refresh_epoch() {
    let mut epoch: u64 = 1;
    let mut len = size_of::<u64>();
    // SAFETY: "epoch" takes and returns a uint64_t; both pointers reference
    // a live u64 and `len` matches its size.
    let rc = unsafe {
        tikv_jemalloc_sys::mallctl(
            c"epoch".as_ptr().cast(),
            (&raw mut epoch).cast(),
            &mut len,
            (&raw mut epoch).cast(),
            size_of::<u64>(),
        )
    };
    if rc != 0 {
        debug!(rc, "jemalloc epoch refresh failed");
    }
}

fn read_size(name: &CStr) -> u64 {
    let mut value: usize = 0;
    let mut len = size_of::<usize>();
    // SAFETY: the control yields a size_t written into `value`, whose size is passed in `len`.
    let rc = unsafe {
        tikv_jemalloc_sys::mallctl(
            name.as_ptr().cast(),
            (&raw mut value).cast(),
            &mut len,
            ptr::null_mut(),
            0,
        )
    };
    if rc != 0 {
        debug!(control = ?name, rc, "jemalloc stat unavailable");
        return 0;
    }
    value as u64
}

fn read_u64(name: &CStr) -> u64 {
    let mut value: u64 = 0;
    let mut len = size_of::<u64>();
    // SAFETY: the control yields a uint64_t written into `value`, whose size is passed in `len`.
    let rc = unsafe {
        tikv_jemalloc_sys::mallctl(
            name.as_ptr().cast(),
            (&raw mut value).cast(),
            &mut len,
            ptr::null_mut(),
            0,
        )
    };
    if rc != 0 {
        debug!(control = ?name, rc, "jemalloc stat unavailable");
        return 0;
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_counters_to_gauges() {
        let stats = JemallocStats {
            allocated: 1000,
            active: 1200,
            mapped: 4000,
            retained: 300,
            resident: 5000,
            metadata: 200,
            small_nmalloc: 50,
            small_ndalloc: 20,
            small_nrequests: 70,
            large_nmalloc: 5,
            large_ndalloc: 1,
            large_nrequests: 6,
        };
        let sample = RuntimeSample::from(&stats);

        assert_eq!(sample.heap_alloc, 1000);
        assert_eq!(sample.heap_inuse, 1200);
        assert_eq!(sample.heap_idle, 2800);
        assert_eq!(sample.heap_released, 300);
        assert_eq!(sample.sys, 5000);
        assert_eq!(sample.mallocs, 55);
        assert_eq!(sample.frees, 21);
        assert_eq!(sample.heap_objects, 34);
        assert_eq!(sample.lookups, 76);
        assert_eq!(sample.num_gc, 0);
        assert_eq!(sample.stack_inuse, 0);
    }

    #[test]
    fn idle_never_underflows() {
        let stats = JemallocStats {
            active: 10,
            mapped: 5,
            small_nmalloc: 1,
            small_ndalloc: 3,
            ..Default::default()
        };
        let sample = RuntimeSample::from(&stats);
        assert_eq!(sample.heap_idle, 0);
        assert_eq!(sample.heap_objects, 0);
    }

    #[test]
    fn live_sample_sees_allocations() {
        let buf = vec![7u8; 1 << 20];
        let sample = sample();
        assert!(sample.heap_alloc >= buf.len() as u64);
        assert!(sample.heap_sys >= sample.heap_inuse);
        drop(buf);
    }
}
