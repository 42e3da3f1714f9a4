use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters shared by the pipeline stages.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub lines_read: AtomicU64,
    pub beacons: AtomicU64,
    pub pv_requests: AtomicU64,
    pub uv_requests: AtomicU64,
    pub uv_suppressed: AtomicU64,
    pub store_writes: AtomicU64,
    pub store_errors: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub lines_read: u64,
    pub beacons: u64,
    pub pv_requests: u64,
    pub uv_requests: u64,
    pub uv_suppressed: u64,
    pub store_writes: u64,
    pub store_errors: u64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            lines_read: load(&self.lines_read),
            beacons: load(&self.beacons),
            pv_requests: load(&self.pv_requests),
            uv_requests: load(&self.uv_requests),
            uv_suppressed: load(&self.uv_suppressed),
            store_writes: load(&self.store_writes),
            store_errors: load(&self.store_errors),
        }
    }
}
