//! Tracer-wide counters.
//!
//! Updated from the reader and worker hot paths, so everything is
//! atomic; snapshots aggregate per-queue counters into the shape the
//! control socket serves.

use serde::Serialize;
use sktrace_common::l7_proto;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct QueueCounters {
    pub enqueue_nr: AtomicU64,
    pub enqueue_lost: AtomicU64,
    pub dequeue_nr: AtomicU64,
    pub burst_count: AtomicU64,
    pub heap_get_failed: AtomicU64,
}

#[derive(Debug)]
pub struct TracerStats {
    /// Frames the kernel dropped because a perf ring was full.
    pub kern_lost: AtomicU64,
    pub perf_poll_errors: AtomicU64,
    pub socket_map_reclaims: AtomicU64,
    pub trace_map_reclaims: AtomicU64,
    pub boot_time_drift_ns: AtomicI64,
    proto_counts: [AtomicU64; l7_proto::NUM as usize],
    queues: Vec<QueueCounters>,
}

impl TracerStats {
    pub fn new(worker_queues: usize) -> Self {
        Self {
            kern_lost: AtomicU64::new(0),
            perf_poll_errors: AtomicU64::new(0),
            socket_map_reclaims: AtomicU64::new(0),
            trace_map_reclaims: AtomicU64::new(0),
            boot_time_drift_ns: AtomicI64::new(0),
            proto_counts: std::array::from_fn(|_| AtomicU64::new(0)),
            queues: (0..worker_queues).map(|_| QueueCounters::default()).collect(),
        }
    }

    pub fn count_protocol(&self, mut protocol: u8) {
        if protocol >= l7_proto::NUM {
            protocol = l7_proto::UNKNOWN;
        }
        self.proto_counts[protocol as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn queue(&self, index: usize) -> &QueueCounters {
        &self.queues[index]
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let mut user_enqueue_count = 0;
        let mut user_enqueue_lost = 0;
        let mut user_dequeue_count = 0;
        let mut queue_burst_count = 0;
        let mut mem_alloc_fail_count = 0;
        for q in &self.queues {
            user_enqueue_count += q.enqueue_nr.load(Ordering::Relaxed);
            user_enqueue_lost += q.enqueue_lost.load(Ordering::Relaxed);
            user_dequeue_count += q.dequeue_nr.load(Ordering::Relaxed);
            queue_burst_count += q.burst_count.load(Ordering::Relaxed);
            mem_alloc_fail_count += q.heap_get_failed.load(Ordering::Relaxed);
        }

        StatsSnapshot {
            kern_lost: self.kern_lost.load(Ordering::Relaxed),
            perf_poll_errors: self.perf_poll_errors.load(Ordering::Relaxed),
            socket_map_reclaims: self.socket_map_reclaims.load(Ordering::Relaxed),
            trace_map_reclaims: self.trace_map_reclaims.load(Ordering::Relaxed),
            boot_time_drift_ns: self.boot_time_drift_ns.load(Ordering::Relaxed),
            worker_num: self.queues.len(),
            user_enqueue_count,
            user_enqueue_lost,
            user_dequeue_count,
            queue_burst_count,
            mem_alloc_fail_count,
            proto_counts: self
                .proto_counts
                .iter()
                .enumerate()
                .map(|(i, c)| ProtoCount {
                    protocol: l7_proto::name(i as u8).to_string(),
                    count: c.load(Ordering::Relaxed),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProtoCount {
    pub protocol: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub kern_lost: u64,
    pub perf_poll_errors: u64,
    pub socket_map_reclaims: u64,
    pub trace_map_reclaims: u64,
    pub boot_time_drift_ns: i64,
    pub worker_num: usize,
    pub user_enqueue_count: u64,
    pub user_enqueue_lost: u64,
    pub user_dequeue_count: u64,
    pub queue_burst_count: u64,
    pub mem_alloc_fail_count: u64,
    pub proto_counts: Vec<ProtoCount>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_aggregates_queues() {
        let stats = TracerStats::new(3);
        stats.queue(0).enqueue_nr.fetch_add(5, Ordering::Relaxed);
        stats.queue(1).enqueue_nr.fetch_add(7, Ordering::Relaxed);
        stats.queue(2).enqueue_lost.fetch_add(2, Ordering::Relaxed);
        stats.count_protocol(l7_proto::HTTP1);
        stats.count_protocol(l7_proto::HTTP1);
        stats.count_protocol(0xee); // out of range folds into unknown

        let snap = stats.snapshot();
        assert_eq!(snap.user_enqueue_count, 12);
        assert_eq!(snap.user_enqueue_lost, 2);
        assert_eq!(snap.worker_num, 3);
        assert_eq!(snap.proto_counts[l7_proto::HTTP1 as usize].count, 2);
        assert_eq!(snap.proto_counts[l7_proto::UNKNOWN as usize].count, 1);
    }
}
