//! Idle-entry reclamation for the socket and trace tables.
//!
//! The close path keeps the socket table tidy in the common case, but
//! leaked fds, dead threads and dropped connections leave entries
//! behind. When a table grows past its high-water mark, every entry
//! idle longer than the timeout is evicted. Reclaim totals are
//! subtracted from the kernel-side live counters so the user-visible
//! numbers stay honest.

use crate::boot_time::uptime_secs;
use crate::config::TracerConfig;
use crate::stats::TracerStats;
use crate::MapValue;
use anyhow::{Context, Result};
use aya::maps::{HashMap as BpfHashMap, PerCpuArray};
use aya::Ebpf;
use log::info;
use sktrace_common::policy::is_stale;
use sktrace_common::{
    SocketInfo, TraceInfo, TraceStats as KernTraceStats, RECLAIM_TRACE_MAP_SCALE,
    SOCKET_RECLAIM_TIMEOUT_SECS, TRACE_RECLAIM_TIMEOUT_SECS,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;

const SOCKET_INFO_MAP: &str = "SOCKET_INFO";
const TRACE_MAP: &str = "TRACE_MAP";
const TRACE_STATS_MAP: &str = "TRACE_STATS";

/// Sum the per-CPU table statistics.
pub fn aggregate_kernel_stats(ebpf: &Ebpf) -> Result<KernTraceStats> {
    let map = ebpf.map(TRACE_STATS_MAP).context("TRACE_STATS map missing")?;
    let array: PerCpuArray<_, MapValue<KernTraceStats>> =
        PerCpuArray::try_from(map).context("TRACE_STATS is not a per-cpu array")?;
    let values = array.get(&0, 0).context("read TRACE_STATS")?;

    let mut total = KernTraceStats::zeroed();
    for value in values.iter() {
        total.socket_map_count = total.socket_map_count.wrapping_add(value.0.socket_map_count);
        total.trace_map_count = total.trace_map_count.wrapping_add(value.0.trace_map_count);
        total.probe_read_faults += value.0.probe_read_faults;
    }
    Ok(total)
}

/// Evict socket entries idle for more than `timeout_secs`. A timeout
/// of zero clears the table.
pub fn reclaim_socket_map(ebpf: &mut Ebpf, timeout_secs: u32, stats: &TracerStats) -> Result<u32> {
    let map = ebpf.map_mut(SOCKET_INFO_MAP).context("SOCKET_INFO map missing")?;
    let mut table: BpfHashMap<_, u64, MapValue<SocketInfo>> =
        BpfHashMap::try_from(map).context("SOCKET_INFO is not a hash map")?;

    let now = uptime_secs();
    let stale: Vec<u64> = table
        .iter()
        .filter_map(|entry| entry.ok())
        .filter(|(_, value)| is_stale(value.0.update_time, now, timeout_secs))
        .map(|(key, _)| key)
        .collect();

    let mut reclaimed = 0u32;
    for key in stale {
        if table.remove(&key).is_ok() {
            reclaimed += 1;
        }
    }

    stats
        .socket_map_reclaims
        .fetch_add(reclaimed as u64, Ordering::Relaxed);
    info!("socket map reclaimed {reclaimed} entries");
    Ok(reclaimed)
}

/// Evict trace entries idle for more than `timeout_secs`.
pub fn reclaim_trace_map(ebpf: &mut Ebpf, timeout_secs: u32, stats: &TracerStats) -> Result<u32> {
    let map = ebpf.map_mut(TRACE_MAP).context("TRACE_MAP map missing")?;
    let mut table: BpfHashMap<_, u64, MapValue<TraceInfo>> =
        BpfHashMap::try_from(map).context("TRACE_MAP is not a hash map")?;

    let now = uptime_secs();
    let stale: Vec<u64> = table
        .iter()
        .filter_map(|entry| entry.ok())
        .filter(|(_, value)| is_stale(value.0.update_time, now, timeout_secs))
        .map(|(key, _)| key)
        .collect();

    let mut reclaimed = 0u32;
    for key in stale {
        if table.remove(&key).is_ok() {
            reclaimed += 1;
        }
    }

    stats
        .trace_map_reclaims
        .fetch_add(reclaimed as u64, Ordering::Relaxed);
    info!("trace map reclaimed {reclaimed} entries");
    Ok(reclaimed)
}

/// Periodic high-water check. Live counts are corrected by the
/// reclaim totals before comparing against the thresholds.
pub fn check_map_exceeded(
    ebpf: &mut Ebpf,
    config: &TracerConfig,
    stats: &Arc<TracerStats>,
) -> Result<()> {
    let kern = aggregate_kernel_stats(ebpf)?;
    let socket_used = kern
        .socket_map_count
        .saturating_sub(stats.socket_map_reclaims.load(Ordering::Relaxed));
    let trace_used = kern
        .trace_map_count
        .saturating_sub(stats.trace_map_reclaims.load(Ordering::Relaxed));

    if socket_used >= config.socket_map_max_reclaim as u64 {
        info!(
            "socket map usage {socket_used} over threshold {}, reclaiming",
            config.socket_map_max_reclaim
        );
        reclaim_socket_map(ebpf, SOCKET_RECLAIM_TIMEOUT_SECS, stats)?;
    }

    let trace_threshold = (config.max_trace_entries as f64 * RECLAIM_TRACE_MAP_SCALE) as u64;
    if trace_used >= trace_threshold {
        info!("trace map usage {trace_used} over threshold {trace_threshold}, reclaiming");
        reclaim_trace_map(ebpf, TRACE_RECLAIM_TIMEOUT_SECS, stats)?;
    }

    Ok(())
}
