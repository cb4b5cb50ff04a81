//! Control socket.
//!
//! A tiny line-framed JSON get/set protocol over a Unix socket with
//! fixed command ids. `GET_SOCKTRACE_SHOW` returns the tracer state,
//! per-CPU offset tables, map usage and queue counters.

use crate::adapt;
use crate::reclaim;
use crate::stats::StatsSnapshot;
use crate::tracer::{SocketTracer, TracerState};
use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sktrace_common::MemberOffsets;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;

pub const GET_SOCKTRACE_SHOW: u32 = 512;
pub const SET_SOCKTRACE_ADD: u32 = 513;
pub const SET_SOCKTRACE_FLUSH: u32 = 514;

#[derive(Debug, Deserialize)]
struct ControlRequest {
    id: u32,
}

/// Payload of `GET_SOCKTRACE_SHOW`.
#[derive(Debug, Serialize)]
pub struct SocktraceShow {
    pub tracer_state: TracerState,
    pub is_adapt_success: bool,
    pub kern_socket_map_max: u32,
    pub kern_socket_map_used: u64,
    pub kern_trace_map_max: u32,
    pub kern_trace_map_used: u64,
    pub probe_read_faults: u64,
    pub boot_time_update_diff_ns: i64,
    /// One offset record per CPU.
    pub offsets: Vec<MemberOffsets>,
    pub stats: StatsSnapshot,
}

pub fn build_show(tracer: &Arc<SocketTracer>) -> Result<SocktraceShow> {
    type ShowInputs = (sktrace_common::TraceStats, Vec<MemberOffsets>);
    let (kern, offsets) = tracer.with_ebpf(|ebpf| -> Result<ShowInputs> {
        let kern = reclaim::aggregate_kernel_stats(ebpf)?;
        let offsets = adapt::collect_offsets(ebpf)?;
        Ok((kern, offsets))
    })?;

    let stats = tracer.stats();
    let socket_used = kern
        .socket_map_count
        .saturating_sub(stats.socket_map_reclaims.load(Ordering::Relaxed));
    let trace_used = kern
        .trace_map_count
        .saturating_sub(stats.trace_map_reclaims.load(Ordering::Relaxed));

    Ok(SocktraceShow {
        tracer_state: tracer.state(),
        is_adapt_success: tracer.adapt_success(),
        kern_socket_map_max: tracer.config().max_socket_entries,
        kern_socket_map_used: socket_used,
        kern_trace_map_max: tracer.config().max_trace_entries,
        kern_trace_map_used: trace_used,
        probe_read_faults: kern.probe_read_faults,
        boot_time_update_diff_ns: tracer.boot().drift_ns(),
        offsets,
        stats: stats.snapshot(),
    })
}

/// Per-command response provider, injectable so the framing can be
/// exercised without a live tracer.
pub type CommandProvider = Arc<dyn Fn(u32) -> serde_json::Value + Send + Sync>;

pub fn tracer_provider(tracer: Arc<SocketTracer>) -> CommandProvider {
    Arc::new(move |id| match id {
        GET_SOCKTRACE_SHOW => match build_show(&tracer) {
            Ok(show) => json!({ "ok": show }),
            Err(e) => json!({ "error": e.to_string() }),
        },
        // Set-side commands are accepted for protocol compatibility;
        // there is no upper-layer filter to add or flush yet.
        SET_SOCKTRACE_ADD | SET_SOCKTRACE_FLUSH => json!({ "ok": null }),
        other => json!({ "error": format!("unknown command id {other}") }),
    })
}

/// Serve the control protocol until the process exits.
pub async fn serve(socket_path: String, provider: CommandProvider) -> Result<()> {
    if Path::new(&socket_path).exists() {
        std::fs::remove_file(&socket_path)
            .with_context(|| format!("removing stale control socket {socket_path}"))?;
    }
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("binding control socket {socket_path}"))?;
    info!("control socket listening on {socket_path}");

    loop {
        let (stream, _) = listener.accept().await?;
        let provider = provider.clone();
        tokio::spawn(async move {
            let (reader, mut writer) = stream.into_split();
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let response = match serde_json::from_str::<ControlRequest>(&line) {
                    Ok(request) => provider(request.id),
                    Err(e) => json!({ "error": format!("bad request: {e}") }),
                };
                let mut payload = response.to_string();
                payload.push('\n');
                if let Err(e) = writer.write_all(payload.as_bytes()).await {
                    warn!("control socket write failed: {e}");
                    break;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixStream;

    #[tokio::test]
    async fn request_response_framing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock").to_str().unwrap().to_string();

        let provider: CommandProvider = Arc::new(|id| match id {
            GET_SOCKTRACE_SHOW => json!({ "ok": { "tracer_state": "RUNNING" } }),
            _ => json!({ "error": "unknown" }),
        });

        let server_path = path.clone();
        tokio::spawn(async move {
            let _ = serve(server_path, provider).await;
        });
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        let stream = UnixStream::connect(&path).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        writer
            .write_all(format!("{{\"id\":{GET_SOCKTRACE_SHOW}}}\n").as_bytes())
            .await
            .unwrap();

        let mut lines = BufReader::new(reader).lines();
        let reply = lines.next_line().await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(value["ok"]["tracer_state"], "RUNNING");

        writer.write_all(b"{\"id\":9999}\n").await.unwrap();
        let reply = lines.next_line().await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert!(value["error"].is_string());
    }

    #[tokio::test]
    async fn malformed_requests_get_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock").to_str().unwrap().to_string();
        let provider: CommandProvider = Arc::new(|_| json!({ "ok": null }));

        let server_path = path.clone();
        tokio::spawn(async move {
            let _ = serve(server_path, provider).await;
        });
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        let stream = UnixStream::connect(&path).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        writer.write_all(b"not json\n").await.unwrap();
        let mut lines = BufReader::new(reader).lines();
        let reply = lines.next_line().await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert!(value["error"].as_str().unwrap().starts_with("bad request"));
    }
}
