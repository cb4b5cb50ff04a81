//! Tracer lifecycle: load, adapt, run, stop.
//!
//! One process-wide tracer object owns the eBPF handles, the worker
//! pool and the periodic maintenance tasks. Probe attach/detach is
//! serialized by a single mutex because lifecycle transitions and
//! background process snooping would otherwise race.

use crate::adapt;
use crate::boot_time::BootTimeSync;
use crate::btf_offsets;
use crate::config::TracerConfig;
use crate::dispatch::{self, Dispatcher, L7Handler};
use crate::error::TracerError;
use crate::events::ExtraEventRegistry;
use crate::reclaim;
use crate::stats::TracerStats;
use crate::MapValue;
use anyhow::{anyhow, Context, Result};
use aya::maps::perf::PerfEventArray;
use aya::maps::{PerCpuArray, PerCpuValues};
use aya::programs::{kprobe::KProbeLinkId, trace_point::TracePointLinkId, KProbe, TracePoint};
use aya::util::online_cpus;
use aya::{Ebpf, EbpfLoader};
use aya_log::EbpfLogger;
use log::{info, warn};
use once_cell::sync::OnceCell;
use serde::Serialize;
use sktrace_common::TraceUid;
use std::fs;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const SK_TRACER_NAME: &str = "socket-trace";

const MIN_KERNEL: (u32, u32) = (4, 14);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TracerState {
    Init = 0,
    Running = 1,
    Stop = 2,
}

impl TracerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TracerState::Running,
            2 => TracerState::Stop,
            _ => TracerState::Init,
        }
    }
}

enum ProbeKind {
    KProbe(&'static str),
    TracePoint(&'static str, &'static str),
}

/// Program name plus its attachment point. Program names match the
/// probe functions in the eBPF object.
const PROBES: &[(&str, ProbeKind)] = &[
    ("enter_sys_sendmsg", ProbeKind::KProbe("__sys_sendmsg")),
    ("enter_sys_sendmmsg", ProbeKind::KProbe("__sys_sendmmsg")),
    ("enter_sys_recvmsg", ProbeKind::KProbe("__sys_recvmsg")),
    ("enter_sys_recvmmsg", ProbeKind::KProbe("__sys_recvmmsg")),
    ("enter_do_writev", ProbeKind::KProbe("do_writev")),
    ("enter_do_readv", ProbeKind::KProbe("do_readv")),
    ("sys_enter_write", ProbeKind::TracePoint("syscalls", "sys_enter_write")),
    ("sys_enter_read", ProbeKind::TracePoint("syscalls", "sys_enter_read")),
    ("sys_enter_sendto", ProbeKind::TracePoint("syscalls", "sys_enter_sendto")),
    ("sys_enter_recvfrom", ProbeKind::TracePoint("syscalls", "sys_enter_recvfrom")),
    ("sys_exit_write", ProbeKind::TracePoint("syscalls", "sys_exit_write")),
    ("sys_exit_read", ProbeKind::TracePoint("syscalls", "sys_exit_read")),
    ("sys_exit_sendto", ProbeKind::TracePoint("syscalls", "sys_exit_sendto")),
    ("sys_exit_recvfrom", ProbeKind::TracePoint("syscalls", "sys_exit_recvfrom")),
    ("sys_exit_sendmsg", ProbeKind::TracePoint("syscalls", "sys_exit_sendmsg")),
    ("sys_exit_sendmmsg", ProbeKind::TracePoint("syscalls", "sys_exit_sendmmsg")),
    ("sys_exit_recvmsg", ProbeKind::TracePoint("syscalls", "sys_exit_recvmsg")),
    ("sys_exit_recvmmsg", ProbeKind::TracePoint("syscalls", "sys_exit_recvmmsg")),
    ("sys_exit_writev", ProbeKind::TracePoint("syscalls", "sys_exit_writev")),
    ("sys_exit_readv", ProbeKind::TracePoint("syscalls", "sys_exit_readv")),
    ("sys_exit_socket", ProbeKind::TracePoint("syscalls", "sys_exit_socket")),
    ("sys_enter_close", ProbeKind::TracePoint("syscalls", "sys_enter_close")),
    ("sys_enter_getppid", ProbeKind::TracePoint("syscalls", "sys_enter_getppid")),
    ("sched_process_exec", ProbeKind::TracePoint("sched", "sched_process_exec")),
    ("sched_process_exit", ProbeKind::TracePoint("sched", "sched_process_exit")),
];

enum ProbeLink {
    KProbe { program: &'static str, link: KProbeLinkId },
    TracePoint { program: &'static str, link: TracePointLinkId },
}

static TRACER: OnceCell<Arc<SocketTracer>> = OnceCell::new();

/// Look up the process-wide tracer by name.
pub fn find_tracer(name: &str) -> Option<Arc<SocketTracer>> {
    TRACER.get().filter(|t| t.name == name).cloned()
}

pub struct SocketTracer {
    name: &'static str,
    config: TracerConfig,
    stats: Arc<TracerStats>,
    boot: Arc<BootTimeSync>,
    dispatcher: Arc<Dispatcher>,
    ebpf: Mutex<Ebpf>,
    probes: Mutex<Vec<ProbeLink>>,
    state: AtomicU8,
    adapt_success: AtomicBool,
    online_cpus: Vec<u32>,
}

impl SocketTracer {
    /// Load, attach and start the socket tracer. Returns the running
    /// handle; on error the tracer never leaves INIT.
    pub fn run(
        config: TracerConfig,
        handler: L7Handler,
        registry: Arc<ExtraEventRegistry>,
    ) -> Result<Arc<Self>, TracerError> {
        check_kernel_version()?;
        bump_memlock_rlimit()?;

        let object = fs::read(&config.bpf_object)
            .map_err(|e| TracerError::LoadFailed(format!("{}: {e}", config.bpf_object)))?;

        let mut loader = EbpfLoader::new();
        loader.set_max_entries("SOCKET_INFO", config.max_socket_entries);
        loader.set_max_entries("TRACE_MAP", config.max_trace_entries);
        let mut ebpf = loader
            .load(&object)
            .map_err(|e| TracerError::LoadFailed(e.to_string()))?;

        if let Err(e) = EbpfLogger::init(&mut ebpf) {
            warn!("eBPF logger not initialized: {e}");
        }

        let online = online_cpus().map_err(|e| {
            TracerError::LoadFailed(format!("online cpu enumeration failed: {e:?}"))
        })?;

        load_programs(&mut ebpf)?;
        let links = attach_all(&mut ebpf)?;

        seed_trace_uids(&mut ebpf).map_err(|e| TracerError::MapConfig(e.to_string()))?;

        // Perf buffers are opened up front; the readers own them.
        let mut perf: PerfEventArray<_> = PerfEventArray::try_from(
            ebpf.take_map("SOCKET_DATA")
                .ok_or_else(|| TracerError::MapConfig("SOCKET_DATA map missing".into()))?,
        )
        .map_err(|e| TracerError::MapConfig(e.to_string()))?;
        let mut buffers = Vec::with_capacity(online.len());
        for &cpu in &online {
            let buffer = perf
                .open(cpu, Some(config.perf_pages))
                .map_err(|e| TracerError::MapConfig(format!("perf open cpu {cpu}: {e}")))?;
            buffers.push(buffer);
        }

        let stats = Arc::new(TracerStats::new(config.worker_threads));
        let boot = Arc::new(BootTimeSync::new());
        let dispatcher = Arc::new(Dispatcher::new(
            config.worker_threads,
            config.queue_size,
            handler,
            stats.clone(),
            registry,
            boot.clone(),
        ));

        let tracer = Arc::new(Self {
            name: SK_TRACER_NAME,
            config,
            stats,
            boot,
            dispatcher: dispatcher.clone(),
            ebpf: Mutex::new(ebpf),
            probes: Mutex::new(links),
            state: AtomicU8::new(TracerState::Init as u8),
            adapt_success: AtomicBool::new(false),
            online_cpus: online,
        });
        TRACER
            .set(tracer.clone())
            .map_err(|_| TracerError::LoadFailed("tracer is already running".into()))?;

        dispatch::start_perf_readers(buffers, dispatcher);
        begin_kernel_adaptation(&tracer);
        spawn_periodic_tasks(&tracer);

        Ok(tracer)
    }

    pub fn state(&self) -> TracerState {
        TracerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: TracerState) {
        self.state.store(state as u8, Ordering::SeqCst);
        info!("tracer state: {state:?}");
    }

    pub fn adapt_success(&self) -> bool {
        self.adapt_success.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &Arc<TracerStats> {
        &self.stats
    }

    pub fn boot(&self) -> &Arc<BootTimeSync> {
        &self.boot
    }

    pub fn config(&self) -> &TracerConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn online_cpus(&self) -> &[u32] {
        &self.online_cpus
    }

    pub fn with_ebpf<R>(&self, f: impl FnOnce(&mut Ebpf) -> R) -> R {
        let mut ebpf = self.ebpf.lock().unwrap();
        f(&mut ebpf)
    }

    /// Detach every probe and clear the socket table.
    pub fn stop(&self) -> Result<()> {
        match self.state() {
            TracerState::Init => {
                anyhow::bail!("tracer is still adapting; stop is not permitted in INIT")
            }
            TracerState::Stop => {
                warn!("tracer already stopped");
                return Ok(());
            }
            TracerState::Running => {}
        }

        let mut links = self.probes.lock().unwrap();
        let mut ebpf = self.ebpf.lock().unwrap();
        detach_all(&mut ebpf, links.drain(..).collect())?;
        self.set_state(TracerState::Stop);
        reclaim::reclaim_socket_map(&mut ebpf, 0, &self.stats)?;
        Ok(())
    }

    /// Re-attach after a stop.
    pub fn start(&self) -> Result<()> {
        match self.state() {
            TracerState::Init => {
                anyhow::bail!("tracer is still adapting; start is not permitted in INIT")
            }
            TracerState::Running => {
                warn!("tracer already running");
                return Ok(());
            }
            TracerState::Stop => {}
        }

        let mut links = self.probes.lock().unwrap();
        let mut ebpf = self.ebpf.lock().unwrap();
        *links = attach_all(&mut ebpf)?;
        self.set_state(TracerState::Running);
        Ok(())
    }
}

/// BTF first; kernels without it get the loopback inference driver
/// and the periodic readiness check.
fn begin_kernel_adaptation(tracer: &Arc<SocketTracer>) {
    match btf_offsets::derive_member_offsets() {
        Ok(offsets) => {
            let mut ebpf = tracer.ebpf.lock().unwrap();
            match adapt::broadcast_offsets(&mut ebpf, &offsets) {
                Ok(()) => {
                    info!(
                        "struct offsets resolved from BTF \
                         (task.files={:#x} sock.flags={:#x} copied_seq={:#x} write_seq={:#x})",
                        offsets.task_files,
                        offsets.sock_flags,
                        offsets.tcp_copied_seq,
                        offsets.tcp_write_seq
                    );
                    tracer.adapt_success.store(true, Ordering::SeqCst);
                    tracer.set_state(TracerState::Running);
                    return;
                }
                Err(e) => warn!("broadcasting BTF offsets failed: {e}"),
            }
        }
        Err(e) => info!("kernel BTF unavailable ({e}); falling back to runtime inference"),
    }

    let port = tracer.config.offset_infer_port;
    let cpus = tracer.online_cpus.clone();
    std::thread::Builder::new()
        .name("offset-infer".into())
        .spawn(move || {
            if let Err(e) = adapt::run_inference_driver(port, &cpus) {
                warn!("offset inference driver failed: {e}");
            }
        })
        .expect("spawn offset inference driver");

    let tracer = tracer.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            if tracer.adapt_success.load(Ordering::SeqCst) {
                break;
            }
            let checked = {
                let mut ebpf = tracer.ebpf.lock().unwrap();
                adapt::adapt_check(&mut ebpf, &tracer.online_cpus)
            };
            match checked {
                Ok(Some(offsets)) => {
                    info!(
                        "kernel adaptation succeeded on candidate offsets \
                         (task.files={:#x})",
                        offsets.task_files
                    );
                    tracer.adapt_success.store(true, Ordering::SeqCst);
                    tracer.set_state(TracerState::Running);
                    break;
                }
                Ok(None) => {}
                Err(e) => warn!("kern-adapt check failed: {e}"),
            }
        }
    });
}

fn spawn_periodic_tasks(tracer: &Arc<SocketTracer>) {
    let reclaimer = tracer.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            interval.tick().await;
            let mut ebpf = reclaimer.ebpf.lock().unwrap();
            if let Err(e) =
                reclaim::check_map_exceeded(&mut ebpf, &reclaimer.config, &reclaimer.stats)
            {
                warn!("map reclaim check failed: {e}");
            }
        }
    });

    let anchored = tracer.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let drift = anchored.boot.refresh();
            anchored
                .stats
                .boot_time_drift_ns
                .store(drift, Ordering::Relaxed);
        }
    });
}

fn load_programs(ebpf: &mut Ebpf) -> Result<(), TracerError> {
    for (program, kind) in PROBES {
        let result: Result<()> = (|| {
            match kind {
                ProbeKind::KProbe(_) => {
                    let p: &mut KProbe = ebpf
                        .program_mut(program)
                        .ok_or_else(|| anyhow!("program {program} not found"))?
                        .try_into()?;
                    p.load()?;
                }
                ProbeKind::TracePoint(_, _) => {
                    let p: &mut TracePoint = ebpf
                        .program_mut(program)
                        .ok_or_else(|| anyhow!("program {program} not found"))?
                        .try_into()?;
                    p.load()?;
                }
            }
            Ok(())
        })();
        result.map_err(|e| TracerError::LoadFailed(format!("{program}: {e}")))?;
    }
    Ok(())
}

fn attach_all(ebpf: &mut Ebpf) -> Result<Vec<ProbeLink>, TracerError> {
    let mut links = Vec::with_capacity(PROBES.len());
    for (program, kind) in PROBES {
        let program = *program;
        let attached: Result<ProbeLink> = (|| match kind {
            ProbeKind::KProbe(symbol) => {
                let p: &mut KProbe = ebpf
                    .program_mut(program)
                    .ok_or_else(|| anyhow!("program {program} not found"))?
                    .try_into()?;
                let link = p.attach(symbol, 0)?;
                Ok(ProbeLink::KProbe { program, link })
            }
            ProbeKind::TracePoint(category, name) => {
                let p: &mut TracePoint = ebpf
                    .program_mut(program)
                    .ok_or_else(|| anyhow!("program {program} not found"))?
                    .try_into()?;
                let link = p.attach(category, name)?;
                Ok(ProbeLink::TracePoint { program, link })
            }
        })();
        match attached {
            Ok(link) => links.push(link),
            Err(e) => {
                // Leave nothing half-attached behind.
                let _ = detach_all(ebpf, links);
                return Err(TracerError::AttachFailed {
                    symbol: program.to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }
    info!("attached {} probes", links.len());
    Ok(links)
}

fn detach_all(ebpf: &mut Ebpf, links: Vec<ProbeLink>) -> Result<()> {
    for link in links {
        match link {
            ProbeLink::KProbe { program, link } => {
                let p: &mut KProbe = ebpf
                    .program_mut(program)
                    .ok_or_else(|| anyhow!("program {program} not found"))?
                    .try_into()?;
                p.detach(link)?;
            }
            ProbeLink::TracePoint { program, link } => {
                let p: &mut TracePoint = ebpf
                    .program_mut(program)
                    .ok_or_else(|| anyhow!("program {program} not found"))?
                    .try_into()?;
                p.detach(link)?;
            }
        }
    }
    Ok(())
}

/// Seed each CPU's id allocator with `[cpu:8][realtime_ns/100:56]`.
fn seed_trace_uids(ebpf: &mut Ebpf) -> Result<()> {
    let realtime = crate::boot_time::realtime_ns();
    if realtime == 0 {
        anyhow::bail!("realtime clock read failed");
    }
    let ncpus = aya::util::nr_cpus().map_err(|e| anyhow!("nr_cpus: {e:?}"))?;
    let values: Vec<MapValue<TraceUid>> = (0..ncpus)
        .map(|cpu| MapValue(TraceUid::seeded(cpu as u8, realtime)))
        .collect();

    let map = ebpf.map_mut("TRACE_UID").context("TRACE_UID map missing")?;
    let mut array: PerCpuArray<_, MapValue<TraceUid>> =
        PerCpuArray::try_from(map).context("TRACE_UID is not a per-cpu array")?;
    array
        .set(0, PerCpuValues::try_from(values).map_err(|e| anyhow!("{e}"))?, 0)
        .context("seed TRACE_UID")?;
    Ok(())
}

fn check_kernel_version() -> Result<(), TracerError> {
    let release = fs::read_to_string("/proc/sys/kernel/osrelease").unwrap_or_default();
    let mut parts = release.trim().split(['.', '-']);
    let major: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let minor: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    if (major, minor) < MIN_KERNEL {
        return Err(TracerError::KernelTooOld { major, minor });
    }
    Ok(())
}

fn bump_memlock_rlimit() -> Result<(), TracerError> {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        return Err(TracerError::LoadFailed(
            "failed to raise RLIMIT_MEMLOCK".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trip() {
        assert_eq!(TracerState::from_u8(TracerState::Running as u8), TracerState::Running);
        assert_eq!(TracerState::from_u8(TracerState::Stop as u8), TracerState::Stop);
        assert_eq!(TracerState::from_u8(0xff), TracerState::Init);
    }

    #[test]
    fn probe_table_covers_every_exit_hook() {
        // Every stashing entry hook needs a consuming exit hook.
        let names: Vec<&str> = PROBES.iter().map(|(n, _)| *n).collect();
        for exit in [
            "sys_exit_write",
            "sys_exit_read",
            "sys_exit_sendto",
            "sys_exit_recvfrom",
            "sys_exit_sendmsg",
            "sys_exit_sendmmsg",
            "sys_exit_recvmsg",
            "sys_exit_recvmmsg",
            "sys_exit_writev",
            "sys_exit_readv",
        ] {
            assert!(names.contains(&exit), "missing {exit}");
        }
        assert!(names.contains(&"sys_enter_close"));
        assert!(names.contains(&"sys_enter_getppid"));
        assert!(names.contains(&"sys_exit_socket"));
    }
}
