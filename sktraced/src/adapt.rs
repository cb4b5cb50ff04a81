//! Kernel adaptation: the runtime offset-inference driver and the
//! periodic readiness check.
//!
//! Without BTF the probes have to discover struct offsets themselves.
//! The driver fabricates a known syscall pattern for them: a loopback
//! TCP server and one client pinned to each online CPU perform a tiny
//! hello/OK exchange and close their sockets, which walks every
//! candidate offset through the close-path inference until one CPU's
//! record turns ready. The lifecycle then broadcasts that record to
//! all CPU slots and leaves INIT.

use crate::error::TracerError;
use crate::MapValue;
use anyhow::{anyhow, Context, Result};
use aya::maps::{PerCpuArray, PerCpuValues};
use aya::Ebpf;
use log::{debug, info, warn};
use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use sktrace_common::MemberOffsets;
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

const MEMBER_OFFSETS_MAP: &str = "MEMBER_OFFSETS";

/// Loopback exchange driven against every online CPU.
pub fn run_inference_driver(port: u16, online_cpus: &[u32]) -> Result<(), TracerError> {
    let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);
    let listener = TcpListener::bind(addr)
        .map_err(|e| TracerError::InferenceDriverFailed(format!("bind 127.0.0.1:{port}: {e}")))?;

    let expected = online_cpus.len();
    let server = thread::Builder::new()
        .name("offset-infer-server".into())
        .spawn(move || server_loop(listener, expected))
        .map_err(|e| TracerError::InferenceDriverFailed(e.to_string()))?;

    let cpus: Vec<u32> = online_cpus.to_vec();
    let client = thread::Builder::new()
        .name("offset-infer-client".into())
        .spawn(move || {
            for cpu in cpus {
                if let Err(e) = client_exchange(addr, cpu) {
                    warn!("offset inference client on cpu {cpu} failed: {e}");
                }
            }
        })
        .map_err(|e| TracerError::InferenceDriverFailed(e.to_string()))?;

    client
        .join()
        .map_err(|_| TracerError::InferenceDriverFailed("client thread panicked".into()))?;
    server
        .join()
        .map_err(|_| TracerError::InferenceDriverFailed("server thread panicked".into()))?
        .map_err(|e| TracerError::InferenceDriverFailed(e.to_string()))
}

fn server_loop(listener: TcpListener, expected: usize) -> std::io::Result<()> {
    let mut served = 0usize;
    while served < expected {
        let (mut stream, _) = listener.accept()?;
        let mut buffer = [0u8; 16];
        loop {
            let len = match stream.read(&mut buffer) {
                Ok(0) => {
                    served += 1;
                    break;
                }
                Ok(len) => len,
                Err(_) => continue,
            };
            if &buffer[..len] == b"hello" {
                stream.write_all(b"OK")?;
            }
        }
    }
    info!("offset inference server done after {served} clients");
    Ok(())
}

/// One hello/OK round trip pinned to a CPU so its per-CPU offset
/// record sees the traffic.
fn client_exchange(addr: SocketAddrV4, cpu: u32) -> Result<()> {
    let mut set = CpuSet::new();
    set.set(cpu as usize)
        .map_err(|e| anyhow!("cpu {cpu} out of CpuSet range: {e}"))?;
    if let Err(e) = sched_setaffinity(Pid::from_raw(0), &set) {
        warn!("pinning inference client to cpu {cpu} failed: {e}");
    }

    let mut stream =
        TcpStream::connect(addr).with_context(|| format!("connect to inference server {addr}"))?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.write_all(b"hello")?;
    let mut buf = [0u8; 16];
    let len = stream.read(&mut buf)?;
    debug!("inference client on cpu {cpu} got {} bytes", len);
    Ok(())
}

/// Read every CPU's offset record.
pub fn collect_offsets(ebpf: &Ebpf) -> Result<Vec<MemberOffsets>> {
    let map = ebpf
        .map(MEMBER_OFFSETS_MAP)
        .context("MEMBER_OFFSETS map missing")?;
    let array: PerCpuArray<_, MapValue<MemberOffsets>> =
        PerCpuArray::try_from(map).context("MEMBER_OFFSETS is not a per-cpu array")?;
    let values = array.get(&0, 0).context("read MEMBER_OFFSETS")?;
    Ok(values.iter().map(|v| v.0).collect())
}

/// Overwrite every CPU slot with one winning record.
pub fn broadcast_offsets(ebpf: &mut Ebpf, offsets: &MemberOffsets) -> Result<()> {
    let ncpus = aya::util::nr_cpus().map_err(|e| anyhow!("nr_cpus: {e:?}"))?;
    let map = ebpf
        .map_mut(MEMBER_OFFSETS_MAP)
        .context("MEMBER_OFFSETS map missing")?;
    let mut array: PerCpuArray<_, MapValue<MemberOffsets>> =
        PerCpuArray::try_from(map).context("MEMBER_OFFSETS is not a per-cpu array")?;
    let values = PerCpuValues::try_from(vec![MapValue(*offsets); ncpus])
        .map_err(|e| anyhow!("building per-cpu offset values: {e}"))?;
    array.set(0, values, 0).context("write MEMBER_OFFSETS")?;
    Ok(())
}

/// Kern-adapt check: the first ready record among online CPUs wins and
/// is broadcast everywhere.
pub fn adapt_check(ebpf: &mut Ebpf, online_cpus: &[u32]) -> Result<Option<MemberOffsets>> {
    let records = collect_offsets(ebpf)?;
    let winner = online_cpus
        .iter()
        .filter_map(|&cpu| records.get(cpu as usize))
        .find(|record| record.ready == 1)
        .copied();

    if let Some(record) = winner {
        broadcast_offsets(ebpf, &record)?;
        return Ok(Some(record));
    }
    Ok(None)
}
