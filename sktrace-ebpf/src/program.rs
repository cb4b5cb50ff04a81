use core::mem::size_of;
use core::ptr::addr_of_mut;

use aya_ebpf::{
    bindings::BPF_F_CURRENT_CPU,
    helpers::{
        bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_ktime_get_ns, bpf_probe_read,
        bpf_probe_read_user, bpf_probe_read_user_buf,
    },
    macros::{kprobe, map, tracepoint},
    maps::{HashMap, PerCpuArray, PerfEventArray},
    programs::{ProbeContext, TracePointContext},
    EbpfContext,
};
use aya_log_ebpf::debug;
use sktrace_common::{
    conn_key, direction, inference::infer_protocol, l7_proto, msg_type,
    policy::{track_event, TraceAction},
    CaptureRecord, ConnInfo, DataArgs, MemberOffsets, ProcessDataExtra, ProcessEvent,
    SocketDataBuffer, SocketInfo, TraceInfo, TraceStats, TraceUid, BATCH_FLUSH_AGE_NS,
    CAP_DATA_SIZE, EVENT_BURST_NUM, EVENT_TYPE_PROC_EXEC, EVENT_TYPE_PROC_EXIT, INFER_BUF_SIZE,
    IOV_COPY_LIMIT, RECORD_HEADER_SIZE, RECORD_TIMESTAMP_OFFSET, SOCKET_DATA_BUFFER_SIZE,
    source_fn, DATA_BUF_CAPACITY,
};

use crate::sock::{
    check_sock_kind, get_socket_from_fd, infer_sock_flags, infer_socket_from_fd,
    infer_tcp_seq_offsets, init_conn_ports, read_sock_addrs, tcp_seq_for, SockCheck,
};

/// Perf ring shared with user space: socket-data batches and extra
/// events travel on the same ring, distinguished by the leading u32.
#[map(name = "SOCKET_DATA")]
static mut SOCKET_DATA: PerfEventArray<SocketDataBuffer> = PerfEventArray::new(0);

/// The eBPF stack cannot hold a capture record, so batches accumulate
/// in this per-CPU buffer.
#[map(name = "DATA_BUF")]
static mut DATA_BUF: PerCpuArray<SocketDataBuffer> = PerCpuArray::with_max_entries(1, 0);

#[map(name = "MEMBER_OFFSETS")]
static mut MEMBER_OFFSETS: PerCpuArray<MemberOffsets> = PerCpuArray::with_max_entries(1, 0);

/// Per-CPU id allocator; lock-free because each CPU owns its slot.
#[map(name = "TRACE_UID")]
static mut TRACE_UID: PerCpuArray<TraceUid> = PerCpuArray::with_max_entries(1, 0);

#[map(name = "TRACE_STATS")]
static mut TRACE_STATS: PerCpuArray<TraceStats> = PerCpuArray::with_max_entries(1, 0);

#[map(name = "SOCKET_INFO")]
static mut SOCKET_INFO: HashMap<u64, SocketInfo> = HashMap::with_max_entries(524_288, 0);

#[map(name = "TRACE_MAP")]
static mut TRACE_MAP: HashMap<u64, TraceInfo> = HashMap::with_max_entries(65_536, 0);

#[map(name = "ACTIVE_WRITE_ARGS")]
static mut ACTIVE_WRITE_ARGS: HashMap<u64, DataArgs> = HashMap::with_max_entries(65_536, 0);

#[map(name = "ACTIVE_READ_ARGS")]
static mut ACTIVE_READ_ARGS: HashMap<u64, DataArgs> = HashMap::with_max_entries(65_536, 0);

// Tracepoint format offsets for syscalls:sys_enter_*/sys_exit_*.
const TP_FD_OFFSET: usize = 16;
const TP_BUF_OFFSET: usize = 24;
const TP_RET_OFFSET: usize = 16;

// struct user_msghdr / struct mmsghdr member offsets.
const USER_MSGHDR_IOV_OFFSET: u64 = 16;
const USER_MSGHDR_IOVLEN_OFFSET: u64 = 24;
const MMSGHDR_MSG_LEN_OFFSET: u64 = 56;

#[repr(C)]
#[derive(Copy, Clone)]
struct KIovec {
    base: u64,
    len: u64,
}

#[inline(always)]
fn count_probe_fault() {
    unsafe {
        if let Some(stats) = TRACE_STATS.get_ptr_mut(0) {
            (*stats).probe_read_faults += 1;
        }
    }
}

/// Single typed kernel read; every struct-field access funnels through
/// here so faults are bounded and counted.
#[inline(always)]
pub fn read_kernel<T>(src: *const T) -> Option<T> {
    match unsafe { bpf_probe_read(src) } {
        Ok(v) => Some(v),
        Err(_) => {
            count_probe_fault();
            None
        }
    }
}

/// Kernel pointer read; faults and null both resolve to `None`.
#[inline(always)]
pub fn read_kernel_ptr(addr: usize) -> Option<usize> {
    let value = read_kernel::<usize>(addr as *const usize)?;
    if value == 0 {
        None
    } else {
        Some(value)
    }
}

#[inline(always)]
fn read_user<T>(src: *const T) -> Option<T> {
    match unsafe { bpf_probe_read_user(src) } {
        Ok(v) => Some(v),
        Err(_) => {
            count_probe_fault();
            None
        }
    }
}

/// Variable-length emit into the shared ring. The raw helper is used
/// because batches go out with their masked length while process
/// events are 24 bytes.
#[inline(always)]
fn perf_output<C: EbpfContext>(ctx: &C, data: *const u8, len: u32) {
    unsafe {
        aya_ebpf::helpers::gen::bpf_perf_event_output(
            ctx.as_ptr(),
            &raw mut SOCKET_DATA as *mut _,
            BPF_F_CURRENT_CPU as u64,
            data as *mut _,
            len as u64,
        );
    }
}

/// Push the pending batch to the ring and reset it. The envelope size
/// is masked by the power-of-two buffer size so the verifier accepts
/// it; a completely full buffer masks to zero and goes out whole.
#[inline(always)]
unsafe fn flush_batch<C: EbpfContext>(ctx: &C, buf: *mut SocketDataBuffer) {
    let size = ((*buf).len as usize + 8) & (SOCKET_DATA_BUFFER_SIZE - 1);
    if size == 0 {
        perf_output(ctx, buf as *const u8, SOCKET_DATA_BUFFER_SIZE as u32);
    } else {
        perf_output(ctx, buf as *const u8, size as u32);
    }
    (*buf).events_num = 0;
    (*buf).len = 0;
}

#[inline(always)]
fn stats_apply(socket_delta: i64, trace_delta: i64) {
    unsafe {
        if let Some(stats) = TRACE_STATS.get_ptr_mut(0) {
            (*stats).socket_map_count = (*stats).socket_map_count.wrapping_add(socket_delta as u64);
            (*stats).trace_map_count = (*stats).trace_map_count.wrapping_add(trace_delta as u64);
        }
    }
}

#[inline(always)]
fn delete_socket_info(key: u64) {
    unsafe {
        if SOCKET_INFO.remove(&key).is_ok() {
            stats_apply(-1, 0);
        }
    }
}

/// Drive the structure-offset discovery from a live socket fd. Runs
/// until every field is fixed, then latches `ready`.
fn infer_offset_retry(fd: i32) -> bool {
    let Some(offsets) = (unsafe { MEMBER_OFFSETS.get_ptr_mut(0) }) else {
        return false;
    };
    let offsets = unsafe { &mut *offsets };

    if offsets.ready == 0 {
        if let Some(sk) = infer_socket_from_fd(fd, offsets) {
            if offsets.sock_flags == 0 {
                infer_sock_flags(sk, offsets);
            }
            if offsets.tcp_copied_seq == 0 || offsets.tcp_write_seq == 0 {
                infer_tcp_seq_offsets(sk, offsets);
            }
            if offsets.task_files != 0
                && offsets.sock_flags != 0
                && offsets.tcp_copied_seq != 0
                && offsets.tcp_write_seq != 0
            {
                offsets.ready = 1;
            }
        }
    }

    offsets.ready == 1
}

/// Concatenate up to [`IOV_COPY_LIMIT`] iovecs into the record's data
/// window. Every copy length is clamped and masked so the verifier
/// can bound it.
#[inline(always)]
unsafe fn iovecs_copy(rec: *mut CaptureRecord, args: &DataArgs, total: usize) -> usize {
    let dst_base = addr_of_mut!((*rec).data) as *mut u8;
    let mut bytes_sent = 0usize;

    for i in 0..IOV_COPY_LIMIT {
        if i >= args.iovlen as usize || bytes_sent >= total {
            break;
        }
        let Some(iov) = read_user::<KIovec>(
            (args.iov + (i as u64) * size_of::<KIovec>() as u64) as *const KIovec,
        ) else {
            break;
        };

        let remaining = total - bytes_sent;
        let mut iov_size = if (iov.len as usize) < remaining {
            iov.len as usize
        } else {
            remaining
        };
        iov_size &= CAP_DATA_SIZE - 1;
        if iov_size == 0 {
            continue;
        }

        let dst = core::slice::from_raw_parts_mut(dst_base.add(bytes_sent & (CAP_DATA_SIZE - 1)), iov_size);
        if bpf_probe_read_user_buf(iov.base as *const u8, dst).is_err() {
            count_probe_fault();
            break;
        }
        bytes_sent += iov_size;
    }

    bytes_sent
}

/// Record one classified event: update the state tables through the
/// shared tracking policy, then append a capture record to the per-CPU
/// batch and flush on a full burst.
#[allow(clippy::too_many_arguments)]
fn data_submit<C: EbpfContext>(
    ctx: &C,
    conn: &mut ConnInfo,
    args: &DataArgs,
    vecs: bool,
    syscall_len: u32,
    offsets: &MemberOffsets,
    sk: usize,
    extra: &ProcessDataExtra,
) {
    // Go TLS uprobes only ever report HTTP/1 payloads.
    if extra.is_go && extra.tls && conn.protocol != l7_proto::HTTP1 {
        return;
    }
    if conn.message_type == msg_type::UNKNOWN {
        return;
    }

    let id = bpf_get_current_pid_tgid();
    let tgid = (id >> 32) as u32;
    let time_stamp = if args.enter_ts != 0 {
        args.enter_ts
    } else {
        unsafe { bpf_ktime_get_ns() }
    };
    let key = conn_key(tgid, conn.fd);

    let mut tcp_seq = 0u32;
    if conn.tuple.l4_protocol == sktrace_common::IPPROTO_TCP {
        tcp_seq = tcp_seq_for(sk, offsets, conn.direction);
    }

    let entry = unsafe { SOCKET_INFO.get_ptr_mut(&key) }.map(|p| unsafe { *p });
    let trace = unsafe { TRACE_MAP.get_ptr_mut(&id) }.map(|p| unsafe { *p });
    let Some(uid) = (unsafe { TRACE_UID.get_ptr_mut(0) }) else {
        return;
    };

    let out = track_event(
        conn,
        entry,
        trace,
        unsafe { &mut *uid },
        time_stamp,
        extra.is_go,
    );

    unsafe {
        if out.socket_delete {
            let _ = SOCKET_INFO.remove(&key);
        }
        if let Some(sk_info) = out.socket_write {
            let _ = SOCKET_INFO.insert(&key, &sk_info, 0);
        }
        match out.trace {
            TraceAction::Upsert(t) => {
                let _ = TRACE_MAP.insert(&id, &t, 0);
            }
            TraceAction::Delete => {
                let _ = TRACE_MAP.remove(&id);
            }
            TraceAction::None => {}
        }
        if let Some((peer_fd, trace_id)) = out.peer_trace_write {
            let peer_key = conn_key(tgid, peer_fd);
            if let Some(peer) = SOCKET_INFO.get_ptr_mut(&peer_key) {
                if (*peer).is_valid() {
                    (*peer).trace_id = trace_id;
                }
            }
        }
    }
    stats_apply(out.socket_count_delta, out.trace_count_delta);

    if !out.emit {
        return;
    }

    let Some(buf) = (unsafe { DATA_BUF.get_ptr_mut(0) }) else {
        return;
    };

    unsafe {
        let used = (*buf).len as usize;
        if used > DATA_BUF_CAPACITY - size_of::<CaptureRecord>() {
            return;
        }
        let rec = (*buf).data.as_mut_ptr().add(used & (DATA_BUF_CAPACITY - 1)) as *mut CaptureRecord;

        let Some((daddr, saddr, addr_len)) = read_sock_addrs(sk, conn.skc_family) else {
            return;
        };

        addr_of_mut!((*rec).pid).write_unaligned(id as u32);
        addr_of_mut!((*rec).tgid).write_unaligned(tgid);
        addr_of_mut!((*rec).coroutine_id).write_unaligned(extra.coroutine_id);
        addr_of_mut!((*rec).comm).write_unaligned(bpf_get_current_comm().unwrap_or([0u8; 16]));
        addr_of_mut!((*rec).socket_id).write_unaligned(out.socket_uid);
        addr_of_mut!((*rec).tuple.daddr).write_unaligned(daddr);
        addr_of_mut!((*rec).tuple.saddr).write_unaligned(saddr);
        addr_of_mut!((*rec).tuple.addr_len).write_unaligned(addr_len);
        addr_of_mut!((*rec).tuple.l4_protocol).write_unaligned(conn.tuple.l4_protocol);
        addr_of_mut!((*rec).tuple.dport).write_unaligned(conn.tuple.dport);
        addr_of_mut!((*rec).tuple.num).write_unaligned(conn.tuple.num);

        let mut seq = tcp_seq.wrapping_sub(syscall_len);
        if conn.prev_count > 0 {
            addr_of_mut!((*rec).extra_data).write_unaligned(u32::from_ne_bytes(conn.prev_buf));
            addr_of_mut!((*rec).extra_data_count).write_unaligned(conn.prev_count);
            // Keep client and server sequences aligned across the
            // stashed prefix.
            seq = seq.wrapping_sub(conn.prev_count);
        } else {
            addr_of_mut!((*rec).extra_data).write_unaligned(0);
            addr_of_mut!((*rec).extra_data_count).write_unaligned(0);
        }
        if conn.tuple.l4_protocol != sktrace_common::IPPROTO_TCP {
            seq = 0;
        }
        if extra.use_tcp_seq {
            seq = extra.tcp_seq;
        }
        addr_of_mut!((*rec).tcp_seq).write_unaligned(seq);
        addr_of_mut!((*rec).thread_trace_id).write_unaligned(out.thread_trace_id);
        addr_of_mut!((*rec).timestamp).write_unaligned(time_stamp);
        addr_of_mut!((*rec).flags)
            .write_unaligned(CaptureRecord::pack_flags(conn.direction, conn.message_type));
        addr_of_mut!((*rec).syscall_len).write_unaligned(syscall_len as u64);
        addr_of_mut!((*rec).data_seq).write_unaligned(out.capture_seq);
        addr_of_mut!((*rec).data_type).write_unaligned(conn.protocol as u16);

        let total = if syscall_len as usize >= CAP_DATA_SIZE {
            CAP_DATA_SIZE
        } else {
            syscall_len as usize & (CAP_DATA_SIZE - 1)
        };

        let data_len = if vecs {
            iovecs_copy(rec, args, total)
        } else {
            let dst =
                core::slice::from_raw_parts_mut(addr_of_mut!((*rec).data) as *mut u8, total);
            if bpf_probe_read_user_buf(args.buf as *const u8, dst).is_err() {
                count_probe_fault();
                return;
            }
            total
        };

        addr_of_mut!((*rec).data_len).write_unaligned(data_len as u16);

        (*buf).len += (RECORD_HEADER_SIZE + data_len) as u32;
        (*buf).events_num += 1;
        if (*buf).events_num >= EVENT_BURST_NUM {
            flush_batch(ctx, buf);
        }
    }
}

/// Common path for every syscall exit carrying socket payload.
fn process_data<C: EbpfContext>(
    ctx: &C,
    id: u64,
    dir: u8,
    args: &DataArgs,
    bytes_count: i64,
    extra: &ProcessDataExtra,
) {
    if !extra.vecs && args.buf == 0 {
        return;
    }
    if extra.vecs && (args.iov == 0 || args.iovlen == 0) {
        return;
    }
    if args.fd < 0 || bytes_count <= 0 {
        return;
    }

    let Some(offsets) = (unsafe { MEMBER_OFFSETS.get_ptr_mut(0) }) else {
        return;
    };
    let offsets = unsafe { &*offsets };
    if offsets.ready == 0 {
        return;
    }

    let Some(sk) = get_socket_from_fd(args.fd, offsets) else {
        return;
    };

    let mut conn = ConnInfo::new(args.fd as u32);
    if check_sock_kind(sk, offsets, &mut conn) == SockCheck::Drop {
        return;
    }
    conn.direction = dir;
    init_conn_ports(sk, &mut conn);

    let tgid = (id >> 32) as u32;
    let key = conn_key(tgid, conn.fd);
    if let Some(entry) = (unsafe { SOCKET_INFO.get_ptr_mut(&key) }.map(|p| unsafe { *p })) {
        conn.pinned_proto = entry.l7_proto;
        conn.need_reconfirm = entry.need_reconfirm != 0;
        conn.correlation_id = entry.correlation_id;
        if entry.prev_data_len != 0 {
            conn.prev_buf = entry.prev_data;
            conn.prev_count = entry.prev_data_len;
        }
    }

    // Size the inference window. For iovec syscalls only the first
    // non-empty of the leading three iovecs is examined; later iovecs
    // are concatenated into the capture window without another look.
    let (src, avail) = if !extra.vecs {
        (args.buf, bytes_count as usize)
    } else {
        let mut base = 0u64;
        let mut len = 0usize;
        for i in 0..3usize {
            if i >= args.iovlen as usize {
                break;
            }
            let Some(iov) = read_user::<KIovec>(
                (args.iov + (i as u64) * size_of::<KIovec>() as u64) as *const KIovec,
            ) else {
                break;
            };
            if iov.len != 0 {
                base = iov.base;
                len = iov.len as usize;
                break;
            }
        }
        if base == 0 {
            return;
        }
        (base, core::cmp::min(len, bytes_count as usize))
    };

    let mut infer_buf = [0u8; INFER_BUF_SIZE];
    let window = core::cmp::min(avail, INFER_BUF_SIZE);
    if unsafe { bpf_probe_read_user_buf(src as *const u8, &mut infer_buf[..window]) }.is_err() {
        count_probe_fault();
        return;
    }

    let sk_type = conn.sk_type;
    let inferred = infer_protocol(&infer_buf[..window], avail, &mut conn, sk_type, extra);
    conn.protocol = inferred.protocol;
    conn.message_type = inferred.msg_type;

    // MySQL loses packets unless prestores with an unknown protocol
    // still reach the submit path.
    if conn.protocol != l7_proto::UNKNOWN || conn.message_type != msg_type::UNKNOWN {
        data_submit(ctx, &mut conn, args, extra.vecs, bytes_count as u32, offsets, sk, extra);
    }
}

fn process_syscall_data<C: EbpfContext>(ctx: &C, id: u64, dir: u8, args: &DataArgs, bytes: i64) {
    let extra = ProcessDataExtra::default();
    process_data(ctx, id, dir, args, bytes, &extra);
}

fn process_syscall_data_vecs<C: EbpfContext>(ctx: &C, id: u64, dir: u8, args: &DataArgs, bytes: i64) {
    let extra = ProcessDataExtra {
        vecs: true,
        ..ProcessDataExtra::default()
    };
    process_data(ctx, id, dir, args, bytes, &extra);
}

#[inline(always)]
fn stash_args(map: &HashMap<u64, DataArgs>, id: u64, args: &DataArgs) {
    let _ = map.insert(&id, args, 0);
}

#[inline(always)]
fn tp_read<T>(ctx: &TracePointContext, offset: usize) -> Option<T> {
    unsafe { ctx.read_at::<T>(offset).ok() }
}

// ---------------------------------------------------------------------------
// write / read
// ---------------------------------------------------------------------------

#[tracepoint(category = "syscalls", name = "sys_enter_write")]
pub fn sys_enter_write(ctx: TracePointContext) -> u32 {
    let id = bpf_get_current_pid_tgid();
    let Some(fd) = tp_read::<u64>(&ctx, TP_FD_OFFSET) else {
        return 0;
    };
    let Some(buf) = tp_read::<u64>(&ctx, TP_BUF_OFFSET) else {
        return 0;
    };
    let mut args = DataArgs::zeroed();
    args.source_fn = source_fn::WRITE;
    args.fd = fd as i32;
    args.buf = buf;
    args.enter_ts = unsafe { bpf_ktime_get_ns() };
    stash_args(unsafe { &ACTIVE_WRITE_ARGS }, id, &args);
    0
}

#[tracepoint(category = "syscalls", name = "sys_exit_write")]
pub fn sys_exit_write(ctx: TracePointContext) -> u32 {
    let id = bpf_get_current_pid_tgid();
    let bytes = tp_read::<i64>(&ctx, TP_RET_OFFSET).unwrap_or(0);
    if let Some(args) = (unsafe { ACTIVE_WRITE_ARGS.get_ptr_mut(&id) }).map(|p| unsafe { *p }) {
        // stdin/stdout/stderr never carry socket traffic.
        if args.fd > 2 {
            process_syscall_data(&ctx, id, direction::EGRESS, &args, bytes);
        }
    }
    unsafe {
        let _ = ACTIVE_WRITE_ARGS.remove(&id);
    }
    0
}

#[tracepoint(category = "syscalls", name = "sys_enter_read")]
pub fn sys_enter_read(ctx: TracePointContext) -> u32 {
    let id = bpf_get_current_pid_tgid();
    let Some(fd) = tp_read::<u64>(&ctx, TP_FD_OFFSET) else {
        return 0;
    };
    let Some(buf) = tp_read::<u64>(&ctx, TP_BUF_OFFSET) else {
        return 0;
    };
    let mut args = DataArgs::zeroed();
    args.source_fn = source_fn::READ;
    args.fd = fd as i32;
    args.buf = buf;
    stash_args(unsafe { &ACTIVE_READ_ARGS }, id, &args);
    0
}

#[tracepoint(category = "syscalls", name = "sys_exit_read")]
pub fn sys_exit_read(ctx: TracePointContext) -> u32 {
    let id = bpf_get_current_pid_tgid();
    let bytes = tp_read::<i64>(&ctx, TP_RET_OFFSET).unwrap_or(0);
    if let Some(args) = (unsafe { ACTIVE_READ_ARGS.get_ptr_mut(&id) }).map(|p| unsafe { *p }) {
        if args.fd > 2 {
            process_syscall_data(&ctx, id, direction::INGRESS, &args, bytes);
        }
    }
    unsafe {
        let _ = ACTIVE_READ_ARGS.remove(&id);
    }
    0
}

// ---------------------------------------------------------------------------
// sendto / recvfrom
// ---------------------------------------------------------------------------

#[tracepoint(category = "syscalls", name = "sys_enter_sendto")]
pub fn sys_enter_sendto(ctx: TracePointContext) -> u32 {
    let id = bpf_get_current_pid_tgid();
    let Some(fd) = tp_read::<u64>(&ctx, TP_FD_OFFSET) else {
        return 0;
    };
    let Some(buf) = tp_read::<u64>(&ctx, TP_BUF_OFFSET) else {
        return 0;
    };
    let mut args = DataArgs::zeroed();
    args.source_fn = source_fn::SENDTO;
    args.fd = fd as i32;
    args.buf = buf;
    args.enter_ts = unsafe { bpf_ktime_get_ns() };
    stash_args(unsafe { &ACTIVE_WRITE_ARGS }, id, &args);
    0
}

#[tracepoint(category = "syscalls", name = "sys_exit_sendto")]
pub fn sys_exit_sendto(ctx: TracePointContext) -> u32 {
    let id = bpf_get_current_pid_tgid();
    let bytes = tp_read::<i64>(&ctx, TP_RET_OFFSET).unwrap_or(0);
    if let Some(args) = (unsafe { ACTIVE_WRITE_ARGS.get_ptr_mut(&id) }).map(|p| unsafe { *p }) {
        process_syscall_data(&ctx, id, direction::EGRESS, &args, bytes);
    }
    unsafe {
        let _ = ACTIVE_WRITE_ARGS.remove(&id);
    }
    0
}

#[tracepoint(category = "syscalls", name = "sys_enter_recvfrom")]
pub fn sys_enter_recvfrom(ctx: TracePointContext) -> u32 {
    let id = bpf_get_current_pid_tgid();
    let Some(fd) = tp_read::<u64>(&ctx, TP_FD_OFFSET) else {
        return 0;
    };
    let Some(buf) = tp_read::<u64>(&ctx, TP_BUF_OFFSET) else {
        return 0;
    };
    let mut args = DataArgs::zeroed();
    args.source_fn = source_fn::RECVFROM;
    args.fd = fd as i32;
    args.buf = buf;
    stash_args(unsafe { &ACTIVE_READ_ARGS }, id, &args);
    0
}

#[tracepoint(category = "syscalls", name = "sys_exit_recvfrom")]
pub fn sys_exit_recvfrom(ctx: TracePointContext) -> u32 {
    let id = bpf_get_current_pid_tgid();
    let bytes = tp_read::<i64>(&ctx, TP_RET_OFFSET).unwrap_or(0);
    if let Some(args) = (unsafe { ACTIVE_READ_ARGS.get_ptr_mut(&id) }).map(|p| unsafe { *p }) {
        process_syscall_data(&ctx, id, direction::INGRESS, &args, bytes);
    }
    unsafe {
        let _ = ACTIVE_READ_ARGS.remove(&id);
    }
    0
}

// ---------------------------------------------------------------------------
// sendmsg / sendmmsg / recvmsg / recvmmsg (kprobe entries, tracepoint exits)
// ---------------------------------------------------------------------------

#[kprobe]
pub fn enter_sys_sendmsg(ctx: ProbeContext) -> u32 {
    let id = bpf_get_current_pid_tgid();
    let Some(fd) = ctx.arg::<u64>(0) else { return 0 };
    let Some(msghdr) = ctx.arg::<u64>(1) else { return 0 };
    if msghdr == 0 {
        return 0;
    }
    let Some(iov) = read_user::<u64>((msghdr + USER_MSGHDR_IOV_OFFSET) as *const u64) else {
        return 0;
    };
    let Some(iovlen) = read_user::<u64>((msghdr + USER_MSGHDR_IOVLEN_OFFSET) as *const u64) else {
        return 0;
    };
    let mut args = DataArgs::zeroed();
    args.source_fn = source_fn::SENDMSG;
    args.fd = fd as i32;
    args.iov = iov;
    args.iovlen = iovlen as u32;
    args.enter_ts = unsafe { bpf_ktime_get_ns() };
    stash_args(unsafe { &ACTIVE_WRITE_ARGS }, id, &args);
    0
}

#[tracepoint(category = "syscalls", name = "sys_exit_sendmsg")]
pub fn sys_exit_sendmsg(ctx: TracePointContext) -> u32 {
    let id = bpf_get_current_pid_tgid();
    let bytes = tp_read::<i64>(&ctx, TP_RET_OFFSET).unwrap_or(0);
    if let Some(args) = (unsafe { ACTIVE_WRITE_ARGS.get_ptr_mut(&id) }).map(|p| unsafe { *p }) {
        process_syscall_data_vecs(&ctx, id, direction::EGRESS, &args, bytes);
    }
    unsafe {
        let _ = ACTIVE_WRITE_ARGS.remove(&id);
    }
    0
}

#[kprobe]
pub fn enter_sys_sendmmsg(ctx: ProbeContext) -> u32 {
    let id = bpf_get_current_pid_tgid();
    let Some(fd) = ctx.arg::<u64>(0) else { return 0 };
    let Some(msgvec) = ctx.arg::<u64>(1) else { return 0 };
    let Some(vlen) = ctx.arg::<u64>(2) else { return 0 };
    if msgvec == 0 || vlen < 1 {
        return 0;
    }
    let Some(iov) = read_user::<u64>((msgvec + USER_MSGHDR_IOV_OFFSET) as *const u64) else {
        return 0;
    };
    let Some(iovlen) = read_user::<u64>((msgvec + USER_MSGHDR_IOVLEN_OFFSET) as *const u64) else {
        return 0;
    };
    let mut args = DataArgs::zeroed();
    args.source_fn = source_fn::SENDMMSG;
    args.fd = fd as i32;
    args.iov = iov;
    args.iovlen = iovlen as u32;
    args.msg_len_ptr = msgvec + MMSGHDR_MSG_LEN_OFFSET;
    args.enter_ts = unsafe { bpf_ktime_get_ns() };
    stash_args(unsafe { &ACTIVE_WRITE_ARGS }, id, &args);
    0
}

#[tracepoint(category = "syscalls", name = "sys_exit_sendmmsg")]
pub fn sys_exit_sendmmsg(ctx: TracePointContext) -> u32 {
    let id = bpf_get_current_pid_tgid();
    let num_msgs = tp_read::<i64>(&ctx, TP_RET_OFFSET).unwrap_or(0);
    if let Some(args) = (unsafe { ACTIVE_WRITE_ARGS.get_ptr_mut(&id) }).map(|p| unsafe { *p }) {
        if num_msgs > 0 {
            if let Some(bytes) = read_user::<u32>(args.msg_len_ptr as *const u32) {
                process_syscall_data_vecs(&ctx, id, direction::EGRESS, &args, bytes as i64);
            }
        }
    }
    unsafe {
        let _ = ACTIVE_WRITE_ARGS.remove(&id);
    }
    0
}

#[kprobe]
pub fn enter_sys_recvmsg(ctx: ProbeContext) -> u32 {
    let id = bpf_get_current_pid_tgid();
    let Some(fd) = ctx.arg::<u64>(0) else { return 0 };
    let Some(msghdr) = ctx.arg::<u64>(1) else { return 0 };
    if msghdr == 0 {
        return 0;
    }
    let Some(iov) = read_user::<u64>((msghdr + USER_MSGHDR_IOV_OFFSET) as *const u64) else {
        return 0;
    };
    let Some(iovlen) = read_user::<u64>((msghdr + USER_MSGHDR_IOVLEN_OFFSET) as *const u64) else {
        return 0;
    };
    let mut args = DataArgs::zeroed();
    args.source_fn = source_fn::RECVMSG;
    args.fd = fd as i32;
    args.iov = iov;
    args.iovlen = iovlen as u32;
    stash_args(unsafe { &ACTIVE_READ_ARGS }, id, &args);
    0
}

#[tracepoint(category = "syscalls", name = "sys_exit_recvmsg")]
pub fn sys_exit_recvmsg(ctx: TracePointContext) -> u32 {
    let id = bpf_get_current_pid_tgid();
    let bytes = tp_read::<i64>(&ctx, TP_RET_OFFSET).unwrap_or(0);
    if let Some(args) = (unsafe { ACTIVE_READ_ARGS.get_ptr_mut(&id) }).map(|p| unsafe { *p }) {
        process_syscall_data_vecs(&ctx, id, direction::INGRESS, &args, bytes);
    }
    unsafe {
        let _ = ACTIVE_READ_ARGS.remove(&id);
    }
    0
}

#[kprobe]
pub fn enter_sys_recvmmsg(ctx: ProbeContext) -> u32 {
    let id = bpf_get_current_pid_tgid();
    let Some(fd) = ctx.arg::<u64>(0) else { return 0 };
    let Some(msgvec) = ctx.arg::<u64>(1) else { return 0 };
    let Some(vlen) = ctx.arg::<u64>(2) else { return 0 };
    if msgvec == 0 || vlen < 1 {
        return 0;
    }
    let Some(iov) = read_user::<u64>((msgvec + USER_MSGHDR_IOV_OFFSET) as *const u64) else {
        return 0;
    };
    let Some(iovlen) = read_user::<u64>((msgvec + USER_MSGHDR_IOVLEN_OFFSET) as *const u64) else {
        return 0;
    };
    let mut args = DataArgs::zeroed();
    args.source_fn = source_fn::RECVMMSG;
    args.fd = fd as i32;
    args.iov = iov;
    args.iovlen = iovlen as u32;
    args.msg_len_ptr = msgvec + MMSGHDR_MSG_LEN_OFFSET;
    stash_args(unsafe { &ACTIVE_READ_ARGS }, id, &args);
    0
}

#[tracepoint(category = "syscalls", name = "sys_exit_recvmmsg")]
pub fn sys_exit_recvmmsg(ctx: TracePointContext) -> u32 {
    let id = bpf_get_current_pid_tgid();
    let num_msgs = tp_read::<i64>(&ctx, TP_RET_OFFSET).unwrap_or(0);
    if let Some(args) = (unsafe { ACTIVE_READ_ARGS.get_ptr_mut(&id) }).map(|p| unsafe { *p }) {
        if num_msgs > 0 {
            if let Some(bytes) = read_user::<u32>(args.msg_len_ptr as *const u32) {
                process_syscall_data_vecs(&ctx, id, direction::INGRESS, &args, bytes as i64);
            }
        }
    }
    unsafe {
        let _ = ACTIVE_READ_ARGS.remove(&id);
    }
    0
}

// ---------------------------------------------------------------------------
// writev / readv
// ---------------------------------------------------------------------------

#[kprobe]
pub fn enter_do_writev(ctx: ProbeContext) -> u32 {
    let id = bpf_get_current_pid_tgid();
    let Some(fd) = ctx.arg::<u64>(0) else { return 0 };
    let Some(iov) = ctx.arg::<u64>(1) else { return 0 };
    let Some(iovlen) = ctx.arg::<u64>(2) else { return 0 };
    let mut args = DataArgs::zeroed();
    args.source_fn = source_fn::WRITEV;
    args.fd = fd as i32;
    args.iov = iov;
    args.iovlen = iovlen as u32;
    args.enter_ts = unsafe { bpf_ktime_get_ns() };
    stash_args(unsafe { &ACTIVE_WRITE_ARGS }, id, &args);
    0
}

#[tracepoint(category = "syscalls", name = "sys_exit_writev")]
pub fn sys_exit_writev(ctx: TracePointContext) -> u32 {
    let id = bpf_get_current_pid_tgid();
    let bytes = tp_read::<i64>(&ctx, TP_RET_OFFSET).unwrap_or(0);
    if let Some(args) = (unsafe { ACTIVE_WRITE_ARGS.get_ptr_mut(&id) }).map(|p| unsafe { *p }) {
        process_syscall_data_vecs(&ctx, id, direction::EGRESS, &args, bytes);
    }
    unsafe {
        let _ = ACTIVE_WRITE_ARGS.remove(&id);
    }
    0
}

#[kprobe]
pub fn enter_do_readv(ctx: ProbeContext) -> u32 {
    let id = bpf_get_current_pid_tgid();
    let Some(fd) = ctx.arg::<u64>(0) else { return 0 };
    let Some(iov) = ctx.arg::<u64>(1) else { return 0 };
    let Some(iovlen) = ctx.arg::<u64>(2) else { return 0 };
    let mut args = DataArgs::zeroed();
    args.source_fn = source_fn::READV;
    args.fd = fd as i32;
    args.iov = iov;
    args.iovlen = iovlen as u32;
    stash_args(unsafe { &ACTIVE_READ_ARGS }, id, &args);
    0
}

#[tracepoint(category = "syscalls", name = "sys_exit_readv")]
pub fn sys_exit_readv(ctx: TracePointContext) -> u32 {
    let id = bpf_get_current_pid_tgid();
    let bytes = tp_read::<i64>(&ctx, TP_RET_OFFSET).unwrap_or(0);
    if let Some(args) = (unsafe { ACTIVE_READ_ARGS.get_ptr_mut(&id) }).map(|p| unsafe { *p }) {
        process_syscall_data_vecs(&ctx, id, direction::INGRESS, &args, bytes);
    }
    unsafe {
        let _ = ACTIVE_READ_ARGS.remove(&id);
    }
    0
}

// ---------------------------------------------------------------------------
// close / getppid / socket
// ---------------------------------------------------------------------------

/// `close` drives offset inference while the tracer adapts, and evicts
/// the socket entry once running. UDP has no FIN, hence a syscall hook
/// rather than tcp_fin.
#[tracepoint(category = "syscalls", name = "sys_enter_close")]
pub fn sys_enter_close(ctx: TracePointContext) -> u32 {
    let Some(fd) = tp_read::<u64>(&ctx, TP_FD_OFFSET) else {
        return 0;
    };
    let fd = fd as i32;
    if !infer_offset_retry(fd) {
        return 0;
    }

    let Some(offsets) = (unsafe { MEMBER_OFFSETS.get_ptr_mut(0) }) else {
        return 0;
    };
    if get_socket_from_fd(fd, unsafe { &*offsets }).is_some() {
        let tgid = (bpf_get_current_pid_tgid() >> 32) as u32;
        let key = conn_key(tgid, fd as u32);
        if unsafe { SOCKET_INFO.get_ptr_mut(&key) }.is_some() {
            delete_socket_info(key);
        }
    }
    0
}

/// 1 Hz heartbeat: any batch whose head record is older than a second
/// goes out even if the burst is not full.
#[tracepoint(category = "syscalls", name = "sys_enter_getppid")]
pub fn sys_enter_getppid(ctx: TracePointContext) -> u32 {
    unsafe {
        let Some(buf) = DATA_BUF.get_ptr_mut(0) else {
            return 0;
        };
        if (*buf).events_num == 0 {
            return 0;
        }
        let head_ts = core::ptr::read_unaligned(
            (*buf).data.as_ptr().add(RECORD_TIMESTAMP_OFFSET) as *const u64,
        );
        if bpf_ktime_get_ns().wrapping_sub(head_ts) > BATCH_FLUSH_AGE_NS {
            flush_batch(&ctx, buf);
        }
    }
    0
}

/// The proxy upstream pattern: when a traced worker opens a fresh
/// socket mid-trace, pre-create its entry carrying the downstream peer
/// fd and the live trace id so the upcoming egress inherits both.
#[tracepoint(category = "syscalls", name = "sys_exit_socket")]
pub fn sys_exit_socket(ctx: TracePointContext) -> u32 {
    let comm = bpf_get_current_comm().unwrap_or([0u8; 16]);
    if &comm[..6] != b"nginx\0" {
        return 0;
    }

    let id = bpf_get_current_pid_tgid();
    let Some(fd) = tp_read::<i64>(&ctx, TP_RET_OFFSET) else {
        return 0;
    };
    if fd < 0 {
        return 0;
    }

    let Some(trace) = (unsafe { TRACE_MAP.get_ptr_mut(&id) }.map(|p| unsafe { *p })) else {
        return 0;
    };
    if trace.peer_fd != 0 && trace.peer_fd != fd as u32 {
        let mut sk_info = SocketInfo::zeroed();
        sk_info.peer_fd = trace.peer_fd;
        sk_info.trace_id = trace.thread_trace_id;
        let key = conn_key((id >> 32) as u32, fd as u32);
        unsafe {
            let _ = SOCKET_INFO.insert(&key, &sk_info, 0);
        }
        stats_apply(1, 0);
        debug!(&ctx, "pre-created upstream socket entry for fd {}", fd);
    }
    0
}

// ---------------------------------------------------------------------------
// process exec / exit
// ---------------------------------------------------------------------------

#[inline(always)]
fn emit_process_event<C: EbpfContext>(ctx: &C, event_type: u32) {
    let mut event = ProcessEvent::zeroed();
    event.event_type = event_type;
    event.pid = (bpf_get_current_pid_tgid() >> 32) as u32;
    event.comm = bpf_get_current_comm().unwrap_or([0u8; 16]);
    perf_output(
        ctx,
        &event as *const ProcessEvent as *const u8,
        size_of::<ProcessEvent>() as u32,
    );
}

#[tracepoint(category = "sched", name = "sched_process_exec")]
pub fn sched_process_exec(ctx: TracePointContext) -> u32 {
    emit_process_event(&ctx, EVENT_TYPE_PROC_EXEC);
    0
}

#[tracepoint(category = "sched", name = "sched_process_exit")]
pub fn sched_process_exit(ctx: TracePointContext) -> u32 {
    emit_process_event(&ctx, EVENT_TYPE_PROC_EXIT);
    0
}

#[cfg(all(not(test), target_arch = "bpf"))]
#[panic_handler]
fn panic(_: &core::panic::PanicInfo) -> ! {
    loop {}
}

#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 4] = *b"GPL\0";
