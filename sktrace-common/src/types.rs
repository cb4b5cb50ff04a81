use bytemuck::{Pod, Zeroable};

/// Captured payload window per record.
pub const CAP_DATA_SIZE: usize = 1024;

/// Process/thread name length, as the kernel reports it.
pub const COMM_LEN: usize = 16;

/// Bytes a two-read protocol (MySQL, Kafka) may stash between reads.
pub const PREV_DATA_SIZE: usize = 4;

/// Records per batch before the buffer is pushed to the perf ring.
pub const EVENT_BURST_NUM: u32 = 16;

/// Payload capacity of the per-CPU batch buffer. Together with the
/// two u32 header fields the whole envelope is 2^15 bytes, so a
/// masked length always passes the verifier's bounds check.
pub const DATA_BUF_CAPACITY: usize = 32760;

/// Full batch envelope size (power of two).
pub const SOCKET_DATA_BUFFER_SIZE: usize = DATA_BUF_CAPACITY + 8;

/// A batch older than this is flushed by the heartbeat probe.
pub const BATCH_FLUSH_AGE_NS: u64 = 1_000_000_000;

/// Iovec entries concatenated into one capture window.
pub const IOV_COPY_LIMIT: usize = 12;

/// Bytes of payload handed to protocol inference.
pub const INFER_BUF_SIZE: usize = 32;

/// Idle seconds before the reclaimer evicts a socket entry.
pub const SOCKET_RECLAIM_TIMEOUT_SECS: u32 = 10;

/// Idle seconds before the reclaimer evicts a trace entry.
pub const TRACE_RECLAIM_TIMEOUT_SECS: u32 = 10;

/// Trace-map reclaim kicks in above `max_entries * 0.9`.
pub const RECLAIM_TRACE_MAP_SCALE: f64 = 0.9;

pub const NS_PER_SEC: u64 = 1_000_000_000;
pub const NS_PER_US: u64 = 1_000;

/// The unique-id space is `[cpu:8][boot_realtime_ns / 100:56]`.
pub const UID_BASE_MASK: u64 = 0x00ff_ffff_ffff_ffff;

/// Event-type namespace on the perf ring. Values 1..=31 are socket
/// data batches (the value is the record count); single bits from
/// 1<<5 upward are registered extra events.
pub const EVENT_TYPE_MIN: u32 = 1 << 5;
pub const EVENT_TYPE_PROC_EXEC: u32 = 1 << 5;
pub const EVENT_TYPE_PROC_EXIT: u32 = 1 << 6;

pub mod direction {
    pub const EGRESS: u8 = 0;
    pub const INGRESS: u8 = 1;
}

pub mod msg_type {
    pub const UNKNOWN: u8 = 0;
    pub const REQUEST: u8 = 1;
    pub const RESPONSE: u8 = 2;
    /// Up to four bytes were stashed; classification needs the next read.
    pub const PRESTORE: u8 = 3;
    /// Classification is tentative, revisit on the next same-direction message.
    pub const RECONFIRM: u8 = 4;
    /// The connection should be evicted from the socket table.
    pub const CLEAR: u8 = 5;
}

pub mod role {
    pub const UNKNOWN: u8 = 0;
    pub const CLIENT: u8 = 1;
    pub const SERVER: u8 = 2;
}

pub mod l7_proto {
    pub const UNKNOWN: u8 = 0;
    pub const HTTP1: u8 = 1;
    pub const DUBBO: u8 = 2;
    pub const MYSQL: u8 = 3;
    pub const REDIS: u8 = 4;
    pub const KAFKA: u8 = 5;
    pub const DNS: u8 = 6;
    /// One past the highest protocol id; sizes the per-protocol stats.
    pub const NUM: u8 = 7;

    pub fn name(proto: u8) -> &'static str {
        match proto {
            HTTP1 => "http1",
            DUBBO => "dubbo",
            MYSQL => "mysql",
            REDIS => "redis",
            KAFKA => "kafka",
            DNS => "dns",
            _ => "unknown",
        }
    }
}

/// Syscall the stashed arguments came from.
pub mod source_fn {
    pub const WRITE: u32 = 1;
    pub const READ: u32 = 2;
    pub const SENDTO: u32 = 3;
    pub const RECVFROM: u32 = 4;
    pub const SENDMSG: u32 = 5;
    pub const SENDMMSG: u32 = 6;
    pub const RECVMSG: u32 = 7;
    pub const RECVMMSG: u32 = 8;
    pub const WRITEV: u32 = 9;
    pub const READV: u32 = 10;
}

// Kernel constants the classifier interprets.
pub const SOCK_STREAM: u16 = 1;
pub const SOCK_DGRAM: u16 = 2;
pub const PF_INET: u16 = 2;
pub const PF_INET6: u16 = 10;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const TCP_ESTABLISHED: u8 = 1;
pub const TCP_CLOSE_WAIT: u8 = 8;

/// Connection 5-tuple as captured from `sock_common`. The source port
/// (`num`) stays in host order, matching the kernel layout; `dport` is
/// converted to host order at capture time.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct Tuple {
    pub daddr: [u8; 16],
    pub saddr: [u8; 16],
    pub addr_len: u8,
    pub l4_protocol: u8,
    pub dport: u16,
    pub num: u16,
}

impl Tuple {
    pub const fn zeroed() -> Self {
        Self {
            daddr: [0; 16],
            saddr: [0; 16],
            addr_len: 0,
            l4_protocol: 0,
            dport: 0,
            num: 0,
        }
    }
}

/// One captured socket event, packed little-endian onto the perf ring.
///
/// `flags` packs the direction into bit 0 and the message type into
/// bits 1..=7.
#[repr(C, packed)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct CaptureRecord {
    pub pid: u32,
    pub tgid: u32,
    pub coroutine_id: u64,
    pub comm: [u8; COMM_LEN],
    pub socket_id: u64,
    pub tuple: Tuple,
    pub extra_data: u32,
    pub extra_data_count: u32,
    pub tcp_seq: u32,
    pub thread_trace_id: u64,
    pub timestamp: u64,
    pub flags: u8,
    pub syscall_len: u64,
    pub data_seq: u64,
    pub data_type: u16,
    pub data_len: u16,
    pub data: [u8; CAP_DATA_SIZE],
}

/// Record header size, excluding the payload window.
pub const RECORD_HEADER_SIZE: usize = core::mem::size_of::<CaptureRecord>() - CAP_DATA_SIZE;

/// Byte offset of `timestamp` inside the packed record; the heartbeat
/// probe peeks at the batch head through it.
pub const RECORD_TIMESTAMP_OFFSET: usize = 98;

impl CaptureRecord {
    pub fn direction(&self) -> u8 {
        self.flags & 1
    }

    pub fn msg_type(&self) -> u8 {
        self.flags >> 1
    }

    pub fn pack_flags(direction: u8, msg_type: u8) -> u8 {
        (direction & 1) | (msg_type << 1)
    }
}

/// Batch envelope shared with the kernel: a per-CPU accumulation
/// buffer that is pushed to the perf ring whole. `len` counts the
/// valid bytes in `data`; `events_num` the records inside.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct SocketDataBuffer {
    pub events_num: u32,
    pub len: u32,
    pub data: [u8; DATA_BUF_CAPACITY],
}

impl SocketDataBuffer {
    pub const fn zeroed() -> Self {
        Self {
            events_num: 0,
            len: 0,
            data: [0; DATA_BUF_CAPACITY],
        }
    }
}

/// Per-socket tracking state, keyed by `(tgid << 32) | fd`.
///
/// `uid == 0` marks a placeholder: either a PRESTORE stash waiting for
/// the second read, or a peer entry pre-created on `socket()` for the
/// proxy pattern. Placeholders never emitted a record yet.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct SocketInfo {
    pub uid: u64,
    /// Capture sequence of the last emitted record.
    pub seq: u64,
    /// Trace id parked here by a peer ingress, consumed by the next egress.
    pub trace_id: u64,
    pub correlation_id: i32,
    pub peer_fd: u32,
    /// Seconds since boot at the last touch.
    pub update_time: u32,
    pub prev_data_len: u32,
    pub prev_data: [u8; PREV_DATA_SIZE],
    pub l7_proto: u8,
    pub direction: u8,
    pub msg_type: u8,
    pub role: u8,
    pub need_reconfirm: u8,
    pub _pad: [u8; 7],
}

impl SocketInfo {
    pub const fn zeroed() -> Self {
        Self {
            uid: 0,
            seq: 0,
            trace_id: 0,
            correlation_id: 0,
            peer_fd: 0,
            update_time: 0,
            prev_data_len: 0,
            prev_data: [0; PREV_DATA_SIZE],
            l7_proto: 0,
            direction: 0,
            msg_type: 0,
            role: 0,
            need_reconfirm: 0,
            _pad: [0; 7],
        }
    }

    /// Placeholders (`uid == 0`) do not count as established tracking state.
    pub fn is_valid(&self) -> bool {
        self.uid != 0
    }
}

/// Per-thread trace state, keyed by `(tgid << 32) | tid`.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct TraceInfo {
    pub thread_trace_id: u64,
    /// Socket the trace started on; same-socket egress is not a relay.
    pub socket_id: u64,
    /// Fd the paired message is expected on, if known.
    pub peer_fd: u32,
    pub update_time: u32,
}

impl TraceInfo {
    pub const fn zeroed() -> Self {
        Self {
            thread_trace_id: 0,
            socket_id: 0,
            peer_fd: 0,
            update_time: 0,
        }
    }
}

/// Per-CPU id allocator. Seeded once with
/// `[cpu:8][boot_realtime_ns / 100:56]` and incremented without locks;
/// socket ids and thread trace ids share the base.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct TraceUid {
    pub socket_id: u64,
    pub coroutine_trace_id: u64,
    pub thread_trace_id: u64,
}

impl TraceUid {
    pub const fn zeroed() -> Self {
        Self {
            socket_id: 0,
            coroutine_trace_id: 0,
            thread_trace_id: 0,
        }
    }

    pub fn seeded(cpu: u8, realtime_ns: u64) -> Self {
        let base = ((cpu as u64) << 56) | ((realtime_ns / 100) & UID_BASE_MASK);
        Self {
            socket_id: base,
            coroutine_trace_id: base,
            thread_trace_id: base,
        }
    }
}

/// Per-CPU table statistics, aggregated across CPUs in user space.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct TraceStats {
    pub socket_map_count: u64,
    pub trace_map_count: u64,
    /// Failed probe reads, counted by the typed read helper.
    pub probe_read_faults: u64,
}

impl TraceStats {
    pub const fn zeroed() -> Self {
        Self {
            socket_map_count: 0,
            trace_map_count: 0,
            probe_read_faults: 0,
        }
    }
}

/// Byte offsets of the kernel-struct fields the probes need, one
/// record per CPU. Immutable once `ready` is set: the lifecycle
/// broadcasts the winning record to every CPU slot and the hooks only
/// read it afterwards.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct MemberOffsets {
    pub task_files: u32,
    pub sock_flags: u32,
    pub tcp_copied_seq: u32,
    pub tcp_write_seq: u32,
    pub ready: u32,
    pub _pad: u32,
}

impl MemberOffsets {
    pub const fn zeroed() -> Self {
        Self {
            task_files: 0,
            sock_flags: 0,
            tcp_copied_seq: 0,
            tcp_write_seq: 0,
            ready: 0,
            _pad: 0,
        }
    }
}

/// Stashed syscall-entry arguments, keyed by pid_tgid until the exit
/// hook consumes them. Pointer fields hold user-space addresses.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct DataArgs {
    pub buf: u64,
    pub iov: u64,
    /// Address of `mmsghdr.msg_len`, read back at sendmmsg/recvmmsg exit.
    pub msg_len_ptr: u64,
    pub enter_ts: u64,
    pub fd: i32,
    pub iovlen: u32,
    pub source_fn: u32,
    pub _pad: u32,
}

impl DataArgs {
    pub const fn zeroed() -> Self {
        Self {
            buf: 0,
            iov: 0,
            msg_len_ptr: 0,
            enter_ts: 0,
            fd: 0,
            iovlen: 0,
            source_fn: 0,
            _pad: 0,
        }
    }
}

/// Process exec/exit event, dispatched through the extra-event range.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct ProcessEvent {
    pub event_type: u32,
    pub pid: u32,
    pub comm: [u8; COMM_LEN],
}

impl ProcessEvent {
    pub const fn zeroed() -> Self {
        Self {
            event_type: 0,
            pid: 0,
            comm: [0; COMM_LEN],
        }
    }
}

/// Out-of-band context for one syscall event.
#[derive(Copy, Clone, Debug, Default)]
pub struct ProcessDataExtra {
    /// Buffer arrives as an iovec array instead of one pointer.
    pub vecs: bool,
    /// Go runtime detected; coroutine ids replace thread tracing.
    pub is_go: bool,
    pub tls: bool,
    /// The TLS uprobe path supplies its own TCP sequence.
    pub use_tcp_seq: bool,
    pub tcp_seq: u32,
    pub coroutine_id: u64,
}

/// Per-event connection context, built on the probe stack from the
/// classifier and the existing socket entry before inference runs.
#[derive(Copy, Clone, Debug)]
pub struct ConnInfo {
    pub fd: u32,
    pub direction: u8,
    pub message_type: u8,
    pub protocol: u8,
    pub role: u8,
    /// Protocol already recorded on the socket entry, if any.
    pub pinned_proto: u8,
    pub need_reconfirm: bool,
    pub keep_data_seq: bool,
    pub correlation_id: i32,
    pub prev_buf: [u8; PREV_DATA_SIZE],
    pub prev_count: u32,
    pub skc_family: u16,
    pub sk_type: u16,
    pub tuple: Tuple,
}

impl ConnInfo {
    pub const fn new(fd: u32) -> Self {
        Self {
            fd,
            direction: direction::EGRESS,
            message_type: msg_type::UNKNOWN,
            protocol: l7_proto::UNKNOWN,
            role: role::UNKNOWN,
            pinned_proto: l7_proto::UNKNOWN,
            need_reconfirm: false,
            keep_data_seq: false,
            correlation_id: -1,
            prev_buf: [0; PREV_DATA_SIZE],
            prev_count: 0,
            skc_family: 0,
            sk_type: 0,
            tuple: Tuple::zeroed(),
        }
    }
}

/// Key of the socket table.
#[inline(always)]
pub fn conn_key(tgid: u32, fd: u32) -> u64 {
    ((tgid as u64) << 32) | fd as u64
}

/// Translate a kernel monotonic timestamp to wall-clock microseconds.
#[inline(always)]
pub fn boot_to_epoch_us(ktime_ns: u64, sys_boot_time_ns: u64) -> u64 {
    (ktime_ns + sys_boot_time_ns) / NS_PER_US
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn record_layout() {
        // 127-byte header ahead of the 1024-byte payload window.
        assert_eq!(size_of::<Tuple>(), 38);
        assert_eq!(RECORD_HEADER_SIZE, 127);
        assert_eq!(size_of::<CaptureRecord>(), 1151);
    }

    #[test]
    fn batch_envelope_is_power_of_two() {
        assert_eq!(size_of::<SocketDataBuffer>(), SOCKET_DATA_BUFFER_SIZE);
        assert!(SOCKET_DATA_BUFFER_SIZE.is_power_of_two());
        // A full burst always fits.
        assert!(EVENT_BURST_NUM as usize * size_of::<CaptureRecord>() <= DATA_BUF_CAPACITY);
    }

    #[test]
    fn map_value_layouts_have_no_padding() {
        assert_eq!(size_of::<SocketInfo>(), 56);
        assert_eq!(size_of::<TraceInfo>(), 24);
        assert_eq!(size_of::<TraceUid>(), 24);
        assert_eq!(size_of::<TraceStats>(), 24);
        assert_eq!(size_of::<MemberOffsets>(), 24);
        assert_eq!(size_of::<DataArgs>(), 48);
        assert_eq!(size_of::<ProcessEvent>(), 24);
    }

    #[test]
    fn timestamp_field_offset_matches_layout() {
        let mut rec = CaptureRecord::zeroed();
        rec.timestamp = 0x1122_3344_5566_7788;
        let bytes = bytemuck::bytes_of(&rec);
        let got = u64::from_le_bytes(
            bytes[RECORD_TIMESTAMP_OFFSET..RECORD_TIMESTAMP_OFFSET + 8]
                .try_into()
                .unwrap(),
        );
        let want = rec.timestamp;
        assert_eq!(got, want);
    }

    #[test]
    fn flags_round_trip() {
        let flags = CaptureRecord::pack_flags(direction::INGRESS, msg_type::RESPONSE);
        let mut rec = CaptureRecord::zeroed();
        rec.flags = flags;
        assert_eq!(rec.direction(), direction::INGRESS);
        assert_eq!(rec.msg_type(), msg_type::RESPONSE);
    }

    #[test]
    fn uid_seeding_partitions_cpu_and_time() {
        let uid = TraceUid::seeded(3, 1_700_000_000_123_456_789);
        assert_eq!(uid.socket_id >> 56, 3);
        assert_eq!(uid.socket_id & UID_BASE_MASK, 1_700_000_000_123_456_789 / 100);
        assert_eq!(uid.socket_id, uid.thread_trace_id);
    }

    #[test]
    fn conn_key_packs_tgid_and_fd() {
        assert_eq!(conn_key(7, 3), (7u64 << 32) | 3);
    }

    #[cfg(feature = "user")]
    #[test]
    fn offsets_serialize_for_the_control_socket() {
        let mut offsets = MemberOffsets::zeroed();
        offsets.task_files = 0xa88;
        offsets.ready = 1;
        let json = serde_json::to_string(&offsets).expect("serialize offsets");
        let back: MemberOffsets = serde_json::from_str(&json).expect("deserialize offsets");
        assert_eq!(back.task_files, 0xa88);
        assert_eq!(back.ready, 1);
    }

    #[test]
    fn timestamp_translation() {
        assert_eq!(boot_to_epoch_us(2_000, 1_000_000), 1_002);
    }
}
