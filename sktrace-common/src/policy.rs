//! Socket/trace tracking policy.
//!
//! Pure decision logic for the two state tables: given the current
//! connection context, copies of the existing socket/trace entries and
//! the per-CPU id allocator, compute what to write back and what the
//! emitted record should carry. The syscall hooks apply the outcome to
//! the eBPF maps; the test suite applies it to plain hash maps.

use crate::types::*;

/// What to do with the thread's trace entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TraceAction {
    None,
    Upsert(TraceInfo),
    Delete,
}

/// Decision for one classified event.
#[derive(Copy, Clone, Debug)]
pub struct TrackOutcome {
    /// False for PRESTORE / RECONFIRM / CLEAR: state changes only.
    pub emit: bool,
    /// `socket_id` the record carries.
    pub socket_uid: u64,
    /// `capture_seq` the record carries.
    pub capture_seq: u64,
    pub thread_trace_id: u64,
    /// New or updated socket entry to store under the connection key.
    pub socket_write: Option<SocketInfo>,
    /// Delete the socket entry (CLEAR).
    pub socket_delete: bool,
    pub trace: TraceAction,
    /// Park the current trace id on the peer socket's entry.
    pub peer_trace_write: Option<(u32, u64)>,
    pub socket_count_delta: i64,
    pub trace_count_delta: i64,
}

impl TrackOutcome {
    fn suppressed() -> Self {
        Self {
            emit: false,
            socket_uid: 0,
            capture_seq: 0,
            thread_trace_id: 0,
            socket_write: None,
            socket_delete: false,
            trace: TraceAction::None,
            peer_trace_write: None,
            socket_count_delta: 0,
            trace_count_delta: 0,
        }
    }
}

/// Trace correlation for one event.
///
/// Consecutive same-direction, same-kind messages inherit the previous
/// trace id and keep the capture sequence, so the user-space
/// reassembler can merge them. The guard is deliberately on the stored
/// `(direction, msg_type)` pair alone and fires for response-after-
/// response as well.
fn trace_process(
    conn: &mut ConnInfo,
    socket_info: Option<&SocketInfo>,
    trace_info: Option<&TraceInfo>,
    socket_id: u64,
    uid: &mut TraceUid,
    time_ns: u64,
) -> (u64, TraceAction, i64) {
    let update_time = (time_ns / NS_PER_SEC) as u32;
    let socket_valid = socket_info.map_or(false, SocketInfo::is_valid);

    let mut pre_trace_id = 0u64;
    if let Some(s) = socket_info {
        if s.is_valid() && conn.direction == s.direction && conn.message_type == s.msg_type {
            if let Some(t) = trace_info {
                pre_trace_id = t.thread_trace_id;
            }
            conn.keep_data_seq = true;
        }
    }

    if conn.direction == direction::INGRESS {
        // An open trace for this thread is joined, not replaced.
        let id = match trace_info {
            Some(t) => t.thread_trace_id,
            None => {
                uid.thread_trace_id += 1;
                uid.thread_trace_id
            }
        };

        let mut peer_fd = 0u32;
        if conn.message_type == msg_type::REQUEST {
            peer_fd = conn.fd;
        } else if conn.message_type == msg_type::RESPONSE {
            if let Some(s) = socket_info {
                if socket_valid && s.peer_fd != 0 {
                    peer_fd = s.peer_fd;
                }
            }
        }

        let entry = TraceInfo {
            thread_trace_id: id,
            socket_id,
            peer_fd,
            update_time,
        };
        let delta = if trace_info.is_none() { 1 } else { 0 };
        (id, TraceAction::Upsert(entry), delta)
    } else {
        match trace_info {
            Some(t) if socket_id != t.socket_id => {
                // Relay completed across sockets.
                (t.thread_trace_id, TraceAction::Delete, -1)
            }
            Some(_) if conn.keep_data_seq && pre_trace_id != 0 => {
                // Pipelined same-kind egress stays on the open trace.
                (pre_trace_id, TraceAction::None, 0)
            }
            Some(_) => {
                // Same-socket egress is not a cross-socket correlation.
                (0, TraceAction::Delete, -1)
            }
            None if conn.message_type == msg_type::REQUEST
                && !socket_info.map_or(false, |s| s.trace_id != 0) =>
            {
                // A client request opens the trace so the same-socket
                // response can join it. A trace id parked on the entry
                // means this egress belongs to a relay already being
                // traced, so no new trace is opened.
                uid.thread_trace_id += 1;
                let id = uid.thread_trace_id;
                let entry = TraceInfo {
                    thread_trace_id: id,
                    socket_id,
                    peer_fd: conn.fd,
                    update_time,
                };
                (id, TraceAction::Upsert(entry), 1)
            }
            None => (0, TraceAction::None, 0),
        }
    }
}

/// Full table-update decision for one classified event.
pub fn track_event(
    conn: &mut ConnInfo,
    socket_info: Option<SocketInfo>,
    trace_info: Option<TraceInfo>,
    uid: &mut TraceUid,
    time_ns: u64,
    is_go: bool,
) -> TrackOutcome {
    if conn.message_type == msg_type::UNKNOWN {
        return TrackOutcome::suppressed();
    }

    if conn.message_type == msg_type::CLEAR {
        let mut out = TrackOutcome::suppressed();
        if socket_info.is_some() {
            out.socket_delete = true;
            out.socket_count_delta = -1;
        }
        return out;
    }

    let update_time = (time_ns / NS_PER_SEC) as u32;
    let valid = socket_info.as_ref().map_or(false, SocketInfo::is_valid);
    let socket_id = match socket_info.as_ref() {
        Some(s) if s.is_valid() => s.uid,
        _ => uid.socket_id + 1,
    };

    let mut thread_trace_id = 0u64;
    let mut trace = TraceAction::None;
    let mut trace_count_delta = 0i64;
    let suppressing = conn.message_type == msg_type::PRESTORE
        || conn.message_type == msg_type::RECONFIRM;
    if !suppressing && !is_go {
        let (id, action, delta) = trace_process(
            conn,
            socket_info.as_ref(),
            trace_info.as_ref(),
            socket_id,
            uid,
            time_ns,
        );
        thread_trace_id = id;
        trace = action;
        trace_count_delta = delta;
    }

    let mut out = TrackOutcome {
        emit: !suppressing,
        socket_uid: socket_id,
        capture_seq: 0,
        thread_trace_id,
        socket_write: None,
        socket_delete: false,
        trace,
        peer_trace_write: None,
        socket_count_delta: 0,
        trace_count_delta,
    };

    if !valid {
        let mut sk = SocketInfo::zeroed();
        if let Some(placeholder) = socket_info.as_ref() {
            // A peer entry pre-created on socket() carries the fds and
            // the trace id the next egress must adopt.
            if conn.direction == direction::EGRESS {
                sk.peer_fd = placeholder.peer_fd;
                out.thread_trace_id = placeholder.trace_id;
            }
        }

        sk.uid = uid.socket_id + 1;
        uid.socket_id += 1;
        sk.seq = 1;
        sk.l7_proto = conn.protocol;
        sk.direction = conn.direction;
        sk.msg_type = conn.message_type;
        sk.role = conn.role;
        sk.update_time = update_time;
        sk.need_reconfirm = conn.need_reconfirm as u8;
        sk.correlation_id = conn.correlation_id;

        if conn.message_type == msg_type::PRESTORE {
            sk.prev_data = conn.prev_buf;
            sk.prev_data_len = conn.prev_count;
            sk.uid = 0;
            sk.seq = 0;
        }

        if socket_info.is_none() {
            out.socket_count_delta = 1;
        }
        out.socket_uid = sk.uid;
        out.capture_seq = sk.seq;
        out.socket_write = Some(sk);
        return out;
    }

    if suppressing {
        return out;
    }

    let mut sk = socket_info.unwrap();
    out.socket_uid = sk.uid;
    sk.seq = if conn.keep_data_seq { sk.seq } else { sk.seq + 1 };
    out.capture_seq = sk.seq;
    sk.direction = conn.direction;
    sk.msg_type = conn.message_type;
    sk.update_time = update_time;
    sk.need_reconfirm = conn.need_reconfirm as u8;
    sk.correlation_id = conn.correlation_id;

    if sk.peer_fd != 0 && conn.direction == direction::INGRESS {
        out.peer_trace_write = Some((sk.peer_fd, out.thread_trace_id));
    }

    if conn.direction == direction::EGRESS && sk.trace_id != 0 {
        out.thread_trace_id = sk.trace_id;
        sk.trace_id = 0;
    }

    out.socket_write = Some(sk);
    out
}

/// Idle-time eviction predicate used by the reclaimer. Uses wrapping
/// arithmetic so a stale `update_time` after a counter wrap still
/// reclaims.
#[inline(always)]
pub fn is_stale(update_time: u32, uptime_secs: u32, timeout_secs: u32) -> bool {
    uptime_secs.wrapping_sub(update_time) > timeout_secs
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const T0: u64 = 5 * NS_PER_SEC;

    /// User-space stand-in for the two eBPF maps plus the per-CPU
    /// allocator; applies outcomes the way the hooks do.
    struct SimTables {
        sockets: HashMap<u64, SocketInfo>,
        traces: HashMap<u64, TraceInfo>,
        uid: TraceUid,
        socket_count: i64,
        trace_count: i64,
    }

    impl SimTables {
        fn new() -> Self {
            Self {
                sockets: HashMap::new(),
                traces: HashMap::new(),
                uid: TraceUid::seeded(0, 1_000_000_000_000),
                socket_count: 0,
                trace_count: 0,
            }
        }

        fn event(
            &mut self,
            tgid: u32,
            tid: u64,
            fd: u32,
            dir: u8,
            msg: u8,
            proto: u8,
            time_ns: u64,
        ) -> TrackOutcome {
            let key = conn_key(tgid, fd);
            let mut conn = ConnInfo::new(fd);
            conn.direction = dir;
            conn.message_type = msg;
            conn.protocol = proto;
            let out = track_event(
                &mut conn,
                self.sockets.get(&key).copied(),
                self.traces.get(&tid).copied(),
                &mut self.uid,
                time_ns,
                false,
            );
            self.apply(key, tid, &out);
            out
        }

        fn apply(&mut self, key: u64, tid: u64, out: &TrackOutcome) {
            if out.socket_delete {
                self.sockets.remove(&key);
            }
            if let Some(sk) = out.socket_write {
                self.sockets.insert(key, sk);
            }
            match out.trace {
                TraceAction::Upsert(t) => {
                    self.traces.insert(tid, t);
                }
                TraceAction::Delete => {
                    self.traces.remove(&tid);
                }
                TraceAction::None => {}
            }
            if let Some((peer_fd, trace_id)) = out.peer_trace_write {
                let peer_key = (key & 0xffff_ffff_0000_0000) | peer_fd as u64;
                if let Some(peer) = self.sockets.get_mut(&peer_key) {
                    if peer.is_valid() {
                        peer.trace_id = trace_id;
                    }
                }
            }
            self.socket_count += out.socket_count_delta;
            self.trace_count += out.trace_count_delta;
        }
    }

    #[test]
    fn http_request_response_round_trip() {
        // write(GET) then read(200 OK) on one socket, one thread.
        let mut sim = SimTables::new();
        let req = sim.event(10, 100, 3, direction::EGRESS, msg_type::REQUEST, l7_proto::HTTP1, T0);
        let rsp = sim.event(10, 100, 3, direction::INGRESS, msg_type::RESPONSE, l7_proto::HTTP1, T0 + 1);

        assert!(req.emit && rsp.emit);
        assert_eq!(req.socket_uid, rsp.socket_uid);
        assert_eq!(req.capture_seq, 1);
        assert_eq!(rsp.capture_seq, 2);
        assert_ne!(req.thread_trace_id, 0);
        assert_eq!(req.thread_trace_id, rsp.thread_trace_id);
    }

    #[test]
    fn cross_socket_relay_shares_trace_and_closes_it() {
        // Thread reads a request on fd 5, answers on fd 7.
        let mut sim = SimTables::new();
        let ingress = sim.event(10, 100, 5, direction::INGRESS, msg_type::REQUEST, l7_proto::HTTP1, T0);
        let egress = sim.event(10, 100, 7, direction::EGRESS, msg_type::RESPONSE, l7_proto::HTTP1, T0 + 1);

        assert_ne!(ingress.thread_trace_id, 0);
        assert_eq!(ingress.thread_trace_id, egress.thread_trace_id);
        assert!(sim.traces.is_empty(), "trace entry must be gone after the relay egress");
    }

    #[test]
    fn same_socket_egress_response_is_not_a_relay() {
        let mut sim = SimTables::new();
        sim.event(10, 100, 5, direction::INGRESS, msg_type::REQUEST, l7_proto::HTTP1, T0);
        // Server answers on the socket the request came in on: the
        // trace is dropped without attaching the id.
        let egress = sim.event(10, 100, 5, direction::EGRESS, msg_type::RESPONSE, l7_proto::HTTP1, T0 + 1);
        assert_eq!(egress.thread_trace_id, 0);
        assert!(sim.traces.is_empty());
    }

    #[test]
    fn consecutive_same_kind_messages_keep_seq_and_trace_id() {
        let mut sim = SimTables::new();
        let first = sim.event(10, 100, 5, direction::INGRESS, msg_type::REQUEST, l7_proto::HTTP1, T0);
        let second = sim.event(10, 100, 5, direction::INGRESS, msg_type::REQUEST, l7_proto::HTTP1, T0 + 1);

        assert_eq!(first.capture_seq, second.capture_seq);
        assert_eq!(first.thread_trace_id, second.thread_trace_id);
    }

    #[test]
    fn response_after_response_also_inherits() {
        // The stored-pair guard fires for any same-kind repetition.
        let mut sim = SimTables::new();
        sim.event(10, 100, 5, direction::INGRESS, msg_type::REQUEST, l7_proto::HTTP1, T0);
        let r1 = sim.event(10, 100, 7, direction::EGRESS, msg_type::RESPONSE, l7_proto::HTTP1, T0 + 1);
        // Re-open a trace, then emit two consecutive ingress responses.
        sim.event(10, 100, 7, direction::INGRESS, msg_type::RESPONSE, l7_proto::HTTP1, T0 + 2);
        let r2 = sim.event(10, 100, 7, direction::INGRESS, msg_type::RESPONSE, l7_proto::HTTP1, T0 + 3);

        assert_ne!(r1.thread_trace_id, 0);
        let t2 = sim.traces.get(&100).unwrap().thread_trace_id;
        assert_eq!(r2.thread_trace_id, t2);
        assert_eq!(r2.capture_seq, 2);
    }

    #[test]
    fn prestore_stashes_without_emitting() {
        let mut sim = SimTables::new();
        let key = conn_key(10, 4);
        let mut conn = ConnInfo::new(4);
        conn.direction = direction::INGRESS;
        conn.message_type = msg_type::PRESTORE;
        conn.protocol = l7_proto::MYSQL;
        conn.prev_buf = [0x21, 0x00, 0x00, 0x00];
        conn.prev_count = 4;
        let out = track_event(&mut conn, None, None, &mut sim.uid, T0, false);
        sim.apply(key, 100, &out);

        assert!(!out.emit);
        let entry = sim.sockets.get(&key).unwrap();
        assert_eq!(entry.uid, 0, "prestore entries are placeholders");
        assert_eq!(entry.prev_data_len, 4);
        assert_eq!(entry.prev_data, [0x21, 0x00, 0x00, 0x00]);

        // Second read re-classifies and emits a fresh record with seq 1.
        let body = sim.event(10, 100, 4, direction::INGRESS, msg_type::REQUEST, l7_proto::MYSQL, T0 + 1);
        assert!(body.emit);
        assert_eq!(body.capture_seq, 1);
        assert_ne!(body.socket_uid, 0);
    }

    #[test]
    fn reconfirm_creates_entry_without_emitting() {
        let mut sim = SimTables::new();
        let key = conn_key(10, 9);
        let mut conn = ConnInfo::new(9);
        conn.direction = direction::EGRESS;
        conn.message_type = msg_type::RECONFIRM;
        conn.protocol = l7_proto::KAFKA;
        conn.need_reconfirm = true;
        let out = track_event(&mut conn, None, None, &mut sim.uid, T0, false);
        sim.apply(key, 100, &out);

        assert!(!out.emit);
        let entry = sim.sockets.get(&key).unwrap();
        assert!(entry.is_valid());
        assert_eq!(entry.need_reconfirm, 1);
    }

    #[test]
    fn clear_evicts_the_entry() {
        let mut sim = SimTables::new();
        sim.event(10, 100, 3, direction::EGRESS, msg_type::REQUEST, l7_proto::REDIS, T0);
        assert_eq!(sim.socket_count, 1);

        let key = conn_key(10, 3);
        let mut conn = ConnInfo::new(3);
        conn.direction = direction::EGRESS;
        conn.message_type = msg_type::CLEAR;
        let existing = sim.sockets.get(&key).copied();
        let out = track_event(&mut conn, existing, None, &mut sim.uid, T0 + 1, false);
        sim.apply(key, 100, &out);

        assert!(!out.emit);
        assert!(sim.sockets.is_empty());
        assert_eq!(sim.socket_count, 0);
    }

    #[test]
    fn fd_reuse_allocates_a_new_socket_id() {
        let mut sim = SimTables::new();
        let first = sim.event(10, 100, 3, direction::EGRESS, msg_type::REQUEST, l7_proto::HTTP1, T0);
        // close(3) deletes the entry; the next user of fd 3 is a new socket.
        sim.sockets.remove(&conn_key(10, 3));
        let second = sim.event(10, 101, 3, direction::EGRESS, msg_type::REQUEST, l7_proto::HTTP1, T0 + 2);

        assert_ne!(first.socket_uid, second.socket_uid);
        assert_eq!(second.capture_seq, 1);
    }

    #[test]
    fn socket_ids_never_repeat() {
        let mut sim = SimTables::new();
        let mut seen = std::collections::HashSet::new();
        for fd in 3..40u32 {
            let out = sim.event(10, 100 + fd as u64, fd, direction::INGRESS, msg_type::REQUEST, l7_proto::REDIS, T0);
            assert!(seen.insert(out.socket_uid), "duplicate socket id {}", out.socket_uid);
        }
    }

    #[test]
    fn placeholder_peer_entry_hands_trace_to_egress() {
        // The proxy pattern: socket() pre-created an entry carrying the
        // upstream peer fd and the live trace id.
        let mut sim = SimTables::new();
        let key = conn_key(10, 12);
        let mut placeholder = SocketInfo::zeroed();
        placeholder.peer_fd = 5;
        placeholder.trace_id = 777;
        sim.sockets.insert(key, placeholder);

        let out = sim.event(10, 200, 12, direction::EGRESS, msg_type::REQUEST, l7_proto::HTTP1, T0);
        assert_eq!(out.thread_trace_id, 777);
        assert!(sim.traces.is_empty(), "adopted traces never open a second trace");
        let entry = sim.sockets.get(&key).unwrap();
        assert!(entry.is_valid());
        assert_eq!(entry.peer_fd, 5);
    }

    #[test]
    fn ingress_parks_trace_id_on_peer() {
        let mut sim = SimTables::new();
        // Establish both sockets, then wire fd 5's entry to peer fd 7.
        sim.event(10, 100, 5, direction::INGRESS, msg_type::REQUEST, l7_proto::HTTP1, T0);
        sim.event(10, 100, 7, direction::EGRESS, msg_type::RESPONSE, l7_proto::HTTP1, T0 + 1);
        sim.sockets.get_mut(&conn_key(10, 5)).unwrap().peer_fd = 7;

        let ingress = sim.event(10, 100, 5, direction::INGRESS, msg_type::REQUEST, l7_proto::HTTP1, T0 + 2);
        assert_eq!(
            sim.sockets.get(&conn_key(10, 7)).unwrap().trace_id,
            ingress.thread_trace_id
        );

        // The peer's next egress adopts the parked id even on another thread.
        let egress = sim.event(10, 300, 7, direction::EGRESS, msg_type::RESPONSE, l7_proto::HTTP1, T0 + 3);
        assert_eq!(egress.thread_trace_id, ingress.thread_trace_id);
        assert_eq!(sim.sockets.get(&conn_key(10, 7)).unwrap().trace_id, 0);
    }

    #[test]
    fn go_processes_skip_thread_tracing() {
        let mut sim = SimTables::new();
        let key = conn_key(10, 3);
        let mut conn = ConnInfo::new(3);
        conn.direction = direction::INGRESS;
        conn.message_type = msg_type::REQUEST;
        conn.protocol = l7_proto::HTTP1;
        let out = track_event(&mut conn, None, None, &mut sim.uid, T0, true);
        sim.apply(key, 100, &out);

        assert!(out.emit);
        assert_eq!(out.thread_trace_id, 0);
        assert!(sim.traces.is_empty());
        assert_eq!(out.capture_seq, 1);
    }

    #[test]
    fn stale_predicate_is_idempotent() {
        assert!(!is_stale(100, 105, 10));
        assert!(is_stale(100, 111, 10));
        // Evicting an already-evicted entry is a no-op at the map
        // level; the predicate itself never flips back.
        assert!(is_stale(100, 200, 10));
        // Wrapped uptime still reclaims.
        assert!(is_stale(u32::MAX - 5, 20, 10));
    }
}
