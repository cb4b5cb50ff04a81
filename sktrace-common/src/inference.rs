//! Application-protocol inference.
//!
//! `infer_protocol` classifies one syscall's payload prefix against the
//! connection context and yields `{protocol, message type}`. Two-read
//! protocols answer `PRESTORE` (stash the 4-byte header, wait for the
//! body), tentative classifications answer `RECONFIRM`, and a protocol
//! teardown answers `CLEAR`. Only a bounded prefix of the payload is
//! examined; anything the recognizers cannot place stays `UNKNOWN` and
//! is dropped upstream.

use crate::types::*;

/// Result of one inference call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ProtocolMessage {
    pub protocol: u8,
    pub msg_type: u8,
}

pub const UNKNOWN_MESSAGE: ProtocolMessage = ProtocolMessage {
    protocol: l7_proto::UNKNOWN,
    msg_type: msg_type::UNKNOWN,
};

enum Verdict {
    Match(u8),
    Indeterminate,
}

const HTTP_METHODS: [&[u8]; 9] = [
    b"GET ", b"POST ", b"PUT ", b"DELETE ", b"HEAD ", b"OPTIONS ", b"PATCH ", b"TRACE ",
    b"CONNECT ",
];

#[inline(always)]
fn starts_with(buf: &[u8], prefix: &[u8]) -> bool {
    buf.len() >= prefix.len() && &buf[..prefix.len()] == prefix
}

fn infer_http1(buf: &[u8]) -> Verdict {
    if starts_with(buf, b"HTTP/1.") {
        return Verdict::Match(msg_type::RESPONSE);
    }
    for method in HTTP_METHODS {
        if starts_with(buf, method) {
            return Verdict::Match(msg_type::REQUEST);
        }
    }
    Verdict::Indeterminate
}

/// RESP: requests arrive as arrays, replies as simple/bulk/error/int.
fn infer_redis(buf: &[u8]) -> Verdict {
    match buf.first() {
        Some(b'*') => Verdict::Match(msg_type::REQUEST),
        Some(b'+') | Some(b'-') | Some(b':') | Some(b'$') => Verdict::Match(msg_type::RESPONSE),
        _ => Verdict::Indeterminate,
    }
}

fn infer_dubbo(buf: &[u8]) -> Verdict {
    if buf.len() < 16 || buf[0] != 0xda || buf[1] != 0xbb {
        return Verdict::Indeterminate;
    }
    if buf[2] & 0x80 != 0 {
        Verdict::Match(msg_type::REQUEST)
    } else {
        Verdict::Match(msg_type::RESPONSE)
    }
}

/// DNS header sanity over port 53 traffic.
fn infer_dns(buf: &[u8], conn: &ConnInfo) -> Verdict {
    if conn.tuple.dport != 53 && conn.tuple.num != 53 {
        return Verdict::Indeterminate;
    }
    if buf.len() < 12 {
        return Verdict::Indeterminate;
    }
    let opcode = (buf[2] >> 3) & 0x0f;
    let qdcount = u16::from_be_bytes([buf[4], buf[5]]);
    if opcode > 5 || qdcount == 0 || qdcount > 8 {
        return Verdict::Indeterminate;
    }
    if buf[2] & 0x80 == 0 {
        Verdict::Match(msg_type::REQUEST)
    } else {
        Verdict::Match(msg_type::RESPONSE)
    }
}

#[inline(always)]
fn mysql_header_len(header: &[u8; PREV_DATA_SIZE]) -> u32 {
    u32::from_le_bytes([header[0], header[1], header[2], 0])
}

/// MySQL packets: 3-byte little-endian length, 1-byte sequence, body.
/// The header and body usually arrive in separate reads; the header is
/// prestored and the body classified against it. `COM_QUIT` tears the
/// connection down.
fn infer_mysql(buf: &[u8], count: usize, conn: &mut ConnInfo) -> Verdict {
    if conn.prev_count as usize == PREV_DATA_SIZE {
        let len = mysql_header_len(&conn.prev_buf);
        if len == 0 || len as usize != count {
            return Verdict::Indeterminate;
        }
        let seq = conn.prev_buf[3];
        if seq == 0 {
            let command = buf.first().copied().unwrap_or(0);
            if command == 0x01 && len == 1 {
                return Verdict::Match(msg_type::CLEAR);
            }
            if (0x01..=0x1f).contains(&command) {
                return Verdict::Match(msg_type::REQUEST);
            }
            return Verdict::Indeterminate;
        }
        return Verdict::Match(msg_type::RESPONSE);
    }

    // Header and body in one read.
    if buf.len() < 5 {
        return Verdict::Indeterminate;
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], 0]);
    if len == 0 || len as usize + 4 != count {
        return Verdict::Indeterminate;
    }
    let seq = buf[3];
    let command = buf[4];
    if seq == 0 {
        if command == 0x01 && len == 1 {
            return Verdict::Match(msg_type::CLEAR);
        }
        if (0x01..=0x1f).contains(&command) {
            return Verdict::Match(msg_type::REQUEST);
        }
        return Verdict::Indeterminate;
    }
    Verdict::Match(msg_type::RESPONSE)
}

/// Kafka framing: `size, api_key, api_version, correlation_id` on
/// requests; `size, correlation_id` on responses. A first sighting is
/// tentative (RECONFIRM) until the correlation id round-trips.
fn infer_kafka(buf: &[u8], count: usize, conn: &mut ConnInfo) -> Verdict {
    if buf.len() < 12 {
        return Verdict::Indeterminate;
    }
    let size = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if conn.pinned_proto == l7_proto::KAFKA && conn.need_reconfirm {
        let correlation = i32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if correlation == conn.correlation_id && conn.correlation_id >= 0 {
            conn.need_reconfirm = false;
            return Verdict::Match(msg_type::RESPONSE);
        }
    }

    let api_key = u16::from_be_bytes([buf[4], buf[5]]);
    let api_version = u16::from_be_bytes([buf[6], buf[7]]);
    let correlation = i32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
    if size + 4 == count && api_key <= 67 && api_version <= 20 && correlation >= 0 {
        conn.correlation_id = correlation;
        if conn.pinned_proto == l7_proto::KAFKA && conn.need_reconfirm {
            // Second request-shaped message on the same socket: accept.
            conn.need_reconfirm = false;
            return Verdict::Match(msg_type::REQUEST);
        }
        conn.need_reconfirm = true;
        return Verdict::Match(msg_type::RECONFIRM);
    }
    Verdict::Indeterminate
}

#[inline(always)]
fn role_for(direction: u8, msg: u8) -> u8 {
    match (direction, msg) {
        (direction::INGRESS, msg_type::REQUEST) => role::SERVER,
        (direction::EGRESS, msg_type::REQUEST) => role::CLIENT,
        (direction::INGRESS, msg_type::RESPONSE) => role::CLIENT,
        (direction::EGRESS, msg_type::RESPONSE) => role::SERVER,
        _ => role::UNKNOWN,
    }
}

fn run(proto: u8, buf: &[u8], count: usize, conn: &mut ConnInfo) -> Verdict {
    match proto {
        l7_proto::HTTP1 => infer_http1(buf),
        l7_proto::REDIS => infer_redis(buf),
        l7_proto::DUBBO => infer_dubbo(buf),
        l7_proto::DNS => infer_dns(buf, conn),
        l7_proto::MYSQL => infer_mysql(buf, count, conn),
        l7_proto::KAFKA => infer_kafka(buf, count, conn),
        _ => Verdict::Indeterminate,
    }
}

/// Classify one payload. `buf` is the bounded prefix actually read;
/// `count` the full syscall byte count. The connection context carries
/// the pinned protocol, stashed prestore bytes and the reconfirm state
/// from the socket entry, and is updated in place.
pub fn infer_protocol(
    buf: &[u8],
    count: usize,
    conn: &mut ConnInfo,
    sk_type: u16,
    _extra: &ProcessDataExtra,
) -> ProtocolMessage {
    if count == 0 || buf.is_empty() {
        return UNKNOWN_MESSAGE;
    }

    // A bare 4-byte read on a stream socket is a framing header for the
    // two-read protocols: stash it and wait for the body.
    if sk_type == SOCK_STREAM
        && count == PREV_DATA_SIZE
        && conn.prev_count == 0
        && matches!(
            conn.pinned_proto,
            l7_proto::UNKNOWN | l7_proto::MYSQL | l7_proto::KAFKA
        )
        && buf.len() >= PREV_DATA_SIZE
    {
        conn.prev_buf.copy_from_slice(&buf[..PREV_DATA_SIZE]);
        conn.prev_count = PREV_DATA_SIZE as u32;
        return ProtocolMessage {
            protocol: conn.pinned_proto,
            msg_type: msg_type::PRESTORE,
        };
    }

    let candidates: &[u8] = if conn.pinned_proto != l7_proto::UNKNOWN {
        match conn.pinned_proto {
            l7_proto::HTTP1 => &[l7_proto::HTTP1],
            l7_proto::REDIS => &[l7_proto::REDIS],
            l7_proto::DUBBO => &[l7_proto::DUBBO],
            l7_proto::DNS => &[l7_proto::DNS],
            l7_proto::MYSQL => &[l7_proto::MYSQL],
            l7_proto::KAFKA => &[l7_proto::KAFKA],
            _ => &[],
        }
    } else if sk_type == SOCK_DGRAM {
        &[l7_proto::DNS]
    } else if conn.prev_count != 0 {
        // Stashed header: only the two-read protocols apply.
        &[l7_proto::MYSQL, l7_proto::KAFKA]
    } else {
        &[
            l7_proto::HTTP1,
            l7_proto::REDIS,
            l7_proto::DUBBO,
            l7_proto::DNS,
            l7_proto::MYSQL,
            l7_proto::KAFKA,
        ]
    };

    for &proto in candidates {
        if let Verdict::Match(msg) = run(proto, buf, count, conn) {
            if conn.role == role::UNKNOWN {
                conn.role = role_for(conn.direction, msg);
            }
            return ProtocolMessage {
                protocol: proto,
                msg_type: msg,
            };
        }
    }

    UNKNOWN_MESSAGE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(dir: u8) -> ConnInfo {
        let mut c = ConnInfo::new(3);
        c.direction = dir;
        c.sk_type = SOCK_STREAM;
        c.tuple.l4_protocol = IPPROTO_TCP;
        c
    }

    fn classify(buf: &[u8], conn: &mut ConnInfo) -> ProtocolMessage {
        let extra = ProcessDataExtra::default();
        let sk_type = conn.sk_type;
        infer_protocol(buf, buf.len(), conn, sk_type, &extra)
    }

    #[test]
    fn http1_request_and_response() {
        let mut c = conn(direction::EGRESS);
        let req = classify(b"GET / HTTP/1.1\r\nHost:x\r\n\r\n", &mut c);
        assert_eq!(req.protocol, l7_proto::HTTP1);
        assert_eq!(req.msg_type, msg_type::REQUEST);
        assert_eq!(c.role, role::CLIENT);

        let mut c = conn(direction::INGRESS);
        let rsp = classify(b"HTTP/1.1 200 OK\r\n\r\n", &mut c);
        assert_eq!(rsp.protocol, l7_proto::HTTP1);
        assert_eq!(rsp.msg_type, msg_type::RESPONSE);
    }

    #[test]
    fn redis_frames() {
        let mut c = conn(direction::EGRESS);
        let req = classify(b"*1\r\n$4\r\nPING\r\n", &mut c);
        assert_eq!(req.protocol, l7_proto::REDIS);
        assert_eq!(req.msg_type, msg_type::REQUEST);

        let mut c = conn(direction::INGRESS);
        let rsp = classify(b"+PONG\r\n", &mut c);
        assert_eq!(rsp.msg_type, msg_type::RESPONSE);
    }

    #[test]
    fn dns_over_udp() {
        // 28-byte query, 44-byte reply, as a resolver would send them.
        let mut query = vec![0x12, 0x34, 0x01, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
        query.extend_from_slice(b"\x03www\x06tested\x00\x00\x01\x00\x01");
        assert_eq!(query.len(), 28);

        let mut c = conn(direction::EGRESS);
        c.sk_type = SOCK_DGRAM;
        c.tuple.l4_protocol = IPPROTO_UDP;
        c.tuple.dport = 53;
        let req = classify(&query, &mut c);
        assert_eq!(req.protocol, l7_proto::DNS);
        assert_eq!(req.msg_type, msg_type::REQUEST);

        let mut reply = query.clone();
        reply[2] = 0x81; // qr=1
        reply.extend_from_slice(&[0u8; 16]);
        assert_eq!(reply.len(), 44);
        let mut c = conn(direction::INGRESS);
        c.sk_type = SOCK_DGRAM;
        c.tuple.l4_protocol = IPPROTO_UDP;
        c.tuple.dport = 53;
        let rsp = classify(&reply, &mut c);
        assert_eq!(rsp.protocol, l7_proto::DNS);
        assert_eq!(rsp.msg_type, msg_type::RESPONSE);
    }

    #[test]
    fn mysql_two_read_classification() {
        let mut c = conn(direction::INGRESS);
        // First read: the 4-byte packet header gets stashed.
        let header = [0x21, 0x00, 0x00, 0x00];
        let first = classify(&header, &mut c);
        assert_eq!(first.msg_type, msg_type::PRESTORE);
        assert_eq!(c.prev_count, 4);
        assert_eq!(c.prev_buf, header);

        // Second read: a 0x21-byte COM_QUERY body.
        let mut body = vec![0x03];
        body.extend_from_slice(b"select user,host from mysql.user");
        assert_eq!(body.len(), 0x21);
        let second = classify(&body, &mut c);
        assert_eq!(second.protocol, l7_proto::MYSQL);
        assert_eq!(second.msg_type, msg_type::REQUEST);
    }

    #[test]
    fn mysql_quit_clears_the_connection() {
        let mut c = conn(direction::EGRESS);
        c.pinned_proto = l7_proto::MYSQL;
        c.prev_buf = [0x01, 0x00, 0x00, 0x00];
        c.prev_count = 4;
        let quit = classify(&[0x01], &mut c);
        assert_eq!(quit.protocol, l7_proto::MYSQL);
        assert_eq!(quit.msg_type, msg_type::CLEAR);
    }

    #[test]
    fn dubbo_magic() {
        let mut frame = vec![0xda, 0xbb, 0xc2, 0x00];
        frame.extend_from_slice(&[0u8; 16]);
        let mut c = conn(direction::EGRESS);
        let req = classify(&frame, &mut c);
        assert_eq!(req.protocol, l7_proto::DUBBO);
        assert_eq!(req.msg_type, msg_type::REQUEST);
    }

    #[test]
    fn kafka_reconfirms_until_the_correlation_id_round_trips() {
        // Request: size=20, api_key=0 (Produce), v7, correlation=55.
        let mut request = vec![0, 0, 0, 20, 0, 0, 0, 7, 0, 0, 0, 55];
        request.extend_from_slice(&[0u8; 12]);
        let mut c = conn(direction::EGRESS);
        let first = classify(&request, &mut c);
        assert_eq!(first.protocol, l7_proto::KAFKA);
        assert_eq!(first.msg_type, msg_type::RECONFIRM);
        assert!(c.need_reconfirm);
        assert_eq!(c.correlation_id, 55);

        // Response carrying the same correlation id confirms.
        let mut c2 = conn(direction::INGRESS);
        c2.pinned_proto = l7_proto::KAFKA;
        c2.need_reconfirm = true;
        c2.correlation_id = 55;
        let response = vec![0, 0, 0, 8, 0, 0, 0, 55, 0, 0, 0, 0];
        let second = classify(&response, &mut c2);
        assert_eq!(second.msg_type, msg_type::RESPONSE);
        assert!(!c2.need_reconfirm);
    }

    #[test]
    fn pinned_protocol_short_circuits() {
        let mut c = conn(direction::INGRESS);
        c.pinned_proto = l7_proto::HTTP1;
        // Redis-shaped bytes on an HTTP socket stay unknown.
        let out = classify(b"+PONG\r\n", &mut c);
        assert_eq!(out, UNKNOWN_MESSAGE);
    }

    #[test]
    fn opaque_body_reads_stay_unknown() {
        let mut c = conn(direction::INGRESS);
        c.pinned_proto = l7_proto::HTTP1;
        let out = classify(&[0u8; 64], &mut c);
        assert_eq!(out, UNKNOWN_MESSAGE);
    }
}
