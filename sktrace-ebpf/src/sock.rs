//! Socket resolution, connection classification and structure-offset
//! inference.
//!
//! Kernel struct layouts move between versions, so every field the
//! probes need is reached either through a fixed well-known offset or
//! through the per-CPU [`MemberOffsets`] record that the inference
//! pass fills in. All pointer chasing goes through the fallible typed
//! read helpers in `program`.

use aya_ebpf::helpers::bpf_get_current_task;
use sktrace_common::*;

use crate::program::{read_kernel, read_kernel_ptr};

// Fixed offsets inside structs whose layout has been stable across the
// supported kernel range.
const FILES_STRUCT_FDT_OFFSET: usize = 0x20;
const FDTABLE_FD_OFFSET: usize = 0x08;
const FILE_PRIVATE_DATA_OFFSET: usize = 0xc8;

// struct sock_common layout.
const SKC_DADDR_OFFSET: usize = 0x00;
const SKC_RCV_SADDR_OFFSET: usize = 0x04;
const SKC_DPORT_OFFSET: usize = 0x0c;
const SKC_NUM_OFFSET: usize = 0x0e;
const SKC_FAMILY_OFFSET: usize = 0x10;
const SKC_STATE_OFFSET: usize = 0x12;
const SKC_FLAGS_OFFSET: usize = 0x13;
const SKC_V6_DADDR_OFFSET: usize = 0x38;
const SKC_V6_RCV_SADDR_OFFSET: usize = 0x48;

/// Candidate offsets of `task_struct.files` across known layouts.
const TASK_FILES_OFFSETS: [u32; 51] = [
    0x790, 0xa80, 0xa88, 0xa90, 0xa98, 0xaa0, 0xaa8, 0xab0, 0xab8, 0xac0, //
    0xac8, 0xad0, 0xad8, 0xae0, 0xae8, 0xaf0, 0xaf8, 0xb00, 0xb08, 0xb10, //
    0xb18, 0xb20, 0xb28, 0xb48, 0xb50, 0xb58, 0xb60, 0xb68, 0xb70, 0xb78, //
    0xb80, 0xb88, 0xb90, 0xb98, 0xba0, 0xba8, 0xbb0, 0xbb8, 0xbc0, 0xbc8, //
    0xbd0, 0xbd8, 0xbe0, 0xbe8, 0xbf0, 0xbf8, 0xc00, 0xc08, 0xc10, 0xc18, //
    0xcc8,
];

/// Candidate offsets of the `sock` flags word carrying
/// `{padding, kern_sock, .., protocol, type}`.
const SOCK_FLAGS_OFFSETS: [u32; 6] = [0x1f0, 0x1f8, 0x200, 0x208, 0x210, 0x218];

/// Candidate offsets of `tcp_sock.copied_seq`.
const TCP_COPIED_SEQ_OFFSETS: [u32; 19] = [
    0x514, 0x51c, 0x524, 0x52c, 0x534, 0x53c, 0x544, 0x54c, 0x554, 0x55c, //
    0x564, 0x56c, 0x574, 0x57c, 0x584, 0x58c, 0x594, 0x59c, 0x5dc,
];

/// Candidate offsets of `tcp_sock.write_seq`.
const TCP_WRITE_SEQ_OFFSETS: [u32; 24] = [
    0x66c, 0x674, 0x67c, 0x684, 0x68c, 0x694, 0x69c, 0x6a4, 0x6ac, 0x6b4, //
    0x6bc, 0x6c4, 0x6cc, 0x6d4, 0x6dc, 0x6e4, 0x6ec, 0x6f4, 0x6fc, 0x704, //
    0x70c, 0x714, 0x71c, 0x74c,
];

/// `struct socket` as laid out before the 5.3 `wq` removal. On newer
/// kernels every pointer shifts up one slot, which the back-pointer
/// check below exploits: whichever slot equals the owning `file`
/// decides where `sk` lives.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct KSocket {
    state: u32,
    kind: u16,
    _pad: u16,
    flags: u64,
    wq: usize,
    file: usize,
    sk: usize,
}

#[inline(always)]
fn socket_file_addr(task: usize, fd: i32, files_offset: u32) -> Option<usize> {
    let files = read_kernel_ptr(task + files_offset as usize)?;
    let fdt = read_kernel_ptr(files + FILES_STRUCT_FDT_OFFSET)?;
    let fd_array = read_kernel_ptr(fdt + FDTABLE_FD_OFFSET)?;
    read_kernel_ptr(fd_array + (fd as usize) * 8)
}

/// Validate the `file -> private_data -> socket` chain and return the
/// `sock` pointer. The socket's back-pointer must equal the file (in
/// either slot) and its type must be STREAM or DGRAM.
#[inline(always)]
fn sock_from_file(file: usize) -> Option<(usize, u16)> {
    let private_data = read_kernel_ptr(file + FILE_PRIVATE_DATA_OFFSET)?;
    let socket = read_kernel::<KSocket>(private_data as *const KSocket)?;

    let (check_file, sk) = if socket.file == file {
        (socket.file, socket.sk)
    } else {
        // Kernel >= 5.3 dropped `wq`; the old slots now hold
        // file and sk one position earlier.
        (socket.wq, socket.file)
    };

    if (socket.kind == SOCK_STREAM || socket.kind == SOCK_DGRAM) && check_file == file && sk != 0 {
        Some((sk, socket.kind))
    } else {
        None
    }
}

/// Resolve an fd to its `sock` pointer through the already-inferred
/// `task_struct.files` offset.
#[inline(always)]
pub fn get_socket_from_fd(fd: i32, offsets: &MemberOffsets) -> Option<usize> {
    if fd < 0 || offsets.task_files == 0 {
        return None;
    }
    let task = bpf_get_current_task() as usize;
    let file = socket_file_addr(task, fd, offsets.task_files)?;
    Some(sock_from_file(file)?.0)
}

/// Discovery variant: walk the candidate table until the structural
/// predicate holds, recording the winning offset.
#[inline(always)]
pub fn infer_socket_from_fd(fd: i32, offsets: &mut MemberOffsets) -> Option<usize> {
    if offsets.task_files != 0 {
        return get_socket_from_fd(fd, offsets);
    }

    let task = bpf_get_current_task() as usize;
    for candidate in TASK_FILES_OFFSETS {
        if let Some(file) = socket_file_addr(task, fd, candidate) {
            if let Some((sk, _)) = sock_from_file(file) {
                offsets.task_files = candidate;
                return Some(sk);
            }
        }
    }
    None
}

/// The `sock` flags word decodes as
/// `{padding:1, kern_sock:1, no_check:2, userlocks:4, protocol:8, type:16}`.
/// Freshly allocated socks are zeroed, so `padding == 0` and
/// `kern_sock == 0` with a sane type pin the offset.
pub fn infer_sock_flags(sk: usize, offsets: &mut MemberOffsets) {
    for candidate in SOCK_FLAGS_OFFSETS {
        if let Some(flags) = read_kernel::<u32>((sk + candidate as usize) as *const u32) {
            let padding = flags & 1;
            let kern_sock = (flags >> 1) & 1;
            let sk_type = (flags >> 16) as u16;
            if (sk_type == SOCK_STREAM || sk_type == SOCK_DGRAM) && kern_sock == 0 && padding == 0 {
                offsets.sock_flags = candidate;
                return;
            }
        }
    }
}

#[inline(always)]
fn check_copied_seq(sk: usize, offset: u32) -> Option<u32> {
    // Neighbourhood inside tcp_sock:
    //   u16 tcp_header_len;   -28
    //   u32 rcv_nxt;          -4
    //   u32 copied_seq;        0
    //   u32 rcv_wup;          +4
    //   u32 snd_nxt;          +8
    let off = offset as usize;
    let copied_seq = read_kernel::<u32>((sk + off) as *const u32)?;
    let rcv_nxt = read_kernel::<u32>((sk + off - 4) as *const u32)?;
    let rcv_wup = read_kernel::<u32>((sk + off + 4) as *const u32)?;
    let tcp_header_len = read_kernel::<u16>((sk + off - 28) as *const u16)?;

    if !(20..=60).contains(&tcp_header_len) || copied_seq == 0 {
        return None;
    }
    if copied_seq == rcv_nxt && rcv_wup == rcv_nxt {
        Some(copied_seq)
    } else {
        None
    }
}

#[inline(always)]
fn check_write_seq(sk: usize, offset: u32, snd_nxt_offset: u32) -> Option<u32> {
    let write_seq = read_kernel::<u32>((sk + offset as usize) as *const u32)?;
    let snd_nxt = read_kernel::<u32>((sk + snd_nxt_offset as usize) as *const u32)?;
    if snd_nxt == write_seq && snd_nxt != 0 && write_seq != 0 {
        Some(write_seq)
    } else {
        None
    }
}

/// Locate `tcp_sock.copied_seq` and `tcp_sock.write_seq` on an
/// established loopback connection driven by the inference server.
pub fn infer_tcp_seq_offsets(sk: usize, offsets: &mut MemberOffsets) {
    if offsets.tcp_copied_seq == 0 {
        for candidate in TCP_COPIED_SEQ_OFFSETS {
            if check_copied_seq(sk, candidate).is_some() {
                offsets.tcp_copied_seq = candidate;
                break;
            }
        }
    }

    if offsets.tcp_copied_seq == 0 {
        return;
    }
    let snd_nxt_offset = offsets.tcp_copied_seq + 8;

    if offsets.tcp_write_seq == 0 {
        for candidate in TCP_WRITE_SEQ_OFFSETS {
            if check_write_seq(sk, candidate, snd_nxt_offset).is_some() {
                offsets.tcp_write_seq = candidate;
                break;
            }
        }
    }
}

/// Classification result for one socket.
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum SockCheck {
    Drop,
    Udp,
    TcpEstablished,
}

/// Decide whether the socket carries observable TCP/UDP data and
/// normalize the address family. PF_INET6 sockets without the
/// v6-only bit are v4-mapped and treated as PF_INET.
pub fn check_sock_kind(sk: usize, offsets: &MemberOffsets, conn: &mut ConnInfo) -> SockCheck {
    let Some(family) = read_kernel::<u16>((sk + SKC_FAMILY_OFFSET) as *const u16) else {
        return SockCheck::Drop;
    };
    let Some(skc_flags) = read_kernel::<u8>((sk + SKC_FLAGS_OFFSET) as *const u8) else {
        return SockCheck::Drop;
    };
    let ipv6only = (skc_flags >> 5) & 1;

    conn.skc_family = match family {
        PF_INET => PF_INET,
        PF_INET6 if ipv6only == 0 => PF_INET,
        PF_INET6 => PF_INET6,
        _ => return SockCheck::Drop,
    };

    let Some(flags) = read_kernel::<u32>((sk + offsets.sock_flags as usize) as *const u32) else {
        return SockCheck::Drop;
    };
    conn.sk_type = (flags >> 16) as u16;

    if conn.sk_type == SOCK_DGRAM {
        conn.tuple.l4_protocol = IPPROTO_UDP;
        return SockCheck::Udp;
    }
    if conn.sk_type != SOCK_STREAM {
        return SockCheck::Drop;
    }

    let Some(state) = read_kernel::<u8>((sk + SKC_STATE_OFFSET) as *const u8) else {
        return SockCheck::Drop;
    };
    if state != TCP_ESTABLISHED && state != TCP_CLOSE_WAIT {
        return SockCheck::Drop;
    }

    conn.tuple.l4_protocol = IPPROTO_TCP;
    SockCheck::TcpEstablished
}

/// Fill the port pair. The destination port is stored in network
/// order and converted here; the source port already is host order.
pub fn init_conn_ports(sk: usize, conn: &mut ConnInfo) {
    if let Some(dport) = read_kernel::<u16>((sk + SKC_DPORT_OFFSET) as *const u16) {
        conn.tuple.dport = u16::from_be(dport);
    }
    if let Some(sport) = read_kernel::<u16>((sk + SKC_NUM_OFFSET) as *const u16) {
        conn.tuple.num = sport;
    }
}

/// Read the address pair into a record's tuple fields.
pub fn read_sock_addrs(sk: usize, family: u16) -> Option<([u8; 16], [u8; 16], u8)> {
    let mut saddr = [0u8; 16];
    let mut daddr = [0u8; 16];
    match family {
        PF_INET => {
            let s = read_kernel::<[u8; 4]>((sk + SKC_RCV_SADDR_OFFSET) as *const [u8; 4])?;
            let d = read_kernel::<[u8; 4]>((sk + SKC_DADDR_OFFSET) as *const [u8; 4])?;
            saddr[..4].copy_from_slice(&s);
            daddr[..4].copy_from_slice(&d);
            Some((daddr, saddr, 4))
        }
        PF_INET6 => {
            let s = read_kernel::<[u8; 16]>((sk + SKC_V6_RCV_SADDR_OFFSET) as *const [u8; 16])?;
            let d = read_kernel::<[u8; 16]>((sk + SKC_V6_DADDR_OFFSET) as *const [u8; 16])?;
            saddr.copy_from_slice(&s);
            daddr.copy_from_slice(&d);
            Some((daddr, saddr, 16))
        }
        _ => None,
    }
}

/// Post-syscall TCP sequence for the given direction.
pub fn tcp_seq_for(sk: usize, offsets: &MemberOffsets, dir: u8) -> u32 {
    let offset = if dir == direction::INGRESS {
        offsets.tcp_copied_seq
    } else {
        offsets.tcp_write_seq
    };
    if offset == 0 {
        return 0;
    }
    read_kernel::<u32>((sk + offset as usize) as *const u32).unwrap_or(0)
}
