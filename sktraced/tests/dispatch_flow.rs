//! End-to-end checks of the reader-side dispatch: fabricated batch
//! envelopes go in exactly as the kernel lays them out, and the
//! consumer callback must see correctly split, translated records.

use bytemuck::Zeroable;
use sktrace_common::batch::{append_record, to_frame};
use sktrace_common::{
    direction, l7_proto, msg_type, CaptureRecord, ProcessEvent, SocketDataBuffer,
    EVENT_TYPE_PROC_EXEC,
};
use sktraced::boot_time::BootTimeSync;
use sktraced::dispatch::{CapturedData, Dispatcher, L7Handler};
use sktraced::events::{ExtraEventRegistry, ExtraHandler};
use sktraced::stats::TracerStats;
use std::sync::atomic::{AtomicU64, Ordering};
use crossbeam_channel as channel;
use std::sync::Arc;
use std::time::Duration;

fn record(socket_id: u64, seq: u64, ts: u64) -> CaptureRecord {
    let mut rec = CaptureRecord::zeroed();
    rec.pid = 1001;
    rec.tgid = 1000;
    rec.socket_id = socket_id;
    rec.data_seq = seq;
    rec.timestamp = ts;
    rec.data_type = l7_proto::HTTP1 as u16;
    rec.flags = CaptureRecord::pack_flags(direction::EGRESS, msg_type::REQUEST);
    let mut comm = [0u8; 16];
    comm[..5].copy_from_slice(b"httpd");
    rec.comm = comm;
    rec
}

fn collecting_dispatcher(
    workers: usize,
    queue_size: usize,
) -> (Arc<Dispatcher>, channel::Receiver<CapturedData>, Arc<BootTimeSync>) {
    let (tx, rx) = channel::unbounded();
    let handler: L7Handler = Arc::new(move |data| {
        let _ = tx.send(data);
    });
    let stats = Arc::new(TracerStats::new(workers));
    let registry = Arc::new(ExtraEventRegistry::new());
    let boot = Arc::new(BootTimeSync::new());
    let dispatcher = Arc::new(Dispatcher::new(
        workers,
        queue_size,
        handler,
        stats,
        registry,
        boot.clone(),
    ));
    (dispatcher, rx, boot)
}

#[test]
fn batch_records_are_split_and_translated() {
    let (dispatcher, rx, boot) = collecting_dispatcher(2, 1024);

    let mut buf = SocketDataBuffer::zeroed();
    for seq in 1..=3u64 {
        let mut rec = record(0xfeed, seq, 500_000 + seq);
        rec.syscall_len = 20;
        assert!(append_record(&mut buf, &rec, b"GET / HTTP/1.1\r\n\r\n"));
    }
    dispatcher.dispatch_frame(&to_frame(&buf));

    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(rx.recv_timeout(Duration::from_secs(2)).expect("record"));
    }

    for (i, data) in seen.iter().enumerate() {
        assert_eq!(data.socket_id, 0xfeed);
        assert_eq!(data.capture_seq, i as u64 + 1);
        assert_eq!(data.process_id, 1000);
        assert_eq!(data.thread_id, 1001);
        assert_eq!(data.protocol, l7_proto::HTTP1);
        assert_eq!(data.direction, direction::EGRESS);
        assert_eq!(data.msg_type, msg_type::REQUEST);
        assert_eq!(&data.payload[..], b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(data.process_name_str(), "httpd");
        let expected_us = (data_timestamp(i) + boot.boot_ns()) / 1000;
        assert_eq!(data.timestamp_us, expected_us);
        // Only the batch's final record signals the block release.
        assert_eq!(data.payload.is_last, i == 2);
    }

    // A multi-record batch counts one burst on its queue.
    let stats = dispatcher.stats();
    let total_bursts: u64 = (0..stats.queue_count())
        .map(|i| stats.queue(i).burst_count.load(Ordering::Relaxed))
        .sum();
    assert_eq!(total_bursts, 1);
}

fn data_timestamp(i: usize) -> u64 {
    500_000 + i as u64 + 1
}

#[test]
fn prestored_bytes_are_prefixed_to_the_payload() {
    let (dispatcher, rx, _boot) = collecting_dispatcher(1, 64);

    // The MySQL case: the 4 stashed header bytes ride in extra_data
    // and must come back in front of the body.
    let mut rec = record(0xdb, 1, 700);
    rec.data_type = l7_proto::MYSQL as u16;
    rec.extra_data = u32::from_ne_bytes([0x21, 0x00, 0x00, 0x00]);
    rec.extra_data_count = 4;
    rec.syscall_len = 0x21;

    let mut buf = SocketDataBuffer::zeroed();
    let mut body = vec![0x03u8];
    body.extend_from_slice(b"select 1");
    assert!(append_record(&mut buf, &rec, &body));
    dispatcher.dispatch_frame(&to_frame(&buf));

    let data = rx.recv_timeout(Duration::from_secs(2)).expect("record");
    assert_eq!(&data.payload[..4], &[0x21, 0x00, 0x00, 0x00]);
    assert_eq!(&data.payload[4..5], &[0x03]);
    assert_eq!(data.payload.len(), 4 + body.len());
    // The stashed prefix counts toward the syscall length.
    assert_eq!(data.syscall_len, 0x21 + 4);
}

#[test]
fn full_queue_counts_losses_and_never_blocks() {
    // One worker stuck behind a gate, a 2-slot queue, a 16-record
    // burst: most records must be dropped and counted, not block.
    let (gate_tx, gate_rx) = channel::unbounded::<()>();
    let delivered = Arc::new(AtomicU64::new(0));
    let delivered_in_handler = delivered.clone();
    let handler: L7Handler = Arc::new(move |_data| {
        let _ = gate_rx.recv_timeout(Duration::from_secs(5));
        delivered_in_handler.fetch_add(1, Ordering::SeqCst);
    });

    let stats = Arc::new(TracerStats::new(1));
    let dispatcher = Arc::new(Dispatcher::new(
        1,
        2,
        handler,
        stats.clone(),
        Arc::new(ExtraEventRegistry::new()),
        Arc::new(BootTimeSync::new()),
    ));

    let mut buf = SocketDataBuffer::zeroed();
    for seq in 1..=16u64 {
        assert!(append_record(&mut buf, &record(0xabc, seq, seq), b"x"));
    }
    dispatcher.dispatch_frame(&to_frame(&buf));

    let queue = stats.queue(0);
    let enqueued = queue.enqueue_nr.load(Ordering::SeqCst);
    let lost = queue.enqueue_lost.load(Ordering::SeqCst);
    assert_eq!(enqueued + lost, 16);
    assert!(lost > 0, "a 2-slot queue cannot absorb a 16-record burst");

    // Release the worker; accepted records still drain.
    for _ in 0..enqueued {
        let _ = gate_tx.send(());
    }
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while delivered.load(Ordering::SeqCst) < enqueued && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(delivered.load(Ordering::SeqCst), enqueued);
}

#[test]
fn extra_events_reach_registered_handlers() {
    let stats = Arc::new(TracerStats::new(1));
    let registry = Arc::new(ExtraEventRegistry::new());
    let (seen_tx, seen_rx) = channel::unbounded::<usize>();
    let extra: ExtraHandler = Arc::new(move |payload| {
        let _ = seen_tx.send(payload.len());
    });
    registry.register(EVENT_TYPE_PROC_EXEC, extra).unwrap();

    let handler: L7Handler = Arc::new(|_| panic!("no socket data expected"));
    let dispatcher = Arc::new(Dispatcher::new(
        1,
        64,
        handler,
        stats,
        registry,
        Arc::new(BootTimeSync::new()),
    ));

    let mut event = ProcessEvent::zeroed();
    event.event_type = EVENT_TYPE_PROC_EXEC;
    event.pid = 77;
    event.comm[..4].copy_from_slice(b"bash");
    dispatcher.dispatch_frame(bytemuck::bytes_of(&event));

    let len = seen_rx.recv_timeout(Duration::from_secs(2)).expect("extra event");
    assert_eq!(len, std::mem::size_of::<ProcessEvent>());
}

#[test]
fn malformed_frames_are_ignored() {
    let (dispatcher, rx, _boot) = collecting_dispatcher(1, 16);

    dispatcher.dispatch_frame(&[]);
    dispatcher.dispatch_frame(&[0, 0, 0, 0]);
    // events_num above the burst limit is rejected outright.
    let mut bogus = vec![0u8; 64];
    bogus[0] = 31;
    dispatcher.dispatch_frame(&bogus);

    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
}
