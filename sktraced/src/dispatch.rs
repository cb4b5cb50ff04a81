//! Perf-ring reader and hashed dispatch.
//!
//! One reader task per CPU drains the shared ring. Socket-data frames
//! are batch envelopes: all records of a batch are copied into one
//! heap block, wrapped into per-record work items and pushed onto the
//! worker queue selected by the first record's socket id, so the block
//! is owned by exactly one consumer thread and freed when its last
//! record (`is_last`) is dropped. Frames in the extra-event range are
//! routed through the registry, hashed by event type. The reader never
//! blocks: a full queue counts a loss and drops.

use crate::boot_time::BootTimeSync;
use crate::events::{ExtraEventRegistry, ExtraHandler, ProcessEventThread, ProcessNotice};
use crate::stats::TracerStats;
use aya::maps::perf::PerfEventArrayBuffer;
use aya::maps::MapData;
use bytes::BytesMut;
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{error, warn};
use sktrace_common::batch::BatchView;
use sktrace_common::{
    boot_to_epoch_us, Tuple, COMM_LEN, EVENT_TYPE_MIN, EVENT_TYPE_PROC_EXEC, EVENT_TYPE_PROC_EXIT,
};
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use tokio::io::unix::AsyncFd;

/// Callback receiving every captured message.
pub type L7Handler = Arc<dyn Fn(CapturedData) + Send + Sync>;

/// Payload window of one record, borrowing the batch's shared block.
#[derive(Clone)]
pub struct PayloadSlice {
    block: Arc<Vec<u8>>,
    offset: usize,
    len: usize,
    /// Final record of its batch; dropping it releases the block.
    pub is_last: bool,
}

impl PayloadSlice {
    pub fn as_bytes(&self) -> &[u8] {
        &self.block[self.offset..self.offset + self.len]
    }
}

impl std::ops::Deref for PayloadSlice {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_bytes()
    }
}

/// One captured message as handed to the consumer. The payload starts
/// with the stashed prestore bytes when `extra_data_count` was set.
#[derive(Clone)]
pub struct CapturedData {
    pub process_id: u32,
    pub thread_id: u32,
    pub coroutine_id: u64,
    pub socket_id: u64,
    pub capture_seq: u64,
    /// Microseconds since the Unix epoch.
    pub timestamp_us: u64,
    pub direction: u8,
    pub msg_type: u8,
    pub protocol: u8,
    pub need_reconfirm: bool,
    pub tuple: Tuple,
    pub syscall_len: u64,
    pub tcp_seq: u32,
    pub thread_trace_id: u64,
    pub process_name: [u8; COMM_LEN],
    pub payload: PayloadSlice,
}

impl CapturedData {
    pub fn process_name_str(&self) -> &str {
        std::str::from_utf8(&self.process_name)
            .unwrap_or("")
            .trim_end_matches('\0')
    }
}

enum WorkItem {
    Socket(CapturedData),
    Extra { handler: ExtraHandler, payload: Box<[u8]> },
}

/// Protocol re-confirmation by the consumer is not implemented yet;
/// tentative packets are dropped in the kernel instead.
fn need_proto_reconfirm(_protocol: u8) -> bool {
    false
}

/// splitmix64 finalizer; spreads socket ids over the queues.
#[inline]
fn mix64(mut x: u64) -> u64 {
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

pub struct Dispatcher {
    senders: Vec<Sender<WorkItem>>,
    stats: Arc<TracerStats>,
    registry: Arc<ExtraEventRegistry>,
    proc_events: ProcessEventThread,
    boot: Arc<BootTimeSync>,
    _workers: Vec<thread::JoinHandle<()>>,
}

impl Dispatcher {
    pub fn new(
        worker_threads: usize,
        queue_size: usize,
        handler: L7Handler,
        stats: Arc<TracerStats>,
        registry: Arc<ExtraEventRegistry>,
        boot: Arc<BootTimeSync>,
    ) -> Self {
        assert!(worker_threads > 0);
        let mut senders = Vec::with_capacity(worker_threads);
        let mut workers = Vec::with_capacity(worker_threads);
        for index in 0..worker_threads {
            let (tx, rx) = bounded::<WorkItem>(queue_size);
            senders.push(tx);
            workers.push(Self::spawn_worker(index, rx, handler.clone(), stats.clone()));
        }
        Self {
            senders,
            stats,
            registry,
            proc_events: ProcessEventThread::spawn(),
            boot,
            _workers: workers,
        }
    }

    fn spawn_worker(
        index: usize,
        receiver: Receiver<WorkItem>,
        handler: L7Handler,
        stats: Arc<TracerStats>,
    ) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name(format!("sk-worker-{index}"))
            .spawn(move || {
                while let Ok(item) = receiver.recv() {
                    stats.queue(index).dequeue_nr.fetch_add(1, Ordering::Relaxed);
                    match item {
                        WorkItem::Socket(data) => handler(data),
                        WorkItem::Extra { handler, payload } => handler(&payload),
                    }
                }
            })
            .expect("spawn dispatch worker")
    }

    pub fn stats(&self) -> &Arc<TracerStats> {
        &self.stats
    }

    pub fn registry(&self) -> &Arc<ExtraEventRegistry> {
        &self.registry
    }

    /// Route one raw perf frame.
    pub fn dispatch_frame(&self, raw: &[u8]) {
        if raw.len() < 4 {
            return;
        }
        let event_type = u32::from_le_bytes(raw[0..4].try_into().unwrap());
        if event_type == 0 {
            return;
        }

        if event_type >= EVENT_TYPE_MIN {
            self.dispatch_extra(event_type, raw);
            return;
        }

        self.dispatch_socket_batch(raw);
    }

    fn dispatch_extra(&self, event_type: u32, raw: &[u8]) {
        if event_type == EVENT_TYPE_PROC_EXEC || event_type == EVENT_TYPE_PROC_EXIT {
            if let Some(notice) = ProcessNotice::parse(raw) {
                self.proc_events.notify(notice);
            }
        }

        let Some(handler) = self.registry.lookup(event_type) else {
            return;
        };

        let q_idx = (mix64(event_type as u64) % self.senders.len() as u64) as usize;
        let queue = self.stats.queue(q_idx);
        let item = WorkItem::Extra {
            handler,
            payload: raw.to_vec().into_boxed_slice(),
        };
        if self.senders[q_idx].try_send(item).is_ok() {
            queue.enqueue_nr.fetch_add(1, Ordering::Relaxed);
        } else {
            queue.enqueue_lost.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn dispatch_socket_batch(&self, raw: &[u8]) {
        let Some(view) = BatchView::parse(raw) else {
            warn!("malformed socket-data envelope ({} bytes)", raw.len());
            return;
        };

        let records: Vec<_> = view.records().collect();
        if records.is_empty() {
            return;
        }

        // The whole batch lands on one queue, chosen by the first
        // record, so one consumer owns the shared block.
        let q_idx = (mix64(records[0].header.socket_id) % self.senders.len() as u64) as usize;
        let queue = self.stats.queue(q_idx);

        // One allocation per burst: every record's (extra-prefix +
        // payload) window packed back to back.
        let total: usize = records
            .iter()
            .map(|r| r.payload.len() + if r.header.extra_data_count > 0 { 4 } else { 0 })
            .sum();
        let mut block = Vec::with_capacity(total);
        let mut ranges = Vec::with_capacity(records.len());
        for r in &records {
            let start = block.len();
            if r.header.extra_data_count > 0 {
                block.extend_from_slice(&r.header.extra_data.to_le_bytes());
            }
            block.extend_from_slice(r.payload);
            ranges.push((start, block.len() - start));
        }
        let block = Arc::new(block);

        let boot_ns = self.boot.boot_ns();
        let last = records.len() - 1;
        for (i, r) in records.iter().enumerate() {
            let h = &r.header;
            let extra = if h.extra_data_count > 0 { 4u64 } else { 0 };
            self.stats.count_protocol(h.data_type as u8);

            let data = CapturedData {
                process_id: h.tgid,
                thread_id: h.pid,
                coroutine_id: h.coroutine_id,
                socket_id: h.socket_id,
                capture_seq: h.data_seq,
                timestamp_us: boot_to_epoch_us(h.timestamp, boot_ns),
                direction: h.direction(),
                msg_type: h.msg_type(),
                protocol: h.data_type as u8,
                need_reconfirm: need_proto_reconfirm(h.data_type as u8),
                tuple: h.tuple,
                syscall_len: h.syscall_len + extra,
                tcp_seq: h.tcp_seq,
                thread_trace_id: h.thread_trace_id,
                process_name: h.comm,
                payload: PayloadSlice {
                    block: block.clone(),
                    offset: ranges[i].0,
                    len: ranges[i].1,
                    is_last: i == last,
                },
            };

            if self.senders[q_idx].try_send(WorkItem::Socket(data)).is_ok() {
                queue.enqueue_nr.fetch_add(1, Ordering::Relaxed);
            } else {
                queue.enqueue_lost.fetch_add(1, Ordering::Relaxed);
            }
        }

        if records.len() > 1 {
            queue.burst_count.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Attach one async reader per CPU buffer. Buffers come pre-opened so
/// the caller controls page count and CPU set.
pub fn start_perf_readers(buffers: Vec<PerfEventArrayBuffer<MapData>>, dispatcher: Arc<Dispatcher>) {
    for buffer in buffers {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            reader_loop(buffer, dispatcher).await;
        });
    }
}

async fn reader_loop(buffer: PerfEventArrayBuffer<MapData>, dispatcher: Arc<Dispatcher>) {
    let mut async_buffer = match AsyncFd::new(buffer) {
        Ok(fd) => fd,
        Err(e) => {
            error!("failed to register perf buffer with the reactor: {e}");
            return;
        }
    };

    const SCRATCH_SLOTS: usize = 16;
    let mut scratch: Vec<BytesMut> = (0..SCRATCH_SLOTS)
        .map(|_| BytesMut::with_capacity(64 * 1024))
        .collect();

    loop {
        let mut ready = match async_buffer.readable_mut().await {
            Ok(guard) => guard,
            Err(e) => {
                warn!("perf buffer wait failed: {e}");
                dispatcher.stats.perf_poll_errors.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
                continue;
            }
        };

        let events = match ready.try_io(|inner| {
            inner
                .get_mut()
                .read_events(scratch.as_mut_slice())
                .map_err(io::Error::other)
        }) {
            Ok(Ok(events)) => events,
            Ok(Err(e)) => {
                ready.clear_ready();
                warn!("perf read_events error: {e}");
                dispatcher.stats.perf_poll_errors.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
                continue;
            }
            Err(_would_block) => {
                ready.clear_ready();
                continue;
            }
        };
        ready.clear_ready();

        if events.lost > 0 {
            dispatcher
                .stats
                .kern_lost
                .fetch_add(events.lost as u64, Ordering::Relaxed);
        }

        for buf in scratch.iter_mut().take(events.read) {
            dispatcher.dispatch_frame(&buf[..]);
            buf.clear();
        }
    }
}
