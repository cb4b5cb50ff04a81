//! Extra-event registry.
//!
//! Raw frames whose leading u32 is at or above `EVENT_TYPE_MIN` are
//! not socket data; they carry registered events (process exec/exit
//! today). Handlers are dispatched through the same hashed worker
//! queues as socket data, keyed by event type.

use crossbeam_channel::{bounded, Sender};
use dashmap::DashMap;
use log::{debug, warn};
use sktrace_common::{ProcessEvent, COMM_LEN, EVENT_TYPE_MIN, EVENT_TYPE_PROC_EXEC, EVENT_TYPE_PROC_EXIT};
use std::sync::Arc;
use std::thread;

pub type ExtraHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

#[derive(Default)]
pub struct ExtraEventRegistry {
    handlers: DashMap<u32, ExtraHandler>,
}

impl ExtraEventRegistry {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// Register a handler for one event-type bit.
    pub fn register(&self, event_type: u32, handler: ExtraHandler) -> anyhow::Result<()> {
        if event_type < EVENT_TYPE_MIN {
            anyhow::bail!("event type {event_type:#x} is inside the socket-data range");
        }
        self.handlers.insert(event_type, handler);
        Ok(())
    }

    /// Find the handler whose registered bit intersects the type.
    pub fn lookup(&self, event_type: u32) -> Option<ExtraHandler> {
        self.handlers
            .iter()
            .find(|entry| entry.key() & event_type != 0)
            .map(|entry| entry.value().clone())
    }
}

/// Decoded process exec/exit notification.
#[derive(Debug, Clone, Copy)]
pub struct ProcessNotice {
    pub event_type: u32,
    pub pid: u32,
    pub comm: [u8; COMM_LEN],
}

impl ProcessNotice {
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < std::mem::size_of::<ProcessEvent>() {
            return None;
        }
        let event: ProcessEvent =
            unsafe { std::ptr::read_unaligned(raw.as_ptr() as *const ProcessEvent) };
        Some(Self {
            event_type: event.event_type,
            pid: event.pid,
            comm: event.comm,
        })
    }

    pub fn comm_str(&self) -> &str {
        std::str::from_utf8(&self.comm)
            .unwrap_or("")
            .trim_end_matches('\0')
    }
}

/// Dedicated consumer for the built-in exec/exit stream; probe
/// management for newly seen processes happens off the dispatch path.
pub struct ProcessEventThread {
    sender: Sender<ProcessNotice>,
    _handle: thread::JoinHandle<()>,
}

impl ProcessEventThread {
    pub fn spawn() -> Self {
        let (sender, receiver) = bounded::<ProcessNotice>(4096);
        let handle = thread::Builder::new()
            .name("proc-events".into())
            .spawn(move || {
                while let Ok(notice) = receiver.recv() {
                    match notice.event_type {
                        EVENT_TYPE_PROC_EXEC => {
                            debug!("process exec: pid={} comm={}", notice.pid, notice.comm_str());
                        }
                        EVENT_TYPE_PROC_EXIT => {
                            debug!("process exit: pid={} comm={}", notice.pid, notice.comm_str());
                        }
                        other => warn!("unhandled process event type {other:#x}"),
                    }
                }
            })
            .expect("spawn proc-events thread");
        Self {
            sender,
            _handle: handle,
        }
    }

    /// Forward a notice; drops (never blocks) when the consumer lags.
    pub fn notify(&self, notice: ProcessNotice) {
        let _ = self.sender.try_send(notice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_rejects_socket_data_range() {
        let registry = ExtraEventRegistry::new();
        let handler: ExtraHandler = Arc::new(|_| {});
        assert!(registry.register(8, handler.clone()).is_err());
        assert!(registry.register(EVENT_TYPE_PROC_EXEC, handler).is_ok());
    }

    #[test]
    fn lookup_matches_by_bit() {
        let registry = ExtraEventRegistry::new();
        let handler: ExtraHandler = Arc::new(|_| {});
        registry.register(EVENT_TYPE_PROC_EXIT, handler).unwrap();
        assert!(registry.lookup(EVENT_TYPE_PROC_EXIT).is_some());
        assert!(registry.lookup(EVENT_TYPE_PROC_EXEC).is_none());
    }

    #[test]
    fn process_notice_round_trip() {
        let mut event = ProcessEvent::zeroed();
        event.event_type = EVENT_TYPE_PROC_EXEC;
        event.pid = 4242;
        event.comm[..5].copy_from_slice(b"nginx");
        let bytes = bytemuck::bytes_of(&event);
        let notice = ProcessNotice::parse(bytes).unwrap();
        assert_eq!(notice.pid, 4242);
        assert_eq!(notice.comm_str(), "nginx");
    }
}
