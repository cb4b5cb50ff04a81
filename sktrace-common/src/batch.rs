//! Batch envelope handling.
//!
//! The kernel pushes whole `SocketDataBuffer` envelopes onto the perf
//! ring: `events_num`, `len`, then a packed run of variable-length
//! capture records (each a fixed header plus `data_len` payload
//! bytes). This module walks that run on the user side.

use crate::types::*;
use bytemuck::Zeroable;

/// Parsed view of one raw perf frame carrying socket data.
#[cfg(feature = "user")]
#[derive(Debug)]
pub struct BatchView<'a> {
    pub events_num: u32,
    pub len: u32,
    data: &'a [u8],
}

#[cfg(feature = "user")]
impl<'a> BatchView<'a> {
    /// Interpret a raw frame as a batch envelope. Returns `None` when
    /// the frame is too short or the declared length overruns it.
    pub fn parse(raw: &'a [u8]) -> Option<Self> {
        if raw.len() < 8 {
            return None;
        }
        let events_num = u32::from_le_bytes(raw[0..4].try_into().ok()?);
        let len = u32::from_le_bytes(raw[4..8].try_into().ok()?);
        if events_num == 0 || events_num > EVENT_BURST_NUM {
            return None;
        }
        let data = &raw[8..];
        if len as usize > data.len() {
            return None;
        }
        Some(Self {
            events_num,
            len,
            data: &data[..len as usize],
        })
    }

    pub fn records(&self) -> RecordIter<'a> {
        RecordIter {
            data: self.data,
            remaining: self.events_num,
        }
    }
}

/// One record split into its copied header and its payload bytes.
#[cfg(feature = "user")]
pub struct RecordView<'a> {
    pub header: CaptureRecord,
    pub payload: &'a [u8],
}

#[cfg(feature = "user")]
pub struct RecordIter<'a> {
    data: &'a [u8],
    remaining: u32,
}

#[cfg(feature = "user")]
impl<'a> Iterator for RecordIter<'a> {
    type Item = RecordView<'a>;

    fn next(&mut self) -> Option<RecordView<'a>> {
        if self.remaining == 0 || self.data.len() < RECORD_HEADER_SIZE {
            return None;
        }
        // The record header is packed; copy it out unaligned. Only the
        // first RECORD_HEADER_SIZE + data_len bytes of the struct are
        // present on the wire.
        let mut header = CaptureRecord::zeroed();
        let dst = &mut header as *mut CaptureRecord as *mut u8;
        unsafe {
            core::ptr::copy_nonoverlapping(self.data.as_ptr(), dst, RECORD_HEADER_SIZE);
        }
        let data_len = header.data_len as usize;
        let total = RECORD_HEADER_SIZE + data_len;
        if data_len > CAP_DATA_SIZE || total > self.data.len() {
            return None;
        }
        let payload = &self.data[RECORD_HEADER_SIZE..total];
        self.data = &self.data[total..];
        self.remaining -= 1;
        Some(RecordView { header, payload })
    }
}

/// Builder counterpart of the record walk, used by the tests and the
/// loopback tooling to fabricate envelopes the way the kernel lays
/// them out.
#[cfg(feature = "user")]
pub fn append_record(buf: &mut SocketDataBuffer, header: &CaptureRecord, payload: &[u8]) -> bool {
    assert!(payload.len() <= CAP_DATA_SIZE);
    let total = RECORD_HEADER_SIZE + payload.len();
    let at = buf.len as usize;
    if at + total > DATA_BUF_CAPACITY || buf.events_num >= EVENT_BURST_NUM {
        return false;
    }
    let mut header = *header;
    header.data_len = payload.len() as u16;
    let src = &header as *const CaptureRecord as *const u8;
    unsafe {
        core::ptr::copy_nonoverlapping(src, buf.data[at..].as_mut_ptr(), RECORD_HEADER_SIZE);
    }
    buf.data[at + RECORD_HEADER_SIZE..at + total].copy_from_slice(payload);
    buf.len += total as u32;
    buf.events_num += 1;
    true
}

/// Serialize the envelope the way the kernel emits it (header fields
/// followed by the payload area, padded to the full map value).
#[cfg(feature = "user")]
pub fn to_frame(buf: &SocketDataBuffer) -> [u8; SOCKET_DATA_BUFFER_SIZE] {
    bytemuck::cast(*buf)
}

#[cfg(all(test, feature = "user"))]
mod tests {
    use super::*;

    fn sample_record(socket_id: u64, seq: u64, payload_len: usize) -> (CaptureRecord, Vec<u8>) {
        let mut rec = CaptureRecord::zeroed();
        rec.pid = 1234;
        rec.tgid = 1234;
        rec.socket_id = socket_id;
        rec.data_seq = seq;
        rec.timestamp = 42;
        rec.flags = CaptureRecord::pack_flags(direction::EGRESS, msg_type::REQUEST);
        let payload = vec![0xabu8; payload_len];
        rec.syscall_len = payload_len as u64;
        (rec, payload)
    }

    #[test]
    fn round_trip_preserves_records() {
        let mut buf = SocketDataBuffer::zeroed();
        for i in 0..3u64 {
            let (rec, payload) = sample_record(100 + i, i + 1, 16 * (i as usize + 1));
            assert!(append_record(&mut buf, &rec, &payload));
        }
        let frame = to_frame(&buf);
        let view = BatchView::parse(&frame).expect("valid envelope");
        assert_eq!(view.events_num, 3);

        let records: Vec<_> = view.records().collect();
        assert_eq!(records.len(), 3);
        for (i, r) in records.iter().enumerate() {
            let socket_id = r.header.socket_id;
            let data_seq = r.header.data_seq;
            assert_eq!(socket_id, 100 + i as u64);
            assert_eq!(data_seq, i as u64 + 1);
            assert_eq!(r.payload.len(), 16 * (i + 1));
            assert!(r.payload.iter().all(|&b| b == 0xab));
        }
    }

    #[test]
    fn burst_limit_is_enforced() {
        let mut buf = SocketDataBuffer::zeroed();
        let (rec, payload) = sample_record(1, 1, 8);
        for _ in 0..EVENT_BURST_NUM {
            assert!(append_record(&mut buf, &rec, &payload));
        }
        assert!(!append_record(&mut buf, &rec, &payload));
        assert!(buf.len as usize <= DATA_BUF_CAPACITY);
    }

    #[test]
    fn full_payload_records_fit_a_burst() {
        let mut buf = SocketDataBuffer::zeroed();
        let (rec, payload) = sample_record(1, 1, CAP_DATA_SIZE);
        let mut n = 0;
        while append_record(&mut buf, &rec, &payload) {
            n += 1;
        }
        assert_eq!(n, EVENT_BURST_NUM);
    }

    #[test]
    fn truncated_frames_are_rejected() {
        assert!(BatchView::parse(&[0u8; 4]).is_none());

        let mut buf = SocketDataBuffer::zeroed();
        let (rec, payload) = sample_record(1, 1, 64);
        assert!(append_record(&mut buf, &rec, &payload));
        let frame = to_frame(&buf);
        // Chop the frame below the declared length.
        assert!(BatchView::parse(&frame[..32]).is_none());
    }

    #[test]
    fn zero_event_frames_are_rejected() {
        let buf = SocketDataBuffer::zeroed();
        let frame = to_frame(&buf);
        assert!(BatchView::parse(&frame).is_none());
    }
}
