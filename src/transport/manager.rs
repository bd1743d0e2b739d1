//! Reliable, ordered byte streams over an unreliable frame carrier.
//!
//! ICMP echo delivery reorders, duplicates, and drops datagrams; the TCP
//! sessions tunneled through it need a lossless ordered stream. The
//! [`FrameManager`] bridges the two: it chunks outbound bytes into numbered
//! DATA frames kept in a bounded send window until acknowledged, retransmits
//! on timeout or peer request, acknowledges every DATA frame it sees, and
//! reassembles the inbound frames into an in-order byte stream.
//!
//! One manager exists per tunneled TCP session on each side. All state is
//! owned by the session's update thread except the ingest queue, which the
//! carrier's receive path fills through a cloned [`IngestQueue`] handle.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::core::constants::{FRAME_MAX_ID, FRAME_MAX_SIZE};
use crate::transport::buffer::{BufferError, ByteRing};
use crate::transport::frame::Frame;

/// An unacknowledged DATA frame held in the send window.
///
/// `sent_at` and `resend` are send-side bookkeeping and never cross the wire.
/// `sent_at == None` marks a frame that has not been transmitted yet; the
/// next tick always emits it.
#[derive(Debug)]
struct SendEntry {
    id: u32,
    payload: Vec<u8>,
    sent_at: Option<Instant>,
    resend: bool,
}

/// A received DATA frame awaiting in-order delivery.
#[derive(Debug)]
struct RecvEntry {
    id: u32,
    payload: Vec<u8>,
}

/// Cross-thread handle for delivering frames received from the carrier.
///
/// Cloneable; the receive path pushes under a short-lived lock while the
/// update tick swaps the whole batch out once per call. This queue is the
/// only state a [`FrameManager`] shares across threads.
#[derive(Debug, Clone, Default)]
pub struct IngestQueue {
    inner: Arc<Mutex<Vec<Frame>>>,
}

impl IngestQueue {
    /// Append a frame received from the carrier.
    pub fn push(&self, frame: Frame) {
        self.inner.lock().push(frame);
    }

    /// Swap the accumulated batch out, leaving the queue empty.
    fn take(&self) -> Vec<Frame> {
        std::mem::take(&mut *self.inner.lock())
    }
}

/// Sliding-window reliable stream multiplexer for one tunnel session.
///
/// The owning thread drives it by calling [`update`](Self::update) on its own
/// cadence and moving frames between [`drain_outgoing`](Self::drain_outgoing)
/// and the carrier's transmit path. Nothing here blocks on I/O and no call
/// spawns background work; dropping the manager is shutdown.
#[derive(Debug)]
pub struct FrameManager {
    send_bytes: ByteRing,
    recv_bytes: ByteRing,

    /// Unacknowledged DATA frames, oldest first; length ≤ `window_size`.
    send_window: Vec<SendEntry>,
    /// Received DATA frames sorted ascending by id, ids unique.
    recv_window: Vec<RecvEntry>,

    incoming: IngestQueue,
    /// Frames to transmit, rebuilt on every tick.
    outgoing: Vec<Frame>,

    next_send_id: u32,
    next_recv_id: u32,

    window_size: usize,
    resend_timeout: Duration,
    frame_max_size: usize,
    max_id: u32,
}

impl FrameManager {
    /// Create a manager with the protocol's default frame sizing.
    ///
    /// `buffer_size` bounds each byte queue, `window_size` bounds the
    /// unacknowledged frames in flight, and `resend_timeout` is the elapsed
    /// time after which an unacknowledged frame is retransmitted.
    pub fn new(buffer_size: usize, window_size: usize, resend_timeout: Duration) -> Self {
        Self::with_limits(
            buffer_size,
            window_size,
            resend_timeout,
            FRAME_MAX_SIZE,
            FRAME_MAX_ID,
        )
    }

    /// Create a manager with explicit frame sizing.
    ///
    /// Both ends of a tunnel must agree on `frame_max_size` and `max_id`.
    pub fn with_limits(
        buffer_size: usize,
        window_size: usize,
        resend_timeout: Duration,
        frame_max_size: usize,
        max_id: u32,
    ) -> Self {
        Self {
            send_bytes: ByteRing::with_capacity(buffer_size),
            recv_bytes: ByteRing::with_capacity(buffer_size),
            send_window: Vec::new(),
            recv_window: Vec::new(),
            incoming: IngestQueue::default(),
            outgoing: Vec::new(),
            next_send_id: 0,
            next_recv_id: 0,
            window_size,
            resend_timeout,
            frame_max_size,
            max_id,
        }
    }

    /// Free space in the send byte queue.
    ///
    /// Producers unwilling to block must consult this before
    /// [`write_send`](Self::write_send); the window's back-pressure is
    /// expressed here once chunking stops draining the queue.
    pub fn send_free(&self) -> usize {
        self.send_bytes.free_space()
    }

    /// Append application bytes bound for the peer.
    ///
    /// Overflow means the producer skipped the [`send_free`](Self::send_free)
    /// check; the session treats that as fatal.
    pub fn write_send(&mut self, data: &[u8]) -> Result<(), BufferError> {
        self.send_bytes.write(data)
    }

    /// Bytes available for in-order delivery to the application.
    pub fn recv_len(&self) -> usize {
        self.recv_bytes.len()
    }

    /// Remove exactly `out.len()` in-order bytes for the application.
    pub fn read_recv(&mut self, out: &mut [u8]) -> Result<(), BufferError> {
        self.recv_bytes.read_into(out)
    }

    /// Handle for the carrier's receive path.
    pub fn ingest_queue(&self) -> IngestQueue {
        self.incoming.clone()
    }

    /// Deliver one frame received from the carrier.
    pub fn ingest(&self, frame: Frame) {
        self.incoming.push(frame);
    }

    /// Take the frames scheduled for transmission by the last tick.
    ///
    /// Anything not taken before the next tick is discarded, never sent late.
    pub fn drain_outgoing(&mut self) -> Vec<Frame> {
        std::mem::take(&mut self.outgoing)
    }

    /// Run one update tick at the current time.
    pub fn update(&mut self) {
        self.update_at(Instant::now());
    }

    /// Run one update tick at an explicit time.
    ///
    /// The tick is total: every incoming frame is consumed and no error can
    /// escape. Step order is fixed and wire-visible: newly chunked and
    /// retransmitted DATA frames are decided after the peer's acks and
    /// requests have been applied, and a consolidated ACK always precedes
    /// DATA in the outgoing batch.
    pub fn update_at(&mut self, now: Instant) {
        self.chunk_send_buffer();

        self.outgoing.clear();

        let (req_ids, ack_ids, delivered) = self.preprocess_incoming();

        for id in &req_ids {
            if let Some(entry) = self.send_window.iter_mut().find(|e| e.id == *id) {
                entry.resend = true;
            }
        }
        for id in &ack_ids {
            if let Some(pos) = self.send_window.iter().position(|e| e.id == *id) {
                self.send_window.remove(pos);
            }
        }

        if !delivered.is_empty() {
            self.outgoing.push(Frame::Ack {
                ids: delivered.keys().copied().collect(),
            });
            for (id, payload) in delivered {
                self.insert_recv_window(RecvEntry { id, payload });
            }
        }

        self.deliver_in_order();
        self.assemble_sends(now);
    }

    /// Move buffered bytes into new DATA frames while the window has room.
    ///
    /// Full frames are cut as long as a whole frame's worth is buffered. A
    /// sub-frame remainder is flushed only when the tick started below one
    /// full frame, so short interactive writes are not held back while bulk
    /// transfers still coalesce into full frames.
    fn chunk_send_buffer(&mut self) {
        let started_below_full = self.send_bytes.len() < self.frame_max_size;

        while self.send_bytes.len() >= self.frame_max_size
            && self.send_window.len() < self.window_size
        {
            self.cut_frame(self.frame_max_size);
        }

        if started_below_full
            && !self.send_bytes.is_empty()
            && self.send_window.len() < self.window_size
        {
            self.cut_frame(self.send_bytes.len());
        }
    }

    /// Cut one DATA frame of `size` bytes off the send queue.
    fn cut_frame(&mut self, size: usize) {
        let mut payload = vec![0u8; size];
        self.send_bytes
            .read_into(&mut payload)
            .expect("chunking checked the buffered length");

        self.send_window.push(SendEntry {
            id: self.next_send_id,
            payload,
            sent_at: None,
            resend: false,
        });
        self.next_send_id = self.wrapping_next(self.next_send_id);
    }

    /// Swap the ingest queue out and split it into the peer's requests, the
    /// peer's acknowledgments, and the DATA frames it delivered.
    ///
    /// Duplicate DATA ids within one batch resolve last-writer-wins.
    fn preprocess_incoming(&mut self) -> (HashSet<u32>, HashSet<u32>, HashMap<u32, Vec<u8>>) {
        let mut req_ids = HashSet::new();
        let mut ack_ids = HashSet::new();
        let mut delivered = HashMap::new();

        for frame in self.incoming.take() {
            match frame {
                Frame::Req { ids } => req_ids.extend(ids),
                Frame::Ack { ids } => ack_ids.extend(ids),
                Frame::Data { id, payload } => {
                    delivered.insert(id, payload);
                }
            }
        }
        (req_ids, ack_ids, delivered)
    }

    /// Insert a received DATA frame keeping the window sorted and ids unique.
    ///
    /// Ids are compared as plain integers, not modularly; near the wrap
    /// point the resulting order does not reflect send order, which the
    /// in-order delivery gate tolerates by simply waiting for the expected
    /// id to reach the head.
    fn insert_recv_window(&mut self, entry: RecvEntry) {
        if self.recv_window.iter().any(|e| e.id == entry.id) {
            return;
        }
        match self.recv_window.iter().position(|e| e.id > entry.id) {
            Some(pos) => self.recv_window.insert(pos, entry),
            None => self.recv_window.push(entry),
        }
    }

    /// Drain the receive window head into the receive byte queue while it
    /// carries the next expected id and the queue has room.
    fn deliver_in_order(&mut self) {
        while let Some(head) = self.recv_window.first() {
            if head.id != self.next_recv_id || self.recv_bytes.free_space() < head.payload.len() {
                break;
            }
            let entry = self.recv_window.remove(0);
            self.recv_bytes
                .write(&entry.payload)
                .expect("delivery checked the free space");
            self.next_recv_id = self.wrapping_next(self.next_recv_id);
        }
    }

    /// Append every due DATA frame in the send window to the outgoing batch.
    ///
    /// Due means: marked for resend by a peer request, never transmitted, or
    /// unacknowledged for longer than the resend timeout.
    fn assemble_sends(&mut self, now: Instant) {
        for entry in &mut self.send_window {
            let timed_out = match entry.sent_at {
                Some(at) => now.duration_since(at) > self.resend_timeout,
                None => true,
            };
            if entry.resend || timed_out {
                entry.sent_at = Some(now);
                entry.resend = false;
                self.outgoing.push(Frame::Data {
                    id: entry.id,
                    payload: entry.payload.clone(),
                });
            }
        }
    }

    fn wrapping_next(&self, id: u32) -> u32 {
        if id >= self.max_id {
            0
        } else {
            id + 1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Limits small enough to exercise windowing and id wrap directly.
    const FRAME: usize = 4;
    const WINDOW: usize = 3;
    const TIMEOUT: Duration = Duration::from_millis(100);
    const MAX_ID: u32 = 7;

    fn small_manager() -> FrameManager {
        FrameManager::with_limits(1024, WINDOW, TIMEOUT, FRAME, MAX_ID)
    }

    fn data_frames(outgoing: &[Frame]) -> Vec<(u32, Vec<u8>)> {
        outgoing
            .iter()
            .filter_map(|f| match f {
                Frame::Data { id, payload } => Some((*id, payload.clone())),
                _ => None,
            })
            .collect()
    }

    fn ack_id_sets(outgoing: &[Frame]) -> Vec<HashSet<u32>> {
        outgoing
            .iter()
            .filter_map(|f| match f {
                Frame::Ack { ids } => Some(ids.iter().copied().collect()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_chunking_full_frames() {
        let mut fm = small_manager();
        let start = Instant::now();

        fm.write_send(b"ABCDEFGH").unwrap();
        fm.update_at(start);

        let out = fm.drain_outgoing();
        assert_eq!(
            data_frames(&out),
            vec![(0, b"ABCD".to_vec()), (1, b"EFGH".to_vec())]
        );
        assert_eq!(fm.send_window.len(), 2);
        assert!(fm.send_bytes.is_empty());
    }

    #[test]
    fn test_partial_flush() {
        let mut fm = small_manager();
        let start = Instant::now();

        fm.write_send(b"AB").unwrap();
        fm.update_at(start);

        let out = fm.drain_outgoing();
        assert_eq!(data_frames(&out), vec![(0, b"AB".to_vec())]);
    }

    #[test]
    fn test_no_partial_flush_when_tick_started_full() {
        // 10 bytes is above one full frame, so the 2-byte remainder stays
        // buffered for the next tick's write to extend.
        let mut fm = small_manager();
        fm.write_send(b"ABCDEFGHIJ").unwrap();
        fm.update_at(Instant::now());

        assert_eq!(fm.send_window.len(), 2);
        assert_eq!(fm.send_bytes.len(), 2);
    }

    #[test]
    fn test_ack_removes_from_window() {
        let mut fm = small_manager();
        let start = Instant::now();

        fm.write_send(b"ABCDEFGH").unwrap();
        fm.update_at(start);
        fm.drain_outgoing();

        fm.ingest(Frame::Ack { ids: vec![0] });
        fm.update_at(start + Duration::from_millis(50));

        assert_eq!(fm.send_window.len(), 1);
        assert_eq!(fm.send_window[0].id, 1);
        // 50ms is inside the resend timeout, so nothing is re-sent.
        assert!(fm.drain_outgoing().is_empty());
    }

    #[test]
    fn test_req_forces_retransmit() {
        let mut fm = small_manager();
        let start = Instant::now();

        fm.write_send(b"ABCDEFGH").unwrap();
        fm.update_at(start);
        fm.drain_outgoing();

        fm.ingest(Frame::Req { ids: vec![0] });
        let second = start + Duration::from_millis(10);
        fm.update_at(second);

        let out = fm.drain_outgoing();
        assert_eq!(data_frames(&out), vec![(0, b"ABCD".to_vec())]);
        assert_eq!(fm.send_window[0].sent_at, Some(second));
        assert!(!fm.send_window[0].resend);
    }

    #[test]
    fn test_resend_timer() {
        let mut fm = small_manager();
        let start = Instant::now();

        fm.write_send(b"ABCD").unwrap();
        fm.update_at(start);
        assert_eq!(data_frames(&fm.drain_outgoing()).len(), 1);

        // Just inside the timeout: silent.
        fm.update_at(start + Duration::from_millis(100));
        assert!(fm.drain_outgoing().is_empty());

        // Just past it: retransmitted with a refreshed send time.
        let late = start + Duration::from_millis(101);
        fm.update_at(late);
        assert_eq!(data_frames(&fm.drain_outgoing()).len(), 1);
        assert_eq!(fm.send_window[0].sent_at, Some(late));
    }

    #[test]
    fn test_consolidated_ack_and_duplicate_drop() {
        let mut fm = small_manager();

        fm.ingest(Frame::Data {
            id: 5,
            payload: b"X".to_vec(),
        });
        fm.ingest(Frame::Data {
            id: 3,
            payload: b"Y".to_vec(),
        });
        fm.ingest(Frame::Data {
            id: 5,
            payload: b"X".to_vec(),
        });
        fm.update_at(Instant::now());

        let out = fm.drain_outgoing();
        let acks = ack_id_sets(&out);
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0], HashSet::from([3, 5]));

        let ids: Vec<u32> = fm.recv_window.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![3, 5]);
    }

    #[test]
    fn test_duplicate_across_ticks_is_idempotent() {
        let mut fm = small_manager();
        let frame = Frame::Data {
            id: 2,
            payload: b"zz".to_vec(),
        };

        fm.ingest(frame.clone());
        fm.update_at(Instant::now());
        fm.ingest(frame);
        fm.update_at(Instant::now());

        let ids: Vec<u32> = fm.recv_window.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn test_window_back_pressure() {
        let mut fm = small_manager();
        let payload = [7u8; 100];

        fm.write_send(&payload).unwrap();
        fm.update_at(Instant::now());

        assert_eq!(fm.send_window.len(), WINDOW);
        assert_eq!(fm.send_bytes.len(), 88);
        assert_eq!(fm.send_free(), 1024 - 88);

        // Without acks the window stays saturated and no more bytes move.
        fm.update_at(Instant::now());
        assert_eq!(fm.send_bytes.len(), 88);
    }

    #[test]
    fn test_ack_precedes_data_within_a_tick() {
        let mut fm = small_manager();

        fm.write_send(b"ABCD").unwrap();
        fm.ingest(Frame::Data {
            id: 0,
            payload: b"peer".to_vec(),
        });
        fm.update_at(Instant::now());

        let out = fm.drain_outgoing();
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0], Frame::Ack { .. }));
        assert!(matches!(out[1], Frame::Data { .. }));
    }

    #[test]
    fn test_ack_and_req_for_unknown_ids_are_ignored() {
        let mut fm = small_manager();

        fm.write_send(b"ABCD").unwrap();
        fm.update_at(Instant::now());
        fm.drain_outgoing();

        fm.ingest(Frame::Ack { ids: vec![6] });
        fm.ingest(Frame::Req { ids: vec![4] });
        fm.update_at(Instant::now());

        assert_eq!(fm.send_window.len(), 1);
        assert!(fm.drain_outgoing().is_empty());
    }

    #[test]
    fn test_recv_window_sorted_and_unique() {
        let mut fm = small_manager();

        for id in [6, 1, 4, 1, 2, 6] {
            fm.ingest(Frame::Data {
                id,
                payload: vec![id as u8],
            });
            fm.update_at(Instant::now());
            fm.drain_outgoing();
        }

        let ids: Vec<u32> = fm.recv_window.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2, 4, 6]);
    }

    #[test]
    fn test_in_order_delivery_waits_for_gap() {
        let mut fm = small_manager();

        fm.ingest(Frame::Data {
            id: 1,
            payload: b"BB".to_vec(),
        });
        fm.update_at(Instant::now());
        // Frame 0 is still missing, nothing is deliverable.
        assert_eq!(fm.recv_len(), 0);

        fm.ingest(Frame::Data {
            id: 0,
            payload: b"AA".to_vec(),
        });
        fm.update_at(Instant::now());

        assert_eq!(fm.recv_len(), 4);
        let mut out = [0u8; 4];
        fm.read_recv(&mut out).unwrap();
        assert_eq!(&out, b"AABB");
        assert!(fm.recv_window.is_empty());
    }

    #[test]
    fn test_in_order_delivery_across_id_wrap() {
        let mut fm = small_manager();

        // Deliver one full id lap in order; next_recv_id wraps past MAX_ID.
        for lap_id in 0..=MAX_ID {
            fm.ingest(Frame::Data {
                id: lap_id,
                payload: vec![lap_id as u8],
            });
            fm.update_at(Instant::now());
        }
        fm.ingest(Frame::Data {
            id: 0,
            payload: vec![0xAA],
        });
        fm.update_at(Instant::now());

        assert_eq!(fm.recv_len(), MAX_ID as usize + 2);
        assert_eq!(fm.next_recv_id, 1);
    }

    #[test]
    fn test_send_id_wraps() {
        let mut fm = FrameManager::with_limits(1024, 64, TIMEOUT, FRAME, MAX_ID);

        fm.write_send(&[0u8; 4 * 10]).unwrap();
        fm.update_at(Instant::now());

        let ids: Vec<u32> = fm.send_window.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4, 5, 6, 7, 0, 1]);
    }

    #[test]
    fn test_write_send_overflow_fails_loudly() {
        let mut fm = FrameManager::with_limits(8, WINDOW, TIMEOUT, FRAME, MAX_ID);

        fm.write_send(b"12345678").unwrap();
        assert_eq!(fm.send_free(), 0);
        assert!(matches!(
            fm.write_send(b"9"),
            Err(BufferError::Overflow { .. })
        ));
    }

    #[test]
    fn test_outgoing_rebuilt_even_if_not_drained() {
        let mut fm = small_manager();
        let start = Instant::now();

        fm.write_send(b"ABCD").unwrap();
        fm.update_at(start);
        // Not drained; the next tick must not carry it over twice.
        fm.update_at(start + Duration::from_millis(10));

        assert!(fm.drain_outgoing().is_empty());
    }

    #[test]
    fn test_ingest_queue_handle_feeds_ticks() {
        let mut fm = small_manager();
        let queue = fm.ingest_queue();

        let handle = std::thread::spawn(move || {
            queue.push(Frame::Data {
                id: 0,
                payload: b"hi".to_vec(),
            });
        });
        handle.join().unwrap();

        fm.update_at(Instant::now());
        assert_eq!(fm.recv_len(), 2);
    }

    #[test]
    fn test_loss_free_delivery_over_perfect_channel() {
        let mut a = FrameManager::with_limits(4096, WINDOW, TIMEOUT, FRAME, FRAME_MAX_ID);
        let mut b = FrameManager::with_limits(4096, WINDOW, TIMEOUT, FRAME, FRAME_MAX_ID);

        let stream: Vec<u8> = (0..997u32).map(|i| (i % 251) as u8).collect();
        let mut written = 0;
        let mut received = Vec::new();

        let start = Instant::now();
        for round in 0..10_000u64 {
            let now = start + Duration::from_millis(round);

            let room = a.send_free().min(stream.len() - written);
            if room > 0 {
                a.write_send(&stream[written..written + room]).unwrap();
                written += room;
            }

            a.update_at(now);
            for frame in a.drain_outgoing() {
                b.ingest(frame);
            }
            b.update_at(now);
            for frame in b.drain_outgoing() {
                a.ingest(frame);
            }

            let mut chunk = vec![0u8; b.recv_len()];
            b.read_recv(&mut chunk).unwrap();
            received.extend_from_slice(&chunk);

            if received.len() == stream.len() {
                // One more tick so the final acks clear a's window.
                a.update_at(now + Duration::from_millis(1));
                break;
            }
        }

        assert_eq!(received, stream);
        assert!(a.send_window.is_empty());
        assert!(b.recv_window.is_empty());
    }

    #[test]
    fn test_window_never_exceeds_bound() {
        let mut fm = small_manager();
        let start = Instant::now();

        for round in 0..50u64 {
            let fill = fm.send_free().min(16);
            fm.write_send(&vec![1u8; fill]).unwrap();
            fm.update_at(start + Duration::from_millis(round));
            fm.drain_outgoing();
            assert!(fm.send_window.len() <= WINDOW);
        }
    }
}
