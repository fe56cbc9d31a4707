// ABOUTME: Per-connection LSP state machine: sequencing, reordering, sliding window, epoch liveness
// ABOUTME: One task per live connection; communicates with the rest of the endpoint only through queues

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::time::{self, Duration};
use tracing::debug;

use crate::frame::{Frame, FrameKind};
use crate::params::Params;

/// Connection lifecycle state, readable by many (`close`, `close_conn`) and
/// writable only by the owning connection task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    Open,
    Draining,
    HandlerClosed,
    SocketClosed,
    Lost,
}

/// A small cell around [`ConnStatus`], cheaply cloneable and safe to read
/// from any task.
#[derive(Debug, Clone)]
pub struct StatusCell(Arc<Mutex<ConnStatus>>);

impl StatusCell {
    fn new(initial: ConnStatus) -> Self {
        Self(Arc::new(Mutex::new(initial)))
    }

    pub fn get(&self) -> ConnStatus {
        *self.0.lock().expect("status mutex poisoned")
    }

    /// Forces a status transition from outside the owning connection task.
    /// Used by the endpoint to mark a connection `SocketClosed` once its
    /// socket has been torn down after the connection itself drained.
    pub(crate) fn force(&self, status: ConnStatus) {
        *self.0.lock().expect("status mutex poisoned") = status;
    }

    fn set(&self, status: ConnStatus) {
        *self.0.lock().expect("status mutex poisoned") = status;
    }
}

/// A payload delivered to the application, or a one-time notice that a
/// connection was lost.
#[derive(Debug)]
pub enum Delivery {
    Payload { conn_id: u32, payload: Vec<u8> },
    Lost { conn_id: u32 },
}

/// What the rest of the endpoint holds onto for a live connection: enough to
/// route inbound frames and application writes to the task, and to request a
/// drain.
pub struct ConnectionHandle {
    pub conn_id: u32,
    pub peer_addr: SocketAddr,
    pub status: StatusCell,
    pub inbound_tx: mpsc::UnboundedSender<Frame>,
    pub write_tx: mpsc::Sender<Vec<u8>>,
    pub close_tx: mpsc::Sender<()>,
}

/// Spawns a connection task already in the `Open` state (the handshake, for
/// a dialing client, has already completed by the time this is called — see
/// `client::dial`). Returns the handle the endpoint keeps and the inbound
/// queue the socket demultiplexer feeds.
pub fn spawn(
    conn_id: u32,
    peer_addr: SocketAddr,
    params: Params,
    outbound_tx: mpsc::UnboundedSender<(SocketAddr, Frame)>,
    deliver_tx: mpsc::UnboundedSender<Delivery>,
    retired_tx: mpsc::Sender<u32>,
) -> ConnectionHandle {
    let status = StatusCell::new(ConnStatus::Open);
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (write_tx, write_rx) = mpsc::channel(64);
    let (close_tx, close_rx) = mpsc::channel(1);

    let task = ConnectionTask {
        conn_id,
        peer_addr,
        params,
        status: status.clone(),
        next_send_seq: 1,
        next_expected_recv_seq: 1,
        unacked_sent: VecDeque::new(),
        pending_send: VecDeque::new(),
        recv_reorder: BTreeMap::new(),
        epochs_silent: 0,
        outbound_tx,
        deliver_tx,
        retired_tx,
    };

    tokio::spawn(task.run(inbound_rx, write_rx, close_rx));

    ConnectionHandle {
        conn_id,
        peer_addr,
        status,
        inbound_tx,
        write_tx,
        close_tx,
    }
}

struct ConnectionTask {
    conn_id: u32,
    peer_addr: SocketAddr,
    params: Params,
    status: StatusCell,
    next_send_seq: u32,
    next_expected_recv_seq: u32,
    unacked_sent: VecDeque<(u32, Vec<u8>)>,
    pending_send: VecDeque<Vec<u8>>,
    recv_reorder: BTreeMap<u32, Vec<u8>>,
    epochs_silent: u32,
    outbound_tx: mpsc::UnboundedSender<(SocketAddr, Frame)>,
    deliver_tx: mpsc::UnboundedSender<Delivery>,
    retired_tx: mpsc::Sender<u32>,
}

impl ConnectionTask {
    async fn run(
        mut self,
        mut inbound_rx: mpsc::UnboundedReceiver<Frame>,
        mut write_rx: mpsc::Receiver<Vec<u8>>,
        mut close_rx: mpsc::Receiver<()>,
    ) {
        let mut ticker = time::interval(self.params.epoch_interval.max(Duration::from_millis(1)));
        ticker.tick().await; // first tick is immediate; consume it so the real period starts now

        loop {
            tokio::select! {
                maybe_frame = inbound_rx.recv() => {
                    match maybe_frame {
                        Some(frame) => self.handle_inbound(frame),
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    if !self.handle_epoch_tick() {
                        self.deliver_tx
                            .send(Delivery::Lost { conn_id: self.conn_id })
                            .ok();
                        break;
                    }
                }
                // Polled regardless of status: a payload queued before close()
                // flips this connection to Draining must still be drained and
                // sent, even if the close signal is observed on the very next
                // select (tokio::select! picks pseudo-randomly among ready
                // branches, so draining cannot be gated on `status == Open`).
                maybe_payload = write_rx.recv() => {
                    match maybe_payload {
                        Some(payload) => self.enqueue_outbound(payload),
                        None => {}
                    }
                }
                _ = close_rx.recv() => {
                    if self.status.get() == ConnStatus::Open {
                        self.status.set(ConnStatus::Draining);
                    }
                }
            }

            if self.status.get() == ConnStatus::Draining
                && self.unacked_sent.is_empty()
                && self.pending_send.is_empty()
                && write_rx.len() == 0
            {
                self.status.set(ConnStatus::HandlerClosed);
                break;
            }
        }

        self.retired_tx.send(self.conn_id).await.ok();
    }

    fn handle_inbound(&mut self, mut frame: Frame) {
        match frame.kind {
            FrameKind::Connect => {
                // Handled upstream by the acceptor; a connection task never
                // sees one addressed to it.
            }
            FrameKind::Ack => {
                self.epochs_silent = 0;
                if frame.seq_num != 0 {
                    self.unacked_sent.retain(|(seq, _)| *seq != frame.seq_num);
                    self.try_promote_pending_send();
                }
            }
            FrameKind::Data => {
                if !frame.apply_truncation_guard() {
                    debug!(conn_id = self.conn_id, "discarding malformed data frame");
                    return;
                }
                self.epochs_silent = 0;

                let seq = frame.seq_num;
                if seq < self.next_expected_recv_seq {
                    // Duplicate already delivered: re-Ack below, no re-delivery.
                } else if seq == self.next_expected_recv_seq {
                    self.deliver(frame.payload);
                    self.next_expected_recv_seq += 1;
                    self.try_promote_pending_recv();
                } else {
                    self.recv_reorder.entry(seq).or_insert(frame.payload);
                }

                self.send_frame(Frame::ack(self.conn_id, seq));
            }
        }
    }

    fn try_promote_pending_recv(&mut self) {
        while let Some(payload) = self.recv_reorder.remove(&self.next_expected_recv_seq) {
            self.deliver(payload);
            self.next_expected_recv_seq += 1;
        }
    }

    fn deliver(&self, payload: Vec<u8>) {
        self.deliver_tx
            .send(Delivery::Payload {
                conn_id: self.conn_id,
                payload,
            })
            .ok();
    }

    /// Span check against the oldest unacked frame (invariant (3):
    /// `max(unacked_sent) - min(unacked_sent) < window_size`), not a raw
    /// count — an out-of-order Ack can shrink `unacked_sent.len()` without
    /// shrinking the span, since the oldest (smallest) sequence can remain
    /// outstanding while newer ones are acked.
    fn window_has_room(&self) -> bool {
        match self.unacked_sent.front() {
            Some((min_seq, _)) => self.next_send_seq - *min_seq < self.params.window_size,
            None => true,
        }
    }

    fn enqueue_outbound(&mut self, payload: Vec<u8>) {
        self.pending_send.push_back(payload);
        self.try_promote_pending_send();
    }

    fn try_promote_pending_send(&mut self) {
        while self.window_has_room() {
            let Some(payload) = self.pending_send.pop_front() else {
                break;
            };
            let seq = self.next_send_seq;
            self.next_send_seq += 1;
            self.unacked_sent.push_back((seq, payload.clone()));
            self.send_frame(Frame::data(self.conn_id, seq, payload));
        }
    }

    /// Returns `false` when the connection should be torn down as lost.
    fn handle_epoch_tick(&mut self) -> bool {
        self.epochs_silent += 1;
        if self.epochs_silent >= self.params.epoch_limit {
            self.status.set(ConnStatus::Lost);
            return false;
        }

        let nothing_received_yet = self.next_expected_recv_seq == 1 && self.recv_reorder.is_empty();
        if nothing_received_yet {
            self.send_frame(Frame::ack(self.conn_id, 0));
        }

        for (seq, payload) in &self.unacked_sent {
            self.outbound_tx
                .send((
                    self.peer_addr,
                    Frame::data(self.conn_id, *seq, payload.clone()),
                ))
                .ok();
        }

        true
    }

    fn send_frame(&self, frame: Frame) {
        self.outbound_tx.send((self.peer_addr, frame)).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_task(params: Params) -> (
        ConnectionTask,
        mpsc::UnboundedReceiver<(SocketAddr, Frame)>,
        mpsc::UnboundedReceiver<Delivery>,
        mpsc::Receiver<u32>,
    ) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (deliver_tx, deliver_rx) = mpsc::unbounded_channel();
        let (retired_tx, retired_rx) = mpsc::channel(1);
        let task = ConnectionTask {
            conn_id: 73,
            peer_addr: "127.0.0.1:9000".parse().unwrap(),
            params,
            status: StatusCell::new(ConnStatus::Open),
            next_send_seq: 1,
            next_expected_recv_seq: 1,
            unacked_sent: VecDeque::new(),
            pending_send: VecDeque::new(),
            recv_reorder: BTreeMap::new(),
            epochs_silent: 0,
            outbound_tx,
            deliver_tx,
            retired_tx,
        };
        (task, outbound_rx, deliver_rx, retired_rx)
    }

    #[test]
    fn in_order_data_is_delivered_and_acked() {
        let (mut task, mut outbound_rx, mut deliver_rx, _retired_rx) =
            new_task(Params::default());

        task.handle_inbound(Frame::data(73, 1, b"a".to_vec()));

        match deliver_rx.try_recv().unwrap() {
            Delivery::Payload { conn_id, payload } => {
                assert_eq!(conn_id, 73);
                assert_eq!(payload, b"a");
            }
            other => panic!("unexpected delivery: {other:?}"),
        }
        assert_eq!(task.next_expected_recv_seq, 2);

        let (_, ack) = outbound_rx.try_recv().unwrap();
        assert_eq!(ack.kind, FrameKind::Ack);
        assert_eq!(ack.seq_num, 1);
    }

    #[test]
    fn out_of_order_data_buffers_then_promotes() {
        let (mut task, _outbound_rx, mut deliver_rx, _retired_rx) =
            new_task(Params::default());

        task.handle_inbound(Frame::data(73, 2, b"b".to_vec()));
        assert!(deliver_rx.try_recv().is_err());
        assert!(task.recv_reorder.contains_key(&2));

        task.handle_inbound(Frame::data(73, 1, b"a".to_vec()));

        let first = deliver_rx.try_recv().unwrap();
        let second = deliver_rx.try_recv().unwrap();
        let payloads: Vec<Vec<u8>> = [first, second]
            .into_iter()
            .map(|d| match d {
                Delivery::Payload { payload, .. } => payload,
                other => panic!("unexpected delivery: {other:?}"),
            })
            .collect();
        assert_eq!(payloads, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(task.next_expected_recv_seq, 3);
        assert!(task.recv_reorder.is_empty());
    }

    #[test]
    fn duplicate_data_reacks_without_redelivery() {
        let (mut task, mut outbound_rx, mut deliver_rx, _retired_rx) =
            new_task(Params::default());

        task.handle_inbound(Frame::data(73, 1, b"a".to_vec()));
        deliver_rx.try_recv().unwrap();
        outbound_rx.try_recv().unwrap();

        task.handle_inbound(Frame::data(73, 1, b"a".to_vec()));
        assert!(deliver_rx.try_recv().is_err());
        let (_, ack) = outbound_rx.try_recv().unwrap();
        assert_eq!(ack.seq_num, 1);
    }

    #[test]
    fn truncated_data_is_delivered_truncated() {
        let (mut task, _outbound_rx, mut deliver_rx, _retired_rx) =
            new_task(Params::default());

        let mut frame = Frame::data(73, 1, b"abcdef".to_vec());
        frame.size = 3;
        task.handle_inbound(frame);

        match deliver_rx.try_recv().unwrap() {
            Delivery::Payload { payload, .. } => assert_eq!(payload, b"abc"),
            other => panic!("unexpected delivery: {other:?}"),
        }
    }

    #[test]
    fn oversized_claim_is_discarded_without_ack_or_reset() {
        let (mut task, outbound_rx, mut deliver_rx, _retired_rx) = new_task(Params::default());
        task.epochs_silent = 3;

        let mut frame = Frame::data(73, 1, b"ab".to_vec());
        frame.size = 5;
        task.handle_inbound(frame);

        assert!(deliver_rx.try_recv().is_err());
        drop(outbound_rx);
        assert_eq!(task.epochs_silent, 3);
    }

    #[test]
    fn window_limits_unacked_and_queues_overflow() {
        let params = Params::default().with_window_size(1);
        let (mut task, mut outbound_rx, _deliver_rx, _retired_rx) = new_task(params);

        task.enqueue_outbound(b"first".to_vec());
        task.enqueue_outbound(b"second".to_vec());

        assert_eq!(task.unacked_sent.len(), 1);
        assert_eq!(task.pending_send.len(), 1);
        let (_, frame) = outbound_rx.try_recv().unwrap();
        assert_eq!(frame.seq_num, 1);
        assert!(outbound_rx.try_recv().is_err());

        // Acking the first frame should promote the second.
        task.handle_inbound(Frame::ack(73, 1));
        assert!(task.unacked_sent.iter().all(|(seq, _)| *seq == 2));
        assert!(task.pending_send.is_empty());
        let (_, frame) = outbound_rx.try_recv().unwrap();
        assert_eq!(frame.seq_num, 2);
    }

    #[test]
    fn window_of_three_caps_in_flight_frames_across_six_writes() {
        let params = Params::default().with_window_size(3);
        let (mut task, mut outbound_rx, _deliver_rx, _retired_rx) = new_task(params);

        for i in 0..6 {
            task.enqueue_outbound(format!("payload-{i}").into_bytes());
        }

        assert_eq!(task.unacked_sent.len(), 3);
        assert_eq!(task.pending_send.len(), 3);
        let in_flight: Vec<u32> = std::iter::from_fn(|| outbound_rx.try_recv().ok())
            .map(|(_, frame)| frame.seq_num)
            .collect();
        assert_eq!(in_flight, vec![1, 2, 3]);

        // Acking all three frees the window for the remaining three.
        for seq in 1..=3 {
            task.handle_inbound(Frame::ack(73, seq));
        }
        assert_eq!(task.unacked_sent.len(), 3);
        assert!(task.pending_send.is_empty());
        let newly_sent: Vec<u32> = std::iter::from_fn(|| outbound_rx.try_recv().ok())
            .map(|(_, frame)| frame.seq_num)
            .collect();
        assert_eq!(newly_sent, vec![4, 5, 6]);
    }

    #[test]
    fn window_admission_uses_span_not_count_after_out_of_order_ack() {
        let params = Params::default().with_window_size(3);
        let (mut task, mut outbound_rx, _deliver_rx, _retired_rx) = new_task(params);

        task.enqueue_outbound(b"one".to_vec());
        task.enqueue_outbound(b"two".to_vec());
        task.enqueue_outbound(b"three".to_vec());
        for _ in 0..3 {
            outbound_rx.try_recv().unwrap();
        }
        assert_eq!(task.unacked_sent.len(), 3);

        // Seq 2 acked out of order (legal over UDP); seq 1, the oldest, is
        // still outstanding.
        task.handle_inbound(Frame::ack(73, 2));
        assert_eq!(task.unacked_sent.len(), 2);

        // A raw count check would see len() == 2 < 3 and admit a 4th frame,
        // pushing the span (4 - 1) to 3, violating invariant (3). The span
        // check must keep it queued instead.
        task.enqueue_outbound(b"four".to_vec());
        assert_eq!(task.pending_send.len(), 1, "fourth write must stay queued");
        assert!(
            outbound_rx.try_recv().is_err(),
            "no new Data frame should be admitted while the span is already at window_size"
        );
        assert!(task.unacked_sent.iter().all(|(seq, _)| *seq != 4));

        // Acking the oldest (seq 1) shrinks the span back down and frees room.
        task.handle_inbound(Frame::ack(73, 1));
        assert!(task.pending_send.is_empty());
        let (_, frame) = outbound_rx.try_recv().unwrap();
        assert_eq!(frame.seq_num, 4);
    }

    #[test]
    fn epoch_limit_declares_connection_lost() {
        let params = Params::default().with_epoch_limit(2);
        let (mut task, _outbound_rx, _deliver_rx, _retired_rx) = new_task(params);

        assert!(task.handle_epoch_tick());
        assert!(!task.handle_epoch_tick());
        assert_eq!(task.status.get(), ConnStatus::Lost);
    }

    #[test]
    fn epoch_tick_retransmits_unacked_frames() {
        let (mut task, mut outbound_rx, _deliver_rx, _retired_rx) = new_task(Params::default());
        task.unacked_sent.push_back((1, b"x".to_vec()));
        // Drop the "nothing received yet" keepalive ack this produces too.
        task.handle_epoch_tick();

        let mut saw_retransmit = false;
        while let Ok((_, frame)) = outbound_rx.try_recv() {
            if frame.kind == FrameKind::Data && frame.seq_num == 1 {
                saw_retransmit = true;
            }
        }
        assert!(saw_retransmit);
    }

    #[test]
    fn draining_still_promotes_and_sends_queued_writes() {
        // enqueue_outbound no longer special-cases status: a payload that
        // was already in the write queue when close() flipped this
        // connection to Draining must still be sequenced and sent, so that
        // run()'s unconditional write_rx polling can drain it. Write-after-
        // close is enforced one layer up, by run() no longer reading from
        // write_rx once the task has actually retired.
        let (mut task, mut outbound_rx, _deliver_rx, _retired_rx) = new_task(Params::default());
        task.status.set(ConnStatus::Draining);

        task.enqueue_outbound(b"queued before close completed".to_vec());

        assert_eq!(task.unacked_sent.len(), 1);
        let (_, frame) = outbound_rx.try_recv().unwrap();
        assert_eq!(frame.payload, b"queued before close completed");
    }

    #[tokio::test]
    async fn close_drains_writes_queued_before_close_is_observed() {
        // Regression test for the close/write_rx race: all writes already
        // sent into write_tx before close_tx must be delivered even if
        // tokio::select! happens to service the close signal first.
        let params = Params::default()
            .with_epoch_millis(5_000)
            .with_window_size(10);
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let (deliver_tx, _deliver_rx) = mpsc::unbounded_channel();
        let (retired_tx, mut retired_rx) = mpsc::channel(1);

        let handle = spawn(
            73,
            "127.0.0.1:9000".parse().unwrap(),
            params,
            outbound_tx,
            deliver_tx,
            retired_tx,
        );

        handle.write_tx.send(b"a".to_vec()).await.unwrap();
        handle.write_tx.send(b"b".to_vec()).await.unwrap();
        handle.write_tx.send(b"c".to_vec()).await.unwrap();
        handle.close_tx.send(()).await.unwrap();

        let mut seqs = Vec::new();
        for _ in 0..3 {
            let (_, frame) = time::timeout(Duration::from_secs(2), outbound_rx.recv())
                .await
                .expect("data frame sent before timeout")
                .expect("outbound channel still open");
            assert_eq!(frame.kind, FrameKind::Data);
            seqs.push(frame.seq_num);
            handle.inbound_tx.send(Frame::ack(73, frame.seq_num)).unwrap();
        }
        seqs.sort_unstable();
        assert_eq!(seqs, vec![1, 2, 3]);

        let retired = time::timeout(Duration::from_secs(2), retired_rx.recv())
            .await
            .expect("task retires before timeout")
            .expect("retired_tx still open");
        assert_eq!(retired, 73);
    }
}
