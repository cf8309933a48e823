//! Length-prefixed framing, bounded send/receive queues, heartbeats
//! and operation ids on top of a `FramedTransport` (§4.C).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot, Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::branch_info::{get_varint, put_varint};
use crate::config::MAX_MESSAGE_PAYLOAD_SIZE;
use crate::error::{Result, YogiError};
use crate::transport::framed::FramedTransport;

struct QueuedFrame {
    op_id: u32,
    payload: Bytes,
}

/// Byte-budgeted FIFO queue for outgoing frames. `push_retry` parks
/// until room exists, `try_push` fails fast with `TxQueueFull`.
struct SendQueue {
    items: Mutex<VecDeque<QueuedFrame>>,
    budget: Semaphore,
    not_empty: Notify,
}

impl SendQueue {
    fn new(capacity_bytes: usize) -> Self {
        SendQueue {
            items: Mutex::new(VecDeque::new()),
            budget: Semaphore::new(capacity_bytes.max(1)),
            not_empty: Notify::new(),
        }
    }

    fn cost(payload: &Bytes) -> u32 {
        payload.len().max(1) as u32
    }

    async fn push_retry(&self, frame: QueuedFrame, cancel: &CancellationToken) -> Result<()> {
        let cost = Self::cost(&frame.payload);
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(YogiError::Canceled(None)),
            permit = self.budget.acquire_many(cost) => permit,
        };
        permit.expect("semaphore never closed").forget();
        self.items.lock().await.push_back(frame);
        self.not_empty.notify_one();
        Ok(())
    }

    fn try_push(&self, frame: QueuedFrame) -> Result<()> {
        let cost = Self::cost(&frame.payload);
        match self.budget.try_acquire_many(cost) {
            Ok(permit) => {
                permit.forget();
                self.items
                    .try_lock()
                    .map_err(|_| YogiError::TxQueueFull(Some("queue contended".into())))?
                    .push_back(frame);
                self.not_empty.notify_one();
                Ok(())
            }
            Err(_) => Err(YogiError::TxQueueFull(None)),
        }
    }

    async fn pop(&self, cancel: &CancellationToken) -> Option<QueuedFrame> {
        loop {
            if let Some(frame) = self.items.lock().await.pop_front() {
                self.budget.add_permits(Self::cost(&frame.payload) as usize);
                return Some(frame);
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = self.not_empty.notified() => {}
            }
        }
    }

    /// Removes a still-queued frame by op id without paying for the
    /// write; returns it if found.
    async fn remove(&self, op_id: u32) -> Option<QueuedFrame> {
        let mut items = self.items.lock().await;
        let pos = items.iter().position(|f| f.op_id == op_id)?;
        let frame = items.remove(pos).unwrap();
        self.budget.add_permits(Self::cost(&frame.payload) as usize);
        Some(frame)
    }
}

struct PendingSend {
    op_id: u32,
    completion: oneshot::Sender<Result<()>>,
}

/// Wire message kinds following the 1-byte type tag in §6.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Acknowledge = 1,
    Broadcast = 2,
}

pub struct ReceivedMessage {
    pub kind: MessageKind,
    pub body: Bytes,
    // Held only to release the rx byte budget once the caller is done
    // with the message; never read directly.
    _rx_permit: OwnedSemaphorePermit,
}

/// A running session's framed message channel: one writer task, one
/// reader task, both driven off the shared `FramedTransport`.
pub struct MessageTransport {
    framed: Arc<FramedTransport>,
    send_queue: Arc<SendQueue>,
    pending: Mutex<VecDeque<PendingSend>>,
    rx_budget: Arc<Semaphore>,
    // Wrapped so the reader task can drop the sender on termination;
    // otherwise the channel never closes and `recv()` hangs forever
    // instead of reporting the session as over.
    recv_tx: Mutex<Option<mpsc::UnboundedSender<ReceivedMessage>>>,
    recv_rx: Mutex<mpsc::UnboundedReceiver<ReceivedMessage>>,
    next_op_id: AtomicU32,
    cancel: CancellationToken,
    // First I/O failure observed by either the reader or writer task;
    // surfaced to the owner once `recv()` yields `None` so a timed-out
    // session is reported as `Timeout`, not a generic socket failure.
    failure: std::sync::Mutex<Option<YogiError>>,
}

impl MessageTransport {
    pub fn start(
        framed: Arc<FramedTransport>,
        tx_queue_size: usize,
        rx_queue_size: usize,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (recv_tx, recv_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(MessageTransport {
            framed,
            send_queue: Arc::new(SendQueue::new(tx_queue_size)),
            pending: Mutex::new(VecDeque::new()),
            rx_budget: Arc::new(Semaphore::new(rx_queue_size.max(1))),
            recv_tx: Mutex::new(Some(recv_tx)),
            recv_rx: Mutex::new(recv_rx),
            next_op_id: AtomicU32::new(1),
            cancel,
            failure: std::sync::Mutex::new(None),
        });
        transport.clone().spawn_writer();
        transport.clone().spawn_reader();
        transport.clone().spawn_heartbeat();
        transport
    }

    /// Consumes the recorded reason the session ended, once `recv()`
    /// has yielded `None`. Defaults to `RwSocketFailed` if the reader
    /// stopped without a recorded cause (e.g. during a clean cancel).
    pub fn take_termination_cause(&self) -> YogiError {
        self.failure
            .lock()
            .expect("failure mutex poisoned")
            .take()
            .unwrap_or(YogiError::RwSocketFailed(None))
    }

    fn record_failure(&self, err: YogiError) {
        self.failure.lock().expect("failure mutex poisoned").get_or_insert(err);
    }

    /// Drops the receive sender so pending and future `recv()` calls
    /// observe the session has ended once the backlog is drained.
    async fn close_recv(&self) {
        self.recv_tx.lock().await.take();
    }

    pub fn next_op_id(&self) -> u32 {
        loop {
            let id = self.next_op_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Queues `body` (already encoded, e.g. MsgPack) tagged as
    /// `kind`, returning the op id and a future resolving once the
    /// frame has been written (or canceled/rejected).
    pub async fn send_async(
        &self,
        kind: MessageKind,
        body: Bytes,
        retry: bool,
    ) -> Result<(u32, oneshot::Receiver<Result<()>>)> {
        if body.len() > MAX_MESSAGE_PAYLOAD_SIZE {
            return Err(YogiError::PayloadTooLarge(None));
        }
        let op_id = self.next_op_id();
        let mut framed = BytesMut::with_capacity(1 + body.len());
        framed.extend_from_slice(&[kind as u8]);
        framed.extend_from_slice(&body);
        let payload = framed.freeze();

        let (tx, rx) = oneshot::channel();
        let frame = QueuedFrame { op_id, payload };
        let enqueue_result = if retry {
            self.send_queue.push_retry(frame, &self.cancel).await
        } else {
            self.send_queue.try_push(frame)
        };
        if let Err(e) = enqueue_result {
            let _ = tx.send(Err(e));
            return Ok((op_id, rx));
        }

        self.pending
            .lock()
            .await
            .push_back(PendingSend { op_id, completion: tx });
        Ok((op_id, rx))
    }

    /// Cancels a still-pending send. Completes its future with
    /// `Canceled`; returns `InvalidOperationId` if already completed.
    pub async fn cancel_send(&self, op_id: u32) -> Result<()> {
        let mut pending = self.pending.lock().await;
        let Some(pos) = pending.iter().position(|p| p.op_id == op_id) else {
            return Err(YogiError::InvalidOperationId(None));
        };
        let entry = pending.remove(pos).unwrap();
        drop(pending);
        self.send_queue.remove(op_id).await;
        let _ = entry.completion.send(Err(YogiError::Canceled(None)));
        Ok(())
    }

    pub async fn recv(&self) -> Option<ReceivedMessage> {
        self.recv_rx.lock().await.recv().await
    }

    fn spawn_writer(self: Arc<Self>) {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let Some(frame) = self.send_queue.pop(&cancel).await else {
                    break;
                };
                let mut header = BytesMut::new();
                put_varint(&mut header, frame.payload.len() as u64);
                let write_result = async {
                    self.framed.write_all(&header).await?;
                    self.framed.write_all(&frame.payload).await
                }
                .await;

                let mut pending = self.pending.lock().await;
                if let Some(pos) = pending.iter().position(|p| p.op_id == frame.op_id) {
                    let entry = pending.remove(pos).unwrap();
                    let _ = entry.completion.send(clone_result(&write_result));
                }
                drop(pending);
                if let Err(e) = write_result {
                    debug!("message transport write failed, stopping writer: {e}");
                    self.record_failure(e);
                    break;
                }
            }
        });
    }

    fn spawn_reader(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                let len = match read_varint_len(&self.framed).await {
                    Ok(len) => len,
                    Err(e) => {
                        debug!("message transport read failed, stopping reader: {e}");
                        self.record_failure(e);
                        self.close_recv().await;
                        return;
                    }
                };

                if len == 0 {
                    trace!("heartbeat received");
                    continue;
                }
                if len > MAX_MESSAGE_PAYLOAD_SIZE + 1 {
                    debug!("dropping oversized frame of {len} bytes");
                    self.record_failure(YogiError::DeserializeMsgFailed(Some(
                        "frame exceeds maximum payload size".into(),
                    )));
                    self.close_recv().await;
                    return;
                }

                let permit = match self.rx_budget.clone().acquire_many_owned(len as u32).await {
                    Ok(p) => p,
                    Err(_) => {
                        self.close_recv().await;
                        return;
                    }
                };

                let mut body = vec![0u8; len];
                if let Err(e) = self.framed.read_exact(&mut body).await {
                    self.record_failure(e);
                    self.close_recv().await;
                    return;
                }
                let kind = match body[0] {
                    1 => MessageKind::Acknowledge,
                    2 => MessageKind::Broadcast,
                    other => {
                        debug!("unknown message kind {other}");
                        continue;
                    }
                };
                let msg = ReceivedMessage {
                    kind,
                    body: Bytes::copy_from_slice(&body[1..]),
                    _rx_permit: permit,
                };
                let sent = match self.recv_tx.lock().await.as_ref() {
                    Some(tx) => tx.send(msg).is_ok(),
                    None => false,
                };
                if !sent {
                    self.close_recv().await;
                    return;
                }
            }
        });
    }

    /// Sends a zero-length heartbeat frame every half-timeout interval,
    /// and checks the watchdog first: a peer that has stopped reading
    /// can still accept writes into its kernel socket buffer for a
    /// while, so a successful `write_all` alone doesn't prove the
    /// session is alive.
    fn spawn_heartbeat(self: Arc<Self>) {
        let Some(timeout) = self.framed.timeout() else {
            return;
        };
        let interval = (timeout / 2).max(Duration::from_millis(1));
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if self.framed.is_stale().await {
                            debug!("message transport idle past the inactivity timeout, stopping");
                            self.record_failure(YogiError::Timeout(Some(
                                "no read or write activity within inactivity timeout".into(),
                            )));
                            self.close_recv().await;
                            return;
                        }
                        let mut header = BytesMut::new();
                        put_varint(&mut header, 0);
                        if self.framed.write_all(&header).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }
}

fn clone_result(result: &Result<()>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) => Err(YogiError::RwSocketFailed(Some(e.to_string()))),
    }
}

async fn read_varint_len(framed: &FramedTransport) -> Result<usize> {
    let mut raw_len: Vec<u8> = Vec::with_capacity(1);
    loop {
        let mut byte = [0u8; 1];
        framed.read_exact(&mut byte).await?;
        raw_len.push(byte[0]);
        if byte[0] & 0x80 == 0 {
            let mut slice = raw_len.as_slice();
            return get_varint(&mut slice)
                .map(|v| v as usize)
                .map_err(|_| YogiError::DeserializeMsgFailed(Some("invalid frame length varint".into())));
        }
        if raw_len.len() > 5 {
            return Err(YogiError::DeserializeMsgFailed(Some(
                "frame length varint too long".into(),
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accept, connect) = tokio::join!(listener.accept(), connect);
        (accept.unwrap().0, connect.unwrap())
    }

    async fn transport_pair(
        tx_queue_size: usize,
        rx_queue_size: usize,
    ) -> (Arc<MessageTransport>, Arc<MessageTransport>, CancellationToken) {
        let (a, b) = loopback_pair().await;
        let fa = Arc::new(FramedTransport::new(a, None, None).unwrap());
        let fb = Arc::new(FramedTransport::new(b, None, None).unwrap());
        let cancel = CancellationToken::new();
        let ta = MessageTransport::start(fa, tx_queue_size, rx_queue_size, cancel.clone());
        let tb = MessageTransport::start(fb, tx_queue_size, rx_queue_size, cancel.clone());
        (ta, tb, cancel)
    }

    #[tokio::test]
    async fn broadcast_round_trips_over_loopback() {
        let (ta, tb, cancel) = transport_pair(35_000, 35_000).await;

        let payload = Bytes::from_static(b"\x81\xa1k\x2a");
        let (_op, completion) = ta
            .send_async(MessageKind::Broadcast, payload.clone(), true)
            .await
            .unwrap();
        completion.await.unwrap().unwrap();

        let received = tb.recv().await.unwrap();
        assert_eq!(received.kind, MessageKind::Broadcast);
        assert_eq!(received.body, payload);
        cancel.cancel();
    }

    #[tokio::test]
    async fn cancel_after_completion_is_invalid_operation_id() {
        let (ta, _tb, cancel) = transport_pair(35_000, 35_000).await;

        let (op, completion) = ta
            .send_async(MessageKind::Broadcast, Bytes::from_static(b"x"), true)
            .await
            .unwrap();
        completion.await.unwrap().unwrap();
        let err = ta.cancel_send(op).await.unwrap_err();
        assert!(matches!(err, YogiError::InvalidOperationId(_)));
        cancel.cancel();
    }

    #[tokio::test]
    async fn no_retry_send_fails_fast_when_queue_saturated() {
        // One 41-byte frame (1-byte kind tag + 40-byte body) fits the
        // 50-byte budget; a second one does not, so it must fail
        // immediately instead of blocking the caller.
        let (ta, _tb, cancel) = transport_pair(50, 35_000).await;
        let body = Bytes::from(vec![7u8; 40]);
        let (_op, first) = ta
            .send_async(MessageKind::Broadcast, body.clone(), false)
            .await
            .unwrap();
        let (_op2, second) = ta
            .send_async(MessageKind::Broadcast, body, false)
            .await
            .unwrap();
        let second_result = second.await.unwrap();
        assert!(matches!(second_result, Err(YogiError::TxQueueFull(_))));
        let _ = first.await;
        cancel.cancel();
    }

    #[tokio::test]
    async fn recv_ends_and_reports_timeout_when_peer_goes_silent() {
        let (a, b) = loopback_pair().await;
        let fa = Arc::new(FramedTransport::new(a, Some(Duration::from_millis(30)), None).unwrap());
        std::mem::forget(b);
        let cancel = CancellationToken::new();
        let ta = MessageTransport::start(fa, 35_000, 35_000, cancel.clone());

        assert!(ta.recv().await.is_none());
        assert!(matches!(ta.take_termination_cause(), YogiError::Timeout(_)));
        cancel.cancel();
    }
}
