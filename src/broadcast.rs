//! Fan-out of outgoing user broadcasts across all running sessions;
//! fan-in of incoming broadcasts to a single receive slot (§4.I).

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex};
use uuid::Uuid;

use crate::error::{Result, YogiError};
use crate::executor::Executor;
use crate::manager::ConnectionManager;
use crate::payload::{self, Encoding};
use crate::transport::MessageKind;

/// Summary result of a `send_broadcast` once every targeted session
/// has accepted or declined the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendSummary {
    Success,
    TxQueueFull,
}

struct PendingSend {
    op_id: u32,
    cancel: tokio_util::sync::CancellationToken,
}

struct ReceiveSlot {
    encoding: Encoding,
    buffer: Vec<u8>,
    sender: oneshot::Sender<Result<(Uuid, Vec<u8>, bool)>>,
}

pub struct BroadcastFabric {
    manager: Arc<ConnectionManager>,
    executor: Arc<Executor>,
    incoming_rx: Mutex<mpsc::UnboundedReceiver<(Uuid, Bytes)>>,
    receive_slot: Mutex<Option<ReceiveSlot>>,
    pending_sends: Mutex<Vec<PendingSend>>,
}

impl BroadcastFabric {
    pub fn new(
        manager: Arc<ConnectionManager>,
        executor: Arc<Executor>,
        incoming_rx: mpsc::UnboundedReceiver<(Uuid, Bytes)>,
    ) -> Arc<Self> {
        let fabric = Arc::new(BroadcastFabric {
            manager,
            executor,
            incoming_rx: Mutex::new(incoming_rx),
            receive_slot: Mutex::new(None),
            pending_sends: Mutex::new(Vec::new()),
        });
        fabric.clone().spawn_dispatch_loop();
        fabric
    }

    fn spawn_dispatch_loop(self: Arc<Self>) {
        self.executor.clone().spawn(async move {
            loop {
                let next = { self.incoming_rx.lock().await.recv().await };
                let Some((source_uuid, wire_body)) = next else {
                    return;
                };
                let mut slot_guard = self.receive_slot.lock().await;
                let Some(mut slot) = slot_guard.take() else {
                    // No pending receive_broadcast: best-effort, drop it.
                    continue;
                };
                drop(slot_guard);

                let result = payload::decode_for_receiver(slot.encoding, &wire_body, &mut slot.buffer)
                    .map(|(n, truncated)| {
                        let mut buf = std::mem::take(&mut slot.buffer);
                        buf.truncate(n);
                        (source_uuid, buf, truncated)
                    });
                let _ = slot.sender.send(result);
            }
        });
    }

    /// Encodes `payload` (in `encoding`) and hands it to every
    /// `Running` session, returning the assigned op id immediately;
    /// `on_done` is intended to be awaited by the caller via the
    /// returned receiver.
    pub async fn send_broadcast(
        self: &Arc<Self>,
        encoding: Encoding,
        payload_bytes: &[u8],
        retry: bool,
    ) -> Result<(u32, oneshot::Receiver<Result<SendSummary>>)> {
        let op_id = self.manager.next_operation_id();
        let wire = payload::encode_for_wire(encoding, payload_bytes)?;
        let wire = Bytes::from(wire);

        let (done_tx, done_rx) = oneshot::channel();
        let transports = self.manager.running_transports().await;

        if transports.is_empty() {
            let _ = done_tx.send(Ok(SendSummary::Success));
            return Ok((op_id, done_rx));
        }

        let cancel = tokio_util::sync::CancellationToken::new();
        self.pending_sends.lock().await.push(PendingSend {
            op_id,
            cancel: cancel.clone(),
        });

        let fabric = self.clone();
        let op_cancel = cancel.clone();
        let executor = fabric.executor.clone();
        executor.spawn(async move {
            let run = async {
                let mut any_queue_full = false;
                let mut completions = Vec::new();
                for (_uuid, transport) in &transports {
                    match transport
                        .send_async(MessageKind::Broadcast, wire.clone(), retry)
                        .await
                    {
                        Ok((_sub_op, rx)) => completions.push(rx),
                        Err(_) => any_queue_full = true,
                    }
                }
                for rx in completions {
                    match rx.await {
                        Ok(Ok(())) => {}
                        Ok(Err(YogiError::TxQueueFull(_))) => any_queue_full = true,
                        Ok(Err(_)) | Err(_) => {}
                    }
                }
                if any_queue_full {
                    SendSummary::TxQueueFull
                } else {
                    SendSummary::Success
                }
            };

            let result = tokio::select! {
                biased;
                _ = op_cancel.cancelled() => Err(YogiError::Canceled(None)),
                summary = run => Ok(summary),
            };
            let _ = done_tx.send(result);
            fabric.remove_pending(op_id).await;
        });

        Ok((op_id, done_rx))
    }

    async fn remove_pending(&self, op_id: u32) {
        self.pending_sends.lock().await.retain(|p| p.op_id != op_id);
    }

    pub async fn cancel_send_broadcast(&self, op_id: u32) -> Result<()> {
        let mut pending = self.pending_sends.lock().await;
        let Some(pos) = pending.iter().position(|p| p.op_id == op_id) else {
            return Err(YogiError::InvalidOperationId(None));
        };
        let entry = pending.remove(pos);
        entry.cancel.cancel();
        Ok(())
    }

    /// Registers the single pending receive slot; a second call
    /// before delivery cancels the first with `Canceled`. `buffer`
    /// is filled in place and handed back with the completion,
    /// truncated to the number of bytes actually written.
    pub async fn receive_broadcast(
        &self,
        encoding: Encoding,
        buffer: Vec<u8>,
    ) -> oneshot::Receiver<Result<(Uuid, Vec<u8>, bool)>> {
        let (tx, rx) = oneshot::channel();
        let mut slot = self.receive_slot.lock().await;
        if let Some(prev) = slot.take() {
            let _ = prev.sender.send(Err(YogiError::Canceled(None)));
        }
        *slot = Some(ReceiveSlot {
            encoding,
            buffer,
            sender: tx,
        });
        rx
    }

    pub async fn cancel_receive_broadcast(&self) {
        let mut slot = self.receive_slot.lock().await;
        if let Some(prev) = slot.take() {
            let _ = prev.sender.send(Err(YogiError::Canceled(None)));
        }
    }
}
