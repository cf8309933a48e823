//! End-to-end scenarios: a broadcast payload round-trips between two
//! sessions preserving JSON value equality, and a saturated send queue
//! rejects a no-retry send while a retried one waits for room and
//! eventually completes.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use yogi_core::error::YogiError;
use yogi_core::payload::{self, Encoding};
use yogi_core::transport::{FramedTransport, MessageKind, MessageTransport};

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
async fn broadcast_payload_preserves_json_value_equality() {
    let (ta, tb, cancel) = transport_pair(35_000, 35_000).await;

    let original = json!({"k": 42});
    let bytes = serde_json::to_vec(&original).unwrap();
    let wire = payload::encode_for_wire(Encoding::Json, &bytes).unwrap();

    let (_op, completion) = ta
        .send_async(MessageKind::Broadcast, Bytes::from(wire), true)
        .await
        .unwrap();
    completion.await.unwrap().unwrap();

    let received = tb.recv().await.unwrap();
    assert_eq!(received.kind, MessageKind::Broadcast);

    let mut out_buf = vec![0u8; 4096];
    let (n, truncated) =
        payload::decode_for_receiver(Encoding::Json, &received.body, &mut out_buf).unwrap();
    assert!(!truncated);
    let decoded: Value = serde_json::from_slice(&out_buf[..n - 1]).unwrap();
    assert_eq!(decoded, original);

    cancel.cancel();
}

#[tokio::test]
async fn no_retry_fails_fast_then_retry_completes_once_drained() {
    // A tiny send budget with B never reading lets us fill the queue
    // deterministically: the non-retry sends below run back-to-back
    // with no await point that would let the writer task drain them.
    let (ta, tb, cancel) = transport_pair(120, 35_000).await;
    let body = Bytes::from(vec![9u8; 50]);

    let mut saw_full = false;
    let mut accepted = Vec::new();
    for _ in 0..6 {
        let (_op, rx) = ta
            .send_async(MessageKind::Broadcast, body.clone(), false)
            .await
            .unwrap();
        accepted.push(rx);
    }
    for rx in accepted {
        if let Ok(Err(YogiError::TxQueueFull(_))) = rx.await {
            saw_full = true;
        }
    }
    assert!(saw_full, "expected at least one tx-queue-full among the burst");

    let (_op, retried) = ta
        .send_async(MessageKind::Broadcast, body, true)
        .await
        .unwrap();

    // Nothing is reading on B yet, but the writer keeps draining as
    // the socket accepts bytes; give the retried send room to land by
    // having B consume the backlog, then confirm it finishes.
    tokio::spawn(async move {
        loop {
            if tb.recv().await.is_none() {
                return;
            }
        }
    });

    tokio::time::timeout(Duration::from_secs(5), retried)
        .await
        .expect("retried send did not complete in time")
        .unwrap()
        .unwrap();

    cancel.cancel();
}
