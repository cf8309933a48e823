//! End-to-end scenario: a session whose peer stops responding is
//! declared lost with a timeout cause once the configured inactivity
//! window elapses.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use yogi_core::error::YogiError;
use yogi_core::transport::{FramedTransport, MessageTransport};

async fn loopback_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connect = TcpStream::connect(addr);
    let (accept, connect) = tokio::join!(listener.accept(), connect);
    (accept.unwrap().0, connect.unwrap())
}

/// A session that stops hearing from its peer (simulating an
/// ungraceful process kill, where the socket never sees a clean
/// close) must have its reader give up with `Timeout` once the
/// configured inactivity window elapses, rather than hanging forever.
#[tokio::test]
async fn silent_peer_surfaces_as_timeout() {
    let (a, b) = loopback_pair().await;
    let timeout = Duration::from_millis(200);

    let fa = Arc::new(FramedTransport::new(a, Some(timeout), None).unwrap());
    // `b`'s FramedTransport (and thus its heartbeat task) is dropped
    // without closing the socket gracefully, standing in for a peer
    // process that vanishes mid-session.
    std::mem::forget(b);

    let cancel = CancellationToken::new();
    let ta = MessageTransport::start(fa, 35_000, 35_000, cancel.clone());

    let received = tokio::time::timeout(Duration::from_secs(2), ta.recv())
        .await
        .expect("reader did not give up within twice the inactivity timeout");
    assert!(received.is_none(), "expected the session to end, not deliver a message");

    let cause = ta.take_termination_cause();
    assert!(matches!(cause, YogiError::Timeout(_)), "expected Timeout, got {cause:?}");

    cancel.cancel();
}
