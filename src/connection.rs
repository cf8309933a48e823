//! State machine driving one peer from raw transport through
//! info-exchange and authentication into a running session (§4.G).

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::branch_info::{
    decode_advertisement, encode_advertisement, minor_is_compatible, put_varint, BranchInfo,
    ADVERTISEMENT_MESSAGE_SIZE, VERSION_MINOR,
};
use crate::config::BranchConfig;
use crate::error::{Result, YogiError};
use crate::transport::framed::FramedTransport;
use crate::transport::message::MessageTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    InfoExchange,
    InfoExchanged,
    Authenticating,
    Running,
    Terminated,
}

pub enum HandshakeOutcome {
    /// Handshake completed and authenticated; the session is ready
    /// for the broadcast fabric.
    Running {
        message_transport: Arc<MessageTransport>,
        remote_info: Box<BranchInfo>,
    },
    /// Remote info was exchanged but one side is in ghost mode, so
    /// authentication is skipped and the connection must be closed
    /// and blacklisted rather than promoted to `Running`.
    GhostObserved { remote_info: Box<BranchInfo> },
}

/// Runs the full `New -> ... -> Running`/`GhostObserved` handshake on
/// a freshly accepted or dialed socket. Any failure along the way is
/// terminal for this connection; the caller (Connection Manager)
/// decides whether to blacklist the peer based on the error kind.
pub async fn run_handshake(
    framed: Arc<FramedTransport>,
    local_info: &BranchInfo,
    cfg: &BranchConfig,
    cancel: &CancellationToken,
) -> Result<HandshakeOutcome> {
    let span = info_span!("connection", peer = %framed.peer_addr());
    async move {
        let remote_info = exchange_info(&framed, local_info).await?;

        if check_loopback(local_info, &remote_info) {
            return Err(YogiError::LoopbackConnection(None));
        }

        if cfg.ghost_mode {
            return Ok(HandshakeOutcome::GhostObserved {
                remote_info: Box::new(remote_info),
            });
        }

        authenticate(&framed, &cfg.network_password_hash, cancel).await?;

        let message_transport = MessageTransport::start(
            framed,
            cfg.tx_queue_size,
            cfg.rx_queue_size,
            cancel.clone(),
        );

        Ok(HandshakeOutcome::Running {
            message_transport,
            remote_info: Box::new(remote_info),
        })
    }
    .instrument(span)
    .await
}

fn check_loopback(local: &BranchInfo, remote: &BranchInfo) -> bool {
    local.uuid == remote.uuid
}

async fn exchange_info(framed: &FramedTransport, local_info: &BranchInfo) -> Result<BranchInfo> {
    let body = local_info.encode_body();
    let local_tcp_port = local_info
        .tcp_server_address
        .map(|a| a.port())
        .unwrap_or(0);
    let header = encode_advertisement(local_info.uuid, local_tcp_port);

    let mut record = BytesMut::with_capacity(header.len() + 8 + body.len());
    record.extend_from_slice(&header);
    put_varint(&mut record, body.len() as u64);
    record.extend_from_slice(&body);

    let write = framed.write_all(&record);

    let mut header_buf = [0u8; ADVERTISEMENT_MESSAGE_SIZE];
    let read_header = async {
        framed.read_exact(&mut header_buf).await?;
        let advertised = decode_advertisement(&header_buf)?;
        if !minor_is_compatible(header_buf[6]) {
            return Err(YogiError::IncompatibleVersion(Some(format!(
                "remote minor {} incompatible with local minor {VERSION_MINOR}",
                header_buf[6]
            ))));
        }

        let body_len = read_varint_from_stream(framed).await?;
        let mut body = vec![0u8; body_len];
        framed.read_exact(&mut body).await?;
        Ok((advertised, body))
    };

    let (write_result, result) = tokio::join!(write, read_header);
    write_result?;
    let (advertised, body) = result?;

    // The info record now carries a 25-byte advertisement-shaped
    // header (magic+version+uuid+port) in front of the varint-prefixed
    // body, so the remote's identity is known directly from this
    // exchange rather than re-derived later against a prior multicast
    // advertisement.
    let remote_addr = SocketAddr::new(framed.peer_addr().ip(), advertised.tcp_port);
    BranchInfo::decode_body(advertised.uuid, remote_addr, &body)
}

async fn read_varint_from_stream(framed: &FramedTransport) -> Result<usize> {
    let mut raw = Vec::with_capacity(1);
    loop {
        let mut byte = [0u8; 1];
        framed.read_exact(&mut byte).await?;
        raw.push(byte[0]);
        if byte[0] & 0x80 == 0 {
            let mut slice = raw.as_slice();
            return crate::branch_info::get_varint(&mut slice).map(|v| v as usize);
        }
        if raw.len() > 5 {
            return Err(YogiError::DeserializeMsgFailed(Some(
                "info record length prefix too long".into(),
            )));
        }
    }
}

async fn authenticate(
    framed: &FramedTransport,
    password_hash: &[u8; 32],
    cancel: &CancellationToken,
) -> Result<()> {
    let mut own_challenge = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut own_challenge);

    let write_challenge = framed.write_all(&own_challenge);
    let mut peer_challenge = [0u8; 8];
    let read_challenge = framed.read_exact(&mut peer_challenge);
    let (w, r) = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(YogiError::Canceled(None)),
        res = futures_join(write_challenge, read_challenge) => res,
    };
    w?;
    r?;

    let own_solution = solve(password_hash, &peer_challenge);
    let write_solution = framed.write_all(&own_solution);
    let mut peer_solution = [0u8; 32];
    let read_solution = framed.read_exact(&mut peer_solution);
    let (w, r) = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(YogiError::Canceled(None)),
        res = futures_join(write_solution, read_solution) => res,
    };
    w?;
    r?;

    let expected = solve(password_hash, &own_challenge);
    if peer_solution != expected.as_slice() {
        return Err(YogiError::PasswordMismatch(None));
    }
    Ok(())
}

async fn futures_join<A, B, T, U>(a: A, b: B) -> (Result<T>, Result<U>)
where
    A: std::future::Future<Output = Result<T>>,
    B: std::future::Future<Output = Result<U>>,
{
    tokio::join!(a, b)
}

fn solve(password_hash: &[u8; 32], challenge: &[u8; 8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(password_hash);
    hasher.update(challenge);
    hasher.finalize().to_vec()
}

/// Deterministic tie-break for simultaneous dial/accept races: the
/// side created from an inbound connection keeps it exactly when the
/// remote uuid is less than the local uuid.
pub fn keeps_priority(local_uuid: Uuid, remote_uuid: Uuid, created_from_incoming: bool) -> bool {
    (remote_uuid < local_uuid) == created_from_incoming
}
