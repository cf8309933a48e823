//! Owns Branch Connection instances; arbitrates duplicate/simultaneous
//! connects; blacklists incompatible peers; publishes branch events
//! (§4.H).

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::advertising::receiver::BranchObserved;
use crate::advertising::{AdvertisingReceiver, AdvertisingSender};
use crate::branch_info::BranchInfo;
use crate::config::BranchConfig;
use crate::connection::{self, HandshakeOutcome};
use crate::error::{Result, YogiError};
use crate::executor::Executor;
use crate::listener::TcpListener;
use crate::transport::{FramedTransport, MessageTransport};

pub const EVENT_BRANCH_DISCOVERED: u32 = 1 << 0;
pub const EVENT_BRANCH_QUERIED: u32 = 1 << 1;
pub const EVENT_CONNECT_FINISHED: u32 = 1 << 2;
pub const EVENT_CONNECTION_LOST: u32 = 1 << 3;
pub const EVENT_ALL: u32 = EVENT_BRANCH_DISCOVERED
    | EVENT_BRANCH_QUERIED
    | EVENT_CONNECT_FINISHED
    | EVENT_CONNECTION_LOST;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum BranchEvent {
    #[serde(rename = "branch-discovered")]
    Discovered { uuid: Uuid, tcp_server_address: SocketAddr },
    #[serde(rename = "branch-queried")]
    Queried {
        uuid: Uuid,
        #[serde(flatten)]
        info: Box<BranchInfo>,
    },
    #[serde(rename = "connect-finished")]
    ConnectFinished { uuid: Uuid, result_code: i32 },
    #[serde(rename = "connection-lost")]
    ConnectionLost { uuid: Uuid, result_code: i32 },
}

impl BranchEvent {
    fn mask_bit(&self) -> u32 {
        match self {
            BranchEvent::Discovered { .. } => EVENT_BRANCH_DISCOVERED,
            BranchEvent::Queried { .. } => EVENT_BRANCH_QUERIED,
            BranchEvent::ConnectFinished { .. } => EVENT_CONNECT_FINISHED,
            BranchEvent::ConnectionLost { .. } => EVENT_CONNECTION_LOST,
        }
    }
}

struct RunningConnection {
    message_transport: Arc<MessageTransport>,
    remote_info: BranchInfo,
    created_from_incoming: bool,
}

struct AwaitSlot {
    mask: u32,
    sender: oneshot::Sender<Result<BranchEvent>>,
}

struct ManagerState {
    connections: HashMap<Uuid, RunningConnection>,
    pending_connects: HashSet<Uuid>,
    blacklist: HashSet<Uuid>,
    await_slot: Option<AwaitSlot>,
}

/// Owns everything downstream of discovery: advertising, listening,
/// the connection map, and branch-event delivery.
pub struct ConnectionManager {
    cfg: Arc<BranchConfig>,
    local_info: Arc<StdMutex<BranchInfo>>,
    state: AsyncMutex<ManagerState>,
    executor: Arc<Executor>,
    cancel: CancellationToken,
    next_op_id: AtomicU32,
    incoming_broadcasts: mpsc::UnboundedSender<(Uuid, Bytes)>,
}

impl ConnectionManager {
    pub fn new(
        cfg: Arc<BranchConfig>,
        local_info: BranchInfo,
        executor: Arc<Executor>,
        incoming_broadcasts: mpsc::UnboundedSender<(Uuid, Bytes)>,
    ) -> Arc<Self> {
        let cancel = executor.cancellation_token();
        Arc::new(ConnectionManager {
            cfg,
            local_info: Arc::new(StdMutex::new(local_info)),
            state: AsyncMutex::new(ManagerState {
                connections: HashMap::new(),
                pending_connects: HashSet::new(),
                blacklist: HashSet::new(),
                await_slot: None,
            }),
            executor,
            cancel,
            next_op_id: AtomicU32::new(1),
            incoming_broadcasts,
        })
    }

    pub fn next_operation_id(&self) -> u32 {
        loop {
            let id = self.next_op_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    pub async fn connected_branches(&self) -> Vec<(Uuid, BranchInfo)> {
        let state = self.state.lock().await;
        state
            .connections
            .iter()
            .map(|(uuid, c)| (*uuid, c.remote_info.clone()))
            .collect()
    }

    /// Returns every currently `Running` session's message transport,
    /// used by the broadcast fabric to fan out a send.
    pub async fn running_transports(&self) -> Vec<(Uuid, Arc<MessageTransport>)> {
        let state = self.state.lock().await;
        state
            .connections
            .iter()
            .map(|(uuid, c)| (*uuid, c.message_transport.clone()))
            .collect()
    }

    pub async fn await_event(self: &Arc<Self>, mask: u32) -> oneshot::Receiver<Result<BranchEvent>> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().await;
        if let Some(prev) = state.await_slot.take() {
            let _ = prev.sender.send(Err(YogiError::Canceled(None)));
        }
        state.await_slot = Some(AwaitSlot { mask, sender: tx });
        rx
    }

    pub async fn cancel_await_event(&self) {
        let mut state = self.state.lock().await;
        if let Some(prev) = state.await_slot.take() {
            let _ = prev.sender.send(Err(YogiError::Canceled(None)));
        }
    }

    async fn emit(&self, event: BranchEvent) {
        let level_name = match &event {
            BranchEvent::Discovered { uuid, .. } => {
                debug!(%uuid, "branch discovered");
                "discovered"
            }
            BranchEvent::Queried { uuid, .. } => {
                info!(%uuid, "branch queried");
                "queried"
            }
            BranchEvent::ConnectFinished { uuid, result_code } => {
                info!(%uuid, result_code, "connect finished");
                "connect-finished"
            }
            BranchEvent::ConnectionLost { uuid, result_code } => {
                warn!(%uuid, result_code, "connection lost");
                "connection-lost"
            }
        };
        let bit = event.mask_bit();
        let mut state = self.state.lock().await;
        if let Some(slot) = &state.await_slot {
            if slot.mask & bit != 0 {
                let slot = state.await_slot.take().unwrap();
                let _ = slot.sender.send(Ok(event));
                return;
            }
        }
        debug!(kind = level_name, "no matching await_event subscriber, dropping");
    }

    /// Starts advertising, listening, and the discovery-driven dial
    /// loop. Returns the bound TCP port.
    pub async fn start(self: &Arc<Self>) -> Result<u16> {
        let interface_addrs = crate::advertising::resolve_interfaces(&self.cfg.advertising_interfaces)?;

        let listener = TcpListener::bind(&interface_addrs, 0)?;
        let tcp_port = listener.local_addr().port();
        {
            let mut info = self.local_info.lock().expect("local info lock poisoned");
            info.tcp_server_address = Some(SocketAddr::new(interface_addrs[0], tcp_port));
        }

        let (accept_tx, mut accept_rx) = mpsc::unbounded_channel();
        let accept_cancel = self.cancel.clone();
        self.executor.spawn(listener.run(accept_tx, accept_cancel));

        let this = self.clone();
        self.executor.spawn(async move {
            while let Some((stream, _addr)) = accept_rx.recv().await {
                let this = this.clone();
                this.executor.spawn(async move {
                    this.handle_incoming(stream).await;
                });
            }
        });

        if let Some(interval) = self.cfg.advertising_interval {
            let local_uuid = self.cfg.uuid;
            let sender = AdvertisingSender::new(
                &interface_addrs,
                self.cfg.advertising_address,
                self.cfg.advertising_port,
                interval,
                local_uuid,
                tcp_port,
            )?;
            self.executor.spawn(sender.run(self.cancel.clone()));
        }

        let receiver = AdvertisingReceiver::new(
            &interface_addrs,
            self.cfg.advertising_address,
            self.cfg.advertising_port,
            self.cfg.uuid,
        )?;
        let (obs_tx, mut obs_rx) = mpsc::unbounded_channel();
        self.executor.spawn(receiver.run(obs_tx, self.cancel.clone()));

        let this = self.clone();
        self.executor.spawn(async move {
            while let Some(observed) = obs_rx.recv().await {
                let this = this.clone();
                this.executor.spawn(async move {
                    this.handle_observed(observed).await;
                });
            }
        });

        Ok(tcp_port)
    }

    async fn handle_observed(self: Arc<Self>, observed: BranchObserved) {
        {
            let state = self.state.lock().await;
            if state.blacklist.contains(&observed.uuid) || state.connections.contains_key(&observed.uuid)
            {
                return;
            }
            if state.pending_connects.contains(&observed.uuid) {
                return;
            }
        }

        self.emit(BranchEvent::Discovered {
            uuid: observed.uuid,
            tcp_server_address: observed.tcp_server_address,
        })
        .await;

        {
            let mut state = self.state.lock().await;
            state.pending_connects.insert(observed.uuid);
        }

        let result = self.dial_and_handshake(observed.tcp_server_address).await;
        self.finish_connect(observed.uuid, false, result).await;
    }

    async fn dial_and_handshake(&self, addr: SocketAddr) -> Result<HandshakeOutcome> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| YogiError::ConnectSocketFailed(Some(e.to_string())))?;
        let framed = Arc::new(FramedTransport::new(stream, self.cfg.timeout, self.cfg.transceive_byte_limit)?);
        let local_info = self.local_info.lock().expect("local info lock poisoned").clone();
        connection::run_handshake(framed, &local_info, &self.cfg, &self.cancel).await
    }

    async fn handle_incoming(self: Arc<Self>, stream: TcpStream) {
        let framed = match FramedTransport::new(stream, self.cfg.timeout, self.cfg.transceive_byte_limit) {
            Ok(f) => Arc::new(f),
            Err(e) => {
                warn!("failed to wrap incoming socket: {e}");
                return;
            }
        };
        let local_info = self.local_info.lock().expect("local info lock poisoned").clone();
        let result = connection::run_handshake(framed, &local_info, &self.cfg, &self.cancel).await;
        let uuid = match &result {
            Ok(HandshakeOutcome::Running { remote_info, .. }) => remote_info.uuid,
            Ok(HandshakeOutcome::GhostObserved { remote_info }) => remote_info.uuid,
            Err(e) => {
                debug!("incoming handshake failed before info exchange: {e}");
                return;
            }
        };
        self.finish_connect(uuid, true, result).await;
    }

    /// Called once a handshake attempt settles, with `uuid` carrying
    /// the identity that initiated it: the advertised uuid for an
    /// outbound dial, or the handshake's own resolved uuid for an
    /// inbound accept (no advertisement to compare against there).
    async fn finish_connect(
        self: &Arc<Self>,
        uuid: Uuid,
        created_from_incoming: bool,
        result: Result<HandshakeOutcome>,
    ) {
        {
            let mut state = self.state.lock().await;
            state.pending_connects.remove(&uuid);
        }

        match result {
            Err(e) => {
                if e.is_fatal_for_peer() {
                    let mut state = self.state.lock().await;
                    state.blacklist.insert(uuid);
                }
                self.emit(BranchEvent::ConnectFinished {
                    uuid,
                    result_code: e.code(),
                })
                .await;
            }
            Ok(HandshakeOutcome::GhostObserved { remote_info }) => {
                let remote_uuid = remote_info.uuid;
                if !verify_uuid_matches_advertisement(uuid, remote_uuid, created_from_incoming) {
                    return;
                }
                self.emit(BranchEvent::Queried {
                    uuid: remote_uuid,
                    info: remote_info.clone(),
                })
                .await;
                let mut state = self.state.lock().await;
                state.blacklist.insert(remote_uuid);
            }
            Ok(HandshakeOutcome::Running { message_transport, remote_info }) => {
                let remote_uuid = remote_info.uuid;
                if !verify_uuid_matches_advertisement(uuid, remote_uuid, created_from_incoming) {
                    return;
                }
                self.emit(BranchEvent::Queried {
                    uuid: remote_uuid,
                    info: remote_info.clone(),
                })
                .await;

                let accepted = self
                    .admit_connection(remote_uuid, created_from_incoming, *remote_info.clone(), message_transport)
                    .await;

                match accepted {
                    Ok(()) => {
                        self.emit(BranchEvent::ConnectFinished {
                            uuid: remote_uuid,
                            result_code: 0,
                        })
                        .await;
                    }
                    Err(e) => {
                        self.emit(BranchEvent::ConnectFinished {
                            uuid: remote_uuid,
                            result_code: e.code(),
                        })
                        .await;
                    }
                }
            }
        }
    }

    /// Performs the compatibility checks and tie-break arbitration,
    /// then inserts the connection into the running map.
    async fn admit_connection(
        self: &Arc<Self>,
        remote_uuid: Uuid,
        created_from_incoming: bool,
        remote_info: BranchInfo,
        message_transport: Arc<MessageTransport>,
    ) -> Result<()> {
        let local_info = self.local_info.lock().expect("local info lock poisoned").clone();
        let mut state = self.state.lock().await;

        let first_time = !state.connections.contains_key(&remote_uuid);
        if first_time {
            if remote_info.network_name != local_info.network_name {
                state.blacklist.insert(remote_uuid);
                return Err(YogiError::NetNameMismatch(None));
            }
            if remote_info.name == local_info.name {
                state.blacklist.insert(remote_uuid);
                return Err(YogiError::DuplicateBranchName(None));
            }
            if remote_info.path == local_info.path {
                state.blacklist.insert(remote_uuid);
                return Err(YogiError::DuplicateBranchPath(None));
            }
            for existing in state.connections.values() {
                if existing.remote_info.name == remote_info.name {
                    return Err(YogiError::DuplicateBranchName(None));
                }
                if existing.remote_info.path == remote_info.path {
                    return Err(YogiError::DuplicateBranchPath(None));
                }
            }
        }

        if let Some(existing) = state.connections.get(&remote_uuid) {
            let existing_keeps = connection::keeps_priority(
                local_info.uuid,
                remote_uuid,
                existing.created_from_incoming,
            );
            if existing_keeps {
                return Err(YogiError::LoopbackConnection(Some(
                    "duplicate connection superseded by existing one".into(),
                )));
            }
        }

        state.connections.insert(
            remote_uuid,
            RunningConnection {
                message_transport: message_transport.clone(),
                remote_info,
                created_from_incoming,
            },
        );
        drop(state);

        let this = self.clone();
        let mt = message_transport;
        self.executor.spawn(async move {
            loop {
                match mt.recv().await {
                    Some(msg) if msg.kind == crate::transport::MessageKind::Broadcast => {
                        let _ = this.incoming_broadcasts.send((remote_uuid, msg.body));
                    }
                    Some(_) => {}
                    None => {
                        let cause = mt.take_termination_cause();
                        this.handle_session_terminated(remote_uuid, cause).await;
                        return;
                    }
                }
            }
        });

        Ok(())
    }

    /// Called by a running session's owning task once its message
    /// transport dies; removes it from the map and emits
    /// connection-lost.
    pub async fn handle_session_terminated(self: &Arc<Self>, uuid: Uuid, cause: YogiError) {
        let removed = {
            let mut state = self.state.lock().await;
            state.connections.remove(&uuid).is_some()
        };
        if removed {
            self.emit(BranchEvent::ConnectionLost {
                uuid,
                result_code: cause.code(),
            })
            .await;
        }
    }

    pub fn local_info_snapshot(&self) -> BranchInfo {
        self.local_info.lock().expect("local info lock poisoned").clone()
    }
}

/// Check #4 from §4.H: for an outbound connection, the uuid the peer
/// reports in its branch info must match the uuid that was advertised
/// and triggered the dial. Inbound connections have no advertisement
/// to compare against and always pass.
fn verify_uuid_matches_advertisement(
    advertised_uuid: Uuid,
    remote_uuid: Uuid,
    created_from_incoming: bool,
) -> bool {
    if created_from_incoming || advertised_uuid == remote_uuid {
        return true;
    }
    warn!(
        %advertised_uuid, %remote_uuid,
        "branch info uuid does not match the advertised uuid, dropping connection"
    );
    false
}
