//! Top-level object composing the advertising, listening, connection
//! management and broadcast components; the public embedder contract
//! (§4.J).

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::branch_info::BranchInfo;
use crate::broadcast::{BroadcastFabric, SendSummary};
use crate::config::BranchConfig;
use crate::error::Result;
use crate::executor::Executor;
use crate::manager::{BranchEvent, ConnectionManager};
use crate::payload::Encoding;

pub struct Branch {
    cfg: Arc<BranchConfig>,
    manager: Arc<ConnectionManager>,
    broadcasts: Arc<BroadcastFabric>,
    executor: Arc<Executor>,
    tcp_port: u16,
}

impl Branch {
    /// Validates `config`, binds the listener and advertising
    /// sockets, and starts discovery. Returns the running branch and
    /// the TCP port it bound to.
    pub async fn create(config: BranchConfig) -> Result<Self> {
        let cfg = Arc::new(config);
        let executor = Arc::new(Executor::new());

        // Placeholder address; filled in once the listener binds.
        let placeholder: SocketAddr = "0.0.0.0:0".parse().unwrap();
        let local_info = BranchInfo::local(&cfg, placeholder);

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(cfg.clone(), local_info, executor.clone(), incoming_tx);
        let tcp_port = manager.start().await?;
        let broadcasts = BroadcastFabric::new(manager.clone(), executor.clone(), incoming_rx);

        Ok(Branch {
            cfg,
            manager,
            broadcasts,
            executor,
            tcp_port,
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.cfg.uuid
    }

    pub fn tcp_port(&self) -> u16 {
        self.tcp_port
    }

    pub fn info(&self) -> BranchInfo {
        self.manager.local_info_snapshot()
    }

    pub async fn connected_branches(&self) -> Vec<(Uuid, BranchInfo)> {
        self.manager.connected_branches().await
    }

    pub async fn await_event(&self, mask: u32) -> oneshot::Receiver<Result<BranchEvent>> {
        self.manager.await_event(mask).await
    }

    pub async fn cancel_await_event(&self) {
        self.manager.cancel_await_event().await
    }

    pub async fn send_broadcast(
        &self,
        encoding: Encoding,
        payload: &[u8],
        retry: bool,
    ) -> Result<(u32, oneshot::Receiver<Result<SendSummary>>)> {
        self.broadcasts.send_broadcast(encoding, payload, retry).await
    }

    /// Synchronous variant that waits for all sessions to accept or
    /// decline before returning the summary.
    pub async fn send_broadcast_blocking(
        &self,
        encoding: Encoding,
        payload: &[u8],
    ) -> Result<SendSummary> {
        let (_op_id, rx) = self.broadcasts.send_broadcast(encoding, payload, true).await?;
        rx.await.map_err(|_| crate::error::YogiError::Canceled(None))?
    }

    pub async fn cancel_send_broadcast(&self, op_id: u32) -> Result<()> {
        self.broadcasts.cancel_send_broadcast(op_id).await
    }

    pub async fn receive_broadcast(
        &self,
        encoding: Encoding,
        buffer: Vec<u8>,
    ) -> oneshot::Receiver<Result<(Uuid, Vec<u8>, bool)>> {
        self.broadcasts.receive_broadcast(encoding, buffer).await
    }

    pub async fn cancel_receive_broadcast(&self) {
        self.broadcasts.cancel_receive_broadcast().await
    }

    /// Stops every component, cancels all pending callbacks with
    /// `Canceled`, and releases resources. Every background task in
    /// the manager and broadcast fabric was spawned through `executor`,
    /// so `stop()` followed by `wait_for_stopped()` only returns once
    /// they have all actually exited.
    pub async fn destroy(self) {
        self.manager.cancel_await_event().await;
        self.broadcasts.cancel_receive_broadcast().await;
        self.executor.stop();
        self.executor.wait_for_stopped().await;
    }
}
