//! Periodic UDP multicast beacons announcing this branch's UUID and
//! TCP listen port (§4.D).

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::branch_info::encode_advertisement;
use crate::error::Result;

pub struct AdvertisingSender {
    sockets: Vec<UdpSocket>,
    target: SocketAddr,
    interval: Duration,
    datagram: Vec<u8>,
}

impl AdvertisingSender {
    pub fn new(
        interface_addrs: &[IpAddr],
        advertising_address: IpAddr,
        advertising_port: u16,
        interval: Duration,
        uuid: Uuid,
        tcp_port: u16,
    ) -> Result<Self> {
        let mut sockets = Vec::new();
        for &iface in interface_addrs {
            match crate::sockets::bind_multicast_sender(iface, advertising_address) {
                Ok(socket) => sockets.push(socket),
                Err(e) => warn!("failed to prepare advertising socket on {iface}: {e}"),
            }
        }
        Ok(AdvertisingSender {
            sockets,
            target: SocketAddr::new(advertising_address, advertising_port),
            interval,
            datagram: encode_advertisement(uuid, tcp_port).to_vec(),
        })
    }

    /// Runs until `cancel` fires, sending the advertisement on every
    /// prepared interface socket at `interval`. A send failure on one
    /// interface is logged but never stops the others.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    for socket in &self.sockets {
                        if let Err(e) = socket.send_to(&self.datagram, self.target).await {
                            warn!("advertising send failed: {e}");
                        }
                    }
                }
            }
        }
    }
}
