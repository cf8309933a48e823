//! Listens for advertisement datagrams on the multicast group and
//! yields `(uuid, tcp_endpoint)` observations (§4.E).

use std::net::{IpAddr, SocketAddr};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::branch_info::{decode_advertisement, ADVERTISEMENT_MESSAGE_SIZE};
use crate::error::Result;

pub struct BranchObserved {
    pub uuid: Uuid,
    pub tcp_server_address: SocketAddr,
}

pub struct AdvertisingReceiver {
    sockets: Vec<UdpSocket>,
    local_uuid: Uuid,
}

impl AdvertisingReceiver {
    pub fn new(
        interface_addrs: &[IpAddr],
        advertising_address: IpAddr,
        advertising_port: u16,
        local_uuid: Uuid,
    ) -> Result<Self> {
        let mut sockets = Vec::new();
        for &iface in interface_addrs {
            let socket = crate::sockets::bind_multicast_receiver(
                iface,
                advertising_address,
                advertising_port,
            )?;
            sockets.push(socket);
        }
        Ok(AdvertisingReceiver { sockets, local_uuid })
    }

    /// Runs until `cancel` fires, forwarding valid, non-self
    /// observations on `out`. Malformed datagrams are logged at debug
    /// and dropped; a per-interface socket failure stops only that
    /// socket's loop.
    pub async fn run(self, out: mpsc::UnboundedSender<BranchObserved>, cancel: CancellationToken) {
        let mut tasks = tokio::task::JoinSet::new();
        for socket in self.sockets {
            let out = out.clone();
            let cancel = cancel.clone();
            let local_uuid = self.local_uuid;
            tasks.spawn(async move {
                let mut buf = [0u8; ADVERTISEMENT_MESSAGE_SIZE + 16];
                loop {
                    let (len, from) = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        res = socket.recv_from(&mut buf) => match res {
                            Ok(v) => v,
                            Err(e) => {
                                debug!("advertising receive failed: {e}");
                                return;
                            }
                        },
                    };
                    match decode_advertisement(&buf[..len]) {
                        Ok(adv) if adv.uuid == local_uuid => {
                            // self-advertisement, drop silently
                        }
                        Ok(adv) => {
                            let tcp_server_address = SocketAddr::new(from.ip(), adv.tcp_port);
                            if out
                                .send(BranchObserved {
                                    uuid: adv.uuid,
                                    tcp_server_address,
                                })
                                .is_err()
                            {
                                return;
                            }
                        }
                        Err(e) => debug!("malformed advertisement from {from}: {e}"),
                    }
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }
}
