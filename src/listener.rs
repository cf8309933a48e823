//! Binds to the configured interfaces and accepts inbound branch
//! connections (§4.F).

use std::net::{IpAddr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::error::{Result, YogiError};

pub struct TcpListener {
    listener: TokioTcpListener,
    local_addr: SocketAddr,
}

impl TcpListener {
    /// Binds the first of `interface_addrs` (ephemeral port by
    /// default, `SO_REUSEADDR` set) and reports the chosen address.
    pub fn bind(interface_addrs: &[IpAddr], requested_port: u16) -> Result<Self> {
        let iface = *interface_addrs
            .first()
            .ok_or_else(|| YogiError::invalid_param("no advertising interface to bind to"))?;
        let domain = if iface.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| YogiError::OpenSocketFailed(Some(e.to_string())))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| YogiError::OpenSocketFailed(Some(e.to_string())))?;
        socket
            .bind(&SocketAddr::new(iface, requested_port).into())
            .map_err(|e| YogiError::BindSocketFailed(Some(e.to_string())))?;
        socket
            .listen(128)
            .map_err(|e| YogiError::ListenSocketFailed(Some(e.to_string())))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| YogiError::OpenSocketFailed(Some(e.to_string())))?;
        let listener = TokioTcpListener::from_std(socket.into())
            .map_err(|e| YogiError::OpenSocketFailed(Some(e.to_string())))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| YogiError::OpenSocketFailed(Some(e.to_string())))?;
        Ok(TcpListener { listener, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections until `cancel` fires or the underlying
    /// accept call fails. An accept failure is terminal for the
    /// listener (the branch keeps dialing outbound): it is logged at
    /// error severity and the loop exits.
    pub async fn run(self, out: mpsc::UnboundedSender<(TcpStream, SocketAddr)>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        if out.send((stream, addr)).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        error!("branch listener accept failed, stopping: {e}");
                        return;
                    }
                },
            }
        }
    }
}
