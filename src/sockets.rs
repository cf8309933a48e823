//! Low-level multicast socket setup shared by the advertising sender
//! and receiver. `socket2` is used because `tokio::net::UdpSocket`
//! does not expose per-interface multicast selection.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::error::{Result, YogiError};

/// A socket bound to `iface`'s ephemeral port with its outgoing
/// multicast interface set to `iface`, ready to send to
/// `advertising_address`.
pub fn bind_multicast_sender(iface: IpAddr, advertising_address: IpAddr) -> Result<UdpSocket> {
    let domain = if advertising_address.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| YogiError::OpenSocketFailed(Some(e.to_string())))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| YogiError::OpenSocketFailed(Some(e.to_string())))?;

    let bind_addr = SocketAddr::new(iface, 0);
    socket
        .bind(&bind_addr.into())
        .map_err(|e| YogiError::BindSocketFailed(Some(e.to_string())))?;

    match (iface, advertising_address) {
        (IpAddr::V4(ifv4), IpAddr::V4(_)) => {
            socket
                .set_multicast_if_v4(&ifv4)
                .map_err(|e| YogiError::JoinMulticastGroupFailed(Some(e.to_string())))?;
        }
        (IpAddr::V6(_), IpAddr::V6(_)) => {
            socket
                .set_multicast_if_v6(0)
                .map_err(|e| YogiError::JoinMulticastGroupFailed(Some(e.to_string())))?;
        }
        _ => {
            return Err(YogiError::InvalidParam(Some(
                "interface and advertising address must be the same IP family".into(),
            )))
        }
    }

    socket
        .set_nonblocking(true)
        .map_err(|e| YogiError::OpenSocketFailed(Some(e.to_string())))?;
    UdpSocket::from_std(socket.into())
        .map_err(|e| YogiError::OpenSocketFailed(Some(e.to_string())))
}

/// A socket bound to the advertising port and joined to the multicast
/// group on `iface`, ready to receive advertisements.
pub fn bind_multicast_receiver(
    iface: IpAddr,
    advertising_address: IpAddr,
    advertising_port: u16,
) -> Result<UdpSocket> {
    let domain = if advertising_address.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| YogiError::OpenSocketFailed(Some(e.to_string())))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| YogiError::OpenSocketFailed(Some(e.to_string())))?;

    let bind_ip = if advertising_address.is_ipv6() {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    };
    let bind_addr = SocketAddr::new(bind_ip, advertising_port);
    socket
        .bind(&bind_addr.into())
        .map_err(|e| YogiError::BindSocketFailed(Some(e.to_string())))?;

    match (iface, advertising_address) {
        (IpAddr::V4(ifv4), IpAddr::V4(groupv4)) => {
            socket
                .join_multicast_v4(&groupv4, &ifv4)
                .map_err(|e| YogiError::JoinMulticastGroupFailed(Some(e.to_string())))?;
        }
        (IpAddr::V6(_), IpAddr::V6(groupv6)) => {
            socket
                .join_multicast_v6(&groupv6, 0)
                .map_err(|e| YogiError::JoinMulticastGroupFailed(Some(e.to_string())))?;
        }
        _ => {
            return Err(YogiError::InvalidParam(Some(
                "interface and advertising address must be the same IP family".into(),
            )))
        }
    }

    socket
        .set_nonblocking(true)
        .map_err(|e| YogiError::OpenSocketFailed(Some(e.to_string())))?;
    UdpSocket::from_std(socket.into())
        .map_err(|e| YogiError::OpenSocketFailed(Some(e.to_string())))
}
