//! Branch configuration: parsing and validation of the JSON object a
//! branch is created from.

use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, YogiError};

pub const MIN_TX_QUEUE_SIZE: usize = 35_000;
pub const MAX_TX_QUEUE_SIZE: usize = 10_000_000;
pub const MIN_RX_QUEUE_SIZE: usize = 35_000;
pub const MAX_RX_QUEUE_SIZE: usize = 10_000_000;
pub const MAX_MESSAGE_PAYLOAD_SIZE: usize = 32_768;

pub const DEFAULT_ADV_ADDRESS: &str = "ff02::8000:2439";
pub const DEFAULT_ADV_PORT: u16 = 13531;
pub const DEFAULT_ADV_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(3);

/// Raw JSON shape accepted from the embedder. Every field is optional;
/// missing fields fall back to the documented default.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BranchConfigJson {
    pub name: Option<String>,
    pub description: Option<String>,
    pub path: Option<String>,
    pub network_name: Option<String>,
    pub network_password: Option<String>,
    pub advertising_interfaces: Option<Vec<String>>,
    pub advertising_address: Option<String>,
    pub advertising_port: Option<u16>,
    pub advertising_interval: Option<f64>,
    pub timeout: Option<f64>,
    pub ghost_mode: Option<bool>,
    pub tx_queue_size: Option<usize>,
    pub rx_queue_size: Option<usize>,
    /// Test-only knob; deliberately not documented outside this struct.
    /// `None` means unlimited, matching the original's "infinite" sentinel.
    #[serde(rename = "_transceive_byte_limit")]
    pub transceive_byte_limit: Option<usize>,
}

/// A validated, ready-to-use branch configuration.
#[derive(Debug, Clone)]
pub struct BranchConfig {
    pub uuid: Uuid,
    pub name: String,
    pub description: String,
    pub path: String,
    pub network_name: String,
    pub network_password_hash: [u8; 32],
    pub advertising_interfaces: Vec<String>,
    pub advertising_address: IpAddr,
    pub advertising_port: u16,
    pub advertising_interval: Option<Duration>,
    pub timeout: Option<Duration>,
    pub ghost_mode: bool,
    pub tx_queue_size: usize,
    pub rx_queue_size: usize,
    pub transceive_byte_limit: Option<usize>,
}

impl BranchConfig {
    pub fn from_json(json: BranchConfigJson) -> Result<Self> {
        let uuid = Uuid::new_v4();

        let hostname = hostname_or_fallback();
        let pid = std::process::id();

        let name = json
            .name
            .unwrap_or_else(|| format!("{hostname}:{pid}"));
        let path = json.path.unwrap_or_else(|| format!("/{name}"));
        if !path.starts_with('/') {
            return Err(YogiError::invalid_param("path must start with '/'"));
        }

        let network_name = json.network_name.unwrap_or_else(|| hostname.clone());
        let network_password_hash =
            crate::branch_info::hash_password(json.network_password.as_deref().unwrap_or(""));

        let advertising_interfaces = json
            .advertising_interfaces
            .unwrap_or_else(|| vec!["localhost".to_string()]);

        let advertising_address: IpAddr = json
            .advertising_address
            .as_deref()
            .unwrap_or(DEFAULT_ADV_ADDRESS)
            .parse()
            .map_err(|_| YogiError::invalid_param("advertising_address is not a valid IP"))?;
        if !advertising_address.is_multicast() {
            return Err(YogiError::invalid_param(
                "advertising_address must be a multicast address",
            ));
        }

        let advertising_port = json.advertising_port.unwrap_or(DEFAULT_ADV_PORT);

        let advertising_interval = match json.advertising_interval {
            None => Some(DEFAULT_ADV_INTERVAL),
            Some(s) if s < 0.0 => None,
            Some(s) => Some(Duration::from_secs_f64(s)),
        };

        let timeout = match json.timeout {
            None => Some(DEFAULT_CONNECTION_TIMEOUT),
            Some(s) if s < 0.0 => None,
            Some(s) => Some(Duration::from_secs_f64(s)),
        };

        let tx_queue_size = json.tx_queue_size.unwrap_or(MIN_TX_QUEUE_SIZE);
        if !(MIN_TX_QUEUE_SIZE..=MAX_TX_QUEUE_SIZE).contains(&tx_queue_size) {
            return Err(YogiError::invalid_param(format!(
                "tx_queue_size must be between {MIN_TX_QUEUE_SIZE} and {MAX_TX_QUEUE_SIZE}"
            )));
        }

        let rx_queue_size = json.rx_queue_size.unwrap_or(MIN_RX_QUEUE_SIZE);
        if !(MIN_RX_QUEUE_SIZE..=MAX_RX_QUEUE_SIZE).contains(&rx_queue_size) {
            return Err(YogiError::invalid_param(format!(
                "rx_queue_size must be between {MIN_RX_QUEUE_SIZE} and {MAX_RX_QUEUE_SIZE}"
            )));
        }

        Ok(BranchConfig {
            uuid,
            name,
            description: json.description.unwrap_or_default(),
            path,
            network_name,
            network_password_hash,
            advertising_interfaces,
            advertising_address,
            advertising_port,
            advertising_interval,
            timeout,
            ghost_mode: json.ghost_mode.unwrap_or(false),
            tx_queue_size,
            rx_queue_size,
            transceive_byte_limit: json.transceive_byte_limit,
        })
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let json: BranchConfigJson = serde_json::from_str(s)
            .map_err(|e| YogiError::invalid_param(format!("invalid config JSON: {e}")))?;
        Self::from_json(json)
    }
}

pub(crate) fn hostname_or_fallback() -> String {
    // `hostname` crates pull in platform FFI the rest of this codebase
    // avoids; an env lookup is good enough for the default name/network_name.
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_applied() {
        let cfg = BranchConfig::from_json_str("{}").unwrap();
        assert_eq!(cfg.tx_queue_size, MIN_TX_QUEUE_SIZE);
        assert_eq!(cfg.rx_queue_size, MIN_RX_QUEUE_SIZE);
        assert!(cfg.path.starts_with('/'));
        assert!(!cfg.ghost_mode);
    }

    #[test]
    fn rejects_path_without_leading_slash() {
        let err = BranchConfig::from_json_str(r#"{"path": "no-slash"}"#).unwrap_err();
        assert!(matches!(err, YogiError::InvalidParam(_)));
    }

    #[test]
    fn rejects_out_of_range_queue_size() {
        let err = BranchConfig::from_json_str(r#"{"tx_queue_size": 10}"#).unwrap_err();
        assert!(matches!(err, YogiError::InvalidParam(_)));
    }

    #[test]
    fn rejects_non_multicast_advertising_address() {
        let err =
            BranchConfig::from_json_str(r#"{"advertising_address": "127.0.0.1"}"#).unwrap_err();
        assert!(matches!(err, YogiError::InvalidParam(_)));
    }
}
