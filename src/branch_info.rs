//! Branch identity records and their wire encoding: the advertisement
//! datagram and the info-exchange record (spec'd formats, §6).

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Result, YogiError};

pub const MAGIC: &[u8; 5] = b"YOGI\0";
pub const VERSION_MAJOR: u8 = 0;
pub const VERSION_MINOR: u8 = 1;

/// `magic(5) + major(1) + minor(1) + uuid(16) + port(2)`.
pub const ADVERTISEMENT_MESSAGE_SIZE: usize = 5 + 1 + 1 + 16 + 2;

/// `magic(5) + major(1) + minor(1)`, shared by both wire records.
pub const HEADER_LEN: usize = 7;

pub fn hash_password(password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

/// Identity and capability record for one branch, shared shape for
/// both the local branch and any remote branch it has exchanged info
/// with.
#[derive(Debug, Clone, Serialize)]
pub struct BranchInfo {
    pub uuid: Uuid,
    pub name: String,
    pub description: String,
    pub network_name: String,
    pub path: String,
    pub hostname: String,
    pub pid: u32,
    pub start_time_ns: u64,
    #[serde(skip)]
    pub timeout: Option<Duration>,
    #[serde(skip)]
    pub advertising_interval: Option<Duration>,
    pub ghost_mode: bool,
    pub tcp_server_address: Option<SocketAddr>,
}

impl BranchInfo {
    pub fn local(cfg: &crate::config::BranchConfig, tcp_server_address: SocketAddr) -> Self {
        BranchInfo {
            uuid: cfg.uuid,
            name: cfg.name.clone(),
            description: cfg.description.clone(),
            network_name: cfg.network_name.clone(),
            path: cfg.path.clone(),
            hostname: crate::config::hostname_or_fallback(),
            pid: std::process::id(),
            start_time_ns: crate::time::now_ns(),
            timeout: cfg.timeout,
            advertising_interval: cfg.advertising_interval,
            ghost_mode: cfg.ghost_mode,
            tcp_server_address: Some(tcp_server_address),
        }
    }

    /// Serializes the length-prefixed info-exchange body (without the
    /// shared 7-byte header, which the caller writes separately so it
    /// can be checked before the rest of the record is even buffered).
    pub fn encode_body(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_varstring(&mut buf, &self.name);
        put_varstring(&mut buf, &self.description);
        put_varstring(&mut buf, &self.network_name);
        put_varstring(&mut buf, &self.path);
        put_varstring(&mut buf, &self.hostname);
        buf.put_u32(self.pid);
        buf.put_u64(self.start_time_ns);
        buf.put_u64(duration_to_wire(self.timeout));
        buf.put_u64(duration_to_wire(self.advertising_interval));
        buf.put_u8(self.ghost_mode as u8);
        buf.freeze()
    }

    pub fn decode_body(uuid: Uuid, tcp_server_address: SocketAddr, body: &[u8]) -> Result<Self> {
        let mut buf = body;
        let name = get_varstring(&mut buf)?;
        let description = get_varstring(&mut buf)?;
        let network_name = get_varstring(&mut buf)?;
        let path = get_varstring(&mut buf)?;
        let hostname = get_varstring(&mut buf)?;
        if buf.remaining() < 4 + 8 + 8 + 8 + 1 {
            return Err(YogiError::DeserializeMsgFailed(Some(
                "info record body truncated".into(),
            )));
        }
        let pid = buf.get_u32();
        let start_time_ns = buf.get_u64();
        let timeout = wire_to_duration(buf.get_u64());
        let advertising_interval = wire_to_duration(buf.get_u64());
        let ghost_mode = buf.get_u8() != 0;

        Ok(BranchInfo {
            uuid,
            name,
            description,
            network_name,
            path,
            hostname,
            pid,
            start_time_ns,
            timeout,
            advertising_interval,
            ghost_mode,
            tcp_server_address: Some(tcp_server_address),
        })
    }
}

fn duration_to_wire(d: Option<Duration>) -> u64 {
    match d {
        None => u64::MAX,
        Some(d) => d.as_nanos() as u64,
    }
}

fn wire_to_duration(v: u64) -> Option<Duration> {
    if v == u64::MAX {
        None
    } else {
        Some(Duration::from_nanos(v))
    }
}

fn put_varstring(buf: &mut BytesMut, s: &str) {
    put_varint(buf, s.len() as u64);
    buf.put_slice(s.as_bytes());
}

fn get_varstring(buf: &mut &[u8]) -> Result<String> {
    let len = get_varint(buf)? as usize;
    if buf.len() < len {
        return Err(YogiError::DeserializeMsgFailed(Some(
            "string field truncated".into(),
        )));
    }
    let s = String::from_utf8(buf[..len].to_vec())
        .map_err(|_| YogiError::DeserializeMsgFailed(Some("invalid utf-8 in string field".into())))?;
    buf.advance(len);
    Ok(s)
}

/// Unsigned LEB128, capped at 5 bytes (sufficient for `u32`).
pub fn put_varint(buf: &mut BytesMut, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

pub fn get_varint(buf: &mut &[u8]) -> Result<u64> {
    let mut value: u64 = 0;
    for i in 0..5 {
        if buf.is_empty() {
            return Err(YogiError::DeserializeMsgFailed(Some(
                "varint truncated".into(),
            )));
        }
        let byte = buf[0];
        buf.advance(1);
        value |= ((byte & 0x7f) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(YogiError::DeserializeMsgFailed(Some(
        "varint too long".into(),
    )))
}

/// Encodes the fixed-size 25-byte advertisement datagram.
pub fn encode_advertisement(uuid: Uuid, tcp_port: u16) -> [u8; ADVERTISEMENT_MESSAGE_SIZE] {
    let mut buf = [0u8; ADVERTISEMENT_MESSAGE_SIZE];
    buf[0..5].copy_from_slice(MAGIC);
    buf[5] = VERSION_MAJOR;
    buf[6] = VERSION_MINOR;
    buf[7..23].copy_from_slice(uuid.as_bytes());
    buf[23..25].copy_from_slice(&tcp_port.to_be_bytes());
    buf
}

pub struct Advertisement {
    pub uuid: Uuid,
    pub tcp_port: u16,
}

/// Validates magic and major version, then extracts `(uuid, tcp_port)`.
pub fn decode_advertisement(datagram: &[u8]) -> Result<Advertisement> {
    if datagram.len() != ADVERTISEMENT_MESSAGE_SIZE {
        return Err(YogiError::InvalidMagicPrefix(Some(format!(
            "expected {ADVERTISEMENT_MESSAGE_SIZE} bytes, got {}",
            datagram.len()
        ))));
    }
    check_magic_and_major(&datagram[0..7])?;
    let uuid = Uuid::from_slice(&datagram[7..23]).expect("slice is exactly 16 bytes");
    let tcp_port = u16::from_be_bytes([datagram[23], datagram[24]]);
    Ok(Advertisement { uuid, tcp_port })
}

pub fn check_magic_and_major(header: &[u8]) -> Result<()> {
    if header.len() < HEADER_LEN || &header[0..5] != MAGIC {
        return Err(YogiError::InvalidMagicPrefix(Some(
            "magic prefix mismatch".into(),
        )));
    }
    if header[5] != VERSION_MAJOR {
        return Err(YogiError::IncompatibleVersion(Some(format!(
            "local major {VERSION_MAJOR}, remote major {}",
            header[5]
        ))));
    }
    Ok(())
}

/// Compatibility rule from §4.H: major equal (checked earlier) and
/// remote minor at least the local minor.
pub fn minor_is_compatible(remote_minor: u8) -> bool {
    remote_minor >= VERSION_MINOR
}
