//! JSON ⇄ MsgPack payload conversion for broadcast messages (§6).

use serde_json::Value;

use crate::error::{Result, YogiError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Json,
    MsgPack,
}

/// Converts a user-supplied payload into the MsgPack bytes that travel
/// on the wire, regardless of which encoding the caller used.
pub fn encode_for_wire(encoding: Encoding, data: &[u8]) -> Result<Vec<u8>> {
    match encoding {
        Encoding::MsgPack => Ok(data.to_vec()),
        Encoding::Json => {
            let text = std::str::from_utf8(strip_trailing_nul(data))
                .map_err(|_| YogiError::InvalidUserMsgpack(Some("payload is not UTF-8".into())))?;
            let value: Value = serde_json::from_str(text)
                .map_err(|e| YogiError::InvalidUserMsgpack(Some(format!("invalid JSON: {e}"))))?;
            rmp_serde::to_vec_named(&value)
                .map_err(|e| YogiError::InvalidUserMsgpack(Some(format!("msgpack encode: {e}"))))
        }
    }
}

/// Converts wire MsgPack bytes into the encoding the receiver asked
/// for, writing into `buffer` and truncating on overflow per §4.I
/// (JSON truncation preserves NUL termination; MsgPack is a raw cut).
pub fn decode_for_receiver(
    encoding: Encoding,
    wire_msgpack: &[u8],
    buffer: &mut [u8],
) -> Result<(usize, bool)> {
    match encoding {
        Encoding::MsgPack => Ok(copy_truncated(wire_msgpack, buffer, false)),
        Encoding::Json => {
            let value: Value = rmp_serde::from_slice(wire_msgpack).map_err(|e| {
                YogiError::DeserializeMsgFailed(Some(format!("msgpack decode: {e}")))
            })?;
            let mut text = serde_json::to_vec(&value)
                .map_err(|e| YogiError::DeserializeMsgFailed(Some(e.to_string())))?;
            text.push(0);
            Ok(copy_truncated(&text, buffer, true))
        }
    }
}

fn strip_trailing_nul(data: &[u8]) -> &[u8] {
    match data.last() {
        Some(0) => &data[..data.len() - 1],
        _ => data,
    }
}

/// Copies as much of `src` into `dst` as fits; returns `(written,
/// truncated)`. When `nul_terminated`, the last byte written is
/// always NUL on truncation, matching the spec's "preserves NUL
/// termination" requirement for JSON buffers.
fn copy_truncated(src: &[u8], dst: &mut [u8], nul_terminated: bool) -> (usize, bool) {
    if src.len() <= dst.len() {
        dst[..src.len()].copy_from_slice(src);
        return (src.len(), false);
    }
    if nul_terminated && !dst.is_empty() {
        let n = dst.len() - 1;
        dst[..n].copy_from_slice(&src[..n]);
        dst[n] = 0;
    } else {
        dst.copy_from_slice(&src[..dst.len()]);
    }
    (dst.len(), true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_to_msgpack_and_back_preserves_value() {
        let json = br#"{"k":42}"#;
        let wire = encode_for_wire(Encoding::Json, json).unwrap();
        let mut buf = vec![0u8; 4096];
        let (n, truncated) = decode_for_receiver(Encoding::Json, &wire, &mut buf).unwrap();
        assert!(!truncated);
        let roundtripped: Value = serde_json::from_slice(&buf[..n - 1]).unwrap();
        let original: Value = serde_json::from_slice(json).unwrap();
        assert_eq!(roundtripped, original);
    }

    #[test]
    fn msgpack_passthrough_is_identity() {
        let raw = vec![0x93, 0x01, 0x02, 0x03];
        let wire = encode_for_wire(Encoding::MsgPack, &raw).unwrap();
        assert_eq!(wire, raw);
        let mut buf = vec![0u8; raw.len()];
        let (n, truncated) = decode_for_receiver(Encoding::MsgPack, &wire, &mut buf).unwrap();
        assert_eq!(n, raw.len());
        assert!(!truncated);
        assert_eq!(buf, raw);
    }

    #[test]
    fn small_buffer_truncates_and_reports() {
        let raw = vec![1u8; 100];
        let mut buf = vec![0u8; 10];
        let (n, truncated) = copy_truncated(&raw, &mut buf, false);
        assert_eq!(n, 10);
        assert!(truncated);
    }
}
