//! Stable error taxonomy for the branch runtime.
//!
//! Every variant mirrors one of the small negative `YOGI_ERR_*` codes from
//! the original C API (`examples/original_source/yogi-core/include/yogi_core.h`),
//! restricted to the subset the branch runtime can actually raise. Callers
//! match on the variant; `context` is a free-form message for logs only,
//! never part of the contract.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, YogiError>;

#[derive(Debug, Clone, Error)]
pub enum YogiError {
    #[error("invalid parameter{}", context_suffix(.0))]
    InvalidParam(Option<String>),

    #[error("operation canceled{}", context_suffix(.0))]
    Canceled(Option<String>),

    #[error("timed out{}", context_suffix(.0))]
    Timeout(Option<String>),

    #[error("buffer too small{}", context_suffix(.0))]
    BufferTooSmall(Option<String>),

    #[error("failed to open socket{}", context_suffix(.0))]
    OpenSocketFailed(Option<String>),

    #[error("failed to bind socket{}", context_suffix(.0))]
    BindSocketFailed(Option<String>),

    #[error("failed to listen on socket{}", context_suffix(.0))]
    ListenSocketFailed(Option<String>),

    #[error("failed to accept socket{}", context_suffix(.0))]
    AcceptSocketFailed(Option<String>),

    #[error("failed to connect socket{}", context_suffix(.0))]
    ConnectSocketFailed(Option<String>),

    #[error("socket read/write failed{}", context_suffix(.0))]
    RwSocketFailed(Option<String>),

    #[error("invalid magic prefix{}", context_suffix(.0))]
    InvalidMagicPrefix(Option<String>),

    #[error("incompatible protocol version{}", context_suffix(.0))]
    IncompatibleVersion(Option<String>),

    #[error("failed to deserialize message{}", context_suffix(.0))]
    DeserializeMsgFailed(Option<String>),

    #[error("connection is a loopback to self{}", context_suffix(.0))]
    LoopbackConnection(Option<String>),

    #[error("network password mismatch{}", context_suffix(.0))]
    PasswordMismatch(Option<String>),

    #[error("network name mismatch{}", context_suffix(.0))]
    NetNameMismatch(Option<String>),

    #[error("duplicate branch name{}", context_suffix(.0))]
    DuplicateBranchName(Option<String>),

    #[error("duplicate branch path{}", context_suffix(.0))]
    DuplicateBranchPath(Option<String>),

    #[error("payload too large{}", context_suffix(.0))]
    PayloadTooLarge(Option<String>),

    #[error("send queue full{}", context_suffix(.0))]
    TxQueueFull(Option<String>),

    #[error("invalid operation id{}", context_suffix(.0))]
    InvalidOperationId(Option<String>),

    #[error("operation not running{}", context_suffix(.0))]
    OperationNotRunning(Option<String>),

    #[error("invalid user msgpack{}", context_suffix(.0))]
    InvalidUserMsgpack(Option<String>),

    #[error("failed to join multicast group{}", context_suffix(.0))]
    JoinMulticastGroupFailed(Option<String>),

    #[error("failed to enumerate network interfaces{}", context_suffix(.0))]
    EnumerateNetworkInterfacesFailed(Option<String>),
}

fn context_suffix(ctx: &Option<String>) -> String {
    match ctx {
        Some(msg) => format!(": {msg}"),
        None => String::new(),
    }
}

impl YogiError {
    /// The stable negative code a remote API consumer would see.
    ///
    /// Kept for parity with the original error table; nothing in this
    /// crate currently serializes it, but branch events reference the
    /// variant name directly and this keeps the two in lockstep.
    pub fn code(&self) -> i32 {
        match self {
            YogiError::InvalidParam(_) => -4,
            YogiError::Canceled(_) => -7,
            YogiError::Timeout(_) => -9,
            YogiError::BufferTooSmall(_) => -11,
            YogiError::OpenSocketFailed(_) => -12,
            YogiError::BindSocketFailed(_) => -13,
            YogiError::ListenSocketFailed(_) => -14,
            YogiError::RwSocketFailed(_) => -18,
            YogiError::ConnectSocketFailed(_) => -19,
            YogiError::InvalidMagicPrefix(_) => -20,
            YogiError::IncompatibleVersion(_) => -21,
            YogiError::DeserializeMsgFailed(_) => -22,
            YogiError::AcceptSocketFailed(_) => -23,
            YogiError::LoopbackConnection(_) => -24,
            YogiError::PasswordMismatch(_) => -25,
            YogiError::NetNameMismatch(_) => -26,
            YogiError::DuplicateBranchName(_) => -27,
            YogiError::DuplicateBranchPath(_) => -28,
            YogiError::PayloadTooLarge(_) => -29,
            YogiError::TxQueueFull(_) => -41,
            YogiError::InvalidOperationId(_) => -42,
            YogiError::OperationNotRunning(_) => -43,
            YogiError::InvalidUserMsgpack(_) => -44,
            YogiError::JoinMulticastGroupFailed(_) => -45,
            YogiError::EnumerateNetworkInterfacesFailed(_) => -46,
        }
    }

    pub fn invalid_param(msg: impl Into<String>) -> Self {
        YogiError::InvalidParam(Some(msg.into()))
    }

    pub fn is_fatal_for_peer(&self) -> bool {
        matches!(
            self,
            YogiError::NetNameMismatch(_)
                | YogiError::PasswordMismatch(_)
                | YogiError::DuplicateBranchName(_)
                | YogiError::DuplicateBranchPath(_)
        )
    }
}

impl From<std::io::Error> for YogiError {
    fn from(e: std::io::Error) -> Self {
        YogiError::RwSocketFailed(Some(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_original_table() {
        assert_eq!(YogiError::InvalidParam(None).code(), -4);
        assert_eq!(YogiError::TxQueueFull(None).code(), -41);
        assert_eq!(YogiError::EnumerateNetworkInterfacesFailed(None).code(), -46);
    }

    #[test]
    fn fatal_for_peer_classification() {
        assert!(YogiError::PasswordMismatch(None).is_fatal_for_peer());
        assert!(!YogiError::Timeout(None).is_fatal_for_peer());
    }
}
