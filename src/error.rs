use crate::server::ServerAddr;
use bitcoin::Txid;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Tls(#[from] native_tls::Error),

    #[error(transparent)]
    Socks(#[from] tokio_socks::Error),

    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Bitcoin(#[from] bitcoin::consensus::encode::Error),

    #[error(transparent)]
    Hex(#[from] hex::FromHexError),

    #[error(transparent)]
    ParseInt(#[from] std::num::ParseIntError),

    #[error("invalid server string: {0}")]
    BadServerString(String),

    #[error("server {server} speaks protocol {version}, too old")]
    VersionTooOld { server: ServerAddr, version: String },

    #[error("handshake with {server} failed: {reason}")]
    HandshakeFailed { server: ServerAddr, reason: String },

    #[error("pinned certificate for {host} does not match the one presented")]
    CertMismatch { host: String },

    #[error("server returned RPC error code:{code} message:{message}")]
    Rpc { code: i64, message: String },

    #[error("request timed out")]
    Timeout,

    #[error("session closed")]
    SessionClosed,

    #[error("no main interface")]
    NotConnected,

    #[error("unexpected notification payload for {method}")]
    BadNotification { method: String },

    #[error("server sent malformed headers chunk at index {0}")]
    BadChunk(u32),

    #[error("received tx does not match expected txid ({expected} != {got})")]
    TxidMismatch { expected: Txid, got: Txid },

    #[error("no blockchain with forkpoint {0}")]
    ChainNotFound(u32),
}
