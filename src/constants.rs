use std::time::Duration;

use once_cell::sync::Lazy;

use crate::server::{Proto, ServerFeatures, ServerMap};

/// Electrum protocol version spoken (and required of peers).
pub const PROTOCOL_VERSION: &str = "1.4";

pub const CLIENT_NAME: &str = concat!("vianet ", env!("CARGO_PKG_VERSION"));

pub const COIN: u64 = 100_000_000;

/// One difficulty epoch, the unit of header backfill.
pub const CHUNK_SIZE: u32 = 2016;

pub const HEADER_SIZE: usize = 80;

/// Number of checkpointed chunks shipped with the client, determines the
/// minimum size of the headers file.
pub const CHECKPOINTS: usize = 500;

/// Confirmation targets (in blocks) for `blockchain.estimatefee`.
pub const FEE_ETA_TARGETS: [u32; 4] = [25, 10, 5, 2];

pub const NODES_RETRY_INTERVAL: Duration = Duration::from_secs(60);
pub const SERVER_RETRY_INTERVAL: Duration = Duration::from_secs(10);
pub const FEE_EST_REFRESH_INTERVAL: Duration = Duration::from_secs(600);
pub const MAINTENANCE_TICK: Duration = Duration::from_millis(100);

/// How long a fresh interface gets to complete TLS + version negotiation.
pub const READY_TIMEOUT: Duration = Duration::from_secs(10);
/// Same, when tunnelled through a proxy.
pub const READY_TIMEOUT_PROXY: Duration = Duration::from_secs(20);

pub const RPC_TIMEOUT: Duration = Duration::from_secs(30);
pub const BROADCAST_TIMEOUT: Duration = Duration::from_secs(10);

pub const MAX_RECENT_SERVERS: usize = 20;

pub fn default_port(proto: Proto) -> u16 {
    match proto {
        Proto::Tcp => 50001,
        Proto::Ssl => 50002,
    }
}

/// Built-in bootstrap servers. Never mutated, merged copies only.
pub static DEFAULT_SERVERS: Lazy<ServerMap> = Lazy::new(|| {
    let mut servers = ServerMap::new();
    for host in [
        "vialectrum.bitops.me",
        "server.vialectrum.org",
        "vialectrum.viacoin.net",
        "electrum.viacoin.xyz",
    ] {
        servers.insert(
            host.to_string(),
            ServerFeatures {
                ports: [(Proto::Tcp, 50001), (Proto::Ssl, 50002)].into_iter().collect(),
                version: Some(PROTOCOL_VERSION.to_string()),
                pruning: "-".to_string(),
            },
        );
    }
    servers
});
