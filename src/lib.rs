pub use crate::error::Error;
use crate::events::{EventKind, Handler};
use crate::testutils::{MemoryConfig, MemoryHeaderStore};
use clap::Parser;
use lazy_static::lazy_static;
use prometheus::{register_counter_vec, CounterVec};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

pub mod chain;
pub mod config;
pub mod connect;
pub mod constants;
pub mod error;
pub mod events;
pub mod interface;
pub mod network;
pub mod server;
pub mod session;
pub mod sync;
pub mod task;
pub mod testutils;
pub mod wallet;

pub use crate::events::{ConnectionStatus, Event, StatusValue};
pub use crate::network::{Network, NetworkParameters};
pub use crate::server::{Proto, ProxyMode, ProxySpec, ServerAddr};
pub use crate::sync::Synchronizer;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Arguments {
    /// Electrum server to connect to, `host:port:s|t`. Defaults to a
    /// random server from the built-in list.
    #[arg(short, long, env)]
    pub server: Option<String>,

    /// Proxy string `mode:host:port:user:pw`, or "none".
    #[arg(short, long, env)]
    pub proxy: Option<String>,

    /// Where certificates, recent servers and headers are kept. Without it
    /// nothing is persisted.
    #[arg(short, long, env)]
    pub datadir: Option<PathBuf>,

    /// Connect only to the configured server, never to the pool.
    #[arg(long, env, default_value = "false")]
    pub oneserver: bool,

    /// Exclude .onion hosts from server selection.
    #[arg(long, env, default_value = "false")]
    pub noonion: bool,

    /// Follow whichever server has the best chain instead of sticking to
    /// the configured one.
    #[arg(long, env, default_value = "true")]
    pub auto_connect: bool,
}

/// Run the network manager as a console monitor: connect, follow the
/// configured servers and log every event until interrupted.
pub async fn inner_main(args: Arguments) -> Result<(), Error> {
    if let Some(dir) = &args.datadir {
        std::fs::create_dir_all(dir)?;
    }
    let mut store = MemoryConfig::new(args.datadir.clone())
        .with_value("oneserver", args.oneserver.into())
        .with_value("noonion", args.noonion.into())
        .with_value("auto_connect", args.auto_connect.into());
    if let Some(server) = &args.server {
        store = store.with_value("server", server.clone().into());
    }
    if let Some(proxy) = &args.proxy {
        store = store.with_value("proxy", proxy.clone().into());
    }
    let config = Arc::new(config::Config::new(Box::new(store)));
    let headers = Arc::new(MemoryHeaderStore::new(Vec::new()));
    let network = Network::new(config, headers);

    let (tx, mut rx) = mpsc::unbounded_channel();
    network.register_callback(
        Handler::Async(tx),
        &[
            EventKind::Status,
            EventKind::Banner,
            EventKind::Fee,
            EventKind::FeeHistogram,
            EventKind::Updated,
            EventKind::Servers,
            EventKind::Interfaces,
            EventKind::ProxySet,
            EventKind::DefaultServerChanged,
        ],
    );
    network.start();
    log::info!("network started, default server {}", network.get_parameters().server);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = rx.recv() => match event {
                Some(Event::Updated) => {
                    if let Some(StatusValue::Heights { local, server }) =
                        network.get_status_value(EventKind::Updated)
                    {
                        log::info!("updated: local height {local}, server height {server}");
                    }
                }
                Some(event) => log::info!("event: {event:?}"),
                None => break,
            },
        }
    }

    network.stop();
    Ok(())
}

lazy_static! {
    pub(crate) static ref RPC_COUNTER: CounterVec = register_counter_vec!(
        "vianet_rpc_requests",
        "Number of RPC requests sent to electrum servers.",
        &["method"]
    )
    .unwrap();
    pub(crate) static ref SESSION_COUNTER: CounterVec = register_counter_vec!(
        "vianet_sessions",
        "Interface launch outcomes.",
        &["outcome"]
    )
    .unwrap();
}
