use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bitcoin::{Transaction, Txid};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::chain::{ChainRef, HeaderStore};
use crate::config::Config;
use crate::connect::Connector;
use crate::constants::{
    BROADCAST_TIMEOUT, CHUNK_SIZE, COIN, DEFAULT_SERVERS, FEE_ETA_TARGETS, MAINTENANCE_TICK,
    NODES_RETRY_INTERVAL, READY_TIMEOUT, READY_TIMEOUT_PROXY, SERVER_RETRY_INTERVAL,
};
use crate::error::Error;
use crate::events::{
    CallbackBus, CallbackId, ConnectionStatus, Event, EventKind, Handler, StatusValue,
};
use crate::interface::Interface;
use crate::server::{
    filter_noonion, filter_version, parse_servers, pick_random_server, Proto, ProxySpec,
    RecentServers, ServerAddr, ServerFeatures, ServerMap,
};
use crate::session::RpcSession;
use crate::task::TaskGroup;
use crate::SESSION_COUNTER;

/// User-visible snapshot of the connection configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkParameters {
    pub server: ServerAddr,
    pub proxy: Option<ProxySpec>,
    pub auto_connect: bool,
}

/// Shared header machinery handed to every interface: the store, the lock
/// serializing the header/interface handshake, and the chunk coordinator.
#[derive(Clone)]
pub(crate) struct HeaderSync {
    pub store: Arc<dyn HeaderStore>,
    pub bhi_lock: Arc<tokio::sync::Mutex<()>>,
    pub chunks: Arc<ChunkTracker>,
}

/// Guarantees at most one in-flight `blockchain.block.headers` request per
/// chunk index across the whole manager.
pub(crate) struct ChunkTracker {
    requested: Mutex<HashSet<u32>>,
}

impl ChunkTracker {
    fn new() -> Self {
        Self {
            requested: Mutex::new(HashSet::new()),
        }
    }

    /// `None` means another task already has this epoch in flight and the
    /// caller asked to return early. Otherwise `(connected, count)`.
    pub(crate) async fn request(
        &self,
        session: &RpcSession,
        store: &dyn HeaderStore,
        fork: ChainRef,
        height: u32,
        tip: Option<u32>,
        can_return_early: bool,
    ) -> Result<Option<(bool, u32)>, Error> {
        let index = height / CHUNK_SIZE;
        {
            let mut requested = self.requested.lock().expect("chunk set poisoned");
            if can_return_early && requested.contains(&index) {
                return Ok(None);
            }
            requested.insert(index);
        }
        let result = self.fetch(session, store, fork, index, tip).await;
        self.requested
            .lock()
            .expect("chunk set poisoned")
            .remove(&index);
        result.map(Some)
    }

    async fn fetch(
        &self,
        session: &RpcSession,
        store: &dyn HeaderStore,
        fork: ChainRef,
        index: u32,
        tip: Option<u32>,
    ) -> Result<(bool, u32), Error> {
        let start = index * CHUNK_SIZE;
        let size = match tip {
            Some(tip) => CHUNK_SIZE.min(tip.saturating_sub(start)),
            None => CHUNK_SIZE,
        };
        if size == 0 {
            return Ok((true, 0));
        }
        let res = session
            .send_request("blockchain.block.headers", vec![start.into(), size.into()])
            .await?;
        let hex = res
            .get("hex")
            .and_then(Value::as_str)
            .ok_or(Error::BadChunk(index))?;
        let raw = hex::decode(hex)?;
        if !store.connect_chunk(fork, index, &raw) {
            return Ok((false, 0));
        }
        let count = res
            .get("count")
            .and_then(Value::as_u64)
            .unwrap_or((raw.len() / 80) as u64) as u32;
        Ok((true, count))
    }
}

/// State under the interface lock. Mutations happen with the lock held;
/// events are emitted only after it is released.
struct NetState {
    interfaces: HashMap<ServerAddr, Arc<Interface>>,
    connecting: HashSet<ServerAddr>,
    main_interface: Option<Arc<Interface>>,
    disconnected_servers: HashSet<ServerAddr>,
    default_server: ServerAddr,
    protocol: Proto,
    proxy: Option<ProxySpec>,
    connector: Arc<Connector>,
    socket_tx: mpsc::UnboundedSender<ServerAddr>,
    socket_rx: mpsc::UnboundedReceiver<ServerAddr>,
}

struct RetryTimes {
    server: Instant,
    nodes: Instant,
}

/// The network manager: a pool of interfaces to remote electrum servers,
/// one of which is elected "main" and serves wallet RPCs, banners, fees and
/// header backfill. Supervision, reconnection and churn all happen in
/// `maintain_sessions`.
///
/// `Network` is a cheap-clone handle; every clone drives the same pool.
/// Construct one per process and pass it to whoever needs it, tests tear
/// theirs down with [`NetworkInner::stop`].
#[derive(Clone)]
pub struct Network(Arc<NetworkInner>);

impl Deref for Network {
    type Target = NetworkInner;

    fn deref(&self) -> &NetworkInner {
        &self.0
    }
}

pub struct NetworkInner {
    config: Arc<Config>,
    header_store: Arc<dyn HeaderStore>,
    num_server: usize,
    auto_connect: AtomicBool,
    blockchain_index: AtomicU32,
    bhi_lock: Arc<tokio::sync::Mutex<()>>,
    chunks: Arc<ChunkTracker>,
    state: Mutex<NetState>,
    recent_servers: Mutex<RecentServers>,
    peer_servers: Mutex<ServerMap>,
    banner: Mutex<String>,
    donation_address: Mutex<String>,
    relay_fee: Mutex<Option<u64>>,
    status: Mutex<ConnectionStatus>,
    retry_times: Mutex<RetryTimes>,
    bus: CallbackBus,
    root_group: TaskGroup,
}

impl Network {
    pub fn new(config: Arc<Config>, header_store: Arc<dyn HeaderStore>) -> Network {
        let num_server = if config.oneserver() { 0 } else { 10 };

        let mut blockchain_index = config.blockchain_index();
        if !header_store.forks().contains(&blockchain_index) {
            blockchain_index = 0;
        }

        let default_server = config
            .server()
            .and_then(|s| match s.parse::<ServerAddr>() {
                Ok(server) => Some(server),
                Err(_) => {
                    log::warn!("failed to parse configured server, falling back to random");
                    None
                }
            })
            .or_else(|| pick_random_server(&DEFAULT_SERVERS, Proto::Ssl, &HashSet::new()))
            .expect("built-in server list is not empty");

        let proxy = config.proxy().and_then(|s| ProxySpec::deserialize(&s));
        let protocol = default_server.proto;
        let cert_dir = config
            .datadir()
            .map(|d| d.join("certs"))
            .unwrap_or_else(std::env::temp_dir);
        let recent_servers = RecentServers::load(config.datadir().as_deref());
        let connector = Arc::new(Connector::new(proxy.clone(), cert_dir));
        let (socket_tx, socket_rx) = mpsc::unbounded_channel();
        let now = Instant::now();

        Network(Arc::new(NetworkInner {
            auto_connect: AtomicBool::new(config.auto_connect()),
            config,
            header_store,
            num_server,
            blockchain_index: AtomicU32::new(blockchain_index),
            bhi_lock: Arc::new(tokio::sync::Mutex::new(())),
            chunks: Arc::new(ChunkTracker::new()),
            state: Mutex::new(NetState {
                interfaces: HashMap::new(),
                connecting: HashSet::new(),
                main_interface: None,
                disconnected_servers: HashSet::new(),
                default_server,
                protocol,
                proxy,
                connector,
                socket_tx,
                socket_rx,
            }),
            recent_servers: Mutex::new(recent_servers),
            peer_servers: Mutex::new(ServerMap::new()),
            banner: Mutex::new(String::new()),
            donation_address: Mutex::new(String::new()),
            relay_fee: Mutex::new(None),
            status: Mutex::new(ConnectionStatus::Disconnected),
            retry_times: Mutex::new(RetryTimes {
                server: now,
                nodes: now,
            }),
            bus: CallbackBus::new(),
            root_group: TaskGroup::new(),
        }))
    }

    /// Kick off the network and its supervision loop. Must be called from
    /// within the runtime.
    pub fn start(&self) {
        if let Some(datadir) = self.config.datadir() {
            if let Err(e) = crate::chain::init_headers_file(&datadir.join("blockchain_headers")) {
                log::error!("cannot initialize headers file: {e}");
            }
        }
        let (protocol, proxy) = {
            let st = self.state();
            (st.protocol, st.proxy.clone())
        };
        self.start_network(protocol, proxy);
        let network = self.clone();
        self.root_group
            .spawn(async move { network.maintain_sessions().await });
    }

    /// Switch to `server` as the main interface. If no connection exists
    /// yet, enqueue one; the switch happens when it becomes ready.
    pub fn switch_to_interface(&self, server: ServerAddr) {
        let mut events: Vec<Event> = Vec::new();
        {
            let mut st = self.state();
            st.default_server = server.clone();
            let Some(interface) = st.interfaces.get(&server).cloned() else {
                st.main_interface = None;
                drop(st);
                self.start_interface(server);
                return;
            };
            let already_main = st
                .main_interface
                .as_ref()
                .map(|i| i.server == server)
                .unwrap_or(false);
            if already_main {
                return;
            }
            log::info!("switching to {server}");
            if let Some(old) = st.main_interface.take() {
                // tear the old main down to cancel its subscriptions, but
                // keep its headers sub on a known peer by reconnecting it
                let old_server = old.server.clone();
                NetworkInner::close_interface(&mut st, &old_server);
                if st.interfaces.len() <= self.num_server && !st.connecting.contains(&old_server)
                {
                    st.connecting.insert(old_server.clone());
                    let _ = st.socket_tx.send(old_server);
                }
            }
            st.main_interface = Some(interface.clone());
            let network = self.clone();
            let iface = interface.clone();
            interface.group.spawn(async move {
                if let Err(e) = network.request_server_info(&iface).await {
                    log::warn!("{} server info request failed: {e}", iface.server);
                }
            });
            events.push(Event::DefaultServerChanged(server));
        }
        for event in events {
            self.trigger(event);
        }
        self.set_status(ConnectionStatus::Connected);
        self.trigger(Event::Updated);
        self.trigger(Event::Interfaces(self.get_interfaces()));
    }

    /// Random connected peer other than the current default.
    fn switch_to_random_interface(&self) {
        let (mut servers, default) = {
            let st = self.state();
            (
                st.interfaces.keys().cloned().collect::<Vec<_>>(),
                st.default_server.clone(),
            )
        };
        servers.retain(|s| s != &default);
        if !servers.is_empty() {
            self.switch_to_interface(servers[fastrand::usize(..servers.len())].clone());
        }
    }

    /// If auto-connect is on and the main server trails the local chain,
    /// elect a random peer whose tip header matches our local best.
    pub fn switch_lagging_interface(&self) {
        if !(self.auto_connect.load(Ordering::SeqCst) && self.server_is_lagging()) {
            return;
        }
        let Some(header) = self
            .header_store
            .read_header(self.blockchain(), self.get_local_height())
        else {
            return;
        };
        let candidates: Vec<ServerAddr> = {
            let st = self.state();
            st.interfaces
                .values()
                .filter(|i| i.tip_header() == Some(header))
                .map(|i| i.server.clone())
                .collect()
        };
        if !candidates.is_empty() {
            self.switch_to_interface(candidates[fastrand::usize(..candidates.len())].clone());
        }
    }

    /// Pin the wallet to the fork with this forkpoint and move the main
    /// interface onto a server following it.
    pub fn follow_chain(&self, index: ChainRef) -> Result<(), Error> {
        if !self.header_store.forks().contains(&index) {
            return Err(Error::ChainNotFound(index));
        }
        self.blockchain_index.store(index, Ordering::SeqCst);
        self.config.set_blockchain_index(index);
        let on_fork = {
            let st = self.state();
            st.interfaces
                .values()
                .find(|i| i.blockchain() == index)
                .map(|i| i.server.clone())
        };
        if let Some(server) = on_fork {
            self.switch_to_interface(server);
        }
        Ok(())
    }

    /// Validate, persist, then apply. A store that rejects the write
    /// aborts the whole change; invalid input is silently ignored. Must be
    /// called from within the runtime.
    pub fn set_parameters(&self, params: NetworkParameters) {
        let server_str = params.server.to_string();
        // round-trip to reject anything the codec wouldn't accept back
        if server_str.parse::<ServerAddr>().is_err() {
            return;
        }
        let proxy_value = match &params.proxy {
            Some(proxy) => Value::from(proxy.serialize()),
            None => Value::Null,
        };

        self.config
            .set("auto_connect", params.auto_connect.into(), false);
        self.config.set("proxy", proxy_value.clone(), false);
        self.config.set("server", server_str.clone().into(), true);
        // abort if changes were not allowed by the store
        if self.config.server().as_deref() != Some(server_str.as_str())
            || self.config.get("proxy").unwrap_or(Value::Null) != proxy_value
        {
            return;
        }

        self.auto_connect
            .store(params.auto_connect, Ordering::SeqCst);
        let (proxy_changed, proto_changed, server_changed) = {
            let st = self.state();
            (
                st.proxy != params.proxy,
                st.protocol != params.server.proto,
                st.default_server != params.server,
            )
        };
        if proxy_changed || proto_changed {
            // restart the whole network defaulting to the given server
            self.stop_network();
            self.state().default_server = params.server.clone();
            self.start_network(params.server.proto, params.proxy);
        } else if server_changed {
            self.switch_to_interface(params.server);
        } else {
            self.switch_lagging_interface();
            self.trigger(Event::Updated);
        }
    }

    fn start_network(&self, protocol: Proto, proxy: Option<ProxySpec>) {
        log::info!("starting network");
        let default_server = {
            let mut st = self.state();
            debug_assert!(st.interfaces.is_empty() && st.main_interface.is_none());
            st.disconnected_servers.clear();
            st.protocol = protocol;
            st.default_server.clone()
        };
        self.set_proxy(proxy);
        self.start_interface(default_server);
    }

    /// One connect attempt, spawned per queued server by the supervision
    /// loop. Failures mark the server disconnected; success installs the
    /// interface and, for the default server, elects it main.
    async fn new_interface(self, server: ServerAddr) {
        self.add_recent_server(&server);
        let (connector, proxied) = {
            let st = self.state();
            (st.connector.clone(), st.proxy.is_some())
        };
        let interface = Interface::open(server.clone(), connector, self.header_sync());
        let timeout = if proxied {
            READY_TIMEOUT_PROXY
        } else {
            READY_TIMEOUT
        };
        let ready = interface
            .take_ready()
            .expect("fresh interface has a ready slot");
        let launched = tokio::time::timeout(timeout, ready).await;
        self.state().connecting.remove(&server);
        match launched {
            Ok(Ok(())) => {}
            _ => {
                let cause = interface
                    .take_exception()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "timeout".to_string());
                log::warn!("{server} couldn't launch because {cause}");
                SESSION_COUNTER.with_label_values(&["failed"]).inc();
                interface.close();
                self.connection_down(&server);
                return;
            }
        }
        SESSION_COUNTER.with_label_values(&["connected"]).inc();
        let is_default = {
            let mut st = self.state();
            st.interfaces.insert(server.clone(), interface);
            server == st.default_server
        };
        if is_default {
            self.switch_to_interface(server);
        }
        self.trigger(Event::Interfaces(self.get_interfaces()));
    }

    /// The supervision loop: drains pending connects, buries dead
    /// interfaces, keeps the pool filled, retries the disconnected set and
    /// re-elects the main interface. Never returns.
    async fn maintain_sessions(self) {
        loop {
            // pending outbound connects
            loop {
                let server = match self.state().socket_rx.try_recv() {
                    Ok(server) => server,
                    Err(_) => break,
                };
                let network = self.clone();
                self.root_group
                    .spawn(async move { network.new_interface(server).await });
            }

            // interfaces whose driver completed
            let finished: Vec<Arc<Interface>> = {
                let st = self.state();
                st.interfaces
                    .values()
                    .filter(|i| i.is_finished())
                    .cloned()
                    .collect()
            };
            for interface in finished {
                match interface.take_exception() {
                    Some(e) => log::warn!("{} errored because {e}", interface.server),
                    None => {
                        // a driver has no clean exit path while installed
                        debug_assert!(false, "interface future finished without exception");
                        log::error!(
                            "{} driver finished without exception, this is a bug",
                            interface.server
                        );
                    }
                }
                self.connection_down(&interface.server);
            }

            // fill the pool with random peers
            let missing = {
                let st = self.state();
                self.num_server
                    .saturating_sub(st.interfaces.len() + st.connecting.len())
            };
            for _ in 0..missing {
                self.start_random_interface();
            }

            // periodically retry everyone we gave up on
            {
                let mut retry = self.retry_times.lock().expect("retry poisoned");
                if retry.nodes.elapsed() > NODES_RETRY_INTERVAL {
                    log::info!("network: retrying connections");
                    self.state().disconnected_servers.clear();
                    retry.nodes = Instant::now();
                }
            }

            // main interface election
            if !self.is_connected() {
                if self.auto_connect.load(Ordering::SeqCst) {
                    if !self.is_connecting() {
                        self.switch_to_random_interface();
                    }
                } else {
                    let default_server = self.state().default_server.clone();
                    let banned = self
                        .state()
                        .disconnected_servers
                        .contains(&default_server);
                    if banned {
                        let mut retry = self.retry_times.lock().expect("retry poisoned");
                        if retry.server.elapsed() > SERVER_RETRY_INTERVAL {
                            self.state().disconnected_servers.remove(&default_server);
                            retry.server = Instant::now();
                        }
                    } else {
                        self.switch_to_interface(default_server);
                    }
                }
            } else if self.config.is_fee_estimates_update_required() {
                if let Some(main) = self.state().main_interface.clone() {
                    self.config.requested_fee_estimates();
                    let network = self.clone();
                    let iface = main.clone();
                    main.group.spawn(async move {
                        if let Err(e) = network.request_fee_estimates(&iface).await {
                            log::warn!("{} fee refresh failed: {e}", iface.server);
                        }
                    });
                }
            }

            sleep(MAINTENANCE_TICK).await;
        }
    }
}

impl NetworkInner {
    fn state(&self) -> MutexGuard<'_, NetState> {
        self.state.lock().expect("interface state poisoned")
    }

    fn header_sync(&self) -> HeaderSync {
        HeaderSync {
            store: self.header_store.clone(),
            bhi_lock: self.bhi_lock.clone(),
            chunks: self.chunks.clone(),
        }
    }

    // ---- callbacks -----------------------------------------------------

    pub fn register_callback(&self, handler: Handler, kinds: &[EventKind]) -> CallbackId {
        self.bus.register(handler, kinds)
    }

    pub fn unregister_callback(&self, id: CallbackId) {
        self.bus.unregister(id)
    }

    fn trigger(&self, event: Event) {
        self.bus.trigger(event)
    }

    pub(crate) fn trigger_event(&self, event: Event) {
        self.trigger(event)
    }

    pub fn notify_updated(&self) {
        self.trigger(Event::Updated)
    }

    pub fn get_status_value(&self, kind: EventKind) -> Option<StatusValue> {
        Some(match kind {
            EventKind::Status => StatusValue::Status(self.connection_status()),
            EventKind::Banner => {
                StatusValue::Banner(self.banner.lock().expect("banner poisoned").clone())
            }
            EventKind::Fee => StatusValue::Fee(self.config.fee_estimates()),
            EventKind::FeeHistogram => StatusValue::FeeHistogram(self.config.mempool_fees()),
            EventKind::Updated => StatusValue::Heights {
                local: self.get_local_height(),
                server: self.get_server_height(),
            },
            EventKind::Servers => StatusValue::Servers(self.get_servers()),
            EventKind::Interfaces => StatusValue::Interfaces(self.get_interfaces()),
            _ => return None,
        })
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.status.lock().expect("status poisoned") = status;
        self.trigger(Event::Status(status));
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        *self.status.lock().expect("status poisoned")
    }

    // ---- simple accessors ----------------------------------------------

    pub fn is_connected(&self) -> bool {
        self.state().main_interface.is_some()
    }

    pub fn is_connecting(&self) -> bool {
        self.connection_status() == ConnectionStatus::Connecting
    }

    pub fn get_parameters(&self) -> NetworkParameters {
        let st = self.state();
        NetworkParameters {
            server: st.default_server.clone(),
            proxy: st.proxy.clone(),
            auto_connect: self.auto_connect.load(Ordering::SeqCst),
        }
    }

    pub fn get_interfaces(&self) -> Vec<ServerAddr> {
        self.state().interfaces.keys().cloned().collect()
    }

    pub fn get_donation_address(&self) -> Option<String> {
        if self.is_connected() {
            Some(
                self.donation_address
                    .lock()
                    .expect("donation poisoned")
                    .clone(),
            )
        } else {
            None
        }
    }

    pub fn relay_fee(&self) -> Option<u64> {
        *self.relay_fee.lock().expect("relay fee poisoned")
    }

    pub fn get_server_height(&self) -> u32 {
        self.state()
            .main_interface
            .as_ref()
            .map(|i| i.tip())
            .unwrap_or(0)
    }

    /// The fork the main interface is on, falling back to the last known.
    pub fn blockchain(&self) -> ChainRef {
        if let Some(main) = self.state().main_interface.clone() {
            self.blockchain_index
                .store(main.blockchain(), Ordering::SeqCst);
        }
        self.blockchain_index.load(Ordering::SeqCst)
    }

    pub fn get_local_height(&self) -> u32 {
        self.header_store.height(self.blockchain())
    }

    pub fn get_blockchains(&self) -> HashMap<ChainRef, Vec<ServerAddr>> {
        let st = self.state();
        let mut out: HashMap<ChainRef, Vec<ServerAddr>> = HashMap::new();
        for fork in self.header_store.forks() {
            let on_fork: Vec<_> = st
                .interfaces
                .values()
                .filter(|i| i.blockchain() == fork)
                .map(|i| i.server.clone())
                .collect();
            if !on_fork.is_empty() {
                out.insert(fork, on_fork);
            }
        }
        out
    }

    pub fn main_session(&self) -> Result<Arc<RpcSession>, Error> {
        let main = self
            .state()
            .main_interface
            .clone()
            .ok_or(Error::NotConnected)?;
        main.session()
    }

    fn server_is_lagging(&self) -> bool {
        let sh = self.get_server_height();
        if sh == 0 {
            log::info!("no height for main interface");
            return true;
        }
        let lh = self.get_local_height();
        let lagging = lh as i64 - sh as i64 > 1;
        if lagging {
            let st = self.state();
            log::info!("{} is lagging ({sh} vs {lh})", st.default_server);
        }
        lagging
    }

    // ---- server lists --------------------------------------------------

    /// Fresh merged map on every call: built-in defaults, then peers
    /// announced by the main server (version filtered), or the recent
    /// servers when no peer list is known yet. The defaults themselves are
    /// never mutated.
    pub fn get_servers(&self) -> ServerMap {
        let mut out = DEFAULT_SERVERS.clone();
        let peers = self.peer_servers.lock().expect("peers poisoned").clone();
        if !peers.is_empty() {
            out.extend(filter_version(peers));
        } else {
            let recent = self.recent_servers.lock().expect("recent poisoned");
            for server in recent.get() {
                if !out.contains_key(&server.host) {
                    out.insert(
                        server.host.clone(),
                        ServerFeatures {
                            ports: [(server.proto, server.port)].into_iter().collect(),
                            version: None,
                            pruning: "-".to_string(),
                        },
                    );
                }
            }
        }
        if self.config.noonion() {
            out = filter_noonion(out);
        }
        out
    }

    fn add_recent_server(&self, server: &ServerAddr) {
        self.recent_servers
            .lock()
            .expect("recent poisoned")
            .add(server.clone());
    }

    // ---- connection management -----------------------------------------

    /// Enqueue a connect unless one is open or pending already.
    fn start_interface(&self, server: ServerAddr) {
        let mut announce_connecting = false;
        {
            let mut st = self.state();
            if !st.interfaces.contains_key(&server) && !st.connecting.contains(&server) {
                if server == st.default_server {
                    log::info!("connecting to {server} as new interface");
                    announce_connecting = true;
                }
                st.connecting.insert(server.clone());
                let _ = st.socket_tx.send(server);
            }
        }
        if announce_connecting {
            self.set_status(ConnectionStatus::Connecting);
        }
    }

    fn start_random_interface(&self) {
        let (exclude, protocol) = {
            let st = self.state();
            let exclude: HashSet<ServerAddr> = st
                .disconnected_servers
                .iter()
                .chain(st.interfaces.keys())
                .chain(st.connecting.iter())
                .cloned()
                .collect();
            (exclude, st.protocol)
        };
        if let Some(server) = pick_random_server(&self.get_servers(), protocol, &exclude) {
            self.start_interface(server);
        }
    }

    /// A connection either went down or was never made.
    fn connection_down(&self, server: &ServerAddr) {
        let (was_default, was_open) = {
            let mut st = self.state();
            st.disconnected_servers.insert(server.clone());
            let was_open = st.interfaces.contains_key(server);
            if was_open {
                Self::close_interface(&mut st, server);
            }
            (*server == st.default_server, was_open)
        };
        if was_default {
            self.set_status(ConnectionStatus::Disconnected);
        }
        if was_open {
            self.trigger(Event::Interfaces(self.get_interfaces()));
        }
    }

    fn close_interface(st: &mut NetState, server: &ServerAddr) {
        if let Some(interface) = st.interfaces.remove(server) {
            interface.close();
        }
        if st
            .main_interface
            .as_ref()
            .map(|i| &i.server == server)
            .unwrap_or(false)
        {
            st.main_interface = None;
        }
    }

    fn set_proxy(&self, proxy: Option<ProxySpec>) {
        let cert_dir = self
            .config
            .datadir()
            .map(|d| d.join("certs"))
            .unwrap_or_else(std::env::temp_dir);
        {
            let mut st = self.state();
            st.connector = Arc::new(Connector::new(proxy.clone(), cert_dir));
            st.proxy = proxy.clone();
        }
        if proxy.is_some() {
            log::info!("setting proxy {proxy:?}");
        }
        self.trigger(Event::ProxySet(proxy));
    }

    fn stop_network(&self) {
        log::info!("stopping network");
        let mut st = self.state();
        let servers: Vec<ServerAddr> = st.interfaces.keys().cloned().collect();
        for server in servers {
            Self::close_interface(&mut st, &server);
        }
        st.main_interface = None;
        st.connecting.clear();
        // fresh queue, no old pending connections
        let (tx, rx) = mpsc::unbounded_channel();
        st.socket_tx = tx;
        st.socket_rx = rx;
    }

    /// Cancel all remaining work and drop every connection.
    pub fn stop(&self) {
        self.root_group.close();
        self.stop_network();
        *self.status.lock().expect("status poisoned") = ConnectionStatus::Disconnected;
    }

    // ---- main server metadata ------------------------------------------

    async fn request_server_info(&self, interface: &Interface) -> Result<(), Error> {
        let session = interface.session()?;
        // stamp early so the supervision loop doesn't race a second refresh
        self.config.requested_fee_estimates();

        let banner = session.send_request("server.banner", vec![]).await?;
        *self.banner.lock().expect("banner poisoned") =
            banner.as_str().unwrap_or_default().to_string();
        self.trigger(Event::Banner(
            self.banner.lock().expect("banner poisoned").clone(),
        ));

        let donation = session
            .send_request("server.donation_address", vec![])
            .await?;
        *self.donation_address.lock().expect("donation poisoned") =
            donation.as_str().unwrap_or_default().to_string();

        let peers = session
            .send_request("server.peers.subscribe", vec![])
            .await?;
        let peers = parse_servers(peers.as_array().map(Vec::as_slice).unwrap_or_default());
        log::debug!("{} announced {} peers", interface.server, peers.len());
        *self.peer_servers.lock().expect("peers poisoned") = peers;
        self.trigger(Event::Servers(self.get_servers()));

        self.request_fee_estimates(interface).await?;

        let relayfee = session.send_request("blockchain.relayfee", vec![]).await?;
        *self.relay_fee.lock().expect("relay fee poisoned") =
            relayfee.as_f64().map(|fee| (fee * COIN as f64) as u64);
        Ok(())
    }

    /// Fetch the fee histogram and every ETA target concurrently, apply the
    /// whole batch at once when everything has arrived.
    async fn request_fee_estimates(&self, interface: &Interface) -> Result<(), Error> {
        let session = interface.session()?;
        self.config.requested_fee_estimates();

        let histogram_fut = session.send_request("mempool.get_fee_histogram", vec![]);
        let fee_futs = FEE_ETA_TARGETS.iter().map(|target| {
            let session = session.clone();
            async move {
                let fee = session
                    .send_request("blockchain.estimatefee", vec![(*target).into()])
                    .await?;
                Ok::<_, Error>((*target, fee))
            }
        });
        let (histogram, fees) =
            futures::future::try_join(histogram_fut, futures::future::try_join_all(fee_futs))
                .await?;

        let histogram: Vec<(f64, u64)> = histogram
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| {
                        let fee = row.get(0)?.as_f64()?;
                        let vsize = row.get(1)?.as_u64()?;
                        Some((fee, vsize))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut estimates = HashMap::new();
        for (target, fee) in fees {
            if let Some(fee) = fee.as_f64().filter(|f| *f >= 0.0) {
                let fee = (fee * COIN as f64) as u64;
                log::debug!("fee_estimates[{target}] {fee}");
                estimates.insert(target, fee);
            }
        }
        self.config
            .update_fee_estimates(estimates.clone(), histogram.clone());
        self.trigger(Event::FeeHistogram(histogram));
        self.trigger(Event::Fee(estimates));
        Ok(())
    }

    // ---- RPC facade ----------------------------------------------------

    /// `true` only when the server echoes the transaction's own txid;
    /// everything else comes back as a tagged message for the caller to
    /// show, never as an error to catch.
    pub async fn broadcast_transaction(
        &self,
        tx: &Transaction,
        timeout: Option<Duration>,
    ) -> (bool, String) {
        let timeout = timeout.unwrap_or(BROADCAST_TIMEOUT);
        let session = match self.main_session() {
            Ok(session) => session,
            Err(e) => return (false, format!("error: {e}")),
        };
        let raw = bitcoin::consensus::encode::serialize_hex(tx);
        let out = session
            .send_request_timeout("blockchain.transaction.broadcast", vec![raw.into()], timeout)
            .await;
        match out {
            Err(Error::Timeout) => (false, "error: operation timed out".to_string()),
            Err(e) => (false, format!("error: {e}")),
            Ok(out) => {
                let out = match out {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                if out == tx.compute_txid().to_string() {
                    (true, out)
                } else {
                    (false, format!("error: {out}"))
                }
            }
        }
    }

    pub async fn get_merkle_for_transaction(
        &self,
        tx_hash: Txid,
        tx_height: u32,
    ) -> Result<Value, Error> {
        self.main_session()?
            .send_request(
                "blockchain.transaction.get_merkle",
                vec![tx_hash.to_string().into(), tx_height.into()],
            )
            .await
    }

    /// Backfill one epoch of headers through the dedup coordinator, using
    /// the main session unless one is supplied.
    pub async fn request_chunk(
        &self,
        height: u32,
        tip: Option<u32>,
        session: Option<&RpcSession>,
        can_return_early: bool,
    ) -> Result<Option<(bool, u32)>, Error> {
        let fork = self.blockchain();
        match session {
            Some(session) => {
                self.chunks
                    .request(
                        session,
                        &*self.header_store,
                        fork,
                        height,
                        tip,
                        can_return_early,
                    )
                    .await
            }
            None => {
                let session = self.main_session()?;
                self.chunks
                    .request(
                        &session,
                        &*self.header_store,
                        fork,
                        height,
                        tip,
                        can_return_early,
                    )
                    .await
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutils::{
        make_header_chain, MemoryConfig, MemoryHeaderStore, MockServer, MockState,
    };

    fn test_network(
        server: &ServerAddr,
        auto_connect: bool,
        headers: Vec<bitcoin::block::Header>,
    ) -> Network {
        let config = Arc::new(Config::new(Box::new(
            MemoryConfig::new(None)
                .with_value("server", server.to_string().into())
                .with_value("oneserver", true.into())
                .with_value("auto_connect", auto_connect.into()),
        )));
        Network::new(config, Arc::new(MemoryHeaderStore::new(headers)))
    }

    /// Open an interface by hand, as the supervision loop would.
    async fn install_interface(network: &Network, mock: &MockServer) -> Arc<Interface> {
        let connector = network.state().connector.clone();
        let interface = Interface::open(mock.server_addr(), connector, network.header_sync());
        let ready = interface.take_ready().expect("fresh interface");
        tokio::time::timeout(Duration::from_secs(5), ready)
            .await
            .expect("handshake timed out")
            .expect("handshake failed");
        network
            .state()
            .interfaces
            .insert(mock.server_addr(), interface.clone());
        interface
    }

    async fn wait_for_tip(interface: &Arc<Interface>, tip: u32) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while interface.tip() != tip {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("tip never announced");
    }

    #[tokio::test]
    async fn lagging_switch_elects_peer_on_local_best() {
        let chain = make_header_chain(8);
        let mock_a = MockServer::start(MockState::new(5, &chain[5])).await.unwrap();
        let mock_b = MockServer::start(MockState::new(7, &chain[7])).await.unwrap();
        let network = test_network(&mock_a.server_addr(), true, chain);

        let a = install_interface(&network, &mock_a).await;
        let b = install_interface(&network, &mock_b).await;
        wait_for_tip(&a, 5).await;
        wait_for_tip(&b, 7).await;
        {
            let mut st = network.state();
            st.main_interface = Some(a.clone());
            st.default_server = mock_a.server_addr();
        }

        network.switch_lagging_interface();
        assert_eq!(network.get_parameters().server, mock_b.server_addr());
        assert_eq!(network.get_server_height(), 7);
    }

    #[tokio::test]
    async fn no_lagging_switch_without_auto_connect() {
        let chain = make_header_chain(8);
        let mock_a = MockServer::start(MockState::new(5, &chain[5])).await.unwrap();
        let mock_b = MockServer::start(MockState::new(7, &chain[7])).await.unwrap();
        let network = test_network(&mock_a.server_addr(), false, chain);

        let a = install_interface(&network, &mock_a).await;
        let b = install_interface(&network, &mock_b).await;
        wait_for_tip(&a, 5).await;
        wait_for_tip(&b, 7).await;
        {
            let mut st = network.state();
            st.main_interface = Some(a.clone());
            st.default_server = mock_a.server_addr();
        }

        network.switch_lagging_interface();
        assert_eq!(network.get_parameters().server, mock_a.server_addr());
    }

    #[tokio::test]
    async fn switch_to_unknown_server_enqueues_connect() {
        let chain = make_header_chain(2);
        let mock = MockServer::start(MockState::new(1, &chain[1])).await.unwrap();
        let network = test_network(&mock.server_addr(), false, chain);
        let other = ServerAddr::new("other.example", 50001, Proto::Tcp);

        network.switch_to_interface(other.clone());
        let st = network.state();
        assert!(st.main_interface.is_none());
        assert_eq!(st.default_server, other);
        assert!(st.connecting.contains(&other));
    }
}
