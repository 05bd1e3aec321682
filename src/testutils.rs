//! In-memory implementations of the external contracts and a mock electrum
//! server, used by the test suite and by example harnesses.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bitcoin::block::Header;
use bitcoin::hashes::Hash;
use bitcoin::{Address, BlockHash, CompactTarget, Transaction, TxMerkleNode, Txid};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::chain::{ChainRef, HeaderStore};
use crate::config::ConfigStore;
use crate::constants::{CHUNK_SIZE, HEADER_SIZE};
use crate::server::{Proto, ServerAddr};
use crate::wallet::{TxHistory, WalletStore};

// ---- config ------------------------------------------------------------

pub struct MemoryConfig {
    values: Mutex<HashMap<String, Value>>,
    datadir: Option<PathBuf>,
    pub read_only: AtomicBool,
}

impl MemoryConfig {
    pub fn new(datadir: Option<PathBuf>) -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            datadir,
            read_only: AtomicBool::new(false),
        }
    }

    pub fn with_value(self, key: &str, value: Value) -> Self {
        self.values.lock().unwrap().insert(key.to_string(), value);
        self
    }
}

impl ConfigStore for MemoryConfig {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().unwrap().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value, _user_visible: bool) -> bool {
        if self.read_only.load(Ordering::SeqCst) {
            return false;
        }
        self.values.lock().unwrap().insert(key.to_string(), value);
        true
    }

    fn datadir(&self) -> Option<PathBuf> {
        self.datadir.clone()
    }
}

// ---- header store ------------------------------------------------------

/// Fork 0 holds a plain vector of headers from genesis; extra forks can be
/// seeded for reorg tests. No difficulty validation, linkage only.
pub struct MemoryHeaderStore {
    forks: Mutex<BTreeMap<ChainRef, Vec<Header>>>,
}

impl MemoryHeaderStore {
    pub fn new(initial: Vec<Header>) -> Self {
        let mut forks = BTreeMap::new();
        forks.insert(0, initial);
        Self {
            forks: Mutex::new(forks),
        }
    }

    pub fn seed_fork(&self, fork: ChainRef, headers: Vec<Header>) {
        self.forks.lock().unwrap().insert(fork, headers);
    }
}

impl HeaderStore for MemoryHeaderStore {
    fn forks(&self) -> Vec<ChainRef> {
        self.forks.lock().unwrap().keys().copied().collect()
    }

    fn height(&self, fork: ChainRef) -> u32 {
        self.forks
            .lock()
            .unwrap()
            .get(&fork)
            .map(|h| h.len().saturating_sub(1) as u32)
            .unwrap_or(0)
    }

    fn read_header(&self, fork: ChainRef, height: u32) -> Option<Header> {
        self.forks
            .lock()
            .unwrap()
            .get(&fork)?
            .get(height as usize)
            .copied()
    }

    fn can_connect(&self, fork: ChainRef, header: &Header, height: u32) -> bool {
        let forks = self.forks.lock().unwrap();
        let Some(headers) = forks.get(&fork) else {
            return false;
        };
        height as usize == headers.len()
            && headers
                .last()
                .map(|prev| prev.block_hash() == header.prev_blockhash)
                .unwrap_or(true)
    }

    fn connect_header(&self, fork: ChainRef, header: Header, height: u32) -> bool {
        if !self.can_connect(fork, &header, height) {
            return false;
        }
        self.forks
            .lock()
            .unwrap()
            .get_mut(&fork)
            .expect("checked above")
            .push(header);
        true
    }

    fn connect_chunk(&self, fork: ChainRef, index: u32, raw: &[u8]) -> bool {
        use bitcoin::consensus::Decodable;
        if raw.len() % HEADER_SIZE != 0 {
            return false;
        }
        let start = (index * CHUNK_SIZE) as usize;
        let mut forks = self.forks.lock().unwrap();
        let Some(headers) = forks.get_mut(&fork) else {
            return false;
        };
        if start > headers.len() {
            return false;
        }
        for (i, bytes) in raw.chunks(HEADER_SIZE).enumerate() {
            let Ok(header) = Header::consensus_decode(&mut &bytes[..]) else {
                return false;
            };
            let height = start + i;
            if height < headers.len() {
                if headers[height] != header {
                    return false;
                }
            } else if headers
                .last()
                .map(|prev| prev.block_hash() == header.prev_blockhash)
                .unwrap_or(true)
            {
                headers.push(header);
            } else {
                return false;
            }
        }
        true
    }
}

/// A linked chain of syntactically valid headers (no proof of work).
pub fn make_header_chain(n: usize) -> Vec<Header> {
    let mut headers: Vec<Header> = Vec::with_capacity(n);
    for i in 0..n {
        let prev_blockhash = headers
            .last()
            .map(|h| h.block_hash())
            .unwrap_or_else(BlockHash::all_zeros);
        headers.push(Header {
            version: bitcoin::block::Version::ONE,
            prev_blockhash,
            merkle_root: TxMerkleNode::all_zeros(),
            time: 1231006505 + i as u32,
            bits: CompactTarget::from_consensus(0x207fffff),
            nonce: i as u32,
        });
    }
    headers
}

pub fn header_hex(header: &Header) -> String {
    bitcoin::consensus::encode::serialize_hex(header)
}

// ---- wallet ------------------------------------------------------------

#[derive(Default)]
pub struct MemoryWallet {
    history: Mutex<HashMap<Address, TxHistory>>,
    txs: Mutex<HashMap<Txid, Transaction>>,
    addresses: Mutex<Vec<Address>>,
    up_to_date: AtomicBool,
}

impl MemoryWallet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_address(&self, addr: Address) {
        self.addresses.lock().unwrap().push(addr);
    }

    pub fn set_history(&self, addr: Address, history: TxHistory) {
        self.history.lock().unwrap().insert(addr, history);
    }

    pub fn insert_tx(&self, txid: Txid, tx: Transaction) {
        self.txs.lock().unwrap().insert(txid, tx);
    }

    pub fn get_tx(&self, txid: &Txid) -> Option<Transaction> {
        self.txs.lock().unwrap().get(txid).cloned()
    }
}

impl WalletStore for MemoryWallet {
    fn addresses(&self) -> Vec<Address> {
        self.addresses.lock().unwrap().clone()
    }

    fn synchronize(&self) -> Vec<Address> {
        Vec::new()
    }

    fn history(&self, addr: &Address) -> TxHistory {
        self.history
            .lock()
            .unwrap()
            .get(addr)
            .cloned()
            .unwrap_or_default()
    }

    fn all_histories(&self) -> Vec<(Address, TxHistory)> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .map(|(addr, hist)| (addr.clone(), hist.clone()))
            .collect()
    }

    fn has_transaction(&self, txid: &Txid) -> bool {
        self.txs.lock().unwrap().contains_key(txid)
    }

    fn receive_history(&self, addr: &Address, hist: TxHistory, _fees: HashMap<Txid, u64>) {
        self.history.lock().unwrap().insert(addr.clone(), hist);
    }

    fn receive_transaction(&self, txid: Txid, tx: Transaction, _height: i32) {
        self.txs.lock().unwrap().insert(txid, tx);
    }

    fn is_up_to_date(&self) -> bool {
        self.up_to_date.load(Ordering::SeqCst)
    }

    fn set_up_to_date(&self, up_to_date: bool) {
        self.up_to_date.store(up_to_date, Ordering::SeqCst);
    }
}

// ---- mock electrum server ----------------------------------------------

pub struct MockState {
    pub banner: String,
    pub donation_address: String,
    pub peers: Mutex<Vec<Value>>,
    pub tip: Mutex<(u32, String)>,
    pub statuses: Mutex<HashMap<String, Value>>,
    pub histories: Mutex<HashMap<String, Value>>,
    pub txs: Mutex<HashMap<String, String>>,
    pub broadcast_reply: Mutex<Value>,
    pub stall_broadcast: AtomicBool,
    pub chunk_delay_ms: AtomicU64,
    pub header_chunk_requests: AtomicUsize,
    pub calls: Mutex<Vec<String>>,
    connections: Mutex<Vec<mpsc::UnboundedSender<String>>>,
}

impl MockState {
    pub fn new(tip_height: u32, tip_header: &Header) -> Arc<Self> {
        Arc::new(Self {
            banner: "mock electrum server".to_string(),
            donation_address: String::new(),
            peers: Mutex::new(Vec::new()),
            tip: Mutex::new((tip_height, header_hex(tip_header))),
            statuses: Mutex::new(HashMap::new()),
            histories: Mutex::new(HashMap::new()),
            txs: Mutex::new(HashMap::new()),
            broadcast_reply: Mutex::new(Value::Null),
            stall_broadcast: AtomicBool::new(false),
            chunk_delay_ms: AtomicU64::new(0),
            header_chunk_requests: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
        })
    }

    pub fn calls_of(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.as_str() == method)
            .count()
    }

    fn broadcast_line(&self, line: String) {
        self.connections
            .lock()
            .unwrap()
            .retain(|tx| tx.send(line.clone()).is_ok());
    }

    /// Update an address status and notify every connected client.
    pub fn push_status(&self, scripthash: &str, status: Value) {
        self.statuses
            .lock()
            .unwrap()
            .insert(scripthash.to_string(), status.clone());
        let note = json!({
            "jsonrpc": "2.0",
            "method": "blockchain.scripthash.subscribe",
            "params": [scripthash, status],
        });
        self.broadcast_line(format!("{note}\n"));
    }

    pub fn push_tip(&self, height: u32, header: &Header) {
        let hex = header_hex(header);
        *self.tip.lock().unwrap() = (height, hex.clone());
        let note = json!({
            "jsonrpc": "2.0",
            "method": "blockchain.headers.subscribe",
            "params": [{ "height": height, "hex": hex }],
        });
        self.broadcast_line(format!("{note}\n"));
    }

    async fn respond(&self, method: &str, params: &[Value]) -> Option<Result<Value, Value>> {
        self.calls.lock().unwrap().push(method.to_string());
        let reply = match method {
            "server.version" => Ok(json!(["MockElectrum 1.0", "1.4"])),
            "server.banner" => Ok(self.banner.clone().into()),
            "server.donation_address" => Ok(self.donation_address.clone().into()),
            "server.peers.subscribe" => Ok(Value::Array(self.peers.lock().unwrap().clone())),
            "blockchain.headers.subscribe" => {
                let (height, hex) = self.tip.lock().unwrap().clone();
                Ok(json!({ "height": height, "hex": hex }))
            }
            "blockchain.estimatefee" => Ok(json!(0.0001)),
            "blockchain.relayfee" => Ok(json!(0.00001)),
            "mempool.get_fee_histogram" => Ok(json!([[0.1, 100000]])),
            "blockchain.scripthash.subscribe" => {
                let key = params.first().and_then(Value::as_str).unwrap_or_default();
                Ok(self
                    .statuses
                    .lock()
                    .unwrap()
                    .get(key)
                    .cloned()
                    .unwrap_or(Value::Null))
            }
            "blockchain.scripthash.get_history" => {
                let key = params.first().and_then(Value::as_str).unwrap_or_default();
                Ok(self
                    .histories
                    .lock()
                    .unwrap()
                    .get(key)
                    .cloned()
                    .unwrap_or_else(|| json!([])))
            }
            "blockchain.transaction.get" => {
                let key = params.first().and_then(Value::as_str).unwrap_or_default();
                match self.txs.lock().unwrap().get(key) {
                    Some(raw) => Ok(raw.clone().into()),
                    None => Err(json!({"code": -32600, "message": "tx not found"})),
                }
            }
            "blockchain.transaction.broadcast" => {
                if self.stall_broadcast.load(Ordering::SeqCst) {
                    return None;
                }
                Ok(self.broadcast_reply.lock().unwrap().clone())
            }
            "blockchain.transaction.get_merkle" => Ok(json!({
                "block_height": params.get(1).cloned().unwrap_or(Value::Null),
                "merkle": [],
                "pos": 0,
            })),
            "blockchain.block.headers" => {
                self.header_chunk_requests.fetch_add(1, Ordering::SeqCst);
                let delay = self.chunk_delay_ms.load(Ordering::SeqCst);
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Ok(json!({ "hex": "", "count": 0, "max": 2016 }))
            }
            other => Err(json!({"code": -32601, "message": format!("unknown method {other}")})),
        };
        Some(reply)
    }
}

/// A newline-framed JSON-RPC electrum server on a loopback port.
pub struct MockServer {
    pub addr: SocketAddr,
    pub state: Arc<MockState>,
    accept: tokio::task::JoinHandle<()>,
}

impl MockServer {
    pub async fn start(state: Arc<MockState>) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let accept_state = state.clone();
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(handle_connection(stream, accept_state.clone()));
            }
        });
        Ok(Self {
            addr,
            state,
            accept,
        })
    }

    pub fn server_addr(&self) -> ServerAddr {
        ServerAddr::new("127.0.0.1", self.addr.port(), Proto::Tcp)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<MockState>) {
    let (read, mut write) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    state.connections.lock().unwrap().push(tx.clone());

    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if write.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(read).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(req) = serde_json::from_str::<Value>(&line) else {
            break;
        };
        let id = req.get("id").cloned().unwrap_or(Value::Null);
        let method = req.get("method").and_then(Value::as_str).unwrap_or_default();
        let params: Vec<Value> = req
            .get("params")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let state = state.clone();
        let tx = tx.clone();
        let method = method.to_string();
        // per-request task so a slow reply doesn't block the pipe
        tokio::spawn(async move {
            match state.respond(&method, &params).await {
                Some(Ok(result)) => {
                    let _ = tx.send(format!("{}\n", json!({"id": id, "result": result})));
                }
                Some(Err(error)) => {
                    let _ = tx.send(format!("{}\n", json!({"id": id, "error": error})));
                }
                None => {}
            }
        });
    }
}
