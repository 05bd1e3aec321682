use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use bitcoin::consensus::deserialize;
use bitcoin::hashes::{sha256, Hash};
use bitcoin::{Address, Transaction, Txid};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::constants::MAINTENANCE_TICK;
use crate::error::Error;
use crate::events::Event;
use crate::network::Network;
use crate::task::TaskGroup;
use crate::wallet::{address_to_scripthash, TxHistory, WalletStore};

/// The electrum per-address fingerprint: sha256 over the concatenated
/// `txhash:height:` pairs, hex encoded. `None` for an empty history.
pub fn history_status(history: &TxHistory) -> Option<String> {
    if history.is_empty() {
        return None;
    }
    let mut status = String::new();
    for (tx_hash, height) in history {
        status.push_str(&format!("{tx_hash}:{height}:"));
    }
    Some(sha256::Hash::hash(status.as_bytes()).to_string())
}

#[derive(Default)]
struct SyncState {
    /// Subscribed but not yet acknowledged by the server.
    requested_addrs: HashSet<Address>,
    /// In-flight history fetches, keyed by address, valued by the status
    /// that triggered them.
    requested_histories: HashMap<Address, Option<String>>,
    /// In-flight transaction fetches and the height they were seen at.
    requested_tx: HashMap<Txid, i32>,
    scripthash_to_address: HashMap<String, Address>,
}

/// Keeps one wallet convergent with the server's view of its addresses:
/// subscribes to status notifications on the main session, fetches any
/// history the wallet lacks, then any transaction the history names.
pub struct Synchronizer {
    wallet: Arc<dyn WalletStore>,
    network: Network,
    state: Mutex<SyncState>,
    add_tx: mpsc::UnboundedSender<Address>,
    add_rx: Mutex<Option<mpsc::UnboundedReceiver<Address>>>,
    status_tx: mpsc::UnboundedSender<(String, Value)>,
    status_rx: Mutex<Option<mpsc::UnboundedReceiver<(String, Value)>>>,
    group: TaskGroup,
}

impl Synchronizer {
    pub fn new(wallet: Arc<dyn WalletStore>, network: Network) -> Arc<Self> {
        let (add_tx, add_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            wallet,
            network,
            state: Mutex::new(SyncState::default()),
            add_tx,
            add_rx: Mutex::new(Some(add_rx)),
            status_tx,
            status_rx: Mutex::new(Some(status_rx)),
            group: TaskGroup::new(),
        })
    }

    /// Queue an address for subscription. Never suspends.
    pub fn add(&self, addr: Address) {
        self.state
            .lock()
            .expect("sync state poisoned")
            .requested_addrs
            .insert(addr.clone());
        let _ = self.add_tx.send(addr);
    }

    /// Nothing subscribed, fetched or awaited.
    pub fn is_up_to_date(&self) -> bool {
        let st = self.state.lock().expect("sync state poisoned");
        st.requested_addrs.is_empty()
            && st.requested_histories.is_empty()
            && st.requested_tx.is_empty()
    }

    /// The driver: subscribe pump, status pump and the bootstrap/tick loop
    /// in one scope. Any failure takes the whole scope down; the wallet is
    /// expected to restart it.
    pub async fn main(self: Arc<Self>) -> Result<(), Error> {
        let add_rx = self
            .add_rx
            .lock()
            .expect("add queue poisoned")
            .take()
            .expect("synchronizer main started twice");
        let status_rx = self
            .status_rx
            .lock()
            .expect("status queue poisoned")
            .take()
            .expect("synchronizer main started twice");

        let result = futures::try_join!(
            self.send_subscriptions(add_rx),
            self.clone().handle_status(status_rx),
            self.tick(),
        );
        self.group.close();
        result.map(|_| ())
    }

    async fn send_subscriptions(
        &self,
        mut add_rx: mpsc::UnboundedReceiver<Address>,
    ) -> Result<(), Error> {
        while let Some(addr) = add_rx.recv().await {
            let session = self.network.main_session()?;
            let scripthash = address_to_scripthash(&addr);
            self.state
                .lock()
                .expect("sync state poisoned")
                .scripthash_to_address
                .insert(scripthash.clone(), addr.clone());
            session
                .subscribe(
                    "blockchain.scripthash.subscribe",
                    vec![scripthash.into()],
                    self.status_tx.clone(),
                )
                .await?;
            self.state
                .lock()
                .expect("sync state poisoned")
                .requested_addrs
                .remove(&addr);
        }
        Err(Error::SessionClosed)
    }

    async fn handle_status(
        self: Arc<Self>,
        mut status_rx: mpsc::UnboundedReceiver<(String, Value)>,
    ) -> Result<(), Error> {
        while let Some((scripthash, status)) = status_rx.recv().await {
            let addr = self
                .state
                .lock()
                .expect("sync state poisoned")
                .scripthash_to_address
                .get(&scripthash)
                .cloned();
            let Some(addr) = addr else {
                log::debug!("status push for unknown scripthash {scripthash}");
                continue;
            };
            let status = match status {
                Value::String(s) => Some(s),
                _ => None,
            };
            let sync = self.clone();
            self.group.spawn(async move {
                if let Err(e) = sync.on_address_status(addr.clone(), status).await {
                    log::warn!("status handling for {addr} failed: {e}");
                }
            });
        }
        Err(Error::SessionClosed)
    }

    async fn on_address_status(&self, addr: Address, status: Option<String>) -> Result<(), Error> {
        let history = self.wallet.history(&addr);
        if history_status(&history) == status {
            return Ok(());
        }
        // note the server may now be telling us there is no history even
        // though we hold one
        {
            let mut st = self.state.lock().expect("sync state poisoned");
            if st.requested_histories.contains_key(&addr) {
                return Ok(());
            }
            st.requested_histories.insert(addr.clone(), status.clone());
        }
        let result = self.fetch_history(&addr, &status).await;
        // remove the request either way; this allows up_to_date to be true
        // and the next notification to retry
        self.state
            .lock()
            .expect("sync state poisoned")
            .requested_histories
            .remove(&addr);
        self.network.notify_updated();
        result
    }

    async fn fetch_history(&self, addr: &Address, status: &Option<String>) -> Result<(), Error> {
        let scripthash = address_to_scripthash(addr);
        let session = self.network.main_session()?;
        let result = session
            .send_request("blockchain.scripthash.get_history", vec![scripthash.into()])
            .await?;
        let items = result.as_array().cloned().unwrap_or_default();
        log::debug!("receiving history {addr} {}", items.len());

        let mut hist: TxHistory = Vec::with_capacity(items.len());
        let mut fees = HashMap::new();
        for item in &items {
            let (Some(tx_hash), Some(height)) = (
                item.get("tx_hash")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse::<Txid>().ok()),
                item.get("height").and_then(Value::as_i64),
            ) else {
                log::warn!("error: malformed history entry for {addr}");
                return Ok(());
            };
            hist.push((tx_hash, height as i32));
            if let Some(fee) = item.get("fee").and_then(Value::as_u64) {
                fees.insert(tx_hash, fee);
            }
        }

        let hashes: HashSet<Txid> = hist.iter().map(|(tx_hash, _)| *tx_hash).collect();
        if hashes.len() != hist.len() {
            log::warn!("error: server history has non-unique txids: {addr}");
        } else if &history_status(&hist) != status {
            log::warn!("error: status mismatch: {addr}");
        } else {
            self.wallet.receive_history(addr, hist.clone(), fees);
            self.request_missing_txs(&hist).await;
        }
        Ok(())
    }

    /// Fetch every transaction of `hist` the wallet doesn't hold yet, all
    /// concurrently. Individual failures are logged and dropped, the next
    /// status push re-triggers them.
    async fn request_missing_txs(&self, hist: &TxHistory) {
        let mut to_fetch = Vec::new();
        {
            let mut st = self.state.lock().expect("sync state poisoned");
            for (tx_hash, height) in hist {
                if st.requested_tx.contains_key(tx_hash) {
                    continue;
                }
                if self.wallet.has_transaction(tx_hash) {
                    continue;
                }
                st.requested_tx.insert(*tx_hash, *height);
                to_fetch.push(*tx_hash);
            }
        }
        futures::future::join_all(
            to_fetch
                .into_iter()
                .map(|tx_hash| self.get_transaction(tx_hash)),
        )
        .await;
    }

    async fn get_transaction(&self, tx_hash: Txid) {
        let fetched: Result<Transaction, Error> = async {
            let session = self.network.main_session()?;
            let result = session
                .send_request("blockchain.transaction.get", vec![tx_hash.to_string().into()])
                .await?;
            let raw = hex::decode(result.as_str().unwrap_or_default())?;
            Ok(deserialize(&raw)?)
        }
        .await;

        let pop = |state: &Mutex<SyncState>| {
            state
                .lock()
                .expect("sync state poisoned")
                .requested_tx
                .remove(&tx_hash)
        };
        let tx = match fetched {
            Ok(tx) => tx,
            Err(e) => {
                pop(&self.state);
                log::warn!("cannot fetch or deserialize transaction, skipping {tx_hash}: {e}");
                return;
            }
        };
        if tx.compute_txid() != tx_hash {
            pop(&self.state);
            log::warn!(
                "received tx does not match expected txid ({tx_hash} != {})",
                tx.compute_txid()
            );
            return;
        }
        let height = pop(&self.state).unwrap_or(0);
        self.wallet.receive_transaction(tx_hash, tx.clone(), height);
        log::debug!("received tx {tx_hash} height: {height}");
        self.network.trigger_event(Event::NewTransaction(tx));
    }

    /// Bootstrap (re-request transactions missing from known histories,
    /// subscribe every wallet address), then let the wallet extend its
    /// address chain on every tick and track the up-to-date edge.
    async fn tick(&self) -> Result<(), Error> {
        let histories = self.wallet.all_histories();
        futures::future::join_all(
            histories
                .iter()
                .map(|(_, history)| self.request_missing_txs(history)),
        )
        .await;
        for addr in self.wallet.addresses() {
            self.add(addr);
        }
        loop {
            sleep(MAINTENANCE_TICK).await;
            for addr in self.wallet.synchronize() {
                self.add(addr);
            }
            let up_to_date = self.is_up_to_date();
            if up_to_date != self.wallet.is_up_to_date() {
                self.wallet.set_up_to_date(up_to_date);
                self.network.notify_updated();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    fn txid(n: u8) -> Txid {
        Txid::from_str(&format!("{:064x}", n)).unwrap()
    }

    #[test]
    fn empty_history_has_no_status() {
        assert_eq!(history_status(&vec![]), None);
    }

    #[test]
    fn status_depends_on_order_and_heights() {
        let a = vec![(txid(1), 100), (txid(2), 101)];
        let b = vec![(txid(2), 101), (txid(1), 100)];
        let c = vec![(txid(1), 100), (txid(2), 102)];
        let sa = history_status(&a).unwrap();
        assert_ne!(sa, history_status(&b).unwrap());
        assert_ne!(sa, history_status(&c).unwrap());
        assert_eq!(sa, history_status(&a.clone()).unwrap());
        assert_eq!(sa.len(), 64);
    }

    #[test]
    fn status_digest_matches_protocol_format() {
        let history = vec![(txid(0xab), 100), (txid(0xcd), -1)];
        // rebuild the preimage by hand from the protocol definition
        let preimage = format!("{}:100:{}:-1:", txid(0xab), txid(0xcd));
        let expected = sha256::Hash::hash(preimage.as_bytes()).to_string();
        assert_eq!(history_status(&history).unwrap(), expected);
    }
}
