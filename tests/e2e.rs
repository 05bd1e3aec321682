use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::{
    absolute, transaction, Address, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn,
    TxOut, Txid, Witness,
};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::sleep;
use vianet::config::Config;
use vianet::events::{Event, EventKind, Handler};
use vianet::network::{Network, NetworkParameters};
use vianet::sync::{history_status, Synchronizer};
use vianet::testutils::{
    make_header_chain, MemoryConfig, MemoryHeaderStore, MemoryWallet, MockServer, MockState,
};
use vianet::wallet::address_to_scripthash;
use vianet::wallet::WalletStore;
use vianet::{ProxyMode, ProxySpec, ServerAddr};

const ALL_EVENTS: &[EventKind] = &[
    EventKind::Status,
    EventKind::Banner,
    EventKind::Fee,
    EventKind::FeeHistogram,
    EventKind::Updated,
    EventKind::Servers,
    EventKind::Interfaces,
    EventKind::ProxySet,
    EventKind::DefaultServerChanged,
    EventKind::NewTransaction,
];

fn test_config(server: &ServerAddr) -> Arc<Config> {
    Arc::new(Config::new(Box::new(
        MemoryConfig::new(None)
            .with_value("server", server.to_string().into())
            .with_value("oneserver", true.into())
            .with_value("auto_connect", false.into()),
    )))
}

async fn boot(
    tip_height: u32,
    chain_len: usize,
) -> (MockServer, Network, mpsc::UnboundedReceiver<Event>) {
    let chain = make_header_chain(chain_len);
    let mock = MockServer::start(MockState::new(tip_height, &chain[tip_height as usize]))
        .await
        .unwrap();
    let network = Network::new(
        test_config(&mock.server_addr()),
        Arc::new(MemoryHeaderStore::new(chain)),
    );
    let (tx, rx) = mpsc::unbounded_channel();
    network.register_callback(Handler::Async(tx), ALL_EVENTS);
    network.start();
    (mock, network, rx)
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !cond() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

fn dummy_tx(lock_time: u32) -> Transaction {
    Transaction {
        version: transaction::Version::TWO,
        lock_time: absolute::LockTime::from_consensus(lock_time),
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(1000),
            script_pubkey: ScriptBuf::new(),
        }],
    }
}

#[tokio::test]
async fn boot_with_one_peer_reaches_connected_with_ordered_events() {
    let (mock, network, mut rx) = boot(4, 5).await;

    let mut events = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        while !events.iter().any(|e: &Event| e.kind() == EventKind::Fee) {
            events.push(rx.recv().await.expect("event stream closed"));
        }
    })
    .await
    .expect("never saw the fee event");

    assert!(network.is_connected());
    assert_eq!(network.get_interfaces(), vec![mock.server_addr()]);

    // status went connecting -> connected
    let statuses: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            Event::Status(s) => Some(*s),
            _ => None,
        })
        .collect();
    assert_eq!(
        statuses,
        vec![
            vianet::ConnectionStatus::Connecting,
            vianet::ConnectionStatus::Connected
        ]
    );

    // the metadata chain arrives in request order
    let kinds: Vec<EventKind> = events.iter().map(Event::kind).collect();
    let pos = |kind: EventKind| kinds.iter().position(|k| *k == kind);
    let banner = pos(EventKind::Banner).expect("no banner");
    let servers = pos(EventKind::Servers).expect("no servers");
    let histogram = pos(EventKind::FeeHistogram).expect("no fee histogram");
    let fee = pos(EventKind::Fee).expect("no fee");
    assert!(banner < servers && servers < histogram && histogram < fee);
    assert!(pos(EventKind::Updated).is_some());
    assert!(pos(EventKind::Interfaces).is_some());
    assert!(pos(EventKind::DefaultServerChanged).is_some());

    assert_eq!(network.get_server_height(), 4);
    assert_eq!(network.get_local_height(), 4);

    network.stop();
}

#[tokio::test]
async fn concurrent_chunk_requests_issue_one_rpc() {
    let (mock, network, _rx) = boot(4, 5).await;
    wait_until("connection", || network.is_connected()).await;

    mock.state.chunk_delay_ms.store(200, Ordering::SeqCst);
    let height = 2016 * 42;
    let (r1, r2) = tokio::join!(
        network.request_chunk(height, None, None, true),
        network.request_chunk(height, None, None, true),
    );
    let r1 = r1.unwrap();
    let r2 = r2.unwrap();
    // one went through, the other returned early
    assert_eq!(r1.is_none() as u8 + r2.is_none() as u8, 1);
    assert_eq!(mock.state.header_chunk_requests.load(Ordering::SeqCst), 1);

    network.stop();
}

#[tokio::test]
async fn chunk_request_at_tip_boundary_does_not_rpc() {
    let (mock, network, _rx) = boot(4, 5).await;
    wait_until("connection", || network.is_connected()).await;

    let height = 2016 * 42;
    let result = network
        .request_chunk(height, Some(height), None, false)
        .await
        .unwrap();
    assert_eq!(result, Some((true, 0)));
    assert_eq!(mock.state.header_chunk_requests.load(Ordering::SeqCst), 0);

    network.stop();
}

#[tokio::test]
async fn broadcast_results_are_tagged_not_thrown() {
    let (mock, network, _rx) = boot(4, 5).await;
    wait_until("connection", || network.is_connected()).await;

    let tx = dummy_tx(0);
    let txid = tx.compute_txid().to_string();

    // server echoes a different txid
    *mock.state.broadcast_reply.lock().unwrap() = json!("deadbeef");
    let (ok, message) = network.broadcast_transaction(&tx, None).await;
    assert!(!ok);
    assert_eq!(message, "error: deadbeef");

    // server accepts
    *mock.state.broadcast_reply.lock().unwrap() = json!(txid.clone());
    let (ok, message) = network.broadcast_transaction(&tx, None).await;
    assert!(ok);
    assert_eq!(message, txid);

    // server never answers
    mock.state.stall_broadcast.store(true, Ordering::SeqCst);
    let (ok, message) = network
        .broadcast_transaction(&tx, Some(Duration::from_millis(200)))
        .await;
    assert!(!ok);
    assert_eq!(message, "error: operation timed out");

    network.stop();
}

#[tokio::test]
async fn address_status_change_drives_history_and_tx_fetch() {
    let (mock, network, mut rx) = boot(4, 5).await;
    wait_until("connection", || network.is_connected()).await;

    let addr = Address::from_str("1BitcoinEaterAddressDontSendf59kuE")
        .unwrap()
        .assume_checked();
    let scripthash = address_to_scripthash(&addr);
    let t1 = Txid::from_str(&format!("{:064x}", 0x11u8)).unwrap();
    let t2_tx = dummy_tx(7);
    let t2 = t2_tx.compute_txid();

    let wallet = Arc::new(MemoryWallet::new());
    wallet.add_address(addr.clone());
    wallet.set_history(addr.clone(), vec![(t1, 100)]);
    wallet.insert_tx(t1, dummy_tx(1));

    let status = history_status(&vec![(t1, 100)]).unwrap();
    mock.state
        .statuses
        .lock()
        .unwrap()
        .insert(scripthash.clone(), status.into());
    mock.state.histories.lock().unwrap().insert(
        scripthash.clone(),
        json!([{ "tx_hash": t1.to_string(), "height": 100 }]),
    );

    let synchronizer = Synchronizer::new(wallet.clone(), network.clone());
    let driver = tokio::spawn(synchronizer.clone().main());

    // matching status: subscription settles without a history fetch
    wait_until("subscription", || {
        mock.state.calls_of("blockchain.scripthash.subscribe") >= 1
            && synchronizer.is_up_to_date()
    })
    .await;
    // give the queued initial status time to be handled before checking
    sleep(Duration::from_millis(100)).await;
    assert_eq!(mock.state.calls_of("blockchain.scripthash.get_history"), 0);

    // new status: history is fetched, the missing tx requested & committed
    let new_history = vec![(t1, 100), (t2, 101)];
    let new_status = history_status(&new_history).unwrap();
    mock.state.histories.lock().unwrap().insert(
        scripthash.clone(),
        json!([
            { "tx_hash": t1.to_string(), "height": 100 },
            { "tx_hash": t2.to_string(), "height": 101 },
        ]),
    );
    mock.state.txs.lock().unwrap().insert(
        t2.to_string(),
        bitcoin::consensus::encode::serialize_hex(&t2_tx),
    );
    mock.state.push_status(&scripthash, new_status.into());

    wait_until("transaction commit", || wallet.get_tx(&t2).is_some()).await;
    assert_eq!(wallet.get_tx(&t2).unwrap(), t2_tx);
    wait_until("history commit", || {
        history_status(&wallet.history(&addr)) == history_status(&new_history)
    })
    .await;
    wait_until("up to date", || synchronizer.is_up_to_date()).await;

    let mut saw_new_tx = false;
    while let Ok(event) = rx.try_recv() {
        if let Event::NewTransaction(tx) = event {
            assert_eq!(tx.compute_txid(), t2);
            saw_new_tx = true;
        }
    }
    assert!(saw_new_tx, "new_transaction event was not emitted");

    driver.abort();
    network.stop();
}

#[tokio::test]
async fn proxy_change_restarts_the_network() {
    let (mock, network, mut rx) = boot(4, 5).await;
    wait_until("connection", || network.is_connected()).await;
    assert_eq!(network.get_interfaces(), vec![mock.server_addr()]);
    // discard the boot events, including the initial proxy_set(none)
    while rx.try_recv().is_ok() {}

    let proxy = ProxySpec {
        mode: ProxyMode::Socks5,
        host: "127.0.0.1".to_string(),
        port: 1, // nothing listens here
        user: None,
        password: None,
    };
    network.set_parameters(NetworkParameters {
        server: mock.server_addr(),
        proxy: Some(proxy.clone()),
        auto_connect: false,
    });

    assert_eq!(network.get_parameters().proxy, Some(proxy.clone()));
    assert!(network.get_interfaces().is_empty());

    let mut saw_proxy_set = false;
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = rx.recv().await {
            if let Event::ProxySet(p) = event {
                assert_eq!(p, Some(proxy.clone()));
                saw_proxy_set = true;
                break;
            }
        }
    })
    .await
    .expect("proxy_set event was not emitted");
    assert!(saw_proxy_set);

    network.stop();
}

#[tokio::test]
async fn rejected_config_write_aborts_parameter_change() {
    let chain = make_header_chain(5);
    let mock = MockServer::start(MockState::new(4, &chain[4])).await.unwrap();
    let store = MemoryConfig::new(None)
        .with_value("server", mock.server_addr().to_string().into())
        .with_value("oneserver", true.into())
        .with_value("auto_connect", false.into());
    store.read_only.store(true, Ordering::SeqCst);
    let network = Network::new(
        Arc::new(Config::new(Box::new(store))),
        Arc::new(MemoryHeaderStore::new(chain)),
    );
    network.start();
    wait_until("connection", || network.is_connected()).await;

    let before = network.get_parameters();
    network.set_parameters(NetworkParameters {
        server: mock.server_addr(),
        proxy: Some(ProxySpec {
            mode: ProxyMode::Socks5,
            host: "127.0.0.1".to_string(),
            port: 1,
            user: None,
            password: None,
        }),
        auto_connect: false,
    });
    // the store rejected the write: nothing changed, no restart happened
    assert_eq!(network.get_parameters(), before);
    assert_eq!(network.get_interfaces(), vec![mock.server_addr()]);

    network.stop();
}

#[tokio::test]
async fn merkle_proof_passthrough() {
    let (_mock, network, _rx) = boot(4, 5).await;
    wait_until("connection", || network.is_connected()).await;

    let txid = Txid::from_str(&format!("{:064x}", 0x42u8)).unwrap();
    let proof = network.get_merkle_for_transaction(txid, 4).await.unwrap();
    assert_eq!(proof["block_height"], json!(4));

    network.stop();
}
