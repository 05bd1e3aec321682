use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use bitcoin::block::Header;
use bitcoin::consensus::Decodable;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::chain::ChainRef;
use crate::connect::Connector;
use crate::constants::{CLIENT_NAME, PROTOCOL_VERSION};
use crate::error::Error;
use crate::network::HeaderSync;
use crate::server::{versiontuple, ServerAddr};
use crate::session::RpcSession;
use crate::task::TaskGroup;

/// One live server session. Opening returns immediately; `wait_ready`
/// resolves once TLS and version negotiation are done. The driver task
/// then follows the server's headers subscription until the connection
/// dies, at which point the recorded exception marks the interface dead
/// and the network manager decides what to do. An interface never
/// restarts itself.
pub struct Interface {
    pub server: ServerAddr,
    session: OnceLock<Arc<RpcSession>>,
    ready_rx: Mutex<Option<oneshot::Receiver<()>>>,
    tip: AtomicU32,
    tip_header: Mutex<Option<Header>>,
    blockchain: AtomicU32,
    pub group: TaskGroup,
    exception: Mutex<Option<Error>>,
    finished: AtomicBool,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Interface {
    pub(crate) fn open(
        server: ServerAddr,
        connector: Arc<Connector>,
        headers: HeaderSync,
    ) -> Arc<Self> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let interface = Arc::new(Self {
            server,
            session: OnceLock::new(),
            ready_rx: Mutex::new(Some(ready_rx)),
            tip: AtomicU32::new(0),
            tip_header: Mutex::new(None),
            blockchain: AtomicU32::new(0),
            group: TaskGroup::new(),
            exception: Mutex::new(None),
            finished: AtomicBool::new(false),
            driver: Mutex::new(None),
        });

        let iface = interface.clone();
        let driver = tokio::spawn(async move {
            let result = iface.clone().run(connector, headers, ready_tx).await;
            if let Some(session) = iface.session.get() {
                session.shutdown();
            }
            iface.group.close();
            if let Err(e) = result {
                *iface.exception.lock().expect("exception slot poisoned") = Some(e);
            }
            iface.finished.store(true, Ordering::SeqCst);
        });
        *interface.driver.lock().expect("driver slot poisoned") = Some(driver);
        interface
    }

    /// Consumes the readiness signal; only the connection supervisor waits
    /// on it. An error means the driver gave up before becoming usable.
    pub(crate) fn take_ready(&self) -> Option<oneshot::Receiver<()>> {
        self.ready_rx.lock().expect("ready slot poisoned").take()
    }

    pub fn session(&self) -> Result<Arc<RpcSession>, Error> {
        self.session.get().cloned().ok_or(Error::NotConnected)
    }

    pub fn tip(&self) -> u32 {
        self.tip.load(Ordering::SeqCst)
    }

    pub fn tip_header(&self) -> Option<Header> {
        *self.tip_header.lock().expect("tip header poisoned")
    }

    /// The fork of the header store this interface is currently on.
    pub fn blockchain(&self) -> ChainRef {
        self.blockchain.load(Ordering::SeqCst)
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub(crate) fn take_exception(&self) -> Option<Error> {
        self.exception.lock().expect("exception slot poisoned").take()
    }

    /// Drop the socket and cancel all server-scoped work.
    pub fn close(&self) {
        if let Some(driver) = self.driver.lock().expect("driver slot poisoned").take() {
            driver.abort();
        }
        if let Some(session) = self.session.get() {
            session.shutdown();
        }
        self.group.close();
    }

    async fn run(
        self: Arc<Self>,
        connector: Arc<Connector>,
        headers: HeaderSync,
        ready_tx: oneshot::Sender<()>,
    ) -> Result<(), Error> {
        let stream = connector.connect(&self.server).await?;
        let (session, reader) = RpcSession::new(self.server.clone(), stream);
        let _ = self.session.set(session.clone());

        // the reader must be pumping before any request can resolve
        let mut reader_task = tokio::spawn(reader.run());
        let iface = self.clone();
        let logic = async move {
            iface.negotiate_version(&session).await?;
            if ready_tx.send(()).is_err() {
                // supervisor gave up on us (timeout), nothing left to do
                return Err(Error::SessionClosed);
            }
            iface.follow_headers(&session, &headers).await
        };
        tokio::pin!(logic);

        tokio::select! {
            r = &mut reader_task => match r {
                Ok(Ok(())) => Err(Error::SessionClosed),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(e.into()),
            },
            r = &mut logic => {
                reader_task.abort();
                r
            }
        }
    }

    async fn negotiate_version(&self, session: &RpcSession) -> Result<(), Error> {
        let result = session
            .send_request(
                "server.version",
                vec![CLIENT_NAME.into(), PROTOCOL_VERSION.into()],
            )
            .await?;
        let proto = result
            .get(1)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::HandshakeFailed {
                server: self.server.clone(),
                reason: format!("bad server.version reply: {result}"),
            })?;
        let required = versiontuple(PROTOCOL_VERSION).expect("const version parses");
        match versiontuple(proto) {
            Some(v) if v >= required => Ok(()),
            _ => Err(Error::VersionTooOld {
                server: self.server.clone(),
                version: proto.to_string(),
            }),
        }
    }

    async fn follow_headers(
        &self,
        session: &Arc<RpcSession>,
        headers: &HeaderSync,
    ) -> Result<(), Error> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        session
            .subscribe("blockchain.headers.subscribe", vec![], tx)
            .await?;
        // the initial value arrives as the first queue element
        while let Some((_, payload)) = rx.recv().await {
            let (height, header) = parse_header_notification(&payload)?;
            log::debug!("{} new tip {}", self.server, height);
            self.tip.store(height, Ordering::SeqCst);
            *self.tip_header.lock().expect("tip header poisoned") = Some(header);
            self.sync_header(session, headers, height, header).await?;
        }
        Err(Error::SessionClosed)
    }

    /// Reconcile the announced tip with the header store, backfilling
    /// missing epochs chunk by chunk through the manager's coordinator.
    async fn sync_header(
        &self,
        session: &Arc<RpcSession>,
        headers: &HeaderSync,
        height: u32,
        header: Header,
    ) -> Result<(), Error> {
        let _bhi = headers.bhi_lock.lock().await;

        // already on a fork that has this header?
        for fork in headers.store.forks() {
            if headers.store.read_header(fork, height) == Some(header) {
                self.blockchain.store(fork, Ordering::SeqCst);
                return Ok(());
            }
        }

        let fork = self.blockchain();
        if headers.store.can_connect(fork, &header, height) {
            headers.store.connect_header(fork, header, height);
            return Ok(());
        }

        // behind by more than one header: backfill whole chunks
        let mut last_local = None;
        loop {
            let local = headers.store.height(fork);
            if local >= height {
                break;
            }
            // a server replaying data we already hold must not spin us
            if last_local == Some(local) {
                log::warn!("{} made no backfill progress, giving up", self.server);
                break;
            }
            last_local = Some(local);
            match headers
                .chunks
                .request(session, &*headers.store, fork, local + 1, Some(height), true)
                .await?
            {
                // the tip is inside the epoch we already hold
                Some((true, 0)) => break,
                Some((true, _)) => continue,
                Some((false, _)) => {
                    log::warn!("{} sent a chunk that does not connect", self.server);
                    break;
                }
                // another task is already fetching this epoch
                None => break,
            }
        }
        if headers.store.can_connect(fork, &header, height) {
            headers.store.connect_header(fork, header, height);
        }
        Ok(())
    }
}

fn parse_header_notification(payload: &Value) -> Result<(u32, Header), Error> {
    let bad = || Error::BadNotification {
        method: "blockchain.headers.subscribe".to_string(),
    };
    let height = payload
        .get("height")
        .and_then(Value::as_u64)
        .and_then(|h| u32::try_from(h).ok())
        .ok_or_else(bad)?;
    let hex = payload.get("hex").and_then(Value::as_str).ok_or_else(bad)?;
    let raw = hex::decode(hex)?;
    let header = Header::consensus_decode(&mut raw.as_slice())?;
    Ok((height, header))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_notification_parsing() {
        // regtest genesis header
        let hex = "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4adae5494dffff7f2002000000";
        let payload = serde_json::json!({ "hex": hex, "height": 0 });
        let (height, header) = parse_header_notification(&payload).unwrap();
        assert_eq!(height, 0);
        assert_eq!(header.version.to_consensus(), 1);

        for bad in [
            serde_json::json!({ "height": 5 }),
            serde_json::json!({ "hex": hex }),
            serde_json::json!({ "hex": "zz", "height": 5 }),
        ] {
            assert!(parse_header_notification(&bad).is_err());
        }
    }
}
