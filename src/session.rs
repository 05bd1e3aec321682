use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};

use crate::connect::NetStream;
use crate::constants::RPC_TIMEOUT;
use crate::error::Error;
use crate::server::ServerAddr;
use crate::RPC_COUNTER;

/// Items pushed to a subscription queue: the notification key (first
/// request parameter, or the method itself for parameterless subs) and the
/// payload.
pub type SubQueue = mpsc::UnboundedSender<(String, Value)>;

type SubKey = (String, Option<String>);
type Pending = oneshot::Sender<Result<Value, Error>>;

/// One newline-framed JSON-RPC 2.0 pipe. Requests are correlated by id,
/// server pushes are routed to the queue registered by `subscribe`. All
/// requests in flight fail with `SessionClosed` when the pipe dies.
pub struct RpcSession {
    server: ServerAddr,
    writer: tokio::sync::Mutex<WriteHalf<NetStream>>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, Pending>>,
    subscriptions: Mutex<HashMap<SubKey, SubQueue>>,
    closed: AtomicBool,
}

impl RpcSession {
    pub fn new(server: ServerAddr, stream: NetStream) -> (Arc<Self>, SessionReader) {
        let (read, write) = tokio::io::split(stream);
        let session = Arc::new(Self {
            server,
            writer: tokio::sync::Mutex::new(write),
            next_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        let reader = SessionReader {
            session: session.clone(),
            reader: BufReader::new(read),
        };
        (session, reader)
    }

    pub fn server(&self) -> &ServerAddr {
        &self.server
    }

    pub async fn send_request(&self, method: &str, params: Vec<Value>) -> Result<Value, Error> {
        self.send_request_timeout(method, params, RPC_TIMEOUT).await
    }

    pub async fn send_request_timeout(
        &self,
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, Error> {
        let (id, rx) = self.post(method, params).await?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::SessionClosed),
            Err(_) => {
                self.pending.lock().expect("pending poisoned").remove(&id);
                Err(Error::Timeout)
            }
        }
    }

    /// Register `queue` for pushes keyed on this subscription, then perform
    /// the initial request. The initial value is both returned and
    /// delivered as the first queue element, so consumers only need one
    /// code path.
    pub async fn subscribe(
        &self,
        method: &str,
        params: Vec<Value>,
        queue: SubQueue,
    ) -> Result<Value, Error> {
        let param_key = params.first().and_then(Value::as_str).map(str::to_string);
        let key = (method.to_string(), param_key.clone());
        self.subscriptions
            .lock()
            .expect("subscriptions poisoned")
            .insert(key, queue.clone());
        let result = self.send_request(method, params).await?;
        let _ = queue.send((param_key.unwrap_or_else(|| method.to_string()), result.clone()));
        Ok(result)
    }

    async fn post(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<(u64, oneshot::Receiver<Result<Value, Error>>), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::SessionClosed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending poisoned")
            .insert(id, tx);
        RPC_COUNTER.with_label_values(&[method]).inc();
        let mut line = serde_json::to_string(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        }))?;
        line.push('\n');
        log::trace!("{} >>> {}", self.server, line.trim_end());
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok((id, rx))
    }

    fn handle_line(&self, line: &str) -> Result<(), Error> {
        log::trace!("{} <<< {}", self.server, line);
        let msg: Value = serde_json::from_str(line)?;
        if let Some(id) = msg.get("id").and_then(Value::as_u64) {
            let result = match msg.get("error").filter(|e| !e.is_null()) {
                Some(err) => Err(rpc_error(err)),
                None => Ok(msg.get("result").cloned().unwrap_or(Value::Null)),
            };
            if let Some(tx) = self.pending.lock().expect("pending poisoned").remove(&id) {
                let _ = tx.send(result);
            }
            Ok(())
        } else if let Some(method) = msg.get("method").and_then(Value::as_str) {
            self.dispatch_notification(method, msg.get("params"))
        } else {
            Err(Error::BadNotification {
                method: "<no method>".to_string(),
            })
        }
    }

    fn dispatch_notification(&self, method: &str, params: Option<&Value>) -> Result<(), Error> {
        let params = params.and_then(Value::as_array).ok_or_else(|| {
            Error::BadNotification {
                method: method.to_string(),
            }
        })?;
        let subscriptions = self.subscriptions.lock().expect("subscriptions poisoned");
        if let Some(key) = params.first().and_then(Value::as_str) {
            let lookup = (method.to_string(), Some(key.to_string()));
            if let Some(queue) = subscriptions.get(&lookup) {
                let payload = params.get(1).cloned().unwrap_or(Value::Null);
                let _ = queue.send((key.to_string(), payload));
                return Ok(());
            }
        }
        if let Some(queue) = subscriptions.get(&(method.to_string(), None)) {
            let payload = params.first().cloned().unwrap_or(Value::Null);
            let _ = queue.send((method.to_string(), payload));
            return Ok(());
        }
        log::debug!("{} push for unknown subscription {}", self.server, method);
        Ok(())
    }

    /// Fail everything in flight and refuse new requests. Called by the
    /// interface driver when the read loop exits.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let pending: Vec<Pending> = {
            let mut pending = self.pending.lock().expect("pending poisoned");
            pending.drain().map(|(_, tx)| tx).collect()
        };
        for tx in pending {
            let _ = tx.send(Err(Error::SessionClosed));
        }
        self.subscriptions
            .lock()
            .expect("subscriptions poisoned")
            .clear();
    }
}

fn rpc_error(err: &Value) -> Error {
    match err {
        Value::String(message) => Error::Rpc {
            code: 0,
            message: message.clone(),
        },
        _ => Error::Rpc {
            code: err.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
        },
    }
}

/// Owns the read half; the interface driver runs this to completion. An
/// `Ok` return is impossible, the loop only ends on transport or protocol
/// failure.
pub struct SessionReader {
    session: Arc<RpcSession>,
    reader: BufReader<ReadHalf<NetStream>>,
}

impl SessionReader {
    pub async fn run(mut self) -> Result<(), Error> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = self.reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(Error::SessionClosed);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            self.session.handle_line(trimmed)?;
        }
    }
}
