use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bitcoin::Transaction;
use tokio::sync::mpsc;

use crate::server::{ProxySpec, ServerAddr, ServerMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Status,
    Banner,
    Fee,
    FeeHistogram,
    Updated,
    Servers,
    Interfaces,
    ProxySet,
    DefaultServerChanged,
    NewTransaction,
}

#[derive(Debug, Clone)]
pub enum Event {
    Status(ConnectionStatus),
    Banner(String),
    Fee(HashMap<u32, u64>),
    FeeHistogram(Vec<(f64, u64)>),
    Updated,
    Servers(ServerMap),
    Interfaces(Vec<ServerAddr>),
    ProxySet(Option<ProxySpec>),
    DefaultServerChanged(ServerAddr),
    NewTransaction(Transaction),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Status(_) => EventKind::Status,
            Event::Banner(_) => EventKind::Banner,
            Event::Fee(_) => EventKind::Fee,
            Event::FeeHistogram(_) => EventKind::FeeHistogram,
            Event::Updated => EventKind::Updated,
            Event::Servers(_) => EventKind::Servers,
            Event::Interfaces(_) => EventKind::Interfaces,
            Event::ProxySet(_) => EventKind::ProxySet,
            Event::DefaultServerChanged(_) => EventKind::DefaultServerChanged,
            Event::NewTransaction(_) => EventKind::NewTransaction,
        }
    }
}

/// Pull-style counterpart of the pushed events, see `Network::get_status_value`.
#[derive(Debug, Clone)]
pub enum StatusValue {
    Status(ConnectionStatus),
    Banner(String),
    Fee(HashMap<u32, u64>),
    FeeHistogram(Vec<(f64, u64)>),
    Heights { local: u32, server: u32 },
    Servers(ServerMap),
    Interfaces(Vec<ServerAddr>),
}

/// Sync handlers run on the emitting task, async ones get the event
/// delivered to a channel the subscriber drains on its own task.
#[derive(Clone)]
pub enum Handler {
    Sync(Arc<dyn Fn(&Event) + Send + Sync>),
    Async(mpsc::UnboundedSender<Event>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackId(u64);

struct Subscriber {
    id: CallbackId,
    kinds: HashSet<EventKind>,
    handler: Handler,
}

#[derive(Default)]
pub struct CallbackBus {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl CallbackBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: Handler, kinds: &[EventKind]) -> CallbackId {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .lock()
            .expect("callback registry poisoned")
            .push(Subscriber {
                id,
                kinds: kinds.iter().copied().collect(),
                handler,
            });
        id
    }

    pub fn unregister(&self, id: CallbackId) {
        self.subscribers
            .lock()
            .expect("callback registry poisoned")
            .retain(|s| s.id != id);
    }

    /// Dispatch to a snapshot of subscribers. The lock is not held while
    /// handlers run; a subscriber that went away just gets dropped.
    pub fn trigger(&self, event: Event) {
        let interested: Vec<Handler> = {
            let subscribers = self
                .subscribers
                .lock()
                .expect("callback registry poisoned");
            subscribers
                .iter()
                .filter(|s| s.kinds.contains(&event.kind()))
                .map(|s| s.handler.clone())
                .collect()
        };
        for handler in interested {
            match handler {
                Handler::Sync(f) => f(&event),
                Handler::Async(tx) => {
                    let _ = tx.send(event.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn collector() -> (Handler, Arc<Mutex<Vec<EventKind>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let handler = Handler::Sync(Arc::new(move |e: &Event| {
            seen2.lock().unwrap().push(e.kind());
        }));
        (handler, seen)
    }

    #[test]
    fn dispatch_filters_by_kind() {
        let bus = CallbackBus::new();
        let (handler, seen) = collector();
        bus.register(handler, &[EventKind::Banner, EventKind::Updated]);

        bus.trigger(Event::Banner("hello".into()));
        bus.trigger(Event::Status(ConnectionStatus::Connected));
        bus.trigger(Event::Updated);

        assert_eq!(*seen.lock().unwrap(), vec![EventKind::Banner, EventKind::Updated]);
    }

    #[test]
    fn unregister_stops_delivery() {
        let bus = CallbackBus::new();
        let (handler, seen) = collector();
        let id = bus.register(handler, &[EventKind::Updated]);
        bus.trigger(Event::Updated);
        bus.unregister(id);
        bus.trigger(Event::Updated);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn async_handler_gets_events_on_channel() {
        let bus = CallbackBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.register(Handler::Async(tx), &[EventKind::Banner]);
        bus.trigger(Event::Banner("motd".into()));
        match rx.recv().await {
            Some(Event::Banner(b)) => assert_eq!(b, "motd"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn dead_async_subscriber_is_harmless() {
        let bus = CallbackBus::new();
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        bus.register(Handler::Async(tx), &[EventKind::Updated]);
        bus.trigger(Event::Updated);
    }
}
