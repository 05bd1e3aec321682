use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;

use serde_json::Value;

use crate::constants::FEE_EST_REFRESH_INTERVAL;

/// Persistence backend for user-visible settings. `set` returns false when
/// the write was rejected (e.g. a read-only configuration), in which case
/// callers must not change runtime state either.
pub trait ConfigStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value, user_visible: bool) -> bool;
    fn datadir(&self) -> Option<PathBuf>;
}

/// Typed view over the store, plus the fee-estimate state the network
/// refreshes from its main server.
pub struct Config {
    store: Box<dyn ConfigStore>,
    fee_estimates: Mutex<HashMap<u32, u64>>,
    mempool_fees: Mutex<Vec<(f64, u64)>>,
    fee_estimates_requested: Mutex<Option<Instant>>,
}

impl Config {
    pub fn new(store: Box<dyn ConfigStore>) -> Self {
        Self {
            store,
            fee_estimates: Mutex::new(HashMap::new()),
            mempool_fees: Mutex::new(Vec::new()),
            fee_estimates_requested: Mutex::new(None),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.store.get(key)
    }

    pub fn set(&self, key: &str, value: Value, user_visible: bool) -> bool {
        self.store.set(key, value, user_visible)
    }

    pub fn datadir(&self) -> Option<PathBuf> {
        self.store.datadir()
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
    }

    pub fn oneserver(&self) -> bool {
        self.get_bool("oneserver", false)
    }

    pub fn auto_connect(&self) -> bool {
        self.get_bool("auto_connect", true)
    }

    pub fn noonion(&self) -> bool {
        self.get_bool("noonion", false)
    }

    pub fn server(&self) -> Option<String> {
        self.get("server")
            .and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn proxy(&self) -> Option<String> {
        self.get("proxy")
            .and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn blockchain_index(&self) -> u32 {
        self.get("blockchain_index")
            .and_then(|v| v.as_u64())
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0)
    }

    pub fn set_blockchain_index(&self, index: u32) {
        self.set("blockchain_index", index.into(), false);
    }

    pub fn fee_estimates(&self) -> HashMap<u32, u64> {
        self.fee_estimates.lock().expect("fee estimates poisoned").clone()
    }

    pub fn mempool_fees(&self) -> Vec<(f64, u64)> {
        self.mempool_fees.lock().expect("fee histogram poisoned").clone()
    }

    /// Apply a complete refresh in one go, targets and histogram together.
    pub fn update_fee_estimates(&self, estimates: HashMap<u32, u64>, histogram: Vec<(f64, u64)>) {
        *self.fee_estimates.lock().expect("fee estimates poisoned") = estimates;
        *self.mempool_fees.lock().expect("fee histogram poisoned") = histogram;
    }

    pub fn is_fee_estimates_update_required(&self) -> bool {
        let requested = self
            .fee_estimates_requested
            .lock()
            .expect("fee stamp poisoned");
        match *requested {
            None => true,
            Some(at) => at.elapsed() > FEE_EST_REFRESH_INTERVAL,
        }
    }

    /// Stamp the refresh attempt so the supervision loop doesn't pile up
    /// concurrent requests while one is in flight.
    pub fn requested_fee_estimates(&self) {
        *self
            .fee_estimates_requested
            .lock()
            .expect("fee stamp poisoned") = Some(Instant::now());
    }
}
