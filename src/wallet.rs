use std::collections::HashMap;

use bitcoin::hashes::{sha256, Hash};
use bitcoin::{Address, Transaction, Txid};

/// Confirmed history entries carry the block height; 0 means mempool and
/// -1 mempool with unconfirmed parents, as reported by the server.
pub type TxHistory = Vec<(Txid, i32)>;

/// What the synchronizer needs from the wallet state store. All methods are
/// synchronous; implementations are expected to be cheap in-memory views
/// over whatever persistence the wallet uses.
pub trait WalletStore: Send + Sync + 'static {
    fn addresses(&self) -> Vec<Address>;

    /// Let the wallet extend its address chain (gap-limit generation) and
    /// return whatever addresses it created, so they can be subscribed.
    fn synchronize(&self) -> Vec<Address>;

    fn history(&self, addr: &Address) -> TxHistory;

    fn all_histories(&self) -> Vec<(Address, TxHistory)>;

    fn has_transaction(&self, txid: &Txid) -> bool;

    fn receive_history(&self, addr: &Address, hist: TxHistory, fees: HashMap<Txid, u64>);

    fn receive_transaction(&self, txid: Txid, tx: Transaction, height: i32);

    fn is_up_to_date(&self) -> bool;

    fn set_up_to_date(&self, up_to_date: bool);
}

/// The electrum address key: sha256 of the output script, reversed, hex.
pub fn address_to_scripthash(addr: &Address) -> String {
    let script = addr.script_pubkey();
    let hash = sha256::Hash::hash(script.as_bytes());
    let mut bytes = hash.to_byte_array();
    bytes.reverse();
    hex::encode(bytes)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn scripthash_is_reversed_sha256_of_script() {
        // genesis coinbase P2PK would differ; use a fixed P2PKH address
        let addr = Address::from_str("1BitcoinEaterAddressDontSendf59kuE")
            .unwrap()
            .assume_checked();
        let h = address_to_scripthash(&addr);
        assert_eq!(h.len(), 64);
        // reversing twice gets back the straight sha256 of the script
        let script = addr.script_pubkey();
        let straight = sha256::Hash::hash(script.as_bytes());
        let mut reversed = hex::decode(&h).unwrap();
        reversed.reverse();
        assert_eq!(reversed, straight.to_byte_array());
    }
}
