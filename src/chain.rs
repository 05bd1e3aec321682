use std::path::Path;

use bitcoin::block::Header;

use crate::constants::{CHECKPOINTS, CHUNK_SIZE, HEADER_SIZE};

/// A fork of the header store, identified by its forkpoint height.
pub type ChainRef = u32;

/// The slice of the blockchain/checkpoint store the network core needs:
/// a map of forks it can read headers from and append verified data to.
/// Validation of difficulty and checkpoints lives behind this trait.
pub trait HeaderStore: Send + Sync + 'static {
    fn forks(&self) -> Vec<ChainRef>;

    /// Best height known on the given fork.
    fn height(&self, fork: ChainRef) -> u32;

    fn read_header(&self, fork: ChainRef, height: u32) -> Option<Header>;

    fn can_connect(&self, fork: ChainRef, header: &Header, height: u32) -> bool;

    /// Append a single verified header, false if it doesn't fit.
    fn connect_header(&self, fork: ChainRef, header: Header, height: u32) -> bool;

    /// Append one chunk of raw 80-byte headers starting at
    /// `index * 2016`, false if validation fails.
    fn connect_chunk(&self, fork: ChainRef, index: u32, raw: &[u8]) -> bool;
}

/// Make sure the headers file backing fork 0 exists and covers at least the
/// checkpointed range, zero-filled. Idempotent.
pub fn init_headers_file(path: &Path) -> std::io::Result<()> {
    let length = (HEADER_SIZE * CHECKPOINTS * CHUNK_SIZE as usize) as u64;
    let current = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    if current < length {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        file.set_len(length)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn headers_file_zero_filled_to_checkpoint_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blockchain_headers");
        init_headers_file(&path).unwrap();
        let expected = (HEADER_SIZE * CHECKPOINTS * CHUNK_SIZE as usize) as u64;
        assert_eq!(std::fs::metadata(&path).unwrap().len(), expected);

        // a second run leaves a grown file alone
        let file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.set_len(expected + HEADER_SIZE as u64).unwrap();
        init_headers_file(&path).unwrap();
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            expected + HEADER_SIZE as u64
        );
    }
}
