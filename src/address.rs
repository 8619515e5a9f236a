use std::collections::HashMap;
use std::fmt;

use crate::error::{NetworkError, Result};
use crate::pool::BlockPool;
use crate::util;

/// Content-identifying handle of a fetch block: `<algo>/<hash>/<size>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockAddress(String);

impl BlockAddress {
    pub fn new(algo: &str, hash: &str, size: u64) -> Self {
        Self(format!("{algo}/{hash}/{size}"))
    }

    /// Accept an address string, checking that it carries a size.
    pub fn parse(raw: &str) -> std::result::Result<Self, NetworkError> {
        let address = Self(raw.to_string());
        address.size()?;
        Ok(address)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The byte size embedded as the last path component.
    pub fn size(&self) -> std::result::Result<u64, NetworkError> {
        self.0
            .rsplit('/')
            .next()
            .and_then(|s| s.parse().ok())
            .filter(|_| self.0.matches('/').count() >= 2)
            .ok_or_else(|| NetworkError::BadAddress(self.0.clone()))
    }
}

impl fmt::Display for BlockAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Addresses of the fetch blocks a patch needs, keyed by `(file_index, block_index)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockAddressMap {
    entries: HashMap<(usize, u64), BlockAddress>,
}

impl BlockAddressMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, file_index: usize, block_index: u64, address: BlockAddress) {
        self.entries.insert((file_index, block_index), address);
    }

    pub fn get(&self, file_index: usize, block_index: u64) -> Option<&BlockAddress> {
        self.entries.get(&(file_index, block_index))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Assigns an address to a fetch block. The addressing scheme belongs to the
/// block store; this crate never assumes a particular digest.
pub trait BlockAddresser {
    fn address(&self, file_index: usize, block_index: u64, size: u64) -> Result<BlockAddress>;
}

impl<F> BlockAddresser for F
where
    F: Fn(usize, u64, u64) -> BlockAddress,
{
    fn address(&self, file_index: usize, block_index: u64, size: u64) -> Result<BlockAddress> {
        Ok(self(file_index, block_index, size))
    }
}

/// Position-derived placeholder addresses, for measuring a patch against a
/// simulated store.
pub struct SyntheticAddresser;

impl BlockAddresser for SyntheticAddresser {
    fn address(&self, file_index: usize, block_index: u64, size: u64) -> Result<BlockAddress> {
        Ok(BlockAddress::new(
            "shake128-32",
            &format!("fakehash-{file_index}-{block_index}"),
            size,
        ))
    }
}

/// BLAKE3 of the block's bytes, read from a pool holding the old build.
pub struct ContentAddresser<'a> {
    pool: &'a dyn BlockPool,
    fetch_block_size: u64,
}

impl<'a> ContentAddresser<'a> {
    pub fn new(pool: &'a dyn BlockPool, fetch_block_size: u64) -> Self {
        Self {
            pool,
            fetch_block_size,
        }
    }
}

impl BlockAddresser for ContentAddresser<'_> {
    fn address(&self, file_index: usize, block_index: u64, size: u64) -> Result<BlockAddress> {
        let data = self
            .pool
            .read(file_index, block_index * self.fetch_block_size, size)?;
        Ok(BlockAddress::new("blake3", &util::hex_digest(&data), size))
    }
}
