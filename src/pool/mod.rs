//! Uniform read access to the bytes of the old build.

mod local;
mod remote;
mod source;

pub use local::LocalPool;
pub use remote::{RemotePool, RemotePoolConfig};
pub use source::{fetch_with_retries, BlockSource, HttpSource, RetryPolicy, SimulatedSource};

use crate::container::Container;
use crate::error::{Error, Result};

/// Serves `len` bytes of target file `file_index` starting at `offset`.
pub trait BlockPool: Send + Sync {
    fn container(&self) -> &Container;

    fn read(&self, file_index: usize, offset: u64, len: u64) -> Result<Vec<u8>>;
}

/// Size of fetch block `block_index` of a file; the last one is truncated.
pub fn fetch_block_len(file_size: u64, fetch_block_size: u64, block_index: u64) -> u64 {
    let start = block_index.saturating_mul(fetch_block_size);
    file_size.saturating_sub(start).min(fetch_block_size)
}

pub fn fetch_block_count(file_size: u64, fetch_block_size: u64) -> u64 {
    file_size.div_ceil(fetch_block_size)
}

/// Reject reads that fall outside the file, returning its size otherwise.
pub(crate) fn check_range(
    container: &Container,
    file_index: usize,
    offset: u64,
    len: u64,
) -> Result<u64> {
    let file = container.file(file_index as u64)?;
    match offset.checked_add(len) {
        Some(end) if end <= file.size => Ok(file.size),
        _ => Err(Error::Range {
            file_index,
            offset,
            len,
            size: file.size,
        }),
    }
}
