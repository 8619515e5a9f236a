use serde::{Deserialize, Serialize};

pub const MAGIC: &[u8; 8] = b"NPATCH01";

/// Granularity at which a patch expresses old/new similarity.
pub const DIFF_BLOCK_SIZE: u64 = 64 * 1024;

/// Largest single record accepted by the reader.
pub const MAX_RECORD_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    None,
    Zstd { level: i32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchHeader {
    pub compression: Compression,
}

/// Precedes the operation stream of each new file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncHeader {
    pub file_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncOp {
    /// Copy `block_span` diff blocks starting at `block_index` from target file `file_index`.
    BlockRange {
        file_index: u64,
        block_index: u64,
        block_span: u64,
    },
    /// Literal new bytes.
    Data { data: Vec<u8> },
    /// End of the current file's operations.
    Terminator,
}
