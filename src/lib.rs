//! Rebuild a new version of a file set from the old one plus a block-level
//! patch. Old bytes come from a [`BlockPool`]: the old build on disk, or a
//! remote store that serves fixed-size fetch blocks by address.
//!
//! A typical remote apply runs the pre-pass ([`RequiredBlocks::analyze`]) to
//! learn which fetch blocks are needed, addresses them, builds a
//! [`RemotePool`], then replays the patch through an [`ApplyContext`].

pub mod address;
pub mod apply;
pub mod codec;
pub mod container;
pub mod error;
pub mod interpreter;
pub mod output;
pub mod patch_format;
pub mod pool;
pub mod progress;
pub mod required;
pub mod util;

pub use address::{BlockAddress, BlockAddressMap, BlockAddresser};
pub use apply::{ApplyContext, ApplySummary};
pub use codec::{open_patch, PatchReader, PatchWriter};
pub use container::{Container, FileEntry};
pub use error::{Error, FormatError, NetworkError, Result};
pub use interpreter::Stats;
pub use pool::{BlockPool, BlockSource, LocalPool, RemotePool, RemotePoolConfig};
pub use required::{Coverage, RequiredBlocks};
