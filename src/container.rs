use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{FormatError, Result};
use crate::util;

/// One file of a versioned file set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
}

/// An ordered file set. Inside operation streams a file is addressed only by
/// its index into `files`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub files: Vec<FileEntry>,
}

impl Container {
    pub fn new(files: Vec<FileEntry>) -> Self {
        Self { files }
    }

    /// Build a container from every regular file under `root`, sorted by path.
    pub fn scan(root: &Path) -> Result<Self> {
        let files = util::walk_files(root)?
            .into_iter()
            .map(|f| FileEntry {
                path: f.relative_path,
                size: f.size,
            })
            .collect();
        Ok(Self { files })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    /// Look up a file by the index an operation stream refers to it with.
    pub fn file(&self, index: u64) -> std::result::Result<&FileEntry, FormatError> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.files.get(i))
            .ok_or(FormatError::FileIndexOutOfRange {
                index,
                count: self.files.len(),
            })
    }
}
