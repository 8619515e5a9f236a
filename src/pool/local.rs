use memmap2::Mmap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use super::{check_range, BlockPool};
use crate::container::Container;
use crate::error::{Error, Result};
use crate::util;

/// Reads the old build straight from disk. Files are mapped on first use and
/// stay mapped for the lifetime of the pool.
pub struct LocalPool {
    root: PathBuf,
    container: Container,
    maps: Mutex<HashMap<usize, Arc<Mmap>>>,
}

impl LocalPool {
    pub fn new(root: impl Into<PathBuf>, container: Container) -> Self {
        Self {
            root: root.into(),
            container,
            maps: Mutex::new(HashMap::new()),
        }
    }

    fn mapping(&self, file_index: usize) -> Result<Arc<Mmap>> {
        let mut maps = self.maps.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(map) = maps.get(&file_index) {
            return Ok(Arc::clone(map));
        }

        let path = self.root.join(&self.container.files[file_index].path);
        let map = Arc::new(
            util::mmap_file(&path)
                .map_err(|e| Error::io(format!("Failed to map {}", path.display()), e))?,
        );
        maps.insert(file_index, Arc::clone(&map));
        Ok(map)
    }
}

impl BlockPool for LocalPool {
    fn container(&self) -> &Container {
        &self.container
    }

    fn read(&self, file_index: usize, offset: u64, len: u64) -> Result<Vec<u8>> {
        check_range(&self.container, file_index, offset, len)?;
        if len == 0 {
            return Ok(Vec::new());
        }

        let map = self.mapping(file_index)?;
        let start = offset as usize;
        let end = start + len as usize;
        // The file on disk can be shorter than the container claims.
        if end > map.len() {
            return Err(Error::Range {
                file_index,
                offset,
                len,
                size: map.len() as u64,
            });
        }
        Ok(map[start..end].to_vec())
    }
}
