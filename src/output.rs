use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Component, Path, PathBuf};

use crate::container::FileEntry;
use crate::error::{Error, FormatError, Result};

/// Where reconstructed files go. Files are opened one at a time in container
/// order, written sequentially, then closed.
pub trait OutputPool {
    fn open(&mut self, file_index: usize, entry: &FileEntry) -> Result<()>;

    fn write(&mut self, data: &[u8]) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// Reject container paths that would resolve outside the directory they are
/// joined to: absolute paths, drive prefixes and `..` components.
pub fn check_relative_path(path: &str) -> std::result::Result<(), FormatError> {
    let escapes = path.is_empty()
        || Path::new(path).components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
    if escapes {
        return Err(FormatError::UnsafePath { path: path.into() });
    }
    Ok(())
}

/// Writes each file to `root/<path>`, creating parent directories.
pub struct DirectoryOutput {
    root: PathBuf,
    current: Option<(PathBuf, BufWriter<File>)>,
}

impl DirectoryOutput {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            current: None,
        }
    }

    fn current(&mut self) -> Result<&mut (PathBuf, BufWriter<File>)> {
        self.current.as_mut().ok_or_else(|| {
            Error::io(
                "Write outside of an open file",
                std::io::Error::other("no output file open"),
            )
        })
    }
}

impl OutputPool for DirectoryOutput {
    fn open(&mut self, _file_index: usize, entry: &FileEntry) -> Result<()> {
        check_relative_path(&entry.path)?;
        let full = self.root.join(&entry.path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::io(format!("Failed to create directory: {}", parent.display()), e)
            })?;
        }
        let file = File::create(&full)
            .map_err(|e| Error::io(format!("Failed to create file: {}", full.display()), e))?;
        self.current = Some((full, BufWriter::with_capacity(256 * 1024, file)));
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let (path, writer) = self.current()?;
        writer
            .write_all(data)
            .map_err(|e| Error::io(format!("Failed to write file: {}", path.display()), e))
    }

    fn close(&mut self) -> Result<()> {
        if let Some((path, mut writer)) = self.current.take() {
            writer
                .flush()
                .map_err(|e| Error::io(format!("Failed to flush file: {}", path.display()), e))?;
        }
        Ok(())
    }
}

/// Drops everything; for dry runs and measurements.
pub struct DiscardOutput;

impl OutputPool for DiscardOutput {
    fn open(&mut self, _file_index: usize, _entry: &FileEntry) -> Result<()> {
        Ok(())
    }

    fn write(&mut self, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Keeps every file in memory, indexed like the source container.
#[derive(Debug, Default)]
pub struct MemoryOutput {
    pub files: Vec<Vec<u8>>,
    /// Files that were closed, i.e. completely written.
    pub closed: Vec<usize>,
    current: Option<usize>,
}

impl MemoryOutput {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OutputPool for MemoryOutput {
    fn open(&mut self, file_index: usize, _entry: &FileEntry) -> Result<()> {
        if self.files.len() <= file_index {
            self.files.resize_with(file_index + 1, Vec::new);
        }
        self.files[file_index].clear();
        self.current = Some(file_index);
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let index = self.current.ok_or_else(|| {
            Error::io(
                "Write outside of an open file",
                std::io::Error::other("no output file open"),
            )
        })?;
        self.files[index].extend_from_slice(data);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(index) = self.current.take() {
            self.closed.push(index);
        }
        Ok(())
    }
}
