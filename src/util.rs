use memmap2::Mmap;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct WalkedFile {
    pub relative_path: String,
    pub full_path: PathBuf,
    /// File size in bytes. Free from the OS directory scan.
    pub size: u64,
}

/// Walk a directory tree and collect every regular file with its relative path.
/// Paths use forward slashes for cross-platform consistency in the patch format.
pub fn walk_files(root: &Path) -> Result<Vec<WalkedFile>> {
    let root = root
        .canonicalize()
        .map_err(|e| Error::io(format!("Failed to canonicalize path: {}", root.display()), e))?;

    let mut files = Vec::new();

    for entry in WalkDir::new(&root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            Error::io(
                format!("Failed to read directory entry in {}", root.display()),
                e.into(),
            )
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let full_path = entry.path().to_path_buf();
        let relative = full_path
            .strip_prefix(&root)
            .map_err(|e| Error::io("Failed to compute relative path", io::Error::other(e)))?;

        let relative_str = relative
            .to_str()
            .ok_or_else(|| {
                Error::io(
                    format!("Non-UTF8 path: {}", relative.display()),
                    io::ErrorKind::InvalidData.into(),
                )
            })?
            .replace('\\', "/");

        let meta = entry.metadata().map_err(|e| {
            Error::io(format!("Failed to read metadata: {}", full_path.display()), e.into())
        })?;

        files.push(WalkedFile {
            relative_path: relative_str,
            full_path,
            size: meta.len(),
        });
    }

    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(files)
}

/// Memory-map a file for read-only access.
///
/// # Safety
/// The mapping is read-only. Callers must not concurrently truncate or replace
/// the underlying file while the `Mmap` is live.
pub fn mmap_file(path: &Path) -> io::Result<Mmap> {
    let file = std::fs::File::open(path)?;
    // SAFETY: read-only mapping; the old build must not change during an apply.
    unsafe { Mmap::map(&file) }
}

/// Lowercase hex BLAKE3 digest of a block.
pub fn hex_digest(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// BLAKE3 of a whole file, read through a 256 KB buffer.
pub fn hash_file_streaming(path: &Path) -> Result<blake3::Hash> {
    let file = std::fs::File::open(path).map_err(|e| {
        Error::io(format!("Failed to open file for hashing: {}", path.display()), e)
    })?;
    let mut reader = io::BufReader::with_capacity(256 * 1024, file);
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut reader, &mut hasher)
        .map_err(|e| Error::io(format!("Failed to hash file: {}", path.display()), e))?;
    Ok(hasher.finalize())
}

/// Digest every file of a tree, keyed by relative path.
pub fn digest_tree(root: &Path) -> Result<Vec<(String, blake3::Hash)>> {
    walk_files(root)?
        .into_iter()
        .map(|f| Ok((f.relative_path, hash_file_streaming(&f.full_path)?)))
        .collect()
}
