use tracing::{debug, info};

use crate::codec::PatchReader;
use crate::container::{Container, FileEntry};
use crate::error::{FormatError, Result};
use crate::patch_format::{SyncOp, DIFF_BLOCK_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeKind {
    /// Same file, same offset.
    Unchanged,
    /// Copied from another file or another offset.
    Moved,
}

/// The old-file bytes a `BlockRange` op copies, clipped to the file's true size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRange {
    pub target_index: usize,
    pub offset: u64,
    pub len: u64,
    pub kind: RangeKind,
}

impl ResolvedRange {
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Byte accounting over one or more files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub unchanged_bytes: u64,
    pub moved_bytes: u64,
    pub fresh_bytes: u64,
    pub block_range_ops: u64,
    pub data_ops: u64,
    pub files: u64,
    pub renames: u64,
}

impl Stats {
    pub fn merge(&mut self, other: &Stats) {
        self.unchanged_bytes = self.unchanged_bytes.saturating_add(other.unchanged_bytes);
        self.moved_bytes = self.moved_bytes.saturating_add(other.moved_bytes);
        self.fresh_bytes = self.fresh_bytes.saturating_add(other.fresh_bytes);
        self.block_range_ops += other.block_range_ops;
        self.data_ops += other.data_ops;
        self.files += other.files;
        self.renames += other.renames;
    }

    pub fn total_bytes(&self) -> u64 {
        self.unchanged_bytes
            .saturating_add(self.moved_bytes)
            .saturating_add(self.fresh_bytes)
    }
}

/// Receives the validated operations of a patch, one new file at a time.
pub trait OpVisitor {
    fn begin_file(&mut self, _index: usize, _entry: &FileEntry) -> Result<()> {
        Ok(())
    }

    fn block_range(&mut self, _range: &ResolvedRange) -> Result<()> {
        Ok(())
    }

    fn data(&mut self, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn end_file(&mut self, _index: usize, _stats: &Stats) -> Result<()> {
        Ok(())
    }
}

/// Resolve a `BlockRange` op against the target container.
pub fn resolve_block_range(
    target: &Container,
    file_index: u64,
    block_index: u64,
    block_span: u64,
) -> Result<(usize, u64, u64)> {
    let file = target.file(file_index)?;
    if block_span == 0 {
        return Err(FormatError::ZeroSpan { file_index }.into());
    }

    let out_of_bounds = || FormatError::BlockOutOfBounds {
        path: file.path.clone(),
        size: file.size,
        block_index,
        block_span,
    };

    let start = block_index
        .checked_mul(DIFF_BLOCK_SIZE)
        .ok_or_else(out_of_bounds)?;
    let last_block_start = block_index
        .checked_add(block_span - 1)
        .and_then(|b| b.checked_mul(DIFF_BLOCK_SIZE))
        .ok_or_else(out_of_bounds)?;
    // The last block may be short, but it has to start inside the file.
    if last_block_start >= file.size {
        return Err(out_of_bounds().into());
    }
    let end = last_block_start.saturating_add(DIFF_BLOCK_SIZE).min(file.size);

    Ok((file_index as usize, start, end - start))
}

/// Walk every file's operation stream, validating framing and bounds and
/// feeding the visitor. Returns the byte accounting of the whole patch.
pub fn replay(
    reader: &mut PatchReader<'_>,
    target: &Container,
    source: &Container,
    visitor: &mut dyn OpVisitor,
) -> Result<Stats> {
    let mut total = Stats::default();

    for (file_index, source_file) in source.files.iter().enumerate() {
        let header = reader.read_sync_header()?;
        if header.file_index != file_index as u64 {
            return Err(FormatError::IndexMismatch {
                expected: file_index as u64,
                actual: header.file_index,
            }
            .into());
        }

        visitor.begin_file(file_index, source_file)?;
        let stats = replay_file(reader, target, source_file, visitor)?;
        visitor.end_file(file_index, &stats)?;
        total.merge(&stats);
    }

    Ok(total)
}

fn replay_file(
    reader: &mut PatchReader<'_>,
    target: &Container,
    source_file: &FileEntry,
    visitor: &mut dyn OpVisitor,
) -> Result<Stats> {
    let mut stats = Stats {
        files: 1,
        ..Stats::default()
    };
    let mut source_offset = 0u64;
    let mut num_moved = 0u64;
    let mut num_unchanged = 0u64;

    loop {
        match reader.read_sync_op()? {
            SyncOp::BlockRange {
                file_index,
                block_index,
                block_span,
            } => {
                let (target_index, offset, len) =
                    resolve_block_range(target, file_index, block_index, block_span)?;
                let target_file = &target.files[target_index];

                let end = advance(source_file, source_offset, len)?;
                let kind = if target_file.path == source_file.path && offset == source_offset {
                    stats.unchanged_bytes += len;
                    num_unchanged += 1;
                    RangeKind::Unchanged
                } else {
                    stats.moved_bytes += len;
                    num_moved += 1;
                    RangeKind::Moved
                };
                stats.block_range_ops += 1;
                source_offset = end;

                visitor.block_range(&ResolvedRange {
                    target_index,
                    offset,
                    len,
                    kind,
                })?;
            }
            SyncOp::Data { data } => {
                let len = data.len() as u64;
                source_offset = advance(source_file, source_offset, len)?;
                stats.fresh_bytes += len;
                stats.data_ops += 1;
                visitor.data(&data)?;
            }
            SyncOp::Terminator => break,
        }
    }

    if source_offset != source_file.size {
        return Err(FormatError::SizeMismatch {
            path: source_file.path.clone(),
            expected: source_file.size,
            actual: source_offset,
        }
        .into());
    }

    if stats.data_ops == 0 && num_unchanged == 0 && num_moved == 1 {
        info!(path = %source_file.path, "likely rename");
        stats.renames = 1;
    }
    debug!(
        path = %source_file.path,
        unchanged = stats.unchanged_bytes,
        moved = stats.moved_bytes,
        fresh = stats.fresh_bytes,
        "file replayed"
    );

    Ok(stats)
}

/// Move the write cursor of `file` forward by `len`. A file never grows past
/// its declared size, which also bounds every per-file counter.
fn advance(file: &FileEntry, offset: u64, len: u64) -> Result<u64> {
    match offset.checked_add(len) {
        Some(end) if end <= file.size => Ok(end),
        _ => Err(FormatError::SizeMismatch {
            path: file.path.clone(),
            expected: file.size,
            actual: offset.saturating_add(len),
        }
        .into()),
    }
}
