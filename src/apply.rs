use std::io::Read;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::codec::{open_patch, PatchReader};
use crate::container::{Container, FileEntry};
use crate::error::{Error, Result};
use crate::interpreter::{self, OpVisitor, RangeKind, ResolvedRange, Stats};
use crate::output::OutputPool;
use crate::pool::BlockPool;
use crate::progress::{NullProgress, ProgressSink};

/// Largest single read issued to a pool while copying a block range.
const COPY_CHUNK: u64 = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct ApplySummary {
    pub stats: Stats,
    pub bytes_written: u64,
    pub elapsed: Duration,
}

/// Everything an apply needs besides the patch itself.
pub struct ApplyContext<'a> {
    target_pool: &'a dyn BlockPool,
    unchanged_pool: Option<&'a dyn BlockPool>,
    output: &'a mut dyn OutputPool,
    progress: &'a dyn ProgressSink,
    cancel: CancellationToken,
}

impl<'a> ApplyContext<'a> {
    pub fn new(target_pool: &'a dyn BlockPool, output: &'a mut dyn OutputPool) -> Self {
        Self {
            target_pool,
            unchanged_pool: None,
            output,
            progress: &NullProgress,
            cancel: CancellationToken::new(),
        }
    }

    /// Serve unchanged ranges from `pool` instead of the target pool, e.g. a
    /// local copy of the old build while moved blocks come from the network.
    pub fn with_unchanged_pool(mut self, pool: &'a dyn BlockPool) -> Self {
        self.unchanged_pool = Some(pool);
        self
    }

    pub fn with_progress(mut self, progress: &'a dyn ProgressSink) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Apply a whole patch stream. On error the output is incomplete and must
    /// be discarded.
    pub fn apply<R: Read>(&mut self, patch: R) -> Result<ApplySummary> {
        let mut opened = open_patch(patch)?;
        self.apply_opened(&mut opened.reader, &opened.target, &opened.source)
    }

    /// Apply the operation streams of a patch whose containers were already read.
    pub fn apply_opened(
        &mut self,
        reader: &mut PatchReader<'_>,
        target: &Container,
        source: &Container,
    ) -> Result<ApplySummary> {
        let start = Instant::now();
        self.progress.status(&format!(
            "Patching {} files ({} bytes) from {} old files",
            source.len(),
            source.total_size(),
            target.len()
        ));

        let mut replayer = Replayer {
            target_pool: self.target_pool,
            unchanged_pool: self.unchanged_pool,
            output: &mut *self.output,
            progress: self.progress,
            cancel: &self.cancel,
            total: source.total_size(),
            written: 0,
        };
        let stats = interpreter::replay(reader, target, source, &mut replayer)?;
        let bytes_written = replayer.written;
        self.progress.progress(1.0);

        let summary = ApplySummary {
            stats,
            bytes_written,
            elapsed: start.elapsed(),
        };
        info!(
            files = stats.files,
            unchanged = stats.unchanged_bytes,
            moved = stats.moved_bytes,
            fresh = stats.fresh_bytes,
            elapsed = ?summary.elapsed,
            "patch applied"
        );
        Ok(summary)
    }
}

struct Replayer<'r> {
    target_pool: &'r dyn BlockPool,
    unchanged_pool: Option<&'r dyn BlockPool>,
    output: &'r mut dyn OutputPool,
    progress: &'r dyn ProgressSink,
    cancel: &'r CancellationToken,
    total: u64,
    written: u64,
}

impl Replayer<'_> {
    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn emit(&mut self, data: &[u8]) -> Result<()> {
        self.output.write(data)?;
        self.written += data.len() as u64;
        if self.total > 0 {
            self.progress
                .progress(self.written as f64 / self.total as f64);
        }
        Ok(())
    }
}

impl OpVisitor for Replayer<'_> {
    fn begin_file(&mut self, index: usize, entry: &FileEntry) -> Result<()> {
        self.check_cancelled()?;
        debug!(index, path = %entry.path, size = entry.size, "patching file");
        self.output.open(index, entry)
    }

    fn block_range(&mut self, range: &ResolvedRange) -> Result<()> {
        let pool = match (range.kind, self.unchanged_pool) {
            (RangeKind::Unchanged, Some(pool)) => pool,
            _ => self.target_pool,
        };

        let mut offset = range.offset;
        while offset < range.end() {
            self.check_cancelled()?;
            let len = (range.end() - offset).min(COPY_CHUNK);
            let data = pool.read(range.target_index, offset, len)?;
            self.emit(&data)?;
            offset += len;
        }
        Ok(())
    }

    fn data(&mut self, data: &[u8]) -> Result<()> {
        self.check_cancelled()?;
        self.emit(data)
    }

    fn end_file(&mut self, _index: usize, _stats: &Stats) -> Result<()> {
        self.output.close()
    }
}
