//! Pre-pass over a patch that works out which fetch blocks of the old build
//! the apply will read.

use std::collections::BTreeSet;

use tracing::debug;

use crate::address::{BlockAddressMap, BlockAddresser};
use crate::codec::PatchReader;
use crate::container::Container;
use crate::error::Result;
use crate::interpreter::{self, OpVisitor, RangeKind, ResolvedRange, Stats};
use crate::pool::{fetch_block_count, fetch_block_len};

pub const DEFAULT_FETCH_BLOCK_SIZE: u64 = 4 * 1024 * 1024;

/// Which block ranges the pre-pass registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coverage {
    /// Only moved ranges; unchanged bytes come from somewhere else (in-place
    /// apply, or a local copy of the old build).
    MovedOnly,
    /// Every byte the patch copies from the old build.
    All,
}

#[derive(Debug, Clone)]
pub struct RequiredBlocks {
    fetch_block_size: u64,
    per_file: Vec<BTreeSet<u64>>,
    /// Needed blocks in the order the patch first touches them.
    schedule: Vec<(usize, u64)>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequirementSummary {
    pub total_blocks: u64,
    pub needed_blocks: u64,
    /// Needed blocks shorter than the fetch block size.
    pub partial_blocks: u64,
    pub needed_bytes: u64,
}

pub struct Analysis {
    pub stats: Stats,
    pub required: RequiredBlocks,
}

impl RequiredBlocks {
    pub fn new(file_count: usize, fetch_block_size: u64) -> Self {
        Self {
            fetch_block_size: fetch_block_size.max(1),
            per_file: vec![BTreeSet::new(); file_count],
            schedule: Vec::new(),
        }
    }

    pub fn fetch_block_size(&self) -> u64 {
        self.fetch_block_size
    }

    /// Mark every fetch block overlapping `[start, end)` of `file_index`.
    pub fn register(&mut self, file_index: usize, start: u64, end: u64) {
        if end <= start {
            return;
        }
        let first = start / self.fetch_block_size;
        let last = end.div_ceil(self.fetch_block_size);
        for block in first..last {
            if self.per_file[file_index].insert(block) {
                self.schedule.push((file_index, block));
            }
        }
    }

    pub fn blocks(&self, file_index: usize) -> &BTreeSet<u64> {
        &self.per_file[file_index]
    }

    /// The required set of every target file, by index.
    pub fn sets(&self) -> &[BTreeSet<u64>] {
        &self.per_file
    }

    pub fn schedule(&self) -> &[(usize, u64)] {
        &self.schedule
    }

    pub fn needed_blocks(&self) -> usize {
        self.schedule.len()
    }

    pub fn summary(&self, target: &Container) -> RequirementSummary {
        let mut summary = RequirementSummary::default();
        for (file_index, blocks) in self.per_file.iter().enumerate() {
            let size = target.files[file_index].size;
            summary.total_blocks += fetch_block_count(size, self.fetch_block_size);
            for &block in blocks {
                let len = fetch_block_len(size, self.fetch_block_size, block);
                if len < self.fetch_block_size {
                    summary.partial_blocks += 1;
                }
                summary.needed_blocks += 1;
                summary.needed_bytes += len;
            }
        }
        summary
    }

    /// Address every required block.
    pub fn address_map(
        &self,
        target: &Container,
        addresser: &dyn BlockAddresser,
    ) -> Result<BlockAddressMap> {
        let mut map = BlockAddressMap::new();
        for (file_index, blocks) in self.per_file.iter().enumerate() {
            let size = target.files[file_index].size;
            for &block in blocks {
                let len = fetch_block_len(size, self.fetch_block_size, block);
                map.set(file_index, block, addresser.address(file_index, block, len)?);
            }
        }
        debug!(blocks = map.len(), "block addresses assigned");
        Ok(map)
    }

    /// Run the pre-pass over the operation streams of an opened patch.
    pub fn analyze(
        reader: &mut PatchReader<'_>,
        target: &Container,
        source: &Container,
        fetch_block_size: u64,
        coverage: Coverage,
    ) -> Result<Analysis> {
        let mut collector = Collector {
            required: RequiredBlocks::new(target.len(), fetch_block_size),
            coverage,
        };
        let stats = interpreter::replay(reader, target, source, &mut collector)?;
        Ok(Analysis {
            stats,
            required: collector.required,
        })
    }
}

struct Collector {
    required: RequiredBlocks,
    coverage: Coverage,
}

impl OpVisitor for Collector {
    fn block_range(&mut self, range: &ResolvedRange) -> Result<()> {
        if range.kind == RangeKind::Moved || self.coverage == Coverage::All {
            self.required
                .register(range.target_index, range.offset, range.end());
        }
        Ok(())
    }
}
