//! Embedder-side driver tying compiled loops and bridges to their codemaps.
//!
//! The cache hands out address blocks from a bump cursor, seals each unit's
//! [`CodemapBuilder`] at the block address, and registers the result in its
//! [`CodemapStorage`]. Freeing a loop frees its bridges with it.

use std::collections::BTreeMap;
use std::fmt;

use tracing::debug;

use crate::builder::CodemapBuilder;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::storage::CodemapStorage;

// =============================================================================
// Identifiers and blocks
// =============================================================================

/// Identifier of an installed loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoopId(u64);

impl fmt::Display for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loop#{}", self.0)
    }
}

/// A contiguous machine-code region `[start, stop)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsmBlock {
    pub start: u64,
    pub stop: u64,
}

impl AsmBlock {
    #[inline]
    pub fn contains_address(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.stop
    }

    /// End of the key range owned by this block. Zero-sized blocks still
    /// own their start address.
    #[inline]
    fn key_end(&self) -> u64 {
        self.stop.max(self.start + 1)
    }
}

/// One unit ready to be installed: its code size, the codemap recorded while
/// emitting it, and optional frame-depth positions.
#[derive(Debug, Clone)]
pub struct AsmUnit {
    pub size: u32,
    pub codemap: CodemapBuilder,
    pub frame_positions: Vec<u32>,
    pub frame_assignments: Vec<u32>,
}

impl AsmUnit {
    pub fn new(size: u32, codemap: CodemapBuilder) -> Self {
        Self {
            size,
            codemap,
            frame_positions: Vec::new(),
            frame_assignments: Vec::new(),
        }
    }

    /// Attach frame-depth positions (offsets into the unit) and the depth
    /// that takes effect at each.
    pub fn with_frame_depths(mut self, positions: Vec<u32>, assignments: Vec<u32>) -> Self {
        self.frame_positions = positions;
        self.frame_assignments = assignments;
        self
    }
}

#[derive(Debug)]
struct CompiledLoop {
    block: AsmBlock,
    bridges: Vec<AsmBlock>,
}

// =============================================================================
// Statistics
// =============================================================================

/// Live compiled units. `total == loops + bridges` at all times.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CodeCacheStats {
    pub total: usize,
    pub loops: usize,
    pub bridges: usize,
}

// =============================================================================
// CodeCache
// =============================================================================

pub struct CodeCache {
    codemaps: CodemapStorage,
    loops: BTreeMap<LoopId, CompiledLoop>,
    cursor: u64,
    alignment: u64,
    next_id: u64,
    stats: CodeCacheStats,
}

impl CodeCache {
    pub fn new(config: &Config) -> Self {
        debug_assert!(config.code_alignment.is_power_of_two());
        Self {
            codemaps: CodemapStorage::setup(config),
            loops: BTreeMap::new(),
            cursor: config.code_base,
            alignment: config.code_alignment.max(1),
            next_id: 0,
            stats: CodeCacheStats::default(),
        }
    }

    #[inline]
    pub fn storage(&self) -> &CodemapStorage {
        &self.codemaps
    }

    #[inline]
    pub fn stats(&self) -> CodeCacheStats {
        self.stats
    }

    pub fn loop_block(&self, id: LoopId) -> Option<AsmBlock> {
        self.loops.get(&id).map(|compiled| compiled.block)
    }

    pub fn bridge_blocks(&self, id: LoopId) -> &[AsmBlock] {
        self.loops
            .get(&id)
            .map(|compiled| compiled.bridges.as_slice())
            .unwrap_or(&[])
    }

    /// Reserve the next aligned block. Every block gets a distinct start
    /// address, even a zero-sized one.
    fn reserve(&mut self, size: u32) -> AsmBlock {
        let mask = self.alignment - 1;
        let start = (self.cursor + mask) & !mask;
        let stop = start + u64::from(size);
        let block = AsmBlock { start, stop };
        self.cursor = block.key_end();
        block
    }

    fn install(&mut self, unit: AsmUnit) -> Result<AsmBlock> {
        let AsmUnit {
            size,
            codemap,
            frame_positions,
            frame_assignments,
        } = unit;
        if frame_positions.len() != frame_assignments.len() {
            return Err(Error::FrameDepthMismatch {
                positions: frame_positions.len(),
                assignments: frame_assignments.len(),
            });
        }
        if size == 0 && codemap.open_frames() > 0 {
            return Err(Error::EmptyUnit {
                open_frames: codemap.open_frames(),
            });
        }

        let block = self.reserve(size);
        self.codemaps
            .register_codemap(codemap.get_final_bytecode(block.start, size))?;
        if let Err(err) = self.codemaps.register_frame_depth_map(
            block.start,
            block.stop,
            &frame_positions,
            &frame_assignments,
        ) {
            self.codemaps.free_asm_block(block.start, block.key_end());
            return Err(err);
        }
        Ok(block)
    }

    /// Install a loop and register its codemap.
    pub fn install_loop(&mut self, unit: AsmUnit) -> Result<LoopId> {
        let block = self.install(unit)?;
        let id = LoopId(self.next_id);
        self.next_id += 1;
        self.loops.insert(
            id,
            CompiledLoop {
                block,
                bridges: Vec::new(),
            },
        );
        self.stats.loops += 1;
        self.stats.total += 1;
        debug!(%id, start = block.start, stop = block.stop, "installed loop");
        Ok(id)
    }

    /// Install a bridge attached to `parent`. It is freed together with
    /// the parent.
    pub fn install_bridge(&mut self, parent: LoopId, unit: AsmUnit) -> Result<AsmBlock> {
        if !self.loops.contains_key(&parent) {
            return Err(Error::UnknownLoop(parent));
        }
        let block = self.install(unit)?;
        if let Some(compiled) = self.loops.get_mut(&parent) {
            compiled.bridges.push(block);
        }
        self.stats.bridges += 1;
        self.stats.total += 1;
        debug!(%parent, start = block.start, stop = block.stop, "installed bridge");
        Ok(block)
    }

    /// A builder for a bridge leaving compiled code at `guard_addr`, with
    /// the frames active there already re-opened.
    pub fn bridge_builder(&self, guard_addr: u64) -> CodemapBuilder {
        let mut builder = CodemapBuilder::new();
        builder.inherit_code_from_position(&self.codemaps, guard_addr);
        builder
    }

    /// Free a loop, every bridge attached to it, and their codemaps.
    pub fn free_loop(&mut self, id: LoopId) -> Result<()> {
        let compiled = self.loops.remove(&id).ok_or(Error::UnknownLoop(id))?;
        for bridge in &compiled.bridges {
            self.codemaps.free_asm_block(bridge.start, bridge.key_end());
        }
        let block = compiled.block;
        self.codemaps.free_asm_block(block.start, block.key_end());

        let bridges = compiled.bridges.len();
        self.stats.loops -= 1;
        self.stats.bridges -= bridges;
        self.stats.total -= 1 + bridges;
        debug!(%id, bridges, "freed loop");
        Ok(())
    }

    /// Drop every loop and bridge and clear the storage.
    pub fn teardown(&mut self) {
        self.loops.clear();
        self.codemaps.free();
        self.stats = CodeCacheStats::default();
    }
}

impl Default for CodeCache {
    fn default() -> Self {
        Self::new(&Config::default())
    }
}

impl fmt::Debug for CodeCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeCache")
            .field("stats", &self.stats)
            .field("cursor", &self.cursor)
            .field("storage", &self.codemaps)
            .finish()
    }
}
