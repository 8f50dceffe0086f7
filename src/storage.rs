//! Process-wide codemap and frame-depth storage.
//!
//! Two skip lists keyed by machine-code start address:
//!
//! - **codemaps**: one packed `bytecode_info` buffer per compiled unit
//! - **depth maps**: one entry per frame-depth range inside a unit
//!
//! Both are filled as code is installed and drained by
//! [`CodemapStorage::free_asm_block`] when the code cache reclaims a region.

use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::skiplist::SkipList;

/// A sealed codemap for one compiled unit.
///
/// `bytecode_info` is a flat run of `[unique_id, rel_start, rel_end, skip_to]`
/// groups, as produced by [`CodemapBuilder`](crate::CodemapBuilder).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodemapRecord {
    pub start_addr: u64,
    pub machine_code_size: u32,
    pub bytecode_info: Vec<i64>,
}

/// Borrowed view of a registered codemap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodemapRef<'a> {
    pub start_addr: u64,
    pub machine_code_size: u32,
    pub bytecode_info: &'a [i64],
}

impl CodemapRef<'_> {
    #[inline]
    pub fn contains_address(&self, addr: u64) -> bool {
        addr >= self.start_addr && addr - self.start_addr < u64::from(self.machine_code_size)
    }
}

struct CodemapData {
    machine_code_size: u32,
    bytecode_info: Box<[i64]>,
}

impl CodemapData {
    #[inline]
    fn byte_size(&self) -> usize {
        std::mem::size_of_val(&*self.bytecode_info)
    }
}

#[derive(Debug, Clone, Copy)]
struct DepthData {
    size: u32,
    depth: u32,
}

/// Bytes charged against the memory limit per depth-map range.
const DEPTH_ENTRY_BYTES: usize = std::mem::size_of::<DepthData>();

// =============================================================================
// CodemapStorage
// =============================================================================

/// Owner of every live codemap and depth-map entry.
///
/// Constructed once by the embedder with [`CodemapStorage::setup`] and
/// passed by reference. Nothing here locks: registration, eviction and
/// lookups must be serialized by the caller.
pub struct CodemapStorage {
    codemaps: SkipList<CodemapData>,
    depthmaps: SkipList<DepthData>,
    /// Bytes held in codemap payload buffers.
    live_bytes: usize,
    memory_limit: Option<usize>,
}

impl CodemapStorage {
    /// Create storage with default configuration.
    pub fn new() -> Self {
        Self::setup(&Config::default())
    }

    /// Create empty storage for a VM starting up.
    pub fn setup(config: &Config) -> Self {
        Self {
            codemaps: SkipList::with_seed(config.seed),
            depthmaps: SkipList::with_seed(config.seed.rotate_left(32)),
            live_bytes: 0,
            memory_limit: config.memory_limit,
        }
    }

    /// Number of registered codemaps.
    #[inline]
    pub fn len(&self) -> usize {
        self.codemaps.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.codemaps.is_empty()
    }

    /// Bytes currently held in codemap payload buffers.
    #[inline]
    pub fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    /// Number of frame-depth ranges currently registered.
    #[inline]
    pub fn depth_entries(&self) -> usize {
        self.depthmaps.len()
    }

    /// Codemap buffers plus depth-map ranges, as counted against the limit.
    fn charged_bytes(&self) -> usize {
        self.live_bytes + self.depthmaps.len() * DEPTH_ENTRY_BYTES
    }

    fn check_limit(&self, requested: usize) -> Result<()> {
        match self.memory_limit {
            Some(limit) if self.charged_bytes().saturating_add(requested) > limit => {
                Err(Error::OutOfMemory { requested })
            }
            _ => Ok(()),
        }
    }

    /// Copy `info` into an exact-size buffer, failing instead of aborting
    /// when memory is short.
    fn alloc_info(&self, info: &[i64]) -> Result<Box<[i64]>> {
        let requested = std::mem::size_of_val(info);
        self.check_limit(requested)?;
        let mut buf = Vec::new();
        buf.try_reserve_exact(info.len())
            .map_err(|_| Error::OutOfMemory { requested })?;
        buf.extend_from_slice(info);
        Ok(buf.into_boxed_slice())
    }

    /// Take ownership of `record` and index it by its start address.
    ///
    /// Start addresses must be unique; the code cache guarantees this by
    /// construction. On failure nothing stays linked and the copied buffer
    /// has already been released.
    pub fn register_codemap(&mut self, record: CodemapRecord) -> Result<()> {
        let start_addr = record.start_addr;
        let data = CodemapData {
            machine_code_size: record.machine_code_size,
            bytecode_info: self.alloc_info(&record.bytecode_info).map_err(|err| {
                warn!(start_addr, %err, "codemap allocation failed");
                err
            })?,
        };
        let bytes = data.byte_size();
        if let Err(err) = self.codemaps.insert(start_addr, data) {
            warn!(start_addr, %err, "codemap insertion failed");
            return Err(err);
        }
        self.live_bytes += bytes;
        debug!(
            start_addr,
            size = record.machine_code_size,
            entries = record.bytecode_info.len() / crate::builder::ENTRY_LEN,
            "registered codemap"
        );
        Ok(())
    }

    /// Remove the codemap registered at exactly `start_addr` and hand it to
    /// the caller.
    pub fn unregister_codemap(&mut self, start_addr: u64) -> Option<CodemapRecord> {
        let data = self.codemaps.remove(start_addr)?;
        self.live_bytes -= data.byte_size();
        Some(CodemapRecord {
            start_addr,
            machine_code_size: data.machine_code_size,
            bytecode_info: data.bytecode_info.into_vec(),
        })
    }

    /// Look up the codemap whose `[start, start + size)` covers `addr`.
    pub fn find_codemap_at_addr(&self, addr: u64) -> Option<CodemapRef<'_>> {
        let node = self.codemaps.search(addr);
        let data = self.codemaps.payload(node)?;
        let codemap = CodemapRef {
            start_addr: self.codemaps.key(node),
            machine_code_size: data.machine_code_size,
            bytecode_info: &data.bytecode_info,
        };
        codemap.contains_address(addr).then_some(codemap)
    }

    /// Record the JIT frame depth for each range of a unit spanning
    /// `[rawstart, rawstop)`.
    ///
    /// `frame_positions[i]` is an offset from `rawstart` where the depth
    /// becomes `frame_assignments[i]`. Each range runs up to the next position,
    /// and the last one runs to `rawstop`. Empty ranges are skipped.
    ///
    /// On error every range linked by this call is unlinked again.
    pub fn register_frame_depth_map(
        &mut self,
        rawstart: u64,
        rawstop: u64,
        frame_positions: &[u32],
        frame_assignments: &[u32],
    ) -> Result<()> {
        if frame_positions.len() != frame_assignments.len() {
            return Err(Error::FrameDepthMismatch {
                positions: frame_positions.len(),
                assignments: frame_assignments.len(),
            });
        }
        let mut inserted: SmallVec<[u64; 8]> = SmallVec::new();
        inserted
            .try_reserve_exact(frame_positions.len())
            .map_err(|_| Error::OutOfMemory {
                requested: std::mem::size_of_val(frame_positions) * 2,
            })?;

        let mut stop = rawstop;
        for (&pos, &depth) in frame_positions.iter().zip(frame_assignments).rev() {
            let start = rawstart + u64::from(pos);
            if stop > start {
                let size = u32::try_from(stop - start).unwrap_or(u32::MAX);
                let linked = self
                    .check_limit(DEPTH_ENTRY_BYTES)
                    .and_then(|()| self.depthmaps.insert(start, DepthData { size, depth }));
                if let Err(err) = linked {
                    for key in inserted.drain(..) {
                        self.depthmaps.remove(key);
                    }
                    warn!(rawstart, %err, "frame depth map registration failed");
                    return Err(err);
                }
                inserted.push(start);
            }
            stop = start;
        }
        debug!(rawstart, rawstop, ranges = inserted.len(), "registered frame depth map");
        Ok(())
    }

    /// Frame depth in effect at `loc`, if any depth range covers it.
    pub fn stack_depth_at_loc(&self, loc: u64) -> Option<u32> {
        let node = self.depthmaps.search(loc);
        let data = self.depthmaps.payload(node)?;
        let rel = loc - self.depthmaps.key(node);
        (rel < u64::from(data.size)).then_some(data.depth)
    }

    /// Release every codemap and depth range whose start lies in
    /// `[start, stop)`. Returns the number of codemaps released.
    pub fn free_asm_block(&mut self, start: u64, stop: u64) -> usize {
        let mut freed = 0;
        while let Some(key) = self.codemaps.first_at_or_after(start).filter(|&k| k < stop) {
            if self.unregister_codemap(key).is_some() {
                freed += 1;
            }
        }
        while let Some(key) = self.depthmaps.first_at_or_after(start).filter(|&k| k < stop) {
            self.depthmaps.remove(key);
        }
        debug!(start, stop, freed, "freed asm block");
        freed
    }

    /// Release everything. Used at shutdown, and at startup to clear stale
    /// state between test runs.
    pub fn free(&mut self) {
        let codemaps = self.codemaps.len();
        while self.codemaps.pop_first().is_some() {}
        while self.depthmaps.pop_first().is_some() {}
        self.live_bytes = 0;
        debug!(codemaps, "codemap storage cleared");
    }
}

impl Default for CodemapStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CodemapStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodemapStorage")
            .field("codemaps", &self.codemaps.len())
            .field("depthmaps", &self.depthmaps.len())
            .field("live_bytes", &self.live_bytes)
            .finish()
    }
}
