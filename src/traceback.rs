//! Decoding the frame stack active at a machine-code address.

use std::iter::FusedIterator;

use smallvec::SmallVec;
use tracing::trace;

use crate::builder::{ENTRY_LEN, REL_END, REL_START, SKIP_TO, UNIQUE_ID};
use crate::storage::CodemapStorage;

/// Lazily yields the `unique_id`s of the frames active at one offset,
/// outermost first.
///
/// Entries whose range ends at or before the offset are stepped over with
/// their `skip_to` index; an entry that covers the offset is yielded and the
/// walk descends into its children.
#[derive(Debug, Clone)]
pub struct Traceback<'a> {
    info: &'a [i64],
    rel_addr: i64,
    pos: usize,
}

impl<'a> Traceback<'a> {
    /// Walk `info` for the frames active at `rel_addr` bytes into the unit.
    pub fn new(info: &'a [i64], rel_addr: i64) -> Self {
        Self {
            info,
            rel_addr,
            pos: 0,
        }
    }

    /// A traceback with no frames.
    pub fn empty() -> Self {
        Self::new(&[], 0)
    }

    #[inline]
    fn finish(&mut self) -> Option<i64> {
        self.pos = self.info.len();
        None
    }
}

impl Iterator for Traceback<'_> {
    type Item = i64;

    fn next(&mut self) -> Option<i64> {
        loop {
            let Some(entry) = self.info.get(self.pos..self.pos + ENTRY_LEN) else {
                return self.finish();
            };
            if entry[REL_START] > self.rel_addr {
                return self.finish();
            }
            if entry[REL_END] > self.rel_addr {
                self.pos += ENTRY_LEN;
                return Some(entry[UNIQUE_ID]);
            }
            // Malformed data must not loop forever.
            match usize::try_from(entry[SKIP_TO]) {
                Ok(next) if next > self.pos => self.pos = next,
                _ => return self.finish(),
            }
        }
    }
}

impl FusedIterator for Traceback<'_> {}

impl CodemapStorage {
    /// Lazy form of [`unpack_traceback`](Self::unpack_traceback).
    pub fn yield_traceback(&self, pc: u64) -> Traceback<'_> {
        match self.find_codemap_at_addr(pc) {
            Some(codemap) => {
                // In range, so the offset is below `u32::MAX`.
                let rel = (pc - codemap.start_addr) as i64;
                Traceback::new(codemap.bytecode_info, rel)
            }
            None => {
                trace!(pc, "no codemap covers address");
                Traceback::empty()
            }
        }
    }

    /// The `unique_id`s of the frames active at `pc`, outermost first.
    /// Empty when no codemap covers `pc`.
    pub fn unpack_traceback(&self, pc: u64) -> Vec<i64> {
        self.yield_traceback(pc).collect()
    }

    /// Like [`unpack_traceback`](Self::unpack_traceback) without touching
    /// the heap for shallow stacks. Suitable for sampling profilers.
    pub fn unpack_traceback_inline(&self, pc: u64) -> SmallVec<[i64; 8]> {
        self.yield_traceback(pc).collect()
    }
}
