//! Incremental construction of a codemap while a unit is being emitted.
//!
//! Every portal frame becomes one 4-slot entry:
//!
//! ```text
//! [unique_id][rel_start][rel_end][skip_to]
//! ```
//!
//! `rel_end` and `skip_to` are unknown on entry and are back-patched on the
//! matching leave. `skip_to` is the index just past the entry's children,
//! i.e. the next sibling at the same depth.

use tracing::trace;

use crate::storage::{CodemapRecord, CodemapStorage};

/// Slots per frame entry.
pub const ENTRY_LEN: usize = 4;

pub(crate) const UNIQUE_ID: usize = 0;
pub(crate) const REL_START: usize = 1;
pub(crate) const REL_END: usize = 2;
pub(crate) const SKIP_TO: usize = 3;

/// Builds the packed `bytecode_info` for one loop or bridge.
///
/// A builder is used for exactly one unit: [`get_final_bytecode`] consumes it.
///
/// [`get_final_bytecode`]: CodemapBuilder::get_final_bytecode
#[derive(Debug, Clone, Default)]
pub struct CodemapBuilder {
    l: Vec<i64>,
    /// Index of the `rel_end` slot of every frame still open, innermost last.
    patch_position: Vec<usize>,
}

impl CodemapBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of frames entered and not yet left.
    #[inline]
    pub fn open_frames(&self) -> usize {
        self.patch_position.len()
    }

    /// The entries written so far, placeholders included.
    #[inline]
    pub fn as_slice(&self) -> &[i64] {
        &self.l
    }

    /// Open a frame for `unique_id` starting at code offset `relpos`.
    pub fn enter_portal_frame(&mut self, _jd_id: i64, unique_id: i64, relpos: u32) {
        self.l.push(unique_id);
        self.l.push(i64::from(relpos));
        self.patch_position.push(self.l.len());
        self.l.push(0);
        self.l.push(0);
    }

    /// Close the innermost open frame at code offset `relpos`.
    ///
    /// With no frame open this does nothing. Forced deoptimization in the
    /// compiler can emit a leave without its enter.
    pub fn leave_portal_frame(&mut self, _jd_id: i64, relpos: u32) {
        let Some(to_patch) = self.patch_position.pop() else {
            trace!(relpos, "unmatched leave_portal_frame ignored");
            return;
        };
        self.l[to_patch] = i64::from(relpos);
        self.l[to_patch + 1] = self.l.len() as i64;
    }

    /// Re-open every frame active at `pos` in already installed code, so a
    /// bridge leaving from that point reports the same logical stack.
    /// Inherited frames start at offset 0 of the new unit.
    pub fn inherit_code_from_position(&mut self, storage: &CodemapStorage, pos: u64) {
        for unique_id in storage.yield_traceback(pos) {
            self.enter_portal_frame(0, unique_id, 0);
        }
    }

    /// Close every frame still open at `size` and return the sealed record
    /// for code installed at `addr`.
    pub fn get_final_bytecode(mut self, addr: u64, size: u32) -> CodemapRecord {
        while let Some(pos) = self.patch_position.pop() {
            self.l[pos] = i64::from(size);
            self.l[pos + 1] = self.l.len() as i64;
        }
        // Only unique_id may legitimately be zero.
        debug_assert!(
            self.l
                .chunks_exact(ENTRY_LEN)
                .all(|entry| entry[REL_END] > 0 && entry[SKIP_TO] > 0),
            "unsealed codemap entry: {:?}",
            self.l
        );
        CodemapRecord {
            start_addr: addr,
            machine_code_size: size,
            bytecode_info: self.l,
        }
    }
}
