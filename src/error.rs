use crate::code_cache::LoopId;

/// Error type for codemap storage.
///
/// Lookup misses are not errors: they come back as `None` or as an empty
/// traceback.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// An allocation could not be satisfied, either by the system allocator
    /// or because it would exceed the configured memory limit. Nothing was
    /// linked and nothing leaked.
    #[error("out of memory while allocating {requested} bytes of codemap data")]
    OutOfMemory {
        /// Size of the allocation that failed, in bytes.
        requested: usize,
    },

    /// `frame_positions` and `frame_assignments` must pair up one to one.
    #[error("frame depth map has {positions} positions but {assignments} assignments")]
    FrameDepthMismatch {
        /// Number of machine-code positions supplied.
        positions: usize,
        /// Number of depth assignments supplied.
        assignments: usize,
    },

    /// A zero-sized unit cannot close frames that are still open: every
    /// entry would end at offset 0.
    #[error("zero-sized unit still has {open_frames} open frames")]
    EmptyUnit {
        /// Frames entered and never left.
        open_frames: usize,
    },

    /// The loop was never installed or has already been freed.
    #[error("no compiled loop with id {0}")]
    UnknownLoop(LoopId),
}

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
