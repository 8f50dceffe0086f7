//! # codemap-rs
//!
//! JIT codemap storage: maps addresses inside generated machine code back
//! to the stack of inlined (portal) frames active there, so tracebacks raised
//! from compiled code name the right logical frames.
//!
//! - [`SkipList`]: ordered `u64` index with predecessor search
//! - [`CodemapStorage`]: owns every live codemap and frame-depth range
//! - [`CodemapBuilder`]: records enter/leave events while a unit is emitted
//! - [`Traceback`]: decodes the frames active at one address
//! - [`CodeCache`]: installs loops and bridges and keeps codemaps in sync
//!
//! ## Example
//!
//! ```rust
//! use codemap_rs::{CodemapBuilder, CodemapStorage};
//!
//! let mut builder = CodemapBuilder::new();
//! builder.enter_portal_frame(0, 1, 0);
//! builder.enter_portal_frame(0, 2, 10);
//! builder.leave_portal_frame(0, 20);
//! builder.leave_portal_frame(0, 30);
//!
//! let mut storage = CodemapStorage::new();
//! storage
//!     .register_codemap(builder.get_final_bytecode(0x1000, 30))
//!     .unwrap();
//!
//! assert_eq!(storage.unpack_traceback(0x1000 + 15), vec![1, 2]);
//! assert_eq!(storage.unpack_traceback(0x1000 + 25), vec![1]);
//!
//! storage.free_asm_block(0x1000, 0x1000 + 30);
//! assert!(storage.unpack_traceback(0x1000 + 15).is_empty());
//! ```
//!
//! ## Concurrency
//!
//! Nothing here locks. The embedder registers and evicts code while holding
//! its own compilation lock, and must keep readers such as
//! [`CodemapStorage::unpack_traceback`] from running concurrently with a
//! writer.

#![deny(unsafe_code)]

pub mod builder;
pub mod code_cache;
pub mod config;
pub mod error;
pub mod skiplist;
pub mod storage;
pub mod traceback;

pub use builder::{CodemapBuilder, ENTRY_LEN};
pub use code_cache::{AsmBlock, AsmUnit, CodeCache, CodeCacheStats, LoopId};
pub use config::Config;
pub use error::{Error, Result};
pub use skiplist::{NodeRef, SkipList, MAX_LEVEL};
pub use storage::{CodemapRecord, CodemapRef, CodemapStorage};
pub use traceback::Traceback;

#[cfg(test)]
mod proptests;
