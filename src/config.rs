/// Configuration for [`CodemapStorage`](crate::CodemapStorage) and
/// [`CodeCache`](crate::CodeCache).
#[derive(Debug, Clone)]
pub struct Config {
    /// Seed for the skip list level generator. Fixing it keeps tower shapes
    /// reproducible between runs.
    pub seed: u64,
    /// Upper bound on live bytes held by the storage, counting codemap
    /// buffers and depth-map ranges. `None` means only the system allocator
    /// limits growth.
    pub memory_limit: Option<usize>,
    /// First machine-code address handed out by the code cache.
    pub code_base: u64,
    /// Alignment of each compiled block (must be a power of two).
    pub code_alignment: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            seed: 42,
            memory_limit: None,
            code_base: 0x1000_0000,
            code_alignment: 16,
        }
    }
}

impl Config {
    /// Set the memory limit.
    pub fn with_memory_limit(mut self, limit: usize) -> Self {
        self.memory_limit = Some(limit);
        self
    }

    /// Set the level generator seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}
