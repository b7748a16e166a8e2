//! Pool configuration

use std::num::NonZeroUsize;

/// Default number of concurrently checked-out sessions
pub const DEFAULT_CAPACITY: usize = 8;

/// Worker pool settings
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Upper bound on concurrently checked-out sessions
    pub capacity: NonZeroUsize,
}

impl PoolConfig {
    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self { capacity }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: NonZeroUsize::new(DEFAULT_CAPACITY).unwrap_or(NonZeroUsize::MIN),
        }
    }
}
