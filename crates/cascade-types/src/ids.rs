//! Identifier types for Cascade entities

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Internal request identifier, minted at admission.
///
/// Ids are monotonic within one [`ReqIdGenerator`] and never reused.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReqId(pub u64);

impl ReqId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ReqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Thread-safe monotonic [`ReqId`] source.
///
/// In practice only the driver thread mints ids, but the counter is atomic
/// so the guarantee does not depend on that.
#[derive(Debug)]
pub struct ReqIdGenerator {
    next: AtomicU64,
}

impl ReqIdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Mint the next id.
    pub fn next(&self) -> ReqId {
        ReqId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ReqIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
