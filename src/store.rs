//! Persistence for dialog stacks
//!
//! Stacks are stored as [`FiberSnapshot`]s keyed by conversation address and
//! stack id. Every save bumps a version; callers pass a [`Precondition`] so
//! concurrent turns on the same stack cannot silently overwrite each other.

mod memory;
mod schema;
mod sqlite;

pub use memory::InMemoryStore;
pub use schema::SCHEMA;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::fiber::FiberSnapshot;

/// Monotonic per-stack version, starting at 1 on the first save
pub type Version = u64;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StackKey {
    pub address: String,
    pub stack: String,
}

impl StackKey {
    pub fn new(address: impl Into<String>, stack: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            stack: stack.into(),
        }
    }
}

impl fmt::Display for StackKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.stack)
    }
}

/// Condition a save must meet against the stored version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// Overwrite unconditionally
    Any,
    /// Only create; fail if the stack exists
    Absent,
    /// Only overwrite this exact version
    Version(Version),
}

impl Precondition {
    /// Next version if the precondition holds for `current`
    pub fn check(self, key: &StackKey, current: Option<Version>) -> Result<Version, StoreError> {
        match (self, current) {
            (Precondition::Any, current) => Ok(current.map_or(1, |v| v + 1)),
            (Precondition::Absent, None) => Ok(1),
            (Precondition::Version(expected), Some(actual)) if expected == actual => Ok(actual + 1),
            (expected, actual) => Err(StoreError::PreconditionFailed {
                key: key.clone(),
                expected,
                actual,
            }),
        }
    }
}

/// A stored snapshot and the version it was saved at
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned {
    pub snapshot: FiberSnapshot,
    pub version: Version,
    pub updated_at: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("precondition failed for {key}: expected {expected:?}, found {actual:?}")]
    PreconditionFailed {
        key: StackKey,
        expected: Precondition,
        actual: Option<Version>,
    },
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store lock poisoned")]
    Poisoned,
}

impl StoreError {
    pub fn is_precondition_failed(&self) -> bool {
        matches!(self, StoreError::PreconditionFailed { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Storage for dialog stacks
#[async_trait]
pub trait StackStore: Send + Sync {
    /// Load a stack, `None` if it was never saved or was deleted
    async fn load(&self, key: &StackKey) -> StoreResult<Option<Versioned>>;

    /// Save a stack if `precondition` holds, returning the new version
    async fn save(
        &self,
        key: &StackKey,
        snapshot: &FiberSnapshot,
        precondition: Precondition,
    ) -> StoreResult<Version>;

    /// Delete a stack; deleting a missing stack is not an error
    async fn delete(&self, key: &StackKey) -> StoreResult<()>;

    /// Keys of every stack stored for a conversation address
    async fn list(&self, address: &str) -> StoreResult<Vec<StackKey>>;
}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: StackStore + ?Sized> StackStore for Arc<T> {
    async fn load(&self, key: &StackKey) -> StoreResult<Option<Versioned>> {
        (**self).load(key).await
    }

    async fn save(
        &self,
        key: &StackKey,
        snapshot: &FiberSnapshot,
        precondition: Precondition,
    ) -> StoreResult<Version> {
        (**self).save(key, snapshot, precondition).await
    }

    async fn delete(&self, key: &StackKey) -> StoreResult<()> {
        (**self).delete(key).await
    }

    async fn list(&self, address: &str) -> StoreResult<Vec<StackKey>> {
        (**self).list(address).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preconditions() {
        let key = StackKey::new("conv", "main");

        assert_eq!(Precondition::Any.check(&key, None).unwrap(), 1);
        assert_eq!(Precondition::Any.check(&key, Some(4)).unwrap(), 5);
        assert_eq!(Precondition::Absent.check(&key, None).unwrap(), 1);
        assert_eq!(Precondition::Version(2).check(&key, Some(2)).unwrap(), 3);

        assert!(Precondition::Absent
            .check(&key, Some(1))
            .unwrap_err()
            .is_precondition_failed());
        assert!(Precondition::Version(2)
            .check(&key, Some(3))
            .unwrap_err()
            .is_precondition_failed());
        assert!(Precondition::Version(2)
            .check(&key, None)
            .unwrap_err()
            .is_precondition_failed());
    }

    #[test]
    fn keys_display_as_paths() {
        assert_eq!(StackKey::new("conv-1", "main").to_string(), "conv-1/main");
    }
}
