//! In-memory stack store

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{Precondition, StackKey, StackStore, StoreError, StoreResult, Version, Versioned};
use crate::fiber::FiberSnapshot;

/// Stack store kept in process memory. Snapshots are stored as JSON so a
/// loaded stack never aliases the one that was saved.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    stacks: Mutex<BTreeMap<StackKey, Stored>>,
}

#[derive(Debug, Clone)]
struct Stored {
    json: String,
    version: Version,
    updated_at: chrono::DateTime<Utc>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.stacks.lock().map(|stacks| stacks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StackStore for InMemoryStore {
    async fn load(&self, key: &StackKey) -> StoreResult<Option<Versioned>> {
        let stored = {
            let stacks = self.stacks.lock().map_err(|_| StoreError::Poisoned)?;
            stacks.get(key).cloned()
        };
        let Some(stored) = stored else {
            return Ok(None);
        };
        Ok(Some(Versioned {
            snapshot: serde_json::from_str(&stored.json)?,
            version: stored.version,
            updated_at: stored.updated_at,
        }))
    }

    async fn save(
        &self,
        key: &StackKey,
        snapshot: &FiberSnapshot,
        precondition: Precondition,
    ) -> StoreResult<Version> {
        let json = serde_json::to_string(snapshot)?;
        let mut stacks = self.stacks.lock().map_err(|_| StoreError::Poisoned)?;
        let version = precondition.check(key, stacks.get(key).map(|stored| stored.version))?;
        stacks.insert(
            key.clone(),
            Stored {
                json,
                version,
                updated_at: Utc::now(),
            },
        );
        Ok(version)
    }

    async fn delete(&self, key: &StackKey) -> StoreResult<()> {
        self.stacks
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .remove(key);
        Ok(())
    }

    async fn list(&self, address: &str) -> StoreResult<Vec<StackKey>> {
        let stacks = self.stacks.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(stacks
            .keys()
            .filter(|key| key.address == address)
            .cloned()
            .collect())
    }
}
