//! Task manager: the per-conversation turn loop
//!
//! A [`TaskManager`] owns the dialog stacks of one conversation address. Each
//! turn loads a stack, lets the registered scorables bid on the inbound item,
//! applies the winner's effects (or posts the item to the stack), polls until
//! the stack is stable and saves it back. Events that frames queued for
//! themselves go through the same auction before the stack is saved.

use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{ConcurrencyPolicy, EngineConfig};
use crate::dialog::{DialogStack, Turn};
use crate::fiber::{FiberError, Item, Need, Registry, Rest};
use crate::scorable::{fold, total_order, try_post, Scorable, ScorableError, Traits};
use crate::store::{Precondition, StackKey, StackStore, StoreError};

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Fiber error: {0}")]
    Fiber(#[from] FiberError),
    #[error("Scorable error: {0}")]
    Scorable(#[from] ScorableError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("unknown stack: {0}")]
    UnknownStack(String),
}

/// What a turn did to its stack
#[derive(Debug, Clone, PartialEq)]
pub struct TurnReport {
    pub stack: String,
    /// A scorable claimed the item instead of the waiting frame
    pub interrupted: bool,
    pub need: Need,
    pub replies: Vec<Item>,
    /// Result of the root dialog when it completed this turn
    pub result: Option<Item>,
}

/// Dialog started on an empty stack before its first turn
#[derive(Debug, Clone)]
struct Root {
    target: String,
    rest: Rest,
}

pub struct TaskManager<C> {
    address: String,
    registry: Arc<Registry<C>>,
    store: Arc<dyn StackStore>,
    config: EngineConfig,
    scorables: Vec<Arc<dyn Scorable<Turn, f64>>>,
    root: Option<Root>,
    stacks: BTreeMap<String, DialogStack<C>>,
}

impl<C: Send + 'static> TaskManager<C> {
    pub fn new(
        address: impl Into<String>,
        registry: Arc<Registry<C>>,
        store: Arc<dyn StackStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            address: address.into(),
            registry,
            store,
            config,
            scorables: vec![],
            root: None,
            stacks: BTreeMap::new(),
        }
    }

    /// Start `target` at `rest` whenever a turn finds its stack empty
    #[must_use]
    pub fn with_root(mut self, target: impl Into<String>, rest: Rest) -> Self {
        self.root = Some(Root {
            target: target.into(),
            rest,
        });
        self
    }

    /// Add a scorable to every turn's auction
    #[must_use]
    pub fn with_scorable(mut self, scorable: impl Scorable<Turn, f64> + 'static) -> Self {
        self.scorables.push(Arc::new(scorable));
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// A stack held in memory, if it was loaded
    pub fn stack(&self, id: &str) -> Option<&DialogStack<C>> {
        self.stacks.get(id)
    }

    /// Ids of the stacks stored for this conversation
    pub async fn stack_ids(&self) -> Result<Vec<String>, TaskError> {
        let keys = self.store.list(&self.address).await?;
        Ok(keys.into_iter().map(|key| key.stack).collect())
    }

    /// Load a stack from the store, or create an empty one the first time it is used
    pub async fn load(&mut self, id: &str) -> Result<&mut DialogStack<C>, TaskError> {
        if !self.stacks.contains_key(id) {
            let stack = self.fetch(id).await?;
            self.stacks.insert(id.to_string(), stack);
        }
        self.stacks
            .get_mut(id)
            .ok_or_else(|| TaskError::UnknownStack(id.to_string()))
    }

    /// Start a proactive dialog on a new stack and return its report
    pub async fn spawn(
        &mut self,
        target: impl Into<String>,
        rest: Rest,
        argument: Item,
        context: &mut C,
        token: &CancellationToken,
    ) -> Result<TurnReport, TaskError> {
        let id = Uuid::new_v4().to_string();
        tracing::info!(stack = %id, "spawning stack");
        let mut stack = DialogStack::new(&id, Arc::clone(&self.registry), self.config.resume_policy);

        let outcome = match stack.call(target, rest, argument, None) {
            Ok(()) => stack.poll(context, token).await.map_err(TaskError::from),
            Err(error) => Err(error.into()),
        };
        self.settle(stack, outcome, false, vec![]).await
    }

    /// Run one turn on stack `id`
    pub async fn post(
        &mut self,
        id: &str,
        item: Item,
        context: &mut C,
        token: &CancellationToken,
    ) -> Result<TurnReport, TaskError> {
        let mut stack = self.take(id).await?;
        let mut interrupted = false;
        let mut replies = vec![];
        let outcome = self
            .run_turn(&mut stack, item, context, token, &mut interrupted, &mut replies)
            .await;
        self.settle(stack, outcome, interrupted, replies).await
    }

    /// Run one turn on the configured default stack
    pub async fn post_default(
        &mut self,
        item: Item,
        context: &mut C,
        token: &CancellationToken,
    ) -> Result<TurnReport, TaskError> {
        let id = self.config.default_stack.clone();
        self.post(&id, item, context, token).await
    }

    /// Clear a stack and save it empty
    pub async fn reset(&mut self, id: &str) -> Result<(), TaskError> {
        let cached = self.stacks.get(id).map(DialogStack::version);
        let mut stack = match cached {
            Some(None) => return Err(TaskError::UnknownStack(id.to_string())),
            Some(Some(_)) => self.take(id).await?,
            None => {
                let stack = self.fetch(id).await?;
                if stack.version().is_none() {
                    return Err(TaskError::UnknownStack(id.to_string()));
                }
                stack
            }
        };
        if let Err(error) = stack.reset() {
            self.stacks.insert(id.to_string(), stack);
            return Err(error.into());
        }
        self.settle(stack, Ok(Need::None), false, vec![])
            .await
            .map(|_| ())
    }

    /// Drop the in-memory copy so the next turn reloads it
    pub fn evict(&mut self, id: &str) -> bool {
        self.stacks.remove(id).is_some()
    }

    /// Delete every stack of this conversation
    pub async fn delete_conversation(&mut self) -> Result<(), TaskError> {
        for key in self.store.list(&self.address).await? {
            self.store.delete(&key).await?;
        }
        self.stacks.clear();
        tracing::info!(address = %self.address, "deleted conversation");
        Ok(())
    }

    async fn fetch(&self, id: &str) -> Result<DialogStack<C>, TaskError> {
        let registry = Arc::clone(&self.registry);
        let policy = self.config.resume_policy;
        match self.store.load(&self.key(id)).await? {
            Some(stored) => {
                tracing::debug!(stack = %id, version = stored.version, "loaded stack");
                Ok(DialogStack::restore(
                    id,
                    registry,
                    policy,
                    stored.snapshot,
                    stored.version,
                ))
            }
            None => Ok(DialogStack::new(id, registry, policy)),
        }
    }

    async fn take(&mut self, id: &str) -> Result<DialogStack<C>, TaskError> {
        match self.stacks.remove(id) {
            Some(stack) => Ok(stack),
            None => self.fetch(id).await,
        }
    }

    async fn run_turn(
        &self,
        stack: &mut DialogStack<C>,
        item: Item,
        context: &mut C,
        token: &CancellationToken,
        interrupted: &mut bool,
        replies: &mut Vec<Item>,
    ) -> Result<Need, TaskError> {
        if stack.depth() == 0 {
            if let Some(root) = &self.root {
                tracing::info!(stack = %stack.id(), frame = %root.target, "starting root dialog");
                stack.call(root.target.clone(), root.rest.clone(), Item::unit(), None)?;
                stack.poll(context, token).await?;
            }
        }

        let auction = fold(Traits::NORMALIZED, total_order(), self.scorables.clone());
        let mut turn = Turn::new(item);
        *interrupted = try_post::<Turn, f64, _>(&*auction, &mut turn, token).await?;

        if *interrupted {
            tracing::debug!(stack = %stack.id(), effects = turn.effects().len(), "scorable claimed turn");
            replies.extend(stack.apply(turn)?);
        } else {
            let (item, _) = turn.into_parts();
            stack.post(item)?;
        }
        let mut need = stack.poll(context, token).await?;

        while let Some(event) = stack.pull_event() {
            let mut turn = Turn::new(event.item.clone());
            if try_post::<Turn, f64, _>(&*auction, &mut turn, token).await? {
                tracing::debug!(stack = %stack.id(), tag = %event.item.tag, "scorable claimed queued event");
                replies.extend(stack.apply(turn)?);
            } else {
                stack.deliver_event(event)?;
            }
            need = stack.poll(context, token).await?;
        }
        Ok(need)
    }

    /// Save the stack after a turn and put it back in the cache
    async fn settle(
        &mut self,
        mut stack: DialogStack<C>,
        outcome: Result<Need, TaskError>,
        interrupted: bool,
        replies: Vec<Item>,
    ) -> Result<TurnReport, TaskError> {
        let id = stack.id().to_string();
        let key = self.key(&id);
        let precondition = match (self.config.concurrency, stack.version()) {
            (ConcurrencyPolicy::LastWriterWins, _) => Precondition::Any,
            (ConcurrencyPolicy::Optimistic, None) => Precondition::Absent,
            (ConcurrencyPolicy::Optimistic, Some(version)) => Precondition::Version(version),
        };

        let saved = self.store.save(&key, &stack.snapshot(), precondition).await;
        match saved {
            Ok(version) => {
                tracing::info!(stack = %id, version, depth = stack.depth(), "saved stack");
                stack.set_version(version);
            }
            Err(error) => {
                if error.is_precondition_failed() {
                    tracing::warn!(stack = %id, %error, "stale stack, evicting");
                } else if outcome.is_err() {
                    tracing::error!(stack = %id, %error, "failed to save stack after failed turn");
                }
                // Evicted on any failure so the next turn reloads from the store
                self.stacks.remove(&id);
                outcome?;
                return Err(error.into());
            }
        }

        let result = stack.fiber().result().cloned();
        self.stacks.insert(id.clone(), stack);
        let need = outcome?;
        Ok(TurnReport {
            stack: id,
            interrupted,
            need,
            replies,
            result,
        })
    }

    fn key(&self, id: &str) -> StackKey {
        StackKey::new(&self.address, id)
    }
}
