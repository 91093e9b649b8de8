//! Continuation registry
//!
//! Persisted frames only hold a [`Rest`] tag. The registry maps tags back to
//! code when the frame resumes.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::item::{Awaited, Fault, TypeHierarchy, TypeTag};
use super::stack::Fiber;
use super::wait::Rest;
use super::FiberError;

/// Code resumed when a frame's slot is polled.
///
/// Before returning `Ok`, a continuation must register exactly one of
/// [`Fiber::wait`], [`Fiber::call`] with a resume, [`Fiber::forward`] or
/// [`Fiber::done`]. Returning `Err` hands the fault to the caller frame.
#[async_trait]
pub trait Continuation<C>: Send + Sync {
    /// Tag of items this continuation accepts
    fn expects(&self) -> TypeTag {
        TypeTag::object()
    }

    async fn resume(
        &self,
        fiber: &mut Fiber<C>,
        context: &mut C,
        rest: &Rest,
        item: Awaited,
        token: &CancellationToken,
    ) -> Result<(), Fault>;
}

type SyncResume<C> =
    dyn Fn(&mut Fiber<C>, &mut C, &Rest, Awaited) -> Result<(), Fault> + Send + Sync;

/// Adapter for continuations that never await
pub struct FnContinuation<C> {
    expects: TypeTag,
    resume: Box<SyncResume<C>>,
}

impl<C> FnContinuation<C> {
    pub fn new(
        expects: impl Into<TypeTag>,
        resume: impl Fn(&mut Fiber<C>, &mut C, &Rest, Awaited) -> Result<(), Fault>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            expects: expects.into(),
            resume: Box::new(resume),
        }
    }
}

#[async_trait]
impl<C: Send + 'static> Continuation<C> for FnContinuation<C> {
    fn expects(&self) -> TypeTag {
        self.expects.clone()
    }

    async fn resume(
        &self,
        fiber: &mut Fiber<C>,
        context: &mut C,
        rest: &Rest,
        item: Awaited,
        _token: &CancellationToken,
    ) -> Result<(), Fault> {
        (self.resume)(fiber, context, rest, item)
    }
}

/// Tag to continuation mapping plus the type hierarchy used for checks
pub struct Registry<C> {
    types: TypeHierarchy,
    continuations: HashMap<String, Arc<dyn Continuation<C>>>,
}

impl<C> Default for Registry<C> {
    fn default() -> Self {
        Self {
            types: TypeHierarchy::default(),
            continuations: HashMap::new(),
        }
    }
}

impl<C: Send + 'static> Registry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_types(types: TypeHierarchy) -> Self {
        Self {
            types,
            continuations: HashMap::new(),
        }
    }

    pub fn types(&self) -> &TypeHierarchy {
        &self.types
    }

    pub fn types_mut(&mut self) -> &mut TypeHierarchy {
        &mut self.types
    }

    pub fn register(
        &mut self,
        tag: impl Into<String>,
        continuation: impl Continuation<C> + 'static,
    ) -> &mut Self {
        self.continuations
            .insert(tag.into(), Arc::new(continuation));
        self
    }

    pub fn register_fn(
        &mut self,
        tag: impl Into<String>,
        expects: impl Into<TypeTag>,
        resume: impl Fn(&mut Fiber<C>, &mut C, &Rest, Awaited) -> Result<(), Fault>
            + Send
            + Sync
            + 'static,
    ) -> &mut Self {
        self.register(tag, FnContinuation::new(expects, resume))
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.continuations.contains_key(tag)
    }

    pub fn resolve(&self, tag: &str) -> Result<Arc<dyn Continuation<C>>, FiberError> {
        self.continuations
            .get(tag)
            .cloned()
            .ok_or_else(|| FiberError::UnknownContinuation(tag.to_string()))
    }

    /// Declared input tag of the continuation a rest refers to
    pub fn expects(&self, rest: &Rest) -> Result<TypeTag, FiberError> {
        Ok(self.resolve(&rest.tag)?.expects())
    }
}
