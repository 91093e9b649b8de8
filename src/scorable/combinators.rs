//! Filtering, projection and reduction of scorables

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{Prepared, Scorable, ScorableError};

type ItemPredicate<I> = dyn Fn(&I) -> bool + Send + Sync;
type ScorePredicate<I, S> = dyn Fn(&I, &S) -> bool + Send + Sync;
type Selector<I, S, T> = dyn Fn(&I, S) -> T + Send + Sync;
type ItemSelector<O, I> = dyn Fn(&O) -> I + Send + Sync;

/// Never has a score
#[derive(Debug, Clone, Copy, Default)]
pub struct NullScorable;

#[async_trait]
impl<I: Send + Sync + 'static, S: 'static> Scorable<I, S> for NullScorable {
    async fn prepare(&self, _item: &I, _token: &CancellationToken) -> Result<Prepared, ScorableError> {
        Ok(Box::new(()))
    }

    fn has_score(&self, _item: &I, _state: &Prepared) -> bool {
        false
    }

    fn get_score(&self, _item: &I, _state: &Prepared) -> Result<S, ScorableError> {
        Err(ScorableError::NoScore)
    }

    async fn post(
        &self,
        _item: &mut I,
        _state: &mut Prepared,
        _token: &CancellationToken,
    ) -> Result<(), ScorableError> {
        Err(ScorableError::NoScore)
    }

    async fn done(&self, _item: &I, _state: Prepared, _token: &CancellationToken) -> Result<(), ScorableError> {
        Ok(())
    }

    fn never_fires(&self) -> bool {
        true
    }
}

/// Gates a scorable on a predicate over the item
pub struct Where<I, S> {
    inner: Arc<dyn Scorable<I, S>>,
    predicate: Box<ItemPredicate<I>>,
}

impl<I, S> Where<I, S> {
    pub fn new(
        inner: Arc<dyn Scorable<I, S>>,
        predicate: impl Fn(&I) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner,
            predicate: Box::new(predicate),
        }
    }
}

#[async_trait]
impl<I: Send + Sync + 'static, S: 'static> Scorable<I, S> for Where<I, S> {
    async fn prepare(&self, item: &I, token: &CancellationToken) -> Result<Prepared, ScorableError> {
        self.inner.prepare(item, token).await
    }

    fn has_score(&self, item: &I, state: &Prepared) -> bool {
        self.inner.has_score(item, state) && (self.predicate)(item)
    }

    fn get_score(&self, item: &I, state: &Prepared) -> Result<S, ScorableError> {
        self.inner.get_score(item, state)
    }

    async fn post(
        &self,
        item: &mut I,
        state: &mut Prepared,
        token: &CancellationToken,
    ) -> Result<(), ScorableError> {
        self.inner.post(item, state, token).await
    }

    async fn done(&self, item: &I, state: Prepared, token: &CancellationToken) -> Result<(), ScorableError> {
        self.inner.done(item, state, token).await
    }

    fn never_fires(&self) -> bool {
        self.inner.never_fires()
    }
}

/// Gates a scorable on a predicate over the item and its score
pub struct WhereScore<I, S> {
    inner: Arc<dyn Scorable<I, S>>,
    predicate: Box<ScorePredicate<I, S>>,
}

impl<I, S> WhereScore<I, S> {
    pub fn new(
        inner: Arc<dyn Scorable<I, S>>,
        predicate: impl Fn(&I, &S) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner,
            predicate: Box::new(predicate),
        }
    }
}

#[async_trait]
impl<I: Send + Sync + 'static, S: 'static> Scorable<I, S> for WhereScore<I, S> {
    async fn prepare(&self, item: &I, token: &CancellationToken) -> Result<Prepared, ScorableError> {
        self.inner.prepare(item, token).await
    }

    fn has_score(&self, item: &I, state: &Prepared) -> bool {
        self.inner.has_score(item, state)
            && self
                .inner
                .get_score(item, state)
                .is_ok_and(|score| (self.predicate)(item, &score))
    }

    fn get_score(&self, item: &I, state: &Prepared) -> Result<S, ScorableError> {
        self.inner.get_score(item, state)
    }

    async fn post(
        &self,
        item: &mut I,
        state: &mut Prepared,
        token: &CancellationToken,
    ) -> Result<(), ScorableError> {
        self.inner.post(item, state, token).await
    }

    async fn done(&self, item: &I, state: Prepared, token: &CancellationToken) -> Result<(), ScorableError> {
        self.inner.done(item, state, token).await
    }

    fn never_fires(&self) -> bool {
        self.inner.never_fires()
    }
}

/// Projects the scores of a scorable into another domain
pub struct SelectScore<I, S, T> {
    inner: Arc<dyn Scorable<I, S>>,
    selector: Box<Selector<I, S, T>>,
}

impl<I, S, T> SelectScore<I, S, T> {
    pub fn new(
        inner: Arc<dyn Scorable<I, S>>,
        selector: impl Fn(&I, S) -> T + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner,
            selector: Box::new(selector),
        }
    }
}

#[async_trait]
impl<I, S, T> Scorable<I, T> for SelectScore<I, S, T>
where
    I: Send + Sync + 'static,
    S: 'static,
    T: 'static,
{
    async fn prepare(&self, item: &I, token: &CancellationToken) -> Result<Prepared, ScorableError> {
        self.inner.prepare(item, token).await
    }

    fn has_score(&self, item: &I, state: &Prepared) -> bool {
        self.inner.has_score(item, state)
    }

    fn get_score(&self, item: &I, state: &Prepared) -> Result<T, ScorableError> {
        let score = self.inner.get_score(item, state)?;
        Ok((self.selector)(item, score))
    }

    async fn post(
        &self,
        item: &mut I,
        state: &mut Prepared,
        token: &CancellationToken,
    ) -> Result<(), ScorableError> {
        self.inner.post(item, state, token).await
    }

    async fn done(&self, item: &I, state: Prepared, token: &CancellationToken) -> Result<(), ScorableError> {
        self.inner.done(item, state, token).await
    }

    fn never_fires(&self) -> bool {
        self.inner.never_fires()
    }
}

/// Runs a scorable on a projection of the item.
///
/// The projection is taken once in `prepare` and carried in the prepared
/// state, so scoring and commit see the same value. A commit mutates the
/// projection, never the outer item.
pub struct SelectItem<O, I, S> {
    inner: Arc<dyn Scorable<I, S>>,
    selector: Box<ItemSelector<O, I>>,
}

impl<O, I, S> SelectItem<O, I, S> {
    pub fn new(
        inner: Arc<dyn Scorable<I, S>>,
        selector: impl Fn(&O) -> I + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner,
            selector: Box::new(selector),
        }
    }
}

struct Selected<I> {
    item: I,
    state: Prepared,
}

#[async_trait]
impl<O, I, S> Scorable<O, S> for SelectItem<O, I, S>
where
    O: Send + Sync + 'static,
    I: Send + Sync + 'static,
    S: 'static,
{
    async fn prepare(&self, item: &O, token: &CancellationToken) -> Result<Prepared, ScorableError> {
        let item = (self.selector)(item);
        let state = self.inner.prepare(&item, token).await?;
        Ok(Box::new(Selected { item, state }))
    }

    fn has_score(&self, _item: &O, state: &Prepared) -> bool {
        state
            .downcast_ref::<Selected<I>>()
            .is_some_and(|selected| self.inner.has_score(&selected.item, &selected.state))
    }

    fn get_score(&self, _item: &O, state: &Prepared) -> Result<S, ScorableError> {
        let selected = state
            .downcast_ref::<Selected<I>>()
            .ok_or(ScorableError::ForeignState)?;
        self.inner.get_score(&selected.item, &selected.state)
    }

    async fn post(
        &self,
        _item: &mut O,
        state: &mut Prepared,
        token: &CancellationToken,
    ) -> Result<(), ScorableError> {
        let selected = state
            .downcast_mut::<Selected<I>>()
            .ok_or(ScorableError::ForeignState)?;
        self.inner
            .post(&mut selected.item, &mut selected.state, token)
            .await
    }

    async fn done(&self, _item: &O, state: Prepared, token: &CancellationToken) -> Result<(), ScorableError> {
        let selected = state
            .downcast::<Selected<I>>()
            .map_err(|_| ScorableError::ForeignState)?;
        let Selected { item, state } = *selected;
        self.inner.done(&item, state, token).await
    }

    fn never_fires(&self) -> bool {
        self.inner.never_fires()
    }
}

/// A candidate set with never-firing members removed
pub enum Reduced<I, S> {
    Null,
    Single(Arc<dyn Scorable<I, S>>),
    Many(Vec<Arc<dyn Scorable<I, S>>>),
}

/// Drop candidates that can never fire and classify what is left
pub fn reduce<I, S>(candidates: Vec<Arc<dyn Scorable<I, S>>>) -> Reduced<I, S>
where
    I: Send + Sync + 'static,
    S: 'static,
{
    let mut survivors: Vec<_> = candidates
        .into_iter()
        .filter(|candidate| !candidate.never_fires())
        .collect();
    match survivors.len() {
        0 => Reduced::Null,
        1 => match survivors.pop() {
            Some(single) => Reduced::Single(single),
            None => Reduced::Null,
        },
        _ => Reduced::Many(survivors),
    }
}
