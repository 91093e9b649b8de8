//! Scorable handlers and the auction protocol
//!
//! A scorable bids on an item in four steps:
//! 1. `prepare` computes private state without side effects
//! 2. `has_score` / `get_score` report whether and how strongly it wants the item
//! 3. `post` commits, and is only called on the winner
//! 4. `done` releases the prepared state, and always runs

mod combinators;
mod fold;
mod recognizer;

#[cfg(test)]
pub(crate) mod testing;

pub use combinators::{reduce, NullScorable, Reduced, SelectItem, SelectScore, Where, WhereScore};
pub use fold::{fold, Fold};
pub use recognizer::{
    EntitySpan, IntentMatch, IntentScore, IntentScorable, Recognition, Recognizer, RegexMatch,
    RegexScorable,
};

use async_trait::async_trait;
use std::any::Any;
use std::cmp::Ordering;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::fiber::Fault;

/// Opaque per-evaluation state produced by [`Scorable::prepare`]
pub type Prepared = Box<dyn Any + Send + Sync>;

/// Total order over scores
pub type Comparer<S> = Arc<dyn Fn(&S, &S) -> Ordering + Send + Sync>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScorableError {
    #[error("score {score} is outside [{minimum}, {maximum}]")]
    OutOfRange {
        score: String,
        minimum: String,
        maximum: String,
    },
    #[error("scorable has no score for this item")]
    NoScore,
    #[error("prepared state does not belong to this scorable")]
    ForeignState,
    #[error("prepare failed: {0}")]
    Prepare(Fault),
    #[error("commit failed: {0}")]
    Commit(Fault),
    #[error("cleanup failed: {0}")]
    Cleanup(Fault),
}

/// A handler competing to react to an item
#[async_trait]
pub trait Scorable<I, S>: Send + Sync {
    /// Compute private state for `item`. Must not have side effects.
    async fn prepare(&self, item: &I, token: &CancellationToken) -> Result<Prepared, ScorableError>;

    fn has_score(&self, item: &I, state: &Prepared) -> bool;

    /// Only meaningful when [`Scorable::has_score`] returned true
    fn get_score(&self, item: &I, state: &Prepared) -> Result<S, ScorableError>;

    /// Commit: act on the item. Only the winner of an auction is posted.
    async fn post(
        &self,
        item: &mut I,
        state: &mut Prepared,
        token: &CancellationToken,
    ) -> Result<(), ScorableError>;

    /// Release the prepared state
    async fn done(&self, item: &I, state: Prepared, token: &CancellationToken) -> Result<(), ScorableError>;

    /// Statically known to never have a score; such candidates are dropped by [`reduce`]
    fn never_fires(&self) -> bool {
        false
    }
}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<I, S, T> Scorable<I, S> for Arc<T>
where
    I: Send + Sync + 'static,
    S: 'static,
    T: Scorable<I, S> + ?Sized,
{
    async fn prepare(&self, item: &I, token: &CancellationToken) -> Result<Prepared, ScorableError> {
        (**self).prepare(item, token).await
    }

    fn has_score(&self, item: &I, state: &Prepared) -> bool {
        (**self).has_score(item, state)
    }

    fn get_score(&self, item: &I, state: &Prepared) -> Result<S, ScorableError> {
        (**self).get_score(item, state)
    }

    async fn post(
        &self,
        item: &mut I,
        state: &mut Prepared,
        token: &CancellationToken,
    ) -> Result<(), ScorableError> {
        (**self).post(item, state, token).await
    }

    async fn done(&self, item: &I, state: Prepared, token: &CancellationToken) -> Result<(), ScorableError> {
        (**self).done(item, state, token).await
    }

    fn never_fires(&self) -> bool {
        (**self).never_fires()
    }
}

/// Run the full protocol for one scorable.
///
/// Returns whether it committed. Cleanup runs even when the commit fails; the
/// commit error takes precedence over a cleanup error.
pub async fn try_post<I, S, T>(
    scorable: &T,
    item: &mut I,
    token: &CancellationToken,
) -> Result<bool, ScorableError>
where
    I: Send + Sync,
    T: Scorable<I, S> + ?Sized,
{
    let mut state = scorable.prepare(item, token).await?;
    let committed = if scorable.has_score(item, &state) {
        match scorable.get_score(item, &state) {
            Ok(_) => scorable.post(item, &mut state, token).await.map(|()| true),
            Err(error) => Err(error),
        }
    } else {
        Ok(false)
    };
    let cleaned = scorable.done(item, state, token).await;
    let committed = committed?;
    cleaned?;
    Ok(committed)
}

/// Closed score range an auction accepts
#[derive(Debug, Clone, PartialEq)]
pub struct Traits<S> {
    pub minimum: S,
    pub maximum: S,
}

impl Traits<f64> {
    pub const NORMALIZED: Traits<f64> = Traits {
        minimum: 0.0,
        maximum: 1.0,
    };
}

impl<S: Debug> Traits<S> {
    /// Reject scores outside `[minimum, maximum]`
    pub fn check(&self, score: &S, comparer: &Comparer<S>) -> Result<(), ScorableError> {
        if comparer(score, &self.minimum) == Ordering::Less
            || comparer(score, &self.maximum) == Ordering::Greater
        {
            return Err(ScorableError::OutOfRange {
                score: format!("{score:?}"),
                minimum: format!("{:?}", self.minimum),
                maximum: format!("{:?}", self.maximum),
            });
        }
        Ok(())
    }

    pub fn is_maximum(&self, score: &S, comparer: &Comparer<S>) -> bool {
        comparer(score, &self.maximum) == Ordering::Equal
    }
}

/// Total order over `f64` scores.
///
/// Signed zeros compare equal. NaN sorts above or below every finite score,
/// so a bounded auction rejects it as out of range.
pub fn total_order() -> Comparer<f64> {
    Arc::new(|a: &f64, b: &f64| (a + 0.0).total_cmp(&(b + 0.0)))
}

/// Builder methods for wrapping scorables in combinators
pub trait ScorableExt<I, S>: Scorable<I, S> + Sized + 'static {
    /// Only eligible when `predicate` accepts the item
    fn when(self, predicate: impl Fn(&I) -> bool + Send + Sync + 'static) -> Where<I, S> {
        Where::new(Arc::new(self), predicate)
    }

    /// Only eligible when `predicate` accepts the item and its score
    fn when_score(
        self,
        predicate: impl Fn(&I, &S) -> bool + Send + Sync + 'static,
    ) -> WhereScore<I, S> {
        WhereScore::new(Arc::new(self), predicate)
    }

    /// Map scores into another domain
    fn select_score<T>(
        self,
        selector: impl Fn(&I, S) -> T + Send + Sync + 'static,
    ) -> SelectScore<I, S, T> {
        SelectScore::new(Arc::new(self), selector)
    }

    /// Score and commit on a projection of the item
    fn select_item<O>(self, selector: impl Fn(&O) -> I + Send + Sync + 'static) -> SelectItem<O, I, S> {
        SelectItem::new(Arc::new(self), selector)
    }
}

impl<I, S, T: Scorable<I, S> + Sized + 'static> ScorableExt<I, S> for T {}
