//! Auctions over several scorables

use async_trait::async_trait;
use std::cmp::Ordering;
use std::fmt::Debug;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::combinators::{reduce, NullScorable, Reduced};
use super::{Comparer, Prepared, Scorable, ScorableError, Traits};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Highest score wins, ties to the earliest candidate
    Best,
    /// Earliest eligible candidate wins
    First,
}

/// Runs an auction over candidates and commits only the winner.
///
/// Candidates are prepared and scored in registration order. Every prepared
/// candidate is cleaned up exactly once, including when the auction aborts.
pub struct Fold<I, S> {
    candidates: Vec<Arc<dyn Scorable<I, S>>>,
    comparer: Comparer<S>,
    traits: Option<Traits<S>>,
    mode: Mode,
}

struct Entry {
    candidate: usize,
    state: Prepared,
}

struct FoldState<S> {
    entries: Vec<Entry>,
    /// Position in `entries` and score of the current winner
    winner: Option<(usize, S)>,
}

impl<I, S> Fold<I, S>
where
    I: Send + Sync + 'static,
    S: Clone + Debug + Send + Sync + 'static,
{
    pub fn new(comparer: Comparer<S>, candidates: Vec<Arc<dyn Scorable<I, S>>>) -> Self {
        Self {
            candidates,
            comparer,
            traits: None,
            mode: Mode::Best,
        }
    }

    /// Auction where the first eligible candidate wins; later ones are never prepared
    pub fn first(comparer: Comparer<S>, candidates: Vec<Arc<dyn Scorable<I, S>>>) -> Self {
        Self {
            mode: Mode::First,
            ..Self::new(comparer, candidates)
        }
    }

    /// Enforce a score range. Out-of-range scores abort the auction and a
    /// score equal to the maximum stops evaluation early.
    #[must_use]
    pub fn with_traits(mut self, traits: Traits<S>) -> Self {
        self.traits = Some(traits);
        self
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    fn score(
        &self,
        candidate: &dyn Scorable<I, S>,
        item: &I,
        state: &Prepared,
    ) -> Result<Option<S>, ScorableError> {
        if !candidate.has_score(item, state) {
            return Ok(None);
        }
        let score = candidate.get_score(item, state)?;
        if let Some(traits) = &self.traits {
            traits.check(&score, &self.comparer)?;
        }
        Ok(Some(score))
    }

    async fn cleanup(
        &self,
        item: &I,
        entries: Vec<Entry>,
        token: &CancellationToken,
    ) -> Result<(), ScorableError> {
        let mut first_error = None;
        for entry in entries {
            let Some(candidate) = self.candidates.get(entry.candidate) else {
                continue;
            };
            if let Err(error) = candidate.done(item, entry.state, token).await {
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn abort(
        &self,
        item: &I,
        entries: Vec<Entry>,
        error: ScorableError,
        token: &CancellationToken,
    ) -> ScorableError {
        if let Err(cleanup) = self.cleanup(item, entries, token).await {
            tracing::warn!(error = %cleanup, "cleanup failed while aborting auction");
        }
        error
    }
}

#[async_trait]
impl<I, S> Scorable<I, S> for Fold<I, S>
where
    I: Send + Sync + 'static,
    S: Clone + Debug + Send + Sync + 'static,
{
    async fn prepare(&self, item: &I, token: &CancellationToken) -> Result<Prepared, ScorableError> {
        let mut state = FoldState::<S> {
            entries: vec![],
            winner: None,
        };

        for (index, candidate) in self.candidates.iter().enumerate() {
            let prepared = match candidate.prepare(item, token).await {
                Ok(prepared) => prepared,
                Err(error) => return Err(self.abort(item, state.entries, error, token).await),
            };
            let scored = self.score(candidate.as_ref(), item, &prepared);
            state.entries.push(Entry {
                candidate: index,
                state: prepared,
            });
            let score = match scored {
                Ok(Some(score)) => score,
                Ok(None) => continue,
                Err(error) => return Err(self.abort(item, state.entries, error, token).await),
            };

            let position = state.entries.len() - 1;
            let better = state
                .winner
                .as_ref()
                .map_or(true, |(_, best)| (self.comparer)(&score, best) == Ordering::Greater);
            let maximal = self
                .traits
                .as_ref()
                .is_some_and(|traits| traits.is_maximum(&score, &self.comparer));
            if better {
                state.winner = Some((position, score));
            }
            if maximal || self.mode == Mode::First {
                tracing::debug!(candidate = index, "auction decided early");
                break;
            }
        }

        Ok(Box::new(state))
    }

    fn has_score(&self, _item: &I, state: &Prepared) -> bool {
        state
            .downcast_ref::<FoldState<S>>()
            .is_some_and(|state| state.winner.is_some())
    }

    fn get_score(&self, _item: &I, state: &Prepared) -> Result<S, ScorableError> {
        let state = state
            .downcast_ref::<FoldState<S>>()
            .ok_or(ScorableError::ForeignState)?;
        state
            .winner
            .as_ref()
            .map(|(_, score)| score.clone())
            .ok_or(ScorableError::NoScore)
    }

    async fn post(
        &self,
        item: &mut I,
        state: &mut Prepared,
        token: &CancellationToken,
    ) -> Result<(), ScorableError> {
        let state = state
            .downcast_mut::<FoldState<S>>()
            .ok_or(ScorableError::ForeignState)?;
        let position = state
            .winner
            .as_ref()
            .map(|(position, _)| *position)
            .ok_or(ScorableError::NoScore)?;
        let entry = state
            .entries
            .get_mut(position)
            .ok_or(ScorableError::ForeignState)?;
        let candidate = self
            .candidates
            .get(entry.candidate)
            .ok_or(ScorableError::ForeignState)?;
        tracing::debug!(candidate = entry.candidate, "committing auction winner");
        candidate.post(item, &mut entry.state, token).await
    }

    async fn done(&self, item: &I, state: Prepared, token: &CancellationToken) -> Result<(), ScorableError> {
        let state = state
            .downcast::<FoldState<S>>()
            .map_err(|_| ScorableError::ForeignState)?;
        let FoldState { entries, .. } = *state;
        self.cleanup(item, entries, token).await
    }

    fn never_fires(&self) -> bool {
        self.candidates.iter().all(|candidate| candidate.never_fires())
    }
}

/// Build a bounded auction. Candidates that never fire are dropped; a lone
/// survivor still has its score checked against `traits`.
pub fn fold<I, S>(
    traits: Traits<S>,
    comparer: Comparer<S>,
    candidates: Vec<Arc<dyn Scorable<I, S>>>,
) -> Arc<dyn Scorable<I, S>>
where
    I: Send + Sync + 'static,
    S: Clone + Debug + Send + Sync + 'static,
{
    match reduce(candidates) {
        Reduced::Null => Arc::new(NullScorable),
        Reduced::Single(candidate) => {
            Arc::new(Fold::new(comparer, vec![candidate]).with_traits(traits))
        }
        Reduced::Many(candidates) => Arc::new(Fold::new(comparer, candidates).with_traits(traits)),
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{mocks, CallLog, MockScorable, Stage};
    use super::super::{total_order, try_post};
    use super::*;

    fn bounded(scores: &[Option<f64>], log: &CallLog) -> Fold<String, f64> {
        Fold::new(total_order(), mocks(scores, log)).with_traits(Traits::NORMALIZED)
    }

    async fn run(fold: &Fold<String, f64>) -> (Result<bool, ScorableError>, String) {
        let mut item = String::from("item");
        let result = try_post(fold, &mut item, &CancellationToken::new()).await;
        (result, item)
    }

    #[tokio::test]
    async fn ties_go_to_the_earliest_candidate() {
        let log = CallLog::default();
        let fold = bounded(&[Some(0.1), Some(0.5), Some(0.5), Some(0.3)], &log);

        let (result, item) = run(&fold).await;
        assert!(result.unwrap());
        assert_eq!(item, "item+1");
        assert_eq!(log.posted(), vec![1]);
        for index in 0..4 {
            assert_eq!(log.count(index, Stage::Prepare), 1);
            assert_eq!(log.count(index, Stage::Done), 1);
        }
    }

    #[tokio::test]
    async fn maximum_score_stops_the_auction() {
        let log = CallLog::default();
        let fold = bounded(&[Some(0.2), Some(1.0), Some(0.7)], &log);

        let (result, item) = run(&fold).await;
        assert!(result.unwrap());
        assert_eq!(item, "item+1");
        assert!(log.stages(2).is_empty());
        assert_eq!(log.count(0, Stage::Done), 1);
        assert_eq!(log.count(1, Stage::Done), 1);
    }

    #[tokio::test]
    async fn out_of_range_scores_abort() {
        for score in [1.1, -0.1] {
            let log = CallLog::default();
            let fold = bounded(&[Some(0.3), Some(score), Some(0.2)], &log);

            let (result, item) = run(&fold).await;
            assert!(matches!(result, Err(ScorableError::OutOfRange { .. })));
            assert_eq!(item, "item");
            assert!(log.posted().is_empty());
            assert_eq!(log.count(0, Stage::Done), 1);
            assert_eq!(log.count(1, Stage::Done), 1);
            assert!(log.stages(2).is_empty());
        }
    }

    #[tokio::test]
    async fn ineligible_candidates_are_never_scored() {
        let log = CallLog::default();
        let fold = bounded(&[None, Some(0.4), None], &log);

        let (result, item) = run(&fold).await;
        assert!(result.unwrap());
        assert_eq!(item, "item+1");
        assert_eq!(log.count(0, Stage::GetScore), 0);
        assert_eq!(log.count(2, Stage::GetScore), 0);
        assert_eq!(log.count(2, Stage::Done), 1);
    }

    #[tokio::test]
    async fn nobody_eligible_commits_nothing() {
        let log = CallLog::default();
        let fold = bounded(&[None, None], &log);

        let (result, item) = run(&fold).await;
        assert!(!result.unwrap());
        assert_eq!(item, "item");
        assert_eq!(log.count(0, Stage::Done), 1);
        assert_eq!(log.count(1, Stage::Done), 1);
    }

    #[tokio::test]
    async fn prepare_failure_cleans_up_earlier_candidates() {
        let log = CallLog::default();
        let candidates: Vec<Arc<dyn Scorable<String, f64>>> = vec![
            Arc::new(MockScorable::new(0, Some(0.5), &log)),
            Arc::new(MockScorable::new(1, Some(0.9), &log).failing_prepare()),
            Arc::new(MockScorable::new(2, Some(0.1), &log)),
        ];
        let fold = Fold::new(total_order(), candidates);

        let (result, _) = run(&fold).await;
        assert!(matches!(result, Err(ScorableError::Prepare(_))));
        assert_eq!(log.count(0, Stage::Done), 1);
        assert_eq!(log.count(1, Stage::Done), 0);
        assert!(log.stages(2).is_empty());
    }

    #[tokio::test]
    async fn first_stops_at_the_first_eligible_candidate() {
        let log = CallLog::default();
        let fold = Fold::first(total_order(), mocks(&[None, Some(0.2), Some(0.9)], &log));

        let (result, item) = run(&fold).await;
        assert!(result.unwrap());
        assert_eq!(item, "item+1");
        assert!(log.stages(2).is_empty());
    }

    #[tokio::test]
    async fn unbounded_folds_accept_any_score() {
        let log = CallLog::default();
        let fold = Fold::new(total_order(), mocks(&[Some(3.0), Some(7.5)], &log));

        let (result, item) = run(&fold).await;
        assert!(result.unwrap());
        assert_eq!(item, "item+1");
    }

    #[tokio::test]
    async fn nested_folds_commit_the_inner_winner() {
        let log = CallLog::default();
        let inner: Arc<dyn Scorable<String, f64>> = Arc::new(
            Fold::new(total_order(), vec![Arc::new(MockScorable::new(1, Some(0.6), &log)) as _])
                .with_traits(Traits::NORMALIZED),
        );
        let outer = Fold::new(
            total_order(),
            vec![Arc::new(MockScorable::new(0, Some(0.4), &log)) as _, inner],
        )
        .with_traits(Traits::NORMALIZED);

        let (result, item) = run(&outer).await;
        assert!(result.unwrap());
        assert_eq!(item, "item+1");
        assert_eq!(log.count(0, Stage::Done), 1);
        assert_eq!(log.count(1, Stage::Done), 1);
    }

    #[tokio::test]
    async fn fold_helper_skips_candidates_that_never_fire() {
        let log = CallLog::default();
        let candidates: Vec<Arc<dyn Scorable<String, f64>>> = vec![
            Arc::new(MockScorable::new(0, Some(0.3), &log).never_firing()),
            Arc::new(MockScorable::new(1, Some(0.3), &log)),
        ];
        let auction = fold(Traits::NORMALIZED, total_order(), candidates);

        let mut item = String::new();
        assert!(try_post(auction.as_ref(), &mut item, &CancellationToken::new())
            .await
            .unwrap());
        assert!(log.stages(0).is_empty());
        assert_eq!(item, "+1");

        let empty = fold::<String, f64>(Traits::NORMALIZED, total_order(), vec![]);
        assert!(empty.never_fires());
    }

    #[tokio::test]
    async fn fold_helper_bounds_a_lone_candidate() {
        for score in [1.1, -0.1] {
            let log = CallLog::default();
            let auction = fold(Traits::NORMALIZED, total_order(), mocks(&[Some(score)], &log));

            let mut item = String::from("item");
            let result = try_post(auction.as_ref(), &mut item, &CancellationToken::new()).await;
            assert!(matches!(result, Err(ScorableError::OutOfRange { .. })));
            assert_eq!(item, "item");
            assert!(log.posted().is_empty());
            assert_eq!(log.count(0, Stage::Done), 1);
        }
    }

    #[tokio::test]
    async fn negative_zero_is_a_valid_minimum_score() {
        let log = CallLog::default();
        let fold = bounded(&[Some(-0.0), Some(0.5)], &log);

        let (result, item) = run(&fold).await;
        assert!(result.unwrap());
        assert_eq!(item, "item+1");

        let log = CallLog::default();
        let fold = bounded(&[Some(-0.0), Some(0.0)], &log);
        let (result, item) = run(&fold).await;
        assert!(result.unwrap());
        assert_eq!(item, "item+0");
    }
}
