//! Mock scorables for testing
//!
//! Every mock writes to a shared [`CallLog`] so tests can assert exactly which
//! protocol steps ran, on which candidate, in which order.

use super::{Prepared, Scorable, ScorableError};
use crate::fiber::Fault;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Prepare,
    HasScore,
    GetScore,
    Post,
    Done,
}

/// Shared record of protocol calls, by candidate index
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<(usize, Stage)>>>,
}

impl CallLog {
    fn record(&self, index: usize, stage: Stage) {
        self.calls.lock().unwrap().push((index, stage));
    }

    pub fn calls(&self) -> Vec<(usize, Stage)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn stages(&self, index: usize) -> Vec<Stage> {
        self.calls()
            .into_iter()
            .filter(|(i, _)| *i == index)
            .map(|(_, stage)| stage)
            .collect()
    }

    pub fn count(&self, index: usize, stage: Stage) -> usize {
        self.calls()
            .into_iter()
            .filter(|call| *call == (index, stage))
            .count()
    }

    /// Candidates committed, in order
    pub fn posted(&self) -> Vec<usize> {
        self.calls()
            .into_iter()
            .filter(|(_, stage)| *stage == Stage::Post)
            .map(|(index, _)| index)
            .collect()
    }
}

/// Scorable over `String` items with a fixed score.
///
/// Committing appends `+{index}` to the item.
pub struct MockScorable {
    index: usize,
    score: Option<f64>,
    log: CallLog,
    fail_prepare: bool,
    fail_post: bool,
    never_fires: bool,
}

/// State handed back by `prepare`, checked on every later call
struct MockState {
    index: usize,
}

impl MockScorable {
    pub fn new(index: usize, score: Option<f64>, log: &CallLog) -> Self {
        Self {
            index,
            score,
            log: log.clone(),
            fail_prepare: false,
            fail_post: false,
            never_fires: false,
        }
    }

    pub fn failing_prepare(mut self) -> Self {
        self.fail_prepare = true;
        self
    }

    pub fn failing_post(mut self) -> Self {
        self.fail_post = true;
        self
    }

    pub fn never_firing(mut self) -> Self {
        self.never_fires = true;
        self
    }

    fn check_state(&self, state: &Prepared) {
        let state = state
            .downcast_ref::<MockState>()
            .expect("state prepared by a mock");
        assert_eq!(state.index, self.index, "state from another candidate");
    }
}

/// Build one mock per score, indexed by position
pub fn mocks(scores: &[Option<f64>], log: &CallLog) -> Vec<Arc<dyn Scorable<String, f64>>> {
    scores
        .iter()
        .enumerate()
        .map(|(index, score)| {
            Arc::new(MockScorable::new(index, *score, log)) as Arc<dyn Scorable<String, f64>>
        })
        .collect()
}

#[async_trait]
impl Scorable<String, f64> for MockScorable {
    async fn prepare(&self, _item: &String, _token: &CancellationToken) -> Result<Prepared, ScorableError> {
        self.log.record(self.index, Stage::Prepare);
        if self.fail_prepare {
            return Err(ScorableError::Prepare(Fault::new("mock", "prepare failed")));
        }
        Ok(Box::new(MockState { index: self.index }))
    }

    fn has_score(&self, _item: &String, state: &Prepared) -> bool {
        self.log.record(self.index, Stage::HasScore);
        self.check_state(state);
        self.score.is_some()
    }

    fn get_score(&self, _item: &String, state: &Prepared) -> Result<f64, ScorableError> {
        self.log.record(self.index, Stage::GetScore);
        self.check_state(state);
        self.score.ok_or(ScorableError::NoScore)
    }

    async fn post(
        &self,
        item: &mut String,
        state: &mut Prepared,
        _token: &CancellationToken,
    ) -> Result<(), ScorableError> {
        self.log.record(self.index, Stage::Post);
        self.check_state(state);
        if self.fail_post {
            return Err(ScorableError::Commit(Fault::new("mock", "post failed")));
        }
        item.push_str(&format!("+{}", self.index));
        Ok(())
    }

    async fn done(&self, _item: &String, state: Prepared, _token: &CancellationToken) -> Result<(), ScorableError> {
        self.log.record(self.index, Stage::Done);
        self.check_state(&state);
        Ok(())
    }

    fn never_fires(&self) -> bool {
        self.never_fires
    }
}
