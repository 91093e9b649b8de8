//! Scorables backed by text recognizers
//!
//! Both scorables bid on a [`Turn`] and commit by running an action that
//! usually pushes [`Effect`](crate::dialog::Effect)s onto the turn.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{Prepared, Scorable, ScorableError, Traits};
use crate::dialog::Turn;
use crate::fiber::Fault;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentScore {
    pub intent: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySpan {
    pub kind: String,
    pub text: String,
    pub start: usize,
    pub end: usize,
    #[serde(default)]
    pub score: Option<f64>,
}

/// Output of a recognizer for one utterance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Recognition {
    pub intents: Vec<IntentScore>,
    pub entities: Vec<EntitySpan>,
}

impl Recognition {
    /// Highest scoring result for `intent`
    pub fn best(&self, intent: &str) -> Option<&IntentScore> {
        self.intents
            .iter()
            .filter(|candidate| candidate.intent == intent)
            .max_by(|a, b| a.score.total_cmp(&b.score))
    }
}

/// Language understanding service
#[async_trait]
pub trait Recognizer: Send + Sync {
    async fn recognize(&self, text: &str, token: &CancellationToken) -> Result<Recognition, Fault>;
}

/// A recognized intent handed to the commit action
#[derive(Debug, Clone, PartialEq)]
pub struct IntentMatch {
    pub intent: IntentScore,
    pub entities: Vec<EntitySpan>,
}

type IntentAction = dyn Fn(&mut Turn, &IntentMatch) -> Result<(), Fault> + Send + Sync;

/// Bids on turns whose text a recognizer maps to one intent
pub struct IntentScorable {
    recognizer: Arc<dyn Recognizer>,
    intent: String,
    threshold: f64,
    traits: Traits<f64>,
    action: Box<IntentAction>,
}

impl IntentScorable {
    pub fn new(
        recognizer: Arc<dyn Recognizer>,
        intent: impl Into<String>,
        action: impl Fn(&mut Turn, &IntentMatch) -> Result<(), Fault> + Send + Sync + 'static,
    ) -> Self {
        Self {
            recognizer,
            intent: intent.into(),
            threshold: 0.0,
            traits: Traits::NORMALIZED,
            action: Box::new(action),
        }
    }

    /// Ignore recognitions scoring below `threshold`
    #[must_use]
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    fn matched(state: &Prepared) -> Option<&IntentMatch> {
        state.downcast_ref::<Option<IntentMatch>>()?.as_ref()
    }
}

#[async_trait]
impl Scorable<Turn, f64> for IntentScorable {
    async fn prepare(&self, turn: &Turn, token: &CancellationToken) -> Result<Prepared, ScorableError> {
        let Some(text) = turn.text() else {
            return Ok(Box::new(None::<IntentMatch>));
        };
        let recognition = self
            .recognizer
            .recognize(text, token)
            .await
            .map_err(ScorableError::Prepare)?;
        let matched = recognition
            .best(&self.intent)
            .filter(|best| best.score >= self.threshold)
            .map(|best| IntentMatch {
                intent: best.clone(),
                entities: recognition.entities.clone(),
            });
        Ok(Box::new(matched))
    }

    fn has_score(&self, _turn: &Turn, state: &Prepared) -> bool {
        Self::matched(state).is_some()
    }

    fn get_score(&self, _turn: &Turn, state: &Prepared) -> Result<f64, ScorableError> {
        let matched = Self::matched(state).ok_or(ScorableError::NoScore)?;
        Ok(matched
            .intent
            .score
            .clamp(self.traits.minimum, self.traits.maximum))
    }

    async fn post(
        &self,
        turn: &mut Turn,
        state: &mut Prepared,
        _token: &CancellationToken,
    ) -> Result<(), ScorableError> {
        let matched = Self::matched(state).ok_or(ScorableError::NoScore)?;
        tracing::debug!(intent = %matched.intent.intent, score = matched.intent.score, "intent committed");
        (self.action)(turn, matched).map_err(ScorableError::Commit)
    }

    async fn done(&self, _turn: &Turn, _state: Prepared, _token: &CancellationToken) -> Result<(), ScorableError> {
        Ok(())
    }
}

/// Capture groups of a successful match
#[derive(Debug, Clone, PartialEq)]
pub struct RegexMatch {
    /// Fraction of the text covered by the match
    pub coverage: f64,
    /// Group 0 is the whole match
    pub groups: Vec<Option<String>>,
}

type RegexAction = dyn Fn(&mut Turn, &RegexMatch) -> Result<(), Fault> + Send + Sync;

/// Bids on turns whose text matches a pattern, scored by how much of the text matched
pub struct RegexScorable {
    regex: Regex,
    action: Box<RegexAction>,
}

impl RegexScorable {
    pub fn new(
        pattern: &str,
        action: impl Fn(&mut Turn, &RegexMatch) -> Result<(), Fault> + Send + Sync + 'static,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(pattern)?,
            action: Box::new(action),
        })
    }

    fn matched(state: &Prepared) -> Option<&RegexMatch> {
        state.downcast_ref::<Option<RegexMatch>>()?.as_ref()
    }

    fn find(&self, text: &str) -> Option<RegexMatch> {
        if text.is_empty() {
            return None;
        }
        let captures = self.regex.captures(text)?;
        let whole = captures.get(0)?;
        #[allow(clippy::cast_precision_loss)]
        let coverage = whole.as_str().chars().count() as f64 / text.chars().count() as f64;
        Some(RegexMatch {
            coverage,
            groups: captures
                .iter()
                .map(|group| group.map(|m| m.as_str().to_string()))
                .collect(),
        })
    }
}

#[async_trait]
impl Scorable<Turn, f64> for RegexScorable {
    async fn prepare(&self, turn: &Turn, _token: &CancellationToken) -> Result<Prepared, ScorableError> {
        let matched = turn.text().and_then(|text| self.find(text));
        Ok(Box::new(matched))
    }

    fn has_score(&self, _turn: &Turn, state: &Prepared) -> bool {
        Self::matched(state).is_some()
    }

    fn get_score(&self, _turn: &Turn, state: &Prepared) -> Result<f64, ScorableError> {
        Self::matched(state)
            .map(|matched| matched.coverage)
            .ok_or(ScorableError::NoScore)
    }

    async fn post(
        &self,
        turn: &mut Turn,
        state: &mut Prepared,
        _token: &CancellationToken,
    ) -> Result<(), ScorableError> {
        let matched = Self::matched(state).ok_or(ScorableError::NoScore)?;
        tracing::debug!(pattern = %self.regex, coverage = matched.coverage, "pattern committed");
        (self.action)(turn, matched).map_err(ScorableError::Commit)
    }

    async fn done(&self, _turn: &Turn, _state: Prepared, _token: &CancellationToken) -> Result<(), ScorableError> {
        Ok(())
    }
}
