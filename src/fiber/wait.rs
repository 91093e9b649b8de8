//! The continuation slot held by every frame

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::item::{Awaited, Fault, Item, TypeTag};
use super::FiberError;

/// State of a continuation slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Need {
    /// Nothing registered
    #[default]
    None,
    /// About to be invoked with an argument, or running
    Call,
    /// Suspended until an item or fault is posted
    Wait,
    /// An item or fault was posted and is ready to be consumed
    Poll,
    /// Finished; the result is waiting to be returned to the caller
    Done,
}

impl fmt::Display for Need {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Need::None => "none",
            Need::Call => "call",
            Need::Wait => "wait",
            Need::Poll => "poll",
            Need::Done => "done",
        };
        f.write_str(name)
    }
}

/// Serializable reference to the code a slot resumes.
///
/// `tag` names a continuation in the [`Registry`](super::Registry); `state`
/// is whatever the continuation captured when it registered the wait.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rest {
    pub tag: String,
    #[serde(default)]
    pub state: Value,
}

impl Rest {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            state: Value::Null,
        }
    }

    pub fn with_state<T: Serialize>(tag: impl Into<String>, state: &T) -> Result<Self, Fault> {
        let state = serde_json::to_value(state)
            .map_err(|e| Fault::new(Fault::INVALID_ITEM, format!("cannot capture state: {e}")))?;
        Ok(Self {
            tag: tag.into(),
            state,
        })
    }

    pub fn state_as<T: DeserializeOwned>(&self) -> Result<T, Fault> {
        serde_json::from_value(self.state.clone()).map_err(|e| {
            Fault::new(
                Fault::INVALID_ITEM,
                format!("cannot read state of '{}': {e}", self.tag),
            )
        })
    }
}

/// Continuation slot: what a frame is waiting for and what it resumes with
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Wait {
    need: Need,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rest: Option<Rest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expects: Option<TypeTag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pending: Option<Result<Item, Fault>>,
}

impl Wait {
    pub(crate) fn waiting(rest: Rest, expects: TypeTag) -> Self {
        Self {
            need: Need::Wait,
            rest: Some(rest),
            expects: Some(expects),
            pending: None,
        }
    }

    pub(crate) fn call(rest: Rest, expects: TypeTag, argument: Item) -> Self {
        Self {
            need: Need::Call,
            rest: Some(rest),
            expects: Some(expects),
            pending: Some(Ok(argument)),
        }
    }

    pub fn need(&self) -> Need {
        self.need
    }

    pub fn rest(&self) -> Option<&Rest> {
        self.rest.as_ref()
    }

    pub fn expects(&self) -> Option<&TypeTag> {
        self.expects.as_ref()
    }

    /// The buffered item or fault, if any
    pub fn pending(&self) -> Option<&Result<Item, Fault>> {
        self.pending.as_ref()
    }

    fn require(&self, need: Need) -> Result<(), FiberError> {
        if self.need == need {
            Ok(())
        } else {
            Err(FiberError::InvalidNeed {
                need,
                have: self.need,
            })
        }
    }

    /// Buffer a value for a suspended slot. Type checks happen in the caller.
    pub(crate) fn deliver(&mut self, value: Result<Item, Fault>) -> Result<(), FiberError> {
        self.require(Need::Wait)?;
        self.pending = Some(value);
        self.need = Need::Poll;
        Ok(())
    }

    /// Consume the buffered value and mark the slot as running
    pub(crate) fn begin(&mut self) -> Result<Awaited, FiberError> {
        match self.need {
            Need::Call | Need::Poll => {
                let value = self.pending.take().ok_or(FiberError::InvalidNeed {
                    need: Need::Poll,
                    have: self.need,
                })?;
                self.need = Need::Call;
                Ok(Awaited::from(value))
            }
            have => Err(FiberError::InvalidNeed {
                need: Need::Poll,
                have,
            }),
        }
    }

    pub(crate) fn finish(&mut self, result: Item) {
        self.need = Need::Done;
        self.pending = Some(Ok(result));
    }

    pub(crate) fn into_result(self) -> Item {
        match self.pending {
            Some(Ok(item)) => item,
            _ => Item::unit(),
        }
    }

    /// The slot as it stood before its buffered value was consumed.
    ///
    /// A posted value is dropped and the slot waits again on the same rest;
    /// a call keeps its argument so it is re-invoked.
    pub(crate) fn reopen(&self) -> Self {
        match self.need {
            Need::Poll => Self {
                need: Need::Wait,
                rest: self.rest.clone(),
                expects: self.expects.clone(),
                pending: None,
            },
            _ => self.clone(),
        }
    }
}
