//! Items flowing through a fiber and the type tags used to match them against waits

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use super::FiberError;

/// Runtime type tag carried by every item
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeTag(String);

impl TypeTag {
    pub const OBJECT: &'static str = "object";
    pub const UNIT: &'static str = "unit";
    pub const STRING: &'static str = "string";
    pub const NUMBER: &'static str = "number";
    pub const BOOL: &'static str = "bool";
    pub const ACTIVITY: &'static str = "activity";
    pub const MESSAGE: &'static str = "message";
    pub const EVENT: &'static str = "event";
    pub const TIMER: &'static str = "timer";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The root tag every other tag is assignable to
    pub fn object() -> Self {
        Self::new(Self::OBJECT)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TypeTag {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for TypeTag {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Single-inheritance tag hierarchy used for covariant type checks.
///
/// `object` is the implicit root. The default hierarchy knows the built-in
/// tags; hosts declare their own with [`TypeHierarchy::declare`].
#[derive(Debug, Clone)]
pub struct TypeHierarchy {
    parents: HashMap<TypeTag, TypeTag>,
}

impl Default for TypeHierarchy {
    fn default() -> Self {
        let mut hierarchy = Self {
            parents: HashMap::new(),
        };
        for tag in [
            TypeTag::UNIT,
            TypeTag::STRING,
            TypeTag::NUMBER,
            TypeTag::BOOL,
            TypeTag::ACTIVITY,
        ] {
            hierarchy.declare(tag, TypeTag::OBJECT);
        }
        hierarchy.declare(TypeTag::MESSAGE, TypeTag::ACTIVITY);
        hierarchy.declare(TypeTag::EVENT, TypeTag::ACTIVITY);
        hierarchy.declare(TypeTag::TIMER, TypeTag::EVENT);
        hierarchy
    }
}

impl TypeHierarchy {
    /// Declare `tag` as a direct subtype of `parent`, replacing any earlier declaration
    pub fn declare(&mut self, tag: impl Into<TypeTag>, parent: impl Into<TypeTag>) -> &mut Self {
        self.parents.insert(tag.into(), parent.into());
        self
    }

    pub fn parent(&self, tag: &TypeTag) -> Option<&TypeTag> {
        self.parents.get(tag)
    }

    /// Whether an item tagged `actual` may be delivered to a wait expecting `expected`
    pub fn is_assignable(&self, actual: &TypeTag, expected: &TypeTag) -> bool {
        if expected.as_str() == TypeTag::OBJECT {
            return true;
        }
        let mut current = Some(actual);
        // Bounded walk so a cyclic declaration cannot hang the check
        for _ in 0..=self.parents.len() {
            match current {
                Some(tag) if tag == expected => return true,
                Some(tag) => current = self.parents.get(tag),
                None => return false,
            }
        }
        false
    }

    pub(crate) fn check(&self, expected: Option<&TypeTag>, item: &Item) -> Result<(), FiberError> {
        match expected {
            Some(expected) if !self.is_assignable(&item.tag, expected) => {
                Err(FiberError::InvalidType {
                    expected: expected.clone(),
                    actual: item.tag.clone(),
                })
            }
            _ => Ok(()),
        }
    }
}

/// A tagged value posted into a fiber or returned from a frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub tag: TypeTag,
    #[serde(default)]
    pub value: Value,
}

impl Item {
    pub fn new(tag: impl Into<TypeTag>, value: Value) -> Self {
        Self {
            tag: tag.into(),
            value,
        }
    }

    pub fn unit() -> Self {
        Self::new(TypeTag::UNIT, Value::Null)
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(TypeTag::STRING, Value::String(text.into()))
    }

    pub fn number(value: f64) -> Self {
        Self::new(TypeTag::NUMBER, json!(value))
    }

    /// An inbound chat message
    pub fn message(text: impl Into<String>) -> Self {
        Self::new(TypeTag::MESSAGE, json!({ "text": text.into() }))
    }

    /// A named non-message activity such as a button press or a channel notification
    pub fn event(name: impl Into<String>, value: Value) -> Self {
        Self::new(TypeTag::EVENT, json!({ "name": name.into(), "value": value }))
    }

    /// A timeout delivered by an external scheduler
    pub fn timer(name: impl Into<String>) -> Self {
        Self::new(TypeTag::TIMER, json!({ "name": name.into() }))
    }

    /// Serialize `value` under an arbitrary tag
    pub fn of<T: Serialize>(tag: impl Into<TypeTag>, value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(tag, serde_json::to_value(value)?))
    }

    /// Text of a string or message item
    pub fn as_text(&self) -> Option<&str> {
        match self.tag.as_str() {
            TypeTag::STRING => self.value.as_str(),
            TypeTag::MESSAGE => self.value.get("text").and_then(Value::as_str),
            _ => None,
        }
    }

    pub fn read<T: DeserializeOwned>(&self) -> Result<T, Fault> {
        serde_json::from_value(self.value.clone()).map_err(|e| {
            Fault::new(
                Fault::INVALID_ITEM,
                format!("cannot read '{}' item: {e}", self.tag),
            )
        })
    }
}

/// A serializable failure travelling through the frame stack.
///
/// Callback errors are faults; an enclosing frame can observe and recover
/// from them through the [`Awaited`] it is resumed with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct Fault {
    pub kind: String,
    pub message: String,
}

impl Fault {
    pub const FIBER: &'static str = "fiber";
    pub const INVALID_ITEM: &'static str = "invalid_item";

    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }
}

impl From<FiberError> for Fault {
    fn from(error: FiberError) -> Self {
        match error {
            FiberError::Unhandled(fault) => fault,
            other => Self::new(Self::FIBER, other.to_string()),
        }
    }
}

/// The value a continuation is resumed with: the delivered item or a fault
#[derive(Debug, Clone, PartialEq)]
pub struct Awaited(Result<Item, Fault>);

impl Awaited {
    pub fn item(item: Item) -> Self {
        Self(Ok(item))
    }

    pub fn fault(fault: Fault) -> Self {
        Self(Err(fault))
    }

    pub fn is_fault(&self) -> bool {
        self.0.is_err()
    }

    pub fn peek(&self) -> Result<&Item, &Fault> {
        self.0.as_ref()
    }

    /// Take the item, surfacing a delivered fault as the error
    pub fn get(self) -> Result<Item, Fault> {
        self.0
    }

    pub fn read<T: DeserializeOwned>(self) -> Result<T, Fault> {
        self.get()?.read()
    }
}

impl From<Result<Item, Fault>> for Awaited {
    fn from(value: Result<Item, Fault>) -> Self {
        Self(value)
    }
}
