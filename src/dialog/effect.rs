//! Effects a committed scorable applies to a dialog stack

use crate::fiber::{Fault, Item, Rest};

/// Stack mutations requested while handling a turn
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Push a frame; with a resume the current frame waits for its result
    Call {
        target: String,
        rest: Rest,
        argument: Item,
        resume: Option<Rest>,
    },

    /// Push a frame whose result is discarded
    Interrupt {
        target: String,
        rest: Rest,
        argument: Item,
    },

    /// Push a frame and hand it the turn's item
    Forward {
        target: String,
        rest: Rest,
        resume: Rest,
    },

    /// Deliver the turn's item to the waiting frame as if nobody had claimed it
    Post,

    /// Clear the stack
    Reset,

    /// Deliver a fault to the waiting frame
    Fail(Fault),

    /// Send an item back to the user without touching the stack
    Reply(Item),
}

impl Effect {
    pub fn interrupt(target: impl Into<String>, rest: Rest, argument: Item) -> Self {
        Effect::Interrupt {
            target: target.into(),
            rest,
            argument,
        }
    }

    pub fn forward(target: impl Into<String>, rest: Rest, resume: Rest) -> Self {
        Effect::Forward {
            target: target.into(),
            rest,
            resume,
        }
    }

    pub fn reply(text: impl Into<String>) -> Self {
        Effect::Reply(Item::message(text))
    }
}

/// The item a scorable auction runs over: the inbound item plus the effects
/// the winner committed
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    item: Item,
    effects: Vec<Effect>,
}

impl Turn {
    pub fn new(item: Item) -> Self {
        Self {
            item,
            effects: vec![],
        }
    }

    pub fn item(&self) -> &Item {
        &self.item
    }

    /// Text of a string or message item
    pub fn text(&self) -> Option<&str> {
        self.item.as_text()
    }

    pub fn effects(&self) -> &[Effect] {
        &self.effects
    }

    pub fn push(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    #[must_use]
    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn into_parts(self) -> (Item, Vec<Effect>) {
        (self.item, self.effects)
    }
}
