//! Durable continuation engine
//!
//! A [`Fiber`] is a stack of frames. Each frame owns one continuation slot
//! ([`Wait`]) that names, by registry tag, the code to run when the frame is
//! next resumed. Because slots hold tags and JSON payloads instead of closures,
//! a suspended fiber is plain data and can be persisted between turns.
//!
//! Driving follows the slot [`Need`]:
//! - `Call` or `Poll`: invoke the continuation with the buffered item
//! - `Wait`: suspended until something is posted
//! - `Done`: pop and return the result to the caller frame

mod error;
mod item;
mod registry;
mod stack;
mod wait;

#[cfg(test)]
mod proptests;

pub use error::FiberError;
pub use item::{Awaited, Fault, Item, TypeHierarchy, TypeTag};
pub use registry::{Continuation, FnContinuation, Registry};
pub use stack::{Fiber, FiberSnapshot, Frame, QueuedEvent, Return};
pub use wait::{Need, Rest, Wait};
