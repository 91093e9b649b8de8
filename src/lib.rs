//! Dialog fiber - durable dialog stacks for conversational bots
//!
//! A dialog is a stack of frames, each suspended on a continuation named by a
//! serializable tag. The [`fiber`] module drives those frames, [`dialog`] and
//! [`task`] run turns over them and [`store`] persists them between turns.
//! Handlers that want to react to an item bid for it through [`scorable`].

#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

pub mod config;
pub mod dialog;
pub mod fiber;
pub mod scorable;
pub mod store;
pub mod task;
