//! Frame stack and the driver that runs it

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::item::{Fault, Item};
use super::registry::Registry;
use super::wait::{Need, Rest, Wait};
use super::FiberError;
use crate::config::ResumePolicy;

/// Where a frame's result goes when it completes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Return {
    /// Delivered to the wait of the frame below
    #[default]
    Caller,
    /// Dropped; the frame below keeps waiting on its own rest
    Discard,
}

/// One activation record on the stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    target: String,
    wait: Wait,
    #[serde(default)]
    returns: Return,
    /// Last explicit wait, reused under [`ResumePolicy::RememberLastWait`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mark: Option<Wait>,
}

impl Frame {
    fn new(target: String, wait: Wait, returns: Return) -> Self {
        Self {
            target,
            wait,
            returns,
            mark: None,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn wait(&self) -> &Wait {
        &self.wait
    }

    pub fn returns(&self) -> Return {
        self.returns
    }
}

/// Persisted form of a fiber: frames bottom-first plus the result of a completed run
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FiberSnapshot {
    pub frames: Vec<Frame>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Item>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<QueuedEvent>,
}

/// An item a frame posted to itself, waiting to be run past the scorables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedEvent {
    pub item: Item,
    frame: usize,
}

impl QueuedEvent {
    /// Depth of the frame waiting for this event
    pub fn frame(&self) -> usize {
        self.frame
    }
}

/// Bookkeeping for the continuation currently being resumed
#[derive(Debug)]
struct Activation {
    frame: usize,
    registered: Option<Need>,
    violation: Option<FiberError>,
}

impl Activation {
    fn new(frame: usize) -> Self {
        Self {
            frame,
            registered: None,
            violation: None,
        }
    }
}

/// A durable stack of frames driven one turn at a time.
///
/// Between turns the fiber is plain data (see [`Fiber::snapshot`]). During
/// [`Fiber::poll`] it invokes registered continuations until the top frame
/// waits for input or the stack empties.
pub struct Fiber<C> {
    registry: Arc<Registry<C>>,
    frames: Vec<Frame>,
    result: Option<Item>,
    events: VecDeque<QueuedEvent>,
    policy: ResumePolicy,
    polling: bool,
    activation: Option<Activation>,
}

impl<C: Send + 'static> Fiber<C> {
    pub fn new(registry: Arc<Registry<C>>) -> Self {
        Self::restore(registry, FiberSnapshot::default())
    }

    pub fn restore(registry: Arc<Registry<C>>, snapshot: FiberSnapshot) -> Self {
        Self {
            registry,
            frames: snapshot.frames,
            result: snapshot.result,
            events: snapshot.events.into(),
            policy: ResumePolicy::default(),
            polling: false,
            activation: None,
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: ResumePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn snapshot(&self) -> FiberSnapshot {
        FiberSnapshot {
            frames: self.frames.clone(),
            result: self.result.clone(),
            events: self.events.iter().cloned().collect(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry<C>> {
        &self.registry
    }

    pub fn policy(&self) -> ResumePolicy {
        self.policy
    }

    /// State of the top slot; `Done` once the last frame has returned
    pub fn need(&self) -> Need {
        match self.frames.last() {
            Some(frame) => frame.wait.need(),
            None if self.result.is_some() => Need::Done,
            None => Need::None,
        }
    }

    /// Frames from the innermost (active) one down to the root
    pub fn frames(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter().rev()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Result returned by the root frame of the last completed run
    pub fn result(&self) -> Option<&Item> {
        self.result.as_ref()
    }

    pub fn is_polling(&self) -> bool {
        self.polling
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    /// Take the oldest queued event; the host offers it to the scorables before delivering it
    pub fn pull_event(&mut self) -> Option<QueuedEvent> {
        self.events.pop_front()
    }

    // ========================================================================
    // Stack operations
    // ========================================================================

    /// Push `target` and invoke `rest` with `argument` on the next poll.
    ///
    /// With a `resume`, the calling frame waits on it for the child's result.
    /// Without one the child is an interruption whose result is discarded.
    pub fn call(
        &mut self,
        target: impl Into<String>,
        rest: Rest,
        argument: Item,
        resume: Option<Rest>,
    ) -> Result<(), FiberError> {
        let outcome = self.push_call(target.into(), rest, argument, resume);
        outcome.map_err(|error| self.violate(error))
    }

    /// Push `target` above the current frame without touching its wait
    pub fn interrupt(
        &mut self,
        target: impl Into<String>,
        rest: Rest,
        argument: Item,
    ) -> Result<(), FiberError> {
        self.call(target, rest, argument, None)
    }

    /// Push `target` waiting on `rest` and hand it `item` straight away
    pub fn forward(
        &mut self,
        target: impl Into<String>,
        rest: Rest,
        resume: Rest,
        item: Item,
    ) -> Result<(), FiberError> {
        let outcome = self.push_forward(target.into(), rest, resume, item);
        outcome.map_err(|error| self.violate(error))
    }

    /// Suspend the current frame until an item is posted to it
    pub fn wait(&mut self, rest: Rest) -> Result<(), FiberError> {
        let outcome = self.register_wait(rest);
        outcome.map_err(|error| self.violate(error))
    }

    /// Complete the current frame with `result`
    pub fn done(&mut self, result: Item) -> Result<(), FiberError> {
        let outcome = self.register_done(result);
        outcome.map_err(|error| self.violate(error))
    }

    /// Deliver `item` to the waiting top frame
    pub fn post(&mut self, item: Item) -> Result<(), FiberError> {
        let outcome = self.deliver(Ok(item));
        outcome.map_err(|error| self.violate(error))
    }

    /// Deliver `fault` to the waiting top frame
    pub fn fail(&mut self, fault: Fault) -> Result<(), FiberError> {
        let outcome = self.deliver(Err(fault));
        outcome.map_err(|error| self.violate(error))
    }

    /// Suspend the current frame on `resume` and queue `event` for it.
    ///
    /// The event is not delivered here. The host pulls it after the poll,
    /// offers it to the scorables, and hands it back with
    /// [`Fiber::deliver_event`] when none claims it.
    pub fn post_event(&mut self, event: Item, resume: Rest) -> Result<(), FiberError> {
        let outcome = self.queue_event(event, resume);
        outcome.map_err(|error| self.violate(error))
    }

    /// Deliver a pulled event to the frame that queued it
    pub fn deliver_event(&mut self, event: QueuedEvent) -> Result<(), FiberError> {
        if self.activation.is_some() {
            return Err(self.violate(FiberError::Busy {
                operation: "deliver an event",
            }));
        }
        let QueuedEvent { item, frame } = event;
        let Some(waiting) = self.frames.get_mut(frame) else {
            tracing::warn!(tag = %item.tag, depth = frame, "dropping event for a frame that is gone");
            return Ok(());
        };
        let have = waiting.wait.need();
        if have != Need::Wait {
            return Err(FiberError::InvalidNeed {
                need: Need::Wait,
                have,
            });
        }
        self.registry.types().check(waiting.wait.expects(), &item)?;
        tracing::debug!(tag = %item.tag, depth = frame, "delivering queued event");
        waiting.wait.deliver(Ok(item))
    }

    /// Drop every frame, queued event, and any completed result
    pub fn reset(&mut self) -> Result<(), FiberError> {
        if self.activation.is_some() {
            return Err(self.violate(FiberError::Busy { operation: "reset" }));
        }
        tracing::debug!(depth = self.frames.len(), "resetting fiber");
        self.frames.clear();
        self.events.clear();
        self.result = None;
        Ok(())
    }

    fn push_call(
        &mut self,
        target: String,
        rest: Rest,
        argument: Item,
        resume: Option<Rest>,
    ) -> Result<(), FiberError> {
        self.admit(resume.is_some())?;
        self.ensure_active_on_top()?;
        let expects = self.registry.expects(&rest)?;
        self.registry.types().check(Some(&expects), &argument)?;

        let returns = match resume {
            Some(resume) => {
                let wait = Wait::waiting(resume.clone(), self.registry.expects(&resume)?);
                let index = self.resume_index()?;
                self.frames[index].wait = wait;
                Return::Caller
            }
            None => {
                if self.activation.is_none() {
                    self.ensure_top_waiting()?;
                }
                Return::Discard
            }
        };

        if self.frames.is_empty() {
            self.result = None;
        }
        tracing::debug!(frame = %target, rest = %rest.tag, depth = self.frames.len(), "pushing frame");
        self.frames
            .push(Frame::new(target, Wait::call(rest, expects, argument), returns));
        if returns == Return::Caller {
            self.register(Need::Call);
        }
        Ok(())
    }

    fn push_forward(
        &mut self,
        target: String,
        rest: Rest,
        resume: Rest,
        item: Item,
    ) -> Result<(), FiberError> {
        self.admit(true)?;
        self.ensure_active_on_top()?;
        let expects = self.registry.expects(&rest)?;
        self.registry.types().check(Some(&expects), &item)?;
        let resume_wait = Wait::waiting(resume.clone(), self.registry.expects(&resume)?);
        let index = self.resume_index()?;

        let mut wait = Wait::waiting(rest, expects);
        wait.deliver(Ok(item))?;
        self.frames[index].wait = resume_wait;
        tracing::debug!(frame = %target, depth = self.frames.len(), "forwarding to frame");
        self.frames.push(Frame::new(target, wait, Return::Caller));
        self.register(Need::Call);
        Ok(())
    }

    fn register_wait(&mut self, rest: Rest) -> Result<(), FiberError> {
        self.admit(true)?;
        let expects = self.registry.expects(&rest)?;
        let index = self.resume_index()?;
        self.frames[index].wait = Wait::waiting(rest, expects);
        self.register(Need::Wait);
        Ok(())
    }

    fn queue_event(&mut self, event: Item, resume: Rest) -> Result<(), FiberError> {
        self.admit(true)?;
        let expects = self.registry.expects(&resume)?;
        self.registry.types().check(Some(&expects), &event)?;
        let index = self.resume_index()?;
        self.frames[index].wait = Wait::waiting(resume, expects);
        tracing::debug!(tag = %event.tag, depth = index, "queueing event");
        self.events.push_back(QueuedEvent { item: event, frame: index });
        self.register(Need::Wait);
        Ok(())
    }

    fn register_done(&mut self, result: Item) -> Result<(), FiberError> {
        self.admit(true)?;
        if let Some(index) = self.activation.as_ref().map(|a| a.frame) {
            self.ensure_active_on_top()?;
            self.frames[index].wait.finish(result);
            self.register(Need::Done);
            return Ok(());
        }

        let frame = self.frames.pop().ok_or(FiberError::InvalidNeed {
            need: Need::Wait,
            have: self.need(),
        })?;
        if let Err(error) = self.complete(frame.returns, result) {
            self.frames.push(frame);
            return Err(error);
        }
        Ok(())
    }

    fn deliver(&mut self, value: Result<Item, Fault>) -> Result<(), FiberError> {
        self.admit(false)?;
        let have = self.need();
        let Some(top) = self.frames.last_mut() else {
            return Err(FiberError::InvalidNeed {
                need: Need::Wait,
                have,
            });
        };
        if have != Need::Wait {
            return Err(FiberError::InvalidNeed {
                need: Need::Wait,
                have,
            });
        }
        if let Ok(item) = &value {
            self.registry.types().check(top.wait.expects(), item)?;
        }
        top.wait.deliver(value)
    }

    // ========================================================================
    // Driver
    // ========================================================================

    /// Run continuations until the stack is stable.
    ///
    /// Returns the resulting [`Need`]: `Wait` when the top frame is suspended,
    /// `Done` when the root frame returned, `None` for an empty stack.
    pub async fn poll(
        &mut self,
        context: &mut C,
        token: &CancellationToken,
    ) -> Result<Need, FiberError> {
        if self.polling {
            return Err(self.violate(FiberError::Busy { operation: "poll" }));
        }
        self.polling = true;
        let outcome = self.drive(context, token).await;
        self.polling = false;
        outcome
    }

    async fn drive(&mut self, context: &mut C, token: &CancellationToken) -> Result<Need, FiberError> {
        loop {
            let Some(index) = self.frames.len().checked_sub(1) else {
                return Ok(self.need());
            };
            match self.frames[index].wait.need() {
                Need::Wait => return Ok(Need::Wait),
                Need::Call | Need::Poll => self.step(index, context, token).await?,
                have => {
                    return Err(FiberError::InvalidNeed {
                        need: Need::Poll,
                        have,
                    })
                }
            }
        }
    }

    /// Resume the continuation of frame `index` once and apply what it registered
    async fn step(
        &mut self,
        index: usize,
        context: &mut C,
        token: &CancellationToken,
    ) -> Result<(), FiberError> {
        let frame = &self.frames[index];
        let target = frame.target.clone();
        let reopened = frame.wait.reopen();
        let rest = frame.wait.rest().cloned().ok_or(FiberError::InvalidNeed {
            need: Need::Wait,
            have: Need::None,
        })?;
        let continuation = self.registry.resolve(&rest.tag)?;
        let awaited = self.frames[index].wait.begin()?;

        tracing::debug!(frame = %target, rest = %rest.tag, depth = index, "resuming continuation");
        let queued = self.events.len();
        self.activation = Some(Activation::new(index));
        let outcome = continuation
            .resume(self, context, &rest, awaited, token)
            .await;
        let activation = self
            .activation
            .take()
            .unwrap_or_else(|| Activation::new(index));

        if let Some(violation) = activation.violation {
            tracing::warn!(frame = %target, error = %violation, "continuation violated the fiber protocol");
            self.rewind(index, reopened);
            self.events.truncate(queued);
            return Err(violation);
        }

        let applied = match outcome {
            Err(fault) => self.unwind(index, reopened, fault),
            Ok(()) => match activation.registered {
                Some(Need::Wait) => {
                    if self.policy == ResumePolicy::RememberLastWait {
                        let frame = &mut self.frames[index];
                        frame.mark = Some(frame.wait.clone());
                    }
                    Ok(())
                }
                Some(Need::Done) => self.finish(index, reopened),
                Some(_) => Ok(()),
                None => self.unregistered(index, target, reopened),
            },
        };
        if applied.is_err() {
            self.events.truncate(queued);
        }
        // Events for popped frames would otherwise reach whatever is pushed in their place
        let depth = self.frames.len();
        self.events.retain(|event| event.frame < depth);
        applied
    }

    /// Pop a frame that registered `done` and hand its result on
    fn finish(&mut self, index: usize, reopened: Wait) -> Result<(), FiberError> {
        let Some(frame) = self.frames.pop() else {
            return Ok(());
        };
        let Frame {
            target,
            wait,
            returns,
            mark,
        } = frame;
        tracing::debug!(frame = %target, depth = index, "frame completed");
        if let Err(error) = self.complete(returns, wait.into_result()) {
            self.frames.push(Frame {
                target,
                wait: reopened,
                returns,
                mark,
            });
            return Err(error);
        }
        Ok(())
    }

    fn complete(&mut self, returns: Return, result: Item) -> Result<(), FiberError> {
        let Some(parent) = self.frames.last_mut() else {
            tracing::debug!(tag = %result.tag, "fiber completed");
            self.result = Some(result);
            return Ok(());
        };
        match returns {
            Return::Discard => Ok(()),
            Return::Caller => {
                self.registry.types().check(parent.wait.expects(), &result)?;
                parent.wait.deliver(Ok(result))
            }
        }
    }

    /// Hand a callback fault to the frame below, or leave the stack intact at the bottom
    fn unwind(&mut self, index: usize, reopened: Wait, fault: Fault) -> Result<(), FiberError> {
        if index == 0 {
            tracing::warn!(error = %fault, "unhandled fault reached the root frame");
            self.rewind(index, reopened);
            return Err(FiberError::Unhandled(fault));
        }
        tracing::debug!(error = %fault, depth = index - 1, "delivering fault to caller");
        self.frames.truncate(index);
        self.frames[index - 1].wait.deliver(Err(fault))
    }

    fn unregistered(&mut self, index: usize, target: String, reopened: Wait) -> Result<(), FiberError> {
        if self.policy == ResumePolicy::RememberLastWait {
            if let Some(mark) = self.frames[index].mark.clone() {
                tracing::debug!(frame = %target, "reusing last wait");
                self.frames[index].wait = mark;
                return Ok(());
            }
        }
        tracing::warn!(frame = %target, "continuation returned without a resume handler");
        self.rewind(index, reopened);
        Err(FiberError::NoResumeHandler { target })
    }

    /// Drop frames pushed by a failed activation and restore its slot
    fn rewind(&mut self, index: usize, reopened: Wait) {
        self.frames.truncate(index + 1);
        if let Some(frame) = self.frames.get_mut(index) {
            frame.wait = reopened;
        }
    }

    // ========================================================================
    // Activation bookkeeping
    // ========================================================================

    /// Record a protocol violation so it fails the turn even if the callback swallows it
    fn violate(&mut self, error: FiberError) -> FiberError {
        if let Some(activation) = &mut self.activation {
            activation.violation.get_or_insert_with(|| error.clone());
        }
        error
    }

    fn register(&mut self, need: Need) {
        if let Some(activation) = &mut self.activation {
            activation.registered = Some(need);
        }
    }

    /// Reject operations after `done`, and second registrations
    fn admit(&self, registers: bool) -> Result<(), FiberError> {
        let Some(activation) = &self.activation else {
            return Ok(());
        };
        match activation.registered {
            Some(Need::Done) => Err(FiberError::InvalidNeed {
                need: Need::Call,
                have: Need::Done,
            }),
            Some(_) if registers => Err(FiberError::MultipleResumeHandler {
                target: self
                    .frames
                    .get(activation.frame)
                    .map(|frame| frame.target.clone())
                    .unwrap_or_default(),
            }),
            _ => Ok(()),
        }
    }

    fn ensure_active_on_top(&self) -> Result<(), FiberError> {
        match &self.activation {
            Some(activation) if activation.frame + 1 != self.frames.len() => {
                Err(FiberError::InvalidNeed {
                    need: Need::Call,
                    have: self.need(),
                })
            }
            _ => Ok(()),
        }
    }

    fn ensure_top_waiting(&self) -> Result<(), FiberError> {
        match self.need() {
            Need::Wait | Need::None | Need::Done => Ok(()),
            have => Err(FiberError::InvalidNeed {
                need: Need::Wait,
                have,
            }),
        }
    }

    /// Frame whose wait a registration targets: the active one, or a waiting top
    fn resume_index(&self) -> Result<usize, FiberError> {
        if let Some(activation) = &self.activation {
            return Ok(activation.frame);
        }
        let have = self.need();
        match self.frames.len().checked_sub(1) {
            Some(index) if have == Need::Wait => Ok(index),
            _ => Err(FiberError::InvalidNeed {
                need: Need::Wait,
                have,
            }),
        }
    }
}
