//! Dialog stacks
//!
//! A [`DialogStack`] is a fiber with an identity and a storage version. It is
//! the unit the task manager loads, drives and saves for each turn.

mod chain;
mod effect;

pub use chain::{default_if_fault, Catch, Loop};
pub use effect::{Effect, Turn};

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::ResumePolicy;
use crate::fiber::{
    Fault, Fiber, FiberError, FiberSnapshot, Item, Need, QueuedEvent, Registry, Rest, TypeTag,
};
use crate::store::Version;

/// Read-only view of one frame
#[derive(Debug, Clone, PartialEq)]
pub struct FrameInfo {
    pub target: String,
    pub need: Need,
    pub expects: Option<TypeTag>,
    pub rest: Option<String>,
}

pub struct DialogStack<C> {
    id: String,
    fiber: Fiber<C>,
    version: Option<Version>,
}

impl<C: Send + 'static> DialogStack<C> {
    pub fn new(id: impl Into<String>, registry: Arc<Registry<C>>, policy: ResumePolicy) -> Self {
        Self {
            id: id.into(),
            fiber: Fiber::new(registry).with_policy(policy),
            version: None,
        }
    }

    /// Rebuild a stack loaded from storage at `version`
    pub fn restore(
        id: impl Into<String>,
        registry: Arc<Registry<C>>,
        policy: ResumePolicy,
        snapshot: FiberSnapshot,
        version: Version,
    ) -> Self {
        Self {
            id: id.into(),
            fiber: Fiber::restore(registry, snapshot).with_policy(policy),
            version: Some(version),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Storage version this stack was loaded or last saved at
    pub fn version(&self) -> Option<Version> {
        self.version
    }

    pub(crate) fn set_version(&mut self, version: Version) {
        self.version = Some(version);
    }

    pub fn fiber(&self) -> &Fiber<C> {
        &self.fiber
    }

    pub fn fiber_mut(&mut self) -> &mut Fiber<C> {
        &mut self.fiber
    }

    pub fn snapshot(&self) -> FiberSnapshot {
        self.fiber.snapshot()
    }

    pub fn need(&self) -> Need {
        self.fiber.need()
    }

    pub fn depth(&self) -> usize {
        self.fiber.depth()
    }

    /// Frames from the active one down to the root
    pub fn frames(&self) -> Vec<FrameInfo> {
        self.fiber
            .frames()
            .map(|frame| FrameInfo {
                target: frame.target().to_string(),
                need: frame.wait().need(),
                expects: frame.wait().expects().cloned(),
                rest: frame.wait().rest().map(|rest| rest.tag.clone()),
            })
            .collect()
    }

    pub fn call(
        &mut self,
        target: impl Into<String>,
        rest: Rest,
        argument: Item,
        resume: Option<Rest>,
    ) -> Result<(), FiberError> {
        self.fiber.call(target, rest, argument, resume)
    }

    pub fn interrupt(
        &mut self,
        target: impl Into<String>,
        rest: Rest,
        argument: Item,
    ) -> Result<(), FiberError> {
        self.fiber.interrupt(target, rest, argument)
    }

    pub fn forward(
        &mut self,
        target: impl Into<String>,
        rest: Rest,
        resume: Rest,
        item: Item,
    ) -> Result<(), FiberError> {
        self.fiber.forward(target, rest, resume, item)
    }

    pub fn wait(&mut self, rest: Rest) -> Result<(), FiberError> {
        self.fiber.wait(rest)
    }

    pub fn done(&mut self, result: Item) -> Result<(), FiberError> {
        self.fiber.done(result)
    }

    pub fn post(&mut self, item: Item) -> Result<(), FiberError> {
        self.fiber.post(item)
    }

    pub fn fail(&mut self, fault: Fault) -> Result<(), FiberError> {
        self.fiber.fail(fault)
    }

    pub fn reset(&mut self) -> Result<(), FiberError> {
        self.fiber.reset()
    }

    pub fn post_event(&mut self, event: Item, resume: Rest) -> Result<(), FiberError> {
        self.fiber.post_event(event, resume)
    }

    pub fn pending_events(&self) -> usize {
        self.fiber.pending_events()
    }

    pub fn pull_event(&mut self) -> Option<QueuedEvent> {
        self.fiber.pull_event()
    }

    pub fn deliver_event(&mut self, event: QueuedEvent) -> Result<(), FiberError> {
        self.fiber.deliver_event(event)
    }

    pub async fn poll(
        &mut self,
        context: &mut C,
        token: &CancellationToken,
    ) -> Result<Need, FiberError> {
        self.fiber.poll(context, token).await
    }

    /// Apply the effects a scorable committed to `turn`, returning its replies
    pub fn apply(&mut self, turn: Turn) -> Result<Vec<Item>, FiberError> {
        let (item, effects) = turn.into_parts();
        let mut replies = vec![];
        for effect in effects {
            match effect {
                Effect::Call {
                    target,
                    rest,
                    argument,
                    resume,
                } => self.call(target, rest, argument, resume)?,
                Effect::Interrupt {
                    target,
                    rest,
                    argument,
                } => self.interrupt(target, rest, argument)?,
                Effect::Forward {
                    target,
                    rest,
                    resume,
                } => self.forward(target, rest, resume, item.clone())?,
                Effect::Post => self.post(item.clone())?,
                Effect::Reset => self.reset()?,
                Effect::Fail(fault) => self.fail(fault)?,
                Effect::Reply(reply) => replies.push(reply),
            }
        }
        Ok(replies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Transcript {
        lines: Vec<String>,
    }

    fn registry() -> Arc<Registry<Transcript>> {
        let mut registry = Registry::<Transcript>::new();
        registry
            .register_fn("greet", TypeTag::OBJECT, |fiber, _t, _rest, _item| {
                fiber.wait(Rest::new("listen"))?;
                Ok(())
            })
            .register_fn("listen", TypeTag::STRING, |fiber, t, _rest, item| {
                t.lines.push(format!("root:{}", item.read::<String>()?));
                fiber.wait(Rest::new("listen"))?;
                Ok(())
            })
            .register_fn("child", TypeTag::STRING, |fiber, t, _rest, item| {
                let text = item.read::<String>()?;
                t.lines.push(format!("child:{text}"));
                fiber.done(Item::text(text))?;
                Ok(())
            })
            .register_fn("announce", TypeTag::STRING, |fiber, _t, _rest, item| {
                let text = item.read::<String>()?;
                fiber.post_event(Item::event("announced", text.into()), Rest::new("heard"))?;
                Ok(())
            })
            .register_fn("heard", TypeTag::EVENT, |fiber, t, _rest, item| {
                let event = item.get()?;
                t.lines.push(format!("heard:{}", event.value["value"]));
                fiber.wait(Rest::new("listen"))?;
                Ok(())
            })
            .register_fn("help", TypeTag::OBJECT, |fiber, t, _rest, _item| {
                t.lines.push("help".into());
                fiber.done(Item::unit())?;
                Ok(())
            });
        Arc::new(registry)
    }

    async fn started(transcript: &mut Transcript) -> DialogStack<Transcript> {
        let mut stack = DialogStack::new("main", registry(), ResumePolicy::Strict);
        stack
            .call("root", Rest::new("greet"), Item::unit(), None)
            .unwrap();
        stack
            .poll(transcript, &CancellationToken::new())
            .await
            .unwrap();
        stack
    }

    #[tokio::test]
    async fn forward_scenario() {
        let mut transcript = Transcript::default();
        let mut stack = started(&mut transcript).await;

        stack
            .forward("child", Rest::new("child"), Rest::new("listen"), Item::text("foo"))
            .unwrap();
        let frames = stack.frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].target, "child");
        assert_eq!(frames[0].need, Need::Poll);
        assert_eq!(frames[1].target, "root");
        assert_eq!(frames[1].rest.as_deref(), Some("listen"));

        let need = stack
            .poll(&mut transcript, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(need, Need::Wait);
        assert_eq!(transcript.lines, vec!["child:foo", "root:foo"]);
    }

    #[tokio::test]
    async fn apply_runs_effects_in_order_and_collects_replies() {
        let mut transcript = Transcript::default();
        let mut stack = started(&mut transcript).await;

        let turn = Turn::new(Item::text("hi"))
            .with_effect(Effect::reply("one moment"))
            .with_effect(Effect::interrupt("help", Rest::new("help"), Item::unit()));
        let replies = stack.apply(turn).unwrap();
        assert_eq!(replies, vec![Item::message("one moment")]);
        assert_eq!(stack.depth(), 2);

        stack
            .poll(&mut transcript, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(transcript.lines, vec!["help"]);
        assert_eq!(stack.frames()[0].rest.as_deref(), Some("listen"));
    }

    #[tokio::test]
    async fn post_effect_delivers_the_turn_item() {
        let mut transcript = Transcript::default();
        let mut stack = started(&mut transcript).await;

        stack
            .apply(Turn::new(Item::text("passed")).with_effect(Effect::Post))
            .unwrap();
        stack
            .poll(&mut transcript, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(transcript.lines, vec!["root:passed"]);
    }

    #[tokio::test]
    async fn events_posted_by_a_frame_return_to_it() {
        let mut transcript = Transcript::default();
        let mut stack = started(&mut transcript).await;
        let token = CancellationToken::new();

        stack
            .forward("child", Rest::new("announce"), Rest::new("listen"), Item::text("ready"))
            .unwrap();
        assert_eq!(stack.poll(&mut transcript, &token).await.unwrap(), Need::Wait);
        assert_eq!(stack.pending_events(), 1);
        assert_eq!(stack.frames()[0].rest.as_deref(), Some("heard"));

        let event = stack.pull_event().unwrap();
        assert_eq!(event.frame(), 1);
        stack.deliver_event(event).unwrap();
        stack.poll(&mut transcript, &token).await.unwrap();
        assert_eq!(transcript.lines, vec!["heard:\"ready\""]);
        assert_eq!(stack.depth(), 2);
    }

    #[tokio::test]
    async fn reset_effect_clears_the_stack() {
        let mut transcript = Transcript::default();
        let mut stack = started(&mut transcript).await;

        stack
            .apply(Turn::new(Item::text("cancel")).with_effect(Effect::Reset))
            .unwrap();
        assert_eq!(stack.depth(), 0);
        assert_eq!(stack.need(), Need::None);
    }

    #[tokio::test]
    async fn failing_effect_stops_application() {
        let mut transcript = Transcript::default();
        let mut stack = started(&mut transcript).await;

        let turn = Turn::new(Item::number(1.0))
            .with_effect(Effect::forward("child", Rest::new("child"), Rest::new("listen")))
            .with_effect(Effect::reply("never"));
        let error = stack.apply(turn).unwrap_err();
        assert!(matches!(error, FiberError::InvalidType { .. }));
        assert_eq!(stack.depth(), 1);
    }
}
