//! Continuations that wrap a child dialog
//!
//! Each adapter is registered under its own tag and called like any other
//! continuation. It pushes the child, waits on its own tag for the result, and
//! decides what to return once the child completes or fails.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::fiber::{Awaited, Continuation, Fault, Fiber, Item, Rest};

type Recover<C> = dyn Fn(&mut C, Fault) -> Result<Item, Fault> + Send + Sync;

/// Captured in the adapter's rest once the child has been called
#[derive(Debug, Serialize, Deserialize)]
struct Attempt {
    child: String,
}

/// Turns child faults into results.
///
/// Faults whose kind is not accepted pass through to the frame below.
pub struct Catch<C> {
    target: String,
    child: Rest,
    kind: Option<String>,
    recover: Box<Recover<C>>,
}

impl<C> Catch<C> {
    pub fn new(
        target: impl Into<String>,
        child: Rest,
        recover: impl Fn(&mut C, Fault) -> Result<Item, Fault> + Send + Sync + 'static,
    ) -> Self {
        Self {
            target: target.into(),
            child,
            kind: None,
            recover: Box::new(recover),
        }
    }

    /// Only recover faults of `kind`
    #[must_use]
    pub fn only(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    fn accepts(&self, fault: &Fault) -> bool {
        match &self.kind {
            Some(kind) => fault.is(kind),
            None => true,
        }
    }
}

/// Return `default` when the child fails
pub fn default_if_fault<C>(target: impl Into<String>, child: Rest, default: Item) -> Catch<C> {
    Catch::new(target, child, move |_context, fault| {
        tracing::debug!(error = %fault, "replacing child fault with default");
        Ok(default.clone())
    })
}

#[async_trait]
impl<C: Send + 'static> Continuation<C> for Catch<C> {
    async fn resume(
        &self,
        fiber: &mut Fiber<C>,
        context: &mut C,
        rest: &Rest,
        item: Awaited,
        _token: &CancellationToken,
    ) -> Result<(), Fault> {
        let Some(attempt) = rest.state_as::<Option<Attempt>>()? else {
            let resume = Rest::with_state(
                rest.tag.clone(),
                &Attempt {
                    child: self.target.clone(),
                },
            )?;
            fiber.call(self.target.clone(), self.child.clone(), item.get()?, Some(resume))?;
            return Ok(());
        };

        let result = match item.get() {
            Ok(result) => result,
            Err(fault) if self.accepts(&fault) => {
                tracing::debug!(frame = %attempt.child, error = %fault, "recovering child fault");
                (self.recover)(context, fault)?
            }
            Err(fault) => return Err(fault),
        };
        fiber.done(result)?;
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Iteration {
    argument: Item,
    count: u64,
}

/// Restarts the child with the same argument every time it completes.
///
/// Never completes itself; a child fault ends the loop and reaches the frame
/// below. The child must wait at least once per run, or the poll never settles.
pub struct Loop {
    target: String,
    child: Rest,
}

impl Loop {
    pub fn new(target: impl Into<String>, child: Rest) -> Self {
        Self {
            target: target.into(),
            child,
        }
    }

    fn restart<C: Send + 'static>(
        &self,
        fiber: &mut Fiber<C>,
        rest: &Rest,
        iteration: &Iteration,
    ) -> Result<(), Fault> {
        let resume = Rest::with_state(rest.tag.clone(), iteration)?;
        fiber.call(
            self.target.clone(),
            self.child.clone(),
            iteration.argument.clone(),
            Some(resume),
        )?;
        Ok(())
    }
}

#[async_trait]
impl<C: Send + 'static> Continuation<C> for Loop {
    async fn resume(
        &self,
        fiber: &mut Fiber<C>,
        _context: &mut C,
        rest: &Rest,
        item: Awaited,
        _token: &CancellationToken,
    ) -> Result<(), Fault> {
        let iteration = match rest.state_as::<Option<Iteration>>()? {
            None => Iteration {
                argument: item.get()?,
                count: 0,
            },
            Some(previous) => {
                item.get()?;
                Iteration {
                    count: previous.count + 1,
                    ..previous
                }
            }
        };
        tracing::debug!(frame = %self.target, count = iteration.count, "starting loop iteration");
        self.restart(fiber, rest, &iteration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::{FiberError, Need, Registry, TypeTag};
    use std::sync::Arc;

    #[derive(Debug, Default)]
    struct Log {
        lines: Vec<String>,
    }

    fn registry() -> Arc<Registry<Log>> {
        let mut registry = Registry::<Log>::new();
        registry
            .register_fn("root", TypeTag::OBJECT, |fiber, _log, rest, _item| {
                let adapter: String = rest.state_as()?;
                fiber.call("guard", Rest::new(adapter), Item::unit(), Some(Rest::new("report")))?;
                Ok(())
            })
            .register_fn("report", TypeTag::OBJECT, |fiber, log, _rest, item| {
                let line = match item.get() {
                    Ok(result) => format!("result:{}", result.as_text().unwrap_or_default()),
                    Err(fault) => format!("fault:{}", fault.message),
                };
                log.lines.push(line);
                fiber.wait(Rest::new("report"))?;
                Ok(())
            })
            .register_fn("risky", TypeTag::OBJECT, |fiber, _log, _rest, _item| {
                fiber.wait(Rest::new("risky.input"))?;
                Ok(())
            })
            .register_fn("risky.input", TypeTag::STRING, |fiber, _log, _rest, item| {
                let text = item.read::<String>()?;
                match text.as_str() {
                    "fail" => return Err(Fault::new("risky", "bad")),
                    "other" => return Err(Fault::new("other", "worse")),
                    _ => fiber.done(Item::text(format!("ok:{text}")))?,
                }
                Ok(())
            })
            .register(
                "safe",
                Catch::new("risky", Rest::new("risky"), |log: &mut Log, fault| {
                    log.lines.push(format!("recovered:{}", fault.message));
                    Ok(Item::text("fallback"))
                })
                .only("risky"),
            )
            .register(
                "defaulted",
                default_if_fault("risky", Rest::new("risky"), Item::text("default")),
            )
            .register("looped", Loop::new("risky", Rest::new("risky")));
        Arc::new(registry)
    }

    async fn poll(fiber: &mut Fiber<Log>, log: &mut Log) -> Result<Need, FiberError> {
        fiber.poll(log, &CancellationToken::new()).await
    }

    /// Root calling `adapter`, with the risky child waiting for input
    async fn guarded(adapter: &str, log: &mut Log) -> Fiber<Log> {
        let mut fiber = Fiber::new(registry());
        fiber
            .call("root", Rest::with_state("root", &adapter).unwrap(), Item::unit(), None)
            .unwrap();
        assert_eq!(poll(&mut fiber, log).await.unwrap(), Need::Wait);
        assert_eq!(fiber.depth(), 3);
        fiber
    }

    async fn answer(fiber: &mut Fiber<Log>, log: &mut Log, text: &str) {
        fiber.post(Item::text(text)).unwrap();
        assert_eq!(poll(fiber, log).await.unwrap(), Need::Wait);
    }

    #[tokio::test]
    async fn catch_passes_results_through() {
        let mut log = Log::default();
        let mut fiber = guarded("safe", &mut log).await;

        answer(&mut fiber, &mut log, "fine").await;
        assert_eq!(log.lines, vec!["result:ok:fine"]);
        assert_eq!(fiber.depth(), 1);
    }

    #[tokio::test]
    async fn catch_recovers_matching_faults() {
        let mut log = Log::default();
        let mut fiber = guarded("safe", &mut log).await;

        answer(&mut fiber, &mut log, "fail").await;
        assert_eq!(log.lines, vec!["recovered:bad", "result:fallback"]);
        assert_eq!(fiber.depth(), 1);
    }

    #[tokio::test]
    async fn catch_lets_other_kinds_through() {
        let mut log = Log::default();
        let mut fiber = guarded("safe", &mut log).await;

        answer(&mut fiber, &mut log, "other").await;
        assert_eq!(log.lines, vec!["fault:worse"]);
    }

    #[tokio::test]
    async fn default_if_fault_replaces_any_fault() {
        let mut log = Log::default();
        let mut fiber = guarded("defaulted", &mut log).await;

        answer(&mut fiber, &mut log, "other").await;
        assert_eq!(log.lines, vec!["result:default"]);
    }

    #[tokio::test]
    async fn loop_restarts_the_child_until_it_fails() {
        let mut log = Log::default();
        let mut fiber = guarded("looped", &mut log).await;

        answer(&mut fiber, &mut log, "one").await;
        answer(&mut fiber, &mut log, "two").await;
        assert!(log.lines.is_empty());
        assert_eq!(fiber.depth(), 3);
        let looped = fiber.frames().nth(1).unwrap();
        assert_eq!(looped.wait().rest().unwrap().state["count"], 2);

        answer(&mut fiber, &mut log, "fail").await;
        assert_eq!(log.lines, vec!["fault:bad"]);
        assert_eq!(fiber.depth(), 1);
    }
}
