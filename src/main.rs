//! Dialog fiber console
//!
//! Reads lines from stdin and runs each one as a turn on the default stack of
//! a single conversation. Set `DIALOG_FIBER_DB_PATH` to keep dialogs across
//! restarts.

use dialog_fiber::config::EngineConfig;
use dialog_fiber::dialog::{Effect, Turn};
use dialog_fiber::fiber::{Item, Registry, Rest, TypeTag};
use dialog_fiber::scorable::RegexScorable;
use dialog_fiber::store::{InMemoryStore, SqliteStore, StackStore};
use dialog_fiber::task::TaskManager;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const ADDRESS: &str = "console";

/// Host state callbacks write their output into
#[derive(Debug, Default)]
struct Console {
    outbox: Vec<String>,
    turns: u64,
}

fn registry() -> Registry<Console> {
    let mut registry = Registry::<Console>::new();
    registry
        .register_fn("greet", TypeTag::OBJECT, |fiber, console, _rest, _item| {
            console
                .outbox
                .push("Hi! I echo what you say. Try 'survey', 'help' or 'reset'.".into());
            fiber.wait(Rest::new("echo"))?;
            Ok(())
        })
        .register_fn("echo", TypeTag::MESSAGE, |fiber, console, _rest, item| {
            let item = item.get()?;
            console.turns += 1;
            console.outbox.push(format!(
                "#{}: {}",
                console.turns,
                item.as_text().unwrap_or_default()
            ));
            fiber.wait(Rest::new("echo"))?;
            Ok(())
        })
        .register_fn("survey.start", TypeTag::OBJECT, |fiber, console, _rest, _item| {
            console.outbox.push("What's your name?".into());
            fiber.wait(Rest::new("survey.name"))?;
            Ok(())
        })
        .register_fn("survey.name", TypeTag::MESSAGE, |fiber, console, _rest, item| {
            let item = item.get()?;
            let name = item.as_text().unwrap_or_default().trim().to_string();
            console.outbox.push(format!("Nice to meet you, {name}. Favourite colour?"));
            fiber.wait(Rest::with_state("survey.colour", &name)?)?;
            Ok(())
        })
        .register_fn("survey.colour", TypeTag::MESSAGE, |fiber, console, rest, item| {
            let item = item.get()?;
            let name: String = rest.state_as()?;
            let colour = item.as_text().unwrap_or_default().trim();
            console
                .outbox
                .push(format!("Thanks {name}, noted {colour}. Back to echoing."));
            fiber.done(Item::text(colour))?;
            Ok(())
        });
    registry
}

fn scorables() -> Result<Vec<RegexScorable>, regex::Error> {
    Ok(vec![
        RegexScorable::new(r"(?i)^help$", |turn: &mut Turn, _matched| {
            turn.push(Effect::reply(
                "'survey' starts a short survey, 'reset' clears the dialog.",
            ));
            Ok(())
        })?,
        RegexScorable::new(r"(?i)^survey$", |turn: &mut Turn, _matched| {
            turn.push(Effect::interrupt(
                "survey",
                Rest::new("survey.start"),
                Item::unit(),
            ));
            Ok(())
        })?,
        RegexScorable::new(r"(?i)^reset$", |turn: &mut Turn, _matched| {
            turn.push(Effect::Reset);
            turn.push(Effect::reply("Dialog cleared."));
            Ok(())
        })?,
    ])
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dialog_fiber=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config = EngineConfig::from_env();
    let store: Arc<dyn StackStore> = match &config.db_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            tracing::info!(path = %path.display(), "Opening stack store");
            Arc::new(SqliteStore::open(path)?)
        }
        None => {
            tracing::info!("Using in-memory stack store");
            Arc::new(InMemoryStore::new())
        }
    };

    let mut manager = TaskManager::new(ADDRESS, Arc::new(registry()), store, config)
        .with_root("echo", Rest::new("greet"));
    for scorable in scorables()? {
        manager = manager.with_scorable(scorable);
    }

    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.cancel();
        }
    });

    let mut console = Console::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            () = token.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match manager
            .post_default(Item::message(line), &mut console, &token)
            .await
        {
            Ok(report) => {
                for reply in &report.replies {
                    println!("{}", reply.as_text().unwrap_or_default());
                }
            }
            Err(error) => tracing::warn!(%error, "turn failed"),
        }
        for message in console.outbox.drain(..) {
            println!("{message}");
        }
    }

    tracing::info!("Shutting down");
    Ok(())
}
