//! Engine configuration loaded from the environment

use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown resume policy: {0}")]
    UnknownResumePolicy(String),
    #[error("unknown concurrency policy: {0}")]
    UnknownConcurrencyPolicy(String),
}

/// What happens when a continuation returns without registering a resume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResumePolicy {
    /// Fail the turn with `NoResumeHandler`
    #[default]
    Strict,
    /// Fall back to the frame's last explicit wait, if it has one
    RememberLastWait,
}

impl FromStr for ResumePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "remember_last_wait" | "remember-last-wait" => Ok(Self::RememberLastWait),
            other => Err(ConfigError::UnknownResumePolicy(other.to_string())),
        }
    }
}

/// How stack saves treat a version that moved since the stack was loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyPolicy {
    /// Reject stale saves with a precondition failure
    #[default]
    Optimistic,
    /// Overwrite whatever is stored
    LastWriterWins,
}

impl FromStr for ConcurrencyPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "optimistic" => Ok(Self::Optimistic),
            "last_writer_wins" | "last-writer-wins" => Ok(Self::LastWriterWins),
            other => Err(ConfigError::UnknownConcurrencyPolicy(other.to_string())),
        }
    }
}

/// Configuration for the task manager and its fibers
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub resume_policy: ResumePolicy,
    pub concurrency: ConcurrencyPolicy,
    /// SQLite file for the stack store; in-memory storage when unset
    pub db_path: Option<PathBuf>,
    /// Stack used for turns that do not name one
    pub default_stack: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            resume_policy: ResumePolicy::default(),
            concurrency: ConcurrencyPolicy::default(),
            db_path: None,
            default_stack: "main".to_string(),
        }
    }
}

impl EngineConfig {
    pub const RESUME_POLICY_VAR: &'static str = "DIALOG_FIBER_RESUME_POLICY";
    pub const CONCURRENCY_VAR: &'static str = "DIALOG_FIBER_CONCURRENCY";
    pub const DB_PATH_VAR: &'static str = "DIALOG_FIBER_DB_PATH";
    pub const DEFAULT_STACK_VAR: &'static str = "DIALOG_FIBER_DEFAULT_STACK";

    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Invalid values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            resume_policy: parse_or(lookup(Self::RESUME_POLICY_VAR), defaults.resume_policy),
            concurrency: parse_or(lookup(Self::CONCURRENCY_VAR), defaults.concurrency),
            db_path: lookup(Self::DB_PATH_VAR)
                .filter(|path| !path.is_empty())
                .map(PathBuf::from),
            default_stack: lookup(Self::DEFAULT_STACK_VAR)
                .filter(|name| !name.is_empty())
                .unwrap_or(defaults.default_stack),
        }
    }
}

fn parse_or<T>(value: Option<String>, default: T) -> T
where
    T: FromStr<Err = ConfigError>,
{
    match value.map(|v| v.parse::<T>()) {
        Some(Ok(parsed)) => parsed,
        Some(Err(error)) => {
            tracing::warn!(%error, "ignoring invalid configuration value");
            default
        }
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        assert_eq!(EngineConfig::from_lookup(|_| None), EngineConfig::default());
    }

    #[test]
    fn reads_every_variable() {
        let config = EngineConfig::from_lookup(lookup(&[
            (EngineConfig::RESUME_POLICY_VAR, "remember_last_wait"),
            (EngineConfig::CONCURRENCY_VAR, "Last-Writer-Wins"),
            (EngineConfig::DB_PATH_VAR, "/tmp/stacks.db"),
            (EngineConfig::DEFAULT_STACK_VAR, "support"),
        ]));

        assert_eq!(config.resume_policy, ResumePolicy::RememberLastWait);
        assert_eq!(config.concurrency, ConcurrencyPolicy::LastWriterWins);
        assert_eq!(config.db_path, Some(PathBuf::from("/tmp/stacks.db")));
        assert_eq!(config.default_stack, "support");
    }

    #[test]
    fn invalid_values_fall_back() {
        let config = EngineConfig::from_lookup(lookup(&[
            (EngineConfig::RESUME_POLICY_VAR, "lenient"),
            (EngineConfig::DB_PATH_VAR, ""),
        ]));

        assert_eq!(config.resume_policy, ResumePolicy::Strict);
        assert_eq!(config.db_path, None);
        assert_eq!(
            "lenient".parse::<ResumePolicy>(),
            Err(ConfigError::UnknownResumePolicy("lenient".into()))
        );
    }
}
