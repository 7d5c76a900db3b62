//! Configuration types.
//!
//! Everything is read from the environment. `EngineConfig` holds the
//! engine's tuning knobs, `RuntimeConfig` the binary's wiring (paths, keys).

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How often the run loop looks for eligible work.
    pub poll_interval: Duration,
    /// Reasoning steps allowed per decision before giving up.
    pub max_decision_iterations: usize,
    /// Wall-clock budget for one decision.
    pub decision_timeout: Duration,
    /// Facts requested from memory per task.
    pub memory_search_limit: usize,
    /// Most recent comments included in the context.
    pub comment_history_limit: usize,
    /// Pause after a store failure before polling again.
    pub store_backoff: Duration,
    /// Time an in-flight decision gets to finish on shutdown.
    pub shutdown_grace: Duration,
    /// `source` field stamped on emitted events.
    pub event_source: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            max_decision_iterations: 20,
            decision_timeout: Duration::from_secs(300), // 5 minutes
            memory_search_limit: 10,
            comment_history_limit: 50,
            store_backoff: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
            event_source: "ai-tasker".to_string(),
        }
    }
}

impl EngineConfig {
    /// Read configuration from `AI_TASKER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let poll_interval_secs: u64 = parse_positive(&lookup, "AI_TASKER_POLL_INTERVAL_SECS")?
            .unwrap_or(defaults.poll_interval.as_secs());
        let max_decision_iterations: usize =
            parse_positive(&lookup, "AI_TASKER_MAX_DECISION_ITERATIONS")?
                .unwrap_or(defaults.max_decision_iterations);
        let decision_timeout_secs: u64 =
            parse_positive(&lookup, "AI_TASKER_DECISION_TIMEOUT_SECS")?
                .unwrap_or(defaults.decision_timeout.as_secs());

        // Secondary knobs fall back to defaults on bad input.
        let memory_search_limit = lookup("AI_TASKER_MEMORY_SEARCH_LIMIT")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(defaults.memory_search_limit);
        let comment_history_limit = lookup("AI_TASKER_COMMENT_HISTORY_LIMIT")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(defaults.comment_history_limit);
        let store_backoff_secs = lookup("AI_TASKER_STORE_BACKOFF_SECS")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(defaults.store_backoff.as_secs());
        let shutdown_grace_secs = lookup("AI_TASKER_SHUTDOWN_GRACE_SECS")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(defaults.shutdown_grace.as_secs());
        let event_source = lookup("AI_TASKER_EVENT_SOURCE")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.event_source);

        Ok(Self {
            poll_interval: Duration::from_secs(poll_interval_secs),
            max_decision_iterations,
            decision_timeout: Duration::from_secs(decision_timeout_secs),
            memory_search_limit,
            comment_history_limit,
            store_backoff: Duration::from_secs(store_backoff_secs),
            shutdown_grace: Duration::from_secs(shutdown_grace_secs),
            event_source,
        })
    }
}

/// Parse an optional strictly positive number. Unset is `Ok(None)`.
fn parse_positive<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr + PartialEq + Default,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let value: T = raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("'{raw}': {e}"),
    })?;
    if value == T::default() {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(Some(value))
}

/// Process wiring for the binary.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub db_path: PathBuf,
    pub workspace: PathBuf,
    /// Graph-memory service; workspace memory is used when unset.
    pub memory_url: Option<String>,
    /// Group the graph-memory service files our episodes under.
    pub memory_group: String,
    pub api_key: SecretString,
    pub model: String,
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("ANTHROPIC_API_KEY".to_string()))?;
        Ok(Self {
            db_path: Self::db_path_from_env(),
            workspace: Self::workspace_from_env(),
            memory_url: std::env::var("AI_TASKER_MEMORY_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            memory_group: std::env::var("AI_TASKER_MEMORY_GROUP")
                .unwrap_or_else(|_| "ai-tasker".to_string()),
            api_key: SecretString::from(api_key),
            model: std::env::var("AI_TASKER_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
        })
    }

    /// Database location. Operator commands only need this one.
    pub fn db_path_from_env() -> PathBuf {
        std::env::var("AI_TASKER_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/ai-tasker.db"))
    }

    fn workspace_from_env() -> PathBuf {
        std::env::var("AI_TASKER_WORKSPACE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
                PathBuf::from(home).join(".ai-tasker")
            })
    }
}
