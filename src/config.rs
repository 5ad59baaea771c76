//! Configuration
//!
//! Settings come from the environment (a `.env` file is loaded by the binary
//! before this runs) and may be overridden by command-line flags.

use crate::error::{BiError, Result};
use std::time::Duration;

pub const DEFAULT_MAX_ROWS: usize = 1000;
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_RUN_BUDGET_SECS: u64 = 120;
pub const DEFAULT_GENERATOR_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_POOL_SIZE: usize = 4;
pub const DEFAULT_SCHEMA_MAX_TABLES: usize = 100;
pub const DEFAULT_SAMPLE_ROWS: usize = 10;
pub const DEFAULT_SESSION_TURNS: usize = 5;
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Limits the query executor enforces on every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPolicy {
    /// Hard row ceiling; unbounded queries get this as their synthesized cap
    pub max_rows: usize,
    /// Wall-clock limit for a single query
    pub query_timeout: Duration,
    /// How long to wait for an interrupted query to hand its connection back
    pub cancel_grace: Duration,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            max_rows: DEFAULT_MAX_ROWS,
            query_timeout: Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS),
            cancel_grace: Duration::from_secs(2),
        }
    }
}

/// OpenAI-compatible generator settings
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(DEFAULT_GENERATOR_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub pool_size: usize,
    pub execution: ExecutionPolicy,
    pub generator: GeneratorConfig,
    /// Overall wall-clock budget for one pipeline run; `None` disables it
    pub run_budget: Option<Duration>,
    pub schema_max_tables: usize,
    pub sample_rows: usize,
    pub session_turns: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            pool_size: DEFAULT_POOL_SIZE,
            execution: ExecutionPolicy::default(),
            generator: GeneratorConfig::default(),
            run_budget: Some(Duration::from_secs(DEFAULT_RUN_BUDGET_SECS)),
            schema_max_tables: DEFAULT_SCHEMA_MAX_TABLES,
            sample_rows: DEFAULT_SAMPLE_ROWS,
            session_turns: DEFAULT_SESSION_TURNS,
        }
    }
}

impl AppConfig {
    /// Read configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup (used by `from_env` and tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        config.database_url = non_empty(lookup("BI_DATABASE_URL"));
        config.generator.api_key = non_empty(lookup("OPENAI_API_KEY"));
        if let Some(model) = non_empty(lookup("OPENAI_MODEL")) {
            config.generator.model = model;
        }
        if let Some(base_url) = non_empty(lookup("OPENAI_BASE_URL")) {
            config.generator.base_url = base_url.trim_end_matches('/').to_string();
        }

        if let Some(max_rows) = parse_var::<usize>(&lookup, "BI_MAX_ROWS")? {
            if max_rows == 0 {
                return Err(BiError::Config("BI_MAX_ROWS must be at least 1".to_string()));
            }
            config.execution.max_rows = max_rows;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "BI_QUERY_TIMEOUT_SECS")? {
            if secs == 0 {
                return Err(BiError::Config("BI_QUERY_TIMEOUT_SECS must be at least 1".to_string()));
            }
            config.execution.query_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "BI_RUN_BUDGET_SECS")? {
            config.run_budget = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "BI_GENERATOR_TIMEOUT_SECS")? {
            config.generator.timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(size) = parse_var::<usize>(&lookup, "BI_POOL_SIZE")? {
            config.pool_size = size.max(1);
        }
        if let Some(tables) = parse_var::<usize>(&lookup, "BI_SCHEMA_MAX_TABLES")? {
            config.schema_max_tables = tables.max(1);
        }
        if let Some(rows) = parse_var::<usize>(&lookup, "BI_SAMPLE_ROWS")? {
            config.sample_rows = rows;
        }
        if let Some(turns) = parse_var::<usize>(&lookup, "BI_SESSION_TURNS")? {
            config.session_turns = turns;
        }

        Ok(config)
    }

    /// Database URL, or a configuration error naming the variable to set.
    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .ok_or_else(|| BiError::Config("database URL not configured (set BI_DATABASE_URL or pass --database-url)".to_string()))
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty(lookup(key)) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| BiError::Config(format!("{} has invalid value '{}': {}", key, raw, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_environment_is_empty() {
        let config = AppConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.execution.max_rows, 1000);
        assert_eq!(config.execution.query_timeout, Duration::from_secs(30));
        assert_eq!(config.generator.model, DEFAULT_MODEL);
        assert!(config.database_url.is_none());
        assert!(config.require_database_url().is_err());
    }

    #[test]
    fn test_reads_overrides() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("BI_DATABASE_URL", "sqlite://sales.db"),
            ("BI_MAX_ROWS", "250"),
            ("BI_RUN_BUDGET_SECS", "0"),
            ("OPENAI_BASE_URL", "http://localhost:8080/v1/"),
        ]))
        .unwrap();
        assert_eq!(config.require_database_url().unwrap(), "sqlite://sales.db");
        assert_eq!(config.execution.max_rows, 250);
        assert!(config.run_budget.is_none());
        assert_eq!(config.generator.base_url, "http://localhost:8080/v1");
    }

    #[test]
    fn test_rejects_garbage_numbers() {
        let err = AppConfig::from_lookup(lookup_from(&[("BI_MAX_ROWS", "lots")])).unwrap_err();
        assert!(err.to_string().contains("BI_MAX_ROWS"));
        assert!(AppConfig::from_lookup(lookup_from(&[("BI_MAX_ROWS", "0")])).is_err());
    }
}
