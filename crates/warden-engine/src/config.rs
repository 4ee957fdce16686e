//! Engine configuration from the environment.
//!
//! All variables are prefixed `WARDEN_`. The scope roster is JSON,
//! supplied inline (`WARDEN_SCOPES`) or by file path
//! (`WARDEN_SCOPES_FILE`); everything else has a default.
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `WARDEN_SCOPES` | - | Inline JSON array of scope configs |
//! | `WARDEN_SCOPES_FILE` | - | Path to a JSON file with the same array |
//! | `WARDEN_ROTATION_WINDOW_SECS` | `86400` | Unconfirmed-rotation validity window |
//! | `WARDEN_JOB_POLL_INTERVAL_MS` | `2000` | Delay between run-status polls |
//! | `WARDEN_JOB_POLL_TIMEOUT_SECS` | `600` | Wait budget for a run to settle |
//! | `WARDEN_RETRY_BASE_DELAY_MS` | `100` | First retry backoff delay |
//! | `WARDEN_RETRY_MAX_DELAY_MS` | `5000` | Backoff delay cap |
//! | `WARDEN_RETRY_MAX_ATTEMPTS` | `5` | Attempts per external call |
//! | `WARDEN_LOG_FORMAT` | `pretty` | `json` or `pretty` |

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use warden_core::observability::LogFormat;
use warden_core::{AssetRef, PolicyRef, Scope, ScopeId};

use crate::error::{Error, Result};
use crate::job::JobSettings;
use crate::retry::RetryConfig;

/// One scope the provisioner converges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeConfig {
    /// The scope identifier.
    pub scope_id: ScopeId,
    /// Human-readable name; falls back to the scope id when omitted.
    #[serde(default)]
    pub display_name: String,
    /// Column-masking policy to attach.
    pub masking_policy_ref: PolicyRef,
    /// Row-filter policy to attach.
    pub row_filter_ref: PolicyRef,
    /// The executable export asset for this scope.
    pub asset_ref: AssetRef,
    /// Parameters passed to the asset on every run (e.g. catalog, schema).
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl ScopeConfig {
    /// Returns the domain scope this config describes.
    #[must_use]
    pub fn to_scope(&self) -> Scope {
        let display_name = if self.display_name.is_empty() {
            self.scope_id.to_string()
        } else {
            self.display_name.clone()
        };
        Scope::new(
            self.scope_id.clone(),
            display_name,
            self.masking_policy_ref.clone(),
            self.row_filter_ref.clone(),
        )
    }

    /// Returns the job settings for this scope's export job.
    #[must_use]
    pub fn job_settings(&self) -> JobSettings {
        JobSettings::with_parameters(self.parameters.clone())
    }
}

/// Full engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// The scopes to converge.
    pub scopes: Vec<ScopeConfig>,
    /// How long an unconfirmed rotation stays valid.
    pub rotation_window_secs: i64,
    /// Delay between run-status polls.
    pub poll_interval: Duration,
    /// Wait budget for a run to settle.
    pub poll_timeout: Duration,
    /// Retry policy for external calls.
    pub retry: RetryConfig,
    /// Log output format.
    pub log_format: LogFormat,
}

impl EngineConfig {
    /// Loads configuration from process environment variables.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for malformed values or a missing scope
    /// roster.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for malformed values or a missing scope
    /// roster.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let scopes_json = match (lookup("WARDEN_SCOPES"), lookup("WARDEN_SCOPES_FILE")) {
            (Some(inline), _) => inline,
            (None, Some(path)) => std::fs::read_to_string(&path).map_err(|err| {
                Error::configuration(format!("cannot read WARDEN_SCOPES_FILE {path}: {err}"))
            })?,
            (None, None) => {
                return Err(Error::configuration(
                    "either WARDEN_SCOPES or WARDEN_SCOPES_FILE must be set",
                ));
            }
        };
        let scopes: Vec<ScopeConfig> = serde_json::from_str(&scopes_json)
            .map_err(|err| Error::configuration(format!("malformed scope roster: {err}")))?;

        let config = Self {
            scopes,
            rotation_window_secs: parse_or(&lookup, "WARDEN_ROTATION_WINDOW_SECS", 86_400)?,
            poll_interval: Duration::from_millis(parse_or(
                &lookup,
                "WARDEN_JOB_POLL_INTERVAL_MS",
                2_000,
            )?),
            poll_timeout: Duration::from_secs(parse_or(
                &lookup,
                "WARDEN_JOB_POLL_TIMEOUT_SECS",
                600,
            )?),
            retry: RetryConfig {
                base_delay: Duration::from_millis(parse_or(
                    &lookup,
                    "WARDEN_RETRY_BASE_DELAY_MS",
                    100,
                )?),
                max_delay: Duration::from_millis(parse_or(
                    &lookup,
                    "WARDEN_RETRY_MAX_DELAY_MS",
                    5_000,
                )?),
                max_attempts: parse_or(&lookup, "WARDEN_RETRY_MAX_ATTEMPTS", 5)?,
            },
            log_format: parse_log_format(lookup("WARDEN_LOG_FORMAT").as_deref())?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field invariants.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for an empty roster, duplicate scope ids,
    /// a scope without an asset, a non-positive rotation window, a zero
    /// retry budget, or a poll interval that is zero or not smaller than
    /// the poll timeout.
    pub fn validate(&self) -> Result<()> {
        if self.scopes.is_empty() {
            return Err(Error::configuration("scope roster is empty"));
        }
        let mut seen = std::collections::BTreeSet::new();
        for scope in &self.scopes {
            if !seen.insert(scope.scope_id.clone()) {
                return Err(Error::configuration(format!(
                    "duplicate scope id '{}' in roster",
                    scope.scope_id
                )));
            }
            if scope.asset_ref.as_str().is_empty() {
                return Err(Error::configuration(format!(
                    "scope '{}' names no asset",
                    scope.scope_id
                )));
            }
        }
        if self.poll_interval.is_zero() || self.poll_interval >= self.poll_timeout {
            return Err(Error::configuration(
                "WARDEN_JOB_POLL_INTERVAL_MS must be nonzero and smaller than WARDEN_JOB_POLL_TIMEOUT_SECS",
            ));
        }
        if self.rotation_window_secs <= 0 {
            return Err(Error::configuration(
                "WARDEN_ROTATION_WINDOW_SECS must be positive",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::configuration(
                "WARDEN_RETRY_MAX_ATTEMPTS must be at least 1",
            ));
        }
        Ok(())
    }
}

fn parse_or<T, F>(lookup: &F, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => raw
            .parse()
            .map_err(|err| Error::configuration(format!("invalid {name} '{raw}': {err}"))),
        None => Ok(default),
    }
}

fn parse_log_format(raw: Option<&str>) -> Result<LogFormat> {
    match raw {
        None | Some("pretty") => Ok(LogFormat::Pretty),
        Some("json") => Ok(LogFormat::Json),
        Some(other) => Err(Error::configuration(format!(
            "invalid WARDEN_LOG_FORMAT '{other}': expected 'json' or 'pretty'"
        ))),
    }
}
