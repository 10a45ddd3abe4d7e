use chrono::{DateTime, NaiveDate, Utc};
use std::path::PathBuf;
use std::time::Duration;

use crate::{GhpError, Result};

pub(crate) const USER_AGENT: &str = "gh-pulls";
pub(crate) const API_URL: &str = "https://api.github.com";
pub(crate) const API_VERSION: &str = "2022-11-28";
pub(crate) const TOKEN_VAR: &str = "GITHUB_TOKEN";
pub(crate) const ORG: &str = "dapr";
pub(crate) const SINCE: &str = "2024-01-01";
pub(crate) const DATA_DIR: &str = "data";
/// Maximum page size GitHub allows on the endpoints we use.
pub(crate) const PER_PAGE: u32 = 100;
/// Wait before the first retry of a secondary rate limit with no `retry-after`.
pub(crate) const BACKOFF_BASE: Duration = Duration::from_secs(60);

/// Everything a run needs, resolved from the command line.
#[derive(Debug, Clone)]
pub struct Config {
    pub org: String,
    pub since: DateTime<Utc>,
    pub token: Option<String>,
    pub out_dir: PathBuf,
    pub api_url: String,
    pub retry: RetryPolicy,
    pub skip_inactive_repos: bool,
    pub keep_going: bool,
}

/// How the client reacts to rate-limit responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// `None` retries forever.
    pub max_retries: Option<u32>,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> RetryPolicy {
        RetryPolicy {
            max_retries: None,
            backoff_base: BACKOFF_BASE,
        }
    }
}

impl RetryPolicy {
    pub fn allows(&self, retries: u32) -> bool {
        self.max_retries.map_or(true, |max| retries < max)
    }

    /// Exponential backoff, used when the server gives no hint.
    pub fn backoff(&self, retries: u32) -> Duration {
        self.backoff_base
            .checked_mul(1u32 << retries.min(6))
            .unwrap_or(self.backoff_base)
    }
}

/// Accepts either a plain date (midnight UTC) or a full RFC 3339 timestamp.
pub fn parse_since(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| GhpError::InvalidSince(s.to_owned()))
}
