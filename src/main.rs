use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, RetryPolicy};
use crate::github::{Client, Clock, SystemClock, Transport, UreqTransport};

mod collect;
mod config;
mod data;
mod export;
mod github;

/// Fetch pull request and review statistics for every repository in a
/// GitHub organization and write them to JSON and CSV.
#[derive(Parser, Debug)]
#[command(name = "gh-pulls", version)]
struct Cli {
    /// Organization to collect
    #[arg(long, default_value = config::ORG)]
    org: String,
    /// Only pull requests updated after this date or RFC 3339 timestamp
    #[arg(long, default_value = config::SINCE)]
    since: String,
    /// GitHub access token; requests are unauthenticated without one
    #[arg(long, env = config::TOKEN_VAR, hide_env_values = true)]
    token: Option<String>,
    /// Directory the output files are written to
    #[arg(long, default_value = config::DATA_DIR)]
    out_dir: PathBuf,
    #[arg(long, default_value = config::API_URL)]
    api_url: String,
    /// Give up after this many rate-limit retries of a single request
    #[arg(long)]
    max_retries: Option<u32>,
    /// Skip repositories with no activity since `--since`
    #[arg(long)]
    skip_inactive_repos: bool,
    /// Keep collecting other repositories when one fails
    #[arg(long)]
    keep_going: bool,
}

impl Cli {
    fn into_config(self) -> Result<Config> {
        Ok(Config {
            org: self.org,
            since: config::parse_since(&self.since)?,
            token: self.token,
            out_dir: self.out_dir,
            api_url: self.api_url,
            retry: RetryPolicy {
                max_retries: self.max_retries,
                ..RetryPolicy::default()
            },
            skip_inactive_repos: self.skip_inactive_repos,
            keep_going: self.keep_going,
        })
    }
}

#[derive(Debug, Error)]
pub enum GhpError {
    #[error("GitHub API error {status} for {url}: {message}")]
    Api {
        status: u16,
        url: String,
        message: String,
    },
    #[error("gave up on {url} after {attempts} rate-limited attempts")]
    RateLimited { url: String, attempts: u32 },
    #[error("HTTP request failed")]
    Http(#[source] Box<ureq::Error>),
    #[error("invalid URL")]
    Url(#[from] url::ParseError),
    #[error("malformed JSON")]
    Json(#[from] serde_json::Error),
    #[error("failed to write CSV")]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid date `{0}`, expected YYYY-MM-DD or an RFC 3339 timestamp")]
    InvalidSince(String),
    #[error("failed to collect {}", .failed.join(", "))]
    Partial { failed: Vec<String> },
}

type Result<T> = ::std::result::Result<T, GhpError>;

/// Collect and write everything. With `keep_going`, whatever was collected is
/// written before failures are reported.
fn run<T: Transport, C: Clock>(client: &Client<T, C>, config: &Config) -> Result<()> {
    let active_since = if config.skip_inactive_repos {
        Some(config.since)
    } else {
        None
    };
    let summary = collect::org_pulls(
        client,
        &config.org,
        config.since,
        active_since,
        config.keep_going,
    )?;

    info!(
        "writing {} pull requests to {}",
        summary.records.len(),
        config.out_dir.display()
    );
    export::write_all(&config.out_dir, &config.org, &summary.records)?;

    if summary.failed.is_empty() {
        Ok(())
    } else {
        Err(GhpError::Partial {
            failed: summary.failed.into_iter().map(|(name, _)| name).collect(),
        })
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let result = Cli::parse().into_config().and_then(|config| {
        let transport = UreqTransport::new(config.token.clone());
        let client = Client::new(transport, SystemClock, config.retry, &config.api_url)?;
        run(&client, &config)
    });

    match result {
        Ok(()) => {
            println!("Done!");
            ExitCode::SUCCESS
        }
        Err(e) => {
            let mut message = e.to_string();
            let mut source = std::error::Error::source(&e);
            while let Some(cause) = source {
                message.push_str(&format!(": {}", cause));
                source = cause.source();
            }
            error!("{}", message);
            ExitCode::FAILURE
        }
    }
}
