//! Walks an organization's repositories and builds one record per pull request.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::data::{PullRequestRecord, ReviewCounts};
use crate::github::{Client, Clock, Transport};
use crate::{GhpError, Result};

/// The outcome of collecting an organization.
#[derive(Debug, Default)]
pub struct Summary {
    /// In repository order, then search order within each repository.
    pub records: Vec<PullRequestRecord>,
    /// Repositories skipped because collecting them failed. Only ever
    /// non-empty when failures are isolated.
    pub failed: Vec<(String, GhpError)>,
}

/// Every pull request in `owner/name` updated after `since`, with review counts.
pub fn repo_pulls<T: Transport, C: Clock>(
    client: &Client<T, C>,
    owner: &str,
    name: &str,
    since: DateTime<Utc>,
) -> Result<Vec<PullRequestRecord>> {
    let repo = format!("{}/{}", owner, name);
    let pulls = client
        .search_pulls(owner, name, since)?
        .collect::<Result<Vec<_>>>()?;

    let mut records = Vec::with_capacity(pulls.len());
    for pr in pulls {
        debug!("fetching reviews for {}#{}", repo, pr.number);
        let reviews = ReviewCounts::tally(client.review_states(owner, name, pr.number)?);
        records.push(PullRequestRecord::new(&repo, pr, reviews));
    }
    Ok(records)
}

/// Collect every repository of `org`.
///
/// By default the first failure aborts the whole collection. With
/// `keep_going`, a repository which fails is logged and recorded in
/// [`Summary::failed`] and contributes no records; failing to list the
/// repositories themselves is still fatal.
pub fn org_pulls<T: Transport, C: Clock>(
    client: &Client<T, C>,
    org: &str,
    since: DateTime<Utc>,
    active_since: Option<DateTime<Utc>>,
    keep_going: bool,
) -> Result<Summary> {
    let mut summary = Summary::default();
    for repo in client.org_repos(org, active_since)? {
        let repo = repo?;
        info!("Getting pull requests for {}", repo.name);
        match repo_pulls(client, &repo.owner.login, &repo.name, since) {
            Ok(records) => summary.records.extend(records),
            Err(e) if keep_going => {
                warn!("skipping {}: {}", repo.name, e);
                summary.failed.push((repo.name, e));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(summary)
}
