//! Pull request data as received from GitHub and as written to the output files.

use chrono::{DateTime, NaiveDate, Utc};
use serde_derive::{Deserialize, Serialize};

const MILLIS_PER_DAY: f64 = 24.0 * 60.0 * 60.0 * 1000.0;

/// A pull request as seen by the search endpoint, before reviews are fetched.
#[derive(Debug, Clone, PartialEq)]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    pub author: String,
    pub state: State,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub closed: Option<DateTime<Utc>>,
    pub merged: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewState {
    Approved,
    ChangesRequested,
    Dismissed,
    Commented,
    Pending,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReviewCounts {
    pub reviews: u32,
    pub approvals: u32,
    pub dismissed: u32,
    pub changes_requested: u32,
}

impl ReviewCounts {
    /// States other than approved, dismissed and changes-requested only count
    /// toward the total.
    pub fn tally<I>(states: I) -> ReviewCounts
    where
        I: IntoIterator<Item = ReviewState>,
    {
        let mut counts = ReviewCounts::default();
        for state in states {
            counts.reviews = counts.reviews.saturating_add(1);
            let slot = match state {
                ReviewState::Approved => &mut counts.approvals,
                ReviewState::Dismissed => &mut counts.dismissed,
                ReviewState::ChangesRequested => &mut counts.changes_requested,
                _ => continue,
            };
            *slot = slot.saturating_add(1);
        }
        counts
    }
}

/// One output row. Field order here is the key order of the JSON objects and
/// the column order of the CSV file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequestRecord {
    pub repo: String,
    pub number: u64,
    pub title: String,
    pub user: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub merged_at: Option<DateTime<Utc>>,
    pub created_at_date: NaiveDate,
    pub updated_at_date: NaiveDate,
    pub closed_at_date: Option<NaiveDate>,
    pub merged_at_date: Option<NaiveDate>,
    pub state: State,
    pub time_to_close: Option<f64>,
    pub time_to_merge: Option<f64>,
    pub merged: bool,
    pub closed: bool,
    pub num_reviews: u32,
    pub num_approvals: u32,
    pub num_dismissed: u32,
    pub num_changes_requested: u32,
}

impl PullRequestRecord {
    pub const FIELDS: [&'static str; 21] = [
        "repo",
        "number",
        "title",
        "user",
        "created_at",
        "updated_at",
        "closed_at",
        "merged_at",
        "created_at_date",
        "updated_at_date",
        "closed_at_date",
        "merged_at_date",
        "state",
        "time_to_close",
        "time_to_merge",
        "merged",
        "closed",
        "num_reviews",
        "num_approvals",
        "num_dismissed",
        "num_changes_requested",
    ];

    pub fn new(repo: &str, pr: PullRequest, reviews: ReviewCounts) -> PullRequestRecord {
        PullRequestRecord {
            repo: repo.to_owned(),
            number: pr.number,
            title: pr.title,
            user: pr.author,
            created_at: pr.created,
            updated_at: pr.updated,
            closed_at: pr.closed,
            merged_at: pr.merged,
            created_at_date: pr.created.date_naive(),
            updated_at_date: pr.updated.date_naive(),
            closed_at_date: pr.closed.map(|t| t.date_naive()),
            merged_at_date: pr.merged.map(|t| t.date_naive()),
            state: pr.state,
            time_to_close: days_between(pr.created, pr.closed),
            time_to_merge: days_between(pr.created, pr.merged),
            merged: pr.merged.is_some(),
            closed: pr.closed.is_some(),
            num_reviews: reviews.reviews,
            num_approvals: reviews.approvals,
            num_dismissed: reviews.dismissed,
            num_changes_requested: reviews.changes_requested,
        }
    }
}

/// Fractional days from `earlier` to `later`, absent when `later` is.
pub fn days_between(earlier: DateTime<Utc>, later: Option<DateTime<Utc>>) -> Option<f64> {
    later.map(|later| (later - earlier).num_milliseconds() as f64 / MILLIS_PER_DAY)
}
