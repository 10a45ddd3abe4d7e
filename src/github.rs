//! Talking to the GitHub REST API.
//!
//! Requests go through a [`Transport`] so that tests can substitute canned
//! responses, and rate limiting is handled by [`Client`] according to an
//! explicit [`RetryPolicy`].

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_derive::Deserialize;
use std::fmt::{self, Debug, Formatter};
use std::marker::PhantomData;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::config::{RetryPolicy, API_VERSION, PER_PAGE, USER_AGENT};
use crate::data::{self, ReviewState, State};
use crate::{GhpError, Result};

/// A response with the bits of HTTP we care about.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub status: u16,
    /// Header names are stored lowercase.
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| &**v)
    }

    fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Something which can perform a GET request. Non-2xx statuses are returned
/// as responses, only connection-level failures are errors.
pub trait Transport {
    fn get(&self, url: &str) -> Result<Response>;
}

pub struct UreqTransport {
    agent: ureq::Agent,
    token: Option<Redacted<String>>,
}

impl UreqTransport {
    pub fn new(token: Option<String>) -> UreqTransport {
        UreqTransport {
            agent: ureq::AgentBuilder::new().user_agent(USER_AGENT).build(),
            token: token.map(Redacted),
        }
    }
}

impl Transport for UreqTransport {
    fn get(&self, url: &str) -> Result<Response> {
        let mut request = self
            .agent
            .get(url)
            .set("Accept", "application/vnd.github+json")
            .set("X-GitHub-Api-Version", API_VERSION);
        if let Some(token) = &self.token {
            request = request.set("Authorization", &format!("Bearer {}", token.0));
        }

        let response = match request.call() {
            Ok(response) => response,
            Err(ureq::Error::Status(_, response)) => response,
            Err(e) => return Err(GhpError::Http(Box::new(e))),
        };

        let status = response.status();
        let headers = response
            .headers_names()
            .into_iter()
            .filter_map(|name| {
                let value = response.header(&name)?.to_owned();
                Some((name.to_ascii_lowercase(), value))
            })
            .collect();
        let body = response.into_string()?;
        Ok(Response {
            status,
            headers,
            body,
        })
    }
}

/// Keeps the token out of debug output.
struct Redacted<T>(T);

impl<T> Debug for Redacted<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "<redacted>")
    }
}

pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
    fn sleep(&self, duration: Duration);
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RateLimit {
    Primary,
    Secondary,
}

pub struct Client<T, C> {
    transport: T,
    clock: C,
    retry: RetryPolicy,
    base: Url,
}

impl<T: Transport, C: Clock> Client<T, C> {
    pub fn new(transport: T, clock: C, retry: RetryPolicy, api_url: &str) -> Result<Client<T, C>> {
        // A trailing slash makes `Url::join` append instead of replacing the last segment.
        let base = if api_url.ends_with('/') {
            Url::parse(api_url)
        } else {
            Url::parse(&format!("{}/", api_url))
        };
        Ok(Client {
            transport,
            clock,
            retry,
            base: base?,
        })
    }

    /// GET `url`, waiting out any rate limits the policy allows.
    pub fn get(&self, url: &str) -> Result<Response> {
        let mut retries = 0;
        loop {
            let response = self.transport.get(url)?;
            if response.is_success() {
                return Ok(response);
            }

            let limit = match rate_limit(&response) {
                Some(limit) => limit,
                None => return Err(api_error(url, &response)),
            };
            match limit {
                RateLimit::Primary => {
                    warn!("Request quota exhausted for request GET {}", url)
                }
                RateLimit::Secondary => {
                    warn!("Secondary request quota exhausted for request GET {}", url)
                }
            }
            if !self.retry.allows(retries) {
                return Err(GhpError::RateLimited {
                    url: url.to_owned(),
                    attempts: retries + 1,
                });
            }
            let wait = self.retry_after(limit, &response, retries);
            debug!("retrying in {}s", wait.as_secs());
            self.clock.sleep(wait);
            retries += 1;
        }
    }

    fn retry_after(&self, limit: RateLimit, response: &Response, retries: u32) -> Duration {
        if let Some(secs) = header_u64(response, "retry-after") {
            return Duration::from_secs(secs);
        }
        if limit == RateLimit::Primary {
            if let Some(reset) = header_u64(response, "x-ratelimit-reset") {
                let now = u64::try_from(self.clock.now().timestamp()).unwrap_or(0);
                return Duration::from_secs(reset.saturating_sub(now).max(1));
            }
        }
        self.retry.backoff(retries)
    }

    fn endpoint(&self, path: &str, query: &[(&str, &str)]) -> Result<Url> {
        let mut url = self.base.join(path)?;
        url.query_pairs_mut()
            .extend_pairs(query)
            .append_pair("per_page", &PER_PAGE.to_string());
        Ok(url)
    }

    /// Repositories of `org`, in API order. With `since`, repositories with no
    /// activity after that instant are skipped.
    pub fn org_repos<'a>(
        &'a self,
        org: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<impl Iterator<Item = Result<Repository>> + 'a> {
        let url = self.endpoint(&format!("orgs/{}/repos", org), &[])?;
        let repos = Pages::<_, _, Vec<Repository>>::new(self, url).flat_items();
        Ok(repos.filter(move |repo| match (repo, since) {
            (Ok(repo), Some(since)) => repo.last_activity() > since,
            _ => true,
        }))
    }

    /// Pull requests in `owner/name` updated after `since`, via the issue
    /// search endpoint. The pulls endpoint can't filter on update time.
    pub fn search_pulls<'a>(
        &'a self,
        owner: &str,
        name: &str,
        since: DateTime<Utc>,
    ) -> Result<impl Iterator<Item = Result<data::PullRequest>> + 'a> {
        let query = search_query(owner, name, since);
        let url = self.endpoint("search/issues", &[("q", query.as_str())])?;
        Ok(Pages::<_, _, SearchResults<SearchIssue>>::new(self, url)
            .flat_items()
            .map(|issue| issue.map(data::PullRequest::from)))
    }

    pub fn review_states(&self, owner: &str, name: &str, number: u64) -> Result<Vec<ReviewState>> {
        let url = self.endpoint(&format!("repos/{}/{}/pulls/{}/reviews", owner, name, number), &[])?;
        Pages::<_, _, Vec<Review>>::new(self, url)
            .flat_items()
            .map(|review| review.map(|r| r.state))
            .collect()
    }
}

fn search_query(owner: &str, name: &str, since: DateTime<Utc>) -> String {
    format!(
        "repo:{}/{} is:pr updated:>{}",
        owner,
        name,
        since.format("%Y-%m-%dT%H:%M:%SZ")
    )
}

fn rate_limit(response: &Response) -> Option<RateLimit> {
    if response.status != 403 && response.status != 429 {
        return None;
    }
    if response.header("x-ratelimit-remaining") == Some("0") {
        return Some(RateLimit::Primary);
    }
    if response.header("retry-after").is_some()
        || response.body.to_ascii_lowercase().contains("secondary rate limit")
    {
        return Some(RateLimit::Secondary);
    }
    None
}

fn header_u64(response: &Response, name: &str) -> Option<u64> {
    response.header(name)?.trim().parse().ok()
}

fn api_error(url: &str, response: &Response) -> GhpError {
    #[derive(Deserialize)]
    struct Message {
        message: String,
    }
    let message = serde_json::from_str::<Message>(&response.body)
        .map(|m| m.message)
        .unwrap_or_else(|_| response.body.clone());
    GhpError::Api {
        status: response.status,
        url: url.to_owned(),
        message,
    }
}

/// The `rel="next"` target of a `Link` header, if any.
fn next_link(link: &str) -> Option<String> {
    link.split(',').find_map(|part| {
        let mut pieces = part.split(';');
        let target = pieces.next()?.trim();
        let is_next = pieces.any(|p| p.trim() == r#"rel="next""#);
        if is_next && target.starts_with('<') && target.ends_with('>') {
            Some(target[1..target.len() - 1].to_owned())
        } else {
            None
        }
    })
}

/// A response body holding one page of items.
pub trait Page: DeserializeOwned {
    type Item;
    fn into_items(self) -> Vec<Self::Item>;
}

impl<T: DeserializeOwned> Page for Vec<T> {
    type Item = T;
    fn into_items(self) -> Vec<T> {
        self
    }
}

#[derive(Deserialize)]
pub struct SearchResults<T> {
    pub items: Vec<T>,
}

impl<T: DeserializeOwned> Page for SearchResults<T> {
    type Item = T;
    fn into_items(self) -> Vec<T> {
        self.items
    }
}

/// Lazily walks the pages of a paginated endpoint. Nothing is requested until
/// the first call to `next`, and iteration stops after the first error.
pub struct Pages<'a, T, C, P> {
    client: &'a Client<T, C>,
    next: Option<String>,
    phantom: PhantomData<P>,
}

impl<'a, T: Transport, C: Clock, P: Page> Pages<'a, T, C, P> {
    pub fn new(client: &'a Client<T, C>, first: Url) -> Pages<'a, T, C, P> {
        Pages {
            client,
            next: Some(first.into()),
            phantom: PhantomData,
        }
    }

    /// Flatten pages into their items, keeping page order.
    pub fn flat_items(self) -> impl Iterator<Item = Result<P::Item>> + 'a
    where
        P: 'a,
        P::Item: 'a,
    {
        self.flat_map(|page| match page {
            Ok(items) => items.into_iter().map(Ok).collect(),
            Err(e) => vec![Err(e)],
        })
    }
}

impl<'a, T: Transport, C: Clock, P: Page> Iterator for Pages<'a, T, C, P> {
    type Item = Result<Vec<P::Item>>;

    fn next(&mut self) -> Option<Self::Item> {
        let url = self.next.take()?;
        debug!("fetching {}", url);
        let response = match self.client.get(&url) {
            Ok(response) => response,
            Err(e) => return Some(Err(e)),
        };
        let page = match serde_json::from_str::<P>(&response.body) {
            Ok(page) => page,
            Err(e) => return Some(Err(e.into())),
        };
        self.next = response.header("link").and_then(next_link);
        Some(Ok(page.into_items()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Owner {
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Repository {
    pub name: String,
    pub owner: Owner,
    pub updated_at: DateTime<Utc>,
    pub pushed_at: Option<DateTime<Utc>>,
}

impl Repository {
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.pushed_at.map_or(self.updated_at, |pushed| pushed.max(self.updated_at))
    }
}

#[derive(Debug, Deserialize)]
pub struct SearchIssue {
    number: u64,
    title: String,
    user: Owner,
    state: State,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
    pull_request: Option<PullRequestLinks>,
}

#[derive(Debug, Deserialize)]
pub struct PullRequestLinks {
    merged_at: Option<DateTime<Utc>>,
}

impl From<SearchIssue> for data::PullRequest {
    fn from(issue: SearchIssue) -> data::PullRequest {
        data::PullRequest {
            number: issue.number,
            title: issue.title,
            author: issue.user.login,
            state: issue.state,
            created: issue.created_at,
            updated: issue.updated_at,
            closed: issue.closed_at,
            merged: issue.pull_request.and_then(|pr| pr.merged_at),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Review {
    state: ReviewState,
}

/// Serves queued responses in order and remembers which URLs were requested.
#[cfg(test)]
pub(crate) struct FakeTransport {
    responses: std::cell::RefCell<std::collections::VecDeque<Response>>,
    pub(crate) requested: std::cell::RefCell<Vec<String>>,
}

#[cfg(test)]
impl FakeTransport {
    pub(crate) fn new(responses: Vec<Response>) -> FakeTransport {
        FakeTransport {
            responses: std::cell::RefCell::new(responses.into()),
            requested: std::cell::RefCell::new(vec![]),
        }
    }
}

#[cfg(test)]
impl Transport for FakeTransport {
    fn get(&self, url: &str) -> Result<Response> {
        self.requested.borrow_mut().push(url.to_owned());
        self.responses
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    format!("no response queued for {}", url),
                )
                .into()
            })
    }
}

impl<T: Transport + ?Sized> Transport for &T {
    fn get(&self, url: &str) -> Result<Response> {
        (**self).get(url)
    }
}

#[cfg(test)]
pub(crate) struct FakeClock {
    pub(crate) now: DateTime<Utc>,
    pub(crate) slept: std::cell::RefCell<Vec<Duration>>,
}

#[cfg(test)]
impl FakeClock {
    pub(crate) fn at(now: DateTime<Utc>) -> FakeClock {
        FakeClock {
            now,
            slept: std::cell::RefCell::new(vec![]),
        }
    }
}

#[cfg(test)]
impl Clock for &FakeClock {
    fn now(&self) -> DateTime<Utc> {
        self.now
    }

    fn sleep(&self, duration: Duration) {
        self.slept.borrow_mut().push(duration);
    }
}

#[cfg(test)]
pub(crate) fn ok(body: &str) -> Response {
    Response {
        status: 200,
        headers: vec![],
        body: body.to_owned(),
    }
}

#[cfg(test)]
pub(crate) fn ok_with_next(body: &str, next: &str) -> Response {
    Response {
        headers: vec![(
            "link".to_owned(),
            format!(r#"<{}>; rel="next", <{}>; rel="last""#, next, next),
        )],
        ..ok(body)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::data::test::ts;

    const API: &str = "https://api.test";

    fn client<'a>(
        transport: &'a FakeTransport,
        clock: &'a FakeClock,
        retry: RetryPolicy,
    ) -> Client<&'a FakeTransport, &'a FakeClock> {
        Client::new(transport, clock, retry, API).unwrap()
    }

    fn limited(headers: &[(&str, &str)], body: &str) -> Response {
        Response {
            status: 403,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: body.to_owned(),
        }
    }

    #[test]
    fn test_next_link() {
        let link = r#"<https://api.github.com/search/issues?q=x&page=2>; rel="next", <https://api.github.com/search/issues?q=x&page=5>; rel="last""#;
        assert_eq!(
            next_link(link).as_deref(),
            Some("https://api.github.com/search/issues?q=x&page=2")
        );
        let last = r#"<https://api.github.com/x?page=1>; rel="first", <https://api.github.com/x?page=4>; rel="prev""#;
        assert_eq!(next_link(last), None);
        assert_eq!(next_link(""), None);
    }

    #[test]
    fn test_search_query() {
        assert_eq!(
            search_query("dapr", "cli", ts("2024-01-01T00:00:00Z")),
            "repo:dapr/cli is:pr updated:>2024-01-01T00:00:00Z"
        );
    }

    #[test]
    fn pages_are_lazy_and_ordered() -> Result<()> {
        let transport = FakeTransport::new(vec![
            ok_with_next(r#"[{"state": "APPROVED"}, {"state": "COMMENTED"}]"#, "https://api.test/p2"),
            ok(r#"[{"state": "DISMISSED"}]"#),
        ]);
        let clock = FakeClock::at(ts("2024-01-01T00:00:00Z"));
        let client = client(&transport, &clock, RetryPolicy::default());

        let url = client.endpoint("repos/o/r/pulls/1/reviews", &[])?;
        let mut pages = Pages::<_, _, Vec<Review>>::new(&client, url);
        assert!(transport.requested.borrow().is_empty());

        assert_eq!(pages.next().unwrap()?.len(), 2);
        assert_eq!(pages.next().unwrap()?.len(), 1);
        assert!(pages.next().is_none());
        assert_eq!(
            *transport.requested.borrow(),
            vec![
                "https://api.test/repos/o/r/pulls/1/reviews?per_page=100".to_owned(),
                "https://api.test/p2".to_owned(),
            ]
        );
        Ok(())
    }

    #[test]
    fn review_states_follow_pages() -> Result<()> {
        let transport = FakeTransport::new(vec![
            ok_with_next(r#"[{"state": "APPROVED"}]"#, "https://api.test/p2"),
            ok(r#"[{"state": "CHANGES_REQUESTED"}]"#),
        ]);
        let clock = FakeClock::at(ts("2024-01-01T00:00:00Z"));
        let client = client(&transport, &clock, RetryPolicy::default());
        assert_eq!(
            client.review_states("o", "r", 7)?,
            vec![ReviewState::Approved, ReviewState::ChangesRequested]
        );
        Ok(())
    }

    #[test]
    fn search_encodes_query_and_reads_items() -> Result<()> {
        let transport = FakeTransport::new(vec![ok(r#"{
            "total_count": 1,
            "incomplete_results": false,
            "items": [{
                "number": 12,
                "title": "Fix actor reminders",
                "user": {"login": "bob"},
                "state": "closed",
                "created_at": "2024-02-01T00:00:00Z",
                "updated_at": "2024-02-02T00:00:00Z",
                "closed_at": "2024-02-02T00:00:00Z",
                "pull_request": {"merged_at": null, "url": "https://api.test/x"}
            }]
        }"#)]);
        let clock = FakeClock::at(ts("2024-01-01T00:00:00Z"));
        let client = client(&transport, &clock, RetryPolicy::default());

        let pulls = client
            .search_pulls("dapr", "dapr", ts("2024-01-01T00:00:00Z"))?
            .collect::<Result<Vec<_>>>()?;
        assert_eq!(pulls.len(), 1);
        assert_eq!(pulls[0].number, 12);
        assert_eq!(pulls[0].author, "bob");
        assert_eq!(pulls[0].state, State::Closed);
        assert_eq!(pulls[0].closed, Some(ts("2024-02-02T00:00:00Z")));
        assert_eq!(pulls[0].merged, None);

        let requested = transport.requested.borrow();
        let url = Url::parse(&requested[0]).unwrap();
        assert_eq!(url.path(), "/search/issues");
        let q = url.query_pairs().find(|(k, _)| k == "q").unwrap().1.into_owned();
        assert_eq!(q, "repo:dapr/dapr is:pr updated:>2024-01-01T00:00:00Z");
        Ok(())
    }

    #[test]
    fn org_repos_filters_inactive() -> Result<()> {
        let body = r#"[
            {"name": "dapr", "owner": {"login": "dapr"}, "updated_at": "2024-05-01T00:00:00Z", "pushed_at": "2024-05-02T00:00:00Z"},
            {"name": "old", "owner": {"login": "dapr"}, "updated_at": "2022-01-01T00:00:00Z", "pushed_at": null},
            {"name": "docs", "owner": {"login": "dapr"}, "updated_at": "2023-01-01T00:00:00Z", "pushed_at": "2024-03-01T00:00:00Z"}
        ]"#;
        let transport = FakeTransport::new(vec![ok(body), ok(body)]);
        let clock = FakeClock::at(ts("2024-01-01T00:00:00Z"));
        let client = client(&transport, &clock, RetryPolicy::default());

        let all: Vec<String> = client
            .org_repos("dapr", None)?
            .map(|r| r.map(|r| r.name))
            .collect::<Result<_>>()?;
        assert_eq!(all, vec!["dapr", "old", "docs"]);

        let active: Vec<String> = client
            .org_repos("dapr", Some(ts("2024-01-01T00:00:00Z")))?
            .map(|r| r.map(|r| r.name))
            .collect::<Result<_>>()?;
        assert_eq!(active, vec!["dapr", "docs"]);
        Ok(())
    }

    #[test]
    fn unknown_org_is_api_error() {
        let transport = FakeTransport::new(vec![Response {
            status: 404,
            headers: vec![],
            body: r#"{"message": "Not Found"}"#.to_owned(),
        }]);
        let clock = FakeClock::at(ts("2024-01-01T00:00:00Z"));
        let client = client(&transport, &clock, RetryPolicy::default());

        let first = client.org_repos("nope", None).unwrap().next();
        match first {
            Some(Err(GhpError::Api { status, message, .. })) => {
                assert_eq!(status, 404);
                assert_eq!(message, "Not Found");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn primary_limit_waits_for_reset() -> Result<()> {
        let now = ts("2024-01-01T00:00:00Z");
        let reset = (now.timestamp() + 90).to_string();
        let transport = FakeTransport::new(vec![
            limited(&[("x-ratelimit-remaining", "0"), ("x-ratelimit-reset", reset.as_str())], ""),
            ok("[]"),
        ]);
        let clock = FakeClock::at(now);
        let client = client(&transport, &clock, RetryPolicy::default());

        assert_eq!(client.get("https://api.test/x")?.status, 200);
        assert_eq!(*clock.slept.borrow(), vec![Duration::from_secs(90)]);
        assert_eq!(transport.requested.borrow().len(), 2);
        Ok(())
    }

    #[test]
    fn secondary_limit_honours_retry_after() -> Result<()> {
        let transport = FakeTransport::new(vec![
            limited(&[("retry-after", "30")], r#"{"message": "slow down"}"#),
            limited(&[], r#"{"message": "You have exceeded a secondary rate limit."}"#),
            ok("[]"),
        ]);
        let clock = FakeClock::at(ts("2024-01-01T00:00:00Z"));
        let retry = RetryPolicy {
            max_retries: None,
            backoff_base: Duration::from_secs(60),
        };
        let client = client(&transport, &clock, retry);

        client.get("https://api.test/x")?;
        assert_eq!(
            *clock.slept.borrow(),
            vec![Duration::from_secs(30), Duration::from_secs(120)]
        );
        Ok(())
    }

    #[test]
    fn retry_budget_exhausted() {
        let transport = FakeTransport::new(vec![
            limited(&[("retry-after", "1")], ""),
            limited(&[("retry-after", "1")], ""),
        ]);
        let clock = FakeClock::at(ts("2024-01-01T00:00:00Z"));
        let retry = RetryPolicy {
            max_retries: Some(1),
            ..RetryPolicy::default()
        };
        let client = client(&transport, &clock, retry);

        match client.get("https://api.test/x") {
            Err(GhpError::RateLimited { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(clock.slept.borrow().len(), 1);
    }

    #[test]
    fn plain_forbidden_is_not_retried() {
        let transport = FakeTransport::new(vec![limited(&[], r#"{"message": "Bad credentials"}"#)]);
        let clock = FakeClock::at(ts("2024-01-01T00:00:00Z"));
        let client = client(&transport, &clock, RetryPolicy::default());

        assert!(matches!(
            client.get("https://api.test/x"),
            Err(GhpError::Api { status: 403, .. })
        ));
        assert!(clock.slept.borrow().is_empty());
    }
}
