//! Repository host access.
//!
//! [`RepositoryHost`] is the only seam through which head commits are read.
//! [`GithubHost`] implements it against the GitHub REST API:
//!
//! - `GET {api}/repos/{org}/{repo}/pulls/{number}`
//! - `GET {api}/repos/{org}/{repo}/pulls?state=open&per_page=100&page=N`

use std::time::Duration;

use serde::Deserialize;

use crate::error::HostError;

/// Page size for pull request listings; a shorter page ends pagination.
pub const PER_PAGE: usize = 100;

/// Listings longer than this many pages are rejected.
pub const MAX_PAGES: u32 = 50;

const USER_AGENT: &str = concat!("docbot/", env!("CARGO_PKG_VERSION"));

/// A pull request as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPullRequest {
    pub number: u64,
    pub head_sha: String,
}

/// Read access to pull requests on a repository host.
pub trait RepositoryHost: Send + Sync {
    /// Current state of one pull request.
    fn get_pull_request(
        &self,
        organization: &str,
        repository: &str,
        number: u64,
    ) -> Result<HostPullRequest, HostError>;

    /// All open pull requests of one repository.
    fn list_pull_requests(
        &self,
        organization: &str,
        repository: &str,
    ) -> Result<Vec<HostPullRequest>, HostError>;
}

// ---------------------------------------------------------------------------
// GitHub
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct GithubPull {
    number: u64,
    head: GithubHead,
}

#[derive(Deserialize)]
struct GithubHead {
    sha: String,
}

impl From<GithubPull> for HostPullRequest {
    fn from(pull: GithubPull) -> Self {
        Self {
            number: pull.number,
            head_sha: pull.head.sha,
        }
    }
}

/// Parse a single-pull-request response body.
pub fn parse_pull(url: &str, body: &str) -> Result<HostPullRequest, HostError> {
    let pull: GithubPull = serde_json::from_str(body).map_err(|e| malformed(url, e))?;
    if pull.head.sha.is_empty() {
        return Err(malformed(url, "empty head sha"));
    }
    Ok(pull.into())
}

/// Parse a pull request listing response body.
pub fn parse_pulls(url: &str, body: &str) -> Result<Vec<HostPullRequest>, HostError> {
    let pulls: Vec<GithubPull> = serde_json::from_str(body).map_err(|e| malformed(url, e))?;
    if let Some(pull) = pulls.iter().find(|p| p.head.sha.is_empty()) {
        return Err(malformed(url, format!("empty head sha for #{}", pull.number)));
    }
    Ok(pulls.into_iter().map(HostPullRequest::from).collect())
}

fn malformed(url: &str, reason: impl ToString) -> HostError {
    HostError::MalformedResponse {
        url: url.to_owned(),
        reason: reason.to_string(),
    }
}

fn request_err(url: &str, err: ureq::Error) -> HostError {
    match err {
        ureq::Error::Status(status, _) => HostError::Status {
            status,
            url: url.to_owned(),
        },
        ureq::Error::Transport(transport) => HostError::Unavailable(transport.to_string()),
    }
}

/// GitHub REST client.
pub struct GithubHost {
    agent: ureq::Agent,
    api_url: String,
    token: Option<String>,
}

impl GithubHost {
    /// `api_url` is the REST root, e.g. `https://api.github.com`.
    pub fn new(api_url: impl Into<String>, token: Option<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(30))
            .user_agent(USER_AGENT)
            .build();
        Self {
            agent,
            api_url: api_url.into().trim_end_matches('/').to_owned(),
            token: token.filter(|t| !t.is_empty()),
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    fn fetch(&self, url: &str) -> Result<String, HostError> {
        let mut request = self
            .agent
            .get(url)
            .set("Accept", "application/vnd.github+json");
        if let Some(token) = &self.token {
            request = request.set("Authorization", &format!("Bearer {token}"));
        }
        let response = request.call().map_err(|e| request_err(url, e))?;
        response.into_string().map_err(|e| malformed(url, e))
    }
}

impl RepositoryHost for GithubHost {
    fn get_pull_request(
        &self,
        organization: &str,
        repository: &str,
        number: u64,
    ) -> Result<HostPullRequest, HostError> {
        let url = format!(
            "{}/repos/{organization}/{repository}/pulls/{number}",
            self.api_url
        );
        tracing::debug!(url = %url, "fetching pull request");
        let body = self.fetch(&url)?;
        parse_pull(&url, &body)
    }

    fn list_pull_requests(
        &self,
        organization: &str,
        repository: &str,
    ) -> Result<Vec<HostPullRequest>, HostError> {
        collect_pages(|page| {
            let url = format!(
                "{}/repos/{organization}/{repository}/pulls?state=open&per_page={PER_PAGE}&page={page}",
                self.api_url
            );
            tracing::debug!(url = %url, "listing pull requests");
            let body = self.fetch(&url)?;
            let batch = parse_pulls(&url, &body)?;
            Ok((url, batch))
        })
    }
}

/// Fetch pages starting at 1 until one comes back shorter than [`PER_PAGE`].
fn collect_pages(
    mut fetch_page: impl FnMut(u32) -> Result<(String, Vec<HostPullRequest>), HostError>,
) -> Result<Vec<HostPullRequest>, HostError> {
    let mut all = Vec::new();
    for page in 1..=MAX_PAGES {
        let (url, batch) = fetch_page(page)?;
        let done = batch.len() < PER_PAGE;
        all.extend(batch);
        if done {
            return Ok(all);
        }
        if page == MAX_PAGES {
            return Err(malformed(
                &url,
                format!("listing exceeds {MAX_PAGES} pages of {PER_PAGE}"),
            ));
        }
    }
    Ok(all)
}

// ---------------------------------------------------------------------------
// In-memory host
// ---------------------------------------------------------------------------

/// In-memory host that records every call made against it.
#[cfg(any(test, feature = "test-support"))]
pub mod fake {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use super::{HostPullRequest, RepositoryHost};
    use crate::error::HostError;

    /// A recorded host call.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        Get { repo: String, number: u64 },
        List { repo: String },
    }

    #[derive(Default)]
    pub struct RecordingHost {
        open: Mutex<BTreeMap<String, Vec<HostPullRequest>>>,
        failing: Mutex<Vec<String>>,
        calls: Mutex<Vec<Call>>,
    }

    impl RecordingHost {
        pub fn new() -> Self {
            Self::default()
        }

        /// Set the head of `org/repo#number`, opening it if needed.
        pub fn set_head(&self, repo: &str, number: u64, sha: &str) {
            let mut open = self.open.lock().unwrap_or_else(|p| p.into_inner());
            let pulls = open.entry(repo.to_owned()).or_default();
            match pulls.iter_mut().find(|p| p.number == number) {
                Some(pull) => pull.head_sha = sha.to_owned(),
                None => pulls.push(HostPullRequest {
                    number,
                    head_sha: sha.to_owned(),
                }),
            }
        }

        /// Remove `org/repo#number` from the open set.
        pub fn close(&self, repo: &str, number: u64) {
            let mut open = self.open.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(pulls) = open.get_mut(repo) {
                pulls.retain(|p| p.number != number);
            }
        }

        /// Make every call for `org/repo` fail as unavailable.
        pub fn fail_repo(&self, repo: &str) {
            self.failing
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(repo.to_owned());
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
        }

        pub fn list_calls(&self) -> usize {
            self.calls()
                .iter()
                .filter(|c| matches!(c, Call::List { .. }))
                .count()
        }

        fn record(&self, repo: &str, call: Call) -> Result<(), HostError> {
            self.calls
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(call);
            let failing = self.failing.lock().unwrap_or_else(|p| p.into_inner());
            if failing.iter().any(|r| r == repo) {
                return Err(HostError::Unavailable(format!("{repo} is unreachable")));
            }
            Ok(())
        }
    }

    impl RepositoryHost for RecordingHost {
        fn get_pull_request(
            &self,
            organization: &str,
            repository: &str,
            number: u64,
        ) -> Result<HostPullRequest, HostError> {
            let repo = format!("{organization}/{repository}");
            self.record(
                &repo,
                Call::Get {
                    repo: repo.clone(),
                    number,
                },
            )?;
            let open = self.open.lock().unwrap_or_else(|p| p.into_inner());
            open.get(&repo)
                .and_then(|pulls| pulls.iter().find(|p| p.number == number))
                .cloned()
                .ok_or(HostError::Status {
                    status: 404,
                    url: format!("fake://{repo}/pulls/{number}"),
                })
        }

        fn list_pull_requests(
            &self,
            organization: &str,
            repository: &str,
        ) -> Result<Vec<HostPullRequest>, HostError> {
            let repo = format!("{organization}/{repository}");
            self.record(&repo, Call::List { repo: repo.clone() })?;
            let open = self.open.lock().unwrap_or_else(|p| p.into_inner());
            Ok(open.get(&repo).cloned().unwrap_or_default())
        }
    }
}
