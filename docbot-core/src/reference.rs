//! Pull request references parsed from URLs.
//!
//! An example pull request URL looks like
//! `https://github.com/kubernetes-sigs/controller-runtime/pull/15`.
//! Anything after the number (`/files`, `/commits`) is ignored.

use std::fmt;
use std::str::FromStr;

use url::Url;

use crate::error::ReferenceError;
use crate::types::RepoKey;

/// A structured pull request reference.
///
/// Always derived from the tracked resource's URL on each pass; never cached.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PullRequestRef {
    pub host: String,
    pub organization: String,
    pub repository: String,
    pub number: u64,
    pub commit_id: Option<String>,
}

impl PullRequestRef {
    /// Parse `https://<host>/<org>/<repo>/pull/<number>`.
    pub fn parse(url: &str) -> Result<Self, ReferenceError> {
        let parsed = Url::parse(url).map_err(|e| ReferenceError::malformed(url, e.to_string()))?;
        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ReferenceError::malformed(url, "missing host"))?;

        let path = parsed.path();
        let parts: Vec<&str> = path.strip_prefix('/').unwrap_or(path).split('/').collect();
        if parts.len() < 4 || parts[2] != "pull" {
            return Err(ReferenceError::malformed(url, "pr info missing in the URL"));
        }
        if parts[0].is_empty() || parts[1].is_empty() {
            return Err(ReferenceError::malformed(
                url,
                "organization and repository must be non-empty",
            ));
        }
        let number = parts[3].parse::<u64>().map_err(|e| {
            ReferenceError::malformed(url, format!("invalid pull request number '{}': {e}", parts[3]))
        })?;

        Ok(Self {
            host: host.to_owned(),
            organization: parts[0].to_owned(),
            repository: parts[1].to_owned(),
            number,
            commit_id: None,
        })
    }

    /// Attach a resolved commit identifier.
    pub fn with_commit(mut self, commit_id: impl Into<String>) -> Self {
        self.commit_id = Some(commit_id.into());
        self
    }

    /// `<org>-<repo>-pr-<number>`, used for the tunnel and the preview link.
    pub fn subdomain(&self) -> String {
        format!(
            "{}-{}-pr-{}",
            self.organization, self.repository, self.number
        )
    }

    pub fn repo_key(&self) -> RepoKey {
        RepoKey {
            organization: self.organization.clone(),
            repository: self.repository.clone(),
        }
    }
}

impl FromStr for PullRequestRef {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PullRequestRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}#{}",
            self.host, self.organization, self.repository, self.number
        )
    }
}
