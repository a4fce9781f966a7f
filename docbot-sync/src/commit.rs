//! Keeps `spec.commitID` in line with the pull request's head on the host.
//!
//! Two paths write the field, and nothing else does:
//!
//! - [`CommitResolver`] fills it in for a newly tracked pull request with a
//!   single-PR lookup.
//! - [`BatchRefresher`] periodically lists open pull requests once per
//!   repository and rewrites every tracked commit that has moved.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;

use docbot_core::{ObjectKey, PullRequest, PullRequestRef, RepoKey, Resource, ResourceStore};

use crate::error::SyncError;
use crate::host::{HostPullRequest, RepositoryHost};
use crate::reconcile::{Outcome, Reconcile};

// ---------------------------------------------------------------------------
// On-demand resolution
// ---------------------------------------------------------------------------

pub struct CommitResolver<S, H> {
    store: Arc<S>,
    host: Arc<H>,
}

impl<S: ResourceStore, H: RepositoryHost> CommitResolver<S, H> {
    pub fn new(store: Arc<S>, host: Arc<H>) -> Self {
        Self { store, host }
    }
}

impl<S, H> Reconcile for CommitResolver<S, H>
where
    S: ResourceStore + 'static,
    H: RepositoryHost + 'static,
{
    fn name(&self) -> &'static str {
        "commit-resolver"
    }

    fn reconcile(&self, key: &ObjectKey) -> Result<Outcome, SyncError> {
        let Some(pr) = self.store.try_get::<PullRequest>(key)? else {
            return Ok(Outcome::Deleted);
        };
        if pr.has_commit() {
            return Ok(Outcome::Unchanged);
        }
        let pr_ref = match PullRequestRef::parse(&pr.spec.url) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "cannot resolve commit");
                return Ok(Outcome::Skipped {
                    reason: err.to_string(),
                });
            }
        };

        tracing::info!(key = %key, pr = %pr_ref, "fetching head commit");
        let head = self
            .host
            .get_pull_request(&pr_ref.organization, &pr_ref.repository, pr_ref.number)?;

        let mut updated = pr;
        updated.spec.commit_id = head.head_sha.clone();
        self.store.update(&updated)?;
        tracing::info!(key = %key, commit = %head.head_sha, "resolved head commit");
        Ok(Outcome::CommitResolved {
            commit: head.head_sha,
        })
    }
}

// ---------------------------------------------------------------------------
// Batch refresh
// ---------------------------------------------------------------------------

/// Totals for one refresh pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
    /// Distinct repositories among tracked pull requests.
    pub groups: usize,
    /// Listing calls issued to the host.
    pub host_calls: usize,
    /// Tracked pull requests whose commit was rewritten.
    pub updated: usize,
    pub unchanged: usize,
    /// Tracked pull requests absent from the host's open listing.
    pub orphaned: usize,
    /// Tracked pull requests whose URL does not parse.
    pub skipped: usize,
    /// Failed listings plus failed writes.
    pub failures: usize,
    /// The pass stopped early on request.
    pub abandoned: bool,
}

type Groups = BTreeMap<RepoKey, BTreeMap<u64, Vec<PullRequest>>>;

pub struct BatchRefresher<S, H> {
    store: Arc<S>,
    host: Arc<H>,
}

impl<S: ResourceStore, H: RepositoryHost> BatchRefresher<S, H> {
    pub fn new(store: Arc<S>, host: Arc<H>) -> Self {
        Self { store, host }
    }

    /// Run a complete refresh pass.
    pub fn refresh(&self) -> Result<RefreshSummary, SyncError> {
        self.refresh_until(|| false)
    }

    /// Run a refresh pass, checking `stop` before each host call.
    ///
    /// Only failing to list tracked resources fails the pass. A failed
    /// listing skips its group; a failed write skips that resource; both
    /// are retried on the next pass.
    pub fn refresh_until(&self, stop: impl Fn() -> bool) -> Result<RefreshSummary, SyncError> {
        let tracked: Vec<PullRequest> = self.store.list(None)?;
        let mut summary = RefreshSummary::default();
        let groups = group(tracked, &mut summary);
        summary.groups = groups.len();

        for (repo, by_number) in groups {
            if stop() {
                tracing::info!("refresh interrupted by shutdown");
                summary.abandoned = true;
                break;
            }
            summary.host_calls += 1;
            match self
                .host
                .list_pull_requests(&repo.organization, &repo.repository)
            {
                Ok(open) => self.apply(&repo, by_number, &open, &mut summary),
                Err(err) => {
                    tracing::warn!(repo = %repo, error = %err, "failed to list pull requests");
                    summary.failures += 1;
                }
            }
        }

        tracing::info!(
            groups = summary.groups,
            updated = summary.updated,
            orphaned = summary.orphaned,
            failures = summary.failures,
            "refresh complete"
        );
        Ok(summary)
    }

    fn apply(
        &self,
        repo: &RepoKey,
        by_number: BTreeMap<u64, Vec<PullRequest>>,
        open: &[HostPullRequest],
        summary: &mut RefreshSummary,
    ) {
        let heads: HashMap<u64, &str> = open
            .iter()
            .map(|p| (p.number, p.head_sha.as_str()))
            .collect();
        let untracked = open
            .iter()
            .filter(|p| !by_number.contains_key(&p.number))
            .count();
        tracing::debug!(repo = %repo, open = open.len(), untracked, "listed pull requests");

        for (number, prs) in by_number {
            let Some(head) = heads.get(&number).copied() else {
                for pr in &prs {
                    tracing::warn!(
                        key = %pr.key(),
                        repo = %repo,
                        number,
                        "pull request not open on host"
                    );
                }
                summary.orphaned += prs.len();
                continue;
            };
            if head.is_empty() {
                tracing::warn!(repo = %repo, number, "host reported an empty head commit");
                summary.failures += prs.len();
                continue;
            }

            for pr in prs {
                if pr.spec.commit_id == head {
                    summary.unchanged += 1;
                    continue;
                }
                match self.write_commit(pr, head) {
                    Ok(()) => summary.updated += 1,
                    Err(err) => {
                        tracing::warn!(repo = %repo, number, error = %err, "failed to update commit");
                        summary.failures += 1;
                    }
                }
            }
        }
    }

    fn write_commit(&self, mut pr: PullRequest, head: &str) -> Result<(), SyncError> {
        tracing::info!(
            key = %pr.key(),
            from = %pr.spec.commit_id,
            to = %head,
            "pull request head moved"
        );
        pr.spec.commit_id = head.to_owned();
        self.store.update(&pr)?;
        Ok(())
    }
}

/// Group tracked pull requests by repository, then number.
fn group(tracked: Vec<PullRequest>, summary: &mut RefreshSummary) -> Groups {
    let mut groups = Groups::new();
    for pr in tracked {
        match PullRequestRef::parse(&pr.spec.url) {
            Ok(pr_ref) => groups
                .entry(pr_ref.repo_key())
                .or_default()
                .entry(pr_ref.number)
                .or_default()
                .push(pr),
            Err(err) => {
                tracing::warn!(key = %pr.key(), error = %err, "skipping unparsable pull request");
                summary.skipped += 1;
            }
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HostError;
    use crate::host::fake::{Call, RecordingHost};
    use docbot_core::FileStore;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<FileStore>,
        host: Arc<RecordingHost>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().expect("tempdir");
            Self {
                store: Arc::new(FileStore::at(dir.path())),
                host: Arc::new(RecordingHost::new()),
                _dir: dir,
            }
        }

        fn track(&self, name: &str, url: &str, commit: &str) -> ObjectKey {
            let key = ObjectKey::new("default", name);
            let mut pr = PullRequest::new(&key, url);
            pr.spec.commit_id = commit.into();
            self.store.create(&pr).expect("create");
            key
        }

        fn commit(&self, key: &ObjectKey) -> String {
            self.store
                .get::<PullRequest>(key)
                .expect("get")
                .spec
                .commit_id
        }

        fn version(&self, key: &ObjectKey) -> u64 {
            self.store
                .get::<PullRequest>(key)
                .expect("get")
                .metadata
                .resource_version
        }

        fn resolver(&self) -> CommitResolver<FileStore, RecordingHost> {
            CommitResolver::new(Arc::clone(&self.store), Arc::clone(&self.host))
        }

        fn refresher(&self) -> BatchRefresher<FileStore, RecordingHost> {
            BatchRefresher::new(Arc::clone(&self.store), Arc::clone(&self.host))
        }
    }

    #[test]
    fn resolver_fills_empty_commit() {
        let fx = Fixture::new();
        fx.host.set_head("acme/widgets", 42, "deadbeef");
        let key = fx.track("w42", "https://github.com/acme/widgets/pull/42", "");

        let outcome = fx.resolver().reconcile(&key).expect("resolve");
        assert_eq!(
            outcome,
            Outcome::CommitResolved {
                commit: "deadbeef".into()
            }
        );
        assert_eq!(fx.commit(&key), "deadbeef");
        assert_eq!(
            fx.host.calls(),
            vec![Call::Get {
                repo: "acme/widgets".into(),
                number: 42
            }]
        );
    }

    #[test]
    fn resolver_leaves_resolved_commit_alone() {
        let fx = Fixture::new();
        fx.host.set_head("acme/widgets", 42, "new");
        let key = fx.track("w42", "https://github.com/acme/widgets/pull/42", "old");

        assert_eq!(fx.resolver().reconcile(&key).expect("resolve"), Outcome::Unchanged);
        assert_eq!(fx.commit(&key), "old");
        assert!(fx.host.calls().is_empty());
    }

    #[test]
    fn resolver_surfaces_host_failure_without_writing() {
        let fx = Fixture::new();
        let key = fx.track("w42", "https://github.com/acme/widgets/pull/42", "");
        fx.host.fail_repo("acme/widgets");

        let err = fx.resolver().reconcile(&key).unwrap_err();
        assert!(matches!(err, SyncError::Host(HostError::Unavailable(_))));
        assert_eq!(fx.commit(&key), "");
        assert_eq!(fx.version(&key), 1);
    }

    #[test]
    fn resolver_skips_malformed_url_without_host_call() {
        let fx = Fixture::new();
        let key = fx.track("bad", "https://github.com/acme/widgets", "");
        let outcome = fx.resolver().reconcile(&key).expect("resolve");
        assert!(matches!(outcome, Outcome::Skipped { .. }));
        assert!(fx.host.calls().is_empty());
    }

    #[test]
    fn resolver_tolerates_deleted_resource() {
        let fx = Fixture::new();
        let outcome = fx
            .resolver()
            .reconcile(&ObjectKey::new("default", "gone"))
            .expect("resolve");
        assert_eq!(outcome, Outcome::Deleted);
    }

    #[test]
    fn refresh_groups_by_organization_and_repository() {
        let fx = Fixture::new();
        fx.host.set_head("org1/repoA", 1, "a1");
        fx.host.set_head("org1/repoA", 2, "a2");
        fx.host.set_head("org2/repoB", 1, "b1");
        let a1 = fx.track("a1", "https://github.com/org1/repoA/pull/1", "old");
        let a2 = fx.track("a2", "https://github.com/org1/repoA/pull/2", "old");
        let b1 = fx.track("b1", "https://github.com/org2/repoB/pull/1", "old");

        let summary = fx.refresher().refresh().expect("refresh");
        assert_eq!(summary.groups, 2);
        assert_eq!(summary.host_calls, 2);
        assert_eq!(summary.updated, 3);
        assert_eq!(fx.host.list_calls(), 2);
        assert_eq!(fx.commit(&a1), "a1");
        assert_eq!(fx.commit(&a2), "a2");
        assert_eq!(fx.commit(&b1), "b1");
    }

    #[test]
    fn refresh_groups_are_case_sensitive() {
        let fx = Fixture::new();
        fx.host.set_head("Acme/widgets", 1, "upper");
        fx.host.set_head("acme/widgets", 1, "lower");
        let upper = fx.track("upper", "https://github.com/Acme/widgets/pull/1", "old");
        let lower = fx.track("lower", "https://github.com/acme/widgets/pull/1", "old");

        let summary = fx.refresher().refresh().expect("refresh");
        assert_eq!(summary.groups, 2);
        assert_eq!(fx.host.list_calls(), 2);
        assert_eq!(fx.commit(&upper), "upper");
        assert_eq!(fx.commit(&lower), "lower");
    }

    #[test]
    fn refresh_never_writes_an_empty_head() {
        let fx = Fixture::new();
        fx.host.set_head("acme/widgets", 1, "");
        let key = fx.track("w1", "https://github.com/acme/widgets/pull/1", "abc123");

        let summary = fx.refresher().refresh().expect("refresh");
        assert_eq!(summary.updated, 0);
        assert_eq!(summary.failures, 1);
        assert_eq!(fx.commit(&key), "abc123");
        assert_eq!(fx.version(&key), 1);
    }

    #[test]
    fn refresh_lists_once_per_repository() {
        let fx = Fixture::new();
        fx.host.set_head("acme/widgets", 1, "a1");
        fx.host.set_head("acme/widgets", 2, "a2");
        fx.host.set_head("acme/gadgets", 3, "b3");
        fx.track("w1", "https://github.com/acme/widgets/pull/1", "a1");
        fx.track("w2", "https://github.com/acme/widgets/pull/2", "a2");
        fx.track("g3", "https://github.com/acme/gadgets/pull/3", "b3");

        let summary = fx.refresher().refresh().expect("refresh");
        assert_eq!(summary.groups, 2);
        assert_eq!(summary.host_calls, 2);
        assert_eq!(summary.unchanged, 3);
        assert_eq!(fx.host.list_calls(), 2);
    }

    #[test]
    fn refresh_rewrites_moved_heads_only() {
        let fx = Fixture::new();
        fx.host.set_head("acme/widgets", 1, "new");
        fx.host.set_head("acme/widgets", 2, "same");
        let moved = fx.track("w1", "https://github.com/acme/widgets/pull/1", "old");
        let still = fx.track("w2", "https://github.com/acme/widgets/pull/2", "same");

        let summary = fx.refresher().refresh().expect("refresh");
        assert_eq!(summary.updated, 1);
        assert_eq!(summary.unchanged, 1);
        assert_eq!(fx.commit(&moved), "new");
        assert_eq!(fx.version(&still), 1);
    }

    #[test]
    fn refresh_updates_every_resource_tracking_the_same_pull_request() {
        let fx = Fixture::new();
        fx.host.set_head("acme/widgets", 1, "new");
        let a = fx.track("a", "https://github.com/acme/widgets/pull/1", "old");
        let b = fx.track("b", "https://github.com/acme/widgets/pull/1/files", "old");

        let summary = fx.refresher().refresh().expect("refresh");
        assert_eq!(summary.updated, 2);
        assert_eq!(summary.host_calls, 1);
        assert_eq!(fx.commit(&a), "new");
        assert_eq!(fx.commit(&b), "new");
    }

    #[test]
    fn refresh_leaves_closed_pull_requests_untouched() {
        let fx = Fixture::new();
        fx.host.set_head("acme/widgets", 1, "a");
        let key = fx.track("w7", "https://github.com/acme/widgets/pull/7", "old");

        let summary = fx.refresher().refresh().expect("refresh");
        assert_eq!(summary.orphaned, 1);
        assert_eq!(fx.commit(&key), "old");
        assert_eq!(fx.version(&key), 1);
    }

    #[test]
    fn refresh_isolates_failing_repository() {
        let fx = Fixture::new();
        fx.host.set_head("acme/widgets", 1, "new");
        fx.host.set_head("acme/gadgets", 2, "new");
        fx.host.fail_repo("acme/gadgets");
        let ok = fx.track("w1", "https://github.com/acme/widgets/pull/1", "old");
        let broken = fx.track("g2", "https://github.com/acme/gadgets/pull/2", "old");

        let summary = fx.refresher().refresh().expect("refresh");
        assert_eq!(summary.failures, 1);
        assert_eq!(summary.updated, 1);
        assert_eq!(fx.commit(&ok), "new");
        assert_eq!(fx.commit(&broken), "old");
    }

    #[test]
    fn refresh_skips_unparsable_urls() {
        let fx = Fixture::new();
        fx.track("bad", "not a url", "");
        let summary = fx.refresher().refresh().expect("refresh");
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.groups, 0);
        assert_eq!(fx.host.list_calls(), 0);
    }

    #[test]
    fn refresh_stops_before_next_host_call() {
        let fx = Fixture::new();
        fx.host.set_head("acme/widgets", 1, "new");
        fx.track("w1", "https://github.com/acme/widgets/pull/1", "old");

        let summary = fx.refresher().refresh_until(|| true).expect("refresh");
        assert!(summary.abandoned);
        assert_eq!(summary.host_calls, 0);
        assert!(fx.host.calls().is_empty());
    }

    #[test]
    fn refresh_with_nothing_tracked_calls_nothing() {
        let fx = Fixture::new();
        let summary = fx.refresher().refresh().expect("refresh");
        assert_eq!(summary, RefreshSummary::default());
        assert!(fx.host.calls().is_empty());
    }
}
