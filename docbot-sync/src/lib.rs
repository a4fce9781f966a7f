//! # docbot-sync
//!
//! Convergence logic between tracked pull requests and their preview
//! workloads.
//!
//! - [`deployer::Deployer`]: creates and updates the workload for a tracked
//!   pull request and publishes its preview link.
//! - [`commit::CommitResolver`]: resolves the head commit of newly tracked
//!   pull requests.
//! - [`commit::BatchRefresher`]: periodic, repo-batched head commit refresh.
//! - [`host`]: the [`RepositoryHost`] seam and its GitHub client.

pub mod commit;
pub mod deployer;
pub mod error;
pub mod host;
pub mod reconcile;

pub use commit::{BatchRefresher, CommitResolver, RefreshSummary};
pub use deployer::Deployer;
pub use error::{HostError, SyncError};
pub use host::{GithubHost, HostPullRequest, RepositoryHost};
pub use reconcile::{Outcome, Reconcile};
