//! # docbot-workload
//!
//! Builds the preview workload for a pull request. Everything here is pure:
//! the same [`PullRequestRef`](docbot_core::PullRequestRef) and
//! [`WorkloadOptions`] always produce the same [`WorkloadSpec`], which is
//! what lets the reconciler compare desired and observed state by value.

pub mod builder;
pub mod options;

pub use builder::{commit_slot, preview_args, WorkloadBuilder, WorkloadSpec, COMMIT_SLOT};
pub use options::WorkloadOptions;
