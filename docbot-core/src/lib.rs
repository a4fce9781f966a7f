//! docbot core library: resource types, the kind registry, pull request
//! references and the file-backed resource store.
//!
//! - [`types`]: persisted resources and their metadata
//! - [`scheme`]: static registry of resource kinds
//! - [`reference`]: [`PullRequestRef`] parsing
//! - [`store`]: [`ResourceStore`] trait and [`FileStore`]
//! - [`error`]: [`StoreError`], [`ReferenceError`]

pub mod error;
pub mod reference;
pub mod scheme;
pub mod store;
pub mod types;

pub use error::{ReferenceError, StoreError};
pub use reference::PullRequestRef;
pub use scheme::{KindInfo, ResourceKind};
pub use store::{FileStore, ResourceStore};
pub use types::{
    Container, Deployment, DeploymentSpec, DeploymentStatus, ObjectKey, ObjectMeta,
    OwnerReference, PullRequest, PullRequestSpec, PullRequestStatus, RepoKey, Resource,
};
