//! Static registry of the resource kinds the store can persist.
//!
//! Every kind is registered exactly once here. The store routes requests
//! (storage directory, `apiVersion`/`kind` defaults) through [`KindInfo`];
//! the daemon watcher maps file paths back to kinds through the same table.

use std::fmt;

/// A resource kind known to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    PullRequest,
    Deployment,
}

/// Registration data for a [`ResourceKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindInfo {
    pub kind: ResourceKind,
    /// Value of the `kind` field in stored documents.
    pub name: &'static str,
    /// Value of the `apiVersion` field in stored documents.
    pub api_version: &'static str,
    /// Directory under the resources root holding this kind.
    pub dir: &'static str,
}

pub const CODE_API_VERSION: &str = "code.docbot.dev/v1alpha1";
pub const APPS_API_VERSION: &str = "apps/v1";

static REGISTRY: &[KindInfo] = &[
    KindInfo {
        kind: ResourceKind::PullRequest,
        name: "PullRequest",
        api_version: CODE_API_VERSION,
        dir: "pullrequests",
    },
    KindInfo {
        kind: ResourceKind::Deployment,
        name: "Deployment",
        api_version: APPS_API_VERSION,
        dir: "deployments",
    },
];

impl ResourceKind {
    /// Registration entry for this kind.
    pub fn info(self) -> &'static KindInfo {
        match self {
            ResourceKind::PullRequest => &REGISTRY[0],
            ResourceKind::Deployment => &REGISTRY[1],
        }
    }

    pub fn name(self) -> &'static str {
        self.info().name
    }

    pub fn api_version(self) -> &'static str {
        self.info().api_version
    }

    pub fn dir(self) -> &'static str {
        self.info().dir
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// All registered kinds, in registration order.
pub fn all() -> impl Iterator<Item = &'static KindInfo> {
    REGISTRY.iter()
}

/// Look up a kind by its storage directory name.
pub fn lookup_dir(dir: &str) -> Option<&'static KindInfo> {
    REGISTRY.iter().find(|info| info.dir == dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_is_registered_once() {
        for kind in [ResourceKind::PullRequest, ResourceKind::Deployment] {
            let count = all().filter(|info| info.kind == kind).count();
            assert_eq!(count, 1, "{kind} registered {count} times");
            assert_eq!(kind.info().kind, kind);
        }
    }

    #[test]
    fn lookup_by_dir() {
        assert_eq!(
            lookup_dir("pullrequests").map(|i| i.kind),
            Some(ResourceKind::PullRequest)
        );
        assert_eq!(
            lookup_dir("deployments").map(|i| i.kind),
            Some(ResourceKind::Deployment)
        );
        assert!(lookup_dir("replicasets").is_none());
    }

    #[test]
    fn dirs_are_distinct() {
        let mut dirs: Vec<_> = all().map(|i| i.dir).collect();
        dirs.sort();
        dirs.dedup();
        assert_eq!(dirs.len(), all().count());
    }
}
