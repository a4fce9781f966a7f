//! Persisted resource types.
//!
//! Field names follow the declarative-resource convention (`apiVersion`,
//! `metadata.ownerReferences`, `status.availableReplicas`) so stored YAML
//! reads the same as the manifests users already know.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::scheme::ResourceKind;

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Namespace-qualified resource name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Grouping key for batched host calls: exact, case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepoKey {
    pub organization: String,
    pub repository: String,
}

impl fmt::Display for RepoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.organization, self.repository)
    }
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Link from a generated resource to the resource that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default)]
    pub controller: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    /// Assigned by the store on create.
    #[serde(default)]
    pub uid: String,
    /// Assigned by the store; incremented on every update.
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
}

impl ObjectMeta {
    pub fn new(key: &ObjectKey) -> Self {
        Self {
            name: key.name.clone(),
            namespace: key.namespace.clone(),
            ..Self::default()
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    /// The owner reference flagged as the managing controller, if any.
    pub fn controller_ref(&self) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|r| r.controller)
    }
}

/// Implemented by every kind the store can persist.
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: ResourceKind;

    fn metadata(&self) -> &ObjectMeta;
    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    fn key(&self) -> ObjectKey {
        self.metadata().key()
    }

    /// Reject updates that change fields immutable once set.
    fn validate_update(&self, _stored: &Self) -> Result<(), String> {
        Ok(())
    }

    /// Controller owner reference pointing at this resource.
    fn controller_ref(&self) -> OwnerReference {
        OwnerReference {
            api_version: Self::KIND.api_version().to_owned(),
            kind: Self::KIND.name().to_owned(),
            name: self.metadata().name.clone(),
            uid: self.metadata().uid.clone(),
            controller: true,
        }
    }
}

// ---------------------------------------------------------------------------
// PullRequest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PullRequestSpec {
    /// URL of the pull request, e.g. `https://github.com/acme/widgets/pull/42`.
    pub url: String,
    /// Latest head commit; empty until resolved.
    #[serde(default, rename = "commitID")]
    pub commit_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestStatus {
    /// Public link serving the documentation preview.
    #[serde(default)]
    pub preview_link: String,
    /// Commit the preview was built for when the link was published.
    #[serde(default, rename = "commitID")]
    pub commit_id: String,
}

/// A pull request under preview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: PullRequestSpec,
    #[serde(default)]
    pub status: PullRequestStatus,
}

impl PullRequest {
    pub fn new(key: &ObjectKey, url: impl Into<String>) -> Self {
        Self {
            api_version: ResourceKind::PullRequest.api_version().to_owned(),
            kind: ResourceKind::PullRequest.name().to_owned(),
            metadata: ObjectMeta::new(key),
            spec: PullRequestSpec {
                url: url.into(),
                commit_id: String::new(),
            },
            status: PullRequestStatus::default(),
        }
    }

    /// `spec.commitID` has been resolved.
    pub fn has_commit(&self) -> bool {
        !self.spec.commit_id.is_empty()
    }
}

impl Resource for PullRequest {
    const KIND: ResourceKind = ResourceKind::PullRequest;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn validate_update(&self, stored: &Self) -> Result<(), String> {
        if !stored.spec.url.is_empty() && self.spec.url != stored.spec.url {
            return Err(format!(
                "spec.url is immutable (was '{}', got '{}')",
                stored.spec.url, self.spec.url
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Deployment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub image_pull_policy: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TemplateMeta {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PodSpec {
    #[serde(default)]
    pub containers: Vec<Container>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PodTemplateSpec {
    #[serde(default)]
    pub metadata: TemplateMeta,
    #[serde(default)]
    pub spec: PodSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeploymentSpec {
    pub replicas: i32,
    #[serde(default)]
    pub selector: LabelSelector,
    #[serde(default)]
    pub template: PodTemplateSpec,
}

/// Observed state, written by whatever runs the workload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub available_replicas: i32,
}

/// The preview workload generated for a [`PullRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: DeploymentSpec,
    #[serde(default)]
    pub status: DeploymentStatus,
}

impl Deployment {
    pub fn new(key: &ObjectKey, spec: DeploymentSpec) -> Self {
        Self {
            api_version: ResourceKind::Deployment.api_version().to_owned(),
            kind: ResourceKind::Deployment.name().to_owned(),
            metadata: ObjectMeta::new(key),
            spec,
            status: DeploymentStatus::default(),
        }
    }

    /// At least one replica reports available.
    pub fn is_available(&self) -> bool {
        self.status.available_replicas > 0
    }

    /// The first container, which runs the preview server.
    pub fn primary_container(&self) -> Option<&Container> {
        self.spec.template.spec.containers.first()
    }

    pub fn primary_container_mut(&mut self) -> Option<&mut Container> {
        self.spec.template.spec.containers.first_mut()
    }
}

impl Resource for Deployment {
    const KIND: ResourceKind = ResourceKind::Deployment;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_key_display() {
        assert_eq!(ObjectKey::new("default", "pr-42").to_string(), "default/pr-42");
    }

    #[test]
    fn pull_request_yaml_uses_commit_id_field_names() {
        let mut pr = PullRequest::new(&ObjectKey::new("default", "pr"), "https://h/o/r/pull/1");
        pr.spec.commit_id = "abc".into();
        pr.status.preview_link = "https://x".into();
        let yaml = serde_yaml::to_string(&pr).expect("serialize");
        assert!(yaml.contains("apiVersion: code.docbot.dev/v1alpha1"));
        assert!(yaml.contains("commitID: abc"));
        assert!(yaml.contains("previewLink: https://x"));
    }

    #[test]
    fn pull_request_without_status_or_commit_parses() {
        let yaml = "apiVersion: code.docbot.dev/v1alpha1\nkind: PullRequest\nmetadata:\n  name: a\n  namespace: b\nspec:\n  url: https://h/o/r/pull/1\n";
        let pr: PullRequest = serde_yaml::from_str(yaml).expect("parse");
        assert!(!pr.has_commit());
        assert!(pr.status.preview_link.is_empty());
        assert_eq!(pr.metadata.resource_version, 0);
    }

    #[test]
    fn url_is_immutable_once_set() {
        let key = ObjectKey::new("default", "pr");
        let stored = PullRequest::new(&key, "https://h/o/r/pull/1");
        let mut changed = stored.clone();
        assert!(changed.validate_update(&stored).is_ok());
        changed.spec.url = "https://h/o/r/pull/2".into();
        assert!(changed.validate_update(&stored).is_err());
    }

    #[test]
    fn controller_ref_points_at_owner() {
        let mut pr = PullRequest::new(&ObjectKey::new("ns", "pr"), "u");
        pr.metadata.uid = "uid-1".into();
        let owner = pr.controller_ref();
        assert_eq!(owner.kind, "PullRequest");
        assert_eq!(owner.name, "pr");
        assert_eq!(owner.uid, "uid-1");
        assert!(owner.controller);
    }

    #[test]
    fn deployment_availability() {
        let mut dep = Deployment::new(&ObjectKey::new("ns", "d"), DeploymentSpec::default());
        assert!(!dep.is_available());
        dep.status.available_replicas = 1;
        assert!(dep.is_available());
        assert!(dep.primary_container().is_none());
    }
}
