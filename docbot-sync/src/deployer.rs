//! Drives each tracked pull request toward a running preview.
//!
//! | Tracked resource             | Workload                       | Action                     |
//! |------------------------------|--------------------------------|----------------------------|
//! | missing                      |                                | none                       |
//! | `spec.commitID` empty        |                                | none, wait for commit      |
//! | commit set                   | missing                        | create                     |
//! | commit set                   | commit slot differs            | rewrite preview args       |
//! | commit set, status stale     | commit matches, available      | write preview link/commit  |
//! | anything else                |                                | none                       |
//!
//! Only one row acts per pass. The deployer never writes `spec.commitID`.
//!
//! A Deployment with no controller, or whose controller is an earlier
//! pull request of the same name, is adopted before any other row applies.
//! One controlled by anything else is never touched.

use std::sync::Arc;

use docbot_core::{Deployment, ObjectKey, PullRequest, PullRequestRef, Resource, ResourceStore};
use docbot_workload::{commit_slot, preview_args, WorkloadBuilder};

use crate::error::SyncError;
use crate::reconcile::{Outcome, Reconcile};

pub struct Deployer<S> {
    store: Arc<S>,
    builder: WorkloadBuilder,
}

impl<S: ResourceStore> Deployer<S> {
    pub fn new(store: Arc<S>, builder: WorkloadBuilder) -> Self {
        Self { store, builder }
    }

    fn create(&self, pr: &PullRequest, pr_ref: &PullRequestRef) -> Result<Outcome, SyncError> {
        let desired = self.builder.deployment_for(pr, pr_ref);
        self.store.create(&desired)?;
        tracing::info!(key = %pr.key(), commit = %pr.spec.commit_id, "created preview deployment");
        Ok(Outcome::Created)
    }

    fn adopt(&self, pr: &PullRequest, mut deployment: Deployment) -> Result<Outcome, SyncError> {
        let kind = PullRequest::KIND.name();
        deployment
            .metadata
            .owner_references
            .retain(|owner| !(owner.controller && owner.kind == kind));
        deployment.metadata.owner_references.push(pr.controller_ref());
        self.store.update(&deployment)?;
        tracing::info!(key = %pr.key(), "adopted orphaned preview deployment");
        Ok(Outcome::Updated)
    }

    fn roll(
        &self,
        pr: &PullRequest,
        pr_ref: &PullRequestRef,
        mut deployment: Deployment,
    ) -> Result<Outcome, SyncError> {
        let previous = commit_slot(&deployment).unwrap_or_default().to_owned();
        match deployment.primary_container_mut() {
            Some(container) => container.args = preview_args(pr_ref),
            None => {
                deployment.spec.template = self.builder.deployment_for(pr, pr_ref).spec.template;
            }
        }
        // The running replicas serve the old commit until the rollout lands.
        deployment.status.available_replicas = 0;
        self.store.update(&deployment)?;
        tracing::info!(
            key = %pr.key(),
            from = %previous,
            to = %pr.spec.commit_id,
            "updated preview deployment"
        );
        Ok(Outcome::Updated)
    }

    fn publish(&self, pr: &PullRequest, pr_ref: &PullRequestRef) -> Result<Outcome, SyncError> {
        let mut updated = pr.clone();
        if updated.status.preview_link.is_empty() {
            updated.status.preview_link = self.builder.preview_link(pr_ref);
        }
        updated.status.commit_id = pr.spec.commit_id.clone();
        self.store.update(&updated)?;
        tracing::info!(
            key = %pr.key(),
            link = %updated.status.preview_link,
            "preview available"
        );
        Ok(Outcome::StatusUpdated)
    }
}

impl<S: ResourceStore + 'static> Reconcile for Deployer<S> {
    fn name(&self) -> &'static str {
        "deployer"
    }

    fn reconcile(&self, key: &ObjectKey) -> Result<Outcome, SyncError> {
        let Some(pr) = self.store.try_get::<PullRequest>(key)? else {
            tracing::debug!(key = %key, "pull request gone; nothing to deploy");
            return Ok(Outcome::Deleted);
        };
        if !pr.has_commit() {
            tracing::info!(key = %key, "waiting for commit id to be resolved");
            return Ok(Outcome::WaitingForCommit);
        }
        let pr_ref = match PullRequestRef::parse(&pr.spec.url) {
            Ok(parsed) => parsed.with_commit(pr.spec.commit_id.clone()),
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "skipping pull request");
                return Ok(Outcome::Skipped {
                    reason: err.to_string(),
                });
            }
        };

        let Some(deployment) = self.store.try_get::<Deployment>(key)? else {
            return self.create(&pr, &pr_ref);
        };

        match deployment.metadata.controller_ref().cloned() {
            Some(owner) if owner.uid == pr.metadata.uid => {}
            None => return self.adopt(&pr, deployment),
            // An earlier pull request of this name; it is gone, since the one
            // stored now has a different uid.
            Some(owner)
                if owner.kind == PullRequest::KIND.name() && owner.name == pr.metadata.name =>
            {
                return self.adopt(&pr, deployment);
            }
            Some(owner) => {
                tracing::error!(
                    key = %key,
                    owner_kind = %owner.kind,
                    owner = %owner.name,
                    "deployment is controlled by another resource; leaving it alone"
                );
                return Ok(Outcome::Skipped {
                    reason: format!("deployment controlled by {} {}", owner.kind, owner.name),
                });
            }
        }

        if commit_slot(&deployment) != Some(pr.spec.commit_id.as_str()) {
            return self.roll(&pr, &pr_ref, deployment);
        }

        let stale = pr.status.preview_link.is_empty() || pr.status.commit_id != pr.spec.commit_id;
        if stale && deployment.is_available() {
            return self.publish(&pr, &pr_ref);
        }

        tracing::debug!(key = %key, "preview converged");
        Ok(Outcome::Unchanged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docbot_core::{FileStore, OwnerReference, StoreError};
    use docbot_workload::COMMIT_SLOT;
    use tempfile::TempDir;

    const URL: &str = "https://github.com/acme/widgets/pull/42";

    fn setup() -> (TempDir, Arc<FileStore>, Deployer<FileStore>) {
        let dir = TempDir::new().expect("tempdir");
        let store = Arc::new(FileStore::at(dir.path()));
        let deployer = Deployer::new(Arc::clone(&store), WorkloadBuilder::default());
        (dir, store, deployer)
    }

    fn key() -> ObjectKey {
        ObjectKey::new("default", "acme-widgets-pr-42")
    }

    fn track(store: &FileStore, commit: &str) -> PullRequest {
        let mut pr = PullRequest::new(&key(), URL);
        pr.spec.commit_id = commit.into();
        store.create(&pr).expect("create pr")
    }

    fn set_commit(store: &FileStore, commit: &str) {
        let mut pr: PullRequest = store.get(&key()).expect("get pr");
        pr.spec.commit_id = commit.into();
        store.update(&pr).expect("update pr");
    }

    fn mark_available(store: &FileStore) {
        let mut dep: Deployment = store.get(&key()).expect("get deployment");
        dep.status.replicas = 1;
        dep.status.available_replicas = 1;
        store.update(&dep).expect("update deployment");
    }

    #[test]
    fn missing_pull_request_is_not_an_error() {
        let (_dir, _store, deployer) = setup();
        assert_eq!(deployer.reconcile(&key()).expect("reconcile"), Outcome::Deleted);
    }

    #[test]
    fn waits_for_commit_without_creating() {
        let (_dir, store, deployer) = setup();
        track(&store, "");
        assert_eq!(
            deployer.reconcile(&key()).expect("reconcile"),
            Outcome::WaitingForCommit
        );
        assert!(store.try_get::<Deployment>(&key()).expect("get").is_none());
    }

    #[test]
    fn creates_owned_deployment_for_commit() {
        let (_dir, store, deployer) = setup();
        let pr = track(&store, "deadbeef");
        assert_eq!(deployer.reconcile(&key()).expect("reconcile"), Outcome::Created);

        let dep: Deployment = store.get(&key()).expect("deployment");
        assert_eq!(commit_slot(&dep), Some("deadbeef"));
        assert_eq!(
            dep.metadata.controller_ref().map(|o| o.uid.as_str()),
            Some(pr.metadata.uid.as_str())
        );
    }

    #[test]
    fn corrects_commit_drift_only() {
        let (_dir, store, deployer) = setup();
        track(&store, "aaa");
        deployer.reconcile(&key()).expect("create");
        mark_available(&store);
        let before: Deployment = store.get(&key()).expect("deployment");

        set_commit(&store, "bbb");
        assert_eq!(deployer.reconcile(&key()).expect("reconcile"), Outcome::Updated);

        let after: Deployment = store.get(&key()).expect("deployment");
        let args = &after.spec.template.spec.containers[0].args;
        assert_eq!(args[COMMIT_SLOT], "bbb");
        assert_eq!(args[..COMMIT_SLOT], before.spec.template.spec.containers[0].args[..COMMIT_SLOT]);
        assert_eq!(after.spec.replicas, before.spec.replicas);
        assert_eq!(
            after.spec.template.spec.containers[0].image,
            before.spec.template.spec.containers[0].image
        );
        assert_eq!(after.spec.template.spec.containers[1], before.spec.template.spec.containers[1]);
        assert!(!after.is_available());
    }

    #[test]
    fn short_argument_list_counts_as_drift() {
        let (_dir, store, deployer) = setup();
        track(&store, "aaa");
        deployer.reconcile(&key()).expect("create");
        let mut dep: Deployment = store.get(&key()).expect("deployment");
        dep.spec.template.spec.containers[0].args.truncate(COMMIT_SLOT);
        store.update(&dep).expect("truncate");

        assert_eq!(deployer.reconcile(&key()).expect("reconcile"), Outcome::Updated);
        let dep: Deployment = store.get(&key()).expect("deployment");
        assert_eq!(commit_slot(&dep), Some("aaa"));
    }

    #[test]
    fn publishes_link_once_available() {
        let (_dir, store, deployer) = setup();
        track(&store, "deadbeef");
        deployer.reconcile(&key()).expect("create");
        assert_eq!(deployer.reconcile(&key()).expect("not ready"), Outcome::Unchanged);

        mark_available(&store);
        assert_eq!(
            deployer.reconcile(&key()).expect("ready"),
            Outcome::StatusUpdated
        );
        let pr: PullRequest = store.get(&key()).expect("pr");
        assert_eq!(
            pr.status.preview_link,
            "https://acme-widgets-pr-42.serveo.net/pkg/github.com/acme/widgets"
        );
        assert_eq!(pr.status.commit_id, "deadbeef");

        let version = pr.metadata.resource_version;
        assert_eq!(deployer.reconcile(&key()).expect("again"), Outcome::Unchanged);
        let pr: PullRequest = store.get(&key()).expect("pr");
        assert_eq!(pr.metadata.resource_version, version);
    }

    #[test]
    fn link_is_kept_across_commit_changes() {
        let (_dir, store, deployer) = setup();
        track(&store, "aaa");
        deployer.reconcile(&key()).expect("create");
        mark_available(&store);
        deployer.reconcile(&key()).expect("publish");
        let link = store.get::<PullRequest>(&key()).expect("pr").status.preview_link;

        set_commit(&store, "bbb");
        deployer.reconcile(&key()).expect("roll");
        mark_available(&store);
        assert_eq!(
            deployer.reconcile(&key()).expect("republish"),
            Outcome::StatusUpdated
        );
        let pr: PullRequest = store.get(&key()).expect("pr");
        assert_eq!(pr.status.preview_link, link);
        assert_eq!(pr.status.commit_id, "bbb");
    }

    #[test]
    fn malformed_url_is_skipped() {
        let (_dir, store, deployer) = setup();
        let mut pr = PullRequest::new(&key(), "https://github.com/acme/widgets/issues/42");
        pr.spec.commit_id = "deadbeef".into();
        store.create(&pr).expect("create");

        let outcome = deployer.reconcile(&key()).expect("reconcile");
        assert!(matches!(outcome, Outcome::Skipped { .. }));
        assert!(store.try_get::<Deployment>(&key()).expect("get").is_none());
    }

    #[test]
    fn deployment_controlled_elsewhere_is_left_alone() {
        let (_dir, store, deployer) = setup();
        track(&store, "deadbeef");
        let mut foreign = Deployment::new(&key(), Default::default());
        foreign.spec.replicas = 3;
        foreign.metadata.owner_references.push(OwnerReference {
            api_version: "apps/v1".into(),
            kind: "ReplicaSet".into(),
            name: "other".into(),
            uid: "other-uid".into(),
            controller: true,
        });
        store.create(&foreign).expect("create foreign");

        let outcome = deployer.reconcile(&key()).expect("reconcile");
        assert!(matches!(outcome, Outcome::Skipped { .. }));
        let dep: Deployment = store.get(&key()).expect("deployment");
        assert_eq!(dep.spec.replicas, 3);
        assert_eq!(dep.metadata.resource_version, 1);
    }

    #[test]
    fn uncontrolled_deployment_is_adopted_then_rolled() {
        let (_dir, store, deployer) = setup();
        let pr = track(&store, "deadbeef");
        store
            .create(&Deployment::new(&key(), Default::default()))
            .expect("create bare");

        assert_eq!(deployer.reconcile(&key()).expect("adopt"), Outcome::Updated);
        let dep: Deployment = store.get(&key()).expect("deployment");
        assert_eq!(
            dep.metadata.controller_ref().map(|o| o.uid.as_str()),
            Some(pr.metadata.uid.as_str())
        );

        assert_eq!(deployer.reconcile(&key()).expect("roll"), Outcome::Updated);
        let dep: Deployment = store.get(&key()).expect("deployment");
        assert_eq!(commit_slot(&dep), Some("deadbeef"));
    }

    #[test]
    fn deployment_of_recreated_pull_request_is_adopted() {
        let (_dir, store, deployer) = setup();
        track(&store, "aaa");
        deployer.reconcile(&key()).expect("create");

        // Drop the pull request file without cascading, then track it again.
        std::fs::remove_file(store.resource_path(PullRequest::KIND, &key())).expect("rm");
        let recreated = track(&store, "bbb");

        assert_eq!(deployer.reconcile(&key()).expect("adopt"), Outcome::Updated);
        let dep: Deployment = store.get(&key()).expect("deployment");
        let controllers: Vec<_> = dep
            .metadata
            .owner_references
            .iter()
            .filter(|o| o.controller)
            .collect();
        assert_eq!(controllers.len(), 1);
        assert_eq!(controllers[0].uid, recreated.metadata.uid);

        assert_eq!(deployer.reconcile(&key()).expect("roll"), Outcome::Updated);
        let dep: Deployment = store.get(&key()).expect("deployment");
        assert_eq!(commit_slot(&dep), Some("bbb"));
    }

    #[test]
    fn store_failure_is_returned() {
        let (_dir, store, deployer) = setup();
        track(&store, "deadbeef");
        let path = store.resource_path(docbot_core::ResourceKind::PullRequest, &key());
        std::fs::write(&path, "{{ not yaml").expect("corrupt");
        let err = deployer.reconcile(&key()).unwrap_err();
        assert!(matches!(err, SyncError::Store(StoreError::Parse { .. })));
    }
}
