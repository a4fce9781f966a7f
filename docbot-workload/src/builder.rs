//! Desired state for the preview workload of one pull request.
//!
//! The preview container's argument list is
//! `["fetch_serve.sh", host, org, repo, number, commit]`; the commit sits at
//! [`COMMIT_SLOT`] so drift is a single positional comparison.

use std::collections::BTreeMap;

use docbot_core::{
    types::{LabelSelector, PodSpec, PodTemplateSpec, TemplateMeta},
    Container, Deployment, DeploymentSpec, PullRequest, PullRequestRef, Resource,
};

use crate::options::WorkloadOptions;

/// Index of the commit identifier in the preview container's arguments.
pub const COMMIT_SLOT: usize = 5;

/// Fixed replica count for previews.
pub const REPLICAS: i32 = 1;

pub const PREVIEW_CONTAINER: &str = "godoc";
pub const TUNNEL_CONTAINER: &str = "ssh";
const PREVIEW_SCRIPT: &str = "fetch_serve.sh";

/// Derived parameters of a preview workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadSpec {
    /// `{org, repo}`: selector and pod template labels.
    pub labels: BTreeMap<String, String>,
    /// `<org>-<repo>-pr-<number>`.
    pub subdomain: String,
    pub preview_args: Vec<String>,
    /// `<subdomain>:80:localhost:<port>`.
    pub tunnel_route: String,
    pub tunnel_args: Vec<String>,
}

/// Arguments for the preview container; the commit is empty when unresolved.
pub fn preview_args(pr: &PullRequestRef) -> Vec<String> {
    vec![
        PREVIEW_SCRIPT.to_owned(),
        pr.host.clone(),
        pr.organization.clone(),
        pr.repository.clone(),
        pr.number.to_string(),
        pr.commit_id.clone().unwrap_or_default(),
    ]
}

/// Commit encoded in a deployment's preview container, if it has one.
pub fn commit_slot(deployment: &Deployment) -> Option<&str> {
    deployment
        .primary_container()
        .and_then(|c| c.args.get(COMMIT_SLOT))
        .map(String::as_str)
}

#[derive(Debug, Clone, Default)]
pub struct WorkloadBuilder {
    options: WorkloadOptions,
}

impl WorkloadBuilder {
    pub fn new(options: WorkloadOptions) -> Self {
        Self { options }
    }

    pub fn build_spec(&self, pr: &PullRequestRef) -> WorkloadSpec {
        let labels = BTreeMap::from([
            ("org".to_owned(), pr.organization.clone()),
            ("repo".to_owned(), pr.repository.clone()),
        ]);
        let subdomain = pr.subdomain();
        let tunnel_route = format!("{subdomain}:80:localhost:{}", self.options.preview_port);
        let tunnel_args = vec![
            "-tt".to_owned(),
            "-o".to_owned(),
            "StrictHostKeyChecking=no".to_owned(),
            "-R".to_owned(),
            tunnel_route.clone(),
            self.options.tunnel_host.clone(),
        ];

        WorkloadSpec {
            labels,
            subdomain,
            preview_args: preview_args(pr),
            tunnel_route,
            tunnel_args,
        }
    }

    /// The deployment for `owner`, with a controller reference back to it.
    ///
    /// `owner` must already be persisted so its uid is known.
    pub fn deployment_for(&self, owner: &PullRequest, pr: &PullRequestRef) -> Deployment {
        let spec = self.build_spec(pr);
        let containers = vec![
            Container {
                name: PREVIEW_CONTAINER.to_owned(),
                image: self.options.preview_image.clone(),
                image_pull_policy: "Always".to_owned(),
                command: vec!["/bin/bash".to_owned()],
                args: spec.preview_args,
            },
            Container {
                name: TUNNEL_CONTAINER.to_owned(),
                image: self.options.tunnel_image.clone(),
                image_pull_policy: "Always".to_owned(),
                command: vec!["ssh".to_owned()],
                args: spec.tunnel_args,
            },
        ];

        let mut deployment = Deployment::new(
            &owner.key(),
            DeploymentSpec {
                replicas: REPLICAS,
                selector: LabelSelector {
                    match_labels: spec.labels.clone(),
                },
                template: PodTemplateSpec {
                    metadata: TemplateMeta {
                        labels: spec.labels.clone(),
                    },
                    spec: PodSpec { containers },
                },
            },
        );
        deployment.metadata.labels = spec.labels;
        deployment.metadata.owner_references.push(owner.controller_ref());
        deployment
    }

    /// `https://<subdomain>.<tunnel host>/pkg/<host>/<org>/<repo>`.
    pub fn preview_link(&self, pr: &PullRequestRef) -> String {
        format!(
            "https://{}.{}/pkg/{}/{}/{}",
            pr.subdomain(),
            self.options.tunnel_host,
            pr.host,
            pr.organization,
            pr.repository
        )
    }
}
