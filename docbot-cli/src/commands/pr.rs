//! `docbot pr` — add, inspect and remove tracked pull requests.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use docbot_core::store::validate_name;
use docbot_core::{Deployment, FileStore, ObjectKey, PullRequest, PullRequestRef, ResourceStore};

use super::home_dir;

pub const DEFAULT_NAMESPACE: &str = "default";

#[derive(Subcommand, Debug)]
pub enum PrCommand {
    /// Start tracking a pull request.
    Add(AddArgs),
    /// List tracked pull requests with their preview state.
    List(ListArgs),
    /// Print a tracked pull request as YAML.
    Get(KeyArgs),
    /// Stop tracking a pull request and remove its preview.
    Delete(KeyArgs),
}

#[derive(Args, Debug)]
pub struct AddArgs {
    /// Pull request URL, e.g. https://github.com/acme/widgets/pull/42.
    pub url: String,

    #[arg(long, short = 'n', default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Resource name. Defaults to `<org>-<repo>-pr-<number>`.
    #[arg(long)]
    pub name: Option<String>,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Only this namespace. Defaults to all namespaces.
    #[arg(long, short = 'n')]
    pub namespace: Option<String>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct KeyArgs {
    pub name: String,

    #[arg(long, short = 'n', default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,
}

impl KeyArgs {
    fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }
}

pub fn run(command: PrCommand) -> Result<()> {
    let store = FileStore::at(&home_dir()?);
    match command {
        PrCommand::Add(args) => add(&store, args),
        PrCommand::List(args) => list(&store, args),
        PrCommand::Get(args) => get(&store, args),
        PrCommand::Delete(args) => delete(&store, args),
    }
}

/// `<org>-<repo>-pr-<number>`, lowercased, with characters names may not
/// carry replaced by `-`.
pub fn default_name(pr: &PullRequestRef) -> String {
    let raw = pr.subdomain().to_ascii_lowercase();
    let sanitized: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    sanitized
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_owned()
}

fn add(store: &FileStore, args: AddArgs) -> Result<()> {
    let pr_ref = PullRequestRef::parse(&args.url)
        .with_context(|| format!("invalid pull request URL '{}'", args.url))?;
    let name = args.name.unwrap_or_else(|| default_name(&pr_ref));
    validate_name(&name).map_err(|reason| anyhow::anyhow!("invalid name '{name}': {reason}"))?;

    let key = ObjectKey::new(args.namespace, name);
    store
        .create(&PullRequest::new(&key, args.url))
        .with_context(|| format!("failed to track {pr_ref} as {key}"))?;

    println!("✓ Tracking {} as {}", pr_ref, key.to_string().bold());
    Ok(())
}

#[derive(Debug, Serialize)]
struct PrRow {
    namespace: String,
    name: String,
    url: String,
    commit: String,
    /// `None` until the workload exists.
    ready: Option<bool>,
    preview_link: String,
    created: Option<DateTime<Utc>>,
}

#[derive(Tabled)]
struct PrTableRow {
    #[tabled(rename = "namespace")]
    namespace: String,
    #[tabled(rename = "name")]
    name: String,
    #[tabled(rename = "pull request")]
    pull_request: String,
    #[tabled(rename = "commit")]
    commit: String,
    #[tabled(rename = "preview")]
    preview: String,
    #[tabled(rename = "link")]
    link: String,
}

fn list(store: &FileStore, args: ListArgs) -> Result<()> {
    let prs: Vec<PullRequest> = store
        .list(args.namespace.as_deref())
        .context("failed to list tracked pull requests")?;

    let mut rows = Vec::with_capacity(prs.len());
    for pr in prs {
        let key = pr.metadata.key();
        let deployment: Option<Deployment> = store
            .try_get(&key)
            .with_context(|| format!("failed to read deployment {key}"))?;
        rows.push(PrRow {
            namespace: key.namespace,
            name: key.name,
            url: pr.spec.url,
            commit: pr.spec.commit_id,
            ready: deployment.as_ref().map(Deployment::is_available),
            preview_link: pr.status.preview_link,
            created: pr.metadata.creation_timestamp,
        });
    }

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&rows).context("failed to serialize pull requests")?
        );
        return Ok(());
    }

    if rows.is_empty() {
        println!("No pull requests tracked.");
        println!("Run: docbot pr add <url>");
        return Ok(());
    }

    let table_rows: Vec<PrTableRow> = rows
        .into_iter()
        .map(|row| PrTableRow {
            pull_request: PullRequestRef::parse(&row.url)
                .map(|r| r.to_string())
                .unwrap_or_else(|_| format!("{} (invalid)", row.url)),
            commit: short_commit(&row.commit),
            preview: readiness_label(row.ready),
            link: if row.preview_link.is_empty() {
                "-".to_string()
            } else {
                row.preview_link
            },
            namespace: row.namespace,
            name: row.name,
        })
        .collect();
    let mut table = Table::new(table_rows);
    table.with(Style::rounded());
    println!("{table}");
    Ok(())
}

fn short_commit(commit: &str) -> String {
    if commit.is_empty() {
        return "pending".to_string();
    }
    commit.chars().take(12).collect()
}

fn readiness_label(ready: Option<bool>) -> String {
    match ready {
        None => "-".bright_black().to_string(),
        Some(false) => "starting".yellow().to_string(),
        Some(true) => "ready".green().to_string(),
    }
}

fn get(store: &FileStore, args: KeyArgs) -> Result<()> {
    let key = args.key();
    let pr: PullRequest = store
        .get(&key)
        .with_context(|| format!("failed to read pull request {key}"))?;
    let yaml = serde_yaml::to_string(&pr).context("failed to render YAML")?;
    print!("{yaml}");
    Ok(())
}

fn delete(store: &FileStore, args: KeyArgs) -> Result<()> {
    let key = args.key();
    store
        .delete::<PullRequest>(&key)
        .with_context(|| format!("failed to delete pull request {key}"))?;
    println!("✓ Deleted {key} and its preview");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pr_ref(url: &str) -> PullRequestRef {
        PullRequestRef::parse(url).expect("parse")
    }

    #[test]
    fn default_name_is_subdomain() {
        assert_eq!(
            default_name(&pr_ref("https://github.com/acme/widgets/pull/42")),
            "acme-widgets-pr-42"
        );
    }

    #[test]
    fn default_name_is_store_safe() {
        let name = default_name(&pr_ref("https://github.com/Acme_Corp/my_repo/pull/3"));
        assert_eq!(name, "acme-corp-my-repo-pr-3");
        assert!(validate_name(&name).is_ok());
    }

    #[test]
    fn short_commit_truncates() {
        assert_eq!(short_commit(""), "pending");
        assert_eq!(short_commit("0123456789abcdef"), "0123456789ab");
    }
}
