use chrono::{DateTime, Utc};
use ponos_config::Project;
use ponos_core::{FileUpdate, ImageUpgrade, PonosError, Result};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::manifest::rewrite_image_tags;
use crate::repository::RepositoryTools;

pub const DEFAULT_BRANCH_PREFIX: &str = "ponos-upgrade";

#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    /// Image repository to target tag.
    pub images: HashMap<String, String>,
    pub branch_prefix: String,
    pub title: Option<String>,
}

impl UpgradeRequest {
    pub fn new(images: HashMap<String, String>) -> Self {
        Self {
            images,
            branch_prefix: DEFAULT_BRANCH_PREFIX.to_string(),
            title: None,
        }
    }

    pub fn with_branch_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.branch_prefix = prefix.into();
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestSummary {
    pub pr_url: String,
    pub commit_sha: String,
    pub branch: String,
    pub updated_files: Vec<String>,
    pub upgrades: Vec<ImageUpgrade>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeOutcome {
    NoChanges,
    PullRequest(PullRequestSummary),
}

/// Parse `repo=tag`.
pub fn parse_image_spec(spec: &str) -> Result<(String, String)> {
    let invalid = || PonosError::InvalidArgument {
        field: "image",
        reason: format!("expected <repository>=<tag>, got '{}'", spec),
    };
    let (repo, tag) = spec.split_once('=').ok_or_else(invalid)?;
    let (repo, tag) = (repo.trim(), tag.trim());
    if repo.is_empty() || tag.is_empty() {
        return Err(invalid());
    }
    Ok((repo.to_string(), tag.to_string()))
}

pub fn branch_name(prefix: &str, at: DateTime<Utc>) -> String {
    format!("{}-{}", prefix, at.format("%Y%m%d%H%M%S"))
}

pub struct UpgradeWorkflow {
    tools: Arc<dyn RepositoryTools>,
    bot_name: String,
}

impl UpgradeWorkflow {
    pub fn new(tools: Arc<dyn RepositoryTools>, bot_name: impl Into<String>) -> Self {
        Self {
            tools,
            bot_name: bot_name.into(),
        }
    }

    /// Rewrite the project's manifests and open one pull request with every
    /// change.
    ///
    /// Files that cannot be read or parsed are skipped. Connection,
    /// credential and rate limit failures abort the run.
    #[instrument(skip(self, project, request), fields(project = %project.network))]
    pub async fn run(&self, project: &Project, request: &UpgradeRequest) -> Result<UpgradeOutcome> {
        if request.images.is_empty() {
            return Err(PonosError::InvalidArgument {
                field: "images",
                reason: "at least one image is required".into(),
            });
        }
        if project.paths.is_empty() {
            return Err(PonosError::InvalidArgument {
                field: "paths",
                reason: format!("project '{}' lists no manifest paths", display_name(project)),
            });
        }

        let (owner, repo) = (project.owner.as_str(), project.name.as_str());
        info!(
            "Checking {} manifest(s) in {}/{}@{}",
            project.paths.len(),
            owner,
            repo,
            project.branch
        );

        let mut updates = Vec::new();
        let mut upgrades = Vec::new();
        for path in &project.paths {
            let content = match self
                .tools
                .get_file_contents(owner, repo, path, Some(&project.branch))
                .await
            {
                Ok(content) => content,
                Err(e) if is_unreadable(&e) => {
                    warn!("Skipping {}: {}", path, e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            match rewrite_image_tags(path, &content, &request.images) {
                Ok(Some(rewrite)) => {
                    for upgrade in &rewrite.upgrades {
                        info!("{}: {} -> {}", path, upgrade.old_image, upgrade.new_image);
                    }
                    updates.push(FileUpdate::new(path.as_str(), rewrite.content));
                    upgrades.extend(rewrite.upgrades);
                }
                Ok(None) => debug!("No image changes in {}", path),
                Err(e) => warn!("Skipping {}: {}", path, e),
            }
        }

        if updates.is_empty() {
            info!("All images already at the requested tags");
            return Ok(UpgradeOutcome::NoChanges);
        }

        let branch = branch_name(&request.branch_prefix, Utc::now());
        self.tools
            .create_branch(owner, repo, &branch, Some(&project.branch))
            .await?;

        let commit_sha = self
            .tools
            .push_files(owner, repo, &branch, &commit_message(&upgrades), &updates)
            .await?;
        info!("Committed {} file(s) to {}: {}", updates.len(), branch, commit_sha);

        let title = request
            .title
            .clone()
            .unwrap_or_else(|| format!("Upgrade {} images", display_name(project)));
        let pr_url = self
            .tools
            .create_pull_request(
                owner,
                repo,
                &branch,
                &project.branch,
                &title,
                &pull_request_body(&self.bot_name, &upgrades),
            )
            .await?;
        info!("Opened pull request {}", pr_url);

        Ok(UpgradeOutcome::PullRequest(PullRequestSummary {
            pr_url,
            commit_sha,
            branch,
            updated_files: updates.into_iter().map(|u| u.path).collect(),
            upgrades,
        }))
    }
}

fn is_unreadable(e: &PonosError) -> bool {
    matches!(
        e,
        PonosError::ToolFailed { .. } | PonosError::UnexpectedShape { .. } | PonosError::Protocol(_)
    )
}

fn display_name(project: &Project) -> &str {
    if project.project_name.is_empty() {
        &project.network
    } else {
        &project.project_name
    }
}

fn commit_message(upgrades: &[ImageUpgrade]) -> String {
    let images: BTreeSet<&str> = upgrades.iter().map(|u| u.new_image.as_str()).collect();
    format!(
        "chore: upgrade to {}",
        images.into_iter().collect::<Vec<_>>().join(", ")
    )
}

fn pull_request_body(bot_name: &str, upgrades: &[ImageUpgrade]) -> String {
    let mut body = format!("Automated image upgrade opened by {}.\n\n", bot_name);
    body.push_str("| File | Current | New |\n| --- | --- | --- |\n");
    for upgrade in upgrades {
        body.push_str(&format!(
            "| `{}` | `{}` | `{}` |\n",
            upgrade.file, upgrade.old_image, upgrade.new_image
        ));
    }
    body
}
