//! Node image upgrades: rewrite a project's manifests and open a pull request
//! through the repository tool server.

pub mod manifest;
pub mod repository;
pub mod workflow;

pub use manifest::{rewrite_image_tags, split_image, ManifestRewrite};
pub use repository::RepositoryTools;
pub use workflow::{
    branch_name, parse_image_spec, PullRequestSummary, UpgradeOutcome, UpgradeRequest,
    UpgradeWorkflow, DEFAULT_BRANCH_PREFIX,
};
