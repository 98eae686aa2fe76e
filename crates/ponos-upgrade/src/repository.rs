use async_trait::async_trait;
use ponos_core::{FileUpdate, Result};
use ponos_mcp::ToolClient;

/// Repository operations the upgrade workflow depends on.
#[async_trait]
pub trait RepositoryTools: Send + Sync {
    async fn get_file_contents(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        git_ref: Option<&str>,
    ) -> Result<String>;

    /// Must succeed when the branch already exists.
    async fn create_branch(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        from_branch: Option<&str>,
    ) -> Result<()>;

    async fn push_files(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        message: &str,
        files: &[FileUpdate],
    ) -> Result<String>;

    async fn create_pull_request(
        &self,
        owner: &str,
        repo: &str,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<String>;

    #[allow(clippy::too_many_arguments)]
    async fn create_or_update_file(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        content: &str,
        message: &str,
        branch: &str,
        sha: Option<&str>,
    ) -> Result<String>;
}

#[async_trait]
impl RepositoryTools for ToolClient {
    async fn get_file_contents(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        git_ref: Option<&str>,
    ) -> Result<String> {
        ToolClient::get_file_contents(self, owner, repo, path, git_ref).await
    }

    async fn create_branch(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        from_branch: Option<&str>,
    ) -> Result<()> {
        ToolClient::create_branch(self, owner, repo, branch, from_branch).await
    }

    async fn push_files(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        message: &str,
        files: &[FileUpdate],
    ) -> Result<String> {
        ToolClient::push_files(self, owner, repo, branch, message, files).await
    }

    async fn create_pull_request(
        &self,
        owner: &str,
        repo: &str,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<String> {
        ToolClient::create_pull_request(self, owner, repo, head, base, title, body).await
    }

    async fn create_or_update_file(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        content: &str,
        message: &str,
        branch: &str,
        sha: Option<&str>,
    ) -> Result<String> {
        ToolClient::create_or_update_file(self, owner, repo, path, content, message, branch, sha)
            .await
    }
}
