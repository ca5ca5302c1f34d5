use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::PlatformConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchCommit {
    pub sha: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchInfo {
    pub name: String,
    pub commit: BranchCommit,
}

#[async_trait::async_trait]
pub trait SourceControl: Send + Sync {
    /// Head of `branch` in `repo` (`org/repo`).
    async fn get_branch(&self, repo: &str, branch: &str) -> Result<BranchInfo>;
}

/// GitHub REST client.
#[derive(Debug, Clone)]
pub struct GithubClient {
    http: reqwest::Client,
    api_url: String,
    token: Option<String>,
}

impl GithubClient {
    pub fn new(api_url: impl Into<String>, token: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("dockyard/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build GitHub HTTP client")?;
        Ok(Self {
            http,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn from_config(config: &PlatformConfig) -> Result<Self> {
        Self::new(config.github_api_url.clone(), config.github_token.clone())
    }
}

#[async_trait::async_trait]
impl SourceControl for GithubClient {
    async fn get_branch(&self, repo: &str, branch: &str) -> Result<BranchInfo> {
        let url = format!("{}/repos/{}/branches/{}", self.api_url, repo, branch);
        let mut request = self
            .http
            .get(&url)
            .header("Accept", "application/vnd.github+json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to fetch branch {} of {}", branch, repo))?
            .error_for_status()
            .with_context(|| format!("GitHub rejected branch lookup {}@{}", repo, branch))?;

        response
            .json::<BranchInfo>()
            .await
            .context("Failed to decode GitHub branch response")
    }
}

/// Fixed branch heads keyed by lower-cased `(repo, branch)`.
#[derive(Debug, Default)]
pub struct StaticSourceControl {
    heads: RwLock<HashMap<(String, String), String>>,
}

impl StaticSourceControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_head(&self, repo: &str, branch: &str, sha: &str) {
        self.heads
            .write()
            .insert((repo.to_lowercase(), branch.to_lowercase()), sha.to_string());
    }
}

#[async_trait::async_trait]
impl SourceControl for StaticSourceControl {
    async fn get_branch(&self, repo: &str, branch: &str) -> Result<BranchInfo> {
        let key = (repo.to_lowercase(), branch.to_lowercase());
        let sha = self
            .heads
            .read()
            .get(&key)
            .cloned()
            .ok_or_else(|| anyhow!("branch {} not found in {}", branch, repo))?;
        Ok(BranchInfo {
            name: branch.to_string(),
            commit: BranchCommit { sha },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_info_decodes_github_shape() {
        let info: BranchInfo = serde_json::from_value(serde_json::json!({
            "name": "main",
            "commit": { "sha": "abc123", "url": "https://api.github.com/..." },
            "protected": false
        }))
        .unwrap();
        assert_eq!(info.commit.sha, "abc123");
    }

    #[tokio::test]
    async fn test_static_source_control_is_case_insensitive() {
        let scm = StaticSourceControl::new();
        scm.set_head("Acme/Dep", "Feature", "def456");
        let info = scm.get_branch("acme/dep", "feature").await.unwrap();
        assert_eq!(info.commit.sha, "def456");
        assert!(scm.get_branch("acme/dep", "other").await.is_err());
    }

    #[test]
    fn test_client_trims_trailing_slash() {
        let client = GithubClient::new("https://github.example/api/", None).unwrap();
        assert_eq!(client.api_url, "https://github.example/api");
    }
}
