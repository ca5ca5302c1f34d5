use serde::{Deserialize, Serialize};

use crate::error::PlatformError;
use crate::model::GithubId;

const BRANCH_REF_PREFIX: &str = "refs/heads/";
const TAG_REF_PREFIX: &str = "refs/tags/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GithubAccount {
    pub id: GithubId,
    pub login: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GithubRepository {
    pub full_name: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<GithubAccount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GithubCommit {
    pub id: String,
    #[serde(default)]
    pub message: String,
}

/// Push webhook body. Only the fields the pipeline reads are typed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GithubPushPayload {
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<GithubRepository>,
    /// Absent when a branch is deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_commit: Option<GithubCommit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<GithubAccount>,
    #[serde(default)]
    pub commits: Vec<serde_json::Value>,
    #[serde(default)]
    pub deleted: bool,
}

/// Push event reduced to what the pipeline acts on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GithubPushInfo {
    /// `org/repo`.
    pub repo: String,
    pub repo_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_owner_org_id: Option<GithubId>,
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_pusher: Option<String>,
    #[serde(default)]
    pub commit_log: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<GithubAccount>,
    #[serde(rename = "ref")]
    pub git_ref: String,
    #[serde(default)]
    pub deleted: bool,
}

impl GithubPushInfo {
    pub fn from_payload(payload: &GithubPushPayload) -> Result<Self, PlatformError> {
        let repository = payload
            .repository
            .as_ref()
            .ok_or_else(|| PlatformError::validation("push payload is missing repository"))?;
        let git_ref = payload
            .git_ref
            .as_ref()
            .ok_or_else(|| PlatformError::validation("push payload is missing ref"))?;

        Ok(Self {
            repo: repository.full_name.clone(),
            repo_name: repository.name.clone(),
            repo_owner_org_id: repository.owner.as_ref().map(|owner| owner.id),
            branch: git_ref
                .strip_prefix(BRANCH_REF_PREFIX)
                .unwrap_or(git_ref)
                .to_string(),
            commit: payload.head_commit.as_ref().map(|c| c.id.clone()),
            commit_pusher: payload.sender.as_ref().map(|s| s.login.clone()),
            commit_log: payload.commits.clone(),
            user: payload.sender.clone(),
            git_ref: git_ref.clone(),
            deleted: payload.deleted,
        })
    }

    pub fn is_tag(&self) -> bool {
        self.git_ref.starts_with(TAG_REF_PREFIX)
    }

    pub fn pusher_github_id(&self) -> Option<GithubId> {
        self.user.as_ref().map(|u| u.id)
    }

    /// Fields a push-triggered build needs: repo, branch, commit and the pusher's id.
    pub fn validate_for_build(&self) -> Result<&str, PlatformError> {
        if self.repo.is_empty() {
            return Err(PlatformError::validation("push info is missing repo"));
        }
        if self.branch.is_empty() {
            return Err(PlatformError::validation("push info is missing branch"));
        }
        if self.pusher_github_id().is_none() {
            return Err(PlatformError::validation("push info is missing user.id"));
        }
        self.commit
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| PlatformError::validation("push info is missing commit"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> GithubPushPayload {
        serde_json::from_value(serde_json::json!({
            "ref": "refs/heads/feature-x",
            "repository": {
                "full_name": "acme/app",
                "name": "app",
                "owner": { "id": 77, "login": "acme" }
            },
            "head_commit": { "id": "c0ffee", "message": "wip" },
            "sender": { "id": 5, "login": "octo" },
            "commits": [{ "id": "c0ffee" }]
        }))
        .unwrap()
    }

    #[test]
    fn test_from_payload_extracts_push_fields() {
        let info = GithubPushInfo::from_payload(&payload()).unwrap();
        assert_eq!(info.repo, "acme/app");
        assert_eq!(info.branch, "feature-x");
        assert_eq!(info.commit.as_deref(), Some("c0ffee"));
        assert_eq!(info.commit_pusher.as_deref(), Some("octo"));
        assert_eq!(info.repo_owner_org_id, Some(77));
        assert_eq!(info.commit_log.len(), 1);
        assert!(!info.is_tag());
        assert_eq!(info.validate_for_build().unwrap(), "c0ffee");
    }

    #[test]
    fn test_missing_ref_or_repository_is_rejected() {
        let mut p = payload();
        p.git_ref = None;
        assert!(matches!(
            GithubPushInfo::from_payload(&p),
            Err(PlatformError::Validation(_))
        ));

        let mut p = payload();
        p.repository = None;
        assert!(GithubPushInfo::from_payload(&p).is_err());
    }

    #[test]
    fn test_branch_deletion_has_no_commit() {
        let mut p = payload();
        p.head_commit = None;
        p.deleted = true;
        let info = GithubPushInfo::from_payload(&p).unwrap();
        assert!(info.deleted);
        assert!(info.validate_for_build().is_err());
    }

    #[test]
    fn test_tag_ref() {
        let mut p = payload();
        p.git_ref = Some("refs/tags/v1.0".into());
        assert!(GithubPushInfo::from_payload(&p).unwrap().is_tag());
    }
}
