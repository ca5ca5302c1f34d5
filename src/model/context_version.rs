use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{generate_id, Id, Owner};

/// Source reference of a build: one repository at one branch/commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppCodeVersion {
    /// `org/repo`, as received from source control.
    pub repo: String,
    pub lower_repo: String,
    pub branch: String,
    pub lower_branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    /// Secondary repositories do not decide which branch a context version tracks.
    #[serde(default)]
    pub additional_repo: bool,
}

impl AppCodeVersion {
    pub fn new(repo: &str, branch: &str, commit: Option<&str>) -> Self {
        Self {
            repo: repo.to_string(),
            lower_repo: repo.to_lowercase(),
            branch: branch.to_string(),
            lower_branch: branch.to_lowercase(),
            commit: commit.map(str::to_string),
            additional_repo: false,
        }
    }

    pub fn tracks(&self, repo: &str, branch: &str) -> bool {
        self.lower_repo == repo.to_lowercase() && self.lower_branch == branch.to_lowercase()
    }

    pub fn set_branch(&mut self, branch: &str, commit: Option<&str>) {
        self.branch = branch.to_string();
        self.lower_branch = branch.to_lowercase();
        self.commit = commit.map(str::to_string);
    }
}

/// Push details recorded on a build that was not started by hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushedCodeVersion {
    pub repo: String,
    pub branch: String,
    pub commit: String,
    #[serde(default)]
    pub commit_log: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TriggeredAction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual: Option<bool>,
    #[serde(default)]
    pub rebuild: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_code_version: Option<PushedCodeVersion>,
}

/// Build state of a context version.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BuildInfo {
    /// Execution id shared by every context version settled by the same build run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<Owner>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_action: Option<TriggeredAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_image: Option<String>,
}

impl BuildInfo {
    pub fn is_terminal(&self) -> bool {
        self.completed.is_some() || self.failed
    }

    pub fn is_successful(&self) -> bool {
        self.completed.is_some() && !self.failed
    }
}

/// Terminal result reported by the build worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildCompletion {
    Succeeded { docker_image: Option<String> },
    Failed { error_message: String },
}

/// Image-builder container running a build execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildContainer {
    pub container_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dock: Option<String>,
}

/// Immutable build input/output snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextVersion {
    pub id: Id,
    pub context: Id,
    pub owner: Owner,
    pub created_by: Owner,
    #[serde(default)]
    pub app_code_versions: Vec<AppCodeVersion>,
    /// Resolved build instructions (the Dockerfile contents).
    #[serde(default)]
    pub build_instructions: String,
    #[serde(default)]
    pub advanced: bool,
    #[serde(default)]
    pub build: BuildInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_container: Option<BuildContainer>,
    pub created_at: DateTime<Utc>,
}

impl ContextVersion {
    pub fn new(context: Id, owner: Owner, created_by: Owner, build_instructions: String) -> Self {
        Self {
            id: generate_id(),
            context,
            owner,
            created_by,
            app_code_versions: Vec::new(),
            build_instructions,
            advanced: false,
            build: BuildInfo::default(),
            build_container: None,
            created_at: Utc::now(),
        }
    }

    /// Primary source reference; the one a push to its branch redeploys.
    pub fn main_app_code_version(&self) -> Option<&AppCodeVersion> {
        self.app_code_versions.iter().find(|acv| !acv.additional_repo)
    }

    pub fn tracks_branch(&self, repo: &str, branch: &str) -> bool {
        self.app_code_versions
            .iter()
            .any(|acv| acv.tracks(repo, branch))
    }

    pub fn tracks_repo(&self, repo: &str) -> bool {
        let repo = repo.to_lowercase();
        self.main_app_code_version()
            .map(|acv| acv.lower_repo == repo)
            .unwrap_or(false)
    }

    /// Fresh, unbuilt copy owned by `owner`. The context is kept unless the
    /// copy moves to another owner.
    pub fn deep_copy(&self, owner: Owner, created_by: Owner) -> Self {
        let context = if owner.github == self.owner.github {
            self.context.clone()
        } else {
            generate_id()
        };
        Self {
            id: generate_id(),
            context,
            owner,
            created_by,
            app_code_versions: self.app_code_versions.clone(),
            build_instructions: self.build_instructions.clone(),
            advanced: self.advanced,
            build: BuildInfo::default(),
            build_container: None,
            created_at: Utc::now(),
        }
    }

    /// Whether this unstarted context version may take over the build of
    /// `candidate`. Both must share owner, context and `advanced`. A pending
    /// candidate that started before `stale_before` without ever getting a
    /// builder container is treated as hung.
    pub fn can_share_build_with(
        &self,
        candidate: &ContextVersion,
        fingerprint: &str,
        stale_before: DateTime<Utc>,
    ) -> bool {
        let Some(started) = candidate.build.started else {
            return false;
        };
        candidate.id != self.id
            && candidate.owner.github == self.owner.github
            && candidate.context == self.context
            && candidate.advanced == self.advanced
            && !candidate.build.failed
            && candidate.build.hash.as_deref() == Some(fingerprint)
            && (candidate.build.completed.is_some()
                || candidate.build_container.is_some()
                || started >= stale_before)
    }

    /// Move the source reference for `repo` to a new branch and commit.
    pub fn update_app_code_version(&mut self, repo: &str, branch: &str, commit: &str) -> bool {
        let lower_repo = repo.to_lowercase();
        match self
            .app_code_versions
            .iter_mut()
            .find(|acv| acv.lower_repo == lower_repo)
        {
            Some(acv) => {
                acv.set_branch(branch, Some(commit));
                true
            }
            None => false,
        }
    }
}
