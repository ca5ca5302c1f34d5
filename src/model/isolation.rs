use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PlatformError;
use crate::model::{generate_id, Id, Owner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationState {
    Active,
    Killing,
    Killed,
}

impl IsolationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationState::Active => "active",
            IsolationState::Killing => "killing",
            IsolationState::Killed => "killed",
        }
    }
}

/// Master instance plus forked children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Isolation {
    pub id: Id,
    pub owner: Owner,
    pub created_by: Owner,
    pub state: IsolationState,
    #[serde(default)]
    pub redeploy_on_killed: bool,
    pub created_at: DateTime<Utc>,
}

impl Isolation {
    pub fn new(owner: Owner, created_by: Owner, redeploy_on_killed: bool) -> Self {
        Self {
            id: generate_id(),
            owner,
            created_by,
            state: IsolationState::Active,
            redeploy_on_killed,
            created_at: Utc::now(),
        }
    }
}

/// One declared child of an isolation, as received.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IsolationChildRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Follow the branch of the master's primary source reference.
    #[serde(default)]
    pub match_branch: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoSource {
    Instance(Id),
    Repository { org: String, repo: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchSelection {
    Named(String),
    MatchMaster,
}

/// Validated child declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildTarget {
    /// Existing instance forked as-is.
    NonRepo { instance: Id },
    /// Repository instance forked at the head of a branch.
    Repo {
        source: RepoSource,
        branch: BranchSelection,
    },
}

impl IsolationChildRequest {
    pub fn instance(id: impl Into<Id>) -> Self {
        Self {
            instance: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn repository(org: &str, repo: &str, branch: &str) -> Self {
        Self {
            org: Some(org.to_string()),
            repo: Some(repo.to_string()),
            branch: Some(branch.to_string()),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<ChildTarget, PlatformError> {
        let branch = match (&self.branch, self.match_branch) {
            (Some(_), true) => {
                return Err(PlatformError::validation(
                    "child cannot set both branch and matchBranch",
                ))
            }
            (Some(branch), false) if branch.trim().is_empty() => {
                return Err(PlatformError::validation("child branch must not be empty"))
            }
            (Some(branch), false) => Some(BranchSelection::Named(branch.clone())),
            (None, true) => Some(BranchSelection::MatchMaster),
            (None, false) => None,
        };

        let source = match (&self.instance, &self.org, &self.repo) {
            (Some(instance), None, None) => RepoSource::Instance(instance.clone()),
            (None, Some(org), Some(repo)) if !org.is_empty() && !repo.is_empty() => {
                RepoSource::Repository {
                    org: org.clone(),
                    repo: repo.clone(),
                }
            }
            _ => {
                return Err(PlatformError::validation(
                    "child must name either an instance or an org and repo",
                ))
            }
        };

        match (source, branch) {
            (RepoSource::Instance(instance), None) => Ok(ChildTarget::NonRepo { instance }),
            (source, Some(branch)) => Ok(ChildTarget::Repo { source, branch }),
            (RepoSource::Repository { .. }, None) => Err(PlatformError::validation(
                "repository child requires a branch or matchBranch",
            )),
        }
    }
}

/// Input of `IsolationService::create_isolation_and_emit_instance_updates`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateIsolationRequest {
    pub master: Id,
    #[serde(default)]
    pub children: Vec<IsolationChildRequest>,
    #[serde(default)]
    pub redeploy_on_killed: bool,
}

impl CreateIsolationRequest {
    pub fn validate(&self) -> Result<Vec<ChildTarget>, PlatformError> {
        if self.master.trim().is_empty() {
            return Err(PlatformError::validation("master is required"));
        }
        self.children
            .iter()
            .map(IsolationChildRequest::validate)
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillIsolationRequest {
    #[serde(default)]
    pub redeploy_on_killed: bool,
}
