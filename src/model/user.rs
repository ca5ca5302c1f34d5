use serde::{Deserialize, Serialize};

use crate::model::{GithubId, Owner};

/// Platform account, keyed by GitHub id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub github_id: GithubId,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// GitHub ids of the organizations the user belongs to.
    #[serde(default)]
    pub organizations: Vec<GithubId>,
    #[serde(default)]
    pub moderator: bool,
}

impl User {
    pub fn new(github_id: GithubId, username: impl Into<String>) -> Self {
        Self {
            github_id,
            username: username.into(),
            email: None,
            organizations: Vec::new(),
            moderator: false,
        }
    }

    pub fn as_owner(&self) -> Owner {
        Owner::with_username(self.github_id, self.username.clone())
    }

    pub fn is_member_of(&self, org: GithubId) -> bool {
        self.organizations.contains(&org)
    }
}

/// Organization allow-list entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub github_id: GithubId,
    pub login: String,
    #[serde(default)]
    pub allowed: bool,
    #[serde(default)]
    pub suspended: bool,
}

impl Organization {
    pub fn allowed(github_id: GithubId, login: impl Into<String>) -> Self {
        Self {
            github_id,
            login: login.into(),
            allowed: true,
            suspended: false,
        }
    }

    pub fn can_run(&self) -> bool {
        self.allowed && !self.suspended
    }
}
