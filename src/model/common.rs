use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub type Id = String;

/// GitHub account id of a user or organization.
pub type GithubId = i64;

pub fn generate_id() -> Id {
    Uuid::new_v4().simple().to_string()
}

/// Short stable identifier used to prefix isolated names and hostnames.
pub fn generate_short_hash() -> String {
    let digest = Sha256::digest(Uuid::new_v4().as_bytes());
    hex::encode(&digest[..3])
}

/// Account that owns (or created) a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub github: GithubId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl Owner {
    pub fn new(github: GithubId) -> Self {
        Self {
            github,
            username: None,
        }
    }

    pub fn with_username(github: GithubId, username: impl Into<String>) -> Self {
        Self {
            github,
            username: Some(username.into()),
        }
    }
}
