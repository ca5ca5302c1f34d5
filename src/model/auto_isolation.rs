use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{generate_id, CreateIsolationRequest, Id, IsolationChildRequest, Owner};

/// Desired isolation topology for a master instance. Read-only to the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoIsolationConfig {
    pub id: Id,
    pub instance: Id,
    pub owner: Owner,
    pub created_by: Owner,
    #[serde(default)]
    pub requested_dependencies: Vec<IsolationChildRequest>,
    #[serde(default)]
    pub redeploy_on_killed: bool,
    pub created_at: DateTime<Utc>,
}

impl AutoIsolationConfig {
    pub fn new(
        instance: Id,
        owner: Owner,
        requested_dependencies: Vec<IsolationChildRequest>,
        redeploy_on_killed: bool,
    ) -> Self {
        Self {
            id: generate_id(),
            instance,
            created_by: owner.clone(),
            owner,
            requested_dependencies,
            redeploy_on_killed,
            created_at: Utc::now(),
        }
    }

    /// Isolation request with `master` as the group master.
    pub fn isolation_request(&self, master: Id) -> CreateIsolationRequest {
        CreateIsolationRequest {
            master,
            children: self.requested_dependencies.clone(),
            redeploy_on_killed: self.redeploy_on_killed,
        }
    }
}
