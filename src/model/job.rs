use serde::{Deserialize, Serialize};

use crate::model::{GithubId, Id};

/// Work handed to downstream workers. Payloads carry ids only; workers re-read
/// current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Job {
    DeleteInstance {
        instance_id: Id,
    },
    RedeployInstanceContainer {
        instance_id: Id,
        session_user_github_id: GithubId,
    },
    CreateInstanceContainer {
        instance_id: Id,
        context_version_id: Id,
        session_user_github_id: GithubId,
    },
    RedeployIsolation {
        isolation_id: Id,
    },
    CreateImageBuilderContainer {
        context_version_id: Id,
        session_user_github_id: GithubId,
    },
    KillInstanceContainer {
        instance_id: Id,
    },
}

impl Job {
    /// Queue name the job is published on.
    pub fn queue(&self) -> &'static str {
        match self {
            Job::DeleteInstance { .. } => "instance.delete",
            Job::RedeployInstanceContainer { .. } => "instance.container.redeploy",
            Job::CreateInstanceContainer { .. } => "instance.container.create",
            Job::RedeployIsolation { .. } => "isolation.redeploy",
            Job::CreateImageBuilderContainer { .. } => "image-builder.container.create",
            Job::KillInstanceContainer { .. } => "instance.container.kill",
        }
    }

    pub fn instance_id(&self) -> Option<&Id> {
        match self {
            Job::DeleteInstance { instance_id }
            | Job::RedeployInstanceContainer { instance_id, .. }
            | Job::CreateInstanceContainer { instance_id, .. }
            | Job::KillInstanceContainer { instance_id } => Some(instance_id),
            Job::RedeployIsolation { .. } | Job::CreateImageBuilderContainer { .. } => None,
        }
    }
}
