use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{generate_id, BuildInfo, Id, Owner, TriggeredAction};

/// User-facing handle bound to exactly one context version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: Id,
    pub owner: Owner,
    pub created_by: Owner,
    pub context_versions: Vec<Id>,
    #[serde(default)]
    pub contexts: Vec<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_by: Option<Owner>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed: bool,
    pub created_at: DateTime<Utc>,
}

impl Build {
    pub fn new(owner: Owner, created_by: Owner, context_version: Id, context: Id) -> Self {
        Self {
            id: generate_id(),
            owner,
            created_by,
            context_versions: vec![context_version],
            contexts: vec![context],
            started: None,
            started_by: None,
            completed: None,
            failed: false,
            created_at: Utc::now(),
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.started.is_some() && self.completed.is_none()
    }
}

/// Terminal state mirrored from a context version onto its builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildOutcome {
    pub completed: DateTime<Utc>,
    pub failed: bool,
}

impl BuildOutcome {
    /// `None` while the context version build is still running.
    pub fn from_build_info(info: &BuildInfo) -> Option<Self> {
        if let Some(completed) = info.completed {
            return Some(Self {
                completed,
                failed: info.failed,
            });
        }
        if info.failed {
            return Some(Self {
                completed: Utc::now(),
                failed: true,
            });
        }
        None
    }
}

/// Input of `BuildService::create_build`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateBuildRequest {
    /// Accepts the legacy single `context_version` field as well.
    #[serde(default)]
    pub context_versions: Vec<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_version: Option<Id>,
    pub owner: Owner,
}

impl CreateBuildRequest {
    pub fn for_context_version(context_version: Id, owner: Owner) -> Self {
        Self {
            context_versions: vec![context_version],
            context_version: None,
            owner,
        }
    }
}

/// Input of `BuildService::build_build`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BuildRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_action: Option<TriggeredAction>,
    /// Skip duplicate detection and always start a fresh build.
    #[serde(default)]
    pub no_cache: bool,
}

impl BuildRequest {
    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::default()
        }
    }

    /// Builds without an explicit trigger are manual ones.
    pub fn normalize_triggered_action(&mut self) {
        match self.triggered_action.as_mut() {
            Some(action) => {
                if !action.rebuild && action.app_code_version.is_none() && action.manual.is_none() {
                    action.manual = Some(true);
                }
            }
            None => {
                self.triggered_action = Some(TriggeredAction {
                    manual: Some(true),
                    ..TriggeredAction::default()
                });
            }
        }
    }
}
