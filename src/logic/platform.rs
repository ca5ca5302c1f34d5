use std::sync::Arc;

use chrono::Duration;

use crate::config::PlatformConfig;
use crate::diagnostics::Diagnostics;
use crate::error::{PlatformError, Result};
use crate::external::{
    Analytics, Fingerprinter, InstanceEvents, JobQueue, LogAnalytics, LogInstanceEvents,
    OwnerPermissions, PermissionChecker, Sha256Fingerprinter, SourceControl,
};
use crate::model::{GithubPushInfo, Job, Owner, User};
use crate::store::traits::{GraphStore, OrganizationStore, Store, UserStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformSettings {
    pub user_content_domain: String,
    pub enable_autofork_on_branch_push: bool,
    pub pending_build_timeout: Duration,
}

impl From<&PlatformConfig> for PlatformSettings {
    fn from(config: &PlatformConfig) -> Self {
        Self {
            user_content_domain: config.user_content_domain.clone(),
            enable_autofork_on_branch_push: config.enable_autofork_on_branch_push,
            pending_build_timeout: Duration::minutes(config.pending_build_timeout_minutes),
        }
    }
}

impl Default for PlatformSettings {
    fn default() -> Self {
        Self::from(&PlatformConfig::default())
    }
}

/// Collaborators shared by every orchestration component.
pub struct Platform<S: Store> {
    pub store: Arc<S>,
    pub graph: Arc<dyn GraphStore>,
    pub queue: Arc<dyn JobQueue>,
    pub source_control: Arc<dyn SourceControl>,
    pub permissions: Arc<dyn PermissionChecker>,
    pub analytics: Arc<dyn Analytics>,
    pub events: Arc<dyn InstanceEvents>,
    pub fingerprinter: Arc<dyn Fingerprinter>,
    pub settings: PlatformSettings,
    pub diagnostics: Diagnostics,
}

impl<S: Store> Platform<S> {
    pub fn new(
        store: Arc<S>,
        graph: Arc<dyn GraphStore>,
        queue: Arc<dyn JobQueue>,
        source_control: Arc<dyn SourceControl>,
        settings: PlatformSettings,
    ) -> Self {
        Self {
            store,
            graph,
            queue,
            source_control,
            permissions: Arc::new(OwnerPermissions),
            analytics: Arc::new(LogAnalytics),
            events: Arc::new(LogInstanceEvents),
            fingerprinter: Arc::new(Sha256Fingerprinter),
            settings,
            diagnostics: Diagnostics::default(),
        }
    }

    pub fn with_permissions(mut self, permissions: Arc<dyn PermissionChecker>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_analytics(mut self, analytics: Arc<dyn Analytics>) -> Self {
        self.analytics = analytics;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn InstanceEvents>) -> Self {
        self.events = events;
        self
    }

    pub fn with_fingerprinter(mut self, fingerprinter: Arc<dyn Fingerprinter>) -> Self {
        self.fingerprinter = fingerprinter;
        self
    }

    pub async fn publish(&self, job: Job) -> Result<()> {
        self.queue.publish(job).await?;
        Ok(())
    }

    pub async fn ensure_owner(&self, actor: &User, owner: &Owner) -> Result<()> {
        if self.permissions.is_owner_of(actor, owner).await? {
            Ok(())
        } else {
            Err(PlatformError::forbidden(format!(
                "user {} is not an owner of {}",
                actor.github_id, owner.github
            )))
        }
    }

    pub async fn ensure_model_access(&self, actor: &User, owner: &Owner) -> Result<()> {
        if self.permissions.has_model_access(actor, owner).await? {
            Ok(())
        } else {
            Err(PlatformError::forbidden(format!(
                "user {} has no access to resources of {}",
                actor.github_id, owner.github
            )))
        }
    }

    /// Pusher if they are a platform user, otherwise the first known fallback.
    pub async fn resolve_push_actor(&self, push: &GithubPushInfo, fallbacks: &[&Owner]) -> Result<User> {
        if let Some(github_id) = push.pusher_github_id() {
            if let Some(user) = self.store.find_user_by_github_id(github_id).await? {
                return Ok(user);
            }
        }
        for owner in fallbacks {
            if let Some(user) = self.store.find_user_by_github_id(owner.github).await? {
                return Ok(user);
            }
        }
        Err(PlatformError::not_found(format!(
            "no platform user found for push to {}@{}",
            push.repo, push.branch
        )))
    }

    /// Username used in generated hostnames for `owner`.
    pub async fn owner_username(&self, owner: &Owner) -> Result<String> {
        if let Some(username) = owner.username.as_ref().filter(|u| !u.is_empty()) {
            return Ok(username.clone());
        }
        if let Some(org) = self.store.find_organization(owner.github).await? {
            return Ok(org.login);
        }
        if let Some(user) = self.store.find_user_by_github_id(owner.github).await? {
            return Ok(user.username);
        }
        Err(PlatformError::validation(format!(
            "owner {} has no username",
            owner.github
        )))
    }
}
