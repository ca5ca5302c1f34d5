use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::model::{
    AutoIsolationConfig, Build, BuildCompletion, BuildContainer, BuildOutcome, ContextVersion, DependencyNode,
    GithubId, Id, Instance, InstanceQuery, Isolation, IsolationState, Organization, Owner,
    TriggeredAction, User,
};

/// Everything recorded when a context version build is claimed.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildClaim {
    pub fingerprint: String,
    pub execution_id: Id,
    pub started_by: Owner,
    pub message: Option<String>,
    pub triggered_action: Option<TriggeredAction>,
    /// Skip the lookup for a content-identical build.
    pub no_cache: bool,
    /// Unfinished builds started earlier than this without a builder
    /// container are never reused.
    pub stale_before: DateTime<Utc>,
}

/// Outcome of an atomic build claim.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildStart {
    /// The claimed context version, now marked started.
    Started(ContextVersion),
    /// An already started, content-identical context version (possibly the
    /// requested one when another caller claimed it first).
    Duplicate(ContextVersion),
}

#[async_trait::async_trait]
pub trait BuildStore: Send + Sync {
    async fn insert_build(&self, build: Build) -> Result<()>;
    async fn get_build(&self, id: &Id) -> Result<Option<Build>>;
    /// Set `started` only if the build is neither started nor completed.
    /// Returns `None` when another caller got there first.
    async fn mark_build_started(
        &self,
        id: &Id,
        started_by: &Owner,
        at: DateTime<Utc>,
    ) -> Result<Option<Build>>;
    /// Point the build at `to` if it still references `from`.
    async fn replace_build_context_version(
        &self,
        id: &Id,
        from: &Id,
        to: &ContextVersion,
    ) -> Result<bool>;
    /// Settle one build unless it is already completed.
    async fn complete_build(&self, id: &Id, outcome: BuildOutcome) -> Result<Option<Build>>;
    /// Settle every unfinished build referencing any of the context versions.
    async fn complete_builds_for_context_versions(
        &self,
        context_version_ids: &[Id],
        outcome: BuildOutcome,
    ) -> Result<Vec<Build>>;
}

#[async_trait::async_trait]
pub trait ContextVersionStore: Send + Sync {
    async fn insert_context_version(&self, context_version: ContextVersion) -> Result<()>;
    async fn get_context_version(&self, id: &Id) -> Result<Option<ContextVersion>>;
    /// Claim the build of a context version, or return the oldest started
    /// build it may share (see `ContextVersion::can_share_build_with`).
    /// Claims for one fingerprint are serialized.
    async fn start_context_version_build(&self, id: &Id, claim: BuildClaim)
        -> Result<BuildStart>;
    /// Mark an unfinished context version build as failed.
    async fn mark_context_version_errored(
        &self,
        id: &Id,
        error_message: &str,
    ) -> Result<Option<ContextVersion>>;
    /// Record the builder container on every unfinished context version of
    /// one build execution.
    async fn set_build_container(
        &self,
        execution_id: &Id,
        container: &BuildContainer,
    ) -> Result<Vec<ContextVersion>>;
    /// Settle every unfinished context version of one build execution.
    async fn complete_context_versions_by_execution(
        &self,
        execution_id: &Id,
        completion: &BuildCompletion,
    ) -> Result<Vec<ContextVersion>>;
}

#[async_trait::async_trait]
pub trait InstanceStore: Send + Sync {
    async fn insert_instance(&self, instance: Instance) -> Result<()>;
    async fn get_instance(&self, id: &Id) -> Result<Option<Instance>>;
    async fn find_instance_by_short_hash(&self, short_hash: &str) -> Result<Option<Instance>>;
    async fn find_instances(&self, query: &InstanceQuery) -> Result<Vec<Instance>>;
    /// Replace the stored document.
    async fn update_instance(&self, instance: &Instance) -> Result<()>;
    /// Join an isolation. Returns `None` if the instance is already isolated.
    async fn isolate_instance(
        &self,
        id: &Id,
        isolation_id: &Id,
        is_master: bool,
    ) -> Result<Option<Instance>>;
    async fn deisolate_instance(&self, id: &Id) -> Result<Option<Instance>>;
}

#[async_trait::async_trait]
pub trait IsolationStore: Send + Sync {
    async fn insert_isolation(&self, isolation: Isolation) -> Result<()>;
    async fn get_isolation(&self, id: &Id) -> Result<Option<Isolation>>;
    /// Move `from → to` only if the stored state is still `from`.
    async fn transition_isolation(
        &self,
        id: &Id,
        from: IsolationState,
        to: IsolationState,
        redeploy_on_killed: Option<bool>,
    ) -> Result<Option<Isolation>>;
    async fn delete_isolation(&self, id: &Id) -> Result<bool>;
}

#[async_trait::async_trait]
pub trait AutoIsolationConfigStore: Send + Sync {
    async fn upsert_auto_isolation_config(&self, config: AutoIsolationConfig) -> Result<()>;
    async fn find_auto_isolation_config(&self, instance_id: &Id)
        -> Result<Option<AutoIsolationConfig>>;
}

#[async_trait::async_trait]
pub trait UserStore: Send + Sync {
    async fn upsert_user(&self, user: User) -> Result<()>;
    async fn find_user_by_github_id(&self, github_id: GithubId) -> Result<Option<User>>;
    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>>;
}

#[async_trait::async_trait]
pub trait OrganizationStore: Send + Sync {
    async fn upsert_organization(&self, organization: Organization) -> Result<()>;
    async fn find_organization(&self, github_id: GithubId) -> Result<Option<Organization>>;
}

/// Instance dependency edges, keyed by elastic hostname.
#[async_trait::async_trait]
pub trait GraphStore: Send + Sync {
    async fn dependencies(&self, instance_id: &Id) -> Result<Vec<DependencyNode>>;
    async fn add_edge(&self, from: &DependencyNode, to: &DependencyNode) -> Result<()>;
    async fn remove_edge(&self, from_id: &Id, to_id: &Id) -> Result<bool>;
    /// Drop a node with all its incoming and outgoing edges.
    async fn remove_node(&self, instance_id: &Id) -> Result<()>;
}

pub trait Store:
    BuildStore
    + ContextVersionStore
    + InstanceStore
    + IsolationStore
    + AutoIsolationConfigStore
    + UserStore
    + OrganizationStore
    + Send
    + Sync
{
}

impl<T> Store for T where
    T: BuildStore
        + ContextVersionStore
        + InstanceStore
        + IsolationStore
        + AutoIsolationConfigStore
        + UserStore
        + OrganizationStore
        + Send
        + Sync
{
}
