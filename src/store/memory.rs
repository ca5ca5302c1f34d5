use std::collections::HashMap;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::model::{
    AutoIsolationConfig, Build, BuildCompletion, BuildContainer, BuildOutcome, ContextVersion, DependencyNode,
    GithubId, Id, Instance, InstanceQuery, Isolation, IsolationState, Organization, Owner, User,
};
use crate::store::traits::{
    AutoIsolationConfigStore, BuildClaim, BuildStart, BuildStore, ContextVersionStore,
    GraphStore, InstanceStore, IsolationStore, OrganizationStore, UserStore,
};

#[derive(Debug, Default)]
struct Documents {
    builds: HashMap<Id, Build>,
    context_versions: HashMap<Id, ContextVersion>,
    instances: HashMap<Id, Instance>,
    isolations: HashMap<Id, Isolation>,
    auto_isolation_configs: HashMap<Id, AutoIsolationConfig>,
    users: HashMap<GithubId, User>,
    organizations: HashMap<GithubId, Organization>,
    /// Outgoing edges per instance id.
    edges: HashMap<Id, Vec<DependencyNode>>,
}

/// In-process document and graph store. Each call holds the lock for its
/// whole read-check-write, which gives conditional updates their atomicity.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: RwLock<Documents>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instance_count(&self) -> usize {
        self.docs.read().instances.len()
    }

    pub fn build_count(&self) -> usize {
        self.docs.read().builds.len()
    }

    pub fn context_version_count(&self) -> usize {
        self.docs.read().context_versions.len()
    }
}

fn settle_build(build: &mut Build, outcome: BuildOutcome) {
    build.completed = Some(outcome.completed);
    build.failed = outcome.failed;
}

#[async_trait::async_trait]
impl BuildStore for MemoryStore {
    async fn insert_build(&self, build: Build) -> Result<()> {
        self.docs.write().builds.insert(build.id.clone(), build);
        Ok(())
    }

    async fn get_build(&self, id: &Id) -> Result<Option<Build>> {
        Ok(self.docs.read().builds.get(id).cloned())
    }

    async fn mark_build_started(
        &self,
        id: &Id,
        started_by: &Owner,
        at: DateTime<Utc>,
    ) -> Result<Option<Build>> {
        let mut docs = self.docs.write();
        let Some(build) = docs.builds.get_mut(id) else {
            return Ok(None);
        };
        if build.started.is_some() || build.completed.is_some() {
            return Ok(None);
        }
        build.started = Some(at);
        build.started_by = Some(started_by.clone());
        Ok(Some(build.clone()))
    }

    async fn replace_build_context_version(
        &self,
        id: &Id,
        from: &Id,
        to: &ContextVersion,
    ) -> Result<bool> {
        let mut docs = self.docs.write();
        let Some(build) = docs.builds.get_mut(id) else {
            return Ok(false);
        };
        if build.context_versions.as_slice() != std::slice::from_ref(from) {
            return Ok(false);
        }
        build.context_versions = vec![to.id.clone()];
        build.contexts = vec![to.context.clone()];
        Ok(true)
    }

    async fn complete_build(&self, id: &Id, outcome: BuildOutcome) -> Result<Option<Build>> {
        let mut docs = self.docs.write();
        match docs.builds.get_mut(id) {
            Some(build) if build.completed.is_none() => {
                settle_build(build, outcome);
                Ok(Some(build.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn complete_builds_for_context_versions(
        &self,
        context_version_ids: &[Id],
        outcome: BuildOutcome,
    ) -> Result<Vec<Build>> {
        let mut docs = self.docs.write();
        let mut settled = Vec::new();
        for build in docs.builds.values_mut() {
            let referenced = build
                .context_versions
                .iter()
                .any(|id| context_version_ids.contains(id));
            if referenced && build.completed.is_none() {
                settle_build(build, outcome);
                settled.push(build.clone());
            }
        }
        Ok(settled)
    }
}

#[async_trait::async_trait]
impl ContextVersionStore for MemoryStore {
    async fn insert_context_version(&self, context_version: ContextVersion) -> Result<()> {
        self.docs
            .write()
            .context_versions
            .insert(context_version.id.clone(), context_version);
        Ok(())
    }

    async fn get_context_version(&self, id: &Id) -> Result<Option<ContextVersion>> {
        Ok(self.docs.read().context_versions.get(id).cloned())
    }

    async fn start_context_version_build(
        &self,
        id: &Id,
        claim: BuildClaim,
    ) -> Result<BuildStart> {
        let mut docs = self.docs.write();
        let current = docs
            .context_versions
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("context version {} not found", id))?;
        if current.build.started.is_some() {
            return Ok(BuildStart::Duplicate(current));
        }

        if !claim.no_cache {
            let duplicate = docs
                .context_versions
                .values()
                .filter(|cv| {
                    current.can_share_build_with(cv, &claim.fingerprint, claim.stale_before)
                })
                .min_by_key(|cv| cv.build.started);
            if let Some(duplicate) = duplicate {
                return Ok(BuildStart::Duplicate(duplicate.clone()));
            }
        }

        let cv = docs
            .context_versions
            .get_mut(id)
            .ok_or_else(|| anyhow!("context version {} not found", id))?;
        cv.build.id = Some(claim.execution_id);
        cv.build.started = Some(Utc::now());
        cv.build.hash = Some(claim.fingerprint);
        cv.build.triggered_by = Some(claim.started_by);
        cv.build.message = claim.message;
        cv.build.triggered_action = claim.triggered_action;
        Ok(BuildStart::Started(cv.clone()))
    }

    async fn mark_context_version_errored(
        &self,
        id: &Id,
        error_message: &str,
    ) -> Result<Option<ContextVersion>> {
        let mut docs = self.docs.write();
        match docs.context_versions.get_mut(id) {
            Some(cv) if !cv.build.is_terminal() => {
                cv.build.failed = true;
                cv.build.completed = Some(Utc::now());
                cv.build.error_message = Some(error_message.to_string());
                Ok(Some(cv.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn set_build_container(
        &self,
        execution_id: &Id,
        container: &BuildContainer,
    ) -> Result<Vec<ContextVersion>> {
        let mut docs = self.docs.write();
        let mut updated = Vec::new();
        for cv in docs.context_versions.values_mut() {
            if cv.build.id.as_ref() != Some(execution_id) || cv.build.is_terminal() {
                continue;
            }
            cv.build_container = Some(container.clone());
            updated.push(cv.clone());
        }
        Ok(updated)
    }

    async fn complete_context_versions_by_execution(
        &self,
        execution_id: &Id,
        completion: &BuildCompletion,
    ) -> Result<Vec<ContextVersion>> {
        let mut docs = self.docs.write();
        let now = Utc::now();
        let mut settled = Vec::new();
        for cv in docs.context_versions.values_mut() {
            if cv.build.id.as_ref() != Some(execution_id) || cv.build.is_terminal() {
                continue;
            }
            cv.build.completed = Some(now);
            match completion {
                BuildCompletion::Succeeded { docker_image } => {
                    cv.build.docker_image = docker_image.clone();
                }
                BuildCompletion::Failed { error_message } => {
                    cv.build.failed = true;
                    cv.build.error_message = Some(error_message.clone());
                }
            }
            settled.push(cv.clone());
        }
        Ok(settled)
    }
}

#[async_trait::async_trait]
impl InstanceStore for MemoryStore {
    async fn insert_instance(&self, instance: Instance) -> Result<()> {
        self.docs
            .write()
            .instances
            .insert(instance.id.clone(), instance);
        Ok(())
    }

    async fn get_instance(&self, id: &Id) -> Result<Option<Instance>> {
        Ok(self.docs.read().instances.get(id).cloned())
    }

    async fn find_instance_by_short_hash(&self, short_hash: &str) -> Result<Option<Instance>> {
        Ok(self
            .docs
            .read()
            .instances
            .values()
            .find(|i| i.short_hash == short_hash)
            .cloned())
    }

    async fn find_instances(&self, query: &InstanceQuery) -> Result<Vec<Instance>> {
        let docs = self.docs.read();
        let mut found: Vec<Instance> = docs
            .instances
            .values()
            .filter(|i| query.matches(i))
            .cloned()
            .collect();
        found.sort_by_key(|i| i.created_at);
        Ok(found)
    }

    async fn update_instance(&self, instance: &Instance) -> Result<()> {
        let mut docs = self.docs.write();
        match docs.instances.get_mut(&instance.id) {
            Some(stored) => {
                *stored = instance.clone();
                Ok(())
            }
            None => Err(anyhow!("instance {} not found", instance.id)),
        }
    }

    async fn isolate_instance(
        &self,
        id: &Id,
        isolation_id: &Id,
        is_master: bool,
    ) -> Result<Option<Instance>> {
        let mut docs = self.docs.write();
        match docs.instances.get_mut(id) {
            Some(instance) if instance.isolated.is_none() => {
                instance.isolated = Some(isolation_id.clone());
                instance.is_isolation_group_master = Some(is_master);
                Ok(Some(instance.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn deisolate_instance(&self, id: &Id) -> Result<Option<Instance>> {
        let mut docs = self.docs.write();
        Ok(docs.instances.get_mut(id).map(|instance| {
            instance.isolated = None;
            instance.is_isolation_group_master = None;
            instance.clone()
        }))
    }
}

#[async_trait::async_trait]
impl IsolationStore for MemoryStore {
    async fn insert_isolation(&self, isolation: Isolation) -> Result<()> {
        self.docs
            .write()
            .isolations
            .insert(isolation.id.clone(), isolation);
        Ok(())
    }

    async fn get_isolation(&self, id: &Id) -> Result<Option<Isolation>> {
        Ok(self.docs.read().isolations.get(id).cloned())
    }

    async fn transition_isolation(
        &self,
        id: &Id,
        from: IsolationState,
        to: IsolationState,
        redeploy_on_killed: Option<bool>,
    ) -> Result<Option<Isolation>> {
        let mut docs = self.docs.write();
        match docs.isolations.get_mut(id) {
            Some(isolation) if isolation.state == from => {
                isolation.state = to;
                if let Some(redeploy) = redeploy_on_killed {
                    isolation.redeploy_on_killed = redeploy;
                }
                Ok(Some(isolation.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn delete_isolation(&self, id: &Id) -> Result<bool> {
        Ok(self.docs.write().isolations.remove(id).is_some())
    }
}

#[async_trait::async_trait]
impl AutoIsolationConfigStore for MemoryStore {
    async fn upsert_auto_isolation_config(&self, config: AutoIsolationConfig) -> Result<()> {
        self.docs
            .write()
            .auto_isolation_configs
            .insert(config.instance.clone(), config);
        Ok(())
    }

    async fn find_auto_isolation_config(
        &self,
        instance_id: &Id,
    ) -> Result<Option<AutoIsolationConfig>> {
        Ok(self
            .docs
            .read()
            .auto_isolation_configs
            .get(instance_id)
            .cloned())
    }
}

#[async_trait::async_trait]
impl UserStore for MemoryStore {
    async fn upsert_user(&self, user: User) -> Result<()> {
        self.docs.write().users.insert(user.github_id, user);
        Ok(())
    }

    async fn find_user_by_github_id(&self, github_id: GithubId) -> Result<Option<User>> {
        Ok(self.docs.read().users.get(&github_id).cloned())
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>> {
        Ok(self
            .docs
            .read()
            .users
            .values()
            .find(|u| u.username.eq_ignore_ascii_case(username))
            .cloned())
    }
}

#[async_trait::async_trait]
impl OrganizationStore for MemoryStore {
    async fn upsert_organization(&self, organization: Organization) -> Result<()> {
        self.docs
            .write()
            .organizations
            .insert(organization.github_id, organization);
        Ok(())
    }

    async fn find_organization(&self, github_id: GithubId) -> Result<Option<Organization>> {
        Ok(self.docs.read().organizations.get(&github_id).cloned())
    }
}

#[async_trait::async_trait]
impl GraphStore for MemoryStore {
    async fn dependencies(&self, instance_id: &Id) -> Result<Vec<DependencyNode>> {
        Ok(self
            .docs
            .read()
            .edges
            .get(instance_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn add_edge(&self, from: &DependencyNode, to: &DependencyNode) -> Result<()> {
        let mut docs = self.docs.write();
        let deps = docs.edges.entry(from.instance_id.clone()).or_default();
        deps.retain(|d| d.instance_id != to.instance_id);
        deps.push(to.clone());
        Ok(())
    }

    async fn remove_edge(&self, from_id: &Id, to_id: &Id) -> Result<bool> {
        let mut docs = self.docs.write();
        let Some(deps) = docs.edges.get_mut(from_id) else {
            return Ok(false);
        };
        let before = deps.len();
        deps.retain(|d| &d.instance_id != to_id);
        Ok(deps.len() != before)
    }

    async fn remove_node(&self, instance_id: &Id) -> Result<()> {
        let mut docs = self.docs.write();
        docs.edges.remove(instance_id);
        for deps in docs.edges.values_mut() {
            deps.retain(|d| &d.instance_id != instance_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{generate_id, AppCodeVersion};

    fn cv_with_fingerprint(fingerprint: Option<&str>) -> ContextVersion {
        let mut cv = ContextVersion::new(
            "ctx".into(),
            Owner::new(1),
            Owner::new(1),
            "FROM node".into(),
        );
        cv.app_code_versions
            .push(AppCodeVersion::new("acme/app", "master", Some("abc")));
        if let Some(fp) = fingerprint {
            cv.build.started = Some(Utc::now());
            cv.build.hash = Some(fp.to_string());
            cv.build.id = Some("exec-1".into());
        }
        cv
    }

    fn claim(fingerprint: &str, no_cache: bool) -> BuildClaim {
        BuildClaim {
            fingerprint: fingerprint.to_string(),
            execution_id: generate_id(),
            started_by: Owner::new(1),
            message: None,
            triggered_action: None,
            no_cache,
            stale_before: Utc::now() - chrono::Duration::minutes(30),
        }
    }

    #[tokio::test]
    async fn test_build_claim_returns_started_duplicate() {
        let store = MemoryStore::new();
        let running = cv_with_fingerprint(Some("fp"));
        let fresh = cv_with_fingerprint(None);
        store.insert_context_version(running.clone()).await.unwrap();
        store.insert_context_version(fresh.clone()).await.unwrap();

        match store
            .start_context_version_build(&fresh.id, claim("fp", false))
            .await
            .unwrap()
        {
            BuildStart::Duplicate(cv) => assert_eq!(cv.id, running.id),
            other => panic!("expected duplicate, got {:?}", other),
        }

        match store
            .start_context_version_build(&fresh.id, claim("fp", true))
            .await
            .unwrap()
        {
            BuildStart::Started(cv) => {
                assert_eq!(cv.id, fresh.id);
                assert!(cv.build.started.is_some());
            }
            other => panic!("expected started, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_build_claim_skips_hung_pending_build() {
        let store = MemoryStore::new();
        let mut hung = cv_with_fingerprint(Some("fp"));
        hung.build.started = Some(Utc::now() - chrono::Duration::hours(1));
        let fresh = cv_with_fingerprint(None);
        store.insert_context_version(hung.clone()).await.unwrap();
        store.insert_context_version(fresh.clone()).await.unwrap();

        match store
            .start_context_version_build(&fresh.id, claim("fp", false))
            .await
            .unwrap()
        {
            BuildStart::Started(cv) => assert_eq!(cv.id, fresh.id),
            other => panic!("expected started, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_build_container_keeps_old_pending_build_shareable() {
        let store = MemoryStore::new();
        let mut slow = cv_with_fingerprint(Some("fp"));
        slow.build.started = Some(Utc::now() - chrono::Duration::hours(1));
        let fresh = cv_with_fingerprint(None);
        store.insert_context_version(slow.clone()).await.unwrap();
        store.insert_context_version(fresh.clone()).await.unwrap();

        let container = BuildContainer {
            container_id: "builder-1".into(),
            dock: Some("dock-3".into()),
        };
        let updated = store
            .set_build_container(&"exec-1".to_string(), &container)
            .await
            .unwrap();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].build_container.as_ref(), Some(&container));

        match store
            .start_context_version_build(&fresh.id, claim("fp", false))
            .await
            .unwrap()
        {
            BuildStart::Duplicate(cv) => assert_eq!(cv.id, slow.id),
            other => panic!("expected duplicate, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mark_build_started_is_single_shot() {
        let store = MemoryStore::new();
        let build = Build::new(Owner::new(1), Owner::new(1), "cv".into(), "ctx".into());
        store.insert_build(build.clone()).await.unwrap();

        let first = store
            .mark_build_started(&build.id, &Owner::new(1), Utc::now())
            .await
            .unwrap();
        let second = store
            .mark_build_started(&build.id, &Owner::new(1), Utc::now())
            .await
            .unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_terminal_context_versions_are_not_settled_twice() {
        let store = MemoryStore::new();
        let cv = cv_with_fingerprint(Some("fp"));
        store.insert_context_version(cv.clone()).await.unwrap();

        let first = store
            .complete_context_versions_by_execution(
                &"exec-1".to_string(),
                &BuildCompletion::Failed {
                    error_message: "boom".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        let second = store
            .complete_context_versions_by_execution(
                &"exec-1".to_string(),
                &BuildCompletion::Succeeded { docker_image: None },
            )
            .await
            .unwrap();
        assert!(second.is_empty());
        let stored = store.get_context_version(&cv.id).await.unwrap().unwrap();
        assert!(stored.build.failed);
    }

    #[tokio::test]
    async fn test_graph_edges_are_idempotent() {
        let store = MemoryStore::new();
        let a = DependencyNode {
            instance_id: "a".into(),
            elastic_hostname: "a-staging-x.local".into(),
            hostname: "a-staging-x.local".into(),
        };
        let b = DependencyNode {
            instance_id: "b".into(),
            elastic_hostname: "b-staging-x.local".into(),
            hostname: "b-staging-x.local".into(),
        };
        store.add_edge(&a, &b).await.unwrap();
        store.add_edge(&a, &b).await.unwrap();
        assert_eq!(store.dependencies(&a.instance_id).await.unwrap().len(), 1);

        store.remove_node(&b.instance_id).await.unwrap();
        assert!(store.dependencies(&a.instance_id).await.unwrap().is_empty());
        assert!(!store.remove_edge(&a.instance_id, &b.instance_id).await.unwrap());
    }
}
