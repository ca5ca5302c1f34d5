use std::collections::{HashMap, HashSet};

use log::{debug, error};

use crate::error::{PlatformError, Result};
use crate::logging::{traced, LogContext};
use crate::logic::platform::Platform;
use crate::model::{hostname_tokens, split_env, DependencyNode, Id, Instance, InstanceQuery};
use crate::store::traits::{InstanceStore, Store};

const MODULE: &str = "DependencyGraphService";

/// Edges between instances, keyed by elastic hostname rather than document id.
pub struct DependencyGraphService;

impl DependencyGraphService {
    pub async fn get_dependencies<S: Store>(
        platform: &Platform<S>,
        instance_id: &Id,
    ) -> Result<Vec<DependencyNode>> {
        Ok(platform.graph.dependencies(instance_id).await?)
    }

    pub async fn add_dependency<S: Store>(
        platform: &Platform<S>,
        instance: &Instance,
        dependency: &Instance,
    ) -> Result<()> {
        platform
            .graph
            .add_edge(&instance.as_dependency_node(), &dependency.as_dependency_node())
            .await?;
        Ok(())
    }

    pub async fn remove_dependency<S: Store>(
        platform: &Platform<S>,
        instance_id: &Id,
        dependency_id: &Id,
    ) -> Result<bool> {
        Ok(platform.graph.remove_edge(instance_id, dependency_id).await?)
    }

    /// Make the instance's outgoing edges exactly the owner's instances whose
    /// routable hostname appears in an env value.
    pub async fn set_dependencies_from_environment<S: Store>(
        platform: &Platform<S>,
        instance: &Instance,
    ) -> Result<Vec<DependencyNode>> {
        let ctx = LogContext::new(MODULE, "set_dependencies_from_environment")
            .with("instance", &instance.id);
        traced(&ctx, async {
            let referenced: HashSet<String> = instance
                .env
                .iter()
                .flat_map(|entry| hostname_tokens(split_env(entry).1))
                .map(str::to_lowercase)
                .collect();
            let current = platform.graph.dependencies(&instance.id).await?;
            if referenced.is_empty() && current.is_empty() {
                return Ok(current);
            }

            let desired: Vec<DependencyNode> = if referenced.is_empty() {
                Vec::new()
            } else {
                let query = InstanceQuery {
                    owner_github: Some(instance.owner.github),
                    ..InstanceQuery::default()
                };
                platform
                    .store
                    .find_instances(&query)
                    .await?
                    .iter()
                    .filter(|other| other.id != instance.id && referenced.contains(&other.hostname))
                    .map(Instance::as_dependency_node)
                    .collect()
            };

            let node = instance.as_dependency_node();
            for stale in current
                .iter()
                .filter(|dep| !desired.iter().any(|d| d.instance_id == dep.instance_id))
            {
                platform.graph.remove_edge(&instance.id, &stale.instance_id).await?;
            }
            for added in desired
                .iter()
                .filter(|dep| !current.iter().any(|c| c.instance_id == dep.instance_id))
            {
                platform.graph.add_edge(&node, added).await?;
            }
            debug!(target: MODULE, "{} now depends on {} instances", ctx, desired.len());
            Ok(desired)
        })
        .await
    }

    /// Re-point every group member's dependency on an instance sharing a
    /// member's elastic hostname at that member. Members are processed in
    /// order; the first failure aborts the rest.
    pub async fn update_dependencies_for_isolation<S: Store>(
        platform: &Platform<S>,
        master: &Instance,
        children: &[Instance],
    ) -> Result<()> {
        let ctx = LogContext::new(MODULE, "update_dependencies_for_isolation")
            .with("master", &master.id)
            .with("children", children.len());
        traced(&ctx, async {
            let group: Vec<&Instance> = std::iter::once(master).chain(children.iter()).collect();
            if let Some(missing) = group.iter().find(|i| i.elastic_hostname.is_empty()) {
                return Err(PlatformError::validation(format!(
                    "Instance {} is missing an elasticHostname",
                    missing.id
                )));
            }

            for node in &group {
                if let Err(err) = Self::rewire_node(platform, node, &group).await {
                    error!(target: MODULE, "{} failed to rewire {}: {}", ctx, node.id, err);
                    return Err(err);
                }
            }
            Ok(())
        })
        .await
    }

    async fn rewire_node<S: Store>(
        platform: &Platform<S>,
        node: &Instance,
        group: &[&Instance],
    ) -> Result<()> {
        let by_hostname: HashMap<String, DependencyNode> = platform
            .graph
            .dependencies(&node.id)
            .await?
            .into_iter()
            .map(|dep| (dep.elastic_hostname.clone(), dep))
            .collect();

        let from = node.as_dependency_node();
        for member in group.iter().filter(|member| member.id != node.id) {
            let Some(existing) = by_hostname.get(&member.elastic_hostname) else {
                continue;
            };
            if existing.instance_id == member.id {
                continue;
            }
            platform.graph.remove_edge(&node.id, &existing.instance_id).await?;
            platform.graph.add_edge(&from, &member.as_dependency_node()).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::test_support::TestPlatform;
    use crate::store::traits::GraphStore;

    #[tokio::test]
    async fn test_env_references_become_edges() {
        let tp = TestPlatform::new().await;
        let db = tp.master_instance("acme/db", "db").await;
        let api = tp
            .instance_with_env(
                "acme/api",
                "api",
                vec![
                    format!("DATABASE_URL=postgres://{}:5432/app", db.hostname),
                    "UNRELATED=x-db".to_string(),
                ],
            )
            .await;

        let deps = DependencyGraphService::get_dependencies(&tp.platform, &api.id)
            .await
            .unwrap();
        assert_eq!(deps, vec![db.as_dependency_node()]);

        let mut cleared = api.clone();
        cleared.env.clear();
        let deps = DependencyGraphService::set_dependencies_from_environment(&tp.platform, &cleared)
            .await
            .unwrap();
        assert!(deps.is_empty());
        assert!(tp.store.dependencies(&api.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_isolation_rewires_only_matching_hostnames() {
        let tp = TestPlatform::new().await;
        let db = tp.master_instance("acme/db", "db").await;
        let cache = tp.master_instance("acme/cache", "cache").await;
        let api = tp
            .instance_with_env(
                "acme/api",
                "api",
                vec![
                    format!("DB={}", db.hostname),
                    format!("CACHE={}", cache.hostname),
                ],
            )
            .await;
        let db_copy = tp.copy_of(&db, &format!("{}--db", api.short_hash)).await;

        DependencyGraphService::update_dependencies_for_isolation(
            &tp.platform,
            &api,
            std::slice::from_ref(&db_copy),
        )
        .await
        .unwrap();

        let mut deps: Vec<Id> = tp
            .store
            .dependencies(&api.id)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.instance_id)
            .collect();
        deps.sort();
        let mut expected = vec![db_copy.id.clone(), cache.id.clone()];
        expected.sort();
        assert_eq!(deps, expected);
    }

    #[tokio::test]
    async fn test_missing_elastic_hostname_is_rejected() {
        let tp = TestPlatform::new().await;
        let master = tp.master_instance("acme/app", "app").await;
        let mut child = master.clone();
        child.id = "child".into();
        child.elastic_hostname.clear();

        let result =
            DependencyGraphService::update_dependencies_for_isolation(&tp.platform, &master, &[child])
                .await;
        assert!(matches!(result, Err(PlatformError::Validation(msg)) if msg.contains("child")));
    }

    #[tokio::test]
    async fn test_add_and_remove_are_idempotent() {
        let tp = TestPlatform::new().await;
        let a = tp.master_instance("acme/a", "a").await;
        let b = tp.master_instance("acme/b", "b").await;

        DependencyGraphService::add_dependency(&tp.platform, &a, &b).await.unwrap();
        DependencyGraphService::add_dependency(&tp.platform, &a, &b).await.unwrap();
        assert_eq!(tp.store.dependencies(&a.id).await.unwrap().len(), 1);

        assert!(DependencyGraphService::remove_dependency(&tp.platform, &a.id, &b.id)
            .await
            .unwrap());
        assert!(!DependencyGraphService::remove_dependency(&tp.platform, &a.id, &b.id)
            .await
            .unwrap());
    }
}
