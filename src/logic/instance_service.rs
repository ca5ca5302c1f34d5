use chrono::Utc;
use futures::future::try_join_all;
use log::{debug, info};

use crate::error::{PlatformError, Result};
use crate::logging::{traced, LogContext};
use crate::logic::dependency_graph::DependencyGraphService;
use crate::logic::platform::Platform;
use crate::model::{
    generate_id, generate_short_hash, staging_hostname, strip_isolation_prefix, Build,
    ContextVersion, GithubId, Id, Instance, InstanceQuery, Job, NewInstance, User,
};
use crate::store::traits::{BuildStore, ContextVersionStore, InstanceStore, Store};

const MODULE: &str = "InstanceService";

pub struct InstanceService;

impl InstanceService {
    /// Persist a new instance bound to `body.build`, derive its hostnames and
    /// dependencies, and queue its container when the build already succeeded.
    pub async fn create_instance<S: Store>(
        platform: &Platform<S>,
        body: NewInstance,
        actor: &User,
    ) -> Result<Instance> {
        let ctx = LogContext::new(MODULE, "create_instance")
            .with("name", &body.name)
            .with("build", &body.build);
        traced(&ctx, async {
            if body.name.trim().is_empty() {
                return Err(PlatformError::validation("instance name is required"));
            }
            let build = platform
                .store
                .get_build(&body.build)
                .await?
                .ok_or_else(|| PlatformError::not_found(format!("Build {} not found", body.build)))?;
            let owner = body.owner.clone().unwrap_or_else(|| build.owner.clone());
            platform.ensure_owner(actor, &owner).await?;

            let cv = Self::build_context_version(platform, &build).await?;
            let short_name = body
                .short_name
                .clone()
                .unwrap_or_else(|| strip_isolation_prefix(&body.name).to_string());
            let username = platform.owner_username(&owner).await?;
            let domain = &platform.settings.user_content_domain;

            let instance = Instance {
                id: generate_id(),
                lower_name: body.name.to_lowercase(),
                short_hash: generate_short_hash(),
                elastic_hostname: staging_hostname(&short_name, &username, domain),
                hostname: staging_hostname(&body.name, &username, domain),
                name: body.name,
                short_name,
                owner,
                created_by: actor.as_owner(),
                build: build.id,
                context_version: cv,
                parent: body.parent,
                master_pod: body.master_pod,
                auto_forked: body.auto_forked,
                locked: body.locked,
                isolated: body.isolated,
                is_isolation_group_master: body.is_isolation_group_master,
                is_testing: body.is_testing,
                env: body.env,
                container: None,
                created_at: Utc::now(),
            };
            platform.store.insert_instance(instance.clone()).await?;
            info!(target: MODULE, "{} created {} ({})", ctx, instance.id, instance.short_hash);

            DependencyGraphService::set_dependencies_from_environment(platform, &instance).await?;
            Self::deploy_if_built(platform, &instance, actor.github_id).await?;
            Ok(instance)
        })
        .await
    }

    /// Re-point the instance at `build` and deploy it if that build already succeeded.
    pub async fn update_build<S: Store>(
        platform: &Platform<S>,
        instance: &Instance,
        build: &Build,
        actor: &User,
    ) -> Result<Instance> {
        let ctx = LogContext::new(MODULE, "update_build")
            .with("instance", &instance.id)
            .with("build", &build.id);
        traced(&ctx, async {
            let mut updated = instance.clone();
            updated.build = build.id.clone();
            updated.context_version = Self::build_context_version(platform, build).await?;
            platform.store.update_instance(&updated).await?;
            Self::deploy_if_built(platform, &updated, actor.github_id).await?;
            Ok(updated)
        })
        .await
    }

    /// Copy the stored state of the bound context version into the instance.
    pub async fn refresh_context_version<S: Store>(
        platform: &Platform<S>,
        instance: &Instance,
    ) -> Result<Instance> {
        let cv = platform
            .store
            .get_context_version(&instance.context_version.id)
            .await?
            .ok_or_else(|| {
                PlatformError::not_found(format!(
                    "Context version {} not found",
                    instance.context_version.id
                ))
            })?;
        if cv == instance.context_version {
            return Ok(instance.clone());
        }

        let mut updated = instance.clone();
        updated.context_version = cv;
        platform.store.update_instance(&updated).await?;

        let session_user = updated
            .context_version
            .build
            .triggered_by
            .as_ref()
            .map(|owner| owner.github)
            .unwrap_or(updated.created_by.github);
        Self::deploy_if_built(platform, &updated, session_user).await?;
        Ok(updated)
    }

    pub async fn refresh_instances_for_context_versions<S: Store>(
        platform: &Platform<S>,
        context_version_ids: &[Id],
    ) -> Result<Vec<Instance>> {
        let ctx = LogContext::new(MODULE, "refresh_instances_for_context_versions")
            .with("context_versions", context_version_ids.join(","));
        traced(&ctx, async {
            let query = InstanceQuery {
                context_version_ids: Some(context_version_ids.to_vec()),
                ..InstanceQuery::default()
            };
            let instances = platform.store.find_instances(&query).await?;
            debug!(target: MODULE, "{} refreshing {} instances", ctx, instances.len());
            try_join_all(
                instances
                    .iter()
                    .map(|instance| Self::refresh_context_version(platform, instance)),
            )
            .await
        })
        .await
    }

    pub async fn emit_instance_update<S: Store>(
        platform: &Platform<S>,
        instance: &Instance,
        actor: GithubId,
        action: &str,
    ) -> Result<()> {
        platform.events.emit_update(instance, actor, action).await?;
        Ok(())
    }

    pub async fn find_instance<S: Store>(platform: &Platform<S>, id: &Id) -> Result<Instance> {
        platform
            .store
            .get_instance(id)
            .await?
            .ok_or_else(|| PlatformError::not_found(format!("Instance {} not found", id)))
    }

    pub async fn find_by_short_hash<S: Store>(
        platform: &Platform<S>,
        short_hash: &str,
    ) -> Result<Option<Instance>> {
        Ok(platform.store.find_instance_by_short_hash(short_hash).await?)
    }

    /// Master pods of `repo`, optionally limited to one owner.
    pub async fn find_master_pods_for_repo<S: Store>(
        platform: &Platform<S>,
        repo: &str,
        owner_github: Option<GithubId>,
    ) -> Result<Vec<Instance>> {
        let query = InstanceQuery {
            owner_github,
            repo: Some(repo.to_lowercase()),
            master_pod: Some(true),
            ..InstanceQuery::default()
        };
        let instances = platform.store.find_instances(&query).await?;
        Ok(instances
            .into_iter()
            .filter(|instance| instance.context_version.tracks_repo(repo))
            .collect())
    }

    /// Every instance building `repo` at `branch`: masters, forks and isolated copies.
    pub async fn find_instances_linked_to_branch<S: Store>(
        platform: &Platform<S>,
        repo: &str,
        branch: &str,
    ) -> Result<Vec<Instance>> {
        Ok(platform
            .store
            .find_instances(&InstanceQuery::tracking(repo, branch))
            .await?)
    }

    /// Forks tracking `repo` at `branch` that belong to no isolation.
    pub async fn find_forked_instances<S: Store>(
        platform: &Platform<S>,
        repo: &str,
        branch: &str,
    ) -> Result<Vec<Instance>> {
        let query = InstanceQuery {
            master_pod: Some(false),
            isolated: Some(None),
            ..InstanceQuery::tracking(repo, branch)
        };
        Ok(platform.store.find_instances(&query).await?)
    }

    async fn build_context_version<S: Store>(
        platform: &Platform<S>,
        build: &Build,
    ) -> Result<ContextVersion> {
        let cv_id = build.context_versions.first().ok_or_else(|| {
            PlatformError::validation(format!("Build {} has no context version", build.id))
        })?;
        platform
            .store
            .get_context_version(cv_id)
            .await?
            .ok_or_else(|| PlatformError::not_found(format!("Context version {} not found", cv_id)))
    }

    async fn deploy_if_built<S: Store>(
        platform: &Platform<S>,
        instance: &Instance,
        session_user: GithubId,
    ) -> Result<()> {
        if !instance.context_version.build.is_successful() {
            return Ok(());
        }
        platform
            .publish(Job::CreateInstanceContainer {
                instance_id: instance.id.clone(),
                context_version_id: instance.context_version.id.clone(),
                session_user_github_id: session_user,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::test_support::{TestPlatform, ORG_LOGIN};

    #[tokio::test]
    async fn test_create_instance_derives_hostnames_and_deploys() {
        let tp = TestPlatform::new().await;
        let master = tp.master_instance("acme/app", "App").await;

        assert_eq!(master.lower_name, "app");
        assert_eq!(master.short_name, "App");
        assert_eq!(master.short_hash.len(), 6);
        assert_eq!(
            master.elastic_hostname,
            format!("app-staging-{}.dockyard.local", ORG_LOGIN)
        );
        assert_eq!(master.hostname, master.elastic_hostname);
        assert_eq!(
            tp.queue.jobs(),
            vec![Job::CreateInstanceContainer {
                instance_id: master.id.clone(),
                context_version_id: master.context_version.id.clone(),
                session_user_github_id: tp.user.github_id,
            }]
        );
    }

    #[tokio::test]
    async fn test_isolated_name_keeps_elastic_hostname() {
        let tp = TestPlatform::new().await;
        let master = tp.master_instance("acme/app", "api").await;
        let body = NewInstance {
            name: format!("{}--api", master.short_hash),
            build: master.build.clone(),
            ..NewInstance::default()
        };
        let copy = InstanceService::create_instance(&tp.platform, body, &tp.user)
            .await
            .unwrap();
        assert_eq!(copy.short_name, "api");
        assert_eq!(copy.elastic_hostname, master.elastic_hostname);
        assert!(copy.hostname.starts_with(&format!("{}--api-staging", master.short_hash)));
    }

    #[tokio::test]
    async fn test_create_instance_validates_input() {
        let tp = TestPlatform::new().await;
        let missing_name = InstanceService::create_instance(
            &tp.platform,
            NewInstance {
                build: "b".into(),
                ..NewInstance::default()
            },
            &tp.user,
        )
        .await;
        assert!(matches!(missing_name, Err(PlatformError::Validation(_))));

        let missing_build = InstanceService::create_instance(
            &tp.platform,
            NewInstance {
                name: "api".into(),
                build: "nope".into(),
                ..NewInstance::default()
            },
            &tp.user,
        )
        .await;
        assert!(matches!(missing_build, Err(PlatformError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_finders_split_masters_forks_and_isolated() {
        let tp = TestPlatform::new().await;
        let master = tp.master_instance("acme/app", "app").await;
        let fork = tp.branch_instance(&master, "feature-x").await;
        let mut isolated = tp.branch_instance(&master, "feature-x").await;
        isolated.isolated = Some("iso".into());
        isolated.is_isolation_group_master = Some(false);
        tp.store.update_instance(&isolated).await.unwrap();

        let masters = InstanceService::find_master_pods_for_repo(&tp.platform, "Acme/App", None)
            .await
            .unwrap();
        assert_eq!(masters.iter().map(|i| &i.id).collect::<Vec<_>>(), vec![&master.id]);

        let linked =
            InstanceService::find_instances_linked_to_branch(&tp.platform, "acme/app", "Feature-X")
                .await
                .unwrap();
        assert_eq!(linked.len(), 2);

        let forks = InstanceService::find_forked_instances(&tp.platform, "acme/app", "feature-x")
            .await
            .unwrap();
        assert_eq!(forks.iter().map(|i| &i.id).collect::<Vec<_>>(), vec![&fork.id]);

        let by_hash = InstanceService::find_by_short_hash(&tp.platform, &master.short_hash)
            .await
            .unwrap();
        assert_eq!(by_hash.map(|i| i.id), Some(master.id));
    }
}
