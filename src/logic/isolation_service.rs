use std::collections::HashMap;

use futures::future::{join_all, try_join_all};
use log::{debug, info, warn};
use serde::Serialize;

use crate::error::{PlatformError, Result};
use crate::logging::{traced, LogContext};
use crate::logic::dependency_graph::DependencyGraphService;
use crate::logic::fork_service::{ForkTarget, InstanceForkService, RepoFork};
use crate::logic::instance_service::InstanceService;
use crate::logic::platform::Platform;
use crate::model::{
    rewrite_hostnames, split_env, BranchSelection, ChildTarget, CreateIsolationRequest,
    GithubId, GithubPushInfo, Id, Instance, InstanceQuery, Isolation, IsolationState, Job,
    RepoSource, User, ISOLATION_PREFIX_SEPARATOR,
};
use crate::store::traits::{
    AutoIsolationConfigStore, InstanceStore, IsolationStore, Store,
};

const MODULE: &str = "IsolationService";

const ISOLATION_ACTION: &str = "isolation";

/// A freshly created isolation with its members.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IsolationGroup {
    pub isolation: Isolation,
    pub master: Instance,
    pub children: Vec<Instance>,
}

pub struct IsolationService;

impl IsolationService {
    /// Isolate the master, fork every declared child into the group, rewire
    /// the graph, then announce the group and redeploy the master.
    pub async fn create_isolation_and_emit_instance_updates<S: Store>(
        platform: &Platform<S>,
        request: CreateIsolationRequest,
        actor: &User,
    ) -> Result<IsolationGroup> {
        let ctx = LogContext::new(MODULE, "create_isolation_and_emit_instance_updates")
            .with("master", &request.master)
            .with("actor", actor.github_id);
        traced(&ctx, async {
            let targets = request.validate()?;
            let master = InstanceService::find_instance(platform, &request.master).await?;
            platform.ensure_model_access(actor, &master.owner).await?;
            if master.isolated.is_some() {
                return Err(PlatformError::conflict(format!(
                    "Instance {} is already isolated",
                    master.id
                )));
            }

            let isolation = Isolation::new(
                master.owner.clone(),
                actor.as_owner(),
                request.redeploy_on_killed,
            );
            platform.store.insert_isolation(isolation.clone()).await?;
            let Some(master) = platform
                .store
                .isolate_instance(&master.id, &isolation.id, true)
                .await?
            else {
                platform.store.delete_isolation(&isolation.id).await?;
                return Err(PlatformError::conflict(format!(
                    "Instance {} is already isolated",
                    master.id
                )));
            };
            info!(target: MODULE, "{} isolation {} created", ctx, isolation.id);

            let children = try_join_all(
                targets
                    .iter()
                    .map(|target| Self::fork_child(platform, &master, &isolation, target, actor)),
            )
            .await?;

            let master = Self::point_master_env_at_children(platform, master, &children).await?;
            DependencyGraphService::update_dependencies_for_isolation(platform, &master, &children)
                .await?;

            let members: Vec<Instance> = std::iter::once(master.clone())
                .chain(children.iter().cloned())
                .collect();
            Self::emit_update_for_instances(platform, &ctx, &members, actor.github_id, ISOLATION_ACTION)
                .await;

            platform
                .publish(Job::RedeployInstanceContainer {
                    instance_id: master.id.clone(),
                    session_user_github_id: actor.github_id,
                })
                .await?;

            Ok(IsolationGroup {
                isolation,
                master,
                children,
            })
        })
        .await
    }

    async fn fork_child<S: Store>(
        platform: &Platform<S>,
        master: &Instance,
        isolation: &Isolation,
        target: &ChildTarget,
        actor: &User,
    ) -> Result<Instance> {
        match target {
            ChildTarget::NonRepo { instance } => {
                Self::fork_non_repo_child(platform, master, isolation, instance, actor).await
            }
            ChildTarget::Repo { source, branch } => {
                Self::fork_repo_child(platform, master, isolation, source, branch, actor).await
            }
        }
    }

    pub async fn fork_non_repo_child<S: Store>(
        platform: &Platform<S>,
        master: &Instance,
        isolation: &Isolation,
        instance_id: &Id,
        actor: &User,
    ) -> Result<Instance> {
        let source = InstanceService::find_instance(platform, instance_id).await?;
        InstanceForkService::fork_non_repo_instance(
            platform,
            &source,
            &master.short_hash,
            &isolation.id,
            actor,
        )
        .await
    }

    /// Fork the resolved repository instance at the head of the selected branch.
    pub async fn fork_repo_child<S: Store>(
        platform: &Platform<S>,
        master: &Instance,
        isolation: &Isolation,
        source: &RepoSource,
        branch: &BranchSelection,
        actor: &User,
    ) -> Result<Instance> {
        let ctx = LogContext::new(MODULE, "fork_repo_child")
            .with("isolation", &isolation.id)
            .with("master", &master.id);
        traced(&ctx, async {
            let (instance, repo) = Self::resolve_repo_source(platform, master, source).await?;
            let branch = match branch {
                BranchSelection::Named(branch) => branch.clone(),
                BranchSelection::MatchMaster => master
                    .context_version
                    .main_app_code_version()
                    .map(|acv| acv.branch.clone())
                    .ok_or_else(|| {
                        PlatformError::validation(format!(
                            "Master {} has no repository to match a branch from",
                            master.id
                        ))
                    })?,
            };
            let head = platform.source_control.get_branch(&repo, &branch).await?;
            debug!(target: MODULE, "{} {}@{} is at {}", ctx, repo, branch, head.commit.sha);

            InstanceForkService::fork_repo_instance(
                platform,
                &instance,
                RepoFork {
                    repo,
                    branch,
                    commit: head.commit.sha,
                },
                ForkTarget::Isolation {
                    isolation_id: isolation.id.clone(),
                    master_short_hash: master.short_hash.clone(),
                },
                actor,
            )
            .await
        })
        .await
    }

    /// Instance to fork and the repository it is forked on.
    async fn resolve_repo_source<S: Store>(
        platform: &Platform<S>,
        master: &Instance,
        source: &RepoSource,
    ) -> Result<(Instance, String)> {
        match source {
            RepoSource::Instance(id) => {
                let instance = InstanceService::find_instance(platform, id).await?;
                let repo = instance
                    .context_version
                    .main_app_code_version()
                    .map(|acv| acv.repo.clone())
                    .ok_or_else(|| {
                        PlatformError::validation(format!(
                            "Instance {} has no repository to fork",
                            instance.id
                        ))
                    })?;
                Ok((instance, repo))
            }
            RepoSource::Repository { org, repo } => {
                let full_name = format!("{}/{}", org, repo);
                let mut candidates = InstanceService::find_master_pods_for_repo(
                    platform,
                    &full_name,
                    Some(master.owner.github),
                )
                .await?;
                match candidates.len() {
                    0 => Err(PlatformError::not_found(format!(
                        "No master instance found for {}",
                        full_name
                    ))),
                    1 => Ok((candidates.remove(0), full_name)),
                    n => Err(PlatformError::validation(format!(
                        "{} master instances found for {}, expected one",
                        n, full_name
                    ))),
                }
            }
        }
    }

    /// Rewrite master env references to a child's elastic hostname into the
    /// child's own hostname.
    async fn point_master_env_at_children<S: Store>(
        platform: &Platform<S>,
        master: Instance,
        children: &[Instance],
    ) -> Result<Instance> {
        let routes: HashMap<&str, &str> = children
            .iter()
            .map(|child| (child.elastic_hostname.as_str(), child.hostname.as_str()))
            .collect();
        let env = rewrite_env(&master.env, |token| {
            routes
                .get(token.to_lowercase().as_str())
                .map(|hostname| hostname.to_string())
        });
        if env == master.env {
            return Ok(master);
        }
        let mut updated = master;
        updated.env = env;
        platform.store.update_instance(&updated).await?;
        Ok(updated)
    }

    /// Emit an update per instance independently. Returns the instances whose
    /// update went out.
    pub async fn emit_update_for_instances<S: Store>(
        platform: &Platform<S>,
        ctx: &LogContext,
        instances: &[Instance],
        actor: GithubId,
        action: &str,
    ) -> Vec<Instance> {
        let ctx = ctx.child("emit_update_for_instances");
        let results = join_all(instances.iter().map(|instance| {
            platform.diagnostics.best_effort(
                &ctx,
                "instance update",
                InstanceService::emit_instance_update(platform, instance, actor, action),
            )
        }))
        .await;
        instances
            .iter()
            .zip(results)
            .filter_map(|(instance, emitted)| emitted.map(|_| instance.clone()))
            .collect()
    }

    /// Dissolve the group: queue child deletion, drop the record and restore
    /// the master's environment. Returns the de-isolated master.
    pub async fn delete_isolation<S: Store>(
        platform: &Platform<S>,
        isolation_id: &Id,
    ) -> Result<Instance> {
        let ctx = LogContext::new(MODULE, "delete_isolation").with("isolation", isolation_id);
        traced(&ctx, async {
            let members = platform
                .store
                .find_instances(&InstanceQuery::in_isolation(isolation_id))
                .await?;
            let (masters, children): (Vec<Instance>, Vec<Instance>) =
                members.into_iter().partition(Instance::is_group_master);
            let master = match masters.as_slice() {
                [master] => master.clone(),
                _ => {
                    return Err(PlatformError::not_found(format!(
                        "Isolation {} has no unique master",
                        isolation_id
                    )))
                }
            };

            let master = platform
                .store
                .deisolate_instance(&master.id)
                .await?
                .ok_or_else(|| PlatformError::not_found(format!("Instance {} not found", master.id)))?;
            for child in &children {
                platform
                    .publish(Job::DeleteInstance {
                        instance_id: child.id.clone(),
                    })
                    .await?;
                platform.graph.remove_node(&child.id).await?;
            }
            platform.store.delete_isolation(isolation_id).await?;

            let master = Self::remove_isolation_from_env(platform, master).await?;
            platform
                .publish(Job::RedeployInstanceContainer {
                    instance_id: master.id.clone(),
                    session_user_github_id: master.created_by.github,
                })
                .await?;
            info!(target: MODULE, "{} removed {} children", ctx, children.len());
            Ok(master)
        })
        .await
    }

    pub async fn delete_isolation_and_emit_instance_updates<S: Store>(
        platform: &Platform<S>,
        isolation_id: &Id,
        actor: &User,
    ) -> Result<Instance> {
        let ctx = LogContext::new(MODULE, "delete_isolation_and_emit_instance_updates")
            .with("isolation", isolation_id)
            .with("actor", actor.github_id);
        let isolation = Self::find_isolation(platform, isolation_id).await?;
        platform.ensure_model_access(actor, &isolation.owner).await?;
        let master = Self::delete_isolation(platform, isolation_id).await?;
        Self::emit_update_for_instances(
            platform,
            &ctx,
            std::slice::from_ref(&master),
            actor.github_id,
            ISOLATION_ACTION,
        )
        .await;
        Ok(master)
    }

    /// Strip the `<shortHash>--` prefix from env hostnames and re-derive the
    /// master's dependencies.
    async fn remove_isolation_from_env<S: Store>(
        platform: &Platform<S>,
        master: Instance,
    ) -> Result<Instance> {
        let prefix = format!("{}{}", master.short_hash, ISOLATION_PREFIX_SEPARATOR);
        let env = rewrite_env(&master.env, |token| {
            token
                .strip_prefix(prefix.as_str())
                .filter(|rest| !rest.is_empty())
                .map(str::to_string)
        });
        let master = if env == master.env {
            master
        } else {
            let mut updated = master;
            updated.env = env;
            platform.store.update_instance(&updated).await?;
            updated
        };
        DependencyGraphService::set_dependencies_from_environment(platform, &master).await?;
        Ok(master)
    }

    /// Move an active isolation to `killing` and stop every member.
    pub async fn kill_isolation<S: Store>(
        platform: &Platform<S>,
        isolation_id: &Id,
        redeploy_on_killed: bool,
    ) -> Result<Isolation> {
        let ctx = LogContext::new(MODULE, "kill_isolation")
            .with("isolation", isolation_id)
            .with("redeploy_on_killed", redeploy_on_killed);
        traced(&ctx, async {
            let Some(isolation) = platform
                .store
                .transition_isolation(
                    isolation_id,
                    IsolationState::Active,
                    IsolationState::Killing,
                    Some(redeploy_on_killed),
                )
                .await?
            else {
                let current = Self::find_isolation(platform, isolation_id).await?;
                return Err(PlatformError::conflict(format!(
                    "Isolation {} is already {}",
                    isolation_id,
                    current.state.as_str()
                )));
            };

            let members = platform
                .store
                .find_instances(&InstanceQuery::in_isolation(isolation_id))
                .await?;
            for member in &members {
                platform
                    .publish(Job::KillInstanceContainer {
                        instance_id: member.id.clone(),
                    })
                    .await?;
            }
            Ok(isolation)
        })
        .await
    }

    /// Finish a kill once no member is running. Returns whether this call
    /// queued the redeploy.
    pub async fn redeploy_if_all_killed<S: Store>(
        platform: &Platform<S>,
        isolation_id: &Id,
    ) -> Result<bool> {
        let ctx = LogContext::new(MODULE, "redeploy_if_all_killed").with("isolation", isolation_id);
        traced(&ctx, async {
            let isolation = Self::find_isolation(platform, isolation_id).await?;
            if !isolation.redeploy_on_killed || isolation.state != IsolationState::Killing {
                debug!(target: MODULE, "{} nothing to do in state {}", ctx, isolation.state.as_str());
                return Ok(false);
            }

            let members = platform
                .store
                .find_instances(&InstanceQuery::in_isolation(isolation_id))
                .await?;
            if members.iter().any(Instance::is_running_or_stopping) {
                return Ok(false);
            }

            let transitioned = platform
                .store
                .transition_isolation(
                    isolation_id,
                    IsolationState::Killing,
                    IsolationState::Killed,
                    None,
                )
                .await?;
            if transitioned.is_none() {
                return Ok(false);
            }
            platform
                .publish(Job::RedeployIsolation {
                    isolation_id: isolation_id.clone(),
                })
                .await?;
            Ok(true)
        })
        .await
    }

    pub async fn is_testing_isolation<S: Store>(
        platform: &Platform<S>,
        isolation_id: &Id,
    ) -> Result<bool> {
        let query = InstanceQuery {
            is_isolation_group_master: Some(true),
            ..InstanceQuery::in_isolation(isolation_id)
        };
        let masters = platform.store.find_instances(&query).await?;
        Ok(masters.iter().any(|master| master.is_testing))
    }

    /// Apply the parent's auto-isolation config to each new fork, one at a
    /// time. Failures are logged and skipped.
    pub async fn auto_isolate<S: Store>(
        platform: &Platform<S>,
        new_instances: &[Instance],
        push: &GithubPushInfo,
    ) -> Vec<Isolation> {
        let ctx = LogContext::new(MODULE, "auto_isolate")
            .with("repo", &push.repo)
            .with("branch", &push.branch);
        let mut created = Vec::new();
        for instance in new_instances {
            match Self::auto_isolate_one(platform, instance, push).await {
                Ok(Some(group)) => created.push(group.isolation),
                Ok(None) => {}
                Err(err) => {
                    warn!(target: MODULE, "{} auto-isolation of {} failed: {}", ctx, instance.id, err)
                }
            }
        }
        created
    }

    async fn auto_isolate_one<S: Store>(
        platform: &Platform<S>,
        instance: &Instance,
        push: &GithubPushInfo,
    ) -> Result<Option<IsolationGroup>> {
        let Some(parent_hash) = &instance.parent else {
            return Ok(None);
        };
        let Some(parent) = InstanceService::find_by_short_hash(platform, parent_hash).await? else {
            return Ok(None);
        };
        let Some(config) = platform.store.find_auto_isolation_config(&parent.id).await? else {
            return Ok(None);
        };
        let actor = platform
            .resolve_push_actor(push, &[&parent.owner, &instance.created_by])
            .await?;
        let group = Self::create_isolation_and_emit_instance_updates(
            platform,
            config.isolation_request(instance.id.clone()),
            &actor,
        )
        .await?;
        Ok(Some(group))
    }

    pub async fn find_isolation_and_assert_access<S: Store>(
        platform: &Platform<S>,
        id: &Id,
        actor: &User,
    ) -> Result<Isolation> {
        let isolation = Self::find_isolation(platform, id).await?;
        platform.ensure_model_access(actor, &isolation.owner).await?;
        Ok(isolation)
    }

    async fn find_isolation<S: Store>(platform: &Platform<S>, id: &Id) -> Result<Isolation> {
        platform
            .store
            .get_isolation(id)
            .await?
            .ok_or_else(|| PlatformError::not_found(format!("Isolation {} not found", id)))
    }
}

/// Rewrite hostname tokens in env values, keeping keys untouched.
fn rewrite_env<F>(env: &[String], mut map: F) -> Vec<String>
where
    F: FnMut(&str) -> Option<String>,
{
    env.iter()
        .map(|entry| match entry.split_once('=') {
            Some(_) => {
                let (key, value) = split_env(entry);
                format!("{}={}", key, rewrite_hostnames(value, &mut map))
            }
            None => entry.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::test_support::TestPlatform;
    use crate::model::{ContainerState, IsolationChildRequest};
    use crate::store::traits::GraphStore;

    #[test]
    fn test_rewrite_env_only_touches_values() {
        let env = vec![
            "abc123--db=abc123--db-staging-acme.local".to_string(),
            "FLAG".to_string(),
        ];
        let rewritten = rewrite_env(&env, |token| token.strip_prefix("abc123--").map(str::to_string));
        assert_eq!(rewritten, vec!["abc123--db=db-staging-acme.local", "FLAG"]);
    }

    #[tokio::test]
    async fn test_create_isolation_marks_one_master_and_all_children() {
        let tp = TestPlatform::new().await;
        let db = tp.master_instance("acme/db", "db").await;
        let redis = tp.non_repo_instance("redis").await;
        let api = tp
            .instance_with_env("acme/api", "api", vec![format!("DB=http://{}:5432", db.hostname)])
            .await;
        tp.scm.set_head("acme/db", "feature-x", "d00d");
        tp.queue.clear();

        let group = IsolationService::create_isolation_and_emit_instance_updates(
            &tp.platform,
            CreateIsolationRequest {
                master: api.id.clone(),
                children: vec![
                    IsolationChildRequest::repository("acme", "db", "feature-x"),
                    IsolationChildRequest::instance(redis.id.clone()),
                ],
                redeploy_on_killed: false,
            },
            &tp.user,
        )
        .await
        .unwrap();

        let members = tp
            .store
            .find_instances(&InstanceQuery::in_isolation(&group.isolation.id))
            .await
            .unwrap();
        assert_eq!(members.len(), 3);
        assert_eq!(members.iter().filter(|m| m.is_group_master()).count(), 1);
        assert!(members
            .iter()
            .find(|m| m.is_group_master())
            .map(|m| m.id == api.id)
            .unwrap());

        let db_child = group
            .children
            .iter()
            .find(|c| c.short_name == "db")
            .unwrap();
        assert_eq!(db_child.name, format!("{}--db", api.short_hash));
        assert_eq!(
            db_child.context_version.main_app_code_version().unwrap().commit.as_deref(),
            Some("d00d")
        );

        assert_eq!(group.master.env, vec![format!("DB=http://{}:5432", db_child.hostname)]);
        let deps = tp.store.dependencies(&api.id).await.unwrap();
        assert_eq!(deps.iter().map(|d| &d.instance_id).collect::<Vec<_>>(), vec![&db_child.id]);

        assert_eq!(tp.events.emitted().len(), 3);
        assert_eq!(
            tp.queue.jobs().last(),
            Some(&Job::RedeployInstanceContainer {
                instance_id: api.id.clone(),
                session_user_github_id: tp.user.github_id,
            })
        );
    }

    #[tokio::test]
    async fn test_already_isolated_master_is_rejected() {
        let tp = TestPlatform::new().await;
        let api = tp.master_instance("acme/api", "api").await;
        let request = CreateIsolationRequest {
            master: api.id.clone(),
            children: vec![],
            redeploy_on_killed: false,
        };
        IsolationService::create_isolation_and_emit_instance_updates(&tp.platform, request.clone(), &tp.user)
            .await
            .unwrap();
        let again =
            IsolationService::create_isolation_and_emit_instance_updates(&tp.platform, request, &tp.user)
                .await;
        assert!(matches!(again, Err(PlatformError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_ambiguous_repository_child_is_rejected() {
        let tp = TestPlatform::new().await;
        let api = tp.master_instance("acme/api", "api").await;
        tp.master_instance("acme/db", "db").await;
        tp.master_instance("acme/db", "db-replica").await;
        tp.scm.set_head("acme/db", "main", "abc");

        let result = IsolationService::create_isolation_and_emit_instance_updates(
            &tp.platform,
            CreateIsolationRequest {
                master: api.id.clone(),
                children: vec![IsolationChildRequest::repository("acme", "db", "main")],
                redeploy_on_killed: false,
            },
            &tp.user,
        )
        .await;
        assert!(matches!(result, Err(PlatformError::Validation(_))));

        let missing = IsolationService::create_isolation_and_emit_instance_updates(
            &tp.platform,
            CreateIsolationRequest {
                master: "nope".into(),
                children: vec![],
                redeploy_on_killed: false,
            },
            &tp.user,
        )
        .await;
        assert!(matches!(missing, Err(PlatformError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_emit_failures_do_not_fail_the_group() {
        let tp = TestPlatform::new().await;
        let redis = tp.non_repo_instance("redis").await;
        let api = tp.master_instance("acme/api", "api").await;
        tp.events.fail_for(&api.id);

        let group = IsolationService::create_isolation_and_emit_instance_updates(
            &tp.platform,
            CreateIsolationRequest {
                master: api.id.clone(),
                children: vec![IsolationChildRequest::instance(redis.id.clone())],
                redeploy_on_killed: false,
            },
            &tp.user,
        )
        .await
        .unwrap();

        let emitted: Vec<_> = tp.events.emitted().into_iter().map(|e| e.instance_id).collect();
        assert_eq!(emitted, vec![group.children[0].id.clone()]);
        assert_eq!(tp.platform.diagnostics.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_isolation_restores_original_dependency() {
        let tp = TestPlatform::new().await;
        let db = tp.master_instance("acme/db", "db").await;
        let api = tp
            .instance_with_env("acme/api", "api", vec![format!("DB={}", db.hostname)])
            .await;
        tp.scm.set_head("acme/db", "feature-x", "d00d");
        let group = IsolationService::create_isolation_and_emit_instance_updates(
            &tp.platform,
            CreateIsolationRequest {
                master: api.id.clone(),
                children: vec![IsolationChildRequest::repository("acme", "db", "feature-x")],
                redeploy_on_killed: false,
            },
            &tp.user,
        )
        .await
        .unwrap();
        tp.queue.clear();

        let master = IsolationService::delete_isolation_and_emit_instance_updates(
            &tp.platform,
            &group.isolation.id,
            &tp.user,
        )
        .await
        .unwrap();

        assert!(master.isolated.is_none());
        assert!(master.is_isolation_group_master.is_none());
        assert_eq!(master.env, vec![format!("DB={}", db.hostname)]);
        let deps = tp.store.dependencies(&api.id).await.unwrap();
        assert_eq!(deps, vec![db.as_dependency_node()]);
        assert!(tp.store.get_isolation(&group.isolation.id).await.unwrap().is_none());
        assert_eq!(
            tp.queue.jobs(),
            vec![
                Job::DeleteInstance {
                    instance_id: group.children[0].id.clone(),
                },
                Job::RedeployInstanceContainer {
                    instance_id: api.id.clone(),
                    session_user_github_id: api.created_by.github,
                },
            ]
        );

        let again = IsolationService::delete_isolation(&tp.platform, &group.isolation.id).await;
        assert!(matches!(again, Err(PlatformError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_kill_then_redeploy_once_everything_stopped() {
        let tp = TestPlatform::new().await;
        let api = tp.master_instance("acme/api", "api").await;
        let group = IsolationService::create_isolation_and_emit_instance_updates(
            &tp.platform,
            CreateIsolationRequest {
                master: api.id.clone(),
                children: vec![],
                redeploy_on_killed: false,
            },
            &tp.user,
        )
        .await
        .unwrap();
        let mut running = group.master.clone();
        running.container = Some(ContainerState {
            container_id: Some("c1".into()),
            running: true,
            stopping: false,
        });
        tp.store.update_instance(&running).await.unwrap();
        tp.queue.clear();

        let killing = IsolationService::kill_isolation(&tp.platform, &group.isolation.id, true)
            .await
            .unwrap();
        assert_eq!(killing.state, IsolationState::Killing);
        assert!(killing.redeploy_on_killed);
        assert_eq!(
            tp.queue.jobs(),
            vec![Job::KillInstanceContainer {
                instance_id: api.id.clone(),
            }]
        );
        let twice = IsolationService::kill_isolation(&tp.platform, &group.isolation.id, true).await;
        assert!(matches!(twice, Err(PlatformError::Conflict(_))));

        assert!(!IsolationService::redeploy_if_all_killed(&tp.platform, &group.isolation.id)
            .await
            .unwrap());

        running.container = Some(ContainerState::default());
        tp.store.update_instance(&running).await.unwrap();
        let (first, second) = futures::join!(
            IsolationService::redeploy_if_all_killed(&tp.platform, &group.isolation.id),
            IsolationService::redeploy_if_all_killed(&tp.platform, &group.isolation.id),
        );
        assert_eq!(first.unwrap() as u8 + second.unwrap() as u8, 1);
        assert_eq!(
            tp.queue
                .count(|job| matches!(job, Job::RedeployIsolation { .. })),
            1
        );
        let killed = tp.store.get_isolation(&group.isolation.id).await.unwrap().unwrap();
        assert_eq!(killed.state, IsolationState::Killed);
    }

    #[tokio::test]
    async fn test_is_testing_isolation_follows_master() {
        let tp = TestPlatform::new().await;
        let mut api = tp.master_instance("acme/api", "api").await;
        api.is_testing = true;
        tp.store.update_instance(&api).await.unwrap();
        let group = IsolationService::create_isolation_and_emit_instance_updates(
            &tp.platform,
            CreateIsolationRequest {
                master: api.id.clone(),
                children: vec![],
                redeploy_on_killed: false,
            },
            &tp.user,
        )
        .await
        .unwrap();
        assert!(IsolationService::is_testing_isolation(&tp.platform, &group.isolation.id)
            .await
            .unwrap());
    }
}
