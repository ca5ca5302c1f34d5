use std::collections::HashSet;

use futures::future::join_all;
use log::{info, warn};
use serde::Serialize;
use serde_json::json;

use crate::error::{PlatformError, Result};
use crate::logging::{traced, LogContext};
use crate::logic::build_service::{BuildService, PushBuild};
use crate::logic::fork_service::InstanceForkService;
use crate::logic::instance_service::InstanceService;
use crate::logic::isolation_service::IsolationService;
use crate::logic::platform::Platform;
use crate::model::{
    GithubPushInfo, GithubPushPayload, Id, Instance, Isolation, Job, Organization, User,
};
use crate::store::traits::{OrganizationStore, Store, UserStore};

const MODULE: &str = "WebhookService";

const AUTO_DEPLOY_ACTION: &str = "autodeploy";
const PUSH_EVENT: &str = "github.push";

/// Result of a push that deployed and possibly forked.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeployOutcome {
    pub deployed: Vec<Instance>,
    pub forked: Vec<Instance>,
    pub isolations: Vec<Isolation>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GithookOutcome {
    Deleted { instance_ids: Vec<Id> },
    Deployed(DeployOutcome),
}

/// Push event pipeline: redeploy what tracks the branch, fork masters onto new
/// branches and isolate the forks.
pub struct WebhookService;

impl WebhookService {
    pub fn parse_github_push_data(payload: &GithubPushPayload) -> Result<GithubPushInfo> {
        GithubPushInfo::from_payload(payload)
    }

    pub async fn process_githook_event<S: Store>(
        platform: &Platform<S>,
        payload: &GithubPushPayload,
    ) -> Result<GithookOutcome> {
        let ctx = LogContext::new(MODULE, "process_githook_event");
        traced(&ctx, async {
            let push = Self::parse_github_push_data(payload)?;
            let ctx = ctx
                .clone()
                .with("repo", &push.repo)
                .with("branch", &push.branch)
                .with("deleted", push.deleted);

            Self::check_repo_organization_against_whitelist(platform, &push).await?;
            Self::report_push(platform, &ctx, &push).await;
            if push.is_tag() {
                return Err(PlatformError::NotImplemented(
                    "Cannot handle tags' related events".to_string(),
                ));
            }

            if push.deleted {
                let instance_ids = Self::auto_delete(platform, &push).await?;
                return Ok(GithookOutcome::Deleted { instance_ids });
            }
            let outcome = Self::do_auto_deploy_and_auto_fork(platform, &push).await?;
            Ok(GithookOutcome::Deployed(outcome))
        })
        .await
    }

    /// The repository's organization must be allow-listed and not suspended.
    pub async fn check_repo_organization_against_whitelist<S: Store>(
        platform: &Platform<S>,
        push: &GithubPushInfo,
    ) -> Result<Organization> {
        let org_id = push.repo_owner_org_id.ok_or_else(|| {
            PlatformError::forbidden(format!("Repository {} has no owning organization", push.repo))
        })?;
        match platform.store.find_organization(org_id).await? {
            Some(org) if org.can_run() => Ok(org),
            Some(org) => Err(PlatformError::forbidden(format!(
                "Organization {} is not allowed to run builds",
                org.login
            ))),
            None => Err(PlatformError::forbidden(format!(
                "Organization {} is not registered",
                org_id
            ))),
        }
    }

    /// Only pushes by registered users may create forks. The pusher is
    /// matched by login.
    pub async fn check_commit_pusher_is_runnable_user<S: Store>(
        platform: &Platform<S>,
        push: &GithubPushInfo,
    ) -> Result<User> {
        let username = push
            .commit_pusher
            .as_deref()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| PlatformError::forbidden("Committer username is empty"))?;
        platform
            .store
            .find_user_by_username(username)
            .await?
            .ok_or_else(|| {
                PlatformError::forbidden(format!(
                    "Commit author/pusher {} is not a platform user",
                    username
                ))
            })
    }

    async fn report_push<S: Store>(platform: &Platform<S>, ctx: &LogContext, push: &GithubPushInfo) {
        let properties = json!({
            "repo": push.repo,
            "branch": push.branch,
            "commit": push.commit,
            "pusher": push.commit_pusher,
            "deleted": push.deleted,
        });
        platform
            .diagnostics
            .best_effort(ctx, "analytics", platform.analytics.track(PUSH_EVENT, properties))
            .await;
    }

    /// Queue deletion of standalone forks of the deleted branch.
    pub async fn auto_delete<S: Store>(
        platform: &Platform<S>,
        push: &GithubPushInfo,
    ) -> Result<Vec<Id>> {
        let ctx = LogContext::new(MODULE, "auto_delete")
            .with("repo", &push.repo)
            .with("branch", &push.branch);
        traced(&ctx, async {
            let forks = InstanceService::find_forked_instances(platform, &push.repo, &push.branch)
                .await?;
            let mut deleted = Vec::with_capacity(forks.len());
            for fork in forks {
                platform
                    .publish(Job::DeleteInstance {
                        instance_id: fork.id.clone(),
                    })
                    .await?;
                deleted.push(fork.id);
            }
            Ok(deleted)
        })
        .await
    }

    /// Redeploy and fork concurrently. Both always run to completion; the
    /// deploy error wins when both fail.
    pub async fn do_auto_deploy_and_auto_fork<S: Store>(
        platform: &Platform<S>,
        push: &GithubPushInfo,
    ) -> Result<DeployOutcome> {
        let linked =
            InstanceService::find_instances_linked_to_branch(platform, &push.repo, &push.branch)
                .await?;
        let (deployed, forked) = futures::join!(
            Self::auto_deploy(platform, &linked, push),
            Self::auto_fork_and_isolate(platform, &linked, push),
        );
        let deployed = deployed?;
        let (forked, isolations) = forked?;
        Ok(DeployOutcome {
            deployed,
            forked,
            isolations,
        })
    }

    /// Rebuild every unlocked instance at the pushed commit. Returns the
    /// instances that were redeployed; fails only when all of them failed.
    pub async fn auto_deploy<S: Store>(
        platform: &Platform<S>,
        instances: &[Instance],
        push: &GithubPushInfo,
    ) -> Result<Vec<Instance>> {
        let ctx = LogContext::new(MODULE, "auto_deploy")
            .with("repo", &push.repo)
            .with("branch", &push.branch);
        traced(&ctx, async {
            let unlocked: Vec<&Instance> = instances.iter().filter(|i| !i.locked).collect();
            if unlocked.len() < instances.len() {
                info!(target: MODULE, "{} skipping {} locked instances", ctx, instances.len() - unlocked.len());
            }
            if unlocked.is_empty() {
                return Ok(Vec::new());
            }

            let results = join_all(
                unlocked
                    .iter()
                    .map(|instance| Self::deploy_instance(platform, instance, push)),
            )
            .await;

            let mut deployed = Vec::new();
            let mut failures = Vec::new();
            for (instance, result) in unlocked.iter().zip(results) {
                match result {
                    Ok(updated) => deployed.push(updated),
                    Err(err) => {
                        warn!(target: MODULE, "{} redeploy of {} failed: {}", ctx, instance.id, err);
                        failures.push(err);
                    }
                }
            }
            if deployed.is_empty() {
                if let Some(first) = failures.first() {
                    return Err(PlatformError::PartialBatch {
                        failed: failures.len(),
                        first: first.to_string(),
                    });
                }
            }
            Ok(deployed)
        })
        .await
    }

    async fn deploy_instance<S: Store>(
        platform: &Platform<S>,
        instance: &Instance,
        push: &GithubPushInfo,
    ) -> Result<Instance> {
        let PushBuild { user, build } = BuildService::create_and_build_context_version(
            platform,
            instance,
            push,
            AUTO_DEPLOY_ACTION,
        )
        .await?;
        InstanceService::update_build(platform, instance, &build, &user).await
    }

    /// Fork masters of the pushed repository that nothing tracks on this
    /// branch yet, then auto-isolate the forks.
    pub async fn auto_fork_and_isolate<S: Store>(
        platform: &Platform<S>,
        linked: &[Instance],
        push: &GithubPushInfo,
    ) -> Result<(Vec<Instance>, Vec<Isolation>)> {
        if !platform.settings.enable_autofork_on_branch_push {
            return Ok((Vec::new(), Vec::new()));
        }
        let ctx = LogContext::new(MODULE, "auto_fork_and_isolate")
            .with("repo", &push.repo)
            .with("branch", &push.branch);
        traced(&ctx, async {
            Self::check_commit_pusher_is_runnable_user(platform, push).await?;
            Self::check_repo_organization_against_whitelist(platform, push).await?;

            let linked: Vec<&Instance> = linked
                .iter()
                .filter(|instance| !instance.is_isolated_child())
                .collect();
            let tracked: HashSet<&Id> = linked
                .iter()
                .map(|instance| &instance.context_version.context)
                .collect();
            let forked_from: HashSet<&str> = linked
                .iter()
                .filter_map(|instance| instance.parent.as_deref())
                .collect();
            let masters: Vec<Instance> =
                InstanceService::find_master_pods_for_repo(platform, &push.repo, None)
                    .await?
                    .into_iter()
                    .filter(|master| {
                        !tracked.contains(&master.context_version.context)
                            && !forked_from.contains(master.short_hash.as_str())
                    })
                    .collect();
            if masters.is_empty() {
                return Ok((Vec::new(), Vec::new()));
            }

            let forked = InstanceForkService::auto_fork(platform, &masters, push).await?;
            let isolations = IsolationService::auto_isolate(platform, &forked, push).await;
            Ok((forked, isolations))
        })
        .await
    }
}
