use chrono::Utc;
use log::{debug, warn};

use crate::error::{PlatformError, Result};
use crate::logging::{traced, LogContext};
use crate::logic::instance_service::InstanceService;
use crate::logic::platform::Platform;
use crate::model::{
    generate_id, Build, BuildCompletion, BuildContainer, BuildOutcome, BuildRequest, ContextVersion,
    CreateBuildRequest, GithubPushInfo, Id, Instance, Job, Owner, PushedCodeVersion,
    TriggeredAction, User,
};
use crate::store::traits::{BuildClaim, BuildStart, BuildStore, ContextVersionStore, Store};

const MODULE: &str = "BuildService";

/// Acting user and triggered build of a push-driven rebuild.
#[derive(Debug, Clone)]
pub struct PushBuild {
    pub user: User,
    pub build: Build,
}

/// Build state machine: claim, deduplicate or start, settle.
pub struct BuildService;

impl BuildService {
    pub async fn find_build_and_assert_access<S: Store>(
        platform: &Platform<S>,
        build_id: &Id,
        actor: &User,
    ) -> Result<Build> {
        let ctx = LogContext::new(MODULE, "find_build_and_assert_access")
            .with("build_id", build_id)
            .with("actor", actor.github_id);
        traced(&ctx, async {
            let build = platform
                .store
                .get_build(build_id)
                .await?
                .ok_or_else(|| PlatformError::not_found(format!("Build {} not found", build_id)))?;
            platform.ensure_model_access(actor, &build.owner).await?;
            Ok(build)
        })
        .await
    }

    pub async fn create_build<S: Store>(
        platform: &Platform<S>,
        request: CreateBuildRequest,
        actor: &User,
    ) -> Result<Build> {
        let ctx = LogContext::new(MODULE, "create_build")
            .with("owner", request.owner.github)
            .with("actor", actor.github_id);
        traced(&ctx, async {
            let mut ids = request.context_versions.clone();
            if let Some(id) = &request.context_version {
                if !ids.contains(id) {
                    ids.push(id.clone());
                }
            }
            let context_version_id = match ids.as_slice() {
                [id] => id.clone(),
                _ => {
                    return Err(PlatformError::validation(
                        "a build requires exactly one context version",
                    ))
                }
            };
            if request.owner.github <= 0 {
                return Err(PlatformError::validation("owner.github is required"));
            }
            if actor.github_id <= 0 {
                return Err(PlatformError::validation("createdBy.github is required"));
            }
            platform.ensure_owner(actor, &request.owner).await?;

            let cv = platform
                .store
                .get_context_version(&context_version_id)
                .await?
                .ok_or_else(|| {
                    PlatformError::not_found(format!(
                        "Context version {} not found",
                        context_version_id
                    ))
                })?;
            if cv.owner.github != request.owner.github {
                return Err(PlatformError::validation(
                    "Context version's owner must match build owner",
                ));
            }

            let build = Build::new(request.owner, actor.as_owner(), cv.id, cv.context);
            platform.store.insert_build(build.clone()).await?;
            Ok(build)
        })
        .await
    }

    /// Claim the build, reuse or start its context version build, then settle
    /// the build from the resulting context version.
    pub async fn build_build<S: Store>(
        platform: &Platform<S>,
        build_id: &Id,
        mut request: BuildRequest,
        actor: &User,
    ) -> Result<Build> {
        let ctx = LogContext::new(MODULE, "build_build")
            .with("build_id", build_id)
            .with("actor", actor.github_id);
        traced(&ctx, async {
            request.normalize_triggered_action();

            let build = platform
                .store
                .get_build(build_id)
                .await?
                .ok_or_else(|| PlatformError::not_found(format!("Build {} not found", build_id)))?;
            if build.completed.is_some() {
                return Err(PlatformError::conflict("Build is already completed"));
            }
            if build.started.is_some() {
                return Err(PlatformError::conflict("Build is already in progress"));
            }
            let context_version_id = match build.context_versions.as_slice() {
                [id] => id.clone(),
                other => {
                    return Err(PlatformError::validation(format!(
                        "Build {} references {} context versions, expected exactly one",
                        build.id,
                        other.len()
                    )))
                }
            };

            platform
                .store
                .mark_build_started(&build.id, &actor.as_owner(), Utc::now())
                .await?
                .ok_or_else(|| PlatformError::conflict("Build is already in progress"))?;

            let cv = platform
                .store
                .get_context_version(&context_version_id)
                .await?
                .ok_or_else(|| {
                    PlatformError::not_found(format!(
                        "Context version {} not found",
                        context_version_id
                    ))
                })?;

            let cv = if cv.build.started.is_some() {
                debug!(target: MODULE, "{} reusing started context version {}", ctx, cv.id);
                cv
            } else {
                Self::start_or_attach(platform, &ctx, &build.id, cv, &request, actor).await?
            };

            Self::settle_build(platform, &build.id, &cv).await?;
            platform
                .store
                .get_build(&build.id)
                .await?
                .ok_or_else(|| PlatformError::not_found(format!("Build {} not found", build.id)))
        })
        .await
    }

    /// Atomically claim the context version build, or find the started
    /// content-identical one. A claim queues the image builder.
    pub async fn start_context_version_build<S: Store>(
        platform: &Platform<S>,
        cv: &ContextVersion,
        request: &BuildRequest,
        actor: &User,
        no_cache: bool,
    ) -> Result<BuildStart> {
        let claim = BuildClaim {
            fingerprint: platform.fingerprinter.fingerprint(cv),
            execution_id: generate_id(),
            started_by: actor.as_owner(),
            message: request.message.clone(),
            triggered_action: request.triggered_action.clone(),
            no_cache,
            stale_before: Utc::now() - platform.settings.pending_build_timeout,
        };
        let start = platform
            .store
            .start_context_version_build(&cv.id, claim)
            .await?;
        if let BuildStart::Started(started) = &start {
            platform
                .publish(Job::CreateImageBuilderContainer {
                    context_version_id: started.id.clone(),
                    session_user_github_id: actor.github_id,
                })
                .await?;
        }
        Ok(start)
    }

    async fn start_or_attach<S: Store>(
        platform: &Platform<S>,
        ctx: &LogContext,
        build_id: &Id,
        cv: ContextVersion,
        request: &BuildRequest,
        actor: &User,
    ) -> Result<ContextVersion> {
        let duplicate = match Self::start_context_version_build(
            platform,
            &cv,
            request,
            actor,
            request.no_cache,
        )
        .await
        {
            Ok(BuildStart::Started(started)) => return Ok(started),
            Ok(BuildStart::Duplicate(same)) if same.id == cv.id => return Ok(same),
            Ok(BuildStart::Duplicate(duplicate)) => duplicate,
            Err(err) => return Self::mark_errored(platform, ctx, &cv, err).await,
        };

        let attach_error = match platform
            .store
            .replace_build_context_version(build_id, &cv.id, &duplicate)
            .await
        {
            Ok(true) => {
                debug!(target: MODULE, "{} attached to duplicate context version {}", ctx, duplicate.id);
                return Ok(duplicate);
            }
            Ok(false) => format!("build {} no longer references {}", build_id, cv.id),
            Err(err) => err.to_string(),
        };

        warn!(
            target: MODULE,
            "{} attaching to {} failed ({}), starting a fresh build", ctx, duplicate.id, attach_error
        );
        match Self::start_context_version_build(platform, &cv, request, actor, true).await {
            Ok(BuildStart::Started(fresh)) | Ok(BuildStart::Duplicate(fresh)) => Ok(fresh),
            Err(err) => Self::mark_errored(platform, ctx, &cv, err).await,
        }
    }

    /// Record a failed build start on the context version and carry on with
    /// its stored state.
    async fn mark_errored<S: Store>(
        platform: &Platform<S>,
        ctx: &LogContext,
        cv: &ContextVersion,
        err: PlatformError,
    ) -> Result<ContextVersion> {
        warn!(target: MODULE, "{} build start failed for {}: {}", ctx, cv.id, err);
        if let Some(errored) = platform
            .store
            .mark_context_version_errored(&cv.id, &err.to_string())
            .await?
        {
            return Ok(errored);
        }
        Ok(platform
            .store
            .get_context_version(&cv.id)
            .await?
            .unwrap_or_else(|| cv.clone()))
    }

    async fn settle_build<S: Store>(
        platform: &Platform<S>,
        build_id: &Id,
        cv: &ContextVersion,
    ) -> Result<()> {
        if let Some(outcome) = BuildOutcome::from_build_info(&cv.build) {
            platform.store.complete_build(build_id, outcome).await?;
        }
        Ok(())
    }

    /// Record the image-builder container of a running execution. Pending
    /// builds with a container stay shareable past the stale cutoff.
    pub async fn update_build_container<S: Store>(
        platform: &Platform<S>,
        execution_id: &Id,
        container: BuildContainer,
    ) -> Result<Vec<ContextVersion>> {
        let ctx = LogContext::new(MODULE, "update_build_container")
            .with("build", execution_id)
            .with("container", &container.container_id);
        traced(&ctx, async {
            let updated = platform
                .store
                .set_build_container(execution_id, &container)
                .await?;
            if updated.is_empty() {
                debug!(target: MODULE, "{} no unfinished context versions", ctx);
            }
            Ok(updated)
        })
        .await
    }

    pub async fn update_successful_build<S: Store>(
        platform: &Platform<S>,
        execution_id: &Id,
        docker_image: Option<String>,
    ) -> Result<Vec<Build>> {
        let ctx = LogContext::new(MODULE, "update_successful_build").with("build", execution_id);
        traced(
            &ctx,
            Self::settle_execution(
                platform,
                &ctx,
                execution_id,
                BuildCompletion::Succeeded { docker_image },
            ),
        )
        .await
    }

    pub async fn update_failed_build<S: Store>(
        platform: &Platform<S>,
        execution_id: &Id,
        error_message: &str,
    ) -> Result<Vec<Build>> {
        let ctx = LogContext::new(MODULE, "update_failed_build").with("build", execution_id);
        traced(
            &ctx,
            Self::settle_execution(
                platform,
                &ctx,
                execution_id,
                BuildCompletion::Failed {
                    error_message: error_message.to_string(),
                },
            ),
        )
        .await
    }

    /// Settle every context version of one execution, then mirror the outcome
    /// onto their builds and refresh bound instances concurrently.
    async fn settle_execution<S: Store>(
        platform: &Platform<S>,
        ctx: &LogContext,
        execution_id: &Id,
        completion: BuildCompletion,
    ) -> Result<Vec<Build>> {
        let settled = platform
            .store
            .complete_context_versions_by_execution(execution_id, &completion)
            .await?;
        if settled.is_empty() {
            debug!(target: MODULE, "{} no unfinished context versions", ctx);
            return Ok(Vec::new());
        }

        let ids: Vec<Id> = settled.iter().map(|cv| cv.id.clone()).collect();
        let outcome = BuildOutcome {
            completed: Utc::now(),
            failed: matches!(completion, BuildCompletion::Failed { .. }),
        };
        let (builds, refreshed) = futures::join!(
            platform
                .store
                .complete_builds_for_context_versions(&ids, outcome),
            InstanceService::refresh_instances_for_context_versions(platform, &ids),
        );
        let builds = builds?;
        refreshed?;
        Ok(builds)
    }

    pub fn validate_push_info(push: &GithubPushInfo) -> Result<()> {
        push.validate_for_build().map(|_| ())
    }

    /// Copy of the instance's context version moved to the pushed branch and commit.
    pub async fn create_new_context_version<S: Store>(
        platform: &Platform<S>,
        instance: &Instance,
        push: &GithubPushInfo,
    ) -> Result<ContextVersion> {
        let ctx = LogContext::new(MODULE, "create_new_context_version")
            .with("instance", &instance.id)
            .with("repo", &push.repo)
            .with("branch", &push.branch);
        traced(&ctx, async {
            let commit = push.validate_for_build()?;
            let created_by = push
                .user
                .as_ref()
                .map(|u| Owner::with_username(u.id, u.login.clone()))
                .unwrap_or_else(|| instance.created_by.clone());

            let mut cv = instance
                .context_version
                .deep_copy(instance.owner.clone(), created_by);
            if !cv.update_app_code_version(&push.repo, &push.branch, commit) {
                return Err(PlatformError::validation(format!(
                    "Instance {} does not build from {}",
                    instance.id, push.repo
                )));
            }
            platform.store.insert_context_version(cv.clone()).await?;
            Ok(cv)
        })
        .await
    }

    /// New context version and build for a push, started with a non-manual trigger.
    pub async fn create_and_build_context_version<S: Store>(
        platform: &Platform<S>,
        instance: &Instance,
        push: &GithubPushInfo,
        triggered_action_name: &str,
    ) -> Result<PushBuild> {
        let ctx = LogContext::new(MODULE, "create_and_build_context_version")
            .with("instance", &instance.id)
            .with("action", triggered_action_name);
        traced(&ctx, async {
            let commit = push.validate_for_build()?.to_string();
            let user = platform
                .resolve_push_actor(push, &[&instance.created_by])
                .await?;

            let cv = Self::create_new_context_version(platform, instance, push).await?;
            let build = Self::create_build(
                platform,
                CreateBuildRequest::for_context_version(cv.id.clone(), instance.owner.clone()),
                &user,
            )
            .await?;

            let request = BuildRequest {
                message: Some(triggered_action_name.to_string()),
                triggered_action: Some(TriggeredAction {
                    manual: Some(false),
                    rebuild: false,
                    app_code_version: Some(PushedCodeVersion {
                        repo: push.repo.clone(),
                        branch: push.branch.clone(),
                        commit,
                        commit_log: push.commit_log.clone(),
                    }),
                }),
                no_cache: false,
            };
            let build = Self::build_build(platform, &build.id, request, &user).await?;
            Ok(PushBuild { user, build })
        })
        .await
    }
}
