use futures::future::try_join_all;

use crate::error::{PlatformError, Result};
use crate::logging::{traced, LogContext};
use crate::logic::build_service::{BuildService, PushBuild};
use crate::logic::instance_service::InstanceService;
use crate::logic::platform::Platform;
use crate::model::{
    BuildRequest, CreateBuildRequest, GithubPushInfo, Id, Instance, NewInstance,
    PushedCodeVersion, TriggeredAction, User, ISOLATION_PREFIX_SEPARATOR,
};
use crate::store::traits::{ContextVersionStore, Store};

const MODULE: &str = "InstanceForkService";

const ISOLATION_BUILD_MESSAGE: &str = "Initial Isolation Build";
const AUTO_FORK_ACTION: &str = "autolaunch";

/// Where a fork lives, which also decides its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForkTarget {
    /// Standalone fork following a branch: `<branch>-<name>`.
    Branch(String),
    /// Child of an isolation group: `<masterShortHash>--<name>`.
    Isolation {
        isolation_id: Id,
        master_short_hash: String,
    },
}

/// Source reference a repository fork builds from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoFork {
    pub repo: String,
    pub branch: String,
    pub commit: String,
}

pub struct InstanceForkService;

impl InstanceForkService {
    pub fn generate_isolated_name(master_short_hash: &str, instance_name: &str) -> String {
        format!("{}{}{}", master_short_hash, ISOLATION_PREFIX_SEPARATOR, instance_name)
    }

    /// Branch first, then the master's name: `feature/x` and `app` give
    /// `feature-x-app`. Non-alphanumeric branch characters become `-`.
    pub fn generate_branch_fork_name(branch: &str, instance_name: &str) -> String {
        let branch: String = branch
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        format!("{}-{}", branch, instance_name)
    }

    /// Instance body of a fork of `parent` bound to `build_id`.
    pub fn create_forked_instance_body(
        parent: &Instance,
        build_id: &Id,
        target: &ForkTarget,
        auto_forked: bool,
    ) -> NewInstance {
        let mut body = NewInstance {
            short_name: Some(parent.short_name.clone()),
            owner: Some(parent.owner.clone()),
            build: build_id.clone(),
            env: parent.env.clone(),
            parent: Some(parent.short_hash.clone()),
            master_pod: false,
            auto_forked,
            ..NewInstance::default()
        };
        match target {
            ForkTarget::Branch(branch) => {
                body.name = Self::generate_branch_fork_name(branch, &parent.name);
            }
            ForkTarget::Isolation {
                isolation_id,
                master_short_hash,
            } => {
                body.name = Self::generate_isolated_name(master_short_hash, &parent.name);
                body.isolated = Some(isolation_id.clone());
                body.is_isolation_group_master = Some(false);
            }
        }
        body
    }

    /// Fork `source` at another branch and commit of one of its repositories.
    pub async fn fork_repo_instance<S: Store>(
        platform: &Platform<S>,
        source: &Instance,
        fork: RepoFork,
        target: ForkTarget,
        actor: &User,
    ) -> Result<Instance> {
        let ctx = LogContext::new(MODULE, "fork_repo_instance")
            .with("source", &source.id)
            .with("repo", &fork.repo)
            .with("branch", &fork.branch);
        traced(&ctx, async {
            let mut cv = source
                .context_version
                .deep_copy(source.owner.clone(), actor.as_owner());
            if !cv.update_app_code_version(&fork.repo, &fork.branch, &fork.commit) {
                return Err(PlatformError::validation(format!(
                    "Instance {} does not build from {}",
                    source.id, fork.repo
                )));
            }
            platform.store.insert_context_version(cv.clone()).await?;

            let request = BuildRequest {
                message: Some(ISOLATION_BUILD_MESSAGE.to_string()),
                triggered_action: Some(TriggeredAction {
                    manual: Some(true),
                    rebuild: false,
                    app_code_version: Some(PushedCodeVersion {
                        repo: fork.repo.clone(),
                        branch: fork.branch.clone(),
                        commit: fork.commit.clone(),
                        commit_log: Vec::new(),
                    }),
                }),
                no_cache: false,
            };
            let build = Self::create_and_start_build(platform, source, cv.id, request, actor).await?;
            let body = Self::create_forked_instance_body(source, &build, &target, true);
            InstanceService::create_instance(platform, body, actor).await
        })
        .await
    }

    /// Isolated copy of an instance without repositories.
    pub async fn fork_non_repo_instance<S: Store>(
        platform: &Platform<S>,
        source: &Instance,
        master_short_hash: &str,
        isolation_id: &Id,
        actor: &User,
    ) -> Result<Instance> {
        let ctx = LogContext::new(MODULE, "fork_non_repo_instance")
            .with("source", &source.id)
            .with("isolation", isolation_id);
        traced(&ctx, async {
            if source.owner.github <= 0 {
                return Err(PlatformError::validation(format!(
                    "Instance {} has no owner",
                    source.id
                )));
            }
            let mut cv = source
                .context_version
                .deep_copy(source.owner.clone(), actor.as_owner());
            cv.advanced = true;
            platform.store.insert_context_version(cv.clone()).await?;

            let build = Self::create_and_start_build(
                platform,
                source,
                cv.id,
                BuildRequest::with_message(ISOLATION_BUILD_MESSAGE),
                actor,
            )
            .await?;
            let target = ForkTarget::Isolation {
                isolation_id: isolation_id.clone(),
                master_short_hash: master_short_hash.to_string(),
            };
            let body = Self::create_forked_instance_body(source, &build, &target, true);
            InstanceService::create_instance(platform, body, actor).await
        })
        .await
    }

    /// Branch fork of a master pod bound to an already triggered build.
    pub async fn fork_master_instance<S: Store>(
        platform: &Platform<S>,
        master: &Instance,
        build_id: &Id,
        branch: &str,
        actor: &User,
    ) -> Result<Instance> {
        let ctx = LogContext::new(MODULE, "fork_master_instance")
            .with("master", &master.id)
            .with("branch", branch);
        traced(&ctx, async {
            let target = ForkTarget::Branch(branch.to_string());
            let body = Self::create_forked_instance_body(master, build_id, &target, true);
            InstanceService::create_instance(platform, body, actor).await
        })
        .await
    }

    /// Build the pushed commit for `master` and fork it onto the pushed branch.
    pub async fn fork_one<S: Store>(
        platform: &Platform<S>,
        master: &Instance,
        push: &GithubPushInfo,
    ) -> Result<Instance> {
        let PushBuild { user, build } = BuildService::create_and_build_context_version(
            platform,
            master,
            push,
            AUTO_FORK_ACTION,
        )
        .await?;
        Self::fork_master_instance(platform, master, &build.id, &push.branch, &user).await
    }

    /// Fork every master concurrently. The first failure fails the batch.
    pub async fn auto_fork<S: Store>(
        platform: &Platform<S>,
        masters: &[Instance],
        push: &GithubPushInfo,
    ) -> Result<Vec<Instance>> {
        let ctx = LogContext::new(MODULE, "auto_fork")
            .with("repo", &push.repo)
            .with("branch", &push.branch)
            .with("masters", masters.len());
        traced(
            &ctx,
            try_join_all(masters.iter().map(|master| Self::fork_one(platform, master, push))),
        )
        .await
    }

    async fn create_and_start_build<S: Store>(
        platform: &Platform<S>,
        source: &Instance,
        context_version: Id,
        request: BuildRequest,
        actor: &User,
    ) -> Result<Id> {
        let build = BuildService::create_build(
            platform,
            CreateBuildRequest::for_context_version(context_version, source.owner.clone()),
            actor,
        )
        .await?;
        let build = BuildService::build_build(platform, &build.id, request, actor).await?;
        Ok(build.id)
    }
}
