use std::sync::Arc;

use anyhow::anyhow;
use chrono::Utc;

use crate::external::{
    Analytics, LogAnalytics, MemoryInstanceEvents, MemoryJobQueue, StaticSourceControl,
};
use crate::logic::fork_service::InstanceForkService;
use crate::logic::instance_service::InstanceService;
use crate::logic::platform::{Platform, PlatformSettings};
use crate::model::{
    generate_id, AppCodeVersion, Build, ContextVersion, GithubId, GithubPushInfo,
    GithubPushPayload, Instance, NewInstance, Organization, Owner, User,
};
use crate::store::traits::{BuildStore, ContextVersionStore, OrganizationStore, UserStore};
use crate::store::MemoryStore;

pub const ORG_ID: GithubId = 77;
pub const ORG_LOGIN: &str = "acme";
pub const USER_ID: GithubId = 5;
pub const USER_LOGIN: &str = "octo";

struct FailingAnalytics;

#[async_trait::async_trait]
impl Analytics for FailingAnalytics {
    async fn track(&self, _event: &str, _properties: serde_json::Value) -> anyhow::Result<()> {
        Err(anyhow!("analytics sink offline"))
    }
}

/// In-memory platform with one allowed org and one member user.
pub struct TestPlatform {
    pub platform: Platform<MemoryStore>,
    pub store: Arc<MemoryStore>,
    pub queue: Arc<MemoryJobQueue>,
    pub scm: Arc<StaticSourceControl>,
    pub events: Arc<MemoryInstanceEvents>,
    pub user: User,
}

impl TestPlatform {
    pub async fn new() -> Self {
        Self::build(Arc::new(LogAnalytics)).await
    }

    pub async fn with_failing_analytics() -> Self {
        Self::build(Arc::new(FailingAnalytics)).await
    }

    async fn build(analytics: Arc<dyn Analytics>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let scm = Arc::new(StaticSourceControl::new());
        let events = Arc::new(MemoryInstanceEvents::new());
        let settings = PlatformSettings {
            user_content_domain: "dockyard.local".to_string(),
            enable_autofork_on_branch_push: true,
            ..PlatformSettings::default()
        };
        let platform = Platform::new(
            store.clone(),
            store.clone(),
            queue.clone(),
            scm.clone(),
            settings,
        )
        .with_events(events.clone())
        .with_analytics(analytics);

        let mut user = User::new(USER_ID, USER_LOGIN);
        user.organizations.push(ORG_ID);
        store.upsert_user(user.clone()).await.unwrap();
        store
            .upsert_organization(Organization::allowed(ORG_ID, ORG_LOGIN))
            .await
            .unwrap();

        Self {
            platform,
            store,
            queue,
            scm,
            events,
            user,
        }
    }

    pub fn org_owner(&self) -> Owner {
        Owner::with_username(ORG_ID, ORG_LOGIN)
    }

    pub fn push(&self, repo: &str, branch: &str, commit: &str) -> GithubPushInfo {
        push_info(repo, branch, commit, self.user.github_id)
    }

    /// Master pod of `repo` at `master`, already built.
    pub async fn master_instance(&self, repo: &str, name: &str) -> Instance {
        self.instance_with_env(repo, name, Vec::new()).await
    }

    pub async fn instance_with_env(&self, repo: &str, name: &str, env: Vec<String>) -> Instance {
        let mut cv = self.context_version("FROM node");
        cv.app_code_versions
            .push(AppCodeVersion::new(repo, "master", Some("abc")));
        let build = self.built(cv).await;
        self.create(NewInstance {
            name: name.to_string(),
            owner: Some(self.org_owner()),
            build: build.id,
            env,
            master_pod: true,
            ..NewInstance::default()
        })
        .await
    }

    /// Built master without repositories.
    pub async fn non_repo_instance(&self, name: &str) -> Instance {
        let mut cv = self.context_version(&format!("FROM {}", name));
        cv.advanced = true;
        let build = self.built(cv).await;
        self.create(NewInstance {
            name: name.to_string(),
            owner: Some(self.org_owner()),
            build: build.id,
            master_pod: true,
            ..NewInstance::default()
        })
        .await
    }

    /// Built standalone fork of `master` following `branch`.
    pub async fn branch_instance(&self, master: &Instance, branch: &str) -> Instance {
        let mut cv = master
            .context_version
            .deep_copy(master.owner.clone(), self.user.as_owner());
        let repo = master
            .context_version
            .main_app_code_version()
            .map(|acv| acv.repo.clone())
            .unwrap();
        assert!(cv.update_app_code_version(&repo, branch, "abc1"));
        let build = self.built(cv).await;
        self.create(NewInstance {
            name: InstanceForkService::generate_branch_fork_name(branch, &master.name),
            short_name: Some(master.short_name.clone()),
            owner: Some(master.owner.clone()),
            build: build.id,
            parent: Some(master.short_hash.clone()),
            auto_forked: true,
            ..NewInstance::default()
        })
        .await
    }

    /// Another instance on the same build, e.g. `<hash>--db`.
    pub async fn copy_of(&self, instance: &Instance, name: &str) -> Instance {
        self.create(NewInstance {
            name: name.to_string(),
            owner: Some(instance.owner.clone()),
            build: instance.build.clone(),
            ..NewInstance::default()
        })
        .await
    }

    fn context_version(&self, instructions: &str) -> ContextVersion {
        ContextVersion::new(
            generate_id(),
            self.org_owner(),
            self.user.as_owner(),
            instructions.to_string(),
        )
    }

    /// Store `cv` as a successful build execution plus a completed build.
    async fn built(&self, mut cv: ContextVersion) -> Build {
        let now = Utc::now();
        cv.build.id = Some(generate_id());
        cv.build.started = Some(now);
        cv.build.completed = Some(now);
        cv.build.hash = Some(self.platform.fingerprinter.fingerprint(&cv));
        cv.build.triggered_by = Some(self.user.as_owner());
        self.store.insert_context_version(cv.clone()).await.unwrap();

        let mut build = Build::new(
            cv.owner.clone(),
            self.user.as_owner(),
            cv.id.clone(),
            cv.context.clone(),
        );
        build.started = Some(now);
        build.started_by = Some(self.user.as_owner());
        build.completed = Some(now);
        self.store.insert_build(build.clone()).await.unwrap();
        build
    }

    async fn create(&self, body: NewInstance) -> Instance {
        InstanceService::create_instance(&self.platform, body, &self.user)
            .await
            .unwrap()
    }
}

pub fn push_payload(repo: &str, branch: &str, commit: &str, pusher: GithubId) -> GithubPushPayload {
    let login = if pusher == USER_ID { USER_LOGIN } else { "stranger" };
    serde_json::from_value(serde_json::json!({
        "ref": format!("refs/heads/{}", branch),
        "repository": {
            "full_name": repo,
            "name": repo.rsplit('/').next().unwrap_or(repo),
            "owner": { "id": ORG_ID, "login": ORG_LOGIN }
        },
        "head_commit": { "id": commit, "message": "push" },
        "sender": { "id": pusher, "login": login },
        "commits": [{ "id": commit }]
    }))
    .unwrap()
}

pub fn push_info(repo: &str, branch: &str, commit: &str, pusher: GithubId) -> GithubPushInfo {
    GithubPushInfo::from_payload(&push_payload(repo, branch, commit, pusher)).unwrap()
}
