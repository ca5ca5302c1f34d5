#![allow(dead_code)]

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};

use dockyard::external::{MemoryJobQueue, StaticSourceControl};
use dockyard::logic::{InstanceService, Platform, PlatformSettings};
use dockyard::model::{
    generate_id, AppCodeVersion, Build, ContextVersion, GithubId, GithubPushPayload, Instance,
    Job, NewInstance, Organization, Owner, User,
};
use dockyard::store::traits::{BuildStore, ContextVersionStore, OrganizationStore, UserStore};
use dockyard::store::MemoryStore;

pub const ORG_ID: GithubId = 77;
pub const ORG_LOGIN: &str = "acme";
pub const USER_ID: GithubId = 5;
pub const USER_LOGIN: &str = "octo";

/// In-memory control plane with the `acme` org allow-listed and `octo` as a member.
pub struct Fixture {
    pub platform: Arc<Platform<MemoryStore>>,
    pub store: Arc<MemoryStore>,
    pub queue: Arc<MemoryJobQueue>,
    pub scm: Arc<StaticSourceControl>,
    pub user: User,
}

impl Fixture {
    pub async fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let scm = Arc::new(StaticSourceControl::new());
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
        );

        let mut user = User::new(USER_ID, USER_LOGIN);
        user.organizations.push(ORG_ID);
        store.upsert_user(user.clone()).await.unwrap();
        store
            .upsert_organization(Organization::allowed(ORG_ID, ORG_LOGIN))
            .await
            .unwrap();

        Self {
            platform: Arc::new(platform),
            store,
            queue,
            scm,
            user,
        }
    }

    pub fn org_owner(&self) -> Owner {
        Owner::with_username(ORG_ID, ORG_LOGIN)
    }

    /// Built master pod of `repo` on `master`.
    pub async fn master_instance(&self, repo: &str, name: &str, env: &[&str]) -> Instance {
        self.master_with_dockerfile(repo, name, &format!("FROM {}", name), env)
            .await
    }

    pub async fn master_with_dockerfile(
        &self,
        repo: &str,
        name: &str,
        dockerfile: &str,
        env: &[&str],
    ) -> Instance {
        let mut cv = ContextVersion::new(
            generate_id(),
            self.org_owner(),
            self.user.as_owner(),
            dockerfile.to_string(),
        );
        cv.app_code_versions
            .push(AppCodeVersion::new(repo, "master", Some("abc")));
        let build = self.built(cv).await;
        InstanceService::create_instance(
            &self.platform,
            NewInstance {
                name: name.to_string(),
                owner: Some(self.org_owner()),
                build: build.id,
                env: env.iter().map(|e| e.to_string()).collect(),
                master_pod: true,
                ..NewInstance::default()
            },
            &self.user,
        )
        .await
        .unwrap()
    }

    pub fn hostname(&self, name: &str) -> String {
        format!("{}-staging-{}.dockyard.local", name, ORG_LOGIN)
    }

    pub fn count_jobs<F>(&self, predicate: F) -> usize
    where
        F: Fn(&Job) -> bool,
    {
        self.queue.count(predicate)
    }

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
}

pub fn push_json(repo: &str, branch: &str, commit: &str) -> Value {
    json!({
        "ref": format!("refs/heads/{}", branch),
        "repository": {
            "full_name": repo,
            "name": repo.rsplit('/').next().unwrap_or(repo),
            "owner": { "id": ORG_ID, "login": ORG_LOGIN }
        },
        "head_commit": { "id": commit, "message": "push" },
        "sender": { "id": USER_ID, "login": USER_LOGIN },
        "commits": [{ "id": commit }]
    })
}

pub fn push_payload(repo: &str, branch: &str, commit: &str) -> GithubPushPayload {
    serde_json::from_value(push_json(repo, branch, commit)).unwrap()
}

pub fn delete_payload(repo: &str, branch: &str) -> GithubPushPayload {
    let mut value = push_json(repo, branch, "0000000");
    value["head_commit"] = Value::Null;
    value["deleted"] = Value::Bool(true);
    serde_json::from_value(value).unwrap()
}
