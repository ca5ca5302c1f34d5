use chrono::Utc;
use log::info;

use crate::error::Result;
use crate::logic::{InstanceService, Platform};
use crate::model::{
    generate_id, AppCodeVersion, Build, ContextVersion, GithubId, Instance, NewInstance,
    Organization, Owner, User,
};
use crate::store::traits::{BuildStore, ContextVersionStore, OrganizationStore, Store, UserStore};

pub const DEMO_ORG_ID: GithubId = 1001;
pub const DEMO_ORG_LOGIN: &str = "dockyard-demo";
pub const DEMO_USER_ID: GithubId = 2001;
pub const DEMO_USER_LOGIN: &str = "demo-dev";
pub const DEMO_REPO: &str = "dockyard-demo/api";

/// Demo organization, member user and one built master instance of
/// `dockyard-demo/api`. Loading twice is a no-op.
pub async fn load_seed_data<S: Store>(platform: &Platform<S>) -> Result<Option<Instance>> {
    if platform.store.find_organization(DEMO_ORG_ID).await?.is_some() {
        info!("Seed data already present, skipping");
        return Ok(None);
    }

    platform
        .store
        .upsert_organization(Organization::allowed(DEMO_ORG_ID, DEMO_ORG_LOGIN))
        .await?;

    let mut user = User::new(DEMO_USER_ID, DEMO_USER_LOGIN);
    user.email = Some("demo-dev@dockyard.local".to_string());
    user.organizations.push(DEMO_ORG_ID);
    platform.store.upsert_user(user.clone()).await?;

    let build = seed_built_build(platform, &user).await?;
    let master = InstanceService::create_instance(
        platform,
        NewInstance {
            name: "api".to_string(),
            owner: Some(demo_org_owner()),
            build: build.id,
            env: vec!["PORT=8080".to_string()],
            master_pod: true,
            ..NewInstance::default()
        },
        &user,
    )
    .await?;

    info!(
        "Seeded org {} with master instance {} ({})",
        DEMO_ORG_LOGIN, master.name, master.short_hash
    );
    Ok(Some(master))
}

fn demo_org_owner() -> Owner {
    Owner::with_username(DEMO_ORG_ID, DEMO_ORG_LOGIN)
}

/// A context version whose build already succeeded, plus the build that points at it.
async fn seed_built_build<S: Store>(platform: &Platform<S>, user: &User) -> Result<Build> {
    let now = Utc::now();
    let mut cv = ContextVersion::new(
        generate_id(),
        demo_org_owner(),
        user.as_owner(),
        "FROM node:20\nCOPY . /app\nCMD [\"npm\", \"start\"]".to_string(),
    );
    cv.app_code_versions
        .push(AppCodeVersion::new(DEMO_REPO, "main", Some("0000000")));
    cv.build.id = Some(generate_id());
    cv.build.started = Some(now);
    cv.build.completed = Some(now);
    cv.build.hash = Some(platform.fingerprinter.fingerprint(&cv));
    cv.build.triggered_by = Some(user.as_owner());
    cv.build.docker_image = Some("registry.dockyard.local/demo/api:seed".to_string());
    platform.store.insert_context_version(cv.clone()).await?;

    let mut build = Build::new(
        cv.owner.clone(),
        user.as_owner(),
        cv.id.clone(),
        cv.context.clone(),
    );
    build.started = Some(now);
    build.started_by = Some(user.as_owner());
    build.completed = Some(now);
    platform.store.insert_build(build.clone()).await?;
    Ok(build)
}
