mod common;

use common::{delete_payload, push_payload, Fixture};
use dockyard::error::PlatformError;
use dockyard::logic::{DependencyGraphService, GithookOutcome, IsolationService, WebhookService};
use dockyard::model::{
    AutoIsolationConfig, CreateIsolationRequest, InstanceQuery, IsolationChildRequest,
    IsolationState, Job,
};
use dockyard::store::traits::{AutoIsolationConfigStore, InstanceStore};

fn deployed(outcome: GithookOutcome) -> dockyard::logic::DeployOutcome {
    match outcome {
        GithookOutcome::Deployed(outcome) => outcome,
        other => panic!("expected a deploy outcome, got {:?}", other),
    }
}

#[tokio::test]
async fn test_push_to_new_branch_forks_and_isolates_with_matching_branch() {
    let fx = Fixture::new().await;
    let dep = fx.master_instance("acme/dep-svc", "dep-svc", &[]).await;
    let dep_url = format!("DEP_URL=http://{}:3000", fx.hostname("dep-svc"));
    let app = fx
        .master_instance("acme/app", "app", &[dep_url.as_str()])
        .await;
    fx.store
        .upsert_auto_isolation_config(AutoIsolationConfig::new(
            app.id.clone(),
            fx.org_owner(),
            vec![IsolationChildRequest {
                org: Some("acme".into()),
                repo: Some("dep-svc".into()),
                match_branch: true,
                ..IsolationChildRequest::default()
            }],
            false,
        ))
        .await
        .unwrap();
    fx.scm.set_head("acme/dep-svc", "feature-x", "d1");

    let outcome = deployed(
        WebhookService::process_githook_event(
            &fx.platform,
            &push_payload("acme/app", "feature-x", "f1"),
        )
        .await
        .unwrap(),
    );

    assert!(outcome.deployed.is_empty());
    assert_eq!(outcome.forked.len(), 1);
    let fork = &outcome.forked[0];
    assert_eq!(fork.name, "feature-x-app");
    assert_eq!(fork.parent.as_deref(), Some(app.short_hash.as_str()));
    let acv = fork.context_version.main_app_code_version().unwrap();
    assert_eq!((acv.branch.as_str(), acv.commit.as_deref()), ("feature-x", Some("f1")));

    assert_eq!(outcome.isolations.len(), 1);
    let isolation = &outcome.isolations[0];
    assert_eq!(isolation.state, IsolationState::Active);

    let members = fx
        .store
        .find_instances(&InstanceQuery::in_isolation(&isolation.id))
        .await
        .unwrap();
    assert_eq!(members.len(), 2);
    let master = members.iter().find(|i| i.is_group_master()).unwrap();
    assert_eq!(master.id, fork.id);
    let child = members.iter().find(|i| !i.is_group_master()).unwrap();
    assert_eq!(child.name, format!("{}--dep-svc", fork.short_hash));
    assert_eq!(child.parent.as_deref(), Some(dep.short_hash.as_str()));
    let child_acv = child.context_version.main_app_code_version().unwrap();
    assert_eq!(
        (child_acv.branch.as_str(), child_acv.commit.as_deref()),
        ("feature-x", Some("d1"))
    );

    // The fork now talks to its isolated dep-svc, the master keeps the shared one.
    assert!(master.env[0].contains(&child.hostname));
    let fork_deps = DependencyGraphService::get_dependencies(&fx.platform, &fork.id)
        .await
        .unwrap();
    assert_eq!(fork_deps.len(), 1);
    assert_eq!(fork_deps[0].instance_id, child.id);
    let app_deps = DependencyGraphService::get_dependencies(&fx.platform, &app.id)
        .await
        .unwrap();
    assert_eq!(app_deps.len(), 1);
    assert_eq!(app_deps[0].instance_id, dep.id);
}

#[tokio::test]
async fn test_second_push_redeploys_existing_fork_without_forking_again() {
    let fx = Fixture::new().await;
    fx.master_instance("acme/app", "app", &[]).await;

    let first = deployed(
        WebhookService::process_githook_event(
            &fx.platform,
            &push_payload("acme/app", "feature-x", "f1"),
        )
        .await
        .unwrap(),
    );
    assert_eq!(first.forked.len(), 1);
    let fork = first.forked[0].clone();

    let second = deployed(
        WebhookService::process_githook_event(
            &fx.platform,
            &push_payload("acme/app", "feature-x", "f2"),
        )
        .await
        .unwrap(),
    );
    assert!(second.forked.is_empty());
    assert_eq!(second.deployed.len(), 1);
    assert_eq!(second.deployed[0].id, fork.id);
    assert_eq!(
        second.deployed[0]
            .context_version
            .main_app_code_version()
            .unwrap()
            .commit
            .as_deref(),
        Some("f2")
    );
    assert_eq!(fx.store.instance_count(), 2);
}

#[tokio::test]
async fn test_same_repo_masters_sharing_a_dockerfile_are_forked_once() {
    let fx = Fixture::new().await;
    let app = fx
        .master_with_dockerfile("acme/app", "app", "FROM node", &[])
        .await;
    let worker = fx
        .master_with_dockerfile("acme/app", "worker", "FROM node", &[])
        .await;

    let first = deployed(
        WebhookService::process_githook_event(
            &fx.platform,
            &push_payload("acme/app", "feature-x", "f1"),
        )
        .await
        .unwrap(),
    );
    let mut names: Vec<_> = first.forked.iter().map(|i| i.name.as_str()).collect();
    names.sort();
    assert_eq!(names, ["feature-x-app", "feature-x-worker"]);
    for fork in &first.forked {
        let master = if fork.name == "feature-x-app" { &app } else { &worker };
        assert_eq!(fork.context_version.context, master.context_version.context);
    }

    let second = deployed(
        WebhookService::process_githook_event(
            &fx.platform,
            &push_payload("acme/app", "feature-x", "f2"),
        )
        .await
        .unwrap(),
    );
    assert!(second.forked.is_empty());
    assert_eq!(second.deployed.len(), 2);
    assert_eq!(fx.store.instance_count(), 4);
}

#[tokio::test]
async fn test_branch_deletion_removes_forks_but_not_isolated_children() {
    let fx = Fixture::new().await;
    let app = fx.master_instance("acme/app", "app", &[]).await;
    fx.master_instance("acme/app", "worker", &[]).await;
    let gateway = fx.master_instance("acme/gateway", "gateway", &[]).await;

    let forked = deployed(
        WebhookService::process_githook_event(
            &fx.platform,
            &push_payload("acme/app", "old-branch", "o1"),
        )
        .await
        .unwrap(),
    )
    .forked;
    assert_eq!(forked.len(), 2);

    fx.scm.set_head("acme/app", "old-branch", "o2");
    let mut child = IsolationChildRequest::instance(app.id.clone());
    child.branch = Some("old-branch".into());
    let group = IsolationService::create_isolation_and_emit_instance_updates(
        &fx.platform,
        CreateIsolationRequest {
            master: gateway.id.clone(),
            children: vec![child],
            redeploy_on_killed: false,
        },
        &fx.user,
    )
    .await
    .unwrap();
    let isolated_child = group.children[0].clone();
    assert!(isolated_child
        .context_version
        .tracks_branch("acme/app", "old-branch"));
    fx.queue.clear();

    let outcome = WebhookService::process_githook_event(
        &fx.platform,
        &delete_payload("acme/app", "old-branch"),
    )
    .await
    .unwrap();

    let GithookOutcome::Deleted { mut instance_ids } = outcome else {
        panic!("expected a deletion outcome");
    };
    let mut expected: Vec<_> = forked.iter().map(|i| i.id.clone()).collect();
    instance_ids.sort();
    expected.sort();
    assert_eq!(instance_ids, expected);
    assert!(!instance_ids.contains(&isolated_child.id));
    assert_eq!(
        fx.count_jobs(|job| matches!(job, Job::DeleteInstance { .. })),
        2
    );
}

#[tokio::test]
async fn test_push_to_tracked_branch_skips_locked_instances() {
    let fx = Fixture::new().await;
    let open = fx.master_instance("acme/app", "app", &[]).await;
    let mut locked = fx.master_instance("acme/app", "app-canary", &[]).await;
    locked.locked = true;
    fx.store.update_instance(&locked).await.unwrap();
    fx.queue.clear();

    let outcome = deployed(
        WebhookService::process_githook_event(
            &fx.platform,
            &push_payload("acme/app", "master", "m2"),
        )
        .await
        .unwrap(),
    );

    assert!(outcome.forked.is_empty());
    assert_eq!(outcome.deployed.len(), 1);
    assert_eq!(outcome.deployed[0].id, open.id);
    assert_eq!(
        fx.store.get_instance(&locked.id).await.unwrap().unwrap().build,
        locked.build
    );
    assert_eq!(
        fx.count_jobs(|job| matches!(job, Job::CreateImageBuilderContainer { .. })),
        1
    );
}

#[tokio::test]
async fn test_push_from_unknown_org_is_forbidden() {
    let fx = Fixture::new().await;
    let mut payload = push_payload("other/app", "master", "m1");
    payload.repository.as_mut().unwrap().owner.as_mut().unwrap().id = 404;

    let result = WebhookService::process_githook_event(&fx.platform, &payload).await;
    assert!(matches!(result, Err(PlatformError::Forbidden(_))));
    assert!(fx.queue.jobs().is_empty());
}
