use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    Json as RequestJson,
};
use serde::Serialize;
use std::sync::Arc;

use crate::api::user_extractor::GithubActor;
use crate::error::PlatformError;
use crate::logic::{
    BuildService, GithookOutcome, IsolationGroup, IsolationService, Platform, WebhookService,
};
use crate::model::{
    Build, BuildRequest, CreateBuildRequest, CreateIsolationRequest, GithubPushPayload, Id,
    Instance, Isolation, KillIsolationRequest, User,
};
use crate::store::traits::{Store, UserStore};

pub type AppState<S> = Arc<Platform<S>>;

pub type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

const GITHUB_EVENT_HEADER: &str = "x-github-event";

/// Simple health check endpoint
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: &str) -> Self {
        Self {
            error: message.to_string(),
        }
    }
}

impl From<PlatformError> for (StatusCode, Json<ErrorResponse>) {
    fn from(err: PlatformError) -> Self {
        let status = match &err {
            PlatformError::Validation(_) => StatusCode::BAD_REQUEST,
            PlatformError::NotFound(_) => StatusCode::NOT_FOUND,
            PlatformError::Conflict(_) => StatusCode::CONFLICT,
            PlatformError::Forbidden(_) => StatusCode::FORBIDDEN,
            PlatformError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            PlatformError::PartialBatch { .. } | PlatformError::Collaborator(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(ErrorResponse::new(&err.to_string())))
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum GithookResponse {
    Pong { message: String },
    Processed(GithookOutcome),
}

/// Stored platform user for the caller, or a bare user built from the headers.
async fn resolve_actor<S: Store>(
    platform: &Platform<S>,
    actor: GithubActor,
) -> Result<User, PlatformError> {
    if let Some(user) = platform.store.find_user_by_github_id(actor.github_id).await? {
        return Ok(user);
    }
    let username = actor
        .username
        .unwrap_or_else(|| actor.github_id.to_string());
    let mut user = User::new(actor.github_id, username);
    user.email = actor.email;
    Ok(user)
}

pub async fn create_build<S: Store>(
    State(platform): State<AppState<S>>,
    actor: GithubActor,
    RequestJson(request): RequestJson<CreateBuildRequest>,
) -> ApiResult<Build> {
    let actor = resolve_actor(&platform, actor).await?;
    let build = BuildService::create_build(&platform, request, &actor).await?;
    Ok(Json(build))
}

pub async fn build_build<S: Store>(
    State(platform): State<AppState<S>>,
    Path(build_id): Path<Id>,
    actor: GithubActor,
    RequestJson(request): RequestJson<BuildRequest>,
) -> ApiResult<Build> {
    let actor = resolve_actor(&platform, actor).await?;
    BuildService::find_build_and_assert_access(&platform, &build_id, &actor).await?;
    let build = BuildService::build_build(&platform, &build_id, request, &actor).await?;
    Ok(Json(build))
}

pub async fn create_isolation<S: Store>(
    State(platform): State<AppState<S>>,
    actor: GithubActor,
    RequestJson(request): RequestJson<CreateIsolationRequest>,
) -> ApiResult<IsolationGroup> {
    let actor = resolve_actor(&platform, actor).await?;
    let group =
        IsolationService::create_isolation_and_emit_instance_updates(&platform, request, &actor)
            .await?;
    Ok(Json(group))
}

pub async fn delete_isolation<S: Store>(
    State(platform): State<AppState<S>>,
    Path(isolation_id): Path<Id>,
    actor: GithubActor,
) -> ApiResult<Instance> {
    let actor = resolve_actor(&platform, actor).await?;
    let master =
        IsolationService::delete_isolation_and_emit_instance_updates(&platform, &isolation_id, &actor)
            .await?;
    Ok(Json(master))
}

pub async fn kill_isolation<S: Store>(
    State(platform): State<AppState<S>>,
    Path(isolation_id): Path<Id>,
    actor: GithubActor,
    RequestJson(request): RequestJson<KillIsolationRequest>,
) -> ApiResult<Isolation> {
    let actor = resolve_actor(&platform, actor).await?;
    IsolationService::find_isolation_and_assert_access(&platform, &isolation_id, &actor).await?;
    let isolation =
        IsolationService::kill_isolation(&platform, &isolation_id, request.redeploy_on_killed)
            .await?;
    Ok(Json(isolation))
}

/// GitHub webhook receiver. Pings are answered directly.
pub async fn github_webhook<S: Store>(
    State(platform): State<AppState<S>>,
    headers: HeaderMap,
    RequestJson(payload): RequestJson<GithubPushPayload>,
) -> ApiResult<GithookResponse> {
    let event = headers
        .get(GITHUB_EVENT_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("push");
    if event == "ping" {
        return Ok(Json(GithookResponse::Pong {
            message: "Hello, Github Ping!".to_string(),
        }));
    }
    if event != "push" {
        return Err(PlatformError::NotImplemented(format!("Cannot handle {} events", event)).into());
    }
    let outcome = WebhookService::process_githook_event(&platform, &payload).await?;
    Ok(Json(GithookResponse::Processed(outcome)))
}
