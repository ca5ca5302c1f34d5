use axum::{
    routing::{get, post},
    Router,
};

use crate::api::handlers::{self, AppState};
use crate::store::traits::Store;

pub fn create_router<S: Store + 'static>() -> Router<AppState<S>> {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Builds
        .route("/builds", post(handlers::create_build::<S>))
        .route("/builds/:build_id/actions/build", post(handlers::build_build::<S>))
        // Isolations
        .route("/isolations", post(handlers::create_isolation::<S>))
        .route(
            "/isolations/:isolation_id",
            axum::routing::delete(handlers::delete_isolation::<S>),
        )
        .route(
            "/isolations/:isolation_id/actions/kill",
            post(handlers::kill_isolation::<S>),
        )
        // Webhooks
        .route("/actions/github", post(handlers::github_webhook::<S>))
}
