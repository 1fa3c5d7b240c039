mod admin;
mod clouds;
mod proxy;

use crate::serve::AppState;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::Router;
use http::StatusCode;
use tower_http::trace::TraceLayer;

pub fn build_router(state: AppState) -> Router<()> {
    Router::new()
        .nest("/api/v1", api_router())
        // utility
        .fallback(not_found)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

fn api_router() -> Router<AppState> {
    Router::new()
        // cloud group
        //  GET /clouds
        .route("/clouds", get(clouds::list))
        //  POST /clouds/test-connection
        .route("/clouds/test-connection", post(clouds::test_connection))
        //  POST /clouds/:cloud/provision
        .route("/clouds/:cloud/provision", post(clouds::provision))
        //  GET /clouds/:cloud/workers
        .route("/clouds/:cloud/workers", get(clouds::workers))
        //  DELETE /clouds/:cloud/workers/:server_id
        .route(
            "/clouds/:cloud/workers/:server_id",
            delete(clouds::terminate),
        )
        // administration group
        //  POST /admin/invalidate-clients
        .route(
            "/admin/invalidate-clients",
            post(admin::invalidate_clients),
        )
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "no such route")
}
