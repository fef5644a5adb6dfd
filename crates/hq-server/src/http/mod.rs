//! The JSON API router.

pub mod keys;
pub mod sessions;
pub mod shares;
pub mod system;
pub mod workers;

use axum::Router;
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::require_api_key;
use crate::services::AppState;
use crate::ws::browser::browser_handler;
use crate::ws::relay::relay_handler;

/// Build the full router: public endpoints, both WebSocket endpoints, and
/// the API-key-protected surface.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let protected = Router::new()
        .route("/api/auth/setup-status", get(system::setup_status))
        .route(
            "/api/sessions",
            post(sessions::create_session).get(sessions::list_sessions),
        )
        .route("/api/sessions/{id}", get(sessions::get_session))
        .route("/api/sessions/{id}/messages", get(sessions::list_messages))
        .route("/api/sessions/{id}/stop", post(sessions::stop_session))
        .route(
            "/api/workers",
            post(workers::create_worker).get(workers::list_workers),
        )
        .route("/api/workers/{id}", get(workers::get_worker))
        .route(
            "/api/workers/{id}/questions",
            post(workers::create_question).get(workers::list_questions),
        )
        .route(
            "/api/workers/{id}/questions/{qid}/answer",
            post(workers::answer_question),
        )
        .route(
            "/api/shares",
            post(shares::create_share).get(shares::list_shares),
        )
        .route("/api/shares/access/check", get(shares::check_access))
        .route("/api/shares/accessible/{user_id}", get(shares::accessible))
        .route(
            "/api/shares/{id}",
            get(shares::get_share)
                .patch(shares::update_share)
                .delete(shares::delete_share),
        )
        .route("/api/shares/{id}/revoke", post(shares::revoke_share))
        .route("/api/shares/{id}/policy", get(shares::share_policy))
        .route_layer(from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/api/auth/keys/generate", post(keys::generate_key))
        .route("/healthz", get(system::healthz))
        .route("/metrics", get(system::render_metrics))
        .route("/ws", get(browser_handler))
        .route("/ws/relay/{session_id}", get(relay_handler))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
