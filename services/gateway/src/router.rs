use crate::handlers::{control, status, subscriptions, ws};
use crate::state::AppState;
use axum::{
    Router,
    routing::{delete, get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/reconcile/{exchange}/{data_kind}", post(control::reconcile))
        .route("/backfill", post(control::backfill))
        .route("/instruments/{exchange}/sync", post(control::sync_instruments))
        .route(
            "/subscriptions",
            post(subscriptions::create_subscription).get(subscriptions::list_subscriptions),
        )
        .route("/subscriptions/{id}", delete(subscriptions::delete_subscription))
        .route("/stream/{kind}/{exchange}/{symbol}", get(ws::stream_handler))
        .route("/connections", get(status::connections))
        .route("/metrics", get(status::metrics));

    Router::new()
        .route("/health", get(status::health))
        .nest("/v1", api_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
