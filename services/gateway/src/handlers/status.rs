use crate::models::ConnectionStatus;
use crate::state::AppState;
use axum::{Json, extract::State};
use serde_json::{Value, json};
use std::collections::BTreeMap;

pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": market_data::SERVICE_VERSION,
    }))
}

pub async fn connections(State(state): State<AppState>) -> Json<Vec<ConnectionStatus>> {
    Json(
        state
            .engine
            .connections()
            .iter()
            .map(ConnectionStatus::from)
            .collect(),
    )
}

pub async fn metrics(State(state): State<AppState>) -> Json<BTreeMap<String, u64>> {
    Json(state.engine.metrics().export())
}
