use crate::error::AppError;
use crate::models::{BackfillRequest, BackfillResponse, ReconcileResponse};
use crate::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
};
use market_data::instruments::SyncReport;
use types::prelude::{DataKind, Exchange, Symbol, Timeframe, ValidationError};

pub async fn reconcile(
    State(state): State<AppState>,
    Path((exchange, data_kind)): Path<(String, String)>,
) -> Result<Json<ReconcileResponse>, AppError> {
    let exchange = Exchange::new(exchange);
    let data_kind: DataKind = data_kind.parse()?;

    let delta = state.engine.reconcile(&exchange, data_kind).await?;
    Ok(Json(ReconcileResponse::new(exchange, data_kind, delta)))
}

pub async fn backfill(
    State(state): State<AppState>,
    Json(payload): Json<BackfillRequest>,
) -> Result<Json<BackfillResponse>, AppError> {
    let exchange = Exchange::new(payload.exchange);
    let symbol = Symbol::try_new(payload.symbol).ok_or(ValidationError::EmptySymbol)?;
    let timeframe = match payload.timeframe.as_deref() {
        Some(tf) => tf.parse::<Timeframe>()?,
        None => state.engine.config().backfill.default_timeframe,
    };

    let report = state
        .engine
        .backfill_now(&exchange, &symbol, Some(timeframe), payload.since)
        .await?;
    tracing::info!(
        exchange = %exchange,
        symbol = %symbol,
        timeframe = %timeframe,
        written = report.written(),
        "manual backfill completed"
    );
    Ok(Json(BackfillResponse::new(exchange, symbol, timeframe, report)))
}

pub async fn sync_instruments(
    State(state): State<AppState>,
    Path(exchange): Path<String>,
) -> Result<Json<SyncReport>, AppError> {
    let exchange = Exchange::new(exchange);
    Ok(Json(state.engine.sync_instruments(&exchange).await?))
}
