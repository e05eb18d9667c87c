use crate::error::AppError;
use crate::models::CreateSubscriptionRequest;
use crate::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use types::prelude::{
    DataKind, Exchange, InstrumentKind, Subscription, SubscriptionId, Symbol, Timeframe,
    ValidationError,
};
use uuid::Uuid;

pub async fn create_subscription(
    State(state): State<AppState>,
    Json(payload): Json<CreateSubscriptionRequest>,
) -> Result<(StatusCode, Json<Subscription>), AppError> {
    let symbol = Symbol::try_new(payload.symbol).ok_or(ValidationError::EmptySymbol)?;
    let data_kind: DataKind = payload.data_kind.parse()?;
    let instrument_kind: InstrumentKind = payload.instrument_kind.parse()?;
    let timeframe = payload
        .timeframe
        .as_deref()
        .map(str::parse::<Timeframe>)
        .transpose()?;
    let exchange = payload.exchange.map(Exchange::new);
    if let Some(exchange) = &exchange {
        state.engine.connection(exchange)?;
    }

    let subscription = Subscription::new(
        payload.username,
        symbol,
        data_kind,
        instrument_kind,
        timeframe,
        exchange,
    )?;
    state.registry.add(subscription.clone());
    tracing::info!(
        id = %subscription.id,
        username = %subscription.username,
        symbol = %subscription.symbol,
        kind = %subscription.data_kind,
        "subscription recorded"
    );

    reconcile_affected(&state, &subscription).await;
    Ok((StatusCode::CREATED, Json(subscription)))
}

pub async fn delete_subscription(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let removed = state
        .registry
        .remove(&SubscriptionId::from_uuid(id))
        .ok_or_else(|| AppError::NotFound(format!("subscription {}", id)))?;
    tracing::info!(id = %removed.id, symbol = %removed.symbol, "subscription removed");

    reconcile_affected(&state, &removed).await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_subscriptions(State(state): State<AppState>) -> Json<Vec<Subscription>> {
    Json(state.registry.list())
}

/// Push a registry change to the live feed. A connection that is down
/// picks the change up on its next connect, so failures are only logged.
async fn reconcile_affected(state: &AppState, subscription: &Subscription) {
    if !subscription.data_kind.is_streamed() {
        return;
    }
    for handle in state.engine.connections() {
        if !subscription.is_on(handle.exchange()) {
            continue;
        }
        if let Err(e) = handle.reconcile(subscription.data_kind).await {
            tracing::warn!(
                exchange = %handle.exchange(),
                kind = %subscription.data_kind,
                error = %e,
                "reconcile after subscription change deferred"
            );
        }
    }
}
