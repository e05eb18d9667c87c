//! Symbol registry: what users want
//!
//! The engine only reads the registry. Subscriptions are written by the
//! request-handling layer; [`InMemoryRegistry`] is the in-process backing
//! used by the gateway and in tests.

use std::collections::BTreeSet;
use std::sync::RwLock;

use async_trait::async_trait;
use types::prelude::{DataKind, Exchange, Subscription, SubscriptionId, Symbol, Timeframe};

use crate::error::StoreError;

/// An ohlc subscription as seen by the backfill scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OhlcRequest {
    pub symbol: Symbol,
    pub timeframe: Option<Timeframe>,
}

#[async_trait]
pub trait SymbolRegistry: Send + Sync {
    /// Distinct symbols with at least one subscription of `kind` on `exchange`.
    async fn active_symbols(
        &self,
        exchange: &Exchange,
        kind: DataKind,
    ) -> Result<BTreeSet<Symbol>, StoreError>;

    /// Every ohlc subscription on `exchange`, duplicates included.
    async fn ohlc_subscriptions(&self, exchange: &Exchange) -> Result<Vec<OhlcRequest>, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    subscriptions: RwLock<Vec<Subscription>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, subscription: Subscription) {
        self.write().push(subscription);
    }

    /// Remove by id, returning the removed subscription.
    pub fn remove(&self, id: &SubscriptionId) -> Option<Subscription> {
        let mut subs = self.write();
        let pos = subs.iter().position(|s| &s.id == id)?;
        Some(subs.remove(pos))
    }

    /// Remove every subscription matching the predicate; returns how many.
    pub fn remove_matching<F>(&self, predicate: F) -> usize
    where
        F: Fn(&Subscription) -> bool,
    {
        let mut subs = self.write();
        let before = subs.len();
        subs.retain(|s| !predicate(s));
        before - subs.len()
    }

    pub fn list(&self) -> Vec<Subscription> {
        self.read().clone()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Subscription>> {
        self.subscriptions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Subscription>> {
        self.subscriptions
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl SymbolRegistry for InMemoryRegistry {
    async fn active_symbols(
        &self,
        exchange: &Exchange,
        kind: DataKind,
    ) -> Result<BTreeSet<Symbol>, StoreError> {
        Ok(self
            .read()
            .iter()
            .filter(|s| s.data_kind == kind && s.is_on(exchange))
            .map(|s| s.symbol.clone())
            .collect())
    }

    async fn ohlc_subscriptions(&self, exchange: &Exchange) -> Result<Vec<OhlcRequest>, StoreError> {
        Ok(self
            .read()
            .iter()
            .filter(|s| s.data_kind == DataKind::Ohlc && s.is_on(exchange))
            .map(|s| OhlcRequest {
                symbol: s.symbol.clone(),
                timeframe: s.timeframe,
            })
            .collect())
    }
}
