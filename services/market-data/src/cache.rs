//! Coalescing depth cache
//!
//! Holds the latest unflushed snapshot per symbol. Inserts overwrite
//! (last write wins, arrival order only). `drain` takes the whole map and
//! leaves an empty one in a single locked step, so an insert racing a drain
//! lands either in the drained batch or in the fresh map.

use std::collections::HashMap;
use std::mem;
use std::sync::{Mutex, MutexGuard, PoisonError};

use types::prelude::{DepthSnapshot, Symbol};

#[derive(Debug, Default)]
pub struct CoalescingCache {
    entries: Mutex<HashMap<Symbol, DepthSnapshot>>,
}

impl CoalescingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `snapshot`, replacing any unflushed one for the same symbol.
    /// Returns true when a previous snapshot was overwritten.
    pub fn insert(&self, snapshot: DepthSnapshot) -> bool {
        self.lock()
            .insert(snapshot.symbol.clone(), snapshot)
            .is_some()
    }

    /// Take everything currently cached and clear it.
    pub fn drain(&self) -> Vec<DepthSnapshot> {
        let taken = mem::take(&mut *self.lock());
        taken.into_values().collect()
    }

    pub fn get(&self, symbol: &str) -> Option<DepthSnapshot> {
        self.lock().get(symbol).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Symbol, DepthSnapshot>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::sync::Arc;
    use std::thread;
    use types::prelude::{Exchange, PriceLevel};

    fn snapshot(symbol: &str, ts: i64) -> DepthSnapshot {
        DepthSnapshot {
            symbol: Symbol::new(symbol),
            exchange: Exchange::okx(),
            timestamp: ts,
            bids: vec![PriceLevel::new(Decimal::from(100), Decimal::ONE)],
            asks: vec![PriceLevel::new(Decimal::from(101), Decimal::ONE)],
        }
    }

    #[test]
    fn test_last_write_wins() {
        let cache = CoalescingCache::new();
        assert!(!cache.insert(snapshot("BTC-USDT", 2)));
        // Older timestamp still overwrites: arrival order is all that counts.
        assert!(cache.insert(snapshot("BTC-USDT", 1)));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("BTC-USDT").unwrap().timestamp, 1);
    }

    #[test]
    fn test_drain_empties_cache() {
        let cache = CoalescingCache::new();
        cache.insert(snapshot("A", 1));
        cache.insert(snapshot("B", 1));

        let mut batch = cache.drain();
        batch.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].symbol.as_str(), "A");
        assert!(cache.is_empty());
        assert!(cache.drain().is_empty());
    }

    #[test]
    fn test_concurrent_writes_are_never_lost() {
        let cache = Arc::new(CoalescingCache::new());
        let writes_per_symbol = 2_000;
        let symbols = ["A", "B", "C", "D"];

        let writers: Vec<_> = symbols
            .iter()
            .map(|sym| {
                let cache = Arc::clone(&cache);
                let sym = sym.to_string();
                thread::spawn(move || {
                    for ts in 1..=writes_per_symbol {
                        cache.insert(snapshot(&sym, ts));
                    }
                })
            })
            .collect();

        let drainer = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                let mut drained = Vec::new();
                for _ in 0..500 {
                    drained.extend(cache.drain());
                    thread::yield_now();
                }
                drained
            })
        };

        for w in writers {
            w.join().unwrap();
        }
        let mut seen = drainer.join().unwrap();
        seen.extend(cache.drain());

        // The final write for every symbol must surface in exactly one drain.
        for sym in symbols {
            let finals = seen
                .iter()
                .filter(|s| s.symbol.as_str() == sym && s.timestamp == writes_per_symbol)
                .count();
            assert_eq!(finals, 1, "final write for {sym} lost or duplicated");
        }
        assert!(cache.is_empty());
    }
}
