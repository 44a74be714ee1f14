//! Timed cache of instrument constraints with a snapshot-file fallback.
//!
//! Filters change rarely, so per-symbol fetches are cached with a TTL.
//! When the exchange is unreachable the cache falls back to a JSON
//! snapshot written on every successful refresh, so a restart during an
//! outage can still quantize orders with the last-known rules.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::models::InstrumentConstraints;

use super::types::ExchangeError;
use super::ExchangeGateway;

struct CachedEntry {
    constraints: InstrumentConstraints,
    fetched_at: Instant,
}

/// Lock-guarded constraints cache shared between the engine tasks.
pub struct ConstraintsCache {
    entries: RwLock<HashMap<String, CachedEntry>>,
    ttl: Duration,
    snapshot_path: Option<PathBuf>,
}

impl ConstraintsCache {
    pub fn new(ttl: Duration, snapshot_path: Option<PathBuf>) -> Self {
        Self {
            entries: RwLock::new(Self::preload_snapshot(snapshot_path.as_deref(), ttl)),
            ttl,
            snapshot_path,
        }
    }

    /// Seed the cache from the snapshot file, treating every entry as
    /// already stale so a live fetch is still attempted first.
    fn preload_snapshot(path: Option<&std::path::Path>, ttl: Duration) -> HashMap<String, CachedEntry> {
        let mut entries = HashMap::new();
        let Some(path) = path else {
            return entries;
        };
        let Ok(raw) = std::fs::read_to_string(path) else {
            return entries;
        };

        match serde_json::from_str::<HashMap<String, InstrumentConstraints>>(&raw) {
            Ok(snapshot) => {
                let now = Instant::now();
                let stale = now.checked_sub(ttl).unwrap_or(now);
                for (symbol, constraints) in snapshot {
                    entries.insert(
                        symbol,
                        CachedEntry {
                            constraints,
                            fetched_at: stale,
                        },
                    );
                }
                debug!(count = entries.len(), "loaded constraints snapshot");
            }
            Err(e) => warn!(error = %e, "constraints snapshot unreadable, ignoring"),
        }
        entries
    }

    /// Get constraints for a symbol, fetching through the gateway when the
    /// cached entry is missing or expired. A failed fetch falls back to the
    /// stale entry if one exists.
    pub async fn get(
        &self,
        gateway: &dyn ExchangeGateway,
        symbol: &str,
    ) -> Result<InstrumentConstraints, ExchangeError> {
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(symbol) {
                if entry.fetched_at.elapsed() < self.ttl {
                    return Ok(entry.constraints.clone());
                }
            }
        }

        match gateway.get_instrument_constraints(symbol).await {
            Ok(constraints) => {
                self.insert(symbol, constraints.clone()).await;
                Ok(constraints)
            }
            Err(e) => {
                let entries = self.entries.read().await;
                if let Some(entry) = entries.get(symbol) {
                    warn!(
                        symbol = %symbol,
                        error = %e,
                        "constraints refresh failed, using stale entry"
                    );
                    return Ok(entry.constraints.clone());
                }
                Err(e)
            }
        }
    }

    /// Drop the cached entry so the next `get` refetches. Used after a
    /// filter-violation rejection, which usually means the rules changed.
    pub async fn invalidate(&self, symbol: &str) {
        self.entries.write().await.remove(symbol);
    }

    async fn insert(&self, symbol: &str, constraints: InstrumentConstraints) {
        {
            let mut entries = self.entries.write().await;
            entries.insert(
                symbol.to_string(),
                CachedEntry {
                    constraints,
                    fetched_at: Instant::now(),
                },
            );
        }
        self.write_snapshot().await;
    }

    async fn write_snapshot(&self) {
        let Some(path) = &self.snapshot_path else {
            return;
        };

        let entries = self.entries.read().await;
        let snapshot: HashMap<&String, &InstrumentConstraints> = entries
            .iter()
            .map(|(symbol, entry)| (symbol, &entry.constraints))
            .collect();

        match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    warn!(error = %e, path = %path.display(), "snapshot write failed");
                }
            }
            Err(e) => warn!(error = %e, "snapshot serialization failed"),
        }
    }
}

/// Read one symbol's constraints out of a snapshot file. Returns `None`
/// when the symbol has no entry; errors only on an unreadable file.
pub fn load_snapshot_entry(
    path: &Path,
    symbol: &str,
) -> anyhow::Result<Option<InstrumentConstraints>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading constraints snapshot {}", path.display()))?;
    let snapshot: HashMap<String, InstrumentConstraints> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing constraints snapshot {}", path.display()))?;
    Ok(snapshot.get(symbol).cloned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{LiquiditySnapshot, OrderRequest, OrderResult};
    use crate::models::{Bar, Position};
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingGateway {
        fetches: AtomicUsize,
        fail: bool,
    }

    impl CountingGateway {
        fn new(fail: bool) -> Self {
            Self {
                fetches: AtomicUsize::new(0),
                fail,
            }
        }

        fn constraints() -> InstrumentConstraints {
            InstrumentConstraints {
                symbol: "BTCUSDT".to_string(),
                min_qty: dec!(0.001),
                max_qty: None,
                step_size: dec!(0.001),
                min_price: dec!(0.01),
                tick_size: dec!(0.01),
            }
        }
    }

    #[async_trait]
    impl ExchangeGateway for CountingGateway {
        async fn place_order(&self, _: &OrderRequest) -> Result<OrderResult, ExchangeError> {
            Err(ExchangeError::Rejected("not implemented".to_string()))
        }

        async fn get_instrument_constraints(
            &self,
            _: &str,
        ) -> Result<InstrumentConstraints, ExchangeError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ExchangeError::Transient("offline".to_string()))
            } else {
                Ok(Self::constraints())
            }
        }

        async fn get_position(&self, _: &str) -> Result<Option<Position>, ExchangeError> {
            Ok(None)
        }

        async fn get_market_price(&self, _: &str) -> Result<Decimal, ExchangeError> {
            Ok(dec!(50000))
        }

        async fn get_recent_bars(
            &self,
            _: &str,
            _: &str,
            _: u32,
        ) -> Result<Vec<Bar>, ExchangeError> {
            Ok(vec![])
        }

        async fn get_liquidity(&self, _: &str) -> Result<LiquiditySnapshot, ExchangeError> {
            Ok(LiquiditySnapshot {
                bid: dec!(49999),
                ask: dec!(50001),
                quote_volume_24h: dec!(1000000),
            })
        }
    }

    #[tokio::test]
    async fn test_cache_hits_within_ttl() {
        let gateway = CountingGateway::new(false);
        let cache = ConstraintsCache::new(Duration::from_secs(3600), None);

        let first = cache.get(&gateway, "BTCUSDT").await.unwrap();
        let second = cache.get(&gateway, "BTCUSDT").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(gateway.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let gateway = CountingGateway::new(false);
        let cache = ConstraintsCache::new(Duration::from_secs(3600), None);

        cache.get(&gateway, "BTCUSDT").await.unwrap();
        cache.invalidate("BTCUSDT").await;
        cache.get(&gateway, "BTCUSDT").await.unwrap();

        assert_eq!(gateway.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fetch_failure_without_cache_errors() {
        let gateway = CountingGateway::new(true);
        let cache = ConstraintsCache::new(Duration::from_secs(3600), None);

        assert!(cache.get(&gateway, "BTCUSDT").await.is_err());
    }

    #[tokio::test]
    async fn test_snapshot_round_trips_through_restart() {
        let path = std::env::temp_dir().join(format!(
            "constraints-test-{}.json",
            uuid::Uuid::new_v4()
        ));

        {
            let gateway = CountingGateway::new(false);
            let cache = ConstraintsCache::new(Duration::from_secs(3600), Some(path.clone()));
            cache.get(&gateway, "BTCUSDT").await.unwrap();
        }

        // New cache against a dead gateway: snapshot entry is stale, the
        // live fetch fails, and the stale entry is served as fallback
        let gateway = CountingGateway::new(true);
        let cache = ConstraintsCache::new(Duration::from_secs(3600), Some(path.clone()));
        let constraints = cache.get(&gateway, "BTCUSDT").await.unwrap();
        assert_eq!(constraints.step_size, dec!(0.001));

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_snapshot_entry_loads_by_symbol() {
        let path = std::env::temp_dir().join(format!(
            "constraints-entry-test-{}.json",
            uuid::Uuid::new_v4()
        ));

        {
            let gateway = CountingGateway::new(false);
            let cache = ConstraintsCache::new(Duration::from_secs(3600), Some(path.clone()));
            cache.get(&gateway, "BTCUSDT").await.unwrap();
        }

        let entry = load_snapshot_entry(&path, "BTCUSDT").unwrap();
        assert_eq!(entry.unwrap().min_qty, dec!(0.001));

        let missing = load_snapshot_entry(&path, "DOGEUSDT").unwrap();
        assert!(missing.is_none());

        let _ = std::fs::remove_file(path);
    }
}
