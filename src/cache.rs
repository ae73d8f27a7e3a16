// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Best-effort key-value cache in front of the store.
//!
//! The cache only accelerates reads. It is never authoritative: every backend
//! failure is logged and treated as a miss, and callers re-check the store
//! before acting on anything that claims an operation completed.
//!
//! | Key | Value | TTL |
//! |-----|-------|-----|
//! | `wallet:balance:<wallet id>` | balance | short |
//! | `idempotency:<key>` | completed [`TransactionRecord`] | long |
//! | `transfer:<log id>` | [`TransferResult`] | medium |

use crate::base::{IdempotencyKey, TransactionLogId, WalletId};
use crate::config::CacheConfig;
use crate::model::{TransactionRecord, TransferResult};
use crate::money::Amount;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// External key-value cache with per-entry expiry.
pub trait CacheBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;
    fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// In-process [`CacheBackend`] with lazy expiry.
#[derive(Debug)]
pub struct MemoryCache {
    entries: DashMap<String, (String, Instant)>,
    available: AtomicBool,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulates an outage of the cache server.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check_available(&self) -> Result<(), CacheError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheBackend for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.check_available()?;
        let now = Instant::now();
        let hit = self
            .entries
            .get(key)
            .map(|entry| (entry.0.clone(), entry.1 > now));
        match hit {
            Some((value, true)) => Ok(Some(value)),
            Some((_, false)) => {
                self.entries.remove_if(key, |_, (_, expires)| *expires <= now);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        self.check_available()?;
        self.entries
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.check_available()?;
        self.entries.remove(key);
        Ok(())
    }
}

/// Typed ledger view over an optional [`CacheBackend`].
#[derive(Clone)]
pub struct LedgerCache {
    backend: Option<Arc<dyn CacheBackend>>,
    balance_ttl: Duration,
    idempotency_ttl: Duration,
    transfer_ttl: Duration,
}

impl LedgerCache {
    pub fn new(backend: Arc<dyn CacheBackend>, config: &CacheConfig) -> Self {
        Self {
            backend: config.enabled.then_some(backend),
            balance_ttl: config.balance_ttl(),
            idempotency_ttl: config.idempotency_ttl(),
            transfer_ttl: config.transfer_ttl(),
        }
    }

    /// A cache that never hits.
    pub fn disabled() -> Self {
        let config = CacheConfig::default();
        Self {
            backend: None,
            balance_ttl: config.balance_ttl(),
            idempotency_ttl: config.idempotency_ttl(),
            transfer_ttl: config.transfer_ttl(),
        }
    }

    pub fn balance(&self, wallet_id: WalletId) -> Option<Amount> {
        self.read(&balance_key(wallet_id))
    }

    pub fn store_balance(&self, wallet_id: WalletId, balance: Amount) {
        self.write(&balance_key(wallet_id), &balance, self.balance_ttl);
    }

    pub fn invalidate_balance(&self, wallet_id: WalletId) {
        self.remove(&balance_key(wallet_id));
    }

    pub fn transaction(&self, key: &IdempotencyKey) -> Option<TransactionRecord> {
        self.read(&idempotency_key(key))
    }

    pub fn store_transaction(&self, record: &TransactionRecord) {
        self.write(
            &idempotency_key(&record.log.idempotency_key),
            record,
            self.idempotency_ttl,
        );
    }

    pub fn invalidate_transaction(&self, key: &IdempotencyKey) {
        self.remove(&idempotency_key(key));
    }

    pub fn transfer(&self, log_id: TransactionLogId) -> Option<TransferResult> {
        self.read(&transfer_key(log_id))
    }

    pub fn store_transfer(&self, result: &TransferResult) {
        self.write(&transfer_key(result.transaction_log_id), result, self.transfer_ttl);
    }

    fn read<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let backend = self.backend.as_ref()?;
        let raw = match backend.get(key) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(key, error = %e, "cache read failed, falling back to store");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => {
                debug!(key, "cache hit");
                Some(value)
            }
            Err(e) => {
                warn!(key, error = %e, "discarding undecodable cache entry");
                self.remove(key);
                None
            }
        }
    }

    fn write<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let Some(backend) = self.backend.as_ref() else {
            return;
        };
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key, error = %e, "failed to encode cache entry");
                return;
            }
        };
        if let Err(e) = backend.set(key, raw, ttl) {
            warn!(key, error = %e, "cache write failed");
        }
    }

    fn remove(&self, key: &str) {
        let Some(backend) = self.backend.as_ref() else {
            return;
        };
        if let Err(e) = backend.delete(key) {
            warn!(key, error = %e, "cache delete failed");
        }
    }
}

fn balance_key(wallet_id: WalletId) -> String {
    format!("wallet:balance:{wallet_id}")
}

fn idempotency_key(key: &IdempotencyKey) -> String {
    format!("idempotency:{key}")
}

fn transfer_key(log_id: TransactionLogId) -> String {
    format!("transfer:{log_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn cache_with(backend: &Arc<MemoryCache>, config: &CacheConfig) -> LedgerCache {
        LedgerCache::new(Arc::clone(backend) as Arc<dyn CacheBackend>, config)
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = MemoryCache::new();
        cache
            .set("k", "v".to_string(), Duration::from_millis(20))
            .unwrap();
        assert_eq!(cache.get("k").unwrap(), Some("v".to_string()));

        thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get("k").unwrap(), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn balance_round_trips_and_invalidates() {
        let backend = Arc::new(MemoryCache::new());
        let cache = cache_with(&backend, &CacheConfig::default());
        let wallet_id = WalletId::new();
        let balance = Amount::parse("12.34").unwrap();

        assert_eq!(cache.balance(wallet_id), None);
        cache.store_balance(wallet_id, balance);
        assert_eq!(cache.balance(wallet_id), Some(balance));

        cache.invalidate_balance(wallet_id);
        assert_eq!(cache.balance(wallet_id), None);
    }

    #[test]
    fn outage_degrades_to_misses() {
        let backend = Arc::new(MemoryCache::new());
        let cache = cache_with(&backend, &CacheConfig::default());
        let wallet_id = WalletId::new();
        cache.store_balance(wallet_id, Amount::ZERO);

        backend.set_available(false);
        assert_eq!(cache.balance(wallet_id), None);
        cache.store_balance(wallet_id, Amount::ZERO);
        cache.invalidate_balance(wallet_id);

        backend.set_available(true);
        assert_eq!(cache.balance(wallet_id), Some(Amount::ZERO));
    }

    #[test]
    fn undecodable_entries_are_dropped() {
        let backend = Arc::new(MemoryCache::new());
        let cache = cache_with(&backend, &CacheConfig::default());
        let wallet_id = WalletId::new();
        backend
            .set(&balance_key(wallet_id), "not json".to_string(), Duration::from_secs(60))
            .unwrap();

        assert_eq!(cache.balance(wallet_id), None);
        assert!(backend.is_empty());
    }

    #[test]
    fn disabled_config_never_touches_backend() {
        let backend = Arc::new(MemoryCache::new());
        let config = CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        };
        let cache = cache_with(&backend, &config);
        cache.store_balance(WalletId::new(), Amount::ZERO);
        assert!(backend.is_empty());
        assert_eq!(LedgerCache::disabled().balance(WalletId::new()), None);
    }
}
