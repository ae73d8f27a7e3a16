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

//! Idempotency key protocol.
//!
//! | Prior log for the key | Decision |
//! |-----------------------|----------|
//! | none | [`GuardDecision::Proceed`] |
//! | `COMPLETED` | [`GuardDecision::Replay`] with the stored entries |
//! | `PENDING` | [`LedgerError::TransactionInProgress`] |
//! | `FAILED` | [`LedgerError::KeyAlreadyFailed`], whatever the new parameters |
//!
//! The pre-check is advisory. Two first attempts can both see "none", so the
//! unique index on the key is the real arbiter: [`IdempotencyGuard::claim`]
//! turns an insert conflict into a re-read and the same decision table.

use crate::base::IdempotencyKey;
use crate::cache::LedgerCache;
use crate::error::{LedgerError, StoreError};
use crate::model::{TransactionLog, TransactionRecord, TransactionStatus};
use crate::store::{IDEMPOTENCY_KEY_INDEX, Store, TransactionLogRepository};
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of checking a key before executing an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    /// No attempt exists; the caller must claim the key before mutating.
    Proceed,
    /// The operation already completed; return this instead of re-executing.
    Replay(TransactionRecord),
}

/// Guards operations against double application.
pub struct IdempotencyGuard<S> {
    store: Arc<S>,
    cache: LedgerCache,
}

impl<S: Store> IdempotencyGuard<S> {
    pub fn new(store: Arc<S>, cache: LedgerCache) -> Self {
        Self { store, cache }
    }

    /// Decides whether an attempt with `key` may run.
    ///
    /// The log status always comes from the store. The cache only saves the
    /// entry lookup of a replay, and only when it agrees with the stored log.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::TransactionInProgress`] - Another attempt owns the key.
    /// - [`LedgerError::KeyAlreadyFailed`] - An earlier attempt failed.
    pub fn check(&self, key: &IdempotencyKey) -> Result<GuardDecision, LedgerError> {
        let stored = self.store.find_log_by_key(key)?;
        self.decide(stored)
    }

    /// Inserts the PENDING `log` through `unit`, claiming its key.
    ///
    /// Returns `Ok(None)` when the key is now owned by `log`. When a concurrent
    /// attempt got there first, re-reads its log and either replays it
    /// (`Ok(Some(..))`) or fails with the conflict it is in.
    pub fn claim<U: TransactionLogRepository>(
        &self,
        unit: &mut U,
        log: &TransactionLog,
    ) -> Result<Option<TransactionRecord>, LedgerError> {
        match unit.insert_log(log) {
            Ok(()) => {
                debug!(
                    key = %log.idempotency_key,
                    transaction_log_id = %log.id,
                    "idempotency key claimed"
                );
                Ok(None)
            }
            Err(StoreError::UniqueViolation {
                index: IDEMPOTENCY_KEY_INDEX,
                ..
            }) => {
                debug!(key = %log.idempotency_key, "lost idempotency key race, re-reading");
                match self.decide(self.store.find_log_by_key(&log.idempotency_key)?)? {
                    GuardDecision::Replay(record) => Ok(Some(record)),
                    // Owner has not committed its log yet.
                    GuardDecision::Proceed => Err(LedgerError::TransactionInProgress),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Confirms that a written-ahead `log` is still the live PENDING owner of
    /// its key.
    ///
    /// Called with the wallet locks held, so a concurrent reconciliation that
    /// already failed the log is observed before anything is applied.
    pub fn ensure_pending(&self, log: &TransactionLog) -> Result<(), LedgerError> {
        match self.store.find_log_by_key(&log.idempotency_key)? {
            Some(current)
                if current.id == log.id && current.status == TransactionStatus::Pending =>
            {
                Ok(())
            }
            Some(current) if current.status == TransactionStatus::Failed => {
                warn!(
                    transaction_log_id = %current.id,
                    cause = current.failure_cause().unwrap_or_default(),
                    "pending log was failed before it could complete"
                );
                Err(LedgerError::KeyAlreadyFailed)
            }
            _ => Err(LedgerError::TransactionInProgress),
        }
    }

    /// Returns the log for `key` with its entries, in whatever state it is.
    pub fn lookup(&self, key: &IdempotencyKey) -> Result<Option<TransactionRecord>, LedgerError> {
        match self.store.find_log_by_key(key)? {
            Some(log) => Ok(Some(self.record_for(log)?)),
            None => Ok(None),
        }
    }

    fn decide(&self, stored: Option<TransactionLog>) -> Result<GuardDecision, LedgerError> {
        let Some(log) = stored else {
            return Ok(GuardDecision::Proceed);
        };
        match log.status {
            TransactionStatus::Completed => {
                debug!(
                    key = %log.idempotency_key,
                    transaction_log_id = %log.id,
                    "replaying completed transaction"
                );
                Ok(GuardDecision::Replay(self.record_for(log)?))
            }
            TransactionStatus::Pending => {
                debug!(key = %log.idempotency_key, "transaction still pending");
                Err(LedgerError::TransactionInProgress)
            }
            TransactionStatus::Failed => {
                debug!(key = %log.idempotency_key, "idempotency key already failed");
                Err(LedgerError::KeyAlreadyFailed)
            }
        }
    }

    fn record_for(&self, log: TransactionLog) -> Result<TransactionRecord, LedgerError> {
        if let Some(cached) = self.cache.transaction(&log.idempotency_key) {
            if cached.log.id == log.id && cached.log.status == log.status {
                return Ok(TransactionRecord {
                    log,
                    entries: cached.entries,
                });
            }
            warn!(key = %log.idempotency_key, "idempotency cache disagrees with store, evicting");
            self.cache.invalidate_transaction(&log.idempotency_key);
        }

        let entries = self.store.entries_for_log(log.id)?;
        let record = TransactionRecord { log, entries };
        if record.log.status.is_terminal() {
            self.cache.store_transaction(&record);
        }
        Ok(record)
    }
}
