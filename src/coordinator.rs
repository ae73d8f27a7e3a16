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

//! Wallet operations.
//!
//! The [`TransferCoordinator`] is the only writer of wallet balances. Every
//! balance-changing call runs the same state machine:
//!
//! ```text
//! VALIDATE -> IDEMPOTENCY_CHECK -> LOCK -> VERIFY_FUNDS -> MUTATE -> COMMIT
//!     \              \               \           \            \
//!      +--------------+---------------+-----------+------------+--> ABORT
//! ```
//!
//! # Locking
//!
//! Wallet rows are locked inside the unit of work and held until it commits
//! or rolls back. An operation touching two wallets always locks them in
//! ascending [`WalletId`] order, whatever the transfer direction, so two
//! opposite transfers between the same pair can never wait on each other.
//!
//! # Transaction logs
//!
//! With [`PendingLogMode::WriteAhead`] the PENDING log commits on its own
//! before any balance is touched. A business failure then rolls back the
//! balance unit and records the log as FAILED with its cause, which retires
//! the key. A crash between the two units leaves a PENDING log that owns no
//! entries; [`TransferCoordinator::reconcile_stale_pending`] fails those.
//!
//! With [`PendingLogMode::Inline`] the log shares the balance unit and a
//! failure leaves nothing behind.

use crate::base::{IdempotencyKey, LedgerEntryId, OwnerId, TransactionLogId, WalletId};
use crate::cache::LedgerCache;
use crate::config::{LedgerConfig, PendingLogMode};
use crate::error::{LedgerError, StoreError};
use crate::idempotency::{GuardDecision, IdempotencyGuard};
use crate::model::{
    EntryDirection, EntryRequest, History, LedgerEntry, Metadata, Operation, TransactionLog,
    TransactionRecord, TransactionStatus, TransferRequest, TransferResult, Wallet, WalletView,
};
use crate::money::Amount;
use crate::store::{
    LedgerRepository, Store, TransactionLogRepository, UnitOfWork, WALLET_OWNER_INDEX,
    WalletRepository,
};
use chrono::{Duration, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

const INITIAL_BALANCE_DESCRIPTION: &str = "Initial balance";
const ABANDONED_CAUSE: &str = "abandoned";

/// Orchestrates credits, debits, and transfers over a [`Store`].
///
/// # Invariants
///
/// - A wallet balance is never negative.
/// - A wallet balance equals the signed sum of its ledger entries.
/// - A transfer writes exactly one DEBIT and one CREDIT entry under one log.
/// - An idempotency key is applied at most once.
pub struct TransferCoordinator<S: Store> {
    store: Arc<S>,
    cache: LedgerCache,
    guard: IdempotencyGuard<S>,
    config: LedgerConfig,
    /// Per-wallet count of committed balance changes.
    balance_versions: DashMap<WalletId, u64>,
}

impl<S: Store> TransferCoordinator<S> {
    /// Creates a coordinator with the default configuration and no cache.
    pub fn new(store: Arc<S>) -> Self {
        Self::with_cache(store, LedgerCache::disabled(), LedgerConfig::default())
    }

    pub fn with_cache(store: Arc<S>, cache: LedgerCache, config: LedgerConfig) -> Self {
        let guard = IdempotencyGuard::new(Arc::clone(&store), cache.clone());
        TransferCoordinator {
            store,
            cache,
            guard,
            config,
            balance_versions: DashMap::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Opens a wallet for `owner_id`.
    ///
    /// A positive initial balance is recorded as a CREDIT entry in the same
    /// unit, so the ledger accounts for every unit of the balance.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidAmount`] - Initial balance is not a number.
    /// - [`LedgerError::NegativeInitialBalance`] - Initial balance below zero.
    /// - [`LedgerError::WalletAlreadyExists`] - Owner already has a wallet.
    pub fn create_wallet(
        &self,
        owner_id: OwnerId,
        initial_balance: Option<&str>,
    ) -> Result<Wallet, LedgerError> {
        let initial = match initial_balance {
            Some(raw) => Amount::parse(raw)?,
            None => Amount::ZERO,
        };
        if initial.is_negative() {
            return Err(LedgerError::NegativeInitialBalance);
        }
        if self.store.find_wallet_by_owner(&owner_id)?.is_some() {
            return Err(LedgerError::WalletAlreadyExists);
        }

        let wallet = Wallet::new(owner_id, initial);
        let mut unit = self.store.begin()?;
        match unit.insert_wallet(wallet.clone()) {
            Ok(()) => {}
            Err(StoreError::UniqueViolation {
                index: WALLET_OWNER_INDEX,
                ..
            }) => return Err(LedgerError::WalletAlreadyExists),
            Err(e) => return Err(e.into()),
        }
        if initial.is_positive() {
            unit.append_entry(LedgerEntry {
                id: LedgerEntryId::new(),
                wallet_id: wallet.id,
                direction: EntryDirection::Credit,
                amount: initial,
                balance_before: Amount::ZERO,
                balance_after: initial,
                status: TransactionStatus::Completed,
                reference: None,
                description: Some(INITIAL_BALANCE_DESCRIPTION.to_string()),
                metadata: None,
                transaction_log_id: None,
                created_at: wallet.created_at,
            })?;
        }
        unit.commit()?;

        info!(
            wallet_id = %wallet.id,
            owner_id = %wallet.owner_id,
            balance = %wallet.balance,
            "wallet created"
        );
        Ok(wallet)
    }

    /// Returns the wallet with its most recent entries.
    pub fn get_wallet(&self, wallet_id: WalletId) -> Result<WalletView, LedgerError> {
        let wallet = self
            .store
            .find_wallet(wallet_id)?
            .ok_or(LedgerError::WalletNotFound)?;
        self.view(wallet)
    }

    pub fn get_wallet_by_owner(&self, owner_id: &OwnerId) -> Result<WalletView, LedgerError> {
        let wallet = self
            .store
            .find_wallet_by_owner(owner_id)?
            .ok_or(LedgerError::WalletNotFound)?;
        self.view(wallet)
    }

    /// All wallets, oldest first.
    pub fn wallets(&self) -> Result<Vec<Wallet>, LedgerError> {
        Ok(self.store.list_wallets()?)
    }

    /// Returns the balance, from the cache when it holds one.
    pub fn get_balance(&self, wallet_id: WalletId) -> Result<Amount, LedgerError> {
        if let Some(balance) = self.cache.balance(wallet_id) {
            return Ok(balance);
        }
        let version = self.balance_version(wallet_id);
        let wallet = self
            .store
            .find_wallet(wallet_id)?
            .ok_or(LedgerError::WalletNotFound)?;
        self.cache_balance(wallet_id, version, wallet.balance);
        Ok(wallet.balance)
    }

    /// Adds funds to a wallet.
    ///
    /// Without an idempotency key the call is not replay protected. With one,
    /// a repeat returns the entry of the first successful call.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidAmount`] / [`LedgerError::NonPositiveAmount`]
    /// - [`LedgerError::WalletNotFound`]
    /// - [`LedgerError::TransactionInProgress`] / [`LedgerError::KeyAlreadyFailed`]
    /// - [`LedgerError::IdempotencyKeyReused`] - Key belongs to another operation.
    pub fn credit(&self, request: EntryRequest) -> Result<LedgerEntry, LedgerError> {
        self.apply_entry(EntryDirection::Credit, request)
    }

    /// Removes funds from a wallet.
    ///
    /// Same contract as [`credit`](Self::credit), and additionally fails with
    /// [`LedgerError::InsufficientFunds`] when the balance is below the amount.
    pub fn debit(&self, request: EntryRequest) -> Result<LedgerEntry, LedgerError> {
        self.apply_entry(EntryDirection::Debit, request)
    }

    /// Moves funds between two wallets as one debit and one credit entry.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::MissingIdempotencyKey`] - Key absent or blank.
    /// - [`LedgerError::InvalidAmount`] / [`LedgerError::NonPositiveAmount`]
    /// - [`LedgerError::SelfTransfer`] - Source and destination are equal.
    /// - [`LedgerError::WalletNotFound`] - Either wallet is missing.
    /// - [`LedgerError::InsufficientFunds`] - Source balance below the amount.
    /// - [`LedgerError::TransactionInProgress`] / [`LedgerError::KeyAlreadyFailed`]
    /// - [`LedgerError::IdempotencyKeyReused`] - Key belongs to another operation.
    pub fn transfer(&self, request: TransferRequest) -> Result<TransferResult, LedgerError> {
        // VALIDATE
        let key = IdempotencyKey::new(request.idempotency_key.as_str())?;
        let amount = positive_amount(&request.amount)?;
        if request.from_wallet_id == request.to_wallet_id {
            return Err(LedgerError::SelfTransfer);
        }

        // IDEMPOTENCY_CHECK
        if let GuardDecision::Replay(record) = self.guard.check(&key)? {
            return self.replayed_transfer(record);
        }

        let mut log_metadata =
            log_metadata(&request.reference, &request.description, &request.metadata);
        log_metadata.insert(
            "fromWalletId".to_string(),
            Value::String(request.from_wallet_id.to_string()),
        );
        log_metadata.insert(
            "toWalletId".to_string(),
            Value::String(request.to_wallet_id.to_string()),
        );
        let log = TransactionLog::pending(
            key,
            Operation::Transfer,
            request.from_wallet_id,
            amount,
            log_metadata,
        );

        let mutation = TransferMutation {
            from_wallet_id: request.from_wallet_id,
            to_wallet_id: request.to_wallet_id,
            amount,
            reference: request.reference,
            description: request.description,
            metadata: request.metadata,
        };
        match self.execute(log, &mutation)? {
            Execution::Replayed(record) => self.replayed_transfer(record),
            Execution::Applied { value, log } => {
                self.balance_changed(value.debit_entry.wallet_id);
                self.balance_changed(value.credit_entry.wallet_id);
                self.cache.store_transfer(&value);
                self.cache.store_transaction(&TransactionRecord {
                    log: log.clone(),
                    entries: vec![value.debit_entry.clone(), value.credit_entry.clone()],
                });
                info!(
                    transaction_log_id = %log.id,
                    from_wallet_id = %value.debit_entry.wallet_id,
                    to_wallet_id = %value.credit_entry.wallet_id,
                    amount = %amount,
                    "transfer committed"
                );
                Ok(value)
            }
        }
    }

    /// Returns a window of the wallet's entries, newest first.
    ///
    /// `limit` defaults to the configured page size and is clamped to the
    /// configured maximum; `offset` defaults to zero.
    pub fn get_history(
        &self,
        wallet_id: WalletId,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<History, LedgerError> {
        if self.store.find_wallet(wallet_id)?.is_none() {
            return Err(LedgerError::WalletNotFound);
        }
        let limit = limit
            .unwrap_or(self.config.history.default_limit)
            .min(self.config.history.max_limit);
        Ok(self
            .store
            .wallet_history(wallet_id, limit, offset.unwrap_or(0))?)
    }

    /// Returns the log for `key` together with the entries it produced.
    pub fn get_transaction_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<TransactionRecord, LedgerError> {
        let key = IdempotencyKey::new(key)?;
        self.guard
            .lookup(&key)?
            .ok_or(LedgerError::TransactionNotFound)
    }

    pub fn entries_by_reference(&self, reference: &str) -> Result<Vec<LedgerEntry>, LedgerError> {
        Ok(self.store.entries_by_reference(reference)?)
    }

    /// Fails PENDING logs created more than `older_than` ago.
    ///
    /// A PENDING log never owns entries, so failing it cannot orphan a
    /// balance change. Each log is re-read under its wallet's row lock, which
    /// a live attempt holds from mutation to commit, so a log that completes
    /// concurrently is left alone. Returns the ids of the logs it failed.
    pub fn reconcile_stale_pending(
        &self,
        older_than: Duration,
    ) -> Result<Vec<TransactionLogId>, LedgerError> {
        let cutoff = Utc::now() - older_than;
        let stale = self
            .store
            .logs_created_before(TransactionStatus::Pending, cutoff)?;

        let mut failed = Vec::new();
        for candidate in stale {
            let mut unit = self.store.begin()?;
            unit.lock_wallet(candidate.wallet_id)?;
            let Some(mut log) = self.store.find_log_by_key(&candidate.idempotency_key)? else {
                continue;
            };
            if log.id != candidate.id || log.status != TransactionStatus::Pending {
                continue;
            }
            log.fail(ABANDONED_CAUSE);
            unit.update_log(&log)?;
            unit.commit()?;
            self.cache.invalidate_transaction(&log.idempotency_key);
            warn!(
                transaction_log_id = %log.id,
                key = %log.idempotency_key,
                "stale pending log failed"
            );
            failed.push(log.id);
        }
        Ok(failed)
    }

    fn balance_version(&self, wallet_id: WalletId) -> u64 {
        self.balance_versions.get(&wallet_id).map_or(0, |version| *version)
    }

    /// Caches `balance` unless a write to the wallet committed after `version`
    /// was read.
    ///
    /// A write landing between this check and the cache write still leaves a
    /// stale value, bounded by the balance TTL.
    fn cache_balance(&self, wallet_id: WalletId, version: u64, balance: Amount) {
        if self.balance_version(wallet_id) == version {
            self.cache.store_balance(wallet_id, balance);
        } else {
            debug!(wallet_id = %wallet_id, "balance changed during read, not caching");
        }
    }

    /// Called after a commit that changed the wallet's balance.
    fn balance_changed(&self, wallet_id: WalletId) {
        *self.balance_versions.entry(wallet_id).or_insert(0) += 1;
        self.cache.invalidate_balance(wallet_id);
    }

    fn view(&self, wallet: Wallet) -> Result<WalletView, LedgerError> {
        let recent = self
            .store
            .wallet_history(wallet.id, self.config.history.recent_entries, 0)?;
        Ok(WalletView {
            wallet,
            recent_entries: recent.entries,
        })
    }

    fn apply_entry(
        &self,
        direction: EntryDirection,
        request: EntryRequest,
    ) -> Result<LedgerEntry, LedgerError> {
        // VALIDATE
        let amount = positive_amount(&request.amount)?;
        let client_key = match request.idempotency_key.as_deref() {
            Some(raw) if !raw.trim().is_empty() => Some(IdempotencyKey::new(raw)?),
            _ => None,
        };

        let operation = match direction {
            EntryDirection::Credit => Operation::Credit,
            EntryDirection::Debit => Operation::Debit,
        };

        // IDEMPOTENCY_CHECK
        if let Some(key) = &client_key {
            if let GuardDecision::Replay(record) = self.guard.check(key)? {
                return first_entry(record, operation);
            }
        }

        let log = TransactionLog::pending(
            client_key.clone().unwrap_or_else(IdempotencyKey::generate),
            operation,
            request.wallet_id,
            amount,
            log_metadata(&request.reference, &request.description, &request.metadata),
        );

        let mutation = EntryMutation {
            direction,
            wallet_id: request.wallet_id,
            amount,
            reference: request.reference,
            description: request.description,
            metadata: request.metadata,
        };
        match self.execute(log, &mutation)? {
            Execution::Replayed(record) => first_entry(record, operation),
            Execution::Applied { value, log } => {
                self.balance_changed(value.wallet_id);
                if client_key.is_some() {
                    self.cache.store_transaction(&TransactionRecord {
                        log: log.clone(),
                        entries: vec![value.clone()],
                    });
                }
                info!(
                    transaction_log_id = %log.id,
                    wallet_id = %value.wallet_id,
                    amount = %amount,
                    balance = %value.balance_after,
                    "{} committed",
                    match direction {
                        EntryDirection::Credit => "credit",
                        EntryDirection::Debit => "debit",
                    }
                );
                Ok(value)
            }
        }
    }

    /// Claims the key with `log`, applies `mutation`, and completes the log.
    fn execute<M: Mutation>(
        &self,
        log: TransactionLog,
        mutation: &M,
    ) -> Result<Execution<M::Output>, LedgerError> {
        match self.config.pending_log {
            PendingLogMode::WriteAhead => self.execute_write_ahead(log, mutation),
            PendingLogMode::Inline => self.execute_inline(log, mutation),
        }
    }

    fn execute_write_ahead<M: Mutation>(
        &self,
        mut log: TransactionLog,
        mutation: &M,
    ) -> Result<Execution<M::Output>, LedgerError> {
        let mut unit = self.store.begin()?;
        if let Some(record) = self.guard.claim(&mut unit, &log)? {
            return Ok(Execution::Replayed(record));
        }
        unit.commit()?;
        debug!(transaction_log_id = %log.id, "pending log written ahead");

        let mut unit = self.store.begin()?;
        let value = match mutation.apply(&mut unit, &log) {
            Ok(value) => value,
            Err(e) => {
                unit.rollback();
                if !matches!(e, LedgerError::Store(_)) {
                    self.record_failure(log, &e);
                }
                return Err(e);
            }
        };
        self.guard.ensure_pending(&log)?;
        log.complete();
        unit.update_log(&log)?;
        unit.commit()?;
        Ok(Execution::Applied { value, log })
    }

    fn execute_inline<M: Mutation>(
        &self,
        mut log: TransactionLog,
        mutation: &M,
    ) -> Result<Execution<M::Output>, LedgerError> {
        let mut unit = self.store.begin()?;
        if let Some(record) = self.guard.claim(&mut unit, &log)? {
            return Ok(Execution::Replayed(record));
        }
        let value = match mutation.apply(&mut unit, &log) {
            Ok(value) => value,
            Err(e) => {
                // The log rolls back with the unit.
                unit.rollback();
                warn!(
                    transaction_log_id = %log.id,
                    key = %log.idempotency_key,
                    error = %e,
                    "operation rolled back"
                );
                return Err(e);
            }
        };
        log.complete();
        unit.update_log(&log)?;
        unit.commit()?;
        Ok(Execution::Applied { value, log })
    }

    /// Records a written-ahead log as FAILED with the cause of `error`.
    ///
    /// A log that already reached a terminal state is left untouched.
    /// Storage errors here are logged, not returned: the caller reports the
    /// business failure, and the log stays PENDING for reconciliation.
    fn record_failure(&self, log: TransactionLog, error: &LedgerError) {
        // Same row lock as reconciliation, so an abandoned log is seen here.
        let recorded = self.store.begin().and_then(|mut unit| {
            unit.lock_wallet(log.wallet_id)?;
            match self.store.find_log_by_key(&log.idempotency_key)? {
                Some(mut current)
                    if current.id == log.id && current.status == TransactionStatus::Pending =>
                {
                    current.fail(&error.to_string());
                    unit.update_log(&current)?;
                    unit.commit()?;
                    Ok(true)
                }
                _ => Ok(false),
            }
        });
        match recorded {
            Ok(true) => {
                warn!(
                    transaction_log_id = %log.id,
                    key = %log.idempotency_key,
                    error = %error,
                    "transaction failed"
                );
            }
            Ok(false) => {
                debug!(transaction_log_id = %log.id, error = %error, "log already settled");
            }
            Err(e) => {
                warn!(
                    transaction_log_id = %log.id,
                    error = %error,
                    store_error = %e,
                    "failed to record transaction failure"
                );
            }
        }
    }

    fn replayed_transfer(&self, record: TransactionRecord) -> Result<TransferResult, LedgerError> {
        ensure_operation(&record, Operation::Transfer)?;
        if let Some(result) = self.cache.transfer(record.log.id) {
            if result.idempotency_key == record.log.idempotency_key {
                return Ok(result);
            }
        }
        let find = |direction: EntryDirection| {
            record
                .entries
                .iter()
                .find(|entry| entry.direction == direction)
                .cloned()
                .ok_or_else(|| {
                    StoreError::MissingRow(format!("transfer entry of log {}", record.log.id))
                })
        };
        let result = TransferResult {
            transaction_log_id: record.log.id,
            idempotency_key: record.log.idempotency_key.clone(),
            debit_entry: find(EntryDirection::Debit)?,
            credit_entry: find(EntryDirection::Credit)?,
        };
        self.cache.store_transfer(&result);
        Ok(result)
    }
}

/// Result of running an operation under its idempotency key.
enum Execution<T> {
    Applied { value: T, log: TransactionLog },
    /// A concurrent attempt with the same key completed first.
    Replayed(TransactionRecord),
}

/// Balance change applied inside a unit of work: LOCK, VERIFY_FUNDS, MUTATE.
trait Mutation {
    type Output;

    fn apply<U: UnitOfWork>(
        &self,
        unit: &mut U,
        log: &TransactionLog,
    ) -> Result<Self::Output, LedgerError>;
}

struct EntryMutation {
    direction: EntryDirection,
    wallet_id: WalletId,
    amount: Amount,
    reference: Option<String>,
    description: Option<String>,
    metadata: Option<Metadata>,
}

impl Mutation for EntryMutation {
    type Output = LedgerEntry;

    fn apply<U: UnitOfWork>(
        &self,
        unit: &mut U,
        log: &TransactionLog,
    ) -> Result<LedgerEntry, LedgerError> {
        let mut wallet = unit
            .lock_wallet(self.wallet_id)?
            .ok_or(LedgerError::WalletNotFound)?;

        let balance_before = wallet.balance;
        let balance_after = match self.direction {
            EntryDirection::Credit => balance_before.add(self.amount)?,
            EntryDirection::Debit => {
                if balance_before < self.amount {
                    return Err(LedgerError::InsufficientFunds);
                }
                balance_before.subtract(self.amount)?
            }
        };

        wallet.balance = balance_after;
        wallet.updated_at = Utc::now();
        unit.update_wallet(&wallet)?;

        let entry = LedgerEntry {
            id: LedgerEntryId::new(),
            wallet_id: wallet.id,
            direction: self.direction,
            amount: self.amount,
            balance_before,
            balance_after,
            status: TransactionStatus::Completed,
            reference: self.reference.clone(),
            description: self.description.clone(),
            metadata: self.metadata.clone(),
            transaction_log_id: Some(log.id),
            created_at: wallet.updated_at,
        };
        unit.append_entry(entry.clone())?;
        Ok(entry)
    }
}

struct TransferMutation {
    from_wallet_id: WalletId,
    to_wallet_id: WalletId,
    amount: Amount,
    reference: Option<String>,
    description: Option<String>,
    metadata: Option<Metadata>,
}

impl TransferMutation {
    fn leg_metadata(
        &self,
        counterpart_field: &str,
        counterpart: WalletId,
        log: &TransactionLog,
    ) -> Metadata {
        let mut metadata = self.metadata.clone().unwrap_or_default();
        metadata.insert(counterpart_field.to_string(), Value::String(counterpart.to_string()));
        metadata.insert(
            "idempotencyKey".to_string(),
            Value::String(log.idempotency_key.to_string()),
        );
        metadata
    }
}

impl Mutation for TransferMutation {
    type Output = TransferResult;

    fn apply<U: UnitOfWork>(
        &self,
        unit: &mut U,
        log: &TransactionLog,
    ) -> Result<TransferResult, LedgerError> {
        // Canonical order: lower id first, regardless of direction.
        let (first, second) = if self.from_wallet_id < self.to_wallet_id {
            (self.from_wallet_id, self.to_wallet_id)
        } else {
            (self.to_wallet_id, self.from_wallet_id)
        };
        let first_wallet = unit.lock_wallet(first)?;
        let second_wallet = unit.lock_wallet(second)?;
        debug!(first = %first, second = %second, "transfer wallets locked");

        let (source, destination) = if first == self.from_wallet_id {
            (first_wallet, second_wallet)
        } else {
            (second_wallet, first_wallet)
        };
        let (Some(mut source), Some(mut destination)) = (source, destination) else {
            return Err(LedgerError::WalletNotFound);
        };

        if source.balance < self.amount {
            return Err(LedgerError::InsufficientFunds);
        }

        let now = Utc::now();
        let source_before = source.balance;
        let destination_before = destination.balance;
        source.balance = source_before.subtract(self.amount)?;
        destination.balance = destination_before.add(self.amount)?;
        source.updated_at = now;
        destination.updated_at = now;
        unit.update_wallet(&source)?;
        unit.update_wallet(&destination)?;

        let debit_entry = LedgerEntry {
            id: LedgerEntryId::new(),
            wallet_id: source.id,
            direction: EntryDirection::Debit,
            amount: self.amount,
            balance_before: source_before,
            balance_after: source.balance,
            status: TransactionStatus::Completed,
            reference: Some(
                self.reference
                    .clone()
                    .unwrap_or_else(|| format!("TRANSFER_TO_{}", destination.id)),
            ),
            description: Some(
                self.description
                    .clone()
                    .unwrap_or_else(|| format!("Transfer to wallet {}", destination.id)),
            ),
            metadata: Some(self.leg_metadata("transferTo", destination.id, log)),
            transaction_log_id: Some(log.id),
            created_at: now,
        };
        let credit_entry = LedgerEntry {
            id: LedgerEntryId::new(),
            wallet_id: destination.id,
            direction: EntryDirection::Credit,
            amount: self.amount,
            balance_before: destination_before,
            balance_after: destination.balance,
            status: TransactionStatus::Completed,
            reference: Some(
                self.reference
                    .clone()
                    .unwrap_or_else(|| format!("TRANSFER_FROM_{}", source.id)),
            ),
            description: Some(
                self.description
                    .clone()
                    .unwrap_or_else(|| format!("Transfer from wallet {}", source.id)),
            ),
            metadata: Some(self.leg_metadata("transferFrom", source.id, log)),
            transaction_log_id: Some(log.id),
            created_at: now,
        };
        unit.append_entry(debit_entry.clone())?;
        unit.append_entry(credit_entry.clone())?;

        Ok(TransferResult {
            transaction_log_id: log.id,
            idempotency_key: log.idempotency_key.clone(),
            debit_entry,
            credit_entry,
        })
    }
}

fn positive_amount(raw: &str) -> Result<Amount, LedgerError> {
    let amount = Amount::parse(raw)?;
    if !amount.is_positive() {
        return Err(LedgerError::NonPositiveAmount);
    }
    Ok(amount)
}

fn log_metadata(
    reference: &Option<String>,
    description: &Option<String>,
    metadata: &Option<Metadata>,
) -> Metadata {
    let mut log_metadata = metadata.clone().unwrap_or_default();
    if let Some(reference) = reference {
        log_metadata.insert("reference".to_string(), Value::String(reference.clone()));
    }
    if let Some(description) = description {
        log_metadata.insert("description".to_string(), Value::String(description.clone()));
    }
    log_metadata
}

/// Rejects a replay whose key completed a different kind of operation.
fn ensure_operation(record: &TransactionRecord, requested: Operation) -> Result<(), LedgerError> {
    if record.log.operation != requested {
        warn!(
            key = %record.log.idempotency_key,
            stored = ?record.log.operation,
            requested = ?requested,
            "idempotency key reused across operations"
        );
        return Err(LedgerError::IdempotencyKeyReused);
    }
    Ok(())
}

fn first_entry(
    record: TransactionRecord,
    requested: Operation,
) -> Result<LedgerEntry, LedgerError> {
    ensure_operation(&record, requested)?;
    let log_id = record.log.id;
    record
        .entries
        .into_iter()
        .next()
        .ok_or_else(|| StoreError::MissingRow(format!("ledger entry of log {log_id}")).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheBackend, MemoryCache};
    use crate::config::CacheConfig;
    use crate::store::MemoryStore;

    fn coordinator(mode: PendingLogMode) -> TransferCoordinator<MemoryStore> {
        let config = LedgerConfig {
            pending_log: mode,
            ..LedgerConfig::default()
        };
        TransferCoordinator::with_cache(
            Arc::new(MemoryStore::new()),
            LedgerCache::disabled(),
            config,
        )
    }

    fn amt(raw: &str) -> Amount {
        Amount::parse(raw).unwrap()
    }

    #[test]
    fn transfer_locks_in_ascending_order_in_both_directions() {
        let ledger = coordinator(PendingLogMode::WriteAhead);
        let a = ledger.create_wallet(OwnerId::new("a"), Some("50.00")).unwrap();
        let b = ledger.create_wallet(OwnerId::new("b"), Some("50.00")).unwrap();

        // The memory store rejects descending lock requests outright.
        ledger
            .transfer(TransferRequest::new(a.id, b.id, "10.00", "ab"))
            .unwrap();
        ledger
            .transfer(TransferRequest::new(b.id, a.id, "5.00", "ba"))
            .unwrap();

        assert_eq!(ledger.get_balance(a.id).unwrap(), amt("45.00"));
        assert_eq!(ledger.get_balance(b.id).unwrap(), amt("55.00"));
    }

    #[test]
    fn write_ahead_failure_poisons_the_key() {
        let ledger = coordinator(PendingLogMode::WriteAhead);
        let wallet = ledger.create_wallet(OwnerId::new("a"), Some("10.00")).unwrap();

        let request = EntryRequest::new(wallet.id, "20.00").idempotency_key("k1");
        assert_eq!(ledger.debit(request), Err(LedgerError::InsufficientFunds));

        let record = ledger.get_transaction_by_idempotency_key("k1").unwrap();
        assert_eq!(record.log.status, TransactionStatus::Failed);
        assert_eq!(record.log.failure_cause(), Some("insufficient funds"));
        assert!(record.entries.is_empty());

        let corrected = EntryRequest::new(wallet.id, "5.00").idempotency_key("k1");
        assert_eq!(ledger.debit(corrected), Err(LedgerError::KeyAlreadyFailed));
        assert_eq!(ledger.get_balance(wallet.id).unwrap(), amt("10.00"));
    }

    #[test]
    fn inline_failure_leaves_no_log() {
        let ledger = coordinator(PendingLogMode::Inline);
        let wallet = ledger.create_wallet(OwnerId::new("a"), Some("10.00")).unwrap();

        let request = EntryRequest::new(wallet.id, "20.00").idempotency_key("k1");
        assert_eq!(ledger.debit(request), Err(LedgerError::InsufficientFunds));
        assert_eq!(
            ledger.get_transaction_by_idempotency_key("k1"),
            Err(LedgerError::TransactionNotFound)
        );

        let retry = EntryRequest::new(wallet.id, "5.00").idempotency_key("k1");
        let entry = ledger.debit(retry).unwrap();
        assert_eq!(entry.balance_after, amt("5.00"));
    }

    #[test]
    fn reconcile_fails_only_stale_pending_logs() {
        let ledger = coordinator(PendingLogMode::WriteAhead);
        let wallet = ledger.create_wallet(OwnerId::new("a"), None).unwrap();

        // A PENDING log left behind by a crash between the two units.
        let dangling = TransactionLog::pending(
            IdempotencyKey::new("crashed").unwrap(),
            Operation::Credit,
            wallet.id,
            amt("1.00"),
            Metadata::new(),
        );
        let mut unit = ledger.store().begin().unwrap();
        unit.insert_log(&dangling).unwrap();
        unit.commit().unwrap();

        ledger
            .credit(EntryRequest::new(wallet.id, "1.00").idempotency_key("done"))
            .unwrap();

        assert!(ledger.reconcile_stale_pending(Duration::hours(1)).unwrap().is_empty());
        let failed = ledger.reconcile_stale_pending(Duration::seconds(-1)).unwrap();
        assert_eq!(failed, vec![dangling.id]);

        let record = ledger.get_transaction_by_idempotency_key("crashed").unwrap();
        assert_eq!(record.log.status, TransactionStatus::Failed);
        assert_eq!(record.log.failure_cause(), Some(ABANDONED_CAUSE));
        assert_eq!(
            ledger.get_transaction_by_idempotency_key("done").unwrap().log.status,
            TransactionStatus::Completed
        );
    }

    #[test]
    fn late_failure_keeps_the_abandoned_cause() {
        let ledger = coordinator(PendingLogMode::WriteAhead);
        let wallet = ledger.create_wallet(OwnerId::new("a"), None).unwrap();

        let log = TransactionLog::pending(
            IdempotencyKey::new("late").unwrap(),
            Operation::Debit,
            wallet.id,
            amt("1.00"),
            Metadata::new(),
        );
        let mut unit = ledger.store().begin().unwrap();
        unit.insert_log(&log).unwrap();
        unit.commit().unwrap();
        assert_eq!(
            ledger.reconcile_stale_pending(Duration::seconds(-1)).unwrap(),
            vec![log.id]
        );

        // The attempt that owned the log fails after it was retired.
        ledger.record_failure(log, &LedgerError::InsufficientFunds);

        let record = ledger.get_transaction_by_idempotency_key("late").unwrap();
        assert_eq!(record.log.status, TransactionStatus::Failed);
        assert_eq!(record.log.failure_cause(), Some(ABANDONED_CAUSE));
    }

    #[test]
    fn balance_read_overtaken_by_a_write_is_not_cached() {
        let backend = Arc::new(MemoryCache::new());
        let cache = LedgerCache::new(
            Arc::clone(&backend) as Arc<dyn CacheBackend>,
            &CacheConfig::default(),
        );
        let ledger = TransferCoordinator::with_cache(
            Arc::new(MemoryStore::new()),
            cache,
            LedgerConfig::default(),
        );
        let wallet = ledger.create_wallet(OwnerId::new("a"), Some("10.00")).unwrap();

        // A reader loads the balance, then a credit commits before it caches.
        let version = ledger.balance_version(wallet.id);
        let stale = ledger.store().find_wallet(wallet.id).unwrap().unwrap().balance;
        ledger.credit(EntryRequest::new(wallet.id, "5.00")).unwrap();
        ledger.cache_balance(wallet.id, version, stale);

        assert!(backend.is_empty());
        assert_eq!(ledger.get_balance(wallet.id).unwrap(), amt("15.00"));
        assert_eq!(backend.len(), 1);
        assert_eq!(ledger.get_balance(wallet.id).unwrap(), amt("15.00"));
    }

    #[test]
    fn log_metadata_records_request_context() {
        let ledger = coordinator(PendingLogMode::WriteAhead);
        let a = ledger.create_wallet(OwnerId::new("a"), Some("5.00")).unwrap();
        let b = ledger.create_wallet(OwnerId::new("b"), None).unwrap();

        ledger
            .transfer(TransferRequest::new(a.id, b.id, "1.00", "k1").description("rent"))
            .unwrap();

        let log = ledger.get_transaction_by_idempotency_key("k1").unwrap().log;
        assert_eq!(log.metadata["description"], Value::String("rent".to_string()));
        assert_eq!(log.metadata["fromWalletId"], Value::String(a.id.to_string()));
        assert_eq!(log.metadata["toWalletId"], Value::String(b.id.to_string()));
        assert!(!log.metadata.contains_key("reference"));
    }
}
