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

//! Persistence interfaces.
//!
//! The coordinator drives storage through a [`UnitOfWork`]: every write and
//! every row lock happens inside one, and either all of its writes become
//! visible on [`UnitOfWork::commit`] or none do. Dropping a unit without
//! committing rolls it back and releases its locks.
//!
//! Reads outside a unit go through [`Store`] and only ever observe committed
//! state.
//!
//! # Indexes
//!
//! | Table | Unique | Secondary |
//! |-------|--------|-----------|
//! | wallets | `id`, `owner_id` | |
//! | ledger entries | `id` | `wallet_id`, (`wallet_id`, `created_at`), `reference`, `transaction_log_id` |
//! | transaction logs | `id`, `idempotency_key` | (`wallet_id`, `status`) |

mod memory;

pub use memory::{MemoryStore, MemoryUnit};

use crate::base::{IdempotencyKey, OwnerId, TransactionLogId, WalletId};
use crate::error::StoreError;
use crate::model::{History, LedgerEntry, TransactionLog, TransactionStatus, Wallet};
use chrono::{DateTime, Utc};

pub const WALLET_OWNER_INDEX: &str = "wallets_owner_id";
pub const IDEMPOTENCY_KEY_INDEX: &str = "transaction_logs_idempotency_key";

/// Wallet rows as seen from inside a unit of work.
pub trait WalletRepository {
    /// Acquires the exclusive row lock on `id` and returns the row.
    ///
    /// The lock is held until the unit commits or rolls back. Within one unit,
    /// wallets must be locked in ascending [`WalletId`] order; re-locking a
    /// wallet already held by the unit returns its current view.
    ///
    /// Returns `Ok(None)` when the wallet does not exist.
    fn lock_wallet(&mut self, id: WalletId) -> Result<Option<Wallet>, StoreError>;

    /// Inserts a new wallet, enforcing the unique owner index immediately.
    fn insert_wallet(&mut self, wallet: Wallet) -> Result<(), StoreError>;

    /// Writes a wallet previously locked by this unit.
    fn update_wallet(&mut self, wallet: &Wallet) -> Result<(), StoreError>;
}

/// Append-only ledger entries.
pub trait LedgerRepository {
    fn append_entry(&mut self, entry: LedgerEntry) -> Result<(), StoreError>;
}

/// Idempotency journal.
pub trait TransactionLogRepository {
    /// Inserts a log, enforcing the unique idempotency key index immediately.
    ///
    /// A concurrent holder of the same key yields
    /// [`StoreError::UniqueViolation`] even before it commits.
    fn insert_log(&mut self, log: &TransactionLog) -> Result<(), StoreError>;

    /// Overwrites the status and metadata of an existing log.
    fn update_log(&mut self, log: &TransactionLog) -> Result<(), StoreError>;
}

/// One atomic storage transaction.
pub trait UnitOfWork: WalletRepository + LedgerRepository + TransactionLogRepository {
    fn commit(self) -> Result<(), StoreError>;

    /// Discards all writes and releases locks. Equivalent to dropping the unit.
    fn rollback(self);
}

/// Authoritative ledger storage.
pub trait Store: Send + Sync {
    type Unit<'a>: UnitOfWork
    where
        Self: 'a;

    fn begin(&self) -> Result<Self::Unit<'_>, StoreError>;

    fn find_wallet(&self, id: WalletId) -> Result<Option<Wallet>, StoreError>;

    fn find_wallet_by_owner(&self, owner_id: &OwnerId) -> Result<Option<Wallet>, StoreError>;

    /// All committed wallets, oldest first.
    fn list_wallets(&self) -> Result<Vec<Wallet>, StoreError>;

    fn find_log_by_key(&self, key: &IdempotencyKey) -> Result<Option<TransactionLog>, StoreError>;

    /// Entries produced by one transaction log, in write order.
    fn entries_for_log(&self, id: TransactionLogId) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Window of a wallet's entries, newest first, with the wallet's total count.
    fn wallet_history(
        &self,
        id: WalletId,
        limit: usize,
        offset: usize,
    ) -> Result<History, StoreError>;

    fn entries_by_reference(&self, reference: &str) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Logs in `status` created strictly before `cutoff`.
    fn logs_created_before(
        &self,
        status: TransactionStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<TransactionLog>, StoreError>;
}
