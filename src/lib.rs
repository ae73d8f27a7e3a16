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

//! # Wallet Ledger
//!
//! This library keeps wallet balances together with an append-only audit
//! trail of every balance change, and guarantees that retried or duplicated
//! requests never apply a financial operation twice.
//!
//! ## Core Components
//!
//! - [`TransferCoordinator`]: Credits, debits, and transfers under row locks
//! - [`IdempotencyGuard`]: Replay / conflict / proceed decisions per idempotency key
//! - [`Amount`]: Fixed-scale decimal money with round-half-up arithmetic
//! - [`store`]: Repository traits, units of work, and the in-memory [`MemoryStore`]
//! - [`interest`]: Day-count interest formulas
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use wallet_ledger::{MemoryStore, OwnerId, TransferCoordinator, TransferRequest};
//!
//! let ledger = TransferCoordinator::new(Arc::new(MemoryStore::new()));
//! let alice = ledger.create_wallet(OwnerId::new("alice"), Some("100.00")).unwrap();
//! let bob = ledger.create_wallet(OwnerId::new("bob"), None).unwrap();
//!
//! let request = TransferRequest::new(alice.id, bob.id, "30.00", "order-42");
//! let first = ledger.transfer(request.clone()).unwrap();
//!
//! // Retrying with the same key replays the first result.
//! let retry = ledger.transfer(request).unwrap();
//! assert_eq!(first.transaction_log_id, retry.transaction_log_id);
//! assert_eq!(ledger.get_balance(bob.id).unwrap().to_string(), "30.00");
//! ```
//!
//! ## Thread Safety
//!
//! The coordinator is `Sync`. Operations on disjoint wallets run in parallel;
//! operations on a shared wallet serialize on its row lock.

mod base;
pub mod cache;
pub mod config;
mod coordinator;
pub mod error;
mod idempotency;
pub mod interest;
mod model;
mod money;
pub mod store;

pub use base::{IdempotencyKey, LedgerEntryId, OwnerId, TransactionLogId, WalletId};
pub use cache::{CacheBackend, LedgerCache, MemoryCache};
pub use config::{LedgerConfig, PendingLogMode};
pub use coordinator::TransferCoordinator;
pub use error::{ErrorKind, LedgerError, StoreError};
pub use idempotency::{GuardDecision, IdempotencyGuard};
pub use model::{
    EntryDirection, EntryRequest, History, LedgerEntry, Metadata, Operation, TransactionLog,
    TransactionRecord, TransactionStatus, TransferRequest, TransferResult, Wallet, WalletView,
};
pub use money::{Amount, MathContext};
pub use store::{MemoryStore, Store};
