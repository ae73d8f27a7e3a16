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

//! Ledger records and operation requests.
//!
//! Transaction logs follow a state machine:
//! - [`Pending`] → [`Completed`] (balance change committed)
//! - [`Pending`] → [`Failed`] (business rule rejected the attempt)
//!
//! Terminal states never change again.
//!
//! [`Pending`]: TransactionStatus::Pending
//! [`Completed`]: TransactionStatus::Completed
//! [`Failed`]: TransactionStatus::Failed

use crate::base::{IdempotencyKey, LedgerEntryId, OwnerId, TransactionLogId, WalletId};
use crate::money::Amount;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Free-form JSON attributes attached to entries and logs.
pub type Metadata = serde_json::Map<String, Value>;

/// Metadata field holding the failure cause of a transaction log.
pub const FAILURE_CAUSE_FIELD: &str = "error";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntryDirection {
    Credit,
    Debit,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Credit,
    Debit,
    Transfer,
}

/// Current balance of one owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: WalletId,
    pub owner_id: OwnerId,
    pub balance: Amount,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn new(owner_id: OwnerId, balance: Amount) -> Self {
        let now = Utc::now();
        Self {
            id: WalletId::new(),
            owner_id,
            balance,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Immutable record of one balance change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: LedgerEntryId,
    pub wallet_id: WalletId,
    pub direction: EntryDirection,
    pub amount: Amount,
    pub balance_before: Amount,
    pub balance_after: Amount,
    pub status: TransactionStatus,
    pub reference: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<Metadata>,
    pub transaction_log_id: Option<TransactionLogId>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Positive for credits, negative for debits.
    pub fn signed_amount(&self) -> Amount {
        match self.direction {
            EntryDirection::Credit => self.amount,
            EntryDirection::Debit => self.amount.negate(),
        }
    }
}

/// Idempotency journal row for one client-identified attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionLog {
    pub id: TransactionLogId,
    pub idempotency_key: IdempotencyKey,
    pub operation: Operation,
    /// Target wallet, or the source wallet of a transfer.
    pub wallet_id: WalletId,
    pub amount: Amount,
    pub status: TransactionStatus,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransactionLog {
    pub fn pending(
        idempotency_key: IdempotencyKey,
        operation: Operation,
        wallet_id: WalletId,
        amount: Amount,
        metadata: Metadata,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TransactionLogId::new(),
            idempotency_key,
            operation,
            wallet_id,
            amount,
            status: TransactionStatus::Pending,
            metadata,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn complete(&mut self) {
        debug_assert_eq!(self.status, TransactionStatus::Pending);
        self.status = TransactionStatus::Completed;
        self.updated_at = Utc::now();
    }

    /// Marks the attempt failed and records `cause` in the metadata.
    pub fn fail(&mut self, cause: &str) {
        debug_assert_eq!(self.status, TransactionStatus::Pending);
        self.status = TransactionStatus::Failed;
        self.metadata
            .insert(FAILURE_CAUSE_FIELD.to_string(), Value::String(cause.to_string()));
        self.updated_at = Utc::now();
    }

    pub fn failure_cause(&self) -> Option<&str> {
        self.metadata.get(FAILURE_CAUSE_FIELD).and_then(Value::as_str)
    }
}

/// Both legs of a committed transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    pub transaction_log_id: TransactionLogId,
    pub idempotency_key: IdempotencyKey,
    pub debit_entry: LedgerEntry,
    pub credit_entry: LedgerEntry,
}

/// A transaction log together with the ledger entries it produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub log: TransactionLog,
    pub entries: Vec<LedgerEntry>,
}

/// A page of ledger entries, newest first, plus the wallet's total entry count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    pub entries: Vec<LedgerEntry>,
    pub total: usize,
}

/// A wallet with its most recent ledger entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletView {
    pub wallet: Wallet,
    pub recent_entries: Vec<LedgerEntry>,
}

/// Credit or debit of a single wallet.
///
/// Amount and key arrive as raw client input and are validated by the coordinator.
#[derive(Debug, Clone, Default)]
pub struct EntryRequest {
    pub wallet_id: WalletId,
    pub amount: String,
    pub reference: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<Metadata>,
    pub idempotency_key: Option<String>,
}

impl EntryRequest {
    pub fn new(wallet_id: WalletId, amount: impl Into<String>) -> Self {
        Self {
            wallet_id,
            amount: amount.into(),
            ..Default::default()
        }
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Movement of funds between two wallets. The idempotency key is mandatory.
#[derive(Debug, Clone, Default)]
pub struct TransferRequest {
    pub from_wallet_id: WalletId,
    pub to_wallet_id: WalletId,
    pub amount: String,
    pub idempotency_key: String,
    pub reference: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<Metadata>,
}

impl TransferRequest {
    pub fn new(
        from_wallet_id: WalletId,
        to_wallet_id: WalletId,
        amount: impl Into<String>,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            from_wallet_id,
            to_wallet_id,
            amount: amount.into(),
            idempotency_key: idempotency_key.into(),
            ..Default::default()
        }
    }

    pub fn reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}
