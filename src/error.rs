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

//! Error types for ledger operations.

use thiserror::Error;

/// Ledger operation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Amount is not a finite decimal number
    #[error("invalid amount")]
    InvalidAmount,

    /// Amount is zero or negative
    #[error("amount must be greater than zero")]
    NonPositiveAmount,

    /// Wallet opened with a negative balance
    #[error("initial balance cannot be negative")]
    NegativeInitialBalance,

    /// Transfers require a non-empty idempotency key
    #[error("idempotency key is required")]
    MissingIdempotencyKey,

    /// Source and destination wallets are the same
    #[error("cannot transfer to the same wallet")]
    SelfTransfer,

    /// Owner already has a wallet
    #[error("wallet already exists for this owner")]
    WalletAlreadyExists,

    /// Referenced wallet does not exist
    #[error("wallet not found")]
    WalletNotFound,

    /// No transaction log exists for the idempotency key
    #[error("transaction not found")]
    TransactionNotFound,

    /// Another attempt currently owns the idempotency key
    #[error("transaction is still processing, retry later")]
    TransactionInProgress,

    /// Idempotency key already completed a different kind of operation
    #[error("idempotency key was already used for a different operation")]
    IdempotencyKeyReused,

    /// Debit would take the wallet balance below zero
    #[error("insufficient funds")]
    InsufficientFunds,

    /// A previous attempt with this idempotency key failed
    #[error("previous transaction with this idempotency key failed")]
    KeyAlreadyFailed,

    /// Division by a zero divisor
    #[error("division by zero")]
    DivisionByZero,

    /// Result does not fit in the decimal representation
    #[error("arithmetic overflow")]
    Overflow,

    /// Storage engine failure
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

/// Error taxonomy exposed to the calling boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    InsufficientFunds,
    KeyAlreadyFailed,
    Storage,
}

impl LedgerError {
    /// Classifies the error for the calling boundary (e.g. HTTP status mapping).
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidAmount
            | Self::NonPositiveAmount
            | Self::NegativeInitialBalance
            | Self::MissingIdempotencyKey
            | Self::SelfTransfer
            | Self::WalletAlreadyExists
            | Self::DivisionByZero
            | Self::Overflow => ErrorKind::Validation,
            Self::WalletNotFound | Self::TransactionNotFound => ErrorKind::NotFound,
            Self::TransactionInProgress | Self::IdempotencyKeyReused => ErrorKind::Conflict,
            Self::InsufficientFunds => ErrorKind::InsufficientFunds,
            Self::KeyAlreadyFailed => ErrorKind::KeyAlreadyFailed,
            Self::Store(_) => ErrorKind::Storage,
        }
    }
}

/// Storage engine errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A unique index rejected the write
    #[error("unique constraint `{index}` violated by `{key}`")]
    UniqueViolation { index: &'static str, key: String },

    /// Row referenced by an update does not exist
    #[error("row `{0}` not found")]
    MissingRow(String),

    /// Wallet written without holding its row lock
    #[error("wallet `{0}` is not locked by this unit")]
    RowNotLocked(String),

    /// Row locks requested out of canonical (ascending id) order
    #[error("lock order violation: `{requested}` requested after `{held}`")]
    LockOrderViolation { held: String, requested: String },

    /// Backend unreachable or failed mid-operation
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        assert_eq!(LedgerError::InvalidAmount.to_string(), "invalid amount");
        assert_eq!(
            LedgerError::NonPositiveAmount.to_string(),
            "amount must be greater than zero"
        );
        assert_eq!(
            LedgerError::SelfTransfer.to_string(),
            "cannot transfer to the same wallet"
        );
        assert_eq!(LedgerError::InsufficientFunds.to_string(), "insufficient funds");
        assert_eq!(
            LedgerError::TransactionInProgress.to_string(),
            "transaction is still processing, retry later"
        );
        assert_eq!(
            LedgerError::Store(StoreError::UniqueViolation {
                index: "transaction_logs_idempotency_key",
                key: "k1".to_string(),
            })
            .to_string(),
            "storage error: unique constraint `transaction_logs_idempotency_key` violated by `k1`"
        );
    }

    #[test]
    fn errors_map_to_taxonomy() {
        assert_eq!(LedgerError::NonPositiveAmount.kind(), ErrorKind::Validation);
        assert_eq!(LedgerError::MissingIdempotencyKey.kind(), ErrorKind::Validation);
        assert_eq!(LedgerError::SelfTransfer.kind(), ErrorKind::Validation);
        assert_eq!(LedgerError::WalletNotFound.kind(), ErrorKind::NotFound);
        assert_eq!(LedgerError::TransactionInProgress.kind(), ErrorKind::Conflict);
        assert_eq!(LedgerError::IdempotencyKeyReused.kind(), ErrorKind::Conflict);
        assert_eq!(
            LedgerError::InsufficientFunds.kind(),
            ErrorKind::InsufficientFunds
        );
        assert_eq!(LedgerError::KeyAlreadyFailed.kind(), ErrorKind::KeyAlreadyFailed);
        assert_eq!(
            LedgerError::Store(StoreError::Unavailable("down".into())).kind(),
            ErrorKind::Storage
        );
    }
}
