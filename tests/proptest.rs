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

//! Property-based tests for the wallet ledger.
//!
//! These tests verify invariants that should hold for any sequence of
//! operations, successful or rejected.

use proptest::prelude::*;
use rust_decimal::Decimal;
use std::sync::Arc;
use wallet_ledger::{
    Amount, EntryRequest, LedgerError, MemoryStore, OwnerId, TransferCoordinator,
    TransferRequest, WalletId,
};

// =============================================================================
// Arbitrary Strategies
// =============================================================================

/// Generate a positive amount (0.01 to 500.00).
fn arb_amount() -> impl Strategy<Value = Decimal> {
    (1i64..=50_000i64).prop_map(|cents| Decimal::new(cents, 2))
}

#[derive(Debug, Clone)]
enum Op {
    Credit { wallet: usize, amount: Decimal },
    Debit { wallet: usize, amount: Decimal },
    Transfer { from: usize, to: usize, amount: Decimal, key: u8 },
}

const WALLETS: usize = 3;

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..WALLETS, arb_amount()).prop_map(|(wallet, amount)| Op::Credit { wallet, amount }),
        (0..WALLETS, arb_amount()).prop_map(|(wallet, amount)| Op::Debit { wallet, amount }),
        // Small key space so replays and poisoned keys come up.
        (0..WALLETS, 0..WALLETS, arb_amount(), 0u8..8).prop_map(|(from, to, amount, key)| {
            Op::Transfer { from, to, amount, key }
        }),
    ]
}

fn run(ops: &[Op], initial: &[Decimal]) -> (TransferCoordinator<MemoryStore>, Vec<WalletId>) {
    let ledger = TransferCoordinator::new(Arc::new(MemoryStore::new()));
    let wallets: Vec<WalletId> = initial
        .iter()
        .enumerate()
        .map(|(i, balance)| {
            let balance = balance.to_string();
            ledger
                .create_wallet(OwnerId::new(format!("owner-{i}")), Some(balance.as_str()))
                .unwrap()
                .id
        })
        .collect();

    for op in ops {
        let result = match op {
            Op::Credit { wallet, amount } => ledger
                .credit(EntryRequest::new(wallets[*wallet], amount.to_string()))
                .map(|_| ()),
            Op::Debit { wallet, amount } => ledger
                .debit(EntryRequest::new(wallets[*wallet], amount.to_string()))
                .map(|_| ()),
            Op::Transfer { from, to, amount, key } => ledger
                .transfer(TransferRequest::new(
                    wallets[*from],
                    wallets[*to],
                    amount.to_string(),
                    format!("key-{key}"),
                ))
                .map(|_| ()),
        };
        // Business rejections are expected; storage never fails here.
        if let Err(e) = result {
            assert!(!matches!(e, LedgerError::Store(_)), "unexpected {e:?}");
        }
    }
    (ledger, wallets)
}

// =============================================================================
// Ledger Invariant Tests
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Balances are never negative after any operation sequence.
    #[test]
    fn balance_never_negative(
        initial in prop::collection::vec(arb_amount(), WALLETS),
        ops in prop::collection::vec(arb_op(), 1..40),
    ) {
        let (ledger, wallets) = run(&ops, &initial);
        for wallet in wallets {
            prop_assert!(!ledger.get_balance(wallet).unwrap().is_negative());
        }
    }

    /// Balance equals the signed sum of the wallet's ledger entries.
    #[test]
    fn balance_equals_ledger_sum(
        initial in prop::collection::vec(arb_amount(), WALLETS),
        ops in prop::collection::vec(arb_op(), 1..40),
    ) {
        let (ledger, wallets) = run(&ops, &initial);
        for wallet in wallets {
            let history = ledger.get_history(wallet, Some(1000), None).unwrap();
            let sum = history
                .entries
                .iter()
                .fold(Amount::ZERO, |acc, e| acc.add(e.signed_amount()).unwrap());
            prop_assert_eq!(ledger.get_balance(wallet).unwrap(), sum);
        }
    }

    /// Money is only created by credits and destroyed by debits.
    #[test]
    fn transfers_conserve_total(
        initial in prop::collection::vec(arb_amount(), WALLETS),
        transfers in prop::collection::vec((0..WALLETS, 0..WALLETS, arb_amount(), 0u8..8), 1..30),
    ) {
        let ops: Vec<Op> = transfers
            .into_iter()
            .map(|(from, to, amount, key)| Op::Transfer { from, to, amount, key })
            .collect();
        let (ledger, wallets) = run(&ops, &initial);

        let total: Decimal = wallets
            .iter()
            .map(|w| ledger.get_balance(*w).unwrap().value())
            .sum();
        prop_assert_eq!(total, initial.iter().sum::<Decimal>());
    }

    /// Repeating a transfer key never moves money twice.
    #[test]
    fn replayed_transfer_applies_once(
        amount in arb_amount(),
        repeats in 2usize..6,
    ) {
        let ledger = TransferCoordinator::new(Arc::new(MemoryStore::new()));
        let source = ledger.create_wallet(OwnerId::new("a"), Some("500.00")).unwrap().id;
        let destination = ledger.create_wallet(OwnerId::new("b"), None).unwrap().id;

        let request = TransferRequest::new(source, destination, amount.to_string(), "K");
        let first = ledger.transfer(request.clone()).unwrap();
        for _ in 1..repeats {
            prop_assert_eq!(&ledger.transfer(request.clone()).unwrap(), &first);
        }
        prop_assert_eq!(ledger.get_balance(destination).unwrap().value(), amount);
    }
}

// =============================================================================
// Decimal Arithmetic Tests
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// Adding cents one at a time is exact.
    #[test]
    fn cent_accumulation_is_exact(count in 1u32..500) {
        let cent = Amount::parse("0.01").unwrap();
        let mut balance = Amount::ZERO;
        for _ in 0..count {
            balance = balance.add(cent).unwrap();
        }
        prop_assert_eq!(balance.value(), Decimal::new(i64::from(count), 2));
    }

    /// Subtracting what was added restores the starting amount.
    #[test]
    fn add_then_subtract_round_trips(a in arb_amount(), b in arb_amount()) {
        let a = Amount::new(a).unwrap();
        let b = Amount::new(b).unwrap();
        prop_assert_eq!(a.add(b).unwrap().subtract(b).unwrap(), a);
    }

    /// Parsed amounts always carry exactly two decimal places.
    #[test]
    fn parsed_amounts_have_money_scale(units in 0i64..1_000_000, scale in 0u32..6) {
        let amount = Amount::new(Decimal::new(units, scale)).unwrap();
        prop_assert_eq!(amount.value().scale(), 2);
        prop_assert_eq!(amount.to_string().split('.').nth(1).map(str::len), Some(2));
    }
}
