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

//! Fixed-scale monetary values.
//!
//! [`Amount`] stores money as an exact base-10 [`Decimal`] normalized to two
//! decimal places. Every arithmetic result is first rounded to 20 significant
//! digits and then to the amount scale, both with round-half-up.
//!
//! The rounding configuration lives in an immutable [`MathContext`] value that
//! each operation receives explicitly, so arithmetic is reentrant across threads.
//!
//! # Example
//!
//! ```
//! use wallet_ledger::Amount;
//!
//! let a = Amount::parse("0.1").unwrap();
//! let b = Amount::parse("0.2").unwrap();
//! assert_eq!(a.add(b).unwrap().to_string(), "0.30");
//! ```

use crate::error::LedgerError;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Precision and rounding applied to a single arithmetic operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MathContext {
    /// Significant digits kept for intermediate results.
    pub precision: u32,
    /// Decimal places of the final monetary value.
    pub scale: u32,
    pub rounding: RoundingStrategy,
}

impl MathContext {
    /// 20 significant digits, 2 decimal places, round-half-up.
    pub const MONEY: MathContext = MathContext {
        precision: 20,
        scale: 2,
        rounding: RoundingStrategy::MidpointAwayFromZero,
    };

    /// Rounds to `precision` significant digits.
    pub fn significant(&self, value: Decimal) -> Decimal {
        value
            .round_sf_with_strategy(self.precision, self.rounding)
            .unwrap_or(value)
    }

    /// Rounds to `precision` significant digits, then to exactly `scale` places.
    pub fn quantize(&self, value: Decimal) -> Decimal {
        let mut rounded = self
            .significant(value)
            .round_dp_with_strategy(self.scale, self.rounding);
        rounded.rescale(self.scale);
        if rounded.is_zero() {
            rounded.set_sign_positive(true);
        }
        rounded
    }

    pub fn add(&self, a: Decimal, b: Decimal) -> Result<Decimal, LedgerError> {
        a.checked_add(b)
            .map(|v| self.significant(v))
            .ok_or(LedgerError::Overflow)
    }

    pub fn sub(&self, a: Decimal, b: Decimal) -> Result<Decimal, LedgerError> {
        a.checked_sub(b)
            .map(|v| self.significant(v))
            .ok_or(LedgerError::Overflow)
    }

    pub fn mul(&self, a: Decimal, b: Decimal) -> Result<Decimal, LedgerError> {
        a.checked_mul(b)
            .map(|v| self.significant(v))
            .ok_or(LedgerError::Overflow)
    }

    /// # Errors
    ///
    /// Returns [`LedgerError::DivisionByZero`] when `b` is zero.
    pub fn div(&self, a: Decimal, b: Decimal) -> Result<Decimal, LedgerError> {
        if b.is_zero() {
            return Err(LedgerError::DivisionByZero);
        }
        a.checked_div(b)
            .map(|v| self.significant(v))
            .ok_or(LedgerError::Overflow)
    }
}

/// Largest magnitude representable in a `DECIMAL(20, 2)` column.
const MAX_MAGNITUDE: Decimal = Decimal::from_parts(0x630F_FFFF, 0x6BC7_5E2D, 0x5, false, 2);

/// Monetary value with exactly two decimal places.
///
/// Amounts may be negative (e.g. the signed contribution of a debit); wallet
/// balances and operation amounts are checked separately by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Amount(Decimal);

impl Amount {
    pub const ZERO: Amount = Amount(Decimal::from_parts(0, 0, 0, false, 2));

    /// Normalizes `value` to the money scale.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Overflow`] if the value exceeds `DECIMAL(20, 2)`.
    pub fn new(value: Decimal) -> Result<Self, LedgerError> {
        let value = MathContext::MONEY.quantize(value);
        if value.abs() > MAX_MAGNITUDE {
            return Err(LedgerError::Overflow);
        }
        Ok(Self(value))
    }

    /// Parses client input such as `"12.5"`, `"0.01"`, or `"1e3"`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidAmount`] for empty, non-numeric, or
    /// non-finite input (`"NaN"`, `"Infinity"`).
    pub fn parse(raw: &str) -> Result<Self, LedgerError> {
        let value = parse_decimal(raw).ok_or(LedgerError::InvalidAmount)?;
        Self::new(value)
    }

    /// Returns `true` if `raw` is a finite decimal number.
    pub fn is_valid(raw: &str) -> bool {
        parse_decimal(raw).is_some()
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }

    pub fn is_negative(&self) -> bool {
        self.0 < Decimal::ZERO
    }

    pub fn add(self, rhs: Amount) -> Result<Amount, LedgerError> {
        Self::new(MathContext::MONEY.add(self.0, rhs.0)?)
    }

    pub fn subtract(self, rhs: Amount) -> Result<Amount, LedgerError> {
        Self::new(MathContext::MONEY.sub(self.0, rhs.0)?)
    }

    /// Multiplies by an arbitrary-scale factor such as a rate.
    pub fn multiply(self, factor: Decimal) -> Result<Amount, LedgerError> {
        Self::new(MathContext::MONEY.mul(self.0, factor)?)
    }

    /// # Errors
    ///
    /// Returns [`LedgerError::DivisionByZero`] when `divisor` is zero.
    pub fn divide(self, divisor: Decimal) -> Result<Amount, LedgerError> {
        Self::new(MathContext::MONEY.div(self.0, divisor)?)
    }

    pub fn negate(self) -> Amount {
        Self(-self.0)
    }
}

fn parse_decimal(raw: &str) -> Option<Decimal> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .ok()
}

impl TryFrom<Decimal> for Amount {
    type Error = LedgerError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl FromStr for Amount {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for Amount {
    fn default() -> Self {
        Self::ZERO
    }
}
