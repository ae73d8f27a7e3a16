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

//! Simple interest with an actual/365 or actual/366 day count.
//!
//! `interest = principal * annual_rate * (days / denominator)`, rounded to cents.
//! The denominator is 366 when the period contains a February 29, else 365.
//!
//! # Example
//!
//! ```
//! use chrono::NaiveDate;
//! use rust_decimal_macros::dec;
//! use wallet_ledger::{Amount, interest};
//!
//! let principal = Amount::parse("1000.00").unwrap();
//! let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
//! let end = NaiveDate::from_ymd_opt(2024, 12, 31).unwrap();
//! let earned = interest::interest_between_dates(principal, dec!(0.05), start, end).unwrap();
//! assert_eq!(earned.to_string(), "49.86");
//! ```

use crate::error::LedgerError;
use crate::money::{Amount, MathContext};
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;

pub const DAYS_IN_YEAR: u32 = 365;
pub const DAYS_IN_LEAP_YEAR: u32 = 366;

const MILLIS_PER_DAY: u64 = 24 * 60 * 60 * 1000;

/// Interest accrued over `days` using a fixed 365-day year.
pub fn daily_interest(
    principal: Amount,
    annual_rate: Decimal,
    days: u32,
) -> Result<Amount, LedgerError> {
    accrue(principal, annual_rate, days, DAYS_IN_YEAR)
}

/// Interest accrued between two instants.
///
/// The day count is the absolute difference rounded to the nearest whole day,
/// so argument order does not matter.
pub fn interest_over_period(
    principal: Amount,
    annual_rate: Decimal,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Amount, LedgerError> {
    let (start, end) = if start <= end { (start, end) } else { (end, start) };
    let millis = (end - start).num_milliseconds().unsigned_abs();
    let days = (millis + MILLIS_PER_DAY / 2) / MILLIS_PER_DAY;
    let days = u32::try_from(days).map_err(|_| LedgerError::Overflow)?;

    let denominator = if contains_leap_day(start, end) {
        DAYS_IN_LEAP_YEAR
    } else {
        DAYS_IN_YEAR
    };
    accrue(principal, annual_rate, days, denominator)
}

/// Calendar-date variant of [`interest_over_period`], measured from midnight UTC.
pub fn interest_between_dates(
    principal: Amount,
    annual_rate: Decimal,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Amount, LedgerError> {
    interest_over_period(principal, annual_rate, midnight(start), midnight(end))
}

/// Gregorian leap year rule.
pub fn is_leap_year(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

fn accrue(
    principal: Amount,
    annual_rate: Decimal,
    days: u32,
    denominator: u32,
) -> Result<Amount, LedgerError> {
    let ctx = MathContext::MONEY;
    let fraction = ctx.div(Decimal::from(days), Decimal::from(denominator))?;
    let interest = ctx.mul(ctx.mul(principal.value(), annual_rate)?, fraction)?;
    Amount::new(interest)
}

/// Whether `[start, end]` contains February 29 of any year it spans.
fn contains_leap_day(start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
    (start.year()..=end.year())
        .filter(|year| is_leap_year(*year))
        .filter_map(|year| NaiveDate::from_ymd_opt(year, 2, 29))
        .map(midnight)
        .any(|leap_day| leap_day >= start && leap_day <= end)
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn amt(raw: &str) -> Amount {
        Amount::parse(raw).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn daily_interest_over_full_year() {
        let interest = daily_interest(amt("1000.00"), dec!(0.05), 365).unwrap();
        assert_eq!(interest.to_string(), "50.00");
    }

    #[test]
    fn daily_interest_zero_inputs_yield_zero() {
        assert_eq!(daily_interest(Amount::ZERO, dec!(0.05), 30).unwrap(), Amount::ZERO);
        assert_eq!(daily_interest(amt("1000.00"), Decimal::ZERO, 30).unwrap(), Amount::ZERO);
        assert_eq!(daily_interest(amt("1000.00"), dec!(0.05), 0).unwrap(), Amount::ZERO);
    }

    #[test]
    fn daily_interest_rounds_half_up() {
        // 1000 * 0.05 * 1 / 365 = 0.136986...
        assert_eq!(daily_interest(amt("1000.00"), dec!(0.05), 1).unwrap().to_string(), "0.14");
    }

    #[test]
    fn leap_year_period_uses_366_day_denominator() {
        let interest =
            interest_between_dates(amt("1000.00"), dec!(0.05), date(2024, 1, 1), date(2024, 12, 31))
                .unwrap();
        assert_eq!(interest.to_string(), "49.86");
    }

    #[test]
    fn non_leap_period_uses_365_day_denominator() {
        let interest =
            interest_between_dates(amt("1000.00"), dec!(0.05), date(2023, 1, 1), date(2024, 1, 1))
                .unwrap();
        assert_eq!(interest.to_string(), "50.00");
    }

    #[test]
    fn leap_day_on_boundary_is_included() {
        // 28 days / 366
        let interest =
            interest_between_dates(amt("1000.00"), dec!(0.05), date(2024, 2, 1), date(2024, 2, 29))
                .unwrap();
        assert_eq!(interest.to_string(), "3.83");
    }

    #[test]
    fn leap_year_period_after_february_uses_365() {
        // 305 days / 365
        let interest =
            interest_between_dates(amt("1000.00"), dec!(0.05), date(2024, 3, 1), date(2024, 12, 31))
                .unwrap();
        assert_eq!(interest.to_string(), "41.78");
    }

    #[test]
    fn period_spanning_years_detects_leap_day() {
        let interest =
            interest_between_dates(amt("1000.00"), dec!(0.05), date(2023, 6, 1), date(2024, 6, 1))
                .unwrap();
        assert_eq!(interest.to_string(), "50.00");
    }

    #[test]
    fn same_day_yields_zero() {
        let day = date(2024, 2, 29);
        let interest = interest_between_dates(amt("1000.00"), dec!(0.05), day, day).unwrap();
        assert_eq!(interest.to_string(), "0.00");
    }

    #[test]
    fn reversed_dates_match_forward_order() {
        let forward =
            interest_between_dates(amt("500.00"), dec!(0.1), date(2024, 1, 1), date(2024, 7, 1))
                .unwrap();
        let backward =
            interest_between_dates(amt("500.00"), dec!(0.1), date(2024, 7, 1), date(2024, 1, 1))
                .unwrap();
        assert_eq!(forward, backward);
    }

    #[test]
    fn partial_days_round_to_nearest_day() {
        let start = Utc.with_ymd_and_hms(2023, 3, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2023, 3, 2, 12, 0, 0).unwrap();
        // 1.5 days rounds to 2
        let interest = interest_over_period(amt("365.00"), dec!(1), start, end).unwrap();
        assert_eq!(interest.to_string(), "2.00");
    }

    #[test]
    fn leap_year_rule() {
        assert!(is_leap_year(2024));
        assert!(is_leap_year(2000));
        assert!(!is_leap_year(1900));
        assert!(!is_leap_year(2023));
    }
}
