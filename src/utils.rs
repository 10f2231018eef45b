use crate::error::{FundingError, Result};
use chrono::{Datelike, NaiveDate};
use rust_decimal::{Decimal, RoundingStrategy};

/// Rounds to whole currency units, half away from zero.
pub fn round_units(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
}

/// `value * percentage / 100`, exact in decimal arithmetic.
pub fn percentage_of(value: Decimal, percentage: Decimal) -> Decimal {
    value * percentage / Decimal::ONE_HUNDRED
}

/// Division that yields `None` instead of panicking on a zero divisor.
pub fn safe_div(numerator: Decimal, divisor: Decimal) -> Option<Decimal> {
    if divisor.is_zero() {
        None
    } else {
        numerator.checked_div(divisor)
    }
}

/// Calendar month difference, ignoring days: Jan 31 -> Feb 1 counts as one month.
pub fn months_between(start: NaiveDate, end: NaiveDate) -> i32 {
    let year_diff = end.year() - start.year();
    let month_diff = end.month() as i32 - start.month() as i32;
    year_diff * 12 + month_diff
}

/// Formats a whole-unit amount with thousands separators, e.g. `-1,234,567`.
pub fn format_thousands(value: Decimal) -> String {
    let rounded = round_units(value);
    let digits = rounded.abs().trunc().to_string();

    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    if rounded.is_sign_negative() && !rounded.is_zero() {
        format!("-{}", grouped)
    } else {
        grouped
    }
}

pub fn validate_percentage(field: &str, percentage: Decimal) -> Result<()> {
    if percentage.is_sign_negative() && !percentage.is_zero() {
        return Err(FundingError::invalid_input(
            field,
            format!("percentage {} is negative", percentage),
        ));
    }
    if percentage > Decimal::ONE_HUNDRED {
        return Err(FundingError::invalid_input(
            field,
            format!("percentage {} exceeds 100", percentage),
        ));
    }
    Ok(())
}

pub fn validate_exchange_rate(field: &str, rate: Decimal) -> Result<()> {
    if rate.is_sign_negative() && !rate.is_zero() {
        return Err(FundingError::invalid_input(
            field,
            format!("exchange rate {} is negative", rate),
        ));
    }
    Ok(())
}
