//! Arbitrary-precision amount handling.
//!
//! On-chain amounts travel as [`alloy_primitives::U256`] smallest-unit integers end to end;
//! human-readable decimal strings (session/config input) are parsed once into [`rust_decimal::Decimal`]
//! and converted to smallest units via the chain's `tokenDecimals`. No floating-point type
//! appears anywhere on this path.

use alloy_primitives::U256;
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use std::str::FromStr;
use thiserror::Error;

static CLEAN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\d.\-]+").unwrap());

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AmountError {
    #[error("amount '{0}' is not a valid decimal number")]
    InvalidFormat(String),
    #[error("amount must be positive, got '{0}'")]
    NotPositive(String),
    #[error("amount '{amount}' has more fractional digits than {decimals} token decimals allows")]
    TooPrecise { amount: String, decimals: u8 },
    #[error("token decimals {0} is out of the supported range [0,30]")]
    DecimalsOutOfRange(u8),
}

/// A human-entered decimal amount, validated and positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoneyAmount(pub Decimal);

impl FromStr for MoneyAmount {
    type Err = AmountError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let cleaned = CLEAN_RE.replace_all(raw.trim(), "");
        let decimal = Decimal::from_str(&cleaned)
            .map_err(|_| AmountError::InvalidFormat(raw.to_string()))?;
        if decimal <= Decimal::ZERO {
            return Err(AmountError::NotPositive(raw.to_string()));
        }
        Ok(MoneyAmount(decimal))
    }
}

impl std::fmt::Display for MoneyAmount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Converts a validated decimal amount to the chain's smallest-unit integer.
///
/// Fails if the amount carries more fractional digits than `decimals` can represent
/// (we never silently round on the money path).
pub fn decimal_to_raw(amount: &MoneyAmount, decimals: u8) -> Result<U256, AmountError> {
    if decimals > 30 {
        return Err(AmountError::DecimalsOutOfRange(decimals));
    }
    let d = amount.0.normalize();
    let scale = d.scale();
    if scale as u32 > decimals as u32 {
        return Err(AmountError::TooPrecise {
            amount: amount.to_string(),
            decimals,
        });
    }
    let mantissa = d.mantissa().unsigned_abs();
    let extra_zeros = decimals as u32 - scale;
    let raw = U256::from(mantissa) * U256::from(10u64).pow(U256::from(extra_zeros));
    Ok(raw)
}

/// Renders a smallest-unit integer back to a decimal string using `decimals` fractional digits,
/// trimming trailing zeros (but keeping at least one digit before the point).
pub fn raw_to_decimal_string(raw: U256, decimals: u8) -> String {
    if decimals == 0 {
        return raw.to_string();
    }
    let divisor = U256::from(10u64).pow(U256::from(decimals as u32));
    let whole = raw / divisor;
    let frac = raw % divisor;
    let mut frac_str = frac.to_string();
    while frac_str.len() < decimals as usize {
        frac_str.insert(0, '0');
    }
    let trimmed = frac_str.trim_end_matches('0');
    if trimmed.is_empty() {
        whole.to_string()
    } else {
        format!("{whole}.{trimmed}")
    }
}

/// The −5% tolerance floor: `target − target*5/100`, in integer math, rounded down.
///
/// This is the acceptance threshold for the match gate (§4.3): a transfer's `rawValue`
/// must be at least this floor. There is no upper bound; overpayment is always accepted.
pub fn tolerance_floor(target: U256) -> U256 {
    target - (target * U256::from(5u64)) / U256::from(100u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_rejects_amounts() {
        assert_eq!(
            "1.0".parse::<MoneyAmount>().unwrap().0,
            Decimal::from_str("1.0").unwrap()
        );
        assert!("0".parse::<MoneyAmount>().is_err());
        assert!("-1".parse::<MoneyAmount>().is_err());
        assert!("not-a-number".parse::<MoneyAmount>().is_err());
    }

    #[test]
    fn converts_decimal_to_raw_units() {
        let amount = "1.0".parse::<MoneyAmount>().unwrap();
        let raw = decimal_to_raw(&amount, 18).unwrap();
        assert_eq!(raw, U256::from(1_000000000000000000u64));
    }

    #[test]
    fn rejects_amounts_more_precise_than_decimals() {
        let amount = "1.123456789".parse::<MoneyAmount>().unwrap();
        assert!(decimal_to_raw(&amount, 6).is_err());
    }

    #[test]
    fn round_trips_raw_to_decimal_string() {
        let raw = U256::from(1_500000000000000000u64);
        assert_eq!(raw_to_decimal_string(raw, 18), "1.5");
        assert_eq!(raw_to_decimal_string(U256::from(2u64), 18), "0.000000000000000002");
    }

    #[test]
    fn tolerance_floor_matches_s1_s2_s3() {
        let target = U256::from(1_000000000000000000u64);
        let floor = tolerance_floor(target);
        assert_eq!(floor, U256::from(950000000000000000u64));
        assert!(U256::from(949999999999999999u64) < floor);
        assert!(U256::from(2_000000000000000000u64) >= floor);
    }
}
