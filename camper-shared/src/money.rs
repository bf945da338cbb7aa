use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed-point currency amount, stored as a count of minor units (fen).
///
/// Amounts are signed so that ledger entries can carry debits as negative
/// values; balances and prices are validated non-negative where they are used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_minor(minor: i64) -> Self {
        Self(minor)
    }

    pub const fn minor(self) -> i64 {
        self.0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(Money)
    }

    pub fn checked_sub(self, other: Money) -> Option<Money> {
        self.0.checked_sub(other.0).map(Money)
    }

    pub fn checked_mul(self, factor: i64) -> Option<Money> {
        self.0.checked_mul(factor).map(Money)
    }

    pub fn checked_neg(self) -> Option<Money> {
        self.0.checked_neg().map(Money)
    }

    /// Multiply by a basis-point rate (1/10 000), rounding half away from zero
    /// to the nearest minor unit.
    pub fn apply_basis_points(self, basis_points: u32) -> Option<Money> {
        let scaled = (self.0 as i128).checked_mul(basis_points as i128)?;
        let half = if scaled < 0 { -5_000 } else { 5_000 };
        let rounded = (scaled + half) / 10_000;
        i64::try_from(rounded).ok().map(Money)
    }

    /// Sum a sequence of amounts, returning `None` on overflow.
    pub fn checked_sum<I>(amounts: I) -> Option<Money>
    where
        I: IntoIterator<Item = Money>,
    {
        amounts
            .into_iter()
            .try_fold(Money::ZERO, |acc, m| acc.checked_add(m))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Money::from_minor(12345).to_string(), "123.45");
        assert_eq!(Money::from_minor(-5).to_string(), "-0.05");
        assert_eq!(Money::ZERO.to_string(), "0.00");
    }

    #[test]
    fn test_basis_points_round_half_up() {
        // 10% of 12.35 = 1.235 -> 1.24
        assert_eq!(Money::from_minor(1235).apply_basis_points(1000), Some(Money::from_minor(124)));
        // 15% of 0.03 = 0.0045 -> 0.00
        assert_eq!(Money::from_minor(3).apply_basis_points(1500), Some(Money::ZERO));
    }

    #[test]
    fn test_checked_sum_overflow() {
        let total = Money::checked_sum([Money::from_minor(i64::MAX), Money::from_minor(1)]);
        assert!(total.is_none());

        let total = Money::checked_sum([Money::from_minor(100), Money::from_minor(200)]);
        assert_eq!(total, Some(Money::from_minor(300)));
    }

    #[test]
    fn test_serializes_as_integer() {
        let json = serde_json::to_string(&Money::from_minor(30000)).unwrap();
        assert_eq!(json, "30000");
    }
}
