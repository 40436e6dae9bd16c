use std::cmp::Ordering;
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};

use serde::{Deserialize, Serialize};

/// Fixed-point quantity with 6 decimal places of precision.
///
/// Used for every quantity, price, wage and cash amount that crosses a process
/// boundary, so the simulation loop and the model authority compute identical
/// balances. Multiplication and division widen to `i128` and truncate toward
/// zero, which keeps `floor(cash / price) * price <= cash` for non-negative
/// operands.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scalar(i64);

impl Scalar {
    pub const SCALE: i64 = 1_000_000;
    pub const ZERO: Scalar = Scalar(0);
    pub const ONE: Scalar = Scalar(Self::SCALE);
    pub const MAX: Scalar = Scalar(i64::MAX);

    pub fn from_f64(value: f64) -> Self {
        Self((value * Self::SCALE as f64).round() as i64)
    }

    pub fn from_i64(value: i64) -> Self {
        Self(value.saturating_mul(Self::SCALE))
    }

    pub fn from_u32(value: u32) -> Self {
        Self((value as i64) * Self::SCALE)
    }

    pub fn to_f64(self) -> f64 {
        self.0 as f64 / Self::SCALE as f64
    }

    pub fn zero() -> Self {
        Self::ZERO
    }

    pub fn one() -> Self {
        Self::ONE
    }

    pub fn raw(self) -> i64 {
        self.0
    }

    pub fn from_raw(value: i64) -> Self {
        Self(value)
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn abs(self) -> Self {
        Self(self.0.abs())
    }

    /// Clamp negative values to zero.
    pub fn non_negative(self) -> Self {
        if self.0 < 0 {
            Self::ZERO
        } else {
            self
        }
    }

    pub fn clamp(self, min: Self, max: Self) -> Self {
        match self.cmp(&min) {
            Ordering::Less => min,
            Ordering::Equal | Ordering::Greater => {
                if self > max {
                    max
                } else {
                    self
                }
            }
        }
    }

    /// Division that yields `None` for a zero divisor instead of panicking.
    pub fn checked_div(self, rhs: Self) -> Option<Self> {
        if rhs.0 == 0 {
            return None;
        }
        Some(self / rhs)
    }

    /// Multiply by a whole number, e.g. a building level.
    pub fn times(self, factor: u32) -> Self {
        Self(self.0.saturating_mul(factor as i64))
    }
}

fn narrow(value: i128) -> i64 {
    value.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

impl Add for Scalar {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Scalar {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Scalar {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl SubAssign for Scalar {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl Mul for Scalar {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self::Output {
        Self(narrow((self.0 as i128 * rhs.0 as i128) / Self::SCALE as i128))
    }
}

impl Div for Scalar {
    type Output = Self;

    fn div(self, rhs: Self) -> Self::Output {
        Self(narrow((self.0 as i128 * Self::SCALE as i128) / rhs.0 as i128))
    }
}

impl Neg for Scalar {
    type Output = Self;

    fn neg(self) -> Self::Output {
        Self(-self.0)
    }
}

impl Sum for Scalar {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Scalar::ZERO, |acc, value| acc + value)
    }
}

impl fmt::Debug for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}", self.to_f64())
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}", self.to_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affordable_quantity_never_overspends() {
        let cash = Scalar::from_f64(1_234.567_891);
        let price = Scalar::from_f64(3.7);
        let quantity = cash / price;
        assert!(quantity * price <= cash);
    }

    #[test]
    fn large_balances_do_not_overflow_multiplication() {
        let cash = Scalar::from_i64(5_000_000_000);
        let rate = Scalar::from_f64(1.25);
        assert_eq!(cash * rate, Scalar::from_i64(6_250_000_000));
    }

    #[test]
    fn checked_div_rejects_zero() {
        assert!(Scalar::one().checked_div(Scalar::zero()).is_none());
        assert_eq!(
            Scalar::from_i64(10).checked_div(Scalar::from_i64(4)),
            Some(Scalar::from_f64(2.5))
        );
    }

    #[test]
    fn non_negative_floors_at_zero() {
        assert_eq!(Scalar::from_i64(-3).non_negative(), Scalar::zero());
        assert_eq!(Scalar::from_i64(3).non_negative(), Scalar::from_i64(3));
    }
}
