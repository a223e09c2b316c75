use std::cmp::Ordering;
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Mul, Neg, Sub, SubAssign};

const LN_2: f64 = std::f64::consts::LN_2;
const LOG10_2: f64 = std::f64::consts::LOG10_2;

/// Exponent gap beyond which the smaller operand of an addition is below the
/// mantissa resolution and is dropped.
const ALIGN_LIMIT: i64 = 64;

/// Number of bytes produced by [`BigExp::to_bytes`].
pub const ENCODED_LEN: usize = 16;

/// A real number with a double-precision mantissa and an unbounded binary exponent.
///
/// Partition functions of even modest design problems overflow `f64` by hundreds
/// of orders of magnitude, while their relative precision requirements stay
/// modest. `BigExp` keeps the value as `fp * 2^exp` with `|fp|` normalized into
/// `[0.5, 1)` (or exactly zero), so multiplication never overflows and addition
/// keeps full double precision relative to the larger operand.
#[derive(Clone, Copy, Default)]
pub struct BigExp {
    fp: f64,
    exp: i64,
}

impl BigExp {
    pub const ZERO: BigExp = BigExp { fp: 0.0, exp: 0 };
    pub const ONE: BigExp = BigExp { fp: 0.5, exp: 1 };

    pub fn new(fp: f64, exp: i64) -> Self {
        if fp == 0.0 || !fp.is_finite() {
            return Self { fp, exp: 0 };
        }
        let (mantissa, shift) = frexp(fp);
        Self {
            fp: mantissa,
            exp: exp + shift,
        }
    }

    pub fn from_f64(value: f64) -> Self {
        Self::new(value, 0)
    }

    /// Builds `e^ln` without ever materializing the (possibly overflowing) value.
    pub fn from_ln(ln: f64) -> Self {
        if ln == f64::NEG_INFINITY {
            return Self::ZERO;
        }
        let log2 = ln / LN_2;
        let whole = log2.floor();
        let frac = log2 - whole;
        Self::new(2f64.powf(frac), whole as i64)
    }

    /// Natural logarithm. Zero and negative values map to negative infinity.
    pub fn ln(&self) -> f64 {
        if self.fp <= 0.0 {
            return f64::NEG_INFINITY;
        }
        self.fp.ln() + self.exp as f64 * LN_2
    }

    pub fn log10(&self) -> f64 {
        if self.fp <= 0.0 {
            return f64::NEG_INFINITY;
        }
        self.fp.log10() + self.exp as f64 * LOG10_2
    }

    /// Converts back to `f64`, saturating to infinity or zero outside its range.
    pub fn to_f64(&self) -> f64 {
        if self.fp == 0.0 {
            return 0.0;
        }
        if self.exp > 1100 {
            return self.fp.signum() * f64::INFINITY;
        }
        if self.exp < -1100 {
            return 0.0;
        }
        let half = self.exp / 2;
        self.fp * 2f64.powi(half as i32) * 2f64.powi((self.exp - half) as i32)
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.fp == 0.0
    }

    #[inline]
    pub fn is_sign_negative(&self) -> bool {
        self.fp < 0.0
    }

    pub fn abs(&self) -> Self {
        Self {
            fp: self.fp.abs(),
            exp: self.exp,
        }
    }

    /// Clamps rounding residue below zero back to zero.
    pub fn clamp_non_negative(&self) -> Self {
        if self.fp < 0.0 { Self::ZERO } else { *self }
    }

    pub fn max(self, other: Self) -> Self {
        if other > self { other } else { self }
    }

    pub fn min(self, other: Self) -> Self {
        if other < self { other } else { self }
    }

    /// True when `|self - other| <= tolerance * max(|self|, |other|)`.
    pub fn approx_eq(&self, other: &Self, tolerance: f64) -> bool {
        let diff = (*self - *other).abs();
        let scale = self.abs().max(other.abs());
        diff <= scale * tolerance
    }

    pub fn to_bytes(&self) -> [u8; ENCODED_LEN] {
        let mut out = [0u8; ENCODED_LEN];
        out[..8].copy_from_slice(&self.fp.to_le_bytes());
        out[8..].copy_from_slice(&self.exp.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; ENCODED_LEN]) -> Self {
        let mut fp = [0u8; 8];
        let mut exp = [0u8; 8];
        fp.copy_from_slice(&bytes[..8]);
        exp.copy_from_slice(&bytes[8..]);
        Self::new(f64::from_le_bytes(fp), i64::from_le_bytes(exp))
    }
}

/// Splits a finite, non-zero `x` into `(m, e)` with `x = m * 2^e` and `|m|` in `[0.5, 1)`.
fn frexp(x: f64) -> (f64, i64) {
    if x == 0.0 || !x.is_finite() {
        return (x, 0);
    }
    let bits = x.to_bits();
    let exp_bits = ((bits >> 52) & 0x7ff) as i64;
    if exp_bits == 0 {
        // subnormal
        let (m, e) = frexp(x * 2f64.powi(64));
        return (m, e - 64);
    }
    let mantissa_bits = (bits & !(0x7ffu64 << 52)) | (1022u64 << 52);
    (f64::from_bits(mantissa_bits), exp_bits - 1022)
}

impl Add for BigExp {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        if self.fp == 0.0 {
            return rhs;
        }
        if rhs.fp == 0.0 {
            return self;
        }
        let gap = self.exp - rhs.exp;
        if gap > ALIGN_LIMIT {
            return self;
        }
        if gap < -ALIGN_LIMIT {
            return rhs;
        }
        if gap >= 0 {
            Self::new(self.fp + rhs.fp * 2f64.powi(-gap as i32), self.exp)
        } else {
            Self::new(self.fp * 2f64.powi(gap as i32) + rhs.fp, rhs.exp)
        }
    }
}

impl AddAssign for BigExp {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Neg for BigExp {
    type Output = Self;

    fn neg(self) -> Self {
        Self {
            fp: -self.fp,
            exp: self.exp,
        }
    }
}

impl Sub for BigExp {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        self + (-rhs)
    }
}

impl SubAssign for BigExp {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl Mul for BigExp {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self {
        Self::new(self.fp * rhs.fp, self.exp + rhs.exp)
    }
}

impl Mul<f64> for BigExp {
    type Output = Self;

    fn mul(self, rhs: f64) -> Self {
        self * BigExp::from_f64(rhs)
    }
}

impl Sum for BigExp {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(BigExp::ZERO, |acc, z| acc + z)
    }
}

impl<'a> Sum<&'a BigExp> for BigExp {
    fn sum<I: Iterator<Item = &'a BigExp>>(iter: I) -> Self {
        iter.fold(BigExp::ZERO, |acc, z| acc + *z)
    }
}

impl PartialEq for BigExp {
    fn eq(&self, other: &Self) -> bool {
        self.partial_cmp(other) == Some(Ordering::Equal)
    }
}

impl PartialOrd for BigExp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        let diff = *self - *other;
        diff.fp.partial_cmp(&0.0)
    }
}

impl From<f64> for BigExp {
    fn from(value: f64) -> Self {
        Self::from_f64(value)
    }
}

impl fmt::Debug for BigExp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BigExp({})", self)
    }
}

impl fmt::Display for BigExp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fp == 0.0 {
            return write!(f, "0");
        }
        if !self.fp.is_finite() {
            return write!(f, "{}", self.fp);
        }
        let sign = if self.fp < 0.0 { "-" } else { "" };
        let log10 = self.abs().log10();
        let decade = log10.floor();
        let mantissa = 10f64.powf(log10 - decade);
        let precision = f.precision().unwrap_or(6);
        write!(f, "{sign}{mantissa:.precision$}e{decade}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-12 * a.abs().max(b.abs())
    }

    #[test]
    fn frexp_normalizes_into_half_open_unit_interval() {
        for x in [1.0, 0.5, 3.0, 1e300, 1e-300, -7.25] {
            let (m, e) = frexp(x);
            assert!(m.abs() >= 0.5 && m.abs() < 1.0, "mantissa {m} for {x}");
            assert_eq!(m * 2f64.powi(e as i32), x);
        }
    }

    #[test]
    fn arithmetic_matches_f64_within_range() {
        let a = BigExp::from_f64(3.5);
        let b = BigExp::from_f64(0.125);
        assert!(close((a + b).to_f64(), 3.625));
        assert!(close((a - b).to_f64(), 3.375));
        assert!(close((b - a).to_f64(), -3.375));
        assert!(close((a * b).to_f64(), 0.4375));
        assert!(close((a * 2.0).to_f64(), 7.0));
    }

    #[test]
    fn from_ln_and_ln_are_inverse_far_outside_f64_range() {
        let z = BigExp::from_ln(5000.0);
        assert!(z.to_f64().is_infinite());
        assert!((z.ln() - 5000.0).abs() < 1e-9);

        let tiny = BigExp::from_ln(-5000.0);
        assert_eq!(tiny.to_f64(), 0.0);
        assert!((tiny.ln() + 5000.0).abs() < 1e-9);
    }

    #[test]
    fn from_ln_of_negative_infinity_is_zero() {
        assert!(BigExp::from_ln(f64::NEG_INFINITY).is_zero());
        assert_eq!(BigExp::ZERO.ln(), f64::NEG_INFINITY);
    }

    #[test]
    fn ordering_handles_huge_exponents_and_signs() {
        let huge = BigExp::from_ln(3000.0);
        let bigger = BigExp::from_ln(3000.5);
        assert!(bigger > huge);
        assert!(huge > BigExp::ONE);
        assert!(-huge < BigExp::ZERO);
        assert!(BigExp::ZERO < BigExp::from_ln(-3000.0));
        assert_eq!(huge.max(bigger), bigger);
        assert_eq!(huge.min(bigger), huge);
    }

    #[test]
    fn addition_drops_operands_below_mantissa_resolution() {
        let big = BigExp::from_ln(1000.0);
        let small = BigExp::from_ln(-1000.0);
        assert_eq!(big + small, big);
        assert_eq!(small + big, big);
    }

    #[test]
    fn subtracting_equal_values_gives_exact_zero() {
        let z = BigExp::from_ln(123.456);
        assert!((z - z).is_zero());
    }

    #[test]
    fn approx_eq_is_relative() {
        let a = BigExp::from_ln(700.0);
        let b = a * (1.0 + 1e-9);
        assert!(a.approx_eq(&b, 1e-6));
        assert!(!a.approx_eq(&(a * 1.01), 1e-6));
    }

    #[test]
    fn byte_encoding_preserves_value() {
        let z = BigExp::from_ln(-4321.5);
        let decoded = BigExp::from_bytes(&z.to_bytes());
        assert_eq!(decoded.ln(), z.ln());
    }

    #[test]
    fn display_uses_decimal_scientific_notation() {
        assert_eq!(format!("{}", BigExp::from_f64(1500.0)), "1.500000e3");
        assert_eq!(format!("{:.2}", BigExp::from_f64(-0.025)), "-2.50e-2");
        assert_eq!(format!("{}", BigExp::ZERO), "0");
    }

    #[test]
    fn sum_accumulates_references_and_values() {
        let values = vec![BigExp::from_f64(1.0), BigExp::from_f64(2.0)];
        let by_ref: BigExp = values.iter().sum();
        let by_val: BigExp = values.into_iter().sum();
        assert!(close(by_ref.to_f64(), 3.0));
        assert!(close(by_val.to_f64(), 3.0));
    }
}
