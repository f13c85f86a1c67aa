//! Exact rational numbers and their reduction to bounded 32-bit fractions
//!
//! Coordinates are carried as arbitrary precision fractions from the moment they
//! are parsed until they are written, so a value typed as `45.238` is stored as
//! exactly `22619/500` and only approximated once, when it is squeezed into the
//! `u32/u32` pairs that EXIF rationals allow.

use crate::error::RationalError;
use num_bigint::BigInt;
use num_integer::Integer;
use num_rational::BigRational;
use num_traits::{One, Signed, ToPrimitive, Zero};
use std::fmt;
use std::ops::{Add, Mul, Neg, Sub};
use std::str::FromStr;

/// Largest power of ten a decimal literal may scale by.
const MAX_DECIMAL_SCALE: u32 = 10_000;

/// Upper bound on continued-fraction steps taken by [`Rational::lowest_form`].
const MAX_REDUCTION_STEPS: usize = 128;

/// An exact, always-reduced fraction with the sign carried by the numerator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rational {
    value: BigRational,
}

impl Rational {
    /// Create `numerator / denominator`, reduced.
    pub fn new(numerator: i64, denominator: i64) -> Result<Self, RationalError> {
        if denominator == 0 {
            return Err(RationalError::ZeroDenominator);
        }
        Ok(Self {
            value: BigRational::new(BigInt::from(numerator), BigInt::from(denominator)),
        })
    }

    pub fn zero() -> Self {
        Self {
            value: BigRational::zero(),
        }
    }

    pub fn from_integer(value: i64) -> Self {
        Self {
            value: BigRational::from_integer(BigInt::from(value)),
        }
    }

    /// Exact value of an IEEE-754 double. `0.1` becomes the 55-bit fraction the
    /// double actually holds, not `1/10`.
    pub fn from_f64(value: f64) -> Result<Self, RationalError> {
        BigRational::from_float(value)
            .map(|value| Self { value })
            .ok_or(RationalError::NotFinite(value))
    }

    /// Exact value of a decimal literal such as `-45.238`, `10.`, `.5` or `1.5e-3`.
    pub fn from_decimal_str(text: &str) -> Result<Self, RationalError> {
        let invalid = || RationalError::InvalidDecimal(text.to_string());
        let trimmed = text.trim();

        let (negative, rest) = match trimmed.as_bytes().first() {
            Some(b'-') => (true, &trimmed[1..]),
            Some(b'+') => (false, &trimmed[1..]),
            _ => (false, trimmed),
        };

        let (mantissa, exponent) = match rest.find(['e', 'E']) {
            Some(pos) => {
                let exponent: i32 = rest[pos + 1..].parse().map_err(|_| invalid())?;
                (&rest[..pos], exponent)
            }
            None => (rest, 0),
        };

        let (int_part, frac_part) = match mantissa.split_once('.') {
            Some((int_part, frac_part)) => (int_part, frac_part),
            None => (mantissa, ""),
        };
        let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
        if int_part.len() + frac_part.len() == 0 || !all_digits(int_part) || !all_digits(frac_part) {
            return Err(invalid());
        }

        let digits = format!("{int_part}{frac_part}");
        let mut numerator = BigInt::parse_bytes(digits.as_bytes(), 10).ok_or_else(invalid)?;
        if negative {
            numerator = -numerator;
        }

        let scale = i32::try_from(frac_part.len())
            .ok()
            .and_then(|places| exponent.checked_sub(places))
            .filter(|scale| scale.unsigned_abs() <= MAX_DECIMAL_SCALE)
            .ok_or_else(invalid)?;
        let ten = BigInt::from(10u32);
        let value = if scale >= 0 {
            BigRational::from_integer(numerator * ten.pow(scale.unsigned_abs()))
        } else {
            BigRational::new(numerator, ten.pow(scale.unsigned_abs()))
        };
        Ok(Self { value })
    }

    pub fn numer(&self) -> &BigInt {
        self.value.numer()
    }

    pub fn denom(&self) -> &BigInt {
        self.value.denom()
    }

    pub fn is_zero(&self) -> bool {
        self.value.is_zero()
    }

    pub fn is_negative(&self) -> bool {
        self.value.is_negative()
    }

    /// -1, 0 or 1.
    pub fn signum(&self) -> i8 {
        if self.value.is_zero() {
            0
        } else if self.value.is_negative() {
            -1
        } else {
            1
        }
    }

    pub fn abs(&self) -> Self {
        Self {
            value: self.value.abs(),
        }
    }

    /// Largest integer not greater than `self`.
    pub fn floor(&self) -> Self {
        Self {
            value: self.value.floor(),
        }
    }

    /// Floor of a non-negative value as a `u32`.
    pub fn floor_u32(&self) -> Result<u32, RationalError> {
        self.value
            .floor()
            .to_integer()
            .to_u32()
            .ok_or_else(|| RationalError::Overflow(self.to_string()))
    }

    /// Nearest double. Lossy; for display and comparisons only.
    pub fn to_f64(&self) -> f64 {
        self.value.to_f64().unwrap_or(f64::NAN)
    }

    /// Decimal rendering rounded (half away from zero) to `places` digits.
    pub fn to_decimal(&self, places: usize) -> String {
        let scale = BigInt::from(10u32).pow(places as u32);
        let scaled = (&self.value * BigRational::from_integer(scale.clone()))
            .round()
            .to_integer();
        let (whole, frac) = scaled.abs().div_rem(&scale);
        let sign = if scaled.is_negative() { "-" } else { "" };
        if places == 0 {
            format!("{sign}{whole}")
        } else {
            format!("{sign}{whole}.{frac:0>places$}")
        }
    }

    /// Closest fraction whose numerator and denominator both fit in a `u32`.
    ///
    /// Fails for negative values and for values whose integer part alone is
    /// larger than `u32::MAX`.
    pub fn lowest_form(&self) -> Result<(u32, u32), RationalError> {
        let (numerator, denominator) = self.lowest_form_within(u64::from(u32::MAX))?;
        // both halves were bounded by u32::MAX above
        match (u32::try_from(numerator), u32::try_from(denominator)) {
            (Ok(n), Ok(d)) => Ok((n, d)),
            _ => Err(RationalError::Overflow(self.to_string())),
        }
    }

    /// Best approximation `h/k` with `h <= max` and `k <= max`.
    ///
    /// Walks the continued fraction of the value, one partial quotient per step.
    /// When the next convergent leaves the box, the answer is either the last
    /// convergent or the largest semiconvergent that still fits; those are the two
    /// Stern-Brocot neighbours of the value inside the box.
    pub(crate) fn lowest_form_within(&self, max: u64) -> Result<(u64, u64), RationalError> {
        if self.value.is_negative() {
            return Err(RationalError::Overflow(self.to_string()));
        }
        if self.value.is_zero() {
            return Ok((0, 1));
        }

        let bound = BigInt::from(max);
        if self.numer() <= &bound && self.denom() <= &bound {
            return Ok((to_u64(self.numer()), to_u64(self.denom())));
        }
        if self.value.floor().to_integer() > bound {
            return Err(RationalError::Overflow(self.to_string()));
        }

        // (h1, k1) is the latest convergent, (h0, k0) the one before it.
        let (mut h0, mut k0) = (BigInt::zero(), BigInt::one());
        let (mut h1, mut k1) = (BigInt::one(), BigInt::zero());
        let mut p = self.numer().clone();
        let mut q = self.denom().clone();

        for _ in 0..MAX_REDUCTION_STEPS {
            if q.is_zero() {
                break;
            }
            let (a, r) = p.div_rem(&q);
            let h = &a * &h1 + &h0;
            let k = &a * &k1 + &k0;

            if h > bound || k > bound {
                let m = largest_multiplier(&bound, (&h1, &k1), (&h0, &k0));
                let semi = (&m * &h1 + &h0, &m * &k1 + &k0);
                return Ok(self.closer_of((h1, k1), semi));
            }

            h0 = std::mem::replace(&mut h1, h);
            k0 = std::mem::replace(&mut k1, k);
            p = std::mem::replace(&mut q, r);
        }

        Ok((to_u64(&h1), to_u64(&k1)))
    }

    /// The candidate nearest to `self`; ties go to `first`. A zero denominator
    /// stands for infinity and is never chosen over a finite candidate.
    fn closer_of(&self, first: (BigInt, BigInt), second: (BigInt, BigInt)) -> (u64, u64) {
        if second.1.is_zero() {
            return (to_u64(&first.0), to_u64(&first.1));
        }
        if first.1.is_zero() {
            return (to_u64(&second.0), to_u64(&second.1));
        }
        let distance = |(h, k): &(BigInt, BigInt)| {
            (BigRational::new(h.clone(), k.clone()) - &self.value).abs()
        };
        if distance(&second) < distance(&first) {
            (to_u64(&second.0), to_u64(&second.1))
        } else {
            (to_u64(&first.0), to_u64(&first.1))
        }
    }
}

/// Largest `m` with `m*h1 + h0 <= bound` and `m*k1 + k0 <= bound`.
fn largest_multiplier(bound: &BigInt, (h1, k1): (&BigInt, &BigInt), (h0, k0): (&BigInt, &BigInt)) -> BigInt {
    let limit = |step: &BigInt, base: &BigInt| {
        if step.is_zero() {
            None
        } else {
            Some((bound - base).div_floor(step))
        }
    };
    let m = match (limit(h1, h0), limit(k1, k0)) {
        (Some(a), Some(b)) => a.min(b),
        (Some(a), None) | (None, Some(a)) => a,
        (None, None) => BigInt::zero(),
    };
    m.max(BigInt::zero())
}

fn to_u64(value: &BigInt) -> u64 {
    // callers only pass values already checked against a u64 bound
    value.to_u64().unwrap_or(u64::MAX)
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.value.is_integer() {
            write!(f, "{}", self.value.numer())
        } else {
            write!(f, "{}/{}", self.value.numer(), self.value.denom())
        }
    }
}

impl FromStr for Rational {
    type Err = RationalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_decimal_str(s)
    }
}

impl From<u32> for Rational {
    fn from(value: u32) -> Self {
        Self::from_integer(i64::from(value))
    }
}

impl Add for Rational {
    type Output = Rational;

    fn add(self, rhs: Rational) -> Rational {
        Rational {
            value: self.value + rhs.value,
        }
    }
}

impl<'a> Add<&'a Rational> for &'a Rational {
    type Output = Rational;

    fn add(self, rhs: &'a Rational) -> Rational {
        Rational {
            value: &self.value + &rhs.value,
        }
    }
}

impl Sub for Rational {
    type Output = Rational;

    fn sub(self, rhs: Rational) -> Rational {
        Rational {
            value: self.value - rhs.value,
        }
    }
}

impl<'a> Sub<&'a Rational> for &'a Rational {
    type Output = Rational;

    fn sub(self, rhs: &'a Rational) -> Rational {
        Rational {
            value: &self.value - &rhs.value,
        }
    }
}

impl Mul<i64> for Rational {
    type Output = Rational;

    fn mul(self, rhs: i64) -> Rational {
        Rational {
            value: self.value * BigRational::from_integer(BigInt::from(rhs)),
        }
    }
}

impl Mul<i64> for &Rational {
    type Output = Rational;

    fn mul(self, rhs: i64) -> Rational {
        Rational {
            value: &self.value * BigRational::from_integer(BigInt::from(rhs)),
        }
    }
}

impl Neg for Rational {
    type Output = Rational;

    fn neg(self) -> Rational {
        Rational { value: -self.value }
    }
}
