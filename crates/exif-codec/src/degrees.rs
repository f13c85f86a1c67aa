//! Degrees/minutes/seconds triples in the fixed-width form EXIF stores
//!
//! A coordinate is split into whole degrees, whole minutes and a seconds
//! fraction, each a pair of unsigned 32-bit integers. The sign lives outside the
//! triple (it is written as a hemisphere reference).

use crate::error::RationalError;
use crate::rational::Rational;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Size of the serialized triple: six little-endian `u32`.
pub const DEGREES_WIRE_LEN: usize = 24;

/// An unsigned 32-bit fraction as stored in an EXIF RATIONAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fraction {
    pub numerator: u32,
    pub denominator: u32,
}

impl Fraction {
    pub const ZERO: Fraction = Fraction::new(0, 1);

    pub const fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    pub const fn whole(value: u32) -> Self {
        Self::new(value, 1)
    }

    /// `self / unit` as an exact value.
    fn over(self, unit: i64) -> Rational {
        // a zero denominator never survives construction
        Rational::new(i64::from(self.numerator), i64::from(self.denominator.max(1)) * unit)
            .unwrap_or_else(|_| Rational::zero())
    }
}

/// A signed angle as degrees, minutes and seconds.
///
/// Degrees and minutes always have denominator 1. Equality holds when the
/// fields match or when both sides denote the same exact angle, so `0°30'0"`
/// equals `0°29'60"`.
#[derive(Debug, Clone, Copy)]
pub struct RationalDegrees {
    degrees: Fraction,
    minutes: Fraction,
    seconds: Fraction,
    sign: i8,
}

impl RationalDegrees {
    pub const ZERO: RationalDegrees = RationalDegrees {
        degrees: Fraction::ZERO,
        minutes: Fraction::ZERO,
        seconds: Fraction::ZERO,
        sign: 0,
    };

    /// Split an exact value into degrees, minutes and a reduced seconds fraction.
    pub fn from_rational(value: &Rational) -> Result<Self, RationalError> {
        let sign = value.signum();
        let magnitude = value.abs();

        let degrees = magnitude.floor_u32()?;
        let rest = &magnitude - &Rational::from(degrees);
        if rest.is_zero() {
            return Ok(Self::from_parts(Fraction::whole(degrees), Fraction::ZERO, Fraction::ZERO, sign));
        }

        let rest = rest * 60;
        let minutes = rest.floor_u32()?;
        let rest = &rest - &Rational::from(minutes);
        if rest.is_zero() {
            return Ok(Self::from_parts(
                Fraction::whole(degrees),
                Fraction::whole(minutes),
                Fraction::ZERO,
                sign,
            ));
        }

        let (numerator, denominator) = (rest * 60).lowest_form()?;
        Ok(Self::from_parts(
            Fraction::whole(degrees),
            Fraction::whole(minutes),
            Fraction::new(numerator, denominator),
            sign,
        ))
    }

    pub fn from_f64(value: f64) -> Result<Self, RationalError> {
        Self::from_rational(&Rational::from_f64(value)?)
    }

    pub fn from_decimal_str(text: &str) -> Result<Self, RationalError> {
        Self::from_rational(&Rational::from_decimal_str(text)?)
    }

    /// Build from three EXIF rationals and an externally supplied sign.
    ///
    /// `0/0` components are read as zero; any other zero denominator is rejected.
    pub fn from_components(components: [Fraction; 3], sign: i8) -> Result<Self, RationalError> {
        let mut normalized = [Fraction::ZERO; 3];
        for (index, component) in components.into_iter().enumerate() {
            normalized[index] = match component {
                Fraction { numerator: 0, denominator: 0 } => Fraction::ZERO,
                Fraction { numerator, denominator: 0 } => {
                    return Err(RationalError::ZeroComponentDenominator { index, numerator });
                }
                other => other,
            };
        }
        Ok(Self::from_parts(normalized[0], normalized[1], normalized[2], sign.signum()))
    }

    /// Decode the 24-byte little-endian layout `degN degD minN minD secN secD`.
    pub fn from_bytes(bytes: &[u8], sign: i8) -> Result<Self, RationalError> {
        if bytes.len() != DEGREES_WIRE_LEN {
            return Err(RationalError::InvalidLength {
                expected: DEGREES_WIRE_LEN,
                got: bytes.len(),
            });
        }
        let mut words = [0u32; 6];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Self::from_components(
            [
                Fraction::new(words[0], words[1]),
                Fraction::new(words[2], words[3]),
                Fraction::new(words[4], words[5]),
            ],
            sign,
        )
    }

    fn from_parts(degrees: Fraction, minutes: Fraction, seconds: Fraction, sign: i8) -> Self {
        let all_zero = degrees.numerator == 0 && minutes.numerator == 0 && seconds.numerator == 0;
        Self {
            degrees,
            minutes,
            seconds,
            sign: if all_zero { 0 } else { sign },
        }
    }

    pub fn to_bytes(&self) -> [u8; DEGREES_WIRE_LEN] {
        let mut bytes = [0u8; DEGREES_WIRE_LEN];
        let words = [
            self.degrees.numerator,
            self.degrees.denominator,
            self.minutes.numerator,
            self.minutes.denominator,
            self.seconds.numerator,
            self.seconds.denominator,
        ];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    pub fn components(&self) -> [Fraction; 3] {
        [self.degrees, self.minutes, self.seconds]
    }

    pub fn degrees(&self) -> Fraction {
        self.degrees
    }

    pub fn minutes(&self) -> Fraction {
        self.minutes
    }

    pub fn seconds(&self) -> Fraction {
        self.seconds
    }

    pub fn sign(&self) -> i8 {
        self.sign
    }

    /// The exact angle `sign * (deg + min/60 + sec/3600)`.
    pub fn to_rational(&self) -> Rational {
        let magnitude = self.degrees.over(1) + self.minutes.over(60) + self.seconds.over(3600);
        if self.sign < 0 {
            -magnitude
        } else {
            magnitude
        }
    }

    pub fn to_f64(&self) -> f64 {
        self.to_rational().to_f64()
    }

    pub fn to_decimal(&self, places: usize) -> String {
        self.to_rational().to_decimal(places)
    }
}

impl PartialEq for RationalDegrees {
    fn eq(&self, other: &Self) -> bool {
        (self.sign == other.sign
            && self.degrees == other.degrees
            && self.minutes == other.minutes
            && self.seconds == other.seconds)
            || self.to_rational() == other.to_rational()
    }
}

impl Eq for RationalDegrees {}

impl Hash for RationalDegrees {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_rational().hash(state);
    }
}

impl fmt::Display for RationalDegrees {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(value: &RationalDegrees) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_decimal_round_trip_precision() -> Result<()> {
        for text in ["45.238", "10.2", "-10.2", "45.016666666", "0.0000001", "179.999999", "-89.123456", "12.5"] {
            let degrees = RationalDegrees::from_decimal_str(text)?;
            let expected: f64 = text.parse()?;
            assert!((degrees.to_f64() - expected).abs() < 1e-6, "{text} -> {}", degrees.to_f64());
            assert_eq!(degrees.degrees().denominator, 1);
            assert_eq!(degrees.minutes().denominator, 1);
            assert_eq!(degrees.to_decimal(6), format!("{expected:.6}"));
        }
        Ok(())
    }

    #[test]
    fn test_split_into_fields() -> Result<()> {
        // 45.238 = 45 deg, 14 min, 16.8 sec
        let degrees = RationalDegrees::from_decimal_str("45.238")?;
        assert_eq!(degrees.degrees(), Fraction::whole(45));
        assert_eq!(degrees.minutes(), Fraction::whole(14));
        assert_eq!(degrees.seconds(), Fraction::new(84, 5));
        assert_eq!(degrees.sign(), 1);

        // exact minutes stop early with unit zero seconds
        let degrees = RationalDegrees::from_decimal_str("-10.5")?;
        assert_eq!(degrees.components(), [Fraction::whole(10), Fraction::whole(30), Fraction::ZERO]);
        assert_eq!(degrees.sign(), -1);

        let degrees = RationalDegrees::from_decimal_str("45")?;
        assert_eq!(degrees.components(), [Fraction::whole(45), Fraction::ZERO, Fraction::ZERO]);
        Ok(())
    }

    #[test]
    fn test_zero_has_no_sign() -> Result<()> {
        assert_eq!(RationalDegrees::from_decimal_str("-0.0")?.sign(), 0);
        assert_eq!(RationalDegrees::from_f64(0.0)?, RationalDegrees::ZERO);
        assert_eq!(RationalDegrees::from_bytes(&[0u8; 24], -1)?.sign(), 0);
        Ok(())
    }

    #[test]
    fn test_wire_layout() -> Result<()> {
        let degrees = RationalDegrees::from_decimal_str("45.238")?;
        let bytes = degrees.to_bytes();
        assert_eq!(&bytes[0..4], &45u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &1u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &14u32.to_le_bytes());
        assert_eq!(&bytes[12..16], &1u32.to_le_bytes());
        assert_eq!(&bytes[16..20], &84u32.to_le_bytes());
        assert_eq!(&bytes[20..24], &5u32.to_le_bytes());

        let decoded = RationalDegrees::from_bytes(&bytes, 1)?;
        assert_eq!(decoded, degrees);
        assert_eq!(decoded.to_bytes(), bytes);

        let negative = RationalDegrees::from_bytes(&bytes, -1)?;
        assert_eq!(negative.to_f64(), -degrees.to_f64());
        Ok(())
    }

    #[test]
    fn test_from_bytes_rejects_bad_input() {
        assert!(matches!(
            RationalDegrees::from_bytes(&[0u8; 23], 1),
            Err(RationalError::InvalidLength { expected: 24, got: 23 })
        ));

        let mut bytes = [0u8; 24];
        bytes[0..4].copy_from_slice(&12u32.to_le_bytes());
        assert!(matches!(
            RationalDegrees::from_bytes(&bytes, 1),
            Err(RationalError::ZeroComponentDenominator { index: 0, numerator: 12 })
        ));
    }

    #[test]
    fn test_zero_over_zero_reads_as_zero() -> Result<()> {
        let mut bytes = [0u8; 24];
        bytes[0..4].copy_from_slice(&7u32.to_le_bytes());
        bytes[4..8].copy_from_slice(&1u32.to_le_bytes());
        let degrees = RationalDegrees::from_bytes(&bytes, 1)?;
        assert_eq!(degrees.components(), [Fraction::whole(7), Fraction::ZERO, Fraction::ZERO]);
        assert_eq!(degrees.to_f64(), 7.0);
        Ok(())
    }

    #[test]
    fn test_equality_by_value() -> Result<()> {
        let canonical = RationalDegrees::from_decimal_str("0.5")?;
        let unusual = RationalDegrees::from_components(
            [Fraction::ZERO, Fraction::whole(29), Fraction::whole(60)],
            1,
        )?;
        assert_ne!(canonical.components(), unusual.components());
        assert_eq!(canonical, unusual);
        assert_eq!(hash_of(&canonical), hash_of(&unusual));

        assert_ne!(canonical, RationalDegrees::from_decimal_str("-0.5")?);
        Ok(())
    }

    #[test]
    fn test_out_of_range_degrees_overflow() {
        assert!(RationalDegrees::from_decimal_str("4294967296.5").is_err());
        assert!(RationalDegrees::from_f64(f64::NAN).is_err());
    }
}
