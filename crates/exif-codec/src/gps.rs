//! GPS locations as a pair of [`RationalDegrees`]
//!
//! Parses free-form user input such as `10.2S, 45.238E`, renders decimal
//! degrees for display and produces the byte blocks stored in the EXIF GPS IFD.

use crate::degrees::{Fraction, RationalDegrees, DEGREES_WIRE_LEN};
use crate::error::RationalError;
use crate::rational::Rational;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

const NORTH: [u8; 2] = [b'N', 0];
const SOUTH: [u8; 2] = [b'S', 0];
const EAST: [u8; 2] = [b'E', 0];
const WEST: [u8; 2] = [b'W', 0];

/// An immutable latitude/longitude pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpsLocation {
    latitude: RationalDegrees,
    longitude: RationalDegrees,
}

impl GpsLocation {
    pub fn new(latitude: RationalDegrees, longitude: RationalDegrees) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn from_f64(latitude: f64, longitude: f64) -> Result<Self, RationalError> {
        Ok(Self::new(
            RationalDegrees::from_f64(latitude)?,
            RationalDegrees::from_f64(longitude)?,
        ))
    }

    /// Decode the four EXIF GPS fields. A reference starting with `S` or `W`
    /// makes the coordinate negative.
    pub fn from_bytes(
        latitude_ref: &[u8],
        latitude: &[u8],
        longitude_ref: &[u8],
        longitude: &[u8],
    ) -> Result<Self, RationalError> {
        Ok(Self::new(
            RationalDegrees::from_bytes(latitude, ref_sign(latitude_ref, b'S'))?,
            RationalDegrees::from_bytes(longitude, ref_sign(longitude_ref, b'W'))?,
        ))
    }

    /// Build from EXIF rational triples and their textual references.
    pub fn from_components(
        latitude_ref: &str,
        latitude: [Fraction; 3],
        longitude_ref: &str,
        longitude: [Fraction; 3],
    ) -> Result<Self, RationalError> {
        Ok(Self::new(
            RationalDegrees::from_components(latitude, ref_sign(latitude_ref.as_bytes(), b'S'))?,
            RationalDegrees::from_components(longitude, ref_sign(longitude_ref.as_bytes(), b'W'))?,
        ))
    }

    pub fn latitude(&self) -> &RationalDegrees {
        &self.latitude
    }

    pub fn longitude(&self) -> &RationalDegrees {
        &self.longitude
    }

    pub fn latitude_f64(&self) -> f64 {
        self.latitude.to_f64()
    }

    pub fn longitude_f64(&self) -> f64 {
        self.longitude.to_f64()
    }

    /// `'N'` or `'S'`; zero is north.
    pub fn latitude_ref(&self) -> char {
        if self.latitude.sign() < 0 {
            'S'
        } else {
            'N'
        }
    }

    /// `'E'` or `'W'`; zero is east.
    pub fn longitude_ref(&self) -> char {
        if self.longitude.sign() < 0 {
            'W'
        } else {
            'E'
        }
    }

    /// NUL-terminated ASCII reference as stored in `GPSLatitudeRef`.
    pub fn latitude_ref_bytes(&self) -> [u8; 2] {
        if self.latitude.sign() < 0 {
            SOUTH
        } else {
            NORTH
        }
    }

    pub fn longitude_ref_bytes(&self) -> [u8; 2] {
        if self.longitude.sign() < 0 {
            WEST
        } else {
            EAST
        }
    }

    pub fn latitude_bytes(&self) -> [u8; DEGREES_WIRE_LEN] {
        self.latitude.to_bytes()
    }

    pub fn longitude_bytes(&self) -> [u8; DEGREES_WIRE_LEN] {
        self.longitude.to_bytes()
    }
}

fn ref_sign(reference: &[u8], negative: u8) -> i8 {
    match reference.first() {
        Some(first) if first.eq_ignore_ascii_case(&negative) => -1,
        _ => 1,
    }
}

impl fmt::Display for GpsLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.latitude.to_f64(), self.longitude.to_f64())
    }
}

/// Serialized as its display text, `"lat, lon"`.
impl Serialize for GpsLocation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GpsLocation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

impl FromStr for GpsLocation {
    type Err = RationalError;

    /// Finds the first `<lat> [N|S] [,] <lon> [E|W]` in the text. Numbers are
    /// `-?digits[.digits]`, whitespace between parts is optional and anything
    /// around the match is ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let found = find_location(s.as_bytes()).ok_or_else(|| RationalError::InvalidLocation(s.to_string()))?;

        let mut latitude = Rational::from_decimal_str(&s[found.latitude.0..found.latitude.1])?;
        if matches!(found.latitude_ref, Some(b'S' | b's')) {
            latitude = -latitude;
        }
        let mut longitude = Rational::from_decimal_str(&s[found.longitude.0..found.longitude.1])?;
        if matches!(found.longitude_ref, Some(b'W' | b'w')) {
            longitude = -longitude;
        }

        Ok(Self::new(
            RationalDegrees::from_rational(&latitude)?,
            RationalDegrees::from_rational(&longitude)?,
        ))
    }
}

struct LocationMatch {
    latitude: (usize, usize),
    latitude_ref: Option<u8>,
    longitude: (usize, usize),
    longitude_ref: Option<u8>,
}

fn find_location(text: &[u8]) -> Option<LocationMatch> {
    (0..text.len()).find_map(|start| match_at(text, start))
}

/// Leftmost-first match at `start`. Only the first number can need
/// backtracking; everything after it is optional and cannot contain digits.
fn match_at(text: &[u8], start: usize) -> Option<LocationMatch> {
    for latitude_end in number_ends(text, start) {
        let mut pos = skip_spaces(text, latitude_end);
        let latitude_ref = take_one_of(text, &mut pos, b"nsNS");
        pos = skip_spaces(text, pos);
        take_one_of(text, &mut pos, b",");
        pos = skip_spaces(text, pos);

        let Some(&longitude_end) = number_ends(text, pos).first() else {
            continue;
        };
        let mut after = skip_spaces(text, longitude_end);
        let longitude_ref = take_one_of(text, &mut after, b"ewEW");

        return Some(LocationMatch {
            latitude: (start, latitude_end),
            latitude_ref,
            longitude: (pos, longitude_end),
            longitude_ref,
        });
    }
    None
}

/// End positions of `-?[0-9]+\.?[0-9]*` starting at `start`, longest first.
fn number_ends(text: &[u8], start: usize) -> Vec<usize> {
    let mut pos = start;
    if text.get(pos) == Some(&b'-') {
        pos += 1;
    }
    let int_end = digits_from(text, pos);
    if int_end == pos {
        return Vec::new();
    }

    let mut ends = Vec::new();
    if text.get(int_end) == Some(&b'.') {
        let frac_end = digits_from(text, int_end + 1);
        ends.extend((int_end + 1..=frac_end).rev());
    }
    ends.extend((pos + 1..=int_end).rev());
    ends
}

fn digits_from(text: &[u8], mut pos: usize) -> usize {
    while text.get(pos).is_some_and(u8::is_ascii_digit) {
        pos += 1;
    }
    pos
}

fn skip_spaces(text: &[u8], mut pos: usize) -> usize {
    while text.get(pos).is_some_and(u8::is_ascii_whitespace) {
        pos += 1;
    }
    pos
}

fn take_one_of(text: &[u8], pos: &mut usize, set: &[u8]) -> Option<u8> {
    let byte = *text.get(*pos)?;
    if set.contains(&byte) {
        *pos += 1;
        Some(byte)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn parse(text: &str) -> Result<String> {
        Ok(text.parse::<GpsLocation>()?.to_string())
    }

    #[test]
    fn test_parse_and_display() -> Result<()> {
        let cases = [
            ("10.2,45.238", "10.2, 45.238"),
            ("10.2, 45.016666666", "10.2, 45.016666666"),
            ("10.2N,45.238", "10.2, 45.238"),
            ("10.2,45.238fE", "10.2, 45.238"),
            ("10.256456456894N,45.238E", "10.256456456894, 45.238"),
            ("-10.2,45.238", "-10.2, 45.238"),
            ("-10.2, 45", "-10.2, 45"),
            ("10.2S,45.0166666667", "-10.2, 45.0166666667"),
            ("-10.2,45.238E", "-10.2, 45.238"),
            ("10.2S,45.238E", "-10.2, 45.238"),
            ("10.2,-45.238", "10.2, -45.238"),
            ("10.2, -45.238", "10.2, -45.238"),
            ("10.2N,-45.238", "10.2, -45.238"),
            ("10.2,45.238W", "10.2, -45.238"),
            ("10.2N,45.238W", "10.2, -45.238"),
            ("-10.2,-45.238", "-10.2, -45.238"),
            ("-10.2, -45.238", "-10.2, -45.238"),
            ("10.2S,-45.238", "-10.2, -45.238"),
            ("-10.2,45.238W", "-10.2, -45.238"),
            ("10.2S,45.238W", "-10.2, -45.238"),
        ];
        for (input, expected) in cases {
            assert_eq!(parse(input)?, expected, "parsing {input:?}");
        }
        Ok(())
    }

    #[test]
    fn test_parse_tolerates_surrounding_text() -> Result<()> {
        assert_eq!(parse("  at 51.5 n  ,  0.12 w today")?, "51.5, -0.12");
        assert_eq!(parse("10. 20.")?, "10, 20");
        // no separator: the first number gives up digits to the second
        assert_eq!(parse("1045")?, "104, 5");
        assert_eq!(parse("10.2N")?, "10, 2");
        Ok(())
    }

    #[test]
    fn test_parse_rejects_text_without_two_numbers() {
        for input in ["", "north", "7", "-", "., .", "N, E"] {
            assert!(input.parse::<GpsLocation>().is_err(), "{input:?} should not parse");
        }
    }

    #[test]
    fn test_hemisphere_and_sign_forms_are_equal() -> Result<()> {
        let a: GpsLocation = "10.2S,45.238E".parse()?;
        let b: GpsLocation = "-10.2,45.238".parse()?;
        assert_eq!(a, b);
        assert_eq!(a.latitude_bytes(), b.latitude_bytes());
        assert_eq!(a.longitude_bytes(), b.longitude_bytes());
        assert_eq!(a.latitude_ref_bytes(), b.latitude_ref_bytes());

        let c: GpsLocation = "10.2S,45.238W".parse()?;
        let d: GpsLocation = "-10.2,-45.238".parse()?;
        assert_eq!(c, d);
        assert_eq!(c.longitude_bytes(), d.longitude_bytes());
        assert_eq!(c.longitude_ref_bytes(), WEST);
        Ok(())
    }

    #[test]
    fn test_wire_round_trip() -> Result<()> {
        for input in ["10.2S,45.238W", "51.477928, -0.001545", "0,0", "-89.999999, 179.999999"] {
            let location: GpsLocation = input.parse()?;
            let decoded = GpsLocation::from_bytes(
                &location.latitude_ref_bytes(),
                &location.latitude_bytes(),
                &location.longitude_ref_bytes(),
                &location.longitude_bytes(),
            )?;
            assert_eq!(decoded, location);
            assert!((decoded.latitude_f64() - location.latitude_f64()).abs() < 1e-9);
            assert!((decoded.longitude_f64() - location.longitude_f64()).abs() < 1e-9);
        }
        Ok(())
    }

    #[test]
    fn test_refs() -> Result<()> {
        let location: GpsLocation = "0, -0.5".parse()?;
        assert_eq!(location.latitude_ref(), 'N');
        assert_eq!(location.longitude_ref(), 'W');
        assert_eq!(location.latitude_ref_bytes(), NORTH);

        let from_text = GpsLocation::from_components(
            "S",
            location.longitude().components(),
            "e",
            location.longitude().components(),
        )?;
        assert_eq!(from_text.latitude_f64(), -0.5);
        assert_eq!(from_text.longitude_f64(), 0.5);
        Ok(())
    }
}
