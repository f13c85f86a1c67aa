//! Error types for rational arithmetic, GPS parsing and metadata coding.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RationalError {
    #[error("value is not finite: {0}")]
    NotFinite(f64),
    #[error("invalid decimal number: {0:?}")]
    InvalidDecimal(String),
    #[error("denominator is zero")]
    ZeroDenominator,
    #[error("{0} does not fit in a 32-bit fraction")]
    Overflow(String),
    #[error("expected {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },
    #[error("component {index} has a zero denominator with numerator {numerator}")]
    ZeroComponentDenominator { index: usize, numerator: u32 },
    #[error("cannot parse GPS location from {0:?}")]
    InvalidLocation(String),
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unrecognised image container")]
    UnknownFormat,
    #[error("failed to write metadata into {format} data")]
    Write {
        format: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("invalid EXIF date {value:?}")]
    InvalidDate {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("unsupported orientation value {0}")]
    UnsupportedOrientation(u16),
    #[error(transparent)]
    Rational(#[from] RationalError),
}
