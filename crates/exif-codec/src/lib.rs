//! Exact-rational GPS coordinates and photo metadata coding for photo-tagger
//!
//! EXIF stores coordinates as three unsigned 32-bit fractions (degrees,
//! minutes, seconds). This crate keeps user-entered coordinates exact until the
//! last moment and then picks the closest fraction that fits, so saving a
//! location and reading it back never drifts.
//!
//! # Contents
//!
//! - **[`Rational`]**: arbitrary precision fractions with continued-fraction
//!   reduction under a `u32` bound
//! - **[`RationalDegrees`]**: degrees/minutes/seconds triples and their 24-byte wire form
//! - **[`GpsLocation`]**: free-form parsing, display and EXIF GPS byte blocks
//! - **[`MetadataCodec`]**: the title/author/date/location fields a photo
//!   tagger edits, read and written through `little_exif`

pub mod codec;
pub mod degrees;
pub mod error;
pub mod gps;
pub mod metadata;
pub mod rational;

pub use codec::{ExifCodec, MetadataCodec};
pub use degrees::{Fraction, RationalDegrees, DEGREES_WIRE_LEN};
pub use error::{CodecError, RationalError};
pub use gps::GpsLocation;
pub use metadata::{
    format_exif_datetime, parse_exif_datetime, ContainerFormat, MetadataSnapshot, Orientation, PhotoFields,
    EXIF_DATE_FORMAT,
};
pub use rational::Rational;
