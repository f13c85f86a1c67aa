//! Photo metadata as the tagger sees it
//!
//! [`MetadataSnapshot`] is what was last read from (or written to) a file;
//! [`PhotoFields`] are the values a user can edit and a commit writes back.

use crate::error::CodecError;
use crate::gps::GpsLocation;
use chrono::{NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

/// `DateTimeOriginal` layout.
pub const EXIF_DATE_FORMAT: &str = "%Y:%m:%d %H:%M:%S";

/// Image container, detected from the leading bytes rather than the file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    Jpeg,
    Png,
    Webp,
    Tiff,
}

impl ContainerFormat {
    pub fn sniff(bytes: &[u8]) -> Result<Self, CodecError> {
        match bytes {
            [0xFF, 0xD8, 0xFF, ..] => Ok(Self::Jpeg),
            [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, ..] => Ok(Self::Png),
            [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Ok(Self::Webp),
            [b'I', b'I', 0x2A, 0x00, ..] | [b'M', b'M', 0x00, 0x2A, ..] => Ok(Self::Tiff),
            _ => Err(CodecError::UnknownFormat),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::Webp => "webp",
            Self::Tiff => "tiff",
        }
    }
}

impl std::fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for ContainerFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(Self::Jpeg),
            "png" => Ok(Self::Png),
            "webp" => Ok(Self::Webp),
            "tiff" | "tif" => Ok(Self::Tiff),
            _ => Err(format!("Invalid container format: {s}. Valid options: jpeg, png, webp, tiff")),
        }
    }
}

/// EXIF orientation, tag 274.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Orientation {
    #[default]
    Normal,
    FlipHorizontal,
    Rotate180,
    FlipVertical,
    /// Mirrored across the top-left to bottom-right diagonal.
    Transpose,
    Rotate90,
    /// Mirrored across the top-right to bottom-left diagonal.
    Transverse,
    Rotate270,
}

impl Orientation {
    pub fn from_exif(value: u16) -> Result<Self, CodecError> {
        Ok(match value {
            1 => Self::Normal,
            2 => Self::FlipHorizontal,
            3 => Self::Rotate180,
            4 => Self::FlipVertical,
            5 => Self::Transpose,
            6 => Self::Rotate90,
            7 => Self::Transverse,
            8 => Self::Rotate270,
            other => return Err(CodecError::UnsupportedOrientation(other)),
        })
    }

    pub fn to_exif(self) -> u16 {
        match self {
            Self::Normal => 1,
            Self::FlipHorizontal => 2,
            Self::Rotate180 => 3,
            Self::FlipVertical => 4,
            Self::Transpose => 5,
            Self::Rotate90 => 6,
            Self::Transverse => 7,
            Self::Rotate270 => 8,
        }
    }

    /// Whether displaying the image swaps its width and height.
    pub fn swaps_dimensions(self) -> bool {
        matches!(self, Self::Transpose | Self::Rotate90 | Self::Transverse | Self::Rotate270)
    }
}

/// Metadata as last loaded from the backing file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataSnapshot {
    pub title: Option<String>,
    pub author: Option<String>,
    pub taken: Option<NaiveDateTime>,
    pub location: Option<GpsLocation>,
    pub orientation: Orientation,
    pub width: u32,
    pub height: u32,
}

impl MetadataSnapshot {
    /// The editable subset of this snapshot.
    pub fn fields(&self) -> PhotoFields {
        PhotoFields {
            title: self.title.clone(),
            author: self.author.clone(),
            taken: self.taken,
            location: self.location,
        }
    }

    /// A copy with the editable values replaced by `fields`.
    pub fn with_fields(&self, fields: &PhotoFields) -> Self {
        Self {
            title: non_blank(fields.title.as_deref()),
            author: non_blank(fields.author.as_deref()),
            taken: fields.taken,
            location: fields.location,
            ..self.clone()
        }
    }
}

/// Values a user can edit and a commit writes back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhotoFields {
    pub title: Option<String>,
    pub author: Option<String>,
    pub taken: Option<NaiveDateTime>,
    pub location: Option<GpsLocation>,
}

impl PhotoFields {
    /// Whether these values would change the file. Missing and empty text are
    /// the same thing.
    pub fn differs_from(&self, baseline: &MetadataSnapshot) -> bool {
        !same_text(self.title.as_deref(), baseline.title.as_deref())
            || !same_text(self.author.as_deref(), baseline.author.as_deref())
            || self.taken != baseline.taken
            || self.location != baseline.location
    }
}

fn same_text(a: Option<&str>, b: Option<&str>) -> bool {
    non_blank(a) == non_blank(b)
}

/// `None` for missing or whitespace-only text.
pub fn non_blank(text: Option<&str>) -> Option<String> {
    text.filter(|t| !t.trim().is_empty()).map(str::to_string)
}

/// Strip the NUL padding and surrounding whitespace EXIF strings often carry.
pub fn clean_exif_text(raw: &str) -> Option<String> {
    non_blank(Some(raw.trim_end_matches('\0').trim()))
}

/// Parse `DateTimeOriginal`, adding the `SubSecTimeOriginal` digits if present.
pub fn parse_exif_datetime(value: &str, subsec: Option<&str>) -> Result<NaiveDateTime, CodecError> {
    let value = value.trim_end_matches('\0').trim();
    let mut taken = NaiveDateTime::parse_from_str(value, EXIF_DATE_FORMAT).map_err(|source| {
        CodecError::InvalidDate {
            value: value.to_string(),
            source,
        }
    })?;

    if let Some(digits) = subsec.map(|s| s.trim_end_matches('\0').trim()) {
        if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            // scale "123" to 123_000_000 ns, ignoring anything past nanoseconds
            let padded: String = digits.chars().chain(std::iter::repeat('0')).take(9).collect();
            if let Some(with_nanos) = padded.parse().ok().and_then(|nanos| taken.with_nanosecond(nanos)) {
                taken = with_nanos;
            }
        }
    }
    Ok(taken)
}

/// Format a capture time as `DateTimeOriginal` plus optional `SubSecTimeOriginal`.
pub fn format_exif_datetime(taken: &NaiveDateTime) -> (String, Option<String>) {
    let main = taken.format(EXIF_DATE_FORMAT).to_string();
    let nanos = taken.nanosecond() % 1_000_000_000;
    let subsec = if nanos == 0 {
        None
    } else {
        Some(format!("{nanos:09}").trim_end_matches('0').to_string())
    };
    (main, subsec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32, nanos: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2021, 7, 14)
            .unwrap()
            .and_hms_nano_opt(h, m, s, nanos)
            .unwrap()
    }

    #[test]
    fn test_sniff_container() -> Result<()> {
        assert_eq!(ContainerFormat::sniff(&[0xFF, 0xD8, 0xFF, 0xE1, 0, 0])?, ContainerFormat::Jpeg);
        assert_eq!(
            ContainerFormat::sniff(b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR")?,
            ContainerFormat::Png
        );
        assert_eq!(ContainerFormat::sniff(b"RIFF\x10\0\0\0WEBPVP8 ")?, ContainerFormat::Webp);
        assert_eq!(ContainerFormat::sniff(b"II*\0\x08\0\0\0")?, ContainerFormat::Tiff);
        assert!(ContainerFormat::sniff(b"GIF89a").is_err());
        assert!(ContainerFormat::sniff(&[]).is_err());
        Ok(())
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("JPG".parse::<ContainerFormat>().unwrap(), ContainerFormat::Jpeg);
        assert_eq!("png".parse::<ContainerFormat>().unwrap(), ContainerFormat::Png);
        assert!("bmp".parse::<ContainerFormat>().is_err());
    }

    #[test]
    fn test_orientation_codes() -> Result<()> {
        for code in 1..=8u16 {
            assert_eq!(Orientation::from_exif(code)?.to_exif(), code);
        }
        assert!(Orientation::from_exif(0).is_err());
        assert!(Orientation::from_exif(9).is_err());
        assert!(Orientation::Rotate90.swaps_dimensions());
        assert!(!Orientation::Rotate180.swaps_dimensions());
        Ok(())
    }

    #[test]
    fn test_exif_datetime_round_trip() -> Result<()> {
        let plain = at(9, 5, 7, 0);
        let (text, subsec) = format_exif_datetime(&plain);
        assert_eq!(text, "2021:07:14 09:05:07");
        assert_eq!(subsec, None);
        assert_eq!(parse_exif_datetime(&text, None)?, plain);

        let precise = at(9, 5, 7, 120_000_000);
        let (text, subsec) = format_exif_datetime(&precise);
        assert_eq!(subsec.as_deref(), Some("12"));
        assert_eq!(parse_exif_datetime(&text, subsec.as_deref())?, precise);
        Ok(())
    }

    #[test]
    fn test_parse_exif_datetime_tolerates_padding() -> Result<()> {
        let taken = parse_exif_datetime("2021:07:14 09:05:07\0", Some("5\0"))?;
        assert_eq!(taken, at(9, 5, 7, 500_000_000));
        // junk subseconds are ignored rather than failing the date
        assert_eq!(parse_exif_datetime("2021:07:14 09:05:07", Some("ab"))?, at(9, 5, 7, 0));
        assert!(parse_exif_datetime("2021-07-14 09:05:07", None).is_err());
        assert!(parse_exif_datetime("    :  :     :  :  ", None).is_err());
        Ok(())
    }

    #[test]
    fn test_fields_compare_blank_as_missing() {
        let baseline = MetadataSnapshot {
            title: None,
            author: Some("Ann".to_string()),
            ..Default::default()
        };
        let mut fields = baseline.fields();
        assert!(!fields.differs_from(&baseline));

        fields.title = Some(String::new());
        assert!(!fields.differs_from(&baseline));
        fields.title = Some("   ".to_string());
        assert!(!fields.differs_from(&baseline));

        fields.title = Some("Harbour".to_string());
        assert!(fields.differs_from(&baseline));

        fields.title = None;
        fields.taken = Some(at(1, 2, 3, 0));
        assert!(fields.differs_from(&baseline));
    }

    #[test]
    fn test_with_fields_keeps_image_properties() {
        let baseline = MetadataSnapshot {
            orientation: Orientation::Rotate90,
            width: 640,
            height: 480,
            ..Default::default()
        };
        let fields = PhotoFields {
            title: Some("  ".to_string()),
            author: Some("Ann".to_string()),
            ..Default::default()
        };
        let updated = baseline.with_fields(&fields);
        assert_eq!(updated.title, None);
        assert_eq!(updated.author.as_deref(), Some("Ann"));
        assert_eq!(updated.orientation, Orientation::Rotate90);
        assert_eq!((updated.width, updated.height), (640, 480));
    }

    #[test]
    fn test_clean_exif_text() {
        assert_eq!(clean_exif_text("  Harbour at dusk \0\0").as_deref(), Some("Harbour at dusk"));
        assert_eq!(clean_exif_text("\0"), None);
    }
}
