//! Reading and writing the tagger's fields through `little_exif`
//!
//! Titles live in `ImageDescription`, authors in `Artist`, capture time in
//! `DateTimeOriginal` + `SubSecTimeOriginal` and locations in the four GPS
//! latitude/longitude tags. Every other tag in the file is preserved.

use crate::degrees::Fraction;
use crate::error::CodecError;
use crate::gps::GpsLocation;
use crate::metadata::{
    clean_exif_text, format_exif_datetime, non_blank, parse_exif_datetime, ContainerFormat, MetadataSnapshot,
    Orientation, PhotoFields,
};
use little_exif::exif_tag::ExifTag;
use little_exif::filetype::FileExtension;
use little_exif::metadata::Metadata;
use little_exif::rational::uR64;
use tracing::{debug, warn};

/// Reads and writes the editable metadata of an in-memory image file.
pub trait MetadataCodec: Send + Sync {
    /// Extract a snapshot. Width and height are left at zero; the caller knows
    /// the decoded dimensions. Files without a metadata block yield an empty
    /// snapshot rather than an error.
    fn read(&self, image: &[u8], format: ContainerFormat) -> Result<MetadataSnapshot, CodecError>;

    /// Rewrite `image` in place so it carries `fields` and return the snapshot
    /// now stored in it. Blank values remove their tags.
    fn write(
        &self,
        fields: &PhotoFields,
        image: &mut Vec<u8>,
        format: ContainerFormat,
    ) -> Result<MetadataSnapshot, CodecError>;
}

/// [`MetadataCodec`] backed by `little_exif`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExifCodec;

fn file_extension(format: ContainerFormat) -> FileExtension {
    match format {
        ContainerFormat::Jpeg => FileExtension::JPEG,
        ContainerFormat::Png => FileExtension::PNG { as_zTXt_chunk: true },
        ContainerFormat::Webp => FileExtension::WEBP,
        ContainerFormat::Tiff => FileExtension::TIFF,
    }
}

impl MetadataCodec for ExifCodec {
    fn read(&self, image: &[u8], format: ContainerFormat) -> Result<MetadataSnapshot, CodecError> {
        let exif = match Metadata::new_from_vec(&image.to_vec(), file_extension(format)) {
            Ok(exif) => exif,
            Err(e) => {
                debug!(%format, error = %e, "No readable EXIF block");
                return Ok(MetadataSnapshot::default());
            }
        };

        let taken = first_text(&exif, &ExifTag::DateTimeOriginal(String::new())).and_then(|value| {
            let subsec = first_text(&exif, &ExifTag::SubSecTimeOriginal(String::new()));
            parse_exif_datetime(&value, subsec.as_deref())
                .map_err(|e| warn!(error = %e, "Ignoring unreadable capture time"))
                .ok()
        });

        let orientation = first_orientation(&exif)
            .map(|code| {
                Orientation::from_exif(code).unwrap_or_else(|e| {
                    warn!(error = %e, "Treating image as upright");
                    Orientation::Normal
                })
            })
            .unwrap_or_default();

        Ok(MetadataSnapshot {
            title: first_text(&exif, &ExifTag::ImageDescription(String::new())).and_then(|t| clean_exif_text(&t)),
            author: first_text(&exif, &ExifTag::Artist(String::new())).and_then(|a| clean_exif_text(&a)),
            taken,
            location: read_location(&exif),
            orientation,
            width: 0,
            height: 0,
        })
    }

    fn write(
        &self,
        fields: &PhotoFields,
        image: &mut Vec<u8>,
        format: ContainerFormat,
    ) -> Result<MetadataSnapshot, CodecError> {
        let mut exif = Metadata::new_from_vec(image, file_extension(format)).unwrap_or_else(|e| {
            debug!(%format, error = %e, "Starting a fresh EXIF block");
            Metadata::new()
        });

        match non_blank(fields.title.as_deref()) {
            Some(title) => exif.set_tag(ExifTag::ImageDescription(title)),
            None => {
                exif.remove_tag(ExifTag::ImageDescription(String::new()));
            }
        }
        match non_blank(fields.author.as_deref()) {
            Some(author) => exif.set_tag(ExifTag::Artist(author)),
            None => {
                exif.remove_tag(ExifTag::Artist(String::new()));
            }
        }

        match &fields.taken {
            Some(taken) => {
                let (main, subsec) = format_exif_datetime(taken);
                exif.set_tag(ExifTag::DateTimeOriginal(main));
                match subsec {
                    Some(digits) => exif.set_tag(ExifTag::SubSecTimeOriginal(digits)),
                    None => {
                        exif.remove_tag(ExifTag::SubSecTimeOriginal(String::new()));
                    }
                }
            }
            None => {
                exif.remove_tag(ExifTag::DateTimeOriginal(String::new()));
                exif.remove_tag(ExifTag::SubSecTimeOriginal(String::new()));
            }
        }

        match &fields.location {
            Some(location) => {
                exif.set_tag(ExifTag::GPSLatitudeRef(location.latitude_ref().to_string()));
                exif.set_tag(ExifTag::GPSLatitude(to_exif_rationals(location.latitude().components())));
                exif.set_tag(ExifTag::GPSLongitudeRef(location.longitude_ref().to_string()));
                exif.set_tag(ExifTag::GPSLongitude(to_exif_rationals(location.longitude().components())));
            }
            None => {
                exif.remove_tag(ExifTag::GPSLatitudeRef(String::new()));
                exif.remove_tag(ExifTag::GPSLatitude(Vec::new()));
                exif.remove_tag(ExifTag::GPSLongitudeRef(String::new()));
                exif.remove_tag(ExifTag::GPSLongitude(Vec::new()));
            }
        }

        exif.write_to_vec(image, file_extension(format))
            .map_err(|source| CodecError::Write {
                format: format.name(),
                source,
            })?;

        let written = MetadataSnapshot {
            orientation: first_orientation(&exif)
                .and_then(|code| Orientation::from_exif(code).ok())
                .unwrap_or_default(),
            ..MetadataSnapshot::default()
        };
        Ok(written.with_fields(fields))
    }
}

fn first_text(exif: &Metadata, key: &ExifTag) -> Option<String> {
    exif.get_tag(key).find_map(|tag| match tag {
        ExifTag::ImageDescription(s)
        | ExifTag::Artist(s)
        | ExifTag::DateTimeOriginal(s)
        | ExifTag::SubSecTimeOriginal(s)
        | ExifTag::GPSLatitudeRef(s)
        | ExifTag::GPSLongitudeRef(s) => Some(s.clone()),
        _ => None,
    })
}

fn first_rationals(exif: &Metadata, key: &ExifTag) -> Option<[Fraction; 3]> {
    exif.get_tag(key).find_map(|tag| match tag {
        ExifTag::GPSLatitude(values) | ExifTag::GPSLongitude(values) if values.len() >= 3 => Some([
            Fraction::new(values[0].nominator, values[0].denominator),
            Fraction::new(values[1].nominator, values[1].denominator),
            Fraction::new(values[2].nominator, values[2].denominator),
        ]),
        _ => None,
    })
}

fn first_orientation(exif: &Metadata) -> Option<u16> {
    exif.get_tag(&ExifTag::Orientation(Vec::new())).find_map(|tag| match tag {
        ExifTag::Orientation(values) => values.first().copied(),
        _ => None,
    })
}

/// All four GPS tags must be present; a damaged triple drops the location.
fn read_location(exif: &Metadata) -> Option<GpsLocation> {
    let latitude_ref = first_text(exif, &ExifTag::GPSLatitudeRef(String::new()))?;
    let latitude = first_rationals(exif, &ExifTag::GPSLatitude(Vec::new()))?;
    let longitude_ref = first_text(exif, &ExifTag::GPSLongitudeRef(String::new()))?;
    let longitude = first_rationals(exif, &ExifTag::GPSLongitude(Vec::new()))?;

    GpsLocation::from_components(
        latitude_ref.trim_end_matches('\0'),
        latitude,
        longitude_ref.trim_end_matches('\0'),
        longitude,
    )
    .map_err(|e| warn!(error = %e, "Ignoring damaged GPS coordinates"))
    .ok()
}

fn to_exif_rationals(components: [Fraction; 3]) -> Vec<uR64> {
    components
        .into_iter()
        .map(|c| uR64 {
            nominator: c.numerator,
            denominator: c.denominator,
        })
        .collect()
}
