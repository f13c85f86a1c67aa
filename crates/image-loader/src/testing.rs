//! Fixtures shared by the crate's tests

use crate::error::{ErrorReporter, LoadFailure, Operation};
use anyhow::Result;
use exif_codec::{ContainerFormat, ExifCodec, MetadataCodec, PhotoFields};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use little_exif::exif_tag::ExifTag;
use little_exif::filetype::FileExtension;
use little_exif::metadata::Metadata;
use parking_lot::Mutex;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

/// Remembers every failure it is handed.
#[derive(Default)]
pub(crate) struct CollectingReporter {
    failures: Mutex<Vec<(PathBuf, Operation, String)>>,
}

impl CollectingReporter {
    pub(crate) fn failures(&self) -> Vec<(PathBuf, Operation, String)> {
        self.failures.lock().clone()
    }
}

impl ErrorReporter for CollectingReporter {
    fn report(&self, failure: &LoadFailure<'_>) {
        self.failures
            .lock()
            .push((failure.path.to_path_buf(), failure.operation, failure.cause_chain()));
    }
}

pub(crate) fn jpeg_bytes(width: u32, height: u32) -> Result<Vec<u8>> {
    let pixels = RgbImage::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 128]));
    let mut out = Vec::new();
    DynamicImage::ImageRgb8(pixels).write_to(&mut Cursor::new(&mut out), ImageFormat::Jpeg)?;
    Ok(out)
}

/// Write a JPEG carrying `fields` and, optionally, an EXIF orientation code.
pub(crate) fn write_jpeg(
    path: &Path,
    width: u32,
    height: u32,
    orientation: Option<u16>,
    fields: &PhotoFields,
) -> Result<Vec<u8>> {
    let mut bytes = jpeg_bytes(width, height)?;
    if let Some(code) = orientation {
        let mut exif = Metadata::new();
        exif.set_tag(ExifTag::Orientation(vec![code]));
        exif.write_to_vec(&mut bytes, FileExtension::JPEG)?;
    }
    if *fields != PhotoFields::default() {
        ExifCodec.write(fields, &mut bytes, ContainerFormat::Jpeg)?;
    }
    fs::write(path, &bytes)?;
    Ok(bytes)
}
