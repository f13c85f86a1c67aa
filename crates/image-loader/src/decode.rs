//! Pixel decoding: dimensions, thumbnails, display-sized full images and
//! container transcoding
//!
//! All sizes handed to callers are in display orientation, i.e. after the EXIF
//! orientation has been applied.

use crate::error::LoadError;
use exif_codec::{ContainerFormat, Orientation};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, GrayImage, ImageFormat, ImageReader, RgbImage};
use jpeg_decoder::PixelFormat;
use std::io::{BufRead, Cursor, Read, Seek, SeekFrom};
use std::path::Path;
use tracing::debug;

pub fn image_format(format: ContainerFormat) -> ImageFormat {
    match format {
        ContainerFormat::Jpeg => ImageFormat::Jpeg,
        ContainerFormat::Png => ImageFormat::Png,
        ContainerFormat::Webp => ImageFormat::WebP,
        ContainerFormat::Tiff => ImageFormat::Tiff,
    }
}

/// Stored pixel dimensions, read from the header without decoding pixels.
pub fn read_dimensions<R: BufRead + Seek>(
    reader: R,
    format: ContainerFormat,
    path: &Path,
) -> Result<(u32, u32), LoadError> {
    ImageReader::with_format(reader, image_format(format))
        .into_dimensions()
        .map_err(|source| LoadError::Decode {
            path: path.to_path_buf(),
            source,
        })
}

/// Swap width and height for orientations that turn the image on its side.
pub fn oriented_dimensions(width: u32, height: u32, orientation: Orientation) -> (u32, u32) {
    if orientation.swaps_dimensions() {
        (height, width)
    } else {
        (width, height)
    }
}

/// Thumbnail size for an image of `width`x`height` (display orientation).
///
/// Anything wider than 2:3 is fitted to a width of `3 * target_height / 2`,
/// narrower portraits to `target_height`. Never upscales.
pub fn thumbnail_size(width: u32, height: u32, target_height: u32) -> (u32, u32) {
    if width == 0 || height == 0 || target_height == 0 {
        return (width, height);
    }
    let (w, h, t) = (width as u64, height as u64, target_height as u64);
    let (tw, th) = if 3 * w > 2 * h {
        let tw = 3 * t / 2;
        (tw, h * tw / w)
    } else {
        (w * t / h, t)
    };
    if tw >= w || th >= h {
        return (width, height);
    }
    (tw.max(1) as u32, th.max(1) as u32)
}

/// Largest size with the image's aspect ratio that fits `max_width`x`max_height`.
pub fn display_size(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    if width <= max_width && height <= max_height || width == 0 || height == 0 {
        return (width, height);
    }
    let (w, h, mw, mh) = (width as u64, height as u64, max_width as u64, max_height as u64);
    if w * mh > h * mw {
        (max_width, (h * mw / w).max(1) as u32)
    } else {
        ((w * mh / h).max(1) as u32, max_height)
    }
}

/// Rotate and mirror stored pixels into display orientation.
pub fn apply_orientation(img: DynamicImage, orientation: Orientation) -> DynamicImage {
    match orientation {
        Orientation::Normal => img,
        Orientation::FlipHorizontal => img.fliph(),
        Orientation::Rotate180 => img.rotate180(),
        Orientation::FlipVertical => img.flipv(),
        Orientation::Transpose => img.rotate90().fliph(),
        Orientation::Rotate90 => img.rotate90(),
        Orientation::Transverse => img.rotate270().fliph(),
        Orientation::Rotate270 => img.rotate270(),
    }
}

fn decode<R: BufRead + Seek>(reader: R, format: ContainerFormat, path: &Path) -> Result<DynamicImage, LoadError> {
    ImageReader::with_format(reader, image_format(format))
        .decode()
        .map_err(|source| LoadError::Decode {
            path: path.to_path_buf(),
            source,
        })
}

/// Resize stored pixels so that, once oriented, they measure `target`.
/// `None` selects the fast thumbnail filter.
fn resize_for(img: DynamicImage, target: (u32, u32), orientation: Orientation, filter: Option<FilterType>) -> DynamicImage {
    let (w, h) = oriented_dimensions(target.0, target.1, orientation);
    if img.dimensions() == (w, h) {
        return img;
    }
    match filter {
        Some(filter) => img.resize_exact(w, h, filter),
        None => img.thumbnail_exact(w, h),
    }
}

/// Decode a thumbnail `target_height` pixels tall (or 3:2 wide), oriented.
/// JPEGs are decoded at a reduced DCT scale when that is supported.
pub fn decode_thumbnail<R: BufRead + Seek>(
    mut reader: R,
    format: ContainerFormat,
    orientation: Orientation,
    target_height: u32,
    path: &Path,
) -> Result<DynamicImage, LoadError> {
    let scaled = match format {
        ContainerFormat::Jpeg => {
            let start = reader.stream_position().map_err(|e| LoadError::io("seek", path, e))?;
            let scaled = decode_jpeg_scaled(&mut reader, orientation, target_height);
            if scaled.is_none() {
                debug!(path = %path.display(), "Scaled JPEG decode unavailable, decoding in full");
                reader
                    .seek(SeekFrom::Start(start))
                    .map_err(|e| LoadError::io("seek", path, e))?;
            }
            scaled
        }
        _ => None,
    };
    let img = match scaled {
        Some(img) => img,
        None => decode(reader, format, path)?,
    };
    let (width, height) = img.dimensions();
    let (ow, oh) = oriented_dimensions(width, height, orientation);
    let target = thumbnail_size(ow, oh, target_height);
    let img = resize_for(img, target, orientation, None);
    Ok(apply_orientation(img, orientation))
}

/// Decode a JPEG no smaller than its thumbnail and up to eight times smaller
/// than stored. `None` for pixel formats other than RGB and 8-bit grey, and
/// for anything the decoder rejects; the full decoder then reports the error.
fn decode_jpeg_scaled<R: Read>(reader: R, orientation: Orientation, target_height: u32) -> Option<DynamicImage> {
    let mut decoder = jpeg_decoder::Decoder::new(reader);
    decoder.read_info().ok()?;
    let info = decoder.info()?;
    let (ow, oh) = oriented_dimensions(u32::from(info.width), u32::from(info.height), orientation);
    let (tw, th) = thumbnail_size(ow, oh, target_height);
    let (sw, sh) = oriented_dimensions(tw, th, orientation);
    let requested = (u16::try_from(sw).ok()?.max(1), u16::try_from(sh).ok()?.max(1));
    let (width, height) = decoder.scale(requested.0, requested.1).ok()?;
    let pixels = decoder.decode().ok()?;
    let (width, height) = (u32::from(width), u32::from(height));
    match info.pixel_format {
        PixelFormat::RGB24 => RgbImage::from_raw(width, height, pixels).map(DynamicImage::ImageRgb8),
        PixelFormat::L8 => GrayImage::from_raw(width, height, pixels).map(DynamicImage::ImageLuma8),
        _ => None,
    }
}

/// Decode the full image, downsampled to fit `limit` when one is given.
pub fn decode_full<R: BufRead + Seek>(
    reader: R,
    format: ContainerFormat,
    orientation: Orientation,
    limit: Option<(u32, u32)>,
    path: &Path,
) -> Result<DynamicImage, LoadError> {
    let img = decode(reader, format, path)?;
    let img = match limit {
        Some((max_width, max_height)) => {
            let (width, height) = img.dimensions();
            let (ow, oh) = oriented_dimensions(width, height, orientation);
            let target = display_size(ow, oh, max_width, max_height);
            resize_for(img, target, orientation, Some(FilterType::Lanczos3))
        }
        None => img,
    };
    Ok(apply_orientation(img, orientation))
}

/// Re-encode `bytes` from one container to another. The result carries no
/// metadata, so `orientation` is baked into the pixels.
pub fn transcode(
    bytes: &[u8],
    from: ContainerFormat,
    to: ContainerFormat,
    orientation: Orientation,
    path: &Path,
) -> Result<Vec<u8>, LoadError> {
    let img = apply_orientation(decode(Cursor::new(bytes), from, path)?, orientation);
    // JPEG has no alpha channel
    let img = match to {
        ContainerFormat::Jpeg if img.color().has_alpha() => DynamicImage::ImageRgb8(img.to_rgb8()),
        _ => img,
    };

    let mut out = Vec::new();
    img.write_to(&mut Cursor::new(&mut out), image_format(to))
        .map_err(|source| LoadError::Encode {
            path: path.to_path_buf(),
            format: to.name(),
            source,
        })?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use image::{Rgb, RgbImage};

    fn encoded(width: u32, height: u32, format: ImageFormat) -> Result<Vec<u8>> {
        let img = RgbImage::from_fn(width, height, |x, _| if x == 0 { Rgb([255, 0, 0]) } else { Rgb([0, 0, 255]) });
        let mut out = Vec::new();
        DynamicImage::ImageRgb8(img).write_to(&mut Cursor::new(&mut out), format)?;
        Ok(out)
    }

    #[test]
    fn test_thumbnail_size_rules() {
        // landscape: width fixed at 72
        assert_eq!(thumbnail_size(4000, 3000, 48), (72, 54));
        assert_eq!(thumbnail_size(6000, 2000, 48), (72, 24));
        assert_eq!(thumbnail_size(300, 200, 48), (72, 48));
        // 3:4 portrait is still wider than 2:3
        assert_eq!(thumbnail_size(3000, 4000, 48), (72, 96));
        // exactly 2:3 and narrower use the height
        assert_eq!(thumbnail_size(2000, 3000, 48), (32, 48));
        assert_eq!(thumbnail_size(2000, 4000, 48), (24, 48));
        // never upscale
        assert_eq!(thumbnail_size(40, 30, 48), (40, 30));
    }

    #[test]
    fn test_display_size_clamps_by_aspect() {
        assert_eq!(display_size(1000, 500, 1920, 1080), (1000, 500));
        assert_eq!(display_size(3840, 1080, 1920, 1080), (1920, 540));
        assert_eq!(display_size(2000, 4000, 1920, 1080), (540, 1080));
        assert_eq!(display_size(3840, 2160, 1920, 1080), (1920, 1080));
    }

    #[test]
    fn test_orientation_moves_pixels() {
        // red column on the left of a 2x1 image
        let img = DynamicImage::ImageRgb8(RgbImage::from_fn(2, 1, |x, _| {
            if x == 0 { Rgb([255, 0, 0]) } else { Rgb([0, 0, 255]) }
        }));
        let red = |img: &DynamicImage, x: u32, y: u32| img.to_rgb8().get_pixel(x, y).0 == [255, 0, 0];

        let rotated = apply_orientation(img.clone(), Orientation::Rotate90);
        assert_eq!(rotated.dimensions(), (1, 2));
        assert!(red(&rotated, 0, 0));

        let transpose = apply_orientation(img.clone(), Orientation::Transpose);
        assert_eq!(transpose.dimensions(), (1, 2));
        assert!(red(&transpose, 0, 0));

        let transverse = apply_orientation(img.clone(), Orientation::Transverse);
        assert!(red(&transverse, 0, 1));

        let mirrored = apply_orientation(img, Orientation::FlipHorizontal);
        assert!(red(&mirrored, 1, 0));
    }

    #[test]
    fn test_decode_thumbnail_and_full() -> Result<()> {
        let png = encoded(300, 200, ImageFormat::Png)?;
        let path = Path::new("/photos/a.png");
        assert_eq!(read_dimensions(Cursor::new(&png[..]), ContainerFormat::Png, path)?, (300, 200));

        let thumb = decode_thumbnail(Cursor::new(&png[..]), ContainerFormat::Png, Orientation::Normal, 48, path)?;
        assert_eq!(thumb.dimensions(), (72, 48));

        let sideways = decode_thumbnail(Cursor::new(&png[..]), ContainerFormat::Png, Orientation::Rotate90, 48, path)?;
        assert_eq!(sideways.dimensions(), (32, 48));

        let full = decode_full(Cursor::new(&png[..]), ContainerFormat::Png, Orientation::Normal, Some((150, 150)), path)?;
        assert_eq!(full.dimensions(), (150, 100));

        let native = decode_full(Cursor::new(&png[..]), ContainerFormat::Png, Orientation::Rotate270, None, path)?;
        assert_eq!(native.dimensions(), (200, 300));
        Ok(())
    }

    #[test]
    fn test_jpeg_thumbnail_decodes_at_reduced_scale() -> Result<()> {
        let jpeg = crate::testing::jpeg_bytes(1600, 1200)?;
        let path = Path::new("/photos/a.jpg");

        let reduced = decode_jpeg_scaled(Cursor::new(&jpeg[..]), Orientation::Normal, 48)
            .ok_or_else(|| anyhow::anyhow!("scaled decode unavailable"))?;
        assert_eq!(reduced.dimensions(), (200, 150));

        let thumb = decode_thumbnail(Cursor::new(&jpeg[..]), ContainerFormat::Jpeg, Orientation::Normal, 48, path)?;
        assert_eq!(thumb.dimensions(), (72, 54));
        let sideways = decode_thumbnail(Cursor::new(&jpeg[..]), ContainerFormat::Jpeg, Orientation::Rotate90, 48, path)?;
        assert_eq!(sideways.dimensions(), (72, 96));

        // a truncated file falls back to the full decoder for the error
        let err = decode_thumbnail(Cursor::new(&jpeg[..64]), ContainerFormat::Jpeg, Orientation::Normal, 48, path)
            .unwrap_err();
        assert!(matches!(err, LoadError::Decode { .. }));
        Ok(())
    }

    #[test]
    fn test_decode_garbage_names_path() {
        let err = decode_full(
            Cursor::new(&b"\xFF\xD8\xFFnot really a jpeg"[..]),
            ContainerFormat::Jpeg,
            Orientation::Normal,
            None,
            Path::new("/photos/broken.jpg"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("/photos/broken.jpg"));
    }

    #[test]
    fn test_transcode_png_to_jpeg() -> Result<()> {
        let png = encoded(16, 8, ImageFormat::Png)?;
        let path = Path::new("/photos/a.png");
        let jpeg = transcode(&png, ContainerFormat::Png, ContainerFormat::Jpeg, Orientation::Normal, path)?;
        assert_eq!(ContainerFormat::sniff(&jpeg)?, ContainerFormat::Jpeg);
        assert_eq!(image::load_from_memory(&jpeg)?.dimensions(), (16, 8));

        let upright = transcode(&png, ContainerFormat::Png, ContainerFormat::Png, Orientation::Rotate90, path)?;
        assert_eq!(image::load_from_memory(&upright)?.dimensions(), (8, 16));
        Ok(())
    }
}
