//! Bitmap codec capability
//!
//! Decoding, scaling and canonical PNG encoding for icon payloads. Every
//! icon stored on disk is normalized through this module to a 16x16 RGBA
//! PNG, so the rest of the cache can compare files byte-for-byte and never
//! needs to care what format a site actually served.

use crate::error::ImageError;
use image::codecs::png::PngDecoder;
use image::imageops::{self, FilterType};
use image::{ImageDecoder, ImageFormat, RgbaImage};
use std::io::Cursor;

/// Edge length in pixels of a canonical icon bitmap.
pub const ICON_EDGE: u32 = 16;

/// Decode an image payload into an RGBA bitmap.
///
/// Tries the format declared by the `Content-Type` header first, then the
/// sniffed signature format, then a blind decode. Sites routinely serve
/// icons with a wrong or missing content type, so a declared-format failure
/// falls through instead of rejecting the payload.
pub fn decode(bytes: &[u8], content_type: Option<&str>) -> Result<RgbaImage, ImageError> {
  if bytes.is_empty() {
    return Err(ImageError::EmptyPayload);
  }

  let declared = format_from_content_type(content_type);
  let sniffed = image::guess_format(bytes).ok();
  let mut last_error: Option<image::ImageError> = None;

  if let Some(format) = declared {
    match image::load_from_memory_with_format(bytes, format) {
      Ok(img) => return Ok(img.to_rgba8()),
      Err(err) => last_error = Some(err),
    }
  }

  if let Some(format) = sniffed {
    if Some(format) != declared {
      match image::load_from_memory_with_format(bytes, format) {
        Ok(img) => return Ok(img.to_rgba8()),
        Err(err) => last_error = Some(err),
      }
    }
  }

  match image::load_from_memory(bytes) {
    Ok(img) => Ok(img.to_rgba8()),
    Err(err) => Err(ImageError::DecodeFailed {
      reason: last_error.unwrap_or(err).to_string(),
    }),
  }
}

/// Encode a bitmap as PNG bytes.
pub fn encode_png(img: &RgbaImage) -> Result<Vec<u8>, ImageError> {
  let mut cursor = Cursor::new(Vec::new());
  img
    .write_to(&mut cursor, ImageFormat::Png)
    .map_err(|err| ImageError::EncodeFailed {
      reason: err.to_string(),
    })?;
  Ok(cursor.into_inner())
}

/// Scale a bitmap to exactly `width` x `height`, returning the input
/// unchanged when it already has those dimensions.
pub fn scale(img: RgbaImage, width: u32, height: u32) -> RgbaImage {
  if img.width() == width && img.height() == height {
    return img;
  }
  imageops::resize(&img, width, height, FilterType::Lanczos3)
}

/// Normalize an arbitrary image payload to the canonical on-disk form:
/// a 16x16 RGBA PNG.
///
/// Canonicality is format plus dimensions, not byte identity; normalizing
/// an already-canonical payload re-encodes it but never changes what it
/// decodes to.
pub fn normalize(bytes: &[u8], content_type: Option<&str>) -> Result<Vec<u8>, ImageError> {
  let decoded = decode(bytes, content_type)?;
  encode_png(&scale(decoded, ICON_EDGE, ICON_EDGE))
}

/// Check whether stored bytes are already in the canonical form, without a
/// full decode: PNG signature and a 16x16 header.
pub fn is_canonical(bytes: &[u8]) -> bool {
  if !matches!(image::guess_format(bytes), Ok(ImageFormat::Png)) {
    return false;
  }
  PngDecoder::new(Cursor::new(bytes))
    .ok()
    .map(|d| d.dimensions())
    == Some((ICON_EDGE, ICON_EDGE))
}

/// Signature sniff: does this payload start like any known raster format?
pub fn looks_like_image(bytes: &[u8]) -> bool {
  image::guess_format(bytes).is_ok()
}

/// Acceptance check for fetched icon candidates: a declared `image/*`
/// content type or a recognizable signature.
pub fn sniff_ok(content_type: Option<&str>, bytes: &[u8]) -> bool {
  if bytes.is_empty() {
    return false;
  }
  let declared_image = content_type
    .map(|ct| ct.trim().to_ascii_lowercase().starts_with("image/"))
    .unwrap_or(false);
  declared_image || looks_like_image(bytes)
}

/// Run the acceptance check and normalize in one step.
///
/// This is the only path by which fetched payloads become stored icons: a
/// payload that fails [`sniff_ok`] is rejected as [`ImageError::NotAnImage`]
/// before any decode work, and nothing is mutated.
pub fn validate_and_normalize(
  content_type: Option<&str>,
  bytes: &[u8],
) -> Result<Vec<u8>, ImageError> {
  if !sniff_ok(content_type, bytes) {
    return Err(ImageError::NotAnImage);
  }
  normalize(bytes, content_type)
}

fn format_from_content_type(content_type: Option<&str>) -> Option<ImageFormat> {
  let mime = content_type?
    .split(';')
    .next()
    .map(|ct| ct.trim().to_ascii_lowercase())?;
  ImageFormat::from_mime_type(mime)
}
