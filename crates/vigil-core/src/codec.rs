//! Image payload decoding.
//!
//! Accepts raw image bytes, bare base64 text, or a data URI of the form
//! `data:image/<jpeg|png|webp>;base64,<data>`.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use image::{ImageFormat, ImageReader, Limits};
use std::io::Cursor;
use thiserror::Error;

use crate::types::PixelBuffer;

/// Ceiling on the payload as received (base64 text or raw bytes).
pub const MAX_ENCODED_BYTES: usize = 7 * 1024 * 1024;
/// Ceiling on the image file bytes after base64 decoding.
pub const MAX_DECODED_BYTES: usize = 5 * 1024 * 1024;
const MAX_IMAGE_SIDE: u32 = 8192;
const MAX_DECODER_ALLOC: u64 = 256 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("image payload is empty")]
    Empty,
    #[error("encoded payload too large: {0} bytes (limit {MAX_ENCODED_BYTES})")]
    EncodedTooLarge(usize),
    #[error("decoded payload too large: {0} bytes (limit {MAX_DECODED_BYTES})")]
    DecodedTooLarge(usize),
    #[error("malformed data URI header")]
    MalformedHeader,
    #[error("unsupported image type: {0}")]
    UnsupportedType(String),
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("unrecognized image container")]
    UnknownFormat,
    #[error("image read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
}

/// Decode an image payload into an RGB pixel buffer.
pub fn decode_payload(payload: &[u8]) -> Result<PixelBuffer, CodecError> {
    if payload.is_empty() {
        return Err(CodecError::Empty);
    }
    if payload.len() > MAX_ENCODED_BYTES {
        return Err(CodecError::EncodedTooLarge(payload.len()));
    }

    let bytes = if let Some(rest) = payload.strip_prefix(b"data:") {
        decode_data_uri(rest)?
    } else if looks_like_base64(payload) {
        decode_base64(payload)?
    } else {
        payload.to_vec()
    };

    if bytes.len() > MAX_DECODED_BYTES {
        return Err(CodecError::DecodedTooLarge(bytes.len()));
    }

    let mut reader = ImageReader::new(Cursor::new(bytes.as_slice())).with_guessed_format()?;
    let format = reader.format().ok_or(CodecError::UnknownFormat)?;
    if !matches!(format, ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::WebP) {
        return Err(CodecError::UnsupportedType(format!("{format:?}").to_lowercase()));
    }

    let mut limits = Limits::default();
    limits.max_image_width = Some(MAX_IMAGE_SIDE);
    limits.max_image_height = Some(MAX_IMAGE_SIDE);
    limits.max_alloc = Some(MAX_DECODER_ALLOC);
    reader.limits(limits);

    let decoded = reader.decode()?;
    tracing::debug!(
        width = decoded.width(),
        height = decoded.height(),
        format = ?format,
        "image payload decoded"
    );
    Ok(PixelBuffer::new(decoded.to_rgb8()))
}

/// Parse `image/<subtype>;base64,<data>` (the `data:` scheme already stripped).
fn decode_data_uri(rest: &[u8]) -> Result<Vec<u8>, CodecError> {
    let comma = rest
        .iter()
        .position(|&b| b == b',')
        .ok_or(CodecError::MalformedHeader)?;
    let header = std::str::from_utf8(&rest[..comma]).map_err(|_| CodecError::MalformedHeader)?;
    let mut parts = header.split(';');
    let mime = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
    if !parts.any(|p| p.trim().eq_ignore_ascii_case("base64")) {
        return Err(CodecError::MalformedHeader);
    }

    let (scheme, subtype) = mime.split_once('/').ok_or(CodecError::MalformedHeader)?;
    if scheme != "image" || !matches!(subtype, "jpeg" | "jpg" | "png" | "webp") {
        return Err(CodecError::UnsupportedType(mime));
    }

    decode_base64(&rest[comma + 1..])
}

fn looks_like_base64(payload: &[u8]) -> bool {
    payload
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'=') || b.is_ascii_whitespace())
}

fn decode_base64(text: &[u8]) -> Result<Vec<u8>, CodecError> {
    let compact: Vec<u8> = text
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    Ok(BASE64_STANDARD.decode(compact)?)
}
