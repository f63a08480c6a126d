// SPDX-License-Identifier: Apache-2.0
//! Decode adapter for JPEG preview blocks.
//!
//! The decoder returns a plain result value: a malformed or truncated
//! stream yields `None` (logged at warn), never an escape that could
//! unwind through the delivery thread.

use image::ImageFormat;
use tracing::warn;

/// A decoded preview block, always expanded to interleaved RGBA f32.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedImage {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Interleaved RGBA samples in `[0, 1]`.
    pub pixels: Vec<f32>,
}

/// Decode one JPEG payload into an RGBA float buffer.
///
/// Returns `None` on any decoder error; the caller treats that as
/// "no image update" and keeps its previous buffer.
pub fn decode_jpeg(data: &[u8]) -> Option<DecodedImage> {
    let dynamic = match image::load_from_memory_with_format(data, ImageFormat::Jpeg) {
        Ok(img) => img,
        Err(err) => {
            warn!(%err, "dropping malformed jpeg delivery");
            return None;
        }
    };
    let rgba = dynamic.to_rgba8();
    let (width, height) = rgba.dimensions();
    let pixels = rgba
        .into_raw()
        .into_iter()
        .map(|v| f32::from(v) / 255.0)
        .collect();
    Some(DecodedImage {
        width,
        height,
        pixels,
    })
}
