// SPDX-License-Identifier: Apache-2.0
//! Image delivery types: channel identifiers and raw image payloads as
//! they travel on the wire.

use serde::{Deserialize, Serialize};

/// Named image output stream requested from the worker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RenderChannel {
    /// The beauty pass (sentinel channel, always present).
    Beauty,
    /// Z-depth.
    ZDepth,
    /// Raw (unclamped) color.
    RealColor,
    /// Surface normals.
    Normal,
    /// Per-object render IDs.
    RenderId,
}

/// Pixel format of one wire image payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ImageKind {
    /// Uncompressed RGBA, f32 per component.
    RgbaFloat,
    /// Uncompressed RGB, f32 per component. Delivered 4-wide and
    /// narrowed by the receiver.
    RgbFloat,
    /// Uncompressed single channel, f32. Delivered 4-wide and narrowed
    /// to the red component by the receiver.
    BwFloat,
    /// JPEG-compressed preview block.
    Jpeg,
}

impl ImageKind {
    /// Destination channel count implied by this kind, or `None` for
    /// compressed payloads whose decoder decides.
    pub fn channels(self) -> Option<u32> {
        match self {
            ImageKind::RgbaFloat => Some(4),
            ImageKind::RgbFloat => Some(3),
            ImageKind::BwFloat => Some(1),
            ImageKind::Jpeg => None,
        }
    }
}

/// Sub-rectangle covered by a partial-tile delivery.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageRegion {
    /// Left edge in destination pixels.
    pub x: u32,
    /// Top edge in destination pixels.
    pub y: u32,
    /// Tile width.
    pub width: u32,
    /// Tile height.
    pub height: u32,
}

/// One image payload as delivered by the worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttrImage {
    /// Pixel format of `data`.
    pub kind: ImageKind,
    /// Full image width (or tile width when `region` is set).
    pub width: u32,
    /// Full image height (or tile height when `region` is set).
    pub height: u32,
    /// Raw payload bytes. For uncompressed kinds this is
    /// `width * height * 4` little-endian f32s (always delivered
    /// 4-wide); for `Jpeg` it is the compressed stream.
    #[serde(with = "serde_bytes_vec")]
    pub data: Vec<u8>,
    /// Set when this is a partial tile into an existing buffer.
    pub region: Option<ImageRegion>,
}

impl AttrImage {
    /// Whether this payload is a partial tile rather than a full image.
    pub fn is_tile(&self) -> bool {
        self.region.is_some()
    }
}

/// Why an image set was delivered.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ImageSource {
    /// Incremental interactive update.
    Update,
    /// Final/production composite: authoritative and complete.
    Ready,
}

/// Ordered set of per-channel image deliveries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageSet {
    /// Delivery kind.
    pub source: ImageSource,
    /// Channel → payload entries, applied in order.
    pub images: Vec<(RenderChannel, AttrImage)>,
}

/// Serialize image payloads as CBOR byte strings instead of integer
/// arrays; pixel payloads dominate wire size.
mod serde_bytes_vec {
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(data)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        // ciborium maps CBOR byte strings to serde's bytes type.
        struct BytesVisitor;
        impl<'de> serde::de::Visitor<'de> for BytesVisitor {
            type Value = Vec<u8>;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a byte string")
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Vec<u8>, E> {
                Ok(v.to_vec())
            }

            fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<Vec<u8>, E> {
                Ok(v)
            }

            fn visit_seq<A: serde::de::SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> Result<Vec<u8>, A::Error> {
                let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(b) = seq.next_element::<u8>()? {
                    out.push(b);
                }
                Ok(out)
            }
        }
        d.deserialize_byte_buf(BytesVisitor)
    }
}
