// SPDX-License-Identifier: Apache-2.0
//! Per-session channel store: merges worker image deliveries into owned
//! per-channel buffers under one shared lock.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use prism_proto::{AttrImage, ImageKind, ImageSet, ImageSource, RenderChannel};
use tracing::warn;

use crate::buffer::RenderImage;
use crate::decode;

/// Result flags of applying one delivery, used by the session to fire its
/// image callbacks outside the store lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// At least one channel buffer changed.
    pub updated: bool,
    /// The delivery was a final/production composite.
    pub ready: bool,
}

/// Mapping from channel to reconstructed image, one per session.
///
/// Writers (the connection's delivery thread) mutate entries in place;
/// readers get deep copies. Both serialize through one internal lock.
#[derive(Debug, Default)]
pub struct ChannelStore {
    images: Mutex<HashMap<RenderChannel, RenderImage>>,
}

impl ChannelStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RenderChannel, RenderImage>> {
        self.images.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply one inbound image delivery.
    ///
    /// Per entry, depending on the declared kind:
    /// * partial uncompressed tile — merged into an existing 4-channel
    ///   buffer; skipped with a warning when no buffer exists or the
    ///   channel count differs. Never normalized, even on final sets.
    /// * JPEG block — decoded and swapped in wholesale; a failed decode
    ///   leaves the previous buffer untouched.
    /// * full uncompressed — always reallocates and replaces, narrowing
    ///   the 4-wide source to the kind's channel count (RGB drops alpha,
    ///   BW keeps red). Full deliveries are authoritative resets.
    ///
    /// Full replaces in a final (`ImageSource::Ready`) set are normalized
    /// to consumer conventions: flipped vertically, alpha forced opaque,
    /// samples clamped to `[0, 1]`.
    pub fn apply(&self, set: &ImageSet) -> ApplyOutcome {
        let finalize = set.source == ImageSource::Ready;
        let mut updated = false;
        for (channel, img) in &set.images {
            updated |= self.apply_one(*channel, img, finalize);
        }
        ApplyOutcome {
            updated,
            ready: finalize,
        }
    }

    fn apply_one(&self, channel: RenderChannel, img: &AttrImage, finalize: bool) -> bool {
        match img.kind {
            ImageKind::Jpeg => self.replace_with_jpeg(channel, img, finalize),
            _ if img.is_tile() => self.merge_tile(channel, img),
            _ => self.replace_full(channel, img, finalize),
        }
    }

    fn merge_tile(&self, channel: RenderChannel, img: &AttrImage) -> bool {
        let Some(tile) = floats_from_le(&img.data) else {
            warn!(?channel, "tile payload is not a float buffer, skipping merge");
            return false;
        };
        let Some(region) = img.region else {
            return false;
        };
        let mut images = self.lock();
        let Some(dest) = images.get_mut(&channel).filter(|d| !d.is_empty()) else {
            warn!(?channel, "result image not allocated, can't merge tile");
            return false;
        };
        if dest.channels != 4 {
            warn!(
                ?channel,
                have = dest.channels,
                want = 4u32,
                "channel count mismatch, skipping tile merge"
            );
            return false;
        }
        if !dest.blit_region(&tile, region.x, region.y, region.width, region.height) {
            warn!(?channel, ?region, "tile does not fit destination, skipping merge");
            return false;
        }
        true
    }

    fn replace_with_jpeg(&self, channel: RenderChannel, img: &AttrImage, finalize: bool) -> bool {
        // Decode outside the lock; only the swap needs serialization.
        let Some(decoded) = decode::decode_jpeg(&img.data) else {
            return false;
        };
        let mut replacement = RenderImage {
            width: decoded.width,
            height: decoded.height,
            channels: 4,
            pixels: decoded.pixels,
        };
        if finalize {
            normalize(&mut replacement);
        }
        self.lock().insert(channel, replacement);
        true
    }

    fn replace_full(&self, channel: RenderChannel, img: &AttrImage, finalize: bool) -> bool {
        let Some(channels) = img.kind.channels() else {
            return false;
        };
        let Some(src) = floats_from_le(&img.data) else {
            warn!(?channel, "image payload is not a float buffer, dropping");
            return false;
        };
        // Widen before multiplying: width and height come straight off the
        // wire. Uncompressed sources always arrive 4-wide.
        let pixel_count = u64::from(img.width) * u64::from(img.height);
        if pixel_count.checked_mul(4) != Some(src.len() as u64) {
            warn!(
                ?channel,
                width = img.width,
                height = img.height,
                got = src.len(),
                "image payload size mismatch, dropping"
            );
            return false;
        }
        let pixel_count = pixel_count as usize;
        let pixels: Vec<f32> = match channels {
            4 => src,
            n => {
                let n = n as usize;
                let mut out = Vec::with_capacity(pixel_count * n);
                for px in src.chunks_exact(4) {
                    out.extend_from_slice(&px[..n]);
                }
                out
            }
        };
        let mut replacement = RenderImage {
            width: img.width,
            height: img.height,
            channels,
            pixels,
        };
        if finalize {
            normalize(&mut replacement);
        }
        self.lock().insert(channel, replacement);
        true
    }

    /// Deep-copy the buffer for `channel`, if it has been populated.
    ///
    /// The copy runs under the store lock, so a delivery racing this read
    /// waits until the copy finishes.
    pub fn get(&self, channel: RenderChannel) -> Option<RenderImage> {
        self.lock()
            .get(&channel)
            .filter(|img| !img.is_empty())
            .cloned()
    }

    /// Pre-allocate a zero-filled RGBA buffer for `channel` unless a
    /// populated buffer already exists. Idempotent; used before a resize
    /// so readers never observe a stale-size buffer.
    pub fn ensure_allocated(&self, channel: RenderChannel, width: u32, height: u32) {
        let mut images = self.lock();
        let entry = images.entry(channel).or_default();
        if entry.is_empty() {
            *entry = RenderImage::zeroed(width, height, 4);
        }
    }
}

/// Normalize a final delivery to consumer conventions.
fn normalize(img: &mut RenderImage) {
    img.flip_vertical();
    img.reset_alpha();
    img.clamp(0.0, 1.0);
}

fn floats_from_le(data: &[u8]) -> Option<Vec<f32>> {
    if data.len() % 4 != 0 {
        return None;
    }
    Some(
        data.chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_proto::ImageRegion;

    fn bytes_of(samples: &[f32]) -> Vec<u8> {
        samples.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn full_rgba(width: u32, height: u32, samples: &[f32]) -> AttrImage {
        AttrImage {
            kind: ImageKind::RgbaFloat,
            width,
            height,
            data: bytes_of(samples),
            region: None,
        }
    }

    fn update_set(channel: RenderChannel, img: AttrImage) -> ImageSet {
        ImageSet {
            source: ImageSource::Update,
            images: vec![(channel, img)],
        }
    }

    /// 4×4 RGBA image where every component of pixel i equals i.
    fn ramp_4x4() -> Vec<f32> {
        (0..16).flat_map(|i| [i as f32; 4]).collect()
    }

    #[test]
    fn tile_merge_touches_only_covered_pixels() {
        let store = ChannelStore::new();
        let base = ramp_4x4();
        let outcome = store.apply(&update_set(
            RenderChannel::Beauty,
            full_rgba(4, 4, &base),
        ));
        assert!(outcome.updated);
        assert!(!outcome.ready);

        let tile: Vec<f32> = (0..4).flat_map(|i| [100.0 + i as f32; 4]).collect();
        store.apply(&update_set(
            RenderChannel::Beauty,
            AttrImage {
                kind: ImageKind::RgbaFloat,
                width: 2,
                height: 2,
                data: bytes_of(&tile),
                region: Some(ImageRegion {
                    x: 1,
                    y: 1,
                    width: 2,
                    height: 2,
                }),
            },
        ));

        let img = store.get(RenderChannel::Beauty).unwrap();
        for py in 0..4u32 {
            for px in 0..4u32 {
                let sample = img.pixels[((py * 4 + px) * 4) as usize];
                let covered = (1..3).contains(&px) && (1..3).contains(&py);
                if covered {
                    let t = (py - 1) * 2 + (px - 1);
                    assert_eq!(sample, 100.0 + t as f32, "covered pixel ({px},{py})");
                } else {
                    assert_eq!(sample, (py * 4 + px) as f32, "border pixel ({px},{py})");
                }
            }
        }
    }

    #[test]
    fn tile_without_buffer_is_skipped() {
        let store = ChannelStore::new();
        let tile = vec![1.0f32; 2 * 2 * 4];
        let outcome = store.apply(&update_set(
            RenderChannel::Beauty,
            AttrImage {
                kind: ImageKind::RgbaFloat,
                width: 2,
                height: 2,
                data: bytes_of(&tile),
                region: Some(ImageRegion {
                    x: 0,
                    y: 0,
                    width: 2,
                    height: 2,
                }),
            },
        ));
        assert!(!outcome.updated);
        assert!(store.get(RenderChannel::Beauty).is_none());
    }

    #[test]
    fn tile_into_narrowed_buffer_is_skipped() {
        let store = ChannelStore::new();
        // Populate z-depth via a BW full delivery: buffer ends up 1-wide.
        let src: Vec<f32> = (0..4).flat_map(|i| [i as f32, 9.0, 9.0, 9.0]).collect();
        store.apply(&update_set(
            RenderChannel::ZDepth,
            AttrImage {
                kind: ImageKind::BwFloat,
                width: 2,
                height: 2,
                data: bytes_of(&src),
                region: None,
            },
        ));
        let before = store.get(RenderChannel::ZDepth).unwrap();
        assert_eq!(before.channels, 1);
        assert_eq!(before.pixels, vec![0.0, 1.0, 2.0, 3.0]);

        let tile = vec![5.0f32; 4];
        let outcome = store.apply(&update_set(
            RenderChannel::ZDepth,
            AttrImage {
                kind: ImageKind::RgbaFloat,
                width: 1,
                height: 1,
                data: bytes_of(&tile),
                region: Some(ImageRegion {
                    x: 0,
                    y: 0,
                    width: 1,
                    height: 1,
                }),
            },
        ));
        assert!(!outcome.updated);
        assert_eq!(store.get(RenderChannel::ZDepth).unwrap(), before);
    }

    #[test]
    fn rgb_full_delivery_drops_alpha() {
        let store = ChannelStore::new();
        let src = [
            [0.1f32, 0.2, 0.3, 0.9],
            [0.4, 0.5, 0.6, 0.8],
        ];
        let flat: Vec<f32> = src.iter().flatten().copied().collect();
        store.apply(&update_set(
            RenderChannel::RealColor,
            AttrImage {
                kind: ImageKind::RgbFloat,
                width: 2,
                height: 1,
                data: bytes_of(&flat),
                region: None,
            },
        ));
        let img = store.get(RenderChannel::RealColor).unwrap();
        assert_eq!(img.channels, 3);
        assert_eq!(img.pixels, vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6]);
    }

    #[test]
    fn bw_full_delivery_keeps_red_only() {
        let store = ChannelStore::new();
        let src: Vec<f32> = vec![
            0.7, 0.1, 0.2, 1.0, //
            0.6, 0.3, 0.4, 1.0, //
            0.5, 0.5, 0.6, 1.0, //
            0.4, 0.7, 0.8, 1.0,
        ];
        store.apply(&update_set(
            RenderChannel::RenderId,
            AttrImage {
                kind: ImageKind::BwFloat,
                width: 2,
                height: 2,
                data: bytes_of(&src),
                region: None,
            },
        ));
        let img = store.get(RenderChannel::RenderId).unwrap();
        assert_eq!(img.channels, 1);
        assert_eq!(img.pixels, vec![0.7, 0.6, 0.5, 0.4]);
    }

    #[test]
    fn final_delivery_is_flipped_opaque_and_clamped() {
        let store = ChannelStore::new();
        // 1×2: top pixel out of range with alpha 0.25, bottom in range.
        let src = vec![
            2.0f32, -1.0, 0.5, 0.25, //
            0.1, 0.2, 0.3, 0.5,
        ];
        store.apply(&ImageSet {
            source: ImageSource::Ready,
            images: vec![(
                RenderChannel::Beauty,
                AttrImage {
                    kind: ImageKind::RgbaFloat,
                    width: 1,
                    height: 2,
                    data: bytes_of(&src),
                    region: None,
                },
            )],
        });
        let img = store.get(RenderChannel::Beauty).unwrap();
        // Bottom row first (flipped), alpha forced to 1, values clamped.
        assert_eq!(img.pixels, vec![0.1, 0.2, 0.3, 1.0, 1.0, 0.0, 0.5, 1.0]);
    }

    #[test]
    fn corrupt_jpeg_leaves_previous_buffer_untouched() {
        let store = ChannelStore::new();
        let base = ramp_4x4();
        store.apply(&update_set(RenderChannel::Beauty, full_rgba(4, 4, &base)));
        let before = store.get(RenderChannel::Beauty).unwrap();

        let outcome = store.apply(&update_set(
            RenderChannel::Beauty,
            AttrImage {
                kind: ImageKind::Jpeg,
                width: 4,
                height: 4,
                data: vec![0xde, 0xad, 0xbe, 0xef],
                region: None,
            },
        ));
        assert!(!outcome.updated);
        assert_eq!(store.get(RenderChannel::Beauty).unwrap(), before);
    }

    #[test]
    fn full_delivery_replaces_even_at_same_size() {
        let store = ChannelStore::new();
        store.apply(&update_set(
            RenderChannel::Beauty,
            full_rgba(4, 4, &ramp_4x4()),
        ));
        let twos = vec![2.0f32; 4 * 4 * 4];
        store.apply(&update_set(RenderChannel::Beauty, full_rgba(4, 4, &twos)));
        let img = store.get(RenderChannel::Beauty).unwrap();
        assert!(img.pixels.iter().all(|&v| v == 2.0));
    }

    #[test]
    fn oversized_dimensions_are_dropped_not_stored() {
        let store = ChannelStore::new();
        // 65536 * 65536 pixels wraps a u32 product to zero; the declared
        // shape must be rejected against the payload, not stored.
        let outcome = store.apply(&update_set(
            RenderChannel::Beauty,
            AttrImage {
                kind: ImageKind::RgbaFloat,
                width: 65536,
                height: 65536,
                data: bytes_of(&[1.0f32; 16]),
                region: None,
            },
        ));
        assert!(!outcome.updated);
        assert!(store.get(RenderChannel::Beauty).is_none());
    }

    #[test]
    fn tile_with_huge_offset_is_skipped() {
        let store = ChannelStore::new();
        store.apply(&update_set(
            RenderChannel::Beauty,
            full_rgba(4, 4, &ramp_4x4()),
        ));
        let before = store.get(RenderChannel::Beauty).unwrap();

        let tile = vec![5.0f32; 2 * 2 * 4];
        let outcome = store.apply(&update_set(
            RenderChannel::Beauty,
            AttrImage {
                kind: ImageKind::RgbaFloat,
                width: 2,
                height: 2,
                data: bytes_of(&tile),
                region: Some(ImageRegion {
                    x: u32::MAX,
                    y: 0,
                    width: 2,
                    height: 2,
                }),
            },
        ));
        assert!(!outcome.updated);
        assert_eq!(store.get(RenderChannel::Beauty).unwrap(), before);
    }

    #[test]
    fn ensure_allocated_is_idempotent() {
        let store = ChannelStore::new();
        store.ensure_allocated(RenderChannel::Beauty, 4, 2);
        let img = store.get(RenderChannel::Beauty).unwrap();
        assert_eq!((img.width, img.height, img.channels), (4, 2, 4));
        assert!(img.pixels.iter().all(|&v| v == 0.0));

        // A populated buffer survives later calls at other sizes.
        store.apply(&update_set(
            RenderChannel::Beauty,
            full_rgba(4, 4, &ramp_4x4()),
        ));
        store.ensure_allocated(RenderChannel::Beauty, 8, 8);
        let img = store.get(RenderChannel::Beauty).unwrap();
        assert_eq!((img.width, img.height), (4, 4));
    }
}
