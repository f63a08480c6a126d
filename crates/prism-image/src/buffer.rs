// SPDX-License-Identifier: Apache-2.0
//! Owned float pixel buffers.

/// One reconstructed image channel.
///
/// The pixel buffer is exclusively owned by its store entry; readers get an
/// independent deep copy (`Clone`), never a shared reference. An empty
/// `pixels` vector means the channel has not been populated yet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderImage {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Components per pixel (4, 3 or 1).
    pub channels: u32,
    /// Row-major interleaved samples, `width * height * channels` long.
    pub pixels: Vec<f32>,
}

impl RenderImage {
    /// Allocate a zero-filled buffer of the given shape.
    pub fn zeroed(width: u32, height: u32, channels: u32) -> Self {
        let len = u128::from(width) * u128::from(height) * u128::from(channels);
        Self {
            width,
            height,
            channels,
            // A shape too large to address stays unpopulated.
            pixels: vec![0.0; usize::try_from(len).unwrap_or(0)],
        }
    }

    /// Whether this channel has ever been populated.
    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    /// Copy a tile into this buffer at `(x, y)`, row by row.
    ///
    /// `tile` must be interleaved with the same channel count as this
    /// buffer and `tile_w * tile_h * channels` samples long. Returns false
    /// without touching the buffer when the tile does not fit.
    pub fn blit_region(&mut self, tile: &[f32], x: u32, y: u32, tile_w: u32, tile_h: u32) -> bool {
        let ch = self.channels as usize;
        // Offsets and extents are wire-controlled; widen before adding.
        let in_bounds = u64::from(x) + u64::from(tile_w) <= u64::from(self.width)
            && u64::from(y) + u64::from(tile_h) <= u64::from(self.height);
        if !in_bounds || tile.len() as u128 != u128::from(tile_w) * u128::from(tile_h) * ch as u128 {
            return false;
        }
        let dst_stride = self.width as usize * ch;
        let src_stride = tile_w as usize * ch;
        for row in 0..tile_h as usize {
            let dst = (y as usize + row) * dst_stride + x as usize * ch;
            let src = row * src_stride;
            self.pixels[dst..dst + src_stride].copy_from_slice(&tile[src..src + src_stride]);
        }
        true
    }

    /// Flip the image vertically in place.
    pub fn flip_vertical(&mut self) {
        let stride = (self.width * self.channels) as usize;
        if stride == 0 {
            return;
        }
        let mut lo = 0usize;
        let mut hi = (self.height as usize).saturating_sub(1);
        while lo < hi {
            let (a, b) = self.pixels.split_at_mut(hi * stride);
            a[lo * stride..lo * stride + stride].swap_with_slice(&mut b[..stride]);
            lo += 1;
            hi -= 1;
        }
    }

    /// Force the alpha component of every pixel to fully opaque.
    /// No-op unless the buffer has four channels.
    pub fn reset_alpha(&mut self) {
        if self.channels != 4 {
            return;
        }
        for px in self.pixels.chunks_exact_mut(4) {
            px[3] = 1.0;
        }
    }

    /// Clamp every sample into `[min, max]`.
    pub fn clamp(&mut self, min: f32, max: f32) {
        for v in &mut self.pixels {
            *v = v.clamp(min, max);
        }
    }
}
