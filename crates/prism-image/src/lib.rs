// SPDX-License-Identifier: Apache-2.0
//! Per-channel framebuffer reconstruction for prism render sessions.
//!
//! A render worker streams image deliveries per channel: full replaces,
//! partial tiles, and JPEG-compressed preview blocks. This crate owns the
//! mutable per-channel buffers ([`RenderImage`]), merges deliveries under a
//! shared lock ([`ChannelStore`]), and isolates the compressed decode path
//! ([`decode`]) so a malformed payload can never corrupt a session.

mod buffer;
pub mod decode;
mod store;

pub use buffer::RenderImage;
pub use store::{ApplyOutcome, ChannelStore};
