// SPDX-License-Identifier: Apache-2.0
//! Wire schema for the prism render worker protocol.
//!
//! A render client drives a long-running worker process by streaming
//! [`Message`]s over an ordered, reliable transport: plugin creation and
//! attribute pushes, renderer lifecycle commands, and inbound image
//! deliveries. Payloads are CBOR inside deterministic framed packets
//! (see [`wire`]).

mod attr;
mod image;
pub mod wire;

use serde::{Deserialize, Serialize};

pub use attr::{AttrValue, InstanceItem, Instancer, MapChannel, MapChannels, PluginDesc, Transform};
pub use image::{AttrImage, ImageKind, ImageRegion, ImageSet, ImageSource, RenderChannel};

/// Renderer flavor selected at session start.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RendererType {
    /// Progressive interactive renderer (viewport sessions).
    Interactive,
    /// Frame-accurate renderer for animation/batch exports.
    Animation,
}

/// Output mode requested from the worker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RenderMode {
    /// Fast preview quality.
    Preview,
    /// Final production quality.
    Production,
}

/// Worker-side renderer status reported back to the client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RendererStatus {
    /// Rendering proceeds normally.
    Continue,
    /// The worker aborted the render.
    Abort,
}

/// Renderer lifecycle command (client → worker).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RendererCommand {
    /// Select the renderer flavor. Sent first, before `Init`.
    SetType(RendererType),
    /// Initialize the renderer.
    Init,
    /// Release the renderer and all scene state.
    Free,
    /// Start rendering.
    Start,
    /// Stop rendering.
    Stop,
    /// Resize the output framebuffer.
    Resize {
        /// New width in pixels.
        width: u32,
        /// New height in pixels.
        height: u32,
    },
    /// Select preview vs. production output.
    SetRenderMode(RenderMode),
    /// Set interactive quality in percent (0–100).
    SetQuality(u8),
    /// Advance the scene clock to an animation frame.
    SetCurrentTime(f32),
    /// Subscribe to deliveries of one image channel.
    GetImage(RenderChannel),
    /// Ask the worker to serialize its current scene to a file.
    ExportScene {
        /// Destination path on the worker host.
        path: String,
    },
}

/// Payload for [`Message::CreatePlugin`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreatePluginPayload {
    /// Unique plugin instance name.
    pub plugin: String,
    /// Plugin type identifier.
    pub type_id: String,
}

/// Payload for [`Message::SetAttr`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SetAttrPayload {
    /// Target plugin instance name.
    pub plugin: String,
    /// Attribute name within the plugin.
    pub attr: String,
    /// New attribute value.
    pub value: AttrValue,
}

/// Payload for [`Message::RemovePlugin`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemovePluginPayload {
    /// Plugin instance name to remove.
    pub plugin: String,
}

/// Payload for [`Message::RendererState`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RendererStatePayload {
    /// Reported status.
    pub status: RendererStatus,
    /// Last fully rendered frame, when the status is not an abort.
    pub frame: Option<f32>,
}

/// Wire message kinds carried inside packet payloads.
///
/// Exactly one variant is populated per packet; the op string on the wire
/// is closed (see [`Message::op_name`]) and an unrecognized op is a hard
/// protocol error on decode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Message {
    /// Instantiate a plugin on the worker (op = "create_plugin").
    CreatePlugin {
        /// Unique plugin instance name.
        plugin: String,
        /// Plugin type identifier.
        type_id: String,
    },
    /// Set one attribute on a plugin (op = "set_attr").
    SetAttr {
        /// Target plugin instance name.
        plugin: String,
        /// Attribute name within the plugin.
        attr: String,
        /// New attribute value.
        value: AttrValue,
    },
    /// Remove a plugin and its scene state (op = "remove_plugin").
    RemovePlugin {
        /// Plugin instance name to remove.
        plugin: String,
    },
    /// Renderer lifecycle command (op = "renderer").
    Renderer(RendererCommand),
    /// Image delivery from the worker (op = "images").
    Images(ImageSet),
    /// Worker log/status text line (op = "log").
    LogText(String),
    /// Worker renderer status change (op = "renderer_state").
    RendererState {
        /// Reported status.
        status: RendererStatus,
        /// Last fully rendered frame, when the status is not an abort.
        frame: Option<f32>,
    },
}

impl Message {
    /// Canonical op string for this message variant.
    pub fn op_name(&self) -> &'static str {
        match self {
            Message::CreatePlugin { .. } => "create_plugin",
            Message::SetAttr { .. } => "set_attr",
            Message::RemovePlugin { .. } => "remove_plugin",
            Message::Renderer(_) => "renderer",
            Message::Images(_) => "images",
            Message::LogText(_) => "log",
            Message::RendererState { .. } => "renderer_state",
        }
    }
}
