// SPDX-License-Identifier: Apache-2.0
//! Render session client for prism workers.
//!
//! A [`RenderSession`] owns one pooled [`Connection`] to a long-running
//! render worker for the lifetime of an export. High-level export calls
//! (init, export a plugin's attributes, resize, request channels) become
//! framed wire messages; inbound deliveries arrive on the connection's
//! private thread and are routed into the session's channel store and
//! callbacks.
//!
//! Connections outlive sessions: the process-wide [`ConnectionPool`]
//! recycles idle connections so reconnect cost is paid once per process,
//! not once per scene export.

mod connection;
mod endpoint;
mod pool;
mod session;

use thiserror::Error;

pub use connection::{Connection, MessageHandler};
pub use pool::ConnectionPool;
pub use session::{PluginRef, RenderSession, SessionSettings};

/// Errors surfaced by session operations.
///
/// Connection loss is deliberately absent: broken links are observable
/// only through `connected()`/`good()` and recovered lazily on the next
/// operation. These variants are contract violations the caller must not
/// ignore.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    /// The worker endpoint string was not of the form `tcp://host:port`.
    #[error("bad worker endpoint {endpoint:?}: expected tcp://host:port")]
    BadEndpoint {
        /// The offending endpoint string.
        endpoint: String,
    },
    /// An animation export went backwards in time. Frames must be
    /// exported in non-decreasing order; the session sent nothing for
    /// the offending call.
    #[error("frame exported out of order: last {last}, requested {requested}")]
    FrameOutOfOrder {
        /// Last frame for which attributes were sent.
        last: f32,
        /// The earlier frame the caller tried to export.
        requested: f32,
    },
}
