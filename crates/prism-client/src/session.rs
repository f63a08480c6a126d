// SPDX-License-Identifier: Apache-2.0
//! Render session orchestration: translates high-level export calls into
//! wire messages and routes inbound deliveries into the channel store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use prism_image::{ChannelStore, RenderImage};
use prism_proto::{
    AttrValue, Message, PluginDesc, RenderChannel, RenderMode, RendererCommand, RendererStatus,
    RendererType,
};
use tracing::{debug, warn};

use crate::connection::{Connection, MessageHandler};
use crate::pool::ConnectionPool;
use crate::SessionError;

/// Session configuration, copied once before `init`.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    /// Worker endpoint, `tcp://host:port`.
    pub endpoint: String,
    /// Interactive viewport session (beauty channel only, no final
    /// normalization of partials) vs. final-render session.
    pub viewport: bool,
    /// Whether this export walks an animation range.
    pub animation: bool,
    /// First frame of the animation range.
    pub frame_start: f32,
    /// Output mode for viewport sessions; final-render sessions always
    /// request production mode.
    pub render_mode: RenderMode,
    /// Interactive quality in percent.
    pub viewport_quality: u8,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            endpoint: "tcp://127.0.0.1:5556".to_string(),
            viewport: false,
            animation: false,
            frame_start: 0.0,
            render_mode: RenderMode::Preview,
            viewport_quality: 100,
        }
    }
}

/// Reference to an exported plugin, as returned by
/// [`RenderSession::export_plugin`]. An empty name means the export was
/// rejected (e.g. a desc without a type identifier).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginRef {
    /// Plugin instance name on the worker.
    pub name: String,
}

impl PluginRef {
    /// The empty reference.
    pub fn none() -> Self {
        Self::default()
    }

    /// Whether this references an actually exported plugin.
    pub fn is_valid(&self) -> bool {
        !self.name.is_empty()
    }
}

type LogFn = Box<dyn Fn(&str) + Send + Sync>;
type NotifyFn = Box<dyn Fn() + Send + Sync>;

/// State shared with the connection's delivery thread.
struct SessionState {
    store: ChannelStore,
    aborted: AtomicBool,
    last_rendered_frame: Mutex<f32>,
    on_log: Mutex<Option<LogFn>>,
    on_image_updated: Mutex<Option<NotifyFn>>,
    on_image_ready: Mutex<Option<NotifyFn>>,
}

impl MessageHandler for SessionState {
    fn on_message(&self, msg: Message) {
        match msg {
            Message::Images(set) => {
                let outcome = self.store.apply(&set);
                if outcome.updated {
                    if let Some(cb) = &*lock(&self.on_image_updated) {
                        cb();
                    }
                }
                if outcome.ready {
                    if let Some(cb) = &*lock(&self.on_image_ready) {
                        cb();
                    }
                }
            }
            Message::LogText(text) => {
                // Forward the first line only; worker logs are newline-happy.
                let line = text.split(['\n', '\r']).next().unwrap_or_default();
                if let Some(cb) = &*lock(&self.on_log) {
                    cb(line);
                }
            }
            Message::RendererState { status, frame } => {
                let aborted = status == RendererStatus::Abort;
                self.aborted.store(aborted, Ordering::SeqCst);
                if !aborted {
                    if let Some(frame) = frame {
                        *lock(&self.last_rendered_frame) = frame;
                    }
                }
            }
            other => {
                debug!(op = other.op_name(), "ignoring unexpected inbound op");
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FrameState {
    current: f32,
    last_exported: f32,
}

/// Client side of one export: owns a pooled connection for its lifetime,
/// encodes scene attributes into wire messages, and reassembles streamed
/// image deliveries into per-channel buffers.
///
/// Two threads touch a session: the caller's thread (every public method)
/// and the connection's delivery thread (inbound messages). The channel
/// store and frame bookkeeping carry their own locks; no public method
/// blocks on network I/O except the connect inside [`init`](Self::init).
pub struct RenderSession {
    settings: SessionSettings,
    pool: Arc<ConnectionPool>,
    conn: Mutex<Option<Connection>>,
    state: Arc<SessionState>,
    frames: Mutex<FrameState>,
    quality: Mutex<u8>,
}

impl RenderSession {
    /// Create a session with the given settings, drawing connections from
    /// `pool`. No network activity until [`init`](Self::init).
    pub fn new(settings: SessionSettings, pool: Arc<ConnectionPool>) -> Self {
        let last_rendered = if settings.animation {
            settings.frame_start - 1.0
        } else {
            0.0
        };
        let current = if settings.animation {
            settings.frame_start
        } else {
            0.0
        };
        Self {
            quality: Mutex::new(settings.viewport_quality),
            frames: Mutex::new(FrameState {
                current,
                last_exported: f32::MIN,
            }),
            state: Arc::new(SessionState {
                store: ChannelStore::new(),
                aborted: AtomicBool::new(false),
                last_rendered_frame: Mutex::new(last_rendered),
                on_log: Mutex::new(None),
                on_image_updated: Mutex::new(None),
                on_image_ready: Mutex::new(None),
            }),
            settings,
            pool,
            conn: Mutex::new(None),
        }
    }

    /// Acquire a connection if none is held, register the receive
    /// handler, connect, and send the renderer bring-up sequence.
    ///
    /// Never fails to the caller: an unreachable worker is logged and the
    /// session stays usable (sends become no-ops until the next lazy
    /// recovery).
    pub fn init(&self) {
        let mut conn = lock(&self.conn);
        self.init_locked(&mut conn);
    }

    fn init_locked(&self, conn: &mut Option<Connection>) {
        let c = conn.get_or_insert_with(|| self.pool.acquire());
        c.set_handler(Arc::clone(&self.state) as Arc<dyn MessageHandler>);
        if !c.connected() {
            c.connect(&self.settings.endpoint);
        }
        if !c.connected() {
            debug!(endpoint = %self.settings.endpoint, "init: worker unreachable");
            return;
        }

        let renderer_type = if self.settings.animation && !self.settings.viewport {
            RendererType::Animation
        } else {
            RendererType::Interactive
        };
        let mode = if self.settings.viewport {
            self.settings.render_mode
        } else {
            RenderMode::Production
        };
        c.send(&Message::Renderer(RendererCommand::SetType(renderer_type)));
        c.send(&Message::Renderer(RendererCommand::Init));
        c.send(&Message::Renderer(RendererCommand::SetRenderMode(mode)));
        c.send(&Message::Renderer(RendererCommand::SetQuality(
            *lock(&self.quality),
        )));
        c.send(&Message::Renderer(RendererCommand::GetImage(
            RenderChannel::Beauty,
        )));
        if !self.settings.viewport {
            for channel in [
                RenderChannel::ZDepth,
                RenderChannel::RealColor,
                RenderChannel::Normal,
                RenderChannel::RenderId,
            ] {
                c.send(&Message::Renderer(RendererCommand::GetImage(channel)));
            }
        }
    }

    /// Lazy recovery, run before every outbound operation. A held
    /// connection that went bad is dropped back to the pool and replaced
    /// by a fresh one, re-running the bring-up sequence. A connection
    /// whose connect was refused is left alone; retrying is pointless
    /// until the caller re-inits with a reachable worker.
    fn check_connection<'a>(&self, conn: &'a mut Option<Connection>) -> &'a mut Connection {
        let went_bad = conn.as_ref().is_some_and(|c| c.connected() && !c.good());
        if went_bad {
            if let Some(dead) = conn.take() {
                self.pool.release(dead);
            }
            *conn = Some(self.pool.acquire());
            self.init_locked(conn);
        }
        let c = conn.get_or_insert_with(|| self.pool.acquire());
        c.set_handler(Arc::clone(&self.state) as Arc<dyn MessageHandler>);
        c
    }

    /// Export one plugin description: create the plugin, advance the
    /// worker clock at most once per distinct frame, then push every
    /// attribute as its own message.
    ///
    /// Contract: in animation mode (non-viewport), frames must be
    /// exported in non-decreasing order; an earlier frame is a fatal
    /// [`SessionError::FrameOutOfOrder`] and nothing is sent. A desc
    /// without a type identifier is a logged no-op.
    pub fn export_plugin(&self, desc: &PluginDesc) -> Result<PluginRef, SessionError> {
        if desc.type_id.is_empty() {
            warn!(plugin = %desc.name, "plugin desc has no type identifier, skipping export");
            return Ok(PluginRef::none());
        }

        let mut conn = lock(&self.conn);
        let c = self.check_connection(&mut conn);

        let animation_check = self.settings.animation && !self.settings.viewport;
        let mut frames = lock(&self.frames);
        if animation_check && frames.current < frames.last_exported {
            return Err(SessionError::FrameOutOfOrder {
                last: frames.last_exported,
                requested: frames.current,
            });
        }

        c.send(&Message::CreatePlugin {
            plugin: desc.name.clone(),
            type_id: desc.type_id.clone(),
        });

        if animation_check && frames.current != frames.last_exported {
            frames.last_exported = frames.current;
            c.send(&Message::Renderer(RendererCommand::SetCurrentTime(
                frames.current,
            )));
        }

        for (attr, value) in &desc.attrs {
            let value = match value {
                AttrValue::Unknown => continue,
                // The embedded frame is a producer hint; in animation
                // exports the session clock is authoritative.
                AttrValue::Instancer(inst) if animation_check && inst.frame != frames.current => {
                    let mut inst = inst.clone();
                    inst.frame = frames.current;
                    AttrValue::Instancer(inst)
                }
                other => other.clone(),
            };
            c.send(&Message::SetAttr {
                plugin: desc.name.clone(),
                attr: attr.clone(),
                value,
            });
        }

        Ok(PluginRef {
            name: desc.name.clone(),
        })
    }

    /// Remove a plugin from the worker scene, independent of frame state.
    pub fn remove_plugin(&self, name: &str) {
        let mut conn = lock(&self.conn);
        let c = self.check_connection(&mut conn);
        c.send(&Message::RemovePlugin {
            plugin: name.to_string(),
        });
    }

    /// Start rendering.
    pub fn start(&self) {
        self.send_command(RendererCommand::Start);
    }

    /// Stop rendering.
    pub fn stop(&self) {
        self.send_command(RendererCommand::Stop);
    }

    /// Ask the worker to serialize its current scene to `path`.
    pub fn export_scene(&self, path: &str) {
        self.send_command(RendererCommand::ExportScene {
            path: path.to_string(),
        });
    }

    /// Set interactive render quality. Coalesced: an unchanged value
    /// sends nothing, so drag interactions don't spam the worker.
    pub fn set_viewport_quality(&self, quality: u8) {
        {
            let mut current = lock(&self.quality);
            if *current == quality {
                return;
            }
            *current = quality;
        }
        let mut conn = lock(&self.conn);
        if let Some(c) = conn.as_mut() {
            c.send(&Message::Renderer(RendererCommand::SetQuality(quality)));
        }
    }

    /// Resize the worker framebuffer.
    ///
    /// Final-render sessions pre-allocate a zero-filled beauty buffer of
    /// the new size before the resize message goes out, so a reader that
    /// races the worker never observes a stale-size buffer.
    pub fn set_render_size(&self, width: u32, height: u32) {
        if !self.settings.viewport {
            self.state
                .store
                .ensure_allocated(RenderChannel::Beauty, width, height);
        }
        self.send_command(RendererCommand::Resize { width, height });
    }

    /// Advance the session's scene clock. Frames must not go backwards
    /// across subsequent exports in animation mode.
    pub fn set_current_frame(&self, frame: f32) {
        lock(&self.frames).current = frame;
    }

    /// Deep copy of one reconstructed channel; empty if never populated.
    /// Never blocks on network I/O, but the delivery thread stalls for
    /// the duration of the copy on large frames (the copy is taken under
    /// the store lock).
    pub fn render_channel(&self, channel: RenderChannel) -> RenderImage {
        self.state.store.get(channel).unwrap_or_default()
    }

    /// Deep copy of the beauty channel.
    pub fn image(&self) -> RenderImage {
        self.render_channel(RenderChannel::Beauty)
    }

    /// Whether the worker reported an aborted render.
    pub fn aborted(&self) -> bool {
        self.state.aborted.load(Ordering::SeqCst)
    }

    /// Last frame the worker reported fully rendered.
    pub fn last_rendered_frame(&self) -> f32 {
        *lock(&self.state.last_rendered_frame)
    }

    /// Register the worker log-line callback (first line of each message).
    pub fn set_on_log_line(&self, f: impl Fn(&str) + Send + Sync + 'static) {
        *lock(&self.state.on_log) = Some(Box::new(f));
    }

    /// Register the callback fired when an interactive image updated.
    pub fn set_on_image_updated(&self, f: impl Fn() + Send + Sync + 'static) {
        *lock(&self.state.on_image_updated) = Some(Box::new(f));
    }

    /// Register the callback fired when a final image set is ready.
    pub fn set_on_image_ready(&self, f: impl Fn() + Send + Sync + 'static) {
        *lock(&self.state.on_image_ready) = Some(Box::new(f));
    }

    fn send_command(&self, cmd: RendererCommand) {
        let mut conn = lock(&self.conn);
        let c = self.check_connection(&mut conn);
        c.send(&Message::Renderer(cmd));
    }
}

impl Drop for RenderSession {
    fn drop(&mut self) {
        // Unregister the handler and hand the connection back for reuse;
        // the pool sends the goodbye Free.
        if let Some(conn) = lock(&self.conn).take() {
            self.pool.release(conn);
        }
    }
}

impl std::fmt::Debug for RenderSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderSession")
            .field("settings", &self.settings)
            .field("aborted", &self.aborted())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn animation_session() -> RenderSession {
        RenderSession::new(
            SessionSettings {
                animation: true,
                frame_start: 1.0,
                ..SessionSettings::default()
            },
            Arc::new(ConnectionPool::new()),
        )
    }

    #[test]
    fn export_without_type_id_is_a_no_op() {
        let session = animation_session();
        let desc = PluginDesc::new("", "NodeUntyped");
        let plugin = session.export_plugin(&desc).unwrap();
        assert!(!plugin.is_valid());
    }

    #[test]
    fn earlier_frame_is_a_fatal_contract_error() {
        // Sends are silently dropped on the unconnected link, so frame
        // bookkeeping is observable without a worker.
        let session = animation_session();
        let desc = PluginDesc::new("Node", "NodeTeapot");

        session.set_current_frame(5.0);
        assert!(session.export_plugin(&desc).unwrap().is_valid());

        session.set_current_frame(3.0);
        assert_eq!(
            session.export_plugin(&desc),
            Err(SessionError::FrameOutOfOrder {
                last: 5.0,
                requested: 3.0
            })
        );

        // Equal and later frames remain fine.
        session.set_current_frame(5.0);
        assert!(session.export_plugin(&desc).is_ok());
        session.set_current_frame(6.0);
        assert!(session.export_plugin(&desc).is_ok());
    }

    #[test]
    fn frame_ordering_is_ignored_for_viewport_sessions() {
        let session = RenderSession::new(
            SessionSettings {
                animation: true,
                viewport: true,
                ..SessionSettings::default()
            },
            Arc::new(ConnectionPool::new()),
        );
        let desc = PluginDesc::new("Node", "NodeTeapot");
        session.set_current_frame(5.0);
        assert!(session.export_plugin(&desc).is_ok());
        session.set_current_frame(3.0);
        assert!(session.export_plugin(&desc).is_ok());
    }
}
