// SPDX-License-Identifier: Apache-2.0
//! One physical connection to a render worker: synchronous connect,
//! fire-and-forget sends, and a private delivery thread that decodes
//! inbound packets and hands them to the registered handler.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use prism_proto::wire::{self, decode_message, encode_message};
use prism_proto::{Message, RendererCommand};
use tracing::{debug, warn};

use crate::endpoint::parse_endpoint;

/// Refuse inbound payloads larger than this (a 4K RGBA float frame is
/// ~132 MiB; anything past this is a framing error, not an image).
const MAX_PAYLOAD: usize = 256 * 1024 * 1024;

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Receiver for inbound worker messages.
///
/// Registered by handle with a [`Connection`]; invoked on the
/// connection's private delivery thread, never on the caller's thread.
/// Implementations must not block — serialize work for later instead.
pub trait MessageHandler: Send + Sync {
    /// Called once per decoded inbound message, in arrival order.
    fn on_message(&self, msg: Message);
}

type SharedHandler = Arc<Mutex<Option<Arc<dyn MessageHandler>>>>;

/// One worker link. States: Disconnected → Connected → (Degraded |
/// Disconnected). A refused connect leaves the connection Disconnected
/// with no error raised; retry is the caller's responsibility and happens
/// lazily, on next use, never on a timer.
pub struct Connection {
    id: u64,
    stream: Option<TcpStream>,
    reader: Option<JoinHandle<()>>,
    handler: SharedHandler,
    healthy: Arc<AtomicBool>,
    flush_on_exit: bool,
    next_ts: u64,
}

impl Connection {
    /// Construct a fresh, not-yet-connected link.
    pub fn new() -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            stream: None,
            reader: None,
            handler: Arc::new(Mutex::new(None)),
            healthy: Arc::new(AtomicBool::new(false)),
            flush_on_exit: true,
            next_ts: 0,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Connect to `tcp://host:port`. A refused or malformed endpoint is
    /// logged and leaves the connection Disconnected; no internal retry
    /// loop runs. A no-op when already connected.
    pub fn connect(&mut self, endpoint: &str) {
        if self.stream.is_some() {
            return;
        }
        let authority = match parse_endpoint(endpoint) {
            Ok(a) => a,
            Err(err) => {
                warn!(%err, "not connecting");
                return;
            }
        };
        let stream = match TcpStream::connect(authority) {
            Ok(s) => s,
            Err(err) => {
                debug!(%err, endpoint, "worker endpoint refused connection");
                return;
            }
        };
        let reader_stream = match stream.try_clone() {
            Ok(s) => s,
            Err(err) => {
                warn!(%err, "could not clone stream for delivery thread");
                return;
            }
        };
        self.healthy.store(true, Ordering::SeqCst);
        self.reader = Some(spawn_delivery_thread(
            reader_stream,
            Arc::clone(&self.handler),
            Arc::clone(&self.healthy),
        ));
        self.stream = Some(stream);
    }

    /// Whether a connect has succeeded on this link.
    pub fn connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Liveness probe, stricter than [`connected`](Self::connected): a
    /// connection is good while its delivery thread has observed no
    /// read or protocol failure and no send has failed.
    pub fn good(&self) -> bool {
        self.connected() && self.healthy.load(Ordering::SeqCst)
    }

    /// Send one message, fire-and-forget. FIFO order per caller is
    /// preserved; a write failure degrades the connection and is
    /// otherwise swallowed.
    pub fn send(&mut self, msg: &Message) {
        let Some(stream) = self.stream.as_mut() else {
            debug!(op = msg.op_name(), "dropping send on disconnected link");
            return;
        };
        let ts = self.next_ts;
        self.next_ts += 1;
        let packet = match encode_message(msg, ts) {
            Ok(p) => p,
            Err(err) => {
                warn!(%err, op = msg.op_name(), "failed to encode message");
                return;
            }
        };
        if let Err(err) = stream.write_all(&packet) {
            warn!(%err, op = msg.op_name(), "send failed, degrading connection");
            self.healthy.store(false, Ordering::SeqCst);
        }
    }

    /// Register the inbound message handler, replacing any previous one.
    pub fn set_handler(&self, handler: Arc<dyn MessageHandler>) {
        *lock_handler(&self.handler) = Some(handler);
    }

    /// Unregister the handler; subsequent inbound messages are dropped.
    pub fn clear_handler(&self) {
        *lock_handler(&self.handler) = None;
    }

    /// Control whether dropping this connection performs an orderly
    /// goodbye. Pool teardown disables this so process shutdown never
    /// blocks on workers that may already be gone.
    pub fn set_flush_on_exit(&mut self, flush: bool) {
        self.flush_on_exit = flush;
    }

    /// Tear the link down immediately: no goodbye, no joining the
    /// delivery thread.
    pub fn force_close(&mut self) {
        self.healthy.store(false, Ordering::SeqCst);
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        drop(self.reader.take());
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.flush_on_exit && self.good() {
            self.send(&Message::Renderer(RendererCommand::Free));
        }
        self.force_close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("connected", &self.connected())
            .field("good", &self.good())
            .finish()
    }
}

fn lock_handler(
    handler: &SharedHandler,
) -> std::sync::MutexGuard<'_, Option<Arc<dyn MessageHandler>>> {
    handler.lock().unwrap_or_else(PoisonError::into_inner)
}

fn spawn_delivery_thread(
    mut stream: TcpStream,
    handler: SharedHandler,
    healthy: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        let packet = match read_packet(&mut stream) {
            Ok(p) => p,
            Err(err) => {
                if err.kind() != io::ErrorKind::UnexpectedEof {
                    debug!(%err, "delivery stream closed");
                }
                healthy.store(false, Ordering::SeqCst);
                return;
            }
        };
        match decode_message(&packet) {
            Ok((msg, _ts, _used)) => {
                // Clone the handle out so delivery never runs under the
                // registration lock.
                let current = lock_handler(&handler).clone();
                if let Some(h) = current {
                    h.on_message(msg);
                }
            }
            Err(err) => {
                warn!(%err, "protocol error on delivery stream, degrading connection");
                healthy.store(false, Ordering::SeqCst);
                return;
            }
        }
    })
}

fn read_packet(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut header = [0u8; wire::HEADER_LEN];
    stream.read_exact(&mut header)?;
    let len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
    if len > MAX_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("payload of {len} bytes exceeds limit"),
        ));
    }
    let mut rest = vec![0u8; len + wire::CHECKSUM_LEN];
    stream.read_exact(&mut rest)?;
    let mut packet = Vec::with_capacity(wire::HEADER_LEN + rest.len());
    packet.extend_from_slice(&header);
    packet.extend_from_slice(&rest);
    Ok(packet)
}
