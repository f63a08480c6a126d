// SPDX-License-Identifier: Apache-2.0
//! Process-wide cache of idle worker connections.

use std::sync::{Mutex, PoisonError};

use prism_proto::{Message, RendererCommand};
use tracing::debug;

use crate::connection::Connection;

/// Free list of idle [`Connection`]s.
///
/// Constructed once per process and passed by `Arc` to every session;
/// there is no ambient global. Acquire/release are O(1) under one lock.
#[derive(Debug, Default)]
pub struct ConnectionPool {
    idle: Mutex<Vec<Connection>>,
}

impl ConnectionPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out an idle connection, or a fresh unconnected one when the
    /// free list is empty.
    pub fn acquire(&self) -> Connection {
        self.lock().pop().unwrap_or_else(Connection::new)
    }

    /// Return a connection for reuse by a future session.
    ///
    /// Sends a `Free` lifecycle message as a courtesy reset and clears
    /// the handler. A degraded connection is not worth recycling and is
    /// dropped instead, so the next `acquire` builds a fresh link.
    pub fn release(&self, mut conn: Connection) {
        conn.clear_handler();
        if conn.connected() && !conn.good() {
            debug!("discarding degraded connection instead of pooling it");
            return;
        }
        conn.send(&Message::Renderer(RendererCommand::Free));
        self.lock().push(conn);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Connection>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        // Process shutdown must not block on orderly goodbyes with
        // workers that may already be gone.
        for mut conn in self.lock().drain(..) {
            conn.set_flush_on_exit(false);
            conn.force_close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_connection_is_handed_out_again() {
        let pool = ConnectionPool::new();
        let conn = pool.acquire();
        let id = conn.id();
        pool.release(conn);
        assert_eq!(pool.acquire().id(), id);
    }

    #[test]
    fn empty_pool_builds_fresh_connections() {
        let pool = ConnectionPool::new();
        let a = pool.acquire();
        let b = pool.acquire();
        assert_ne!(a.id(), b.id());
    }
}
