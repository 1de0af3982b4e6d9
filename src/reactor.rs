// SPDX-License-Identifier: AGPL-3.0-or-later

//! Reactor integration (spec §1 "reactor", §5 "Reactor integration").
//!
//! The core only requires a reactor capable of scheduling a deferred
//! callback on its own thread, plus a shutdown hook. CLI/event-loop
//! specifics are the caller's problem; this module defines the seam and
//! ships one concrete implementation (`TokioReactor`) built on the
//! runtime this crate already depends on.

use std::sync::Arc;
use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::conn::Connection;

/// Caller-supplied single-threaded event scheduler that owns all handler
/// invocations.
pub trait Reactor: Send + Sync {
    /// Schedule `f` to run later on the reactor's own thread. Must not be
    /// invoked synchronously from inside a connection lock.
    fn schedule(&self, f: Box<dyn FnOnce() + Send>);
}

/// Default `Reactor` for callers already running inside a Tokio runtime:
/// every scheduled closure becomes a `tokio::task::spawn_blocking`-free
/// `tokio::spawn`.
#[derive(Debug, Default)]
pub struct TokioReactor;

impl Reactor for TokioReactor {
    fn schedule(&self, f: Box<dyn FnOnce() + Send>) {
        tokio::spawn(async move { f() });
    }
}

/// Process-wide registry of connections bound to a reactor, mirroring the
/// source driver's `EM_Guard` (spec §5 "Reactor integration"). On reactor
/// shutdown every registered connection has its callback-kind waiters
/// dropped so later responses are silently discarded rather than
/// dispatched to a dead reactor.
///
/// Registration/unregistration uses its own lock, separate from any given
/// connection's internal lock, to avoid lock-order inversions.
static EM_GUARD: Lazy<Mutex<Vec<Arc<Connection>>>> = Lazy::new(|| Mutex::new(Vec::new()));

pub fn register_for_shutdown(conn: Arc<Connection>) {
    let mut guard = EM_GUARD.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if !guard.iter().any(|c| Arc::ptr_eq(c, &conn)) {
        guard.push(conn);
    }
}

pub fn unregister_for_shutdown(conn: &Arc<Connection>) {
    let mut guard = EM_GUARD.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    guard.retain(|c| !Arc::ptr_eq(c, conn));
}

/// Run on reactor shutdown: every registered connection drops its
/// callback-kind waiters.
pub async fn shutdown_all() {
    let conns: Vec<Arc<Connection>> = {
        let guard = EM_GUARD.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.clone()
    };
    for conn in conns {
        conn.drop_callback_waiters().await;
    }
}
