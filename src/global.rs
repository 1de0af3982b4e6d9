// SPDX-License-Identifier: AGPL-3.0-or-later

//! Process-wide default connection (spec §9 design note: "a last-connected
//! global default, set by every successful `connect()` and cleared on
//! `close()`, mirrors the reference clients' convenience accessor").
//!
//! Entirely optional: nothing in `conn`/`cursor`/`handler` depends on it.

use std::sync::Arc;

use once_cell::sync::Lazy;
use tokio::sync::Mutex;

use crate::conn::Connection;

static DEFAULT_CONNECTION: Lazy<Mutex<Option<Arc<Connection>>>> = Lazy::new(|| Mutex::new(None));

/// Record `conn` as the process-wide default, replacing whatever was there.
pub async fn set_default(conn: Arc<Connection>) {
    *DEFAULT_CONNECTION.lock().await = Some(conn);
}

/// Fetch the current default connection, if one is set.
pub async fn default_connection() -> Option<Arc<Connection>> {
    DEFAULT_CONNECTION.lock().await.clone()
}

/// Clear the default connection if it is (by pointer identity) `conn`.
pub async fn clear_default_if(conn: &Arc<Connection>) {
    let mut guard = DEFAULT_CONNECTION.lock().await;
    if let Some(current) = guard.as_ref()
        && Arc::ptr_eq(current, conn)
    {
        *guard = None;
    }
}
