// SPDX-License-Identifier: AGPL-3.0-or-later

//! Lazy, prefetching cursor over a paged result sequence (spec §3 "Cursor",
//! §4.6 "Cursor lifecycle").

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::conn::Connection;
use crate::error::{DriverError, Result};
use crate::proto::{PerTokenOpts, QueryType, ResponseType};

/// How long `Cursor::next` is willing to block for the next batch.
#[derive(Debug, Clone, Copy)]
pub enum Wait {
    Forever,
    NoWait,
    Seconds(f64),
}

impl Wait {
    fn as_timeout(self) -> Option<Duration> {
        match self {
            Wait::Forever => None,
            Wait::NoWait => Some(Duration::ZERO),
            Wait::Seconds(s) => Some(Duration::from_secs_f64(s.max(0.0))),
        }
    }
}

/// A single-consumer view over a server-side sequence, backed by
/// `CONTINUE`/`STOP` frames. Terminal once exhausted or closed; a cursor
/// outlived by a reconnect is stale and every call fails with
/// `ConnectionClosed`.
pub struct Cursor {
    conn: Arc<Connection>,
    conn_id: u64,
    token: u64,
    opts: PerTokenOpts,
    buffer: VecDeque<Value>,
    /// `true` while the server may still have more batches behind this one.
    more: bool,
    closed: bool,
    /// `true` while a `CONTINUE` for `token` is outstanding. A timed-out
    /// `next()` leaves the waiter registered (spec §5: a timeout must not
    /// affect the in-flight server-side query); this flag keeps a later
    /// `next()` from re-registering and re-dispatching on top of it, which
    /// would otherwise fail as a duplicate-token registration.
    fetch_in_flight: bool,
}

impl Cursor {
    /// Build a Cursor over the first batch already in hand. Per spec §4.6
    /// "Prefetching", a batch still expected to have a successor
    /// immediately gets its `CONTINUE` dispatched here — before the caller
    /// has asked for a single row — so the next round trip overlaps
    /// consumption of the current batch rather than starting only once the
    /// buffer runs dry.
    pub(crate) async fn new(
        conn: Arc<Connection>,
        conn_id: u64,
        token: u64,
        opts: PerTokenOpts,
        first_batch: Vec<Value>,
        more: bool,
    ) -> Result<Self> {
        let mut cursor = Cursor {
            conn,
            conn_id,
            token,
            opts,
            buffer: first_batch.into(),
            more,
            closed: false,
            fetch_in_flight: false,
        };
        if cursor.more {
            cursor.dispatch_continue().await?;
        }
        Ok(cursor)
    }

    /// Register a blocking waiter for `token` and dispatch a `CONTINUE`
    /// frame, marking a fetch as outstanding. Called eagerly (see `new`
    /// and `fetch_more`) so that at most one batch is ever being consumed
    /// while the next is not already in flight.
    async fn dispatch_continue(&mut self) -> Result<()> {
        let payload = json!([QueryType::Continue as i32]);
        self.conn
            .register_blocking(self.token, self.opts.clone())
            .await?;
        self.conn.dispatch(self.token, &payload).await?;
        self.fetch_in_flight = true;
        Ok(())
    }

    fn check_fresh(&self) -> Result<()> {
        if self.closed {
            return Err(DriverError::StopIteration);
        }
        Ok(())
    }

    async fn check_live(&self) -> Result<()> {
        if self.conn.conn_id().await != self.conn_id || !self.conn.is_open().await {
            return Err(DriverError::ConnectionClosed);
        }
        Ok(())
    }

    /// Yield the next row, fetching another batch from the server if the
    /// local buffer has run dry and the server indicated more are coming.
    pub async fn next(&mut self, wait: Wait) -> Result<Value> {
        self.check_fresh()?;

        if let Some(row) = self.buffer.pop_front() {
            return Ok(row);
        }

        if !self.more {
            self.closed = true;
            return Err(DriverError::StopIteration);
        }

        self.check_live().await?;
        self.fetch_more(wait).await?;

        match self.buffer.pop_front() {
            Some(row) => Ok(row),
            None => {
                self.closed = true;
                Err(DriverError::StopIteration)
            },
        }
    }

    async fn fetch_more(&mut self, wait: Wait) -> Result<()> {
        // Under normal operation a fetch is already outstanding by the time
        // this is called (`new` and the previous `fetch_more` both dispatch
        // eagerly); this only triggers the dispatch itself if somehow none
        // is in flight yet.
        if !self.fetch_in_flight {
            self.dispatch_continue().await?;
        }

        let envelope = self.conn.wait(self.token, wait.as_timeout()).await?;
        self.fetch_in_flight = false;
        let Some(rtype) = envelope.response_type() else {
            return Err(DriverError::internal(format!(
                "unrecognized response type {}",
                envelope.t
            )));
        };

        match rtype {
            ResponseType::SuccessPartial => {
                self.buffer.extend(envelope.r);
                self.more = true;
                // Prefetch: immediately ask for the batch behind this one
                // so it overlaps whatever the caller does with the rows
                // just handed back (spec §4.6).
                self.dispatch_continue().await?;
            },
            ResponseType::SuccessSequence => {
                self.buffer.extend(envelope.r);
                self.more = false;
            },
            ResponseType::ClientError | ResponseType::CompileError | ResponseType::RuntimeError => {
                self.closed = true;
                return Err(crate::conn::envelope_error(rtype, &envelope));
            },
            _ => {
                return Err(DriverError::internal(format!(
                    "unexpected response type {rtype:?} for CONTINUE"
                )));
            },
        }
        Ok(())
    }

    /// Tell the server to abandon the remaining batches. Idempotent: a
    /// second call is a no-op. A late `CONTINUE`/`STOP` reply for this
    /// token arriving afterward is tolerated by the connection rather than
    /// treated as a protocol violation.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.buffer.clear();

        if !self.more {
            return Ok(());
        }
        if self.conn.conn_id().await != self.conn_id || !self.conn.is_open().await {
            return Ok(());
        }

        let payload = json!([QueryType::Stop as i32]);
        if !self.fetch_in_flight {
            self.conn
                .register_blocking(self.token, self.opts.clone())
                .await?;
        }
        self.conn.dispatch(self.token, &payload).await?;
        self.conn.mark_stopped(self.token).await;
        // Best-effort: we don't block waiting for the server's STOP ack.
        let _ = self.conn.wait(self.token, Some(Duration::from_millis(0))).await;
        Ok(())
    }

    /// Supplemented (SPEC_FULL.md §C): drain the entire remaining sequence
    /// into a `Vec`.
    pub async fn to_vec(mut self) -> Result<Vec<Value>> {
        let mut out = Vec::new();
        loop {
            match self.next(Wait::Forever).await {
                Ok(row) => out.push(row),
                Err(DriverError::StopIteration) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }
}
