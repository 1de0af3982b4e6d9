// SPDX-License-Identifier: AGPL-3.0-or-later

//! Connection lifecycle (spec §4.5): connect/handshake, dispatch, wait,
//! close, reconnect — the public entry point for the rest of the crate.

mod reader;
mod token;
pub(crate) mod waiter;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use crate::cfg::config::ConnectionOpts;
use crate::cursor::Cursor;
use crate::error::{DriverError, Result, ServerErrorKind};
use crate::handler::{Handler, HandlerState};
use crate::proto::frame::{encode_request, ResponseEnvelope};
use crate::proto::handshake::perform_handshake;
use crate::proto::{PerTokenOpts, QueryType, ResponseType};
use crate::reactor::Reactor;
use token::TokenAllocator;
use waiter::{RecentStops, Waiter, WaiterMap};

/// Grace-period window (spec §9 open question) for tolerating late
/// responses to tokens a `Cursor::close` has already `STOP`ped.
const RECENT_STOPS_CAPACITY: usize = 4096;

/// The shaped result of a synchronous `run()` call (spec §4.5 step 6).
pub enum RunResult {
    Atom(Value),
    Cursor(Cursor),
    /// `noreply` query: no waiter was registered, nothing to shape.
    Noreply,
    /// Reactive path: a handler was supplied, results arrive via callbacks.
    Dispatched,
}

pub struct QueryOutcome {
    pub result: RunResult,
    pub profile: Option<Value>,
}

#[derive(Debug, Clone, Copy)]
pub struct CloseOpts {
    pub noreply_wait: bool,
}

impl Default for CloseOpts {
    fn default() -> Self {
        CloseOpts { noreply_wait: true }
    }
}

pub(crate) struct SharedState {
    pub(crate) waiters: WaiterMap,
    pub(crate) pending: HashMap<u64, std::result::Result<ResponseEnvelope, DriverError>>,
    pub(crate) opts: HashMap<u64, PerTokenOpts>,
    pub(crate) tokens: TokenAllocator,
    pub(crate) conn_id: u64,
    pub(crate) open: bool,
    pub(crate) default_db: Option<Value>,
    pub(crate) recent_stops: RecentStops,
}

impl SharedState {
    fn closed() -> Self {
        SharedState {
            waiters: HashMap::new(),
            pending: HashMap::new(),
            opts: HashMap::new(),
            tokens: TokenAllocator::default(),
            conn_id: 0,
            open: false,
            default_db: None,
            recent_stops: RecentStops::new(RECENT_STOPS_CAPACITY),
        }
    }

    fn reset_for_connect(&mut self) {
        self.waiters.clear();
        self.pending.clear();
        self.opts.clear();
        self.tokens.reset();
        self.conn_id += 1;
        self.open = true;
        self.recent_stops = RecentStops::new(RECENT_STOPS_CAPACITY);
    }
}

/// The public lifecycle object: connect/handshake, dispatch, wait, close,
/// reconnect (spec §3 "Connection").
pub struct Connection {
    opts: ConnectionOpts,
    state: Mutex<SharedState>,
    notify: Notify,
    writer: Mutex<Option<OwnedWriteHalf>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    reader_cancel: Mutex<Option<CancellationToken>>,
    reactor: Arc<dyn Reactor>,
}

impl Connection {
    /// Open a TCP connection, perform the handshake, and start the reader
    /// task (spec §4.5 `connect()`).
    #[instrument(skip(opts, reactor), fields(host = %opts.host, port = opts.port))]
    pub async fn connect(opts: ConnectionOpts, reactor: Arc<dyn Reactor>) -> Result<Arc<Self>> {
        let conn = Arc::new(Connection {
            opts,
            state: Mutex::new(SharedState::closed()),
            notify: Notify::new(),
            writer: Mutex::new(None),
            reader_task: Mutex::new(None),
            reader_cancel: Mutex::new(None),
            reactor,
        });
        conn.connect_internal().await?;
        Ok(conn)
    }

    async fn connect_internal(self: &Arc<Self>) -> Result<()> {
        {
            let state = self.state.lock().await;
            if state.open {
                return Err(DriverError::internal("connect called on an already-open connection"));
            }
        }

        let mut stream = TcpStream::connect((self.opts.host.as_str(), self.opts.port))
            .await
            .map_err(|e| DriverError::Handshake(format!("tcp connect to {}:{} failed: {e}", self.opts.host, self.opts.port)))?;

        perform_handshake(&mut stream, self.opts.auth_key.as_bytes(), self.opts.timeout).await?;

        let (read_half, write_half) = stream.into_split();

        {
            let mut state = self.state.lock().await;
            state.reset_for_connect();
            debug!(conn_id = state.conn_id, "connection established");
        }
        *self.writer.lock().await = Some(write_half);

        let cancel = CancellationToken::new();
        *self.reader_cancel.lock().await = Some(cancel.clone());

        let reader_conn = Arc::clone(self);
        let handle = tokio::spawn(async move {
            reader::run_reader_loop(reader_conn, read_half, cancel).await;
        });
        *self.reader_task.lock().await = Some(handle);

        Ok(())
    }

    pub async fn is_open(&self) -> bool {
        self.state.lock().await.open
    }

    pub async fn conn_id(&self) -> u64 {
        self.state.lock().await.conn_id
    }

    /// Set the default database term injected into every subsequent
    /// query's options (spec §4.5 `use(db)`).
    pub async fn use_db(&self, db: impl Into<String>) {
        let mut state = self.state.lock().await;
        state.default_db = Some(Value::String(db.into()));
    }

    async fn default_opts_json(&self) -> Map<String, Value> {
        let state = self.state.lock().await;
        let mut m = Map::new();
        if let Some(db) = &state.default_db {
            m.insert("db".to_string(), db.clone());
        }
        m
    }

    fn register_waiter_locked(
        state: &mut SharedState,
        token: u64,
        waiter: Waiter,
        opts: PerTokenOpts,
    ) -> Result<()> {
        if state.waiters.contains_key(&token) {
            return Err(DriverError::internal(format!(
                "token {token} already registered"
            )));
        }
        state.waiters.insert(token, waiter);
        state.opts.insert(token, opts);
        Ok(())
    }

    /// Serialize and write one frame (spec §4.5 `dispatch`). Writes are
    /// serialized under a dedicated lock: the spec permits a weaker
    /// "one frame per call, single write-loop" guarantee, but a shared
    /// lock is simpler and strictly safer for multi-producer callers.
    pub(crate) async fn dispatch(&self, token: u64, payload: &Value) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let frame = encode_request(token, payload);
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(DriverError::ConnectionClosed)?;
        writer
            .write_all(&frame)
            .await
            .map_err(|e| DriverError::internal(format!("write failed: {e}")))?;
        Ok(())
    }

    /// The central entry point (spec §4.5 `run`).
    pub async fn run(
        self: &Arc<Self>,
        body: Value,
        call_opts: Map<String, Value>,
        handler: Option<Arc<dyn Handler>>,
    ) -> Result<QueryOutcome> {
        self.run_cancellable(body, call_opts, handler, None).await
    }

    /// Same as `run`, but the blocking wait for a response also races
    /// against `cancel` (spec §5 "Cancellation & timeouts": "interactive
    /// abort ... the connection reconnects with `noreply_wait=false` and
    /// the abort is re-raised to the caller"; spec §9 design note gives the
    /// non-interactive-language adaptation this implements). `cancel` is
    /// only consulted on the blocking path — the reactive (`handler`) and
    /// `noreply` branches never suspend in `wait`.
    #[instrument(skip(self, body, call_opts, handler, cancel))]
    pub async fn run_cancellable(
        self: &Arc<Self>,
        body: Value,
        call_opts: Map<String, Value>,
        handler: Option<Arc<dyn Handler>>,
        cancel: Option<CancellationToken>,
    ) -> Result<QueryOutcome> {
        if self.opts.auto_reconnect && !self.is_open().await {
            self.reconnect(CloseOpts { noreply_wait: false }).await?;
        }
        if !self.is_open().await {
            return Err(DriverError::ConnectionClosed);
        }

        let defaults = self.default_opts_json().await;
        let mut per_token = PerTokenOpts::merge(&defaults, &call_opts)?;
        if let Some(h) = &handler
            && h.wants_states()
        {
            per_token.include_states = true;
        }

        let token = {
            let mut state = self.state.lock().await;
            state.tokens.alloc()
        };
        let payload = json!([QueryType::Start as i32, body, per_token.to_json()]);

        if let Some(h) = handler {
            let hs = Arc::new(HandlerState::new(h));
            {
                let mut state = self.state.lock().await;
                Self::register_waiter_locked(&mut state, token, Waiter::Callback(hs), per_token)?;
            }
            self.dispatch(token, &payload).await?;
            // Reactive path: register with the EM_Guard so a reactor
            // shutdown drops our callback waiters instead of invoking them
            // on a dead reactor (spec §5 "Reactor integration").
            crate::reactor::register_for_shutdown(Arc::clone(self));
            return Ok(QueryOutcome {
                result: RunResult::Dispatched,
                profile: None,
            });
        }

        if per_token.noreply {
            self.dispatch(token, &payload).await?;
            return Ok(QueryOutcome {
                result: RunResult::Noreply,
                profile: None,
            });
        }

        {
            let mut state = self.state.lock().await;
            Self::register_waiter_locked(&mut state, token, Waiter::Blocking, per_token.clone())?;
        }
        self.dispatch(token, &payload).await?;
        let envelope = self.wait_cancellable(token, None, cancel).await?;
        let conn_id = self.conn_id().await;
        self.shape_result(conn_id, token, envelope, per_token).await
    }

    async fn shape_result(
        self: &Arc<Self>,
        conn_id: u64,
        token: u64,
        envelope: ResponseEnvelope,
        per_token: PerTokenOpts,
    ) -> Result<QueryOutcome> {
        let Some(rtype) = envelope.response_type() else {
            return Err(DriverError::internal(format!(
                "unrecognized response type {}",
                envelope.t
            )));
        };
        if rtype.is_error() {
            return Err(envelope_error(rtype, &envelope));
        }

        let profile = envelope.p.clone();
        let result = match rtype {
            ResponseType::SuccessPartial => RunResult::Cursor(
                Cursor::new(Arc::clone(self), conn_id, token, per_token, envelope.r, true).await?,
            ),
            ResponseType::SuccessSequence => RunResult::Cursor(
                Cursor::new(Arc::clone(self), conn_id, token, per_token, envelope.r, false).await?,
            ),
            ResponseType::WaitComplete => RunResult::Noreply,
            ResponseType::SuccessAtom => {
                RunResult::Atom(envelope.r.into_iter().next().unwrap_or(Value::Null))
            },
            ResponseType::ClientError | ResponseType::CompileError | ResponseType::RuntimeError => {
                unreachable!("error responses are handled above")
            },
        };
        Ok(QueryOutcome { result, profile })
    }

    /// Block (this task) until `token`'s response arrives, or until
    /// `wait_timeout` elapses (spec §4.5 `wait`).
    pub(crate) async fn wait(
        self: &Arc<Self>,
        token: u64,
        wait_timeout: Option<Duration>,
    ) -> Result<ResponseEnvelope> {
        self.wait_cancellable(token, wait_timeout, None).await
    }

    /// Same as `wait`, but also races the suspension against `cancel`: on
    /// cancellation the connection is reconnected with
    /// `noreply_wait=false` and the cancellation is propagated to the
    /// caller as `DriverError::Cancelled` (spec §5, §9).
    pub(crate) async fn wait_cancellable(
        self: &Arc<Self>,
        token: u64,
        wait_timeout: Option<Duration>,
        cancel: Option<CancellationToken>,
    ) -> Result<ResponseEnvelope> {
        let deadline = wait_timeout.map(|d| Instant::now() + d);
        loop {
            // Create the notification future before inspecting shared state
            // so a response delivered right after our check is not missed
            // (spec §9 design note: guard against spurious/missed wakeups
            // by re-checking the pending map on every wakeup).
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                if let Some(result) = state.pending.remove(&token) {
                    state.waiters.remove(&token);
                    return result;
                }
                if !state.open {
                    state.waiters.remove(&token);
                    return Err(DriverError::ConnectionClosed);
                }
            }

            let timed_wait = async {
                match deadline {
                    None => {
                        notified.await;
                        Ok(())
                    },
                    Some(dl) => {
                        let now = Instant::now();
                        if now >= dl {
                            return Err(DriverError::Timeout);
                        }
                        match timeout(dl - now, notified).await {
                            Ok(()) => Ok(()),
                            Err(_) => Err(DriverError::Timeout),
                        }
                    },
                }
            };

            match &cancel {
                Some(cancel_token) => {
                    tokio::select! {
                        _ = cancel_token.cancelled() => {
                            let _ = self.reconnect(CloseOpts { noreply_wait: false }).await;
                            return Err(DriverError::Cancelled);
                        },
                        result = timed_wait => result?,
                    }
                },
                None => timed_wait.await?,
            }
        }
    }

    /// Delivers one decoded response frame to its waiter (spec §4.4
    /// `note_data`). Returns `false` if the reader loop must stop (a
    /// protocol violation that is fatal outside the tolerated grace
    /// window).
    pub(crate) async fn note_data(
        self: &Arc<Self>,
        token: u64,
        outcome: std::result::Result<ResponseEnvelope, DriverError>,
    ) -> bool {
        let waiter = {
            let mut state = self.state.lock().await;
            state.waiters.remove(&token)
        };

        match waiter {
            Some(Waiter::Blocking) => {
                let mut state = self.state.lock().await;
                state.pending.insert(token, outcome);
                drop(state);
                self.notify.notify_waiters();
                true
            },
            Some(Waiter::Callback(hs)) => {
                let keep = crate::handler::dispatch(Arc::clone(&hs), Arc::clone(&self.reactor), outcome);
                if keep {
                    {
                        let mut state = self.state.lock().await;
                        state.waiters.insert(token, Waiter::Callback(hs));
                    }
                    // A reactive subscription has no external Cursor to pump
                    // it, so the driver re-requests the next batch itself
                    // (spec §4.7: callback dispatch keeps the stream live).
                    let _ = self.dispatch(token, &json!([QueryType::Continue as i32])).await;
                }
                true
            },
            None => {
                let tolerated = {
                    let state = self.state.lock().await;
                    state.recent_stops.contains(token)
                };
                if tolerated {
                    trace!(token, "dropping late response for a stopped token");
                    true
                } else {
                    self.on_reader_fatal(&format!("unexpected token {token}")).await;
                    false
                }
            },
        }
    }

    /// Fan a reader failure out to every outstanding waiter as a synthetic
    /// CLIENT_ERROR and clear the reader handle (spec §4.4). The socket is
    /// left alone; `close()` completes teardown.
    pub(crate) async fn on_reader_fatal(self: &Arc<Self>, message: &str) {
        let waiters = {
            let mut state = self.state.lock().await;
            std::mem::take(&mut state.waiters)
        };
        *self.reader_task.lock().await = None;
        *self.reader_cancel.lock().await = None;

        let synthetic = ResponseEnvelope::synthetic_client_error(message);
        for (token, waiter) in waiters {
            match waiter {
                Waiter::Blocking => {
                    let mut state = self.state.lock().await;
                    state.pending.insert(token, Ok(synthetic.clone()));
                },
                Waiter::Callback(hs) => {
                    crate::handler::dispatch(hs, Arc::clone(&self.reactor), Ok(synthetic.clone()));
                },
            }
        }
        self.notify.notify_waiters();
    }

    pub(crate) async fn drop_callback_waiters(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        state.waiters.retain(|_, w| !matches!(w, Waiter::Callback(_)));
    }

    /// Register that `token` was just `STOP`ped, so a late response for it
    /// is tolerated rather than treated as a protocol violation.
    pub(crate) async fn mark_stopped(&self, token: u64) {
        let mut state = self.state.lock().await;
        state.recent_stops.mark(token);
    }

    pub(crate) async fn register_blocking(&self, token: u64, opts: PerTokenOpts) -> Result<()> {
        let mut state = self.state.lock().await;
        Self::register_waiter_locked(&mut state, token, Waiter::Blocking, opts)
    }

    pub(crate) async fn alloc_token(&self) -> u64 {
        let mut state = self.state.lock().await;
        state.tokens.alloc()
    }

    /// `opts.noreply_wait` defaults to `true`: drain the server, stop the
    /// reader, close the socket, and wake every outstanding waiter (spec
    /// §4.5 `close`).
    pub async fn close(self: &Arc<Self>, opts: CloseOpts) -> Result<()> {
        let was_open = self.is_open().await;
        if was_open && opts.noreply_wait {
            self.noreply_wait().await?;
        }

        if let Some(cancel) = self.reader_cancel.lock().await.take() {
            cancel.cancel();
        }
        *self.writer.lock().await = None;
        if let Some(handle) = self.reader_task.lock().await.take() {
            let _ = handle.await;
        }

        let waiters = {
            let mut state = self.state.lock().await;
            state.open = false;
            state.opts.clear();
            state.pending.clear();
            std::mem::take(&mut state.waiters)
        };
        for (_, waiter) in waiters {
            if let Waiter::Callback(hs) = waiter {
                crate::handler::dispatch_teardown(hs, Arc::clone(&self.reactor));
            }
        }
        self.notify.notify_waiters();
        crate::reactor::unregister_for_shutdown(self);
        Ok(())
    }

    /// `close()` then `connect()`; increments `conn_id` so outstanding
    /// Cursors observe staleness (spec §4.5 `reconnect`).
    pub async fn reconnect(self: &Arc<Self>, opts: CloseOpts) -> Result<()> {
        self.close(opts).await?;
        self.connect_internal().await
    }

    /// Synchronous `NOREPLY_WAIT` query; any response other than
    /// `WAIT_COMPLETE` is a protocol error (spec §4.5 `noreply_wait`).
    pub async fn noreply_wait(self: &Arc<Self>) -> Result<()> {
        let token = self.alloc_token().await;
        let payload = json!([QueryType::NoreplyWait as i32, Value::Null, Value::Object(Map::new())]);
        self.register_blocking(token, PerTokenOpts::default()).await?;
        self.dispatch(token, &payload).await?;
        let envelope = self.wait(token, Some(self.opts.timeout)).await?;
        match envelope.response_type() {
            Some(ResponseType::WaitComplete) => Ok(()),
            _ => Err(DriverError::internal(
                "noreply_wait: server replied with an unexpected response type",
            )),
        }
    }

    /// Supplemented (SPEC_FULL.md §C): trivial server-identity query.
    pub async fn server_info(self: &Arc<Self>) -> Result<Value> {
        let token = self.alloc_token().await;
        let payload = json!([QueryType::ServerInfo as i32, Value::Null, Value::Object(Map::new())]);
        self.register_blocking(token, PerTokenOpts::default()).await?;
        self.dispatch(token, &payload).await?;
        let envelope = self.wait(token, Some(self.opts.timeout)).await?;
        match envelope.response_type() {
            Some(ResponseType::SuccessAtom) => Ok(envelope.r.into_iter().next().unwrap_or(Value::Null)),
            Some(rtype) if rtype.is_error() => Err(envelope_error(rtype, &envelope)),
            _ => Err(DriverError::internal("server_info: unexpected response type")),
        }
    }
}

pub(crate) fn envelope_error(rtype: ResponseType, envelope: &ResponseEnvelope) -> DriverError {
    let kind = match rtype {
        ResponseType::ClientError => ServerErrorKind::Client,
        ResponseType::CompileError => ServerErrorKind::Compile,
        _ => ServerErrorKind::Runtime,
    };
    let message = envelope
        .r
        .first()
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    DriverError::Server {
        kind,
        message,
        backtrace: envelope.b.clone(),
    }
}
