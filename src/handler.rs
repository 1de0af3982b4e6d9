// SPDX-License-Identifier: AGPL-3.0-or-later

//! Reactive handler dispatch (spec §3 "Handler", §4.7 "Handler dispatch").
//!
//! A `Handler` is a capability record: a trait with a default no-op body
//! for every callback, so implementors override only what they care about
//! (spec §9 design note: "no inheritance required: tagged variants or
//! trait-with-defaults both work").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::error::DriverError;
use crate::proto::{ResponseEnvelope, ResponseNote, ResponseType};
use crate::reactor::Reactor;

/// Capability sink the core invokes a subset of, depending on response
/// shape. `on_open`/`on_close` idempotency is enforced by the core (see
/// `HandlerState`), not by implementors.
pub trait Handler: Send + Sync {
    fn on_open(&self) {}
    fn on_close(&self) {}
    fn on_wait_complete(&self) {}

    /// Generic fallback invoked by the default `on_array`/`on_atom` bodies.
    fn on_val(&self, _value: &Value) {}
    fn on_array(&self, value: &Value) {
        self.on_val(value);
    }
    fn on_atom(&self, value: &Value) {
        self.on_val(value);
    }

    fn on_stream_val(&self, _row: &Value) {}
    fn on_change(&self, _old_val: &Value, _new_val: &Value) {}
    fn on_initial_val(&self, _new_val: &Value) {}
    fn on_change_error(&self, _error: &Value) {}
    fn on_state(&self, _state: &Value) {}
    fn on_unrecognized_change(&self, _row: &Value) {}

    fn on_error(&self, _error: &DriverError) {}

    /// Request that the driver stop delivering further callbacks to this
    /// handler. Implementors needing this should back it with an
    /// `AtomicBool`; the default is a no-op.
    fn stop(&self) {}
    fn stopped(&self) -> bool {
        false
    }

    /// True if this handler overrides `on_state`, in which case the driver
    /// merges `include_states: true` into the outgoing options (spec §4.7).
    fn wants_states(&self) -> bool {
        false
    }
}

/// Wraps a registered handler with the idempotency bookkeeping the core is
/// responsible for (spec §3: "the core enforces idempotency by tracking
/// opened/closed flags per handler").
pub struct HandlerState {
    pub handler: Arc<dyn Handler>,
    opened: AtomicBool,
    closed: AtomicBool,
}

impl HandlerState {
    pub fn new(handler: Arc<dyn Handler>) -> Self {
        Self {
            handler,
            opened: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    fn open_idempotent(&self) {
        if !self.opened.swap(true, Ordering::SeqCst) {
            self.handler.on_open();
        }
    }

    fn close_idempotent(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.handler.on_close();
        }
    }
}

/// Classify and route one response frame to `state`'s handler, per spec
/// §4.7. Schedules the actual callback invocations on `reactor` so user
/// code never runs under the connection lock.
///
/// Returns `true` if the handler should remain registered for the same
/// token (a `SUCCESS_PARTIAL` batch still has more to come).
pub(crate) fn dispatch(
    state: Arc<HandlerState>,
    reactor: Arc<dyn Reactor>,
    outcome: std::result::Result<ResponseEnvelope, DriverError>,
) -> bool {
    let envelope = match outcome {
        Ok(env) => env,
        Err(e) => {
            reactor.schedule(Box::new(move || {
                state.open_idempotent();
                state.handler.on_error(&e);
                state.close_idempotent();
            }));
            return false;
        },
    };

    let Some(rtype) = envelope.response_type() else {
        // Unrecognized response type: treat as a protocol-level error.
        let e = DriverError::internal(format!("unrecognized response type {}", envelope.t));
        reactor.schedule(Box::new(move || {
            state.open_idempotent();
            state.handler.on_error(&e);
            state.close_idempotent();
        }));
        return false;
    };

    let more = matches!(rtype, ResponseType::SuccessPartial);
    let is_feed = envelope
        .n
        .iter()
        .filter_map(|n| ResponseNote::from_i32(*n))
        .any(ResponseNote::is_feed);

    reactor.schedule(Box::new(move || {
        if state.handler.stopped() {
            return;
        }
        dispatch_on_reactor(&state, rtype, is_feed, &envelope);
    }));

    more
}

fn dispatch_on_reactor(
    state: &Arc<HandlerState>,
    rtype: ResponseType,
    is_feed: bool,
    envelope: &ResponseEnvelope,
) {
    match rtype {
        ResponseType::SuccessPartial | ResponseType::SuccessSequence => {
            state.open_idempotent();
            for row in &envelope.r {
                if state.handler.stopped() {
                    break;
                }
                if is_feed {
                    route_change_feed_row(&state.handler, row);
                } else {
                    state.handler.on_stream_val(row);
                }
            }
            if rtype == ResponseType::SuccessSequence {
                state.close_idempotent();
            }
        },
        ResponseType::SuccessAtom => {
            state.open_idempotent();
            if let Some(value) = envelope.r.first() {
                if value.is_array() {
                    state.handler.on_array(value);
                } else {
                    state.handler.on_atom(value);
                }
            }
            state.close_idempotent();
        },
        ResponseType::WaitComplete => {
            state.open_idempotent();
            state.handler.on_wait_complete();
            state.close_idempotent();
        },
        ResponseType::ClientError | ResponseType::CompileError | ResponseType::RuntimeError => {
            state.open_idempotent();
            let kind = match rtype {
                ResponseType::ClientError => crate::error::ServerErrorKind::Client,
                ResponseType::CompileError => crate::error::ServerErrorKind::Compile,
                _ => crate::error::ServerErrorKind::Runtime,
            };
            let message = envelope
                .r
                .first()
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let e = DriverError::Server {
                kind,
                message,
                backtrace: envelope.b.clone(),
            };
            state.handler.on_error(&e);
            state.close_idempotent();
        },
    }
}

fn route_change_feed_row(handler: &Arc<dyn Handler>, row: &Value) {
    let new_val = row.get("new_val");
    let old_val = row.get("old_val");
    if let (Some(old), Some(new)) = (old_val, new_val) {
        handler.on_change(old, new);
    } else if let Some(new) = new_val {
        handler.on_initial_val(new);
    } else if let Some(error) = row.get("error") {
        handler.on_change_error(error);
    } else if let Some(state) = row.get("state") {
        handler.on_state(state);
    } else {
        handler.on_unrecognized_change(row);
    }
}

/// Deliver the connection-teardown notification to a still-registered
/// handler (spec §4.7: "Null response ... `on_close_idempotent` only").
pub(crate) fn dispatch_teardown(state: Arc<HandlerState>, reactor: Arc<dyn Reactor>) {
    reactor.schedule(Box::new(move || {
        state.close_idempotent();
    }));
}
