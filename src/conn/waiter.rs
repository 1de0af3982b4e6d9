// SPDX-License-Identifier: AGPL-3.0-or-later

//! Waiter table (spec §4.3): `token -> Waiter`.
//!
//! Mutation and delivery happen under the connection's single `SharedState`
//! mutex (see `conn::mod`); this module only holds the data shapes.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::handler::HandlerState;

/// One registered waiter. A missing entry models the spec's `Noreply`
/// variant — there is simply nothing to look up.
pub(crate) enum Waiter {
    /// Awaited by exactly one caller suspended in `Connection::wait`.
    Blocking,
    /// Invoked by the reader on the reactor thread.
    Callback(Arc<HandlerState>),
}

/// Bounded FIFO of recently-`STOP`ped tokens, used to tolerate late
/// `CONTINUE`/`STOP` replies that arrive after a Cursor has already been
/// closed and its waiter entry removed (spec §9, open question: recommends
/// "(a) tolerate unknown-token responses ... for a bounded grace period").
pub(crate) struct RecentStops {
    order: VecDeque<u64>,
    set: std::collections::HashSet<u64>,
    capacity: usize,
}

impl RecentStops {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            set: std::collections::HashSet::with_capacity(capacity),
            capacity,
        }
    }

    pub(crate) fn mark(&mut self, token: u64) {
        if self.set.insert(token) {
            self.order.push_back(token);
            if self.order.len() > self.capacity
                && let Some(oldest) = self.order.pop_front()
            {
                self.set.remove(&oldest);
            }
        }
    }

    pub(crate) fn contains(&self, token: u64) -> bool {
        self.set.contains(&token)
    }
}

pub(crate) type WaiterMap = HashMap<u64, Waiter>;
