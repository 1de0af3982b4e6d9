// SPDX-License-Identifier: AGPL-3.0-or-later

pub mod cfg;
pub mod conn;
pub mod cursor;
pub mod error;
pub mod global;
pub mod handler;
pub mod proto;
pub mod reactor;

pub use conn::{CloseOpts, Connection, QueryOutcome, RunResult};
pub use cursor::{Cursor, Wait};
pub use error::{DriverError, Result};
pub use handler::Handler;
pub use reactor::{Reactor, TokioReactor};
