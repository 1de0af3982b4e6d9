// SPDX-License-Identifier: AGPL-3.0-or-later

//! Wire protocol: handshake, framing, constants, and per-query options.

pub mod constants;
pub mod frame;
pub mod handshake;
pub mod opts;

pub use constants::{QueryType, ResponseNote, ResponseType};
pub use frame::ResponseEnvelope;
pub use opts::{FormatPref, PerTokenOpts};
