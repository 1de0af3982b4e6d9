// SPDX-License-Identifier: AGPL-3.0-or-later

//! Wire-level constants (spec §4.1, §6).

/// Handshake magic identifying the V0.4 handshake dance.
pub const VERSION_MAGIC: u32 = 0x400c_2d20;

/// Handshake wire-protocol selector: JSON framing.
pub const WIRE_PROTOCOL_JSON: u32 = 0x7e6970c7;

/// Handshake success marker. The server's NUL-terminated reply must equal
/// this string for the connection to be considered ready.
pub const HANDSHAKE_SUCCESS: &str = "SUCCESS";

/// Upper bound on the handshake reply length, guarding against a
/// misbehaving peer that never sends the NUL terminator.
pub const HANDSHAKE_REPLY_MAX_LEN: usize = 8 * 1024;

/// `query_type` values making up the first element of the request payload
/// triple `[query_type, body?, opts?]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum QueryType {
    Start = 1,
    Continue = 2,
    Stop = 3,
    NoreplyWait = 4,
    /// Supplemented: a trivial server-identity query (§SPEC_FULL.md C).
    ServerInfo = 5,
}

/// `t` field of the response envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ResponseType {
    SuccessAtom = 1,
    SuccessSequence = 2,
    SuccessPartial = 3,
    WaitComplete = 4,
    ClientError = 16,
    CompileError = 17,
    RuntimeError = 18,
}

impl ResponseType {
    pub fn from_i32(v: i32) -> Option<Self> {
        Some(match v {
            1 => ResponseType::SuccessAtom,
            2 => ResponseType::SuccessSequence,
            3 => ResponseType::SuccessPartial,
            4 => ResponseType::WaitComplete,
            16 => ResponseType::ClientError,
            17 => ResponseType::CompileError,
            18 => ResponseType::RuntimeError,
            _ => return None,
        })
    }

    pub fn is_error(self) -> bool {
        matches!(
            self,
            ResponseType::ClientError | ResponseType::CompileError | ResponseType::RuntimeError
        )
    }
}

/// Entries that may appear in a response's `n` (notes) array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ResponseNote {
    SequenceFeed = 1,
    AtomFeed = 2,
    OrderByLimitFeed = 3,
    UnionedFeed = 4,
}

impl ResponseNote {
    pub fn from_i32(v: i32) -> Option<Self> {
        Some(match v {
            1 => ResponseNote::SequenceFeed,
            2 => ResponseNote::AtomFeed,
            3 => ResponseNote::OrderByLimitFeed,
            4 => ResponseNote::UnionedFeed,
            _ => return None,
        })
    }

    /// True if this note marks the row stream as change-feed events rather
    /// than plain values (spec §4.7).
    pub fn is_feed(self) -> bool {
        matches!(
            self,
            ResponseNote::SequenceFeed
                | ResponseNote::AtomFeed
                | ResponseNote::OrderByLimitFeed
                | ResponseNote::UnionedFeed
        )
    }
}
