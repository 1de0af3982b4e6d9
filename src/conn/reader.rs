// SPDX-License-Identifier: AGPL-3.0-or-later

//! The reader task (spec §4.4): a single task per connection that owns the
//! read half of the socket, decodes frames, and delivers each to its
//! waiter via `Connection::note_data`.

use std::sync::Arc;

use tokio::net::tcp::OwnedReadHalf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::Connection;
use crate::proto::frame::read_response_frame;

pub(crate) async fn run_reader_loop(
    conn: Arc<Connection>,
    mut read_half: OwnedReadHalf,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("reader: cancelled by close()");
                return;
            },
            result = read_response_frame(&mut read_half) => {
                match result {
                    Ok(Some((token, envelope))) => {
                        if !conn.note_data(token, Ok(envelope)).await {
                            return;
                        }
                    },
                    Ok(None) => {
                        debug!("reader: connection closed by peer");
                        conn.on_reader_fatal("connection closed by peer").await;
                        return;
                    },
                    Err(e) => {
                        warn!("reader: fatal error decoding frame: {e}");
                        conn.on_reader_fatal(&e.to_string()).await;
                        return;
                    },
                }
            },
        }
    }
}
