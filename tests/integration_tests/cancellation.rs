// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use qconn::DriverError;
use serde_json::{json, Map};
use tokio_util::sync::CancellationToken;

use super::common::connected_pair;

/// spec §5 "Cancellation & timeouts" / §9 design note: cancelling a
/// caller's blocking wait reconnects the connection with
/// `noreply_wait=false` and propagates the cancellation to the caller,
/// rather than hanging forever on a query the server never answers.
#[tokio::test]
async fn cancelling_a_blocked_wait_reconnects_and_propagates() -> Result<()> {
    let (conn, server) = connected_pair().await?;
    let before = conn.conn_id().await;

    let cancel = CancellationToken::new();
    let waiter = {
        let conn = Arc::clone(&conn);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            conn.run_cancellable(json!({"op": "hang"}), Map::new(), None, Some(cancel))
                .await
        })
    };

    // Give the request time to land before aborting the wait.
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let result = waiter.await.expect("join");
    let err = result.expect_err("a cancelled wait must surface as an error, not hang");
    assert!(matches!(err, DriverError::Cancelled));

    assert!(conn.conn_id().await > before, "cancellation should have triggered a reconnect");
    assert!(conn.is_open().await, "connection should be open again after reconnect");

    conn.close(Default::default()).await?;
    server.kill();
    Ok(())
}
