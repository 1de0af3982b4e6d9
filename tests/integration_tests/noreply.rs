// SPDX-License-Identifier: AGPL-3.0-or-later

use anyhow::Result;
use qconn::conn::RunResult;
use serde_json::{json, Map};

use super::common::connected_pair;

#[tokio::test]
async fn noreply_query_registers_no_waiter_and_returns_nothing() -> Result<()> {
    let (conn, server) = connected_pair().await?;

    let mut opts = Map::new();
    opts.insert("noreply".to_string(), json!(true));
    let outcome = conn.run(json!({"op": "noreply"}), opts, None).await?;
    assert!(matches!(outcome.result, RunResult::Noreply));

    // A later noreply_wait on the same connection completes once the server
    // has drained the noreply query (spec §8 scenario 4).
    conn.noreply_wait().await?;

    conn.close(Default::default()).await?;
    server.kill();
    Ok(())
}

#[tokio::test]
async fn server_info_returns_an_atom() -> Result<()> {
    let (conn, server) = connected_pair().await?;

    let info = conn.server_info().await?;
    assert!(info.get("name").is_some());

    conn.close(Default::default()).await?;
    server.kill();
    Ok(())
}
