// SPDX-License-Identifier: AGPL-3.0-or-later

use anyhow::Result;
use qconn::conn::RunResult;
use serde_json::{json, Map};

use super::common::connected_pair;

#[tokio::test]
async fn atom_query_returns_the_value() -> Result<()> {
    let (conn, server) = connected_pair().await?;

    let outcome = conn
        .run(json!({"op": "atom", "value": 42}), Map::new(), None)
        .await?;

    match outcome.result {
        RunResult::Atom(value) => assert_eq!(value, json!(42)),
        _ => panic!("expected an atom result"),
    }

    conn.close(Default::default()).await?;
    server.kill();
    Ok(())
}

#[tokio::test]
async fn plain_sequence_is_a_one_shot_cursor() -> Result<()> {
    let (conn, server) = connected_pair().await?;

    let outcome = conn
        .run(json!({"op": "sequence", "rows": [1, 2, 3]}), Map::new(), None)
        .await?;

    let rows = match outcome.result {
        RunResult::Cursor(cursor) => cursor.to_vec().await?,
        _ => panic!("expected a cursor result"),
    };
    assert_eq!(rows, vec![json!(1), json!(2), json!(3)]);

    conn.close(Default::default()).await?;
    server.kill();
    Ok(())
}

#[tokio::test]
async fn server_errors_surface_as_driver_errors() -> Result<()> {
    let (conn, server) = connected_pair().await?;

    let err = conn
        .run(
            json!({"op": "error", "kind": "runtime", "message": "division by zero"}),
            Map::new(),
            None,
        )
        .await
        .expect_err("server error should surface as Err");

    match err {
        qconn::DriverError::Server { kind, message, .. } => {
            assert_eq!(kind, qconn::error::ServerErrorKind::Runtime);
            assert_eq!(message, "division by zero");
        },
        other => panic!("expected a Server error, got {other:?}"),
    }

    conn.close(Default::default()).await?;
    server.kill();
    Ok(())
}
