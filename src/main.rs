// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::Arc;

use anyhow::{Context, Result};
use qconn::cfg::{cli::resolve_config_path, config::ConnectionOpts, logger::init_logger};
use qconn::conn::RunResult;
use qconn::reactor::TokioReactor;
use qconn::{Connection, Wait};
use serde_json::{json, Map};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = init_logger("tests/config_logger.yaml")
        .context("failed to initialize logger")?;

    let opts = resolve_config_path("config/qconn.yaml")
        .and_then(ConnectionOpts::load_from_file)
        .unwrap_or_else(|_| {
            tracing::warn!("no config/qconn.yaml found, using defaults");
            ConnectionOpts::default()
        });

    let reactor = Arc::new(TokioReactor);
    let conn = Connection::connect(opts, reactor).await?;
    info!("connected");

    qconn::global::set_default(Arc::clone(&conn)).await;

    let outcome = conn
        .run(json!("hello"), Map::new(), None)
        .await
        .context("query failed")?;

    match outcome.result {
        RunResult::Atom(value) => info!(?value, "atom result"),
        RunResult::Cursor(mut cursor) => {
            while let Ok(row) = cursor.next(Wait::Forever).await {
                info!(?row, "row");
            }
        },
        RunResult::Noreply | RunResult::Dispatched => {},
    }

    conn.close(Default::default()).await?;
    Ok(())
}
