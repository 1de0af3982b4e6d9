// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use qconn::conn::RunResult;
use qconn::error::DriverError;
use qconn::Handler;
use serde_json::{json, Map, Value};

use super::common::connected_pair;

#[derive(Default)]
struct RecordingHandler {
    events: Mutex<Vec<Value>>,
    closed: tokio::sync::Notify,
}

impl Handler for RecordingHandler {
    fn on_initial_val(&self, new_val: &Value) {
        self.events.lock().expect("events lock").push(json!({"initial": new_val}));
    }

    fn on_change(&self, old_val: &Value, new_val: &Value) {
        self.events
            .lock()
            .expect("events lock")
            .push(json!({"old": old_val, "new": new_val}));
    }

    fn on_state(&self, state: &Value) {
        self.events.lock().expect("events lock").push(json!({"state": state}));
    }

    fn on_error(&self, error: &DriverError) {
        self.events.lock().expect("events lock").push(json!({"error": error.to_string()}));
    }

    fn on_close(&self) {
        self.closed.notify_one();
    }
}

#[tokio::test]
async fn change_feed_rows_are_classified_and_delivered() -> Result<()> {
    let (conn, server) = connected_pair().await?;

    let handler = Arc::new(RecordingHandler::default());
    let batches = json!([
        [{"state": "ready"}],
        [{"new_val": {"id": 1, "v": "a"}}],
        [{"old_val": {"id": 1, "v": "a"}, "new_val": {"id": 1, "v": "b"}}],
    ]);

    let outcome = conn
        .run(json!({"op": "changefeed", "batches": batches}), Map::new(), Some(handler.clone()))
        .await?;
    assert!(matches!(outcome.result, RunResult::Dispatched));

    // Reactive delivery happens on the reactor; give it a moment to drain
    // all three pushed batches.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let events = handler.events.lock().expect("events lock").clone();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0], json!({"state": "ready"}));
    assert_eq!(events[1], json!({"initial": {"id": 1, "v": "a"}}));
    assert_eq!(events[2], json!({"old": {"id": 1, "v": "a"}, "new": {"id": 1, "v": "b"}}));

    conn.close(Default::default()).await?;
    server.kill();
    Ok(())
}
