// SPDX-License-Identifier: AGPL-3.0-or-later

//! An in-process fake server speaking just enough of the wire protocol to
//! drive the connection core's integration tests without a real database
//! behind it. Lives only under `tests/`: nothing in `src/` depends on it.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub struct StubServer {
    pub addr: SocketAddr,
    task: JoinHandle<()>,
}

impl StubServer {
    /// Bind an ephemeral local port and serve connections, one at a time,
    /// until aborted.
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("bind stub listener")?;
        let addr = listener.local_addr().context("local_addr")?;

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let _ = serve(stream).await;
                    },
                    Err(_) => return,
                }
            }
        });

        Ok(StubServer { addr, task })
    }

    /// Kill the server task outright, dropping any open connection without
    /// a clean shutdown — used to exercise reader-failure handling.
    pub fn kill(self) {
        self.task.abort();
    }
}

async fn serve(mut stream: TcpStream) -> Result<()> {
    server_handshake(&mut stream).await?;

    let mut pending: HashMap<u64, VecDeque<Value>> = HashMap::new();
    // Tokens whose first CONTINUE should be delayed before answering, used
    // to exercise Cursor timeout-then-retry (spec §8 scenario 5).
    let mut slow_continue: HashMap<u64, (std::time::Duration, Value)> = HashMap::new();

    loop {
        let Some((token, request)) = read_request_frame(&mut stream).await? else {
            return Ok(());
        };

        let query_type = request.first().and_then(Value::as_i64).unwrap_or(0);
        match query_type {
            1 => {
                let body = request.get(1).cloned().unwrap_or(Value::Null);
                if body.get("op").and_then(Value::as_str) == Some("slow") {
                    slow_continue.insert(
                        token,
                        (std::time::Duration::from_millis(250), json!({"t": 2, "r": [99]})),
                    );
                    write_envelope(&mut stream, token, json!({"t": 3, "r": []})).await?;
                    continue;
                }
                let mut batches = script_for(&body);
                if let Some(first) = batches.pop_front() {
                    if !batches.is_empty() {
                        pending.insert(token, batches);
                    }
                    write_envelope(&mut stream, token, first).await?;
                }
                // An empty script (the "noreply" op) means: send nothing.
            },
            2 => {
                if let Some((delay, envelope)) = slow_continue.remove(&token) {
                    tokio::time::sleep(delay).await;
                    write_envelope(&mut stream, token, envelope).await?;
                    continue;
                }
                let next = pending
                    .get_mut(&token)
                    .and_then(VecDeque::pop_front)
                    .unwrap_or_else(|| json!({"t": 2, "r": []}));
                if pending.get(&token).is_some_and(VecDeque::is_empty) {
                    pending.remove(&token);
                }
                write_envelope(&mut stream, token, next).await?;
            },
            3 => {
                pending.remove(&token);
                slow_continue.remove(&token);
            },
            4 => {
                write_envelope(&mut stream, token, json!({"t": 4, "r": []})).await?;
            },
            5 => {
                write_envelope(
                    &mut stream,
                    token,
                    json!({"t": 1, "r": [{"name": "stub", "proxy": false}]}),
                )
                .await?;
            },
            _ => {},
        }
    }
}

/// Interprets a test's request body (an object with an `"op"` key) into the
/// sequence of envelopes the stub will emit: the first for `START`, the
/// rest for successive `CONTINUE`s on the same token.
fn script_for(body: &Value) -> VecDeque<Value> {
    let mut out = VecDeque::new();
    match body.get("op").and_then(Value::as_str) {
        Some("atom") => {
            let value = body.get("value").cloned().unwrap_or(Value::Null);
            out.push_back(json!({"t": 1, "r": [value]}));
        },
        Some("sequence") => {
            let rows = body.get("rows").cloned().unwrap_or_else(|| json!([]));
            out.push_back(json!({"t": 2, "r": rows}));
        },
        Some("paged") => {
            let batches = body.get("batches").and_then(Value::as_array).cloned().unwrap_or_default();
            let last = batches.len().saturating_sub(1);
            for (i, batch) in batches.into_iter().enumerate() {
                let t = if i == last { 2 } else { 3 };
                out.push_back(json!({"t": t, "r": batch}));
            }
            if out.is_empty() {
                out.push_back(json!({"t": 2, "r": []}));
            }
        },
        Some("changefeed") => {
            let batches = body.get("batches").and_then(Value::as_array).cloned().unwrap_or_default();
            for batch in batches {
                out.push_back(json!({"t": 3, "n": [1], "r": batch}));
            }
        },
        Some("error") => {
            let t = match body.get("kind").and_then(Value::as_str) {
                Some("compile") => 17,
                Some("runtime") => 18,
                _ => 16,
            };
            let message = body.get("message").and_then(Value::as_str).unwrap_or("boom");
            out.push_back(json!({"t": t, "r": [message]}));
        },
        Some("noreply") => {},
        Some("hang") => {},
        _ => out.push_back(json!({"t": 1, "r": [Value::Null]})),
    }
    out
}

async fn server_handshake(stream: &mut TcpStream) -> Result<()> {
    let mut magic = [0u8; 4];
    stream.read_exact(&mut magic).await?;

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let auth_key_len = u32::from_le_bytes(len_buf) as usize;
    let mut auth_key = vec![0u8; auth_key_len];
    stream.read_exact(&mut auth_key).await?;

    let mut wire_protocol = [0u8; 4];
    stream.read_exact(&mut wire_protocol).await?;

    stream.write_all(b"SUCCESS\0").await?;
    stream.flush().await?;
    Ok(())
}

async fn read_request_frame(stream: &mut TcpStream) -> Result<Option<(u64, Vec<Value>)>> {
    let mut token_buf = [0u8; 8];
    match stream.read_exact(&mut token_buf).await {
        Ok(_) => {},
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let token = u64::from_le_bytes(token_buf);

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    let request: Vec<Value> = serde_json::from_slice(&payload).context("decode request frame")?;

    Ok(Some((token, request)))
}

async fn write_envelope(stream: &mut TcpStream, token: u64, envelope: Value) -> Result<()> {
    let json = serde_json::to_vec(&envelope)?;
    stream.write_all(&token.to_le_bytes()).await?;
    stream.write_all(&(json.len() as u32).to_le_bytes()).await?;
    stream.write_all(&json).await?;
    stream.flush().await?;
    Ok(())
}
