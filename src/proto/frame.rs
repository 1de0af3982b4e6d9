// SPDX-License-Identifier: AGPL-3.0-or-later

//! Request/response framing codec (spec §4.1).
//!
//! Request frame: `token(u64 LE) | len(u32 LE) | json(len bytes)`.
//! Response frame is symmetric.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::proto::constants::ResponseType;

/// Envelope of a decoded response frame (spec §3, §6).
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseEnvelope {
    pub t: i32,
    #[serde(default)]
    pub r: Vec<Value>,
    #[serde(default)]
    pub n: Vec<i32>,
    #[serde(default)]
    pub p: Option<Value>,
    #[serde(default)]
    pub b: Option<Value>,
}

impl ResponseEnvelope {
    pub fn response_type(&self) -> Option<ResponseType> {
        ResponseType::from_i32(self.t)
    }

    /// Build a synthetic envelope representing a driver-internal error
    /// (spec §4.4: reader failure is fanned out as a synthetic CLIENT_ERROR).
    pub fn synthetic_client_error(message: impl Into<String>) -> Self {
        ResponseEnvelope {
            t: ResponseType::ClientError as i32,
            r: vec![Value::String(message.into())],
            n: Vec::new(),
            p: None,
            b: None,
        }
    }
}

/// Encode the request payload triple `[query_type, body?, opts?]` into a
/// full wire frame, prefixed with `(token, len)`.
pub fn encode_request(token: u64, payload: &Value) -> Bytes {
    let json = serde_json::to_vec(payload).expect("request payload must serialize to JSON");
    let mut buf = BytesMut::with_capacity(8 + 4 + json.len());
    buf.put_u64_le(token);
    buf.put_u32_le(json.len() as u32);
    buf.put_slice(&json);
    buf.freeze()
}

/// Read one full response frame off `reader`: the token, followed by the
/// decoded JSON envelope. Returns `Ok(None)` on a clean EOF at the frame
/// boundary (socket closed between frames).
pub async fn read_response_frame<R>(reader: &mut R) -> std::io::Result<Option<(u64, ResponseEnvelope)>>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; 8];
    match read_exact_or_eof(reader, &mut head).await? {
        false => return Ok(None),
        true => {},
    }
    let token = u64::from_le_bytes(head);

    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    let envelope: ResponseEnvelope = serde_json::from_slice(&payload).map_err(|e| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, format!("bad response json: {e}"))
    })?;

    Ok(Some((token, envelope)))
}

/// Like `read_exact`, but returns `Ok(false)` instead of erroring when the
/// stream hits EOF before any byte of `buf` has been read (a clean
/// shutdown between frames rather than mid-frame).
async fn read_exact_or_eof<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<bool>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-frame",
            ));
        }
        filled += n;
    }
    Ok(true)
}
