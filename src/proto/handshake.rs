// SPDX-License-Identifier: AGPL-3.0-or-later

//! Client handshake (spec §4.1).
//!
//! 1. `magic(u32 LE)`
//! 2. `auth_key_len(u32 LE) | auth_key_bytes`
//! 3. `wire_protocol(u32 LE)`
//!
//! The server replies with a NUL-terminated ASCII string; `"SUCCESS\0"`
//! means ready, anything else is a fatal handshake error.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::{DriverError, Result};
use crate::proto::constants::{
    HANDSHAKE_REPLY_MAX_LEN, HANDSHAKE_SUCCESS, VERSION_MAGIC, WIRE_PROTOCOL_JSON,
};

pub async fn perform_handshake<S>(stream: &mut S, auth_key: &[u8], io_timeout: Duration) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    timeout(io_timeout, write_handshake(stream, auth_key))
        .await
        .map_err(|_| DriverError::Handshake("timed out writing handshake".into()))?
        .map_err(|e| DriverError::Handshake(format!("write failed: {e}")))?;

    let reply = timeout(io_timeout, read_nul_terminated(stream))
        .await
        .map_err(|_| DriverError::Handshake("timed out reading handshake reply".into()))?
        .map_err(|e| DriverError::Handshake(format!("read failed: {e}")))?;

    if reply != HANDSHAKE_SUCCESS {
        return Err(DriverError::Handshake(reply));
    }

    Ok(())
}

async fn write_handshake<S>(stream: &mut S, auth_key: &[u8]) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_u32_le(VERSION_MAGIC).await?;
    stream.write_u32_le(auth_key.len() as u32).await?;
    stream.write_all(auth_key).await?;
    stream.write_u32_le(WIRE_PROTOCOL_JSON).await?;
    stream.flush().await
}

async fn read_nul_terminated<S>(stream: &mut S) -> std::io::Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        if byte[0] == 0 {
            break;
        }
        buf.push(byte[0]);
        if buf.len() > HANDSHAKE_REPLY_MAX_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "handshake reply exceeded maximum length without a NUL terminator",
            ));
        }
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
