// SPDX-License-Identifier: AGPL-3.0-or-later

use qconn::proto::frame::{encode_request, read_response_frame, ResponseEnvelope};
use qconn::proto::ResponseType;
use serde_json::json;
use tokio::io::AsyncWriteExt;

/// spec §8 "Frame codec: encode-then-decode of any (token, payload) is
/// identity" — exercised on the response side, the half the core actually
/// decodes.
#[tokio::test]
async fn response_frame_round_trips_through_the_wire_shape() {
    let (mut writer, mut reader) = tokio::io::duplex(4096);

    let body = json!({"t": 1, "r": [42], "n": [], "p": null, "b": null});
    let frame = encode_request(7, &body);
    writer.write_all(&frame).await.expect("write");
    drop(writer);

    let (token, envelope) = read_response_frame(&mut reader)
        .await
        .expect("decode")
        .expect("frame present");
    assert_eq!(token, 7);
    assert_eq!(envelope.response_type(), Some(ResponseType::SuccessAtom));
    assert_eq!(envelope.r, vec![json!(42)]);
}

/// A clean EOF exactly at a frame boundary is a graceful close, not an
/// error — the reader loop relies on this to distinguish "peer hung up
/// between queries" from "peer died mid-frame".
#[tokio::test]
async fn eof_at_frame_boundary_is_not_an_error() {
    let (writer, mut reader) = tokio::io::duplex(4096);
    drop(writer);

    let result = read_response_frame(&mut reader).await.expect("no io error");
    assert!(result.is_none());
}

/// A peer that disappears mid-frame is a protocol-level error, not a clean
/// close, since the reader has already committed to reading `length` bytes.
#[tokio::test]
async fn eof_mid_frame_is_an_io_error() {
    let (mut writer, mut reader) = tokio::io::duplex(4096);
    writer.write_all(&7u64.to_le_bytes()).await.expect("write token");
    writer.write_all(&100u32.to_le_bytes()).await.expect("write length");
    writer.write_all(b"short").await.expect("write partial payload");
    drop(writer);

    let result = read_response_frame(&mut reader).await;
    assert!(result.is_err());
}

/// spec §8 boundary behavior: "a frame split across two `write` calls
/// reassembles correctly" — `read_exact` inside the codec must keep pulling
/// from the socket until the full header/payload has arrived, regardless of
/// how the writer chose to chunk it.
#[tokio::test]
async fn frame_split_across_two_writes_reassembles_correctly() {
    let (mut writer, mut reader) = tokio::io::duplex(4096);

    let body = json!({"t": 2, "r": [1, 2, 3]});
    let frame = encode_request(13, &body);
    let split = frame.len() / 2;

    writer.write_all(&frame[..split]).await.expect("write first half");
    let second_half = frame[split..].to_vec();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        writer.write_all(&second_half).await.expect("write second half");
    });

    let (token, envelope) = read_response_frame(&mut reader)
        .await
        .expect("decode")
        .expect("frame present");
    assert_eq!(token, 13);
    assert_eq!(envelope.response_type(), Some(ResponseType::SuccessSequence));
    assert_eq!(envelope.r, vec![json!(1), json!(2), json!(3)]);
}

#[test]
fn synthetic_client_error_carries_the_message() {
    let envelope = ResponseEnvelope::synthetic_client_error("connection closed by peer");
    assert_eq!(envelope.response_type(), Some(ResponseType::ClientError));
    assert_eq!(envelope.r, vec![json!("connection closed by peer")]);
}
