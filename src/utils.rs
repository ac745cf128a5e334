use anyhow::anyhow;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{Frame, count_eols};

/// What a websocket message can carry besides frames.
#[derive(Debug)]
pub(crate) enum Incoming {
    Heartbeat,
    Frame(Frame),
}

// same as serde_json::from_slice, but handles empty data correctly
pub fn decode_json<T: DeserializeOwned>(mut data: &[u8]) -> serde_json::Result<T> {
    if data.is_empty() {
        // an empty body and a `null` body decode the same way
        data = b"null";
    }
    serde_json::from_slice(data)
}

/// Serializes `value` as a JSON frame body.
pub fn encode_json<T: Serialize>(value: &T) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(value)
}

/// Rewrites `http(s)://` endpoints to `ws(s)://`; other URLs are kept as is.
///
/// ```rust
/// use tokio_stomp_notify::utils::normalize_endpoint;
///
/// assert_eq!(normalize_endpoint("http://localhost:8080/ws"), "ws://localhost:8080/ws");
/// assert_eq!(normalize_endpoint("https://example.com/ws"), "wss://example.com/ws");
/// assert_eq!(normalize_endpoint("ws://example.com/ws"), "ws://example.com/ws");
/// ```
pub fn normalize_endpoint(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else {
        url.to_string()
    }
}

/// Splits one websocket payload into heart-beats and frames.
///
/// A payload may hold several frames back to back. A frame that fails to
/// parse is reported and skipped up to its NUL terminator, so one bad frame
/// does not take the rest of the payload with it.
pub(crate) fn decode_frames(mut data: &[u8], mut handle_frame: impl FnMut(anyhow::Result<Incoming>)) {
    while !data.is_empty() {
        let eols = count_eols(data);
        if eols > 0 {
            log::trace!("<-- (heart-beat)");
            handle_frame(Ok(Incoming::Heartbeat));
            data = &data[eols..];
            continue;
        }

        match Frame::decode(data) {
            Ok(Some((frame, used))) => {
                log::trace!("<-- {}", format_frame(&data[..used]));
                data = &data[used..];
                handle_frame(Ok(Incoming::Frame(frame)));
            }
            Ok(None) => {
                log::debug!("truncated frame: {}", format_frame(data));
                handle_frame(Err(anyhow!("truncated frame ({} bytes)", data.len())));
                break;
            }
            Err(err) => {
                log::debug!("failed to parse frame: {}", err);
                handle_frame(Err(anyhow!(err)));
                match data.iter().position(|b| *b == 0) {
                    Some(nul) => data = &data[nul + 1..],
                    None => break,
                }
            }
        }
    }
}

/// Wraps an encoded frame into a websocket message, text when possible.
pub(crate) fn encode_frame(frame: &Frame) -> Message {
    let bytes = frame.encode();
    log::trace!("--> {}", format_frame(&bytes));
    match String::from_utf8(bytes) {
        Ok(text) => Message::Text(text.into()),
        Err(err) => Message::Binary(err.into_bytes().into()),
    }
}

/// A bare EOL, the STOMP heart-beat.
pub(crate) fn heartbeat_message() -> Message {
    Message::Text("\n".into())
}

fn format_frame(buf: &[u8]) -> String {
    let text = String::from_utf8_lossy(buf);
    text.trim_end_matches(['\0', '\n', '\r'])
        .replace('\n', "\\n")
        .replace('\0', "^@")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Command;

    #[test]
    fn splits_frames_and_heartbeats() {
        let mut data = b"\n\r\n".to_vec();
        data.extend(Frame::new(Command::Receipt).with_header("receipt-id", "1").encode());
        data.extend(b"MESSAGE\ndestination:/topic/interaction\n\nhi\0");

        let mut seen = Vec::new();
        decode_frames(&data, |item| match item.unwrap() {
            Incoming::Heartbeat => seen.push("beat".to_string()),
            Incoming::Frame(frame) => seen.push(frame.command.to_string()),
        });
        assert_eq!(seen, vec!["beat", "RECEIPT", "MESSAGE"]);
    }

    #[test]
    fn bad_frame_does_not_hide_the_next_one() {
        let data = b"BOGUS\n\n\0MESSAGE\ndestination:/topic/x\n\nok\0";
        let mut errors = 0;
        let mut bodies = Vec::new();
        decode_frames(data, |item| match item {
            Ok(Incoming::Frame(frame)) => bodies.push(frame.body),
            Ok(Incoming::Heartbeat) => {}
            Err(_) => errors += 1,
        });
        assert_eq!(errors, 1);
        assert_eq!(bodies, vec![b"ok".to_vec()]);
    }

    #[test]
    fn huge_content_length_is_reported_not_fatal() {
        let mut data = format!(
            "MESSAGE\ndestination:/topic/x\ncontent-length:{}\n\nhi\0",
            usize::MAX
        )
        .into_bytes();
        data.extend(b"MESSAGE\ndestination:/topic/x\n\nok\0");

        let mut errors = 0;
        let mut bodies = Vec::new();
        decode_frames(&data, |item| match item {
            Ok(Incoming::Frame(frame)) => bodies.push(frame.body),
            Ok(Incoming::Heartbeat) => {}
            Err(_) => errors += 1,
        });
        assert_eq!(errors, 1);
        assert_eq!(bodies, vec![b"ok".to_vec()]);
    }

    #[test]
    fn binary_bodies_go_out_as_binary_messages() {
        let text = encode_frame(&Frame::new(Command::Send).with_body(b"plain".to_vec()));
        assert!(matches!(text, Message::Text(_)));

        let binary = encode_frame(&Frame::new(Command::Send).with_body(vec![0xff, 0xfe]));
        assert!(matches!(binary, Message::Binary(_)));
    }

    #[test]
    fn empty_json_body_is_null() {
        let value: Option<u32> = decode_json(b"").unwrap();
        assert_eq!(value, None);
    }
}
