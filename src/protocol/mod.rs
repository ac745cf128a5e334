//! # Protocol Module
//!
//! STOMP 1.2 frame types and the single-frame codec.
//!
//! A frame on the wire looks like:
//!
//! ```text
//! COMMAND
//! header1:value1
//! header2:value2
//!
//! body^@
//! ```
//!
//! where `^@` is the NUL octet. Header values are escaped (`\\`, `\n`, `\r`,
//! `\c`) on every frame except `CONNECT` and `CONNECTED`.
//!
//! ## Example
//!
//! ```rust
//! use tokio_stomp_notify::protocol::{Command, Frame};
//!
//! let frame = Frame::new(Command::Send)
//!     .with_header("destination", "/app/chat")
//!     .with_body(b"hello".to_vec());
//!
//! let bytes = frame.encode();
//! let (decoded, used) = Frame::decode(&bytes).unwrap().unwrap();
//! assert_eq!(used, bytes.len());
//! assert_eq!(decoded.header("destination"), Some("/app/chat"));
//! assert_eq!(decoded.body, b"hello");
//! ```

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

pub mod headers {
    pub const ACCEPT_VERSION: &str = "accept-version";
    pub const ACK: &str = "ack";
    pub const CONTENT_LENGTH: &str = "content-length";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const DESTINATION: &str = "destination";
    pub const HEART_BEAT: &str = "heart-beat";
    pub const HOST: &str = "host";
    pub const ID: &str = "id";
    pub const MESSAGE: &str = "message";
    pub const MESSAGE_ID: &str = "message-id";
    pub const RECEIPT: &str = "receipt";
    pub const RECEIPT_ID: &str = "receipt-id";
    pub const SERVER: &str = "server";
    pub const SESSION: &str = "session";
    pub const SUBSCRIPTION: &str = "subscription";
    pub const VERSION: &str = "version";
}

/// Protocol versions offered in `accept-version`.
pub const SUPPORTED_VERSIONS: &str = "1.2,1.1,1.0";

/// STOMP frame commands, client and server side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    // client frames
    Connect,
    Stomp,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    // server frames
    Connected,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Begin => "BEGIN",
            Command::Commit => "COMMIT",
            Command::Abort => "ABORT",
            Command::Disconnect => "DISCONNECT",
            Command::Connected => "CONNECTED",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    /// Whether header values of this frame are sent without escaping.
    fn raw_headers(&self) -> bool {
        matches!(self, Command::Connect | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "ACK" => Command::Ack,
            "NACK" => Command::Nack,
            "BEGIN" => Command::Begin,
            "COMMIT" => Command::Commit,
            "ABORT" => Command::Abort,
            "DISCONNECT" => Command::Disconnect,
            "CONNECTED" => Command::Connected,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            other => return Err(FrameError::UnknownCommand(other.to_string())),
        })
    }
}

/// Errors produced while decoding a frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("frame is not valid utf-8 before the body")]
    InvalidUtf8,
    #[error("malformed header line {0:?}")]
    MalformedHeader(String),
    #[error("invalid escape sequence in header {0:?}")]
    InvalidEscape(String),
    #[error("invalid content-length {0:?}")]
    InvalidContentLength(String),
    #[error("frame body is not terminated by NUL")]
    MissingNul,
}

/// A single STOMP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    /// Headers in wire order. Repeated names are kept; lookups return the first.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Frame {
            command,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Returns the first value of header `name`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Serializes the frame including the trailing NUL.
    ///
    /// A `content-length` header is added when the body is non-empty and the
    /// caller didn't set one. CONNECT and CONNECTED headers are not escaped,
    /// so CR and LF are dropped from them.
    pub fn encode(&self) -> Vec<u8> {
        let raw = self.command.raw_headers();
        let mut out = Vec::with_capacity(64 + self.body.len());
        out.extend_from_slice(self.command.as_str().as_bytes());
        out.push(b'\n');
        for (name, value) in &self.headers {
            if raw {
                out.extend_from_slice(strip_eols(name).as_bytes());
                out.push(b':');
                out.extend_from_slice(strip_eols(value).as_bytes());
            } else {
                out.extend_from_slice(escape(name).as_bytes());
                out.push(b':');
                out.extend_from_slice(escape(value).as_bytes());
            }
            out.push(b'\n');
        }
        if !self.body.is_empty() && self.header(headers::CONTENT_LENGTH).is_none() {
            out.extend_from_slice(
                format!("{}:{}\n", headers::CONTENT_LENGTH, self.body.len()).as_bytes(),
            );
        }
        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out.push(0);
        out
    }

    /// Decodes one frame from the start of `data`.
    ///
    /// Returns `Ok(None)` if `data` does not yet hold a complete frame, and
    /// otherwise the frame plus the number of bytes consumed (the trailing
    /// NUL and any EOLs after it included). `data` must not start with
    /// heart-beat EOLs; strip those first.
    pub fn decode(data: &[u8]) -> Result<Option<(Frame, usize)>, FrameError> {
        let Some(head_end) = find_head_end(data) else {
            return Ok(None);
        };
        let (head, body_start) = head_end;
        let head = std::str::from_utf8(&data[..head]).map_err(|_| FrameError::InvalidUtf8)?;

        let mut lines = head.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));
        let command: Command = lines.next().unwrap_or_default().parse()?;
        let raw = command.raw_headers();

        let mut frame_headers = Vec::new();
        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                return Err(FrameError::MalformedHeader(line.to_string()));
            };
            if raw {
                frame_headers.push((name.to_string(), value.to_string()));
            } else {
                frame_headers.push((unescape(name)?, unescape(value)?));
            }
        }

        let content_length = frame_headers
            .iter()
            .find(|(k, _)| k == headers::CONTENT_LENGTH)
            .map(|(_, v)| {
                v.trim()
                    .parse::<usize>()
                    .map_err(|_| FrameError::InvalidContentLength(v.clone()))
            })
            .transpose()?;

        let rest = &data[body_start..];
        let (body, after) = match content_length {
            Some(len) => {
                let end = len
                    .checked_add(1)
                    .ok_or_else(|| FrameError::InvalidContentLength(len.to_string()))?;
                if rest.len() < end {
                    return Ok(None);
                }
                if rest[len] != 0 {
                    return Err(FrameError::MissingNul);
                }
                (&rest[..len], end)
            }
            None => match rest.iter().position(|b| *b == 0) {
                Some(nul) => (&rest[..nul], nul + 1),
                None => return Ok(None),
            },
        };

        let mut consumed = body_start + after;
        consumed += count_eols(&data[consumed..]);

        Ok(Some((
            Frame {
                command,
                headers: frame_headers,
                body: body.to_vec(),
            },
            consumed,
        )))
    }
}

/// Drops CR and LF so an unescaped header cannot spill into the next line.
fn strip_eols(s: &str) -> std::borrow::Cow<'_, str> {
    if s.contains(['\r', '\n']) {
        s.replace(['\r', '\n'], "").into()
    } else {
        s.into()
    }
}

/// Counts heart-beat EOLs (`\n` or `\r\n`) at the start of `data`.
pub fn count_eols(data: &[u8]) -> usize {
    let mut n = 0;
    loop {
        match data.get(n..) {
            Some([b'\n', ..]) => n += 1,
            Some([b'\r', b'\n', ..]) => n += 2,
            _ => return n,
        }
    }
}

// returns (end of header block, start of body)
fn find_head_end(data: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i < data.len() {
        if data[i] == b'\n' {
            match data.get(i + 1..) {
                Some([b'\n', ..]) => return Some((i, i + 2)),
                Some([b'\r', b'\n', ..]) => return Some((i, i + 3)),
                _ => {}
            }
        }
        i += 1;
    }
    None
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(value: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(FrameError::InvalidEscape(value.to_string())),
        }
    }
    Ok(out)
}

/// Parses a `heart-beat` header value (`cx,cy`) into milliseconds.
pub fn parse_heartbeat(value: &str) -> Option<(u32, u32)> {
    let (a, b) = value.split_once(',')?;
    Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_header_values_except_on_connect() {
        let send = Frame::new(Command::Send).with_header("note", "a:b\nc");
        let text = String::from_utf8(send.encode()).unwrap();
        assert!(text.contains("note:a\\cb\\nc\n"));

        let connect = Frame::new(Command::Connect).with_header("login", "a:b");
        let text = String::from_utf8(connect.encode()).unwrap();
        assert!(text.contains("login:a:b\n"));
    }

    #[test]
    fn body_may_contain_nul_with_content_length() {
        let frame = Frame::new(Command::Message)
            .with_header(headers::DESTINATION, "/topic/interaction")
            .with_body(vec![1, 0, 2]);
        let bytes = frame.encode();
        let (decoded, used) = Frame::decode(&bytes).unwrap().unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(decoded.body, vec![1, 0, 2]);
    }

    #[test]
    fn body_without_content_length_runs_to_nul() {
        let data = b"MESSAGE\ndestination:/topic/chat/7\n\n{\"a\":1}\0\n\n";
        let (frame, used) = Frame::decode(data).unwrap().unwrap();
        assert_eq!(used, data.len());
        assert_eq!(frame.body, b"{\"a\":1}");
        assert_eq!(frame.header("destination"), Some("/topic/chat/7"));
    }

    #[test]
    fn incomplete_frame_needs_more_data() {
        assert_eq!(Frame::decode(b"MESSAGE\ndestination:/x\n").unwrap(), None);
        assert_eq!(
            Frame::decode(b"MESSAGE\ncontent-length:10\n\nabc").unwrap(),
            None
        );
    }

    #[test]
    fn repeated_headers_keep_first_value() {
        let data = b"MESSAGE\nfoo:first\nfoo:second\n\n\0";
        let (frame, _) = Frame::decode(data).unwrap().unwrap();
        assert_eq!(frame.header("foo"), Some("first"));
        assert_eq!(frame.headers.len(), 2);
    }

    #[test]
    fn crlf_line_endings_are_accepted() {
        let data = b"CONNECTED\r\nversion:1.2\r\n\r\n\0";
        let (frame, _) = Frame::decode(data).unwrap().unwrap();
        assert_eq!(frame.command, Command::Connected);
        assert_eq!(frame.header("version"), Some("1.2"));
    }

    #[test]
    fn rejects_unknown_commands_and_bad_escapes() {
        assert!(matches!(
            Frame::decode(b"HELLO\n\n\0"),
            Err(FrameError::UnknownCommand(_))
        ));
        assert!(matches!(
            Frame::decode(b"MESSAGE\nfoo:a\\tb\n\n\0"),
            Err(FrameError::InvalidEscape(_))
        ));
        assert!(matches!(
            Frame::decode(b"MESSAGE\ncontent-length:2\n\nabc\0"),
            Err(FrameError::MissingNul)
        ));
    }

    #[test]
    fn connect_header_cannot_inject_lines() {
        let connect = Frame::new(Command::Connect).with_header("login", "guest\npasscode:x\r\n");
        let bytes = connect.encode();
        let (decoded, _) = Frame::decode(&bytes).unwrap().unwrap();
        assert_eq!(decoded.headers, vec![("login".to_string(), "guestpasscode:x".to_string())]);
    }

    #[test]
    fn huge_content_length_is_rejected() {
        let data = b"MESSAGE\ndestination:/topic/x\ncontent-length:18446744073709551615\n\nhi\0";
        assert_eq!(
            Frame::decode(data),
            Err(FrameError::InvalidContentLength(usize::MAX.to_string()))
        );
    }

    #[test]
    fn parses_heartbeat_header() {
        assert_eq!(parse_heartbeat("10000,0"), Some((10000, 0)));
        assert_eq!(parse_heartbeat(" 5 , 6 "), Some((5, 6)));
        assert_eq!(parse_heartbeat("bogus"), None);
    }
}
