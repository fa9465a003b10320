use std::error::Error as StdError;
use std::fmt::{self, Write as _};
use std::str::FromStr;

use strum_macros::Display;

use crate::error::{Error, Kind};

/// Header carrying the byte length of a frame body.
pub const CONTENT_LENGTH: &str = "content-length";
/// Header carrying the MIME type of a frame body.
pub const CONTENT_TYPE: &str = "content-type";
/// Header carrying the destination of a SEND, SUBSCRIBE or MESSAGE frame.
pub const DESTINATION: &str = "destination";
/// Header identifying a subscription on SUBSCRIBE, UNSUBSCRIBE and MESSAGE frames.
pub const SUBSCRIPTION_ID: &str = "id";
/// Header on MESSAGE frames naming the subscription the message was routed through.
pub const SUBSCRIPTION: &str = "subscription";
/// Header on ERROR frames carrying a short description of the failure.
pub const MESSAGE: &str = "message";
/// Header on CONNECT and CONNECTED frames negotiating heart-beating.
pub const HEART_BEAT: &str = "heart-beat";
/// Header requesting a RECEIPT frame for a client frame.
pub const RECEIPT: &str = "receipt";
/// Header carrying the bearer token on CONNECT frames.
pub const AUTHORIZATION: &str = "Authorization";

/// STOMP 1.2 frame commands, both client and server side.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    /// CONNECT and CONNECTED frames are exempt from header value escaping.
    #[must_use]
    pub const fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Connected)
    }
}

impl FromStr for Command {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let command = match s {
            "CONNECT" => Self::Connect,
            "STOMP" => Self::Stomp,
            "CONNECTED" => Self::Connected,
            "SEND" => Self::Send,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "ACK" => Self::Ack,
            "NACK" => Self::Nack,
            "BEGIN" => Self::Begin,
            "COMMIT" => Self::Commit,
            "ABORT" => Self::Abort,
            "DISCONNECT" => Self::Disconnect,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            other => return Err(FrameError::UnknownCommand(other.to_owned())),
        };
        Ok(command)
    }
}

/// A single STOMP frame.
///
/// Headers keep their wire order. When a header is repeated only the first
/// occurrence is significant, which is what [`Frame::header`] returns.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Append a header.
    #[must_use]
    pub fn with_header<K: Into<String>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Append every header from `headers`, skipping names that are already set.
    #[must_use]
    pub fn with_headers<'hdr, I>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (&'hdr String, &'hdr String)>,
    {
        for (name, value) in headers {
            if self.header(name).is_none() {
                self.headers.push((name.clone(), value.clone()));
            }
        }
        self
    }

    #[must_use]
    pub fn with_body<B: Into<String>>(mut self, body: B) -> Self {
        self.body = body.into();
        self
    }

    /// The first value of the named header.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Serialize the frame, NUL terminator included.
    ///
    /// A `content-length` header is added for non-empty bodies unless the
    /// caller already provided one.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(self.body.len() + 64);
        let escape = self.command.escapes_headers();

        let _ = writeln!(out, "{}", self.command);
        for (name, value) in &self.headers {
            if escape {
                let _ = writeln!(out, "{}:{}", escape_header(name), escape_header(value));
            } else {
                let _ = writeln!(out, "{name}:{value}");
            }
        }
        if !self.body.is_empty() && self.header(CONTENT_LENGTH).is_none() {
            let _ = writeln!(out, "{CONTENT_LENGTH}:{}", self.body.len());
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Parse exactly one frame, ignoring heart-beat EOLs around it.
    pub fn parse(input: &str) -> Result<Self, FrameError> {
        let mut frames = decode(input)?;
        match frames.len() {
            1 => frames.pop().ok_or(FrameError::Incomplete),
            0 => Err(FrameError::Incomplete),
            n => Err(FrameError::TrailingData(n - 1)),
        }
    }

    // Parses one frame from the front of `input`, returning the unconsumed remainder.
    fn parse_next(input: &str) -> Result<(Self, &str), FrameError> {
        let mut rest = input;

        let command_line = next_line(&mut rest).ok_or(FrameError::Incomplete)?;
        let command = Command::from_str(command_line)?;
        let unescape = command.escapes_headers();

        let mut headers = Vec::new();
        loop {
            let line = next_line(&mut rest).ok_or(FrameError::Incomplete)?;
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| FrameError::MalformedHeader(line.to_owned()))?;
            if unescape {
                headers.push((unescape_header(name)?, unescape_header(value)?));
            } else {
                headers.push((name.to_owned(), value.to_owned()));
            }
        }

        let content_length = headers
            .iter()
            .find(|(name, _)| name == CONTENT_LENGTH)
            .map(|(_, value)| {
                value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_e| FrameError::InvalidContentLength(value.clone()))
            })
            .transpose()?;

        let (body, remaining) = match content_length {
            Some(length) => {
                let body = rest.get(..length).ok_or(FrameError::Incomplete)?;
                let tail = rest.get(length..).ok_or(FrameError::Incomplete)?;
                let remaining = tail
                    .strip_prefix('\0')
                    .ok_or(FrameError::MissingTerminator)?;
                (body, remaining)
            }
            None => rest
                .split_once('\0')
                .ok_or(FrameError::MissingTerminator)?,
        };

        Ok((
            Self {
                command,
                headers,
                body: body.to_owned(),
            },
            remaining,
        ))
    }
}

/// Decode every frame contained in a WebSocket text message.
///
/// Brokers may batch several frames in one message and send bare EOLs as
/// heart-beats. A message made only of heart-beats decodes to an empty vec.
pub fn decode(input: &str) -> Result<Vec<Frame>, FrameError> {
    let mut frames = Vec::new();
    let mut rest = input;

    loop {
        rest = rest.trim_start_matches(['\r', '\n']);
        if rest.is_empty() {
            break;
        }
        let (frame, remaining) = Frame::parse_next(rest)?;
        frames.push(frame);
        rest = remaining;
    }

    Ok(frames)
}

/// Whether a WebSocket text message is nothing but heart-beat EOLs.
#[must_use]
pub fn is_heartbeat(input: &str) -> bool {
    !input.is_empty() && input.chars().all(|c| c == '\n' || c == '\r')
}

fn next_line<'input>(input: &mut &'input str) -> Option<&'input str> {
    let (line, rest) = input.split_once('\n')?;
    *input = rest;
    Some(line.strip_suffix('\r').unwrap_or(line))
}

fn escape_header(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(value: &str) -> Result<String, FrameError> {
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
            _ => return Err(FrameError::InvalidEscape(value.to_owned())),
        }
    }
    Ok(out)
}

/// Failures while decoding STOMP frames.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The input ended before the frame did
    Incomplete,
    /// The command line is not a STOMP command
    UnknownCommand(String),
    /// A header line has no `:` separator
    MalformedHeader(String),
    /// A header uses an escape sequence STOMP 1.2 does not define
    InvalidEscape(String),
    /// The `content-length` header is not a byte count
    InvalidContentLength(String),
    /// The body is not followed by a NUL octet
    MissingTerminator,
    /// More frames followed the one that was asked for
    TrailingData(usize),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incomplete => write!(f, "incomplete STOMP frame"),
            Self::UnknownCommand(command) => write!(f, "unknown STOMP command: {command}"),
            Self::MalformedHeader(line) => write!(f, "malformed STOMP header: {line}"),
            Self::InvalidEscape(value) => write!(f, "invalid escape in STOMP header: {value}"),
            Self::InvalidContentLength(value) => write!(f, "invalid content-length: {value}"),
            Self::MissingTerminator => write!(f, "STOMP frame is missing its NUL terminator"),
            Self::TrailingData(n) => write!(f, "{n} unexpected trailing frame(s)"),
        }
    }
}

impl StdError for FrameError {}

impl From<FrameError> for Error {
    fn from(e: FrameError) -> Self {
        Error::with_source(Kind::WebSocket, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_adds_content_length_and_terminator() {
        let frame = Frame::new(Command::Send)
            .with_header(DESTINATION, "/app/chat/42")
            .with_body(r#"{"content":"hi"}"#);

        assert_eq!(
            frame.encode(),
            "SEND\ndestination:/app/chat/42\ncontent-length:16\n\n{\"content\":\"hi\"}\0"
        );
    }

    #[test]
    fn encode_escapes_headers_except_on_connect() {
        let send = Frame::new(Command::Send).with_header("note", "a:b\nc\\d");
        assert!(send.encode().contains("note:a\\cb\\nc\\\\d\n"));

        let connect = Frame::new(Command::Connect).with_header("host", "localhost:8080");
        assert!(connect.encode().contains("host:localhost:8080\n"));
    }

    #[test]
    fn parse_message_frame() {
        let raw = "MESSAGE\nsubscription:sub-0\nmessage-id:007\ndestination:/chat/42\n\nhello\0";
        let frame = Frame::parse(raw).unwrap();

        assert_eq!(frame.command, Command::Message);
        assert_eq!(frame.header(SUBSCRIPTION), Some("sub-0"));
        assert_eq!(frame.header(DESTINATION), Some("/chat/42"));
        assert_eq!(frame.body, "hello");
    }

    #[test]
    fn parse_honours_content_length_with_embedded_nul() {
        let raw = "MESSAGE\ncontent-length:5\n\na\0b\0c\0";
        let frame = Frame::parse(raw).unwrap();

        assert_eq!(frame.body, "a\0b\0c");
    }

    #[test]
    fn parse_accepts_crlf_line_endings() {
        let raw = "CONNECTED\r\nversion:1.2\r\nheart-beat:4000,4000\r\n\r\n\0";
        let frame = Frame::parse(raw).unwrap();

        assert_eq!(frame.command, Command::Connected);
        assert_eq!(frame.header(HEART_BEAT), Some("4000,4000"));
    }

    #[test]
    fn first_repeated_header_wins() {
        let raw = "MESSAGE\nfoo:first\nfoo:second\n\n\0";
        let frame = Frame::parse(raw).unwrap();

        assert_eq!(frame.header("foo"), Some("first"));
    }

    #[test]
    fn unescapes_header_values() {
        let raw = "ERROR\nmessage:bad\\cheader\\nvalue\n\n\0";
        let frame = Frame::parse(raw).unwrap();

        assert_eq!(frame.header(MESSAGE), Some("bad:header\nvalue"));
    }

    #[test]
    fn rejects_undefined_escape() {
        let raw = "ERROR\nmessage:bad\\t\n\n\0";
        assert_eq!(
            Frame::parse(raw),
            Err(FrameError::InvalidEscape("bad\\t".to_owned()))
        );
    }

    #[test]
    fn rejects_unknown_command_and_missing_terminator() {
        assert!(matches!(
            Frame::parse("HELLO\n\n\0"),
            Err(FrameError::UnknownCommand(_))
        ));
        assert_eq!(
            Frame::parse("MESSAGE\n\nbody"),
            Err(FrameError::MissingTerminator)
        );
    }

    #[test]
    fn decode_skips_heartbeats_between_frames() {
        let raw = "\nRECEIPT\nreceipt-id:1\n\n\0\n\nMESSAGE\ndestination:/x\n\nbody\0\n";
        let frames = decode(raw).unwrap();

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].command, Command::Receipt);
        assert_eq!(frames[1].body, "body");
        assert!(decode("\n").unwrap().is_empty());
        assert!(is_heartbeat("\r\n"));
        assert!(!is_heartbeat(""));
    }

    #[test]
    fn with_headers_does_not_override_existing() {
        let extra = [
            (CONTENT_TYPE.to_owned(), "text/plain".to_owned()),
            ("x-trace".to_owned(), "abc".to_owned()),
        ];
        let frame = Frame::new(Command::Send)
            .with_header(CONTENT_TYPE, "application/json")
            .with_headers(extra.iter().map(|(k, v)| (k, v)));

        assert_eq!(frame.header(CONTENT_TYPE), Some("application/json"));
        assert_eq!(frame.header("x-trace"), Some("abc"));
    }
}
