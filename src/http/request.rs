//! Incremental HTTP/1.1 request parser.
//!
//! The parser walks the connection's read buffer one CRLF-terminated line at
//! a time through REQUEST_LINE, HEADERS, BODY, and FINISH. When no complete
//! line is buffered it reports [`Progress::NeedMore`] without consuming
//! anything, so a request split across reads resumes exactly where it left
//! off. FINISH is terminal; the connection resets the parser between
//! keep-alive exchanges.

use std::collections::HashMap;

use log::{debug, info};

use super::ParseError;
use crate::buffer::Buffer;
use crate::store::CredentialStore;

const CRLF: &[u8] = b"\r\n";

/// Targets that get `.html` appended during the parse-time rewrite.
const DEFAULT_HTML: [&str; 2] = ["/login", "/index"];

/// Outcome of one parse call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The buffered bytes do not yet hold a complete request.
    NeedMore,
    /// A full request has been parsed; accessors are now meaningful.
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    RequestLine,
    Headers,
    Body,
    Finish,
}

/// A single parsed (or in-progress) request.
#[derive(Debug)]
pub struct Request {
    state: ParseState,
    method: String,
    path: String,
    version: String,
    body: String,
    headers: HashMap<String, String>,
    form: HashMap<String, String>,
}

impl Request {
    /// Creates an empty request in the REQUEST_LINE state.
    pub fn new() -> Self {
        Self {
            state: ParseState::RequestLine,
            method: String::new(),
            path: String::new(),
            version: String::new(),
            body: String::new(),
            headers: HashMap::new(),
            form: HashMap::new(),
        }
    }

    /// Clears all parsed state for the next exchange.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Consumes as much of `buf` as the current state allows. Previously
    /// parsed fields are never undone by later calls.
    pub fn parse(
        &mut self,
        buf: &mut Buffer,
        creds: &dyn CredentialStore,
    ) -> Result<Progress, ParseError> {
        loop {
            match self.state {
                ParseState::Finish => return Ok(Progress::Complete),
                ParseState::RequestLine => {
                    let line = match take_line(buf) {
                        Some(line) => line,
                        None => return Ok(Progress::NeedMore),
                    };
                    self.parse_request_line(&line)?;
                    self.rewrite_path();
                    self.state = ParseState::Headers;
                }
                ParseState::Headers => {
                    let line = match take_line(buf) {
                        Some(line) => line,
                        None => return Ok(Progress::NeedMore),
                    };
                    if line.is_empty() {
                        self.state = if buf.readable_len() <= 2 {
                            ParseState::Finish
                        } else {
                            ParseState::Body
                        };
                    } else {
                        self.parse_header(&line);
                    }
                }
                ParseState::Body => {
                    if !self.take_body(buf) {
                        return Ok(Progress::NeedMore);
                    }
                    self.decode_form(creds);
                    self.state = ParseState::Finish;
                }
            }
        }
    }

    /// The request method token.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The target path after rewriting.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The version digits following `HTTP/`.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// The raw body line.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Looks up a header value. Names are case-sensitive; the last
    /// occurrence wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Looks up a form-decoded POST field.
    pub fn post(&self, key: &str) -> Option<&str> {
        self.form.get(key).map(String::as_str)
    }

    /// True for an HTTP/1.1 request that asked for `Connection: keep-alive`.
    pub fn is_keep_alive(&self) -> bool {
        self.version == "1.1" && self.header("Connection") == Some("keep-alive")
    }

    fn parse_request_line(&mut self, line: &str) -> Result<(), ParseError> {
        let mut parts = line.splitn(3, ' ');
        let method = parts.next().unwrap_or("");
        let target = parts.next().unwrap_or("");
        let proto = parts.next().unwrap_or("");
        let version = proto.strip_prefix("HTTP/").ok_or(ParseError::BadRequest)?;
        if method.is_empty() || target.is_empty() || version.is_empty() || version.contains(' ') {
            return Err(ParseError::BadRequest);
        }
        self.method = method.to_owned();
        self.path = target.to_owned();
        self.version = version.to_owned();
        Ok(())
    }

    fn rewrite_path(&mut self) {
        if self.path == "/" {
            self.path = "/login.html".to_owned();
        } else if DEFAULT_HTML.contains(&self.path.as_str()) {
            self.path.push_str(".html");
        }
    }

    fn parse_header(&mut self, line: &str) {
        match line.split_once(':') {
            Some((name, value)) => {
                let value = value.trim_start_matches(|c| c == ' ' || c == '\t');
                self.headers.insert(name.to_owned(), value.to_owned());
            }
            None => debug!("discarding malformed header line"),
        }
    }

    /// Extracts the body, preferring a declared `Content-Length` and falling
    /// back to one CRLF-terminated line or whatever has arrived. Returns
    /// false when a declared length has not fully arrived yet.
    fn take_body(&mut self, buf: &mut Buffer) -> bool {
        if let Some(declared) = self.content_length() {
            if buf.readable_len() < declared {
                return false;
            }
            self.body = String::from_utf8_lossy(&buf.readable()[..declared]).into_owned();
            buf.advance_read(declared);
        } else if let Some(line) = take_line(buf) {
            self.body = line;
        } else {
            self.body = String::from_utf8_lossy(buf.readable()).into_owned();
            let len = buf.readable_len();
            buf.advance_read(len);
        }
        true
    }

    fn content_length(&self) -> Option<usize> {
        self.header("Content-Length")
            .and_then(|value| value.trim().parse().ok())
    }

    /// Form-decodes a POST body and applies the login rewrite.
    fn decode_form(&mut self, creds: &dyn CredentialStore) {
        if self.method != "POST"
            || self.header("Content-Type") != Some("application/x-www-form-urlencoded")
            || self.body.is_empty()
        {
            return;
        }
        for pair in self.body.split('&') {
            if let Some((key, value)) = pair.split_once('=') {
                self.form
                    .insert(decode_component(key), decode_component(value));
            }
        }
        // registration (/register.html) is acknowledged but not implemented
        if self.path == "/doLogin" {
            let accepted = {
                let user = self.form.get("username").map(String::as_str).unwrap_or("");
                let pass = self.form.get("password").map(String::as_str).unwrap_or("");
                creds.verify(user, pass)
            };
            if accepted {
                info!("login accepted, serving index");
                self.path = "/index.html".to_owned();
            } else {
                info!("login rejected");
            }
        }
    }
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

/// Takes one CRLF-terminated line off the buffer, or nothing at all.
fn take_line(buf: &mut Buffer) -> Option<String> {
    let readable = buf.readable();
    let end = readable.windows(2).position(|window| window == CRLF)?;
    let line = String::from_utf8_lossy(&readable[..end]).into_owned();
    buf.advance_read(end + 2);
    Some(line)
}

/// Decodes one `application/x-www-form-urlencoded` component: `+` becomes a
/// space and `%HH` the byte it names; malformed escapes pass through.
fn decode_component(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                let hi = bytes.get(i + 1).and_then(|&b| hex_value(b));
                let lo = bytes.get(i + 2).and_then(|&b| hex_value(b));
                match (hi, lo) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi * 16 + lo);
                        i += 3;
                    }
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
