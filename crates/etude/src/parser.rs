// src/parser.rs
use crate::credentials::CredentialStore;
use crate::http::{DEFAULT_ROUTES, ERROR_PAGE, FormAction, INDEX_PAGE, Method, WELCOME_PAGE};
use std::collections::HashMap;

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseState {
    #[default]
    RequestLine,
    Headers,
    Body,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// A full request was parsed from the first `n` bytes of the input.
    Complete(usize),
    /// More bytes are needed; nothing was consumed.
    Incomplete,
    /// The request line is not `METHOD SP PATH SP HTTP/VERSION`.
    Malformed,
}

/// One parsed HTTP/1.x request. Reused across the requests of a keep-alive
/// connection; every [`parse`](Request::parse) starts from a clean slate.
#[derive(Debug, Default)]
pub struct Request {
    state: ParseState,
    method: Method,
    path: String,
    version: String,
    /// Keyed by lowercased name; the last occurrence wins.
    headers: HashMap<String, String>,
    body: String,
    post: HashMap<String, String>,
}

impl Request {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.state = ParseState::RequestLine;
        self.method = Method::default();
        self.path.clear();
        self.version.clear();
        self.headers.clear();
        self.body.clear();
        self.post.clear();
    }

    /// Parse one request from the front of `buf`.
    ///
    /// Line-oriented: the request line, then `Name: value` header lines up to
    /// the first line that is not a header, then exactly `Content-Length`
    /// body bytes when that header is positive. Form posts to the login and
    /// registration pages consult `store` and rewrite the path to the
    /// welcome or error page.
    pub fn parse(&mut self, buf: &[u8], store: &dyn CredentialStore) -> ParseOutcome {
        self.reset();
        let mut pos = 0;

        while self.state != ParseState::Finished {
            if self.state == ParseState::Body {
                let len = self.content_length();
                if buf.len() - pos < len {
                    return ParseOutcome::Incomplete;
                }
                self.body = String::from_utf8_lossy(&buf[pos..pos + len]).into_owned();
                pos += len;
                self.parse_post(store);
                self.state = ParseState::Finished;
                continue;
            }

            let Some(line_len) = memchr::memmem::find(&buf[pos..], b"\r\n") else {
                return ParseOutcome::Incomplete;
            };
            let line = &buf[pos..pos + line_len];
            pos += line_len + 2;

            match self.state {
                ParseState::RequestLine => {
                    if !self.parse_request_line(line) {
                        tracing::debug!(
                            line = %String::from_utf8_lossy(line),
                            "malformed request line"
                        );
                        return ParseOutcome::Malformed;
                    }
                    self.state = ParseState::Headers;
                }
                ParseState::Headers => {
                    if !self.parse_header(line) {
                        self.state = if self.content_length() > 0 {
                            ParseState::Body
                        } else {
                            ParseState::Finished
                        };
                    }
                }
                ParseState::Body | ParseState::Finished => unreachable!(),
            }
        }

        tracing::debug!(
            method = ?self.method,
            path = %self.path,
            version = %self.version,
            "request parsed"
        );
        ParseOutcome::Complete(pos)
    }

    fn parse_request_line(&mut self, line: &[u8]) -> bool {
        let mut parts = line.split(|&b| b == b' ');
        let (Some(method), Some(path), Some(proto), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return false;
        };
        let Some(version) = proto.strip_prefix(b"HTTP/") else {
            return false;
        };
        let (Ok(path), Ok(version)) = (std::str::from_utf8(path), std::str::from_utf8(version))
        else {
            return false;
        };

        self.method = Method::from_bytes(method);
        self.version.push_str(version);
        self.path.push_str(path);
        self.normalize_path();
        true
    }

    fn normalize_path(&mut self) {
        if self.path == "/" {
            self.path.clear();
            self.path.push_str(INDEX_PAGE);
        } else if DEFAULT_ROUTES.contains(&self.path.as_str()) {
            self.path.push_str(".html");
        }
    }

    /// `Name: value`, one optional space after the colon. False for anything
    /// else, which ends the header block.
    fn parse_header(&mut self, line: &[u8]) -> bool {
        let Some(colon) = memchr::memchr(b':', line) else {
            return false;
        };
        let name = &line[..colon];
        let mut value = &line[colon + 1..];
        if value.first() == Some(&b' ') {
            value = &value[1..];
        }
        self.headers.insert(
            String::from_utf8_lossy(name).to_ascii_lowercase(),
            String::from_utf8_lossy(value).into_owned(),
        );
        true
    }

    fn content_length(&self) -> usize {
        self.header("content-length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    fn parse_post(&mut self, store: &dyn CredentialStore) {
        if self.method != Method::Post {
            return;
        }
        let is_form = self
            .header("content-type")
            .is_some_and(|ct| ct.trim_start().starts_with(FORM_URLENCODED));
        if !is_form {
            return;
        }

        match serde_urlencoded::from_str::<Vec<(String, String)>>(&self.body) {
            Ok(fields) => self.post.extend(fields),
            Err(e) => tracing::debug!(error = %e, "undecodable form body"),
        }

        let Some(action) = FormAction::for_path(&self.path) else {
            return;
        };
        let username = self.post_field("username").unwrap_or_default();
        let password = self.post_field("password").unwrap_or_default();
        let is_login = action == FormAction::Login;

        let ok = match store.verify(username, password, is_login) {
            Ok(ok) => ok,
            Err(e) => {
                tracing::warn!(error = %e, "credential store failed");
                false
            }
        };
        let target = if ok { WELCOME_PAGE } else { ERROR_PAGE };
        self.path.clear();
        self.path.push_str(target);
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn post_field(&self, key: &str) -> Option<&str> {
        self.post.get(key).map(String::as_str)
    }

    /// `Connection: keep-alive` on HTTP/1.1.
    pub fn is_keep_alive(&self) -> bool {
        self.version == "1.1"
            && self
                .header("connection")
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("keep-alive"))
    }
}
