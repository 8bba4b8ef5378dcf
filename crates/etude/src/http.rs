// src/http.rs

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Trace,
    Connect,
    Unknown,
}

impl Method {
    pub fn from_bytes(b: &[u8]) -> Self {
        match b {
            b"GET" => Method::Get,
            b"POST" => Method::Post,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            b"PATCH" => Method::Patch,
            b"HEAD" => Method::Head,
            b"OPTIONS" => Method::Options,
            b"TRACE" => Method::Trace,
            b"CONNECT" => Method::Connect,
            _ => Method::Unknown,
        }
    }
}

/// Paths that are served from `<path>.html` when requested bare.
pub const DEFAULT_ROUTES: [&str; 6] = [
    "/index", "/register", "/login", "/welcome", "/video", "/picture",
];

pub const INDEX_PAGE: &str = "/index.html";
pub const WELCOME_PAGE: &str = "/welcome.html";
pub const ERROR_PAGE: &str = "/error.html";

/// Form endpoints backed by the credential store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormAction {
    Register,
    Login,
}

impl FormAction {
    pub fn for_path(path: &str) -> Option<Self> {
        match path {
            "/register.html" => Some(FormAction::Register),
            "/login.html" => Some(FormAction::Login),
            _ => None,
        }
    }
}

pub fn reason_phrase(status: u16) -> Option<&'static str> {
    match status {
        200 => Some("OK"),
        400 => Some("Bad Request"),
        403 => Some("Forbidden"),
        404 => Some("Not Found"),
        _ => None,
    }
}

/// Static page served in place of the requested path for an error status.
pub fn error_page(status: u16) -> Option<&'static str> {
    match status {
        400 => Some("/400.html"),
        403 => Some("/403.html"),
        404 => Some("/404.html"),
        _ => None,
    }
}

/// MIME type from the path suffix; `text/plain` when unknown.
pub fn content_type(path: &str) -> &'static str {
    let suffix = match path.rfind('.') {
        Some(idx) => &path[idx..],
        None => return "text/plain",
    };
    match suffix {
        ".html" => "text/html",
        ".xml" => "text/xml",
        ".xhtml" => "application/xhtml+xml",
        ".txt" => "text/plain",
        ".rtf" => "application/rtf",
        ".pdf" => "application/pdf",
        ".word" => "application/nsword",
        ".png" => "image/png",
        ".gif" => "image/gif",
        ".jpg" | ".jpeg" => "image/jpeg",
        ".au" => "audio/basic",
        ".mpeg" | ".mpg" => "video/mpeg",
        ".avi" => "video/x-msvideo",
        ".gz" => "application/x-gzip",
        ".tar" => "application/x-tar",
        ".css" => "text/css",
        ".js" => "text/javascript",
        _ => "text/plain",
    }
}
