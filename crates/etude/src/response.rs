// src/response.rs
use crate::buffer::NetBuffer;
use crate::http::{content_type, error_page, reason_phrase};
use crate::syscalls::MappedFile;
use std::ffi::OsString;
use std::fs::File;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Status used for an unknown or unset code.
const FALLBACK_STATUS: u16 = 400;

const S_IROTH: u32 = 0o004;

/// Builds the status line and headers for one request into the write buffer
/// and keeps the requested file mapped as the body. The mapping lives until
/// the next [`init`](Response::init) or [`unmap_file`](Response::unmap_file).
#[derive(Default)]
pub struct Response {
    status: Option<u16>,
    keep_alive: bool,
    root: PathBuf,
    path: String,
    file: Option<MappedFile>,
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepare for a new response. `preset` forces an error status and skips
    /// file resolution; `None` resolves `root + path` on disk.
    pub fn init(&mut self, root: &Path, path: &str, keep_alive: bool, preset: Option<u16>) {
        self.unmap_file();
        self.status = preset;
        self.keep_alive = keep_alive;
        self.root = root.to_path_buf();
        self.path.clear();
        self.path.push_str(path);
    }

    pub fn make_response(&mut self, buf: &mut NetBuffer) {
        let status = match self.status {
            Some(code) => code,
            None => self.resolve_status(),
        };
        let status = if reason_phrase(status).is_some() {
            status
        } else {
            FALLBACK_STATUS
        };
        self.status = Some(status);

        if let Some(page) = error_page(status) {
            self.path.clear();
            self.path.push_str(page);
        }

        self.add_status_line(buf, status);
        self.add_headers(buf);
        self.add_content(buf, status);
    }

    fn full_path(&self) -> PathBuf {
        // `path` is absolute, so join would discard the root.
        let mut full = OsString::from(self.root.as_os_str());
        full.push(&self.path);
        PathBuf::from(full)
    }

    fn resolve_status(&self) -> u16 {
        match std::fs::metadata(self.full_path()) {
            Err(_) => 404,
            Ok(meta) if meta.is_dir() => 404,
            Ok(meta) if meta.permissions().mode() & S_IROTH == 0 => 403,
            Ok(_) => 200,
        }
    }

    fn add_status_line(&self, buf: &mut NetBuffer, status: u16) {
        let reason = reason_phrase(status).unwrap_or("Bad Request");
        buf.append_str(&format!("HTTP/1.1 {} {}\r\n", status, reason));
    }

    fn add_headers(&self, buf: &mut NetBuffer) {
        if self.keep_alive {
            buf.append_str("Connection: keep-alive\r\n");
            buf.append_str("Keep-Alive: max=6, timeout=120\r\n");
        } else {
            buf.append_str("Connection: close\r\n");
        }
        buf.append_str("Content-type: ");
        buf.append_str(content_type(&self.path));
        buf.append_str("\r\n");
        buf.append_str("Date: ");
        buf.append_str(&httpdate::fmt_http_date(SystemTime::now()));
        buf.append_str("\r\n");
    }

    fn add_content(&mut self, buf: &mut NetBuffer, status: u16) {
        let full = self.full_path();
        let file = match File::open(&full) {
            Ok(file) => file,
            Err(e) => {
                tracing::debug!(path = %full.display(), error = %e, "cannot open response file");
                return self.error_content(buf, status, "File NotFound!");
            }
        };
        let len = match file.metadata() {
            Ok(meta) => meta.len() as usize,
            Err(_) => return self.error_content(buf, status, "File NotFound!"),
        };

        if len == 0 {
            buf.append_str("Content-length: 0\r\n\r\n");
            return;
        }
        match MappedFile::map(&file, len) {
            Ok(map) => {
                buf.append_str(&format!("Content-length: {}\r\n\r\n", len));
                self.file = Some(map);
            }
            Err(e) => {
                tracing::warn!(path = %full.display(), error = %e, "mmap failed");
                self.error_content(buf, status, "File NotFound!");
            }
        }
    }

    /// Inline HTML body for when the file itself is unavailable.
    fn error_content(&self, buf: &mut NetBuffer, status: u16, message: &str) {
        let reason = reason_phrase(status).unwrap_or("Bad Request");
        let body = format!(
            "<html><title>Error</title><body bgcolor=\"ffffff\">{} : {}\n<p>{}</p><hr><em>etude</em></body></html>",
            status, reason, message
        );
        buf.append_str(&format!("Content-length: {}\r\n\r\n", body.len()));
        buf.append_str(&body);
    }

    /// Release the mapped body, if any.
    pub fn unmap_file(&mut self) {
        self.file = None;
    }

    /// Mapped body bytes; empty when there is none.
    pub fn file(&self) -> &[u8] {
        self.file.as_ref().map(MappedFile::as_slice).unwrap_or(&[])
    }

    pub fn file_len(&self) -> usize {
        self.file.as_ref().map_or(0, MappedFile::len)
    }

    /// Final status once [`make_response`](Self::make_response) ran, else the preset.
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn site() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), "<h1>home</h1>").unwrap();
        fs::write(dir.path().join("404.html"), "missing").unwrap();
        fs::write(dir.path().join("403.html"), "forbidden").unwrap();
        fs::write(dir.path().join("400.html"), "bad").unwrap();
        fs::write(dir.path().join("empty.txt"), "").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        dir
    }

    fn build(
        root: &Path,
        path: &str,
        keep_alive: bool,
        preset: Option<u16>,
    ) -> (Response, String) {
        let mut resp = Response::new();
        let mut buf = NetBuffer::default();
        resp.init(root, path, keep_alive, preset);
        resp.make_response(&mut buf);
        (resp, buf.retrieve_all_as_string())
    }

    #[test]
    fn serves_existing_file() {
        let dir = site();
        let (resp, head) = build(dir.path(), "/index.html", true, None);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Connection: keep-alive\r\nKeep-Alive: max=6, timeout=120\r\n"));
        assert!(head.contains("Content-type: text/html\r\n"));
        assert!(head.contains("Date: "));
        assert!(head.ends_with("Content-length: 13\r\n\r\n"));
        assert_eq!(resp.file(), b"<h1>home</h1>");
        assert_eq!(resp.status(), Some(200));
    }

    #[test]
    fn missing_file_and_directory_are_404() {
        let dir = site();
        for path in ["/nope.html", "/sub"] {
            let (resp, head) = build(dir.path(), path, false, None);
            assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"), "{}", head);
            assert!(head.contains("Connection: close\r\n"));
            assert_eq!(resp.path(), "/404.html");
            assert_eq!(resp.file(), b"missing");
        }
    }

    #[test]
    fn file_without_world_read_is_403() {
        let dir = site();
        let secret = dir.path().join("secret.txt");
        fs::write(&secret, "top secret").unwrap();
        fs::set_permissions(&secret, fs::Permissions::from_mode(0o600)).unwrap();

        let (resp, head) = build(dir.path(), "/secret.txt", false, None);
        assert!(head.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert_eq!(resp.file(), b"forbidden");
    }

    #[test]
    fn preset_400_skips_resolution() {
        let dir = site();
        let (resp, head) = build(dir.path(), "/index.html", false, Some(400));
        assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert_eq!(resp.file(), b"bad");
    }

    #[test]
    fn unknown_status_falls_back_to_400() {
        let dir = site();
        let (_, head) = build(dir.path(), "/index.html", false, Some(418));
        assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[test]
    fn missing_error_page_gets_inline_body() {
        let dir = tempfile::tempdir().unwrap();
        let (resp, head) = build(dir.path(), "/gone.html", false, None);
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(head.contains("404 : Not Found\n<p>File NotFound!</p>"));
        assert_eq!(resp.file_len(), 0);

        let body_start = head.find("\r\n\r\n").unwrap() + 4;
        let declared = format!("Content-length: {}\r\n", head.len() - body_start);
        assert!(head.contains(&declared));
    }

    #[test]
    fn empty_file_has_zero_length_and_no_body() {
        let dir = site();
        let (resp, head) = build(dir.path(), "/empty.txt", false, None);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-type: text/plain\r\n"));
        assert!(head.ends_with("Content-length: 0\r\n\r\n"));
        assert!(resp.file().is_empty());
    }

    #[test]
    fn reinit_releases_the_previous_mapping() {
        let dir = site();
        let (mut resp, _) = build(dir.path(), "/index.html", false, None);
        assert_eq!(resp.file_len(), 13);
        resp.init(dir.path(), "/index.html", false, None);
        assert_eq!(resp.file_len(), 0);
    }
}
