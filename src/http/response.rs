//! Response assembly: status resolution, headers, and the mmap-backed body.
//!
//! The builder resolves the target under the source root with `stat`,
//! rewrites error statuses onto their canonical error documents, appends the
//! status line and headers into the connection's write buffer, and maps the
//! file read-only for the body. The mapping lives exactly as long as one
//! response: `init` and `release` both drop it.

use std::fs::{self, File};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use log::warn;
use memmap2::{Mmap, MmapOptions};

use crate::buffer::Buffer;

const CODE_STATUS: [(u16, &str); 4] = [
    (200, "OK"),
    (400, "Bad Request"),
    (403, "Forbidden"),
    (404, "Not Found"),
];

const CODE_PATH: [(u16, &str); 3] = [(400, "/400.html"), (403, "/403.html"), (404, "/404.html")];

fn reason(code: u16) -> Option<&'static str> {
    CODE_STATUS
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, reason)| *reason)
}

fn error_page(code: u16) -> Option<&'static str> {
    CODE_PATH
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, path)| *path)
}

/// Content type inferred from the lowercased extension.
fn content_type(path: &str) -> &'static str {
    let ext = match path.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => return "text/plain",
    };
    match ext.as_str() {
        "html" => "text/html",
        "xml" => "text/xml",
        "xhtml" => "application/xhtml+xml",
        "txt" => "text/plain",
        "rtf" => "application/rtf",
        "pdf" => "application/pdf",
        "word" => "application/msword",
        "png" => "image/png",
        "gif" => "image/gif",
        "jpg" | "jpeg" => "image/jpeg",
        "au" => "audio/basic",
        "mpeg" | "mpg" => "video/mpeg",
        "avi" => "video/x-msvideo",
        "gz" => "application/x-gzip",
        "tar" => "application/x-tar",
        "css" => "text/css",
        "js" => "text/javascript",
        _ => "text/plain",
    }
}

/// Builder for one response, owning the body mapping while it is in flight.
#[derive(Debug, Default)]
pub struct Response {
    status: Option<u16>,
    keep_alive: bool,
    path: String,
    src_dir: PathBuf,
    file: Option<Mmap>,
}

impl Response {
    /// Creates an unset builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets for a new exchange, releasing any previous mapping. A `status`
    /// of `None` lets `build` derive it from the filesystem.
    pub fn init(&mut self, src_dir: &Path, path: &str, keep_alive: bool, status: Option<u16>) {
        self.release();
        self.status = status;
        self.keep_alive = keep_alive;
        self.path = path.to_owned();
        self.src_dir = src_dir.to_owned();
    }

    /// Appends the status line and headers into `buf` and maps the body. A
    /// preset status (a parse failure's 400) skips filesystem resolution.
    pub fn build(&mut self, buf: &mut Buffer) {
        let code = match self.status {
            Some(code) => code,
            None => match fs::metadata(self.target()) {
                Err(_) => 404,
                Ok(meta) if meta.is_dir() => 404,
                Ok(meta) if meta.permissions().mode() & 0o004 == 0 => 403,
                Ok(_) => 200,
            },
        };
        self.status = Some(code);
        if let Some(page) = error_page(code) {
            self.path = page.to_owned();
        }
        self.add_status_line(buf);
        self.add_headers(buf);
        self.add_content(buf);
    }

    /// The resolved status code; unknown codes have collapsed to 400.
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// The mapped body, when a file is mapped.
    pub fn file(&self) -> Option<&[u8]> {
        self.file.as_deref()
    }

    /// Drops the body mapping. Safe to call repeatedly.
    pub fn release(&mut self) {
        self.file = None;
    }

    fn target(&self) -> PathBuf {
        self.src_dir.join(self.path.trim_start_matches('/'))
    }

    fn add_status_line(&mut self, buf: &mut Buffer) {
        let code = self.status.unwrap_or(400);
        let (code, reason) = match reason(code) {
            Some(reason) => (code, reason),
            None => (400, "Bad Request"),
        };
        self.status = Some(code);
        buf.append(format!("HTTP/1.1 {code} {reason}\r\n").as_bytes());
    }

    fn add_headers(&self, buf: &mut Buffer) {
        if self.keep_alive {
            buf.append(b"Connection: keep-alive\r\n");
            buf.append(b"keep-alive: max=6, timeout=120\r\n");
        } else {
            buf.append(b"Connection: close\r\n");
        }
        buf.append(format!("Content-type: {}\r\n", content_type(&self.path)).as_bytes());
    }

    fn add_content(&mut self, buf: &mut Buffer) {
        let file = match File::open(self.target()) {
            Ok(file) => file,
            Err(err) => {
                warn!("{}: open failed: {err}", self.path);
                self.error_body(buf, "File NotFound!");
                return;
            }
        };
        let len = file.metadata().map(|meta| meta.len()).unwrap_or(0);
        if len == 0 {
            // mapping an empty file is EINVAL; send a bodyless response
            buf.append(b"Content-length: 0\r\n\r\n");
            return;
        }
        // Safety: the mapping is read-only and private; concurrent file
        // truncation would fault, which we accept for a static asset tree.
        match unsafe { MmapOptions::new().map_copy_read_only(&file) } {
            Ok(map) => {
                buf.append(format!("Content-length: {len}\r\n\r\n").as_bytes());
                self.file = Some(map);
            }
            Err(err) => {
                warn!("{}: mmap failed: {err}", self.path);
                self.error_body(buf, "File NotFound!");
            }
        }
    }

    /// Appends an inline HTML error body with its `Content-length`.
    fn error_body(&self, buf: &mut Buffer, message: &str) {
        let code = self.status.unwrap_or(400);
        let reason = reason(code).unwrap_or("Bad Request");
        let body = format!(
            "<html><title>Error</title><body bgcolor=\"ffffff\">{code} : {reason}\n\
             <p>{message}</p><hr><em>hearth</em></body></html>"
        );
        buf.append(format!("Content-length: {}\r\n\r\n", body.len()).as_bytes());
        buf.append(body.as_bytes());
    }
}
