//! One accepted client connection.
//!
//! A connection owns its stream, a read and a write buffer, the request
//! parser, and the response builder. Exactly one worker touches a connection
//! at a time (one-shot interest guarantees this), so all methods take plain
//! `&mut self`. The response plan is two scatter-gather entries: the
//! write buffer's readable region (status line + headers) and the unsent
//! tail of the mapped file.

use std::io::{self, IoSlice, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, error};

use super::request::Progress;
use super::{Request, Response};
use crate::buffer::Buffer;
use crate::store::Credentials;

/// Keep draining a large response even in level-triggered mode while more
/// than this many bytes are pending.
const WRITE_LOOP_THRESHOLD: usize = 10240;

const BUFFER_CAPACITY: usize = 1024;

/// Process-wide state borrowed by every connection method and shared between
/// the reactor and the workers.
#[derive(Debug)]
pub struct ServerContext {
    /// Root directory static assets are served from.
    pub src_dir: PathBuf,
    /// Whether connection descriptors are registered edge-triggered.
    pub edge_triggered: bool,
    /// Live connection count; the reactor enforces the cap.
    pub user_count: AtomicUsize,
    /// Credential table the parser consults for login forms.
    pub credentials: Credentials,
}

/// A client connection and its in-flight exchange state.
#[derive(Debug)]
pub struct HttpConn {
    stream: TcpStream,
    peer: SocketAddr,
    closed: bool,
    keep_alive: bool,
    read_buf: Buffer,
    write_buf: Buffer,
    request: Request,
    response: Response,
    /// Bytes of the mapped body already handed to the kernel.
    body_written: usize,
}

impl HttpConn {
    /// Wraps an accepted stream and counts it against the context.
    pub fn new(stream: TcpStream, peer: SocketAddr, ctx: &ServerContext) -> Self {
        ctx.user_count.fetch_add(1, Ordering::Relaxed);
        Self {
            stream,
            peer,
            closed: false,
            keep_alive: false,
            read_buf: Buffer::new(BUFFER_CAPACITY),
            write_buf: Buffer::new(BUFFER_CAPACITY),
            request: Request::new(),
            response: Response::new(),
            body_written: 0,
        }
    }

    /// The connection's descriptor.
    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// The peer's address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// True once [`HttpConn::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether the current exchange asked to keep the connection open.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Bytes still owed to the peer: buffered headers plus the unsent tail
    /// of the mapped body.
    pub fn to_write(&self) -> usize {
        self.write_buf.readable_len() + self.body_len() - self.body_written
    }

    fn body_len(&self) -> usize {
        self.response.file().map_or(0, <[u8]>::len)
    }

    /// Fills the read buffer from the socket, once in level-triggered mode
    /// and until `WouldBlock` in edge-triggered mode. `Ok(0)` means the peer
    /// closed; `Err(WouldBlock)` means no bytes were available at all.
    pub fn read(&mut self, edge_triggered: bool) -> io::Result<usize> {
        let mut total = 0;
        loop {
            match self.read_buf.fill_from(&mut self.stream) {
                Ok(0) => return Ok(0),
                Ok(n) => {
                    total += n;
                    if !edge_triggered {
                        return Ok(total);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if total == 0 {
                        return Err(err);
                    }
                    return Ok(total);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }

    /// Runs the parser and, when a request is complete (or malformed),
    /// assembles the response. Returns true when interest should flip to
    /// WRITE, false when more request bytes are needed first.
    pub fn process(&mut self, ctx: &ServerContext) -> bool {
        match self.request.parse(&mut self.read_buf, &ctx.credentials) {
            Ok(Progress::NeedMore) => return false,
            Ok(Progress::Complete) => {
                self.keep_alive = self.request.is_keep_alive();
                self.response
                    .init(&ctx.src_dir, self.request.path(), self.keep_alive, None);
            }
            Err(err) => {
                error!("{}: {err}", self.peer);
                self.keep_alive = false;
                self.response
                    .init(&ctx.src_dir, self.request.path(), false, Some(400));
            }
        }
        self.request.reset();
        self.body_written = 0;
        self.response.build(&mut self.write_buf);
        true
    }

    /// Drains the response with scatter-gather writes: once in
    /// level-triggered mode (looping while a large body remains), and until
    /// drained or `WouldBlock` in edge-triggered mode.
    pub fn write(&mut self, edge_triggered: bool) -> io::Result<usize> {
        let mut total = 0;
        loop {
            let n = {
                let body = &self.response.file().unwrap_or(&[])[self.body_written..];
                let iov = [IoSlice::new(self.write_buf.readable()), IoSlice::new(body)];
                match self.stream.write_vectored(&iov) {
                    Ok(n) => n,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err),
                }
            };
            if n == 0 {
                return Ok(total);
            }
            total += n;
            self.advance_write_plan(n);
            if self.to_write() == 0 {
                return Ok(total);
            }
            if !(edge_triggered || self.to_write() > WRITE_LOOP_THRESHOLD) {
                return Ok(total);
            }
        }
    }

    /// Standard writev consumption over the two-entry plan: the first `n`
    /// bytes come out of the header region, the rest out of the body.
    fn advance_write_plan(&mut self, n: usize) {
        let head = self.write_buf.readable_len();
        if n <= head {
            self.write_buf.advance_read(n);
        } else {
            self.write_buf.advance_read(head);
            self.body_written += n - head;
        }
    }

    /// Releases the response mapping, gives back the connection slot, and
    /// shuts the socket down. Safe to call repeatedly.
    pub fn close(&mut self, ctx: &ServerContext) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.response.release();
        ctx.user_count.fetch_sub(1, Ordering::Relaxed);
        let _ = self.stream.shutdown(Shutdown::Both);
        debug!("{} closed", self.peer);
    }
}
