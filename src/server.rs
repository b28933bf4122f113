//! The reactor: listen-socket lifecycle, accept loop, event dispatch.
//!
//! One reactor thread owns the demuxer waits, the timer heap, and the
//! connection table. Per-connection read/write work runs on the pool;
//! one-shot interest guarantees a connection is never handed to two workers
//! at once. Workers re-arm interest themselves through the shared poller and
//! report teardown over a channel, waking the reactor to finish the close.

use std::collections::HashMap;
use std::io::{self, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;

use crate::http::{HttpConn, ServerContext};
use crate::poller::{Events, Interest, Poller, Waker};
use crate::pool::WorkerPool;
use crate::store::Credentials;
use crate::timer::TimerHeap;

/// Hard cap on simultaneously open client connections.
const MAX_FD: usize = 65536;

/// Sent verbatim to peers accepted over the cap.
const BUSY: &[u8] = b"Server busy!";

const BACKLOG: i32 = 6;

/// Fatal start-up and event-loop failures.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listen socket could not be created or configured.
    #[error("failed to set up listen socket: {0}")]
    Socket(#[source] io::Error),
    /// The local address could not be bound.
    #[error("failed to bind port {port}: {source}")]
    Bind {
        /// The requested port.
        port: u16,
        /// The underlying failure.
        source: io::Error,
    },
    /// The socket could not enter the listening state.
    #[error("failed to listen on port {port}: {source}")]
    Listen {
        /// The requested port.
        port: u16,
        /// The underlying failure.
        source: io::Error,
    },
    /// The readiness facility could not be set up.
    #[error("failed to set up poller: {0}")]
    Poller(#[source] io::Error),
    /// The static asset root could not be resolved.
    #[error("failed to resolve source root: {0}")]
    SrcDir(#[source] io::Error),
    /// The event-loop wait failed.
    #[error("event wait failed: {0}")]
    Wait(#[source] io::Error),
}

/// Reactor configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP port to listen on; 0 picks an ephemeral port.
    pub port: u16,
    /// Trigger mode: bit 0 = connection edge, bit 1 = listen edge. Values
    /// above 3 clamp to both-edge.
    pub trigger_mode: u8,
    /// Idle timeout per connection in milliseconds; 0 disables the timer.
    pub timeout_ms: u64,
    /// Arms a one-second `SO_LINGER` on the listen socket.
    pub linger: bool,
    /// Number of worker threads.
    pub workers: usize,
    /// Static asset root; defaults to `<cwd>/resources`.
    pub src_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 10000,
            trigger_mode: 5,
            timeout_ms: 60_000,
            linger: false,
            workers: 12,
            src_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Unit {
    Read,
    Write,
}

/// What a worker decided should happen to a connection next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    /// Re-arm read interest.
    Read,
    /// Re-arm write interest.
    Write,
    /// Tear the connection down.
    Close,
}

/// The HTTP server reactor.
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    poller: Arc<Poller>,
    waker: Arc<Waker>,
    timer: TimerHeap,
    pool: WorkerPool,
    conns: HashMap<RawFd, Arc<Mutex<HttpConn>>>,
    ctx: Arc<ServerContext>,
    close_tx: Sender<RawFd>,
    closes: Receiver<RawFd>,
    listen_interest: Interest,
    conn_interest: Interest,
    timeout: Option<Duration>,
}

impl Server {
    /// Binds the listen socket, seeds the demo credentials, and spawns the
    /// worker pool. Fails fast on any socket or poller problem.
    pub fn new(config: Config) -> Result<Self, ServerError> {
        let src_dir = match config.src_dir {
            Some(dir) => dir,
            None => std::env::current_dir()
                .map_err(ServerError::SrcDir)?
                .join("resources"),
        };
        let (listen_interest, conn_interest) = event_mode(config.trigger_mode);

        let listener = init_socket(config.port, config.linger)?;
        let poller = Arc::new(Poller::new().map_err(ServerError::Poller)?);
        poller
            .add(listener.as_raw_fd(), listen_interest | Interest::READ)
            .map_err(ServerError::Poller)?;
        let waker = Arc::new(Waker::new(&poller).map_err(ServerError::Poller)?);

        let credentials = Credentials::new();
        credentials.insert("root", "123456");
        credentials.insert("admin", "123456");

        let ctx = Arc::new(ServerContext {
            src_dir,
            edge_triggered: conn_interest.contains(Interest::EDGE),
            user_count: AtomicUsize::new(0),
            credentials,
        });
        let (close_tx, closes) = unbounded();
        let timeout = (config.timeout_ms > 0).then(|| Duration::from_millis(config.timeout_ms));

        if let Ok(addr) = listener.local_addr() {
            info!("hearth listening on port {}", addr.port());
        }

        Ok(Self {
            listener,
            poller,
            waker,
            timer: TimerHeap::new(),
            pool: WorkerPool::new(config.workers),
            conns: HashMap::new(),
            ctx,
            close_tx,
            closes,
            listen_interest,
            conn_interest,
            timeout,
        })
    }

    /// Address of the listen socket.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the reactor until the demuxer fails. Expired idle timers are
    /// handled before the events of each iteration.
    pub fn run(&mut self) -> Result<(), ServerError> {
        let mut events = Events::with_capacity(1024);
        loop {
            let timeout_ms = match self.timeout {
                Some(_) => {
                    for fd in self.timer.pop_expired(Instant::now()) {
                        debug!("fd {fd}: idle timeout");
                        self.close_fd(fd);
                    }
                    self.timer
                        .next_timeout(Instant::now())
                        .map_or(-1, |d| d.as_millis() as i32)
                }
                None => -1,
            };
            self.poller
                .wait(&mut events, timeout_ms)
                .map_err(ServerError::Wait)?;
            for event in events.iter() {
                let fd = event.fd();
                if fd == self.listener.as_raw_fd() {
                    self.accept();
                } else if fd == self.waker.fd() {
                    self.waker.drain();
                    while let Ok(fd) = self.closes.try_recv() {
                        self.close_fd(fd);
                    }
                } else if event.is_closed() {
                    self.close_fd(fd);
                } else if event.is_readable() {
                    self.dispatch(fd, Unit::Read);
                } else if event.is_writable() {
                    self.dispatch(fd, Unit::Write);
                } else {
                    debug!("fd {fd}: unexpected event");
                }
            }
        }
    }

    /// Accepts pending connections: one per event in level-triggered mode,
    /// the whole burst when the listen socket is edge-triggered.
    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.ctx.user_count.load(Ordering::Relaxed) >= MAX_FD {
                        warn!("connection table full, refusing {peer}");
                        send_busy(stream);
                        return;
                    }
                    if let Err(err) = stream.set_nonblocking(true) {
                        error!("{peer}: set_nonblocking failed: {err}");
                        continue;
                    }
                    let fd = stream.as_raw_fd();
                    let conn = HttpConn::new(stream, peer, &self.ctx);
                    self.conns.insert(fd, Arc::new(Mutex::new(conn)));
                    if let Some(timeout) = self.timeout {
                        self.timer.add(fd, timeout);
                    }
                    if let Err(err) = self.poller.add(fd, self.conn_interest | Interest::READ) {
                        error!("fd {fd}: register failed: {err}");
                        self.close_fd(fd);
                        continue;
                    }
                    debug!("{peer} connected as fd {fd}");
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    error!("accept failed: {err}");
                    return;
                }
            }
            if !self.listen_interest.contains(Interest::EDGE) {
                return;
            }
        }
    }

    /// Extends the idle timer and hands one unit of work to the pool. The
    /// worker re-arms interest (one-shot) or reports a close back.
    fn dispatch(&mut self, fd: RawFd, unit: Unit) {
        let conn = match self.conns.get(&fd) {
            Some(conn) => Arc::clone(conn),
            None => return,
        };
        if let Some(timeout) = self.timeout {
            self.timer.update(fd, timeout);
        }

        let ctx = Arc::clone(&self.ctx);
        let poller = Arc::clone(&self.poller);
        let waker = Arc::clone(&self.waker);
        let close_tx = self.close_tx.clone();
        let interest = self.conn_interest;
        self.pool.submit(move || {
            let mut conn = match conn.lock() {
                Ok(conn) => conn,
                Err(_) => return,
            };
            let verdict = match unit {
                Unit::Read => on_read(&mut conn, &ctx),
                Unit::Write => on_write(&mut conn, &ctx),
            };
            match verdict {
                Verdict::Read => rearm(&poller, fd, interest | Interest::READ),
                Verdict::Write => rearm(&poller, fd, interest | Interest::WRITE),
                Verdict::Close => {
                    let _ = close_tx.send(fd);
                    if let Err(err) = waker.wake() {
                        error!("waker failed: {err}");
                    }
                }
            }
        });
    }

    /// Removes a connection from the table, the timer, and the demuxer,
    /// then closes it. A second call for the same fd is a no-op.
    fn close_fd(&mut self, fd: RawFd) {
        let conn = match self.conns.remove(&fd) {
            Some(conn) => conn,
            None => return,
        };
        self.timer.cancel(fd);
        if let Err(err) = self.poller.remove(fd) {
            debug!("fd {fd}: deregister failed: {err}");
        }
        let lock_result = conn.lock();
        if let Ok(mut guard) = lock_result {
            guard.close(&self.ctx);
        }
    }
}

fn rearm(poller: &Poller, fd: RawFd, interest: Interest) {
    if let Err(err) = poller.modify(fd, interest) {
        error!("fd {fd}: rearm failed: {err}");
    }
}

fn on_read(conn: &mut HttpConn, ctx: &ServerContext) -> Verdict {
    match conn.read(ctx.edge_triggered) {
        Ok(0) => {
            debug!("{}: peer closed", conn.peer());
            return Verdict::Close;
        }
        Err(err) if err.kind() != io::ErrorKind::WouldBlock => {
            error!("{}: read failed: {err}", conn.peer());
            return Verdict::Close;
        }
        _ => {}
    }
    on_process(conn, ctx)
}

fn on_process(conn: &mut HttpConn, ctx: &ServerContext) -> Verdict {
    if conn.process(ctx) {
        Verdict::Write
    } else {
        Verdict::Read
    }
}

fn on_write(conn: &mut HttpConn, ctx: &ServerContext) -> Verdict {
    let result = conn.write(ctx.edge_triggered);
    if conn.to_write() == 0 {
        // response fully flushed
        if conn.keep_alive() {
            return on_process(conn, ctx);
        }
        return Verdict::Close;
    }
    match result {
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Verdict::Write,
        Ok(_) => Verdict::Close,
        Err(err) => {
            error!("{}: write failed: {err}", conn.peer());
            Verdict::Close
        }
    }
}

fn send_busy(mut stream: TcpStream) {
    if let Err(err) = stream.write_all(BUSY) {
        warn!("busy notice failed: {err}");
    }
}

/// Splits the trigger mode into (listen, connection) registration modifiers.
/// Connections always carry one-shot interest so only one worker at a time
/// can observe a connection as ready.
fn event_mode(mode: u8) -> (Interest, Interest) {
    let mut listen = Interest::PEER_HUP;
    let mut conn = Interest::ONE_SHOT | Interest::PEER_HUP;
    match mode {
        0 => {}
        1 => conn |= Interest::EDGE,
        2 => listen |= Interest::EDGE,
        _ => {
            listen |= Interest::EDGE;
            conn |= Interest::EDGE;
        }
    }
    (listen, conn)
}

fn init_socket(port: u16, linger: bool) -> Result<TcpListener, ServerError> {
    let socket =
        Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(ServerError::Socket)?;
    socket.set_reuse_address(true).map_err(ServerError::Socket)?;
    if linger {
        // drain-then-close on shutdown, bounded at one second
        socket
            .set_linger(Some(Duration::from_secs(1)))
            .map_err(ServerError::Socket)?;
    }
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket
        .bind(&addr.into())
        .map_err(|source| ServerError::Bind { port, source })?;
    socket
        .listen(BACKLOG)
        .map_err(|source| ServerError::Listen { port, source })?;
    socket.set_nonblocking(true).map_err(ServerError::Socket)?;
    Ok(socket.into())
}
