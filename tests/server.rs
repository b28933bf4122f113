//! End-to-end tests over real sockets: each test spins up a server on an
//! ephemeral port against a throwaway resource tree and speaks HTTP/1.1 to
//! it with a plain `TcpStream`.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;

use hearth::server::{Config, Server};
use tempfile::TempDir;

const LOGIN_PAGE: &str = "<html>login</html>";
const INDEX_PAGE: &str = "<html>index page</html>";
const MISSING_PAGE: &str = "<html>missing</html>";
const BAD_PAGE: &str = "<html>bad</html>";

fn spawn_server(timeout_ms: u64) -> (SocketAddr, TempDir) {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("login.html"), LOGIN_PAGE).unwrap();
    std::fs::write(dir.path().join("index.html"), INDEX_PAGE).unwrap();
    std::fs::write(dir.path().join("404.html"), MISSING_PAGE).unwrap();
    std::fs::write(dir.path().join("400.html"), BAD_PAGE).unwrap();
    std::fs::write(dir.path().join("403.html"), "<html>forbidden</html>").unwrap();

    let config = Config {
        port: 0,
        trigger_mode: 3,
        timeout_ms,
        linger: false,
        workers: 2,
        src_dir: Some(dir.path().to_path_buf()),
    };
    let mut server = Server::new(config).unwrap();
    let addr = server.local_addr().unwrap();
    thread::spawn(move || {
        let _ = server.run();
    });
    (addr, dir)
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

/// Reads one response: headers through the blank line, then exactly
/// `Content-length` body bytes.
fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut raw = Vec::new();
    let mut chunk = [0u8; 4096];
    let (head, body_start) = loop {
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "connection closed before the headers completed");
        raw.extend_from_slice(&chunk[..n]);
        if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
            break (String::from_utf8_lossy(&raw[..pos]).into_owned(), pos + 4);
        }
    };
    let declared: usize = head
        .lines()
        .find_map(|line| line.strip_prefix("Content-length: "))
        .map(|v| v.trim().parse().unwrap())
        .unwrap_or(0);
    let mut body = raw[body_start..].to_vec();
    while body.len() < declared {
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "connection closed before the body completed");
        body.extend_from_slice(&chunk[..n]);
    }
    assert_eq!(declared, body.len());
    (head, body)
}

/// Waits for the server to close the connection, tolerating a reset from a
/// lingering unsent byte.
fn assert_closed(stream: &mut TcpStream) {
    let mut chunk = [0u8; 256];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => return,
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::ConnectionReset => return,
            Err(err) => panic!("expected close, got {err}"),
        }
    }
}

#[test]
fn get_root_serves_login_page_and_keeps_alive() {
    let (addr, _dir) = spawn_server(60_000);
    let mut stream = connect(addr);

    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK"), "head: {head}");
    assert!(head.contains("Content-type: text/html"));
    assert!(head.contains("Connection: keep-alive"));
    assert_eq!(LOGIN_PAGE.as_bytes(), body.as_slice());

    // the connection stays usable for a second exchange
    stream
        .write_all(b"GET /index HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert_eq!(INDEX_PAGE.as_bytes(), body.as_slice());
}

#[test]
fn missing_file_serves_error_document_and_closes() {
    let (addr, _dir) = spawn_server(60_000);
    let mut stream = connect(addr);

    stream
        .write_all(b"GET /missing.html HTTP/1.1\r\nConnection: close\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 404 Not Found"), "head: {head}");
    assert!(head.contains("Connection: close"));
    assert_eq!(MISSING_PAGE.as_bytes(), body.as_slice());
    assert_closed(&mut stream);
}

#[test]
fn successful_login_serves_index() {
    let (addr, _dir) = spawn_server(60_000);
    let mut stream = connect(addr);

    stream
        .write_all(
            b"POST /doLogin HTTP/1.1\r\n\
              Content-Type: application/x-www-form-urlencoded\r\n\r\n\
              username=admin&password=123456",
        )
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK"), "head: {head}");
    assert_eq!(INDEX_PAGE.as_bytes(), body.as_slice());
    assert_closed(&mut stream);
}

#[test]
fn failed_login_misses_do_login_resource() {
    let (addr, _dir) = spawn_server(60_000);
    let mut stream = connect(addr);

    stream
        .write_all(
            b"POST /doLogin HTTP/1.1\r\n\
              Content-Type: application/x-www-form-urlencoded\r\n\
              Content-Length: 26\r\n\r\n\
              username=nobody&password=x",
        )
        .unwrap();
    let (head, body) = read_response(&mut stream);
    // no /doLogin file exists, so the rejected login resolves to 404
    assert!(head.starts_with("HTTP/1.1 404 Not Found"), "head: {head}");
    assert_eq!(MISSING_PAGE.as_bytes(), body.as_slice());
}

#[test]
fn malformed_request_line_gets_400() {
    let (addr, _dir) = spawn_server(60_000);
    let mut stream = connect(addr);

    stream.write_all(b"BOGUS\r\n\r\n").unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 400 Bad Request"), "head: {head}");
    assert!(head.contains("Connection: close"));
    assert_eq!(BAD_PAGE.as_bytes(), body.as_slice());
    assert_closed(&mut stream);
}

#[test]
fn idle_connections_are_closed_by_the_timer() {
    let (addr, _dir) = spawn_server(300);

    let mut idle: Vec<TcpStream> = (0..3).map(|_| connect(addr)).collect();
    for stream in &mut idle {
        // a partial request parks the connection in NeedMore
        stream.write_all(b"G").unwrap();
    }
    for stream in &mut idle {
        assert_closed(stream);
    }

    // the listener is still healthy afterwards
    let mut stream = connect(addr);
    stream
        .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
        .unwrap();
    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK"));
}

#[test]
fn burst_of_connections_is_accepted_and_served() {
    let (addr, _dir) = spawn_server(60_000);

    let mut streams: Vec<TcpStream> = (0..25).map(|_| connect(addr)).collect();
    for stream in &mut streams {
        stream
            .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .unwrap();
    }
    for stream in &mut streams {
        let (head, body) = read_response(stream);
        assert!(head.starts_with("HTTP/1.1 200 OK"));
        assert_eq!(LOGIN_PAGE.as_bytes(), body.as_slice());
        assert_closed(stream);
    }
}

#[test]
fn large_response_is_flushed_completely() {
    let (addr, dir) = spawn_server(60_000);
    // well past the socket buffer, so the writer has to survive partial
    // writes and EAGAIN round-trips
    let payload: Vec<u8> = (0..1_usize << 20).map(|i| (i % 251) as u8).collect();
    std::fs::write(dir.path().join("big.gz"), &payload).unwrap();

    let mut stream = connect(addr);
    stream
        .write_all(b"GET /big.gz HTTP/1.1\r\nConnection: close\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert!(head.contains("Content-type: application/x-gzip"));
    assert_eq!(payload, body);
    assert_closed(&mut stream);
}
