#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! hearth is a single-host HTTP/1.1 static file server built around an
//! epoll reactor, a fixed pool of worker threads, and mmap-backed responses.
//!
//! The reactor accepts connections, registers them with one-shot readiness
//! interest, and hands per-connection read/write work to the pool; an
//! indexed min-heap of idle deadlines closes connections that go quiet.
//! Responses are assembled as a scatter-gather pair of header bytes and a
//! read-only file mapping, flushed with vectored writes.

pub mod buffer;
pub mod http;
pub mod poller;
pub mod pool;
pub mod server;
pub mod store;
pub mod timer;
