//! HTTP/1.1 request parsing and response assembly.

pub mod connection;
pub mod request;
pub mod response;

pub use connection::{HttpConn, ServerContext};
pub use request::{Progress, Request};
pub use response::Response;

use thiserror::Error;

/// Failures produced while parsing a request.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The request line did not match `METHOD SP TARGET SP "HTTP/" VERSION`.
    #[error("malformed request line")]
    BadRequest,
}
