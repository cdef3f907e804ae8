//! fastrpc transport layer
//!
//! A FastCGI responder that serves one request per accepted connection.
//! The rest of the system sees it only through the [`Listener`] and
//! [`Connection`] traits:
//! - accepting connections on a Unix or TCP socket
//! - reading the request parameters and the declared-length body
//! - writing the response stream and completing the request

pub mod connection;
pub mod error;
pub mod listener;
pub mod record;

pub use connection::{Connection, DRAIN_TIMEOUT, FcgiConnection, MAX_PARAMS_LEN};
pub use error::TransportError;
pub use listener::{FcgiListener, FcgiStream, ListenAddress, Listener};
