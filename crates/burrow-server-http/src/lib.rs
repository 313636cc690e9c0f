//! Public HTTP side of the relay
//!
//! - [`forwarder`]: sends one request (or upgraded session) through one pooled
//!   backend connection
//! - [`server`]: public HTTP/1.1 listener routing requests by `Host`

pub mod forwarder;
pub mod server;

pub use forwarder::{is_upgrade_request, BoxError, ForwardError, ForwarderConfig, RequestForwarder};
pub use server::{HttpServer, HttpServerConfig, HttpServerError};
