//! Routing of public requests to tunnels
//!
//! Tunnels are addressed by the first label(s) of the request's `Host` header:
//! `demo.example.com` routes to the tunnel `demo` when the relay serves
//! `example.com`.

pub mod http;

pub use http::{HostRouter, HttpRouterError};
