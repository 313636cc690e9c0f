//! Backend dial-in listener
//!
//! Every tunnel gets its own TCP port. The tunnel client opens up to
//! `max_conn_count` connections to it; each accepted socket becomes a backend
//! connection in the tunnel's pool.

mod server;

pub use server::{
    open_tunnel, BackendListener, BackendListenerConfig, BackendListenerError, TunnelInfo,
};
