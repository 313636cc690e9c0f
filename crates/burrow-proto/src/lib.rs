//! Shared relay types
//!
//! Defines the tunnel identity (the public subdomain label) and the policy every
//! component applies to it.

pub mod identity;

pub use identity::{ClientId, IdentityError, MAX_ID_LEN, MIN_ID_LEN, RESERVED_IDS};

/// Default number of backend connections a tunnel may hold at once
pub const DEFAULT_MAX_SOCKETS: usize = 10;
