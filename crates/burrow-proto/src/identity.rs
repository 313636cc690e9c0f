//! Tunnel identities
//!
//! A tunnel is reachable under `<id>.<domain>`, so an identity must be a valid,
//! lowercase DNS label:
//! - lowercase ASCII letters, digits and hyphens only
//! - between [`MIN_ID_LEN`] and [`MAX_ID_LEN`] characters
//! - no leading or trailing hyphen
//! - not one of the [`RESERVED_IDS`]

use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Minimum identity length
pub const MIN_ID_LEN: usize = 4;

/// Maximum identity length (DNS label limit)
pub const MAX_ID_LEN: usize = 63;

/// Labels that are never handed out as tunnel identities
pub const RESERVED_IDS: &[&str] = &[
    "admin",
    "api",
    "ftp",
    "health",
    "localhost",
    "mail",
    "test",
    "www",
];

const ADJECTIVES: &[&str] = &[
    "brave", "calm", "clever", "cool", "eager", "fancy", "fast", "fuzzy", "gentle", "happy",
    "humble", "jolly", "kind", "lazy", "lucky", "mighty", "nice", "odd", "proud", "quiet",
    "rapid", "shy", "silly", "sleepy", "smart", "swift", "tall", "tidy", "wise", "young",
];

const ANIMALS: &[&str] = &[
    "badger", "bat", "bear", "bison", "cat", "cobra", "crab", "crow", "deer", "dog", "eagle",
    "fox", "frog", "goat", "hawk", "horse", "lion", "lizard", "mole", "moose", "mouse", "otter",
    "owl", "panda", "rabbit", "seal", "shark", "snail", "tiger", "wolf",
];

/// Identity validation errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("identity must be between {MIN_ID_LEN} and {MAX_ID_LEN} characters (got {0})")]
    InvalidLength(usize),

    #[error("identity contains invalid character '{0}' (only lowercase letters, digits and hyphens allowed)")]
    InvalidCharacter(char),

    #[error("identity cannot start or end with a hyphen")]
    EdgeHyphen,

    #[error("identity '{0}' is reserved")]
    Reserved(String),
}

/// A validated tunnel identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Parse and validate an identity
    ///
    /// # Examples
    /// ```
    /// use burrow_proto::ClientId;
    ///
    /// assert!(ClientId::parse("demo").is_ok());
    /// assert!(ClientId::parse("-demo").is_err());
    /// assert!(ClientId::parse("admin").is_err());
    /// ```
    pub fn parse(id: &str) -> Result<Self, IdentityError> {
        let len = id.len();
        if !(MIN_ID_LEN..=MAX_ID_LEN).contains(&len) {
            return Err(IdentityError::InvalidLength(len));
        }

        if let Some(ch) = id
            .chars()
            .find(|ch| !(ch.is_ascii_lowercase() || ch.is_ascii_digit() || *ch == '-'))
        {
            return Err(IdentityError::InvalidCharacter(ch));
        }

        if id.starts_with('-') || id.ends_with('-') {
            return Err(IdentityError::EdgeHyphen);
        }

        if RESERVED_IDS.contains(&id) {
            return Err(IdentityError::Reserved(id.to_string()));
        }

        Ok(Self(id.to_string()))
    }

    /// Generate a random human-readable identity (e.g. `swift-otter-42`)
    ///
    /// Generated identities always satisfy the validation policy. They are not
    /// guaranteed unique; callers retry on collision.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("quick");
        let animal = ANIMALS.choose(&mut rng).copied().unwrap_or("fox");
        let number: u16 = rng.gen_range(10..100);
        Self(format!("{}-{}-{}", adjective, animal, number))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ClientId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for ClientId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
