//! Identifier types used throughout Octagon.
//!
//! Peer IDs are content-derived: the SHA-256 of the peer's signing public key,
//! base64-encoded behind a `SHA256:` prefix.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Container used when a caller does not name one.
pub const DEFAULT_CONTAINER: &str = "com.apple.security.keychain";

/// Context used when a caller does not name one.
pub const DEFAULT_CONTEXT: &str = "defaultContext";

/// Identifier of a peer (device identity) in the trust graph.
///
/// Normally produced by [`PeerId::from_signing_key`]. Arbitrary strings are
/// accepted through `From<&str>` so persisted values never fail to load.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Prefix carried by every key-derived peer ID.
    pub const PREFIX: &'static str = "SHA256:";

    /// Derives the peer ID for a signing public key.
    #[must_use]
    pub fn from_signing_key(public_key: &[u8]) -> Self {
        let digest = Sha256::digest(public_key);
        Self(format!("{}{}", Self::PREFIX, STANDARD.encode(digest)))
    }

    /// Parses a key-derived peer ID, rejecting anything that is not
    /// `SHA256:` followed by a base64 SHA-256 digest.
    pub fn parse(s: &str) -> crate::Result<Self> {
        let encoded = s
            .strip_prefix(Self::PREFIX)
            .ok_or_else(|| Error::InvalidPeerId(format!("missing {} prefix", Self::PREFIX)))?;
        let digest = STANDARD
            .decode(encoded)
            .map_err(|e| Error::InvalidPeerId(format!("bad base64: {e}")))?;
        if digest.len() != 32 {
            return Err(Error::InvalidPeerId(format!(
                "digest is {} bytes, expected 32",
                digest.len()
            )));
        }
        Ok(Self(s.to_string()))
    }

    /// Returns true if this ID has the key-derived shape.
    #[must_use]
    pub fn is_key_derived(&self) -> bool {
        Self::parse(&self.0).is_ok()
    }

    /// Returns the string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

macro_rules! scope_name {
    ($(#[$meta:meta])* $name:ident, $default:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a name from any string.
            #[must_use]
            pub fn new(name: impl Into<String>) -> Self {
                Self(name.into())
            }

            /// Returns the string form.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self($default.to_string())
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

scope_name!(
    /// Name of a trust container (one peer list on the remote service).
    ContainerName,
    DEFAULT_CONTAINER
);

scope_name!(
    /// Name of a local context within a container (one local identity).
    ContextId,
    DEFAULT_CONTEXT
);
