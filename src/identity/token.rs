//! Session Token
//!
//! Opaker Bezeichner des lokalen Clients. Wird beim Start einmalig erzeugt
//! und bleibt für die gesamte Laufzeit unverändert.
//!
//! ## Verwendung
//! ```rust
//! use peercall::Identity;
//!
//! # fn main() -> Result<(), peercall::identity::IdentityError> {
//! let me = Identity::generate();
//! let peer: Identity = "Zr8q".parse()?;
//! assert_ne!(me, peer);
//! # Ok(())
//! # }
//! ```

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Länge eines generierten Tokens
pub const TOKEN_LENGTH: usize = 32;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Identity must not be empty")]
    Empty,
}

// ============================================================================
// IDENTITY
// ============================================================================

/// Identität eines Teilnehmers (lokal oder remote)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    /// Erstellt eine Identität aus einem vorhandenen Token
    pub fn new(token: impl Into<String>) -> Result<Self, IdentityError> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(IdentityError::Empty);
        }
        Ok(Self(token))
    }

    /// Generiert ein neues zufälliges Token aus `[A-Za-z0-9]`
    pub fn generate() -> Self {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LENGTH)
            .map(char::from)
            .collect();
        Self(token)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Identity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Identity {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Identity> for String {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

// ============================================================================
// TESTS
// ============================================================================
