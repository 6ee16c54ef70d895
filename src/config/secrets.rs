//! Credential handling.
//!
//! Provider keys and the database URL stay wrapped until the moment they are
//! handed to a client; everything else sees the redacted `Debug` form.

pub use secrecy::{ExposeSecret, SecretString};

/// Wrap a plain string read from somewhere other than the environment.
pub fn secret(value: impl Into<String>) -> SecretString {
    SecretString::from(value.into())
}
