//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports types from the [`secrecy`] crate. `SecretString` implements
//! `Debug` with redaction, so any struct deriving `Debug` that holds one is
//! safe to log.
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct RegisterCredentials {
//!     name: String,
//!     token: SecretString,
//! }
//!
//! let creds = RegisterCredentials {
//!     name: "Front Door".to_string(),
//!     token: SecretString::from("hunter2"),
//! };
//!
//! assert!(!format!("{creds:?}").contains("hunter2"));
//! assert_eq!(creds.token.expose_secret(), "hunter2");
//! ```
//!
//! Use `SecretString` for access tokens and anything a client proves
//! possession of. Compare with [`constant_time_eq`] rather than `==`.

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

/// Compare two byte strings in constant time via [`ring::constant_time`].
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    ring::constant_time::verify_slices_are_equal(a, b).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecretString::from("hunter2");
        let debug_str = format!("{secret:?}");

        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("hunter2"));
    }

    #[test]
    fn test_expose_secret_returns_inner_value() {
        let secret = SecretString::from("password123");
        assert_eq!(secret.expose_secret(), "password123");
    }

    #[test]
    fn test_deserialize_keeps_secret_redacted() {
        #[allow(dead_code)]
        #[derive(Debug, Deserialize)]
        struct Register {
            name: String,
            token: SecretString,
        }

        let json = r#"{"name": "Porch", "token": "abc-123"}"#;
        #[allow(clippy::unwrap_used)]
        let parsed: Register = serde_json::from_str(json).unwrap();

        let debug_str = format!("{parsed:?}");
        assert!(debug_str.contains("Porch"));
        assert!(!debug_str.contains("abc-123"));
        assert_eq!(parsed.token.expose_secret(), "abc-123");
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"token", b"token"));
        assert!(!constant_time_eq(b"token", b"tokem"));
        assert!(!constant_time_eq(b"token", b"token-longer"));
        assert!(constant_time_eq(b"", b""));
    }
}
