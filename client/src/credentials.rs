//! Access credentials presented to the relay.
//!
//! Tokens are obtained elsewhere (login flow, CI secret, config file); this
//! module only carries them to the `Authorization` header.

use kubetap_shared::{Error, Result};

pub const DEFAULT_TOKEN_TYPE: &str = "Bearer";

/// Token type and token, rendered as `Authorization: <type> <token>`
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token_type: String,
    pub token: String,
}

impl Credentials {
    pub fn new(token_type: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            token_type: token_type.into(),
            token: token.into(),
        }
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Self::new(DEFAULT_TOKEN_TYPE, token)
    }

    pub fn header_value(&self) -> String {
        format!("{} {}", self.token_type, self.token)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("token_type", &self.token_type)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Supplies credentials on demand, once per handshake.
pub trait CredentialSource: Send + Sync {
    fn credentials(&self) -> Result<Credentials>;
}

/// Credentials fixed for the lifetime of one invocation
#[derive(Debug, Clone)]
pub struct StaticCredentials(Credentials);

impl StaticCredentials {
    pub fn new(credentials: Credentials) -> Self {
        Self(credentials)
    }
}

impl CredentialSource for StaticCredentials {
    fn credentials(&self) -> Result<Credentials> {
        if self.0.token.is_empty() {
            return Err(Error::Config("access token is empty".into()));
        }
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_value() {
        assert_eq!(Credentials::bearer("abc").header_value(), "Bearer abc");
        assert_eq!(Credentials::new("Token", "xyz").header_value(), "Token xyz");
    }

    #[test]
    fn test_debug_redacts_token() {
        let shown = format!("{:?}", Credentials::bearer("super-secret"));
        assert!(!shown.contains("super-secret"));
        assert!(shown.contains("Bearer"));
    }

    #[test]
    fn test_empty_token_is_config_error() {
        let source = StaticCredentials::new(Credentials::bearer(""));
        assert!(matches!(source.credentials(), Err(Error::Config(_))));
    }
}
