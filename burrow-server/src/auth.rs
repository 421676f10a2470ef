//! Authentication and domain collaborators
//!
//! The core never stores accounts. Whoever embeds the server supplies a
//! [`TokenValidator`] (what does this token grant?) and a [`DomainResolver`]
//! (who owns this custom hostname?). Static in-memory implementations are
//! provided for the CLI and for tests.

use burrow_protocol::message::Quotas;
use std::collections::HashMap;
use subtle::ConstantTimeEq;

/// What a valid token grants.
#[derive(Debug, Clone)]
pub struct Grant {
    pub user_id: String,
    pub quotas: Quotas,
    /// Permission patterns: `"*"` for any subdomain, `"user-*"` for a
    /// literal prefix, otherwise exact names.
    pub allowed_subdomains: Vec<String>,
}

/// Why a token was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("invalid token")]
    InvalidToken,
    #[error("token expired")]
    TokenExpired,
}

/// Answers "is this token valid, and what does it grant?".
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> Result<Grant, AuthError>;
}

/// Fixed token table; comparisons are constant-time.
pub struct StaticTokenValidator {
    tokens: Vec<(String, Grant)>,
}

impl StaticTokenValidator {
    pub fn new(tokens: Vec<(String, Grant)>) -> Self {
        Self { tokens }
    }

    /// One token, full access: the single-user setup the CLI runs with.
    pub fn single(token: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::new(vec![(
            token.into(),
            Grant {
                user_id: user_id.into(),
                quotas: Quotas::default(),
                allowed_subdomains: vec!["*".to_string()],
            },
        )])
    }
}

impl TokenValidator for StaticTokenValidator {
    fn validate(&self, token: &str) -> Result<Grant, AuthError> {
        for (known, grant) in &self.tokens {
            if constant_time_eq(known.as_bytes(), token.as_bytes()) {
                return Ok(grant.clone());
            }
        }
        Err(AuthError::InvalidToken)
    }
}

/// Ownership record for a verified custom domain.
#[derive(Debug, Clone)]
pub struct DomainBinding {
    pub owner_user_id: String,
}

/// Maps a public hostname to its verified owner.
pub trait DomainResolver: Send + Sync {
    fn resolve(&self, hostname: &str) -> Option<DomainBinding>;
}

/// Fixed hostname-to-owner table.
#[derive(Default)]
pub struct StaticDomainResolver {
    domains: HashMap<String, String>,
}

impl StaticDomainResolver {
    pub fn new(domains: HashMap<String, String>) -> Self {
        Self { domains }
    }
}

impl DomainResolver for StaticDomainResolver {
    fn resolve(&self, hostname: &str) -> Option<DomainBinding> {
        self.domains.get(hostname).map(|owner| DomainBinding {
            owner_user_id: owner.clone(),
        })
    }
}

/// Constant-time byte comparison; length leaks, contents do not.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"longer-secret"));
    }

    #[test]
    fn test_static_validator() {
        let validator = StaticTokenValidator::single("tok-1", "alice");
        let grant = validator.validate("tok-1").unwrap();
        assert_eq!(grant.user_id, "alice");
        assert_eq!(validator.validate("nope").unwrap_err(), AuthError::InvalidToken);
    }

    #[test]
    fn test_static_resolver() {
        let mut domains = HashMap::new();
        domains.insert("app.example.com".to_string(), "alice".to_string());
        let resolver = StaticDomainResolver::new(domains);

        assert_eq!(
            resolver.resolve("app.example.com").unwrap().owner_user_id,
            "alice"
        );
        assert!(resolver.resolve("other.example.com").is_none());
    }
}
