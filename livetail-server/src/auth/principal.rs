//! Bearer credential resolution.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use shared::config::server::{AuthConfig, StaticToken};
use thiserror::Error;

/// The authenticated caller attached to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub subject: String,
    pub is_admin: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("unknown credential")]
    Unknown,
    #[error("credential expired")]
    Expired,
}

#[async_trait]
pub trait PrincipalResolver: Send + Sync {
    async fn resolve(&self, token: &str) -> Result<Principal, ResolveError>;
}

/// Tokens listed in the `auth` configuration section.
#[derive(Debug, Default)]
pub struct StaticTokenResolver {
    tokens: HashMap<String, StaticToken>,
}

impl StaticTokenResolver {
    #[must_use]
    pub fn from_config(config: &AuthConfig) -> Self {
        Self {
            tokens: config
                .tokens
                .iter()
                .map(|entry| (entry.token.clone(), entry.clone()))
                .collect(),
        }
    }
}

#[async_trait]
impl PrincipalResolver for StaticTokenResolver {
    async fn resolve(&self, token: &str) -> Result<Principal, ResolveError> {
        let entry = self.tokens.get(token).ok_or(ResolveError::Unknown)?;
        if entry
            .expires_at
            .is_some_and(|expires_at| expires_at <= Utc::now().timestamp())
        {
            return Err(ResolveError::Expired);
        }
        Ok(Principal {
            subject: entry.subject.clone(),
            is_admin: entry.is_admin,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> StaticTokenResolver {
        StaticTokenResolver::from_config(&AuthConfig {
            tokens: vec![
                StaticToken {
                    token: "admin".into(),
                    subject: "ops".into(),
                    is_admin: true,
                    expires_at: None,
                },
                StaticToken {
                    token: "stale".into(),
                    subject: "old".into(),
                    is_admin: true,
                    expires_at: Some(0),
                },
            ],
        })
    }

    #[tokio::test]
    async fn resolves_known_tokens() {
        let principal = resolver().resolve("admin").await.unwrap();
        assert_eq!(principal.subject, "ops");
        assert!(principal.is_admin);
    }

    #[tokio::test]
    async fn rejects_unknown_and_expired_tokens() {
        let resolver = resolver();
        assert_eq!(resolver.resolve("nope").await, Err(ResolveError::Unknown));
        assert_eq!(resolver.resolve("stale").await, Err(ResolveError::Expired));
    }
}
