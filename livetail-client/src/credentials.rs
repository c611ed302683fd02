//! Bearer credential sources.

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use shared::config::client::ClientConfig;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("failed to read token file {path}: {message}")]
    Read { path: PathBuf, message: String },
    #[error("token file {0} is empty")]
    Empty(PathBuf),
}

/// Supplies the bearer token and a fresh one after the server rejects it.
#[async_trait]
pub trait CredentialProvider: Send + Sync + std::fmt::Debug {
    async fn token(&self) -> Result<Option<String>, CredentialError>;

    /// Obtain a replacement after a rejection.
    async fn refresh(&self) -> Result<Option<String>, CredentialError>;
}

/// A fixed token; refreshing yields the same value.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    token: Option<String>,
}

impl StaticCredentials {
    #[must_use]
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn token(&self) -> Result<Option<String>, CredentialError> {
        Ok(self.token.clone())
    }

    async fn refresh(&self) -> Result<Option<String>, CredentialError> {
        Ok(self.token.clone())
    }
}

/// Reads the token from a file on every call, so a rotated file is picked
/// up on refresh.
#[derive(Debug, Clone)]
pub struct FileCredentials {
    path: PathBuf,
}

impl FileCredentials {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    async fn read(&self) -> Result<Option<String>, CredentialError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|err| CredentialError::Read {
                path: self.path.clone(),
                message: err.to_string(),
            })?;
        let token = content.trim();
        if token.is_empty() {
            return Err(CredentialError::Empty(self.path.clone()));
        }
        Ok(Some(token.to_string()))
    }
}

#[async_trait]
impl CredentialProvider for FileCredentials {
    async fn token(&self) -> Result<Option<String>, CredentialError> {
        self.read().await
    }

    async fn refresh(&self) -> Result<Option<String>, CredentialError> {
        debug!(path = %self.path.display(), "re-reading token file");
        self.read().await
    }
}

/// `token_file` wins over an inline `token`.
#[must_use]
pub fn from_config(config: &ClientConfig) -> Arc<dyn CredentialProvider> {
    match &config.token_file {
        Some(path) => Arc::new(FileCredentials::new(path.clone())),
        None => Arc::new(StaticCredentials::new(config.token.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn file_credentials_pick_up_rotation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "first\n").unwrap();
        let credentials = FileCredentials::new(path.clone());

        assert_eq!(credentials.token().await.unwrap().as_deref(), Some("first"));
        std::fs::write(&path, "second").unwrap();
        assert_eq!(credentials.refresh().await.unwrap().as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn empty_token_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "  \n").unwrap();

        assert_eq!(
            FileCredentials::new(path.clone()).token().await,
            Err(CredentialError::Empty(path))
        );
    }

    #[tokio::test]
    async fn config_prefers_token_file() {
        let config = ClientConfig {
            token: Some("inline".into()),
            token_file: Some(PathBuf::from("/nonexistent/token")),
            ..ClientConfig::default()
        };
        assert!(from_config(&config).token().await.is_err());

        let config = ClientConfig {
            token: Some("inline".into()),
            ..ClientConfig::default()
        };
        assert_eq!(
            from_config(&config).token().await.unwrap().as_deref(),
            Some("inline")
        );
    }
}
