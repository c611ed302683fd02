use std::{env, fs, path::PathBuf, time::Duration};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use url::Url;

use super::server::ConfigError;

/// Settings for the client-side streaming sessions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the livetail server, e.g. `http://localhost:8080/`.
    pub server_url: Url,
    /// Bearer token presented on every request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// File re-read when the server rejects the current token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_file: Option<PathBuf>,
    /// Unfinished messages older than this are treated as abandoned.
    pub recovery_window_seconds: u64,
    pub poll_interval_ms: u64,
    pub poll_ceiling_seconds: u64,
    pub max_auth_refreshes: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: Url::parse("http://localhost:8080/").expect("static url parses"),
            token: None,
            token_file: None,
            recovery_window_seconds: 300,
            poll_interval_ms: 2_000,
            poll_ceiling_seconds: 120,
            max_auth_refreshes: 1,
        }
    }
}

impl ClientConfig {
    #[must_use]
    pub fn recovery_window(&self) -> Duration {
        Duration::from_secs(self.recovery_window_seconds)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    #[must_use]
    pub fn poll_ceiling(&self) -> Duration {
        Duration::from_secs(self.poll_ceiling_seconds)
    }

    /// Default location of the client configuration file.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("dev", "livetail", "livetail")
            .map(|dirs| dirs.config_dir().join("client.toml"))
    }

    /// Load from an explicit path, the default path when it exists, then apply
    /// `LIVETAIL_SERVER_URL` / `LIVETAIL_TOKEN`.
    pub fn load(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.or_else(|| Self::default_path().filter(|candidate| candidate.exists()));

        let mut config = match path {
            Some(path) => {
                let content = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
                toml::from_str(&content).map_err(|err| ConfigError::Parse {
                    path,
                    message: err.to_string(),
                })?
            }
            None => Self::default(),
        };

        if let Ok(url) = env::var("LIVETAIL_SERVER_URL") {
            config.server_url = Url::parse(&url).map_err(|_| ConfigError::InvalidEnv {
                name: "LIVETAIL_SERVER_URL",
                value: url,
            })?;
        }
        if let Ok(token) = env::var("LIVETAIL_TOKEN") {
            config.token = Some(token);
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_sane() {
        let config = ClientConfig::default();
        assert_eq!(config.recovery_window(), Duration::from_secs(300));
        assert_eq!(config.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.max_auth_refreshes, 1);
    }

    #[test]
    #[serial]
    fn load_reads_toml_and_env() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("client.toml");
        fs::write(&path, "poll_interval_ms = 500\ntoken = \"from-file\"\n").unwrap();

        unsafe {
            env::set_var("LIVETAIL_SERVER_URL", "http://example.test:9000/");
            env::remove_var("LIVETAIL_TOKEN");
        }

        let config = ClientConfig::load(Some(path)).unwrap();
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.token.as_deref(), Some("from-file"));
        assert_eq!(config.server_url.as_str(), "http://example.test:9000/");

        unsafe {
            env::remove_var("LIVETAIL_SERVER_URL");
        }
    }
}
