//! Writes a default server configuration file.

use std::{fs, path::Path};

use anyhow::{Context, Result};
use clap::ValueEnum;
use shared::config::server::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ConfigFormat {
    Yaml,
    Json,
    Toml,
}

impl ConfigFormat {
    const fn extension(self) -> &'static str {
        match self {
            Self::Yaml => "yaml",
            Self::Json => "json",
            Self::Toml => "toml",
        }
    }
}

/// Serialize the development defaults in `format`.
pub fn render_config(format: ConfigFormat) -> Result<String> {
    let config = Config::default();
    let rendered = match format {
        ConfigFormat::Yaml => serde_yml::to_string(&config)?,
        ConfigFormat::Json => serde_json::to_string_pretty(&config)?,
        ConfigFormat::Toml => toml::to_string_pretty(&config)?,
    };
    Ok(rendered)
}

pub fn generate_config(format: ConfigFormat, output: Option<&Path>) -> Result<()> {
    let default_name = format!("livetail.{}", format.extension());
    let path = output.unwrap_or_else(|| Path::new(&default_name));

    let rendered = render_config(format)?;
    fs::write(path, rendered).with_context(|| format!("failed to write {}", path.display()))?;

    println!("Configuration file '{}' generated successfully.", path.display());
    Ok(())
}
