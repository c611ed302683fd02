//! Exports the OpenAPI document.

use std::{
    fs,
    io::{self, Write},
    path::Path,
};

use anyhow::{Context, Result};
use server::openapi::ApiDoc;
use utoipa::OpenApi;

pub fn generate_spec(output: Option<&Path>) -> Result<()> {
    let json = ApiDoc::openapi().to_pretty_json()?;

    match output {
        Some(path) => {
            fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
            println!("OpenAPI spec written to {}", path.display());
        }
        None => io::stdout().write_all(json.as_bytes())?,
    }
    Ok(())
}
