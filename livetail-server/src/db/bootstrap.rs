//! Applies the SQL under `db.bootstrap_path` stage by stage: tables, the
//! change-notification triggers, indexes and optional seed data.

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, info, warn};

use shared::config::server::DatabaseConfig;

/// Stage folder and whether it must exist.
const STAGES: &[(&str, bool)] = &[
    ("schema", true),
    ("procedures", true),
    ("indexes", true),
    ("seed", false),
];

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("database bootstrap directory does not exist: {0}")]
    MissingRoot(PathBuf),
    #[error("database bootstrap stage '{stage}' missing at {path}")]
    MissingStage { stage: &'static str, path: PathBuf },
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("database error executing {path}: {source}")]
    Sql {
        path: PathBuf,
        #[source]
        source: sqlx::Error,
    },
}

/// Run every stage in order; returns how many scripts were applied.
pub async fn run(pool: &PgPool, config: &DatabaseConfig) -> Result<usize, BootstrapError> {
    let root = &config.bootstrap_path;
    if !root.exists() {
        return Err(BootstrapError::MissingRoot(root.clone()));
    }

    info!(path = %root.display(), "running database bootstrap");
    let mut applied = 0;
    for &(stage, required) in STAGES {
        let stage_path = root.join(stage);
        if !stage_path.exists() {
            if required {
                return Err(BootstrapError::MissingStage {
                    stage,
                    path: stage_path,
                });
            }
            debug!(stage, "optional bootstrap stage absent");
            continue;
        }

        let files = collect_sql_files(&stage_path)?;
        info!(stage, count = files.len(), "applying bootstrap scripts");
        for path in files {
            if apply_script(pool, &path).await? {
                applied += 1;
            }
        }
    }

    Ok(applied)
}

/// Startup liveness check.
pub async fn ensure_liveness(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await.map(|_| ())
}

/// Readiness probe; fails until the bootstrap procedures exist.
pub async fn ensure_readiness(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("CALL livetail.sp_healthz()")
        .execute(pool)
        .await
        .map(|_| ())
}

fn collect_sql_files(dir: &Path) -> Result<Vec<PathBuf>, BootstrapError> {
    let io_error = |source| BootstrapError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_error)? {
        let path = entry.map_err(io_error)?.path();
        if path
            .extension()
            .and_then(OsStr::to_str)
            .is_some_and(|ext| ext.eq_ignore_ascii_case("sql"))
        {
            entries.push(path);
        }
    }

    entries.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(entries)
}

/// Execute one script inside a transaction. Empty scripts are skipped.
async fn apply_script(pool: &PgPool, path: &Path) -> Result<bool, BootstrapError> {
    let sql = fs::read_to_string(path).map_err(|source| BootstrapError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let trimmed = sql.trim();
    if trimmed.is_empty() {
        warn!(path = %path.display(), "skipping empty bootstrap script");
        return Ok(false);
    }

    let sql_error = |source| BootstrapError::Sql {
        path: path.to_path_buf(),
        source,
    };
    let mut transaction = pool.begin().await.map_err(sql_error)?;
    debug!(script = %path.display(), "executing bootstrap script");
    sqlx::raw_sql(trimmed)
        .execute(&mut *transaction)
        .await
        .map_err(sql_error)?;
    transaction.commit().await.map_err(sql_error)?;
    Ok(true)
}
