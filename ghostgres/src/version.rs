//! PostgreSQL server version probe

use crate::error::{GhostgresError, Result};
use crate::process;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;

static VERSION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[0-9]+\.[0-9]+\.[0-9]+").unwrap());

/// Extract the first `major.minor.patch` version from `output`
pub fn parse_version(output: &str) -> Result<String> {
    VERSION_RE
        .find(output)
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| {
            GhostgresError::Configuration(format!(
                "failed to parse postgres version from {}",
                output.trim()
            ))
        })
}

/// Version of the `postgres` binary in `bin_dir`, from `postgres --version`
pub async fn server_version(bin_dir: &Path) -> Result<String> {
    let output =
        process::run_to_completion(&bin_dir.join("postgres"), &["--version".to_string()]).await?;
    parse_version(&output)
}
