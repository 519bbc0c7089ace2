//! CLI settings
//!
//! Resolved in three layers, later layers winning: an optional YAML file,
//! `GHOSTGRES_*` environment variables, then command line flags.

use ghostgres::GhostgresError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_BIN_DIR: &str = "GHOSTGRES_PG_BIN_DIR";
pub const ENV_TEMPLATE_ROOT: &str = "GHOSTGRES_TEMPLATE_ROOT";
pub const ENV_TEMPLATE: &str = "GHOSTGRES_TEMPLATE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory containing `initdb` and `postgres`
    pub bin_dir: PathBuf,
    /// Directory holding the templates
    pub template_root: Option<PathBuf>,
    pub template_name: String,
    pub startup_timeout_ms: u64,
    /// Superuser password for frozen clusters
    pub password: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bin_dir: PathBuf::from("/usr/lib/postgresql/bin"),
            template_root: None,
            template_name: "default".to_string(),
            startup_timeout_ms: 1000,
            password: "ghostgres".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from a YAML file; missing keys take their defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let settings: Settings = serde_yaml::from_str(&content)?;
        Ok(settings)
    }

    /// Apply the `GHOSTGRES_*` environment variables
    pub fn apply_env(&mut self) {
        self.apply_vars(|key| std::env::var(key).ok());
    }

    fn apply_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());
        if let Some(dir) = var(ENV_BIN_DIR) {
            self.bin_dir = PathBuf::from(dir);
        }
        if let Some(root) = var(ENV_TEMPLATE_ROOT) {
            self.template_root = Some(PathBuf::from(root));
        }
        if let Some(name) = var(ENV_TEMPLATE) {
            self.template_name = name;
        }
    }

    pub fn validate(&self) -> ghostgres::Result<()> {
        if self.template_root.is_none() {
            return Err(GhostgresError::Configuration(format!(
                "template root is not set; pass --template-root or set {}",
                ENV_TEMPLATE_ROOT
            )));
        }
        if self.template_name.is_empty() {
            return Err(GhostgresError::Configuration(
                "template name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// The template root. Only meaningful after [`validate`](Self::validate).
    pub fn template_root(&self) -> &Path {
        self.template_root.as_deref().unwrap_or(Path::new(""))
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.bin_dir, PathBuf::from("/usr/lib/postgresql/bin"));
        assert_eq!(settings.template_name, "default");
        assert_eq!(settings.startup_timeout(), Duration::from_secs(1));
        assert!(settings.template_root.is_none());
    }

    #[test]
    fn test_from_file_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ghostgres.yml");
        std::fs::write(
            &path,
            "template_root: /var/lib/ghostgres\nstartup_timeout_ms: 5000\n",
        )
        .unwrap();

        let settings = Settings::from_file(&path).unwrap();
        assert_eq!(
            settings.template_root,
            Some(PathBuf::from("/var/lib/ghostgres"))
        );
        assert_eq!(settings.startup_timeout_ms, 5000);
        assert_eq!(settings.template_name, "default");
    }

    #[test]
    fn test_from_file_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ghostgres.yml");
        std::fs::write(&path, "startup_timeout_ms: soon\n").unwrap();
        assert!(Settings::from_file(&path).is_err());
        assert!(Settings::from_file(dir.path().join("missing.yml")).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_BIN_DIR, "/opt/pg/bin"),
            (ENV_TEMPLATE_ROOT, "/tmp/templates"),
            (ENV_TEMPLATE, ""),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings::default();
        settings.apply_vars(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(settings.bin_dir, PathBuf::from("/opt/pg/bin"));
        assert_eq!(settings.template_root(), Path::new("/tmp/templates"));
        // Empty values are ignored
        assert_eq!(settings.template_name, "default");
    }

    #[test]
    fn test_validate() {
        let mut settings = Settings::default();
        assert!(matches!(
            settings.validate(),
            Err(GhostgresError::Configuration(_))
        ));

        settings.template_root = Some(PathBuf::from("/tmp/templates"));
        settings.validate().unwrap();

        settings.template_name.clear();
        assert!(settings.validate().is_err());
    }
}
