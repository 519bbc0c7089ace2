//! Named, version scoped cluster templates
//!
//! A template is a frozen copy of an initialized cluster stored at
//!
//! ```text
//! <root>/<name>/<postgres version>/data/           snapshot of the data directory
//! <root>/<name>/<postgres version>/ghostgres.json  cluster settings
//! ```
//!
//! The server version is part of the path so a template created with one
//! PostgreSQL build is never reused with another.

use crate::cluster::PostgresCluster;
use crate::error::{GhostgresError, Result, StateError};
use crate::observer::{self, FailureObserver};
use crate::version;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Settings file stored alongside each snapshot
pub const DESCRIPTOR_FILE_NAME: &str = "ghostgres.json";

/// Snapshot directory inside a template
pub const SNAPSHOT_DIR_NAME: &str = "data";

/// Identity of one template: root directory, name and server version
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TemplateId {
    pub root: PathBuf,
    pub name: String,
    pub version: String,
}

impl TemplateId {
    pub fn path(&self) -> PathBuf {
        self.root.join(&self.name).join(&self.version)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.path().join(SNAPSHOT_DIR_NAME)
    }

    pub fn descriptor_file(&self) -> PathBuf {
        self.path().join(DESCRIPTOR_FILE_NAME)
    }

    pub fn exists(&self) -> bool {
        self.descriptor_file().try_exists().unwrap_or(false)
    }
}

/// Templates for one PostgreSQL version under one root directory
pub struct TemplateStore {
    root: PathBuf,
    version: String,
    fail_with: Option<FailureObserver>,
}

impl std::fmt::Debug for TemplateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateStore")
            .field("root", &self.root)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl TemplateStore {
    /// Store rooted at `root` for server version `version`
    pub fn new(root: impl Into<PathBuf>, version: impl Into<String>) -> Result<Self> {
        let root = root.into();
        if root.as_os_str().is_empty() {
            return Err(GhostgresError::Configuration(
                "template root directory is required".to_string(),
            ));
        }
        let version = version.into();
        if version.is_empty() {
            return Err(GhostgresError::Configuration(
                "server version is required".to_string(),
            ));
        }
        Ok(Self {
            root,
            version,
            fail_with: None,
        })
    }

    /// Store rooted at `root` for the `postgres` binary found in `bin_dir`
    pub async fn for_server(root: impl Into<PathBuf>, bin_dir: &Path) -> Result<Self> {
        let version = version::server_version(bin_dir).await?;
        debug!("Detected postgres version {} in {:?}", version, bin_dir);
        Self::new(root, version)
    }

    /// Attach an observer that is shown every error this store returns
    pub fn with_observer(mut self, observer: FailureObserver) -> Self {
        self.fail_with = Some(observer);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    fn report<T>(&self, result: Result<T>) -> Result<T> {
        observer::report(self.fail_with.as_ref(), result)
    }

    /// Identity of the template called `name`
    pub fn identity(&self, name: &str) -> Result<TemplateId> {
        let result = self.template_id(name);
        self.report(result)
    }

    fn template_id(&self, name: &str) -> Result<TemplateId> {
        if name.is_empty() {
            return Err(GhostgresError::Configuration(
                "template name is required".to_string(),
            ));
        }
        Ok(TemplateId {
            root: self.root.clone(),
            name: name.to_string(),
            version: self.version.clone(),
        })
    }

    /// Whether a template called `name` has been frozen
    pub fn exists(&self, name: &str) -> bool {
        self.template_id(name)
            .map(|id| id.exists())
            .unwrap_or(false)
    }

    /// Names of the templates frozen for this version, sorted
    pub async fn list(&self) -> Result<Vec<String>> {
        let result = self.try_list().await;
        self.report(result)
    }

    async fn try_list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if self.exists(&name) {
                names.push(name);
            }
        }

        names.sort();
        Ok(names)
    }

    /// Save a stopped, initialized `cluster` as the template `name`.
    ///
    /// Fails if the template already exists. A failed freeze leaves nothing
    /// behind under the template root.
    pub async fn freeze(&self, cluster: &PostgresCluster, name: &str) -> Result<TemplateId> {
        let result = self.try_freeze(cluster, name).await;
        self.report(result)
    }

    async fn try_freeze(&self, cluster: &PostgresCluster, name: &str) -> Result<TemplateId> {
        if cluster.running() {
            return Err(StateError::FreezeRunning.into());
        }
        if !cluster.initialized() {
            return Err(StateError::CloneUninitialized.into());
        }
        let id = self.template_id(name)?;
        if tokio::fs::try_exists(id.path()).await? {
            return Err(StateError::DestinationExists(id.data_dir()).into());
        }
        info!("Freezing {:?} as template {:?}", cluster.data_dir, id.path());

        tokio::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(id.path())
            .await?;

        if let Err(e) = write_snapshot(cluster, &id).await {
            // Leave no half-written template behind
            if let Err(cleanup) = tokio::fs::remove_dir_all(id.path()).await {
                warn!("Failed to remove partial template {:?}: {}", id.path(), cleanup);
            }
            if let Some(parent) = id.path().parent() {
                // Only succeeds when no other version lives under this name
                let _ = tokio::fs::remove_dir(parent).await;
            }
            return Err(e);
        }

        info!("Template {} frozen for postgres {}", name, self.version);
        Ok(id)
    }

    /// Create a new cluster from the template `name`.
    ///
    /// With `dest` unset (or empty) the clone is placed in a new temporary
    /// directory which is deleted when the returned cluster is stopped.
    pub async fn from_template(&self, name: &str, dest: Option<&Path>) -> Result<PostgresCluster> {
        let result = self.try_from_template(name, dest).await;
        self.report(result)
    }

    async fn try_from_template(&self, name: &str, dest: Option<&Path>) -> Result<PostgresCluster> {
        let id = self.template_id(name)?;
        let template = read_descriptor(&id).await?;

        match dest.filter(|d| !d.as_os_str().is_empty()) {
            Some(dest) => template.clone_to(dest).await,
            None => {
                let scratch = tempfile::Builder::new()
                    .prefix("ghostgres_clone")
                    .tempdir()?;
                let mut cloned = template.clone_to(scratch.path().join("clone")).await?;
                debug!("Ephemeral clone of {} at {:?}", name, cloned.data_dir);
                cloned.set_on_destroy(Box::new(move || scratch.close()));
                Ok(cloned)
            }
        }
    }

    /// Delete the template `name`. Deleting a missing template succeeds.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let result = self.try_delete(name).await;
        self.report(result)
    }

    async fn try_delete(&self, name: &str) -> Result<()> {
        let id = self.template_id(name)?;
        match tokio::fs::remove_dir_all(id.path()).await {
            Ok(()) => {
                info!("Deleted template {:?}", id.path());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Copy the data directory into the template, then record its settings
async fn write_snapshot(cluster: &PostgresCluster, id: &TemplateId) -> Result<()> {
    let snapshot = cluster.clone_to(id.data_dir()).await?;
    let descriptor = serde_json::to_string_pretty(&snapshot).map_err(|e| {
        GhostgresError::Configuration(format!("failed to serialize template descriptor: {}", e))
    })?;

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(id.descriptor_file())
        .await?;
    file.write_all(descriptor.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

/// Load the cluster settings of a template, pointed at its snapshot
async fn read_descriptor(id: &TemplateId) -> Result<PostgresCluster> {
    let path = id.descriptor_file();
    let content = tokio::fs::read_to_string(&path).await?;
    let template: PostgresCluster = serde_json::from_str(&content).map_err(|e| {
        GhostgresError::Configuration(format!("malformed template descriptor {:?}: {}", path, e))
    })?;
    Ok(template.with_data_dir(id.data_dir()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_layout() {
        let store = TemplateStore::new("/templates", "9.3.4").unwrap();
        let id = store.identity("default").unwrap();
        assert_eq!(id.path(), PathBuf::from("/templates/default/9.3.4"));
        assert_eq!(id.data_dir(), PathBuf::from("/templates/default/9.3.4/data"));
        assert_eq!(
            id.descriptor_file(),
            PathBuf::from("/templates/default/9.3.4/ghostgres.json")
        );
    }

    #[test]
    fn test_missing_locations_are_configuration_errors() {
        assert!(matches!(
            TemplateStore::new("", "9.3.4"),
            Err(GhostgresError::Configuration(_))
        ));
        assert!(matches!(
            TemplateStore::new("/templates", ""),
            Err(GhostgresError::Configuration(_))
        ));

        let store = TemplateStore::new("/templates", "9.3.4").unwrap();
        assert!(matches!(
            store.identity(""),
            Err(GhostgresError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_list_empty_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = TemplateStore::new(dir.path().join("missing"), "9.3.4").unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let store = TemplateStore::new(dir.path(), "9.3.4").unwrap();
        let id = store.identity("broken").unwrap();
        std::fs::create_dir_all(id.path()).unwrap();
        std::fs::write(id.descriptor_file(), "{ not json").unwrap();

        let err = store.from_template("broken", None).await.unwrap_err();
        assert!(matches!(err, GhostgresError::Configuration(_)));
        assert!(err.to_string().contains("malformed"));
    }

    #[tokio::test]
    async fn test_delete_missing_template_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let store = TemplateStore::new(dir.path(), "9.3.4").unwrap();
        store.delete("never-frozen").await.unwrap();
    }
}
