//! Recursive copy of a cluster data directory

use crate::error::{GhostgresError, Result};
use std::fs::Permissions;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// What a [`copy_tree`] call copied
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub files: u64,
    pub dirs: u64,
    pub symlinks: u64,
    pub bytes: u64,
}

/// Copy the directory tree at `src` to `dest`, which must not exist.
///
/// Regular files keep their content and permission bits, directories keep
/// their permission bits and symlinks are recreated with the same target.
/// Sockets, FIFOs and device nodes are skipped. Timestamps are not preserved.
pub async fn copy_tree(src: &Path, dest: &Path) -> Result<CopyStats> {
    info!("Copying {:?} to {:?}", src, dest);

    if std::path::absolute(dest)?.starts_with(std::path::absolute(src)?) {
        return Err(GhostgresError::Configuration(format!(
            "cannot copy {:?} into itself at {:?}",
            src, dest
        )));
    }

    if let Some(parent) = dest.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let mut stats = CopyStats::default();
    if let Err(e) = copy_entries(src, dest, &mut stats).await {
        // The root is the first directory created; only remove what we made
        if stats.dirs > 0 {
            if let Err(cleanup) = tokio::fs::remove_dir_all(dest).await {
                warn!("Failed to remove partial copy {:?}: {}", dest, cleanup);
            }
        }
        return Err(e);
    }

    info!(
        "Copy completed: {} files, {} dirs, {:.2} MB",
        stats.files,
        stats.dirs,
        stats.bytes as f64 / 1_048_576.0
    );

    Ok(stats)
}

async fn copy_entries(src: &Path, dest: &Path, stats: &mut CopyStats) -> Result<()> {
    let mut dir_permissions: Vec<(PathBuf, Permissions)> = Vec::new();

    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry?;
        let rel_path = entry
            .path()
            .strip_prefix(src)
            .map_err(std::io::Error::other)?;
        let target = dest.join(rel_path);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            tokio::fs::create_dir(&target).await?;
            stats.dirs += 1;
            dir_permissions.push((target, entry.metadata()?.permissions()));
        } else if file_type.is_file() {
            stats.bytes += tokio::fs::copy(entry.path(), &target).await?;
            stats.files += 1;
        } else if file_type.is_symlink() {
            let link = tokio::fs::read_link(entry.path()).await?;
            tokio::fs::symlink(&link, &target).await?;
            stats.symlinks += 1;
        } else {
            debug!("Skipping special file {:?}", entry.path());
        }
    }

    // Deepest first, so a read-only parent never blocks its children
    for (dir, permissions) in dir_permissions.into_iter().rev() {
        tokio::fs::set_permissions(&dir, permissions).await?;
    }

    Ok(())
}
