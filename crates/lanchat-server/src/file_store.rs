use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use lanchat_net::file_transfer::is_plain_file_name;
use lanchat_shared::constants::UNKNOWN_UPLOADER;
use lanchat_shared::listing::FileEntry;

use crate::error::ServerError;

/// Verify that a resolved path stays within the expected base directory.
fn ensure_within(base: &Path, target: &Path) -> Result<PathBuf, ServerError> {
    let mut resolved = base.to_path_buf();
    for component in target.strip_prefix(base).unwrap_or(target).components() {
        match component {
            Component::Normal(c) => resolved.push(c),
            Component::ParentDir => {
                return Err(ServerError::InvalidFileName(target.display().to_string()));
            }
            _ => {}
        }
    }
    if !resolved.starts_with(base) {
        return Err(ServerError::InvalidFileName(target.display().to_string()));
    }
    Ok(resolved)
}

/// Destinations of uploads still being written.
///
/// Transfer tasks register a path the moment its file is created and the
/// returned [`UploadGuard`] unregisters it when the task is done with it,
/// successful or not.
#[derive(Debug, Clone, Default)]
pub struct InFlightUploads {
    paths: Arc<Mutex<HashSet<PathBuf>>>,
}

impl InFlightUploads {
    fn paths(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.paths.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn track(&self, path: &Path) -> UploadGuard {
        self.paths().insert(path.to_path_buf());
        UploadGuard {
            uploads: self.clone(),
            path: path.to_path_buf(),
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.paths().contains(path)
    }
}

#[derive(Debug)]
pub struct UploadGuard {
    uploads: InFlightUploads,
    path: PathBuf,
}

impl Drop for UploadGuard {
    fn drop(&mut self) {
        self.uploads.paths().remove(&self.path);
    }
}

/// Uploaded files on disk, one folder per room or private target:
/// `<root>/<target id>/<file name>`.
///
/// Files that are still being uploaded are invisible: they are not listed,
/// cannot be downloaded and cannot be removed.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    /// Display name of whoever uploaded `(target, file name)`.
    uploaders: HashMap<(Uuid, String), String>,
    in_flight: InFlightUploads,
}

impl FileStore {
    pub async fn new(root: PathBuf) -> Result<Self, ServerError> {
        fs::create_dir_all(&root).await.map_err(|e| {
            ServerError::Storage(format!(
                "Failed to create storage directory '{}': {}",
                root.display(),
                e
            ))
        })?;

        info!(path = %root.display(), "File store initialized");

        Ok(Self {
            root,
            uploaders: HashMap::new(),
            in_flight: InFlightUploads::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Handle for transfer tasks to register partial files with.
    pub fn in_flight(&self) -> InFlightUploads {
        self.in_flight.clone()
    }

    pub fn target_dir(&self, target: Uuid) -> PathBuf {
        self.root.join(target.to_string())
    }

    /// Path of `name` inside the target's folder, refusing anything but a
    /// bare file name.
    pub fn file_path(&self, target: Uuid, name: &str) -> Result<PathBuf, ServerError> {
        if !is_plain_file_name(name) {
            return Err(ServerError::InvalidFileName(name.to_string()));
        }
        ensure_within(&self.root, &self.target_dir(target).join(name))
    }

    pub async fn has_folder(&self, target: Uuid) -> bool {
        fs::metadata(self.target_dir(target))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// Path of a stored file, or `None` if there is no such file.
    pub async fn existing_file(&self, target: Uuid, name: &str) -> Result<Option<PathBuf>, ServerError> {
        let path = self.file_path(target, name)?;
        if self.in_flight.contains(&path) {
            return Ok(None);
        }
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(path)),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ServerError::Storage(format!(
                "Failed to stat '{}': {}",
                path.display(),
                e
            ))),
        }
    }

    /// Files in the target's folder, sorted by name. A missing folder lists
    /// as empty.
    pub async fn list_files(&self, target: Uuid) -> Result<Vec<FileEntry>, ServerError> {
        let dir = self.target_dir(target);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(ServerError::Storage(format!("Failed to list files: {}", e)));
            }
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            ServerError::Storage(format!("Failed to read directory entry: {}", e))
        })? {
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() || self.in_flight.contains(&entry.path()) {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };

            let last_modified = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            let uploader = self
                .uploader(target, &name)
                .unwrap_or(UNKNOWN_UPLOADER)
                .to_string();

            files.push(FileEntry {
                name,
                size: meta.len(),
                last_modified,
                uploader,
            });
        }

        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    /// Delete one stored file. Returns `false` if it did not exist or is
    /// still being uploaded.
    pub async fn remove_file(&mut self, target: Uuid, name: &str) -> Result<bool, ServerError> {
        let path = self.file_path(target, name)?;
        if self.in_flight.contains(&path) {
            return Ok(false);
        }

        match fs::remove_file(&path).await {
            Ok(()) => {
                self.uploaders.remove(&(target, name.to_string()));
                debug!(target_id = %target, file = name, "Removed stored file");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ServerError::Storage(format!(
                "Failed to delete '{}': {}",
                path.display(),
                e
            ))),
        }
    }

    /// Delete the target's folder and everything in it.
    pub async fn remove_target_dir(&mut self, target: Uuid) -> Result<bool, ServerError> {
        let dir = self.target_dir(target);
        self.uploaders.retain(|(owner, _), _| *owner != target);

        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(target_id = %target, "Removed storage folder");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ServerError::Storage(format!(
                "Failed to delete '{}': {}",
                dir.display(),
                e
            ))),
        }
    }

    pub fn record_uploader(&mut self, target: Uuid, name: &str, uploader: &str) {
        self.uploaders
            .insert((target, name.to_string()), uploader.to_string());
    }

    pub fn uploader(&self, target: Uuid, name: &str) -> Option<&str> {
        self.uploaders
            .get(&(target, name.to_string()))
            .map(String::as_str)
    }
}
