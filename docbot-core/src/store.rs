//! File-backed resource store.
//!
//! # Storage layout
//!
//! ```text
//! ~/.docbot/
//!   resources/
//!     <kind dir>/            (from the kind registry, e.g. `pullrequests`)
//!       <namespace>/
//!         <name>.yaml        (one document per resource, mode 0600)
//! ```
//!
//! # Concurrency
//!
//! Writes are read-compare-write under a store-wide lock: `update` succeeds
//! only when the caller's `metadata.resourceVersion` equals the stored one,
//! otherwise it fails with [`StoreError::Conflict`] and the caller re-reads.
//! Each write goes to a `.yaml.tmp` sibling and is renamed into place.
//!
//! # Ownership
//!
//! `delete` removes the resource and, transitively, every resource in the
//! same namespace whose owner reference names it (kind, name and uid).

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::Utc;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::{io_err, StoreError};
use crate::scheme::{self, ResourceKind};
use crate::types::{ObjectKey, ObjectMeta, Resource};

/// Longest accepted namespace or name.
pub const MAX_NAME_LEN: usize = 253;

/// Get/list/create/update/delete by key.
pub trait ResourceStore: Send + Sync {
    fn get<R: Resource>(&self, key: &ObjectKey) -> Result<R, StoreError>;

    /// All resources of a kind, in one namespace or (`None`) across all.
    fn list<R: Resource>(&self, namespace: Option<&str>) -> Result<Vec<R>, StoreError>;

    /// Persist a new resource. Assigns uid, version 1 and creation time.
    fn create<R: Resource>(&self, resource: &R) -> Result<R, StoreError>;

    /// Replace a resource, rejecting writes based on a stale read.
    fn update<R: Resource>(&self, resource: &R) -> Result<R, StoreError>;

    /// Delete a resource and everything it owns.
    fn delete<R: Resource>(&self, key: &ObjectKey) -> Result<(), StoreError>;

    /// `get`, mapping [`StoreError::NotFound`] to `None`.
    fn try_get<R: Resource>(&self, key: &ObjectKey) -> Result<Option<R>, StoreError> {
        match self.get(key) {
            Ok(resource) => Ok(Some(resource)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// `<home>/.docbot/resources`. Pure, no I/O.
pub fn resources_root(home: &Path) -> PathBuf {
    home.join(".docbot").join("resources")
}

/// Resource store persisting YAML documents under a root directory.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

#[derive(Deserialize)]
struct MetaOnly {
    metadata: ObjectMeta,
}

impl FileStore {
    /// Store rooted at `<home>/.docbot/resources`.
    pub fn at(home: &Path) -> Self {
        Self::with_root(resources_root(home))
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<kind dir>/<namespace>/<name>.yaml`. Pure, no I/O.
    pub fn resource_path(&self, kind: ResourceKind, key: &ObjectKey) -> PathBuf {
        self.root
            .join(kind.dir())
            .join(&key.namespace)
            .join(format!("{}.yaml", key.name))
    }

    /// Map a path under the root back to the kind and key it stores.
    ///
    /// Returns `None` for temp files, directories and unregistered kinds.
    pub fn locate(&self, path: &Path) -> Option<(ResourceKind, ObjectKey)> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let mut parts = relative.iter().map(|p| p.to_str());
        let dir = parts.next()??;
        let namespace = parts.next()??;
        let file = parts.next()??;
        if parts.next().is_some() {
            return None;
        }
        let name = file.strip_suffix(".yaml")?;
        let info = scheme::lookup_dir(dir)?;
        Some((info.kind, ObjectKey::new(namespace, name)))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read<R: Resource>(&self, key: &ObjectKey) -> Result<R, StoreError> {
        let path = self.resource_path(R::KIND, key);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    kind: R::KIND.name(),
                    key: key.clone(),
                });
            }
            Err(err) => return Err(io_err(&path, err)),
        };
        serde_yaml::from_str(&contents).map_err(|source| StoreError::Parse { path, source })
    }

    fn write<R: Resource>(&self, resource: &R) -> Result<(), StoreError> {
        let key = resource.key();
        let path = self.resource_path(R::KIND, &key);
        let Some(dir) = path.parent() else {
            return Err(io_err(&path, std::io::Error::other("invalid resource path")));
        };
        ensure_dir(dir)?;

        let tmp = dir.join(format!("{}.yaml.tmp", key.name));
        let yaml = serde_yaml::to_string(resource)?;
        std::fs::write(&tmp, yaml).map_err(|e| io_err(&tmp, e))?;
        set_file_permissions(&tmp)?;
        if let Err(err) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(io_err(&path, err));
        }
        Ok(())
    }

    fn namespace_dirs(&self, kind: ResourceKind) -> Result<Vec<PathBuf>, StoreError> {
        let dir = self.root.join(kind.dir());
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => return Err(io_err(&dir, err)),
        };
        let mut dirs: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|e| e.path())
            .collect();
        dirs.sort();
        Ok(dirs)
    }

    fn resource_files(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => return Err(io_err(dir, err)),
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|ext| ext.to_str()) == Some("yaml"))
            .collect();
        files.sort();
        Ok(files)
    }

    fn read_path<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            // Deleted between listing and reading.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_err(path, err)),
        };
        serde_yaml::from_str(&contents)
            .map(Some)
            .map_err(|source| StoreError::Parse {
                path: path.to_path_buf(),
                source,
            })
    }

    fn remove(&self, kind: ResourceKind, key: &ObjectKey) -> Result<(), StoreError> {
        let path = self.resource_path(kind, key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_err(&path, err)),
        }
    }

    /// Remove every resource transitively owned by `(kind, key, uid)`.
    fn cascade(&self, kind: ResourceKind, key: &ObjectKey, uid: &str) -> Result<(), StoreError> {
        let mut pending = vec![(kind, key.clone(), uid.to_owned())];
        while let Some((owner_kind, owner_key, owner_uid)) = pending.pop() {
            for info in scheme::all() {
                let dir = self.root.join(info.dir).join(&owner_key.namespace);
                for path in Self::resource_files(&dir)? {
                    let Some(child) = Self::read_path::<MetaOnly>(&path)? else {
                        continue;
                    };
                    let owned = child.metadata.owner_references.iter().any(|r| {
                        r.kind == owner_kind.name()
                            && r.name == owner_key.name
                            && r.uid == owner_uid
                    });
                    if !owned {
                        continue;
                    }
                    let child_key = child.metadata.key();
                    self.remove(info.kind, &child_key)?;
                    tracing::debug!(
                        owner = %owner_key,
                        child_kind = info.name,
                        child = %child_key,
                        "cascade-deleted owned resource",
                    );
                    pending.push((info.kind, child_key, child.metadata.uid));
                }
            }
        }
        Ok(())
    }
}

impl ResourceStore for FileStore {
    fn get<R: Resource>(&self, key: &ObjectKey) -> Result<R, StoreError> {
        validate_key(R::KIND, key)?;
        self.read(key)
    }

    fn list<R: Resource>(&self, namespace: Option<&str>) -> Result<Vec<R>, StoreError> {
        let dirs = match namespace {
            Some(ns) => {
                validate_name(ns).map_err(|reason| StoreError::InvalidNamespace { reason })?;
                vec![self.root.join(R::KIND.dir()).join(ns)]
            }
            None => self.namespace_dirs(R::KIND)?,
        };
        let mut resources = Vec::new();
        for dir in dirs {
            for path in Self::resource_files(&dir)? {
                if let Some(resource) = Self::read_path::<R>(&path)? {
                    resources.push(resource);
                }
            }
        }
        Ok(resources)
    }

    fn create<R: Resource>(&self, resource: &R) -> Result<R, StoreError> {
        let key = resource.key();
        validate_key(R::KIND, &key)?;

        let _guard = self.lock();
        let path = self.resource_path(R::KIND, &key);
        if path.exists() {
            return Err(StoreError::AlreadyExists {
                kind: R::KIND.name(),
                key,
            });
        }

        let now = Utc::now();
        let mut created = resource.clone();
        let meta = created.metadata_mut();
        meta.uid = new_uid(R::KIND, &key);
        meta.resource_version = 1;
        meta.creation_timestamp = Some(now);
        self.write(&created)?;
        Ok(created)
    }

    fn update<R: Resource>(&self, resource: &R) -> Result<R, StoreError> {
        let key = resource.key();
        validate_key(R::KIND, &key)?;
        let _guard = self.lock();
        let stored: R = self.read(&key)?;

        let expected = resource.metadata().resource_version;
        let found = stored.metadata().resource_version;
        if expected != found {
            return Err(StoreError::Conflict {
                kind: R::KIND.name(),
                key,
                expected,
                found,
            });
        }
        resource
            .validate_update(&stored)
            .map_err(|reason| StoreError::Invalid {
                kind: R::KIND.name(),
                key: key.clone(),
                reason,
            })?;

        let mut updated = resource.clone();
        let meta = updated.metadata_mut();
        meta.uid = stored.metadata().uid.clone();
        meta.creation_timestamp = stored.metadata().creation_timestamp;
        meta.resource_version = found + 1;
        self.write(&updated)?;
        Ok(updated)
    }

    fn delete<R: Resource>(&self, key: &ObjectKey) -> Result<(), StoreError> {
        validate_key(R::KIND, key)?;
        let _guard = self.lock();
        let stored: R = self.read(key)?;
        self.remove(R::KIND, key)?;
        self.cascade(R::KIND, key, &stored.metadata().uid)
    }
}

/// Names and namespaces: lowercase alphanumerics, `-` and `.`, starting and
/// ending alphanumeric.
pub fn validate_name(value: &str) -> Result<(), String> {
    if value.is_empty() || value.len() > MAX_NAME_LEN {
        return Err(format!("must be 1-{MAX_NAME_LEN} characters"));
    }
    let valid_char = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.';
    if !value.chars().all(valid_char) {
        return Err(format!(
            "'{value}' may only contain lowercase letters, digits, '-' and '.'"
        ));
    }
    let alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    let first_ok = value.chars().next().is_some_and(alnum);
    let last_ok = value.chars().last().is_some_and(alnum);
    if !first_ok || !last_ok {
        return Err(format!("'{value}' must start and end with a letter or digit"));
    }
    Ok(())
}

fn validate_key(kind: ResourceKind, key: &ObjectKey) -> Result<(), StoreError> {
    validate_name(&key.namespace)
        .and_then(|()| validate_name(&key.name))
        .map_err(|reason| StoreError::Invalid {
            kind: kind.name(),
            key: key.clone(),
            reason,
        })
}

fn new_uid(kind: ResourceKind, key: &ObjectKey) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let mut hasher = Sha256::new();
    hasher.update(format!("{kind}/{key}/{nanos}").as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..32].to_owned()
}

fn ensure_dir(dir: &Path) -> Result<(), StoreError> {
    if dir.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    set_dir_permissions(dir)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
