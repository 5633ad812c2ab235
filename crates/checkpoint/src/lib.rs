//! Followers indexer checkpoint store.
//!
//! Implements [`indexer::CheckpointStore`] over a single JSON file mapping each
//! repository name to its follower logins:
//!
//! ```json
//! {"octo/hello":["alice","bob"],"gone/repo":[]}
//! ```
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** File layout, serialisation, and durability live here.
//! The [`indexer`] crate sees only [`indexer::CheckpointStore`].
//!
//! ## Durability
//!
//! Every [`JsonFileStore::put`](indexer::CheckpointStore::put) rewrites the
//! whole file: the new contents go to a sibling `*.tmp` file, which is synced,
//! renamed over the target, and followed by a sync of the parent directory.
//! A crash at any point leaves either the old file or the new one on disk,
//! never a mix. Writers are serialised, so concurrent puts for different keys
//! cannot lose each other's entries.
//!
//! ## Loading
//!
//! A missing file is an empty store. A file that exists but does not parse
//! (including an empty file) is reported as [`CheckpointError::Corrupt`]
//! rather than silently treated as empty.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use indexer::{CheckpointError, CheckpointStore, FollowerSet, RepositoryName};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use tokio::io::AsyncWriteExt;

type Entries = BTreeMap<RepositoryName, FollowerSet>;

/// A [`CheckpointStore`] persisted as one JSON object on disk.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: RwLock<Entries>,
    writer: tokio::sync::Mutex<()>,
}

impl JsonFileStore {
    /// Loads the store at `path`, or starts empty if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Corrupt`] if the file exists but cannot be
    /// read or parsed.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let path = path.into();
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let entries: Entries =
                    serde_json::from_slice(&bytes).map_err(|e| CheckpointError::Corrupt {
                        location: path.display().to_string(),
                        message: e.to_string(),
                    })?;
                tracing::info!(
                    path = %path.display(),
                    repositories = entries.len(),
                    "Loaded checkpoint"
                );
                entries
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No checkpoint yet; starting empty");
                Entries::new()
            }
            Err(e) => {
                return Err(CheckpointError::Corrupt {
                    location: path.display().to_string(),
                    message: e.to_string(),
                });
            }
        };

        Ok(Self {
            path,
            entries: RwLock::new(entries),
            writer: tokio::sync::Mutex::new(()),
        })
    }

    /// The file backing this store.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Entries> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_error(&self, message: impl std::fmt::Display) -> CheckpointError {
        CheckpointError::Write {
            location: self.path.display().to_string(),
            message: message.to_string(),
        }
    }

    /// Replaces the file with `bytes` atomically and durably.
    async fn persist(&self, bytes: &[u8]) -> std::io::Result<()> {
        let tmp = temp_path(&self.path);
        let result = write_and_rename(&tmp, &self.path, bytes).await;
        if result.is_err() {
            // Whatever state the temp file is in, it is not the checkpoint.
            let _ = tokio::fs::remove_file(&tmp).await;
        }
        result
    }
}

#[async_trait]
impl CheckpointStore for JsonFileStore {
    fn contains(&self, name: &RepositoryName) -> bool {
        self.read().contains_key(name)
    }

    fn get(&self, name: &RepositoryName) -> Option<FollowerSet> {
        self.read().get(name).cloned()
    }

    fn len(&self) -> usize {
        self.read().len()
    }

    async fn put(
        &self,
        name: &RepositoryName,
        followers: FollowerSet,
    ) -> Result<bool, CheckpointError> {
        let _writer = self.writer.lock().await;

        let bytes = {
            let entries = self.read();
            if entries.contains_key(name) {
                return Ok(false);
            }
            serde_json::to_vec(&WithEntry {
                entries: &*entries,
                name,
                followers: &followers,
            })
            .map_err(|e| self.write_error(e))?
        };

        self.persist(&bytes)
            .await
            .map_err(|e| self.write_error(e))?;

        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), followers);

        tracing::debug!(path = %self.path.display(), repository = %name, "Checkpoint written");
        Ok(true)
    }
}

/// The stored map with one extra entry spliced in at its sorted position,
/// serialised without cloning the map.
struct WithEntry<'a> {
    entries: &'a Entries,
    name: &'a RepositoryName,
    followers: &'a FollowerSet,
}

impl Serialize for WithEntry<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len() + 1))?;
        let mut pending = Some((self.name, self.followers));
        for (name, followers) in self.entries {
            if let Some((new_name, new_followers)) = pending {
                if new_name < name {
                    map.serialize_entry(new_name, new_followers)?;
                    pending = None;
                }
            }
            map.serialize_entry(name, followers)?;
        }
        if let Some((new_name, new_followers)) = pending {
            map.serialize_entry(new_name, new_followers)?;
        }
        map.end()
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

async fn write_and_rename(tmp: &Path, target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(tmp, target).await?;
    sync_parent(target).await
}

#[cfg(unix)]
async fn sync_parent(path: &Path) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    tokio::fs::File::open(parent).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_parent(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
