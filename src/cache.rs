//! Persistent, content-addressed store of staged artifacts.
//!
//! Layout under the cache root:
//!
//! ```text
//! index.json              {"version":1,"artifacts":[...]}
//! artifacts/<key>.<ext>   verified results (grib, nc or zip)
//! staging/                in-progress downloads
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::StageError;
use crate::request::CacheKey;
use crate::stage::{STAGING_PREFIX, VerifiedDownload};
use crate::util::sha256_file;

pub const INDEX_FILE: &str = "index.json";
const INDEX_VERSION: u32 = 1;

/// A verified result reachable through the [`CacheIndex`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedArtifact {
    pub key: CacheKey,
    pub dataset: String,
    pub path: PathBuf,
    pub size: u64,
    /// Lowercase hex SHA-256 of the file.
    pub checksum: String,
    pub staged_at: DateTime<Utc>,
}

impl StagedArtifact {
    /// Same key and same bytes; when and where it was staged does not matter.
    fn same_content(&self, other: &StagedArtifact) -> bool {
        self.key == other.key && self.size == other.size && self.checksum == other.checksum
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    artifacts: Vec<IndexEntry>,
}

/// On-disk form; `file` is relative to the cache root so the cache can move.
#[derive(Debug, Serialize, Deserialize)]
struct IndexEntry {
    key: CacheKey,
    dataset: String,
    file: PathBuf,
    size: u64,
    checksum: String,
    staged_at: DateTime<Utc>,
}

/// Maps [`CacheKey`]s to staged artifacts. Safe to share between threads;
/// every mutation is persisted before the lock is released.
#[derive(Debug)]
pub struct CacheIndex {
    root: PathBuf,
    max_bytes: Option<u64>,
    entries: Mutex<BTreeMap<CacheKey, StagedArtifact>>,
}

impl CacheIndex {
    /// Opens (or creates) the cache at `root`.
    ///
    /// Entries whose files have disappeared are dropped and leftovers of
    /// interrupted downloads are removed from the staging directory.
    pub fn open(root: impl Into<PathBuf>, max_bytes: Option<u64>) -> Result<Self, StageError> {
        let root = root.into();
        for dir in [root.join("artifacts"), root.join("staging")] {
            fs::create_dir_all(&dir).map_err(|e| StageError::CacheIo(dir.clone(), e))?;
        }

        let index = Self {
            max_bytes,
            entries: Mutex::new(BTreeMap::new()),
            root,
        };
        index.sweep_staging()?;

        let loaded = index.load()?;
        let listed = loaded.len();
        let mut entries = BTreeMap::new();
        for artifact in loaded {
            if artifact.path.is_file() {
                entries.insert(artifact.key.clone(), artifact);
            } else {
                warn!(key = %artifact.key, path = %artifact.path.display(), "dropping index entry without a file");
            }
        }

        let dropped = listed - entries.len();
        if dropped > 0 {
            index.save(&entries)?;
        }
        debug!(root = %index.root.display(), artifacts = entries.len(), dropped, "cache index opened");
        *index.entries.lock() = entries;
        Ok(index)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where in-progress downloads belong; same filesystem as the artifacts.
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join("artifacts")
    }

    pub fn max_bytes(&self) -> Option<u64> {
        self.max_bytes
    }

    pub fn lookup(&self, key: &CacheKey) -> Option<StagedArtifact> {
        let mut entries = self.entries.lock();
        let artifact = entries.get(key)?.clone();
        if artifact.path.is_file() {
            return Some(artifact);
        }

        warn!(%key, path = %artifact.path.display(), "staged file vanished, forgetting it");
        entries.remove(key);
        if let Err(e) = self.save(&entries) {
            warn!(error = %e, "failed to persist cache index");
        }
        None
    }

    /// Records an artifact whose file is already in place.
    ///
    /// The file is re-hashed first; a size or checksum that does not match
    /// its bytes is a [`StageError::Integrity`]. Re-inserting the same content
    /// is a no-op; different content under an existing key is a
    /// [`StageError::CacheKeyConflict`].
    pub fn insert(&self, mut artifact: StagedArtifact) -> Result<(), StageError> {
        artifact.checksum.make_ascii_lowercase();
        check_file(&artifact)?;
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&artifact.key) {
            return if existing.same_content(&artifact) {
                Ok(())
            } else {
                Err(StageError::CacheKeyConflict {
                    key: artifact.key.to_string(),
                })
            };
        }

        let key = artifact.key.clone();
        entries.insert(key.clone(), artifact);
        self.evict(&mut entries, &key);
        self.save(&entries)
    }

    /// Moves a verified download into the artifacts directory and indexes it,
    /// all under the index lock.
    ///
    /// If the key is already present with the same content, the download is
    /// discarded and the existing artifact returned. The first writer wins.
    pub fn admit(
        &self,
        key: &CacheKey,
        dataset: &str,
        download: VerifiedDownload,
    ) -> Result<StagedArtifact, StageError> {
        self.promote(key, dataset, download, false)
    }

    /// Like [`CacheIndex::admit`], but a cached artifact with different
    /// content is superseded instead of conflicting.
    ///
    /// The old file stays in place until the new one has been verified and
    /// is renamed over it.
    pub fn replace(
        &self,
        key: &CacheKey,
        dataset: &str,
        download: VerifiedDownload,
    ) -> Result<StagedArtifact, StageError> {
        self.promote(key, dataset, download, true)
    }

    fn promote(
        &self,
        key: &CacheKey,
        dataset: &str,
        download: VerifiedDownload,
        supersede: bool,
    ) -> Result<StagedArtifact, StageError> {
        let mut entries = self.entries.lock();
        let previous = entries.get(key).cloned();
        if let Some(existing) = &previous {
            if existing.size == download.size && existing.checksum == download.checksum {
                debug!(%key, "identical artifact already staged");
                return Ok(existing.clone());
            }
            if !supersede {
                return Err(StageError::CacheKeyConflict {
                    key: key.to_string(),
                });
            }
        }

        let dest = self
            .artifacts_dir()
            .join(format!("{}.{}", key, download.format.extension()));
        download
            .file
            .persist(&dest)
            .map_err(|e| StageError::CacheIo(dest.clone(), e.error))?;
        if let Some(old) = &previous {
            if old.path != dest {
                remove_file_quietly(&old.path);
            }
        }

        let artifact = StagedArtifact {
            key: key.clone(),
            dataset: dataset.to_string(),
            path: dest,
            size: download.size,
            checksum: download.checksum,
            staged_at: Utc::now(),
        };
        entries.insert(key.clone(), artifact.clone());
        self.evict(&mut entries, key);

        if let Err(e) = self.save(&entries) {
            entries.remove(key);
            remove_file_quietly(&artifact.path);
            return Err(e);
        }
        if previous.is_some() {
            info!(%key, dataset, size = artifact.size, path = %artifact.path.display(), "artifact replaced");
        } else {
            info!(%key, dataset, size = artifact.size, path = %artifact.path.display(), "artifact staged");
        }
        Ok(artifact)
    }

    /// Forgets `key` and deletes its file.
    pub fn remove(&self, key: &CacheKey) -> Result<Option<StagedArtifact>, StageError> {
        let mut entries = self.entries.lock();
        let Some(artifact) = entries.remove(key) else {
            return Ok(None);
        };
        self.save(&entries)?;
        remove_file_quietly(&artifact.path);
        Ok(Some(artifact))
    }

    /// Re-hashes the staged file. `false` when it no longer matches or is unknown.
    pub fn verify(&self, key: &CacheKey) -> Result<bool, StageError> {
        let Some(artifact) = self.entries.lock().get(key).cloned() else {
            return Ok(false);
        };
        match sha256_file(&artifact.path) {
            Ok(actual) => Ok(actual == artifact.checksum),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StageError::CacheIo(artifact.path, e)),
        }
    }

    /// All artifacts, oldest first.
    pub fn entries(&self) -> Vec<StagedArtifact> {
        let mut all: Vec<_> = self.entries.lock().values().cloned().collect();
        all.sort_by(|a, b| a.staged_at.cmp(&b.staged_at).then_with(|| a.key.cmp(&b.key)));
        all
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.lock().values().map(|a| a.size).sum()
    }

    /// Drops the oldest artifacts until `max_bytes` holds, never touching `keep`.
    fn evict(&self, entries: &mut BTreeMap<CacheKey, StagedArtifact>, keep: &CacheKey) {
        let Some(limit) = self.max_bytes else {
            return;
        };
        let mut total: u64 = entries.values().map(|a| a.size).sum();
        while total > limit {
            let victim = entries
                .values()
                .filter(|a| &a.key != keep)
                .min_by(|a, b| a.staged_at.cmp(&b.staged_at).then_with(|| a.key.cmp(&b.key)))
                .map(|a| a.key.clone());
            let Some(victim) = victim else {
                break;
            };
            if let Some(evicted) = entries.remove(&victim) {
                total -= evicted.size;
                info!(key = %evicted.key, size = evicted.size, "evicting artifact");
                remove_file_quietly(&evicted.path);
            }
        }
    }

    fn sweep_staging(&self) -> Result<(), StageError> {
        let staging = self.staging_dir();
        let listing = fs::read_dir(&staging).map_err(|e| StageError::CacheIo(staging.clone(), e))?;
        for entry in listing.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(STAGING_PREFIX) {
                debug!(file = %entry.path().display(), "removing leftover download");
                remove_file_quietly(&entry.path());
            }
        }
        Ok(())
    }

    fn load(&self) -> Result<Vec<StagedArtifact>, StageError> {
        let path = self.root.join(INDEX_FILE);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StageError::CacheIo(path, e)),
        };
        let file: IndexFile = serde_json::from_slice(&raw)
            .map_err(|e| StageError::CacheIo(path.clone(), io::Error::new(io::ErrorKind::InvalidData, e)))?;
        if file.version != INDEX_VERSION {
            return Err(StageError::CacheIo(
                path,
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unsupported index version {}", file.version),
                ),
            ));
        }

        Ok(file
            .artifacts
            .into_iter()
            .map(|e| StagedArtifact {
                path: self.root.join(&e.file),
                key: e.key,
                dataset: e.dataset,
                size: e.size,
                checksum: e.checksum,
                staged_at: e.staged_at,
            })
            .collect())
    }

    /// Writes the index next to its final location, then renames it over.
    fn save(&self, entries: &BTreeMap<CacheKey, StagedArtifact>) -> Result<(), StageError> {
        let path = self.root.join(INDEX_FILE);
        let file = IndexFile {
            version: INDEX_VERSION,
            artifacts: entries
                .values()
                .map(|a| IndexEntry {
                    key: a.key.clone(),
                    dataset: a.dataset.clone(),
                    file: a
                        .path
                        .strip_prefix(&self.root)
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|_| a.path.clone()),
                    size: a.size,
                    checksum: a.checksum.clone(),
                    staged_at: a.staged_at,
                })
                .collect(),
        };

        let io_err = |e: io::Error| StageError::CacheIo(path.clone(), e);
        let tmp = tempfile::NamedTempFile::new_in(&self.root).map_err(io_err)?;
        let mut out = BufWriter::new(tmp);
        serde_json::to_writer_pretty(&mut out, &file).map_err(|e| io_err(e.into()))?;
        out.flush().map_err(io_err)?;
        let tmp = out.into_inner().map_err(|e| io_err(e.into_error()))?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&path).map_err(|e| io_err(e.error))?;
        Ok(())
    }
}

/// Confirms that `artifact` describes the bytes at its path.
fn check_file(artifact: &StagedArtifact) -> Result<(), StageError> {
    let integrity = |reason: String| StageError::Integrity {
        location: artifact.path.display().to_string(),
        reason,
    };

    let size = match fs::metadata(&artifact.path) {
        Ok(meta) if meta.is_file() => meta.len(),
        Ok(_) => return Err(integrity("not a regular file".to_string())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(integrity("file does not exist".to_string()));
        }
        Err(e) => return Err(StageError::CacheIo(artifact.path.clone(), e)),
    };
    if size != artifact.size {
        return Err(integrity(format!(
            "file holds {size} bytes, artifact declares {}",
            artifact.size
        )));
    }

    let actual = sha256_file(&artifact.path).map_err(|e| StageError::CacheIo(artifact.path.clone(), e))?;
    if actual != artifact.checksum {
        return Err(integrity(format!(
            "sha256 mismatch: artifact declares {}, content is {actual}",
            artifact.checksum
        )));
    }
    Ok(())
}

fn remove_file_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove file");
        }
    }
}
