//! Bounded, file-backed fingerprint cache used to suppress already-reported postings.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};

use jobwatch_core::{fingerprint, CandidateRecord, Fingerprint};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobwatch-storage";

const CACHE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("cache store io failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding cache document: {0}")]
    Encode(#[from] serde_json::Error),
}

impl PersistenceError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// When the cache is written back to its store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistPolicy {
    /// Write after every newly inserted fingerprint. Survives crashes mid-cycle.
    #[default]
    EveryInsert,
    /// Write once when the caller flushes at the end of a cycle.
    EndOfCycle,
}

/// Insertion-ordered set of fingerprints with a hard capacity.
///
/// Membership is a hash lookup; the deque remembers arrival order so eviction
/// always drops the oldest entries first.
#[derive(Debug, Clone)]
pub struct FingerprintSet {
    members: HashSet<Fingerprint>,
    order: VecDeque<Fingerprint>,
    max_size: usize,
}

impl FingerprintSet {
    pub fn new(max_size: usize) -> Self {
        Self {
            members: HashSet::new(),
            order: VecDeque::new(),
            max_size,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, fp: &Fingerprint) -> bool {
        self.members.contains(fp)
    }

    /// Returns `true` when `fp` was not present. Does not evict.
    pub fn insert(&mut self, fp: Fingerprint) -> bool {
        if !self.members.insert(fp) {
            return false;
        }
        self.order.push_back(fp);
        true
    }

    /// Drops oldest entries until `len() <= max_size`. Returns how many were removed.
    pub fn evict_if_over_capacity(&mut self) -> usize {
        let mut evicted = 0;
        while self.order.len() > self.max_size {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.members.remove(&oldest);
            evicted += 1;
        }
        evicted
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Fingerprint> {
        self.order.iter()
    }

    pub fn clear(&mut self) {
        self.members.clear();
        self.order.clear();
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheDocument {
    version: u32,
    fingerprints: Vec<Fingerprint>,
}

/// Deduplication cache: a [`FingerprintSet`] plus the JSON file it is mirrored to.
///
/// The in-memory set is authoritative. Store failures are logged and otherwise ignored,
/// so a read-only disk degrades to per-process deduplication rather than stopping a run.
#[derive(Debug)]
pub struct DedupCache {
    entries: FingerprintSet,
    path: PathBuf,
    policy: PersistPolicy,
    dirty: bool,
}

impl DedupCache {
    pub fn empty(path: impl Into<PathBuf>, max_size: usize, policy: PersistPolicy) -> Self {
        Self {
            entries: FingerprintSet::new(max_size),
            path: path.into(),
            policy,
            dirty: false,
        }
    }

    /// Reads the store at `path`. A missing, unreadable or corrupt store yields an empty cache.
    pub async fn load(path: impl Into<PathBuf>, max_size: usize, policy: PersistPolicy) -> Self {
        let mut cache = Self::empty(path, max_size, policy);
        let bytes = match fs::read(&cache.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %cache.path.display(), "no cache store yet; starting cold");
                return cache;
            }
            Err(err) => {
                warn!(path = %cache.path.display(), error = %err, "cache store unreadable; starting cold");
                return cache;
            }
        };

        let document: CacheDocument = match serde_json::from_slice(&bytes) {
            Ok(document) => document,
            Err(err) => {
                warn!(path = %cache.path.display(), error = %err, "cache store corrupt; starting cold");
                return cache;
            }
        };
        if document.version != CACHE_FORMAT_VERSION {
            warn!(
                path = %cache.path.display(),
                version = document.version,
                "unsupported cache store version; starting cold"
            );
            return cache;
        }

        for fp in document.fingerprints {
            cache.entries.insert(fp);
        }
        let evicted = cache.entries.evict_if_over_capacity();
        if evicted > 0 {
            cache.dirty = true;
        }
        info!(
            path = %cache.path.display(),
            entries = cache.entries.len(),
            evicted,
            "loaded dedup cache"
        );
        cache
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn policy(&self) -> PersistPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.entries.max_size()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn contains(&self, record: &CandidateRecord) -> bool {
        self.entries.contains(&fingerprint(record))
    }

    /// Oldest first.
    pub fn fingerprints(&self) -> impl Iterator<Item = &Fingerprint> {
        self.entries.iter()
    }

    /// Check-and-insert. A record not seen before is remembered and `false` is returned.
    ///
    /// Exclusive borrow makes the check and the insert a single step for callers.
    pub async fn is_duplicate(&mut self, record: &CandidateRecord) -> bool {
        self.is_duplicate_fingerprint(fingerprint(record)).await
    }

    pub async fn is_duplicate_fingerprint(&mut self, fp: Fingerprint) -> bool {
        if !self.entries.insert(fp) {
            return true;
        }
        self.evict_if_over_capacity();
        self.dirty = true;
        if self.policy == PersistPolicy::EveryInsert {
            self.flush().await;
        }
        false
    }

    pub fn evict_if_over_capacity(&mut self) -> usize {
        let evicted = self.entries.evict_if_over_capacity();
        if evicted > 0 {
            debug!(evicted, max_size = self.entries.max_size(), "evicted oldest fingerprints");
        }
        evicted
    }

    /// Writes every fingerprint, oldest first, via temp file + rename so readers never
    /// observe a half-written store.
    pub async fn persist(&mut self) -> Result<(), PersistenceError> {
        let document = CacheDocument {
            version: CACHE_FORMAT_VERSION,
            fingerprints: self.entries.iter().copied().collect(),
        };
        let bytes = serde_json::to_vec(&document)?;

        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .map_err(|err| PersistenceError::io(&parent, err))?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "cache".to_string());
        let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|err| PersistenceError::io(&temp_path, err))?;
        let written = async {
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(PersistenceError::io(&temp_path, err));
        }

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(PersistenceError::io(&self.path, err));
        }
        self.dirty = false;
        Ok(())
    }

    /// Persists pending changes, logging instead of failing. Returns whether the store is
    /// now in sync with memory.
    pub async fn flush(&mut self) -> bool {
        if !self.dirty {
            return true;
        }
        match self.persist().await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, entries = self.entries.len(), "failed to persist dedup cache; keeping in-memory state");
                false
            }
        }
    }

    pub async fn clear(&mut self) -> Result<(), PersistenceError> {
        self.entries.clear();
        self.dirty = true;
        self.persist().await
    }
}
