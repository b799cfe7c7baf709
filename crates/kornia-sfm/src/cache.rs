use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use serde::Serialize;

use crate::types::{Keypoints, PairCorrespondences};

/// Error types for the feature cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Error reading or writing a cache file.
    #[error("error reading or writing cache file")]
    Io(#[from] std::io::Error),

    /// Encoding or decoding an entry failed.
    #[error("bincode error: {0}")]
    Bincode(String),

    /// A configuration could not be fingerprinted.
    #[error("fingerprint error: {0}")]
    Fingerprint(#[from] serde_json::Error),

    /// A lock was poisoned by a panicking writer.
    #[error("cache lock poisoned")]
    Poisoned,
}

/// 64-bit FNV-1a hash.
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |h, &b| (h ^ b as u64).wrapping_mul(PRIME))
}

/// Fingerprint of a serializable configuration, as 16 hex digits.
pub fn config_fingerprint<T: Serialize>(config: &T) -> Result<String, CacheError> {
    let json = serde_json::to_vec(config)?;
    Ok(format!("{:016x}", fnv1a64(&json)))
}

/// Identity of an image from its encoded bytes, as 16 hex digits.
pub fn image_content_id(bytes: &[u8]) -> String {
    format!("{:016x}", fnv1a64(bytes))
}

/// Stable identity of a cached result.
///
/// Built from the identity of the input (an image or an image pair) and the fingerprint
/// of the configuration that produced it, so a configuration change misses the cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key of the keypoints of one image.
    pub fn keypoints(image_id: &str, fingerprint: &str) -> Self {
        Self::new("kp", &[image_id, fingerprint])
    }

    /// Key of the matches of an image pair.
    pub fn matches(image_id1: &str, image_id2: &str, fingerprint: &str) -> Self {
        Self::new("match", &[image_id1, image_id2, fingerprint])
    }


    fn new(kind: &str, parts: &[&str]) -> Self {
        let mut bytes = Vec::new();
        for part in parts {
            bytes.extend_from_slice(part.as_bytes());
            // separator, so ("ab", "c") and ("a", "bc") differ
            bytes.push(0);
        }
        Self(format!("{}_{:016x}", kind, fnv1a64(&bytes)))
    }

    /// The key as a file name friendly string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Shared, read-mostly store of frontend results.
///
/// Writes are idempotent: storing the same value twice is harmless.
pub trait FeatureCache: Send + Sync {
    /// Cached keypoints, `None` on a miss.
    fn get_keypoints(&self, key: &CacheKey) -> Option<Keypoints>;

    /// Store keypoints.
    fn put_keypoints(&self, key: &CacheKey, keypoints: &Keypoints) -> Result<(), CacheError>;

    /// Cached matches, `None` on a miss.
    fn get_matches(&self, key: &CacheKey) -> Option<PairCorrespondences>;

    /// Store matches.
    fn put_matches(&self, key: &CacheKey, matches: &PairCorrespondences)
        -> Result<(), CacheError>;
}

/// In-memory cache.
#[derive(Debug, Default)]
pub struct MemoryCache {
    keypoints: RwLock<HashMap<CacheKey, Keypoints>>,
    matches: RwLock<HashMap<CacheKey, PairCorrespondences>>,
}

impl MemoryCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        let kp = self.keypoints.read().map(|m| m.len()).unwrap_or(0);
        let mt = self.matches.read().map(|m| m.len()).unwrap_or(0);
        kp + mt
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FeatureCache for MemoryCache {
    fn get_keypoints(&self, key: &CacheKey) -> Option<Keypoints> {
        self.keypoints.read().ok()?.get(key).cloned()
    }

    fn put_keypoints(&self, key: &CacheKey, keypoints: &Keypoints) -> Result<(), CacheError> {
        self.keypoints
            .write()
            .map_err(|_| CacheError::Poisoned)?
            .insert(key.clone(), keypoints.clone());
        Ok(())
    }

    fn get_matches(&self, key: &CacheKey) -> Option<PairCorrespondences> {
        self.matches.read().ok()?.get(key).cloned()
    }

    fn put_matches(
        &self,
        key: &CacheKey,
        matches: &PairCorrespondences,
    ) -> Result<(), CacheError> {
        self.matches
            .write()
            .map_err(|_| CacheError::Poisoned)?
            .insert(key.clone(), matches.clone());
        Ok(())
    }
}

/// Cache with one `bincode` file per entry in a directory.
///
/// Entries are written to a temporary file that is then renamed, so readers never see
/// a partially written entry.
#[derive(Debug)]
pub struct DiskCache {
    root: PathBuf,
    counter: AtomicUsize,
}

impl DiskCache {
    /// Open (and create if needed) a cache directory.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, CacheError> {
        std::fs::create_dir_all(root.as_ref())?;
        Ok(Self {
            root: root.as_ref().to_path_buf(),
            counter: AtomicUsize::new(0),
        })
    }

    /// Directory of the cache.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(format!("{}.bin", key.as_str()))
    }

    fn read<T: bincode::Decode<()>>(&self, key: &CacheKey) -> Option<T> {
        let path = self.path(key);
        let file = File::open(&path).ok()?;
        let mut reader = BufReader::new(file);
        match bincode::decode_from_std_read(&mut reader, bincode::config::standard()) {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!("ignoring unreadable cache entry {:?}: {}", path, e);
                None
            }
        }
    }

    fn write<T: bincode::Encode>(&self, key: &CacheKey, value: &T) -> Result<(), CacheError> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let tmp = self
            .root
            .join(format!("{}.{}.{}.tmp", key.as_str(), std::process::id(), n));
        {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            bincode::encode_into_std_write(value, &mut writer, bincode::config::standard())
                .map_err(|e| CacheError::Bincode(e.to_string()))?;
        }
        std::fs::rename(&tmp, self.path(key))?;
        Ok(())
    }
}

impl FeatureCache for DiskCache {
    fn get_keypoints(&self, key: &CacheKey) -> Option<Keypoints> {
        self.read(key)
    }

    fn put_keypoints(&self, key: &CacheKey, keypoints: &Keypoints) -> Result<(), CacheError> {
        self.write(key, keypoints)
    }

    fn get_matches(&self, key: &CacheKey) -> Option<PairCorrespondences> {
        self.read(key)
    }

    fn put_matches(
        &self,
        key: &CacheKey,
        matches: &PairCorrespondences,
    ) -> Result<(), CacheError> {
        self.write(key, matches)
    }
}
