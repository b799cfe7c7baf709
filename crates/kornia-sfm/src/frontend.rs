//! # Frontend seam
//!
//! Keypoint detection and matching are external collaborators. This module runs them
//! over cameras and pairs with an [`ExecutionStrategy`], consults an injected
//! [`FeatureCache`], and merges the per-pair keypoints of detector-free matchers into
//! one keypoint list per image.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::cache::{CacheKey, FeatureCache};
use crate::parallel::{ExecuteExt, ExecutionStrategy, ParallelError};
use crate::types::{pair_key, CameraIndex, Keypoints, PairCorrespondences, PairKey};

/// Errors reported by frontend collaborators.
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum FrontendError {
    /// The detector or matcher failed.
    #[error("frontend failure: {0}")]
    Failed(String),

    /// No keypoints are available for a camera.
    #[error("no keypoints for camera {0}")]
    MissingKeypoints(CameraIndex),
}

/// Detects keypoints in the image of a camera.
pub trait KeypointDetector: Send + Sync {
    /// Detect the keypoints of camera `camera`.
    fn detect(&self, camera: CameraIndex) -> Result<Keypoints, FrontendError>;
}

/// Matches the keypoints of two images.
pub trait CorrespondenceGenerator: Send + Sync {
    /// Return matched `[index in kps1, index in kps2]` pairs.
    fn generate(
        &self,
        i1: CameraIndex,
        i2: CameraIndex,
        kps1: &Keypoints,
        kps2: &Keypoints,
    ) -> Result<Vec<[usize; 2]>, FrontendError>;
}

/// Cache to consult, the identity of each camera's image and the fingerprint of the
/// frontend configuration.
///
/// Cameras without an image identity bypass the cache.
#[derive(Clone, Copy)]
pub struct CacheContext<'a> {
    /// The shared cache.
    pub cache: &'a dyn FeatureCache,
    /// Fingerprint of the detector/matcher configuration.
    pub fingerprint: &'a str,
    /// Identity of each camera's image, e.g. [`crate::cache::image_content_id`].
    pub image_ids: &'a BTreeMap<CameraIndex, String>,
}

impl CacheContext<'_> {
    fn keypoints_key(&self, camera: CameraIndex) -> Option<CacheKey> {
        let id = self.image_ids.get(&camera)?;
        Some(CacheKey::keypoints(id, self.fingerprint))
    }

    fn matches_key(&self, i1: CameraIndex, i2: CameraIndex) -> Option<CacheKey> {
        let (id1, id2) = (self.image_ids.get(&i1)?, self.image_ids.get(&i2)?);
        Some(CacheKey::matches(id1, id2, self.fingerprint))
    }
}

/// Detect keypoints for `cameras`, reading from and filling the cache.
///
/// Cameras whose detection fails are logged and left out of the result.
pub fn detect_keypoints(
    detector: &dyn KeypointDetector,
    cameras: &[CameraIndex],
    cache: Option<CacheContext<'_>>,
    strategy: ExecutionStrategy,
) -> Result<BTreeMap<CameraIndex, Keypoints>, ParallelError> {
    let results = cameras.map_with(strategy, |&camera| {
        let key = cache.and_then(|c| c.keypoints_key(camera));
        if let (Some(c), Some(key)) = (cache, key.as_ref()) {
            if let Some(kps) = c.cache.get_keypoints(key) {
                return (camera, Ok(kps));
            }
        }
        let res = detector.detect(camera);
        if let (Some(c), Some(key), Ok(kps)) = (cache, key.as_ref(), res.as_ref()) {
            if let Err(e) = c.cache.put_keypoints(key, kps) {
                log::warn!("failed to cache keypoints of camera {}: {}", camera, e);
            }
        }
        (camera, res)
    })?;

    let mut out = BTreeMap::new();
    for (camera, res) in results {
        match res {
            Ok(kps) => {
                out.insert(camera, kps);
            }
            Err(e) => log::warn!("keypoint detection failed for camera {}: {}", camera, e),
        }
    }
    Ok(out)
}

/// Generate the putative correspondences of `pairs` in parallel.
///
/// Pairs are ordered with `i1 < i2`, self pairs and duplicates are skipped. Failing
/// pairs and matches with out-of-range indices are logged and dropped. The result is
/// sorted by pair key.
pub fn generate_correspondences(
    generator: &dyn CorrespondenceGenerator,
    keypoints: &BTreeMap<CameraIndex, Keypoints>,
    pairs: &[PairKey],
    cache: Option<CacheContext<'_>>,
    strategy: ExecutionStrategy,
) -> Result<Vec<PairCorrespondences>, ParallelError> {
    let mut ordered: Vec<PairKey> = pairs
        .iter()
        .filter(|(a, b)| a != b)
        .map(|&(a, b)| pair_key(a, b).0)
        .collect();
    ordered.sort_unstable();
    ordered.dedup();

    let results = ordered.map_with(strategy, |&(i1, i2)| {
        match_pair(generator, keypoints, i1, i2, cache)
    })?;

    let mut out = Vec::with_capacity(results.len());
    let mut num_failed = 0;
    for res in results {
        match res {
            Ok(corr) if !corr.matches.is_empty() => out.push(corr),
            Ok(_) => {}
            Err(e) => {
                num_failed += 1;
                log::debug!("matching failed: {}", e);
            }
        }
    }
    if num_failed > 0 {
        log::warn!("{} of {} pairs failed to match", num_failed, ordered.len());
    }
    log::info!("frontend: {} pairs with matches", out.len());
    Ok(out)
}

fn match_pair(
    generator: &dyn CorrespondenceGenerator,
    keypoints: &BTreeMap<CameraIndex, Keypoints>,
    i1: CameraIndex,
    i2: CameraIndex,
    cache: Option<CacheContext<'_>>,
) -> Result<PairCorrespondences, FrontendError> {
    let key = cache.and_then(|c| c.matches_key(i1, i2));
    if let (Some(c), Some(key)) = (cache, key.as_ref()) {
        if let Some(corr) = c.cache.get_matches(key) {
            return Ok(PairCorrespondences { i1, i2, ..corr });
        }
    }

    let kps1 = keypoints.get(&i1).ok_or(FrontendError::MissingKeypoints(i1))?;
    let kps2 = keypoints.get(&i2).ok_or(FrontendError::MissingKeypoints(i2))?;
    let raw = generator.generate(i1, i2, kps1, kps2)?;
    let num_raw = raw.len();
    let matches: Vec<[usize; 2]> = raw
        .into_iter()
        .filter(|&[a, b]| a < kps1.len() && b < kps2.len())
        .collect();
    if matches.len() < num_raw {
        log::warn!(
            "pair ({}, {}): dropped {} matches with invalid keypoint indices",
            i1,
            i2,
            num_raw - matches.len()
        );
    }

    let corr = PairCorrespondences { i1, i2, matches };
    if let (Some(c), Some(key)) = (cache, key.as_ref()) {
        if let Err(e) = c.cache.put_matches(key, &corr) {
            log::warn!("failed to cache matches of pair ({}, {}): {}", i1, i2, e);
        }
    }
    Ok(corr)
}

/// Keypoints and matches produced jointly for one pair by a detector-free matcher.
#[derive(Debug, Clone, PartialEq)]
pub struct PairKeypointMatches {
    /// First camera.
    pub i1: CameraIndex,
    /// Second camera.
    pub i2: CameraIndex,
    /// Keypoints of `i1` for this pair.
    pub keypoints1: Keypoints,
    /// Keypoints of `i2` for this pair.
    pub keypoints2: Keypoints,
    /// Matches into `keypoints1` and `keypoints2`.
    pub matches: Vec<[usize; 2]>,
}

// merged keypoints of one image, deduplicated on exact coordinates
#[derive(Default)]
struct KeypointMerger {
    coordinates: Vec<[f64; 2]>,
    index: HashMap<(u64, u64), usize>,
}

impl KeypointMerger {
    fn insert(&mut self, [x, y]: [f64; 2]) -> usize {
        let next = self.coordinates.len();
        let idx = *self.index.entry((x.to_bits(), y.to_bits())).or_insert(next);
        if idx == next {
            self.coordinates.push([x, y]);
        }
        idx
    }
}

/// Merge per-pair keypoints into one deduplicated keypoint list per image.
///
/// Pairs are visited in input order; each image's merged list holds its keypoints by
/// first appearance. Matches are remapped to the merged lists in their input order,
/// dropping repeats of an already seen index pair. Pairs come out in order of first
/// appearance, with `i1 < i2`.
pub fn aggregate_keypoints(
    pairs: &[PairKeypointMatches],
) -> (BTreeMap<CameraIndex, Keypoints>, Vec<PairCorrespondences>) {
    let mut mergers: BTreeMap<CameraIndex, KeypointMerger> = BTreeMap::new();
    let mut correspondences: Vec<PairCorrespondences> = Vec::new();
    let mut slot_of: HashMap<PairKey, usize> = HashMap::new();
    let mut seen: HashSet<(PairKey, [usize; 2])> = HashSet::new();
    for p in pairs.iter().filter(|p| p.i1 != p.i2) {
        let (key, swapped) = pair_key(p.i1, p.i2);
        let (first, second) = if swapped {
            (&p.keypoints2, &p.keypoints1)
        } else {
            (&p.keypoints1, &p.keypoints2)
        };
        // merge every keypoint, matched or not, in list order
        let map1: Vec<usize> = {
            let m = mergers.entry(key.0).or_default();
            first.coordinates.iter().map(|&c| m.insert(c)).collect()
        };
        let map2: Vec<usize> = {
            let m = mergers.entry(key.1).or_default();
            second.coordinates.iter().map(|&c| m.insert(c)).collect()
        };

        let slot = *slot_of.entry(key).or_insert_with(|| {
            correspondences.push(PairCorrespondences {
                i1: key.0,
                i2: key.1,
                matches: Vec::new(),
            });
            correspondences.len() - 1
        });
        for &[a, b] in p.matches.iter() {
            let (a, b) = if swapped { (b, a) } else { (a, b) };
            let (Some(&ma), Some(&mb)) = (map1.get(a), map2.get(b)) else {
                continue;
            };
            if seen.insert((key, [ma, mb])) {
                correspondences[slot].matches.push([ma, mb]);
            }
        }
    }

    let keypoints = mergers
        .into_iter()
        .map(|(c, m)| (c, Keypoints::from_coordinates(m.coordinates)))
        .collect();
    correspondences.retain(|c| !c.matches.is_empty());
    (keypoints, correspondences)
}
