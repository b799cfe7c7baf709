use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{CameraIndex, Keypoints, Observation, RelativePoseEdge};

use super::union_find::UnionFind;

/// Observations of one physical point, before triangulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureTrack {
    /// One observation per camera, sorted by camera index.
    pub observations: Vec<Observation>,
}

impl FeatureTrack {
    /// Number of observations.
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    /// Whether the track has no observations.
    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Cameras observing the track.
    pub fn cameras(&self) -> impl Iterator<Item = CameraIndex> + '_ {
        self.observations.iter().map(|o| o.camera)
    }

    /// Keep only the observations whose camera passes `keep`.
    pub fn select_cameras(&self, keep: impl Fn(CameraIndex) -> bool) -> FeatureTrack {
        FeatureTrack {
            observations: self
                .observations
                .iter()
                .filter(|o| keep(o.camera))
                .copied()
                .collect(),
        }
    }
}

/// Counters of track building.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackBuildStats {
    /// Connected sets of observations found.
    pub num_candidates: usize,
    /// Sets where one camera contributed two different keypoints.
    pub num_inconsistent: usize,
    /// Sets shorter than the minimum length.
    pub num_too_short: usize,
    /// Correspondences that referenced a missing keypoint.
    pub num_invalid_correspondences: usize,
}

/// Chain the inlier correspondences of `edges` into tracks.
///
/// Two observations share a track when a chain of correspondences links them. Sets in
/// which a camera appears twice are discarded, as are sets with fewer than
/// `min_track_length` observations. Tracks are sorted by their first observation.
pub fn build_tracks(
    edges: &[RelativePoseEdge],
    keypoints: &BTreeMap<CameraIndex, Keypoints>,
    min_track_length: usize,
) -> (Vec<FeatureTrack>, TrackBuildStats) {
    let mut stats = TrackBuildStats::default();

    // dense ids for every (camera, keypoint) in a correspondence
    let mut ids: BTreeMap<(CameraIndex, usize), usize> = BTreeMap::new();
    let mut links = Vec::new();
    for edge in edges {
        let (Some(k1), Some(k2)) = (keypoints.get(&edge.i1), keypoints.get(&edge.i2)) else {
            stats.num_invalid_correspondences += edge.inliers.len();
            continue;
        };
        for &[a, b] in edge.inliers.iter() {
            if a >= k1.len() || b >= k2.len() {
                stats.num_invalid_correspondences += 1;
                continue;
            }
            let n = ids.len();
            let ia = *ids.entry((edge.i1, a)).or_insert(n);
            let n = ids.len();
            let ib = *ids.entry((edge.i2, b)).or_insert(n);
            links.push((ia, ib));
        }
    }
    if stats.num_invalid_correspondences > 0 {
        log::warn!(
            "ignored {} correspondences with unknown keypoints",
            stats.num_invalid_correspondences
        );
    }

    let mut uf = UnionFind::new(ids.len());
    for (a, b) in links {
        uf.union(a, b);
    }
    let nodes: Vec<(CameraIndex, usize)> = {
        let mut v = vec![(0, 0); ids.len()];
        for (&node, &id) in ids.iter() {
            v[id] = node;
        }
        v
    };

    let mut tracks = Vec::new();
    for group in uf.groups() {
        stats.num_candidates += 1;
        let mut obs: Vec<(CameraIndex, usize)> = group.iter().map(|&id| nodes[id]).collect();
        obs.sort_unstable();
        if obs.windows(2).any(|w| w[0].0 == w[1].0) {
            stats.num_inconsistent += 1;
            continue;
        }
        if obs.len() < min_track_length {
            stats.num_too_short += 1;
            continue;
        }
        let observations = obs
            .into_iter()
            .filter_map(|(camera, keypoint)| {
                let pixel = keypoints.get(&camera)?.point(keypoint)?;
                Some(Observation {
                    camera,
                    keypoint,
                    pixel,
                })
            })
            .collect();
        tracks.push(FeatureTrack { observations });
    }
    tracks.sort_by_key(|t| t.observations.first().map(|o| (o.camera, o.keypoint)));

    log::info!(
        "data association: {} tracks from {} candidates ({} inconsistent, {} too short)",
        tracks.len(),
        stats.num_candidates,
        stats.num_inconsistent,
        stats.num_too_short
    );
    (tracks, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{DMat3, DVec3};

    fn edge(i1: usize, i2: usize, inliers: Vec<[usize; 2]>) -> RelativePoseEdge {
        RelativePoseEdge {
            i1,
            i2,
            i2_r_i1: DMat3::IDENTITY,
            i2_u_i1: DVec3::X,
            inliers,
            inlier_ratio: 1.0,
            from_prior: false,
        }
    }

    fn keypoints(n: usize) -> Keypoints {
        Keypoints::from_coordinates((0..n).map(|i| [i as f64, 2.0 * i as f64]).collect())
    }

    #[test]
    fn test_transitive_tracks() {
        let kps: BTreeMap<_, _> = (0..3).map(|c| (c, keypoints(5))).collect();
        let edges = vec![
            edge(0, 1, vec![[0, 1], [2, 2]]),
            edge(1, 2, vec![[1, 3]]),
            edge(0, 2, vec![[4, 4]]),
        ];
        let (tracks, stats) = build_tracks(&edges, &kps, 2);
        assert_eq!(stats.num_candidates, 3);
        assert_eq!(tracks.len(), 3);

        let long = &tracks[0];
        assert_eq!(
            long.observations
                .iter()
                .map(|o| (o.camera, o.keypoint))
                .collect::<Vec<_>>(),
            vec![(0, 0), (1, 1), (2, 3)]
        );
        assert_eq!(long.observations[2].pixel, glam::DVec2::new(3.0, 6.0));
    }

    #[test]
    fn test_inconsistent_and_short() {
        let kps: BTreeMap<_, _> = (0..3).map(|c| (c, keypoints(5))).collect();
        let edges = vec![
            // camera 1 contributes keypoints 1 and 2 to the same set
            edge(0, 1, vec![[0, 1], [0, 2]]),
            edge(1, 2, vec![[3, 3], [9, 0]]),
        ];
        let (tracks, stats) = build_tracks(&edges, &kps, 3);
        assert!(tracks.is_empty());
        assert_eq!(stats.num_inconsistent, 1);
        assert_eq!(stats.num_too_short, 1);
        assert_eq!(stats.num_invalid_correspondences, 1);
    }
}
