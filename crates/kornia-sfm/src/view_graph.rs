//! # View graph
//!
//! Cameras are the nodes and verified [`RelativePoseEdge`]s the edges. The graph is kept
//! as an arena: a sorted node list, an index-based edge list and a neighbour map.
//!
//! [`ViewGraphEstimator`] removes edges whose relative rotation disagrees with the
//! cycles (triplets) they take part in.

use std::collections::{BTreeMap, BTreeSet};

use glam::DMat3;
use serde::{Deserialize, Serialize};

use crate::data_association::union_find::UnionFind;
use crate::geometry::so3;
use crate::types::{CameraIndex, PairKey, RelativePoseEdge};

/// Statistic that turns the triplet errors of one edge into its score.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeErrorAggregation {
    /// Lower median, the sorted element at `(n - 1) / 2`.
    #[default]
    Median,
    /// Smallest error.
    Min,
    /// Arithmetic mean.
    Mean,
    /// Mean after discarding the fraction `f` of the largest errors, `0 <= f < 1`.
    TrimmedMean(f64),
}

impl EdgeErrorAggregation {
    /// Aggregate the errors, `None` when there are none.
    pub fn aggregate(&self, errors: &[f64]) -> Option<f64> {
        if errors.is_empty() {
            return None;
        }
        let mut sorted = errors.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let value = match *self {
            EdgeErrorAggregation::Median => sorted[(sorted.len() - 1) / 2],
            EdgeErrorAggregation::Min => sorted[0],
            EdgeErrorAggregation::Mean => sorted.iter().sum::<f64>() / sorted.len() as f64,
            EdgeErrorAggregation::TrimmedMean(f) => {
                let keep = ((sorted.len() as f64) * (1.0 - f.clamp(0.0, 1.0))).ceil() as usize;
                let keep = keep.clamp(1, sorted.len());
                sorted[..keep].iter().sum::<f64>() / keep as f64
            }
        };
        Some(value)
    }
}

/// Cycle-consistency options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewGraphConfig {
    /// How an edge's triplet errors are combined.
    pub aggregation: EdgeErrorAggregation,
    /// Edges whose aggregated error exceeds this are dropped, in degrees.
    pub max_cycle_error_deg: f64,
}

impl Default for ViewGraphConfig {
    fn default() -> Self {
        Self {
            aggregation: EdgeErrorAggregation::Median,
            max_cycle_error_deg: 7.0,
        }
    }
}

/// Undirected graph of cameras and relative pose edges.
#[derive(Debug, Clone, Default)]
pub struct ViewGraph {
    nodes: Vec<CameraIndex>,
    edges: Vec<RelativePoseEdge>,
    edge_index: BTreeMap<PairKey, usize>,
    adjacency: BTreeMap<CameraIndex, BTreeSet<CameraIndex>>,
}

impl ViewGraph {
    /// Build a graph from `cameras` and `edges`.
    ///
    /// Edge endpoints are added as nodes. Self loops are ignored and for duplicated
    /// pairs the edge with the most inliers wins. Edges are stored sorted by pair key.
    pub fn new(
        cameras: impl IntoIterator<Item = CameraIndex>,
        edges: impl IntoIterator<Item = RelativePoseEdge>,
    ) -> Self {
        let mut nodes: BTreeSet<CameraIndex> = cameras.into_iter().collect();
        let mut by_key: BTreeMap<PairKey, RelativePoseEdge> = BTreeMap::new();
        for edge in edges {
            if edge.i1 == edge.i2 {
                continue;
            }
            let edge = orient(edge);
            nodes.insert(edge.i1);
            nodes.insert(edge.i2);
            match by_key.get(&edge.key()) {
                Some(prev) if prev.num_inliers() >= edge.num_inliers() => {}
                _ => {
                    by_key.insert(edge.key(), edge);
                }
            }
        }

        let mut graph = Self {
            nodes: nodes.into_iter().collect(),
            ..Default::default()
        };
        for node in graph.nodes.iter() {
            graph.adjacency.insert(*node, BTreeSet::new());
        }
        for (key, edge) in by_key {
            graph.edge_index.insert(key, graph.edges.len());
            graph.adjacency.entry(key.0).or_default().insert(key.1);
            graph.adjacency.entry(key.1).or_default().insert(key.0);
            graph.edges.push(edge);
        }
        graph
    }

    /// Cameras of the graph, sorted.
    pub fn nodes(&self) -> &[CameraIndex] {
        &self.nodes
    }

    /// Edges, sorted by pair key.
    pub fn edges(&self) -> &[RelativePoseEdge] {
        &self.edges
    }

    /// Consume the graph, returning its edges sorted by pair key.
    pub fn into_edges(self) -> Vec<RelativePoseEdge> {
        self.edges
    }

    /// Number of cameras.
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Number of edges.
    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    /// Neighbours of a camera.
    pub fn neighbors(&self, camera: CameraIndex) -> impl Iterator<Item = CameraIndex> + '_ {
        self.adjacency
            .get(&camera)
            .into_iter()
            .flat_map(|n| n.iter().copied())
    }

    /// The edge between two cameras, in either order.
    pub fn edge(&self, a: CameraIndex, b: CameraIndex) -> Option<&RelativePoseEdge> {
        let key = if a < b { (a, b) } else { (b, a) };
        self.edge_index.get(&key).map(|&i| &self.edges[i])
    }

    /// Rotation mapping points from camera `a`'s frame to camera `b`'s frame.
    pub fn relative_rotation(&self, a: CameraIndex, b: CameraIndex) -> Option<DMat3> {
        let edge = self.edge(a, b)?;
        Some(if edge.i1 == a {
            edge.i2_r_i1
        } else {
            edge.i2_r_i1.transpose()
        })
    }

    /// All triplets `a < b < c` whose three edges exist.
    pub fn triplets(&self) -> Vec<[CameraIndex; 3]> {
        let mut out = Vec::new();
        for edge in self.edges.iter() {
            let (a, b) = edge.key();
            let (Some(na), Some(nb)) = (self.adjacency.get(&a), self.adjacency.get(&b)) else {
                continue;
            };
            out.extend(na.intersection(nb).filter(|&&c| c > b).map(|&c| [a, b, c]));
        }
        out.sort_unstable();
        out
    }

    /// Angle, in degrees, of the rotation composed around the cycle `a -> b -> c -> a`.
    pub fn triplet_error_deg(&self, triplet: [CameraIndex; 3]) -> Option<f64> {
        let [a, b, c] = triplet;
        let b_r_a = self.relative_rotation(a, b)?;
        let c_r_b = self.relative_rotation(b, c)?;
        let a_r_c = self.relative_rotation(c, a)?;
        Some(so3::angle(&(a_r_c * c_r_b * b_r_a)).to_degrees())
    }

    /// Connected components, largest first, ties broken by the smallest camera index.
    pub fn connected_components(&self) -> Vec<Vec<CameraIndex>> {
        let slot: BTreeMap<CameraIndex, usize> =
            self.nodes.iter().enumerate().map(|(i, &c)| (c, i)).collect();
        let mut uf = UnionFind::new(self.nodes.len());
        for edge in self.edges.iter() {
            uf.union(slot[&edge.i1], slot[&edge.i2]);
        }
        let mut components: Vec<Vec<CameraIndex>> = uf
            .groups()
            .into_iter()
            .map(|g| g.into_iter().map(|i| self.nodes[i]).collect())
            .collect();
        components.sort_by(|a, b| b.len().cmp(&a.len()).then(a[0].cmp(&b[0])));
        components
    }

    /// The subgraph induced by `cameras`.
    pub fn subgraph(&self, cameras: &[CameraIndex]) -> ViewGraph {
        let set: BTreeSet<CameraIndex> = cameras.iter().copied().collect();
        let edges = self
            .edges
            .iter()
            .filter(|e| set.contains(&e.i1) && set.contains(&e.i2))
            .cloned();
        ViewGraph::new(set.iter().copied(), edges)
    }
}

fn orient(edge: RelativePoseEdge) -> RelativePoseEdge {
    if edge.i1 < edge.i2 {
        return edge;
    }
    // camera i2's centre seen from i1: -R^T u
    let r = edge.i2_r_i1.transpose();
    RelativePoseEdge {
        i1: edge.i2,
        i2: edge.i1,
        i2_u_i1: -(r * edge.i2_u_i1),
        i2_r_i1: r,
        inliers: edge.inliers.iter().map(|m| [m[1], m[0]]).collect(),
        ..edge
    }
}

/// Outcome of cycle-consistency filtering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewGraphReport {
    /// Pairs that survived.
    pub kept: Vec<PairKey>,
    /// Pairs removed as inconsistent.
    pub dropped: Vec<PairKey>,
    /// Aggregated cycle error in degrees of every edge that is part of a triplet.
    pub scores: BTreeMap<PairKey, f64>,
    /// Number of triplets evaluated.
    pub num_triplets: usize,
}

impl ViewGraphReport {
    /// Fraction of input edges that were dropped.
    pub fn dropped_ratio(&self) -> f64 {
        let total = self.kept.len() + self.dropped.len();
        if total == 0 {
            0.0
        } else {
            self.dropped.len() as f64 / total as f64
        }
    }
}

/// Removes globally inconsistent edges by triplet rotation cycles.
#[derive(Debug, Clone, Default)]
pub struct ViewGraphEstimator {
    config: ViewGraphConfig,
}

impl ViewGraphEstimator {
    /// Create an estimator.
    pub fn new(config: ViewGraphConfig) -> Self {
        Self { config }
    }

    /// Score every edge and drop those above the threshold.
    ///
    /// Edges that belong to no triplet cannot be judged and are kept unscored.
    pub fn filter(&self, graph: &ViewGraph) -> (ViewGraph, ViewGraphReport) {
        let triplets = graph.triplets();
        let mut errors: BTreeMap<PairKey, Vec<f64>> = BTreeMap::new();
        for &triplet in triplets.iter() {
            let Some(err) = graph.triplet_error_deg(triplet) else {
                continue;
            };
            let [a, b, c] = triplet;
            for key in [(a, b), (b, c), (a, c)] {
                errors.entry(key).or_default().push(err);
            }
        }

        let mut report = ViewGraphReport {
            num_triplets: triplets.len(),
            ..Default::default()
        };
        let mut kept = Vec::with_capacity(graph.num_edges());
        for edge in graph.edges() {
            let key = edge.key();
            let score = errors
                .get(&key)
                .and_then(|e| self.config.aggregation.aggregate(e));
            match score {
                Some(score) => {
                    report.scores.insert(key, score);
                    if score.is_finite() && score <= self.config.max_cycle_error_deg {
                        report.kept.push(key);
                        kept.push(edge.clone());
                    } else {
                        log::debug!("dropping edge {:?}: cycle error {:.2} deg", key, score);
                        report.dropped.push(key);
                    }
                }
                None => {
                    report.kept.push(key);
                    kept.push(edge.clone());
                }
            }
        }

        log::info!(
            "view graph: {} triplets, dropped {} of {} edges ({:.1}%)",
            report.num_triplets,
            report.dropped.len(),
            graph.num_edges(),
            100.0 * report.dropped_ratio()
        );

        (ViewGraph::new(graph.nodes().iter().copied(), kept), report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::so3::{angle_between, from_axis_angle_deg};
    use crate::types::GlobalPose;
    use approx::assert_relative_eq;
    use glam::DVec3;

    fn square_poses() -> Vec<GlobalPose> {
        (0..4)
            .map(|i| {
                let yaw = 90.0 * i as f64;
                let c = DVec3::new((i % 2) as f64, (i / 2) as f64, 0.0);
                GlobalPose::new(from_axis_angle_deg(DVec3::Z, yaw + 5.0), c)
            })
            .collect()
    }

    fn full_graph(poses: &[GlobalPose]) -> Vec<RelativePoseEdge> {
        let mut edges = Vec::new();
        for i in 0..poses.len() {
            for j in i + 1..poses.len() {
                edges.push(RelativePoseEdge::from_poses(i, j, &poses[i], &poses[j]));
            }
        }
        edges
    }

    #[test]
    fn test_aggregation() {
        let e = [4.0, 1.0, 3.0, 2.0];
        assert_eq!(EdgeErrorAggregation::Median.aggregate(&e), Some(2.0));
        assert_eq!(EdgeErrorAggregation::Min.aggregate(&e), Some(1.0));
        assert_eq!(EdgeErrorAggregation::Mean.aggregate(&e), Some(2.5));
        assert_eq!(EdgeErrorAggregation::TrimmedMean(0.5).aggregate(&e), Some(1.5));
        assert_eq!(EdgeErrorAggregation::Median.aggregate(&[]), None);
    }

    #[test]
    fn test_cycle_closure() {
        let poses = square_poses();
        let graph = ViewGraph::new(0..4, full_graph(&poses));
        assert_eq!(graph.triplets().len(), 4);
        for t in graph.triplets() {
            assert!(graph.triplet_error_deg(t).unwrap() < 1e-3f64.to_degrees());
        }
    }

    #[test]
    fn test_drop_corrupted_edge() {
        let poses = square_poses();
        let mut edges = full_graph(&poses);
        edges[0].i2_r_i1 = from_axis_angle_deg(DVec3::X, 90.0) * edges[0].i2_r_i1;
        let graph = ViewGraph::new(0..4, edges);
        let (filtered, report) = ViewGraphEstimator::default().filter(&graph);

        assert_eq!(report.dropped, vec![(0, 1)]);
        assert_eq!(filtered.num_edges(), 5);
        assert!(filtered.edge(0, 1).is_none());
        assert_relative_eq!(report.scores[&(0, 1)], 90.0, epsilon = 1e-6);
        assert!(report.scores[&(2, 3)] < 1e-6);
        assert_relative_eq!(report.dropped_ratio(), 1.0 / 6.0);
    }

    #[test]
    fn test_isolated_edge_kept() {
        let poses = square_poses();
        let mut edge = RelativePoseEdge::from_poses(0, 1, &poses[0], &poses[1]);
        edge.i2_r_i1 = from_axis_angle_deg(DVec3::X, 90.0);
        let graph = ViewGraph::new([0, 1, 5], vec![edge]);
        let (filtered, report) = ViewGraphEstimator::default().filter(&graph);
        assert_eq!(filtered.num_edges(), 1);
        assert!(report.scores.is_empty());
        assert_eq!(filtered.connected_components(), vec![vec![0, 1], vec![5]]);
    }

    #[test]
    fn test_orientation_and_components() {
        let poses = square_poses();
        let e = RelativePoseEdge::from_poses(2, 0, &poses[2], &poses[0]);
        let extra = RelativePoseEdge::from_poses(3, 4, &poses[3], &poses[0]);
        let graph = ViewGraph::new([7], vec![e, extra]);
        let oriented = graph.edge(0, 2).unwrap();
        let expected = RelativePoseEdge::from_poses(0, 2, &poses[0], &poses[2]);
        assert_eq!(oriented.key(), (0, 2));
        assert!(angle_between(&oriented.i2_r_i1, &expected.i2_r_i1) < 1e-12);
        assert!(oriented.i2_u_i1.dot(expected.i2_u_i1) > 1.0 - 1e-12);
        assert_eq!(
            graph.connected_components(),
            vec![vec![0, 2], vec![3, 4], vec![7]]
        );
    }
}
