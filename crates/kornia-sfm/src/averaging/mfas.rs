use glam::DVec3;

/// A direction measurement `w ~ (x_dst - x_src) / |x_dst - x_src|` between two nodes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectionMeasurement {
    /// Node the direction starts from.
    pub src: usize,
    /// Node the direction points to.
    pub dst: usize,
    /// Unit direction in the world frame.
    pub direction: DVec3,
}

/// Greedy minimum feedback arc set ordering of a weighted directed graph.
///
/// `arcs` holds `(from, to, weight)` with positive weights. Nodes without incoming
/// weight are taken first, otherwise the node with the largest outgoing to incoming
/// weight ratio. Returns the position of every node in the ordering.
pub fn mfas_order(num_nodes: usize, arcs: &[(usize, usize, f64)]) -> Vec<usize> {
    let mut out_w = vec![0.0; num_nodes];
    let mut in_w = vec![0.0; num_nodes];
    let mut out_arcs: Vec<Vec<(usize, f64)>> = vec![Vec::new(); num_nodes];
    let mut in_arcs: Vec<Vec<(usize, f64)>> = vec![Vec::new(); num_nodes];
    for &(a, b, w) in arcs {
        out_w[a] += w;
        in_w[b] += w;
        out_arcs[a].push((b, w));
        in_arcs[b].push((a, w));
    }

    let mut removed = vec![false; num_nodes];
    let mut position = vec![0; num_nodes];
    for pos in 0..num_nodes {
        let mut choice = usize::MAX;
        let mut best = f64::NEG_INFINITY;
        for node in 0..num_nodes {
            if removed[node] {
                continue;
            }
            if in_w[node] <= 0.0 {
                choice = node;
                break;
            }
            let ratio = out_w[node] / in_w[node];
            if ratio > best {
                best = ratio;
                choice = node;
            }
        }
        if choice == usize::MAX {
            break;
        }

        removed[choice] = true;
        position[choice] = pos;
        for &(b, w) in out_arcs[choice].iter() {
            in_w[b] -= w;
        }
        for &(a, w) in in_arcs[choice].iter() {
            out_w[a] -= w;
        }
    }
    position
}

/// Outlier weight of every measurement for one projection direction.
///
/// Measurements are projected onto `projection` and oriented by the sign of the
/// projection. A measurement that points backwards in the resulting ordering gets
/// the magnitude of its projection as weight, the others get zero.
pub fn outlier_weights(
    num_nodes: usize,
    measurements: &[DirectionMeasurement],
    projection: DVec3,
) -> Vec<f64> {
    let arcs: Vec<(usize, usize, f64)> = measurements
        .iter()
        .map(|m| {
            let p = m.direction.dot(projection);
            if p >= 0.0 {
                (m.src, m.dst, p)
            } else {
                (m.dst, m.src, -p)
            }
        })
        .collect();
    let position = mfas_order(num_nodes, &arcs);
    arcs.iter()
        .map(|&(a, b, w)| if position[a] > position[b] { w } else { 0.0 })
        .collect()
}
