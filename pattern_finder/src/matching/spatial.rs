//! 2D k-d tree for nearest-star queries.

use glam::DVec2;

/// Median-split k-d tree over star positions. Built once per match, queried
/// once per projected pattern point per hypothesis.
#[derive(Debug)]
pub struct KdTree {
    nodes: Vec<KdNode>,
    points: Vec<DVec2>,
}

#[derive(Debug, Clone)]
struct KdNode {
    point_idx: usize,
    left: Option<usize>,
    right: Option<usize>,
    /// 0 = x, 1 = y
    split_dim: usize,
}

#[inline]
fn axis(p: DVec2, dim: usize) -> f64 {
    if dim == 0 {
        p.x
    } else {
        p.y
    }
}

impl KdTree {
    /// Returns `None` for an empty point set.
    pub fn build(points: &[DVec2]) -> Option<Self> {
        if points.is_empty() {
            return None;
        }

        let mut indices: Vec<usize> = (0..points.len()).collect();
        let mut nodes = Vec::with_capacity(points.len());
        Self::build_recursive(points, &mut indices, 0, &mut nodes);

        Some(Self {
            nodes,
            points: points.to_vec(),
        })
    }

    fn build_recursive(
        points: &[DVec2],
        indices: &mut [usize],
        depth: usize,
        nodes: &mut Vec<KdNode>,
    ) -> Option<usize> {
        if indices.is_empty() {
            return None;
        }

        let split_dim = depth % 2;
        indices.sort_by(|&a, &b| axis(points[a], split_dim).total_cmp(&axis(points[b], split_dim)));

        let median = indices.len() / 2;
        let node_idx = nodes.len();
        nodes.push(KdNode {
            point_idx: indices[median],
            left: None,
            right: None,
            split_dim,
        });

        let (left_indices, right_part) = indices.split_at_mut(median);
        let left = Self::build_recursive(points, left_indices, depth + 1, nodes);
        let right = Self::build_recursive(points, &mut right_part[1..], depth + 1, nodes);

        nodes[node_idx].left = left;
        nodes[node_idx].right = right;
        Some(node_idx)
    }

    /// Nearest point to `query` as `(index, distance)`.
    pub fn nearest(&self, query: DVec2) -> (usize, f64) {
        let mut best = (self.nodes[0].point_idx, f64::INFINITY);
        self.nearest_recursive(0, query, &mut best);
        (best.0, best.1.sqrt())
    }

    fn nearest_recursive(&self, node_idx: usize, query: DVec2, best: &mut (usize, f64)) {
        let node = &self.nodes[node_idx];
        let point = self.points[node.point_idx];

        let dist_sq = query.distance_squared(point);
        if dist_sq < best.1 {
            *best = (node.point_idx, dist_sq);
        }

        let diff = axis(query, node.split_dim) - axis(point, node.split_dim);
        let (first, second) = if diff < 0.0 {
            (node.left, node.right)
        } else {
            (node.right, node.left)
        };

        if let Some(first_idx) = first {
            self.nearest_recursive(first_idx, query, best);
        }
        if let Some(second_idx) = second {
            if diff * diff < best.1 {
                self.nearest_recursive(second_idx, query, best);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_empty_tree_is_none() {
        assert!(KdTree::build(&[]).is_none());
    }

    #[test]
    fn test_nearest_matches_brute_force() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let points: Vec<DVec2> = (0..200)
            .map(|_| DVec2::new(rng.random_range(0.0..500.0), rng.random_range(0.0..300.0)))
            .collect();
        let tree = KdTree::build(&points).unwrap();
        assert_eq!(tree.len(), 200);

        for _ in 0..100 {
            let q = DVec2::new(rng.random_range(-20.0..520.0), rng.random_range(-20.0..320.0));
            let (idx, dist) = tree.nearest(q);
            let brute = points
                .iter()
                .map(|p| p.distance(q))
                .fold(f64::INFINITY, f64::min);
            assert!((dist - brute).abs() < 1e-9);
            assert!((points[idx].distance(q) - brute).abs() < 1e-9);
        }
    }

    #[test]
    fn test_single_point() {
        let tree = KdTree::build(&[DVec2::new(3.0, 4.0)]).unwrap();
        assert_eq!(tree.nearest(DVec2::ZERO), (0, 5.0));
    }
}
