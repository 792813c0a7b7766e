//! Isolation tree construction and traversal.
//!
//! Trees are built on z-score-normalized rows. Splits pick a feature
//! uniformly at random and a uniform split point strictly inside that
//! feature's (min, max) over the subsample; recursion stops at single-row
//! subsamples or constant features.

use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Euler–Mascheroni constant, used in the average-path-length correction.
const EULER_GAMMA: f64 = 0.577_215_664_9;

/// One node of an isolation tree.
///
/// Serializes to the external model schema:
/// `{"leaf":true,"size":n}` or `{"feature":i,"split":x,"left":…,"right":…}`.
/// `feature` is an index into the model's feature list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TreeNode {
    Split {
        feature: usize,
        split: f64,
        left: Box<TreeNode>,
        right: Box<TreeNode>,
    },
    Leaf {
        leaf: bool,
        size: usize,
    },
}

impl TreeNode {
    fn leaf(size: usize) -> Self {
        TreeNode::Leaf { leaf: true, size }
    }
}

/// Expected average path length of an unsuccessful BST search over `n`
/// points: `c(n) = 2·(ln(n−1) + γ) − 2·(n−1)/n` for n > 1, else 0.
pub fn average_path_length(n: usize) -> f64 {
    if n > 1 {
        let nf = n as f64;
        2.0 * ((nf - 1.0).ln() + EULER_GAMMA) - 2.0 * (nf - 1.0) / nf
    } else {
        0.0
    }
}

/// Recursively build an isolation tree over `rows` (indices into `matrix`).
///
/// `matrix` is row-major normalized data; all rows share the feature arity.
pub fn build_tree(matrix: &[Vec<f64>], rows: &[usize], rng: &mut StdRng) -> TreeNode {
    if rows.len() <= 1 {
        return TreeNode::leaf(rows.len());
    }

    let n_features = matrix[rows[0]].len();
    let feature = rng.gen_range(0..n_features);

    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for &row in rows {
        let v = matrix[row][feature];
        min = min.min(v);
        max = max.max(v);
    }
    if min == max {
        return TreeNode::leaf(rows.len());
    }

    let split = min + rng.gen::<f64>() * (max - min);

    let (left_rows, right_rows): (Vec<usize>, Vec<usize>) =
        rows.iter().partition(|&&row| matrix[row][feature] < split);

    // A degenerate split (possible only when the RNG lands exactly on `min`)
    // would recurse on the full subsample forever.
    if left_rows.is_empty() || right_rows.is_empty() {
        return TreeNode::leaf(rows.len());
    }

    TreeNode::Split {
        feature,
        split,
        left: Box::new(build_tree(matrix, &left_rows, rng)),
        right: Box::new(build_tree(matrix, &right_rows, rng)),
    }
}

/// Path length of `point` through the tree: traversed edges plus the
/// `c(leaf_size)` correction at the terminal leaf.
pub fn path_length(root: &TreeNode, point: &[f64]) -> f64 {
    let mut node = root;
    let mut edges = 0_u32;
    loop {
        match node {
            TreeNode::Leaf { size, .. } => {
                return f64::from(edges) + average_path_length(*size);
            }
            TreeNode::Split {
                feature,
                split,
                left,
                right,
            } => {
                edges += 1;
                node = if point.get(*feature).copied().unwrap_or(0.0) < *split {
                    left
                } else {
                    right
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_average_path_length_reference_values() {
        assert_eq!(average_path_length(0), 0.0);
        assert_eq!(average_path_length(1), 0.0);
        // c(2) = 2(ln 1 + γ) − 1 = 2γ − 1
        assert!((average_path_length(2) - (2.0 * 0.577_215_664_9 - 1.0)).abs() < 1e-9);
        // c(256) ≈ 10.244 (standard iForest normalization constant)
        assert!((average_path_length(256) - 10.244).abs() < 0.01);
    }

    #[test]
    fn test_single_row_is_leaf() {
        let matrix = vec![vec![1.0, 2.0]];
        let mut rng = StdRng::seed_from_u64(7);
        let tree = build_tree(&matrix, &[0], &mut rng);
        assert_eq!(tree, TreeNode::Leaf { leaf: true, size: 1 });
    }

    #[test]
    fn test_constant_feature_terminates() {
        // Identical rows: any chosen feature has min == max.
        let matrix = vec![vec![3.0, 3.0]; 10];
        let rows: Vec<usize> = (0..10).collect();
        let mut rng = StdRng::seed_from_u64(7);
        let tree = build_tree(&matrix, &rows, &mut rng);
        assert_eq!(tree, TreeNode::Leaf { leaf: true, size: 10 });
    }

    #[test]
    fn test_outlier_isolates_shallow() {
        // Tight cluster plus one far outlier; the outlier's average path
        // over many trees must be markedly shorter.
        let mut matrix: Vec<Vec<f64>> = (0..128)
            .map(|i| vec![(i % 16) as f64 * 0.01, (i % 8) as f64 * 0.01])
            .collect();
        matrix.push(vec![10.0, 10.0]);
        let rows: Vec<usize> = (0..matrix.len()).collect();

        let mut cluster_total = 0.0;
        let mut outlier_total = 0.0;
        for seed in 0..40_u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let tree = build_tree(&matrix, &rows, &mut rng);
            cluster_total += path_length(&tree, &matrix[0]);
            outlier_total += path_length(&tree, &matrix[128]);
        }
        assert!(
            outlier_total < cluster_total,
            "outlier should isolate earlier: {outlier_total} vs {cluster_total}"
        );
    }

    #[test]
    fn test_build_is_deterministic_for_seed() {
        let matrix: Vec<Vec<f64>> = (0..64).map(|i| vec![i as f64, (i * 7 % 13) as f64]).collect();
        let rows: Vec<usize> = (0..64).collect();
        let a = build_tree(&matrix, &rows, &mut StdRng::seed_from_u64(42));
        let b = build_tree(&matrix, &rows, &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }

    #[test]
    fn test_node_serde_schema() {
        let node = TreeNode::Split {
            feature: 1,
            split: 0.5,
            left: Box::new(TreeNode::Leaf { leaf: true, size: 3 }),
            right: Box::new(TreeNode::Leaf { leaf: true, size: 4 }),
        };
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["feature"], 1);
        assert_eq!(json["left"]["leaf"], true);
        assert_eq!(json["left"]["size"], 3);

        let back: TreeNode = serde_json::from_value(json).unwrap();
        assert_eq!(back, node);
    }
}
