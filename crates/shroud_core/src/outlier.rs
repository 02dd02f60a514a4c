//! k-NN outlier scoring on an assembled Gram matrix.
//!
//! The Gram matrix is all the downstream analytics need: squared pairwise
//! distances follow from `d²(i,j) = g_ii + g_jj - 2·g_ij`, so the scores
//! never touch raw rows. Four classic scores are provided; higher always
//! means more outlying.

use crate::matrix::Matrix;

pub struct KnnOutlierDetection {
    nb_samples: usize,
    distances: Matrix,
    /// Per row, all sample indices ordered by ascending distance. Index 0
    /// is the sample itself.
    neighbors: Vec<Vec<usize>>,
}

impl KnnOutlierDetection {
    pub fn new(gram: &Matrix) -> Self {
        let n = gram.rows();
        assert_eq!(gram.cols(), n, "gram matrix must be square");
        let mut distances = Matrix::zeros(n, n);
        for i in 0..n {
            for j in 0..n {
                let sq = gram.get(i, i) + gram.get(j, j) - 2.0 * gram.get(i, j);
                // Floating-point noise can push tiny squared distances
                // below zero.
                distances.set(i, j, sq.max(0.0).sqrt());
            }
        }
        let neighbors = (0..n)
            .map(|i| {
                let mut order: Vec<usize> = (0..n).collect();
                order.sort_by(|&a, &b| distances.get(i, a).total_cmp(&distances.get(i, b)));
                order
            })
            .collect();
        Self {
            nb_samples: n,
            distances,
            neighbors,
        }
    }

    pub fn nb_samples(&self) -> usize {
        self.nb_samples
    }

    /// Distance to the k-th nearest neighbor.
    pub fn knn_simple_score(&self, k: usize) -> Vec<f64> {
        (0..self.nb_samples)
            .map(|i| self.distances.get(i, self.neighbors[i][k]))
            .collect()
    }

    /// Sum of distances to the k nearest neighbors.
    pub fn knn_weighted_score(&self, k: usize) -> Vec<f64> {
        (0..self.nb_samples)
            .map(|i| {
                (1..=k)
                    .map(|j| self.distances.get(i, self.neighbors[i][j]))
                    .sum()
            })
            .collect()
    }

    /// Local distance-based outlier factor: mean neighbor distance over the
    /// mean inner distance of the neighborhood.
    pub fn ldof_score(&self, k: usize) -> Vec<f64> {
        let pair_count = (k * (k - 1) / 2) as f64;
        (0..self.nb_samples)
            .map(|i| {
                let nbrs = &self.neighbors[i][1..=k];
                let mut inner = 0.0;
                for a in 0..k {
                    for b in a + 1..k {
                        inner += self.distances.get(nbrs[a], nbrs[b]);
                    }
                }
                let inner_mean = inner / pair_count;
                let knn_mean: f64 =
                    nbrs.iter().map(|&n| self.distances.get(i, n)).sum::<f64>() / k as f64;
                knn_mean / inner_mean
            })
            .collect()
    }

    /// Local outlier factor over reachability distances.
    pub fn lof_score(&self, k: usize) -> Vec<f64> {
        // Inverse local reachability density, scaled by k (the factor
        // cancels in the ratio below).
        let lrd_inv: Vec<f64> = (0..self.nb_samples)
            .map(|i| {
                self.neighbors[i][1..=k]
                    .iter()
                    .map(|&n| {
                        let kth_of_n = self.distances.get(n, self.neighbors[n][k]);
                        kth_of_n.max(self.distances.get(i, n))
                    })
                    .sum()
            })
            .collect();
        (0..self.nb_samples)
            .map(|i| {
                self.neighbors[i][1..=k]
                    .iter()
                    .map(|&n| lrd_inv[i] / lrd_inv[n])
                    .sum::<f64>()
                    / k as f64
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Four 1-D points at 0, 1, 2, 10; the last one is the obvious outlier.
    fn line_gram() -> Matrix {
        let xs = [0.0, 1.0, 2.0, 10.0];
        let data = Matrix::new(4, 1, xs.to_vec());
        data.matmul_nt(&data)
    }

    #[test]
    fn distances_recovered_from_gram() {
        let det = KnnOutlierDetection::new(&line_gram());
        assert!((det.distances.get(0, 3) - 10.0).abs() < 1e-9);
        assert!((det.distances.get(1, 2) - 1.0).abs() < 1e-9);
        assert_eq!(det.distances.get(2, 2), 0.0);
    }

    #[test]
    fn knn_scores_flag_the_isolated_point() {
        let det = KnnOutlierDetection::new(&line_gram());
        let simple = det.knn_simple_score(1);
        assert_eq!(simple, vec![1.0, 1.0, 1.0, 8.0]);
        let weighted = det.knn_weighted_score(2);
        assert_eq!(weighted, vec![3.0, 2.0, 3.0, 17.0]);
    }

    #[test]
    fn density_scores_rank_the_isolated_point_highest() {
        let det = KnnOutlierDetection::new(&line_gram());
        for scores in [det.lof_score(2), det.ldof_score(2)] {
            let top = scores
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| i);
            assert_eq!(top, Some(3), "scores were {scores:?}");
        }
    }
}
