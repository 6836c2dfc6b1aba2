//! Scalar k-means: k-means++ seeding followed by Lloyd iterations.
//!
//! Distances are exact squared Euclidean distances computed per pair, never via
//! the `|a|² + |b|² - 2ab` expansion, so a point that coincides with a centroid
//! has distance exactly zero. Combined with lowest-index tie breaking this makes
//! assignment idempotent: re-assigning a centroid returns the id that produced it.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Parameters for a single k-means fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct KMeansParams {
    pub clusters: usize,
    pub max_iterations: usize,
    pub seed: u64,
}

#[inline]
pub(crate) fn squared_distance(a: ArrayView1<'_, f32>, b: ArrayView1<'_, f32>) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Index and distance of the closest row of `centroids`. Ties go to the lowest index.
#[inline]
pub(crate) fn nearest(point: ArrayView1<'_, f32>, centroids: ArrayView2<'_, f32>) -> (u32, f32) {
    let mut best = (0u32, f32::INFINITY);
    for (i, centroid) in centroids.outer_iter().enumerate() {
        let d = squared_distance(point, centroid);
        if d < best.1 {
            best = (i as u32, d);
        }
    }
    best
}

/// Nearest-centroid id for every row of `data`.
pub(crate) fn assign(data: ArrayView2<'_, f32>, centroids: ArrayView2<'_, f32>) -> Array1<u32> {
    data.outer_iter()
        .map(|row| nearest(row, centroids).0)
        .collect()
}

/// Fits exactly `params.clusters` centroids to `data`.
///
/// When `data` has fewer distinct rows than clusters, the surplus centroids
/// duplicate existing ones. An empty `data` yields all-zero centroids.
pub(crate) fn fit(data: ArrayView2<'_, f32>, params: &KMeansParams) -> Array2<f32> {
    let (n, dim) = data.dim();
    let k = params.clusters;
    if n == 0 || k == 0 {
        return Array2::zeros((k, dim));
    }

    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut centroids = kmeans_plus_plus(data, k, &mut rng);
    let mut assignments = vec![u32::MAX; n];

    for iteration in 0..params.max_iterations {
        let mut changed = 0usize;
        for (slot, row) in assignments.iter_mut().zip(data.outer_iter()) {
            let (id, _) = nearest(row, centroids.view());
            if *slot != id {
                *slot = id;
                changed += 1;
            }
        }
        if changed == 0 {
            log::debug!("k-means converged after {} iterations", iteration);
            break;
        }
        update_centroids(data, &assignments, &mut centroids);
    }
    centroids
}

/// k-means++ seeding: each new center is drawn with probability proportional to
/// its squared distance from the closest center chosen so far.
fn kmeans_plus_plus(data: ArrayView2<'_, f32>, k: usize, rng: &mut StdRng) -> Array2<f32> {
    let (n, dim) = data.dim();
    let mut centroids = Array2::zeros((k, dim));

    let first = rng.random_range(0..n);
    centroids.row_mut(0).assign(&data.row(first));
    let mut min_distances: Vec<f64> = data
        .outer_iter()
        .map(|row| squared_distance(row, data.row(first)) as f64)
        .collect();

    for center in 1..k {
        let total: f64 = min_distances.iter().sum();
        let chosen = if total > 0.0 {
            sample_proportional(&min_distances, total, rng)
        } else {
            // Every point already coincides with a center.
            rng.random_range(0..n)
        };

        centroids.row_mut(center).assign(&data.row(chosen));
        for (min_d, row) in min_distances.iter_mut().zip(data.outer_iter()) {
            let d = squared_distance(row, centroids.row(center)) as f64;
            if d < *min_d {
                *min_d = d;
            }
        }
    }
    centroids
}

/// Draws an index with probability `weights[i] / total`. Zero-weight entries are never chosen.
fn sample_proportional(weights: &[f64], total: f64, rng: &mut StdRng) -> usize {
    let mut target = rng.random::<f64>() * total;
    let mut last_positive = 0;
    for (i, &w) in weights.iter().enumerate() {
        if w <= 0.0 {
            continue;
        }
        if target < w {
            return i;
        }
        target -= w;
        last_positive = i;
    }
    // Rounding can leave a sliver of `target`.
    last_positive
}

/// Moves every non-empty cluster's centroid to the mean of its members.
/// Empty clusters keep their previous centroid.
fn update_centroids(data: ArrayView2<'_, f32>, assignments: &[u32], centroids: &mut Array2<f32>) {
    let (k, dim) = centroids.dim();
    let mut sums = Array2::<f64>::zeros((k, dim));
    let mut counts = vec![0usize; k];

    for (row, &id) in data.outer_iter().zip(assignments) {
        let id = id as usize;
        counts[id] += 1;
        for (acc, &v) in sums.row_mut(id).iter_mut().zip(row.iter()) {
            *acc += v as f64;
        }
    }

    for (id, &count) in counts.iter().enumerate() {
        if count == 0 {
            continue;
        }
        for (c, &s) in centroids.row_mut(id).iter_mut().zip(sums.row(id).iter()) {
            *c = (s / count as f64) as f32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn params(clusters: usize) -> KMeansParams {
        KMeansParams {
            clusters,
            max_iterations: 20,
            seed: 7,
        }
    }

    #[test]
    fn test_fit_separates_well_separated_groups() {
        let data = array![
            [0.0f32, 0.0],
            [0.1, 0.0],
            [0.0, 0.1],
            [10.0, 10.0],
            [10.1, 10.0],
            [10.0, 10.1],
        ];
        let centroids = fit(data.view(), &params(2));
        let ids = assign(data.view(), centroids.view());

        assert_eq!(ids[0], ids[1]);
        assert_eq!(ids[1], ids[2]);
        assert_eq!(ids[3], ids[4]);
        assert_eq!(ids[4], ids[5]);
        assert_ne!(ids[0], ids[3]);
    }

    #[test]
    fn test_fit_always_returns_requested_cluster_count() {
        let data = array![[1.0f32], [1.0], [2.0]];
        let centroids = fit(data.view(), &params(5));
        assert_eq!(centroids.dim(), (5, 1));

        let empty = Array2::<f32>::zeros((0, 3));
        assert_eq!(fit(empty.view(), &params(4)).dim(), (4, 3));
    }

    #[test]
    fn test_fit_is_deterministic_for_a_seed() {
        let data = Array2::from_shape_fn((50, 3), |(i, j)| ((i * 31 + j * 7) % 13) as f32);
        let a = fit(data.view(), &params(6));
        let b = fit(data.view(), &params(6));
        assert_eq!(a, b);
    }

    #[test]
    fn test_assign_breaks_ties_toward_lowest_index() {
        let centroids = array![[1.0f32, 1.0], [0.0, 0.0], [0.0, 0.0]];
        let point = array![0.0f32, 0.0];
        assert_eq!(nearest(point.view(), centroids.view()), (1, 0.0));
    }

    #[test]
    fn test_assignment_of_centroids_is_idempotent() {
        let data = Array2::from_shape_fn((40, 2), |(i, j)| ((i * 17 + j * 5) % 11) as f32 * 0.3);
        let centroids = fit(data.view(), &params(8));
        let ids = assign(data.view(), centroids.view());

        let rows: Vec<usize> = ids.iter().map(|&i| i as usize).collect();
        let reconstructed = centroids.select(ndarray::Axis(0), &rows);
        assert_eq!(assign(reconstructed.view(), centroids.view()), ids);
    }

    #[test]
    fn test_sample_proportional_skips_zero_weights() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..100 {
            let i = sample_proportional(&[0.0, 2.0, 0.0, 1.0], 3.0, &mut rng);
            assert!(i == 1 || i == 3);
        }
    }
}
