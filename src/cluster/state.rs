//! Mutable cluster state and the structural operations of DipDECK.
//!
//! The training loop owns exactly one [`ClusterState`] and threads it by
//! exclusive reference through every epoch: labels, the cluster centers in
//! both spaces, and the pairwise dip p-value matrix. Structural changes
//! (merges, forced removals) go through the functions in this module, which
//! maintain two invariants the rest of the crate relies on:
//!
//! - labels always form the contiguous range `[0, n_clusters)`;
//! - every center is an actual sample row, never a synthetic centroid, so a
//!   center can be re-encoded consistently with real data.

use super::util::{euclidean, nearest_row, squared_euclidean};
use crate::dip::UnimodalityTest;
use crate::error::Result;

/// Combined sample floor for the imbalance subsampler: when two clusters
/// together would contribute fewer projected points than this, the larger
/// side is topped up to reach it.
pub(crate) const MIN_DIP_SAMPLE: usize = 50;

/// The mutable quadruple owned by the training orchestrator.
#[derive(Debug, Clone)]
pub(crate) struct ClusterState {
    /// Per-sample cluster labels in `[0, n_clusters)`.
    pub labels: Vec<usize>,
    /// Original-space center rows (always sample rows).
    pub centers: Vec<Vec<f32>>,
    /// The same centers in embedding space.
    pub embedded_centers: Vec<Vec<f32>>,
    /// Symmetric pairwise dip p-values, zero diagonal.
    pub dip_matrix: Vec<Vec<f64>>,
    /// Current cluster count.
    pub n_clusters: usize,
}

/// Number of members per cluster.
pub(crate) fn cluster_sizes(labels: &[usize], n_clusters: usize) -> Vec<usize> {
    let mut sizes = vec![0usize; n_clusters];
    for &l in labels {
        sizes[l] += 1;
    }
    sizes
}

/// Nearest-center assignment of every embedded point.
pub(crate) fn assign_nearest(embedded: &[Vec<f32>], centers: &[Vec<f32>]) -> Vec<usize> {
    embedded.iter().map(|p| nearest_row(centers, p)).collect()
}

/// Per-cluster mean of the embedded members. A cluster that lost all its
/// members keeps its previous embedded center as the target.
pub(crate) fn cluster_means(
    embedded: &[Vec<f32>],
    labels: &[usize],
    n_clusters: usize,
    fallback: &[Vec<f32>],
) -> Vec<Vec<f32>> {
    let dim = embedded.first().map_or(0, Vec::len);
    let mut sums = vec![vec![0.0f32; dim]; n_clusters];
    let mut counts = vec![0usize; n_clusters];
    for (&l, point) in labels.iter().zip(embedded) {
        counts[l] += 1;
        for (s, x) in sums[l].iter_mut().zip(point) {
            *s += x;
        }
    }
    sums.into_iter()
        .zip(counts)
        .enumerate()
        .map(|(c, (sum, count))| {
            if count == 0 {
                fallback[c].clone()
            } else {
                sum.into_iter().map(|s| s / count as f32).collect()
            }
        })
        .collect()
}

/// Snap embedding-space targets to the nearest actual samples.
///
/// For each target the single nearest embedded sample is selected and
/// returned both as its original-space row and its embedding. This is what
/// keeps centers real observations.
pub(crate) fn nearest_points_to_targets(
    data: &[Vec<f32>],
    embedded: &[Vec<f32>],
    targets: &[Vec<f32>],
) -> (Vec<Vec<f32>>, Vec<Vec<f32>>) {
    let mut centers = Vec::with_capacity(targets.len());
    let mut embedded_centers = Vec::with_capacity(targets.len());
    for target in targets {
        let idx = nearest_row(embedded, target);
        centers.push(data[idx].clone());
        embedded_centers.push(embedded[idx].clone());
    }
    (centers, embedded_centers)
}

/// Restrict the larger cluster of an imbalanced pair to the points nearest
/// the smaller cluster's center.
///
/// The target count is `factor * size_smaller`, raised so that the combined
/// pair still reaches `min_sample_size` points (but never beyond what the
/// larger cluster has). Returned in order of increasing distance.
pub(crate) fn nearest_subset<'a>(
    points: &[&'a [f32]],
    center: &[f32],
    size_smaller: usize,
    factor: f32,
    min_sample_size: usize,
) -> Vec<&'a [f32]> {
    let mut order: Vec<usize> = (0..points.len()).collect();
    order.sort_by(|&a, &b| {
        squared_euclidean(points[a], center).total_cmp(&squared_euclidean(points[b], center))
    });
    let mut sample_size = (size_smaller as f32 * factor) as usize;
    if size_smaller + sample_size < min_sample_size {
        sample_size = min_sample_size - size_smaller;
    }
    sample_size = sample_size.min(points.len());
    order[..sample_size].iter().map(|&i| points[i]).collect()
}

/// Scalar projections of a set of points onto an axis.
fn project(points: &[&[f32]], axis: &[f32]) -> Vec<f32> {
    points
        .iter()
        .map(|p| p.iter().zip(axis).map(|(x, a)| x * a).sum())
        .collect()
}

fn pair_p_value(
    points_i: &[&[f32]],
    points_j: &[&[f32]],
    axis: &[f32],
    test: &dyn UnimodalityTest,
) -> Result<f64> {
    let mut proj = project(points_i, axis);
    proj.extend(project(points_j, axis));
    // Below the smallest tabulated sample size there is no unimodality
    // evidence either way; degenerate pairs fold into their neighbors.
    if proj.len() < 4 {
        return Ok(1.0);
    }
    let dip = test.dip(&proj);
    test.p_value(dip, proj.len())
}

/// Pairwise dip p-value matrix over all current clusters.
///
/// For every unordered pair the union of both clusters' embedded points is
/// projected onto the axis connecting their centers and dip-tested. When
/// the pair is heavily size-imbalanced (one side more than `factor` times
/// the other) the test is repeated with the larger side restricted to its
/// nearest points to the smaller center, and the smaller of the two
/// p-values is kept: subsampling may never make a pair look better
/// separated than the full data does.
pub(crate) fn build_dip_matrix(
    embedded: &[Vec<f32>],
    embedded_centers: &[Vec<f32>],
    labels: &[usize],
    n_clusters: usize,
    factor: f32,
    test: &dyn UnimodalityTest,
) -> Result<Vec<Vec<f64>>> {
    let mut members: Vec<Vec<&[f32]>> = vec![Vec::new(); n_clusters];
    for (&l, point) in labels.iter().zip(embedded) {
        members[l].push(point.as_slice());
    }

    let mut matrix = vec![vec![0.0f64; n_clusters]; n_clusters];
    for i in 0..n_clusters.saturating_sub(1) {
        for j in i + 1..n_clusters {
            let axis: Vec<f32> = embedded_centers[i]
                .iter()
                .zip(&embedded_centers[j])
                .map(|(a, b)| a - b)
                .collect();
            let (pi, pj) = (&members[i], &members[j]);
            let mut p = pair_p_value(pi, pj, &axis, test)?;

            let ni = pi.len() as f32;
            let nj = pj.len() as f32;
            if ni > nj * factor || nj > ni * factor {
                let p_sub = if ni > nj * factor {
                    let sub = nearest_subset(
                        pi,
                        &embedded_centers[j],
                        pj.len(),
                        factor,
                        MIN_DIP_SAMPLE,
                    );
                    pair_p_value(&sub, pj, &axis, test)?
                } else {
                    let sub = nearest_subset(
                        pj,
                        &embedded_centers[i],
                        pi.len(),
                        factor,
                        MIN_DIP_SAMPLE,
                    );
                    pair_p_value(pi, &sub, &axis, test)?
                };
                p = p.min(p_sub);
            }

            matrix[i][j] = p;
            matrix[j][i] = p;
        }
    }
    Ok(matrix)
}

/// Position of the largest off-diagonal p-value (first occurrence in
/// row-major order, matching an argmax over the full symmetric matrix).
/// Returns `(0, 0)` for a matrix smaller than 2x2.
pub(crate) fn dip_argmax(matrix: &[Vec<f64>]) -> (usize, usize) {
    let k = matrix.len();
    let mut best = (0, 0);
    let mut best_val = f64::NEG_INFINITY;
    for i in 0..k.saturating_sub(1) {
        for j in i + 1..k {
            if matrix[i][j] > best_val {
                best_val = matrix[i][j];
                best = (i, j);
            }
        }
    }
    best
}

/// Relabel after retiring the cluster pair `(a, b)` into the merged cluster
/// `n_new - 1`.
///
/// Members of either retired cluster get the new top label. Labels above
/// both retired indices shift down by 2, labels strictly between them by 1,
/// labels below both are unchanged. The result is again the contiguous
/// range `[0, n_new)`.
pub(crate) fn relabel_after_merge(labels: &mut [usize], retired: (usize, usize), n_new: usize) {
    let (a, b) = retired;
    let (lo, hi) = (a.min(b), a.max(b));
    for l in labels.iter_mut() {
        let v = *l;
        *l = if v == a || v == b {
            n_new - 1
        } else if v < lo {
            v
        } else if v > hi {
            v - 2
        } else {
            v - 1
        };
    }
}

/// Merge the cluster pair at the dip argmax into one cluster.
///
/// Decrements the cluster count, relabels, places the merged center at the
/// size-weighted average of the two old embedded centers snapped to a real
/// sample, replaces the two retired center rows with the new one at the
/// top, and rebuilds the dip matrix.
pub(crate) fn merge_clusters(
    state: &mut ClusterState,
    data: &[Vec<f32>],
    embedded: &[Vec<f32>],
    pair: (usize, usize),
    factor: f32,
    test: &dyn UnimodalityTest,
) -> Result<()> {
    let (a, b) = pair;
    let count_a = state.labels.iter().filter(|&&l| l == a).count();
    let count_b = state.labels.iter().filter(|&&l| l == b).count();

    state.n_clusters -= 1;
    relabel_after_merge(&mut state.labels, pair, state.n_clusters);

    // Size-weighted average of the two old embedded centers.
    let total = (count_a + count_b) as f32;
    let target: Vec<f32> = state.embedded_centers[a]
        .iter()
        .zip(&state.embedded_centers[b])
        .map(|(ca, cb)| (ca * count_a as f32 + cb * count_b as f32) / total)
        .collect();
    let (new_center, new_embedded) = nearest_points_to_targets(data, embedded, &[target]);

    let (lo, hi) = (a.min(b), a.max(b));
    state.centers.remove(hi);
    state.centers.remove(lo);
    state.centers.extend(new_center);
    state.embedded_centers.remove(hi);
    state.embedded_centers.remove(lo);
    state.embedded_centers.extend(new_embedded);

    state.dip_matrix = build_dip_matrix(
        embedded,
        &state.embedded_centers,
        &state.labels,
        state.n_clusters,
        factor,
        test,
    )?;
    Ok(())
}

/// Dissolve a cluster entirely: its members move to their nearest surviving
/// center, labels above it shift down, and all centers are recomputed as
/// the nearest real point to each cluster's embedded mean.
pub(crate) fn dissolve_cluster(
    state: &mut ClusterState,
    data: &[Vec<f32>],
    embedded: &[Vec<f32>],
    cluster: usize,
    factor: f32,
    test: &dyn UnimodalityTest,
) -> Result<()> {
    state.n_clusters -= 1;

    for (l, point) in state.labels.iter_mut().zip(embedded) {
        if *l != cluster {
            continue;
        }
        let mut best = 0;
        let mut best_d = f32::INFINITY;
        for (c, center) in state.embedded_centers.iter().enumerate() {
            if c == cluster {
                continue;
            }
            let d = euclidean(center, point);
            if d < best_d {
                best_d = d;
                best = c;
            }
        }
        *l = best;
    }
    for l in state.labels.iter_mut() {
        if *l > cluster {
            *l -= 1;
        }
    }

    state.centers.remove(cluster);
    state.embedded_centers.remove(cluster);
    let means = cluster_means(
        embedded,
        &state.labels,
        state.n_clusters,
        &state.embedded_centers,
    );
    let (centers, embedded_centers) = nearest_points_to_targets(data, embedded, &means);
    state.centers = centers;
    state.embedded_centers = embedded_centers;

    state.dip_matrix = build_dip_matrix(
        embedded,
        &state.embedded_centers,
        &state.labels,
        state.n_clusters,
        factor,
        test,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dip::TableDipTest;
    use crate::error::Result;

    /// P-value is the reciprocal of the projected sample size; lets tests
    /// observe exactly which sample sizes the builder tested.
    struct SizeProbe;

    impl UnimodalityTest for SizeProbe {
        fn dip(&self, _sample: &[f32]) -> f64 {
            0.0
        }
        fn p_value(&self, _dip: f64, n: usize) -> Result<f64> {
            Ok(1.0 / n as f64)
        }
    }

    fn contiguous(labels: &[usize], n_clusters: usize) -> bool {
        let sizes = cluster_sizes(labels, n_clusters);
        sizes.iter().all(|&s| s > 0)
    }

    #[test]
    fn test_relabel_every_relative_ordering() {
        // 6 clusters, one member each: labels == old cluster indices.
        let cases: &[((usize, usize), [usize; 6])] = &[
            // (a, b) retired -> expected new labels for old labels 0..6
            ((0, 1), [4, 4, 0, 1, 2, 3]),
            ((1, 0), [4, 4, 0, 1, 2, 3]),
            ((2, 5), [0, 1, 4, 2, 3, 4]),
            ((5, 2), [0, 1, 4, 2, 3, 4]),
            ((0, 5), [4, 0, 1, 2, 3, 4]),
            ((3, 4), [0, 1, 2, 4, 4, 3]),
            ((4, 3), [0, 1, 2, 4, 4, 3]),
        ];
        for &(pair, expected) in cases {
            let mut labels: Vec<usize> = (0..6).collect();
            relabel_after_merge(&mut labels, pair, 5);
            assert_eq!(labels, expected, "pair {pair:?}");
            assert!(contiguous(&labels, 5), "pair {pair:?} left a gap");
        }
    }

    #[test]
    fn test_relabel_adjacent_pairs_stay_contiguous() {
        for a in 0..5 {
            for b in 0..5 {
                if a == b {
                    continue;
                }
                let mut labels: Vec<usize> = (0..5).flat_map(|c| [c, c, c]).collect();
                relabel_after_merge(&mut labels, (a, b), 4);
                assert!(contiguous(&labels, 4), "pair ({a}, {b})");
                assert!(labels.iter().all(|&l| l < 4));
            }
        }
    }

    #[test]
    fn test_nearest_subset_orders_and_truncates() {
        let rows: Vec<Vec<f32>> = (0..10).map(|i| vec![i as f32, 0.0]).collect();
        let points: Vec<&[f32]> = rows.iter().map(Vec::as_slice).collect();
        let center = [9.5f32, 0.0];
        // factor 2, smaller cluster of 2, floor disabled by a low value.
        let subset = nearest_subset(&points, &center, 2, 2.0, 4);
        assert_eq!(subset.len(), 4);
        assert_eq!(subset[0][0], 9.0);
        assert_eq!(subset[1][0], 8.0);
        assert_eq!(subset[3][0], 6.0);
    }

    #[test]
    fn test_nearest_subset_floor_tops_up() {
        let rows: Vec<Vec<f32>> = (0..100).map(|i| vec![i as f32]).collect();
        let points: Vec<&[f32]> = rows.iter().map(Vec::as_slice).collect();
        // target = 2 * 10 = 20, but 10 + 20 < 50, so take 50 - 10 = 40.
        let subset = nearest_subset(&points, &[0.0], 10, 2.0, 50);
        assert_eq!(subset.len(), 40);
        // Never more than available.
        let few: Vec<&[f32]> = points[..15].to_vec();
        let subset = nearest_subset(&few, &[0.0], 10, 2.0, 50);
        assert_eq!(subset.len(), 15);
    }

    #[test]
    fn test_imbalanced_pair_keeps_minimum_p_value() {
        // Cluster 0: 200 points, cluster 1: 10 points, factor 2.
        let mut embedded: Vec<Vec<f32>> = (0..200).map(|i| vec![i as f32 * 0.01]).collect();
        embedded.extend((0..10).map(|i| vec![50.0 + i as f32 * 0.01]));
        let mut labels = vec![0usize; 200];
        labels.extend(vec![1usize; 10]);
        let centers = vec![vec![1.0], vec![50.0]];

        let matrix = build_dip_matrix(&embedded, &centers, &labels, 2, 2.0, &SizeProbe).unwrap();
        // Full pair: 210 points. Subsampled: 10 + max(2*10, 50-10) = 50.
        let expected = (1.0f64 / 210.0).min(1.0 / 50.0);
        assert_eq!(matrix[0][1], expected);
        assert_eq!(matrix[1][0], expected);
    }

    #[test]
    fn test_dip_matrix_shape_and_idempotence() {
        // Three clusters on a line, enough points for the p-value table.
        let mut embedded = Vec::new();
        let mut labels = Vec::new();
        for (c, base) in [0.0f32, 10.0, 20.0].iter().enumerate() {
            for i in 0..30 {
                embedded.push(vec![base + i as f32 * 0.01, i as f32 * 0.005]);
                labels.push(c);
            }
        }
        let centers = vec![vec![0.15, 0.07], vec![10.15, 0.07], vec![20.15, 0.07]];

        let m1 = build_dip_matrix(&embedded, &centers, &labels, 3, 2.0, &TableDipTest).unwrap();
        let m2 = build_dip_matrix(&embedded, &centers, &labels, 3, 2.0, &TableDipTest).unwrap();
        assert_eq!(m1, m2);
        for i in 0..3 {
            assert_eq!(m1[i][i], 0.0);
            for j in 0..3 {
                assert_eq!(m1[i][j], m1[j][i]);
                assert!((0.0..=1.0).contains(&m1[i][j]));
            }
        }
    }

    #[test]
    fn test_center_selection_returns_samples() {
        let data: Vec<Vec<f32>> = (0..20).map(|i| vec![i as f32, (i * i) as f32]).collect();
        let embedded: Vec<Vec<f32>> = (0..20).map(|i| vec![i as f32 * 0.1]).collect();
        let targets = vec![vec![0.42], vec![1.51]];
        let (centers, embedded_centers) = nearest_points_to_targets(&data, &embedded, &targets);
        assert_eq!(centers.len(), 2);
        for (c, e) in centers.iter().zip(&embedded_centers) {
            assert!(data.contains(c), "center {c:?} is not a sample");
            assert!(embedded.contains(e));
        }
        assert_eq!(embedded_centers[0], vec![0.4]);
        assert_eq!(embedded_centers[1], vec![1.5]);
    }

    fn three_cluster_state() -> (Vec<Vec<f32>>, Vec<Vec<f32>>, ClusterState) {
        let mut data = Vec::new();
        let mut labels = Vec::new();
        for (c, base) in [0.0f32, 5.0, 40.0].iter().enumerate() {
            for i in 0..20 {
                data.push(vec![base + i as f32 * 0.02, 1.0]);
                labels.push(c);
            }
        }
        let embedded: Vec<Vec<f32>> = data.iter().map(|r| vec![r[0]]).collect();
        let centers = vec![data[10].clone(), data[30].clone(), data[50].clone()];
        let embedded_centers = vec![embedded[10].clone(), embedded[30].clone(), embedded[50].clone()];
        let state = ClusterState {
            labels,
            centers,
            embedded_centers,
            dip_matrix: vec![vec![0.0; 3]; 3],
            n_clusters: 3,
        };
        (data, embedded, state)
    }

    #[test]
    fn test_merge_preserves_partition() {
        let (data, embedded, mut state) = three_cluster_state();
        merge_clusters(&mut state, &data, &embedded, (0, 1), 2.0, &TableDipTest).unwrap();

        assert_eq!(state.n_clusters, 2);
        assert_eq!(state.labels.len(), 60);
        assert!(contiguous(&state.labels, 2));
        // The two merged clusters became the new top label; the third moved
        // down to 0. No point lost membership.
        assert!(state.labels[..40].iter().all(|&l| l == 1));
        assert!(state.labels[40..].iter().all(|&l| l == 0));
        // Centers are real samples and the matrix matches the new size.
        assert_eq!(state.centers.len(), 2);
        for c in &state.centers {
            assert!(data.contains(c));
        }
        assert_eq!(state.dip_matrix.len(), 2);
    }

    #[test]
    fn test_merge_center_is_size_weighted() {
        let (data, embedded, mut state) = three_cluster_state();
        // Clusters 0 and 1 have equal size 20; the merged target is the
        // midpoint of their embedded centers, snapped to the nearest sample.
        let mid = (state.embedded_centers[0][0] + state.embedded_centers[1][0]) / 2.0;
        merge_clusters(&mut state, &data, &embedded, (0, 1), 2.0, &TableDipTest).unwrap();
        let snapped = state.embedded_centers[1][0];
        let best: f32 = embedded
            .iter()
            .map(|e| (e[0] - mid).abs())
            .fold(f32::INFINITY, f32::min);
        assert!((snapped - mid).abs() <= best + 1e-6);
    }

    #[test]
    fn test_dissolve_reassigns_members() {
        let (data, embedded, mut state) = three_cluster_state();
        // Make cluster 1 the dissolved one: its points sit nearer cluster 0
        // than cluster 2.
        dissolve_cluster(&mut state, &data, &embedded, 1, 2.0, &TableDipTest).unwrap();
        assert_eq!(state.n_clusters, 2);
        assert!(contiguous(&state.labels, 2));
        // Former cluster-1 members joined cluster 0; cluster 2 became 1.
        assert!(state.labels[20..40].iter().all(|&l| l == 0));
        assert!(state.labels[40..].iter().all(|&l| l == 1));
        for c in &state.centers {
            assert!(data.contains(c));
        }
        assert_eq!(state.dip_matrix.len(), 2);
    }

    #[test]
    fn test_dip_argmax_row_major_first() {
        let m = vec![
            vec![0.0, 0.3, 0.7],
            vec![0.3, 0.0, 0.7],
            vec![0.7, 0.7, 0.0],
        ];
        assert_eq!(dip_argmax(&m), (0, 2));
        assert_eq!(dip_argmax(&[vec![0.0]]), (0, 0));
    }
}
