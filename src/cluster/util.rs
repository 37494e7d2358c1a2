//! Small numeric helpers shared by the clustering algorithms.

#[inline]
pub(crate) fn squared_euclidean(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

#[inline]
pub(crate) fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    squared_euclidean(a, b).sqrt()
}

/// Index of the smallest value (first occurrence on ties).
///
/// Returns 0 for an empty iterator, which callers must rule out.
pub(crate) fn argmin<I>(values: I) -> usize
where
    I: IntoIterator<Item = f32>,
{
    let mut best = 0;
    let mut best_val = f32::INFINITY;
    for (i, v) in values.into_iter().enumerate() {
        if v < best_val {
            best_val = v;
            best = i;
        }
    }
    best
}

/// Index of the nearest row to `point` (squared Euclidean, first on ties).
pub(crate) fn nearest_row(rows: &[Vec<f32>], point: &[f32]) -> usize {
    argmin(rows.iter().map(|r| squared_euclidean(r, point)))
}
