//! Hartigan's dip test of unimodality.
//!
//! The dip statistic (Hartigan & Hartigan, 1985) measures how far a 1-D
//! sample's empirical distribution function is from the nearest unimodal
//! distribution function. It is near its minimum `1/(2n)` for unimodal data
//! and approaches its maximum `0.25` for a balanced two-spike mixture.
//!
//! # Algorithm Outline
//!
//! 1. Sort the sample. Work on the empirical CDF in step-count units, where
//!    the greatest convex minorant (GCM) fits the lower step corners and the
//!    least concave majorant (LCM) fits the upper ones.
//!
//! 2. On the current interval, compute the GCM and LCM touchpoints and scan
//!    both piecewise-linear envelopes for their largest vertical gap.
//!
//! 3. If the gap no longer exceeds the best value found so far, stop.
//!    Otherwise record the ECDF's deviation from the GCM below the gap and
//!    from the LCM above it, shrink the interval to the modal candidate
//!    delimited by the gap, and repeat.
//!
//! 4. The dip is half the final gap, converted from counts to probability.
//!
//! P-values come from a quantile table of the dip under the uniform null
//! (the asymptotically least favorable unimodal distribution), scaled by
//! `sqrt(n)` and linearly interpolated between tabulated quantiles.
//!
//! # References
//!
//! Hartigan, J. A., Hartigan, P. M. (1985). "The Dip Test of Unimodality."
//! The Annals of Statistics 13(1).

use crate::error::{Error, Result};

/// Unimodality test consumed by the merge machinery.
///
/// The clustering core only ever calls these two methods; any statistic with
/// "near zero means unimodal" semantics and a matching p-value can be
/// substituted (tests use scripted implementations).
pub trait UnimodalityTest {
    /// Dip statistic of a 1-D sample. The sample does not need to be sorted.
    fn dip(&self, sample: &[f32]) -> f64;

    /// Probability that a unimodal sample of size `n` produces a dip at
    /// least this large. Always in `[0, 1]`.
    fn p_value(&self, dip: f64, n: usize) -> Result<f64>;
}

/// Table-based dip test: Hartigan's statistic plus interpolated null
/// quantiles of the uniform distribution.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableDipTest;

impl UnimodalityTest for TableDipTest {
    fn dip(&self, sample: &[f32]) -> f64 {
        let mut xs: Vec<f64> = sample.iter().map(|&v| f64::from(v)).collect();
        xs.sort_by(f64::total_cmp);
        dip_statistic_sorted(&xs)
    }

    fn p_value(&self, dip: f64, n: usize) -> Result<f64> {
        table_p_value(dip, n)
    }
}

/// Quantiles of `sqrt(n) * dip` under the uniform null, `(probability,
/// critical value)`. Intermediate probabilities are linearly interpolated;
/// values below the first entry map to p-value 1 and values above the last
/// to p-value 0.
const NULL_QUANTILES: &[(f64, f64)] = &[
    (0.01, 0.171),
    (0.02, 0.176),
    (0.05, 0.183),
    (0.10, 0.190),
    (0.20, 0.199),
    (0.30, 0.206),
    (0.40, 0.213),
    (0.50, 0.219),
    (0.60, 0.226),
    (0.70, 0.235),
    (0.80, 0.246),
    (0.90, 0.261),
    (0.95, 0.275),
    (0.98, 0.292),
    (0.99, 0.304),
    (0.995, 0.315),
    (0.999, 0.339),
];

/// P-value of an observed dip for sample size `n` via the null quantile
/// table. Sample sizes below 4 are outside the table and error.
pub fn table_p_value(dip: f64, n: usize) -> Result<f64> {
    if n < 4 {
        return Err(Error::PValueTable { n });
    }
    // The smallest attainable dip. At or below it the observed value carries
    // no evidence against unimodality at all.
    if dip <= 0.5 / n as f64 {
        return Ok(1.0);
    }
    let t = dip * (n as f64).sqrt();
    // Below the lowest tabulated quantile the null CDF is effectively zero.
    if t <= NULL_QUANTILES[0].1 {
        return Ok(1.0);
    }
    let (_, last_q) = NULL_QUANTILES[NULL_QUANTILES.len() - 1];
    if t >= last_q {
        return Ok(0.0);
    }
    for w in NULL_QUANTILES.windows(2) {
        let (p0, q0) = w[0];
        let (p1, q1) = w[1];
        if t <= q1 {
            let frac = (t - q0) / (q1 - q0);
            let cdf = p0 + frac * (p1 - p0);
            return Ok((1.0 - cdf).clamp(0.0, 1.0));
        }
    }
    Ok(0.0)
}

/// Dip statistic of an already sorted sample.
///
/// Runs the GCM/LCM interval-shrinking iteration in ECDF count units and
/// returns the dip in probability units (`gap / 2n`).
pub fn dip_statistic_sorted(x: &[f64]) -> f64 {
    let n = x.len();
    if n < 2 || x[n - 1] == x[0] {
        return 0.0;
    }
    debug_assert!(x.windows(2).all(|w| w[0] <= w[1]));

    let mut low = 0usize;
    let mut high = n - 1;
    // Best gap so far, in count units. One step is the floor: even a
    // perfectly uniform sample separates the two envelope fits by one step.
    let mut best = 1.0f64;

    // mn[j]: previous GCM touchpoint below j; mj[k]: next LCM touchpoint
    // above k. Recomputed for each interval.
    let mut mn = vec![0usize; n];
    let mut mj = vec![0usize; n];

    loop {
        // GCM touchpoints of the points (x[j], j) over [low, high].
        mn[low] = low;
        for j in low + 1..=high {
            mn[j] = j - 1;
            loop {
                let mnj = mn[j];
                if mnj == low {
                    break;
                }
                let mnmnj = mn[mnj];
                // Keep mnj while the slope into it stays below the slope
                // out of it (a strict convex corner).
                if (x[j] - x[mnj]) * ((mnj - mnmnj) as f64)
                    < (x[mnj] - x[mnmnj]) * (j - mnj) as f64
                {
                    break;
                }
                mn[j] = mnmnj;
            }
        }

        // LCM touchpoints of the points (x[k], k + 1) over [low, high].
        mj[high] = high;
        for k in (low..high).rev() {
            mj[k] = k + 1;
            loop {
                let mjk = mj[k];
                if mjk == high {
                    break;
                }
                let mjmjk = mj[mjk];
                // Concave corner: slope into mjk strictly above slope out.
                if (mjk - k) as f64 * (x[mjmjk] - x[mjk])
                    > (mjmjk - mjk) as f64 * (x[mjk] - x[k])
                {
                    break;
                }
                mj[k] = mjmjk;
            }
        }

        // Ascending touchpoint sequences.
        let mut gcm = vec![high];
        while *gcm.last().unwrap_or(&low) != low {
            let last = *gcm.last().unwrap_or(&low);
            gcm.push(mn[last]);
        }
        gcm.reverse();
        let mut lcm = vec![low];
        while *lcm.last().unwrap_or(&high) != high {
            let last = *lcm.last().unwrap_or(&high);
            lcm.push(mj[last]);
        }

        // Largest vertical gap between the envelopes, tracked with the
        // candidate modal interval that contains it.
        let mut d = 0.0f64;
        let mut new_low = low;
        let mut new_high = high;
        if gcm.len() == 2 && lcm.len() == 2 {
            // Both envelopes are straight lines: one-step gap everywhere.
            d = 1.0;
        } else {
            let mut ix = 1usize;
            let mut iv = 1usize;
            loop {
                let gx = gcm[ix];
                let lv = lcm[iv];
                if gx > lv {
                    // Gap at the LCM touchpoint against the GCM segment.
                    let jb = gcm[ix - 1];
                    let je = gx;
                    let interp = if x[je] > x[jb] {
                        jb as f64 + (x[lv] - x[jb]) * (je - jb) as f64 / (x[je] - x[jb])
                    } else {
                        je as f64
                    };
                    let dx = (lv + 1) as f64 - interp;
                    iv += 1;
                    if dx >= d {
                        d = dx;
                        new_low = jb;
                        new_high = lv;
                    }
                } else {
                    // Gap at the GCM touchpoint against the LCM segment.
                    let kb = lcm[iv - 1];
                    let ke = lv;
                    let interp = if x[ke] > x[kb] {
                        (kb + 1) as f64 + (x[gx] - x[kb]) * (ke - kb) as f64 / (x[ke] - x[kb])
                    } else {
                        (ke + 1) as f64
                    };
                    let dx = interp - gx as f64;
                    ix += 1;
                    if dx > d {
                        d = dx;
                        new_low = gx;
                        new_high = ke;
                    }
                }
                if ix >= gcm.len() {
                    ix = gcm.len() - 1;
                }
                if iv >= lcm.len() {
                    iv = lcm.len() - 1;
                }
                if gcm[ix] == lcm[iv] {
                    break;
                }
            }
        }

        if d <= best || (new_low == low && new_high == high) {
            break;
        }

        // Deviation of the ECDF above the GCM on [low, new_low].
        let mut dl = 0.0f64;
        for w in gcm.windows(2) {
            let (jb, je) = (w[0], w[1]);
            if je > new_low {
                break;
            }
            if je - jb > 1 && x[je] > x[jb] {
                let c = (je - jb) as f64 / (x[je] - x[jb]);
                let mut seg = 1.0f64;
                for jr in jb..=je {
                    let t = (jr - jb + 1) as f64 - (x[jr] - x[jb]) * c;
                    if t > seg {
                        seg = t;
                    }
                }
                if seg > dl {
                    dl = seg;
                }
            }
        }

        // Deviation of the ECDF below the LCM on [new_high, high].
        let mut du = 0.0f64;
        for w in lcm.windows(2) {
            let (kb, ke) = (w[0], w[1]);
            if kb < new_high {
                continue;
            }
            if ke - kb > 1 && x[ke] > x[kb] {
                let c = (ke - kb) as f64 / (x[ke] - x[kb]);
                let mut seg = 1.0f64;
                for kr in kb..=ke {
                    let t = (x[kr] - x[kb]) * c - (kr as f64 - kb as f64 - 1.0);
                    if t > seg {
                        seg = t;
                    }
                }
                if seg > du {
                    du = seg;
                }
            }
        }

        best = best.max(dl).max(du);
        low = new_low;
        high = new_high;
        if low >= high || x[high] == x[low] {
            break;
        }
    }

    best / (2.0 * n as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dip_of(sample: &[f32]) -> f64 {
        TableDipTest.dip(sample)
    }

    #[test]
    fn test_dip_two_spikes_is_maximal() {
        // Balanced mixture of two point masses: the classic worst case.
        let mut sample = vec![0.0f32; 50];
        sample.extend(vec![1.0f32; 50]);
        let d = dip_of(&sample);
        assert!((d - 0.25).abs() < 1e-9, "dip = {d}");
    }

    #[test]
    fn test_dip_evenly_spaced_is_minimal() {
        let n = 100;
        let sample: Vec<f32> = (0..n).map(|i| i as f32).collect();
        let d = dip_of(&sample);
        assert!((d - 0.5 / n as f64).abs() < 1e-9, "dip = {d}");
    }

    #[test]
    fn test_dip_degenerate_samples() {
        assert_eq!(dip_of(&[]), 0.0);
        assert_eq!(dip_of(&[1.0]), 0.0);
        assert_eq!(dip_of(&[2.0, 2.0, 2.0]), 0.0);
        // n = 2 attains the upper bound by construction.
        assert!((dip_of(&[0.0, 1.0]) - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_dip_unsorted_input() {
        let sorted: Vec<f32> = (0..50).map(|i| (i as f32).sin() + i as f32 * 0.1).collect();
        let mut shuffled = sorted.clone();
        shuffled.reverse();
        assert_eq!(dip_of(&sorted), dip_of(&shuffled));
    }

    #[test]
    fn test_dip_bimodal_exceeds_unimodal() {
        // Two tight groups vs. one smooth ramp of the same size.
        let mut bimodal: Vec<f32> = (0..40).map(|i| i as f32 * 0.01).collect();
        bimodal.extend((0..40).map(|i| 10.0 + i as f32 * 0.01));
        let unimodal: Vec<f32> = (0..80).map(|i| i as f32 * 0.01).collect();
        assert!(dip_of(&bimodal) > 4.0 * dip_of(&unimodal));
    }

    #[test]
    fn test_dip_bounds() {
        let samples: Vec<Vec<f32>> = vec![
            (0..30).map(|i| (i * i) as f32).collect(),
            (0..75).map(|i| ((i * 37) % 100) as f32).collect(),
            vec![1.0, 1.0, 2.0, 5.0, 5.0, 5.0, 9.0],
        ];
        for s in &samples {
            let d = dip_of(s);
            let n = s.len() as f64;
            assert!(d >= 0.5 / n - 1e-12, "dip {d} below floor for n = {n}");
            assert!(d <= 0.25 + 1e-12, "dip {d} above 0.25");
        }
    }

    #[test]
    fn test_p_value_extremes() {
        // Minimal dip carries no evidence at all.
        assert_eq!(table_p_value(0.005, 100).unwrap(), 1.0);
        // A two-spike dip at this sample size is overwhelming evidence.
        assert_eq!(table_p_value(0.25, 200).unwrap(), 0.0);
    }

    #[test]
    fn test_p_value_monotone_in_dip() {
        let n = 150;
        let mut last = 1.0;
        for step in 0..50 {
            let dip = 0.005 + step as f64 * 0.004;
            let p = table_p_value(dip, n).unwrap();
            assert!(p <= last + 1e-12, "p-value increased at dip {dip}");
            assert!((0.0..=1.0).contains(&p));
            last = p;
        }
    }

    #[test]
    fn test_p_value_rejects_tiny_samples() {
        assert!(matches!(
            table_p_value(0.1, 3),
            Err(Error::PValueTable { n: 3 })
        ));
        assert!(table_p_value(0.1, 4).is_ok());
    }

    #[test]
    fn test_trait_object_usable() {
        let test: &dyn UnimodalityTest = &TableDipTest;
        let sample: Vec<f32> = (0..20).map(|i| i as f32).collect();
        let d = test.dip(&sample);
        let p = test.p_value(d, sample.len()).unwrap();
        assert!((0.0..=1.0).contains(&p));
    }
}
