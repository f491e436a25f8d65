use crate::error::{Result, RiskError};
use statrs::distribution::{Beta, ContinuousCDF};

/// Weight sums within this distance of 1 are treated as complete.
const SPARSE_TOLERANCE: f64 = 1e-9;

/// Appends a zero-valued sample carrying the probability mass the weights
/// leave unaccounted for (`1 - sum(weights)`).
pub fn add_missing_zeroes(values: &[f64], weights: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let zero_weight = 1.0 - weights.iter().sum::<f64>();
    let mut v = values.to_vec();
    let mut w = weights.to_vec();
    v.push(0.0);
    w.push(zero_weight);
    (v, w)
}

/// Weighted percentile, C = 0 variant.
///
/// Samples are sorted by value, their weights accumulated, and every requested
/// quantile is linearly interpolated on the cumulative-weight axis. Quantiles
/// below the first or above the last cumulative weight clamp to the smallest
/// or largest value.
///
/// Weights summing to less than 1 describe sparse data: the missing mass is
/// assumed to be zero loss and is added as an explicit zero sample first.
pub fn weighted_quantile(values: &[f64], quantiles: &[f64], weights: &[f64]) -> Result<Vec<f64>> {
    validate(values, quantiles, weights)?;
    let (sorted_values, sorted_weights) = prepare(values, weights);

    let mut cumulative = Vec::with_capacity(sorted_weights.len());
    let mut running = 0.0;
    for w in &sorted_weights {
        running += w;
        cumulative.push(running);
    }

    Ok(quantiles
        .iter()
        .map(|q| interp(*q, &cumulative, &sorted_values))
        .collect())
}

/// Harrell-Davis estimator with a Beta kernel sized by the effective sample
/// size `(sum w)^2 / sum(w^2)`.
pub fn weighted_harrell_davis_quantile(
    values: &[f64],
    quantiles: &[f64],
    weights: &[f64],
) -> Result<Vec<f64>> {
    kernel_quantile(values, quantiles, weights, Kernel::harrell_davis)
}

/// Hyndman-Fan type 7 adapted to weighted samples.
pub fn type7_quantile(values: &[f64], quantiles: &[f64], weights: &[f64]) -> Result<Vec<f64>> {
    kernel_quantile(values, quantiles, weights, |n, p| Ok(Kernel::type7(n, p)))
}

/// `sum(v * w) / sum(w)` after the same sparse zero-padding as the quantiles.
pub fn weighted_mean(values: &[f64], weights: &[f64]) -> Result<f64> {
    validate(values, &[], weights)?;
    let (values, weights) = pad_sparse(values, weights);
    let total: f64 = weights.iter().sum();
    let weighted: f64 = values.iter().zip(&weights).map(|(v, w)| v * w).sum();
    Ok(weighted / total)
}

fn validate(values: &[f64], quantiles: &[f64], weights: &[f64]) -> Result<()> {
    if values.len() != weights.len() {
        return Err(RiskError::InvalidArgument(format!(
            "values and weights differ in length ({} != {})",
            values.len(),
            weights.len()
        )));
    }
    if let Some(q) = quantiles
        .iter()
        .find(|q| !q.is_finite() || **q < 0.0 || **q > 1.0)
    {
        return Err(RiskError::InvalidArgument(format!(
            "quantiles should be in [0, 1], got {q}"
        )));
    }
    if let Some(w) = weights.iter().find(|w| !w.is_finite() || **w < 0.0) {
        return Err(RiskError::InvalidArgument(format!(
            "weights must be finite and non-negative, got {w}"
        )));
    }
    if let Some(v) = values.iter().find(|v| !v.is_finite()) {
        return Err(RiskError::InvalidArgument(format!(
            "values must be finite, got {v}"
        )));
    }
    Ok(())
}

fn pad_sparse(values: &[f64], weights: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let total: f64 = weights.iter().sum();
    if total < 1.0 - SPARSE_TOLERANCE {
        add_missing_zeroes(values, weights)
    } else {
        (values.to_vec(), weights.to_vec())
    }
}

/// Pads sparse input and sorts both slices by value (stable).
fn prepare(values: &[f64], weights: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let (values, weights) = pad_sparse(values, weights);
    let mut pairs: Vec<(f64, f64)> = values.into_iter().zip(weights).collect();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
    pairs.into_iter().unzip()
}

/// Piecewise-linear interpolation with endpoint clamping; `xp` must be
/// non-decreasing.
fn interp(x: f64, xp: &[f64], fp: &[f64]) -> f64 {
    let last = xp.len() - 1;
    if x <= xp[0] {
        return fp[0];
    }
    if x >= xp[last] {
        return fp[last];
    }
    let j = xp.partition_point(|v| *v <= x) - 1;
    let (x0, x1) = (xp[j], xp[j + 1]);
    let t = (x - x0) / (x1 - x0);
    fp[j] + t * (fp[j + 1] - fp[j])
}

enum Kernel {
    Beta(Beta),
    /// All mass at 0; the limit of the Beta kernel for p = 0.
    StepAtZero,
    /// All mass at 1; the limit of the Beta kernel for p = 1.
    StepAtOne,
    Type7 { n: f64, h: f64 },
}

impl Kernel {
    fn harrell_davis(n: f64, p: f64) -> Result<Self> {
        if p <= 0.0 {
            return Ok(Kernel::StepAtZero);
        }
        if p >= 1.0 {
            return Ok(Kernel::StepAtOne);
        }
        let a = (n + 1.0) * p;
        let b = (n + 1.0) * (1.0 - p);
        Beta::new(a, b).map(Kernel::Beta).map_err(|err| {
            RiskError::InvalidArgument(format!("no beta kernel for n={n}, p={p}: {err}"))
        })
    }

    fn type7(n: f64, p: f64) -> Self {
        Kernel::Type7 {
            n,
            h: p * (n - 1.0) + 1.0,
        }
    }

    fn cdf(&self, x: f64) -> f64 {
        match self {
            Kernel::Beta(beta) => beta.cdf(x),
            Kernel::StepAtZero => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Kernel::StepAtOne => {
                if x >= 1.0 - SPARSE_TOLERANCE {
                    1.0
                } else {
                    0.0
                }
            }
            Kernel::Type7 { n, h } => {
                let u = ((h - 1.0) / n).max((h / n).min(x));
                u * n - h + 1.0
            }
        }
    }
}

fn kernel_quantile<F>(
    values: &[f64],
    quantiles: &[f64],
    weights: &[f64],
    kernel_for: F,
) -> Result<Vec<f64>>
where
    F: Fn(f64, f64) -> Result<Kernel>,
{
    validate(values, quantiles, weights)?;
    let (sorted_values, sorted_weights) = prepare(values, weights);

    let total: f64 = sorted_weights.iter().sum();
    let total_sq: f64 = sorted_weights.iter().map(|w| w * w).sum();
    let effective_n = total * total / total_sq;

    // cdf_probs[0] = 0, cdf_probs[i + 1] = normalised cumulative weight of samples 0..=i
    let mut cdf_probs = Vec::with_capacity(sorted_weights.len() + 1);
    cdf_probs.push(0.0);
    let mut running = 0.0;
    for w in &sorted_weights {
        running += w / total;
        cdf_probs.push(running.min(1.0));
    }
    if let Some(last) = cdf_probs.last_mut() {
        *last = 1.0;
    }

    quantiles
        .iter()
        .map(|p| {
            let kernel = kernel_for(effective_n, *p)?;
            let mut estimate = 0.0;
            let mut lower = kernel.cdf(cdf_probs[0]);
            for (i, value) in sorted_values.iter().enumerate() {
                let upper = kernel.cdf(cdf_probs[i + 1]);
                estimate += (upper - lower) * value;
                lower = upper;
            }
            Ok(estimate)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-6,
            "expected {expected}, got {actual}"
        );
    }

    fn assert_non_decreasing(values: &[f64]) {
        for pair in values.windows(2) {
            assert!(pair[0] <= pair[1] + EPS, "not monotonic: {values:?}");
        }
    }

    #[test]
    fn add_missing_zeroes_pads_remaining_mass() {
        let (v, w) = add_missing_zeroes(&[1.0, 2.0, 3.0], &[0.2, 0.3, 0.3]);
        assert_eq!(v, vec![1.0, 2.0, 3.0, 0.0]);
        assert_close(w[3], 0.2);
    }

    #[test]
    fn weighted_quantile_min_median_max() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        let weights = [0.2; 5];
        let result = weighted_quantile(&values, &[0.0, 0.5, 1.0], &weights).unwrap();
        assert_eq!(result[0], 1.0);
        assert_close(result[1], 2.5);
        assert_eq!(result[2], 5.0);
    }

    #[test]
    fn weighted_quantile_follows_heavy_weight() {
        let result = weighted_quantile(&[1.0, 2.0, 3.0], &[0.5], &[0.1, 0.8, 0.1]).unwrap();
        assert!((1.0..=2.0).contains(&result[0]));
    }

    #[test]
    fn sparse_padding_matches_explicit_zero_sample() {
        let values = [10.0, 20.0, 35.0];
        let weights = [0.3, 0.2, 0.1];
        let quantiles = [0.1, 0.25, 0.5, 0.75, 0.9];
        let padded_values = [10.0, 20.0, 35.0, 0.0];
        let padded_weights = [0.3, 0.2, 0.1, 0.4];

        let implicit = weighted_quantile(&values, &quantiles, &weights).unwrap();
        let explicit = weighted_quantile(&padded_values, &quantiles, &padded_weights).unwrap();
        for (a, b) in implicit.iter().zip(&explicit) {
            assert_close(*a, *b);
        }

        let implicit = weighted_harrell_davis_quantile(&values, &quantiles, &weights).unwrap();
        let explicit =
            weighted_harrell_davis_quantile(&padded_values, &quantiles, &padded_weights).unwrap();
        for (a, b) in implicit.iter().zip(&explicit) {
            assert_close(*a, *b);
        }

        let implicit = type7_quantile(&values, &quantiles, &weights).unwrap();
        let explicit = type7_quantile(&padded_values, &quantiles, &padded_weights).unwrap();
        for (a, b) in implicit.iter().zip(&explicit) {
            assert_close(*a, *b);
        }
    }

    #[test]
    fn sparse_data_lowers_the_median() {
        let result = weighted_quantile(&[10.0, 20.0], &[0.5], &[0.3, 0.2]).unwrap();
        // half the mass sits at zero
        assert!(result[0] < 10.0);
    }

    #[test]
    fn single_sample_returns_value_for_every_quantile() {
        let quantiles = [0.0, 0.1, 0.5, 0.9, 1.0];
        for result in [
            weighted_quantile(&[42.0], &quantiles, &[1.0]).unwrap(),
            weighted_harrell_davis_quantile(&[42.0], &quantiles, &[1.0]).unwrap(),
            type7_quantile(&[42.0], &quantiles, &[1.0]).unwrap(),
        ] {
            for value in result {
                assert_eq!(value, 42.0);
            }
        }
    }

    #[test]
    fn quantile_functions_are_monotonic() {
        let values = [5.0, 1.0, 4.0, 2.0, 3.0, 10.0];
        let weights = [0.1, 0.25, 0.15, 0.2, 0.2, 0.1];
        let quantiles = [0.0, 0.05, 0.1, 0.25, 0.5, 0.75, 0.9, 0.95, 1.0];

        assert_non_decreasing(&weighted_quantile(&values, &quantiles, &weights).unwrap());
        assert_non_decreasing(
            &weighted_harrell_davis_quantile(&values, &quantiles, &weights).unwrap(),
        );
        assert_non_decreasing(&type7_quantile(&values, &quantiles, &weights).unwrap());
    }

    #[test]
    fn kernel_estimators_stay_within_sample_range() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        let weights = [0.2; 5];
        let hd = weighted_harrell_davis_quantile(&values, &[0.25, 0.5, 0.75], &weights).unwrap();
        let t7 = type7_quantile(&values, &[0.0, 0.5, 1.0], &weights).unwrap();
        for value in hd.iter().chain(&t7) {
            assert!((1.0 - EPS..=5.0 + EPS).contains(value), "{value}");
        }
        assert_close(hd[1], 3.0);
        assert_close(t7[0], 1.0);
        assert_close(t7[2], 5.0);
    }

    #[test]
    fn type7_median_leans_to_heavy_sample() {
        let result = type7_quantile(&[10.0, 20.0, 30.0], &[0.5], &[0.5, 0.3, 0.2]).unwrap();
        assert!(result[0] < 25.0);
    }

    #[test]
    fn out_of_range_quantile_is_rejected() {
        let values = [1.0, 2.0, 3.0];
        let weights = [0.3, 0.3, 0.4];
        assert!(matches!(
            weighted_quantile(&values, &[-0.1], &weights),
            Err(RiskError::InvalidArgument(_))
        ));
        assert!(matches!(
            weighted_harrell_davis_quantile(&values, &[1.1], &weights),
            Err(RiskError::InvalidArgument(_))
        ));
        assert!(matches!(
            type7_quantile(&values, &[f64::NAN], &weights),
            Err(RiskError::InvalidArgument(_))
        ));
    }

    #[test]
    fn mismatched_lengths_and_negative_weights_are_rejected() {
        assert!(weighted_quantile(&[1.0, 2.0], &[0.5], &[1.0]).is_err());
        assert!(weighted_mean(&[1.0, 2.0], &[0.5, -0.1]).is_err());
    }

    #[test]
    fn weighted_mean_pads_sparse_data() {
        assert_close(weighted_mean(&[100.0, 200.0], &[0.25, 0.25]).unwrap(), 75.0);
        assert_close(weighted_mean(&[100.0, 200.0], &[0.5, 0.5]).unwrap(), 150.0);
        // weights above one are normalised, not padded
        assert_close(weighted_mean(&[100.0, 200.0], &[1.0, 1.0]).unwrap(), 150.0);
        assert_eq!(weighted_mean(&[], &[]).unwrap(), 0.0);
    }

    #[test]
    fn empty_input_is_all_zero_loss() {
        let result = weighted_quantile(&[], &[0.1, 0.9], &[]).unwrap();
        assert_eq!(result, vec![0.0, 0.0]);
    }
}
