//! Test statistics for the battery. Pure functions over samples.

use super::{TestKind, TestResult};
use serde_json::json;

/// Standard normal quantile at 0.95 (one-sided)
const Z_95_ONE_SIDED: f64 = 1.644_853_626_951_472;
/// Standard normal quantile at 0.975 (two-sided 95%)
pub const Z_95_TWO_SIDED: f64 = 1.96;

/// Chi-square critical value at 95% confidence (Wilson-Hilferty)
pub fn chi_square_critical_95(df: f64) -> f64 {
    if df <= 0.0 {
        return 0.0;
    }
    let a = 2.0 / (9.0 * df);
    df * (1.0 - a + Z_95_ONE_SIDED * a.sqrt()).powi(3)
}

/// Sum of (observed - expected)^2 / expected over equal-expectation buckets
pub fn chi_square(observed: &[u64], expected: f64) -> f64 {
    if expected <= 0.0 {
        return 0.0;
    }
    observed
        .iter()
        .map(|&o| {
            let d = o as f64 - expected;
            d * d / expected
        })
        .sum()
}

/// Chi-square uniformity over the inclusive range `[min, max]`
pub fn uniformity(samples: &[u64], min: u64, max: u64) -> TestResult {
    let buckets = (max - min + 1) as usize;
    let mut observed = vec![0u64; buckets];
    let mut out_of_range = 0usize;
    for &s in samples {
        if (min..=max).contains(&s) {
            observed[(s - min) as usize] += 1;
        } else {
            out_of_range += 1;
        }
    }

    let expected = samples.len() as f64 / buckets as f64;
    let statistic = chi_square(&observed, expected);
    let df = (max - min) as f64;
    let critical_value = chi_square_critical_95(df);

    TestResult {
        test: TestKind::Uniformity,
        statistic,
        critical_value,
        passed: out_of_range == 0 && !samples.is_empty() && statistic <= critical_value,
        sample_size: samples.len(),
        evidence: json!({
            "range": [min, max],
            "degrees_of_freedom": df,
            "expected_per_bucket": expected,
            "min_bucket": observed.iter().min(),
            "max_bucket": observed.iter().max(),
            "out_of_range": out_of_range,
        }),
    }
}

/// Number of up/down runs. Equal neighbours carry no direction and are skipped.
pub fn count_runs(samples: &[u64]) -> (usize, usize) {
    let directions: Vec<bool> = samples
        .windows(2)
        .filter(|w| w[0] != w[1])
        .map(|w| w[1] > w[0])
        .collect();
    if directions.is_empty() {
        return (0, 0);
    }
    let changes = directions.windows(2).filter(|d| d[0] != d[1]).count();
    (changes + 1, directions.len())
}

/// Runs up and down: z-score of the run count against its expectation
pub fn runs(samples: &[u64]) -> TestResult {
    let (run_count, steps) = count_runs(samples);
    let n = (steps + 1) as f64;
    let mean = (2.0 * n - 1.0) / 3.0;
    let variance = (16.0 * n - 29.0) / 90.0;

    let (z, passed) = if steps >= 2 && variance > 0.0 {
        let z = (run_count as f64 - mean) / variance.sqrt();
        (z, z.abs() <= Z_95_TWO_SIDED)
    } else {
        (0.0, false)
    };

    TestResult {
        test: TestKind::Runs,
        statistic: z,
        critical_value: Z_95_TWO_SIDED,
        passed,
        sample_size: samples.len(),
        evidence: json!({
            "runs": run_count,
            "directional_steps": steps,
            "equal_steps": samples.len().saturating_sub(1).saturating_sub(steps),
            "expected_runs": mean,
            "variance": variance,
        }),
    }
}

/// Per-block chi-square over digit frequencies, summed across blocks
pub fn block_frequency(digits: &[u64], block_size: usize) -> TestResult {
    let blocks: Vec<&[u64]> = if block_size == 0 {
        Vec::new()
    } else {
        digits.chunks_exact(block_size).collect()
    };
    let expected = block_size as f64 / 10.0;

    let mut statistic = 0.0;
    let mut worst_block = 0.0f64;
    let mut invalid = 0usize;
    for block in &blocks {
        let mut counts = [0u64; 10];
        for &d in block.iter() {
            match counts.get_mut(d as usize) {
                Some(c) => *c += 1,
                None => invalid += 1,
            }
        }
        let block_chi = chi_square(&counts, expected);
        worst_block = worst_block.max(block_chi);
        statistic += block_chi;
    }

    let df = (blocks.len() * 9) as f64;
    let critical_value = chi_square_critical_95(df);

    TestResult {
        test: TestKind::BlockFrequency,
        statistic,
        critical_value,
        passed: !blocks.is_empty() && invalid == 0 && statistic <= critical_value,
        sample_size: digits.len(),
        evidence: json!({
            "blocks": blocks.len(),
            "block_size": block_size,
            "degrees_of_freedom": df,
            "worst_block_statistic": worst_block,
            "invalid_digits": invalid,
        }),
    }
}

pub fn longest_run_of_ones(bits: &[u64]) -> usize {
    let mut longest = 0;
    let mut current = 0;
    for &b in bits {
        if b == 1 {
            current += 1;
            longest = longest.max(current);
        } else {
            current = 0;
        }
    }
    longest
}

/// Longest run of ones must fall within `[1, log2(N) + 2]`
pub fn longest_run(bits: &[u64]) -> TestResult {
    let longest = longest_run_of_ones(bits);
    let upper = if bits.is_empty() {
        0.0
    } else {
        (bits.len() as f64).log2() + 2.0
    };
    let ones = bits.iter().filter(|&&b| b == 1).count();

    TestResult {
        test: TestKind::LongestRun,
        statistic: longest as f64,
        critical_value: upper,
        passed: longest >= 1 && (longest as f64) <= upper,
        sample_size: bits.len(),
        evidence: json!({
            "longest_run": longest,
            "bounds": [1.0, upper],
            "ones": ones,
            "zeros": bits.len() - ones,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_critical_values_close_to_tables() {
        // Reference values from chi-square tables at p = 0.05.
        for (df, table) in [(9.0, 16.919), (19.0, 30.144), (99.0, 123.225), (450.0, 499.9)] {
            let approx = chi_square_critical_95(df);
            assert!((approx - table).abs() / table < 0.01, "df {}: {} vs {}", df, approx, table);
        }
        assert_eq!(chi_square_critical_95(0.0), 0.0);
    }

    #[test]
    fn test_chi_square_of_perfect_fit_is_zero() {
        assert_eq!(chi_square(&[10, 10, 10], 10.0), 0.0);
        assert!((chi_square(&[12, 8], 10.0) - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_uniformity_passes_flat_and_fails_skewed() {
        let flat: Vec<u64> = (0..1_000).map(|i| 1 + i % 10).collect();
        let result = uniformity(&flat, 1, 10);
        assert!(result.passed);
        assert_eq!(result.statistic, 0.0);

        let skewed: Vec<u64> = (0..1_000).map(|i| if i % 4 == 0 { 1 } else { 2 + i % 9 }).collect();
        assert!(!uniformity(&skewed, 1, 10).passed);

        assert!(!uniformity(&[1, 2, 99], 1, 10).passed);
    }

    #[test]
    fn test_count_runs_skips_equal_steps() {
        // up, up, down, (equal), up
        assert_eq!(count_runs(&[1, 2, 3, 1, 1, 4]), (3, 4));
        assert_eq!(count_runs(&[5, 5, 5]), (0, 0));
        assert_eq!(count_runs(&[1, 2]), (1, 1));
    }

    #[test]
    fn test_runs_rejects_monotone_and_alternating() {
        let monotone: Vec<u64> = (0..200).collect();
        assert!(!runs(&monotone).passed);

        let alternating: Vec<u64> = (0..200).map(|i| i % 2).collect();
        let result = runs(&alternating);
        assert!(!result.passed);
        assert!(result.statistic > Z_95_TWO_SIDED);
    }

    #[test]
    fn test_block_frequency() {
        let even: Vec<u64> = (0..500).map(|i| i % 10).collect();
        let result = block_frequency(&even, 50);
        assert!(result.passed);
        assert_eq!(result.evidence["blocks"], 10);
        assert_eq!(result.critical_value, chi_square_critical_95(90.0));

        let stuck = vec![3u64; 500];
        assert!(!block_frequency(&stuck, 50).passed);
        assert!(!block_frequency(&[], 50).passed);
    }

    #[test]
    fn test_longest_run_bounds() {
        assert_eq!(longest_run_of_ones(&[0, 1, 1, 0, 1, 1, 1, 0]), 3);

        let no_ones = vec![0u64; 64];
        assert!(!longest_run(&no_ones).passed);

        let all_ones = vec![1u64; 64];
        let result = longest_run(&all_ones);
        assert!(!result.passed);
        assert_eq!(result.critical_value, 8.0);

        let mixed: Vec<u64> = (0..64).map(|i| u64::from(i % 3 != 0)).collect();
        assert!(longest_run(&mixed).passed);
    }
}
