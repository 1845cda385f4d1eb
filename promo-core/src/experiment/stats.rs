//! Confidence and posterior simulation over experiment variants.
//!
//! Everything here is pure. The only non-determinism is the RNG handed to
//! [`posterior_samples_top_vs_baseline`], which callers seed themselves.

use rand::Rng;
use rand_distr::{Beta, Distribution};

use super::models::{Variant, VariantMetrics};

/// Index of the variant with the highest conversion rate (first on ties).
pub fn top_by_rate(variants: &[Variant]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (idx, variant) in variants.iter().enumerate() {
        let rate = variant.metrics.conversion_rate();
        match best {
            Some((_, best_rate)) if rate <= best_rate => {}
            _ => best = Some((idx, rate)),
        }
    }
    best.map(|(idx, _)| idx)
}

/// Confidence in [0, 100] that the top variant by conversion rate beats the
/// pooled remainder.
///
/// One-sided two-proportion z-test, `Φ(z) * 100`. Returns 0 when there is
/// nothing to compare: fewer than two variants, a variant without views, or
/// a degenerate pooled variance.
pub fn confidence_for_variants(variants: &[Variant]) -> f64 {
    if variants.len() < 2 || variants.iter().any(|variant| variant.metrics.views == 0) {
        return 0.0;
    }
    let Some(top) = top_by_rate(variants) else {
        return 0.0;
    };

    let top_metrics = &variants[top].metrics;
    let top_views = top_metrics.views as f64;
    let top_successes = successes(top_metrics);

    let (rest_successes, rest_views) = variants
        .iter()
        .enumerate()
        .filter(|(idx, _)| *idx != top)
        .fold((0.0, 0.0), |(conv, views), (_, variant)| {
            (
                conv + successes(&variant.metrics),
                views + variant.metrics.views as f64,
            )
        });

    let top_rate = top_successes / top_views;
    let rest_rate = rest_successes / rest_views;
    let pooled = (top_successes + rest_successes) / (top_views + rest_views);
    let se = (pooled * (1.0 - pooled) * (1.0 / top_views + 1.0 / rest_views)).sqrt();
    if !se.is_finite() || se <= 0.0 {
        return 0.0;
    }

    let z = (top_rate - rest_rate) / se;
    (standard_normal_cdf(z) * 100.0).clamp(0.0, 100.0)
}

/// Draws `n` samples of `top - mean(others)` conversion rate.
///
/// Each variant's rate is drawn from `Beta(1 + conversions, 1 + misses)`.
/// Empty when fewer than two variants exist or no variant has views.
pub fn posterior_samples_top_vs_baseline<R>(variants: &[Variant], n: usize, rng: &mut R) -> Vec<f64>
where
    R: Rng + ?Sized,
{
    if variants.len() < 2 || variants.iter().all(|variant| variant.metrics.views == 0) {
        return Vec::new();
    }
    let Some(top) = top_by_rate(variants) else {
        return Vec::new();
    };

    let posteriors: Option<Vec<Beta<f64>>> = variants
        .iter()
        .map(|variant| {
            let hits = successes(&variant.metrics);
            let misses = variant.metrics.views as f64 - hits;
            Beta::new(1.0 + hits, 1.0 + misses).ok()
        })
        .collect();
    let Some(posteriors) = posteriors else {
        return Vec::new();
    };

    let others = (posteriors.len() - 1) as f64;
    (0..n)
        .map(|_| {
            let mut top_draw = 0.0;
            let mut rest_total = 0.0;
            for (idx, posterior) in posteriors.iter().enumerate() {
                let draw = posterior.sample(&mut *rng);
                if idx == top {
                    top_draw = draw;
                } else {
                    rest_total += draw;
                }
            }
            top_draw - rest_total / others
        })
        .collect()
}

/// Nearest-rank percentile over an ascending slice; `p` in [0, 1].
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let last = sorted.len() - 1;
    let idx = (last as f64 * p.clamp(0.0, 1.0)).floor() as usize;
    sorted[idx.min(last)]
}

pub fn sort_samples(samples: &mut [f64]) {
    samples.sort_by(|a, b| a.total_cmp(b));
}

fn successes(metrics: &VariantMetrics) -> f64 {
    metrics.conversions.min(metrics.views) as f64
}

fn standard_normal_cdf(z: f64) -> f64 {
    if z < 0.0 {
        return 1.0 - standard_normal_cdf(-z);
    }
    // Abramowitz-Stegun 26.2.17.
    let t = 1.0 / (1.0 + 0.231_641_9 * z);
    let d = 0.398_942_3 * (-0.5 * z * z).exp();
    let tail = d
        * t
        * (0.319_381_5
            + t * (-0.356_563_8 + t * (1.781_478 + t * (-1.821_256 + t * 1.330_274))));
    1.0 - tail
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn variant(id: &str, views: u64, conversions: u64) -> Variant {
        Variant::new(id, VariantMetrics::new(views, 0, conversions, 0.0))
    }

    #[test]
    fn top_by_rate_prefers_first_on_ties() {
        let variants = vec![variant("a", 100, 5), variant("b", 200, 10), variant("c", 10, 0)];
        assert_eq!(top_by_rate(&variants), Some(0));
        assert_eq!(top_by_rate(&[]), None);
    }

    #[test]
    fn confidence_is_zero_without_comparable_data() {
        assert_eq!(confidence_for_variants(&[]), 0.0);
        assert_eq!(confidence_for_variants(&[variant("a", 100, 10)]), 0.0);
        assert_eq!(
            confidence_for_variants(&[variant("a", 100, 10), variant("b", 0, 0)]),
            0.0
        );
        assert_eq!(
            confidence_for_variants(&[variant("a", 100, 0), variant("b", 100, 0)]),
            0.0
        );
    }

    #[test]
    fn equal_rates_are_a_coin_flip() {
        let confidence = confidence_for_variants(&[variant("a", 1000, 50), variant("b", 1000, 50)]);
        assert!((confidence - 50.0).abs() < 0.01, "got {confidence}");
    }

    #[test]
    fn confidence_grows_with_gap() {
        let small = confidence_for_variants(&[variant("a", 1000, 55), variant("b", 1000, 50)]);
        let large = confidence_for_variants(&[variant("a", 1000, 80), variant("b", 1000, 50)]);
        assert!(large > small);
        assert!(large > 99.0);
        assert!(large <= 100.0);
    }

    #[test]
    fn confidence_grows_with_sample_size() {
        let few = confidence_for_variants(&[variant("a", 200, 12), variant("b", 200, 8)]);
        let many = confidence_for_variants(&[variant("a", 20_000, 1_200), variant("b", 20_000, 800)]);
        assert!(many > few);
    }

    #[test]
    fn reference_scenario_is_confident() {
        let confidence = confidence_for_variants(&[variant("a", 1200, 50), variant("b", 300, 5)]);
        assert!(confidence >= 50.0);
        assert!(confidence > 95.0, "got {confidence}");
    }

    #[test]
    fn posterior_samples_have_requested_length() {
        let variants = vec![variant("a", 1200, 50), variant("b", 300, 5)];
        let mut rng = ChaCha20Rng::seed_from_u64(42);
        let mut samples = posterior_samples_top_vs_baseline(&variants, 400, &mut rng);
        assert_eq!(samples.len(), 400);

        sort_samples(&mut samples);
        let p50 = percentile(&samples, 0.5);
        let p95 = percentile(&samples, 0.95);
        assert!(p50 <= p95);
        assert!(p50 > 0.0, "top variant should lead, got p50={p50}");
    }

    #[test]
    fn posterior_samples_are_reproducible_with_same_seed() {
        let variants = vec![variant("a", 500, 40), variant("b", 500, 30), variant("c", 400, 20)];
        let first = posterior_samples_top_vs_baseline(
            &variants,
            64,
            &mut ChaCha20Rng::seed_from_u64(7),
        );
        let second = posterior_samples_top_vs_baseline(
            &variants,
            64,
            &mut ChaCha20Rng::seed_from_u64(7),
        );
        assert_eq!(first, second);
    }

    #[test]
    fn posterior_samples_empty_without_data() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        assert!(posterior_samples_top_vs_baseline(&[variant("a", 10, 1)], 400, &mut rng).is_empty());
        assert!(posterior_samples_top_vs_baseline(
            &[variant("a", 0, 0), variant("b", 0, 0)],
            400,
            &mut rng
        )
        .is_empty());
    }

    #[test]
    fn percentile_uses_nearest_rank() {
        let sorted = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&sorted, 0.5), 3.0);
        assert_eq!(percentile(&sorted, 0.95), 4.0);
        assert_eq!(percentile(&sorted, 1.0), 5.0);
        assert_eq!(percentile(&[], 0.5), 0.0);
    }
}
