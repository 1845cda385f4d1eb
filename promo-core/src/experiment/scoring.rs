use super::models::{Variant, VariantMetrics};

pub const VIEWS_WEIGHT: f64 = 0.3;
pub const ENGAGEMENT_WEIGHT: f64 = 0.3;
pub const CONVERSIONS_WEIGHT: f64 = 0.2;
pub const REVENUE_WEIGHT: f64 = 0.2;

/// Weighted sum of raw counters. No normalization across variants, so
/// variants with more traffic dominate.
pub fn score(metrics: &VariantMetrics) -> f64 {
    VIEWS_WEIGHT * metrics.views as f64
        + ENGAGEMENT_WEIGHT * metrics.engagement as f64
        + CONVERSIONS_WEIGHT * metrics.conversions as f64
        + REVENUE_WEIGHT * metrics.revenue
}

/// Highest-scoring variant; ties go to the first one encountered.
pub fn pick_winner(variants: &[Variant]) -> Option<&Variant> {
    variants.iter().fold(None, |best: Option<&Variant>, candidate| match best {
        Some(current) if score(&candidate.metrics) <= score(&current.metrics) => Some(current),
        _ => Some(candidate),
    })
}
