//! Candidate-pool sizing.
//!
//! Each adjustment is its own pure function; [`adaptive_pool`] composes them
//! in a fixed order so the result depends only on its arguments.

use kbsearch_core::config::RetrievalSettings;

use crate::intent::IntentProfile;

/// Short queries are lexically ambiguous and get a wider pool.
pub fn token_multiplier(token_count: usize) -> usize {
    match token_count {
        0..=2 => 5,
        3..=4 => 3,
        _ => 2,
    }
}

pub fn base_pool(limit: usize, token_count: usize) -> usize {
    limit.saturating_mul(token_multiplier(token_count))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
pub fn apply_intent(pool: usize, profile: &IntentProfile) -> usize {
    (pool as f32 * profile.limit_multiplier.max(0.0)).ceil() as usize
}

/// Filters discard candidates after retrieval, so ask for more up front.
pub fn filter_bonus(filter_present: bool, limit: usize) -> usize {
    if filter_present { limit.clamp(1, 10) } else { 0 }
}

/// Extra candidates when earlier scores were flat: a low spread means the
/// scorer could not separate the pool, so the right chunk may be outside it.
///
/// Scores are min-max normalized first. Fused scores all sit close to
/// `1/(k+1)`, so their raw variance says nothing about separation.
pub fn quality_bonus(prior_scores: Option<&[f32]>) -> usize {
    let Some(scores) = prior_scores.filter(|s| s.len() >= 2) else { return 0 };
    let (lo, hi) = scores.iter().fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &s| (lo.min(s), hi.max(s)));
    let range = hi - lo;
    if !range.is_finite() || range <= f32::EPSILON {
        return 10;
    }
    #[allow(clippy::cast_precision_loss)]
    let n = scores.len() as f32;
    let normalized: Vec<f32> = scores.iter().map(|s| (s - lo) / range).collect();
    let mean = normalized.iter().sum::<f32>() / n;
    let variance = normalized.iter().map(|s| (s - mean).powi(2)).sum::<f32>() / n;
    if variance < 1e-3 { 10 } else if variance < 1e-2 { 5 } else { 0 }
}

pub fn clamp_pool(pool: usize, settings: &RetrievalSettings) -> usize {
    pool.clamp(settings.min_pool, settings.max_pool.max(settings.min_pool))
}

/// Candidate pool size for one retrieval round. `tier_bonus` is the
/// fallback tier's widening; it is added before the hard cap.
pub fn adaptive_pool(
    limit: usize,
    token_count: usize,
    profile: &IntentProfile,
    filter_present: bool,
    prior_scores: Option<&[f32]>,
    tier_bonus: usize,
    settings: &RetrievalSettings,
) -> usize {
    let pool = apply_intent(base_pool(limit, token_count), profile);
    let pool = pool + filter_bonus(filter_present, limit) + quality_bonus(prior_scores) + tier_bonus;
    clamp_pool(pool, settings)
}
