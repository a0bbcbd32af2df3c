//! Tier escalation for requests that come back with too few results.
//!
//! `Primary -> Relaxed -> LexicalOnly -> Exhausted`, one step at a time and
//! never backwards.

use kbsearch_core::config::FallbackSettings;
use kbsearch_core::types::FallbackTier;

use crate::retrieval::ChannelMode;

/// How the pipeline should run at a given tier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierPlan {
    pub tier: FallbackTier,
    pub channels: ChannelMode,
    pub rerank: bool,
    /// Subtracted from the intent's rerank threshold.
    pub threshold_relax: f32,
    pub pool_bonus: usize,
    /// Apply filters recovered from the query text, not just the caller's space.
    pub structural_filter: bool,
    pub diversity_cap: bool,
}

#[derive(Debug, Clone)]
pub struct FallbackOrchestrator {
    tier: FallbackTier,
    min_results: usize,
    relax_margin: f32,
    relaxed_pool_bonus: usize,
}

impl FallbackOrchestrator {
    pub fn new(settings: &FallbackSettings) -> Self {
        Self {
            tier: FallbackTier::Primary,
            min_results: settings.min_results.max(1),
            relax_margin: settings.relax_margin,
            relaxed_pool_bonus: settings.relaxed_pool_bonus,
        }
    }

    pub fn tier(&self) -> FallbackTier {
        self.tier
    }

    pub fn plan(&self) -> TierPlan {
        match self.tier {
            FallbackTier::Primary => TierPlan {
                tier: self.tier,
                channels: ChannelMode::Both,
                rerank: true,
                threshold_relax: 0.0,
                pool_bonus: 0,
                structural_filter: true,
                diversity_cap: true,
            },
            FallbackTier::Relaxed => TierPlan {
                tier: self.tier,
                channels: ChannelMode::Both,
                rerank: true,
                threshold_relax: self.relax_margin,
                pool_bonus: self.relaxed_pool_bonus,
                structural_filter: true,
                diversity_cap: true,
            },
            FallbackTier::LexicalOnly | FallbackTier::Exhausted => TierPlan {
                tier: self.tier,
                channels: ChannelMode::SparseOnly,
                rerank: false,
                threshold_relax: 0.0,
                pool_bonus: self.relaxed_pool_bonus,
                structural_filter: false,
                diversity_cap: false,
            },
        }
    }

    /// Whether `count` results end the request at the current tier. The last
    /// retrieving tier accepts any non-empty set.
    pub fn is_sufficient(&self, count: usize) -> bool {
        match self.tier {
            FallbackTier::LexicalOnly => count > 0,
            FallbackTier::Exhausted => true,
            _ => count >= self.min_results,
        }
    }

    /// Move to the next tier after an insufficient attempt.
    pub fn escalate(&mut self) -> FallbackTier {
        let from = self.tier;
        self.tier = from.next();
        tracing::info!(stage = "fallback", from = %from, to = %self.tier, "escalating");
        self.tier
    }

    pub fn is_exhausted(&self) -> bool {
        self.tier == FallbackTier::Exhausted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalation_is_monotonic_and_terminal() {
        let mut f = FallbackOrchestrator::new(&FallbackSettings::default());
        let mut seen = vec![f.tier()];
        while !f.is_exhausted() {
            seen.push(f.escalate());
        }
        assert_eq!(seen, vec![FallbackTier::Primary, FallbackTier::Relaxed, FallbackTier::LexicalOnly, FallbackTier::Exhausted]);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(f.escalate(), FallbackTier::Exhausted);
    }

    #[test]
    fn plans_widen_then_drop_dense() {
        let mut f = FallbackOrchestrator::new(&FallbackSettings::default());
        let primary = f.plan();
        assert_eq!(primary.threshold_relax, 0.0);
        f.escalate();
        let relaxed = f.plan();
        assert!(relaxed.threshold_relax > 0.0 && relaxed.pool_bonus > 0);
        f.escalate();
        let lexical = f.plan();
        assert_eq!(lexical.channels, ChannelMode::SparseOnly);
        assert!(!lexical.rerank && !lexical.diversity_cap);
    }

    #[test]
    fn lexical_tier_accepts_any_results() {
        let mut f = FallbackOrchestrator::new(&FallbackSettings { min_results: 3, ..FallbackSettings::default() });
        assert!(!f.is_sufficient(2));
        f.escalate();
        f.escalate();
        assert!(f.is_sufficient(1));
        assert!(!f.is_sufficient(0));
    }
}
