//! Fetch-escalation cascade: direct, then proxied, then rendered.

use std::sync::Arc;

use pricewatch_adapters::{FetchTier, TierError};
use pricewatch_core::{ExtractionResult, FetchStrategy, FetchTarget, ItemId};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum CascadeError {
    #[error("{strategy} tier failed for {item_id}: {source}")]
    Tier {
        strategy: FetchStrategy,
        item_id: ItemId,
        #[source]
        source: TierError,
    },
    #[error("no result for {item_id} via {strategy} tier")]
    MissingResult { strategy: FetchStrategy, item_id: ItemId },
}

/// Configured tiers in escalation order. Only the direct tier is mandatory.
#[derive(Clone)]
pub struct FetchTiers {
    pub direct: Arc<dyn FetchTier>,
    pub proxy: Option<Arc<dyn FetchTier>>,
    pub render: Option<Arc<dyn FetchTier>>,
}

impl FetchTiers {
    pub fn new(direct: Arc<dyn FetchTier>) -> Self {
        Self {
            direct,
            proxy: None,
            render: None,
        }
    }

    pub fn with_proxy(mut self, tier: Arc<dyn FetchTier>) -> Self {
        self.proxy = Some(tier);
        self
    }

    pub fn with_render(mut self, tier: Arc<dyn FetchTier>) -> Self {
        self.render = Some(tier);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierAttempt {
    pub strategy: FetchStrategy,
    pub blocked: bool,
    pub has_price: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CascadeOutcome {
    pub result: ExtractionResult,
    /// Tier whose result was returned.
    pub strategy: FetchStrategy,
    pub direct_blocked: bool,
    pub used_proxy_fallback: bool,
    pub used_render_fallback: bool,
    pub attempts: Vec<TierAttempt>,
}

impl CascadeOutcome {
    pub fn all_blocked(&self) -> bool {
        !self.attempts.is_empty() && self.attempts.iter().all(|a| a.blocked)
    }
}

/// Run tiers strictly in sequence until one yields an unblocked, priced page
/// or the next tier is not configured. At most three tier calls are made.
pub async fn scrape_with_fallback(target: &FetchTarget, tiers: &FetchTiers) -> Result<CascadeOutcome, CascadeError> {
    let mut attempts = Vec::with_capacity(3);

    let (mut strategy, mut result) = run_tier(tiers.direct.as_ref(), target, &mut attempts).await?;
    let direct_blocked = result.blocked;
    let mut used_proxy_fallback = false;
    let mut used_render_fallback = false;

    for (slot, next) in [tiers.proxy.as_deref(), tiers.render.as_deref()].into_iter().enumerate() {
        if !result.needs_escalation() {
            break;
        }
        let Some(tier) = next else {
            break;
        };

        info!(
            item_id = %target.item_id,
            from = %strategy,
            to = %tier.strategy(),
            blocked = result.blocked,
            has_price = result.has_price(),
            "escalating fetch"
        );
        (strategy, result) = run_tier(tier, target, &mut attempts).await?;
        if slot == 0 {
            used_proxy_fallback = true;
        } else {
            used_render_fallback = true;
        }
    }

    Ok(CascadeOutcome {
        result,
        strategy,
        direct_blocked,
        used_proxy_fallback,
        used_render_fallback,
        attempts,
    })
}

async fn run_tier(
    tier: &dyn FetchTier,
    target: &FetchTarget,
    attempts: &mut Vec<TierAttempt>,
) -> Result<(FetchStrategy, ExtractionResult), CascadeError> {
    let strategy = tier.strategy();
    let result = tier
        .fetch(target)
        .await
        .map_err(|source| CascadeError::Tier {
            strategy,
            item_id: target.item_id.clone(),
            source,
        })?
        .ok_or_else(|| CascadeError::MissingResult {
            strategy,
            item_id: target.item_id.clone(),
        })?;

    attempts.push(TierAttempt {
        strategy,
        blocked: result.blocked,
        has_price: result.has_price(),
    });
    Ok((strategy, result))
}
