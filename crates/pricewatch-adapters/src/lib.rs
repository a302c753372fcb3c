//! Product page extraction and the fetch tier contract.

use async_trait::async_trait;
use pricewatch_core::{ExtractionResult, FetchStrategy, FetchTarget};
use pricewatch_storage::FetchError;
use thiserror::Error;

pub mod page;
pub mod tiers;

pub use page::{analyze_page, PageAnalysis, ProductPage};
pub use tiers::{HttpTier, RenderTier};

pub const CRATE_NAME: &str = "pricewatch-adapters";

#[derive(Debug, Error)]
pub enum TierError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("render service: {0}")]
    Render(String),
}

/// One fetch strategy, invoked as a black box by the escalation cascade.
///
/// Each call hands its extraction straight back to the caller; nothing is
/// parked in shared state keyed by item, so concurrent calls for the same item
/// never see each other's results. Retries are the tier's own business.
#[async_trait]
pub trait FetchTier: Send + Sync {
    fn strategy(&self) -> FetchStrategy;

    /// `Ok(None)` means the tier ran but produced no extraction for the target,
    /// which callers treat as a contract violation rather than a block.
    async fn fetch(&self, target: &FetchTarget) -> Result<Option<ExtractionResult>, TierError>;
}
