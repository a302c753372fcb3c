//! Concrete fetch tiers: direct HTTP, proxied HTTP and a browser-render service.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use pricewatch_core::{ExtractionResult, FetchStrategy, FetchTarget};
use pricewatch_storage::{HttpFetcher, SnapshotStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::page::analyze_page;
use crate::{FetchTier, TierError};

/// Plain HTTP tier. Whether it goes direct or through a proxy is decided by
/// the [`HttpFetcher`] it is built with.
pub struct HttpTier {
    strategy: FetchStrategy,
    http: Arc<HttpFetcher>,
    snapshots: Option<SnapshotStore>,
}

impl HttpTier {
    pub fn direct(http: Arc<HttpFetcher>) -> Self {
        Self {
            strategy: FetchStrategy::DirectHttp,
            http,
            snapshots: None,
        }
    }

    pub fn proxied(http: Arc<HttpFetcher>) -> Self {
        Self {
            strategy: FetchStrategy::ProxiedHttp,
            http,
            snapshots: None,
        }
    }

    pub fn with_snapshots(mut self, store: SnapshotStore) -> Self {
        self.snapshots = Some(store);
        self
    }
}

#[async_trait]
impl FetchTier for HttpTier {
    fn strategy(&self) -> FetchStrategy {
        self.strategy
    }

    async fn fetch(&self, target: &FetchTarget) -> Result<Option<ExtractionResult>, TierError> {
        let response = self.http.get(self.strategy.as_str(), &target.url).await?;
        let html = response.text();
        let extraction = finish_page(
            self.strategy,
            target,
            Some(response.status.as_u16()),
            &html,
            self.snapshots.as_ref(),
        )
        .await?;
        Ok(Some(extraction))
    }
}

#[derive(Debug, Serialize)]
struct RenderRequest<'a> {
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    proxy: Option<&'a str>,
    block_resources: &'a [&'a str],
    accept_language: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct RenderedPage {
    #[serde(default)]
    status: Option<u16>,
    html: String,
}

const BLOCKED_RESOURCES: [&str; 4] = ["image", "stylesheet", "font", "media"];

/// Delegates rendering to an external headless-browser service that loads the
/// page through the configured proxy and returns the final HTML.
pub struct RenderTier {
    http: Arc<HttpFetcher>,
    endpoint: String,
    proxy_url: Option<String>,
    accept_language: Option<String>,
    snapshots: Option<SnapshotStore>,
}

impl RenderTier {
    pub fn new(http: Arc<HttpFetcher>, endpoint: impl Into<String>, proxy_url: Option<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            proxy_url,
            accept_language: None,
            snapshots: None,
        }
    }

    pub fn with_accept_language(mut self, language: Option<String>) -> Self {
        self.accept_language = language;
        self
    }

    pub fn with_snapshots(mut self, store: SnapshotStore) -> Self {
        self.snapshots = Some(store);
        self
    }
}

#[async_trait]
impl FetchTier for RenderTier {
    fn strategy(&self) -> FetchStrategy {
        FetchStrategy::RenderedProxy
    }

    async fn fetch(&self, target: &FetchTarget) -> Result<Option<ExtractionResult>, TierError> {
        let request = RenderRequest {
            url: &target.url,
            proxy: self.proxy_url.as_deref(),
            block_resources: &BLOCKED_RESOURCES,
            accept_language: self.accept_language.as_deref(),
        };
        let response = self
            .http
            .post_json(self.strategy().as_str(), &self.endpoint, &request)
            .await?;
        if !response.status.is_success() {
            return Err(TierError::Render(format!(
                "{} returned {}",
                self.endpoint, response.status
            )));
        }

        let rendered: RenderedPage = serde_json::from_slice(&response.body)
            .map_err(|e| TierError::Render(format!("decoding response: {e}")))?;
        let extraction = finish_page(
            self.strategy(),
            target,
            rendered.status,
            &rendered.html,
            self.snapshots.as_ref(),
        )
        .await?;
        Ok(Some(extraction))
    }
}

async fn finish_page(
    strategy: FetchStrategy,
    target: &FetchTarget,
    status: Option<u16>,
    html: &str,
    snapshots: Option<&SnapshotStore>,
) -> Result<ExtractionResult, TierError> {
    let analysis = analyze_page(status, html)?;

    if analysis.assessment.is_blocked() {
        warn!(
            item_id = %target.item_id,
            %strategy,
            url = %target.url,
            reasons = %analysis.assessment,
            "blocked"
        );
        if let Some(store) = snapshots {
            match store
                .save_page(Utc::now(), &target.item_id, strategy, html)
                .await
            {
                Ok(saved) => debug!(path = %saved.path.display(), reused = saved.reused, "stored blocked page snapshot"),
                Err(err) => warn!(error = %err, "failed to store blocked page snapshot"),
            }
        }
    }

    Ok(analysis.extraction)
}
