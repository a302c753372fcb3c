//! YAML watchlist used to seed the in-memory item store.

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use pricewatch_core::{extract_item_id, normalize_price, ItemId, TrackedItemState};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Watchlist {
    #[serde(default)]
    pub items: Vec<WatchlistEntry>,
}

/// One tracked product. Either `id` or a product `url` must identify it.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchlistEntry {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub historical_low: Option<String>,
    #[serde(default)]
    pub subscriber_count: u32,
    #[serde(default)]
    pub volatility_score: f64,
    #[serde(default)]
    pub next_check_at: Option<DateTime<Utc>>,
}

impl WatchlistEntry {
    pub fn item_id(&self) -> Result<ItemId> {
        match (&self.id, &self.url) {
            (Some(id), _) => ItemId::parse(id).map_err(|e| anyhow!(e)),
            (None, Some(url)) => extract_item_id(url).ok_or_else(|| anyhow!("no item id in url {url}")),
            (None, None) => bail!("watchlist entry needs an id or a url"),
        }
    }

    /// Entries without an explicit next check are due immediately.
    pub fn into_state(self, now: DateTime<Utc>) -> Result<TrackedItemState> {
        let item_id = self.item_id()?;
        if !(0.0..=1.0).contains(&self.volatility_score) {
            bail!("{item_id}: volatility_score must be within [0, 1]");
        }
        let price = canonical_price(&item_id, "price", self.price.as_deref())?;
        let historical_low = canonical_price(&item_id, "historical_low", self.historical_low.as_deref())?;

        let mut state = TrackedItemState::new(item_id, self.next_check_at.unwrap_or(now));
        state.title = self.title;
        state.price = price;
        state.historical_low = historical_low;
        state.subscriber_count = self.subscriber_count;
        state.volatility_score = self.volatility_score;
        Ok(state)
    }
}

fn canonical_price(item_id: &ItemId, field: &str, raw: Option<&str>) -> Result<Option<String>> {
    match raw {
        None => Ok(None),
        Some(raw) => normalize_price(Some(raw))
            .map(Some)
            .ok_or_else(|| anyhow!("{item_id}: {field} {raw:?} is not a price")),
    }
}

impl Watchlist {
    pub fn parse(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing watchlist yaml")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn into_states(self, now: DateTime<Utc>) -> Result<Vec<TrackedItemState>> {
        self.items.into_iter().map(|entry| entry.into_state(now)).collect()
    }
}
