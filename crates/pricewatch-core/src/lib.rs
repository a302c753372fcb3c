//! Core domain model and pure decision logic for price monitoring.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod block;
pub mod classify;
pub mod item;
pub mod price;
pub mod schedule;

pub use block::{assess_block, is_blocked_status, is_soft_blocked_signals, BlockAssessment, BlockReason, SoftBlockReason};
pub use classify::{analyze_price_change, classify_price_change, PriceChangeResult, PriceChangeType};
pub use item::{extract_item_id, product_url, ItemId, ItemIdError};
pub use price::{normalize_price, normalize_text, parse_price, PriceParseError};
pub use schedule::{
    calculate_next_check_at_after_scrape, calculate_next_check_interval, calculate_priority,
    IntervalCondition, IntervalRule, NextCheckInput, SchedulePolicy, DEFAULT_NEXT_CHECK_INTERVAL_MINUTES,
};

pub const CRATE_NAME: &str = "pricewatch-core";

/// Output of one fetch tier for one tracked item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ExtractionResult {
    /// Canonical two-decimal price string.
    pub price: Option<String>,
    pub in_stock: bool,
    pub title: Option<String>,
    #[serde(default)]
    pub blocked: bool,
}

impl ExtractionResult {
    pub fn blocked() -> Self {
        Self {
            price: None,
            in_stock: false,
            title: None,
            blocked: true,
        }
    }

    pub fn has_price(&self) -> bool {
        self.price.is_some()
    }

    /// Blocked pages and pages without a parsed price both warrant the next tier.
    pub fn needs_escalation(&self) -> bool {
        self.blocked || self.price.is_none()
    }
}

/// Page-level evidence consumed once by the soft-block detector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SoftBlockSignals {
    pub title_text: Option<String>,
    pub body_text: Option<String>,
    pub has_product_title: bool,
    pub has_primary_price: bool,
    pub has_add_to_cart: bool,
    pub has_buy_now: bool,
}

impl SoftBlockSignals {
    pub fn has_core_product_signal(&self) -> bool {
        self.has_product_title || self.has_primary_price || self.has_add_to_cart || self.has_buy_now
    }
}

/// Fetch strategies in escalation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStrategy {
    DirectHttp,
    ProxiedHttp,
    RenderedProxy,
}

impl FetchStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DirectHttp => "direct_http",
            Self::ProxiedHttp => "proxied_http",
            Self::RenderedProxy => "rendered_proxy",
        }
    }
}

impl fmt::Display for FetchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchTarget {
    pub item_id: ItemId,
    pub url: String,
}

impl FetchTarget {
    pub fn new(item_id: ItemId, base_url: &str) -> Self {
        let url = product_url(base_url, &item_id);
        Self { item_id, url }
    }
}

/// Item state owned by the external store; read before classification and scheduling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedItemState {
    pub item_id: ItemId,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub historical_low: Option<String>,
    #[serde(default)]
    pub subscriber_count: u32,
    /// In [0, 1].
    #[serde(default)]
    pub volatility_score: f64,
    #[serde(default)]
    pub in_stock: bool,
    pub next_check_at: DateTime<Utc>,
    #[serde(default)]
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl TrackedItemState {
    pub fn new(item_id: ItemId, next_check_at: DateTime<Utc>) -> Self {
        Self {
            item_id,
            title: None,
            price: None,
            historical_low: None,
            subscriber_count: 0,
            volatility_score: 0.0,
            in_stock: false,
            next_check_at,
            last_checked_at: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_check_at <= now
    }

    pub fn priority(&self) -> f64 {
        calculate_priority(self.subscriber_count, self.volatility_score)
    }
}

/// Proposed write back to the store after one check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemUpdate {
    pub item_id: ItemId,
    pub price: Option<String>,
    pub historical_low: Option<String>,
    pub in_stock: bool,
    pub title: Option<String>,
    pub next_check_at: DateTime<Utc>,
    pub last_checked_at: DateTime<Utc>,
}

impl ItemUpdate {
    /// Reschedule only; price, low, stock and title stay as stored.
    pub fn reschedule(item: &TrackedItemState, next_check_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            item_id: item.item_id.clone(),
            price: item.price.clone(),
            historical_low: item.historical_low.clone(),
            in_stock: item.in_stock,
            title: item.title.clone(),
            next_check_at,
            last_checked_at: now,
        }
    }

    /// Fold a priced extraction and its classification into the stored state.
    /// The historical low is only ever lowered here.
    pub fn from_priced_extraction(
        item: &TrackedItemState,
        extraction: &ExtractionResult,
        new_price: &str,
        change: &PriceChangeResult,
        next_check_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        let historical_low = if change.is_historical_low {
            Some(new_price.to_string())
        } else {
            item.historical_low.clone()
        };
        Self {
            item_id: item.item_id.clone(),
            price: Some(new_price.to_string()),
            historical_low,
            in_stock: extraction.in_stock,
            title: extraction.title.clone().or_else(|| item.title.clone()),
            next_check_at,
            last_checked_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationReason {
    AnomalousDrop,
    Blocked,
}

/// Events handed to external notification and cross-verification workflows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    PriceChanged {
        item_id: ItemId,
        change_type: PriceChangeType,
        old_price: Option<String>,
        new_price: String,
        drop_percent: f64,
        is_historical_low: bool,
        in_stock: bool,
        unverified: bool,
    },
    VerificationRequested {
        item_id: ItemId,
        title: Option<String>,
        expected_price: Option<String>,
        reason: VerificationReason,
    },
}

impl MonitorEvent {
    pub fn item_id(&self) -> &ItemId {
        match self {
            Self::PriceChanged { item_id, .. } | Self::VerificationRequested { item_id, .. } => item_id,
        }
    }
}
