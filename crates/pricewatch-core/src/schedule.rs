//! Adaptive next-check interval selection.
//!
//! The interval is chosen by the first matching rule in a fixed, ordered list.
//! Rule order is policy: the cheap-item rule comes first and wins even for
//! popular or volatile items, which bounds fetch cost on low-value products.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::price::parse_price;

pub const DEFAULT_NEXT_CHECK_INTERVAL_MINUTES: u32 = 240;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "when", rename_all = "snake_case")]
pub enum IntervalCondition {
    PriceBelow { price: f64 },
    SubscribersAbove { count: u32 },
    VolatilityAbove { score: f64 },
}

impl IntervalCondition {
    pub fn matches(&self, price: f64, subscriber_count: u32, volatility_score: f64) -> bool {
        match *self {
            Self::PriceBelow { price: threshold } => price < threshold,
            Self::SubscribersAbove { count } => subscriber_count > count,
            Self::VolatilityAbove { score } => volatility_score > score,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IntervalRule {
    pub name: &'static str,
    #[serde(flatten)]
    pub condition: IntervalCondition,
    pub minutes: u32,
}

const DEFAULT_RULES: [IntervalRule; 3] = [
    IntervalRule {
        name: "low_value",
        condition: IntervalCondition::PriceBelow { price: 30.0 },
        minutes: 24 * 60,
    },
    IntervalRule {
        name: "hot_item",
        condition: IntervalCondition::SubscribersAbove { count: 100 },
        minutes: 15,
    },
    IntervalRule {
        name: "volatile",
        condition: IntervalCondition::VolatilityAbove { score: 0.8 },
        minutes: 30,
    },
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulePolicy {
    pub rules: Vec<IntervalRule>,
    pub default_minutes: u32,
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        Self {
            rules: DEFAULT_RULES.to_vec(),
            default_minutes: DEFAULT_NEXT_CHECK_INTERVAL_MINUTES,
        }
    }
}

impl SchedulePolicy {
    pub fn matching_rule(&self, price: f64, subscriber_count: u32, volatility_score: f64) -> Option<&IntervalRule> {
        first_match(&self.rules, price, subscriber_count, volatility_score)
    }

    pub fn interval_minutes(&self, price: f64, subscriber_count: u32, volatility_score: f64) -> u32 {
        self.matching_rule(price, subscriber_count, volatility_score)
            .map(|rule| rule.minutes)
            .unwrap_or(self.default_minutes)
    }

    pub fn next_check_at_after_scrape(&self, input: &NextCheckInput<'_>) -> DateTime<Utc> {
        let effective_price = input
            .scraped_price
            .or(input.current_price)
            .and_then(|p| parse_price(p).ok());

        let minutes = match effective_price {
            Some(price) => self.interval_minutes(price, input.subscriber_count, input.volatility_score),
            None => self.default_minutes,
        };
        input.now + Duration::minutes(i64::from(minutes))
    }
}

fn first_match(
    rules: &[IntervalRule],
    price: f64,
    subscriber_count: u32,
    volatility_score: f64,
) -> Option<&IntervalRule> {
    rules
        .iter()
        .find(|rule| rule.condition.matches(price, subscriber_count, volatility_score))
}

/// Minutes until the next check under the default rule order.
pub fn calculate_next_check_interval(price: f64, subscriber_count: u32, volatility_score: f64) -> u32 {
    first_match(&DEFAULT_RULES, price, subscriber_count, volatility_score)
        .map(|rule| rule.minutes)
        .unwrap_or(DEFAULT_NEXT_CHECK_INTERVAL_MINUTES)
}

#[derive(Debug, Clone, Copy)]
pub struct NextCheckInput<'a> {
    pub scraped_price: Option<&'a str>,
    pub current_price: Option<&'a str>,
    pub subscriber_count: u32,
    pub volatility_score: f64,
    pub now: DateTime<Utc>,
}

/// Scraped price, else stored price, else the default interval.
pub fn calculate_next_check_at_after_scrape(input: &NextCheckInput<'_>) -> DateTime<Utc> {
    SchedulePolicy::default().next_check_at_after_scrape(input)
}

/// Ranking among due items when a dispatch limit applies. Does not affect intervals.
pub fn calculate_priority(subscriber_count: u32, volatility_score: f64) -> f64 {
    (f64::from(subscriber_count) + 1.0).log10() * (volatility_score + 0.1)
}
