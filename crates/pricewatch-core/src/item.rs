//! Tracked item identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const ITEM_ID_LEN: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ItemIdError {
    #[error("item id must be {ITEM_ID_LEN} ascii alphanumerics, got {0:?}")]
    Invalid(String),
}

/// Ten-character alphanumeric product identifier, stored upper-case.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ItemId(String);

impl ItemId {
    pub fn parse(value: &str) -> Result<Self, ItemIdError> {
        let trimmed = value.trim();
        if trimmed.len() == ITEM_ID_LEN && trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
            Ok(Self(trimmed.to_ascii_uppercase()))
        } else {
            Err(ItemIdError::Invalid(value.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ItemId {
    type Error = ItemIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ItemId> for String {
    fn from(value: ItemId) -> Self {
        value.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Find the identifier following a `/dp/` segment of a product URL.
/// Only amazon storefront hosts (`amazon.<tld>` or a subdomain of one) match.
pub fn extract_item_id(url: &str) -> Option<ItemId> {
    let lower = url.to_ascii_lowercase();
    let path_start = storefront_path_start(&lower)?;
    let mut offset = path_start;
    while let Some(pos) = lower[offset..].find("/dp/") {
        let start = offset + pos + "/dp/".len();
        if let Some(candidate) = url.get(start..start + ITEM_ID_LEN) {
            if let Ok(id) = ItemId::parse(candidate) {
                return Some(id);
            }
        }
        offset = start;
    }
    None
}

/// Byte offset where the path begins, if the host is an amazon storefront.
fn storefront_path_start(lower: &str) -> Option<usize> {
    let host_start = lower.find("://").map_or(0, |idx| idx + "://".len());
    let rest = &lower[host_start..];
    let host_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let authority = &rest[..host_end];
    let host = authority.rsplit('@').next().unwrap_or(authority);
    let host = host.split(':').next().unwrap_or(host);
    let labels: Vec<&str> = host.split('.').collect();
    let is_storefront = labels
        .iter()
        .position(|label| *label == "amazon")
        .is_some_and(|idx| idx + 1 < labels.len() && labels[idx + 1..].iter().all(|l| !l.is_empty()));
    is_storefront.then_some(host_start + host_end)
}

pub fn product_url(base_url: &str, item_id: &ItemId) -> String {
    format!("{}/dp/{}", base_url.trim_end_matches('/'), item_id)
}
