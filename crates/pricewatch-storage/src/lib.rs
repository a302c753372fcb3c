//! Blocked-page snapshots, the shared HTTP client and the item store contract.

mod http;
mod items;
mod snapshots;

pub use http::{FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, RequestPacer, RetryPolicy};
pub use items::{ItemStore, MemoryItemStore, StoreError};
pub use snapshots::{PageSnapshot, SnapshotStore};

pub const CRATE_NAME: &str = "pricewatch-storage";
