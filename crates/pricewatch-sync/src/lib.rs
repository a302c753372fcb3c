//! Check pipeline orchestration: dispatch due items, run the fetch cascade,
//! classify, reschedule and hand events off.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pricewatch_adapters::{HttpTier, RenderTier};
use pricewatch_core::{
    analyze_price_change, ExtractionResult, FetchStrategy, FetchTarget, ItemId, ItemUpdate, MonitorEvent,
    NextCheckInput, PriceChangeResult, PriceChangeType, SchedulePolicy, TrackedItemState, VerificationReason,
};
use pricewatch_storage::{HttpClientConfig, HttpFetcher, ItemStore, MemoryItemStore, SnapshotStore};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod cascade;
pub mod events;
pub mod watchlist;

pub use cascade::{scrape_with_fallback, CascadeError, CascadeOutcome, FetchTiers, TierAttempt};
pub use events::{EventSink, JsonlEventSink, MemoryEventSink, TracingEventSink};
pub use watchlist::{Watchlist, WatchlistEntry};

pub const CRATE_NAME: &str = "pricewatch-sync";

pub const DEFAULT_ACCEPT_LANGUAGE: &str = "pl-PL,pl;q=0.9,en-US;q=0.8,en;q=0.7";

#[derive(Debug, Clone)]
pub struct CheckConfig {
    pub base_url: String,
    pub proxy_url: Option<String>,
    pub render_endpoint: Option<String>,
    pub user_agent: String,
    pub accept_language: String,
    pub http_timeout_secs: u64,
    pub dispatch_limit: usize,
    pub max_concurrent_checks: usize,
    pub scheduler_enabled: bool,
    pub tick_cron: String,
    pub artifacts_dir: PathBuf,
    pub snapshot_blocked: bool,
    pub reports_dir: Option<PathBuf>,
    pub events_path: Option<PathBuf>,
    pub watchlist_path: PathBuf,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.amazon.pl".to_string(),
            proxy_url: None,
            render_endpoint: None,
            user_agent: "pricewatch-bot/0.1".to_string(),
            accept_language: DEFAULT_ACCEPT_LANGUAGE.to_string(),
            http_timeout_secs: 30,
            dispatch_limit: 50,
            max_concurrent_checks: 4,
            scheduler_enabled: false,
            tick_cron: "0 * * * * *".to_string(),
            artifacts_dir: PathBuf::from("./artifacts"),
            snapshot_blocked: false,
            reports_dir: Some(PathBuf::from("./reports")),
            events_path: None,
            watchlist_path: PathBuf::from("./watchlist.yaml"),
        }
    }
}

impl CheckConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: env_string("PRICEWATCH_BASE_URL").unwrap_or(defaults.base_url),
            proxy_url: env_string("PRICEWATCH_PROXY_URL"),
            render_endpoint: env_string("PRICEWATCH_RENDER_ENDPOINT"),
            user_agent: env_string("PRICEWATCH_USER_AGENT").unwrap_or(defaults.user_agent),
            accept_language: env_string("PRICEWATCH_ACCEPT_LANGUAGE").unwrap_or(defaults.accept_language),
            http_timeout_secs: env_parse("PRICEWATCH_HTTP_TIMEOUT_SECS").unwrap_or(defaults.http_timeout_secs),
            dispatch_limit: env_parse("PRICEWATCH_DISPATCH_LIMIT").unwrap_or(defaults.dispatch_limit),
            max_concurrent_checks: env_parse("PRICEWATCH_MAX_CONCURRENT_CHECKS")
                .unwrap_or(defaults.max_concurrent_checks),
            scheduler_enabled: env_string("PRICEWATCH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            tick_cron: env_string("PRICEWATCH_TICK_CRON").unwrap_or(defaults.tick_cron),
            artifacts_dir: env_string("PRICEWATCH_ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.artifacts_dir),
            snapshot_blocked: env_string("PRICEWATCH_SNAPSHOT_BLOCKED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            reports_dir: env_string("PRICEWATCH_REPORTS_DIR")
                .map(PathBuf::from)
                .or(defaults.reports_dir),
            events_path: env_string("PRICEWATCH_EVENTS_PATH").map(PathBuf::from),
            watchlist_path: env_string("PRICEWATCH_WATCHLIST")
                .map(PathBuf::from)
                .unwrap_or(defaults.watchlist_path),
        }
    }

    fn http_client_config(&self, proxy_url: Option<String>) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            accept_language: Some(self.accept_language.clone()),
            proxy_url,
            max_in_flight_per_lane: self.max_concurrent_checks.max(1),
            ..Default::default()
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.trim().parse().ok())
}

/// Build the configured tiers. The render tier is only wired when a proxy is
/// configured, since it is reached solely by escalating past the proxy tier.
pub fn build_tiers(config: &CheckConfig) -> Result<FetchTiers> {
    let snapshots = config
        .snapshot_blocked
        .then(|| SnapshotStore::new(config.artifacts_dir.clone()));

    let direct_http = Arc::new(HttpFetcher::new(config.http_client_config(None)).context("building direct http client")?);
    let mut direct = HttpTier::direct(direct_http.clone());
    if let Some(store) = &snapshots {
        direct = direct.with_snapshots(store.clone());
    }
    let mut tiers = FetchTiers::new(Arc::new(direct));

    let Some(proxy_url) = config.proxy_url.clone() else {
        if config.render_endpoint.is_some() {
            warn!("render endpoint configured without a proxy; rendered tier disabled");
        }
        return Ok(tiers);
    };

    let proxied_http = Arc::new(
        HttpFetcher::new(config.http_client_config(Some(proxy_url.clone()))).context("building proxied http client")?,
    );
    let mut proxied = HttpTier::proxied(proxied_http);
    if let Some(store) = &snapshots {
        proxied = proxied.with_snapshots(store.clone());
    }
    tiers = tiers.with_proxy(Arc::new(proxied));

    if let Some(endpoint) = &config.render_endpoint {
        let mut render = RenderTier::new(direct_http, endpoint.clone(), Some(proxy_url))
            .with_accept_language(Some(config.accept_language.clone()));
        if let Some(store) = &snapshots {
            render = render.with_snapshots(store.clone());
        }
        tiers = tiers.with_render(Arc::new(render));
    }
    Ok(tiers)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemCheckReport {
    pub item_id: ItemId,
    pub strategy: Option<FetchStrategy>,
    pub direct_blocked: bool,
    pub used_proxy_fallback: bool,
    pub used_render_fallback: bool,
    pub blocked: bool,
    pub new_price: Option<String>,
    pub change_type: Option<PriceChangeType>,
    pub drop_percent: Option<f64>,
    pub is_historical_low: bool,
    pub events: Vec<MonitorEvent>,
    pub next_check_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl ItemCheckReport {
    fn failed(item_id: ItemId, next_check_at: DateTime<Utc>, error: String) -> Self {
        Self {
            item_id,
            strategy: None,
            direct_blocked: false,
            used_proxy_fallback: false,
            used_render_fallback: false,
            blocked: false,
            new_price: None,
            change_type: None,
            drop_percent: None,
            is_historical_low: false,
            events: Vec::new(),
            next_check_at,
            error: Some(error),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub due_items: usize,
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub price_changes: usize,
    pub events_emitted: usize,
    pub report_path: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckRunReport {
    summary: CheckRunSummary,
    items: Vec<ItemCheckReport>,
}

/// Highest priority first, then the longest-waiting item. Truncated to `limit`.
pub fn select_for_dispatch(mut due: Vec<TrackedItemState>, limit: usize) -> Vec<TrackedItemState> {
    due.sort_by(|a, b| {
        b.priority()
            .total_cmp(&a.priority())
            .then_with(|| a.next_check_at.cmp(&b.next_check_at))
            .then_with(|| a.item_id.cmp(&b.item_id))
    });
    due.truncate(limit);
    due
}

/// Events for one priced extraction: a change notice for every real change and
/// a verification request for anomalous drops.
pub fn price_events(
    item: &TrackedItemState,
    extraction: &ExtractionResult,
    new_price: &str,
    change: &PriceChangeResult,
) -> Vec<MonitorEvent> {
    let mut events = Vec::new();
    if change.change_type == PriceChangeType::NoChange {
        return events;
    }
    let anomalous = change.change_type == PriceChangeType::AnomalousDrop;
    events.push(MonitorEvent::PriceChanged {
        item_id: item.item_id.clone(),
        change_type: change.change_type,
        old_price: item.price.clone(),
        new_price: new_price.to_string(),
        drop_percent: change.drop_percent,
        is_historical_low: change.is_historical_low,
        in_stock: extraction.in_stock,
        unverified: anomalous,
    });
    if anomalous {
        events.push(MonitorEvent::VerificationRequested {
            item_id: item.item_id.clone(),
            title: extraction.title.clone().or_else(|| item.title.clone()),
            expected_price: Some(new_price.to_string()),
            reason: VerificationReason::AnomalousDrop,
        });
    }
    events
}

/// One tick of the monitor. Cheap to clone; every collaborator sits behind an `Arc`.
#[derive(Clone)]
pub struct CheckPipeline {
    config: Arc<CheckConfig>,
    store: Arc<dyn ItemStore>,
    tiers: FetchTiers,
    events: Arc<dyn EventSink>,
    policy: Arc<SchedulePolicy>,
    tick_lock: Arc<Mutex<()>>,
}

impl CheckPipeline {
    pub fn new(config: CheckConfig, store: Arc<dyn ItemStore>, tiers: FetchTiers, events: Arc<dyn EventSink>) -> Self {
        Self {
            config: Arc::new(config),
            store,
            tiers,
            events,
            policy: Arc::new(SchedulePolicy::default()),
            tick_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_policy(mut self, policy: SchedulePolicy) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn config(&self) -> &CheckConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<CheckRunSummary> {
        self.run_at(Utc::now()).await
    }

    /// Runs a tick, waiting for any tick already in progress to finish.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<CheckRunSummary> {
        let _tick = self.tick_lock.lock().await;
        self.run_tick(now).await
    }

    /// Runs a tick unless one is already in progress, in which case `None`.
    /// The guard is held for the whole tick.
    pub async fn run_if_idle(&self, now: DateTime<Utc>) -> Option<Result<CheckRunSummary>> {
        let Ok(_tick) = self.tick_lock.try_lock() else {
            debug!("previous tick still running; skipping");
            return None;
        };
        Some(self.run_tick(now).await)
    }

    async fn run_tick(&self, now: DateTime<Utc>) -> Result<CheckRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let due = self.store.due_items(now).await.context("loading due items")?;
        let due_items = due.len();
        let selected = select_for_dispatch(due, self.config.dispatch_limit);
        let dispatched = selected.len();
        debug!(%run_id, due_items, dispatched, "dispatching checks");

        let limit = Arc::new(Semaphore::new(self.config.max_concurrent_checks.max(1)));
        let mut set = JoinSet::new();
        for item in selected {
            let pipeline = self.clone();
            let limit = limit.clone();
            set.spawn(async move {
                let _permit = limit.acquire_owned().await;
                pipeline.check_item(item, now).await
            });
        }

        let mut items = Vec::with_capacity(dispatched);
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(report) => items.push(report),
                Err(err) => warn!(%run_id, error = %err, "item check task aborted"),
            }
        }
        items.sort_by(|a, b| a.item_id.cmp(&b.item_id));

        let succeeded = items.iter().filter(|r| r.succeeded()).count();
        let mut summary = CheckRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            due_items,
            dispatched,
            succeeded,
            failed: dispatched - succeeded,
            price_changes: items
                .iter()
                .filter(|r| r.change_type.is_some_and(|t| t != PriceChangeType::NoChange))
                .count(),
            events_emitted: items.iter().map(|r| r.events.len()).sum(),
            report_path: None,
        };

        if let Some(reports_dir) = &self.config.reports_dir {
            write_report(reports_dir, &mut summary, items).await?;
        }

        info!(
            %run_id,
            due = summary.due_items,
            dispatched = summary.dispatched,
            failed = summary.failed,
            price_changes = summary.price_changes,
            events = summary.events_emitted,
            "check run finished"
        );
        Ok(summary)
    }

    /// Never fails: a cascade, store or sink error is recorded in the report and
    /// the item is rescheduled from its stored price.
    pub async fn check_item(&self, item: TrackedItemState, now: DateTime<Utc>) -> ItemCheckReport {
        match self.try_check_item(&item, now).await {
            Ok(report) => report,
            Err(err) => {
                let error = format!("{err:#}");
                warn!(item_id = %item.item_id, %error, "item check failed");
                let next_check_at = self.next_check_at(&item, None, now);
                if let Err(store_err) = self
                    .store
                    .apply_update(&ItemUpdate::reschedule(&item, next_check_at, now))
                    .await
                {
                    warn!(item_id = %item.item_id, error = %store_err, "rescheduling failed item");
                }
                ItemCheckReport::failed(item.item_id, next_check_at, error)
            }
        }
    }

    async fn try_check_item(&self, item: &TrackedItemState, now: DateTime<Utc>) -> Result<ItemCheckReport> {
        let target = FetchTarget::new(item.item_id.clone(), &self.config.base_url);
        let outcome = scrape_with_fallback(&target, &self.tiers).await?;
        let extraction = &outcome.result;

        let next_check_at = self.next_check_at(item, extraction.price.as_deref(), now);
        let (update, change, events) = match extraction.price.as_deref() {
            Some(new_price) => {
                let change = analyze_price_change(item.price.as_deref(), new_price, item.historical_low.as_deref())
                    .with_context(|| format!("classifying {} against stored prices", item.item_id))?;
                let events = price_events(item, extraction, new_price, &change);
                let update = ItemUpdate::from_priced_extraction(item, extraction, new_price, &change, next_check_at, now);
                (update, Some(change), events)
            }
            None => {
                let mut update = ItemUpdate::reschedule(item, next_check_at, now);
                if !extraction.blocked {
                    update.in_stock = extraction.in_stock;
                    update.title = extraction.title.clone().or(update.title);
                }
                let mut events = Vec::new();
                if outcome.all_blocked() {
                    events.push(MonitorEvent::VerificationRequested {
                        item_id: item.item_id.clone(),
                        title: item.title.clone(),
                        expected_price: item.price.clone(),
                        reason: VerificationReason::Blocked,
                    });
                }
                (update, None, events)
            }
        };

        // Events go out before the store write so a sink failure leaves the
        // stored price untouched and the change is detected again next check.
        for event in &events {
            self.events
                .publish(event.clone())
                .await
                .with_context(|| format!("publishing event for {}", item.item_id))?;
        }
        self.store
            .apply_update(&update)
            .await
            .with_context(|| format!("updating {}", item.item_id))?;

        if let Some(change) = &change {
            info!(
                item_id = %item.item_id,
                strategy = %outcome.strategy,
                change = change.change_type.as_str(),
                drop_percent = change.drop_percent,
                historical_low = change.is_historical_low,
                next_check_at = %next_check_at,
                "item checked"
            );
        } else {
            info!(
                item_id = %item.item_id,
                strategy = %outcome.strategy,
                blocked = extraction.blocked,
                next_check_at = %next_check_at,
                "item checked without price"
            );
        }

        Ok(ItemCheckReport {
            item_id: item.item_id.clone(),
            strategy: Some(outcome.strategy),
            direct_blocked: outcome.direct_blocked,
            used_proxy_fallback: outcome.used_proxy_fallback,
            used_render_fallback: outcome.used_render_fallback,
            blocked: extraction.blocked,
            new_price: extraction.price.clone(),
            change_type: change.as_ref().map(|c| c.change_type),
            drop_percent: change.as_ref().map(|c| c.drop_percent),
            is_historical_low: change.as_ref().is_some_and(|c| c.is_historical_low),
            events,
            next_check_at,
            error: None,
        })
    }

    fn next_check_at(&self, item: &TrackedItemState, scraped_price: Option<&str>, now: DateTime<Utc>) -> DateTime<Utc> {
        self.policy.next_check_at_after_scrape(&NextCheckInput {
            scraped_price,
            current_price: item.price.as_deref(),
            subscriber_count: item.subscriber_count,
            volatility_score: item.volatility_score,
            now,
        })
    }

    /// Cron-driven ticks. A tick that fires while the previous one is still
    /// running is skipped.
    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = self.clone();
        let cron = self.config.tick_cron.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                if let Some(Err(err)) = pipeline.run_if_idle(Utc::now()).await {
                    warn!(error = %format!("{err:#}"), "scheduled check run failed");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

async fn write_report(reports_root: &Path, summary: &mut CheckRunSummary, items: Vec<ItemCheckReport>) -> Result<PathBuf> {
    let dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let path = dir.join("check_run.json");
    summary.report_path = Some(path.display().to_string());
    let report = CheckRunReport {
        summary: summary.clone(),
        items,
    };
    let bytes = serde_json::to_vec_pretty(&report).context("serializing check run report")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// Markdown digest of the most recent run reports under `reports_root`.
pub fn report_recent_runs(runs: usize, reports_root: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().join("check_run.json").is_file())
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# Price Watch Runs".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let path = dir.path().join("check_run.json");
        let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let report: CheckRunReport =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        let s = &report.summary;

        lines.push(format!("## Run `{}`", s.run_id));
        lines.push(format!("- started: {}", s.started_at));
        lines.push(format!("- dispatched: {} of {} due", s.dispatched, s.due_items));
        lines.push(format!("- failed: {}", s.failed));
        lines.push(format!("- price changes: {}", s.price_changes));
        lines.push(format!("- events: {}", s.events_emitted));
        for item in report.items.iter().filter(|i| !i.succeeded()) {
            lines.push(format!(
                "  - `{}` failed: {}",
                item.item_id,
                item.error.as_deref().unwrap_or("unknown")
            ));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

/// Load the watchlist into an in-memory store and run one tick with the
/// env-configured tiers.
pub async fn run_check_once_from_env() -> Result<CheckRunSummary> {
    let config = CheckConfig::from_env();
    let pipeline = pipeline_from_config(config).await?;
    pipeline.run_once().await
}

pub async fn pipeline_from_config(config: CheckConfig) -> Result<CheckPipeline> {
    let watchlist = Watchlist::load(&config.watchlist_path).await?;
    let store: Arc<dyn ItemStore> = Arc::new(MemoryItemStore::new(watchlist.into_states(Utc::now())?));
    let events: Arc<dyn EventSink> = match &config.events_path {
        Some(path) => Arc::new(JsonlEventSink::new(path.clone())),
        None => Arc::new(TracingEventSink),
    };
    let tiers = build_tiers(&config)?;
    Ok(CheckPipeline::new(config, store, tiers, events))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use pricewatch_adapters::{FetchTier, TierError};
    use std::collections::HashMap;

    #[derive(Clone)]
    enum Scripted {
        Page(ExtractionResult),
        Fail,
    }

    struct ScriptedTier {
        strategy: FetchStrategy,
        pages: HashMap<&'static str, Scripted>,
    }

    impl ScriptedTier {
        fn new(strategy: FetchStrategy, pages: impl IntoIterator<Item = (&'static str, Scripted)>) -> Arc<Self> {
            Arc::new(Self {
                strategy,
                pages: pages.into_iter().collect(),
            })
        }
    }

    #[async_trait]
    impl FetchTier for ScriptedTier {
        fn strategy(&self) -> FetchStrategy {
            self.strategy
        }

        async fn fetch(&self, target: &FetchTarget) -> Result<Option<ExtractionResult>, TierError> {
            match self.pages.get(target.item_id.as_str()) {
                Some(Scripted::Page(page)) => Ok(Some(page.clone())),
                Some(Scripted::Fail) => Err(TierError::Message("proxy refused connection".into())),
                None => Ok(Some(ExtractionResult::blocked())),
            }
        }
    }

    struct FailingSink;

    #[async_trait]
    impl EventSink for FailingSink {
        async fn publish(&self, _event: MonitorEvent) -> Result<()> {
            anyhow::bail!("outbox unavailable")
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap()
    }

    fn item(id: &str, price: Option<&str>, subscribers: u32, volatility: f64) -> TrackedItemState {
        let mut state = TrackedItemState::new(ItemId::parse(id).unwrap(), now() - chrono::Duration::minutes(1));
        state.price = price.map(str::to_string);
        state.title = Some(format!("Item {id}"));
        state.subscriber_count = subscribers;
        state.volatility_score = volatility;
        state
    }

    fn priced(price: &str) -> Scripted {
        Scripted::Page(ExtractionResult {
            price: Some(price.into()),
            in_stock: true,
            title: Some("Fresh title".into()),
            blocked: false,
        })
    }

    fn config(reports_dir: Option<PathBuf>) -> CheckConfig {
        CheckConfig {
            reports_dir,
            ..CheckConfig::default()
        }
    }

    async fn stored(store: &MemoryItemStore, id: &str) -> TrackedItemState {
        store.get(&ItemId::parse(id).unwrap()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn tick_classifies_emits_and_reschedules() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryItemStore::new([
            item("B000000001", Some("100.00"), 5, 0.2),
            item("B000000002", Some("50.00"), 5, 0.2),
            item("B000000003", Some("40.00"), 5, 0.2),
            item("B000000004", Some("20.00"), 5, 0.2),
        ]));
        let direct = ScriptedTier::new(
            FetchStrategy::DirectHttp,
            [
                ("B000000001", priced("60.00")),
                ("B000000003", Scripted::Page(ExtractionResult::blocked())),
                ("B000000004", priced("20.00")),
            ],
        );
        let proxy = ScriptedTier::new(FetchStrategy::ProxiedHttp, [("B000000003", Scripted::Fail)]);
        let tiers = FetchTiers::new(direct).with_proxy(proxy);
        let sink = Arc::new(MemoryEventSink::default());
        let pipeline = CheckPipeline::new(
            config(Some(tmp.path().to_path_buf())),
            store.clone(),
            tiers,
            sink.clone(),
        );

        let summary = pipeline.run_at(now()).await.unwrap();

        assert_eq!(summary.due_items, 4);
        assert_eq!(summary.dispatched, 4);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.price_changes, 1);

        let events = sink.events().await;
        assert_eq!(events.len(), 3);
        assert!(events.iter().any(|e| matches!(
            e,
            MonitorEvent::PriceChanged {
                change_type: PriceChangeType::AnomalousDrop,
                unverified: true,
                ..
            }
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            MonitorEvent::VerificationRequested {
                reason: VerificationReason::AnomalousDrop,
                ..
            }
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            MonitorEvent::VerificationRequested {
                item_id,
                reason: VerificationReason::Blocked,
                expected_price: Some(p),
                ..
            } if item_id.as_str() == "B000000002" && p == "50.00"
        )));

        let dropped = stored(&store, "B000000001").await;
        assert_eq!(dropped.price.as_deref(), Some("60.00"));
        assert_eq!(dropped.historical_low.as_deref(), Some("60.00"));
        assert_eq!(dropped.title.as_deref(), Some("Fresh title"));
        assert_eq!(dropped.next_check_at, now() + chrono::Duration::minutes(240));

        let blocked = stored(&store, "B000000002").await;
        assert_eq!(blocked.price.as_deref(), Some("50.00"));
        assert_eq!(blocked.last_checked_at, Some(now()));

        let failed = stored(&store, "B000000003").await;
        assert_eq!(failed.price.as_deref(), Some("40.00"));
        assert!(failed.next_check_at > now());

        let cheap = stored(&store, "B000000004").await;
        assert_eq!(cheap.next_check_at, now() + chrono::Duration::minutes(1440));

        let report_path = PathBuf::from(summary.report_path.clone().unwrap());
        assert!(report_path.ends_with(format!("{}/check_run.json", summary.run_id)));
        let report: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&report_path).unwrap()).unwrap();
        let items = report["items"].as_array().unwrap();
        assert_eq!(items.len(), 4);
        assert_eq!(items[2]["item_id"], "B000000003");
        assert!(items[2]["error"].as_str().unwrap().contains("proxied_http"));
        assert_eq!(items[0]["change_type"], "anomalous_drop");

        let digest = report_recent_runs(5, tmp.path()).unwrap();
        assert!(digest.contains(&summary.run_id.to_string()));
        assert!(digest.contains("`B000000003` failed"));
    }

    #[tokio::test]
    async fn items_not_yet_due_are_left_alone() {
        let mut later = item("B000000009", Some("10.00"), 0, 0.0);
        later.next_check_at = now() + chrono::Duration::minutes(5);
        let store = Arc::new(MemoryItemStore::new([later.clone()]));
        let direct = ScriptedTier::new(FetchStrategy::DirectHttp, [("B000000009", priced("5.00"))]);
        let pipeline = CheckPipeline::new(
            config(None),
            store.clone(),
            FetchTiers::new(direct),
            Arc::new(MemoryEventSink::default()),
        );

        let summary = pipeline.run_at(now()).await.unwrap();

        assert_eq!(summary.dispatched, 0);
        assert_eq!(summary.report_path, None);
        assert_eq!(stored(&store, "B000000009").await, later);
    }

    #[tokio::test]
    async fn sink_failure_keeps_the_stored_price() {
        let store = Arc::new(MemoryItemStore::new([item("B000000001", Some("100.00"), 0, 0.0)]));
        let direct = ScriptedTier::new(FetchStrategy::DirectHttp, [("B000000001", priced("90.00"))]);
        let pipeline = CheckPipeline::new(config(None), store.clone(), FetchTiers::new(direct), Arc::new(FailingSink));

        let summary = pipeline.run_at(now()).await.unwrap();

        assert_eq!(summary.failed, 1);
        let after = stored(&store, "B000000001").await;
        assert_eq!(after.price.as_deref(), Some("100.00"));
        assert_eq!(after.next_check_at, now() + chrono::Duration::minutes(240));
    }

    #[tokio::test]
    async fn unchanged_price_emits_nothing() {
        let store = Arc::new(MemoryItemStore::new([item("B000000001", Some("100.00"), 0, 0.0)]));
        let direct = ScriptedTier::new(FetchStrategy::DirectHttp, [("B000000001", priced("100.00"))]);
        let sink = Arc::new(MemoryEventSink::default());
        let pipeline = CheckPipeline::new(config(None), store, FetchTiers::new(direct), sink.clone());

        let summary = pipeline.run_at(now()).await.unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.price_changes, 0);
        assert!(sink.events().await.is_empty());
    }

    #[tokio::test]
    async fn overlapping_tick_is_skipped_while_one_runs() {
        let store = Arc::new(MemoryItemStore::new([item("B000000001", Some("100.00"), 0, 0.0)]));
        let direct = ScriptedTier::new(FetchStrategy::DirectHttp, [("B000000001", priced("90.00"))]);
        let pipeline = CheckPipeline::new(
            config(None),
            store.clone(),
            FetchTiers::new(direct),
            Arc::new(MemoryEventSink::default()),
        );

        let running = pipeline.tick_lock.lock().await;
        assert!(pipeline.run_if_idle(now()).await.is_none());
        assert_eq!(stored(&store, "B000000001").await.price.as_deref(), Some("100.00"));
        drop(running);

        let summary = pipeline.run_if_idle(now()).await.expect("idle pipeline runs").unwrap();
        assert_eq!(summary.dispatched, 1);
        assert_eq!(stored(&store, "B000000001").await.price.as_deref(), Some("90.00"));
    }

    #[test]
    fn dispatch_prefers_priority_then_oldest_and_respects_limit() {
        let mut oldest_quiet = item("B000000001", None, 0, 0.0);
        oldest_quiet.next_check_at = now() - chrono::Duration::hours(3);
        let mut hot = item("B000000002", None, 999, 0.9);
        hot.next_check_at = now() - chrono::Duration::minutes(1);
        let mut warm_old = item("B000000003", None, 9, 0.4);
        warm_old.next_check_at = now() - chrono::Duration::hours(2);
        let mut warm_new = item("B000000004", None, 9, 0.4);
        warm_new.next_check_at = now() - chrono::Duration::minutes(2);

        let picked = select_for_dispatch(vec![oldest_quiet, warm_new, hot, warm_old], 3);
        let ids = picked.iter().map(|i| i.item_id.as_str()).collect::<Vec<_>>();

        assert_eq!(ids, vec!["B000000002", "B000000003", "B000000004"]);
    }

    #[test]
    fn price_events_follow_the_classification() {
        let state = item("B000000001", Some("100.00"), 0, 0.0);
        let page = ExtractionResult {
            price: Some("110.00".into()),
            in_stock: false,
            title: None,
            blocked: false,
        };
        let change = analyze_price_change(Some("100.00"), "110.00", Some("80.00")).unwrap();

        let events = price_events(&state, &page, "110.00", &change);

        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            MonitorEvent::PriceChanged {
                change_type: PriceChangeType::PriceIncrease,
                unverified: false,
                in_stock: false,
                old_price: Some(old),
                ..
            } if old == "100.00"
        ));
    }
}
