//! Collection pipeline: config, source registry, normalization, geocoding and
//! per-source run orchestration.

mod geocode;
mod normalize;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use devwatch_adapters::{
    adapter_for_source, AdapterContext, ArcGisParcelLocator, FetchError, FixtureReplayAdapter,
    SourceAdapter, SourceKind, SOURCE_IDS, STORMWATER,
};
use devwatch_core::{CollectionRun, Coordinates, RunStatus, RunTally};
use devwatch_storage::{HttpClientConfig, HttpFetcher, ProjectStore};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, info_span, warn, Instrument};

pub use geocode::{GeocodeResolver, ResolutionError};
pub use normalize::{map_status, NormalizationError, Normalized, Normalizer};

pub const CRATE_NAME: &str = "devwatch-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    #[default]
    Live,
    Fixture,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: SourceMode,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub fixture_path: Option<PathBuf>,
    /// Place records without coordinates at the registry's fallback point.
    #[serde(default)]
    pub approximate_placement: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_true() -> bool {
    true
}

impl SourceConfig {
    fn builtin(source_id: &str, display_name: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            display_name: display_name.to_string(),
            enabled: true,
            mode: SourceMode::Live,
            endpoint: None,
            fixture_path: None,
            approximate_placement: false,
            notes: None,
        }
    }

    /// Captured payload used when `mode: fixture`, relative to the workspace root.
    pub fn fixture_path(&self) -> PathBuf {
        self.fixture_path.clone().unwrap_or_else(|| {
            let file = if self.source_id == STORMWATER {
                "sample.html"
            } else {
                "sample.json"
            };
            PathBuf::from("fixtures").join(&self.source_id).join(file)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FallbackPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl Default for FallbackPoint {
    fn default() -> Self {
        Self {
            latitude: 32.530988,
            longitude: -79.195347,
        }
    }
}

impl From<FallbackPoint> for Coordinates {
    fn from(p: FallbackPoint) -> Self {
        Coordinates::new(p.latitude, p.longitude)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub fallback_point: FallbackPoint,
}

impl SourceRegistry {
    pub fn builtin() -> Self {
        Self {
            sources: vec![
                SourceConfig::builtin("planning_council", "Planning Council Agenda"),
                SourceConfig::builtin("dhec", "DHEC Permit Public Notices"),
                SourceConfig::builtin("water", "Water Utility Developer Projects"),
                SourceConfig::builtin("stormwater", "Stormwater Construction Notices"),
            ],
            fallback_point: FallbackPoint::default(),
        }
    }

    /// Reads `sources.yaml` under `workspace_root`, or the built-in registry if absent.
    pub async fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("sources.yaml");
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no source registry file; using built-ins");
                return Ok(Self::builtin());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", path.display()));
            }
        };
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text)?;
        let mut seen = std::collections::BTreeSet::new();
        for source in &registry.sources {
            anyhow::ensure!(
                seen.insert(source.source_id.as_str()),
                "source {} is listed twice",
                source.source_id
            );
        }
        Ok(registry)
    }

    pub fn find(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub geocode_timeout_secs: u64,
    pub run_timeout_secs: u64,
    pub workspace_root: PathBuf,
    pub web_port: u16,
}

fn env_number<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://data/projects.db?mode=rwc".to_string()),
            user_agent: std::env::var("DEVWATCH_USER_AGENT")
                .unwrap_or_else(|_| format!("devwatch/{}", env!("CARGO_PKG_VERSION"))),
            http_timeout_secs: env_number("DEVWATCH_HTTP_TIMEOUT_SECS", 30),
            geocode_timeout_secs: env_number("DEVWATCH_GEOCODE_TIMEOUT_SECS", 10),
            run_timeout_secs: env_number("DEVWATCH_RUN_TIMEOUT_SECS", 300),
            workspace_root: std::env::var("DEVWATCH_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            web_port: env_number("DEVWATCH_WEB_PORT", 8000),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    /// Geocode lookups are one attempt each, bounded by their own timeout.
    pub fn geocode_client_config(&self) -> HttpClientConfig {
        HttpClientConfig::single_attempt(
            Duration::from_secs(self.geocode_timeout_secs),
            Some(self.user_agent.clone()),
        )
    }
}

/// Phases a source run moves through before reaching a terminal `RunStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Pending,
    Fetching,
    Normalizing,
    Upserting,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunPhase::Pending => "pending",
            RunPhase::Fetching => "fetching",
            RunPhase::Normalizing => "normalizing",
            RunPhase::Upserting => "upserting",
        })
    }
}

/// A source whose run record could not be opened or finalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFailure {
    pub source_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectionReport {
    pub runs: Vec<CollectionRun>,
    pub unknown_sources: Vec<String>,
    pub failed_sources: Vec<SourceFailure>,
}

impl CollectionReport {
    /// True when any requested source failed or was not recognised.
    pub fn has_failures(&self) -> bool {
        !self.unknown_sources.is_empty()
            || !self.failed_sources.is_empty()
            || self.runs.iter().any(|r| r.status.is_failure())
    }
}

fn saturating_count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

pub struct CollectionOrchestrator {
    store: ProjectStore,
    http: HttpFetcher,
    resolver: Option<GeocodeResolver>,
    registry: SourceRegistry,
    workspace_root: PathBuf,
    run_timeout: Duration,
}

impl CollectionOrchestrator {
    /// Wires the live HTTP fetcher and the county parcel locator from `config`.
    pub fn new(config: &SyncConfig, store: ProjectStore, registry: SourceRegistry) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        let geocode_http = HttpFetcher::new(config.geocode_client_config())?;
        let resolver = GeocodeResolver::new(
            store.clone(),
            Arc::new(ArcGisParcelLocator::new(geocode_http)),
        );
        Ok(Self {
            store,
            http,
            resolver: Some(resolver),
            registry,
            workspace_root: config.workspace_root.clone(),
            run_timeout: Duration::from_secs(config.run_timeout_secs),
        })
    }

    pub fn with_resolver(mut self, resolver: Option<GeocodeResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_run_timeout(mut self, run_timeout: Duration) -> Self {
        self.run_timeout = run_timeout;
        self
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// Runs one named source, or every enabled source when `requested` is `None`.
    ///
    /// Sources run one after another; a failed source never stops the rest.
    pub async fn collect(&self, requested: Option<&str>) -> Result<CollectionReport> {
        let mut report = CollectionReport::default();
        let selected: Vec<&SourceConfig> = match requested {
            Some(name) => match self.registry.find(name) {
                Some(source) => vec![source],
                None => {
                    warn!(source_id = name, known = ?SOURCE_IDS, "unknown source");
                    report.unknown_sources.push(name.to_string());
                    return Ok(report);
                }
            },
            None => self.registry.enabled().collect(),
        };

        for source in selected {
            let Some(adapter) = self.build_adapter(source) else {
                warn!(source_id = %source.source_id, "no adapter registered for source");
                report.unknown_sources.push(source.source_id.clone());
                continue;
            };
            let placement = source
                .approximate_placement
                .then(|| Coordinates::from(self.registry.fallback_point));
            match self.collect_with_adapter(adapter.as_ref(), placement).await {
                Ok(run) => report.runs.push(run),
                Err(err) => {
                    let message = format!("{err:#}");
                    warn!(source_id = %source.source_id, error = %message, "run record unavailable");
                    report.failed_sources.push(SourceFailure {
                        source_id: source.source_id.clone(),
                        message,
                    });
                }
            }
        }
        Ok(report)
    }

    fn build_adapter(&self, source: &SourceConfig) -> Option<Box<dyn SourceAdapter>> {
        let adapter = adapter_for_source(&source.source_id, source.endpoint.as_deref())?;
        Some(match source.mode {
            SourceMode::Live => adapter,
            SourceMode::Fixture => Box::new(FixtureReplayAdapter::new(
                adapter,
                self.workspace_root.join(source.fixture_path()),
            )),
        })
    }

    /// Drives one adapter through fetch, normalize and upsert, recording exactly
    /// one collection run. Errors are returned only when the run record itself
    /// cannot be written.
    pub async fn collect_with_adapter(
        &self,
        adapter: &dyn SourceAdapter,
        approximate_placement: Option<Coordinates>,
    ) -> Result<CollectionRun> {
        let source_id = adapter.source_id();
        let mut run = self
            .store
            .begin_run(source_id, Utc::now())
            .await
            .with_context(|| format!("opening collection run for {source_id}"))?;
        let span = info_span!("collect_source", source_id, run_id = %run.run_id);

        let mut tally = RunTally::default();
        let outcome = tokio::time::timeout(
            self.run_timeout,
            self.drive(adapter, &run, approximate_placement, &mut tally)
                .instrument(span.clone()),
        )
        .await;

        let (status, error_message) = match outcome {
            Ok(Ok(())) => (tally.completed_status(), None),
            Ok(Err(err)) => (RunStatus::Failed, Some(err.to_string())),
            Err(_) => (
                RunStatus::Failed,
                Some(format!(
                    "run timed out after {}s",
                    self.run_timeout.as_secs_f64()
                )),
            ),
        };
        run.finished_at = Some(Utc::now());
        run.status = status;
        run.tally = tally;
        run.error_message = error_message;

        self.store
            .finish_run(&run)
            .await
            .with_context(|| format!("finalizing collection run {}", run.run_id))?;

        span.in_scope(|| match run.status {
            RunStatus::Failed => warn!(
                records_seen = tally.records_seen,
                records_written = tally.records_written,
                error = run.error_message.as_deref().unwrap_or_default(),
                "collection failed"
            ),
            status => info!(
                %status,
                records_seen = tally.records_seen,
                records_inserted = tally.records_inserted,
                records_updated = tally.records_updated,
                records_excluded = tally.records_excluded,
                record_failures = tally.record_failures(),
                geocode_failures = tally.geocode_failures,
                "collection finished"
            ),
        });
        Ok(run)
    }

    async fn drive(
        &self,
        adapter: &dyn SourceAdapter,
        run: &CollectionRun,
        approximate_placement: Option<Coordinates>,
        tally: &mut RunTally,
    ) -> Result<(), FetchError> {
        let mut phase = RunPhase::Pending;
        debug!(%phase, "run opened");

        phase = RunPhase::Fetching;
        debug!(%phase, "fetching");
        let ctx = AdapterContext {
            run_id: run.run_id,
            fetched_at: Utc::now(),
        };
        let items = adapter.fetch_raw(&self.http, &ctx).await?;
        tally.records_seen = saturating_count(items.len());

        phase = RunPhase::Normalizing;
        debug!(%phase, items = items.len(), "normalizing");
        let normalizer = Normalizer::today();
        let mut staged = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            match normalizer.normalize(adapter, item) {
                Ok(Normalized::Record {
                    record,
                    geocode_queries,
                }) => staged.push((record, geocode_queries)),
                Ok(Normalized::Excluded { reason }) => {
                    tally.records_excluded += 1;
                    debug!(index, reason, "excluded");
                }
                Err(err) => {
                    tally.normalize_failures += 1;
                    warn!(index, error = %err, "normalization failed");
                }
            }
        }

        phase = RunPhase::Upserting;
        debug!(%phase, records = staged.len(), "upserting");
        for (mut record, geocode_queries) in staged {
            if record.coordinates().is_none() && !geocode_queries.is_empty() {
                if let Some(resolver) = &self.resolver {
                    match resolver.resolve_first(&geocode_queries).await {
                        Ok(coords) => record.set_coordinates(Some(coords)),
                        Err(err) => {
                            tally.geocode_failures += 1;
                            warn!(
                                project_id = %record.project_id,
                                candidates = geocode_queries.len(),
                                error = %err,
                                "geocode failed"
                            );
                        }
                    }
                }
            }
            if record.coordinates().is_none() {
                if let Some(point) = approximate_placement {
                    record.set_coordinates(Some(point));
                    record.location_approximate = true;
                }
            }

            match self.store.upsert_project(&record).await {
                Ok(outcome) => tally.record_write(outcome),
                Err(err) => {
                    tally.store_failures += 1;
                    warn!(project_id = %record.project_id, error = %err, "upsert failed");
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub source_id: String,
    pub display_name: String,
    pub kind: Option<SourceKind>,
    pub enabled: bool,
    pub notes: Option<String>,
    pub project_count: u64,
    pub latest_run: Option<CollectionRun>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub total_projects: u64,
    pub sources: Vec<SourceStatus>,
}

/// Project counts and the latest run for every registered or stored source.
pub async fn status_report(store: &ProjectStore, registry: &SourceRegistry) -> Result<StatusReport> {
    let counts = store
        .count_projects_by_source()
        .await
        .context("counting projects")?;
    let mut latest: BTreeMap<String, CollectionRun> = store
        .latest_runs()
        .await
        .context("loading latest runs")?
        .into_iter()
        .map(|run| (run.source.clone(), run))
        .collect();

    let mut sources = Vec::new();
    for source in &registry.sources {
        sources.push(SourceStatus {
            source_id: source.source_id.clone(),
            display_name: source.display_name.clone(),
            kind: source_kind(&source.source_id),
            enabled: source.enabled,
            notes: source.notes.clone(),
            project_count: counts.get(&source.source_id).copied().unwrap_or(0),
            latest_run: latest.remove(&source.source_id),
        });
    }
    for (source_id, count) in &counts {
        if registry.find(source_id).is_none() {
            sources.push(SourceStatus {
                source_id: source_id.clone(),
                display_name: title_case(source_id),
                kind: source_kind(source_id),
                enabled: false,
                notes: None,
                project_count: *count,
                latest_run: latest.remove(source_id),
            });
        }
    }

    Ok(StatusReport {
        total_projects: counts.values().sum(),
        sources,
    })
}

fn source_kind(source_id: &str) -> Option<SourceKind> {
    adapter_for_source(source_id, None).map(|adapter| adapter.kind())
}

fn title_case(source_id: &str) -> String {
    source_id
        .split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

impl StatusReport {
    pub fn to_text(&self) -> String {
        let mut out = format!("Total projects: {}\n", self.total_projects);
        for source in &self.sources {
            let run = match &source.latest_run {
                Some(run) => format!(
                    "{} at {} (seen {}, written {})",
                    run.status,
                    run.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
                    run.tally.records_seen,
                    run.tally.records_written
                ),
                None => "never collected".to_string(),
            };
            out.push_str(&format!(
                "  {:<18} {:<6} {:>6} projects  {}\n",
                source.source_id,
                source.kind.map_or("-", |k| k.as_str()),
                source.project_count,
                run
            ));
            if let Some(notes) = &source.notes {
                out.push_str(&format!("  {:<18} {notes}\n", ""));
            }
        }
        out
    }

    /// One-line summary for automated data commits, counting records written
    /// by each source's latest successful run.
    pub fn to_commit_message(&self) -> String {
        let updated: Vec<u32> = self
            .sources
            .iter()
            .filter_map(|s| s.latest_run.as_ref())
            .filter(|run| !run.status.is_failure() && run.tally.records_written > 0)
            .map(|run| run.tally.records_written)
            .collect();
        let total: u64 = updated.iter().map(|&n| u64::from(n)).sum();
        format!("Updated {total} projects from {} sources", updated.len())
    }

    /// Markdown summary suitable for a CI step summary.
    pub fn to_markdown(&self) -> String {
        let mut lines = vec![
            format!("**Total Projects:** {}", self.total_projects),
            String::new(),
            "**Collection Status:**".to_string(),
        ];
        for source in &self.sources {
            if let Some(run) = &source.latest_run {
                let mark = if run.status.is_failure() { "❌" } else { "✅" };
                lines.push(format!(
                    "- {mark} {}: {} new records ({})",
                    source.display_name, run.tally.records_inserted, run.status
                ));
            }
        }
        lines.push(String::new());
        lines.push("**Projects by Source:**".to_string());
        for source in &self.sources {
            lines.push(format!("- {}: {}", source.display_name, source.project_count));
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use devwatch_adapters::{ExtractedFields, FetchedPage, RawItem, SourceKind, PLANNING_COUNCIL};
    use devwatch_core::ProjectStatus;
    use serde_json::json;

    use super::geocode::testing::CountingProvider;
    use super::*;

    /// Serves a fixed list of items; ids come from `"id"`, queries from `"parcel"`
    /// (one string or a list).
    struct StubAdapter {
        items: Vec<serde_json::Value>,
        fail_fetch: bool,
    }

    impl StubAdapter {
        fn with_items(items: Vec<serde_json::Value>) -> Self {
            Self {
                items,
                fail_fetch: false,
            }
        }
    }

    #[async_trait]
    impl SourceAdapter for StubAdapter {
        fn source_id(&self) -> &'static str {
            PLANNING_COUNCIL
        }

        fn kind(&self) -> SourceKind {
            SourceKind::JsonApi
        }

        async fn fetch_page(
            &self,
            _http: &HttpFetcher,
            ctx: &AdapterContext,
        ) -> Result<FetchedPage, FetchError> {
            if self.fail_fetch {
                return Err(FetchError::Service {
                    url: "https://stub.test/query".into(),
                    message: "connection reset".into(),
                });
            }
            Ok(FetchedPage {
                url: "https://stub.test/query".into(),
                content_type: "application/json".into(),
                body: serde_json::to_vec(&self.items).unwrap(),
                fetched_at: ctx.fetched_at,
            })
        }

        fn parse_page(&self, page: &FetchedPage) -> Result<Vec<RawItem>, FetchError> {
            let values: Vec<serde_json::Value> = serde_json::from_slice(&page.body).unwrap();
            Ok(values.into_iter().map(RawItem::new).collect())
        }

        fn extract(&self, item: &RawItem) -> ExtractedFields {
            let p = &item.payload;
            ExtractedFields {
                project_id: p["id"].as_str().map(String::from),
                name: p["name"].as_str().map(String::from),
                status: p["status"].as_str().map(String::from),
                latitude: p["lat"].as_f64(),
                longitude: p["lon"].as_f64(),
                geocode_queries: match &p["parcel"] {
                    serde_json::Value::String(query) => vec![query.clone()],
                    serde_json::Value::Array(queries) => queries
                        .iter()
                        .filter_map(|q| q.as_str().map(String::from))
                        .collect(),
                    _ => Vec::new(),
                },
                ..Default::default()
            }
        }

        fn exclusion_reason(&self, item: &RawItem) -> Option<&'static str> {
            item.payload["skip"].as_bool().unwrap_or(false).then_some("skipped")
        }
    }

    fn orchestrator(store: &ProjectStore) -> CollectionOrchestrator {
        let config = SyncConfig::from_env();
        CollectionOrchestrator::new(&config, store.clone(), SourceRegistry::builtin())
            .unwrap()
            .with_resolver(None)
    }

    #[tokio::test]
    async fn normalization_failures_make_a_run_partial() {
        let store = ProjectStore::in_memory().await.unwrap();
        let mut items: Vec<_> = (0..8)
            .map(|i| json!({"id": format!("P-{i}"), "name": "Case", "status": "Pending"}))
            .collect();
        items.push(json!({"name": "no id"}));
        items.push(json!({"id": "   "}));
        let adapter = StubAdapter::with_items(items);

        let run = orchestrator(&store)
            .collect_with_adapter(&adapter, None)
            .await
            .unwrap();

        assert_eq!(run.tally.records_seen, 10);
        assert_eq!(run.tally.records_written, 8);
        assert_eq!(run.tally.normalize_failures, 2);
        assert_eq!(run.status, RunStatus::PartiallyFailed);

        let stored = store.get_run(run.run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::PartiallyFailed);
        assert!(stored.finished_at.is_some());
        assert_eq!(store.list_projects().await.unwrap().len(), 8);
    }

    #[tokio::test]
    async fn fetch_error_fails_the_run_with_zero_counts() {
        let store = ProjectStore::in_memory().await.unwrap();
        let adapter = StubAdapter {
            items: Vec::new(),
            fail_fetch: true,
        };

        let run = orchestrator(&store)
            .collect_with_adapter(&adapter, None)
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.tally.records_seen, 0);
        assert_eq!(run.tally.records_written, 0);
        let stored = store.get_run(run.run_id).await.unwrap().unwrap();
        assert!(stored
            .error_message
            .as_deref()
            .is_some_and(|m| m.contains("connection reset")));
    }

    #[tokio::test]
    async fn repeated_collection_updates_in_place() {
        let store = ProjectStore::in_memory().await.unwrap();
        let orchestrator = orchestrator(&store);

        let first = StubAdapter::with_items(vec![json!({"id": "P-100", "status": "Pending"})]);
        let run = orchestrator.collect_with_adapter(&first, None).await.unwrap();
        assert_eq!(run.tally.records_inserted, 1);

        let second = StubAdapter::with_items(vec![json!({"id": "P-100", "status": "Active"})]);
        let run = orchestrator.collect_with_adapter(&second, None).await.unwrap();
        assert_eq!(run.tally.records_updated, 1);
        assert_eq!(run.status, RunStatus::Succeeded);

        let projects = store.list_projects().await.unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].record.status, ProjectStatus::Active);
        assert_eq!(store.recent_runs(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn geocoding_fills_missing_coordinates_once_per_query() {
        let store = ProjectStore::in_memory().await.unwrap();
        let provider = Arc::new(CountingProvider::with_answer(
            "559-13-00-030",
            Coordinates::new(32.8331, -79.8288),
        ));
        let orchestrator = orchestrator(&store)
            .with_resolver(Some(GeocodeResolver::new(store.clone(), provider.clone())));
        let adapter = StubAdapter::with_items(vec![
            json!({"id": "S-1", "parcel": "559-13-00-030"}),
            json!({"id": "S-2", "parcel": "559-13-00-030"}),
            json!({"id": "S-3", "parcel": "999-99-99-999"}),
            json!({"id": "S-4", "lat": 32.8, "lon": -79.9, "parcel": "999-99-99-999"}),
        ]);

        let run = orchestrator
            .collect_with_adapter(&adapter, None)
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Succeeded, "geocode misses are not record failures");
        assert_eq!(run.tally.geocode_failures, 1);
        assert_eq!(provider.calls(), 2);
        let s1 = store.get_project(PLANNING_COUNCIL, "S-1").await.unwrap().unwrap();
        assert_eq!(s1.record.latitude, Some(32.8331));
        let s3 = store.get_project(PLANNING_COUNCIL, "S-3").await.unwrap().unwrap();
        assert_eq!(s3.record.coordinates(), None);
    }

    #[tokio::test]
    async fn geocoding_walks_every_parcel_until_one_resolves() {
        let store = ProjectStore::in_memory().await.unwrap();
        let provider = Arc::new(CountingProvider::with_answer(
            "559-13-00-031",
            Coordinates::new(32.8331, -79.8288),
        ));
        let orchestrator = orchestrator(&store)
            .with_resolver(Some(GeocodeResolver::new(store.clone(), provider.clone())));
        let adapter = StubAdapter::with_items(vec![
            json!({"id": "S-1", "parcel": ["559-13-00-030", "559-13-00-031"]}),
            json!({"id": "S-2", "parcel": ["537-00-00-085", "537-00-00-084"]}),
        ]);
        let fallback = Coordinates::from(FallbackPoint::default());

        let run = orchestrator
            .collect_with_adapter(&adapter, Some(fallback))
            .await
            .unwrap();

        assert_eq!(run.tally.geocode_failures, 1, "only S-2 missed on every parcel");
        assert_eq!(provider.calls(), 4);
        let s1 = store.get_project(PLANNING_COUNCIL, "S-1").await.unwrap().unwrap();
        assert_eq!(s1.record.coordinates(), Some(Coordinates::new(32.8331, -79.8288)));
        assert!(!s1.record.location_approximate);
        let s2 = store.get_project(PLANNING_COUNCIL, "S-2").await.unwrap().unwrap();
        assert_eq!(s2.record.coordinates(), Some(fallback));
        assert!(s2.record.location_approximate);
    }

    #[tokio::test]
    async fn failed_record_write_is_skipped_and_counted() {
        let store = ProjectStore::in_memory().await.unwrap();
        sqlx::query(
            "CREATE TRIGGER reject_p3 BEFORE INSERT ON projects WHEN NEW.project_id = 'P-3' \
             BEGIN SELECT RAISE(ABORT, 'write rejected'); END",
        )
        .execute(store.pool())
        .await
        .unwrap();
        let adapter = StubAdapter::with_items(
            (1..=5)
                .map(|i| json!({"id": format!("P-{i}"), "status": "Pending"}))
                .collect(),
        );

        let run = orchestrator(&store)
            .collect_with_adapter(&adapter, None)
            .await
            .unwrap();

        assert_eq!(run.tally.records_seen, 5);
        assert_eq!(run.tally.records_written, 4);
        assert_eq!(run.tally.store_failures, 1);
        assert_eq!(run.tally.record_failures(), 1);
        assert_eq!(run.status, RunStatus::PartiallyFailed);
        assert!(store.get_project(PLANNING_COUNCIL, "P-3").await.unwrap().is_none());
        assert!(store.get_project(PLANNING_COUNCIL, "P-5").await.unwrap().is_some());
        let stored = store.get_run(run.run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::PartiallyFailed);
        assert_eq!(stored.tally.store_failures, 1);
    }

    fn fixture_source(source_id: &str, file: &str) -> SourceConfig {
        SourceConfig {
            mode: SourceMode::Fixture,
            fixture_path: Some(
                PathBuf::from(env!("CARGO_MANIFEST_DIR"))
                    .join("../../fixtures")
                    .join(source_id)
                    .join(file),
            ),
            ..SourceConfig::builtin(source_id, source_id)
        }
    }

    #[tokio::test]
    async fn unwritable_run_record_does_not_stop_later_sources() {
        let store = ProjectStore::in_memory().await.unwrap();
        sqlx::query(
            "CREATE TRIGGER reject_dhec_runs BEFORE INSERT ON collection_runs \
             WHEN NEW.source = 'dhec' BEGIN SELECT RAISE(ABORT, 'runs table locked'); END",
        )
        .execute(store.pool())
        .await
        .unwrap();
        let registry = SourceRegistry {
            sources: vec![
                fixture_source("dhec", "sample.json"),
                fixture_source("water", "sample.json"),
            ],
            fallback_point: FallbackPoint::default(),
        };
        let orchestrator =
            CollectionOrchestrator::new(&SyncConfig::from_env(), store.clone(), registry)
                .unwrap()
                .with_resolver(None);

        let report = orchestrator.collect(None).await.unwrap();

        assert!(report.has_failures());
        assert_eq!(report.failed_sources.len(), 1);
        assert_eq!(report.failed_sources[0].source_id, "dhec");
        assert!(report.failed_sources[0].message.contains("runs table locked"));
        assert_eq!(report.runs.len(), 1);
        assert_eq!(report.runs[0].source, "water");
        assert!(report.runs[0].tally.records_written > 0);
        assert_eq!(store.recent_runs(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn approximate_placement_uses_fallback_point() {
        let store = ProjectStore::in_memory().await.unwrap();
        let adapter = StubAdapter::with_items(vec![
            json!({"id": "A-1"}),
            json!({"id": "A-2", "lat": 32.8, "lon": -79.9}),
        ]);
        let fallback = Coordinates::from(FallbackPoint::default());

        orchestrator(&store)
            .collect_with_adapter(&adapter, Some(fallback))
            .await
            .unwrap();

        let a1 = store.get_project(PLANNING_COUNCIL, "A-1").await.unwrap().unwrap();
        assert_eq!(a1.record.coordinates(), Some(fallback));
        assert!(a1.record.location_approximate);
        let a2 = store.get_project(PLANNING_COUNCIL, "A-2").await.unwrap().unwrap();
        assert!(!a2.record.location_approximate);
    }

    /// Provider that stalls long enough to push a run past its timeout.
    struct SlowProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl devwatch_adapters::GeocodeProvider for SlowProvider {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn lookup(&self, _query: &str) -> Result<Coordinates, devwatch_adapters::LookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(Coordinates::new(32.8, -79.8))
        }
    }

    #[tokio::test]
    async fn timed_out_run_is_failed_and_keeps_partial_counts() {
        let store = ProjectStore::in_memory().await.unwrap();
        let provider = Arc::new(SlowProvider {
            calls: AtomicUsize::new(0),
        });
        let orchestrator = orchestrator(&store)
            .with_resolver(Some(GeocodeResolver::new(store.clone(), provider)))
            .with_run_timeout(Duration::from_millis(300));
        let adapter = StubAdapter::with_items(
            (0..5)
                .map(|i| json!({"id": format!("T-{i}"), "parcel": format!("100-00-00-00{i}")}))
                .collect(),
        );

        let run = orchestrator
            .collect_with_adapter(&adapter, None)
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.tally.records_seen, 5);
        assert!(run.tally.records_written < 5);
        let stored = store.get_run(run.run_id).await.unwrap().unwrap();
        assert!(stored.error_message.unwrap().contains("timed out"));
        assert_eq!(stored.tally.records_seen, 5);
    }

    #[tokio::test]
    async fn unknown_source_is_reported_without_a_run() {
        let store = ProjectStore::in_memory().await.unwrap();
        let report = orchestrator(&store)
            .collect(Some("charleston_county"))
            .await
            .unwrap();
        assert!(report.has_failures());
        assert_eq!(report.unknown_sources, vec!["charleston_county"]);
        assert!(store.recent_runs(5).await.unwrap().is_empty());
    }

    #[test]
    fn registry_yaml_defaults_and_duplicates() {
        let registry = SourceRegistry::from_yaml(
            r#"
sources:
  - source_id: stormwater
    display_name: Stormwater Notices
    mode: fixture
    approximate_placement: true
  - source_id: dhec
    display_name: DHEC
    enabled: false
    notes: Statewide notices filtered to the town.
"#,
        )
        .unwrap();
        let storm = registry.find("stormwater").unwrap();
        assert!(storm.enabled);
        assert_eq!(storm.mode, SourceMode::Fixture);
        assert_eq!(
            storm.fixture_path(),
            PathBuf::from("fixtures/stormwater/sample.html")
        );
        assert_eq!(registry.enabled().count(), 1);
        assert_eq!(
            registry.find("dhec").and_then(|s| s.notes.as_deref()),
            Some("Statewide notices filtered to the town.")
        );
        assert_eq!(registry.fallback_point, FallbackPoint::default());

        let dup = SourceRegistry::from_yaml(
            "sources:\n  - {source_id: dhec, display_name: a}\n  - {source_id: dhec, display_name: b}\n",
        );
        assert!(dup.is_err());
    }

    #[tokio::test]
    async fn status_report_lists_counts_and_latest_runs() {
        let store = ProjectStore::in_memory().await.unwrap();
        let adapter = StubAdapter::with_items(vec![json!({"id": "P-1"}), json!({"id": "P-2"})]);
        orchestrator(&store)
            .collect_with_adapter(&adapter, None)
            .await
            .unwrap();

        let report = status_report(&store, &SourceRegistry::builtin()).await.unwrap();
        assert_eq!(report.total_projects, 2);
        let planning = &report.sources[0];
        assert_eq!(planning.project_count, 2);
        assert_eq!(
            planning.latest_run.as_ref().map(|r| r.status),
            Some(RunStatus::Succeeded)
        );
        assert_eq!(planning.kind, Some(SourceKind::ArcGisFeatures));
        assert!(report.sources[1].latest_run.is_none());
        assert!(report.to_text().contains("never collected"));
        assert_eq!(report.to_commit_message(), "Updated 2 projects from 1 sources");
        assert!(report
            .to_markdown()
            .contains("- ✅ Planning Council Agenda: 2 new records"));
    }
}
