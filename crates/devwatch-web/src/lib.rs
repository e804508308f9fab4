//! Read-only dashboard: Askama summary page plus JSON project, marker and run APIs.

use std::sync::Arc;

use anyhow::Context;
use askama::Template;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use devwatch_core::{CollectionRun, ProjectStatus, StoredProject};
use devwatch_storage::ProjectStore;
use devwatch_sync::{status_report, SourceRegistry, SyncConfig};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "devwatch-web";

const DEFAULT_PER_PAGE: usize = 50;
const MAX_PER_PAGE: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub store: ProjectStore,
    pub registry: SourceRegistry,
}

impl AppState {
    pub fn new(store: ProjectStore, registry: SourceRegistry) -> Self {
        Self { store, registry }
    }
}

/// Marker color per source; unknown sources are gray.
pub fn source_color(source: &str) -> &'static str {
    match source {
        "planning_council" => "blue",
        "dhec" => "green",
        "stormwater" => "orange",
        "water" => "purple",
        _ => "gray",
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct ProjectsQuery {
    pub source: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub status: Option<String>,
    pub q: Option<String>,
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

/// Parsed dashboard filters. Empty parameters mean "no constraint".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectFilter {
    pub source: Option<String>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub status: Option<ProjectStatus>,
    pub text: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn parse_date_param(name: &str, value: &Option<String>) -> Result<Option<NaiveDate>, String> {
    non_empty(value)
        .map(|raw| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .map_err(|_| format!("`{name}` must be a YYYY-MM-DD date, got {raw:?}"))
        })
        .transpose()
}

impl ProjectFilter {
    pub fn from_query(query: &ProjectsQuery) -> Result<Self, String> {
        let status = non_empty(&query.status)
            .map(|raw| {
                ProjectStatus::ALL
                    .into_iter()
                    .find(|s| s.as_str().eq_ignore_ascii_case(raw))
                    .ok_or_else(|| format!("unknown status {raw:?}"))
            })
            .transpose()?;
        Ok(Self {
            source: non_empty(&query.source).map(ToString::to_string),
            from: parse_date_param("from", &query.from)?,
            to: parse_date_param("to", &query.to)?,
            status,
            text: non_empty(&query.q).map(str::to_lowercase),
        })
    }

    pub fn matches(&self, project: &StoredProject) -> bool {
        let r = &project.record;
        if self.source.as_deref().is_some_and(|s| s != r.source) {
            return false;
        }
        if self.from.is_some_and(|from| r.application_date < from) {
            return false;
        }
        if self.to.is_some_and(|to| r.application_date > to) {
            return false;
        }
        if self.status.is_some_and(|status| status != r.status) {
            return false;
        }
        match &self.text {
            Some(needle) => [&r.name, &r.address, &r.description]
                .iter()
                .any(|field| field.to_lowercase().contains(needle.as_str())),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRow {
    pub source: String,
    pub project_id: String,
    pub name: String,
    pub description: String,
    pub status: ProjectStatus,
    pub source_status: String,
    pub address: String,
    pub application_date: NaiveDate,
    pub application_date_is_fallback: bool,
    pub collection_date: NaiveDate,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub location_approximate: bool,
    pub url: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl From<&StoredProject> for ProjectRow {
    fn from(p: &StoredProject) -> Self {
        let r = &p.record;
        Self {
            source: r.source.clone(),
            project_id: r.project_id.clone(),
            name: r.name.clone(),
            description: r.description.clone(),
            status: r.status,
            source_status: r.source_status.clone(),
            address: r.address.clone(),
            application_date: r.application_date,
            application_date_is_fallback: r.date_is_fallback,
            collection_date: r.collection_date,
            latitude: r.latitude,
            longitude: r.longitude,
            location_approximate: r.location_approximate,
            url: r.url.clone(),
            first_seen_at: p.first_seen_at,
            last_seen_at: p.last_seen_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectsPage {
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
    pub total_pages: usize,
    pub projects: Vec<ProjectRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Marker {
    pub source: String,
    pub project_id: String,
    pub name: String,
    pub status: ProjectStatus,
    pub latitude: f64,
    pub longitude: f64,
    pub color: String,
    pub approximate: bool,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkersResponse {
    pub markers: Vec<Marker>,
    /// Matching projects that cannot be placed on the map.
    pub unlocated: usize,
}

#[derive(Debug, Deserialize, Default)]
struct RunsQuery {
    limit: Option<u32>,
}

struct SourceSummaryRow {
    display_name: String,
    color: &'static str,
    project_count: u64,
    last_status: String,
    last_run_at: String,
}

struct RunSummaryRow {
    source: String,
    status: String,
    started_at: String,
    records_seen: u32,
    records_written: u32,
    error_message: String,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    title: String,
    total_projects: u64,
    sources: Vec<SourceSummaryRow>,
    runs: Vec<RunSummaryRow>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/projects", get(projects_handler))
        .route("/api/projects/{source}/{project_id}", get(project_detail_handler))
        .route("/api/markers", get(markers_handler))
        .route("/api/runs", get(runs_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &SyncConfig) -> anyhow::Result<()> {
    let store = ProjectStore::connect_read_only(&config.database_url)
        .await
        .with_context(|| format!("opening {} read-only", config.database_url))?;
    let registry = SourceRegistry::load(&config.workspace_root).await?;
    let listener = TcpListener::bind(("0.0.0.0", config.web_port))
        .await
        .with_context(|| format!("binding port {}", config.web_port))?;
    info!(port = config.web_port, "dashboard listening");
    axum::serve(listener, app(AppState::new(store, registry))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(&SyncConfig::from_env()).await
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let report = match status_report(&state.store, &state.registry).await {
        Ok(report) => report,
        Err(err) => return server_error(err),
    };
    let runs = match state.store.recent_runs(10).await {
        Ok(runs) => runs,
        Err(err) => return server_error(err.into()),
    };

    let sources = report
        .sources
        .iter()
        .map(|s| SourceSummaryRow {
            display_name: s.display_name.clone(),
            color: source_color(&s.source_id),
            project_count: s.project_count,
            last_status: s
                .latest_run
                .as_ref()
                .map_or_else(|| "never collected".to_string(), |r| r.status.to_string()),
            last_run_at: s
                .latest_run
                .as_ref()
                .map(|r| r.started_at.format("%Y-%m-%d %H:%M UTC").to_string())
                .unwrap_or_default(),
        })
        .collect();

    render_html(IndexTemplate {
        title: "Development Project Watch".to_string(),
        total_projects: report.total_projects,
        sources,
        runs: runs.iter().map(run_summary_row).collect(),
    })
}

fn run_summary_row(run: &CollectionRun) -> RunSummaryRow {
    RunSummaryRow {
        source: run.source.clone(),
        status: run.status.to_string(),
        started_at: run.started_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        records_seen: run.tally.records_seen,
        records_written: run.tally.records_written,
        error_message: run.error_message.clone().unwrap_or_default(),
    }
}

async fn filtered_projects(
    state: &AppState,
    query: &ProjectsQuery,
) -> Result<Vec<StoredProject>, Response> {
    let filter = ProjectFilter::from_query(query).map_err(bad_request)?;
    let projects = state
        .store
        .list_projects()
        .await
        .map_err(|err| server_error(err.into()))?;
    Ok(projects.into_iter().filter(|p| filter.matches(p)).collect())
}

async fn projects_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProjectsQuery>,
) -> Response {
    match filtered_projects(&state, &query).await {
        Ok(projects) => Json(paginate(&projects, query.page, query.per_page)).into_response(),
        Err(resp) => resp,
    }
}

async fn project_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((source, project_id)): AxumPath<(String, String)>,
) -> Response {
    match state.store.get_project(&source, &project_id).await {
        Ok(Some(project)) => Json(project).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("no project {source}/{project_id}") })),
        )
            .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn markers_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProjectsQuery>,
) -> Response {
    match filtered_projects(&state, &query).await {
        Ok(projects) => Json(markers_for(&projects)).into_response(),
        Err(resp) => resp,
    }
}

async fn runs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(20).clamp(1, 200);
    match state.store.recent_runs(limit).await {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => server_error(err.into()),
    }
}

pub fn paginate(
    projects: &[StoredProject],
    page: Option<usize>,
    per_page: Option<usize>,
) -> ProjectsPage {
    let per_page = per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE);
    let total_pages = projects.len().max(1).div_ceil(per_page);
    let page = page.unwrap_or(1).clamp(1, total_pages);
    let start = (page - 1) * per_page;
    ProjectsPage {
        total: projects.len(),
        page,
        per_page,
        total_pages,
        projects: projects
            .iter()
            .skip(start)
            .take(per_page)
            .map(ProjectRow::from)
            .collect(),
    }
}

pub fn markers_for(projects: &[StoredProject]) -> MarkersResponse {
    let mut markers = Vec::new();
    let mut unlocated = 0usize;
    for project in projects {
        let r = &project.record;
        match r.coordinates() {
            Some(coords) => markers.push(Marker {
                source: r.source.clone(),
                project_id: r.project_id.clone(),
                name: r.name.clone(),
                status: r.status,
                latitude: coords.latitude,
                longitude: coords.longitude,
                color: source_color(&r.source).to_string(),
                approximate: r.location_approximate,
                url: r.url.clone(),
            }),
            None => unlocated += 1,
        }
    }
    MarkersResponse { markers, unlocated }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn bad_request(message: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "dashboard request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}
