//! Source adapter contracts + the civic project sources and parcel locator.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Local, NaiveDate, Utc};
use devwatch_core::Coordinates;
use devwatch_storage::{HttpError, HttpFetcher};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "devwatch-adapters";

pub const PLANNING_COUNCIL: &str = "planning_council";
pub const DHEC: &str = "dhec";
pub const WATER: &str = "water";
pub const STORMWATER: &str = "stormwater";

/// All built-in source ids, in collection order.
pub const SOURCE_IDS: [&str; 4] = [PLANNING_COUNCIL, DHEC, WATER, STORMWATER];

const ARCGIS_OUT_SR: &str = "4326";
const TOWN_SITE: &str = "https://www.tompsc.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceKind {
    ArcGisFeatures,
    JsonApi,
    HtmlTable,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::ArcGisFeatures => "arcgis",
            SourceKind::JsonApi => "json",
            SourceKind::HtmlTable => "html",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub content_type: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

/// One opaque item as fetched; preserved verbatim as the record's `raw_data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    pub payload: JsonValue,
}

impl RawItem {
    pub fn new(payload: JsonValue) -> Self {
        Self { payload }
    }
}

/// Source-specific field mapping handed to the normalizer. `None` means absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedFields {
    pub project_id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<String>,
    pub address: Option<String>,
    pub application_date: Option<NaiveDate>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub url: Option<String>,
    /// Addresses or parcel ids to try in order when the source carries no coordinates.
    pub geocode_queries: Vec<String>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("invalid payload from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("service error from {url}: {message}")]
    Service { url: String, message: String },
    #[error("unexpected payload shape from {url}: {message}")]
    UnexpectedShape { url: String, message: String },
    #[error("reading fixture {}: {source}", .path.display())]
    Fixture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn kind(&self) -> SourceKind;

    async fn fetch_page(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<FetchedPage, FetchError>;

    fn parse_page(&self, page: &FetchedPage) -> Result<Vec<RawItem>, FetchError>;

    fn extract(&self, item: &RawItem) -> ExtractedFields;

    /// Why an item is dropped before normalization, if it is.
    fn exclusion_reason(&self, _item: &RawItem) -> Option<&'static str> {
        None
    }

    async fn fetch_raw(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawItem>, FetchError> {
        let page = self.fetch_page(http, ctx).await?;
        let items = self.parse_page(&page)?;
        debug!(
            source_id = self.source_id(),
            kind = self.kind().as_str(),
            run_id = %ctx.run_id,
            content_type = %page.content_type,
            bytes = page.body.len(),
            items = items.len(),
            "parsed page"
        );
        Ok(items)
    }
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("unusable query {0:?}")]
    InvalidQuery(String),
    #[error("no match for {0}")]
    NoMatch(String),
    #[error("unexpected response: {0}")]
    UnexpectedShape(String),
}

/// One external coordinate lookup for an address or parcel id.
#[async_trait]
pub trait GeocodeProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn lookup(&self, query: &str) -> Result<Coordinates, LookupError>;
}

// ---------------------------------------------------------------------------
// JSON helpers

fn json_path<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn json_str(value: &JsonValue, path: &[&str]) -> Option<String> {
    json_path(value, path)?.as_str().and_then(text_or_none)
}

/// Strings and numbers both render as identifiers (`objectId` is numeric).
fn json_scalar_string(value: &JsonValue, path: &[&str]) -> Option<String> {
    match json_path(value, path)? {
        JsonValue::String(s) => text_or_none(s),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    match json_path(value, path)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn first_scalar_string(value: &JsonValue, paths: &[&[&str]]) -> Option<String> {
    paths.iter().find_map(|p| json_scalar_string(value, p))
}

/// Epoch-milliseconds timestamps (ArcGIS / DHEC) as a local calendar date.
pub fn epoch_millis_to_date(value: &JsonValue) -> Option<NaiveDate> {
    let millis = match value {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?,
        JsonValue::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    DateTime::from_timestamp_millis(millis).map(|dt| dt.with_timezone(&Local).date_naive())
}

fn decode_json(page: &FetchedPage) -> Result<JsonValue, FetchError> {
    serde_json::from_slice(&page.body).map_err(|e| FetchError::Decode {
        url: page.url.clone(),
        message: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// ArcGIS feature services

async fn arcgis_query(
    http: &HttpFetcher,
    source_id: &str,
    url: &str,
    params: &[(&str, &str)],
    ctx: &AdapterContext,
) -> Result<FetchedPage, FetchError> {
    let resp = http.get(source_id, url, params).await?;
    Ok(FetchedPage {
        url: resp.final_url,
        content_type: resp
            .content_type
            .unwrap_or_else(|| "application/json".to_string()),
        body: resp.body,
        fetched_at: ctx.fetched_at,
    })
}

/// Splits a feature-service response into one item per feature.
///
/// Each item carries the feature's `attributes`, its `geometry_key` member
/// (`geometry` or `centroid`) and the service's field-name → alias mapping.
pub fn parse_arcgis_features(
    page: &FetchedPage,
    geometry_key: &str,
) -> Result<Vec<RawItem>, FetchError> {
    let value = decode_json(page)?;
    if let Some(err) = value.get("error") {
        let message = json_str(err, &["message"]).unwrap_or_else(|| err.to_string());
        return Err(FetchError::Service {
            url: page.url.clone(),
            message,
        });
    }
    let features = value
        .get("features")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| FetchError::UnexpectedShape {
            url: page.url.clone(),
            message: "missing `features` array".to_string(),
        })?;

    let mut field_mapping = Map::new();
    for field in value
        .get("fields")
        .and_then(JsonValue::as_array)
        .into_iter()
        .flatten()
    {
        if let (Some(name), Some(alias)) = (json_str(field, &["name"]), field.get("alias")) {
            field_mapping.insert(name, alias.clone());
        }
    }

    Ok(features
        .iter()
        .map(|feature| {
            let mut item = Map::new();
            item.insert(
                "attributes".to_string(),
                feature.get("attributes").cloned().unwrap_or_else(|| json!({})),
            );
            item.insert(
                geometry_key.to_string(),
                feature.get(geometry_key).cloned().unwrap_or_else(|| json!({})),
            );
            item.insert(
                "field_mapping".to_string(),
                JsonValue::Object(field_mapping.clone()),
            );
            RawItem::new(JsonValue::Object(item))
        })
        .collect())
}

/// Town planning council agenda items (ArcGIS FeatureServer).
#[derive(Debug, Clone)]
pub struct PlanningCouncilAdapter {
    endpoint: String,
    max_records: u32,
}

impl PlanningCouncilAdapter {
    pub const DEFAULT_ENDPOINT: &'static str = "https://services8.arcgis.com/lzpM6epdQtzxVX5J/ArcGIS/rest/services/QobYc/FeatureServer/0/query";

    pub fn new() -> Self {
        Self::with_endpoint(Self::DEFAULT_ENDPOINT)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            max_records: 100,
        }
    }
}

impl Default for PlanningCouncilAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceAdapter for PlanningCouncilAdapter {
    fn source_id(&self) -> &'static str {
        PLANNING_COUNCIL
    }

    fn kind(&self) -> SourceKind {
        SourceKind::ArcGisFeatures
    }

    async fn fetch_page(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<FetchedPage, FetchError> {
        let max_records = self.max_records.to_string();
        let params = [
            ("where", "f5 IS NOT NULL"),
            ("outFields", "*"),
            ("returnGeometry", "true"),
            ("outSR", ARCGIS_OUT_SR),
            ("resultRecordCount", max_records.as_str()),
            ("f", "pjson"),
        ];
        arcgis_query(http, self.source_id(), &self.endpoint, &params, ctx).await
    }

    fn parse_page(&self, page: &FetchedPage) -> Result<Vec<RawItem>, FetchError> {
        parse_arcgis_features(page, "geometry")
    }

    fn extract(&self, item: &RawItem) -> ExtractedFields {
        let p = &item.payload;
        let group = json_str(p, &["attributes", "f7"]).unwrap_or_default();
        let detail = json_str(p, &["attributes", "f9"]).unwrap_or_default();
        let description = format!("{group} - {detail}")
            .trim_matches(|c: char| c == ' ' || c == '-')
            .to_string();
        ExtractedFields {
            project_id: first_scalar_string(
                p,
                &[
                    &["attributes", "objectId"],
                    &["attributes", "ObjectId"],
                    &["attributes", "OBJECTID"],
                ],
            ),
            name: json_str(p, &["attributes", "f5"]),
            description: text_or_none(&description),
            // Every agenda item is an open request before council.
            status: Some("Active".to_string()),
            address: json_str(p, &["attributes", "f1"]),
            application_date: None,
            latitude: json_f64(p, &["geometry", "y"]),
            longitude: json_f64(p, &["geometry", "x"]),
            url: json_str(p, &["attributes", "f10"]),
            geocode_queries: Vec::new(),
        }
    }

    fn exclusion_reason(&self, item: &RawItem) -> Option<&'static str> {
        json_scalar_string(&item.payload, &["attributes", "f5"])
            .is_none()
            .then_some("no case number")
    }
}

/// Water utility developer projects (ArcGIS FeatureServer with centroids).
#[derive(Debug, Clone)]
pub struct WaterProjectsAdapter {
    endpoint: String,
    max_records: u32,
}

impl WaterProjectsAdapter {
    pub const DEFAULT_ENDPOINT: &'static str =
        "https://gis.mpwonline.com/arcgis/rest/services/DeveloperProjects/FeatureServer/2/query";

    pub fn new() -> Self {
        Self::with_endpoint(Self::DEFAULT_ENDPOINT)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            max_records: 200,
        }
    }
}

impl Default for WaterProjectsAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceAdapter for WaterProjectsAdapter {
    fn source_id(&self) -> &'static str {
        WATER
    }

    fn kind(&self) -> SourceKind {
        SourceKind::ArcGisFeatures
    }

    async fn fetch_page(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<FetchedPage, FetchError> {
        let max_records = self.max_records.to_string();
        let params = [
            ("where", "1=1"),
            ("outFields", "*"),
            ("returnGeometry", "true"),
            ("outSR", ARCGIS_OUT_SR),
            ("returnCentroid", "true"),
            ("resultRecordCount", max_records.as_str()),
            ("f", "pjson"),
        ];
        arcgis_query(http, self.source_id(), &self.endpoint, &params, ctx).await
    }

    fn parse_page(&self, page: &FetchedPage) -> Result<Vec<RawItem>, FetchError> {
        parse_arcgis_features(page, "centroid")
    }

    fn extract(&self, item: &RawItem) -> ExtractedFields {
        let p = &item.payload;
        let status = [
            json_str(p, &["attributes", "STATUS"]),
            json_str(p, &["attributes", "PHASE"]),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" - ");
        ExtractedFields {
            project_id: json_scalar_string(p, &["attributes", "PROJ_ID"]),
            name: json_str(p, &["attributes", "PROJECTNAME"]),
            description: json_str(p, &["attributes", "WebsiteDesc"]),
            status: text_or_none(&status),
            address: json_str(p, &["attributes", "PROJ_ADDR"]),
            application_date: json_path(p, &["attributes", "created_date"])
                .and_then(epoch_millis_to_date),
            latitude: json_f64(p, &["centroid", "y"]),
            longitude: json_f64(p, &["centroid", "x"]),
            url: json_str(p, &["attributes", "PIPES_LINK"]),
            geocode_queries: Vec::new(),
        }
    }

    fn exclusion_reason(&self, item: &RawItem) -> Option<&'static str> {
        json_scalar_string(&item.payload, &["attributes", "PROJ_ID"])
            .filter(|id| id.starts_with("RSAN"))
            .map(|_| "residential sanitary project")
    }
}

// ---------------------------------------------------------------------------
// State environmental permit public notices

#[derive(Debug, Clone)]
pub struct DhecPermitsAdapter {
    endpoint: String,
    jurisdiction: String,
}

impl DhecPermitsAdapter {
    pub const DEFAULT_ENDPOINT: &'static str = "https://epermweb.dhec.sc.gov/ncore/ss/publicnoticeslist?includeMetadataInResponse=false&loadChildren=false&queryParams=%7B%22filter%22:%5B%7B%7D%5D%7D";
    const DETAIL_URL_PREFIX: &'static str =
        "https://epermweb.dhec.sc.gov/ncore/external/publicnotice/info";

    pub fn new() -> Self {
        Self::with_endpoint(Self::DEFAULT_ENDPOINT)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            jurisdiction: "pleasant".to_string(),
        }
    }

    /// Case-insensitive fragment a notice's city must contain.
    pub fn with_jurisdiction(mut self, fragment: impl Into<String>) -> Self {
        self.jurisdiction = fragment.into().to_lowercase();
        self
    }
}

impl Default for DhecPermitsAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceAdapter for DhecPermitsAdapter {
    fn source_id(&self) -> &'static str {
        DHEC
    }

    fn kind(&self) -> SourceKind {
        SourceKind::JsonApi
    }

    async fn fetch_page(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<FetchedPage, FetchError> {
        let resp = http.get(self.source_id(), &self.endpoint, &[]).await?;
        Ok(FetchedPage {
            url: resp.final_url,
            content_type: resp
                .content_type
                .unwrap_or_else(|| "application/json".to_string()),
            body: resp.body,
            fetched_at: ctx.fetched_at,
        })
    }

    fn parse_page(&self, page: &FetchedPage) -> Result<Vec<RawItem>, FetchError> {
        let value = decode_json(page)?;
        let results = value
            .get("queryResults")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| FetchError::UnexpectedShape {
                url: page.url.clone(),
                message: "missing `queryResults` array".to_string(),
            })?;
        Ok(results.iter().cloned().map(RawItem::new).collect())
    }

    fn extract(&self, item: &RawItem) -> ExtractedFields {
        let p = &item.payload;
        let permit_type = json_str(p, &["permitType"]);
        let comments = json_str(p, &["comments"]);
        let project_id = json_scalar_string(p, &["id"]);
        ExtractedFields {
            url: project_id
                .as_ref()
                .map(|id| format!("{}/{id}/details", Self::DETAIL_URL_PREFIX)),
            project_id,
            name: Some(
                permit_type
                    .clone()
                    .unwrap_or_else(|| "DHEC Permit".to_string()),
            ),
            description: comments.or(permit_type),
            status: json_str(p, &["status"]),
            address: json_str(p, &["address1"]),
            application_date: p.get("applicationDate").and_then(epoch_millis_to_date),
            latitude: json_f64(p, &["latitude"]),
            longitude: json_f64(p, &["longitude"]),
            geocode_queries: Vec::new(),
        }
    }

    fn exclusion_reason(&self, item: &RawItem) -> Option<&'static str> {
        let p = &item.payload;
        let city = json_str(p, &["city"]).unwrap_or_default().to_lowercase();
        if !city.contains(&self.jurisdiction) {
            return Some("outside jurisdiction");
        }
        if json_str(p, &["comments"]).is_some_and(|c| c.starts_with("PRIVATE")) {
            return Some("private residence");
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Stormwater construction notices (HTML table)

/// Full TMS parcel id, e.g. `559-13-00-030`.
static TMS_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[0-9]{3}-[0-9]{2}-[0-9]{2}-[0-9]{3}").unwrap());

/// Expands abbreviated TMS parcel lists.
///
/// `"537-00-00-085, 084"` → `["537-00-00-085", "537-00-00-084"]`;
/// `"559-13-00-030, -031"` → `["559-13-00-030", "559-13-00-031"]`.
/// Suffixes replace the last group of the first full id.
pub fn expand_abbreviated_tms(location: &str) -> Vec<String> {
    let mut ids: Vec<String> = TMS_PATTERN
        .find_iter(location)
        .map(|m| m.as_str().to_string())
        .collect();
    let Some(base) = ids.first().cloned() else {
        return ids;
    };
    let prefix = match base.rsplit_once('-') {
        Some((prefix, _)) => prefix.to_string(),
        None => return ids,
    };

    for segment in location.split(',').skip(1) {
        let segment = segment.trim_start();
        let segment = segment.strip_prefix('-').unwrap_or(segment);
        let digits: String = segment.chars().take_while(char::is_ascii_digit).collect();
        let rest = &segment[digits.len()..];
        let terminated = rest.is_empty() || rest.starts_with(char::is_whitespace);
        if (2..=3).contains(&digits.len()) && terminated {
            let expanded = format!("{prefix}-{digits:0>3}");
            if !ids.contains(&expanded) {
                ids.push(expanded);
            }
        }
    }
    ids
}

/// Notice dates come in several hand-typed formats.
pub fn parse_notice_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    // Known typo on the published notice table.
    let raw = if raw == "9/12/222" { "9/12/2022" } else { raw };
    let raw = raw.split_whitespace().next().unwrap_or_default();
    ["%m/%d/%Y", "%m/%d/%y", "%Y-%m-%d", "%m-%d-%Y"]
        .iter()
        .filter_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        .find(|d| d.year() >= 1900)
}

fn stormwater_project_id(location: &str, open_date: &str) -> Option<String> {
    if location.is_empty() && open_date.is_empty() {
        return None;
    }
    let loc: String = location.chars().take(20).collect();
    Some(
        format!("{loc}_{open_date}")
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect(),
    )
}

fn cell_text(cell: ElementRef<'_>) -> String {
    cell.text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn selector(css: &str) -> Result<Selector, FetchError> {
    Selector::parse(css).map_err(|e| FetchError::Decode {
        url: css.to_string(),
        message: e.to_string(),
    })
}

#[derive(Debug, Clone)]
pub struct StormwaterNoticesAdapter {
    endpoint: String,
    table_selector: String,
}

impl StormwaterNoticesAdapter {
    pub const DEFAULT_ENDPOINT: &'static str = "https://www.tompsc.com/1405/Construction-Public-Notice";

    pub fn new() -> Self {
        Self::with_endpoint(Self::DEFAULT_ENDPOINT)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            table_selector: "table.telerik-reTable-2".to_string(),
        }
    }

    /// Parses the notice table: first row is the header, following rows are notices.
    pub fn parse_notice_table(&self, html: &str, page_url: &str) -> Result<Vec<RawItem>, FetchError> {
        let document = Html::parse_document(html);
        let table_sel = selector(&self.table_selector)?;
        let row_sel = selector("tr")?;
        let cell_sel = selector("th, td")?;
        let link_sel = selector("a[href]")?;

        let table = document
            .select(&table_sel)
            .next()
            .ok_or_else(|| FetchError::UnexpectedShape {
                url: page_url.to_string(),
                message: format!("no `{}` on page", self.table_selector),
            })?;

        let mut rows = table.select(&row_sel);
        let header: Vec<String> = rows
            .next()
            .map(|row| {
                row.select(&cell_sel)
                    .map(|c| cell_text(c).replace(' ', ""))
                    .collect()
            })
            .unwrap_or_default();
        if header.is_empty() {
            return Err(FetchError::UnexpectedShape {
                url: page_url.to_string(),
                message: "notice table has no header row".to_string(),
            });
        }

        let mut items = Vec::new();
        for row in rows {
            let cells: Vec<String> = row.select(&cell_sel).map(cell_text).collect();
            if cells.iter().all(|c| c.is_empty()) {
                continue;
            }
            let mut payload = Map::new();
            for (key, value) in header.iter().zip(cells) {
                payload.insert(key.clone(), JsonValue::String(value));
            }
            let link = row
                .select(&link_sel)
                .next()
                .and_then(|a| a.value().attr("href"))
                .map(|href| {
                    if href.starts_with('/') {
                        format!("{TOWN_SITE}{href}")
                    } else {
                        href.to_string()
                    }
                });
            payload.insert("URL".to_string(), link.map_or(JsonValue::Null, JsonValue::String));
            let location = payload
                .get("Location")
                .and_then(JsonValue::as_str)
                .unwrap_or_default();
            let tms_ids = expand_abbreviated_tms(location);
            payload.insert("tms_ids".to_string(), json!(tms_ids));
            items.push(RawItem::new(JsonValue::Object(payload)));
        }
        Ok(items)
    }
}

impl Default for StormwaterNoticesAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceAdapter for StormwaterNoticesAdapter {
    fn source_id(&self) -> &'static str {
        STORMWATER
    }

    fn kind(&self) -> SourceKind {
        SourceKind::HtmlTable
    }

    async fn fetch_page(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<FetchedPage, FetchError> {
        let resp = http.get(self.source_id(), &self.endpoint, &[]).await?;
        Ok(FetchedPage {
            url: resp.final_url,
            content_type: resp.content_type.unwrap_or_else(|| "text/html".to_string()),
            body: resp.body,
            fetched_at: ctx.fetched_at,
        })
    }

    fn parse_page(&self, page: &FetchedPage) -> Result<Vec<RawItem>, FetchError> {
        let html = String::from_utf8_lossy(&page.body);
        self.parse_notice_table(&html, &page.url)
    }

    fn extract(&self, item: &RawItem) -> ExtractedFields {
        let p = &item.payload;
        let location = json_str(p, &["Location"]).unwrap_or_default();
        let open_date = json_str(p, &["OpenDate"]).unwrap_or_default();
        let geocode_queries = p
            .get("tms_ids")
            .and_then(JsonValue::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(JsonValue::as_str)
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();
        ExtractedFields {
            project_id: stormwater_project_id(&location, &open_date),
            name: json_str(p, &["ProjectName"]),
            description: text_or_none(&location)
                .map(|loc| format!("Stormwater construction project at {loc}")),
            status: json_str(p, &["Status"]),
            application_date: parse_notice_date(&open_date),
            address: text_or_none(&location),
            latitude: None,
            longitude: None,
            url: json_str(p, &["URL"]),
            geocode_queries,
        }
    }
}

// ---------------------------------------------------------------------------
// Registry + fixture replay

/// Built-in adapter for `source_id`, optionally pointed at another endpoint.
pub fn adapter_for_source(source_id: &str, endpoint: Option<&str>) -> Option<Box<dyn SourceAdapter>> {
    let adapter: Box<dyn SourceAdapter> = match (source_id, endpoint) {
        (PLANNING_COUNCIL, None) => Box::new(PlanningCouncilAdapter::new()),
        (PLANNING_COUNCIL, Some(url)) => Box::new(PlanningCouncilAdapter::with_endpoint(url)),
        (DHEC, None) => Box::new(DhecPermitsAdapter::new()),
        (DHEC, Some(url)) => Box::new(DhecPermitsAdapter::with_endpoint(url)),
        (WATER, None) => Box::new(WaterProjectsAdapter::new()),
        (WATER, Some(url)) => Box::new(WaterProjectsAdapter::with_endpoint(url)),
        (STORMWATER, None) => Box::new(StormwaterNoticesAdapter::new()),
        (STORMWATER, Some(url)) => Box::new(StormwaterNoticesAdapter::with_endpoint(url)),
        _ => return None,
    };
    Some(adapter)
}

/// Serves a captured payload from disk through the wrapped adapter's parser.
pub struct FixtureReplayAdapter {
    inner: Box<dyn SourceAdapter>,
    path: PathBuf,
}

impl FixtureReplayAdapter {
    pub fn new(inner: Box<dyn SourceAdapter>, path: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SourceAdapter for FixtureReplayAdapter {
    fn source_id(&self) -> &'static str {
        self.inner.source_id()
    }

    fn kind(&self) -> SourceKind {
        self.inner.kind()
    }

    async fn fetch_page(
        &self,
        _http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<FetchedPage, FetchError> {
        let body = std::fs::read(&self.path).map_err(|source| FetchError::Fixture {
            path: self.path.clone(),
            source,
        })?;
        let content_type = match self.path.extension().and_then(|e| e.to_str()) {
            Some("html") | Some("htm") => "text/html",
            _ => "application/json",
        };
        Ok(FetchedPage {
            url: format!("file://{}", self.path.display()),
            content_type: content_type.to_string(),
            body,
            fetched_at: ctx.fetched_at,
        })
    }

    fn parse_page(&self, page: &FetchedPage) -> Result<Vec<RawItem>, FetchError> {
        self.inner.parse_page(page)
    }

    fn extract(&self, item: &RawItem) -> ExtractedFields {
        self.inner.extract(item)
    }

    fn exclusion_reason(&self, item: &RawItem) -> Option<&'static str> {
        self.inner.exclusion_reason(item)
    }
}

// ---------------------------------------------------------------------------
// County parcel locator

/// Resolves TMS parcel ids against the county parcel layer.
#[derive(Debug, Clone)]
pub struct ArcGisParcelLocator {
    http: HttpFetcher,
    endpoint: String,
}

impl ArcGisParcelLocator {
    pub const DEFAULT_ENDPOINT: &'static str =
        "https://maps.tompsc.com/arcgis/rest/services/Parcel_Search_New/MPSC_Base_New/MapServer/2/query";

    /// `http` should be a single-attempt fetcher; the locator never retries.
    pub fn new(http: HttpFetcher) -> Self {
        Self::with_endpoint(http, Self::DEFAULT_ENDPOINT)
    }

    pub fn with_endpoint(http: HttpFetcher, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
        }
    }
}

/// Parcel ids are queried digits-only (`559-13-00-030` → `5591300030`).
pub fn parcel_query_id(query: &str) -> Option<String> {
    let digits: String = query.chars().filter(char::is_ascii_digit).collect();
    (digits.len() == 10).then_some(digits)
}

/// First vertex of the first ring of the first matched parcel polygon.
pub fn parse_parcel_response(query: &str, value: &JsonValue) -> Result<Coordinates, LookupError> {
    if let Some(err) = value.get("error") {
        return Err(LookupError::UnexpectedShape(err.to_string()));
    }
    let feature = value
        .get("features")
        .and_then(JsonValue::as_array)
        .and_then(|f| f.first())
        .ok_or_else(|| LookupError::NoMatch(query.to_string()))?;
    let vertex = feature
        .pointer("/geometry/rings/0/0")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| LookupError::UnexpectedShape("parcel feature without rings".into()))?;
    let (Some(lon), Some(lat)) = (
        vertex.first().and_then(JsonValue::as_f64),
        vertex.get(1).and_then(JsonValue::as_f64),
    ) else {
        return Err(LookupError::UnexpectedShape("ring vertex is not [x, y]".into()));
    };
    Coordinates::checked(lat, lon)
        .ok_or_else(|| LookupError::UnexpectedShape(format!("implausible vertex [{lon}, {lat}]")))
}

#[async_trait]
impl GeocodeProvider for ArcGisParcelLocator {
    fn name(&self) -> &'static str {
        "arcgis-parcel"
    }

    async fn lookup(&self, query: &str) -> Result<Coordinates, LookupError> {
        let parcel_id =
            parcel_query_id(query).ok_or_else(|| LookupError::InvalidQuery(query.to_string()))?;
        let where_clause = format!("PARCEL_ID = '{parcel_id}'");
        let params = [
            ("where", where_clause.as_str()),
            ("outFields", "*"),
            ("returnGeometry", "true"),
            ("outSR", ARCGIS_OUT_SR),
            ("resultRecordCount", "1"),
            ("f", "pjson"),
        ];
        let value = self.http.get_json("parcel", &self.endpoint, &params).await?;
        parse_parcel_response(query, &value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(body: &str) -> FetchedPage {
        FetchedPage {
            url: "https://example.test/query".into(),
            content_type: "application/json".into(),
            body: body.as_bytes().to_vec(),
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn tms_list_with_bare_suffixes_expands() {
        assert_eq!(
            expand_abbreviated_tms("537-00-00-085, 084"),
            vec!["537-00-00-085", "537-00-00-084"]
        );
    }

    #[test]
    fn tms_list_with_dashed_suffixes_expands() {
        assert_eq!(
            expand_abbreviated_tms("559-13-00-030, -031, -032"),
            vec!["559-13-00-030", "559-13-00-031", "559-13-00-032"]
        );
    }

    #[test]
    fn tms_two_digit_suffix_is_padded_and_full_ids_are_not_doubled() {
        assert_eq!(
            expand_abbreviated_tms("TMS 560-00-00-001, 560-00-00-002, 45"),
            vec!["560-00-00-001", "560-00-00-002", "560-00-00-045"]
        );
        assert!(expand_abbreviated_tms("Mathis Ferry Rd").is_empty());
    }

    #[test]
    fn notice_dates_cover_known_formats() {
        let d = |y, m, dd| NaiveDate::from_ymd_opt(y, m, dd).unwrap();
        assert_eq!(parse_notice_date("9/12/222"), Some(d(2022, 9, 12)));
        assert_eq!(parse_notice_date("03/04/2024"), Some(d(2024, 3, 4)));
        assert_eq!(parse_notice_date("3/4/24"), Some(d(2024, 3, 4)));
        assert_eq!(parse_notice_date("2024-03-04"), Some(d(2024, 3, 4)));
        assert_eq!(parse_notice_date("TBD"), None);
        assert_eq!(parse_notice_date(""), None);
    }

    #[test]
    fn stormwater_ids_are_sanitized_and_require_some_content() {
        assert_eq!(
            stormwater_project_id("559-13-00-030, -031 Rifle Range", "9/12/222").as_deref(),
            Some("559-13-00-030__-031__9_12_222")
        );
        assert_eq!(stormwater_project_id("", ""), None);
    }

    #[test]
    fn arcgis_error_body_is_a_service_error() {
        let err = parse_arcgis_features(
            &page(r#"{"error":{"code":400,"message":"Invalid query"}}"#),
            "geometry",
        )
        .unwrap_err();
        assert!(matches!(err, FetchError::Service { message, .. } if message == "Invalid query"));
    }

    #[test]
    fn arcgis_body_without_features_is_rejected() {
        let err = parse_arcgis_features(&page(r#"{"fields":[]}"#), "geometry").unwrap_err();
        assert!(matches!(err, FetchError::UnexpectedShape { .. }));
    }

    #[test]
    fn planning_items_without_case_number_are_excluded() {
        let adapter = PlanningCouncilAdapter::new();
        let item = RawItem::new(json!({"attributes": {"objectId": 4, "f5": "  "}, "geometry": {}}));
        assert_eq!(adapter.exclusion_reason(&item), Some("no case number"));
        let fields = adapter.extract(&item);
        assert_eq!(fields.project_id.as_deref(), Some("4"));
        assert_eq!(fields.application_date, None);
    }

    #[test]
    fn dhec_private_and_out_of_town_notices_are_excluded() {
        let adapter = DhecPermitsAdapter::new();
        let private = RawItem::new(json!({"id": 1, "city": "Mt. Pleasant", "comments": "PRIVATE dock"}));
        let elsewhere = RawItem::new(json!({"id": 2, "city": "Summerville"}));
        let kept = RawItem::new(json!({"id": 3, "city": "MOUNT PLEASANT", "comments": "Marina expansion"}));
        assert_eq!(adapter.exclusion_reason(&private), Some("private residence"));
        assert_eq!(adapter.exclusion_reason(&elsewhere), Some("outside jurisdiction"));
        assert_eq!(adapter.exclusion_reason(&kept), None);
    }

    #[test]
    fn dhec_defaults_name_and_builds_detail_url() {
        let fields = DhecPermitsAdapter::new().extract(&RawItem::new(json!({"id": 8812, "city": "Mount Pleasant"})));
        assert_eq!(fields.name.as_deref(), Some("DHEC Permit"));
        assert_eq!(
            fields.url.as_deref(),
            Some("https://epermweb.dhec.sc.gov/ncore/external/publicnotice/info/8812/details")
        );
        assert_eq!(fields.description, None);
    }

    #[test]
    fn water_status_joins_status_and_phase() {
        let item = RawItem::new(json!({
            "attributes": {"PROJ_ID": "CSAN-22-014", "STATUS": "Active", "PHASE": "", "created_date": 1_700_000_000_000i64},
            "centroid": {"x": -79.85, "y": 32.84}
        }));
        let adapter = WaterProjectsAdapter::new();
        let fields = adapter.extract(&item);
        assert_eq!(fields.status.as_deref(), Some("Active"));
        assert!(fields.application_date.is_some());
        assert_eq!(fields.latitude, Some(32.84));
        assert_eq!(adapter.exclusion_reason(&item), None);

        let residential = RawItem::new(json!({"attributes": {"PROJ_ID": "RSAN-1"}}));
        assert_eq!(adapter.exclusion_reason(&residential), Some("residential sanitary project"));
    }

    #[test]
    fn parcel_response_reads_first_ring_vertex() {
        let value = json!({"features": [{"geometry": {"rings": [[[-79.83, 32.81], [-79.84, 32.82]]]}}]});
        let coords = parse_parcel_response("559-13-00-030", &value).unwrap();
        assert_eq!(coords, Coordinates::new(32.81, -79.83));

        let empty = json!({"features": []});
        assert!(matches!(
            parse_parcel_response("559-13-00-030", &empty),
            Err(LookupError::NoMatch(_))
        ));
        assert_eq!(parcel_query_id("559-13-00-030").as_deref(), Some("5591300030"));
        assert_eq!(parcel_query_id("100 Ann Edwards Ln"), None);
    }

    #[test]
    fn registry_knows_every_builtin_source() {
        for id in SOURCE_IDS {
            let adapter = adapter_for_source(id, None).expect("registered");
            assert_eq!(adapter.source_id(), id);
        }
        assert!(adapter_for_source("charleston", None).is_none());
    }
}
