//! Axum REST surface over stored summaries and ETL runs.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{
        rejection::{PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};
use vitals_core::{PeriodKind, RecentView, SummaryRecord, SummaryView, VitalsError};
use vitals_source::{Identifier, TableRef};
use vitals_sync::{EtlConfig, EtlPipeline, EtlRunSummary, RecentRunSummary};

pub const CRATE_NAME: &str = "vitals-web";

const DEFAULT_PAGE_SIZE: usize = 30;
const DEFAULT_DATABASE: &str = "garmin_summary";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<EtlPipeline>,
}

impl AppState {
    pub fn new(pipeline: EtlPipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Vitals(#[from] VitalsError),
    #[error("{0}")]
    BadRequest(String),
    #[error("{}", .0.body_text())]
    Query(#[from] QueryRejection),
    #[error("{}", .0.body_text())]
    Path(#[from] PathRejection),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self {
            ApiError::BadRequest(_) | ApiError::Query(_) | ApiError::Path(_) => {
                (StatusCode::BAD_REQUEST, "bad_request")
            }
            ApiError::Vitals(err) => {
                let status = match err {
                    VitalsError::NotFound { .. } => StatusCode::NOT_FOUND,
                    VitalsError::SourceUnavailable { .. } | VitalsError::StoreUnavailable { .. } => {
                        error!(error = %err, "backend unavailable");
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                    VitalsError::InvalidIdentifier { .. }
                    | VitalsError::MissingPeriodKey { .. }
                    | VitalsError::Validation { .. }
                    | VitalsError::InsufficientHistory { .. } => StatusCode::BAD_REQUEST,
                };
                (status, err.kind())
            }
        };
        let body = json!({
            "error": kind,
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize, Default)]
struct PageQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct MonthsQuery {
    year: Option<i32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct TablesQuery {
    database_name: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ProcessQuery {
    database_name: Option<String>,
    table_name: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RecentQuery {
    reference_date: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/days", get(days_handler))
        .route("/days/{date}", get(day_handler))
        .route("/recent/{date}", get(recent_handler))
        .route("/weeks", get(weeks_handler))
        .route("/weeks/{date}", get(week_handler))
        .route("/months", get(months_handler))
        .route("/years", get(years_handler))
        .route("/sqlite/tables", get(tables_handler))
        .route("/process/recent", post(process_recent_handler))
        .route("/process/{kind}", post(process_table_handler))
        .with_state(state)
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("VITALS_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);
    let config = EtlConfig::from_env();
    let pipeline = EtlPipeline::from_config(&config).await?;
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, store = pipeline.reader().store().backend(), "serving vitals api");
    axum::serve(listener, app(AppState::new(pipeline))).await?;
    Ok(())
}

async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "store": state.pipeline.reader().store().backend(),
        "source": state.pipeline.source().source_name(),
    }))
}

async fn days_handler(
    State(state): State<AppState>,
    query: Result<Query<PageQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<SummaryView>>> {
    let Query(query) = query?;
    page(&state, PeriodKind::Day, query).await
}

async fn weeks_handler(
    State(state): State<AppState>,
    query: Result<Query<PageQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<SummaryView>>> {
    let Query(query) = query?;
    page(&state, PeriodKind::Week, query).await
}

async fn day_handler(
    State(state): State<AppState>,
    date: Result<Path<String>, PathRejection>,
) -> ApiResult<Json<SummaryView>> {
    let Path(date) = date?;
    by_key(&state, PeriodKind::Day, &date).await
}

async fn week_handler(
    State(state): State<AppState>,
    date: Result<Path<String>, PathRejection>,
) -> ApiResult<Json<SummaryView>> {
    let Path(date) = date?;
    by_key(&state, PeriodKind::Week, &date).await
}

async fn recent_handler(
    State(state): State<AppState>,
    date: Result<Path<String>, PathRejection>,
) -> ApiResult<Json<RecentView>> {
    let Path(date) = date?;
    let latest_day = parse_date(&date)?;
    let record = state.pipeline.reader().get_recent(latest_day).await?;
    Ok(Json(RecentView::from(&record)))
}

async fn months_handler(
    State(state): State<AppState>,
    query: Result<Query<MonthsQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<SummaryView>>> {
    let Query(query) = query?;
    let records = state.pipeline.reader().months(query.year).await?;
    Ok(Json(views(&records)))
}

async fn years_handler(State(state): State<AppState>) -> ApiResult<Json<Vec<SummaryView>>> {
    let records = state.pipeline.reader().years().await?;
    Ok(Json(views(&records)))
}

async fn tables_handler(
    State(state): State<AppState>,
    query: Result<Query<TablesQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<String>>> {
    let Query(query) = query?;
    let database = Identifier::parse(query.database_name.as_deref().unwrap_or(DEFAULT_DATABASE))?;
    let tables = state.pipeline.source().list_tables(&database).await?;
    Ok(Json(tables))
}

async fn process_table_handler(
    State(state): State<AppState>,
    kind: Result<Path<String>, PathRejection>,
    query: Result<Query<ProcessQuery>, QueryRejection>,
) -> ApiResult<Json<EtlRunSummary>> {
    let Path(kind) = kind?;
    let Query(query) = query?;
    let kind: PeriodKind = kind.parse().map_err(ApiError::BadRequest)?;
    let default_table = format!("{}s_summary", kind.as_str());
    let table = TableRef::parse(
        query.database_name.as_deref().unwrap_or(DEFAULT_DATABASE),
        query.table_name.as_deref().unwrap_or(&default_table),
    )?;
    let summary = state.pipeline.run_table(kind, &table).await?;
    Ok(Json(summary))
}

/// Without `referenceDate` the latest stored day is used.
async fn process_recent_handler(
    State(state): State<AppState>,
    query: Result<Query<RecentQuery>, QueryRejection>,
) -> ApiResult<Json<RecentRunSummary>> {
    let Query(query) = query?;
    let reference = match query.reference_date.as_deref() {
        Some(raw) => parse_date(raw)?,
        None => state
            .pipeline
            .reader()
            .latest_day()
            .await?
            .ok_or_else(|| VitalsError::not_found("daily summaries", "any day"))?,
    };
    let summary = state.pipeline.run_recent(reference).await?;
    Ok(Json(summary))
}

async fn page(state: &AppState, kind: PeriodKind, query: PageQuery) -> ApiResult<Json<Vec<SummaryView>>> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE);
    let records = state.pipeline.reader().get_page(kind, limit).await?;
    Ok(Json(views(&records)))
}

async fn by_key(state: &AppState, kind: PeriodKind, raw: &str) -> ApiResult<Json<SummaryView>> {
    let key = parse_date(raw)?;
    let record = state.pipeline.reader().get_by_key(kind, key).await?;
    Ok(Json(SummaryView::from(&record)))
}

fn views(records: &[SummaryRecord]) -> Vec<SummaryView> {
    records.iter().map(SummaryView::from).collect()
}

fn parse_date(raw: &str) -> ApiResult<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| ApiError::BadRequest(format!("`{raw}` is not a YYYY-MM-DD date")))
}
