//! Axum JSON API for product search, pricing and quotation export.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{Local, Utc};
use quote_catalog::{BuildSummary, CatalogHandle, CatalogPipeline, MatchEngine, QuoteSettings};
use quote_core::{
    price_quote, Catalog, ErrorPayload, PricingParams, Quotation, QuotationItem, QuoteError,
    SearchResult,
};
use quote_export::{export_file_name, write_quotation_xlsx, XLSX_CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "quote-web";

pub struct AppState {
    pub catalog: CatalogHandle,
    pub pipeline: CatalogPipeline,
    pub engine: MatchEngine,
    rebuild_lock: Mutex<()>,
}

impl AppState {
    pub fn new(pipeline: CatalogPipeline, catalog: Catalog) -> Self {
        let engine = pipeline.settings().match_engine();
        Self {
            catalog: CatalogHandle::new(catalog),
            pipeline,
            engine,
            rebuild_lock: Mutex::new(()),
        }
    }

    fn settings(&self) -> &QuoteSettings {
        self.pipeline.settings()
    }

    /// Rebuilds, publishes and swaps in the catalog. One reload at a time, so
    /// the published manifest and the live catalog always come from the same
    /// build.
    pub async fn reload(&self) -> anyhow::Result<BuildSummary> {
        let _guard = self.rebuild_lock.lock().await;
        let (catalog, summary) = self.pipeline.rebuild().await?;
        let previous = self.catalog.replace(catalog);
        info!(previous_rows = previous.len(), rows = summary.rows, "catalog reloaded");
        Ok(summary)
    }
}

#[derive(Debug, Serialize)]
struct Envelope<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorPayload>,
}

fn success<T: Serialize>(data: T) -> Response {
    Json(Envelope {
        success: true,
        data: Some(data),
        error: None,
    })
    .into_response()
}

/// Failure rendered as the `{"success": false, "error": {kind, message}}`
/// envelope.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    payload: ErrorPayload,
}

impl ApiError {
    fn new(payload: ErrorPayload) -> Self {
        let status = match payload.kind.as_str() {
            "invalid_argument" => StatusCode::BAD_REQUEST,
            "source_format" => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self { status, payload }
    }
}

impl From<QuoteError> for ApiError {
    fn from(err: QuoteError) -> Self {
        Self::new(ErrorPayload::from(&err))
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        let chain: &(dyn std::error::Error + 'static) = err.as_ref();
        Self::new(ErrorPayload::from_error_chain(chain))
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(ErrorPayload::new("invalid_argument", rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::new(ErrorPayload::new("invalid_argument", rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(kind = %self.payload.kind, message = %self.payload.message, "request failed");
        }
        let body = Envelope::<()> {
            success: false,
            data: None,
            error: Some(self.payload),
        };
        (self.status, Json(body)).into_response()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/products/search", get(search_handler))
        .route("/api/quotations", post(assemble_quotation_handler))
        .route("/api/quotations/calculate", post(calculate_handler))
        .route("/api/quotations/export/xlsx", post(export_xlsx_handler))
        .route("/api/catalog/reload", post(reload_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(settings: QuoteSettings) -> anyhow::Result<()> {
    let port = settings.web_port;
    let pipeline = CatalogPipeline::new(settings);
    let catalog = pipeline.load_or_build().await?;
    let state = AppState::new(pipeline, catalog);
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "serving quotation api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(QuoteSettings::from_env()?).await
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    rows: usize,
    scorer: &'static str,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    success(Health {
        status: "ok",
        rows: state.catalog.current().len(),
        scorer: state.engine.scorer_name(),
    })
}

#[derive(Debug, Deserialize, Default)]
struct SearchQuery {
    #[serde(default)]
    query: String,
    limit: Option<usize>,
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<SearchQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(params) = query?;
    let limit = state.settings().resolve_limit(params.limit)?;
    let catalog = state.catalog.current();
    let hits: Vec<SearchResult> = state.engine.search(&params.query, &catalog, limit)?;
    Ok(success(hits))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalculateRequest {
    base_usd: f64,
    markup: Option<f64>,
    exchange_rate: Option<f64>,
    tax_rate: Option<f64>,
}

impl CalculateRequest {
    fn params(&self, defaults: &PricingParams) -> PricingParams {
        PricingParams {
            markup: self.markup.unwrap_or(defaults.markup),
            exchange_rate: self.exchange_rate.unwrap_or(defaults.exchange_rate),
            tax_rate: self.tax_rate.unwrap_or(defaults.tax_rate),
        }
    }
}

async fn calculate_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CalculateRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body?;
    let params = request.params(&state.settings().pricing);
    let quote = price_quote(request.base_usd, &params)?.rounded();
    Ok(success(quote))
}

fn default_quantity() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuotationLine {
    catalog_row_index: usize,
    #[serde(default = "default_quantity")]
    quantity: u32,
    /// Overrides the quotation-wide markup for this line only.
    #[serde(default)]
    markup: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuotationRequest {
    #[serde(default)]
    customer_name: String,
    items: Vec<QuotationLine>,
    #[serde(default)]
    pricing: Option<PricingParams>,
}

async fn assemble_quotation_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<QuotationRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body?;
    let params = request.pricing.unwrap_or(state.settings().pricing);
    let catalog = state.catalog.current();

    let items = request
        .items
        .iter()
        .map(|line| {
            let row = catalog.get(line.catalog_row_index).ok_or_else(|| {
                QuoteError::InvalidArgument(format!(
                    "catalog has no row {}",
                    line.catalog_row_index
                ))
            })?;
            let hit = SearchResult::from_row(line.catalog_row_index, row, 0);
            let line_params = PricingParams {
                markup: line.markup.unwrap_or(params.markup),
                ..params
            };
            QuotationItem::priced(&hit, line.quantity, &line_params)
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(success(Quotation::new(request.customer_name, items, Utc::now())))
}

async fn export_xlsx_handler(
    body: Result<Json<Quotation>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(quotation) = body?;
    let bytes = write_quotation_xlsx(&quotation, Local::now().date_naive())?;
    let disposition = format!("attachment; filename=\"{}\"", export_file_name(&quotation));
    Ok((
        [
            (header::CONTENT_TYPE, XLSX_CONTENT_TYPE.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

async fn reload_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let summary = state.reload().await?;
    Ok(success(summary))
}
