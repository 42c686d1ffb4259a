//! Core catalog, search and quotation types shared by every quote crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "quote-core";

/// Decimal places applied when prices cross a presentation boundary.
pub const PRESENTATION_DECIMALS: i32 = 4;

/// Flattened column keys of the normalized catalog, in schema order.
pub const COL_PRODUCT: &str = "Product";
pub const COL_DESCRIPTION: &str = "Description";
pub const COL_CUT_OFF: &str = "Cut-Off";
pub const COL_PACK: &str = "Pack";
pub const COL_FINISHED_RMB: &str = "成品_RMB";
pub const COL_FINISHED_USD: &str = "成品_USD";
pub const COL_BULK_RMB: &str = "大板_RMB";
pub const COL_BULK_USD: &str = "大板_USD";

pub const CATALOG_COLUMNS: [&str; 8] = [
    COL_PRODUCT,
    COL_DESCRIPTION,
    COL_CUT_OFF,
    COL_PACK,
    COL_FINISHED_RMB,
    COL_FINISHED_USD,
    COL_BULK_RMB,
    COL_BULK_USD,
];

pub const PRICE_COLUMNS: [&str; 4] = [COL_FINISHED_RMB, COL_FINISHED_USD, COL_BULK_RMB, COL_BULK_USD];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuoteError {
    #[error("source format error: {0}")]
    SourceFormat(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("snapshot error: {0}")]
    Snapshot(String),
}

impl QuoteError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SourceFormat(_) => "source_format",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Snapshot(_) => "snapshot",
        }
    }
}

/// Structured failure handed to callers at every boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: String,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Maps an error chain to a payload, keeping the typed kind when a
    /// `QuoteError` sits anywhere in the chain.
    pub fn from_error_chain(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut kind = "internal";
        let mut messages = Vec::new();
        let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
        while let Some(e) = current {
            if let Some(quote) = e.downcast_ref::<QuoteError>() {
                kind = quote.kind();
            }
            messages.push(e.to_string());
            current = e.source();
        }
        Self::new(kind, messages.join(": "))
    }
}

impl From<&QuoteError> for ErrorPayload {
    fn from(err: &QuoteError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

/// One normalized price-list line.
///
/// Prices stay `None` when the source had no usable number; a zero price is a
/// real zero.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CatalogRow {
    pub product: Option<String>,
    pub description: Option<String>,
    pub cut_off: Option<String>,
    pub pack: Option<String>,
    pub finished_price_usd: Option<f64>,
    pub finished_price_rmb: Option<f64>,
    pub bulk_price_usd: Option<f64>,
    pub bulk_price_rmb: Option<f64>,
}

impl CatalogRow {
    pub fn has_text_info(&self) -> bool {
        self.description.is_some() || self.pack.is_some()
    }

    pub fn has_any_price(&self) -> bool {
        [
            self.finished_price_usd,
            self.finished_price_rmb,
            self.bulk_price_usd,
            self.bulk_price_rmb,
        ]
        .iter()
        .any(Option::is_some)
    }

    /// Whether the row carries enough information to stay in the catalog.
    pub fn is_retained(&self) -> bool {
        self.has_text_info() || self.has_any_price()
    }

    /// Text compared against search queries: product, description, cut-off
    /// and pack joined by single spaces, absent fields as empty strings.
    pub fn composite_text(&self) -> String {
        [
            self.product.as_deref(),
            self.description.as_deref(),
            self.cut_off.as_deref(),
            self.pack.as_deref(),
        ]
        .iter()
        .map(|part| part.unwrap_or_default())
        .collect::<Vec<_>>()
        .join(" ")
    }
}

/// Ordered, read-only product list. Row identity is the position.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Catalog {
    rows: Vec<CatalogRow>,
}

impl Catalog {
    pub fn new(rows: Vec<CatalogRow>) -> Self {
        Self { rows }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> &[CatalogRow] {
        &self.rows
    }

    pub fn get(&self, index: usize) -> Option<&CatalogRow> {
        self.rows.get(index)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CatalogRow> {
        self.rows.iter()
    }
}

impl FromIterator<CatalogRow> for Catalog {
    fn from_iter<I: IntoIterator<Item = CatalogRow>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Ranked search hit. Absent prices are reported as 0 at this boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub catalog_row_index: usize,
    pub product: String,
    pub description: String,
    pub cut_off: String,
    pub pack: String,
    #[serde(rename = "finishedPriceUSD")]
    pub finished_price_usd: f64,
    #[serde(rename = "finishedPriceRMB")]
    pub finished_price_rmb: f64,
    #[serde(rename = "bulkPriceUSD")]
    pub bulk_price_usd: f64,
    #[serde(rename = "bulkPriceRMB")]
    pub bulk_price_rmb: f64,
    pub match_score: u8,
}

impl SearchResult {
    pub fn from_row(catalog_row_index: usize, row: &CatalogRow, match_score: u8) -> Self {
        Self {
            catalog_row_index,
            product: row.product.clone().unwrap_or_default(),
            description: row.description.clone().unwrap_or_default(),
            cut_off: row.cut_off.clone().unwrap_or_default(),
            pack: row.pack.clone().unwrap_or_default(),
            finished_price_usd: row.finished_price_usd.unwrap_or(0.0),
            finished_price_rmb: row.finished_price_rmb.unwrap_or(0.0),
            bulk_price_usd: row.bulk_price_usd.unwrap_or(0.0),
            bulk_price_rmb: row.bulk_price_rmb.unwrap_or(0.0),
            match_score,
        }
    }
}

/// Markup, exchange rate and tax rate applied to a USD base cost.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PricingParams {
    pub markup: f64,
    pub exchange_rate: f64,
    pub tax_rate: f64,
}

impl Default for PricingParams {
    fn default() -> Self {
        Self {
            markup: 0.10,
            exchange_rate: 7.1,
            tax_rate: 0.13,
        }
    }
}

impl PricingParams {
    pub fn validate(&self) -> Result<(), QuoteError> {
        non_negative("markup", self.markup)?;
        non_negative("tax_rate", self.tax_rate)?;
        if !self.exchange_rate.is_finite() || self.exchange_rate <= 0.0 {
            return Err(QuoteError::InvalidArgument(format!(
                "exchange_rate must be a positive number, got {}",
                self.exchange_rate
            )));
        }
        Ok(())
    }
}

fn non_negative(name: &str, value: f64) -> Result<(), QuoteError> {
    if !value.is_finite() || value < 0.0 {
        return Err(QuoteError::InvalidArgument(format!(
            "{name} must be a non-negative number, got {value}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceQuote {
    pub final_usd: f64,
    pub final_rmb: f64,
}

impl PriceQuote {
    pub fn rounded(&self) -> Self {
        Self {
            final_usd: round_to(self.final_usd, PRESENTATION_DECIMALS),
            final_rmb: round_to(self.final_rmb, PRESENTATION_DECIMALS),
        }
    }
}

/// Client-facing prices for a USD base cost. Values are unrounded; call
/// [`PriceQuote::rounded`] when presenting them.
pub fn price_quote(base_usd: f64, params: &PricingParams) -> Result<PriceQuote, QuoteError> {
    non_negative("base_usd", base_usd)?;
    params.validate()?;
    let final_usd = base_usd * (1.0 + params.markup);
    let final_rmb = final_usd * params.exchange_rate * (1.0 + params.tax_rate);
    Ok(PriceQuote {
        final_usd,
        final_rmb,
    })
}

pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

fn default_quantity() -> u32 {
    1
}

/// One quotation line as consumed by the document exporters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotationItem {
    pub product: String,
    #[serde(default)]
    pub specimen: String,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub pack: String,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    #[serde(default)]
    pub final_usd_finished: f64,
    #[serde(default)]
    pub final_rmb_finished: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_usd_bulk: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_rmb_bulk: Option<f64>,
}

impl QuotationItem {
    /// Prices a search hit into a quotation line. The cut-off becomes the
    /// specimen and the pack doubles as the format; bulk prices are only
    /// quoted when the hit has a positive bulk base.
    pub fn priced(
        hit: &SearchResult,
        quantity: u32,
        params: &PricingParams,
    ) -> Result<Self, QuoteError> {
        if quantity == 0 {
            return Err(QuoteError::InvalidArgument(
                "quantity must be at least 1".to_string(),
            ));
        }
        let finished = price_quote(hit.finished_price_usd, params)?.rounded();
        let bulk = if hit.bulk_price_usd > 0.0 {
            Some(price_quote(hit.bulk_price_usd, params)?.rounded())
        } else {
            None
        };
        Ok(Self {
            product: hit.product.clone(),
            specimen: hit.cut_off.clone(),
            format: hit.pack.clone(),
            pack: hit.pack.clone(),
            quantity,
            final_usd_finished: finished.final_usd,
            final_rmb_finished: finished.final_rmb,
            final_usd_bulk: bulk.map(|q| q.final_usd),
            final_rmb_bulk: bulk.map(|q| q.final_rmb),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quotation {
    pub quotation_number: String,
    #[serde(default)]
    pub customer_name: String,
    #[serde(default)]
    pub items: Vec<QuotationItem>,
}

impl Quotation {
    pub fn number_at(at: DateTime<Utc>) -> String {
        format!("QT-{}", at.timestamp_millis())
    }

    pub fn new(customer_name: impl Into<String>, items: Vec<QuotationItem>, at: DateTime<Utc>) -> Self {
        Self {
            quotation_number: Self::number_at(at),
            customer_name: customer_name.into(),
            items,
        }
    }
}
