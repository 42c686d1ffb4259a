//! Catalog build pipeline: raw price list -> normalized catalog -> published
//! Parquet snapshot, plus the search engine and settings shared by the CLI
//! and web front ends.

pub mod normalize;
pub mod search;
pub mod snapshot;

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use quote_core::{Catalog, PricingParams, QuoteError, CATALOG_COLUMNS};
use quote_source::source_for_path;
use quote_storage::SnapshotStore;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use normalize::{flatten_column, normalize, ColumnLabel, HeaderDepth, NormalizeOptions};
pub use search::{
    scorer_by_name, JaroWinklerScorer, MatchEngine, SimilarityScorer, TokenSetScorer,
};
pub use snapshot::{
    encode_snapshot, read_snapshot, read_snapshot_bytes, write_snapshot, SNAPSHOT_SCHEMA_VERSION,
};

pub const CRATE_NAME: &str = "quote-catalog";
pub const SETTINGS_FILE: &str = "quote.yaml";
pub const CURRENT_MANIFEST: &str = "current.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub oversample: usize,
    pub default_limit: usize,
    pub max_limit: usize,
    pub scorer: String,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            oversample: search::DEFAULT_OVERSAMPLE,
            default_limit: 10,
            max_limit: 50,
            scorer: "token-set".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuoteSettings {
    pub source_path: PathBuf,
    pub snapshot_dir: PathBuf,
    pub normalize: NormalizeOptions,
    pub search: SearchSettings,
    pub pricing: PricingParams,
    pub web_port: u16,
}

impl Default for QuoteSettings {
    fn default() -> Self {
        Self {
            source_path: PathBuf::from("data/price_list.xlsx"),
            snapshot_dir: PathBuf::from("./snapshots"),
            normalize: NormalizeOptions::default(),
            search: SearchSettings::default(),
            pricing: PricingParams::default(),
            web_port: 8000,
        }
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, raw: &str) -> Option<T> {
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = raw, "ignoring invalid setting override");
            None
        }
    }
}

impl QuoteSettings {
    /// Reads `quote.yaml` under `root` when present; defaults otherwise.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(SETTINGS_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_env() -> Result<Self> {
        let mut settings = Self::load(Path::new("."))?;
        settings.apply_env(|key| std::env::var(key).ok());
        Ok(settings)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("QUOTE_SOURCE_PATH") {
            self.source_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("QUOTE_SNAPSHOT_DIR") {
            self.snapshot_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("QUOTE_HEADER_ROW").and_then(|v| parse_override("QUOTE_HEADER_ROW", &v)) {
            self.normalize.header_row = v;
        }
        if let Some(v) = lookup("QUOTE_SEARCH_OVERSAMPLE")
            .and_then(|v| parse_override("QUOTE_SEARCH_OVERSAMPLE", &v))
        {
            self.search.oversample = v;
        }
        if let Some(v) = lookup("QUOTE_SEARCH_DEFAULT_LIMIT")
            .and_then(|v| parse_override("QUOTE_SEARCH_DEFAULT_LIMIT", &v))
        {
            self.search.default_limit = v;
        }
        if let Some(v) = lookup("QUOTE_SEARCH_MAX_LIMIT")
            .and_then(|v| parse_override("QUOTE_SEARCH_MAX_LIMIT", &v))
        {
            self.search.max_limit = v;
        }
        if let Some(v) = lookup("QUOTE_SCORER") {
            if scorer_by_name(&v).is_some() {
                self.search.scorer = v;
            } else {
                warn!(key = "QUOTE_SCORER", value = %v, "unknown scorer, keeping {}", self.search.scorer);
            }
        }
        if let Some(v) = lookup("QUOTE_MARKUP").and_then(|v| parse_override("QUOTE_MARKUP", &v)) {
            self.pricing.markup = v;
        }
        if let Some(v) = lookup("QUOTE_EXCHANGE_RATE")
            .and_then(|v| parse_override("QUOTE_EXCHANGE_RATE", &v))
        {
            self.pricing.exchange_rate = v;
        }
        if let Some(v) = lookup("QUOTE_TAX_RATE").and_then(|v| parse_override("QUOTE_TAX_RATE", &v)) {
            self.pricing.tax_rate = v;
        }
        if let Some(v) = lookup("QUOTE_WEB_PORT").and_then(|v| parse_override("QUOTE_WEB_PORT", &v)) {
            self.web_port = v;
        }
    }

    pub fn match_engine(&self) -> MatchEngine {
        let scorer = scorer_by_name(&self.search.scorer).unwrap_or_else(|| {
            warn!(scorer = %self.search.scorer, "unknown scorer, using token-set");
            Box::new(TokenSetScorer)
        });
        MatchEngine::new(scorer).with_oversample(self.search.oversample)
    }

    /// Applies the boundary default to a requested search limit. Limits
    /// outside `1..=max_limit` are rejected.
    pub fn resolve_limit(&self, requested: Option<usize>) -> Result<usize, QuoteError> {
        let max = self.search.max_limit.max(1);
        match requested {
            None => Ok(self.search.default_limit.clamp(1, max)),
            Some(0) => Err(QuoteError::InvalidArgument(
                "limit must be greater than 0".to_string(),
            )),
            Some(n) if n > max => Err(QuoteError::InvalidArgument(format!(
                "limit must be at most {max}, got {n}"
            ))),
            Some(n) => Ok(n),
        }
    }
}

/// Pointer to the live snapshot, replaced atomically on every build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub rows: usize,
    pub sha256: String,
    pub path: String,
    pub source: String,
    pub built_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildSummary {
    pub rows: usize,
    pub columns: Vec<String>,
    pub sha256: String,
    pub snapshot_path: String,
    pub manifest_path: String,
    pub deduplicated: bool,
    pub source: String,
    pub built_at: DateTime<Utc>,
}

/// Reads and normalizes the configured price list. Blocking.
pub fn build_catalog(settings: &QuoteSettings) -> Result<Catalog> {
    let source = source_for_path(&settings.source_path)?;
    let table = source
        .read_table()
        .with_context(|| format!("reading price list {}", source.source_id()))?;
    let catalog = normalize(&table, &settings.normalize)?;
    Ok(catalog)
}

pub struct CatalogPipeline {
    settings: QuoteSettings,
    store: SnapshotStore,
}

impl CatalogPipeline {
    pub fn new(settings: QuoteSettings) -> Self {
        let store = SnapshotStore::new(settings.snapshot_dir.clone());
        Self { settings, store }
    }

    pub fn settings(&self) -> &QuoteSettings {
        &self.settings
    }

    /// Rebuilds the catalog from the source and publishes it as the current
    /// snapshot. The previous snapshot stays live until the pointer is swapped.
    pub async fn rebuild(&self) -> Result<(Catalog, BuildSummary)> {
        let settings = self.settings.clone();
        let catalog = tokio::task::spawn_blocking(move || build_catalog(&settings))
            .await
            .context("joining catalog build task")??;

        let bytes = encode_snapshot(&catalog)?;
        let stored = self
            .store
            .store_bytes(snapshot::SNAPSHOT_EXTENSION, &bytes)
            .await?;

        let built_at = Utc::now();
        let source = self.settings.source_path.display().to_string();
        let manifest = SnapshotManifest {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            rows: catalog.len(),
            sha256: stored.content_hash.clone(),
            path: stored.relative_path.to_string_lossy().replace('\\', "/"),
            source: source.clone(),
            built_at,
        };
        let manifest_path = self.store.publish(CURRENT_MANIFEST, &manifest).await?;
        info!(
            rows = catalog.len(),
            hash = %stored.content_hash,
            deduplicated = stored.deduplicated,
            "published catalog snapshot"
        );

        let summary = BuildSummary {
            rows: catalog.len(),
            columns: CATALOG_COLUMNS.iter().map(|c| c.to_string()).collect(),
            sha256: stored.content_hash,
            snapshot_path: stored.absolute_path.display().to_string(),
            manifest_path: manifest_path.display().to_string(),
            deduplicated: stored.deduplicated,
            source,
            built_at,
        };
        Ok((catalog, summary))
    }

    pub async fn run_once(&self) -> Result<BuildSummary> {
        let (_, summary) = self.rebuild().await?;
        Ok(summary)
    }

    /// Loads the published snapshot, if any, after checking its hash.
    pub async fn load_current(&self) -> Result<Option<Catalog>> {
        let Some(manifest) = self
            .store
            .load_published::<SnapshotManifest>(CURRENT_MANIFEST)
            .await?
        else {
            return Ok(None);
        };
        if manifest.schema_version != SNAPSHOT_SCHEMA_VERSION {
            return Err(QuoteError::Snapshot(format!(
                "snapshot schema version {} is not supported",
                manifest.schema_version
            ))
            .into());
        }
        let verified = self
            .store
            .read_verified(&manifest.path, &manifest.sha256)
            .await?;
        let catalog = read_snapshot_bytes(Bytes::from(verified))?;
        if catalog.len() != manifest.rows {
            return Err(QuoteError::Snapshot(format!(
                "snapshot has {} rows, manifest says {}",
                catalog.len(),
                manifest.rows
            ))
            .into());
        }
        info!(rows = catalog.len(), hash = %manifest.sha256, "loaded catalog snapshot");
        Ok(Some(catalog))
    }

    pub async fn load_or_build(&self) -> Result<Catalog> {
        if let Some(catalog) = self.load_current().await? {
            return Ok(catalog);
        }
        info!("no published snapshot; building from source");
        let (catalog, _) = self.rebuild().await?;
        Ok(catalog)
    }
}

/// The live catalog. Readers clone the `Arc`; a rebuild swaps in a fully
/// built replacement.
#[derive(Debug, Default)]
pub struct CatalogHandle {
    inner: RwLock<Arc<Catalog>>,
}

impl CatalogHandle {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            inner: RwLock::new(Arc::new(catalog)),
        }
    }

    pub fn current(&self) -> Arc<Catalog> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the catalog that was replaced.
    pub fn replace(&self, catalog: Catalog) -> Arc<Catalog> {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, Arc::new(catalog))
    }
}

pub async fn build_catalog_once_from_env() -> Result<BuildSummary> {
    let settings = QuoteSettings::from_env()?;
    CatalogPipeline::new(settings).run_once().await
}
