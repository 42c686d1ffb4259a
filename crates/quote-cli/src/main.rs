use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::Local;
use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use quote_catalog::{CatalogPipeline, QuoteSettings};
use quote_core::{price_quote, ErrorPayload, PricingParams, Quotation};
use quote_export::save_quotation_xlsx;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "quote-cli")]
#[command(about = "Price list search, pricing and quotation export")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Normalize the configured price list and publish a new snapshot.
    Build,
    Search {
        query: String,
        limit: Option<usize>,
    },
    Calculate {
        base_usd: f64,
        markup: Option<f64>,
        exchange_rate: Option<f64>,
        tax_rate: Option<f64>,
    },
    /// Write a quotation workbook. DATA is quotation JSON, or @file.
    ExportExcel {
        data: String,
        output: PathBuf,
    },
    Serve,
}

#[derive(Debug, Serialize)]
struct Envelope {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorPayload>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

impl Envelope {
    fn failure(payload: ErrorPayload) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(payload),
        }
    }

    fn print(&self) {
        match serde_json::to_string(self) {
            Ok(text) => println!("{text}"),
            Err(err) => println!("{}", json!({ "success": false, "error": { "kind": "internal", "message": err.to_string() } })),
        }
    }
}

/// Bad arguments become an `invalid_argument` payload; `None` for help and
/// version output, which clap prints itself.
fn usage_error(err: &clap::Error) -> Option<ErrorPayload> {
    if matches!(
        err.kind(),
        ErrorKind::DisplayHelp
            | ErrorKind::DisplayVersion
            | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
    ) {
        return None;
    }
    let rendered = err.render().to_string();
    let message = rendered
        .lines()
        .next()
        .unwrap_or_default()
        .trim_start_matches("error: ")
        .to_string();
    Some(ErrorPayload::new("invalid_argument", message))
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match usage_error(&err) {
            Some(payload) => {
                Envelope::failure(payload).print();
                return ExitCode::FAILURE;
            }
            None => err.exit(),
        },
    };

    let (envelope, code) = match run(cli.command.unwrap_or(Commands::Build)).await {
        Ok(data) => (
            Envelope {
                success: true,
                data: Some(data),
                error: None,
            },
            ExitCode::SUCCESS,
        ),
        Err(err) => {
            error!("{err:#}");
            let chain: &(dyn std::error::Error + 'static) = err.as_ref();
            (
                Envelope::failure(ErrorPayload::from_error_chain(chain)),
                ExitCode::FAILURE,
            )
        }
    };
    envelope.print();
    code
}

async fn run(command: Commands) -> Result<Value> {
    let settings = QuoteSettings::from_env()?;
    match command {
        Commands::Build => {
            let summary = CatalogPipeline::new(settings).run_once().await?;
            Ok(serde_json::to_value(summary)?)
        }
        Commands::Search { query, limit } => {
            let limit = settings.resolve_limit(limit)?;
            let engine = settings.match_engine();
            let catalog = CatalogPipeline::new(settings).load_or_build().await?;
            let hits = engine.search(&query, &catalog, limit)?;
            Ok(serde_json::to_value(hits)?)
        }
        Commands::Calculate {
            base_usd,
            markup,
            exchange_rate,
            tax_rate,
        } => {
            let params = pricing_overrides(&settings.pricing, markup, exchange_rate, tax_rate);
            let quote = price_quote(base_usd, &params)?.rounded();
            Ok(serde_json::to_value(quote)?)
        }
        Commands::ExportExcel { data, output } => {
            let quotation = parse_quotation(&data)?;
            save_quotation_xlsx(&quotation, Local::now().date_naive(), &output)?;
            Ok(json!({ "path": output.display().to_string() }))
        }
        Commands::Serve => {
            quote_web::serve(settings).await?;
            Ok(Value::Null)
        }
    }
}

fn pricing_overrides(
    defaults: &PricingParams,
    markup: Option<f64>,
    exchange_rate: Option<f64>,
    tax_rate: Option<f64>,
) -> PricingParams {
    PricingParams {
        markup: markup.unwrap_or(defaults.markup),
        exchange_rate: exchange_rate.unwrap_or(defaults.exchange_rate),
        tax_rate: tax_rate.unwrap_or(defaults.tax_rate),
    }
}

fn parse_quotation(data: &str) -> Result<Quotation> {
    let text = match data.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?,
        None => data.to_string(),
    };
    serde_json::from_str(&text).context("parsing quotation JSON")
}
