//! CLI binary for edgequake-invoice.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `ExtractionConfig` and prints results.

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use edgequake_invoice::money::format_minor_units;
use edgequake_invoice::pipeline::input::resolve_input;
use edgequake_invoice::pipeline::preprocess::preprocess_bytes;
use edgequake_invoice::prompts::{extraction_prompt, schema_instruction};
use edgequake_invoice::{
    extract, ExtractionConfig, ExtractionReport, ExtractionSchema, InvoiceRecord, InvoiceStatus,
    JobOutcome, Party, PipelineObserver, PreprocessOptions, Rendition, SchemaVariant,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

/// Status label in its badge colour.
fn badge(status: InvoiceStatus) -> String {
    let code = match status.color() {
        "green" => "1;32",
        "red" => "1;31",
        "yellow" => "1;33",
        "blue" => "1;34",
        _ => "1;90",
    };
    format!("\x1b[{code}m{}\x1b[0m", status.label())
}

// ── CLI observer using indicatif ─────────────────────────────────────────────

/// Terminal observer: a spinner whose message follows the record through
/// preprocessing and the model call.
struct CliObserver {
    bar: ProgressBar,
}

impl CliObserver {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  {elapsed:.dim}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Uploading");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }
}

impl PipelineObserver for CliObserver {
    fn on_upload(&self, _record_id: Uuid, filename: &str) {
        self.bar.set_prefix("Preprocessing");
        self.bar.set_message(filename.to_string());
    }

    fn on_preprocess_complete(&self, _record_id: Uuid, bytes: usize) {
        self.bar.println(format!(
            "  {} vision-optimized rendition  {}",
            green("✓"),
            dim(&format!("{bytes} bytes"))
        ));
    }

    fn on_preprocess_failed(&self, _record_id: Uuid, error: &str) {
        self.bar.println(format!(
            "  {} preprocessing failed, using original  {}",
            yellow("⚠"),
            dim(error)
        ));
    }

    fn on_extraction_start(&self, _record_id: Uuid, rendition: Rendition) {
        self.bar.set_prefix("Extracting");
        self.bar.set_message(format!("reading {rendition}"));
    }

    fn on_extraction_complete(&self, _record_id: Uuid, _outcome: &JobOutcome) {
        self.bar.finish_and_clear();
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Extract a receipt photo
  eq-invoice extract receipt.jpg

  # Require invoice number, date, sender, total and currency in the reply
  eq-invoice extract --strict invoice.pdf

  # Full record as JSON
  eq-invoice extract --json https://example.com/bill.png > bill.json

  # Inspect what the model will see
  eq-invoice preprocess receipt.jpg -o receipt.vision.png

  # Print the response schema or the prompt
  eq-invoice schema --strict
  eq-invoice prompt --date 2024-03-01

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to libpdfium, needed for PDF uploads
"#;

/// Extract structured invoice data from images and PDFs using Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "eq-invoice",
    version,
    about = "Extract structured invoice data from images and PDFs using Vision LLMs",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// LLM model ID (e.g. gpt-4o-mini, gpt-4.1, claude-sonnet-4-20250514).
    #[arg(long, global = true, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, global = true, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "EQ_INVOICE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "EQ_INVOICE_QUIET")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload, preprocess and extract one document.
    Extract(ExtractArgs),
    /// Write the vision-optimized rendition of a document.
    Preprocess(PreprocessArgs),
    /// Print the JSON Schema sent to the model.
    Schema {
        /// Use the strict required-field set.
        #[arg(long)]
        strict: bool,
    },
    /// Print the extraction prompt.
    Prompt {
        /// Date the prompt treats as today (YYYY-MM-DD).
        #[arg(long)]
        date: Option<NaiveDate>,
    },
}

#[derive(Args, Debug)]
struct ExtractArgs {
    /// Local image/PDF path or HTTP/HTTPS URL.
    input: String,

    /// Output the full record and outcome as JSON.
    #[arg(long, env = "EQ_INVOICE_JSON")]
    json: bool,

    /// Write the JSON report to this file instead of stdout.
    #[arg(short, long, env = "EQ_INVOICE_OUTPUT")]
    output: Option<PathBuf>,

    /// Require invoice number, date, sender, total and currency.
    #[arg(long, env = "EQ_INVOICE_STRICT")]
    strict: bool,

    /// Disable the spinner.
    #[arg(long, env = "EQ_INVOICE_NO_PROGRESS")]
    no_progress: bool,

    /// Max LLM output tokens.
    #[arg(long, env = "EQ_INVOICE_MAX_TOKENS", default_value_t = 4096)]
    max_tokens: usize,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "EQ_INVOICE_TEMPERATURE", default_value_t = 0.0)]
    temperature: f32,

    /// LLM call timeout in seconds.
    #[arg(long, env = "EQ_INVOICE_API_TIMEOUT", default_value_t = 120)]
    api_timeout: u64,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "EQ_INVOICE_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Maximum accepted upload size in bytes.
    #[arg(long, env = "EQ_INVOICE_MAX_UPLOAD_BYTES", default_value_t = 5 * 1024 * 1024)]
    max_upload_bytes: usize,

    #[command(flatten)]
    preprocess: PreprocessFlags,
}

#[derive(Args, Debug)]
struct PreprocessArgs {
    /// Local image/PDF path or HTTP/HTTPS URL.
    input: String,

    /// Where to write the PNG.
    #[arg(short, long)]
    output: PathBuf,

    #[command(flatten)]
    preprocess: PreprocessFlags,
}

#[derive(Args, Debug, Clone)]
struct PreprocessFlags {
    /// Brightness adjustment (−100–100).
    #[arg(long, default_value_t = 5, allow_negative_numbers = true)]
    brightness: i32,

    /// Contrast adjustment (−100–100).
    #[arg(long, default_value_t = 10.0, allow_negative_numbers = true)]
    contrast: f32,

    /// Sharpen amount (0–100).
    #[arg(long, default_value_t = 15.0)]
    sharpen: f32,

    /// Longest edge of the rendition in pixels.
    #[arg(long, default_value_t = 1024)]
    max_size: u32,
}

impl From<&PreprocessFlags> for PreprocessOptions {
    fn from(f: &PreprocessFlags) -> Self {
        let defaults = PreprocessOptions::default();
        PreprocessOptions {
            brightness: f.brightness,
            contrast: f.contrast,
            sharpen: f.sharpen,
            working_max: defaults.working_max.max(f.max_size),
            target_max: f.max_size,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The spinner gives the feedback that matters; keep library INFO logs
    // out of its way unless asked.
    let show_progress = match &cli.command {
        Command::Extract(args) => !cli.quiet && !args.no_progress && !args.json,
        _ => false,
    };
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match &cli.command {
        Command::Extract(args) => run_extract(&cli, args, show_progress).await,
        Command::Preprocess(args) => run_preprocess(&cli, args).await,
        Command::Schema { strict } => {
            let schema = ExtractionSchema::for_variant(variant(*strict));
            let json = serde_json::to_string_pretty(&schema.to_json_schema())
                .context("Failed to serialise schema")?;
            println!("{json}");
            Ok(())
        }
        Command::Prompt { date } => {
            let today = date.unwrap_or_else(|| Utc::now().date_naive());
            println!("{}", extraction_prompt(today));
            if cli.verbose {
                println!("\n{}", schema_instruction(&ExtractionSchema::invoice()));
            }
            Ok(())
        }
    }
}

fn variant(strict: bool) -> SchemaVariant {
    if strict {
        SchemaVariant::Strict
    } else {
        SchemaVariant::Lenient
    }
}

async fn run_extract(cli: &Cli, args: &ExtractArgs, show_progress: bool) -> Result<()> {
    let mut builder = ExtractionConfig::builder()
        .temperature(args.temperature)
        .max_tokens(args.max_tokens)
        .api_timeout_secs(args.api_timeout)
        .download_timeout_secs(args.download_timeout)
        .max_upload_bytes(args.max_upload_bytes)
        .schema_variant(variant(args.strict))
        .preprocess(PreprocessOptions::from(&args.preprocess));
    if let Some(ref model) = cli.model {
        builder = builder.model(model.clone());
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider.clone());
    }
    if show_progress {
        builder = builder.observer(CliObserver::new());
    }
    let config = builder.build().context("Invalid configuration")?;

    let report = extract(&args.input, &config)
        .await
        .context("Extraction failed")?;

    if let Some(ref path) = args.output {
        let json = serde_json::to_string_pretty(&report).context("Failed to serialise report")?;
        write_atomic(path, json.as_bytes()).await?;
        if !cli.quiet {
            eprintln!(
                "{}  {}  →  {}",
                outcome_mark(&report.outcome),
                report.record.status,
                bold(&path.display().to_string())
            );
        }
    } else if args.json {
        let json = serde_json::to_string_pretty(&report).context("Failed to serialise report")?;
        println!("{json}");
    } else {
        print_report(&report);
    }

    if report.outcome.needs_attention() {
        anyhow::bail!("Record {} needs attention: {:?}", report.record.id, report.outcome);
    }
    Ok(())
}

async fn run_preprocess(cli: &Cli, args: &PreprocessArgs) -> Result<()> {
    let options = PreprocessOptions::from(&args.preprocess);
    options.validate().context("Invalid preprocessing options")?;

    let doc = resolve_input(&args.input, 120)
        .await
        .context("Failed to read input")?;
    let mime = doc.mime;
    let png = tokio::task::spawn_blocking(move || preprocess_bytes(&doc.bytes, mime, &options))
        .await
        .context("Preprocessing task panicked")?
        .context("Preprocessing failed")?;

    write_atomic(&args.output, &png).await?;
    if !cli.quiet {
        eprintln!(
            "{}  {} bytes  →  {}",
            green("✔"),
            png.len(),
            bold(&args.output.display().to_string())
        );
    }
    Ok(())
}

/// Write via a temp file and rename so readers never see a partial file.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {:?}", parent))?;
    }
    let tmp_path = path.with_extension("tmp");
    tokio::fs::write(&tmp_path, bytes)
        .await
        .with_context(|| format!("Failed to write {:?}", tmp_path))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("Failed to move output into place at {:?}", path))?;
    Ok(())
}

// ── Human-readable output ────────────────────────────────────────────────────

fn outcome_mark(outcome: &JobOutcome) -> String {
    match outcome {
        JobOutcome::Processed => green("✔"),
        JobOutcome::NoInvoice(_) => yellow("○"),
        JobOutcome::Stuck(_) | JobOutcome::Aborted(_) => red("✘"),
    }
}

fn print_report(report: &ExtractionReport) {
    let r = &report.record;
    println!(
        "{} {}  {}",
        outcome_mark(&report.outcome),
        badge(r.status),
        dim(&format!("{:?}", report.outcome))
    );
    line("File", Some(&r.filename));
    line("Title", r.invoice_title.as_deref());
    line("Description", r.invoice_description.as_deref());

    if r.status == InvoiceStatus::Processed {
        line("Number", r.invoice_number.as_deref());
        line("Date", r.invoice_date.map(|d| d.to_string()).as_deref());
        party("Sender", &r.sender);
        party("Recipient", &r.recipient);
        print_amounts(r);
        line("Terms", r.payment_terms.as_deref());
        line("Notes", r.notes.as_deref());
    }

    line("Confidence", r.confidence.map(|c| format!("{c}%")).as_deref());
    line(
        "Read from",
        r.extraction_source.map(|s| s.to_string()).as_deref(),
    );
    if let Some(ref model) = r.telemetry.model {
        println!(
            "{}",
            dim(&format!(
                "   {model}: {} tokens in  /  {} tokens out  —  {}ms total",
                r.telemetry.prompt_tokens.unwrap_or(0),
                r.telemetry.completion_tokens.unwrap_or(0),
                report.elapsed_ms
            ))
        );
    }
}

fn line(label: &str, value: Option<&str>) {
    if let Some(v) = value {
        println!("  {:<12} {}", dim(label), v);
    }
}

fn party(label: &str, p: &Party) {
    if p.is_empty() {
        return;
    }
    let parts: Vec<&str> = [&p.company_name, &p.address, &p.email, &p.tax_number]
        .into_iter()
        .filter_map(|f| f.as_deref())
        .collect();
    line(label, Some(&parts.join(", ")));
}

fn print_amounts(r: &InvoiceRecord) {
    let currency = r.currency.as_deref();
    for (name, amount) in r.amounts() {
        let Some(amount) = amount else { continue };
        let rendered = if name == "tax_rate" {
            format!("{}%", format_minor_units(amount, None))
        } else {
            format_minor_units(amount, currency)
        };
        line(name, Some(&rendered));
    }
}
