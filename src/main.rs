mod analyze;
mod auth;
mod batch;
mod config;
mod db;
mod extract;
mod identifier;
mod report;
mod scrape;
mod sheets;
mod validate;

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info, warn};

use crate::analyze::{GeminiAnalyzer, PromptTemplate};
use crate::auth::{FileTokenStore, OAuthConfig};
use crate::batch::{BatchItemResult, BatchObserver, BatchResult, FailedItem, Pipeline, Progress};
use crate::config::Settings;
use crate::scrape::OlostepClient;
use crate::sheets::{SheetTarget, SheetsWriter, WriteMode};

#[derive(Parser)]
#[command(
    name = "competitor_scan",
    about = "Amazon competitor analysis: scrape product pages, analyze with Gemini, export to Google Sheets"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scrape, analyze and export a batch of ASINs or product URLs
    Run(RunArgs),
    /// Print the canonical ASIN and product URL for each input
    Normalize {
        /// ASINs or product URLs
        inputs: Vec<String>,
    },
    /// Render the Markdown report of a stored run
    Report {
        /// Run id (default: latest)
        #[arg(long)]
        run: Option<i64>,
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List stored runs
    Runs {
        /// Max rows to display
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
    /// Google Sheets authorization
    Auth {
        #[command(subcommand)]
        action: AuthAction,
    },
}

#[derive(Args)]
struct RunArgs {
    /// ASINs or product URLs
    inputs: Vec<String>,
    /// Read more inputs from a file, one per line ('#' starts a comment)
    #[arg(short, long)]
    file: Option<PathBuf>,
    /// Items processed concurrently (default: SCAN_CHUNK_SIZE)
    #[arg(short, long)]
    chunk_size: Option<usize>,
    /// Destination: "Sheet ID: <id>", a spreadsheet URL, or a quoted tab name
    #[arg(long)]
    sheet: Option<String>,
    /// Skip the Google Sheets export
    #[arg(long)]
    no_sheets: bool,
    #[arg(long, value_enum, default_value = "append")]
    mode: WriteMode,
    /// Write the Markdown report to this file
    #[arg(short, long)]
    report: Option<PathBuf>,
}

#[derive(Subcommand)]
enum AuthAction {
    /// Print the consent URL to open in a browser
    Url,
    /// Exchange the authorization code from the redirect for tokens
    Exchange { code: String },
    /// Delete stored tokens
    Clear,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = Settings::load()?;

    let result = match cli.command {
        Commands::Run(args) => run(&settings, args).await,
        Commands::Normalize { inputs } => {
            for input in &inputs {
                match identifier::normalize(input) {
                    Some(id) => println!(
                        "{} -> {} ({})",
                        input,
                        id,
                        identifier::product_url(&id, &settings.scan_domain)
                    ),
                    None => println!("{} -> invalid", input),
                }
            }
            Ok(())
        }
        Commands::Report { run, output } => {
            let conn = db::connect(&settings.scan_db_path)?;
            db::init_schema(&conn)?;
            let run_id = match run {
                Some(id) => id,
                None => match db::latest_run_id(&conn)? {
                    Some(id) => id,
                    None => {
                        println!("No runs stored yet. Use 'run' first.");
                        return Ok(());
                    }
                },
            };
            let Some(batch) = db::load_run(&conn, run_id)? else {
                bail!("run {} not found", run_id);
            };
            let md = report::markdown_report(&batch);
            match output {
                Some(path) => {
                    write_report(&path, &md)?;
                    println!("Wrote report for run {} to {}", run_id, path.display());
                }
                None => print!("{}", md),
            }
            Ok(())
        }
        Commands::Runs { limit } => {
            let conn = db::connect(&settings.scan_db_path)?;
            db::init_schema(&conn)?;
            let runs = db::list_runs(&conn, limit)?;
            if runs.is_empty() {
                println!("No runs stored yet.");
                return Ok(());
            }
            println!(
                "{:>5} | {:<25} | {:>5} | {:>5} | {:>6}",
                "Run", "Finished", "Total", "OK", "Failed"
            );
            println!("{}", "-".repeat(58));
            for r in &runs {
                println!(
                    "{:>5} | {:<25} | {:>5} | {:>5} | {:>6}",
                    r.id,
                    truncate(&r.finished_at, 25),
                    r.total,
                    r.succeeded,
                    r.failed
                );
            }
            Ok(())
        }
        Commands::Auth { action } => auth(&settings, action).await,
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

async fn run(settings: &Settings, args: RunArgs) -> anyhow::Result<()> {
    let inputs = collect_inputs(&args.inputs, args.file.as_deref())?;
    if inputs.is_empty() {
        bail!("no inputs; pass ASINs or URLs, or --file");
    }

    let scraper = OlostepClient::new(settings.scrape_options()?)?;
    let template = match &settings.scan_prompt_path {
        Some(path) => PromptTemplate::from_file(path)?,
        None => PromptTemplate::default(),
    };
    let analyzer = GeminiAnalyzer::new(settings.analyzer_options()?, template)?;
    let mut opts = settings.batch_options();
    if let Some(n) = args.chunk_size {
        opts.chunk_size = n;
    }

    println!(
        "Analyzing {} products ({} at a time)...",
        inputs.len(),
        opts.chunk_size.max(1)
    );
    let pipeline = Pipeline::new(scraper, analyzer, opts);
    let observer = ConsoleObserver::new(inputs.len())?;
    let t_batch = Instant::now();
    let result = pipeline.run(&inputs, &observer).await;
    observer.pb.finish_and_clear();
    println!(
        "Processed {} products ({} ok, {} failed) in {}",
        result.summary.total,
        result.summary.succeeded,
        result.summary.failed,
        format_duration(t_batch.elapsed())
    );

    let conn = db::connect(&settings.scan_db_path)?;
    db::init_schema(&conn)?;
    let run_id = db::save_run(&conn, &result).context("saving run")?;
    info!("Stored as run {}", run_id);

    for (item, check) in result.items.iter().zip(report::item_checks(&result)) {
        if let Some(check) = check.filter(|c| !c.is_valid()) {
            warn!(input = %item.input(), "Suspect extraction: {}", check.issues.join("; "));
        }
    }

    print_table(&result);

    if let Some(path) = &args.report {
        write_report(path, &report::markdown_report(&result))?;
        println!("Report written to {}", path.display());
    }

    if args.no_sheets {
        return Ok(());
    }
    // Results are already stored, so a failed export is reported but loses nothing.
    if let Err(e) = export_to_sheets(settings, args.sheet.as_deref(), args.mode, &result).await {
        error!("Sheets export failed: {:#}", e);
        bail!("results saved as run {}, but the Sheets export failed", run_id);
    }
    Ok(())
}

async fn export_to_sheets(
    settings: &Settings,
    sheet: Option<&str>,
    mode: WriteMode,
    result: &BatchResult,
) -> anyhow::Result<()> {
    let default = settings.default_sheet();
    let target = match sheet {
        Some(text) => SheetTarget::parse(text, &default),
        None => default,
    };
    let store = FileTokenStore::new(&settings.scan_token_path, settings.oauth_config()?);
    let writer = SheetsWriter::new(store);
    let rows = report::table_rows(result);
    let summary = writer.write(&target, &report::HEADER, &rows, mode).await?;
    println!(
        "Wrote {} rows to '{}'{}",
        summary.updated_rows,
        target.sheet_name,
        if summary.wrote_header { " (with header)" } else { "" }
    );
    Ok(())
}

async fn auth(settings: &Settings, action: AuthAction) -> anyhow::Result<()> {
    match action {
        AuthAction::Url => {
            let store = FileTokenStore::new(&settings.scan_token_path, settings.oauth_config()?);
            let (url, state) = store.authorization_url()?;
            println!("Open this URL and approve access:\n\n{}\n", url);
            println!("state: {}", state);
            println!("Then run: competitor_scan auth exchange <code>");
        }
        AuthAction::Exchange { code } => {
            let store = FileTokenStore::new(&settings.scan_token_path, settings.oauth_config()?);
            store.exchange_code(code.trim()).await?;
            println!("Authorized. Tokens saved to {}", store.path().display());
        }
        AuthAction::Clear => {
            let store = FileTokenStore::new(&settings.scan_token_path, OAuthConfig::default());
            if store.clear()? {
                println!("Removed {}", store.path().display());
            } else {
                println!("No tokens stored at {}", store.path().display());
            }
        }
    }
    Ok(())
}

struct ConsoleObserver {
    pb: ProgressBar,
}

impl ConsoleObserver {
    fn new(total: usize) -> anyhow::Result<Self> {
        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
                .progress_chars("#>-"),
        );
        Ok(ConsoleObserver { pb })
    }
}

impl BatchObserver for ConsoleObserver {
    fn on_progress(&self, progress: &Progress<'_>) {
        self.pb.set_message(format!(
            "started {}/{}: {}",
            progress.current,
            progress.total,
            truncate(progress.input, 40)
        ));
    }

    fn on_failure(&self, failure: &FailedItem) {
        self.pb
            .println(format!("  x {}: {}", truncate(&failure.input, 40), failure.error));
    }

    fn on_item_done(&self, _item: &BatchItemResult) {
        self.pb.inc(1);
    }
}

/// Inputs from the command line, then from `file`. Blank lines and `#` comments are skipped.
fn collect_inputs(args: &[String], file: Option<&Path>) -> anyhow::Result<Vec<String>> {
    let mut inputs = args.to_vec();
    if let Some(path) = file {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        inputs.extend(
            text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_string),
        );
    }
    Ok(inputs)
}

fn write_report(path: &Path, markdown: &str) -> anyhow::Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, markdown).with_context(|| format!("writing {}", path.display()))
}

fn print_table(result: &BatchResult) {
    let rows = report::table_rows(result);
    if rows.is_empty() {
        return;
    }
    let show = |v: &str| {
        if extract::is_known(v) {
            v.to_string()
        } else {
            "-".to_string()
        }
    };

    println!(
        "\n{:>3} | {:<10} | {:<36} | {:>10} | {:>6} | {}",
        "#", "ASIN", "Title", "Price", "Rating", "Status"
    );
    println!("{}", "-".repeat(90));
    for (i, r) in rows.iter().enumerate() {
        println!(
            "{:>3} | {:<10} | {:<36} | {:>10} | {:>6} | {}",
            i + 1,
            truncate(&r[0], 10),
            truncate(&show(&r[1]), 36),
            show(&r[2]),
            show(&r[3]),
            truncate(&r[8], 60)
        );
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
