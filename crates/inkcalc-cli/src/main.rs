use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use inkcalc_contracts::answers::{parse_answers, ParseOutcome, VariableBindings};
use inkcalc_contracts::events::EventWriter;
use inkcalc_contracts::normalize::normalize_response_text;
use inkcalc_engine::{
    load_image, CompletionProvider, DryrunProvider, ExpressionAnalyzer, GeminiConfig,
    GeminiProvider, ProviderRegistry,
};
use serde_json::{json, Value};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "inkcalc", version, about = "Solve handwritten math from an image")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Analyze(AnalyzeArgs),
    Normalize(NormalizeArgs),
}

#[derive(Debug, Parser)]
struct AnalyzeArgs {
    #[arg(long)]
    image: PathBuf,
    /// Variable bindings as a JSON object, e.g. '{"x": 5}'.
    #[arg(long, conflicts_with = "vars_file")]
    vars: Option<String>,
    #[arg(long)]
    vars_file: Option<PathBuf>,
    #[arg(long, default_value = "gemini")]
    provider: String,
    #[arg(long)]
    model: Option<String>,
    /// Request timeout in seconds; no timeout when omitted.
    #[arg(long)]
    timeout: Option<f64>,
    #[arg(long)]
    events: Option<PathBuf>,
    /// Skip the network and treat this text as the model reply.
    #[arg(long)]
    dry_run_reply: Option<String>,
    #[arg(long)]
    pretty: bool,
}

#[derive(Debug, Parser)]
struct NormalizeArgs {
    /// Reply text file; stdin when omitted.
    #[arg(long)]
    input: Option<PathBuf>,
}

const LOG_ENV: &str = "INKCALC_LOG";

fn main() {
    init_logging();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("inkcalc error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Analyze(args) => run_analyze(args),
        Command::Normalize(args) => run_normalize(args),
    }
}

fn run_analyze(args: AnalyzeArgs) -> Result<i32> {
    let bindings = read_bindings(&args)?;
    let image = load_image(&args.image)?;
    let provider = select_provider(&args)?;

    let mut analyzer = ExpressionAnalyzer::new(provider);
    if let Some(path) = args.events.as_ref() {
        let session_id = uuid::Uuid::new_v4().to_string();
        analyzer = analyzer.with_events(EventWriter::new(path, session_id));
    }

    let entries = analyzer.analyze(&image, &bindings);
    let rendered = if args.pretty {
        serde_json::to_string_pretty(&entries)?
    } else {
        serde_json::to_string(&entries)?
    };
    println!("{rendered}");
    Ok(0)
}

fn read_bindings(args: &AnalyzeArgs) -> Result<VariableBindings> {
    let raw = match (args.vars.as_ref(), args.vars_file.as_ref()) {
        (Some(inline), _) => inline.clone(),
        (None, Some(path)) => fs::read_to_string(path)
            .with_context(|| format!("failed reading {}", path.display()))?,
        (None, None) => return Ok(VariableBindings::new()),
    };
    if raw.trim().is_empty() {
        return Ok(VariableBindings::new());
    }
    serde_json::from_str(&raw).context("variable bindings must be a JSON object")
}

fn select_provider(args: &AnalyzeArgs) -> Result<Arc<dyn CompletionProvider>> {
    let mut registry = ProviderRegistry::new();
    let requested = if args.dry_run_reply.is_some() {
        "dryrun"
    } else {
        args.provider.as_str()
    };
    registry.register(DryrunProvider::new(
        args.dry_run_reply.clone().unwrap_or_else(|| "[]".to_string()),
    ));

    match gemini_config(args) {
        Ok(config) => registry.register(GeminiProvider::new(config)?),
        Err(err) if requested == "gemini" => return Err(err),
        Err(err) => warn!(error = %format!("{err:#}"), "gemini provider unavailable"),
    }

    match registry.get(requested) {
        Some(provider) => Ok(provider),
        None => bail!(
            "unknown provider '{requested}' (available: {})",
            registry.names().join(", ")
        ),
    }
}

fn gemini_config(args: &AnalyzeArgs) -> Result<GeminiConfig> {
    let mut config = GeminiConfig::from_env()?;
    if let Some(model) = args
        .model
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        config.model = model.to_string();
    }
    if let Some(seconds) = args.timeout {
        config.request_timeout = Some(parse_timeout(seconds)?);
    }
    Ok(config)
}

fn parse_timeout(seconds: f64) -> Result<Duration> {
    match Duration::try_from_secs_f64(seconds) {
        Ok(timeout) if !timeout.is_zero() => Ok(timeout),
        _ => bail!("--timeout must be a positive number of seconds"),
    }
}

fn run_normalize(args: NormalizeArgs) -> Result<i32> {
    let raw = match args.input.as_ref() {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("failed reading {}", path.display()))?,
        None => {
            let mut buffer = String::new();
            io::stdin()
                .read_to_string(&mut buffer)
                .context("failed reading stdin")?;
            buffer
        }
    };

    let normalized = normalize_response_text(&raw);
    println!("{normalized}");
    let (summary, code) = outcome_summary(parse_answers(&normalized));
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(code)
}

fn outcome_summary(outcome: ParseOutcome) -> (Value, i32) {
    match outcome {
        ParseOutcome::Parsed {
            stage,
            entries,
            warnings,
        } => (
            json!({
                "stage": stage,
                "entries": entries,
                "warnings": warnings,
            }),
            0,
        ),
        ParseOutcome::Unparseable {
            literal_error,
            json_error,
        } => (
            json!({
                "stage": Value::Null,
                "literal_error": literal_error,
                "json_error": json_error,
            }),
            2,
        ),
    }
}
