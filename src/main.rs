use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rlm_engine::document::{DocumentLoader, ExtractingLoader};
use rlm_engine::domain::{DomainProvider, DomainStats, KeywordDomainRouter};
use rlm_engine::ipc::{self, IpcRequest, IpcResponse};
use rlm_engine::llm::{AnthropicClient, ResilientClient};
use rlm_engine::middleware::{CostTrackingMiddleware, LoggingMiddleware, MiddlewareChain, SynonymExpansionMiddleware};
use rlm_engine::query::{Outcome, QueryLoop, QueryResult};
use rlm_engine::sandbox::Sandbox;

mod cli;
mod config;

use cli::Cli;
use cli::commands::Commands;
use config::Config;

fn setup_logging(config: &Config) -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rlm-engine")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("rlm-engine.log");

    // Setup env_logger with file output
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    let mut builder = env_logger::Builder::new();
    if let Some(level) = &config.log_level {
        builder.parse_filters(level);
    }
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.target(env_logger::Target::Pipe(target)).init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

async fn run_application(cli: &Cli, config: &Config) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    match &cli.command {
        Commands::Query {
            document,
            questions,
            max_iterations,
            timeout,
            json,
        } => handle_query_command(document, questions, *max_iterations, *timeout, *json, config).await,
        Commands::SubQuery {
            port,
            prompt,
            context_slice,
        } => handle_sub_query_command(*port, prompt, context_slice.as_deref()).await,
        Commands::Detect { document } => handle_detect_command(document, cli.is_verbose()),
        Commands::Domains => {
            handle_domains_command();
            Ok(())
        }
    }
}

async fn handle_query_command(
    document: &Path,
    questions: &[String],
    max_iterations: Option<usize>,
    timeout: Option<Duration>,
    json: bool,
    config: &Config,
) -> Result<()> {
    let doc = ExtractingLoader::new()
        .load(document)
        .context(format!("Failed to load {}", document.display()))?;
    info!("Loaded {} ({} chars, {})", doc.id, doc.meta.chars, doc.meta.strategy);
    if !json {
        println!(
            "{} {} ({} chars via {})",
            "Loaded:".green(),
            document.display(),
            doc.meta.chars,
            doc.meta.strategy
        );
    }

    let mut query_config = config.query.clone();
    if let Some(max) = max_iterations {
        query_config.max_iterations = max;
    }
    let mut sandbox_config = config.sandbox.clone();
    if let Some(timeout) = timeout {
        sandbox_config.timeout = timeout;
    }

    let client = AnthropicClient::new(config.anthropic_config()).context("Failed to create model client")?;
    let client = Arc::new(ResilientClient::new(client, config.retry.policy()?));

    let cost = Arc::new(CostTrackingMiddleware::new(
        query_config.root_model.clone(),
        query_config.sub_model.clone(),
    ));
    let filename = document
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut middleware = MiddlewareChain::new()
        .with(LoggingMiddleware)
        .with(SynonymExpansionMiddleware::new(Arc::new(KeywordDomainRouter::new())).with_filename(filename));
    middleware.add(cost.clone());

    let query = QueryLoop::new(client, Sandbox::new(sandbox_config))
        .with_config(query_config)
        .with_ipc_config(config.ipc.server_config())
        .with_middleware(middleware);

    let results = tokio::select! {
        results = query.run_batch(questions, &doc.text) => results.context("Query failed")?,
        _ = tokio::signal::ctrl_c() => eyre::bail!("Interrupted"),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }

    for (question, result) in questions.iter().zip(&results) {
        print_result(question, result);
    }

    let totals = cost.totals();
    println!(
        "{} {} queries, {} tokens, ~${:.4}",
        "Total:".cyan(),
        totals.queries,
        totals.root_usage.total() + totals.sub_usage.total(),
        totals.cost_usd
    );
    Ok(())
}

fn print_result(question: &str, result: &QueryResult) {
    println!();
    println!("{} {}", "Question:".cyan(), question);
    let label = match result.outcome {
        Outcome::Answered => "Answer:".green(),
        Outcome::Exhausted => "Best effort:".yellow(),
        Outcome::Failed => "Failed:".red(),
    };
    println!("{} {}", label, result.answer);
    if let Some(reason) = &result.reason {
        println!("  {} {}", "Reason:".yellow(), reason);
    }
    for evidence in &result.evidence {
        println!("  {} {}", "Evidence:".dimmed(), evidence);
    }
    println!("  Confidence: {}", result.confidence);
    if let Some(verification) = &result.verification {
        println!("  Verification: {}", verification);
    }
    println!(
        "  {} iterations, {} sub-calls, {} tokens",
        result.iterations,
        result.sub_calls,
        result.total_usage().total()
    );
}

async fn handle_sub_query_command(port: u16, prompt: &str, context_slice: Option<&str>) -> Result<()> {
    let mut request = IpcRequest::new(prompt);
    if let Some(slice) = context_slice {
        request = request.with_context_slice(slice);
    }

    // Errors are printed, not raised, so shell code can read them like answers
    match ipc::sub_query(port, &request).await {
        Ok(IpcResponse::Response(text)) => println!("{}", text),
        Ok(IpcResponse::Error(message)) => println!("ERROR: {}", message),
        Err(e) => println!("ERROR: {}", e),
    }
    Ok(())
}

fn handle_detect_command(document: &Path, verbose: bool) -> Result<()> {
    let doc = ExtractingLoader::new()
        .load(document)
        .context(format!("Failed to load {}", document.display()))?;
    let filename = document
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let router = KeywordDomainRouter::new();
    let domain = router.detect(&doc.text, &filename);
    println!("{} {}", "Domain:".green(), domain);
    if let Some(table) = router.table(domain) {
        println!("  {}", table.description);
    }

    if verbose {
        for (candidate, score) in router.detect_multi(&doc.text, &filename, 0.0) {
            println!("  {:<10} {:.2}", candidate.to_string(), score);
        }
    }

    for (topic, question) in router.query_templates(domain) {
        println!("  {} {}", format!("{}:", topic).cyan(), question);
    }
    Ok(())
}

fn handle_domains_command() {
    let router = KeywordDomainRouter::new();
    let mut total = DomainStats::default();
    let mut count = 0;

    println!("{}", "Registered domains".bold());
    for table in router.tables() {
        let stats = table.stats();
        println!();
        println!("  {:<14} {}", table.id.to_string().cyan(), table.description);
        println!("    {:<20} {}", "synonym groups", stats.synonym_groups);
        println!("    {:<20} {}", "query templates", stats.query_templates);
        println!("    {:<20} {}", "detection patterns", stats.detection_patterns);
        println!("    {:<20} {}", "total terms", stats.total_terms);
        total.add(&stats);
        count += 1;
    }

    println!();
    println!(
        "{} {} domains, {} synonym groups, {} templates, {} patterns",
        "Total:".green(),
        count,
        total.synonym_groups,
        total.query_templates,
        total.detection_patterns
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    if cli.command.wants_file_logging() {
        setup_logging(&config).context("Failed to setup logging")?;
    }

    info!("Starting with config from: {:?}", cli.config);

    // Run the main application logic
    run_application(&cli, &config).await.context("Application failed")?;

    Ok(())
}
