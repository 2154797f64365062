//! epubtrans CLI - mark and translate the content documents of an unpacked e-book.

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use epubtrans::config::Config;
use epubtrans::console::Console;
use epubtrans::document::Document;
use epubtrans::utils::collect_documents;
use epubtrans::{
    AnthropicBackend, CancelToken, GuidelineStyle, Orchestrator, RunOptions, TranslationCache,
    Translator, TranslatorSettings, UsageStore, marker, segment,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Bilingual e-book translator.
#[derive(Parser, Debug)]
#[command(name = "epubtrans")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Use this config file instead of the default location.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Tag translatable segments and insert empty placeholders.
    Mark {
        /// Content documents or directories of an unpacked book.
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Translate every segment that has no translation yet.
    Translate {
        /// Content documents or directories of an unpacked book.
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Source language.
        #[arg(long)]
        source: Option<String>,

        /// Target language.
        #[arg(long)]
        target: Option<String>,

        /// Number of segments translated at the same time.
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
        concurrency: Option<u32>,

        /// Extra instructions sent with every segment.
        #[arg(long)]
        instructions: Option<String>,

        /// Book title given to the model as context.
        #[arg(long)]
        book: Option<String>,

        /// Guideline template to use.
        #[arg(long, value_enum)]
        style: Option<GuidelineStyle>,

        /// Do not reuse results of identical requests.
        #[arg(long)]
        no_cache: bool,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show how many segments are translated.
    Status {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Print the counts as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show accumulated backend usage.
    Usage {
        /// Print the counters as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);
    let console = Console::new();

    match args.command {
        Command::Mark { paths } => mark(&console, &paths),
        Command::Status { paths, json } => status(&console, &paths, json),
        Command::Usage { json } => {
            let config = load_config(args.config.as_ref())?;
            usage(&console, &config, json)
        }
        Command::Translate {
            paths,
            source,
            target,
            concurrency,
            instructions,
            book,
            style,
            no_cache,
            json,
        } => {
            let mut config = load_config(args.config.as_ref())?;
            if let Some(source) = source {
                config.translation.source_language = source;
            }
            if let Some(target) = target {
                config.translation.target_language = target;
            }
            if let Some(concurrency) = concurrency {
                config.translation.concurrency = concurrency as usize;
            }
            if let Some(style) = style {
                config.translation.style = style;
            }
            if no_cache {
                config.cache.enabled = false;
            }

            let mut options = RunOptions::from_config(&config);
            options.instructions = instructions;
            options.book_context = book.unwrap_or_default();

            translate(&console, &config, &paths, options, json).await
        }
    }
}

/// Installs the log subscriber. `RUST_LOG` wins over `-v`.
fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;
    config.apply_env_overrides();
    Ok(config)
}

fn mark(console: &Console, paths: &[PathBuf]) -> Result<()> {
    let documents = collect_documents(paths).context("Failed to list documents")?;
    console.step(&format!("Marking {} documents...", documents.len()));

    let mut failures = 0;
    for path in &documents {
        match marker::mark_file(path) {
            Ok(stats) if stats.changed() => console.success(&format!(
                "{}: {} segments, {} new, {} restored, {} flagged",
                path.display(),
                stats.segments,
                stats.newly_marked,
                stats.placeholders_restored,
                stats.flagged_stale
            )),
            Ok(stats) => console.info(&format!(
                "{}: {} segments, unchanged",
                path.display(),
                stats.segments
            )),
            Err(e) => {
                failures += 1;
                console.error(&format!("{}: {}", path.display(), e));
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} documents could not be marked", failures);
    }
    Ok(())
}

fn status(console: &Console, paths: &[PathBuf], json: bool) -> Result<()> {
    let documents = collect_documents(paths).context("Failed to list documents")?;
    let mut rows = Vec::new();

    for path in documents {
        let counts = Document::read(&path).and_then(|document| segment::status(&document));
        match counts {
            Ok(counts) => rows.push((path, counts)),
            Err(e) => console.error(&format!("{}: {}", path.display(), e)),
        }
    }

    if json {
        let value: Vec<_> = rows
            .iter()
            .map(|(path, counts)| serde_json::json!({ "path": path, "status": counts }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    for (path, counts) in &rows {
        console.info(&format!(
            "{} {} translated, {} pending, {} flagged",
            console.counter(counts.translated, counts.total),
            path.display(),
            counts.pending,
            counts.flagged
        ));
    }
    Ok(())
}

fn usage(console: &Console, config: &Config, json: bool) -> Result<()> {
    let store = UsageStore::load(&config.paths.usage_file);
    let metadata = store.snapshot();

    if json {
        println!("{}", serde_json::to_string_pretty(&metadata)?);
        return Ok(());
    }

    console.section(&format!("Usage ({})", store.path().display()));
    console.info(&format!("Calls: {}", console.count(metadata.total_calls as usize)));
    console.info(&format!(
        "Tokens: {} in, {} out, {} total",
        metadata.input_tokens, metadata.output_tokens, metadata.total_tokens
    ));
    if let Some(last_used) = metadata.last_used {
        console.info(&format!("Last used: {}", last_used.to_rfc3339()));
    }
    for (model, calls) in &metadata.model_usage {
        console.info(&format!("{}: {} calls", model, calls));
    }
    Ok(())
}

async fn translate(
    console: &Console,
    config: &Config,
    paths: &[PathBuf],
    options: RunOptions,
    json: bool,
) -> Result<()> {
    config.validate().context("Invalid configuration")?;

    let documents = collect_documents(paths).context("Failed to list documents")?;
    if !json {
        console.step(&format!(
            "Translating {} documents from {} to {}...",
            documents.len(),
            options.source_lang,
            options.target_lang
        ));
    }

    let backend = Arc::new(AnthropicBackend::new(&config.api).context("Failed to create backend")?);
    let usage = Arc::new(UsageStore::load(&config.paths.usage_file));
    let translator = Arc::new(
        Translator::new(backend, TranslatorSettings::from_config(config)).with_usage(usage),
    );
    let cache = config.cache.enabled.then(|| {
        Arc::new(TranslationCache::new(
            config.cache.max_entries,
            config.cache.max_cost,
            config.cache.ttl(),
        ))
    });

    let mut orchestrator = Orchestrator::new(translator, cache);
    if !json {
        orchestrator = orchestrator.with_progress(|info| Console::new().segment_progress(info));
    }

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, finishing in-flight segments");
                cancel.cancel();
            }
        });
    }

    let report = orchestrator.run(&documents, &options, &cancel).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        console.report(&report);
    }

    if !report.is_clean() {
        anyhow::bail!(
            "{} segments failed, {} documents had errors",
            report.totals.failed,
            report.document_errors
        );
    }
    Ok(())
}
