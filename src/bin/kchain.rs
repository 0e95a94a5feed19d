/// KoruChain CLI - train and sample persistent Markov chains
///
/// Usage:
///   kchain train [FILE] [--tag TAG]...   - Learn one sequence per input line
///   kchain generate [--query JSON] [-n N] - Generate sequences
///   kchain configure [--shift BOOL]...     - Change mutable options
///   kchain stats                          - Show model statistics
///   kchain dump <partition>               - Print a partition's edges
///   kchain history                        - Print the audit log
use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use colored::*;
use koru_chain::history::{read_records, EventKind, EventPayload};
use koru_chain::persistence;
use koru_chain::{ModelHandle, ModelOptions, OptionsUpdate, PartitionId, Tag, TagQuery, Token, TrainOutcome};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// KoruChain - persistent sharded Markov chains
#[derive(Parser)]
#[command(name = "kchain")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Model directory (default: ~/.koru-chain/default)
    #[arg(short, long, global = true, env = "KCHAIN_MODEL")]
    model: Option<PathBuf>,

    /// Chain order used when creating a new model
    #[arg(long, global = true)]
    order: Option<usize>,

    /// Keep tokens exactly as given when creating a new model
    #[arg(long, global = true)]
    raw_tokens: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Learn sequences, one per line, split on whitespace
    ///
    /// Examples:
    ///   kchain train corpus.txt
    ///   cat lines.txt | kchain train --tag poem
    Train {
        /// Input file (default: stdin)
        file: Option<PathBuf>,

        /// Tag to record the edges under (repeatable)
        #[arg(short, long)]
        tag: Vec<String>,
    },

    /// Generate sequences
    ///
    /// Examples:
    ///   kchain generate
    ///   kchain generate -n 5 --query '{"Tag":{"Value":{"Symbol":"poem"}}}'
    Generate {
        /// Tag query as JSON (default: match everything)
        #[arg(short, long)]
        query: Option<String>,

        /// Tag to filter on; shorthand for a single-tag query
        #[arg(short, long, conflicts_with = "query")]
        tag: Option<String>,

        /// Number of sequences to generate
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,

        /// Maximum tokens per sequence
        #[arg(short, long, default_value_t = koru_chain::DEFAULT_STEP_LIMIT)]
        limit: usize,
    },

    /// Change mutable options
    Configure {
        /// Enable or disable the probability shifter
        #[arg(long)]
        shift: Option<bool>,

        /// Links per partition before resharding
        #[arg(long)]
        partition_size: Option<u64>,

        /// Seconds before an idle partition is closed
        #[arg(long)]
        idle_timeout: Option<u64>,

        /// Comma-separated event kinds to log, or "all" / "none"
        #[arg(long)]
        history: Option<String>,
    },

    /// Show model statistics
    Stats,

    /// Print every edge in a partition
    Dump {
        /// Partition id
        partition: u32,
    },

    /// Print the audit log
    History {
        /// Only show the last N records
        #[arg(short, long)]
        last: Option<usize>,
    },
}

/// Get the default model path (~/.koru-chain/default)
fn default_model_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".koru-chain")
        .join("default")
}

/// Options to load with: the stored ones for an existing model unless the
/// caller asked for something specific.
async fn creation_options(cli: &Cli, path: &Path) -> Result<ModelOptions> {
    let mut options = if persistence::exists(path).await {
        persistence::load(path)
            .await
            .context("Failed to read model state")?
            .options
    } else {
        ModelOptions::default()
    };
    if let Some(order) = cli.order {
        options.order = order;
    }
    if cli.raw_tokens {
        options.sanitize_tokens = false;
    }
    Ok(options)
}

fn parse_history(kinds: &str) -> Result<std::collections::BTreeSet<EventKind>> {
    match kinds {
        "all" => Ok(EventKind::all()),
        "none" | "" => Ok(Default::default()),
        list => list
            .split(',')
            .map(|kind| kind.trim().parse::<EventKind>().map_err(anyhow::Error::from))
            .collect(),
    }
}

fn format_tokens(tokens: &[Token]) -> String {
    tokens
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

async fn run_command(cli: &Cli, model: &ModelHandle) -> Result<()> {
    match &cli.command {
        Commands::Train { file, tag } => {
            let tags: Vec<Tag> = tag.iter().map(|t| Tag::symbol(t.as_str())).collect();
            let reader: Box<dyn BufRead> = match file {
                Some(path) => Box::new(BufReader::new(
                    std::fs::File::open(path).with_context(|| format!("Failed to open {}", path.display()))?,
                )),
                None => Box::new(BufReader::new(std::io::stdin())),
            };

            let (mut accepted, mut deferred) = (0usize, 0usize);
            for line in reader.lines() {
                let line = line.context("Failed to read input")?;
                let tokens: Vec<Token> = line.split_whitespace().map(Token::text).collect();
                if tokens.is_empty() {
                    continue;
                }
                match model.train(tokens, tags.clone()).await? {
                    TrainOutcome::Accepted => accepted += 1,
                    TrainOutcome::Deferred => deferred += 1,
                }
            }
            println!(
                "{} {} sequences trained, {} deferred",
                "OK".green().bold(),
                accepted,
                deferred
            );
        }

        Commands::Generate {
            query,
            tag,
            count,
            limit,
        } => {
            let query = match (query, tag) {
                (Some(json), _) => serde_json::from_str::<TagQuery>(json)
                    .with_context(|| format!("Invalid query JSON: {}", json))?,
                (None, Some(tag)) => TagQuery::tag(tag.as_str()),
                (None, None) => TagQuery::Always,
            };
            for _ in 0..*count {
                let tokens = model.generate_with_limit(query.clone(), *limit).await?;
                println!("{}", format_tokens(&tokens));
            }
        }

        Commands::Configure {
            shift,
            partition_size,
            idle_timeout,
            history,
        } => {
            let update = OptionsUpdate {
                shift_probabilities: *shift,
                partition_size: *partition_size,
                partition_idle_timeout: idle_timeout.map(Duration::from_secs),
                store_history: history.as_deref().map(parse_history).transpose()?,
                ..OptionsUpdate::default()
            };
            let options = model.configure(update).await?;
            println!("{}", "OK".green().bold());
            println!("{}", serde_json::to_string_pretty(&options)?);
        }

        Commands::Stats => {
            let stats = model.stats().await?;
            println!("{}", "Model Status".bold().cyan());
            println!();
            println!("  {} {}", "Path:".bright_white(), model.path().display());
            println!("  {} {}", "Order:".bright_white(), stats.order);
            println!("  {} {}", "Partitions:".bright_white(), stats.partitions);
            println!("  {} {}", "Links:".bright_white(), stats.total_link_count);
            println!(
                "  {} {}",
                "Shifting:".bright_white(),
                if stats.options.shift_probabilities { "on" } else { "off" }
            );
            if stats.resharding {
                println!(
                    "  {} {} contexts migrated, {} writes deferred",
                    "Resharding:".yellow(),
                    stats.migrated_contexts,
                    stats.deferred_writes
                );
            }
        }

        Commands::Dump { partition } => {
            let edges = model.dump_partition(PartitionId(*partition)).await?;
            if edges.is_empty() {
                println!("{}", "Partition is empty".yellow());
            }
            for edge in edges {
                println!(
                    "{} {} {} {}",
                    edge.context.to_string().bright_black(),
                    edge.tag.to_string().cyan(),
                    edge.target,
                    edge.weight.to_string().green()
                );
            }
        }

        Commands::History { last } => {
            let path = model.path().join("history.log");
            if !path.exists() {
                println!("{}", "No history recorded".yellow());
                return Ok(());
            }
            let records = read_records(&path)?;
            let skip = last.map_or(0, |n| records.len().saturating_sub(n));
            for record in records.into_iter().skip(skip) {
                let when = Utc
                    .timestamp_millis_opt(record.timestamp_ms)
                    .single()
                    .map(|ts| ts.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string())
                    .unwrap_or_else(|| record.timestamp_ms.to_string());
                let detail = match &record.payload {
                    EventPayload::Train { tokens, .. } | EventPayload::TrainDeferred { tokens, .. } => {
                        format_tokens(tokens)
                    }
                    EventPayload::Generate { output, .. } => format_tokens(output),
                    other => format!("{:?}", other),
                };
                println!(
                    "{} {} {}",
                    when.bright_black(),
                    format!("{:?}", record.event_kind).cyan(),
                    detail
                );
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let path = cli.model.clone().unwrap_or_else(default_model_path);
    let options = creation_options(&cli, &path).await?;

    let model = ModelHandle::load(&path, options)
        .await
        .with_context(|| format!("Failed to load model at {}", path.display()))?;

    // Always unload so control state and partitions reach disk
    let result = run_command(&cli, &model).await;
    model.unload().await.context("Failed to unload model")?;
    result
}
