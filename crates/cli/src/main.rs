//! `enhancer` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate`: validate a chain definition JSON file.
//! - `plan`:     print the execution plan of a chain definition.
//! - `enhance`:  enhance a text file with the built-in engines.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use enhancer::builtin::{KeywordEngine, LanguageEngine, WordCountEngine};
use enhancer::{Chain, ChainDefinition, ContentItem, validate_plan};
use jobmanager::{ChainManager, EngineManager, EventJobManager, JobManagerConfig};

#[derive(Parser)]
#[command(
    name = "enhancer",
    about = "Runs enhancement chains over content items",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a chain definition JSON file.
    Validate {
        /// Path to the chain JSON file.
        path: PathBuf,
    },
    /// Print the execution plan of a chain definition as JSON.
    Plan {
        /// Path to the chain JSON file.
        path: PathBuf,
    },
    /// Enhance a text file and print its metadata as JSON.
    Enhance {
        /// Chain definition to register. Repeatable; the first one is the
        /// default chain.
        #[arg(long = "chain", required = true)]
        chains: Vec<PathBuf>,
        /// Enhance with this registered chain instead of the default one.
        #[arg(long)]
        chain_name: Option<String>,
        /// Job manager configuration (JSON).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Overrides `max_wait_time_ms` of the configuration.
        #[arg(long, env = "ENHANCER_MAX_WAIT_MS")]
        max_wait_ms: Option<u64>,
        /// Keyword for the `keywords` engine, as `label=type`. Repeatable.
        #[arg(long = "keyword", value_parser = parse_keyword)]
        keywords: Vec<(String, String)>,
        /// The text file to enhance.
        input: PathBuf,
    },
}

fn parse_keyword(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((label, ty)) if !label.trim().is_empty() && !ty.trim().is_empty() => {
            Ok((label.trim().to_owned(), ty.trim().to_owned()))
        }
        _ => Err(format!("expected `label=type`, got '{s}'")),
    }
}

fn read_definition(path: &Path) -> Result<ChainDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("invalid chain definition in {}", path.display()))
}

fn read_config(path: Option<&Path>) -> Result<JobManagerConfig> {
    let Some(path) = path else {
        return Ok(JobManagerConfig::default());
    };
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("invalid job manager configuration in {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Validate { path } => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("cannot read file {}", path.display()))?;
            let definition: ChainDefinition =
                serde_json::from_str(&content).context("invalid JSON")?;

            match definition.execution_plan().and_then(|plan| validate_plan(&plan)) {
                Ok(order) => {
                    println!(
                        "✅ Chain '{}' is valid. Execution order: {order:?}",
                        definition.name()
                    );
                }
                Err(e) => {
                    eprintln!("❌ Validation failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        Command::Plan { path } => {
            let chain = Chain::from_definition(&read_definition(&path)?)?;
            println!("{}", serde_json::to_string_pretty(&*chain.execution_plan())?);
        }
        Command::Enhance {
            chains: chain_paths,
            chain_name,
            config,
            max_wait_ms,
            keywords,
            input,
        } => {
            let mut config = read_config(config.as_deref())?;
            if let Some(max_wait_ms) = max_wait_ms {
                config.max_wait_time_ms = max_wait_ms;
            }

            let engines = Arc::new(EngineManager::new());
            engines.register(Arc::new(LanguageEngine));
            engines.register(Arc::new(WordCountEngine));
            engines.register(Arc::new(KeywordEngine::new(keywords)));

            let mut definitions = Vec::with_capacity(chain_paths.len());
            for path in &chain_paths {
                definitions.push(read_definition(path)?);
            }
            if config.default_chain.is_none() {
                config.default_chain = definitions.first().map(|d| d.name().to_owned());
            }
            let chains = Arc::new(ChainManager::new(config.default_chain.clone()));
            for definition in &definitions {
                let chain = Chain::from_definition_for(definition, |name| engines.is_active(name))
                    .with_context(|| format!("invalid chain '{}'", definition.name()))?;
                chains.register(chain);
            }

            let text = std::fs::read_to_string(&input)
                .with_context(|| format!("cannot read file {}", input.display()))?;
            let item = Arc::new(ContentItem::new(
                format!("file://{}", input.display()),
                "text/plain",
                text.into_bytes(),
            ));

            let manager = EventJobManager::activate(engines, chains, config);
            info!(chains = ?manager.chains().names(), "enhancing {}", item.uri());
            let result = match &chain_name {
                Some(name) => manager.enhance_content_named(Arc::clone(&item), name).await,
                None => manager.enhance_content(Arc::clone(&item)).await,
            };
            manager.deactivate();

            // Engines still running after a timeout may hold the item's lock.
            let snapshot = Arc::clone(&item);
            let output = tokio::task::spawn_blocking(move || {
                json!({
                    "uri": snapshot.uri(),
                    "metadata": snapshot.metadata(),
                    "execution": snapshot.execution_metadata(),
                })
            })
            .await?;
            println!("{}", serde_json::to_string_pretty(&output)?);
            result.context("enhancement failed")?;
        }
    }
    Ok(())
}
