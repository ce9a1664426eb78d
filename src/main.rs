use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use notegraph::analytics::Metric;
use notegraph::config::EngineConfig;
use notegraph::io::FormatRegistry;
use notegraph::{EngineFacade, EngineState};

/// Force-directed layout and analytics for linked-note graphs.
#[derive(Parser)]
#[command(name = "notegraph")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Engine configuration file (.yaml, .yml or .json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the layout to convergence and write the positioned graph
    Layout {
        /// Input graph (.json, .yaml or .yml)
        #[arg(short, long)]
        input: PathBuf,

        /// Output file (JSON); printed to stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Stop the layout after this many ticks
        #[arg(long, default_value = "10000")]
        max_ticks: u64,
    },
    /// Print centrality and communities as JSON
    Analyze {
        /// Input graph (.json, .yaml or .yml)
        #[arg(short, long)]
        input: PathBuf,

        /// Number of top-ranked nodes to list per metric
        #[arg(long, default_value = "10")]
        top: usize,
    },
    /// Print the shortest path between two nodes as JSON
    Path {
        /// Input graph (.json, .yaml or .yml)
        #[arg(short, long)]
        input: PathBuf,

        #[arg(long)]
        from: String,

        #[arg(long)]
        to: String,
    },
}

fn load_engine(input: &Path, config: Option<&Path>) -> anyhow::Result<EngineFacade> {
    let config = match config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let data = FormatRegistry::with_defaults()
        .read(input)
        .with_context(|| format!("failed to read graph {}", input.display()))?;

    let mut engine = EngineFacade::new(config)?;
    let report = engine.import(data);
    info!(
        nodes = report.nodes,
        edges = report.edges,
        rejected = report.rejected.len(),
        "loaded {}",
        input.display()
    );
    Ok(engine)
}

async fn layout(
    input: &Path,
    output: Option<&Path>,
    config: Option<&Path>,
    max_ticks: u64,
) -> anyhow::Result<()> {
    let mut engine = load_engine(input, config)?;
    engine.init_simulation()?;
    let state = engine.settle(max_ticks).await;
    if state != EngineState::Converged {
        warn!(?state, max_ticks, "layout stopped before converging");
    }

    let data = engine.export();
    match output {
        Some(path) => {
            FormatRegistry::with_defaults().write(&data, "json", path)?;
            println!(
                "Wrote layout of {} nodes to {}",
                data.nodes.len(),
                path.display()
            );
        }
        None => println!("{}", serde_json::to_string_pretty(&data)?),
    }
    Ok(())
}

fn analyze(input: &Path, config: Option<&Path>, top: usize) -> anyhow::Result<()> {
    let mut engine = load_engine(input, config)?;
    let centrality = engine.centrality_now();
    let communities = engine.communities_now();

    let report = json!({
        "version": centrality.version,
        "betweenness_method": centrality.value.betweenness_method,
        "top": {
            "degree": centrality.value.top_by(Metric::Degree, top),
            "betweenness": centrality.value.top_by(Metric::Betweenness, top),
            "pagerank": centrality.value.top_by(Metric::PageRank, top),
        },
        "scores": centrality.value.scores,
        "communities": communities.value.communities,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn path(input: &Path, config: Option<&Path>, from: &str, to: &str) -> anyhow::Result<()> {
    let engine = load_engine(input, config)?;
    let result = engine.find_path(from, to);
    println!("{}", serde_json::to_string_pretty(&result.value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Layout {
            input,
            output,
            max_ticks,
        } => layout(&input, output.as_deref(), config, max_ticks).await?,
        Commands::Analyze { input, top } => analyze(&input, config, top)?,
        Commands::Path { input, from, to } => path(&input, config, &from, &to)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_layout_subcommand() {
        let cli = Cli::try_parse_from([
            "notegraph",
            "layout",
            "--input",
            "graph.json",
            "--output",
            "out.json",
            "--max-ticks",
            "50",
        ])
        .unwrap();
        match cli.command {
            Commands::Layout {
                input,
                output,
                max_ticks,
            } => {
                assert_eq!(input, PathBuf::from("graph.json"));
                assert_eq!(output, Some(PathBuf::from("out.json")));
                assert_eq!(max_ticks, 50);
            }
            _ => panic!("Expected Layout command"),
        }
    }

    #[test]
    fn cli_parses_global_config() {
        let cli = Cli::try_parse_from([
            "notegraph",
            "analyze",
            "--input",
            "graph.yaml",
            "--config",
            "engine.yaml",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("engine.yaml")));
        assert!(matches!(cli.command, Commands::Analyze { top: 10, .. }));
    }

    #[test]
    fn cli_parses_path_subcommand() {
        let cli = Cli::try_parse_from([
            "notegraph", "path", "--input", "g.json", "--from", "a", "--to", "b",
        ])
        .unwrap();
        match cli.command {
            Commands::Path { from, to, .. } => {
                assert_eq!(from, "a");
                assert_eq!(to, "b");
            }
            _ => panic!("Expected Path command"),
        }
    }

    #[test]
    fn cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["notegraph"]).is_err());
    }
}
