use anyhow::Result;
use clap::{Parser, Subcommand};
use node_validator::{
    config::{HeavyMode, PipelineConfig},
    core::ProcessRegistry,
    proxy::{dedup_candidates, CandidateParser},
    stage::TcpProbe,
    ValidationPipeline,
};
use std::path::PathBuf;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Multi-stage proxy node validator
#[derive(Parser)]
#[command(name = "node-validator")]
#[command(about = "Validate proxy nodes through TCP, proxy-core delay and unlock/speed stages")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full validation pipeline
    Validate {
        /// Candidate list (JSON records or a Clash `proxies:` document)
        input: PathBuf,
        /// Directory for valid_nodes.json and validation_stats.json
        #[arg(short, long, env = "PROXY_OUTPUT_DIR")]
        output_dir: Option<PathBuf>,
        /// Proxy-core binary
        #[arg(long, env = "CLASH_PATH")]
        core_binary: Option<PathBuf>,
        /// Number of heavy-test worker instances
        #[arg(short = 'w', long)]
        workers: Option<usize>,
        /// How many top nodes get heavy tests
        #[arg(short, long)]
        budget: Option<usize>,
        /// Heavy tests to run (off, unlock, speed, both)
        #[arg(long)]
        heavy_mode: Option<HeavyMode>,
        /// Keep original node names
        #[arg(long)]
        no_rename: bool,
    },
    /// Run only the TCP reachability stage and print every outcome
    Probe {
        /// Candidate list (JSON records or a Clash `proxies:` document)
        input: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let mut config = PipelineConfig::from_env();

    match cli.command {
        Commands::Validate {
            input,
            output_dir,
            core_binary,
            workers,
            budget,
            heavy_mode,
            no_rename,
        } => {
            if let Some(dir) = output_dir {
                config = config.with_output_dir(dir);
            }
            if let Some(binary) = core_binary {
                config = config.with_core_binary(binary);
            }
            if let Some(workers) = workers {
                config = config.with_worker_count(workers);
            }
            if let Some(budget) = budget {
                config = config.with_heavy_budget(budget);
            }
            if let Some(mode) = heavy_mode {
                config = config.with_heavy_mode(mode);
            }
            if no_rename {
                config = config.with_rename(false);
            }

            let parsed = CandidateParser::parse_file(&input)?;
            println!(
                "Loaded {} candidates from {:?} ({} skipped)",
                parsed.candidates.len(),
                input,
                parsed.skipped
            );

            let registry = ProcessRegistry::new();
            let pipeline = ValidationPipeline::new(config, registry.clone())?;
            let (nodes_path, stats_path) = pipeline.output_paths();

            tokio::select! {
                result = pipeline.run(parsed.candidates) => {
                    let report = result?;
                    let stats = &report.stats;
                    println!(
                        "Total: {}  TCP: {}  Delay: {}  Heavy-tested: {}  Valid: {}",
                        stats.total, stats.tcp_passed, stats.delay_passed, stats.unlock_tested, stats.valid
                    );
                    if let Some(reason) = &stats.early_exit {
                        println!("Run ended early: {}", reason);
                    }
                    for node in report.nodes.iter().take(10) {
                        println!("  {} ({}, {}ms)", node.candidate.name, node.kind(), node.latency_ms());
                    }
                    println!("Saved {:?} and {:?}", nodes_path, stats_path);
                }
                _ = tokio::signal::ctrl_c() => {
                    let killed = registry.kill_all();
                    warn!("Interrupted, killed {} proxy core process groups", killed);
                    eprintln!("Interrupted");
                }
            }
        }
        Commands::Probe { input } => {
            let parsed = CandidateParser::parse_file(&input)?;
            let candidates = dedup_candidates(parsed.candidates);
            println!("Probing {} candidates from {:?}", candidates.len(), input);

            let outcomes = TcpProbe::from_config(&config).probe(&candidates).await;
            let mut reachable = 0;
            for candidate in &candidates {
                let Some(outcome) = outcomes.get(&candidate.key()) else {
                    continue;
                };
                if outcome.is_reachable() {
                    reachable += 1;
                }
                let key = candidate.key().to_string();
                match outcome.latency_ms() {
                    Some(ms) => println!("{:<40} {:<14} {}ms", key, outcome.reason(), ms),
                    None => println!("{:<40} {}", key, outcome.reason()),
                }
            }
            println!("\n{}/{} reachable", reachable, candidates.len());
        }
    }

    Ok(())
}
