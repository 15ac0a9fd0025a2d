use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use popularity_index::{
    prepare_index, BuildConfig, EdgeId, EdgeTallyStrategy, EdgeWayIndex, FailurePolicy,
    LogReporter, NetworkGeometry, PopularityBuildStrategy, PopularityStore, RoadNetwork,
    TrackFileSource, WayPopularityStrategy,
};

#[derive(Parser)]
#[command(name = "popularity-index")]
#[command(about = "Per-edge popularity index built from GPS tracks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a popularity index for a network
    Build {
        /// Network geometry JSON
        network: PathBuf,
        /// Output index file
        output: PathBuf,
        /// Directory of track files (plain or gzip JSON)
        #[arg(long, conflicts_with = "way_popularity")]
        tracks: Option<PathBuf>,
        /// Per-way popularity JSON instead of tracks
        #[arg(long, requires = "edge_ways")]
        way_popularity: Option<PathBuf>,
        /// Edge id to way id mapping, used with --way-popularity
        #[arg(long)]
        edge_ways: Option<PathBuf>,
        /// Build config JSON
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Number of matching workers (0 = one per CPU)
        #[arg(short, long)]
        workers: Option<usize>,
        /// Skip unreadable track files instead of aborting
        #[arg(long)]
        best_effort: bool,
        /// Maximum snap distance in meters
        #[arg(long)]
        max_snap_distance: Option<f64>,
    },
    /// Print the popularity of edges
    Query {
        /// Index file
        index: PathBuf,
        /// Network geometry JSON the index was built for
        network: PathBuf,
        /// Edge ids
        #[arg(required = true)]
        edges: Vec<EdgeId>,
    },
    /// Print header and record statistics of an index file
    Inspect {
        /// Index file
        index: PathBuf,
    },
}

/// Network view sized from an index header.
struct RecordCount(usize);

impl RoadNetwork for RecordCount {
    fn edge_count(&self) -> usize {
        self.0
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Build {
            network,
            output,
            tracks,
            way_popularity,
            edge_ways,
            config,
            workers,
            best_effort,
            max_snap_distance,
        } => {
            let mut build_config = match config {
                Some(path) => BuildConfig::from_json_file(&path)
                    .with_context(|| format!("Failed to load config {}", path.display()))?,
                None => BuildConfig::default(),
            };
            if let Some(workers) = workers {
                build_config.workers = workers;
            }
            if let Some(distance) = max_snap_distance {
                build_config.max_snap_distance = distance;
            }
            if best_effort {
                build_config.failure_policy = FailurePolicy::BestEffort;
            }
            build_config.validate()?;

            let start = Instant::now();
            let geometry = NetworkGeometry::from_json_file(&network)
                .with_context(|| format!("Failed to load network {}", network.display()))?;
            info!(
                "Loaded network with {} edges ({} with geometry)",
                geometry.edge_count(),
                geometry.edges.len()
            );

            let strategy: Option<Box<dyn PopularityBuildStrategy>> = match (tracks, way_popularity) {
                (Some(dir), _) => Some(Box::new(EdgeTallyStrategy::new(
                    TrackFileSource::new(dir),
                    geometry.snap_index(),
                    build_config.clone(),
                )?)),
                (None, Some(file)) => {
                    let Some(mapping) = edge_ways else {
                        bail!("--way-popularity needs --edge-ways");
                    };
                    let edge_ways = EdgeWayIndex::from_json_file(&mapping)?;
                    Some(Box::new(WayPopularityStrategy::new(file, edge_ways)))
                }
                (None, None) => None,
            };

            let mut reporter = LogReporter::new(build_config.progress_interval);
            let (store, summary) =
                prepare_index(&output, &geometry, strategy.as_deref(), &mut reporter)
                    .with_context(|| format!("Failed to build index {}", output.display()))?;
            store.close();

            for failure in &summary.failures {
                eprintln!("skipped {}: {}", failure.path.display(), failure.error);
            }
            println!(
                "Wrote {} ({} files merged, {} failed, {} edges with evidence) in {:.2}s",
                output.display(),
                summary.files_merged,
                summary.failures.len(),
                summary.edges_with_evidence,
                start.elapsed().as_secs_f64()
            );
        }
        Commands::Query {
            index,
            network,
            edges,
        } => {
            let geometry = NetworkGeometry::from_json_file(&network)
                .with_context(|| format!("Failed to load network {}", network.display()))?;
            let Some(store) = PopularityStore::load_existing(&index, &geometry)? else {
                bail!("No popularity index at {}", index.display());
            };

            for edge_id in edges {
                if edge_id as usize >= store.edge_count() {
                    bail!(
                        "Edge {} is out of range (network has {} edges)",
                        edge_id,
                        store.edge_count()
                    );
                }
                println!("{}\t{}", edge_id, store.popularity(edge_id));
            }
            store.close();
        }
        Commands::Inspect { index } => {
            let header = PopularityStore::read_header(&index)?;
            println!("File:     {}", index.display());
            println!(
                "Magic:    0x{:08x} ({})",
                header.magic,
                if header.is_current() { "current" } else { "outdated" }
            );
            println!("Records:  {}", header.record_count);

            if !header.is_current() {
                return Ok(());
            }

            let sized = RecordCount(header.record_count as usize);
            let Some(store) = PopularityStore::load_existing(&index, &sized)? else {
                bail!("Index {} disappeared while reading it", index.display());
            };
            let raw = store.raw_records();
            let with_evidence = raw.iter().filter(|&&r| r > 0).count();
            let max = raw.iter().copied().max().unwrap_or(0);
            let total: u64 = raw.iter().map(|&r| u64::from(r)).sum();
            println!("Edges with evidence: {with_evidence}");
            println!("Max raw count:       {max}");
            println!("Total increments:    {total}");
            store.close();
        }
    }

    Ok(())
}
