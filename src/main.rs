use anyhow::Context;
use cast_pipeline::config::{ActorIdentity, ClusterSource, CommitMode, PipelineConfig};
use cast_pipeline::pipeline::{ClusterReport, LoadReport, Pipeline};
use cast_pipeline::storage::{self, StoreTarget};
use cast_pipeline::{logging, metrics};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "cast_pipeline")]
#[command(about = "Flatten movie credits into a cast table and cluster actors")]
#[command(version = "0.1.0")]
struct Cli {
    /// Pipeline config file (defaults to ./pipeline.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use a local SQLite database instead of the PostgreSQL warehouse
    #[arg(long, global = true)]
    sqlite: Option<PathBuf>,

    /// Write a Prometheus text snapshot of the run's metrics to this file
    #[arg(long, global = true)]
    metrics_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Flatten the credits table and upsert the cast rows
    Load(LoadArgs),
    /// Aggregate actor features, cluster them and project the clusters
    Cluster(ClusterArgs),
    /// Run load, then cluster, using the config file values
    Run,
}

#[derive(Clone, Copy)]
enum Stage {
    Load,
    Cluster,
    Run,
}

#[derive(Args)]
struct LoadArgs {
    /// Target cast table
    #[arg(long)]
    table: Option<String>,
    /// Rows per upsert statement
    #[arg(long)]
    batch_size: Option<usize>,
    /// Commit after every batch instead of once at the end
    #[arg(long)]
    per_batch_commit: bool,
    /// Create the cast table if it does not exist
    #[arg(long)]
    create_table: bool,
}

#[derive(Args)]
struct ClusterArgs {
    /// Number of clusters
    #[arg(long)]
    clusters: Option<usize>,
    /// Also compute the elbow curve
    #[arg(long)]
    elbow: bool,
    /// Actor identity to aggregate by
    #[arg(long, value_enum)]
    group_by: Option<ActorIdentity>,
    /// Where cast rows are read from
    #[arg(long, value_enum)]
    source: Option<ClusterSource>,
    /// Row limit for the projection
    #[arg(long)]
    sample_size: Option<usize>,
    /// Embedding dimensions (2 or 3)
    #[arg(long)]
    components: Option<usize>,
    #[arg(long)]
    perplexity: Option<f64>,
    /// Directory for the JSON reports
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Skip the projection step
    #[arg(long)]
    skip_projection: bool,
}

impl LoadArgs {
    fn apply(self, config: &mut PipelineConfig) {
        if let Some(table) = self.table {
            config.writer.table = table;
        }
        if let Some(batch_size) = self.batch_size {
            config.writer.batch_size = batch_size;
        }
        if self.per_batch_commit {
            config.writer.commit = CommitMode::PerBatch;
        }
        if self.create_table {
            config.writer.create_table = true;
        }
    }
}

impl ClusterArgs {
    fn apply(self, config: &mut PipelineConfig) {
        if let Some(k) = self.clusters {
            config.clustering.clusters = k;
        }
        if self.elbow {
            config.clustering.elbow = true;
        }
        if let Some(group_by) = self.group_by {
            config.aggregate.group_by = group_by;
        }
        if let Some(source) = self.source {
            config.clustering.source = source;
        }
        if let Some(sample_size) = self.sample_size {
            config.projection.sample_size = sample_size;
        }
        if let Some(components) = self.components {
            config.projection.components = components;
        }
        if let Some(perplexity) = self.perplexity {
            config.projection.perplexity = perplexity;
        }
        if let Some(dir) = self.output_dir {
            config.output.dir = dir;
        }
        if self.skip_projection {
            config.projection.enabled = false;
        }
    }
}

fn print_load(report: &LoadReport) {
    println!("\n📊 Load results:");
    println!("   Credit records: {}", report.credits_read);
    println!("   Cast rows: {}", report.cast_rows);
    println!("   Batches written: {}", report.write.batches);
    println!("   Duplicate keys collapsed: {}", report.write.duplicates_collapsed);
    if !report.crew_decode_failures.is_empty() {
        println!("   ⚠️  Undecodable crew payloads: {}", report.crew_decode_failures.len());
    }
}

fn print_clusters(report: &ClusterReport) {
    println!("\n📊 Cluster results:");
    println!("   Actors: {}", report.actors);
    println!("   Clusters: {}", report.clusters);
    if let Some(curve) = &report.elbow {
        for point in curve {
            println!("   k={:<2} inertia={:.3}", point.clusters, point.inertia);
        }
    }
    println!("   Assignments: {}", report.assignments_file.display());
    if let Some(file) = &report.elbow_file {
        println!("   Elbow curve: {}", file.display());
    }
    if let Some(file) = &report.embedding_file {
        println!("   Embedding: {}", file.display());
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let _guard = logging::init_logging();

    let cli = Cli::parse();

    let prometheus = match &cli.metrics_file {
        Some(_) => match metrics::init() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Metrics disabled: {}", e);
                None
            }
        },
        None => None,
    };

    let mut config = PipelineConfig::load(cli.config.as_deref()).context("failed to load pipeline config")?;
    let stage = match cli.command {
        Commands::Load(args) => {
            args.apply(&mut config);
            Stage::Load
        }
        Commands::Cluster(args) => {
            args.apply(&mut config);
            Stage::Cluster
        }
        Commands::Run => Stage::Run,
    };
    config.validate().context("invalid pipeline config")?;

    let target = StoreTarget::resolve(cli.sqlite.clone())?;
    let mut store = storage::connect(&target).await?;
    info!("Connected to {} store", store.backend());

    let outcome = match stage {
        Stage::Load => Pipeline::load_cast(store.as_mut(), &config).await.map(|r| print_load(&r)),
        Stage::Cluster => Pipeline::cluster_actors(store.as_mut(), &config)
            .await
            .map(|r| print_clusters(&r)),
        Stage::Run => Pipeline::run(store.as_mut(), &config).await.map(|(load, clusters)| {
            print_load(&load);
            print_clusters(&clusters);
        }),
    };

    // Release the connection before reporting the outcome.
    drop(store);

    if let (Some(handle), Some(path)) = (&prometheus, &cli.metrics_file) {
        match metrics::write_snapshot(handle, path) {
            Ok(()) => info!("Wrote metrics snapshot to {}", path.display()),
            Err(e) => warn!("Failed to write metrics snapshot to {}: {}", path.display(), e),
        }
    }

    if let Err(e) = &outcome {
        error!("Pipeline failed: {}", e);
    }
    outcome.context("pipeline run failed")?;
    println!("\n✅ Done");
    Ok(())
}
