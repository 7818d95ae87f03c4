use crate::config::{ClusterSource, PipelineConfig};
use crate::error::{PipelineError, Result};
use crate::storage::{RecordStore, UpsertPlan};
use crate::types::{CastMember, ClusterAssignment, ElbowPoint};
use chrono::Utc;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, instrument, warn};

pub mod aggregate;
pub mod cluster;
pub mod flatten;
pub mod projection;
pub mod scaling;
pub mod writer;

use writer::{CastWriter, WriteSummary};

/// Result of the load pipeline
#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub credits_read: usize,
    pub cast_rows: usize,
    pub crew_entries: usize,
    pub crew_decode_failures: Vec<i64>,
    pub write: WriteSummary,
}

/// Result of the clustering pipeline
#[derive(Debug, Clone, Serialize)]
pub struct ClusterReport {
    pub actors: usize,
    pub clusters: usize,
    pub elbow: Option<Vec<ElbowPoint>>,
    pub embedded_points: Option<usize>,
    pub assignments_file: PathBuf,
    pub elbow_file: Option<PathBuf>,
    pub embedding_file: Option<PathBuf>,
}

pub struct Pipeline;

impl Pipeline {
    /// Read every credit record, flatten the cast payloads and upsert them into the cast table.
    #[instrument(skip(store, config), fields(backend = store.backend(), table = %config.writer.table))]
    pub async fn load_cast(store: &mut dyn RecordStore, config: &PipelineConfig) -> Result<LoadReport> {
        info!("Starting cast load into {}", config.writer.table);
        let t_load = Instant::now();

        let credits = Self::timed("read_credits", store.fetch_credits())
            .await
            .map_err(|source| PipelineError::Read {
                what: "credits",
                source,
            })?;
        crate::metrics::source::credits_read(credits.len());
        info!("Read {} credit records", credits.len());

        let t_flatten = Instant::now();
        let flattened = flatten::flatten_credits(&credits)?;
        crate::metrics::stage_duration("flatten", t_flatten.elapsed().as_secs_f64());
        if !flattened.crew_decode_failures.is_empty() {
            warn!(
                "Crew payload could not be decoded for {} movies",
                flattened.crew_decode_failures.len()
            );
        }
        info!("Flattened into {} cast rows", flattened.cast.len());

        let cast_rows = flattened.cast.len();
        let t_write = Instant::now();
        let summary = CastWriter::new(store, &config.writer)?.write(flattened.cast).await?;
        crate::metrics::stage_duration("write", t_write.elapsed().as_secs_f64());

        crate::metrics::stage_duration("load", t_load.elapsed().as_secs_f64());
        info!(
            "Cast load finished: {} rows in {} batches ({} in-batch duplicates collapsed)",
            summary.rows, summary.batches, summary.duplicates_collapsed
        );

        Ok(LoadReport {
            credits_read: credits.len(),
            cast_rows,
            crew_entries: flattened.crew_entries,
            crew_decode_failures: flattened.crew_decode_failures,
            write: summary,
        })
    }

    /// Aggregate actor features, cluster them and write the reports to the output directory.
    #[instrument(skip(store, config), fields(backend = store.backend(), k = config.clustering.clusters))]
    pub async fn cluster_actors(store: &mut dyn RecordStore, config: &PipelineConfig) -> Result<ClusterReport> {
        info!("Starting actor clustering");
        let t_cluster = Instant::now();

        let cast = Self::read_cast(store, config).await?;
        let movies = Self::timed("read_movies", store.fetch_movie_metrics())
            .await
            .map_err(|source| PipelineError::Read {
                what: "movies",
                source,
            })?;
        crate::metrics::source::movies_read(movies.len());
        info!("Read {} cast rows and {} movies", cast.len(), movies.len());

        let actors = aggregate::aggregate_actors(&cast, &movies, config.aggregate.group_by);
        info!("Aggregated {} actors", actors.len());

        let output_dir = config.output.dir.as_path();
        let (elbow, elbow_file) = if config.clustering.elbow {
            let t_elbow = Instant::now();
            let curve = cluster::elbow_curve(&actors, &config.clustering)?;
            crate::metrics::stage_duration("elbow", t_elbow.elapsed().as_secs_f64());
            let file = Self::persist_to_json(&curve, "elbow", output_dir)?;
            info!("Saved elbow curve to {}", file.display());
            (Some(curve), Some(file))
        } else {
            (None, None)
        };

        let actor_count = actors.len();
        let t_kmeans = Instant::now();
        let assignments = cluster::assign_clusters(actors, &config.clustering)?;
        crate::metrics::stage_duration("kmeans", t_kmeans.elapsed().as_secs_f64());
        let assignments_file = Self::persist_to_json(&assignments, "clusters", output_dir)?;
        info!("Saved cluster assignments to {}", assignments_file.display());

        let (embedded_points, embedding_file) = if config.projection.enabled {
            let (points, file) = Self::project_and_save(&assignments, config)?;
            (Some(points), Some(file))
        } else {
            info!("Projection disabled");
            (None, None)
        };

        crate::metrics::stage_duration("cluster", t_cluster.elapsed().as_secs_f64());
        Ok(ClusterReport {
            actors: actor_count,
            clusters: config.clustering.clusters,
            elbow,
            embedded_points,
            assignments_file,
            elbow_file,
            embedding_file,
        })
    }

    /// Load then cluster over the same connection.
    pub async fn run(store: &mut dyn RecordStore, config: &PipelineConfig) -> Result<(LoadReport, ClusterReport)> {
        let load = Self::load_cast(store, config).await?;
        let clusters = Self::cluster_actors(store, config).await?;
        Ok((load, clusters))
    }

    async fn read_cast(store: &mut dyn RecordStore, config: &PipelineConfig) -> Result<Vec<CastMember>> {
        match config.clustering.source {
            ClusterSource::Credits => {
                let credits = Self::timed("read_credits", store.fetch_credits())
                    .await
                    .map_err(|source| PipelineError::Read {
                        what: "credits",
                        source,
                    })?;
                crate::metrics::source::credits_read(credits.len());
                Ok(flatten::flatten_credits(&credits)?.cast)
            }
            ClusterSource::Warehouse => {
                let plan = UpsertPlan::for_cast(&config.writer.table)
                    .map_err(|e| PipelineError::Config(format!("writer.table: {e}")))?;
                Self::timed("read_cast", store.fetch_cast_members(&plan))
                    .await
                    .map_err(|source| PipelineError::Read {
                        what: "cast table",
                        source,
                    })
            }
        }
    }

    fn project_and_save(assignments: &[ClusterAssignment], config: &PipelineConfig) -> Result<(usize, PathBuf)> {
        let t_projection = Instant::now();
        let embedding = projection::project(assignments, &config.projection)?;
        crate::metrics::stage_duration("projection", t_projection.elapsed().as_secs_f64());

        let file = Self::persist_to_json(&embedding, "embedding", config.output.dir.as_path())?;
        info!(
            "Saved {}-component embedding of {} actors to {}",
            embedding.components,
            embedding.points.len(),
            file.display()
        );
        Ok((embedding.points.len(), file))
    }

    async fn timed<T, F>(stage: &'static str, fut: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        let started = Instant::now();
        let out = fut.await;
        crate::metrics::stage_duration(stage, started.elapsed().as_secs_f64());
        out
    }

    /// Write a report as pretty JSON to `<output_dir>/<prefix>_<timestamp>.json`
    fn persist_to_json<T: Serialize + ?Sized>(value: &T, prefix: &str, output_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(output_dir)?;

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let filepath = output_dir.join(format!("{prefix}_{timestamp}.json"));

        let json_content = serde_json::to_string_pretty(value)?;
        fs::write(&filepath, json_content)?;
        Ok(filepath)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommitMode;
    use crate::storage::SqliteStore;
    use crate::types::{ActorFeatureVector, Embedding};
    use rusqlite::Connection;

    fn seeded_store() -> SqliteStore {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE credits (movie_id INTEGER PRIMARY KEY, title TEXT, "cast" TEXT, crew TEXT);
            CREATE TABLE movies (id INTEGER PRIMARY KEY, budget INTEGER, popularity REAL, revenue INTEGER, vote_average REAL, vote_count INTEGER);
            "#,
        )
        .unwrap();

        for movie in 0..12i64 {
            let cast: Vec<_> = (0..3i64)
                .map(|slot| {
                    let person = (movie * 3 + slot) % 10;
                    serde_json::json!({
                        "id": person,
                        "name": format!("Actor {person}"),
                        "order": slot,
                        "gender": 1,
                        "cast_id": slot,
                        "character": format!("Role {slot}"),
                        "credit_id": format!("m{movie}-s{slot}")
                    })
                })
                .collect();
            conn.execute(
                "INSERT INTO credits VALUES (?1, ?2, ?3, '[]')",
                rusqlite::params![movie, format!("Movie {movie}"), serde_json::Value::Array(cast).to_string()],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO movies VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    movie,
                    1_000_000 * (movie + 1),
                    10.0 + movie as f64,
                    3_000_000 * (movie + 1),
                    5.0 + (movie % 4) as f64,
                    100 * (movie + 1)
                ],
            )
            .unwrap();
        }
        SqliteStore::from_connection(conn)
    }

    fn config(output: &Path) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.writer.create_table = true;
        config.writer.batch_size = 7;
        config.clustering.clusters = 3;
        config.clustering.elbow = true;
        config.clustering.elbow_max = 4;
        config.projection.max_iterations = 250;
        config.output.dir = output.to_path_buf();
        config
    }

    #[tokio::test]
    async fn test_load_reports_rows_and_batches() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = seeded_store();
        let report = Pipeline::load_cast(&mut store, &config(dir.path())).await.unwrap();

        assert_eq!(report.credits_read, 12);
        assert_eq!(report.cast_rows, 36);
        assert_eq!(report.write.rows, 36);
        assert_eq!(report.write.batches, 6);
        assert!(report.crew_decode_failures.is_empty());
    }

    #[tokio::test]
    async fn test_per_batch_load_matches_atomic_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.writer.commit = CommitMode::PerBatch;
        let mut store = seeded_store();
        Pipeline::load_cast(&mut store, &cfg).await.unwrap();

        let plan = UpsertPlan::for_cast(&cfg.writer.table).unwrap();
        assert_eq!(store.fetch_cast_members(&plan).await.unwrap().len(), 36);
    }

    #[tokio::test]
    async fn test_cluster_run_writes_reports() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let mut store = seeded_store();

        let report = Pipeline::cluster_actors(&mut store, &cfg).await.unwrap();
        assert_eq!(report.actors, 10);
        assert_eq!(report.elbow.as_ref().map(Vec::len), Some(4));
        assert_eq!(report.embedded_points, Some(10));

        let assignments: Vec<ClusterAssignment> =
            serde_json::from_str(&fs::read_to_string(&report.assignments_file).unwrap()).unwrap();
        assert_eq!(assignments.len(), 10);
        assert!(assignments.iter().all(|a| a.cluster < 3));

        let embedding_file = report.embedding_file.unwrap();
        let embedding: Embedding = serde_json::from_str(&fs::read_to_string(embedding_file).unwrap()).unwrap();
        assert_eq!(embedding.points.len(), 10);
        assert_eq!(embedding.perplexity, 2.25);
        assert!(report.elbow_file.unwrap().exists());
    }

    #[tokio::test]
    async fn test_warehouse_source_reads_loaded_table() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.clustering.source = ClusterSource::Warehouse;
        cfg.clustering.elbow = false;
        cfg.projection.enabled = false;
        let mut store = seeded_store();

        Pipeline::load_cast(&mut store, &cfg).await.unwrap();
        let report = Pipeline::cluster_actors(&mut store, &cfg).await.unwrap();
        assert_eq!(report.actors, 10);
        assert!(report.embedding_file.is_none());

        let assignments: Vec<ClusterAssignment> =
            serde_json::from_str(&fs::read_to_string(&report.assignments_file).unwrap()).unwrap();
        let first: &ActorFeatureVector = &assignments[0].actor;
        assert_eq!(first.name, "Actor 0");
        assert!(first.number_of_movies >= 3);
    }
}
