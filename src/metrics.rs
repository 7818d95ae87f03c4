//! Prometheus-style metrics for pipeline runs.
//!
//! Stages record through the small functions below; nothing is exported unless
//! `init` installed a recorder, in which case `write_snapshot` renders the
//! collected values into a text file at the end of the run.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::path::Path;

/// All metric names used by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    CreditsRead,
    MoviesRead,
    CastRowsFlattened,
    CrewDecodeFailures,
    BatchesWritten,
    RowsUpserted,
    DuplicateKeysCollapsed,
    ActorsAggregated,
    ClusterInertia,
    EmbeddedPoints,
    StageDuration,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::CreditsRead => "cast_pipeline_credits_read_total",
            MetricName::MoviesRead => "cast_pipeline_movies_read_total",
            MetricName::CastRowsFlattened => "cast_pipeline_cast_rows_flattened_total",
            MetricName::CrewDecodeFailures => "cast_pipeline_crew_decode_failures_total",
            MetricName::BatchesWritten => "cast_pipeline_batches_written_total",
            MetricName::RowsUpserted => "cast_pipeline_rows_upserted_total",
            MetricName::DuplicateKeysCollapsed => "cast_pipeline_duplicate_keys_collapsed_total",
            MetricName::ActorsAggregated => "cast_pipeline_actors_aggregated",
            MetricName::ClusterInertia => "cast_pipeline_cluster_inertia",
            MetricName::EmbeddedPoints => "cast_pipeline_embedded_points",
            MetricName::StageDuration => "cast_pipeline_stage_duration_seconds",
        }
    }
}

/// Install the Prometheus recorder and return the handle used to render it.
pub fn init() -> Result<PrometheusHandle, Box<dyn std::error::Error + Send + Sync>> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus recorder: {}", e))?;
    Ok(handle)
}

/// Render the current metric values to `path` in the Prometheus text format.
pub fn write_snapshot(handle: &PrometheusHandle, path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, handle.render())
}

pub fn stage_duration(stage: &'static str, secs: f64) {
    ::metrics::histogram!(MetricName::StageDuration.as_str(), "stage" => stage).record(secs);
}

pub mod source {
    use super::MetricName;

    pub fn credits_read(count: usize) {
        ::metrics::counter!(MetricName::CreditsRead.as_str()).increment(count as u64);
    }

    pub fn movies_read(count: usize) {
        ::metrics::counter!(MetricName::MoviesRead.as_str()).increment(count as u64);
    }
}

pub mod flatten {
    use super::MetricName;

    pub fn cast_rows(count: usize) {
        ::metrics::counter!(MetricName::CastRowsFlattened.as_str()).increment(count as u64);
    }

    pub fn crew_decode_failure() {
        ::metrics::counter!(MetricName::CrewDecodeFailures.as_str()).increment(1);
    }
}

pub mod writer {
    use super::MetricName;

    pub fn batch_written(rows: usize) {
        ::metrics::counter!(MetricName::BatchesWritten.as_str()).increment(1);
        ::metrics::counter!(MetricName::RowsUpserted.as_str()).increment(rows as u64);
    }

    pub fn duplicates_collapsed(count: usize) {
        ::metrics::counter!(MetricName::DuplicateKeysCollapsed.as_str()).increment(count as u64);
    }
}

pub mod clustering {
    use super::MetricName;

    pub fn actors_aggregated(count: usize) {
        ::metrics::gauge!(MetricName::ActorsAggregated.as_str()).set(count as f64);
    }

    pub fn inertia(clusters: usize, inertia: f64) {
        ::metrics::gauge!(MetricName::ClusterInertia.as_str(), "k" => clusters.to_string()).set(inertia);
    }

    pub fn embedded_points(count: usize) {
        ::metrics::gauge!(MetricName::EmbeddedPoints.as_str()).set(count as f64);
    }
}
