use super::scaling::{ScaleError, StandardScaler};
use crate::config::ClusteringConfig;
use crate::constants::FEATURE_COLUMNS;
use crate::error::{PipelineError, Result};
use crate::types::{ActorFeatureVector, ClusterAssignment, ElbowPoint};
use linfa::prelude::*;
use linfa_clustering::KMeans;
use ndarray::{Array1, Array2, ArrayView2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, instrument, warn};

/// Feature matrix in `FEATURE_COLUMNS` order; null features are NaN.
pub fn feature_matrix(actors: &[ActorFeatureVector]) -> Array2<f64> {
    let mut matrix = Array2::from_elem((actors.len(), FEATURE_COLUMNS.len()), f64::NAN);
    for (mut row, actor) in matrix.rows_mut().into_iter().zip(actors) {
        for (cell, value) in row.iter_mut().zip(actor.features()) {
            if let Some(v) = value {
                *cell = v;
            }
        }
    }
    matrix
}

/// Standardized feature matrix, fitted on the same actors.
pub fn standardized_features(actors: &[ActorFeatureVector]) -> std::result::Result<Array2<f64>, ScaleError> {
    StandardScaler::fit_transform(feature_matrix(actors).view())
}

fn scale_error(e: ScaleError) -> PipelineError {
    match e {
        ScaleError::AllNull { column } => PipelineError::fit(format!(
            "feature column {} has no non-null values",
            FEATURE_COLUMNS.get(column).copied().unwrap_or("?")
        )),
        ScaleError::Empty => PipelineError::fit("no actors to cluster"),
    }
}

/// Labels and inertia of a k-means fit over a standardized matrix.
#[derive(Debug, Clone)]
pub struct KMeansFit {
    pub labels: Array1<usize>,
    /// Within-cluster sum of squared distances to the assigned centroid.
    pub inertia: f64,
}

/// Seeded k-means on an already standardized matrix.
pub fn fit_kmeans(data: ArrayView2<'_, f64>, k: usize, config: &ClusteringConfig) -> Result<KMeansFit> {
    let rows = data.nrows();
    if k == 0 {
        return Err(PipelineError::fit("number of clusters must be at least 1"));
    }
    if rows < k {
        return Err(PipelineError::fit(format!(
            "{rows} actors cannot be split into {k} clusters"
        )));
    }

    let records = data.to_owned();
    let dataset = DatasetBase::new(records.clone(), Array1::from_elem(rows, ()));
    let model = KMeans::params_with_rng(k, StdRng::seed_from_u64(config.seed))
        .n_runs(config.n_runs)
        .max_n_iterations(config.max_iterations)
        .tolerance(config.tolerance)
        .fit(&dataset)
        .map_err(|e| PipelineError::fit(format!("k-means with k={k} failed: {e}")))?;

    let labels: Array1<usize> = model.predict(&records);
    let centroids = model.centroids();
    let inertia = labels
        .iter()
        .zip(records.rows())
        .map(|(&label, row)| {
            row.iter()
                .zip(centroids.row(label))
                .map(|(x, c)| (x - c).powi(2))
                .sum::<f64>()
        })
        .sum();

    Ok(KMeansFit { labels, inertia })
}

/// Inertia for each k of the configured range, on the standardized features.
///
/// Diagnostic only. The upper end of the range is lowered to the number of
/// actors when there are fewer actors than clusters requested.
#[instrument(skip(actors, config), fields(actors = actors.len()))]
pub fn elbow_curve(actors: &[ActorFeatureVector], config: &ClusteringConfig) -> Result<Vec<ElbowPoint>> {
    let data = standardized_features(actors).map_err(scale_error)?;

    let upper = config.elbow_max.min(data.nrows());
    if upper < config.elbow_max {
        warn!(
            "Elbow range {}..={} truncated to {}..={} for {} actors",
            config.elbow_min,
            config.elbow_max,
            config.elbow_min,
            upper,
            data.nrows()
        );
    }
    if upper < config.elbow_min {
        return Err(PipelineError::fit(format!(
            "{} actors are fewer than the smallest elbow k {}",
            data.nrows(),
            config.elbow_min
        )));
    }

    let mut curve = Vec::with_capacity(upper - config.elbow_min + 1);
    for k in config.elbow_min..=upper {
        let fit = fit_kmeans(data.view(), k, config)?;
        debug!(k, inertia = fit.inertia, "Elbow point");
        crate::metrics::clustering::inertia(k, fit.inertia);
        curve.push(ElbowPoint {
            clusters: k,
            inertia: fit.inertia,
        });
    }
    Ok(curve)
}

/// Label every actor with its nearest centroid of a k-means fit over the standardized features.
#[instrument(skip(actors, config), fields(actors = actors.len(), k = config.clusters))]
pub fn assign_clusters(
    actors: Vec<ActorFeatureVector>,
    config: &ClusteringConfig,
) -> Result<Vec<ClusterAssignment>> {
    let k = config.clusters;
    if k == 0 || actors.len() < k {
        return Err(PipelineError::fit(format!(
            "{} actors cannot be split into {} clusters",
            actors.len(),
            k
        )));
    }

    let data = standardized_features(&actors).map_err(scale_error)?;
    let fit = fit_kmeans(data.view(), k, config)?;

    let mut sizes = vec![0usize; k];
    for &label in fit.labels.iter() {
        sizes[label] += 1;
    }
    info!("Clustered {} actors into {} clusters (inertia {:.3}, sizes {:?})", actors.len(), k, fit.inertia, sizes);
    crate::metrics::clustering::inertia(k, fit.inertia);

    Ok(actors
        .into_iter()
        .zip(fit.labels.iter().copied())
        .map(|(actor, cluster)| ClusterAssignment { actor, cluster })
        .collect())
}
