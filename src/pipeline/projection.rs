use super::cluster::feature_matrix;
use super::scaling::{ScaleError, StandardScaler};
use crate::config::ProjectionConfig;
use crate::constants::FEATURE_COLUMNS;
use crate::error::{PipelineError, Result};
use crate::types::{ActorFeatureVector, ClusterAssignment, EmbeddedPoint, Embedding};
use linfa::prelude::*;
use linfa_tsne::TSneParams;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, instrument, warn};

/// Fewest rows the neighbour embedding can run on.
pub const MIN_PROJECTION_ROWS: usize = 5;

/// Seeded uniform sample of at most `limit` rows, without replacement.
///
/// Kept rows stay in input order. Inputs at or under the limit are returned whole.
pub fn downsample<T: Clone>(rows: &[T], limit: usize, seed: u64) -> Vec<T> {
    if rows.len() <= limit {
        return rows.to_vec();
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut picked = rand::seq::index::sample(&mut rng, rows.len(), limit).into_vec();
    picked.sort_unstable();
    picked.into_iter().map(|i| rows[i].clone()).collect()
}

/// Largest perplexity used for `rows` points, rounded down to hundredths.
///
/// The Barnes-Hut gradient overflows the stack as perplexity approaches
/// `(rows - 1) / 3`, so the bound stays at `(rows - 1) / 4`.
pub fn max_perplexity(rows: usize) -> f64 {
    let bound = rows.saturating_sub(1) as f64 / 4.0;
    (bound * 100.0).floor() / 100.0
}

/// Embed clustered actors into `components` dimensions for display.
///
/// Features are standardized afresh on the (possibly downsampled) rows; the
/// resulting coordinates carry each row's name and cluster label.
#[instrument(skip(assignments, config), fields(rows = assignments.len(), components = config.components))]
pub fn project(assignments: &[ClusterAssignment], config: &ProjectionConfig) -> Result<Embedding> {
    let sample = downsample(assignments, config.sample_size, config.seed);
    if sample.len() < assignments.len() {
        info!("Downsampled {} actors to {} for projection", assignments.len(), sample.len());
    }
    if sample.len() < MIN_PROJECTION_ROWS {
        return Err(PipelineError::projection(format!(
            "need at least {} actors to project, got {}",
            MIN_PROJECTION_ROWS,
            sample.len()
        )));
    }

    let actors: Vec<ActorFeatureVector> = sample.iter().map(|a| a.actor.clone()).collect();
    let data = StandardScaler::fit_transform(feature_matrix(&actors).view()).map_err(|e| match e {
        ScaleError::AllNull { column } => {
            PipelineError::projection(format!(
                "feature column {} has no non-null values",
                FEATURE_COLUMNS.get(column).copied().unwrap_or("?")
            ))
        }
        ScaleError::Empty => PipelineError::projection("no rows to project"),
    })?;

    let mut perplexity = config.perplexity;
    let cap = max_perplexity(sample.len());
    if perplexity > cap {
        warn!("Perplexity {} too large for {} rows, using {}", perplexity, sample.len(), cap);
        perplexity = cap;
    }

    let coordinates = embed(data, config, perplexity)?;
    let points: Vec<EmbeddedPoint> = sample
        .iter()
        .zip(coordinates.rows())
        .map(|(assignment, row)| EmbeddedPoint {
            name: assignment.actor.name.clone(),
            cluster: assignment.cluster,
            coordinates: row.to_vec(),
        })
        .collect();

    crate::metrics::clustering::embedded_points(points.len());
    Ok(Embedding {
        components: config.components,
        perplexity,
        input_rows: assignments.len(),
        points,
    })
}

fn embed(data: Array2<f64>, config: &ProjectionConfig, perplexity: f64) -> Result<Array2<f64>> {
    let rng = StdRng::seed_from_u64(config.seed);
    let coordinates = TSneParams::embedding_size_with_rng(config.components, rng)
        .perplexity(perplexity)
        .approx_threshold(config.approx_threshold)
        .max_iter(config.max_iterations)
        .transform(data)
        .map_err(|e| PipelineError::projection(format!("t-SNE failed: {e}")))?;

    if coordinates.iter().any(|v| !v.is_finite()) {
        return Err(PipelineError::projection("t-SNE produced non-finite coordinates"));
    }
    Ok(coordinates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::cluster::tests::{actor, blobs};

    fn labelled() -> Vec<ClusterAssignment> {
        blobs()
            .into_iter()
            .map(|actor| {
                let cluster = if actor.name.starts_with("small") {
                    0
                } else if actor.name.starts_with("mid") {
                    1
                } else {
                    2
                };
                ClusterAssignment { actor, cluster }
            })
            .collect()
    }

    fn config() -> ProjectionConfig {
        ProjectionConfig {
            max_iterations: 300,
            ..ProjectionConfig::default()
        }
    }

    #[test]
    fn test_downsample_is_seeded_and_keeps_order() {
        let rows: Vec<usize> = (0..100).collect();
        let a = downsample(&rows, 10, 42);
        let b = downsample(&rows, 10, 42);

        assert_eq!(a.len(), 10);
        assert_eq!(a, b);
        assert!(a.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(downsample(&rows, 500, 42), rows);
    }

    /// `n` actors with distinct feature rows.
    fn distinct(n: usize) -> Vec<ClusterAssignment> {
        (0..n)
            .map(|i| ClusterAssignment {
                actor: actor(
                    &format!("actor{i}"),
                    1 + i % 7,
                    1e6 * (i + 1) as f64,
                    3.0 + (i % 5) as f64 + i as f64 * 0.01,
                ),
                cluster: i % 3,
            })
            .collect()
    }

    #[test]
    fn test_max_perplexity_bounds() {
        assert_eq!(max_perplexity(5), 1.0);
        assert_eq!(max_perplexity(60), 14.75);
        assert_eq!(max_perplexity(61), 15.0);
        assert_eq!(max_perplexity(81), 20.0);
        assert!(max_perplexity(11) * 4.0 <= 10.0);
    }

    #[test]
    fn test_default_perplexity_is_capped_at_61_rows() {
        let embedding = project(&distinct(61), &config()).unwrap();
        assert_eq!(embedding.perplexity, 15.0);
        assert_eq!(embedding.points.len(), 61);
        assert!(embedding.points.iter().flat_map(|p| &p.coordinates).all(|v| v.is_finite()));
    }

    #[test]
    fn test_capped_perplexity_at_60_rows_completes() {
        let cfg = ProjectionConfig {
            perplexity: 19.0,
            ..config()
        };
        let embedding = project(&distinct(60), &cfg).unwrap();
        assert_eq!(embedding.perplexity, 14.75);
        assert_eq!(embedding.points.len(), 60);
    }

    #[test]
    fn test_projection_keeps_labels_and_dimensions() {
        let input = labelled();
        let embedding = project(&input, &config()).unwrap();

        assert_eq!(embedding.components, 3);
        assert_eq!(embedding.input_rows, 30);
        assert_eq!(embedding.points.len(), 30);
        // 30 rows cap the default perplexity of 20.
        assert_eq!(embedding.perplexity, 7.25);
        for (point, assignment) in embedding.points.iter().zip(&input) {
            assert_eq!(point.name, assignment.actor.name);
            assert_eq!(point.cluster, assignment.cluster);
            assert_eq!(point.coordinates.len(), 3);
            assert!(point.coordinates.iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn test_projection_downsamples_large_inputs() {
        let cfg = ProjectionConfig {
            sample_size: 12,
            components: 2,
            ..config()
        };
        let embedding = project(&labelled(), &cfg).unwrap();
        assert_eq!(embedding.points.len(), 12);
        assert_eq!(embedding.input_rows, 30);
        assert!(embedding.points.iter().all(|p| p.coordinates.len() == 2));
    }

    #[test]
    fn test_too_few_rows_is_projection_error() {
        let input: Vec<_> = labelled().into_iter().take(4).collect();
        assert!(matches!(project(&input, &config()), Err(PipelineError::Projection { .. })));
    }
}
