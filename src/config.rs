use crate::constants::*;
use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Config file picked up from the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "pipeline.toml";

/// Connection settings for the PostgreSQL warehouse, read from the environment.
#[derive(Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

impl DbConfig {
    /// Reads `db_host`, `db_name`, `db_user`, `db_password` and `db_port`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| PipelineError::Config(format!("{key} environment variable not set")))
        };

        let port = match lookup("db_port").filter(|v| !v.trim().is_empty()) {
            Some(raw) => raw.trim().parse::<u16>().map_err(|e| {
                PipelineError::Config(format!("db_port must be a port number, got '{raw}': {e}"))
            })?,
            None => DEFAULT_POSTGRES_PORT,
        };

        Ok(Self {
            host: required("db_host")?,
            port,
            database: required("db_name")?,
            user: required("db_user")?,
            password: lookup("db_password").unwrap_or_default(),
        })
    }
}

impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// How the batch writer commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum CommitMode {
    /// One transaction around every batch of the run.
    Atomic,
    /// Commit after each batch; re-running is safe because upserts are keyed.
    PerBatch,
}

/// Identity actors are grouped by when aggregating features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ActorIdentity {
    PersonId,
    /// Display name; actors sharing a name are merged.
    Name,
}

/// Where the clustering pipeline reads cast rows from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ClusterSource {
    /// Re-read and flatten the `credits` table.
    Credits,
    /// Read the already loaded warehouse cast table.
    Warehouse,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub writer: WriterConfig,
    pub aggregate: AggregateConfig,
    pub clustering: ClusteringConfig,
    pub projection: ProjectionConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WriterConfig {
    pub table: String,
    pub batch_size: usize,
    pub commit: CommitMode,
    pub create_table: bool,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            table: DEFAULT_CAST_TABLE.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            commit: CommitMode::Atomic,
            create_table: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AggregateConfig {
    pub group_by: ActorIdentity,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            group_by: ActorIdentity::PersonId,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusteringConfig {
    pub clusters: usize,
    pub seed: u64,
    /// k-means restarts; the run with the lowest inertia wins.
    pub n_runs: usize,
    pub max_iterations: u64,
    pub tolerance: f64,
    pub elbow: bool,
    pub elbow_min: usize,
    pub elbow_max: usize,
    pub source: ClusterSource,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            clusters: DEFAULT_CLUSTERS,
            seed: DEFAULT_SEED,
            n_runs: 10,
            max_iterations: 300,
            tolerance: 1e-4,
            elbow: false,
            elbow_min: DEFAULT_ELBOW_MIN,
            elbow_max: DEFAULT_ELBOW_MAX,
            source: ClusterSource::Credits,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectionConfig {
    pub enabled: bool,
    pub sample_size: usize,
    pub components: usize,
    pub perplexity: f64,
    pub approx_threshold: f64,
    pub max_iterations: usize,
    pub seed: u64,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_size: DEFAULT_SAMPLE_SIZE,
            components: DEFAULT_COMPONENTS,
            perplexity: DEFAULT_PERPLEXITY,
            approx_threshold: 0.5,
            max_iterations: 1000,
            seed: DEFAULT_SEED,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("output"),
        }
    }
}

impl PipelineConfig {
    /// Loads the given file, or `pipeline.toml` if it exists, or the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p, true),
            None => (Path::new(DEFAULT_CONFIG_FILE), false),
        };
        if !explicit && !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(PipelineError::Config(msg));

        if self.writer.batch_size == 0 {
            return invalid("writer.batch_size must be at least 1".into());
        }
        if self.clustering.clusters == 0 {
            return invalid("clustering.clusters must be at least 1".into());
        }
        if self.clustering.n_runs == 0 {
            return invalid("clustering.n_runs must be at least 1".into());
        }
        if self.clustering.elbow_min == 0 || self.clustering.elbow_min > self.clustering.elbow_max {
            return invalid(format!(
                "clustering elbow range {}..={} is empty or starts at 0",
                self.clustering.elbow_min, self.clustering.elbow_max
            ));
        }
        if !(2..=3).contains(&self.projection.components) {
            return invalid(format!(
                "projection.components must be 2 or 3, got {}",
                self.projection.components
            ));
        }
        if !(self.projection.perplexity > 0.0) {
            return invalid("projection.perplexity must be positive".into());
        }
        if self.projection.sample_size == 0 {
            return invalid("projection.sample_size must be at least 1".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_db_config_reads_lowercase_keys() {
        let config = DbConfig::from_lookup(lookup(&[
            ("db_host", "warehouse.local"),
            ("db_name", "movies"),
            ("db_user", "etl"),
            ("db_password", "s3cret"),
            ("db_port", "6543"),
        ]))
        .unwrap();

        assert_eq!(config.host, "warehouse.local");
        assert_eq!(config.port, 6543);
        assert_eq!(config.database, "movies");
        assert_eq!(config.user, "etl");
        assert_eq!(config.password, "s3cret");
        assert!(!format!("{config:?}").contains("s3cret"));
    }

    #[test]
    fn test_db_config_defaults_port_and_requires_host() {
        let config = DbConfig::from_lookup(lookup(&[
            ("db_host", "localhost"),
            ("db_name", "movies"),
            ("db_user", "etl"),
        ]))
        .unwrap();
        assert_eq!(config.port, 5432);
        assert_eq!(config.password, "");

        let missing = DbConfig::from_lookup(lookup(&[("db_name", "movies"), ("db_user", "etl")]));
        assert!(matches!(missing, Err(PipelineError::Config(msg)) if msg.contains("db_host")));

        let bad_port = DbConfig::from_lookup(lookup(&[
            ("db_host", "localhost"),
            ("db_name", "movies"),
            ("db_user", "etl"),
            ("db_port", "not-a-port"),
        ]));
        assert!(matches!(bad_port, Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_pipeline_config_partial_toml() {
        let config = PipelineConfig::from_toml(
            r#"
            [writer]
            table = "cast_kate"
            batch_size = 500
            commit = "per_batch"

            [aggregate]
            group_by = "name"

            [clustering]
            clusters = 4
            elbow = true
            "#,
        )
        .unwrap();

        assert_eq!(config.writer.table, "cast_kate");
        assert_eq!(config.writer.batch_size, 500);
        assert_eq!(config.writer.commit, CommitMode::PerBatch);
        assert_eq!(config.aggregate.group_by, ActorIdentity::Name);
        assert_eq!(config.clustering.clusters, 4);
        assert!(config.clustering.elbow);
        assert_eq!(config.clustering.elbow_max, 9);
        assert_eq!(config.projection.components, 3);
        assert_eq!(config.projection.sample_size, 5_000);
    }

    #[test]
    fn test_pipeline_config_rejects_invalid_values() {
        assert!(PipelineConfig::from_toml("[writer]\nbatch_size = 0\n").is_err());
        assert!(PipelineConfig::from_toml("[projection]\ncomponents = 4\n").is_err());
        assert!(PipelineConfig::from_toml("[clustering]\nelbow_min = 5\nelbow_max = 2\n").is_err());
        assert!(PipelineConfig::from_toml("[writer]\nunknown = 1\n").is_err());
    }

    #[test]
    fn test_explicit_missing_config_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = dir.path().join("missing.toml");
        assert!(PipelineConfig::load(Some(&explicit)).is_err());
    }
}
