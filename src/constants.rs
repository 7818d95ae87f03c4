/// Table and column names shared by the stores and the pipeline stages.

// Source tables (read with full scans)
pub const CREDITS_TABLE: &str = "credits";
pub const MOVIES_TABLE: &str = "movies";

// Default warehouse table for flattened cast rows
pub const DEFAULT_CAST_TABLE: &str = "cast_members";

/// Natural key of the cast table; upserts resolve conflicts on it.
pub const CAST_KEY_COLUMN: &str = "credit_id";

/// Cast table columns in insert order.
pub const CAST_COLUMNS: [&str; 9] = [
    "movie_id",
    "title",
    "id",
    "name",
    "order_number",
    "gender",
    "cast_id",
    "character",
    CAST_KEY_COLUMN,
];

/// Feature columns fed to standardization, clustering and projection, in matrix order.
pub const FEATURE_COLUMNS: [&str; 6] = [
    "number_of_movies",
    "avg_budget",
    "avg_popularity",
    "avg_revenue",
    "avg_vote",
    "avg_vote_count",
];

// Defaults
pub const DEFAULT_BATCH_SIZE: usize = 10_000;
pub const DEFAULT_CLUSTERS: usize = 5;
pub const DEFAULT_SEED: u64 = 42;
pub const DEFAULT_ELBOW_MIN: usize = 1;
pub const DEFAULT_ELBOW_MAX: usize = 9;
pub const DEFAULT_SAMPLE_SIZE: usize = 5_000;
pub const DEFAULT_COMPONENTS: usize = 3;
pub const DEFAULT_PERPLEXITY: f64 = 20.0;
pub const DEFAULT_POSTGRES_PORT: u16 = 5432;
