use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;

/// An embedded JSON column as handed over by the store.
///
/// Text columns arrive `Encoded`; json/jsonb columns (and SQL NULL) arrive
/// `Decoded`. Decoding is idempotent: a `Decoded` payload is returned as is.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonPayload {
    Encoded(String),
    Decoded(Value),
}

impl JsonPayload {
    pub fn decode(&self) -> serde_json::Result<Cow<'_, Value>> {
        match self {
            JsonPayload::Encoded(text) => serde_json::from_str(text).map(Cow::Owned),
            JsonPayload::Decoded(value) => Ok(Cow::Borrowed(value)),
        }
    }
}

impl From<Value> for JsonPayload {
    fn from(value: Value) -> Self {
        JsonPayload::Decoded(value)
    }
}

impl From<Option<String>> for JsonPayload {
    fn from(text: Option<String>) -> Self {
        match text {
            Some(text) => JsonPayload::Encoded(text),
            None => JsonPayload::Decoded(Value::Null),
        }
    }
}

/// Raw row of the `credits` table.
#[derive(Debug, Clone, PartialEq)]
pub struct CreditRecord {
    pub movie_id: i64,
    pub title: String,
    pub cast: JsonPayload,
    pub crew: JsonPayload,
}

/// One (movie, actor) pairing of the warehouse cast table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CastMember {
    pub movie_id: i64,
    pub title: String,
    pub id: i64,
    pub name: String,
    pub order_number: i32,
    pub gender: i32,
    pub cast_id: i64,
    pub character: Option<String>,
    pub credit_id: String,
}

/// Numeric projection of the `movies` catalog.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MovieMetrics {
    pub movie_id: i64,
    pub budget: Option<f64>,
    pub popularity: Option<f64>,
    pub revenue: Option<f64>,
    pub vote_average: Option<f64>,
    pub vote_count: Option<f64>,
}

impl MovieMetrics {
    /// Metric values in aggregation order (budget, popularity, revenue, vote average, vote count).
    pub fn values(&self) -> [Option<f64>; 5] {
        [
            self.budget,
            self.popularity,
            self.revenue,
            self.vote_average,
            self.vote_count,
        ]
    }
}

/// Per-actor aggregate features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorFeatureVector {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub person_id: Option<i64>,
    pub number_of_movies: usize,
    pub avg_budget: Option<f64>,
    pub avg_popularity: Option<f64>,
    pub avg_revenue: Option<f64>,
    pub avg_vote: Option<f64>,
    pub avg_vote_count: Option<f64>,
}

impl ActorFeatureVector {
    /// Feature values in `FEATURE_COLUMNS` order.
    pub fn features(&self) -> [Option<f64>; 6] {
        [
            Some(self.number_of_movies as f64),
            self.avg_budget,
            self.avg_popularity,
            self.avg_revenue,
            self.avg_vote,
            self.avg_vote_count,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterAssignment {
    #[serde(flatten)]
    pub actor: ActorFeatureVector,
    pub cluster: usize,
}

/// One point of the elbow diagnostic curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ElbowPoint {
    pub clusters: usize,
    pub inertia: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedPoint {
    pub name: String,
    pub cluster: usize,
    pub coordinates: Vec<f64>,
}

/// Display-only embedding of clustered actors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub components: usize,
    pub perplexity: f64,
    pub input_rows: usize,
    pub points: Vec<EmbeddedPoint>,
}
