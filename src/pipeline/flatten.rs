use crate::error::{PipelineError, Result};
use crate::types::{CastMember, CreditRecord, JsonPayload};
use serde::de::Error as _;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};

/// One element of a decoded cast array, before the record's columns are attached.
#[derive(Debug, Deserialize)]
struct CastEntry {
    id: i64,
    name: String,
    #[serde(alias = "order")]
    order_number: i32,
    #[serde(default)]
    gender: i32,
    cast_id: i64,
    #[serde(default)]
    character: Option<String>,
    credit_id: String,
}

/// Output of flattening a set of credit records.
#[derive(Debug, Default)]
pub struct Flattened {
    pub cast: Vec<CastMember>,
    pub crew_entries: usize,
    /// Movies whose crew payload could not be decoded. Their cast rows are still present.
    pub crew_decode_failures: Vec<i64>,
}

fn decode_error(movie_id: i64, field: &'static str, source: serde_json::Error) -> PipelineError {
    PipelineError::Decode {
        movie_id,
        field,
        source,
    }
}

/// Decode a payload into its array elements; null means no elements.
fn decode_array(payload: &JsonPayload) -> serde_json::Result<Vec<Value>> {
    match payload.decode()?.into_owned() {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        other => Err(serde_json::Error::custom(format!(
            "expected a JSON array, found {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Explode the cast array of one record into one row per element.
pub fn flatten_record(record: &CreditRecord) -> Result<Vec<CastMember>> {
    let entries = decode_array(&record.cast).map_err(|e| decode_error(record.movie_id, "cast", e))?;

    entries
        .into_iter()
        .map(|item| {
            let entry = CastEntry::deserialize(item).map_err(|e| decode_error(record.movie_id, "cast", e))?;
            if entry.order_number < 0 {
                return Err(decode_error(
                    record.movie_id,
                    "cast",
                    serde_json::Error::custom(format!(
                        "negative billing order {} for credit {}",
                        entry.order_number, entry.credit_id
                    )),
                ));
            }
            Ok(CastMember {
                movie_id: record.movie_id,
                title: record.title.clone(),
                id: entry.id,
                name: entry.name,
                order_number: entry.order_number,
                gender: entry.gender,
                cast_id: entry.cast_id,
                character: entry.character,
                credit_id: entry.credit_id,
            })
        })
        .collect()
}

/// Flatten every record's cast payload; any malformed cast payload aborts the whole set.
///
/// Crew payloads are decoded only to be counted. A crew decode failure is logged
/// and reported but never drops the cast rows of the same record.
#[instrument(skip(records), fields(records = records.len()))]
pub fn flatten_credits(records: &[CreditRecord]) -> Result<Flattened> {
    let mut out = Flattened::default();

    for record in records {
        out.cast.extend(flatten_record(record)?);

        match decode_array(&record.crew) {
            Ok(crew) => out.crew_entries += crew.len(),
            Err(e) => {
                warn!(movie_id = record.movie_id, "Could not decode crew payload: {}", e);
                crate::metrics::flatten::crew_decode_failure();
                out.crew_decode_failures.push(record.movie_id);
            }
        }
    }

    debug!(
        "Flattened {} records into {} cast rows ({} crew entries)",
        records.len(),
        out.cast.len(),
        out.crew_entries
    );
    crate::metrics::flatten::cast_rows(out.cast.len());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HERO_CAST: &str = r#"[{"id":10,"name":"A","order_number":0,"gender":1,"cast_id":1,"character":"Hero","credit_id":"c1"}]"#;

    fn record(movie_id: i64, title: &str, cast: JsonPayload) -> CreditRecord {
        CreditRecord {
            movie_id,
            title: title.to_string(),
            cast,
            crew: JsonPayload::Encoded("[]".to_string()),
        }
    }

    fn cast_json(n: usize) -> Value {
        Value::Array(
            (0..n)
                .map(|i| {
                    json!({
                        "cast_id": i + 100,
                        "character": format!("Role {i}"),
                        "credit_id": format!("credit-{i}"),
                        "gender": 2,
                        "id": i + 1000,
                        "name": format!("Actor {i}"),
                        "order": i
                    })
                })
                .collect(),
        )
    }

    #[test]
    fn test_single_entry_scenario() {
        let rows = flatten_record(&record(1, "X", JsonPayload::Encoded(HERO_CAST.to_string()))).unwrap();

        assert_eq!(
            rows,
            vec![CastMember {
                movie_id: 1,
                title: "X".to_string(),
                id: 10,
                name: "A".to_string(),
                order_number: 0,
                gender: 1,
                cast_id: 1,
                character: Some("Hero".to_string()),
                credit_id: "c1".to_string(),
            }]
        );
    }

    #[test]
    fn test_n_entries_yield_n_rows_inheriting_movie_columns() {
        let records = vec![
            record(19995, "Avatar", JsonPayload::Encoded(cast_json(4).to_string())),
            record(206647, "Spectre", JsonPayload::Decoded(cast_json(2))),
        ];
        let flattened = flatten_credits(&records).unwrap();

        assert_eq!(flattened.cast.len(), 6);
        let avatar: Vec<_> = flattened.cast.iter().filter(|m| m.movie_id == 19995).collect();
        assert_eq!(avatar.len(), 4);
        assert!(avatar.iter().all(|m| m.title == "Avatar"));
        assert!(flattened
            .cast
            .iter()
            .filter(|m| m.movie_id == 206647)
            .all(|m| m.title == "Spectre"));
        assert_eq!(avatar[3].order_number, 3);
    }

    #[test]
    fn test_empty_and_null_casts_yield_no_rows() {
        let records = vec![
            record(1, "Empty", JsonPayload::Encoded("[]".to_string())),
            record(2, "Null text", JsonPayload::Encoded("null".to_string())),
            record(3, "SQL null", JsonPayload::Decoded(Value::Null)),
            record(4, "Empty decoded", JsonPayload::Decoded(json!([]))),
        ];
        let flattened = flatten_credits(&records).unwrap();
        assert!(flattened.cast.is_empty());
    }

    #[test]
    fn test_decoded_and_encoded_payloads_flatten_identically() {
        let cast = cast_json(3);
        let encoded = flatten_record(&record(7, "Y", JsonPayload::Encoded(cast.to_string()))).unwrap();
        let decoded = flatten_record(&record(7, "Y", JsonPayload::Decoded(cast))).unwrap();
        assert_eq!(encoded, decoded);
    }

    #[test]
    fn test_malformed_cast_aborts_with_movie_id() {
        let records = vec![
            record(1, "Fine", JsonPayload::Encoded(HERO_CAST.to_string())),
            record(42, "Broken", JsonPayload::Encoded("[{not json".to_string())),
        ];
        match flatten_credits(&records) {
            Err(PipelineError::Decode { movie_id, field, .. }) => {
                assert_eq!(movie_id, 42);
                assert_eq!(field, "cast");
            }
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    #[test]
    fn test_non_array_or_incomplete_entries_are_decode_errors() {
        let object = record(5, "Object", JsonPayload::Decoded(json!({"id": 1})));
        assert!(matches!(flatten_record(&object), Err(PipelineError::Decode { movie_id: 5, .. })));

        let missing_key = record(6, "No key", JsonPayload::Decoded(json!([{"id": 1, "name": "A", "order": 0, "cast_id": 1}])));
        assert!(matches!(flatten_record(&missing_key), Err(PipelineError::Decode { movie_id: 6, .. })));

        let negative = record(
            8,
            "Negative",
            JsonPayload::Decoded(json!([{"id": 1, "name": "A", "order": -1, "cast_id": 1, "credit_id": "x"}])),
        );
        assert!(matches!(flatten_record(&negative), Err(PipelineError::Decode { movie_id: 8, .. })));
    }

    #[test]
    fn test_null_character_and_missing_gender_are_tolerated() {
        let rec = record(
            9,
            "Z",
            JsonPayload::Decoded(json!([{"id": 3, "name": "C", "order": 2, "cast_id": 4, "character": null, "credit_id": "c3"}])),
        );
        let rows = flatten_record(&rec).unwrap();
        assert_eq!(rows[0].character, None);
        assert_eq!(rows[0].gender, 0);
    }

    #[test]
    fn test_crew_failure_does_not_drop_cast_rows() {
        let mut broken_crew = record(11, "Crew", JsonPayload::Encoded(HERO_CAST.to_string()));
        broken_crew.crew = JsonPayload::Encoded("{{{".to_string());
        let mut good_crew = record(12, "Crew ok", JsonPayload::Decoded(cast_json(1)));
        good_crew.crew = JsonPayload::Decoded(json!([{"job": "Director"}, {"job": "Editor"}]));

        let flattened = flatten_credits(&[broken_crew, good_crew]).unwrap();
        assert_eq!(flattened.cast.len(), 2);
        assert_eq!(flattened.crew_decode_failures, vec![11]);
        assert_eq!(flattened.crew_entries, 2);
    }
}
