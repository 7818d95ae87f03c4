use crate::config::ActorIdentity;
use crate::types::{ActorFeatureVector, CastMember, MovieMetrics};
use std::collections::{HashMap, HashSet};
use tracing::{debug, instrument};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum GroupKey {
    Person(i64),
    Name(String),
}

/// Running sums for one actor.
#[derive(Debug, Default)]
struct Accumulator<'a> {
    name: &'a str,
    movies: HashSet<i64>,
    sums: [f64; 5],
    counts: [usize; 5],
}

impl<'a> Accumulator<'a> {
    fn add(&mut self, member: &'a CastMember, metrics: Option<&MovieMetrics>) {
        // Several names under one person id: keep the smallest so the output does not depend on row order.
        if self.name.is_empty() || member.name.as_str() < self.name {
            self.name = &member.name;
        }
        self.movies.insert(member.movie_id);

        if let Some(metrics) = metrics {
            for (i, value) in metrics.values().into_iter().enumerate() {
                if let Some(v) = value.filter(|v| v.is_finite()) {
                    self.sums[i] += v;
                    self.counts[i] += 1;
                }
            }
        }
    }

    fn mean(&self, i: usize) -> Option<f64> {
        (self.counts[i] > 0).then(|| self.sums[i] / self.counts[i] as f64)
    }

    fn finish(self, key: GroupKey) -> ActorFeatureVector {
        let person_id = match key {
            GroupKey::Person(id) => Some(id),
            GroupKey::Name(_) => None,
        };
        ActorFeatureVector {
            name: self.name.to_string(),
            person_id,
            number_of_movies: self.movies.len(),
            avg_budget: self.mean(0),
            avg_popularity: self.mean(1),
            avg_revenue: self.mean(2),
            avg_vote: self.mean(3),
            avg_vote_count: self.mean(4),
        }
    }
}

/// Join cast rows with movie metrics and reduce them to one feature vector per actor.
///
/// Cast rows without a matching movie still count toward `number_of_movies`
/// but add nothing to the averages. Averages skip nulls and are null when
/// every joined value is null.
#[instrument(skip(cast, movies), fields(cast_rows = cast.len(), movies = movies.len()))]
pub fn aggregate_actors(
    cast: &[CastMember],
    movies: &[MovieMetrics],
    identity: ActorIdentity,
) -> Vec<ActorFeatureVector> {
    let metrics_by_movie: HashMap<i64, &MovieMetrics> =
        movies.iter().map(|m| (m.movie_id, m)).collect();

    let mut groups: HashMap<GroupKey, Accumulator<'_>> = HashMap::new();
    let mut unmatched = 0usize;
    for member in cast {
        let key = match identity {
            ActorIdentity::PersonId => GroupKey::Person(member.id),
            ActorIdentity::Name => GroupKey::Name(member.name.clone()),
        };
        let metrics = metrics_by_movie.get(&member.movie_id).copied();
        if metrics.is_none() {
            unmatched += 1;
        }
        groups.entry(key).or_default().add(member, metrics);
    }

    let mut actors: Vec<ActorFeatureVector> = groups
        .into_iter()
        .map(|(key, acc)| acc.finish(key))
        .collect();
    actors.sort_by(|a, b| a.name.cmp(&b.name).then(a.person_id.cmp(&b.person_id)));

    debug!(
        "Aggregated {} actors ({} cast rows without movie metrics)",
        actors.len(),
        unmatched
    );
    crate::metrics::clustering::actors_aggregated(actors.len());
    actors
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cast(movie_id: i64, id: i64, name: &str, credit_id: &str) -> CastMember {
        CastMember {
            movie_id,
            title: format!("Movie {movie_id}"),
            id,
            name: name.to_string(),
            order_number: 0,
            gender: 0,
            cast_id: 1,
            character: None,
            credit_id: credit_id.to_string(),
        }
    }

    fn movie(movie_id: i64, budget: Option<f64>, vote_average: Option<f64>) -> MovieMetrics {
        MovieMetrics {
            movie_id,
            budget,
            popularity: Some(10.0),
            revenue: None,
            vote_average,
            vote_count: Some(100.0),
        }
    }

    #[test]
    fn test_two_actor_means_are_independent() {
        let cast = vec![
            cast(1, 10, "A", "c1"),
            cast(2, 10, "A", "c2"),
            cast(2, 20, "B", "c3"),
        ];
        let movies = vec![movie(1, Some(100.0), Some(5.0)), movie(2, Some(300.0), Some(7.0))];

        let actors = aggregate_actors(&cast, &movies, ActorIdentity::PersonId);
        assert_eq!(actors.len(), 2);

        let a = &actors[0];
        assert_eq!(a.name, "A");
        assert_eq!(a.person_id, Some(10));
        assert_eq!(a.number_of_movies, 2);
        assert_eq!(a.avg_budget, Some(200.0));
        assert_eq!(a.avg_vote, Some(6.0));

        let b = &actors[1];
        assert_eq!(b.name, "B");
        assert_eq!(b.number_of_movies, 1);
        assert_eq!(b.avg_budget, Some(300.0));
        assert_eq!(b.avg_vote, Some(7.0));
    }

    #[test]
    fn test_nulls_are_skipped_and_unmatched_movies_still_count() {
        let cast = vec![
            cast(1, 10, "A", "c1"),
            cast(2, 10, "A", "c2"),
            cast(99, 10, "A", "c3"),
        ];
        let movies = vec![movie(1, None, Some(4.0)), movie(2, Some(50.0), None)];

        let actors = aggregate_actors(&cast, &movies, ActorIdentity::PersonId);
        let a = &actors[0];
        assert_eq!(a.number_of_movies, 3);
        assert_eq!(a.avg_budget, Some(50.0));
        assert_eq!(a.avg_vote, Some(4.0));
        assert_eq!(a.avg_revenue, None);
        assert_eq!(a.avg_vote_count, Some(100.0));
    }

    #[test]
    fn test_repeated_movie_counts_once() {
        // Two characters in the same movie.
        let cast = vec![cast(1, 10, "A", "c1"), cast(1, 10, "A", "c2")];
        let actors = aggregate_actors(&cast, &[movie(1, Some(10.0), None)], ActorIdentity::PersonId);
        assert_eq!(actors[0].number_of_movies, 1);
        assert_eq!(actors[0].avg_budget, Some(10.0));
    }

    #[test]
    fn test_grouping_by_name_merges_namesakes() {
        let cast = vec![
            cast(1, 10, "Chris Evans", "c1"),
            cast(2, 11, "Chris Evans", "c2"),
            cast(3, 12, "Other", "c3"),
        ];
        let movies = vec![movie(1, Some(1.0), None), movie(2, Some(3.0), None)];

        let by_person = aggregate_actors(&cast, &movies, ActorIdentity::PersonId);
        assert_eq!(by_person.len(), 3);

        let by_name = aggregate_actors(&cast, &movies, ActorIdentity::Name);
        assert_eq!(by_name.len(), 2);
        assert_eq!(by_name[0].name, "Chris Evans");
        assert_eq!(by_name[0].person_id, None);
        assert_eq!(by_name[0].number_of_movies, 2);
        assert_eq!(by_name[0].avg_budget, Some(2.0));
    }

    #[test]
    fn test_output_does_not_depend_on_row_order() {
        let mut rows = vec![
            cast(1, 10, "A", "c1"),
            cast(2, 20, "B", "c2"),
            cast(3, 10, "A", "c3"),
            cast(3, 30, "C", "c4"),
        ];
        let movies = vec![movie(1, Some(1.0), Some(1.0)), movie(3, Some(5.0), Some(2.0))];
        let forward = aggregate_actors(&rows, &movies, ActorIdentity::PersonId);
        rows.reverse();
        let backward = aggregate_actors(&rows, &movies, ActorIdentity::PersonId);
        assert_eq!(forward, backward);
    }
}
