use crate::db::{Database, Queries};
use crate::prelude::*;
use serde_json::Value;
use std::collections::BTreeMap;

pub const DEFAULT_METRIC: &str = "judge_exactness";

#[derive(Debug, Serialize)]
pub struct LeaderboardEntry {
    pub experiment_id: i64,
    pub experiment_name: String,
    pub model_name: Option<String>,
    pub dataset_name: String,
    pub main_metric_score: f64,
    pub other_metrics: BTreeMap<String, f64>,
    pub sampling_params: Option<Value>,
    pub extra_params: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct Leaderboard {
    pub entries: Vec<LeaderboardEntry>,
}

struct EntryDBRecord {
    experiment_id: i64,
    experiment_name: String,
    model_name: Option<String>,
    dataset_name: String,
    main_metric_score: f64,
    sampling_params: Option<String>,
    extra_params: Option<String>,
}

/// Ranked view over stored observations: experiments are ordered by their
/// best score on the main metric, with per-metric averages of everything
/// else attached. A pure query; the engine keeps no ranking state.
pub fn leaderboard(
    db: &Database,
    metric_name: &str,
    dataset_name: Option<&str>,
    limit: usize,
) -> Fallible<Leaderboard> {
    let mut sql = "SELECT * FROM ( \
         SELECT e.id AS experiment_id, e.name AS experiment_name, \
                m.name AS model_name, d.name AS dataset_name, \
                m.sampling_params AS sampling_params, m.extra_params AS extra_params, \
                (SELECT MAX(o.score) FROM results r \
                 JOIN observations o ON o.result_id = r.id \
                 WHERE r.experiment_id = e.id AND r.metric_name = ?1) AS main_metric_score \
         FROM experiments e \
         JOIN datasets d ON d.id = e.dataset_id \
         LEFT JOIN models m ON m.id = e.model_id"
        .to_string();
    if dataset_name.is_some() {
        sql.push_str(" WHERE d.name = ?3");
    }
    sql.push_str(
        ") WHERE main_metric_score IS NOT NULL \
         ORDER BY main_metric_score DESC LIMIT ?2;",
    );

    let records = match dataset_name {
        Some(dataset_name) => db.select(
            &sql,
            rusqlite::params![metric_name, limit as i64, dataset_name],
            entry_from_row,
        )?,
        None => db.select(
            &sql,
            rusqlite::params![metric_name, limit as i64],
            entry_from_row,
        )?,
    };

    let mut entries = Vec::with_capacity(records.len());
    for record in records {
        let other_metrics = db
            .select(
                "SELECT r.metric_name AS metric_name, AVG(o.score) AS score \
                 FROM results r JOIN observations o ON o.result_id = r.id \
                 WHERE r.experiment_id = ?1 AND r.metric_name != ?2 \
                 AND o.score IS NOT NULL \
                 GROUP BY r.metric_name;",
                rusqlite::params![record.experiment_id, metric_name],
                |row| {
                    Ok((
                        row.get::<_, String>("metric_name")?,
                        row.get::<_, f64>("score")?,
                    ))
                },
            )?
            .into_iter()
            .collect();

        entries.push(LeaderboardEntry {
            experiment_id: record.experiment_id,
            experiment_name: record.experiment_name,
            model_name: record.model_name,
            dataset_name: record.dataset_name,
            main_metric_score: record.main_metric_score,
            other_metrics,
            sampling_params: record
                .sampling_params
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            extra_params: record
                .extra_params
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
        });
    }

    Ok(Leaderboard { entries })
}

fn entry_from_row(row: &rusqlite::Row) -> rusqlite::Result<EntryDBRecord> {
    Ok(EntryDBRecord {
        experiment_id: row.get("experiment_id")?,
        experiment_name: row.get("experiment_name")?,
        model_name: row.get("model_name")?,
        dataset_name: row.get("dataset_name")?,
        main_metric_score: row.get("main_metric_score")?,
        sampling_params: row.get("sampling_params")?,
        extra_params: row.get("extra_params")?,
    })
}

#[cfg(test)]
mod tests {
    use super::leaderboard;
    use crate::actions::CreateExperiment;
    use crate::db::Database;
    use crate::results::{MetricResult, Observation, ObservationOutcome};

    fn score(db: &Database, result_id: i64, num_line: i64, score: f64) {
        Observation::upsert(
            db,
            result_id,
            num_line,
            &ObservationOutcome {
                score: Some(score),
                ..ObservationOutcome::default()
            },
        )
        .unwrap();
    }

    #[test]
    fn test_ranking_by_best_main_score() {
        let db = Database::temp().unwrap();

        let low = CreateExperiment::dummy(&db, "low");
        let high = CreateExperiment::dummy(&db, "high");
        let low_result = MetricResult::by_experiment(&db, low.id).unwrap().remove(0);
        let high_result = MetricResult::by_experiment(&db, high.id).unwrap().remove(0);

        score(&db, low_result.id, 0, 0.2);
        score(&db, low_result.id, 1, 0.4);
        score(&db, high_result.id, 0, 0.9);

        let board = leaderboard(&db, "judge_exactness", None, 100).unwrap();
        assert_eq!(board.entries.len(), 2);
        assert_eq!(board.entries[0].experiment_name, "high");
        assert_eq!(board.entries[0].main_metric_score, 0.9);
        assert_eq!(board.entries[1].experiment_name, "low");
        assert_eq!(board.entries[1].main_metric_score, 0.4);
    }

    #[test]
    fn test_dataset_filter_and_missing_metric() {
        let db = Database::temp().unwrap();

        let ex = CreateExperiment::dummy(&db, "solo");
        let result = MetricResult::by_experiment(&db, ex.id).unwrap().remove(0);
        score(&db, result.id, 0, 0.5);

        let board = leaderboard(&db, "judge_exactness", Some("solo-dataset"), 100).unwrap();
        assert_eq!(board.entries.len(), 1);
        assert!(board.entries[0].model_name.is_none());

        let board = leaderboard(&db, "judge_exactness", Some("other-dataset"), 100).unwrap();
        assert!(board.entries.is_empty());

        // Experiments with no observation on the main metric never rank.
        let board = leaderboard(&db, "qa_f1", None, 100).unwrap();
        assert!(board.entries.is_empty());
    }
}
