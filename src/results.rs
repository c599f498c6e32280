use crate::db::{Database, Queries};
use crate::prelude::*;
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde_json::Value;
use std::collections::HashSet;

string_enum!(pub enum MetricStatus {
    Pending => "pending",
    Running => "running",
    Finished => "finished",
});

/// One (experiment, metric) pair accumulating per-row observations.
#[derive(Clone, Serialize)]
pub struct MetricResult {
    pub id: i64,
    pub experiment_id: i64,
    pub metric_name: String,
    #[serde(rename = "metric_status")]
    pub status: MetricStatus,
    pub num_try: i64,
    pub num_success: i64,
    pub created_at: DateTime<Utc>,
}

impl MetricResult {
    /// Inserts a pending result and counts it on the owning experiment.
    /// Callers needing atomicity with surrounding writes pass a transaction.
    pub fn create<Q: Queries>(q: &Q, experiment_id: i64, metric_name: &str) -> Fallible<i64> {
        let id = q.insert(
            "INSERT INTO results (experiment_id, metric_name, metric_status, created_at) \
             VALUES (?1, ?2, 'pending', ?3);",
            params![experiment_id, metric_name, Utc::now()],
        )?;
        q.execute(
            "UPDATE experiments SET num_metrics = num_metrics + 1 WHERE id = ?1;",
            [experiment_id],
        )?;
        Ok(id)
    }

    pub fn get(db: &Database, id: i64) -> Fallible<Option<MetricResult>> {
        let record = db.first(
            "SELECT * FROM results WHERE id = ?1;",
            [id],
            MetricResultDBRecord::from_row,
        )?;
        record.map(|r| r.into_result()).transpose()
    }

    pub fn find(
        db: &Database,
        experiment_id: i64,
        metric_name: &str,
    ) -> Fallible<Option<MetricResult>> {
        let record = db.first(
            "SELECT * FROM results WHERE experiment_id = ?1 AND metric_name = ?2;",
            params![experiment_id, metric_name],
            MetricResultDBRecord::from_row,
        )?;
        record.map(|r| r.into_result()).transpose()
    }

    pub fn by_experiment(db: &Database, experiment_id: i64) -> Fallible<Vec<MetricResult>> {
        let records = db.select(
            "SELECT * FROM results WHERE experiment_id = ?1 ORDER BY id;",
            [experiment_id],
            MetricResultDBRecord::from_row,
        )?;
        records
            .into_iter()
            .map(|r| r.into_result())
            .collect::<Fallible<_>>()
    }

    pub fn set_status(db: &Database, id: i64, status: MetricStatus) -> Fallible<()> {
        db.execute(
            "UPDATE results SET metric_status = ?1 WHERE id = ?2;",
            params![status.to_str(), id],
        )?;
        Ok(())
    }

    /// Compare-and-swap on the status column, mirroring the experiment-level
    /// handoff: only one of the racing workers finalizes the result.
    pub fn transition(
        db: &Database,
        id: i64,
        from: MetricStatus,
        to: MetricStatus,
    ) -> Fallible<bool> {
        let changes = db.execute(
            "UPDATE results SET metric_status = ?1 \
             WHERE id = ?2 AND metric_status = ?3;",
            params![to.to_str(), id, from.to_str()],
        )?;
        Ok(changes == 1)
    }

    /// See `Experiment::align_answer_counters`; same rule for a result's
    /// observation counters ahead of a dispatch.
    pub fn align_counters<Q: Queries>(q: &Q, id: i64) -> Fallible<()> {
        q.execute(
            "UPDATE results SET \
             num_success = (SELECT COUNT(*) FROM observations \
                 WHERE result_id = ?1 AND error_msg IS NULL), \
             num_try = (SELECT COUNT(*) FROM observations \
                 WHERE result_id = ?1 AND error_msg IS NULL) \
             WHERE id = ?1;",
            [id],
        )?;
        Ok(())
    }

    /// Counts one observation attempt on the result and on the owning
    /// experiment's aggregates, atomically, and returns the result's new
    /// `num_try`.
    pub fn record_observation_attempt(
        db: &Database,
        id: i64,
        experiment_id: i64,
        success: bool,
    ) -> Fallible<i64> {
        db.write_transaction(|tx| {
            tx.execute(
                "UPDATE results SET num_try = num_try + 1, \
                 num_success = num_success + ?1 WHERE id = ?2;",
                params![success as i64, id],
            )?;
            tx.execute(
                "UPDATE experiments SET \
                 num_observation_try = num_observation_try + 1, \
                 num_observation_success = num_observation_success + ?1 \
                 WHERE id = ?2;",
                params![success as i64, experiment_id],
            )?;
            let num_try = tx
                .first("SELECT num_try FROM results WHERE id = ?1;", [id], |r| {
                    r.get("num_try")
                })?
                .ok_or_else(|| anyhow!("result {} disappeared mid-update", id))?;
            Ok(num_try)
        })
    }
}

struct MetricResultDBRecord {
    id: i64,
    experiment_id: i64,
    metric_name: String,
    metric_status: String,
    num_try: i64,
    num_success: i64,
    created_at: DateTime<Utc>,
}

impl MetricResultDBRecord {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(MetricResultDBRecord {
            id: row.get("id")?,
            experiment_id: row.get("experiment_id")?,
            metric_name: row.get("metric_name")?,
            metric_status: row.get("metric_status")?,
            num_try: row.get("num_try")?,
            num_success: row.get("num_success")?,
            created_at: row.get("created_at")?,
        })
    }

    fn into_result(self) -> Fallible<MetricResult> {
        Ok(MetricResult {
            id: self.id,
            experiment_id: self.experiment_id,
            metric_name: self.metric_name,
            status: self.metric_status.parse()?,
            num_try: self.num_try,
            num_success: self.num_success,
            created_at: self.created_at,
        })
    }
}

/// The generated output for one (experiment, row).
#[derive(Clone, Serialize)]
pub struct Answer {
    pub id: i64,
    pub experiment_id: i64,
    pub num_line: i64,
    pub answer: Option<String>,
    pub error_msg: Option<String>,
    pub execution_time: Option<i64>,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone)]
pub struct AnswerOutcome {
    pub answer: Option<String>,
    pub error_msg: Option<String>,
    pub execution_time: Option<i64>,
    pub metadata: Option<Value>,
}

impl Answer {
    /// Insert-or-overwrite keyed by (experiment_id, num_line). The unique
    /// constraint serializes concurrent writers; the last one wins wholesale.
    pub fn upsert(
        db: &Database,
        experiment_id: i64,
        num_line: i64,
        outcome: &AnswerOutcome,
    ) -> Fallible<Answer> {
        let metadata = match &outcome.metadata {
            Some(metadata) => Some(serde_json::to_string(metadata)?),
            None => None,
        };

        db.execute(
            "INSERT INTO answers (experiment_id, num_line, answer, error_msg, \
             execution_time, metadata, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT (experiment_id, num_line) DO UPDATE SET \
             answer = excluded.answer, error_msg = excluded.error_msg, \
             execution_time = excluded.execution_time, metadata = excluded.metadata;",
            params![
                experiment_id,
                num_line,
                outcome.answer,
                outcome.error_msg,
                outcome.execution_time,
                metadata,
                Utc::now(),
            ],
        )?;

        Answer::get(db, experiment_id, num_line)?
            .ok_or_else(|| anyhow!("answer ({}, {}) vanished after upsert", experiment_id, num_line))
    }

    pub fn get(db: &Database, experiment_id: i64, num_line: i64) -> Fallible<Option<Answer>> {
        let record = db.first(
            "SELECT * FROM answers WHERE experiment_id = ?1 AND num_line = ?2;",
            [experiment_id, num_line],
            AnswerDBRecord::from_row,
        )?;
        record.map(|r| r.into_answer()).transpose()
    }

    pub fn by_experiment(db: &Database, experiment_id: i64) -> Fallible<Vec<Answer>> {
        let records = db.select(
            "SELECT * FROM answers WHERE experiment_id = ?1 ORDER BY num_line;",
            [experiment_id],
            AnswerDBRecord::from_row,
        )?;
        records
            .into_iter()
            .map(|r| r.into_answer())
            .collect::<Fallible<_>>()
    }

    /// The rows that do not need to be dispatched again.
    pub fn successful_lines(db: &Database, experiment_id: i64) -> Fallible<HashSet<i64>> {
        Ok(db
            .select(
                "SELECT num_line FROM answers \
                 WHERE experiment_id = ?1 AND error_msg IS NULL AND answer IS NOT NULL;",
                [experiment_id],
                |r| r.get("num_line"),
            )?
            .into_iter()
            .collect())
    }
}

struct AnswerDBRecord {
    id: i64,
    experiment_id: i64,
    num_line: i64,
    answer: Option<String>,
    error_msg: Option<String>,
    execution_time: Option<i64>,
    metadata: Option<String>,
    created_at: DateTime<Utc>,
}

impl AnswerDBRecord {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(AnswerDBRecord {
            id: row.get("id")?,
            experiment_id: row.get("experiment_id")?,
            num_line: row.get("num_line")?,
            answer: row.get("answer")?,
            error_msg: row.get("error_msg")?,
            execution_time: row.get("execution_time")?,
            metadata: row.get("metadata")?,
            created_at: row.get("created_at")?,
        })
    }

    fn into_answer(self) -> Fallible<Answer> {
        Ok(Answer {
            id: self.id,
            experiment_id: self.experiment_id,
            num_line: self.num_line,
            answer: self.answer,
            error_msg: self.error_msg,
            execution_time: self.execution_time,
            metadata: self
                .metadata
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            created_at: self.created_at,
        })
    }
}

/// A metric score for one (result, row).
#[derive(Clone, Serialize)]
pub struct Observation {
    pub id: i64,
    pub result_id: i64,
    pub num_line: i64,
    pub score: Option<f64>,
    pub observation: Option<Value>,
    pub error_msg: Option<String>,
    pub execution_time: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone)]
pub struct ObservationOutcome {
    pub score: Option<f64>,
    pub observation: Option<Value>,
    pub error_msg: Option<String>,
    pub execution_time: Option<i64>,
}

impl Observation {
    /// Same contract as `Answer::upsert`, keyed by (result_id, num_line).
    pub fn upsert(
        db: &Database,
        result_id: i64,
        num_line: i64,
        outcome: &ObservationOutcome,
    ) -> Fallible<Observation> {
        let observation = match &outcome.observation {
            Some(observation) => Some(serde_json::to_string(observation)?),
            None => None,
        };

        db.execute(
            "INSERT INTO observations (result_id, num_line, score, observation, \
             error_msg, execution_time, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT (result_id, num_line) DO UPDATE SET \
             score = excluded.score, observation = excluded.observation, \
             error_msg = excluded.error_msg, execution_time = excluded.execution_time;",
            params![
                result_id,
                num_line,
                outcome.score,
                observation,
                outcome.error_msg,
                outcome.execution_time,
                Utc::now(),
            ],
        )?;

        Observation::get(db, result_id, num_line)?
            .ok_or_else(|| anyhow!("observation ({}, {}) vanished after upsert", result_id, num_line))
    }

    pub fn get(db: &Database, result_id: i64, num_line: i64) -> Fallible<Option<Observation>> {
        let record = db.first(
            "SELECT * FROM observations WHERE result_id = ?1 AND num_line = ?2;",
            [result_id, num_line],
            ObservationDBRecord::from_row,
        )?;
        record.map(|r| r.into_observation()).transpose()
    }

    pub fn by_result(db: &Database, result_id: i64) -> Fallible<Vec<Observation>> {
        let records = db.select(
            "SELECT * FROM observations WHERE result_id = ?1 ORDER BY num_line;",
            [result_id],
            ObservationDBRecord::from_row,
        )?;
        records
            .into_iter()
            .map(|r| r.into_observation())
            .collect::<Fallible<_>>()
    }

    pub fn successful_lines(db: &Database, result_id: i64) -> Fallible<HashSet<i64>> {
        Ok(db
            .select(
                "SELECT num_line FROM observations \
                 WHERE result_id = ?1 AND error_msg IS NULL;",
                [result_id],
                |r| r.get("num_line"),
            )?
            .into_iter()
            .collect())
    }
}

struct ObservationDBRecord {
    id: i64,
    result_id: i64,
    num_line: i64,
    score: Option<f64>,
    observation: Option<String>,
    error_msg: Option<String>,
    execution_time: Option<i64>,
    created_at: DateTime<Utc>,
}

impl ObservationDBRecord {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(ObservationDBRecord {
            id: row.get("id")?,
            result_id: row.get("result_id")?,
            num_line: row.get("num_line")?,
            score: row.get("score")?,
            observation: row.get("observation")?,
            error_msg: row.get("error_msg")?,
            execution_time: row.get("execution_time")?,
            created_at: row.get("created_at")?,
        })
    }

    fn into_observation(self) -> Fallible<Observation> {
        Ok(Observation {
            id: self.id,
            result_id: self.result_id,
            num_line: self.num_line,
            score: self.score,
            observation: self
                .observation
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            error_msg: self.error_msg,
            execution_time: self.execution_time,
            created_at: self.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Answer, AnswerOutcome, MetricResult, Observation, ObservationOutcome};
    use crate::actions::CreateExperiment;
    use crate::db::Database;
    use crate::experiments::Experiment;

    #[test]
    fn test_upsert_is_idempotent() {
        let db = Database::temp().unwrap();
        let ex = CreateExperiment::dummy(&db, "upsert");

        let outcome = AnswerOutcome {
            answer: Some("forty-two".into()),
            execution_time: Some(3),
            ..AnswerOutcome::default()
        };
        let first = Answer::upsert(&db, ex.id, 0, &outcome).unwrap();
        let second = Answer::upsert(&db, ex.id, 0, &outcome).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.answer.as_deref(), Some("forty-two"));
        assert_eq!(Answer::by_experiment(&db, ex.id).unwrap().len(), 1);
    }

    #[test]
    fn test_upsert_overwrites_failures() {
        let db = Database::temp().unwrap();
        let ex = CreateExperiment::dummy(&db, "overwrite");

        Answer::upsert(
            &db,
            ex.id,
            1,
            &AnswerOutcome {
                error_msg: Some("connection reset".into()),
                execution_time: Some(30),
                ..AnswerOutcome::default()
            },
        )
        .unwrap();
        assert!(Answer::successful_lines(&db, ex.id).unwrap().is_empty());

        let healed = Answer::upsert(
            &db,
            ex.id,
            1,
            &AnswerOutcome {
                answer: Some("better".into()),
                execution_time: Some(2),
                metadata: Some(serde_json::json!({"nb_tokens_completion": 7})),
                ..AnswerOutcome::default()
            },
        )
        .unwrap();

        assert!(healed.error_msg.is_none());
        assert_eq!(healed.answer.as_deref(), Some("better"));
        assert!(Answer::successful_lines(&db, ex.id).unwrap().contains(&1));
        assert_eq!(Answer::by_experiment(&db, ex.id).unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_upsert_single_row() {
        let db = Database::temp().unwrap();
        let ex = CreateExperiment::dummy(&db, "concurrent");

        let mut handles = Vec::new();
        for i in 0..2 {
            let db = db.clone();
            let experiment_id = ex.id;
            handles.push(std::thread::spawn(move || {
                Answer::upsert(
                    &db,
                    experiment_id,
                    0,
                    &AnswerOutcome {
                        answer: Some(format!("writer-{i}")),
                        ..AnswerOutcome::default()
                    },
                )
                .unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let answers = Answer::by_experiment(&db, ex.id).unwrap();
        assert_eq!(answers.len(), 1);
        assert!(answers[0].answer.as_deref().unwrap().starts_with("writer-"));
    }

    #[test]
    fn test_observation_counters_aggregate_on_experiment() {
        let db = Database::temp().unwrap();
        let ex = CreateExperiment::dummy(&db, "aggregate");
        let result = MetricResult::by_experiment(&db, ex.id).unwrap().remove(0);

        Observation::upsert(
            &db,
            result.id,
            0,
            &ObservationOutcome {
                score: Some(1.0),
                ..ObservationOutcome::default()
            },
        )
        .unwrap();
        MetricResult::record_observation_attempt(&db, result.id, ex.id, true).unwrap();

        Observation::upsert(
            &db,
            result.id,
            1,
            &ObservationOutcome {
                error_msg: Some("metric blew up".into()),
                ..ObservationOutcome::default()
            },
        )
        .unwrap();
        MetricResult::record_observation_attempt(&db, result.id, ex.id, false).unwrap();

        let result = MetricResult::get(&db, result.id).unwrap().unwrap();
        assert_eq!(result.num_try, 2);
        assert_eq!(result.num_success, 1);

        let ex = Experiment::get(&db, ex.id).unwrap().unwrap();
        assert_eq!(ex.num_observation_try, 2);
        assert_eq!(ex.num_observation_success, 1);
    }

    #[test]
    fn test_cascade_delete() {
        let db = Database::temp().unwrap();
        let ex = CreateExperiment::dummy(&db, "cascade");
        let result = MetricResult::by_experiment(&db, ex.id).unwrap().remove(0);

        Answer::upsert(&db, ex.id, 0, &AnswerOutcome::default()).unwrap();
        Observation::upsert(&db, result.id, 0, &ObservationOutcome::default()).unwrap();

        assert!(Experiment::delete(&db, ex.id).unwrap());
        assert!(Answer::by_experiment(&db, ex.id).unwrap().is_empty());
        assert!(Observation::by_result(&db, result.id).unwrap().is_empty());
        assert!(MetricResult::get(&db, result.id).unwrap().is_none());
    }
}
