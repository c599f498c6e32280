use crate::db::{Database, Queries};
use crate::prelude::*;
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

string_enum!(pub enum ExperimentStatus {
    Pending => "pending",
    RunningAnswers => "running_answers",
    RunningMetrics => "running_metrics",
    Finished => "finished",
});

#[derive(Clone, Debug, Serialize)]
pub struct Experiment {
    pub id: i64,
    pub name: String,
    pub readme: Option<String>,
    #[serde(rename = "experiment_status")]
    pub status: ExperimentStatus,
    pub dataset_id: i64,
    pub model_id: Option<i64>,
    pub experiment_set_id: Option<i64>,
    pub num_try: i64,
    pub num_success: i64,
    pub num_observation_try: i64,
    pub num_observation_success: i64,
    pub num_metrics: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct ExperimentFilter {
    pub set_id: Option<i64>,
    pub orphan: bool,
    pub limit: Option<usize>,
    pub backward: bool,
}

impl Experiment {
    pub fn get(db: &Database, id: i64) -> Fallible<Option<Experiment>> {
        let record = db.first(
            "SELECT * FROM experiments WHERE id = ?1;",
            [id],
            ExperimentDBRecord::from_row,
        )?;

        record.map(|r| r.into_experiment()).transpose()
    }

    pub fn list(db: &Database, filter: &ExperimentFilter) -> Fallible<Vec<Experiment>> {
        // Only the ORDER direction is a keyword; everything user-influenced
        // goes through bound placeholders.
        let order = if filter.backward { "DESC" } else { "ASC" };
        let limit = filter.limit.unwrap_or(100).min(100) as i64;

        let records = if let Some(set_id) = filter.set_id {
            db.select(
                &format!(
                    "SELECT * FROM experiments WHERE experiment_set_id = ?1 \
                     ORDER BY id {order} LIMIT ?2;"
                ),
                params![set_id, limit],
                ExperimentDBRecord::from_row,
            )?
        } else if filter.orphan {
            db.select(
                &format!(
                    "SELECT * FROM experiments WHERE experiment_set_id IS NULL \
                     ORDER BY id {order} LIMIT ?1;"
                ),
                params![limit],
                ExperimentDBRecord::from_row,
            )?
        } else {
            db.select(
                &format!("SELECT * FROM experiments ORDER BY id {order} LIMIT ?1;"),
                params![limit],
                ExperimentDBRecord::from_row,
            )?
        };

        records
            .into_iter()
            .map(|r| r.into_experiment())
            .collect::<Fallible<_>>()
    }

    pub fn by_set(db: &Database, set_id: i64) -> Fallible<Vec<Experiment>> {
        let records = db.select(
            "SELECT * FROM experiments WHERE experiment_set_id = ?1 ORDER BY id;",
            [set_id],
            ExperimentDBRecord::from_row,
        )?;
        records
            .into_iter()
            .map(|r| r.into_experiment())
            .collect::<Fallible<_>>()
    }

    pub fn delete(db: &Database, id: i64) -> Fallible<bool> {
        let changes = db.execute("DELETE FROM experiments WHERE id = ?1;", [id])?;
        Ok(changes > 0)
    }

    pub fn update_info(
        db: &Database,
        id: i64,
        name: Option<&str>,
        readme: Option<&str>,
    ) -> Fallible<()> {
        if let Some(name) = name {
            db.execute(
                "UPDATE experiments SET name = ?1 WHERE id = ?2;",
                params![name, id],
            )?;
        }
        if let Some(readme) = readme {
            db.execute(
                "UPDATE experiments SET readme = ?1 WHERE id = ?2;",
                params![readme, id],
            )?;
        }
        Ok(())
    }

    pub fn set_status(db: &Database, id: i64, status: ExperimentStatus) -> Fallible<()> {
        db.execute(
            "UPDATE experiments SET experiment_status = ?1 WHERE id = ?2;",
            params![status.to_str(), id],
        )?;
        Ok(())
    }

    /// Compare-and-swap on the status column. Racing workers both observing a
    /// full counter funnel through this: only the one that flips the row wins
    /// the phase handoff.
    pub fn transition(
        db: &Database,
        id: i64,
        from: ExperimentStatus,
        to: ExperimentStatus,
    ) -> Fallible<bool> {
        let changes = db.execute(
            "UPDATE experiments SET experiment_status = ?1 \
             WHERE id = ?2 AND experiment_status = ?3;",
            params![to.to_str(), id, from.to_str()],
        )?;
        Ok(changes == 1)
    }

    /// Counts one answer attempt and returns the new `num_try`, so the caller
    /// can detect answer-phase completion without a read-modify-write window.
    pub fn record_answer_attempt(db: &Database, id: i64, success: bool) -> Fallible<i64> {
        db.write_transaction(|tx| {
            tx.execute(
                "UPDATE experiments SET num_try = num_try + 1, \
                 num_success = num_success + ?1 WHERE id = ?2;",
                params![success as i64, id],
            )?;
            let num_try = tx
                .first(
                    "SELECT num_try FROM experiments WHERE id = ?1;",
                    [id],
                    |r| r.get("num_try"),
                )?
                .ok_or_else(|| anyhow!("experiment {} disappeared mid-update", id))?;
            Ok(num_try)
        })
    }

    /// Re-derives the answer counters from the stored rows before a dispatch:
    /// both drop to the number of successful answers. Failed attempts stop
    /// being counted (so `num_try <= size` survives retries) and counter
    /// increments lost to a crash stop mattering, keeping
    /// `num_try == dataset.size` an exact completion signal. On a fresh
    /// experiment this is a no-op.
    pub fn align_answer_counters(db: &Database, id: i64) -> Fallible<()> {
        db.execute(
            "UPDATE experiments SET \
             num_success = (SELECT COUNT(*) FROM answers WHERE experiment_id = ?1 \
                 AND error_msg IS NULL AND answer IS NOT NULL), \
             num_try = (SELECT COUNT(*) FROM answers WHERE experiment_id = ?1 \
                 AND error_msg IS NULL AND answer IS NOT NULL) \
             WHERE id = ?1;",
            [id],
        )?;
        Ok(())
    }

    /// Recomputes the observation aggregates from the owning results.
    pub fn sync_observation_totals(db: &Database, id: i64) -> Fallible<()> {
        db.execute(
            "UPDATE experiments SET \
             num_observation_try = (SELECT COALESCE(SUM(num_try), 0) \
                 FROM results WHERE experiment_id = ?1), \
             num_observation_success = (SELECT COALESCE(SUM(num_success), 0) \
                 FROM results WHERE experiment_id = ?1) \
             WHERE id = ?1;",
            [id],
        )?;
        Ok(())
    }

    /// Finishes the experiment once every result has attempted every row.
    /// Returns whether this call performed the transition; on success every
    /// owned result reaches its terminal status too, even the ones that kept
    /// row-level failures.
    pub fn try_finish(db: &Database, id: i64, dataset_size: i64) -> Fallible<bool> {
        let lagging: i64 = db
            .first(
                "SELECT COUNT(*) AS count FROM results \
                 WHERE experiment_id = ?1 AND num_try < ?2;",
                [id, dataset_size],
                |r| r.get("count"),
            )?
            .unwrap_or(0);
        if lagging > 0 {
            return Ok(false);
        }

        if !Experiment::transition(
            db,
            id,
            ExperimentStatus::RunningMetrics,
            ExperimentStatus::Finished,
        )? {
            return Ok(false);
        }

        db.execute(
            "UPDATE results SET metric_status = 'finished' WHERE experiment_id = ?1;",
            [id],
        )?;
        Ok(true)
    }
}

struct ExperimentDBRecord {
    id: i64,
    name: String,
    readme: Option<String>,
    experiment_status: String,
    dataset_id: i64,
    model_id: Option<i64>,
    experiment_set_id: Option<i64>,
    num_try: i64,
    num_success: i64,
    num_observation_try: i64,
    num_observation_success: i64,
    num_metrics: i64,
    created_at: DateTime<Utc>,
}

impl ExperimentDBRecord {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(ExperimentDBRecord {
            id: row.get("id")?,
            name: row.get("name")?,
            readme: row.get("readme")?,
            experiment_status: row.get("experiment_status")?,
            dataset_id: row.get("dataset_id")?,
            model_id: row.get("model_id")?,
            experiment_set_id: row.get("experiment_set_id")?,
            num_try: row.get("num_try")?,
            num_success: row.get("num_success")?,
            num_observation_try: row.get("num_observation_try")?,
            num_observation_success: row.get("num_observation_success")?,
            num_metrics: row.get("num_metrics")?,
            created_at: row.get("created_at")?,
        })
    }

    fn into_experiment(self) -> Fallible<Experiment> {
        Ok(Experiment {
            id: self.id,
            name: self.name,
            readme: self.readme,
            status: self.experiment_status.parse()?,
            dataset_id: self.dataset_id,
            model_id: self.model_id,
            experiment_set_id: self.experiment_set_id,
            num_try: self.num_try,
            num_success: self.num_success,
            num_observation_try: self.num_observation_try,
            num_observation_success: self.num_observation_success,
            num_metrics: self.num_metrics,
            created_at: self.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Experiment, ExperimentFilter, ExperimentStatus};
    use crate::actions::CreateExperiment;
    use crate::db::Database;

    #[test]
    fn test_guarded_transition() {
        let db = Database::temp().unwrap();
        let ex = CreateExperiment::dummy(&db, "guarded");

        assert!(Experiment::transition(
            &db,
            ex.id,
            ExperimentStatus::Pending,
            ExperimentStatus::RunningAnswers,
        )
        .unwrap());

        // The second CAS from the same source state loses.
        assert!(!Experiment::transition(
            &db,
            ex.id,
            ExperimentStatus::Pending,
            ExperimentStatus::RunningAnswers,
        )
        .unwrap());

        let ex = Experiment::get(&db, ex.id).unwrap().unwrap();
        assert_eq!(ex.status, ExperimentStatus::RunningAnswers);
    }

    #[test]
    fn test_attempt_counters() {
        let db = Database::temp().unwrap();
        let ex = CreateExperiment::dummy(&db, "counters");

        assert_eq!(Experiment::record_answer_attempt(&db, ex.id, true).unwrap(), 1);
        assert_eq!(Experiment::record_answer_attempt(&db, ex.id, false).unwrap(), 2);
        assert_eq!(Experiment::record_answer_attempt(&db, ex.id, true).unwrap(), 3);

        let ex = Experiment::get(&db, ex.id).unwrap().unwrap();
        assert_eq!(ex.num_try, 3);
        assert_eq!(ex.num_success, 2);
    }

    #[test]
    fn test_counter_alignment_follows_the_rows() {
        use crate::results::{Answer, AnswerOutcome};

        let db = Database::temp().unwrap();
        let ex = CreateExperiment::dummy(&db, "alignment");

        // One successful row, one failed row, counters claiming three tries.
        Answer::upsert(
            &db,
            ex.id,
            0,
            &AnswerOutcome {
                answer: Some("ok".into()),
                ..AnswerOutcome::default()
            },
        )
        .unwrap();
        Answer::upsert(
            &db,
            ex.id,
            1,
            &AnswerOutcome {
                error_msg: Some("timeout".into()),
                ..AnswerOutcome::default()
            },
        )
        .unwrap();
        for success in [true, false, false] {
            Experiment::record_answer_attempt(&db, ex.id, success).unwrap();
        }

        Experiment::align_answer_counters(&db, ex.id).unwrap();
        let ex = Experiment::get(&db, ex.id).unwrap().unwrap();
        assert_eq!(ex.num_try, 1);
        assert_eq!(ex.num_success, 1);
    }

    #[test]
    fn test_orphan_listing() {
        let db = Database::temp().unwrap();
        CreateExperiment::dummy(&db, "orphan-1");
        CreateExperiment::dummy(&db, "orphan-2");

        let orphans = Experiment::list(
            &db,
            &ExperimentFilter {
                orphan: true,
                ..ExperimentFilter::default()
            },
        )
        .unwrap();
        assert_eq!(orphans.len(), 2);

        let backward = Experiment::list(
            &db,
            &ExperimentFilter {
                backward: true,
                ..ExperimentFilter::default()
            },
        )
        .unwrap();
        assert_eq!(backward[0].name, "orphan-2");
    }
}
