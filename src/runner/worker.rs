use crate::datasets::{Dataset, Table};
use crate::db::Database;
use crate::errors::is_constraint_violation;
use crate::experiments::{Experiment, ExperimentStatus};
use crate::llm::Completion;
use crate::metrics::{MetricInput, REGISTRY};
use crate::models::Model;
use crate::prelude::*;
use crate::queue::{Task, TaskSender, TaskSource};
use crate::results::{Answer, AnswerOutcome, MetricResult, MetricStatus, Observation, ObservationOutcome};
use crate::runner::dispatch::{dispatch_tasks, Phase};
use crate::server::metrics::Metrics;
use crate::utils;
use serde_json::Map;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

pub(super) struct Worker {
    name: String,
    db: Database,
    source: TaskSource,
    queue: TaskSender,
    completion: Arc<dyn Completion>,
    metrics: Metrics,
}

impl Worker {
    pub(super) fn new(
        name: String,
        db: Database,
        source: TaskSource,
        queue: TaskSender,
        completion: Arc<dyn Completion>,
        metrics: Metrics,
    ) -> Self {
        Worker {
            name,
            db,
            source,
            queue,
            completion,
            metrics,
        }
    }

    /// Blocking pull loop. One envelope is one attempt: failures end up in
    /// the row's error_msg and are never retried from in here.
    pub(super) fn run(&self) {
        while let Some(task) = self.source.pull() {
            trace!("{} running task: {:?}", self.name, task);
            let result = catch_unwind(AssertUnwindSafe(|| self.process_task(&task)));
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => utils::report_failure(&err),
                Err(panic) => utils::report_panic(&*panic),
            }
        }
        debug!("{} shutting down", self.name);
    }

    fn process_task(&self, task: &Task) -> Fallible<()> {
        match task {
            Task::Answer {
                experiment_id,
                num_line,
            } => self.run_answer_task(*experiment_id, *num_line),
            Task::Observation {
                experiment_id,
                result_id,
                metric_name,
                num_line,
            } => self.run_observation_task(*experiment_id, *result_id, metric_name, *num_line),
        }
    }

    fn run_answer_task(&self, experiment_id: i64, num_line: i64) -> Fallible<()> {
        // A missing experiment means it was deleted with tasks still in
        // flight; those are discarded quietly.
        let experiment = match Experiment::get(&self.db, experiment_id)? {
            Some(experiment) => experiment,
            None => {
                debug!("discarding answer task for deleted experiment {experiment_id}");
                return Ok(());
            }
        };
        let dataset = match Dataset::get(&self.db, experiment.dataset_id)? {
            Some(dataset) => dataset,
            None => {
                debug!("discarding answer task for deleted dataset {}", experiment.dataset_id);
                return Ok(());
            }
        };
        let table = Dataset::table(&self.db, dataset.id)?
            .ok_or_else(|| anyhow!("dataset {} lost its payload", dataset.id))?;

        let start = Instant::now();
        let generated = self.generate_answer(&experiment, &table, num_line);
        let execution_time = start.elapsed().as_secs() as i64;

        let outcome = match generated {
            Ok((answer, mut metadata)) => {
                metadata.insert("generation_time".into(), execution_time.into());
                AnswerOutcome {
                    answer: Some(answer),
                    error_msg: None,
                    execution_time: Some(execution_time),
                    metadata: Some(serde_json::Value::Object(metadata)),
                }
            }
            Err(err) => AnswerOutcome {
                answer: None,
                error_msg: Some(format!("{err:#}")),
                execution_time: Some(execution_time),
                metadata: None,
            },
        };

        if let Err(err) = Answer::upsert(&self.db, experiment_id, num_line, &outcome) {
            if is_constraint_violation(&err) {
                debug!("discarding answer for experiment {experiment_id}: deleted mid-flight");
                return Ok(());
            }
            return Err(err);
        }

        let success = outcome.error_msg.is_none();
        self.metrics.record_task("answer", success);

        let num_try = Experiment::record_answer_attempt(&self.db, experiment_id, success)?;
        if num_try >= dataset.size {
            // Only the worker that wins the CAS drives the phase handoff.
            if Experiment::transition(
                &self.db,
                experiment_id,
                ExperimentStatus::RunningAnswers,
                ExperimentStatus::RunningMetrics,
            )? {
                dispatch_tasks(&self.db, &self.queue, experiment_id, Phase::Observations)?;
            }
        }

        Ok(())
    }

    fn generate_answer(
        &self,
        experiment: &Experiment,
        table: &Table,
        num_line: i64,
    ) -> Fallible<(String, Map<String, serde_json::Value>)> {
        let model_id = experiment
            .model_id
            .ok_or_else(|| anyhow!("experiment {} has no model to generate answers with", experiment.id))?;
        let model = Model::get(&self.db, model_id)?
            .ok_or_else(|| anyhow!("model {} not found", model_id))?;
        let query = table
            .text_field(num_line as usize, "query")
            .ok_or_else(|| anyhow!("row {} has no query", num_line))?;

        let output = self.completion.complete(&model, &query)?;
        Ok((output.content, output.metadata))
    }

    fn run_observation_task(
        &self,
        experiment_id: i64,
        result_id: i64,
        metric_name: &str,
        num_line: i64,
    ) -> Fallible<()> {
        let result = match MetricResult::get(&self.db, result_id)? {
            Some(result) => result,
            None => {
                debug!("discarding observation task for deleted result {result_id}");
                return Ok(());
            }
        };
        let experiment = match Experiment::get(&self.db, experiment_id)? {
            Some(experiment) => experiment,
            None => {
                debug!("discarding observation task for deleted experiment {experiment_id}");
                return Ok(());
            }
        };
        let dataset = match Dataset::get(&self.db, experiment.dataset_id)? {
            Some(dataset) => dataset,
            None => {
                debug!("discarding observation task for deleted dataset {}", experiment.dataset_id);
                return Ok(());
            }
        };
        let table = Dataset::table(&self.db, dataset.id)?
            .ok_or_else(|| anyhow!("dataset {} lost its payload", dataset.id))?;

        let start = Instant::now();
        let scored = self.score_row(&experiment, &dataset, &table, metric_name, num_line);
        let execution_time = start.elapsed().as_secs() as i64;

        let outcome = match scored {
            Ok(outcome) => ObservationOutcome {
                score: outcome.score,
                observation: outcome.observation,
                error_msg: None,
                execution_time: Some(execution_time),
            },
            Err(err) => ObservationOutcome {
                score: None,
                observation: None,
                error_msg: Some(format!("{err:#}")),
                execution_time: Some(execution_time),
            },
        };

        if let Err(err) = Observation::upsert(&self.db, result_id, num_line, &outcome) {
            if is_constraint_violation(&err) {
                debug!("discarding observation for result {result_id}: deleted mid-flight");
                return Ok(());
            }
            return Err(err);
        }

        let success = outcome.error_msg.is_none();
        self.metrics.record_task("observation", success);

        let num_try =
            MetricResult::record_observation_attempt(&self.db, result_id, experiment_id, success)?;
        if num_try >= dataset.size {
            if MetricResult::transition(
                &self.db,
                result_id,
                MetricStatus::Running,
                MetricStatus::Finished,
            )? {
                debug!(
                    "result {} ({}) completed all rows",
                    result.id, result.metric_name
                );
            }
            Experiment::try_finish(&self.db, experiment_id, dataset.size)?;
        }

        Ok(())
    }

    fn score_row(
        &self,
        experiment: &Experiment,
        dataset: &Dataset,
        table: &Table,
        metric_name: &str,
        num_line: i64,
    ) -> Fallible<crate::metrics::MetricOutcome> {
        let metric = REGISTRY
            .get(metric_name)
            .ok_or_else(|| anyhow!("unknown metric: {metric_name}"))?;

        let row = table
            .row(num_line as usize)
            .ok_or_else(|| anyhow!("row {} is out of range", num_line))?;

        // The output under scrutiny either came out of the answer phase or
        // was shipped with the dataset.
        let (output, metadata) = if dataset.has_output {
            let output = table
                .text_field(num_line as usize, "output")
                .ok_or_else(|| anyhow!("row {} has no output", num_line))?;
            (output, Map::new())
        } else {
            let answer = Answer::get(&self.db, experiment.id, num_line)?
                .ok_or_else(|| anyhow!("no answer recorded for row {}", num_line))?;
            let output = answer
                .answer
                .ok_or_else(|| anyhow!("answer for row {} carries no output", num_line))?;
            let metadata = match answer.metadata {
                Some(serde_json::Value::Object(map)) => map,
                _ => Map::new(),
            };
            (output, metadata)
        };

        let input = MetricInput {
            output: &output,
            metadata: &metadata,
            row,
        };
        match catch_unwind(AssertUnwindSafe(|| metric.evaluate(&input))) {
            Ok(outcome) => outcome,
            Err(_) => Err(anyhow!("metric {} panicked", metric_name)),
        }
    }
}
