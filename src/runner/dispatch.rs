use crate::datasets::Dataset;
use crate::db::Database;
use crate::experiments::{Experiment, ExperimentStatus};
use crate::metrics::{Requirement, REGISTRY};
use crate::prelude::*;
use crate::queue::{Task, TaskSender};
use crate::results::{Answer, MetricResult, MetricStatus, Observation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Answers,
    Observations,
}

/// Whether the experiment has to generate model output before any metric can
/// run: true iff some requested metric wants an `output` the dataset does not
/// already carry.
pub fn needs_output(db: &Database, experiment: &Experiment) -> Fallible<bool> {
    let dataset = Dataset::get(db, experiment.dataset_id)?
        .ok_or_else(|| anyhow!("dataset {} not found", experiment.dataset_id))?;
    if dataset.has_output {
        return Ok(false);
    }

    for result in MetricResult::by_experiment(db, experiment.id)? {
        if let Some(metric) = REGISTRY.get(&result.metric_name) {
            if metric.requires(Requirement::Output) {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Entry point used right after an experiment is created or patched: picks
/// the starting phase and fans the pending rows out onto the queue.
pub fn dispatch_experiment(
    db: &Database,
    queue: &TaskSender,
    experiment_id: i64,
) -> Fallible<usize> {
    let experiment = match Experiment::get(db, experiment_id)? {
        Some(experiment) => experiment,
        None => return Ok(0),
    };

    if needs_output(db, &experiment)? {
        dispatch_tasks(db, queue, experiment_id, Phase::Answers)
    } else {
        dispatch_tasks(db, queue, experiment_id, Phase::Observations)
    }
}

/// Enqueues one task per pending row of the given phase. Counters are
/// re-derived from the stored rows first, so rows that already succeeded are
/// skipped and completion detection stays exact across reruns and retries.
///
/// An experiment that turns out to have nothing left to do in the requested
/// phase falls through: a no-op answer phase hands off to the observation
/// phase, a no-op observation phase finishes the experiment.
pub fn dispatch_tasks(
    db: &Database,
    queue: &TaskSender,
    experiment_id: i64,
    phase: Phase,
) -> Fallible<usize> {
    let experiment = match Experiment::get(db, experiment_id)? {
        Some(experiment) => experiment,
        None => {
            debug!("not dispatching experiment {}: gone", experiment_id);
            return Ok(0);
        }
    };
    let dataset = Dataset::get(db, experiment.dataset_id)?
        .ok_or_else(|| anyhow!("dataset {} not found", experiment.dataset_id))?;

    match phase {
        Phase::Answers => {
            Experiment::set_status(db, experiment.id, ExperimentStatus::RunningAnswers)?;
            Experiment::align_answer_counters(db, experiment.id)?;

            let done = Answer::successful_lines(db, experiment.id)?;
            let mut enqueued = 0;
            for num_line in 0..dataset.size {
                if done.contains(&num_line) {
                    continue;
                }
                queue.push(&Task::Answer {
                    experiment_id: experiment.id,
                    num_line,
                })?;
                enqueued += 1;
            }

            info!(
                "dispatched {} answer tasks for experiment {} ({})",
                enqueued, experiment.id, experiment.name
            );
            if enqueued == 0 {
                return dispatch_tasks(db, queue, experiment_id, Phase::Observations);
            }
            Ok(enqueued)
        }
        Phase::Observations => {
            Experiment::set_status(db, experiment.id, ExperimentStatus::RunningMetrics)?;

            let mut enqueued = 0;
            for result in MetricResult::by_experiment(db, experiment.id)? {
                enqueued += dispatch_result_rows(db, queue, &experiment, &result, dataset.size)?;
            }
            Experiment::sync_observation_totals(db, experiment.id)?;

            info!(
                "dispatched {} observation tasks for experiment {} ({})",
                enqueued, experiment.id, experiment.name
            );
            if enqueued == 0 {
                Experiment::try_finish(db, experiment.id, dataset.size)?;
            }
            Ok(enqueued)
        }
    }
}

fn dispatch_result_rows(
    db: &Database,
    queue: &TaskSender,
    experiment: &Experiment,
    result: &MetricResult,
    dataset_size: i64,
) -> Fallible<usize> {
    MetricResult::align_counters(db, result.id)?;

    let done = Observation::successful_lines(db, result.id)?;
    let mut missing = Vec::new();
    for num_line in 0..dataset_size {
        if !done.contains(&num_line) {
            missing.push(num_line);
        }
    }

    if missing.is_empty() {
        MetricResult::set_status(db, result.id, MetricStatus::Finished)?;
        return Ok(0);
    }

    MetricResult::set_status(db, result.id, MetricStatus::Running)?;
    for num_line in &missing {
        queue.push(&Task::Observation {
            experiment_id: experiment.id,
            result_id: result.id,
            metric_name: result.metric_name.clone(),
            num_line: *num_line,
        })?;
    }
    Ok(missing.len())
}

/// What the retry planner decided to re-enqueue for an experiment set.
#[derive(Debug, Default, Serialize)]
pub struct RetryPlan {
    pub experiment_ids: Vec<i64>,
    pub result_ids: Vec<i64>,
}

/// Diffs the counters of a set's finished experiments. An experiment whose
/// answer phase kept failures goes back through the answer phase; otherwise
/// each finished result with failed rows gets an observation-phase retry.
pub fn plan_retries(db: &Database, set_id: i64) -> Fallible<RetryPlan> {
    let mut plan = RetryPlan::default();

    for experiment in Experiment::by_set(db, set_id)? {
        if experiment.status != ExperimentStatus::Finished {
            continue;
        }

        if experiment.num_try != experiment.num_success && needs_output(db, &experiment)? {
            plan.experiment_ids.push(experiment.id);
            continue;
        }

        for result in MetricResult::by_experiment(db, experiment.id)? {
            if result.status == MetricStatus::Finished && result.num_try != result.num_success {
                plan.result_ids.push(result.id);
            }
        }
    }

    Ok(plan)
}

/// Re-enters the normal dispatch paths for everything the plan names. The
/// upsert protocol makes this safe to run on top of rows that already
/// succeeded: they are skipped at enqueue time and untouched at write time.
pub fn dispatch_retries(db: &Database, queue: &TaskSender, plan: &RetryPlan) -> Fallible<()> {
    for &experiment_id in &plan.experiment_ids {
        dispatch_tasks(db, queue, experiment_id, Phase::Answers)?;
    }

    for &result_id in &plan.result_ids {
        let result = match MetricResult::get(db, result_id)? {
            Some(result) => result,
            None => continue,
        };
        let experiment = match Experiment::get(db, result.experiment_id)? {
            Some(experiment) => experiment,
            None => continue,
        };
        let dataset = Dataset::get(db, experiment.dataset_id)?
            .ok_or_else(|| anyhow!("dataset {} not found", experiment.dataset_id))?;

        Experiment::set_status(db, experiment.id, ExperimentStatus::RunningMetrics)?;
        let enqueued = dispatch_result_rows(db, queue, &experiment, &result, dataset.size)?;
        Experiment::sync_observation_totals(db, experiment.id)?;
        if enqueued == 0 {
            Experiment::try_finish(db, experiment.id, dataset.size)?;
        }
    }

    Ok(())
}
