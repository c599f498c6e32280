use crate::actions::{AddMetrics, CreateExperiment};
use crate::datasets::Dataset;
use crate::errors::SchemaError;
use crate::experiments::{Experiment, ExperimentFilter, ExperimentStatus};
use crate::prelude::*;
use crate::results::{Answer, MetricResult};
use crate::runner::dispatch::{dispatch_experiment, dispatch_tasks, needs_output, Phase};
use crate::server::api_types::{
    json_response, not_found, ExperimentPatch, ExperimentQuery, ExperimentView, ExperimentsQuery,
};
use crate::server::Data;
use http::{Response, StatusCode};
use hyper::Body;
use std::sync::Arc;
use warp::filters::BoxedFilter;
use warp::Filter;

pub fn routes(data: Arc<Data>) -> BoxedFilter<(Fallible<Response<Body>>,)> {
    let data_filter = warp::any().map(move || data.clone());

    let create = warp::post()
        .and(warp::path("experiment"))
        .and(warp::path::end())
        .and(warp::body::json())
        .and(data_filter.clone())
        .map(endpoint_create);

    let list = warp::get()
        .and(warp::path("experiments"))
        .and(warp::path::end())
        .and(warp::query::<ExperimentsQuery>())
        .and(data_filter.clone())
        .map(endpoint_list);

    let get = warp::get()
        .and(warp::path("experiment"))
        .and(warp::path::param::<i64>())
        .and(warp::path::end())
        .and(warp::query::<ExperimentQuery>())
        .and(data_filter.clone())
        .map(endpoint_get);

    let patch = warp::patch()
        .and(warp::path("experiment"))
        .and(warp::path::param::<i64>())
        .and(warp::path::end())
        .and(warp::body::json())
        .and(data_filter.clone())
        .map(endpoint_patch);

    let delete = warp::delete()
        .and(warp::path("experiment"))
        .and(warp::path::param::<i64>())
        .and(warp::path::end())
        .and(data_filter)
        .map(endpoint_delete);

    create
        .or(list)
        .unify()
        .or(get)
        .unify()
        .or(patch)
        .unify()
        .or(delete)
        .unify()
        .boxed()
}

fn endpoint_create(spec: CreateExperiment, data: Arc<Data>) -> Fallible<Response<Body>> {
    let experiment = spec.apply(&data.db)?;
    dispatch_experiment(&data.db, &data.queue, experiment.id)?;

    // Re-read: the dispatch already moved the status along.
    let experiment = Experiment::get(&data.db, experiment.id)?
        .ok_or_else(|| anyhow!("experiment vanished after dispatch"))?;
    json_response(StatusCode::CREATED, &experiment)
}

fn endpoint_list(query: ExperimentsQuery, data: Arc<Data>) -> Fallible<Response<Body>> {
    let experiments = Experiment::list(
        &data.db,
        &ExperimentFilter {
            set_id: query.set_id,
            orphan: query.orphan,
            limit: query.limit,
            backward: query.backward,
        },
    )?;
    json_response(StatusCode::OK, &experiments)
}

fn endpoint_get(id: i64, query: ExperimentQuery, data: Arc<Data>) -> Fallible<Response<Body>> {
    let experiment = match Experiment::get(&data.db, id)? {
        Some(experiment) => experiment,
        None => return not_found("experiment"),
    };

    // Asking for the dataset implies the fully denormalized view.
    let with_results = query.with_results || query.with_dataset;
    let with_answers = query.with_answers || query.with_dataset;

    let view = ExperimentView {
        results: if with_results {
            Some(MetricResult::by_experiment(&data.db, experiment.id)?)
        } else {
            None
        },
        answers: if with_answers {
            Some(Answer::by_experiment(&data.db, experiment.id)?)
        } else {
            None
        },
        dataset: if query.with_dataset {
            Dataset::full(&data.db, experiment.dataset_id)?
        } else {
            None
        },
        experiment,
    };
    json_response(StatusCode::OK, &view)
}

fn endpoint_patch(id: i64, patch: ExperimentPatch, data: Arc<Data>) -> Fallible<Response<Body>> {
    let experiment = match Experiment::get(&data.db, id)? {
        Some(experiment) => experiment,
        None => return not_found("experiment"),
    };

    if !matches!(
        experiment.status,
        ExperimentStatus::Pending | ExperimentStatus::Finished
    ) {
        return Err(SchemaError::new(format!(
            "experiment is running ({}), please try again later",
            experiment.status
        ))
        .into());
    }

    Experiment::update_info(&data.db, id, patch.name.as_deref(), patch.readme.as_deref())?;

    if let Some(metrics) = &patch.metrics {
        AddMetrics {
            experiment_id: id,
            metrics: metrics.clone(),
        }
        .apply(&data.db)?;
    }

    let experiment = Experiment::get(&data.db, id)?
        .ok_or_else(|| anyhow!("experiment vanished during patch"))?;
    if patch.rerun_answers && needs_output(&data.db, &experiment)? {
        dispatch_tasks(&data.db, &data.queue, id, Phase::Answers)?;
    } else if patch.rerun_metrics {
        dispatch_tasks(&data.db, &data.queue, id, Phase::Observations)?;
    }

    let experiment = Experiment::get(&data.db, id)?
        .ok_or_else(|| anyhow!("experiment vanished during patch"))?;
    json_response(StatusCode::OK, &experiment)
}

fn endpoint_delete(id: i64, data: Arc<Data>) -> Fallible<Response<Body>> {
    if Experiment::delete(&data.db, id)? {
        json_response(StatusCode::OK, &"ok")
    } else {
        not_found("experiment")
    }
}
