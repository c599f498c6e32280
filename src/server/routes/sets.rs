use crate::actions::{AppendExperiments, CreateExperimentSet};
use crate::experiments::Experiment;
use crate::prelude::*;
use crate::runner::dispatch::{dispatch_experiment, dispatch_retries, plan_retries};
use crate::server::api_types::{json_response, not_found, ExperimentSetPatch, ExperimentSetView};
use crate::server::Data;
use crate::sets::{ExperimentSet, ExperimentSetPatchFields};
use http::{Response, StatusCode};
use hyper::Body;
use std::sync::Arc;
use warp::filters::BoxedFilter;
use warp::Filter;

pub fn routes(data: Arc<Data>) -> BoxedFilter<(Fallible<Response<Body>>,)> {
    let data_filter = warp::any().map(move || data.clone());

    let create = warp::post()
        .and(warp::path("experiment_set"))
        .and(warp::path::end())
        .and(warp::body::json())
        .and(data_filter.clone())
        .map(endpoint_create);

    let list = warp::get()
        .and(warp::path("experiment_sets"))
        .and(warp::path::end())
        .and(data_filter.clone())
        .map(endpoint_list);

    let get = warp::get()
        .and(warp::path("experiment_set"))
        .and(warp::path::param::<i64>())
        .and(warp::path::end())
        .and(data_filter.clone())
        .map(endpoint_get);

    let patch = warp::patch()
        .and(warp::path("experiment_set"))
        .and(warp::path::param::<i64>())
        .and(warp::path::end())
        .and(warp::body::json())
        .and(data_filter.clone())
        .map(endpoint_patch);

    let delete = warp::delete()
        .and(warp::path("experiment_set"))
        .and(warp::path::param::<i64>())
        .and(warp::path::end())
        .and(data_filter.clone())
        .map(endpoint_delete);

    let retry = warp::post()
        .and(warp::path("retry"))
        .and(warp::path("experiment_set"))
        .and(warp::path::param::<i64>())
        .and(warp::path::end())
        .and(data_filter)
        .map(endpoint_retry);

    create
        .or(list)
        .unify()
        .or(get)
        .unify()
        .or(patch)
        .unify()
        .or(delete)
        .unify()
        .or(retry)
        .unify()
        .boxed()
}

fn view(data: &Data, set: ExperimentSet) -> Fallible<ExperimentSetView> {
    let experiments = Experiment::by_set(&data.db, set.id)?;
    Ok(ExperimentSetView { set, experiments })
}

fn endpoint_create(spec: CreateExperimentSet, data: Arc<Data>) -> Fallible<Response<Body>> {
    let (set, experiments) = spec.apply(&data.db)?;
    for experiment in &experiments {
        dispatch_experiment(&data.db, &data.queue, experiment.id)?;
    }
    json_response(StatusCode::CREATED, &view(&data, set)?)
}

fn endpoint_list(data: Arc<Data>) -> Fallible<Response<Body>> {
    let mut views = Vec::new();
    for set in ExperimentSet::all(&data.db)? {
        views.push(view(&data, set)?);
    }
    json_response(StatusCode::OK, &views)
}

fn endpoint_get(id: i64, data: Arc<Data>) -> Fallible<Response<Body>> {
    match ExperimentSet::get(&data.db, id)? {
        Some(set) => json_response(StatusCode::OK, &view(&data, set)?),
        None => not_found("experiment set"),
    }
}

fn endpoint_patch(id: i64, patch: ExperimentSetPatch, data: Arc<Data>) -> Fallible<Response<Body>> {
    let set = match ExperimentSet::update(
        &data.db,
        id,
        &ExperimentSetPatchFields {
            name: patch.name,
            readme: patch.readme,
        },
    )? {
        Some(set) => set,
        None => return not_found("experiment set"),
    };

    if let Some(experiments) = patch.experiments {
        let appended = AppendExperiments {
            set_id: set.id,
            experiments,
        }
        .apply(&data.db)?;
        for experiment in &appended {
            dispatch_experiment(&data.db, &data.queue, experiment.id)?;
        }
    }

    json_response(StatusCode::OK, &view(&data, set)?)
}

fn endpoint_delete(id: i64, data: Arc<Data>) -> Fallible<Response<Body>> {
    if ExperimentSet::delete(&data.db, id)? {
        json_response(StatusCode::OK, &"ok")
    } else {
        not_found("experiment set")
    }
}

fn endpoint_retry(id: i64, data: Arc<Data>) -> Fallible<Response<Body>> {
    if ExperimentSet::get(&data.db, id)?.is_none() {
        return not_found("experiment set");
    }

    let plan = plan_retries(&data.db, id)?;
    dispatch_retries(&data.db, &data.queue, &plan)?;
    json_response(StatusCode::OK, &plan)
}
