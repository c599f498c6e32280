use crate::datasets::{Dataset, DatasetNew, DatasetPatch};
use crate::prelude::*;
use crate::server::api_types::{json_response, not_found, DatasetQuery};
use crate::server::Data;
use http::{Response, StatusCode};
use hyper::Body;
use std::sync::Arc;
use warp::filters::BoxedFilter;
use warp::Filter;

pub fn routes(data: Arc<Data>) -> BoxedFilter<(Fallible<Response<Body>>,)> {
    let data_filter = warp::any().map(move || data.clone());

    let create = warp::post()
        .and(warp::path("dataset"))
        .and(warp::path::end())
        .and(warp::body::json())
        .and(data_filter.clone())
        .map(endpoint_create);

    let list = warp::get()
        .and(warp::path("datasets"))
        .and(warp::path::end())
        .and(data_filter.clone())
        .map(endpoint_list);

    let get = warp::get()
        .and(warp::path("dataset"))
        .and(warp::path::param::<i64>())
        .and(warp::path::end())
        .and(warp::query::<DatasetQuery>())
        .and(data_filter.clone())
        .map(endpoint_get);

    let patch = warp::patch()
        .and(warp::path("dataset"))
        .and(warp::path::param::<i64>())
        .and(warp::path::end())
        .and(warp::body::json())
        .and(data_filter.clone())
        .map(endpoint_patch);

    let delete = warp::delete()
        .and(warp::path("dataset"))
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

fn endpoint_create(new: DatasetNew, data: Arc<Data>) -> Fallible<Response<Body>> {
    let dataset = Dataset::create(&data.db, &new)?;
    json_response(StatusCode::CREATED, &dataset)
}

fn endpoint_list(data: Arc<Data>) -> Fallible<Response<Body>> {
    let datasets = Dataset::all(&data.db)?;
    json_response(StatusCode::OK, &datasets)
}

fn endpoint_get(id: i64, query: DatasetQuery, data: Arc<Data>) -> Fallible<Response<Body>> {
    if query.with_df {
        match Dataset::full(&data.db, id)? {
            Some(dataset) => json_response(StatusCode::OK, &dataset),
            None => not_found("dataset"),
        }
    } else {
        match Dataset::get(&data.db, id)? {
            Some(dataset) => json_response(StatusCode::OK, &dataset),
            None => not_found("dataset"),
        }
    }
}

fn endpoint_patch(id: i64, patch: DatasetPatch, data: Arc<Data>) -> Fallible<Response<Body>> {
    match Dataset::update(&data.db, id, &patch)? {
        Some(dataset) => json_response(StatusCode::OK, &dataset),
        None => not_found("dataset"),
    }
}

fn endpoint_delete(id: i64, data: Arc<Data>) -> Fallible<Response<Body>> {
    if Dataset::delete(&data.db, id)? {
        json_response(StatusCode::OK, &"ok")
    } else {
        not_found("dataset")
    }
}
