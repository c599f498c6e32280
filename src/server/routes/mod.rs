mod datasets;
mod experiments;
mod misc;
mod sets;

use crate::prelude::*;
use crate::server::api_types::{error_response, handle_results};
use crate::server::Data;
use http::{Response, StatusCode};
use hyper::Body;
use std::sync::Arc;
use warp::filters::BoxedFilter;
use warp::{Filter, Rejection};

pub fn all(data: Arc<Data>) -> BoxedFilter<(Response<Body>,)> {
    datasets::routes(data.clone())
        .or(experiments::routes(data.clone()))
        .unify()
        .or(sets::routes(data.clone()))
        .unify()
        .or(misc::routes(data))
        .unify()
        .map(handle_results)
        .recover(handle_rejection)
        .unify()
        .boxed()
}

async fn handle_rejection(rejection: Rejection) -> Result<Response<Body>, Rejection> {
    if rejection.is_not_found() {
        return Ok(error_response(StatusCode::NOT_FOUND, "not found"));
    }
    if let Some(err) = rejection.find::<warp::filters::body::BodyDeserializeError>() {
        return Ok(error_response(StatusCode::BAD_REQUEST, &err.to_string()));
    }
    if let Some(err) = rejection.find::<warp::reject::InvalidQuery>() {
        return Ok(error_response(StatusCode::BAD_REQUEST, &err.to_string()));
    }
    if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        return Ok(error_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "method not allowed",
        ));
    }
    Err(rejection)
}
