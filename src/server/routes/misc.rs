use crate::leaderboard::{self, DEFAULT_METRIC};
use crate::metrics::REGISTRY;
use crate::prelude::*;
use crate::server::api_types::{json_response, LeaderboardQuery, MetricInfo};
use crate::server::metrics::Metrics;
use crate::server::Data;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Response, StatusCode};
use hyper::Body;
use std::sync::Arc;
use warp::filters::BoxedFilter;
use warp::Filter;

pub fn routes(data: Arc<Data>) -> BoxedFilter<(Fallible<Response<Body>>,)> {
    let data_filter = warp::any().map(move || data.clone());

    let metrics = warp::get()
        .and(warp::path("metrics"))
        .and(warp::path::end())
        .map(endpoint_metrics);

    let leaderboard = warp::get()
        .and(warp::path("leaderboard"))
        .and(warp::path::end())
        .and(warp::query::<LeaderboardQuery>())
        .and(data_filter)
        .map(endpoint_leaderboard);

    let prometheus = warp::get()
        .and(warp::path("prometheus"))
        .and(warp::path::end())
        .map(endpoint_prometheus);

    metrics
        .or(leaderboard)
        .unify()
        .or(prometheus)
        .unify()
        .boxed()
}

fn endpoint_metrics() -> Fallible<Response<Body>> {
    let metrics: Vec<MetricInfo> = REGISTRY.all().map(MetricInfo::from).collect();
    json_response(StatusCode::OK, &metrics)
}

fn endpoint_leaderboard(query: LeaderboardQuery, data: Arc<Data>) -> Fallible<Response<Body>> {
    let board = leaderboard::leaderboard(
        &data.db,
        query.metric_name.as_deref().unwrap_or(DEFAULT_METRIC),
        query.dataset_name.as_deref(),
        query.limit.unwrap_or(100).min(100),
    )?;
    json_response(StatusCode::OK, &board)
}

fn endpoint_prometheus() -> Fallible<Response<Body>> {
    let rendered = Metrics::render()?;
    let mut resp = Response::new(rendered.into());
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    Ok(resp)
}
