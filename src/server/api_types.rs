use crate::datasets::DatasetFull;
use crate::errors::{is_constraint_violation, SchemaError};
use crate::experiments::Experiment;
use crate::metrics::{Metric, MetricKind, Requirement};
use crate::prelude::*;
use crate::results::{Answer, MetricResult};
use crate::sets::ExperimentSet;
use crate::utils;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Response, StatusCode};
use hyper::Body;
use serde::Serialize;

pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Fallible<Response<Body>> {
    let serialized = serde_json::to_vec(body)?;

    let mut resp = Response::new(serialized.into());
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    *resp.status_mut() = status;
    Ok(resp)
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

pub fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    json_response(status, &ErrorBody { error: message }).unwrap_or_else(|_| {
        let mut resp = Response::new(Body::from("internal server error"));
        *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        resp
    })
}

pub fn not_found(what: &str) -> Fallible<Response<Body>> {
    Ok(error_response(
        StatusCode::NOT_FOUND,
        &format!("{what} not found"),
    ))
}

/// Maps the error taxonomy onto status codes: schema errors are 400s,
/// uniqueness and reference violations are 409s, the rest is a logged 500.
pub fn handle_results(resp: Fallible<Response<Body>>) -> Response<Body> {
    match resp {
        Ok(resp) => resp,
        Err(err) => {
            if let Some(schema) = err.downcast_ref::<SchemaError>() {
                error_response(StatusCode::BAD_REQUEST, &schema.to_string())
            } else if is_constraint_violation(&err) {
                error_response(
                    StatusCode::CONFLICT,
                    &format!("conflicting record: {err:#}"),
                )
            } else {
                utils::report_failure(&err);
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
            }
        }
    }
}

#[derive(Deserialize)]
pub struct DatasetQuery {
    #[serde(default)]
    pub with_df: bool,
}

#[derive(Deserialize)]
pub struct ExperimentQuery {
    #[serde(default)]
    pub with_results: bool,
    #[serde(default)]
    pub with_answers: bool,
    #[serde(default)]
    pub with_dataset: bool,
}

#[derive(Deserialize)]
pub struct ExperimentsQuery {
    pub set_id: Option<i64>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub orphan: bool,
    #[serde(default)]
    pub backward: bool,
}

#[derive(Deserialize)]
pub struct LeaderboardQuery {
    pub metric_name: Option<String>,
    pub dataset_name: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct ExperimentPatch {
    pub name: Option<String>,
    pub readme: Option<String>,
    pub metrics: Option<Vec<String>>,
    #[serde(default)]
    pub rerun_answers: bool,
    #[serde(default)]
    pub rerun_metrics: bool,
}

#[derive(Deserialize)]
pub struct ExperimentSetPatch {
    pub name: Option<String>,
    pub readme: Option<String>,
    pub experiments: Option<Vec<crate::actions::CreateExperiment>>,
}

/// An experiment optionally denormalized with its results, answers, and
/// dataset, depending on what the query string asked for.
#[derive(Serialize)]
pub struct ExperimentView {
    #[serde(flatten)]
    pub experiment: Experiment,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<MetricResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answers: Option<Vec<Answer>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset: Option<DatasetFull>,
}

#[derive(Serialize)]
pub struct ExperimentSetView {
    #[serde(flatten)]
    pub set: ExperimentSet,
    pub experiments: Vec<Experiment>,
}

#[derive(Serialize)]
pub struct MetricInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub kind: MetricKind,
    pub require: Vec<Requirement>,
}

impl From<&Metric> for MetricInfo {
    fn from(metric: &Metric) -> Self {
        MetricInfo {
            name: metric.name,
            description: metric.description,
            kind: metric.kind,
            require: metric.require.to_vec(),
        }
    }
}
