pub mod api_types;
pub mod metrics;
mod routes;

use self::metrics::Metrics;
use crate::config::Config;
use crate::db::Database;
use crate::llm::HttpCompletion;
use crate::prelude::*;
use crate::queue::{TaskQueue, TaskSender};
use crate::runner;
use std::sync::Arc;
use std::time::Duration;
use warp::Filter;

/// Shared state behind the HTTP surface: the store, the producer side of the
/// task queue, and the process-wide metrics.
pub struct Data {
    pub config: Config,
    pub db: Database,
    pub queue: TaskSender,
    pub metrics: Metrics,
}

/// Brings the whole engine up in this process: store, task queue, streamer,
/// worker pool, and the API server. Blocks until the server shuts down.
pub fn run(config: Config) -> Fallible<()> {
    let db = Database::open(&config.storage.database_path)?;
    let queue = TaskQueue::bind(config.runner.queue_depth);
    let metrics = Metrics::new()?;
    let completion = Arc::new(HttpCompletion::new(Duration::from_secs(
        config.runner.llm_timeout_secs,
    ))?);

    let _runner = runner::start(
        &db,
        &queue,
        completion,
        metrics.clone(),
        config.runner.max_concurrent_tasks,
    )?;

    let bind = config.server.bind;
    let data = Arc::new(Data {
        config,
        db,
        queue: queue.sender(),
        metrics: metrics.clone(),
    });

    let timing = warp::log::custom(move |info| {
        let endpoint = info.path().split('/').nth(1).unwrap_or("");
        metrics.record_endpoint_time(
            info.method().as_str(),
            endpoint,
            info.elapsed().as_secs_f64(),
        );
    });
    let filter = routes::all(data).with(timing);

    info!("running the server on {}...", bind);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(warp::serve(filter).run(bind));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{routes, Data};
    use crate::config::Config;
    use crate::db::Database;
    use crate::queue::TaskQueue;
    use crate::server::metrics::Metrics;
    use std::sync::Arc;

    fn test_data() -> (Arc<Data>, TaskQueue) {
        let queue = TaskQueue::bind(64);
        let data = Arc::new(Data {
            config: Config::default(),
            db: Database::temp().unwrap(),
            queue: queue.sender(),
            metrics: Metrics::shared(),
        });
        (data, queue)
    }

    #[tokio::test]
    async fn test_missing_entities_are_404() {
        let (data, _queue) = test_data();
        let filter = routes::all(data);

        let resp = warp::test::request()
            .path("/dataset/42")
            .reply(&filter)
            .await;
        assert_eq!(resp.status(), 404);

        let resp = warp::test::request().path("/nope").reply(&filter).await;
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn test_dataset_round_trip_and_conflict() {
        let (data, _queue) = test_data();
        let filter = routes::all(data);

        let payload = serde_json::json!({
            "name": "demo",
            "df": r#"[{"query": "q0", "output_true": "t0"}]"#,
        });

        let resp = warp::test::request()
            .method("POST")
            .path("/dataset")
            .json(&payload)
            .reply(&filter)
            .await;
        assert_eq!(resp.status(), 201);
        let created: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(created["has_query"], serde_json::json!(true));
        assert_eq!(created["size"], serde_json::json!(1));

        // Fetching with the payload gives the exact df back.
        let id = created["id"].as_i64().unwrap();
        let resp = warp::test::request()
            .path(&format!("/dataset/{id}?with_df=true"))
            .reply(&filter)
            .await;
        assert_eq!(resp.status(), 200);
        let fetched: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(fetched["df"], payload["df"]);

        // A second dataset with the same name violates uniqueness.
        let resp = warp::test::request()
            .method("POST")
            .path("/dataset")
            .json(&payload)
            .reply(&filter)
            .await;
        assert_eq!(resp.status(), 409);
    }

    #[tokio::test]
    async fn test_invalid_experiment_is_400_and_not_persisted() {
        let (data, _queue) = test_data();
        let filter = routes::all(data.clone());

        let payload = serde_json::json!({
            "name": "invalid",
            "metrics": ["judge_exactness"],
            "dataset": {
                "name": "queries-only",
                "df": r#"[{"query": "q0", "output": "o0"}]"#,
            },
        });

        let resp = warp::test::request()
            .method("POST")
            .path("/experiment")
            .json(&payload)
            .reply(&filter)
            .await;
        assert_eq!(resp.status(), 400);

        let resp = warp::test::request().path("/experiments").reply(&filter).await;
        assert_eq!(resp.status(), 200);
        let listed: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(listed, serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_metric_listing() {
        let (data, _queue) = test_data();
        let filter = routes::all(data);

        let resp = warp::test::request().path("/metrics").reply(&filter).await;
        assert_eq!(resp.status(), 200);
        let metrics: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        let names: Vec<_> = metrics
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"judge_exactness"));

        let judge = metrics
            .as_array()
            .unwrap()
            .iter()
            .find(|m| m["name"] == "judge_exactness")
            .unwrap();
        assert_eq!(judge["kind"], serde_json::json!("deterministic"));
        assert_eq!(
            judge["require"],
            serde_json::json!(["output", "output_true"])
        );
    }
}
