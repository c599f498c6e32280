pub mod dispatch;
mod worker;

use crate::db::Database;
use crate::llm::Completion;
use crate::prelude::*;
use crate::queue::TaskQueue;
use crate::server::metrics::Metrics;
use std::sync::Arc;
use std::thread;

/// The fixed-size pool of worker threads. The handles are kept for the
/// lifetime of the process; workers only exit once the queue closes.
pub struct Runner {
    _threads: Vec<thread::JoinHandle<()>>,
}

pub fn start(
    db: &Database,
    queue: &TaskQueue,
    completion: Arc<dyn Completion>,
    metrics: Metrics,
    threads_count: usize,
) -> Fallible<Runner> {
    let mut threads = Vec::with_capacity(threads_count);
    for i in 0..threads_count {
        let name = format!("worker-{i}");
        let worker = worker::Worker::new(
            name.clone(),
            db.clone(),
            queue.source(),
            queue.sender(),
            completion.clone(),
            metrics.clone(),
        );
        let join = thread::Builder::new()
            .name(name)
            .spawn(move || worker.run())?;
        threads.push(join);
    }

    info!("running tasks in {} threads...", threads_count);
    Ok(Runner { _threads: threads })
}
