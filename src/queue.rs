use crate::prelude::*;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::thread;

/// A task envelope, JSON-encoded on the wire. Answer tasks carry the
/// (experiment, row) slot to fill; observation tasks additionally pin the
/// result they score into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Task {
    Answer {
        experiment_id: i64,
        num_line: i64,
    },
    Observation {
        experiment_id: i64,
        result_id: i64,
        metric_name: String,
        num_line: i64,
    },
}

/// In-process message bus: producers push JSON envelopes into the sink, a
/// streamer thread forwards them in arrival order to the worker source, and
/// the workers pull from a shared receiver that load-balances between them.
///
/// Delivery is at-least-once with no acknowledgment and no persistence:
/// envelopes still in flight when the process exits are simply lost, and the
/// retry planner re-creates them from the counters once the API is back up.
pub struct TaskQueue {
    sender: TaskSender,
    source: TaskSource,
}

impl TaskQueue {
    pub fn bind(depth: usize) -> TaskQueue {
        let (sink_tx, sink_rx) = bounded::<String>(depth);
        let (source_tx, source_rx) = bounded::<String>(depth);

        thread::Builder::new()
            .name("streamer".into())
            .spawn(move || streamer(sink_rx, source_tx))
            .expect("failed to spawn the streamer thread");

        TaskQueue {
            sender: TaskSender { sink: sink_tx },
            source: TaskSource { source: source_rx },
        }
    }

    pub fn sender(&self) -> TaskSender {
        self.sender.clone()
    }

    pub fn source(&self) -> TaskSource {
        self.source.clone()
    }
}

fn streamer(sink: Receiver<String>, source: Sender<String>) {
    for message in sink.iter() {
        if source.send(message).is_err() {
            // All the workers hung up; nothing left to forward to.
            break;
        }
    }
    debug!("streamer shutting down");
}

#[derive(Clone)]
pub struct TaskSender {
    sink: Sender<String>,
}

impl TaskSender {
    /// Blocks when the sink is full; backpressure is the only flow control.
    pub fn push(&self, task: &Task) -> Fallible<()> {
        let message = serde_json::to_string(task)?;
        self.sink
            .send(message)
            .map_err(|_| anyhow!("task queue is closed"))?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct TaskSource {
    source: Receiver<String>,
}

impl TaskSource {
    /// Blocks until an envelope arrives. Returns None once the queue is
    /// closed and drained. A malformed envelope is dropped with a log line
    /// instead of wedging the worker.
    pub fn pull(&self) -> Option<Task> {
        loop {
            let message = self.source.recv().ok()?;
            match serde_json::from_str(&message) {
                Ok(task) => return Some(task),
                Err(err) => {
                    error!("dropping malformed task envelope {:?}: {}", message, err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Task, TaskQueue};

    #[test]
    fn test_round_trip_in_arrival_order() {
        let queue = TaskQueue::bind(16);
        let sender = queue.sender();
        let source = queue.source();

        for num_line in 0..4 {
            sender
                .push(&Task::Answer {
                    experiment_id: 1,
                    num_line,
                })
                .unwrap();
        }

        for num_line in 0..4 {
            assert_eq!(
                source.pull().unwrap(),
                Task::Answer {
                    experiment_id: 1,
                    num_line,
                }
            );
        }
    }

    #[test]
    fn test_wire_format() {
        let task = Task::Observation {
            experiment_id: 3,
            result_id: 7,
            metric_name: "judge_exactness".into(),
            num_line: 2,
        };
        let encoded = serde_json::to_value(&task).unwrap();
        assert_eq!(
            encoded,
            serde_json::json!({
                "kind": "observation",
                "experiment_id": 3,
                "result_id": 7,
                "metric_name": "judge_exactness",
                "num_line": 2,
            })
        );
    }

    #[test]
    fn test_load_balances_across_pullers() {
        let queue = TaskQueue::bind(64);
        let sender = queue.sender();

        let mut handles = Vec::new();
        for _ in 0..2 {
            let source = queue.source();
            handles.push(std::thread::spawn(move || {
                let mut pulled = 0;
                while source.pull().is_some() {
                    pulled += 1;
                }
                pulled
            }));
        }

        for num_line in 0..10 {
            sender
                .push(&Task::Answer {
                    experiment_id: 1,
                    num_line,
                })
                .unwrap();
        }
        drop(sender);
        drop(queue);

        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 10);
    }
}
