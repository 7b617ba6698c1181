//! Per-task stage queues and the pipeline stop signal.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::core::errors::{ConveyorError, Result};

/// Message on a task's request queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StageMessage {
    /// Seed token for stage 1, once per cycle
    Proceed,
    /// Collected publications of the previous stage, in arrival order
    Payload(Vec<Value>),
    /// Shutdown sentinel
    Close,
}

/// Message on a task's publish queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Publication {
    Value(Value),
    Close,
}

/// Global stop flag shared by the sequencer and every harness
#[derive(Debug, Clone)]
pub struct StopSignal(Arc<watch::Sender<bool>>);

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        StopSignal(Arc::new(tx))
    }

    pub fn set(&self) {
        self.0.send_replace(true);
    }

    pub fn is_set(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once the signal is set
    pub async fn wait(&self) {
        let mut rx = self.0.subscribe();
        // The sender lives in `self`, so the channel cannot close here
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// Destination for publications of a task running in a worker process
pub trait PublishSink: Send + Sync {
    fn publish(&self, message: Publication) -> Result<()>;
}

enum RequestSource {
    Bounded(mpsc::Receiver<StageMessage>),
    Forwarded(mpsc::UnboundedReceiver<StageMessage>),
}

enum Publisher {
    Bounded(mpsc::Sender<Publication>),
    Forwarded(Arc<dyn PublishSink>),
}

/// Parent-side queue ends handed to the backend that runs a staged task
pub struct StageEndpoints {
    pub requests: mpsc::Receiver<StageMessage>,
    pub publish: mpsc::Sender<Publication>,
    pub stop: StopSignal,
}

/// Queue view of a staged task, reachable through `TaskContext::channels`.
///
/// All methods block the calling thread; task functions always run on
/// blocking threads.
pub struct StageChannels {
    requests: Mutex<RequestSource>,
    publisher: Publisher,
    stop: StopSignal,
}

impl StageChannels {
    /// Channels backed directly by the coordinator's queues
    pub fn local(endpoints: StageEndpoints) -> Self {
        Self {
            requests: Mutex::new(RequestSource::Bounded(endpoints.requests)),
            publisher: Publisher::Bounded(endpoints.publish),
            stop: endpoints.stop,
        }
    }

    /// Channels of a task running inside a worker process. Requests arrive
    /// as `Deliver` frames, publications leave through `sink`.
    pub fn forwarded(
        requests: mpsc::UnboundedReceiver<StageMessage>,
        sink: Arc<dyn PublishSink>,
        stop: StopSignal,
    ) -> Self {
        Self {
            requests: Mutex::new(RequestSource::Forwarded(requests)),
            publisher: Publisher::Forwarded(sink),
            stop,
        }
    }

    /// Next request. `None` once every sender is gone.
    pub fn recv(&self) -> Option<StageMessage> {
        let mut source = self.requests.lock();
        match &mut *source {
            RequestSource::Bounded(rx) => rx.blocking_recv(),
            RequestSource::Forwarded(rx) => rx.blocking_recv(),
        }
    }

    /// Non-blocking receive
    pub fn try_recv(&self) -> Option<StageMessage> {
        let mut source = self.requests.lock();
        match &mut *source {
            RequestSource::Bounded(rx) => rx.try_recv().ok(),
            RequestSource::Forwarded(rx) => rx.try_recv().ok(),
        }
    }

    /// Publish one value for the current cycle, waiting for queue space
    pub fn publish(&self, value: Value) -> Result<()> {
        self.send(Publication::Value(value))
    }

    pub(crate) fn send(&self, message: Publication) -> Result<()> {
        match &self.publisher {
            Publisher::Bounded(tx) => tx.blocking_send(message).map_err(|_| {
                ConveyorError::channel("publish", "publish queue closed")
            }),
            Publisher::Forwarded(sink) => sink.publish(message),
        }
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_set()
    }
}

/// Create the request/publish queue pair of one staged task
pub fn stage_queues(
    capacity: usize,
) -> (
    (mpsc::Sender<StageMessage>, mpsc::Receiver<StageMessage>),
    (mpsc::Sender<Publication>, mpsc::Receiver<Publication>),
) {
    (mpsc::channel(capacity), mpsc::channel(capacity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_stop_signal_wakes_waiters() {
        let stop = StopSignal::new();
        let waiter = {
            let stop = stop.clone();
            tokio::spawn(async move { stop.wait().await })
        };
        assert!(!stop.is_set());
        stop.set();
        waiter.await.unwrap();
        assert!(stop.is_set());
    }

    #[tokio::test]
    async fn test_local_channels_round_trip_on_blocking_thread() {
        let ((req_tx, req_rx), (pub_tx, mut pub_rx)) = stage_queues(4);
        let channels = StageChannels::local(StageEndpoints {
            requests: req_rx,
            publish: pub_tx,
            stop: StopSignal::new(),
        });

        req_tx.send(StageMessage::Payload(vec![json!(1)])).await.unwrap();
        let worker = tokio::task::spawn_blocking(move || {
            let message = channels.recv();
            channels.publish(json!("seen")).unwrap();
            message
        });

        assert_eq!(
            worker.await.unwrap(),
            Some(StageMessage::Payload(vec![json!(1)]))
        );
        assert_eq!(pub_rx.recv().await, Some(Publication::Value(json!("seen"))));
    }

    #[test]
    fn test_message_wire_shape() {
        let encoded = serde_json::to_value(StageMessage::Payload(vec![json!(5)])).unwrap();
        assert_eq!(encoded, json!({"type": "payload", "data": [5]}));
        let proceed: StageMessage = serde_json::from_value(json!({"type": "proceed"})).unwrap();
        assert_eq!(proceed, StageMessage::Proceed);
    }
}
