//! Scripted transport for unit tests.

use crate::transport::{OutboundRequest, Transport, TransportError};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

enum Scripted {
    Respond(JsonValue),
    Fail(TransportError),
    Hang,
}

/// Answers each operation from a per-operation queue and records every request.
/// Unscripted operations get `{"kind": "value", "payload": null}`.
#[derive(Default)]
pub(crate) struct MockTransport {
    script: Mutex<HashMap<String, VecDeque<Scripted>>>,
    requests: Mutex<Vec<OutboundRequest>>,
}

impl MockTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, operation: &str, scripted: Scripted) {
        self.script
            .lock()
            .unwrap()
            .entry(operation.to_string())
            .or_default()
            .push_back(scripted);
    }

    pub(crate) fn respond(&self, operation: &str, body: JsonValue) {
        self.push(operation, Scripted::Respond(body));
    }

    pub(crate) fn fail(&self, operation: &str, error: TransportError) {
        self.push(operation, Scripted::Fail(error));
    }

    pub(crate) fn hang(&self, operation: &str) {
        self.push(operation, Scripted::Hang);
    }

    pub(crate) fn requests(&self) -> Vec<OutboundRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn calls(&self, operation: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|request| request.body.operation == operation)
            .count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: OutboundRequest) -> Result<JsonValue, TransportError> {
        let operation = request.body.operation.clone();
        self.requests.lock().unwrap().push(request);

        let next = self
            .script
            .lock()
            .unwrap()
            .get_mut(&operation)
            .and_then(|queue| queue.pop_front());

        match next {
            Some(Scripted::Respond(body)) => Ok(body),
            Some(Scripted::Fail(error)) => Err(error),
            Some(Scripted::Hang) => std::future::pending().await,
            None => Ok(serde_json::json!({ "kind": "value", "payload": null })),
        }
    }
}
