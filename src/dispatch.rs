//! The request dispatcher: the one path from a proxy call to the remote API.
//!
//! A call is captured as an [`OperationCall`] (name, positional arguments,
//! keyword arguments), wrapped with the caller's [`Route`] into a
//! [`RequestEnvelope`], and posted to the endpoint with the client's
//! credentials. The response envelope is decoded into a [`Reply`]:
//!
//! ```text
//! {"kind": "value",  "payload": <any>}
//! {"kind": "cursor", "payload": {"cursor_id": "..." | null, "batch": [...], "namespace": "..."}}
//! {"kind": "stream", "payload": {"stream_id": "...", "resume_token": {...}, "event": {...} | null, "alive": true}}
//! {"kind": "error",  "reason": "..."}
//! ```

use crate::codec::{BsonCodec, ValueCodec};
use crate::error::{ProxyError, Result};
use crate::transport::{OutboundRequest, Transport, TransportError};
use bson::{Bson, Document};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Positional arguments of a call.
pub type Args = Vec<Bson>;

/// Keyword arguments of a call, in the order they were given.
pub type Kwargs = Document;

/// Where the remote API is and how to authenticate against it.
#[derive(Clone)]
pub struct Endpoint {
    url: Url,
    access_key: Vec<u8>,
}

impl Endpoint {
    /// Create an endpoint configuration.
    pub fn new(url: Url, access_key: impl Into<Vec<u8>>) -> Self {
        Self {
            url,
            access_key: access_key.into(),
        }
    }

    /// The endpoint URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Whether requests go out without credentials.
    pub fn is_anonymous(&self) -> bool {
        self.access_key.is_empty()
    }

    /// The `Authorization` header value, or `None` for anonymous access.
    ///
    /// Derived from the key on every call.
    pub fn authorization(&self) -> Option<String> {
        if self.is_anonymous() {
            return None;
        }
        Some(format!("Basic :{}", base64::encode(&self.access_key)))
    }

    /// Headers attached to every request.
    pub fn headers(&self) -> Vec<(String, String)> {
        self.authorization()
            .map(|value| vec![("Authorization".to_string(), value)])
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("url", &self.url.as_str())
            .field("anonymous", &self.is_anonymous())
            .finish()
    }
}

/// Kind of proxy object a call was made on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    /// The client itself.
    Client,
    /// A database handle.
    Database,
    /// A collection handle.
    Collection,
    /// A command cursor.
    CommandCursor,
    /// A change stream.
    ChangeStream,
}

/// Routing context: which object the call was made on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Proxy kind.
    pub target: Target,
    /// Database name, below the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    /// Collection name, below the database.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    /// Continuation token held by a stateful handle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

impl Route {
    /// Route to a bare target.
    pub fn new(target: Target) -> Self {
        Self {
            target,
            database: None,
            collection: None,
            state: None,
        }
    }

    /// Set the database name.
    pub fn database(mut self, name: impl Into<String>) -> Self {
        self.database = Some(name.into());
        self
    }

    /// Set the collection name.
    pub fn collection(mut self, name: impl Into<String>) -> Self {
        self.collection = Some(name.into());
        self
    }

    /// Re-target this route at a stateful handle holding `state`.
    pub fn stateful(&self, target: Target, state: impl Into<String>) -> Self {
        Self {
            target,
            database: self.database.clone(),
            collection: self.collection.clone(),
            state: Some(state.into()),
        }
    }
}

/// A captured call, built per invocation and dropped after dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationCall {
    /// Operation name.
    pub name: String,
    /// Positional arguments in call order.
    pub args: Args,
    /// Keyword arguments in call order.
    pub kwargs: Kwargs,
}

impl OperationCall {
    /// A call without arguments.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Args::new(),
            kwargs: Kwargs::new(),
        }
    }

    /// A call with the given arguments.
    pub fn with_args(name: impl Into<String>, args: Args, kwargs: Kwargs) -> Self {
        Self {
            name: name.into(),
            args,
            kwargs,
        }
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Bson>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Set a keyword argument.
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }
}

/// The JSON body posted to the endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Operation name.
    pub operation: String,
    /// Positional arguments.
    pub args: Vec<JsonValue>,
    /// Keyword arguments.
    pub kwargs: serde_json::Map<String, JsonValue>,
    /// Routing context.
    pub context: Route,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum ResponseEnvelope {
    Value {
        #[serde(default)]
        payload: JsonValue,
    },
    Cursor {
        payload: CursorPayload,
    },
    Stream {
        payload: StreamPayload,
    },
    Error {
        reason: String,
    },
}

#[derive(Debug, Deserialize)]
struct CursorPayload {
    #[serde(default)]
    cursor_id: Option<String>,
    #[serde(default)]
    batch: Vec<JsonValue>,
    #[serde(default)]
    namespace: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamPayload {
    #[serde(default)]
    stream_id: Option<String>,
    #[serde(default)]
    resume_token: Option<JsonValue>,
    #[serde(default)]
    event: Option<JsonValue>,
    #[serde(default = "default_alive")]
    alive: bool,
}

fn default_alive() -> bool {
    true
}

/// Seed state for a command cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorSeed {
    /// Continuation token; `None` when the remote cursor is already exhausted.
    pub cursor_id: Option<String>,
    /// Documents delivered with this response.
    pub batch: Vec<Document>,
    /// Namespace the cursor iterates, if reported.
    pub namespace: Option<String>,
}

/// Seed state for, or one step of, a change stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSeed {
    /// Subscription token.
    pub stream_id: Option<String>,
    /// Token to resume after the latest delivered event.
    pub resume_token: Option<Document>,
    /// An event delivered with this response.
    pub event: Option<Document>,
    /// `false` once the remote side has ended the subscription.
    pub alive: bool,
}

/// A decoded response.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// A terminal value.
    Value(Bson),
    /// The operation produced a result set.
    Cursor(CursorSeed),
    /// The operation produced a change subscription.
    Stream(StreamSeed),
}

impl Reply {
    fn kind(&self) -> &'static str {
        match self {
            Reply::Value(_) => "value",
            Reply::Cursor(_) => "cursor",
            Reply::Stream(_) => "stream",
        }
    }

    /// Expect a terminal value.
    pub fn into_value(self, operation: &str) -> Result<Bson> {
        match self {
            Reply::Value(value) => Ok(value),
            other => Err(unexpected_reply(operation, "value", &other)),
        }
    }

    /// Expect a result set.
    pub fn into_cursor(self, operation: &str) -> Result<CursorSeed> {
        match self {
            Reply::Cursor(seed) => Ok(seed),
            other => Err(unexpected_reply(operation, "cursor", &other)),
        }
    }

    /// Expect a change subscription.
    pub fn into_stream(self, operation: &str) -> Result<StreamSeed> {
        match self {
            Reply::Stream(seed) => Ok(seed),
            other => Err(unexpected_reply(operation, "stream", &other)),
        }
    }
}

fn unexpected_reply(operation: &str, expected: &str, reply: &Reply) -> ProxyError {
    ProxyError::protocol(
        operation,
        format!("expected a {} reply, got {}", expected, reply.kind()),
    )
}

/// Default bound on a single change stream fetch.
pub const DEFAULT_CHANGE_STREAM_TIMEOUT: Duration = Duration::from_secs(30);

struct DispatchInner {
    endpoint: Endpoint,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn ValueCodec>,
    change_stream_timeout: Duration,
    closed: AtomicBool,
}

/// Sends captured calls to the endpoint.
///
/// Cheap to clone; every handle derived from one client shares the same
/// dispatcher and therefore the same closed flag.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatchInner>,
}

impl Dispatcher {
    /// Create a dispatcher using the default BSON codec and fetch timeout.
    pub fn new(endpoint: Endpoint, transport: Arc<dyn Transport>) -> Self {
        Self::with_settings(
            endpoint,
            transport,
            Arc::new(BsonCodec),
            DEFAULT_CHANGE_STREAM_TIMEOUT,
        )
    }

    /// Create a dispatcher with a custom value codec and change stream
    /// fetch timeout.
    pub fn with_settings(
        endpoint: Endpoint,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn ValueCodec>,
        change_stream_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(DispatchInner {
                endpoint,
                transport,
                codec,
                change_stream_timeout,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The endpoint configuration.
    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// The value codec.
    pub fn codec(&self) -> &dyn ValueCodec {
        self.inner.codec.as_ref()
    }

    /// Upper bound on one change stream fetch.
    pub fn change_stream_timeout(&self) -> Duration {
        self.inner.change_stream_timeout
    }

    /// Refuse all further dispatches. Returns `false` if already closed.
    pub fn close(&self) -> bool {
        !self.inner.closed.swap(true, Ordering::SeqCst)
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Whether two dispatchers belong to the same client.
    pub fn same_client(&self, other: &Dispatcher) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Encode a call into its wire envelope.
    pub fn envelope(&self, call: &OperationCall, route: &Route) -> Result<RequestEnvelope> {
        let codec = self.codec();
        let encode = |value: &Bson| {
            codec
                .to_wire(value)
                .map_err(|e| ProxyError::usage(&call.name, format!("argument cannot be sent: {}", e)))
        };
        let args = call.args.iter().map(encode).collect::<Result<Vec<_>>>()?;
        let mut kwargs = serde_json::Map::new();
        for (name, value) in &call.kwargs {
            kwargs.insert(name.clone(), encode(value)?);
        }
        Ok(RequestEnvelope {
            operation: call.name.clone(),
            args,
            kwargs,
            context: route.clone(),
        })
    }

    /// Send a call and decode its response.
    pub async fn dispatch(&self, call: OperationCall, route: Route) -> Result<Reply> {
        if self.is_closed() {
            return Err(ProxyError::usage(
                &call.name,
                "the client has been closed; create a new Client to keep issuing operations",
            ));
        }

        let body = self.envelope(&call, &route)?;
        let request = OutboundRequest {
            url: self.inner.endpoint.url().clone(),
            headers: self.inner.endpoint.headers(),
            body,
        };

        tracing::debug!(
            operation = %call.name,
            target = ?route.target,
            database = route.database.as_deref(),
            collection = route.collection.as_deref(),
            "dispatching request"
        );

        let response = self.inner.transport.send(request).await.map_err(|e| {
            tracing::warn!(operation = %call.name, error = %e, "transport failed");
            match e {
                TransportError::Unreachable(reason) => ProxyError::connectivity(&call.name, reason),
                TransportError::Undecodable(reason) => ProxyError::protocol(&call.name, reason),
            }
        })?;

        self.decode(&call.name, response)
    }

    /// Like [`dispatch`](Self::dispatch), but give up after `timeout`.
    pub async fn dispatch_with_timeout(
        &self,
        call: OperationCall,
        route: Route,
        timeout: Duration,
    ) -> Result<Reply> {
        let operation = call.name.clone();
        match tokio::time::timeout(timeout, self.dispatch(call, route)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(%operation, ?timeout, "dispatch timed out");
                Err(ProxyError::timeout(operation))
            }
        }
    }

    fn decode(&self, operation: &str, response: JsonValue) -> Result<Reply> {
        let envelope: ResponseEnvelope = serde_json::from_value(response)
            .map_err(|e| ProxyError::protocol(operation, e.to_string()))?;
        let codec = self.codec();
        let undecodable = |e: ProxyError| ProxyError::protocol(operation, e.to_string());
        let document = |value: &JsonValue| codec.document_from_wire(value).map_err(undecodable);

        match envelope {
            ResponseEnvelope::Value { payload } => {
                Ok(Reply::Value(codec.from_wire(&payload).map_err(undecodable)?))
            }
            ResponseEnvelope::Cursor { payload } => {
                let batch = payload
                    .batch
                    .iter()
                    .map(document)
                    .collect::<Result<_>>()?;
                Ok(Reply::Cursor(CursorSeed {
                    cursor_id: payload.cursor_id,
                    batch,
                    namespace: payload.namespace,
                }))
            }
            ResponseEnvelope::Stream { payload } => Ok(Reply::Stream(StreamSeed {
                stream_id: payload.stream_id,
                resume_token: payload
                    .resume_token
                    .as_ref()
                    .filter(|token| !token.is_null())
                    .map(document)
                    .transpose()?,
                event: payload
                    .event
                    .as_ref()
                    .filter(|event| !event.is_null())
                    .map(document)
                    .transpose()?,
                alive: payload.alive,
            })),
            ResponseEnvelope::Error { reason } => {
                tracing::warn!(%operation, %reason, "remote rejected operation");
                Err(ProxyError::operation(operation, reason))
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("endpoint", &self.inner.endpoint)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use bson::doc;
    use pretty_assertions::assert_eq;

    fn dispatcher(transport: Arc<MockTransport>, key: &[u8]) -> Dispatcher {
        let url = Url::parse("https://api.example").unwrap();
        Dispatcher::new(Endpoint::new(url, key.to_vec()), transport)
    }

    #[test]
    fn test_authorization_header() {
        let endpoint = Endpoint::new(Url::parse("https://api.example").unwrap(), b"secret".to_vec());
        assert_eq!(
            endpoint.authorization(),
            Some(format!("Basic :{}", base64::encode(b"secret")))
        );
        assert_eq!(endpoint.authorization().unwrap(), "Basic :c2VjcmV0");
    }

    #[test]
    fn test_anonymous_endpoint_sends_no_header() {
        let endpoint = Endpoint::new(Url::parse("https://api.example").unwrap(), Vec::new());
        assert!(endpoint.is_anonymous());
        assert!(endpoint.headers().is_empty());
    }

    #[test]
    fn test_endpoint_debug_hides_key() {
        let endpoint = Endpoint::new(Url::parse("https://api.example").unwrap(), b"secret".to_vec());
        assert!(!format!("{:?}", endpoint).contains("secret"));
    }

    #[test]
    fn test_route_serialization_skips_empty_fields() {
        let route = Route::new(Target::Database).database("app");
        let json = serde_json::to_value(&route).unwrap();
        assert_eq!(json, serde_json::json!({ "target": "database", "database": "app" }));
    }

    #[test]
    fn test_envelope_preserves_argument_order() {
        let dispatcher = dispatcher(MockTransport::new(), b"key");
        let call = OperationCall::new("count_documents")
            .arg(doc! { "a": 1 })
            .kwarg("limit", 5)
            .kwarg("comment", "x");
        let route = Route::new(Target::Collection).database("db").collection("c");
        let envelope = dispatcher.envelope(&call, &route).unwrap();

        assert_eq!(envelope.operation, "count_documents");
        assert_eq!(envelope.args, vec![serde_json::json!({ "a": 1 })]);
        let keys: Vec<_> = envelope.kwargs.keys().cloned().collect();
        assert_eq!(keys, vec!["limit".to_string(), "comment".to_string()]);
        assert_eq!(envelope.context, route);
    }

    #[tokio::test]
    async fn test_dispatch_value() {
        let transport = MockTransport::new();
        transport.respond("server_info", serde_json::json!({ "kind": "value", "payload": { "version": "7.0" } }));
        let dispatcher = dispatcher(transport.clone(), b"secret");

        let reply = dispatcher
            .dispatch(OperationCall::new("server_info"), Route::new(Target::Client))
            .await
            .unwrap();
        assert_eq!(reply, Reply::Value(Bson::Document(doc! { "version": "7.0" })));

        let sent = transport.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].header("Authorization"), Some("Basic :c2VjcmV0"));
        assert_eq!(sent[0].url.as_str(), "https://api.example/");
    }

    #[tokio::test]
    async fn test_dispatch_cursor_seed() {
        let transport = MockTransport::new();
        transport.respond(
            "list_databases",
            serde_json::json!({
                "kind": "cursor",
                "payload": { "cursor_id": "c1", "batch": [{ "name": "admin" }] }
            }),
        );
        let dispatcher = dispatcher(transport, b"k");

        let seed = dispatcher
            .dispatch(OperationCall::new("list_databases"), Route::new(Target::Client))
            .await
            .unwrap()
            .into_cursor("list_databases")
            .unwrap();
        assert_eq!(seed.cursor_id.as_deref(), Some("c1"));
        assert_eq!(seed.batch, vec![doc! { "name": "admin" }]);
    }

    #[tokio::test]
    async fn test_dispatch_stream_seed() {
        let transport = MockTransport::new();
        transport.respond(
            "watch",
            serde_json::json!({ "kind": "stream", "payload": { "stream_id": "s1" } }),
        );
        let dispatcher = dispatcher(transport, b"k");

        let seed = dispatcher
            .dispatch(OperationCall::new("watch"), Route::new(Target::Client))
            .await
            .unwrap()
            .into_stream("watch")
            .unwrap();
        assert_eq!(seed.stream_id.as_deref(), Some("s1"));
        assert!(seed.alive);
        assert!(seed.event.is_none());
    }

    #[tokio::test]
    async fn test_remote_error_is_operation_error() {
        let transport = MockTransport::new();
        transport.respond("drop_database", serde_json::json!({ "kind": "error", "reason": "forbidden" }));
        let dispatcher = dispatcher(transport, b"k");

        let err = dispatcher
            .dispatch(OperationCall::new("drop_database").arg("app"), Route::new(Target::Client))
            .await
            .unwrap_err();
        assert!(err.is_operation_error());
        assert_eq!(err.to_string(), "operation `drop_database` failed: forbidden");
    }

    #[tokio::test]
    async fn test_malformed_response_is_protocol_error() {
        let transport = MockTransport::new();
        transport.respond("server_info", serde_json::json!({ "status": "ok" }));
        let dispatcher = dispatcher(transport, b"k");

        let err = dispatcher
            .dispatch(OperationCall::new("server_info"), Route::new(Target::Client))
            .await
            .unwrap_err();
        assert!(err.is_protocol_error());
        assert_eq!(err.operation_name(), Some("server_info"));
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_protocol_error() {
        let transport = MockTransport::new();
        transport.respond("server_info", serde_json::json!({ "kind": "value", "payload": { "$oid": "nope" } }));
        transport.respond(
            "list_databases",
            serde_json::json!({ "kind": "cursor", "payload": { "cursor_id": null, "batch": [42] } }),
        );
        let dispatcher = dispatcher(transport, b"k");

        let err = dispatcher
            .dispatch(OperationCall::new("server_info"), Route::new(Target::Client))
            .await
            .unwrap_err();
        assert!(err.is_protocol_error());
        assert_eq!(err.operation_name(), Some("server_info"));

        let err = dispatcher
            .dispatch(OperationCall::new("list_databases"), Route::new(Target::Client))
            .await
            .unwrap_err();
        assert!(err.is_protocol_error());
        assert_eq!(err.operation_name(), Some("list_databases"));
    }

    #[tokio::test]
    async fn test_unsendable_argument_is_usage_error() {
        let transport = MockTransport::new();
        let dispatcher = dispatcher(transport.clone(), b"k");

        let err = dispatcher
            .dispatch(
                OperationCall::new("count_documents").arg(doc! { "x": f64::NAN }),
                Route::new(Target::Collection).database("db").collection("c"),
            )
            .await
            .unwrap_err();
        assert!(err.is_usage_error());
        assert_eq!(err.operation_name(), Some("count_documents"));
        assert!(err.to_string().contains("non-finite double"));
        assert!(transport.requests().is_empty());

        let err = dispatcher
            .dispatch(
                OperationCall::new("find").kwarg("max_time_ms", f64::INFINITY),
                Route::new(Target::Collection).database("db").collection("c"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Usage);
        assert_eq!(err.operation_name(), Some("find"));
    }

    #[tokio::test]
    async fn test_transport_failure_is_connectivity_error() {
        let transport = MockTransport::new();
        transport.fail("server_info", TransportError::Unreachable("connection reset".into()));
        let dispatcher = dispatcher(transport.clone(), b"k");

        let err = dispatcher
            .dispatch(OperationCall::new("server_info"), Route::new(Target::Client))
            .await
            .unwrap_err();
        assert!(err.is_connectivity_error());
        // no retry
        assert_eq!(transport.calls("server_info"), 1);
    }

    #[tokio::test]
    async fn test_closed_dispatcher_refuses_locally() {
        let transport = MockTransport::new();
        let dispatcher = dispatcher(transport.clone(), b"k");
        assert!(dispatcher.close());
        assert!(!dispatcher.close());

        let err = dispatcher
            .dispatch(OperationCall::new("server_info"), Route::new(Target::Client))
            .await
            .unwrap_err();
        assert!(err.is_usage_error());
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_reply_kind_mismatch() {
        let err = Reply::Value(Bson::Null).into_cursor("find").unwrap_err();
        assert!(err.is_protocol_error());
        assert!(err.to_string().contains("expected a cursor reply, got value"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_with_timeout() {
        let transport = MockTransport::new();
        transport.hang("try_next");
        let dispatcher = dispatcher(transport, b"k");

        let err = dispatcher
            .dispatch_with_timeout(
                OperationCall::new("try_next"),
                Route::new(Target::ChangeStream),
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }
}
