//! Command cursor over a remotely held result set.

use crate::dispatch::{Args, CursorSeed, Dispatcher, Kwargs, OperationCall, Route, Target};
use crate::error::{ProxyError, Result};
use crate::proxy::{self, Outcome, Proxy, ProxyFactory, ProxyType, Resolved};
use crate::shape::COMMAND_CURSOR;
use async_trait::async_trait;
use bson::{Bson, Document};
use futures::Stream;
use std::collections::VecDeque;
use std::sync::OnceLock;

/// Lifecycle of a command cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// Holds a continuation token; more batches may follow.
    Open,
    /// A `get_more` round trip is in flight, or was interrupted.
    Advancing,
    /// The remote side reported no more results.
    Exhausted,
    /// A `get_more` round trip failed.
    Errored,
    /// Closed by the caller.
    Closed,
}

impl CursorState {
    /// Whether no further batches can be fetched.
    pub fn is_terminal(self) -> bool {
        matches!(self, CursorState::Exhausted | CursorState::Errored | CursorState::Closed)
    }
}

fn proxy_type() -> &'static ProxyType {
    static TYPE: OnceLock<ProxyType> = OnceLock::new();
    TYPE.get_or_init(|| {
        ProxyFactory::new(&COMMAND_CURSOR)
            .override_operation("address")
            .override_operation("alive")
            .override_operation("batch_size")
            .override_operation("close")
            .override_operation("cursor_id")
            .override_operation("next")
            .override_operation("session")
            .override_operation("try_next")
            .build()
    })
}

/// A paged result set produced by a listing or query operation.
///
/// The first batch arrives with the response that created the cursor; each
/// [`advance`](CommandCursor::advance) fetches exactly one more batch with the
/// current continuation token. Cursors are not restartable: once exhausted,
/// re-issue the original operation.
///
/// Advancing methods take `&mut self`, so one cursor has exactly one driver.
///
/// # Example
///
/// ```ignore
/// let mut cursor = client.list_databases(None).await?;
/// while let Some(db) = cursor.try_next().await? {
///     println!("{}", db.get_str("name")?);
/// }
/// ```
pub struct CommandCursor {
    dispatcher: Dispatcher,
    /// Route of the object that created the cursor.
    origin: Route,
    cursor_id: Option<String>,
    namespace: Option<String>,
    buffer: VecDeque<Document>,
    batch_size: Option<u32>,
    state: CursorState,
}

impl CommandCursor {
    /// Create a cursor from the seed returned by the remote side.
    pub(crate) fn new(dispatcher: Dispatcher, origin: &Route, seed: CursorSeed) -> Self {
        let state = if seed.cursor_id.is_some() {
            CursorState::Open
        } else {
            CursorState::Exhausted
        };
        Self {
            dispatcher,
            origin: origin.clone(),
            cursor_id: seed.cursor_id,
            namespace: seed.namespace,
            buffer: seed.batch.into(),
            batch_size: None,
            state,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CursorState {
        self.state
    }

    /// Whether the cursor may still return documents.
    pub fn is_alive(&self) -> bool {
        !self.buffer.is_empty() || !self.state.is_terminal()
    }

    /// Whether the cursor has nothing left to return.
    pub fn is_exhausted(&self) -> bool {
        self.buffer.is_empty() && self.state.is_terminal()
    }

    /// The continuation token, while the remote cursor is live.
    pub fn cursor_id(&self) -> Option<&str> {
        self.cursor_id.as_deref()
    }

    /// Namespace reported by the remote side.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Number of documents buffered locally.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Limit the number of documents fetched per batch.
    pub fn batch_size(&mut self, batch_size: u32) -> &mut Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Always `None`: the cursor lives behind an HTTP API.
    pub fn address(&self) -> Option<crate::client::ServerAddress> {
        None
    }

    /// Fetch the next batch.
    ///
    /// Issues exactly one request while the cursor is open and returns whether
    /// any documents were added. In a terminal state nothing is sent and the
    /// result is `false`.
    pub async fn advance(&mut self) -> Result<bool> {
        if self.state.is_terminal() {
            return Ok(false);
        }
        let Some(cursor_id) = self.cursor_id.clone() else {
            self.state = CursorState::Exhausted;
            return Ok(false);
        };

        self.state = CursorState::Advancing;
        let mut call = OperationCall::new("get_more");
        if let Some(batch_size) = self.batch_size {
            call = call.kwarg("batch_size", i64::from(batch_size));
        }
        let route = self.origin.stateful(Target::CommandCursor, cursor_id);

        let seed = match self
            .dispatcher
            .dispatch(call, route)
            .await
            .and_then(|reply| reply.into_cursor("get_more"))
        {
            Ok(seed) => seed,
            Err(e) => {
                self.state = CursorState::Errored;
                return Err(e);
            }
        };

        let received = !seed.batch.is_empty();
        self.buffer.extend(seed.batch);
        self.cursor_id = seed.cursor_id;
        self.state = if self.cursor_id.is_some() {
            CursorState::Open
        } else {
            CursorState::Exhausted
        };
        tracing::trace!(state = ?self.state, buffered = self.buffer.len(), "cursor advanced");
        Ok(received)
    }

    /// Return the next document, fetching batches as needed.
    pub async fn try_next(&mut self) -> Result<Option<Document>> {
        loop {
            if let Some(doc) = self.buffer.pop_front() {
                return Ok(Some(doc));
            }
            if self.state.is_terminal() {
                return Ok(None);
            }
            self.advance().await?;
        }
    }

    /// Collect all remaining documents.
    pub async fn collect(mut self) -> Result<Vec<Document>> {
        let mut results = Vec::new();
        while let Some(doc) = self.try_next().await? {
            results.push(doc);
        }
        Ok(results)
    }

    /// Turn the cursor into a lazy, finite stream of documents.
    pub fn into_stream(self) -> impl Stream<Item = Result<Document>> + Send {
        futures::stream::try_unfold(self, |mut cursor| async move {
            Ok(cursor.try_next().await?.map(|doc| (doc, cursor)))
        })
    }

    /// Close the cursor.
    ///
    /// Releases the remote cursor with one `close` request if it is still
    /// live. Calling it again does nothing.
    pub async fn close(&mut self) -> Result<()> {
        self.buffer.clear();
        let live = matches!(self.state, CursorState::Open | CursorState::Advancing);
        self.state = CursorState::Closed;
        match self.cursor_id.take() {
            Some(cursor_id) if live => {
                let route = self.origin.stateful(Target::CommandCursor, cursor_id);
                self.dispatcher
                    .dispatch(OperationCall::new("close"), route)
                    .await?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Call any `CommandCursor` operation by name.
    pub async fn invoke(&mut self, operation: &str, args: Args, kwargs: Kwargs) -> Result<Outcome> {
        match proxy::resolve(&*self, operation, &args, &kwargs)? {
            Resolved::Generated => self.forward_outcome(operation, args, kwargs).await,
            Resolved::Overridden => {
                let value = match operation {
                    "alive" => Bson::Boolean(self.is_alive()),
                    "cursor_id" => self.cursor_id.clone().map(Bson::String).unwrap_or(Bson::Null),
                    "address" | "session" => Bson::Null,
                    "next" | "try_next" => self.try_next().await?.map(Bson::Document).unwrap_or(Bson::Null),
                    "close" => {
                        self.close().await?;
                        Bson::Null
                    }
                    "batch_size" => {
                        let size = args
                            .first()
                            .or_else(|| kwargs.get("batch_size"))
                            .and_then(|v| v.as_i64().or_else(|| v.as_i32().map(i64::from)))
                            .and_then(|v| u32::try_from(v).ok())
                            .ok_or_else(|| {
                                ProxyError::usage(operation, "batch_size must be a non-negative integer")
                            })?;
                        self.batch_size(size);
                        Bson::Null
                    }
                    other => {
                        return Err(ProxyError::usage(
                            other,
                            format!("CommandCursor has no operation `{}`", other),
                        ))
                    }
                };
                Ok(Outcome::Value(value))
            }
        }
    }
}

#[async_trait]
impl Proxy for CommandCursor {
    fn proxy_type(&self) -> &'static ProxyType {
        proxy_type()
    }

    fn route(&self) -> Route {
        match &self.cursor_id {
            Some(cursor_id) => self.origin.stateful(Target::CommandCursor, cursor_id.clone()),
            None => Route {
                target: Target::CommandCursor,
                ..self.origin.clone()
            },
        }
    }

    fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

impl std::fmt::Debug for CommandCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandCursor")
            .field("cursor_id", &self.cursor_id)
            .field("state", &self.state)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Endpoint;
    use crate::testing::MockTransport;
    use bson::doc;
    use futures::TryStreamExt;
    use std::sync::Arc;
    use url::Url;

    fn cursor(transport: Arc<MockTransport>, cursor_id: Option<&str>, batch: Vec<Document>) -> CommandCursor {
        let endpoint = Endpoint::new(Url::parse("https://api.example").unwrap(), b"k".to_vec());
        let dispatcher = Dispatcher::new(endpoint, transport);
        let seed = CursorSeed {
            cursor_id: cursor_id.map(str::to_string),
            batch,
            namespace: Some("app.docs".to_string()),
        };
        CommandCursor::new(dispatcher, &Route::new(Target::Database).database("app"), seed)
    }

    fn batch(cursor_id: Option<&str>, names: &[&str]) -> serde_json::Value {
        let docs: Vec<_> = names.iter().map(|n| serde_json::json!({ "name": n })).collect();
        serde_json::json!({ "kind": "cursor", "payload": { "cursor_id": cursor_id, "batch": docs } })
    }

    #[tokio::test]
    async fn test_seed_without_token_is_exhausted() {
        let transport = MockTransport::new();
        let mut cursor = cursor(transport.clone(), None, vec![doc! { "name": "a" }]);
        assert_eq!(cursor.state(), CursorState::Exhausted);
        assert!(cursor.is_alive());
        assert!(!cursor.is_exhausted());

        assert_eq!(cursor.try_next().await.unwrap(), Some(doc! { "name": "a" }));
        assert_eq!(cursor.try_next().await.unwrap(), None);
        assert!(cursor.is_exhausted());
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_advance_uses_current_token() {
        let transport = MockTransport::new();
        transport.respond("get_more", batch(Some("t2"), &["b"]));
        transport.respond("get_more", batch(None, &["c"]));
        let mut cursor = cursor(transport.clone(), Some("t1"), vec![]);

        assert!(cursor.advance().await.unwrap());
        assert_eq!(cursor.cursor_id(), Some("t2"));
        assert_eq!(cursor.state(), CursorState::Open);
        assert!(cursor.advance().await.unwrap());
        assert_eq!(cursor.state(), CursorState::Exhausted);
        assert!(!cursor.advance().await.unwrap());

        let tokens: Vec<_> = transport
            .requests()
            .iter()
            .map(|r| r.body.context.state.clone())
            .collect();
        assert_eq!(tokens, vec![Some("t1".to_string()), Some("t2".to_string())]);
        assert_eq!(transport.requests()[0].body.context.target, Target::CommandCursor);
        assert_eq!(transport.requests()[0].body.context.database.as_deref(), Some("app"));
    }

    #[tokio::test]
    async fn test_collect_across_batches() {
        let transport = MockTransport::new();
        transport.respond("get_more", batch(Some("t2"), &["b", "c"]));
        transport.respond("get_more", batch(None, &[]));
        let cursor = cursor(transport.clone(), Some("t1"), vec![doc! { "name": "a" }]);

        let names: Vec<_> = cursor
            .collect()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.get_str("name").unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(transport.calls("get_more"), 2);
    }

    #[tokio::test]
    async fn test_into_stream() {
        let transport = MockTransport::new();
        transport.respond("get_more", batch(None, &["b"]));
        let cursor = cursor(transport, Some("t1"), vec![doc! { "name": "a" }]);

        let docs: Vec<Document> = cursor.into_stream().try_collect().await.unwrap();
        assert_eq!(docs.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_advance_is_errored() {
        let transport = MockTransport::new();
        transport.respond(
            "get_more",
            serde_json::json!({ "kind": "error", "reason": "cursor not found" }),
        );
        let mut cursor = cursor(transport.clone(), Some("t1"), vec![]);

        let err = cursor.advance().await.unwrap_err();
        assert!(err.is_operation_error());
        assert_eq!(cursor.state(), CursorState::Errored);
        assert!(!cursor.advance().await.unwrap());
        assert_eq!(transport.calls("get_more"), 1);
    }

    #[tokio::test]
    async fn test_close_releases_remote_cursor_once() {
        let transport = MockTransport::new();
        let mut cursor = cursor(transport.clone(), Some("t1"), vec![doc! { "name": "a" }]);

        cursor.close().await.unwrap();
        cursor.close().await.unwrap();
        assert_eq!(cursor.state(), CursorState::Closed);
        assert!(cursor.is_exhausted());
        assert!(cursor.cursor_id().is_none());
        assert_eq!(transport.calls("close"), 1);
        assert_eq!(cursor.try_next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_close_exhausted_cursor_sends_nothing() {
        let transport = MockTransport::new();
        let mut cursor = cursor(transport.clone(), None, vec![]);
        cursor.close().await.unwrap();
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_batch_size_is_forwarded() {
        let transport = MockTransport::new();
        transport.respond("get_more", batch(None, &[]));
        let mut cursor = cursor(transport.clone(), Some("t1"), vec![]);
        cursor.batch_size(10);
        cursor.advance().await.unwrap();

        let sent = &transport.requests()[0];
        assert_eq!(sent.body.kwargs.get("batch_size"), Some(&serde_json::json!(10)));
    }

    #[tokio::test]
    async fn test_invoke_overrides() {
        let transport = MockTransport::new();
        let mut cursor = cursor(transport.clone(), Some("t1"), vec![doc! { "name": "a" }]);

        let alive = cursor.invoke("alive", vec![], doc! {}).await.unwrap();
        assert_eq!(alive.into_value(), Some(Bson::Boolean(true)));
        let id = cursor.invoke("cursor_id", vec![], doc! {}).await.unwrap();
        assert_eq!(id.into_value(), Some(Bson::String("t1".into())));
        let next = cursor.invoke("next", vec![], doc! {}).await.unwrap();
        assert_eq!(next.into_value(), Some(Bson::Document(doc! { "name": "a" })));

        let err = cursor.invoke("batch_size", vec![], doc! {}).await.unwrap_err();
        assert!(err.is_usage_error());
        let err = cursor.invoke("rewind", vec![], doc! {}).await.unwrap_err();
        assert!(err.is_usage_error());
        assert!(transport.requests().is_empty());
    }
}
