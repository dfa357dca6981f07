//! Change streams over a remote subscription.

use crate::dispatch::{Args, Dispatcher, Kwargs, OperationCall, Route, StreamSeed, Target};
use crate::error::{ProxyError, Result};
use crate::proxy::{self, Outcome, Proxy, ProxyFactory, ProxyType, Resolved};
use crate::shape::CHANGE_STREAM;
use async_trait::async_trait;
use bson::{Bson, Document};
use futures::Stream;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::watch;

/// A change stream opened on the whole deployment. The same type serves
/// database- and collection-level subscriptions.
pub type ClusterChangeStream = ChangeStream;

/// Lifecycle of a change stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Waiting for the next fetch.
    Subscribed,
    /// A `try_next` round trip is in flight.
    Fetching,
    /// Ended locally or by the remote side.
    Closed,
}

fn proxy_type() -> &'static ProxyType {
    static TYPE: OnceLock<ProxyType> = OnceLock::new();
    TYPE.get_or_init(|| {
        ProxyFactory::new(&CHANGE_STREAM)
            .override_operation("alive")
            .override_operation("close")
            .override_operation("next")
            .override_operation("resume_token")
            .override_operation("try_next")
            .build()
    })
}

/// Closes a [`ChangeStream`] from another task.
///
/// A fetch in flight when the handle fires returns `Ok(None)` without waiting
/// for the remote side.
#[derive(Debug, Clone)]
pub struct CloseHandle {
    signal: Arc<watch::Sender<bool>>,
}

impl CloseHandle {
    /// Ask the stream to stop.
    pub fn close(&self) {
        self.signal.send_replace(true);
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        *self.signal.borrow()
    }
}

async fn close_requested(mut signal: watch::Receiver<bool>) {
    let fired = signal.wait_for(|closed| *closed).await.is_ok();
    if !fired {
        std::future::pending::<()>().await;
    }
}

/// A subscription to change events.
///
/// Each [`try_next`](ChangeStream::try_next) is one `try_next` round trip,
/// bounded by the client's change stream timeout. Events carry a resume
/// token that the stream keeps current.
///
/// # Example
///
/// ```ignore
/// let mut stream = client.watch(None).await?;
/// let handle = stream.close_handle();
/// tokio::spawn(async move {
///     tokio::time::sleep(Duration::from_secs(60)).await;
///     handle.close();
/// });
/// while let Some(event) = stream.next_event().await? {
///     println!("{:?}", event.get_str("operationType"));
/// }
/// stream.close().await?;
/// ```
pub struct ChangeStream {
    dispatcher: Dispatcher,
    origin: Route,
    stream_id: Option<String>,
    resume_token: Option<Document>,
    pending: Option<Document>,
    state: StreamState,
    timeout: Duration,
    close_signal: Arc<watch::Sender<bool>>,
}

impl ChangeStream {
    /// Create a stream from the seed returned by a `watch` call.
    pub(crate) fn new(dispatcher: Dispatcher, origin: &Route, seed: StreamSeed) -> Self {
        let state = if seed.alive && seed.stream_id.is_some() {
            StreamState::Subscribed
        } else {
            StreamState::Closed
        };
        let timeout = dispatcher.change_stream_timeout();
        let (close_signal, _) = watch::channel(false);
        Self {
            dispatcher,
            origin: origin.clone(),
            stream_id: seed.stream_id,
            resume_token: seed.resume_token,
            pending: seed.event,
            state,
            timeout,
            close_signal: Arc::new(close_signal),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Whether more events may arrive.
    pub fn is_alive(&self) -> bool {
        self.pending.is_some() || self.state != StreamState::Closed
    }

    /// Token to resume after the latest delivered event.
    pub fn resume_token(&self) -> Option<&Document> {
        self.resume_token.as_ref()
    }

    /// Subscription token, while the remote subscription is held.
    pub fn stream_id(&self) -> Option<&str> {
        self.stream_id.as_deref()
    }

    /// Upper bound on one fetch.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Change the upper bound on one fetch.
    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = timeout;
        self
    }

    /// A handle that can close this stream from another task.
    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            signal: self.close_signal.clone(),
        }
    }

    /// Fetch at most one event.
    ///
    /// Returns `Ok(None)` when no event arrived in this round trip or the
    /// stream is closed. A timeout is an error but leaves the stream
    /// subscribed; any other failure closes it.
    pub async fn try_next(&mut self) -> Result<Option<Document>> {
        if let Some(event) = self.pending.take() {
            return Ok(Some(event));
        }
        if self.state == StreamState::Closed {
            return Ok(None);
        }
        if *self.close_signal.borrow() {
            self.state = StreamState::Closed;
            return Ok(None);
        }
        let Some(stream_id) = self.stream_id.clone() else {
            self.state = StreamState::Closed;
            return Ok(None);
        };

        self.state = StreamState::Fetching;
        let route = self.origin.stateful(Target::ChangeStream, stream_id);
        let fetch = self
            .dispatcher
            .dispatch_with_timeout(OperationCall::new("try_next"), route, self.timeout);
        let closed = close_requested(self.close_signal.subscribe());

        let result = tokio::select! {
            result = fetch => Some(result),
            _ = closed => None,
        };

        let reply = match result {
            None => {
                tracing::debug!(stream_id = self.stream_id.as_deref(), "change stream closed by handle");
                self.state = StreamState::Closed;
                return Ok(None);
            }
            Some(Err(e)) if e.is_timeout() => {
                self.state = StreamState::Subscribed;
                return Err(e);
            }
            Some(result) => result.and_then(|reply| reply.into_stream("try_next")),
        };

        let seed = match reply {
            Ok(seed) => seed,
            Err(e) => {
                self.state = StreamState::Closed;
                self.stream_id = None;
                return Err(e);
            }
        };

        if seed.stream_id.is_some() {
            self.stream_id = seed.stream_id;
        }
        let token = seed.resume_token.or_else(|| {
            seed.event
                .as_ref()
                .and_then(|event| event.get_document("_id").ok())
                .cloned()
        });
        if token.is_some() {
            self.resume_token = token;
        }
        if seed.alive {
            self.state = StreamState::Subscribed;
        } else {
            tracing::debug!("change stream ended by remote side");
            self.state = StreamState::Closed;
            self.stream_id = None;
        }
        Ok(seed.event)
    }

    /// Wait for the next event, fetching until one arrives.
    ///
    /// Timed-out fetches are retried; `Ok(None)` means the stream is closed.
    pub async fn next_event(&mut self) -> Result<Option<Document>> {
        loop {
            match self.try_next().await {
                Ok(Some(event)) => return Ok(Some(event)),
                Ok(None) if self.state == StreamState::Closed => return Ok(None),
                Ok(None) => continue,
                Err(e) if e.is_timeout() => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Turn the stream into a `Stream` of events that ends when the change
    /// stream closes.
    pub fn into_stream(self) -> impl Stream<Item = Result<Document>> + Send {
        futures::stream::try_unfold(self, |mut stream| async move {
            Ok(stream.next_event().await?.map(|event| (event, stream)))
        })
    }

    /// Close the stream, releasing the remote subscription once.
    pub async fn close(&mut self) -> Result<()> {
        self.close_signal.send_replace(true);
        self.pending = None;
        self.state = StreamState::Closed;
        if let Some(stream_id) = self.stream_id.take() {
            let route = self.origin.stateful(Target::ChangeStream, stream_id);
            self.dispatcher
                .dispatch(OperationCall::new("close"), route)
                .await?;
        }
        Ok(())
    }

    /// Call any `ChangeStream` operation by name.
    pub async fn invoke(&mut self, operation: &str, args: Args, kwargs: Kwargs) -> Result<Outcome> {
        match proxy::resolve(&*self, operation, &args, &kwargs)? {
            Resolved::Generated => self.forward_outcome(operation, args, kwargs).await,
            Resolved::Overridden => {
                let value = match operation {
                    "alive" => Bson::Boolean(self.is_alive()),
                    "resume_token" => self.resume_token.clone().map(Bson::Document).unwrap_or(Bson::Null),
                    "try_next" => self.try_next().await?.map(Bson::Document).unwrap_or(Bson::Null),
                    "next" => self.next_event().await?.map(Bson::Document).unwrap_or(Bson::Null),
                    "close" => {
                        self.close().await?;
                        Bson::Null
                    }
                    other => {
                        return Err(ProxyError::usage(
                            other,
                            format!("ChangeStream has no operation `{}`", other),
                        ))
                    }
                };
                Ok(Outcome::Value(value))
            }
        }
    }
}

#[async_trait]
impl Proxy for ChangeStream {
    fn proxy_type(&self) -> &'static ProxyType {
        proxy_type()
    }

    fn route(&self) -> Route {
        match &self.stream_id {
            Some(stream_id) => self.origin.stateful(Target::ChangeStream, stream_id.clone()),
            None => Route {
                target: Target::ChangeStream,
                ..self.origin.clone()
            },
        }
    }

    fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

impl std::fmt::Debug for ChangeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeStream")
            .field("stream_id", &self.stream_id)
            .field("state", &self.state)
            .field("timeout", &self.timeout)
            .finish()
    }
}
