//! The root proxy: endpoint configuration, database cache and the
//! client-level operations.

use crate::change_stream::ClusterChangeStream;
use crate::codec::{BsonCodec, ValueCodec};
use crate::cursor::CommandCursor;
use crate::db::{pipeline_args, Database};
use crate::dispatch::{Args, Dispatcher, Endpoint, Kwargs, Route, Target};
use crate::error::{ProxyError, Result};
use crate::proxy::{self, Outcome, Proxy, ProxyFactory, ProxyType, Resolved};
use crate::shape::MONGO_CLIENT;
use crate::transport::{HttpTransport, Transport};
use async_trait::async_trait;
use bson::{doc, Bson, Document};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use url::Url;

/// Host and port of a server, as the driver reports topology.
pub type ServerAddress = (String, u16);

/// Options for a proxied client.
#[derive(Clone)]
pub struct ClientOptions {
    /// Application name, sent in the user agent.
    pub app_name: Option<String>,
    /// Upper bound on one change stream fetch, in milliseconds.
    pub change_stream_timeout_ms: u64,
    /// Database returned by [`Client::get_default_database`].
    pub default_database: Option<String>,
    /// Codec used for every value crossing the wire.
    pub codec: Arc<dyn ValueCodec>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            app_name: None,
            change_stream_timeout_ms: 30_000,
            default_database: None,
            codec: Arc::new(BsonCodec),
        }
    }
}

impl std::fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientOptions")
            .field("app_name", &self.app_name)
            .field("change_stream_timeout_ms", &self.change_stream_timeout_ms)
            .field("default_database", &self.default_database)
            .finish_non_exhaustive()
    }
}

impl ClientOptions {
    /// Create a new ClientOptions with defaults.
    pub fn builder() -> ClientOptionsBuilder {
        ClientOptionsBuilder::default()
    }

    /// Parse options from the query string of an endpoint URL.
    ///
    /// Recognized keys are `appName`, `changeStreamTimeoutMS` and
    /// `defaultDatabase`; anything else is left for the remote API.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let options = ClientOptions::parse("https://api.example/rpc?appName=shop&defaultDatabase=app")?;
    /// ```
    pub fn parse(uri: &str) -> Result<Self> {
        let url = parse_endpoint(uri)?;
        let mut options = ClientOptions::default();

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "appName" => options.app_name = Some(value.into_owned()),
                "changeStreamTimeoutMS" => {
                    if let Ok(v) = value.parse() {
                        options.change_stream_timeout_ms = v;
                    }
                }
                "defaultDatabase" if !value.is_empty() => {
                    options.default_database = Some(value.into_owned());
                }
                _ => {}
            }
        }

        Ok(options)
    }

    /// The change stream fetch bound as a duration.
    pub fn change_stream_timeout(&self) -> Duration {
        Duration::from_millis(self.change_stream_timeout_ms)
    }
}

/// Builder for ClientOptions.
#[derive(Debug, Clone, Default)]
pub struct ClientOptionsBuilder {
    options: ClientOptions,
}

impl ClientOptionsBuilder {
    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.options.app_name = Some(name.into());
        self
    }

    /// Set the change stream fetch timeout.
    pub fn change_stream_timeout_ms(mut self, timeout: u64) -> Self {
        self.options.change_stream_timeout_ms = timeout;
        self
    }

    /// Set the default database.
    pub fn default_database(mut self, name: impl Into<String>) -> Self {
        self.options.default_database = Some(name.into());
        self
    }

    /// Use a custom value codec.
    pub fn codec(mut self, codec: Arc<dyn ValueCodec>) -> Self {
        self.options.codec = codec;
        self
    }

    /// Build the options.
    pub fn build(self) -> ClientOptions {
        self.options
    }
}

fn parse_endpoint(uri: &str) -> Result<Url> {
    Url::parse(uri).map_err(|e| {
        ProxyError::usage(
            "Client::new",
            format!("invalid endpoint URL `{}`: {}", uri, e),
        )
    })
}

/// Sessions cannot be started against the remote API, so this type has no
/// values; [`Client::start_session`] always fails.
#[derive(Debug)]
pub enum ClientSession {}

fn proxy_type() -> &'static ProxyType {
    static TYPE: OnceLock<ProxyType> = OnceLock::new();
    TYPE.get_or_init(|| {
        ProxyFactory::new(&MONGO_CLIENT)
            .override_operation("address")
            .override_operation("arbiters")
            .override_operation("close")
            .override_operation("codec_options")
            .override_operation("get_database")
            .override_operation("get_default_database")
            .override_operation("is_mongos")
            .override_operation("is_primary")
            .override_operation("nodes")
            .override_operation("options")
            .override_operation("primary")
            .override_operation("read_concern")
            .override_operation("read_preference")
            .override_operation("secondaries")
            .override_operation("start_session")
            .override_operation("topology_description")
            .override_operation("write_concern")
            .build()
    })
}

pub(crate) struct ClientInner {
    dispatcher: Dispatcher,
    options: ClientOptions,
    databases: Mutex<HashMap<String, Database>>,
}

/// A driver-compatible client whose operations run on a remote HTTP API.
///
/// The client never opens a database connection. It holds the endpoint URL
/// and access key, and every operation (on the client or on any database,
/// collection, cursor or change stream obtained from it) becomes one
/// authenticated request.
///
/// Cloning is cheap; clones share the database cache and the closed flag.
///
/// # Example
///
/// ```ignore
/// use mongo_proxy::Client;
///
/// #[tokio::main]
/// async fn main() -> mongo_proxy::Result<()> {
///     let client = Client::new("https://api.example/rpc", b"secret".to_vec())?;
///     let db = client.get_database("app")?;
///     let users = db.get_collection("users")?;
///
///     // Perform operations...
///
///     client.close();
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

/// Alias using the driver's name for the client type.
pub type MongoClient = Client;

impl Client {
    /// Create a client for `endpoint_url`, authenticating with `access_key`.
    ///
    /// An empty key configures anonymous access: requests carry no
    /// `Authorization` header. Options are read from the URL query string.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let client = Client::new("https://api.example/rpc?appName=shop", b"secret".to_vec())?;
    /// ```
    pub fn new(endpoint_url: &str, access_key: impl Into<Vec<u8>>) -> Result<Self> {
        let options = ClientOptions::parse(endpoint_url)?;
        Self::with_options(endpoint_url, access_key, options)
    }

    /// Create a client with custom options.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let options = ClientOptions::builder()
    ///     .app_name("shop")
    ///     .change_stream_timeout_ms(5_000)
    ///     .build();
    /// let client = Client::with_options("https://api.example/rpc", b"secret".to_vec(), options)?;
    /// ```
    pub fn with_options(
        endpoint_url: &str,
        access_key: impl Into<Vec<u8>>,
        options: ClientOptions,
    ) -> Result<Self> {
        let transport = HttpTransport::new(options.app_name.as_deref())
            .map_err(|e| ProxyError::connectivity("Client::new", e.to_string()))?;
        Self::with_transport(endpoint_url, access_key, options, Arc::new(transport))
    }

    /// Create a client that sends requests through `transport`.
    pub fn with_transport(
        endpoint_url: &str,
        access_key: impl Into<Vec<u8>>,
        options: ClientOptions,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let url = parse_endpoint(endpoint_url)?;
        let endpoint = Endpoint::new(url, access_key);
        if endpoint.is_anonymous() {
            tracing::debug!(url = %endpoint.url(), "client configured for anonymous access");
        }
        let dispatcher = Dispatcher::with_settings(
            endpoint,
            transport,
            options.codec.clone(),
            options.change_stream_timeout(),
        );
        Ok(Self {
            inner: Arc::new(ClientInner {
                dispatcher,
                options,
                databases: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub(crate) fn from_inner(inner: Arc<ClientInner>) -> Self {
        Self { inner }
    }

    /// Get the client options.
    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// The endpoint every request is posted to.
    pub fn api_endpoint_url(&self) -> &Url {
        self.inner.dispatcher.endpoint().url()
    }

    /// Headers attached to every request, credentials included.
    pub fn api_endpoint_headers(&self) -> Vec<(String, String)> {
        self.inner.dispatcher.endpoint().headers()
    }

    /// Whether two handles are clones of the same client.
    pub fn ptr_eq(&self, other: &Client) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Get a database handle.
    ///
    /// Handles are cached for the life of the client: asking twice for the
    /// same name returns the same handle. Nothing is sent to the remote API.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let db = client.get_database("app")?;
    /// assert!(db.ptr_eq(&client.get_database("app")?));
    /// ```
    pub fn get_database<'a>(&self, name: impl Into<Option<&'a str>>) -> Result<Database> {
        let name = match name.into() {
            Some(name) if !name.is_empty() => name,
            _ => {
                return Err(ProxyError::usage(
                    "get_database",
                    "database name must be a non-empty string; pass a name, or call get_default_database()",
                ))
            }
        };

        let mut databases = self
            .inner
            .databases
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let db = databases
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::trace!(database = name, "caching database handle");
                Database::new(
                    name.to_string(),
                    Arc::downgrade(&self.inner),
                    self.inner.dispatcher.clone(),
                )
            })
            .clone();
        Ok(db)
    }

    /// Index-style database access, equivalent to
    /// [`get_database`](Self::get_database). Any name is accepted, including
    /// names starting with `_`.
    pub fn get(&self, name: &str) -> Result<Database> {
        self.get_database(name)
    }

    /// Attribute-style database access.
    ///
    /// Names starting with `_` are refused; use [`get`](Self::get) for
    /// those.
    pub fn attr(&self, name: &str) -> Result<Database> {
        if proxy::is_private(name) {
            return Err(ProxyError::usage(
                name,
                format!(
                    "MongoClient has no attribute `{}`; to access the database use client.get(\"{}\")",
                    name, name
                ),
            ));
        }
        self.get_database(name)
    }

    /// The database named by the options or the endpoint URL's
    /// `defaultDatabase` parameter.
    pub fn get_default_database(&self) -> Result<Database> {
        self.default_database(None)
    }

    fn default_database(&self, fallback: Option<&str>) -> Result<Database> {
        let name = self
            .inner
            .options
            .default_database
            .as_deref()
            .or(fallback)
            .ok_or_else(|| {
                ProxyError::usage(
                    "get_default_database",
                    "no default database configured; set ClientOptions::default_database or add defaultDatabase to the endpoint URL",
                )
            })?;
        self.get_database(name)
    }

    /// List databases as a cursor of database descriptions.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let mut cursor = client.list_databases(None).await?;
    /// while let Some(db) = cursor.try_next().await? {
    ///     println!("{}", db.get_str("name")?);
    /// }
    /// ```
    pub async fn list_databases(&self, filter: impl Into<Option<Document>>) -> Result<CommandCursor> {
        let kwargs = filter
            .into()
            .map(|filter| doc! { "filter": filter })
            .unwrap_or_default();
        let seed = self
            .forward("list_databases", Args::new(), kwargs)
            .await?
            .into_cursor("list_databases")?;
        Ok(CommandCursor::new(self.inner.dispatcher.clone(), &self.route(), seed))
    }

    /// List all database names.
    pub async fn list_database_names(&self) -> Result<Vec<String>> {
        let value = self
            .forward("list_database_names", Args::new(), Kwargs::new())
            .await?
            .into_value("list_database_names")?;
        proxy::expect_strings("list_database_names", value)
    }

    /// Drop a database.
    pub async fn drop_database(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(ProxyError::usage(
                "drop_database",
                "database name must be a non-empty string",
            ));
        }
        self.forward("drop_database", vec![Bson::from(name)], Kwargs::new())
            .await?;
        Ok(())
    }

    /// Server information reported by the remote API.
    pub async fn server_info(&self) -> Result<Document> {
        let value = self
            .forward("server_info", Args::new(), Kwargs::new())
            .await?
            .into_value("server_info")?;
        proxy::expect_document("server_info", value)
    }

    /// Watch every database for changes.
    pub async fn watch(&self, pipeline: impl Into<Option<Vec<Document>>>) -> Result<ClusterChangeStream> {
        let seed = self
            .forward("watch", pipeline_args(pipeline.into()), Kwargs::new())
            .await?
            .into_stream("watch")?;
        Ok(ClusterChangeStream::new(self.inner.dispatcher.clone(), &self.route(), seed))
    }

    /// Always fails: sessions are not available through the remote API.
    pub fn start_session(&self) -> Result<ClientSession> {
        Err(ProxyError::usage(
            "start_session",
            "sessions are not supported by the remote API; issue operations without a session",
        ))
    }

    /// Always `None`.
    pub fn address(&self) -> Option<ServerAddress> {
        None
    }

    /// Always `None`.
    pub fn primary(&self) -> Option<ServerAddress> {
        None
    }

    /// Always `None`.
    pub fn secondaries(&self) -> Option<Vec<ServerAddress>> {
        None
    }

    /// Always `None`.
    pub fn arbiters(&self) -> Option<Vec<ServerAddress>> {
        None
    }

    /// Always `None`.
    pub fn is_primary(&self) -> Option<bool> {
        None
    }

    /// Always `None`.
    pub fn is_mongos(&self) -> Option<bool> {
        None
    }

    /// Always `None`.
    pub fn nodes(&self) -> Option<Vec<ServerAddress>> {
        None
    }

    /// Close the client.
    ///
    /// Every later operation on this client, or on any handle obtained from
    /// it, fails locally with a usage error. Closing twice is harmless.
    pub fn close(&self) {
        if self.inner.dispatcher.close() {
            tracing::debug!(url = %self.api_endpoint_url(), "client closed");
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.dispatcher.is_closed()
    }

    /// Call any `MongoClient` operation by name.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let names = client
    ///     .invoke("list_database_names", vec![], doc! { "comment": "audit" })
    ///     .await?
    ///     .into_value();
    /// ```
    pub async fn invoke(&self, operation: &str, args: Args, kwargs: Kwargs) -> Result<Outcome> {
        match proxy::resolve(self, operation, &args, &kwargs)? {
            Resolved::Generated => self.forward_outcome(operation, args, kwargs).await,
            Resolved::Overridden => match operation {
                "get_database" => {
                    let name = proxy::string_arg(operation, &args, &kwargs, "name")?;
                    self.get_database(name).map(Outcome::Database)
                }
                "get_default_database" => {
                    let fallback = proxy::string_arg(operation, &args, &kwargs, "default")?;
                    self.default_database(fallback).map(Outcome::Database)
                }
                "start_session" => match self.start_session() {
                    Ok(session) => match session {},
                    Err(e) => Err(e),
                },
                "close" => {
                    self.close();
                    Ok(Outcome::Value(Bson::Null))
                }
                "address" | "arbiters" | "codec_options" | "is_mongos" | "is_primary" | "nodes"
                | "options" | "primary" | "read_concern" | "read_preference" | "secondaries"
                | "topology_description" | "write_concern" => Ok(Outcome::Value(Bson::Null)),
                other => Err(ProxyError::usage(
                    other,
                    format!("MongoClient has no operation `{}`", other),
                )),
            },
        }
    }
}

#[async_trait]
impl Proxy for Client {
    fn proxy_type(&self) -> &'static ProxyType {
        proxy_type()
    }

    fn route(&self) -> Route {
        Route::new(Target::Client)
    }

    fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", self.inner.dispatcher.endpoint())
            .field("closed", &self.is_closed())
            .finish()
    }
}
