//! Database handles.

use crate::change_stream::ChangeStream;
use crate::client::{Client, ClientInner};
use crate::collection::Collection;
use crate::cursor::CommandCursor;
use crate::dispatch::{Args, Dispatcher, Kwargs, Route, Target};
use crate::error::{ProxyError, Result};
use crate::proxy::{self, Outcome, Proxy, ProxyFactory, ProxyType, Resolved};
use crate::shape::DATABASE;
use async_trait::async_trait;
use bson::{doc, Bson, Document};
use std::sync::{Arc, OnceLock, Weak};

fn proxy_type() -> &'static ProxyType {
    static TYPE: OnceLock<ProxyType> = OnceLock::new();
    TYPE.get_or_init(|| {
        ProxyFactory::new(&DATABASE)
            .override_operation("client")
            .override_operation("codec_options")
            .override_operation("get_collection")
            .override_operation("name")
            .override_operation("read_concern")
            .override_operation("read_preference")
            .override_operation("with_options")
            .override_operation("write_concern")
            .build()
    })
}

struct DatabaseInner {
    name: String,
    client: Weak<ClientInner>,
    dispatcher: Dispatcher,
}

/// A handle to one database behind the remote API.
///
/// Obtained from [`Client::get_database`]; the client caches handles, so the
/// same name always yields the same handle. Cloning is cheap and clones share
/// identity.
///
/// # Example
///
/// ```ignore
/// let db = client.get_database("app")?;
/// let names = db.list_collection_names(None).await?;
/// let users = db.get_collection("users")?;
/// ```
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    pub(crate) fn new(name: String, client: Weak<ClientInner>, dispatcher: Dispatcher) -> Self {
        Self {
            inner: Arc::new(DatabaseInner {
                name,
                client,
                dispatcher,
            }),
        }
    }

    /// Get the database name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The client this database belongs to.
    ///
    /// Fails once every clone of that client has been dropped.
    pub fn client(&self) -> Result<Client> {
        self.inner
            .client
            .upgrade()
            .map(Client::from_inner)
            .ok_or_else(|| {
                ProxyError::usage(
                    "client",
                    "the client that created this database has been dropped; keep the Client alive while using its databases",
                )
            })
    }

    /// Whether two handles are the same cached database.
    pub fn ptr_eq(&self, other: &Database) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Get a handle to a collection.
    pub fn get_collection(&self, name: &str) -> Result<Collection> {
        if name.is_empty() {
            return Err(ProxyError::usage(
                "get_collection",
                "collection name must be a non-empty string",
            ));
        }
        Ok(Collection::new(self.clone(), name))
    }

    /// Attribute-style collection access.
    ///
    /// Names starting with `_` are refused; use
    /// [`get_collection`](Self::get_collection) for those.
    pub fn collection(&self, name: &str) -> Result<Collection> {
        if proxy::is_private(name) {
            return Err(ProxyError::usage(
                name,
                format!(
                    "Database has no attribute `{}`; to access the collection use db.get_collection(\"{}\")",
                    name, name
                ),
            ));
        }
        self.get_collection(name)
    }

    /// List collections as a cursor of collection descriptions.
    pub async fn list_collections(&self, filter: impl Into<Option<Document>>) -> Result<CommandCursor> {
        let kwargs = filter
            .into()
            .map(|filter| doc! { "filter": filter })
            .unwrap_or_default();
        let reply = self.forward("list_collections", Args::new(), kwargs).await?;
        let seed = reply.into_cursor("list_collections")?;
        Ok(CommandCursor::new(self.inner.dispatcher.clone(), &self.route(), seed))
    }

    /// List the names of the collections in this database.
    pub async fn list_collection_names(&self, filter: impl Into<Option<Document>>) -> Result<Vec<String>> {
        let kwargs = filter
            .into()
            .map(|filter| doc! { "filter": filter })
            .unwrap_or_default();
        let value = self
            .forward("list_collection_names", Args::new(), kwargs)
            .await?
            .into_value("list_collection_names")?;
        proxy::expect_strings("list_collection_names", value)
    }

    /// Run a database command and return its reply document.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let stats = db.command(doc! { "dbStats": 1 }).await?;
    /// ```
    pub async fn command(&self, command: Document) -> Result<Document> {
        let value = self
            .forward("command", vec![Bson::Document(command)], Kwargs::new())
            .await?
            .into_value("command")?;
        proxy::expect_document("command", value)
    }

    /// Create a collection and return its handle.
    pub async fn create_collection(&self, name: &str) -> Result<Collection> {
        let collection = self.get_collection(name)?;
        self.forward("create_collection", vec![Bson::from(name)], Kwargs::new())
            .await?;
        Ok(collection)
    }

    /// Run a database-level aggregation.
    pub async fn aggregate(&self, pipeline: Vec<Document>) -> Result<CommandCursor> {
        let pipeline = Bson::Array(pipeline.into_iter().map(Bson::Document).collect());
        let seed = self
            .forward("aggregate", vec![pipeline], Kwargs::new())
            .await?
            .into_cursor("aggregate")?;
        Ok(CommandCursor::new(self.inner.dispatcher.clone(), &self.route(), seed))
    }

    /// Watch every collection in this database.
    pub async fn watch(&self, pipeline: impl Into<Option<Vec<Document>>>) -> Result<ChangeStream> {
        let args = pipeline_args(pipeline.into());
        let seed = self
            .forward("watch", args, Kwargs::new())
            .await?
            .into_stream("watch")?;
        Ok(ChangeStream::new(self.inner.dispatcher.clone(), &self.route(), seed))
    }

    /// Drop a collection.
    pub async fn drop_collection(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(ProxyError::usage(
                "drop_collection",
                "collection name must be a non-empty string",
            ));
        }
        self.forward("drop_collection", vec![Bson::from(name)], Kwargs::new())
            .await?;
        Ok(())
    }

    /// Call any `Database` operation by name.
    ///
    /// Operations the handle answers itself (`name`, `client`,
    /// `get_collection`, `with_options` and the concern properties) never
    /// reach the remote API.
    pub async fn invoke(&self, operation: &str, args: Args, kwargs: Kwargs) -> Result<Outcome> {
        match proxy::resolve(self, operation, &args, &kwargs)? {
            Resolved::Generated => self.forward_outcome(operation, args, kwargs).await,
            Resolved::Overridden => match operation {
                "name" => Ok(Outcome::Value(Bson::String(self.name().to_string()))),
                "client" => self.client().map(Outcome::Client),
                "get_collection" => {
                    let name = proxy::string_arg(operation, &args, &kwargs, "name")?.unwrap_or_default();
                    self.get_collection(name).map(Outcome::Collection)
                }
                "with_options" => Ok(Outcome::Database(self.clone())),
                "codec_options" | "read_concern" | "read_preference" | "write_concern" => {
                    Ok(Outcome::Value(Bson::Null))
                }
                other => Err(ProxyError::usage(
                    other,
                    format!("Database has no operation `{}`", other),
                )),
            },
        }
    }
}

pub(crate) fn pipeline_args(pipeline: Option<Vec<Document>>) -> Args {
    pipeline
        .map(|stages| vec![Bson::Array(stages.into_iter().map(Bson::Document).collect())])
        .unwrap_or_default()
}

#[async_trait]
impl Proxy for Database {
    fn proxy_type(&self) -> &'static ProxyType {
        proxy_type()
    }

    fn route(&self) -> Route {
        Route::new(Target::Database).database(self.name())
    }

    fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("name", &self.name()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientOptions;
    use crate::testing::MockTransport;
    use pretty_assertions::assert_eq;

    fn client(transport: Arc<MockTransport>) -> Client {
        Client::with_transport("https://api.example/rpc", b"k".to_vec(), ClientOptions::default(), transport)
            .unwrap()
    }

    #[tokio::test]
    async fn test_database_route() {
        let transport = MockTransport::new();
        transport.respond(
            "list_collection_names",
            serde_json::json!({ "kind": "value", "payload": ["users", "orders"] }),
        );
        let db = client(transport.clone()).get_database("app").unwrap();

        let names = db.list_collection_names(None).await.unwrap();
        assert_eq!(names, vec!["users".to_string(), "orders".to_string()]);

        let sent = &transport.requests()[0];
        assert_eq!(sent.body.context, Route::new(Target::Database).database("app"));
    }

    #[test]
    fn test_get_collection_rejects_empty_name() {
        let db = client(MockTransport::new()).get_database("app").unwrap();
        let err = db.get_collection("").unwrap_err();
        assert!(err.is_usage_error());
    }

    #[test]
    fn test_collection_attr_rejects_private_names() {
        let db = client(MockTransport::new()).get_database("app").unwrap();
        let err = db.collection("_meta").unwrap_err();
        assert!(err.to_string().contains("db.get_collection(\"_meta\")"));
        assert_eq!(db.get_collection("_meta").unwrap().name(), "_meta");
    }

    #[test]
    fn test_client_back_reference() {
        let client = client(MockTransport::new());
        let db = client.get_database("app").unwrap();
        assert!(db.client().unwrap().ptr_eq(&client));

        drop(client);
        assert!(db.client().unwrap_err().is_usage_error());
    }

    #[tokio::test]
    async fn test_list_collections_returns_cursor() {
        let transport = MockTransport::new();
        transport.respond(
            "list_collections",
            serde_json::json!({
                "kind": "cursor",
                "payload": { "cursor_id": null, "batch": [{ "name": "users", "type": "collection" }] }
            }),
        );
        let db = client(transport.clone()).get_database("app").unwrap();

        let docs = db
            .list_collections(doc! { "name": "users" })
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(
            transport.requests()[0].body.kwargs.get("filter"),
            Some(&serde_json::json!({ "name": "users" }))
        );
    }

    #[tokio::test]
    async fn test_command_forwards_document() {
        let transport = MockTransport::new();
        transport.respond("command", serde_json::json!({ "kind": "value", "payload": { "ok": 1 } }));
        let db = client(transport.clone()).get_database("app").unwrap();

        let reply = db.command(doc! { "ping": 1 }).await.unwrap();
        assert_eq!(reply, doc! { "ok": 1 });
        assert_eq!(transport.requests()[0].body.args, vec![serde_json::json!({ "ping": 1 })]);
    }

    #[tokio::test]
    async fn test_invoke_local_operations() {
        let transport = MockTransport::new();
        let client = client(transport.clone());
        let db = client.get_database("app").unwrap();

        let name = db.invoke("name", vec![], doc! {}).await.unwrap();
        assert_eq!(name.into_value(), Some(Bson::String("app".into())));

        let coll = db
            .invoke("get_collection", vec![Bson::from("users")], doc! {})
            .await
            .unwrap()
            .into_collection()
            .unwrap();
        assert_eq!(coll.full_name(), "app.users");

        let owner = db.invoke("client", vec![], doc! {}).await.unwrap().into_client().unwrap();
        assert!(owner.ptr_eq(&client));

        let same = db.invoke("with_options", vec![], doc! {}).await.unwrap().into_database().unwrap();
        assert!(same.ptr_eq(&db));

        let err = db.invoke("get_collection", vec![], doc! {}).await.unwrap_err();
        assert!(err.is_usage_error());
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_invoke_forwards_generated_operation() {
        let transport = MockTransport::new();
        let db = client(transport.clone()).get_database("app").unwrap();

        db.invoke("validate_collection", vec![Bson::from("users")], doc! { "full": true })
            .await
            .unwrap();
        let sent = &transport.requests()[0];
        assert_eq!(sent.body.operation, "validate_collection");
        assert_eq!(sent.body.args, vec![serde_json::json!("users")]);

        let err = db.invoke("_command", vec![], doc! {}).await.unwrap_err();
        assert!(err.is_usage_error());
        assert_eq!(transport.requests().len(), 1);
    }
}
