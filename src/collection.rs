//! Collection handles with typed helpers for the common operations.

use crate::change_stream::ChangeStream;
use crate::cursor::CommandCursor;
use crate::db::{pipeline_args, Database};
use crate::dispatch::{Args, Dispatcher, Kwargs, Reply, Route, Target};
use crate::error::{ProxyError, Result};
use crate::proxy::{self, Outcome, Proxy, ProxyFactory, ProxyType, Resolved};
use crate::shape::COLLECTION;
use async_trait::async_trait;
use bson::{Bson, Document};
use std::sync::{Arc, OnceLock};

/// Result of an insert_one operation.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertOneResult {
    /// The ID of the inserted document.
    pub inserted_id: Bson,
}

/// Result of an insert_many operation.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertManyResult {
    /// IDs of the inserted documents, in insertion order.
    pub inserted_ids: Vec<Bson>,
}

/// Result of an update or replace operation.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateResult {
    /// Number of documents matched.
    pub matched_count: u64,
    /// Number of documents modified.
    pub modified_count: u64,
    /// The ID of the upserted document, if any.
    pub upserted_id: Option<Bson>,
}

/// Result of a delete operation.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteResult {
    /// Number of documents deleted.
    pub deleted_count: u64,
}

/// Options for find operations.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    /// Maximum number of documents to return.
    pub limit: Option<i64>,
    /// Number of documents to skip.
    pub skip: Option<u64>,
    /// Sort order.
    pub sort: Option<Document>,
    /// Projection (fields to include/exclude).
    pub projection: Option<Document>,
    /// Batch size for cursor.
    pub batch_size: Option<u32>,
}

impl FindOptions {
    /// Create new find options.
    pub fn builder() -> FindOptionsBuilder {
        FindOptionsBuilder::default()
    }

    fn into_kwargs(self) -> Result<Kwargs> {
        let mut kwargs = Kwargs::new();
        if let Some(projection) = self.projection {
            kwargs.insert("projection", projection);
        }
        if let Some(skip) = self.skip {
            let skip = i64::try_from(skip).map_err(|_| {
                ProxyError::usage("find", format!("skip {} exceeds the largest signed 64-bit value", skip))
            })?;
            kwargs.insert("skip", skip);
        }
        if let Some(limit) = self.limit {
            kwargs.insert("limit", limit);
        }
        if let Some(sort) = self.sort {
            kwargs.insert("sort", sort);
        }
        if let Some(batch_size) = self.batch_size {
            kwargs.insert("batch_size", i64::from(batch_size));
        }
        Ok(kwargs)
    }
}

/// Builder for FindOptions.
#[derive(Debug, Default)]
pub struct FindOptionsBuilder {
    options: FindOptions,
}

impl FindOptionsBuilder {
    /// Set the limit.
    pub fn limit(mut self, limit: i64) -> Self {
        self.options.limit = Some(limit);
        self
    }

    /// Set the skip.
    pub fn skip(mut self, skip: u64) -> Self {
        self.options.skip = Some(skip);
        self
    }

    /// Set the sort order.
    pub fn sort(mut self, sort: Document) -> Self {
        self.options.sort = Some(sort);
        self
    }

    /// Set the projection.
    pub fn projection(mut self, projection: Document) -> Self {
        self.options.projection = Some(projection);
        self
    }

    /// Set the batch size.
    pub fn batch_size(mut self, batch_size: u32) -> Self {
        self.options.batch_size = Some(batch_size);
        self
    }

    /// Build the options.
    pub fn build(self) -> FindOptions {
        self.options
    }
}

/// Options for update operations.
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// Insert a document when nothing matches.
    pub upsert: Option<bool>,
    /// Filters selecting array elements to update.
    pub array_filters: Option<Vec<Document>>,
}

impl UpdateOptions {
    /// Create new update options.
    pub fn builder() -> UpdateOptionsBuilder {
        UpdateOptionsBuilder::default()
    }

    fn into_kwargs(self) -> Kwargs {
        let mut kwargs = Kwargs::new();
        if let Some(upsert) = self.upsert {
            kwargs.insert("upsert", upsert);
        }
        if let Some(filters) = self.array_filters {
            kwargs.insert(
                "array_filters",
                Bson::Array(filters.into_iter().map(Bson::Document).collect()),
            );
        }
        kwargs
    }
}

/// Builder for UpdateOptions.
#[derive(Debug, Default)]
pub struct UpdateOptionsBuilder {
    options: UpdateOptions,
}

impl UpdateOptionsBuilder {
    /// Set upsert.
    pub fn upsert(mut self, upsert: bool) -> Self {
        self.options.upsert = Some(upsert);
        self
    }

    /// Set the array filters.
    pub fn array_filters(mut self, filters: Vec<Document>) -> Self {
        self.options.array_filters = Some(filters);
        self
    }

    /// Build the options.
    pub fn build(self) -> UpdateOptions {
        self.options
    }
}

fn proxy_type() -> &'static ProxyType {
    static TYPE: OnceLock<ProxyType> = OnceLock::new();
    TYPE.get_or_init(|| {
        ProxyFactory::new(&COLLECTION)
            .override_operation("codec_options")
            .override_operation("database")
            .override_operation("full_name")
            .override_operation("name")
            .override_operation("read_concern")
            .override_operation("read_preference")
            .override_operation("with_options")
            .override_operation("write_concern")
            .build()
    })
}

/// A handle to one collection behind the remote API.
///
/// Every call is forwarded with the database and collection name as routing
/// context. Typed helpers cover the common operations; anything else the
/// driver's collection exposes is reachable through
/// [`invoke`](Collection::invoke).
///
/// # Example
///
/// ```ignore
/// let users = client.get_database("app")?.get_collection("users")?;
/// users.insert_one(doc! { "name": "John" }).await?;
/// let john = users.find_one(doc! { "name": "John" }).await?;
/// ```
#[derive(Clone)]
pub struct Collection {
    database: Database,
    name: Arc<str>,
    full_name: Arc<str>,
}

impl Collection {
    pub(crate) fn new(database: Database, name: &str) -> Self {
        let full_name = format!("{}.{}", database.name(), name);
        Self {
            database,
            name: name.into(),
            full_name: full_name.into(),
        }
    }

    /// Get the collection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `<database>.<collection>`.
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    /// The database this collection belongs to.
    pub fn database(&self) -> &Database {
        &self.database
    }

    async fn value(&self, operation: &str, args: Args, kwargs: Kwargs) -> Result<Bson> {
        self.forward(operation, args, kwargs)
            .await?
            .into_value(operation)
    }

    async fn result_document(&self, operation: &str, args: Args, kwargs: Kwargs) -> Result<Document> {
        let value = self.value(operation, args, kwargs).await?;
        proxy::expect_document(operation, value)
    }

    fn cursor(&self, operation: &str, reply: Reply) -> Result<CommandCursor> {
        let seed = reply.into_cursor(operation)?;
        Ok(CommandCursor::new(self.dispatcher().clone(), &self.route(), seed))
    }

    /// Insert a single document.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let result = collection.insert_one(doc! { "name": "John" }).await?;
    /// println!("Inserted ID: {:?}", result.inserted_id);
    /// ```
    pub async fn insert_one(&self, document: Document) -> Result<InsertOneResult> {
        let result = self
            .result_document("insert_one", vec![Bson::Document(document)], Kwargs::new())
            .await?;
        Ok(InsertOneResult {
            inserted_id: field(&result, "inserted_id").cloned().unwrap_or(Bson::Null),
        })
    }

    /// Insert multiple documents.
    pub async fn insert_many(&self, documents: impl IntoIterator<Item = Document>) -> Result<InsertManyResult> {
        let documents = Bson::Array(documents.into_iter().map(Bson::Document).collect());
        let result = self
            .result_document("insert_many", vec![documents], Kwargs::new())
            .await?;
        let inserted_ids = match field(&result, "inserted_ids") {
            Some(Bson::Array(ids)) => ids.clone(),
            Some(Bson::Document(ids)) => ids.values().cloned().collect(),
            _ => Vec::new(),
        };
        Ok(InsertManyResult { inserted_ids })
    }

    /// Find documents matching a filter.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let cursor = collection.find(doc! { "status": "active" }).await?;
    /// let docs = cursor.collect().await?;
    /// ```
    pub async fn find(&self, filter: impl Into<Option<Document>>) -> Result<CommandCursor> {
        self.find_with_options(filter, None).await
    }

    /// Find documents with options.
    pub async fn find_with_options(
        &self,
        filter: impl Into<Option<Document>>,
        options: impl Into<Option<FindOptions>>,
    ) -> Result<CommandCursor> {
        let args = filter.into().map(Bson::Document).into_iter().collect();
        let kwargs = options.into().unwrap_or_default().into_kwargs()?;
        let reply = self.forward("find", args, kwargs).await?;
        self.cursor("find", reply)
    }

    /// Find a single document.
    pub async fn find_one(&self, filter: impl Into<Option<Document>>) -> Result<Option<Document>> {
        let args = filter.into().map(Bson::Document).into_iter().collect();
        let value = self.value("find_one", args, Kwargs::new()).await?;
        proxy::expect_optional_document("find_one", value)
    }

    /// Update a single document.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let result = collection.update_one(
    ///     doc! { "_id": id },
    ///     doc! { "$set": { "name": "Jane" } },
    /// ).await?;
    /// ```
    pub async fn update_one(&self, filter: Document, update: Document) -> Result<UpdateResult> {
        self.update_one_with_options(filter, update, None).await
    }

    /// Update a single document with options.
    pub async fn update_one_with_options(
        &self,
        filter: Document,
        update: Document,
        options: impl Into<Option<UpdateOptions>>,
    ) -> Result<UpdateResult> {
        self.update("update_one", filter, update, options.into()).await
    }

    /// Update every matching document.
    pub async fn update_many(&self, filter: Document, update: Document) -> Result<UpdateResult> {
        self.update_many_with_options(filter, update, None).await
    }

    /// Update every matching document with options.
    pub async fn update_many_with_options(
        &self,
        filter: Document,
        update: Document,
        options: impl Into<Option<UpdateOptions>>,
    ) -> Result<UpdateResult> {
        self.update("update_many", filter, update, options.into()).await
    }

    /// Replace a single document.
    pub async fn replace_one(&self, filter: Document, replacement: Document) -> Result<UpdateResult> {
        self.update("replace_one", filter, replacement, None).await
    }

    async fn update(
        &self,
        operation: &str,
        filter: Document,
        update: Document,
        options: Option<UpdateOptions>,
    ) -> Result<UpdateResult> {
        let kwargs = options.unwrap_or_default().into_kwargs();
        let result = self
            .result_document(
                operation,
                vec![Bson::Document(filter), Bson::Document(update)],
                kwargs,
            )
            .await?;
        Ok(UpdateResult {
            matched_count: count_field(operation, &result, "matched_count")?,
            modified_count: count_field(operation, &result, "modified_count")?,
            upserted_id: field(&result, "upserted_id")
                .filter(|id| !matches!(id, Bson::Null))
                .cloned(),
        })
    }

    /// Delete a single document.
    pub async fn delete_one(&self, filter: Document) -> Result<DeleteResult> {
        self.delete("delete_one", filter).await
    }

    /// Delete every matching document.
    pub async fn delete_many(&self, filter: Document) -> Result<DeleteResult> {
        self.delete("delete_many", filter).await
    }

    async fn delete(&self, operation: &str, filter: Document) -> Result<DeleteResult> {
        let result = self
            .result_document(operation, vec![Bson::Document(filter)], Kwargs::new())
            .await?;
        Ok(DeleteResult {
            deleted_count: count_field(operation, &result, "deleted_count")?,
        })
    }

    /// Count documents matching a filter.
    pub async fn count_documents(&self, filter: impl Into<Option<Document>>) -> Result<u64> {
        let filter = filter.into().unwrap_or_default();
        let value = self
            .value("count_documents", vec![Bson::Document(filter)], Kwargs::new())
            .await?;
        proxy::expect_count("count_documents", value)
    }

    /// Estimate the number of documents from collection metadata.
    pub async fn estimated_document_count(&self) -> Result<u64> {
        let value = self
            .value("estimated_document_count", Args::new(), Kwargs::new())
            .await?;
        proxy::expect_count("estimated_document_count", value)
    }

    /// Distinct values of a field.
    pub async fn distinct(&self, key: &str, filter: impl Into<Option<Document>>) -> Result<Vec<Bson>> {
        let mut args = vec![Bson::from(key)];
        if let Some(filter) = filter.into() {
            args.push(Bson::Document(filter));
        }
        match self.value("distinct", args, Kwargs::new()).await? {
            Bson::Array(values) => Ok(values),
            other => Err(ProxyError::protocol(
                "distinct",
                format!("expected an array, got {:?}", other.element_type()),
            )),
        }
    }

    /// Run an aggregation pipeline.
    pub async fn aggregate(&self, pipeline: impl IntoIterator<Item = Document>) -> Result<CommandCursor> {
        let pipeline = Bson::Array(pipeline.into_iter().map(Bson::Document).collect());
        let reply = self.forward("aggregate", vec![pipeline], Kwargs::new()).await?;
        self.cursor("aggregate", reply)
    }

    /// Watch this collection for changes.
    pub async fn watch(&self, pipeline: impl Into<Option<Vec<Document>>>) -> Result<ChangeStream> {
        let seed = self
            .forward("watch", pipeline_args(pipeline.into()), Kwargs::new())
            .await?
            .into_stream("watch")?;
        Ok(ChangeStream::new(self.dispatcher().clone(), &self.route(), seed))
    }

    /// Create an index and return its name.
    pub async fn create_index(&self, keys: Document) -> Result<String> {
        match self.value("create_index", vec![Bson::Document(keys)], Kwargs::new()).await? {
            Bson::String(name) => Ok(name),
            other => Err(ProxyError::protocol(
                "create_index",
                format!("expected an index name, got {:?}", other.element_type()),
            )),
        }
    }

    /// Drop an index by name.
    pub async fn drop_index(&self, index_name: &str) -> Result<()> {
        self.value("drop_index", vec![Bson::from(index_name)], Kwargs::new())
            .await?;
        Ok(())
    }

    /// List the indexes of this collection.
    pub async fn list_indexes(&self) -> Result<CommandCursor> {
        let reply = self.forward("list_indexes", Args::new(), Kwargs::new()).await?;
        self.cursor("list_indexes", reply)
    }

    /// Drop this collection.
    pub async fn drop(&self) -> Result<()> {
        self.value("drop", Args::new(), Kwargs::new()).await?;
        Ok(())
    }

    /// Call any `Collection` operation by name.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let doc = users
    ///     .invoke("find_one_and_delete", vec![doc! { "name": "John" }.into()], doc! {})
    ///     .await?
    ///     .into_value();
    /// ```
    pub async fn invoke(&self, operation: &str, args: Args, kwargs: Kwargs) -> Result<Outcome> {
        match proxy::resolve(self, operation, &args, &kwargs)? {
            Resolved::Generated => self.forward_outcome(operation, args, kwargs).await,
            Resolved::Overridden => match operation {
                "name" => Ok(Outcome::Value(Bson::String(self.name().to_string()))),
                "full_name" => Ok(Outcome::Value(Bson::String(self.full_name().to_string()))),
                "database" => Ok(Outcome::Database(self.database.clone())),
                "with_options" => Ok(Outcome::Collection(self.clone())),
                "codec_options" | "read_concern" | "read_preference" | "write_concern" => {
                    Ok(Outcome::Value(Bson::Null))
                }
                other => Err(ProxyError::usage(
                    other,
                    format!("Collection has no operation `{}`", other),
                )),
            },
        }
    }
}

fn field<'a>(result: &'a Document, name: &str) -> Option<&'a Bson> {
    result.get(name)
}

fn count_field(operation: &str, result: &Document, name: &str) -> Result<u64> {
    match field(result, name) {
        Some(value) => proxy::expect_count(operation, value.clone()),
        None => Ok(0),
    }
}

#[async_trait]
impl Proxy for Collection {
    fn proxy_type(&self) -> &'static ProxyType {
        proxy_type()
    }

    fn route(&self) -> Route {
        Route::new(Target::Collection)
            .database(self.database.name())
            .collection(self.name())
    }

    fn dispatcher(&self) -> &Dispatcher {
        self.database.dispatcher()
    }
}

impl PartialEq for Collection {
    fn eq(&self, other: &Self) -> bool {
        self.database.ptr_eq(&other.database) && self.name == other.name
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("full_name", &self.full_name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Client, ClientOptions};
    use crate::testing::MockTransport;
    use bson::doc;
    use pretty_assertions::assert_eq;

    fn users(transport: Arc<MockTransport>) -> Collection {
        Client::with_transport("https://api.example/rpc", b"k".to_vec(), ClientOptions::default(), transport)
            .unwrap()
            .get_database("app")
            .unwrap()
            .get_collection("users")
            .unwrap()
    }

    fn value(payload: serde_json::Value) -> serde_json::Value {
        serde_json::json!({ "kind": "value", "payload": payload })
    }

    #[tokio::test]
    async fn test_insert_one() {
        let transport = MockTransport::new();
        transport.respond("insert_one", value(serde_json::json!({ "inserted_id": 7 })));
        let users = users(transport.clone());

        let result = users.insert_one(doc! { "name": "John" }).await.unwrap();
        assert_eq!(result.inserted_id, Bson::Int32(7));

        let sent = &transport.requests()[0];
        assert_eq!(sent.body.args, vec![serde_json::json!({ "name": "John" })]);
        assert_eq!(
            sent.body.context,
            Route::new(Target::Collection).database("app").collection("users")
        );
    }

    #[tokio::test]
    async fn test_find_with_options_forwards_kwargs() {
        let transport = MockTransport::new();
        transport.respond(
            "find",
            serde_json::json!({ "kind": "cursor", "payload": { "cursor_id": null, "batch": [{ "name": "a" }] } }),
        );
        let users = users(transport.clone());

        let options = FindOptions::builder().limit(5).sort(doc! { "name": 1 }).build();
        let docs = users
            .find_with_options(doc! { "active": true }, options)
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(docs, vec![doc! { "name": "a" }]);

        let sent = &transport.requests()[0];
        assert_eq!(sent.body.args, vec![serde_json::json!({ "active": true })]);
        let keys: Vec<_> = sent.body.kwargs.keys().cloned().collect();
        assert_eq!(keys, vec!["limit".to_string(), "sort".to_string()]);
    }

    #[tokio::test]
    async fn test_find_rejects_oversized_skip() {
        let transport = MockTransport::new();
        let users = users(transport.clone());

        let options = FindOptions::builder().skip(u64::MAX).build();
        let err = users.find_with_options(doc! {}, options).await.unwrap_err();
        assert!(err.is_usage_error());
        assert_eq!(err.operation_name(), Some("find"));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_find_one_none() {
        let transport = MockTransport::new();
        let users = users(transport);
        assert_eq!(users.find_one(None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_update_and_delete_results() {
        let transport = MockTransport::new();
        transport.respond(
            "update_one",
            value(serde_json::json!({ "matched_count": 1, "modified_count": 1, "upserted_id": null })),
        );
        transport.respond("delete_many", value(serde_json::json!({ "deleted_count": 3 })));
        let users = users(transport.clone());

        let options = UpdateOptions::builder().upsert(true).build();
        let updated = users
            .update_one_with_options(doc! { "_id": 1 }, doc! { "$set": { "x": 1 } }, options)
            .await
            .unwrap();
        assert_eq!(
            updated,
            UpdateResult {
                matched_count: 1,
                modified_count: 1,
                upserted_id: None
            }
        );
        assert_eq!(
            transport.requests()[0].body.kwargs.get("upsert"),
            Some(&serde_json::json!(true))
        );

        let deleted = users.delete_many(doc! {}).await.unwrap();
        assert_eq!(deleted.deleted_count, 3);
    }

    #[tokio::test]
    async fn test_count_documents() {
        let transport = MockTransport::new();
        transport.respond("count_documents", value(serde_json::json!(42)));
        let users = users(transport.clone());

        assert_eq!(users.count_documents(None).await.unwrap(), 42);
        assert_eq!(transport.requests()[0].body.args, vec![serde_json::json!({})]);
    }

    #[tokio::test]
    async fn test_unexpected_reply_shape() {
        let transport = MockTransport::new();
        transport.respond("count_documents", value(serde_json::json!("many")));
        let users = users(transport);

        let err = users.count_documents(doc! {}).await.unwrap_err();
        assert!(err.is_protocol_error());
    }

    #[tokio::test]
    async fn test_invoke_generated_and_local() {
        let transport = MockTransport::new();
        let users = users(transport.clone());

        let full_name = users.invoke("full_name", vec![], doc! {}).await.unwrap();
        assert_eq!(full_name.into_value(), Some(Bson::String("app.users".into())));
        let db = users.invoke("database", vec![], doc! {}).await.unwrap().into_database().unwrap();
        assert!(db.ptr_eq(users.database()));
        assert!(transport.requests().is_empty());

        users
            .invoke("rename", vec![Bson::from("people")], doc! { "dropTarget": true })
            .await
            .unwrap();
        assert_eq!(transport.calls("rename"), 1);

        let err = users
            .invoke("insert_one", vec![], doc! { "bypass_document_validation": true })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing required argument `document`"));
        assert_eq!(transport.requests().len(), 1);
    }

    #[test]
    fn test_collection_equality() {
        let transport = MockTransport::new();
        let client = Client::with_transport("https://api.example/rpc", b"k".to_vec(), ClientOptions::default(), transport)
            .unwrap();
        let a = client.get_database("app").unwrap().get_collection("users").unwrap();
        let b = client.get("app").unwrap().get_collection("users").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, client.get_database("app").unwrap().get_collection("orders").unwrap());
    }
}
