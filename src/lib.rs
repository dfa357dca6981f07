//! # mongo-proxy
//!
//! A MongoDB-driver-compatible client whose operations run on a remote,
//! authenticated HTTP API instead of a database socket.
//!
//! Application code keeps the driver's object model (client, database,
//! collection, cursor, change stream), the driver's operation names and its
//! parameter lists. Each call is captured as an operation name with
//! positional and keyword arguments, posted to the configured endpoint, and
//! the response comes back as a value or as a new cursor or change stream.
//!
//! ## Features
//!
//! - Proxy types generated from the driver's public surface, with argument
//!   checking against the mirrored signatures
//! - Cached database handles with reference identity
//! - Command cursors and change streams backed by remote state
//! - Sessions and topology introspection answered locally
//! - Pluggable transport and value codec
//!
//! ## Quick Start
//!
//! ```ignore
//! use mongo_proxy::{Client, bson::doc};
//!
//! #[tokio::main]
//! async fn main() -> mongo_proxy::Result<()> {
//!     let client = Client::new("https://api.example/rpc", b"secret".to_vec())?;
//!
//!     // Get a database and collection
//!     let db = client.get_database("mydb")?;
//!     let users = db.get_collection("users")?;
//!
//!     // Insert a document
//!     users.insert_one(doc! { "name": "John", "email": "john@example.com" }).await?;
//!
//!     // Find documents
//!     let cursor = users.find(doc! { "name": "John" }).await?;
//!     let results = cursor.collect().await?;
//!
//!     // Anything else the driver offers goes through `invoke`
//!     let renamed = users
//!         .invoke("find_one_and_update", vec![
//!             doc! { "email": "john@example.com" }.into(),
//!             doc! { "$set": { "name": "Jane" } }.into(),
//!         ], doc! {})
//!         .await?;
//!
//!     client.close();
//!     Ok(())
//! }
//! ```

pub mod change_stream;
pub mod client;
pub mod codec;
pub mod collection;
pub mod cursor;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod proxy;
pub mod shape;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-export main types
pub use change_stream::{ChangeStream, CloseHandle, ClusterChangeStream, StreamState};
pub use client::{Client, ClientOptions, ClientOptionsBuilder, ClientSession, MongoClient, ServerAddress};
pub use codec::{BsonCodec, ValueCodec};
pub use collection::{
    Collection, DeleteResult, FindOptions, FindOptionsBuilder, InsertManyResult, InsertOneResult,
    UpdateOptions, UpdateOptionsBuilder, UpdateResult,
};
pub use cursor::{CommandCursor, CursorState};
pub use db::Database;
pub use dispatch::{Args, Kwargs, Reply, RequestEnvelope, Route, Target, DEFAULT_CHANGE_STREAM_TIMEOUT};
pub use error::{ErrorKind, ProxyError, Result};
pub use proxy::{Outcome, Proxy, ProxyFactory, ProxyType};
pub use transport::{HttpTransport, OutboundRequest, Transport, TransportError};

// Re-export bson for convenience
pub use bson;
pub use bson::doc;

/// Prelude module for common imports.
pub mod prelude {
    pub use super::change_stream::{ChangeStream, ClusterChangeStream};
    pub use super::client::{Client, ClientOptions, MongoClient};
    pub use super::collection::{
        Collection, DeleteResult, FindOptions, InsertManyResult, InsertOneResult, UpdateOptions,
        UpdateResult,
    };
    pub use super::cursor::CommandCursor;
    pub use super::db::Database;
    pub use super::error::{ErrorKind, ProxyError, Result};
    pub use super::proxy::{Outcome, Proxy};
    pub use bson::{doc, Bson, Document};
}

/// Get the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(version(), "0.1.0");
    }

    #[test]
    fn test_prelude_imports() {
        use crate::prelude::*;

        let _: Result<()> = Ok(());
        let _doc = doc! { "test": 1 };
        let _ = ErrorKind::Usage;
    }

    #[test]
    fn test_every_shape_generates_cleanly() {
        for shape in [
            &shape::MONGO_CLIENT,
            &shape::DATABASE,
            &shape::COLLECTION,
            &shape::COMMAND_CURSOR,
            &shape::CHANGE_STREAM,
        ] {
            let proxy_type = ProxyFactory::new(shape).build();
            assert!(proxy_type.skipped().is_empty(), "{}", shape.type_name);
            assert!(proxy_type.operations().iter().all(|name| !name.starts_with('_')));
        }
    }
}
