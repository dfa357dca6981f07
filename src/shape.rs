//! Reference shapes of the driver types the proxies stand in for.
//!
//! Each shape is a static table of the public operations a native driver type
//! exposes: the operation name, its parameter list written the way the driver
//! documents it, and the first lines of its documentation. The proxy factory
//! turns these tables into forwarding bindings, so keeping a proxy in step with
//! the driver means editing a table here and nothing else.
//!
//! Signature syntax: `name` is a required positional parameter, `name=default`
//! an optional one, a bare `*` starts keyword-only parameters, `*name` collects
//! extra positionals and `**name` collects extra keywords.

/// Whether an operation is called or read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// A callable method.
    Method,
    /// A read-only attribute.
    Property,
}

/// One public operation of a reference type.
#[derive(Debug, Clone, Copy)]
pub struct OperationSpec {
    /// Operation name as the driver spells it.
    pub name: &'static str,
    /// Method or property.
    pub kind: OperationKind,
    /// Parameter list, without the receiver.
    pub signature: &'static str,
    /// Documentation text.
    pub doc: &'static str,
}

/// The public surface of a reference type.
#[derive(Debug)]
pub struct ApiShape {
    /// Name of the reference type.
    pub type_name: &'static str,
    /// Every operation the type exposes, private ones included.
    pub operations: &'static [OperationSpec],
}

macro_rules! operation_kind {
    (method) => {
        OperationKind::Method
    };
    (property) => {
        OperationKind::Property
    };
}

macro_rules! api_shape {
    (
        $(#[$meta:meta])*
        $vis:vis static $ident:ident: $type_name:literal {
            $(
                $(#[doc = $doc:literal])*
                $kind:ident $name:ident $sig:literal;
            )*
        }
    ) => {
        $(#[$meta])*
        $vis static $ident: ApiShape = ApiShape {
            type_name: $type_name,
            operations: &[
                $(
                    OperationSpec {
                        name: stringify!($name),
                        kind: operation_kind!($kind),
                        signature: $sig,
                        doc: concat!($($doc, "\n",)* ""),
                    },
                )*
            ],
        };
    };
}

api_shape! {
    /// `MongoClient`.
    pub static MONGO_CLIENT: "MongoClient" {
        /// (host, port) of the current standalone, primary, or mongos.
        property address "";
        /// Arbiters in the replica set.
        property arbiters "";
        /// Cleanup client resources and disconnect from MongoDB.
        method close "";
        /// Read only access to the CodecOptions of this instance.
        property codec_options "";
        /// Drop a database.
        method drop_database "name_or_database, session=None, comment=None";
        /// Get a Database with the given name and options.
        method get_database "name=None, codec_options=None, read_preference=None, write_concern=None, read_concern=None";
        /// Get the database named in the MongoDB connection URI.
        method get_default_database "default=None, codec_options=None, read_preference=None, write_concern=None, read_concern=None";
        /// If this client is connected to mongos.
        property is_mongos "";
        /// If this client is connected to a server that can accept writes.
        property is_primary "";
        /// Get a list of the names of all databases on the connected server.
        method list_database_names "session=None, comment=None";
        /// Get a cursor over the databases of the connected server.
        method list_databases "session=None, comment=None, **kwargs";
        /// Set of all currently connected servers.
        property nodes "";
        /// The configuration options for this client.
        property options "";
        /// The (host, port) of the current primary of the replica set.
        property primary "";
        /// Read only access to the read concern of this instance.
        property read_concern "";
        /// Read only access to the read preference of this instance.
        property read_preference "";
        /// The secondary members known to this client.
        property secondaries "";
        /// Get information about the MongoDB server we're connected to.
        method server_info "session=None";
        /// Start a logical session.
        method start_session "causal_consistency=None, default_transaction_options=None, snapshot=False";
        /// The description of the connected MongoDB deployment.
        property topology_description "";
        /// Watch changes on this cluster.
        method watch "pipeline=None, full_document=None, resume_after=None, max_await_time_ms=None, batch_size=None, collation=None, start_at_operation_time=None, session=None, start_after=None, comment=None, full_document_before_change=None, show_expanded_events=None";
        /// Read only access to the write concern of this instance.
        property write_concern "";
        method _get_topology "";
        method _server_property "attr_name";
    }
}

api_shape! {
    /// `Database`.
    pub static DATABASE: "Database" {
        /// Perform a database-level aggregation.
        method aggregate "pipeline, session=None, **kwargs";
        /// The client instance for this Database.
        property client "";
        /// Read only access to the CodecOptions of this instance.
        property codec_options "";
        /// Issue a MongoDB command.
        method command "command, value=1, check=True, allowable_errors=None, read_preference=None, codec_options=None, session=None, comment=None, **kwargs";
        /// Create a new Collection in this database.
        method create_collection "name, codec_options=None, read_preference=None, write_concern=None, read_concern=None, session=None, check_exists=True, **kwargs";
        /// Dereference a DBRef, getting the document it points to.
        method dereference "dbref, session=None, comment=None, **kwargs";
        /// Drop a collection.
        method drop_collection "name_or_collection, session=None, comment=None, encrypted_fields=None";
        /// Get a Collection with the given name and options.
        method get_collection "name, codec_options=None, read_preference=None, write_concern=None, read_concern=None";
        /// Get a list of all the collection names in this database.
        method list_collection_names "session=None, filter=None, comment=None, **kwargs";
        /// Get a cursor over the collections of this database.
        method list_collections "session=None, filter=None, comment=None, **kwargs";
        /// The name of this Database.
        property name "";
        /// Read only access to the read concern of this instance.
        property read_concern "";
        /// Read only access to the read preference of this instance.
        property read_preference "";
        /// Validate a collection.
        method validate_collection "name_or_collection, scandata=False, full=False, session=None, background=None, comment=None";
        /// Watch changes on this database.
        method watch "pipeline=None, full_document=None, resume_after=None, max_await_time_ms=None, batch_size=None, collation=None, start_at_operation_time=None, session=None, start_after=None, comment=None, full_document_before_change=None, show_expanded_events=None";
        /// Get a clone of this database changing the specified settings.
        method with_options "codec_options=None, read_preference=None, write_concern=None, read_concern=None";
        /// Read only access to the write concern of this instance.
        property write_concern "";
        method _command "conn, command, value=1, check=True, allowable_errors=None, read_preference=None, codec_options=None, write_concern=None, parse_write_concern_error=False, session=None, **kwargs";
    }
}

api_shape! {
    /// `Collection`.
    pub static COLLECTION: "Collection" {
        /// Perform an aggregation using the aggregation framework on this collection.
        method aggregate "pipeline, session=None, let=None, comment=None, **kwargs";
        /// Send a batch of write operations to the server.
        method bulk_write "requests, ordered=True, bypass_document_validation=False, session=None, comment=None, let=None";
        /// Count the number of documents in this collection.
        method count_documents "filter, session=None, comment=None, **kwargs";
        /// Creates an index on this collection.
        method create_index "keys, session=None, comment=None, **kwargs";
        /// Create one or more indexes on this collection.
        method create_indexes "indexes, session=None, comment=None, **kwargs";
        /// The Database that this Collection is a part of.
        property database "";
        /// Delete one or more documents matching the filter.
        method delete_many "filter, collation=None, hint=None, session=None, let=None, comment=None";
        /// Delete a single document matching the filter.
        method delete_one "filter, collation=None, hint=None, session=None, let=None, comment=None";
        /// Get a list of distinct values for key among all documents in this collection.
        method distinct "key, filter=None, session=None, comment=None, **kwargs";
        /// Alias for drop_collection.
        method drop "session=None, comment=None, encrypted_fields=None";
        /// Drops the specified index on this collection.
        method drop_index "index_or_name, session=None, comment=None, **kwargs";
        /// Drops all indexes on this collection.
        method drop_indexes "session=None, comment=None, **kwargs";
        /// Get an estimate of the number of documents in this collection using collection metadata.
        method estimated_document_count "comment=None, **kwargs";
        /// Query the database.
        method find "*args, **kwargs";
        /// Get a single document from the database.
        method find_one "filter=None, *args, **kwargs";
        /// Finds a single document and deletes it, returning the document.
        method find_one_and_delete "filter, projection=None, sort=None, hint=None, session=None, let=None, comment=None, **kwargs";
        /// Finds a single document and replaces it, returning either the original or the replaced document.
        method find_one_and_replace "filter, replacement, projection=None, sort=None, upsert=False, return_document=False, hint=None, session=None, let=None, comment=None, **kwargs";
        /// Finds a single document and updates it, returning either the original or the updated document.
        method find_one_and_update "filter, update, projection=None, sort=None, upsert=False, return_document=False, array_filters=None, hint=None, session=None, let=None, comment=None, **kwargs";
        /// The full name of this Collection.
        property full_name "";
        /// Get information on this collection's indexes.
        method index_information "session=None, comment=None";
        /// Insert an iterable of documents.
        method insert_many "documents, ordered=True, bypass_document_validation=False, session=None, comment=None";
        /// Insert a single document.
        method insert_one "document, bypass_document_validation=False, session=None, comment=None";
        /// Get a cursor over the index documents for this collection.
        method list_indexes "session=None, comment=None";
        /// The name of this Collection.
        property name "";
        /// Get the options set on this collection.
        method options "session=None, comment=None";
        /// Rename this collection.
        method rename "new_name, session=None, comment=None, **kwargs";
        /// Replace a single document matching the filter.
        method replace_one "filter, replacement, upsert=False, bypass_document_validation=False, collation=None, hint=None, session=None, let=None, comment=None";
        /// Update one or more documents that match the filter.
        method update_many "filter, update, upsert=False, array_filters=None, bypass_document_validation=None, collation=None, hint=None, session=None, let=None, comment=None";
        /// Update a single document matching the filter.
        method update_one "filter, update, upsert=False, bypass_document_validation=False, collation=None, array_filters=None, hint=None, session=None, let=None, comment=None";
        /// Watch changes on this collection.
        method watch "pipeline=None, full_document=None, resume_after=None, max_await_time_ms=None, batch_size=None, collation=None, start_at_operation_time=None, session=None, start_after=None, comment=None, full_document_before_change=None, show_expanded_events=None";
        /// Get a clone of this collection changing the specified settings.
        method with_options "codec_options=None, read_preference=None, write_concern=None, read_concern=None";
    }
}

api_shape! {
    /// `CommandCursor`.
    pub static COMMAND_CURSOR: "CommandCursor" {
        /// The (host, port) of the server used, or None.
        property address "";
        /// Does this cursor have the potential to return more data?
        property alive "";
        /// Limits the number of documents returned in one batch.
        method batch_size "batch_size";
        /// Explicitly close / kill this cursor.
        method close "";
        /// Returns the id of the cursor.
        property cursor_id "";
        /// Advance the cursor.
        method next "";
        /// The cursor's ClientSession, or None.
        property session "";
        /// Advance the cursor without blocking indefinitely.
        method try_next "";
    }
}

api_shape! {
    /// `ChangeStream`.
    pub static CHANGE_STREAM: "ChangeStream" {
        /// Does this cursor have the potential to return more data?
        property alive "";
        /// Close this ChangeStream.
        method close "";
        /// Advance the cursor.
        method next "";
        /// The cached resume token that will be used to resume after the most recently returned change.
        property resume_token "";
        /// Advance the cursor without blocking indefinitely.
        method try_next "";
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_operation_names() {
        let names: Vec<_> = MONGO_CLIENT.operations.iter().map(|op| op.name).collect();
        assert!(names.contains(&"get_database"));
        assert!(names.contains(&"list_databases"));
        assert!(names.contains(&"_get_topology"));
    }

    #[test]
    fn test_shape_docs_are_captured() {
        let op = DATABASE
            .operations
            .iter()
            .find(|op| op.name == "list_collections")
            .unwrap();
        assert_eq!(op.doc.trim(), "Get a cursor over the collections of this database.");
        assert_eq!(op.kind, OperationKind::Method);
    }

    #[test]
    fn test_undocumented_operation_has_empty_doc() {
        let op = MONGO_CLIENT
            .operations
            .iter()
            .find(|op| op.name == "_get_topology")
            .unwrap();
        assert!(op.doc.is_empty());
    }

    #[test]
    fn test_properties_take_no_parameters() {
        for shape in [&MONGO_CLIENT, &DATABASE, &COLLECTION, &COMMAND_CURSOR, &CHANGE_STREAM] {
            for op in shape.operations {
                if op.kind == OperationKind::Property {
                    assert!(op.signature.is_empty(), "{}.{}", shape.type_name, op.name);
                }
            }
        }
    }
}
