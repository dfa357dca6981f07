//! Proxy generation.
//!
//! A [`ProxyFactory`] takes an [`ApiShape`] and produces a [`ProxyType`]: one
//! binding per public operation of the reference type, each carrying the
//! mirrored signature and documentation. A generated binding checks a call
//! against the signature and forwards it, arguments untouched, to the
//! dispatcher. Concrete proxies register overrides for the operations they
//! implement by hand; an override always wins over the generated binding.

use crate::change_stream::ChangeStream;
use crate::client::Client;
use crate::collection::Collection;
use crate::cursor::CommandCursor;
use crate::db::Database;
use crate::dispatch::{Args, Dispatcher, Kwargs, OperationCall, Reply, Route};
use crate::error::{ProxyError, Result};
use crate::shape::{ApiShape, OperationKind, OperationSpec};
use async_trait::async_trait;
use bson::{Bson, Document};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

/// How a parameter receives its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// By position or by name.
    Positional,
    /// By name only.
    KeywordOnly,
    /// Collects surplus positional arguments.
    VarPositional,
    /// Collects surplus keyword arguments.
    VarKeyword,
}

/// One mirrored parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    /// Parameter name.
    pub name: String,
    /// How it is passed.
    pub kind: ParamKind,
    /// Default value as written in the reference signature.
    pub default: Option<String>,
}

impl Param {
    /// Whether a call must supply this parameter.
    pub fn is_required(&self) -> bool {
        self.default.is_none() && matches!(self.kind, ParamKind::Positional | ParamKind::KeywordOnly)
    }
}

/// Why a reference signature cannot be mirrored.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    /// Two commas with nothing between them.
    #[error("empty parameter")]
    EmptyParameter,
    /// Not a valid identifier.
    #[error("invalid parameter `{0}`")]
    InvalidParameter(String),
    /// The same name appears twice.
    #[error("duplicate parameter `{0}`")]
    Duplicate(String),
    /// A required positional parameter after an optional one.
    #[error("required parameter `{0}` follows an optional parameter")]
    RequiredAfterOptional(String),
    /// More than one `*` or `*name`.
    #[error("more than one variadic positional marker")]
    MultipleVarPositional,
    /// Anything after `**name`.
    #[error("parameter `{0}` follows the variadic keyword parameter")]
    AfterVarKeyword(String),
}

/// A parsed reference signature.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Signature {
    params: Vec<Param>,
}

impl Signature {
    /// Parse a signature written as `a, b=None, *args, c=1, **kwargs`.
    pub fn parse(text: &str) -> std::result::Result<Self, SignatureError> {
        let text = text.trim();
        let mut params: Vec<Param> = Vec::new();
        if text.is_empty() {
            return Ok(Self { params });
        }

        let mut keyword_only = false;
        let mut seen_optional = false;
        let mut seen_var_keyword = false;

        for raw in text.split(',') {
            let raw = raw.trim();
            if raw.is_empty() {
                return Err(SignatureError::EmptyParameter);
            }
            if seen_var_keyword {
                return Err(SignatureError::AfterVarKeyword(raw.to_string()));
            }

            let (kind, rest) = if let Some(rest) = raw.strip_prefix("**") {
                (ParamKind::VarKeyword, rest)
            } else if let Some(rest) = raw.strip_prefix('*') {
                (ParamKind::VarPositional, rest)
            } else if keyword_only {
                (ParamKind::KeywordOnly, raw)
            } else {
                (ParamKind::Positional, raw)
            };

            if kind == ParamKind::VarPositional {
                if keyword_only {
                    return Err(SignatureError::MultipleVarPositional);
                }
                keyword_only = true;
                // bare `*`
                if rest.is_empty() {
                    continue;
                }
            }

            let (name, default) = match rest.split_once('=') {
                Some((name, default)) => (name.trim(), Some(default.trim().to_string())),
                None => (rest.trim(), None),
            };
            let variadic = matches!(kind, ParamKind::VarPositional | ParamKind::VarKeyword);
            if !is_identifier(name) || (variadic && default.is_some()) {
                return Err(SignatureError::InvalidParameter(raw.to_string()));
            }
            if params.iter().any(|p| p.name == name) {
                return Err(SignatureError::Duplicate(name.to_string()));
            }
            if kind == ParamKind::Positional {
                if default.is_some() {
                    seen_optional = true;
                } else if seen_optional {
                    return Err(SignatureError::RequiredAfterOptional(name.to_string()));
                }
            }
            seen_var_keyword = kind == ParamKind::VarKeyword;

            params.push(Param {
                name: name.to_string(),
                kind,
                default,
            });
        }

        Ok(Self { params })
    }

    /// Mirrored parameters in declaration order.
    pub fn params(&self) -> &[Param] {
        &self.params
    }

    fn positional(&self) -> impl Iterator<Item = &Param> {
        self.params.iter().filter(|p| p.kind == ParamKind::Positional)
    }

    fn has(&self, kind: ParamKind) -> bool {
        self.params.iter().any(|p| p.kind == kind)
    }

    /// Check that `args` and `kwargs` fit this signature.
    pub fn bind(&self, operation: &str, args: &[Bson], kwargs: &Document) -> Result<()> {
        let positional: Vec<&Param> = self.positional().collect();

        if args.len() > positional.len() && !self.has(ParamKind::VarPositional) {
            return Err(ProxyError::usage(
                operation,
                format!(
                    "takes {} positional argument(s) but {} were given; signature is ({})",
                    positional.len(),
                    args.len(),
                    self
                ),
            ));
        }
        let filled = args.len().min(positional.len());

        for name in kwargs.keys() {
            let named = self.params.iter().find(|p| {
                p.name == *name && matches!(p.kind, ParamKind::Positional | ParamKind::KeywordOnly)
            });
            match named {
                Some(param) => {
                    let index = positional.iter().position(|p| p.name == param.name);
                    if matches!(index, Some(index) if index < filled) {
                        return Err(ProxyError::usage(
                            operation,
                            format!("got multiple values for argument `{}`", name),
                        ));
                    }
                }
                None if self.has(ParamKind::VarKeyword) => {}
                None => {
                    return Err(ProxyError::usage(
                        operation,
                        format!(
                            "got an unexpected keyword argument `{}`; signature is ({})",
                            name, self
                        ),
                    ))
                }
            }
        }

        let missing = self.params.iter().find(|p| {
            if !p.is_required() || kwargs.contains_key(&p.name) {
                return false;
            }
            match positional.iter().position(|q| q.name == p.name) {
                Some(index) => index >= filled,
                None => true,
            }
        });
        if let Some(param) = missing {
            return Err(ProxyError::usage(
                operation,
                format!("missing required argument `{}`", param.name),
            ));
        }

        Ok(())
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut star_written = self.has(ParamKind::VarPositional);
        let mut parts = Vec::with_capacity(self.params.len() + 1);
        for param in &self.params {
            let rendered = match param.kind {
                ParamKind::VarPositional => format!("*{}", param.name),
                ParamKind::VarKeyword => format!("**{}", param.name),
                ParamKind::Positional | ParamKind::KeywordOnly => {
                    if param.kind == ParamKind::KeywordOnly && !star_written {
                        parts.push("*".to_string());
                        star_written = true;
                    }
                    match &param.default {
                        Some(default) => format!("{}={}", param.name, default),
                        None => param.name.clone(),
                    }
                }
            };
            parts.push(rendered);
        }
        write!(f, "{}", parts.join(", "))
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Whether a name carries the privacy marker.
pub fn is_private(name: &str) -> bool {
    name.starts_with('_')
}

/// One operation of a generated proxy type.
#[derive(Debug, Clone)]
pub struct MirroredOperation {
    entry: &'static OperationSpec,
    signature: Signature,
    doc: String,
}

impl MirroredOperation {
    /// Operation name.
    pub fn name(&self) -> &'static str {
        self.entry.name
    }

    /// Method or property.
    pub fn kind(&self) -> OperationKind {
        self.entry.kind
    }

    /// Mirrored signature.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Mirrored documentation.
    pub fn doc(&self) -> &str {
        &self.doc
    }

    /// Check a call against the mirrored signature.
    pub fn bind(&self, args: &[Bson], kwargs: &Document) -> Result<()> {
        self.signature.bind(self.entry.name, args, kwargs)
    }
}

/// How a call to a proxy type is served.
#[derive(Debug, Clone, Copy)]
pub enum Binding<'a> {
    /// Generated forwarding stub.
    Generated(&'a MirroredOperation),
    /// Hand-written implementation, with the mirrored operation if the
    /// reference type has one.
    Overridden(Option<&'a MirroredOperation>),
}

/// The generated surface of one proxy kind.
#[derive(Debug)]
pub struct ProxyType {
    type_name: &'static str,
    operations: BTreeMap<&'static str, MirroredOperation>,
    overrides: BTreeSet<&'static str>,
    skipped: Vec<&'static str>,
}

impl ProxyType {
    /// Name of the reference type.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Every callable name: generated and overridden, sorted.
    pub fn operations(&self) -> Vec<&'static str> {
        let names: BTreeSet<_> = self
            .operations
            .keys()
            .chain(self.overrides.iter())
            .copied()
            .collect();
        names.into_iter().collect()
    }

    /// A mirrored operation by name.
    pub fn operation(&self, name: &str) -> Option<&MirroredOperation> {
        self.operations.get(name)
    }

    /// Mirrored documentation of an operation.
    pub fn doc(&self, name: &str) -> Option<&str> {
        self.operation(name).map(MirroredOperation::doc)
    }

    /// Whether `name` is implemented by hand.
    pub fn is_overridden(&self, name: &str) -> bool {
        self.overrides.contains(name)
    }

    /// Operations left out because their signature could not be mirrored.
    pub fn skipped(&self) -> &[&'static str] {
        &self.skipped
    }

    /// Resolve how `name` is served.
    pub fn binding(&self, name: &str) -> Result<Binding<'_>> {
        if self.overrides.contains(name) {
            return Ok(Binding::Overridden(self.operations.get(name)));
        }
        if let Some(operation) = self.operations.get(name) {
            return Ok(Binding::Generated(operation));
        }
        if is_private(name) {
            return Err(ProxyError::usage(
                name,
                format!("`{}` is private to {} and is not proxied", name, self.type_name),
            ));
        }
        Err(ProxyError::usage(
            name,
            format!("{} has no operation `{}`", self.type_name, name),
        ))
    }
}

/// Builds a [`ProxyType`] from a reference shape.
#[derive(Debug)]
pub struct ProxyFactory {
    shape: &'static ApiShape,
    overrides: BTreeSet<&'static str>,
}

impl ProxyFactory {
    /// Start generation from a reference shape.
    pub fn new(shape: &'static ApiShape) -> Self {
        Self {
            shape,
            overrides: BTreeSet::new(),
        }
    }

    /// Mark `name` as implemented by hand.
    pub fn override_operation(mut self, name: &'static str) -> Self {
        self.overrides.insert(name);
        self
    }

    /// Generate the proxy type.
    pub fn build(self) -> ProxyType {
        let mut operations = BTreeMap::new();
        let mut skipped = Vec::new();

        for entry in self.shape.operations {
            if is_private(entry.name) {
                tracing::trace!(
                    type_name = self.shape.type_name,
                    operation = entry.name,
                    "not mirroring private operation"
                );
                continue;
            }
            match Signature::parse(entry.signature) {
                Ok(signature) => {
                    let doc = entry
                        .doc
                        .lines()
                        .map(str::trim)
                        .collect::<Vec<_>>()
                        .join("\n")
                        .trim()
                        .to_string();
                    operations.insert(
                        entry.name,
                        MirroredOperation {
                            entry,
                            signature,
                            doc,
                        },
                    );
                }
                Err(error) => {
                    tracing::warn!(
                        type_name = self.shape.type_name,
                        operation = entry.name,
                        %error,
                        "skipping operation whose signature cannot be mirrored"
                    );
                    skipped.push(entry.name);
                }
            }
        }

        ProxyType {
            type_name: self.shape.type_name,
            operations,
            overrides: self.overrides,
            skipped,
        }
    }
}

/// What a proxied call produced.
#[derive(Debug)]
pub enum Outcome {
    /// A terminal value.
    Value(Bson),
    /// A result set.
    Cursor(CommandCursor),
    /// A change subscription.
    ChangeStream(ChangeStream),
    /// A database handle resolved locally.
    Database(Database),
    /// A collection handle resolved locally.
    Collection(Collection),
    /// The owning client, resolved locally.
    Client(Client),
}

impl Outcome {
    /// Turn a dispatcher reply into the matching proxy object.
    pub(crate) fn from_reply(reply: Reply, dispatcher: &Dispatcher, route: &Route) -> Self {
        match reply {
            Reply::Value(value) => Outcome::Value(value),
            Reply::Cursor(seed) => Outcome::Cursor(CommandCursor::new(dispatcher.clone(), route, seed)),
            Reply::Stream(seed) => {
                Outcome::ChangeStream(ChangeStream::new(dispatcher.clone(), route, seed))
            }
        }
    }

    /// The terminal value, if this is one.
    pub fn into_value(self) -> Option<Bson> {
        match self {
            Outcome::Value(value) => Some(value),
            _ => None,
        }
    }

    /// The cursor, if this is one.
    pub fn into_cursor(self) -> Option<CommandCursor> {
        match self {
            Outcome::Cursor(cursor) => Some(cursor),
            _ => None,
        }
    }

    /// The change stream, if this is one.
    pub fn into_change_stream(self) -> Option<ChangeStream> {
        match self {
            Outcome::ChangeStream(stream) => Some(stream),
            _ => None,
        }
    }

    /// The database handle, if this is one.
    pub fn into_database(self) -> Option<Database> {
        match self {
            Outcome::Database(db) => Some(db),
            _ => None,
        }
    }

    /// The collection handle, if this is one.
    pub fn into_collection(self) -> Option<Collection> {
        match self {
            Outcome::Collection(coll) => Some(coll),
            _ => None,
        }
    }

    /// The client, if this is one.
    pub fn into_client(self) -> Option<Client> {
        match self {
            Outcome::Client(client) => Some(client),
            _ => None,
        }
    }
}

/// Which path a resolved call takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolved {
    Generated,
    Overridden,
}

/// Shared behavior of every proxy object: generated operations all funnel
/// through [`forward`](Proxy::forward).
#[async_trait]
pub trait Proxy: Send + Sync {
    /// The generated surface of this proxy kind.
    fn proxy_type(&self) -> &'static ProxyType;

    /// Routing context for calls made on this object.
    fn route(&self) -> Route;

    /// The dispatcher of the owning client.
    fn dispatcher(&self) -> &Dispatcher;

    /// Forward a mirrored operation to the remote API.
    async fn forward(&self, operation: &str, args: Args, kwargs: Kwargs) -> Result<Reply> {
        let mirrored = self.proxy_type().operation(operation).ok_or_else(|| {
            ProxyError::usage(
                operation,
                format!("{} has no operation `{}`", self.proxy_type().type_name(), operation),
            )
        })?;
        mirrored.bind(&args, &kwargs)?;
        self.dispatcher()
            .dispatch(OperationCall::with_args(operation, args, kwargs), self.route())
            .await
    }

    /// Forward and wrap the reply into a proxy object.
    async fn forward_outcome(&self, operation: &str, args: Args, kwargs: Kwargs) -> Result<Outcome> {
        let reply = self.forward(operation, args, kwargs).await?;
        Ok(Outcome::from_reply(reply, self.dispatcher(), &self.route()))
    }
}

/// Resolve `operation` on `proxy` and check the arguments of a call that is
/// about to be served by an override.
pub(crate) fn resolve<P: Proxy + ?Sized>(
    proxy: &P,
    operation: &str,
    args: &[Bson],
    kwargs: &Document,
) -> Result<Resolved> {
    match proxy.proxy_type().binding(operation)? {
        Binding::Generated(_) => Ok(Resolved::Generated),
        Binding::Overridden(mirrored) => {
            if let Some(mirrored) = mirrored {
                mirrored.bind(args, kwargs)?;
            }
            Ok(Resolved::Overridden)
        }
    }
}

/// First string argument of a call, taken by position or by `name`.
pub(crate) fn string_arg<'a>(
    operation: &str,
    args: &'a [Bson],
    kwargs: &'a Document,
    name: &str,
) -> Result<Option<&'a str>> {
    let value = args.first().or_else(|| kwargs.get(name));
    match value {
        None | Some(Bson::Null) => Ok(None),
        Some(Bson::String(s)) => Ok(Some(s.as_str())),
        Some(other) => Err(ProxyError::usage(
            operation,
            format!("`{}` must be a string, got {:?}", name, other.element_type()),
        )),
    }
}

/// Expect a document value.
pub(crate) fn expect_document(operation: &str, value: Bson) -> Result<Document> {
    match value {
        Bson::Document(doc) => Ok(doc),
        other => Err(ProxyError::protocol(
            operation,
            format!("expected a document, got {:?}", other.element_type()),
        )),
    }
}

/// Expect a document or null.
pub(crate) fn expect_optional_document(operation: &str, value: Bson) -> Result<Option<Document>> {
    match value {
        Bson::Null => Ok(None),
        other => expect_document(operation, other).map(Some),
    }
}

/// Expect an array of strings.
pub(crate) fn expect_strings(operation: &str, value: Bson) -> Result<Vec<String>> {
    let Bson::Array(items) = value else {
        return Err(ProxyError::protocol(
            operation,
            format!("expected an array of names, got {:?}", value.element_type()),
        ));
    };
    items
        .into_iter()
        .map(|item| match item {
            Bson::String(s) => Ok(s),
            other => Err(ProxyError::protocol(
                operation,
                format!("expected a name, got {:?}", other.element_type()),
            )),
        })
        .collect()
}

/// Expect a non-negative count.
pub(crate) fn expect_count(operation: &str, value: Bson) -> Result<u64> {
    let count = match value {
        Bson::Int32(n) => i64::from(n),
        Bson::Int64(n) => n,
        Bson::Double(n) if n.fract() == 0.0 => n as i64,
        other => {
            return Err(ProxyError::protocol(
                operation,
                format!("expected a count, got {:?}", other.element_type()),
            ))
        }
    };
    u64::try_from(count)
        .map_err(|_| ProxyError::protocol(operation, format!("negative count {}", count)))
}
