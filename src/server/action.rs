//! Action definitions: queries, mutations, and validators.
//!
//! An endpoint is a named map of actions, built once per connection by
//! the user-supplied factory so session-scoped stores created inside it
//! bind to that connection.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::reactive::{Cache, ComputeError, Derived, SessionStore, Source, Store, Update};

/// Rejected params.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ValidationError {
    pub message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Pluggable params validator.
///
/// Applied once to the raw params at subscribe/mutation time; the output
/// replaces the raw value everywhere downstream, including fingerprinting.
pub trait Validator: Send + Sync {
    fn parse(&self, raw: Value) -> Result<Value, ValidationError>;
}

/// Expected JSON shape of one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonType {
    String,
    Number,
    Bool,
    Array,
    Object,
}

impl JsonType {
    fn matches(self, value: &Value) -> bool {
        match self {
            JsonType::String => value.is_string(),
            JsonType::Number => value.is_number(),
            JsonType::Bool => value.is_boolean(),
            JsonType::Array => value.is_array(),
            JsonType::Object => value.is_object(),
        }
    }

    fn name(self) -> &'static str {
        match self {
            JsonType::String => "string",
            JsonType::Number => "number",
            JsonType::Bool => "bool",
            JsonType::Array => "array",
            JsonType::Object => "object",
        }
    }
}

/// Reference validator: an object with typed fields.
///
/// Unknown fields pass through untouched; declared fields must match
/// their type, and required fields must be present.
#[derive(Default)]
pub struct ObjectSchema {
    fields: Vec<SchemaField>,
}

struct SchemaField {
    name: String,
    ty: JsonType,
    required: bool,
}

impl ObjectSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, ty: JsonType) -> Self {
        self.fields.push(SchemaField {
            name: name.into(),
            ty,
            required: true,
        });
        self
    }

    pub fn optional(mut self, name: impl Into<String>, ty: JsonType) -> Self {
        self.fields.push(SchemaField {
            name: name.into(),
            ty,
            required: false,
        });
        self
    }
}

impl Validator for ObjectSchema {
    fn parse(&self, raw: Value) -> Result<Value, ValidationError> {
        let Value::Object(map) = &raw else {
            return Err(ValidationError::new("params must be an object"));
        };
        for field in &self.fields {
            match map.get(&field.name) {
                Some(value) if field.ty.matches(value) => {}
                Some(_) => {
                    return Err(ValidationError::new(format!(
                        "field \"{}\" must be a {}",
                        field.name,
                        field.ty.name()
                    )));
                }
                None if field.required => {
                    return Err(ValidationError::new(format!(
                        "missing required field \"{}\"",
                        field.name
                    )));
                }
                None => {}
            }
        }
        Ok(raw)
    }
}

type ParamsFn = Arc<dyn Fn(Value) -> Update + Send + Sync>;

/// A subscribable action. Invoking it yields a live result (a shared
/// derived computation) or a plain immediate value.
pub struct Query {
    validator: Option<Arc<dyn Validator>>,
    kind: QueryKind,
}

enum QueryKind {
    Reactive {
        deps: Vec<Arc<dyn Source>>,
        cache: Cache,
        debounce: Option<Duration>,
        compute: ParamsFn,
    },
    Immediate {
        compute: ParamsFn,
    },
}

/// What invoking a query produced.
pub enum QueryOutcome {
    Live(Derived),
    Value(Value),
}

impl Query {
    /// A live query: re-runs whenever a dependency fires. The last value
    /// is kept while the computation is alive so late subscribers join
    /// without a recompute; override with [`Query::cache`].
    pub fn live(compute: impl Fn(Value) -> Update + Send + Sync + 'static) -> Self {
        Self {
            validator: None,
            kind: QueryKind::Reactive {
                deps: Vec::new(),
                cache: Cache::Keep,
                debounce: None,
                compute: Arc::new(compute),
            },
        }
    }

    /// A one-shot query: computes a plain value, no subscription.
    pub fn immediate(compute: impl Fn(Value) -> Update + Send + Sync + 'static) -> Self {
        Self {
            validator: None,
            kind: QueryKind::Immediate {
                compute: Arc::new(compute),
            },
        }
    }

    /// A live view over a global store: the store's current value is the
    /// result and the store is a dependency.
    pub fn from_store<T>(store: Store<T>) -> Self
    where
        T: Serialize + Clone + Send + Sync + 'static,
    {
        let reader = store.clone();
        Self::live(move |_| to_json(&reader.get())).deps(vec![Arc::new(store)])
    }

    /// A live view over a session store; resolves the subscriber's own
    /// session slot.
    pub fn from_session_store<T>(store: SessionStore<T>) -> Self
    where
        T: Serialize + Clone + Send + Sync + 'static,
    {
        let reader = store.clone();
        Self::live(move |_| to_json(&reader.get()?)).deps(vec![Arc::new(store)])
    }

    pub fn validator(mut self, validator: impl Validator + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Merge additional dependencies. Ignored for immediate queries.
    pub fn deps(mut self, extra: Vec<Arc<dyn Source>>) -> Self {
        if let QueryKind::Reactive { deps, .. } = &mut self.kind {
            deps.extend(extra);
        }
        self
    }

    /// Ignored for immediate queries.
    pub fn cache(mut self, cache: Cache) -> Self {
        if let QueryKind::Reactive { cache: slot, .. } = &mut self.kind {
            *slot = cache;
        }
        self
    }

    /// Ignored for immediate queries.
    pub fn debounce(mut self, window: Duration) -> Self {
        if let QueryKind::Reactive { debounce, .. } = &mut self.kind {
            *debounce = Some(window);
        }
        self
    }

    pub(crate) fn validator_ref(&self) -> Option<&Arc<dyn Validator>> {
        self.validator.as_ref()
    }

    /// Instantiate for one set of validated params.
    pub(crate) fn instantiate(&self, params: Value) -> Result<QueryOutcome, ComputeError> {
        match &self.kind {
            QueryKind::Immediate { compute } => Ok(QueryOutcome::Value(compute(params)?)),
            QueryKind::Reactive {
                deps,
                cache,
                debounce,
                compute,
            } => {
                let compute = Arc::clone(compute);
                let derived = Derived::new(
                    deps.clone(),
                    move || compute(params.clone()),
                    *cache,
                    *debounce,
                );
                Ok(QueryOutcome::Live(derived))
            }
        }
    }
}

/// A one-shot command: validates, executes, replies.
pub struct Mutation {
    validator: Option<Arc<dyn Validator>>,
    execute: ParamsFn,
}

impl Mutation {
    pub fn new(execute: impl Fn(Value) -> Update + Send + Sync + 'static) -> Self {
        Self {
            validator: None,
            execute: Arc::new(execute),
        }
    }

    pub fn validator(mut self, validator: impl Validator + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub(crate) fn validator_ref(&self) -> Option<&Arc<dyn Validator>> {
        self.validator.as_ref()
    }

    pub(crate) fn invoke(&self, params: Value) -> Update {
        (self.execute)(params)
    }
}

/// A named server operation.
pub enum Action {
    Query(Query),
    Mutation(Mutation),
}

/// The per-connection action set.
pub type ActionMap = BTreeMap<String, Action>;

/// Builds a connection's actions; invoked once per connection inside
/// that connection's session scope.
pub type EndpointFactory = Arc<dyn Fn() -> ActionMap + Send + Sync>;

/// Normalize raw wire params and apply the validator, if any.
pub(crate) fn validate_params(
    validator: Option<&Arc<dyn Validator>>,
    raw: Option<Value>,
) -> Result<Value, ValidationError> {
    let raw = match raw {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(value) => value,
    };
    match validator {
        Some(validator) => validator.parse(raw),
        None => Ok(raw),
    }
}

fn to_json<T: Serialize>(value: &T) -> Update {
    serde_json::to_value(value).map_err(|err| ComputeError::failed(err.to_string()))
}
