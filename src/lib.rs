#![forbid(unsafe_code)]

pub mod adapters;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod error;
pub mod reactive;
pub mod server;
pub mod telemetry;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export core types at crate root for convenience
pub use crate::reactive::{
    Cache, ComputeError, Derived, Notifier, Scope, SessionError, SessionId, SessionStore, Source,
    Store, Subscription, Update, session,
};
pub use crate::server::{
    Action, ActionMap, EndpointFactory, JsonType, Mutation, ObjectSchema, Query, Server,
    ServerHandle, Validator, fingerprint,
};
