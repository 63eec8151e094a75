//! Server module - the reactive query service.
//!
//! Provides:
//! - ndjson wire protocol over TCP
//! - query/mutation action definitions and validators
//! - the subscription multiplexer (dedup, lifecycle, fan-out)
//! - connection and accept loops

pub mod action;
pub mod fingerprint;
pub mod mux;
pub mod proto;
pub mod run;

mod connection;

pub use action::{
    Action, ActionMap, EndpointFactory, JsonType, Mutation, ObjectSchema, Query, QueryOutcome,
    ValidationError, Validator,
};
pub use fingerprint::fingerprint;
pub use mux::Mux;
pub use proto::{ClientFrame, ProtoError, ServerFrame, decode_frame, encode_frame};
pub use run::{Server, ServerHandle, run};
