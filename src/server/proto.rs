//! Wire protocol types and codec.
//!
//! Protocol: newline-delimited JSON (ndjson) over a stream transport.
//!
//! Client frames: `{"type":"subscribe","name":...,"subId":...,"params":...}\n`
//! Server frames: `{"type":"update","name":...,"subId":...,"data":...}\n`

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::Limits;

/// Frames a client sends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    Subscribe {
        name: String,
        sub_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    Unsubscribe {
        name: String,
        sub_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    Mutation {
        name: String,
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
}

/// Frames the server sends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerFrame {
    #[serde(rename_all = "camelCase")]
    Update {
        name: String,
        sub_id: String,
        data: Value,
    },
    #[serde(rename_all = "camelCase")]
    MutationResult {
        name: String,
        request_id: String,
        data: Value,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sub_id: Option<String>,
        message: String,
    },
}

impl ServerFrame {
    pub fn update(name: impl Into<String>, sub_id: impl Into<String>, data: Value) -> Self {
        ServerFrame::Update {
            name: name.into(),
            sub_id: sub_id.into(),
            data,
        }
    }

    pub fn mutation_result(
        name: impl Into<String>,
        request_id: impl Into<String>,
        data: Value,
    ) -> Self {
        ServerFrame::MutationResult {
            name: name.into(),
            request_id: request_id.into(),
            data,
        }
    }

    /// A bare protocol error with no request correlation.
    pub fn protocol_error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            name: None,
            request_id: None,
            sub_id: None,
            message: message.into(),
        }
    }

    /// An error tied to a subscription.
    pub fn subscription_error(
        name: impl Into<String>,
        sub_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        ServerFrame::Error {
            name: Some(name.into()),
            request_id: None,
            sub_id: Some(sub_id.into()),
            message: message.into(),
        }
    }

    /// An error tied to a mutation request.
    pub fn mutation_error(
        name: impl Into<String>,
        request_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        ServerFrame::Error {
            name: Some(name.into()),
            request_id: Some(request_id.into()),
            sub_id: None,
            message: message.into(),
        }
    }
}

/// Protocol-level errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtoError {
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame too large ({actual} bytes, limit {max})")]
    FrameTooLarge { actual: usize, max: usize },
}

/// Encode a server frame to ndjson bytes.
pub fn encode_frame(frame: &ServerFrame) -> Result<Vec<u8>, ProtoError> {
    let mut bytes = serde_json::to_vec(frame)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Decode a client frame from one line.
pub fn decode_frame(line: &str) -> Result<ClientFrame, ProtoError> {
    Ok(serde_json::from_str(line)?)
}

/// Decode a client frame, enforcing the frame size limit.
pub fn decode_frame_with_limits(line: &str, limits: &Limits) -> Result<ClientFrame, ProtoError> {
    if line.len() > limits.max_frame_bytes {
        return Err(ProtoError::FrameTooLarge {
            actual: line.len(),
            max: limits.max_frame_bytes,
        });
    }
    decode_frame(line)
}
