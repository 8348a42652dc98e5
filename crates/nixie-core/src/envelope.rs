//! Wire envelope and codec
//!
//! Every published message is a JSON object carrying a `type` tag plus the
//! sender's `source` name and `worker` index. RPC traffic (request,
//! response, ping, pong, ping-result) decodes into [`Envelope`]; any other
//! `type` tag is an application-defined fire-and-forget message and decodes
//! into [`PlainMessage`].

use crate::error::{Error, Result};
use crate::identity::{ServiceIdentity, ServiceName, WorkerId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Operation-specific fields of a request or plain message
pub type Fields = serde_json::Map<String, Value>;

/// Opaque unique token correlating a request with its responses
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RequestId(String);

impl RequestId {
    /// Wrap an already-generated token
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Get the token as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque unique token identifying one liveness round
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct PingId(String);

impl PingId {
    /// Wrap an already-generated token
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Get the token as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One worker's entry in a consolidated liveness map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReport {
    /// Round-trip latency observed by the round's originator, in ms
    pub ping: u64,
    /// Requests handled successfully since the worker's previous report
    pub success: u64,
    /// Handler faults since the worker's previous report
    pub errors: u64,
}

/// A consolidated liveness map, keyed by `name@worker`
pub type LivenessMap = BTreeMap<String, WorkerReport>;

/// A decoded RPC message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender's service name
    pub source: ServiceName,
    /// Sender's worker index
    pub worker: WorkerId,
    /// The message body, discriminated by the wire `type` tag
    #[serde(flatten)]
    pub body: Body,
}

impl Envelope {
    /// The sender's identity
    pub fn sender(&self) -> ServiceIdentity {
        ServiceIdentity::new(self.source.clone(), self.worker)
    }
}

/// Message body variants of the RPC protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Body {
    /// A remote call
    Request {
        request_type: String,
        request_id: RequestId,
        #[serde(flatten)]
        fields: Fields,
    },

    /// One frame of a reply, routed back by request id
    Response {
        request_id: RequestId,
        #[serde(flatten)]
        response: Response,
    },

    /// Start of a liveness round, published on the shared channel
    Ping { ping_id: PingId },

    /// One instance's answer to a ping, sent to the originator's channel
    Pong {
        ping_id: PingId,
        success: u64,
        errors: u64,
    },

    /// The consolidated result of a round, published on the shared channel
    PingResult { pings: LivenessMap },
}

/// Response frame variants
///
/// `stream`, `content` and the terminal frames mirror the streaming
/// contract: a caller sees `stream` first, then `content` frames in send
/// order, then exactly one of `end` / `reject` / `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "response_type", rename_all = "snake_case")]
pub enum Response {
    /// Acknowledges that the reply will arrive as a stream
    Stream,
    /// One streamed payload frame
    Content { content: Value },
    /// A complete single-frame reply
    Simple { content: Value },
    /// Terminal frame with no payload (empty reply or stream close)
    End,
    /// Typed application error raised by the remote handler
    Reject {
        rejection_type: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default)]
        kwargs: Fields,
    },
    /// Unexpected remote fault; detail is deliberately not carried
    Error,
}

/// A fire-and-forget message with an application-defined `type` tag
#[derive(Debug, Clone, PartialEq)]
pub struct PlainMessage {
    /// The wire `type` tag
    pub kind: String,
    /// Sender's service name
    pub source: ServiceName,
    /// Sender's worker index
    pub worker: WorkerId,
    /// Remaining fields of the message
    pub fields: Fields,
}

/// A decoded inbound message
#[derive(Debug, Clone)]
pub enum Incoming {
    /// RPC protocol traffic
    Rpc(Envelope),
    /// Application-defined fire-and-forget message
    Plain(PlainMessage),
}

const RPC_TYPE_TAGS: &[&str] = &["request", "response", "ping", "pong", "ping-result"];

/// Serialize an envelope to its wire form
pub fn encode(envelope: &Envelope) -> Result<String> {
    let raw = serde_json::to_string(envelope).map_err(|e| Error::encode_failed(e.to_string()))?;
    if raw.len() > crate::constants::ENVELOPE_SIZE_BYTES_MAX {
        return Err(Error::encode_failed(format!(
            "envelope size {} exceeds limit {}",
            raw.len(),
            crate::constants::ENVELOPE_SIZE_BYTES_MAX
        )));
    }
    Ok(raw)
}

/// Serialize a plain message to its wire form
pub fn encode_plain(
    kind: &str,
    source: &ServiceName,
    worker: WorkerId,
    fields: &Fields,
) -> Result<String> {
    if RPC_TYPE_TAGS.contains(&kind) {
        return Err(Error::encode_failed(format!(
            "type tag {kind:?} is reserved for RPC traffic"
        )));
    }

    let mut map = fields.clone();
    map.insert("type".into(), Value::String(kind.into()));
    map.insert("source".into(), Value::String(source.as_str().into()));
    map.insert("worker".into(), Value::from(worker));

    serde_json::to_string(&map).map_err(|e| Error::encode_failed(e.to_string()))
}

/// Decode a raw wire message
///
/// Known `type` tags decode into [`Envelope`]; anything else becomes a
/// [`PlainMessage`]. Messages without a `type`, `source` or `worker` field
/// are rejected.
pub fn decode(raw: &str) -> Result<Incoming> {
    let value: Value = serde_json::from_str(raw).map_err(|e| Error::decode_failed(e.to_string()))?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::decode_failed("missing or non-string 'type' tag"))?;

    if RPC_TYPE_TAGS.contains(&kind) {
        let envelope: Envelope =
            serde_json::from_value(value).map_err(|e| Error::decode_failed(e.to_string()))?;
        return Ok(Incoming::Rpc(envelope));
    }

    let kind = kind.to_string();
    let Value::Object(mut map) = value else {
        return Err(Error::decode_failed("message is not a JSON object"));
    };

    map.remove("type");
    let source = match map.remove("source") {
        Some(Value::String(s)) => ServiceName::new(s)?,
        _ => return Err(Error::decode_failed("missing or non-string 'source' field")),
    };
    let worker = match map.remove("worker").and_then(|w| w.as_u64()) {
        Some(w) if w <= WorkerId::MAX as u64 => w as WorkerId,
        _ => return Err(Error::decode_failed("missing or invalid 'worker' field")),
    };

    Ok(Incoming::Plain(PlainMessage {
        kind,
        source,
        worker,
        fields: map,
    }))
}
