//! Wire codec for the stream service.
//!
//! Requests are JSON objects tagged by `type`. Responses are compact JSON
//! arrays `[version, type, subId, payload]` and stream messages use the
//! compact array form `[28|29, streamId, partition, timestamp, ttl, offset,
//! previousOffset, contentType, content, ...signature]`.

use std::sync::OnceLock;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Only supported version of the outer response envelope.
pub const RESPONSE_VERSION: u64 = 0;
/// Stream message version without a signature block.
pub const MESSAGE_VERSION_UNSIGNED: u64 = 28;
/// Stream message version carrying a signature block.
pub const MESSAGE_VERSION_SIGNED: u64 = 29;
/// Content type tag for JSON content.
pub const CONTENT_TYPE_JSON: u8 = 27;
/// Top-level content key marking the end of a stream.
pub const BYE_KEY: &str = "_bye";

/// Errors raised while encoding or decoding wire envelopes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame was not valid JSON or did not match a request shape.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Envelope version other than the supported ones.
    #[error("unsupported {kind} version {found}")]
    UnsupportedVersion { kind: &'static str, found: Value },

    /// Response type tag outside `0..=7`.
    #[error("unknown response type {0}")]
    UnknownResponseType(Value),

    /// Frame shape was wrong (field count, field types).
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Payload did not match what the response type expects.
    #[error("{response:?} payload mismatch: {detail}")]
    PayloadMismatch {
        response: ResponseType,
        detail: String,
    },

    /// Content type tag this client cannot parse.
    #[error("unsupported content type {0}")]
    UnsupportedContentType(u8),

    /// Message content failed to parse as JSON. The message itself is
    /// attached so routing and offset tracking can continue.
    #[error("invalid json content on stream {stream_id}: {source}")]
    InvalidJson {
        stream_id: String,
        content: String,
        #[source]
        source: serde_json::Error,
        message: Box<StreamMessage>,
    },

    /// Publish content was a scalar instead of an object, array or text.
    #[error("publish content must be a json object, a json array or serialized json text")]
    InvalidContent,

    /// More than one resend directive was set.
    #[error("invalid resend options: {0}")]
    InvalidResendOptions(String),

    /// Request is missing a required field.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Message content as carried on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    /// Serialized text, parsed lazily according to the content type.
    Text(String),
    /// Content that arrived already structured.
    Json(Value),
}

/// Optional signature block of a version 29 message. Carried opaquely.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignatureBlock {
    pub signature_type: Option<u64>,
    pub publisher_address: Option<String>,
    pub signature: Option<String>,
}

/// One delivered data point.
#[derive(Debug, Clone)]
pub struct StreamMessage {
    pub stream_id: String,
    pub partition: u32,
    pub timestamp: i64,
    pub ttl: u64,
    pub offset: u64,
    pub previous_offset: Option<u64>,
    pub content_type: u8,
    pub content: Content,
    pub signature: Option<SignatureBlock>,
    parsed: OnceLock<Value>,
}

impl StreamMessage {
    /// Builds an unsigned JSON message with a zero ttl.
    pub fn new(
        stream_id: impl Into<String>,
        partition: u32,
        timestamp: i64,
        offset: u64,
        previous_offset: Option<u64>,
        content: Content,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            partition,
            timestamp,
            ttl: 0,
            offset,
            previous_offset,
            content_type: CONTENT_TYPE_JSON,
            content,
            signature: None,
            parsed: OnceLock::new(),
        }
    }

    pub fn with_ttl(mut self, ttl: u64) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_signature(mut self, signature: SignatureBlock) -> Self {
        self.signature = Some(signature);
        self
    }

    /// Wire version implied by the presence of a signature block.
    pub fn version(&self) -> u64 {
        if self.signature.is_some() {
            MESSAGE_VERSION_SIGNED
        } else {
            MESSAGE_VERSION_UNSIGNED
        }
    }

    /// Returns the structured content, parsing and caching text content on
    /// first access.
    pub fn parsed_content(&self) -> Result<&Value, ProtocolError> {
        if let Some(value) = self.parsed.get() {
            return Ok(value);
        }

        match &self.content {
            Content::Json(value) => Ok(value),
            Content::Text(text) => {
                if self.content_type != CONTENT_TYPE_JSON {
                    return Err(ProtocolError::UnsupportedContentType(self.content_type));
                }
                let value =
                    serde_json::from_str(text).map_err(|source| ProtocolError::InvalidJson {
                        stream_id: self.stream_id.clone(),
                        content: text.clone(),
                        source,
                        message: Box::new(self.clone()),
                    })?;
                Ok(self.parsed.get_or_init(|| value))
            }
        }
    }

    /// Content in its serialized text form.
    pub fn serialized_content(&self) -> String {
        match &self.content {
            Content::Text(text) => text.clone(),
            Content::Json(value) => value.to_string(),
        }
    }

    /// True when the parsed content carries a truthy end-of-stream marker:
    /// any value other than `null`, `false`, zero or an empty string or
    /// container.
    pub fn is_bye(&self) -> bool {
        let Ok(content) = self.parsed_content() else {
            return false;
        };
        match content.get(BYE_KEY) {
            None | Some(Value::Null) => false,
            Some(Value::Bool(flag)) => *flag,
            Some(Value::Number(number)) => number.as_f64().is_some_and(|n| n != 0.0),
            Some(Value::String(text)) => !text.is_empty(),
            Some(Value::Array(items)) => !items.is_empty(),
            Some(Value::Object(fields)) => !fields.is_empty(),
        }
    }

    /// Encodes the message in its compact array form.
    pub fn to_compact(&self) -> Value {
        let content = match &self.content {
            Content::Text(text) => Value::String(text.clone()),
            Content::Json(value) => value.clone(),
        };
        let mut fields = vec![
            json!(self.version()),
            json!(self.stream_id),
            json!(self.partition),
            json!(self.timestamp),
            json!(self.ttl),
            json!(self.offset),
            json!(self.previous_offset),
            json!(self.content_type),
            content,
        ];
        if let Some(signature) = &self.signature {
            fields.push(json!(signature.signature_type));
            fields.push(json!(signature.publisher_address));
            fields.push(json!(signature.signature));
        }
        Value::Array(fields)
    }

    /// Decodes a compact array, or a string holding one. JSON content is
    /// parsed eagerly so bad content surfaces as [`ProtocolError::InvalidJson`].
    pub fn from_compact(value: &Value) -> Result<Self, ProtocolError> {
        let parsed;
        let fields = match value {
            Value::Array(fields) => fields,
            Value::String(text) => {
                parsed = serde_json::from_str::<Value>(text)?;
                parsed.as_array().ok_or_else(|| {
                    ProtocolError::Malformed("stream message text is not an array".to_string())
                })?
            }
            _ => {
                return Err(ProtocolError::Malformed(
                    "stream message must be an array".to_string(),
                ))
            }
        };

        let version = fields
            .first()
            .ok_or_else(|| ProtocolError::Malformed("empty stream message".to_string()))?;
        let expected_len = match version.as_u64() {
            Some(MESSAGE_VERSION_UNSIGNED) => 9,
            Some(MESSAGE_VERSION_SIGNED) => 12,
            _ => {
                return Err(ProtocolError::UnsupportedVersion {
                    kind: "stream message",
                    found: version.clone(),
                })
            }
        };
        if fields.len() != expected_len {
            return Err(ProtocolError::Malformed(format!(
                "stream message version {version} expects {expected_len} fields, got {}",
                fields.len()
            )));
        }

        let content_type = u8::try_from(field_u64(fields, 7, "contentType")?).map_err(|_| {
            ProtocolError::Malformed("contentType does not fit in a byte".to_string())
        })?;
        if content_type != CONTENT_TYPE_JSON {
            return Err(ProtocolError::UnsupportedContentType(content_type));
        }
        let content = match &fields[8] {
            Value::String(text) => Content::Text(text.clone()),
            value @ (Value::Object(_) | Value::Array(_)) => Content::Json(value.clone()),
            other => {
                return Err(ProtocolError::Malformed(format!(
                    "content must be text or structured, got {other}"
                )))
            }
        };
        let signature = if expected_len == 12 {
            Some(SignatureBlock {
                signature_type: field_opt_u64(fields, 9, "signatureType")?,
                publisher_address: field_opt_str(fields, 10, "publisherAddress")?,
                signature: field_opt_str(fields, 11, "signature")?,
            })
        } else {
            None
        };

        let message = Self {
            stream_id: field_str(fields, 1, "streamId")?,
            partition: u32::try_from(field_u64(fields, 2, "partition")?)
                .map_err(|_| ProtocolError::Malformed("partition out of range".to_string()))?,
            timestamp: field_i64(fields, 3, "timestamp")?,
            ttl: field_u64(fields, 4, "ttl")?,
            offset: field_u64(fields, 5, "offset")?,
            previous_offset: field_opt_u64(fields, 6, "previousOffset")?,
            content_type,
            content,
            signature,
            parsed: OnceLock::new(),
        };
        message.parsed_content()?;
        Ok(message)
    }
}

impl PartialEq for StreamMessage {
    fn eq(&self, other: &Self) -> bool {
        self.stream_id == other.stream_id
            && self.partition == other.partition
            && self.timestamp == other.timestamp
            && self.ttl == other.ttl
            && self.offset == other.offset
            && self.previous_offset == other.previous_offset
            && self.content_type == other.content_type
            && self.content == other.content
            && self.signature == other.signature
    }
}

fn field_str(fields: &[Value], index: usize, name: &str) -> Result<String, ProtocolError> {
    fields[index]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ProtocolError::Malformed(format!("{name} must be a string")))
}

fn field_u64(fields: &[Value], index: usize, name: &str) -> Result<u64, ProtocolError> {
    fields[index]
        .as_u64()
        .ok_or_else(|| ProtocolError::Malformed(format!("{name} must be a non-negative integer")))
}

fn field_i64(fields: &[Value], index: usize, name: &str) -> Result<i64, ProtocolError> {
    let value = &fields[index];
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|float| float as i64))
        .ok_or_else(|| ProtocolError::Malformed(format!("{name} must be a number")))
}

fn field_opt_u64(fields: &[Value], index: usize, name: &str) -> Result<Option<u64>, ProtocolError> {
    match &fields[index] {
        Value::Null => Ok(None),
        _ => field_u64(fields, index, name).map(Some),
    }
}

fn field_opt_str(
    fields: &[Value],
    index: usize,
    name: &str,
) -> Result<Option<String>, ProtocolError> {
    match &fields[index] {
        Value::Null => Ok(None),
        _ => field_str(fields, index, name).map(Some),
    }
}

/// Response type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResponseType {
    Broadcast = 0,
    Unicast = 1,
    SubscribeAck = 2,
    UnsubscribeAck = 3,
    ResendResending = 4,
    ResendResent = 5,
    ResendNoResend = 6,
    Error = 7,
}

impl ResponseType {
    pub fn from_tag(tag: u64) -> Option<Self> {
        let response_type = match tag {
            0 => Self::Broadcast,
            1 => Self::Unicast,
            2 => Self::SubscribeAck,
            3 => Self::UnsubscribeAck,
            4 => Self::ResendResending,
            5 => Self::ResendResent,
            6 => Self::ResendNoResend,
            7 => Self::Error,
            _ => return None,
        };
        Some(response_type)
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// `{stream, partition}` payload of subscribe and unsubscribe acks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamPartition {
    pub stream: String,
    pub partition: u32,
}

/// `{stream, partition, sub}` payload of resend-state responses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResendStatus {
    pub stream: String,
    pub partition: u32,
    pub sub: String,
}

/// `{error}` payload of error responses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub error: String,
}

/// Decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Broadcast(StreamMessage),
    Unicast {
        sub_id: String,
        message: StreamMessage,
    },
    SubscribeAck(StreamPartition),
    UnsubscribeAck(StreamPartition),
    ResendResending(ResendStatus),
    ResendResent(ResendStatus),
    ResendNoResend(ResendStatus),
    Error(ErrorPayload),
}

impl Response {
    pub fn response_type(&self) -> ResponseType {
        match self {
            Self::Broadcast(_) => ResponseType::Broadcast,
            Self::Unicast { .. } => ResponseType::Unicast,
            Self::SubscribeAck(_) => ResponseType::SubscribeAck,
            Self::UnsubscribeAck(_) => ResponseType::UnsubscribeAck,
            Self::ResendResending(_) => ResponseType::ResendResending,
            Self::ResendResent(_) => ResponseType::ResendResent,
            Self::ResendNoResend(_) => ResponseType::ResendNoResend,
            Self::Error(_) => ResponseType::Error,
        }
    }

    /// Subscription id carried by unicast and resend-state responses.
    pub fn sub_id(&self) -> Option<&str> {
        match self {
            Self::Unicast { sub_id, .. } => Some(sub_id),
            Self::ResendResending(status)
            | Self::ResendResent(status)
            | Self::ResendNoResend(status) => Some(&status.sub),
            _ => None,
        }
    }
}

/// Decodes one inbound text frame.
pub fn decode_response(text: &str) -> Result<Response, ProtocolError> {
    let envelope: Value = serde_json::from_str(text)?;
    let Value::Array(fields) = envelope else {
        return Err(ProtocolError::Malformed(
            "response envelope must be an array".to_string(),
        ));
    };
    let [version, tag, sub_id, payload] = fields.as_slice() else {
        return Err(ProtocolError::Malformed(format!(
            "response envelope expects 4 fields, got {}",
            fields.len()
        )));
    };

    if version.as_u64() != Some(RESPONSE_VERSION) {
        return Err(ProtocolError::UnsupportedVersion {
            kind: "response",
            found: version.clone(),
        });
    }
    let response_type = tag
        .as_u64()
        .and_then(ResponseType::from_tag)
        .ok_or_else(|| ProtocolError::UnknownResponseType(tag.clone()))?;

    match response_type {
        ResponseType::Broadcast => Ok(Response::Broadcast(message_payload(
            response_type,
            payload,
        )?)),
        ResponseType::Unicast => {
            let sub_id = match sub_id {
                Value::String(sub_id) => sub_id.clone(),
                Value::Number(number) => number.to_string(),
                _ => {
                    return Err(ProtocolError::Malformed(
                        "unicast response without subscription id".to_string(),
                    ))
                }
            };
            Ok(Response::Unicast {
                sub_id,
                message: message_payload(response_type, payload)?,
            })
        }
        ResponseType::SubscribeAck => Ok(Response::SubscribeAck(typed_payload(
            response_type,
            payload,
        )?)),
        ResponseType::UnsubscribeAck => Ok(Response::UnsubscribeAck(typed_payload(
            response_type,
            payload,
        )?)),
        ResponseType::ResendResending => Ok(Response::ResendResending(typed_payload(
            response_type,
            payload,
        )?)),
        ResponseType::ResendResent => Ok(Response::ResendResent(typed_payload(
            response_type,
            payload,
        )?)),
        ResponseType::ResendNoResend => Ok(Response::ResendNoResend(typed_payload(
            response_type,
            payload,
        )?)),
        ResponseType::Error => Ok(Response::Error(typed_payload(response_type, payload)?)),
    }
}

fn message_payload(
    response: ResponseType,
    payload: &Value,
) -> Result<StreamMessage, ProtocolError> {
    if !payload.is_array() && !payload.is_string() {
        return Err(ProtocolError::PayloadMismatch {
            response,
            detail: "expected a compact stream message".to_string(),
        });
    }
    StreamMessage::from_compact(payload)
}

fn typed_payload<T: DeserializeOwned>(
    response: ResponseType,
    payload: &Value,
) -> Result<T, ProtocolError> {
    T::deserialize(payload).map_err(|err| ProtocolError::PayloadMismatch {
        response,
        detail: err.to_string(),
    })
}

/// Encodes a response envelope. Used by test servers and tooling.
pub fn encode_response(response: &Response) -> String {
    let (sub_id, payload) = match response {
        Response::Broadcast(message) => (Value::Null, message.to_compact()),
        Response::Unicast { sub_id, message } => (json!(sub_id), message.to_compact()),
        Response::SubscribeAck(ack) | Response::UnsubscribeAck(ack) => (
            Value::Null,
            json!({ "stream": ack.stream, "partition": ack.partition }),
        ),
        Response::ResendResending(status)
        | Response::ResendResent(status)
        | Response::ResendNoResend(status) => (
            json!(status.sub),
            json!({ "stream": status.stream, "partition": status.partition, "sub": status.sub }),
        ),
        Response::Error(payload) => (Value::Null, json!({ "error": payload.error })),
    };
    json!([
        RESPONSE_VERSION,
        response.response_type().tag(),
        sub_id,
        payload
    ])
    .to_string()
}

/// Resend directive. Only one may be active per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResendDirective {
    All,
    From(u64),
    Last(u64),
    FromTime(i64),
}

/// Resend directive with an optional upper offset bound.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ResendFields", into = "ResendFields")]
pub struct ResendOptions {
    directive: Option<ResendDirective>,
    to: Option<u64>,
}

impl ResendOptions {
    pub fn all() -> Self {
        Self::with_directive(ResendDirective::All)
    }

    pub fn from_offset(offset: u64) -> Self {
        Self::with_directive(ResendDirective::From(offset))
    }

    pub fn last(count: u64) -> Self {
        Self::with_directive(ResendDirective::Last(count))
    }

    pub fn from_time(timestamp: i64) -> Self {
        Self::with_directive(ResendDirective::FromTime(timestamp))
    }

    /// Inclusive offset range, as requested when a gap is detected.
    pub fn range(from: u64, to: u64) -> Self {
        Self::from_offset(from).with_to(to)
    }

    pub fn with_to(mut self, to: u64) -> Self {
        self.to = Some(to);
        self
    }

    /// Builds options from the flat wire fields, rejecting more than one
    /// directive. `resend_all: false` counts as unset.
    pub fn from_fields(
        resend_all: Option<bool>,
        resend_from: Option<u64>,
        resend_last: Option<u64>,
        resend_from_time: Option<i64>,
        resend_to: Option<u64>,
    ) -> Result<Self, ProtocolError> {
        let mut directives = Vec::with_capacity(1);
        if resend_all == Some(true) {
            directives.push(ResendDirective::All);
        }
        if let Some(offset) = resend_from {
            directives.push(ResendDirective::From(offset));
        }
        if let Some(count) = resend_last {
            directives.push(ResendDirective::Last(count));
        }
        if let Some(timestamp) = resend_from_time {
            directives.push(ResendDirective::FromTime(timestamp));
        }
        if directives.len() > 1 {
            return Err(ProtocolError::InvalidResendOptions(
                "at most one of resend_all, resend_from, resend_last and resend_from_time may be set"
                    .to_string(),
            ));
        }

        Ok(Self {
            directive: directives.pop(),
            to: resend_to,
        })
    }

    pub fn directive(&self) -> Option<ResendDirective> {
        self.directive
    }

    pub fn to(&self) -> Option<u64> {
        self.to
    }

    pub fn is_set(&self) -> bool {
        self.directive.is_some()
    }

    fn with_directive(directive: ResendDirective) -> Self {
        Self {
            directive: Some(directive),
            to: None,
        }
    }
}

/// Flat wire form of [`ResendOptions`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResendFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    resend_all: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    resend_from: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    resend_last: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    resend_from_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    resend_to: Option<u64>,
}

impl TryFrom<ResendFields> for ResendOptions {
    type Error = ProtocolError;

    fn try_from(fields: ResendFields) -> Result<Self, Self::Error> {
        Self::from_fields(
            fields.resend_all,
            fields.resend_from,
            fields.resend_last,
            fields.resend_from_time,
            fields.resend_to,
        )
    }
}

impl From<ResendOptions> for ResendFields {
    fn from(options: ResendOptions) -> Self {
        let mut fields = ResendFields {
            resend_to: options.to,
            ..ResendFields::default()
        };
        match options.directive {
            Some(ResendDirective::All) => fields.resend_all = Some(true),
            Some(ResendDirective::From(offset)) => fields.resend_from = Some(offset),
            Some(ResendDirective::Last(count)) => fields.resend_last = Some(count),
            Some(ResendDirective::FromTime(timestamp)) => fields.resend_from_time = Some(timestamp),
            None => {}
        }
        fields
    }
}

/// Outbound control request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Publish(PublishRequest),
    Subscribe(SubscribeRequest),
    Unsubscribe(UnsubscribeRequest),
    Resend(ResendRequest),
}

impl Request {
    pub fn stream_id(&self) -> &str {
        match self {
            Self::Publish(request) => &request.stream_id,
            Self::Subscribe(request) => &request.stream_id,
            Self::Unsubscribe(request) => &request.stream_id,
            Self::Resend(request) => &request.stream_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Publish(_) => "publish",
            Self::Subscribe(_) => "subscribe",
            Self::Unsubscribe(_) => "unsubscribe",
            Self::Resend(_) => "resend",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishRequest {
    #[serde(rename = "stream")]
    pub stream_id: String,
    #[serde(rename = "authKey")]
    pub api_key: Option<String>,
    #[serde(rename = "sessionToken")]
    pub session_token: Option<String>,
    msg: String,
    #[serde(rename = "ts")]
    pub timestamp: Option<i64>,
    #[serde(rename = "pkey")]
    pub partition_key: Option<String>,
    #[serde(rename = "addr")]
    pub publisher_address: Option<String>,
    #[serde(rename = "sigtype")]
    pub signature_type: Option<u64>,
    #[serde(rename = "sig")]
    pub signature: Option<String>,
}

impl PublishRequest {
    /// Objects and arrays are serialized; strings are taken as
    /// already-serialized content. Scalars are rejected.
    pub fn new(
        stream_id: impl Into<String>,
        content: Value,
        api_key: Option<String>,
        session_token: Option<String>,
    ) -> Result<Self, ProtocolError> {
        let msg = match content {
            Value::String(text) => text,
            value @ (Value::Object(_) | Value::Array(_)) => value.to_string(),
            _ => return Err(ProtocolError::InvalidContent),
        };

        Ok(Self {
            stream_id: stream_id.into(),
            api_key,
            session_token,
            msg,
            timestamp: None,
            partition_key: None,
            publisher_address: None,
            signature_type: None,
            signature: None,
        })
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_partition_key(mut self, partition_key: impl Into<String>) -> Self {
        self.partition_key = Some(partition_key.into());
        self
    }

    pub fn with_signature(
        mut self,
        publisher_address: impl Into<String>,
        signature_type: u64,
        signature: impl Into<String>,
    ) -> Self {
        self.publisher_address = Some(publisher_address.into());
        self.signature_type = Some(signature_type);
        self.signature = Some(signature.into());
        self
    }

    /// Serialized content.
    pub fn content(&self) -> &str {
        &self.msg
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscribeRequest {
    #[serde(rename = "stream")]
    pub stream_id: String,
    pub partition: u32,
    #[serde(rename = "authKey")]
    pub api_key: Option<String>,
    #[serde(rename = "sessionToken")]
    pub session_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnsubscribeRequest {
    #[serde(rename = "stream")]
    pub stream_id: String,
    pub partition: u32,
    #[serde(rename = "authKey")]
    pub api_key: Option<String>,
    #[serde(rename = "sessionToken")]
    pub session_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResendRequest {
    #[serde(rename = "stream")]
    pub stream_id: String,
    pub partition: u32,
    #[serde(rename = "sub")]
    pub sub_id: String,
    #[serde(flatten)]
    pub options: ResendOptions,
    #[serde(rename = "authKey")]
    pub api_key: Option<String>,
    #[serde(rename = "sessionToken")]
    pub session_token: Option<String>,
}

impl ResendRequest {
    pub fn new(
        stream_id: impl Into<String>,
        partition: u32,
        sub_id: impl Into<String>,
        options: ResendOptions,
        api_key: Option<String>,
        session_token: Option<String>,
    ) -> Result<Self, ProtocolError> {
        let request = Self {
            stream_id: stream_id.into(),
            partition,
            sub_id: sub_id.into(),
            options,
            api_key,
            session_token,
        };
        request.validate()?;
        Ok(request)
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        if self.sub_id.is_empty() {
            return Err(ProtocolError::InvalidRequest(
                "resend request needs a subscription id".to_string(),
            ));
        }
        if !self.options.is_set() {
            return Err(ProtocolError::InvalidRequest(
                "resend request needs a resend directive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Encodes an outbound request as a JSON object.
pub fn encode_request(request: &Request) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(request)?)
}

/// Decodes a request frame. Used by test servers and tooling.
pub fn decode_request(text: &str) -> Result<Request, ProtocolError> {
    let request: Request = serde_json::from_str(text)?;
    if let Request::Resend(resend) = &request {
        resend.validate()?;
    }
    Ok(request)
}
