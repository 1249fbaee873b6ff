//! Message model and line codec.
//!
//! Every message is one JSON object on its own `\n`-terminated line:
//!
//! ```text
//! {"type":"call","id":1,"target":"Calc","mangle":"add(int,int)","parameters":[2,3]}
//! {"type":"result","id":1,"hasResult":true,"value":5}
//! {"type":"error","id":1,"errorType":"notImplemented","message":"...","file":"calc.rs","line":3}
//! {"type":"event","target":"Ticker","parameters":[1]}
//! {"type":"disconnect"}
//! ```
//!
//! `parameters` and `value` are never interpreted by the codec. They are kept as
//! raw JSON text in a [`Payload`] and decoded on demand against the type the
//! receiver expects, so a server can pick a method by `target` and `mangle`
//! before it commits to a parameter type.

use crate::error::{ProtocolError, Result};
use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::fmt;

/// An opaque, already-serialized JSON value.
#[derive(Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Box<RawValue>);

impl Payload {
    /// Serialize `value` into a payload.
    pub fn new<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Self(serde_json::value::to_raw_value(value)?))
    }

    /// The empty parameter list, `[]`.
    pub fn empty() -> Self {
        Self::new(&[(); 0]).unwrap_or_else(|_| unreachable!("empty array always serializes"))
    }

    /// Wrap JSON text. Text spanning several lines is re-serialized compactly
    /// so it cannot break the record boundary.
    pub fn from_json(json: impl Into<String>) -> Result<Self> {
        let json = json.into();
        if json.contains(|c| c == '\n' || c == '\r') {
            let value: serde_json::Value = serde_json::from_str(&json)?;
            return Self::new(&value);
        }
        Ok(Self(RawValue::from_string(json)?))
    }

    /// Decode the payload as `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> std::result::Result<T, serde_json::Error> {
        serde_json::from_str(self.0.get())
    }

    /// The raw JSON text.
    pub fn as_json(&self) -> &str {
        self.0.get()
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.as_json() == other.as_json()
    }
}

impl Eq for Payload {}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({})", self.as_json())
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_json())
    }
}

/// Classification of a failed call. This is the complete taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorType {
    InternalError,
    NotImplemented,
    ParameterMismatch,
}

impl ErrorType {
    /// Wire name, e.g. `notImplemented`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::InternalError => "internalError",
            ErrorType::NotImplemented => "notImplemented",
            ErrorType::ParameterMismatch => "parameterMismatch",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The record type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Call,
    Result,
    Error,
    Event,
    Disconnect,
}

impl MessageKind {
    /// Value of the `type` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Call => "call",
            MessageKind::Result => "result",
            MessageKind::Error => "error",
            MessageKind::Event => "event",
            MessageKind::Disconnect => "disconnect",
        }
    }

    fn parse(tag: &str) -> Option<Self> {
        match tag {
            "call" => Some(MessageKind::Call),
            "result" => Some(MessageKind::Result),
            "error" => Some(MessageKind::Error),
            "event" => Some(MessageKind::Event),
            "disconnect" => Some(MessageKind::Disconnect),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request to invoke `mangle` on the remote object `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallMessage {
    pub id: u64,
    pub target: String,
    pub mangle: String,
    pub parameters: Payload,
}

/// Successful completion of a call. `value` is `None` for void methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultMessage {
    pub id: u64,
    pub value: Option<Payload>,
}

impl ResultMessage {
    /// `false` for a void method's result.
    pub fn has_result(&self) -> bool {
        self.value.is_some()
    }
}

/// Failed completion of a call, or a session-level error when `id` is `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    pub id: Option<u64>,
    pub error_type: ErrorType,
    pub message: String,
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl ErrorMessage {
    /// Convert into the error value a caller receives.
    pub fn into_exception(self) -> crate::RpcException {
        crate::RpcException {
            error_type: self.error_type,
            message: self.message,
            file: self.file,
            line: self.line,
        }
    }
}

/// Unsolicited notification pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMessage {
    pub target: String,
    pub parameters: Payload,
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Call(CallMessage),
    Result(ResultMessage),
    Error(ErrorMessage),
    Event(EventMessage),
    Disconnect,
}

impl Message {
    /// Record type of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Call(_) => MessageKind::Call,
            Message::Result(_) => MessageKind::Result,
            Message::Error(_) => MessageKind::Error,
            Message::Event(_) => MessageKind::Event,
            Message::Disconnect => MessageKind::Disconnect,
        }
    }

    /// The correlation id carried by this message, if any.
    pub fn call_id(&self) -> Option<u64> {
        match self {
            Message::Call(call) => Some(call.id),
            Message::Result(result) => Some(result.id),
            Message::Error(error) => error.id,
            Message::Event(_) | Message::Disconnect => None,
        }
    }

    /// Build a Call record.
    pub fn call(
        id: u64,
        target: impl Into<String>,
        mangle: impl Into<String>,
        parameters: Payload,
    ) -> Self {
        Message::Call(CallMessage {
            id,
            target: target.into(),
            mangle: mangle.into(),
            parameters,
        })
    }

    /// Build a Result record; `None` for void methods.
    pub fn result(id: u64, value: Option<Payload>) -> Self {
        Message::Result(ResultMessage { id, value })
    }

    /// Build an Error record; `id` is `None` for session-level errors.
    pub fn error(id: Option<u64>, error_type: ErrorType, message: impl Into<String>) -> Self {
        Message::Error(ErrorMessage {
            id,
            error_type,
            message: message.into(),
            file: None,
            line: None,
        })
    }

    /// Build an Event record.
    pub fn event(target: impl Into<String>, parameters: Payload) -> Self {
        Message::Event(EventMessage {
            target: target.into(),
            parameters,
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutgoingRecord<'a> {
    #[serde(rename = "type")]
    kind: MessageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mangle: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<&'a Payload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    has_result: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<&'a Payload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_type: Option<ErrorType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    line: Option<u32>,
}

impl<'a> OutgoingRecord<'a> {
    fn bare(kind: MessageKind) -> Self {
        Self {
            kind,
            id: None,
            target: None,
            mangle: None,
            parameters: None,
            has_result: None,
            value: None,
            error_type: None,
            message: None,
            file: None,
            line: None,
        }
    }

    fn from_message(message: &'a Message) -> Self {
        let mut record = Self::bare(message.kind());
        match message {
            Message::Call(call) => {
                record.id = Some(call.id);
                record.target = Some(&call.target);
                record.mangle = Some(&call.mangle);
                record.parameters = Some(&call.parameters);
            }
            Message::Result(result) => {
                record.id = Some(result.id);
                record.has_result = Some(result.has_result());
                record.value = result.value.as_ref();
            }
            Message::Error(error) => {
                record.id = error.id;
                record.error_type = Some(error.error_type);
                record.message = Some(&error.message);
                record.file = error.file.as_deref();
                record.line = error.line;
            }
            Message::Event(event) => {
                record.target = Some(&event.target);
                record.parameters = Some(&event.parameters);
            }
            Message::Disconnect => {}
        }
        record
    }
}

/// Keeps an explicit `null` distinct from an absent field.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<Payload>, D::Error> {
    Payload::deserialize(deserializer).map(Some)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IncomingRecord {
    #[serde(rename = "type")]
    kind: String,
    id: Option<u64>,
    target: Option<String>,
    mangle: Option<String>,
    #[serde(default, deserialize_with = "present")]
    parameters: Option<Payload>,
    has_result: Option<bool>,
    #[serde(default, deserialize_with = "present")]
    value: Option<Payload>,
    error_type: Option<ErrorType>,
    message: Option<String>,
    file: Option<String>,
    line: Option<u32>,
}

impl IncomingRecord {
    fn has(&self, field: &str) -> bool {
        match field {
            "id" => self.id.is_some(),
            "target" => self.target.is_some(),
            "mangle" => self.mangle.is_some(),
            "parameters" => self.parameters.is_some(),
            "hasResult" => self.has_result.is_some(),
            "value" => self.value.is_some(),
            "errorType" => self.error_type.is_some(),
            "message" => self.message.is_some(),
            "file" => self.file.is_some(),
            "line" => self.line.is_some(),
            _ => false,
        }
    }

    fn forbid(
        &self,
        kind: MessageKind,
        fields: &[&'static str],
    ) -> std::result::Result<(), ProtocolError> {
        match fields.iter().find(|field| self.has(field)) {
            Some(field) => Err(ProtocolError::UnexpectedField {
                kind: kind.as_str(),
                field: *field,
            }),
            None => Ok(()),
        }
    }

    fn into_message(self) -> std::result::Result<Message, ProtocolError> {
        let kind = MessageKind::parse(&self.kind)
            .ok_or_else(|| ProtocolError::UnknownType(self.kind.clone()))?;
        let missing = |field: &'static str| ProtocolError::MissingField {
            kind: kind.as_str(),
            field,
        };

        match kind {
            MessageKind::Call => {
                self.forbid(
                    kind,
                    &["hasResult", "value", "errorType", "message", "file", "line"],
                )?;
                let id = non_zero(self.id.ok_or_else(|| missing("id"))?)?;
                Ok(Message::Call(CallMessage {
                    id,
                    target: self.target.ok_or_else(|| missing("target"))?,
                    mangle: self.mangle.ok_or_else(|| missing("mangle"))?,
                    parameters: self.parameters.ok_or_else(|| missing("parameters"))?,
                }))
            }
            MessageKind::Result => {
                self.forbid(
                    kind,
                    &["target", "mangle", "parameters", "errorType", "message", "file", "line"],
                )?;
                let id = non_zero(self.id.ok_or_else(|| missing("id"))?)?;
                let has_result = self.has_result.ok_or_else(|| missing("hasResult"))?;
                let value = match (has_result, self.value) {
                    (true, Some(value)) => Some(value),
                    (true, None) => return Err(missing("value")),
                    (false, Some(_)) => {
                        return Err(ProtocolError::UnexpectedField {
                            kind: kind.as_str(),
                            field: "value",
                        })
                    }
                    (false, None) => None,
                };
                Ok(Message::Result(ResultMessage { id, value }))
            }
            MessageKind::Error => {
                self.forbid(kind, &["target", "mangle", "parameters", "hasResult", "value"])?;
                let id = self.id.map(non_zero).transpose()?;
                Ok(Message::Error(ErrorMessage {
                    id,
                    error_type: self.error_type.ok_or_else(|| missing("errorType"))?,
                    message: self.message.ok_or_else(|| missing("message"))?,
                    file: self.file,
                    line: self.line,
                }))
            }
            MessageKind::Event => {
                self.forbid(
                    kind,
                    &["id", "mangle", "hasResult", "value", "errorType", "message", "file", "line"],
                )?;
                Ok(Message::Event(EventMessage {
                    target: self.target.ok_or_else(|| missing("target"))?,
                    parameters: self.parameters.ok_or_else(|| missing("parameters"))?,
                }))
            }
            MessageKind::Disconnect => {
                self.forbid(
                    kind,
                    &[
                        "id", "target", "mangle", "parameters", "hasResult", "value",
                        "errorType", "message", "file", "line",
                    ],
                )?;
                Ok(Message::Disconnect)
            }
        }
    }
}

fn non_zero(id: u64) -> std::result::Result<u64, ProtocolError> {
    if id == 0 {
        Err(ProtocolError::ZeroCallId)
    } else {
        Ok(id)
    }
}

/// Encode one message as a terminated record.
pub fn encode(message: &Message) -> std::result::Result<Vec<u8>, ProtocolError> {
    let mut bytes = serde_json::to_vec(&OutgoingRecord::from_message(message))
        .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Decode one record. The terminator (and a preceding `\r`) is optional.
pub fn decode(record: &[u8]) -> std::result::Result<Message, ProtocolError> {
    let line = record.strip_suffix(b"\n").unwrap_or(record);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let text = std::str::from_utf8(line).map_err(|_| ProtocolError::InvalidUtf8)?;
    if text.contains('\n') {
        return Err(ProtocolError::Malformed(
            "record contains an embedded terminator".to_string(),
        ));
    }

    let record: IncomingRecord =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    record.into_message()
}
