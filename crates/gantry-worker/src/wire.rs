//! Wire-format message types for the host↔worker stream.
//!
//! Everything the duplex stream carries is an [`Envelope`]: an optional
//! correlation identifier plus exactly one [`Payload`]. Payloads are
//! externally tagged in JSON (`{"invocationRequest": {...}}`), so the tag
//! doubles as the dispatcher's routing key. [`TypedValue`] is the tagged
//! union carrying every input and output value.
//!
//! ## Schema validation
//!
//! [`validate_envelope`] runs against every outbound envelope before it is
//! written. A violation here is an internal logic defect, never a transient
//! condition, so the dispatcher treats it as fatal.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::DateTime;
use chrono::Utc;
use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;

/// The return binding's reserved name.
pub const RETURN_BINDING: &str = "$return";

/// Outbound schema violation. Indicates an engine bug, not a wire condition.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("outbound {kind} is missing a non-empty invocationId")]
    MissingInvocationId { kind: &'static str },
    #[error("outbound invocationResponse carries an output named '{RETURN_BINDING}'; return values use the returnValue slot")]
    ReturnInOutputData,
    #[error("outbound invocationResponse carries duplicate output '{name}'")]
    DuplicateOutput { name: String },
    #[error("outbound invocationResponse has Failure status but no exception")]
    FailureWithoutException,
    #[error("outbound functionLoadResponse is missing a non-empty functionId")]
    MissingFunctionId,
}

// ---------------------------------------------------------------------------
// TypedValue
// ---------------------------------------------------------------------------

/// The tagged wire representation of any input/output value.
///
/// Exactly one variant is populated; [`TypedValue::Empty`] is the valid
/// "no variant populated" state and the serde default. Values are immutable
/// once constructed and are produced and consumed only by the `convert`
/// module.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TypedValue {
    #[default]
    Empty,
    String(String),
    Json(String),
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
    Int(i64),
    Double(f64),
    Http(Box<HttpData>),
    CollectionString(Vec<String>),
    CollectionBytes(#[serde(with = "base64_bytes_vec")] Vec<Vec<u8>>),
    CollectionDouble(Vec<f64>),
    CollectionSint64(Vec<i64>),
    NullableString(Option<String>),
    NullableBool(Option<bool>),
    NullableDouble(Option<f64>),
    NullableTimestamp(Option<DateTime<Utc>>),
}

mod base64_bytes {
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    use super::BASE64;
    use super::Engine;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        BASE64.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}

mod base64_bytes_vec {
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;
    use serde::ser::SerializeSeq;

    use super::BASE64;
    use super::Engine;

    pub fn serialize<S: Serializer>(items: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(items.len()))?;
        for item in items {
            seq.serialize_element(&BASE64.encode(item))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Vec<u8>>, D::Error> {
        let texts = Vec::<String>::deserialize(deserializer)?;
        texts
            .into_iter()
            .map(|t| BASE64.decode(t.as_bytes()).map_err(serde::de::Error::custom))
            .collect()
    }
}

/// HTTP request/response payload carried inside a [`TypedValue::Http`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpData {
    pub method: String,
    pub url: String,
    pub headers: IndexMap<String, String>,
    pub query: IndexMap<String, String>,
    pub params: IndexMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Box<TypedValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_body: Option<Box<TypedValue>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cookies: Vec<Cookie>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<String>,
}

/// A response cookie. Field order matches the wire layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secure: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_only: Option<bool>,
    #[serde(default)]
    pub same_site: SameSite,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_age: Option<i64>,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: None,
            expires: None,
            secure: None,
            http_only: None,
            same_site: SameSite::default(),
            max_age: None,
        }
    }
}

/// Cookie SameSite policy.
///
/// `None` is "no preference expressed" and the default; `ExplicitNone` is
/// the caller's unambiguous opt-out (`SameSite=None` on the Set-Cookie
/// line). The two are distinct on the wire and must never collapse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SameSite {
    #[default]
    None,
    Lax,
    Strict,
    ExplicitNone,
}

// ---------------------------------------------------------------------------
// Envelope and payloads
// ---------------------------------------------------------------------------

/// A wire message: one typed payload plus an optional correlation identifier.
///
/// Every outbound envelope correlated to an inbound one echoes that
/// envelope's correlation identifier unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(correlation_id: Option<String>, payload: Payload) -> Self {
        Self { correlation_id, payload }
    }

    /// Uncorrelated envelope (logs, unsolicited notifications).
    pub fn unsolicited(payload: Payload) -> Self {
        Self {
            correlation_id: None,
            payload,
        }
    }
}

/// The payload union. Externally tagged: the JSON object key is the message
/// kind the dispatcher routes on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Payload {
    InvocationRequest(InvocationRequest),
    InvocationResponse(InvocationResponse),
    InvocationCancel(InvocationCancel),
    Log(LogRecord),
    WorkerInitRequest(WorkerInitRequest),
    WorkerInitResponse(WorkerInitResponse),
    FunctionLoadRequest(FunctionLoadRequest),
    FunctionLoadResponse(FunctionLoadResponse),
    ReloadRequest(ReloadRequest),
    ReloadResponse(ReloadResponse),
    WorkerStatusRequest(WorkerStatusRequest),
    WorkerStatusResponse(WorkerStatusResponse),
    WorkerTerminate(WorkerTerminate),
}

impl Payload {
    /// The routing key, identical to the external JSON tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::InvocationRequest(_) => "invocationRequest",
            Payload::InvocationResponse(_) => "invocationResponse",
            Payload::InvocationCancel(_) => "invocationCancel",
            Payload::Log(_) => "log",
            Payload::WorkerInitRequest(_) => "workerInitRequest",
            Payload::WorkerInitResponse(_) => "workerInitResponse",
            Payload::FunctionLoadRequest(_) => "functionLoadRequest",
            Payload::FunctionLoadResponse(_) => "functionLoadResponse",
            Payload::ReloadRequest(_) => "reloadRequest",
            Payload::ReloadResponse(_) => "reloadResponse",
            Payload::WorkerStatusRequest(_) => "workerStatusRequest",
            Payload::WorkerStatusResponse(_) => "workerStatusResponse",
            Payload::WorkerTerminate(_) => "workerTerminate",
        }
    }
}

/// A named value in an invocation's input or output list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamedValue {
    pub name: String,
    #[serde(default)]
    pub data: TypedValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationRequest {
    pub invocation_id: String,
    pub function_id: String,
    #[serde(default)]
    pub input_data: Vec<NamedValue>,
    #[serde(default)]
    pub trigger_metadata: IndexMap<String, TypedValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Success,
    Failure,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireException {
    pub message: String,
    #[serde(default)]
    pub stack_trace: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResult {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<WireException>,
}

impl StatusResult {
    pub fn success() -> Self {
        Self {
            status: Status::Success,
            exception: None,
        }
    }

    pub fn failure(message: impl Into<String>, stack_trace: impl Into<String>) -> Self {
        Self {
            status: Status::Failure,
            exception: Some(WireException {
                message: message.into(),
                stack_trace: stack_trace.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationResponse {
    pub invocation_id: String,
    pub result: StatusResult,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_data: Vec<NamedValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_value: Option<TypedValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationCancel {
    pub invocation_id: String,
}

/// Log severity, mirroring the host's level set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Information,
    Warning,
    Error,
    Critical,
}

/// Whether a record originates from the engine or from user logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogCategory {
    System,
    User,
    CustomMetric,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,
    pub category: String,
    pub message: String,
    pub level: LogLevel,
    pub log_category: LogCategory,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerInitRequest {
    pub host_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInitResponse {
    pub worker_version: String,
    #[serde(default)]
    pub capabilities: IndexMap<String, String>,
    pub result: StatusResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionLoadRequest {
    pub function_id: String,
    pub metadata: FunctionMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionLoadResponse {
    pub function_id: String,
    pub result: StatusResult,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReloadRequest {
    pub function_app_directory: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadResponse {
    pub result: StatusResult,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkerStatusRequest {}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkerStatusResponse {}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerTerminate {
    pub grace_period_secs: u64,
}

// ---------------------------------------------------------------------------
// Function metadata
// ---------------------------------------------------------------------------

/// Binding data-flow direction as declared in function metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    In,
    Out,
    Inout,
    #[default]
    Unset,
}

impl Direction {
    pub fn is_out_capable(self) -> bool {
        matches!(self, Direction::Out | Direction::Inout)
    }

    pub fn is_in_capable(self) -> bool {
        matches!(self, Direction::In | Direction::Inout)
    }
}

/// One declared binding: a type string plus a direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingInfo {
    #[serde(rename = "type")]
    pub binding_type: String,
    #[serde(default)]
    pub direction: Direction,
}

impl BindingInfo {
    pub fn new(binding_type: impl Into<String>, direction: Direction) -> Self {
        Self {
            binding_type: binding_type.into(),
            direction,
        }
    }
}

/// Metadata record describing one registered function.
///
/// `bindings` is an ordered map from binding name to [`BindingInfo`];
/// declaration order is preserved from the host.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FunctionMetadata {
    pub id: String,
    pub name: String,
    pub directory: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
    pub bindings: IndexMap<String, BindingInfo>,
}

impl FunctionMetadata {
    /// The return binding, if declared with an out-capable direction.
    pub fn return_binding(&self) -> Option<&BindingInfo> {
        self.bindings.get(RETURN_BINDING).filter(|b| b.direction.is_out_capable())
    }

    /// Name of the HTTP output binding, if one is declared.
    ///
    /// Legacy completion paths default to this binding, so its name is
    /// resolved here rather than rediscovered per call site.
    pub fn http_output_name(&self) -> Option<&str> {
        self.bindings
            .iter()
            .find(|(name, info)| {
                info.binding_type == "http" && info.direction.is_out_capable() && name.as_str() != RETURN_BINDING
            })
            .map(|(name, _)| name.as_str())
    }

    /// Declared output bindings other than the return binding, in order.
    pub fn output_bindings(&self) -> impl Iterator<Item = (&str, &BindingInfo)> {
        self.bindings
            .iter()
            .filter(|(name, info)| info.direction.is_out_capable() && name.as_str() != RETURN_BINDING)
            .map(|(name, info)| (name.as_str(), info))
    }

    /// Whether any input binding is HTTP-shaped.
    pub fn has_http_input(&self) -> bool {
        self.bindings
            .values()
            .any(|info| info.binding_type == "httpTrigger" && info.direction.is_in_capable())
    }

    /// Whether the function is triggered by a Durable activity.
    ///
    /// Activity triggers treat explicit falsy returns (`0`, `false`, `""`)
    /// as meaningful results that must still be serialized.
    pub fn has_activity_trigger(&self) -> bool {
        self.bindings.values().any(|info| info.binding_type == "activityTrigger")
    }
}

// ---------------------------------------------------------------------------
// Outbound validation
// ---------------------------------------------------------------------------

/// Validate an outbound envelope against the wire schema.
///
/// Checks the structural invariants the host relies on: correlation of
/// responses to invocations, the return binding never appearing in
/// `outputData`, failure responses always carrying an exception. Callers
/// treat any error as fatal, so only invariants the engine itself owns
/// belong here; anything user logic can influence (log message content,
/// binding values) must never fail validation.
pub fn validate_envelope(envelope: &Envelope) -> Result<(), SchemaError> {
    match &envelope.payload {
        Payload::InvocationResponse(response) => {
            if response.invocation_id.is_empty() {
                return Err(SchemaError::MissingInvocationId {
                    kind: "invocationResponse",
                });
            }
            let mut seen: Vec<&str> = Vec::with_capacity(response.output_data.len());
            for output in &response.output_data {
                if output.name == RETURN_BINDING {
                    return Err(SchemaError::ReturnInOutputData);
                }
                if seen.contains(&output.name.as_str()) {
                    return Err(SchemaError::DuplicateOutput {
                        name: output.name.clone(),
                    });
                }
                seen.push(&output.name);
            }
            if response.result.status == Status::Failure && response.result.exception.is_none() {
                return Err(SchemaError::FailureWithoutException);
            }
            Ok(())
        }
        Payload::FunctionLoadResponse(response) => {
            if response.function_id.is_empty() {
                return Err(SchemaError::MissingFunctionId);
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
