//! Bidirectional mapping between wire `TypedValue`s and engine values.
//!
//! Three families of conversion live here:
//!
//! - scalar/collection conversion ([`to_value`] / [`from_value`]), both
//!   total — a value that fits no wire variant is JSON-serialized
//! - HTTP sub-conversion ([`http_from_wire`], [`http_to_wire`],
//!   [`http_to_wire_response`]) including cookie and SameSite mapping
//! - trigger-metadata normalization ([`normalize_trigger_metadata`]), the
//!   recursive camel-casing pass
//!
//! plus [`resolve_outputs`], the tie-break algorithm that merges a
//! function's returned value, the context's mutable bindings map, and the
//! default HTTP response into the response's output list and return slot.

use chrono::DateTime;
use chrono::Utc;
use indexmap::IndexMap;

use crate::context::HttpRequest;
use crate::context::HttpResponseState;
use crate::value::Value;
use crate::wire::Cookie;
use crate::wire::FunctionMetadata;
use crate::wire::HttpData;
use crate::wire::NamedValue;
use crate::wire::SameSite;
use crate::wire::TypedValue;

/// Conversion failure surfaced as the invocation's error.
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error(
        "HTTP response must be a map-like object, got {found}; to return a raw body, use an object like {{ body: ... }}"
    )]
    HttpResponseNotMapLike { found: &'static str },
    #[error("cookie at index {index} is missing required field '{field}'")]
    CookieMissingField { index: usize, field: &'static str },
    #[error("cookie '{name}' has an unparseable expires value '{value}'")]
    CookieBadExpires { name: String, value: String },
}

/// Whether string-shaped wire values should be parsed as JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonCoercion {
    Enabled,
    Disabled,
}

/// Decode a wire value into an engine value. Total.
///
/// With coercion enabled, `string` and `json` variants parse as JSON and
/// fall back to the raw string on parse failure; with coercion disabled
/// both yield the literal string. An absent value (`Empty`) yields `Null`,
/// distinct from an explicit empty string.
pub fn to_value(data: &TypedValue, coercion: JsonCoercion) -> Value {
    match data {
        TypedValue::Empty => Value::Null,
        TypedValue::String(s) | TypedValue::Json(s) => match coercion {
            JsonCoercion::Enabled => match serde_json::from_str::<serde_json::Value>(s) {
                Ok(json) => Value::from_json(json),
                Err(_) => Value::String(s.clone()),
            },
            JsonCoercion::Disabled => Value::String(s.clone()),
        },
        TypedValue::Bytes(bytes) => Value::Bytes(bytes.clone()),
        TypedValue::Int(n) => Value::Int(*n),
        TypedValue::Double(d) => Value::Double(*d),
        TypedValue::Http(data) => http_from_wire(data).to_value(),
        TypedValue::CollectionString(items) => Value::Array(items.iter().cloned().map(Value::String).collect()),
        TypedValue::CollectionBytes(items) => Value::Array(items.iter().cloned().map(Value::Bytes).collect()),
        TypedValue::CollectionDouble(items) => Value::Array(items.iter().copied().map(Value::Double).collect()),
        TypedValue::CollectionSint64(items) => Value::Array(items.iter().copied().map(Value::Int).collect()),
        TypedValue::NullableString(value) => value.clone().map(Value::String).unwrap_or(Value::Null),
        TypedValue::NullableBool(value) => value.map(Value::Bool).unwrap_or(Value::Null),
        TypedValue::NullableDouble(value) => value.map(Value::Double).unwrap_or(Value::Null),
        TypedValue::NullableTimestamp(value) => {
            value.map(|t| Value::String(t.to_rfc3339())).unwrap_or(Value::Null)
        }
    }
}

/// Encode an engine value as a wire value. Total; this is the default wire
/// encoding for arbitrary output binding values.
pub fn from_value(value: &Value) -> TypedValue {
    match value {
        Value::String(s) => TypedValue::String(s.clone()),
        Value::Bytes(bytes) => TypedValue::Bytes(bytes.clone()),
        Value::Int(n) => TypedValue::Int(*n),
        // `i64::MIN as f64` and `i64::MAX as f64` are exact powers of two;
        // MAX rounds up past i64::MAX, so the upper bound is exclusive.
        Value::Double(d) if d.fract() == 0.0 && *d >= i64::MIN as f64 && *d < i64::MAX as f64 => {
            TypedValue::Int(*d as i64)
        }
        Value::Double(d) => TypedValue::Double(*d),
        other => {
            let text = serde_json::to_string(&other.to_json()).unwrap_or_else(|_| "null".to_string());
            TypedValue::Json(text)
        }
    }
}

/// Flatten a wire `httpData` into a normalized request.
///
/// The body is decoded with JSON coercion enabled; the raw body is always
/// the literal byte/string payload.
pub fn http_from_wire(data: &HttpData) -> HttpRequest {
    HttpRequest {
        method: data.method.clone(),
        url: data.url.clone(),
        headers: data.headers.clone(),
        query: data.query.clone(),
        params: data.params.clone(),
        body: data.body.as_deref().map(|b| to_value(b, JsonCoercion::Enabled)).unwrap_or(Value::Null),
        raw_body: data.raw_body.as_deref().map(|b| to_value(b, JsonCoercion::Disabled)).unwrap_or(Value::Null),
    }
}

fn value_shape(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Int(_) | Value::Double(_) => "a number",
        Value::String(_) => "a string",
        Value::Bytes(_) => "a byte buffer",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn stringify_scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Int(n) => Some(n.to_string()),
        Value::Double(d) => Some(d.to_string()),
        _ => None,
    }
}

fn string_map(value: Option<&Value>) -> IndexMap<String, String> {
    let mut map = IndexMap::new();
    if let Some(Value::Object(entries)) = value {
        for (key, entry) in entries {
            if let Some(text) = stringify_scalar(entry) {
                map.insert(key.clone(), text);
            }
        }
    }
    map
}

/// Map a dynamic SameSite string to the wire enum.
///
/// "lax" and "strict" (case-insensitive) select the matching policy. The
/// literal "none" collapses to `None` — indistinguishable from no
/// preference on this path; `ExplicitNone` is reachable only through the
/// typed cookie API, the statically unambiguous opt-out.
fn same_site_from_str(text: &str) -> SameSite {
    if text.eq_ignore_ascii_case("lax") {
        SameSite::Lax
    } else if text.eq_ignore_ascii_case("strict") {
        SameSite::Strict
    } else {
        SameSite::None
    }
}

fn cookie_expires(name: &str, value: &Value) -> Result<Option<DateTime<Utc>>, ConvertError> {
    match value {
        Value::Null => Ok(None),
        Value::Int(secs) => Ok(DateTime::<Utc>::from_timestamp(*secs, 0)),
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .map(|t| t.with_timezone(&Utc))
            .or_else(|_| DateTime::parse_from_rfc2822(text).map(|t| t.with_timezone(&Utc)))
            .map(Some)
            .map_err(|_| ConvertError::CookieBadExpires {
                name: name.to_string(),
                value: text.clone(),
            }),
        other => Err(ConvertError::CookieBadExpires {
            name: name.to_string(),
            value: format!("{other:?}"),
        }),
    }
}

fn cookie_from_value(index: usize, value: &Value) -> Result<Cookie, ConvertError> {
    let object = value.as_object().ok_or(ConvertError::CookieMissingField { index, field: "name" })?;
    let field_str = |field: &'static str| -> Result<String, ConvertError> {
        object
            .get(field)
            .and_then(|v| stringify_scalar(v))
            .ok_or(ConvertError::CookieMissingField { index, field })
    };
    let name = field_str("name")?;
    let value_text = field_str("value")?;

    let mut cookie = Cookie::new(name.clone(), value_text);
    cookie.domain = object.get("domain").and_then(stringify_scalar);
    cookie.path = object.get("path").and_then(stringify_scalar);
    if let Some(expires) = object.get("expires") {
        cookie.expires = cookie_expires(&name, expires)?;
    }
    cookie.secure = object.get("secure").and_then(|v| match v {
        Value::Bool(b) => Some(*b),
        _ => None,
    });
    cookie.http_only = object.get("httpOnly").and_then(|v| match v {
        Value::Bool(b) => Some(*b),
        _ => None,
    });
    if let Some(same_site) = object.get("sameSite").and_then(|v| v.as_str()) {
        cookie.same_site = same_site_from_str(same_site);
    }
    cookie.max_age = object.get("maxAge").and_then(Value::as_int);
    Ok(cookie)
}

/// Encode a dynamic response value as wire `httpData`.
///
/// The input must be map-like; arrays and bare strings draw a specific
/// diagnosis because callers commonly mistake "respond with a string" for a
/// valid response shape. The status is taken from `statusCode`, falling
/// back to `status`, and stringified.
pub fn http_to_wire(value: &Value) -> Result<HttpData, ConvertError> {
    let object = value.as_object().ok_or(ConvertError::HttpResponseNotMapLike {
        found: value_shape(value),
    })?;

    let status_code = object
        .get("statusCode")
        .or_else(|| object.get("status"))
        .and_then(stringify_scalar);

    let mut cookies = Vec::new();
    if let Some(Value::Array(items)) = object.get("cookies") {
        for (index, item) in items.iter().enumerate() {
            cookies.push(cookie_from_value(index, item)?);
        }
    }

    Ok(HttpData {
        headers: string_map(object.get("headers")),
        body: object.get("body").map(|b| Box::new(from_value(b))),
        cookies,
        status_code,
        ..HttpData::default()
    })
}

/// Encode the response builder's accumulated state as wire `httpData`.
///
/// Typed cookies pass through unchanged, so `SameSite::ExplicitNone` set
/// through the builder survives to the wire.
pub fn http_to_wire_response(state: &HttpResponseState) -> HttpData {
    HttpData {
        headers: state.headers.clone(),
        body: if state.body.is_null() {
            None
        } else {
            Some(Box::new(from_value(&state.body)))
        },
        cookies: state.cookies.clone(),
        status_code: state.status_code.clone(),
        ..HttpData::default()
    }
}

/// Lowercase the first character of a key, leaving the rest verbatim.
fn camel_case(key: &str) -> String {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Recursively camel-case the keys of object values. Arrays are not
/// key-renamed; their element objects are recursed into.
fn camelize_keys(value: Value) -> Value {
    match value {
        Value::Object(entries) => {
            Value::Object(entries.into_iter().map(|(k, v)| (camel_case(&k), camelize_keys(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(camelize_keys).collect()),
        other => other,
    }
}

/// Normalize trigger metadata into the context's `bindingData` object.
///
/// Every key is recursively camel-cased; values decode with JSON coercion
/// enabled, so `json`-wrapped payloads surface as structured objects. The
/// original keys are not separately reachable. Idempotent on its own
/// output.
pub fn normalize_trigger_metadata(metadata: &IndexMap<String, TypedValue>) -> Value {
    let entries = metadata
        .iter()
        .map(|(key, data)| (camel_case(key), camelize_keys(to_value(data, JsonCoercion::Enabled))))
        .collect();
    Value::Object(entries)
}

/// The assembled response outputs: the named output list plus the return
/// slot. The return binding's name never appears in `outputs`.
#[derive(Debug, Default, PartialEq)]
pub struct ResolvedOutputs {
    pub outputs: Vec<NamedValue>,
    pub return_value: Option<TypedValue>,
}

fn encode_binding(binding_type: &str, value: &Value) -> Result<TypedValue, ConvertError> {
    if binding_type == "http" {
        Ok(TypedValue::Http(Box::new(http_to_wire(value)?)))
    } else {
        Ok(from_value(value))
    }
}

/// Merge the function's returned value, the context's mutable bindings map,
/// and the default HTTP response into the response's outputs.
///
/// Tie-break order:
///
/// 1. A falsy return counts as "nothing returned" — except the explicit
///    falsy shapes (`0`, `false`, `""`) under an activity trigger, which are
///    semantically meaningful and still serialize.
/// 2. With a declared return binding, the returned value goes wholesale to
///    the return slot; declared outputs populate only from the bindings map.
/// 3. Without one, a returned plain object contributes each field matching
///    a declared output name; a return that produced no output and no
///    return slot falls back to the return slot wholesale unless the
///    function has an HTTP input.
/// 4. The bindings map fills declared outputs the returned object did not
///    already satisfy — return-object data wins per name.
/// 5. A declared HTTP output binding left unpopulated defaults to the
///    response builder's accumulated state.
pub fn resolve_outputs(
    metadata: &FunctionMetadata,
    returned: Option<&Value>,
    bindings: &IndexMap<String, Value>,
    http_response: Option<&HttpResponseState>,
) -> Result<ResolvedOutputs, ConvertError> {
    let mut resolved = ResolvedOutputs::default();
    let mut satisfied_by_return: Vec<&str> = Vec::new();

    let returned_present = returned.is_some_and(|v| {
        v.is_truthy() || (v.is_explicit_falsy() && metadata.has_activity_trigger())
    });

    if let Some(value) = returned.filter(|_| returned_present) {
        if let Some(info) = metadata.return_binding() {
            resolved.return_value = Some(encode_binding(&info.binding_type, value)?);
        } else {
            if let Some(object) = value.as_object() {
                for (name, info) in metadata.output_bindings() {
                    if let Some(field) = object.get(name) {
                        resolved.outputs.push(NamedValue {
                            name: name.to_string(),
                            data: encode_binding(&info.binding_type, field)?,
                        });
                        satisfied_by_return.push(name);
                    }
                }
            }
            if resolved.outputs.is_empty() && resolved.return_value.is_none() && !metadata.has_http_input() {
                resolved.return_value = Some(from_value(value));
            }
        }
    }

    for (name, info) in metadata.output_bindings() {
        if satisfied_by_return.contains(&name) {
            continue;
        }
        if let Some(value) = bindings.get(name) {
            resolved.outputs.push(NamedValue {
                name: name.to_string(),
                data: encode_binding(&info.binding_type, value)?,
            });
        }
    }

    if let Some(http_name) = metadata.http_output_name()
        && !resolved.outputs.iter().any(|o| o.name == http_name)
        && let Some(state) = http_response
    {
        resolved.outputs.push(NamedValue {
            name: http_name.to_string(),
            data: TypedValue::Http(Box::new(http_to_wire_response(state))),
        });
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::BindingInfo;
    use crate::wire::Direction;
    use crate::wire::RETURN_BINDING;

    fn metadata(bindings: &[(&str, &str, Direction)]) -> FunctionMetadata {
        let mut meta = FunctionMetadata::default();
        for (name, binding_type, direction) in bindings {
            meta.bindings.insert(name.to_string(), BindingInfo::new(*binding_type, *direction));
        }
        meta
    }

    // -------------------------------------------------------------------------
    // to_value / from_value
    // -------------------------------------------------------------------------

    #[test]
    fn json_string_coerces_and_falls_back() {
        let parsed = to_value(&TypedValue::Json("{\"a\":1}".to_string()), JsonCoercion::Enabled);
        assert_eq!(parsed, Value::object([("a", Value::Int(1))]));

        let fallback = to_value(&TypedValue::Json("not json".to_string()), JsonCoercion::Enabled);
        assert_eq!(fallback, Value::String("not json".to_string()));
    }

    #[test]
    fn raw_body_is_never_coerced() {
        let literal = to_value(&TypedValue::String("{\"a\":1}".to_string()), JsonCoercion::Disabled);
        assert_eq!(literal, Value::String("{\"a\":1}".to_string()));
    }

    #[test]
    fn empty_is_null_not_empty_string() {
        assert_eq!(to_value(&TypedValue::Empty, JsonCoercion::Enabled), Value::Null);
        assert_eq!(
            to_value(&TypedValue::String(String::new()), JsonCoercion::Enabled),
            Value::String(String::new())
        );
    }

    #[test]
    fn collections_convert_element_wise() {
        let data = TypedValue::CollectionSint64(vec![1, 2, 3]);
        assert_eq!(
            to_value(&data, JsonCoercion::Enabled),
            Value::Array(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
    }

    #[test]
    fn nullable_none_maps_to_null() {
        assert_eq!(to_value(&TypedValue::NullableBool(None), JsonCoercion::Enabled), Value::Null);
        assert_eq!(
            to_value(&TypedValue::NullableBool(Some(true)), JsonCoercion::Enabled),
            Value::Bool(true)
        );
    }

    #[test]
    fn from_value_picks_int_for_integral_numbers() {
        assert_eq!(from_value(&Value::Int(4)), TypedValue::Int(4));
        assert_eq!(from_value(&Value::Double(4.0)), TypedValue::Int(4));
        assert_eq!(from_value(&Value::Double(4.5)), TypedValue::Double(4.5));
    }

    #[test]
    fn from_value_keeps_out_of_range_integral_doubles_as_doubles() {
        assert_eq!(from_value(&Value::Double(1e300)), TypedValue::Double(1e300));
        assert_eq!(from_value(&Value::Double(-1e300)), TypedValue::Double(-1e300));
        // 2^63 is integral but one past i64::MAX.
        assert_eq!(
            from_value(&Value::Double(9_223_372_036_854_775_808.0)),
            TypedValue::Double(9_223_372_036_854_775_808.0)
        );
        assert_eq!(from_value(&Value::Double(-9_223_372_036_854_775_808.0)), TypedValue::Int(i64::MIN));
    }

    #[test]
    fn from_value_serializes_structures_to_json() {
        let data = from_value(&Value::object([("hello", Value::String("world".to_string()))]));
        assert_eq!(data, TypedValue::Json("{\"hello\":\"world\"}".to_string()));
    }

    #[test]
    fn roundtrip_is_idempotent_after_first_normalization() {
        let variants = [
            TypedValue::String("hi".to_string()),
            TypedValue::Json("{\"a\":[1,2]}".to_string()),
            TypedValue::Bytes(vec![1, 2, 3]),
            TypedValue::Int(42),
            TypedValue::Double(1.5),
            TypedValue::CollectionString(vec!["a".to_string()]),
            TypedValue::CollectionDouble(vec![0.5]),
            TypedValue::CollectionSint64(vec![7]),
            TypedValue::NullableString(Some("s".to_string())),
            TypedValue::NullableBool(Some(false)),
            TypedValue::NullableDouble(None),
            TypedValue::NullableTimestamp(None),
            TypedValue::Empty,
        ];
        for variant in variants {
            let once = to_value(&variant, JsonCoercion::Enabled);
            let twice = to_value(&from_value(&once), JsonCoercion::Enabled);
            assert_eq!(twice, once, "variant {variant:?} did not stabilize");
        }
    }

    // -------------------------------------------------------------------------
    // HTTP conversion
    // -------------------------------------------------------------------------

    #[test]
    fn http_to_wire_rejects_arrays_and_strings() {
        let err = http_to_wire(&Value::Array(Vec::new())).unwrap_err();
        assert!(err.to_string().contains("an array"));
        let err = http_to_wire(&Value::String("hi".to_string())).unwrap_err();
        assert!(err.to_string().contains("a string"));
    }

    #[test]
    fn http_to_wire_prefers_status_code_over_status() {
        let data = http_to_wire(&Value::object([
            ("status", Value::Int(200)),
            ("statusCode", Value::Int(404)),
        ]))
        .unwrap();
        assert_eq!(data.status_code.as_deref(), Some("404"));

        let data = http_to_wire(&Value::object([("status", Value::Int(200))])).unwrap();
        assert_eq!(data.status_code.as_deref(), Some("200"));
    }

    #[test]
    fn cookie_same_site_mapping() {
        let response = Value::object([(
            "cookies",
            Value::Array(vec![
                Value::object([
                    ("name", Value::from("a")),
                    ("value", Value::from("1")),
                    ("sameSite", Value::from("Lax")),
                ]),
                Value::object([
                    ("name", Value::from("b")),
                    ("value", Value::from("2")),
                    ("sameSite", Value::from("none")),
                ]),
                Value::object([("name", Value::from("c")), ("value", Value::from("3"))]),
            ]),
        )]);
        let data = http_to_wire(&response).unwrap();
        assert_eq!(data.cookies[0].same_site, SameSite::Lax);
        assert_eq!(data.cookies[1].same_site, SameSite::None);
        assert_eq!(data.cookies[2].same_site, SameSite::None);
    }

    #[test]
    fn cookie_requires_name_and_value() {
        let response = Value::object([(
            "cookies",
            Value::Array(vec![Value::object([("name", Value::from("a"))])]),
        )]);
        let err = http_to_wire(&response).unwrap_err();
        assert!(matches!(err, ConvertError::CookieMissingField { field: "value", .. }));
    }

    #[test]
    fn explicit_none_survives_the_typed_path() {
        let mut cookie = Cookie::new("session", "x");
        cookie.same_site = SameSite::ExplicitNone;
        let state = HttpResponseState {
            cookies: vec![cookie],
            ..HttpResponseState::default()
        };
        let data = http_to_wire_response(&state);
        assert_eq!(data.cookies[0].same_site, SameSite::ExplicitNone);
    }

    #[test]
    fn http_from_wire_decodes_body_but_not_raw_body() {
        let data = HttpData {
            method: "POST".to_string(),
            body: Some(Box::new(TypedValue::String("{\"a\":1}".to_string()))),
            raw_body: Some(Box::new(TypedValue::String("{\"a\":1}".to_string()))),
            ..HttpData::default()
        };
        let request = http_from_wire(&data);
        assert_eq!(request.body, Value::object([("a", Value::Int(1))]));
        assert_eq!(request.raw_body, Value::String("{\"a\":1}".to_string()));
    }

    // -------------------------------------------------------------------------
    // Trigger metadata normalization
    // -------------------------------------------------------------------------

    #[test]
    fn trigger_metadata_camel_cases_recursively() {
        let mut metadata = IndexMap::new();
        metadata.insert(
            "Sys".to_string(),
            TypedValue::Json("{\"MethodName\":\"f\",\"UtcNow\":\"2018\"}".to_string()),
        );
        let normalized = normalize_trigger_metadata(&metadata);
        let object = normalized.as_object().unwrap();
        assert!(object.get("Sys").is_none(), "original key must not be reachable");
        let sys = object.get("sys").unwrap().as_object().unwrap();
        assert_eq!(sys.get("methodName"), Some(&Value::String("f".to_string())));
        assert_eq!(sys.get("utcNow"), Some(&Value::String("2018".to_string())));
    }

    #[test]
    fn camel_casing_is_idempotent() {
        let mut metadata = IndexMap::new();
        metadata.insert(
            "Outer".to_string(),
            TypedValue::Json("{\"Items\":[{\"InnerKey\":1}],\"Plain\":2}".to_string()),
        );
        let once = normalize_trigger_metadata(&metadata);
        let twice = camelize_keys(once.clone());
        assert_eq!(twice, once);
    }

    #[test]
    fn array_elements_are_camel_cased_but_arrays_are_not_renamed() {
        let mut metadata = IndexMap::new();
        metadata.insert("List".to_string(), TypedValue::Json("[{\"ItemName\":\"x\"}]".to_string()));
        let normalized = normalize_trigger_metadata(&metadata);
        let list = normalized.as_object().unwrap().get("list").unwrap();
        let Value::Array(items) = list else {
            panic!("expected array, got {list:?}")
        };
        assert_eq!(items[0].as_object().unwrap().get("itemName"), Some(&Value::String("x".to_string())));
    }

    // -------------------------------------------------------------------------
    // Output resolution
    // -------------------------------------------------------------------------

    #[test]
    fn nothing_returned_and_no_bindings_yields_no_outputs() {
        let meta = metadata(&[("res", "queue", Direction::Out)]);
        let resolved = resolve_outputs(&meta, None, &IndexMap::new(), None).unwrap();
        assert!(resolved.outputs.is_empty());
        assert!(resolved.return_value.is_none());
    }

    #[test]
    fn falsy_return_is_dropped_without_activity_trigger() {
        let meta = metadata(&[("res", "queue", Direction::Out)]);
        let resolved = resolve_outputs(&meta, Some(&Value::Int(0)), &IndexMap::new(), None).unwrap();
        assert!(resolved.return_value.is_none());
    }

    #[test]
    fn falsy_return_survives_under_activity_trigger() {
        let meta = metadata(&[("name", "activityTrigger", Direction::Out)]);
        let resolved = resolve_outputs(&meta, Some(&Value::Int(0)), &IndexMap::new(), None).unwrap();
        assert_eq!(resolved.return_value, Some(TypedValue::Int(0)));

        let resolved = resolve_outputs(&meta, Some(&Value::String(String::new())), &IndexMap::new(), None).unwrap();
        assert_eq!(resolved.return_value, Some(TypedValue::String(String::new())));
    }

    #[test]
    fn declared_return_binding_takes_the_value_wholesale() {
        let meta = metadata(&[(RETURN_BINDING, "queue", Direction::Out), ("res", "queue", Direction::Out)]);
        let returned = Value::object([("res", Value::Int(1)), ("other", Value::Int(2))]);
        let resolved = resolve_outputs(&meta, Some(&returned), &IndexMap::new(), None).unwrap();
        // The whole object goes to the return slot; `res` inside it is not
        // mined for outputs.
        assert!(resolved.outputs.is_empty());
        assert_eq!(resolved.return_value, Some(TypedValue::Json("{\"res\":1,\"other\":2}".to_string())));
    }

    #[test]
    fn return_object_fields_populate_declared_outputs() {
        let meta = metadata(&[("res", "queue", Direction::Out)]);
        let returned = Value::object([("res", Value::Int(5)), ("ignored", Value::Int(6))]);
        let resolved = resolve_outputs(&meta, Some(&returned), &IndexMap::new(), None).unwrap();
        assert_eq!(resolved.outputs.len(), 1);
        assert_eq!(resolved.outputs[0].name, "res");
        assert_eq!(resolved.outputs[0].data, TypedValue::Int(5));
        assert!(resolved.return_value.is_none());
    }

    #[test]
    fn return_object_beats_bindings_map_for_the_same_name() {
        let meta = metadata(&[("res", "queue", Direction::Out)]);
        let returned = Value::object([("res", Value::Int(1))]);
        let mut bindings = IndexMap::new();
        bindings.insert("res".to_string(), Value::Int(2));
        let resolved = resolve_outputs(&meta, Some(&returned), &bindings, None).unwrap();
        assert_eq!(resolved.outputs.len(), 1);
        assert_eq!(resolved.outputs[0].data, TypedValue::Int(1));
    }

    #[test]
    fn scalar_return_falls_back_to_the_return_slot() {
        let meta = metadata(&[("res", "queue", Direction::Out)]);
        let resolved = resolve_outputs(&meta, Some(&Value::Int(9)), &IndexMap::new(), None).unwrap();
        assert!(resolved.outputs.is_empty());
        assert_eq!(resolved.return_value, Some(TypedValue::Int(9)));
    }

    #[test]
    fn scalar_return_fallback_is_suppressed_for_http_functions() {
        let meta = metadata(&[("req", "httpTrigger", Direction::In), ("res", "http", Direction::Out)]);
        let resolved = resolve_outputs(&meta, Some(&Value::String("hello".to_string())), &IndexMap::new(), None).unwrap();
        assert!(resolved.return_value.is_none());
    }

    #[test]
    fn bindings_map_populates_unsatisfied_outputs() {
        let meta = metadata(&[("a", "queue", Direction::Out), ("b", "queue", Direction::Out)]);
        let returned = Value::object([("a", Value::Int(1))]);
        let mut bindings = IndexMap::new();
        bindings.insert("b".to_string(), Value::Int(2));
        bindings.insert("unrelated".to_string(), Value::Int(3));
        let resolved = resolve_outputs(&meta, Some(&returned), &bindings, None).unwrap();
        let names: Vec<&str> = resolved.outputs.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[test]
    fn http_output_defaults_to_the_response_builder_state() {
        let meta = metadata(&[("req", "httpTrigger", Direction::In), ("res", "http", Direction::Out)]);
        let state = HttpResponseState {
            status_code: Some("204".to_string()),
            ..HttpResponseState::default()
        };
        let resolved = resolve_outputs(&meta, None, &IndexMap::new(), Some(&state)).unwrap();
        assert_eq!(resolved.outputs.len(), 1);
        assert_eq!(resolved.outputs[0].name, "res");
        let TypedValue::Http(data) = &resolved.outputs[0].data else {
            panic!("expected http output")
        };
        assert_eq!(data.status_code.as_deref(), Some("204"));
    }

    #[test]
    fn explicit_http_binding_suppresses_the_default() {
        let meta = metadata(&[("req", "httpTrigger", Direction::In), ("res", "http", Direction::Out)]);
        let mut bindings = IndexMap::new();
        bindings.insert("res".to_string(), Value::object([("statusCode", Value::Int(418))]));
        let state = HttpResponseState::default();
        let resolved = resolve_outputs(&meta, None, &bindings, Some(&state)).unwrap();
        assert_eq!(resolved.outputs.len(), 1);
        let TypedValue::Http(data) = &resolved.outputs[0].data else {
            panic!("expected http output")
        };
        assert_eq!(data.status_code.as_deref(), Some("418"));
    }
}
