//! Bidirectional state mapping.
//!
//! The read path shapes a decoded upstream response into the flat persisted
//! representation, carrying sensitive values over from prior local state
//! (upstream masks them after creation). The write path turns persisted
//! state back into an upstream request payload, omitting empty scalars and
//! read-only fields and coercing list elements per target service.
//!
//! Both directions are pure functions of their inputs. A map that does not
//! conform to the schema is a contract violation between caller and mapper,
//! surfaced as a single typed [`ShapeError`] rather than a recoverable
//! condition.

#![forbid(unsafe_code)]

use serde_json::Value as Json;

use pipeform_core::{ConfigMap, FieldMap, FieldSpec, ValueKind};

/// Shape violation in a caller-supplied map. Indicates the static schema
/// catalogs and the data disagree, not a user error.
#[derive(Debug, thiserror::Error)]
pub enum ShapeError {
    #[error("field {field}: expected {expected}, got {got}")]
    Mismatch {
        field: String,
        expected: &'static str,
        got: &'static str,
    },
    #[error("field {field}: value {value:?} is not an integer")]
    NotAnInteger { field: String, value: String },
    #[error("field {field}: value {value:?} is not a boolean")]
    NotABoolean { field: String, value: String },
}

fn kind_name(v: &Json) -> &'static str {
    match v {
        Json::Null => "null",
        Json::Bool(_) => "boolean",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

fn mismatch(field: &str, expected: &'static str, got: &Json) -> ShapeError {
    ShapeError::Mismatch {
        field: field.to_string(),
        expected,
        got: kind_name(got),
    }
}

/// Shape an upstream response into the persisted representation.
///
/// Fields absent upstream stay absent in the output; nothing is defaulted.
/// Sensitive fields prefer `prior`'s stored value over upstream's masked
/// one. For `ObjectList` fields the corresponding prior row is located via
/// the descriptor's correlation key so that sensitive sub-fields of that
/// specific row survive; rows without a prior counterpart keep whatever
/// upstream returned.
pub fn upstream_to_local(
    upstream: &ConfigMap,
    prior: Option<&ConfigMap>,
    fields: &FieldMap,
) -> Result<ConfigMap, ShapeError> {
    let mut out = ConfigMap::new();
    for (name, spec) in fields {
        let value = match upstream.get(name) {
            Some(v) => v,
            None => continue,
        };
        if spec.sensitive {
            if let Some(prev) = prior.and_then(|p| p.get(name)) {
                out.insert(name.clone(), prev.clone());
                continue;
            }
        }
        let shaped = match spec.kind {
            ValueKind::String | ValueKind::Integer | ValueKind::Boolean => {
                render_scalar(name, spec.kind, value)?
            }
            ValueKind::StringList => render_string_list(name, value)?,
            ValueKind::ObjectList => render_rows(name, spec, value, prior)?,
        };
        out.insert(name.clone(), shaped);
    }
    Ok(out)
}

/// Persisted scalars are strings; numeric and boolean upstream
/// representations are rendered accordingly.
fn render_scalar(field: &str, kind: ValueKind, value: &Json) -> Result<Json, ShapeError> {
    let s = match (kind, value) {
        (_, Json::String(s)) => s.clone(),
        (ValueKind::Integer, Json::Number(n)) => n.to_string(),
        (ValueKind::Boolean, Json::Bool(b)) => b.to_string(),
        (ValueKind::String, other) => return Err(mismatch(field, "string", other)),
        (ValueKind::Integer, other) => return Err(mismatch(field, "integer", other)),
        (ValueKind::Boolean, other) => return Err(mismatch(field, "boolean", other)),
        (_, other) => return Err(mismatch(field, "scalar", other)),
    };
    Ok(Json::String(s))
}

fn render_string_list(field: &str, value: &Json) -> Result<Json, ShapeError> {
    let arr = value
        .as_array()
        .ok_or_else(|| mismatch(field, "array", value))?;
    let mut out = Vec::with_capacity(arr.len());
    for item in arr {
        match item {
            Json::String(s) => out.push(Json::String(s.clone())),
            // Services with integer-typed elements echo numbers back.
            Json::Number(n) => out.push(Json::String(n.to_string())),
            other => return Err(mismatch(field, "string element", other)),
        }
    }
    Ok(Json::Array(out))
}

fn render_rows(
    field: &str,
    spec: &FieldSpec,
    value: &Json,
    prior: Option<&ConfigMap>,
) -> Result<Json, ShapeError> {
    let rows = value
        .as_array()
        .ok_or_else(|| mismatch(field, "array", value))?;
    let prior_rows = prior
        .and_then(|p| p.get(field))
        .and_then(|v| v.as_array());
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let row_obj = row
            .as_object()
            .ok_or_else(|| mismatch(field, "object row", row))?;
        let local_row = correlate_row(spec, row_obj, prior_rows);
        // Same dispatch, one level down: the correlated local row plays the
        // role of prior state for this row's sub-fields.
        out.push(Json::Object(upstream_to_local(
            row_obj,
            local_row,
            &spec.item_fields,
        )?));
    }
    Ok(Json::Array(out))
}

/// Locate the prior row matching an upstream row by correlation key.
fn correlate_row<'a>(
    spec: &FieldSpec,
    upstream_row: &ConfigMap,
    prior_rows: Option<&'a Vec<Json>>,
) -> Option<&'a ConfigMap> {
    let key = spec.item_key.as_deref()?;
    let upstream_key = upstream_row.get(key)?;
    prior_rows?.iter().find_map(|row| {
        let obj = row.as_object()?;
        (obj.get(key) == Some(upstream_key)).then_some(obj)
    })
}

/// Shape persisted state into an upstream request payload for `service`.
///
/// Only fields explicitly present and non-empty in `local` appear in the
/// output; read-only fields are never sent; empty-string scalars mean
/// "unset" and are omitted entirely (the upstream API distinguishes
/// sending nothing from sending empty).
pub fn local_to_upstream(
    local: &ConfigMap,
    fields: &FieldMap,
    service: &str,
) -> Result<ConfigMap, ShapeError> {
    let mut out = ConfigMap::new();
    for (name, spec) in fields {
        if spec.read_only {
            continue;
        }
        let value = match local.get(name) {
            Some(Json::Null) | None => continue,
            Some(v) => v,
        };
        let encoded = match spec.kind {
            ValueKind::String => match stored_scalar(name, value)? {
                "" => continue,
                s => Json::String(s.to_string()),
            },
            ValueKind::Integer => match stored_scalar(name, value)? {
                "" => continue,
                s => Json::Number(parse_integer(name, s)?),
            },
            ValueKind::Boolean => match stored_scalar(name, value)? {
                "" => continue,
                s => Json::Bool(parse_boolean(name, s)?),
            },
            ValueKind::StringList => encode_string_list(name, spec, value, service)?,
            ValueKind::ObjectList => encode_rows(name, spec, value, service)?,
        };
        out.insert(name.clone(), encoded);
    }
    Ok(out)
}

fn stored_scalar<'a>(field: &str, value: &'a Json) -> Result<&'a str, ShapeError> {
    value
        .as_str()
        .ok_or_else(|| mismatch(field, "stored string", value))
}

fn parse_integer(field: &str, s: &str) -> Result<serde_json::Number, ShapeError> {
    s.parse::<i64>()
        .map(serde_json::Number::from)
        .map_err(|_| ShapeError::NotAnInteger {
            field: field.to_string(),
            value: s.to_string(),
        })
}

fn parse_boolean(field: &str, s: &str) -> Result<bool, ShapeError> {
    match s {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ShapeError::NotABoolean {
            field: field.to_string(),
            value: s.to_string(),
        }),
    }
}

fn encode_string_list(
    field: &str,
    spec: &FieldSpec,
    value: &Json,
    service: &str,
) -> Result<Json, ShapeError> {
    let arr = value
        .as_array()
        .ok_or_else(|| mismatch(field, "array", value))?;
    let as_integers = spec.item_kind_by_service.get(service) == Some(&ValueKind::Integer);
    let mut out = Vec::with_capacity(arr.len());
    for item in arr {
        let s = item
            .as_str()
            .ok_or_else(|| mismatch(field, "string element", item))?;
        if as_integers {
            out.push(Json::Number(parse_integer(field, s)?));
        } else {
            out.push(Json::String(s.to_string()));
        }
    }
    Ok(Json::Array(out))
}

fn encode_rows(
    field: &str,
    spec: &FieldSpec,
    value: &Json,
    service: &str,
) -> Result<Json, ShapeError> {
    let rows = value
        .as_array()
        .ok_or_else(|| mismatch(field, "array", value))?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let row_obj = row
            .as_object()
            .ok_or_else(|| mismatch(field, "object row", row))?;
        out.push(Json::Object(local_to_upstream(
            row_obj,
            &spec.item_fields,
            service,
        )?));
    }
    Ok(Json::Array(out))
}
