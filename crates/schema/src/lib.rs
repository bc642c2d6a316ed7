//! Per-service schema extraction and cross-service unification.
//!
//! Each upstream service describes its accepted configuration as a property
//! bag (per-property `type`, nested `items`/`properties` for arrays of
//! objects, a `format` marker for secret-like fields). This crate turns one
//! such document into a [`FieldMap`] and merges the per-service maps into a
//! single superset schema safe to expose as one configuration surface.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use once_cell::sync::OnceCell;
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

use pipeform_core::{FieldMap, FieldSpec, ValueKind};

/// Format marker flagging a property as secret-like.
const SECRET_FORMAT: &str = "password";

/// Vendor extension naming the sub-field that identifies a row of an
/// array-of-object property.
const CORRELATION_KEY_EXT: &str = "x_correlation_key";

/// Vendor extension overriding the element kind of a string-list property.
const ITEM_KIND_EXT: &str = "x_item_kind";

/// Build the field map for a single service from its property-bag document.
///
/// A malformed document is fatal: the caller cannot do anything useful with
/// a partial schema, so this is treated as a startup failure.
pub fn extract_service_fields(service: &str, doc: &Json) -> Result<FieldMap> {
    let props = doc
        .get("properties")
        .and_then(|p| p.as_object())
        .ok_or_else(|| anyhow!("service {service}: schema document has no properties object"))?;
    extract_properties(service, props)
}

fn extract_properties(
    service: &str,
    props: &serde_json::Map<String, Json>,
) -> Result<FieldMap> {
    let mut out = FieldMap::new();
    for (name, prop) in props {
        if let Some(spec) = extract_property(service, name, prop)? {
            out.insert(name.clone(), spec);
        }
    }
    Ok(out)
}

fn extract_property(service: &str, name: &str, prop: &Json) -> Result<Option<FieldSpec>> {
    // Secret-like properties are sensitive strings regardless of the
    // declared primitive type; nothing deeper to classify.
    if prop.get("format").and_then(|f| f.as_str()) == Some(SECRET_FORMAT) {
        return Ok(Some(apply_flags(
            FieldSpec::new(name, ValueKind::String).sensitive(),
            prop,
        )));
    }

    let declared = prop.get("type").and_then(|t| t.as_str()).unwrap_or("");
    let spec = match declared {
        "string" => FieldSpec::new(name, ValueKind::String),
        "integer" => FieldSpec::new(name, ValueKind::Integer),
        "boolean" => FieldSpec::new(name, ValueKind::Boolean),
        "array" => match extract_array(service, name, prop)? {
            Some(s) => s,
            None => return Ok(None),
        },
        other => {
            debug!(service, field = name, declared = other, "skipping unclassifiable property");
            return Ok(None);
        }
    };
    Ok(Some(apply_flags(spec, prop)))
}

fn extract_array(service: &str, name: &str, prop: &Json) -> Result<Option<FieldSpec>> {
    let items = match prop.get("items") {
        Some(i) => i,
        None => {
            debug!(service, field = name, "array property without items; skipping");
            return Ok(None);
        }
    };
    let item_type = items.get("type").and_then(|t| t.as_str()).unwrap_or("");

    if item_type == "object" {
        if let Some(item_props) = items.get("properties").and_then(|p| p.as_object()) {
            let item_fields = extract_properties(service, item_props)?;
            let mut spec =
                FieldSpec::new(name, ValueKind::ObjectList).with_item_fields(item_fields);
            if let Some(key) = prop.get(CORRELATION_KEY_EXT).and_then(|k| k.as_str()) {
                if spec.item_fields.contains_key(key) {
                    spec.item_key = Some(key.to_string());
                } else {
                    debug!(
                        service,
                        field = name,
                        key,
                        "correlation key names no extracted sub-field; dropping"
                    );
                }
            }
            return Ok(Some(spec));
        }
    }

    // Anything else is a flat list of scalars, persisted as strings.
    let mut spec = FieldSpec::new(name, ValueKind::StringList);
    if prop.get(ITEM_KIND_EXT).and_then(|k| k.as_str()) == Some("integer") {
        spec.item_kind_by_service
            .insert(service.to_string(), ValueKind::Integer);
    }
    Ok(Some(spec))
}

fn apply_flags(mut spec: FieldSpec, prop: &Json) -> FieldSpec {
    if prop.get("readonly").and_then(|b| b.as_bool()) == Some(true) {
        spec.read_only = true;
    }
    if prop.get("nullable").and_then(|b| b.as_bool()) == Some(true) {
        spec.nullable = true;
    }
    spec
}

/// Merge per-service field maps into one superset map.
///
/// Collision policy, applied uniformly:
/// - same name, identical kind, both `ObjectList`: sub-fields are merged,
///   the later service winning on a sub-field name collision;
/// - same name, identical kind otherwise: the existing entry stands, with
///   per-service element overrides accumulated and `sensitive`/`nullable`
///   OR-ed (a field secret for one service is treated as secret everywhere);
/// - same name, different kind: the later descriptor is inserted under
///   `{service_id}_{field}`, leaving the earlier entry untouched. Silently
///   picking one kind would corrupt the other service's surface.
pub fn unify(schemas: &[(String, FieldMap)]) -> FieldMap {
    let mut out = FieldMap::new();
    for (service, fields) in schemas {
        for (name, spec) in fields {
            let existing_kind = out.get(name).map(|f| f.kind);
            match existing_kind {
                None => {
                    out.insert(name.clone(), spec.clone());
                }
                Some(kind) if kind == spec.kind => {
                    if let Some(existing) = out.get_mut(name) {
                        existing.sensitive |= spec.sensitive;
                        existing.nullable |= spec.nullable;
                        if spec.kind == ValueKind::ObjectList {
                            for (sub, sub_spec) in &spec.item_fields {
                                existing.item_fields.insert(sub.clone(), sub_spec.clone());
                            }
                            if spec.item_key.is_some() {
                                existing.item_key = spec.item_key.clone();
                            }
                        }
                        for (svc, k) in &spec.item_kind_by_service {
                            existing.item_kind_by_service.insert(svc.clone(), *k);
                        }
                    }
                }
                Some(kind) => {
                    // Operability trace only; the qualified insert below is
                    // what keeps both definitions reachable.
                    debug!(
                        service,
                        field = %name,
                        existing = ?kind,
                        incoming = ?spec.kind,
                        "field kind collision; qualifying with service id"
                    );
                    let qualified = format!("{service}_{name}");
                    let mut q = spec.clone();
                    q.name = qualified.clone();
                    out.insert(qualified, q);
                }
            }
        }
    }
    out
}

/// The two schema source documents, read once at startup and immutable for
/// the process lifetime. The unified map is built lazily on first use and
/// handed out by reference; no process-global state.
#[derive(Debug)]
pub struct ServiceCatalog {
    services: BTreeMap<String, String>,
    fields_by_service: Vec<(String, FieldMap)>,
    unified: OnceCell<FieldMap>,
}

impl ServiceCatalog {
    /// Load `services.json` (service id -> human label) and
    /// `service_schemas.json` (service id -> property bag) from a directory.
    pub fn load(dir: &Path) -> Result<Self> {
        let registry_path = dir.join("services.json");
        let registry_raw = std::fs::read_to_string(&registry_path)
            .with_context(|| format!("reading {}", registry_path.display()))?;
        let services: BTreeMap<String, String> =
            serde_json::from_str(&registry_raw).context("parsing services.json")?;

        let schemas_path = dir.join("service_schemas.json");
        let schemas_raw = std::fs::read_to_string(&schemas_path)
            .with_context(|| format!("reading {}", schemas_path.display()))?;
        let schemas: Json =
            serde_json::from_str(&schemas_raw).context("parsing service_schemas.json")?;

        Self::from_documents(services, &schemas)
    }

    /// Build a catalog from already-decoded documents.
    pub fn from_documents(services: BTreeMap<String, String>, schemas: &Json) -> Result<Self> {
        let mut fields_by_service = Vec::with_capacity(services.len());
        for id in services.keys() {
            let doc = schemas
                .get(id)
                .ok_or_else(|| anyhow!("no schema document for service {id}"))?;
            let fields = extract_service_fields(id, doc)?;
            fields_by_service.push((id.clone(), fields));
        }
        Ok(Self {
            services,
            fields_by_service,
            unified: OnceCell::new(),
        })
    }

    /// Registered services: id -> human label.
    pub fn services(&self) -> &BTreeMap<String, String> {
        &self.services
    }

    /// Fields accepted by a single service, if registered.
    pub fn service_fields(&self, id: &str) -> Option<&FieldMap> {
        self.fields_by_service
            .iter()
            .find(|(svc, _)| svc == id)
            .map(|(_, fields)| fields)
    }

    /// The superset schema across every registered service.
    pub fn unified(&self) -> &FieldMap {
        self.unified
            .get_or_init(|| unify(&self.fields_by_service))
    }
}
