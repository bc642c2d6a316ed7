//! Pipeform core types: the configuration field vocabulary.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One flat resource configuration instance: field name -> persisted value.
///
/// Both the locally persisted state and a freshly decoded upstream response
/// are carried in this shape; the state mapper converts between the two.
pub type ConfigMap = serde_json::Map<String, serde_json::Value>;

/// Schema map: field name -> descriptor. BTreeMap keeps iteration stable so
/// schema unification is order-independent in its output.
pub type FieldMap = BTreeMap<String, FieldSpec>;

/// Kind of value a configuration field holds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ValueKind {
    String,
    Integer,
    Boolean,
    StringList,
    ObjectList,
}

/// Typed, policy-annotated description of one configuration field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: ValueKind,
    /// Upstream never echoes the true value back after creation; the read
    /// path must carry it over from prior local state.
    #[serde(default)]
    pub sensitive: bool,
    /// Absence is a valid value for this field.
    #[serde(default)]
    pub nullable: bool,
    /// Upstream-computed; never sent on write.
    #[serde(default)]
    pub read_only: bool,
    /// Row shape for `ObjectList` fields; empty for every other kind.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub item_fields: FieldMap,
    /// Sub-field that uniquely identifies a row within an `ObjectList`,
    /// used to correlate local and upstream rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_key: Option<String>,
    /// Per-service element kind for `StringList` fields. Some services
    /// represent a list's members as integers rather than strings.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub item_kind_by_service: BTreeMap<String, ValueKind>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            sensitive: false,
            nullable: false,
            read_only: false,
            item_fields: BTreeMap::new(),
            item_key: None,
            item_kind_by_service: BTreeMap::new(),
        }
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn with_item_fields(mut self, fields: FieldMap) -> Self {
        self.item_fields = fields;
        self
    }

    pub fn with_item_key(mut self, key: impl Into<String>) -> Self {
        self.item_key = Some(key.into());
        self
    }

    /// True for list-shaped fields (`StringList` and `ObjectList`).
    pub fn is_collection(&self) -> bool {
        matches!(self.kind, ValueKind::StringList | ValueKind::ObjectList)
    }

    /// True when the field carries a nested row shape of its own.
    pub fn is_recursive(&self) -> bool {
        matches!(self.kind, ValueKind::ObjectList)
    }
}

pub mod prelude {
    pub use super::{ConfigMap, FieldMap, FieldSpec, ValueKind};
}
