//! Pipeform host-facing API.
//!
//! The four lifecycle entry points (create/read/update/delete) per resource
//! kind, plus collection sync for memberships and trusted fingerprints.
//! Each operation is one awaited call chain against the transport; failures
//! bubble to the host untouched except for the not-found-on-read case,
//! which degrades to "resource no longer exists".

#![forbid(unsafe_code)]

use async_trait::async_trait;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use pipeform_core::ConfigMap;
use pipeform_reconcile::{diff_memberships, Assignment, MembershipDiff};
use pipeform_resthub::{fetch_all, HubError, Transport};
use pipeform_schema::ServiceCatalog;
use pipeform_state::{local_to_upstream, upstream_to_local, ShapeError};

/// API errors suitable for transport to the host.
#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
pub enum ApiError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("upstream {code}: {message}")]
    Upstream { code: String, message: String },
    /// Schema catalogs and data disagree; a contract violation, not a
    /// user-facing error.
    #[error("state: {0}")]
    State(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<HubError> for ApiError {
    fn from(e: HubError) -> Self {
        match e {
            HubError::Api { code, message } if code == "NotFound" => ApiError::NotFound(message),
            HubError::Api { code, message } => ApiError::Upstream { code, message },
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<ShapeError> for ApiError {
    fn from(e: ShapeError) -> Self {
        ApiError::State(e.to_string())
    }
}

/// Lifecycle entry points the host invokes per resource kind. `read`
/// returns `None` when the resource no longer exists upstream, which tells
/// the host to clear its persisted state.
#[async_trait]
pub trait ResourceLifecycle: Send + Sync {
    async fn create(&self, declared: &ConfigMap) -> ApiResult<ConfigMap>;
    async fn read(&self, prior: &ConfigMap) -> ApiResult<Option<ConfigMap>>;
    async fn update(&self, prior: &ConfigMap, declared: &ConfigMap) -> ApiResult<ConfigMap>;
    async fn delete(&self, prior: &ConfigMap) -> ApiResult<()>;
}

fn require_str<'a>(map: &'a ConfigMap, field: &str) -> ApiResult<&'a str> {
    map.get(field)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::Validation(format!("missing required field {field}")))
}

fn config_of(map: &ConfigMap) -> ConfigMap {
    map.get("config")
        .and_then(|v| v.as_object())
        .cloned()
        .unwrap_or_default()
}

/// A configured resource kind (connector or destination): CRUD against one
/// collection path, with the dynamic `config` block mapped through the
/// unified schema in both directions.
pub struct ConfiguredResource {
    transport: Arc<dyn Transport>,
    catalog: Arc<ServiceCatalog>,
    base_path: &'static str,
    kind: &'static str,
}

impl ConfiguredResource {
    pub fn connectors(transport: Arc<dyn Transport>, catalog: Arc<ServiceCatalog>) -> Self {
        Self {
            transport,
            catalog,
            base_path: "/v1/connectors",
            kind: "connector",
        }
    }

    pub fn destinations(transport: Arc<dyn Transport>, catalog: Arc<ServiceCatalog>) -> Self {
        Self {
            transport,
            catalog,
            base_path: "/v1/destinations",
            kind: "destination",
        }
    }

    fn item_path(&self, id: &str) -> String {
        format!("{}/{}", self.base_path, id)
    }

    /// Shape one upstream resource object into persisted state, carrying
    /// sensitive config values over from `prior_config` where present.
    fn shape_state(&self, data: &Json, prior_config: Option<&ConfigMap>) -> ApiResult<ConfigMap> {
        let obj = data.as_object().ok_or_else(|| {
            ApiError::Internal(format!("{} response is not an object", self.kind))
        })?;
        let mut state = ConfigMap::new();
        for key in ["id", "service", "group_id"] {
            if let Some(v) = obj.get(key) {
                state.insert(key.to_string(), v.clone());
            }
        }
        if let Some(ts) = obj.get("created_at").and_then(|v| v.as_str()) {
            // Normalize the server timestamp; keep the raw string when it
            // does not parse rather than failing the whole read.
            let normalized = chrono::DateTime::parse_from_rfc3339(ts)
                .map(|dt| dt.to_rfc3339())
                .unwrap_or_else(|_| ts.to_string());
            state.insert("created_at".to_string(), Json::String(normalized));
        }
        let upstream_config = obj
            .get("config")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();
        let local = upstream_to_local(&upstream_config, prior_config, self.catalog.unified())?;
        state.insert("config".to_string(), Json::Object(local));
        Ok(state)
    }
}

#[async_trait]
impl ResourceLifecycle for ConfiguredResource {
    async fn create(&self, declared: &ConfigMap) -> ApiResult<ConfigMap> {
        let t0 = Instant::now();
        counter!("resource_create_attempts", 1u64);
        let service = require_str(declared, "service")?;
        let group_id = require_str(declared, "group_id")?;
        let declared_config = config_of(declared);
        let payload = local_to_upstream(&declared_config, self.catalog.unified(), service)?;

        let mut body = ConfigMap::new();
        body.insert("service".to_string(), Json::String(service.to_string()));
        body.insert("group_id".to_string(), Json::String(group_id.to_string()));
        body.insert("config".to_string(), Json::Object(payload));

        let data = self.transport.post(self.base_path, &Json::Object(body)).await?;
        let state = self.shape_state(&data, Some(&declared_config))?;
        histogram!("resource_op_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("resource_create_ok", 1u64);
        info!(kind = self.kind, service, took_ms = %t0.elapsed().as_millis(), "api: create ok");
        Ok(state)
    }

    async fn read(&self, prior: &ConfigMap) -> ApiResult<Option<ConfigMap>> {
        let t0 = Instant::now();
        let id = require_str(prior, "id")?;
        match self.transport.get(&self.item_path(id)).await {
            Ok(data) => {
                let prior_config = config_of(prior);
                let state = self.shape_state(&data, Some(&prior_config))?;
                info!(kind = self.kind, id, took_ms = %t0.elapsed().as_millis(), "api: read ok");
                Ok(Some(state))
            }
            Err(e) if e.is_not_found() => {
                // The only recoverable case: the resource is gone upstream,
                // so the host should clear its state instead of erroring.
                info!(kind = self.kind, id, "api: read found nothing; clearing state");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, prior: &ConfigMap, declared: &ConfigMap) -> ApiResult<ConfigMap> {
        let t0 = Instant::now();
        counter!("resource_update_attempts", 1u64);
        let id = require_str(prior, "id")?;
        let service = declared
            .get("service")
            .and_then(|v| v.as_str())
            .map(Ok)
            .unwrap_or_else(|| require_str(prior, "service"))?;
        let declared_config = config_of(declared);
        let payload = local_to_upstream(&declared_config, self.catalog.unified(), service)?;

        let mut body = ConfigMap::new();
        body.insert("config".to_string(), Json::Object(payload));

        let data = self
            .transport
            .patch(&self.item_path(id), &Json::Object(body))
            .await?;
        let state = self.shape_state(&data, Some(&declared_config))?;
        histogram!("resource_op_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("resource_update_ok", 1u64);
        info!(kind = self.kind, id, took_ms = %t0.elapsed().as_millis(), "api: update ok");
        Ok(state)
    }

    async fn delete(&self, prior: &ConfigMap) -> ApiResult<()> {
        let t0 = Instant::now();
        let id = require_str(prior, "id")?;
        self.transport.delete(&self.item_path(id)).await?;
        info!(kind = self.kind, id, took_ms = %t0.elapsed().as_millis(), "api: delete ok");
        Ok(())
    }
}

// ----------------- Collections: memberships and fingerprints -----------------

/// One upstream collection entry plus server-assigned metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MembershipRecord {
    pub key: String,
    pub role: String,
    /// Server-assigned creation time as a unix timestamp; 0 when absent.
    pub created_ts: i64,
}

/// Addressing for one reconcilable collection. The diff logic is shared;
/// only the path and field names vary per collection kind.
pub struct CollectionSpec {
    pub base_path: String,
    pub key_field: &'static str,
    pub role_field: Option<&'static str>,
}

impl CollectionSpec {
    pub fn team_connectors(team_id: &str) -> Self {
        Self {
            base_path: format!("/v1/teams/{team_id}/connectors"),
            key_field: "id",
            role_field: Some("role"),
        }
    }

    pub fn team_groups(team_id: &str) -> Self {
        Self {
            base_path: format!("/v1/teams/{team_id}/groups"),
            key_field: "id",
            role_field: Some("role"),
        }
    }

    pub fn team_users(team_id: &str) -> Self {
        Self {
            base_path: format!("/v1/teams/{team_id}/users"),
            key_field: "user_id",
            role_field: Some("role"),
        }
    }

    pub fn connector_fingerprints(connector_id: &str) -> Self {
        Self {
            base_path: format!("/v1/connectors/{connector_id}/fingerprints"),
            key_field: "hash",
            role_field: None,
        }
    }

    pub fn destination_fingerprints(destination_id: &str) -> Self {
        Self {
            base_path: format!("/v1/destinations/{destination_id}/fingerprints"),
            key_field: "hash",
            role_field: None,
        }
    }
}

fn record_from_item(item: &Json, spec: &CollectionSpec) -> Option<MembershipRecord> {
    let key = item.get(spec.key_field)?.as_str()?.to_string();
    let role = spec
        .role_field
        .and_then(|f| item.get(f))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let created_ts = item
        .get("created_at")
        .and_then(|v| v.as_str())
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.timestamp())
        .unwrap_or(0);
    Some(MembershipRecord {
        key,
        role,
        created_ts,
    })
}

/// Fetch the full upstream collection behind a spec, page by page.
pub async fn list_collection(
    transport: &dyn Transport,
    spec: &CollectionSpec,
) -> ApiResult<Vec<MembershipRecord>> {
    let items = fetch_all(transport, &spec.base_path).await?;
    let records: Vec<MembershipRecord> = items
        .iter()
        .filter_map(|i| record_from_item(i, spec))
        .collect();
    debug!(path = %spec.base_path, fetched = records.len(), "collection listed");
    Ok(records)
}

/// Reconcile a declared collection against upstream and apply the plan.
///
/// Revokes and role updates run before adds so a key moving between roles
/// never collides upstream. A failure mid-way leaves already-applied
/// actions in place; re-running the sync from fresh upstream state
/// converges, so no rollback is attempted.
pub async fn sync_collection(
    transport: &dyn Transport,
    spec: &CollectionSpec,
    desired: &[Assignment],
) -> ApiResult<MembershipDiff> {
    let t0 = Instant::now();
    let upstream: Vec<Assignment> = list_collection(transport, spec)
        .await?
        .into_iter()
        .map(|r| Assignment::new(r.key, r.role))
        .collect();
    let plan = diff_memberships(desired, &upstream);

    for key in &plan.revoke {
        transport
            .delete(&format!("{}/{}", spec.base_path, key))
            .await?;
    }
    for entry in &plan.update_role {
        let role_field = spec.role_field.ok_or_else(|| {
            ApiError::Validation(format!(
                "collection {} has no role field to update",
                spec.base_path
            ))
        })?;
        let mut body = ConfigMap::new();
        body.insert(role_field.to_string(), Json::String(entry.role.clone()));
        transport
            .patch(
                &format!("{}/{}", spec.base_path, entry.key),
                &Json::Object(body),
            )
            .await?;
    }
    for entry in &plan.add {
        let mut body = ConfigMap::new();
        body.insert(
            spec.key_field.to_string(),
            Json::String(entry.key.clone()),
        );
        if let Some(role_field) = spec.role_field {
            if !entry.role.is_empty() {
                body.insert(role_field.to_string(), Json::String(entry.role.clone()));
            }
        }
        transport.post(&spec.base_path, &Json::Object(body)).await?;
    }

    counter!("collection_sync_ok", 1u64);
    info!(
        path = %spec.base_path,
        revoked = plan.revoke.len(),
        updated = plan.update_role.len(),
        added = plan.add.len(),
        took_ms = %t0.elapsed().as_millis(),
        "api: collection sync ok"
    );
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeform_resthub::MockTransport;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn catalog() -> Arc<ServiceCatalog> {
        let services: BTreeMap<String, String> = [
            ("pg".to_string(), "PostgreSQL".to_string()),
            ("gcs".to_string(), "Cloud Functions".to_string()),
        ]
        .into_iter()
        .collect();
        let schemas = json!({
            "pg": {"properties": {
                "host": {"type": "string"},
                "port": {"type": "integer"},
                "password": {"type": "string", "format": "password"},
            }},
            "gcs": {"properties": {
                "secrets_list": {
                    "type": "array",
                    "x_correlation_key": "key",
                    "items": {"type": "object", "properties": {
                        "key": {"type": "string"},
                        "value": {"type": "string", "format": "password"},
                    }},
                },
            }},
        });
        Arc::new(ServiceCatalog::from_documents(services, &schemas).unwrap())
    }

    fn cfg(v: Json) -> ConfigMap {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn create_sends_config_and_keeps_declared_secrets() {
        let mock = Arc::new(MockTransport::new());
        mock.respond(
            "POST /v1/connectors",
            json!({
                "id": "c1",
                "service": "pg",
                "group_id": "g1",
                "created_at": "2024-05-01T12:00:00Z",
                "config": {"host": "db", "port": 5432, "password": "******"},
            }),
        );
        let res = ConfiguredResource::connectors(mock.clone(), catalog());
        let declared = cfg(json!({
            "service": "pg",
            "group_id": "g1",
            "config": {"host": "db", "port": "5432", "password": "hunter2"},
        }));
        let state = res.create(&declared).await.unwrap();
        assert_eq!(state["id"], "c1");
        assert_eq!(state["created_at"], "2024-05-01T12:00:00+00:00");
        let config = state["config"].as_object().unwrap();
        assert_eq!(config["port"], "5432");
        // The masked echo must not clobber the declared secret.
        assert_eq!(config["password"], "hunter2");
        assert_eq!(mock.calls(), vec!["POST /v1/connectors"]);
    }

    #[tokio::test]
    async fn create_requires_service_and_group() {
        let res = ConfiguredResource::connectors(Arc::new(MockTransport::new()), catalog());
        let err = res.create(&cfg(json!({"group_id": "g1"}))).await.unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[tokio::test]
    async fn read_carries_sensitive_rows_from_prior_state() {
        let mock = Arc::new(MockTransport::new());
        mock.respond(
            "GET /v1/connectors/c2",
            json!({
                "id": "c2",
                "service": "gcs",
                "group_id": "g1",
                "config": {"secrets_list": [{"key": "k1", "value": "******"}]},
            }),
        );
        let res = ConfiguredResource::connectors(mock, catalog());
        let prior = cfg(json!({
            "id": "c2",
            "service": "gcs",
            "config": {"secrets_list": [{"key": "k1", "value": "real"}]},
        }));
        let state = res.read(&prior).await.unwrap().unwrap();
        assert_eq!(
            state["config"]["secrets_list"],
            json!([{"key": "k1", "value": "real"}])
        );
    }

    #[tokio::test]
    async fn read_not_found_clears_state_without_error() {
        let mock = Arc::new(MockTransport::new());
        mock.fail("GET /v1/connectors/gone", "NotFound", "no such connector");
        let res = ConfiguredResource::connectors(mock, catalog());
        let prior = cfg(json!({"id": "gone"}));
        assert_eq!(res.read(&prior).await.unwrap(), None);
    }

    #[tokio::test]
    async fn read_other_upstream_errors_propagate() {
        let mock = Arc::new(MockTransport::new());
        mock.fail("GET /v1/connectors/c3", "InternalServerError", "boom");
        let res = ConfiguredResource::connectors(mock, catalog());
        let prior = cfg(json!({"id": "c3"}));
        let err = res.read(&prior).await.unwrap_err();
        assert!(matches!(err, ApiError::Upstream { .. }));
    }

    #[tokio::test]
    async fn destinations_use_their_own_path() {
        let mock = Arc::new(MockTransport::new());
        mock.respond(
            "GET /v1/destinations/d1",
            json!({"id": "d1", "service": "pg", "group_id": "g1", "config": {}}),
        );
        let res = ConfiguredResource::destinations(mock.clone(), catalog());
        let prior = cfg(json!({"id": "d1"}));
        assert!(res.read(&prior).await.unwrap().is_some());
        assert_eq!(mock.calls(), vec!["GET /v1/destinations/d1"]);
    }

    #[tokio::test]
    async fn sync_applies_revokes_and_updates_before_adds() {
        let mock = Arc::new(MockTransport::new());
        mock.respond(
            "LIST /v1/teams/t1/connectors",
            json!([
                {"id": "A", "role": "role1", "created_at": "2024-01-01T00:00:00Z"},
                {"id": "C", "role": "role3"},
            ]),
        );
        mock.respond("DELETE /v1/teams/t1/connectors/C", json!({}));
        mock.respond("PATCH /v1/teams/t1/connectors/A", json!({}));
        mock.respond("POST /v1/teams/t1/connectors", json!({}));

        let spec = CollectionSpec::team_connectors("t1");
        let desired = vec![
            Assignment::new("A", "role9"),
            Assignment::new("B", "role2"),
        ];
        let plan = sync_collection(mock.as_ref(), &spec, &desired).await.unwrap();
        assert_eq!(plan.revoke, vec!["C".to_string()]);
        assert_eq!(plan.update_role, vec![Assignment::new("A", "role9")]);
        assert_eq!(plan.add, vec![Assignment::new("B", "role2")]);
        assert_eq!(
            mock.calls(),
            vec![
                "LIST /v1/teams/t1/connectors",
                "DELETE /v1/teams/t1/connectors/C",
                "PATCH /v1/teams/t1/connectors/A",
                "POST /v1/teams/t1/connectors",
            ]
        );
    }

    #[tokio::test]
    async fn fingerprint_sync_is_roleless() {
        let mock = Arc::new(MockTransport::new());
        mock.respond(
            "LIST /v1/connectors/c1/fingerprints",
            json!([{"hash": "sha256:old"}]),
        );
        mock.respond("DELETE /v1/connectors/c1/fingerprints/sha256:old", json!({}));
        mock.respond("POST /v1/connectors/c1/fingerprints", json!({}));

        let spec = CollectionSpec::connector_fingerprints("c1");
        let desired = vec![Assignment::new("sha256:new", "")];
        let plan = sync_collection(mock.as_ref(), &spec, &desired).await.unwrap();
        assert_eq!(plan.revoke, vec!["sha256:old".to_string()]);
        assert_eq!(plan.add, vec![Assignment::new("sha256:new", "")]);
        assert!(plan.update_role.is_empty());
    }

    #[tokio::test]
    async fn failed_revoke_surfaces_after_partial_application() {
        let mock = Arc::new(MockTransport::new());
        mock.respond(
            "LIST /v1/teams/t1/users",
            json!([{"user_id": "u1", "role": "r"}, {"user_id": "u2", "role": "r"}]),
        );
        mock.respond("DELETE /v1/teams/t1/users/u1", json!({}));
        mock.fail("DELETE /v1/teams/t1/users/u2", "InternalServerError", "boom");

        let spec = CollectionSpec::team_users("t1");
        let err = sync_collection(mock.as_ref(), &spec, &[]).await.unwrap_err();
        assert!(matches!(err, ApiError::Upstream { .. }));
        // The first revoke stays applied; no rollback is attempted.
        assert_eq!(
            mock.calls(),
            vec![
                "LIST /v1/teams/t1/users",
                "DELETE /v1/teams/t1/users/u1",
                "DELETE /v1/teams/t1/users/u2",
            ]
        );
    }

    #[tokio::test]
    async fn list_collection_parses_server_metadata() {
        let mock = Arc::new(MockTransport::new());
        mock.respond(
            "LIST /v1/teams/t1/users",
            json!([{"user_id": "u1", "role": "admin", "created_at": "2024-01-02T00:00:00Z"}]),
        );
        let spec = CollectionSpec::team_users("t1");
        let records = list_collection(mock.as_ref(), &spec).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].role, "admin");
        assert!(records[0].created_ts > 0);
    }
}
