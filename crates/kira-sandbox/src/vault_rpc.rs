//! Host-side dispatch of `vault.*` RPC methods.
//!
//! Plugins have no filesystem view of the vault; every vault operation
//! arrives as a JSON-RPC request and is checked against the plugin's policy
//! (`vault.read` for reads, `vault.write` for mutations) before reaching
//! the single-writer gateway.

use std::str::FromStr;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use kira_host::Entity;
use kira_policy::Policy;
use kira_types::{EntityKind, Metadata};
use kira_vault::Vault;

use crate::rpc::{codes, RpcRequest, RpcResponse};

/// Dispatcher for the `vault.*` RPC surface.
pub struct VaultRpcHandler {
    vault: Arc<Vault>,
}

impl VaultRpcHandler {
    /// Handler over the given vault gateway.
    pub fn new(vault: Arc<Vault>) -> Self {
        Self { vault }
    }

    /// Handle one request under `policy`. Always returns a response
    /// (errors are mapped to JSON-RPC error objects).
    pub async fn handle(&self, request: &RpcRequest, policy: &Policy) -> RpcResponse {
        let id = request.id.clone().unwrap_or(Value::Null);
        debug!(method = %request.method, plugin = %policy.plugin_name, "vault RPC");

        let required = match request.method.as_str() {
            "vault.read" | "vault.list" | "vault.get_links" | "vault.search" => "vault.read",
            "vault.create" | "vault.update" | "vault.delete" | "vault.upsert" => "vault.write",
            _ => {
                return RpcResponse::error(
                    id,
                    codes::METHOD_NOT_FOUND,
                    format!("unknown method: {}", request.method),
                )
            }
        };
        if let Err(denied) = policy.check_permission(required) {
            return RpcResponse::error(id, codes::PERMISSION_DENIED, denied.to_string());
        }

        let params = request.params.clone().unwrap_or_else(|| json!({}));
        let result = self.dispatch(&request.method, &params).await;

        match result {
            Ok(value) => RpcResponse::success(id, value),
            Err(DispatchError::Params(message)) => {
                RpcResponse::error(id, codes::INVALID_PARAMS, message)
            }
            Err(DispatchError::Vault(err)) => {
                RpcResponse::error(id, codes::INTERNAL_ERROR, err.to_string())
            }
        }
    }

    async fn dispatch(&self, method: &str, params: &Value) -> Result<Value, DispatchError> {
        match method {
            "vault.create" => {
                let kind = param_kind(params)?;
                let data = param_metadata(params, "data")?;
                let content = param_str(params, "content").unwrap_or_default();
                let entity = self.vault.create(kind, data, &content).await?;
                Ok(entity_to_value(&entity))
            }
            "vault.read" => {
                let entity_id = required_str(params, "entity_id")?;
                let entity = self.vault.get(&entity_id)?;
                Ok(entity_to_value(&entity))
            }
            "vault.update" => {
                let entity_id = required_str(params, "entity_id")?;
                let updates = param_metadata(params, "updates")?;
                let content = param_str(params, "content");
                let entity = self
                    .vault
                    .update(&entity_id, updates, content.as_deref())
                    .await?;
                Ok(entity_to_value(&entity))
            }
            "vault.delete" => {
                let entity_id = required_str(params, "entity_id")?;
                self.vault.delete(&entity_id).await?;
                Ok(json!({"deleted": entity_id}))
            }
            "vault.list" => {
                let kind = match params.get("kind").and_then(Value::as_str) {
                    Some(raw) => Some(
                        EntityKind::from_str(raw)
                            .map_err(|e| DispatchError::Params(e.to_string()))?,
                    ),
                    None => None,
                };
                let limit = params.get("limit").and_then(Value::as_u64).map(|l| l as usize);
                let offset = params.get("offset").and_then(Value::as_u64).unwrap_or(0) as usize;
                let entities = self.vault.list(kind, limit, offset)?;
                Ok(Value::Array(entities.iter().map(entity_to_value).collect()))
            }
            "vault.upsert" => {
                let kind = param_kind(params)?;
                let data = param_metadata(params, "data")?;
                let content = param_str(params, "content").unwrap_or_default();
                let entity = self.vault.upsert(kind, data, &content).await?;
                Ok(entity_to_value(&entity))
            }
            "vault.get_links" => {
                let entity_id = required_str(params, "entity_id")?;
                let links = self.vault.links(&entity_id)?;
                Ok(serde_json::to_value(links).unwrap_or(Value::Null))
            }
            "vault.search" => {
                let query = required_str(params, "query")?.to_lowercase();
                let limit = params
                    .get("limit")
                    .and_then(Value::as_u64)
                    .unwrap_or(20) as usize;
                let matches: Vec<Value> = self
                    .vault
                    .list(None, None, 0)?
                    .into_iter()
                    .filter(|entity| {
                        entity.title().to_lowercase().contains(&query)
                            || entity.content.to_lowercase().contains(&query)
                    })
                    .take(limit)
                    .map(|e| entity_to_value(&e))
                    .collect();
                Ok(Value::Array(matches))
            }
            other => Err(DispatchError::Params(format!("unknown method: {other}"))),
        }
    }
}

enum DispatchError {
    Params(String),
    Vault(kira_vault::VaultError),
}

impl From<kira_vault::VaultError> for DispatchError {
    fn from(err: kira_vault::VaultError) -> Self {
        DispatchError::Vault(err)
    }
}

fn required_str(params: &Value, key: &str) -> Result<String, DispatchError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| DispatchError::Params(format!("missing required param: {key}")))
}

fn param_str(params: &Value, key: &str) -> Option<String> {
    params.get(key).and_then(Value::as_str).map(str::to_string)
}

fn param_kind(params: &Value) -> Result<EntityKind, DispatchError> {
    let raw = params
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| DispatchError::Params("missing required param: kind".into()))?;
    EntityKind::from_str(raw).map_err(|e| DispatchError::Params(e.to_string()))
}

fn param_metadata(params: &Value, key: &str) -> Result<Metadata, DispatchError> {
    match params.get(key) {
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(_) => Err(DispatchError::Params(format!("param '{key}' must be a mapping"))),
        None => Err(DispatchError::Params(format!("missing required param: {key}"))),
    }
}

fn entity_to_value(entity: &Entity) -> Value {
    json!({
        "id": entity.id,
        "kind": entity.kind.as_str(),
        "metadata": Value::Object(entity.metadata.clone()),
        "content": entity.content,
        "path": entity.path.as_ref().map(|p| p.to_string_lossy().to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::UTC;
    use kira_bus_core::EventBus;
    use kira_host::HostApi;

    fn rpc(method: &str, params: Value) -> RpcRequest {
        RpcRequest::new(1, method, params)
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        handler: VaultRpcHandler,
        read_policy: Policy,
        write_policy: Policy,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let host = HostApi::new(dir.path().join("vault"), UTC, Arc::new(EventBus::new())).unwrap();
        let vault = Arc::new(Vault::new(host));
        Fixture {
            _dir: dir,
            handler: VaultRpcHandler::new(vault),
            read_policy: Policy::new("reader", vec!["vault.read".into()]),
            write_policy: Policy::new(
                "writer",
                vec!["vault.read".into(), "vault.write".into()],
            ),
        }
    }

    #[tokio::test]
    async fn create_then_read_through_rpc() {
        let f = fixture();
        let create = rpc(
            "vault.create",
            json!({
                "kind": "task",
                "data": {"title": "From plugin", "status": "todo"},
                "content": "body",
            }),
        );
        let response = f.handler.handle(&create, &f.write_policy).await;
        assert!(response.error.is_none(), "{:?}", response.error);
        let entity_id = response.result.unwrap()["id"].as_str().unwrap().to_string();

        let read = rpc("vault.read", json!({"entity_id": entity_id}));
        let response = f.handler.handle(&read, &f.read_policy).await;
        let result = response.result.unwrap();
        assert_eq!(result["metadata"]["title"], "From plugin");
        assert_eq!(result["content"], "body");
    }

    #[tokio::test]
    async fn writes_require_vault_write() {
        let f = fixture();
        let create = rpc(
            "vault.create",
            json!({"kind": "task", "data": {"title": "Nope", "status": "todo"}}),
        );
        let response = f.handler.handle(&create, &f.read_policy).await;
        let error = response.error.unwrap();
        assert_eq!(error.code, codes::PERMISSION_DENIED);
        assert!(error.message.contains("vault.write"));
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let f = fixture();
        let response = f
            .handler
            .handle(&rpc("vault.destroy_everything", json!({})), &f.write_policy)
            .await;
        assert_eq!(response.error.unwrap().code, codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn bad_params_are_invalid_params() {
        let f = fixture();
        let response = f
            .handler
            .handle(&rpc("vault.read", json!({})), &f.read_policy)
            .await;
        assert_eq!(response.error.unwrap().code, codes::INVALID_PARAMS);

        let response = f
            .handler
            .handle(&rpc("vault.create", json!({"kind": "widget", "data": {}})), &f.write_policy)
            .await;
        assert_eq!(response.error.unwrap().code, codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn list_search_and_links() {
        let f = fixture();
        for title in ["Alpha report", "Beta notes"] {
            let create = rpc(
                "vault.create",
                json!({"kind": "task", "data": {"title": title, "status": "todo"}}),
            );
            assert!(f.handler.handle(&create, &f.write_policy).await.error.is_none());
        }

        let list = rpc("vault.list", json!({"kind": "task"}));
        let response = f.handler.handle(&list, &f.read_policy).await;
        assert_eq!(response.result.unwrap().as_array().unwrap().len(), 2);

        let search = rpc("vault.search", json!({"query": "alpha"}));
        let response = f.handler.handle(&search, &f.read_policy).await;
        let hits = response.result.unwrap();
        assert_eq!(hits.as_array().unwrap().len(), 1);
        assert_eq!(hits[0]["metadata"]["title"], "Alpha report");

        let entity_id = hits[0]["id"].as_str().unwrap().to_string();
        let links = rpc("vault.get_links", json!({"entity_id": entity_id}));
        let response = f.handler.handle(&links, &f.read_policy).await;
        let result = response.result.unwrap();
        assert!(result["outgoing"].as_array().is_some());
        assert!(result["incoming"].as_array().is_some());
    }

    #[tokio::test]
    async fn vault_errors_surface_as_internal() {
        let f = fixture();
        let read = rpc("vault.read", json!({"entity_id": "task-20990101-0000-gone"}));
        let response = f.handler.handle(&read, &f.read_policy).await;
        let error = response.error.unwrap();
        assert_eq!(error.code, codes::INTERNAL_ERROR);
        assert!(error.message.contains("not found"));
    }
}
