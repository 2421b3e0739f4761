//! Remote call boundary
//!
//! [`RemoteInvoker`] is the only thing the mirror needs from a transport: invoke a named
//! method on a service, optionally targeting an item handle. [`SceneApi`] wraps an invoker
//! with the handful of typed calls the traversal uses, pulling handles and scalars out of
//! whatever envelope the transport returns. Every call holds a limiter permit, so the
//! number of calls in flight never exceeds the configured concurrency.

use crate::error::RemoteError;
use crate::limiter::ConcurrencyLimiter;
use crate::types::{Handle, PinLink};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

/// Transport-agnostic remote call.
#[async_trait]
pub trait RemoteInvoker: Send + Sync {
    async fn invoke(
        &self,
        service: &str,
        method: &str,
        target: Option<Handle>,
        params: Value,
    ) -> Result<Value, RemoteError>;
}

// ── Service / method names ──

pub const SVC_PROJECT: &str = "ApiProjectManager";
pub const SVC_ITEM: &str = "ApiItem";
pub const SVC_GRAPH: &str = "ApiNodeGraph";
pub const SVC_ARRAY: &str = "ApiItemArray";
pub const SVC_NODE: &str = "ApiNode";

pub const M_ROOT_GRAPH: &str = "rootNodeGraph";
pub const M_NAME: &str = "name";
pub const M_OUT_TYPE: &str = "outType";
pub const M_IS_GRAPH: &str = "isGraph";
pub const M_OWNED_ITEMS: &str = "getOwnedItems";
pub const M_SIZE: &str = "size";
pub const M_GET: &str = "get";
pub const M_PIN_COUNT: &str = "pinCount";
pub const M_CONNECTED_NODE: &str = "connectedNodeIx";
pub const M_PIN_INFO: &str = "pinInfoIx";
pub const M_ATTR_INFOS: &str = "attrInfos";

/// Upper bound on the up-front allocation for an item listing. The reported size is the
/// remote's word, not a promise.
const LISTING_PREALLOC: u64 = 1024;

/// Name, type and shape of an item, enough for a skeleton node.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemDetails {
    pub name: String,
    pub type_tag: String,
    pub is_graph: bool,
}

/// Static metadata of one pin.
#[derive(Debug, Clone, PartialEq)]
pub struct PinDetails {
    pub label: String,
    pub id: i64,
}

impl PinDetails {
    pub fn link(self, parent: Handle, index: u32) -> PinLink {
        PinLink {
            parent,
            index,
            label: self.label,
            id: self.id,
        }
    }
}

/// Typed access to the scene service.
#[derive(Clone)]
pub struct SceneApi {
    invoker: Arc<dyn RemoteInvoker>,
    limiter: ConcurrencyLimiter,
}

impl SceneApi {
    pub fn new(invoker: Arc<dyn RemoteInvoker>, limiter: ConcurrencyLimiter) -> Self {
        Self { invoker, limiter }
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    async fn call(
        &self,
        service: &str,
        method: &str,
        target: Option<Handle>,
        params: Value,
    ) -> Result<Value, RemoteError> {
        let _permit = self.limiter.acquire().await;
        self.invoker.invoke(service, method, target, params).await
    }

    // ── Calls ──

    /// Handle of the project's root graph.
    pub async fn root_graph(&self) -> Result<Handle, RemoteError> {
        let response = self.call(SVC_PROJECT, M_ROOT_GRAPH, None, json!({})).await?;
        extract_handle(&response)?.ok_or_else(|| missing(SVC_PROJECT, M_ROOT_GRAPH, "handle"))
    }

    /// Name, type tag and graph flag, fetched together.
    pub async fn item_details(&self, handle: Handle) -> Result<ItemDetails, RemoteError> {
        let (name, type_tag, is_graph) = futures::try_join!(
            self.get_string(SVC_ITEM, M_NAME, handle),
            self.type_tag(handle),
            self.get_bool(SVC_ITEM, M_IS_GRAPH, handle),
        )?;
        Ok(ItemDetails {
            name,
            type_tag,
            is_graph,
        })
    }

    /// Handles of the items a graph owns, in remote order.
    pub async fn owned_items(&self, graph: Handle) -> Result<Vec<Handle>, RemoteError> {
        let response = self.call(SVC_GRAPH, M_OWNED_ITEMS, Some(graph), json!({})).await?;
        let array = extract_handle(&response)?
            .ok_or_else(|| missing(SVC_GRAPH, M_OWNED_ITEMS, "handle"))?;

        let size = self.get_u64(SVC_ARRAY, M_SIZE, array).await?;
        let mut items = Vec::with_capacity(size.min(LISTING_PREALLOC) as usize);
        for index in 0..size {
            let response = self
                .call(SVC_ARRAY, M_GET, Some(array), json!({ "index": index }))
                .await?;
            // Empty slots in the array carry no item.
            if let Some(handle) = extract_handle(&response)? {
                items.push(handle);
            }
        }
        Ok(items)
    }

    /// Number of input pins on `node`.
    pub async fn pin_count(&self, node: Handle) -> Result<u32, RemoteError> {
        let count = self.get_u64(SVC_NODE, M_PIN_COUNT, node).await?;
        u32::try_from(count).map_err(|_| {
            RemoteError::Transport(format!(
                "{SVC_NODE}.{M_PIN_COUNT}: pin count {count} out of range"
            ))
        })
    }

    /// Item connected to pin `index`, or `None` if the pin is unconnected.
    pub async fn connected_item(
        &self,
        node: Handle,
        index: u32,
    ) -> Result<Option<Handle>, RemoteError> {
        let response = self
            .call(
                SVC_NODE,
                M_CONNECTED_NODE,
                Some(node),
                json!({ "index": index, "enterWrapperNode": true }),
            )
            .await?;
        extract_handle(&response)
    }

    pub async fn pin_details(&self, node: Handle, index: u32) -> Result<PinDetails, RemoteError> {
        let response = self
            .call(SVC_NODE, M_PIN_INFO, Some(node), json!({ "index": index }))
            .await?;
        let body = unwrap_result(&response);
        let label = body
            .get("staticLabel")
            .or_else(|| body.get("name"))
            .and_then(Value::as_str)
            .ok_or_else(|| missing(SVC_NODE, M_PIN_INFO, "staticLabel"))?
            .to_string();
        let id = body.get("id").and_then(Value::as_i64).unwrap_or(index as i64);
        Ok(PinDetails { label, id })
    }

    /// Raw attribute payload; the mirror stores it without interpreting it.
    pub async fn attributes(&self, handle: Handle) -> Result<Value, RemoteError> {
        let response = self.call(SVC_ITEM, M_ATTR_INFOS, Some(handle), json!({})).await?;
        Ok(unwrap_result(&response).clone())
    }

    // ── Scalar helpers ──

    async fn type_tag(&self, handle: Handle) -> Result<String, RemoteError> {
        let response = self.call(SVC_ITEM, M_OUT_TYPE, Some(handle), json!({})).await?;
        match unwrap_result(&response) {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            _ => Err(missing(SVC_ITEM, M_OUT_TYPE, "result")),
        }
    }

    async fn get_string(
        &self,
        service: &str,
        method: &str,
        handle: Handle,
    ) -> Result<String, RemoteError> {
        let response = self.call(service, method, Some(handle), json!({})).await?;
        unwrap_result(&response)
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| missing(service, method, "result"))
    }

    async fn get_bool(
        &self,
        service: &str,
        method: &str,
        handle: Handle,
    ) -> Result<bool, RemoteError> {
        let response = self.call(service, method, Some(handle), json!({})).await?;
        unwrap_result(&response)
            .as_bool()
            .ok_or_else(|| missing(service, method, "result"))
    }

    async fn get_u64(
        &self,
        service: &str,
        method: &str,
        handle: Handle,
    ) -> Result<u64, RemoteError> {
        let response = self.call(service, method, Some(handle), json!({})).await?;
        as_u64(unwrap_result(&response)).ok_or_else(|| missing(service, method, "result"))
    }
}

// ── Envelope handling ──

fn missing(service: &str, method: &str, field: &'static str) -> RemoteError {
    RemoteError::MissingField {
        service: service.to_string(),
        method: method.to_string(),
        field,
    }
}

/// Strip a `{"result": ...}` envelope if present.
pub fn unwrap_result(response: &Value) -> &Value {
    response.get("result").unwrap_or(response)
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        // Handles and counts may arrive as decimal strings.
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Pull an item handle out of a response.
///
/// Accepts a bare number/string, `{"handle": h}`, or either wrapped in `{"result": ...}`.
/// `null` and handle 0 mean "no item".
pub fn extract_handle(response: &Value) -> Result<Option<Handle>, RemoteError> {
    let body = unwrap_result(response);
    let raw = match body {
        Value::Null => return Ok(None),
        Value::Object(map) => match map.get("handle") {
            Some(Value::Null) | None => return Ok(None),
            Some(v) => v,
        },
        other => other,
    };
    match as_u64(raw) {
        Some(0) => Ok(None),
        Some(handle) => Ok(Some(handle)),
        None => Err(RemoteError::Transport(format!(
            "expected an item handle, got {raw}"
        ))),
    }
}
