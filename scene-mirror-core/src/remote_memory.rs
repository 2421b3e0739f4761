//! In-memory scene service
//!
//! [`MemoryRemote`] answers the same calls a real scene service would, from a
//! [`SceneFixture`] loaded from YAML or built in code. It records what it was asked so
//! callers can assert on call volume, duplicate fetches and peak concurrency, and it can
//! add latency or fail calls for chosen handles.

use crate::error::{ConfigError, RemoteError};
use crate::remote::*;
use crate::types::Handle;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Array handles are synthesized above this base so they never collide with items.
const ARRAY_HANDLE_BASE: Handle = 1 << 40;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixturePin {
    pub label: String,
    #[serde(default)]
    pub id: Option<i64>,
    /// Connected item, or `None` for an unconnected pin.
    #[serde(default)]
    pub target: Option<Handle>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureItem {
    pub handle: Handle,
    pub name: String,
    #[serde(rename = "type", default)]
    pub type_tag: String,
    /// Owned items, in order. Present only for graphs.
    #[serde(default)]
    pub owned: Option<Vec<Handle>>,
    #[serde(default)]
    pub pins: Vec<FixturePin>,
    #[serde(default)]
    pub attributes: Option<Value>,
}

impl FixtureItem {
    pub fn graph(handle: Handle, name: &str, owned: Vec<Handle>) -> Self {
        Self {
            handle,
            name: name.to_string(),
            type_tag: "graph".to_string(),
            owned: Some(owned),
            pins: Vec::new(),
            attributes: None,
        }
    }

    pub fn node(handle: Handle, name: &str, type_tag: &str) -> Self {
        Self {
            handle,
            name: name.to_string(),
            type_tag: type_tag.to_string(),
            owned: None,
            pins: Vec::new(),
            attributes: None,
        }
    }

    pub fn with_pin(mut self, label: &str, target: Option<Handle>) -> Self {
        let id = self.pins.len() as i64;
        self.pins.push(FixturePin {
            label: label.to_string(),
            id: Some(id),
            target,
        });
        self
    }

    pub fn with_attributes(mut self, attributes: Value) -> Self {
        self.attributes = Some(attributes);
        self
    }

    pub fn is_graph(&self) -> bool {
        self.owned.is_some()
    }
}

/// A complete remote scene.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneFixture {
    pub root: Handle,
    pub items: Vec<FixtureItem>,
}

impl SceneFixture {
    pub fn new(root: Handle, items: Vec<FixtureItem>) -> Self {
        Self { root, items }
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let fixture: SceneFixture = serde_yaml::from_str(content)?;
        if !fixture.items.iter().any(|i| i.handle == fixture.root) {
            return Err(ConfigError::Invalid(format!(
                "root item {} is not defined",
                fixture.root
            )));
        }
        Ok(fixture)
    }
}

/// Decrements the in-flight gauge even if the call future is dropped mid-way.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MemoryRemote {
    root: Handle,
    items: HashMap<Handle, FixtureItem>,
    latency_ms: AtomicU64,
    failing: Mutex<HashSet<Handle>>,
    /// Handles whose next `ApiItem.name` call fails once.
    flaky: Mutex<HashSet<Handle>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    /// `ApiItem.name` calls per handle; one per materialization.
    detail_fetches: Mutex<HashMap<Handle, usize>>,
}

impl MemoryRemote {
    pub fn new(fixture: SceneFixture) -> Self {
        Self {
            root: fixture.root,
            items: fixture.items.into_iter().map(|i| (i.handle, i)).collect(),
            latency_ms: AtomicU64::new(0),
            failing: Mutex::new(HashSet::new()),
            flaky: Mutex::new(HashSet::new()),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            detail_fetches: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(latency);
        self
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Every call targeting `handle` fails from now on.
    pub fn fail_handle(&self, handle: Handle) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle);
    }

    /// Listing the items of `graph` fails from now on; its own details still resolve.
    pub fn fail_listing(&self, graph: Handle) {
        self.fail_handle(ARRAY_HANDLE_BASE + graph);
    }

    /// The next detail fetch of `handle` fails; later ones succeed.
    pub fn fail_next_fetch(&self, handle: Handle) {
        self.flaky
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle);
    }

    pub fn heal_handle(&self, handle: Handle) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle);
    }

    // ── Instrumentation ──

    pub fn total_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn detail_fetches(&self, handle: Handle) -> usize {
        self.detail_fetches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle)
            .copied()
            .unwrap_or(0)
    }

    /// Largest number of detail fetches any single handle received.
    pub fn max_detail_fetches(&self) -> usize {
        self.detail_fetches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .copied()
            .max()
            .unwrap_or(0)
    }

    // ── Dispatch ──

    fn item(&self, handle: Option<Handle>) -> Result<&FixtureItem, RemoteError> {
        let handle = handle.ok_or_else(|| RemoteError::Transport("call needs a target".into()))?;
        self.items
            .get(&handle)
            .ok_or(RemoteError::UnknownHandle(handle))
    }

    fn index(params: &Value) -> Result<usize, RemoteError> {
        params
            .get("index")
            .and_then(Value::as_u64)
            .map(|i| i as usize)
            .ok_or_else(|| RemoteError::Transport("missing `index` parameter".into()))
    }

    fn pin<'a>(item: &'a FixtureItem, params: &Value) -> Result<&'a FixturePin, RemoteError> {
        let index = Self::index(params)?;
        item.pins.get(index).ok_or_else(|| {
            RemoteError::Transport(format!("pin {index} out of range on {}", item.handle))
        })
    }

    fn dispatch(
        &self,
        service: &str,
        method: &str,
        target: Option<Handle>,
        params: &Value,
    ) -> Result<Value, RemoteError> {
        match (service, method) {
            (SVC_PROJECT, M_ROOT_GRAPH) => Ok(json!({ "result": { "handle": self.root } })),
            (SVC_ITEM, M_NAME) => {
                let item = self.item(target)?;
                *self
                    .detail_fetches
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .entry(item.handle)
                    .or_default() += 1;
                Ok(json!({ "result": item.name }))
            }
            (SVC_ITEM, M_OUT_TYPE) => Ok(json!({ "result": self.item(target)?.type_tag })),
            (SVC_ITEM, M_IS_GRAPH) => Ok(json!({ "result": self.item(target)?.is_graph() })),
            (SVC_ITEM, M_ATTR_INFOS) => Ok(json!({
                "result": self.item(target)?.attributes.clone().unwrap_or(Value::Null)
            })),
            (SVC_GRAPH, M_OWNED_ITEMS) => {
                let item = self.item(target)?;
                if !item.is_graph() {
                    return Err(RemoteError::Transport(format!(
                        "{} is not a graph",
                        item.handle
                    )));
                }
                Ok(json!({ "result": { "handle": ARRAY_HANDLE_BASE + item.handle } }))
            }
            (SVC_ARRAY, M_SIZE) => {
                let owned = self.owned_array(target)?;
                Ok(json!({ "result": owned.len() }))
            }
            (SVC_ARRAY, M_GET) => {
                let owned = self.owned_array(target)?;
                let index = Self::index(params)?;
                let handle = owned.get(index).ok_or_else(|| {
                    RemoteError::Transport(format!("array index {index} out of range"))
                })?;
                Ok(json!({ "result": { "handle": handle } }))
            }
            (SVC_NODE, M_PIN_COUNT) => Ok(json!({ "result": self.item(target)?.pins.len() })),
            (SVC_NODE, M_CONNECTED_NODE) => {
                let pin = Self::pin(self.item(target)?, params)?;
                Ok(json!({ "result": pin.target.map(|h| json!({ "handle": h })) }))
            }
            (SVC_NODE, M_PIN_INFO) => {
                let index = Self::index(params)?;
                let pin = Self::pin(self.item(target)?, params)?;
                Ok(json!({
                    "result": {
                        "staticLabel": pin.label,
                        "id": pin.id.unwrap_or(index as i64),
                    }
                }))
            }
            _ => Err(RemoteError::Unsupported {
                service: service.to_string(),
                method: method.to_string(),
            }),
        }
    }

    fn owned_array(&self, target: Option<Handle>) -> Result<&[Handle], RemoteError> {
        let array = target.ok_or_else(|| RemoteError::Transport("call needs a target".into()))?;
        let graph = array
            .checked_sub(ARRAY_HANDLE_BASE)
            .ok_or(RemoteError::UnknownHandle(array))?;
        self.item(Some(graph))?
            .owned
            .as_deref()
            .ok_or(RemoteError::UnknownHandle(array))
    }
}

#[async_trait]
impl RemoteInvoker for MemoryRemote {
    async fn invoke(
        &self,
        service: &str,
        method: &str,
        target: Option<Handle>,
        params: Value,
    ) -> Result<Value, RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        let failing = target.is_some_and(|h| {
            let graph = h.checked_sub(ARRAY_HANDLE_BASE).unwrap_or(h);
            let failing = self.failing.lock().unwrap_or_else(PoisonError::into_inner);
            failing.contains(&h) || failing.contains(&graph)
        });
        let flaky = (service, method) == (SVC_ITEM, M_NAME)
            && target.is_some_and(|h| {
                self.flaky
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&h)
            });
        if failing || flaky {
            return Err(RemoteError::Transport(format!(
                "{service}.{method} on {target:?}: connection reset"
            )));
        }

        self.dispatch(service, method, target, &params)
    }
}
