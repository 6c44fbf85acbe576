//! Per-service sandboxes.
//!
//! Each sandbox is a dedicated OS thread owning one `wasmtime::Store`.
//! All plugins of a service share that store and are loaded lazily, on
//! first call. The thread consumes requests from a channel; completions
//! and everything a running component needs from the outside (nested
//! calls, caller identity, host actions) flow out through a single
//! [`BrokerEvent`] channel to the broker loop.
//!
//! A component blocks its own sandbox thread while a nested call is in
//! flight; the broker remains responsive because it never runs component
//! code itself. When the broker abandons a chain it drops the pending
//! reply sender, which traps the blocked component.

use crate::error::CallError;
use crate::keyvalue::{self, KeyValue};
use crate::loader::{shared_engine, ComponentLoader, Importable, LoadedComponent};
use serde_json::Value;
use skiff_storage::KvBackend;
use skiff_types::{
    CallArgs, CallOutcome, CallReply, CallRequest, HostAction, Origin, PluginId,
    ResultCacheEntry, ServiceId,
};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use wasmtime::component::{ComponentType, Instance, Lift, Lower, Val};
use wasmtime::component::ResourceTable;
use wasmtime::{ResourceLimiter, Store, StoreContextMut};
use wasmtime_wasi::p2::{IoView, WasiCtx, WasiCtxBuilder, WasiView};

/// How long a freshly spawned sandbox may take to reach its request loop.
pub const READY_TIMEOUT_MS: u64 = 2000;

/// Resource limits for one sandbox.
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    /// Maximum linear memory in bytes.
    pub max_memory_bytes: usize,
    /// CPU fuel budget per invocation (prevents infinite loops).
    pub fuel_per_call: u64,
}

impl ResourceLimits {
    pub fn first_party() -> Self {
        Self {
            max_memory_bytes: 64 * 1024 * 1024, // 64MB
            fuel_per_call: 1_000_000_000,
        }
    }

    pub fn third_party() -> Self {
        Self {
            max_memory_bytes: 32 * 1024 * 1024, // 32MB
            fuel_per_call: 500_000_000,
        }
    }
}

/// Enforces the memory ceiling and tracks actual usage via grow callbacks.
pub struct SandboxLimiter {
    max_memory: usize,
    current_memory: AtomicUsize,
    max_table_elements: u32,
    max_instances: u32,
}

impl SandboxLimiter {
    pub fn new(max_memory: usize) -> Self {
        Self {
            max_memory,
            current_memory: AtomicUsize::new(0),
            max_table_elements: 20_000,
            max_instances: 50,
        }
    }

    pub fn current_memory_bytes(&self) -> usize {
        self.current_memory.load(Ordering::Relaxed)
    }
}

impl ResourceLimiter for SandboxLimiter {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        self.current_memory.store(desired, Ordering::Relaxed);
        if desired <= self.max_memory {
            Ok(true)
        } else {
            debug!(
                current = current,
                desired = desired,
                max = self.max_memory,
                "Memory growth denied - would exceed limit"
            );
            Ok(false)
        }
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        Ok(desired <= self.max_table_elements as usize)
    }

    fn instances(&self) -> usize {
        self.max_instances as usize
    }

    fn tables(&self) -> usize {
        100
    }

    fn memories(&self) -> usize {
        50
    }
}

/// The error record crossing the component boundary: a code plus a
/// human-readable message. Matches the `error-payload` record every
/// callable export returns in its error arm.
#[derive(Debug, Clone, ComponentType, Lift, Lower)]
#[component(record)]
pub struct WireError {
    pub code: u32,
    pub message: String,
}

/// Everything a sandbox can ask of the broker loop.
#[derive(Debug)]
pub enum BrokerEvent {
    /// A dispatched call finished; the reply correlates by request id.
    Resolved(CallReply),
    /// A running component wants to call another plugin and blocks on the
    /// reply. Dropping `reply` without sending traps the waiting component.
    NestedCall {
        request: CallRequest,
        reply: std_mpsc::Sender<CallReply>,
    },
    /// A running component asks who called it.
    GetCaller {
        service: ServiceId,
        reply: std_mpsc::Sender<Result<String, String>>,
    },
    /// A running component queues host-level actions on the active chain.
    AddActions {
        service: ServiceId,
        actions: Vec<HostAction>,
        reply: std_mpsc::Sender<Result<(), String>>,
    },
}

/// State stored in each sandbox's `wasmtime::Store`.
pub struct SandboxState {
    pub(crate) service: ServiceId,
    pub(crate) origin: Origin,
    pub(crate) keyvalue: KeyValue,
    /// Result-cache snapshot for the call currently executing.
    pub(crate) result_cache: Vec<ResultCacheEntry>,
    pub(crate) events: mpsc::UnboundedSender<BrokerEvent>,
    pub(crate) limiter: SandboxLimiter,
    wasi_ctx: WasiCtx,
    resource_table: ResourceTable,
}

impl IoView for SandboxState {
    fn table(&mut self) -> &mut ResourceTable {
        &mut self.resource_table
    }
}

impl WasiView for SandboxState {
    fn ctx(&mut self) -> &mut WasiCtx {
        &mut self.wasi_ctx
    }
}

/// Configuration for spawning one sandbox.
pub struct SandboxConfig {
    pub service: ServiceId,
    pub loader: Arc<ComponentLoader>,
    pub storage: Arc<KvBackend>,
    pub events: mpsc::UnboundedSender<BrokerEvent>,
    pub limits: ResourceLimits,
    pub ready_timeout_ms: u64,
}

impl SandboxConfig {
    pub fn new(
        service: ServiceId,
        loader: Arc<ComponentLoader>,
        storage: Arc<KvBackend>,
        events: mpsc::UnboundedSender<BrokerEvent>,
    ) -> Self {
        Self {
            service,
            loader,
            storage,
            events,
            limits: ResourceLimits::third_party(),
            ready_timeout_ms: READY_TIMEOUT_MS,
        }
    }
}

enum SandboxRequest {
    /// Compile and instantiate a plugin ahead of its first call.
    Preload {
        plugin: String,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Call(CallRequest),
    Shutdown,
}

/// Handle to one running sandbox thread.
pub struct SandboxHandle {
    service: ServiceId,
    tx: std_mpsc::Sender<SandboxRequest>,
    ready: watch::Receiver<bool>,
    ready_timeout: Duration,
}

impl SandboxHandle {
    /// Spawns the sandbox thread. The thread signals readiness once it
    /// enters its request loop; [`SandboxHandle::ready`] observes that.
    pub fn spawn(config: SandboxConfig) -> Result<Self, CallError> {
        let (tx, rx) = std_mpsc::channel();
        let (ready_tx, ready_rx) = watch::channel(false);
        let service = config.service.clone();
        let ready_timeout = Duration::from_millis(config.ready_timeout_ms);

        std::thread::Builder::new()
            .name(format!("sandbox-{service}"))
            .spawn(move || run_sandbox(config, rx, ready_tx))
            .map_err(|e| CallError::Unknown(format!("failed to spawn sandbox thread: {e}")))?;

        Ok(Self {
            service,
            tx,
            ready: ready_rx,
            ready_timeout,
        })
    }

    #[must_use]
    pub fn service(&self) -> &ServiceId {
        &self.service
    }

    /// The origin address this sandbox's messages carry.
    #[must_use]
    pub fn address(&self) -> String {
        Origin::sandbox_address(&self.service)
    }

    /// Waits for the sandbox thread to reach its request loop.
    pub async fn ready(&self) -> Result<(), CallError> {
        let mut ready = self.ready.clone();
        let wait = async {
            while !*ready.borrow_and_update() {
                ready
                    .changed()
                    .await
                    .map_err(|_| CallError::Unknown("sandbox exited before ready".into()))?;
            }
            Ok(())
        };
        tokio::time::timeout(self.ready_timeout, wait)
            .await
            .map_err(|_| {
                CallError::Unknown(format!(
                    "sandbox for {} not ready within {}ms",
                    self.service,
                    self.ready_timeout.as_millis()
                ))
            })?
    }

    /// Dispatches one call. The reply arrives on the broker event channel.
    pub fn call(&self, request: CallRequest) -> Result<(), CallError> {
        self.tx
            .send(SandboxRequest::Call(request))
            .map_err(|_| CallError::Unknown(format!("sandbox for {} is gone", self.service)))
    }

    /// Compiles and instantiates a plugin without calling into it.
    pub async fn preload_plugin(&self, plugin: &str) -> Result<(), CallError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SandboxRequest::Preload {
                plugin: plugin.to_string(),
                reply: reply_tx,
            })
            .map_err(|_| CallError::Unknown(format!("sandbox for {} is gone", self.service)))?;
        reply_rx
            .await
            .map_err(|_| CallError::Unknown(format!("sandbox for {} is gone", self.service)))?
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(SandboxRequest::Shutdown);
    }
}

struct PluginInstance {
    instance: Instance,
    loaded: LoadedComponent,
}

fn run_sandbox(
    config: SandboxConfig,
    rx: std_mpsc::Receiver<SandboxRequest>,
    ready_tx: watch::Sender<bool>,
) {
    let SandboxConfig {
        service,
        loader,
        storage,
        events,
        limits,
        ..
    } = config;

    let engine = shared_engine();
    let state = SandboxState {
        service: service.clone(),
        origin: Origin::for_sandbox(service.clone()),
        keyvalue: KeyValue::new(storage, service.clone()),
        result_cache: Vec::new(),
        events: events.clone(),
        limiter: SandboxLimiter::new(limits.max_memory_bytes),
        // No filesystem, no network, no environment.
        wasi_ctx: WasiCtxBuilder::new().build(),
        resource_table: ResourceTable::new(),
    };
    let mut store = Store::new(engine, state);
    store.limiter(|s| &mut s.limiter);

    let importables = [keyvalue::importable(), broker_importable()];
    let mut plugins: HashMap<String, PluginInstance> = HashMap::new();

    info!(service = %service, "Sandbox ready");
    let _ = ready_tx.send(true);

    while let Ok(request) = rx.recv() {
        match request {
            SandboxRequest::Preload { plugin, reply } => {
                let plugin_id = PluginId::new(service.clone(), plugin);
                let result =
                    ensure_loaded(&mut store, &loader, &importables, &mut plugins, &plugin_id)
                        .map(|_| ());
                let _ = reply.send(result);
            }
            SandboxRequest::Call(request) => {
                store.data_mut().result_cache = request.result_cache.clone();
                let result =
                    execute(&mut store, &loader, &importables, &mut plugins, &request, &limits);
                store.data_mut().result_cache.clear();

                let reply = crate::error::build_reply(request.id, request.args, result);
                if events.send(BrokerEvent::Resolved(reply)).is_err() {
                    break;
                }
            }
            SandboxRequest::Shutdown => break,
        }
    }
    info!(service = %service, "Sandbox shut down");
}

fn ensure_loaded<'a>(
    store: &mut Store<SandboxState>,
    loader: &ComponentLoader,
    importables: &[Importable],
    plugins: &'a mut HashMap<String, PluginInstance>,
    plugin_id: &PluginId,
) -> Result<&'a mut PluginInstance, CallError> {
    match plugins.entry(plugin_id.plugin.clone()) {
        Entry::Occupied(entry) => Ok(entry.into_mut()),
        Entry::Vacant(entry) => {
            let loaded = loader.load(plugin_id, importables)?;
            let instance = loaded
                .instance_pre
                .instantiate(&mut *store)
                .map_err(|e| CallError::classify_wasm(plugin_id, &e))?;
            debug!(plugin = %plugin_id, "Plugin instantiated");
            Ok(entry.insert(PluginInstance { instance, loaded }))
        }
    }
}

fn execute(
    store: &mut Store<SandboxState>,
    loader: &ComponentLoader,
    importables: &[Importable],
    plugins: &mut HashMap<String, PluginInstance>,
    request: &CallRequest,
    limits: &ResourceLimits,
) -> Result<Value, CallError> {
    let args = &request.args;
    let plugin_id = args.plugin_id();
    let entry = ensure_loaded(store, loader, importables, plugins, &plugin_id)?;

    let index = entry
        .loaded
        .export(args.intf.as_deref(), &args.method)
        .ok_or_else(|| CallError::InvalidPlugin {
            plugin: plugin_id.clone(),
            message: format!("no export for {}", args.target()),
        })?;
    let func = entry
        .instance
        .get_func(&mut *store, index)
        .ok_or_else(|| CallError::InvalidPlugin {
            plugin: plugin_id.clone(),
            message: format!("export for {} is not a function", args.target()),
        })?;

    store.set_fuel(limits.fuel_per_call).ok();
    debug!(target = %args.target(), "Dispatching call");

    let params = [Val::String(args.params_json())];
    let mut results = [Val::Bool(false)];
    if let Err(e) = func.call(&mut *store, &params, &mut results) {
        return Err(CallError::classify_wasm(&plugin_id, &e));
    }
    func.post_return(&mut *store)
        .map_err(|e| CallError::classify_wasm(&plugin_id, &e))?;

    decode_result(&plugin_id, &results[0])
}

/// Decodes the uniform `result<string, error-payload>` return shape.
///
/// The producer of a returned error is stamped here, from the identity of
/// the plugin that was called, never from anything the component reports
/// about itself.
fn decode_result(plugin: &PluginId, val: &Val) -> Result<Value, CallError> {
    match val {
        Val::Result(Ok(value)) => match value.as_deref() {
            Some(Val::String(json)) => serde_json::from_str(json).map_err(|e| {
                CallError::Parse(format!("{plugin} returned malformed JSON: {e}"))
            }),
            None => Ok(Value::Null),
            Some(_) => Err(CallError::Parse(format!(
                "{plugin} returned a non-string value"
            ))),
        },
        Val::Result(Err(error)) => {
            let (code, message) = match error.as_deref() {
                Some(Val::Record(fields)) => {
                    let mut code = 0u32;
                    let mut message = String::new();
                    for (name, field) in fields {
                        match (name.as_str(), field) {
                            ("code", Val::U32(c)) => code = *c,
                            ("message", Val::String(m)) => message = m.clone(),
                            _ => {}
                        }
                    }
                    (code, message)
                }
                _ => (0, String::new()),
            };
            Err(CallError::ComponentError(skiff_types::ErrorPayload {
                code,
                producer: plugin.clone(),
                message,
            }))
        }
        _ => Err(CallError::Parse(format!(
            "{plugin} returned an unexpected result shape"
        ))),
    }
}

fn wire_error(message: impl Into<String>) -> WireError {
    WireError {
        code: 0,
        message: message.into(),
    }
}

/// The `skiff:broker/host` importable: nested calls, caller identity, and
/// host actions. Every function blocks the sandbox thread on a round trip
/// to the broker loop.
pub(crate) fn broker_importable() -> Importable {
    Importable::new("skiff:broker/host", |linker| {
        let mut host = linker.instance("skiff:broker/host")?;

        host.func_wrap(
            "sync-call",
            |ctx: StoreContextMut<'_, SandboxState>, (args_json,): (String,)| {
                let state = ctx.data();
                let args: CallArgs = match serde_json::from_str(&args_json) {
                    Ok(args) => args,
                    Err(e) => {
                        return Ok((Err::<String, _>(wire_error(format!(
                            "malformed call arguments: {e}"
                        ))),))
                    }
                };

                // Replay a memoized result without a broker round trip.
                if let Some(hit) = state.result_cache.iter().find(|e| e.matches(&args)) {
                    debug!(target = %args.target(), "Result cache hit");
                    let json = serde_json::to_string(&hit.result)
                        .map_err(|e| anyhow::anyhow!("result cache entry unserializable: {e}"))?;
                    return Ok((Ok(json),));
                }

                let request = CallRequest::new(state.origin.clone(), args, Vec::new());
                let (reply_tx, reply_rx) = std_mpsc::channel();
                state
                    .events
                    .send(BrokerEvent::NestedCall {
                        request,
                        reply: reply_tx,
                    })
                    .map_err(|_| anyhow::anyhow!("call broker unavailable"))?;

                // Blocks this sandbox thread until the broker resolves or
                // abandons the chain.
                let reply = reply_rx
                    .recv()
                    .map_err(|_| anyhow::anyhow!("call chain terminated"))?;
                match reply.outcome {
                    CallOutcome::Ok { value } => {
                        let json = serde_json::to_string(&value)
                            .map_err(|e| anyhow::anyhow!("unserializable call result: {e}"))?;
                        Ok((Ok(json),))
                    }
                    CallOutcome::Recoverable { error } => Ok((Err(WireError {
                        code: error.code,
                        message: error.to_string(),
                    }),)),
                    CallOutcome::Unrecoverable { message } => {
                        Err(anyhow::anyhow!("call chain terminated: {message}"))
                    }
                }
            },
        )?;

        host.func_wrap(
            "get-caller",
            |ctx: StoreContextMut<'_, SandboxState>, (): ()| {
                let state = ctx.data();
                let (reply_tx, reply_rx) = std_mpsc::channel();
                state
                    .events
                    .send(BrokerEvent::GetCaller {
                        service: state.service.clone(),
                        reply: reply_tx,
                    })
                    .map_err(|_| anyhow::anyhow!("call broker unavailable"))?;
                let result = reply_rx
                    .recv()
                    .map_err(|_| anyhow::anyhow!("call chain terminated"))?;
                Ok((result.map_err(wire_error),))
            },
        )?;

        host.func_wrap(
            "add-actions",
            |ctx: StoreContextMut<'_, SandboxState>, (actions_json,): (String,)| {
                let state = ctx.data();
                let actions: Vec<HostAction> = match serde_json::from_str(&actions_json) {
                    Ok(actions) => actions,
                    Err(e) => {
                        return Ok((Err::<(), _>(wire_error(format!(
                            "malformed actions: {e}"
                        ))),))
                    }
                };
                if let Some(foreign) = actions.iter().find(|a| a.service != state.service) {
                    warn!(
                        service = %state.service,
                        claimed = %foreign.service,
                        "Rejecting action claiming a foreign service"
                    );
                    return Ok((Err(wire_error("actions must carry the caller's own service")),));
                }

                let (reply_tx, reply_rx) = std_mpsc::channel();
                state
                    .events
                    .send(BrokerEvent::AddActions {
                        service: state.service.clone(),
                        actions,
                        reply: reply_tx,
                    })
                    .map_err(|_| anyhow::anyhow!("call broker unavailable"))?;
                let result = reply_rx
                    .recv()
                    .map_err(|_| anyhow::anyhow!("call chain terminated"))?;
                Ok((result.map_err(wire_error),))
            },
        )?;

        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::DirFetcher;
    use pretty_assertions::assert_eq;

    #[test]
    fn first_party_limits_values() {
        let limits = ResourceLimits::first_party();
        assert_eq!(limits.max_memory_bytes, 64 * 1024 * 1024);
        assert_eq!(limits.fuel_per_call, 1_000_000_000);
    }

    #[test]
    fn third_party_limits_stricter_than_first_party() {
        let fp = ResourceLimits::first_party();
        let tp = ResourceLimits::third_party();
        assert!(tp.max_memory_bytes < fp.max_memory_bytes);
        assert!(tp.fuel_per_call < fp.fuel_per_call);
    }

    #[test]
    fn limiter_denies_growth_past_ceiling() {
        let mut limiter = SandboxLimiter::new(1024 * 1024);
        assert!(limiter.memory_growing(0, 512 * 1024, None).unwrap());
        assert_eq!(limiter.current_memory_bytes(), 512 * 1024);
        assert!(!limiter.memory_growing(512 * 1024, 2 * 1024 * 1024, None).unwrap());
    }

    #[test]
    fn decode_ok_string_result() {
        let plugin = PluginId::new(ServiceId::new("svc").unwrap(), "p");
        let val = Val::Result(Ok(Some(Box::new(Val::String("{\"x\":1}".into())))));
        let decoded = decode_result(&plugin, &val).unwrap();
        assert_eq!(decoded, serde_json::json!({"x": 1}));
    }

    #[test]
    fn decode_empty_result_is_null() {
        let plugin = PluginId::new(ServiceId::new("svc").unwrap(), "p");
        let decoded = decode_result(&plugin, &Val::Result(Ok(None))).unwrap();
        assert_eq!(decoded, Value::Null);
    }

    #[test]
    fn decode_error_record_stamps_producer_host_side() {
        let plugin = PluginId::new(ServiceId::new("svc").unwrap(), "p");
        let record = Val::Record(vec![
            ("code".to_string(), Val::U32(7)),
            ("message".to_string(), Val::String("no such user".into())),
        ]);
        let val = Val::Result(Err(Some(Box::new(record))));

        match decode_result(&plugin, &val).unwrap_err() {
            CallError::ComponentError(payload) => {
                assert_eq!(payload.code, 7);
                assert_eq!(payload.message, "no such user");
                assert_eq!(payload.producer, plugin);
            }
            other => panic!("expected ComponentError, got {other}"),
        }
    }

    #[test]
    fn decode_malformed_json_is_parse_error() {
        let plugin = PluginId::new(ServiceId::new("svc").unwrap(), "p");
        let val = Val::Result(Ok(Some(Box::new(Val::String("not json".into())))));
        assert!(matches!(
            decode_result(&plugin, &val).unwrap_err(),
            CallError::Parse(_)
        ));
    }

    #[tokio::test]
    async fn sandbox_signals_ready_and_shuts_down() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let config = SandboxConfig::new(
            ServiceId::new("svc").unwrap(),
            Arc::new(ComponentLoader::new(Box::new(DirFetcher::new("/nonexistent")))),
            Arc::new(KvBackend::open_in_memory().unwrap()),
            events_tx,
        );
        let handle = SandboxHandle::spawn(config).unwrap();
        handle.ready().await.unwrap();
        assert_eq!(handle.address(), "sandbox://svc");
        handle.shutdown();
    }

    #[tokio::test]
    async fn preload_of_missing_plugin_is_download_error() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let config = SandboxConfig::new(
            ServiceId::new("svc").unwrap(),
            Arc::new(ComponentLoader::new(Box::new(DirFetcher::new("/nonexistent")))),
            Arc::new(KvBackend::open_in_memory().unwrap()),
            events_tx,
        );
        let handle = SandboxHandle::spawn(config).unwrap();
        handle.ready().await.unwrap();

        let err = handle.preload_plugin("absent").await.unwrap_err();
        assert!(matches!(err, CallError::PluginDownload { .. }));
        handle.shutdown();
    }
}
