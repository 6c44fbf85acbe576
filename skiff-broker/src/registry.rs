//! Sandbox registry.
//!
//! One sandbox per service, created on demand and deduplicated so two
//! plugins of the same service always share an execution context. Also
//! owns the admission predicate: a message claiming to come from a sandbox
//! is accepted only when its origin address belongs to a sandbox this
//! registry actually spawned.

use crate::error::CallError;
use crate::loader::ComponentLoader;
use crate::sandbox::{
    BrokerEvent, ResourceLimits, SandboxConfig, SandboxHandle, READY_TIMEOUT_MS,
};
use skiff_storage::KvBackend;
use skiff_types::{InboundMessage, MessageSource, PluginId, ServiceId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub struct SandboxRegistry {
    sandboxes: HashMap<ServiceId, SandboxHandle>,
    loader: Arc<ComponentLoader>,
    storage: Arc<KvBackend>,
    events: mpsc::UnboundedSender<BrokerEvent>,
    limits: ResourceLimits,
    ready_timeout_ms: u64,
}

impl SandboxRegistry {
    pub fn new(
        loader: Arc<ComponentLoader>,
        storage: Arc<KvBackend>,
        events: mpsc::UnboundedSender<BrokerEvent>,
    ) -> Self {
        Self {
            sandboxes: HashMap::new(),
            loader,
            storage,
            events,
            limits: ResourceLimits::third_party(),
            ready_timeout_ms: READY_TIMEOUT_MS,
        }
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Returns the sandbox for `service`, spawning and awaiting readiness
    /// on first use.
    pub async fn get_or_spawn(&mut self, service: &ServiceId) -> Result<&SandboxHandle, CallError> {
        if !self.sandboxes.contains_key(service) {
            let config = SandboxConfig {
                service: service.clone(),
                loader: Arc::clone(&self.loader),
                storage: Arc::clone(&self.storage),
                events: self.events.clone(),
                limits: self.limits.clone(),
                ready_timeout_ms: self.ready_timeout_ms,
            };
            let handle = SandboxHandle::spawn(config)?;
            handle.ready().await?;
            info!(service = %service, "Sandbox spawned");
            self.sandboxes.insert(service.clone(), handle);
        }
        self.sandboxes
            .get(service)
            .ok_or_else(|| CallError::Unknown(format!("sandbox for {service} vanished")))
    }

    #[must_use]
    pub fn get(&self, service: &ServiceId) -> Option<&SandboxHandle> {
        self.sandboxes.get(service)
    }

    /// Spawns sandboxes and compiles plugins ahead of first use. Failures
    /// are reported per plugin; one bad plugin does not abort the rest.
    pub async fn preload(
        &mut self,
        plugins: &[PluginId],
    ) -> Vec<(PluginId, Result<(), CallError>)> {
        let mut results = Vec::with_capacity(plugins.len());
        for plugin in plugins {
            let result = match self.get_or_spawn(&plugin.service).await {
                Ok(handle) => handle.preload_plugin(&plugin.plugin).await,
                Err(e) => Err(e),
            };
            if let Err(e) = &result {
                warn!(plugin = %plugin, error = %e, "Preload failed");
            }
            results.push((plugin.clone(), result));
        }
        results
    }

    /// Whether `address` belongs to a sandbox this registry spawned.
    #[must_use]
    pub fn is_known_address(&self, address: &str) -> bool {
        self.sandboxes
            .values()
            .any(|handle| handle.address() == address)
    }

    /// Admission predicate for messages claiming sandbox origin: the
    /// source must be a sandbox and the claimed address must be one of
    /// ours. Everything else is dropped before reaching the call context.
    #[must_use]
    pub fn admit(&self, message: &InboundMessage) -> bool {
        message.source == MessageSource::Sandbox && self.is_known_address(&message.origin.address)
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.sandboxes.len()
    }

    pub fn shutdown_all(&mut self) {
        for handle in self.sandboxes.values() {
            handle.shutdown();
        }
        self.sandboxes.clear();
    }
}
