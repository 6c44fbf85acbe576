//! Component loading pipeline.
//!
//! Turns raw component bytes into an instantiable artifact in four steps:
//! fetch, compile (cached by content hash), link imports, and enumerate the
//! callable exports. Failures at each step map onto distinct error kinds so
//! a caller can tell a missing artifact from a corrupt one from one with
//! unsatisfied imports.
//!
//! Every callable export must follow the uniform call shape: one string
//! parameter (the JSON-encoded arguments) returning `result<string,
//! error-payload>`. Exports with any other signature are skipped; a
//! component with no conforming export at all is rejected outright.

use crate::error::CallError;
use crate::sandbox::SandboxState;
use sha2::{Digest, Sha256};
use skiff_types::PluginId;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};
use tracing::{debug, info, warn};
use wasmtime::component::types::ComponentItem;
use wasmtime::component::{Component, ComponentExportIndex, InstancePre, Linker};
use wasmtime::Engine;

static ENGINE: OnceLock<Engine> = OnceLock::new();

/// Returns the shared Wasmtime engine, creating it on first access.
///
/// All sandboxes share one engine so compiled components can be reused
/// across stores.
pub(crate) fn shared_engine() -> &'static Engine {
    ENGINE.get_or_init(|| {
        let mut config = wasmtime::Config::new();
        config.wasm_component_model(true);
        config.consume_fuel(true);
        Engine::new(&config).expect("failed to create Wasmtime engine")
    })
}

/// Source of raw component bytes for a plugin.
pub trait ComponentFetcher: Send + Sync {
    fn fetch(&self, plugin: &PluginId) -> Result<Vec<u8>, CallError>;
}

/// Fetches component bytes from `{root}/{service}/{plugin}.wasm`.
pub struct DirFetcher {
    root: PathBuf,
}

impl DirFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, plugin: &PluginId) -> PathBuf {
        self.root
            .join(plugin.service.as_str())
            .join(format!("{}.wasm", plugin.plugin))
    }
}

impl ComponentFetcher for DirFetcher {
    fn fetch(&self, plugin: &PluginId) -> Result<Vec<u8>, CallError> {
        let path = self.path_for(plugin);
        std::fs::read(&path).map_err(|e| CallError::PluginDownload {
            plugin: plugin.clone(),
            message: format!("{}: {}", path.display(), e),
        })
    }
}

/// One named host interface that can be wired into a component's linker.
///
/// The baseline system interfaces are wired into every sandbox; the broker
/// adds its call-brokering interface on top. `allow_shadowing` is enabled
/// so a later importable can override an earlier definition of the same
/// name.
pub struct Importable {
    pub name: &'static str,
    wire: Box<dyn Fn(&mut Linker<SandboxState>) -> anyhow::Result<()> + Send + Sync>,
}

impl Importable {
    pub fn new(
        name: &'static str,
        wire: impl Fn(&mut Linker<SandboxState>) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            wire: Box::new(wire),
        }
    }

    pub(crate) fn wire(&self, linker: &mut Linker<SandboxState>) -> anyhow::Result<()> {
        (self.wire)(linker)
    }
}

/// A compiled, linked component ready for per-sandbox instantiation, plus
/// the dispatch table of its callable exports.
pub struct LoadedComponent {
    pub plugin: PluginId,
    /// SHA-256 of the raw component bytes, hex-encoded.
    pub content_hash: String,
    pub instance_pre: InstancePre<SandboxState>,
    exports: HashMap<(Option<String>, String), ComponentExportIndex>,
}

impl std::fmt::Debug for LoadedComponent {
    // `InstancePre` carries no useful debug output; show the identity.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedComponent")
            .field("plugin", &self.plugin)
            .field("content_hash", &self.content_hash)
            .field("exports", &self.exports.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl LoadedComponent {
    /// Resolves the export index for `intf.method`, or a top-level `method`
    /// when `intf` is `None`.
    #[must_use]
    pub fn export(&self, intf: Option<&str>, method: &str) -> Option<ComponentExportIndex> {
        self.exports
            .get(&(intf.map(str::to_string), method.to_string()))
            .copied()
    }

    #[must_use]
    pub fn export_count(&self) -> usize {
        self.exports.len()
    }
}

/// Compiles and links components, caching compiled artifacts by content
/// hash so repeated loads of the same bytes skip compilation.
pub struct ComponentLoader {
    fetcher: Box<dyn ComponentFetcher>,
    compiled: Mutex<HashMap<String, Component>>,
}

impl ComponentLoader {
    pub fn new(fetcher: Box<dyn ComponentFetcher>) -> Self {
        Self {
            fetcher,
            compiled: Mutex::new(HashMap::new()),
        }
    }

    /// Fetches, compiles, links, and validates the component for `plugin`.
    pub fn load(
        &self,
        plugin: &PluginId,
        importables: &[Importable],
    ) -> Result<LoadedComponent, CallError> {
        let engine = shared_engine();
        let bytes = self.fetcher.fetch(plugin)?;
        let content_hash = hex::encode(Sha256::digest(&bytes));

        let component = self.compile_cached(engine, plugin, &bytes, &content_hash)?;

        let mut linker: Linker<SandboxState> = Linker::new(engine);
        linker.allow_shadowing(true);
        wasmtime_wasi::p2::add_to_linker_sync(&mut linker)
            .map_err(|e| CallError::ShimDownload(format!("{e:#}")))?;
        for importable in importables {
            importable
                .wire(&mut linker)
                .map_err(|e| CallError::ShimDownload(format!("{}: {e:#}", importable.name)))?;
        }

        // Unresolved imports surface here, at load time, not at first call.
        let instance_pre = linker.instantiate_pre(&component).map_err(|e| {
            CallError::InvalidPlugin {
                plugin: plugin.clone(),
                message: format!("unsatisfied imports: {e:#}"),
            }
        })?;

        let exports = enumerate_exports(engine, plugin, &component)?;
        info!(
            plugin = %plugin,
            hash = %&content_hash[..12],
            exports = exports.len(),
            "Component loaded"
        );

        Ok(LoadedComponent {
            plugin: plugin.clone(),
            content_hash,
            instance_pre,
            exports,
        })
    }

    fn compile_cached(
        &self,
        engine: &Engine,
        plugin: &PluginId,
        bytes: &[u8],
        content_hash: &str,
    ) -> Result<Component, CallError> {
        let mut compiled = self
            .compiled
            .lock()
            .map_err(|_| CallError::Unknown("component cache poisoned".into()))?;
        if let Some(component) = compiled.get(content_hash) {
            debug!(plugin = %plugin, hash = %&content_hash[..12], "Compiled component cache hit");
            return Ok(component.clone());
        }

        let compile_start = std::time::Instant::now();
        let component = Component::new(engine, bytes)
            .map_err(|e| CallError::Transpile(format!("{plugin}: {e:#}")))?;
        info!(
            plugin = %plugin,
            size_bytes = bytes.len(),
            elapsed_ms = compile_start.elapsed().as_millis(),
            "Compiled component"
        );

        compiled.insert(content_hash.to_string(), component.clone());
        Ok(component)
    }

    /// Number of distinct component binaries currently held in the
    /// compiled-artifact cache.
    #[must_use]
    pub fn compiled_count(&self) -> usize {
        self.compiled.lock().map(|cache| cache.len()).unwrap_or(0)
    }
}

/// Walks the component's export surface and builds the dispatch table of
/// call-shaped functions, keyed by `(interface, method)`.
fn enumerate_exports(
    engine: &Engine,
    plugin: &PluginId,
    component: &Component,
) -> Result<HashMap<(Option<String>, String), ComponentExportIndex>, CallError> {
    let mut table = HashMap::new();
    let ty = component.component_type();

    for (name, item) in ty.exports(engine) {
        match item {
            ComponentItem::ComponentFunc(func) => {
                if !is_call_shaped(&func) {
                    warn!(plugin = %plugin, export = name, "Skipping export with non-standard signature");
                    continue;
                }
                let Some(index) = component.get_export_index(None, name) else {
                    continue;
                };
                table.insert((None, name.to_string()), index);
            }
            ComponentItem::ComponentInstance(instance) => {
                let Some(instance_index) = component.get_export_index(None, name) else {
                    continue;
                };
                for (func_name, nested) in instance.exports(engine) {
                    let ComponentItem::ComponentFunc(func) = nested else {
                        continue;
                    };
                    if !is_call_shaped(&func) {
                        warn!(
                            plugin = %plugin,
                            export = format!("{name}.{func_name}"),
                            "Skipping export with non-standard signature"
                        );
                        continue;
                    }
                    let Some(index) = component.get_export_index(Some(&instance_index), func_name)
                    else {
                        continue;
                    };
                    table.insert((Some(name.to_string()), func_name.to_string()), index);
                }
            }
            _ => {}
        }
    }

    if table.is_empty() {
        return Err(CallError::InvalidPlugin {
            plugin: plugin.clone(),
            message: "no callable exports".into(),
        });
    }
    Ok(table)
}

/// Whether a function export matches the uniform call shape: exactly one
/// string parameter and a `result<..>` return.
fn is_call_shaped(func: &wasmtime::component::types::ComponentFunc) -> bool {
    use wasmtime::component::Type;

    let mut params = func.params();
    let first_is_string = matches!(params.next(), Some((_, Type::String)));
    if !first_is_string || params.next().is_some() {
        return false;
    }

    let mut results = func.results();
    let single_result = matches!(results.next(), Some(Type::Result(_)));
    single_result && results.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_types::ServiceId;

    fn plugin(service: &str, name: &str) -> PluginId {
        PluginId::new(ServiceId::new(service).unwrap(), name)
    }

    #[test]
    fn dir_fetcher_reads_component_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let service_dir = dir.path().join("accounts");
        std::fs::create_dir_all(&service_dir).unwrap();
        std::fs::write(service_dir.join("plugin.wasm"), b"\0asm").unwrap();

        let fetcher = DirFetcher::new(dir.path());
        let bytes = fetcher.fetch(&plugin("accounts", "plugin")).unwrap();
        assert_eq!(bytes, b"\0asm");
    }

    #[test]
    fn dir_fetcher_missing_artifact_is_download_error() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = DirFetcher::new(dir.path());

        let err = fetcher.fetch(&plugin("accounts", "missing")).unwrap_err();
        assert!(matches!(err, CallError::PluginDownload { .. }));
        assert!(err.to_string().contains("missing.wasm"));
    }

    #[test]
    fn invalid_bytes_are_a_transpile_error() {
        let dir = tempfile::tempdir().unwrap();
        let service_dir = dir.path().join("svc");
        std::fs::create_dir_all(&service_dir).unwrap();
        std::fs::write(service_dir.join("bad.wasm"), b"definitely not wasm").unwrap();

        let loader = ComponentLoader::new(Box::new(DirFetcher::new(dir.path())));
        let err = loader.load(&plugin("svc", "bad"), &[]).unwrap_err();
        assert!(matches!(err, CallError::Transpile(_)));
        assert_eq!(loader.compiled_count(), 0);
    }

    // Binary encoding of the empty component `(component)`.
    const EMPTY_COMPONENT: &[u8] = b"\0asm\x0d\x00\x01\x00";

    #[test]
    fn identical_bytes_are_compiled_once() {
        let dir = tempfile::tempdir().unwrap();
        let service_dir = dir.path().join("svc");
        std::fs::create_dir_all(&service_dir).unwrap();
        std::fs::write(service_dir.join("one.wasm"), EMPTY_COMPONENT).unwrap();
        std::fs::write(service_dir.join("two.wasm"), EMPTY_COMPONENT).unwrap();

        let loader = ComponentLoader::new(Box::new(DirFetcher::new(dir.path())));

        // An empty component compiles and links but exports nothing
        // callable, so the load as a whole is rejected after compilation.
        let err = loader.load(&plugin("svc", "one"), &[]).unwrap_err();
        assert!(matches!(err, CallError::InvalidPlugin { .. }));
        assert_eq!(loader.compiled_count(), 1);

        // Same bytes under a different plugin name: the cache serves the
        // compile, nothing new is added.
        let err = loader.load(&plugin("svc", "two"), &[]).unwrap_err();
        assert!(matches!(err, CallError::InvalidPlugin { .. }));
        assert_eq!(loader.compiled_count(), 1);
    }
}
