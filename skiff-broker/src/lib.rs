//! Wasmtime-based call broker for Skiff plugin sandboxes.
//!
//! Loads untrusted Wasm Component Model plugins into per-service sandboxes
//! and brokers every call between them through a single authoritative call
//! context: a stack of frames where only the currently executing sandbox
//! may issue the next call, a chain-scoped result cache, and a sticky root
//! origin.
//!
//! Each service runs on its own OS thread with its own `wasmtime::Store`,
//! memory ceiling, and CPU fuel budget. Plugins see a namespaced key-value
//! capability and the broker's call interface; nothing else.

mod context;
mod error;
mod keyvalue;
mod loader;
mod registry;
mod sandbox;
mod supervisor;

pub use context::{CallContext, CallFrame, ContextError, UNAUTHORIZED_CALL};
pub use error::{build_reply, CallError};
pub use keyvalue::{
    atomics, batch, Bucket, KeyList, KeyValue, KvError, MAX_KEY_LEN, MAX_VALUE_BYTES, PAGE_SIZE,
};
pub use loader::{ComponentFetcher, ComponentLoader, DirFetcher, Importable, LoadedComponent};
pub use registry::SandboxRegistry;
pub use sandbox::{
    BrokerEvent, ResourceLimits, SandboxConfig, SandboxHandle, SandboxLimiter, SandboxState,
    WireError, READY_TIMEOUT_MS,
};
pub use supervisor::Supervisor;
