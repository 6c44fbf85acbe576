//! Key-value capability shim.
//!
//! Gives a sandboxed component a namespaced, persistent key-value store
//! without granting it access to any other component's data. Every bucket
//! is scoped to `{service}:{bucket}`, where the service identity comes
//! from the sandbox itself and is never self-reported by the component.
//!
//! Exposed to guests as the `host:keyvalue/store` importable; the host-side
//! API below is also usable directly and is what the tests exercise.

use crate::loader::Importable;
use crate::sandbox::{SandboxState, WireError};
use serde::{Deserialize, Serialize};
use skiff_storage::KvBackend;
use skiff_types::ServiceId;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use wasmtime::StoreContextMut;

/// Keys must be strictly shorter than this.
pub const MAX_KEY_LEN: usize = 20;
/// `set` values must be strictly smaller than this (100 KiB).
pub const MAX_VALUE_BYTES: usize = 100 * 1024;
/// Page size for `list_keys`.
pub const PAGE_SIZE: usize = 1000;

/// Errors raised by the key-value shim.
///
/// Structural errors are raised synchronously to the immediate caller;
/// anything from the underlying storage primitive is wrapped into
/// [`KvError::Other`] carrying the original message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KvError {
    #[error("invalid bucket identifier: {0:?}")]
    InvalidBucket(String),

    #[error("key too long (max {max}): {key:?}", max = MAX_KEY_LEN - 1)]
    KeyTooLong { key: String },

    #[error("value too large for key {key:?}: {size} bytes")]
    ValueTooLarge { key: String, size: usize },

    #[error("invalid pagination cursor")]
    InvalidCursor,

    #[error("{0}")]
    Other(String),
}

impl KvError {
    /// Stable numeric code carried across the wasm boundary.
    #[must_use]
    pub fn code(&self) -> u32 {
        match self {
            Self::Other(_) => 0,
            Self::InvalidBucket(_) => 1,
            Self::KeyTooLong { .. } => 2,
            Self::ValueTooLarge { .. } => 3,
            Self::InvalidCursor => 4,
        }
    }
}

impl From<skiff_storage::StorageError> for KvError {
    fn from(err: skiff_storage::StorageError) -> Self {
        Self::Other(err.to_string())
    }
}

/// One page of keys plus the cursor for the next page, if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyList {
    pub keys: Vec<String>,
    pub cursor: Option<String>,
}

/// The key-value capability for one service identity.
#[derive(Clone)]
pub struct KeyValue {
    backend: Arc<KvBackend>,
    service: ServiceId,
}

impl KeyValue {
    pub fn new(backend: Arc<KvBackend>, service: ServiceId) -> Self {
        Self { backend, service }
    }

    /// Opens a bucket scoped to `{service}:{bucket}`.
    ///
    /// Bucket identifiers are alphanumeric plus hyphen, non-empty.
    pub fn open(&self, bucket: &str) -> Result<Bucket, KvError> {
        let valid = !bucket.is_empty()
            && bucket
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid {
            return Err(KvError::InvalidBucket(bucket.to_string()));
        }
        Ok(Bucket {
            backend: Arc::clone(&self.backend),
            namespace: format!("{}:{}", self.service, bucket),
        })
    }
}

/// A handle to one namespaced bucket.
#[derive(Debug)]
pub struct Bucket {
    backend: Arc<KvBackend>,
    namespace: String,
}

impl Bucket {
    /// The `{service}:{bucket}` namespace this handle is scoped to.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn full_key(&self, key: &str) -> Result<String, KvError> {
        if key.len() >= MAX_KEY_LEN {
            return Err(KvError::KeyTooLong {
                key: key.to_string(),
            });
        }
        Ok(format!("{}:{}", self.namespace, key))
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let full = self.full_key(key)?;
        Ok(self.backend.get(&full)?)
    }

    pub fn set(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        let full = self.full_key(key)?;
        if value.len() >= MAX_VALUE_BYTES {
            return Err(KvError::ValueTooLarge {
                key: key.to_string(),
                size: value.len(),
            });
        }
        Ok(self.backend.set(&full, value)?)
    }

    pub fn delete(&self, key: &str) -> Result<(), KvError> {
        let full = self.full_key(key)?;
        Ok(self.backend.delete(&full)?)
    }

    pub fn exists(&self, key: &str) -> Result<bool, KvError> {
        let full = self.full_key(key)?;
        Ok(self.backend.exists(&full)?)
    }

    /// Paginates all keys under this bucket's namespace prefix.
    ///
    /// Returns at most [`PAGE_SIZE`] keys and an opaque forward-only cursor
    /// when more remain. No key outside the caller's own namespace is ever
    /// enumerable.
    pub fn list_keys(&self, cursor: Option<&str>) -> Result<KeyList, KvError> {
        let prefix = format!("{}:", self.namespace);
        let after = match cursor {
            Some(c) => {
                let bytes = hex::decode(c).map_err(|_| KvError::InvalidCursor)?;
                let key = String::from_utf8(bytes).map_err(|_| KvError::InvalidCursor)?;
                if !key.starts_with(&prefix) {
                    return Err(KvError::InvalidCursor);
                }
                Some(key)
            }
            None => None,
        };

        // Fetch one extra row to detect whether another page exists.
        let mut full_keys =
            self.backend
                .keys_with_prefix(&prefix, after.as_deref(), PAGE_SIZE + 1)?;

        let next_cursor = if full_keys.len() > PAGE_SIZE {
            full_keys.truncate(PAGE_SIZE);
            full_keys.last().map(|k| hex::encode(k.as_bytes()))
        } else {
            None
        };

        let keys = full_keys
            .into_iter()
            .map(|k| k[prefix.len()..].to_string())
            .collect();
        Ok(KeyList {
            keys,
            cursor: next_cursor,
        })
    }
}

/// Read-modify-write counters.
///
/// `increment` is **not atomic** across processes sharing the same storage:
/// two concurrent increments can lose an update. Under the per-service
/// namespace rule no two sandboxes share a bucket, so within one host this
/// cannot race; the limitation is intentional and documented rather than
/// hidden.
pub mod atomics {
    use super::{Bucket, KvError};

    /// Increments the decimal counter under `key` by `delta` and returns
    /// the new value. A missing key starts at zero.
    pub fn increment(bucket: &Bucket, key: &str, delta: i64) -> Result<i64, KvError> {
        let current = match bucket.get(key)? {
            Some(bytes) => {
                let text = String::from_utf8(bytes)
                    .map_err(|_| KvError::Other(format!("key {key:?} is not a counter")))?;
                text.trim()
                    .parse::<i64>()
                    .map_err(|_| KvError::Other(format!("key {key:?} is not a counter")))?
            }
            None => 0,
        };
        let next = current
            .checked_add(delta)
            .ok_or_else(|| KvError::Other(format!("counter {key:?} overflowed")))?;
        bucket.set(key, next.to_string().as_bytes())?;
        Ok(next)
    }
}

/// Convenience wrappers over multiple keys. Applied sequentially, with no
/// atomicity guarantee.
pub mod batch {
    use super::{Bucket, KvError};

    pub fn get_many(
        bucket: &Bucket,
        keys: &[String],
    ) -> Result<Vec<Option<(String, Vec<u8>)>>, KvError> {
        keys.iter()
            .map(|key| {
                Ok(bucket
                    .get(key)?
                    .map(|value| (key.clone(), value)))
            })
            .collect()
    }

    pub fn set_many(bucket: &Bucket, pairs: &[(String, Vec<u8>)]) -> Result<(), KvError> {
        for (key, value) in pairs {
            bucket.set(key, value)?;
        }
        Ok(())
    }

    pub fn delete_many(bucket: &Bucket, keys: &[String]) -> Result<(), KvError> {
        for key in keys {
            bucket.delete(key)?;
        }
        Ok(())
    }
}

fn wire<T>(result: Result<T, KvError>) -> Result<T, WireError> {
    result.map_err(|e| WireError {
        code: e.code(),
        message: e.to_string(),
    })
}

fn open_bucket(state: &SandboxState, bucket: &str) -> Result<Bucket, KvError> {
    state.keyvalue.open(bucket)
}

/// The `host:keyvalue/store` importable wired into every sandbox linker.
pub(crate) fn importable() -> Importable {
    Importable::new("host:keyvalue/store", |linker| {
        let mut store = linker.instance("host:keyvalue/store")?;

        store.func_wrap(
            "open",
            |ctx: StoreContextMut<'_, SandboxState>, (bucket,): (String,)| {
                debug!(service = %ctx.data().service, bucket = %bucket, "kv open");
                Ok((wire(open_bucket(ctx.data(), &bucket).map(|_| ())),))
            },
        )?;

        store.func_wrap(
            "get",
            |ctx: StoreContextMut<'_, SandboxState>, (bucket, key): (String, String)| {
                let result = open_bucket(ctx.data(), &bucket).and_then(|b| b.get(&key));
                Ok((wire(result),))
            },
        )?;

        store.func_wrap(
            "set",
            |ctx: StoreContextMut<'_, SandboxState>,
             (bucket, key, value): (String, String, Vec<u8>)| {
                let result = open_bucket(ctx.data(), &bucket).and_then(|b| b.set(&key, &value));
                Ok((wire(result),))
            },
        )?;

        store.func_wrap(
            "delete",
            |ctx: StoreContextMut<'_, SandboxState>, (bucket, key): (String, String)| {
                let result = open_bucket(ctx.data(), &bucket).and_then(|b| b.delete(&key));
                Ok((wire(result),))
            },
        )?;

        store.func_wrap(
            "exists",
            |ctx: StoreContextMut<'_, SandboxState>, (bucket, key): (String, String)| {
                let result = open_bucket(ctx.data(), &bucket).and_then(|b| b.exists(&key));
                Ok((wire(result),))
            },
        )?;

        store.func_wrap(
            "list-keys",
            |ctx: StoreContextMut<'_, SandboxState>,
             (bucket, cursor): (String, Option<String>)| {
                let result = open_bucket(ctx.data(), &bucket)
                    .and_then(|b| b.list_keys(cursor.as_deref()))
                    .and_then(|page| {
                        serde_json::to_string(&page).map_err(|e| KvError::Other(e.to_string()))
                    });
                Ok((wire(result),))
            },
        )?;

        store.func_wrap(
            "increment",
            |ctx: StoreContextMut<'_, SandboxState>,
             (bucket, key, delta): (String, String, i64)| {
                let result =
                    open_bucket(ctx.data(), &bucket).and_then(|b| atomics::increment(&b, &key, delta));
                Ok((wire(result),))
            },
        )?;

        store.func_wrap(
            "get-many",
            |ctx: StoreContextMut<'_, SandboxState>, (bucket, keys): (String, Vec<String>)| {
                let result =
                    open_bucket(ctx.data(), &bucket).and_then(|b| batch::get_many(&b, &keys));
                Ok((wire(result),))
            },
        )?;

        store.func_wrap(
            "set-many",
            |ctx: StoreContextMut<'_, SandboxState>,
             (bucket, pairs): (String, Vec<(String, Vec<u8>)>)| {
                let result =
                    open_bucket(ctx.data(), &bucket).and_then(|b| batch::set_many(&b, &pairs));
                Ok((wire(result),))
            },
        )?;

        store.func_wrap(
            "delete-many",
            |ctx: StoreContextMut<'_, SandboxState>, (bucket, keys): (String, Vec<String>)| {
                let result =
                    open_bucket(ctx.data(), &bucket).and_then(|b| batch::delete_many(&b, &keys));
                Ok((wire(result),))
            },
        )?;

        Ok(())
    })
}
