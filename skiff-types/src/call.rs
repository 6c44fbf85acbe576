//! Function call arguments, result cache entries, and the structured error
//! payload a component may return to its caller.

use crate::ids::{PluginId, ServiceId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A fully-qualified, serializable description of one call.
///
/// Immutable once constructed. Used both as the wire payload and, via
/// [`CallArgs::cache_key`], as the result-cache and log key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallArgs {
    pub service: ServiceId,
    pub plugin: String,
    pub intf: Option<String>,
    pub method: String,
    pub params: Vec<Value>,
}

impl CallArgs {
    pub fn new(
        service: ServiceId,
        plugin: impl Into<String>,
        intf: Option<String>,
        method: impl Into<String>,
        params: Vec<Value>,
    ) -> Self {
        Self {
            service,
            plugin: plugin.into(),
            intf,
            method: method.into(),
            params,
        }
    }

    /// The plugin this call addresses.
    #[must_use]
    pub fn plugin_id(&self) -> PluginId {
        PluginId::new(self.service.clone(), self.plugin.clone())
    }

    /// Deterministic string form of the target, e.g. `accounts:plugin/api.get-user`.
    #[must_use]
    pub fn target(&self) -> String {
        match &self.intf {
            Some(intf) => format!("{}:{}/{}.{}", self.service, self.plugin, intf, self.method),
            None => format!("{}:{}/{}", self.service, self.plugin, self.method),
        }
    }

    /// Deterministic cache/log key: target plus the JSON form of the params.
    ///
    /// `serde_json` preserves insertion order for the `Value` tree, so two
    /// `CallArgs` constructed from the same inputs always produce the same key.
    #[must_use]
    pub fn cache_key(&self) -> String {
        format!("{}({})", self.target(), self.params_json())
    }

    /// JSON encoding of the parameter list.
    #[must_use]
    pub fn params_json(&self) -> String {
        serde_json::to_string(&self.params).unwrap_or_else(|_| "[]".to_string())
    }
}

/// A memoized outcome of a previously completed call, scoped to the call
/// chain in progress.
///
/// `allowed_service` records the service that issued (and may replay) the
/// call; the `call_*` fields identify the completed call itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultCacheEntry {
    pub allowed_service: Option<ServiceId>,
    pub call_service: ServiceId,
    pub call_plugin: String,
    pub call_intf: Option<String>,
    pub call_method: String,
    pub args_json: String,
    pub result: Value,
}

impl ResultCacheEntry {
    /// True if this entry memoizes exactly the given call.
    #[must_use]
    pub fn matches(&self, args: &CallArgs) -> bool {
        self.call_service == args.service
            && self.call_plugin == args.plugin
            && self.call_intf == args.intf
            && self.call_method == args.method
            && self.args_json == args.params_json()
    }
}

/// The structured payload a component returns for an error its caller is
/// expected to handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: u32,
    pub producer: PluginId,
    pub message: String,
}

impl std::fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {}): {}", self.producer, self.code, self.message)
    }
}

/// A pending host-level action produced by a sandbox during a call chain.
///
/// Actions accumulate in the call context and are surfaced to the host only
/// once the chain fully resolves; they are dropped on reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostAction {
    pub service: ServiceId,
    pub action: String,
    pub payload: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn args() -> CallArgs {
        CallArgs::new(
            ServiceId::new("accounts").unwrap(),
            "plugin",
            Some("api".into()),
            "get-user",
            vec![json!("alice"), json!(7)],
        )
    }

    #[test]
    fn cache_key_is_deterministic() {
        assert_eq!(args().cache_key(), args().cache_key());
        assert_eq!(
            args().cache_key(),
            r#"accounts:plugin/api.get-user(["alice",7])"#
        );
    }

    #[test]
    fn target_without_interface() {
        let mut a = args();
        a.intf = None;
        assert_eq!(a.target(), "accounts:plugin/get-user");
    }

    #[test]
    fn cache_entry_matches_same_call_only() {
        let a = args();
        let entry = ResultCacheEntry {
            allowed_service: None,
            call_service: a.service.clone(),
            call_plugin: a.plugin.clone(),
            call_intf: a.intf.clone(),
            call_method: a.method.clone(),
            args_json: a.params_json(),
            result: json!({"name": "alice"}),
        };
        assert!(entry.matches(&a));

        let mut other = a.clone();
        other.params = vec![json!("bob")];
        assert!(!entry.matches(&other));
    }

    #[test]
    fn call_args_round_trip() {
        let a = args();
        let json = serde_json::to_string(&a).unwrap();
        let back: CallArgs = serde_json::from_str(&json).unwrap();
        assert_eq!(a, back);
    }
}
