//! Error taxonomy for failures surfacing out of a sandbox call.
//!
//! Every failure crossing a sandbox boundary is classified into exactly one
//! kind, and every kind maps to exactly one [`ErrorType`]. Recoverable
//! errors are handed back to the calling component as an error-shaped
//! return value; unrecoverable errors terminate the whole call chain and
//! the terminal reply goes to the original root caller.

use skiff_types::{CallOutcome, CallReply, ErrorPayload, ErrorType, PluginId};
use thiserror::Error;
use uuid::Uuid;

/// A classified call failure.
///
/// The variants are inspected in declaration order when classifying a raw
/// wasmtime error; anything matching none of the structural predicates
/// falls through to [`CallError::Unknown`] with the original message
/// preserved.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    /// Argument marshalling failed while destructuring the call payload.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// The component returned a structured error value for its caller.
    #[error("component error: {0}")]
    ComponentError(ErrorPayload),

    /// The component trapped (canonical `unreachable`).
    #[error("runtime panic in {plugin}: {message}")]
    Trap { plugin: PluginId, message: String },

    /// A structured parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// The component bytes for a plugin could not be fetched.
    #[error("failed to download plugin {plugin}: {message}")]
    PluginDownload { plugin: PluginId, message: String },

    /// A baseline system-interface shim could not be wired.
    #[error("failed to load host shims: {0}")]
    ShimDownload(String),

    /// The component bytecode failed to transpile.
    #[error("transpilation failed: {0}")]
    Transpile(String),

    /// The component loaded but failed a structural validity check.
    #[error("invalid plugin {plugin}: {message}")]
    InvalidPlugin { plugin: PluginId, message: String },

    /// Anything else; the original message is preserved.
    #[error("{0}")]
    Unknown(String),
}

impl CallError {
    /// Whether this failure is returned to the calling component as data
    /// or terminates the whole call chain.
    #[must_use]
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::ComponentError(_) => ErrorType::Recoverable,
            Self::Deserialization(_)
            | Self::Trap { .. }
            | Self::Parse(_)
            | Self::PluginDownload { .. }
            | Self::ShimDownload(_)
            | Self::Transpile(_)
            | Self::InvalidPlugin { .. }
            | Self::Unknown(_) => ErrorType::Unrecoverable,
        }
    }

    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        self.error_type() == ErrorType::Recoverable
    }

    /// The structured payload, for recoverable errors.
    #[must_use]
    pub fn payload(&self) -> Option<&ErrorPayload> {
        match self {
            Self::ComponentError(p) => Some(p),
            _ => None,
        }
    }

    /// Classifies a raw wasmtime error raised while executing an export of
    /// `plugin`.
    ///
    /// Structural kinds (download, transpile, invalid plugin) are
    /// constructed directly at their source and never go through here; this
    /// only distinguishes marshalling failures, traps, and the unknown
    /// fallthrough.
    pub fn classify_wasm(plugin: &PluginId, err: &anyhow::Error) -> Self {
        let message = format!("{err:#}");
        if message.contains("destructur") || message.contains("expected a string") {
            return Self::Deserialization(message);
        }
        if let Some(trap) = err.downcast_ref::<wasmtime::Trap>() {
            return Self::Trap {
                plugin: plugin.clone(),
                message: trap.to_string(),
            };
        }
        Self::Unknown(message)
    }
}

/// Builds the single reply correlated to one outstanding request.
///
/// Success and recoverable errors become normal (possibly error-shaped)
/// return values; unrecoverable errors become the terminal outcome for the
/// whole chain.
#[must_use]
pub fn build_reply(
    id: Uuid,
    args: skiff_types::CallArgs,
    result: Result<serde_json::Value, CallError>,
) -> CallReply {
    let outcome = match result {
        Ok(value) => CallOutcome::Ok { value },
        Err(CallError::ComponentError(error)) => CallOutcome::Recoverable { error },
        Err(err) => CallOutcome::Unrecoverable {
            message: err.to_string(),
        },
    };
    CallReply { id, args, outcome }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_types::{CallArgs, ServiceId};

    fn plugin() -> PluginId {
        PluginId::new(ServiceId::new("accounts").unwrap(), "plugin")
    }

    fn payload() -> ErrorPayload {
        ErrorPayload {
            code: 7,
            producer: plugin(),
            message: "no such user".into(),
        }
    }

    fn all_kinds() -> Vec<CallError> {
        vec![
            CallError::Deserialization("bad shape".into()),
            CallError::ComponentError(payload()),
            CallError::Trap {
                plugin: plugin(),
                message: "wasm trap: wasm `unreachable` instruction executed".into(),
            },
            CallError::Parse("bad wit".into()),
            CallError::PluginDownload {
                plugin: plugin(),
                message: "404".into(),
            },
            CallError::ShimDownload("wasi shim missing".into()),
            CallError::Transpile("invalid component".into()),
            CallError::InvalidPlugin {
                plugin: plugin(),
                message: "no callable exports".into(),
            },
            CallError::Unknown("something else".into()),
        ]
    }

    #[test]
    fn every_kind_maps_to_exactly_one_error_type() {
        let kinds = all_kinds();
        assert_eq!(kinds.len(), 9);
        for err in &kinds {
            let recoverable = matches!(err, CallError::ComponentError(_));
            assert_eq!(
                err.error_type(),
                if recoverable {
                    ErrorType::Recoverable
                } else {
                    ErrorType::Unrecoverable
                },
                "wrong classification for {err}"
            );
        }
    }

    #[test]
    fn only_component_errors_carry_a_payload() {
        for err in all_kinds() {
            assert_eq!(err.payload().is_some(), err.is_recoverable());
        }
    }

    #[test]
    fn unmatched_errors_fall_through_to_unknown() {
        let raw = anyhow::anyhow!("some entirely novel failure mode");
        let classified = CallError::classify_wasm(&plugin(), &raw);
        match classified {
            CallError::Unknown(msg) => assert!(msg.contains("novel failure mode")),
            other => panic!("expected Unknown, got {other}"),
        }
    }

    #[test]
    fn destructure_messages_classify_as_deserialization() {
        let raw = anyhow::anyhow!("cannot destructure call arguments");
        assert!(matches!(
            CallError::classify_wasm(&plugin(), &raw),
            CallError::Deserialization(_)
        ));
    }

    #[test]
    fn reply_builder_shapes() {
        let args = CallArgs::new(ServiceId::new("a").unwrap(), "p", None, "m", vec![]);
        let id = Uuid::new_v4();

        let ok = build_reply(id, args.clone(), Ok(serde_json::json!(42)));
        assert!(matches!(ok.outcome, CallOutcome::Ok { .. }));

        let rec = build_reply(id, args.clone(), Err(CallError::ComponentError(payload())));
        assert_eq!(rec.outcome.error_type(), Some(ErrorType::Recoverable));

        let fatal = build_reply(id, args, Err(CallError::Transpile("bad".into())));
        assert_eq!(fatal.outcome.error_type(), Some(ErrorType::Unrecoverable));
    }
}
