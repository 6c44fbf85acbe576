//! Cross-sandbox wire message shapes.
//!
//! A call request carries `{caller, args, result_cache}`; a call reply
//! carries a classified outcome. Every request eventually produces exactly
//! one reply correlated by the request id.

use crate::call::{CallArgs, ErrorPayload, ResultCacheEntry};
use crate::ids::Origin;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Whether a failure is returned to the calling component as data
/// (recoverable) or terminates the whole call chain (unrecoverable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorType {
    Recoverable,
    Unrecoverable,
}

/// One call dispatched into a sandbox, embedding the result-cache snapshot
/// the sandbox may replay from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRequest {
    pub id: Uuid,
    pub caller: Origin,
    pub args: CallArgs,
    pub result_cache: Vec<ResultCacheEntry>,
}

impl CallRequest {
    pub fn new(caller: Origin, args: CallArgs, result_cache: Vec<ResultCacheEntry>) -> Self {
        Self {
            id: Uuid::new_v4(),
            caller,
            args,
            result_cache,
        }
    }
}

/// Terminal outcome of one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CallOutcome {
    /// The call returned a value.
    Ok { value: Value },
    /// The callee returned an error-shaped value its caller may handle.
    Recoverable { error: ErrorPayload },
    /// The chain is dead; the message describes why.
    Unrecoverable { message: String },
}

impl CallOutcome {
    /// The `errorType` discriminant of the wire shape; `None` on success.
    #[must_use]
    pub fn error_type(&self) -> Option<ErrorType> {
        match self {
            Self::Ok { .. } => None,
            Self::Recoverable { .. } => Some(ErrorType::Recoverable),
            Self::Unrecoverable { .. } => Some(ErrorType::Unrecoverable),
        }
    }
}

/// The single reply correlated to one outstanding [`CallRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallReply {
    pub id: Uuid,
    pub args: CallArgs,
    pub outcome: CallOutcome,
}

/// Where an inbound message claims to come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageSource {
    /// The top-level host window itself.
    HostWindow,
    /// The host's direct parent context.
    HostParent,
    /// A sandboxed execution context.
    Sandbox,
}

/// An inbound message before admission: its claimed origin and source.
///
/// The sandbox registry's admission predicate is the sole check applied
/// before a message is handed to the call context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub origin: Origin,
    pub source: MessageSource,
}
