//! Core type definitions for the Skiff plugin call runtime.
//!
//! This crate defines the fundamental, plugin-agnostic types shared by the
//! broker and its capability shims:
//! - Service and plugin identifiers
//! - Fully-qualified function call arguments (the wire payload and cache key)
//! - Call origination data and wire message shapes
//! - The structured error payload components return to their callers
//!
//! Everything domain-specific (what a given plugin's methods mean) belongs to
//! the plugins themselves, not here.

mod call;
mod ids;
mod message;

pub use call::{CallArgs, ErrorPayload, HostAction, ResultCacheEntry};
pub use ids::{Origin, PluginId, ServiceId};
pub use message::{CallOutcome, CallReply, CallRequest, ErrorType, InboundMessage, MessageSource};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid service id: {0:?}")]
    InvalidServiceId(String),
}
