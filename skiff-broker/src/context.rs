//! Call context: stack, result cache, and authorization.
//!
//! The authoritative state machine for one active call chain, and the only
//! gate between sandboxes. The frame at the top of the stack identifies the
//! currently privileged caller; only that sandbox's origin may push the
//! next frame or pop the current one. The stack, cache, and accumulated
//! actions are the sole mutable shared state of the runtime, and every
//! mutation is gated by origin validation — that discipline substitutes
//! for a lock, since only one party is ever authorized to mutate at a time.

use skiff_types::{CallArgs, HostAction, Origin, ResultCacheEntry, ServiceId};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};

/// Caller-visible message for out-of-turn call attempts.
pub const UNAUTHORIZED_CALL: &str = "plugins may only call out while they are the active frame";

/// Authorization and state-machine violations in the call context.
///
/// All of these are fatal to the call attempt that raised them: trust, once
/// broken, cannot be locally re-established.
#[derive(Debug, Clone, Error)]
pub enum ContextError {
    #[error("{UNAUTHORIZED_CALL} (expected {expected}, got {actual})")]
    Unauthorized { expected: String, actual: String },

    /// A second, distinct root origin tried to start a chain. Distinct
    /// hosting origins must not share one runtime instance.
    #[error("root origin conflict: runtime is bound to {bound}, caller is {actual}")]
    RootOriginConflict { bound: String, actual: String },

    #[error("no active call chain")]
    Idle,
}

/// One entry on the call stack.
#[derive(Debug, Clone)]
pub struct CallFrame {
    /// Origin that issued this call.
    pub caller: Origin,
    pub args: CallArgs,
    pub started_at: Instant,
}

impl CallFrame {
    /// The address replies and nested calls for this frame must come from.
    #[must_use]
    pub fn expected_address(&self) -> String {
        Origin::sandbox_address(&self.args.service)
    }
}

/// Stack + cache + authorization for one runtime instance.
///
/// The stack and cache live for the duration of one top-level call chain;
/// the root origin is sticky across chains and cleared only by [`reset`].
///
/// [`reset`]: CallContext::reset
#[derive(Debug, Default)]
pub struct CallContext {
    stack: Vec<CallFrame>,
    cache: Vec<ResultCacheEntry>,
    pending_actions: Vec<HostAction>,
    root_origin: Option<Origin>,
}

impl CallContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.stack.is_empty()
    }

    /// The currently executing frame, if any.
    #[must_use]
    pub fn peek(&self) -> Option<&CallFrame> {
        self.stack.last()
    }

    /// The root origin bound to this runtime instance, once fixed.
    #[must_use]
    pub fn root_origin(&self) -> Option<&Origin> {
        self.root_origin.as_ref()
    }

    /// Pushes a new frame after validating the caller.
    ///
    /// Idle: the caller becomes (or must match) the root origin. Active:
    /// the caller must be the sandbox owning the current top frame.
    /// On failure the stack is untouched.
    pub fn push_call(&mut self, caller: &Origin, args: CallArgs) -> Result<(), ContextError> {
        match self.stack.last() {
            None => match &self.root_origin {
                None => {
                    debug!(root = %caller.address, "Binding root origin");
                    self.root_origin = Some(caller.clone());
                }
                Some(root) if root.address == caller.address => {}
                Some(root) => {
                    return Err(ContextError::RootOriginConflict {
                        bound: root.address.clone(),
                        actual: caller.address.clone(),
                    });
                }
            },
            Some(top) => {
                let expected = top.expected_address();
                if caller.address != expected {
                    warn!(
                        expected = %expected,
                        actual = %caller.address,
                        target = %args.target(),
                        "Rejected out-of-turn call"
                    );
                    return Err(ContextError::Unauthorized {
                        expected,
                        actual: caller.address.clone(),
                    });
                }
            }
        }

        debug!(target = %args.target(), depth = self.stack.len() + 1, "Call pushed");
        self.stack.push(CallFrame {
            caller: caller.clone(),
            args,
            started_at: Instant::now(),
        });
        Ok(())
    }

    /// Pops the top frame after validating that `origin` is the sandbox
    /// that executed it. Emptying the stack resolves the chain and discards
    /// the result cache.
    pub fn pop_call(&mut self, origin: &Origin) -> Result<CallFrame, ContextError> {
        let top = self.stack.last().ok_or(ContextError::Idle)?;
        let expected = top.expected_address();
        if origin.address != expected {
            return Err(ContextError::Unauthorized {
                expected,
                actual: origin.address.clone(),
            });
        }

        let frame = self.stack.pop().ok_or(ContextError::Idle)?;
        debug!(
            target = %frame.args.target(),
            elapsed_ms = frame.started_at.elapsed().as_millis(),
            depth = self.stack.len(),
            "Call popped"
        );
        if self.stack.is_empty() {
            self.cache.clear();
        }
        Ok(frame)
    }

    /// Memoizes a completed call for the remainder of the current chain.
    pub fn cache_result(&mut self, entry: ResultCacheEntry) {
        self.cache.push(entry);
    }

    /// Cache entries visible to a call targeting `(service, plugin)`,
    /// regardless of which frame issued them.
    #[must_use]
    pub fn cached_results(&self, service: &ServiceId, plugin: &str) -> Vec<ResultCacheEntry> {
        self.cache
            .iter()
            .filter(|e| e.call_service == *service && e.call_plugin == plugin)
            .cloned()
            .collect()
    }

    /// Accumulates host-level actions produced during the chain.
    pub fn add_actions(&mut self, actions: Vec<HostAction>) {
        self.pending_actions.extend(actions);
    }

    /// Drains the accumulated actions. Meaningful only once the chain has
    /// fully resolved.
    pub fn take_actions(&mut self) -> Vec<HostAction> {
        std::mem::take(&mut self.pending_actions)
    }

    /// Unconditionally clears stack, cache, root origin, and accumulated
    /// actions. Callers must treat a reset chain as fully failed, never
    /// partially applied.
    pub fn reset(&mut self) {
        if !self.stack.is_empty() {
            warn!(depth = self.stack.len(), "Resetting call context with live frames");
        }
        self.stack.clear();
        self.cache.clear();
        self.pending_actions.clear();
        self.root_origin = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use skiff_types::PluginId;

    fn svc(name: &str) -> ServiceId {
        ServiceId::new(name).unwrap()
    }

    fn args_for(service: &str) -> CallArgs {
        CallArgs::new(svc(service), "plugin", None, "run", vec![])
    }

    fn host() -> Origin {
        Origin::host("https://app.example")
    }

    fn sandbox(service: &str) -> Origin {
        Origin::for_sandbox(svc(service))
    }

    fn entry_for(service: &str, plugin: &str, result: serde_json::Value) -> ResultCacheEntry {
        ResultCacheEntry {
            allowed_service: None,
            call_service: svc(service),
            call_plugin: plugin.into(),
            call_intf: None,
            call_method: "run".into(),
            args_json: "[]".into(),
            result,
        }
    }

    #[test]
    fn stack_discipline() {
        let mut ctx = CallContext::new();
        assert!(ctx.is_idle());

        ctx.push_call(&host(), args_for("a")).unwrap();
        assert_eq!(ctx.peek().unwrap().args.service, svc("a"));

        ctx.push_call(&sandbox("a"), args_for("b")).unwrap();
        assert_eq!(ctx.peek().unwrap().args.service, svc("b"));
        assert_eq!(ctx.depth(), 2);

        ctx.pop_call(&sandbox("b")).unwrap();
        assert_eq!(ctx.peek().unwrap().args.service, svc("a"));
        ctx.pop_call(&sandbox("a")).unwrap();
        assert!(ctx.is_idle());
    }

    #[test]
    fn out_of_turn_push_rejected_without_mutation() {
        let mut ctx = CallContext::new();
        ctx.push_call(&host(), args_for("a")).unwrap();
        ctx.push_call(&sandbox("a"), args_for("b")).unwrap();

        // Sandbox "c" is not the active frame; it may not push.
        let err = ctx.push_call(&sandbox("c"), args_for("a")).unwrap_err();
        assert!(matches!(err, ContextError::Unauthorized { .. }));
        assert!(err.to_string().contains(UNAUTHORIZED_CALL));
        assert_eq!(ctx.depth(), 2);
        assert_eq!(ctx.peek().unwrap().args.service, svc("b"));

        // The legitimate chain continues unharmed.
        ctx.pop_call(&sandbox("b")).unwrap();
        ctx.pop_call(&sandbox("a")).unwrap();
        assert!(ctx.is_idle());
    }

    #[test]
    fn pop_requires_executing_sandbox() {
        let mut ctx = CallContext::new();
        ctx.push_call(&host(), args_for("a")).unwrap();
        assert!(ctx.pop_call(&sandbox("b")).is_err());
        assert_eq!(ctx.depth(), 1);
    }

    #[test]
    fn pop_on_idle_stack_is_an_error() {
        let mut ctx = CallContext::new();
        assert!(matches!(
            ctx.pop_call(&sandbox("a")),
            Err(ContextError::Idle)
        ));
    }

    #[test]
    fn root_origin_is_sticky() {
        let mut ctx = CallContext::new();
        ctx.push_call(&host(), args_for("a")).unwrap();
        ctx.pop_call(&sandbox("a")).unwrap();

        // Same root again: fine.
        ctx.push_call(&host(), args_for("a")).unwrap();
        ctx.pop_call(&sandbox("a")).unwrap();

        // A different top-level origin fails before any frame is pushed.
        let other = Origin::host("https://evil.example");
        let err = ctx.push_call(&other, args_for("a")).unwrap_err();
        assert!(matches!(err, ContextError::RootOriginConflict { .. }));
        assert!(ctx.is_idle());
    }

    #[test]
    fn cache_scoped_to_target_and_discarded_on_empty() {
        let mut ctx = CallContext::new();
        ctx.push_call(&host(), args_for("a")).unwrap();
        ctx.cache_result(entry_for("b", "plugin", json!(1)));
        ctx.cache_result(entry_for("b", "other", json!(2)));
        ctx.cache_result(entry_for("c", "plugin", json!(3)));

        let visible = ctx.cached_results(&svc("b"), "plugin");
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].result, json!(1));

        // Chain resolves: cache is gone.
        ctx.pop_call(&sandbox("a")).unwrap();
        assert!(ctx.cached_results(&svc("b"), "plugin").is_empty());
    }

    #[test]
    fn cache_discarded_on_reset() {
        let mut ctx = CallContext::new();
        ctx.push_call(&host(), args_for("a")).unwrap();
        ctx.cache_result(entry_for("b", "plugin", json!(1)));
        ctx.add_actions(vec![HostAction {
            service: svc("a"),
            action: "submit".into(),
            payload: json!({}),
        }]);

        ctx.reset();
        assert!(ctx.is_idle());
        assert!(ctx.cached_results(&svc("b"), "plugin").is_empty());
        assert!(ctx.take_actions().is_empty());
        assert!(ctx.root_origin().is_none());
    }

    #[test]
    fn actions_survive_until_taken() {
        let mut ctx = CallContext::new();
        ctx.push_call(&host(), args_for("a")).unwrap();
        ctx.add_actions(vec![HostAction {
            service: svc("a"),
            action: "submit".into(),
            payload: json!({"value": 1}),
        }]);
        ctx.pop_call(&sandbox("a")).unwrap();

        let actions = ctx.take_actions();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action, "submit");
        assert!(ctx.take_actions().is_empty());
    }

    #[test]
    fn nested_plugins_share_a_service_sandbox_identity() {
        // Two plugins under one service authorize under the same address.
        let mut ctx = CallContext::new();
        ctx.push_call(&host(), CallArgs::new(svc("a"), "one", None, "m", vec![]))
            .unwrap();
        ctx.push_call(&sandbox("a"), CallArgs::new(svc("a"), "two", None, "m", vec![]))
            .unwrap();
        assert_eq!(
            ctx.peek().unwrap().args.plugin_id(),
            PluginId::new(svc("a"), "two")
        );
    }
}
