//! The call broker.
//!
//! Owns the sandbox registry, the call context, and the single event
//! channel every sandbox reports into. A top-level call drives one event
//! loop iteration per sandbox message until the root request resolves;
//! nested calls, caller queries, and host actions are validated against
//! the call context before anything touches a sandbox.
//!
//! Exactly one terminal reply reaches the root caller per chain. A
//! recoverable failure travels back up as an error-shaped return value; an
//! unrecoverable failure resets the context, drops every in-flight nested
//! reply (trapping the components blocked on them), and terminates the
//! chain with a single unrecoverable reply.

use crate::context::{CallContext, ContextError, UNAUTHORIZED_CALL};
use crate::error::CallError;
use crate::loader::ComponentLoader;
use crate::registry::SandboxRegistry;
use crate::sandbox::{BrokerEvent, ResourceLimits};
use skiff_storage::KvBackend;
use skiff_types::{
    CallArgs, CallOutcome, CallReply, CallRequest, ErrorPayload, HostAction, InboundMessage,
    MessageSource, Origin, PluginId, ResultCacheEntry, ServiceId,
};
use std::collections::HashMap;
use std::sync::{mpsc as std_mpsc, Arc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What is waiting on an outstanding request.
enum Pending {
    /// The top-level caller; resolving this ends the chain.
    Root { args: CallArgs },
    /// A component blocked inside its sandbox thread.
    Nested { reply: std_mpsc::Sender<CallReply> },
}

pub struct Supervisor {
    registry: SandboxRegistry,
    context: CallContext,
    events_rx: mpsc::UnboundedReceiver<BrokerEvent>,
    pending: HashMap<Uuid, Pending>,
}

impl Supervisor {
    pub fn new(loader: Arc<ComponentLoader>, storage: Arc<KvBackend>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            registry: SandboxRegistry::new(loader, storage, events_tx),
            context: CallContext::new(),
            events_rx,
            pending: HashMap::new(),
        }
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.registry = self.registry.with_limits(limits);
        self
    }

    /// Whether an inbound top-level call may start a chain: it must come
    /// from the host itself, not from a sandbox.
    #[must_use]
    pub fn is_trusted_root(message: &InboundMessage) -> bool {
        matches!(
            message.source,
            MessageSource::HostWindow | MessageSource::HostParent
        )
    }

    /// Admission predicate for messages claiming sandbox origin.
    #[must_use]
    pub fn admit(&self, message: &InboundMessage) -> bool {
        self.registry.admit(message)
    }

    /// Spawns sandboxes and compiles plugins ahead of first use.
    pub async fn preload(
        &mut self,
        plugins: &[PluginId],
    ) -> Vec<(PluginId, Result<(), CallError>)> {
        self.registry.preload(plugins).await
    }

    /// Runs one top-level call to completion and returns its terminal
    /// reply. Drives the event loop until the root request resolves.
    pub async fn function_call(&mut self, caller: Origin, args: CallArgs) -> CallReply {
        let request = CallRequest::new(caller.clone(), args.clone(), Vec::new());
        let id = request.id;
        info!(target = %args.target(), caller = %caller.address, "Chain started");

        if let Err(e) = self.context.push_call(&caller, args.clone()) {
            return CallReply {
                id,
                args,
                outcome: CallOutcome::Unrecoverable {
                    message: e.to_string(),
                },
            };
        }

        self.pending.insert(id, Pending::Root { args: args.clone() });
        if let Err(e) = self.dispatch(request).await {
            let service = args.service.clone();
            if let Some(reply) = self.abort_frame(&service, &e) {
                return reply;
            }
        }

        loop {
            let Some(event) = self.events_rx.recv().await else {
                // All sandbox threads are gone; nothing can resolve this.
                self.context.reset();
                self.pending.clear();
                return CallReply {
                    id,
                    args,
                    outcome: CallOutcome::Unrecoverable {
                        message: "all sandboxes terminated".into(),
                    },
                };
            };
            if let Some(reply) = self.handle_event(event).await {
                info!(
                    target = %reply.args.target(),
                    error = ?reply.outcome.error_type(),
                    "Chain resolved"
                );
                return reply;
            }
        }
    }

    /// Drains host-level actions accumulated by the last resolved chain.
    pub fn take_actions(&mut self) -> Vec<HostAction> {
        self.context.take_actions()
    }

    /// Clears all chain state and abandons every in-flight request.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.context.reset();
    }

    pub fn shutdown(&mut self) {
        self.reset();
        self.registry.shutdown_all();
    }

    /// Fills the result-cache snapshot for the target and hands the
    /// request to its sandbox.
    async fn dispatch(&mut self, mut request: CallRequest) -> Result<(), CallError> {
        request.result_cache = self
            .context
            .cached_results(&request.args.service, &request.args.plugin);
        let handle = self.registry.get_or_spawn(&request.args.service).await?;
        handle.call(request)
    }

    /// Processes one sandbox event; returns the terminal reply once the
    /// root request resolves.
    async fn handle_event(&mut self, event: BrokerEvent) -> Option<CallReply> {
        match event {
            BrokerEvent::Resolved(reply) => self.on_resolved(reply),
            BrokerEvent::NestedCall { request, reply } => {
                self.on_nested(request, reply).await
            }
            BrokerEvent::GetCaller { service, reply } => {
                let _ = reply.send(self.caller_of(&service));
                None
            }
            BrokerEvent::AddActions {
                service,
                actions,
                reply,
            } => {
                let result = match self.active_frame_check(&service) {
                    Ok(()) => {
                        self.context.add_actions(actions);
                        Ok(())
                    }
                    Err(message) => Err(message),
                };
                let _ = reply.send(result);
                None
            }
        }
    }

    fn on_resolved(&mut self, reply: CallReply) -> Option<CallReply> {
        let Some(pending) = self.pending.remove(&reply.id) else {
            // A sandbox finished a call whose chain was already torn down.
            warn!(id = %reply.id, target = %reply.args.target(), "Dropping stale reply");
            return None;
        };

        let executor = Origin::for_sandbox(reply.args.service.clone());
        let frame = match self.context.pop_call(&executor) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, target = %reply.args.target(), "Reply without matching frame");
                return self.fail_chain(format!("call stack corrupted: {e}"));
            }
        };

        match &reply.outcome {
            CallOutcome::Ok { value } => {
                // The cache is chain-scoped. Popping the root frame emptied
                // the stack and discarded it; the root's own result has no
                // later caller in this chain to serve, so it must not be
                // re-inserted into the now-idle context.
                if !self.context.is_idle() {
                    self.context.cache_result(ResultCacheEntry {
                        allowed_service: frame.caller.service.clone(),
                        call_service: reply.args.service.clone(),
                        call_plugin: reply.args.plugin.clone(),
                        call_intf: reply.args.intf.clone(),
                        call_method: reply.args.method.clone(),
                        args_json: reply.args.params_json(),
                        result: value.clone(),
                    });
                }
            }
            CallOutcome::Recoverable { error } => {
                debug!(target = %reply.args.target(), error = %error, "Recoverable error");
            }
            CallOutcome::Unrecoverable { message } => {
                return self.fail_chain(message.clone());
            }
        }

        match pending {
            Pending::Root { .. } => Some(reply),
            Pending::Nested { reply: nested } => {
                // A dead receiver means the waiting sandbox is gone; the
                // chain above it will fail on its own.
                let _ = nested.send(reply);
                None
            }
        }
    }

    async fn on_nested(
        &mut self,
        request: CallRequest,
        reply: std_mpsc::Sender<CallReply>,
    ) -> Option<CallReply> {
        let args = request.args.clone();

        if !self.registry.is_known_address(&request.caller.address) {
            let _ = reply.send(unauthorized_reply(&request, "unknown caller origin"));
            return None;
        }
        // A sandbox thread blocks while its nested call runs, so routing a
        // call back into the calling service would never complete.
        if request.caller.address == Origin::sandbox_address(&args.service) {
            let _ = reply.send(unauthorized_reply(
                &request,
                "a service cannot call back into itself",
            ));
            return None;
        }

        match self.context.push_call(&request.caller, args.clone()) {
            Ok(()) => {}
            Err(e @ ContextError::Unauthorized { .. }) | Err(e @ ContextError::Idle) => {
                // Out-of-turn push: the offender gets an error, the
                // legitimate chain is untouched.
                warn!(caller = %request.caller.address, target = %args.target(), error = %e, "Rejected nested call");
                let _ = reply.send(unauthorized_reply(&request, UNAUTHORIZED_CALL));
                return None;
            }
            Err(e) => {
                return self.fail_chain(e.to_string());
            }
        }

        self.pending.insert(request.id, Pending::Nested { reply });
        if let Err(e) = self.dispatch(request).await {
            let service = args.service.clone();
            return self.abort_frame(&service, &e);
        }
        None
    }

    /// Pops the frame for a dispatch that never reached its sandbox, then
    /// fails the chain.
    fn abort_frame(&mut self, service: &ServiceId, error: &CallError) -> Option<CallReply> {
        let executor = Origin::for_sandbox(service.clone());
        if let Err(e) = self.context.pop_call(&executor) {
            warn!(error = %e, "No frame to abort");
        }
        self.fail_chain(error.to_string())
    }

    /// Tears down the whole chain: resets the context and drops every
    /// pending nested sender, trapping the components blocked on them.
    /// Returns the terminal reply for the root caller, if one is waiting.
    fn fail_chain(&mut self, message: String) -> Option<CallReply> {
        warn!(message = %message, pending = self.pending.len(), "Chain failed");
        let mut root = None;
        for (id, pending) in self.pending.drain() {
            if let Pending::Root { args } = pending {
                root = Some((id, args));
            }
        }
        self.context.reset();
        root.map(|(id, args)| CallReply {
            id,
            args,
            outcome: CallOutcome::Unrecoverable { message },
        })
    }

    fn active_frame_check(&self, service: &ServiceId) -> Result<(), String> {
        match self.context.peek() {
            Some(top) if top.args.service == *service => Ok(()),
            Some(_) | None => Err(UNAUTHORIZED_CALL.to_string()),
        }
    }

    fn caller_of(&self, service: &ServiceId) -> Result<String, String> {
        match self.context.peek() {
            Some(top) if top.args.service == *service => Ok(top.caller.address.clone()),
            Some(_) | None => Err(UNAUTHORIZED_CALL.to_string()),
        }
    }
}

/// A rejected nested call, shaped as a recoverable error so the offender
/// can observe it without disturbing the legitimate chain.
fn unauthorized_reply(request: &CallRequest, message: &str) -> CallReply {
    CallReply {
        id: request.id,
        args: request.args.clone(),
        outcome: CallOutcome::Recoverable {
            error: ErrorPayload {
                code: 0,
                producer: request.args.plugin_id(),
                message: message.to_string(),
            },
        },
    }
}
