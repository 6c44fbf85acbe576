//! Integration tests for the broker's public surface: admission, chain
//! failure, and preload behavior, exercised without any compiled plugin
//! artifacts present.

use skiff_broker::*;
use skiff_storage::KvBackend;
use skiff_types::{
    CallArgs, CallOutcome, InboundMessage, MessageSource, Origin, PluginId, ServiceId,
};
use std::sync::Arc;

fn svc(name: &str) -> ServiceId {
    ServiceId::new(name).unwrap()
}

fn broker_over(root: &std::path::Path) -> Supervisor {
    Supervisor::new(
        Arc::new(ComponentLoader::new(Box::new(DirFetcher::new(root)))),
        Arc::new(KvBackend::open_in_memory().unwrap()),
    )
    .with_limits(ResourceLimits::third_party())
}

#[test]
fn only_host_sources_may_start_chains() {
    let from_window = InboundMessage {
        origin: Origin::host("https://app.example"),
        source: MessageSource::HostWindow,
    };
    let from_parent = InboundMessage {
        origin: Origin::host("https://app.example"),
        source: MessageSource::HostParent,
    };
    let from_sandbox = InboundMessage {
        origin: Origin::for_sandbox(svc("accounts")),
        source: MessageSource::Sandbox,
    };

    assert!(Supervisor::is_trusted_root(&from_window));
    assert!(Supervisor::is_trusted_root(&from_parent));
    assert!(!Supervisor::is_trusted_root(&from_sandbox));
}

#[tokio::test]
async fn chain_to_absent_plugin_terminates_unrecoverably() {
    let dir = tempfile::tempdir().unwrap();
    let mut broker = broker_over(dir.path());

    let args = CallArgs::new(svc("accounts"), "plugin", None, "run", vec![]);
    let reply = broker.function_call(Origin::host("https://app.example"), args).await;

    assert!(matches!(reply.outcome, CallOutcome::Unrecoverable { .. }));
    assert!(broker.take_actions().is_empty());
    broker.shutdown();
}

#[tokio::test]
async fn broker_survives_a_failed_chain() {
    let dir = tempfile::tempdir().unwrap();
    let mut broker = broker_over(dir.path());
    let caller = Origin::host("https://app.example");

    let first = broker
        .function_call(
            caller.clone(),
            CallArgs::new(svc("accounts"), "plugin", None, "run", vec![]),
        )
        .await;
    assert!(matches!(first.outcome, CallOutcome::Unrecoverable { .. }));

    // A failed chain resets everything; the next call starts clean.
    let second = broker
        .function_call(
            caller,
            CallArgs::new(svc("tokens"), "plugin", None, "run", vec![]),
        )
        .await;
    assert!(matches!(second.outcome, CallOutcome::Unrecoverable { .. }));
    broker.shutdown();
}

#[tokio::test]
async fn preload_spawns_sandboxes_whose_origins_are_admitted() {
    let dir = tempfile::tempdir().unwrap();
    let mut broker = broker_over(dir.path());

    let plugins = vec![
        PluginId::new(svc("accounts"), "plugin"),
        PluginId::new(svc("tokens"), "plugin"),
    ];
    let results = broker.preload(&plugins).await;
    assert_eq!(results.len(), 2);

    // The artifacts don't exist, but the sandboxes do, and their origins
    // are now admissible.
    for service in ["accounts", "tokens"] {
        let message = InboundMessage {
            origin: Origin::for_sandbox(svc(service)),
            source: MessageSource::Sandbox,
        };
        assert!(broker.admit(&message), "{service} should be admitted");
    }
    let stranger = InboundMessage {
        origin: Origin::for_sandbox(svc("stranger")),
        source: MessageSource::Sandbox,
    };
    assert!(!broker.admit(&stranger));
    broker.shutdown();
}
