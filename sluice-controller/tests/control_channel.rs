//! Pusher and reconciler against a live admin server over loopback.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sluice_admin::{AdminServer, AdminState};
use sluice_controller::config::{ControlConfig, ReloadConfig};
use sluice_controller::{
    ControllerConfig, CycleOutcome, DynamicUpdatePusher, PushError, Reconciler, ReloadController,
};
use sluice_core::{
    classify, BackendId, BackendSet, ChangeEvent, ConfigurationSnapshot, DesiredState, Diff, Route,
    RoutingTable,
};

fn addr(last: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, last], 8080))
}

fn echo() -> BackendId {
    BackendId::from("echo")
}

fn desired() -> DesiredState {
    let mut state = DesiredState::new();
    state.apply(ChangeEvent::upsert_route(Route::new("foo.com", "/", echo())));
    state.apply(ChangeEvent::endpoints(echo(), vec![addr(1), addr(2)]));
    state
}

async fn spawn_admin(state: &DesiredState) -> (SocketAddr, Arc<AdminState>) {
    let table = Arc::new(RoutingTable::from_snapshot(&state.snapshot(), 0.5));
    let admin = Arc::new(AdminState::new(table));
    let server = AdminServer::bind(SocketAddr::from(([127, 0, 0, 1], 0)), Arc::clone(&admin))
        .await
        .unwrap();
    let local = server.local_addr().unwrap();
    tokio::spawn(server.serve());
    (local, admin)
}

fn control(endpoint: SocketAddr, threshold: usize) -> ControlConfig {
    ControlConfig {
        endpoint,
        timeout_ms: 2_000,
        body_buffer_threshold: threshold,
        retries: 0,
        ..ControlConfig::default()
    }
}

async fn closed_port() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

#[tokio::test]
async fn test_push_updates_live_routing_table() {
    let mut state = desired();
    let (local, admin) = spawn_admin(&state).await;
    let pusher = DynamicUpdatePusher::new(&control(local, 16 * 1024));

    let before = state.snapshot();
    state.apply(ChangeEvent::endpoints(echo(), vec![addr(2), addr(3)]));
    let after = state.snapshot();
    let diff = classify(&before, &after);
    assert!(matches!(diff, Diff::EndpointsOnly { .. }));

    let ack = pusher.push(&diff, &after).await.unwrap();
    assert!(ack.success);

    let table = admin.table();
    assert_eq!(table.backend(&echo()).unwrap().endpoints(), &[addr(2), addr(3)]);
    let selected = table.select("foo.com", "/", None).unwrap().endpoint();
    assert!(selected == addr(2) || selected == addr(3));

    // The connection went back to the pool.
    assert_eq!(pusher.client().idle_connections(), 1);
}

#[tokio::test]
async fn test_large_update_is_staged_and_applied() {
    let mut state = desired();
    let (local, admin) = spawn_admin(&state).await;
    let pusher = DynamicUpdatePusher::new(&control(local, 64));

    let before = state.snapshot();
    let many: Vec<SocketAddr> = (1..=200).map(|i| SocketAddr::from(([10, 1, 0, i as u8], 9000 + i))).collect();
    state.apply(ChangeEvent::endpoints(echo(), many.clone()));
    let after = state.snapshot();

    pusher.push(&classify(&before, &after), &after).await.unwrap();
    assert_eq!(admin.table().backend(&echo()).unwrap().len(), many.len());
}

#[tokio::test]
async fn test_stale_push_is_rejected_without_retry() {
    let state = desired();
    let (local, admin) = spawn_admin(&state).await;
    let pusher = DynamicUpdatePusher::new(&ControlConfig {
        retries: 3,
        ..control(local, 16 * 1024)
    });

    // A controller that restarted and lost its generation history.
    let diff = Diff::EndpointsOnly { backends: vec![echo()] };
    let snapshot = desired_with_generation_zero();
    let err = pusher.push(&diff, &snapshot).await.unwrap_err();

    assert!(matches!(err, PushError::Status { status: 409, .. }));
    assert!(!err.is_transient());
    assert_eq!(admin.table().backend(&echo()).unwrap().endpoints(), &[addr(1), addr(2)]);
}

/// A snapshot whose `echo` set is older than anything the data plane has.
fn desired_with_generation_zero() -> ConfigurationSnapshot {
    let mut backends = BTreeMap::new();
    backends.insert(echo(), BackendSet::new(0, [addr(9)]));
    ConfigurationSnapshot::new(vec![Route::new("foo.com", "/", echo())], backends).unwrap()
}

#[tokio::test]
async fn test_unreachable_data_plane_is_transient() {
    let state = desired();
    let pusher = DynamicUpdatePusher::new(&control(closed_port().await, 16 * 1024));

    let diff = Diff::EndpointsOnly { backends: vec![echo()] };
    let err = pusher.push(&diff, &state.snapshot()).await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_reconciler_pushes_then_escalates_when_data_plane_is_gone() {
    let dir = tempfile::tempdir().unwrap();
    let reload = ReloadConfig {
        config_path: dir.path().join("proxy.json"),
        test_command: None,
        reload_command: None,
    };
    let mut state = desired();
    let (local, admin) = spawn_admin(&state).await;

    let mut live = Reconciler::new(
        DynamicUpdatePusher::new(&control(local, 16 * 1024)),
        ReloadController::new(&reload),
    );
    assert_eq!(
        live.sync(Arc::new(state.snapshot())).await,
        CycleOutcome::Reloaded { escalated: false }
    );

    state.apply(ChangeEvent::endpoints(echo(), vec![addr(5)]));
    assert_eq!(live.sync(Arc::new(state.snapshot())).await, CycleOutcome::Pushed);
    assert_eq!(admin.table().backend(&echo()).unwrap().endpoints(), &[addr(5)]);

    let mut orphaned = Reconciler::new(
        DynamicUpdatePusher::new(&control(closed_port().await, 16 * 1024)),
        ReloadController::new(&reload),
    )
    .with_retry_interval(Duration::from_millis(10));
    orphaned.sync(Arc::new(state.snapshot())).await;

    state.apply(ChangeEvent::endpoints(echo(), vec![addr(6)]));
    assert_eq!(
        orphaned.sync(Arc::new(state.snapshot())).await,
        CycleOutcome::Reloaded { escalated: true }
    );
    let installed = std::fs::read_to_string(dir.path().join("proxy.json")).unwrap();
    assert!(installed.contains("10.0.0.6:8080"));
}

#[tokio::test]
async fn test_table_built_from_balancer_section_accepts_pushes() {
    let config = ControllerConfig::parse("[balancer]\newma_decay = 0.2\n").unwrap();
    let table = Arc::new(config.balancer.routing_table());
    assert_eq!(table.decay(), 0.2);

    let admin = Arc::new(AdminState::new(table));
    let server = AdminServer::bind(SocketAddr::from(([127, 0, 0, 1], 0)), Arc::clone(&admin))
        .await
        .unwrap();
    let local = server.local_addr().unwrap();
    tokio::spawn(server.serve());

    let state = desired();
    let diff = Diff::EndpointsOnly {
        backends: vec![echo()],
    };
    let pusher = DynamicUpdatePusher::new(&control(local, 16 * 1024));
    assert!(pusher.push(&diff, &state.snapshot()).await.unwrap().success);
    assert_eq!(admin.table().backend(&echo()).unwrap().endpoints(), &[addr(1), addr(2)]);
}
