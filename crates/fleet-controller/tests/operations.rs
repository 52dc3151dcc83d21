//! Drift reports, gateway attachment and admin operations.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use uuid::Uuid;

use common::{config, eventually, fleet, fleet_with, provision, server, FakeInstance};
use fleet_controller::FleetError;
use fleet_core::FleetEvent;
use fleet_gateway::UNREACHABLE_REASON;
use fleet_instance::InstanceError;

#[tokio::test]
async fn mismatch_is_empty_for_fresh_server_and_names_changed_field() {
    let fleet = fleet();
    let config = server(7000, false);
    provision(&fleet, &config).await;
    let fake = FakeInstance::install(&fleet, config.id, 0);
    fake.hosting.store(true, Ordering::SeqCst);

    let mismatches = fleet.controller.get_mismatch(config.id, &config).await.unwrap();
    assert!(mismatches.is_empty(), "{mismatches:?}");

    let mut declared = config.clone();
    declared.plan.ram_mb = 1024;
    let mismatches = fleet.controller.get_mismatch(config.id, &declared).await.unwrap();
    assert_eq!(mismatches.len(), 1);
    assert_eq!(mismatches[0].field, "plan.ram_mb");
    assert_eq!(mismatches[0].expected, "1024");
}

#[tokio::test]
async fn mismatch_reports_running_server_that_is_not_hosting() {
    let fleet = fleet();
    let config = server(7000, false);
    provision(&fleet, &config).await;
    FakeInstance::install(&fleet, config.id, 0);

    let mismatches = fleet.controller.get_mismatch(config.id, &config).await.unwrap();
    assert_eq!(mismatches.len(), 1);
    assert_eq!(mismatches[0].field, "running");
}

#[tokio::test]
async fn mismatch_without_reachable_instance_compares_config_only() {
    let mut cfg = config();
    cfg.gateway.retry_delay = Duration::from_secs(3600);
    let fleet = fleet_with(cfg);
    let config = server(7000, false);
    provision(&fleet, &config).await;
    fleet.transport.set_unreachable(config.id, true);

    let mismatches = fleet.controller.get_mismatch(config.id, &config).await.unwrap();
    assert!(mismatches.is_empty(), "{mismatches:?}");
}

#[tokio::test]
async fn attach_all_connects_each_running_server_once() {
    let fleet = fleet();
    let a = server(7000, false);
    let b = server(7001, false);
    provision(&fleet, &a).await;
    provision(&fleet, &b).await;
    let stopped = fleet.controller.instances().get(b.id).await.unwrap().container_id;
    fleet.engine.kill(&stopped);

    assert_eq!(fleet.controller.attach_all().await.unwrap(), 1);
    assert_eq!(fleet.controller.gateway().connected(), vec![a.id]);
    assert_eq!(fleet.controller.attach_all().await.unwrap(), 0);
}

#[tokio::test]
async fn unreachable_server_is_removed_and_reported() {
    let mut cfg = config();
    cfg.gateway.idle_timeout = Duration::from_millis(20);
    let fleet = fleet_with(cfg);
    let config = server(7000, false);
    provision(&fleet, &config).await;
    fleet.transport.set_unreachable(config.id, true);

    fleet.controller.attach_all().await.unwrap();
    eventually(|| fleet.engine.container_ids().is_empty()).await;

    assert!(fleet.controller.gateway().connected().is_empty());
    let seen = fleet.seen.lock().unwrap();
    assert!(seen.iter().any(|e| matches!(
        e,
        FleetEvent::Stop(stop) if stop.server_id == config.id && stop.reason == UNREACHABLE_REASON
    )));
}

#[tokio::test]
async fn attach_all_rebinds_after_the_container_is_replaced() {
    let fleet = fleet();
    let config = server(7000, false);
    provision(&fleet, &config).await;
    assert_eq!(fleet.controller.attach_all().await.unwrap(), 1);

    provision(&fleet, &config).await;
    let current = fleet.controller.instances().get(config.id).await.unwrap().container_id;
    assert_eq!(fleet.controller.attach_all().await.unwrap(), 1);
    assert_eq!(fleet.controller.gateway().container_of(config.id), Some(current));
    assert_eq!(fleet.controller.attach_all().await.unwrap(), 0);
}

#[tokio::test]
async fn stale_connection_ending_spares_the_new_container() {
    let fleet = fleet();
    let config = server(7000, false);
    provision(&fleet, &config).await;
    let old = fleet.controller.instances().get(config.id).await.unwrap().container_id;
    fleet.controller.attach_all().await.unwrap();
    assert_eq!(fleet.controller.gateway().container_of(config.id), Some(old.clone()));

    // Same identity, new container; the connection still points at the old one.
    provision(&fleet, &config).await;
    let new = fleet.controller.instances().get(config.id).await.unwrap().container_id;
    assert_ne!(old, new);

    fleet.transport.close_events(config.id);
    eventually(|| {
        fleet.seen.lock().unwrap().iter().any(|e| {
            matches!(e, FleetEvent::Stop(stop) if stop.server_id == config.id
                && stop.reason == UNREACHABLE_REASON)
        })
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(fleet.engine.container_ids(), vec![new.clone()]);
    let state = fleet.controller.instances().get(config.id).await.unwrap();
    assert_eq!(state.container_id, new);
    assert!(state.running);
}

#[tokio::test]
async fn operations_on_unknown_server_are_not_found() {
    let fleet = fleet();
    let ghost = Uuid::new_v4();

    let err = fleet.controller.state(ghost).await.unwrap_err();
    assert!(matches!(err, FleetError::Instance(InstanceError::NotFound(id)) if id == ghost));
    assert!(matches!(
        fleet.controller.say(ghost, "anyone there?").await,
        Err(FleetError::Instance(InstanceError::NotFound(_)))
    ));
    assert!(matches!(
        fleet.controller.image(ghost).await,
        Err(FleetError::Instance(InstanceError::NotFound(_)))
    ));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(fleet.controller.gateway().connected().is_empty());
    assert!(fleet.transport.calls(ghost).is_empty());
    assert_eq!(fleet.transport.subscriptions(ghost), 0);
    assert!(!fleet.seen.lock().unwrap().iter().any(|e| matches!(e, FleetEvent::Stop(_))));
}

#[tokio::test]
async fn remove_tears_down_connection_and_container() {
    let fleet = fleet();
    let config = server(7000, false);
    provision(&fleet, &config).await;
    fleet.controller.attach_all().await.unwrap();

    fleet.controller.remove(config.id).await.unwrap();
    assert!(fleet.controller.gateway().connected().is_empty());
    assert!(fleet.engine.container_ids().is_empty());

    let err = fleet.controller.remove(config.id).await.unwrap_err();
    assert!(matches!(err, FleetError::Instance(InstanceError::NotFound(_))));
}

#[tokio::test]
async fn admin_operations_reach_the_instance() {
    let fleet = fleet();
    let config = server(7000, false);
    provision(&fleet, &config).await;
    let fake = FakeInstance::install(&fleet, config.id, 0);
    fake.players.store(4, Ordering::SeqCst);

    assert_eq!(fleet.controller.state(config.id).await.unwrap().players, 4);
    fleet.controller.say(config.id, "restart in 5 minutes").await.unwrap();
    fleet.controller.pause(config.id).await.unwrap();
    fleet
        .controller
        .send_commands(config.id, &["gameover".to_string()])
        .await
        .unwrap();

    let err = fleet.controller.workflows(config.id).await.unwrap_err();
    assert!(matches!(err, FleetError::Gateway(_)));

    let calls = fleet.transport.calls(config.id);
    assert_eq!(
        calls,
        vec!["GET /state", "POST /say", "POST /pause", "POST /commands", "GET /workflow"]
    );
}
