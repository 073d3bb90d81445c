use std::time::{Duration, Instant};

use jsk_vmc_lib::serial::protocol::Command;
use jsk_vmc_lib::serial::sim::{SimEvent, SimScript, SimulatedVmc};
use jsk_vmc_lib::serial::Frame;
use jsk_vmc_lib::vending::AisleRange;
use jsk_vmc_lib::{ControllerConfig, DispenseStatus, LogicalCommand, VendingController};

fn test_config() -> ControllerConfig {
    let mut config = ControllerConfig::default();
    config.aisles = AisleRange::new(1, 20);
    config.protocol.attempt_timeout_ms = 200;
    config.protocol.retry_delay_ms = 10;
    config.protocol.progress_timeout_ms = 1000;
    config.dispatch.reopen_delay_ms = 10;
    config.protocol.sync_with_vmc = false;
    config
}

fn host_commands(vmc: &SimulatedVmc) -> Vec<u8> {
    vmc.events()
        .into_iter()
        .filter_map(|event| match event {
            SimEvent::Command { command, .. } => Some(command),
            _ => None,
        })
        .collect()
}

async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_concurrent_dispenses_never_interleave() {
    let vmc = SimulatedVmc::new(SimScript::default());
    let controller = VendingController::start_with(vmc.clone(), &test_config());

    let mut tasks = Vec::new();
    for aisle in 1..=6u16 {
        let orchestrator = controller.orchestrator().clone();
        tasks.push(tokio::spawn(async move {
            orchestrator.dispense(LogicalCommand::new(aisle)).await
        }));
    }

    let mut transaction_ids = Vec::new();
    for task in tasks {
        let outcome = task.await.unwrap();
        assert!(outcome.success, "unexpected outcome: {:?}", outcome);
        transaction_ids.push(outcome.transaction_id);
    }

    assert_eq!(vmc.command_writes(), 6);
    assert_eq!(vmc.overlapping_writes(), 0, "a command was written mid-session");
    transaction_ids.sort();
    transaction_ids.dedup();
    assert_eq!(transaction_ids.len(), 6);
    assert_eq!(controller.metrics().completed, 6);
}

#[tokio::test]
async fn test_full_queue_rejects_immediately() {
    let vmc = SimulatedVmc::new(SimScript {
        silent: true,
        ..SimScript::default()
    });
    let mut config = test_config();
    config.dispatch.queue_depth = 1;
    config.protocol.max_attempts = 1;
    config.protocol.attempt_timeout_ms = 500;
    let controller = VendingController::start_with(vmc.clone(), &config);

    let first = controller.orchestrator().clone();
    let a = tokio::spawn(async move { first.dispense(LogicalCommand::new(1)).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = controller.orchestrator().clone();
    let b = tokio::spawn(async move { second.dispense(LogicalCommand::new(2)).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    let rejected = controller.orchestrator().dispense(LogicalCommand::new(3)).await;
    assert_eq!(rejected.status, DispenseStatus::ControllerBusy);
    assert!(started.elapsed() < Duration::from_millis(200));

    assert_eq!(a.await.unwrap().status, DispenseStatus::Timeout);
    assert_eq!(b.await.unwrap().status, DispenseStatus::Timeout);
    assert_eq!(vmc.command_writes(), 2);
    assert_eq!(controller.metrics().rejected_busy, 1);
}

#[tokio::test]
async fn test_submission_expires_while_queued() {
    let vmc = SimulatedVmc::new(SimScript {
        silent: true,
        ..SimScript::default()
    });
    let mut config = test_config();
    config.protocol.max_attempts = 1;
    config.protocol.attempt_timeout_ms = 400;
    config.dispatch.submit_timeout_ms = 100;
    let controller = VendingController::start_with(vmc.clone(), &config);

    let first = controller.orchestrator().clone();
    let a = tokio::spawn(async move { first.dispense(LogicalCommand::new(1)).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let waiting = Instant::now();
    let b = controller.orchestrator().dispense(LogicalCommand::new(2)).await;
    assert_eq!(b.status, DispenseStatus::ControllerBusy);
    let waited = waiting.elapsed();
    assert!(waited >= Duration::from_millis(90), "released early after {:?}", waited);
    assert!(waited < Duration::from_millis(300), "held past its deadline for {:?}", waited);
    assert_eq!(a.await.unwrap().status, DispenseStatus::Timeout);

    assert!(wait_for(|| controller.metrics().expired_in_queue == 1).await);
    assert_eq!(vmc.command_writes(), 1);
}

#[tokio::test]
async fn test_write_fault_reopens_transport() {
    // No polls, so the only writes are the host's own commands
    let vmc = SimulatedVmc::new(SimScript {
        fail_writes: true,
        poll_interval: None,
        ..SimScript::default()
    });
    let mut config = test_config();
    config.protocol.wait_for_poll = false;
    let controller = VendingController::start_with(vmc.clone(), &config);
    assert_eq!(vmc.connects(), 1);

    let outcome = controller.orchestrator().dispense(LogicalCommand::new(1)).await;
    assert_eq!(outcome.status, DispenseStatus::TransportError);
    assert_eq!(outcome.attempts, 1, "transport faults are not retried");

    assert!(wait_for(|| vmc.connects() == 2).await, "transport was not reopened");
    let health = controller.health_report();
    assert!(health.transport_open);
    assert!(health.last_error.is_some());

    vmc.update_script(|s| s.fail_writes = false);
    let outcome = controller.orchestrator().dispense(LogicalCommand::new(1)).await;
    assert!(outcome.success);
}

#[tokio::test]
async fn test_unavailable_port_recovers_on_next_request() {
    let vmc = SimulatedVmc::new(SimScript {
        unavailable: true,
        ..SimScript::default()
    });
    let controller = VendingController::start_with(vmc.clone(), &test_config());

    let health = controller.health_report();
    assert!(!health.transport_open);
    assert_eq!(health.port, "sim://jsk");
    assert!(health.last_error.unwrap().contains("simulated device absent"));

    let outcome = controller.orchestrator().dispense(LogicalCommand::new(1)).await;
    assert_eq!(outcome.status, DispenseStatus::TransportError);
    assert_eq!(vmc.command_writes(), 0);
    assert_eq!(controller.metrics().reopen_attempts, 3);

    vmc.update_script(|s| s.unavailable = false);
    let outcome = controller.orchestrator().dispense(LogicalCommand::new(1)).await;
    assert!(outcome.success);
    assert!(controller.health_report().transport_open);
}

#[tokio::test]
async fn test_shutdown_closes_transport() {
    let vmc = SimulatedVmc::new(SimScript::default());
    let controller = VendingController::start_with(vmc.clone(), &test_config());
    assert!(controller.health_report().transport_open);

    controller.shutdown().await;
    assert!(!controller.health_report().transport_open);

    let outcome = controller.orchestrator().dispense(LogicalCommand::new(1)).await;
    assert_eq!(outcome.status, DispenseStatus::TransportError);
    assert_eq!(vmc.command_writes(), 0);
}

#[tokio::test]
async fn test_metrics_track_latency() {
    let vmc = SimulatedVmc::new(SimScript::default());
    let controller = VendingController::start_with(vmc, &test_config());

    for aisle in [1u16, 2, 3] {
        assert!(controller.orchestrator().dispense(LogicalCommand::new(aisle)).await.success);
    }

    let metrics = controller.metrics();
    assert_eq!(metrics.submitted, 3);
    assert_eq!(metrics.completed, 3);
    assert_eq!(metrics.session_latency_samples, 3);
    assert!(metrics.session_min_latency_ms <= metrics.session_max_latency_ms);
    assert!(metrics.session_avg_latency_ms.is_some());
}

#[tokio::test]
async fn test_shutdown_answers_queued_submissions() {
    let vmc = SimulatedVmc::new(SimScript {
        silent: true,
        ..SimScript::default()
    });
    let mut config = test_config();
    config.dispatch.queue_depth = 1;
    config.protocol.max_attempts = 1;
    config.protocol.attempt_timeout_ms = 400;
    let controller = VendingController::start_with(vmc.clone(), &config);

    let first = controller.orchestrator().clone();
    let a = tokio::spawn(async move { first.dispense(LogicalCommand::new(1)).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = controller.orchestrator().clone();
    let b = tokio::spawn(async move { second.dispense(LogicalCommand::new(2)).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    controller.shutdown().await;

    assert_eq!(a.await.unwrap().status, DispenseStatus::Timeout);
    let b = b.await.unwrap();
    assert_eq!(b.status, DispenseStatus::TransportError);
    assert!(b.message.contains("shutting down"), "unexpected message: {}", b.message);
    assert_eq!(vmc.command_writes(), 1, "a queued dispense ran after shutdown");
    assert!(!controller.health_report().transport_open);
}

#[tokio::test]
async fn test_idle_polls_are_acknowledged() {
    let vmc = SimulatedVmc::new(SimScript::default());
    let controller = VendingController::start_with(vmc.clone(), &test_config());

    assert!(wait_for(|| vmc.host_acks() >= 3).await, "idle polls went unanswered");
    assert_eq!(vmc.command_writes(), 0);
    assert!(controller.orchestrator().dispense(LogicalCommand::new(1)).await.success);
    assert_eq!(vmc.overlapping_writes(), 0);
}

#[tokio::test]
async fn test_sync_sent_when_transport_opens() {
    let vmc = SimulatedVmc::new(SimScript::default());
    let mut config = test_config();
    config.protocol.sync_with_vmc = true;
    let controller = VendingController::start_with(vmc.clone(), &config);

    assert!(wait_for(|| vmc.command_writes() == 1).await, "no sync after open");
    assert_eq!(host_commands(&vmc), vec![Command::RequestSync.code()]);

    assert!(controller.orchestrator().dispense(LogicalCommand::new(2)).await.success);
    assert_eq!(host_commands(&vmc), vec![Command::RequestSync.code(), Command::SelectBuy.code()]);
}

#[tokio::test]
async fn test_vmc_sync_request_is_answered() {
    let vmc = SimulatedVmc::new(SimScript::default());
    let mut config = test_config();
    config.protocol.sync_with_vmc = true;
    let _controller = VendingController::start_with(vmc.clone(), &config);
    assert!(wait_for(|| vmc.command_writes() == 1).await);

    let acks_before = vmc.host_acks();
    vmc.inject(&Frame::new(Command::RequestSync.code(), Vec::new())).unwrap();

    assert!(wait_for(|| vmc.command_writes() == 2).await, "VMC sync request went unanswered");
    assert_eq!(host_commands(&vmc), vec![Command::RequestSync.code(); 2]);
    assert!(vmc.host_acks() > acks_before);
}
