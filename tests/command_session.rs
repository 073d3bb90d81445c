use std::time::{Duration, Instant};

use jsk_vmc_lib::serial::protocol::{Command, StatusReport, DISPENSE_IN_PROGRESS, DISPENSE_SUCCESS};
use jsk_vmc_lib::serial::sim::{SimScript, SimulatedVmc};
use jsk_vmc_lib::serial::{
    CommandSession, Frame, FrameCodec, Request, SerialInterface, SessionOutcome, SessionPolicy, SessionState,
};

fn fast_policy() -> SessionPolicy {
    SessionPolicy {
        attempt_timeout: Duration::from_millis(150),
        retry_delay: Duration::from_millis(10),
        progress_timeout: Duration::from_millis(300),
        ..SessionPolicy::default()
    }
}

fn open(vmc: &SimulatedVmc) -> SerialInterface {
    let mut interface = SerialInterface::new(vmc.clone());
    interface.open().unwrap();
    interface
}

#[tokio::test]
async fn test_check_aisle_completes_first_attempt() {
    let vmc = SimulatedVmc::new(SimScript::default());
    let mut interface = open(&vmc);
    let mut session = CommandSession::new("txn_test", Request::CheckAisle { aisle: 3 }, 1);
    assert_eq!(session.state(), SessionState::Created);

    let outcome = session.run(&mut interface, &FrameCodec::default(), &fast_policy()).await;

    assert!(matches!(outcome, SessionOutcome::Completed { attempts: 1, .. }));
    assert_eq!(session.state(), SessionState::Completed);
    assert_eq!(session.attempt_count(), 1);
    assert!(session.deadline().is_some());
}

#[tokio::test]
async fn test_corrupt_reply_is_retried_for_queries() {
    let vmc = SimulatedVmc::new(SimScript {
        corrupt_replies: 1,
        ..SimScript::default()
    });
    let mut interface = open(&vmc);
    let mut session = CommandSession::new("txn_test", Request::CheckAisle { aisle: 3 }, 1);

    let outcome = session.run(&mut interface, &FrameCodec::default(), &fast_policy()).await;

    assert!(matches!(outcome, SessionOutcome::Completed { attempts: 2, .. }));
    assert_eq!(session.corrupt_frames(), 1);
    assert_eq!(vmc.command_writes(), 2);
}

#[tokio::test]
async fn test_silent_vmc_exhausts_attempts() {
    let vmc = SimulatedVmc::new(SimScript {
        silent: true,
        ..SimScript::default()
    });
    let mut interface = open(&vmc);
    let mut session = CommandSession::new("txn_test", Request::Sync, 1);

    let outcome = session.run(&mut interface, &FrameCodec::default(), &fast_policy()).await;

    assert!(matches!(outcome, SessionOutcome::TimedOut { attempts: 3 }));
    assert_eq!(session.state(), SessionState::TimedOut);
    assert_eq!(vmc.command_writes(), 3);
}

#[tokio::test]
async fn test_accepted_dispense_is_never_resent() {
    // VMC acks and reports progress, then goes quiet
    let vmc = SimulatedVmc::new(SimScript {
        dispense_codes: vec![DISPENSE_IN_PROGRESS],
        ..SimScript::default()
    });
    let mut interface = open(&vmc);
    let mut session = CommandSession::new("txn_test", Request::Dispense { aisle: 4, direct: None }, 1);

    let outcome = session.run(&mut interface, &FrameCodec::default(), &fast_policy()).await;

    assert!(matches!(outcome, SessionOutcome::TimedOut { attempts: 1 }));
    assert_eq!(vmc.command_writes(), 1);
}

#[tokio::test]
async fn test_corrupt_result_after_acceptance_keeps_listening() {
    let vmc = SimulatedVmc::new(SimScript {
        corrupt_replies: 1,
        ..SimScript::default()
    });
    let mut interface = open(&vmc);
    let mut session = CommandSession::new("txn_test", Request::Dispense { aisle: 4, direct: None }, 1);

    let outcome = session.run(&mut interface, &FrameCodec::default(), &fast_policy()).await;

    assert!(matches!(outcome, SessionOutcome::TimedOut { attempts: 1 }));
    assert_eq!(session.corrupt_frames(), 1);
    assert_eq!(vmc.command_writes(), 1);
}

#[tokio::test]
async fn test_write_fault_fails_without_retry() {
    let vmc = SimulatedVmc::new(SimScript {
        fail_writes: true,
        ..SimScript::default()
    });
    let mut interface = open(&vmc);
    let mut session = CommandSession::new("txn_test", Request::CheckAisle { aisle: 1 }, 1);

    let outcome = session.run(&mut interface, &FrameCodec::default(), &fast_policy()).await;

    match outcome {
        SessionOutcome::Failed { error, attempts } => {
            assert_eq!(attempts, 1);
            assert!(error.is_device_fault());
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(session.state(), SessionState::Failed);
}

#[tokio::test]
async fn test_closed_transport_fails() {
    let vmc = SimulatedVmc::new(SimScript::default());
    let mut interface = SerialInterface::new(vmc);
    let mut session = CommandSession::new("txn_test", Request::Sync, 1);

    let outcome = session.run(&mut interface, &FrameCodec::default(), &fast_policy()).await;
    assert!(matches!(outcome, SessionOutcome::Failed { attempts: 0, .. }));
}

#[tokio::test]
async fn test_wait_for_poll_holds_writes_until_polled() {
    let policy = SessionPolicy {
        wait_for_poll: true,
        ..fast_policy()
    };

    let quiet = SimulatedVmc::new(SimScript {
        poll_interval: None,
        ..SimScript::default()
    });
    let mut interface = open(&quiet);
    let mut session = CommandSession::new("txn_test", Request::CheckAisle { aisle: 2 }, 1);
    let outcome = session.run(&mut interface, &FrameCodec::default(), &policy).await;
    assert!(matches!(outcome, SessionOutcome::TimedOut { .. }));
    assert_eq!(quiet.command_writes(), 0, "wrote without being polled");

    let polling = SimulatedVmc::new(SimScript {
        poll_interval: Some(Duration::from_millis(20)),
        ..SimScript::default()
    });
    let mut interface = open(&polling);
    let mut session = CommandSession::new("txn_test", Request::CheckAisle { aisle: 2 }, 1);
    let outcome = session.run(&mut interface, &FrameCodec::default(), &policy).await;
    assert!(matches!(outcome, SessionOutcome::Completed { attempts: 1, .. }));
    assert_eq!(polling.command_writes(), 1);
}

#[tokio::test]
async fn test_endless_progress_reports_hit_the_session_bound() {
    let vmc = SimulatedVmc::new(SimScript {
        dispense_codes: vec![],
        progress_interval: Some(Duration::from_millis(100)),
        ..SimScript::default()
    });
    let mut interface = open(&vmc);
    let policy = SessionPolicy {
        progress_timeout: Duration::from_millis(150),
        ..fast_policy()
    };
    let mut session = CommandSession::new("txn_test", Request::Dispense { aisle: 4, direct: None }, 1);

    let started = Instant::now();
    let outcome = session.run(&mut interface, &FrameCodec::default(), &policy).await;

    assert!(matches!(outcome, SessionOutcome::TimedOut { attempts: 1 }));
    assert_eq!(session.state(), SessionState::TimedOut);
    assert!(started.elapsed() < policy.worst_case() + Duration::from_millis(300));
    assert_eq!(vmc.command_writes(), 1);
}

#[tokio::test]
async fn test_report_for_another_comm_number_is_ignored() {
    // The VMC accepts and reports progress; the result is injected by hand
    let vmc = SimulatedVmc::new(SimScript {
        dispense_codes: vec![DISPENSE_IN_PROGRESS],
        ..SimScript::default()
    });
    let mut interface = open(&vmc);
    let mut session = CommandSession::new("txn_test", Request::Dispense { aisle: 4, direct: None }, 7);

    let feeder = vmc.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(80)).await;
        for comm_number in [6u8, 7] {
            let report = StatusReport { comm_number, code: DISPENSE_SUCCESS, aisle: 4 };
            feeder
                .inject(&Frame::new(Command::DispensingStatus.code(), report.to_payload()))
                .unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
    });

    let outcome = session.run(&mut interface, &FrameCodec::default(), &fast_policy()).await;

    match outcome {
        SessionOutcome::Completed { frame, attempts } => {
            assert_eq!(attempts, 1);
            assert_eq!(StatusReport::parse(&frame.payload).unwrap().comm_number, 7);
        }
        other => panic!("expected completion, got {:?}", other),
    }
    assert_eq!(vmc.command_writes(), 1);
}
