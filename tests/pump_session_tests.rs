//! End-to-end session tests against the simulated pump.

use std::sync::Arc;
use std::time::Duration;

use syringe_pump::adapters::{MockConnector, MockPump};
use syringe_pump::pump::{
    Channel, ConnectionState, PumpSession, PumpState, SessionOptions, StrokeOutcome,
};
use syringe_pump::PumpError;

fn fast_options() -> SessionOptions {
    SessionOptions {
        poll_interval: Duration::from_millis(1),
        stop_settle: Duration::from_millis(1),
        ..SessionOptions::default()
    }
}

fn session_for(pump: &MockPump) -> Arc<PumpSession> {
    Arc::new(PumpSession::new(
        Arc::new(MockConnector::new(pump.clone())),
        fast_options(),
    ))
}

async fn connected(pump: &MockPump) -> Arc<PumpSession> {
    let session = session_for(pump);
    session.connect("sim").await.unwrap();
    pump.clear_written();
    session
}

fn move_frames(pump: &MockPump) -> Vec<String> {
    pump.written_frames()
        .into_iter()
        .filter(|f| f.contains('S') && f.ends_with("R\r"))
        .collect()
}

/// Poll `condition` until it holds, failing the test after two seconds.
async fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 2s"
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

#[tokio::test]
async fn test_connect_and_disconnect() {
    let pump = MockPump::new();
    let session = session_for(&pump);
    assert_eq!(session.snapshot().to_string(), "Disconnected");

    session.connect("sim").await.unwrap();
    assert!(pump.is_open());
    assert_eq!(session.snapshot().to_string(), "Connected, Ready");

    session.disconnect().await.unwrap();
    assert!(!pump.is_open());
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    assert_eq!(session.pump_state(), PumpState::Uninitialised);
}

#[tokio::test]
async fn test_connect_failure_stays_disconnected() {
    let pump = MockPump::new();
    pump.fail_open(true);
    let session = session_for(&pump);

    let err = session.connect("/dev/ttyMissing").await.unwrap_err();
    assert!(matches!(err, PumpError::Connection { .. }));
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    assert!(pump.written_frames().is_empty());
}

#[tokio::test]
async fn test_initialise_resets_plungers() {
    let pump = MockPump::new().with_busy_polls(3);
    pump.set_positions(400.0, 250.0);
    let session = connected(&pump).await;

    session.initialise().await.unwrap();
    assert_eq!(pump.positions(), (0.0, 0.0));
    assert_eq!(session.pump_state(), PumpState::Ready);
    assert_eq!(pump.written_frames()[0], "aXR\r");
}

#[tokio::test]
async fn test_status_mapping() {
    let pump = MockPump::new();
    let session = connected(&pump).await;

    pump.script_status(b"*NY");
    assert_eq!(session.poll_status().await.unwrap(), PumpState::Busy);
    assert_eq!(session.poll_status().await.unwrap(), PumpState::Busy);
    assert_eq!(session.poll_status().await.unwrap(), PumpState::Ready);
}

#[tokio::test]
async fn test_unknown_status_leaves_state_unchanged() {
    let pump = MockPump::new();
    let session = connected(&pump).await;

    pump.script_status(b"Q");
    let err = session.poll_status().await.unwrap_err();
    assert!(matches!(err, PumpError::Protocol(_)));
    assert_eq!(session.pump_state(), PumpState::Ready);
}

#[tokio::test]
async fn test_poll_while_disconnected_does_no_io() {
    let pump = MockPump::new();
    let session = session_for(&pump);

    assert_eq!(
        session.poll_status().await.unwrap(),
        PumpState::Uninitialised
    );
    assert_eq!(pump.bytes_written(), 0);
}

#[tokio::test]
async fn test_silent_device_times_out() {
    let pump = MockPump::new();
    let session = connected(&pump).await;

    pump.go_silent(true);
    let err = session.poll_status().await.unwrap_err();
    assert!(matches!(err, PumpError::Timeout(_)));
    assert_eq!(session.pump_state(), PumpState::Ready);
}

#[tokio::test]
async fn test_pump_splits_into_syringe_sized_strokes() {
    let pump = MockPump::new();
    let session = connected(&pump).await;
    let mut updates = session.subscribe();

    let report = session
        .pump(Channel::Both, 1200.0, 1000.0, 2500.0, 500.0)
        .await
        .unwrap();

    assert_eq!(report.strokes_planned, 3);
    assert_eq!(report.strokes_completed, 3);
    assert_eq!(report.pumped_volume_ul, 1200.0);
    assert!(!report.cancelled);

    // Full syringes are dumped before the second and third strokes
    assert_eq!(
        move_frames(&pump),
        vec![
            "aBIP1000S30N5OCIP1000S30N5OR\r",
            "aBOM0S12N0OCOM0S12N0OR\r",
            "aBIP1000S30N5OCIP1000S30N5OR\r",
            "aBOM0S12N0OCOM0S12N0OR\r",
            "aBIP400S30N5OCIP400S30N5OR\r",
        ]
    );
    assert_eq!(pump.positions(), (400.0, 400.0));

    assert!(updates.has_changed().unwrap());
    let progress = updates.borrow_and_update().progress.clone().unwrap();
    assert_eq!(progress.pumped_volume_ul, 1200.0);
    assert_eq!(progress.total_volume_ul, 1200.0);
    assert_eq!(progress.fraction_complete(), 1.0);
    assert_eq!(session.pump_state(), PumpState::Ready);
}

#[tokio::test]
async fn test_stroke_dumps_to_waste_when_syringe_cannot_take_it() {
    let pump = MockPump::new();
    pump.set_positions(900.0, 0.0);
    let session = connected(&pump).await;

    // 150 uL is 300 steps; 900 + 300 overflows the 1000-step stroke
    let report = session
        .pump(Channel::A, 150.0, 1000.0, 2500.0, 500.0)
        .await
        .unwrap();
    assert_eq!(report.strokes_completed, 1);

    let frames = pump.written_frames();
    assert_eq!(frames[0], "aBYQP\r");
    let waste = frames.iter().position(|f| f == "aBOM0S12N0OR\r").unwrap();
    let aspirate = frames.iter().position(|f| f == "aBIP300S30N5OR\r").unwrap();
    assert!(waste < aspirate);
    // Only the involved syringe is queried
    assert!(!frames.iter().any(|f| f == "aCYQP\r"));
    assert_eq!(pump.positions(), (300.0, 0.0));
}

#[tokio::test]
async fn test_stroke_that_fits_skips_waste() {
    let pump = MockPump::new();
    pump.set_positions(0.0, 500.0);
    let session = connected(&pump).await;

    session
        .pump(Channel::B, 250.0, 1000.0, 2500.0, 500.0)
        .await
        .unwrap();

    assert_eq!(move_frames(&pump), vec!["aCIP500S30N5OR\r"]);
    assert_eq!(pump.positions(), (0.0, 1000.0));
}

#[tokio::test]
async fn test_single_stroke_rejects_volume_above_capacity() {
    let pump = MockPump::new();
    let session = connected(&pump).await;

    let err = session
        .pump_single_stroke(Channel::A, 600.0, 1000.0, 2500.0, 500.0)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PumpError::VolumeExceedsCapacity {
            volume_ul,
            capacity_ul,
        } if volume_ul == 600.0 && capacity_ul == 500.0
    ));
    assert_eq!(pump.bytes_written(), 0);
}

#[tokio::test]
async fn test_single_stroke_runs_one_move() {
    let pump = MockPump::new();
    let session = connected(&pump).await;

    let outcome = session
        .pump_single_stroke(Channel::A, 100.0, 600.0, 2500.0, 500.0)
        .await
        .unwrap();
    assert_eq!(outcome, StrokeOutcome::Completed);
    assert_eq!(move_frames(&pump), vec!["aBIP200S50N5OR\r"]);
}

#[tokio::test]
async fn test_rate_out_of_range_is_rejected_before_io() {
    let pump = MockPump::new();
    let session = connected(&pump).await;

    // 500 uL at 100 uL/min needs 300 s per stroke
    let err = session
        .pump(Channel::A, 100.0, 100.0, 2500.0, 500.0)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PumpError::RateOutOfRange { seconds_per_stroke, .. } if seconds_per_stroke == 300.0
    ));
    assert!(err.is_validation());
    assert_eq!(pump.bytes_written(), 0);
    assert_eq!(session.pump_state(), PumpState::Ready);
}

#[tokio::test]
async fn test_pump_requires_connection() {
    let pump = MockPump::new();
    let session = session_for(&pump);

    let err = session
        .pump(Channel::A, 100.0, 1000.0, 2500.0, 500.0)
        .await
        .unwrap_err();
    assert!(matches!(err, PumpError::NotConnected));
}

#[tokio::test]
async fn test_dispense_to_waste_empties_both_syringes() {
    let pump = MockPump::new();
    pump.set_positions(700.0, 300.0);
    let session = connected(&pump).await;

    session
        .dispense_to_waste(Channel::Both, 2500.0, 500.0)
        .await
        .unwrap();
    assert_eq!(move_frames(&pump), vec!["aBOM0S12N0OCOM0S12N0OR\r"]);
    assert_eq!(pump.positions(), (0.0, 0.0));
}

#[tokio::test]
async fn test_stop_mid_pump_abandons_remaining_strokes() {
    // Each move keeps the pump busy until killed
    let pump = MockPump::new().with_busy_polls(u32::MAX);
    let session = connected(&pump).await;

    let running = {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            session
                .pump(Channel::A, 1200.0, 1000.0, 2500.0, 500.0)
                .await
        })
    };

    wait_for(|| move_frames(&pump).len() == 1).await;
    assert_eq!(session.pump_state(), PumpState::Busy);

    // A second operation cannot start while the pump runs
    assert!(matches!(
        session.initialise().await,
        Err(PumpError::OperationInProgress)
    ));

    session.stop().await.unwrap();
    let report = running.await.unwrap().unwrap();

    assert!(report.cancelled);
    assert_eq!(report.strokes_completed, 1);
    assert_eq!(report.strokes_planned, 3);
    assert_eq!(move_frames(&pump).len(), 1);

    let frames = pump.written_frames();
    let kill = frames.iter().position(|f| f == "aK\r").unwrap();
    let clear = frames.iter().position(|f| f == "aV\r").unwrap();
    assert!(kill < clear);

    assert_eq!(session.pump_state(), PumpState::Ready);
    assert!(!session.is_stop_requested());
}

#[tokio::test]
async fn test_stop_while_idle_clears_request() {
    let pump = MockPump::new();
    let session = connected(&pump).await;

    session.stop().await.unwrap();
    assert!(!session.is_stop_requested());

    // The next pump is unaffected
    let report = session
        .pump(Channel::A, 100.0, 1000.0, 2500.0, 500.0)
        .await
        .unwrap();
    assert!(!report.cancelled);
    assert_eq!(report.strokes_completed, 1);
}

#[tokio::test]
async fn test_failed_stop_does_not_block_next_pump() {
    let pump = MockPump::new();
    let session = connected(&pump).await;

    pump.go_silent(true);
    let err = session.stop().await.unwrap_err();
    assert!(matches!(err, PumpError::Timeout(_)));
    assert!(!session.is_stop_requested());

    pump.go_silent(false);
    let report = session
        .pump(Channel::A, 100.0, 1000.0, 2500.0, 500.0)
        .await
        .unwrap();
    assert!(!report.cancelled);
    assert_eq!(report.strokes_completed, 1);
    assert_eq!(move_frames(&pump), vec!["aBIP200S30N5OR\r"]);
}

#[tokio::test]
async fn test_stop_during_waste_dump_skips_aspirate() {
    let pump = MockPump::new().with_busy_polls(u32::MAX);
    pump.set_positions(900.0, 0.0);
    let session = connected(&pump).await;

    let running = {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            session
                .pump(Channel::A, 150.0, 1000.0, 2500.0, 500.0)
                .await
        })
    };

    wait_for(|| move_frames(&pump).len() == 1).await;
    session.stop().await.unwrap();
    let report = running.await.unwrap().unwrap();

    assert!(report.cancelled);
    assert_eq!(report.strokes_completed, 0);
    assert_eq!(report.pumped_volume_ul, 0.0);
    assert_eq!(move_frames(&pump), vec!["aBOM0S12N0OR\r"]);
    assert_eq!(pump.positions(), (0.0, 0.0));
    assert!(!session.is_stop_requested());
}

#[tokio::test]
async fn test_both_channels_dump_together_when_one_overflows() {
    let pump = MockPump::new();
    pump.set_positions(900.0, 0.0);
    let session = connected(&pump).await;

    let report = session
        .pump(Channel::Both, 150.0, 1000.0, 2500.0, 500.0)
        .await
        .unwrap();

    assert_eq!(report.strokes_completed, 1);
    assert_eq!(
        move_frames(&pump),
        vec![
            "aBOM0S12N0OCOM0S12N0OR\r",
            "aBIP300S30N5OCIP300S30N5OR\r",
        ]
    );
    assert_eq!(pump.positions(), (300.0, 300.0));
}

#[tokio::test]
async fn test_progress_is_kept_after_cancelled_pump() {
    let pump = MockPump::new().with_busy_polls(u32::MAX);
    let session = connected(&pump).await;

    let running = {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            session
                .pump(Channel::A, 1200.0, 1000.0, 2500.0, 500.0)
                .await
        })
    };

    wait_for(|| move_frames(&pump).len() == 1).await;
    session.stop().await.unwrap();
    let report = running.await.unwrap().unwrap();
    assert!(report.cancelled);

    let progress = session.progress().unwrap();
    assert_eq!(progress.pumped_volume_ul, 500.0);
    assert_eq!(progress.total_volume_ul, 1200.0);

    // Nothing runs any more, so the figures stay put
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(session.progress(), Some(progress));
    assert_eq!(move_frames(&pump).len(), 1);
}

#[tokio::test]
async fn test_huge_volume_is_rejected_before_io() {
    let pump = MockPump::new();
    let session = connected(&pump).await;

    let err = session
        .pump(Channel::A, 1.0e12, 1000.0, 2500.0, 500.0)
        .await
        .unwrap_err();
    assert!(matches!(err, PumpError::InvalidParameter(_)));
    assert_eq!(pump.bytes_written(), 0);
    assert_eq!(session.pump_state(), PumpState::Ready);
}

#[tokio::test]
async fn test_stop_connects_to_busy_pump_without_waiting() {
    let pump = MockPump::new();
    pump.script_status(b"***");
    let session = session_for(&pump);

    let state = session.connect_without_wait("sim").await.unwrap();
    assert_eq!(state, PumpState::Busy);
    assert_eq!(session.connection_state(), ConnectionState::Connected);

    session.stop().await.unwrap();
    let frames = pump.written_frames();
    assert!(frames.iter().any(|f| f == "aK\r"));
    assert!(frames.iter().any(|f| f == "aV\r"));
    assert_eq!(session.pump_state(), PumpState::Ready);
}

#[tokio::test]
async fn test_firmware_version() {
    let pump = MockPump::new();
    let session = connected(&pump).await;

    assert_eq!(session.firmware_version().await.unwrap(), "SIM-PSD v1.0");
    assert_eq!(pump.written_frames(), vec!["aU\r"]);
}
