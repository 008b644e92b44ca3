//! Motion controller against the simulated GRBL firmware.

use std::time::Duration;

use vibroscan::config::StageConfig;
use vibroscan::hardware::grbl::{CoordinateFrame, Position, RunState};
use vibroscan::hardware::mock::SimulatedGrbl;
use vibroscan::hardware::motion::{LinkState, MotionController};
use vibroscan::ScanError;

const POLL: Duration = Duration::from_millis(10);

fn fast_config() -> StageConfig {
    StageConfig {
        poll_interval: POLL,
        wake_delay: Duration::ZERO,
        response_timeout: Duration::from_millis(500),
        ..StageConfig::default()
    }
}

async fn running_controller() -> (MotionController, SimulatedGrbl) {
    let controller = MotionController::new(fast_config());
    let (port, grbl) = SimulatedGrbl::spawn();
    controller.connect_with_port(port).await.unwrap();
    controller.start().unwrap();
    (controller, grbl)
}

async fn wait_for_commands(grbl: &SimulatedGrbl, count: usize) -> Vec<String> {
    for _ in 0..200 {
        let commands = grbl.commands();
        if commands.len() >= count {
            return commands;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("only received {:?}", grbl.commands());
}

#[tokio::test]
async fn commands_are_sent_in_enqueue_order() {
    let (controller, grbl) = running_controller().await;

    controller.enqueue("G90");
    controller.enqueue("G1 X1");
    controller.enqueue("G1 X2");

    let commands = wait_for_commands(&grbl, 3).await;
    assert_eq!(commands, vec!["G90", "G1 X1", "G1 X2"]);
    assert!((grbl.position().x - 2.0).abs() < 1e-9);

    controller.stop().await.unwrap();
}

#[tokio::test]
async fn stop_closes_transport_and_stops_polling() {
    let (controller, grbl) = running_controller().await;
    tokio::time::sleep(POLL * 3).await;
    assert!(controller.is_running());

    // consumer is parked on an empty queue
    let started = std::time::Instant::now();
    controller.stop().await.unwrap();
    let elapsed = started.elapsed();
    assert!(
        elapsed <= POLL + Duration::from_millis(50),
        "stop took {elapsed:?}"
    );

    assert!(grbl.wait_closed(Duration::from_secs(1)).await);
    assert!(!controller.is_running());
    assert_eq!(controller.link_state(), LinkState::Disconnected);

    let queries = grbl.status_queries();
    tokio::time::sleep(POLL * 5).await;
    assert_eq!(grbl.status_queries(), queries);
}

#[tokio::test]
async fn move_resolves_when_stage_arrives() {
    let (controller, grbl) = running_controller().await;

    let handle = controller
        .move_to(CoordinateFrame::Machine, Some(4.0), Some(-2.5), None, 1000.0)
        .unwrap();
    handle.wait_timeout(Duration::from_secs(2)).await.unwrap();

    let commands = grbl.commands();
    assert_eq!(commands, vec!["G90", "G53 G1 X4.000 Y-2.500 F1000"]);
    assert_eq!(controller.current_position(), Position::new(4.0, -2.5, 0.0));
    assert_eq!(controller.run_state(), RunState::Idle);

    controller.stop().await.unwrap();
}

#[tokio::test]
async fn working_frame_move_targets_offset_position() {
    let (controller, grbl) = running_controller().await;
    grbl.set_position(Position::new(5.0, 5.0, 0.0));
    grbl.set_report_working(true);

    let mut updates = controller.subscribe();
    updates.recv().await.unwrap();
    controller.zero_working_coordinates();
    wait_for_commands(&grbl, 1).await;

    let handle = controller
        .move_to(CoordinateFrame::Working, Some(1.0), Some(2.0), None, 1000.0)
        .unwrap();
    assert_eq!(handle.target(), Some((6.0, 7.0)));
    handle.wait_timeout(Duration::from_secs(2)).await.unwrap();

    assert_eq!(grbl.position(), Position::new(6.0, 7.0, 0.0));
    let working = controller.working_position();
    assert!((working.x - 1.0).abs() < 1e-9);
    assert!((working.y - 2.0).abs() < 1e-9);

    controller.stop().await.unwrap();
}

#[tokio::test]
async fn second_move_while_armed_is_rejected() {
    let (controller, grbl) = running_controller().await;
    grbl.set_stalled(true);

    let first = controller
        .move_to(CoordinateFrame::Machine, Some(1.0), Some(1.0), None, 1000.0)
        .unwrap();
    let second = controller.move_to(CoordinateFrame::Machine, Some(2.0), Some(2.0), None, 1000.0);

    assert!(matches!(second, Err(ScanError::DoubleArm { .. })));
    assert!(first.is_armed());

    first.cancel();
    controller
        .move_to(CoordinateFrame::Machine, Some(2.0), Some(2.0), None, 1000.0)
        .unwrap()
        .cancel();

    controller.stop().await.unwrap();
}

#[tokio::test]
async fn stalled_stage_times_out_and_disarms() {
    let (controller, grbl) = running_controller().await;
    grbl.set_stalled(true);

    let handle = controller
        .move_to(CoordinateFrame::Machine, Some(8.0), Some(8.0), None, 1000.0)
        .unwrap();
    let err = handle
        .wait_timeout(Duration::from_millis(100))
        .await
        .unwrap_err();

    assert!(matches!(err, ScanError::MotionTimeout { .. }));
    assert_eq!(controller.snapshot().target, None);

    controller.stop().await.unwrap();
}

#[tokio::test]
async fn stop_cancels_wait_of_stalled_move() {
    let (controller, grbl) = running_controller().await;
    grbl.set_stalled(true);

    let handle = controller
        .move_to(CoordinateFrame::Machine, Some(3.0), Some(3.0), None, 1000.0)
        .unwrap();
    let waiter = tokio::spawn(handle.wait());

    tokio::time::sleep(POLL * 3).await;
    controller.stop().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(ScanError::MotionCancelled)));
}

#[tokio::test]
async fn restart_after_stop_reuses_queue() {
    let controller = MotionController::new(fast_config());
    let (port, grbl) = SimulatedGrbl::spawn();
    controller.connect_with_port(port).await.unwrap();
    controller.start().unwrap();
    controller.stop().await.unwrap();
    assert!(grbl.wait_closed(Duration::from_secs(1)).await);

    controller.enqueue("$X");

    let (port, grbl) = SimulatedGrbl::spawn();
    controller.connect_with_port(port).await.unwrap();
    controller.start().unwrap();

    let commands = wait_for_commands(&grbl, 1).await;
    assert_eq!(commands, vec!["$X"]);
    controller.stop().await.unwrap();
}

#[tokio::test]
async fn moves_are_refused_between_stop_and_start() {
    let (controller, grbl) = running_controller().await;
    controller.stop().await.unwrap();

    let refused = controller.move_to(CoordinateFrame::Machine, Some(2.0), Some(2.0), None, 1000.0);
    assert!(matches!(refused, Err(ScanError::MotionCancelled)));
    assert_eq!(controller.snapshot().target, None);
    assert!(grbl.commands().is_empty());

    let (port, grbl) = SimulatedGrbl::spawn();
    controller.connect_with_port(port).await.unwrap();
    controller.start().unwrap();

    controller
        .move_to(CoordinateFrame::Machine, Some(2.0), Some(2.0), None, 1000.0)
        .unwrap()
        .wait_timeout(Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(grbl.position(), Position::new(2.0, 2.0, 0.0));

    controller.stop().await.unwrap();
}

#[tokio::test]
async fn jog_switches_to_relative_mode() {
    let (controller, grbl) = running_controller().await;
    grbl.set_position(Position::new(1.0, 1.0, 0.0));

    controller.jog(vibroscan::hardware::grbl::Axis::X, -0.5);

    let commands = wait_for_commands(&grbl, 2).await;
    assert_eq!(commands[0], "G91");
    assert!(commands[1].starts_with("$J=X-0.500"));
    assert!((grbl.position().x - 0.5).abs() < 1e-9);

    controller.stop().await.unwrap();
}

#[tokio::test]
async fn status_callbacks_accumulate() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    let controller = MotionController::new(fast_config());
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));
    let (a, b) = (Arc::clone(&first), Arc::clone(&second));
    controller.on_status(move |_| {
        a.fetch_add(1, Ordering::SeqCst);
    });
    controller.on_status(move |_| {
        b.fetch_add(1, Ordering::SeqCst);
    });

    let (port, _grbl) = SimulatedGrbl::spawn();
    controller.connect_with_port(port).await.unwrap();
    controller.start().unwrap();
    tokio::time::sleep(POLL * 5).await;
    controller.stop().await.unwrap();

    assert!(first.load(Ordering::SeqCst) > 0);
    assert_eq!(first.load(Ordering::SeqCst), second.load(Ordering::SeqCst));
}
