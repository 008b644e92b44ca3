//! End-to-end scans against the simulated stage and instruments.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use vibroscan::config::{ScanParameters, StageConfig};
use vibroscan::experiment::dataset::RESPONSE_TAG;
use vibroscan::experiment::{ScanOrchestrator, ScanPhase};
use vibroscan::hardware::mock::{MockOscilloscope, MockSignalGenerator, SimulatedGrbl};
use vibroscan::hardware::motion::MotionController;
use vibroscan::ScanError;

struct Rig {
    stage: Arc<MotionController>,
    grbl: SimulatedGrbl,
    generator: Arc<MockSignalGenerator>,
    scope: Arc<MockOscilloscope>,
}

impl Rig {
    async fn new() -> Self {
        let stage = Arc::new(MotionController::new(StageConfig {
            poll_interval: Duration::from_millis(5),
            wake_delay: Duration::ZERO,
            response_timeout: Duration::from_millis(500),
            ..StageConfig::default()
        }));
        let (port, grbl) = SimulatedGrbl::spawn();
        stage.connect_with_port(port).await.unwrap();
        stage.start().unwrap();
        Self {
            stage,
            grbl,
            generator: Arc::new(MockSignalGenerator::new()),
            scope: Arc::new(MockOscilloscope::new()),
        }
    }

    fn orchestrator(&self, params: ScanParameters) -> ScanOrchestrator {
        ScanOrchestrator::new(
            Arc::clone(&self.stage),
            self.generator.clone(),
            self.scope.clone(),
            params,
        )
    }
}

/// 3 x 2 grid (7 points), 3 samples per point, 1 ms propagation delay.
fn experiment(overrides: Value) -> ScanParameters {
    let mut map: BTreeMap<String, Value> = match json!({
        "nb_point_x": 3,
        "nb_point_y": 2,
        "step_x": 1.5,
        "step_y": 2.0,
        "start_x": 10.0,
        "start_y": 20.0,
        "delay_before_measuring": 0.0,
        "configure_settle": 0.0,
        "samples_per_point": 3,
        "time_division": 0.1,
        "channel_sg": 1,
        "vibrometer_channel": 2,
        "reference_channel": 3,
        "trigger_level": 100,
        "trigger_delay": 0,
        "trigger_mode": "NORM",
    }) {
        Value::Object(map) => map.into_iter().collect(),
        _ => unreachable!(),
    };
    if let Value::Object(extra) = overrides {
        map.extend(extra);
    }
    ScanParameters::from_map(&map).unwrap()
}

#[tokio::test]
async fn synchronous_scan_records_every_sample() {
    let rig = Rig::new().await;
    let scan = rig.orchestrator(experiment(json!({})));

    let table = scan.run().await.unwrap();

    assert_eq!(table.len(), 7 * 3);
    let keys: Vec<String> = table.columns().iter().map(|c| c.key()).collect();
    assert_eq!(&keys[..3], &["X10_Y20_S1", "X10_Y20_S2", "X10_Y20_S3"]);
    assert_eq!(&keys[3..6], &["X11.5_Y20_S1", "X11.5_Y20_S2", "X11.5_Y20_S3"]);
    // serpentine: the second row runs backwards
    assert_eq!(keys[9], "X13_Y22_S1");
    assert_eq!(keys[18], "X10_Y24_S1");

    assert!(table.columns().iter().all(|c| c.channel_tag == RESPONSE_TAG));
    assert_eq!(rig.generator.bursts(), 21);
    assert_eq!(rig.scope.acquisitions(), 21);
    assert!(!rig.generator.output_enabled());

    let progress = scan.progress();
    assert_eq!(progress.phase, ScanPhase::Complete);
    assert_eq!(progress.points_done, 7);
    assert_eq!(progress.points_total, 7);

    rig.stage.stop().await.unwrap();
}

#[tokio::test]
async fn startup_unlock_precedes_first_move() {
    let rig = Rig::new().await;
    rig.orchestrator(experiment(json!({}))).run().await.unwrap();

    let commands = rig.grbl.commands();
    assert_eq!(commands[0], "$X");
    assert_eq!(commands[1], "G90");
    assert!(commands[2].starts_with("G53 G1 X10.000 Y20.000"));

    rig.stage.stop().await.unwrap();
}

#[tokio::test]
async fn instruments_are_configured_before_scanning() {
    let rig = Rig::new().await;
    rig.orchestrator(experiment(json!({"burst_count": 5})))
        .run()
        .await
        .unwrap();

    let calls = rig.generator.calls();
    assert_eq!(
        &calls[..5],
        &["CHN 1", "WAVE SINE", "FREQ 10000", "BSTCOUNT 5", "OUTPUT ON"]
    );
    assert_eq!(calls.last().map(String::as_str), Some("OUTPUT OFF"));

    let scope_calls = rig.scope.calls();
    assert!(scope_calls[0].starts_with("C2:VOLT_DIV 20MV"));
    assert!(scope_calls[1].starts_with("C3:VOLT_DIV 500MV"));
    assert!(scope_calls[2].starts_with("C3:TRIG_LEVEL"));

    rig.stage.stop().await.unwrap();
}

#[tokio::test]
async fn pulse_excitation_replaces_wave_and_frequency() {
    let rig = Rig::new().await;
    rig.orchestrator(experiment(json!({"wave_type": "PULSE", "frequency": 5})))
        .run()
        .await
        .unwrap();

    let calls = rig.generator.calls();
    assert_eq!(
        &calls[..4],
        &["CHN 1", "PULSE 5 2.5VPP 1.25V 0.015S", "BSTCOUNT 1", "OUTPUT ON"]
    );
    assert!(!calls.iter().any(|c| c.starts_with("WAVE") || c.starts_with("FREQ")));

    rig.stage.stop().await.unwrap();
}

#[tokio::test]
async fn pipelined_scan_matches_synchronous_order() {
    let sync_rig = Rig::new().await;
    let sync_table = sync_rig
        .orchestrator(experiment(json!({})))
        .run()
        .await
        .unwrap();
    sync_rig.stage.stop().await.unwrap();

    let rig = Rig::new().await;
    let scope = Arc::new(MockOscilloscope::new().with_readout_delay(Duration::from_millis(2)));
    let scan = ScanOrchestrator::new(
        Arc::clone(&rig.stage),
        rig.generator.clone(),
        scope,
        experiment(json!({"scan_mode": "pipelined"})),
    );
    let table = scan.run().await.unwrap();

    let keys = |t: &vibroscan::experiment::SampleTable| -> Vec<String> {
        t.columns().iter().map(|c| c.key()).collect()
    };
    assert_eq!(keys(&table), keys(&sync_table));
    assert_eq!(scan.progress().points_done, 7);

    rig.stage.stop().await.unwrap();
}

#[tokio::test]
async fn extra_channels_are_tagged() {
    let rig = Rig::new().await;
    let params = experiment(json!({
        "samples_per_point": 1,
        "extra_channels": [{ "channel": 4, "tag": "force" }],
    }));

    let table = rig.orchestrator(params).run().await.unwrap();

    assert_eq!(table.len(), 7 * 2);
    assert_eq!(table.with_tag(RESPONSE_TAG).count(), 7);
    let force: Vec<_> = table.with_tag("force").collect();
    assert_eq!(force.len(), 7);
    assert!(force.iter().all(|c| c.channel == 4 && c.sample_ordinal == 1));

    rig.stage.stop().await.unwrap();
}

#[tokio::test]
async fn generator_failure_disables_output() {
    let rig = Rig::new().await;
    rig.generator.fail_on("*TRG");

    let err = rig
        .orchestrator(experiment(json!({})))
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, ScanError::DeviceCommand(_)));
    assert!(!rig.generator.output_enabled());
    assert_eq!(rig.generator.calls().last().map(String::as_str), Some("OUTPUT OFF"));

    rig.stage.stop().await.unwrap();
}

#[tokio::test]
async fn acquisition_failure_mid_scan_keeps_no_partial_point() {
    let rig = Rig::new().await;
    rig.scope.fail_after(4);
    let scan = rig.orchestrator(experiment(json!({})));

    let err = scan.run().await.unwrap_err();

    assert!(matches!(err, ScanError::DeviceCommand(_)));
    assert!(!rig.generator.output_enabled());
    let progress = scan.progress();
    assert_eq!(progress.phase, ScanPhase::Failed);
    assert_eq!(progress.points_done, 1);

    rig.stage.stop().await.unwrap();
}

#[tokio::test]
async fn stopping_the_stage_mid_scan_cancels_the_wait() {
    let rig = Rig::new().await;
    rig.grbl.set_stalled(true);
    let scan = Arc::new(rig.orchestrator(experiment(json!({}))));

    let mut progress = scan.subscribe_progress();
    let runner = tokio::spawn({
        let scan = Arc::clone(&scan);
        async move { scan.run().await }
    });
    tokio::time::timeout(
        Duration::from_secs(2),
        progress.wait_for(|p| p.phase == ScanPhase::Moving),
    )
    .await
    .unwrap()
    .unwrap();

    rig.stage.stop().await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(2), runner)
        .await
        .unwrap()
        .unwrap();

    assert!(matches!(result, Err(ScanError::MotionCancelled)));
    assert!(!rig.generator.output_enabled());
    assert_eq!(scan.progress().phase, ScanPhase::Failed);
}

#[tokio::test]
async fn stopping_the_stage_while_settling_fails_the_next_move() {
    let rig = Rig::new().await;
    let scan = Arc::new(rig.orchestrator(experiment(json!({"delay_before_measuring": 0.3}))));

    let mut progress = scan.subscribe_progress();
    let runner = tokio::spawn({
        let scan = Arc::clone(&scan);
        async move { scan.run().await }
    });
    tokio::time::timeout(
        Duration::from_secs(2),
        progress.wait_for(|p| p.phase == ScanPhase::AwaitingSettle),
    )
    .await
    .unwrap()
    .unwrap();

    rig.stage.stop().await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(3), runner)
        .await
        .unwrap()
        .unwrap();

    assert!(matches!(result, Err(ScanError::MotionCancelled)));
    assert!(!rig.generator.output_enabled());
    assert_eq!(rig.stage.snapshot().target, None);
    let progress = scan.progress();
    assert_eq!(progress.phase, ScanPhase::Failed);
    // the point being settled is still measured; the move after it is refused
    assert_eq!(progress.points_done, 1);
}

#[tokio::test]
async fn abort_interrupts_the_scan() {
    let rig = Rig::new().await;
    rig.grbl.set_stalled(true);
    let scan = Arc::new(rig.orchestrator(experiment(json!({}))));
    let abort = scan.abort_handle();

    let runner = tokio::spawn({
        let scan = Arc::clone(&scan);
        async move { scan.run().await }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    abort.abort();

    let result = tokio::time::timeout(Duration::from_secs(2), runner)
        .await
        .unwrap()
        .unwrap();

    assert!(matches!(result, Err(ScanError::Aborted)));
    assert!(abort.is_aborted());
    assert!(!rig.generator.output_enabled());
    assert_eq!(scan.progress().phase, ScanPhase::Aborted);
    // the wait was dropped, so the controller accepts a new move
    assert_eq!(rig.stage.snapshot().target, None);

    rig.stage.stop().await.unwrap();
}

#[tokio::test]
async fn motion_timeout_fails_the_scan() {
    let rig = Rig::new().await;
    rig.grbl.set_stalled(true);

    let err = rig
        .orchestrator(experiment(json!({"motion_timeout": 0.05})))
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, ScanError::MotionTimeout { .. }));
    assert!(!rig.generator.output_enabled());

    rig.stage.stop().await.unwrap();
}
