//! Simulated instruments
//!
//! In-process stand-ins for the three instruments of the scanning rig, used by the
//! integration tests and by `vibroscan scan --simulate`.
//!
//! # Available Mocks
//!
//! - [`SimulatedGrbl`] - GRBL firmware behind an in-memory serial link; moves are
//!   instantaneous unless stalled
//! - [`MockSignalGenerator`] - [`ExcitationSource`] that records every call
//! - [`MockOscilloscope`] - [`Acquisition`] that returns synthetic traces
//!
//! Each mock can be told to fail, so error paths can be exercised without hardware.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};

use crate::hardware::capabilities::{
    Acquisition, ExcitationSource, GridSettings, PulseShape, TriggerSettings, WaveKind,
    Waveform,
};
use crate::hardware::grbl::Position;
use crate::hardware::serial::DynSerial;

// =============================================================================
// SimulatedGrbl - firmware on the far end of a duplex pipe
// =============================================================================

#[derive(Debug, Default)]
struct FirmwareState {
    machine: Position,
    work_offset: Position,
    relative: bool,
    alarm: bool,
    stalled: bool,
    report_working: bool,
    malformed_replies: usize,
    commands: Vec<String>,
    status_queries: usize,
    closed: bool,
}

impl FirmwareState {
    fn status_line(&mut self) -> String {
        self.status_queries += 1;
        if self.malformed_replies > 0 {
            self.malformed_replies -= 1;
            return "<Idle|MPos:garbled".to_string();
        }
        let state = if self.alarm { "Alarm" } else { "Idle" };
        let (label, p) = if self.report_working {
            ("WPos", self.machine.relative_to(&self.work_offset))
        } else {
            ("MPos", self.machine)
        };
        format!("<{state}|{label}:{:.3},{:.3},{:.3}|FS:0,0>", p.x, p.y, p.z)
    }

    fn execute(&mut self, line: &str) -> &'static str {
        self.commands.push(line.to_string());

        if self.alarm && line != "$X" && line != "$H" {
            return "error:9";
        }

        match line {
            "G90" => self.relative = false,
            "G91" => self.relative = true,
            "$H" => {
                self.machine = Position::default();
                self.alarm = false;
            }
            "$X" => self.alarm = false,
            l if l.starts_with("G10 L20 P1") => self.work_offset = self.machine,
            l if l.starts_with("$J=") => {
                let relative = self.relative;
                self.apply_words(&l[3..], relative, Position::default());
            }
            l if l.starts_with("G53 G1") => self.apply_words(&l[6..], false, Position::default()),
            l if l.starts_with("G54 G1") => {
                let offset = self.work_offset;
                self.apply_words(&l[6..], false, offset);
            }
            l if l.starts_with("G1 ") || l.starts_with("G0 ") => {
                let (relative, offset) = (self.relative, self.work_offset);
                self.apply_words(&l[3..], relative, offset);
            }
            _ => return "error:20",
        }
        "ok"
    }

    fn apply_words(&mut self, words: &str, relative: bool, offset: Position) {
        if self.stalled {
            return;
        }
        for word in words.split_whitespace() {
            let (axis, value) = word.split_at(1);
            let Ok(value) = value.parse::<f64>() else {
                continue;
            };
            let (slot, origin) = match axis {
                "X" => (&mut self.machine.x, offset.x),
                "Y" => (&mut self.machine.y, offset.y),
                "Z" => (&mut self.machine.z, offset.z),
                _ => continue,
            };
            if relative {
                *slot += value;
            } else {
                *slot = value + origin;
            }
        }
    }
}

/// GRBL firmware simulator.
///
/// [`SimulatedGrbl::spawn`] returns the controller side of an in-memory serial link
/// and a handle for inspecting and steering the simulated firmware.
///
/// Behavior:
/// - `?` (anywhere in the byte stream) is answered with a status line
/// - every non-empty line is recorded and answered with `ok`, or `error:<n>`
/// - moves take effect immediately, unless the stage is stalled
/// - blank lines (the wake-up sequence) are ignored
pub struct SimulatedGrbl {
    state: Arc<Mutex<FirmwareState>>,
    task: JoinHandle<()>,
}

impl SimulatedGrbl {
    /// Start the firmware task; returns the port to hand to the controller.
    pub fn spawn() -> (DynSerial, Self) {
        let (controller_end, firmware_end) = tokio::io::duplex(4096);
        let state = Arc::new(Mutex::new(FirmwareState::default()));
        let task = tokio::spawn(run_firmware(firmware_end, Arc::clone(&state)));
        (Box::new(controller_end), Self { state, task })
    }

    /// Command lines received so far, in arrival order.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    /// Number of `?` queries answered.
    pub fn status_queries(&self) -> usize {
        self.state.lock().status_queries
    }

    /// Current machine position.
    pub fn position(&self) -> Position {
        self.state.lock().machine
    }

    /// Place the stage somewhere without sending a command.
    pub fn set_position(&self, position: Position) {
        self.state.lock().machine = position;
    }

    /// While stalled, move commands are acknowledged but the stage does not move.
    pub fn set_stalled(&self, stalled: bool) {
        self.state.lock().stalled = stalled;
    }

    /// Report `WPos` instead of `MPos`.
    pub fn set_report_working(&self, enabled: bool) {
        self.state.lock().report_working = enabled;
    }

    /// Enter or leave the alarm state.
    pub fn set_alarm(&self, alarm: bool) {
        self.state.lock().alarm = alarm;
    }

    /// Answer the next `count` status queries with an unparseable line.
    pub fn send_malformed_status(&self, count: usize) {
        self.state.lock().malformed_replies += count;
    }

    /// Whether the controller closed its end of the link.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed || self.task.is_finished()
    }

    /// Wait up to `timeout` for the controller to close the link.
    pub async fn wait_closed(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.is_closed() {
                return true;
            }
            sleep(Duration::from_millis(5)).await;
        }
        self.is_closed()
    }
}

impl Drop for SimulatedGrbl {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_firmware(mut io: DuplexStream, state: Arc<Mutex<FirmwareState>>) {
    let mut buf = [0u8; 256];
    let mut line = Vec::new();

    loop {
        let n = match io.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };

        let mut replies = Vec::new();
        {
            let mut firmware = state.lock();
            for &byte in &buf[..n] {
                match byte {
                    b'?' => replies.push(firmware.status_line()),
                    b'\n' => {
                        let text = String::from_utf8_lossy(&line).trim().to_string();
                        line.clear();
                        if !text.is_empty() {
                            replies.push(firmware.execute(&text).to_string());
                        }
                    }
                    b'\r' => {}
                    other => line.push(other),
                }
            }
        }

        for reply in replies {
            let framed = format!("{reply}\r\n");
            if io.write_all(framed.as_bytes()).await.is_err() {
                state.lock().closed = true;
                return;
            }
        }
    }

    state.lock().closed = true;
}

// =============================================================================
// MockSignalGenerator
// =============================================================================

/// Excitation source that records calls instead of driving hardware.
///
/// Calls are recorded with the keyword the TG2512A would receive, e.g. `"OUTPUT ON"`.
#[derive(Debug, Default)]
pub struct MockSignalGenerator {
    calls: Mutex<Vec<String>>,
    output_enabled: Mutex<bool>,
    bursts: Mutex<u32>,
    fail_on: Mutex<Option<&'static str>>,
}

impl MockSignalGenerator {
    /// New generator with output off.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later command whose keyword starts with `keyword` fail.
    pub fn fail_on(&self, keyword: &'static str) {
        *self.fail_on.lock() = Some(keyword);
    }

    /// Recorded commands.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Whether the output is currently enabled.
    pub fn output_enabled(&self) -> bool {
        *self.output_enabled.lock()
    }

    /// Bursts emitted so far.
    pub fn bursts(&self) -> u32 {
        *self.bursts.lock()
    }

    fn record(&self, command: String) -> Result<()> {
        let failing = matches!(*self.fail_on.lock(), Some(k) if command.starts_with(k));
        self.calls.lock().push(command.clone());
        if failing {
            return Err(anyhow!("simulated generator failure on '{command}'"));
        }
        Ok(())
    }
}

#[async_trait]
impl ExcitationSource for MockSignalGenerator {
    async fn set_channel(&self, channel: u8) -> Result<()> {
        self.record(format!("CHN {channel}"))
    }

    async fn set_output(&self, enabled: bool) -> Result<()> {
        let result = self.record(format!("OUTPUT {}", if enabled { "ON" } else { "OFF" }));
        if result.is_ok() {
            *self.output_enabled.lock() = enabled;
        }
        result
    }

    async fn set_frequency(&self, hz: f64) -> Result<()> {
        self.record(format!("FREQ {hz}"))
    }

    async fn set_wave(&self, kind: WaveKind, register: Option<u8>) -> Result<()> {
        match (kind, register) {
            (WaveKind::Arb, Some(n)) => self.record(format!("WAVE ARB{n}")),
            _ => self.record(format!("WAVE {kind}")),
        }
    }

    async fn set_pulse(&self, shape: PulseShape) -> Result<()> {
        self.record(format!(
            "PULSE {} {}VPP {}V {}S",
            shape.frequency, shape.amplitude, shape.offset, shape.width
        ))
    }

    async fn set_burst_mode(&self, count: u32) -> Result<()> {
        self.record(format!("BSTCOUNT {count}"))
    }

    async fn burst(&self) -> Result<()> {
        self.record("*TRG".to_string())?;
        *self.bursts.lock() += 1;
        Ok(())
    }
}

// =============================================================================
// MockOscilloscope
// =============================================================================

/// Acquisition device returning deterministic synthetic traces.
#[derive(Debug)]
pub struct MockOscilloscope {
    calls: Mutex<Vec<String>>,
    acquisitions: Mutex<u32>,
    samples_per_trace: usize,
    fail_after: Mutex<Option<u32>>,
    readout_delay: Duration,
}

impl Default for MockOscilloscope {
    fn default() -> Self {
        Self::new()
    }
}

impl MockOscilloscope {
    /// Scope returning 16-sample traces without delay.
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            acquisitions: Mutex::new(0),
            samples_per_trace: 16,
            fail_after: Mutex::new(None),
            readout_delay: Duration::ZERO,
        }
    }

    /// Add a readout delay to every acquisition.
    pub fn with_readout_delay(mut self, delay: Duration) -> Self {
        self.readout_delay = delay;
        self
    }

    /// Fail every acquisition after the first `count` succeeded.
    pub fn fail_after(&self, count: u32) {
        *self.fail_after.lock() = Some(count);
    }

    /// Recorded commands.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Successful acquisitions so far.
    pub fn acquisitions(&self) -> u32 {
        *self.acquisitions.lock()
    }
}

#[async_trait]
impl Acquisition for MockOscilloscope {
    async fn set_grid(&self, grid: GridSettings) -> Result<()> {
        self.calls.lock().push(format!(
            "C{}:VOLT_DIV {}{} TIME_DIV {}{}",
            grid.channel,
            grid.volt_division,
            grid.volt_unit.as_str(),
            grid.time_division,
            grid.time_unit.as_str()
        ));
        Ok(())
    }

    async fn set_trigger(&self, trigger: TriggerSettings) -> Result<()> {
        self.calls.lock().push(format!(
            "C{}:TRIG_LEVEL {}{} TRIG_MODE {}",
            trigger.channel,
            trigger.level,
            trigger.level_unit.as_str(),
            trigger.mode.as_str()
        ));
        Ok(())
    }

    async fn acquire(&self, read_only: bool, channel: u8) -> Result<Waveform> {
        if !self.readout_delay.is_zero() {
            sleep(self.readout_delay).await;
        }
        self.calls
            .lock()
            .push(format!("C{channel}:WAVEFORM? read_only={read_only}"));

        let index = {
            let mut count = self.acquisitions.lock();
            if matches!(*self.fail_after.lock(), Some(limit) if *count >= limit) {
                return Err(anyhow!("simulated acquisition failure on C{channel}"));
            }
            *count += 1;
            *count
        };

        let samples = (0..self.samples_per_trace)
            .map(|i| {
                let phase = (i as f64 / self.samples_per_trace as f64) * std::f64::consts::TAU;
                (phase.sin() * 1000.0) as i16 + (index % 100) as i16
            })
            .collect();

        Ok(Waveform {
            description: format!("MOCK C{channel}"),
            text: String::new(),
            time: format!("acq {index}"),
            samples,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::serial::SerialChannel;

    #[tokio::test]
    async fn firmware_executes_moves_and_reports_status() {
        let (port, grbl) = SimulatedGrbl::spawn();
        let channel = SerialChannel::new(port, Duration::from_secs(1));

        assert_eq!(channel.transact("G90").await.unwrap(), "ok");
        assert_eq!(channel.transact("G53 G1 X1.500 Y-2.000 F1000").await.unwrap(), "ok");
        assert_eq!(
            channel.query_status().await.unwrap(),
            "<Idle|MPos:1.500,-2.000,0.000|FS:0,0>"
        );
        assert_eq!(grbl.commands(), vec!["G90", "G53 G1 X1.500 Y-2.000 F1000"]);
    }

    #[tokio::test]
    async fn firmware_rejects_commands_while_in_alarm() {
        let (port, grbl) = SimulatedGrbl::spawn();
        let channel = SerialChannel::new(port, Duration::from_secs(1));
        grbl.set_alarm(true);

        assert_eq!(channel.transact("G90").await.unwrap(), "error:9");
        assert_eq!(channel.transact("$X").await.unwrap(), "ok");
        assert_eq!(channel.transact("G90").await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn jog_is_relative_after_g91() {
        let (port, grbl) = SimulatedGrbl::spawn();
        let channel = SerialChannel::new(port, Duration::from_secs(1));
        grbl.set_position(Position::new(1.0, 1.0, 0.0));

        channel.transact("G91").await.unwrap();
        channel.transact("$J=X2.000 F1000").await.unwrap();

        assert_eq!(grbl.position(), Position::new(3.0, 1.0, 0.0));
    }

    #[tokio::test]
    async fn generator_records_and_fails_on_request() {
        let generator = MockSignalGenerator::new();
        generator.set_output(true).await.unwrap();
        generator.fail_on("*TRG");

        assert!(generator.burst().await.is_err());
        assert_eq!(generator.calls(), vec!["OUTPUT ON", "*TRG"]);
        assert!(generator.output_enabled());
        assert_eq!(generator.bursts(), 0);
    }

    #[tokio::test]
    async fn scope_fails_after_limit() {
        let scope = MockOscilloscope::new();
        scope.fail_after(1);

        let trace = scope.acquire(true, 2).await.unwrap();
        assert_eq!(trace.samples.len(), 16);
        assert!(scope.acquire(true, 2).await.is_err());
        assert_eq!(scope.acquisitions(), 1);
    }
}
