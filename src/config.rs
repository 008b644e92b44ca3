//! Configuration loading using Figment
//!
//! Settings are layered from:
//! 1. `config/vibroscan.toml` (or an explicit path)
//! 2. Environment variables prefixed with `VIBROSCAN_`, nested with `__`
//!    (e.g. `VIBROSCAN_STAGE__PORT=/dev/ttyUSB0`,
//!    `VIBROSCAN_EXPERIMENT__NB_POINT_X=12`)
//!
//! The `[experiment]` table is kept as a flat key/value map on load and turned into
//! an immutable [`ScanParameters`] by [`ScanParameters::from_map`], which reports
//! every missing key at once.
//!
//! # Example
//! ```no_run
//! use vibroscan::config::Settings;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load_from("config/vibroscan.toml")?;
//! settings.validate()?;
//! let params = settings.scan_parameters()?;
//! println!("{} points", params.point_count());
//! # Ok(())
//! # }
//! ```

use crate::error::{AppResult, ScanError};
use crate::experiment::traversal::GridPoint;
use crate::hardware::capabilities::{
    GridSettings, PulseShape, TimeUnit, TriggerMode, TriggerSettings, VoltUnit, WaveKind,
};
use crate::logging::OutputFormat;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/vibroscan.toml";

/// Experiment keys that have no default.
pub const REQUIRED_EXPERIMENT_KEYS: [&str; 15] = [
    "nb_point_x",
    "nb_point_y",
    "step_x",
    "step_y",
    "start_x",
    "start_y",
    "delay_before_measuring",
    "samples_per_point",
    "time_division",
    "channel_sg",
    "vibrometer_channel",
    "reference_channel",
    "trigger_level",
    "trigger_delay",
    "trigger_mode",
];

/// Top-level settings document
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Motion stage link
    #[serde(default)]
    pub stage: StageConfig,
    /// Signal generator link
    #[serde(default)]
    pub signal_generator: SignalGeneratorConfig,
    /// Oscilloscope link
    #[serde(default)]
    pub oscilloscope: OscilloscopeConfig,
    /// Flat experiment parameters, see [`ScanParameters`]
    #[serde(default)]
    pub experiment: BTreeMap<String, serde_json::Value>,
}

/// Application-level configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: OutputFormat::Pretty,
        }
    }
}

/// GRBL stage link and controller timing
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Serial device path
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Interval between status queries
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Upper bound on any single response read
    #[serde(with = "humantime_serde")]
    pub response_timeout: Duration,
    /// Time the firmware needs after the wake-up sequence
    #[serde(with = "humantime_serde")]
    pub wake_delay: Duration,
    /// Distance below which a target counts as reached
    pub position_tolerance: f64,
    /// Feed rate used for jogging
    pub jog_feedrate: f64,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".to_string(),
            baud_rate: 115_200,
            poll_interval: Duration::from_secs(1),
            response_timeout: Duration::from_secs(5),
            wake_delay: Duration::from_secs(2),
            position_tolerance: 0.05,
            jog_feedrate: 1000.0,
        }
    }
}

/// TG2512A serial link
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SignalGeneratorConfig {
    /// Serial device path
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Upper bound on any single response read
    #[serde(with = "humantime_serde")]
    pub response_timeout: Duration,
}

impl Default for SignalGeneratorConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            response_timeout: Duration::from_secs(5),
        }
    }
}

/// LeCroy VICP link
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OscilloscopeConfig {
    /// Host name or IP address
    pub address: String,
    /// VICP TCP port
    pub port: u16,
    /// Upper bound on connect and on any single response
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for OscilloscopeConfig {
    fn default() -> Self {
        Self {
            address: "192.168.0.10".to_string(),
            port: 1861,
            timeout: Duration::from_secs(10),
        }
    }
}

impl Settings {
    /// Load from the default path plus environment overrides.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path plus environment overrides.
    ///
    /// A missing file is not an error; every section has defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("VIBROSCAN_").split("__"))
            .extract()?;
        Ok(settings)
    }

    /// Validate the non-experiment sections.
    pub fn validate(&self) -> AppResult<()> {
        crate::logging::parse_log_level(&self.application.log_level)?;

        if self.stage.poll_interval.is_zero() {
            return Err(ScanError::Configuration(
                "stage.poll_interval must be greater than zero".into(),
            ));
        }
        if !(self.stage.position_tolerance.is_finite() && self.stage.position_tolerance > 0.0) {
            return Err(ScanError::Configuration(format!(
                "stage.position_tolerance must be positive, got {}",
                self.stage.position_tolerance
            )));
        }
        if self.stage.baud_rate == 0 || self.signal_generator.baud_rate == 0 {
            return Err(ScanError::Configuration("baud_rate must be non-zero".into()));
        }
        Ok(())
    }

    /// Build validated scan parameters from the `[experiment]` table.
    pub fn scan_parameters(&self) -> AppResult<ScanParameters> {
        ScanParameters::from_map(&self.experiment)
    }
}

/// What the orchestrator sends to the stage before configuring the instruments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartupAction {
    /// Clear an alarm lock (`$X`)
    #[default]
    Unlock,
    /// Run the homing cycle (`$H`)
    Home,
    /// Leave the stage as is
    None,
}

/// Whether the next move is issued before or after the current point is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// Move, wait, measure
    #[default]
    Synchronous,
    /// Issue the next move as soon as the current point's traces are read
    Pipelined,
}

/// An additional channel read after the vibrometer on every sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelTag {
    /// Oscilloscope channel
    pub channel: u8,
    /// Tag stored with the column
    pub tag: String,
}

/// Raw shape of the `[experiment]` table; defaults match the bench setup.
#[derive(Debug, Deserialize)]
struct RawParameters {
    nb_point_x: u32,
    nb_point_y: u32,
    step_x: f64,
    step_y: f64,
    start_x: f64,
    start_y: f64,
    delay_before_measuring: f64,
    samples_per_point: u32,
    time_division: f64,
    channel_sg: u8,
    vibrometer_channel: u8,
    reference_channel: u8,
    trigger_level: f64,
    trigger_delay: f64,
    trigger_mode: TriggerMode,
    #[serde(default = "default_frequency")]
    frequency: f64,
    #[serde(default = "default_wave_type")]
    wave_type: String,
    #[serde(default = "default_arb_register")]
    arb_register: u8,
    #[serde(default = "default_burst_count")]
    burst_count: u32,
    #[serde(default = "default_pulse_amplitude")]
    pulse_amplitude: f64,
    #[serde(default = "default_pulse_offset")]
    pulse_offset: f64,
    #[serde(default = "default_pulse_width")]
    pulse_width: f64,
    #[serde(default)]
    pulse_delay: f64,
    #[serde(default = "default_volt_division_vibrometer")]
    volt_division_vibrometer: f64,
    #[serde(default = "default_volt_division_reference")]
    volt_division_reference: f64,
    #[serde(default)]
    unit_time_division: TimeUnit,
    #[serde(default)]
    unit_volt_division: VoltUnit,
    #[serde(default = "default_feedrate")]
    feedrate: f64,
    #[serde(default = "default_configure_settle")]
    configure_settle: f64,
    #[serde(default)]
    startup_action: StartupAction,
    #[serde(default)]
    scan_mode: ScanMode,
    #[serde(default)]
    priming_burst: bool,
    #[serde(default)]
    motion_timeout: Option<f64>,
    #[serde(default)]
    extra_channels: Vec<ChannelTag>,
}

fn default_frequency() -> f64 {
    10_000.0
}

fn default_wave_type() -> String {
    "SINE".to_string()
}

fn default_arb_register() -> u8 {
    1
}

fn default_burst_count() -> u32 {
    1
}

fn default_pulse_amplitude() -> f64 {
    2.5
}

fn default_pulse_offset() -> f64 {
    1.25
}

fn default_pulse_width() -> f64 {
    0.015
}

fn default_volt_division_vibrometer() -> f64 {
    20.0
}

fn default_volt_division_reference() -> f64 {
    500.0
}

fn default_feedrate() -> f64 {
    1000.0
}

fn default_configure_settle() -> f64 {
    5.0
}

/// Immutable, validated parameters for one raster scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanParameters {
    /// Points per row
    pub nb_point_x: u32,
    /// Number of full rows
    pub nb_point_y: u32,
    /// Distance between columns
    pub step_x: f64,
    /// Distance between rows
    pub step_y: f64,
    /// Machine X of column 0
    pub start_x: f64,
    /// Machine Y of row 0
    pub start_y: f64,
    /// Settle delay after arrival
    pub delay_before_measuring: Duration,
    /// Samples acquired at each point
    pub samples_per_point: u32,
    /// Oscilloscope time per division
    pub time_division: f64,
    /// Unit of `time_division` and `trigger_delay`
    pub unit_time_division: TimeUnit,
    /// Unit of volt divisions and `trigger_level`
    pub unit_volt_division: VoltUnit,
    /// Signal generator channel
    pub channel_sg: u8,
    /// Oscilloscope channel wired to the vibrometer
    pub vibrometer_channel: u8,
    /// Oscilloscope channel used as trigger reference
    pub reference_channel: u8,
    /// Trigger level
    pub trigger_level: f64,
    /// Trigger delay
    pub trigger_delay: f64,
    /// Trigger sweep mode
    pub trigger_mode: TriggerMode,
    /// Excitation frequency in Hz
    pub frequency: f64,
    /// Excitation waveform
    pub wave_type: WaveKind,
    /// Arbitrary-waveform register used with [`WaveKind::Arb`]
    pub arb_register: u8,
    /// Cycles per burst
    pub burst_count: u32,
    /// Pulse amplitude in Vpp, used with [`WaveKind::Pulse`]
    pub pulse_amplitude: f64,
    /// Pulse DC offset in volts
    pub pulse_offset: f64,
    /// Pulse width in seconds
    pub pulse_width: f64,
    /// Pulse start delay in seconds
    pub pulse_delay: f64,
    /// Vibrometer channel volts per division
    pub volt_division_vibrometer: f64,
    /// Reference channel volts per division
    pub volt_division_reference: f64,
    /// Stage feed rate for grid moves
    pub feedrate: f64,
    /// Pause after configuring the instruments
    pub configure_settle: Duration,
    /// Stage preparation before the scan
    pub startup_action: StartupAction,
    /// Move issuance strategy
    pub scan_mode: ScanMode,
    /// Fire one unrecorded burst after each arrival
    pub priming_burst: bool,
    /// Bound on each position-reached wait; `None` waits indefinitely
    pub motion_timeout: Option<Duration>,
    /// Channels recorded alongside the vibrometer
    pub extra_channels: Vec<ChannelTag>,
}

impl ScanParameters {
    /// Build parameters from a flat key/value map.
    ///
    /// All missing required keys are reported in one error, then the values are
    /// type-checked and validated.
    pub fn from_map(map: &BTreeMap<String, serde_json::Value>) -> AppResult<Self> {
        let missing: Vec<&str> = REQUIRED_EXPERIMENT_KEYS
            .iter()
            .copied()
            .filter(|key| !map.contains_key(*key))
            .collect();
        if !missing.is_empty() {
            return Err(ScanError::Configuration(format!(
                "missing experiment parameters: {}",
                missing.join(", ")
            )));
        }

        let object: serde_json::Map<String, serde_json::Value> =
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let raw: RawParameters = serde_json::from_value(serde_json::Value::Object(object))
            .map_err(|e| ScanError::Configuration(format!("invalid experiment parameters: {e}")))?;

        let wave_type = raw
            .wave_type
            .parse::<WaveKind>()
            .map_err(ScanError::Configuration)?;

        let params = Self {
            nb_point_x: raw.nb_point_x,
            nb_point_y: raw.nb_point_y,
            step_x: raw.step_x,
            step_y: raw.step_y,
            start_x: raw.start_x,
            start_y: raw.start_y,
            delay_before_measuring: seconds("delay_before_measuring", raw.delay_before_measuring)?,
            samples_per_point: raw.samples_per_point,
            time_division: raw.time_division,
            unit_time_division: raw.unit_time_division,
            unit_volt_division: raw.unit_volt_division,
            channel_sg: raw.channel_sg,
            vibrometer_channel: raw.vibrometer_channel,
            reference_channel: raw.reference_channel,
            trigger_level: raw.trigger_level,
            trigger_delay: raw.trigger_delay,
            trigger_mode: raw.trigger_mode,
            frequency: raw.frequency,
            wave_type,
            arb_register: raw.arb_register,
            burst_count: raw.burst_count,
            pulse_amplitude: raw.pulse_amplitude,
            pulse_offset: raw.pulse_offset,
            pulse_width: raw.pulse_width,
            pulse_delay: raw.pulse_delay,
            volt_division_vibrometer: raw.volt_division_vibrometer,
            volt_division_reference: raw.volt_division_reference,
            feedrate: raw.feedrate,
            configure_settle: seconds("configure_settle", raw.configure_settle)?,
            startup_action: raw.startup_action,
            scan_mode: raw.scan_mode,
            priming_burst: raw.priming_burst,
            motion_timeout: raw
                .motion_timeout
                .map(|t| seconds("motion_timeout", t))
                .transpose()?,
            extra_channels: raw.extra_channels,
        };
        params.validate()?;
        Ok(params)
    }

    /// Check value ranges.
    pub fn validate(&self) -> AppResult<()> {
        if self.nb_point_x == 0 {
            return Err(ScanError::Configuration("nb_point_x must be at least 1".into()));
        }
        if self.samples_per_point == 0 {
            return Err(ScanError::Configuration(
                "samples_per_point must be at least 1".into(),
            ));
        }
        for (name, value) in [
            ("step_x", self.step_x),
            ("step_y", self.step_y),
            ("start_x", self.start_x),
            ("start_y", self.start_y),
            ("trigger_level", self.trigger_level),
            ("pulse_offset", self.pulse_offset),
        ] {
            if !value.is_finite() {
                return Err(ScanError::Configuration(format!("{name} must be finite")));
            }
        }
        for (name, value) in [
            ("time_division", self.time_division),
            ("frequency", self.frequency),
            ("feedrate", self.feedrate),
            ("pulse_amplitude", self.pulse_amplitude),
            ("pulse_width", self.pulse_width),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(ScanError::Configuration(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        if !(self.pulse_delay.is_finite() && self.pulse_delay >= 0.0) {
            return Err(ScanError::Configuration(format!(
                "pulse_delay must be non-negative, got {}",
                self.pulse_delay
            )));
        }
        let mut channels = vec![
            ("vibrometer_channel", self.vibrometer_channel),
            ("reference_channel", self.reference_channel),
        ];
        channels.extend(
            self.extra_channels
                .iter()
                .map(|extra| ("extra_channels", extra.channel)),
        );
        for (name, channel) in channels {
            if !(1..=4).contains(&channel) {
                return Err(ScanError::Configuration(format!(
                    "{name} must be in 1..=4, got {channel}"
                )));
            }
        }
        if !(1..=2).contains(&self.channel_sg) {
            return Err(ScanError::Configuration(format!(
                "channel_sg must be 1 or 2, got {}",
                self.channel_sg
            )));
        }
        Ok(())
    }

    /// Machine coordinates of a grid point.
    pub fn position_of(&self, point: GridPoint) -> (f64, f64) {
        (
            self.start_x + f64::from(point.x_index) * self.step_x,
            self.start_y + f64::from(point.y_index) * self.step_y,
        )
    }

    /// Number of points the traversal visits.
    pub fn point_count(&self) -> u64 {
        u64::from(self.nb_point_x) * u64::from(self.nb_point_y) + 1
    }

    /// Time for the response to cross the recorded window: ten horizontal divisions.
    pub fn propagation_delay(&self) -> Duration {
        let seconds = 10.0 * self.time_division * self.unit_time_division.seconds();
        // whole nanoseconds; the unit factors are not exact in binary
        Duration::from_nanos((seconds * 1e9).round() as u64)
    }

    /// Scale applied to the vibrometer channel.
    pub fn vibrometer_grid(&self) -> GridSettings {
        self.grid_for(self.vibrometer_channel, self.volt_division_vibrometer)
    }

    /// Scale applied to the reference channel.
    pub fn reference_grid(&self) -> GridSettings {
        self.grid_for(self.reference_channel, self.volt_division_reference)
    }

    fn grid_for(&self, channel: u8, volt_division: f64) -> GridSettings {
        GridSettings {
            time_division: self.time_division,
            time_unit: self.unit_time_division,
            volt_division,
            volt_unit: self.unit_volt_division,
            channel,
        }
    }

    /// Pulse output at the excitation frequency.
    pub fn pulse_shape(&self) -> PulseShape {
        PulseShape {
            frequency: self.frequency,
            amplitude: self.pulse_amplitude,
            offset: self.pulse_offset,
            width: self.pulse_width,
            delay: self.pulse_delay,
        }
    }

    /// Trigger condition on the reference channel.
    pub fn trigger(&self) -> TriggerSettings {
        TriggerSettings {
            level: self.trigger_level,
            level_unit: self.unit_volt_division,
            delay: self.trigger_delay,
            delay_unit: self.unit_time_division,
            channel: self.reference_channel,
            mode: self.trigger_mode,
        }
    }
}

fn seconds(name: &str, value: f64) -> AppResult<Duration> {
    if !(value.is_finite() && value >= 0.0) {
        return Err(ScanError::Configuration(format!(
            "{name} must be a non-negative number of seconds, got {value}"
        )));
    }
    Duration::try_from_secs_f64(value).map_err(|e| {
        ScanError::Configuration(format!("{name} is out of range ({value} s): {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn experiment_map() -> BTreeMap<String, serde_json::Value> {
        let value = json!({
            "nb_point_x": 3,
            "nb_point_y": 2,
            "step_x": 1.5,
            "step_y": 2.0,
            "start_x": 10.0,
            "start_y": 20.0,
            "delay_before_measuring": 0.5,
            "samples_per_point": 3,
            "time_division": 5,
            "channel_sg": 1,
            "vibrometer_channel": 2,
            "reference_channel": 3,
            "trigger_level": 100,
            "trigger_delay": 0,
            "trigger_mode": "NORM",
        });
        match value {
            serde_json::Value::Object(map) => map.into_iter().collect(),
            _ => unreachable!(),
        }
    }

    #[test]
    fn defaults_fill_optional_keys() {
        let params = ScanParameters::from_map(&experiment_map()).unwrap();
        assert_eq!(params.frequency, 10_000.0);
        assert_eq!(params.wave_type, WaveKind::Sine);
        assert_eq!(params.unit_time_division, TimeUnit::Ms);
        assert_eq!(params.startup_action, StartupAction::Unlock);
        assert_eq!(params.scan_mode, ScanMode::Synchronous);
        assert_eq!(params.configure_settle, Duration::from_secs(5));
        assert_eq!(params.motion_timeout, None);
        assert!(params.extra_channels.is_empty());
    }

    #[test]
    fn missing_keys_are_reported_together() {
        let mut map = experiment_map();
        map.remove("step_y");
        map.remove("trigger_mode");

        let err = ScanParameters::from_map(&map).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("step_y"), "{msg}");
        assert!(msg.contains("trigger_mode"), "{msg}");
    }

    #[test]
    fn zero_samples_rejected() {
        let mut map = experiment_map();
        map.insert("samples_per_point".into(), json!(0));
        assert!(matches!(
            ScanParameters::from_map(&map),
            Err(ScanError::Configuration(_))
        ));
    }

    #[test]
    fn out_of_range_channel_rejected() {
        let mut map = experiment_map();
        map.insert(
            "extra_channels".into(),
            json!([{ "channel": 7, "tag": "sweep" }]),
        );
        let err = ScanParameters::from_map(&map).unwrap_err();
        assert!(err.to_string().contains("extra_channels"));
    }

    #[test]
    fn grid_point_maps_through_start_and_step() {
        let params = ScanParameters::from_map(&experiment_map()).unwrap();
        let (x, y) = params.position_of(GridPoint::new(2, 1));
        assert!((x - 13.0).abs() < 1e-9);
        assert!((y - 22.0).abs() < 1e-9);
        assert_eq!(params.point_count(), 7);
    }

    #[test]
    fn propagation_delay_is_ten_divisions() {
        let params = ScanParameters::from_map(&experiment_map()).unwrap();
        assert_eq!(params.propagation_delay(), Duration::from_millis(50));
    }

    #[test]
    fn settings_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"

[stage]
port = "/dev/ttyUSB3"
poll_interval = "250ms"

[experiment]
nb_point_x = 4
nb_point_y = 1
step_x = 0.5
step_y = 0.5
start_x = 0
start_y = 0
delay_before_measuring = 1
samples_per_point = 2
time_division = 5
channel_sg = 1
vibrometer_channel = 2
reference_channel = 3
trigger_level = 100
trigger_delay = 0
trigger_mode = "SINGLE"
scan_mode = "pipelined"
"#
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        settings.validate().unwrap();
        assert_eq!(settings.stage.port, "/dev/ttyUSB3");
        assert_eq!(settings.stage.poll_interval, Duration::from_millis(250));
        assert_eq!(settings.stage.baud_rate, 115_200);
        assert_eq!(settings.oscilloscope.port, 1861);

        let params = settings.scan_parameters().unwrap();
        assert_eq!(params.nb_point_x, 4);
        assert_eq!(params.trigger_mode, TriggerMode::Single);
        assert_eq!(params.scan_mode, ScanMode::Pipelined);
    }

    #[test]
    fn invalid_log_level_fails_validation() {
        let mut settings = Settings::default();
        settings.application.log_level = "loud".into();
        assert!(settings.validate().is_err());
    }
}
