//! Device Port Capabilities
//!
//! The scan orchestrator talks to its two non-motion instruments only through the
//! traits in this module:
//!
//! - [`ExcitationSource`]: a signal generator that can emit triggered bursts
//! - [`Acquisition`]: a recording instrument that can be armed and read out
//!
//! Concrete transports ([`Tg2512a`](crate::hardware::tg2512a::Tg2512a),
//! [`LecroyScope`](crate::hardware::lecroy::LecroyScope)) and in-process simulators
//! ([`MockSignalGenerator`](crate::hardware::mock::MockSignalGenerator),
//! [`MockOscilloscope`](crate::hardware::mock::MockOscilloscope)) implement them, so a
//! scan can run against real hardware or entirely in memory.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//!
//! # Example
//!
//! ```rust,ignore
//! async fn fire_once(source: &dyn ExcitationSource) -> anyhow::Result<()> {
//!     source.set_channel(1).await?;
//!     source.set_output(true).await?;
//!     source.set_burst_mode(1).await?;
//!     source.burst().await
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Waveform selected on the excitation source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WaveKind {
    /// Sine wave
    Sine,
    /// Square wave
    Square,
    /// Triangle wave
    #[serde(alias = "TRIANGLE")]
    Triang,
    /// Arbitrary waveform from a stored register
    Arb,
    /// Rectangular pulse shaped by [`PulseShape`]
    Pulse,
}

impl WaveKind {
    /// Keyword used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            WaveKind::Sine => "SINE",
            WaveKind::Square => "SQUARE",
            WaveKind::Triang => "TRIANG",
            WaveKind::Arb => "ARB",
            WaveKind::Pulse => "PULSE",
        }
    }
}

impl fmt::Display for WaveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WaveKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SINE" => Ok(WaveKind::Sine),
            "SQUARE" => Ok(WaveKind::Square),
            "TRIANG" | "TRIANGLE" => Ok(WaveKind::Triang),
            "ARB" => Ok(WaveKind::Arb),
            "PULSE" => Ok(WaveKind::Pulse),
            other => Err(format!("unknown wave type '{other}'")),
        }
    }
}

/// Unit suffix for time-per-division and trigger delay values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeUnit {
    /// Seconds
    S,
    /// Milliseconds
    #[default]
    Ms,
    /// Microseconds
    Us,
    /// Nanoseconds
    Ns,
}

impl TimeUnit {
    /// Length of one unit in seconds.
    pub fn seconds(&self) -> f64 {
        match self {
            TimeUnit::S => 1.0,
            TimeUnit::Ms => 1e-3,
            TimeUnit::Us => 1e-6,
            TimeUnit::Ns => 1e-9,
        }
    }

    /// Suffix understood by the oscilloscope.
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeUnit::S => "S",
            TimeUnit::Ms => "MS",
            TimeUnit::Us => "US",
            TimeUnit::Ns => "NS",
        }
    }
}

/// Unit suffix for volts-per-division and trigger level values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VoltUnit {
    /// Volts
    V,
    /// Millivolts
    #[default]
    Mv,
}

impl VoltUnit {
    /// Suffix understood by the oscilloscope.
    pub fn as_str(&self) -> &'static str {
        match self {
            VoltUnit::V => "V",
            VoltUnit::Mv => "MV",
        }
    }
}

/// Trigger sweep mode of the acquisition device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TriggerMode {
    /// Free-running when no trigger arrives
    Auto,
    /// Acquire on every trigger
    #[serde(alias = "NORMAL")]
    Norm,
    /// Acquire once, then stop
    Single,
    /// Stop acquiring
    Stop,
}

impl TriggerMode {
    /// Keyword used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerMode::Auto => "AUTO",
            TriggerMode::Norm => "NORM",
            TriggerMode::Single => "SINGLE",
            TriggerMode::Stop => "STOP",
        }
    }
}

/// One acquired trace, as returned by the recording instrument.
///
/// The orchestrator stores it untouched; interpreting the samples is the caller's job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Waveform {
    /// Raw waveform descriptor block
    pub description: String,
    /// Free-text annotation attached by the instrument
    pub text: String,
    /// Trigger time information
    pub time: String,
    /// Raw ADC samples
    pub samples: Vec<i16>,
}

/// Pulse output, used by impact-style excitation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PulseShape {
    /// Pulse repetition frequency in Hz
    pub frequency: f64,
    /// Amplitude in volts peak-to-peak
    pub amplitude: f64,
    /// DC offset in volts
    pub offset: f64,
    /// Pulse width in seconds
    pub width: f64,
    /// Delay before the pulse starts, in seconds
    pub delay: f64,
}

/// Capability: Excitation
///
/// Signal sources that can be configured and fired on demand.
///
/// # Contract
/// - `set_channel` selects the channel that subsequent commands address
/// - `burst` emits exactly one triggered burst of the configured waveform
/// - `set_output(false)` must leave the source de-energized; the orchestrator calls it
///   on every exit path
#[async_trait]
pub trait ExcitationSource: Send + Sync {
    /// Select the output channel addressed by later commands.
    async fn set_channel(&self, channel: u8) -> Result<()>;

    /// Enable or disable the selected output.
    async fn set_output(&self, enabled: bool) -> Result<()>;

    /// Set the waveform frequency in Hz.
    async fn set_frequency(&self, hz: f64) -> Result<()>;

    /// Select the waveform; `register` names the arbitrary-waveform slot for
    /// [`WaveKind::Arb`].
    async fn set_wave(&self, kind: WaveKind, register: Option<u8>) -> Result<()>;

    /// Select the pulse waveform and shape it.
    async fn set_pulse(&self, shape: PulseShape) -> Result<()>;

    /// Switch to triggered-burst mode with `count` cycles per burst.
    async fn set_burst_mode(&self, count: u32) -> Result<()>;

    /// Emit one burst.
    async fn burst(&self) -> Result<()>;
}

/// Vertical and horizontal scale of one acquisition channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridSettings {
    /// Time per horizontal division
    pub time_division: f64,
    /// Unit of `time_division`
    pub time_unit: TimeUnit,
    /// Voltage per vertical division
    pub volt_division: f64,
    /// Unit of `volt_division`
    pub volt_unit: VoltUnit,
    /// Channel the vertical scale applies to
    pub channel: u8,
}

/// Trigger condition of the acquisition device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerSettings {
    /// Trigger level
    pub level: f64,
    /// Unit of `level`
    pub level_unit: VoltUnit,
    /// Horizontal trigger delay
    pub delay: f64,
    /// Unit of `delay`
    pub delay_unit: TimeUnit,
    /// Trigger source channel
    pub channel: u8,
    /// Sweep mode
    pub mode: TriggerMode,
}

/// Capability: Acquisition
///
/// Recording instruments that capture triggered traces.
///
/// # Contract
/// - `set_trigger` re-arms the trigger condition on the instrument
/// - `acquire(read_only = true, ..)` reads the last captured trace without starting a
///   new arm/wait cycle; `read_only = false` arms, waits for the trigger, then reads
#[async_trait]
pub trait Acquisition: Send + Sync {
    /// Apply horizontal and vertical scale.
    async fn set_grid(&self, grid: GridSettings) -> Result<()>;

    /// Apply the trigger condition.
    async fn set_trigger(&self, trigger: TriggerSettings) -> Result<()>;

    /// Read one trace from `channel`.
    async fn acquire(&self, read_only: bool, channel: u8) -> Result<Waveform>;
}
