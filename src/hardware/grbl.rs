//! GRBL line protocol
//!
//! Command builders and the status-report parser for GRBL-style stage firmware.
//!
//! Commands are newline-terminated ASCII lines. The realtime status query is the
//! single byte `?` and is answered with one line such as
//!
//! ```text
//! <Idle|MPos:10.000,5.000,0.000|FS:0,0>
//! <Run|WPos:1.000,2.000,0.000|FS:500,0>
//! ```
//!
//! See the "Real-time Status Reports" section of the GRBL interface documentation.

use crate::error::{AppResult, ScanError};
use serde::Serialize;
use std::fmt;

/// Switch to absolute distance mode.
pub const ABSOLUTE_MODE: &str = "G90";
/// Switch to relative distance mode.
pub const RELATIVE_MODE: &str = "G91";
/// Start the homing cycle.
pub const HOME: &str = "$H";
/// Clear the alarm lock.
pub const UNLOCK: &str = "$X";
/// Make the current position the origin of the G54 working frame.
pub const ZERO_WORKING: &str = "G10 L20 P1 X0 Y0 Z0";
/// Realtime status query (sent without terminator).
pub const STATUS_QUERY: &str = "?";

/// Controller state from the status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum RunState {
    /// Ready for commands
    Idle,
    /// Executing motion (includes jogging and homing)
    Run,
    /// Feed hold
    Hold,
    /// Locked after a limit hit or reset
    Alarm,
    /// Not yet reported, or a state this crate does not track
    #[default]
    Unknown,
}

impl RunState {
    /// Parse the first field of a status payload (`Idle`, `Hold:0`, ...).
    pub fn from_field(field: &str) -> Self {
        let name = field.split(':').next().unwrap_or_default();
        match name {
            "Idle" => RunState::Idle,
            "Run" | "Jog" | "Home" => RunState::Run,
            "Hold" => RunState::Hold,
            "Alarm" => RunState::Alarm,
            _ => RunState::Unknown,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Idle => "Idle",
            RunState::Run => "Run",
            RunState::Hold => "Hold",
            RunState::Alarm => "Alarm",
            RunState::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Coordinate frame of a move or of a reported position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CoordinateFrame {
    /// Absolute machine coordinates (`G53`, `MPos`)
    Machine,
    /// Coordinates relative to the working origin (`G54`, `WPos`)
    Working,
}

/// Stage axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Axis {
    /// X axis
    X,
    /// Y axis
    Y,
    /// Z axis
    Z,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Axis::X => "X",
            Axis::Y => "Y",
            Axis::Z => "Z",
        })
    }
}

impl std::str::FromStr for Axis {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "X" => Ok(Axis::X),
            "Y" => Ok(Axis::Y),
            "Z" => Ok(Axis::Z),
            other => Err(format!("unknown axis '{other}'")),
        }
    }
}

/// Three-axis position.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Position {
    /// X coordinate
    pub x: f64,
    /// Y coordinate
    pub y: f64,
    /// Z coordinate
    pub z: f64,
}

impl Position {
    /// Position at `(x, y, z)`.
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Component-wise sum.
    pub fn offset_by(&self, other: &Position) -> Position {
        Position::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }

    /// Component-wise difference.
    pub fn relative_to(&self, origin: &Position) -> Position {
        Position::new(self.x - origin.x, self.y - origin.y, self.z - origin.z)
    }
}

/// One decoded status line.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatusReport {
    /// Controller state
    pub state: RunState,
    /// Frame of `position`
    pub frame: CoordinateFrame,
    /// Reported position
    pub position: Position,
}

/// Parse a status line, tolerating text around the bracketed payload.
///
/// # Errors
///
/// [`ScanError::Protocol`] when there is no `<...>` payload, no `MPos`/`WPos` field,
/// or the field does not hold three numbers.
pub fn parse_status_line(line: &str) -> AppResult<StatusReport> {
    let start = line
        .find('<')
        .ok_or_else(|| ScanError::Protocol(format!("no status payload in {line:?}")))?;
    let end = line[start..]
        .find('>')
        .map(|offset| start + offset)
        .ok_or_else(|| ScanError::Protocol(format!("unterminated status payload in {line:?}")))?;
    let payload = &line[start + 1..end];

    let mut fields = payload.split('|');
    let state = RunState::from_field(fields.next().unwrap_or_default());

    let (frame, coords) = fields
        .find_map(|field| {
            if let Some(rest) = field.strip_prefix("MPos:") {
                Some((CoordinateFrame::Machine, rest))
            } else {
                field
                    .strip_prefix("WPos:")
                    .map(|rest| (CoordinateFrame::Working, rest))
            }
        })
        .ok_or_else(|| ScanError::Protocol(format!("no MPos/WPos field in {line:?}")))?;

    let values = coords
        .split(',')
        .take(3)
        .map(|v| v.trim().parse::<f64>())
        .collect::<Result<Vec<f64>, _>>()
        .map_err(|e| ScanError::Protocol(format!("bad coordinate in {line:?}: {e}")))?;
    if values.len() < 3 {
        return Err(ScanError::Protocol(format!(
            "expected three coordinates in {line:?}"
        )));
    }

    Ok(StatusReport {
        state,
        frame,
        position: Position::new(values[0], values[1], values[2]),
    })
}

/// How a command response is reported in the logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// Contains `ok`
    Ok,
    /// Contains `error`
    Error,
    /// Anything else (alarms, messages, banners)
    Other,
}

/// Classify a response line by substring.
pub fn classify_response(line: &str) -> ResponseKind {
    if line.contains("ok") {
        ResponseKind::Ok
    } else if line.contains("error") {
        ResponseKind::Error
    } else {
        ResponseKind::Other
    }
}

/// Absolute linear move in `frame`. Mode switch (`G90`) is issued separately.
pub fn linear_move(
    frame: CoordinateFrame,
    x: Option<f64>,
    y: Option<f64>,
    z: Option<f64>,
    feedrate: f64,
) -> String {
    let mut cmd = String::from(match frame {
        CoordinateFrame::Machine => "G53 G1",
        CoordinateFrame::Working => "G54 G1",
    });
    for (axis, value) in [(Axis::X, x), (Axis::Y, y), (Axis::Z, z)] {
        if let Some(v) = value {
            cmd.push_str(&format!(" {axis}{v:.3}"));
        }
    }
    cmd.push_str(&format!(" F{feedrate}"));
    cmd
}

/// Jog command for one axis; expects relative mode.
pub fn jog(axis: Axis, distance: f64, feedrate: f64) -> String {
    format!("$J={axis}{distance:.3} F{feedrate}")
}
