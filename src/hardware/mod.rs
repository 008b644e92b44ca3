//! Hardware layer
//!
//! - [`serial`]: shared transport type and the line-oriented [`serial::SerialChannel`]
//! - [`grbl`]: GRBL command builders and status-report parsing
//! - [`motion`]: the stage controller with its command queue and status poller
//! - [`capabilities`]: traits implemented by the excitation source and the oscilloscope
//! - [`tg2512a`], [`lecroy`]: drivers for the bench instruments
//! - [`mock`], [`mock_serial`]: simulators and scripted ports for tests

pub mod capabilities;
pub mod grbl;
pub mod lecroy;
pub mod mock;
pub mod mock_serial;
pub mod motion;
pub mod serial;
pub mod tg2512a;

pub use capabilities::{Acquisition, ExcitationSource};
pub use motion::{MotionController, WaitHandle};
