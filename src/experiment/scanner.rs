//! ScanOrchestrator - sequences one raster scan
//!
//! Drives the stage through the serpentine grid, waits for each position-reached
//! signal, fires the excitation source and reads the oscilloscope, collecting every
//! trace into a [`SampleTable`].
//!
//! # State Machine
//!
//! ```text
//! ┌─────────────┐   ┌────────┐   ┌────────────────┐   ┌────────────┐
//! │ Configuring │──▶│ Moving │──▶│ AwaitingSettle │──▶│ Triggering │◀─┐
//! └─────────────┘   └────────┘   └────────────────┘   └─────┬──────┘  │
//!                       ▲                                    ▼         │ next
//!                       │                         ┌─────────────────────┐ sample
//!                       │ next point              │ AwaitingAcquisition │ │
//!                       │                         └──────────┬──────────┘ │
//!                       │                                    ▼            │
//!                       │                              ┌───────────┐      │
//!                       └──────────────────────────────│ Acquiring │──────┘
//!                                                      └─────┬─────┘
//!                                                            ▼ last point
//!                                                      ┌──────────┐
//!                                                      │ Complete │
//!                                                      └──────────┘
//! ```
//!
//! Any error, including an abort, leaves the excitation output disabled before it is
//! returned.
//!
//! # Usage
//!
//! ```rust,ignore
//! let scan = ScanOrchestrator::new(motion, generator, scope, params);
//! let mut progress = scan.subscribe_progress();
//! let abort = scan.abort_handle();
//!
//! tokio::spawn(async move {
//!     while progress.changed().await.is_ok() {
//!         println!("{}", *progress.borrow());
//!     }
//! });
//! let table = scan.run().await?;
//! ```

use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ScanMode, ScanParameters, StartupAction};
use crate::error::{AppResult, ScanError};
use crate::experiment::dataset::{SampleColumn, SampleTable, RESPONSE_TAG};
use crate::experiment::traversal::{Boustrophedon, GridPoint};
use crate::hardware::capabilities::{Acquisition, ExcitationSource, WaveKind, Waveform};
use crate::hardware::grbl::CoordinateFrame;
use crate::hardware::motion::{MotionController, WaitHandle};

/// Phase of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScanPhase {
    /// Not started
    Pending,
    /// Preparing stage and instruments
    Configuring,
    /// Stage travelling to the current point
    Moving,
    /// Waiting for mechanical transients to decay
    AwaitingSettle,
    /// Re-arming the trigger and firing a burst
    Triggering,
    /// Waiting for the response to cross the recorded window
    AwaitingAcquisition,
    /// Reading traces
    Acquiring,
    /// All points recorded
    Complete,
    /// Stopped through the abort handle
    Aborted,
    /// Stopped by an error
    Failed,
}

impl std::fmt::Display for ScanPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanPhase::Pending => write!(f, "pending"),
            ScanPhase::Configuring => write!(f, "configuring"),
            ScanPhase::Moving => write!(f, "moving"),
            ScanPhase::AwaitingSettle => write!(f, "awaiting settle"),
            ScanPhase::Triggering => write!(f, "triggering"),
            ScanPhase::AwaitingAcquisition => write!(f, "awaiting acquisition"),
            ScanPhase::Acquiring => write!(f, "acquiring"),
            ScanPhase::Complete => write!(f, "complete"),
            ScanPhase::Aborted => write!(f, "aborted"),
            ScanPhase::Failed => write!(f, "failed"),
        }
    }
}

impl ScanPhase {
    /// Whether the scan has ended.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanPhase::Complete | ScanPhase::Aborted | ScanPhase::Failed
        )
    }
}

/// Progress snapshot published on every phase change.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScanProgress {
    /// Current phase
    pub phase: ScanPhase,
    /// Grid point being worked on
    pub point: Option<GridPoint>,
    /// Points fully recorded
    pub points_done: u64,
    /// Points in the whole scan
    pub points_total: u64,
}

impl std::fmt::Display for ScanProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}/{}] {}", self.points_done, self.points_total, self.phase)?;
        if let Some(point) = self.point {
            write!(f, " at {point}")?;
        }
        Ok(())
    }
}

/// Cloneable handle that stops a running scan at its next suspension point.
///
/// An aborted orchestrator stays aborted.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    /// Request the abort.
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    /// Whether an abort was requested.
    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }
}

/// One trace read at the current point, not yet committed.
struct Trace {
    ordinal: u32,
    tag: String,
    channel: u8,
    waveform: Waveform,
}

/// Runs a raster scan against a motion controller and two device ports.
pub struct ScanOrchestrator {
    motion: Arc<MotionController>,
    excitation: Arc<dyn ExcitationSource>,
    acquisition: Arc<dyn Acquisition>,
    params: ScanParameters,
    progress_tx: watch::Sender<ScanProgress>,
    abort_tx: Arc<watch::Sender<bool>>,
}

impl ScanOrchestrator {
    /// Create an orchestrator; nothing is sent until [`run`](Self::run).
    pub fn new(
        motion: Arc<MotionController>,
        excitation: Arc<dyn ExcitationSource>,
        acquisition: Arc<dyn Acquisition>,
        params: ScanParameters,
    ) -> Self {
        let (progress_tx, _) = watch::channel(ScanProgress {
            phase: ScanPhase::Pending,
            point: None,
            points_done: 0,
            points_total: params.point_count(),
        });
        let (abort_tx, _) = watch::channel(false);
        Self {
            motion,
            excitation,
            acquisition,
            params,
            progress_tx,
            abort_tx: Arc::new(abort_tx),
        }
    }

    /// Parameters of this scan.
    pub fn params(&self) -> &ScanParameters {
        &self.params
    }

    /// Observe progress.
    pub fn subscribe_progress(&self) -> watch::Receiver<ScanProgress> {
        self.progress_tx.subscribe()
    }

    /// Latest progress snapshot.
    pub fn progress(&self) -> ScanProgress {
        *self.progress_tx.borrow()
    }

    /// Handle for aborting the scan from another task.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            tx: Arc::clone(&self.abort_tx),
        }
    }

    /// Execute the scan and return every recorded trace.
    ///
    /// The excitation output is disabled on every exit path.
    ///
    /// # Errors
    ///
    /// - [`ScanError::DeviceCommand`] if an instrument command fails
    /// - [`ScanError::MotionCancelled`] if the motion controller is stopped mid-scan
    /// - [`ScanError::MotionTimeout`] if `motion_timeout` is set and expires
    /// - [`ScanError::Aborted`] after [`AbortHandle::abort`]
    #[instrument(skip(self), fields(points = self.params.point_count()), err)]
    pub async fn run(&self) -> AppResult<SampleTable> {
        let result = self.execute().await;

        let disabled = self.excitation.set_output(false).await;

        match (result, disabled) {
            (Ok(table), Ok(())) => {
                self.set_phase(ScanPhase::Complete, None);
                info!(run_id = %table.run_id, columns = table.len(), "Scan complete");
                Ok(table)
            }
            (Ok(_), Err(e)) => {
                self.set_phase(ScanPhase::Failed, None);
                error!(error = %format!("{e:#}"), "Could not disable excitation output");
                Err(ScanError::device(e))
            }
            (Err(err), disabled) => {
                if let Err(e) = disabled {
                    error!(error = %format!("{e:#}"), "Could not disable excitation output");
                }
                let phase = if matches!(err, ScanError::Aborted) {
                    ScanPhase::Aborted
                } else {
                    ScanPhase::Failed
                };
                self.set_phase(phase, None);
                warn!(error = %err, "Scan stopped");
                Err(err)
            }
        }
    }

    async fn execute(&self) -> AppResult<SampleTable> {
        self.set_phase(ScanPhase::Configuring, None);
        match self.params.startup_action {
            StartupAction::Unlock => self.motion.unlock(),
            StartupAction::Home => self.motion.home(),
            StartupAction::None => {}
        }
        self.configure_devices().await?;
        self.interruptible(sleep(self.params.configure_settle)).await?;

        let mut table = SampleTable::new();
        info!(run_id = %table.run_id, mode = ?self.params.scan_mode, "Scan started");
        match self.params.scan_mode {
            ScanMode::Synchronous => self.scan_synchronous(&mut table).await?,
            ScanMode::Pipelined => self.scan_pipelined(&mut table).await?,
        }
        Ok(table)
    }

    async fn configure_devices(&self) -> AppResult<()> {
        let p = &self.params;
        let source = &self.excitation;
        source.set_channel(p.channel_sg).await.map_err(ScanError::device)?;
        if p.wave_type == WaveKind::Pulse {
            source
                .set_pulse(p.pulse_shape())
                .await
                .map_err(ScanError::device)?;
        } else {
            source
                .set_wave(p.wave_type, Some(p.arb_register))
                .await
                .map_err(ScanError::device)?;
            source.set_frequency(p.frequency).await.map_err(ScanError::device)?;
        }
        source
            .set_burst_mode(p.burst_count)
            .await
            .map_err(ScanError::device)?;
        source.set_output(true).await.map_err(ScanError::device)?;

        let scope = &self.acquisition;
        scope
            .set_grid(p.vibrometer_grid())
            .await
            .map_err(ScanError::device)?;
        scope
            .set_grid(p.reference_grid())
            .await
            .map_err(ScanError::device)?;
        scope.set_trigger(p.trigger()).await.map_err(ScanError::device)?;
        debug!("Instruments configured");
        Ok(())
    }

    /// Move, wait, measure, store; one point at a time.
    async fn scan_synchronous(&self, table: &mut SampleTable) -> AppResult<()> {
        let grid = Boustrophedon::new(self.params.nb_point_x, self.params.nb_point_y);
        for point in grid {
            let handle = self.issue_move(point)?;
            self.await_arrival(handle).await?;
            self.settle(point).await?;
            let traces = self.measure(point).await?;
            self.commit(table, point, traces);
        }
        Ok(())
    }

    /// Issue the next move as soon as the current point's traces are read, then store
    /// the current point while the stage travels.
    async fn scan_pipelined(&self, table: &mut SampleTable) -> AppResult<()> {
        let mut grid = Boustrophedon::new(self.params.nb_point_x, self.params.nb_point_y);
        let Some(mut current) = grid.next() else {
            return Ok(());
        };
        let mut handle = self.issue_move(current)?;

        loop {
            self.await_arrival(handle).await?;
            self.settle(current).await?;
            let traces = self.measure(current).await?;

            match grid.next() {
                Some(next) => {
                    handle = self.issue_move(next)?;
                    self.commit(table, current, traces);
                    current = next;
                }
                None => {
                    self.commit(table, current, traces);
                    return Ok(());
                }
            }
        }
    }

    fn issue_move(&self, point: GridPoint) -> AppResult<WaitHandle> {
        self.set_phase(ScanPhase::Moving, Some(point));
        let (x, y) = self.params.position_of(point);
        debug!(%point, x, y, "Moving");
        self.motion.move_to(
            CoordinateFrame::Machine,
            Some(x),
            Some(y),
            None,
            self.params.feedrate,
        )
    }

    async fn await_arrival(&self, handle: WaitHandle) -> AppResult<()> {
        let wait = async move {
            match self.params.motion_timeout {
                Some(timeout) => handle.wait_timeout(timeout).await,
                None => handle.wait().await,
            }
        };
        self.interruptible(wait).await?
    }

    async fn settle(&self, point: GridPoint) -> AppResult<()> {
        self.set_phase(ScanPhase::AwaitingSettle, Some(point));
        self.interruptible(sleep(self.params.delay_before_measuring))
            .await?;

        if self.params.priming_burst {
            self.excitation.burst().await.map_err(ScanError::device)?;
            self.interruptible(sleep(self.params.propagation_delay()))
                .await?;
        }
        Ok(())
    }

    async fn measure(&self, point: GridPoint) -> AppResult<Vec<Trace>> {
        let p = &self.params;
        let mut traces = Vec::with_capacity(p.samples_per_point as usize * (1 + p.extra_channels.len()));

        for ordinal in 1..=p.samples_per_point {
            self.set_phase(ScanPhase::Triggering, Some(point));
            self.acquisition
                .set_trigger(p.trigger())
                .await
                .map_err(ScanError::device)?;
            self.excitation.burst().await.map_err(ScanError::device)?;

            self.set_phase(ScanPhase::AwaitingAcquisition, Some(point));
            self.interruptible(sleep(p.propagation_delay())).await?;

            self.set_phase(ScanPhase::Acquiring, Some(point));
            let waveform = self
                .acquisition
                .acquire(true, p.vibrometer_channel)
                .await
                .map_err(ScanError::device)?;
            traces.push(Trace {
                ordinal,
                tag: RESPONSE_TAG.to_string(),
                channel: p.vibrometer_channel,
                waveform,
            });

            for extra in &p.extra_channels {
                let waveform = self
                    .acquisition
                    .acquire(true, extra.channel)
                    .await
                    .map_err(ScanError::device)?;
                traces.push(Trace {
                    ordinal,
                    tag: extra.tag.clone(),
                    channel: extra.channel,
                    waveform,
                });
            }
        }
        Ok(traces)
    }

    fn commit(&self, table: &mut SampleTable, point: GridPoint, traces: Vec<Trace>) {
        let (x, y) = self.params.position_of(point);
        for trace in traces {
            table.push(SampleColumn {
                x,
                y,
                sample_ordinal: trace.ordinal,
                channel_tag: trace.tag,
                channel: trace.channel,
                waveform: trace.waveform,
            });
        }
        self.progress_tx.send_modify(|progress| progress.points_done += 1);
        debug!(%point, "Point recorded");
    }

    fn set_phase(&self, phase: ScanPhase, point: Option<GridPoint>) {
        self.progress_tx.send_modify(|progress| {
            progress.phase = phase;
            if point.is_some() {
                progress.point = point;
            }
        });
    }

    /// Run `fut` unless the scan is aborted first.
    async fn interruptible<F: Future>(&self, fut: F) -> AppResult<F::Output> {
        let mut abort = self.abort_tx.subscribe();
        let aborted = async move {
            loop {
                if *abort.borrow_and_update() {
                    return;
                }
                if abort.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::select! {
            biased;
            _ = aborted => Err(ScanError::Aborted),
            output = fut => Ok(output),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_display_is_lowercase() {
        assert_eq!(ScanPhase::AwaitingAcquisition.to_string(), "awaiting acquisition");
        assert!(ScanPhase::Aborted.is_terminal());
        assert!(!ScanPhase::Moving.is_terminal());
    }

    #[test]
    fn progress_display_includes_point() {
        let progress = ScanProgress {
            phase: ScanPhase::Acquiring,
            point: Some(GridPoint::new(2, 1)),
            points_done: 3,
            points_total: 7,
        };
        assert_eq!(progress.to_string(), "[3/7] acquiring at (2, 1)");
    }

    #[test]
    fn abort_handle_is_shared() {
        let (tx, _) = watch::channel(false);
        let handle = AbortHandle { tx: Arc::new(tx) };
        let clone = handle.clone();
        clone.abort();
        assert!(handle.is_aborted());
    }
}
