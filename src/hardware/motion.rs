//! Asynchronous GRBL motion controller
//!
//! [`MotionController`] owns the [`SerialChannel`] to the stage and runs two
//! background tasks once started:
//!
//! - **command consumer**: pops the FIFO command queue, writes each line and reads its
//!   single response line, logging `ok` at debug, `error` at error and anything else
//!   at info. No retries.
//! - **status poller**: every `poll_interval` sends `?`, parses the status line, updates
//!   the shared motion state, notifies observers and fires the armed position wait
//!   when the stage is within tolerance of the target.
//!
//! Neither loop exits on a transport error; errors are logged and the loop continues
//! until [`MotionController::stop`] is called.
//!
//! # Position waits
//!
//! [`MotionController::move_to`] arms a single-slot wait and returns a [`WaitHandle`].
//! Only one wait can be armed at a time; a second request fails with
//! [`ScanError::DoubleArm`]. The target is always stored in machine coordinates and
//! fired and cleared in the same critical section as the position update.
//!
//! # Example
//!
//! ```rust,ignore
//! let controller = MotionController::new(settings.stage.clone());
//! controller.connect("/dev/ttyACM0").await?;
//! controller.start()?;
//! controller
//!     .move_to(CoordinateFrame::Machine, Some(10.0), Some(5.0), None, 1000.0)?
//!     .wait()
//!     .await?;
//! controller.stop().await?;
//! ```

use crate::config::StageConfig;
use crate::error::{AppResult, ScanError};
use crate::hardware::grbl::{
    self, Axis, CoordinateFrame, Position, ResponseKind, RunState, StatusReport,
};
use crate::hardware::serial::{DynSerial, SerialChannel};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn, Instrument};

/// Capacity of the status broadcast channel.
const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Connection lifecycle of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkState {
    /// No transport open
    Disconnected,
    /// Opening and waking the transport
    Connecting,
    /// Transport open; loops may or may not be running
    Connected,
}

/// Decoded status delivered to observers after every successful poll.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatusUpdate {
    /// Controller state
    pub state: RunState,
    /// Position in the working frame
    pub working: Position,
    /// Position in the machine frame
    pub machine: Position,
}

/// Point-in-time view of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MotionSnapshot {
    /// Connection lifecycle
    pub link: LinkState,
    /// Last reported controller state
    pub run_state: RunState,
    /// Last reported machine position
    pub machine: Position,
    /// Last reported working position
    pub working: Position,
    /// Machine-frame target of the armed wait
    pub target: Option<(f64, f64)>,
}

type StatusCallback = Arc<dyn Fn(&StatusUpdate) + Send + Sync>;

enum QueueItem {
    Command(String),
    /// Wakes a consumer blocked on an empty queue during shutdown.
    Wake,
}

struct ArmedTarget {
    x: f64,
    y: f64,
    generation: u64,
    signal: oneshot::Sender<()>,
}

/// Mutable stage state, written only by the poller (and `zero_working_coordinates`).
struct MotionState {
    machine: Position,
    working_zero: Position,
    run_state: RunState,
    target: Option<ArmedTarget>,
    next_generation: u64,
    /// Set by `stop()`, cleared by `start()`; no wait may be armed in between.
    halted: bool,
}

impl MotionState {
    fn new() -> Self {
        Self {
            machine: Position::default(),
            working_zero: Position::default(),
            run_state: RunState::Unknown,
            target: None,
            next_generation: 0,
            halted: false,
        }
    }

    fn arm(&mut self, x: f64, y: f64) -> AppResult<(u64, oneshot::Receiver<()>)> {
        if self.halted {
            return Err(ScanError::MotionCancelled);
        }
        if let Some(pending) = &self.target {
            return Err(ScanError::DoubleArm {
                x: pending.x,
                y: pending.y,
            });
        }
        let (signal, rx) = oneshot::channel();
        let generation = self.next_generation;
        self.next_generation += 1;
        self.target = Some(ArmedTarget {
            x,
            y,
            generation,
            signal,
        });
        Ok((generation, rx))
    }

    /// Clear the armed wait if it is still the one identified by `generation`.
    fn disarm(&mut self, generation: u64) -> bool {
        if self
            .target
            .as_ref()
            .is_some_and(|t| t.generation == generation)
        {
            self.target = None;
            true
        } else {
            false
        }
    }

    /// Drop any armed wait; its waiter observes cancellation.
    fn disarm_all(&mut self) {
        self.target = None;
    }

    /// Disarm and refuse new waits until the loops are started again.
    fn halt(&mut self) {
        self.halted = true;
        self.target = None;
    }

    fn working(&self) -> Position {
        self.machine.relative_to(&self.working_zero)
    }

    fn apply_report(&mut self, report: &StatusReport, tolerance: f64) -> StatusUpdate {
        self.run_state = report.state;
        self.machine = match report.frame {
            CoordinateFrame::Machine => report.position,
            CoordinateFrame::Working => report.position.offset_by(&self.working_zero),
        };

        let reached = self.target.as_ref().is_some_and(|t| {
            (self.machine.x - t.x).abs() < tolerance && (self.machine.y - t.y).abs() < tolerance
        });
        if reached {
            if let Some(target) = self.target.take() {
                debug!(x = target.x, y = target.y, "Target reached");
                // receiver may already be gone if the handle was dropped mid-fire
                let _ = target.signal.send(());
            }
        }

        StatusUpdate {
            state: self.run_state,
            working: self.working(),
            machine: self.machine,
        }
    }
}

/// Handle on a pending position-reached wait.
///
/// Dropping an unfired handle disarms its target so a later `move_to` can arm again.
pub struct WaitHandle {
    rx: Option<oneshot::Receiver<()>>,
    generation: u64,
    target: (f64, f64),
    state: Arc<Mutex<MotionState>>,
    settled: bool,
}

impl std::fmt::Debug for WaitHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitHandle")
            .field("armed", &self.rx.is_some())
            .field("target", &self.target)
            .finish()
    }
}

impl WaitHandle {
    fn armed(
        rx: oneshot::Receiver<()>,
        generation: u64,
        target: (f64, f64),
        state: Arc<Mutex<MotionState>>,
    ) -> Self {
        Self {
            rx: Some(rx),
            generation,
            target,
            state,
            settled: false,
        }
    }

    fn unarmed(state: Arc<Mutex<MotionState>>) -> Self {
        Self {
            rx: None,
            generation: 0,
            target: (f64::NAN, f64::NAN),
            state,
            settled: true,
        }
    }

    /// Whether this handle tracks a target (both X and Y were given to `move_to`).
    pub fn is_armed(&self) -> bool {
        self.rx.is_some()
    }

    /// Machine-frame target, if armed.
    pub fn target(&self) -> Option<(f64, f64)> {
        self.rx.as_ref().map(|_| self.target)
    }

    /// Wait until the stage reports the target, without a deadline.
    ///
    /// # Errors
    ///
    /// [`ScanError::MotionCancelled`] if the wait was disarmed by `stop()`.
    pub async fn wait(mut self) -> AppResult<()> {
        let Some(rx) = self.rx.as_mut() else {
            return Ok(());
        };
        let result = rx.await;
        self.settled = true;
        result.map_err(|_| ScanError::MotionCancelled)
    }

    /// Wait with a deadline; on expiry the target is disarmed.
    ///
    /// # Errors
    ///
    /// [`ScanError::MotionTimeout`] on expiry, [`ScanError::MotionCancelled`] if the
    /// wait was disarmed by `stop()`.
    pub async fn wait_timeout(mut self, timeout: Duration) -> AppResult<()> {
        let Some(rx) = self.rx.as_mut() else {
            return Ok(());
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(result) => {
                self.settled = true;
                result.map_err(|_| ScanError::MotionCancelled)
            }
            Err(_) => {
                self.state.lock().disarm(self.generation);
                self.settled = true;
                let (x, y) = self.target;
                Err(ScanError::MotionTimeout { x, y, timeout })
            }
        }
    }

    /// Disarm without waiting.
    pub fn cancel(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.settled {
            self.state.lock().disarm(self.generation);
            self.settled = true;
        }
    }
}

impl Drop for WaitHandle {
    fn drop(&mut self) {
        self.release();
    }
}

struct RunningTasks {
    shutdown: watch::Sender<bool>,
    consumer: JoinHandle<mpsc::UnboundedReceiver<QueueItem>>,
    poller: JoinHandle<()>,
}

struct Lifecycle {
    link: LinkState,
    channel: Option<SerialChannel>,
    queue_rx: Option<mpsc::UnboundedReceiver<QueueItem>>,
    tasks: Option<RunningTasks>,
}

/// Thread-safe controller for a GRBL stage.
///
/// All methods take `&self`; share it behind an `Arc`.
pub struct MotionController {
    config: StageConfig,
    state: Arc<Mutex<MotionState>>,
    queue_tx: Mutex<mpsc::UnboundedSender<QueueItem>>,
    lifecycle: Mutex<Lifecycle>,
    status_tx: broadcast::Sender<StatusUpdate>,
    callbacks: Arc<Mutex<Vec<StatusCallback>>>,
}

impl std::fmt::Debug for MotionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MotionController")
            .field("port", &self.config.port)
            .field("link", &self.link_state())
            .finish_non_exhaustive()
    }
}

impl MotionController {
    /// Create a disconnected controller.
    pub fn new(config: StageConfig) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            config,
            state: Arc::new(Mutex::new(MotionState::new())),
            queue_tx: Mutex::new(queue_tx),
            lifecycle: Mutex::new(Lifecycle {
                link: LinkState::Disconnected,
                channel: None,
                queue_rx: Some(queue_rx),
                tasks: None,
            }),
            status_tx,
            callbacks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Stage settings this controller was built with.
    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    /// Open the serial device at `path` and wake the firmware.
    ///
    /// # Errors
    ///
    /// [`ScanError::Connection`] if the device cannot be opened,
    /// [`ScanError::AlreadyRunning`] if the loops are running.
    #[instrument(skip(self), err)]
    pub async fn connect(&self, path: &str) -> AppResult<()> {
        self.begin_connect()?;
        let port =
            match crate::hardware::serial::open_serial_async(path, self.config.baud_rate, "GRBL")
                .await
            {
                Ok(port) => port,
                Err(e) => {
                    self.lifecycle.lock().link = LinkState::Disconnected;
                    return Err(e);
                }
            };
        self.attach(Box::new(port)).await
    }

    /// Use an already-open transport (simulators, tests).
    pub async fn connect_with_port(&self, port: DynSerial) -> AppResult<()> {
        self.begin_connect()?;
        self.attach(port).await
    }

    fn begin_connect(&self) -> AppResult<()> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.tasks.is_some() {
            return Err(ScanError::AlreadyRunning);
        }
        lifecycle.link = LinkState::Connecting;
        Ok(())
    }

    async fn attach(&self, port: DynSerial) -> AppResult<()> {
        let channel = SerialChannel::new(port, self.config.response_timeout);
        if let Err(e) = channel.wake(self.config.wake_delay).await {
            self.lifecycle.lock().link = LinkState::Disconnected;
            return Err(ScanError::Connection(format!("stage did not accept wake-up: {e}")));
        }
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.channel = Some(channel);
        lifecycle.link = LinkState::Connected;
        info!("Stage connected");
        Ok(())
    }

    /// Launch the command consumer and the status poller.
    ///
    /// # Errors
    ///
    /// [`ScanError::NotConnected`] before `connect`, [`ScanError::AlreadyRunning`] if
    /// the loops are already running.
    #[instrument(skip(self), err)]
    pub fn start(&self) -> AppResult<()> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.tasks.is_some() {
            return Err(ScanError::AlreadyRunning);
        }
        let channel = lifecycle.channel.clone().ok_or(ScanError::NotConnected)?;
        let queue_rx = match lifecycle.queue_rx.take() {
            Some(rx) => rx,
            None => {
                // receiver lost with a crashed consumer; start over with a fresh queue
                let (tx, rx) = mpsc::unbounded_channel();
                *self.queue_tx.lock() = tx;
                rx
            }
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        self.state.lock().halted = false;

        let consumer = tokio::spawn(consume_commands(
            channel.clone(),
            queue_rx,
            shutdown_rx.clone(),
        )
        .in_current_span());
        let poller = tokio::spawn(poll_status(
            channel,
            Arc::clone(&self.state),
            self.status_tx.clone(),
            Arc::clone(&self.callbacks),
            self.config.poll_interval,
            self.config.position_tolerance,
            shutdown_rx,
        )
        .in_current_span());

        lifecycle.tasks = Some(RunningTasks {
            shutdown,
            consumer,
            poller,
        });
        info!(poll_interval = ?self.config.poll_interval, "Stage loops started");
        Ok(())
    }

    /// Stop both loops, close the transport and disarm any pending wait.
    ///
    /// Moves issued after this fail with [`ScanError::MotionCancelled`] until the
    /// next `start`. Commands still queued are kept for that `start`.
    #[instrument(skip(self), err)]
    pub async fn stop(&self) -> AppResult<()> {
        let (tasks, channel) = {
            let mut lifecycle = self.lifecycle.lock();
            (lifecycle.tasks.take(), lifecycle.channel.take())
        };
        self.state.lock().halt();

        if let Some(tasks) = tasks {
            let _ = tasks.shutdown.send(true);
            let _ = self.queue_tx.lock().send(QueueItem::Wake);

            match tasks.consumer.await {
                Ok(rx) => self.lifecycle.lock().queue_rx = Some(rx),
                Err(e) => error!(error = %e, "Command consumer ended abnormally"),
            }
            if let Err(e) = tasks.poller.await {
                error!(error = %e, "Status poller ended abnormally");
            }
        }

        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                warn!(error = %e, "Closing stage transport failed");
            }
        }

        self.state.lock().disarm_all();
        self.lifecycle.lock().link = LinkState::Disconnected;
        info!("Stage controller stopped");
        Ok(())
    }

    /// Whether the background loops are running.
    pub fn is_running(&self) -> bool {
        self.lifecycle
            .lock()
            .tasks
            .as_ref()
            .is_some_and(|t| !t.consumer.is_finished() && !t.poller.is_finished())
    }

    /// Connection lifecycle state.
    pub fn link_state(&self) -> LinkState {
        self.lifecycle.lock().link
    }

    /// Append a command to the queue. Never blocks.
    pub fn enqueue(&self, command: impl Into<String>) {
        let command = command.into();
        debug!(%command, "Queued");
        if self.queue_tx.lock().send(QueueItem::Command(command)).is_err() {
            error!("Command queue closed; command dropped");
        }
    }

    /// Relative jog of one axis at the configured jog feed rate.
    pub fn jog(&self, axis: Axis, distance: f64) {
        self.enqueue(grbl::RELATIVE_MODE);
        self.enqueue(grbl::jog(axis, distance, self.config.jog_feedrate));
    }

    /// Absolute move in `frame`.
    ///
    /// When both `x` and `y` are given the returned handle is armed for that point
    /// (converted to machine coordinates); otherwise it completes immediately.
    ///
    /// # Errors
    ///
    /// [`ScanError::DoubleArm`] if another wait is pending,
    /// [`ScanError::MotionCancelled`] after `stop()`. Nothing is enqueued then.
    pub fn move_to(
        &self,
        frame: CoordinateFrame,
        x: Option<f64>,
        y: Option<f64>,
        z: Option<f64>,
        feedrate: f64,
    ) -> AppResult<WaitHandle> {
        let handle = match (x, y) {
            (Some(x), Some(y)) => {
                let mut state = self.state.lock();
                let target = match frame {
                    CoordinateFrame::Machine => (x, y),
                    CoordinateFrame::Working => {
                        (x + state.working_zero.x, y + state.working_zero.y)
                    }
                };
                let (generation, rx) = state.arm(target.0, target.1)?;
                WaitHandle::armed(rx, generation, target, Arc::clone(&self.state))
            }
            _ => WaitHandle::unarmed(Arc::clone(&self.state)),
        };

        self.enqueue(grbl::ABSOLUTE_MODE);
        self.enqueue(grbl::linear_move(frame, x, y, z, feedrate));
        Ok(handle)
    }

    /// Run the homing cycle.
    pub fn home(&self) {
        self.enqueue(grbl::HOME);
    }

    /// Clear an alarm lock.
    pub fn unlock(&self) {
        self.enqueue(grbl::UNLOCK);
    }

    /// Make the current machine position the working origin.
    ///
    /// The capture and the enqueue happen under the state lock so the poller cannot
    /// interleave a position update.
    pub fn zero_working_coordinates(&self) {
        let mut state = self.state.lock();
        state.working_zero = state.machine;
        self.enqueue(grbl::ZERO_WORKING);
    }

    /// Last reported machine position; may be one poll interval old.
    pub fn current_position(&self) -> Position {
        self.state.lock().machine
    }

    /// Last reported position in the working frame.
    pub fn working_position(&self) -> Position {
        self.state.lock().working()
    }

    /// Last reported controller state.
    pub fn run_state(&self) -> RunState {
        self.state.lock().run_state
    }

    /// Consistent view of link, position and armed target.
    pub fn snapshot(&self) -> MotionSnapshot {
        let link = self.link_state();
        let state = self.state.lock();
        MotionSnapshot {
            link,
            run_state: state.run_state,
            machine: state.machine,
            working: state.working(),
            target: state.target.as_ref().map(|t| (t.x, t.y)),
        }
    }

    /// Receive every status update from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.status_tx.subscribe()
    }

    /// Register a callback invoked after every successful status parse.
    ///
    /// Callbacks accumulate; registering one never replaces another.
    pub fn on_status<F>(&self, callback: F)
    where
        F: Fn(&StatusUpdate) + Send + Sync + 'static,
    {
        self.callbacks.lock().push(Arc::new(callback));
    }
}

async fn consume_commands(
    channel: SerialChannel,
    mut queue: mpsc::UnboundedReceiver<QueueItem>,
    mut shutdown: watch::Receiver<bool>,
) -> mpsc::UnboundedReceiver<QueueItem> {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let item = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            item = queue.recv() => item,
        };
        let command = match item {
            Some(QueueItem::Command(command)) => command,
            Some(QueueItem::Wake) => continue,
            None => break,
        };

        match channel.transact(&command).await {
            Ok(response) => match grbl::classify_response(&response) {
                ResponseKind::Ok => debug!(%command, %response, "Command acknowledged"),
                ResponseKind::Error => error!(%command, %response, "Command rejected"),
                ResponseKind::Other => info!(%command, %response, "Command response"),
            },
            Err(e) => warn!(%command, error = %e, "Command exchange failed"),
        }
    }
    debug!("Command consumer exiting");
    queue
}

async fn poll_status(
    channel: SerialChannel,
    state: Arc<Mutex<MotionState>>,
    status_tx: broadcast::Sender<StatusUpdate>,
    callbacks: Arc<Mutex<Vec<StatusCallback>>>,
    interval: Duration,
    tolerance: f64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let line = match channel.query_status().await {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Status query failed");
                continue;
            }
        };
        let report = match grbl::parse_status_line(&line) {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Skipping status tick");
                continue;
            }
        };

        let update = state.lock().apply_report(&report, tolerance);
        // no subscribers is fine
        let _ = status_tx.send(update);
        let observers: Vec<StatusCallback> = callbacks.lock().clone();
        for callback in observers {
            callback(&update);
        }
    }
    debug!("Status poller exiting");
}
