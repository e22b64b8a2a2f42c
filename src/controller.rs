//! Measurement session state machine.
//!
//! A [`StreamController`] owns one sensor session end to end: it opens a
//! transport, drives the firmware's command protocol, runs the background
//! reader task while measuring, and fans decoded frames out to the sample
//! window and the event feed.
//!
//! ## Lifecycle
//!
//! | State | Allowed calls |
//! |---|---|
//! | `Disconnected` | `connect` / `attach` |
//! | `Connected` | `start`, `set_gain`, `disconnect` |
//! | `Measuring` | `stop`, `set_gain`, `disconnect` |
//!
//! Calls outside this table fail with [`SensorError::InvalidState`] and leave
//! the session untouched. `disconnect` is accepted in every state and is
//! idempotent.
//!
//! ## The reader task
//!
//! `start` spawns one background task that loops on
//! [`Transport::read_line`](crate::transport::Transport::read_line) with a
//! bounded timeout, decodes each line, and publishes the result. The task is
//! stopped by `stop`, `disconnect`, and (briefly) by a live gain change. When
//! the link itself dies the task emits [`SensorEvent::LinkLost`] followed by
//! `StateChanged(Disconnected)` and exits; the controller notices on its next
//! control call and reports [`SensorError::InvalidState`] from there on.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

use crate::decode::FrameDecoder;
use crate::error::SensorError;
use crate::protocol::{Command, Gain};
use crate::scan::DEFAULT_SCAN_TIMEOUT;
use crate::transport::{BleTransport, SerialTransport, Transport};
use crate::types::{DeviceDescriptor, MeasurementState, SensorEvent, TransportKind};
use crate::window::{SampleWindow, WindowHandle};

type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

// ── Config ────────────────────────────────────────────────────────────────────

/// Tunables for a [`StreamController`].
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Upper bound on a single blocking read inside the reader task. Also
    /// paces how quickly the task notices a shutdown request.
    pub read_timeout: Duration,
    /// Upper bound on establishing a BLE connection. BLE connects routinely
    /// take several seconds when the peripheral sleeps between advertisements.
    pub ble_connect_timeout: Duration,
    /// How many recent frames the sample window retains.
    pub window_capacity: usize,
    /// Buffered events per subscriber before a slow consumer starts lagging.
    pub event_capacity: usize,
    /// Pause after stop/start commands during a live gain change, giving the
    /// firmware time to apply the setting.
    pub settle_delay: Duration,
    /// Scan window used by [`StreamController::connect_first`].
    pub scan_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(1),
            ble_connect_timeout: Duration::from_secs(30),
            window_capacity: 256,
            event_capacity: 256,
            settle_delay: Duration::from_millis(150),
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
        }
    }
}

// ── Session statistics ────────────────────────────────────────────────────────

/// Point-in-time counters for the current session.
///
/// Taken with [`StreamController::stats`]; all counters reset when a new
/// transport is attached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Frames decoded and accepted.
    pub frames: u64,
    /// Lines dropped because they did not decode.
    pub malformed_lines: u64,
    /// Discontinuities observed in the sequence counter.
    pub sequence_gaps: u64,
    /// Total frames presumed lost across all gaps.
    pub missed_frames: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    frames: AtomicU64,
    malformed_lines: AtomicU64,
    sequence_gaps: AtomicU64,
    missed_frames: AtomicU64,
}

impl StatCounters {
    fn snapshot(&self) -> SessionStats {
        SessionStats {
            frames: self.frames.load(Ordering::Relaxed),
            malformed_lines: self.malformed_lines.load(Ordering::Relaxed),
            sequence_gaps: self.sequence_gaps.load(Ordering::Relaxed),
            missed_frames: self.missed_frames.load(Ordering::Relaxed),
        }
    }
}

// ── Reader task ───────────────────────────────────────────────────────────────

struct ReaderTask {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

/// State owned by the background reader task.
struct ReadLoop {
    transport: SharedTransport,
    decoder: FrameDecoder,
    read_timeout: Duration,
    window: WindowHandle,
    events: broadcast::Sender<SensorEvent>,
    link_down: Arc<AtomicBool>,
    stats: Arc<StatCounters>,
    shutdown: watch::Receiver<bool>,
    /// Sequence number of the last accepted frame. `None` right after spawn,
    /// so the first frame never counts as a gap.
    last_seq: Option<u8>,
}

impl ReadLoop {
    async fn run(mut self) {
        debug!("reader task up");
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            // The lock is scoped to the read so control commands can take
            // the transport between reads.
            let read = {
                let mut transport = self.transport.lock().await;
                transport.read_line(self.read_timeout).await
            };
            match read {
                Ok(line) => self.handle_line(&line).await,
                Err(SensorError::Timeout(_)) => continue,
                Err(e) => {
                    warn!("link lost while reading: {e}");
                    self.link_down.store(true, Ordering::SeqCst);
                    let _ = self.events.send(SensorEvent::LinkLost {
                        reason: e.to_string(),
                    });
                    let _ = self
                        .events
                        .send(SensorEvent::StateChanged(MeasurementState::Disconnected));
                    break;
                }
            }
        }
        debug!("reader task down");
    }

    async fn handle_line(&mut self, line: &str) {
        match self.decoder.decode_line(line) {
            Ok(frame) => {
                if let Some(last) = self.last_seq {
                    let expected = last.wrapping_add(1);
                    if frame.seq != expected {
                        let missed = frame.seq.wrapping_sub(expected);
                        self.stats.sequence_gaps.fetch_add(1, Ordering::Relaxed);
                        self.stats
                            .missed_frames
                            .fetch_add(u64::from(missed), Ordering::Relaxed);
                        warn!(
                            "sequence gap: expected {expected}, got {}, missed {missed} frame(s)",
                            frame.seq
                        );
                        let _ = self.events.send(SensorEvent::SequenceGap {
                            expected,
                            got: frame.seq,
                            missed,
                        });
                    }
                }
                self.last_seq = Some(frame.seq);
                let n = self.stats.frames.fetch_add(1, Ordering::Relaxed) + 1;
                if n <= 3 || n % 500 == 0 {
                    debug!("frame #{n}: seq={}", frame.seq);
                }
                self.window.push(frame.clone()).await;
                let _ = self.events.send(SensorEvent::Frame(frame));
            }
            Err(e) => {
                let total = self.stats.malformed_lines.fetch_add(1, Ordering::Relaxed) + 1;
                debug!("dropped undecodable line: {e}");
                let _ = self.events.send(SensorEvent::MalformedLine { total });
            }
        }
    }
}

// ── StreamController ──────────────────────────────────────────────────────────

/// One sensor session: transport, command protocol, reader task, and the
/// published frame window.
///
/// All control methods take `&mut self`, which makes interleaved control
/// calls a compile-time impossibility rather than a runtime race. The cheap
/// read-side handles ([`subscribe`](Self::subscribe),
/// [`window`](Self::window), [`stats`](Self::stats)) are clonable and usable
/// from any task.
pub struct StreamController {
    config: ControllerConfig,
    state: MeasurementState,
    transport: Option<SharedTransport>,
    window: WindowHandle,
    events: broadcast::Sender<SensorEvent>,
    reader: Option<ReaderTask>,
    /// Set by the reader task when the link dies mid-session; consumed by
    /// [`reconcile`](Self::reconcile) on the next control call.
    link_down: Arc<AtomicBool>,
    stats: Arc<StatCounters>,
    gain: Option<Gain>,
}

impl StreamController {
    pub fn new(config: ControllerConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            window: WindowHandle::new(SampleWindow::new(config.window_capacity)),
            events,
            state: MeasurementState::Disconnected,
            transport: None,
            reader: None,
            link_down: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(StatCounters::default()),
            gain: None,
            config,
        }
    }

    // ── Connecting ───────────────────────────────────────────────────────────

    /// Open a transport to a scanned device and bind it to this session.
    ///
    /// Only valid while `Disconnected`. On success the state is `Connected`
    /// and the sample window and counters are reset for the new session.
    pub async fn connect(&mut self, device: &DeviceDescriptor) -> Result<(), SensorError> {
        self.reconcile();
        if self.state != MeasurementState::Disconnected {
            return Err(SensorError::InvalidState {
                operation: "connect",
                state: self.state,
            });
        }
        info!("connecting to {} over {:?}", device.id, device.kind);
        let transport: Box<dyn Transport> = match device.kind {
            TransportKind::Serial => Box::new(SerialTransport::open(&device.id).await?),
            TransportKind::Ble => {
                Box::new(BleTransport::open(device, self.config.ble_connect_timeout).await?)
            }
        };
        self.attach(transport).await
    }

    /// Scan the given link kind and connect to the first matching device.
    ///
    /// Convenience wrapper over [`crate::scan`] plus [`connect`](Self::connect)
    /// with default filters, for the common one-sensor setup.
    pub async fn connect_first(&mut self, kind: TransportKind) -> Result<DeviceDescriptor, SensorError> {
        let device = match kind {
            TransportKind::Serial => {
                crate::scan::scan_usb(&Default::default(), self.config.scan_timeout).await?
            }
            TransportKind::Ble => {
                crate::scan::scan_ble(&Default::default(), self.config.scan_timeout).await?
            }
        };
        self.connect(&device).await?;
        Ok(device)
    }

    /// Bind an already-open transport to this session.
    ///
    /// This is the seam for custom links: anything implementing
    /// [`Transport`] can drive a session. [`connect`](Self::connect) goes
    /// through here too.
    pub async fn attach(&mut self, transport: Box<dyn Transport>) -> Result<(), SensorError> {
        self.reconcile();
        if self.state != MeasurementState::Disconnected {
            return Err(SensorError::InvalidState {
                operation: "attach",
                state: self.state,
            });
        }
        info!("session open over {:?} link", transport.kind());
        self.window.clear().await;
        self.stats = Arc::new(StatCounters::default());
        self.gain = None;
        self.link_down.store(false, Ordering::SeqCst);
        self.transport = Some(Arc::new(Mutex::new(transport)));
        self.set_state(MeasurementState::Connected);
        Ok(())
    }

    // ── Measurement control ──────────────────────────────────────────────────

    /// Begin streaming: send the start command and spawn the reader task.
    pub async fn start(&mut self) -> Result<(), SensorError> {
        self.reconcile();
        if self.state != MeasurementState::Connected {
            return Err(SensorError::InvalidState {
                operation: "start",
                state: self.state,
            });
        }
        self.send_command("start", Command::Start).await?;
        let transport = self.shared_transport("start")?;
        // State first: subscribers must see Measuring before the first frame.
        self.set_state(MeasurementState::Measuring);
        self.spawn_reader(transport);
        Ok(())
    }

    /// Stop streaming: wind the reader task down, then send the stop command.
    ///
    /// The reader is stopped *first* so the stop command's turnaround does
    /// not race a concurrent read on the same link.
    pub async fn stop(&mut self) -> Result<(), SensorError> {
        self.reconcile();
        if self.state != MeasurementState::Measuring {
            return Err(SensorError::InvalidState {
                operation: "stop",
                state: self.state,
            });
        }
        self.quiesce_reader().await;
        if self.link_down.swap(false, Ordering::SeqCst) {
            self.transport = None;
            self.state = MeasurementState::Disconnected;
            return Err(SensorError::LinkLost("link dropped while stopping".into()));
        }
        self.send_command("stop", Command::Stop).await?;
        self.set_state(MeasurementState::Connected);
        Ok(())
    }

    /// Set the analog gain (0..=15).
    ///
    /// While `Connected` this is a single command. While `Measuring` the
    /// stream is paused around the change: reader wound down, stop, settle,
    /// gain, start, settle, reader respawned. The session stays `Measuring`
    /// throughout, and gap tracking restarts with the fresh reader so the
    /// pause itself is not reported as dropped frames.
    pub async fn set_gain(&mut self, gain: u8) -> Result<(), SensorError> {
        let gain = Gain::new(gain)?;
        self.reconcile();
        match self.state {
            MeasurementState::Connected => {
                self.send_command("set_gain", Command::SetGain(gain)).await?;
            }
            MeasurementState::Measuring => {
                self.change_gain_live(gain).await?;
            }
            MeasurementState::Disconnected => {
                return Err(SensorError::InvalidState {
                    operation: "set_gain",
                    state: self.state,
                });
            }
        }
        self.gain = Some(gain);
        Ok(())
    }

    /// Tear the session down. Safe to call in any state, including repeatedly.
    ///
    /// While measuring this stops the reader and sends a best-effort stop
    /// command before closing the transport, so the firmware is not left
    /// streaming into a dead link.
    pub async fn disconnect(&mut self) -> Result<(), SensorError> {
        self.reconcile();
        if self.state == MeasurementState::Disconnected && self.transport.is_none() {
            return Ok(());
        }
        let was_measuring = self.state == MeasurementState::Measuring;
        self.quiesce_reader().await;
        let link_down = self.link_down.swap(false, Ordering::SeqCst);
        if let Some(transport) = self.transport.take() {
            let mut transport = transport.lock().await;
            if was_measuring && !link_down {
                if let Err(e) = transport.write_line(&Command::Stop.line()).await {
                    debug!("stop on disconnect failed: {e}");
                }
            }
            if let Err(e) = transport.close().await {
                debug!("transport close: {e}");
            }
        }
        self.set_state(MeasurementState::Disconnected);
        Ok(())
    }

    // ── Read-side accessors ──────────────────────────────────────────────────

    /// Current session state.
    ///
    /// Reports `Disconnected` as soon as the reader task has flagged a dead
    /// link, even before the next control call reconciles the session.
    pub fn state(&self) -> MeasurementState {
        if self.link_down.load(Ordering::SeqCst) {
            MeasurementState::Disconnected
        } else {
            self.state
        }
    }

    /// Subscribe to the event feed.
    ///
    /// Each receiver sees every event from subscription onward, up to the
    /// configured buffer; slow consumers observe a `Lagged` error rather than
    /// blocking the session.
    pub fn subscribe(&self) -> broadcast::Receiver<SensorEvent> {
        self.events.subscribe()
    }

    /// Handle to the bounded window of recent frames.
    pub fn window(&self) -> WindowHandle {
        self.window.clone()
    }

    /// Counters for the current session.
    pub fn stats(&self) -> SessionStats {
        self.stats.snapshot()
    }

    /// Last gain successfully applied this session, if any.
    pub fn gain(&self) -> Option<Gain> {
        self.gain
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    // ── Internals ────────────────────────────────────────────────────────────

    /// Fold an asynchronous link failure into the session state.
    ///
    /// The reader task cannot touch `self`, so it leaves a flag; every
    /// control method calls this first. The events for the failure were
    /// already published by the reader, so the transition here is silent.
    fn reconcile(&mut self) {
        if self.link_down.swap(false, Ordering::SeqCst) {
            debug!("link was lost since the last control call");
            self.reader = None;
            self.transport = None;
            self.state = MeasurementState::Disconnected;
        }
    }

    fn set_state(&mut self, next: MeasurementState) {
        if self.state != next {
            info!("state: {:?} -> {next:?}", self.state);
            self.state = next;
            let _ = self.events.send(SensorEvent::StateChanged(next));
        }
    }

    fn shared_transport(&self, operation: &'static str) -> Result<SharedTransport, SensorError> {
        self.transport.clone().ok_or(SensorError::InvalidState {
            operation,
            state: self.state,
        })
    }

    /// Send one command line; a write failure tears the session down.
    async fn send_command(
        &mut self,
        operation: &'static str,
        command: Command,
    ) -> Result<(), SensorError> {
        let transport = self.shared_transport(operation)?;
        let line = command.line();
        debug!("sending {line}");
        let result = { transport.lock().await.write_line(&line).await };
        if let Err(e) = result {
            self.fail_link(&e).await;
            return Err(e);
        }
        Ok(())
    }

    fn spawn_reader(&mut self, transport: SharedTransport) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let read_loop = ReadLoop {
            transport,
            decoder: FrameDecoder::new(),
            read_timeout: self.config.read_timeout,
            window: self.window.clone(),
            events: self.events.clone(),
            link_down: self.link_down.clone(),
            stats: self.stats.clone(),
            shutdown: shutdown_rx,
            last_seq: None,
        };
        let handle = tokio::spawn(read_loop.run());
        self.reader = Some(ReaderTask {
            handle,
            shutdown: shutdown_tx,
        });
    }

    /// Stop the reader task and wait for it to finish.
    ///
    /// The task re-checks its shutdown flag after every bounded read, so the
    /// join normally completes within one `read_timeout`. A task that still
    /// has not finished after a grace period is aborted.
    async fn quiesce_reader(&mut self) {
        let Some(ReaderTask {
            mut handle,
            shutdown,
        }) = self.reader.take()
        else {
            return;
        };
        let _ = shutdown.send(true);
        let grace = self.config.read_timeout + Duration::from_millis(500);
        match tokio::time::timeout(grace, &mut handle).await {
            Ok(Ok(())) => debug!("reader task joined"),
            Ok(Err(e)) => warn!("reader task panicked: {e}"),
            Err(_) => {
                warn!("reader task did not stop within {grace:?}, aborting it");
                handle.abort();
            }
        }
    }

    /// Tear the session down after a failed write on the link.
    ///
    /// Callers must not hold the transport lock when calling this.
    async fn fail_link(&mut self, err: &SensorError) {
        warn!("link failed: {err}");
        self.reader = None;
        if let Some(transport) = self.transport.take() {
            transport.lock().await.close().await.ok();
        }
        self.link_down.store(false, Ordering::SeqCst);
        let _ = self.events.send(SensorEvent::LinkLost {
            reason: err.to_string(),
        });
        self.set_state(MeasurementState::Disconnected);
    }

    /// The live gain sequence: pause the stream, apply, resume.
    async fn change_gain_live(&mut self, gain: Gain) -> Result<(), SensorError> {
        info!("changing gain to {gain} while measuring");
        self.quiesce_reader().await;
        if self.link_down.swap(false, Ordering::SeqCst) {
            self.transport = None;
            self.state = MeasurementState::Disconnected;
            return Err(SensorError::LinkLost(
                "link dropped during gain change".into(),
            ));
        }
        let transport = self.shared_transport("set_gain")?;
        let settle = self.config.settle_delay;
        let result = async {
            let mut transport = transport.lock().await;
            transport.write_line(&Command::Stop.line()).await?;
            tokio::time::sleep(settle).await;
            transport.write_line(&Command::SetGain(gain).line()).await?;
            transport.write_line(&Command::Start.line()).await?;
            Ok::<(), SensorError>(())
        }
        .await;
        match result {
            Ok(()) => {
                tokio::time::sleep(settle).await;
                self.spawn_reader(transport);
                Ok(())
            }
            Err(e) => {
                self.fail_link(&e).await;
                Err(e)
            }
        }
    }
}

impl Default for StreamController {
    fn default() -> Self {
        Self::new(ControllerConfig::default())
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        if let Some(reader) = &self.reader {
            reader.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_controller_rejects_start_and_stop() {
        let mut controller = StreamController::default();
        assert_eq!(controller.state(), MeasurementState::Disconnected);

        let err = controller.start().await.unwrap_err();
        assert!(matches!(
            err,
            SensorError::InvalidState {
                operation: "start",
                state: MeasurementState::Disconnected
            }
        ));

        let err = controller.stop().await.unwrap_err();
        assert!(matches!(
            err,
            SensorError::InvalidState {
                operation: "stop",
                state: MeasurementState::Disconnected
            }
        ));
    }

    #[tokio::test]
    async fn gain_value_is_validated_before_session_state() {
        let mut controller = StreamController::default();

        // Out-of-range gain wins over the state error.
        let err = controller.set_gain(16).await.unwrap_err();
        assert!(matches!(err, SensorError::InvalidGain(16)));

        // In-range gain still needs a session.
        let err = controller.set_gain(3).await.unwrap_err();
        assert!(matches!(
            err,
            SensorError::InvalidState {
                operation: "set_gain",
                ..
            }
        ));
        assert_eq!(controller.gain(), None);
    }

    #[tokio::test]
    async fn disconnect_without_a_session_is_a_no_op() {
        let mut controller = StreamController::default();
        controller.disconnect().await.unwrap();
        controller.disconnect().await.unwrap();
        assert_eq!(controller.state(), MeasurementState::Disconnected);
    }

    #[tokio::test]
    async fn fresh_controller_has_empty_window_and_zeroed_stats() {
        let controller = StreamController::new(ControllerConfig {
            window_capacity: 8,
            ..Default::default()
        });
        assert_eq!(controller.stats(), SessionStats::default());
        assert!(controller.window().is_empty().await);
        assert_eq!(controller.window().capacity().await, 8);
    }
}
