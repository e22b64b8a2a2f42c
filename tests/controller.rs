//! Integration tests for the measurement session state machine.
//!
//! A scripted in-memory transport stands in for the hardware, so the full
//! control path (commands out, data lines in, events and window out) runs
//! exactly as it would against a real sensor, minus the radio.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use ps02_rs::controller::{ControllerConfig, StreamController};
use ps02_rs::error::SensorError;
use ps02_rs::transport::Transport;
use ps02_rs::types::{MeasurementState, SensorEvent, TransportKind};

// ── Scripted transport ────────────────────────────────────────────────────────

enum ScriptItem {
    /// Deliver this line on the next read.
    Line(String),
    /// Fail the next read as a closed link.
    Eof,
}

#[derive(Default)]
struct MockState {
    writes: Vec<String>,
    script: VecDeque<ScriptItem>,
    closed: bool,
}

/// In-memory [`Transport`] driven by a script.
///
/// Reads pop the script front; an empty script behaves like a quiet sensor
/// (the read waits out its timeout). The test side keeps a clone and can
/// append to the script while the session runs.
#[derive(Clone)]
struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    fn push_line(&self, line: &str) {
        self.state
            .lock()
            .unwrap()
            .script
            .push_back(ScriptItem::Line(line.to_owned()));
    }

    fn push_eof(&self) {
        self.state.lock().unwrap().script.push_back(ScriptItem::Eof);
    }

    fn writes(&self) -> Vec<String> {
        self.state.lock().unwrap().writes.clone()
    }

    fn closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn write_line(&mut self, line: &str) -> Result<(), SensorError> {
        self.state.lock().unwrap().writes.push(line.to_owned());
        Ok(())
    }

    async fn read_line(&mut self, timeout: Duration) -> Result<String, SensorError> {
        let next = self.state.lock().unwrap().script.pop_front();
        match next {
            Some(ScriptItem::Line(line)) => Ok(line),
            Some(ScriptItem::Eof) => Err(SensorError::LinkClosed),
            None => {
                tokio::time::sleep(timeout).await;
                Err(SensorError::Timeout(timeout))
            }
        }
    }

    async fn close(&mut self) -> Result<(), SensorError> {
        self.state.lock().unwrap().closed = true;
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Pack a sample pair back into the sensor's 3-byte group encoding.
fn pack_group(v1: i16, v2: i16) -> [u8; 3] {
    let a = (v1 + 2048) as u16;
    let b = (v2 + 2048) as u16;
    [
        (a & 0xFF) as u8,
        (b & 0xFF) as u8,
        (((a >> 8) << 4) | (b >> 8)) as u8,
    ]
}

/// Build a full data line: `SEQ:108-hex-chars`, every sample set to `value`.
fn frame_line(seq: u8, value: i16) -> String {
    let mut payload = Vec::with_capacity(54);
    for _ in 0..18 {
        payload.extend_from_slice(&pack_group(value, value));
    }
    format!("{seq:02X}:{}", hex::encode_upper(payload))
}

fn test_config() -> ControllerConfig {
    ControllerConfig {
        read_timeout: Duration::from_millis(50),
        settle_delay: Duration::from_millis(1),
        window_capacity: 16,
        event_capacity: 64,
        ..Default::default()
    }
}

async fn next_event(rx: &mut broadcast::Receiver<SensorEvent>) -> SensorEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("an event within 2 s")
        .expect("event feed still open")
}

/// Bring a controller up to `Measuring` over a fresh mock.
async fn measuring_session() -> (
    StreamController,
    MockTransport,
    broadcast::Receiver<SensorEvent>,
) {
    let mut session = StreamController::new(test_config());
    let mock = MockTransport::new();
    let mut events = session.subscribe();

    session.attach(Box::new(mock.clone())).await.unwrap();
    session.start().await.unwrap();

    assert_eq!(
        next_event(&mut events).await,
        SensorEvent::StateChanged(MeasurementState::Connected)
    );
    assert_eq!(
        next_event(&mut events).await,
        SensorEvent::StateChanged(MeasurementState::Measuring)
    );
    (session, mock, events)
}

// ── Streaming ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn frames_flow_into_the_window_and_the_event_feed() {
    let (session, mock, mut events) = measuring_session().await;
    mock.push_line(&frame_line(1, 100));
    mock.push_line(&frame_line(2, -100));

    let first = next_event(&mut events).await;
    let SensorEvent::Frame(frame) = first else {
        panic!("expected a frame event, got {first:?}");
    };
    assert_eq!(frame.seq, 1);
    assert_eq!(frame.samples.len(), 36);
    assert!(frame.samples.iter().all(|&s| s == 100));

    let SensorEvent::Frame(frame) = next_event(&mut events).await else {
        panic!("expected a second frame event");
    };
    assert_eq!(frame.seq, 2);

    let snapshot = session.window().snapshot().await;
    assert_eq!(
        snapshot.iter().map(|f| f.seq).collect::<Vec<_>>(),
        vec![1, 2]
    );
    assert_eq!(session.stats().frames, 2);
    assert_eq!(session.state(), MeasurementState::Measuring);
}

#[tokio::test]
async fn a_missing_frame_is_reported_as_one_gap() {
    let (session, mock, mut events) = measuring_session().await;
    mock.push_line(&frame_line(1, 0));
    mock.push_line(&frame_line(2, 0));
    mock.push_line(&frame_line(4, 0));

    assert!(matches!(next_event(&mut events).await, SensorEvent::Frame(f) if f.seq == 1));
    assert!(matches!(next_event(&mut events).await, SensorEvent::Frame(f) if f.seq == 2));
    // The gap announcement precedes the frame that revealed it.
    assert_eq!(
        next_event(&mut events).await,
        SensorEvent::SequenceGap {
            expected: 3,
            got: 4,
            missed: 1
        }
    );
    assert!(matches!(next_event(&mut events).await, SensorEvent::Frame(f) if f.seq == 4));

    // The carrying frame still made it into the window.
    let seqs: Vec<u8> = session.window().snapshot().await.iter().map(|f| f.seq).collect();
    assert_eq!(seqs, vec![1, 2, 4]);
    let stats = session.stats();
    assert_eq!(stats.sequence_gaps, 1);
    assert_eq!(stats.missed_frames, 1);
}

#[tokio::test]
async fn the_sequence_counter_wraps_without_a_gap() {
    let (session, mock, mut events) = measuring_session().await;
    mock.push_line(&frame_line(0xFF, 0));
    mock.push_line(&frame_line(0x00, 0));

    assert!(matches!(next_event(&mut events).await, SensorEvent::Frame(f) if f.seq == 0xFF));
    assert!(matches!(next_event(&mut events).await, SensorEvent::Frame(f) if f.seq == 0x00));
    assert_eq!(session.stats().sequence_gaps, 0);
}

#[tokio::test]
async fn undecodable_lines_are_counted_but_do_not_disturb_the_stream() {
    let (session, mock, mut events) = measuring_session().await;
    mock.push_line(&frame_line(1, 7));
    mock.push_line("not a data line");
    // One hex char short of a full payload.
    let truncated = frame_line(2, 7);
    mock.push_line(&truncated[..truncated.len() - 1]);
    mock.push_line(&frame_line(2, 7));

    assert!(matches!(next_event(&mut events).await, SensorEvent::Frame(f) if f.seq == 1));
    assert_eq!(
        next_event(&mut events).await,
        SensorEvent::MalformedLine { total: 1 }
    );
    assert_eq!(
        next_event(&mut events).await,
        SensorEvent::MalformedLine { total: 2 }
    );
    // No gap: dropped lines do not advance the sequence tracking.
    assert!(matches!(next_event(&mut events).await, SensorEvent::Frame(f) if f.seq == 2));

    let seqs: Vec<u8> = session.window().snapshot().await.iter().map(|f| f.seq).collect();
    assert_eq!(seqs, vec![1, 2]);
    assert_eq!(session.stats().malformed_lines, 2);
    assert_eq!(session.state(), MeasurementState::Measuring);
}

#[tokio::test]
async fn line_noise_between_frames_does_not_end_the_session() {
    let (session, mock, mut events) = measuring_session().await;
    mock.push_line(&frame_line(1, 3));
    // A burst of non-UTF-8 bytes on the wire reaches the reader as a
    // lossily decoded garble, never as a read error.
    mock.push_line("\u{FFFD}\u{FFFD}\0\u{FFFD}x");
    mock.push_line(&frame_line(2, 3));
    mock.push_line(&frame_line(3, 3));

    assert!(matches!(next_event(&mut events).await, SensorEvent::Frame(f) if f.seq == 1));
    assert_eq!(
        next_event(&mut events).await,
        SensorEvent::MalformedLine { total: 1 }
    );
    // The stream keeps flowing past the noise.
    assert!(matches!(next_event(&mut events).await, SensorEvent::Frame(f) if f.seq == 2));
    assert!(matches!(next_event(&mut events).await, SensorEvent::Frame(f) if f.seq == 3));

    assert_eq!(session.state(), MeasurementState::Measuring);
    assert_eq!(session.stats().frames, 3);
    assert_eq!(session.stats().malformed_lines, 1);
}

// ── Control flow ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn stop_winds_the_reader_down_before_the_stop_command() {
    let (mut session, mock, mut events) = measuring_session().await;
    mock.push_line(&frame_line(1, 0));
    assert!(matches!(next_event(&mut events).await, SensorEvent::Frame(f) if f.seq == 1));

    session.stop().await.unwrap();
    assert_eq!(mock.writes(), vec!["S0", "B0"]);
    assert_eq!(session.state(), MeasurementState::Connected);
    assert_eq!(
        next_event(&mut events).await,
        SensorEvent::StateChanged(MeasurementState::Connected)
    );

    // Nothing reads the link anymore: a late line stays in the script.
    mock.push_line(&frame_line(2, 0));
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(session.window().len().await, 1);
    assert_eq!(session.stats().frames, 1);
}

#[tokio::test]
async fn live_gain_change_pauses_applies_and_resumes() {
    let (mut session, mock, mut events) = measuring_session().await;
    mock.push_line(&frame_line(10, 0));
    assert!(matches!(next_event(&mut events).await, SensorEvent::Frame(f) if f.seq == 10));

    session.set_gain(7).await.unwrap();

    // Quiesce, stop, gain, restart, in that wire order.
    assert_eq!(mock.writes(), vec!["S0", "B0", "G7", "S0"]);
    assert_eq!(session.state(), MeasurementState::Measuring);
    assert_eq!(session.gain().map(|g| g.value()), Some(7));

    // The fresh reader starts its own sequence tracking: a wildly different
    // sequence number after the pause is not a gap.
    mock.push_line(&frame_line(42, 0));
    assert!(matches!(next_event(&mut events).await, SensorEvent::Frame(f) if f.seq == 42));
    assert_eq!(session.stats().sequence_gaps, 0);
}

#[tokio::test]
async fn gain_while_connected_is_a_single_command() {
    let mut session = StreamController::new(test_config());
    let mock = MockTransport::new();
    session.attach(Box::new(mock.clone())).await.unwrap();

    session.set_gain(15).await.unwrap();
    session.set_gain(0).await.unwrap();
    assert_eq!(mock.writes(), vec!["GF", "G0"]);
    assert_eq!(session.state(), MeasurementState::Connected);
}

#[tokio::test]
async fn stop_without_a_running_measurement_is_rejected() {
    let mut session = StreamController::new(test_config());
    let mock = MockTransport::new();
    session.attach(Box::new(mock.clone())).await.unwrap();

    let err = session.stop().await.unwrap_err();
    assert!(matches!(
        err,
        SensorError::InvalidState {
            operation: "stop",
            state: MeasurementState::Connected
        }
    ));
    // Rejected before anything went over the wire.
    assert_eq!(session.state(), MeasurementState::Connected);
    assert!(mock.writes().is_empty());
}

#[tokio::test]
async fn attach_is_rejected_while_a_session_is_open() {
    let mut session = StreamController::new(test_config());
    session.attach(Box::new(MockTransport::new())).await.unwrap();

    let err = session
        .attach(Box::new(MockTransport::new()))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SensorError::InvalidState {
            operation: "attach",
            state: MeasurementState::Connected
        }
    ));
}

#[tokio::test]
async fn disconnect_while_measuring_stops_the_firmware_and_closes_the_link() {
    let (mut session, mock, mut events) = measuring_session().await;
    mock.push_line(&frame_line(1, 0));
    assert!(matches!(next_event(&mut events).await, SensorEvent::Frame(f) if f.seq == 1));

    session.disconnect().await.unwrap();
    assert_eq!(mock.writes(), vec!["S0", "B0"]);
    assert!(mock.closed());
    assert_eq!(session.state(), MeasurementState::Disconnected);

    // Idempotent.
    session.disconnect().await.unwrap();
    assert_eq!(session.state(), MeasurementState::Disconnected);
}

// ── Link loss ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn link_loss_mid_stream_surfaces_and_disconnects_the_session() {
    let (mut session, mock, mut events) = measuring_session().await;
    mock.push_line(&frame_line(1, 0));
    mock.push_eof();

    assert!(matches!(next_event(&mut events).await, SensorEvent::Frame(f) if f.seq == 1));
    assert!(matches!(
        next_event(&mut events).await,
        SensorEvent::LinkLost { .. }
    ));
    assert_eq!(
        next_event(&mut events).await,
        SensorEvent::StateChanged(MeasurementState::Disconnected)
    );

    // Observable immediately, before any control call.
    assert_eq!(session.state(), MeasurementState::Disconnected);

    // Control calls now see a disconnected session.
    let err = session.stop().await.unwrap_err();
    assert!(matches!(
        err,
        SensorError::InvalidState {
            operation: "stop",
            state: MeasurementState::Disconnected
        }
    ));

    // The data received before the loss is still there.
    assert_eq!(session.stats().frames, 1);
    assert_eq!(session.window().len().await, 1);
}

#[tokio::test]
async fn a_new_transport_can_be_attached_after_link_loss() {
    let (mut session, mock, mut events) = measuring_session().await;
    mock.push_line(&frame_line(1, 0));
    mock.push_eof();
    assert!(matches!(next_event(&mut events).await, SensorEvent::Frame(f) if f.seq == 1));
    assert!(matches!(
        next_event(&mut events).await,
        SensorEvent::LinkLost { .. }
    ));

    let replacement = MockTransport::new();
    session.attach(Box::new(replacement.clone())).await.unwrap();
    assert_eq!(session.state(), MeasurementState::Connected);

    // A fresh session starts clean.
    assert!(session.window().is_empty().await);
    assert_eq!(session.stats().frames, 0);

    session.start().await.unwrap();
    replacement.push_line(&frame_line(200, 5));
    let frame = loop {
        if let SensorEvent::Frame(f) = next_event(&mut events).await {
            break f;
        }
    };
    assert_eq!(frame.seq, 200);
    assert!(frame.samples.iter().all(|&s| s == 5));
}
