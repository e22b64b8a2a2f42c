//! Event and data types produced by the PS02 client.

use btleplug::platform::{Adapter, Peripheral};
use serde::{Deserialize, Serialize};

// ── Frame ─────────────────────────────────────────────────────────────────────

/// One decoded measurement frame, the unit produced from a single data line.
///
/// Serializes as `{"seq":…,"samples":[…]}`, which is the shape forwarded to
/// downstream viewers and exporters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Sequence number emitted by the firmware. Increments by 1 per frame and
    /// wraps at 256; gaps indicate dropped lines.
    pub seq: u8,
    /// Exactly 36 signed pressure samples, each in [-2048, 2047].
    ///
    /// The count and range are enforced by the decoder
    /// ([`crate::decode::FrameDecoder`]); this struct does not re-validate.
    pub samples: Vec<i16>,
}

// ── Transport kind ────────────────────────────────────────────────────────────

/// Which physical link a descriptor or transport uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// USB-serial at 115200 baud.
    Serial,
    /// Bluetooth LE over the Nordic UART service.
    Ble,
}

// ── Measurement state ─────────────────────────────────────────────────────────

/// Session state of a [`crate::controller::StreamController`].
///
/// Transitions are driven exclusively by the controller's control methods
/// plus link loss:
///
/// | From | Via | To |
/// |---|---|---|
/// | Disconnected | `connect` | Connected |
/// | Connected | `start` | Measuring |
/// | Measuring | `stop` | Connected |
/// | any | `disconnect` | Disconnected |
/// | Connected / Measuring | link loss | Disconnected |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeasurementState {
    /// No transport attached. Initial and terminal state of every session.
    Disconnected,
    /// Transport open, not streaming. Commands are accepted.
    Connected,
    /// Streaming: a reader task is consuming lines and filling the window.
    Measuring,
}

// ── Events ────────────────────────────────────────────────────────────────────

/// Everything a [`crate::controller::StreamController`] broadcasts to
/// consumers.
///
/// Obtain a receiver with [`crate::controller::StreamController::subscribe`].
/// The feed is advisory: a slow consumer may observe a lagged receiver, but
/// frame data is always recoverable from the sample window snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorEvent {
    /// A frame was accepted and appended to the sample window.
    Frame(Frame),
    /// The session transitioned to a new state.
    StateChanged(MeasurementState),
    /// Non-consecutive sequence numbers were observed. Advisory only: the
    /// carrying frame was still accepted.
    SequenceGap {
        /// The sequence number that would have been consecutive.
        expected: u8,
        /// The sequence number actually received.
        got: u8,
        /// Modular distance between the two, i.e. frames presumed dropped.
        missed: u8,
    },
    /// An undecodable line was dropped. `total` is the running count for the
    /// session.
    MalformedLine { total: u64 },
    /// The link died mid-session. Always followed by
    /// `StateChanged(Disconnected)`; no further frames will arrive.
    LinkLost { reason: String },
}

// ── Device descriptor ─────────────────────────────────────────────────────────

/// A sensor endpoint found by a scan.
///
/// Returned by the functions in [`crate::scan`]; pass to
/// [`crate::controller::StreamController::connect`] to open a session.
///
/// BLE descriptors keep the live peripheral handle from the scan so that
/// connecting does not need a second scan. That handle does not survive
/// serialization; a deserialized descriptor can identify a device but not
/// connect to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub kind: TransportKind,
    /// Stable platform identifier: the port path for serial devices
    /// (`/dev/ttyACM0`, `COM3`), the platform BLE id (UUID on macOS/Windows,
    /// MAC address on Linux) for Bluetooth devices.
    pub id: String,
    /// Product string (USB) or advertised local name (BLE), when known.
    pub name: Option<String>,
    /// USB vendor id. `None` for BLE devices.
    pub vid: Option<u16>,
    /// USB product id. `None` for BLE devices.
    pub pid: Option<u16>,
    /// USB serial-number string, when the bridge reports one.
    pub serial_number: Option<String>,
    /// Signal strength at scan time. BLE only.
    pub rssi: Option<i16>,
    #[serde(skip)]
    pub(crate) ble: Option<BleEndpoint>,
}

/// Live BLE handles captured at scan time.
///
/// The adapter is kept alongside the peripheral so the transport can watch
/// for disconnect events on the adapter that actually discovered the device.
#[derive(Debug, Clone)]
pub(crate) struct BleEndpoint {
    pub(crate) peripheral: Peripheral,
    pub(crate) adapter: Adapter,
}
