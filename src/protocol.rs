//! Wire-format constants and command encoders for the PS02 pressure sensor.
//!
//! The sensor speaks one logical line protocol on both of its links:
//!
//! | Direction | Form | Meaning |
//! |---|---|---|
//! | host → device | `S0` | start streaming |
//! | host → device | `B0` | stop streaming |
//! | host → device | `G{X}` | set analog gain to hex nibble `X` (0-F) |
//! | device → host | `<seq_hex>:<108 hex chars>` | one data frame |
//!
//! Over USB-serial the lines are sent verbatim with a CRLF terminator at
//! 115200 baud. Over Bluetooth LE the same protocol rides the Nordic UART
//! service: data frames arrive as 56-byte notification packets (see
//! [`notification_to_line`]) and commands are written as 5-byte packets (see
//! [`Command::ble_packet`]).

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::error::SensorError;

// ── Link parameters ───────────────────────────────────────────────────────────

/// Fixed serial line rate. The firmware does not negotiate.
pub const SERIAL_BAUD: u32 = 115_200;

/// USB vendor:product pair the sensor enumerates as (Nordic nRF52 dongle).
pub const DEFAULT_VID_PID: VidPid = VidPid::new(0x1915, 0x521A);

/// Advertised-name prefix of the sensor's BLE radio.
pub const DEFAULT_BLE_NAME_PREFIX: &str = "PS02-LF";

// ── Frame geometry ────────────────────────────────────────────────────────────

/// Bytes of sample payload per data line.
pub const PAYLOAD_BYTES: usize = 54;

/// Hex characters encoding the payload on the wire.
pub const PAYLOAD_HEX_CHARS: usize = PAYLOAD_BYTES * 2;

/// Signed samples per decoded frame. Each 3-byte group carries two 12-bit
/// values, so 54 bytes always yield 36 samples.
pub const SAMPLES_PER_FRAME: usize = PAYLOAD_BYTES / 3 * 2;

/// Minimum length of a BLE data notification: marker byte, sequence byte,
/// and the 54-byte payload.
pub const BLE_PACKET_LEN: usize = 2 + PAYLOAD_BYTES;

// ── Nordic UART service ───────────────────────────────────────────────────────

/// UART service UUID advertised by the sensor.
///
/// Used to validate a connected peripheral before subscribing; a device
/// without this service is rejected at connect time.
pub const UART_SERVICE_UUID: Uuid = Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E);

/// Notification characteristic the sensor streams data packets on
/// (device → host).
pub const UART_NOTIFY_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E);

/// Write characteristic for host → device command packets.
pub const UART_WRITE_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E);

// ── Gain ──────────────────────────────────────────────────────────────────────

/// A validated amplifier gain setting.
///
/// The device accepts a single hex nibble, so the only way to construct a
/// `Gain` is [`Gain::new`], which rejects values above 15 before any command
/// byte exists to be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gain(u8);

impl Gain {
    pub const MIN: u8 = 0;
    pub const MAX: u8 = 15;

    /// Validate `value` as a gain setting.
    ///
    /// Fails with [`SensorError::InvalidGain`] for values above 15.
    pub fn new(value: u8) -> Result<Self, SensorError> {
        if value > Self::MAX {
            return Err(SensorError::InvalidGain(value));
        }
        Ok(Self(value))
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl fmt::Display for Gain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

/// A control action understood by the sensor firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Begin streaming data frames.
    Start,
    /// Stop streaming.
    Stop,
    /// Change the analog gain. Valid while idle or mid-measurement.
    SetGain(Gain),
}

impl Command {
    /// Encode this command as a protocol line (without terminator).
    ///
    /// ```
    /// # use ps02_rs::protocol::{Command, Gain};
    /// assert_eq!(Command::Start.line(), "S0");
    /// assert_eq!(Command::SetGain(Gain::new(12).unwrap()).line(), "GC");
    /// ```
    pub fn line(&self) -> String {
        match self {
            Command::Start => "S0".to_owned(),
            Command::Stop => "B0".to_owned(),
            Command::SetGain(gain) => format!("G{:X}", gain.value()),
        }
    }

    /// Encode this command as a BLE write packet.
    ///
    /// The firmware expects a fixed 5-byte frame on the UART write
    /// characteristic:
    /// ```text
    /// byte 0 : 0xFE  packet marker
    /// byte 1 : 0x00  reserved
    /// byte 2 : opcode, the ASCII command letter ('S', 'B', 'G')
    /// byte 3 : argument, the gain nibble for 'G', 0 otherwise
    /// byte 4 : 0x00  reserved
    /// ```
    pub fn ble_packet(&self) -> [u8; 5] {
        let (op, arg) = match self {
            Command::Start => (b'S', 0),
            Command::Stop => (b'B', 0),
            Command::SetGain(gain) => (b'G', gain.value()),
        };
        [0xFE, 0x00, op, arg, 0x00]
    }

    /// Parse a protocol line back into a command.
    ///
    /// Accepts exactly the encodings produced by [`Command::line`] (gain
    /// digits are matched case-insensitively). Returns `None` for anything
    /// else, including out-of-range text like `G` without a digit.
    pub fn parse(line: &str) -> Option<Command> {
        match line.as_bytes() {
            b"S0" => Some(Command::Start),
            b"B0" => Some(Command::Stop),
            [b'G', digit] => {
                let n = (*digit as char).to_digit(16)? as u8;
                Gain::new(n).ok().map(Command::SetGain)
            }
            _ => None,
        }
    }
}

/// Map a logical command line to its BLE packet form.
///
/// The BLE transport accepts the same command lines as the serial transport
/// and translates them here; lines that are not valid commands yield `None`.
pub fn command_packet_for_line(line: &str) -> Option<[u8; 5]> {
    Command::parse(line).map(|cmd| cmd.ble_packet())
}

/// Reassemble a raw UART notification packet into a logical data line.
///
/// Packet layout (at least [`BLE_PACKET_LEN`] bytes; longer packets are
/// truncated to the payload region):
/// ```text
/// byte 0      : 0x00 data marker
/// byte 1      : frame sequence number (wraps at 256)
/// bytes 2..56 : 54-byte sample payload
/// ```
///
/// Returns `None` when the packet does not match this shape. The produced
/// line is byte-for-byte what the sensor prints on its serial port.
pub fn notification_to_line(packet: &[u8]) -> Option<String> {
    if packet.len() < BLE_PACKET_LEN || packet[0] != 0x00 {
        return None;
    }
    let seq = packet[1];
    let payload = &packet[2..BLE_PACKET_LEN];
    Some(format!("{seq:02X}:{}", hex::encode_upper(payload)))
}

// ── Device identification ─────────────────────────────────────────────────────

/// A USB vendor/product identifier pair.
///
/// Displays and parses as the conventional four-hex-digit colon-separated
/// form, e.g. `1915:521A`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VidPid {
    pub vid: u16,
    pub pid: u16,
}

impl VidPid {
    pub const fn new(vid: u16, pid: u16) -> Self {
        Self { vid, pid }
    }

    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == vid && self.pid == pid
    }
}

impl fmt::Display for VidPid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}:{:04X}", self.vid, self.pid)
    }
}

impl FromStr for VidPid {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (vid, pid) = s
            .split_once(':')
            .ok_or_else(|| format!("expected VVVV:PPPP, got {s:?}"))?;
        let vid = u16::from_str_radix(vid.trim(), 16)
            .map_err(|_| format!("bad vendor id in {s:?}"))?;
        let pid = u16::from_str_radix(pid.trim(), 16)
            .map_err(|_| format!("bad product id in {s:?}"))?;
        Ok(Self { vid, pid })
    }
}
