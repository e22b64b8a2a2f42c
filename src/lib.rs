//! # ps02-rs
//!
//! Async Rust client for the PS02 low-frequency pressure sensor: device
//! discovery, connection management, the control protocol, and decoding of
//! the streamed measurement frames.
//!
//! ## Links
//!
//! The sensor exposes the same line protocol over two physical links; pick
//! whichever is plugged in:
//!
//! | Link | Discovery | Notes |
//! |---|---|---|
//! | USB-serial | by VID:PID `1915:521A` | 115200 baud 8N1, CRLF-terminated lines |
//! | Bluetooth LE | by name prefix `PS02-LF` | Nordic UART service; packets are reassembled into the same lines |
//!
//! Every data line carries one frame of 36 signed 12-bit pressure samples
//! plus a wrapping sequence counter used for drop detection.
//!
//! ## Quick start
//!
//! ```no_run
//! use ps02_rs::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let device = scan_usb(&UsbScanFilter::default(), DEFAULT_SCAN_TIMEOUT).await?;
//!
//!     let mut session = StreamController::new(ControllerConfig::default());
//!     let mut events = session.subscribe();
//!     session.connect(&device).await?;
//!     session.start().await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         match event {
//!             SensorEvent::Frame(frame) => println!("seq={} {:?}", frame.seq, frame.samples),
//!             SensorEvent::LinkLost { reason } => {
//!                 eprintln!("link lost: {reason}");
//!                 break;
//!             }
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`scan`] | USB and BLE device discovery |
//! | [`controller`] | The session state machine and its background reader task |
//! | [`transport`] | The [`transport::Transport`] trait plus the serial and BLE links |
//! | [`protocol`] | Commands, identifiers, and wire-format helpers |
//! | [`decode`] | Data-line to [`types::Frame`] decoding |
//! | [`window`] | Bounded window over the most recent frames |
//! | [`types`] | Event and data types produced by the client |
//! | [`error`] | The [`error::SensorError`] taxonomy |

pub mod controller;
pub mod decode;
pub mod error;
pub mod protocol;
pub mod scan;
pub mod transport;
pub mod types;
pub mod window;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
///
/// A single glob import covers scanning, connecting, and consuming the
/// measurement stream:
///
/// ```no_run
/// use ps02_rs::prelude::*;
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let devices = scan_all_ble(&BleScanFilter::default(), DEFAULT_SCAN_TIMEOUT).await?;
/// let mut session = StreamController::default();
/// session.connect(&devices[0]).await?;
/// session.start().await?;
/// println!("{:?}", session.window().latest().await);
/// # Ok(())
/// # }
/// ```
pub mod prelude {
    // ── Session ───────────────────────────────────────────────────────────────
    pub use crate::controller::{ControllerConfig, SessionStats, StreamController};

    // ── Discovery ─────────────────────────────────────────────────────────────
    pub use crate::scan::{
        scan_all_ble, scan_all_usb, scan_ble, scan_usb, BleScanFilter, UsbScanFilter,
        DEFAULT_SCAN_TIMEOUT,
    };

    // ── Events and data types ─────────────────────────────────────────────────
    pub use crate::types::{DeviceDescriptor, Frame, MeasurementState, SensorEvent, TransportKind};

    // ── Errors ────────────────────────────────────────────────────────────────
    pub use crate::error::SensorError;

    // ── Transports ────────────────────────────────────────────────────────────
    pub use crate::transport::{BleTransport, SerialTransport, Transport};

    // ── Protocol constants ────────────────────────────────────────────────────
    pub use crate::protocol::{
        Command, Gain, VidPid, DEFAULT_BLE_NAME_PREFIX, DEFAULT_VID_PID, SAMPLES_PER_FRAME,
        SERIAL_BAUD,
    };

    // ── Decoding and the sample window ────────────────────────────────────────
    pub use crate::decode::FrameDecoder;
    pub use crate::window::{SampleWindow, WindowHandle};
}
