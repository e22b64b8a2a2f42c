//! Line-oriented transports over the sensor's two physical links.
//!
//! Both links present the same contract, write a command line and read a
//! data line, so everything above this module is transport-oblivious:
//!
//! | Impl | Link | Notes |
//! |---|---|---|
//! | [`SerialTransport`] | USB-serial, 115200 8N1, CRLF | raw bytes decoded lossily, terminators trimmed |
//! | [`BleTransport`] | Nordic UART service | notifications reassembled into lines, commands translated to 5-byte packets |
//!
//! Reads are always bounded: they fail with [`SensorError::Timeout`] when the
//! wait elapses and with [`SensorError::LinkClosed`] when the channel shuts
//! down underneath the caller.

use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Characteristic, Peripheral as _, WriteType};
use btleplug::platform::Peripheral;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};

use crate::error::SensorError;
use crate::protocol::{
    command_packet_for_line, notification_to_line, SERIAL_BAUD, UART_NOTIFY_CHARACTERISTIC,
    UART_WRITE_CHARACTERISTIC,
};
use crate::types::{BleEndpoint, DeviceDescriptor, TransportKind};

/// Most recent reassembled lines retained while nobody is reading the BLE
/// transport. Older lines are discarded first once the queue is full.
pub const BLE_RX_QUEUE_CAPACITY: usize = 300;

/// Upper bound on GATT service discovery after a BLE connect.
const DISCOVER_TIMEOUT: Duration = Duration::from_secs(15);

// ── Transport trait ───────────────────────────────────────────────────────────

/// Line I/O over one physical link.
///
/// Implementations own their connection; dropping the value releases it,
/// though callers should prefer an explicit [`Transport::close`] so shutdown
/// side effects (modem lines, BLE disconnect) happen deterministically.
#[async_trait]
pub trait Transport: Send {
    /// Write one logical line, including whatever terminator or packet
    /// framing the link requires.
    async fn write_line(&mut self, line: &str) -> Result<(), SensorError>;

    /// Read the next logical line, without its terminator.
    ///
    /// Waits at most `timeout`; fails with [`SensorError::Timeout`] when
    /// nothing complete arrived and [`SensorError::LinkClosed`] when the
    /// channel disconnected.
    async fn read_line(&mut self, timeout: Duration) -> Result<String, SensorError>;

    /// Shut the link down. Best-effort; errors are for logging only.
    async fn close(&mut self) -> Result<(), SensorError>;

    fn kind(&self) -> TransportKind;
}

// ── SerialTransport ───────────────────────────────────────────────────────────

/// USB-serial link at the sensor's fixed 115200 8N1 framing.
pub struct SerialTransport {
    reader: BufReader<SerialStream>,
    path: String,
}

impl SerialTransport {
    /// Open the port, raise the modem-control lines, and flush stale data.
    ///
    /// DTR/RTS are asserted because some USB-UART bridges hold the firmware
    /// in reset until the host raises them; both FIFO directions are cleared
    /// so a previous session's half-written line cannot leak into this one.
    pub async fn open(path: &str) -> Result<Self, SensorError> {
        let mut port = tokio_serial::new(path, SERIAL_BAUD)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| open_error(path, e))?;

        port.write_data_terminal_ready(true)
            .map_err(|e| open_error(path, e))?;
        port.write_request_to_send(true)
            .map_err(|e| open_error(path, e))?;
        port.clear(ClearBuffer::All).map_err(|e| open_error(path, e))?;

        info!("serial port {path} open at {SERIAL_BAUD} baud");
        Ok(Self {
            reader: BufReader::new(port),
            path: path.to_owned(),
        })
    }
}

fn open_error(path: &str, err: impl std::fmt::Display) -> SensorError {
    SensorError::ConnectionFailed(format!("{path}: {err}"))
}

#[async_trait]
impl Transport for SerialTransport {
    async fn write_line(&mut self, line: &str) -> Result<(), SensorError> {
        let port = self.reader.get_mut();
        port.write_all(line.as_bytes()).await?;
        port.write_all(b"\r\n").await?;
        port.flush().await?;
        debug!("serial tx: {line}");
        Ok(())
    }

    async fn read_line(&mut self, timeout: Duration) -> Result<String, SensorError> {
        let mut raw = Vec::new();
        match tokio::time::timeout(timeout, self.reader.read_until(b'\n', &mut raw)).await {
            Err(_) => Err(SensorError::Timeout(timeout)),
            Ok(Ok(0)) => Err(SensorError::LinkClosed),
            Ok(Ok(_)) => Ok(decode_raw_line(&raw)),
            Ok(Err(e)) => Err(e.into()),
        }
    }

    async fn close(&mut self) -> Result<(), SensorError> {
        // Drop the modem lines so the firmware sees a clean hangup.
        let port = self.reader.get_mut();
        port.write_data_terminal_ready(false).ok();
        port.write_request_to_send(false).ok();
        debug!("serial port {} closed", self.path);
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }
}

/// Decode one raw serial line and trim its terminator.
///
/// Lossy on purpose: noise bytes on the wire come out as a garbled line for
/// the frame parser to reject, never as an I/O error.
fn decode_raw_line(raw: &[u8]) -> String {
    let mut line = String::from_utf8_lossy(raw).into_owned();
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    line
}

// ── BleTransport ──────────────────────────────────────────────────────────────

/// Bluetooth LE link over the Nordic UART service.
///
/// A pump task reassembles notification packets into logical lines and feeds
/// a bounded queue; [`Transport::read_line`] drains that queue. A second task
/// watches the adapter's event stream and tears the pump down the moment the
/// peripheral disconnects, so readers observe [`SensorError::LinkClosed`]
/// promptly instead of waiting out their timeout.
pub struct BleTransport {
    peripheral: Peripheral,
    write_char: Characteristic,
    lines: broadcast::Receiver<String>,
    pump: JoinHandle<()>,
    watcher: JoinHandle<()>,
}

impl BleTransport {
    /// Connect to a scanned device and start the notification pump.
    ///
    /// Fails with [`SensorError::ConnectionFailed`] if the connect or service
    /// discovery times out, or if the device turns out not to expose the
    /// UART service (it is disconnected again in that case).
    pub async fn open(
        device: &DeviceDescriptor,
        connect_timeout: Duration,
    ) -> Result<Self, SensorError> {
        let BleEndpoint { peripheral, adapter } = device.ble.clone().ok_or_else(|| {
            SensorError::ConnectionFailed(format!(
                "descriptor {} carries no live BLE endpoint; rescan and retry",
                device.id
            ))
        })?;

        tokio::time::timeout(connect_timeout, peripheral.connect())
            .await
            .map_err(|_| {
                SensorError::ConnectionFailed(format!(
                    "BLE connect to {} timed out after {connect_timeout:?}",
                    device.id
                ))
            })?
            .map_err(|e| SensorError::ConnectionFailed(format!("BLE connect: {e}")))?;

        // BlueZ can report the connection before its GATT cache is populated;
        // discovering too early yields an empty service set.
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;

        tokio::time::timeout(DISCOVER_TIMEOUT, peripheral.discover_services())
            .await
            .map_err(|_| {
                SensorError::ConnectionFailed(format!(
                    "service discovery timed out after {DISCOVER_TIMEOUT:?}"
                ))
            })?
            .map_err(|e| SensorError::ConnectionFailed(format!("service discovery: {e}")))?;

        let chars = peripheral.characteristics();
        let notify_char = chars
            .iter()
            .find(|c| c.uuid == UART_NOTIFY_CHARACTERISTIC)
            .cloned();
        let write_char = chars
            .iter()
            .find(|c| c.uuid == UART_WRITE_CHARACTERISTIC)
            .cloned();
        let (Some(notify_char), Some(write_char)) = (notify_char, write_char) else {
            peripheral.disconnect().await.ok();
            return Err(SensorError::ConnectionFailed(format!(
                "{} does not expose the Nordic UART service",
                device.id
            )));
        };

        peripheral
            .subscribe(&notify_char)
            .await
            .map_err(|e| SensorError::ConnectionFailed(format!("subscribe: {e}")))?;
        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|e| SensorError::ConnectionFailed(format!("notification stream: {e}")))?;
        info!("BLE link to {} up, UART service validated", device.id);

        let (tx, lines) = broadcast::channel::<String>(BLE_RX_QUEUE_CAPACITY);

        // Pump: notification packets → logical lines. Exiting drops `tx`,
        // which closes the queue and surfaces LinkClosed to readers.
        let pump = tokio::spawn(async move {
            let mut skipped: u64 = 0;
            while let Some(notification) = notifications.next().await {
                if notification.uuid != UART_NOTIFY_CHARACTERISTIC {
                    continue;
                }
                match notification_to_line(&notification.value) {
                    Some(line) => {
                        let _ = tx.send(line);
                    }
                    None => {
                        skipped += 1;
                        if skipped <= 3 || skipped % 100 == 0 {
                            debug!(
                                "skipped {skipped} notification(s) with unexpected shape (len={})",
                                notification.value.len()
                            );
                        }
                    }
                }
            }
            debug!("BLE notification stream ended");
        });

        // Watcher: the adapter event stream reports disconnects faster than
        // the notification stream closes.
        let pump_abort = pump.abort_handle();
        let peripheral_id = peripheral.id();
        let watcher = tokio::spawn(async move {
            match adapter.events().await {
                Ok(mut events) => {
                    while let Some(event) = events.next().await {
                        if let CentralEvent::DeviceDisconnected(id) = event {
                            if id == peripheral_id {
                                info!("BLE peripheral {id:?} disconnected");
                                pump_abort.abort();
                                break;
                            }
                        }
                    }
                }
                Err(e) => warn!("cannot watch adapter events: {e}"),
            }
        });

        Ok(Self {
            peripheral,
            write_char,
            lines,
            pump,
            watcher,
        })
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn write_line(&mut self, line: &str) -> Result<(), SensorError> {
        let packet = command_packet_for_line(line).ok_or_else(|| {
            SensorError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{line:?} has no BLE command encoding"),
            ))
        })?;
        self.peripheral
            .write(&self.write_char, &packet, WriteType::WithResponse)
            .await
            .map_err(|e| SensorError::LinkLost(format!("BLE write: {e}")))?;
        debug!("ble tx: {line}");
        Ok(())
    }

    async fn read_line(&mut self, timeout: Duration) -> Result<String, SensorError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.lines.recv()).await {
                Err(_) => return Err(SensorError::Timeout(timeout)),
                Ok(Ok(line)) => return Ok(line),
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(SensorError::LinkClosed)
                }
                Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                    // The queue wrapped while nobody was reading; the oldest
                    // lines are gone but the stream itself is intact.
                    warn!("BLE rx queue overflowed, dropped {n} buffered line(s)");
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), SensorError> {
        self.watcher.abort();
        self.pump.abort();
        if let Err(e) = self.peripheral.disconnect().await {
            debug!("BLE disconnect: {e}");
        }
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Ble
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        self.pump.abort();
        self.watcher.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noise_bytes_come_out_as_a_garbled_line() {
        // 115200-baud UARTs flip bits; the read must survive it.
        let line = decode_raw_line(b"\xFF\x00garbled\r\n");
        assert_eq!(line, "\u{FFFD}\0garbled");
    }

    #[test]
    fn line_terminators_are_trimmed() {
        assert_eq!(decode_raw_line(b"01:ABCD\r\n"), "01:ABCD");
        assert_eq!(decode_raw_line(b"01:ABCD\n"), "01:ABCD");
        assert_eq!(decode_raw_line(b"B0"), "B0");
    }
}
