//! Device discovery on both links.
//!
//! | Function | Link | Behavior |
//! |---|---|---|
//! | [`scan_usb`] | USB-serial | polls enumeration, returns the first match |
//! | [`scan_all_usb`] | USB-serial | one enumeration pass, all matches |
//! | [`scan_ble`] | Bluetooth LE | scans the full window, then selects one |
//! | [`scan_all_ble`] | Bluetooth LE | scans the full window, all matches |
//!
//! USB scans return as soon as a matching port appears, so plugging the
//! sensor in mid-scan is picked up within one poll interval. BLE scans always
//! run the whole window first: advertisements trickle in, and cutting the
//! scan short at the first packet would make multi-device selection depend on
//! radio timing.
//!
//! When several devices match, the one with the lexicographically smallest
//! platform id wins. That is a stable, deterministic choice across rescans;
//! signal strength is reported in the descriptor but never used for ranking.
//! A pinned id is never substituted: when the named unit is absent, the scan
//! fails instead of connecting to whichever sensor happened to answer.

use std::time::Duration;

use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::Manager;
use log::{debug, info};
use serialport::{SerialPortType, UsbPortInfo};
use uuid::Uuid;

use crate::error::SensorError;
use crate::protocol::{VidPid, DEFAULT_BLE_NAME_PREFIX, DEFAULT_VID_PID, UART_SERVICE_UUID};
use crate::types::{BleEndpoint, DeviceDescriptor, TransportKind};

/// Default scan window for both links.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(10);

/// How often [`scan_usb`] re-enumerates while waiting for a device.
const USB_POLL_INTERVAL: Duration = Duration::from_millis(250);

// ── Filters ───────────────────────────────────────────────────────────────────

/// Match criteria for USB discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbScanFilter {
    /// Vendor/product pair to look for. Defaults to the sensor's own ids.
    pub vid_pid: VidPid,
    /// Restrict to one physical unit by its USB serial-number string.
    pub serial_number: Option<String>,
}

impl Default for UsbScanFilter {
    fn default() -> Self {
        Self {
            vid_pid: DEFAULT_VID_PID,
            serial_number: None,
        }
    }
}

/// Match criteria for BLE discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BleScanFilter {
    /// Advertised-name prefix a peripheral must carry.
    pub name_prefix: String,
    /// Pin selection to one unit by its platform id (compared
    /// case-insensitively). [`scan_ble`] fails with
    /// [`SensorError::DeviceNotFound`] when this id is not among the scan
    /// results.
    pub preferred_id: Option<String>,
}

impl Default for BleScanFilter {
    fn default() -> Self {
        Self {
            name_prefix: DEFAULT_BLE_NAME_PREFIX.to_owned(),
            preferred_id: None,
        }
    }
}

// ── USB ───────────────────────────────────────────────────────────────────────

/// Poll USB enumeration until a matching port appears.
///
/// Returns the match with the smallest port path if several are present, or
/// [`SensorError::DeviceNotFound`] once `timeout` elapses with none.
pub async fn scan_usb(
    filter: &UsbScanFilter,
    timeout: Duration,
) -> Result<DeviceDescriptor, SensorError> {
    info!("scanning USB for {} (up to {timeout:?})", filter.vid_pid);
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(found) = enumerate_usb(filter).await?.into_iter().next() {
            info!("USB scan matched {}", found.id);
            return Ok(found);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(SensorError::DeviceNotFound(timeout));
        }
        tokio::time::sleep(USB_POLL_INTERVAL).await;
    }
}

/// One enumeration pass; every matching port, sorted by port path.
pub async fn scan_all_usb(filter: &UsbScanFilter) -> Result<Vec<DeviceDescriptor>, SensorError> {
    let found = enumerate_usb(filter).await?;
    info!("USB scan: {} port(s) match {}", found.len(), filter.vid_pid);
    Ok(found)
}

async fn enumerate_usb(filter: &UsbScanFilter) -> Result<Vec<DeviceDescriptor>, SensorError> {
    // available_ports() walks sysfs / the registry and can stall on buses
    // with many devices, so it runs off the async threads.
    let ports = tokio::task::spawn_blocking(serialport::available_ports)
        .await
        .map_err(|e| SensorError::ConnectionFailed(format!("port enumeration task: {e}")))?
        .map_err(|e| SensorError::ConnectionFailed(format!("cannot enumerate serial ports: {e}")))?;

    let mut found: Vec<DeviceDescriptor> = ports
        .into_iter()
        .filter_map(|port| match port.port_type {
            SerialPortType::UsbPort(ref info)
                if usb_matches(filter, info.vid, info.pid, info.serial_number.as_deref()) =>
            {
                debug!("USB candidate {} ({:?})", port.port_name, info.product);
                Some(usb_descriptor(&port.port_name, info))
            }
            _ => None,
        })
        .collect();
    found.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(found)
}

fn usb_matches(filter: &UsbScanFilter, vid: u16, pid: u16, serial_number: Option<&str>) -> bool {
    if vid != filter.vid_pid.vid || pid != filter.vid_pid.pid {
        return false;
    }
    match &filter.serial_number {
        Some(wanted) => serial_number == Some(wanted.as_str()),
        None => true,
    }
}

fn usb_descriptor(port_name: &str, info: &UsbPortInfo) -> DeviceDescriptor {
    DeviceDescriptor {
        kind: TransportKind::Serial,
        id: port_name.to_owned(),
        name: info.product.clone(),
        vid: Some(info.vid),
        pid: Some(info.pid),
        serial_number: info.serial_number.clone(),
        rssi: None,
        ble: None,
    }
}

// ── BLE ───────────────────────────────────────────────────────────────────────

/// Scan the full window, then select one matching peripheral.
///
/// With `filter.preferred_id` set, only that exact unit qualifies; otherwise
/// the smallest platform id wins. [`SensorError::DeviceNotFound`] when the
/// window closes with no match, including a pinned unit that never showed up.
pub async fn scan_ble(
    filter: &BleScanFilter,
    timeout: Duration,
) -> Result<DeviceDescriptor, SensorError> {
    let candidates = scan_all_ble(filter, timeout).await?;
    pick_ble(candidates, filter.preferred_id.as_deref())
        .ok_or(SensorError::DeviceNotFound(timeout))
}

/// Scan the full window and return every matching peripheral, sorted by
/// platform id.
///
/// A peripheral matches when its advertised name starts with
/// `filter.name_prefix` and the UART service is among its advertised
/// services. [`BleTransport::open`](crate::transport::BleTransport::open)
/// checks the service again on the real GATT table after connecting.
pub async fn scan_all_ble(
    filter: &BleScanFilter,
    timeout: Duration,
) -> Result<Vec<DeviceDescriptor>, SensorError> {
    let manager = Manager::new()
        .await
        .map_err(|e| SensorError::ConnectionFailed(format!("BLE manager: {e}")))?;
    let adapter = manager
        .adapters()
        .await
        .map_err(|e| SensorError::ConnectionFailed(format!("BLE adapters: {e}")))?
        .into_iter()
        .next()
        .ok_or_else(|| SensorError::ConnectionFailed("no Bluetooth adapter found".into()))?;

    #[cfg(target_os = "macos")]
    wait_for_powered_on(&adapter).await;

    info!(
        "scanning BLE for \"{}*\" ({timeout:?} window)",
        filter.name_prefix
    );
    adapter
        .start_scan(ScanFilter::default())
        .await
        .map_err(|e| SensorError::ConnectionFailed(format!("BLE scan: {e}")))?;
    tokio::time::sleep(timeout).await;
    adapter.stop_scan().await.ok();

    let peripherals = adapter
        .peripherals()
        .await
        .map_err(|e| SensorError::ConnectionFailed(format!("BLE peripherals: {e}")))?;

    let mut found = vec![];
    for p in peripherals {
        let Ok(Some(props)) = p.properties().await else {
            continue;
        };
        let Some(name) = props.local_name else {
            continue;
        };
        if !ble_matches(filter, &name, &props.services) {
            if name.starts_with(&filter.name_prefix) {
                debug!("skipping {name}: UART service not advertised");
            }
            continue;
        }
        let id = p.id().to_string();
        info!("BLE scan: found {name}  id={id}  rssi={:?}", props.rssi);
        found.push(DeviceDescriptor {
            kind: TransportKind::Ble,
            id,
            name: Some(name),
            vid: None,
            pid: None,
            serial_number: None,
            rssi: props.rssi,
            ble: Some(BleEndpoint {
                peripheral: p,
                adapter: adapter.clone(),
            }),
        });
    }
    found.sort_by(|a, b| a.id.cmp(&b.id));
    info!("BLE scan: {} device(s) match", found.len());
    Ok(found)
}

fn ble_matches(filter: &BleScanFilter, name: &str, services: &[Uuid]) -> bool {
    name.starts_with(&filter.name_prefix) && services.contains(&UART_SERVICE_UUID)
}

/// Pick one descriptor from a sorted candidate list.
///
/// A pinned id must match one of the candidates; `None` otherwise, so the
/// caller fails the scan rather than substituting a different sensor.
fn pick_ble(
    candidates: Vec<DeviceDescriptor>,
    preferred_id: Option<&str>,
) -> Option<DeviceDescriptor> {
    match preferred_id {
        Some(wanted) => candidates
            .into_iter()
            .find(|d| d.id.eq_ignore_ascii_case(wanted)),
        None => candidates.into_iter().next(),
    }
}

// ── macOS adapter readiness ───────────────────────────────────────────────────

/// Wait for `CBCentralManager` to reach *poweredOn*.
///
/// Freshly after launch the manager reports an "unknown" state, and starting
/// a scan before it is ready is a silent no-op. Polls for up to 3 s, then
/// proceeds regardless.
#[cfg(target_os = "macos")]
async fn wait_for_powered_on(adapter: &btleplug::platform::Adapter) {
    use btleplug::api::CentralState;
    use log::warn;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        match adapter.adapter_state().await {
            Ok(CentralState::PoweredOn) => {
                debug!("macOS: adapter is PoweredOn");
                break;
            }
            Ok(state) => {
                if tokio::time::Instant::now() >= deadline {
                    warn!("macOS: adapter still in state {state:?} after 3 s, proceeding anyway");
                    break;
                }
                debug!("macOS: adapter state = {state:?}, waiting");
            }
            Err(e) => {
                warn!("macOS: adapter_state() error: {e}");
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    // Let the delegate settle before the first scan call.
    tokio::time::sleep(Duration::from_millis(300)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            kind: TransportKind::Ble,
            id: id.to_owned(),
            name: Some("PS02-LF".into()),
            vid: None,
            pid: None,
            serial_number: None,
            rssi: None,
            ble: None,
        }
    }

    #[test]
    fn pick_takes_the_smallest_id() {
        let picked = pick_ble(
            vec![descriptor("AA:00"), descriptor("BB:00"), descriptor("CC:00")],
            None,
        )
        .unwrap();
        assert_eq!(picked.id, "AA:00");
    }

    #[test]
    fn pick_honors_the_preferred_id_case_insensitively() {
        let picked = pick_ble(
            vec![descriptor("AA:00"), descriptor("BB:00")],
            Some("bb:00"),
        )
        .unwrap();
        assert_eq!(picked.id, "BB:00");
    }

    #[test]
    fn pick_with_an_absent_preferred_id_matches_nothing() {
        // Pinning names one physical unit; a stand-in is never acceptable.
        let picked = pick_ble(
            vec![descriptor("AA:00"), descriptor("BB:00")],
            Some("ZZ:99"),
        );
        assert!(picked.is_none());
    }

    #[test]
    fn pick_on_empty_candidates_is_none() {
        assert!(pick_ble(vec![], None).is_none());
        assert!(pick_ble(vec![], Some("AA:00")).is_none());
    }

    #[test]
    fn ble_filter_requires_the_name_prefix_and_the_uart_service() {
        let filter = BleScanFilter::default();
        assert!(ble_matches(&filter, "PS02-LF-0042", &[UART_SERVICE_UUID]));
        assert!(!ble_matches(&filter, "PS02-LF-0042", &[]));
        assert!(!ble_matches(
            &filter,
            "PS02-LF-0042",
            &[Uuid::from_u128(0x1800)]
        ));
        assert!(!ble_matches(&filter, "OTHER-DEVICE", &[UART_SERVICE_UUID]));
    }

    #[test]
    fn usb_filter_matches_on_ids_and_serial() {
        let mut filter = UsbScanFilter::default();
        assert!(usb_matches(&filter, 0x1915, 0x521A, Some("A1B2C3")));
        assert!(usb_matches(&filter, 0x1915, 0x521A, None));
        assert!(!usb_matches(&filter, 0x0403, 0x6001, Some("A1B2C3")));

        filter.serial_number = Some("A1B2C3".into());
        assert!(usb_matches(&filter, 0x1915, 0x521A, Some("A1B2C3")));
        assert!(!usb_matches(&filter, 0x1915, 0x521A, Some("OTHER")));
        assert!(!usb_matches(&filter, 0x1915, 0x521A, None));
    }
}
