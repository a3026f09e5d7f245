//! BLE/GATT transport: connect to the DFU peer, trigger Buttonless DFU if
//! the target is still running application firmware, and reconnect to the
//! bootloader it reboots into. `btleplug`'s API is async; the rest of this
//! crate is single-threaded and blocking, so every call here is driven
//! through a private single-threaded Tokio runtime via `block_on`.

use std::time::Duration;

use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, ValueNotification,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::transport::Transport;

const DFU_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000fe59_0000_1000_8000_00805f9b34fb);
const DFU_CONTROL_UUID: Uuid = Uuid::from_u128(0x8ec90001_f315_4f60_9fb8_838830daea50);
const DFU_DATA_UUID: Uuid = Uuid::from_u128(0x8ec90002_f315_4f60_9fb8_838830daea50);
const DFU_BUTTONLESS_UUID: Uuid = Uuid::from_u128(0x8ec90003_f315_4f60_9fb8_838830daea50);

const CONNECT_NORMAL_TRIES: u32 = 3;
const CONNECT_DFUTARG_TRIES: u32 = 10;
const RETRY_DELAY: Duration = Duration::from_secs(5);
const NOTIFICATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Every nRF DFU BLE bootloader advertises this fixed MTU; there is no
/// wire negotiation like the serial transport's `MTU_GET`.
const BLE_MTU: u16 = 244;

/// A Bluetooth device address plus the addressing scheme it was
/// discovered under, carried through the buttonless -> DfuTarg handoff.
#[derive(Debug, Clone, Copy)]
pub struct BleAddress {
    pub bytes: [u8; 6],
    pub kind: btleplug::api::AddressType,
}

impl BleAddress {
    pub fn new(bytes: [u8; 6], address_type: crate::config::BleAddressType) -> Self {
        use crate::config::BleAddressType;
        let kind = match address_type {
            // btleplug has no "unknown" address type; connecting by scan
            // match (see `find_by_address`) works regardless, so default
            // to `Public` here purely for the `Debug` trail this carries.
            BleAddressType::Public | BleAddressType::Unknown => {
                btleplug::api::AddressType::Public
            }
            BleAddressType::Random => btleplug::api::AddressType::Random,
        };
        Self { bytes, kind }
    }

    fn bumped(mut self) -> Self {
        // The bootloader re-enumerates under MAC[0]+1 once it reboots out
        // of the application image.
        self.bytes[0] = self.bytes[0].wrapping_add(1);
        self
    }

    fn to_btleplug(self) -> btleplug::api::BDAddr {
        let [a, b, c, d, e, f] = self.bytes;
        let mac = format!("{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{f:02X}");
        mac.parse().expect("six-byte MAC always formats to a valid BDAddr")
    }
}

pub struct BleTransport {
    rt: tokio::runtime::Runtime,
    peripheral: Peripheral,
    control: Characteristic,
    data: Characteristic,
    notifications: std::pin::Pin<Box<dyn futures::Stream<Item = ValueNotification> + Send>>,
    /// Address this session actually connected under (post `MAC[0]+1` bump
    /// if the buttonless trigger fired). The orchestrator needs this to
    /// reconnect to the same bootloader after updating the SoftDevice and
    /// Bootloader, which resets the device.
    pub address: BleAddress,
}

impl BleTransport {
    /// Connect directly to an already-bootloader-mode device (the `serial`
    /// equivalent of "just open the port"). Use [`enter_dfu_and_connect`]
    /// when the device may still be running application firmware with the
    /// Buttonless DFU service.
    pub fn connect(interface: &str, address: BleAddress) -> Result<Self> {
        let rt = new_runtime()?;
        let (peripheral, control, data, notifications) =
            rt.block_on(connect_and_discover(interface, address, CONNECT_NORMAL_TRIES))?;
        Ok(Self { rt, peripheral, control, data, notifications, address })
    }

    /// Reconnect to the bootloader at `address` after it has disconnected
    /// (e.g. following a SoftDevice+Bootloader update that resets the
    /// device). Uses the DfuTarg retry budget since the bootloader may take
    /// a moment to re-enumerate.
    pub fn reconnect(interface: &str, address: BleAddress) -> Result<Self> {
        let rt = new_runtime()?;
        let (peripheral, control, data, notifications) =
            rt.block_on(connect_and_discover(interface, address, CONNECT_DFUTARG_TRIES))?;
        Ok(Self { rt, peripheral, control, data, notifications, address })
    }

    /// Full entry sequence: connect to `address`, trigger Buttonless DFU if
    /// present, then reconnect to the DfuTarg bootloader under `MAC[0]+1`.
    /// If the device already exposes the DFU control/data characteristics
    /// directly, skip the buttonless trigger — it is already in the
    /// bootloader.
    pub fn enter_dfu_and_connect(interface: &str, address: BleAddress) -> Result<Self> {
        let rt = new_runtime()?;
        let (final_address, (peripheral, control, data, notifications)) =
            rt.block_on(enter_dfu(interface, address))?;
        Ok(Self { rt, peripheral, control, data, notifications, address: final_address })
    }
}

fn new_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Ble(format!("could not start async runtime: {e}")))
}

/// Resolve `interface` to an adapter. btleplug exposes no stable way to
/// select a Linux `hciN` device by name across platforms, so, like
/// `lxndrd-nrfdfu-ble`'s `transport_btleplug.rs`, this just takes the
/// first adapter the platform backend reports; `interface` is accepted for
/// CLI symmetry with the serial transport's `--port`.
async fn adapter(interface: &str) -> Result<Adapter> {
    let manager = Manager::new().await.map_err(|e| Error::Ble(e.to_string()))?;
    let adapters = manager.adapters().await.map_err(|e| Error::Ble(e.to_string()))?;
    adapters.into_iter().next().ok_or_else(|| {
        Error::Ble(format!("no BLE adapter available (requested '{interface}')"))
    })
}

async fn find_by_address(central: &Adapter, addr: btleplug::api::BDAddr) -> Result<Peripheral> {
    central
        .start_scan(ScanFilter { services: vec![DFU_SERVICE_UUID] })
        .await
        .map_err(|e| Error::Ble(e.to_string()))?;
    let mut events = central.events().await.map_err(|e| Error::Ble(e.to_string()))?;
    while let Some(event) = events.next().await {
        if let btleplug::api::CentralEvent::DeviceDiscovered(id) = event {
            if let Ok(p) = central.peripheral(&id).await {
                if let Ok(Some(props)) = p.properties().await {
                    if props.address == addr {
                        central.stop_scan().await.ok();
                        return Ok(p);
                    }
                }
            }
        }
    }
    Err(Error::Ble("scan stream ended before device was found".into()))
}

async fn retry_connect(
    interface: &str,
    addr: btleplug::api::BDAddr,
    tries: u32,
) -> Result<Peripheral> {
    let mut attempt = 0;
    loop {
        if attempt > 0 {
            warn!("retry connecting to {addr} (attempt {attempt})");
            tokio::time::sleep(RETRY_DELAY).await;
        }
        let central = adapter(interface).await?;
        match find_by_address(&central, addr).await {
            Ok(p) => match p.connect().await {
                Ok(()) => return Ok(p),
                Err(e) => debug!("connect failed: {e}"),
            },
            Err(e) => debug!("scan failed: {e}"),
        }
        attempt += 1;
        if attempt >= tries {
            return Err(Error::Ble(format!("gave up connecting to {addr} after {attempt} tries")));
        }
    }
}

async fn characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or(Error::Ble("characteristic not found".into()))
}

type Discovered = (
    Peripheral,
    Characteristic,
    Characteristic,
    std::pin::Pin<Box<dyn futures::Stream<Item = ValueNotification> + Send>>,
);

async fn connect_and_discover(interface: &str, address: BleAddress, tries: u32) -> Result<Discovered> {
    let peripheral = retry_connect(interface, address.to_btleplug(), tries).await?;
    peripheral.discover_services().await.map_err(|e| Error::Ble(e.to_string()))?;

    let control = characteristic(&peripheral, DFU_CONTROL_UUID).await?;
    let data = characteristic(&peripheral, DFU_DATA_UUID).await?;
    peripheral.subscribe(&control).await.map_err(|e| Error::Ble(e.to_string()))?;
    let notifications = peripheral.notifications().await.map_err(|e| Error::Ble(e.to_string()))?;

    info!("DFU characteristics found");
    Ok((peripheral, control, data, notifications))
}

async fn enter_dfu(interface: &str, address: BleAddress) -> Result<(BleAddress, Discovered)> {
    let peripheral = retry_connect(interface, address.to_btleplug(), CONNECT_NORMAL_TRIES).await?;
    peripheral.discover_services().await.map_err(|e| Error::Ble(e.to_string()))?;

    if characteristic(&peripheral, DFU_BUTTONLESS_UUID).await.is_err() {
        // No Buttonless service: assume we are already talking to DfuTarg.
        info!("device already is in bootloader");
        let control = characteristic(&peripheral, DFU_CONTROL_UUID).await?;
        let data = characteristic(&peripheral, DFU_DATA_UUID).await?;
        peripheral.subscribe(&control).await.map_err(|e| Error::Ble(e.to_string()))?;
        let notifications = peripheral.notifications().await.map_err(|e| Error::Ble(e.to_string()))?;
        return Ok((address, (peripheral, control, data, notifications)));
    }

    let buttonless = characteristic(&peripheral, DFU_BUTTONLESS_UUID).await?;
    peripheral.subscribe(&buttonless).await.map_err(|e| Error::Ble(e.to_string()))?;
    let mut notifications = peripheral.notifications().await.map_err(|e| Error::Ble(e.to_string()))?;

    info!("entering DFU bootloader");
    peripheral
        .write(&buttonless, &[0x01], WriteType::WithResponse)
        .await
        .map_err(|e| Error::Ble(e.to_string()))?;

    let ack = tokio::time::timeout(NOTIFICATION_TIMEOUT, async {
        while let Some(ntf) = notifications.next().await {
            if ntf.uuid == buttonless.uuid {
                return Some(ntf.value);
            }
        }
        None
    })
    .await
    .map_err(|_| Error::Timeout("buttonless DFU confirmation"))?
    .ok_or(Error::Ble("buttonless notification stream ended".into()))?;

    if ack.get(2) != Some(&0x01) {
        return Err(Error::Ble("unexpected buttonless response".into()));
    }

    // The device resets itself into the bootloader and drops the link on
    // its own; force-disconnecting here would race the reset and can leave
    // it in a half-torn-down state, so wait for its disconnect instead.
    let peripheral_id = peripheral.id();
    let central = adapter(interface).await?;
    let mut central_events = central.events().await.map_err(|e| Error::Ble(e.to_string()))?;
    tokio::time::timeout(NOTIFICATION_TIMEOUT, async {
        while let Some(event) = central_events.next().await {
            if let btleplug::api::CentralEvent::DeviceDisconnected(id) = event {
                if id == peripheral_id {
                    return;
                }
            }
        }
    })
    .await
    .map_err(|_| Error::Timeout("bootloader disconnect"))?;

    let dfu_targ = address.bumped();
    let discovered = connect_and_discover(interface, dfu_targ, CONNECT_DFUTARG_TRIES).await?;
    Ok((dfu_targ, discovered))
}

impl Transport for BleTransport {
    fn send_request(&mut self, bytes: &[u8]) -> Result<()> {
        let control = self.control.clone();
        let peripheral = self.peripheral.clone();
        let bytes = bytes.to_vec();
        self.rt.block_on(async move {
            peripheral
                .write(&control, &bytes, WriteType::WithResponse)
                .await
                .map_err(|e| Error::Ble(e.to_string()))
        })
    }

    fn send_data(&mut self, bytes: &[u8]) -> Result<()> {
        let data_char = self.data.clone();
        let peripheral = self.peripheral.clone();
        let bytes = bytes.to_vec();
        self.rt.block_on(async move {
            for chunk in bytes.chunks(BLE_MTU as usize) {
                peripheral
                    .write(&data_char, chunk, WriteType::WithoutResponse)
                    .await
                    .map_err(|e| Error::Ble(e.to_string()))?;
            }
            Ok(())
        })
    }

    fn recv_response(&mut self) -> Result<Vec<u8>> {
        let control_uuid = self.control.uuid;
        let notifications = &mut self.notifications;
        self.rt.block_on(async {
            let wait = async {
                while let Some(ntf) = notifications.next().await {
                    if ntf.uuid == control_uuid {
                        return Some(ntf.value);
                    }
                }
                None
            };
            tokio::time::timeout(NOTIFICATION_TIMEOUT, wait)
                .await
                .map_err(|_| Error::Timeout("control point notification"))?
                .ok_or(Error::Ble("notification stream ended".into()))
        })
    }

    fn mtu(&mut self) -> Result<u16> {
        Ok(BLE_MTU)
    }

    fn fini(&mut self) {
        let peripheral = self.peripheral.clone();
        self.rt.block_on(async move {
            peripheral.disconnect().await.ok();
        });
    }
}

/// Idempotent teardown on every exit path, including an early return caused
/// by a signal-driven abort.
impl Drop for BleTransport {
    fn drop(&mut self) {
        Transport::fini(self);
    }
}
