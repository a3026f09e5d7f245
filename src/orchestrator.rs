//! Upgrade orchestration: bootloader entry, the two-phase SD+BL-then-APP
//! upgrade sequence, and `SIGINT`-driven cancellation.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, Once, OnceLock};
use std::time::Duration;

use log::{info, warn};

use crate::archive::{DfuArchive, Image};
use crate::config::{BleConfig, Config, SerialConfig, TransportConfig, DEFAULT_SERIAL_BAUD};
use crate::error::{Error, Result};
use crate::protocol::opcode::ObjectType;
use crate::protocol::DfuEngine;
use crate::transfer::write_procedure;
use crate::transport::ble::{BleAddress, BleTransport};
use crate::transport::serial::SerialTransport;
use crate::transport::Transport;

/// Set from the `SIGINT` handler; every bounded wait loop in this module
/// (ping retries, BLE reconnect back-off) polls it between attempts so a
/// `Ctrl-C` interrupts promptly instead of riding out each call's own
/// timeout.
static TERMINATE: AtomicBool = AtomicBool::new(false);
static INSTALL_HANDLER: Once = Once::new();

/// Non-owning handle to the transport currently in use, so the signal
/// handler can reach into it without the orchestrator giving up ownership.
/// Raw because the handler runs on a signal-delivery thread with no
/// borrow-checker visibility into the orchestrator's call stack; `call` is
/// monomorphized per concrete transport type at registration time.
struct FiniHandle {
    ptr: *mut (),
    call: unsafe fn(*mut ()),
}

unsafe impl Send for FiniHandle {}

unsafe fn call_fini<T: Transport>(ptr: *mut ()) {
    (*(ptr as *mut T)).fini();
}

fn active_fini_cell() -> &'static Mutex<Option<FiniHandle>> {
    static CELL: OnceLock<Mutex<Option<FiniHandle>>> = OnceLock::new();
    CELL.get_or_init(|| Mutex::new(None))
}

/// Registers `transport` as the one a `Ctrl-C` should unblock, so a blocking
/// serial read or BLE notification wait gets torn down immediately instead
/// of riding out its own timeout. Returns a guard that deregisters it on
/// drop; hold the guard for exactly as long as `transport` stays valid, and
/// drop it before the transport itself is dropped or replaced.
#[must_use]
fn register_active_transport<T: Transport>(transport: &mut T) -> ActiveTransportGuard {
    let handle = FiniHandle { ptr: transport as *mut T as *mut (), call: call_fini::<T> };
    *active_fini_cell().lock().unwrap() = Some(handle);
    ActiveTransportGuard
}

struct ActiveTransportGuard;

impl Drop for ActiveTransportGuard {
    fn drop(&mut self) {
        *active_fini_cell().lock().unwrap() = None;
    }
}

fn install_signal_handler() {
    INSTALL_HANDLER.call_once(|| {
        let result = ctrlc::set_handler(|| {
            warn!("received interrupt, shutting down");
            TERMINATE.store(true, Ordering::SeqCst);
            if let Ok(mut guard) = active_fini_cell().lock() {
                if let Some(handle) = guard.as_mut() {
                    unsafe { (handle.call)(handle.ptr) };
                }
            }
        });
        if let Err(e) = result {
            warn!("could not install SIGINT handler: {e}");
        }
    });
}

fn terminated() -> bool {
    TERMINATE.load(Ordering::SeqCst)
}

/// Run a full upgrade: open the archive, enter the bootloader over the
/// configured transport, then transfer whichever of {SD+BL, application}
/// image pairs the archive contains.
pub fn run(config: &Config) -> Result<()> {
    install_signal_handler();

    info!("opening DFU archive {}", config.archive_path);
    let archive = DfuArchive::open(&config.archive_path)?;

    match &config.transport {
        TransportConfig::Serial(sc) => run_serial(config, sc, archive),
        TransportConfig::Ble(bc) => run_ble(config, bc, archive),
    }
}

/// Ping the bootloader until it answers or `tries` attempts have elapsed,
/// one second apart. The bootloader can take a moment to finish erasing the
/// target flash region after entry, so early pings are expected to go
/// unanswered.
fn wait_for_ping<T: Transport>(engine: &mut DfuEngine<T>, tries: u32) -> Result<()> {
    print!("waiting for device to respond ");
    std::io::stdout().flush().ok();
    for attempt in 0..tries {
        if terminated() {
            println!();
            return Err(Error::Timeout("interrupted while waiting for bootloader"));
        }
        if engine.ping().is_ok() {
            println!("ready");
            return Ok(());
        }
        print!(".");
        std::io::stdout().flush().ok();
        if attempt + 1 < tries {
            std::thread::sleep(Duration::from_secs(1));
        }
    }
    println!();
    Err(Error::Timeout("device did not respond to ping within the configured number of tries"))
}

/// Transfer one image pair's init packet, then firmware image.
fn transfer_image<T: Transport>(engine: &mut DfuEngine<T>, image: Image, label: &str) -> Result<()> {
    let Image { mut init_packet, init_packet_len, mut firmware, firmware_len } = image;

    info!("sending {label} init packet ({init_packet_len} bytes)");
    write_procedure(engine, ObjectType::Command, &mut init_packet, init_packet_len)?;

    info!("sending {label} firmware image ({firmware_len} bytes)");
    write_procedure(engine, ObjectType::Data, &mut firmware, firmware_len)?;

    Ok(())
}

/// SD+BL is optional; a `FwVersionFailure` extended error while sending it
/// means the device already carries this (or a newer) SoftDevice and
/// Bootloader, which is not fatal to the overall upgrade.
fn transfer_softdevice_bootloader<T: Transport>(
    engine: &mut DfuEngine<T>,
    image: Image,
) -> Result<()> {
    match transfer_image(engine, image, "SoftDevice+Bootloader") {
        Ok(()) => Ok(()),
        Err(e) if e.is_fw_version_failure() => {
            info!("SoftDevice+Bootloader already up to date, continuing");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn run_serial(config: &Config, sc: &SerialConfig, archive: DfuArchive) -> Result<()> {
    let transport = SerialTransport::open(&sc.port, sc.baud)?;
    let mut engine = DfuEngine::new(transport);
    let mut active = register_active_transport(engine.transport_mut());

    if let Some(cmd) = &sc.dfu_entry_command {
        engine.transport_mut().send_dfu_entry_command(cmd)?;
        engine.transport_mut().set_baud_rate(DEFAULT_SERIAL_BAUD)?;
    }

    wait_for_ping(&mut engine, config.timeout_tries)?;
    info!("starting DFU upgrade");
    engine.set_prn(0)?;

    let DfuArchive { softdevice_bootloader, application } = archive;

    if let Some(image) = softdevice_bootloader {
        transfer_softdevice_bootloader(&mut engine, image)?;

        if application.is_some() {
            // The bootloader reboots into the newly flashed image; for a
            // USB CDC/ACM serial target the device node disappears and
            // reappears during that reset, so the port has to be re-opened
            // rather than just re-pinged over the old handle.
            info!("re-opening serial port after SoftDevice+Bootloader update");
            drop(active);
            drop(engine.into_transport());
            std::thread::sleep(Duration::from_secs(2));
            let transport = SerialTransport::open(&sc.port, sc.baud)?;
            engine = DfuEngine::new(transport);
            active = register_active_transport(engine.transport_mut());
            wait_for_ping(&mut engine, config.timeout_tries)?;
            engine.set_prn(0)?;
        }
    }

    if let Some(image) = application {
        transfer_image(&mut engine, image, "application")?;
    }

    info!("DFU upgrade complete");
    Ok(())
}

fn run_ble(_config: &Config, bc: &BleConfig, archive: DfuArchive) -> Result<()> {
    let address = BleAddress::new(bc.address, bc.address_type);

    let transport = BleTransport::enter_dfu_and_connect(&bc.interface, address)?;
    let connected_at = transport.address;
    let mut engine = DfuEngine::new(transport);
    let mut active = register_active_transport(engine.transport_mut());

    info!("starting DFU upgrade");
    engine.set_prn(0)?;

    let DfuArchive { softdevice_bootloader, application } = archive;

    if let Some(image) = softdevice_bootloader {
        transfer_softdevice_bootloader(&mut engine, image)?;

        if application.is_some() {
            info!("waiting for bootloader to reconnect after SoftDevice+Bootloader update");
            drop(active);
            drop(engine.into_transport());
            std::thread::sleep(Duration::from_secs(3));
            let transport = BleTransport::reconnect(&bc.interface, connected_at)?;
            engine = DfuEngine::new(transport);
            active = register_active_transport(engine.transport_mut());
            engine.set_prn(0)?;
        }
    }

    if let Some(image) = application {
        transfer_image(&mut engine, image, "application")?;
    }

    info!("DFU upgrade complete");
    Ok(())
}
