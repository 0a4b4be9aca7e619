//! Ownership of the display between this process, other processes and the hub

use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::{bail, Context};
use common::{
    error::{LogErrorExt, SdkError},
    lock::AdvisoryLock,
    protocol::{ids, Message},
};
use networking::{Requester, SubscribeClient};
use tracing::{debug, info, trace, warn};

use super::sh1106::{DisplayBus, Sh1106};

pub const LOCK_ID: &str = "pt-oled";

/// Opens the transport to the panel for an SPI bus number
pub type BusOpener = Box<dyn Fn(u8) -> anyhow::Result<Box<dyn DisplayBus>> + Send + Sync>;

#[derive(Debug, Default)]
struct DeviceState {
    device: Option<Sh1106>,
    spi_bus: Option<u8>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<DeviceState>,
    lock: AdvisoryLock,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Closes the panel and gives it back to whoever wants it
    fn reset(&self) -> anyhow::Result<()> {
        let mut state = self.state();
        if state.device.take().is_some() {
            debug!("Closed OLED device");
        }
        drop(state);

        self.lock.release().map_err(SdkError::from)?;
        Ok(())
    }
}

/// Idle until a frame needs the panel, then owns it until reset
pub struct OledDeviceController {
    shared: Arc<Shared>,
    exclusive: bool,
    rotation: u8,
    device_manager: Arc<dyn Requester>,
    open_bus: BusOpener,
    subscriber: Mutex<Option<SubscribeClient>>,
}

impl OledDeviceController {
    #[tracing::instrument(skip(device_manager, open_bus))]
    pub fn new(
        lock_path: PathBuf,
        exclusive: bool,
        rotation: u8,
        device_manager: Arc<dyn Requester>,
        open_bus: BusOpener,
    ) -> anyhow::Result<Self> {
        trace!("OledDeviceController::new()");

        let lock = AdvisoryLock::at(lock_path, LOCK_ID).map_err(SdkError::from)?;

        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(DeviceState::default()),
                lock,
            }),
            exclusive,
            rotation,
            device_manager,
            open_bus,
            subscriber: Mutex::new(None),
        })
    }

    pub fn lock_path(&self) -> PathBuf {
        self.shared.lock.path().to_owned()
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Takes the display lock and opens the panel if not already open
    pub fn get_device(&self) -> anyhow::Result<()> {
        self.with_device(|_| Ok(()))
    }

    /// Runs `op` on the panel, opening it first when needed
    pub fn with_device<T>(&self, op: impl FnOnce(&mut Sh1106) -> anyhow::Result<T>) -> anyhow::Result<T> {
        let mut state = self.shared.state();

        if state.device.is_none() {
            let device = self.open_device(&mut state)?;
            state.device = Some(device);
        }

        match state.device.as_mut() {
            Some(device) => op(device),
            None => bail!(SdkError::bus("OLED device closed")),
        }
    }

    fn open_device(&self, state: &mut DeviceState) -> anyhow::Result<Sh1106> {
        // Shared controllers draw without the lock and never wait on its owner
        if self.exclusive {
            self.shared.lock.try_acquire().map_err(SdkError::from)?;
        }

        let opened = self.query_spi_bus().and_then(|bus| {
            state.spi_bus = Some(bus);
            let display_bus = (self.open_bus)(bus)?;
            Sh1106::new(display_bus, self.rotation)
        });

        match opened {
            Ok(device) => {
                info!("Opened OLED device");
                Ok(device)
            }
            Err(err) => {
                if self.exclusive {
                    self.shared
                        .lock
                        .release()
                        .log_error("Release OLED lock after failed open");
                }
                Err(err).context("Open OLED device")
            }
        }
    }

    fn query_spi_bus(&self) -> anyhow::Result<u8> {
        let bus = self
            .device_manager
            .query_int(ids::REQ_GET_OLED_SPI_BUS)
            .map_err(SdkError::from)
            .context("Query OLED SPI bus")?;

        match u8::try_from(bus) {
            Ok(bus @ (0 | 1)) => Ok(bus),
            _ => bail!(SdkError::Protocol(format!("Invalid OLED SPI bus {bus}"))),
        }
    }

    pub fn reset(&self) -> anyhow::Result<()> {
        self.shared.reset()
    }

    /// True if anyone is using the display, unless this controller owns it exclusively
    pub fn device_is_active(&self) -> anyhow::Result<bool> {
        if self.exclusive && self.shared.lock.is_locked_by_self() {
            return Ok(false);
        }

        Ok(self.shared.lock.is_locked().map_err(SdkError::from)?)
    }

    pub fn set_control_to_pi(&self) -> anyhow::Result<()> {
        self.set_control(true)
    }

    pub fn set_control_to_hub(&self) -> anyhow::Result<()> {
        self.set_control(false)
    }

    fn set_control(&self, pi: bool) -> anyhow::Result<()> {
        let owner = if pi { "1" } else { "0" };
        self.device_manager
            .command(ids::REQ_SET_OLED_CONTROL, Some(owner.to_owned()))
            .map_err(SdkError::from)
            .context("Set OLED control")?;

        debug!("OLED control given to {}", if pi { "pi" } else { "hub" });
        Ok(())
    }

    /// The bus the panel was last opened on, asking the device manager if never opened
    pub fn spi_bus(&self) -> anyhow::Result<u8> {
        if let Some(bus) = self.shared.state().spi_bus {
            return Ok(bus);
        }

        self.query_spi_bus()
    }

    /// Moves the panel to another bus, the current device is closed when the
    /// device manager confirms the change
    pub fn set_spi_bus(&self, bus: u8) -> anyhow::Result<()> {
        if bus > 1 {
            bail!(SdkError::validation(format!("SPI bus must be 0 or 1, got {bus}")));
        }

        self.device_manager
            .command(ids::REQ_SET_OLED_SPI_BUS, Some(bus.to_string()))
            .map_err(SdkError::from)
            .context("Set OLED SPI bus")?;

        Ok(())
    }

    /// Applies a `PUB_OLED_SPI_BUS_CHANGED` publication
    pub fn handle_spi_bus_changed(&self, message: &Message) -> anyhow::Result<()> {
        spi_bus_changed(&self.shared, message)
    }

    /// Follows SPI bus changes published by the device manager
    pub fn start_listening(&self, addr: SocketAddr) -> anyhow::Result<()> {
        let mut subscriber = self
            .subscriber
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if subscriber.is_some() {
            return Ok(());
        }

        let mut client = SubscribeClient::new(addr);
        let shared = self.shared.clone();
        client.add_handler(
            ids::PUB_OLED_SPI_BUS_CHANGED,
            Box::new(move |message| spi_bus_changed(&shared, message)),
        );
        client
            .start()
            .map_err(SdkError::from)
            .context("Listen for OLED SPI bus changes")?;

        *subscriber = Some(client);
        Ok(())
    }

    pub fn stop_listening(&self) {
        let client = self
            .subscriber
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        if let Some(mut client) = client {
            client.stop();
        }
    }
}

fn spi_bus_changed(shared: &Shared, message: &Message) -> anyhow::Result<()> {
    let bus = message.int(0).map_err(|err| SdkError::Protocol(err.to_string()))?;
    let bus = match u8::try_from(bus) {
        Ok(bus @ (0 | 1)) => bus,
        _ => bail!(SdkError::Protocol(format!("Invalid OLED SPI bus {bus}"))),
    };

    warn!("OLED moved to SPI bus {bus}, closing the device");
    shared.reset()?;
    shared.state().spi_bus = Some(bus);

    Ok(())
}

impl Drop for OledDeviceController {
    fn drop(&mut self) {
        self.stop_listening();
        self.reset().log_error("Reset OLED device controller");
    }
}

impl std::fmt::Debug for OledDeviceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OledDeviceController")
            .field("lock", &self.shared.lock.path())
            .field("exclusive", &self.exclusive)
            .field("rotation", &self.rotation)
            .finish_non_exhaustive()
    }
}
