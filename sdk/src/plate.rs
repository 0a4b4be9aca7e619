//! Shared connection to the expansion plate's microcontroller
//!
//! The plate MCU sits on I2C bus 1 at address `0x04` and exposes the ADC, motor,
//! servo and IMU register banks. All access goes through one [`Plate`], which owns
//! the connection and serialises transfers.

use std::{
    fmt::{Debug, Formatter},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{bail, Context};
use common::error::{LogErrorExt, SdkError};
use tracing::{debug, error, info, span, trace, Level};

use crate::{
    adc::Adc,
    imu::Imu,
    motor::EncoderMotorController,
    peripheral::{I2cDevice, RegisterDevice},
    servo::ServoController,
    settings::PlateSettings,
};

pub const REGISTER_HEARTBEAT: u8 = 0x0F;
pub const HEARTBEAT_SECONDS_BEFORE_SHUTDOWN: u8 = 10;

/// Opens a fresh connection to the MCU
pub type DeviceFactory = Box<dyn Fn() -> anyhow::Result<Box<dyn RegisterDevice>> + Send + Sync>;

/// Cheap to clone handle on the plate MCU
///
/// The MCU is connected on first use and stays connected until [`Plate::disconnect`]
/// or until the last clone is dropped.
#[derive(Clone)]
pub struct Plate {
    inner: Arc<PlateInner>,
}

struct PlateInner {
    factory: DeviceFactory,
    heartbeat_interval: Option<Duration>,
    mcu: Mutex<Option<Box<dyn RegisterDevice>>>,
    heartbeat: Mutex<Option<Heartbeat>>,
}

struct Heartbeat {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Plate {
    #[tracing::instrument]
    pub fn new(settings: &PlateSettings) -> Self {
        trace!("Plate::new()");

        let (bus, address) = (settings.bus, settings.address);
        let factory: DeviceFactory = Box::new(move || {
            let mut device = I2cDevice::new(bus, address);
            device.connect().context("Unable to connect to the plate")?;
            Ok(Box::new(device))
        });

        let heartbeat = settings.heartbeat.then(|| settings.heartbeat_interval());
        Self::with_factory(factory, heartbeat)
    }

    /// Plate backed by any register device, `heartbeat` of `None` disables the heartbeat
    pub fn with_factory(factory: DeviceFactory, heartbeat: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(PlateInner {
                factory,
                heartbeat_interval: heartbeat,
                mcu: Mutex::new(None),
                heartbeat: Mutex::new(None),
            }),
        }
    }

    /// Runs `op` with exclusive access to the MCU, connecting first if needed
    pub fn with_mcu<T>(
        &self,
        op: impl FnOnce(&mut dyn RegisterDevice) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let mut mcu = self.inner.lock_mcu();

        if mcu.is_none() {
            debug!("Connecting to plate MCU");
            *mcu = Some((self.inner.factory)()?);
            self.start_heartbeat();
        }

        match mcu.as_deref_mut() {
            Some(device) => op(device),
            None => bail!(SdkError::bus("Plate MCU is not connected")),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock_mcu().is_some()
    }

    /// Stops the heartbeat and closes the MCU connection
    pub fn disconnect(&self) {
        // The heartbeat takes the MCU lock, so it's joined before taking it here
        self.inner.stop_heartbeat(true);

        if self.inner.lock_mcu().take().is_some() {
            info!("Disconnected from plate MCU");
        }
    }

    pub fn adc(&self) -> Adc {
        Adc::new(self.clone())
    }

    pub fn motor(&self, bank: u8) -> anyhow::Result<EncoderMotorController> {
        EncoderMotorController::new(self.clone(), bank)
    }

    pub fn servo(&self, bank: u8) -> anyhow::Result<ServoController> {
        ServoController::new(self.clone(), bank)
    }

    /// The IMU's registers live in the MCU's bank, so it shares the MCU connection
    pub fn imu(&self) -> Imu {
        Imu::new(self.clone())
    }

    fn start_heartbeat(&self) {
        let Some(interval) = self.inner.heartbeat_interval else {
            return;
        };

        let mut heartbeat = self
            .inner
            .heartbeat
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if heartbeat.is_some() {
            return;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let plate = Arc::downgrade(&self.inner);
        let thread_stop = stop.clone();
        let res = thread::Builder::new()
            .name("plate-heartbeat".to_owned())
            .spawn(move || heartbeat_loop(plate, thread_stop, interval));

        match res {
            Ok(handle) => *heartbeat = Some(Heartbeat { stop, handle }),
            Err(err) => error!("Could not spawn heartbeat thread: {err:?}"),
        }
    }
}

fn heartbeat_loop(plate: Weak<PlateInner>, stop: Arc<AtomicBool>, interval: Duration) {
    let _span = span!(Level::INFO, "Plate heartbeat thread").entered();

    let slice = interval / 10;
    while !stop.load(Ordering::Relaxed) {
        {
            let Some(plate) = plate.upgrade() else {
                return;
            };

            let mut mcu = plate.lock_mcu();
            if let Some(device) = mcu.as_deref_mut() {
                trace!("Sending heartbeat");
                device
                    .write_byte(REGISTER_HEARTBEAT, HEARTBEAT_SECONDS_BEFORE_SHUTDOWN)
                    .log_error("Send heartbeat");
            }
        }

        // Sliced so a disconnect doesn't wait out the whole interval
        for _ in 0..10 {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            thread::sleep(slice);
        }
    }

    debug!("Exiting heartbeat loop");
}

impl PlateInner {
    fn lock_mcu(&self) -> MutexGuard<'_, Option<Box<dyn RegisterDevice>>> {
        self.mcu.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn stop_heartbeat(&self, join: bool) {
        let heartbeat = self
            .heartbeat
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        if let Some(heartbeat) = heartbeat {
            heartbeat.stop.store(true, Ordering::Relaxed);
            if join && heartbeat.handle.thread().id() != thread::current().id() {
                if heartbeat.handle.join().is_err() {
                    error!("Heartbeat thread panicked");
                }
            }
        }
    }
}

impl Drop for PlateInner {
    fn drop(&mut self) {
        // May run on the heartbeat thread itself, which exits on its own
        self.stop_heartbeat(false);
    }
}

impl Debug for Plate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plate")
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}
