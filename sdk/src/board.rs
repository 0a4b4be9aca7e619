use std::{fmt::Debug, sync::Arc};

use networking::{DeviceManager, Requester};
use tracing::trace;

use crate::{
    digital::{GpioProvider, RppalGpio},
    plate::Plate,
    ports::PortRegistry,
    settings::Settings,
};

/// Everything a component needs to reach the hardware
///
/// Cloning is cheap, all clones share the same plate connection and port bindings.
#[derive(Clone, Debug)]
pub struct Board {
    settings: Arc<Settings>,
    plate: Plate,
    ports: PortRegistry,
    gpio: Arc<dyn GpioProvider>,
    device_manager: Arc<dyn Requester>,
}

impl Board {
    #[tracing::instrument(skip(settings))]
    pub fn new(settings: Settings) -> Self {
        trace!("Board::new()");

        let plate = Plate::new(&settings.plate);
        let device_manager = DeviceManager::new(
            settings.device_manager.request_addr,
            settings.device_manager.timeout(),
        );

        Self::from_parts(
            settings,
            plate,
            Arc::new(RppalGpio::default()),
            Arc::new(device_manager),
        )
    }

    pub fn from_parts(
        settings: Settings,
        plate: Plate,
        gpio: Arc<dyn GpioProvider>,
        device_manager: Arc<dyn Requester>,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            plate,
            ports: PortRegistry::default(),
            gpio,
            device_manager,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn plate(&self) -> &Plate {
        &self.plate
    }

    pub fn ports(&self) -> &PortRegistry {
        &self.ports
    }

    pub fn gpio(&self) -> &Arc<dyn GpioProvider> {
        &self.gpio
    }

    pub fn device_manager(&self) -> &Arc<dyn Requester> {
        &self.device_manager
    }
}
