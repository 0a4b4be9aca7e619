//! The pi-top itself: battery, display and the root of a component tree

pub mod battery;
pub mod display;
pub mod pitop;

use std::sync::{Arc, Mutex};

pub use battery::{Battery, BatteryState, ChargingState};
pub use display::Display;
pub use pitop::Pitop;

use crate::component::Registry;

pub(crate) type EventSlot = CallbackSlot<dyn Fn() + Send + Sync>;

/// A replaceable callback shared with the subscribe worker
pub(crate) struct CallbackSlot<F: ?Sized> {
    callback: Mutex<Option<Arc<F>>>,
}

impl<F: ?Sized> Default for CallbackSlot<F> {
    fn default() -> Self {
        Self {
            callback: Mutex::new(None),
        }
    }
}

impl<F: ?Sized> CallbackSlot<F> {
    pub(crate) fn set(&self, callback: Arc<F>) {
        *self
            .callback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(callback);
    }

    /// Cloned out so the callback runs without the slot locked
    pub(crate) fn get(&self) -> Option<Arc<F>> {
        self.callback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

pub(crate) fn register(registry: &mut Registry) {
    registry.register(pitop::MODULE, "Pitop", Pitop::from_config);
    registry.register(battery::MODULE, "Battery", Battery::from_config);
    registry.register(display::MODULE, "Display", Display::from_config);
}

#[cfg(test)]
mod tests {
    use common::protocol::ids;

    use super::*;
    use crate::{component::Component, mock};

    #[test]
    fn battery_and_display_rebuild_from_registry() {
        let (board, hw) = mock::board();
        hw.device_manager
            .reply(ids::REQ_GET_BATTERY_STATE, &["1", "87", "42", "1500"]);
        let registry = Registry::with_builtin();

        let configs = [
            Battery::with_device_manager(board.device_manager().clone()).config(),
            Display::with_device_manager(board.device_manager().clone()).config(),
        ];
        for config in configs {
            let rebuilt = registry.from_config(&board, &config).unwrap();
            assert_eq!(rebuilt.config(), config);
        }
    }
}
