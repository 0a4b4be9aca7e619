use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use anyhow::{bail, Context};
use common::{
    error::SdkError,
    protocol::{ids, Message, ParamType},
};
use networking::{Requester, SubscribeClient};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, trace, warn};

use super::EventSlot;
use crate::{
    board::Board,
    component::{Component, Config, StateMap},
};

pub(crate) const MODULE: &str = module_path!();

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChargingState {
    Discharging,
    Charging,
    Full,
}

impl TryFrom<i64> for ChargingState {
    type Error = SdkError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ChargingState::Discharging),
            1 => Ok(ChargingState::Charging),
            2 => Ok(ChargingState::Full),
            other => Err(SdkError::Protocol(format!("Invalid charging state {other}"))),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct BatteryState {
    pub charging_state: ChargingState,
    /// Percent
    pub capacity: i64,
    /// Minutes until full or empty
    pub time_remaining: i64,
    /// Milliwatts
    pub wattage: i64,
}

impl BatteryState {
    fn from_message(message: &Message) -> anyhow::Result<Self> {
        message
            .expect_schema(&[ParamType::Int; 4])
            .map_err(|err| SdkError::Protocol(err.to_string()))?;

        Ok(Self {
            charging_state: ChargingState::try_from(message.int(0)?)?,
            capacity: message.int(1)?,
            time_remaining: message.int(2)?,
            wattage: message.int(3)?,
        })
    }
}

#[derive(Default)]
struct BatteryEvents {
    previous: Mutex<Option<ChargingState>>,
    when_low: EventSlot,
    when_critical: EventSlot,
    when_full: EventSlot,
    when_charging: EventSlot,
    when_discharging: EventSlot,
}

impl BatteryEvents {
    fn handle(&self, message: &Message) -> anyhow::Result<()> {
        let slot = match message.id() {
            ids::PUB_LOW_BATTERY_WARNING => &self.when_low,
            ids::PUB_CRITICAL_BATTERY_WARNING => &self.when_critical,
            ids::PUB_BATTERY_STATE_CHANGED => {
                let state = match ChargingState::try_from(message.int(0)?) {
                    Ok(state) => state,
                    Err(err) => {
                        warn!("Ignoring battery update: {err}");
                        return Ok(());
                    }
                };

                let mut previous = self
                    .previous
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                if *previous == Some(state) {
                    debug!("Charging state unchanged");
                    return Ok(());
                }
                *previous = Some(state);

                match state {
                    ChargingState::Full => &self.when_full,
                    ChargingState::Charging => &self.when_charging,
                    ChargingState::Discharging => &self.when_discharging,
                }
            }
            other => bail!(SdkError::Protocol(format!("Not a battery event: {other}"))),
        };

        if let Some(callback) = slot.get() {
            callback();
        }

        Ok(())
    }
}

pub struct Battery {
    device_manager: Arc<dyn Requester>,
    events: Arc<BatteryEvents>,
    subscriber: Option<SubscribeClient>,
}

impl Battery {
    /// Battery reporting events published on the board's device manager
    #[tracing::instrument(skip(board))]
    pub fn new(board: &Board) -> Self {
        trace!("Battery::new()");

        let mut battery = Self::with_device_manager(board.device_manager().clone());
        if let Err(err) = battery.start_listening(board.settings().device_manager.subscribe_addr) {
            warn!("Battery events unavailable: {err:?}");
        }

        battery
    }

    pub fn with_device_manager(device_manager: Arc<dyn Requester>) -> Self {
        let initial = device_manager
            .request(Message::empty(ids::REQ_GET_BATTERY_STATE))
            .map_err(anyhow::Error::from)
            .and_then(|response| BatteryState::from_message(&response));
        let previous = match initial {
            Ok(state) => Some(state.charging_state),
            Err(err) => {
                warn!("Unknown initial battery state: {err:?}");
                None
            }
        };

        Self {
            device_manager,
            events: Arc::new(BatteryEvents {
                previous: Mutex::new(previous),
                ..Default::default()
            }),
            subscriber: None,
        }
    }

    pub(crate) fn from_config(board: &Board, _config: &Config) -> anyhow::Result<Box<dyn Component>> {
        Ok(Box::new(Battery::new(board)))
    }

    pub fn start_listening(&mut self, addr: SocketAddr) -> anyhow::Result<()> {
        if self.subscriber.is_some() {
            return Ok(());
        }

        let mut subscriber = SubscribeClient::new(addr);
        for id in [
            ids::PUB_BATTERY_STATE_CHANGED,
            ids::PUB_LOW_BATTERY_WARNING,
            ids::PUB_CRITICAL_BATTERY_WARNING,
        ] {
            let events = self.events.clone();
            subscriber.add_handler(id, Box::new(move |message| events.handle(message)));
        }
        subscriber
            .start()
            .map_err(SdkError::from)
            .context("Subscribe to battery events")?;

        self.subscriber = Some(subscriber);
        Ok(())
    }

    pub fn state(&self) -> anyhow::Result<BatteryState> {
        let response = self
            .device_manager
            .request(Message::empty(ids::REQ_GET_BATTERY_STATE))
            .map_err(SdkError::from)
            .context("Get battery state")?;

        BatteryState::from_message(&response)
    }

    pub fn charging_state(&self) -> anyhow::Result<ChargingState> {
        Ok(self.state()?.charging_state)
    }

    pub fn is_charging(&self) -> anyhow::Result<bool> {
        Ok(self.charging_state()? != ChargingState::Discharging)
    }

    pub fn is_full(&self) -> anyhow::Result<bool> {
        Ok(self.charging_state()? == ChargingState::Full)
    }

    pub fn capacity(&self) -> anyhow::Result<i64> {
        Ok(self.state()?.capacity)
    }

    pub fn time_remaining(&self) -> anyhow::Result<i64> {
        Ok(self.state()?.time_remaining)
    }

    pub fn wattage(&self) -> anyhow::Result<i64> {
        Ok(self.state()?.wattage)
    }

    pub fn when_low(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.events.when_low.set(Arc::new(callback));
    }

    pub fn when_critical(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.events.when_critical.set(Arc::new(callback));
    }

    pub fn when_full(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.events.when_full.set(Arc::new(callback));
    }

    pub fn when_charging(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.events.when_charging.set(Arc::new(callback));
    }

    pub fn when_discharging(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.events.when_discharging.set(Arc::new(callback));
    }

    /// Applies a battery publication as if it came from the device manager
    pub fn handle_event(&self, message: &Message) -> anyhow::Result<()> {
        self.events.handle(message)
    }
}

impl Component for Battery {
    fn class_name(&self) -> &'static str {
        "Battery"
    }

    fn module(&self) -> &'static str {
        MODULE
    }

    fn name(&self) -> &str {
        "battery"
    }

    fn own_state(&self) -> StateMap {
        let mut state = StateMap::new();
        match self.state() {
            Ok(battery) => {
                state.insert("charging_state".to_owned(), json!(battery.charging_state));
                state.insert("capacity".to_owned(), json!(battery.capacity));
                state.insert("time_remaining".to_owned(), json!(battery.time_remaining));
                state.insert("wattage".to_owned(), json!(battery.wattage));
            }
            Err(err) => debug!("Battery state unavailable: {err:?}"),
        }
        state
    }

    fn close(&mut self) -> anyhow::Result<()> {
        if let Some(mut subscriber) = self.subscriber.take() {
            subscriber.stop();
        }
        Ok(())
    }
}

impl std::fmt::Debug for Battery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Battery")
            .field("listening", &self.subscriber.is_some())
            .finish_non_exhaustive()
    }
}
