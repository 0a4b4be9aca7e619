use std::{net::SocketAddr, sync::Arc};

use anyhow::{bail, Context};
use common::{
    error::SdkError,
    protocol::{ids, Message},
};
use networking::{Requester, SubscribeClient};
use serde_json::json;
use tracing::{debug, trace, warn};

use super::{CallbackSlot, EventSlot};
use crate::{
    board::Board,
    component::{Component, Config, StateMap},
};

pub(crate) const MODULE: &str = module_path!();

pub const MAX_BRIGHTNESS: u8 = 10;

#[derive(Default)]
struct DisplayEvents {
    brightness_changed: CallbackSlot<dyn Fn(u8) + Send + Sync>,
    blanked: EventSlot,
    unblanked: EventSlot,
    lid_closed: EventSlot,
    lid_opened: EventSlot,
}

impl DisplayEvents {
    fn handle(&self, message: &Message) -> anyhow::Result<()> {
        let slot = match message.id() {
            ids::PUB_BRIGHTNESS_CHANGED => {
                let brightness = u8::try_from(message.int(0)?)
                    .map_err(|err| SdkError::Protocol(format!("Bad brightness: {err}")))?;
                if let Some(callback) = self.brightness_changed.get() {
                    callback(brightness);
                }
                return Ok(());
            }
            ids::PUB_SCREEN_BLANKED => &self.blanked,
            ids::PUB_SCREEN_UNBLANKED => &self.unblanked,
            ids::PUB_LID_CLOSED => &self.lid_closed,
            ids::PUB_LID_OPENED => &self.lid_opened,
            other => bail!(SdkError::Protocol(format!("Not a display event: {other}"))),
        };

        if let Some(callback) = slot.get() {
            callback();
        }

        Ok(())
    }
}

/// The pi-top's own screen, through the device manager
pub struct Display {
    device_manager: Arc<dyn Requester>,
    events: Arc<DisplayEvents>,
    subscriber: Option<SubscribeClient>,
}

impl Display {
    #[tracing::instrument(skip(board))]
    pub fn new(board: &Board) -> Self {
        trace!("Display::new()");

        let mut display = Self::with_device_manager(board.device_manager().clone());
        if let Err(err) = display.start_listening(board.settings().device_manager.subscribe_addr) {
            warn!("Display events unavailable: {err:?}");
        }

        display
    }

    pub fn with_device_manager(device_manager: Arc<dyn Requester>) -> Self {
        Self {
            device_manager,
            events: Arc::new(DisplayEvents::default()),
            subscriber: None,
        }
    }

    pub(crate) fn from_config(board: &Board, _config: &Config) -> anyhow::Result<Box<dyn Component>> {
        Ok(Box::new(Display::new(board)))
    }

    pub fn start_listening(&mut self, addr: SocketAddr) -> anyhow::Result<()> {
        if self.subscriber.is_some() {
            return Ok(());
        }

        let mut subscriber = SubscribeClient::new(addr);
        for id in [
            ids::PUB_BRIGHTNESS_CHANGED,
            ids::PUB_SCREEN_BLANKED,
            ids::PUB_SCREEN_UNBLANKED,
            ids::PUB_LID_CLOSED,
            ids::PUB_LID_OPENED,
        ] {
            let events = self.events.clone();
            subscriber.add_handler(id, Box::new(move |message| events.handle(message)));
        }
        subscriber
            .start()
            .map_err(SdkError::from)
            .context("Subscribe to display events")?;

        self.subscriber = Some(subscriber);
        Ok(())
    }

    fn query(&self, request: u16, what: &str) -> anyhow::Result<i64> {
        self.device_manager
            .query_int(request)
            .map_err(SdkError::from)
            .with_context(|| format!("Get {what}"))
    }

    fn command(&self, request: u16, parameter: Option<String>, what: &str) -> anyhow::Result<()> {
        debug!("Display: {what}");
        self.device_manager
            .command(request, parameter)
            .map_err(SdkError::from)
            .with_context(|| format!("Display: {what}"))
    }

    pub fn brightness(&self) -> anyhow::Result<u8> {
        let brightness = self.query(ids::REQ_GET_BRIGHTNESS, "brightness")?;
        u8::try_from(brightness)
            .map_err(|_| SdkError::Protocol(format!("Brightness {brightness} out of range")).into())
    }

    pub fn set_brightness(&self, brightness: u8) -> anyhow::Result<()> {
        if brightness > MAX_BRIGHTNESS {
            bail!(SdkError::validation(format!(
                "Brightness must be between 0 and {MAX_BRIGHTNESS}, got {brightness}"
            )));
        }

        self.command(
            ids::REQ_SET_BRIGHTNESS,
            Some(brightness.to_string()),
            "set brightness",
        )
    }

    pub fn increment_brightness(&self) -> anyhow::Result<()> {
        self.command(ids::REQ_INCREMENT_BRIGHTNESS, None, "increment brightness")
    }

    pub fn decrement_brightness(&self) -> anyhow::Result<()> {
        self.command(ids::REQ_DECREMENT_BRIGHTNESS, None, "decrement brightness")
    }

    pub fn blank(&self) -> anyhow::Result<()> {
        self.command(ids::REQ_BLANK_SCREEN, None, "blank")
    }

    pub fn unblank(&self) -> anyhow::Result<()> {
        self.command(ids::REQ_UNBLANK_SCREEN, None, "unblank")
    }

    /// Seconds of inactivity before the screen blanks, 0 never blanks
    pub fn blanking_timeout(&self) -> anyhow::Result<i64> {
        self.query(ids::REQ_GET_SCREEN_BLANKING_TIMEOUT, "blanking timeout")
    }

    pub fn set_blanking_timeout(&self, seconds: i64) -> anyhow::Result<()> {
        if seconds < 0 {
            bail!(SdkError::validation("Blanking timeout can't be negative"));
        }
        if seconds % 60 != 0 {
            bail!(SdkError::validation(format!(
                "Blanking timeout must be a multiple of 60, got {seconds}"
            )));
        }

        self.command(
            ids::REQ_SET_SCREEN_BLANKING_TIMEOUT,
            Some(seconds.to_string()),
            "set blanking timeout",
        )
    }

    pub fn backlight(&self) -> anyhow::Result<bool> {
        Ok(self.query(ids::REQ_GET_SCREEN_BACKLIGHT_STATE, "backlight")? == 1)
    }

    pub fn set_backlight(&self, on: bool) -> anyhow::Result<()> {
        self.command(
            ids::REQ_SET_SCREEN_BACKLIGHT_STATE,
            Some(u8::from(on).to_string()),
            "set backlight",
        )
    }

    pub fn lid_is_open(&self) -> anyhow::Result<bool> {
        Ok(self.query(ids::REQ_GET_LID_OPEN_STATE, "lid state")? == 1)
    }

    pub fn when_brightness_changed(&self, callback: impl Fn(u8) + Send + Sync + 'static) {
        self.events.brightness_changed.set(Arc::new(callback));
    }

    pub fn when_screen_blanked(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.events.blanked.set(Arc::new(callback));
    }

    pub fn when_screen_unblanked(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.events.unblanked.set(Arc::new(callback));
    }

    pub fn when_lid_closed(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.events.lid_closed.set(Arc::new(callback));
    }

    pub fn when_lid_opened(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.events.lid_opened.set(Arc::new(callback));
    }

    /// Applies a display publication as if it came from the device manager
    pub fn handle_event(&self, message: &Message) -> anyhow::Result<()> {
        self.events.handle(message)
    }
}

impl Component for Display {
    fn class_name(&self) -> &'static str {
        "Display"
    }

    fn module(&self) -> &'static str {
        MODULE
    }

    fn name(&self) -> &str {
        "display"
    }

    fn own_state(&self) -> StateMap {
        let mut state = StateMap::new();
        state.insert("brightness".to_owned(), json!(self.brightness().ok()));
        state.insert("backlight".to_owned(), json!(self.backlight().ok()));
        state.insert("lid_is_open".to_owned(), json!(self.lid_is_open().ok()));
        state
    }

    fn close(&mut self) -> anyhow::Result<()> {
        if let Some(mut subscriber) = self.subscriber.take() {
            subscriber.stop();
        }
        Ok(())
    }
}

impl std::fmt::Debug for Display {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Display")
            .field("listening", &self.subscriber.is_some())
            .finish_non_exhaustive()
    }
}
