//! The 128x64 miniscreen on the front of the pi-top
//!
//! Images are reduced to one bit [`Frame`]s before they are sent, and a frame equal to
//! the one on screen is never sent twice. The panel is opened on the first draw and
//! shared with other processes through the display lock.

pub mod controller;
pub mod fps;
pub mod frame;
pub mod monitor;
pub mod sh1106;

use std::{
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use anyhow::Context;
use common::error::LogErrorExt;
use embedded_graphics::{
    mono_font::{ascii::FONT_6X10, MonoTextStyle},
    pixelcolor::BinaryColor,
    prelude::Point,
    text::{Baseline, Text},
    Drawable,
};
use image::DynamicImage;
use serde_json::json;
use tracing::{debug, trace, warn};

pub use frame::Frame;

use crate::{
    board::Board,
    component::{Component, StateMap},
};
use controller::{BusOpener, OledDeviceController};
use fps::FpsRegulator;
use monitor::{Callback, LockFileMonitor};
use sh1106::{DisplayBus, SpiDisplayBus};

pub const WIDTH: u32 = 128;
pub const HEIGHT: u32 = 64;
pub const PAGES: u32 = HEIGHT / 8;
pub const FRAME_BYTES: usize = (WIDTH * PAGES) as usize;

const CONTRAST_SLEEP: u8 = 0;
const CONTRAST_WAKE: u8 = 255;

#[derive(Debug)]
struct Screen {
    last: Option<Frame>,
    fps: FpsRegulator,
    visible: bool,
}

#[derive(Default)]
struct HandOff {
    started: Option<Callback>,
    stopped: Option<Callback>,
    monitor: Option<LockFileMonitor>,
}

pub struct Miniscreen {
    controller: OledDeviceController,
    screen: Mutex<Screen>,
    hand_off: Mutex<HandOff>,
}

impl Miniscreen {
    /// Miniscreen on the SPI bus the device manager reports
    ///
    /// Nothing is opened until the first draw.
    #[tracing::instrument(skip(board))]
    pub fn new(board: &Board) -> anyhow::Result<Self> {
        trace!("Miniscreen::new()");

        let settings = &board.settings().miniscreen;
        let gpio = board.gpio().clone();
        let open_bus: BusOpener = Box::new(move |bus| {
            let display: Box<dyn DisplayBus> = Box::new(SpiDisplayBus::open(bus, gpio.as_ref())?);
            Ok(display)
        });

        let controller = OledDeviceController::new(
            settings.lock_path.clone(),
            settings.exclusive,
            settings.rotation,
            board.device_manager().clone(),
            open_bus,
        )?;

        if let Err(err) = controller.start_listening(board.settings().device_manager.subscribe_addr) {
            warn!("Miniscreen won't follow SPI bus changes: {err:?}");
        }

        Self::with_controller(controller, settings.max_fps)
    }

    pub fn with_controller(controller: OledDeviceController, max_fps: f64) -> anyhow::Result<Self> {
        Ok(Self {
            controller,
            screen: Mutex::new(Screen {
                last: None,
                fps: FpsRegulator::new(max_fps)?,
                visible: true,
            }),
            hand_off: Mutex::new(HandOff::default()),
        })
    }

    fn screen(&self) -> MutexGuard<'_, Screen> {
        self.screen.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn hand_off(&self) -> MutexGuard<'_, HandOff> {
        self.hand_off.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn controller(&self) -> &OledDeviceController {
        &self.controller
    }

    pub fn display_image(&self, image: &DynamicImage) -> anyhow::Result<()> {
        self.display_frame(&Frame::from_image(image), false)
    }

    pub fn display_image_file(&self, path: &Path) -> anyhow::Result<()> {
        let image = image::open(path).with_context(|| format!("Open image {}", path.display()))?;
        self.display_image(&image)
    }

    /// Sends `frame` unless it is already on screen, `force` sends it anyway
    pub fn display_frame(&self, frame: &Frame, force: bool) -> anyhow::Result<()> {
        let mut screen = self.screen();

        screen.fps.start_timer();
        let sent = if force || screen.last.as_ref() != Some(frame) {
            self.controller
                .with_device(|device| device.display(frame))
                .map(|()| true)
        } else {
            Ok(false)
        };
        screen.fps.stop_timer();

        if sent.context("Display frame")? {
            screen.last = Some(frame.clone());
        }

        Ok(())
    }

    /// Draws `text` in a 6x10 font on an otherwise dark screen
    pub fn display_text(&self, text: &str, position: Point) -> anyhow::Result<()> {
        let mut frame = Frame::blank();
        let style = MonoTextStyle::new(&FONT_6X10, BinaryColor::On);
        if let Err(never) = Text::with_baseline(text, position, style, Baseline::Top).draw(&mut frame) {
            match never {}
        }

        self.display_frame(&frame, false)
    }

    /// True if `image` differs from what is on screen
    pub fn should_redisplay(&self, image: &DynamicImage) -> bool {
        self.screen().last.as_ref() != Some(&Frame::from_image(image))
    }

    /// The frame currently on screen, if anything was drawn
    pub fn last_frame(&self) -> Option<Frame> {
        self.screen().last.clone()
    }

    pub fn clear(&self) -> anyhow::Result<()> {
        self.display_frame(&Frame::blank(), true)
    }

    /// Takes the display back from the hub and draws the last frame again
    pub fn refresh(&self) -> anyhow::Result<()> {
        self.controller.set_control_to_pi()?;
        self.controller.reset()?;

        let frame = self.last_frame().unwrap_or_default();
        self.display_frame(&frame, true)
    }

    pub fn reset(&self) -> anyhow::Result<()> {
        self.clear()?;
        self.refresh()?;
        self.wake()?;

        if !self.is_visible() {
            self.show()?;
        }

        Ok(())
    }

    pub fn contrast(&self, level: u8) -> anyhow::Result<()> {
        let _screen = self.screen();
        self.controller.with_device(|device| device.contrast(level))
    }

    pub fn sleep(&self) -> anyhow::Result<()> {
        self.contrast(CONTRAST_SLEEP)
    }

    pub fn wake(&self) -> anyhow::Result<()> {
        self.contrast(CONTRAST_WAKE)
    }

    pub fn show(&self) -> anyhow::Result<()> {
        let mut screen = self.screen();
        self.controller.with_device(|device| device.show())?;
        screen.visible = true;

        Ok(())
    }

    pub fn hide(&self) -> anyhow::Result<()> {
        let mut screen = self.screen();
        self.controller.with_device(|device| device.hide())?;
        screen.visible = false;

        Ok(())
    }

    pub fn is_visible(&self) -> bool {
        self.screen().visible
    }

    pub fn set_max_fps(&self, max_fps: f64) -> anyhow::Result<()> {
        self.screen().fps.set_max_fps(max_fps)
    }

    pub fn max_fps(&self) -> f64 {
        self.screen().fps.max_fps()
    }

    pub fn effective_fps(&self) -> f64 {
        self.screen().fps.effective_fps()
    }

    pub fn average_render_time(&self) -> Duration {
        self.screen().fps.average_render_time()
    }

    pub fn size(&self) -> (u32, u32) {
        (WIDTH, HEIGHT)
    }

    /// `(left, top, right, bottom)`, inclusive
    pub fn bounding_box(&self) -> (u32, u32, u32, u32) {
        (0, 0, WIDTH - 1, HEIGHT - 1)
    }

    pub fn center(&self) -> (u32, u32) {
        (WIDTH / 2, HEIGHT / 2)
    }

    pub fn device_is_active(&self) -> anyhow::Result<bool> {
        self.controller.device_is_active()
    }

    pub fn set_control_to_pi(&self) -> anyhow::Result<()> {
        self.controller.set_control_to_pi()
    }

    pub fn set_control_to_hub(&self) -> anyhow::Result<()> {
        self.controller.set_control_to_hub()
    }

    pub fn spi_bus(&self) -> anyhow::Result<u8> {
        self.controller.spi_bus()
    }

    pub fn set_spi_bus(&self, bus: u8) -> anyhow::Result<()> {
        self.controller.set_spi_bus(bus)
    }

    /// Called when another process opens the display lock
    pub fn when_user_starts_using_oled(
        &self,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> anyhow::Result<()> {
        let mut hand_off = self.hand_off();
        hand_off.started = Some(Arc::new(callback));
        self.restart_monitor(&mut hand_off)
    }

    /// Called when another process is done with the display lock
    pub fn when_user_stops_using_oled(
        &self,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> anyhow::Result<()> {
        let mut hand_off = self.hand_off();
        hand_off.stopped = Some(Arc::new(callback));
        self.restart_monitor(&mut hand_off)
    }

    fn restart_monitor(&self, hand_off: &mut HandOff) -> anyhow::Result<()> {
        if let Some(mut monitor) = hand_off.monitor.take() {
            monitor.stop();
        }

        let noop: Callback = Arc::new(|| {});
        let started = hand_off.started.clone().unwrap_or_else(|| noop.clone());
        let stopped = hand_off.stopped.clone().unwrap_or(noop);

        hand_off.monitor = Some(LockFileMonitor::start(
            &self.controller.lock_path(),
            started,
            stopped,
        )?);

        debug!("Watching the display lock for other users");
        Ok(())
    }

    /// Stops watching the lock and gives the panel up
    pub fn close(&self) -> anyhow::Result<()> {
        if let Some(mut monitor) = self.hand_off().monitor.take() {
            monitor.stop();
        }

        self.controller.reset()
    }
}

impl Component for Miniscreen {
    fn class_name(&self) -> &'static str {
        "Miniscreen"
    }

    fn module(&self) -> &'static str {
        module_path!()
    }

    fn name(&self) -> &str {
        "miniscreen"
    }

    fn own_state(&self) -> StateMap {
        let mut state = StateMap::new();
        state.insert("is_active".to_owned(), json!(self.device_is_active().ok()));
        state.insert("visible".to_owned(), json!(self.is_visible()));
        state.insert("max_fps".to_owned(), json!(self.max_fps()));
        state.insert("effective_fps".to_owned(), json!(self.effective_fps()));
        state
    }

    fn close(&mut self) -> anyhow::Result<()> {
        Miniscreen::close(self)
    }
}

impl Drop for Miniscreen {
    fn drop(&mut self) {
        Miniscreen::close(self).log_error("Close miniscreen");
    }
}

impl std::fmt::Debug for Miniscreen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Miniscreen")
            .field("controller", &self.controller)
            .field("visible", &self.is_visible())
            .finish_non_exhaustive()
    }
}
