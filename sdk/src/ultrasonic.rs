//! Ultrasonic distance sensor on an `A*` or `D*` port
//!
//! On `A1` and `A3` the plate MCU times the echo and publishes centimetres in a register.
//! On a digital port the host triggers and times the echo on the port's first pin.
//! Either way a worker samples the sensor and keeps a median of the last readings.

use std::{
    collections::VecDeque,
    fmt::{Debug, Formatter},
    sync::{Arc, Condvar, Mutex, MutexGuard},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::{bail, Context};
use common::{
    error::{LogErrorExt, SdkError},
    ports::{Port, PortKind},
};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde_json::json;
use tracing::{debug, span, trace, Level};

use crate::{
    board::Board,
    component::{config_bool, config_f64, config_str, config_usize, Component, Config, Registry, StateMap},
    digital::{GpioProvider, InputLine},
    plate::Plate,
    ports::PortClaim,
    system::EventSlot,
};

pub const REGISTER_A1_CONFIG: u8 = 0x0C;
pub const REGISTER_A3_CONFIG: u8 = 0x0D;
pub const REGISTER_A1_DATA: u8 = 0x10;
pub const REGISTER_A3_DATA: u8 = 0x12;

pub const CONFIG_ENABLE: u8 = 0x01;
pub const CONFIG_DISABLE: u8 = 0x00;

pub const SAMPLE_PERIOD: Duration = Duration::from_millis(100);
pub const ECHO_TIMEOUT: Duration = Duration::from_millis(200);
const TRIGGER_PULSE: Duration = Duration::from_micros(10);

/// Metres per second at 20 °C
pub const SPEED_OF_SOUND: f64 = 343.26;

/// Filtering and thresholds of an [`UltrasonicSensor`], distances in metres
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RangeSettings {
    /// Readings the median is taken over
    pub queue_len: usize,
    /// Readings beyond this are clamped to it
    pub max_distance: f64,
    /// Anything closer is in range
    pub threshold_distance: f64,
    /// Report a median before the queue has filled
    pub partial: bool,
}

impl Default for RangeSettings {
    fn default() -> Self {
        Self {
            queue_len: 5,
            max_distance: 3.0,
            threshold_distance: 0.3,
            partial: false,
        }
    }
}

impl RangeSettings {
    fn validate(&self) -> anyhow::Result<()> {
        if self.queue_len == 0 {
            bail!(SdkError::validation("Queue length must be at least 1"));
        }
        check_max_distance(self.max_distance)?;
        check_threshold_distance(self.threshold_distance)
    }
}

fn check_max_distance(max_distance: f64) -> anyhow::Result<()> {
    if !(max_distance.is_finite() && max_distance > 0.0) {
        bail!(SdkError::validation(format!(
            "Maximum distance must be positive, got {max_distance}"
        )));
    }
    Ok(())
}

fn check_threshold_distance(threshold_distance: f64) -> anyhow::Result<()> {
    if !(threshold_distance.is_finite() && threshold_distance >= 0.0) {
        bail!(SdkError::validation(format!(
            "Threshold distance can't be negative, got {threshold_distance}"
        )));
    }
    Ok(())
}

/// Takes raw readings in metres, infinite when nothing echoed back
trait Ranger: Send + Debug {
    fn measure(&mut self) -> anyhow::Result<f64>;

    /// Undoes any setup, called once sampling has stopped
    fn release(&mut self) -> anyhow::Result<()>;
}

#[derive(Debug)]
struct McuRanger {
    plate: Plate,
    config: u8,
    data: u8,
}

impl McuRanger {
    fn new(plate: Plate, config: u8, data: u8) -> anyhow::Result<Self> {
        plate
            .with_mcu(|mcu| mcu.write_byte(config, CONFIG_ENABLE))
            .context("Enable ultrasonic sensor")?;

        Ok(Self { plate, config, data })
    }
}

impl Ranger for McuRanger {
    fn measure(&mut self) -> anyhow::Result<f64> {
        let data = self.data;
        let centimetres = self
            .plate
            .with_mcu(|mcu| mcu.read_unsigned_word(data, true))?;

        // The MCU reports 0 when the echo timed out
        if centimetres == 0 {
            return Ok(f64::INFINITY);
        }
        Ok(centimetres as f64 / 100.0)
    }

    fn release(&mut self) -> anyhow::Result<()> {
        let config = self.config;
        self.plate
            .with_mcu(|mcu| mcu.write_byte(config, CONFIG_DISABLE))
            .context("Disable ultrasonic sensor")
    }
}

/// Trigger and echo share one GPIO line, which switches direction per reading
#[derive(Debug)]
struct EchoRanger {
    gpio: Arc<dyn GpioProvider>,
    pin: u8,
}

impl Ranger for EchoRanger {
    fn measure(&mut self) -> anyhow::Result<f64> {
        {
            let mut trigger = self
                .gpio
                .output(self.pin)
                .context("Trigger ultrasonic sensor")?;
            trigger.set(true)?;
            thread::sleep(TRIGGER_PULSE);
            trigger.set(false)?;
        }

        let echo = self.gpio.input(self.pin).context("Listen for echo")?;
        let Some(rise) = wait_for_level(&*echo, true, ECHO_TIMEOUT)? else {
            return Ok(f64::INFINITY);
        };
        let Some(fall) = wait_for_level(&*echo, false, ECHO_TIMEOUT)? else {
            return Ok(f64::INFINITY);
        };

        Ok(echo_distance(fall - rise))
    }

    fn release(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Spins until `line` reads `high`, returning when it did
fn wait_for_level(
    line: &dyn InputLine,
    high: bool,
    timeout: Duration,
) -> anyhow::Result<Option<Instant>> {
    let start = Instant::now();
    loop {
        if line.is_high()? == high {
            return Ok(Some(Instant::now()));
        }
        if start.elapsed() > timeout {
            return Ok(None);
        }
        std::hint::spin_loop();
    }
}

/// Sound travels there and back, rounded to the centimetre
pub fn echo_distance(round_trip: Duration) -> f64 {
    let distance = round_trip.as_secs_f64() * SPEED_OF_SOUND / 2.0;
    (distance * 100.0).round() / 100.0
}

#[derive(Debug)]
struct Ranging {
    settings: RangeSettings,
    readings: VecDeque<f64>,
    in_range: Option<bool>,
}

impl Ranging {
    fn new(settings: RangeSettings) -> Self {
        Self {
            settings,
            readings: VecDeque::with_capacity(settings.queue_len),
            in_range: None,
        }
    }

    fn median(&self) -> Option<f64> {
        let len = self.readings.len();
        if len == 0 || (!self.settings.partial && len < self.settings.queue_len) {
            return None;
        }

        let mut sorted: Vec<f64> = self.readings.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);

        let middle = len / 2;
        if len % 2 == 1 {
            Some(sorted[middle])
        } else {
            Some((sorted[middle - 1] + sorted[middle]) / 2.0)
        }
    }

    fn distance(&self) -> Option<f64> {
        self.median()
            .map(|median| median.min(self.settings.max_distance))
    }

    /// Records a reading, returning the new range state when it flipped
    fn push(&mut self, reading: f64) -> Option<bool> {
        self.readings.push_back(reading);
        while self.readings.len() > self.settings.queue_len {
            self.readings.pop_front();
        }

        let in_range = self.distance()? < self.settings.threshold_distance;
        // The first state is only recorded, nothing changed yet
        match self.in_range.replace(in_range) {
            Some(previous) if previous != in_range => Some(in_range),
            _ => None,
        }
    }
}

struct Shared {
    ranging: Mutex<Ranging>,
    changed: Condvar,
    when_in_range: EventSlot,
    when_out_of_range: EventSlot,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Ranging> {
        self.ranging
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, reading: f64) {
        let flipped = self.lock().push(reading);
        self.changed.notify_all();

        let slot = match flipped {
            Some(true) => &self.when_in_range,
            Some(false) => &self.when_out_of_range,
            None => return,
        };
        if let Some(callback) = slot.get() {
            callback();
        }
    }

    /// Waits until `ready` holds, false on timeout
    fn wait_until(&self, timeout: Duration, ready: impl Fn(&Ranging) -> bool) -> bool {
        let (ranging, _) = self
            .changed
            .wait_timeout_while(self.lock(), timeout, |ranging| !ready(ranging))
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        ready(&ranging)
    }
}

struct Sampler {
    stop: Sender<()>,
    handle: JoinHandle<Box<dyn Ranger>>,
}

fn sample(mut ranger: Box<dyn Ranger>, shared: Arc<Shared>, stopped: Receiver<()>) -> Box<dyn Ranger> {
    let _span = span!(Level::INFO, "Ultrasonic sampling thread").entered();

    let mut deadline = Instant::now();
    loop {
        match ranger.measure() {
            Ok(reading) => shared.record(reading),
            err => err.log_error("Read ultrasonic sensor"),
        }

        deadline += SAMPLE_PERIOD;
        let now = Instant::now();
        if deadline < now {
            // Echo timing overran the period, don't try to catch up
            deadline = now;
        }

        match stopped.recv_timeout(deadline - now) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => break,
        }
    }

    debug!("Exiting sampling loop");
    ranger
}

/// Resolves how the sensor on `port` is read
fn ranger_for(board: &Board, port: Port) -> anyhow::Result<Box<dyn Ranger>> {
    let registers = match (port.kind(), port.label()) {
        (PortKind::Analog, "A1") => (REGISTER_A1_CONFIG, REGISTER_A1_DATA),
        (PortKind::Analog, "A3") => (REGISTER_A3_CONFIG, REGISTER_A3_DATA),
        (PortKind::Analog, _) => bail!(SdkError::validation(format!(
            "Ultrasonic sensors on analog ports must use A1 or A3, got {port}"
        ))),
        (PortKind::Digital, _) => {
            return Ok(Box::new(EchoRanger {
                gpio: board.gpio().clone(),
                pin: port.gpio(1)?,
            }))
        }
        _ => bail!(SdkError::validation(format!(
            "Ultrasonic sensors must be connected to A1, A3 or a digital port, got {port}"
        ))),
    };

    let (config, data) = registers;
    Ok(Box::new(McuRanger::new(board.plate().clone(), config, data)?))
}

/// Distance to whatever is in front of the sensor, sampled in the background
pub struct UltrasonicSensor {
    name: String,
    claim: PortClaim,
    shared: Arc<Shared>,
    sampler: Option<Sampler>,
}

impl UltrasonicSensor {
    #[tracing::instrument(skip(board))]
    pub fn new(
        board: &Board,
        port_name: &str,
        settings: RangeSettings,
        name: &str,
    ) -> anyhow::Result<Self> {
        trace!("UltrasonicSensor::new()");

        settings.validate()?;
        let port = Port::parse(port_name)?;
        if !matches!(port.kind(), PortKind::Analog | PortKind::Digital) {
            bail!(SdkError::validation(format!(
                "Ultrasonic sensors must be connected to A1, A3 or a digital port, got {port}"
            )));
        }

        let claim = board.ports().claim_port(port, "UltrasonicSensor")?;
        let ranger = ranger_for(board, port)?;

        let shared = Arc::new(Shared {
            ranging: Mutex::new(Ranging::new(settings)),
            changed: Condvar::new(),
            when_in_range: EventSlot::default(),
            when_out_of_range: EventSlot::default(),
        });

        let (stop, stopped) = bounded::<()>(0);
        let worker_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("ultrasonic".to_owned())
            .spawn(move || sample(ranger, worker_shared, stopped))
            .context("Spawn ultrasonic sampling thread")?;

        Ok(Self {
            name: name.to_owned(),
            claim,
            shared,
            sampler: Some(Sampler { stop, handle }),
        })
    }

    pub(crate) fn from_config(board: &Board, config: &Config) -> anyhow::Result<Box<dyn Component>> {
        let settings = RangeSettings {
            queue_len: config_usize(config, "queue_len")?,
            max_distance: config_f64(config, "max_distance")?,
            threshold_distance: config_f64(config, "threshold_distance")?,
            partial: config_bool(config, "partial")?,
        };

        Ok(Box::new(UltrasonicSensor::new(
            board,
            config_str(config, "port_name")?,
            settings,
            config_str(config, "name")?,
        )?))
    }

    pub fn port(&self) -> Port {
        self.claim.port()
    }

    pub fn settings(&self) -> RangeSettings {
        self.shared.lock().settings
    }

    pub fn max_distance(&self) -> f64 {
        self.settings().max_distance
    }

    /// Keeps the threshold distance, so the threshold fraction moves
    pub fn set_max_distance(&self, max_distance: f64) -> anyhow::Result<()> {
        check_max_distance(max_distance)?;
        self.shared.lock().settings.max_distance = max_distance;
        Ok(())
    }

    pub fn threshold_distance(&self) -> f64 {
        self.settings().threshold_distance
    }

    pub fn set_threshold_distance(&self, threshold_distance: f64) -> anyhow::Result<()> {
        check_threshold_distance(threshold_distance)?;
        self.shared.lock().settings.threshold_distance = threshold_distance;
        Ok(())
    }

    /// Threshold as a fraction of the maximum distance
    pub fn threshold(&self) -> f64 {
        let settings = self.settings();
        settings.threshold_distance / settings.max_distance
    }

    /// Filtered distance in metres, `None` until enough readings came in
    pub fn distance(&self) -> Option<f64> {
        self.shared.lock().distance()
    }

    /// Distance as a fraction of the maximum, 0 to 1
    pub fn value(&self) -> Option<f64> {
        let ranging = self.shared.lock();
        ranging
            .distance()
            .map(|distance| distance / ranging.settings.max_distance)
    }

    pub fn in_range(&self) -> Option<bool> {
        self.shared.lock().in_range
    }

    pub fn wait_for_distance(&self, timeout: Duration) -> Option<f64> {
        self.shared
            .wait_until(timeout, |ranging| ranging.distance().is_some());
        self.distance()
    }

    pub fn wait_for_in_range(&self, timeout: Duration) -> bool {
        self.shared
            .wait_until(timeout, |ranging| ranging.in_range == Some(true))
    }

    pub fn wait_for_out_of_range(&self, timeout: Duration) -> bool {
        self.shared
            .wait_until(timeout, |ranging| ranging.in_range == Some(false))
    }

    /// Runs on the sampling thread, must not block
    pub fn when_in_range(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.shared.when_in_range.set(Arc::new(callback));
    }

    /// Runs on the sampling thread, must not block
    pub fn when_out_of_range(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.shared.when_out_of_range.set(Arc::new(callback));
    }

    /// Stops sampling and releases the MCU channel, idempotent
    fn shutdown(&mut self) -> anyhow::Result<()> {
        let Some(sampler) = self.sampler.take() else {
            return Ok(());
        };

        drop(sampler.stop);
        match sampler.handle.join() {
            Ok(mut ranger) => ranger.release(),
            Err(_) => bail!("Ultrasonic sampling thread panicked"),
        }
    }
}

impl Component for UltrasonicSensor {
    fn class_name(&self) -> &'static str {
        "UltrasonicSensor"
    }

    fn module(&self) -> &'static str {
        module_path!()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn own_state(&self) -> StateMap {
        let mut state = StateMap::new();
        state.insert("distance".to_owned(), json!(self.distance()));
        state
    }

    fn user_config(&self) -> Config {
        let settings = self.settings();

        let mut config = Config::new();
        config.insert("port_name".to_owned(), self.port().label().into());
        config.insert("queue_len".to_owned(), json!(settings.queue_len));
        config.insert("partial".to_owned(), json!(settings.partial));
        config.insert("max_distance".to_owned(), json!(settings.max_distance));
        config.insert("threshold_distance".to_owned(), json!(settings.threshold_distance));
        config.insert("name".to_owned(), self.name.clone().into());
        config
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.shutdown()
    }
}

impl Drop for UltrasonicSensor {
    fn drop(&mut self) {
        self.shutdown().log_error("Close ultrasonic sensor");
    }
}

impl Debug for UltrasonicSensor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UltrasonicSensor")
            .field("name", &self.name)
            .field("port", &self.port())
            .field("ranging", &*self.shared.lock())
            .finish_non_exhaustive()
    }
}

pub(crate) fn register(registry: &mut Registry) {
    registry.register(module_path!(), "UltrasonicSensor", UltrasonicSensor::from_config);
}
