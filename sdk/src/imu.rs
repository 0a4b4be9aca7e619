//! Inertial measurements from the IMU behind the plate MCU

use std::{
    fmt::{Debug, Formatter},
    sync::{Arc, Mutex, MutexGuard},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use ahrs::{Ahrs, Madgwick};
use anyhow::{anyhow, bail, Context};
use common::{
    error::LogErrorExt,
    types::{Axes, Celsius, Degrees, DegreesPerSecond, Gauss, MetersPerSecondSquared, Orientation},
};
use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use nalgebra::Vector3;
use tracing::{debug, error, span, trace, warn, Level};

use crate::plate::Plate;

pub const REGISTER_ACCELEROMETER: u8 = 0x80;
pub const REGISTER_GYROSCOPE: u8 = 0x83;
pub const REGISTER_MAGNETOMETER: u8 = 0x86;
pub const REGISTER_TEMPERATURE: u8 = 0x8C;

pub const REGISTER_ACCELEROMETER_SCALE: u8 = 0xA0;
pub const REGISTER_GYROSCOPE_SCALE: u8 = 0xA2;

const FULL_SCALE_COUNTS: f64 = 32768.0;
const STANDARD_GRAVITY: f64 = 9.80665;

/// Rate the orientation filter is fed at
pub const FUSION_PERIOD: Duration = Duration::from_millis(20);
const MADGWICK_BETA: f64 = 0.041;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ImuSensor {
    Accelerometer,
    Gyroscope,
    Magnetometer,
    Orientation,
}

impl ImuSensor {
    pub fn enable_register(self) -> u8 {
        match self {
            ImuSensor::Accelerometer => 0x90,
            ImuSensor::Gyroscope => 0x91,
            ImuSensor::Magnetometer => 0x92,
            ImuSensor::Orientation => 0x93,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Accelerometer full scale in g
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum AccelerometerScale {
    #[default]
    G2,
    G4,
    G8,
    G16,
}

impl AccelerometerScale {
    pub fn g(self) -> f64 {
        match self {
            AccelerometerScale::G2 => 2.0,
            AccelerometerScale::G4 => 4.0,
            AccelerometerScale::G8 => 8.0,
            AccelerometerScale::G16 => 16.0,
        }
    }
}

/// Gyroscope full scale in degrees per second
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum GyroscopeScale {
    #[default]
    Dps250,
    Dps500,
    Dps1000,
    Dps2000,
}

impl GyroscopeScale {
    pub fn dps(self) -> f64 {
        match self {
            GyroscopeScale::Dps250 => 250.0,
            GyroscopeScale::Dps500 => 500.0,
            GyroscopeScale::Dps1000 => 1000.0,
            GyroscopeScale::Dps2000 => 2000.0,
        }
    }
}

#[derive(Debug, Default)]
struct ImuState {
    enabled: [bool; 4],
    accelerometer_scale: AccelerometerScale,
    gyroscope_scale: GyroscopeScale,
}

/// Register level access, shared with the fusion worker
#[derive(Clone, Debug)]
struct ImuRegisters {
    plate: Plate,
    state: Arc<Mutex<ImuState>>,
}

impl ImuRegisters {
    fn lock(&self) -> MutexGuard<'_, ImuState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_enabled(&self, sensor: ImuSensor, enabled: bool) -> anyhow::Result<()> {
        let register = sensor.enable_register();
        self.plate
            .with_mcu(|mcu| mcu.write_word(register, u16::from(enabled), true))
            .with_context(|| format!("Set {sensor:?} enabled to {enabled}"))?;

        self.lock().enabled[sensor.index()] = enabled;
        Ok(())
    }

    fn ensure_enabled(&self, sensor: ImuSensor) -> anyhow::Result<()> {
        if !self.lock().enabled[sensor.index()] {
            debug!("Enabling {sensor:?}");
            self.set_enabled(sensor, true)?;
        }
        Ok(())
    }

    fn read_axes(&self, sensor: ImuSensor, base: u8) -> anyhow::Result<Axes<f64>> {
        self.ensure_enabled(sensor)?;

        let [x, y, z] = self.plate.with_mcu(|mcu| {
            Ok([
                mcu.read_signed_word(base, true)?,
                mcu.read_signed_word(base + 1, true)?,
                mcu.read_signed_word(base + 2, true)?,
            ])
        })?;

        Ok(Axes::new(x as f64, y as f64, z as f64))
    }

    fn acceleration(&self) -> anyhow::Result<Axes<MetersPerSecondSquared>> {
        let g = self.lock().accelerometer_scale.g();
        let raw = self.read_axes(ImuSensor::Accelerometer, REGISTER_ACCELEROMETER)?;

        Ok(raw.map(|counts| MetersPerSecondSquared(counts / (FULL_SCALE_COUNTS / g) * STANDARD_GRAVITY)))
    }

    fn angular_rate(&self) -> anyhow::Result<Axes<DegreesPerSecond>> {
        let dps = self.lock().gyroscope_scale.dps();
        let raw = self.read_axes(ImuSensor::Gyroscope, REGISTER_GYROSCOPE)?;

        Ok(raw.map(|counts| DegreesPerSecond(counts / (FULL_SCALE_COUNTS / dps))))
    }
}

struct Fusion {
    orientation: Arc<Mutex<Orientation>>,
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// The plate's 9 axis IMU
///
/// Sensors are enabled on first read and disabled again on drop. Orientation comes
/// from a Madgwick filter fed by a worker thread, started on the first
/// [`Imu::read_orientation`].
pub struct Imu {
    registers: ImuRegisters,
    fusion: Mutex<Option<Fusion>>,
}

impl Imu {
    #[tracing::instrument]
    pub fn new(plate: Plate) -> Self {
        trace!("Imu::new()");

        Self {
            registers: ImuRegisters {
                plate,
                state: Default::default(),
            },
            fusion: Mutex::new(None),
        }
    }

    pub fn set_enabled(&self, sensor: ImuSensor, enabled: bool) -> anyhow::Result<()> {
        self.registers.set_enabled(sensor, enabled)
    }

    pub fn is_enabled(&self, sensor: ImuSensor) -> bool {
        self.registers.lock().enabled[sensor.index()]
    }

    pub fn set_accelerometer_scale(&self, scale: AccelerometerScale) -> anyhow::Result<()> {
        self.registers
            .plate
            .with_mcu(|mcu| mcu.write_byte(REGISTER_ACCELEROMETER_SCALE, scale as u8))?;
        self.registers.lock().accelerometer_scale = scale;
        Ok(())
    }

    pub fn set_gyroscope_scale(&self, scale: GyroscopeScale) -> anyhow::Result<()> {
        self.registers
            .plate
            .with_mcu(|mcu| mcu.write_byte(REGISTER_GYROSCOPE_SCALE, scale as u8))?;
        self.registers.lock().gyroscope_scale = scale;
        Ok(())
    }

    pub fn read_acceleration(&self) -> anyhow::Result<Axes<MetersPerSecondSquared>> {
        self.registers.acceleration()
    }

    pub fn read_gyroscope(&self) -> anyhow::Result<Axes<DegreesPerSecond>> {
        self.registers.angular_rate()
    }

    /// The magnetometer reports milligauss
    pub fn read_magnetometer(&self) -> anyhow::Result<Axes<Gauss>> {
        let raw = self
            .registers
            .read_axes(ImuSensor::Magnetometer, REGISTER_MAGNETOMETER)?;

        Ok(raw.map(|milligauss| Gauss(milligauss / 1000.0)))
    }

    /// Die temperature, reported in hundredths of a degree
    pub fn read_temperature(&self) -> anyhow::Result<Celsius> {
        let raw = self
            .registers
            .plate
            .with_mcu(|mcu| mcu.read_signed_word(REGISTER_TEMPERATURE, true))?;

        Ok(Celsius(raw as f64 / 100.0))
    }

    /// Compass heading from the magnetometer, 0 to 360 with the board held level
    pub fn read_heading(&self) -> anyhow::Result<Degrees> {
        let mag = self.read_magnetometer()?;
        let heading = mag.y.0.atan2(mag.x.0).to_degrees();

        Ok(Degrees(heading.rem_euclid(360.0)))
    }

    /// Roll and pitch from gravity alone, yaw is always zero
    pub fn read_accelerometer_orientation(&self) -> anyhow::Result<Orientation> {
        let Axes { x, y, z } = self.read_acceleration()?.map(|accel| accel.0);

        Ok(Orientation {
            roll: Degrees::from_radians(x.atan2((y * y + z * z).sqrt())),
            pitch: Degrees::from_radians((-y).atan2((x * x + z * z).sqrt())),
            yaw: Degrees(0.0),
        })
    }

    /// Latest output of the orientation filter, starting it if needed
    pub fn read_orientation(&self) -> anyhow::Result<Orientation> {
        let mut fusion = self.lock_fusion();

        if fusion.is_none() {
            *fusion = Some(self.start_fusion()?);
        }

        match &*fusion {
            Some(fusion) => Ok(*fusion
                .orientation
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())),
            None => bail!("Orientation filter is not running"),
        }
    }

    pub fn is_fusing(&self) -> bool {
        self.lock_fusion().is_some()
    }

    /// Stops the orientation worker, it restarts on the next read
    pub fn stop_orientation(&self) {
        let fusion = self.lock_fusion().take();

        if let Some(fusion) = fusion {
            drop(fusion.stop);
            if fusion.handle.join().is_err() {
                error!("Orientation thread panicked");
            }
        }
    }

    fn start_fusion(&self) -> anyhow::Result<Fusion> {
        // Fail here rather than on the worker if the sensors can't be reached
        self.registers.ensure_enabled(ImuSensor::Accelerometer)?;
        self.registers.ensure_enabled(ImuSensor::Gyroscope)?;

        let orientation = Arc::new(Mutex::new(Orientation::default()));
        let (stop, stopped) = bounded::<()>(0);

        let registers = self.registers.clone();
        let shared = orientation.clone();
        let handle = thread::Builder::new()
            .name("imu-fusion".to_owned())
            .spawn(move || {
                let _span = span!(Level::INFO, "Sensor fusion thread").entered();

                let mut filter = Madgwick::new(FUSION_PERIOD.as_secs_f64(), MADGWICK_BETA);
                let mut deadline = Instant::now() + FUSION_PERIOD;

                loop {
                    match fuse(&registers, &mut filter) {
                        Ok(update) => {
                            *shared
                                .lock()
                                .unwrap_or_else(|poisoned| poisoned.into_inner()) = update
                        }
                        err => err.log_error("Update orientation"),
                    }

                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        warn!("Behind schedule");
                    }
                    deadline += FUSION_PERIOD;

                    match stopped.recv_timeout(remaining) {
                        Err(RecvTimeoutError::Timeout) => {}
                        _ => break,
                    }
                }

                debug!("Exiting fusion loop");
            })
            .context("Spawn orientation thread")?;

        Ok(Fusion {
            orientation,
            stop,
            handle,
        })
    }

    fn lock_fusion(&self) -> MutexGuard<'_, Option<Fusion>> {
        self.fusion
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn fuse(registers: &ImuRegisters, filter: &mut Madgwick<f64>) -> anyhow::Result<Orientation> {
    let gyro = registers.angular_rate()?;
    let accel = registers.acceleration()?;

    let gyro = Vector3::new(gyro.x.0, gyro.y.0, gyro.z.0) * (std::f64::consts::PI / 180.0);
    let accel = Vector3::new(accel.x.0, accel.y.0, accel.z.0);

    let quat = filter
        .update_imu(&gyro, &accel)
        .map_err(|err| anyhow!("{err:?}"))?;
    let (roll, pitch, yaw) = quat.euler_angles();

    Ok(Orientation {
        roll: Degrees::from_radians(roll),
        pitch: Degrees::from_radians(pitch),
        yaw: Degrees::from_radians(yaw),
    })
}

impl Drop for Imu {
    fn drop(&mut self) {
        self.stop_orientation();

        let enabled = self.registers.lock().enabled;
        for sensor in [
            ImuSensor::Accelerometer,
            ImuSensor::Gyroscope,
            ImuSensor::Magnetometer,
            ImuSensor::Orientation,
        ] {
            if enabled[sensor.index()] {
                self.registers
                    .set_enabled(sensor, false)
                    .log_error("Disable imu sensor");
            }
        }
    }
}

impl Debug for Imu {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Imu")
            .field("state", &*self.registers.lock())
            .field("fusing", &self.is_fusing())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRegisters;

    fn set_axes(registers: &MockRegisters, base: u8, values: [i16; 3]) {
        // Word registers overlap in the flat mock bank, only x reads back exactly
        for (offset, value) in values.iter().enumerate().rev() {
            registers.set(base + offset as u8, &value.to_le_bytes());
        }
    }

    #[test]
    fn enables_on_first_read() {
        let registers = MockRegisters::default();
        let imu = Imu::new(registers.plate());

        imu.read_acceleration().unwrap();
        imu.read_acceleration().unwrap();

        assert!(imu.is_enabled(ImuSensor::Accelerometer));
        assert_eq!(registers.writes_to(0x90), 1);
        assert_eq!(registers.writes_to(0x91), 0);

        drop(imu);
        assert_eq!(registers.writes_to(0x90), 2);
        assert_eq!(registers.get(0x90, 2), [0, 0]);
    }

    #[test]
    fn acceleration_scaling() {
        let registers = MockRegisters::default();
        let imu = Imu::new(registers.plate());

        set_axes(&registers, REGISTER_ACCELEROMETER, [16384, 0, 0]);
        let accel = imu.read_acceleration().unwrap();
        assert!((accel.x.0 - STANDARD_GRAVITY).abs() < 1e-9);

        imu.set_accelerometer_scale(AccelerometerScale::G8).unwrap();
        assert_eq!(registers.get(REGISTER_ACCELEROMETER_SCALE, 1), [2]);
        let accel = imu.read_acceleration().unwrap();
        assert!((accel.x.0 - 4.0 * STANDARD_GRAVITY).abs() < 1e-9);
    }

    #[test]
    fn gyro_temperature_and_magnetometer() {
        let registers = MockRegisters::default();
        let imu = Imu::new(registers.plate());

        imu.set_gyroscope_scale(GyroscopeScale::Dps2000).unwrap();
        assert_eq!(registers.get(REGISTER_GYROSCOPE_SCALE, 1), [3]);
        set_axes(&registers, REGISTER_GYROSCOPE, [-16384, 0, 0]);
        assert!((imu.read_gyroscope().unwrap().x.0 + 1000.0).abs() < 1e-9);

        registers.set(REGISTER_TEMPERATURE, &2150i16.to_le_bytes());
        assert_eq!(imu.read_temperature().unwrap(), Celsius(21.5));

        set_axes(&registers, REGISTER_MAGNETOMETER, [250, 0, 0]);
        assert_eq!(imu.read_magnetometer().unwrap().x, Gauss(0.25));
        assert_eq!(imu.read_heading().unwrap(), Degrees(0.0));
    }

    #[test]
    fn level_from_gravity() {
        let registers = MockRegisters::default();
        let imu = Imu::new(registers.plate());

        // Only z set: x and y words read zero
        registers.set(REGISTER_ACCELEROMETER + 2, &16384i16.to_le_bytes());
        registers.set(REGISTER_ACCELEROMETER, &[0, 0]);
        let orientation = imu.read_accelerometer_orientation().unwrap();

        assert!(orientation.roll.0.abs() < 1e-9);
        assert!(orientation.pitch.0.abs() < 1e-9);
    }

    #[test]
    fn fusion_worker_lifecycle() {
        let registers = MockRegisters::default();
        let imu = Imu::new(registers.plate());
        registers.set(REGISTER_ACCELEROMETER + 2, &16384i16.to_le_bytes());
        registers.set(REGISTER_ACCELEROMETER, &[0, 0]);

        imu.read_orientation().unwrap();
        assert!(imu.is_fusing());
        thread::sleep(FUSION_PERIOD * 5);

        let orientation = imu.read_orientation().unwrap();
        assert!(orientation.roll.0.abs() < 1.0);
        assert!(orientation.pitch.0.abs() < 1.0);

        let started = Instant::now();
        imu.stop_orientation();
        assert!(started.elapsed() < FUSION_PERIOD * 5);
        assert!(!imu.is_fusing());
    }

    #[test]
    fn unreachable_imu() {
        let registers = MockRegisters::default();
        let imu = Imu::new(registers.plate());
        registers.set_failing(true);

        assert!(imu.read_orientation().is_err());
        assert!(!imu.is_fusing());
    }
}
