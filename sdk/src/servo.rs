//! Hobby servos on the `S*` ports, driven open loop by the plate MCU

use anyhow::bail;
use common::{
    error::SdkError,
    ports::Port,
    types::{Degrees, DegreesPerSecond},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{trace, warn};

use crate::{
    board::Board,
    component::{config_f64, config_str, Component, Config, Registry, StateMap},
    plate::Plate,
    ports::PortClaim,
};

pub const REGISTER_CONTROL_MODE: u8 = 0x50;
pub const REGISTER_SPEED: u8 = 0x56;
pub const REGISTER_ANGLE_AND_SPEED: u8 = 0x5C;

pub const REGISTER_MIN_PULSE_WIDTH: u8 = 0x4A;
pub const REGISTER_MAX_PULSE_WIDTH: u8 = 0x4B;
pub const REGISTER_PWM_FREQUENCY: u8 = 0x4C;

pub const SERVO_BANKS: u8 = 4;
pub const PWM_FREQUENCY: u8 = 60;
pub const MIN_PULSE_WIDTH_US: u16 = 500;
pub const MAX_PULSE_WIDTH_US: u16 = 2500;

pub const ANGLE_RANGE: f64 = 180.0;
pub const SPEED_RANGE: f64 = 100.0;
pub const DEFAULT_SPEED: f64 = 50.0;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ServoControlMode {
    Speed = 0,
    Angle = 1,
}

/// Angle and speed of a servo horn
#[derive(Debug, Copy, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServoMotorState {
    pub angle: Degrees,
    pub speed: DegreesPerSecond,
}

/// Raw register access to one servo bank
#[derive(Clone, Debug)]
pub struct ServoController {
    plate: Plate,
    bank: u8,
}

impl ServoController {
    /// Also writes the shared pulse setup, which every bank uses
    pub fn new(plate: Plate, bank: u8) -> anyhow::Result<Self> {
        if bank >= SERVO_BANKS {
            bail!(SdkError::validation(format!(
                "Servo bank must be below {SERVO_BANKS}, got {bank}"
            )));
        }

        plate.with_mcu(|mcu| {
            mcu.write_word(REGISTER_MIN_PULSE_WIDTH, MIN_PULSE_WIDTH_US, true)?;
            mcu.write_word(REGISTER_MAX_PULSE_WIDTH, MAX_PULSE_WIDTH_US, true)?;
            mcu.write_byte(REGISTER_PWM_FREQUENCY, PWM_FREQUENCY)
        })?;

        Ok(Self { plate, bank })
    }

    pub fn bank(&self) -> u8 {
        self.bank
    }

    fn register(&self, base: u8) -> u8 {
        base + self.bank
    }

    pub fn control_mode(&self) -> anyhow::Result<ServoControlMode> {
        let register = self.register(REGISTER_CONTROL_MODE);
        match self.plate.with_mcu(|mcu| mcu.read_unsigned_byte(register))? {
            0 => Ok(ServoControlMode::Speed),
            1 => Ok(ServoControlMode::Angle),
            other => bail!(SdkError::Protocol(format!(
                "Servo reported unknown control mode {other}"
            ))),
        }
    }

    pub fn set_control_mode(&self, mode: ServoControlMode) -> anyhow::Result<()> {
        let register = self.register(REGISTER_CONTROL_MODE);
        self.plate
            .with_mcu(|mcu| mcu.write_byte(register, mode as u8))
    }

    /// Packs `angle` (clipped to the hardware range) and `speed` into one transfer
    pub fn set_target_angle(&self, angle: f64, speed: f64) -> anyhow::Result<()> {
        check_speed(speed)?;

        let half_range = ANGLE_RANGE / 2.0;
        let angle = angle.clamp(-half_range, half_range).round() as i16;
        let speed = (speed.abs() * 10.0).round() as u16;

        let mut payload = [0; 4];
        payload[..2].copy_from_slice(&angle.to_le_bytes());
        payload[2..].copy_from_slice(&speed.to_le_bytes());

        self.set_control_mode(ServoControlMode::Angle)?;
        let register = self.register(REGISTER_ANGLE_AND_SPEED);
        self.plate.with_mcu(|mcu| mcu.write(register, &payload))
    }

    /// Last `(angle, speed)` target, `None` outside of angle mode
    pub fn target_angle_and_speed(&self) -> anyhow::Result<Option<(f64, f64)>> {
        if self.control_mode()? != ServoControlMode::Angle {
            return Ok(None);
        }

        let register = self.register(REGISTER_ANGLE_AND_SPEED);
        let bytes = self.plate.with_mcu(|mcu| mcu.read_bulk(register, 4))?;
        let angle = i16::from_le_bytes([bytes[0], bytes[1]]);
        let speed = u16::from_le_bytes([bytes[2], bytes[3]]);

        Ok(Some((angle as f64, speed as f64 / 10.0)))
    }

    /// Continuous rotation at `speed`, -100 to 100
    pub fn set_target_speed(&self, speed: f64) -> anyhow::Result<()> {
        check_speed(speed)?;

        self.set_control_mode(ServoControlMode::Speed)?;
        let register = self.register(REGISTER_SPEED);
        let speed = (speed * 10.0).round() as i16;
        self.plate
            .with_mcu(|mcu| mcu.write_signed_word(register, speed, true))
    }

    pub fn target_speed(&self) -> anyhow::Result<Option<f64>> {
        if self.control_mode()? != ServoControlMode::Speed {
            return Ok(None);
        }

        let register = self.register(REGISTER_SPEED);
        let speed = self
            .plate
            .with_mcu(|mcu| mcu.read_signed_word(register, true))?;

        Ok(Some(speed as f64 / 10.0))
    }
}

pub(crate) fn check_speed(speed: f64) -> anyhow::Result<()> {
    if !(-SPEED_RANGE..=SPEED_RANGE).contains(&speed) {
        bail!(SdkError::validation(format!(
            "Servo speed must be between -{SPEED_RANGE} and {SPEED_RANGE}, got {speed}"
        )));
    }
    Ok(())
}

/// A servo whose angles are relative to a movable zero point
#[derive(Debug)]
pub struct ServoMotor {
    name: String,
    claim: PortClaim,
    controller: ServoController,
    zero_point: f64,
    target: ServoMotorState,
    has_moved: bool,
}

impl ServoMotor {
    #[tracing::instrument(skip(board))]
    pub fn new(board: &Board, port_name: &str, zero_point: f64, name: &str) -> anyhow::Result<Self> {
        trace!("ServoMotor::new()");

        let port = Port::parse(port_name)?;
        let bank = port.servo_bank()?;
        check_zero_point(zero_point)?;

        let claim = board.ports().claim_port(port, "ServoMotor")?;
        let controller = board.plate().servo(bank)?;

        Ok(Self {
            name: name.to_owned(),
            claim,
            controller,
            zero_point,
            target: ServoMotorState::default(),
            has_moved: false,
        })
    }

    fn from_config(board: &Board, config: &Config) -> anyhow::Result<Box<dyn Component>> {
        Ok(Box::new(ServoMotor::new(
            board,
            config_str(config, "port_name")?,
            config_f64(config, "zero_point")?,
            config_str(config, "name")?,
        )?))
    }

    pub fn port(&self) -> Port {
        self.claim.port()
    }

    pub fn controller(&self) -> &ServoController {
        &self.controller
    }

    pub fn zero_point(&self) -> f64 {
        self.zero_point
    }

    /// Moves the zero, so `angle_range` shifts the opposite way
    pub fn set_zero_point(&mut self, zero_point: f64) -> anyhow::Result<()> {
        check_zero_point(zero_point)?;
        self.zero_point = zero_point;
        Ok(())
    }

    /// Reachable `(min, max)` angles relative to the zero point
    pub fn angle_range(&self) -> (f64, f64) {
        let half_range = ANGLE_RANGE / 2.0;
        (-half_range - self.zero_point, half_range - self.zero_point)
    }

    pub fn set_state(&mut self, state: ServoMotorState) -> anyhow::Result<()> {
        let (min, max) = self.angle_range();
        let ServoMotorState {
            angle: Degrees(angle),
            speed: DegreesPerSecond(speed),
        } = state;

        if !(min..=max).contains(&angle) {
            bail!(SdkError::validation(format!(
                "Angle must be between {min} and {max} degrees, got {angle}"
            )));
        }

        self.controller
            .set_target_angle(angle + self.zero_point, speed)?;
        self.target = state;
        self.has_moved = true;

        Ok(())
    }

    /// Last target the MCU holds, `None` until the servo has been moved
    pub fn state(&self) -> anyhow::Result<Option<ServoMotorState>> {
        if !self.has_moved {
            warn!("Servo {} has to move before its state can be read", self.name);
            return Ok(None);
        }

        let Some((angle, speed)) = self.controller.target_angle_and_speed()? else {
            return Ok(None);
        };

        Ok(Some(ServoMotorState {
            angle: Degrees(angle - self.zero_point),
            speed: DegreesPerSecond(speed),
        }))
    }

    pub fn target_angle(&self) -> Degrees {
        self.target.angle
    }

    pub fn set_target_angle(&mut self, angle: f64) -> anyhow::Result<()> {
        self.set_state(ServoMotorState {
            angle: Degrees(angle),
            speed: DegreesPerSecond(DEFAULT_SPEED),
        })
    }

    pub fn target_speed(&self) -> DegreesPerSecond {
        self.target.speed
    }

    /// Sweeps toward the end of the range the sign of `speed` points at
    pub fn set_target_speed(&mut self, speed: f64) -> anyhow::Result<()> {
        let (min, max) = self.angle_range();
        let angle = if speed < 0.0 { min } else { max };

        self.set_state(ServoMotorState {
            angle: Degrees(angle),
            speed: DegreesPerSecond(speed),
        })
    }
}

fn check_zero_point(zero_point: f64) -> anyhow::Result<()> {
    let half_range = ANGLE_RANGE / 2.0;
    if !(-half_range..=half_range).contains(&zero_point) {
        bail!(SdkError::validation(format!(
            "Zero point must be between -{half_range} and {half_range} degrees, got {zero_point}"
        )));
    }
    Ok(())
}

impl Component for ServoMotor {
    fn class_name(&self) -> &'static str {
        "ServoMotor"
    }

    fn module(&self) -> &'static str {
        module_path!()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn own_state(&self) -> StateMap {
        let mut state = StateMap::new();
        state.insert("target_angle".to_owned(), json!(self.target.angle));
        state.insert("target_speed".to_owned(), json!(self.target.speed));
        state.insert("zero_point".to_owned(), json!(self.zero_point));
        state
    }

    fn user_config(&self) -> Config {
        let mut config = Config::new();
        config.insert("port_name".to_owned(), self.port().label().into());
        config.insert("zero_point".to_owned(), json!(self.zero_point));
        config.insert("name".to_owned(), self.name.clone().into());
        config
    }
}

pub(crate) fn register(registry: &mut Registry) {
    registry.register(module_path!(), "ServoMotor", ServoMotor::from_config);
}
