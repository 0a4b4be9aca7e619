//! Encoder motors on the `M*` ports
//!
//! The plate MCU runs a closed loop speed controller for each motor. Values written to
//! the MCU are at the DC motor, before the gearbox, so everything the user sees is
//! scaled by [`GEAR_RATIO`].

use std::f64::consts::PI;

use anyhow::{bail, Context};
use common::{
    error::{LogErrorExt, SdkError},
    ports::Port,
    types::{Meters, MetersPerSecond, Rpm},
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, trace, warn};

use crate::{
    board::Board,
    component::{config_f64, config_str, Component, Config, Registry, StateMap},
    plate::Plate,
    ports::PortClaim,
};

pub const REGISTER_CONTROL_MODE: u8 = 0x60;
pub const REGISTER_POWER: u8 = 0x64;
pub const REGISTER_RPM: u8 = 0x68;
pub const REGISTER_RPM_WITH_ROTATIONS: u8 = 0x6C;
pub const REGISTER_BRAKE_TYPE: u8 = 0x70;
pub const REGISTER_TACHOMETER: u8 = 0x75;
pub const REGISTER_ODOMETER: u8 = 0x7A;

pub const MOTOR_BANKS: u8 = 4;
pub const MAX_POWER: i16 = 1000;
/// Readings past this are glitches on the encoder line
pub const MAX_TACHOMETER_RPM: i16 = 6000;
const TACHOMETER_ATTEMPTS: usize = 5;

pub const GEAR_RATIO: f64 = 41.8;
pub const MAX_DC_MOTOR_RPM: f64 = 4800.0;
pub const DEFAULT_WHEEL_DIAMETER: f64 = 0.075;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMode {
    Power = 0,
    Rpm = 1,
    RpmWithRotations = 2,
}

impl TryFrom<u8> for ControlMode {
    type Error = SdkError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ControlMode::Power),
            1 => Ok(ControlMode::Rpm),
            2 => Ok(ControlMode::RpmWithRotations),
            _ => Err(SdkError::Protocol(format!(
                "Motor reported unknown control mode {value}"
            ))),
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrakingType {
    #[default]
    Coast = 0,
    Brake = 1,
}

/// Shaft rotation that counts as moving forward
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardDirection {
    Clockwise,
    CounterClockwise,
}

impl ForwardDirection {
    pub fn sign(self) -> f64 {
        match self {
            ForwardDirection::Clockwise => 1.0,
            ForwardDirection::CounterClockwise => -1.0,
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum Direction {
    #[default]
    Forward,
    Back,
}

impl Direction {
    pub fn sign(self) -> f64 {
        match self {
            Direction::Forward => 1.0,
            Direction::Back => -1.0,
        }
    }
}

/// Raw register access to one motor bank
#[derive(Clone, Debug)]
pub struct EncoderMotorController {
    plate: Plate,
    bank: u8,
}

impl EncoderMotorController {
    pub fn new(plate: Plate, bank: u8) -> anyhow::Result<Self> {
        if bank >= MOTOR_BANKS {
            bail!(SdkError::validation(format!(
                "Motor bank must be below {MOTOR_BANKS}, got {bank}"
            )));
        }

        Ok(Self { plate, bank })
    }

    pub fn bank(&self) -> u8 {
        self.bank
    }

    fn register(&self, base: u8) -> u8 {
        base + self.bank
    }

    pub fn control_mode(&self) -> anyhow::Result<ControlMode> {
        let register = self.register(REGISTER_CONTROL_MODE);
        let mode = self.plate.with_mcu(|mcu| mcu.read_unsigned_byte(register))?;

        Ok(ControlMode::try_from(mode)?)
    }

    pub fn set_control_mode(&self, mode: ControlMode) -> anyhow::Result<()> {
        let register = self.register(REGISTER_CONTROL_MODE);
        self.plate
            .with_mcu(|mcu| mcu.write_byte(register, mode as u8))
    }

    pub fn braking_type(&self) -> anyhow::Result<BrakingType> {
        let register = self.register(REGISTER_BRAKE_TYPE);
        match self.plate.with_mcu(|mcu| mcu.read_unsigned_byte(register))? {
            0 => Ok(BrakingType::Coast),
            1 => Ok(BrakingType::Brake),
            other => bail!(SdkError::Protocol(format!(
                "Motor reported unknown braking type {other}"
            ))),
        }
    }

    pub fn set_braking_type(&self, braking_type: BrakingType) -> anyhow::Result<()> {
        let register = self.register(REGISTER_BRAKE_TYPE);
        self.plate
            .with_mcu(|mcu| mcu.write_byte(register, braking_type as u8))
    }

    /// Measured DC motor rpm
    pub fn tachometer(&self) -> anyhow::Result<i16> {
        let register = self.register(REGISTER_TACHOMETER);

        for _ in 0..TACHOMETER_ATTEMPTS {
            let rpm = self
                .plate
                .with_mcu(|mcu| mcu.read_signed_word(register, true))?;

            if rpm.unsigned_abs() <= MAX_TACHOMETER_RPM as u16 {
                return Ok(rpm);
            }
            debug!("Discarding tachometer reading {rpm}");
        }

        bail!(SdkError::bus(format!(
            "Tachometer of motor bank {} kept reading out of range",
            self.bank
        )))
    }

    /// DC motor rotations since power on, in encoder units
    pub fn odometer(&self) -> anyhow::Result<i32> {
        let register = self.register(REGISTER_ODOMETER);
        self.plate
            .with_mcu(|mcu| mcu.read_signed_dword(register, true))
    }

    pub fn set_odometer(&self, rotations: i32) -> anyhow::Result<()> {
        let register = self.register(REGISTER_ODOMETER);
        self.plate
            .with_mcu(|mcu| mcu.write_signed_dword(register, rotations, true))
    }

    /// Open loop power, `None` when the motor is in another control mode
    pub fn power(&self) -> anyhow::Result<Option<i16>> {
        if self.control_mode()? != ControlMode::Power {
            return Ok(None);
        }

        let register = self.register(REGISTER_POWER);
        self.plate
            .with_mcu(|mcu| mcu.read_signed_word(register, true))
            .map(Some)
    }

    pub fn set_power(&self, power: i16) -> anyhow::Result<()> {
        if !(-MAX_POWER..=MAX_POWER).contains(&power) {
            bail!(SdkError::validation(format!(
                "Power must be between -{MAX_POWER} and {MAX_POWER}, got {power}"
            )));
        }

        self.set_control_mode(ControlMode::Power)?;
        let register = self.register(REGISTER_POWER);
        self.plate
            .with_mcu(|mcu| mcu.write_signed_word(register, power, true))
    }

    /// Target rpm, `None` when the motor is in another control mode
    pub fn rpm(&self) -> anyhow::Result<Option<i16>> {
        if self.control_mode()? != ControlMode::Rpm {
            return Ok(None);
        }

        let register = self.register(REGISTER_RPM);
        self.plate
            .with_mcu(|mcu| mcu.read_signed_word(register, true))
            .map(Some)
    }

    pub fn set_rpm(&self, rpm: i16) -> anyhow::Result<()> {
        self.set_control_mode(ControlMode::Rpm)?;
        let register = self.register(REGISTER_RPM);
        self.plate
            .with_mcu(|mcu| mcu.write_signed_word(register, rpm, true))
    }

    /// `(rpm, rotations)`, `None` when the motor is in another control mode
    pub fn rpm_with_rotations(&self) -> anyhow::Result<Option<(i16, i16)>> {
        if self.control_mode()? != ControlMode::RpmWithRotations {
            return Ok(None);
        }

        let register = self.register(REGISTER_RPM_WITH_ROTATIONS);
        let bytes = self.plate.with_mcu(|mcu| mcu.read_bulk(register, 4))?;
        let rotations = i16::from_le_bytes([bytes[0], bytes[1]]);
        let rpm = i16::from_le_bytes([bytes[2], bytes[3]]);

        Ok(Some((rpm, rotations)))
    }

    /// Runs at `rpm` until the odometer reaches `rotations`
    pub fn set_rpm_with_rotations(&self, rpm: i16, rotations: i16) -> anyhow::Result<()> {
        self.set_control_mode(ControlMode::RpmWithRotations)?;

        let mut payload = [0; 4];
        payload[..2].copy_from_slice(&rotations.to_le_bytes());
        payload[2..].copy_from_slice(&rpm.to_le_bytes());

        let register = self.register(REGISTER_RPM_WITH_ROTATIONS);
        self.plate.with_mcu(|mcu| mcu.write(register, &payload))
    }

    /// Zeroes whatever the current control mode drives
    pub fn stop(&self) -> anyhow::Result<()> {
        match self.control_mode()? {
            ControlMode::Power => self.set_power(0),
            ControlMode::Rpm => self.set_rpm(0),
            ControlMode::RpmWithRotations => self.set_rpm_with_rotations(0, 0),
        }
    }
}

/// A geared motor with an encoder, optionally driving a wheel
#[derive(Debug)]
pub struct EncoderMotor {
    name: String,
    claim: PortClaim,
    controller: EncoderMotorController,
    forward_direction: ForwardDirection,
    wheel_diameter: f64,
}

impl EncoderMotor {
    #[tracing::instrument(skip(board))]
    pub fn new(
        board: &Board,
        port_name: &str,
        forward_direction: ForwardDirection,
        braking_type: BrakingType,
        wheel_diameter: f64,
        name: &str,
    ) -> anyhow::Result<Self> {
        trace!("EncoderMotor::new()");

        let port = Port::parse(port_name)?;
        let bank = port.motor_bank()?;
        check_wheel_diameter(wheel_diameter)?;

        let claim = board.ports().claim_port(port, "EncoderMotor")?;
        let controller = board.plate().motor(bank)?;
        controller
            .set_braking_type(braking_type)
            .context("Set braking type")?;

        Ok(Self {
            name: name.to_owned(),
            claim,
            controller,
            forward_direction,
            wheel_diameter,
        })
    }

    fn from_config(board: &Board, config: &Config) -> anyhow::Result<Box<dyn Component>> {
        let forward_direction = serde_json::from_value(
            config.get("forward_direction").cloned().unwrap_or(Value::Null),
        )
        .map_err(|err| SdkError::Reconstruction(format!("Bad forward_direction: {err}")))?;
        let braking_type = serde_json::from_value(
            config.get("braking_type").cloned().unwrap_or(Value::Null),
        )
        .map_err(|err| SdkError::Reconstruction(format!("Bad braking_type: {err}")))?;

        Ok(Box::new(EncoderMotor::new(
            board,
            config_str(config, "port_name")?,
            forward_direction,
            braking_type,
            config_f64(config, "wheel_diameter")?,
            config_str(config, "name")?,
        )?))
    }

    pub fn port(&self) -> Port {
        self.claim.port()
    }

    pub fn controller(&self) -> &EncoderMotorController {
        &self.controller
    }

    pub fn forward_direction(&self) -> ForwardDirection {
        self.forward_direction
    }

    pub fn set_forward_direction(&mut self, forward_direction: ForwardDirection) {
        self.forward_direction = forward_direction;
    }

    pub fn braking_type(&self) -> anyhow::Result<BrakingType> {
        self.controller.braking_type()
    }

    pub fn set_braking_type(&self, braking_type: BrakingType) -> anyhow::Result<()> {
        self.controller.set_braking_type(braking_type)
    }

    pub fn wheel_diameter(&self) -> Meters {
        Meters(self.wheel_diameter)
    }

    pub fn set_wheel_diameter(&mut self, wheel_diameter: f64) -> anyhow::Result<()> {
        check_wheel_diameter(wheel_diameter)?;
        self.wheel_diameter = wheel_diameter;
        Ok(())
    }

    pub fn wheel_circumference(&self) -> Meters {
        Meters(self.wheel_diameter * PI)
    }

    /// Output shaft rpm the motor can roughly reach
    pub fn max_rpm(&self) -> Rpm {
        Rpm((MAX_DC_MOTOR_RPM / GEAR_RATIO).floor())
    }

    pub fn max_speed(&self) -> MetersPerSecond {
        MetersPerSecond(self.max_rpm().0 / 60.0 * self.wheel_circumference().0)
    }

    /// Open loop drive, `power` is between -1.0 and 1.0
    pub fn set_power(&self, power: f64, direction: Direction) -> anyhow::Result<()> {
        if !(-1.0..=1.0).contains(&power) {
            bail!(SdkError::validation(format!(
                "Power must be between -1.0 and 1.0, got {power}"
            )));
        }

        let power = (power * MAX_POWER as f64).round() * self.forward_direction.sign() * direction.sign();
        self.controller.set_power(power as i16)
    }

    pub fn power(&self) -> anyhow::Result<Option<f64>> {
        Ok(self
            .controller
            .power()?
            .map(|power| power as f64 / MAX_POWER as f64))
    }

    /// Closed loop drive of the output shaft
    ///
    /// With `total_rotations` other than zero the motor stops by itself after turning
    /// that far.
    pub fn set_target_rpm(
        &self,
        target_rpm: f64,
        direction: Direction,
        total_rotations: f64,
    ) -> anyhow::Result<()> {
        let sign = self.forward_direction.sign() * direction.sign();
        let dc_rpm = (target_rpm * GEAR_RATIO).round() * sign;
        let dc_rotations = (total_rotations * GEAR_RATIO).round() * sign;

        if dc_rpm.abs() > MAX_DC_MOTOR_RPM {
            bail!(SdkError::validation(format!(
                "Target rpm must be between -{max} and {max}, got {target_rpm}",
                max = self.max_rpm().0
            )));
        }

        if dc_rotations == 0.0 {
            return self.controller.set_rpm(dc_rpm as i16);
        }

        let target = dc_rotations + self.controller.odometer()? as f64;
        if !(i16::MIN as f64..=i16::MAX as f64).contains(&target) {
            bail!(SdkError::validation(format!(
                "Rotation target {target} is out of range, reset the odometer first"
            )));
        }

        self.controller.set_rpm_with_rotations(dc_rpm as i16, target as i16)
    }

    /// Output shaft rpm last requested through [`EncoderMotor::set_target_rpm`]
    pub fn target_rpm(&self) -> anyhow::Result<Option<f64>> {
        Ok(self
            .controller
            .rpm()?
            .map(|rpm| rpm as f64 / GEAR_RATIO * self.forward_direction.sign()))
    }

    /// Wheel speed in m/s, with an optional `distance` in meters after which to stop
    pub fn set_target_speed(
        &self,
        target_speed: f64,
        direction: Direction,
        distance: f64,
    ) -> anyhow::Result<()> {
        let max_speed = self.max_speed().0;
        if target_speed.abs() > max_speed {
            bail!(SdkError::validation(format!(
                "Speed must be between -{max_speed:.3} and {max_speed:.3}, got {target_speed}"
            )));
        }

        let circumference = self.wheel_circumference().0;
        let rpm = 60.0 * target_speed / circumference;
        let rotations = distance / circumference;

        self.set_target_rpm(rpm, direction, rotations)
    }

    pub fn forward(&self, target_speed: f64, distance: f64) -> anyhow::Result<()> {
        self.set_target_speed(target_speed, Direction::Forward, distance)
    }

    pub fn backward(&self, target_speed: f64, distance: f64) -> anyhow::Result<()> {
        self.set_target_speed(target_speed, Direction::Back, distance)
    }

    pub fn stop(&self) -> anyhow::Result<()> {
        self.controller.stop()
    }

    pub fn current_rpm(&self) -> anyhow::Result<Rpm> {
        let dc_rpm = self.controller.tachometer()? as f64 * self.forward_direction.sign();
        Ok(Rpm(dc_rpm / GEAR_RATIO))
    }

    pub fn current_speed(&self) -> anyhow::Result<MetersPerSecond> {
        let rpm = self.current_rpm()?;
        Ok(MetersPerSecond(rpm.0 / 60.0 * self.wheel_circumference().0))
    }

    /// Output shaft rotations, increasing while moving forward
    pub fn rotation_counter(&self) -> anyhow::Result<f64> {
        let dc_rotations = self.controller.odometer()? as f64 * self.forward_direction.sign();
        Ok((dc_rotations / GEAR_RATIO * 10.0).round() / 10.0)
    }

    pub fn distance(&self) -> anyhow::Result<Meters> {
        Ok(Meters(self.wheel_circumference().0 * self.rotation_counter()?))
    }
}

fn check_wheel_diameter(wheel_diameter: f64) -> anyhow::Result<()> {
    if wheel_diameter <= 0.0 {
        bail!(SdkError::validation("Wheel diameter must be above 0"));
    }
    Ok(())
}

impl Component for EncoderMotor {
    fn class_name(&self) -> &'static str {
        "EncoderMotor"
    }

    fn module(&self) -> &'static str {
        module_path!()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn own_state(&self) -> StateMap {
        let mut state = StateMap::new();
        state.insert("current_rpm".to_owned(), json!(self.current_rpm().ok()));
        state.insert("current_speed".to_owned(), json!(self.current_speed().ok()));
        state.insert("distance".to_owned(), json!(self.distance().ok()));
        state.insert("wheel_diameter".to_owned(), json!(self.wheel_diameter));
        state
    }

    fn user_config(&self) -> Config {
        // Braking type lives in the MCU, fall back to the default if it can't be read
        let braking_type = self.braking_type().unwrap_or_else(|err| {
            warn!("Could not read braking type: {err:?}");
            BrakingType::default()
        });

        let mut config = Config::new();
        config.insert("port_name".to_owned(), self.port().label().into());
        config.insert("forward_direction".to_owned(), json!(self.forward_direction));
        config.insert("braking_type".to_owned(), json!(braking_type));
        config.insert("wheel_diameter".to_owned(), json!(self.wheel_diameter));
        config.insert("name".to_owned(), self.name.clone().into());
        config
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.stop()
    }
}

impl Drop for EncoderMotor {
    fn drop(&mut self) {
        self.stop().log_error("Stop motor");
    }
}

pub(crate) fn register(registry: &mut Registry) {
    registry.register(module_path!(), "EncoderMotor", EncoderMotor::from_config);
}

#[cfg(test)]
mod tests {
    use common::error::kind_of;

    use super::*;
    use crate::{component::Registry, mock};

    fn motor(board: &Board, port: &str) -> EncoderMotor {
        EncoderMotor::new(
            board,
            port,
            ForwardDirection::Clockwise,
            BrakingType::Coast,
            DEFAULT_WHEEL_DIAMETER,
            "motor",
        )
        .unwrap()
    }

    #[test]
    fn power_is_scaled_and_signed() {
        let (board, hw) = mock::board();
        let mut motor = motor(&board, "M2");

        motor.set_power(0.5, Direction::Forward).unwrap();
        assert_eq!(hw.registers.get(REGISTER_CONTROL_MODE + 1, 1), [0]);
        assert_eq!(hw.registers.get(REGISTER_POWER + 1, 2), 500i16.to_le_bytes());
        assert_eq!(motor.power().unwrap(), Some(0.5));

        motor.set_forward_direction(ForwardDirection::CounterClockwise);
        motor.set_power(0.25, Direction::Back).unwrap();
        assert_eq!(hw.registers.get(REGISTER_POWER + 1, 2), 250i16.to_le_bytes());

        assert!(motor.set_power(1.5, Direction::Forward).is_err());
    }

    #[test]
    fn rpm_through_gearbox() {
        let (board, hw) = mock::board();
        let motor = motor(&board, "M1");

        motor.set_target_rpm(100.0, Direction::Forward, 0.0).unwrap();
        assert_eq!(hw.registers.get(REGISTER_CONTROL_MODE, 1), [1]);
        assert_eq!(hw.registers.get(REGISTER_RPM, 2), 4180i16.to_le_bytes());
        assert!((motor.target_rpm().unwrap().unwrap() - 100.0).abs() < 1e-9);
        assert_eq!(motor.power().unwrap(), None);

        let err = motor.set_target_rpm(200.0, Direction::Forward, 0.0).unwrap_err();
        assert!(matches!(kind_of(&err), Some(SdkError::Validation(_))));
    }

    #[test]
    fn rotations_are_relative_to_odometer() {
        let (board, hw) = mock::board();
        let motor = motor(&board, "M3");
        hw.registers.set(REGISTER_ODOMETER + 2, &100i32.to_le_bytes());

        motor.set_target_rpm(10.0, Direction::Forward, 2.0).unwrap();
        assert_eq!(hw.registers.get(REGISTER_CONTROL_MODE + 2, 1), [2]);

        let bytes = hw.registers.get(REGISTER_RPM_WITH_ROTATIONS + 2, 4);
        assert_eq!(bytes[..2], (84i16 + 100).to_le_bytes());
        assert_eq!(bytes[2..], 418i16.to_le_bytes());
        assert_eq!(
            motor.controller().rpm_with_rotations().unwrap(),
            Some((418, 184))
        );
    }

    #[test]
    fn stop_follows_control_mode() {
        let (board, hw) = mock::board();
        let motor = motor(&board, "M1");

        motor.set_target_rpm(50.0, Direction::Forward, 0.0).unwrap();
        motor.stop().unwrap();

        assert_eq!(hw.registers.get(REGISTER_CONTROL_MODE, 1), [1]);
        assert_eq!(hw.registers.get(REGISTER_RPM, 2), [0, 0]);
    }

    #[test]
    fn telemetry() {
        let (board, hw) = mock::board();
        let motor = motor(&board, "M4");

        hw.registers.set(REGISTER_TACHOMETER + 3, &418i16.to_le_bytes());
        hw.registers.set(REGISTER_ODOMETER + 3, &836i32.to_le_bytes());

        assert!((motor.current_rpm().unwrap().0 - 10.0).abs() < 1e-9);
        assert_eq!(motor.rotation_counter().unwrap(), 20.0);

        let circumference = DEFAULT_WHEEL_DIAMETER * PI;
        assert!((motor.distance().unwrap().0 - 20.0 * circumference).abs() < 1e-9);
        assert!((motor.current_speed().unwrap().0 - 10.0 / 60.0 * circumference).abs() < 1e-9);
    }

    #[test]
    fn glitched_tachometer_rejected() {
        let (board, hw) = mock::board();
        let motor = motor(&board, "M1");

        hw.registers.set(REGISTER_TACHOMETER, &7000i16.to_le_bytes());
        let err = motor.current_rpm().unwrap_err();
        assert!(matches!(kind_of(&err), Some(SdkError::Bus(_))));
    }

    #[test]
    fn speed_limits() {
        let (board, _hw) = mock::board();
        let motor = motor(&board, "M1");

        assert_eq!(motor.max_rpm().0, 114.0);
        assert!(motor.set_target_speed(motor.max_speed().0 + 0.01, Direction::Forward, 0.0).is_err());
        assert!(motor.set_target_speed(0.2, Direction::Back, 0.0).is_ok());
    }

    #[test]
    fn only_motor_ports() {
        let (board, _hw) = mock::board();

        let err = EncoderMotor::new(
            &board,
            "S1",
            ForwardDirection::Clockwise,
            BrakingType::Coast,
            DEFAULT_WHEEL_DIAMETER,
            "motor",
        )
        .unwrap_err();
        assert!(matches!(kind_of(&err), Some(SdkError::Validation(_))));
    }

    #[test]
    fn config_round_trip() {
        let (board, _hw) = mock::board();
        let registry = Registry::with_builtin();

        let motor = EncoderMotor::new(
            &board,
            "M2",
            ForwardDirection::CounterClockwise,
            BrakingType::Brake,
            0.06,
            "left",
        )
        .unwrap();
        let config = motor.config();
        assert_eq!(config["forward_direction"], json!("counterclockwise"));
        assert_eq!(config["braking_type"], json!("brake"));
        drop(motor);

        let rebuilt = registry.from_config(&board, &config).unwrap();
        assert_eq!(rebuilt.config(), config);
    }
}
