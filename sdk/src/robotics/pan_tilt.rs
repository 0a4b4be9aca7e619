use anyhow::Context;
use common::types::Degrees;
use serde_json::json;
use tracing::{info, trace};

use crate::{
    board::Board,
    component::{config_f64, config_str, Component, Config},
    servo::ServoMotor,
};

pub(crate) const MODULE: &str = module_path!();

pub const DEFAULT_PAN_PORT: &str = "S1";
pub const DEFAULT_TILT_PORT: &str = "S4";

/// Two servos turning a camera or sensor sideways and up and down
#[derive(Debug)]
pub struct PanTiltController {
    name: String,
    pan: ServoMotor,
    tilt: ServoMotor,
}

impl PanTiltController {
    #[tracing::instrument(skip(board))]
    pub fn new(board: &Board, pan_port: &str, tilt_port: &str, name: &str) -> anyhow::Result<Self> {
        trace!("PanTiltController::new()");

        let pan = ServoMotor::new(board, pan_port, 0.0, "pan_servo").context("Create pan servo")?;
        let tilt = ServoMotor::new(board, tilt_port, 0.0, "tilt_servo").context("Create tilt servo")?;

        Ok(Self {
            name: name.to_owned(),
            pan,
            tilt,
        })
    }

    pub(crate) fn from_config(board: &Board, config: &Config) -> anyhow::Result<Box<dyn Component>> {
        let mut pan_tilt = PanTiltController::new(
            board,
            config_str(config, "servo_pan_port")?,
            config_str(config, "servo_tilt_port")?,
            config_str(config, "name")?,
        )?;
        pan_tilt.calibrate(
            config_f64(config, "pan_zero_point")?,
            config_f64(config, "tilt_zero_point")?,
        )?;

        Ok(Box::new(pan_tilt))
    }

    pub fn pan_servo(&self) -> &ServoMotor {
        &self.pan
    }

    pub fn pan_servo_mut(&mut self) -> &mut ServoMotor {
        &mut self.pan
    }

    pub fn tilt_servo(&self) -> &ServoMotor {
        &self.tilt
    }

    pub fn tilt_servo_mut(&mut self) -> &mut ServoMotor {
        &mut self.tilt
    }

    /// Sets the zero points so that `(0, 0)` faces straight ahead
    pub fn calibrate(&mut self, pan_zero_point: f64, tilt_zero_point: f64) -> anyhow::Result<()> {
        self.pan.set_zero_point(pan_zero_point)?;
        self.tilt.set_zero_point(tilt_zero_point)?;

        info!("Pan tilt zero points set to {pan_zero_point}, {tilt_zero_point}");
        Ok(())
    }

    pub fn look_at(&mut self, pan: f64, tilt: f64) -> anyhow::Result<()> {
        self.pan.set_target_angle(pan)?;
        self.tilt.set_target_angle(tilt)
    }

    /// Sweeps both servos at the given speeds in degrees per second
    pub fn sweep(&mut self, pan_speed: f64, tilt_speed: f64) -> anyhow::Result<()> {
        self.pan.set_target_speed(pan_speed)?;
        self.tilt.set_target_speed(tilt_speed)
    }

    pub fn target(&self) -> (Degrees, Degrees) {
        (self.pan.target_angle(), self.tilt.target_angle())
    }
}

impl Component for PanTiltController {
    fn class_name(&self) -> &'static str {
        "PanTiltController"
    }

    fn module(&self) -> &'static str {
        MODULE
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn user_config(&self) -> Config {
        let mut config = Config::new();
        config.insert("servo_pan_port".to_owned(), self.pan.port().label().into());
        config.insert("servo_tilt_port".to_owned(), self.tilt.port().label().into());
        config.insert("pan_zero_point".to_owned(), json!(self.pan.zero_point()));
        config.insert("tilt_zero_point".to_owned(), json!(self.tilt.zero_point()));
        config.insert("name".to_owned(), self.name.clone().into());
        config
    }

    fn children(&self) -> Vec<(&str, &dyn Component)> {
        vec![("pan_servo", &self.pan), ("tilt_servo", &self.tilt)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        component::{Registry, COMPONENTS_KEY},
        mock,
        servo::REGISTER_ANGLE_AND_SPEED,
    };

    #[test]
    fn calibrated_angles() {
        let (board, hw) = mock::board();
        let mut pan_tilt =
            PanTiltController::new(&board, DEFAULT_PAN_PORT, DEFAULT_TILT_PORT, "pan_tilt").unwrap();

        pan_tilt.calibrate(10.0, 0.0).unwrap();
        pan_tilt.look_at(20.0, -30.0).unwrap();

        // Pan on S1 (bank 0) gets the zero point added
        assert_eq!(hw.registers.get(REGISTER_ANGLE_AND_SPEED, 2), 30i16.to_le_bytes());
        assert_eq!(pan_tilt.target(), (Degrees(20.0), Degrees(-30.0)));

        // Pan range is -100 to 80 with the zero point at 10
        assert!(pan_tilt.look_at(85.0, 0.0).is_err());
        assert!(pan_tilt.calibrate(120.0, 0.0).is_err());
    }

    #[test]
    fn ports_are_claimed() {
        let (board, _hw) = mock::board();
        let _pan_tilt = PanTiltController::new(&board, "S1", "S4", "pan_tilt").unwrap();

        assert!(ServoMotor::new(&board, "S4", 0.0, "other").is_err());
        assert!(PanTiltController::new(&board, "S2", "S2", "twice").is_err());
    }

    #[test]
    fn config_round_trip() {
        let (board, _hw) = mock::board();
        let registry = Registry::with_builtin();

        let config = {
            let mut pan_tilt = PanTiltController::new(&board, "S2", "S3", "head").unwrap();
            pan_tilt.calibrate(-5.0, 12.5).unwrap();
            pan_tilt.config()
        };

        let rebuilt = registry.from_config(&board, &config).unwrap();
        assert_eq!(rebuilt.config(), config);
        assert_eq!(config[COMPONENTS_KEY]["tilt_servo"]["zero_point"], 12.5);
    }
}
