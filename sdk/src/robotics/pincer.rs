use anyhow::Context;
use common::types::{Degrees, DegreesPerSecond};
use tracing::{debug, trace};

use crate::{
    board::Board,
    component::{config_str, Component, Config},
    servo::{ServoMotor, ServoMotorState},
};

pub(crate) const MODULE: &str = module_path!();

pub const DEFAULT_LEFT_PORT: &str = "S4";
pub const DEFAULT_RIGHT_PORT: &str = "S1";

pub const CLOSE_SPEED: f64 = 100.0;
pub const CLOSE_ANGLE: f64 = 0.0;
pub const OPEN_SPEED: f64 = 50.0;
pub const OPEN_ANGLE: f64 = 45.0;

/// A gripper made of two mirrored servos
#[derive(Debug)]
pub struct PincerController {
    name: String,
    left: ServoMotor,
    right: ServoMotor,
}

impl PincerController {
    #[tracing::instrument(skip(board))]
    pub fn new(board: &Board, left_port: &str, right_port: &str, name: &str) -> anyhow::Result<Self> {
        trace!("PincerController::new()");

        let left = ServoMotor::new(board, left_port, 0.0, "left_pincer").context("Create left pincer")?;
        let right =
            ServoMotor::new(board, right_port, 0.0, "right_pincer").context("Create right pincer")?;

        Ok(Self {
            name: name.to_owned(),
            left,
            right,
        })
    }

    pub(crate) fn from_config(board: &Board, config: &Config) -> anyhow::Result<Box<dyn Component>> {
        Ok(Box::new(PincerController::new(
            board,
            config_str(config, "left_pincer_port")?,
            config_str(config, "right_pincer_port")?,
            config_str(config, "name")?,
        )?))
    }

    pub fn left_pincer(&self) -> &ServoMotor {
        &self.left
    }

    pub fn right_pincer(&self) -> &ServoMotor {
        &self.right
    }

    /// Brings the pincers together, `angle` is how far each stays open
    pub fn close_pincers(&mut self, speed: f64, angle: f64) -> anyhow::Result<()> {
        debug!("Closing pincers to {angle}");
        self.pincer_move(angle, -angle, speed)
    }

    pub fn open_pincers(&mut self, speed: f64, angle: f64) -> anyhow::Result<()> {
        debug!("Opening pincers to {angle}");
        self.pincer_move(-angle, angle, speed)
    }

    /// Moves both pincers at once, the servos face each other so angles are mirrored
    pub fn pincer_move(&mut self, left_angle: f64, right_angle: f64, speed: f64) -> anyhow::Result<()> {
        self.left.set_state(ServoMotorState {
            angle: Degrees(left_angle),
            speed: DegreesPerSecond(speed),
        })?;
        self.right.set_state(ServoMotorState {
            angle: Degrees(right_angle),
            speed: DegreesPerSecond(speed),
        })
    }
}

impl Component for PincerController {
    fn class_name(&self) -> &'static str {
        "PincerController"
    }

    fn module(&self) -> &'static str {
        MODULE
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn user_config(&self) -> Config {
        let mut config = Config::new();
        config.insert("left_pincer_port".to_owned(), self.left.port().label().into());
        config.insert("right_pincer_port".to_owned(), self.right.port().label().into());
        config.insert("name".to_owned(), self.name.clone().into());
        config
    }

    fn children(&self) -> Vec<(&str, &dyn Component)> {
        vec![("left_pincer", &self.left), ("right_pincer", &self.right)]
    }
}

#[cfg(test)]
mod tests {
    use common::error::{kind_of, SdkError};

    use super::*;
    use crate::{
        component::{Registry, COMPONENTS_KEY},
        mock,
        servo::REGISTER_ANGLE_AND_SPEED,
    };

    fn angle_and_speed(hw: &mock::MockHardware, bank: u8) -> (i16, u16) {
        let bytes = hw.registers.get(REGISTER_ANGLE_AND_SPEED + bank, 4);
        (
            i16::from_le_bytes([bytes[0], bytes[1]]),
            u16::from_le_bytes([bytes[2], bytes[3]]),
        )
    }

    #[test]
    fn mirrored_angles() {
        let (board, hw) = mock::board();
        let mut pincers =
            PincerController::new(&board, DEFAULT_LEFT_PORT, DEFAULT_RIGHT_PORT, "pincers").unwrap();

        pincers.open_pincers(OPEN_SPEED, OPEN_ANGLE).unwrap();
        // Left on S4 is bank 3, right on S1 is bank 0
        assert_eq!(angle_and_speed(&hw, 3), (-45, 500));
        assert_eq!(angle_and_speed(&hw, 0), (45, 500));

        pincers.close_pincers(CLOSE_SPEED, 10.0).unwrap();
        assert_eq!(angle_and_speed(&hw, 3), (10, 1000));
        assert_eq!(angle_and_speed(&hw, 0), (-10, 1000));
        assert_eq!(pincers.left_pincer().target_angle(), Degrees(10.0));
        assert_eq!(pincers.right_pincer().target_speed(), DegreesPerSecond(100.0));
    }

    #[test]
    fn limits_checked() {
        let (board, _hw) = mock::board();
        let mut pincers = PincerController::new(&board, "S2", "S3", "pincers").unwrap();

        let err = pincers.open_pincers(120.0, OPEN_ANGLE).unwrap_err();
        assert!(matches!(kind_of(&err), Some(SdkError::Validation(_))));
        assert!(pincers.close_pincers(CLOSE_SPEED, 95.0).is_err());
    }

    #[test]
    fn ports_are_claimed() {
        let (board, _hw) = mock::board();
        let _pincers = PincerController::new(&board, "S1", "S2", "pincers").unwrap();

        assert!(ServoMotor::new(&board, "S2", 0.0, "other").is_err());
        assert!(PincerController::new(&board, "S3", "S3", "twice").is_err());
    }

    #[test]
    fn config_round_trip() {
        let (board, _hw) = mock::board();
        let registry = Registry::with_builtin();

        let config = PincerController::new(&board, "S3", "S2", "gripper")
            .unwrap()
            .config();
        assert_eq!(config["left_pincer_port"], "S3");
        assert_eq!(config[COMPONENTS_KEY]["right_pincer"]["port_name"], "S2");

        let rebuilt = registry.from_config(&board, &config).unwrap();
        assert_eq!(rebuilt.config(), config);
        assert_eq!(rebuilt.name(), "gripper");
    }
}
