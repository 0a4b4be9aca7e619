use std::{thread, time::Duration};

use anyhow::{bail, Context};
use common::{
    error::SdkError,
    types::{Meters, MetersPerSecond, Rpm},
};
use serde_json::json;
use tracing::{debug, trace};

use crate::{
    board::Board,
    component::{config_str, Component, Config, StateMap},
    motor::{BrakingType, Direction, EncoderMotor, ForwardDirection},
};

pub(crate) const MODULE: &str = module_path!();

pub const DEFAULT_LEFT_PORT: &str = "M4";
pub const DEFAULT_RIGHT_PORT: &str = "M1";

pub const WHEEL_SEPARATION: f64 = 0.1675;
pub const WHEEL_DIAMETER: f64 = 0.074;

/// Differential drive: two wheels on one axis plus a caster
#[derive(Debug)]
pub struct DriveController {
    name: String,
    left: EncoderMotor,
    right: EncoderMotor,
    wheel_separation: f64,
    max_motor_rpm: f64,
    max_motor_speed: f64,
    max_angular_speed: f64,
    linear_speed_hold: f64,
}

impl DriveController {
    #[tracing::instrument(skip(board))]
    pub fn new(board: &Board, left_port: &str, right_port: &str, name: &str) -> anyhow::Result<Self> {
        trace!("DriveController::new()");

        let left = EncoderMotor::new(
            board,
            left_port,
            ForwardDirection::Clockwise,
            BrakingType::default(),
            WHEEL_DIAMETER,
            "left_motor",
        )
        .context("Create left motor")?;
        let right = EncoderMotor::new(
            board,
            right_port,
            ForwardDirection::CounterClockwise,
            BrakingType::default(),
            WHEEL_DIAMETER,
            "right_motor",
        )
        .context("Create right motor")?;

        let max_motor_rpm = left.max_rpm().0.min(right.max_rpm().0).floor();
        let circumference = left.wheel_circumference().0;
        // Floored so that full speed never rounds past the rpm limit
        let max_motor_speed = (max_motor_rpm / 60.0 * circumference * 1000.0).floor() / 1000.0;
        let max_angular_speed = max_motor_speed / (WHEEL_SEPARATION / 2.0);

        Ok(Self {
            name: name.to_owned(),
            left,
            right,
            wheel_separation: WHEEL_SEPARATION,
            max_motor_rpm,
            max_motor_speed,
            max_angular_speed,
            linear_speed_hold: 0.0,
        })
    }

    pub(crate) fn from_config(board: &Board, config: &Config) -> anyhow::Result<Box<dyn Component>> {
        Ok(Box::new(DriveController::new(
            board,
            config_str(config, "left_motor_port")?,
            config_str(config, "right_motor_port")?,
            config_str(config, "name")?,
        )?))
    }

    pub fn left_motor(&self) -> &EncoderMotor {
        &self.left
    }

    pub fn right_motor(&self) -> &EncoderMotor {
        &self.right
    }

    pub fn wheel_separation(&self) -> Meters {
        Meters(self.wheel_separation)
    }

    pub fn max_motor_rpm(&self) -> Rpm {
        Rpm(self.max_motor_rpm)
    }

    pub fn max_motor_speed(&self) -> MetersPerSecond {
        MetersPerSecond(self.max_motor_speed)
    }

    /// Turning speed in rad/s when spinning in place with both wheels at full speed
    pub fn max_angular_speed(&self) -> f64 {
        self.max_angular_speed
    }

    fn speed_to_rpm(&self, speed: f64) -> f64 {
        let rpm = 60.0 * speed / self.left.wheel_circumference().0;
        (rpm * 10.0).round() / 10.0
    }

    /// Wheel rpms `(left, right)` for a linear and angular speed
    ///
    /// Positive `angular_speed` turns counter-clockwise. When a wheel would pass the
    /// rpm limit both are scaled down together, keeping the trajectory's curvature.
    pub fn calculate_motor_rpms(
        &self,
        linear_speed: f64,
        angular_speed: f64,
        turn_radius: f64,
    ) -> (f64, f64) {
        let half_separation = self.wheel_separation / 2.0;
        let speed_right = linear_speed + (turn_radius + half_separation) * angular_speed;
        let speed_left = linear_speed + (turn_radius - half_separation) * angular_speed;

        let mut rpm_left = self.speed_to_rpm(speed_left);
        let mut rpm_right = self.speed_to_rpm(speed_right);

        let fastest = rpm_left.abs().max(rpm_right.abs());
        if fastest > self.max_motor_rpm {
            let factor = self.max_motor_rpm / fastest;
            rpm_left *= factor;
            rpm_right *= factor;
        }

        (rpm_left, rpm_right)
    }

    /// Moves at `linear_speed` m/s while turning at `angular_speed` rad/s around a
    /// point `turn_radius` meters to the left of the axle center
    pub fn robot_move(
        &mut self,
        linear_speed: f64,
        angular_speed: f64,
        turn_radius: f64,
    ) -> anyhow::Result<()> {
        let (rpm_left, rpm_right) = self.calculate_motor_rpms(linear_speed, angular_speed, turn_radius);
        debug!("Drive rpms: left {rpm_left}, right {rpm_right}");

        self.left
            .set_target_rpm(rpm_left, Direction::Forward, 0.0)
            .context("Drive left motor")?;
        self.right
            .set_target_rpm(rpm_right, Direction::Forward, 0.0)
            .context("Drive right motor")
    }

    /// Drives straight at `speed_factor` of full speed, -1.0 to 1.0
    ///
    /// With `hold` the speed stays as the base of later turns.
    pub fn forward(&mut self, speed_factor: f64, hold: bool) -> anyhow::Result<()> {
        check_speed_factor(speed_factor)?;

        let linear_speed = self.max_motor_speed * speed_factor;
        self.linear_speed_hold = if hold { linear_speed } else { 0.0 };
        self.robot_move(linear_speed, 0.0, 0.0)
    }

    pub fn backward(&mut self, speed_factor: f64, hold: bool) -> anyhow::Result<()> {
        self.forward(-speed_factor, hold)
    }

    /// Turns left along a circle of `turn_radius`, 0 spins in place
    pub fn left(&mut self, speed_factor: f64, turn_radius: f64) -> anyhow::Result<()> {
        check_speed_factor(speed_factor)?;

        let angular_speed = self.max_angular_speed * speed_factor;
        self.robot_move(self.linear_speed_hold, angular_speed, turn_radius)
    }

    pub fn right(&mut self, speed_factor: f64, turn_radius: f64) -> anyhow::Result<()> {
        self.left(-speed_factor, -turn_radius)
    }

    /// Spins in place by `angle` degrees, blocking for `time_to_take`
    ///
    /// Both motors are given a rotation count so they stop by themselves even if the
    /// rpm limit made the turn slower than asked.
    pub fn rotate(&mut self, angle: f64, time_to_take: Duration) -> anyhow::Result<()> {
        if time_to_take.is_zero() {
            bail!(SdkError::validation("Time to take must be above 0"));
        }

        let angle_radians = angle.to_radians();
        let angular_speed = angle_radians / time_to_take.as_secs_f64();
        let (rpm_left, rpm_right) = self.calculate_motor_rpms(0.0, angular_speed, 0.0);

        let distance = angle_radians.abs() * self.wheel_separation / 2.0;
        let rotations = distance / self.left.wheel_circumference().0;

        self.linear_speed_hold = 0.0;
        self.left
            .set_target_rpm(rpm_left, Direction::Forward, rotations * rpm_left.signum())
            .context("Rotate left motor")?;
        self.right
            .set_target_rpm(rpm_right, Direction::Forward, rotations * rpm_right.signum())
            .context("Rotate right motor")?;

        thread::sleep(time_to_take);
        Ok(())
    }

    pub fn stop(&mut self) -> anyhow::Result<()> {
        self.linear_speed_hold = 0.0;
        self.robot_move(0.0, 0.0, 0.0)
    }

    /// Stops turning but keeps any held linear speed
    pub fn stop_rotation(&mut self) -> anyhow::Result<()> {
        self.robot_move(self.linear_speed_hold, 0.0, 0.0)
    }
}

fn check_speed_factor(speed_factor: f64) -> anyhow::Result<()> {
    if !(-1.0..=1.0).contains(&speed_factor) {
        bail!(SdkError::validation(format!(
            "Speed factor must be between -1.0 and 1.0, got {speed_factor}"
        )));
    }
    Ok(())
}

impl Component for DriveController {
    fn class_name(&self) -> &'static str {
        "DriveController"
    }

    fn module(&self) -> &'static str {
        MODULE
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn own_state(&self) -> StateMap {
        let mut state = StateMap::new();
        state.insert("max_motor_speed".to_owned(), json!(self.max_motor_speed));
        state.insert("linear_speed_hold".to_owned(), json!(self.linear_speed_hold));
        state
    }

    fn user_config(&self) -> Config {
        let mut config = Config::new();
        config.insert("left_motor_port".to_owned(), self.left.port().label().into());
        config.insert("right_motor_port".to_owned(), self.right.port().label().into());
        config.insert("name".to_owned(), self.name.clone().into());
        config
    }

    fn children(&self) -> Vec<(&str, &dyn Component)> {
        vec![("left_motor", &self.left), ("right_motor", &self.right)]
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.stop()
    }
}
