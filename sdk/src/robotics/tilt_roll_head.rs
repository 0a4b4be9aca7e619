use std::{
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::{bail, Context};
use common::{
    error::{LogErrorExt, SdkError},
    types::{Degrees, DegreesPerSecond, PidConfig, PidController},
};
use crossbeam::channel::{bounded, never, Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, error, span, trace, warn, Level};

use crate::{
    board::Board,
    component::{config_str, Component, Config},
    servo::{check_speed, ServoController, ServoMotor, ServoMotorState, DEFAULT_SPEED},
};

pub(crate) const MODULE: &str = module_path!();

pub const DEFAULT_ROLL_PORT: &str = "S1";
pub const DEFAULT_TILT_PORT: &str = "S4";

/// Roll speed from the angle error when tracking
pub const HEAD_ROLL_PID: PidConfig = PidConfig {
    k_p: 3.0,
    k_i: 1.5,
    k_d: 0.25,
    limit: 100.0,
};

pub const REACH_TOLERANCE: f64 = 1.0;
const REACH_POLL: Duration = Duration::from_millis(50);
pub const REACH_TIMEOUT: Duration = Duration::from_secs(5);

/// A head shake or nod, swinging `angle` degrees either side of the current angle
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Oscillation {
    pub times: u32,
    pub angle: f64,
    pub speed: f64,
    /// Return only once the head is back where it started
    pub block: bool,
}

impl Default for Oscillation {
    fn default() -> Self {
        Self {
            times: 4,
            angle: 5.0,
            speed: 100.0,
            block: true,
        }
    }
}

/// A servo as seen from a motion thread, which can't borrow the [`ServoMotor`]
#[derive(Clone, Debug)]
struct Axis {
    controller: ServoController,
    zero_point: f64,
}

impl Axis {
    fn of(servo: &ServoMotor) -> Self {
        Self {
            controller: servo.controller().clone(),
            zero_point: servo.zero_point(),
        }
    }

    fn set(&self, angle: f64, speed: f64) -> anyhow::Result<()> {
        self.controller
            .set_target_angle(angle + self.zero_point, speed)
    }

    fn current(&self) -> anyhow::Result<Option<f64>> {
        Ok(self
            .controller
            .target_angle_and_speed()?
            .map(|(angle, _)| angle - self.zero_point))
    }
}

#[derive(Debug)]
struct Motion {
    cancel: Sender<()>,
    handle: JoinHandle<()>,
}

impl Motion {
    fn cancel(self) {
        drop(self.cancel);
        if self.handle.join().is_err() {
            error!("Head motion thread panicked");
        }
    }
}

/// Sets `angle` and polls until the servo gets there, false if cancelled or too slow
fn move_until_reached(
    axis: &Axis,
    angle: f64,
    speed: f64,
    cancelled: &Receiver<()>,
) -> anyhow::Result<bool> {
    axis.set(angle, speed)?;

    let deadline = Instant::now() + REACH_TIMEOUT;
    loop {
        if let Some(current) = axis.current()? {
            if (current - angle).abs() <= REACH_TOLERANCE {
                return Ok(true);
            }
        }

        if Instant::now() >= deadline {
            warn!("Head didn't reach {angle}° within {REACH_TIMEOUT:?}, try a higher speed");
            return Ok(false);
        }

        match cancelled.recv_timeout(REACH_POLL) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => return Ok(false),
        }
    }
}

/// Swings around `start` and puts the servo back, also when cancelled
fn oscillate(
    axis: &Axis,
    request: Oscillation,
    start: ServoMotorState,
    cancelled: &Receiver<()>,
) -> anyhow::Result<()> {
    let Degrees(start_angle) = start.angle;

    for _ in 0..request.times {
        if let Err(TryRecvError::Disconnected) = cancelled.try_recv() {
            debug!("Oscillation cancelled");
            break;
        }

        let completed = move_until_reached(axis, start_angle - request.angle, request.speed, cancelled)?
            && move_until_reached(axis, start_angle + request.angle, request.speed, cancelled)?;
        if !completed {
            break;
        }
    }

    let DegreesPerSecond(speed) = start.speed;
    let speed = if speed == 0.0 { DEFAULT_SPEED } else { speed };
    move_until_reached(axis, start_angle, speed, &never())?;

    Ok(())
}

/// A head on two servos, rolling side to side and tilting up and down
#[derive(Debug)]
pub struct TiltRollHeadController {
    name: String,
    roll: ServoMotor,
    tilt: ServoMotor,
    roll_pid: PidController,
    last_track: Option<Instant>,
    shaking: Option<Motion>,
    nodding: Option<Motion>,
}

impl TiltRollHeadController {
    #[tracing::instrument(skip(board))]
    pub fn new(board: &Board, roll_port: &str, tilt_port: &str, name: &str) -> anyhow::Result<Self> {
        trace!("TiltRollHeadController::new()");

        let roll = ServoMotor::new(board, roll_port, 0.0, "roll").context("Create roll servo")?;
        let tilt = ServoMotor::new(board, tilt_port, 0.0, "tilt").context("Create tilt servo")?;

        Ok(Self {
            name: name.to_owned(),
            roll,
            tilt,
            roll_pid: PidController::default(),
            last_track: None,
            shaking: None,
            nodding: None,
        })
    }

    pub(crate) fn from_config(board: &Board, config: &Config) -> anyhow::Result<Box<dyn Component>> {
        Ok(Box::new(TiltRollHeadController::new(
            board,
            config_str(config, "servo_roll_port")?,
            config_str(config, "servo_tilt_port")?,
            config_str(config, "name")?,
        )?))
    }

    pub fn roll(&self) -> &ServoMotor {
        &self.roll
    }

    pub fn roll_mut(&mut self) -> &mut ServoMotor {
        &mut self.roll
    }

    pub fn tilt(&self) -> &ServoMotor {
        &self.tilt
    }

    pub fn tilt_mut(&mut self) -> &mut ServoMotor {
        &mut self.tilt
    }

    /// Cancels any shake or nod and holds both servos still
    pub fn stop(&mut self) -> anyhow::Result<()> {
        self.cancel_motions();

        self.tilt.set_target_speed(0.0)?;
        self.roll.set_target_speed(0.0)
    }

    /// Rolls side to side, replacing any shake still running
    pub fn shake(&mut self, request: Oscillation) -> anyhow::Result<()> {
        start_oscillation(&mut self.shaking, &self.roll, request, "head-shake")
    }

    /// Tilts up and down, replacing any nod still running
    pub fn nod(&mut self, request: Oscillation) -> anyhow::Result<()> {
        start_oscillation(&mut self.nodding, &self.tilt, request, "head-nod")
    }

    pub fn is_oscillating(&self) -> bool {
        [&self.shaking, &self.nodding]
            .into_iter()
            .flatten()
            .any(|motion| !motion.handle.is_finished())
    }

    /// Sweeps the roll servo toward `angle`, meant to be called in a loop
    ///
    /// Heads mounted upside down pass `flipped` as false to mirror the angle.
    pub fn track_head_angle(&mut self, angle: f64, flipped: bool) -> anyhow::Result<()> {
        if let Some(motion) = self.shaking.take() {
            motion.cancel();
        }

        let angle = if flipped { angle } else { -angle };
        let current = match self.roll.state()? {
            Some(state) => state.angle.0,
            None => self.roll.target_angle().0,
        };

        let error = current - angle;
        if error.abs() < REACH_TOLERANCE {
            return self.roll.set_target_speed(0.0);
        }

        let now = Instant::now();
        let dt = self
            .last_track
            .replace(now)
            .map_or(0.0, |last| (now - last).as_secs_f64());
        let speed = self.roll_pid.update(-error, dt, HEAD_ROLL_PID);

        self.roll.set_target_speed(speed)
    }

    fn cancel_motions(&mut self) {
        for motion in [self.shaking.take(), self.nodding.take()].into_iter().flatten() {
            motion.cancel();
        }
    }
}

fn start_oscillation(
    slot: &mut Option<Motion>,
    servo: &ServoMotor,
    request: Oscillation,
    thread_name: &str,
) -> anyhow::Result<()> {
    if let Some(motion) = slot.take() {
        motion.cancel();
    }

    check_speed(request.speed)?;
    let start = ServoMotorState {
        angle: servo.target_angle(),
        speed: servo.target_speed(),
    };

    let (min, max) = servo.angle_range();
    let Degrees(start_angle) = start.angle;
    let swing = request.angle.abs();
    if start_angle - swing < min || start_angle + swing > max {
        bail!(SdkError::validation(format!(
            "Swinging {swing}° around {start_angle}° leaves the range of {min} to {max} degrees"
        )));
    }

    let axis = Axis::of(servo);
    if request.block {
        return oscillate(&axis, request, start, &never());
    }

    let (cancel, cancelled) = bounded::<()>(0);
    let handle = thread::Builder::new()
        .name(thread_name.to_owned())
        .spawn(move || {
            let _span = span!(Level::INFO, "Head oscillation thread").entered();
            oscillate(&axis, request, start, &cancelled).log_error("Oscillate head");
        })
        .context("Spawn head oscillation thread")?;

    *slot = Some(Motion { cancel, handle });
    Ok(())
}

impl Component for TiltRollHeadController {
    fn class_name(&self) -> &'static str {
        "TiltRollHeadController"
    }

    fn module(&self) -> &'static str {
        MODULE
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn user_config(&self) -> Config {
        let mut config = Config::new();
        config.insert("servo_roll_port".to_owned(), self.roll.port().label().into());
        config.insert("servo_tilt_port".to_owned(), self.tilt.port().label().into());
        config.insert("name".to_owned(), self.name.clone().into());
        config
    }

    fn children(&self) -> Vec<(&str, &dyn Component)> {
        vec![("roll", &self.roll), ("tilt", &self.tilt)]
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.cancel_motions();
        Ok(())
    }
}

impl Drop for TiltRollHeadController {
    fn drop(&mut self) {
        self.cancel_motions();
    }
}

#[cfg(test)]
mod tests {
    use common::error::kind_of;

    use super::*;
    use crate::{
        component::{Registry, COMPONENTS_KEY},
        mock::{self, MockHardware},
        servo::REGISTER_ANGLE_AND_SPEED,
    };

    const WAIT: Duration = Duration::from_secs(2);

    /// `(angle, speed * 10)` of every target written to a servo bank
    fn targets(hw: &MockHardware, bank: u8) -> Vec<(i16, u16)> {
        hw.registers
            .writes()
            .into_iter()
            .filter(|(register, _)| *register == REGISTER_ANGLE_AND_SPEED + bank)
            .map(|(_, bytes)| {
                (
                    i16::from_le_bytes([bytes[0], bytes[1]]),
                    u16::from_le_bytes([bytes[2], bytes[3]]),
                )
            })
            .collect()
    }

    fn head(board: &Board) -> TiltRollHeadController {
        TiltRollHeadController::new(board, DEFAULT_ROLL_PORT, DEFAULT_TILT_PORT, "head").unwrap()
    }

    #[test]
    fn shake_returns_to_start() {
        let (board, hw) = mock::board();
        let mut head = head(&board);
        head.roll_mut().set_target_angle(10.0).unwrap();

        head.shake(Oscillation {
            times: 2,
            speed: 80.0,
            ..Default::default()
        })
        .unwrap();

        // Roll is on S1, bank 0
        assert_eq!(
            targets(&hw, 0),
            [(10, 500), (5, 800), (15, 800), (5, 800), (15, 800), (10, 500)]
        );
        assert_eq!(head.roll().target_angle(), Degrees(10.0));
        assert!(!head.is_oscillating());
    }

    #[test]
    fn swing_must_fit_range() {
        let (board, hw) = mock::board();
        let mut head = head(&board);
        head.tilt_mut().set_target_angle(88.0).unwrap();

        let err = head.nod(Oscillation::default()).unwrap_err();
        assert!(matches!(kind_of(&err), Some(SdkError::Validation(_))));

        let err = head
            .nod(Oscillation {
                speed: 150.0,
                angle: 1.0,
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(kind_of(&err), Some(SdkError::Validation(_))));

        // Tilt is on S4, bank 3
        assert_eq!(targets(&hw, 3), [(88, 500)]);
    }

    #[test]
    fn background_nod_finishes() {
        let (board, hw) = mock::board();
        let mut head = head(&board);

        head.nod(Oscillation {
            times: 3,
            block: false,
            ..Default::default()
        })
        .unwrap();

        let deadline = Instant::now() + WAIT;
        while head.is_oscillating() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!head.is_oscillating());

        let nod = targets(&hw, 3);
        assert_eq!(nod.len(), 7);
        // Never moved before, so it goes back at the default speed
        assert_eq!(nod.last(), Some(&(0, 500)));
    }

    #[test]
    fn new_nod_cancels_running_one() {
        let (board, hw) = mock::board();
        let mut head = head(&board);

        head.nod(Oscillation {
            times: u32::MAX,
            block: false,
            ..Default::default()
        })
        .unwrap();
        assert!(head.is_oscillating());

        head.nod(Oscillation {
            times: 1,
            angle: 10.0,
            ..Default::default()
        })
        .unwrap();
        assert!(!head.is_oscillating());

        let nod = targets(&hw, 3);
        assert_eq!(nod[nod.len() - 3..], [(-10, 1000), (10, 1000), (0, 500)]);
    }

    #[test]
    fn stop_holds_both_servos() {
        let (board, hw) = mock::board();
        let mut head = head(&board);

        head.shake(Oscillation {
            times: u32::MAX,
            block: false,
            ..Default::default()
        })
        .unwrap();
        head.stop().unwrap();

        assert!(!head.is_oscillating());
        assert_eq!(targets(&hw, 0).last(), Some(&(90, 0)));
        assert_eq!(targets(&hw, 3).last(), Some(&(90, 0)));
    }

    #[test]
    fn tracking_sweeps_toward_angle() {
        let (board, _hw) = mock::board();
        let mut head = head(&board);
        head.roll_mut().set_target_angle(20.0).unwrap();

        // Error of 20° with no history is only proportional
        head.track_head_angle(0.0, true).unwrap();
        assert_eq!(head.roll().target_speed(), DegreesPerSecond(-60.0));
        assert_eq!(head.roll().target_angle(), Degrees(-90.0));

        head.roll_mut().set_target_angle(-30.0).unwrap();
        head.track_head_angle(30.0, false).unwrap();
        assert_eq!(head.roll().target_speed(), DegreesPerSecond(0.0));
    }

    #[test]
    fn config_round_trip() {
        let (board, _hw) = mock::board();
        let registry = Registry::with_builtin();

        let config = TiltRollHeadController::new(&board, "S2", "S3", "head")
            .unwrap()
            .config();
        assert_eq!(config["servo_roll_port"], "S2");
        assert_eq!(config[COMPONENTS_KEY]["tilt"]["port_name"], "S3");

        let rebuilt = registry.from_config(&board, &config).unwrap();
        assert_eq!(rebuilt.config(), config);
    }
}
