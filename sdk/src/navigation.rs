//! Dead reckoning and point to point driving for differential drive robots
//!
//! An odometry thread integrates wheel rotations into a [`Pose`] at a fixed rate and
//! publishes each new measurement. [`NavigationController::go_to`] waits for every
//! measurement and feeds it through a [`GoalSeek`], the classic polar coordinate
//! controller steering on the distance `ρ` to the goal, the bearing `α` of the goal
//! relative to the heading and the remaining heading change `β`.

use std::{
    f64::consts::{FRAC_PI_2, PI},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::{bail, Context};
use common::{
    error::{LogErrorExt, SdkError},
    types::Degrees,
};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, span, trace, warn, Level};

use crate::robotics::DriveController;

pub const DEFAULT_ODOMETRY_FREQUENCY: f64 = 10.0;
pub const DEFAULT_TOLERANCE: f64 = 1e-3;
/// Measurements missed in a row before the odometry thread is considered dead
const MISSED_MEASUREMENTS: u32 = 10;

/// Wraps an angle in radians into `(-π, π]`
pub fn normalize_angle(angle: f64) -> f64 {
    let wrapped = (angle + PI).rem_euclid(2.0 * PI) - PI;
    if wrapped <= -PI {
        wrapped + 2.0 * PI
    } else {
        wrapped
    }
}

/// Position in meters and heading in radians, counter-clockwise from the x axis
#[derive(Debug, Copy, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
}

impl Pose {
    pub fn new(x: f64, y: f64, theta: f64) -> Self {
        Self {
            x,
            y,
            theta: normalize_angle(theta),
        }
    }

    pub fn distance_to(&self, other: &Pose) -> f64 {
        (other.x - self.x).hypot(other.y - self.y)
    }

    /// Unicycle step: drives `distance` along the current heading, then turns by `rotation`
    pub fn advance(self, distance: f64, rotation: f64) -> Pose {
        Pose {
            x: self.x + distance * self.theta.cos(),
            y: self.y + distance * self.theta.sin(),
            theta: normalize_angle(self.theta + rotation),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gains {
    pub k_rho: f64,
    pub k_alpha: f64,
    pub k_beta: f64,
}

impl Gains {
    pub fn new(k_rho: f64, k_alpha: f64, k_beta: f64) -> anyhow::Result<Self> {
        let gains = Self {
            k_rho,
            k_alpha,
            k_beta,
        };
        gains.validate()?;

        Ok(gains)
    }

    /// The controller is only stable for `k_ρ > 0`, `k_α > k_ρ` and `k_β < 0`
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.k_rho <= 0.0 {
            bail!(SdkError::validation(format!(
                "k_rho must be above 0, got {}",
                self.k_rho
            )));
        }
        if self.k_alpha <= self.k_rho {
            bail!(SdkError::validation(format!(
                "k_alpha must be above k_rho ({}), got {}",
                self.k_rho, self.k_alpha
            )));
        }
        if self.k_beta >= 0.0 {
            bail!(SdkError::validation(format!(
                "k_beta must be below 0, got {}",
                self.k_beta
            )));
        }

        Ok(())
    }
}

impl Default for Gains {
    fn default() -> Self {
        Self {
            k_rho: 9.0,
            k_alpha: 15.0,
            k_beta: -3.0,
        }
    }
}

/// Linear speed in m/s and angular speed in rad/s
#[derive(Debug, Copy, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Velocity {
    pub linear: f64,
    pub angular: f64,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Step {
    Drive(Velocity),
    Reached,
}

/// One goal for the polar controller, stepped with a fresh pose each time
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct GoalSeek {
    gains: Gains,
    goal: Pose,
    tolerance: f64,
}

impl GoalSeek {
    pub fn new(gains: Gains, goal: Pose, tolerance: f64) -> anyhow::Result<Self> {
        gains.validate()?;
        if tolerance <= 0.0 {
            bail!(SdkError::validation(format!(
                "Tolerance must be above 0, got {tolerance}"
            )));
        }
        if !(-PI..=PI).contains(&goal.theta) {
            bail!(SdkError::validation(format!(
                "Goal heading must be between -π and π, got {}",
                goal.theta
            )));
        }

        Ok(Self {
            gains,
            goal,
            tolerance,
        })
    }

    pub fn goal(&self) -> Pose {
        self.goal
    }

    /// `ρ`, the straight line distance left
    pub fn distance(&self, pose: &Pose) -> f64 {
        pose.distance_to(&self.goal)
    }

    pub fn step(&self, pose: &Pose) -> Step {
        let dx = self.goal.x - pose.x;
        let dy = self.goal.y - pose.y;

        let rho = dx.hypot(dy);
        if rho < self.tolerance {
            return Step::Reached;
        }

        let alpha = normalize_angle(dy.atan2(dx) - pose.theta);
        let beta = normalize_angle(self.goal.theta - pose.theta - alpha);

        let mut linear = self.gains.k_rho * rho;
        let angular = self.gains.k_alpha * alpha + self.gains.k_beta * beta;

        // Goal is behind, back up to it
        if alpha.abs() > FRAC_PI_2 {
            linear = -linear;
        }

        Step::Drive(Velocity { linear, angular })
    }
}

/// Turns wheel rotation counters into travelled distance and heading change
#[derive(Debug, Clone)]
pub struct Odometry {
    meters_per_rotation: f64,
    wheel_separation: f64,
    last: Option<(f64, f64)>,
}

impl Odometry {
    pub fn new(meters_per_rotation: f64, wheel_separation: f64) -> anyhow::Result<Self> {
        if meters_per_rotation <= 0.0 {
            bail!(SdkError::validation("Meters per rotation must be above 0"));
        }
        if wheel_separation <= 0.0 {
            bail!(SdkError::validation("Wheel separation must be above 0"));
        }

        Ok(Self {
            meters_per_rotation,
            wheel_separation,
            last: None,
        })
    }

    /// `(distance, rotation)` since the previous reading, the first reading is the baseline
    pub fn update(&mut self, (left, right): (f64, f64)) -> (f64, f64) {
        let Some((last_left, last_right)) = self.last.replace((left, right)) else {
            return (0.0, 0.0);
        };

        let left = (left - last_left) * self.meters_per_rotation;
        let right = (right - last_right) * self.meters_per_rotation;

        ((right + left) / 2.0, (right - left) / self.wheel_separation)
    }
}

/// What navigation needs from a two wheeled robot
pub trait DifferentialBase: Send {
    /// Rotations of the `(left, right)` wheels, increasing while driving forward
    fn wheel_rotations(&self) -> anyhow::Result<(f64, f64)>;
    fn wheel_separation(&self) -> f64;
    fn robot_move(&mut self, linear_speed: f64, angular_speed: f64) -> anyhow::Result<()>;
    fn stop(&mut self) -> anyhow::Result<()>;
}

impl DifferentialBase for DriveController {
    fn wheel_rotations(&self) -> anyhow::Result<(f64, f64)> {
        Ok((
            self.left_motor().rotation_counter()?,
            self.right_motor().rotation_counter()?,
        ))
    }

    fn wheel_separation(&self) -> f64 {
        self.wheel_separation().0
    }

    fn robot_move(&mut self, linear_speed: f64, angular_speed: f64) -> anyhow::Result<()> {
        DriveController::robot_move(self, linear_speed, angular_speed, 0.0)
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        DriveController::stop(self)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Outcome {
    Reached,
    Cancelled,
}

struct Shared<B> {
    base: Mutex<B>,
    pose: Mutex<Pose>,
    running: AtomicBool,
    cancelled: AtomicBool,
}

impl<B> Shared<B> {
    fn pose(&self) -> Pose {
        *self.pose.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Drives a [`DifferentialBase`] to goals using its own odometry
pub struct NavigationController<B: DifferentialBase + 'static> {
    shared: Arc<Shared<B>>,
    measurements: Receiver<Pose>,
    odometry: Option<JoinHandle<()>>,
    period: Duration,
    gains: Mutex<Gains>,
    tolerance: f64,
}

impl<B: DifferentialBase + 'static> NavigationController<B> {
    /// Starts tracking odometry right away, `meters_per_rotation` is the distance a
    /// wheel covers in one rotation of its counter
    #[tracing::instrument(skip(base))]
    pub fn new(base: B, meters_per_rotation: f64, frequency: f64) -> anyhow::Result<Self> {
        trace!("NavigationController::new()");

        if frequency.is_nan() || frequency <= 0.0 {
            bail!(SdkError::validation(format!(
                "Odometry frequency must be above 0, got {frequency}"
            )));
        }
        let period = Duration::from_secs_f64(1.0 / frequency);
        let odometry = Odometry::new(meters_per_rotation, base.wheel_separation())?;

        let shared = Arc::new(Shared {
            base: Mutex::new(base),
            pose: Mutex::new(Pose::default()),
            running: AtomicBool::new(true),
            cancelled: AtomicBool::new(false),
        });

        let (tx, rx) = bounded(1);
        let handle = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("pt-odometry".to_owned())
                .spawn(move || track_odometry(shared, odometry, period, tx))
                .context("Spawn odometry thread")?
        };

        Ok(Self {
            shared,
            measurements: rx,
            odometry: Some(handle),
            period,
            gains: Mutex::new(Gains::default()),
            tolerance: DEFAULT_TOLERANCE,
        })
    }

    pub fn pose(&self) -> Pose {
        self.shared.pose()
    }

    /// Makes the current position the origin
    pub fn reset_pose(&self) {
        *self
            .shared
            .pose
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Pose::default();
    }

    pub fn gains(&self) -> Gains {
        *self.gains.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_gains(&self, gains: Gains) -> anyhow::Result<()> {
        gains.validate()?;
        *self.gains.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = gains;
        Ok(())
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    pub fn set_tolerance(&mut self, tolerance: f64) -> anyhow::Result<()> {
        if tolerance <= 0.0 {
            bail!(SdkError::validation("Tolerance must be above 0"));
        }
        self.tolerance = tolerance;
        Ok(())
    }

    /// Access to the base between goals, the odometry thread also locks it
    pub fn with_base<T>(&self, op: impl FnOnce(&mut B) -> T) -> T {
        let mut base = self
            .shared
            .base
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        op(&mut base)
    }

    /// Drives to `(x, y)` in meters and blocks until within tolerance or [`stop`]ped
    ///
    /// [`stop`]: NavigationController::stop
    pub fn go_to(&self, x: f64, y: f64, theta: Degrees) -> anyhow::Result<Outcome> {
        if !(-180.0..=180.0).contains(&theta.0) {
            bail!(SdkError::validation(format!(
                "Goal heading must be between -180 and 180 degrees, got {}",
                theta.0
            )));
        }

        let goal = Pose {
            x,
            y,
            theta: theta.to_radians(),
        };
        let seek = GoalSeek::new(self.gains(), goal, self.tolerance)?;
        info!("Navigating to {goal:?}");

        self.shared.cancelled.store(false, Ordering::Relaxed);
        // Stale measurements would steer on an old pose
        while self.measurements.try_recv().is_ok() {}

        loop {
            let pose = self.next_measurement()?;

            if self.shared.cancelled.load(Ordering::Relaxed) {
                info!("Navigation cancelled at {pose:?}");
                self.with_base(|base| base.stop())?;
                return Ok(Outcome::Cancelled);
            }

            match seek.step(&pose) {
                Step::Reached => {
                    info!("Reached {goal:?}, at {pose:?}");
                    self.with_base(|base| base.stop())?;
                    return Ok(Outcome::Reached);
                }
                Step::Drive(Velocity { linear, angular }) => {
                    trace!(rho = seek.distance(&pose), linear, angular, "Goal seek step");
                    let res = self.with_base(|base| base.robot_move(linear, angular));
                    if let Err(err) = res {
                        self.with_base(|base| base.stop()).log_error("Stop base");
                        return Err(err.context("Drive toward goal"));
                    }
                }
            }
        }
    }

    /// Cancels a running [`go_to`], which stops the base at the next measurement
    ///
    /// [`go_to`]: NavigationController::go_to
    pub fn stop(&self) {
        self.shared.cancelled.store(true, Ordering::Relaxed);
    }

    fn next_measurement(&self) -> anyhow::Result<Pose> {
        match self
            .measurements
            .recv_timeout(self.period * MISSED_MEASUREMENTS)
        {
            Ok(pose) => Ok(pose),
            Err(RecvTimeoutError::Timeout) => {
                self.with_base(|base| base.stop()).log_error("Stop base");
                bail!(SdkError::Timeout("No odometry measurement".to_owned()))
            }
            Err(RecvTimeoutError::Disconnected) => {
                bail!(SdkError::Bus("Odometry thread stopped".to_owned()))
            }
        }
    }
}

fn track_odometry<B: DifferentialBase>(
    shared: Arc<Shared<B>>,
    mut odometry: Odometry,
    period: Duration,
    tx: Sender<Pose>,
) {
    let _span = span!(Level::INFO, "Odometry thread").entered();

    let mut deadline = Instant::now() + period;

    while shared.running.load(Ordering::Relaxed) {
        let rotations = shared
            .base
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .wheel_rotations();

        match rotations {
            Ok(rotations) => {
                let (distance, rotation) = odometry.update(rotations);

                let pose = {
                    let mut pose = shared
                        .pose
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    *pose = pose.advance(distance, rotation);
                    *pose
                };

                // Only the newest measurement matters
                let _ = tx.try_send(pose);
            }
            Err(err) => warn!("Could not read wheel rotations: {err:?}"),
        }

        let now = Instant::now();
        if deadline > now {
            thread::sleep(deadline - now);
        } else {
            debug!("Behind schedule");
        }
        deadline += period;
    }
}

impl<B: DifferentialBase + 'static> Drop for NavigationController<B> {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.odometry.take() {
            if handle.join().is_err() {
                error!("Odometry thread panicked");
            }
        }
    }
}

impl<B: DifferentialBase + 'static> std::fmt::Debug for NavigationController<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NavigationController")
            .field("pose", &self.pose())
            .field("period", &self.period)
            .field("tolerance", &self.tolerance)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use common::error::kind_of;

    use super::*;

    #[test]
    fn angles_wrap_into_half_open_range() {
        assert_eq!(normalize_angle(PI), PI);
        assert_eq!(normalize_angle(-PI), PI);
        assert!((normalize_angle(3.0 * PI / 2.0) + PI / 2.0).abs() < 1e-12);
        assert!((normalize_angle(-3.0 * PI / 2.0) - PI / 2.0).abs() < 1e-12);
        assert!((normalize_angle(7.0) - (7.0 - 2.0 * PI)).abs() < 1e-12);
        assert_eq!(normalize_angle(0.5), 0.5);
    }

    #[test]
    fn gains_must_be_stable() {
        assert_eq!(Gains::new(9.0, 15.0, -3.0).unwrap(), Gains::default());

        for (k_rho, k_alpha, k_beta) in [(0.0, 15.0, -3.0), (9.0, 9.0, -3.0), (9.0, 15.0, 0.0)] {
            let err = Gains::new(k_rho, k_alpha, k_beta).unwrap_err();
            assert!(matches!(kind_of(&err), Some(SdkError::Validation(_))));
        }
    }

    fn simulate(start: Pose, goal: Pose, gains: Gains) -> (usize, Vec<f64>, Pose) {
        let seek = GoalSeek::new(gains, goal, 1e-3).unwrap();
        let dt = 0.01;

        let mut pose = start;
        let mut rhos = Vec::new();
        for steps in 0..10_000 {
            rhos.push(seek.distance(&pose));
            match seek.step(&pose) {
                Step::Reached => return (steps, rhos, pose),
                Step::Drive(Velocity { linear, angular }) => {
                    pose = pose.advance(linear * dt, angular * dt);
                    assert!(pose.theta.abs() <= PI);
                }
            }
        }

        panic!("No convergence toward {goal:?}, ended at {pose:?}");
    }

    #[test]
    fn converges_straight_ahead() {
        let gains = Gains::new(9.0, 15.0, -3.0).unwrap();
        let (steps, rhos, pose) = simulate(Pose::default(), Pose::new(1.0, 0.0, 0.0), gains);

        assert!(steps < 100);
        assert!(rhos.windows(2).all(|pair| pair[1] <= pair[0] + 1e-9));
        assert!(pose.distance_to(&Pose::new(1.0, 0.0, 0.0)) < 1e-3);
    }

    #[test]
    fn backs_up_to_goal_behind() {
        let gains = Gains::default();
        let goal = Pose::new(-1.0, 0.5, 0.0);
        let pose = Pose::new(0.0, 0.0, 0.3);

        let seek = GoalSeek::new(gains, goal, DEFAULT_TOLERANCE).unwrap();
        let Step::Drive(velocity) = seek.step(&pose) else {
            panic!("Goal is over a meter away");
        };

        // Only the speed is reversed, the steering still uses the bearing of the goal
        let rho = 1.25f64.sqrt();
        let alpha = normalize_angle(0.5f64.atan2(-1.0) - 0.3);
        let beta = normalize_angle(-0.3 - alpha);
        assert!(alpha.abs() > FRAC_PI_2);
        assert!((velocity.linear + 9.0 * rho).abs() < 1e-9);
        assert!((velocity.angular - (15.0 * alpha - 3.0 * beta)).abs() < 1e-9);
        assert!((velocity.linear + 10.0623).abs() < 1e-3);
        assert!((velocity.angular - 43.7030).abs() < 1e-3);

        for goal in [goal, Pose::new(-1.0, 0.0, 0.0)] {
            let (_, rhos, end) = simulate(Pose::default(), goal, gains);
            assert!(end.distance_to(&goal) < 1e-3);
            assert!(rhos.windows(2).all(|pair| pair[1] <= pair[0] + 1e-9));
        }
    }

    #[test]
    fn converges_off_axis() {
        let gains = Gains::new(9.0, 15.0, -3.0).unwrap();
        for goal in [
            Pose::new(1.0, 1.0, 0.0),
            Pose::new(0.0, 1.0, FRAC_PI_2),
            Pose::new(-1.0, -1.0, PI),
        ] {
            let (_, _, pose) = simulate(Pose::default(), goal, gains);
            assert!(pose.distance_to(&goal) < 1e-3);
        }
    }

    #[test]
    fn goal_heading_checked() {
        let err = GoalSeek::new(Gains::default(), Pose { x: 0.0, y: 0.0, theta: 4.0 }, 0.01)
            .unwrap_err();
        assert!(matches!(kind_of(&err), Some(SdkError::Validation(_))));
        assert!(GoalSeek::new(Gains::default(), Pose::default(), 0.0).is_err());
    }

    #[test]
    fn odometry_unicycle() {
        let mut odometry = Odometry::new(0.25, 0.2).unwrap();

        assert_eq!(odometry.update((10.0, 10.0)), (0.0, 0.0));
        assert_eq!(odometry.update((14.0, 14.0)), (1.0, 0.0));

        // Spinning in place
        let (distance, rotation) = odometry.update((13.9, 14.1));
        assert!(distance.abs() < 1e-9);
        assert!((rotation - 0.25).abs() < 1e-9);

        let pose = Pose::default().advance(1.0, FRAC_PI_2).advance(1.0, 0.0);
        assert!((pose.x - 1.0).abs() < 1e-9);
        assert!((pose.y - 1.0).abs() < 1e-9);
    }

    const METERS_PER_ROTATION: f64 = 0.2;

    /// Wheels that turn exactly as commanded
    #[derive(Debug)]
    struct SimBase {
        rotations: (f64, f64),
        speeds: (f64, f64),
        since: Instant,
        stops: usize,
    }

    impl SimBase {
        fn new() -> Self {
            Self {
                rotations: (0.0, 0.0),
                speeds: (0.0, 0.0),
                since: Instant::now(),
                stops: 0,
            }
        }

        fn current(&self) -> (f64, f64) {
            let elapsed = self.since.elapsed().as_secs_f64();
            (
                self.rotations.0 + self.speeds.0 * elapsed / METERS_PER_ROTATION,
                self.rotations.1 + self.speeds.1 * elapsed / METERS_PER_ROTATION,
            )
        }

        fn set_speeds(&mut self, left: f64, right: f64) {
            self.rotations = self.current();
            self.since = Instant::now();
            self.speeds = (left, right);
        }
    }

    impl DifferentialBase for SimBase {
        fn wheel_rotations(&self) -> anyhow::Result<(f64, f64)> {
            Ok(self.current())
        }

        fn wheel_separation(&self) -> f64 {
            0.2
        }

        fn robot_move(&mut self, linear_speed: f64, angular_speed: f64) -> anyhow::Result<()> {
            let half = self.wheel_separation() / 2.0 * angular_speed;
            self.set_speeds(linear_speed - half, linear_speed + half);
            Ok(())
        }

        fn stop(&mut self) -> anyhow::Result<()> {
            self.stops += 1;
            self.set_speeds(0.0, 0.0);
            Ok(())
        }
    }

    #[test]
    fn drives_simulated_base_to_goal() {
        let navigation = NavigationController::new(SimBase::new(), METERS_PER_ROTATION, 20.0).unwrap();
        assert_eq!(navigation.gains(), Gains::default());
        assert_eq!(navigation.tolerance(), DEFAULT_TOLERANCE);

        let outcome = navigation.go_to(0.3, 0.1, Degrees(0.0)).unwrap();
        assert_eq!(outcome, Outcome::Reached);

        // Odometry may tick once more after the goal was seen
        let pose = navigation.pose();
        assert!(pose.distance_to(&Pose::new(0.3, 0.1, 0.0)) < 0.03, "{pose:?}");
        assert_eq!(navigation.with_base(|base| base.stops), 1);

        navigation.reset_pose();
        assert!(navigation.pose().distance_to(&Pose::default()) < 0.01);
    }

    #[test]
    fn stop_cancels_go_to() {
        let navigation = Arc::new(
            NavigationController::new(SimBase::new(), METERS_PER_ROTATION, 20.0).unwrap(),
        );
        navigation.set_gains(Gains::new(0.01, 0.5, -0.1).unwrap()).unwrap();

        let stopper = {
            let navigation = navigation.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(300));
                navigation.stop();
            })
        };

        let outcome = navigation.go_to(50.0, 0.0, Degrees(0.0)).unwrap();
        stopper.join().unwrap();

        assert_eq!(outcome, Outcome::Cancelled);
        assert_eq!(navigation.with_base(|base| base.speeds), (0.0, 0.0));
    }

    #[test]
    fn heading_in_degrees_checked() {
        let navigation = NavigationController::new(SimBase::new(), METERS_PER_ROTATION, 20.0).unwrap();

        let err = navigation.go_to(1.0, 0.0, Degrees(181.0)).unwrap_err();
        assert!(matches!(kind_of(&err), Some(SdkError::Validation(_))));
        assert!(NavigationController::new(SimBase::new(), 0.0, 20.0).is_err());
        assert!(NavigationController::new(SimBase::new(), METERS_PER_ROTATION, 0.0).is_err());
    }
}
