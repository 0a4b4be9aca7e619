//! Definitions of important types used throughout the project

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::ops::{Add, Mul, Neg, Sub};

macro_rules! unit {
    ($(#[$meta:meta])* $name:ident, $suffix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, Default, Serialize, Deserialize, PartialEq, PartialOrd)]
        #[serde(transparent)]
        pub struct $name(pub f64);

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{:.2}{}", self.0, $suffix)
            }
        }

        impl Add for $name {
            type Output = Self;

            fn add(self, rhs: Self) -> Self::Output {
                Self(self.0 + rhs.0)
            }
        }

        impl Sub for $name {
            type Output = Self;

            fn sub(self, rhs: Self) -> Self::Output {
                Self(self.0 - rhs.0)
            }
        }

        impl Neg for $name {
            type Output = Self;

            fn neg(self) -> Self::Output {
                Self(-self.0)
            }
        }

        impl Mul<f64> for $name {
            type Output = Self;

            fn mul(self, rhs: f64) -> Self::Output {
                Self(self.0 * rhs)
            }
        }
    };
}

unit!(Degrees, "°");
unit!(DegreesPerSecond, "°/s");
unit!(
    /// Acceleration in m/s²
    MetersPerSecondSquared,
    "m/s²"
);
unit!(Gauss, "G");
unit!(Celsius, "°C");
unit!(Meters, "m");
unit!(MetersPerSecond, "m/s");
unit!(Rpm, "rpm");

impl Degrees {
    pub fn to_radians(self) -> f64 {
        self.0.to_radians()
    }

    pub fn from_radians(radians: f64) -> Self {
        Self(radians.to_degrees())
    }
}

/// A reading from one of the three axis sensors
#[derive(Debug, Copy, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Axes<T> {
    pub x: T,
    pub y: T,
    pub z: T,
}

impl<T> Axes<T> {
    pub fn new(x: T, y: T, z: T) -> Self {
        Self { x, y, z }
    }

    pub fn map<U>(self, mut f: impl FnMut(T) -> U) -> Axes<U> {
        Axes {
            x: f(self.x),
            y: f(self.y),
            z: f(self.z),
        }
    }
}

/// Roll, pitch and yaw
#[derive(Debug, Copy, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Orientation {
    pub roll: Degrees,
    pub pitch: Degrees,
    pub yaw: Degrees,
}

/// Fraction in the range of -1.0 to 1.0
#[derive(Debug, Copy, Clone, Default, Serialize, Deserialize, PartialEq, PartialOrd)]
#[serde(transparent)]
pub struct Percent(f64);

impl Percent {
    pub const ZERO: Percent = Percent(0.0);

    pub fn new(value: f64) -> Self {
        Self(value.clamp(-1.0, 1.0))
    }

    pub const fn get(&self) -> f64 {
        self.0
    }
}

impl Display for Percent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.2}%", self.0 * 100.0)
    }
}

/// Gains of a [`PidController`], the output and the integral term are held to `±limit`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidConfig {
    pub k_p: f64,
    pub k_i: f64,
    pub k_d: f64,

    pub limit: f64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PidController {
    last_error: Option<f64>,
    integral: f64,
}

impl PidController {
    /// `dt` is the time in seconds since the previous update
    pub fn update(&mut self, error: f64, dt: f64, config: PidConfig) -> f64 {
        let p = error * config.k_p;

        self.integral = clamp(self.integral + error * config.k_i * dt, config.limit);
        let i = self.integral;

        let d = match self.last_error {
            Some(last_error) if dt > 0.0 => (error - last_error) / dt * config.k_d,
            _ => 0.0,
        };
        self.last_error = Some(error);

        clamp(p + i + d, config.limit)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

fn clamp(val: f64, range: f64) -> f64 {
    val.clamp(-range, range)
}
