//! Analog readings through the plate MCU's ADC on the `A*` ports

use std::{thread, time::Duration};

use anyhow::{bail, Context};
use common::{error::SdkError, ports::Port};
use serde_json::json;
use tracing::trace;

use crate::{
    board::Board,
    component::{config_str, Component, Config, Registry, StateMap},
    plate::Plate,
    ports::PortClaim,
};

pub const REGISTER_ADC_BASE: u8 = 0x30;
pub const REGISTER_ADC_PEAK_BASE: u8 = 0x18;
pub const ADC_CHANNELS: u8 = 8;

/// Raw readings in parts per thousand of the reference voltage, 0 to 999
#[derive(Clone, Debug)]
pub struct Adc {
    plate: Plate,
}

impl Adc {
    pub fn new(plate: Plate) -> Self {
        Self { plate }
    }

    pub fn read(&self, channel: u8) -> anyhow::Result<u16> {
        self.read_register(REGISTER_ADC_BASE, channel)
    }

    /// Highest value seen on `channel` by the peak detector
    pub fn read_peak(&self, channel: u8) -> anyhow::Result<u16> {
        self.read_register(REGISTER_ADC_PEAK_BASE, channel)
    }

    fn read_register(&self, base: u8, channel: u8) -> anyhow::Result<u16> {
        if channel >= ADC_CHANNELS {
            bail!(SdkError::validation(format!(
                "ADC channel must be below {ADC_CHANNELS}, got {channel}"
            )));
        }

        self.plate
            .with_mcu(|mcu| mcu.read_unsigned_word(base + channel, true))
            .with_context(|| format!("Read ADC channel {channel}"))
    }
}

/// How a reading is sampled
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Sampling {
    pub samples: usize,
    pub delay: Duration,
    pub peak: bool,
}

impl Default for Sampling {
    fn default() -> Self {
        Self {
            samples: 1,
            delay: Duration::from_millis(50),
            peak: false,
        }
    }
}

impl Sampling {
    pub fn samples(samples: usize) -> Self {
        Self {
            samples,
            ..Default::default()
        }
    }

    pub fn peak() -> Self {
        Self {
            peak: true,
            ..Default::default()
        }
    }
}

/// An analog sensor bound to one pin of an `A*` port
#[derive(Debug)]
pub struct AnalogSensor {
    adc: Adc,
    claim: PortClaim,
    channel: u8,
}

impl AnalogSensor {
    pub fn new(board: &Board, port_name: &str, pin_index: u8, owner: &str) -> anyhow::Result<Self> {
        let port = Port::parse(port_name)?;
        let channel = port.adc_channel(pin_index)?;
        let claim = board.ports().claim_port(port, owner)?;

        Ok(Self {
            adc: board.plate().adc(),
            claim,
            channel,
        })
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn port(&self) -> Port {
        self.claim.port()
    }

    /// Mean of `sampling.samples` reads, sleeping between them
    pub fn read(&self, sampling: &Sampling) -> anyhow::Result<f64> {
        if sampling.samples == 0 {
            bail!(SdkError::validation("At least one sample is needed"));
        }

        let mut total = 0.0;
        for sample in 0..sampling.samples {
            let value = if sampling.peak {
                self.adc.read_peak(self.channel)?
            } else {
                self.adc.read(self.channel)?
            };
            total += value as f64;

            if sample + 1 != sampling.samples {
                thread::sleep(sampling.delay);
            }
        }

        Ok(total / sampling.samples as f64)
    }
}

/// Generates the [`Component`] impl and registry constructor of an analog sensor
macro_rules! analog_component {
    ($component:ident, $reading:ident) => {
        impl $component {
            #[tracing::instrument(skip(board))]
            pub fn new(board: &Board, port_name: &str, name: &str) -> anyhow::Result<Self> {
                trace!(concat!(stringify!($component), "::new()"));

                Ok(Self {
                    name: name.to_owned(),
                    sensor: AnalogSensor::new(board, port_name, 1, stringify!($component))?,
                })
            }

            fn from_config(board: &Board, config: &Config) -> anyhow::Result<Box<dyn Component>> {
                let port_name = config_str(config, "port_name")?;
                let name = config_str(config, "name")?;

                Ok(Box::new($component::new(board, port_name, name)?))
            }

            pub fn sensor(&self) -> &AnalogSensor {
                &self.sensor
            }

            /// 1 if anything is detected, 0 otherwise
            pub fn value(&self) -> anyhow::Result<u8> {
                Ok(u8::from(self.$reading()? > 0.0))
            }
        }

        impl Component for $component {
            fn class_name(&self) -> &'static str {
                stringify!($component)
            }

            fn module(&self) -> &'static str {
                module_path!()
            }

            fn name(&self) -> &str {
                &self.name
            }

            fn own_state(&self) -> StateMap {
                let mut state = StateMap::new();
                state.insert(stringify!($reading).to_owned(), json!(self.$reading().ok()));
                state
            }

            fn user_config(&self) -> Config {
                let mut config = Config::new();
                config.insert("port_name".to_owned(), self.sensor.port().label().into());
                config.insert("name".to_owned(), self.name.clone().into());
                config
            }
        }
    };
}

#[derive(Debug)]
pub struct Potentiometer {
    name: String,
    sensor: AnalogSensor,
}

impl Potentiometer {
    pub fn position(&self) -> anyhow::Result<f64> {
        self.sensor.read(&Sampling::default())
    }
}

analog_component!(Potentiometer, position);

#[derive(Debug)]
pub struct LightSensor {
    name: String,
    sensor: AnalogSensor,
}

impl LightSensor {
    pub fn reading(&self) -> anyhow::Result<f64> {
        self.sensor
            .read(&Sampling::samples(3))
            .map(|reading| reading.trunc())
    }
}

analog_component!(LightSensor, reading);

#[derive(Debug)]
pub struct SoundSensor {
    name: String,
    sensor: AnalogSensor,
}

impl SoundSensor {
    pub fn reading(&self) -> anyhow::Result<f64> {
        self.sensor
            .read(&Sampling::peak())
            .map(|reading| reading / 2.0)
    }
}

analog_component!(SoundSensor, reading);

pub(crate) fn register(registry: &mut Registry) {
    registry.register(module_path!(), "Potentiometer", Potentiometer::from_config);
    registry.register(module_path!(), "LightSensor", LightSensor::from_config);
    registry.register(module_path!(), "SoundSensor", SoundSensor::from_config);
}

#[cfg(test)]
mod tests {
    use common::error::kind_of;

    use super::*;
    use crate::mock;

    #[test]
    fn channel_registers() {
        let (board, hw) = mock::board();
        let adc = board.plate().adc();

        hw.registers.set(0x30 + 5, &[0xE7, 0x03]);
        hw.registers.set(0x18 + 5, &[0x10, 0x00]);

        assert_eq!(adc.read(5).unwrap(), 999);
        assert_eq!(adc.read_peak(5).unwrap(), 16);
        assert!(adc.read(8).is_err());
    }

    #[test]
    fn averages_samples() {
        let (board, hw) = mock::board();
        hw.registers.set(0x30 + 2, &[100, 0]);

        let light = LightSensor::new(&board, "A1", "light").unwrap();
        assert_eq!(light.sensor().channel(), 2);
        assert_eq!(light.reading().unwrap(), 100.0);
        assert_eq!(light.value().unwrap(), 1);

        let sampling = Sampling {
            samples: 0,
            ..Default::default()
        };
        assert!(light.sensor().read(&sampling).is_err());
    }

    #[test]
    fn sound_uses_peak_bank() {
        let (board, hw) = mock::board();
        hw.registers.set(0x30 + 6, &[200, 0]);
        hw.registers.set(0x18 + 6, &[50, 0]);

        let sound = SoundSensor::new(&board, "A3", "sound").unwrap();
        assert_eq!(sound.reading().unwrap(), 25.0);
    }

    #[test]
    fn digital_port_rejected() {
        let (board, _hw) = mock::board();

        let err = Potentiometer::new(&board, "D0", "pot").unwrap_err();
        assert!(matches!(kind_of(&err), Some(SdkError::Validation(_))));
    }

    #[test]
    fn bus_errors_surface() {
        let (board, hw) = mock::board();
        let pot = Potentiometer::new(&board, "A0", "pot").unwrap();

        hw.registers.set_failing(true);
        let err = pot.position().unwrap_err();
        assert!(matches!(kind_of(&err), Some(SdkError::Bus(_))));
        assert_eq!(pot.own_state()["position"], serde_json::Value::Null);
    }
}
