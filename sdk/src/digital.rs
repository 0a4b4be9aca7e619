//! Components wired straight to the GPIO header through the `D*` ports

use std::{fmt::Debug, sync::Mutex};

use anyhow::Context;
use common::ports::Port;
use rppal::gpio::{Gpio, InputPin, OutputPin};
use serde_json::json;
use tracing::{debug, trace};

use crate::{
    board::Board,
    component::{config_str, Component, Config, Registry, StateMap},
    ports::PortClaim,
};

/// Hands out GPIO lines by BCM number
pub trait GpioProvider: Send + Sync + Debug {
    fn output(&self, pin: u8) -> anyhow::Result<Box<dyn OutputLine>>;
    fn input(&self, pin: u8) -> anyhow::Result<Box<dyn InputLine>>;
}

pub trait OutputLine: Send + Debug {
    fn set(&mut self, high: bool) -> anyhow::Result<()>;
    fn is_high(&self) -> bool;
}

pub trait InputLine: Send + Debug {
    fn is_high(&self) -> anyhow::Result<bool>;
}

/// GPIO through `/dev/gpiomem`, opened on first use
#[derive(Debug, Default)]
pub struct RppalGpio {
    gpio: Mutex<Option<Gpio>>,
}

impl RppalGpio {
    fn gpio(&self) -> anyhow::Result<Gpio> {
        let mut gpio = self
            .gpio
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match &*gpio {
            Some(gpio) => Ok(gpio.clone()),
            None => {
                let opened = Gpio::new().context("Create gpio")?;
                *gpio = Some(opened.clone());
                Ok(opened)
            }
        }
    }
}

impl GpioProvider for RppalGpio {
    fn output(&self, pin: u8) -> anyhow::Result<Box<dyn OutputLine>> {
        let mut pin = self
            .gpio()?
            .get(pin)
            .with_context(|| format!("Get gpio {pin}"))?
            .into_output();
        pin.set_low();

        Ok(Box::new(pin))
    }

    fn input(&self, pin: u8) -> anyhow::Result<Box<dyn InputLine>> {
        let pin = self
            .gpio()?
            .get(pin)
            .with_context(|| format!("Get gpio {pin}"))?
            .into_input_pulldown();

        Ok(Box::new(pin))
    }
}

impl OutputLine for OutputPin {
    fn set(&mut self, high: bool) -> anyhow::Result<()> {
        if high {
            self.set_high();
        } else {
            self.set_low();
        }
        Ok(())
    }

    fn is_high(&self) -> bool {
        self.is_set_high()
    }
}

impl InputLine for InputPin {
    fn is_high(&self) -> anyhow::Result<bool> {
        Ok(InputPin::is_high(self))
    }
}

/// Validates a digital port and binds it to `owner`
fn claim_digital(board: &Board, port_name: &str, owner: &str) -> anyhow::Result<(PortClaim, u8)> {
    let port = Port::parse(port_name)?;
    let pin = port.gpio(1)?;
    let claim = board.ports().claim_port(port, owner)?;

    Ok((claim, pin))
}

/// Generates the [`Component`] impl and registry constructor shared by the
/// digital components, `$key => $value` pairs make up the own state
macro_rules! digital_component {
    ($component:ident, |$this:ident| { $($key:literal => $value:expr),* $(,)? }) => {
        impl $component {
            fn from_config(board: &Board, config: &Config) -> anyhow::Result<Box<dyn Component>> {
                let port_name = config_str(config, "port_name")?;
                let name = config_str(config, "name")?;

                Ok(Box::new($component::new(board, port_name, name)?))
            }

            pub fn port(&self) -> Port {
                self.claim.port()
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
                let $this = self;
                let mut state = StateMap::new();
                $(
                    state.insert($key.to_owned(), json!($value));
                )*
                state
            }

            fn user_config(&self) -> Config {
                let mut config = Config::new();
                config.insert("port_name".to_owned(), self.claim.port().label().into());
                config.insert("name".to_owned(), self.name.clone().into());
                config
            }

            fn close(&mut self) -> anyhow::Result<()> {
                self.shutdown()
            }
        }
    };
}

#[derive(Debug)]
pub struct Led {
    name: String,
    claim: PortClaim,
    line: Box<dyn OutputLine>,
}

impl Led {
    #[tracing::instrument(skip(board))]
    pub fn new(board: &Board, port_name: &str, name: &str) -> anyhow::Result<Self> {
        trace!("Led::new()");

        let (claim, pin) = claim_digital(board, port_name, "Led")?;
        let line = board.gpio().output(pin).context("Create led")?;

        Ok(Self {
            name: name.to_owned(),
            claim,
            line,
        })
    }

    pub fn on(&mut self) -> anyhow::Result<()> {
        self.line.set(true)
    }

    pub fn off(&mut self) -> anyhow::Result<()> {
        self.line.set(false)
    }

    pub fn toggle(&mut self) -> anyhow::Result<()> {
        let lit = self.line.is_high();
        self.line.set(!lit)
    }

    pub fn is_lit(&self) -> bool {
        self.line.is_high()
    }

    fn shutdown(&mut self) -> anyhow::Result<()> {
        self.off()
    }
}

digital_component!(Led, |led| { "is_lit" => led.is_lit() });

#[derive(Debug)]
pub struct Button {
    name: String,
    claim: PortClaim,
    line: Box<dyn InputLine>,
}

impl Button {
    #[tracing::instrument(skip(board))]
    pub fn new(board: &Board, port_name: &str, name: &str) -> anyhow::Result<Self> {
        trace!("Button::new()");

        let (claim, pin) = claim_digital(board, port_name, "Button")?;
        let line = board.gpio().input(pin).context("Create button")?;

        Ok(Self {
            name: name.to_owned(),
            claim,
            line,
        })
    }

    pub fn is_pressed(&self) -> anyhow::Result<bool> {
        self.line.is_high()
    }

    fn shutdown(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

digital_component!(Button, |button| { "is_pressed" => button.is_pressed().ok() });

#[derive(Debug)]
pub struct Buzzer {
    name: String,
    claim: PortClaim,
    line: Box<dyn OutputLine>,
}

impl Buzzer {
    #[tracing::instrument(skip(board))]
    pub fn new(board: &Board, port_name: &str, name: &str) -> anyhow::Result<Self> {
        trace!("Buzzer::new()");

        let (claim, pin) = claim_digital(board, port_name, "Buzzer")?;
        let line = board.gpio().output(pin).context("Create buzzer")?;

        Ok(Self {
            name: name.to_owned(),
            claim,
            line,
        })
    }

    pub fn on(&mut self) -> anyhow::Result<()> {
        debug!("Buzzer {} on", self.name);
        self.line.set(true)
    }

    pub fn off(&mut self) -> anyhow::Result<()> {
        self.line.set(false)
    }

    pub fn is_active(&self) -> bool {
        self.line.is_high()
    }

    fn shutdown(&mut self) -> anyhow::Result<()> {
        self.off()
    }
}

digital_component!(Buzzer, |buzzer| { "is_active" => buzzer.is_active() });

pub(crate) fn register(registry: &mut Registry) {
    registry.register(module_path!(), "Led", Led::from_config);
    registry.register(module_path!(), "Button", Button::from_config);
    registry.register(module_path!(), "Buzzer", Buzzer::from_config);
}

#[cfg(test)]
mod tests {
    use common::error::{kind_of, SdkError};

    use super::*;
    use crate::mock;

    #[test]
    fn analog_port_rejected() {
        let (board, _hw) = mock::board();

        let err = Led::new(&board, "A0", "led").unwrap_err();
        assert!(matches!(kind_of(&err), Some(SdkError::Validation(_))));

        assert!(Led::new(&board, "D0", "led").is_ok());
    }

    #[test]
    fn plate_ports_rejected() {
        let (board, _hw) = mock::board();

        assert!(Button::new(&board, "S1", "button").is_err());
        assert!(Buzzer::new(&board, "M2", "buzzer").is_err());
    }

    #[test]
    fn led_drives_first_pin() {
        let (board, hw) = mock::board();
        let mut led = Led::new(&board, "D1", "led").unwrap();

        led.on().unwrap();
        assert!(led.is_lit());
        assert_eq!(hw.gpio.level(24), Some(true));

        led.toggle().unwrap();
        assert!(!led.is_lit());
        assert_eq!(hw.gpio.level(24), Some(false));
    }

    #[test]
    fn button_reads_input() {
        let (board, hw) = mock::board();
        let button = Button::new(&board, "D7", "button").unwrap();

        assert!(!button.is_pressed().unwrap());
        hw.gpio.set_input(15, true);
        assert!(button.is_pressed().unwrap());
        assert_eq!(button.own_state()["is_pressed"], json!(true));
    }

    #[test]
    fn port_held_until_drop() {
        let (board, _hw) = mock::board();

        let buzzer = Buzzer::new(&board, "D2", "buzzer").unwrap();
        assert!(Led::new(&board, "D2", "led").is_err());

        drop(buzzer);
        assert!(Led::new(&board, "D2", "led").is_ok());
    }

    #[test]
    fn close_turns_off() {
        let (board, hw) = mock::board();
        let mut buzzer = Buzzer::new(&board, "D4", "buzzer").unwrap();

        buzzer.on().unwrap();
        buzzer.close().unwrap();
        assert_eq!(hw.gpio.level(7), Some(false));
    }
}
