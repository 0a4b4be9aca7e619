//! Mapping from the labelled connectors on the expansion plate to bus level addresses

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SdkError;

/// What sits behind a port
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortKind {
    /// Read through the plate MCU's ADC
    Analog,
    /// Wired straight to the host's GPIO header
    Digital,
    /// Driven by a servo register bank on the plate MCU
    Servo,
    /// Driven by a motor register bank on the plate MCU
    Motor,
}

/// Where a single pin of a port ends up
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PinAddress {
    Gpio(u8),
    AdcChannel(u8),
    ServoBank(u8),
    MotorBank(u8),
}

/// A validated port label such as `D0` or `M3`
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Port {
    kind: PortKind,
    index: u8,
}

struct PortDefinition {
    label: &'static str,
    kind: PortKind,
    pins: [PinAddress; 2],
}

use PinAddress::*;
use PortKind::*;

#[rustfmt::skip]
static PORT_MAP: [PortDefinition; 20] = [
    PortDefinition { label: "A0", kind: Analog,  pins: [AdcChannel(0), AdcChannel(1)] },
    PortDefinition { label: "A1", kind: Analog,  pins: [AdcChannel(2), AdcChannel(3)] },
    PortDefinition { label: "A2", kind: Analog,  pins: [AdcChannel(4), AdcChannel(5)] },
    PortDefinition { label: "A3", kind: Analog,  pins: [AdcChannel(6), AdcChannel(7)] },

    PortDefinition { label: "D0", kind: Digital, pins: [Gpio(22), Gpio(23)] },
    PortDefinition { label: "D1", kind: Digital, pins: [Gpio(24), Gpio(25)] },
    PortDefinition { label: "D2", kind: Digital, pins: [Gpio(26), Gpio(27)] },
    PortDefinition { label: "D3", kind: Digital, pins: [Gpio(5),  Gpio(6)] },
    PortDefinition { label: "D4", kind: Digital, pins: [Gpio(7),  Gpio(8)] },
    PortDefinition { label: "D5", kind: Digital, pins: [Gpio(10), Gpio(11)] },
    PortDefinition { label: "D6", kind: Digital, pins: [Gpio(12), Gpio(13)] },
    PortDefinition { label: "D7", kind: Digital, pins: [Gpio(15), Gpio(16)] },

    // Servos and motors only have a single logical pin, the bank
    PortDefinition { label: "S1", kind: Servo,   pins: [ServoBank(0), ServoBank(0)] },
    PortDefinition { label: "S2", kind: Servo,   pins: [ServoBank(1), ServoBank(1)] },
    PortDefinition { label: "S3", kind: Servo,   pins: [ServoBank(2), ServoBank(2)] },
    PortDefinition { label: "S4", kind: Servo,   pins: [ServoBank(3), ServoBank(3)] },

    PortDefinition { label: "M1", kind: Motor,   pins: [MotorBank(0), MotorBank(0)] },
    PortDefinition { label: "M2", kind: Motor,   pins: [MotorBank(1), MotorBank(1)] },
    PortDefinition { label: "M3", kind: Motor,   pins: [MotorBank(2), MotorBank(2)] },
    PortDefinition { label: "M4", kind: Motor,   pins: [MotorBank(3), MotorBank(3)] },
];

impl Port {
    pub fn parse(label: &str) -> Result<Self, SdkError> {
        PORT_MAP
            .iter()
            .position(|port| port.label == label)
            .map(|index| Port {
                kind: PORT_MAP[index].kind,
                index: index as u8,
            })
            .ok_or_else(|| {
                SdkError::validation(format!("{label:?} is not a valid port name"))
            })
    }

    pub fn label(&self) -> &'static str {
        self.definition().label
    }

    pub fn kind(&self) -> PortKind {
        self.kind
    }

    /// Resolves one of the two pins of this port, `pin_index` is 1 or 2
    pub fn pin(&self, pin_index: u8) -> Result<PinAddress, SdkError> {
        match pin_index {
            1 | 2 => Ok(self.definition().pins[pin_index as usize - 1]),
            _ => Err(SdkError::validation(format!(
                "Pin index must be 1 or 2, got {pin_index}"
            ))),
        }
    }

    /// Host GPIO number for a digital component
    pub fn gpio(&self, pin_index: u8) -> Result<u8, SdkError> {
        match (self.kind, self.pin(pin_index)?) {
            (Digital, Gpio(pin)) => Ok(pin),
            (Analog, _) => Err(SdkError::validation(format!(
                "Port {self} is analog and can't be used by a digital component"
            ))),
            _ => Err(SdkError::validation(format!(
                "Port {self} is driven by the plate MCU, not the GPIO header"
            ))),
        }
    }

    pub fn adc_channel(&self, pin_index: u8) -> Result<u8, SdkError> {
        match self.pin(pin_index)? {
            AdcChannel(channel) => Ok(channel),
            _ => Err(SdkError::validation(format!(
                "Port {self} is not an analog port"
            ))),
        }
    }

    pub fn servo_bank(&self) -> Result<u8, SdkError> {
        match self.pin(1)? {
            ServoBank(bank) => Ok(bank),
            _ => Err(SdkError::validation(format!(
                "Servo motors must be connected to ports S1-S4, got {self}"
            ))),
        }
    }

    pub fn motor_bank(&self) -> Result<u8, SdkError> {
        match self.pin(1)? {
            MotorBank(bank) => Ok(bank),
            _ => Err(SdkError::validation(format!(
                "Encoder motors must be connected to ports M1-M4, got {self}"
            ))),
        }
    }

    fn definition(&self) -> &'static PortDefinition {
        &PORT_MAP[self.index as usize]
    }

    pub fn all() -> impl Iterator<Item = Port> {
        (0..PORT_MAP.len()).map(|index| Port {
            kind: PORT_MAP[index].kind,
            index: index as u8,
        })
    }
}

/// Resolves a label and pin index straight to its bus address
pub fn resolve(label: &str, pin_index: u8) -> Result<PinAddress, SdkError> {
    Port::parse(label)?.pin(pin_index)
}

/// Resolves a label and pin index to a GPIO number, rejecting anything not on the header
pub fn resolve_gpio(label: &str, pin_index: u8) -> Result<u8, SdkError> {
    Port::parse(label)?.gpio(pin_index)
}

impl Display for Port {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Port {
    type Err = SdkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Port::parse(s)
    }
}

impl TryFrom<String> for Port {
    type Error = SdkError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Port::parse(&value)
    }
}

impl From<Port> for String {
    fn from(value: Port) -> Self {
        value.label().to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn digital_pins_are_unique() {
        let mut seen = HashSet::new();

        for port in (0..8).map(|idx| format!("D{idx}")) {
            for pin in [1, 2] {
                let gpio = resolve_gpio(&port, pin).unwrap();
                assert!(gpio < 28, "{port}:{pin} -> {gpio}");
                assert!(seen.insert(gpio), "{port}:{pin} reuses gpio {gpio}");
            }
        }

        assert_eq!(seen.len(), 16);
    }

    #[test]
    fn analog_rejected_as_digital() {
        let err = resolve_gpio("A0", 1).unwrap_err();
        assert!(matches!(err, SdkError::Validation(_)));

        assert_eq!(resolve_gpio("D0", 1), Ok(22));
        assert_eq!(resolve_gpio("D0", 2), Ok(23));
    }

    #[test]
    fn plate_ports_route_to_banks() {
        assert_eq!(resolve("S1", 1), Ok(PinAddress::ServoBank(0)));
        assert_eq!(resolve("M4", 1), Ok(PinAddress::MotorBank(3)));
        assert!(resolve_gpio("M1", 1).is_err());

        assert_eq!(Port::parse("S3").unwrap().servo_bank(), Ok(2));
        assert!(Port::parse("S3").unwrap().motor_bank().is_err());
    }

    #[test]
    fn adc_channels() {
        assert_eq!(Port::parse("A0").unwrap().adc_channel(1), Ok(0));
        assert_eq!(Port::parse("A3").unwrap().adc_channel(2), Ok(7));
        assert!(Port::parse("D3").unwrap().adc_channel(1).is_err());
    }

    #[test]
    fn bad_input() {
        assert!(Port::parse("D8").is_err());
        assert!(Port::parse("d0").is_err());
        assert!(Port::parse("").is_err());
        assert!(resolve("D0", 0).is_err());
        assert!(resolve("D0", 3).is_err());
    }

    #[test]
    fn label_round_trip() {
        for port in Port::all() {
            assert_eq!(port.label().parse::<Port>(), Ok(port));
        }
    }
}
