//! SH1106 panel driver over SPI

use std::fmt::Debug;

use anyhow::{bail, Context};
use common::error::SdkError;
use rppal::spi::{Bus, Mode, SlaveSelect, Spi};
use tracing::{debug, trace};

use super::{Frame, PAGES};
use crate::digital::{GpioProvider, OutputLine};

pub const SPI_SPEED_HZ: u32 = 8_000_000;
pub const TRANSFER_SIZE: usize = 4096;

const DISPLAY_OFF: u8 = 0xAE;
const DISPLAY_ON: u8 = 0xAF;
const SET_CONTRAST: u8 = 0x81;
const DEFAULT_CONTRAST: u8 = 0x7F;
const SET_PAGE_ADDRESS: u8 = 0xB0;
/// The SH1106 has 132 columns of RAM, the panel starts at the third
const COLUMN_OFFSET: u8 = 0x02;
const SET_HIGH_COLUMN: u8 = 0x10;

const INIT_SEQUENCE: &[u8] = &[
    DISPLAY_OFF,
    0x20, // memory mode
    0x10,
    0xB0,
    0xC8, // scan COM outputs in reverse
    0x00,
    0x10,
    0x40, // start line 0
    0xA1, // segment remap
    0xA6, // normal, not inverted
    0xA8, // multiplex
    0x3F,
    0xA4, // resume from RAM
    0xD3, // display offset
    0x00,
    0xD5, // clock divide
    0xF0,
    0xD9, // precharge
    0x22,
    0xDA, // COM pins
    0x12,
    0xDB, // VCOM detect
    0x20,
    0x8D, // charge pump
    0x14,
];

/// Command/data transport to the panel
pub trait DisplayBus: Send + Debug {
    fn command(&mut self, bytes: &[u8]) -> anyhow::Result<()>;
    fn data(&mut self, bytes: &[u8]) -> anyhow::Result<()>;
}

/// SPI with the data/command select on a GPIO line
#[derive(Debug)]
pub struct SpiDisplayBus {
    spi: Spi,
    dc: Box<dyn OutputLine>,
}

impl SpiDisplayBus {
    /// Opens the panel on SPI `bus` using chip select 1
    #[tracing::instrument(skip(gpio))]
    pub fn open(bus: u8, gpio: &dyn GpioProvider) -> anyhow::Result<Self> {
        trace!("SpiDisplayBus::new()");

        let (spi_bus, dc_pin) = match bus {
            0 => (Bus::Spi0, 7),
            1 => (Bus::Spi1, 17),
            _ => bail!(SdkError::validation(format!("No SPI bus {bus}"))),
        };

        let spi = Spi::new(spi_bus, SlaveSelect::Ss1, SPI_SPEED_HZ, Mode::Mode0)
            .with_context(|| format!("Open SPI bus {bus}"))?;
        let dc = gpio.output(dc_pin).context("Claim OLED data/command line")?;

        Ok(Self { spi, dc })
    }

    fn send(&mut self, data: bool, bytes: &[u8]) -> anyhow::Result<()> {
        self.dc.set(data)?;

        for chunk in bytes.chunks(TRANSFER_SIZE) {
            self.spi
                .write(chunk)
                .map_err(|err| SdkError::bus(format!("SPI write failed: {err}")))?;
        }

        Ok(())
    }
}

impl DisplayBus for SpiDisplayBus {
    fn command(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        self.send(false, bytes)
    }

    fn data(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        self.send(true, bytes)
    }
}

#[derive(Debug)]
pub struct Sh1106 {
    bus: Box<dyn DisplayBus>,
    rotation: u8,
}

impl Sh1106 {
    /// Initialises the panel, leaving it blank and switched on
    #[tracing::instrument(skip(bus))]
    pub fn new(bus: Box<dyn DisplayBus>, rotation: u8) -> anyhow::Result<Self> {
        trace!("Sh1106::new()");

        if !matches!(rotation, 0 | 2) {
            bail!(SdkError::validation(format!(
                "Rotation must be 0 or 2, got {rotation}"
            )));
        }

        let mut sh1106 = Self { bus, rotation };
        sh1106.bus.command(INIT_SEQUENCE).context("Init SH1106")?;
        sh1106.contrast(DEFAULT_CONTRAST)?;
        sh1106.clear()?;
        sh1106.show()?;

        debug!("SH1106 ready");
        Ok(sh1106)
    }

    pub fn rotation(&self) -> u8 {
        self.rotation
    }

    pub fn display(&mut self, frame: &Frame) -> anyhow::Result<()> {
        let buffer = frame.pages(self.rotation);

        for (page, bytes) in buffer.chunks(buffer.len() / PAGES as usize).enumerate() {
            self.bus.command(&[
                SET_PAGE_ADDRESS + page as u8,
                COLUMN_OFFSET,
                SET_HIGH_COLUMN,
            ])?;
            self.bus.data(bytes)?;
        }

        Ok(())
    }

    pub fn contrast(&mut self, level: u8) -> anyhow::Result<()> {
        self.bus.command(&[SET_CONTRAST, level])
    }

    pub fn show(&mut self) -> anyhow::Result<()> {
        self.bus.command(&[DISPLAY_ON])
    }

    pub fn hide(&mut self) -> anyhow::Result<()> {
        self.bus.command(&[DISPLAY_OFF])
    }

    pub fn clear(&mut self) -> anyhow::Result<()> {
        self.display(&Frame::blank())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mock::MockDisplayBus, oled::FRAME_BYTES};

    #[test]
    fn init_blanks_and_shows() {
        let bus = MockDisplayBus::default();
        let _sh1106 = Sh1106::new(bus.open(1), 0).unwrap();

        let commands = bus.commands();
        assert_eq!(&commands[..INIT_SEQUENCE.len()], INIT_SEQUENCE);
        assert_eq!(commands.last(), Some(&DISPLAY_ON));
        assert_eq!(bus.frames(), 1);
        assert!(bus.last_frame().iter().all(|byte| *byte == 0));
    }

    #[test]
    fn pages_addressed_in_order() {
        let bus = MockDisplayBus::default();
        let mut sh1106 = Sh1106::new(bus.open(0), 2).unwrap();
        let before = bus.commands().len();

        let mut frame = Frame::blank();
        frame.set(127, 63, true);
        sh1106.display(&frame).unwrap();

        let commands = bus.commands();
        assert_eq!(commands.len() - before, 3 * PAGES as usize);
        assert_eq!(&commands[before..before + 3], &[0xB0, 0x02, 0x10]);
        assert_eq!(&commands[commands.len() - 3..], &[0xB7, 0x02, 0x10]);

        // Upside down, the bottom right pixel lands top left
        assert_eq!(bus.last_frame().len(), FRAME_BYTES);
        assert_eq!(bus.last_frame()[0], 0b0000_0001);
    }

    #[test]
    fn bad_rotation() {
        let bus = MockDisplayBus::default();
        assert!(Sh1106::new(bus.open(0), 1).is_err());
    }
}
