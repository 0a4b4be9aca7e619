//! Register level access to I2C devices

use std::{collections::HashSet, fmt::Debug, sync::Mutex};

use anyhow::{bail, Context};
use common::error::SdkError;
use lazy_static::lazy_static;
use rppal::i2c::I2c;
use tracing::{debug, trace};

lazy_static! {
    /// (bus, address) pairs with a live handle in this process
    static ref ACTIVE_HANDLES: Mutex<HashSet<(u8, u8)>> = Mutex::new(HashSet::new());
}

/// A device addressed through 8 bit registers
///
/// Multi byte values are read from adjacent registers starting at `register`.
pub trait RegisterDevice: Send + Debug {
    fn read(&mut self, register: u8, buffer: &mut [u8]) -> anyhow::Result<()>;
    fn write(&mut self, register: u8, buffer: &[u8]) -> anyhow::Result<()>;

    fn read_unsigned_byte(&mut self, register: u8) -> anyhow::Result<u8> {
        let bytes = &mut [0];
        self.read(register, bytes)?;
        Ok(bytes[0])
    }

    fn write_byte(&mut self, register: u8, byte: u8) -> anyhow::Result<()> {
        self.write(register, &[byte])
    }

    fn read_unsigned_word(&mut self, register: u8, little_endian: bool) -> anyhow::Result<u16> {
        let mut bytes = [0; 2];
        self.read(register, &mut bytes)?;

        Ok(if little_endian {
            u16::from_le_bytes(bytes)
        } else {
            u16::from_be_bytes(bytes)
        })
    }

    fn read_signed_word(&mut self, register: u8, little_endian: bool) -> anyhow::Result<i16> {
        self.read_unsigned_word(register, little_endian)
            .map(|word| word as i16)
    }

    fn write_word(&mut self, register: u8, word: u16, little_endian: bool) -> anyhow::Result<()> {
        let bytes = if little_endian {
            word.to_le_bytes()
        } else {
            word.to_be_bytes()
        };
        self.write(register, &bytes)
    }

    fn write_signed_word(
        &mut self,
        register: u8,
        word: i16,
        little_endian: bool,
    ) -> anyhow::Result<()> {
        self.write_word(register, word as u16, little_endian)
    }

    fn read_bulk(&mut self, register: u8, count: usize) -> anyhow::Result<Vec<u8>> {
        let mut bytes = vec![0; count];
        self.read(register, &mut bytes)?;
        Ok(bytes)
    }

    fn read_signed_dword(&mut self, register: u8, little_endian: bool) -> anyhow::Result<i32> {
        let mut bytes = [0; 4];
        self.read(register, &mut bytes)?;

        Ok(if little_endian {
            i32::from_le_bytes(bytes)
        } else {
            i32::from_be_bytes(bytes)
        })
    }

    fn write_signed_dword(
        &mut self,
        register: u8,
        dword: i32,
        little_endian: bool,
    ) -> anyhow::Result<()> {
        let bytes = if little_endian {
            dword.to_le_bytes()
        } else {
            dword.to_be_bytes()
        };
        self.write(register, &bytes)
    }
}

/// A register device on a Linux I2C bus
///
/// The bus is opened on first use. Only one `I2cDevice` per bus and address may be
/// connected at a time in this process.
#[derive(Debug)]
pub struct I2cDevice {
    bus: u8,
    address: u8,
    handle: Option<I2c>,
}

impl I2cDevice {
    #[tracing::instrument]
    pub fn new(bus: u8, address: u8) -> Self {
        trace!("I2cDevice::new()");

        Self {
            bus,
            address,
            handle: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_some()
    }

    pub fn connect(&mut self) -> anyhow::Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }

        {
            let mut active = ACTIVE_HANDLES
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !active.insert((self.bus, self.address)) {
                bail!(SdkError::Contention(format!(
                    "I2C device {:#04x} on bus {} already has a live handle",
                    self.address, self.bus
                )));
            }
        }

        match self.open() {
            Ok(handle) => {
                debug!("Connected to {:#04x} on bus {}", self.address, self.bus);
                self.handle = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.release_slot();
                Err(err)
            }
        }
    }

    pub fn disconnect(&mut self) {
        if self.handle.take().is_some() {
            self.release_slot();
            debug!("Disconnected from {:#04x} on bus {}", self.address, self.bus);
        }
    }

    fn open(&self) -> anyhow::Result<I2c> {
        let mut handle = I2c::with_bus(self.bus)
            .map_err(|err| bus_error(self, "Open bus", err))
            .context("Connect I2C device")?;
        handle
            .set_slave_address(self.address as u16)
            .map_err(|err| bus_error(self, "Set address", err))?;

        Ok(handle)
    }

    fn release_slot(&self) {
        let mut active = ACTIVE_HANDLES
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        active.remove(&(self.bus, self.address));
    }

    fn handle(&mut self) -> anyhow::Result<&mut I2c> {
        self.connect()?;
        match &mut self.handle {
            Some(handle) => Ok(handle),
            None => bail!(SdkError::bus("I2C handle vanished after connecting")),
        }
    }
}

fn bus_error(device: &I2cDevice, during: &str, err: rppal::i2c::Error) -> SdkError {
    SdkError::bus(format!(
        "{during} for {:#04x} on bus {}: {err}",
        device.address, device.bus
    ))
}

impl RegisterDevice for I2cDevice {
    fn read(&mut self, register: u8, buffer: &mut [u8]) -> anyhow::Result<()> {
        let res = self.handle()?.block_read(register, buffer);
        res.map_err(|err| bus_error(self, &format!("Read register {register:#04x}"), err))?;

        trace!("Read {buffer:?} from {register:#04x}");
        Ok(())
    }

    fn write(&mut self, register: u8, buffer: &[u8]) -> anyhow::Result<()> {
        trace!("Writing {buffer:?} to {register:#04x}");

        let res = self.handle()?.block_write(register, buffer);
        res.map_err(|err| bus_error(self, &format!("Write register {register:#04x}"), err))?;

        Ok(())
    }
}

impl Drop for I2cDevice {
    fn drop(&mut self) {
        self.disconnect();
    }
}
