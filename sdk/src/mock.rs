//! In memory stand-ins for the hardware and the device manager

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use common::{
    error::SdkError,
    protocol::{ids, Message},
};
use networking::{request::Requester, NetError, NetResult};

use crate::{
    board::Board,
    digital::{GpioProvider, InputLine, OutputLine},
    oled::sh1106::DisplayBus,
    peripheral::RegisterDevice,
    plate::Plate,
    settings::Settings,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A 256 byte register bank shared between clones
#[derive(Clone, Debug)]
pub struct MockRegisters {
    state: Arc<Mutex<RegisterState>>,
}

#[derive(Debug)]
struct RegisterState {
    bank: Vec<u8>,
    writes: Vec<(u8, Vec<u8>)>,
    connections: usize,
    failing: bool,
}

impl Default for MockRegisters {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(RegisterState {
                bank: vec![0; 256],
                writes: Vec::new(),
                connections: 0,
                failing: false,
            })),
        }
    }
}

impl MockRegisters {
    pub fn set(&self, register: u8, bytes: &[u8]) {
        let mut state = lock(&self.state);
        for (offset, byte) in bytes.iter().enumerate() {
            state.bank[(register as usize + offset) % 256] = *byte;
        }
    }

    pub fn get(&self, register: u8, count: usize) -> Vec<u8> {
        let state = lock(&self.state);
        (0..count)
            .map(|offset| state.bank[(register as usize + offset) % 256])
            .collect()
    }

    /// Every write in order
    pub fn writes(&self) -> Vec<(u8, Vec<u8>)> {
        lock(&self.state).writes.clone()
    }

    pub fn writes_to(&self, register: u8) -> usize {
        lock(&self.state)
            .writes
            .iter()
            .filter(|(written, _)| *written == register)
            .count()
    }

    /// Makes every transfer fail with a bus error
    pub fn set_failing(&self, failing: bool) {
        lock(&self.state).failing = failing;
    }

    pub fn connections(&self) -> usize {
        lock(&self.state).connections
    }

    pub fn connect(&self) -> Box<dyn RegisterDevice> {
        lock(&self.state).connections += 1;
        Box::new(self.clone())
    }

    /// A plate talking to this bank, without a heartbeat
    pub fn plate(&self) -> Plate {
        let registers = self.clone();
        Plate::with_factory(Box::new(move || Ok(registers.connect())), None)
    }
}

impl RegisterDevice for MockRegisters {
    fn read(&mut self, register: u8, buffer: &mut [u8]) -> anyhow::Result<()> {
        let state = lock(&self.state);
        if state.failing {
            return Err(SdkError::bus(format!("Read {register:#04x} failed")).into());
        }

        for (offset, byte) in buffer.iter_mut().enumerate() {
            *byte = state.bank[(register as usize + offset) % 256];
        }
        Ok(())
    }

    fn write(&mut self, register: u8, buffer: &[u8]) -> anyhow::Result<()> {
        {
            let mut state = lock(&self.state);
            if state.failing {
                return Err(SdkError::bus(format!("Write {register:#04x} failed")).into());
            }
            state.writes.push((register, buffer.to_vec()));
        }

        self.set(register, buffer);
        Ok(())
    }
}

/// Scripted device manager
#[derive(Clone, Debug, Default)]
pub struct MockRequester {
    state: Arc<Mutex<RequesterState>>,
}

#[derive(Debug, Default)]
struct RequesterState {
    replies: HashMap<u16, Vec<String>>,
    errors: HashMap<u16, u16>,
    sent: Vec<Message>,
}

impl MockRequester {
    /// Answers `request` with its paired response carrying `parameters`
    pub fn reply(&self, request: u16, parameters: &[&str]) {
        let parameters = parameters.iter().map(|param| param.to_string()).collect();
        lock(&self.state).replies.insert(request, parameters);
    }

    /// Answers `request` with one of the `RSP_ERR_*` ids
    pub fn reply_error(&self, request: u16, error: u16) {
        lock(&self.state).errors.insert(request, error);
    }

    pub fn sent(&self) -> Vec<Message> {
        lock(&self.state).sent.clone()
    }

    pub fn sent_ids(&self) -> Vec<u16> {
        lock(&self.state).sent.iter().map(Message::id).collect()
    }
}

impl Requester for MockRequester {
    fn request(&self, message: Message) -> NetResult<Message> {
        let mut state = lock(&self.state);

        let response_id = ids::response_to(message.id()).ok_or(NetError::NotARequest(message.id()))?;
        message.validate_declared()?;
        state.sent.push(message.clone());

        if let Some(error) = state.errors.get(&message.id()) {
            return Err(NetError::ServerError {
                request: message,
                response: Message::empty(*error),
            });
        }

        let parameters = state.replies.get(&message.id()).cloned().unwrap_or_default();
        let response = Message::new(response_id, parameters);
        response.validate_declared()?;

        Ok(response)
    }
}

/// Records everything sent to the display
#[derive(Clone, Debug, Default)]
pub struct MockDisplayBus {
    log: Arc<Mutex<DisplayLog>>,
}

#[derive(Debug, Default)]
struct DisplayLog {
    commands: Vec<u8>,
    data: Vec<u8>,
    opened: Vec<u8>,
}

impl MockDisplayBus {
    /// Bytes of pixel data sent so far
    pub fn data_len(&self) -> usize {
        lock(&self.log).data.len()
    }

    /// Complete frames sent so far, including the blank frame sent on init
    pub fn frames(&self) -> usize {
        self.data_len() / crate::oled::FRAME_BYTES
    }

    pub fn commands(&self) -> Vec<u8> {
        lock(&self.log).commands.clone()
    }

    /// Pixel data of the last frame sent
    pub fn last_frame(&self) -> Vec<u8> {
        let log = lock(&self.log);
        let start = log.data.len().saturating_sub(crate::oled::FRAME_BYTES);
        log.data[start..].to_vec()
    }

    /// SPI buses the display was opened on
    pub fn opened(&self) -> Vec<u8> {
        lock(&self.log).opened.clone()
    }

    pub fn open(&self, bus: u8) -> Box<dyn DisplayBus> {
        lock(&self.log).opened.push(bus);
        Box::new(self.clone())
    }
}

impl DisplayBus for MockDisplayBus {
    fn command(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        lock(&self.log).commands.extend_from_slice(bytes);
        Ok(())
    }

    fn data(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        lock(&self.log).data.extend_from_slice(bytes);
        Ok(())
    }
}

/// GPIO levels by pin number
#[derive(Clone, Debug, Default)]
pub struct MockGpio {
    levels: Arc<Mutex<HashMap<u8, bool>>>,
}

#[derive(Debug)]
struct MockLine {
    pin: u8,
    levels: Arc<Mutex<HashMap<u8, bool>>>,
}

impl MockGpio {
    pub fn level(&self, pin: u8) -> Option<bool> {
        lock(&self.levels).get(&pin).copied()
    }

    /// Drives an input pin from the outside
    pub fn set_input(&self, pin: u8, high: bool) {
        lock(&self.levels).insert(pin, high);
    }
}

impl GpioProvider for MockGpio {
    fn output(&self, pin: u8) -> anyhow::Result<Box<dyn OutputLine>> {
        lock(&self.levels).insert(pin, false);
        Ok(Box::new(MockLine {
            pin,
            levels: self.levels.clone(),
        }))
    }

    fn input(&self, pin: u8) -> anyhow::Result<Box<dyn InputLine>> {
        Ok(Box::new(MockLine {
            pin,
            levels: self.levels.clone(),
        }))
    }
}

impl OutputLine for MockLine {
    fn set(&mut self, high: bool) -> anyhow::Result<()> {
        lock(&self.levels).insert(self.pin, high);
        Ok(())
    }

    fn is_high(&self) -> bool {
        lock(&self.levels).get(&self.pin).copied().unwrap_or(false)
    }
}

impl InputLine for MockLine {
    fn is_high(&self) -> anyhow::Result<bool> {
        Ok(lock(&self.levels).get(&self.pin).copied().unwrap_or(false))
    }
}

/// Handles on the fakes behind a [`board`]
#[derive(Clone, Debug, Default)]
pub struct MockHardware {
    pub registers: MockRegisters,
    pub gpio: MockGpio,
    pub device_manager: MockRequester,
}

pub fn board() -> (Board, MockHardware) {
    board_with(Settings::default())
}

pub fn board_with(settings: Settings) -> (Board, MockHardware) {
    let hardware = MockHardware::default();
    let board = Board::from_parts(
        settings,
        hardware.registers.plate(),
        Arc::new(hardware.gpio.clone()),
        Arc::new(hardware.device_manager.clone()),
    );

    (board, hardware)
}
