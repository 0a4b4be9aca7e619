//! The four buttons on the pi-top case, reported by the device manager

use std::{
    fs::{self, File, OpenOptions},
    net::SocketAddr,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use anyhow::Context;
use common::{
    error::{LogErrorExt, SdkError},
    protocol::ids,
};
use fs2::FileExt;
use networking::SubscribeClient;
use tracing::{debug, trace};

use crate::board::Board;

pub const BUTTON_LOCK_DIR: &str = "button-locks";

pub type ButtonCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CaseButtonId {
    Up,
    Down,
    Select,
    Cancel,
}

impl CaseButtonId {
    pub const ALL: [CaseButtonId; 4] = [
        CaseButtonId::Up,
        CaseButtonId::Down,
        CaseButtonId::Select,
        CaseButtonId::Cancel,
    ];

    pub fn pressed_id(&self) -> u16 {
        match self {
            CaseButtonId::Up => ids::PUB_V3_BUTTON_UP_PRESSED,
            CaseButtonId::Down => ids::PUB_V3_BUTTON_DOWN_PRESSED,
            CaseButtonId::Select => ids::PUB_V3_BUTTON_SELECT_PRESSED,
            CaseButtonId::Cancel => ids::PUB_V3_BUTTON_CANCEL_PRESSED,
        }
    }

    pub fn released_id(&self) -> u16 {
        match self {
            CaseButtonId::Up => ids::PUB_V3_BUTTON_UP_RELEASED,
            CaseButtonId::Down => ids::PUB_V3_BUTTON_DOWN_RELEASED,
            CaseButtonId::Select => ids::PUB_V3_BUTTON_SELECT_RELEASED,
            CaseButtonId::Cancel => ids::PUB_V3_BUTTON_CANCEL_RELEASED,
        }
    }
}

#[derive(Default)]
struct ButtonState {
    pressed: AtomicBool,
    when_pressed: Mutex<Option<ButtonCallback>>,
    when_released: Mutex<Option<ButtonCallback>>,
}

/// One case button, clones observe the same button
#[derive(Clone)]
pub struct CaseButton {
    id: CaseButtonId,
    state: Arc<ButtonState>,
}

impl CaseButton {
    fn new(id: CaseButtonId) -> Self {
        Self {
            id,
            state: Arc::new(ButtonState::default()),
        }
    }

    pub fn id(&self) -> CaseButtonId {
        self.id
    }

    pub fn is_pressed(&self) -> bool {
        self.state.pressed.load(Ordering::Acquire)
    }

    /// Runs on the subscribe worker, must not block
    pub fn when_pressed(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self
            .state
            .when_pressed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::new(callback));
    }

    /// Runs on the subscribe worker, must not block
    pub fn when_released(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self
            .state
            .when_released
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::new(callback));
    }

    fn update(&self, pressed: bool) {
        self.state.pressed.store(pressed, Ordering::Release);

        let callback = if pressed {
            &self.state.when_pressed
        } else {
            &self.state.when_released
        };
        // Cloned so a callback may replace itself
        let callback = callback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        if let Some(callback) = callback {
            callback();
        }
    }
}

impl std::fmt::Debug for CaseButton {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaseButton")
            .field("id", &self.id)
            .field("pressed", &self.is_pressed())
            .finish()
    }
}

/// Tells the device manager this process listens to the buttons
#[derive(Debug)]
struct ButtonLock {
    path: PathBuf,
    file: File,
}

impl ButtonLock {
    fn create(lock_dir: &Path) -> anyhow::Result<Self> {
        let dir = lock_dir.join(BUTTON_LOCK_DIR);
        fs::create_dir_all(&dir).with_context(|| format!("Create {}", dir.display()))?;

        let path = dir.join(format!("pt-buttons-{}.lock", std::process::id()));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .with_context(|| format!("Create {}", path.display()))?;
        file.set_permissions(fs::Permissions::from_mode(0o666))?;
        file.try_lock_exclusive()
            .map_err(|err| SdkError::Contention(format!("{}: {err}", path.display())))?;

        debug!("Holding button lock {}", path.display());
        Ok(Self { path, file })
    }
}

impl Drop for ButtonLock {
    fn drop(&mut self) {
        self.file.unlock().log_error("Unlock button lock");
        fs::remove_file(&self.path).log_error("Remove button lock");
    }
}

/// The case buttons, kept up to date by a device manager subscription
pub struct CaseButtons {
    up: CaseButton,
    down: CaseButton,
    select: CaseButton,
    cancel: CaseButton,
    subscriber: SubscribeClient,
    _lock: ButtonLock,
}

impl CaseButtons {
    #[tracing::instrument(skip(board))]
    pub fn new(board: &Board) -> anyhow::Result<Self> {
        let settings = board.settings();
        Self::connect(settings.device_manager.subscribe_addr, &settings.lock_dir)
    }

    #[tracing::instrument]
    pub fn connect(addr: SocketAddr, lock_dir: &Path) -> anyhow::Result<Self> {
        trace!("CaseButtons::connect()");

        let lock = ButtonLock::create(lock_dir)?;
        let [up, down, select, cancel] = CaseButtonId::ALL.map(CaseButton::new);

        let mut subscriber = SubscribeClient::new(addr);
        for button in [&up, &down, &select, &cancel] {
            for pressed in [true, false] {
                let id = if pressed {
                    button.id().pressed_id()
                } else {
                    button.id().released_id()
                };

                let button = button.clone();
                subscriber.add_handler(
                    id,
                    Box::new(move |_| {
                        button.update(pressed);
                        Ok(())
                    }),
                );
            }
        }
        subscriber
            .start()
            .map_err(SdkError::from)
            .context("Subscribe to case buttons")?;

        Ok(Self {
            up,
            down,
            select,
            cancel,
            subscriber,
            _lock: lock,
        })
    }

    pub fn button(&self, id: CaseButtonId) -> &CaseButton {
        match id {
            CaseButtonId::Up => &self.up,
            CaseButtonId::Down => &self.down,
            CaseButtonId::Select => &self.select,
            CaseButtonId::Cancel => &self.cancel,
        }
    }

    pub fn up(&self) -> &CaseButton {
        &self.up
    }

    pub fn down(&self) -> &CaseButton {
        &self.down
    }

    pub fn select(&self) -> &CaseButton {
        &self.select
    }

    pub fn cancel(&self) -> &CaseButton {
        &self.cancel
    }

    pub fn close(&mut self) {
        self.subscriber.stop();
    }
}

impl std::fmt::Debug for CaseButtons {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaseButtons")
            .field("up", &self.up)
            .field("down", &self.down)
            .field("select", &self.select)
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{net::TcpListener, thread, time::Duration};

    use crossbeam::channel;

    use super::*;

    fn publisher() -> (SocketAddr, zmq::Context, zmq::Socket) {
        let context = zmq::Context::new();
        let socket = context.socket(zmq::PUB).unwrap();
        socket.bind("tcp://127.0.0.1:*").unwrap();

        let endpoint = socket.get_last_endpoint().unwrap().unwrap();
        let addr = endpoint.trim_start_matches("tcp://").parse().unwrap();

        (addr, context, socket)
    }

    #[test]
    fn publications_drive_buttons() {
        let (addr, _context, publisher) = publisher();
        let dir = tempfile::tempdir().unwrap();

        let buttons = CaseButtons::connect(addr, dir.path()).unwrap();

        // Publications sent before the subscription reaches the publisher are lost
        for _ in 0..200 {
            publisher.send(&b"313"[..], 0).unwrap();
            thread::sleep(Duration::from_millis(20));
            if buttons.up().is_pressed() {
                break;
            }
        }
        assert!(buttons.up().is_pressed());

        let (tx, rx) = channel::unbounded();
        let (pressed_tx, released_tx) = (tx.clone(), tx);
        buttons.select().when_pressed(move || pressed_tx.send("pressed").unwrap());
        buttons.select().when_released(move || released_tx.send("released").unwrap());

        publisher.send(&b"317"[..], 0).unwrap();
        let timeout = Duration::from_secs(2);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), "pressed");
        publisher.send(&b"318"[..], 0).unwrap();
        assert_eq!(rx.recv_timeout(timeout).unwrap(), "released");

        assert!(buttons.up().is_pressed());
        assert!(!buttons.select().is_pressed());
        assert!(!buttons.button(CaseButtonId::Cancel).is_pressed());
    }

    #[test]
    fn lock_file_lifetime() {
        // Nothing publishes here, the subscription keeps retrying in the background
        let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir
            .path()
            .join(BUTTON_LOCK_DIR)
            .join(format!("pt-buttons-{}.lock", std::process::id()));

        let buttons = CaseButtons::connect(addr, dir.path()).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o666);

        drop(buttons);
        assert!(!path.exists());
    }

    #[test]
    fn ids_cover_all_publications() {
        let mut ids: Vec<u16> = CaseButtonId::ALL
            .iter()
            .flat_map(|id| [id.pressed_id(), id.released_id()])
            .collect();
        ids.sort();

        assert_eq!(
            ids,
            (ids::PUB_V3_BUTTON_UP_PRESSED..=ids::PUB_V3_BUTTON_CANCEL_RELEASED).collect::<Vec<_>>()
        );
    }
}
