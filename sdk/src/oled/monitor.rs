//! Notices other processes opening and closing the display lock file

use std::{
    io::ErrorKind,
    os::fd::AsRawFd,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::Context;
use inotify::{EventMask, Inotify, WatchMask};
use mio::{unix::SourceFd, Events, Interest, Poll, Token};
use tracing::{debug, error, span, trace, Level};

pub type Callback = Arc<dyn Fn() + Send + Sync>;

const TICK: Duration = Duration::from_millis(500);
const INOTIFY_TOKEN: Token = Token(0);

pub struct LockFileMonitor {
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl LockFileMonitor {
    /// Watches `path` on a worker thread, `on_open` runs whenever the file is opened
    /// and `on_close` whenever a writer closes it
    #[tracing::instrument(skip(on_open, on_close))]
    pub fn start(path: &Path, on_open: Callback, on_close: Callback) -> anyhow::Result<Self> {
        trace!("LockFileMonitor::start()");

        let inotify = Inotify::init().context("Init inotify")?;
        inotify
            .watches()
            .add(path, WatchMask::OPEN | WatchMask::CLOSE_WRITE)
            .with_context(|| format!("Watch {}", path.display()))?;

        let poll = Poll::new().context("Create poll")?;
        poll.registry()
            .register(
                &mut SourceFd(&inotify.as_raw_fd()),
                INOTIFY_TOKEN,
                Interest::READABLE,
            )
            .context("Register inotify")?;

        let stop = Arc::new(AtomicBool::new(false));
        let worker = {
            let stop = stop.clone();

            thread::Builder::new()
                .name("pt-oled-monitor".to_owned())
                .spawn(move || watch(inotify, poll, stop, on_open, on_close))
                .context("Spawn lock file monitor")?
        };

        Ok(Self {
            stop,
            worker: Some(worker),
        })
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Returns within one tick, closing the inotify handle
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        self.stop.store(true, Ordering::Relaxed);
        if worker.join().is_err() {
            error!("Lock file monitor panicked");
        }
    }
}

impl Drop for LockFileMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for LockFileMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockFileMonitor")
            .field("running", &self.is_running())
            .finish()
    }
}

fn watch(
    mut inotify: Inotify,
    mut poll: Poll,
    stop: Arc<AtomicBool>,
    on_open: Callback,
    on_close: Callback,
) {
    let _span = span!(Level::INFO, "OLED lock monitor thread").entered();

    let mut events = Events::with_capacity(4);
    let mut buffer = [0; 1024];

    while !stop.load(Ordering::Relaxed) {
        if let Err(err) = poll.poll(&mut events, Some(TICK)) {
            if err.kind() == ErrorKind::Interrupted {
                continue;
            }

            error!("Poll failed: {err:?}");
            break;
        }

        if events.is_empty() {
            continue;
        }

        loop {
            let masks: Vec<EventMask> = match inotify.read_events(&mut buffer) {
                Ok(read) => read.map(|event| event.mask).collect(),
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    error!("Read inotify events: {err:?}");
                    return;
                }
            };

            for mask in masks {
                if mask.contains(EventMask::OPEN) {
                    debug!("Display lock opened");
                    on_open();
                }
                if mask.contains(EventMask::CLOSE_WRITE) {
                    debug!("Display lock closed");
                    on_close();
                }
            }
        }
    }

    debug!("Lock file monitor stopped");
}

#[cfg(test)]
mod tests {
    use std::{fs::OpenOptions, time::Instant};

    use crossbeam::channel;

    use super::*;

    #[test]
    fn open_and_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pt-oled.lock");
        std::fs::write(&path, b"").unwrap();

        let (tx, rx) = channel::unbounded();
        let (open_tx, close_tx) = (tx.clone(), tx);
        let mut monitor = LockFileMonitor::start(
            &path,
            Arc::new(move || open_tx.send("open").unwrap()),
            Arc::new(move || close_tx.send("close").unwrap()),
        )
        .unwrap();

        {
            let _file = OpenOptions::new().write(true).open(&path).unwrap();
        }

        let timeout = Duration::from_secs(2);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), "open");
        assert_eq!(rx.recv_timeout(timeout).unwrap(), "close");

        let start = Instant::now();
        monitor.stop();
        assert!(start.elapsed() < TICK * 2);
        assert!(!monitor.is_running());
    }
}
