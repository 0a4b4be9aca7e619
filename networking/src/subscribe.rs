use std::{
    collections::HashMap,
    net::SocketAddr,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use common::{error::LogErrorExt, protocol::Message};
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use fxhash::FxHashMap;
use tracing::{debug, error, info, span, trace, warn, Level};

use crate::{endpoint, millis, NetResult, SUBSCRIBE_ADDR, SUBSCRIBE_TICK};

/// Called on the subscribe worker thread, must not block
pub type Handler = Box<dyn FnMut(&Message) -> anyhow::Result<()> + Send>;

/// Long lived subscription to every device manager publication
///
/// Handlers run on a dedicated worker thread in the order the device manager
/// published the events. Handlers that need to block should use [`SubscribeClient::queue`]
/// and consume events from their own thread instead.
pub struct SubscribeClient {
    addr: SocketAddr,
    handlers: FxHashMap<u16, Handler>,
    queue: Option<Sender<Message>>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<FxHashMap<u16, Handler>>>,
}

impl SubscribeClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            handlers: FxHashMap::default(),
            queue: None,
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Registers handlers keyed by publication id, replacing existing ones
    pub fn initialize(&mut self, handlers: HashMap<u16, Handler>) {
        self.handlers.extend(handlers);
    }

    pub fn add_handler(&mut self, id: u16, handler: Handler) {
        self.handlers.insert(id, handler);
    }

    /// Forwards every valid publication to a bounded queue
    ///
    /// Events are dropped with an error when the queue is full.
    pub fn queue(&mut self, capacity: usize) -> Receiver<Message> {
        let (tx, rx) = channel::bounded(capacity);
        self.queue = Some(tx);
        rx
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Connects the `SUB` socket and spawns the worker
    ///
    /// ZeroMQ connects in the background, so a device manager that is not running yet
    /// is not an error. Events start flowing once it comes up.
    #[tracing::instrument(skip(self), fields(addr = %self.addr))]
    pub fn start(&mut self) -> NetResult<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        trace!("SubscribeClient::start()");

        let context = zmq::Context::new();
        let socket = context.socket(zmq::SUB)?;
        socket.set_linger(0)?;
        socket.set_subscribe(b"")?;
        socket.connect(&endpoint(self.addr))?;

        self.stop.store(false, Ordering::Relaxed);

        let worker = Worker {
            socket,
            _context: context,
            handlers: std::mem::take(&mut self.handlers),
            queue: self.queue.clone(),
            stop: self.stop.clone(),
        };

        let handle = thread::Builder::new()
            .name("pt-subscribe".to_owned())
            .spawn(move || worker.run())?;
        self.worker = Some(handle);

        Ok(())
    }

    /// Stops the worker within one tick, closing the socket and its context
    ///
    /// Safe to call repeatedly.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        self.stop.store(true, Ordering::Relaxed);
        match worker.join() {
            // Hand the handlers back so the client can be restarted
            Ok(handlers) => self.handlers = handlers,
            Err(_) => error!("Subscribe worker panicked"),
        }

        info!("Stopped listening to the device manager");
    }
}

impl Default for SubscribeClient {
    fn default() -> Self {
        Self::new(SUBSCRIBE_ADDR)
    }
}

impl Drop for SubscribeClient {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    // Closed before the context is terminated
    socket: zmq::Socket,
    _context: zmq::Context,
    handlers: FxHashMap<u16, Handler>,
    queue: Option<Sender<Message>>,
    stop: Arc<AtomicBool>,
}

impl Worker {
    fn run(mut self) -> FxHashMap<u16, Handler> {
        let _span = span!(Level::INFO, "Subscribe worker thread").entered();

        while !self.stop.load(Ordering::Relaxed) {
            match self.socket.poll(zmq::POLLIN, millis(SUBSCRIBE_TICK).into()) {
                Ok(0) => {}
                Ok(_) => self.drain(),
                Err(zmq::Error::EINTR) => {}
                Err(err) => {
                    error!("Could not poll, sleeping 300ms: {err:?}");
                    // Slight cool down to avoid a possible error spam
                    thread::sleep(Duration::from_millis(300));
                }
            }
        }

        self.handlers
    }

    /// Dispatches every frame already queued on the socket
    fn drain(&mut self) {
        loop {
            match self.socket.recv_bytes(zmq::DONTWAIT) {
                Ok(frame) => match String::from_utf8(frame) {
                    Ok(frame) => self.dispatch(&frame),
                    Err(_) => warn!("Dropping non utf-8 publication"),
                },
                Err(zmq::Error::EAGAIN) => return,
                Err(zmq::Error::EINTR) => {}
                Err(err) => {
                    warn!("Could not receive publication: {err}");
                    return;
                }
            }
        }
    }

    fn dispatch(&mut self, frame: &str) {
        let message = match Message::from_line(frame) {
            Ok(message) => message,
            Err(err) => {
                warn!("Dropping malformed publication {frame:?}: {err}");
                return;
            }
        };

        if let Err(err) = message.validate_declared() {
            warn!("Dropping publication {message}: {err}");
            return;
        }

        debug!("Received {message}");

        if let Some(queue) = &self.queue {
            match queue.try_send(message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => error!("Subscription queue full, event dropped"),
                Err(TrySendError::Disconnected(_)) => self.queue = None,
            }
        }

        if let Some(handler) = self.handlers.get_mut(&message.id()) {
            let res = panic::catch_unwind(AssertUnwindSafe(|| handler(&message)));
            match res {
                Ok(res) => res.log_error("Subscription handler failed"),
                Err(_) => error!("Subscription handler for {message} panicked"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{net::TcpListener, time::Instant};

    use common::protocol::ids::*;

    use super::*;

    struct Publisher {
        socket: zmq::Socket,
        _context: zmq::Context,
    }

    impl Publisher {
        fn bind(endpoint: &str) -> (SocketAddr, Self) {
            let context = zmq::Context::new();
            let socket = context.socket(zmq::PUB).unwrap();
            socket.bind(endpoint).unwrap();

            let bound = socket.get_last_endpoint().unwrap().unwrap();
            let addr = bound.trim_start_matches("tcp://").parse().unwrap();

            (
                addr,
                Self {
                    socket,
                    _context: context,
                },
            )
        }

        fn send(&self, frame: &[u8]) {
            self.socket.send(frame, 0).unwrap();
        }

        /// Publishes lid closed events until `joined` sees one
        ///
        /// A `SUB` socket misses everything published before its subscription arrives.
        fn wait_joined(&self, joined: &Receiver<u16>) {
            for _ in 0..200 {
                self.send(b"310");
                if joined.recv_timeout(Duration::from_millis(20)).is_ok() {
                    thread::sleep(Duration::from_millis(50));
                    while joined.try_recv().is_ok() {}
                    return;
                }
            }

            panic!("Subscriber never joined");
        }
    }

    fn recorder(tx: Sender<u16>) -> Handler {
        Box::new(move |message| {
            tx.send(message.id())?;
            Ok(())
        })
    }

    fn subscriber(addr: SocketAddr) -> (SubscribeClient, Receiver<u16>) {
        let (tx, rx) = channel::unbounded();
        let mut client = SubscribeClient::new(addr);
        client.add_handler(PUB_LID_CLOSED, recorder(tx));

        (client, rx)
    }

    #[test]
    fn delivers_in_order() {
        let (addr, publisher) = Publisher::bind("tcp://127.0.0.1:*");
        let (tx, rx) = channel::unbounded();

        let (mut client, joined) = subscriber(addr);
        let mut handlers: HashMap<u16, Handler> = HashMap::new();
        handlers.insert(PUB_V3_BUTTON_UP_PRESSED, recorder(tx.clone()));
        handlers.insert(PUB_V3_BUTTON_UP_RELEASED, recorder(tx));
        client.initialize(handlers);
        client.start().unwrap();

        publisher.wait_joined(&joined);
        for frame in [b"313", b"314", b"313"] {
            publisher.send(frame);
        }

        let timeout = Duration::from_secs(2);
        assert_eq!(rx.recv_timeout(timeout), Ok(PUB_V3_BUTTON_UP_PRESSED));
        assert_eq!(rx.recv_timeout(timeout), Ok(PUB_V3_BUTTON_UP_RELEASED));
        assert_eq!(rx.recv_timeout(timeout), Ok(PUB_V3_BUTTON_UP_PRESSED));

        client.stop();
    }

    #[test]
    fn bad_frames_dropped() {
        let (addr, publisher) = Publisher::bind("tcp://127.0.0.1:*");
        let (tx, rx) = channel::unbounded();

        let (mut client, joined) = subscriber(addr);
        client.add_handler(PUB_V3_BUTTON_SELECT_PRESSED, recorder(tx.clone()));
        client.add_handler(PUB_BRIGHTNESS_CHANGED, recorder(tx));
        client.start().unwrap();

        publisher.wait_joined(&joined);
        // Wrong schema, garbage and invalid utf-8
        publisher.send(b"317|extra");
        publisher.send(b"not a message");
        publisher.send(&[0xff, 0xfe]);
        publisher.send(b"300|4");
        publisher.send(b"317");

        let timeout = Duration::from_secs(2);
        assert_eq!(rx.recv_timeout(timeout), Ok(PUB_BRIGHTNESS_CHANGED));
        assert_eq!(rx.recv_timeout(timeout), Ok(PUB_V3_BUTTON_SELECT_PRESSED));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn failing_handlers_dont_kill_worker() {
        let (addr, publisher) = Publisher::bind("tcp://127.0.0.1:*");
        let (tx, rx) = channel::unbounded();

        let (mut client, joined) = subscriber(addr);
        client.add_handler(
            PUB_V3_BUTTON_DOWN_PRESSED,
            Box::new(|_| anyhow::bail!("Handler error")),
        );
        client.add_handler(
            PUB_V3_BUTTON_DOWN_RELEASED,
            Box::new(|_| panic!("Handler panic")),
        );
        client.add_handler(PUB_V3_BUTTON_CANCEL_PRESSED, recorder(tx));
        client.start().unwrap();

        publisher.wait_joined(&joined);
        for frame in [b"315", b"316", b"319"] {
            publisher.send(frame);
        }

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)),
            Ok(PUB_V3_BUTTON_CANCEL_PRESSED)
        );
    }

    #[test]
    fn queue_receives_everything() {
        let (addr, publisher) = Publisher::bind("tcp://127.0.0.1:*");

        let (mut client, joined) = subscriber(addr);
        let queue = client.queue(256);
        client.start().unwrap();

        publisher.wait_joined(&joined);
        publisher.send(b"311");
        publisher.send(b"321");

        // Skip the lid closed events used to join
        let timeout = Duration::from_secs(2);
        let mut received = Vec::new();
        while received.len() < 2 {
            let message = queue.recv_timeout(timeout).unwrap();
            if message.id() != PUB_LID_CLOSED {
                received.push(message);
            }
        }
        assert_eq!(
            received,
            vec![Message::empty(PUB_LID_OPENED), Message::empty(PUB_KEYBOARD_DOCKED)]
        );
    }

    #[test]
    fn publisher_started_later() {
        // Nothing listens on a port that was bound and released
        let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();

        let (mut client, joined) = subscriber(addr);
        client.start().unwrap();
        assert!(client.is_running());

        thread::sleep(Duration::from_millis(100));
        let (_, publisher) = Publisher::bind(&endpoint(addr));
        publisher.wait_joined(&joined);

        client.stop();
    }

    #[test]
    fn stop_is_prompt_and_idempotent() {
        let (addr, _publisher) = Publisher::bind("tcp://127.0.0.1:*");

        let mut client = SubscribeClient::new(addr);
        client.start().unwrap();
        assert!(client.is_running());

        let started = Instant::now();
        client.stop();
        assert!(started.elapsed() < SUBSCRIBE_TICK * 3);
        assert!(!client.is_running());

        client.stop();
    }

    #[test]
    fn restart_keeps_handlers() {
        let (addr, publisher) = Publisher::bind("tcp://127.0.0.1:*");

        let (mut client, joined) = subscriber(addr);
        client.start().unwrap();
        publisher.wait_joined(&joined);
        client.stop();

        client.start().unwrap();
        publisher.wait_joined(&joined);
    }
}
