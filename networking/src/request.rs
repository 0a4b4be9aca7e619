use std::{fmt::Debug, net::SocketAddr, time::Duration};

use common::protocol::{ids, Message};
use tracing::{debug, trace};

use crate::{endpoint, millis, NetError, NetResult, REQUEST_ADDR, REQUEST_TIMEOUT};

/// A single request/reply conversation with the device manager
///
/// [`RequestClient::connect`] creates a ZeroMQ context and a `REQ` socket, dropping the
/// client closes the socket and terminates the context, on every path. A client is not
/// meant to be shared between threads. After a timeout the `REQ` socket is stuck
/// waiting for its reply, so the client should be discarded.
pub struct RequestClient {
    // Dropped before the context, terminating a context waits for its sockets
    socket: zmq::Socket,
    _context: zmq::Context,
    endpoint: String,
}

impl RequestClient {
    #[tracing::instrument]
    pub fn connect(addr: SocketAddr, timeout: Duration) -> NetResult<Self> {
        trace!("RequestClient::connect()");

        let context = zmq::Context::new();
        let socket = context.socket(zmq::REQ)?;
        socket.set_sndtimeo(millis(timeout))?;
        socket.set_rcvtimeo(millis(timeout))?;
        socket.set_linger(0)?;

        let endpoint = endpoint(addr);
        socket.connect(&endpoint)?;

        Ok(Self {
            socket,
            _context: context,
            endpoint,
        })
    }

    /// Sends `request` and waits for its paired response
    pub fn send(&mut self, request: &Message) -> NetResult<Message> {
        let expected = check_request(request)?;
        let frame = request.to_line()?;

        debug!("Sending {request}");
        self.socket
            .send(frame.as_bytes(), 0)
            .map_err(|err| NetError::from_zmq(err, "send"))?;

        let frame = self
            .socket
            .recv_bytes(0)
            .map_err(|err| NetError::from_zmq(err, "receive"))?;
        let frame = String::from_utf8(frame).map_err(|_| NetError::NotUtf8)?;

        let response = Message::from_line(&frame)?;
        debug!("Received {response}");

        if ids::is_error_response(response.id()) {
            return Err(NetError::ServerError {
                request: request.clone(),
                response,
            });
        }

        if response.id() != expected {
            return Err(NetError::UnexpectedResponse {
                expected,
                got: response,
            });
        }

        response.validate_declared()?;

        Ok(response)
    }
}

impl Debug for RequestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestClient")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// Returns the response id a well formed request expects
fn check_request(request: &Message) -> NetResult<u16> {
    let expected = ids::response_to(request.id()).ok_or(NetError::NotARequest(request.id()))?;
    request.validate_declared()?;

    Ok(expected)
}

/// Anything that can answer device manager requests
pub trait Requester: Send + Sync + Debug {
    fn request(&self, message: Message) -> NetResult<Message>;

    /// Sends a parameterless request and parses the first response parameter
    fn query_int(&self, request_id: u16) -> NetResult<i64> {
        let response = self.request(Message::empty(request_id))?;
        Ok(response.int(0)?)
    }

    /// Sends a request whose reply carries no data
    fn command(&self, request_id: u16, parameter: Option<String>) -> NetResult<()> {
        let message = match parameter {
            Some(parameter) => Message::new(request_id, vec![parameter]),
            None => Message::empty(request_id),
        };
        self.request(message).map(|_| ())
    }
}

/// Opens a fresh [`RequestClient`] for every request
///
/// Each calling thread therefore gets its own socket.
#[derive(Debug, Clone)]
pub struct DeviceManager {
    addr: SocketAddr,
    timeout: Duration,
}

impl DeviceManager {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self { addr, timeout }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new(REQUEST_ADDR, REQUEST_TIMEOUT)
    }
}

impl Requester for DeviceManager {
    fn request(&self, message: Message) -> NetResult<Message> {
        check_request(&message)?;

        let mut client = RequestClient::connect(self.addr, self.timeout)
            .map_err(|err| err.chain("Connect to device manager".to_owned()))?;
        client.send(&message)
    }
}

#[cfg(test)]
mod tests {
    use std::thread::{self, JoinHandle};

    use common::protocol::ids::*;

    use super::*;

    /// Answers a single request with `reply` and hands back the request it saw
    fn fake_daemon(reply: Option<&'static str>) -> (SocketAddr, JoinHandle<String>) {
        let context = zmq::Context::new();
        let socket = context.socket(zmq::REP).unwrap();
        socket.bind("tcp://127.0.0.1:*").unwrap();
        let addr = bound_addr(&socket);

        let handle = thread::spawn(move || {
            let _context = context;
            let request = socket.recv_string(0).unwrap().unwrap();

            match reply {
                Some(reply) => socket.send(reply.as_bytes(), 0).unwrap(),
                // Hold the request past the client's timeout
                None => thread::sleep(Duration::from_millis(600)),
            }

            request
        });

        (addr, handle)
    }

    fn bound_addr(socket: &zmq::Socket) -> SocketAddr {
        let endpoint = socket.get_last_endpoint().unwrap().unwrap();
        endpoint.trim_start_matches("tcp://").parse().unwrap()
    }

    #[test]
    fn ping() {
        let (addr, daemon) = fake_daemon(Some("210"));
        let manager = DeviceManager::new(addr, REQUEST_TIMEOUT);

        let response = manager.request(Message::empty(REQ_PING)).unwrap();
        assert_eq!(response, Message::empty(RSP_PING));
        assert_eq!(daemon.join().unwrap(), "110");
    }

    #[test]
    fn query_parameter() {
        let (addr, daemon) = fake_daemon(Some("212|7"));
        let manager = DeviceManager::new(addr, REQUEST_TIMEOUT);

        assert_eq!(manager.query_int(REQ_GET_BRIGHTNESS).unwrap(), 7);
        assert_eq!(daemon.join().unwrap(), "112");
    }

    #[test]
    fn client_reused_for_several_requests() {
        let context = zmq::Context::new();
        let socket = context.socket(zmq::REP).unwrap();
        socket.bind("tcp://127.0.0.1:*").unwrap();
        let addr = bound_addr(&socket);

        let daemon = thread::spawn(move || {
            let _context = context;
            for reply in ["210", "212|3"] {
                socket.recv_bytes(0).unwrap();
                socket.send(reply.as_bytes(), 0).unwrap();
            }
        });

        let mut client = RequestClient::connect(addr, REQUEST_TIMEOUT).unwrap();
        assert_eq!(client.send(&Message::empty(REQ_PING)).unwrap().id(), RSP_PING);
        assert_eq!(
            client.send(&Message::empty(REQ_GET_BRIGHTNESS)).unwrap().int(0).unwrap(),
            3
        );
        daemon.join().unwrap();
    }

    #[test]
    fn mismatched_response() {
        let (addr, daemon) = fake_daemon(Some("218|1|75|120|5"));
        let manager = DeviceManager::new(addr, REQUEST_TIMEOUT);

        let err = manager.request(Message::empty(REQ_PING)).unwrap_err();
        assert!(matches!(
            err,
            NetError::UnexpectedResponse { expected: RSP_PING, .. }
        ));
        assert!(matches!(
            common::error::SdkError::from(err),
            common::error::SdkError::Protocol(_)
        ));
        daemon.join().unwrap();
    }

    #[test]
    fn server_error() {
        let (addr, daemon) = fake_daemon(Some("203"));
        let manager = DeviceManager::new(addr, REQUEST_TIMEOUT);

        let err = manager.request(Message::empty(REQ_GET_OLED_SPI_BUS)).unwrap_err();
        assert!(matches!(err, NetError::ServerError { .. }));
        daemon.join().unwrap();
    }

    #[test]
    fn bad_response_schema() {
        let (addr, daemon) = fake_daemon(Some("227|spi"));
        let manager = DeviceManager::new(addr, REQUEST_TIMEOUT);

        let err = manager.request(Message::empty(REQ_GET_OLED_SPI_BUS)).unwrap_err();
        assert!(matches!(err, NetError::Codec(_)));
        daemon.join().unwrap();
    }

    #[test]
    fn timeout() {
        let (addr, daemon) = fake_daemon(None);
        let manager = DeviceManager::new(addr, Duration::from_millis(200));

        let err = manager.request(Message::empty(REQ_PING)).unwrap_err();
        assert!(matches!(err.root(), NetError::Timeout(during) if *during == "receive"));
        daemon.join().unwrap();
    }

    #[test]
    fn bad_request_never_sent() {
        // Nothing listens here, the request has to be rejected before connecting
        let manager = DeviceManager::new("127.0.0.1:1".parse().unwrap(), REQUEST_TIMEOUT);

        let err = manager.request(Message::empty(PUB_LID_CLOSED)).unwrap_err();
        assert!(matches!(err, NetError::NotARequest(PUB_LID_CLOSED)));

        let err = manager.request(Message::with(REQ_SET_BRIGHTNESS, "max")).unwrap_err();
        assert!(matches!(err, NetError::Codec(_)));
    }

    #[test]
    fn unreachable_times_out() {
        let manager = DeviceManager::new("127.0.0.1:1".parse().unwrap(), Duration::from_millis(200));

        let err = manager.request(Message::empty(REQ_PING)).unwrap_err();
        assert!(matches!(err.root(), NetError::Timeout(_)));
    }
}
