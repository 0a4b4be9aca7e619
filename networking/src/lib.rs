//! Clients for the device manager's request/reply and publish/subscribe endpoints
//!
//! Both endpoints are ZeroMQ sockets carrying one [`common::protocol`] message per frame.

pub mod request;
pub mod subscribe;

use std::{
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    time::Duration,
};

use common::{error::SdkError, protocol::CodecError, protocol::Message};
use thiserror::Error;

pub use request::{DeviceManager, RequestClient, Requester};
pub use subscribe::{Handler, SubscribeClient};

pub const REQUEST_PORT: u16 = 3782;
pub const SUBSCRIBE_PORT: u16 = 3781;

pub const REQUEST_ADDR: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, REQUEST_PORT));
pub const SUBSCRIBE_ADDR: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, SUBSCRIBE_PORT));

/// Bound on each send and each receive of the request client
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(1);
/// How often the subscribe worker wakes up to check if it should stop
pub const SUBSCRIBE_TICK: Duration = Duration::from_millis(500);

pub type NetResult<T> = Result<T, NetError>;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("IO Error: {0}")]
    Io(#[from] io::Error),
    #[error("ZeroMQ Error: {0}")]
    Zmq(#[from] zmq::Error),
    #[error("Timed out waiting for the device manager during {0}")]
    Timeout(&'static str),
    #[error("Device manager sent a frame that is not utf-8")]
    NotUtf8,
    #[error("Could not parse message: {0}")]
    Codec(#[from] CodecError),
    #[error("Expected a response with id {expected} but got {got}")]
    UnexpectedResponse { expected: u16, got: Message },
    #[error("Device manager could not handle {request}: replied {response}")]
    ServerError { request: Message, response: Message },
    #[error("Request {0} has no paired response id")]
    NotARequest(u16),
    #[error("Error {0}: Caused by: ({1})")]
    Chain(String, #[source] Box<NetError>),
}

impl NetError {
    pub fn chain(self, message: String) -> Self {
        NetError::Chain(message, Box::new(self))
    }

    /// Strips any chained context
    pub fn root(&self) -> &NetError {
        match self {
            NetError::Chain(_, inner) => inner.root(),
            other => other,
        }
    }

    fn from_zmq(err: zmq::Error, during: &'static str) -> Self {
        match err {
            zmq::Error::EAGAIN => NetError::Timeout(during),
            err => NetError::Zmq(err),
        }
    }
}

/// ZeroMQ endpoint of a device manager socket
pub fn endpoint(addr: SocketAddr) -> String {
    format!("tcp://{addr}")
}

/// Socket options take milliseconds as an `i32`
fn millis(duration: Duration) -> i32 {
    i32::try_from(duration.as_millis()).unwrap_or(i32::MAX)
}

impl From<NetError> for SdkError {
    fn from(value: NetError) -> Self {
        let message = value.to_string();
        match value.root() {
            NetError::Timeout(_) => SdkError::Timeout(message),
            NetError::Codec(CodecError::Schema { .. }) => SdkError::Validation(message),
            NetError::Codec(_)
            | NetError::NotUtf8
            | NetError::UnexpectedResponse { .. }
            | NetError::ServerError { .. }
            | NetError::NotARequest(_) => SdkError::Protocol(message),
            NetError::Io(_) | NetError::Zmq(_) | NetError::Chain(..) => SdkError::Bus(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints() {
        assert_eq!(endpoint(REQUEST_ADDR), "tcp://127.0.0.1:3782");
        assert_eq!(endpoint(SUBSCRIBE_ADDR), "tcp://127.0.0.1:3781");
    }

    #[test]
    fn would_block_is_a_timeout() {
        let err = NetError::from_zmq(zmq::Error::EAGAIN, "receive");
        assert!(matches!(err, NetError::Timeout("receive")));
        assert!(matches!(SdkError::from(err), SdkError::Timeout(_)));

        let err = NetError::from_zmq(zmq::Error::ETERM, "send");
        assert!(matches!(SdkError::from(err), SdkError::Bus(_)));
    }

    #[test]
    fn timeouts_fit_socket_options() {
        assert_eq!(millis(REQUEST_TIMEOUT), 1000);
        assert_eq!(millis(SUBSCRIBE_TICK), 500);
        assert_eq!(millis(Duration::MAX), i32::MAX);
    }
}
