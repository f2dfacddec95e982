//! shared seam types for the icemux crates.
//!
//! the engine never interprets the bytes it moves; everything
//! protocol-specific happens behind [`AgentHandler`].
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;
use thiserror::Error;

/// transport protocol declared by a candidate address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Udp,
    Tcp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Udp => write!(f, "UDP"),
            Transport::Tcp => write!(f, "TCP"),
        }
    }
}

/// a peer address together with its declared transport.
///
/// the send path routes on the transport, not on the address: a TCP
/// destination goes out over the slot's (single) stream socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportAddr {
    pub addr: SocketAddr,
    pub transport: Transport,
}

impl TransportAddr {
    pub fn udp(addr: SocketAddr) -> Self {
        Self {
            addr,
            transport: Transport::Udp,
        }
    }

    pub fn tcp(addr: SocketAddr) -> Self {
        Self {
            addr,
            transport: Transport::Tcp,
        }
    }
}

impl fmt::Display for TransportAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.transport)
    }
}

/// failure reported by a protocol callback.
///
/// returning this from a callback retires the connection: the engine
/// marks the slot finished and stops polling its sockets.
#[derive(Debug, Clone, Error)]
#[error("agent callback failed: {0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// per-agent protocol collaborator driven by the poll engine.
///
/// all three callbacks run on the engine thread with the registry lock
/// held; they must not call back into the registry.
pub trait AgentHandler: Send {
    /// deliver one inbound message with its source address.
    fn on_receive(&mut self, data: &[u8], source: &TransportAddr) -> Result<(), HandlerError>;

    /// advance protocol timers; returns the next wake deadline.
    fn on_update(&mut self) -> Result<Instant, HandlerError>;

    /// the transport failed; fired at most once, nothing follows it.
    fn on_failure(&mut self);
}

/// forwarding impl so a boxed handler is itself a handler.
impl AgentHandler for Box<dyn AgentHandler> {
    fn on_receive(&mut self, data: &[u8], source: &TransportAddr) -> Result<(), HandlerError> {
        (**self).on_receive(data, source)
    }

    fn on_update(&mut self) -> Result<Instant, HandlerError> {
        (**self).on_update()
    }

    fn on_failure(&mut self) {
        (**self).on_failure()
    }
}
