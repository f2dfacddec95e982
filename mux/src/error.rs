use thiserror::Error;

/// errors surfaced by registry and agent operations.
#[derive(Debug, Error)]
pub enum MuxError {
    /// engine startup could not allocate a primitive (poller, wake
    /// channel, thread) or the configuration was rejected.
    #[error("resource allocation failed: {0}")]
    Resource(String),

    /// socket creation or configuration failed; the slot was not created.
    #[error("socket error: {0}")]
    Socket(#[source] std::io::Error),

    /// the socket send buffer is full; the message may be retried.
    #[error("send buffer full")]
    BufferFull,

    /// the message exceeds what the transport can carry.
    #[error("message too large ({size} bytes)")]
    MessageTooLarge { size: usize },

    /// unexpected I/O failure on the send path.
    #[error("send failed: {0}")]
    Send(#[source] std::io::Error),

    /// a TCP destination was given but no TCP socket has been opened.
    #[error("no TCP socket open")]
    NoTcpSocket,

    /// the handle refers to a slot that is no longer registered.
    #[error("agent is not registered")]
    UnknownAgent,

    /// the engine thread has exited; the registry must be torn down.
    #[error("engine thread has exited")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, MuxError>;
