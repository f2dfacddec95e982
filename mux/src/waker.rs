//! wakeable waiter used to unblock a pending poll from other threads.
//!
//! unix builds signal through a non-blocking pipe; platforms without
//! pipes use a pair of datagram sockets bound to the loopback address.
//! the only guarantee is at least one wake after a completed write.

use log::warn;
use mio::{Registry, Token};
use std::io;

/// reserved poll token for the wake channel.
pub(crate) const WAKE_TOKEN: Token = Token(0);

pub(crate) use imp::{wake_channel, WakeHandle, WakeSource};

#[cfg(unix)]
mod imp {
    use super::*;
    use mio::unix::pipe::{self, Receiver, Sender};
    use mio::Interest;
    use std::io::{Read, Write};

    /// send half; shared by external threads.
    pub(crate) struct WakeHandle {
        tx: Sender,
    }

    /// receive half; owned by the poll loop.
    pub(crate) struct WakeSource {
        rx: Receiver,
    }

    pub(crate) fn wake_channel() -> io::Result<(WakeHandle, WakeSource)> {
        let (tx, rx) = pipe::new()?;
        Ok((WakeHandle { tx }, WakeSource { rx }))
    }

    impl WakeHandle {
        /// post one wake byte. a full pipe already guarantees a pending
        /// wake, so would-block is not an error.
        pub(crate) fn wake(&self) {
            match (&self.tx).write(&[0u8]) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => warn!("failed to interrupt poll thread: {}", e),
            }
        }
    }

    impl WakeSource {
        pub(crate) fn register(&mut self, registry: &Registry) -> io::Result<()> {
            registry.register(&mut self.rx, WAKE_TOKEN, Interest::READABLE)
        }

        /// discard every pending wake byte.
        pub(crate) fn drain(&mut self) {
            let mut buf = [0u8; 64];
            loop {
                match (&self.rx).read(&mut buf) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(_) => break,
                }
            }
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use super::*;
    use mio::Interest;
    use std::net::{SocketAddr, UdpSocket as StdUdpSocket};

    /// send half; a connected loopback datagram socket.
    pub(crate) struct WakeHandle {
        tx: StdUdpSocket,
    }

    /// receive half; owned by the poll loop.
    pub(crate) struct WakeSource {
        rx: mio::net::UdpSocket,
    }

    pub(crate) fn wake_channel() -> io::Result<(WakeHandle, WakeSource)> {
        let loopback: SocketAddr = "127.0.0.1:0".parse().expect("loopback address");
        let rx = StdUdpSocket::bind(loopback)?;
        rx.set_nonblocking(true)?;

        let tx = StdUdpSocket::bind(loopback)?;
        tx.set_nonblocking(true)?;
        tx.connect(rx.local_addr()?)?;

        Ok((
            WakeHandle { tx },
            WakeSource {
                rx: mio::net::UdpSocket::from_std(rx),
            },
        ))
    }

    impl WakeHandle {
        /// post one wake datagram; would-block means a wake is pending.
        pub(crate) fn wake(&self) {
            match self.tx.send(&[0u8]) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => warn!("failed to interrupt poll thread: {}", e),
            }
        }
    }

    impl WakeSource {
        pub(crate) fn register(&mut self, registry: &Registry) -> io::Result<()> {
            registry.register(&mut self.rx, WAKE_TOKEN, Interest::READABLE)
        }

        /// discard every pending wake datagram.
        pub(crate) fn drain(&mut self) {
            let mut buf = [0u8; 64];
            loop {
                match self.rx.recv_from(&mut buf) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(_) => break,
                }
            }
        }
    }
}
