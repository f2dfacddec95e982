//! the background poll loop: prepare, wait, process.
//!
//! one cycle builds the poll set from the slot table, blocks until a
//! socket is ready or the earliest wake deadline passes, then walks the
//! table in the same index order dispatching readiness and expired
//! timers back into the protocol handlers.

use crate::framing;
use crate::registry::Shared;
use crate::slot::{Slot, SlotState};
use crate::socket;
use crate::waker::{WakeSource, WAKE_TOKEN};
use icemux_traits::TransportAddr;
use log::{debug, error, trace, warn};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token};
use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

/// receive scratch buffer; a UDP datagram or TCP frame must fit in it.
const BUFFER_SIZE: usize = 4096;

// token layout: 0 is the wake channel, then two tokens per slot index.
fn udp_token(index: usize) -> Token {
    Token(1 + index * 2)
}

fn tcp_token(index: usize) -> Token {
    Token(2 + index * 2)
}

/// inverse mapping: slot index and whether the token names the TCP socket.
fn slot_of(token: Token) -> (usize, bool) {
    let value = token.0 - 1;
    (value / 2, value % 2 == 1)
}

/// per-slot readiness gathered from one wait.
#[derive(Debug, Default, Clone, Copy)]
struct Readiness {
    udp_read: bool,
    udp_err: bool,
    tcp_read: bool,
    tcp_write: bool,
    tcp_closed: bool,
}

/// entry point for the engine thread.
pub(crate) fn run(shared: Arc<Shared>, poll: Poll, wake: WakeSource) {
    debug!("connections thread started");
    let event_capacity = shared.config.event_capacity;
    let mut engine = Engine {
        shared,
        poll,
        events: Events::with_capacity(event_capacity),
        wake,
        readiness: Vec::new(),
        recv_buf: Box::new([0u8; BUFFER_SIZE]),
    };
    engine.run();
    engine.shared.stopped.store(true, Ordering::Release);
    debug!("leaving connections thread");
}

struct Engine {
    shared: Arc<Shared>,
    poll: Poll,
    events: Events,
    wake: WakeSource,
    /// per-slot readiness scratch, reused across cycles.
    readiness: Vec<Readiness>,
    recv_buf: Box<[u8; BUFFER_SIZE]>,
}

impl Engine {
    fn run(&mut self) {
        loop {
            let (count, deadline, seen) = self.prepare();
            // an empty table ends the loop once an agent has come and
            // gone, or once shutdown asked for it explicitly
            if count == 0 && (seen || self.shared.shutting_down.load(Ordering::Acquire)) {
                break;
            }

            let timeout = deadline.saturating_duration_since(Instant::now());
            trace!("entering poll on {} agent sockets for {:?}", count, timeout);
            match self.poll.poll(&mut self.events, Some(timeout)) {
                Ok(()) => {}
                Err(e)
                    if e.kind() == io::ErrorKind::Interrupted
                        || e.kind() == io::ErrorKind::WouldBlock =>
                {
                    trace!("poll interrupted");
                    continue;
                }
                Err(e) => {
                    error!("poll failed: {}", e);
                    break;
                }
            }

            self.process();
        }
    }

    /// build this cycle's poll set: promote new slots, sync socket
    /// registrations with the table, fold the earliest wake deadline.
    ///
    /// returns the number of agent sockets in the set, the wake
    /// deadline, and whether any agent was ever registered.
    fn prepare(&mut self) -> (usize, Instant, bool) {
        let now = Instant::now();
        let mut deadline = now + self.shared.config.wait_ceiling;
        let mut count = 0;

        let mut table = self.shared.table.lock().unwrap();
        let seen = table.seen_agents;
        for index in 0..table.slots.len() {
            let Some(slot) = table.slots[index].as_mut() else {
                continue;
            };

            match slot.state {
                SlotState::Finished => {
                    forget_slot(self.poll.registry(), slot);
                    continue;
                }
                SlotState::New => slot.state = SlotState::Ready,
                SlotState::Ready => {}
            }

            if !self.sync_registrations(index, slot) {
                forget_slot(self.poll.registry(), slot);
                continue;
            }

            if slot.udp_carry || slot.tcp_carry {
                // a capped drain left data behind; do not block waiting
                // for a readiness edge that will never come
                deadline = now;
            } else if deadline > slot.next_wake {
                deadline = slot.next_wake;
            }

            count += 1;
            if slot.io.tcp.get().is_some() {
                count += 1;
            }
        }
        (count, deadline, seen)
    }

    /// keep the poller in sync with the slot's sockets. returns false
    /// if registration failed and the slot was retired.
    fn sync_registrations(&self, index: usize, slot: &mut Slot) -> bool {
        let registry = self.poll.registry();

        if !slot.udp_registered {
            let fd = slot.io.udp.as_raw_fd();
            if let Err(e) =
                registry.register(&mut SourceFd(&fd), udp_token(index), Interest::READABLE)
            {
                warn!("UDP socket registration failed: {}", e);
                slot.handler.on_failure();
                slot.state = SlotState::Finished;
                return false;
            }
            slot.udp_registered = true;
        }

        if let Some(stream) = slot.io.tcp.get() {
            let mut want = Interest::READABLE;
            if slot.on_tcp_connected.is_some() {
                // write interest only while the connect callback is armed
                want |= Interest::WRITABLE;
            }
            if slot.tcp_registered != Some(want) {
                let fd = stream.as_raw_fd();
                let result = if slot.tcp_registered.is_some() {
                    registry.reregister(&mut SourceFd(&fd), tcp_token(index), want)
                } else {
                    registry.register(&mut SourceFd(&fd), tcp_token(index), want)
                };
                if let Err(e) = result {
                    warn!("TCP socket registration failed: {}", e);
                    slot.handler.on_failure();
                    slot.state = SlotState::Finished;
                    return false;
                }
                slot.tcp_registered = Some(want);
            }
        }
        true
    }

    /// dispatch readiness and expired timers back into the slots.
    fn process(&mut self) {
        for r in self.readiness.iter_mut() {
            *r = Readiness::default();
        }

        let mut saw_wake = false;
        for event in self.events.iter() {
            let token = event.token();
            if token == WAKE_TOKEN {
                saw_wake = true;
                continue;
            }
            let (index, is_tcp) = slot_of(token);
            if self.readiness.len() <= index {
                self.readiness.resize(index + 1, Readiness::default());
            }
            let r = &mut self.readiness[index];
            if is_tcp {
                r.tcp_read |= event.is_readable();
                r.tcp_write |= event.is_writable();
                r.tcp_closed |= event.is_error() || event.is_read_closed();
            } else {
                r.udp_read |= event.is_readable();
                r.udp_err |= event.is_error();
            }
        }

        if saw_wake {
            // its only purpose was to return from the wait
            self.wake.drain();
        }

        let now = Instant::now();
        let burst = self.shared.config.recv_burst;
        let mut table = self.shared.table.lock().unwrap();
        for index in 0..table.slots.len() {
            let Some(slot) = table.slots[index].as_mut() else {
                continue;
            };
            // readiness only applies to slots the prepare phase polled;
            // a slot registered mid-cycle waits for the next one
            if slot.state != SlotState::Ready {
                continue;
            }

            let mut r = self.readiness.get(index).copied().unwrap_or_default();
            r.udp_read |= slot.udp_carry;
            r.tcp_read |= slot.tcp_carry;
            slot.udp_carry = false;
            slot.tcp_carry = false;

            dispatch_udp(slot, r, now, burst, &mut self.recv_buf[..]);
            if slot.state == SlotState::Finished {
                forget_slot(self.poll.registry(), slot);
                continue;
            }

            if slot.io.tcp.get().is_some() {
                dispatch_tcp(slot, r, now, burst, &mut self.recv_buf[..]);
                if slot.state == SlotState::Finished {
                    forget_slot(self.poll.registry(), slot);
                }
            }
        }
    }
}

/// drop a slot's sockets from the poll set. idempotent.
pub(crate) fn forget_slot(registry: &Registry, slot: &mut Slot) {
    if slot.udp_registered {
        let fd = slot.io.udp.as_raw_fd();
        let _ = registry.deregister(&mut SourceFd(&fd));
        slot.udp_registered = false;
    }
    if slot.tcp_registered.take().is_some() {
        if let Some(stream) = slot.io.tcp.get() {
            let fd = stream.as_raw_fd();
            let _ = registry.deregister(&mut SourceFd(&fd));
        }
    }
}

/// drain a slot's UDP socket and run its timer update.
fn dispatch_udp(slot: &mut Slot, r: Readiness, now: Instant, burst: usize, buf: &mut [u8]) {
    if r.udp_err {
        warn!("error polling UDP socket");
        return;
    }

    if r.udp_read {
        let io = slot.io.clone();
        let mut result: io::Result<Option<(usize, SocketAddr)>> = Ok(None);
        // the cap bounds one socket's share of a cycle, not the cycle
        // itself; many saturated sockets can still make a long cycle
        let mut left = burst;
        while left > 0 {
            left -= 1;
            result = recv_udp(&io.udp, buf);
            match &result {
                Ok(Some((len, src))) => {
                    let source = TransportAddr::udp(*src);
                    if let Err(e) = slot.handler.on_receive(&buf[..*len], &source) {
                        warn!("agent receive failed: {}", e);
                        slot.state = SlotState::Finished;
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }
        slot.udp_carry = left == 0 && matches!(result, Ok(Some(_)));

        if slot.state == SlotState::Finished {
            return;
        }
        if let Err(e) = result {
            warn!("recvfrom failed: {}", e);
            slot.handler.on_failure();
            slot.state = SlotState::Finished;
            return;
        }
        update_timers(slot);
    } else if slot.next_wake <= now {
        update_timers(slot);
    }
}

/// receive one datagram, discarding and re-reading empty ones.
fn recv_udp(
    sock: &mio::net::UdpSocket,
    buf: &mut [u8],
) -> io::Result<Option<(usize, SocketAddr)>> {
    loop {
        match sock.recv_from(buf) {
            Ok((0, _)) => {
                trace!("ignoring empty datagram");
            }
            Ok((len, src)) => return Ok(Some((len, socket::normalize(src)))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!("no more datagrams to receive");
                return Ok(None);
            }
            Err(e) => return Err(e),
        }
    }
}

/// handle TCP connect, hangup and inbound frames, then the timer update.
fn dispatch_tcp(slot: &mut Slot, r: Readiness, now: Instant, burst: usize, buf: &mut [u8]) {
    if r.tcp_closed {
        debug!("TCP transport closed by peer");
        slot.handler.on_failure();
        slot.state = SlotState::Finished;
        return;
    }

    if r.tcp_write {
        if let Some(callback) = slot.on_tcp_connected.take() {
            trace!("TCP socket connected");
            callback(slot.handler.as_mut());
        }
    }

    if r.tcp_read {
        let io = slot.io.clone();
        let Some(stream) = io.tcp.get() else {
            return;
        };
        let Some(peer) = slot.tcp_peer else {
            return;
        };
        let source = TransportAddr::tcp(peer);

        let mut result: io::Result<Option<usize>> = Ok(None);
        let mut left = burst;
        while left > 0 {
            left -= 1;
            result = framing::read_frame(stream, buf, &mut slot.frame_pending);
            match &result {
                Ok(Some(len)) => {
                    if let Err(e) = slot.handler.on_receive(&buf[..*len], &source) {
                        warn!("agent receive failed: {}", e);
                        slot.state = SlotState::Finished;
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }
        slot.tcp_carry = left == 0 && matches!(result, Ok(Some(_)));

        if slot.state == SlotState::Finished {
            return;
        }
        if let Err(e) = result {
            debug!("frame read failed: {}", e);
            slot.handler.on_failure();
            slot.state = SlotState::Finished;
            return;
        }
        update_timers(slot);
    } else if slot.next_wake <= now {
        update_timers(slot);
    }
}

/// run the protocol timer update; failure retires the slot.
fn update_timers(slot: &mut Slot) {
    match slot.handler.on_update() {
        Ok(next) => slot.next_wake = next,
        Err(e) => {
            warn!("agent update failed: {}", e);
            slot.state = SlotState::Finished;
        }
    }
}
