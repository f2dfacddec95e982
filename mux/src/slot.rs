//! per-agent connection slot: the socket bundle shared with handles and
//! the scheduling state owned by the registry table.

use icemux_traits::AgentHandler;
use mio::net::{TcpStream, UdpSocket};
use mio::Interest;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

/// one-shot callback fired on the engine thread when a pending TCP
/// connect becomes writable.
pub type TcpConnectedCallback = Box<dyn FnOnce(&mut dyn AgentHandler) + Send>;

/// lifecycle of a slot within the poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    /// registered but not yet part of a completed poll cycle.
    New,
    /// included in poll sets.
    Ready,
    /// terminal: excluded from every future poll set.
    Finished,
}

/// cached differentiated-services marking on the UDP send path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DiffServ {
    Cached(u32),
    /// the platform refused once; never retried.
    Disabled,
}

/// state guarded by the per-slot send lock.
pub(crate) struct SendState {
    pub(crate) ds: DiffServ,
}

/// socket bundle shared between the registry table and the agent's
/// handle. senders reach the sockets through this without touching the
/// registry mutex; the sockets close when the last reference drops.
pub(crate) struct SlotIo {
    pub(crate) udp: UdpSocket,

    /// created at most once, under the send lock; never reverts.
    pub(crate) tcp: OnceLock<TcpStream>,

    /// serializes senders and TCP socket creation on this slot.
    pub(crate) send: Mutex<SendState>,
}

impl SlotIo {
    pub(crate) fn new(udp: UdpSocket) -> Self {
        Self {
            udp,
            tcp: OnceLock::new(),
            send: Mutex::new(SendState {
                ds: DiffServ::Cached(0),
            }),
        }
    }
}

/// table-side slot; every field here is guarded by the registry mutex.
pub(crate) struct Slot {
    /// stale-handle protection for reused indices.
    pub(crate) gen: u64,
    pub(crate) state: SlotState,

    /// deadline for the next timer-driven protocol update.
    pub(crate) next_wake: Instant,

    pub(crate) io: Arc<SlotIo>,
    pub(crate) handler: Box<dyn AgentHandler>,

    /// peer address that frames received over TCP are attributed to.
    pub(crate) tcp_peer: Option<SocketAddr>,
    pub(crate) on_tcp_connected: Option<TcpConnectedCallback>,

    /// parsed-but-unsatisfied frame length carried across cycles.
    pub(crate) frame_pending: u16,

    /// poller bookkeeping: what is currently registered.
    pub(crate) udp_registered: bool,
    pub(crate) tcp_registered: Option<Interest>,

    /// a drain stopped at the fairness cap with data possibly left; the
    /// poller is edge-triggered, so the next cycle must not wait for a
    /// new readiness edge.
    pub(crate) udp_carry: bool,
    pub(crate) tcp_carry: bool,
}

impl Slot {
    pub(crate) fn new(gen: u64, io: Arc<SlotIo>, handler: Box<dyn AgentHandler>) -> Self {
        Self {
            gen,
            state: SlotState::New,
            // expired from the start: the first cycle runs the protocol
            // update to obtain the real deadline
            next_wake: Instant::now(),
            io,
            handler,
            tcp_peer: None,
            on_tcp_connected: None,
            frame_pending: 0,
            udp_registered: false,
            tcp_registered: None,
            udp_carry: false,
            tcp_carry: false,
        }
    }
}
