//! the connection registry: the shared slot table, the engine thread
//! handle, and the operations external threads call.

use crate::config::{RegistryConfig, SocketConfig};
use crate::engine;
use crate::error::{MuxError, Result};
use crate::framing;
use crate::slot::{DiffServ, Slot, SlotIo, TcpConnectedCallback};
use crate::socket;
use crate::waker::{self, WakeHandle};
use icemux_traits::{AgentHandler, Transport, TransportAddr};
use log::{debug, info, trace, warn};
use mio::net::TcpStream;
use mio::{Poll, Registry as MioRegistry};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// identity of a registered agent: slot index plus a generation that
/// guards against reuse of the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AgentId {
    pub(crate) index: usize,
    pub(crate) gen: u64,
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent {}.{}", self.index, self.gen)
    }
}

/// slot table: indexed access with index reuse through a free list.
pub(crate) struct Table {
    pub(crate) slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    next_gen: u64,
    /// gates engine exit: the loop only stops on an empty table after
    /// the first agent has ever registered.
    pub(crate) seen_agents: bool,
}

impl Table {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            next_gen: 0,
            seen_agents: false,
        }
    }

    fn insert(&mut self, io: Arc<SlotIo>, handler: Box<dyn AgentHandler>) -> AgentId {
        let gen = self.next_gen;
        self.next_gen += 1;
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        self.slots[index] = Some(Slot::new(gen, io, handler));
        self.seen_agents = true;
        AgentId { index, gen }
    }

    pub(crate) fn get_mut(&mut self, id: AgentId) -> Option<&mut Slot> {
        self.slots
            .get_mut(id.index)
            .and_then(|entry| entry.as_mut())
            .filter(|slot| slot.gen == id.gen)
    }

    fn take(&mut self, id: AgentId) -> Option<Slot> {
        let entry = self.slots.get_mut(id.index)?;
        if entry.as_ref().is_some_and(|slot| slot.gen == id.gen) {
            let slot = entry.take();
            self.free.push(id.index);
            slot
        } else {
            None
        }
    }
}

/// state shared between the registry, agent handles and the engine.
pub(crate) struct Shared {
    pub(crate) table: Mutex<Table>,
    pub(crate) wake: WakeHandle,
    /// poller handle for cross-thread socket deregistration.
    pub(crate) mio: MioRegistry,
    pub(crate) config: RegistryConfig,
    /// set by shutdown so an engine that never saw an agent still exits.
    pub(crate) shutting_down: AtomicBool,
    pub(crate) stopped: AtomicBool,
}

/// the connection registry: owns the slot table and the poll engine
/// thread driving every registered agent's sockets.
pub struct ConnRegistry {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl ConnRegistry {
    /// create the interrupt primitive and start the engine thread.
    pub fn init(config: RegistryConfig) -> Result<ConnRegistry> {
        config.validate().map_err(MuxError::Resource)?;

        let poll = Poll::new()
            .map_err(|e| MuxError::Resource(format!("poller creation failed: {}", e)))?;
        let mio = poll
            .registry()
            .try_clone()
            .map_err(|e| MuxError::Resource(format!("poller handle clone failed: {}", e)))?;
        let (wake, mut wake_source) = waker::wake_channel()
            .map_err(|e| MuxError::Resource(format!("wake channel creation failed: {}", e)))?;
        wake_source
            .register(poll.registry())
            .map_err(|e| MuxError::Resource(format!("wake channel registration failed: {}", e)))?;

        let shared = Arc::new(Shared {
            table: Mutex::new(Table::new()),
            wake,
            mio,
            config,
            shutting_down: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        });

        debug!("starting connections thread");
        let engine_shared = shared.clone();
        let thread = thread::Builder::new()
            .name("icemux-poll".to_string())
            .spawn(move || engine::run(engine_shared, poll, wake_source))
            .map_err(|e| MuxError::Resource(format!("engine thread spawn failed: {}", e)))?;

        info!("connection registry started");
        Ok(ConnRegistry {
            shared,
            thread: Some(thread),
        })
    }

    /// join the engine thread and release the interrupt primitive.
    ///
    /// contract: every agent has been deregistered. the engine exits on
    /// its own once the table empties, so this blocks until then.
    pub fn shutdown(mut self) {
        debug!("waiting for connections thread");
        self.shared.shutting_down.store(true, Ordering::Release);
        self.shared.wake.wake();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        info!("connection registry stopped");
    }

    /// register a new agent; its slot starts `New` and joins the poll
    /// set on the engine's next cycle.
    pub fn register(
        &self,
        handler: Box<dyn AgentHandler>,
        socket_config: &SocketConfig,
    ) -> Result<Agent> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(MuxError::Stopped);
        }
        socket_config.validate().map_err(MuxError::Resource)?;

        let udp = socket::bind_udp(socket_config)?;
        let io = Arc::new(SlotIo::new(udp));

        let id = {
            let mut table = self.shared.table.lock().unwrap();
            table.insert(io.clone(), handler)
        };
        debug!("registered {}", id);
        self.shared.wake.wake();

        Ok(Agent {
            id,
            io,
            shared: self.shared.clone(),
        })
    }

    /// remove an agent from the table and the poll set.
    ///
    /// the slot leaves the table under the registry lock, so it cannot
    /// race the loop's dispatch; its sockets close once the last
    /// reference drops, letting an in-flight send finish safely.
    pub fn deregister(&self, agent: Agent) -> Result<()> {
        let Agent { id, io, .. } = agent;

        let mut slot = {
            let mut table = self.shared.table.lock().unwrap();
            table.take(id).ok_or(MuxError::UnknownAgent)?
        };
        engine::forget_slot(&self.shared.mio, &mut slot);
        drop(slot);
        drop(io);

        debug!("deregistered {}", id);
        self.shared.wake.wake();
        Ok(())
    }
}

/// handle to a registered agent's connection slot.
///
/// send operations take only the slot's send lock, never the registry
/// mutex, so they cannot contend with the poll loop's table phases.
pub struct Agent {
    id: AgentId,
    io: Arc<SlotIo>,
    shared: Arc<Shared>,
}

impl Agent {
    pub fn id(&self) -> AgentId {
        self.id
    }

    /// wake the poll loop and schedule an immediate protocol update for
    /// this agent.
    pub fn interrupt(&self) {
        {
            let mut table = self.shared.table.lock().unwrap();
            if let Some(slot) = table.get_mut(self.id) {
                slot.next_wake = Instant::now();
            }
        }
        trace!("interrupting connections thread");
        self.shared.wake.wake();
    }

    /// send one message to `dst` over the transport it declares.
    ///
    /// [`MuxError::BufferFull`] and [`MuxError::MessageTooLarge`] are
    /// expected, recoverable outcomes; everything else on the send path
    /// is unexpected.
    pub fn send(&self, dst: &TransportAddr, data: &[u8], ds: Option<u32>) -> Result<usize> {
        let mut send = self.io.send.lock().unwrap();
        trace!("sending datagram, size={}", data.len());

        let result = match dst.transport {
            Transport::Tcp => {
                if data.len() >= usize::from(u16::MAX) {
                    warn!("send failed, message is too large");
                    return Err(MuxError::MessageTooLarge { size: data.len() });
                }
                match self.io.tcp.get() {
                    Some(stream) => framing::write_frame(stream, data),
                    None => return Err(MuxError::NoTcpSocket),
                }
            }
            Transport::Udp => {
                if let Some(want) = ds {
                    if let DiffServ::Cached(current) = send.ds {
                        if current != want {
                            debug!("setting differentiated services field to 0x{:02X}", want);
                            match socket::set_diffserv(&self.io.udp, want) {
                                Ok(()) => send.ds = DiffServ::Cached(want),
                                Err(e) => {
                                    // refused once: disabled from now on
                                    debug!("diffserv marking unavailable: {}", e);
                                    send.ds = DiffServ::Disabled;
                                }
                            }
                        }
                    }
                }
                self.io.udp.send_to(data, dst.addr)
            }
        };
        drop(send);

        result.map_err(|e| classify_send_error(e, data.len()))
    }

    /// request a TCP transport towards `dst`; the one-shot callback
    /// fires on the engine thread once the socket is connected.
    ///
    /// idempotent: the request is ignored once a TCP socket exists.
    pub fn open_tcp(&self, dst: SocketAddr, on_connected: TcpConnectedCallback) -> Result<()> {
        let mut table = self.shared.table.lock().unwrap();
        let slot = table.get_mut(self.id).ok_or(MuxError::UnknownAgent)?;

        let send_guard = self.io.send.lock().unwrap();
        if self.io.tcp.get().is_some() {
            debug!("{} already has a TCP socket", self.id);
            return Ok(());
        }
        let stream = TcpStream::connect(dst).map_err(MuxError::Socket)?;
        let _ = self.io.tcp.set(stream);
        slot.tcp_peer = Some(dst);
        slot.on_tcp_connected = Some(on_connected);
        drop(send_guard);
        drop(table);

        self.shared.wake.wake();
        Ok(())
    }

    /// local addresses the agent's UDP socket is reachable on.
    pub fn local_addrs(&self) -> Result<Vec<TransportAddr>> {
        Ok(socket::local_addrs(&self.io.udp)?
            .into_iter()
            .map(TransportAddr::udp)
            .collect())
    }
}

/// map a send-path I/O failure onto the error taxonomy, logging at
/// decreasing severity for the expected outcomes.
fn classify_send_error(e: io::Error, size: usize) -> MuxError {
    if e.kind() == io::ErrorKind::WouldBlock {
        info!("send failed, buffer is full");
        return MuxError::BufferFull;
    }
    if is_message_too_large(&e) {
        warn!("send failed, message is too large");
        return MuxError::MessageTooLarge { size };
    }
    warn!("send failed: {}", e);
    MuxError::Send(e)
}

#[cfg(unix)]
fn is_message_too_large(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EMSGSIZE)
}

#[cfg(not(unix))]
fn is_message_too_large(_e: &io::Error) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::SlotState;
    use icemux_traits::HandlerError;
    use std::io::Write as _;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn local_config() -> SocketConfig {
        SocketConfig::new().with_bind_addr("127.0.0.1".parse().unwrap())
    }

    #[derive(Debug)]
    enum Event {
        Receive(Vec<u8>, TransportAddr),
        Failure,
        Connected,
    }

    /// records engine callbacks; receives between two updates count as
    /// one batch.
    struct TestHandler {
        events: mpsc::Sender<Event>,
        updates: Arc<AtomicUsize>,
        batches: Arc<Mutex<Vec<usize>>>,
        current_batch: usize,
        interval: Duration,
        fail_on: Option<Vec<u8>>,
    }

    impl TestHandler {
        fn new(events: mpsc::Sender<Event>) -> Self {
            Self {
                events,
                updates: Arc::new(AtomicUsize::new(0)),
                batches: Arc::new(Mutex::new(Vec::new())),
                current_batch: 0,
                interval: Duration::from_secs(3600),
                fail_on: None,
            }
        }
    }

    impl AgentHandler for TestHandler {
        fn on_receive(
            &mut self,
            data: &[u8],
            source: &TransportAddr,
        ) -> std::result::Result<(), HandlerError> {
            if self.fail_on.as_deref() == Some(data) {
                return Err(HandlerError::new("poisoned payload"));
            }
            self.current_batch += 1;
            let _ = self.events.send(Event::Receive(data.to_vec(), *source));
            Ok(())
        }

        fn on_update(&mut self) -> std::result::Result<Instant, HandlerError> {
            if self.current_batch > 0 {
                self.batches.lock().unwrap().push(self.current_batch);
                self.current_batch = 0;
            }
            self.updates.fetch_add(1, Ordering::SeqCst);
            Ok(Instant::now() + self.interval)
        }

        fn on_failure(&mut self) {
            let _ = self.events.send(Event::Failure);
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn slot_state(registry: &ConnRegistry, id: AgentId) -> Option<SlotState> {
        let mut table = registry.shared.table.lock().unwrap();
        table.get_mut(id).map(|slot| slot.state)
    }

    fn udp_addr_of(agent: &Agent) -> TransportAddr {
        agent.local_addrs().unwrap()[0]
    }

    #[test]
    fn test_slot_lifecycle() {
        init_logger();
        let registry = ConnRegistry::init(RegistryConfig::default()).unwrap();
        let (tx, _rx) = mpsc::channel();
        let handler = TestHandler::new(tx);
        let updates = handler.updates.clone();

        let agent = registry.register(Box::new(handler), &local_config()).unwrap();
        let id = agent.id();

        // the first cycle promotes the slot and runs the bootstrap update
        assert!(wait_until(
            || updates.load(Ordering::SeqCst) >= 1,
            Duration::from_secs(5)
        ));
        assert_eq!(slot_state(&registry, id), Some(SlotState::Ready));

        registry.deregister(agent).unwrap();
        assert_eq!(slot_state(&registry, id), None);
        registry.shutdown();
    }

    #[test]
    fn test_shutdown_without_agents() {
        init_logger();
        let registry = ConnRegistry::init(RegistryConfig::default()).unwrap();
        let start = Instant::now();
        registry.shutdown();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_engine_waits_for_first_registration() {
        init_logger();
        let registry = ConnRegistry::init(RegistryConfig::default()).unwrap();
        thread::sleep(Duration::from_millis(100));
        assert!(!registry.shared.stopped.load(Ordering::Acquire));

        let (tx, _rx) = mpsc::channel();
        let handler = TestHandler::new(tx);
        let updates = handler.updates.clone();
        let agent = registry.register(Box::new(handler), &local_config()).unwrap();
        assert!(wait_until(
            || updates.load(Ordering::SeqCst) >= 1,
            Duration::from_secs(5)
        ));
        registry.deregister(agent).unwrap();
        registry.shutdown();
    }

    #[test]
    fn test_datagram_exchange() {
        init_logger();
        let registry = ConnRegistry::init(RegistryConfig::default()).unwrap();

        let (tx_a, rx_a) = mpsc::channel();
        let (tx_b, rx_b) = mpsc::channel();
        let a = registry
            .register(Box::new(TestHandler::new(tx_a)), &local_config())
            .unwrap();
        let b = registry
            .register(Box::new(TestHandler::new(tx_b)), &local_config())
            .unwrap();

        let addr_a = udp_addr_of(&a);
        let addr_b = udp_addr_of(&b);

        assert_eq!(a.send(&addr_b, b"ping from a", None).unwrap(), 11);
        assert_eq!(b.send(&addr_a, b"pong from b", None).unwrap(), 11);

        match rx_b.recv_timeout(Duration::from_secs(5)).unwrap() {
            Event::Receive(data, source) => {
                assert_eq!(data, b"ping from a");
                assert_eq!(source, addr_a);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match rx_a.recv_timeout(Duration::from_secs(5)).unwrap() {
            Event::Receive(data, source) => {
                assert_eq!(data, b"pong from b");
                assert_eq!(source, addr_b);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        registry.deregister(a).unwrap();
        registry.deregister(b).unwrap();
        registry.shutdown();
    }

    #[test]
    fn test_interrupt_unblocks_wait() {
        init_logger();
        let registry = ConnRegistry::init(RegistryConfig::default()).unwrap();
        let (tx, _rx) = mpsc::channel();
        let handler = TestHandler::new(tx);
        let updates = handler.updates.clone();
        let agent = registry.register(Box::new(handler), &local_config()).unwrap();

        assert!(wait_until(
            || updates.load(Ordering::SeqCst) >= 1,
            Duration::from_secs(5)
        ));
        let before = updates.load(Ordering::SeqCst);

        // the loop is parked on a 60 s ceiling with a one hour protocol
        // deadline; the interrupt must bring the next update forward
        let start = Instant::now();
        agent.interrupt();
        assert!(wait_until(
            || updates.load(Ordering::SeqCst) > before,
            Duration::from_secs(5)
        ));
        assert!(start.elapsed() < Duration::from_secs(5));

        registry.deregister(agent).unwrap();
        registry.shutdown();
    }

    #[test]
    fn test_receive_failure_finishes_slot() {
        init_logger();
        let registry = ConnRegistry::init(RegistryConfig::default()).unwrap();
        let (tx_a, _rx_a) = mpsc::channel();
        let (tx_b, rx_b) = mpsc::channel();
        let mut poisoned = TestHandler::new(tx_b);
        poisoned.fail_on = Some(b"die".to_vec());

        let a = registry
            .register(Box::new(TestHandler::new(tx_a)), &local_config())
            .unwrap();
        let b = registry.register(Box::new(poisoned), &local_config()).unwrap();
        let addr_b = udp_addr_of(&b);
        let id_b = b.id();

        a.send(&addr_b, b"die", None).unwrap();
        assert!(wait_until(
            || slot_state(&registry, id_b) == Some(SlotState::Finished),
            Duration::from_secs(5)
        ));

        // a finished slot is inert: nothing further is delivered, and a
        // handler-reported failure gets no separate failure notification
        a.send(&addr_b, b"hello?", None).unwrap();
        assert!(rx_b.recv_timeout(Duration::from_millis(300)).is_err());

        registry.deregister(b).unwrap();
        registry.deregister(a).unwrap();
        registry.shutdown();
    }

    #[test]
    fn test_bounded_drain_fairness() {
        init_logger();
        let config = RegistryConfig::new().with_recv_burst(3);
        let registry = ConnRegistry::init(config).unwrap();
        let (tx, rx) = mpsc::channel();
        let handler = TestHandler::new(tx);
        let batches = handler.batches.clone();
        let agent = registry.register(Box::new(handler), &local_config()).unwrap();
        let addr = udp_addr_of(&agent);

        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        for i in 0..10u8 {
            sender.send_to(&[b'm', i], addr.addr).unwrap();
        }

        let mut received = 0;
        while received < 10 {
            match rx.recv_timeout(Duration::from_secs(5)) {
                Ok(Event::Receive(..)) => received += 1,
                Ok(other) => panic!("unexpected event: {:?}", other),
                Err(e) => panic!("missing datagrams after {}: {}", received, e),
            }
        }

        // every batch respects the cap; the capped drain carries over
        // instead of starving or losing the remainder
        assert!(wait_until(
            || batches.lock().unwrap().iter().sum::<usize>() == 10,
            Duration::from_secs(5)
        ));
        let batches = batches.lock().unwrap();
        assert!(batches.iter().all(|&n| n <= 3), "batches: {:?}", *batches);
        drop(batches);

        registry.deregister(agent).unwrap();
        registry.shutdown();
    }

    #[test]
    fn test_tcp_connect_framing_and_hangup() {
        init_logger();
        let registry = ConnRegistry::init(RegistryConfig::default()).unwrap();
        let (tx, rx) = mpsc::channel();
        let agent = registry
            .register(Box::new(TestHandler::new(tx.clone())), &local_config())
            .unwrap();

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let server_addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut peer, _) = listener.accept().unwrap();
            peer.set_nodelay(true).unwrap();

            // frame split across arrivals: prefix byte by byte, payload
            // in two pieces
            let payload = b"framed hello";
            let prefix = (payload.len() as u16).to_be_bytes();
            peer.write_all(&prefix[..1]).unwrap();
            thread::sleep(Duration::from_millis(20));
            peer.write_all(&prefix[1..]).unwrap();
            thread::sleep(Duration::from_millis(20));
            peer.write_all(&payload[..5]).unwrap();
            thread::sleep(Duration::from_millis(20));
            peer.write_all(&payload[5..]).unwrap();

            // read one framed reply back
            peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            let mut prefix = [0u8; 2];
            std::io::Read::read_exact(&mut peer, &mut prefix).unwrap();
            let mut reply = vec![0u8; usize::from(u16::from_be_bytes(prefix))];
            std::io::Read::read_exact(&mut peer, &mut reply).unwrap();
            reply
        });

        let connected_tx = tx.clone();
        agent
            .open_tcp(
                server_addr,
                Box::new(move |_handler| {
                    let _ = connected_tx.send(Event::Connected);
                }),
            )
            .unwrap();

        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            Event::Connected
        ));

        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            Event::Receive(data, source) => {
                assert_eq!(data, b"framed hello");
                assert_eq!(source, TransportAddr::tcp(server_addr));
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let dst = TransportAddr::tcp(server_addr);
        assert_eq!(agent.send(&dst, b"framed reply", None).unwrap(), 12);
        assert_eq!(server.join().unwrap(), b"framed reply");

        // a second open is ignored while a TCP socket exists
        agent
            .open_tcp(server_addr, Box::new(|_| panic!("second connect callback")))
            .unwrap();

        // the server returned and dropped its stream: hangup retires the slot
        let id = agent.id();
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            Event::Failure
        ));
        assert!(wait_until(
            || slot_state(&registry, id) == Some(SlotState::Finished),
            Duration::from_secs(5)
        ));

        registry.deregister(agent).unwrap();
        registry.shutdown();
    }

    #[test]
    fn test_deregister_with_send_lock_held() {
        init_logger();
        let registry = ConnRegistry::init(RegistryConfig::default()).unwrap();
        let (tx_keep, _rx_keep) = mpsc::channel();
        let keeper = registry
            .register(Box::new(TestHandler::new(tx_keep)), &local_config())
            .unwrap();

        let (tx, _rx) = mpsc::channel();
        let agent = registry.register(Box::new(TestHandler::new(tx)), &local_config()).unwrap();

        let io = agent.io.clone();
        let guard = io.send.lock().unwrap();

        // table removal does not need the send lock
        registry.deregister(agent).unwrap();

        // the sockets outlive the in-flight sender and still work
        let target = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        io.udp.send_to(b"late", target.local_addr().unwrap()).unwrap();
        drop(guard);
        drop(io);

        // the table is clean: a new registration reuses the index
        let (tx2, _rx2) = mpsc::channel();
        let replacement = registry
            .register(Box::new(TestHandler::new(tx2)), &local_config())
            .unwrap();
        registry.deregister(replacement).unwrap();
        registry.deregister(keeper).unwrap();
        registry.shutdown();
    }

    #[test]
    fn test_generation_guards_reused_index() {
        init_logger();
        let registry = ConnRegistry::init(RegistryConfig::default()).unwrap();
        let (tx_keep, _rx_keep) = mpsc::channel();
        let keeper = registry
            .register(Box::new(TestHandler::new(tx_keep)), &local_config())
            .unwrap();

        let (tx, _rx) = mpsc::channel();
        let agent = registry.register(Box::new(TestHandler::new(tx)), &local_config()).unwrap();
        let old_id = agent.id();
        registry.deregister(agent).unwrap();

        let (tx2, _rx2) = mpsc::channel();
        let replacement = registry
            .register(Box::new(TestHandler::new(tx2)), &local_config())
            .unwrap();
        assert_eq!(replacement.id().index, old_id.index);
        assert_ne!(replacement.id().gen, old_id.gen);
        assert_eq!(slot_state(&registry, old_id), None);

        registry.deregister(replacement).unwrap();
        registry.deregister(keeper).unwrap();
        registry.shutdown();
    }

    #[test]
    fn test_engine_exits_when_empty_and_rejects_late_registration() {
        init_logger();
        let registry = ConnRegistry::init(RegistryConfig::default()).unwrap();
        let (tx, _rx) = mpsc::channel();
        let agent = registry.register(Box::new(TestHandler::new(tx)), &local_config()).unwrap();
        registry.deregister(agent).unwrap();

        assert!(wait_until(
            || registry.shared.stopped.load(Ordering::Acquire),
            Duration::from_secs(5)
        ));

        let (tx2, _rx2) = mpsc::channel();
        let denied = registry.register(Box::new(TestHandler::new(tx2)), &local_config());
        assert!(matches!(denied, Err(MuxError::Stopped)));

        let start = Instant::now();
        registry.shutdown();
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
