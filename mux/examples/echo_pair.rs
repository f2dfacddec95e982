//! two agents wired back to back through one engine.
use icemux::{
    AgentHandler, ConnRegistry, HandlerError, RegistryConfig, SocketConfig, TransportAddr,
};
use std::time::{Duration, Instant};

struct Printer {
    name: &'static str,
}

impl AgentHandler for Printer {
    fn on_receive(&mut self, data: &[u8], source: &TransportAddr) -> Result<(), HandlerError> {
        println!(
            "[{}] {} bytes from {}: {}",
            self.name,
            data.len(),
            source,
            String::from_utf8_lossy(data)
        );
        Ok(())
    }

    fn on_update(&mut self) -> Result<Instant, HandlerError> {
        Ok(Instant::now() + Duration::from_secs(1))
    }

    fn on_failure(&mut self) {
        println!("[{}] transport failed", self.name);
    }
}

fn main() {
    // init
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Debug)
        .init();

    let config = SocketConfig::new().with_bind_addr("127.0.0.1".parse().unwrap());
    let registry = ConnRegistry::init(RegistryConfig::default()).unwrap();

    let alice = registry
        .register(Box::new(Printer { name: "alice" }), &config)
        .unwrap();
    let bob = registry
        .register(Box::new(Printer { name: "bob" }), &config)
        .unwrap();

    let alice_addr = alice.local_addrs().unwrap()[0];
    let bob_addr = bob.local_addrs().unwrap()[0];
    println!("alice on {}, bob on {}", alice_addr, bob_addr);

    alice.send(&bob_addr, b"hello bob", None).unwrap();
    bob.send(&alice_addr, b"hello alice", None).unwrap();

    std::thread::sleep(Duration::from_millis(200));

    registry.deregister(alice).unwrap();
    registry.deregister(bob).unwrap();
    registry.shutdown();
}
