//! connection multiplexing engine for ICE agents.
//!
//! a single background thread drives network I/O for any number of
//! concurrently active peer-connection agents, each owning one UDP
//! socket and at most one TCP socket, over one readiness-polling loop
//! instead of one thread per connection.
//!
//! # architecture
//!
//! the engine uses a two-role model:
//! - **poll engine thread**: runs prepare → wait → process cycles with
//!   mio (non-blocking I/O), dispatching received messages and timer
//!   updates into each agent's [`AgentHandler`]
//! - **external threads**: register and deregister agents, send
//!   messages, open TCP transports; a wake channel interrupts a pending
//!   wait whenever the poll set or a deadline changed
//!
//! the registry mutex guards slot membership and scheduling state and
//! is never held across the blocking wait; each slot carries its own
//! send lock so senders never contend with the loop.
//!
//! # example
//!
//! ```no_run
//! use icemux::{ConnRegistry, RegistryConfig, SocketConfig};
//!
//! let registry = ConnRegistry::init(RegistryConfig::default()).unwrap();
//! # let handler: Box<dyn icemux::AgentHandler> = unimplemented!();
//! let agent = registry.register(handler, &SocketConfig::default()).unwrap();
//! let addrs = agent.local_addrs().unwrap();
//! println!("reachable on {:?}", addrs);
//! ```

mod config;
mod engine;
mod error;
mod framing;
mod registry;
mod slot;
mod socket;
mod waker;

// public exports
pub use config::{RegistryConfig, SocketConfig};
pub use error::{MuxError, Result};
pub use registry::{Agent, AgentId, ConnRegistry};
pub use slot::TcpConnectedCallback;

// re-export the seam types for convenience
pub use icemux_traits::{AgentHandler, HandlerError, Transport, TransportAddr};
