use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// bind configuration for an agent's UDP socket.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// local address to bind to.
    pub bind_addr: IpAddr,

    /// inclusive port range to walk when binding.
    /// (0, 0) lets the OS pick an ephemeral port.
    pub port_range: (u16, u16),
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port_range: (0, 0),
        }
    }
}

impl SocketConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// set the local bind address.
    pub fn with_bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// set the inclusive port range to walk when binding.
    pub fn with_port_range(mut self, begin: u16, end: u16) -> Self {
        self.port_range = (begin, end);
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        let (begin, end) = self.port_range;
        if begin == 0 && end != 0 {
            return Err("port range begin must be nonzero".to_string());
        }
        if begin > end {
            return Err(format!("invalid port range {}..={}", begin, end));
        }
        Ok(())
    }
}

/// configuration for the connection registry engine.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// ceiling on a single poll wait; an interrupt returns earlier.
    pub wait_ceiling: Duration,

    /// messages drained from one socket in one poll cycle.
    pub recv_burst: usize,

    /// capacity of the event buffer handed to the poller.
    pub event_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            wait_ceiling: Duration::from_secs(60),
            recv_burst: 1000,
            event_capacity: 1024,
        }
    }
}

impl RegistryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// set the ceiling on a single poll wait.
    pub fn with_wait_ceiling(mut self, ceiling: Duration) -> Self {
        self.wait_ceiling = ceiling;
        self
    }

    /// set how many messages one socket may yield per cycle.
    pub fn with_recv_burst(mut self, burst: usize) -> Self {
        self.recv_burst = burst;
        self
    }

    /// set the poller event buffer capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.wait_ceiling.is_zero() {
            return Err("wait ceiling must be greater than 0".to_string());
        }
        if self.recv_burst == 0 {
            return Err("receive burst must be greater than 0".to_string());
        }
        if self.event_capacity == 0 {
            return Err("event capacity must be greater than 0".to_string());
        }
        Ok(())
    }
}
